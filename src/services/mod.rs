/// Event channel lifecycle, reconnection and subscriber dispatch.
pub mod channel;
/// Cooperative loop routing channel events to the components.
pub mod engine;
/// Session lifecycle handling and session data lookups.
pub mod session_coordinator;
/// WebSocket and HTTP polling transports.
pub mod transport;
