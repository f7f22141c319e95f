//! State owned by a single component each: clock offset, connectivity, countdown.

/// Wall clock and server offset estimation.
pub mod clock;
/// Connectivity of the event channel.
pub mod connection;
/// Countdown reconciliation state machine.
pub mod timer;
