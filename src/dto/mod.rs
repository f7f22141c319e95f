/// Push channel envelopes and payloads.
pub mod channel;
/// Game and ruleset documents of the REST API.
pub mod session;
