/// REST implementation of the session source.
pub mod http;
/// Session data collaborator interface.
pub mod session_source;
