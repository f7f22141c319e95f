//! reqwest-backed [`SessionSource`](crate::dao::session_source::SessionSource) talking to the device API.

mod config;
mod error;
mod source;

pub use config::HttpSourceConfig;
pub use error::{HttpSourceError, HttpSourceResult};
pub use source::HttpSessionSource;
