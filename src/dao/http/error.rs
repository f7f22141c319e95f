//! Error types of the HTTP session source.

use reqwest::StatusCode;
use thiserror::Error;

use crate::error::SessionError;

/// Convenient result alias returning [`HttpSourceError`] failures.
pub type HttpSourceResult<T> = Result<T, HttpSourceError>;

/// Failures that can occur while talking to the device API.
#[derive(Debug, Error)]
pub enum HttpSourceError {
    /// Building the HTTP client failed (invalid TLS setup, etc).
    #[error("failed to build HTTP client")]
    ClientBuilder {
        #[source]
        source: reqwest::Error,
    },
    /// A request could not be sent or timed out.
    #[error("failed to send request to `{path}`")]
    RequestSend {
        path: String,
        #[source]
        source: reqwest::Error,
    },
    /// The API returned an unexpected status code.
    #[error("unexpected response status {status} for `{path}`")]
    RequestStatus { path: String, status: StatusCode },
    /// The response payload could not be decoded.
    #[error("failed to decode response for `{path}`")]
    DecodeResponse {
        path: String,
        #[source]
        source: reqwest::Error,
    },
}

impl From<HttpSourceError> for SessionError {
    fn from(err: HttpSourceError) -> Self {
        SessionError::unavailable(err.to_string(), err)
    }
}
