use std::time::Duration;

/// Runtime configuration describing how to reach the device API.
#[derive(Debug, Clone)]
pub struct HttpSourceConfig {
    /// API root, e.g. `http://127.0.0.1:5000/api`.
    pub base_url: String,
    /// Per-request timeout.
    pub request_timeout: Duration,
}

impl HttpSourceConfig {
    /// Construct a configuration for the API rooted at `base_url`.
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
            request_timeout: Duration::from_secs(5),
        }
    }

    /// Override the per-request timeout.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }
}
