//! Transports able to carry the event channel: a streaming WebSocket and an HTTP
//! polling fallback.

use std::time::Duration;

use futures::{FutureExt, future::BoxFuture};
use serde::{Deserialize, Serialize};

use crate::error::TransportError;

/// Kind of transport, listed in order of preference in the channel options.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum TransportKind {
    /// Persistent WebSocket stream.
    Websocket,
    /// Periodic HTTP polling of `<endpoint>/poll`.
    Polling,
}

impl TransportKind {
    /// Short label used in logs and errors.
    pub fn label(self) -> &'static str {
        match self {
            TransportKind::Websocket => "websocket",
            TransportKind::Polling => "polling",
        }
    }
}

/// A live connection yielding text frames.
pub trait Transport: Send {
    /// Wait for the next frame; `Ok(None)` once the peer closed the connection.
    fn next_frame(&mut self) -> BoxFuture<'_, Result<Option<String>, TransportError>>;
}

/// Opens transports towards an endpoint.
pub trait Connector: Send + Sync {
    /// Establish a transport of the given kind.
    fn connect(
        &self,
        endpoint: &str,
        kind: TransportKind,
    ) -> BoxFuture<'static, Result<Box<dyn Transport>, TransportError>>;
}

/// Connector backed by the real network stack.
#[derive(Clone)]
pub struct NetworkConnector {
    #[cfg_attr(not(feature = "polling-transport"), allow(dead_code))]
    http: reqwest::Client,
    #[cfg_attr(not(feature = "polling-transport"), allow(dead_code))]
    poll_interval: Duration,
}

impl NetworkConnector {
    /// Create a connector; `poll_interval` paces the polling fallback.
    pub fn new(http: reqwest::Client, poll_interval: Duration) -> Self {
        Self {
            http,
            poll_interval,
        }
    }
}

impl Connector for NetworkConnector {
    fn connect(
        &self,
        endpoint: &str,
        kind: TransportKind,
    ) -> BoxFuture<'static, Result<Box<dyn Transport>, TransportError>> {
        let endpoint = endpoint.to_string();
        match kind {
            #[cfg(feature = "websocket-transport")]
            TransportKind::Websocket => async move {
                let transport = websocket::WebSocketTransport::connect(&endpoint).await?;
                Ok(Box::new(transport) as Box<dyn Transport>)
            }
            .boxed(),
            #[cfg(feature = "polling-transport")]
            TransportKind::Polling => {
                let http = self.http.clone();
                let interval = self.poll_interval;
                async move {
                    let transport =
                        polling::PollingTransport::connect(http, &endpoint, interval).await?;
                    Ok(Box::new(transport) as Box<dyn Transport>)
                }
                .boxed()
            }
            #[allow(unreachable_patterns)]
            _ => futures::future::ready(Err(TransportError::NoTransport)).boxed(),
        }
    }
}

#[cfg(feature = "websocket-transport")]
mod websocket {
    use futures::{StreamExt, future::BoxFuture};
    use tokio::net::TcpStream;
    use tokio_tungstenite::{
        MaybeTlsStream, WebSocketStream, connect_async, tungstenite::Message,
    };
    use tracing::debug;

    use super::Transport;
    use crate::error::TransportError;

    pub(super) struct WebSocketTransport {
        stream: WebSocketStream<MaybeTlsStream<TcpStream>>,
    }

    impl WebSocketTransport {
        pub(super) async fn connect(endpoint: &str) -> Result<Self, TransportError> {
            let (stream, _response) =
                connect_async(endpoint)
                    .await
                    .map_err(|err| TransportError::Connect {
                        endpoint: endpoint.to_string(),
                        message: err.to_string(),
                    })?;
            Ok(Self { stream })
        }
    }

    impl Transport for WebSocketTransport {
        fn next_frame(&mut self) -> BoxFuture<'_, Result<Option<String>, TransportError>> {
            Box::pin(async move {
                while let Some(message) = self.stream.next().await {
                    match message {
                        Ok(Message::Text(text)) => return Ok(Some(text.as_str().to_owned())),
                        Ok(Message::Binary(bytes)) => match String::from_utf8(bytes.to_vec()) {
                            Ok(text) => return Ok(Some(text)),
                            Err(_) => debug!("skipping non UTF-8 binary frame"),
                        },
                        Ok(Message::Close(_)) => return Ok(None),
                        // Pings are answered by tungstenite itself.
                        Ok(_) => {}
                        Err(err) => return Err(TransportError::Read(err.to_string())),
                    }
                }
                Ok(None)
            })
        }
    }
}

#[cfg(feature = "polling-transport")]
mod polling {
    use std::{collections::VecDeque, time::Duration};

    use futures::future::BoxFuture;
    use serde_json::Value;
    use tokio::time::sleep;

    use super::Transport;
    use crate::error::TransportError;

    pub(super) struct PollingTransport {
        http: reqwest::Client,
        url: String,
        interval: Duration,
        pending: VecDeque<String>,
    }

    impl PollingTransport {
        /// The first successful poll doubles as the handshake.
        pub(super) async fn connect(
            http: reqwest::Client,
            endpoint: &str,
            interval: Duration,
        ) -> Result<Self, TransportError> {
            let url = poll_url(endpoint)?;
            let mut transport = Self {
                http,
                url,
                interval,
                pending: VecDeque::new(),
            };
            transport
                .poll()
                .await
                .map_err(|err| TransportError::Connect {
                    endpoint: endpoint.to_string(),
                    message: err.to_string(),
                })?;
            Ok(transport)
        }

        async fn poll(&mut self) -> Result<(), TransportError> {
            let response = self
                .http
                .get(&self.url)
                .send()
                .await
                .and_then(|response| response.error_for_status())
                .map_err(|err| TransportError::Read(err.to_string()))?;
            let frames = response
                .json::<Vec<Value>>()
                .await
                .map_err(|err| TransportError::Read(err.to_string()))?;
            self.pending
                .extend(frames.iter().map(|frame| frame.to_string()));
            Ok(())
        }
    }

    impl Transport for PollingTransport {
        fn next_frame(&mut self) -> BoxFuture<'_, Result<Option<String>, TransportError>> {
            Box::pin(async move {
                loop {
                    if let Some(frame) = self.pending.pop_front() {
                        return Ok(Some(frame));
                    }
                    sleep(self.interval).await;
                    self.poll().await?;
                }
            })
        }
    }

    /// Map a `ws(s)://` or `http(s)://` endpoint onto its polling URL.
    pub(super) fn poll_url(endpoint: &str) -> Result<String, TransportError> {
        let base = endpoint.trim_end_matches('/');
        let http_base = if let Some(rest) = base.strip_prefix("wss://") {
            format!("https://{rest}")
        } else if let Some(rest) = base.strip_prefix("ws://") {
            format!("http://{rest}")
        } else if base.starts_with("http://") || base.starts_with("https://") {
            base.to_string()
        } else {
            return Err(TransportError::InvalidEndpoint {
                endpoint: endpoint.to_string(),
                transport: "polling",
            });
        };
        Ok(format!("{http_base}/poll"))
    }

}
