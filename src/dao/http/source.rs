use std::sync::{Arc, RwLock};

use futures::future::BoxFuture;
use reqwest::{Client, StatusCode};
use serde::de::DeserializeOwned;
use tracing::debug;

use crate::{
    dao::session_source::SessionSource,
    dto::session::{GameDocument, RulesetDocument},
    error::SessionResult,
};

use super::{
    config::HttpSourceConfig,
    error::{HttpSourceError, HttpSourceResult},
};

const GAME_PATH: &str = "game";
const RULESET_PATH: &str = "ruleset";

/// Session source reading the device's REST API and caching the last game seen.
#[derive(Clone)]
pub struct HttpSessionSource {
    client: Client,
    base_url: Arc<str>,
    cached: Arc<RwLock<Option<GameDocument>>>,
}

impl HttpSessionSource {
    /// Build a client for the API described by `config`.
    pub fn new(config: HttpSourceConfig) -> HttpSourceResult<Self> {
        let client = Client::builder()
            .timeout(config.request_timeout)
            .build()
            .map_err(|source| HttpSourceError::ClientBuilder { source })?;

        Ok(Self {
            client,
            base_url: Arc::<str>::from(config.base_url.trim_end_matches('/')),
            cached: Arc::new(RwLock::new(None)),
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}/{}", self.base_url, path)
    }

    async fn get_json<T>(&self, path: &str) -> HttpSourceResult<(StatusCode, Option<T>)>
    where
        T: DeserializeOwned,
    {
        let response = self
            .client
            .get(self.url(path))
            .send()
            .await
            .map_err(|source| HttpSourceError::RequestSend {
                path: path.to_string(),
                source,
            })?;

        let status = response.status();
        match status {
            status if status.is_success() => {
                let body = response.json::<T>().await.map_err(|source| {
                    HttpSourceError::DecodeResponse {
                        path: path.to_string(),
                        source,
                    }
                })?;
                Ok((status, Some(body)))
            }
            // The device answers 404 both for "no game" and, historically, alongside a
            // valid body; the caller decides what a 404 body means.
            StatusCode::NOT_FOUND => Ok((status, response.json::<T>().await.ok())),
            other => Err(HttpSourceError::RequestStatus {
                path: path.to_string(),
                status: other,
            }),
        }
    }

    async fn load_game(&self) -> HttpSourceResult<Option<GameDocument>> {
        let (status, body) = self.get_json::<GameDocument>(GAME_PATH).await?;
        let game = body.filter(|doc| !doc.is_placeholder());
        debug!(%status, found = game.is_some(), "fetched current game");
        Ok(game)
    }

    async fn load_ruleset(&self, id: i64) -> HttpSourceResult<Option<RulesetDocument>> {
        let (_, rulesets) = self.get_json::<Vec<RulesetDocument>>(RULESET_PATH).await?;
        Ok(rulesets
            .unwrap_or_default()
            .into_iter()
            .find(|ruleset| ruleset.id == id))
    }

    fn store_cache(&self, game: Option<GameDocument>) {
        let mut guard = self
            .cached
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        *guard = game;
    }
}

impl SessionSource for HttpSessionSource {
    fn fetch_current_session(&self) -> BoxFuture<'static, SessionResult<Option<GameDocument>>> {
        let source = self.clone();
        Box::pin(async move {
            let game = source.load_game().await?;
            source.store_cache(game.clone());
            Ok(game)
        })
    }

    fn fetch_ruleset(&self, id: i64) -> BoxFuture<'static, SessionResult<Option<RulesetDocument>>> {
        let source = self.clone();
        Box::pin(async move { source.load_ruleset(id).await.map_err(Into::into) })
    }

    fn refresh(&self) -> BoxFuture<'static, SessionResult<Option<GameDocument>>> {
        self.fetch_current_session()
    }

    fn cached_session(&self) -> Option<GameDocument> {
        self.cached
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }
}
