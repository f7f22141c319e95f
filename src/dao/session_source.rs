use futures::future::BoxFuture;

use crate::{
    dto::session::{GameDocument, RulesetDocument, SessionSummary},
    error::{SessionError, SessionResult},
};

/// Read-only access to the device's game and ruleset endpoints.
pub trait SessionSource: Send + Sync {
    /// Fetch the current game, `None` when no game is in progress.
    fn fetch_current_session(&self) -> BoxFuture<'static, SessionResult<Option<GameDocument>>>;
    /// Fetch one ruleset by identifier, `None` when unknown.
    fn fetch_ruleset(&self, id: i64) -> BoxFuture<'static, SessionResult<Option<RulesetDocument>>>;
    /// Re-fetch the current game and replace the cached snapshot.
    fn refresh(&self) -> BoxFuture<'static, SessionResult<Option<GameDocument>>>;
    /// Last game snapshot obtained through [`refresh`](Self::refresh) or a fetch.
    fn cached_session(&self) -> Option<GameDocument>;
}

/// Resolve the summary of the current session: game first, then its ruleset.
pub async fn load_summary(source: &dyn SessionSource) -> SessionResult<SessionSummary> {
    let game = source
        .fetch_current_session()
        .await?
        .ok_or(SessionError::NoSession)?;
    let ruleset_id = game.ruleset_id.ok_or(SessionError::MissingRuleset)?;
    let ruleset = source
        .fetch_ruleset(ruleset_id)
        .await?
        .ok_or(SessionError::RulesetNotFound(ruleset_id))?;
    Ok(SessionSummary::from(&ruleset))
}
