//! Host-side helpers and HTTP API for the idsync command-line client.

use axum::{
    Router,
    extract::{Query, State},
    http::StatusCode,
    response::Json,
    routing::get,
};
use idsync_engine::{EngineResult, IdentityHandle, PRIVACY_KEY};
use idsync_storage::{KeyValueStore, KeyValueStoreExt, StorageResult};
use idsync_types::{AuthenticationState, IdentitySnapshot, PrivacyStatus};
use serde::Deserialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::warn;

/// Key-value namespace for settings owned by the host rather than the engine.
pub const HOST_NAMESPACE: &str = "idsync.host";

/// How often [`wait_for_drain`] re-checks the queue.
const DRAIN_POLL: Duration = Duration::from_millis(100);

/// Parses `key=value`. The value may itself contain `=`.
pub fn parse_key_value(s: &str) -> Result<(String, String), String> {
    let (key, value) = s
        .split_once('=')
        .ok_or_else(|| format!("expected KEY=VALUE, got `{s}`"))?;
    if key.is_empty() {
        return Err(format!("empty key in `{s}`"));
    }
    Ok((key.to_string(), value.to_string()))
}

/// Parses an authentication state by name or wire code.
pub fn parse_auth_state(s: &str) -> Result<AuthenticationState, String> {
    match s.to_ascii_lowercase().as_str() {
        "unknown" | "0" => Ok(AuthenticationState::Unknown),
        "authenticated" | "1" => Ok(AuthenticationState::Authenticated),
        "logged_out" | "logged-out" | "loggedout" | "2" => Ok(AuthenticationState::LoggedOut),
        other => Err(format!("unknown authentication state: {other}")),
    }
}

/// Settings the host keeps between runs.
pub struct HostSettings {
    store: Arc<dyn KeyValueStore>,
}

impl HostSettings {
    pub fn new(store: Arc<dyn KeyValueStore>) -> Self {
        Self { store }
    }

    /// Last privacy status applied by the host, `Unknown` if never set.
    pub fn privacy(&self) -> StorageResult<PrivacyStatus> {
        Ok(self.store.load_json(PRIVACY_KEY)?.unwrap_or_default())
    }

    pub fn set_privacy(&self, status: PrivacyStatus) -> StorageResult<()> {
        self.store.save_json(PRIVACY_KEY, &status)
    }
}

/// Waits until the hit queue is empty or `limit` elapses. Returns the number
/// of hits still queued.
pub async fn wait_for_drain(handle: &IdentityHandle, limit: Duration) -> EngineResult<usize> {
    let deadline = Instant::now() + limit;
    loop {
        let queued = handle.queued_hits().await?;
        if queued == 0 || Instant::now() >= deadline {
            return Ok(queued);
        }
        tokio::time::sleep(DRAIN_POLL).await;
    }
}

#[derive(Debug, Default, Deserialize)]
struct VisitorQuery {
    aid: Option<String>,
    vid: Option<String>,
}

async fn identity_handler(
    State(handle): State<IdentityHandle>,
) -> Result<Json<IdentitySnapshot>, StatusCode> {
    handle.snapshot().await.map(Json).map_err(|e| {
        warn!(error = %e, "identity service unavailable");
        StatusCode::SERVICE_UNAVAILABLE
    })
}

async fn url_variables_handler(
    State(handle): State<IdentityHandle>,
    Query(query): Query<VisitorQuery>,
) -> Result<String, StatusCode> {
    handle
        .url_variables(query.aid, query.vid)
        .await
        .map_err(|e| {
            warn!(error = %e, "identity service unavailable");
            StatusCode::SERVICE_UNAVAILABLE
        })
}

/// Build the HTTP API router over a running identity service.
pub fn build_router(handle: IdentityHandle) -> Router {
    Router::new()
        .route("/api/v1/identity", get(identity_handler))
        .route("/api/v1/url-variables", get(url_variables_handler))
        .with_state(handle)
}
