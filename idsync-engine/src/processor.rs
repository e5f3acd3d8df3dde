//! Sends queued identity hits and classifies the outcome.

use crate::queue::HitProcessing;
use crate::transport::{FORM_URLENCODED, HttpResponse, HttpTransport, NetworkRequest};
use async_trait::async_trait;
use idsync_storage::DataEntity;
use idsync_types::EventRef;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, warn};
use url::Url;

/// One durable sync request, stored as JSON in the hit queue.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueuedHit {
    pub url: Url,
    pub event_ref: EventRef,
}

impl QueuedHit {
    #[must_use]
    pub fn new(url: Url, event_ref: EventRef) -> Self {
        Self { url, event_ref }
    }

    /// Encodes the hit for storage.
    pub fn to_entity(&self) -> serde_json::Result<DataEntity> {
        Ok(DataEntity::new(serde_json::to_vec(self)?))
    }

    /// Decodes a stored hit.
    pub fn from_entity(entity: &DataEntity) -> serde_json::Result<Self> {
        serde_json::from_slice(&entity.data)
    }
}

/// Terminal outcome of a hit, delivered back to the engine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HitResponseNotification {
    pub event_ref: EventRef,
    pub hit: QueuedHit,
    /// Response body; `None` when the request produced none.
    pub body: Option<Vec<u8>>,
}

/// How a response should be handled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HitOutcome {
    /// Delivered; notify and remove.
    Success,
    /// Transient failure; keep the hit and retry later.
    Retry,
    /// Permanent failure; notify and remove.
    Drop,
}

/// Status codes worth retrying: request timeout, rate limiting, and any
/// server-side error.
#[must_use]
pub fn is_recoverable_status(status: u16) -> bool {
    matches!(status, 408 | 429 | 500..=599)
}

/// Classifies a transport response.
#[must_use]
pub fn classify(response: &HttpResponse) -> HitOutcome {
    match (response.status, &response.error) {
        (Some(200), None) => HitOutcome::Success,
        (Some(status), _) if is_recoverable_status(status) => HitOutcome::Retry,
        (_, Some(error)) if error.is_recoverable() => HitOutcome::Retry,
        _ => HitOutcome::Drop,
    }
}

/// [`HitProcessing`] for identity sync hits.
pub struct IdentityHitProcessor {
    transport: Arc<dyn HttpTransport>,
    responses: mpsc::UnboundedSender<HitResponseNotification>,
    retry_interval: Duration,
    timeout: Duration,
}

impl IdentityHitProcessor {
    /// Creates a processor that reports terminal outcomes on `responses`.
    pub fn new(
        transport: Arc<dyn HttpTransport>,
        responses: mpsc::UnboundedSender<HitResponseNotification>,
        retry_interval: Duration,
        timeout: Duration,
    ) -> Self {
        Self {
            transport,
            responses,
            retry_interval,
            timeout,
        }
    }

    fn notify(&self, hit: QueuedHit, body: Option<Vec<u8>>) {
        let notification = HitResponseNotification {
            event_ref: hit.event_ref,
            hit,
            body,
        };
        if self.responses.send(notification).is_err() {
            debug!("hit response receiver dropped");
        }
    }
}

#[async_trait]
impl HitProcessing for IdentityHitProcessor {
    fn retry_interval(&self, _entity: &DataEntity) -> Duration {
        self.retry_interval
    }

    async fn process(&self, entity: &DataEntity) -> bool {
        let hit = match QueuedHit::from_entity(entity) {
            Ok(hit) => hit,
            Err(e) => {
                warn!(id = %entity.unique_id, error = %e, "dropping malformed identity hit");
                return true;
            }
        };

        let request = NetworkRequest::get(hit.url.clone(), self.timeout)
            .with_header("Content-Type", FORM_URLENCODED);
        let response = self.transport.get(&request).await;

        match classify(&response) {
            HitOutcome::Success => {
                debug!(url = %hit.url, "identity hit sent");
                self.notify(hit, response.body);
                true
            }
            HitOutcome::Retry => {
                debug!(
                    url = %hit.url,
                    status = ?response.status,
                    error = ?response.error,
                    "identity hit failed with a recoverable error"
                );
                false
            }
            HitOutcome::Drop => {
                warn!(
                    host = hit.url.host_str().unwrap_or_default(),
                    path = hit.url.path(),
                    status = ?response.status,
                    error = ?response.error,
                    "dropping identity hit after unrecoverable error"
                );
                self.notify(hit, response.body);
                true
            }
        }
    }
}
