//! Identity engine: stateful sync logic, serialized by the caller.
//!
//! The engine owns the identity record and decides when it must be synced.
//! It never performs network I/O on its own path: sync hits go through the
//! hit queue and responses come back as [`HitResponseNotification`]s. The
//! only exception is the best-effort opt-out ping, which is spawned and
//! forgotten.
//!
//! Every public method runs to completion before the next is called; the
//! service actor guarantees that.

use crate::codec::{self, VisitorInfo};
use crate::config::{EngineConfig, RemoteConfig};
use crate::events::{ANALYTICS_ID_TYPE, EngineEvent, SyncRequest};
use crate::processor::{HitResponseNotification, QueuedHit};
use crate::push::PushIdManager;
use crate::queue::HitQueue;
use crate::transport::{HttpTransport, NetworkRequest};
use idsync_storage::{KeyValueStore, KeyValueStoreExt};
use idsync_types::{
    CustomIdentity, EventRef, IdentityRecord, IdentitySnapshot, PrivacyStatus, Timestamp,
    ZERO_ADVERTISING_ID,
};
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

/// Key of the persisted identity record.
pub const RECORD_KEY: &str = "identity.properties";

/// The identity state machine.
pub struct IdentityEngine {
    config: EngineConfig,
    record: IdentityRecord,
    /// Last remote configuration that carried an org id.
    last_valid_config: Option<RemoteConfig>,
    store: Arc<dyn KeyValueStore>,
    queue: HitQueue,
    transport: Arc<dyn HttpTransport>,
    push: PushIdManager,
    events: mpsc::UnboundedSender<EngineEvent>,
    has_booted: bool,
    has_synced: bool,
    published_initial: bool,
}

impl IdentityEngine {
    /// Creates an engine with an empty record. Call [`boot`](Self::boot)
    /// before anything else.
    pub fn new(
        config: EngineConfig,
        store: Arc<dyn KeyValueStore>,
        queue: HitQueue,
        transport: Arc<dyn HttpTransport>,
        events: mpsc::UnboundedSender<EngineEvent>,
    ) -> Self {
        let mut record = IdentityRecord::new();
        record.ttl_seconds = config.default_ttl_secs;
        Self {
            config,
            record,
            last_valid_config: None,
            push: PushIdManager::new(Arc::clone(&store)),
            store,
            queue,
            transport,
            events,
            has_booted: false,
            has_synced: false,
            published_initial: false,
        }
    }

    // ── Lifecycle ────────────────────────────────────────────────

    /// Loads the persisted record. Publishes it right away if it already
    /// holds a primary id. Idempotent.
    pub fn boot(&mut self) {
        if self.has_booted {
            return;
        }
        match self.store.load_json::<IdentityRecord>(RECORD_KEY) {
            Ok(Some(record)) => self.record = record,
            Ok(None) => {}
            Err(e) => warn!(error = %e, "discarding unreadable identity record"),
        }
        debug!(
            identities = self.record.custom_identities.len(),
            has_primary_id = self.record.primary_id.is_some(),
            "identity record loaded"
        );

        if self.record.primary_id.is_some() {
            self.publish();
            self.published_initial = true;
        }
        self.has_booted = true;
    }

    /// Runs the first forced sync once a valid configuration is known.
    ///
    /// Returns true once the engine has synced (or privacy is opted out, in
    /// which case there is nothing to sync). Later calls are no-ops.
    pub fn bootstrap(&mut self, config: &RemoteConfig) -> bool {
        if self.has_synced {
            return true;
        }
        if !self.ready_for_sync(Some(config)) {
            return false;
        }

        let privacy = self.cached_privacy();
        self.record.privacy_status = privacy;
        self.apply_queue_policy(privacy);

        let synced = self.on_sync_request(&SyncRequest::new().forced(), None).is_some();
        self.has_synced = synced || privacy.is_opted_out();

        if self.has_synced && !self.published_initial {
            self.publish();
            self.published_initial = true;
        }
        if self.has_synced {
            info!(privacy = %privacy, "identity bootstrap complete");
        }
        self.has_synced
    }

    #[must_use]
    pub fn has_synced(&self) -> bool {
        self.has_synced
    }

    /// Caches `config` if it is valid. Returns whether any valid
    /// configuration is available.
    pub fn ready_for_sync(&mut self, config: Option<&RemoteConfig>) -> bool {
        if let Some(config) = config.filter(|c| c.is_valid()) {
            self.last_valid_config = Some(config.clone());
        } else if self.last_valid_config.is_none() {
            debug!("waiting for a valid configuration before syncing identities");
            return false;
        }
        true
    }

    /// Replaces the cached configuration.
    pub fn update_last_valid_config(&mut self, config: RemoteConfig) {
        self.last_valid_config = Some(config);
    }

    #[must_use]
    pub fn last_valid_config(&self) -> Option<&RemoteConfig> {
        self.last_valid_config.as_ref()
    }

    // ── Sync ─────────────────────────────────────────────────────

    /// Records the identities in `request` and queues a sync hit if needed.
    ///
    /// Returns `None` without touching the record when no valid
    /// configuration is known or privacy is opted out.
    pub fn on_sync_request(
        &mut self,
        request: &SyncRequest,
        config: Option<&RemoteConfig>,
    ) -> Option<IdentitySnapshot> {
        if !self.ready_for_sync(config) {
            return None;
        }
        if self.cached_privacy().is_opted_out() {
            debug!("ignoring sync request while opted out");
            return None;
        }

        if let Some(token) = request.push_token() {
            self.update_push_token(token);
        }

        let mut candidates = request.custom_identities();
        let (ad_id_changed, add_consent_flag) = self.ad_id_change(request.ad_id.as_ref());
        if ad_id_changed {
            if let Some(ad_id) = &request.ad_id {
                self.record.advertising_id = ad_id.identifier.clone();
                candidates.push(ad_id.clone());
            }
        }

        self.record.merge_and_clean(&candidates);
        candidates.retain(CustomIdentity::has_identifier);

        let config_valid = self
            .last_valid_config
            .as_ref()
            .is_some_and(RemoteConfig::can_sync);
        if self.should_sync(
            !candidates.is_empty(),
            !request.external_ids.is_empty(),
            request.force_sync || add_consent_flag,
            config_valid,
        ) {
            self.queue_sync_hit(&request.external_ids, add_consent_flag, request.event_ref);
        } else {
            debug!("no new identities to sync since the last request");
        }

        self.persist();
        Some(self.record.snapshot())
    }

    /// Whether a sync hit is needed. Generates the primary id if the record
    /// has none, whether or not a hit follows.
    pub fn should_sync(
        &mut self,
        has_new_identifiers: bool,
        has_external_ids: bool,
        force_sync: bool,
        config_valid: bool,
    ) -> bool {
        let needs_resync = force_sync || self.record.is_stale(Timestamp::now());
        if self.record.primary_id.is_some()
            && !has_new_identifiers
            && !has_external_ids
            && !needs_resync
        {
            return false;
        }
        self.ensure_primary_id();

        if !config_valid {
            debug!("waiting for a valid configuration to sync identities");
        }
        config_valid
    }

    /// Applies a finished hit to the record and emits the result.
    pub fn on_hit_response(&mut self, notification: &HitResponseNotification) {
        self.record.last_sync_time = Some(Timestamp::now());

        // privacy may have flipped while the hit was in flight
        if !self.record.privacy_status.is_opted_out() {
            self.apply_response(notification.body.as_deref());
            self.persist();
        }

        let snapshot = self.record.snapshot();
        self.emit(EngineEvent::IdentityUpdated(snapshot.clone()));
        self.emit(EngineEvent::Response {
            event_ref: notification.event_ref,
            snapshot,
        });
    }

    fn apply_response(&mut self, body: Option<&[u8]>) {
        let Some(body) = body else {
            debug!("identity hit finished without a response body");
            return;
        };
        let response = match codec::parse_sync_response(body) {
            Ok(response) => response,
            Err(e) => {
                debug!(error = %e, "ignoring identity response");
                return;
            }
        };

        if !response.opt_out_namespaces.is_empty() {
            info!(namespaces = ?response.opt_out_namespaces, "identity service reported opt-out");
            self.emit(EngineEvent::ConfigurationUpdate {
                privacy: PrivacyStatus::OptedOut,
            });
        }

        if let Some(message) = &response.error_message {
            error!(%message, "identity service returned an error");
            self.ensure_primary_id();
            return;
        }

        let local = self.record.primary_id.as_ref().map(|id| id.as_str());
        match response.primary_id.as_deref() {
            Some(remote) if !remote.is_empty() && Some(remote) == local => {
                self.record.blob = response.blob;
                self.record.location_hint = response.location_hint;
                self.record.ttl_seconds =
                    response.ttl_seconds.unwrap_or(self.config.default_ttl_secs);
            }
            remote => debug!(?remote, ?local, "response primary id does not match the local one"),
        }
    }

    // ── Privacy ──────────────────────────────────────────────────

    /// Reacts to a new privacy status.
    ///
    /// Opting out wipes every identifier. Leaving opt-out with no primary id
    /// runs a forced sync so a fresh id is established.
    pub fn on_privacy_change(&mut self, new_status: PrivacyStatus, config: Option<&RemoteConfig>) {
        let previous = self.record.privacy_status;
        if new_status == previous {
            return;
        }
        info!(from = %previous, to = %new_status, "privacy status changed");

        self.record.privacy_status = new_status;
        if let Some(config) = config.filter(|c| c.is_valid()) {
            self.last_valid_config = Some(config.clone());
        }
        if let Some(cached) = self.last_valid_config.as_mut() {
            cached.privacy = Some(new_status);
        }

        if new_status.is_opted_out() {
            self.clear_identifiers();
            self.persist();
            self.publish();
        } else if previous.is_opted_out() && self.record.primary_id.is_none() {
            let request = SyncRequest::new().forced();
            if self.on_sync_request(&request, None).is_some() {
                self.publish();
            } else {
                self.persist();
            }
        } else {
            self.persist();
        }

        self.apply_queue_policy(new_status);
    }

    /// Sends the one-shot opt-out ping when `config` is opted out and no
    /// other component handles consent. Returns whether a ping was sent.
    pub fn on_opt_out_check(&self, config: Option<&RemoteConfig>, handled_elsewhere: bool) -> bool {
        let cached = self.last_valid_config.as_ref();
        let privacy = config
            .and_then(|c| c.privacy)
            .or_else(|| cached.and_then(|c| c.privacy))
            .unwrap_or_default();
        if !privacy.is_opted_out() || handled_elsewhere {
            return false;
        }
        let Some(config) = config.filter(|c| c.is_valid()).or(cached) else {
            return false;
        };
        let Some(primary_id) = &self.record.primary_id else {
            return false;
        };

        let server = config.effective_server(&self.config.default_server);
        let url = match codec::build_opt_out_url(server, config.org_id(), primary_id) {
            Ok(url) => url,
            Err(e) => {
                warn!(error = %e, "failed to build opt-out url");
                return false;
            }
        };
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            warn!("no runtime available for the opt-out request");
            return false;
        };

        let transport = Arc::clone(&self.transport);
        let request = NetworkRequest::get(url, self.config.timeout());
        runtime.spawn(async move {
            let response = transport.get(&request).await;
            debug!(status = ?response.status, error = ?response.error, "opt-out request finished");
        });
        true
    }

    // ── Other requests ───────────────────────────────────────────

    /// Wipes all identities, drops queued hits and syncs a fresh primary id.
    pub fn reset_identities(&mut self, event_ref: EventRef) -> Option<IdentitySnapshot> {
        if self.record.privacy_status.is_opted_out() {
            return None;
        }
        self.clear_identifiers();
        if let Err(e) = self.queue.clear() {
            warn!(error = %e, "failed to clear hit queue");
        }

        let request = SyncRequest::new().with_event_ref(event_ref);
        let snapshot = self.on_sync_request(&request, None);
        match &snapshot {
            Some(snapshot) => self.emit(EngineEvent::IdentityUpdated(snapshot.clone())),
            None => self.persist(),
        }
        snapshot
    }

    /// Syncs the analytics id the first time one is seen.
    pub fn on_analytics_id(&mut self, analytics_id: &str) {
        if analytics_id.is_empty() {
            debug!("analytics id is empty");
            return;
        }
        if self.record.is_aid_synced {
            return;
        }
        self.record.is_aid_synced = true;
        self.persist();

        let request = SyncRequest::new().with_identifier(ANALYTICS_ID_TYPE, analytics_id);
        self.emit(EngineEvent::SyncRequested(request));
    }

    /// Visitor payload for decorating outbound URLs.
    #[must_use]
    pub fn url_variables(&self, analytics_id: Option<&str>, visitor_id: Option<&str>) -> String {
        let info = VisitorInfo {
            primary_id: self.record.primary_id.as_ref(),
            org_id: self.last_valid_config.as_ref().and_then(|c| c.org_id.as_deref()),
            analytics_id,
            visitor_id,
        };
        codec::visitor_id_payload(&info, Timestamp::now())
    }

    /// `base_url` with the visitor payload inserted.
    #[must_use]
    pub fn append_visitor_info(
        &self,
        base_url: &str,
        analytics_id: Option<&str>,
        visitor_id: Option<&str>,
    ) -> String {
        codec::append_visitor_info(base_url, &self.url_variables(analytics_id, visitor_id))
    }

    #[must_use]
    pub fn snapshot(&self) -> IdentitySnapshot {
        self.record.snapshot()
    }

    #[must_use]
    pub fn record(&self) -> &IdentityRecord {
        &self.record
    }

    #[must_use]
    pub fn queue(&self) -> &HitQueue {
        &self.queue
    }

    // ── Internals ────────────────────────────────────────────────

    fn cached_privacy(&self) -> PrivacyStatus {
        self.last_valid_config
            .as_ref()
            .map(RemoteConfig::privacy_status)
            .unwrap_or_default()
    }

    /// `(changed, add_consent_flag)` for a reported advertising identity.
    /// The consent flag is needed when the id moves to or from empty.
    fn ad_id_change(&self, ad_id: Option<&CustomIdentity>) -> (bool, bool) {
        let Some(ad_id) = ad_id else {
            return (false, false);
        };
        let new = ad_id.identifier_str();
        let existing = self.record.advertising_id.as_deref().unwrap_or_default();

        let changed =
            (!new.is_empty() && new != existing) || (new.is_empty() && !existing.is_empty());
        if !changed {
            return (false, false);
        }
        let consent = new.is_empty() || existing.is_empty() || existing == ZERO_ADVERTISING_ID;
        (true, consent)
    }

    fn update_push_token(&mut self, token: &str) {
        match self.push.update_push_id(self.record.push_token.as_deref(), Some(token)) {
            Ok(Some(enabled)) => self.emit(EngineEvent::PushStatusChanged { enabled }),
            Ok(None) => {}
            Err(e) => warn!(error = %e, "failed to update push flags"),
        }
        self.record.push_token = Some(token.to_owned());
    }

    fn ensure_primary_id(&mut self) {
        let (id, created) = self.record.ensure_primary_id();
        if created {
            debug!(primary_id = %id, "generated new primary id");
            self.persist();
        }
    }

    fn queue_sync_hit(
        &self,
        external_ids: &BTreeMap<String, String>,
        add_consent_flag: bool,
        event_ref: EventRef,
    ) {
        let Some(config) = &self.last_valid_config else {
            return;
        };
        let server = config.effective_server(&self.config.default_server);
        let url = match codec::build_sync_url(
            server,
            config.org_id(),
            &self.record,
            external_ids,
            add_consent_flag,
        ) {
            Ok(url) => url,
            Err(e) => {
                warn!(error = %e, "dropping identity hit, failed to build url");
                return;
            }
        };
        let entity = match QueuedHit::new(url, event_ref).to_entity() {
            Ok(entity) => entity,
            Err(e) => {
                warn!(error = %e, "dropping identity hit, failed to encode");
                return;
            }
        };
        if let Err(e) = self.queue.enqueue(entity) {
            warn!(error = %e, "failed to queue identity hit");
        }
    }

    fn clear_identifiers(&mut self) {
        self.record.clear_identifiers();
        if let Err(e) = self.push.reset_flags() {
            warn!(error = %e, "failed to reset push flags");
        }
    }

    fn apply_queue_policy(&self, status: PrivacyStatus) {
        if let Err(e) = self.queue.apply_privacy_policy(status) {
            warn!(error = %e, %status, "failed to apply privacy policy to hit queue");
        }
    }

    fn persist(&self) {
        if let Err(e) = self.store.save_json(RECORD_KEY, &self.record) {
            error!(error = %e, "failed to persist identity record");
        }
    }

    fn publish(&self) {
        self.emit(EngineEvent::IdentityUpdated(self.record.snapshot()));
    }

    fn emit(&self, event: EngineEvent) {
        if self.events.send(event).is_err() {
            debug!("engine event receiver dropped");
        }
    }
}
