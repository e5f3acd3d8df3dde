//! Tests for the identity engine state machine.

use idsync_engine::transport::mock::MockTransport;
use idsync_engine::{
    EngineConfig, EngineEvent, HitResponseNotification, HitQueue, HttpResponse, IdentityEngine,
    IdentityHitProcessor, PUSH_ENABLED_KEY, PUSH_STATUS_SYNCED_KEY, QueuedHit, RECORD_KEY,
    RemoteConfig, SyncRequest, ANALYTICS_ID_TYPE,
};
use idsync_storage::{
    HitStore, KeyValueStore, KeyValueStoreExt, SqliteHitStore, SqliteKeyValueStore,
};
use idsync_types::{
    AuthenticationState, CustomIdentity, EventRef, IdentityRecord, PrimaryId, PrivacyStatus,
    Timestamp, ZERO_ADVERTISING_ID,
};
use pretty_assertions::assert_eq;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::timeout;

const ORG: &str = "testOrg@AdobeOrg";

struct Harness {
    engine: IdentityEngine,
    events: mpsc::UnboundedReceiver<EngineEvent>,
    _responses: mpsc::UnboundedReceiver<HitResponseNotification>,
    store: Arc<SqliteKeyValueStore>,
    hits: Arc<SqliteHitStore>,
    transport: Arc<MockTransport>,
}

impl Harness {
    fn new() -> Self {
        Self::with_store(Arc::new(SqliteKeyValueStore::open_in_memory("engine_test").unwrap()))
    }

    fn with_store(store: Arc<SqliteKeyValueStore>) -> Self {
        let config = EngineConfig::default();
        let hits = Arc::new(SqliteHitStore::open_in_memory("engine_test").unwrap());
        let transport = Arc::new(MockTransport::new());
        let (response_tx, responses) = mpsc::unbounded_channel();
        let processor = IdentityHitProcessor::new(
            transport.clone(),
            response_tx,
            config.retry_interval(),
            config.timeout(),
        );
        let queue = HitQueue::new(hits.clone(), Arc::new(processor), None);
        let (event_tx, events) = mpsc::unbounded_channel();
        let mut engine =
            IdentityEngine::new(config, store.clone(), queue, transport.clone(), event_tx);
        engine.boot();
        Self {
            engine,
            events,
            _responses: responses,
            store,
            hits,
            transport,
        }
    }

    fn queued(&self) -> Vec<QueuedHit> {
        self.hits
            .peek(100)
            .unwrap()
            .iter()
            .map(|entity| QueuedHit::from_entity(entity).unwrap())
            .collect()
    }

    fn queued_urls(&self) -> Vec<String> {
        self.queued().into_iter().map(|hit| hit.url.to_string()).collect()
    }

    fn events(&mut self) -> Vec<EngineEvent> {
        let mut out = Vec::new();
        while let Ok(event) = self.events.try_recv() {
            out.push(event);
        }
        out
    }

    fn persisted(&self) -> IdentityRecord {
        self.store.load_json(RECORD_KEY).unwrap().unwrap()
    }

    /// Completes the oldest queued hit with `body`, as the processor would.
    fn respond(&mut self, body: Option<&str>) -> HitResponseNotification {
        let hit = self.queued().remove(0);
        self.hits.remove(1).unwrap();
        let notification = HitResponseNotification {
            event_ref: hit.event_ref,
            hit,
            body: body.map(|b| b.as_bytes().to_vec()),
        };
        self.engine.on_hit_response(&notification);
        notification
    }

    fn primary_id(&self) -> String {
        self.engine.record().primary_id.as_ref().unwrap().to_string()
    }
}

/// Valid config with unknown privacy: hits are queued but not sent.
fn config() -> RemoteConfig {
    RemoteConfig::new(ORG)
}

fn seed(store: &SqliteKeyValueStore, record: &IdentityRecord) {
    store.save_json(RECORD_KEY, record).unwrap();
}

fn seeded_record(last_sync: Option<Timestamp>) -> IdentityRecord {
    let mut record = IdentityRecord::new();
    record.primary_id = Some(PrimaryId::generate());
    record.last_sync_time = last_sync;
    record
}

// ── Boot ──────────────────────────────────────────────────────────

#[tokio::test]
async fn boot_publishes_persisted_record_with_primary_id() {
    let store = Arc::new(SqliteKeyValueStore::open_in_memory("engine_test").unwrap());
    let record = seeded_record(None);
    seed(&store, &record);

    let mut h = Harness::with_store(store);

    assert_eq!(h.engine.record(), &record);
    assert_eq!(h.events(), vec![EngineEvent::IdentityUpdated(record.snapshot())]);
}

#[tokio::test]
async fn boot_without_persisted_record_is_silent() {
    let mut h = Harness::new();
    assert!(h.events().is_empty());
    assert_eq!(h.engine.record().primary_id, None);
}

#[tokio::test]
async fn boot_discards_unreadable_record() {
    let store = Arc::new(SqliteKeyValueStore::open_in_memory("engine_test").unwrap());
    store.set(RECORD_KEY, b"not json").unwrap();

    let mut h = Harness::with_store(store);

    assert_eq!(h.engine.record().primary_id, None);
    assert!(h.events().is_empty());
}

// ── Bootstrap ─────────────────────────────────────────────────────

#[tokio::test]
async fn bootstrap_waits_for_valid_config() {
    let mut h = Harness::new();
    assert!(!h.engine.bootstrap(&RemoteConfig::default()));
    assert!(!h.engine.has_synced());
    assert!(h.queued().is_empty());
}

#[tokio::test]
async fn bootstrap_forces_first_sync_and_publishes_once() {
    let mut h = Harness::new();

    assert!(h.engine.bootstrap(&config()));
    assert!(h.engine.has_synced());
    assert_eq!(h.queued().len(), 1);
    let published = h
        .events()
        .into_iter()
        .filter(|e| matches!(e, EngineEvent::IdentityUpdated(_)))
        .count();
    assert_eq!(published, 1);

    assert!(h.engine.bootstrap(&config()));
    assert_eq!(h.queued().len(), 1);
}

#[tokio::test]
async fn bootstrap_when_opted_out_completes_without_hit() {
    let mut h = Harness::new();
    assert!(h.engine.bootstrap(&config().with_privacy(PrivacyStatus::OptedOut)));
    assert!(h.queued().is_empty());
    assert_eq!(h.engine.record().primary_id, None);
}

// ── Sync requests ─────────────────────────────────────────────────

#[tokio::test]
async fn sync_without_config_is_deferred() {
    let mut h = Harness::new();
    let request = SyncRequest::new().with_identifier("crm", "user-1");

    assert_eq!(h.engine.on_sync_request(&request, None), None);
    assert!(h.queued().is_empty());
    assert!(h.engine.record().custom_identities.is_empty());
}

#[tokio::test]
async fn first_sync_generates_primary_id_and_queues_hit() {
    let mut h = Harness::new();
    let request = SyncRequest::new()
        .with_identifier("crm", "user-1")
        .with_auth_state(AuthenticationState::Authenticated);

    let snapshot = h.engine.on_sync_request(&request, Some(&config())).unwrap();

    let id = h.primary_id();
    assert_eq!(snapshot.primary_id.as_deref(), Some(id.as_str()));
    assert_eq!(snapshot.custom_identities.len(), 1);

    let hits = h.queued();
    assert_eq!(hits.len(), 1);
    assert_eq!(hits[0].event_ref, request.event_ref);
    assert_eq!(
        hits[0].url.as_str(),
        format!(
            "https://dpm.demdex.net/id?d_rtbd=json&d_ver=2&d_orgid={ORG}&d_mid={id}&d_cid_ic=crm%01user-1%011"
        )
    );
    assert_eq!(&h.persisted(), h.engine.record());
}

#[tokio::test]
async fn sync_uses_configured_server() {
    let mut h = Harness::new();
    let config = config().with_server("identity.example.com");
    h.engine.on_sync_request(&SyncRequest::new().forced(), Some(&config));
    assert!(h.queued_urls()[0].starts_with("https://identity.example.com/id?"));
}

#[tokio::test]
async fn sync_with_nothing_new_after_response_queues_nothing() {
    let mut h = Harness::new();
    h.engine.on_sync_request(&SyncRequest::new().with_identifier("crm", "a"), Some(&config()));
    h.respond(Some("{}"));

    let snapshot = h.engine.on_sync_request(&SyncRequest::new(), None);

    assert!(snapshot.is_some());
    assert!(h.queued().is_empty());
}

#[tokio::test]
async fn forced_sync_queues_even_when_fresh() {
    let mut h = Harness::new();
    h.engine.on_sync_request(&SyncRequest::new(), Some(&config()));
    h.respond(Some("{}"));

    h.engine.on_sync_request(&SyncRequest::new().forced(), None);

    assert_eq!(h.queued().len(), 1);
}

#[tokio::test]
async fn sync_blocked_when_opted_out() {
    let mut h = Harness::new();
    let config = config().with_privacy(PrivacyStatus::OptedOut);
    let request = SyncRequest::new().with_identifier("crm", "user-1").forced();

    assert_eq!(h.engine.on_sync_request(&request, Some(&config)), None);
    assert!(h.queued().is_empty());
    assert_eq!(h.engine.record().primary_id, None);
}

#[tokio::test]
async fn empty_identifier_removes_stored_identity() {
    let mut h = Harness::new();
    h.engine.on_sync_request(&SyncRequest::new().with_identifier("crm", "a"), Some(&config()));
    h.engine.on_sync_request(&SyncRequest::new().with_identifier("crm", ""), None);
    assert!(h.engine.record().custom_identity("crm").is_none());
}

#[tokio::test]
async fn external_ids_are_sent_but_not_stored() {
    let mut h = Harness::new();
    let request = SyncRequest::new().with_external_id("411", "partner-id");
    h.engine.on_sync_request(&request, Some(&config()));

    assert!(h.queued_urls()[0].ends_with("&d_cid=411%01partner-id"));
    assert!(h.engine.record().custom_identities.is_empty());
}

// ── TTL ───────────────────────────────────────────────────────────

#[tokio::test]
async fn expired_ttl_requires_sync() {
    let store = Arc::new(SqliteKeyValueStore::open_in_memory("engine_test").unwrap());
    let last = Timestamp::now().saturating_sub(Duration::from_secs(600 + 1));
    seed(&store, &seeded_record(Some(last)));
    let mut h = Harness::with_store(store);

    assert!(h.engine.should_sync(false, false, false, true));
}

#[tokio::test]
async fn fresh_sync_needs_no_resync() {
    let store = Arc::new(SqliteKeyValueStore::open_in_memory("engine_test").unwrap());
    seed(&store, &seeded_record(Some(Timestamp::now())));
    let mut h = Harness::with_store(store);

    assert!(!h.engine.should_sync(false, false, false, true));
    assert!(h.engine.should_sync(true, false, false, true));
    assert!(h.engine.should_sync(false, true, false, true));
    assert!(h.engine.should_sync(false, false, true, true));
}

#[tokio::test]
async fn should_sync_generates_primary_id_without_valid_config() {
    let mut h = Harness::new();
    assert!(!h.engine.should_sync(false, false, false, false));
    assert!(h.engine.record().primary_id.is_some());
    assert_eq!(&h.persisted(), h.engine.record());
}

// ── Advertising id ────────────────────────────────────────────────

#[tokio::test]
async fn first_advertising_id_sends_consent() {
    let mut h = Harness::new();
    let request = SyncRequest::new().with_advertising_id("ad-1");

    let snapshot = h.engine.on_sync_request(&request, Some(&config())).unwrap();

    assert_eq!(snapshot.advertising_id.as_deref(), Some("ad-1"));
    let url = &h.queued_urls()[0];
    assert!(url.contains("&d_cid_ic=DSID_20915%01ad-1%011"));
    assert!(url.ends_with("&device_consent=1"));
}

#[tokio::test]
async fn unchanged_advertising_id_is_not_resent() {
    let mut h = Harness::new();
    h.engine
        .on_sync_request(&SyncRequest::new().with_advertising_id("ad-1"), Some(&config()));
    h.respond(Some("{}"));

    h.engine.on_sync_request(&SyncRequest::new().with_advertising_id("ad-1"), None);

    assert!(h.queued().is_empty());
}

#[tokio::test]
async fn changed_advertising_id_syncs_without_consent() {
    let mut h = Harness::new();
    h.engine
        .on_sync_request(&SyncRequest::new().with_advertising_id("ad-1"), Some(&config()));
    h.respond(Some("{}"));

    h.engine.on_sync_request(&SyncRequest::new().with_advertising_id("ad-2"), None);

    let url = &h.queued_urls()[0];
    assert!(url.contains("DSID_20915%01ad-2%011"));
    assert!(!url.contains("device_consent"));
}

#[tokio::test]
async fn zeroed_advertising_id_revokes_consent() {
    let mut h = Harness::new();
    h.engine
        .on_sync_request(&SyncRequest::new().with_advertising_id("ad-1"), Some(&config()));
    h.respond(Some("{}"));

    let snapshot = h
        .engine
        .on_sync_request(&SyncRequest::new().with_advertising_id(ZERO_ADVERTISING_ID), None)
        .unwrap();

    assert_eq!(snapshot.advertising_id, None);
    assert!(h.engine.record().custom_identity("DSID_20915").is_none());
    let url = &h.queued_urls()[0];
    assert!(!url.contains("d_cid_ic"));
    assert!(url.ends_with("&device_consent=0&d_consent_ic=DSID_20915"));
}

#[tokio::test]
async fn zero_advertising_id_with_none_stored_is_ignored() {
    let mut h = Harness::new();
    h.engine.on_sync_request(&SyncRequest::new(), Some(&config()));
    h.respond(Some("{}"));

    h.engine.on_sync_request(&SyncRequest::new().with_advertising_id(ZERO_ADVERTISING_ID), None);

    assert!(h.queued().is_empty());
}

// ── Push token ────────────────────────────────────────────────────

#[tokio::test]
async fn push_token_reports_status_once() {
    let mut h = Harness::new();
    let request = SyncRequest::new().with_push_token("token-1");

    h.engine.on_sync_request(&request, Some(&config()));
    assert!(h.queued_urls()[0].ends_with("&d_cid=20920%01token-1"));
    assert_eq!(h.engine.record().push_token.as_deref(), Some("token-1"));
    assert!(h.events().contains(&EngineEvent::PushStatusChanged { enabled: true }));

    h.engine.on_sync_request(&request, None);
    assert!(!h.events().contains(&EngineEvent::PushStatusChanged { enabled: true }));
    assert!(h.store.get_flag(PUSH_ENABLED_KEY).unwrap());
}

#[tokio::test]
async fn empty_push_token_disables_push() {
    let mut h = Harness::new();
    h.engine
        .on_sync_request(&SyncRequest::new().with_push_token("token-1"), Some(&config()));
    h.events();

    h.engine.on_sync_request(&SyncRequest::new().with_push_token(""), None);

    assert!(h.events().contains(&EngineEvent::PushStatusChanged { enabled: false }));
    assert!(!h.store.get_flag(PUSH_ENABLED_KEY).unwrap());
}

// ── Hit responses ─────────────────────────────────────────────────

#[tokio::test]
async fn response_with_matching_ecid_updates_record() {
    let mut h = Harness::new();
    h.engine.on_sync_request(&SyncRequest::new(), Some(&config()));
    let id = h.primary_id();
    h.events();

    let body = format!(r#"{{"d_mid":"{id}","d_blob":"blob","dcs_region":6,"id_sync_ttl":1200}}"#);
    let notification = h.respond(Some(&body));

    let record = h.engine.record();
    assert_eq!(record.blob.as_deref(), Some("blob"));
    assert_eq!(record.location_hint.as_deref(), Some("6"));
    assert_eq!(record.ttl_seconds, 1200);
    assert!(record.last_sync_time.is_some());
    assert_eq!(&h.persisted(), h.engine.record());

    let snapshot = h.engine.snapshot();
    assert_eq!(
        h.events(),
        vec![
            EngineEvent::IdentityUpdated(snapshot.clone()),
            EngineEvent::Response {
                event_ref: notification.event_ref,
                snapshot,
            },
        ]
    );
}

#[tokio::test]
async fn response_without_ttl_restores_default() {
    let mut h = Harness::new();
    h.engine.on_sync_request(&SyncRequest::new(), Some(&config()));
    let id = h.primary_id();
    h.respond(Some(&format!(r#"{{"d_mid":"{id}","id_sync_ttl":30}}"#)));
    h.engine.on_sync_request(&SyncRequest::new().forced(), None);

    h.respond(Some(&format!(r#"{{"d_mid":"{id}"}}"#)));

    assert_eq!(h.engine.record().ttl_seconds, 600);
}

#[tokio::test]
async fn response_with_other_ecid_is_not_applied() {
    let mut h = Harness::new();
    h.engine.on_sync_request(&SyncRequest::new(), Some(&config()));
    let id = h.primary_id();

    h.respond(Some(r#"{"d_mid":"999","d_blob":"blob","dcs_region":6}"#));

    let record = h.engine.record();
    assert_eq!(record.primary_id.as_ref().unwrap().as_str(), id);
    assert_eq!(record.blob, None);
    assert_eq!(record.location_hint, None);
    assert!(record.last_sync_time.is_some());
}

#[tokio::test]
async fn response_opt_out_requests_configuration_update() {
    let mut h = Harness::new();
    h.engine.on_sync_request(&SyncRequest::new(), Some(&config()));
    h.events();

    h.respond(Some(r#"{"d_mid":"123","d_optout":["global"]}"#));

    assert!(h.events().contains(&EngineEvent::ConfigurationUpdate {
        privacy: PrivacyStatus::OptedOut
    }));
}

#[tokio::test]
async fn response_error_keeps_primary_id() {
    let mut h = Harness::new();
    h.engine.on_sync_request(&SyncRequest::new(), Some(&config()));
    let id = h.primary_id();

    h.respond(Some(r#"{"error_msg":"unknown org"}"#));

    assert_eq!(h.primary_id(), id);
    assert_eq!(h.engine.record().blob, None);
}

#[tokio::test]
async fn undecodable_or_missing_body_still_notifies() {
    let mut h = Harness::new();
    h.engine.on_sync_request(&SyncRequest::new(), Some(&config()));
    h.engine.on_sync_request(&SyncRequest::new().forced(), None);
    h.events();

    h.respond(Some("<html>"));
    h.respond(None);

    let responses = h
        .events()
        .into_iter()
        .filter(|e| matches!(e, EngineEvent::Response { .. }))
        .count();
    assert_eq!(responses, 2);
}

#[tokio::test]
async fn response_after_opt_out_is_not_applied() {
    let mut h = Harness::new();
    h.engine.on_sync_request(&SyncRequest::new(), Some(&config()));
    let hit = h.queued().remove(0);
    let id = h.primary_id();
    h.engine.on_privacy_change(PrivacyStatus::OptedOut, None);
    h.events();

    h.engine.on_hit_response(&HitResponseNotification {
        event_ref: hit.event_ref,
        hit: hit.clone(),
        body: Some(format!(r#"{{"d_mid":"{id}","d_blob":"blob"}}"#).into_bytes()),
    });

    assert_eq!(h.engine.record().blob, None);
    assert_eq!(h.engine.record().primary_id, None);
    let events = h.events();
    assert_eq!(events.len(), 2);
    assert!(matches!(
        &events[1],
        EngineEvent::Response { event_ref, .. } if *event_ref == hit.event_ref
    ));
}

// ── Privacy ───────────────────────────────────────────────────────

#[tokio::test]
async fn opt_out_wipes_identities_and_queue() {
    let mut h = Harness::new();
    let request = SyncRequest::new()
        .with_identifier("crm", "user-1")
        .with_advertising_id("ad-1")
        .with_push_token("token");
    h.engine.on_sync_request(&request, Some(&config()));
    h.respond(Some("{}"));
    h.engine.on_sync_request(&SyncRequest::new().forced(), None);
    assert_eq!(h.queued().len(), 1);
    h.events();

    h.engine.on_privacy_change(
        PrivacyStatus::OptedOut,
        Some(&config().with_privacy(PrivacyStatus::OptedOut)),
    );

    let record = h.engine.record();
    assert_eq!(record.primary_id, None);
    assert_eq!(record.advertising_id, None);
    assert_eq!(record.push_token, None);
    assert_eq!(record.blob, None);
    assert_eq!(record.location_hint, None);
    assert!(record.custom_identities.is_empty());
    assert_eq!(record.privacy_status, PrivacyStatus::OptedOut);

    assert!(h.queued().is_empty());
    assert!(!h.engine.queue().is_running());
    assert_eq!(&h.persisted(), h.engine.record());
    assert!(!h.store.get_flag(PUSH_ENABLED_KEY).unwrap());
    assert!(!h.store.get_flag(PUSH_STATUS_SYNCED_KEY).unwrap());
    assert_eq!(
        h.events(),
        vec![EngineEvent::IdentityUpdated(h.engine.snapshot())]
    );
}

#[tokio::test]
async fn unchanged_privacy_is_a_no_op() {
    let mut h = Harness::new();
    h.engine.on_privacy_change(PrivacyStatus::Unknown, Some(&config()));
    assert!(h.events().is_empty());
    assert!(h.engine.last_valid_config().is_none());
}

#[tokio::test]
async fn opted_in_starts_queue_and_keeps_identities() {
    let mut h = Harness::new();
    h.engine
        .on_sync_request(&SyncRequest::new().with_identifier("crm", "a"), Some(&config()));

    h.engine.on_privacy_change(PrivacyStatus::OptedIn, None);

    assert!(h.engine.queue().is_running());
    assert!(h.engine.record().custom_identity("crm").is_some());
    timeout(Duration::from_secs(5), h.transport.wait_for_requests(1))
        .await
        .unwrap();
}

#[tokio::test]
async fn opting_back_in_establishes_new_primary_id() {
    let mut h = Harness::new();
    h.engine.on_sync_request(&SyncRequest::new(), Some(&config()));
    h.engine.on_privacy_change(PrivacyStatus::OptedOut, None);
    assert_eq!(h.engine.record().primary_id, None);
    h.events();

    h.engine.on_privacy_change(PrivacyStatus::OptedIn, None);

    let id = h.primary_id();
    assert!(matches!(
        h.events().last(),
        Some(EngineEvent::IdentityUpdated(s)) if s.primary_id.as_deref() == Some(id.as_str())
    ));
    timeout(Duration::from_secs(5), h.transport.wait_for_requests(1))
        .await
        .unwrap();
    let sent = h.transport.requests();
    assert!(sent[0].url.as_str().contains(&format!("d_mid={id}")));
}

#[tokio::test]
async fn opted_out_to_unknown_resyncs_but_holds_the_queue() {
    let mut h = Harness::new();
    h.engine.on_sync_request(&SyncRequest::new(), Some(&config()));
    let old_id = h.primary_id();
    h.engine.on_privacy_change(PrivacyStatus::OptedOut, None);
    assert!(h.queued().is_empty());
    h.events();

    h.engine.on_privacy_change(PrivacyStatus::Unknown, None);

    let id = h.primary_id();
    assert_ne!(id, old_id);
    assert_eq!(h.engine.record().privacy_status, PrivacyStatus::Unknown);
    assert!(!h.engine.queue().is_running());
    let urls = h.queued_urls();
    assert_eq!(urls.len(), 1);
    assert!(urls[0].contains(&format!("d_mid={id}")));
    assert!(matches!(
        h.events().last(),
        Some(EngineEvent::IdentityUpdated(s)) if s.primary_id.as_deref() == Some(id.as_str())
    ));

    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(h.transport.request_count(), 0);
}

#[tokio::test]
async fn opted_in_to_unknown_suspends_and_keeps_queued_hits() {
    let mut h = Harness::new();
    h.transport.push_response(HttpResponse::with_status(503, Vec::new()));
    h.engine
        .on_sync_request(&SyncRequest::new().with_identifier("crm", "a"), Some(&config()));
    h.engine.on_sync_request(&SyncRequest::new().forced(), None);
    let id = h.primary_id();

    h.engine.on_privacy_change(PrivacyStatus::OptedIn, None);
    timeout(Duration::from_secs(5), h.transport.wait_for_requests(1))
        .await
        .unwrap();

    h.engine.on_privacy_change(PrivacyStatus::Unknown, None);

    assert!(!h.engine.queue().is_running());
    assert_eq!(h.queued().len(), 2);
    assert_eq!(h.primary_id(), id);
    assert!(h.engine.record().custom_identity("crm").is_some());
    assert_eq!(h.persisted().privacy_status, PrivacyStatus::Unknown);

    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(h.transport.request_count(), 1);
}

#[tokio::test]
async fn opt_out_check_sends_ping() {
    let mut h = Harness::new();
    h.engine.on_sync_request(&SyncRequest::new(), Some(&config()));
    let id = h.primary_id();
    let opted_out = config().with_privacy(PrivacyStatus::OptedOut);

    assert!(h.engine.on_opt_out_check(Some(&opted_out), false));

    timeout(Duration::from_secs(5), h.transport.wait_for_requests(1))
        .await
        .unwrap();
    assert_eq!(
        h.transport.requests()[0].url.as_str(),
        format!("https://dpm.demdex.net/demoptout.jpg?d_orgid={ORG}&d_mid={id}")
    );
}

#[tokio::test]
async fn opt_out_check_skips_when_not_applicable() {
    let mut h = Harness::new();
    let opted_out = config().with_privacy(PrivacyStatus::OptedOut);

    // no primary id yet
    assert!(!h.engine.on_opt_out_check(Some(&opted_out), false));

    h.engine.on_sync_request(&SyncRequest::new(), Some(&config()));
    assert!(!h.engine.on_opt_out_check(Some(&opted_out), true));
    assert!(!h.engine.on_opt_out_check(Some(&config()), false));
    assert!(!h.engine.on_opt_out_check(None, false));
}

// ── Reset, analytics id, URL helpers ──────────────────────────────

#[tokio::test]
async fn reset_replaces_primary_id_and_drops_pending_hits() {
    let mut h = Harness::new();
    h.engine
        .on_sync_request(&SyncRequest::new().with_identifier("crm", "a"), Some(&config()));
    let old_id = h.primary_id();
    h.events();

    let event_ref = EventRef::new();
    let snapshot = h.engine.reset_identities(event_ref).unwrap();

    let new_id = h.primary_id();
    assert_ne!(new_id, old_id);
    assert_eq!(snapshot.primary_id.as_deref(), Some(new_id.as_str()));
    assert!(snapshot.custom_identities.is_empty());

    let hits = h.queued();
    assert_eq!(hits.len(), 1);
    assert_eq!(hits[0].event_ref, event_ref);
    assert!(hits[0].url.as_str().contains(&format!("d_mid={new_id}")));
    assert_eq!(h.events(), vec![EngineEvent::IdentityUpdated(snapshot)]);
}

#[tokio::test]
async fn reset_is_ignored_when_opted_out() {
    let mut h = Harness::new();
    h.engine
        .on_sync_request(&SyncRequest::new(), Some(&config()));
    h.engine.on_privacy_change(PrivacyStatus::OptedOut, None);

    assert_eq!(h.engine.reset_identities(EventRef::new()), None);
}

#[tokio::test]
async fn analytics_id_is_synced_once() {
    let mut h = Harness::new();

    h.engine.on_analytics_id("");
    assert!(h.events().is_empty());

    h.engine.on_analytics_id("aid-1");
    let events = h.events();
    let [EngineEvent::SyncRequested(request)] = events.as_slice() else {
        panic!("expected one sync request, got {events:?}");
    };
    assert_eq!(
        request.custom_identities(),
        vec![CustomIdentity::new(ANALYTICS_ID_TYPE, "aid-1", AuthenticationState::Unknown)]
    );
    assert!(h.persisted().is_aid_synced);

    h.engine.on_analytics_id("aid-2");
    assert!(h.events().is_empty());
}

#[tokio::test]
async fn url_variables_carry_ids() {
    let mut h = Harness::new();
    h.engine.on_sync_request(&SyncRequest::new(), Some(&config()));
    let id = h.primary_id();

    let vars = h.engine.url_variables(Some("aid"), Some("vid"));

    assert!(vars.starts_with("adobe_mc=TS%3D"));
    let ids = format!("%7CMCMID%3D{id}%7CMCAID%3Daid%7CMCORGID%3DtestOrg%40AdobeOrg");
    assert!(vars.contains(&ids));
    assert!(vars.ends_with("&adobe_aa_vid=vid"));

    let url = h.engine.append_visitor_info("https://example.com/page?x=1", None, None);
    assert!(url.starts_with("https://example.com/page?x=1&adobe_mc=TS%3D"));
}
