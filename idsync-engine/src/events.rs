//! Typed requests consumed by the engine and events it emits.

use crate::codec::PUSH_DPID;
use idsync_types::{AuthenticationState, CustomIdentity, EventRef, IdentitySnapshot, PrivacyStatus};
use std::collections::BTreeMap;

/// Identifier type used to sync the analytics id.
pub const ANALYTICS_ID_TYPE: &str = "AVID";

/// A request to record identities and, if needed, sync them.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyncRequest {
    /// New identities, keyed by type.
    pub identifiers: BTreeMap<String, String>,
    /// Authentication state applied to every entry in `identifiers`.
    pub auth_state: AuthenticationState,
    /// Sync even if nothing changed and the TTL has not expired.
    pub force_sync: bool,
    /// Advertising identity, when the caller reports one.
    pub ad_id: Option<CustomIdentity>,
    /// External ids sent as `d_cid`, keyed by namespace.
    pub external_ids: BTreeMap<String, String>,
    /// Reference echoed in the response event for this request.
    pub event_ref: EventRef,
}

impl Default for SyncRequest {
    fn default() -> Self {
        Self::new()
    }
}

impl SyncRequest {
    #[must_use]
    pub fn new() -> Self {
        Self {
            identifiers: BTreeMap::new(),
            auth_state: AuthenticationState::Unknown,
            force_sync: false,
            ad_id: None,
            external_ids: BTreeMap::new(),
            event_ref: EventRef::new(),
        }
    }

    #[must_use]
    pub fn with_identifier(mut self, id_type: impl Into<String>, value: impl Into<String>) -> Self {
        self.identifiers.insert(id_type.into(), value.into());
        self
    }

    #[must_use]
    pub fn with_auth_state(mut self, auth_state: AuthenticationState) -> Self {
        self.auth_state = auth_state;
        self
    }

    /// Attaches the device advertising id. The all-zero id counts as empty.
    #[must_use]
    pub fn with_advertising_id(mut self, ad_id: &str) -> Self {
        self.ad_id = Some(CustomIdentity::advertising(ad_id));
        self
    }

    /// Attaches a push token, sent under the push namespace.
    #[must_use]
    pub fn with_push_token(self, token: impl Into<String>) -> Self {
        self.with_external_id(PUSH_DPID, token)
    }

    #[must_use]
    pub fn with_external_id(
        mut self,
        namespace: impl Into<String>,
        value: impl Into<String>,
    ) -> Self {
        self.external_ids.insert(namespace.into(), value.into());
        self
    }

    #[must_use]
    pub fn forced(mut self) -> Self {
        self.force_sync = true;
        self
    }

    #[must_use]
    pub fn with_event_ref(mut self, event_ref: EventRef) -> Self {
        self.event_ref = event_ref;
        self
    }

    /// Candidate identities built from `identifiers`.
    #[must_use]
    pub fn custom_identities(&self) -> Vec<CustomIdentity> {
        self.identifiers
            .iter()
            .map(|(id_type, value)| {
                CustomIdentity::new(id_type.as_str(), value.as_str(), self.auth_state)
            })
            .collect()
    }

    /// The push token carried by this request, if any.
    #[must_use]
    pub fn push_token(&self) -> Option<&str> {
        self.external_ids.get(PUSH_DPID).map(String::as_str)
    }
}

/// A privacy status change reported by the host.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PrivacyChangeRequest {
    pub status: PrivacyStatus,
    pub event_ref: EventRef,
}

impl PrivacyChangeRequest {
    #[must_use]
    pub fn new(status: PrivacyStatus) -> Self {
        Self {
            status,
            event_ref: EventRef::new(),
        }
    }
}

/// Signals emitted by the engine for the host to act on.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EngineEvent {
    /// The identity record changed; the snapshot is the new shared state.
    IdentityUpdated(IdentitySnapshot),
    /// A hit for the request tagged `event_ref` finished.
    Response {
        event_ref: EventRef,
        snapshot: IdentitySnapshot,
    },
    /// The service asked for the global privacy status to change.
    ConfigurationUpdate { privacy: PrivacyStatus },
    /// The push opt-in state changed.
    PushStatusChanged { enabled: bool },
    /// The engine wants this request fed back in as a new sync.
    SyncRequested(SyncRequest),
}
