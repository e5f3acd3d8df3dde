//! The persisted identity record and its public snapshot.

use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::{CustomIdentity, PrimaryId, PrivacyStatus, Timestamp};

/// Default time-to-live before a sync is considered stale.
pub const DEFAULT_TTL_SECONDS: u64 = 600;

fn default_ttl() -> u64 {
    DEFAULT_TTL_SECONDS
}

/// Durable per-install identity state.
///
/// Owned by the engine and written to the key-value store after every
/// mutation. Absent fields in older persisted payloads fall back to defaults.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct IdentityRecord {
    pub primary_id: Option<PrimaryId>,
    pub advertising_id: Option<String>,
    pub push_token: Option<String>,
    pub blob: Option<String>,
    pub location_hint: Option<String>,
    pub custom_identities: Vec<CustomIdentity>,
    pub last_sync_time: Option<Timestamp>,
    #[serde(default = "default_ttl")]
    pub ttl_seconds: u64,
    pub privacy_status: PrivacyStatus,
    pub is_aid_synced: bool,
}

impl Default for IdentityRecord {
    fn default() -> Self {
        Self {
            primary_id: None,
            advertising_id: None,
            push_token: None,
            blob: None,
            location_hint: None,
            custom_identities: Vec::new(),
            last_sync_time: None,
            ttl_seconds: DEFAULT_TTL_SECONDS,
            privacy_status: PrivacyStatus::Unknown,
            is_aid_synced: false,
        }
    }
}

impl IdentityRecord {
    /// Creates an empty record.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Merges `candidates` into the custom identities, then removes every
    /// entry left without an identifier.
    ///
    /// An incoming identity replaces the stored one of the same type in
    /// place; identities of a new type are appended in order. A candidate
    /// with an empty identifier therefore deletes its slot.
    pub fn merge_and_clean(&mut self, candidates: &[CustomIdentity]) {
        for candidate in candidates {
            match self
                .custom_identities
                .iter_mut()
                .find(|existing| existing.same_slot(candidate))
            {
                Some(existing) => *existing = candidate.clone(),
                None => self.custom_identities.push(candidate.clone()),
            }
        }
        self.custom_identities.retain(CustomIdentity::has_identifier);
    }

    /// Looks up the stored identity of the given type.
    #[must_use]
    pub fn custom_identity(&self, id_type: &str) -> Option<&CustomIdentity> {
        self.custom_identities.iter().find(|c| c.id_type == id_type)
    }

    /// Wipes every identifier. Privacy status and TTL are kept.
    pub fn clear_identifiers(&mut self) {
        self.primary_id = None;
        self.advertising_id = None;
        self.push_token = None;
        self.blob = None;
        self.location_hint = None;
        self.custom_identities.clear();
        self.is_aid_synced = false;
    }

    /// Returns the primary id, generating and storing one if absent.
    /// The flag is true when a new id was created.
    pub fn ensure_primary_id(&mut self) -> (&PrimaryId, bool) {
        let created = self.primary_id.is_none();
        let id = self.primary_id.get_or_insert_with(PrimaryId::generate);
        (id, created)
    }

    /// True when more than `ttl_seconds` have passed since the last sync,
    /// or no sync has happened yet.
    #[must_use]
    pub fn is_stale(&self, now: Timestamp) -> bool {
        match self.last_sync_time {
            Some(last) => last.elapsed_until(now) > Duration::from_secs(self.ttl_seconds),
            None => true,
        }
    }

    /// Builds the public view of this record.
    #[must_use]
    pub fn snapshot(&self) -> IdentitySnapshot {
        IdentitySnapshot {
            primary_id: self.primary_id.as_ref().map(ToString::to_string),
            advertising_id: non_empty(&self.advertising_id),
            push_token: non_empty(&self.push_token),
            blob: non_empty(&self.blob),
            location_hint: non_empty(&self.location_hint),
            custom_identities: self.custom_identities.clone(),
            last_sync_secs: self.last_sync_time.map(|t| t.as_secs()),
        }
    }
}

fn non_empty(value: &Option<String>) -> Option<String> {
    value.as_ref().filter(|v| !v.is_empty()).cloned()
}

/// Serializable view of an [`IdentityRecord`] shared with collaborators.
///
/// Empty strings are omitted entirely.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct IdentitySnapshot {
    #[serde(rename = "mid", default, skip_serializing_if = "Option::is_none")]
    pub primary_id: Option<String>,
    #[serde(rename = "advertisingidentifier", default, skip_serializing_if = "Option::is_none")]
    pub advertising_id: Option<String>,
    #[serde(rename = "pushidentifier", default, skip_serializing_if = "Option::is_none")]
    pub push_token: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub blob: Option<String>,
    #[serde(rename = "locationhint", default, skip_serializing_if = "Option::is_none")]
    pub location_hint: Option<String>,
    #[serde(rename = "visitoridslist", default, skip_serializing_if = "Vec::is_empty")]
    pub custom_identities: Vec<CustomIdentity>,
    #[serde(rename = "lastsync", default, skip_serializing_if = "Option::is_none")]
    pub last_sync_secs: Option<u64>,
}
