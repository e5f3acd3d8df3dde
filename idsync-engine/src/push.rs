//! Push token change tracking.

use idsync_storage::{KeyValueStore, KeyValueStoreExt, StorageResult};
use std::sync::Arc;
use tracing::debug;

/// Whether the last reported push status was "enabled".
pub const PUSH_ENABLED_KEY: &str = "push.enabled";
/// Whether a push status has been reported at least once.
pub const PUSH_STATUS_SYNCED_KEY: &str = "analytics.push.sync";

/// Decides when a push token change should be reported as a push opt-in
/// status change. Flags persist across restarts.
pub struct PushIdManager {
    store: Arc<dyn KeyValueStore>,
}

impl PushIdManager {
    pub fn new(store: Arc<dyn KeyValueStore>) -> Self {
        Self { store }
    }

    /// Records a push token update against the previously stored token.
    ///
    /// Returns `Some(enabled)` when a push status change should be emitted.
    /// An unchanged non-empty token is ignored; an empty token is reported
    /// once even if nothing was stored before.
    pub fn update_push_id(
        &self,
        existing: Option<&str>,
        new: Option<&str>,
    ) -> StorageResult<Option<bool>> {
        let existing = existing.unwrap_or_default();
        let new = new.unwrap_or_default();
        let status_synced = self.store.get_flag(PUSH_STATUS_SYNCED_KEY)?;

        if existing == new && (!new.is_empty() || status_synced) {
            debug!("push token unchanged, status not re-sent");
            return Ok(None);
        }
        self.store.set_flag(PUSH_STATUS_SYNCED_KEY, true)?;

        let enabled = self.store.get_flag(PUSH_ENABLED_KEY)?;
        let report = match (new.is_empty(), enabled) {
            (true, _) => Some(false),
            (false, false) => Some(true),
            (false, true) => None,
        };
        if let Some(enabled) = report {
            self.store.set_flag(PUSH_ENABLED_KEY, enabled)?;
        }
        Ok(report)
    }

    /// Whether push is currently reported as enabled.
    pub fn is_enabled(&self) -> StorageResult<bool> {
        self.store.get_flag(PUSH_ENABLED_KEY)
    }

    /// Forgets both flags (used on opt-out and identity reset).
    pub fn reset_flags(&self) -> StorageResult<()> {
        self.store.set_flag(PUSH_ENABLED_KEY, false)?;
        self.store.set_flag(PUSH_STATUS_SYNCED_KEY, false)
    }
}
