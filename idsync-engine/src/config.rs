//! Engine and remote configuration.

use idsync_types::{DEFAULT_TTL_SECONDS, PrivacyStatus};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::Duration;

/// Identity service host used when the remote configuration names none.
pub const DEFAULT_SERVER: &str = "dpm.demdex.net";

/// Configuration key for the organization id.
pub const ORG_ID_KEY: &str = "experienceCloud.org";
/// Configuration key for the identity service host.
pub const SERVER_KEY: &str = "experienceCloud.server";
/// Configuration key for the global privacy status.
pub const PRIVACY_KEY: &str = "global.privacy";

/// Local engine settings, fixed for the lifetime of a service.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Namespace for the persisted identity record and queue.
    pub datastore_name: String,
    /// Fallback identity service host.
    pub default_server: String,
    /// TTL applied when a response carries none.
    pub default_ttl_secs: u64,
    /// Delay before a recoverable hit is retried.
    pub retry_interval_secs: u64,
    /// Connect and read timeout for sync hits (ms).
    pub timeout_ms: u64,
    /// Maximum queued hits; `None` means unbounded.
    pub queue_capacity: Option<usize>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            datastore_name: "idsync.identity".to_string(),
            default_server: DEFAULT_SERVER.to_string(),
            default_ttl_secs: DEFAULT_TTL_SECONDS,
            retry_interval_secs: 30,
            timeout_ms: 2_000,
            queue_capacity: None,
        }
    }
}

impl EngineConfig {
    #[must_use]
    pub fn retry_interval(&self) -> Duration {
        Duration::from_secs(self.retry_interval_secs)
    }

    #[must_use]
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

/// Remote configuration as last published by the host.
///
/// Any field may be missing while the host is still starting up.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteConfig {
    #[serde(default)]
    pub org_id: Option<String>,
    #[serde(default)]
    pub server: Option<String>,
    #[serde(default)]
    pub privacy: Option<PrivacyStatus>,
}

impl RemoteConfig {
    /// Convenience constructor for a config with an org id.
    #[must_use]
    pub fn new(org_id: impl Into<String>) -> Self {
        Self {
            org_id: Some(org_id.into()),
            ..Self::default()
        }
    }

    #[must_use]
    pub fn with_server(mut self, server: impl Into<String>) -> Self {
        self.server = Some(server.into());
        self
    }

    #[must_use]
    pub fn with_privacy(mut self, privacy: PrivacyStatus) -> Self {
        self.privacy = Some(privacy);
        self
    }

    /// Reads the host's flat configuration map.
    #[must_use]
    pub fn from_map(map: &HashMap<String, String>) -> Self {
        Self {
            org_id: map.get(ORG_ID_KEY).cloned(),
            server: map.get(SERVER_KEY).cloned(),
            privacy: map.get(PRIVACY_KEY).map(|raw| PrivacyStatus::from_raw(raw)),
        }
    }

    /// A config is usable once it carries a non-empty org id.
    #[must_use]
    pub fn is_valid(&self) -> bool {
        self.org_id.as_deref().is_some_and(|org| !org.is_empty())
    }

    /// The org id, or empty when absent.
    #[must_use]
    pub fn org_id(&self) -> &str {
        self.org_id.as_deref().unwrap_or_default()
    }

    /// Privacy status, `Unknown` when the host has not set one.
    #[must_use]
    pub fn privacy_status(&self) -> PrivacyStatus {
        self.privacy.unwrap_or_default()
    }

    /// Whether a sync may be sent under this config.
    #[must_use]
    pub fn can_sync(&self) -> bool {
        self.is_valid() && !self.privacy_status().is_opted_out()
    }

    /// The configured server, or `default` when absent or empty.
    #[must_use]
    pub fn effective_server<'a>(&'a self, default: &'a str) -> &'a str {
        match self.server.as_deref() {
            Some(server) if !server.is_empty() => server,
            _ => default,
        }
    }
}
