//! Privacy (consent) status.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Global privacy status governing whether identities may be synced.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PrivacyStatus {
    #[serde(rename = "optedin")]
    OptedIn,
    #[serde(rename = "optedout")]
    OptedOut,
    #[default]
    #[serde(rename = "unknown", alias = "optunknown")]
    Unknown,
}

impl PrivacyStatus {
    /// Raw value used in configuration maps and persisted records.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::OptedIn => "optedin",
            Self::OptedOut => "optedout",
            Self::Unknown => "unknown",
        }
    }

    /// Lenient parse: unrecognized values map to `Unknown`.
    #[must_use]
    pub fn from_raw(raw: &str) -> Self {
        raw.parse().unwrap_or_default()
    }

    #[must_use]
    pub const fn is_opted_out(self) -> bool {
        matches!(self, Self::OptedOut)
    }
}

impl fmt::Display for PrivacyStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for PrivacyStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "optedin" | "opted_in" | "opt-in" => Ok(Self::OptedIn),
            "optedout" | "opted_out" | "opt-out" => Ok(Self::OptedOut),
            "unknown" | "optunknown" => Ok(Self::Unknown),
            other => Err(format!("unknown privacy status: {other}")),
        }
    }
}
