//! Custom identities attached to the device record.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Origin tag for the advertising identity.
pub const AD_ID_ORIGIN: &str = "d_cid_ic";

/// Identity type used for the advertising identifier.
pub const AD_ID_TYPE: &str = "DSID_20915";

/// Advertising id reported by devices with ad tracking disabled.
/// Treated the same as an empty advertising id.
pub const ZERO_ADVERTISING_ID: &str = "00000000-0000-0000-0000-000000000000";

/// Authentication state of a custom identity.
///
/// Encoded on the wire and on disk as a small integer.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(into = "u8", try_from = "u8")]
pub enum AuthenticationState {
    #[default]
    Unknown,
    Authenticated,
    LoggedOut,
}

impl AuthenticationState {
    /// Integer code used in sync URLs.
    #[must_use]
    pub const fn code(self) -> u8 {
        match self {
            Self::Unknown => 0,
            Self::Authenticated => 1,
            Self::LoggedOut => 2,
        }
    }

    /// Maps an integer code back to a state. Unrecognized codes are `Unknown`.
    #[must_use]
    pub const fn from_code(code: u8) -> Self {
        match code {
            1 => Self::Authenticated,
            2 => Self::LoggedOut,
            _ => Self::Unknown,
        }
    }
}

impl From<AuthenticationState> for u8 {
    fn from(state: AuthenticationState) -> Self {
        state.code()
    }
}

impl TryFrom<u8> for AuthenticationState {
    type Error = std::convert::Infallible;

    fn try_from(code: u8) -> Result<Self, Self::Error> {
        Ok(Self::from_code(code))
    }
}

impl fmt::Display for AuthenticationState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.code())
    }
}

/// A caller-supplied identifier in a named namespace (`id_type`).
///
/// Two identities occupy the same slot in a record when their types match;
/// see [`CustomIdentity::same_slot`]. Derived equality compares every field.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CustomIdentity {
    #[serde(rename = "id_origin", default, skip_serializing_if = "Option::is_none")]
    pub origin: Option<String>,
    pub id_type: String,
    #[serde(rename = "id", default, skip_serializing_if = "Option::is_none")]
    pub identifier: Option<String>,
    #[serde(default)]
    pub authentication_state: AuthenticationState,
}

impl CustomIdentity {
    /// Creates an identity with the default `d_cid_ic` origin.
    #[must_use]
    pub fn new(
        id_type: impl Into<String>,
        identifier: impl Into<String>,
        authentication_state: AuthenticationState,
    ) -> Self {
        Self {
            origin: Some(AD_ID_ORIGIN.to_owned()),
            id_type: id_type.into(),
            identifier: Some(identifier.into()),
            authentication_state,
        }
    }

    /// Builds the advertising identity for `ad_id`.
    ///
    /// The all-zero advertising id is normalized to an empty identifier.
    #[must_use]
    pub fn advertising(ad_id: &str) -> Self {
        let ad_id = if ad_id == ZERO_ADVERTISING_ID { "" } else { ad_id };
        Self::new(AD_ID_TYPE, ad_id, AuthenticationState::Authenticated)
    }

    /// True when both identities live in the same record slot (same type).
    #[must_use]
    pub fn same_slot(&self, other: &Self) -> bool {
        self.id_type == other.id_type
    }

    /// True when both identities carry the same identifier value.
    #[must_use]
    pub fn same_identifier(&self, other: &Self) -> bool {
        self.identifier == other.identifier
    }

    /// True when the identifier is present and non-empty.
    #[must_use]
    pub fn has_identifier(&self) -> bool {
        self.identifier.as_deref().is_some_and(|id| !id.is_empty())
    }

    /// The identifier, or the empty string when absent.
    #[must_use]
    pub fn identifier_str(&self) -> &str {
        self.identifier.as_deref().unwrap_or_default()
    }
}
