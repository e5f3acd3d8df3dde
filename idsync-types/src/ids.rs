//! Identifier types used throughout the idsync core.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

use crate::Error;

/// Number of decimal digits in a primary id.
const PRIMARY_ID_LEN: usize = 38;

/// The long-lived device identifier (ECID), 38 decimal digits.
///
/// Generated once from 128 random bits: each 64-bit half is read as a signed
/// integer, its magnitude is taken and written zero-padded to 19 digits.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct PrimaryId(String);

impl PrimaryId {
    /// Generates a fresh primary id from a random UUID.
    #[must_use]
    pub fn generate() -> Self {
        Self::from_uuid(Uuid::new_v4())
    }

    /// Derives a primary id from the bytes of an existing UUID.
    #[must_use]
    pub fn from_uuid(uuid: Uuid) -> Self {
        let (high, low) = uuid.as_u64_pair();
        let most = (high as i64).unsigned_abs();
        let least = (low as i64).unsigned_abs();
        Self(format!("{most:019}{least:019}"))
    }

    /// Parses a primary id, requiring exactly 38 ASCII digits.
    pub fn parse(s: &str) -> Result<Self, Error> {
        if s.len() == PRIMARY_ID_LEN && s.bytes().all(|b| b.is_ascii_digit()) {
            Ok(Self(s.to_owned()))
        } else {
            Err(Error::InvalidPrimaryId(s.to_owned()))
        }
    }

    /// Returns the id as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for PrimaryId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for PrimaryId {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl TryFrom<String> for PrimaryId {
    type Error = Error;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(&value)
    }
}

impl From<PrimaryId> for String {
    fn from(id: PrimaryId) -> Self {
        id.0
    }
}

impl PartialEq<str> for PrimaryId {
    fn eq(&self, other: &str) -> bool {
        self.0 == other
    }
}

/// Opaque reference to the event that originated a sync hit.
/// Uses UUID v7 so references sort by creation time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EventRef(Uuid);

impl EventRef {
    /// Creates a new event reference with the current timestamp.
    #[must_use]
    pub fn new() -> Self {
        Self(Uuid::now_v7())
    }

    /// Creates an event reference from an existing UUID.
    #[must_use]
    pub const fn from_uuid(uuid: Uuid) -> Self {
        Self(uuid)
    }

    /// Returns the underlying UUID.
    #[must_use]
    pub const fn as_uuid(&self) -> Uuid {
        self.0
    }

    /// Parses an event reference from a string.
    pub fn parse(s: &str) -> Result<Self, Error> {
        Ok(Self(Uuid::parse_str(s)?))
    }
}

impl Default for EventRef {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for EventRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for EventRef {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}
