//! Core value types for the idsync identity core.
//!
//! This crate defines the plain data shared by storage and the engine:
//! - Primary ids (38-digit ECIDs) and event references
//! - Millisecond timestamps
//! - Custom identities and authentication states
//! - Privacy status
//! - The persisted `IdentityRecord` and its public snapshot
//!
//! Nothing here performs I/O.

mod identity;
mod ids;
mod privacy;
mod record;
mod timestamp;

pub use identity::{
    AD_ID_ORIGIN, AD_ID_TYPE, AuthenticationState, CustomIdentity, ZERO_ADVERTISING_ID,
};
pub use ids::{EventRef, PrimaryId};
pub use privacy::PrivacyStatus;
pub use record::{DEFAULT_TTL_SECONDS, IdentityRecord, IdentitySnapshot};
pub use timestamp::Timestamp;

/// Result type alias using the crate's error type.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur in type operations.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("invalid UUID: {0}")]
    InvalidUuid(#[from] uuid::Error),

    #[error("invalid primary id: {0}")]
    InvalidPrimaryId(String),
}
