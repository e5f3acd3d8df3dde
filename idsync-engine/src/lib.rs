//! Identity sync engine for idsync.
//!
//! Tracks a device's identities and keeps them reconciled with a remote
//! identity service, honoring the current privacy status.
//!
//! # Architecture
//!
//! - **Codec**: builds sync and opt-out URLs, parses sync responses
//! - **Queue**: durable FIFO of hits drained by one background worker
//! - **Processor**: sends one hit and classifies the outcome
//! - **Engine**: owns the identity record and every sync decision
//! - **Service**: a single task that serializes access to the engine
//!
//! ## Sync Process
//!
//! 1. **Request**: a caller submits identities through an [`IdentityHandle`]
//! 2. **Decide**: the engine merges them and decides whether a sync is due
//! 3. **Queue**: the sync URL is appended to the durable hit queue
//! 4. **Send**: the queue worker sends it, retrying transient failures
//! 5. **Apply**: the response flows back into the engine and out as events
//!
//! # Example
//!
//! ```no_run
//! use idsync_engine::{EngineConfig, IdentityService, RemoteConfig, ReqwestTransport, SyncRequest};
//! use idsync_storage::{SqliteHitStore, SqliteKeyValueStore};
//! use idsync_types::PrivacyStatus;
//! use std::path::Path;
//! use std::sync::Arc;
//!
//! # async fn run() -> Result<(), Box<dyn std::error::Error>> {
//! let config = EngineConfig::default();
//! let path = Path::new("identity.db");
//! let store = Arc::new(SqliteKeyValueStore::open(path, &config.datastore_name)?);
//! let hits = Arc::new(SqliteHitStore::open(path, &config.datastore_name)?);
//! let transport = Arc::new(ReqwestTransport::new(config.timeout())?);
//!
//! let (handle, _events) = IdentityService::spawn(config, store, hits, transport);
//! let remote = RemoteConfig::new("myOrg@AdobeOrg").with_privacy(PrivacyStatus::OptedIn);
//! handle.update_configuration(remote).await?;
//! handle.sync_identifiers(SyncRequest::new().with_identifier("crm", "user-1"), None).await?;
//! # Ok(())
//! # }
//! ```

pub mod codec;
mod config;
mod engine;
mod error;
mod events;
pub mod processor;
mod push;
pub mod queue;
mod service;
pub mod transport;

pub use codec::{SyncResponse, VisitorInfo};
pub use config::{DEFAULT_SERVER, EngineConfig, ORG_ID_KEY, PRIVACY_KEY, RemoteConfig, SERVER_KEY};
pub use engine::{IdentityEngine, RECORD_KEY};
pub use error::{CodecError, EngineError, EngineResult, QueueError};
pub use events::{ANALYTICS_ID_TYPE, EngineEvent, PrivacyChangeRequest, SyncRequest};
pub use processor::{HitOutcome, HitResponseNotification, IdentityHitProcessor, QueuedHit};
pub use push::{PUSH_ENABLED_KEY, PUSH_STATUS_SYNCED_KEY, PushIdManager};
pub use queue::{HitProcessing, HitQueue, QueueResult};
pub use service::{EngineCommand, IdentityHandle, IdentityService, ServiceOptions};
pub use transport::{HttpResponse, HttpTransport, NetworkRequest, ReqwestTransport, TransportError};
