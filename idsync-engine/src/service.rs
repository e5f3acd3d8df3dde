//! Serialized host for the identity engine.
//!
//! [`IdentityService::spawn`] wires the stores, queue, processor and engine
//! together and runs a single task that owns the engine. Commands from
//! [`IdentityHandle`]s and finished hits are handled one at a time, so the
//! engine never sees interleaved mutations.
//!
//! The service also acts as the engine's host: events the engine addresses
//! to the host (`SyncRequested`, `ConfigurationUpdate`) are fed straight
//! back in after being forwarded to the subscriber.

use crate::config::{EngineConfig, RemoteConfig};
use crate::engine::IdentityEngine;
use crate::error::{EngineError, EngineResult};
use crate::events::{EngineEvent, PrivacyChangeRequest, SyncRequest};
use crate::processor::{HitResponseNotification, IdentityHitProcessor};
use crate::queue::HitQueue;
use crate::transport::HttpTransport;
use idsync_storage::{HitStore, KeyValueStore};
use idsync_types::{EventRef, IdentitySnapshot, PrivacyStatus};
use std::collections::VecDeque;
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, warn};

/// Commands accepted by the service task.
#[derive(Debug)]
pub enum EngineCommand {
    SyncIdentifiers {
        request: SyncRequest,
        config: Option<RemoteConfig>,
        reply: oneshot::Sender<Option<IdentitySnapshot>>,
    },
    UpdateConfiguration {
        config: RemoteConfig,
        reply: oneshot::Sender<()>,
    },
    PrivacyChange {
        request: PrivacyChangeRequest,
        reply: oneshot::Sender<()>,
    },
    ResetIdentities {
        event_ref: EventRef,
        reply: oneshot::Sender<Option<IdentitySnapshot>>,
    },
    AnalyticsId {
        analytics_id: String,
        reply: oneshot::Sender<()>,
    },
    Snapshot {
        reply: oneshot::Sender<IdentitySnapshot>,
    },
    UrlVariables {
        analytics_id: Option<String>,
        visitor_id: Option<String>,
        reply: oneshot::Sender<String>,
    },
    AppendVisitorInfo {
        base_url: String,
        analytics_id: Option<String>,
        visitor_id: Option<String>,
        reply: oneshot::Sender<String>,
    },
    QueuedHits {
        reply: oneshot::Sender<EngineResult<usize>>,
    },
    Shutdown {
        reply: oneshot::Sender<()>,
    },
}

/// Options for the consent flow around opt-out.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ServiceOptions {
    /// Another component sends opt-out requests; skip the opt-out ping.
    pub opt_out_handled_elsewhere: bool,
}

/// Entry point for running the engine.
pub struct IdentityService;

impl IdentityService {
    /// Spawns the service with default options.
    ///
    /// Must be called from within a Tokio runtime.
    pub fn spawn(
        config: EngineConfig,
        store: Arc<dyn KeyValueStore>,
        hit_store: Arc<dyn HitStore>,
        transport: Arc<dyn HttpTransport>,
    ) -> (IdentityHandle, mpsc::UnboundedReceiver<EngineEvent>) {
        Self::spawn_with_options(config, ServiceOptions::default(), store, hit_store, transport)
    }

    /// Spawns the service task and returns a handle plus the event stream.
    pub fn spawn_with_options(
        config: EngineConfig,
        options: ServiceOptions,
        store: Arc<dyn KeyValueStore>,
        hit_store: Arc<dyn HitStore>,
        transport: Arc<dyn HttpTransport>,
    ) -> (IdentityHandle, mpsc::UnboundedReceiver<EngineEvent>) {
        let (response_tx, response_rx) = mpsc::unbounded_channel();
        let processor = IdentityHitProcessor::new(
            Arc::clone(&transport),
            response_tx,
            config.retry_interval(),
            config.timeout(),
        );
        let queue = HitQueue::new(hit_store, Arc::new(processor), config.queue_capacity);

        let (engine_tx, engine_rx) = mpsc::unbounded_channel();
        let mut engine = IdentityEngine::new(config, store, queue, transport, engine_tx);
        engine.boot();

        let (command_tx, command_rx) = mpsc::channel(64);
        let (event_tx, event_rx) = mpsc::unbounded_channel();

        let actor = ServiceActor {
            engine,
            options,
            engine_rx,
            event_tx,
            pending: VecDeque::new(),
        };
        tokio::spawn(actor.run(command_rx, response_rx));

        (IdentityHandle { commands: command_tx }, event_rx)
    }
}

/// Work the engine asked its host to do.
enum HostTask {
    Sync(SyncRequest),
    Privacy(PrivacyStatus),
}

struct ServiceActor {
    engine: IdentityEngine,
    options: ServiceOptions,
    engine_rx: mpsc::UnboundedReceiver<EngineEvent>,
    event_tx: mpsc::UnboundedSender<EngineEvent>,
    pending: VecDeque<HostTask>,
}

impl ServiceActor {
    async fn run(
        mut self,
        mut commands: mpsc::Receiver<EngineCommand>,
        mut responses: mpsc::UnboundedReceiver<HitResponseNotification>,
    ) {
        self.pump();
        loop {
            tokio::select! {
                biased;

                command = commands.recv() => {
                    match command {
                        Some(EngineCommand::Shutdown { reply }) => {
                            self.engine.queue().close();
                            let _ = reply.send(());
                            break;
                        }
                        Some(command) => self.handle(command),
                        None => break,
                    }
                }

                Some(notification) = responses.recv() => {
                    self.engine.on_hit_response(&notification);
                }
            }
            self.pump();
        }
        info!("identity service stopped");
    }

    fn handle(&mut self, command: EngineCommand) {
        match command {
            EngineCommand::SyncIdentifiers { request, config, reply } => {
                let snapshot = self.sync(request, config.as_ref());
                let _ = reply.send(snapshot);
            }
            EngineCommand::UpdateConfiguration { config, reply } => {
                self.update_configuration(&config);
                let _ = reply.send(());
            }
            EngineCommand::PrivacyChange { request, reply } => {
                debug!(
                    status = %request.status,
                    event_ref = %request.event_ref,
                    "privacy change requested"
                );
                self.update_configuration(&RemoteConfig::default().with_privacy(request.status));
                let _ = reply.send(());
            }
            EngineCommand::ResetIdentities { event_ref, reply } => {
                let _ = reply.send(self.engine.reset_identities(event_ref));
            }
            EngineCommand::AnalyticsId { analytics_id, reply } => {
                self.engine.on_analytics_id(&analytics_id);
                let _ = reply.send(());
            }
            EngineCommand::Snapshot { reply } => {
                let _ = reply.send(self.engine.snapshot());
            }
            EngineCommand::UrlVariables { analytics_id, visitor_id, reply } => {
                let vars = self
                    .engine
                    .url_variables(analytics_id.as_deref(), visitor_id.as_deref());
                let _ = reply.send(vars);
            }
            EngineCommand::AppendVisitorInfo { base_url, analytics_id, visitor_id, reply } => {
                let url = self.engine.append_visitor_info(
                    &base_url,
                    analytics_id.as_deref(),
                    visitor_id.as_deref(),
                );
                let _ = reply.send(url);
            }
            EngineCommand::QueuedHits { reply } => {
                let _ = reply.send(self.engine.queue().count().map_err(EngineError::from));
            }
            EngineCommand::Shutdown { reply } => {
                let _ = reply.send(());
            }
        }
    }

    fn sync(
        &mut self,
        request: SyncRequest,
        config: Option<&RemoteConfig>,
    ) -> Option<IdentitySnapshot> {
        if let Some(config) = config {
            self.engine.bootstrap(config);
        }
        let snapshot = self.engine.on_sync_request(&request, config);
        if let Some(snapshot) = &snapshot {
            self.forward(EngineEvent::IdentityUpdated(snapshot.clone()));
        }
        snapshot
    }

    /// Opt-out ping first (the wipe would erase the primary id), then the
    /// privacy transition, then the cached config, then bootstrap.
    fn update_configuration(&mut self, config: &RemoteConfig) {
        if let Some(privacy) = config.privacy {
            if privacy.is_opted_out() {
                self.engine
                    .on_opt_out_check(Some(config), self.options.opt_out_handled_elsewhere);
            }
            self.engine.on_privacy_change(privacy, Some(config));
        }
        if config.is_valid() {
            self.engine.update_last_valid_config(config.clone());
        }
        if !self.engine.has_synced() {
            self.engine.bootstrap(config);
        }
    }

    /// Forwards engine events and runs any host work they request, until
    /// nothing is left.
    fn pump(&mut self) {
        loop {
            while let Ok(event) = self.engine_rx.try_recv() {
                match &event {
                    EngineEvent::SyncRequested(request) => {
                        self.pending.push_back(HostTask::Sync(request.clone()));
                    }
                    EngineEvent::ConfigurationUpdate { privacy } => {
                        self.pending.push_back(HostTask::Privacy(*privacy));
                    }
                    _ => {}
                }
                self.forward(event);
            }

            let Some(task) = self.pending.pop_front() else {
                return;
            };
            match task {
                HostTask::Sync(request) => {
                    self.sync(request, None);
                }
                HostTask::Privacy(privacy) => {
                    debug!(%privacy, "applying privacy update requested by the identity service");
                    let config = match self.engine.last_valid_config() {
                        Some(cached) => cached.clone().with_privacy(privacy),
                        None => RemoteConfig::default().with_privacy(privacy),
                    };
                    self.update_configuration(&config);
                }
            }
        }
    }

    fn forward(&self, event: EngineEvent) {
        if self.event_tx.send(event).is_err() {
            debug!("identity event subscriber dropped");
        }
    }
}

/// Cloneable handle to a running [`IdentityService`].
#[derive(Clone)]
pub struct IdentityHandle {
    commands: mpsc::Sender<EngineCommand>,
}

impl IdentityHandle {
    async fn call<T>(
        &self,
        make: impl FnOnce(oneshot::Sender<T>) -> EngineCommand,
    ) -> EngineResult<T> {
        let (reply, rx) = oneshot::channel();
        self.commands
            .send(make(reply))
            .await
            .map_err(|_| EngineError::ChannelClosed)?;
        rx.await.map_err(|_| EngineError::ChannelClosed)
    }

    /// Records identities and syncs them if needed. `None` means the
    /// request was deferred (no configuration) or blocked (opted out).
    pub async fn sync_identifiers(
        &self,
        request: SyncRequest,
        config: Option<RemoteConfig>,
    ) -> EngineResult<Option<IdentitySnapshot>> {
        self.call(|reply| EngineCommand::SyncIdentifiers { request, config, reply })
            .await
    }

    /// Applies a new remote configuration, including any privacy change.
    pub async fn update_configuration(&self, config: RemoteConfig) -> EngineResult<()> {
        self.call(|reply| EngineCommand::UpdateConfiguration { config, reply })
            .await
    }

    /// Changes only the privacy status.
    pub async fn set_privacy_status(&self, status: PrivacyStatus) -> EngineResult<()> {
        let request = PrivacyChangeRequest::new(status);
        self.call(|reply| EngineCommand::PrivacyChange { request, reply })
            .await
    }

    pub async fn reset_identities(&self) -> EngineResult<Option<IdentitySnapshot>> {
        let event_ref = EventRef::new();
        self.call(|reply| EngineCommand::ResetIdentities { event_ref, reply })
            .await
    }

    /// Reports the analytics tracking id.
    pub async fn analytics_id(&self, analytics_id: impl Into<String>) -> EngineResult<()> {
        let analytics_id = analytics_id.into();
        self.call(|reply| EngineCommand::AnalyticsId { analytics_id, reply })
            .await
    }

    pub async fn snapshot(&self) -> EngineResult<IdentitySnapshot> {
        self.call(|reply| EngineCommand::Snapshot { reply }).await
    }

    pub async fn url_variables(
        &self,
        analytics_id: Option<String>,
        visitor_id: Option<String>,
    ) -> EngineResult<String> {
        self.call(|reply| EngineCommand::UrlVariables { analytics_id, visitor_id, reply })
            .await
    }

    pub async fn append_visitor_info(
        &self,
        base_url: impl Into<String>,
        analytics_id: Option<String>,
        visitor_id: Option<String>,
    ) -> EngineResult<String> {
        let base_url = base_url.into();
        self.call(|reply| EngineCommand::AppendVisitorInfo {
            base_url,
            analytics_id,
            visitor_id,
            reply,
        })
        .await
    }

    /// Number of hits waiting in the queue.
    pub async fn queued_hits(&self) -> EngineResult<usize> {
        self.call(|reply| EngineCommand::QueuedHits { reply }).await?
    }

    /// Stops the service task and the queue worker.
    pub async fn shutdown(&self) -> EngineResult<()> {
        match self.call(|reply| EngineCommand::Shutdown { reply }).await {
            Ok(()) | Err(EngineError::ChannelClosed) => Ok(()),
            Err(e) => {
                warn!(error = %e, "identity service shutdown failed");
                Err(e)
            }
        }
    }
}
