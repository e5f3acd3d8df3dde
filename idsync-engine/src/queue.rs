//! Persistent hit queue with a single background drain worker.
//!
//! Items are appended durably and processed strictly in FIFO order, one at
//! a time. A processor answers `true` (done, remove the item) or `false`
//! (keep it at the head and try again after the processor's retry interval).
//! The queue starts suspended; the host starts it once privacy allows.

use crate::error::QueueError;
use async_trait::async_trait;
use idsync_storage::{DataEntity, HitStore};
use idsync_types::PrivacyStatus;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::sync::{Notify, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Delay before re-reading the store after it reported an error.
const STORE_ERROR_BACKOFF: Duration = Duration::from_secs(1);

/// Result type for queue operations.
pub type QueueResult<T> = Result<T, QueueError>;

/// Processes one queued item at a time.
#[async_trait]
pub trait HitProcessing: Send + Sync {
    /// How long to wait before retrying `entity` after a `false` result.
    fn retry_interval(&self, entity: &DataEntity) -> Duration;

    /// Processes `entity`. Returns `true` when the item is finished (sent or
    /// unrecoverable) and `false` when it should be retried.
    async fn process(&self, entity: &DataEntity) -> bool;
}

/// Drain worker state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum DrainState {
    Suspended,
    Running,
    Closed,
}

struct Shared {
    store: Arc<dyn HitStore>,
    capacity: Option<usize>,
    state: watch::Sender<DrainState>,
    wake: Notify,
    /// Serializes store mutations so a finished item is only removed while
    /// it is still the head.
    head_lock: Mutex<()>,
}

/// A durable FIFO drained by a background task.
pub struct HitQueue {
    shared: Arc<Shared>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl HitQueue {
    /// Creates a suspended queue over `store` and spawns its drain task.
    ///
    /// Must be called from within a Tokio runtime.
    pub fn new(
        store: Arc<dyn HitStore>,
        processor: Arc<dyn HitProcessing>,
        capacity: Option<usize>,
    ) -> Self {
        let (state, state_rx) = watch::channel(DrainState::Suspended);
        let shared = Arc::new(Shared {
            store,
            capacity,
            state,
            wake: Notify::new(),
            head_lock: Mutex::new(()),
        });
        let worker = tokio::spawn(drain(Arc::clone(&shared), processor, state_rx));
        Self {
            shared,
            worker: Mutex::new(Some(worker)),
        }
    }

    /// Appends an item durably and wakes the worker.
    pub fn enqueue(&self, entity: DataEntity) -> QueueResult<()> {
        if *self.shared.state.borrow() == DrainState::Closed {
            return Err(QueueError::Closed);
        }
        {
            let _guard = self.shared.head_lock.lock().unwrap_or_else(PoisonError::into_inner);
            if let Some(capacity) = self.shared.capacity {
                if self.shared.store.count()? >= capacity {
                    return Err(QueueError::Full { capacity });
                }
            }
            self.shared.store.append(&entity)?;
        }
        debug!(id = %entity.unique_id, "hit queued");
        self.shared.wake.notify_one();
        Ok(())
    }

    /// Allows the worker to dequeue.
    pub fn start(&self) {
        self.transition(DrainState::Running);
    }

    /// Stops the worker from dequeuing. Queued items are kept and an
    /// in-flight item is allowed to finish.
    pub fn suspend(&self) {
        self.transition(DrainState::Suspended);
    }

    /// Removes every queued item.
    pub fn clear(&self) -> QueueResult<()> {
        let _guard = self.shared.head_lock.lock().unwrap_or_else(PoisonError::into_inner);
        self.shared.store.clear()?;
        Ok(())
    }

    /// Number of queued items, including one in flight.
    pub fn count(&self) -> QueueResult<usize> {
        Ok(self.shared.store.count()?)
    }

    /// Whether the worker is currently allowed to dequeue.
    #[must_use]
    pub fn is_running(&self) -> bool {
        *self.shared.state.borrow() == DrainState::Running
    }

    /// Maps a privacy status onto the queue: opted in runs, opted out
    /// clears and suspends, unknown suspends but keeps items.
    pub fn apply_privacy_policy(&self, status: PrivacyStatus) -> QueueResult<()> {
        match status {
            PrivacyStatus::OptedIn => self.start(),
            PrivacyStatus::OptedOut => {
                self.clear()?;
                self.suspend();
            }
            PrivacyStatus::Unknown => self.suspend(),
        }
        Ok(())
    }

    /// Stops the worker for good. Items stay in the store for the next run.
    pub fn close(&self) {
        self.shared.state.send_replace(DrainState::Closed);
        let handle = self.worker.lock().unwrap_or_else(PoisonError::into_inner).take();
        if let Some(handle) = handle {
            handle.abort();
        }
    }

    fn transition(&self, next: DrainState) {
        self.shared.state.send_if_modified(|state| {
            if *state == DrainState::Closed || *state == next {
                return false;
            }
            *state = next;
            true
        });
    }
}

impl Drop for HitQueue {
    fn drop(&mut self) {
        self.close();
    }
}

async fn drain(
    shared: Arc<Shared>,
    processor: Arc<dyn HitProcessing>,
    mut state: watch::Receiver<DrainState>,
) {
    loop {
        // Wait until running.
        loop {
            match *state.borrow_and_update() {
                DrainState::Running => break,
                DrainState::Closed => return,
                DrainState::Suspended => {}
            }
            if state.changed().await.is_err() {
                return;
            }
        }

        let store = Arc::clone(&shared.store);
        let head = match tokio::task::spawn_blocking(move || store.peek(1)).await {
            Ok(Ok(mut items)) => items.pop(),
            Ok(Err(e)) => {
                warn!(error = %e, "failed to read hit queue");
                tokio::time::sleep(STORE_ERROR_BACKOFF).await;
                continue;
            }
            Err(e) => {
                warn!(error = %e, "spawn_blocking panicked reading hit queue");
                tokio::time::sleep(STORE_ERROR_BACKOFF).await;
                continue;
            }
        };

        let Some(entity) = head else {
            tokio::select! {
                _ = shared.wake.notified() => {}
                changed = state.changed() => {
                    if changed.is_err() {
                        return;
                    }
                }
            }
            continue;
        };

        if processor.process(&entity).await {
            let task_shared = Arc::clone(&shared);
            let id = entity.unique_id.clone();
            if let Err(e) =
                tokio::task::spawn_blocking(move || remove_if_head(&task_shared, &id)).await
            {
                warn!(id = %entity.unique_id, error = %e, "spawn_blocking panicked removing hit");
            }
            continue;
        }

        let delay = processor.retry_interval(&entity);
        debug!(id = %entity.unique_id, ?delay, "hit will be retried");
        let sleep = tokio::time::sleep(delay);
        tokio::pin!(sleep);
        loop {
            tokio::select! {
                _ = &mut sleep => break,
                changed = state.changed() => {
                    if changed.is_err() || *state.borrow() == DrainState::Closed {
                        return;
                    }
                }
            }
        }
    }
}

/// Runs on the blocking pool.
fn remove_if_head(shared: &Shared, id: &str) {
    let _guard = shared.head_lock.lock().unwrap_or_else(PoisonError::into_inner);
    let still_head = match shared.store.peek(1) {
        Ok(items) => items.first().is_some_and(|head| head.unique_id == id),
        Err(e) => {
            warn!(id, error = %e, "failed to read hit queue head");
            return;
        }
    };
    if !still_head {
        info!(id, "queue changed while hit was in flight");
        return;
    }
    if let Err(e) = shared.store.remove(1) {
        warn!(id, error = %e, "failed to remove processed hit");
    }
}
