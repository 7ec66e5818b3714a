//! PersistenceLayer - Durable Cell Values
//!
//! ## Responsibilities
//!
//! - Startup reload of persistent cells (stored value overrides default if it
//!   still validates; anything else falls back to the default)
//! - Debounced durable writes for persistent cells
//! - Retry with exponential backoff on write failure
//!
//! ## Design
//!
//! - Debounce queue: key -> latest pending value, so it is bounded by the number
//!   of persistent keys and enqueueing never blocks
//! - The queue has its own lock, independent of the cell map
//! - Durable failures never roll back or delay the in-memory write
//! - Shutdown is cooperative: the feed consumer drains what the store already
//!   emitted and the flusher finishes its current batch before the final flush

mod repository;

pub use repository::{MemoryRepository, PersistenceBackend, SqliteRepository};

use crate::error::Error;
use crate::state_store::{ChangeRecord, StateStore};
use crate::value::Value;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, Notify};
use tokio::task::JoinHandle;

/// Default coalescing window
pub const DEFAULT_DEBOUNCE_MS: u64 = 100;

/// Persistence timing
#[derive(Debug, Clone)]
pub struct PersistenceConfig {
    /// Writes to one key within this window collapse into one durable write
    pub debounce: Duration,
    /// First retry delay after a failed flush
    pub retry_base: Duration,
    /// Retry delay ceiling
    pub retry_max: Duration,
}

impl Default for PersistenceConfig {
    fn default() -> Self {
        Self {
            debounce: Duration::from_millis(DEFAULT_DEBOUNCE_MS),
            retry_base: Duration::from_millis(200),
            retry_max: Duration::from_secs(30),
        }
    }
}

#[derive(Debug, Clone)]
struct PendingWrite {
    value: serde_json::Value,
    version: u64,
    attempts: u32,
}

/// PersistenceLayer instance
pub struct PersistenceLayer {
    backend: Arc<dyn PersistenceBackend>,
    config: PersistenceConfig,
    pending: Mutex<HashMap<String, PendingWrite>>,
    wake: Notify,
    stop: watch::Sender<bool>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    written: AtomicU64,
    failures: AtomicU64,
}

impl PersistenceLayer {
    pub fn new(backend: Arc<dyn PersistenceBackend>, config: PersistenceConfig) -> Self {
        Self {
            backend,
            config,
            pending: Mutex::new(HashMap::new()),
            wake: Notify::new(),
            stop: watch::channel(false).0,
            tasks: Mutex::new(Vec::new()),
            written: AtomicU64::new(0),
            failures: AtomicU64::new(0),
        }
    }

    /// Override defaults of persistent cells with stored values.
    ///
    /// Returns the number of cells restored. Never fails: a missing, unreadable
    /// or no-longer-valid stored value leaves the default in place.
    pub async fn load_into(&self, store: &StateStore) -> usize {
        let mut restored = 0;

        for key in store.keys() {
            let persistent = store.spec(key).map(|spec| spec.persistent).unwrap_or(false);
            if !persistent {
                continue;
            }

            let stored = match self.backend.load(key).await {
                Ok(Some(json)) => json,
                Ok(None) => continue,
                Err(e) => {
                    tracing::warn!(key = %key, error = %e, "Failed to load stored value, using default");
                    continue;
                }
            };

            let Some(value) = Value::from_json(stored) else {
                tracing::warn!(key = %key, "Stored value has no cell representation, using default");
                continue;
            };

            match store.restore(key, value).await {
                Ok(()) => restored += 1,
                Err(e) => {
                    tracing::warn!(key = %key, error = %e, "Stored value rejected, using default");
                }
            }
        }

        tracing::info!(restored = restored, "Persistent cells loaded");
        restored
    }

    /// Queue a durable write; replaces any pending value for the same key
    pub fn enqueue(&self, record: &ChangeRecord) {
        self.pending.lock().insert(
            record.key.clone(),
            PendingWrite {
                value: record.new_value.to_json(),
                version: record.version,
                attempts: 0,
            },
        );
        self.wake.notify_one();
    }

    /// Write everything pending once. Returns the number of failed writes,
    /// which stay queued unless a newer value arrived meanwhile.
    pub async fn flush(&self) -> usize {
        let batch: Vec<(String, PendingWrite)> = self.pending.lock().drain().collect();
        let mut failed = 0;

        for (key, write) in batch {
            match self.backend.store(&key, &write.value).await {
                Ok(()) => {
                    self.written.fetch_add(1, Ordering::Relaxed);
                    tracing::debug!(key = %key, version = write.version, "Durable write complete");
                }
                Err(e) => {
                    failed += 1;
                    self.failures.fetch_add(1, Ordering::Relaxed);

                    let error = Error::PersistenceFailure {
                        key: key.clone(),
                        message: e.to_string(),
                    };
                    tracing::warn!(
                        error = %error,
                        version = write.version,
                        attempts = write.attempts + 1,
                        "Durable write failed, will retry"
                    );

                    self.pending.lock().entry(key).or_insert(PendingWrite {
                        attempts: write.attempts + 1,
                        ..write
                    });
                }
            }
        }

        failed
    }

    /// Start consuming the store's change feed (persistent keys only) and the
    /// debounce/retry flusher. Both run until `shutdown`.
    pub fn spawn(self: Arc<Self>, store: Arc<StateStore>) {
        let mut feed = store.change_feed();
        let mut stop = self.stop.subscribe();
        let layer = self.clone();

        let consumer = tokio::spawn(async move {
            loop {
                tokio::select! {
                    record = feed.recv() => match record {
                        Some(record) => layer.accept(&store, &record),
                        None => break,
                    },
                    _ = stopped(&mut stop) => {
                        while let Ok(record) = feed.try_recv() {
                            layer.accept(&store, &record);
                        }
                        break;
                    }
                }
            }
            tracing::debug!("Persistence feed consumer stopped");
        });

        tracing::info!(
            debounce_ms = self.config.debounce.as_millis() as u64,
            "Persistence flusher started"
        );

        let stop = self.stop.subscribe();
        let layer = self.clone();
        let flusher = tokio::spawn(async move { layer.run_flusher(stop).await });

        self.tasks.lock().extend([consumer, flusher]);
    }

    fn accept(&self, store: &StateStore, record: &ChangeRecord) {
        let persistent = store
            .spec(&record.key)
            .map(|spec| spec.persistent)
            .unwrap_or(false);
        if persistent {
            self.enqueue(record);
        }
    }

    /// Flush after each debounce window; back off while writes keep failing.
    /// Only ever stopped between flushes, never inside one.
    async fn run_flusher(&self, mut stop: watch::Receiver<bool>) {
        let mut backoff = self.config.retry_base;

        loop {
            tokio::select! {
                _ = self.wake.notified() => {}
                _ = stopped(&mut stop) => break,
            }
            tokio::select! {
                _ = tokio::time::sleep(self.config.debounce) => {}
                _ = stopped(&mut stop) => break,
            }

            if self.flush().await == 0 {
                backoff = self.config.retry_base;
                continue;
            }

            tokio::select! {
                _ = tokio::time::sleep(backoff) => {}
                _ = stopped(&mut stop) => break,
            }
            backoff = (backoff * 2).min(self.config.retry_max);
            self.wake.notify_one();
        }
        tracing::debug!("Persistence flusher stopped");
    }

    /// Stop the background tasks, wait for them, then flush what is left
    pub async fn shutdown(&self) {
        self.stop.send_replace(true);

        let tasks: Vec<JoinHandle<()>> = self.tasks.lock().drain(..).collect();
        for task in tasks {
            if let Err(e) = task.await {
                tracing::error!(error = %e, "Persistence task ended abnormally");
            }
        }

        let failed = self.flush().await;
        if failed > 0 {
            tracing::error!(failed = failed, "Pending durable writes lost at shutdown");
        } else {
            tracing::info!(written = self.written_count(), "Persistence flushed");
        }
    }

    pub fn pending_count(&self) -> usize {
        self.pending.lock().len()
    }

    pub fn written_count(&self) -> u64 {
        self.written.load(Ordering::Relaxed)
    }

    pub fn failure_count(&self) -> u64 {
        self.failures.load(Ordering::Relaxed)
    }
}

/// Resolves once shutdown has been requested
async fn stopped(stop: &mut watch::Receiver<bool>) {
    let _ = stop.wait_for(|stopping| *stopping).await;
}
