//! RealtimeHub - Change Broadcast Distribution
//!
//! ## Responsibilities
//!
//! - Consume the StateStore change feed
//! - Fan each change out to every eligible subscription
//! - Per-connection bounded outbound queues with an overflow policy
//! - Connection lifecycle (see `Session`)
//!
//! The feed is consumed by one task, so every connection sees changes in the
//! order they were applied. Pushing onto a queue never waits on the network.

mod queue;
mod session;

pub use queue::{OutboundQueue, OverflowPolicy, PushOutcome};
pub use session::{ConnectionState, Session};

use crate::error::Error;
use crate::state_store::{ChangeRecord, StateStore};
use crate::subscription::SubscriptionRegistry;
use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use uuid::Uuid;

/// Default outbound queue capacity (messages)
pub const DEFAULT_QUEUE_CAPACITY: usize = 256;

/// Default window for a connection to authenticate
pub const DEFAULT_AUTH_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Clone)]
pub struct DispatcherConfig {
    pub queue_capacity: usize,
    pub overflow_policy: OverflowPolicy,
    pub auth_timeout: Duration,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            queue_capacity: DEFAULT_QUEUE_CAPACITY,
            overflow_policy: OverflowPolicy::default(),
            auth_timeout: DEFAULT_AUTH_TIMEOUT,
        }
    }
}

/// Dispatcher counters
#[derive(Debug, Clone, Serialize)]
pub struct DispatcherStats {
    pub connections: usize,
    pub delivered: u64,
    pub overflows: u64,
}

/// BroadcastDispatcher instance
pub struct BroadcastDispatcher {
    store: Arc<StateStore>,
    registry: Arc<SubscriptionRegistry>,
    config: DispatcherConfig,
    delivered: AtomicU64,
    overflows: AtomicU64,
}

impl BroadcastDispatcher {
    pub fn new(store: Arc<StateStore>, registry: Arc<SubscriptionRegistry>, config: DispatcherConfig) -> Self {
        Self {
            store,
            registry,
            config,
            delivered: AtomicU64::new(0),
            overflows: AtomicU64::new(0),
        }
    }

    pub fn config(&self) -> &DispatcherConfig {
        &self.config
    }

    pub fn registry(&self) -> &Arc<SubscriptionRegistry> {
        &self.registry
    }

    /// Open a session for a new transport connection
    pub fn open(self: &Arc<Self>) -> Session {
        let id = Uuid::new_v4();
        let queue = Arc::new(OutboundQueue::new(
            self.config.queue_capacity,
            self.config.overflow_policy,
        ));

        tracing::info!(connection_id = %id, "Client connected");

        Session::new(id, queue, self.clone())
    }

    /// Enqueue one change onto every eligible connection.
    /// Returns the number of connections that accepted it.
    pub fn dispatch(&self, record: &ChangeRecord) -> usize {
        let Some(spec) = self.store.spec(&record.key) else {
            return 0;
        };

        let eligible = self.registry.eligible_for(record, &spec.read_permissions);
        let mut delivered = 0;

        for (connection_id, queue) in eligible {
            match queue.push_change(record) {
                PushOutcome::Queued | PushOutcome::Merged => delivered += 1,
                PushOutcome::DroppedOldest => {
                    delivered += 1;
                    self.overflows.fetch_add(1, Ordering::Relaxed);
                    tracing::warn!(
                        connection_id = %connection_id,
                        key = %record.key,
                        "Outbound queue full, oldest message dropped"
                    );
                }
                PushOutcome::Overflowed => self.note_overflow(connection_id),
                PushOutcome::Closed => {}
            }
        }

        self.delivered.fetch_add(delivered as u64, Ordering::Relaxed);
        tracing::debug!(
            key = %record.key,
            version = record.version,
            recipients = delivered,
            "Change broadcast"
        );

        delivered
    }

    /// A connection's queue overflowed under the disconnect policy
    pub(crate) fn note_overflow(&self, connection_id: Uuid) {
        self.overflows.fetch_add(1, Ordering::Relaxed);
        self.registry.remove(&connection_id);

        let error = Error::ConnectionOverflow(connection_id);
        tracing::warn!(connection_id = %connection_id, error = %error, "Disconnecting slow client");
    }

    /// Start consuming the store's change feed
    pub fn spawn(self: Arc<Self>) -> JoinHandle<()> {
        let mut feed = self.store.change_feed();

        tokio::spawn(async move {
            while let Some(record) = feed.recv().await {
                self.dispatch(&record);
            }
            tracing::info!("Change feed closed, dispatcher stopped");
        })
    }

    pub fn connection_count(&self) -> usize {
        self.registry.len()
    }

    pub fn stats(&self) -> DispatcherStats {
        DispatcherStats {
            connections: self.connection_count(),
            delivered: self.delivered.load(Ordering::Relaxed),
            overflows: self.overflows.load(Ordering::Relaxed),
        }
    }
}
