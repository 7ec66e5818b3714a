//! Bounded per-connection outbound queue

use crate::error::Error;
use crate::state_store::ChangeRecord;
use parking_lot::{Mutex, MutexGuard};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::str::FromStr;
use tokio::sync::Notify;

/// What happens when a slow consumer's queue is full
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OverflowPolicy {
    /// Discard the oldest queued message and keep the connection
    DropOldest,
    /// Discard the queue and close the connection; the client resyncs on reconnect
    #[default]
    Disconnect,
}

impl FromStr for OverflowPolicy {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "drop_oldest" => Ok(OverflowPolicy::DropOldest),
            "disconnect" => Ok(OverflowPolicy::Disconnect),
            other => Err(Error::Config(format!("unknown overflow policy: {}", other))),
        }
    }
}

/// Result of a push
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PushOutcome {
    Queued,
    /// Folded into the previous message of the same batch
    Merged,
    DroppedOldest,
    /// Queue discarded and closed (disconnect policy)
    Overflowed,
    Closed,
}

#[derive(Debug)]
enum Outbound {
    Change {
        batch: Option<u64>,
        values: serde_json::Map<String, serde_json::Value>,
    },
    Direct(String),
}

impl Outbound {
    fn render(self) -> String {
        match self {
            Outbound::Change { values, .. } => serde_json::Value::Object(values).to_string(),
            Outbound::Direct(text) => text,
        }
    }
}

#[derive(Debug, Default)]
struct QueueInner {
    messages: VecDeque<Outbound>,
    closed: bool,
    overflowed: bool,
    dropped: u64,
}

/// Outbound queue
///
/// Single consumer (the connection's send pump), many producers.
pub struct OutboundQueue {
    inner: Mutex<QueueInner>,
    notify: Notify,
    capacity: usize,
    policy: OverflowPolicy,
}

impl OutboundQueue {
    pub fn new(capacity: usize, policy: OverflowPolicy) -> Self {
        Self {
            inner: Mutex::new(QueueInner::default()),
            notify: Notify::new(),
            capacity: capacity.max(1),
            policy,
        }
    }

    /// Queue a change as a flat `{key: value}` message.
    ///
    /// Consecutive records of one batch share a single message as long as the
    /// key is not already in it.
    pub fn push_change(&self, record: &ChangeRecord) -> PushOutcome {
        let mut inner = self.inner.lock();
        if inner.closed {
            return PushOutcome::Closed;
        }

        if let (Some(batch), Some(Outbound::Change { batch: Some(last), values })) =
            (record.batch, inner.messages.back_mut())
        {
            if batch == *last && !values.contains_key(&record.key) {
                values.insert(record.key.clone(), record.new_value.to_json());
                return PushOutcome::Merged;
            }
        }

        let mut values = serde_json::Map::new();
        values.insert(record.key.clone(), record.new_value.to_json());
        self.push_locked(
            inner,
            Outbound::Change {
                batch: record.batch,
                values,
            },
        )
    }

    /// Queue a pre-rendered message (confirmation, error, initial sync)
    pub fn push_direct(&self, text: String) -> PushOutcome {
        let inner = self.inner.lock();
        if inner.closed {
            return PushOutcome::Closed;
        }
        self.push_locked(inner, Outbound::Direct(text))
    }

    fn push_locked(&self, mut inner: MutexGuard<'_, QueueInner>, message: Outbound) -> PushOutcome {
        let mut outcome = PushOutcome::Queued;

        if inner.messages.len() >= self.capacity {
            match self.policy {
                OverflowPolicy::DropOldest => {
                    inner.messages.pop_front();
                    inner.dropped += 1;
                    outcome = PushOutcome::DroppedOldest;
                }
                OverflowPolicy::Disconnect => {
                    inner.messages.clear();
                    inner.closed = true;
                    inner.overflowed = true;
                    drop(inner);
                    self.notify.notify_one();
                    return PushOutcome::Overflowed;
                }
            }
        }

        inner.messages.push_back(message);
        drop(inner);
        self.notify.notify_one();
        outcome
    }

    /// Next message; `None` once the queue is closed and drained
    pub async fn pop(&self) -> Option<String> {
        loop {
            {
                let mut inner = self.inner.lock();
                if let Some(message) = inner.messages.pop_front() {
                    return Some(message.render());
                }
                if inner.closed {
                    return None;
                }
            }
            self.notify.notified().await;
        }
    }

    pub fn try_pop(&self) -> Option<String> {
        self.inner.lock().messages.pop_front().map(Outbound::render)
    }

    /// Stop accepting messages; what is queued can still be drained
    pub fn close(&self) {
        self.inner.lock().closed = true;
        self.notify.notify_one();
    }

    /// Close and drop everything still queued. Returns the number discarded.
    pub fn discard(&self) -> usize {
        let discarded = {
            let mut inner = self.inner.lock();
            inner.closed = true;
            let n = inner.messages.len();
            inner.messages.clear();
            n
        };
        self.notify.notify_one();
        discarded
    }

    pub fn len(&self) -> usize {
        self.inner.lock().messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn is_closed(&self) -> bool {
        self.inner.lock().closed
    }

    pub fn overflowed(&self) -> bool {
        self.inner.lock().overflowed
    }

    /// Messages discarded under the drop-oldest policy
    pub fn dropped_count(&self) -> u64 {
        self.inner.lock().dropped
    }
}
