//! SubscriptionRegistry - Active Connections and Their Topics
//!
//! A connection enters the registry once it is authenticated and leaves on
//! disconnect. Eligibility for a change is the connection's read permission on
//! the cell plus a matching topic.

use crate::error::{Error, Result};
use crate::permission::{PermissionEngine, PermissionSet, UserContext};
use crate::realtime_hub::OutboundQueue;
use crate::state_store::ChangeRecord;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use uuid::Uuid;

const STATE_TOPIC: &str = "state";

/// Subscription topic
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum Topic {
    /// Every state change (`state`)
    StateChanges,
    /// Changes to a single key (`state:<key>`)
    Key(String),
}

impl Topic {
    pub fn matches(&self, key: &str) -> bool {
        match self {
            Topic::StateChanges => true,
            Topic::Key(k) => k == key,
        }
    }
}

impl FromStr for Topic {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        if s == STATE_TOPIC {
            return Ok(Topic::StateChanges);
        }
        match s.strip_prefix("state:") {
            Some(key) if !key.is_empty() => Ok(Topic::Key(key.to_string())),
            _ => Err(Error::Protocol(format!("unknown topic: {}", s))),
        }
    }
}

impl TryFrom<String> for Topic {
    type Error = Error;

    fn try_from(s: String) -> Result<Self> {
        s.parse()
    }
}

impl From<Topic> for String {
    fn from(topic: Topic) -> Self {
        topic.to_string()
    }
}

impl fmt::Display for Topic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Topic::StateChanges => f.write_str(STATE_TOPIC),
            Topic::Key(key) => write!(f, "{}:{}", STATE_TOPIC, key),
        }
    }
}

/// One registered connection
pub struct Subscription {
    pub connection_id: Uuid,
    pub identity: String,
    pub permissions: PermissionSet,
    pub topics: HashSet<Topic>,
    pub queue: Arc<OutboundQueue>,
    pub connected_at: DateTime<Utc>,
}

impl Subscription {
    fn wants(&self, record: &ChangeRecord, read_permissions: &PermissionSet) -> bool {
        PermissionEngine::can_read(&self.permissions, read_permissions)
            && self.topics.iter().any(|topic| topic.matches(&record.key))
    }
}

/// Registry of active subscriptions
#[derive(Default)]
pub struct SubscriptionRegistry {
    subscriptions: RwLock<HashMap<Uuid, Subscription>>,
}

impl SubscriptionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a connection with no topics yet
    pub fn add(&self, connection_id: Uuid, ctx: &UserContext, queue: Arc<OutboundQueue>) {
        let subscription = Subscription {
            connection_id,
            identity: ctx.identity.clone(),
            permissions: ctx.permissions,
            topics: HashSet::new(),
            queue,
            connected_at: Utc::now(),
        };
        self.subscriptions.write().insert(connection_id, subscription);

        tracing::debug!(connection_id = %connection_id, identity = %ctx.identity, "Subscription added");
    }

    /// Returns whether the connection was registered
    pub fn remove(&self, connection_id: &Uuid) -> bool {
        let removed = self.subscriptions.write().remove(connection_id).is_some();
        if removed {
            tracing::debug!(connection_id = %connection_id, "Subscription removed");
        }
        removed
    }

    /// Replace the topic set
    pub fn set_topics(&self, connection_id: &Uuid, topics: HashSet<Topic>) -> Result<()> {
        self.with_subscription(connection_id, |sub| sub.topics = topics)
    }

    pub fn add_topics(&self, connection_id: &Uuid, topics: impl IntoIterator<Item = Topic>) -> Result<()> {
        self.with_subscription(connection_id, |sub| sub.topics.extend(topics))
    }

    pub fn remove_topics(&self, connection_id: &Uuid, topics: &[Topic]) -> Result<()> {
        self.with_subscription(connection_id, |sub| {
            for topic in topics {
                sub.topics.remove(topic);
            }
        })
    }

    pub fn topics(&self, connection_id: &Uuid) -> Option<HashSet<Topic>> {
        self.subscriptions
            .read()
            .get(connection_id)
            .map(|sub| sub.topics.clone())
    }

    /// Connections that should receive `record`
    pub fn eligible_for(
        &self,
        record: &ChangeRecord,
        read_permissions: &PermissionSet,
    ) -> Vec<(Uuid, Arc<OutboundQueue>)> {
        self.subscriptions
            .read()
            .values()
            .filter(|sub| sub.wants(record, read_permissions))
            .map(|sub| (sub.connection_id, sub.queue.clone()))
            .collect()
    }

    pub fn len(&self) -> usize {
        self.subscriptions.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.subscriptions.read().is_empty()
    }

    fn with_subscription(&self, connection_id: &Uuid, f: impl FnOnce(&mut Subscription)) -> Result<()> {
        let mut subscriptions = self.subscriptions.write();
        let sub = subscriptions
            .get_mut(connection_id)
            .ok_or_else(|| Error::NotFound(format!("connection {}", connection_id)))?;
        f(sub);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::permission::Permission;
    use crate::realtime_hub::OverflowPolicy;
    use crate::value::Value;

    fn record(key: &str) -> ChangeRecord {
        ChangeRecord {
            key: key.to_string(),
            old_value: Value::Int(0),
            new_value: Value::Int(1),
            version: 1,
            timestamp: Utc::now(),
            originator: "test".to_string(),
            batch: None,
        }
    }

    fn queue() -> Arc<OutboundQueue> {
        Arc::new(OutboundQueue::new(16, OverflowPolicy::Disconnect))
    }

    fn viewer() -> UserContext {
        UserContext::new("viewer", "viewer", PermissionSet::all_read())
    }

    #[test]
    fn test_topic_parse() {
        assert_eq!("state".parse::<Topic>().unwrap(), Topic::StateChanges);
        assert_eq!(
            "state:brightness".parse::<Topic>().unwrap(),
            Topic::Key("brightness".to_string())
        );
        assert!("state:".parse::<Topic>().is_err());
        assert!("events".parse::<Topic>().is_err());
        assert_eq!(Topic::Key("gain".to_string()).to_string(), "state:gain");
    }

    #[test]
    fn test_no_topics_not_eligible() {
        let registry = SubscriptionRegistry::new();
        let id = Uuid::new_v4();
        registry.add(id, &viewer(), queue());

        let read = PermissionSet::of(&[Permission::DeviceRead]);
        assert!(registry.eligible_for(&record("brightness"), &read).is_empty());

        registry.add_topics(&id, [Topic::StateChanges]).unwrap();
        assert_eq!(registry.eligible_for(&record("brightness"), &read).len(), 1);
    }

    #[test]
    fn test_eligibility_requires_read_permission() {
        let registry = SubscriptionRegistry::new();
        let guest = Uuid::new_v4();
        let viewer_id = Uuid::new_v4();
        registry.add(guest, &UserContext::new("guest", "guest", PermissionSet::empty()), queue());
        registry.add(viewer_id, &viewer(), queue());
        registry.add_topics(&guest, [Topic::StateChanges]).unwrap();
        registry.add_topics(&viewer_id, [Topic::StateChanges]).unwrap();

        let read = PermissionSet::of(&[Permission::DeviceRead, Permission::DeviceWrite]);
        let eligible = registry.eligible_for(&record("brightness"), &read);
        assert_eq!(eligible.len(), 1);
        assert_eq!(eligible[0].0, viewer_id);
    }

    #[test]
    fn test_key_topic_filters() {
        let registry = SubscriptionRegistry::new();
        let id = Uuid::new_v4();
        registry.add(id, &viewer(), queue());
        registry
            .set_topics(&id, HashSet::from([Topic::Key("gain".to_string())]))
            .unwrap();

        let read = PermissionSet::all_read();
        assert!(registry.eligible_for(&record("brightness"), &read).is_empty());
        assert_eq!(registry.eligible_for(&record("gain"), &read).len(), 1);

        registry
            .remove_topics(&id, &[Topic::Key("gain".to_string())])
            .unwrap();
        assert!(registry.eligible_for(&record("gain"), &read).is_empty());
    }

    #[test]
    fn test_unknown_connection() {
        let registry = SubscriptionRegistry::new();
        let id = Uuid::new_v4();
        assert!(matches!(
            registry.add_topics(&id, [Topic::StateChanges]),
            Err(Error::NotFound(_))
        ));
        assert!(!registry.remove(&id));
    }
}
