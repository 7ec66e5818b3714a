//! StateStore - Single Source of Truth for Observable Cells
//!
//! ## Responsibilities
//!
//! - Own the key -> cell mapping (fixed after startup registration)
//! - Gate every read/write through PermissionEngine and Validator
//! - Version every applied write
//! - Emit exactly one ChangeRecord per applied write
//!
//! ## Concurrency
//!
//! - Writes are serialized through one async writer gate; a batch holds the
//!   gate for its whole length
//! - Each cell holds an immutable `Arc<CellState>` that a write swaps whole,
//!   so readers only copy a pointer and never observe a partial update
//! - Change feeds are unbounded FIFO channels; the writer never waits for
//!   persistence or delivery

mod observer;
mod types;

pub use observer::ChangeObserver;
pub use types::{CellSnapshot, CellSpec, ChangeRecord, KeyOutcome};

use crate::error::{Error, Result};
use crate::permission::{PermissionEngine, UserContext};
use crate::value::Value;
use chrono::Utc;
use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::mpsc;
use types::CellState;

/// Registered cell
struct Cell {
    spec: CellSpec,
    state: RwLock<Arc<CellState>>,
}

impl Cell {
    fn load(&self) -> Arc<CellState> {
        self.state.read().clone()
    }

    fn snapshot(&self) -> CellSnapshot {
        let state = self.load();
        CellSnapshot {
            key: self.spec.key.clone(),
            value: state.value.clone(),
            version: state.version,
            last_modified: state.last_modified,
        }
    }
}

/// Startup registration pass
///
/// The key set is frozen once `build()` is called.
#[derive(Default)]
pub struct StateStoreBuilder {
    cells: HashMap<String, Cell>,
    order: Vec<String>,
}

impl StateStoreBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register one cell.
    ///
    /// `DuplicateKey` and an invalid default are configuration errors; callers
    /// abort startup on either.
    pub fn register_cell(&mut self, spec: CellSpec) -> Result<()> {
        if self.cells.contains_key(&spec.key) {
            tracing::error!(key = %spec.key, "Duplicate cell registration");
            return Err(Error::DuplicateKey(spec.key));
        }

        let default = spec.default.clone().coerce_to(spec.validator.kind);
        spec.validator
            .validate(&default)
            .map_err(|reason| Error::InvalidValue {
                key: spec.key.clone(),
                reason: format!("default rejected: {}", reason),
            })?;

        let state = CellState {
            value: default,
            version: 0,
            last_modified: Utc::now(),
        };

        self.order.push(spec.key.clone());
        self.cells.insert(
            spec.key.clone(),
            Cell {
                spec,
                state: RwLock::new(Arc::new(state)),
            },
        );

        Ok(())
    }

    /// Register a whole catalog, stopping at the first error
    pub fn register_all(&mut self, specs: impl IntoIterator<Item = CellSpec>) -> Result<()> {
        for spec in specs {
            self.register_cell(spec)?;
        }
        Ok(())
    }

    pub fn build(self) -> StateStore {
        tracing::info!(cells = self.order.len(), "StateStore registration complete");

        StateStore {
            cells: self.cells,
            keys: self.order,
            writer: tokio::sync::Mutex::new(WriterState::default()),
            observers: RwLock::new(HashMap::new()),
            feeds: Mutex::new(Vec::new()),
        }
    }
}

#[derive(Default)]
struct WriterState {
    last_batch: u64,
}

/// StateStore instance
pub struct StateStore {
    cells: HashMap<String, Cell>,
    /// Registration order
    keys: Vec<String>,
    writer: tokio::sync::Mutex<WriterState>,
    observers: RwLock<HashMap<String, Vec<Arc<dyn ChangeObserver>>>>,
    feeds: Mutex<Vec<mpsc::UnboundedSender<Arc<ChangeRecord>>>>,
}

impl StateStore {
    pub fn builder() -> StateStoreBuilder {
        StateStoreBuilder::new()
    }

    // ========================================
    // Reads
    // ========================================

    /// Current value, gated by read permission
    pub fn get_value(&self, key: &str, ctx: &UserContext) -> Result<Value> {
        Ok(self.get_snapshot(key, ctx)?.value)
    }

    /// Current value with version and modification time
    pub fn get_snapshot(&self, key: &str, ctx: &UserContext) -> Result<CellSnapshot> {
        let cell = self.cell(key)?;

        if !PermissionEngine::can_read(&ctx.permissions, &cell.spec.read_permissions) {
            return Err(Error::PermissionDenied {
                key: key.to_string(),
                required: cell.spec.read_permissions,
            });
        }

        Ok(cell.snapshot())
    }

    /// Every cell the requester may read, in registration order
    pub fn readable_snapshot(&self, ctx: &UserContext) -> Vec<CellSnapshot> {
        self.keys
            .iter()
            .filter_map(|key| self.cells.get(key))
            .filter(|cell| PermissionEngine::can_read(&ctx.permissions, &cell.spec.read_permissions))
            .map(Cell::snapshot)
            .collect()
    }

    /// Current version of a cell (no permission check, for collaborators)
    pub fn version(&self, key: &str) -> Option<u64> {
        self.cells.get(key).map(|cell| cell.load().version)
    }

    pub fn spec(&self, key: &str) -> Option<&CellSpec> {
        self.cells.get(key).map(|cell| &cell.spec)
    }

    /// Registered keys in registration order
    pub fn keys(&self) -> &[String] {
        &self.keys
    }

    pub fn len(&self) -> usize {
        self.keys.len()
    }

    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }

    /// Run a key's validator without writing
    pub fn validate(&self, key: &str, value: &Value) -> Result<()> {
        let cell = self.cell(key)?;
        let value = value.clone().coerce_to(cell.spec.validator.kind);
        cell.spec
            .validator
            .validate(&value)
            .map_err(|reason| Error::InvalidValue {
                key: key.to_string(),
                reason,
            })
    }

    // ========================================
    // Writes
    // ========================================

    /// Apply one write. Returns the new version.
    pub async fn set_value(&self, key: &str, value: Value, ctx: &UserContext) -> Result<u64> {
        let _writer = self.writer.lock().await;

        let record = self.apply(key, value, ctx, None)?;
        let version = record.version;
        self.publish(record);

        Ok(version)
    }

    /// Apply each pair independently. A failure on one key never prevents
    /// the others from applying; there is no rollback.
    pub async fn set_values(&self, batch: Vec<(String, Value)>, ctx: &UserContext) -> Vec<KeyOutcome> {
        self.set_values_with(batch, ctx, |_| {}).await
    }

    /// Like `set_values`, but `on_applied` runs before the writer gate is
    /// released. Anything it queues is ordered ahead of every later write.
    pub async fn set_values_with<F>(
        &self,
        batch: Vec<(String, Value)>,
        ctx: &UserContext,
        on_applied: F,
    ) -> Vec<KeyOutcome>
    where
        F: FnOnce(&[KeyOutcome]),
    {
        let mut writer = self.writer.lock().await;
        writer.last_batch += 1;
        let batch_id = writer.last_batch;

        let mut outcomes = Vec::with_capacity(batch.len());
        for (key, value) in batch {
            let result = self.apply(&key, value, ctx, Some(batch_id)).map(|record| {
                let version = record.version;
                self.publish(record);
                version
            });
            outcomes.push(KeyOutcome { key, result });
        }

        tracing::debug!(
            batch = batch_id,
            applied = outcomes.iter().filter(|o| o.is_applied()).count(),
            rejected = outcomes.iter().filter(|o| !o.is_applied()).count(),
            "Batch write processed"
        );

        on_applied(&outcomes);
        drop(writer);

        outcomes
    }

    /// Gate and apply a write. Caller must hold the writer gate.
    fn apply(&self, key: &str, value: Value, ctx: &UserContext, batch: Option<u64>) -> Result<ChangeRecord> {
        let cell = self.cell(key)?;

        if !PermissionEngine::can_write(&ctx.permissions, &cell.spec.write_permissions) {
            tracing::debug!(key = %key, identity = %ctx.identity, "Write rejected: permission denied");
            return Err(Error::PermissionDenied {
                key: key.to_string(),
                required: cell.spec.write_permissions,
            });
        }

        let value = value.coerce_to(cell.spec.validator.kind);
        if let Err(reason) = cell.spec.validator.validate(&value) {
            tracing::debug!(key = %key, reason = %reason, "Write rejected: invalid value");
            return Err(Error::InvalidValue {
                key: key.to_string(),
                reason,
            });
        }

        let now = Utc::now();
        let old = cell.load();
        let version = old.version + 1;

        *cell.state.write() = Arc::new(CellState {
            value: value.clone(),
            version,
            last_modified: now,
        });

        Ok(ChangeRecord {
            key: key.to_string(),
            old_value: old.value.clone(),
            new_value: value,
            version,
            timestamp: now,
            originator: ctx.identity.clone(),
            batch,
        })
    }

    /// Run observers, then hand the record to every live change feed.
    /// Caller must hold the writer gate so feeds see write order.
    fn publish(&self, record: ChangeRecord) {
        let observers = self
            .observers
            .read()
            .get(&record.key)
            .cloned()
            .unwrap_or_default();
        for observer in &observers {
            observer.on_change(&record.key, &record.old_value, &record.new_value);
        }

        tracing::debug!(
            key = %record.key,
            version = record.version,
            originator = %record.originator,
            "Change applied"
        );

        let record = Arc::new(record);
        self.feeds
            .lock()
            .retain(|feed| feed.send(record.clone()).is_ok());
    }

    /// Load a durable value at startup. Does not bump the version and emits nothing.
    pub(crate) async fn restore(&self, key: &str, value: Value) -> Result<()> {
        let _writer = self.writer.lock().await;
        let cell = self.cell(key)?;

        let value = value.coerce_to(cell.spec.validator.kind);
        cell.spec
            .validator
            .validate(&value)
            .map_err(|reason| Error::InvalidValue {
                key: key.to_string(),
                reason,
            })?;

        let current = cell.load();
        *cell.state.write() = Arc::new(CellState {
            value,
            version: current.version,
            last_modified: Utc::now(),
        });

        Ok(())
    }

    // ========================================
    // Collaborator hooks
    // ========================================

    /// React to applied writes of one key
    pub fn register_change_observer(&self, key: &str, observer: Arc<dyn ChangeObserver>) -> Result<()> {
        self.cell(key)?;
        self.observers
            .write()
            .entry(key.to_string())
            .or_default()
            .push(observer);

        tracing::debug!(key = %key, "Change observer registered");
        Ok(())
    }

    /// New FIFO receiver of every change record applied from now on
    pub fn change_feed(&self) -> mpsc::UnboundedReceiver<Arc<ChangeRecord>> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.feeds.lock().push(tx);
        rx
    }

    fn cell(&self, key: &str) -> Result<&Cell> {
        self.cells
            .get(key)
            .ok_or_else(|| Error::UnknownKey(key.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::permission::{Permission, PermissionSet};
    use crate::validator::Validator;

    fn device_rw() -> PermissionSet {
        PermissionSet::of(&[Permission::DeviceRead, Permission::DeviceWrite])
    }

    fn writer() -> UserContext {
        UserContext::new("admin", "admin", PermissionSet::all())
    }

    fn reader() -> UserContext {
        UserContext::new("viewer", "viewer", PermissionSet::all_read())
    }

    fn store() -> StateStore {
        let mut builder = StateStore::builder();
        builder
            .register_cell(
                CellSpec::new("brightness", 50, Validator::int_range(0, 100))
                    .persistent()
                    .readable_by(device_rw())
                    .writable_by(PermissionSet::of(&[Permission::DeviceWrite])),
            )
            .unwrap();
        builder
            .register_cell(
                CellSpec::new("gain", 1.0, Validator::float_range(0.0, 16.0))
                    .readable_by(device_rw())
                    .writable_by(PermissionSet::of(&[Permission::DeviceWrite])),
            )
            .unwrap();
        builder
            .register_cell(
                CellSpec::new("hostname", "camera", Validator::string().with_max_len(16))
                    .readable_by(PermissionSet::of(&[Permission::NetworkWrite]))
                    .writable_by(PermissionSet::of(&[Permission::NetworkWrite])),
            )
            .unwrap();
        builder.build()
    }

    #[test]
    fn test_duplicate_key_rejected() {
        let mut builder = StateStore::builder();
        builder
            .register_cell(CellSpec::new("brightness", 50, Validator::int()))
            .unwrap();
        let result = builder.register_cell(CellSpec::new("brightness", 10, Validator::int()));
        assert!(matches!(result, Err(Error::DuplicateKey(k)) if k == "brightness"));
    }

    #[test]
    fn test_invalid_default_rejected() {
        let mut builder = StateStore::builder();
        let result = builder.register_cell(CellSpec::new("fps", 0, Validator::int_range(1, 60)));
        assert!(matches!(result, Err(Error::InvalidValue { .. })));
    }

    #[test]
    fn test_read_requires_intersection() {
        let store = store();
        assert_eq!(store.get_value("brightness", &reader()).unwrap(), Value::Int(50));

        let result = store.get_value("hostname", &reader());
        assert!(matches!(result, Err(Error::PermissionDenied { .. })));

        let guest = UserContext::new("guest", "guest", PermissionSet::empty());
        assert!(store.get_value("brightness", &guest).is_err());
    }

    #[test]
    fn test_unknown_key() {
        let store = store();
        assert!(matches!(store.get_value("zoom", &writer()), Err(Error::UnknownKey(_))));
    }

    #[tokio::test]
    async fn test_set_value_increments_version() {
        let store = store();
        let version = store.set_value("brightness", Value::Int(75), &writer()).await.unwrap();
        assert_eq!(version, 1);

        let snapshot = store.get_snapshot("brightness", &reader()).unwrap();
        assert_eq!(snapshot.value, Value::Int(75));
        assert_eq!(snapshot.version, 1);

        store.set_value("brightness", Value::Int(75), &writer()).await.unwrap();
        assert_eq!(store.version("brightness"), Some(2));
    }

    #[tokio::test]
    async fn test_rejected_write_leaves_cell_unchanged() {
        let store = store();
        let mut feed = store.change_feed();

        let result = store.set_value("brightness", Value::Int(150), &writer()).await;
        assert!(matches!(result, Err(Error::InvalidValue { .. })));

        let result = store.set_value("brightness", Value::Int(80), &reader()).await;
        assert!(matches!(result, Err(Error::PermissionDenied { .. })));

        assert_eq!(store.version("brightness"), Some(0));
        assert_eq!(store.get_value("brightness", &reader()).unwrap(), Value::Int(50));
        assert!(feed.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_permission_checked_before_validation() {
        let store = store();
        let result = store.set_value("brightness", Value::Int(150), &reader()).await;
        assert!(matches!(result, Err(Error::PermissionDenied { .. })));
    }

    #[tokio::test]
    async fn test_int_coerced_for_float_cell() {
        let store = store();
        store.set_value("gain", Value::Int(4), &writer()).await.unwrap();
        assert_eq!(store.get_value("gain", &reader()).unwrap(), Value::Float(4.0));
    }

    #[tokio::test]
    async fn test_batch_applies_independently() {
        let store = store();
        let mut feed = store.change_feed();

        let outcomes = store
            .set_values(
                vec![
                    ("brightness".to_string(), Value::Int(20)),
                    ("gain".to_string(), Value::from("loud")),
                    ("zoom".to_string(), Value::Int(2)),
                ],
                &writer(),
            )
            .await;

        assert_eq!(outcomes.len(), 3);
        assert_eq!(outcomes[0].result.as_ref().unwrap(), &1);
        assert!(matches!(outcomes[1].result, Err(Error::InvalidValue { .. })));
        assert!(matches!(outcomes[2].result, Err(Error::UnknownKey(_))));

        let record = feed.try_recv().unwrap();
        assert_eq!(record.key, "brightness");
        assert!(record.batch.is_some());
        assert!(feed.try_recv().is_err());
        assert_eq!(store.version("gain"), Some(0));
    }

    #[tokio::test]
    async fn test_on_applied_runs_before_gate_release() {
        let store = store();
        let mut seen = Vec::new();

        store
            .set_values_with(vec![("brightness".to_string(), Value::Int(30))], &writer(), |outcomes| {
                assert!(store.writer.try_lock().is_err());
                seen.extend(outcomes.iter().map(|o| o.key.clone()));
            })
            .await;

        assert_eq!(seen, vec!["brightness".to_string()]);
        assert!(store.writer.try_lock().is_ok());
    }

    #[tokio::test]
    async fn test_feed_preserves_write_order() {
        let store = store();
        let mut feed = store.change_feed();

        for v in [10, 20, 30] {
            store.set_value("brightness", Value::Int(v), &writer()).await.unwrap();
        }

        let versions: Vec<u64> = (0..3).map(|_| feed.try_recv().unwrap().version).collect();
        assert_eq!(versions, vec![1, 2, 3]);
    }

    #[tokio::test]
    async fn test_observers_run_in_order_before_emit() {
        let store = Arc::new(store());
        let mut feed = store.change_feed();
        let calls = Arc::new(Mutex::new(Vec::new()));

        for name in ["gpio", "audit"] {
            let calls = calls.clone();
            store
                .register_change_observer(
                    "brightness",
                    Arc::new(move |key: &str, old: &Value, new: &Value| {
                        calls.lock().push(format!("{}:{}:{}->{}", name, key, old, new));
                    }),
                )
                .unwrap();
        }

        store.set_value("brightness", Value::Int(60), &writer()).await.unwrap();
        store.set_value("gain", Value::Float(2.0), &writer()).await.unwrap();

        assert_eq!(
            *calls.lock(),
            vec!["gpio:brightness:50->60".to_string(), "audit:brightness:50->60".to_string()]
        );
        assert_eq!(feed.try_recv().unwrap().key, "brightness");
    }

    #[test]
    fn test_observer_on_unknown_key() {
        let store = store();
        let result = store.register_change_observer("zoom", Arc::new(|_: &str, _: &Value, _: &Value| {}));
        assert!(matches!(result, Err(Error::UnknownKey(_))));
    }

    #[tokio::test]
    async fn test_restore_keeps_version() {
        let store = store();
        let mut feed = store.change_feed();

        store.restore("brightness", Value::Int(33)).await.unwrap();
        assert_eq!(store.get_value("brightness", &reader()).unwrap(), Value::Int(33));
        assert_eq!(store.version("brightness"), Some(0));
        assert!(feed.try_recv().is_err());

        assert!(store.restore("brightness", Value::Int(-5)).await.is_err());
    }

    #[test]
    fn test_readable_snapshot_filters() {
        let store = store();
        let keys: Vec<String> = store
            .readable_snapshot(&reader())
            .into_iter()
            .map(|s| s.key)
            .collect();
        assert_eq!(keys, vec!["brightness".to_string(), "gain".to_string()]);
    }
}
