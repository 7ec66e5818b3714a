//! Change observers
//!
//! Hardware-control collaborators (GPIO lines, motor drivers) react to specific
//! keys through this one capability. Observers run after the write is applied
//! and before the record reaches persistence or broadcast, in registration order.

use crate::value::Value;

pub trait ChangeObserver: Send + Sync {
    fn on_change(&self, key: &str, old: &Value, new: &Value);
}

impl<F> ChangeObserver for F
where
    F: Fn(&str, &Value, &Value) + Send + Sync,
{
    fn on_change(&self, key: &str, old: &Value, new: &Value) {
        self(key, old, new)
    }
}
