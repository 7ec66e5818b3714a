//! StateStore data types

use crate::error::Error;
use crate::permission::PermissionSet;
use crate::validator::Validator;
use crate::value::Value;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Registration entry for one cell (immutable after registration)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CellSpec {
    pub key: String,
    pub default: Value,
    #[serde(default)]
    pub persistent: bool,
    #[serde(default)]
    pub read_permissions: PermissionSet,
    #[serde(default)]
    pub write_permissions: PermissionSet,
    pub validator: Validator,
}

impl CellSpec {
    /// New non-persistent cell nobody can access yet
    pub fn new(key: impl Into<String>, default: impl Into<Value>, validator: Validator) -> Self {
        Self {
            key: key.into(),
            default: default.into(),
            persistent: false,
            read_permissions: PermissionSet::empty(),
            write_permissions: PermissionSet::empty(),
            validator,
        }
    }

    pub fn persistent(mut self) -> Self {
        self.persistent = true;
        self
    }

    pub fn readable_by(mut self, permissions: PermissionSet) -> Self {
        self.read_permissions = permissions;
        self
    }

    pub fn writable_by(mut self, permissions: PermissionSet) -> Self {
        self.write_permissions = permissions;
        self
    }
}

/// Live state of a cell, swapped as a whole on every applied write
#[derive(Debug, Clone)]
pub(crate) struct CellState {
    pub value: Value,
    pub version: u64,
    pub last_modified: DateTime<Utc>,
}

/// Point-in-time view of a cell
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CellSnapshot {
    pub key: String,
    pub value: Value,
    pub version: u64,
    pub last_modified: DateTime<Utc>,
}

/// One applied write
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChangeRecord {
    pub key: String,
    pub old_value: Value,
    pub new_value: Value,
    pub version: u64,
    pub timestamp: DateTime<Utc>,
    /// Identity of the requester that issued the write
    pub originator: String,
    /// Batch the write belonged to (records of one `set_values` call share it)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub batch: Option<u64>,
}

/// Per-key result of a batch write
#[derive(Debug)]
pub struct KeyOutcome {
    pub key: String,
    /// New version on success
    pub result: Result<u64, Error>,
}

impl KeyOutcome {
    pub fn is_applied(&self) -> bool {
        self.result.is_ok()
    }
}
