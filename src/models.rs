//! Shared response models
//!
//! Types shared between the HTTP handlers and the binary.

use crate::realtime_hub::DispatcherStats;
use crate::state_store::CellSnapshot;
use serde::{Deserialize, Serialize};

/// Health check response
#[derive(Debug, Clone, Serialize)]
pub struct HealthResponse {
    pub status: String,
    pub version: String,
    pub uptime_sec: u64,
    /// Registered cells
    pub cells: usize,
    pub dispatcher: DispatcherStats,
    /// Durable writes waiting for the flusher
    pub pending_writes: usize,
    pub persistence_failures: u64,
}

/// `GET /api/state` response
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StateResponse {
    pub identity: String,
    pub role: String,
    /// Flat `{key: value}` map of every readable cell
    pub values: serde_json::Value,
    /// Full snapshots with version and modification time
    pub cells: Vec<CellSnapshot>,
}
