//! Application state
//!
//! Holds all shared components and configuration

use crate::auth::Authenticator;
use crate::permission::PermissionEngine;
use crate::persistence::{PersistenceConfig, PersistenceLayer};
use crate::realtime_hub::{BroadcastDispatcher, DispatcherConfig, OverflowPolicy};
use crate::state_store::StateStore;
use std::path::PathBuf;
use std::str::FromStr;
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Application configuration
#[derive(Debug, Clone)]
pub struct AppConfig {
    /// Server host
    pub host: String,
    /// Server port
    pub port: u16,
    /// SQLite URL; in-memory persistence when unset
    pub database_url: Option<String>,
    /// JSON catalog replacing the built-in cells
    pub catalog_path: Option<PathBuf>,
    /// Debounce window for durable writes
    pub persist_debounce_ms: u64,
    pub persist_retry_base_ms: u64,
    pub persist_retry_max_ms: u64,
    /// Outbound queue capacity per connection
    pub outbound_queue_capacity: usize,
    pub overflow_policy: OverflowPolicy,
    /// Seconds a connection has to authenticate
    pub auth_timeout_sec: u64,
    /// Bearer token list (`token=identity:role[:extra|extra],...`)
    pub auth_tokens: String,
}

fn env_or<T: FromStr>(name: &str, default: T) -> T {
    std::env::var(name)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            host: std::env::var("HOST").unwrap_or_else(|_| "0.0.0.0".to_string()),
            port: env_or("PORT", 8080),
            database_url: std::env::var("DATABASE_URL").ok().filter(|s| !s.is_empty()),
            catalog_path: std::env::var("CATALOG_PATH").ok().map(PathBuf::from),
            persist_debounce_ms: env_or("PERSIST_DEBOUNCE_MS", 100),
            persist_retry_base_ms: env_or("PERSIST_RETRY_BASE_MS", 200),
            persist_retry_max_ms: env_or("PERSIST_RETRY_MAX_MS", 30_000),
            outbound_queue_capacity: env_or("OUTBOUND_QUEUE_CAPACITY", 256),
            overflow_policy: env_or("OVERFLOW_POLICY", OverflowPolicy::Disconnect),
            auth_timeout_sec: env_or("AUTH_TIMEOUT_SEC", 10),
            auth_tokens: std::env::var("AUTH_TOKENS").unwrap_or_default(),
        }
    }
}

impl AppConfig {
    pub fn persistence(&self) -> PersistenceConfig {
        PersistenceConfig {
            debounce: Duration::from_millis(self.persist_debounce_ms),
            retry_base: Duration::from_millis(self.persist_retry_base_ms),
            retry_max: Duration::from_millis(self.persist_retry_max_ms),
        }
    }

    pub fn dispatcher(&self) -> DispatcherConfig {
        DispatcherConfig {
            queue_capacity: self.outbound_queue_capacity,
            overflow_policy: self.overflow_policy,
            auth_timeout: Duration::from_secs(self.auth_timeout_sec),
        }
    }
}

/// Application state shared across handlers
#[derive(Clone)]
pub struct AppState {
    /// Application config
    pub config: AppConfig,
    /// StateStore (SSoT for cell values)
    pub store: Arc<StateStore>,
    /// PermissionEngine (roles)
    pub permissions: Arc<PermissionEngine>,
    /// PersistenceLayer (debounced durable writes)
    pub persistence: Arc<PersistenceLayer>,
    /// BroadcastDispatcher (WebSocket fan-out)
    pub dispatcher: Arc<BroadcastDispatcher>,
    /// Bearer token authentication
    pub auth: Arc<dyn Authenticator>,
    pub started_at: Instant,
}
