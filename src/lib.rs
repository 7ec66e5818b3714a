//! camstate Library
//!
//! Observable state engine for a networked camera controller
//!
//! ## Architecture
//!
//! 1. StateStore - SSoT for typed, permission-gated cells
//! 2. Validator - Per-cell type/range/enumeration rules
//! 3. PermissionEngine - Roles and intersection checks
//! 4. PersistenceLayer - Startup restore and debounced durable writes
//! 5. SubscriptionRegistry - Connections, permissions, topics
//! 6. RealtimeHub - Change broadcast with bounded per-connection queues
//! 7. WebAPI - HTTP/WebSocket transport adapter
//!
//! ## Data Flow
//!
//! request -> StateStore (PermissionEngine + Validator) -> ChangeRecord ->
//! PersistenceLayer (persistent cells) and RealtimeHub -> subscribed clients

pub mod auth;
pub mod catalog;
pub mod error;
pub mod models;
pub mod permission;
pub mod persistence;
pub mod protocol;
pub mod realtime_hub;
pub mod state;
pub mod state_store;
pub mod subscription;
pub mod validator;
pub mod value;
pub mod web_api;

pub use error::{Error, Result};
pub use state::AppState;
