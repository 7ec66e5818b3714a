//! Per-connection session
//!
//! Connecting -> Authenticated -> Active -> Closing -> Closed
//!
//! Owned by the transport task; the outbound pump only holds the queue.

use super::queue::{OutboundQueue, PushOutcome};
use super::BroadcastDispatcher;
use crate::error::{Error, Result};
use crate::permission::UserContext;
use crate::subscription::Topic;
use serde::Serialize;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

/// Connection lifecycle state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionState {
    Connecting,
    Authenticated,
    Active,
    Closing,
    Closed,
}

impl ConnectionState {
    pub fn can_transition_to(self, next: ConnectionState) -> bool {
        use ConnectionState::*;
        matches!(
            (self, next),
            (Connecting, Authenticated)
                | (Connecting, Closing)
                | (Authenticated, Active)
                | (Authenticated, Closing)
                | (Active, Closing)
                | (Closing, Closed)
        )
    }
}

/// One client connection
pub struct Session {
    id: Uuid,
    state: ConnectionState,
    context: Option<UserContext>,
    queue: Arc<OutboundQueue>,
    dispatcher: Arc<BroadcastDispatcher>,
}

impl Session {
    pub(super) fn new(id: Uuid, queue: Arc<OutboundQueue>, dispatcher: Arc<BroadcastDispatcher>) -> Self {
        Self {
            id,
            state: ConnectionState::Connecting,
            context: None,
            queue,
            dispatcher,
        }
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    /// Requester resolved at authentication
    pub fn context(&self) -> Option<&UserContext> {
        self.context.as_ref()
    }

    /// Queue handle for the outbound pump
    pub fn outbound(&self) -> Arc<OutboundQueue> {
        self.queue.clone()
    }

    fn transition(&mut self, next: ConnectionState) -> Result<()> {
        if !self.state.can_transition_to(next) {
            return Err(Error::InvalidTransition(format!("{:?} -> {:?}", self.state, next)));
        }
        tracing::debug!(connection_id = %self.id, from = ?self.state, to = ?next, "Connection state change");
        self.state = next;
        Ok(())
    }

    /// Accept a requester supplied by the authentication collaborator and
    /// register the connection (no topics yet).
    pub fn authenticate(&mut self, ctx: UserContext) -> Result<()> {
        self.transition(ConnectionState::Authenticated)?;
        self.dispatcher.registry().add(self.id, &ctx, self.queue.clone());

        tracing::info!(
            connection_id = %self.id,
            identity = %ctx.identity,
            role = %ctx.role,
            "Client authenticated"
        );
        self.context = Some(ctx);
        Ok(())
    }

    /// Wait for credentials for at most `timeout`. On timeout or rejection the
    /// session is closed immediately.
    pub async fn authenticate_within<F>(&mut self, timeout: Duration, credentials: F) -> Result<()>
    where
        F: Future<Output = Option<UserContext>>,
    {
        match tokio::time::timeout(timeout, credentials).await {
            Ok(Some(ctx)) => self.authenticate(ctx),
            Ok(None) => {
                tracing::warn!(connection_id = %self.id, "Authentication rejected");
                self.close_now();
                Err(Error::Unauthorized("authentication failed".to_string()))
            }
            Err(_) => {
                tracing::warn!(
                    connection_id = %self.id,
                    timeout_sec = timeout.as_secs(),
                    "Authentication timed out"
                );
                self.close_now();
                Err(Error::Unauthorized("authentication timed out".to_string()))
            }
        }
    }

    /// Add topics. The first subscription activates the session.
    pub fn subscribe(&mut self, topics: Vec<Topic>) -> Result<()> {
        match self.state {
            ConnectionState::Authenticated | ConnectionState::Active => {}
            other => {
                return Err(Error::InvalidTransition(format!("subscribe while {:?}", other)));
            }
        }

        self.dispatcher.registry().add_topics(&self.id, topics)?;
        if self.state == ConnectionState::Authenticated {
            self.transition(ConnectionState::Active)?;
        }
        Ok(())
    }

    pub fn unsubscribe(&mut self, topics: &[Topic]) -> Result<()> {
        match self.state {
            ConnectionState::Authenticated | ConnectionState::Active => {
                self.dispatcher.registry().remove_topics(&self.id, topics)
            }
            other => Err(Error::InvalidTransition(format!("unsubscribe while {:?}", other))),
        }
    }

    /// Queue a reply for this connection only
    pub fn send_direct(&self, message: serde_json::Value) -> PushOutcome {
        let outcome = self.queue.push_direct(message.to_string());
        if outcome == PushOutcome::Overflowed {
            self.dispatcher.note_overflow(self.id);
        }
        outcome
    }

    /// Next outbound message. Once the queue is closed and drained the session
    /// reaches `Closed` and this returns `None`.
    pub async fn next_message(&mut self) -> Option<String> {
        let message = self.queue.pop().await;
        if message.is_none() {
            self.close();
            self.finish();
        }
        message
    }

    /// Begin a graceful close: stop receiving broadcasts, let the queue drain
    pub fn close(&mut self) {
        if matches!(self.state, ConnectionState::Closing | ConnectionState::Closed) {
            return;
        }
        // Every live state may move to Closing
        self.state = ConnectionState::Closing;
        self.dispatcher.registry().remove(&self.id);
        self.queue.close();

        tracing::info!(connection_id = %self.id, "Client disconnecting");
        self.finish();
    }

    /// Close and cancel pending sends
    pub fn close_now(&mut self) {
        self.close();
        let discarded = self.queue.discard();
        if discarded > 0 {
            tracing::debug!(connection_id = %self.id, discarded = discarded, "Pending messages discarded");
        }
        self.finish();
    }

    /// Mark the session closed once its queue is drained or dropped
    pub fn finish(&mut self) {
        if self.state == ConnectionState::Closing && self.queue.is_empty() {
            self.state = ConnectionState::Closed;
            tracing::info!(connection_id = %self.id, "Client disconnected");
        }
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        if self.state != ConnectionState::Closed {
            self.dispatcher.registry().remove(&self.id);
            self.queue.discard();
        }
    }
}
