//! API Routes

use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        State,
    },
    http::HeaderMap,
    response::IntoResponse,
    routing::get,
    Json, Router,
};
use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use std::time::Duration;

use crate::auth::Authenticator;
use crate::error::{Error, Result};
use crate::models::StateResponse;
use crate::permission::UserContext;
use crate::protocol::{self, ClientRequest};
use crate::realtime_hub::Session;
use crate::state::AppState;

/// How long a closing connection may keep flushing its queue
const DRAIN_GRACE: Duration = Duration::from_secs(2);

/// Create API router
pub fn create_router(state: AppState) -> Router {
    Router::new()
        // Health
        .route("/healthz", get(super::health_check))
        // State
        .route("/api/state", get(get_state))
        // WebSocket
        .route("/api/ws", get(websocket_handler))
        .with_state(state)
}

// ========================================
// State API
// ========================================

/// Every cell the bearer may read
async fn get_state(State(state): State<AppState>, headers: HeaderMap) -> Result<Json<StateResponse>> {
    let ctx = super::bearer_context(&state, &headers)?;
    let cells = state.store.readable_snapshot(&ctx);

    Ok(Json(StateResponse {
        identity: ctx.identity,
        role: ctx.role,
        values: protocol::values_message(&cells),
        cells,
    }))
}

// ========================================
// WebSocket Handler
// ========================================

/// WebSocket upgrade handler
async fn websocket_handler(ws: WebSocketUpgrade, State(state): State<AppState>) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_websocket(socket, state))
}

/// Handle WebSocket connection
async fn handle_websocket(socket: WebSocket, state: AppState) {
    let (mut sender, mut receiver) = socket.split();
    let mut session = state.dispatcher.open();
    let conn_id = session.id();

    let auth_timeout = state.dispatcher.config().auth_timeout;
    let credentials = await_credentials(&mut receiver, &mut sender, state.auth.as_ref());
    if let Err(e) = session.authenticate_within(auth_timeout, credentials).await {
        let _ = sender
            .send(Message::Text(protocol::error_message(&e).to_string()))
            .await;
        let _ = sender.send(Message::Close(None)).await;
        return;
    }

    let Some(ctx) = session.context().cloned() else {
        return;
    };

    // Initial sync: everything this requester may read
    session.send_direct(protocol::values_message(&state.store.readable_snapshot(&ctx)));

    // Spawn task to forward the outbound queue to the socket
    let outbound = session.outbound();
    let mut send_task = tokio::spawn(async move {
        while let Some(text) = outbound.pop().await {
            if sender.send(Message::Text(text)).await.is_err() {
                return;
            }
        }
        // Queue closed: graceful close or overflow
        let _ = sender.send(Message::Close(None)).await;
    });

    let mut send_done = false;
    loop {
        tokio::select! {
            _ = &mut send_task => {
                send_done = true;
                break;
            }
            incoming = receiver.next() => match incoming {
                Some(Ok(Message::Text(text))) => handle_text(&state, &mut session, &ctx, &text).await,
                Some(Ok(Message::Close(_))) | None => {
                    tracing::info!(connection_id = %conn_id, "WebSocket client disconnected");
                    break;
                }
                Some(Err(e)) => {
                    tracing::warn!(connection_id = %conn_id, error = %e, "WebSocket error");
                    break;
                }
                Some(Ok(_)) => {}
            }
        }
    }

    session.close();
    let drained = send_done || tokio::time::timeout(DRAIN_GRACE, &mut send_task).await.is_ok();
    if !drained {
        send_task.abort();
    }
    session.close_now();
}

/// Read frames until an auth request arrives. Anything else is answered with
/// an error and ignored.
async fn await_credentials(
    receiver: &mut SplitStream<WebSocket>,
    sender: &mut SplitSink<WebSocket, Message>,
    auth: &dyn Authenticator,
) -> Option<UserContext> {
    while let Some(Ok(message)) = receiver.next().await {
        let text = match message {
            Message::Text(text) => text,
            Message::Close(_) => return None,
            _ => continue,
        };

        let error = match protocol::parse_request(&text) {
            Ok(ClientRequest::Auth { token }) => return auth.authenticate(&token),
            Ok(_) => Error::Unauthorized("authenticate first".to_string()),
            Err(e) => e,
        };
        let reply = protocol::error_message(&error).to_string();
        if sender.send(Message::Text(reply)).await.is_err() {
            return None;
        }
    }
    None
}

/// Dispatch one request frame from an authenticated client
async fn handle_text(state: &AppState, session: &mut Session, ctx: &UserContext, text: &str) {
    let replies = match protocol::parse_request(text) {
        Ok(ClientRequest::Get(keys)) => protocol::handle_get(&state.store, ctx, &keys),
        Ok(ClientRequest::Set(pairs)) => {
            // Replies are queued under the writer gate, ahead of later broadcasts
            let direct: &Session = session;
            protocol::handle_set_with(&state.store, ctx, pairs, |replies| {
                for reply in replies {
                    direct.send_direct(reply);
                }
            })
            .await;
            return;
        }
        Ok(ClientRequest::Subscribe(topics)) => {
            let reply = protocol::topics_message(protocol::SUBSCRIBED_KEY, &topics);
            match session.subscribe(topics) {
                Ok(()) => vec![reply],
                Err(e) => vec![protocol::error_message(&e)],
            }
        }
        Ok(ClientRequest::Unsubscribe(topics)) => match session.unsubscribe(&topics) {
            Ok(()) => vec![protocol::topics_message(protocol::UNSUBSCRIBED_KEY, &topics)],
            Err(e) => vec![protocol::error_message(&e)],
        },
        Ok(ClientRequest::Auth { .. }) => {
            vec![protocol::error_message(&Error::Conflict("already authenticated".to_string()))]
        }
        Err(e) => {
            tracing::debug!(connection_id = %session.id(), error = %e, "Bad client request");
            vec![protocol::error_message(&e)]
        }
    };

    for reply in replies {
        session.send_direct(reply);
    }
}
