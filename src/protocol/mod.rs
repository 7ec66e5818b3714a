//! Client wire protocol
//!
//! Requests:
//! - `{"brightness": 75, "gain": 2}` set (flat key -> value map)
//! - `{"get": ["brightness"]}`
//! - `{"subscribe": ["state"]}` / `{"unsubscribe": ["state:gain"]}`
//! - `{"auth": {"token": "..."}}` (accepted once, before anything else)
//!
//! Confirmations and broadcasts share the flat `{key: value}` shape; a
//! confirmation adds `"info": [changed keys]`. Errors are
//! `{"error": reason, "key": key}`, one per failed key. Subscription changes
//! are answered with `{"subscribed": [topics]}` / `{"unsubscribed": [topics]}`.
//! None of these reply keys may name a cell.

use crate::error::{Error, Result};
use crate::permission::UserContext;
use crate::state_store::{CellSnapshot, KeyOutcome, StateStore};
use crate::subscription::Topic;
use crate::value::Value;
use serde_json::{json, Map};

/// Key carrying the changed-key list on confirmations
pub const INFO_KEY: &str = "info";

pub const ERROR_KEY: &str = "error";
pub const SUBSCRIBED_KEY: &str = "subscribed";
pub const UNSUBSCRIBED_KEY: &str = "unsubscribed";

/// Reply keys that would be ambiguous as cell names
pub const RESERVED_KEYS: [&str; 4] = [INFO_KEY, ERROR_KEY, SUBSCRIBED_KEY, UNSUBSCRIBED_KEY];

pub fn is_reserved(key: &str) -> bool {
    RESERVED_KEYS.contains(&key)
}

/// Parsed client request
#[derive(Debug, Clone, PartialEq)]
pub enum ClientRequest {
    Auth { token: String },
    Get(Vec<String>),
    Set(Vec<(String, serde_json::Value)>),
    Subscribe(Vec<Topic>),
    Unsubscribe(Vec<Topic>),
}

/// Parse one text frame.
///
/// Single-entry objects named `get`, `subscribe`, `unsubscribe` or `auth`
/// with the right argument shape are queries; every other object is a set
/// request. Whether `auth` is acceptable is up to the connection state.
pub fn parse_request(text: &str) -> Result<ClientRequest> {
    let json: serde_json::Value =
        serde_json::from_str(text).map_err(|e| Error::Protocol(format!("malformed JSON: {}", e)))?;

    let serde_json::Value::Object(map) = json else {
        return Err(Error::Protocol("request must be a JSON object".to_string()));
    };

    if map.len() == 1 {
        if let Some((name, arg)) = map.iter().next() {
            match (name.as_str(), arg) {
                ("get", serde_json::Value::Array(items)) => {
                    return Ok(ClientRequest::Get(string_list(items)?));
                }
                ("subscribe", serde_json::Value::Array(items)) => {
                    return Ok(ClientRequest::Subscribe(topic_list(items)?));
                }
                ("unsubscribe", serde_json::Value::Array(items)) => {
                    return Ok(ClientRequest::Unsubscribe(topic_list(items)?));
                }
                ("auth", serde_json::Value::Object(credentials)) => {
                    let token = credentials
                        .get("token")
                        .and_then(|t| t.as_str())
                        .ok_or_else(|| Error::Protocol("auth requires a token".to_string()))?;
                    return Ok(ClientRequest::Auth {
                        token: token.to_string(),
                    });
                }
                _ => {}
            }
        }
    }

    Ok(ClientRequest::Set(map.into_iter().collect()))
}

fn string_list(items: &[serde_json::Value]) -> Result<Vec<String>> {
    items
        .iter()
        .map(|item| {
            item.as_str()
                .map(str::to_string)
                .ok_or_else(|| Error::Protocol("expected a list of strings".to_string()))
        })
        .collect()
}

fn topic_list(items: &[serde_json::Value]) -> Result<Vec<Topic>> {
    string_list(items)?.iter().map(|s| s.parse()).collect()
}

/// Error message for one failure
pub fn error_message(error: &Error) -> serde_json::Value {
    match error.key() {
        Some(key) => json!({ "error": error.reason(), "key": key }),
        None => json!({ "error": error.reason() }),
    }
}

/// Reply to a subscribe/unsubscribe, e.g. `{"subscribed": ["state"]}`
pub fn topics_message(reply_key: &str, topics: &[Topic]) -> serde_json::Value {
    let names: Vec<String> = topics.iter().map(ToString::to_string).collect();
    json!({ reply_key: names })
}

/// Flat `{key: value}` message for a set of snapshots (initial sync, REST view)
pub fn values_message(snapshots: &[CellSnapshot]) -> serde_json::Value {
    let values: Map<String, serde_json::Value> = snapshots
        .iter()
        .map(|snapshot| (snapshot.key.clone(), snapshot.value.to_json()))
        .collect();
    serde_json::Value::Object(values)
}

/// Answer a `get`: one values message for what could be read, then one error
/// per key that could not.
pub fn handle_get(store: &StateStore, ctx: &UserContext, keys: &[String]) -> Vec<serde_json::Value> {
    let mut values = Map::new();
    let mut errors = Vec::new();

    for key in keys {
        match store.get_value(key, ctx) {
            Ok(value) => {
                values.insert(key.clone(), value.to_json());
            }
            Err(e) => errors.push(error_message(&e)),
        }
    }

    let mut replies = Vec::with_capacity(errors.len() + 1);
    if !values.is_empty() {
        replies.push(serde_json::Value::Object(values));
    }
    replies.extend(errors);
    replies
}

/// Apply a set request as one batch and collect the replies.
pub async fn handle_set(
    store: &StateStore,
    ctx: &UserContext,
    pairs: Vec<(String, serde_json::Value)>,
) -> Vec<serde_json::Value> {
    let mut replies = Vec::new();
    handle_set_with(store, ctx, pairs, |built| replies = built).await;
    replies
}

/// Apply a set request as one batch. Each key succeeds or fails on its own.
///
/// `deliver` receives the confirmation and errors while the writer gate is
/// still held, so a reply queued there can never overtake the broadcast of a
/// later write by another client.
pub async fn handle_set_with<F>(
    store: &StateStore,
    ctx: &UserContext,
    pairs: Vec<(String, serde_json::Value)>,
    deliver: F,
) where
    F: FnOnce(Vec<serde_json::Value>),
{
    let mut errors = Vec::new();
    let mut batch = Vec::with_capacity(pairs.len());

    for (key, raw) in pairs {
        match Value::from_json(raw) {
            Some(value) => batch.push((key, value)),
            None => errors.push(error_message(&Error::InvalidValue {
                key,
                reason: "null and lists are not cell values".to_string(),
            })),
        }
    }

    if batch.is_empty() {
        deliver(errors);
        return;
    }

    // Confirm with the value as stored (after int -> float widening)
    let written: Vec<serde_json::Value> = batch
        .iter()
        .map(|(key, value)| match store.spec(key) {
            Some(spec) => value.clone().coerce_to(spec.validator.kind).to_json(),
            None => value.to_json(),
        })
        .collect();

    store
        .set_values_with(batch, ctx, move |outcomes| {
            deliver(set_replies(outcomes, written, errors))
        })
        .await;
}

fn set_replies(
    outcomes: &[KeyOutcome],
    written: Vec<serde_json::Value>,
    mut errors: Vec<serde_json::Value>,
) -> Vec<serde_json::Value> {
    let mut confirmation = Map::new();
    let mut changed = Vec::new();
    for (outcome, value) in outcomes.iter().zip(written) {
        match &outcome.result {
            Ok(_) => {
                changed.push(serde_json::Value::String(outcome.key.clone()));
                confirmation.insert(outcome.key.clone(), value);
            }
            Err(e) => errors.push(error_message(e)),
        }
    }

    let mut replies = Vec::with_capacity(errors.len() + 1);
    if !changed.is_empty() {
        confirmation.insert(INFO_KEY.to_string(), serde_json::Value::Array(changed));
        replies.push(serde_json::Value::Object(confirmation));
    }
    replies.extend(errors);
    replies
}
