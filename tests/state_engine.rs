//! End-to-end state engine scenarios
//!
//! Store + dispatcher + persistence wired the way the server wires them,
//! without the HTTP transport.

use camstate::catalog::{self, keys};
use camstate::permission::{PermissionEngine, PermissionSet, UserContext};
use camstate::persistence::{PersistenceConfig, PersistenceLayer, SqliteRepository};
use camstate::protocol;
use camstate::realtime_hub::{BroadcastDispatcher, DispatcherConfig, Session};
use camstate::state_store::StateStore;
use camstate::subscription::{SubscriptionRegistry, Topic};
use camstate::value::Value;
use camstate::Error;
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;

fn camera_store() -> Arc<StateStore> {
    let mut builder = StateStore::builder();
    builder.register_all(catalog::builtin()).unwrap();
    Arc::new(builder.build())
}

fn dispatcher(store: &Arc<StateStore>) -> Arc<BroadcastDispatcher> {
    let dispatcher = Arc::new(BroadcastDispatcher::new(
        store.clone(),
        Arc::new(SubscriptionRegistry::new()),
        DispatcherConfig::default(),
    ));
    dispatcher.clone().spawn();
    dispatcher
}

fn user(role: &str) -> UserContext {
    PermissionEngine::new()
        .resolve(role, role, PermissionSet::empty())
        .unwrap()
}

fn subscribed(dispatcher: &Arc<BroadcastDispatcher>, ctx: UserContext) -> Session {
    let mut session = dispatcher.open();
    session.authenticate(ctx).unwrap();
    session.subscribe(vec![Topic::StateChanges]).unwrap();
    session
}

async fn next(session: &mut Session) -> serde_json::Value {
    let text = tokio::time::timeout(Duration::from_secs(2), session.next_message())
        .await
        .expect("no message within 2s")
        .expect("session closed");
    serde_json::from_str(&text).unwrap()
}

#[tokio::test]
async fn brightness_write_reaches_viewer() {
    let store = camera_store();
    let dispatcher = dispatcher(&store);
    let admin = user("admin");
    let viewer_ctx = user("viewer");
    let mut viewer = subscribed(&dispatcher, viewer_ctx.clone());

    let err = store
        .set_value(keys::BRIGHTNESS, Value::Int(150), &admin)
        .await
        .unwrap_err();
    assert!(matches!(err, Error::InvalidValue { .. }));
    assert_eq!(store.version(keys::BRIGHTNESS), Some(0));

    let version = store
        .set_value(keys::BRIGHTNESS, Value::Int(75), &admin)
        .await
        .unwrap();
    assert_eq!(version, 1);
    assert_eq!(next(&mut viewer).await, json!({"brightness": 75}));

    let err = store
        .set_value(keys::BRIGHTNESS, Value::Int(80), &viewer_ctx)
        .await
        .unwrap_err();
    assert!(matches!(err, Error::PermissionDenied { .. }));
    assert_eq!(store.get_value(keys::BRIGHTNESS, &viewer_ctx).unwrap(), Value::Int(75));
}

#[tokio::test]
async fn sequential_writes_arrive_in_order_everywhere() {
    let store = camera_store();
    let dispatcher = dispatcher(&store);
    let operator = user("operator");
    let mut first = subscribed(&dispatcher, user("viewer"));
    let mut second = subscribed(&dispatcher, user("admin"));

    store.set_value(keys::CONTRAST, Value::Int(10), &operator).await.unwrap();
    store.set_value(keys::CONTRAST, Value::Int(20), &operator).await.unwrap();

    for session in [&mut first, &mut second] {
        assert_eq!(next(session).await, json!({"contrast": 10}));
        assert_eq!(next(session).await, json!({"contrast": 20}));
    }
}

#[tokio::test]
async fn batch_applies_keys_independently() {
    let store = camera_store();
    let dispatcher = dispatcher(&store);
    let operator = user("operator");
    let mut viewer = subscribed(&dispatcher, user("viewer"));

    let replies = protocol::handle_set(
        &store,
        &operator,
        vec![
            (keys::BRIGHTNESS.to_string(), json!(40)),
            (keys::CONTRAST.to_string(), json!(500)),
        ],
    )
    .await;

    assert_eq!(replies[0], json!({"brightness": 40, "info": ["brightness"]}));
    assert_eq!(replies[1]["key"], "contrast");
    assert!(replies[1]["error"].as_str().unwrap().starts_with("invalid value"));

    assert_eq!(store.version(keys::BRIGHTNESS), Some(1));
    assert_eq!(store.version(keys::CONTRAST), Some(0));

    // Only the applied key is broadcast
    assert_eq!(next(&mut viewer).await, json!({"brightness": 40}));
    store
        .set_value(keys::SHARPNESS, Value::Int(60), &operator)
        .await
        .unwrap();
    assert_eq!(next(&mut viewer).await, json!({"sharpness": 60}));
}

#[tokio::test]
async fn confirmation_never_overtakes_later_broadcast() {
    let store = camera_store();
    // Feed drained by hand so the second write lands before any dispatch
    let mut feed = store.change_feed();
    let dispatcher = Arc::new(BroadcastDispatcher::new(
        store.clone(),
        Arc::new(SubscriptionRegistry::new()),
        DispatcherConfig::default(),
    ));
    let mut writer = subscribed(&dispatcher, user("operator"));

    let direct = &writer;
    protocol::handle_set_with(
        &store,
        &user("operator"),
        vec![(keys::BRIGHTNESS.to_string(), json!(75))],
        |replies| {
            for reply in replies {
                direct.send_direct(reply);
            }
        },
    )
    .await;
    store
        .set_value(keys::BRIGHTNESS, Value::Int(80), &user("admin"))
        .await
        .unwrap();
    while let Ok(record) = feed.try_recv() {
        dispatcher.dispatch(&record);
    }

    let mut seen = Vec::new();
    while !writer.outbound().is_empty() {
        seen.push(next(&mut writer).await);
    }

    assert_eq!(
        seen,
        vec![
            json!({"brightness": 75, "info": ["brightness"]}),
            json!({"brightness": 75}),
            json!({"brightness": 80}),
        ]
    );
    assert_eq!(
        store.get_value(keys::BRIGHTNESS, &user("viewer")).unwrap(),
        Value::Int(80)
    );
}

#[tokio::test]
async fn guest_sees_nothing() {
    let store = camera_store();
    let dispatcher = dispatcher(&store);
    let mut guest = subscribed(&dispatcher, user("guest"));
    let mut viewer = subscribed(&dispatcher, user("viewer"));

    store
        .set_value(keys::GAIN, Value::Int(4), &user("operator"))
        .await
        .unwrap();

    assert_eq!(next(&mut viewer).await, json!({"gain": 4.0}));
    assert!(guest.outbound().is_empty());
    assert!(store.readable_snapshot(guest.context().unwrap()).is_empty());
}

#[tokio::test]
async fn persisted_value_survives_restarts() {
    let dir = tempfile::tempdir().unwrap();
    let url = format!("sqlite://{}", dir.path().join("state.db").display());
    let config = PersistenceConfig {
        debounce: Duration::from_millis(10),
        ..PersistenceConfig::default()
    };

    {
        let store = camera_store();
        let repo = Arc::new(SqliteRepository::connect(&url).await.unwrap());
        let persistence = Arc::new(PersistenceLayer::new(repo, config.clone()));
        persistence.clone().spawn(store.clone());

        store
            .set_value(keys::BRIGHTNESS, Value::Int(75), &user("operator"))
            .await
            .unwrap();

        // Graceful shutdown right after the write still makes it durable
        persistence.shutdown().await;
        assert_eq!(persistence.written_count(), 1);
        assert_eq!(persistence.pending_count(), 0);
    }

    // Restart twice with no further writes
    for _ in 0..2 {
        let store = camera_store();
        let repo = Arc::new(SqliteRepository::connect(&url).await.unwrap());
        let persistence = PersistenceLayer::new(repo, config.clone());

        assert_eq!(persistence.load_into(&store).await, 1);
        assert_eq!(
            store.get_value(keys::BRIGHTNESS, &user("viewer")).unwrap(),
            Value::Int(75)
        );
        assert_eq!(store.version(keys::BRIGHTNESS), Some(0));
    }
}
