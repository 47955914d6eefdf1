//! Presence subsystem: online/offline marks, group membership, and
//! typing propagation through the batcher.

use std::sync::Arc;
use std::time::Duration;

use serde_json::json;

use emberlink::batching::{BatchingConfig, BatchingManager, SignalType};
use emberlink::config::{ApiConfig, CoreConfig, RealtimeConfig};
use emberlink::connection::{Collaborators, ConnectionManager};
use emberlink::http::RequestPipeline;
use emberlink::presence::PresenceManager;
use emberlink::storage::{MemoryStorage, TokenStore};
use emberlink::test_support::{CaptureSink, MockHttpTransport, MockPubSubTransport};

struct Harness {
    presence: PresenceManager,
    connection: ConnectionManager,
    batching: BatchingManager,
    sink: Arc<CaptureSink>,
    http: Arc<MockHttpTransport>,
    pubsub: Arc<MockPubSubTransport>,
}

async fn harness() -> Harness {
    let config = CoreConfig {
        api: ApiConfig {
            base_url: "https://api.example.com".to_string(),
            ..Default::default()
        },
        realtime: RealtimeConfig {
            app_key: "test-app".to_string(),
            ..Default::default()
        },
        ..Default::default()
    };

    let http = MockHttpTransport::always(200, json!({"auth": "signed"}));
    let tokens = TokenStore::new(Arc::new(MemoryStorage::new()));
    tokens
        .store_session("token-1", "refresh-1", "u7")
        .await
        .unwrap();
    let pipeline = RequestPipeline::new(config.api.clone(), Arc::clone(&http) as _, tokens);

    let pubsub = MockPubSubTransport::new();
    let connection = ConnectionManager::new(
        config,
        pipeline,
        Arc::clone(&pubsub) as _,
        Collaborators::default(),
    );

    let sink = CaptureSink::new();
    let batching = BatchingManager::new(Arc::clone(&sink) as _, BatchingConfig::default());
    let presence = PresenceManager::new(connection.clone(), batching.clone());

    Harness {
        presence,
        connection,
        batching,
        sink,
        http,
        pubsub,
    }
}

#[tokio::test(start_paused = true)]
async fn connected_marks_online_and_joins_groups() {
    let harness = harness().await;
    harness.connection.connect().await.unwrap();
    harness.presence.handle_connected().await.unwrap();

    let urls: Vec<String> = harness.http.calls().iter().map(|c| c.url.clone()).collect();
    assert!(urls.iter().any(|url| url.contains("/presence/online")));

    let mut groups = harness.presence.joined_groups();
    groups.sort();
    assert_eq!(groups, vec!["presence-matches.u7", "presence-online"]);

    // Presence groups are wire-subscribed with signed authorization
    let conn = harness.pubsub.last_connection().unwrap();
    let subs = conn.subscriptions();
    assert!(subs.iter().any(|(name, auth)| name == "presence-online" && *auth));
}

#[tokio::test(start_paused = true)]
async fn disconnecting_marks_offline_and_leaves_groups() {
    let harness = harness().await;
    harness.connection.connect().await.unwrap();
    harness.presence.handle_connected().await.unwrap();

    harness.presence.handle_disconnecting().await.unwrap();

    assert!(harness.presence.joined_groups().is_empty());
    let urls: Vec<String> = harness.http.calls().iter().map(|c| c.url.clone()).collect();
    assert!(urls.iter().any(|url| url.contains("/presence/offline")));

    let conn = harness.pubsub.last_connection().unwrap();
    let mut left = conn.unsubscriptions();
    left.sort();
    assert_eq!(left, vec!["presence-matches.u7", "presence-online"]);
}

#[tokio::test(start_paused = true)]
async fn chat_presence_join_and_leave() {
    let harness = harness().await;
    harness.connection.connect().await.unwrap();

    harness.presence.join_chat_presence("c3").await;
    assert!(harness
        .presence
        .joined_groups()
        .contains(&"presence-chat.c3".to_string()));

    harness.presence.leave_chat_presence("c3").await;
    assert!(harness.presence.joined_groups().is_empty());
}

// Typing goes through the batching manager, not straight to the wire.
#[tokio::test(start_paused = true)]
async fn typing_routes_through_batcher() {
    let harness = harness().await;
    harness.connection.connect().await.unwrap();

    harness.presence.set_typing("c3", true).await.unwrap();
    harness.presence.set_typing("c3", false).await.unwrap();

    // Nothing delivered yet: signals sit in the typing batch
    assert!(harness.sink.batches().is_empty());
    assert_eq!(harness.batching.pending_len(SignalType::Typing).await, 1);

    harness.batching.flush_type(SignalType::Typing).await;
    let batches = harness.sink.batches();
    assert_eq!(batches.len(), 1);
    assert_eq!(batches[0].1.len(), 1);
    assert_eq!(batches[0].1[0].payload["is_typing"], false);
    assert_eq!(batches[0].1[0].user_id.as_deref(), Some("u7"));
}

// The presence heartbeat enqueues heartbeat signals while connected and
// stops once the connection goes away.
#[tokio::test(start_paused = true)]
async fn presence_heartbeat_follows_connection_state() {
    let harness = harness().await;
    harness.connection.connect().await.unwrap();

    let presence = PresenceManager::with_heartbeat_interval(
        harness.connection.clone(),
        harness.batching.clone(),
        Duration::from_millis(50),
    );
    presence.handle_connected().await.unwrap();

    tokio::time::sleep(Duration::from_millis(220)).await;
    let beats = harness.batching.pending_len(SignalType::Heartbeat).await;
    assert!(beats >= 1, "heartbeat signals accumulate while connected");

    harness.connection.disconnect().await.unwrap();
    harness.batching.flush_all().await;
    let flushed = harness.sink.batches().len();

    tokio::time::sleep(Duration::from_millis(300)).await;
    // No further heartbeats were enqueued after the disconnect
    assert_eq!(harness.batching.pending_len(SignalType::Heartbeat).await, 0);
    assert_eq!(harness.sink.batches().len(), flushed);
}
