//! Request pipeline properties: deduplication, priority ordering, and
//! retry/backoff behavior against a scripted transport.

use std::sync::Arc;
use std::time::Duration;

use serde_json::json;

use emberlink::config::ApiConfig;
use emberlink::error::{Error, NetworkError};
use emberlink::http::{RequestOptions, RequestPipeline, RequestPriority};
use emberlink::storage::{MemoryStorage, TokenStore};
use emberlink::test_support::MockHttpTransport;

fn pipeline_with(transport: Arc<MockHttpTransport>) -> RequestPipeline {
    pipeline_with_config(transport, ApiConfig {
        base_url: "https://api.example.com".to_string(),
        ..Default::default()
    })
}

fn pipeline_with_config(transport: Arc<MockHttpTransport>, api: ApiConfig) -> RequestPipeline {
    let tokens = TokenStore::new(Arc::new(MemoryStorage::new()));
    RequestPipeline::new(api, transport, tokens)
}

// P1: concurrent identical GETs share one network call and one result.
#[tokio::test(start_paused = true)]
async fn dedup_concurrent_identical_gets_share_one_call() {
    let transport = MockHttpTransport::always(200, json!({"name": "Jamie"}));
    transport.set_delay(Duration::from_millis(50));
    let pipeline = pipeline_with(Arc::clone(&transport));

    // bypass_cache isolates deduplication from the response cache
    let options = || RequestOptions {
        bypass_cache: true,
        ..Default::default()
    };
    let (a, b) = tokio::join!(
        pipeline.get("/profile/me", None, options()),
        pipeline.get("/profile/me", None, options()),
    );

    assert_eq!(transport.call_count(), 1);
    assert_eq!(a.unwrap().body["name"], "Jamie");
    assert_eq!(b.unwrap().body["name"], "Jamie");
}

// Scenario: three GETs to /api/v1/profile/me fired synchronously before
// any resolves produce exactly one underlying HTTP call.
#[tokio::test(start_paused = true)]
async fn three_synchronous_gets_one_http_call() {
    let transport = MockHttpTransport::always(200, json!({"id": "u1"}));
    transport.set_delay(Duration::from_millis(20));
    let pipeline = pipeline_with(Arc::clone(&transport));

    let (a, b, c) = tokio::join!(
        pipeline.get("/profile/me", None, RequestOptions::default()),
        pipeline.get("/profile/me", None, RequestOptions::default()),
        pipeline.get("/profile/me", None, RequestOptions::default()),
    );

    assert_eq!(transport.call_count(), 1);
    assert!(a.is_ok() && b.is_ok() && c.is_ok());
    let calls = transport.calls();
    assert_eq!(calls[0].url, "https://api.example.com/api/v1/profile/me");
}

// Distinct requests never share a call.
#[tokio::test(start_paused = true)]
async fn dedup_distinguishes_different_requests() {
    let transport = MockHttpTransport::always(200, json!({}));
    transport.set_delay(Duration::from_millis(20));
    let pipeline = pipeline_with(Arc::clone(&transport));

    let (a, b) = tokio::join!(
        pipeline.get("/profile/u1", None, RequestOptions::default()),
        pipeline.get("/profile/u2", None, RequestOptions::default()),
    );
    assert!(a.is_ok() && b.is_ok());
    assert_eq!(transport.call_count(), 2);
}

// P2: with a full ceiling, a high-priority arrival cancels queued lows
// and dispatches before them.
#[tokio::test(start_paused = true)]
async fn priority_high_cancels_queued_lows() {
    let transport = MockHttpTransport::always(200, json!({}));
    transport.set_delay(Duration::from_millis(100));
    let api = ApiConfig {
        base_url: "https://api.example.com".to_string(),
        max_concurrent_requests: 1,
        ..Default::default()
    };
    let pipeline = pipeline_with_config(Arc::clone(&transport), api);

    // Occupies the single slot
    let first = {
        let pipeline = pipeline.clone();
        tokio::spawn(async move {
            pipeline
                .get("/profile/warmup", None, RequestOptions::default())
                .await
        })
    };
    tokio::time::sleep(Duration::from_millis(10)).await;

    // Queued behind the ceiling
    let low = {
        let pipeline = pipeline.clone();
        tokio::spawn(async move {
            pipeline
                .get("/analytics/batch", None, RequestOptions::default())
                .await
        })
    };
    tokio::time::sleep(Duration::from_millis(10)).await;

    // High-priority arrival cancels the queued low
    let high = {
        let pipeline = pipeline.clone();
        tokio::spawn(async move {
            pipeline
                .get("/messages/inbox", None, RequestOptions::default())
                .await
        })
    };

    let low_result = low.await.unwrap();
    assert!(
        low_result.unwrap_err().as_cancelled().is_some(),
        "queued low-priority request must surface as cancelled"
    );

    assert!(first.await.unwrap().is_ok());
    assert!(high.await.unwrap().is_ok());

    // The cancelled low never reached the transport
    let urls: Vec<String> = transport.calls().iter().map(|c| c.url.clone()).collect();
    assert_eq!(urls.len(), 2);
    assert!(urls[0].contains("/profile/warmup"));
    assert!(urls[1].contains("/messages/inbox"));
}

// P2: drain order is high before medium before low.
#[tokio::test(start_paused = true)]
async fn priority_drain_order_high_medium() {
    let transport = MockHttpTransport::always(200, json!({}));
    transport.set_delay(Duration::from_millis(100));
    let api = ApiConfig {
        base_url: "https://api.example.com".to_string(),
        max_concurrent_requests: 1,
        ..Default::default()
    };
    let pipeline = pipeline_with_config(Arc::clone(&transport), api);

    let warmup = {
        let pipeline = pipeline.clone();
        tokio::spawn(async move {
            pipeline
                .get("/profile/warmup", None, RequestOptions::default())
                .await
        })
    };
    tokio::time::sleep(Duration::from_millis(10)).await;

    // Enqueue medium first, then high; high must still dispatch first
    let medium = {
        let pipeline = pipeline.clone();
        tokio::spawn(async move {
            pipeline
                .get("/profile/other", None, RequestOptions::default())
                .await
        })
    };
    tokio::time::sleep(Duration::from_millis(10)).await;
    let high = {
        let pipeline = pipeline.clone();
        tokio::spawn(async move {
            pipeline
                .get("/chats/list", None, RequestOptions::default())
                .await
        })
    };

    assert!(warmup.await.unwrap().is_ok());
    assert!(high.await.unwrap().is_ok());
    assert!(medium.await.unwrap().is_ok());

    let urls: Vec<String> = transport.calls().iter().map(|c| c.url.clone()).collect();
    assert!(urls[1].contains("/chats/list"), "high dispatched before medium: {urls:?}");
    assert!(urls[2].contains("/profile/other"));
}

// P3: retryable failures are retried with growing delays, then succeed.
#[tokio::test(start_paused = true)]
async fn retry_retries_network_failures_then_succeeds() {
    let transport = MockHttpTransport::scripted_outcomes(vec![
        Err(Error::from(NetworkError::Timeout)),
        Err(Error::from(NetworkError::ConnectionFailed("reset".into()))),
        Ok(emberlink::http::RawResponse {
            status: 200,
            body: br#"{"ok":true}"#.to_vec(),
        }),
    ]);
    let pipeline = pipeline_with(Arc::clone(&transport));

    let started = tokio::time::Instant::now();
    let response = pipeline
        .get("/profile/me", None, RequestOptions::default())
        .await
        .unwrap();
    let elapsed = started.elapsed();

    assert_eq!(response.body["ok"], true);
    assert_eq!(transport.call_count(), 3);
    // Two backoff sleeps: at least base (500ms) + doubled (1000ms)
    assert!(elapsed >= Duration::from_millis(1500), "elapsed {elapsed:?}");
}

// P3: a retryable status exhausts the budget with growing delays and
// surfaces the normalized error.
#[tokio::test(start_paused = true)]
async fn retry_exhausts_on_persistent_server_error() {
    let transport = MockHttpTransport::always(503, json!({"message": "unavailable"}));
    let pipeline = pipeline_with(Arc::clone(&transport));

    let started = tokio::time::Instant::now();
    let err = pipeline
        .get("/profile/me", None, RequestOptions::default())
        .await
        .unwrap_err();
    let elapsed = started.elapsed();

    assert_eq!(err.api_status(), Some(503));
    // Initial attempt + max_retries (3)
    assert_eq!(transport.call_count(), 4);
    // Monotone backoff floor: 500 + 1000 + 2000
    assert!(elapsed >= Duration::from_millis(3500), "elapsed {elapsed:?}");
    // Jitter cap: at most 20% above each delay
    assert!(elapsed <= Duration::from_millis(4500), "elapsed {elapsed:?}");
}

// P3: non-retryable statuses fail immediately with zero retries.
#[tokio::test(start_paused = true)]
async fn retry_client_error_fails_fast() {
    let transport = MockHttpTransport::always(422, json!({"message": "bad bio"}));
    let pipeline = pipeline_with(Arc::clone(&transport));

    let started = tokio::time::Instant::now();
    let err = pipeline
        .post("/profile/update", Some(json!({"bio": ""})), RequestOptions::default())
        .await
        .unwrap_err();

    assert_eq!(err.api_status(), Some(422));
    assert!(err.to_string().contains("bad bio"));
    assert_eq!(transport.call_count(), 1);
    assert!(started.elapsed() < Duration::from_millis(100));
}

// Dedup and retry compose: concurrent callers of a retried request all
// resolve together from the single retried flow.
#[tokio::test(start_paused = true)]
async fn dedup_callers_share_retried_outcome() {
    let transport = MockHttpTransport::scripted_outcomes(vec![
        Err(Error::from(NetworkError::Timeout)),
        Ok(emberlink::http::RawResponse {
            status: 200,
            body: br#"{"n":7}"#.to_vec(),
        }),
    ]);
    transport.set_delay(Duration::from_millis(10));
    let pipeline = pipeline_with(Arc::clone(&transport));

    let options = || RequestOptions {
        bypass_cache: true,
        ..Default::default()
    };
    let (a, b) = tokio::join!(
        pipeline.get("/chats/list", None, options()),
        pipeline.get("/chats/list", None, options()),
    );

    assert_eq!(a.unwrap().body["n"], 7);
    assert_eq!(b.unwrap().body["n"], 7);
    // One initial attempt + one retry, shared by both callers
    assert_eq!(transport.call_count(), 2);
}
