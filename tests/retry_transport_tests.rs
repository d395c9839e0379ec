//! Retry transport integration tests against a scripted HTTP server.

use std::time::{Duration, Instant};

use tokio_util::sync::CancellationToken;
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

use prompt_pulse::transport::{RetryConfig, RetryTransport, TransportError};

fn transport(max_retries: u32, base_delay: Duration) -> RetryTransport {
    let client = reqwest::Client::builder()
        .timeout(Duration::from_secs(30))
        .build()
        .expect("client");
    RetryTransport::new(
        client,
        RetryConfig {
            max_retries,
            base_delay,
        },
        CancellationToken::new(),
    )
}

/// Script the server: `throttled` 429 responses, then 200s.
async fn scripted_server(throttled: u64) -> MockServer {
    let server = MockServer::start().await;
    if throttled > 0 {
        Mock::given(method("GET"))
            .and(path("/data"))
            .respond_with(ResponseTemplate::new(429))
            .up_to_n_times(throttled)
            .mount(&server)
            .await;
    }
    Mock::given(method("GET"))
        .and(path("/data"))
        .respond_with(ResponseTemplate::new(200).set_body_string("ok"))
        .mount(&server)
        .await;
    server
}

#[tokio::test]
async fn test_two_throttles_then_success_makes_three_calls() {
    let server = scripted_server(2).await;
    let transport = transport(3, Duration::from_millis(10));

    let started = Instant::now();
    let request = transport
        .client()
        .get(format!("{}/data", server.uri()))
        .build()
        .expect("request");
    let response = transport.execute(request).await.expect("execute");

    assert_eq!(response.status().as_u16(), 200);
    assert_eq!(server.received_requests().await.expect("requests").len(), 3);

    // Backoff minimums: 10ms + 20ms before the third call
    assert!(
        started.elapsed() >= Duration::from_millis(30),
        "elapsed {:?} shorter than the backoff schedule",
        started.elapsed()
    );
}

#[tokio::test]
async fn test_exhausted_budget_returns_final_throttle_response() {
    let server = scripted_server(10).await;
    let transport = transport(1, Duration::from_millis(5));

    let request = transport
        .client()
        .get(format!("{}/data", server.uri()))
        .build()
        .expect("request");
    let response = transport.execute(request).await.expect("execute");

    // Budget of 1 retry: exactly 2 calls, final 429 returned without error
    assert_eq!(response.status().as_u16(), 429);
    assert_eq!(server.received_requests().await.expect("requests").len(), 2);
}

#[tokio::test]
async fn test_retry_after_header_is_honored() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/data"))
        .respond_with(ResponseTemplate::new(429).insert_header("retry-after", "1"))
        .up_to_n_times(1)
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/data"))
        .respond_with(ResponseTemplate::new(200))
        .mount(&server)
        .await;

    // Base delay far below the header value; the header must win
    let transport = transport(3, Duration::from_millis(1));
    let request = transport
        .client()
        .get(format!("{}/data", server.uri()))
        .build()
        .expect("request");

    let started = Instant::now();
    let response = transport.execute(request).await.expect("execute");
    let elapsed = started.elapsed();

    assert_eq!(response.status().as_u16(), 200);
    assert!(elapsed >= Duration::from_secs(1), "slept less than retry-after");
    // Jitter caps the sleep at 1.25x; allow generous scheduling slack
    assert!(elapsed < Duration::from_millis(2000), "slept far past the jitter cap");
}

#[tokio::test]
async fn test_server_errors_pass_through_without_retry() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/data"))
        .respond_with(ResponseTemplate::new(500))
        .mount(&server)
        .await;

    let transport = transport(3, Duration::from_millis(5));
    let request = transport
        .client()
        .get(format!("{}/data", server.uri()))
        .build()
        .expect("request");
    let response = transport.execute(request).await.expect("execute");

    assert_eq!(response.status().as_u16(), 500);
    assert_eq!(
        server.received_requests().await.expect("requests").len(),
        1,
        "5xx must not be retried"
    );
}

#[tokio::test]
async fn test_post_bodies_replay_bit_identical() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/submit"))
        .respond_with(ResponseTemplate::new(429).insert_header("retry-after", "0"))
        .up_to_n_times(1)
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/submit"))
        .respond_with(ResponseTemplate::new(200))
        .mount(&server)
        .await;

    let transport = transport(3, Duration::from_millis(5));
    let request = transport
        .client()
        .post(format!("{}/submit", server.uri()))
        .json(&serde_json::json!({"payload": "exact-bytes"}))
        .build()
        .expect("request");
    let response = transport.execute(request).await.expect("execute");
    assert_eq!(response.status().as_u16(), 200);

    let requests = server.received_requests().await.expect("requests");
    assert_eq!(requests.len(), 2);
    assert_eq!(
        requests[0].body, requests[1].body,
        "retried body must be byte-identical"
    );
}

#[tokio::test]
async fn test_cancellation_interrupts_backoff() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/data"))
        .respond_with(ResponseTemplate::new(429).insert_header("retry-after", "30"))
        .mount(&server)
        .await;

    let cancel = CancellationToken::new();
    let client = reqwest::Client::new();
    let transport = RetryTransport::new(
        client,
        RetryConfig {
            max_retries: 3,
            base_delay: Duration::from_secs(30),
        },
        cancel.clone(),
    );

    let request = transport
        .client()
        .get(format!("{}/data", server.uri()))
        .build()
        .expect("request");

    let canceller = tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(100)).await;
        cancel.cancel();
    });

    let started = Instant::now();
    let result = transport.execute(request).await;
    canceller.await.expect("canceller");

    assert!(matches!(result, Err(TransportError::Cancelled)));
    assert!(
        started.elapsed() < Duration::from_secs(5),
        "cancellation must interrupt the sleep promptly"
    );
}
