//! HTTP client core behavior against a local mock server: retries, breaker
//! trip and reset, and status classification.

use broker_collab::{HttpClient, HttpError};
use std::time::Duration;
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

fn client(base_url: &str, breaker_threshold: u32, breaker_timeout: Duration) -> HttpClient {
    HttpClient::new(base_url, Duration::from_secs(2), breaker_threshold, breaker_timeout)
        .unwrap()
        .with_retry_base(Duration::from_millis(5))
}

#[tokio::test]
async fn server_errors_retry_then_exhaust() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/api/v1/rules"))
        .respond_with(ResponseTemplate::new(500))
        .expect(3)
        .mount(&server)
        .await;

    let client = client(&server.uri(), 5, Duration::from_secs(60));
    let err = client.get_json("/api/v1/rules", &[]).await.unwrap_err();
    assert!(matches!(err, HttpError::Exhausted { attempts: 3, .. }));
}

#[tokio::test]
async fn breaker_trips_after_threshold_calls_and_rejects_without_network() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/unstable"))
        .respond_with(ResponseTemplate::new(503))
        // Five failed calls × three attempts; the sixth call must never
        // reach the server.
        .expect(15)
        .mount(&server)
        .await;

    let client = client(&server.uri(), 5, Duration::from_secs(60));
    for _ in 0..5 {
        let err = client.get_json("/unstable", &[]).await.unwrap_err();
        assert!(err.is_transient());
    }

    assert!(client.breaker().is_open());
    let err = client.get_json("/unstable", &[]).await.unwrap_err();
    assert!(matches!(err, HttpError::BreakerOpen));
}

#[tokio::test]
async fn breaker_resets_after_timeout_and_first_success() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/flappy"))
        .respond_with(ResponseTemplate::new(500))
        .up_to_n_times(3)
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/flappy"))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({"ok": true})))
        .mount(&server)
        .await;

    let client = client(&server.uri(), 1, Duration::from_millis(50));

    // One failed call trips the breaker (threshold 1), eating the three 500s.
    client.get_json("/flappy", &[]).await.unwrap_err();
    assert!(client.breaker().is_open());
    assert!(matches!(
        client.get_json("/flappy", &[]).await.unwrap_err(),
        HttpError::BreakerOpen
    ));

    // After the open window the probe goes out and succeeds.
    tokio::time::sleep(Duration::from_millis(80)).await;
    let value = client.get_json("/flappy", &[]).await.unwrap().unwrap();
    assert_eq!(value["ok"], true);
    assert!(!client.breaker().is_open());
}

#[tokio::test]
async fn not_found_is_empty_data_not_failure() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/missing"))
        .respond_with(ResponseTemplate::new(404))
        .expect(1)
        .mount(&server)
        .await;

    let client = client(&server.uri(), 1, Duration::from_secs(60));
    let value = client.get_json("/missing", &[]).await.unwrap();
    assert!(value.is_none());
    assert!(!client.breaker().is_open());
}

#[tokio::test]
async fn client_errors_fail_fast_without_retry_or_breaker() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/bad"))
        .respond_with(ResponseTemplate::new(400).set_body_string("bad request"))
        .expect(1)
        .mount(&server)
        .await;

    let client = client(&server.uri(), 1, Duration::from_secs(60));
    let err = client.get_json("/bad", &[]).await.unwrap_err();
    assert!(matches!(err, HttpError::Client { status: 400, .. }));
    assert!(!err.is_transient());
    // A 4xx is the caller's problem, never the service's.
    assert!(!client.breaker().is_open());
}

#[tokio::test]
async fn transient_failures_recover_mid_call() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/wobbly"))
        .respond_with(ResponseTemplate::new(502))
        .up_to_n_times(2)
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/wobbly"))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({"n": 7})))
        .mount(&server)
        .await;

    let client = client(&server.uri(), 5, Duration::from_secs(60));
    let value = client.get_json("/wobbly", &[]).await.unwrap().unwrap();
    assert_eq!(value["n"], 7);
    // The call ultimately succeeded, so the breaker saw no failure.
    assert!(!client.breaker().is_open());
}

#[tokio::test]
async fn success_resets_accumulated_failures() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/ok"))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({})))
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/down"))
        .respond_with(ResponseTemplate::new(500))
        .mount(&server)
        .await;

    // Threshold 2: two failed calls would open the breaker, but a success
    // in between resets the count.
    let client = client(&server.uri(), 2, Duration::from_secs(60));
    client.get_json("/down", &[]).await.unwrap_err();
    client.get_json("/ok", &[]).await.unwrap();
    client.get_json("/down", &[]).await.unwrap_err();
    assert!(!client.breaker().is_open());
}
