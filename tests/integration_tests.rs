//! Integration tests using wiremock to simulate HTTP servers.

use bytes::Bytes;
use futures_util::future::BoxFuture;
use futures_util::stream;
use http::{HeaderMap, HeaderValue, StatusCode};
use serde::{Deserialize, Serialize};
use spindle::{
    Adapter, Body, BoxError, Client, ConnectErrorKind, CredentialProvider, Error, ErrorMode,
    Event, Hooks, MemoryCookieJar, PoolLimits, RateLimiter, RedirectPolicy, Request, RetryPolicy,
    Timeout, TimeoutPhase,
};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::io::AsyncReadExt;
use tokio_util::sync::CancellationToken;
use wiremock::matchers::{body_string, header, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

#[derive(Debug, Serialize, Deserialize, PartialEq)]
struct TestData {
    id: u32,
    name: String,
}

fn client_for(server: &MockServer) -> spindle::ClientBuilder {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
    Client::builder().base_url(server.uri()).unwrap()
}

#[tokio::test]
async fn test_successful_get_request() {
    let mock_server = MockServer::start().await;

    let response_data = TestData {
        id: 1,
        name: "Test".to_string(),
    };

    Mock::given(method("GET"))
        .and(path("/test"))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_json(&response_data)
                .insert_header("x-custom-header", "custom-value"),
        )
        .mount(&mock_server)
        .await;

    let client = client_for(&mock_server).build().unwrap();

    let response = client.get("/test").send().await.unwrap();

    assert_eq!(response.status.as_u16(), 200);
    assert_eq!(response.attempts, 1);
    assert!(!response.was_retried());
    assert!(!response.was_redirected());
    assert_eq!(response.header("x-custom-header"), Some("custom-value"));
    assert_eq!(response.url.path(), "/test");
    assert_eq!(response.json::<TestData>().await.unwrap(), response_data);
}

#[tokio::test]
async fn test_successful_post_request() {
    let mock_server = MockServer::start().await;

    let request_data = TestData {
        id: 0,
        name: "New".to_string(),
    };

    Mock::given(method("POST"))
        .and(path("/test"))
        .and(header("content-type", "application/json"))
        .and(body_string(r#"{"id":0,"name":"New"}"#))
        .respond_with(ResponseTemplate::new(201).set_body_string("created"))
        .expect(1)
        .mount(&mock_server)
        .await;

    let client = client_for(&mock_server).build().unwrap();

    let response = client.post("/test").json(&request_data).send().await.unwrap();

    assert_eq!(response.status, StatusCode::CREATED);
    assert_eq!(response.text().await.unwrap(), "created");
}

#[tokio::test]
async fn test_default_headers_and_query() {
    let mock_server = MockServer::start().await;

    Mock::given(method("GET"))
        .and(path("/test"))
        .and(header("user-agent", "test-agent"))
        .and(wiremock::matchers::query_param("page", "1"))
        .respond_with(ResponseTemplate::new(200))
        .expect(1)
        .mount(&mock_server)
        .await;

    let client = client_for(&mock_server)
        .default_header("User-Agent", "test-agent")
        .unwrap()
        .build()
        .unwrap();

    let response = client.get("/test").query("page", "1").send().await.unwrap();
    assert_eq!(response.status, StatusCode::OK);
}

#[tokio::test]
async fn test_head_request_has_no_body() {
    let mock_server = MockServer::start().await;

    Mock::given(method("HEAD"))
        .and(path("/test"))
        .respond_with(ResponseTemplate::new(200).set_body_string("ignored"))
        .mount(&mock_server)
        .await;

    let client = client_for(&mock_server).build().unwrap();

    let response = client.head("/test").send().await.unwrap();
    assert_eq!(response.status, StatusCode::OK);
    assert_eq!(response.bytes().await.unwrap().len(), 0);

    // The connection went back to the pool intact.
    let again = client.head("/test").send().await.unwrap();
    assert_eq!(again.status, StatusCode::OK);
    assert_eq!(client.pool_stats().connections, 1);
}

#[tokio::test]
async fn test_retry_on_503_then_success() {
    let mock_server = MockServer::start().await;
    let attempt_count = Arc::new(AtomicUsize::new(0));
    let attempt_count_clone = attempt_count.clone();

    // First two requests fail with 503, third succeeds
    Mock::given(method("GET"))
        .and(path("/test"))
        .respond_with(move |_req: &wiremock::Request| {
            let count = attempt_count_clone.fetch_add(1, Ordering::SeqCst);
            if count < 2 {
                ResponseTemplate::new(503).set_body_string("Unavailable")
            } else {
                ResponseTemplate::new(200).set_body_string("ok")
            }
        })
        .mount(&mock_server)
        .await;

    let events = Arc::new(Mutex::new(Vec::new()));
    let sink = events.clone();
    let client = client_for(&mock_server)
        .retry(
            RetryPolicy::exponential(3, Duration::from_millis(100), 2.0)
                .statuses([StatusCode::SERVICE_UNAVAILABLE]),
        )
        .event_listener(move |event: &Event| {
            if let Event::Retrying { attempt, delay, .. } = event {
                sink.lock().unwrap().push((*attempt, *delay));
            }
        })
        .build()
        .unwrap();

    let started = Instant::now();
    let response = client.get("/test").send().await.unwrap();

    assert_eq!(response.status, StatusCode::OK);
    assert_eq!(response.attempts, 3);
    assert!(response.was_retried());
    assert_eq!(attempt_count.load(Ordering::SeqCst), 3);
    assert!(started.elapsed() >= Duration::from_millis(300));
    assert_eq!(
        *events.lock().unwrap(),
        vec![
            (2, Duration::from_millis(100)),
            (3, Duration::from_millis(200))
        ]
    );
}

#[tokio::test]
async fn test_exhausted_status_retries_return_last_response() {
    let mock_server = MockServer::start().await;

    Mock::given(method("GET"))
        .and(path("/test"))
        .respond_with(ResponseTemplate::new(500).set_body_string("Server error"))
        .expect(3)
        .mount(&mock_server)
        .await;

    let client = client_for(&mock_server)
        .retry(RetryPolicy::fixed(3, Duration::from_millis(10)))
        .build()
        .unwrap();

    let response = client.get("/test").send().await.unwrap();
    assert_eq!(response.status, StatusCode::INTERNAL_SERVER_ERROR);
    assert_eq!(response.attempts, 3);
    assert_eq!(response.text().await.unwrap(), "Server error");
}

#[tokio::test]
async fn test_timeouts_exhaust_retries() {
    let mock_server = MockServer::start().await;

    Mock::given(method("GET"))
        .and(path("/slow"))
        .respond_with(ResponseTemplate::new(200).set_delay(Duration::from_millis(500)))
        .mount(&mock_server)
        .await;

    let client = client_for(&mock_server)
        .timeout(Timeout::default().read(Duration::from_millis(50)))
        .retry(RetryPolicy::fixed(2, Duration::from_millis(10)))
        .build()
        .unwrap();

    let result = client.get("/slow").send().await;

    match result {
        Err(Error::RetryExhausted {
            attempts,
            last_error,
        }) => {
            assert_eq!(attempts, 2);
            assert_eq!(last_error.timeout_phase(), Some(TimeoutPhase::Read));
        }
        _ => panic!("Expected RetryExhausted, got {:?}", result),
    }
    // Timed-out connections are never returned to the pool.
    assert_eq!(client.pool_stats().idle, 0);
}

#[tokio::test]
async fn test_read_timeout_without_retries() {
    let mock_server = MockServer::start().await;

    Mock::given(method("GET"))
        .and(path("/slow"))
        .respond_with(ResponseTemplate::new(200).set_delay(Duration::from_millis(500)))
        .mount(&mock_server)
        .await;

    let client = client_for(&mock_server).build().unwrap();

    let result = client
        .get("/slow")
        .timeout(Timeout::default().read(Duration::from_millis(50)))
        .send()
        .await;

    match result {
        Err(Error::Timeout { phase, timeout, .. }) => {
            assert_eq!(phase, TimeoutPhase::Read);
            assert_eq!(timeout, Duration::from_millis(50));
        }
        _ => panic!("Expected a read timeout, got {:?}", result),
    }
}

#[tokio::test]
async fn test_custom_retry_predicate() {
    let mock_server = MockServer::start().await;

    Mock::given(method("GET"))
        .and(path("/test"))
        .respond_with(ResponseTemplate::new(500).set_body_string("Server error"))
        .expect(1)
        .mount(&mock_server)
        .await;

    // Only 503 is worth another try
    let client = client_for(&mock_server)
        .retry(
            RetryPolicy::fixed(3, Duration::from_millis(10)).retry_if(|outcome, _attempt| {
                outcome.status() == Some(StatusCode::SERVICE_UNAVAILABLE)
            }),
        )
        .build()
        .unwrap();

    let response = client.get("/test").send().await.unwrap();
    assert_eq!(response.status.as_u16(), 500);
    assert_eq!(response.attempts, 1);
}

#[tokio::test]
async fn test_one_shot_body_is_not_resent() {
    let mock_server = MockServer::start().await;

    Mock::given(method("POST"))
        .and(path("/upload"))
        .respond_with(ResponseTemplate::new(503))
        .expect(1)
        .mount(&mock_server)
        .await;

    let client = client_for(&mock_server)
        .retry(RetryPolicy::fixed(3, Duration::from_millis(10)))
        .build()
        .unwrap();

    let body = Body::stream(stream::iter(vec![
        Ok::<_, std::io::Error>(Bytes::from_static(b"hello ")),
        Ok(Bytes::from_static(b"world")),
    ]));
    let result = client.post("/upload").body(body).send().await;

    assert!(
        matches!(result, Err(Error::BodyAlreadyConsumed)),
        "Expected BodyAlreadyConsumed, got {:?}",
        result
    );
}

#[tokio::test]
async fn test_streamed_bodies_are_resent_when_possible() {
    let mock_server = MockServer::start().await;
    let attempt_count = Arc::new(AtomicUsize::new(0));
    let attempt_count_clone = attempt_count.clone();

    Mock::given(method("POST"))
        .and(path("/upload"))
        .and(body_string("hello world"))
        .respond_with(move |_req: &wiremock::Request| {
            if attempt_count_clone.fetch_add(1, Ordering::SeqCst) == 0 {
                ResponseTemplate::new(503)
            } else {
                ResponseTemplate::new(200)
            }
        })
        .mount(&mock_server)
        .await;

    let client = client_for(&mock_server)
        .retry(RetryPolicy::fixed(2, Duration::from_millis(10)))
        .build()
        .unwrap();

    let replayable = Body::replayable(|| {
        stream::iter(vec![
            Ok::<_, std::io::Error>(Bytes::from_static(b"hello ")),
            Ok(Bytes::from_static(b"world")),
        ])
    });
    let response = client.post("/upload").body(replayable).send().await.unwrap();
    assert_eq!(response.status, StatusCode::OK);
    assert_eq!(response.attempts, 2);

    // A one-shot stream works too once the policy buffers it up front.
    attempt_count.store(0, Ordering::SeqCst);
    let one_shot = Body::stream(stream::iter(vec![
        Ok::<_, std::io::Error>(Bytes::from_static(b"hello ")),
        Ok(Bytes::from_static(b"world")),
    ]));
    let response = client
        .post("/upload")
        .body(one_shot)
        .retry(RetryPolicy::fixed(2, Duration::from_millis(10)).buffer_lazy_bodies(true))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status, StatusCode::OK);
    assert_eq!(response.attempts, 2);
}

#[tokio::test]
async fn test_307_preserves_method_and_body() {
    let mock_server = MockServer::start().await;

    Mock::given(method("POST"))
        .and(path("/old"))
        .respond_with(ResponseTemplate::new(307).insert_header("location", "/new"))
        .mount(&mock_server)
        .await;
    Mock::given(method("POST"))
        .and(path("/new"))
        .and(body_string("payload"))
        .respond_with(ResponseTemplate::new(200).set_body_string("moved"))
        .expect(1)
        .mount(&mock_server)
        .await;

    let client = client_for(&mock_server).build().unwrap();

    let response = client.post("/old").body("payload").send().await.unwrap();

    assert_eq!(response.status, StatusCode::OK);
    assert_eq!(response.url.path(), "/new");
    assert_eq!(response.history.len(), 1);
    assert_eq!(response.history[0].status, StatusCode::TEMPORARY_REDIRECT);
    assert!(response.was_redirected());
}

#[tokio::test]
async fn test_303_switches_to_bodiless_get() {
    let mock_server = MockServer::start().await;

    Mock::given(method("POST"))
        .and(path("/submit"))
        .respond_with(ResponseTemplate::new(303).insert_header("location", "/result"))
        .mount(&mock_server)
        .await;
    Mock::given(method("GET"))
        .and(path("/result"))
        .and(|req: &wiremock::Request| req.body.is_empty())
        .respond_with(ResponseTemplate::new(200).set_body_string("done"))
        .expect(1)
        .mount(&mock_server)
        .await;

    let client = client_for(&mock_server).build().unwrap();

    let response = client.post("/submit").body("form=data").send().await.unwrap();
    assert_eq!(response.status, StatusCode::OK);
    assert_eq!(response.text().await.unwrap(), "done");
}

#[tokio::test]
async fn test_too_many_redirects_carries_history() {
    let mock_server = MockServer::start().await;

    Mock::given(method("GET"))
        .and(path("/loop"))
        .respond_with(ResponseTemplate::new(302).insert_header("location", "/loop"))
        .mount(&mock_server)
        .await;

    let client = client_for(&mock_server)
        .redirect(RedirectPolicy::limited(3))
        .build()
        .unwrap();

    let result = client.get("/loop").send().await;

    match result {
        Err(Error::TooManyRedirects { max, history }) => {
            assert_eq!(max, 3);
            assert_eq!(history.len(), 3);
            assert!(history.iter().all(|r| r.status == StatusCode::FOUND));
        }
        _ => panic!("Expected TooManyRedirects, got {:?}", result),
    }
}

#[tokio::test]
async fn test_redirects_can_be_disabled_per_call() {
    let mock_server = MockServer::start().await;

    Mock::given(method("GET"))
        .and(path("/old"))
        .respond_with(ResponseTemplate::new(301).insert_header("location", "/new"))
        .mount(&mock_server)
        .await;

    let client = client_for(&mock_server).build().unwrap();

    let response = client
        .get("/old")
        .redirect(RedirectPolicy::none())
        .send()
        .await
        .unwrap();
    assert_eq!(response.status, StatusCode::MOVED_PERMANENTLY);
    assert_eq!(response.header("location"), Some("/new"));
}

#[tokio::test]
async fn test_token_bucket_delays_second_call() {
    let mock_server = MockServer::start().await;

    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(200))
        .mount(&mock_server)
        .await;

    let client = client_for(&mock_server)
        .rate_limiter(RateLimiter::token_bucket(1, 1, Duration::from_secs(1)))
        .build()
        .unwrap();

    let started = Instant::now();
    client.get("/a").send().await.unwrap();
    assert!(started.elapsed() < Duration::from_millis(500));
    client.get("/b").send().await.unwrap();
    assert!(started.elapsed() >= Duration::from_millis(900));

    // Bypassing the limiter costs nothing.
    let bypass = Instant::now();
    client.get("/c").without_rate_limit().send().await.unwrap();
    assert!(bypass.elapsed() < Duration::from_millis(500));
}

#[tokio::test]
async fn test_rate_limit_max_wait() {
    let mock_server = MockServer::start().await;

    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(200))
        .mount(&mock_server)
        .await;

    let client = client_for(&mock_server)
        .rate_limiter(
            RateLimiter::token_bucket(1, 1, Duration::from_secs(10))
                .max_wait(Duration::from_millis(100)),
        )
        .build()
        .unwrap();

    client.get("/a").send().await.unwrap();
    let result = client.get("/b").send().await;
    assert!(
        matches!(result, Err(Error::RateLimited { .. })),
        "Expected RateLimited, got {:?}",
        result
    );
}

#[tokio::test]
async fn test_keep_alive_connection_is_reused() {
    let mock_server = MockServer::start().await;

    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(200).set_body_string("pong"))
        .mount(&mock_server)
        .await;

    let client = client_for(&mock_server).build().unwrap();

    let first = client.get("/ping").send().await.unwrap();
    let second = client.get("/ping").send().await.unwrap();

    assert_eq!(first.text().await.unwrap(), "pong");
    assert_eq!(second.text().await.unwrap(), "pong");
    let stats = client.pool_stats();
    assert_eq!(stats.connections, 1);
    assert_eq!(stats.idle, 1);
    assert_eq!(stats.in_use, 0);

    client.close();
    assert_eq!(client.pool_stats().connections, 0);
    assert!(matches!(
        client.get("/ping").send().await,
        Err(Error::PoolClosed)
    ));
}

#[tokio::test]
async fn test_cancellation_releases_the_connection() {
    let mock_server = MockServer::start().await;

    Mock::given(method("GET"))
        .and(path("/slow"))
        .respond_with(ResponseTemplate::new(200).set_delay(Duration::from_secs(5)))
        .mount(&mock_server)
        .await;

    let client = client_for(&mock_server).build().unwrap();
    let cancel = CancellationToken::new();
    let canceller = cancel.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(100)).await;
        canceller.cancel();
    });

    let started = Instant::now();
    let result = client.get("/slow").cancel_token(cancel).send().await;

    assert!(
        matches!(result, Err(Error::Cancelled)),
        "Expected Cancelled, got {:?}",
        result
    );
    assert!(started.elapsed() < Duration::from_secs(2));
    assert_eq!(client.pool_stats().connections, 0);
}

#[tokio::test]
async fn test_streaming_response() {
    let mock_server = MockServer::start().await;
    let payload = "x".repeat(10_000);

    Mock::given(method("GET"))
        .and(path("/big"))
        .respond_with(ResponseTemplate::new(200).set_body_string(payload.clone()))
        .mount(&mock_server)
        .await;

    let client = client_for(&mock_server).build().unwrap();

    let mut response = client.get("/big").stream().await.unwrap();
    assert!(response.is_stream_open());
    assert_eq!(response.content_length(), Some(10_000));

    let mut received = 0;
    while let Some(chunk) = response.chunk().await.unwrap() {
        received += chunk.len();
    }
    assert_eq!(received, 10_000);
    assert!(!response.is_stream_open());
    assert_eq!(client.pool_stats().idle, 1);
}

#[tokio::test]
async fn test_large_bodies_stream_past_threshold() {
    let mock_server = MockServer::start().await;

    Mock::given(method("GET"))
        .and(path("/big"))
        .respond_with(ResponseTemplate::new(200).set_body_string("y".repeat(1000)))
        .mount(&mock_server)
        .await;
    Mock::given(method("GET"))
        .and(path("/small"))
        .respond_with(ResponseTemplate::new(200).set_body_string("tiny"))
        .mount(&mock_server)
        .await;

    let client = client_for(&mock_server)
        .stream_threshold(Some(100))
        .build()
        .unwrap();

    let small = client.get("/small").send().await.unwrap();
    assert!(!small.is_stream_open());
    assert_eq!(small.body(), Some(&b"tiny"[..]));

    let big = client.get("/big").send().await.unwrap();
    assert!(big.is_stream_open());
    assert_eq!(big.body(), None);
    assert_eq!(big.text().await.unwrap().len(), 1000);
}

#[tokio::test]
async fn test_chunked_request_body() {
    let mock_server = MockServer::start().await;

    Mock::given(method("PUT"))
        .and(path("/file"))
        .and(body_string("hello world"))
        .respond_with(ResponseTemplate::new(204))
        .expect(1)
        .mount(&mock_server)
        .await;

    let client = client_for(&mock_server).build().unwrap();

    let body = Body::stream(stream::iter(vec![
        Ok::<_, std::io::Error>(Bytes::from_static(b"hello ")),
        Ok(Bytes::from_static(b"world")),
    ]));
    let response = client.put("/file").body(body).send().await.unwrap();
    assert_eq!(response.status, StatusCode::NO_CONTENT);
}

#[tokio::test]
async fn test_hooks_transform_request_and_response() {
    let mock_server = MockServer::start().await;

    Mock::given(method("GET"))
        .and(path("/signed"))
        .and(header("x-signature", "sig-/signed"))
        .respond_with(ResponseTemplate::new(200))
        .expect(1)
        .mount(&mock_server)
        .await;

    let hooks = Hooks::new()
        .before("sign", |request: Request| {
            let signature = format!("sig-{}", request.url().path());
            Ok(request.with_header("x-signature", signature)?)
        })
        .after("tag", |mut response| {
            response
                .headers
                .insert("x-hooked", HeaderValue::from_static("yes"));
            Ok(response)
        });
    let client = client_for(&mock_server).hooks(hooks).build().unwrap();

    let response = client.get("/signed").send().await.unwrap();
    assert_eq!(response.header("x-hooked"), Some("yes"));
}

#[tokio::test]
async fn test_failing_hook_aborts_call() {
    let mock_server = MockServer::start().await;

    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(200))
        .expect(0)
        .mount(&mock_server)
        .await;

    let client = client_for(&mock_server)
        .hooks(Hooks::new().before("deny", |_| Err("not allowed".into())))
        .retry(RetryPolicy::fixed(3, Duration::from_millis(10)))
        .build()
        .unwrap();

    match client.get("/anything").send().await {
        Err(Error::Hook { name, .. }) => assert_eq!(name, "deny"),
        other => panic!("Expected a hook error, got {:?}", other),
    }
}

#[tokio::test]
async fn test_raise_for_status() {
    let mock_server = MockServer::start().await;

    Mock::given(method("GET"))
        .and(path("/missing"))
        .respond_with(ResponseTemplate::new(404).set_body_string("no such thing"))
        .mount(&mock_server)
        .await;

    let client = client_for(&mock_server)
        .raise_for_status(true)
        .build()
        .unwrap();

    match client.get("/missing").send().await {
        Err(Error::HttpStatus {
            status,
            raw_response,
            ..
        }) => {
            assert_eq!(status, StatusCode::NOT_FOUND);
            assert_eq!(raw_response, "no such thing");
        }
        other => panic!("Expected HttpStatus, got {:?}", other),
    }

    // Per-call override wins over the client setting.
    let response = client
        .get("/missing")
        .raise_for_status(false)
        .send()
        .await
        .unwrap();
    assert_eq!(response.status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_warn_mode_suppresses_errors() {
    let mock_server = MockServer::start().await;

    Mock::given(method("GET"))
        .and(path("/broken"))
        .respond_with(ResponseTemplate::new(500))
        .mount(&mock_server)
        .await;
    Mock::given(method("GET"))
        .and(path("/fine"))
        .respond_with(ResponseTemplate::new(200))
        .mount(&mock_server)
        .await;

    let suppressed = Arc::new(AtomicUsize::new(0));
    let failed = Arc::new(AtomicUsize::new(0));
    let (suppressed_count, failed_count) = (suppressed.clone(), failed.clone());
    let client = client_for(&mock_server)
        .error_mode(ErrorMode::Warn)
        .raise_for_status(true)
        .event_listener(move |event: &Event| match event {
            Event::Suppressed { .. } => {
                suppressed_count.fetch_add(1, Ordering::SeqCst);
            }
            Event::Failed { .. } => {
                failed_count.fetch_add(1, Ordering::SeqCst);
            }
            _ => {}
        })
        .build()
        .unwrap();

    assert!(client.get("/broken").fetch().await.unwrap().is_none());
    assert_eq!(suppressed.load(Ordering::SeqCst), 1);
    assert_eq!(failed.load(Ordering::SeqCst), 0);

    let fine = client.get("/fine").fetch().await.unwrap();
    assert_eq!(fine.map(|r| r.status), Some(StatusCode::OK));

    // `send` is unaffected by the error mode.
    assert!(client.get("/broken").send().await.is_err());
    assert_eq!(failed.load(Ordering::SeqCst), 1);
}

struct RotatingToken {
    token: Mutex<String>,
    refreshes: AtomicUsize,
}

impl CredentialProvider for RotatingToken {
    fn credentials(&self, _request: &Request) -> Result<HeaderMap, BoxError> {
        let token = self.token.lock().unwrap().clone();
        let mut headers = HeaderMap::new();
        headers.insert(
            "authorization",
            HeaderValue::try_from(format!("Bearer {}", token))?,
        );
        Ok(headers)
    }

    fn refresh(&self) -> BoxFuture<'_, Result<bool, BoxError>> {
        Box::pin(async move {
            self.refreshes.fetch_add(1, Ordering::SeqCst);
            *self.token.lock().unwrap() = "fresh".to_string();
            Ok::<_, BoxError>(true)
        })
    }
}

#[tokio::test]
async fn test_401_refreshes_credentials_once() {
    let mock_server = MockServer::start().await;

    Mock::given(method("GET"))
        .and(path("/secure"))
        .and(header("authorization", "Bearer fresh"))
        .respond_with(ResponseTemplate::new(200).set_body_string("welcome"))
        .mount(&mock_server)
        .await;
    Mock::given(method("GET"))
        .and(path("/secure"))
        .respond_with(ResponseTemplate::new(401))
        .mount(&mock_server)
        .await;

    let provider = Arc::new(RotatingToken {
        token: Mutex::new("stale".to_string()),
        refreshes: AtomicUsize::new(0),
    });
    let client = client_for(&mock_server)
        .credentials(provider.clone())
        .build()
        .unwrap();

    let response = client.get("/secure").send().await.unwrap();
    assert_eq!(response.status, StatusCode::OK);
    assert_eq!(response.attempts, 1);
    assert_eq!(provider.refreshes.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_cookies_round_trip() {
    let mock_server = MockServer::start().await;

    Mock::given(method("GET"))
        .and(path("/login"))
        .respond_with(ResponseTemplate::new(200).insert_header("set-cookie", "session=abc; Path=/"))
        .mount(&mock_server)
        .await;
    Mock::given(method("GET"))
        .and(path("/me"))
        .and(header("cookie", "theme=dark; session=abc"))
        .respond_with(ResponseTemplate::new(200))
        .expect(1)
        .mount(&mock_server)
        .await;

    let jar = Arc::new(MemoryCookieJar::new());
    let client = client_for(&mock_server)
        .cookie("theme", "dark")
        .unwrap()
        .cookie_store(jar.clone())
        .build()
        .unwrap();

    let login = client.get("/login").send().await.unwrap();
    assert_eq!(
        login.cookies(),
        vec![("session".to_string(), "abc".to_string())]
    );
    assert_eq!(jar.len(), 1);

    let me = client.get("/me").send().await.unwrap();
    assert_eq!(me.status, StatusCode::OK);
}

#[tokio::test]
async fn test_adapters_apply_by_prefix() {
    let mock_server = MockServer::start().await;

    Mock::given(method("GET"))
        .and(header("x-admin", "yes"))
        .respond_with(ResponseTemplate::new(200))
        .mount(&mock_server)
        .await;

    let client = client_for(&mock_server)
        .mount(
            format!("{}/admin/", mock_server.uri()),
            Adapter::new().header("x-admin", "yes").unwrap(),
        )
        .build()
        .unwrap();

    let admin = client.get("/admin/panel").send().await.unwrap();
    assert_eq!(admin.status, StatusCode::OK);

    let public = client.get("/public").send().await.unwrap();
    assert_eq!(public.status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_execute_all_keeps_input_order() {
    let mock_server = MockServer::start().await;

    Mock::given(method("GET"))
        .respond_with(|req: &wiremock::Request| {
            ResponseTemplate::new(200).set_body_string(req.url.path().to_string())
        })
        .mount(&mock_server)
        .await;

    let client = client_for(&mock_server).build().unwrap();
    let requests = (0..6)
        .map(|i| client.get(format!("/items/{}", i)).build().unwrap())
        .collect::<Vec<_>>();

    let results = client.execute_all(requests, Some(2)).await;

    assert_eq!(results.len(), 6);
    for (i, result) in results.into_iter().enumerate() {
        let body = result.unwrap().text().await.unwrap();
        assert_eq!(body, format!("/items/{}", i));
    }
    assert!(client.pool_stats().connections <= 2);
}

#[tokio::test]
async fn test_independent_responses_for_concurrent_gets() {
    let mock_server = MockServer::start().await;

    Mock::given(method("GET"))
        .respond_with(|req: &wiremock::Request| {
            ResponseTemplate::new(200).set_body_string(req.url.path().to_string())
        })
        .mount(&mock_server)
        .await;

    let client = client_for(&mock_server).build().unwrap();

    let (a, b) = tokio::join!(client.get("/a").send(), client.get("/b").send());
    assert_eq!(a.unwrap().text().await.unwrap(), "/a");
    assert_eq!(b.unwrap().text().await.unwrap(), "/b");
}

/// Accepts connections and reads each request until `until` shows up, then
/// hangs up without answering. Returns the base URL and the number of
/// requests that arrived in full.
async fn hang_up_server(until: &'static [u8]) -> (String, Arc<AtomicUsize>) {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let received = Arc::new(AtomicUsize::new(0));
    let counter = received.clone();
    tokio::spawn(async move {
        while let Ok((mut socket, _)) = listener.accept().await {
            let mut buf = Vec::new();
            let mut chunk = [0u8; 1024];
            loop {
                match socket.read(&mut chunk).await {
                    Ok(0) | Err(_) => break,
                    Ok(n) => buf.extend_from_slice(&chunk[..n]),
                }
                if buf.windows(until.len()).any(|w| w == until) {
                    counter.fetch_add(1, Ordering::SeqCst);
                    break;
                }
            }
        }
    });
    (format!("http://{}", addr), received)
}

#[tokio::test]
async fn test_post_is_not_resent_after_the_server_hangs_up() {
    let (base, received) = hang_up_server(b"payload").await;
    let client = Client::builder()
        .retry(RetryPolicy::fixed(3, Duration::from_millis(10)))
        .build()
        .unwrap();

    let err = client
        .post(format!("{}/charge", base))
        .body("payload")
        .send()
        .await
        .unwrap_err();

    assert!(
        matches!(
            err,
            Error::Connection {
                kind: ConnectErrorKind::Reset { request_sent: true },
                ..
            }
        ),
        "{:?}",
        err
    );
    assert_eq!(received.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_get_is_resent_after_the_server_hangs_up() {
    let (base, received) = hang_up_server(b"\r\n\r\n").await;
    let client = Client::builder()
        .retry(RetryPolicy::fixed(3, Duration::from_millis(10)))
        .build()
        .unwrap();

    let err = client
        .get(format!("{}/balance", base))
        .send()
        .await
        .unwrap_err();

    assert!(
        matches!(err, Error::RetryExhausted { attempts: 3, .. }),
        "{:?}",
        err
    );
    assert_eq!(received.load(Ordering::SeqCst), 3);
}

#[tokio::test]
async fn test_buffered_lazy_body_follows_307() {
    let mock_server = MockServer::start().await;

    Mock::given(method("POST"))
        .and(path("/old"))
        .respond_with(ResponseTemplate::new(307).insert_header("location", "/new"))
        .mount(&mock_server)
        .await;
    Mock::given(method("POST"))
        .and(path("/new"))
        .and(body_string("hello world"))
        .respond_with(ResponseTemplate::new(200))
        .expect(1)
        .mount(&mock_server)
        .await;

    let client = client_for(&mock_server).build().unwrap();

    let one_shot = Body::stream(stream::iter(vec![
        Ok::<_, std::io::Error>(Bytes::from_static(b"hello ")),
        Ok(Bytes::from_static(b"world")),
    ]));
    let response = client
        .post("/old")
        .body(one_shot)
        .retry(RetryPolicy::none().buffer_lazy_bodies(true))
        .send()
        .await
        .unwrap();

    assert_eq!(response.status, StatusCode::OK);
    assert_eq!(response.url.path(), "/new");
    assert_eq!(response.history.len(), 1);
}

#[tokio::test]
async fn test_status_error_body_is_bounded() {
    let mock_server = MockServer::start().await;

    Mock::given(method("GET"))
        .and(path("/huge"))
        .respond_with(ResponseTemplate::new(500).set_body_string("x".repeat(256 * 1024)))
        .mount(&mock_server)
        .await;

    let client = client_for(&mock_server)
        .stream_threshold(Some(1024))
        .raise_for_status(true)
        .build()
        .unwrap();

    match client.get("/huge").send().await {
        Err(Error::HttpStatus {
            status,
            raw_response,
            ..
        }) => {
            assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
            assert_eq!(raw_response.len(), 1024);
        }
        other => panic!("unexpected result: {:?}", other),
    }
    // The rest of the body was never read, so the connection was closed.
    assert_eq!(client.pool_stats().connections, 0);
}

#[tokio::test]
async fn test_per_host_cap_queues_the_third_request() {
    let mock_server = MockServer::start().await;

    Mock::given(method("GET"))
        .and(path("/slow"))
        .respond_with(ResponseTemplate::new(200).set_delay(Duration::from_millis(300)))
        .expect(3)
        .mount(&mock_server)
        .await;

    let client = client_for(&mock_server)
        .pool_limits(PoolLimits::default().max_connections_per_host(2))
        .build()
        .unwrap();

    let start = Instant::now();
    let (first, second, third) = tokio::join!(
        client.get("/slow").send(),
        client.get("/slow").send(),
        client.get("/slow").send(),
    );

    assert!(first.is_ok() && second.is_ok() && third.is_ok());
    assert!(start.elapsed() >= Duration::from_millis(600));
    assert_eq!(client.pool_stats().connections, 2);
}
