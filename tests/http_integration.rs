use std::{
    collections::VecDeque,
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc, Mutex,
    },
    time::Duration,
};

use axum::{
    extract::State,
    http::{HeaderMap, HeaderName, HeaderValue, StatusCode, Uri},
    response::IntoResponse,
    Json, Router,
};
use serde_json::{json, Value as JsonValue};
use tenantcall_http::{
    ApiKeyHeader, BasicAuth, CallError, CallRequest, HookSettings, HttpTransport, Orchestrator,
    OrchestratorOptions, Transport,
};

#[derive(Clone)]
struct MockResponse {
    status: StatusCode,
    body: JsonValue,
    headers: Vec<(&'static str, &'static str)>,
    delay: Duration,
}

impl MockResponse {
    fn json(status: StatusCode, body: JsonValue) -> Self {
        Self {
            status,
            body,
            headers: Vec::new(),
            delay: Duration::from_millis(0),
        }
    }

    fn with_header(mut self, name: &'static str, value: &'static str) -> Self {
        self.headers.push((name, value));
        self
    }

    fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }
}

#[derive(Clone, Debug)]
struct Received {
    uri: String,
    headers: HeaderMap,
    body: String,
}

#[derive(Clone)]
struct MockState {
    responses: Arc<Mutex<VecDeque<MockResponse>>>,
    received: Arc<Mutex<Vec<Received>>>,
    hits: Arc<AtomicUsize>,
}

async fn scripted_handler(
    State(state): State<MockState>,
    uri: Uri,
    headers: HeaderMap,
    body: String,
) -> impl IntoResponse {
    state.hits.fetch_add(1, Ordering::SeqCst);
    state
        .received
        .lock()
        .expect("received log mutex must not be poisoned")
        .push(Received {
            uri: uri.to_string(),
            headers,
            body,
        });

    let response = {
        let mut queue = state
            .responses
            .lock()
            .expect("response queue mutex must not be poisoned");
        queue.pop_front().unwrap_or_else(|| {
            MockResponse::json(
                StatusCode::INTERNAL_SERVER_ERROR,
                json!({"error": "no mock response available"}),
            )
        })
    };

    if !response.delay.is_zero() {
        tokio::time::sleep(response.delay).await;
    }

    let mut headers = HeaderMap::new();
    for (name, value) in response.headers {
        headers.insert(HeaderName::from_static(name), HeaderValue::from_static(value));
    }
    (response.status, headers, Json(response.body))
}

struct TestServer {
    base_url: String,
    hits: Arc<AtomicUsize>,
    received: Arc<Mutex<Vec<Received>>>,
    task: tokio::task::JoinHandle<()>,
}

impl Drop for TestServer {
    fn drop(&mut self) {
        self.task.abort();
    }
}

impl TestServer {
    fn hits(&self) -> usize {
        self.hits.load(Ordering::SeqCst)
    }

    fn received(&self, index: usize) -> Received {
        self.received.lock().expect("received log mutex")[index].clone()
    }
}

async fn spawn_server(responses: Vec<MockResponse>) -> TestServer {
    let state = MockState {
        responses: Arc::new(Mutex::new(responses.into())),
        received: Arc::new(Mutex::new(Vec::new())),
        hits: Arc::new(AtomicUsize::new(0)),
    };

    let app = Router::new()
        .fallback(scripted_handler)
        .with_state(state.clone());

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
        .await
        .expect("must bind test listener");
    let address = listener.local_addr().expect("must have local addr");
    let task = tokio::spawn(async move {
        axum::serve(listener, app)
            .await
            .expect("mock server must run");
    });

    TestServer {
        base_url: format!("http://{address}"),
        hits: state.hits,
        received: state.received,
        task,
    }
}

#[tokio::test]
async fn json_response_is_parsed() {
    let server = spawn_server(vec![MockResponse::json(
        StatusCode::OK,
        json!({"items": [1, 2]}),
    )
    .with_header("x-request-id", "req-1")])
    .await;
    let api = Orchestrator::builder()
        .base_url(&server.base_url)
        .build()
        .expect("orchestrator must build");

    let response = api
        .call(CallRequest::get("/v1/items").query("limit", "2"))
        .await
        .expect("request must succeed");

    assert_eq!(response.status, 200);
    assert_eq!(response.body, json!({"items": [1, 2]}));
    assert_eq!(response.header("X-Request-Id"), Some("req-1"));
    assert_eq!(server.received(0).uri, "/v1/items?limit=2");
    assert_eq!(server.hits(), 1);
}

#[tokio::test]
async fn json_body_is_sent() {
    let server = spawn_server(vec![MockResponse::json(
        StatusCode::CREATED,
        json!({"id": 9}),
    )])
    .await;
    let api = Orchestrator::builder()
        .base_url(&server.base_url)
        .build()
        .unwrap();

    let response = api
        .post("/v1/items", json!({"name": "kit"}))
        .await
        .expect("post must succeed");

    assert_eq!(response.status, 201);
    let received = server.received(0);
    let sent: JsonValue = serde_json::from_str(&received.body).expect("body must be json");
    assert_eq!(sent, json!({"name": "kit"}));
    assert_eq!(
        received
            .headers
            .get("content-type")
            .and_then(|value| value.to_str().ok()),
        Some("application/json")
    );
}

#[tokio::test]
async fn error_message_is_extracted_from_body() {
    let server = spawn_server(vec![MockResponse::json(
        StatusCode::UNPROCESSABLE_ENTITY,
        json!({"error": {"message": "name missing", "code": "invalid"}}),
    )])
    .await;
    let api = Orchestrator::builder()
        .base_url(&server.base_url)
        .build()
        .unwrap();

    let err = api
        .post("/v1/items", json!({}))
        .await
        .expect_err("422 must fail");

    match err {
        CallError::Http(failure) => {
            assert_eq!(failure.status, 422);
            assert_eq!(failure.message, "name missing");
            assert_eq!(failure.response.body["error"]["code"], "invalid");
        }
        other => panic!("unexpected error: {other:?}"),
    }
}

#[tokio::test]
async fn rate_limited_request_is_retried() {
    let server = spawn_server(vec![
        MockResponse::json(StatusCode::TOO_MANY_REQUESTS, json!({"message": "slow down"}))
            .with_header("retry-after", "0"),
        MockResponse::json(StatusCode::OK, json!({"ok": true})),
    ])
    .await;
    let api = Orchestrator::builder()
        .provider("mock")
        .base_url(&server.base_url)
        .hook(429, HookSettings::retry().max_retries(2))
        .build()
        .unwrap();

    let response = api.get("/v1/limited").await.expect("retry must succeed");

    assert_eq!(response.body, json!({"ok": true}));
    assert_eq!(server.hits(), 2);
}

#[tokio::test]
async fn auth_headers_reach_the_server() {
    let server = spawn_server(vec![
        MockResponse::json(StatusCode::OK, json!({})),
        MockResponse::json(StatusCode::OK, json!({})),
    ])
    .await;

    let keyed = Orchestrator::builder()
        .base_url(&server.base_url)
        .auth(ApiKeyHeader::new("X-Api-Key", "secret"))
        .build()
        .unwrap();
    keyed.get("/v1/me").await.unwrap();

    let basic = Orchestrator::builder()
        .base_url(&server.base_url)
        .auth(BasicAuth::new("Aladdin", "open sesame"))
        .build()
        .unwrap();
    basic.get("/v1/me").await.unwrap();

    assert_eq!(
        server.received(0).headers.get("x-api-key").map(|v| v.as_bytes()),
        Some(&b"secret"[..])
    );
    assert_eq!(
        server
            .received(1)
            .headers
            .get("authorization")
            .map(|v| v.as_bytes()),
        Some(&b"Basic QWxhZGRpbjpvcGVuIHNlc2FtZQ=="[..])
    );
}

#[tokio::test]
async fn timeout_surfaces_as_network_error() {
    let server = spawn_server(vec![MockResponse::json(StatusCode::OK, json!({}))
        .with_delay(Duration::from_millis(500))])
    .await;
    let api = Orchestrator::builder()
        .options(OrchestratorOptions {
            timeout_ms: 50,
            base_url: Some(server.base_url.clone()),
            ..OrchestratorOptions::default()
        })
        .hook(503, HookSettings::retry())
        .build()
        .unwrap();

    let err = api.get("/v1/slow").await.expect_err("must time out");
    assert!(matches!(err, CallError::Network(_)));
    assert_eq!(server.hits(), 1);
}

#[tokio::test]
async fn transport_can_be_used_directly() {
    let server = spawn_server(vec![MockResponse::json(
        StatusCode::SERVICE_UNAVAILABLE,
        json!({"detail": "maintenance"}),
    )])
    .await;
    let transport = HttpTransport::new(Duration::from_secs(5));

    let request = tenantcall_http::TransportRequest {
        method: tenantcall_http::Method::GET,
        url: format!("{}/health", server.base_url)
            .parse()
            .expect("url must parse"),
        headers: Default::default(),
        body: None,
    };
    let err = transport
        .send(request)
        .await
        .expect_err("503 must be an error");

    match err {
        tenantcall_http::TransportError::Status(failure) => {
            assert_eq!(failure.status, 503);
            assert_eq!(failure.message, "maintenance");
        }
        other => panic!("unexpected error: {other:?}"),
    }
}
