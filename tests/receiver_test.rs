use std::collections::HashSet;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{json, Value};
use tokio::net::TcpListener;
use trigger_receiver::{
    decide_fn, router, CallbackClient, Decision, DecisionError, DecisionProvider, DispatchHandler,
    DispatchMode, Event, ReceiverConfig, RetryPolicy, StaticDecisionProvider, Subscription,
};
use wiremock::matchers::{body_json, method, path};
use wiremock::{Mock, MockServer, Request, Respond, ResponseTemplate};

const TOKEN: &str = "test-token";

/// Start the receiver on an ephemeral port; returns its base URL.
async fn start_receiver(config: ReceiverConfig, handler: DispatchHandler) -> String {
    let app = router(&config, Arc::new(handler));
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    format!("http://{addr}")
}

fn config() -> ReceiverConfig {
    ReceiverConfig {
        sync_budget_ms: 300,
        sync_margin_ms: 50,
        callback: RetryPolicy::default()
            .with_max_attempts(3)
            .with_backoff(10, 50, 0),
        ..ReceiverConfig::with_token(TOKEN)
    }
}

/// Approves every event after `delay`, counting calls.
fn handler(config: &ReceiverConfig, calls: Arc<AtomicU32>, delay: Duration) -> DispatchHandler {
    let provider = decide_fn(move |_event: Event| {
        let calls = calls.clone();
        async move {
            calls.fetch_add(1, Ordering::SeqCst);
            tokio::time::sleep(delay).await;
            Ok::<_, DecisionError>(Decision::approve(
                "This request was autoapproved by our automated ETS subscriber.",
                "Automated AR Approval",
            ))
        }
    });
    DispatchHandler::new(
        Arc::new(provider),
        CallbackClient::new(config.callback.clone()),
        config.handler_config(),
    )
}

async fn callback_dispatcher(secret: &str) -> MockServer {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/cb"))
        .and(body_json(json!({
            "secret": secret,
            "output": {
                "approved": true,
                "comment": "This request was autoapproved by our automated ETS subscriber.",
                "approver": "Automated AR Approval"
            }
        })))
        .respond_with(ResponseTemplate::new(200))
        .mount(&server)
        .await;
    server
}

async fn wait_for_requests(server: &MockServer, count: usize) -> usize {
    for _ in 0..100 {
        let seen = server.received_requests().await.unwrap().len();
        if seen >= count {
            return seen;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    server.received_requests().await.unwrap().len()
}

fn event_body(invocation_id: &str, callback_url: &str, secret: &str) -> Value {
    json!({
        "accessRequestId": "2c91808b7c28b350017c2a2ec5790aa1",
        "requestedFor": { "type": "IDENTITY", "id": "2c91808568c529c60168cca6f90c1313", "name": "William Wilson" },
        "requestedItems": [{ "id": "2c91808b6ef1d43e016efba0ce470904", "type": "ACCESS_PROFILE", "operation": "Add" }],
        "_metadata": {
            "invocationId": invocation_id,
            "callbackURL": callback_url,
            "secret": secret
        }
    })
}

#[tokio::test]
async fn sync_scenario_returns_decision() {
    let config = config();
    let calls = Arc::new(AtomicU32::new(0));
    let base = start_receiver(config.clone(), handler(&config, calls.clone(), Duration::ZERO)).await;

    let response = reqwest::Client::new()
        .post(format!("{base}/sync-access-request-preapproval"))
        .bearer_auth(TOKEN)
        .json(&json!({ "accessRequestId": "ar-1" }))
        .send()
        .await
        .unwrap();

    assert_eq!(response.status(), 200);
    let body: Value = response.json().await.unwrap();
    assert_eq!(body["approved"], true);
    assert_eq!(body["approver"], "Automated AR Approval");
    assert_eq!(calls.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn async_scenario_acks_then_calls_back() {
    let dispatcher = callback_dispatcher("s1").await;
    let config = config();
    let calls = Arc::new(AtomicU32::new(0));
    let base = start_receiver(
        config.clone(),
        handler(&config, calls.clone(), Duration::from_millis(100)),
    )
    .await;

    let response = reqwest::Client::new()
        .post(format!("{base}/async-access-request-preapproval"))
        .bearer_auth(TOKEN)
        .json(&event_body("inv-async", &format!("{}/cb", dispatcher.uri()), "s1"))
        .send()
        .await
        .unwrap();

    assert_eq!(response.status(), 200);
    let body: Value = response.json().await.unwrap();
    assert_eq!(body, json!({}));
    assert_eq!(dispatcher.received_requests().await.unwrap().len(), 0);

    assert_eq!(wait_for_requests(&dispatcher, 1).await, 1);
    assert_eq!(calls.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn dynamic_takes_both_branches() {
    let dispatcher = callback_dispatcher("s2").await;
    let callback_url = format!("{}/cb", dispatcher.uri());
    let client = reqwest::Client::new();

    let config = config();
    let fast = start_receiver(
        config.clone(),
        handler(&config, Arc::new(AtomicU32::new(0)), Duration::ZERO),
    )
    .await;
    let response = client
        .post(format!("{fast}/dynamic-access-request-preapproval"))
        .bearer_auth(TOKEN)
        .json(&event_body("inv-fast", &callback_url, "s2"))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 200);
    let body: Value = response.json().await.unwrap();
    assert_eq!(body["approved"], true);

    let slow_calls = Arc::new(AtomicU32::new(0));
    let slow = start_receiver(
        config.clone(),
        handler(&config, slow_calls.clone(), Duration::from_millis(600)),
    )
    .await;
    let response = client
        .post(format!("{slow}/dynamic-access-request-preapproval"))
        .bearer_auth(TOKEN)
        .json(&event_body("inv-slow", &callback_url, "s2"))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 202);
    let body: Value = response.json().await.unwrap();
    assert_eq!(body, json!({}));

    assert_eq!(wait_for_requests(&dispatcher, 1).await, 1);
    assert_eq!(slow_calls.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn redelivered_event_calls_back_once() {
    let dispatcher = callback_dispatcher("s3").await;
    let config = config();
    let base = start_receiver(
        config.clone(),
        handler(&config, Arc::new(AtomicU32::new(0)), Duration::from_millis(50)),
    )
    .await;
    let client = reqwest::Client::new();
    let body = event_body("inv-dup", &format!("{}/cb", dispatcher.uri()), "s3");

    for _ in 0..3 {
        let response = client
            .post(format!("{base}/async-access-request-preapproval"))
            .bearer_auth(TOKEN)
            .json(&body)
            .send()
            .await
            .unwrap();
        assert_eq!(response.status(), 200);
    }

    wait_for_requests(&dispatcher, 1).await;
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(dispatcher.received_requests().await.unwrap().len(), 1);
}

#[tokio::test]
async fn unauthenticated_request_never_reaches_core() {
    let config = config();
    let calls = Arc::new(AtomicU32::new(0));
    let base = start_receiver(config.clone(), handler(&config, calls.clone(), Duration::ZERO)).await;

    let response = reqwest::Client::new()
        .post(format!("{base}/sync-access-request-preapproval"))
        .json(&json!({}))
        .send()
        .await
        .unwrap();

    assert_eq!(response.status(), 401);
    let body: Value = response.json().await.unwrap();
    assert_eq!(body, json!({ "error": "The token was missing or invalid." }));
    assert_eq!(calls.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn custom_routes_are_registered() {
    let config = ReceiverConfig {
        routes: vec![Subscription::new(
            "/hooks/preapproval",
            "access-request-preapproval",
            DispatchMode::Sync,
        )],
        ..config()
    };
    let base = start_receiver(
        config.clone(),
        handler(&config, Arc::new(AtomicU32::new(0)), Duration::ZERO),
    )
    .await;
    let client = reqwest::Client::new();

    let response = client
        .post(format!("{base}/hooks/preapproval"))
        .bearer_auth(TOKEN)
        .json(&json!({}))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 200);

    let response = client
        .post(format!("{base}/sync-access-request-preapproval"))
        .bearer_auth(TOKEN)
        .json(&json!({}))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 404);
}

#[tokio::test]
async fn concurrent_events_are_independent() {
    let config = config();
    let provider = decide_fn(|event: Event| async move {
        if event.payload.get("fail").is_some() {
            Err(DecisionError::provider("boom"))
        } else {
            Ok(Decision::approve("ok", "bot"))
        }
    });
    let handler = DispatchHandler::new(
        Arc::new(provider),
        CallbackClient::new(config.callback.clone()),
        config.handler_config(),
    );
    let base = start_receiver(config, handler).await;
    let client = reqwest::Client::new();
    let url = format!("{base}/sync-access-request-preapproval");

    let failing = client.post(&url).bearer_auth(TOKEN).json(&json!({ "fail": true })).send();
    let passing = client.post(&url).bearer_auth(TOKEN).json(&json!({})).send();
    let (failing, passing) = tokio::join!(failing, passing);

    assert_eq!(failing.unwrap().status(), 500);
    assert_eq!(passing.unwrap().status(), 200);
}

/// Callback endpoint that counts callbacks whose secret has not been acked yet.
struct AckOrderCheck {
    acked: Arc<Mutex<HashSet<String>>>,
    early: Arc<AtomicU32>,
}

impl Respond for AckOrderCheck {
    fn respond(&self, request: &Request) -> ResponseTemplate {
        let body: Value = serde_json::from_slice(&request.body).unwrap_or_default();
        let secret = body["secret"].as_str().unwrap_or_default();
        if !self.acked.lock().unwrap().contains(secret) {
            self.early.fetch_add(1, Ordering::SeqCst);
        }
        ResponseTemplate::new(200)
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn callback_never_precedes_ack() {
    const EVENTS: usize = 50;

    let acked = Arc::new(Mutex::new(HashSet::new()));
    let early = Arc::new(AtomicU32::new(0));
    let dispatcher = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/cb"))
        .respond_with(AckOrderCheck {
            acked: acked.clone(),
            early: early.clone(),
        })
        .mount(&dispatcher)
        .await;

    let config = config();
    let handler = DispatchHandler::new(
        Arc::new(StaticDecisionProvider::auto_approve()),
        CallbackClient::new(config.callback.clone()),
        config.handler_config(),
    );
    let base = start_receiver(config, handler).await;
    let client = reqwest::Client::new();
    let callback_url = format!("{}/cb", dispatcher.uri());

    for i in 0..EVENTS {
        let secret = format!("secret-{i}");
        let response = client
            .post(format!("{base}/async-access-request-preapproval"))
            .bearer_auth(TOKEN)
            .json(&event_body(&format!("inv-order-{i}"), &callback_url, &secret))
            .send()
            .await
            .unwrap();
        acked.lock().unwrap().insert(secret);
        assert_eq!(response.status(), 200);
    }

    assert_eq!(wait_for_requests(&dispatcher, EVENTS).await, EVENTS);
    assert_eq!(early.load(Ordering::SeqCst), 0);
}

struct PanickingProvider;

#[async_trait]
impl DecisionProvider for PanickingProvider {
    async fn decide(&self, _event: &Event) -> Result<Decision, DecisionError> {
        panic!("provider bug")
    }
}

#[tokio::test]
async fn panicking_provider_still_gets_a_response() {
    let config = config();
    let handler = DispatchHandler::new(
        Arc::new(PanickingProvider),
        CallbackClient::new(config.callback.clone()),
        config.handler_config(),
    );
    let base = start_receiver(config, handler).await;

    let response = reqwest::Client::new()
        .post(format!("{base}/sync-access-request-preapproval"))
        .bearer_auth(TOKEN)
        .json(&json!({ "accessRequestId": "ar-1" }))
        .send()
        .await
        .unwrap();

    assert_eq!(response.status(), 500);
    let body: Value = response.json().await.unwrap();
    assert!(body["error"].is_string());
}
