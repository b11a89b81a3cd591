//! HTTP boundary: route registration, bearer-token check, response mapping.

use std::sync::Arc;

use axum::{
    body::Bytes,
    extract::{Request, State},
    http::{header::AUTHORIZATION, StatusCode},
    middleware::{self, Next},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde_json::{json, Value};
use subtle::ConstantTimeEq;
use tokio::net::TcpListener;
use tokio::sync::oneshot;
use tracing::{info, warn};

use crate::ack::notify_when_sent;
use crate::callback::CallbackClient;
use crate::config::ReceiverConfig;
use crate::decision::DecisionProvider;
use crate::error::{AuthError, ProtocolViolation, ReceiverError};
use crate::handler::DispatchHandler;
use crate::types::{Event, ImmediateResponse, Subscription};

/// Shared state for every route.
#[derive(Clone)]
pub struct AppState {
    handler: Arc<DispatchHandler>,
    expected_authorization: Arc<str>,
}

impl AppState {
    pub fn new(handler: Arc<DispatchHandler>, token: &str) -> Self {
        Self {
            handler,
            expected_authorization: Arc::from(format!("Bearer {token}")),
        }
    }
}

/// Build the router: one authenticated `POST` per subscription plus `GET /health`.
pub fn router(config: &ReceiverConfig, handler: Arc<DispatchHandler>) -> Router {
    let state = AppState::new(handler, &config.token);

    let mut triggers = Router::new();
    for subscription in &config.routes {
        let subscription = Arc::new(subscription.clone());
        let path = subscription.path.clone();
        triggers = triggers.route(
            &path,
            post(move |State(state): State<AppState>, body: Bytes| {
                let subscription = subscription.clone();
                async move { receive(state, subscription, body).await }
            }),
        );
    }

    triggers
        .route_layer(middleware::from_fn_with_state(state.clone(), require_bearer))
        .route("/health", get(health))
        .with_state(state)
}

/// Bind and serve until Ctrl-C.
pub async fn serve(
    config: ReceiverConfig,
    provider: Arc<dyn DecisionProvider>,
) -> Result<(), ReceiverError> {
    config.validate()?;

    let callback = CallbackClient::new(config.callback.clone());
    let handler = Arc::new(DispatchHandler::new(provider, callback, config.handler_config()));
    let app = router(&config, handler);

    let listener = TcpListener::bind(("0.0.0.0", config.port)).await?;
    let addr = listener.local_addr()?;
    for route in &config.routes {
        info!(path = %route.path, event_type = %route.event_type, mode = %route.dispatch_mode, "trigger route registered");
    }
    info!(%addr, "trigger receiver listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;
    info!("trigger receiver stopped");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(err) = tokio::signal::ctrl_c().await {
        warn!(error = %err, "failed to listen for shutdown signal");
        std::future::pending::<()>().await;
    }
}

async fn require_bearer(State(state): State<AppState>, request: Request, next: Next) -> Response {
    let presented = request
        .headers()
        .get(AUTHORIZATION)
        .and_then(|value| value.to_str().ok());

    if token_matches(presented, &state.expected_authorization) {
        next.run(request).await
    } else {
        warn!(path = %request.uri().path(), "rejected request with missing or invalid token");
        (
            StatusCode::UNAUTHORIZED,
            Json(json!({ "error": AuthError.to_string() })),
        )
            .into_response()
    }
}

fn token_matches(presented: Option<&str>, expected: &str) -> bool {
    let Some(presented) = presented else {
        return false;
    };
    presented.as_bytes().ct_eq(expected.as_bytes()).into()
}

/// Parse the body, run the core, and hand off deferred work that delivers
/// only after the response has been written.
async fn receive(state: AppState, subscription: Arc<Subscription>, body: Bytes) -> Response {
    let value: Value = match serde_json::from_slice(&body) {
        Ok(value) => value,
        Err(err) => return reject(&subscription, ProtocolViolation::Malformed(err.to_string())),
    };

    let event = match Event::from_body(&subscription, value) {
        Ok(event) => event,
        Err(violation) => return reject(&subscription, violation),
    };
    let event_id = event.id.clone();

    match state.handler.handle(event).await {
        Ok(result) => {
            info!(
                path = %subscription.path,
                event_id = %event_id,
                mode = %subscription.dispatch_mode,
                status = result.response.status(),
                "event handled"
            );
            let response = to_http(&result.response);
            match result.deferred {
                Some(task) => {
                    let (sent, acked) = oneshot::channel();
                    task.after_ack(acked).spawn();
                    notify_when_sent(response, sent)
                }
                None => response,
            }
        }
        Err(violation) => reject(&subscription, violation),
    }
}

fn reject(subscription: &Subscription, violation: ProtocolViolation) -> Response {
    warn!(path = %subscription.path, error = %violation, "rejected event");
    (
        StatusCode::BAD_REQUEST,
        Json(json!({ "error": violation.to_string() })),
    )
        .into_response()
}

fn to_http(response: &ImmediateResponse) -> Response {
    let status =
        StatusCode::from_u16(response.status()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
    match response.body() {
        Some(body) => (status, Json(body)).into_response(),
        None => status.into_response(),
    }
}

/// GET /health
async fn health() -> Json<Value> {
    Json(json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION"),
    }))
}
