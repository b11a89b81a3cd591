use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use url::Url;

use crate::error::ProtocolViolation;

/// Name of the reserved object carrying protocol fields in an inbound body.
pub const METADATA_FIELD: &str = "_metadata";

/// Response contract assigned to a trigger subscription.
///
/// The mode is fixed when the subscription is registered. The receiver only
/// gets to choose a path at runtime under [`DispatchMode::Dynamic`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DispatchMode {
    /// Acknowledge with an empty 200; no decision is produced.
    FireAndForget,
    /// Respond with the decision inside the sync budget.
    Sync,
    /// Acknowledge immediately, deliver the decision through the callback.
    Async,
    /// Per-event choice between `Sync` and the deferred half of `Async`.
    Dynamic,
}

impl DispatchMode {
    pub fn as_str(self) -> &'static str {
        match self {
            DispatchMode::FireAndForget => "FIRE_AND_FORGET",
            DispatchMode::Sync => "SYNC",
            DispatchMode::Async => "ASYNC",
            DispatchMode::Dynamic => "DYNAMIC",
        }
    }
}

impl fmt::Display for DispatchMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for DispatchMode {
    type Err = ProtocolViolation;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "FIRE_AND_FORGET" => Ok(DispatchMode::FireAndForget),
            "SYNC" => Ok(DispatchMode::Sync),
            "ASYNC" => Ok(DispatchMode::Async),
            "DYNAMIC" => Ok(DispatchMode::Dynamic),
            other => Err(ProtocolViolation::UnknownDispatchMode(other.to_string())),
        }
    }
}

/// Unique identifier for an event invocation.
///
/// This is a strongly-typed wrapper to avoid accidental mixing
/// of event IDs with other string identifiers.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct EventId(pub String);

impl EventId {
    /// Fresh random identifier for events that arrive without one.
    pub fn generate() -> Self {
        EventId(uuid::Uuid::new_v4().to_string())
    }
}

impl fmt::Display for EventId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Trigger name, e.g. `identity-attributes-changed`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct EventType(pub String);

impl EventType {
    pub const IDENTITY_ATTRIBUTES_CHANGED: &'static str = "identity-attributes-changed";
    pub const ACCESS_REQUEST_PREAPPROVAL: &'static str = "access-request-preapproval";

    pub fn new(name: impl Into<String>) -> Self {
        EventType(name.into())
    }
}

impl fmt::Display for EventType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// One registered trigger route.
///
/// A pure configuration object: the path the dispatcher posts to, the
/// trigger it carries, and the response contract agreed at registration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Subscription {
    pub path: String,
    pub event_type: EventType,
    pub dispatch_mode: DispatchMode,
}

impl Subscription {
    pub fn new(
        path: impl Into<String>,
        event_type: impl Into<String>,
        dispatch_mode: DispatchMode,
    ) -> Self {
        Self {
            path: path.into(),
            event_type: EventType::new(event_type),
            dispatch_mode,
        }
    }

    /// The four reference subscriptions, one per dispatch mode.
    pub fn defaults() -> Vec<Subscription> {
        vec![
            Subscription::new(
                "/identity-attributes-changed",
                EventType::IDENTITY_ATTRIBUTES_CHANGED,
                DispatchMode::FireAndForget,
            ),
            Subscription::new(
                "/sync-access-request-preapproval",
                EventType::ACCESS_REQUEST_PREAPPROVAL,
                DispatchMode::Sync,
            ),
            Subscription::new(
                "/async-access-request-preapproval",
                EventType::ACCESS_REQUEST_PREAPPROVAL,
                DispatchMode::Async,
            ),
            Subscription::new(
                "/dynamic-access-request-preapproval",
                EventType::ACCESS_REQUEST_PREAPPROVAL,
                DispatchMode::Dynamic,
            ),
        ]
    }
}

/// Protocol fields supplied by the dispatcher alongside the payload.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EventMetadata {
    /// Where a deferred decision must be posted.
    pub callback_url: Option<String>,

    /// One-time secret authenticating the callback.
    pub secret: Option<String>,

    /// Latest instant a deferred decision is still accepted.
    pub response_deadline: Option<DateTime<Utc>>,
}

/// Resolved destination for a deferred decision.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CallbackTarget {
    pub url: String,
    pub secret: String,
}

/// `_metadata` as it appears on the wire.
#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct WireMetadata {
    invocation_id: Option<String>,
    #[serde(rename = "callbackURL")]
    callback_url: Option<String>,
    secret: Option<String>,
    response_mode: Option<String>,
    response_deadline: Option<DateTime<Utc>>,
}

/// A single notification instance.
///
/// Created by the transport layer on receipt and consumed exactly once by
/// the dispatch handler.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    pub id: EventId,
    pub event_type: EventType,
    pub dispatch_mode: DispatchMode,

    /// Event-specific fields, opaque to the receiver.
    pub payload: Map<String, Value>,

    pub metadata: EventMetadata,
}

impl Event {
    /// Create an event with an empty payload and no callback metadata.
    pub fn new(
        id: impl Into<String>,
        event_type: impl Into<String>,
        dispatch_mode: DispatchMode,
    ) -> Self {
        Self {
            id: EventId(id.into()),
            event_type: EventType::new(event_type),
            dispatch_mode,
            payload: Map::new(),
            metadata: EventMetadata::default(),
        }
    }

    /// Replace the payload.
    pub fn with_payload(mut self, payload: Map<String, Value>) -> Self {
        self.payload = payload;
        self
    }

    /// Attach the callback address and its one-time secret.
    pub fn with_callback(mut self, url: impl Into<String>, secret: impl Into<String>) -> Self {
        self.metadata.callback_url = Some(url.into());
        self.metadata.secret = Some(secret.into());
        self
    }

    /// Set the deferred response deadline.
    pub fn with_deadline(mut self, deadline: DateTime<Utc>) -> Self {
        self.metadata.response_deadline = Some(deadline);
        self
    }

    /// Build an event from an inbound JSON body posted to `subscription`.
    ///
    /// The route decides the event type and dispatch mode. A `responseMode`
    /// carried in `_metadata` must agree with the route.
    pub fn from_body(subscription: &Subscription, body: Value) -> Result<Self, ProtocolViolation> {
        let Value::Object(mut payload) = body else {
            return Err(ProtocolViolation::Malformed(
                "event body must be a JSON object".to_string(),
            ));
        };

        let wire: WireMetadata = match payload.remove(METADATA_FIELD) {
            Some(raw) => serde_json::from_value(raw).map_err(|err| {
                ProtocolViolation::Malformed(format!("invalid {METADATA_FIELD}: {err}"))
            })?,
            None => WireMetadata::default(),
        };

        if let Some(declared) = wire.response_mode.as_deref() {
            let declared: DispatchMode = declared.parse()?;
            if declared != subscription.dispatch_mode {
                return Err(ProtocolViolation::ModeMismatch {
                    expected: subscription.dispatch_mode,
                    declared,
                });
            }
        }

        Ok(Self {
            id: wire.invocation_id.map(EventId).unwrap_or_else(EventId::generate),
            event_type: subscription.event_type.clone(),
            dispatch_mode: subscription.dispatch_mode,
            payload,
            metadata: EventMetadata {
                callback_url: wire.callback_url,
                secret: wire.secret,
                response_deadline: wire.response_deadline,
            },
        })
    }

    /// Callback destination, required for modes that may defer.
    pub fn callback_target(&self) -> Result<CallbackTarget, ProtocolViolation> {
        let (Some(url), Some(secret)) = (
            self.metadata.callback_url.as_ref(),
            self.metadata.secret.as_ref(),
        ) else {
            return Err(ProtocolViolation::MissingCallback {
                mode: self.dispatch_mode,
            });
        };

        let parsed = Url::parse(url).map_err(|err| ProtocolViolation::InvalidCallbackUrl {
            url: url.clone(),
            message: err.to_string(),
        })?;
        if !matches!(parsed.scheme(), "http" | "https") {
            return Err(ProtocolViolation::InvalidCallbackUrl {
                url: url.clone(),
                message: format!("unsupported scheme '{}'", parsed.scheme()),
            });
        }

        Ok(CallbackTarget {
            url: url.clone(),
            secret: secret.clone(),
        })
    }
}

/// Approve/deny verdict for an event.
///
/// Immutable once produced; exactly one is generated per event.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Decision {
    pub approved: bool,
    pub comment: String,
    pub approver: String,
}

impl Decision {
    pub fn approve(comment: impl Into<String>, approver: impl Into<String>) -> Self {
        Self {
            approved: true,
            comment: comment.into(),
            approver: approver.into(),
        }
    }

    pub fn deny(comment: impl Into<String>, approver: impl Into<String>) -> Self {
        Self {
            approved: false,
            comment: comment.into(),
            approver: approver.into(),
        }
    }
}

/// What the transport layer must send back on the inbound connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ImmediateResponse {
    /// 200 with no body.
    Empty,
    /// 200 with `{}`.
    Ack,
    /// 202 with `{}`.
    Accepted,
    /// 200 with the decision as body.
    Decision(Decision),
    /// Best-effort error reply when the decision could not be produced.
    Failed { status: u16, message: String },
}

impl ImmediateResponse {
    pub fn status(&self) -> u16 {
        match self {
            ImmediateResponse::Empty | ImmediateResponse::Ack | ImmediateResponse::Decision(_) => 200,
            ImmediateResponse::Accepted => 202,
            ImmediateResponse::Failed { status, .. } => *status,
        }
    }

    /// JSON body, or `None` for an empty body.
    pub fn body(&self) -> Option<Value> {
        match self {
            ImmediateResponse::Empty => None,
            ImmediateResponse::Ack | ImmediateResponse::Accepted => Some(Value::Object(Map::new())),
            ImmediateResponse::Decision(decision) => serde_json::to_value(decision).ok(),
            ImmediateResponse::Failed { message, .. } => {
                Some(serde_json::json!({ "error": message }))
            }
        }
    }
}

/// Which protocol path an event took.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DispatchOutcome {
    /// Acknowledged; nothing further is owed by this invocation.
    Acked,
    /// Decision returned on the inbound connection.
    Responded(Decision),
    /// Decision delivered through the callback after the acknowledgment.
    AckedThenCallback(Decision),
    /// Decision could not be produced in the sync budget.
    Failed { reason: String },
    /// Deferred decision never reached the dispatcher.
    Lost { reason: String },
}

/// Lifecycle status of a deferred event.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum DeliveryStatus {
    Acked,
    Deciding,
    Delivering,
    Delivered,
    Lost,
}

/// Delivery status details.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct DeliveryState {
    pub status: DeliveryStatus,
    pub attempts: u32,
    pub last_error: Option<String>,
    pub deadline: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}
