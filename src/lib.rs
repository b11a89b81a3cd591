//! A webhook receiver for event-trigger subscriptions.
//!
//! An upstream dispatcher posts events over HTTP; each subscription carries
//! a dispatch mode that fixes how and when the receiver must answer:
//!
//! - `FIRE_AND_FORGET`: empty 200, nothing else owed.
//! - `SYNC`: the decision itself, inside the sync budget.
//! - `ASYNC`: an immediate `200 {}`, then the decision posted to the
//!   event's callback URL before its response deadline.
//! - `DYNAMIC`: per event, either of the two above (`202 {}` when deferred).
//!
//! ## Guarantees
//! - The acknowledgment is produced before any callback is issued
//! - At most one callback delivery per event id
//! - No callback attempt after the response deadline
//! - One event's failure never affects another
//!
//! ## Non-Guarantees
//! - Durability across restarts
//! - Delivery of late decisions (the dispatcher applies its default)
//! - Retry of inbound handling (the dispatcher owns redelivery)
//!
//! Approve/deny logic is not part of this crate: it is injected as a
//! [`DecisionProvider`].

mod ack;
mod callback;
mod config;
mod decision;
mod error;
mod handler;
mod server;
mod types;

pub use callback::{CallbackBody, CallbackClient, DeliveryReceipt, RetryPolicy};
pub use config::ReceiverConfig;
pub use decision::{decide_fn, DecisionProvider, FnDecisionProvider, StaticDecisionProvider};
pub use error::{
    AuthError,
    ConfigError,
    DecisionError,
    DeliveryError,
    FailureReason,
    ProtocolViolation,
    ReceiverError,
    AUTH_ERROR_MESSAGE,
};
pub use handler::{DeferredTask, DispatchHandler, HandleResult, HandlerConfig};
pub use server::{router, serve, AppState};
pub use types::{
    CallbackTarget,
    Decision,
    DeliveryState,
    DeliveryStatus,
    DispatchMode,
    DispatchOutcome,
    Event,
    EventId,
    EventMetadata,
    EventType,
    ImmediateResponse,
    Subscription,
    METADATA_FIELD,
};
