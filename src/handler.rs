use std::any::Any;
use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures::FutureExt;
use tokio::sync::{oneshot, RwLock};
use tokio::task::JoinHandle;
use tokio::time::{timeout, timeout_at, Instant};
use tracing::{debug, error, info, warn};

use crate::callback::CallbackClient;
use crate::decision::DecisionProvider;
use crate::error::{DecisionError, ProtocolViolation};
use crate::types::{
    CallbackTarget, Decision, DeliveryState, DeliveryStatus, DispatchMode, DispatchOutcome, Event,
    EventId, ImmediateResponse,
};

#[cfg(feature = "metrics")]
fn metric_inc(name: &'static str) {
    metrics::increment_counter!(name);
}

#[cfg(not(feature = "metrics"))]
fn metric_inc(_name: &'static str) {}

type DecisionFuture = Pin<Box<dyn Future<Output = Result<Decision, DecisionError>> + Send>>;

type ClaimTable = Arc<RwLock<HashMap<EventId, Claim>>>;

/// Timing contract shared by every event the handler sees.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HandlerConfig {
    /// Time the dispatcher waits for an inline answer.
    pub sync_budget: Duration,

    /// Slack kept back from `sync_budget` for serialization and network.
    pub sync_margin: Duration,

    /// Deferred deadline used when the event does not carry one.
    pub default_response_deadline: Duration,
}

impl Default for HandlerConfig {
    fn default() -> Self {
        Self {
            sync_budget: Duration::from_secs(10),
            sync_margin: Duration::from_millis(500),
            default_response_deadline: Duration::from_secs(60 * 60),
        }
    }
}

impl HandlerConfig {
    /// Time actually granted to `decide` before the handler answers without it.
    pub fn effective_budget(&self) -> Duration {
        self.sync_budget.saturating_sub(self.sync_margin)
    }
}

#[derive(Debug, Clone)]
struct Claim {
    state: DeliveryState,
    expires_at: Instant,
}

/// Result of handing one event to the [`DispatchHandler`].
#[derive(Debug)]
pub struct HandleResult {
    /// What to send on the inbound connection.
    pub response: ImmediateResponse,

    /// Path taken as of the immediate response.
    pub outcome: DispatchOutcome,

    /// Work owed after the response, if the event took the deferred path.
    pub deferred: Option<DeferredTask>,
}

impl HandleResult {
    fn terminal(response: ImmediateResponse, outcome: DispatchOutcome) -> Self {
        Self {
            response,
            outcome,
            deferred: None,
        }
    }
}

/// Drives each inbound event through its dispatch mode.
///
/// Events are independent: the only shared state is the table of deferred
/// events already acknowledged, which keeps callback delivery at most once
/// per event id.
pub struct DispatchHandler {
    provider: Arc<dyn DecisionProvider>,
    callback: CallbackClient,
    config: HandlerConfig,
    claims: ClaimTable,
}

impl DispatchHandler {
    pub fn new(
        provider: Arc<dyn DecisionProvider>,
        callback: CallbackClient,
        config: HandlerConfig,
    ) -> Self {
        Self {
            provider,
            callback,
            config,
            claims: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    /// Handle `event` with the provider supplied at construction.
    pub async fn handle(&self, event: Event) -> Result<HandleResult, ProtocolViolation> {
        self.handle_with(event, self.provider.clone()).await
    }

    /// Handle `event`, deciding with `provider`.
    ///
    /// Protocol violations are reported before the provider is consulted.
    /// Any returned [`DeferredTask`] has not started; the caller sends
    /// `response` first and then spawns it.
    pub async fn handle_with(
        &self,
        event: Event,
        provider: Arc<dyn DecisionProvider>,
    ) -> Result<HandleResult, ProtocolViolation> {
        metric_inc("trigger.event.received");
        let result = match event.dispatch_mode {
            DispatchMode::FireAndForget => {
                HandleResult::terminal(ImmediateResponse::Empty, DispatchOutcome::Acked)
            }
            DispatchMode::Sync => self.respond_sync(&event, provider).await,
            DispatchMode::Async => {
                let target = event.callback_target()?;
                let pending = decision_future(provider, event.clone());
                self.acknowledge(event, target, pending, ImmediateResponse::Ack).await
            }
            DispatchMode::Dynamic => {
                let target = event.callback_target()?;
                self.respond_dynamic(event, target, provider).await
            }
        };
        Ok(result)
    }

    /// Current status of a deferred event, while it is still tracked.
    pub async fn delivery_status(&self, event_id: &EventId) -> Option<DeliveryState> {
        let guard = self.claims.read().await;
        guard.get(event_id).map(|claim| claim.state.clone())
    }

    async fn respond_sync(&self, event: &Event, provider: Arc<dyn DecisionProvider>) -> HandleResult {
        let budget = self.config.effective_budget();
        let result = match timeout(budget, decision_future(provider, event.clone())).await {
            Ok(result) => result,
            Err(_) => Err(budget_exceeded(budget)),
        };
        sync_result(&event.id, result)
    }

    /// Answer inline if the decision fits the budget, otherwise fall back to
    /// the deferred path with the same in-flight decision.
    async fn respond_dynamic(
        &self,
        event: Event,
        target: CallbackTarget,
        provider: Arc<dyn DecisionProvider>,
    ) -> HandleResult {
        let budget = self.config.effective_budget();

        if self.is_claimed(&event.id).await {
            return self.duplicate(&event.id, ImmediateResponse::Accepted);
        }

        if let Some(estimate) = provider.estimated_latency(&event) {
            if estimate > budget {
                debug!(event_id = %event.id, estimate_ms = estimate.as_millis() as u64, "deferring on latency estimate");
                let pending = decision_future(provider, event.clone());
                return self.acknowledge(event, target, pending, ImmediateResponse::Accepted).await;
            }
        }

        let mut pending = decision_future(provider, event.clone());
        let raced = timeout(budget, &mut pending).await;
        match raced {
            Ok(result) => sync_result(&event.id, result),
            Err(_) => {
                debug!(event_id = %event.id, budget_ms = budget.as_millis() as u64, "decision outran sync budget, deferring");
                self.acknowledge(event, target, pending, ImmediateResponse::Accepted).await
            }
        }
    }

    /// Claim the event for deferred delivery and hand back the task.
    async fn acknowledge(
        &self,
        event: Event,
        target: CallbackTarget,
        pending: DecisionFuture,
        ack: ImmediateResponse,
    ) -> HandleResult {
        let deadline_at = event.metadata.response_deadline.unwrap_or_else(|| {
            Utc::now()
                + chrono::Duration::from_std(self.config.default_response_deadline)
                    .unwrap_or_else(|_| chrono::Duration::hours(1))
        });
        let deadline = instant_for(deadline_at);

        if !self.claim(&event.id, deadline_at, deadline).await {
            return self.duplicate(&event.id, ack);
        }

        metric_inc("trigger.event.deferred");
        info!(event_id = %event.id, mode = %event.dispatch_mode, deadline = %deadline_at, "event acknowledged, decision deferred");

        HandleResult {
            response: ack,
            outcome: DispatchOutcome::Acked,
            deferred: Some(DeferredTask {
                event_id: event.id,
                target,
                deadline,
                pending,
                acked: None,
                callback: self.callback.clone(),
                claims: self.claims.clone(),
            }),
        }
    }

    fn duplicate(&self, event_id: &EventId, ack: ImmediateResponse) -> HandleResult {
        metric_inc("trigger.event.duplicate");
        info!(event_id = %event_id, "event already acknowledged, not scheduling another callback");
        HandleResult::terminal(ack, DispatchOutcome::Acked)
    }

    async fn is_claimed(&self, event_id: &EventId) -> bool {
        let guard = self.claims.read().await;
        guard
            .get(event_id)
            .is_some_and(|claim| claim.expires_at > Instant::now())
    }

    /// Insert a claim for `event_id`; false if a live claim already exists.
    async fn claim(&self, event_id: &EventId, deadline_at: DateTime<Utc>, expires_at: Instant) -> bool {
        let now = Instant::now();
        let mut guard = self.claims.write().await;
        guard.retain(|_, claim| claim.expires_at > now);

        if guard.contains_key(event_id) {
            return false;
        }
        guard.insert(
            event_id.clone(),
            Claim {
                state: DeliveryState {
                    status: DeliveryStatus::Acked,
                    attempts: 0,
                    last_error: None,
                    deadline: deadline_at,
                    updated_at: Utc::now(),
                },
                expires_at,
            },
        );
        true
    }
}

/// The deferred half of an `ASYNC` or deferred `DYNAMIC` event.
///
/// Finishes deciding, then delivers the decision through the callback
/// client. Never fails: errors are logged and recorded as a lost delivery.
///
/// When given an acknowledgment signal with [`DeferredTask::after_ack`],
/// deciding proceeds right away but delivery waits for the signal.
pub struct DeferredTask {
    event_id: EventId,
    target: CallbackTarget,
    deadline: Instant,
    pending: DecisionFuture,
    acked: Option<oneshot::Receiver<()>>,
    callback: CallbackClient,
    claims: ClaimTable,
}

impl fmt::Debug for DeferredTask {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DeferredTask")
            .field("event_id", &self.event_id)
            .field("callback_url", &self.target.url)
            .field("deadline", &self.deadline)
            .finish_non_exhaustive()
    }
}

impl DeferredTask {
    /// Hold the callback until `acked` fires or its sender is dropped.
    pub fn after_ack(mut self, acked: oneshot::Receiver<()>) -> Self {
        self.acked = Some(acked);
        self
    }

    /// Schedule the task on the current tokio runtime.
    pub fn spawn(self) -> JoinHandle<DispatchOutcome> {
        tokio::spawn(self.run())
    }

    pub async fn run(self) -> DispatchOutcome {
        let DeferredTask {
            event_id,
            target,
            deadline,
            pending,
            acked,
            callback,
            claims,
        } = self;

        update_claim(&claims, &event_id, DeliveryStatus::Deciding, 0, None).await;

        let (decided, acked) = tokio::join!(timeout_at(deadline, pending), ack_sent(acked, deadline));
        if !acked {
            warn!(event_id = %event_id, "acknowledgment not sent before response deadline");
            return lost(&claims, &event_id, 0, "acknowledgment not sent before deadline".to_string()).await;
        }

        let decision = match decided {
            Ok(Ok(decision)) => decision,
            Ok(Err(err)) => {
                warn!(event_id = %event_id, error = %err, "deferred decision failed, dispatcher will apply its default");
                return lost(&claims, &event_id, 0, err.to_string()).await;
            }
            Err(_) => {
                warn!(event_id = %event_id, "decision not ready before response deadline");
                return lost(&claims, &event_id, 0, "decision not ready before deadline".to_string()).await;
            }
        };

        update_claim(&claims, &event_id, DeliveryStatus::Delivering, 0, None).await;

        match callback
            .deliver(&target.url, &target.secret, &decision, deadline)
            .await
        {
            Ok(receipt) => {
                update_claim(&claims, &event_id, DeliveryStatus::Delivered, receipt.attempts, None).await;
                info!(event_id = %event_id, approved = decision.approved, "deferred decision delivered");
                DispatchOutcome::AckedThenCallback(decision)
            }
            Err(err) => lost(&claims, &event_id, err.attempts(), err.to_string()).await,
        }
    }
}

/// Provider call with panics turned into [`DecisionError::Provider`].
fn decision_future(provider: Arc<dyn DecisionProvider>, event: Event) -> DecisionFuture {
    Box::pin(async move {
        match AssertUnwindSafe(provider.decide(&event)).catch_unwind().await {
            Ok(result) => result,
            Err(payload) => {
                error!(event_id = %event.id, panic = panic_message(payload.as_ref()), "decision provider panicked");
                Err(DecisionError::provider("decision provider panicked"))
            }
        }
    })
}

fn panic_message(payload: &(dyn Any + Send)) -> &str {
    payload
        .downcast_ref::<&str>()
        .copied()
        .or_else(|| payload.downcast_ref::<String>().map(String::as_str))
        .unwrap_or("<non-string payload>")
}

async fn ack_sent(acked: Option<oneshot::Receiver<()>>, deadline: Instant) -> bool {
    match acked {
        Some(acked) => timeout_at(deadline, acked).await.is_ok(),
        None => true,
    }
}

fn budget_exceeded(budget: Duration) -> DecisionError {
    DecisionError::BudgetExceeded {
        budget_ms: u64::try_from(budget.as_millis()).unwrap_or(u64::MAX),
    }
}

fn sync_result(event_id: &EventId, result: Result<Decision, DecisionError>) -> HandleResult {
    match result {
        Ok(decision) => {
            metric_inc("trigger.event.responded");
            info!(event_id = %event_id, approved = decision.approved, "decision returned inline");
            HandleResult::terminal(
                ImmediateResponse::Decision(decision.clone()),
                DispatchOutcome::Responded(decision),
            )
        }
        Err(err) => {
            metric_inc("trigger.event.decision_failed");
            warn!(event_id = %event_id, error = %err, "no inline decision, dispatcher will apply its default");
            let status = match err {
                DecisionError::BudgetExceeded { .. } => 504,
                DecisionError::Provider(_) => 500,
            };
            HandleResult::terminal(
                ImmediateResponse::Failed {
                    status,
                    message: err.to_string(),
                },
                DispatchOutcome::Failed {
                    reason: err.to_string(),
                },
            )
        }
    }
}

/// Map a wall-clock deadline onto the tokio clock.
fn instant_for(deadline_at: DateTime<Utc>) -> Instant {
    let remaining = (deadline_at - Utc::now()).to_std().unwrap_or(Duration::ZERO);
    Instant::now() + remaining
}

async fn update_claim(
    claims: &ClaimTable,
    event_id: &EventId,
    status: DeliveryStatus,
    attempts: u32,
    last_error: Option<String>,
) {
    let mut guard = claims.write().await;
    if let Some(claim) = guard.get_mut(event_id) {
        claim.state.status = status;
        claim.state.attempts = attempts;
        claim.state.last_error = last_error;
        claim.state.updated_at = Utc::now();
    }
}

async fn lost(claims: &ClaimTable, event_id: &EventId, attempts: u32, reason: String) -> DispatchOutcome {
    metric_inc("trigger.event.lost");
    update_claim(claims, event_id, DeliveryStatus::Lost, attempts, Some(reason.clone())).await;
    DispatchOutcome::Lost { reason }
}
