use std::future::Future;
use std::time::Duration;

use async_trait::async_trait;

use crate::error::DecisionError;
use crate::types::{Decision, Event};

/// Source of approve/deny verdicts.
///
/// The handler treats a provider as an opaque function with unbounded
/// latency: it may answer instantly or after a human has weighed in.
#[async_trait]
pub trait DecisionProvider: Send + Sync {
    async fn decide(&self, event: &Event) -> Result<Decision, DecisionError>;

    /// Expected time to decide `event`, if the provider can tell up front.
    ///
    /// Under `DYNAMIC`, an estimate above the sync budget sends the event
    /// straight to the deferred path without attempting a synchronous answer.
    fn estimated_latency(&self, _event: &Event) -> Option<Duration> {
        None
    }
}

/// Provider that returns the same decision for every event.
#[derive(Debug, Clone)]
pub struct StaticDecisionProvider {
    decision: Decision,
}

impl StaticDecisionProvider {
    pub fn new(decision: Decision) -> Self {
        Self { decision }
    }

    /// Approves everything. Stand-in for real business logic.
    pub fn auto_approve() -> Self {
        Self::new(Decision::approve(
            "This request was autoapproved by our automated ETS subscriber.",
            "Automated AR Approval",
        ))
    }
}

#[async_trait]
impl DecisionProvider for StaticDecisionProvider {
    async fn decide(&self, _event: &Event) -> Result<Decision, DecisionError> {
        Ok(self.decision.clone())
    }
}

/// Adapts an async closure into a [`DecisionProvider`].
pub struct FnDecisionProvider<F> {
    decide: F,
    estimate: Option<Box<dyn Fn(&Event) -> Option<Duration> + Send + Sync>>,
}

impl<F, Fut> FnDecisionProvider<F>
where
    F: Fn(Event) -> Fut + Send + Sync,
    Fut: Future<Output = Result<Decision, DecisionError>> + Send + 'static,
{
    pub fn new(decide: F) -> Self {
        Self {
            decide,
            estimate: None,
        }
    }

    /// Attach a latency estimate used for `DYNAMIC` branch selection.
    pub fn with_estimate(
        mut self,
        estimate: impl Fn(&Event) -> Option<Duration> + Send + Sync + 'static,
    ) -> Self {
        self.estimate = Some(Box::new(estimate));
        self
    }
}

#[async_trait]
impl<F, Fut> DecisionProvider for FnDecisionProvider<F>
where
    F: Fn(Event) -> Fut + Send + Sync,
    Fut: Future<Output = Result<Decision, DecisionError>> + Send + 'static,
{
    async fn decide(&self, event: &Event) -> Result<Decision, DecisionError> {
        (self.decide)(event.clone()).await
    }

    fn estimated_latency(&self, event: &Event) -> Option<Duration> {
        self.estimate.as_ref().and_then(|estimate| estimate(event))
    }
}

/// Shorthand for [`FnDecisionProvider::new`].
pub fn decide_fn<F, Fut>(decide: F) -> FnDecisionProvider<F>
where
    F: Fn(Event) -> Fut + Send + Sync,
    Fut: Future<Output = Result<Decision, DecisionError>> + Send + 'static,
{
    FnDecisionProvider::new(decide)
}
