//! Standard behaviors shipped with the bus
//!
//! The default chain wires these in stage order: security-context
//! propagation (Authentication), validation (Validation), correlation
//! propagation (PreProcessing), retry and timeout (Processing), metrics
//! (Telemetry), with logging pinned first. Outcome counters for whole
//! dispatches (`command.success` and friends) are emitted by the bus itself;
//! the metrics behavior observes per-attempt handler durations.

use crate::bus::correlator::Correlator;
use crate::bus::pipeline::{Behavior, Next, Placement, PipelineContext, PipelineStage};
use crate::error::BusError;
use crate::metrics::SharedMetrics;
use crate::retry::{RetryPolicy, RetryableKind};
use crate::time_provider::SharedTimeProvider;
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, warn};

/// Logs dispatch start and outcome; pinned to the head of the chain
pub struct LoggingBehavior;

#[async_trait]
impl Behavior for LoggingBehavior {
    fn id(&self) -> &str {
        "logging"
    }

    fn placement(&self) -> Placement {
        Placement::First
    }

    async fn invoke(&self, ctx: &mut PipelineContext, next: Next<'_>) -> Result<(), BusError> {
        debug!(
            message_id = %ctx.envelope.id,
            message_type = %ctx.envelope.message_type,
            category = %ctx.envelope.category,
            correlation_id = %ctx.correlation_id,
            "dispatch started"
        );
        match next.run(ctx).await {
            Ok(()) => {
                debug!(
                    message_id = %ctx.envelope.id,
                    elapsed_ms = ctx.started_at.elapsed().as_millis() as u64,
                    "dispatch completed"
                );
                Ok(())
            }
            Err(err) => {
                ctx.record_failure(&err);
                warn!(
                    message_id = %ctx.envelope.id,
                    message_type = %ctx.envelope.message_type,
                    error = %err,
                    "dispatch failed"
                );
                Err(err)
            }
        }
    }
}

/// Observes per-attempt handler duration and outcome
pub struct MetricsBehavior {
    metrics: SharedMetrics,
}

impl MetricsBehavior {
    /// Creates the behavior over a collector
    #[must_use]
    pub fn new(metrics: SharedMetrics) -> Self {
        Self { metrics }
    }
}

#[async_trait]
impl Behavior for MetricsBehavior {
    fn id(&self) -> &str {
        "metrics"
    }

    fn placement(&self) -> Placement {
        Placement::AtStage(PipelineStage::Telemetry, 0)
    }

    async fn invoke(&self, ctx: &mut PipelineContext, next: Next<'_>) -> Result<(), BusError> {
        let started = Instant::now();
        let result = next.run(ctx).await;
        self.metrics
            .observe_duration("handler.duration", started.elapsed());
        match &result {
            Ok(()) => self.metrics.incr("handler.success", 1),
            Err(_) => self.metrics.incr("handler.error", 1),
        }
        result
    }
}

/// Enforces envelope invariants before anything else touches the handler
pub struct ValidationBehavior;

#[async_trait]
impl Behavior for ValidationBehavior {
    fn id(&self) -> &str {
        "validation"
    }

    fn placement(&self) -> Placement {
        Placement::AtStage(PipelineStage::Validation, 0)
    }

    async fn invoke(&self, ctx: &mut PipelineContext, next: Next<'_>) -> Result<(), BusError> {
        ctx.envelope.validate()?;
        if ctx.envelope.is_expired() {
            return Err(BusError::Expired {
                message_id: ctx.envelope.id,
                message_type: ctx.envelope.message_type.clone(),
            });
        }
        next.run(ctx).await
    }
}

/// Propagates the caller's security context into dispatch properties and
/// headers
pub struct SecurityContextBehavior;

#[async_trait]
impl Behavior for SecurityContextBehavior {
    fn id(&self) -> &str {
        "security-context"
    }

    fn placement(&self) -> Placement {
        Placement::AtStage(PipelineStage::Authentication, 0)
    }

    async fn invoke(&self, ctx: &mut PipelineContext, next: Next<'_>) -> Result<(), BusError> {
        if let Some(identity) = ctx.security.identity.clone() {
            ctx.properties.insert(
                "security.identity".to_string(),
                serde_json::json!(identity),
            );
            let roles: Vec<&String> = ctx.security.roles.iter().collect();
            ctx.properties
                .insert("security.roles".to_string(), serde_json::json!(roles));
            ctx.envelope
                .headers
                .entry("x-identity".to_string())
                .or_insert_with(|| serde_json::json!(identity));
        }
        next.run(ctx).await
    }
}

/// Stamps correlation ids onto outgoing envelopes and records causation
/// links
pub struct CorrelationBehavior {
    correlator: Arc<Correlator>,
}

impl CorrelationBehavior {
    /// Creates the behavior over the bus correlator
    #[must_use]
    pub fn new(correlator: Arc<Correlator>) -> Self {
        Self { correlator }
    }
}

#[async_trait]
impl Behavior for CorrelationBehavior {
    fn id(&self) -> &str {
        "correlation"
    }

    fn placement(&self) -> Placement {
        Placement::AtStage(PipelineStage::PreProcessing, 0)
    }

    async fn invoke(&self, ctx: &mut PipelineContext, next: Next<'_>) -> Result<(), BusError> {
        if ctx.envelope.correlation_id.is_none() {
            ctx.envelope.correlation_id = Some(ctx.correlation_id);
        }
        ctx.envelope
            .headers
            .entry("x-correlation-id".to_string())
            .or_insert_with(|| serde_json::json!(ctx.correlation_id.to_string()));
        if let Some(parent) = ctx.envelope.causation_id {
            self.correlator.record_causation(ctx.envelope.id, parent);
        }
        next.run(ctx).await
    }
}

/// Re-attempts the downstream chain per the registration's retry policy
pub struct RetryBehavior {
    default_policy: RetryPolicy,
    time: SharedTimeProvider,
}

impl RetryBehavior {
    /// Creates the behavior with the bus-wide default policy
    #[must_use]
    pub fn new(default_policy: RetryPolicy, time: SharedTimeProvider) -> Self {
        Self {
            default_policy,
            time,
        }
    }
}

#[async_trait]
impl Behavior for RetryBehavior {
    fn id(&self) -> &str {
        "retry"
    }

    fn placement(&self) -> Placement {
        Placement::AtStage(PipelineStage::Processing, 0)
    }

    async fn invoke(&self, ctx: &mut PipelineContext, next: Next<'_>) -> Result<(), BusError> {
        let policy = ctx
            .handler_options
            .retry
            .clone()
            .unwrap_or_else(|| self.default_policy.clone());
        let mut attempts = 0u32;
        loop {
            attempts += 1;
            ctx.retry_count = attempts - 1;
            match next.run(ctx).await {
                Ok(()) => return Ok(()),
                Err(err) => {
                    let may_retry = err.is_retryable()
                        && retryable_kind(&err).is_some_and(|kind| policy.permits(kind))
                        && policy.allows_another_attempt(attempts)
                        && !ctx.cancellation.is_cancelled();
                    if !may_retry {
                        return Err(err);
                    }
                    let delay = policy.delay_before_next(attempts);
                    warn!(
                        message_id = %ctx.envelope.id,
                        handler = %ctx.handler_options.name,
                        attempts,
                        delay_ms = delay.as_millis() as u64,
                        error = %err,
                        "handler failed, retrying"
                    );
                    self.time.sleep(delay).await;
                }
            }
        }
    }
}

fn retryable_kind(error: &BusError) -> Option<RetryableKind> {
    match error {
        BusError::Handler { .. } => Some(RetryableKind::HandlerError),
        BusError::Timeout { .. } => Some(RetryableKind::Timeout),
        BusError::Transport { .. } => Some(RetryableKind::WireError),
        _ => None,
    }
}

/// Bounds each attempt with the registration timeout (or the bus default);
/// on expiry the attempt's context is cancelled and `Timeout` surfaces
pub struct TimeoutBehavior;

#[async_trait]
impl Behavior for TimeoutBehavior {
    fn id(&self) -> &str {
        "timeout"
    }

    fn placement(&self) -> Placement {
        // Inside retry so every attempt gets a fresh deadline.
        Placement::AtStage(PipelineStage::Processing, 10)
    }

    async fn invoke(&self, ctx: &mut PipelineContext, next: Next<'_>) -> Result<(), BusError> {
        let limit = ctx.handler_options.timeout.unwrap_or(ctx.default_timeout);
        let parent = ctx.cancellation.clone();
        if parent.is_cancelled() {
            return Err(BusError::Cancelled);
        }
        // Each attempt runs under its own child token: a timed-out attempt
        // is cancelled without poisoning the dispatch for later retries.
        let attempt_token = parent.child_token();
        ctx.cancellation = attempt_token.clone();
        let started = Instant::now();
        let outcome = tokio::select! {
            result = tokio::time::timeout(limit, next.run(ctx)) => match result {
                Ok(inner) => inner,
                Err(_) => {
                    attempt_token.cancel();
                    Err(BusError::Timeout {
                        elapsed_ms: started.elapsed().as_millis() as u64,
                    })
                }
            },
            () = parent.cancelled() => Err(BusError::Cancelled),
        };
        ctx.cancellation = parent;
        outcome
    }
}
