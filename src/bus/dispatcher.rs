//! Message bus dispatch surface
//!
//! Wires the handler registry, behavior chain, flow controller, correlator,
//! dead-letter queue, and query cache into the Send/Publish/Query operations.

use crate::config::BusConfig;
use crate::domain_types::MessageType;
use crate::error::{BusError, ConfigError, FailureReason, HandlerFailure, PublishFailure};
use crate::message::{
    Command, Envelope, Event, MessageCategory, Query, command_envelope, event_envelope,
    query_envelope,
};
use crate::metrics::{AtomicMetrics, SharedMetrics};
use crate::security::SecurityContext;
use crate::time_provider::{SharedTimeProvider, production_time_provider};
use std::collections::HashMap;
use std::future::Future;
use std::marker::PhantomData;
use std::sync::{Arc, Mutex, RwLock};
use std::time::{Duration, Instant};
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use super::behaviors::{
    CorrelationBehavior, LoggingBehavior, MetricsBehavior, RetryBehavior, SecurityContextBehavior,
    TimeoutBehavior, ValidationBehavior,
};
use super::correlator::Correlator;
use super::dead_letter::DeadLetterQueue;
use super::flow_control::FlowController;
use super::pipeline::{Behavior, BehaviorChain, PipelineContext, TerminalHandler};
use super::registry::{HandlerEntry, HandlerOptions, HandlerRegistry, MessageHandler, Subscription};

/// Caller-side context for one bus operation
#[derive(Clone)]
pub struct CallContext {
    /// Identity on whose behalf the operation runs
    pub security: SecurityContext,
    /// Cooperative cancellation handle, propagated to child tasks
    pub cancellation: CancellationToken,
}

impl CallContext {
    /// Creates a context with the given identity and a fresh token
    #[must_use]
    pub fn new(security: SecurityContext) -> Self {
        Self {
            security,
            cancellation: CancellationToken::new(),
        }
    }

    /// Attaches a cancellation token
    #[must_use]
    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancellation = token;
        self
    }
}

impl Default for CallContext {
    fn default() -> Self {
        Self::new(SecurityContext::anonymous())
    }
}

/// Outcome of an event publish: fire-and-forget success with a per-handler
/// failure breakdown
#[derive(Debug)]
pub struct PublishReport {
    /// Handlers the event was dispatched to
    pub handler_count: usize,
    /// Handlers that failed terminally
    pub failures: Vec<HandlerFailure>,
}

impl PublishReport {
    /// Whether every handler reached a terminal success
    #[must_use]
    pub fn fully_succeeded(&self) -> bool {
        self.failures.is_empty()
    }

    /// Converts the report into a composite error when any handler failed
    #[must_use]
    pub fn into_error(self) -> Option<PublishFailure> {
        if self.failures.is_empty() {
            None
        } else {
            Some(PublishFailure {
                handler_count: self.handler_count,
                failures: self.failures,
            })
        }
    }
}

struct CachedQuery {
    value: serde_json::Value,
    stored_at: Instant,
    ttl: Duration,
}

struct BusInner {
    config: BusConfig,
    registry: Arc<HandlerRegistry>,
    chain: RwLock<BehaviorChain>,
    behaviors: Mutex<Vec<Arc<dyn Behavior>>>,
    flow: Arc<FlowController>,
    correlator: Arc<Correlator>,
    dead_letters: Arc<DeadLetterQueue>,
    metrics: SharedMetrics,
    query_cache: Mutex<HashMap<(MessageType, String), CachedQuery>>,
    dispatch_limit: Arc<Semaphore>,
    shutdown: CancellationToken,
}

impl Drop for BusInner {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

/// The message bus: Send/Publish/Query dispatch with pipeline behaviors,
/// admission control, correlation, and dead-lettering
#[derive(Clone)]
pub struct MessageBus {
    inner: Arc<BusInner>,
}

/// Builder assembling a bus from configuration, collaborators, and
/// contributed behaviors
pub struct BusBuilder {
    config: BusConfig,
    metrics: Option<SharedMetrics>,
    time: Option<SharedTimeProvider>,
    extra_behaviors: Vec<Arc<dyn Behavior>>,
    standard_behaviors: bool,
}

impl BusBuilder {
    /// Starts a builder over the configuration
    #[must_use]
    pub fn new(config: BusConfig) -> Self {
        Self {
            config,
            metrics: None,
            time: None,
            extra_behaviors: Vec::new(),
            standard_behaviors: true,
        }
    }

    /// Injects a metrics collector
    #[must_use]
    pub fn with_metrics(mut self, metrics: SharedMetrics) -> Self {
        self.metrics = Some(metrics);
        self
    }

    /// Injects a time provider (tests use the collapsing mock)
    #[must_use]
    pub fn with_time_provider(mut self, time: SharedTimeProvider) -> Self {
        self.time = Some(time);
        self
    }

    /// Adds a custom behavior, merged with the standard chain by placement
    #[must_use]
    pub fn with_behavior(mut self, behavior: Arc<dyn Behavior>) -> Self {
        self.extra_behaviors.push(behavior);
        self
    }

    /// Skips the standard behaviors; the caller wires everything
    #[must_use]
    pub fn without_standard_behaviors(mut self) -> Self {
        self.standard_behaviors = false;
        self
    }

    /// Builds the bus and spawns its background tasks
    ///
    /// # Errors
    ///
    /// Returns `ConfigError` for invalid configuration or unresolvable
    /// behavior placements.
    pub async fn build(self) -> Result<MessageBus, ConfigError> {
        self.config.validate()?;
        let metrics: SharedMetrics = self
            .metrics
            .unwrap_or_else(|| Arc::new(AtomicMetrics::new()));
        let time = self.time.unwrap_or_else(production_time_provider);

        let correlator = Arc::new(Correlator::new(metrics.clone()));
        let dead_letters = Arc::new(DeadLetterQueue::new(
            self.config.dead_letter_capacity,
            metrics.clone(),
        ));
        let flow = FlowController::new(self.config.flow.clone(), metrics.clone());

        let mut behaviors: Vec<Arc<dyn Behavior>> = Vec::new();
        if self.standard_behaviors {
            behaviors.push(Arc::new(LoggingBehavior));
            behaviors.push(Arc::new(SecurityContextBehavior));
            behaviors.push(Arc::new(ValidationBehavior));
            behaviors.push(Arc::new(CorrelationBehavior::new(correlator.clone())));
            behaviors.push(Arc::new(RetryBehavior::new(
                self.config.default_retry.clone(),
                time,
            )));
            behaviors.push(Arc::new(TimeoutBehavior));
            behaviors.push(Arc::new(MetricsBehavior::new(metrics.clone())));
        }
        behaviors.extend(self.extra_behaviors);
        let chain = BehaviorChain::resolve(behaviors.clone())?;

        let shutdown = CancellationToken::new();
        tokio::spawn(correlator.clone().run_sweeper(shutdown.clone()));
        tokio::spawn(flow.clone().run_maintenance(shutdown.clone()));

        info!(
            behaviors = ?chain.ids(),
            max_concurrent = self.config.max_concurrent,
            "message bus started"
        );

        Ok(MessageBus {
            inner: Arc::new(BusInner {
                dispatch_limit: Arc::new(Semaphore::new(self.config.max_concurrent)),
                config: self.config,
                registry: Arc::new(HandlerRegistry::new()),
                chain: RwLock::new(chain),
                behaviors: Mutex::new(behaviors),
                flow,
                correlator,
                dead_letters,
                metrics,
                query_cache: Mutex::new(HashMap::new()),
                shutdown,
            }),
        })
    }
}

impl MessageBus {
    /// Starts a builder over the configuration
    #[must_use]
    pub fn builder(config: BusConfig) -> BusBuilder {
        BusBuilder::new(config)
    }

    /// The handler registry
    #[must_use]
    pub fn registry(&self) -> &Arc<HandlerRegistry> {
        &self.inner.registry
    }

    /// The dead-letter queue
    #[must_use]
    pub fn dead_letters(&self) -> &Arc<DeadLetterQueue> {
        &self.inner.dead_letters
    }

    /// The correlator
    #[must_use]
    pub fn correlator(&self) -> &Arc<Correlator> {
        &self.inner.correlator
    }

    /// The flow controller
    #[must_use]
    pub fn flow_controller(&self) -> &Arc<FlowController> {
        &self.inner.flow
    }

    /// The metrics collector the bus reports into
    #[must_use]
    pub fn metrics(&self) -> &SharedMetrics {
        &self.inner.metrics
    }

    /// Merges contributed behaviors into the chain, re-resolving placements
    ///
    /// # Errors
    ///
    /// Returns `ConfigError` when the merged placements are unresolvable;
    /// the previous chain stays active in that case.
    pub fn add_behaviors(&self, contributed: Vec<Arc<dyn Behavior>>) -> Result<(), ConfigError> {
        let mut all = self.inner.behaviors.lock().expect("behavior list poisoned");
        let mut candidate = all.clone();
        candidate.extend(contributed);
        let chain = BehaviorChain::resolve(candidate.clone())?;
        *all = candidate;
        *self.inner.chain.write().expect("behavior chain poisoned") = chain;
        Ok(())
    }

    /// Stops background tasks and rejects further admissions
    pub fn shutdown(&self) {
        self.inner.shutdown.cancel();
        self.inner.flow.close();
        info!("message bus shut down");
    }

    // ----- send ------------------------------------------------------------

    /// Sends a command to its single handler and returns the typed response
    ///
    /// # Errors
    ///
    /// `NoHandler`, `Expired`, `Rejected`, `Handler`, `Timeout`, `Cancelled`.
    pub async fn send<C: Command>(&self, command: &C) -> Result<C::Response, BusError> {
        self.send_with(command, CallContext::default()).await
    }

    /// Sends a command under an explicit call context
    ///
    /// # Errors
    ///
    /// See [`MessageBus::send`].
    pub async fn send_with<C: Command>(
        &self,
        command: &C,
        call: CallContext,
    ) -> Result<C::Response, BusError> {
        let envelope = command_envelope(command)?;
        let response = self
            .dispatch_single(MessageCategory::Command, envelope, &call)
            .await?;
        typed_response::<C::Response>(response)
    }

    // ----- publish ---------------------------------------------------------

    /// Publishes an event to all matching handlers concurrently.
    ///
    /// Handler failures are isolated: the publish itself succeeds (fire and
    /// forget), failed handlers are dead-lettered, and the report carries
    /// the per-handler breakdown.
    ///
    /// # Errors
    ///
    /// `Expired`, `Rejected`, `Cancelled`, or envelope validation failures;
    /// never a handler failure.
    pub async fn publish<E: Event>(&self, event: &E) -> Result<PublishReport, BusError> {
        self.publish_with(event, CallContext::default()).await
    }

    /// Publishes an event under an explicit call context
    ///
    /// # Errors
    ///
    /// See [`MessageBus::publish`].
    pub async fn publish_with<E: Event>(
        &self,
        event: &E,
        call: CallContext,
    ) -> Result<PublishReport, BusError> {
        let envelope = event_envelope(event)?;
        self.publish_envelope(envelope, &call).await
    }

    /// Publishes a batch of events in order
    ///
    /// # Errors
    ///
    /// Fails on the first envelope-level error; handler failures are
    /// reported, not raised.
    pub async fn publish_all<E: Event>(&self, events: &[E]) -> Result<Vec<PublishReport>, BusError> {
        let call = CallContext::default();
        let mut reports = Vec::with_capacity(events.len());
        for event in events {
            let envelope = event_envelope(event)?;
            reports.push(self.publish_envelope(envelope, &call).await?);
        }
        Ok(reports)
    }

    // ----- query -----------------------------------------------------------

    /// Dispatches a query to its single handler, consulting the query cache
    ///
    /// # Errors
    ///
    /// See [`MessageBus::send`].
    pub async fn query<Q: Query>(&self, query: &Q) -> Result<Q::Output, BusError> {
        self.query_with(query, CallContext::default()).await
    }

    /// Dispatches a query under an explicit call context
    ///
    /// # Errors
    ///
    /// See [`MessageBus::send`].
    pub async fn query_with<Q: Query>(
        &self,
        query: &Q,
        call: CallContext,
    ) -> Result<Q::Output, BusError> {
        let envelope = query_envelope(query)?;
        let response = self.dispatch_query_envelope(envelope, &call).await?;
        typed_response::<Q::Output>(response)
    }

    // ----- untyped dispatch ------------------------------------------------

    /// Dispatches an envelope without static category knowledge.
    ///
    /// Commands and queries yield their response payload; events yield
    /// `None` (failures are dead-lettered per handler).
    ///
    /// # Errors
    ///
    /// See [`MessageBus::send`].
    pub async fn dispatch(
        &self,
        envelope: Envelope,
        call: CallContext,
    ) -> Result<Option<serde_json::Value>, BusError> {
        match envelope.category {
            MessageCategory::Command => {
                self.dispatch_single(MessageCategory::Command, envelope, &call)
                    .await
            }
            MessageCategory::Query => self.dispatch_query_envelope(envelope, &call).await,
            MessageCategory::Event => {
                self.publish_envelope(envelope, &call).await?;
                Ok(None)
            }
        }
    }

    // ----- dead-letter replay ----------------------------------------------

    /// Replays a dead-lettered envelope through the bus.
    ///
    /// The entry is removed iff the replay succeeds; on failure it is
    /// restored with an incremented attempt count.
    ///
    /// # Errors
    ///
    /// `Validation` when no entry exists for the id, otherwise the replay's
    /// dispatch error.
    pub async fn replay_dead_letter(
        &self,
        message_id: crate::domain_types::MessageId,
    ) -> Result<(), BusError> {
        let entry = self
            .inner
            .dead_letters
            .take(message_id)
            .ok_or_else(|| BusError::Validation {
                reason: format!("no dead-letter entry for message {message_id}"),
            })?;
        let envelope = entry.envelope.clone();
        match self.dispatch(envelope, CallContext::default()).await {
            Ok(_) => {
                self.inner.metrics.incr("dead_letter.replayed", 1);
                Ok(())
            }
            Err(err) => {
                self.inner.dead_letters.restore(entry, err.to_string());
                Err(err)
            }
        }
    }

    // ----- subscribe -------------------------------------------------------

    /// Registers a typed command handler
    ///
    /// # Errors
    ///
    /// `Validation` when the command's type tag is invalid.
    pub fn subscribe_command<C, F, Fut>(&self, handler: F) -> Result<Subscription, BusError>
    where
        C: Command,
        F: Fn(C) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<C::Response, anyhow::Error>> + Send + 'static,
    {
        self.subscribe_command_with(HandlerOptions::named(C::TYPE), handler)
    }

    /// Registers a typed command handler with explicit options
    ///
    /// # Errors
    ///
    /// `Validation` when the command's type tag is invalid.
    pub fn subscribe_command_with<C, F, Fut>(
        &self,
        options: HandlerOptions,
        handler: F,
    ) -> Result<Subscription, BusError>
    where
        C: Command,
        F: Fn(C) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<C::Response, anyhow::Error>> + Send + 'static,
    {
        self.subscribe_raw(
            MessageCategory::Command,
            C::TYPE,
            Arc::new(TypedRequestHandler::<C, _, _> {
                f: handler,
                _marker: PhantomData,
            }),
            options,
        )
    }

    /// Registers a typed event handler
    ///
    /// # Errors
    ///
    /// `Validation` when the event's type tag is invalid.
    pub fn subscribe_event<E, F, Fut>(&self, handler: F) -> Result<Subscription, BusError>
    where
        E: Event,
        F: Fn(E) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), anyhow::Error>> + Send + 'static,
    {
        self.subscribe_event_with(HandlerOptions::named(E::TYPE), handler)
    }

    /// Registers a typed event handler with explicit options
    ///
    /// # Errors
    ///
    /// `Validation` when the event's type tag is invalid.
    pub fn subscribe_event_with<E, F, Fut>(
        &self,
        options: HandlerOptions,
        handler: F,
    ) -> Result<Subscription, BusError>
    where
        E: Event,
        F: Fn(E) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), anyhow::Error>> + Send + 'static,
    {
        self.subscribe_raw(
            MessageCategory::Event,
            E::TYPE,
            Arc::new(TypedEventHandler::<E, _, _> {
                f: handler,
                _marker: PhantomData,
            }),
            options,
        )
    }

    /// Registers a typed query handler
    ///
    /// # Errors
    ///
    /// `Validation` when the query's type tag is invalid.
    pub fn subscribe_query<Q, F, Fut>(&self, handler: F) -> Result<Subscription, BusError>
    where
        Q: Query,
        F: Fn(Q) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Q::Output, anyhow::Error>> + Send + 'static,
    {
        self.subscribe_raw(
            MessageCategory::Query,
            Q::TYPE,
            Arc::new(TypedQueryHandler::<Q, _, _> {
                f: handler,
                _marker: PhantomData,
            }),
            HandlerOptions::named(Q::TYPE),
        )
    }

    /// Registers an untyped handler for a `(category, type tag)` pair
    ///
    /// # Errors
    ///
    /// `Validation` when the type tag is invalid.
    pub fn subscribe_raw(
        &self,
        category: MessageCategory,
        type_tag: &str,
        handler: Arc<dyn MessageHandler>,
        options: HandlerOptions,
    ) -> Result<Subscription, BusError> {
        let message_type =
            MessageType::try_new(type_tag.to_string()).map_err(|e| BusError::Validation {
                reason: format!("invalid message type tag: {e}"),
            })?;
        Ok(self
            .inner
            .registry
            .register(category, message_type, handler, options))
    }

    // ----- internals -------------------------------------------------------

    async fn dispatch_single(
        &self,
        category: MessageCategory,
        envelope: Envelope,
        call: &CallContext,
    ) -> Result<Option<serde_json::Value>, BusError> {
        envelope.validate()?;
        if envelope.is_expired() {
            return Err(self.reject_expired(envelope));
        }

        let entry = self
            .inner
            .registry
            .resolve_single(category, &envelope.message_type)
            .filter(|entry| entry.accepts(&envelope))
            .ok_or_else(|| BusError::NoHandler {
                message_type: envelope.message_type.clone(),
                category,
            })?;

        let ticket = self.inner.flow.admit(&envelope, &call.cancellation).await?;
        let _permit = tokio::select! {
            permit = self.inner.dispatch_limit.clone().acquire_owned() => {
                permit.map_err(|_| BusError::Rejected {
                    reason: "bus is shut down".to_string(),
                })?
            }
            () = call.cancellation.cancelled() => return Err(BusError::Cancelled),
        };

        let mut ctx = self.pipeline_context(envelope, call, &entry);
        let terminal = HandlerTerminal::for_entry(&entry);
        let chain = self.chain_snapshot();
        let result = chain.run(&mut ctx, &terminal).await;
        drop(ticket);
        self.finish_dispatch(category, ctx, result)
    }

    async fn dispatch_query_envelope(
        &self,
        envelope: Envelope,
        call: &CallContext,
    ) -> Result<Option<serde_json::Value>, BusError> {
        let cache_slot = envelope
            .cache_key
            .clone()
            .map(|key| (envelope.message_type.clone(), key));
        let cache_ttl = envelope.cache_duration.unwrap_or(Duration::ZERO);

        if let Some(slot) = &cache_slot
            && let Some(hit) = self.cache_lookup(slot)
        {
            self.inner.metrics.incr("query.cache_hit", 1);
            return Ok(Some(hit));
        }
        if cache_slot.is_some() {
            self.inner.metrics.incr("query.cache_miss", 1);
        }

        let response = self
            .dispatch_single(MessageCategory::Query, envelope, call)
            .await?;

        if let (Some(slot), Some(value)) = (cache_slot, &response)
            && cache_ttl > Duration::ZERO
        {
            self.cache_store(slot, value.clone(), cache_ttl);
        }
        Ok(response)
    }

    async fn publish_envelope(
        &self,
        envelope: Envelope,
        call: &CallContext,
    ) -> Result<PublishReport, BusError> {
        envelope.validate()?;
        if envelope.is_expired() {
            return Err(self.reject_expired(envelope));
        }

        let ticket = self.inner.flow.admit(&envelope, &call.cancellation).await?;
        let handlers = self.inner.registry.resolve_events(&envelope);
        let handler_count = handlers.len();
        if handler_count == 0 {
            drop(ticket);
            debug!(message_type = %envelope.message_type, "event published with no subscribers");
            return Ok(PublishReport {
                handler_count: 0,
                failures: Vec::new(),
            });
        }

        let chain = self.chain_snapshot();
        let runs = handlers.into_iter().map(|entry| {
            let mut ctx = self.pipeline_context(envelope.clone(), call, &entry);
            let chain = chain.clone();
            let name = entry.options.name.clone();
            async move {
                let terminal = HandlerTerminal::for_entry(&entry);
                let result = chain.run(&mut ctx, &terminal).await;
                (name, ctx, result)
            }
        });
        let outcomes = futures::future::join_all(runs).await;
        drop(ticket);

        let mut failures = Vec::new();
        for (name, ctx, result) in outcomes {
            if let Err(error) = result {
                let reason = error
                    .failure_reason()
                    .unwrap_or(FailureReason::HandlerError);
                self.inner.dead_letters.enqueue(
                    ctx.envelope,
                    reason,
                    format!("handler '{name}': {error}"),
                );
                failures.push(HandlerFailure {
                    handler: name,
                    error,
                });
            }
        }

        self.inner.metrics.incr("event.published", 1);
        if !failures.is_empty() {
            self.inner.metrics.incr("event.publish.partial_failure", 1);
        }
        Ok(PublishReport {
            handler_count,
            failures,
        })
    }

    fn pipeline_context(
        &self,
        envelope: Envelope,
        call: &CallContext,
        entry: &HandlerEntry,
    ) -> PipelineContext {
        let mut ctx = PipelineContext::new(
            envelope,
            call.security.clone(),
            call.cancellation.child_token(),
        );
        ctx.handler_options = entry.options.clone();
        ctx.default_timeout = self.inner.config.default_message_timeout.as_duration();
        ctx
    }

    fn chain_snapshot(&self) -> BehaviorChain {
        self.inner
            .chain
            .read()
            .expect("behavior chain poisoned")
            .clone()
    }

    fn reject_expired(&self, envelope: Envelope) -> BusError {
        let error = BusError::Expired {
            message_id: envelope.id,
            message_type: envelope.message_type.clone(),
        };
        self.inner
            .metrics
            .incr(&format!("{}.expired", envelope.category), 1);
        self.inner.dead_letters.enqueue(
            envelope,
            FailureReason::Expired,
            "ttl elapsed before dispatch",
        );
        error
    }

    fn finish_dispatch(
        &self,
        category: MessageCategory,
        mut ctx: PipelineContext,
        result: Result<(), BusError>,
    ) -> Result<Option<serde_json::Value>, BusError> {
        match result {
            Ok(()) => {
                self.inner.metrics.incr(&format!("{category}.success"), 1);
                self.inner
                    .metrics
                    .observe_duration(&format!("{category}.duration"), ctx.started_at.elapsed());
                Ok(ctx.response.take())
            }
            Err(error) => {
                match &error {
                    BusError::Expired { .. } => {
                        self.inner
                            .metrics
                            .incr(&format!("{category}.expired"), 1);
                    }
                    _ => {
                        self.inner.metrics.incr(&format!("{category}.error"), 1);
                    }
                }
                if let Some(reason) = error.failure_reason() {
                    self.inner
                        .dead_letters
                        .enqueue(ctx.envelope, reason, error.to_string());
                }
                Err(error)
            }
        }
    }

    fn cache_lookup(&self, slot: &(MessageType, String)) -> Option<serde_json::Value> {
        let cache = self.inner.query_cache.lock().expect("query cache poisoned");
        cache.get(slot).and_then(|cached| {
            if cached.stored_at.elapsed() < cached.ttl {
                Some(cached.value.clone())
            } else {
                None
            }
        })
    }

    fn cache_store(&self, slot: (MessageType, String), value: serde_json::Value, ttl: Duration) {
        let mut cache = self.inner.query_cache.lock().expect("query cache poisoned");
        cache.retain(|_, cached| cached.stored_at.elapsed() < cached.ttl);
        if cache.len() >= self.inner.config.query_cache_capacity.as_usize()
            && let Some(oldest) = cache
                .iter()
                .min_by_key(|(_, cached)| cached.stored_at)
                .map(|(key, _)| key.clone())
        {
            cache.remove(&oldest);
        }
        cache.insert(
            slot,
            CachedQuery {
                value,
                stored_at: Instant::now(),
                ttl,
            },
        );
    }
}

fn typed_response<R: serde::de::DeserializeOwned>(
    response: Option<serde_json::Value>,
) -> Result<R, BusError> {
    let value = response.unwrap_or(serde_json::Value::Null);
    Ok(serde_json::from_value(value)?)
}

/// Terminal pipeline step: acquires the registration's concurrency permit
/// and invokes the handler, wrapping opaque handler errors
struct HandlerTerminal {
    handler: Arc<dyn MessageHandler>,
    name: String,
    concurrency: Option<Arc<Semaphore>>,
}

impl HandlerTerminal {
    fn for_entry(entry: &HandlerEntry) -> Self {
        Self {
            handler: entry.handler.clone(),
            name: entry.options.name.clone(),
            concurrency: entry.concurrency.clone(),
        }
    }
}

#[async_trait::async_trait]
impl TerminalHandler for HandlerTerminal {
    async fn call(&self, ctx: &mut PipelineContext) -> Result<(), BusError> {
        let _permit = match &self.concurrency {
            Some(limit) => Some(limit.acquire().await.map_err(|_| BusError::Cancelled)?),
            None => None,
        };
        match self.handler.handle(ctx).await {
            Ok(response) => {
                ctx.response = response;
                Ok(())
            }
            Err(source) => Err(BusError::Handler {
                handler: self.name.clone(),
                attempts: ctx.retry_count + 1,
                source,
            }),
        }
    }
}

struct TypedRequestHandler<C, F, Fut> {
    f: F,
    _marker: PhantomData<fn(C) -> Fut>,
}

#[async_trait::async_trait]
impl<C, F, Fut> MessageHandler for TypedRequestHandler<C, F, Fut>
where
    C: Command,
    F: Fn(C) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<C::Response, anyhow::Error>> + Send + 'static,
{
    async fn handle(
        &self,
        ctx: &mut PipelineContext,
    ) -> Result<Option<serde_json::Value>, anyhow::Error> {
        let command: C = serde_json::from_value(ctx.envelope.payload.clone())?;
        let response = (self.f)(command).await?;
        Ok(Some(serde_json::to_value(response)?))
    }
}

struct TypedEventHandler<E, F, Fut> {
    f: F,
    _marker: PhantomData<fn(E) -> Fut>,
}

#[async_trait::async_trait]
impl<E, F, Fut> MessageHandler for TypedEventHandler<E, F, Fut>
where
    E: Event,
    F: Fn(E) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<(), anyhow::Error>> + Send + 'static,
{
    async fn handle(
        &self,
        ctx: &mut PipelineContext,
    ) -> Result<Option<serde_json::Value>, anyhow::Error> {
        let event: E = serde_json::from_value(ctx.envelope.payload.clone())?;
        (self.f)(event).await?;
        Ok(None)
    }
}

struct TypedQueryHandler<Q, F, Fut> {
    f: F,
    _marker: PhantomData<fn(Q) -> Fut>,
}

#[async_trait::async_trait]
impl<Q, F, Fut> MessageHandler for TypedQueryHandler<Q, F, Fut>
where
    Q: Query,
    F: Fn(Q) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Q::Output, anyhow::Error>> + Send + 'static,
{
    async fn handle(
        &self,
        ctx: &mut PipelineContext,
    ) -> Result<Option<serde_json::Value>, anyhow::Error> {
        let query: Q = serde_json::from_value(ctx.envelope.payload.clone())?;
        let output = (self.f)(query).await?;
        Ok(Some(serde_json::to_value(output)?))
    }
}
