//! Behavior pipeline: composable pre/process/post wrappers around a handler
//!
//! A pipeline is an ordered list of behaviors wrapping a terminal handler.
//! Each behavior may run code before calling [`Next::run`], may short-circuit
//! by not calling it, and may transform the outcome. The order is resolved
//! once at startup from each behavior's [`Placement`].

use crate::domain_types::CorrelationId;
use crate::error::{BusError, ConfigError};
use crate::message::Envelope;
use crate::security::SecurityContext;
use async_trait::async_trait;
use futures::future::BoxFuture;
use futures::stream::{self, StreamExt, TryStreamExt};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;

use super::registry::HandlerOptions;

/// Coarse ordering buckets for behavior placement
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum PipelineStage {
    /// Identity checks and security-context propagation
    Authentication,
    /// Envelope invariant validation
    Validation,
    /// Enrichment before the handler runs
    PreProcessing,
    /// Retry, timeout, and the handler invocation itself
    Processing,
    /// Work after the handler completes
    PostProcessing,
    /// Result translation
    Transformation,
    /// Metrics and tracing
    Telemetry,
    /// Error inspection and translation
    ErrorHandling,
}

impl PipelineStage {
    fn rank(self) -> usize {
        match self {
            Self::Authentication => 0,
            Self::Validation => 1,
            Self::PreProcessing => 2,
            Self::Processing => 3,
            Self::PostProcessing => 4,
            Self::Transformation => 5,
            Self::Telemetry => 6,
            Self::ErrorHandling => 7,
        }
    }
}

/// Ordering constraint attached to a behavior
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Placement {
    /// Pinned head of the chain
    First,
    /// Pinned tail of the chain
    Last,
    /// Explicit order within the default stage
    Ordered(i32),
    /// Runs somewhere before the named behavior
    Before(String),
    /// Runs somewhere after the named behavior
    After(String),
    /// Stage bucket plus order within the bucket
    AtStage(PipelineStage, i32),
    /// Default stage, default order
    Default,
}

/// Per-dispatch state threaded through the behavior chain
pub struct PipelineContext {
    /// The envelope being dispatched
    pub envelope: Envelope,
    /// Caller identity
    pub security: SecurityContext,
    /// Per-dispatch cancellation handle, child of the caller's token
    pub cancellation: CancellationToken,
    /// Correlation id of this dispatch
    pub correlation_id: CorrelationId,
    /// When the dispatch entered the pipeline
    pub started_at: Instant,
    /// Inter-behavior communication channel
    pub properties: HashMap<String, serde_json::Value>,
    /// Response slot filled by the terminal handler
    pub response: Option<serde_json::Value>,
    /// Failure value recorded by behaviors observing an error
    pub failure: Option<String>,
    /// Completed attempts before the current one
    pub retry_count: u32,
    /// Options of the handler registration being invoked
    pub handler_options: HandlerOptions,
    /// Timeout applied when the registration supplies none
    pub default_timeout: Duration,
}

impl PipelineContext {
    /// Creates a context for one dispatch
    #[must_use]
    pub fn new(envelope: Envelope, security: SecurityContext, cancellation: CancellationToken) -> Self {
        let correlation_id = envelope.correlation_id.unwrap_or_else(CorrelationId::generate);
        Self {
            envelope,
            security,
            cancellation,
            correlation_id,
            started_at: Instant::now(),
            properties: HashMap::new(),
            response: None,
            failure: None,
            retry_count: 0,
            handler_options: HandlerOptions::default(),
            default_timeout: Duration::from_secs(30),
        }
    }

    /// Whether a behavior recorded a failure value
    #[must_use]
    pub fn failed(&self) -> bool {
        self.failure.is_some()
    }

    /// Records a failure value for downstream (error-handling) behaviors
    pub fn record_failure(&mut self, error: &BusError) {
        self.failure = Some(error.to_string());
    }
}

/// Terminal step invoked once the whole chain has run: typically the
/// handler invocation itself
#[async_trait]
pub trait TerminalHandler: Send + Sync {
    /// Runs the terminal step
    async fn call(&self, ctx: &mut PipelineContext) -> Result<(), BusError>;
}

/// Remainder of the chain from a behavior's point of view.
///
/// `Copy` so retry-style behaviors can run the tail more than once.
#[derive(Clone, Copy)]
pub struct Next<'a> {
    behaviors: &'a [Arc<dyn Behavior>],
    terminal: &'a dyn TerminalHandler,
}

impl Next<'_> {
    /// Runs the rest of the chain
    ///
    /// # Errors
    ///
    /// Propagates whatever the downstream behaviors or handler surface.
    pub async fn run(self, ctx: &mut PipelineContext) -> Result<(), BusError> {
        match self.behaviors.split_first() {
            Some((head, rest)) => {
                let next = Next {
                    behaviors: rest,
                    terminal: self.terminal,
                };
                head.invoke(ctx, next).await
            }
            None => self.terminal.call(ctx).await,
        }
    }
}

/// A composable wrapper around handler invocation
#[async_trait]
pub trait Behavior: Send + Sync {
    /// Stable identifier used by `Before`/`After` placements
    fn id(&self) -> &str;

    /// Ordering constraint; defaults to the default stage
    fn placement(&self) -> Placement {
        Placement::Default
    }

    /// Runs this behavior around the rest of the chain
    async fn invoke(&self, ctx: &mut PipelineContext, next: Next<'_>) -> Result<(), BusError>;
}

/// An ordered, resolved behavior chain ready for dispatch
#[derive(Clone, Default)]
pub struct BehaviorChain {
    behaviors: Arc<Vec<Arc<dyn Behavior>>>,
}

impl BehaviorChain {
    /// Resolves placement constraints into a total order
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::PlacementCycle` for cyclic `Before`/`After`
    /// constraints (including cycles through `First`/`Last` pins) and
    /// `ConfigError::PlacementConflict` for references to unknown behaviors.
    pub fn resolve(behaviors: Vec<Arc<dyn Behavior>>) -> Result<Self, ConfigError> {
        let order = resolve_order(&behaviors)?;
        let ordered = order.into_iter().map(|i| behaviors[i].clone()).collect();
        Ok(Self {
            behaviors: Arc::new(ordered),
        })
    }

    /// Identifiers in resolved order, for diagnostics and tests
    #[must_use]
    pub fn ids(&self) -> Vec<String> {
        self.behaviors.iter().map(|b| b.id().to_string()).collect()
    }

    /// Runs the chain around the given terminal handler
    ///
    /// # Errors
    ///
    /// Propagates the chain's outcome.
    pub async fn run(
        &self,
        ctx: &mut PipelineContext,
        terminal: &dyn TerminalHandler,
    ) -> Result<(), BusError> {
        let next = Next {
            behaviors: &self.behaviors,
            terminal,
        };
        next.run(ctx).await
    }
}

/// Sort key prior to constraint solving: (bucket, order, registration index)
fn base_key(placement: &Placement, index: usize) -> (usize, i32, usize) {
    // Buckets: 0 = First, 1..=8 = stages, 9 = Last.
    const FIRST: usize = 0;
    const LAST: usize = 9;
    let default_bucket = 1 + PipelineStage::Processing.rank();
    match placement {
        Placement::First => (FIRST, 0, index),
        Placement::Last => (LAST, 0, index),
        Placement::AtStage(stage, order) => (1 + stage.rank(), *order, index),
        Placement::Ordered(order) => (default_bucket, *order, index),
        Placement::Before(_) | Placement::After(_) | Placement::Default => {
            (default_bucket, 0, index)
        }
    }
}

fn resolve_order(behaviors: &[Arc<dyn Behavior>]) -> Result<Vec<usize>, ConfigError> {
    let n = behaviors.len();
    let placements: Vec<Placement> = behaviors.iter().map(|b| b.placement()).collect();
    let mut index_of_id: HashMap<&str, usize> = HashMap::with_capacity(n);
    for (i, behavior) in behaviors.iter().enumerate() {
        // Later registrations shadow earlier ones for constraint targets,
        // matching warn-and-replace handler semantics.
        index_of_id.insert(behavior.id(), i);
    }

    let mut edges: Vec<Vec<usize>> = vec![Vec::new(); n];
    let mut indegree = vec![0usize; n];
    fn add_edge(edges: &mut [Vec<usize>], indegree: &mut [usize], from: usize, to: usize) {
        edges[from].push(to);
        indegree[to] += 1;
    }

    for (i, placement) in placements.iter().enumerate() {
        match placement {
            Placement::Before(target) => {
                let t = *index_of_id.get(target.as_str()).ok_or_else(|| {
                    ConfigError::PlacementConflict {
                        id: behaviors[i].id().to_string(),
                        reason: format!("Before references unknown behavior '{target}'"),
                    }
                })?;
                add_edge(&mut edges, &mut indegree, i, t);
            }
            Placement::After(target) => {
                let t = *index_of_id.get(target.as_str()).ok_or_else(|| {
                    ConfigError::PlacementConflict {
                        id: behaviors[i].id().to_string(),
                        reason: format!("After references unknown behavior '{target}'"),
                    }
                })?;
                add_edge(&mut edges, &mut indegree, t, i);
            }
            _ => {}
        }
    }

    // Pins are hard constraints: First precedes every non-First, every
    // non-Last precedes Last. A Before/After that contradicts a pin shows up
    // as a cycle below.
    for (i, first) in placements.iter().enumerate() {
        for (j, second) in placements.iter().enumerate() {
            if i == j {
                continue;
            }
            if *first == Placement::First && *second != Placement::First {
                add_edge(&mut edges, &mut indegree, i, j);
            }
            if *second == Placement::Last && *first != Placement::Last {
                add_edge(&mut edges, &mut indegree, i, j);
            }
        }
    }

    // Kahn's algorithm; among ready nodes the smallest base key wins, which
    // realizes stage buckets, Ordered values, and registration order as soft
    // constraints under the hard edges.
    let mut ready: Vec<usize> = (0..n).filter(|&i| indegree[i] == 0).collect();
    let mut output = Vec::with_capacity(n);
    while !ready.is_empty() {
        let best = ready
            .iter()
            .enumerate()
            .min_by_key(|&(_, &i)| base_key(&placements[i], i))
            .map(|(pos, _)| pos)
            .unwrap_or(0);
        let node = ready.swap_remove(best);
        output.push(node);
        for &succ in &edges[node] {
            indegree[succ] -= 1;
            if indegree[succ] == 0 {
                ready.push(succ);
            }
        }
    }

    if output.len() < n {
        let stuck: Vec<String> = (0..n)
            .filter(|&i| indegree[i] > 0)
            .map(|i| behaviors[i].id().to_string())
            .collect();
        return Err(ConfigError::PlacementCycle { ids: stuck });
    }
    Ok(output)
}

/// A typed asynchronous processing step, composable into larger flows
pub struct Flow<I, O> {
    func: Arc<dyn Fn(I) -> BoxFuture<'static, Result<O, BusError>> + Send + Sync>,
}

impl<I, O> Clone for Flow<I, O> {
    fn clone(&self) -> Self {
        Self {
            func: self.func.clone(),
        }
    }
}

impl<I: Send + 'static, O: Send + 'static> Flow<I, O> {
    /// Wraps an async function as a flow
    pub fn new<F, Fut>(f: F) -> Self
    where
        F: Fn(I) -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = Result<O, BusError>> + Send + 'static,
    {
        Self {
            func: Arc::new(move |input| Box::pin(f(input))),
        }
    }

    /// Runs the flow on one input
    ///
    /// # Errors
    ///
    /// Propagates the flow's error.
    pub async fn run(&self, input: I) -> Result<O, BusError> {
        (self.func)(input).await
    }

    /// Translates the output
    #[must_use]
    pub fn map<O2: Send + 'static>(
        self,
        f: impl Fn(O) -> O2 + Send + Sync + 'static,
    ) -> Flow<I, O2> {
        let f = Arc::new(f);
        Flow::new(move |input| {
            let inner = self.clone();
            let f = f.clone();
            async move { inner.run(input).await.map(|out| f(out)) }
        })
    }

    /// Drops outputs failing the predicate, resolving them to the neutral
    /// value
    #[must_use]
    pub fn filter(self, pred: impl Fn(&O) -> bool + Send + Sync + 'static) -> Flow<I, O>
    where
        O: Default,
    {
        let pred = Arc::new(pred);
        Flow::new(move |input| {
            let inner = self.clone();
            let pred = pred.clone();
            async move {
                let out = inner.run(input).await?;
                Ok(if pred(&out) { out } else { O::default() })
            }
        })
    }

    /// Sequential composition: this flow, then `next`
    #[must_use]
    pub fn then<O2: Send + 'static>(self, next: Flow<O, O2>) -> Flow<I, O2> {
        Flow::new(move |input| {
            let first = self.clone();
            let second = next.clone();
            async move { second.run(first.run(input).await?).await }
        })
    }

    /// Content-based router: exactly one branch runs per input
    #[must_use]
    pub fn branch(
        cond: impl Fn(&I) -> bool + Send + Sync + 'static,
        when_true: Flow<I, O>,
        when_false: Flow<I, O>,
    ) -> Flow<I, O> {
        let cond = Arc::new(cond);
        Flow::new(move |input| {
            let cond = cond.clone();
            let t = when_true.clone();
            let f = when_false.clone();
            async move {
                if cond(&input) {
                    t.run(input).await
                } else {
                    f.run(input).await
                }
            }
        })
    }

    /// Memoizes outputs by a caller-supplied key for `ttl`
    #[must_use]
    pub fn cache(
        self,
        key_fn: impl Fn(&I) -> String + Send + Sync + 'static,
        ttl: Duration,
    ) -> Flow<I, O>
    where
        O: Clone + Sync,
    {
        let key_fn = Arc::new(key_fn);
        let store: Arc<Mutex<HashMap<String, (O, Instant)>>> = Arc::new(Mutex::new(HashMap::new()));
        Flow::new(move |input| {
            let inner = self.clone();
            let key_fn = key_fn.clone();
            let store = store.clone();
            async move {
                let key = key_fn(&input);
                if let Some((value, stored_at)) = store.lock().await.get(&key).cloned()
                    && stored_at.elapsed() < ttl
                {
                    return Ok(value);
                }
                let value = inner.run(input).await?;
                store.lock().await.insert(key, (value.clone(), Instant::now()));
                Ok(value)
            }
        })
    }
}

/// Fan-out over a collection with bounded parallelism, preserving input order
///
/// # Errors
///
/// Fails with the first item error encountered.
pub async fn parallel<T: Send + 'static, U: Send + 'static>(
    items: Vec<T>,
    flow: &Flow<T, U>,
    parallelism: usize,
) -> Result<Vec<U>, BusError> {
    stream::iter(items)
        .map(|item| flow.run(item))
        .buffered(parallelism.max(1))
        .try_collect()
        .await
}
