//! Component registry: dependency-ordered startup, lifecycle driving, and
//! contribution wiring
//!
//! The registry exclusively owns component descriptors. Startup builds a
//! DAG from declared dependencies and initializes and starts components in
//! topological order; shutdown runs in reverse. A startup failure marks the
//! failed component and all of its transitive dependents `Failed`.

use crate::bus::dispatcher::MessageBus;
use crate::bus::pipeline::PipelineContext;
use crate::bus::registry::{MessageHandler, Subscription};
use crate::domain_types::{ComponentId, ComponentName};
use crate::error::{ConfigError, LifecycleError};
use crate::message::Envelope;
use crate::security::SecurityContext;
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use super::component::{
    Component, ComponentContext, ComponentDescriptor, FeatureDescriptor, Health, HealthReport,
    IsolationLevel, ServiceMap,
};
use super::lifecycle::ComponentState;

const ISOLATION_MAILBOX_DEPTH: usize = 64;

struct ComponentSlot {
    descriptor: ComponentDescriptor,
    component: Arc<dyn Component>,
    subscriptions: Vec<Subscription>,
    mailbox_tasks: Vec<JoinHandle<()>>,
}

struct RegistryInner {
    order: Vec<ComponentName>,
    slots: HashMap<ComponentName, ComponentSlot>,
    services: ServiceMap,
    features: Vec<FeatureDescriptor>,
}

/// Aggregate health of the component runtime
#[derive(Debug)]
pub struct SystemHealth {
    /// `Running` plus all healthy
    pub healthy: bool,
    /// Per-component state and health report
    pub components: HashMap<String, (ComponentState, HealthReport)>,
}

/// Owns registered components and drives them through the lifecycle
pub struct ComponentRegistry {
    bus: MessageBus,
    inner: Mutex<RegistryInner>,
    shutdown: CancellationToken,
}

impl ComponentRegistry {
    /// Creates a registry bound to a bus
    #[must_use]
    pub fn new(bus: MessageBus) -> Self {
        Self {
            bus,
            inner: Mutex::new(RegistryInner {
                order: Vec::new(),
                slots: HashMap::new(),
                services: ServiceMap::new(),
                features: Vec::new(),
            }),
            shutdown: CancellationToken::new(),
        }
    }

    /// Registers a component, transitioning it to `Registered`
    ///
    /// # Errors
    ///
    /// `AlreadyRegistered` when the manifest name is taken.
    pub fn register(&self, component: Arc<dyn Component>) -> Result<ComponentId, LifecycleError> {
        let manifest = component.manifest();
        let name = manifest.name.clone();
        let mut inner = self.inner.lock().expect("registry poisoned");
        if inner.slots.contains_key(&name) {
            return Err(LifecycleError::AlreadyRegistered {
                component: name.to_string(),
            });
        }
        let id = ComponentId::generate();
        let descriptor = ComponentDescriptor {
            id,
            manifest,
            state: ComponentState::Registered,
            failure: None,
        };
        info!(component = %name, %id, "component registered");
        inner.order.push(name.clone());
        inner.slots.insert(
            name,
            ComponentSlot {
                descriptor,
                component,
                subscriptions: Vec::new(),
                mailbox_tasks: Vec::new(),
            },
        );
        Ok(id)
    }

    /// Current lifecycle states by component name
    #[must_use]
    pub fn states(&self) -> HashMap<String, ComponentState> {
        let inner = self.inner.lock().expect("registry poisoned");
        inner
            .slots
            .iter()
            .map(|(name, slot)| (name.to_string(), slot.descriptor.state))
            .collect()
    }

    /// Descriptor snapshot for a component
    #[must_use]
    pub fn descriptor(&self, name: &str) -> Option<ComponentDescriptor> {
        let inner = self.inner.lock().expect("registry poisoned");
        ComponentName::try_new(name.to_string())
            .ok()
            .and_then(|name| inner.slots.get(&name))
            .map(|slot| slot.descriptor.clone())
    }

    /// Services contributed by components
    #[must_use]
    pub fn service<T: Send + Sync + 'static>(&self) -> Option<Arc<T>> {
        self.inner.lock().expect("registry poisoned").services.get::<T>()
    }

    /// Features advertised by components
    #[must_use]
    pub fn features(&self) -> Vec<FeatureDescriptor> {
        self.inner.lock().expect("registry poisoned").features.clone()
    }

    /// Initializes and starts every component in dependency order.
    ///
    /// On failure, the failing component and its transitive dependents are
    /// transitioned to `Failed` and the error is returned.
    ///
    /// # Errors
    ///
    /// `Config(DependencyCycle)` for cyclic dependencies,
    /// `UnknownDependency`, or `ComponentFailed` with the failing phase.
    pub async fn start_all(&self) -> Result<(), LifecycleError> {
        let order = self.startup_order()?;
        for name in &order {
            if let Err(err) = self.bring_up(name).await {
                self.fail_dependents(name);
                return Err(err);
            }
        }
        info!(components = order.len(), "component runtime started");
        Ok(())
    }

    /// Stops every running component in reverse dependency order.
    ///
    /// Stop failures mark the component `Failed` but do not halt the
    /// shutdown of the rest.
    ///
    /// # Errors
    ///
    /// `Config(DependencyCycle)` when the dependency graph is unresolvable.
    pub async fn stop_all(&self) -> Result<(), LifecycleError> {
        let mut order = self.startup_order()?;
        order.reverse();
        for name in &order {
            let (component, state) = {
                let inner = self.inner.lock().expect("registry poisoned");
                match inner.slots.get(name) {
                    Some(slot) => (slot.component.clone(), slot.descriptor.state),
                    None => continue,
                }
            };
            if state != ComponentState::Running {
                continue;
            }
            self.transition(name, ComponentState::Stopping)?;
            let ctx = self.component_context(name);
            match component.stop(&ctx).await {
                Ok(()) => {
                    self.transition(name, ComponentState::Stopped)?;
                }
                Err(err) => {
                    warn!(component = %name, error = %err, "component failed during stop");
                    self.mark_failed(name, &format!("stop failed: {err}"));
                }
            }
            let mut inner = self.inner.lock().expect("registry poisoned");
            if let Some(slot) = inner.slots.get_mut(name) {
                slot.subscriptions.clear();
            }
        }
        Ok(())
    }

    /// Disposes all stopped components, releasing their resources
    ///
    /// # Errors
    ///
    /// `Config(DependencyCycle)` when the dependency graph is unresolvable.
    pub async fn dispose_all(&self) -> Result<(), LifecycleError> {
        let mut order = self.startup_order()?;
        order.reverse();
        for name in &order {
            let state = {
                let inner = self.inner.lock().expect("registry poisoned");
                match inner.slots.get(name) {
                    Some(slot) => slot.descriptor.state,
                    None => continue,
                }
            };
            if !state.can_transition_to(ComponentState::Disposing) {
                continue;
            }
            self.transition(name, ComponentState::Disposing)?;
            let mut inner = self.inner.lock().expect("registry poisoned");
            if let Some(slot) = inner.slots.get_mut(name) {
                slot.subscriptions.clear();
                for task in slot.mailbox_tasks.drain(..) {
                    task.abort();
                }
                slot.descriptor.state = ComponentState::Disposed;
            }
        }
        self.shutdown.cancel();
        Ok(())
    }

    /// Attempts to recover a failed component back to `Running`
    ///
    /// # Errors
    ///
    /// `UnknownComponent`, `InvalidTransition` when not `Failed`, or
    /// `ComponentFailed` when recovery itself fails.
    pub async fn recover(&self, name: &str) -> Result<(), LifecycleError> {
        let name = ComponentName::try_new(name.to_string()).map_err(|_| {
            LifecycleError::UnknownComponent {
                component: name.to_string(),
            }
        })?;
        let component = {
            let inner = self.inner.lock().expect("registry poisoned");
            inner
                .slots
                .get(&name)
                .map(|slot| slot.component.clone())
                .ok_or_else(|| LifecycleError::UnknownComponent {
                    component: name.to_string(),
                })?
        };
        self.transition(&name, ComponentState::Recovering)?;
        let ctx = self.component_context(&name);
        if let Err(err) = component.init(&ctx).await {
            self.mark_failed(&name, &format!("recovery failed: {err}"));
            return Err(LifecycleError::ComponentFailed {
                component: name.to_string(),
                phase: "recovery".to_string(),
                source: err,
            });
        }
        self.transition(&name, ComponentState::Recovered)?;
        self.transition(&name, ComponentState::Starting)?;
        match component.start(&ctx).await {
            Ok(()) => {
                self.transition(&name, ComponentState::Running)?;
                info!(component = %name, "component recovered");
                Ok(())
            }
            Err(err) => {
                self.mark_failed(&name, &format!("start after recovery failed: {err}"));
                Err(LifecycleError::ComponentFailed {
                    component: name.to_string(),
                    phase: "start".to_string(),
                    source: err,
                })
            }
        }
    }

    /// Aggregates component health: `Running` plus all healthy means the
    /// system is healthy
    pub async fn check_health(&self) -> SystemHealth {
        let components: Vec<(ComponentName, Arc<dyn Component>, ComponentState)> = {
            let inner = self.inner.lock().expect("registry poisoned");
            inner
                .slots
                .iter()
                .map(|(name, slot)| {
                    (name.clone(), slot.component.clone(), slot.descriptor.state)
                })
                .collect()
        };
        let mut healthy = true;
        let mut reports = HashMap::new();
        for (name, component, state) in components {
            let report = if state == ComponentState::Running {
                component.check_health().await
            } else {
                HealthReport::unhealthy(format!("component is {state}"), None)
            };
            if state != ComponentState::Running || report.status != Health::Healthy {
                healthy = false;
            }
            reports.insert(name.to_string(), (state, report));
        }
        SystemHealth {
            healthy,
            components: reports,
        }
    }

    // ----- internals -------------------------------------------------------

    fn component_context(&self, name: &ComponentName) -> ComponentContext {
        let inner = self.inner.lock().expect("registry poisoned");
        let id = inner
            .slots
            .get(name)
            .map_or_else(ComponentId::generate, |slot| slot.descriptor.id);
        ComponentContext {
            component_id: id,
            bus: self.bus.clone(),
            shutdown: self.shutdown.child_token(),
        }
    }

    async fn bring_up(&self, name: &ComponentName) -> Result<(), LifecycleError> {
        let component = {
            let inner = self.inner.lock().expect("registry poisoned");
            inner
                .slots
                .get(name)
                .map(|slot| slot.component.clone())
                .ok_or_else(|| LifecycleError::UnknownComponent {
                    component: name.to_string(),
                })?
        };
        let ctx = self.component_context(name);

        self.transition(name, ComponentState::Initializing)?;
        if let Err(err) = component.init(&ctx).await {
            error!(component = %name, error = %err, "component init failed");
            self.mark_failed(name, &format!("init failed: {err}"));
            return Err(LifecycleError::ComponentFailed {
                component: name.to_string(),
                phase: "init".to_string(),
                source: err,
            });
        }
        self.transition(name, ComponentState::Initialized)?;

        self.attach_contributions(name, &component)?;

        self.transition(name, ComponentState::Starting)?;
        if let Err(err) = component.start(&ctx).await {
            error!(component = %name, error = %err, "component start failed");
            self.mark_failed(name, &format!("start failed: {err}"));
            return Err(LifecycleError::ComponentFailed {
                component: name.to_string(),
                phase: "start".to_string(),
                source: err,
            });
        }
        self.transition(name, ComponentState::Running)?;
        Ok(())
    }

    fn attach_contributions(
        &self,
        name: &ComponentName,
        component: &Arc<dyn Component>,
    ) -> Result<(), LifecycleError> {
        let behaviors = component.behaviors();
        if !behaviors.is_empty() {
            self.bus.add_behaviors(behaviors).map_err(|source| {
                self.mark_failed(name, &format!("behavior contribution failed: {source}"));
                LifecycleError::Config { source }
            })?;
        }

        let manifest = component.manifest();
        let strict = manifest.isolation.level == IsolationLevel::Strict;
        let mut subscriptions = Vec::new();
        let mut mailbox_tasks = Vec::new();
        for registration in component.handlers() {
            let handler: Arc<dyn MessageHandler> = if strict {
                let (isolated, task) = spawn_isolated_host(registration.handler);
                mailbox_tasks.push(task);
                isolated
            } else {
                registration.handler
            };
            let subscription = self
                .bus
                .subscribe_raw(
                    registration.category,
                    &registration.type_tag,
                    handler,
                    registration.options,
                )
                .map_err(|err| {
                    self.mark_failed(name, &format!("handler registration failed: {err}"));
                    LifecycleError::ComponentFailed {
                        component: name.to_string(),
                        phase: "handler registration".to_string(),
                        source: anyhow::anyhow!(err),
                    }
                })?;
            subscriptions.push(subscription);
        }

        let mut inner = self.inner.lock().expect("registry poisoned");
        component.register_services(&mut inner.services);
        inner.features.extend(component.features());
        if let Some(slot) = inner.slots.get_mut(name) {
            slot.subscriptions.extend(subscriptions);
            slot.mailbox_tasks.extend(mailbox_tasks);
        }
        Ok(())
    }

    fn transition(&self, name: &ComponentName, to: ComponentState) -> Result<(), LifecycleError> {
        let mut inner = self.inner.lock().expect("registry poisoned");
        let slot = inner
            .slots
            .get_mut(name)
            .ok_or_else(|| LifecycleError::UnknownComponent {
                component: name.to_string(),
            })?;
        let from = slot.descriptor.state;
        if !from.can_transition_to(to) {
            return Err(LifecycleError::InvalidTransition {
                component: name.to_string(),
                from: from.to_string(),
                to: to.to_string(),
            });
        }
        slot.descriptor.state = to;
        Ok(())
    }

    fn mark_failed(&self, name: &ComponentName, reason: &str) {
        let mut inner = self.inner.lock().expect("registry poisoned");
        if let Some(slot) = inner.slots.get_mut(name)
            && !slot.descriptor.state.is_terminal()
        {
            slot.descriptor.state = ComponentState::Failed;
            slot.descriptor.failure = Some(reason.to_string());
        }
    }

    fn fail_dependents(&self, failed: &ComponentName) {
        // Transitive closure over reverse dependency edges.
        let dependents: Vec<ComponentName> = {
            let inner = self.inner.lock().expect("registry poisoned");
            let mut downstream = vec![failed.clone()];
            let mut found = Vec::new();
            let mut changed = true;
            while changed {
                changed = false;
                for (name, slot) in &inner.slots {
                    if found.contains(name) || name == failed {
                        continue;
                    }
                    if slot
                        .descriptor
                        .manifest
                        .dependencies
                        .iter()
                        .any(|dep| downstream.contains(dep))
                    {
                        found.push(name.clone());
                        downstream.push(name.clone());
                        changed = true;
                    }
                }
            }
            found
        };
        for name in dependents {
            warn!(component = %name, upstream = %failed, "component failed: upstream_failed");
            self.mark_failed(&name, &format!("upstream_failed: {failed}"));
        }
    }

    fn startup_order(&self) -> Result<Vec<ComponentName>, LifecycleError> {
        let inner = self.inner.lock().expect("registry poisoned");
        let names = inner.order.clone();
        let position: HashMap<ComponentName, usize> = names
            .iter()
            .enumerate()
            .map(|(i, n)| (n.clone(), i))
            .collect();

        let mut indegree: HashMap<ComponentName, usize> =
            names.iter().map(|n| (n.clone(), 0)).collect();
        let mut dependents: HashMap<ComponentName, Vec<ComponentName>> = HashMap::new();
        for name in &names {
            let slot = &inner.slots[name];
            for dep in &slot.descriptor.manifest.dependencies {
                if !indegree.contains_key(dep) {
                    return Err(LifecycleError::UnknownDependency {
                        component: name.to_string(),
                        dependency: dep.to_string(),
                    });
                }
                dependents.entry(dep.clone()).or_default().push(name.clone());
                if let Some(count) = indegree.get_mut(name) {
                    *count += 1;
                }
            }
        }

        let mut ready: Vec<ComponentName> = names
            .iter()
            .filter(|n| indegree.get(*n).copied().unwrap_or(0) == 0)
            .cloned()
            .collect();
        let mut order = Vec::with_capacity(names.len());
        while !ready.is_empty() {
            // Registration order among ready components.
            let best = ready
                .iter()
                .enumerate()
                .min_by_key(|(_, n)| position.get(*n).copied().unwrap_or(usize::MAX))
                .map(|(i, _)| i)
                .unwrap_or(0);
            let node = ready.swap_remove(best);
            if let Some(next) = dependents.get(&node).cloned() {
                for dependent in next {
                    if let Some(count) = indegree.get_mut(&dependent) {
                        *count -= 1;
                        if *count == 0 {
                            ready.push(dependent);
                        }
                    }
                }
            }
            order.push(node);
        }

        if order.len() < names.len() {
            let stuck: Vec<String> = names
                .iter()
                .filter(|n| indegree.get(*n).copied().unwrap_or(0) > 0)
                .map(ToString::to_string)
                .collect();
            return Err(LifecycleError::Config {
                source: ConfigError::DependencyCycle { path: stuck },
            });
        }
        Ok(order)
    }
}

struct IsolationRequest {
    ctx: PipelineContext,
    reply: oneshot::Sender<(PipelineContext, Result<Option<serde_json::Value>, anyhow::Error>)>,
}

/// Proxy handler that routes invocations across an in-process channel to a
/// dedicated task owning the real handler (Strict isolation)
struct IsolatedHandler {
    tx: mpsc::Sender<IsolationRequest>,
}

#[async_trait]
impl MessageHandler for IsolatedHandler {
    async fn handle(
        &self,
        ctx: &mut PipelineContext,
    ) -> Result<Option<serde_json::Value>, anyhow::Error> {
        let placeholder_envelope =
            Envelope::command("isolation.placeholder", serde_json::Value::Null)
                .map_err(|e| anyhow::anyhow!(e.to_string()))?;
        let placeholder = PipelineContext::new(
            placeholder_envelope,
            SecurityContext::anonymous(),
            ctx.cancellation.clone(),
        );
        let moved = std::mem::replace(ctx, placeholder);
        let (reply_tx, reply_rx) = oneshot::channel();
        self.tx
            .send(IsolationRequest {
                ctx: moved,
                reply: reply_tx,
            })
            .await
            .map_err(|_| anyhow::anyhow!("isolated component mailbox closed"))?;
        let (restored, result) = reply_rx
            .await
            .map_err(|_| anyhow::anyhow!("isolated component dropped the request"))?;
        *ctx = restored;
        result
    }
}

fn spawn_isolated_host(
    handler: Arc<dyn MessageHandler>,
) -> (Arc<dyn MessageHandler>, JoinHandle<()>) {
    let (tx, mut rx) = mpsc::channel::<IsolationRequest>(ISOLATION_MAILBOX_DEPTH);
    let task = tokio::spawn(async move {
        while let Some(mut request) = rx.recv().await {
            let result = handler.handle(&mut request.ctx).await;
            let _ = request.reply.send((request.ctx, result));
        }
    });
    (Arc::new(IsolatedHandler { tx }), task)
}
