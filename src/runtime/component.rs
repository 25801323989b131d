//! Component protocol: manifests, isolation, health, and contribution hooks
//!
//! A component is any value implementing [`Component`]. The registry owns a
//! [`ComponentDescriptor`] per registration; components identify themselves
//! by id rather than holding a reference back to the registry.

use crate::bus::dispatcher::MessageBus;
use crate::bus::pipeline::Behavior;
use crate::bus::registry::{HandlerOptions, MessageHandler};
use crate::domain_types::{ComponentId, ComponentName};
use crate::message::MessageCategory;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::any::{Any, TypeId};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

use super::lifecycle::ComponentState;

/// Isolation demanded by a component's manifest
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum IsolationLevel {
    /// Shared context, no restrictions
    #[default]
    None,
    /// Advisory isolation; the host may enforce it
    Standard,
    /// Messages to the component cross an in-process channel boundary
    Strict,
    /// Advisory sandboxing with resource caps; host-enforced
    Sandbox,
}

/// Resource caps attached to isolation requirements; advisory unless the
/// host enforces them
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct ResourceCaps {
    /// Upper bound on resident memory
    pub max_memory_bytes: Option<u64>,
    /// Upper bound on CPU share, percent
    pub max_cpu_percent: Option<u8>,
}

/// Isolation requirements declared in a manifest
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct IsolationRequirements {
    /// Isolation level
    pub level: IsolationLevel,
    /// Whether the component may open network connections
    pub allow_network: bool,
    /// Whether the component may touch the filesystem
    pub allow_filesystem: bool,
    /// Resource caps
    pub caps: ResourceCaps,
}

/// Static description of a component: identity, dependencies, isolation
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ComponentManifest {
    /// Unique component name
    pub name: ComponentName,
    /// Semantic version string
    pub version: String,
    /// Author label
    pub author: Option<String>,
    /// Names of components that must be running first
    pub dependencies: Vec<ComponentName>,
    /// Free-form capability tags
    pub tags: HashSet<String>,
    /// Isolation requirements
    pub isolation: IsolationRequirements,
}

impl ComponentManifest {
    /// Creates a minimal manifest
    ///
    /// # Errors
    ///
    /// Returns the nutype validation error when the name is empty.
    pub fn new(name: &str, version: &str) -> Result<Self, String> {
        let name = ComponentName::try_new(name.to_string()).map_err(|e| e.to_string())?;
        Ok(Self {
            name,
            version: version.to_string(),
            author: None,
            dependencies: Vec::new(),
            tags: HashSet::new(),
            isolation: IsolationRequirements::default(),
        })
    }

    /// Declares a dependency on another component
    ///
    /// # Errors
    ///
    /// Returns the nutype validation error when the name is empty.
    pub fn with_dependency(mut self, name: &str) -> Result<Self, String> {
        let dep = ComponentName::try_new(name.to_string()).map_err(|e| e.to_string())?;
        self.dependencies.push(dep);
        Ok(self)
    }

    /// Sets the isolation requirements
    #[must_use]
    pub fn with_isolation(mut self, isolation: IsolationRequirements) -> Self {
        self.isolation = isolation;
        self
    }

    /// Adds a capability tag
    #[must_use]
    pub fn with_tag(mut self, tag: impl Into<String>) -> Self {
        self.tags.insert(tag.into());
        self
    }
}

/// Registry-owned record of a registered component
#[derive(Debug, Clone)]
pub struct ComponentDescriptor {
    /// Registry-assigned identity
    pub id: ComponentId,
    /// The component's manifest
    pub manifest: ComponentManifest,
    /// Current lifecycle state
    pub state: ComponentState,
    /// Failure description when `state` is `Failed`
    pub failure: Option<String>,
}

/// Health of one component
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Health {
    /// Operating normally
    Healthy,
    /// Operating with reduced capability
    Degraded {
        /// What is degraded
        message: String,
    },
    /// Not operating
    Unhealthy {
        /// What is broken
        message: String,
        /// Underlying error rendering, when known
        error: Option<String>,
    },
}

/// Health status plus structured diagnostic data
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthReport {
    /// Overall status
    pub status: Health,
    /// Structured diagnostics (queue depths, connection counts, ...)
    pub data: HashMap<String, serde_json::Value>,
}

impl HealthReport {
    /// A healthy report with no diagnostics
    #[must_use]
    pub fn healthy() -> Self {
        Self {
            status: Health::Healthy,
            data: HashMap::new(),
        }
    }

    /// A degraded report
    #[must_use]
    pub fn degraded(message: impl Into<String>) -> Self {
        Self {
            status: Health::Degraded {
                message: message.into(),
            },
            data: HashMap::new(),
        }
    }

    /// An unhealthy report
    #[must_use]
    pub fn unhealthy(message: impl Into<String>, error: Option<String>) -> Self {
        Self {
            status: Health::Unhealthy {
                message: message.into(),
                error,
            },
            data: HashMap::new(),
        }
    }

    /// Attaches a diagnostic datum
    #[must_use]
    pub fn with_data(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
        self.data.insert(key.into(), value);
        self
    }
}

/// Discoverable capability advertisement contributed by a component
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FeatureDescriptor {
    /// Feature name
    pub name: String,
    /// Feature version
    pub version: String,
    /// Free-form attributes
    pub attributes: HashMap<String, serde_json::Value>,
}

/// Typed service registrations contributed by components.
///
/// Services are keyed by type; the last registration for a type wins.
#[derive(Default)]
pub struct ServiceMap {
    entries: HashMap<TypeId, Arc<dyn Any + Send + Sync>>,
}

impl ServiceMap {
    /// Creates an empty map
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a service instance under its type
    pub fn insert<T: Send + Sync + 'static>(&mut self, service: Arc<T>) {
        self.entries.insert(TypeId::of::<T>(), service);
    }

    /// Looks up a service by type
    #[must_use]
    pub fn get<T: Send + Sync + 'static>(&self) -> Option<Arc<T>> {
        self.entries
            .get(&TypeId::of::<T>())
            .and_then(|entry| entry.clone().downcast::<T>().ok())
    }

    /// Number of registered services
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether no services are registered
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// A handler registration contributed by a component.
///
/// The registry feeds these to the bus so it can interpose the isolation
/// boundary for `Strict` components.
pub struct HandlerRegistration {
    /// Dispatch category
    pub category: MessageCategory,
    /// Type tag the handler serves
    pub type_tag: String,
    /// The handler
    pub handler: Arc<dyn MessageHandler>,
    /// Registration options
    pub options: HandlerOptions,
}

/// Per-component view of the runtime handed to lifecycle hooks
pub struct ComponentContext {
    /// This component's registry-assigned id
    pub component_id: ComponentId,
    /// The message bus
    pub bus: MessageBus,
    /// Cancelled when the runtime shuts down
    pub shutdown: CancellationToken,
}

/// The pluggable component protocol.
///
/// The runtime holds components polymorphically and drives them through the
/// lifecycle state machine; contribution hooks feed behaviors, handlers,
/// features, and services into the running system at attach time.
#[async_trait]
pub trait Component: Send + Sync {
    /// Static manifest: identity, dependencies, isolation
    fn manifest(&self) -> ComponentManifest;

    /// Acquires resources; runs before `start` in dependency order
    async fn init(&self, ctx: &ComponentContext) -> Result<(), anyhow::Error>;

    /// Begins serving; dependencies are `Running` when this is called
    async fn start(&self, ctx: &ComponentContext) -> Result<(), anyhow::Error>;

    /// Stops serving; dependents have already stopped
    async fn stop(&self, ctx: &ComponentContext) -> Result<(), anyhow::Error>;

    /// Reports component health
    async fn check_health(&self) -> HealthReport {
        HealthReport::healthy()
    }

    /// Pipeline behaviors to merge into the bus chain
    fn behaviors(&self) -> Vec<Arc<dyn Behavior>> {
        Vec::new()
    }

    /// Capability advertisements
    fn features(&self) -> Vec<FeatureDescriptor> {
        Vec::new()
    }

    /// Message handlers to register with the bus
    fn handlers(&self) -> Vec<HandlerRegistration> {
        Vec::new()
    }

    /// Typed service contracts to publish
    fn register_services(&self, _services: &mut ServiceMap) {}
}
