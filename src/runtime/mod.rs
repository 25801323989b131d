//! Pluggable component runtime
//!
//! Components implement the [`component::Component`] protocol; the
//! [`registry::ComponentRegistry`] owns their descriptors, drives the
//! lifecycle state machine, resolves declared dependencies into a startup
//! order, and wires contributed behaviors, handlers, features, and services
//! into the bus.

pub mod component;
pub mod lifecycle;
pub mod registry;

pub use component::{
    Component, ComponentContext, ComponentDescriptor, ComponentManifest, FeatureDescriptor,
    HandlerRegistration, Health, HealthReport, IsolationLevel, IsolationRequirements,
    ResourceCaps, ServiceMap,
};
pub use lifecycle::ComponentState;
pub use registry::{ComponentRegistry, SystemHealth};
