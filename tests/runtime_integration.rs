//! Component runtime integration: contribution wiring, strict isolation,
//! and system health over a live bus

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use switchyard::bus::{Behavior, MessageBus, MessageHandler, Next, PipelineContext, Placement};
use switchyard::bus::registry::HandlerOptions;
use switchyard::config::BusConfig;
use switchyard::error::BusError;
use switchyard::message::{Command, MessageCategory};
use switchyard::runtime::{
    Component, ComponentContext, ComponentManifest, ComponentRegistry, ComponentState,
    HandlerRegistration, HealthReport, IsolationLevel, IsolationRequirements, ServiceMap,
};
use switchyard::time_provider::test_time_provider;

#[derive(Debug, Serialize, Deserialize)]
struct Reserve {
    sku: String,
}

#[derive(Debug, Serialize, Deserialize, PartialEq)]
struct Reserved {
    ok: bool,
}

impl Command for Reserve {
    type Response = Reserved;
    const TYPE: &'static str = "inventory.reserve";
}

struct ReserveHandler {
    invocations: Arc<AtomicU32>,
}

#[async_trait]
impl MessageHandler for ReserveHandler {
    async fn handle(
        &self,
        ctx: &mut PipelineContext,
    ) -> Result<Option<serde_json::Value>, anyhow::Error> {
        let command: Reserve = serde_json::from_value(ctx.envelope.payload.clone())?;
        assert!(!command.sku.is_empty());
        self.invocations.fetch_add(1, Ordering::SeqCst);
        Ok(Some(serde_json::to_value(Reserved { ok: true })?))
    }
}

struct TaggingBehavior;

#[async_trait]
impl Behavior for TaggingBehavior {
    fn id(&self) -> &str {
        "inventory-tagger"
    }

    fn placement(&self) -> Placement {
        Placement::Before("retry".to_string())
    }

    async fn invoke(&self, ctx: &mut PipelineContext, next: Next<'_>) -> Result<(), BusError> {
        ctx.properties
            .insert("tagged".to_string(), serde_json::json!(true));
        next.run(ctx).await
    }
}

struct InventoryComponent {
    isolation: IsolationLevel,
    invocations: Arc<AtomicU32>,
}

struct InventoryService {
    name: &'static str,
}

#[async_trait]
impl Component for InventoryComponent {
    fn manifest(&self) -> ComponentManifest {
        ComponentManifest::new("inventory", "1.0.0")
            .unwrap()
            .with_isolation(IsolationRequirements {
                level: self.isolation,
                ..IsolationRequirements::default()
            })
            .with_tag("stock")
    }

    async fn init(&self, _ctx: &ComponentContext) -> Result<(), anyhow::Error> {
        Ok(())
    }

    async fn start(&self, _ctx: &ComponentContext) -> Result<(), anyhow::Error> {
        Ok(())
    }

    async fn stop(&self, _ctx: &ComponentContext) -> Result<(), anyhow::Error> {
        Ok(())
    }

    async fn check_health(&self) -> HealthReport {
        HealthReport::healthy().with_data("reservations", serde_json::json!(0))
    }

    fn behaviors(&self) -> Vec<Arc<dyn Behavior>> {
        vec![Arc::new(TaggingBehavior)]
    }

    fn handlers(&self) -> Vec<HandlerRegistration> {
        vec![HandlerRegistration {
            category: MessageCategory::Command,
            type_tag: Reserve::TYPE.to_string(),
            handler: Arc::new(ReserveHandler {
                invocations: self.invocations.clone(),
            }),
            options: HandlerOptions::named("inventory.reserve"),
        }]
    }

    fn register_services(&self, services: &mut ServiceMap) {
        services.insert(Arc::new(InventoryService { name: "inventory" }));
    }
}

async fn test_bus() -> MessageBus {
    MessageBus::builder(BusConfig::default())
        .with_time_provider(test_time_provider())
        .build()
        .await
        .unwrap()
}

#[tokio::test]
async fn component_contributions_reach_the_bus() {
    let bus = test_bus().await;
    let registry = ComponentRegistry::new(bus.clone());
    let invocations = Arc::new(AtomicU32::new(0));
    registry
        .register(Arc::new(InventoryComponent {
            isolation: IsolationLevel::None,
            invocations: invocations.clone(),
        }))
        .unwrap();
    registry.start_all().await.unwrap();

    let response = bus
        .send(&Reserve {
            sku: "A-1".to_string(),
        })
        .await
        .unwrap();
    assert_eq!(response, Reserved { ok: true });
    assert_eq!(invocations.load(Ordering::SeqCst), 1);

    // The contributed service contract is discoverable by type.
    let service = registry.service::<InventoryService>().unwrap();
    assert_eq!(service.name, "inventory");

    // The contributed feature/health surface aggregates healthy.
    let health = registry.check_health().await;
    assert!(health.healthy);
    assert_eq!(health.components["inventory"].0, ComponentState::Running);
}

#[tokio::test]
async fn strict_isolation_routes_through_the_mailbox() {
    let bus = test_bus().await;
    let registry = ComponentRegistry::new(bus.clone());
    let invocations = Arc::new(AtomicU32::new(0));
    registry
        .register(Arc::new(InventoryComponent {
            isolation: IsolationLevel::Strict,
            invocations: invocations.clone(),
        }))
        .unwrap();
    registry.start_all().await.unwrap();

    for _ in 0..3 {
        let response = bus
            .send(&Reserve {
                sku: "B-2".to_string(),
            })
            .await
            .unwrap();
        assert!(response.ok);
    }
    assert_eq!(invocations.load(Ordering::SeqCst), 3);
}

#[tokio::test]
async fn stopping_the_component_removes_its_handlers() {
    let bus = test_bus().await;
    let registry = ComponentRegistry::new(bus.clone());
    registry
        .register(Arc::new(InventoryComponent {
            isolation: IsolationLevel::None,
            invocations: Arc::new(AtomicU32::new(0)),
        }))
        .unwrap();
    registry.start_all().await.unwrap();
    assert!(
        bus.send(&Reserve {
            sku: "C-3".to_string()
        })
        .await
        .is_ok()
    );

    registry.stop_all().await.unwrap();
    let result = bus
        .send(&Reserve {
            sku: "C-3".to_string(),
        })
        .await;
    assert!(matches!(result, Err(BusError::NoHandler { .. })));
}
