//! # Switchyard - Pluggable Messaging and Transport Runtime
//!
//! Switchyard lets application components exchange commands, events, and
//! queries over pluggable wire transports with uniform semantics around
//! delivery, correlation, backpressure, and failure handling.
//!
//! ## Core pieces
//!
//! - **Message bus** ([`bus`]): CQRS dispatch (send / publish / query)
//!   through a pipeline of composable behaviors, with correlation, retry,
//!   dead-lettering, and global admission control.
//! - **Component runtime** ([`runtime`]): lifecycle state machine,
//!   dependency-ordered startup, and behavior/handler/service contribution.
//! - **Transport adapters** ([`transport`]): a uniform connect / send /
//!   subscribe / pause contract; framed TCP (server and client with
//!   pooling) ships in-tree.
//! - **API gateway** ([`gateway`]): HTTP route matching, load balancing,
//!   per-client rate limiting, and upstream forwarding.
//!
//! ## Example
//!
//! ```rust,no_run
//! use serde::{Deserialize, Serialize};
//! use switchyard::config::BusConfig;
//! use switchyard::bus::MessageBus;
//! use switchyard::message::Command;
//!
//! #[derive(Serialize, Deserialize)]
//! struct AddTodo { text: String }
//!
//! #[derive(Serialize, Deserialize)]
//! struct TodoAdded { id: u64 }
//!
//! impl Command for AddTodo {
//!     type Response = TodoAdded;
//!     const TYPE: &'static str = "todos.add";
//! }
//!
//! # #[tokio::main]
//! # async fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let bus = MessageBus::builder(BusConfig::default()).build().await?;
//! let _handler = bus.subscribe_command(|cmd: AddTodo| async move {
//!     println!("adding: {}", cmd.text);
//!     Ok(TodoAdded { id: 42 })
//! })?;
//!
//! let added = bus.send(&AddTodo { text: "buy milk".into() }).await?;
//! println!("todo {}", added.id);
//! # Ok(())
//! # }
//! ```
//!
//! ## Architecture
//!
//! Ownership is unidirectional throughout: the component registry owns
//! descriptors, pools own connections, and borrowers identify resources by
//! id rather than holding references back to the owner. Errors are plain
//! result types; retry and timeout wrap the result boundary instead of
//! catching panics.

pub mod bus;
pub mod config;
pub mod domain_types;
pub mod error;
pub mod gateway;
pub mod message;
pub mod metrics;
pub mod observability;
pub mod retry;
pub mod runtime;
pub mod security;
pub mod serializer;
pub mod time_provider;
pub mod transport;

pub use bus::{CallContext, MessageBus, PublishReport};
pub use error::{BusError, ConfigError, LifecycleError, PoolError, TransportError};
pub use message::{Command, Envelope, Event, MessageCategory, Query, TransportMessage};
pub use metrics::{AtomicMetrics, MetricsCollector, NoopMetrics};
pub use security::SecurityContext;
pub use serializer::{JsonSerializer, MessageSerializer};
