//! In-process CQRS message bus
//!
//! The bus routes commands (single handler, reply), events (fan-out), and
//! queries (single handler, result) through a pipeline of composable
//! behaviors, with correlation, retry, dead-lettering, and global
//! backpressure.
//!
//! ## Components
//!
//! - [`dispatcher::MessageBus`]: dispatch surface wiring everything together
//! - [`registry::HandlerRegistry`]: type-keyed handler lookup
//! - [`pipeline::BehaviorChain`]: resolved behavior ordering around handlers
//! - [`correlator::Correlator`]: in-flight request/reply tracking
//! - [`dead_letter::DeadLetterQueue`]: bounded buffer of failed envelopes
//! - [`flow_control::FlowController`]: sliding-window admission with
//!   priority waiters

pub mod behaviors;
pub mod correlator;
pub mod dead_letter;
pub mod dispatcher;
pub mod flow_control;
pub mod pipeline;
pub mod registry;

pub use correlator::{Correlator, ReplyWaiter};
pub use dead_letter::{DeadLetterEntry, DeadLetterQueue};
pub use dispatcher::{BusBuilder, CallContext, MessageBus, PublishReport};
pub use flow_control::{AdmissionTicket, BackpressureLevel, FlowController};
pub use pipeline::{
    Behavior, BehaviorChain, Flow, Next, Placement, PipelineContext, PipelineStage,
    TerminalHandler,
};
pub use registry::{HandlerOptions, HandlerRegistry, MessageHandler, Subscription};
