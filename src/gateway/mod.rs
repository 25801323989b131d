//! HTTP API gateway
//!
//! A frontend instance of the transport contract's spirit for HTTP: route
//! matching with specificity scoring, role checks, per-client token-bucket
//! rate limiting, health-aware load balancing, and upstream forwarding with
//! response relay.

pub mod balancer;
pub mod health;
pub mod rate_limit;
pub mod route;
pub mod server;

pub use balancer::{ActiveGuard, Upstream, UpstreamSet};
pub use rate_limit::{RateDecision, TokenBucketLimiter};
pub use route::{PathPattern, Route, RouteTable};
pub use server::{Authenticator, Gateway, bind_gateway};
