//! Plateful API gateway core
//!
//! The single entry point every inbound API call passes through:
//!
//! - [`routes`] — ordered, first-match-wins route table with `{name}`
//!   parameter patterns and public/private classification
//! - [`auth`] — signed identity token verification against a cached,
//!   rate-limited remote key set
//! - [`dispatch`] — synchronous forwarding to downstream compute units
//!   with a verified identity context
//! - [`tracker`] — fire-and-forget, dual-throttled usage telemetry
//! - [`gateway`] — the per-request orchestrator wiring the above
//!
//! The business handlers behind the gateway (recipes, posts, nutrition,
//! moderation) are external collaborators; this crate only routes to them.

pub mod auth;
pub mod context;
pub mod dispatch;
pub mod gateway;
pub mod routes;
pub mod tracker;

pub use auth::{AuthError, TokenValidator, ValidatorConfig};
pub use dispatch::{
    DispatchError, Dispatcher, HandlerInvoker, HandlerRegistry, HttpInvoker, HEALTH_HANDLER,
};
pub use gateway::{Gateway, GatewayOptions};
pub use routes::{default_routes, RouteDef, RouteTable};
pub use tracker::{ActivityStore, ActivityTracker, NoopActivityStore, StoreError, TrackerSettings};
