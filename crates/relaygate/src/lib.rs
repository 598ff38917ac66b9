//! Relaygate - a Claude Messages API gateway for OpenAI-compatible upstreams.
//!
//! Clients speak Anthropic's `/v1/messages` API. The gateway resolves the
//! requested model per caller, picks one of the caller's upstream credentials,
//! routes restricted upstreams through a relay host, and translates both the
//! buffered and the streamed (SSE) responses back to Anthropic semantics.
//!
//! Pieces:
//! - [`rotation`]: priority / least-recently-used credential selection with
//!   failure-count health.
//! - [`routing`]: host swap for upstreams that need a relay.
//! - [`streaming`]: chat-completion chunks to Anthropic stream events.
//! - [`gateway`]: the per-request pipeline, keep-alive pings and accounting.

pub mod auth;
pub mod config;
pub mod error;
pub mod gateway;
pub mod rotation;
pub mod routing;
pub mod server;
pub mod store;
pub mod streaming;
pub mod telemetry;
pub mod translation;
pub mod types;

pub use config::GatewayConfig;
pub use error::GatewayError;
pub use gateway::{Gateway, GatewayReply, RequestContext};
pub use server::serve;
