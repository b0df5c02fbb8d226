//! HTTP surface over the email producer and the campaign orchestrator.
//!
//! Authentication happens upstream; the gateway forwards the caller's id in
//! the `X-User-Id` header.

pub mod middleware;
pub mod routes;
pub mod state;
