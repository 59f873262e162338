//! Waveline development gateway.
//!
//! A lightweight in-memory server that speaks the Waveline push protocol
//! over WebSocket (`/ws`) and serves the REST message endpoints
//! (`GET`/`POST /conversations/{id}/messages`) from the same history, so the
//! client engine's fallback path can be exercised end to end. Used by
//! integration tests and local development; not a production backend.

pub mod config;
pub mod gateway;

pub use gateway::{start_server, start_server_with_state, GatewayState};
