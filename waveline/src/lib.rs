//! Waveline client transport engine.
//!
//! Owns the realtime push channel (websocket), liveness monitoring,
//! reconnection, per-conversation channel subscriptions, the outbound
//! message ledger, and an HTTP polling fallback for when the push channel
//! cannot be restored. Applications interact through [`TransportFacade`]
//! and consume a single stream of [`TransportEvent`]s.

pub mod config;
pub mod connection;
pub mod facade;
pub mod heartbeat;
pub mod ledger;
pub mod policy;
mod poller;
pub mod registry;
pub mod rest;
pub mod socket;

pub use config::TransportConfig;
pub use connection::ConnectionState;
pub use facade::{TransportEvent, TransportFacade};
pub use ledger::OutboundEnvelope;
