//! WebSocket transports for the tether synchronization runtime.
//!
//! Two halves of the same wire format:
//!
//! - [`client::WsConnector`] — an outbound connector with exponential
//!   backoff and jitter, implementing the core's
//!   [`tether_core::TransportAdapter`] contract.
//! - [`server::router`] — an axum router that accepts WebSocket upgrades
//!   and feeds them into a runtime, for relays and other always-on peers.
//!
//! Frames travel as binary WebSocket messages carrying the core's
//! fragment coding (complete / header / data), with the 100 KiB
//! WebSocket threshold. Text, ping and pong frames are ignored.

pub mod client;
pub mod server;

pub use client::{ReconnectConfig, WsConnector};
pub use server::router;
