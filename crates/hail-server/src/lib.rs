//! # hail-server
//!
//! The dispatch side of the hail system:
//!
//! - WebSocket gateway: per-connection sessions, auth-first handshake,
//!   heartbeat liveness, typed event dispatch
//! - [`registry::DriverRegistry`]: driver availability with round-robin
//!   selection and offer reservation
//! - [`matcher::Matcher`]: single-match assignment with bounded fallback
//! - HTTP endpoints: `/ws` upgrade, `/health`, `/metrics`
//! - Graceful shutdown via `CancellationToken`

#![deny(unsafe_code)]

pub mod config;
pub mod connections;
pub mod health;
pub mod matcher;
pub mod metrics;
pub mod registry;
pub mod server;
pub mod session;
pub mod shutdown;
pub mod store;
