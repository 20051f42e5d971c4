//! # hail-client
//!
//! The client side of the hail system:
//!
//! - [`transport`]: the dial seam and the WebSocket dialer with its
//!   auth-first handshake
//! - [`connection::ConnectionManager`]: reconnect loop with jittered
//!   exponential backoff, application heartbeats, and a bounded outbound
//!   buffer that never drops silently
//! - [`offers::OfferQueue`]: incoming offer tracking with duplicate
//!   suppression, expiry, and response statistics

#![deny(unsafe_code)]

pub mod config;
pub mod connection;
pub mod offers;
pub mod transport;
