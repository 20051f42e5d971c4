//! # hail-core
//!
//! Foundation types shared by the hail dispatch server and driver client:
//!
//! - Branded ID newtypes ([`ids`])
//! - The typed wire protocol event enum ([`protocol`])
//! - The [`RideOffer`](offer::RideOffer) data model with monotonic status
//!   transitions ([`offer`])
//! - Exponential backoff calculation for reconnection ([`backoff`])

#![deny(unsafe_code)]

pub mod backoff;
pub mod ids;
pub mod offer;
pub mod protocol;
