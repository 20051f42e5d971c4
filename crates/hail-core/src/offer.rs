//! The [`RideOffer`] data model — a dispatch proposal sent to exactly one
//! driver for exactly one ride request.
//!
//! Offer identifiers are UUID v7 and never reused. Status transitions are
//! monotonic: once an offer reaches a terminal state it never leaves it.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

use crate::ids::{OfferId, RideId};

/// Lifecycle status of a [`RideOffer`].
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum OfferStatus {
    /// Awaiting the driver's response.
    Pending,
    /// Driver accepted.
    Accepted,
    /// Driver rejected.
    Rejected,
    /// Expiry window elapsed without a response.
    Expired,
    /// Withdrawn by the server or rider.
    Cancelled,
}

impl OfferStatus {
    /// Whether this status is terminal (no further transitions allowed).
    #[must_use]
    pub fn is_terminal(self) -> bool {
        !matches!(self, Self::Pending)
    }
}

/// A dispatch proposal for one ride, addressed to one driver.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RideOffer {
    /// Unique per ride request; never reused.
    pub offer_id: OfferId,
    /// The ride this offer dispatches.
    pub ride_id: RideId,
    /// Pickup location description.
    pub pickup: String,
    /// Destination description.
    pub destination: String,
    /// Estimated fare in the platform currency.
    pub fare_estimate: f64,
    /// When the offer was created.
    pub created_at: DateTime<Utc>,
    /// When the offer stops being actionable.
    pub expires_at: DateTime<Utc>,
    /// Current lifecycle status.
    pub status: OfferStatus,
}

impl RideOffer {
    /// Create a pending offer expiring `ttl` from now.
    #[must_use]
    pub fn new(
        ride_id: RideId,
        pickup: String,
        destination: String,
        fare_estimate: f64,
        ttl: Duration,
    ) -> Self {
        let now = Utc::now();
        Self {
            offer_id: OfferId::new(),
            ride_id,
            pickup,
            destination,
            fare_estimate,
            created_at: now,
            expires_at: now + ttl,
            status: OfferStatus::Pending,
        }
    }

    /// Whether the offer's expiry time has passed at `now`.
    #[must_use]
    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        now >= self.expires_at
    }

    /// Attempt a status transition.
    ///
    /// Returns `false` (leaving the offer untouched) if the current status
    /// is already terminal; transitions are monotonic.
    pub fn transition(&mut self, next: OfferStatus) -> bool {
        if self.status.is_terminal() {
            return false;
        }
        self.status = next;
        true
    }
}
