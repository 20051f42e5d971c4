//! Single-match dispatch: pairs a ride request with exactly one driver.
//!
//! The matcher persists the ride through the injected [`RideStore`]
//! collaborator, reserves a driver in the registry, and sends the offer to
//! that driver's connection only — never a broadcast. A failed send falls
//! back to the next driver, bounded by the configured retry limit.
//! Outstanding offers are tracked so an accept, reject, or expiry releases
//! the driver's reservation exactly once.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use metrics::counter;
use parking_lot::Mutex;
use tracing::{debug, info, warn};

use hail_core::ids::{ConnectionId, DriverId, OfferId, RideId, RiderId};
use hail_core::offer::RideOffer;
use hail_core::protocol::{
    Event, RideAssignedPayload, RideIncomingPayload, RideNoDriversPayload, RideRequestPayload,
    RideState, RideStatusPayload,
};

use crate::connections::ConnectionTable;
use crate::registry::DriverRegistry;

/// Errors from the ride/record store collaborator.
#[derive(Debug, thiserror::Error)]
pub enum RideStoreError {
    /// The store could not complete the operation.
    #[error("ride store unavailable: {message}")]
    Unavailable {
        /// Description from the store backend.
        message: String,
    },
}

/// External ride/record store consumed by the matcher.
#[async_trait]
pub trait RideStore: Send + Sync {
    /// Persist a new pending ride and return its identity.
    async fn create_ride(
        &self,
        origin: &str,
        destination: &str,
        rider_id: &RiderId,
    ) -> Result<RideId, RideStoreError>;

    /// Record a ride state change.
    async fn update_ride_status(
        &self,
        ride_id: &RideId,
        status: RideState,
    ) -> Result<(), RideStoreError>;
}

/// Errors crossing the matcher boundary.
#[derive(Debug, thiserror::Error)]
pub enum MatcherError {
    /// The ride store failed; the request was not dispatched.
    #[error(transparent)]
    Store(#[from] RideStoreError),
}

/// Result of dispatching one ride request.
#[derive(Clone, Debug)]
pub enum DispatchOutcome {
    /// An offer was delivered to exactly one driver.
    Offered {
        /// The offer as sent.
        offer: RideOffer,
        /// The chosen driver's connection.
        connection_id: ConnectionId,
        /// The chosen driver.
        driver_id: DriverId,
    },
    /// No driver could be reached; no offer exists.
    NoDrivers {
        /// The persisted (still pending) ride.
        ride_id: RideId,
    },
}

/// Result of resolving a driver's answer to an offer.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Resolution {
    /// The ride is assigned to the responding driver.
    Assigned,
    /// The driver declined; their reservation was released.
    Released,
    /// The offer is unknown or already resolved/expired; the answer was
    /// dropped.
    Stale,
}

struct Outstanding {
    connection_id: ConnectionId,
    driver_id: DriverId,
    ride_id: RideId,
    requester: ConnectionId,
    request: RideRequestPayload,
    expires_at: DateTime<Utc>,
}

/// The dispatch matcher.
pub struct Matcher {
    registry: Arc<DriverRegistry>,
    connections: Arc<ConnectionTable>,
    store: Arc<dyn RideStore>,
    offer_ttl: Duration,
    retry_limit: u32,
    outstanding: Mutex<HashMap<OfferId, Outstanding>>,
}

impl Matcher {
    /// Build a matcher over the shared registry, connection table, and
    /// ride store.
    pub fn new(
        registry: Arc<DriverRegistry>,
        connections: Arc<ConnectionTable>,
        store: Arc<dyn RideStore>,
        offer_ttl_secs: i64,
        retry_limit: u32,
    ) -> Self {
        Self {
            registry,
            connections,
            store,
            offer_ttl: Duration::seconds(offer_ttl_secs),
            retry_limit,
            outstanding: Mutex::new(HashMap::new()),
        }
    }

    /// Dispatch a ride request from `requester`.
    ///
    /// Persists the ride, then tries up to `retry_limit + 1` drivers:
    /// each candidate is reserved, sent `ride:incoming`, and — if the send
    /// fails — dropped from the registry and excluded from the re-pick.
    pub async fn dispatch(
        &self,
        requester: &ConnectionId,
        request: &RideRequestPayload,
    ) -> Result<DispatchOutcome, MatcherError> {
        counter!("dispatch_requests_total").increment(1);
        let ride_id = self
            .store
            .create_ride(&request.origin, &request.destination, &request.rider_id)
            .await?;
        debug!(ride_id = %ride_id, rider_id = %request.rider_id, "ride persisted");

        let mut exclude: Vec<ConnectionId> = Vec::new();
        for _ in 0..=self.retry_limit {
            let Some((connection_id, driver_id)) = self.registry.pick_and_reserve(&exclude) else {
                break;
            };

            let offer = RideOffer::new(
                ride_id.clone(),
                request.origin.clone(),
                request.destination.clone(),
                estimate_fare(&request.origin, &request.destination),
                self.offer_ttl,
            );
            let event = Event::RideIncoming(RideIncomingPayload {
                offer: offer.clone(),
            });

            if self.connections.send_event_to(&connection_id, &event).await {
                info!(
                    offer_id = %offer.offer_id,
                    ride_id = %ride_id,
                    driver_id = %driver_id,
                    "offer dispatched"
                );
                counter!("dispatch_offers_total").increment(1);
                let _ = self.outstanding.lock().insert(
                    offer.offer_id.clone(),
                    Outstanding {
                        connection_id: connection_id.clone(),
                        driver_id: driver_id.clone(),
                        ride_id: ride_id.clone(),
                        requester: requester.clone(),
                        request: request.clone(),
                        expires_at: offer.expires_at,
                    },
                );
                return Ok(DispatchOutcome::Offered {
                    offer,
                    connection_id,
                    driver_id,
                });
            }

            // Connection closed mid-dispatch: drop the dangling record and
            // re-pick without it.
            warn!(conn_id = %connection_id, ride_id = %ride_id, "offer send failed, trying next driver");
            self.registry.on_disconnect(&connection_id);
            exclude.push(connection_id);
        }

        counter!("dispatch_no_drivers_total").increment(1);
        info!(ride_id = %ride_id, "no drivers available");
        Ok(DispatchOutcome::NoDrivers { ride_id })
    }

    /// Apply a driver's accept or reject for an offer.
    ///
    /// Stale answers (unknown offer, wrong responder, or past expiry) are
    /// dropped without touching registry or store state.
    pub async fn resolve(
        &self,
        offer_id: &OfferId,
        responder: &DriverId,
        accepted: bool,
    ) -> Result<Resolution, MatcherError> {
        let entry = {
            let mut outstanding = self.outstanding.lock();
            match outstanding.get(offer_id) {
                Some(o) if &o.driver_id == responder => outstanding.remove(offer_id),
                Some(_) => {
                    warn!(offer_id = %offer_id, responder = %responder, "answer from wrong driver");
                    None
                }
                None => None,
            }
        };
        let Some(entry) = entry else {
            counter!("offer_outcomes_total", "outcome" => "stale").increment(1);
            return Ok(Resolution::Stale);
        };

        if Utc::now() >= entry.expires_at {
            self.registry.release(&entry.connection_id);
            counter!("offer_outcomes_total", "outcome" => "expired").increment(1);
            return Ok(Resolution::Stale);
        }

        if accepted {
            self.store
                .update_ride_status(&entry.ride_id, RideState::Assigned)
                .await?;
            // The driver is now busy with this ride.
            self.registry.register_unavailable(&entry.connection_id);
            let _ = self
                .connections
                .send_event_to(
                    &entry.requester,
                    &Event::RideAssigned(RideAssignedPayload {
                        ride_id: entry.ride_id.clone(),
                        driver_id: entry.driver_id.clone(),
                    }),
                )
                .await;
            let _ = self
                .connections
                .send_event_to(
                    &entry.requester,
                    &Event::RideStatus(RideStatusPayload {
                        ride_id: entry.ride_id,
                        status: RideState::Assigned,
                    }),
                )
                .await;
            counter!("offer_outcomes_total", "outcome" => "accepted").increment(1);
            Ok(Resolution::Assigned)
        } else {
            self.registry.release(&entry.connection_id);
            counter!("offer_outcomes_total", "outcome" => "rejected").increment(1);
            Ok(Resolution::Released)
        }
    }

    /// Sweep outstanding offers past their expiry at `now`.
    ///
    /// Each expired offer releases its driver's reservation and is
    /// re-dispatched to the next available driver (excluding the one that
    /// let it lapse); if nobody is left the requester gets
    /// `ride:noDrivers`. Returns the expired offer IDs.
    pub async fn expire_outstanding(&self, now: DateTime<Utc>) -> Vec<OfferId> {
        let expired: Vec<(OfferId, Outstanding)> = {
            let mut outstanding = self.outstanding.lock();
            let ids: Vec<OfferId> = outstanding
                .iter()
                .filter(|(_, o)| now >= o.expires_at)
                .map(|(id, _)| id.clone())
                .collect();
            ids.into_iter()
                .filter_map(|id| outstanding.remove(&id).map(|o| (id, o)))
                .collect()
        };

        let mut ids = Vec::with_capacity(expired.len());
        for (offer_id, entry) in expired {
            info!(offer_id = %offer_id, driver_id = %entry.driver_id, "offer expired without response");
            counter!("offer_outcomes_total", "outcome" => "expired").increment(1);
            self.registry.release(&entry.connection_id);
            self.redispatch(&entry).await;
            ids.push(offer_id);
        }
        ids
    }

    /// Number of offers currently awaiting a driver response.
    pub fn outstanding_count(&self) -> usize {
        self.outstanding.lock().len()
    }

    /// Re-offer an expired ride to the next driver, skipping the one that
    /// failed to answer.
    async fn redispatch(&self, lapsed: &Outstanding) {
        let exclude = vec![lapsed.connection_id.clone()];
        if let Some((connection_id, driver_id)) = self.registry.pick_and_reserve(&exclude) {
            let offer = RideOffer::new(
                lapsed.ride_id.clone(),
                lapsed.request.origin.clone(),
                lapsed.request.destination.clone(),
                estimate_fare(&lapsed.request.origin, &lapsed.request.destination),
                self.offer_ttl,
            );
            let event = Event::RideIncoming(RideIncomingPayload {
                offer: offer.clone(),
            });
            if self.connections.send_event_to(&connection_id, &event).await {
                info!(
                    offer_id = %offer.offer_id,
                    ride_id = %lapsed.ride_id,
                    driver_id = %driver_id,
                    "expired offer reassigned"
                );
                let _ = self.outstanding.lock().insert(
                    offer.offer_id.clone(),
                    Outstanding {
                        connection_id,
                        driver_id,
                        ride_id: lapsed.ride_id.clone(),
                        requester: lapsed.requester.clone(),
                        request: lapsed.request.clone(),
                        expires_at: offer.expires_at,
                    },
                );
                return;
            }
            self.registry.on_disconnect(&connection_id);
        }
        let _ = self
            .connections
            .send_event_to(
                &lapsed.requester,
                &Event::RideNoDrivers(RideNoDriversPayload {
                    ride_id: lapsed.ride_id.clone(),
                }),
            )
            .await;
    }
}

/// Placeholder fare model: flat base plus a per-leg component derived from
/// the location strings. Real pricing is an external concern.
fn estimate_fare(origin: &str, destination: &str) -> f64 {
    let legs = (origin.len() + destination.len()) as f64;
    ((2.50 + legs * 0.05) * 10.0).round() / 10.0
}
