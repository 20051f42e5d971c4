//! Incoming offer tracking: duplicate suppression, expiry, statistics.
//!
//! Drivers hold at most a handful of live offers at a time; the queue's
//! job is to keep that set clean. An offer is a duplicate when its id or
//! ride is already active, or when another offer for the same route
//! arrived within the dedup window. Terminal offers move to a bounded
//! history ring that feeds the response-time statistics.

use std::collections::{HashMap, VecDeque};

use chrono::{DateTime, Duration, Utc};
use parking_lot::Mutex;
use tracing::{debug, warn};

use hail_core::ids::OfferId;
use hail_core::offer::{OfferStatus, RideOffer};

/// Result of presenting an offer to the queue.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum AddOutcome {
    /// Tracked as a new active offer.
    Added,
    /// Suppressed: id, ride, or route already seen.
    Duplicate,
    /// Already past its expiry on arrival; not tracked.
    Expired,
    /// The active set is full.
    Refused,
}

/// An active offer with its arrival time.
#[derive(Clone, Debug)]
pub struct TrackedOffer {
    /// The offer as received.
    pub offer: RideOffer,
    /// When this queue first saw it.
    pub received_at: DateTime<Utc>,
}

/// A finished offer retained for statistics and history queries.
#[derive(Clone, Debug)]
pub struct CompletedOffer {
    /// The finished offer's id.
    pub offer_id: OfferId,
    /// Terminal status it ended in.
    pub status: OfferStatus,
    /// Milliseconds between arrival and the terminal transition.
    pub response_ms: i64,
}

/// Aggregate queue statistics.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct OfferStats {
    /// Offers currently awaiting a response.
    pub active: usize,
    /// Offers accepted over the retained history.
    pub accepted: usize,
    /// Offers rejected over the retained history.
    pub rejected: usize,
    /// Offers that lapsed unanswered over the retained history.
    pub expired: usize,
    /// Offers cancelled before an answer over the retained history.
    pub cancelled: usize,
    /// Offers suppressed as duplicates since creation.
    pub duplicates_suppressed: u64,
    /// Offers refused because the active set was full.
    pub refused: u64,
    /// Mean time to answer accepted offers, in milliseconds.
    pub mean_accept_ms: Option<f64>,
    /// Mean time to answer rejected offers, in milliseconds.
    pub mean_reject_ms: Option<f64>,
}

struct Inner {
    active: HashMap<OfferId, TrackedOffer>,
    history: VecDeque<CompletedOffer>,
    duplicates_suppressed: u64,
    refused: u64,
}

/// Thread-safe offer queue.
pub struct OfferQueue {
    dedup_window: Duration,
    active_capacity: usize,
    history_capacity: usize,
    inner: Mutex<Inner>,
}

impl OfferQueue {
    /// Queue with the given duplicate-suppression window, active-set
    /// capacity, and history depth.
    pub fn new(dedup_window_ms: i64, active_capacity: usize, history_capacity: usize) -> Self {
        Self {
            dedup_window: Duration::milliseconds(dedup_window_ms),
            active_capacity,
            history_capacity,
            inner: Mutex::new(Inner {
                active: HashMap::new(),
                history: VecDeque::new(),
                duplicates_suppressed: 0,
                refused: 0,
            }),
        }
    }

    /// Present an incoming offer at `now`.
    ///
    /// An offer already past its expiry still lands in history as
    /// `Expired` so the audit trail shows it arrived.
    pub fn add(&self, offer: RideOffer, now: DateTime<Utc>) -> AddOutcome {
        let mut inner = self.inner.lock();
        if offer.is_expired_at(now) {
            debug!(offer_id = %offer.offer_id, "offer dead on arrival");
            Self::push_history(
                &mut inner,
                self.history_capacity,
                CompletedOffer {
                    offer_id: offer.offer_id,
                    status: OfferStatus::Expired,
                    response_ms: 0,
                },
            );
            return AddOutcome::Expired;
        }

        let duplicate = inner.active.contains_key(&offer.offer_id)
            || inner.active.values().any(|tracked| {
                tracked.offer.ride_id == offer.ride_id
                    || (tracked.offer.pickup == offer.pickup
                        && tracked.offer.destination == offer.destination
                        && now - tracked.received_at <= self.dedup_window)
            });
        if duplicate {
            inner.duplicates_suppressed += 1;
            debug!(offer_id = %offer.offer_id, "duplicate offer suppressed");
            return AddOutcome::Duplicate;
        }
        if inner.active.len() >= self.active_capacity {
            inner.refused += 1;
            warn!(
                offer_id = %offer.offer_id,
                capacity = self.active_capacity,
                "offer refused, active set full"
            );
            return AddOutcome::Refused;
        }

        let _ = inner.active.insert(
            offer.offer_id.clone(),
            TrackedOffer {
                offer,
                received_at: now,
            },
        );
        AddOutcome::Added
    }

    /// Record the driver's answer to an active offer.
    ///
    /// Only `Accepted` and `Rejected` are valid answers; anything else, an
    /// unknown id, or a repeated answer returns `false` and changes
    /// nothing.
    pub fn respond(&self, offer_id: &OfferId, status: OfferStatus, now: DateTime<Utc>) -> bool {
        if !matches!(status, OfferStatus::Accepted | OfferStatus::Rejected) {
            return false;
        }
        let mut inner = self.inner.lock();
        let Some(mut tracked) = inner.active.remove(offer_id) else {
            return false;
        };
        if !tracked.offer.transition(status) {
            // Already terminal; put it back untouched.
            let _ = inner.active.insert(offer_id.clone(), tracked);
            return false;
        }
        let response_ms = (now - tracked.received_at).num_milliseconds();
        Self::push_history(
            &mut inner,
            self.history_capacity,
            CompletedOffer {
                offer_id: offer_id.clone(),
                status,
                response_ms,
            },
        );
        true
    }

    /// Move an active offer to terminal state for the given reason and
    /// record it in history. Idempotent; used when the server cancels a
    /// ride out from under the driver.
    ///
    /// `reason` must be terminal; `Pending` returns `false` and changes
    /// nothing.
    pub fn remove(&self, offer_id: &OfferId, reason: OfferStatus, now: DateTime<Utc>) -> bool {
        if !reason.is_terminal() {
            return false;
        }
        let mut inner = self.inner.lock();
        let Some(tracked) = inner.active.remove(offer_id) else {
            return false;
        };
        let response_ms = (now - tracked.received_at).num_milliseconds();
        Self::push_history(
            &mut inner,
            self.history_capacity,
            CompletedOffer {
                offer_id: offer_id.clone(),
                status: reason,
                response_ms,
            },
        );
        true
    }

    /// Move every offer past its expiry at `now` into history. Returns the
    /// expired ids.
    pub fn check_expired(&self, now: DateTime<Utc>) -> Vec<OfferId> {
        let mut inner = self.inner.lock();
        let expired: Vec<OfferId> = inner
            .active
            .iter()
            .filter(|(_, tracked)| tracked.offer.is_expired_at(now))
            .map(|(id, _)| id.clone())
            .collect();
        for id in &expired {
            if let Some(tracked) = inner.active.remove(id) {
                let response_ms = (now - tracked.received_at).num_milliseconds();
                Self::push_history(
                    &mut inner,
                    self.history_capacity,
                    CompletedOffer {
                        offer_id: id.clone(),
                        status: OfferStatus::Expired,
                        response_ms,
                    },
                );
            }
        }
        expired
    }

    /// Look up an active offer.
    pub fn get(&self, offer_id: &OfferId) -> Option<TrackedOffer> {
        self.inner.lock().active.get(offer_id).cloned()
    }

    /// Snapshot of every active offer, oldest arrival first.
    pub fn active_offers(&self) -> Vec<TrackedOffer> {
        let inner = self.inner.lock();
        let mut offers: Vec<TrackedOffer> = inner.active.values().cloned().collect();
        offers.sort_by_key(|tracked| tracked.received_at);
        offers
    }

    /// The most recent `limit` finished offers, newest first.
    pub fn history(&self, limit: usize) -> Vec<CompletedOffer> {
        let inner = self.inner.lock();
        inner.history.iter().rev().take(limit).cloned().collect()
    }

    /// Number of active offers.
    pub fn len(&self) -> usize {
        self.inner.lock().active.len()
    }

    /// Whether no offers are active.
    pub fn is_empty(&self) -> bool {
        self.inner.lock().active.is_empty()
    }

    /// Snapshot of the queue statistics.
    #[allow(clippy::cast_precision_loss)]
    pub fn stats(&self) -> OfferStats {
        let inner = self.inner.lock();
        let mut stats = OfferStats {
            active: inner.active.len(),
            duplicates_suppressed: inner.duplicates_suppressed,
            refused: inner.refused,
            ..OfferStats::default()
        };
        let mut accept_total = 0i64;
        let mut reject_total = 0i64;
        for done in &inner.history {
            match done.status {
                OfferStatus::Accepted => {
                    stats.accepted += 1;
                    accept_total += done.response_ms;
                }
                OfferStatus::Rejected => {
                    stats.rejected += 1;
                    reject_total += done.response_ms;
                }
                OfferStatus::Expired => stats.expired += 1,
                OfferStatus::Cancelled => stats.cancelled += 1,
                OfferStatus::Pending => {}
            }
        }
        if stats.accepted > 0 {
            stats.mean_accept_ms = Some(accept_total as f64 / stats.accepted as f64);
        }
        if stats.rejected > 0 {
            stats.mean_reject_ms = Some(reject_total as f64 / stats.rejected as f64);
        }
        stats
    }

    fn push_history(inner: &mut Inner, capacity: usize, done: CompletedOffer) {
        if inner.history.len() >= capacity {
            let _ = inner.history.pop_front();
        }
        inner.history.push_back(done);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use hail_core::ids::RideId;

    fn offer(ride: &str, pickup: &str, ttl_secs: i64) -> RideOffer {
        RideOffer::new(
            RideId::from(ride),
            pickup.into(),
            "99 Oak Ave".into(),
            12.5,
            Duration::seconds(ttl_secs),
        )
    }

    fn queue() -> OfferQueue {
        OfferQueue::new(5000, 8, 16)
    }

    #[test]
    fn adds_fresh_offer() {
        let q = queue();
        let o = offer("ride-1", "1 Main St", 30);
        assert_eq!(q.add(o.clone(), Utc::now()), AddOutcome::Added);
        assert_eq!(q.len(), 1);
        assert!(q.get(&o.offer_id).is_some());
    }

    #[test]
    fn same_offer_id_is_duplicate() {
        let q = queue();
        let o = offer("ride-1", "1 Main St", 30);
        let now = Utc::now();
        assert_eq!(q.add(o.clone(), now), AddOutcome::Added);
        assert_eq!(q.add(o, now), AddOutcome::Duplicate);
        assert_eq!(q.len(), 1);
        assert_eq!(q.stats().duplicates_suppressed, 1);
    }

    #[test]
    fn same_ride_different_offer_is_duplicate() {
        let q = queue();
        let now = Utc::now();
        assert_eq!(q.add(offer("ride-1", "1 Main St", 30), now), AddOutcome::Added);
        // Redispatched offer for the same ride while the first is active.
        assert_eq!(
            q.add(offer("ride-1", "1 Main St", 30), now),
            AddOutcome::Duplicate
        );
    }

    #[test]
    fn same_route_within_window_is_duplicate() {
        let q = queue();
        let now = Utc::now();
        assert_eq!(q.add(offer("ride-1", "1 Main St", 30), now), AddOutcome::Added);
        let outcome = q.add(
            offer("ride-2", "1 Main St", 30),
            now + Duration::milliseconds(3000),
        );
        assert_eq!(outcome, AddOutcome::Duplicate);
    }

    #[test]
    fn same_route_outside_window_is_not_duplicate() {
        let q = OfferQueue::new(5000, 8, 16);
        let now = Utc::now();
        assert_eq!(q.add(offer("ride-1", "1 Main St", 60), now), AddOutcome::Added);
        let outcome = q.add(
            offer("ride-2", "1 Main St", 60),
            now + Duration::milliseconds(6000),
        );
        assert_eq!(outcome, AddOutcome::Added);
        assert_eq!(q.len(), 2);
    }

    #[test]
    fn expired_on_arrival_lands_in_history() {
        let q = queue();
        let o = offer("ride-1", "1 Main St", 0);
        let outcome = q.add(o.clone(), Utc::now() + Duration::seconds(1));
        assert_eq!(outcome, AddOutcome::Expired);
        assert!(q.is_empty());

        // Not silently dropped: the arrival leaves an audit record.
        let history = q.history(10);
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].offer_id, o.offer_id);
        assert_eq!(history[0].status, OfferStatus::Expired);
        assert_eq!(q.stats().expired, 1);
    }

    #[test]
    fn respond_accept_moves_to_history() {
        let q = queue();
        let o = offer("ride-1", "1 Main St", 30);
        let now = Utc::now();
        let _ = q.add(o.clone(), now);

        assert!(q.respond(&o.offer_id, OfferStatus::Accepted, now + Duration::milliseconds(800)));
        assert!(q.is_empty());

        let stats = q.stats();
        assert_eq!(stats.accepted, 1);
        assert_eq!(stats.mean_accept_ms, Some(800.0));
    }

    #[test]
    fn respond_twice_is_refused() {
        let q = queue();
        let o = offer("ride-1", "1 Main St", 30);
        let now = Utc::now();
        let _ = q.add(o.clone(), now);

        assert!(q.respond(&o.offer_id, OfferStatus::Rejected, now));
        assert!(!q.respond(&o.offer_id, OfferStatus::Accepted, now));
        assert_eq!(q.stats().rejected, 1);
        assert_eq!(q.stats().accepted, 0);
    }

    #[test]
    fn respond_with_non_answer_status_is_refused() {
        let q = queue();
        let o = offer("ride-1", "1 Main St", 30);
        let now = Utc::now();
        let _ = q.add(o.clone(), now);

        assert!(!q.respond(&o.offer_id, OfferStatus::Expired, now));
        assert!(!q.respond(&o.offer_id, OfferStatus::Pending, now));
        assert_eq!(q.len(), 1, "offer still active");
    }

    #[test]
    fn respond_unknown_offer_is_refused() {
        let q = queue();
        assert!(!q.respond(&OfferId::new(), OfferStatus::Accepted, Utc::now()));
    }

    #[test]
    fn remove_is_idempotent() {
        let q = queue();
        let o = offer("ride-1", "1 Main St", 30);
        let now = Utc::now();
        let _ = q.add(o.clone(), now);

        assert!(q.remove(&o.offer_id, OfferStatus::Cancelled, now));
        assert!(!q.remove(&o.offer_id, OfferStatus::Cancelled, now));
        assert!(q.is_empty());
    }

    #[test]
    fn remove_records_cancellation_in_history() {
        let q = queue();
        let o = offer("ride-1", "1 Main St", 30);
        let now = Utc::now();
        let _ = q.add(o.clone(), now);

        assert!(q.remove(&o.offer_id, OfferStatus::Cancelled, now + Duration::milliseconds(500)));

        let history = q.history(10);
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].offer_id, o.offer_id);
        assert_eq!(history[0].status, OfferStatus::Cancelled);
        assert_eq!(history[0].response_ms, 500);
        assert_eq!(q.stats().cancelled, 1);
    }

    #[test]
    fn remove_refuses_non_terminal_reason() {
        let q = queue();
        let o = offer("ride-1", "1 Main St", 30);
        let now = Utc::now();
        let _ = q.add(o.clone(), now);

        assert!(!q.remove(&o.offer_id, OfferStatus::Pending, now));
        assert_eq!(q.len(), 1, "offer still active");
    }

    #[test]
    fn full_active_set_refuses_new_offers() {
        let q = OfferQueue::new(100, 2, 16);
        let now = Utc::now();
        // Spread arrivals past the dedup window so capacity is what trips.
        assert_eq!(q.add(offer("ride-1", "1 Main St", 60), now), AddOutcome::Added);
        assert_eq!(
            q.add(offer("ride-2", "2 Oak St", 60), now + Duration::seconds(1)),
            AddOutcome::Added
        );
        assert_eq!(
            q.add(offer("ride-3", "3 Elm St", 60), now + Duration::seconds(2)),
            AddOutcome::Refused
        );
        assert_eq!(q.len(), 2);
        assert_eq!(q.stats().refused, 1);
    }

    #[test]
    fn active_offers_sorted_by_arrival() {
        let q = queue();
        let now = Utc::now();
        let late = offer("ride-2", "7 Elm St", 60);
        let early = offer("ride-1", "1 Main St", 60);
        let _ = q.add(early.clone(), now);
        let _ = q.add(late.clone(), now + Duration::seconds(1));

        let active = q.active_offers();
        assert_eq!(active.len(), 2);
        assert_eq!(active[0].offer.offer_id, early.offer_id);
        assert_eq!(active[1].offer.offer_id, late.offer_id);
    }

    #[test]
    fn history_returns_newest_first() {
        let q = queue();
        let now = Utc::now();
        let first = offer("ride-1", "1 Main St", 60);
        let second = offer("ride-2", "7 Elm St", 60);
        let _ = q.add(first.clone(), now);
        let _ = q.add(second.clone(), now);
        assert!(q.respond(&first.offer_id, OfferStatus::Accepted, now));
        assert!(q.respond(&second.offer_id, OfferStatus::Rejected, now));

        let history = q.history(10);
        assert_eq!(history.len(), 2);
        assert_eq!(history[0].offer_id, second.offer_id);
        assert_eq!(history[1].offer_id, first.offer_id);
        assert_eq!(q.history(1).len(), 1);
    }

    #[test]
    fn check_expired_sweeps_lapsed_offers() {
        let q = queue();
        let now = Utc::now();
        let short = offer("ride-1", "1 Main St", 5);
        let long = offer("ride-2", "7 Elm St", 120);
        let _ = q.add(short.clone(), now);
        let _ = q.add(long.clone(), now);

        let expired = q.check_expired(now + Duration::seconds(10));
        assert_eq!(expired, vec![short.offer_id.clone()]);
        assert_eq!(q.len(), 1);
        assert!(q.get(&long.offer_id).is_some());
        assert_eq!(q.stats().expired, 1);
    }

    #[test]
    fn history_is_bounded() {
        let q = OfferQueue::new(5000, 8, 2);
        let now = Utc::now();
        for i in 0..4 {
            let o = offer(&format!("ride-{i}"), &format!("{i} Main St"), 60);
            // Spread arrivals beyond the dedup window.
            let at = now + Duration::seconds(i * 10);
            assert_eq!(q.add(o.clone(), at), AddOutcome::Added);
            assert!(q.respond(&o.offer_id, OfferStatus::Accepted, at + Duration::seconds(1)));
        }
        let stats = q.stats();
        assert_eq!(stats.accepted, 2, "history capped at capacity");
    }

    #[test]
    fn stats_mix_of_outcomes() {
        let q = queue();
        let now = Utc::now();
        let a = offer("ride-a", "1 A St", 60);
        let b = offer("ride-b", "2 B St", 60);
        let c = offer("ride-c", "3 C St", 5);
        let _ = q.add(a.clone(), now);
        let _ = q.add(b.clone(), now);
        let _ = q.add(c.clone(), now);

        assert!(q.respond(&a.offer_id, OfferStatus::Accepted, now + Duration::milliseconds(400)));
        assert!(q.respond(&b.offer_id, OfferStatus::Rejected, now + Duration::milliseconds(1200)));
        let _ = q.check_expired(now + Duration::seconds(6));

        let stats = q.stats();
        assert_eq!(stats.active, 0);
        assert_eq!(stats.accepted, 1);
        assert_eq!(stats.rejected, 1);
        assert_eq!(stats.expired, 1);
        assert_eq!(stats.mean_accept_ms, Some(400.0));
        assert_eq!(stats.mean_reject_ms, Some(1200.0));
    }
}
