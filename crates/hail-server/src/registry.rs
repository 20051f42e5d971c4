//! Driver availability registry.
//!
//! An explicitly constructed, injectable instance owned by the server's
//! composition root and passed by reference to the matcher — there is no
//! module-level global. All mutations and reads serialize through one
//! mutex, so a removed connection can never briefly reappear as available.
//!
//! Selection policy: **round-robin**. `pick_and_reserve` scans a rotation
//! queue front-to-back and moves the picked driver to the back, so repeated
//! picks cycle fairly through the pool instead of hammering whichever entry
//! a hash map yields first.

use std::collections::{HashMap, VecDeque};

use parking_lot::Mutex;
use tracing::debug;

use hail_core::ids::{ConnectionId, DriverId};
use hail_core::protocol::Location;

/// Dispatch-facing availability of a registered driver.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Availability {
    /// Eligible for dispatch.
    Available,
    /// Holds an outstanding offer; never picked again until released.
    Offered,
}

/// Registry entry mapping a connection to a driver.
#[derive(Clone, Debug)]
pub struct DriverRecord {
    /// The driver bound to this connection.
    pub driver_id: DriverId,
    /// Current dispatch eligibility.
    pub availability: Availability,
    /// Last reported position, if any.
    pub location: Option<Location>,
}

#[derive(Default)]
struct Inner {
    records: HashMap<ConnectionId, DriverRecord>,
    /// Round-robin rotation order. May hold stale IDs; they are skipped
    /// and dropped lazily during picks.
    order: VecDeque<ConnectionId>,
}

/// Server-side mapping of connections to driver availability state.
#[derive(Default)]
pub struct DriverRegistry {
    inner: Mutex<Inner>,
}

impl DriverRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Mark a driver available on the given connection. Idempotent upsert:
    /// re-registering updates the driver identity and location in place.
    ///
    /// A driver currently holding an outstanding offer stays `Offered`;
    /// the reservation is released only through [`release`](Self::release)
    /// or removal.
    pub fn register_available(
        &self,
        connection_id: &ConnectionId,
        driver_id: DriverId,
        location: Option<Location>,
    ) {
        let mut inner = self.inner.lock();
        match inner.records.get_mut(connection_id) {
            Some(record) => {
                record.driver_id = driver_id;
                record.location = location;
            }
            None => {
                let _ = inner.records.insert(
                    connection_id.clone(),
                    DriverRecord {
                        driver_id,
                        availability: Availability::Available,
                        location,
                    },
                );
                inner.order.push_back(connection_id.clone());
            }
        }
    }

    /// Remove the record for a connection. Idempotent; the rotation queue
    /// entry is cleaned up lazily.
    pub fn register_unavailable(&self, connection_id: &ConnectionId) {
        let mut inner = self.inner.lock();
        if inner.records.remove(connection_id).is_some() {
            debug!(conn_id = %connection_id, "driver unregistered");
        }
    }

    /// Connection closed: identical to [`register_unavailable`](Self::register_unavailable),
    /// kept as a distinct entry point for the session teardown path.
    pub fn on_disconnect(&self, connection_id: &ConnectionId) {
        self.register_unavailable(connection_id);
    }

    /// Pick one available driver and atomically reserve them for an offer.
    ///
    /// Returns `None` when no driver is available. Connections listed in
    /// `exclude` are skipped (dispatch fallback after a failed send). The
    /// reservation guarantees at most one outstanding offer per driver.
    pub fn pick_and_reserve(
        &self,
        exclude: &[ConnectionId],
    ) -> Option<(ConnectionId, DriverId)> {
        let mut inner = self.inner.lock();
        for _ in 0..inner.order.len() {
            let Some(candidate) = inner.order.pop_front() else {
                break;
            };
            let Some(record) = inner.records.get_mut(&candidate) else {
                // Stale queue entry for a removed connection; drop it.
                continue;
            };
            if record.availability == Availability::Available && !exclude.contains(&candidate) {
                record.availability = Availability::Offered;
                let driver_id = record.driver_id.clone();
                inner.order.push_back(candidate.clone());
                return Some((candidate, driver_id));
            }
            inner.order.push_back(candidate);
        }
        None
    }

    /// Return a reserved driver to the available pool. No-op if the
    /// connection is gone or was never reserved.
    pub fn release(&self, connection_id: &ConnectionId) {
        let mut inner = self.inner.lock();
        if let Some(record) = inner.records.get_mut(connection_id) {
            if record.availability == Availability::Offered {
                record.availability = Availability::Available;
            }
        }
    }

    /// Look up the record for a connection.
    pub fn get(&self, connection_id: &ConnectionId) -> Option<DriverRecord> {
        self.inner.lock().records.get(connection_id).cloned()
    }

    /// Number of registered drivers (any availability).
    pub fn len(&self) -> usize {
        self.inner.lock().records.len()
    }

    /// Whether no drivers are registered.
    pub fn is_empty(&self) -> bool {
        self.inner.lock().records.is_empty()
    }

    /// Number of drivers currently eligible for dispatch.
    pub fn available_count(&self) -> usize {
        self.inner
            .lock()
            .records
            .values()
            .filter(|r| r.availability == Availability::Available)
            .count()
    }
}
