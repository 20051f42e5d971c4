//! In-memory [`RideStore`] backend.
//!
//! Keeps the full ride table in a `parking_lot` map. Suitable for a single
//! server process; a database-backed store plugs in through the same trait.

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use tracing::debug;

use hail_core::ids::{RideId, RiderId};
use hail_core::protocol::RideState;

use crate::matcher::{RideStore, RideStoreError};

/// One persisted ride.
#[derive(Clone, Debug)]
pub struct RideRecord {
    /// The ride's identity.
    pub ride_id: RideId,
    /// The requesting rider.
    pub rider_id: RiderId,
    /// Pickup description.
    pub origin: String,
    /// Destination description.
    pub destination: String,
    /// Current lifecycle state.
    pub status: RideState,
    /// When the ride was created.
    pub created_at: DateTime<Utc>,
}

/// Process-local ride store.
#[derive(Default)]
pub struct MemoryRideStore {
    rides: Mutex<HashMap<RideId, RideRecord>>,
}

impl MemoryRideStore {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Fetch a ride by id.
    pub fn get(&self, ride_id: &RideId) -> Option<RideRecord> {
        self.rides.lock().get(ride_id).cloned()
    }

    /// Number of rides ever created.
    pub fn len(&self) -> usize {
        self.rides.lock().len()
    }

    /// Whether the store holds no rides.
    pub fn is_empty(&self) -> bool {
        self.rides.lock().is_empty()
    }
}

#[async_trait]
impl RideStore for MemoryRideStore {
    async fn create_ride(
        &self,
        origin: &str,
        destination: &str,
        rider_id: &RiderId,
    ) -> Result<RideId, RideStoreError> {
        let ride_id = RideId::new();
        let record = RideRecord {
            ride_id: ride_id.clone(),
            rider_id: rider_id.clone(),
            origin: origin.to_owned(),
            destination: destination.to_owned(),
            status: RideState::Pending,
            created_at: Utc::now(),
        };
        let _ = self.rides.lock().insert(ride_id.clone(), record);
        debug!(ride_id = %ride_id, "ride created");
        Ok(ride_id)
    }

    async fn update_ride_status(
        &self,
        ride_id: &RideId,
        status: RideState,
    ) -> Result<(), RideStoreError> {
        let mut rides = self.rides.lock();
        let Some(record) = rides.get_mut(ride_id) else {
            return Err(RideStoreError::Unavailable {
                message: format!("unknown ride {ride_id}"),
            });
        };
        record.status = status;
        Ok(())
    }
}
