//! Wire-format events for the dispatch channel protocol.
//!
//! Every frame exchanged between a client and the dispatch server is one
//! [`Event`], serialized as `{"event": "<name>", "data": {...}}`. The event
//! names are fixed for interoperability with existing clients and servers;
//! the enum is the single authoritative dispatch path — there is no
//! stringly-typed emitter layer on top of it.

use serde::{Deserialize, Serialize};

use crate::ids::{ConnectionId, DriverId, OfferId, RideId, RiderId};
use crate::offer::RideOffer;

/// A protocol event, externally tagged by its wire name.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", content = "data")]
pub enum Event {
    /// Connection-establishment handshake. Must be the first frame a client
    /// sends; carries the opaque credential.
    #[serde(rename = "connect")]
    Connect(ConnectPayload),
    /// Server confirmation that the handshake credential was accepted and
    /// the connection is registered.
    #[serde(rename = "connect:ack")]
    ConnectAck(ConnectAckPayload),
    /// Connection teardown, server- or client-initiated.
    #[serde(rename = "disconnect")]
    Disconnect(DisconnectPayload),
    /// Client liveness signal.
    #[serde(rename = "heartbeat")]
    Heartbeat(HeartbeatPayload),
    /// Server acknowledgment of a heartbeat, echoing its sequence number.
    #[serde(rename = "heartbeat:ack")]
    HeartbeatAck(HeartbeatPayload),
    /// Driver announces availability for dispatch.
    #[serde(rename = "driver:available")]
    DriverAvailable(DriverAvailablePayload),
    /// Driver withdraws from dispatch.
    #[serde(rename = "driver:unavailable")]
    DriverUnavailable(DriverUnavailablePayload),
    /// Rider requests a ride.
    #[serde(rename = "ride:request")]
    RideRequest(RideRequestPayload),
    /// Server offers a ride to exactly one driver.
    #[serde(rename = "ride:incoming")]
    RideIncoming(RideIncomingPayload),
    /// Server confirms a driver assignment to the requester.
    #[serde(rename = "ride:assigned")]
    RideAssigned(RideAssignedPayload),
    /// Server reports that no driver is currently available.
    #[serde(rename = "ride:noDrivers")]
    RideNoDrivers(RideNoDriversPayload),
    /// Driver accepts an offer.
    #[serde(rename = "ride:accept")]
    RideAccept(RideResponsePayload),
    /// Driver rejects an offer.
    #[serde(rename = "ride:reject")]
    RideReject(RideResponsePayload),
    /// Ride state change notification.
    #[serde(rename = "ride:status")]
    RideStatus(RideStatusPayload),
}

impl Event {
    /// The wire name of this event (the `event` tag value).
    #[must_use]
    pub fn name(&self) -> &'static str {
        match self {
            Self::Connect(_) => "connect",
            Self::ConnectAck(_) => "connect:ack",
            Self::Disconnect(_) => "disconnect",
            Self::Heartbeat(_) => "heartbeat",
            Self::HeartbeatAck(_) => "heartbeat:ack",
            Self::DriverAvailable(_) => "driver:available",
            Self::DriverUnavailable(_) => "driver:unavailable",
            Self::RideRequest(_) => "ride:request",
            Self::RideIncoming(_) => "ride:incoming",
            Self::RideAssigned(_) => "ride:assigned",
            Self::RideNoDrivers(_) => "ride:noDrivers",
            Self::RideAccept(_) => "ride:accept",
            Self::RideReject(_) => "ride:reject",
            Self::RideStatus(_) => "ride:status",
        }
    }
}

/// Why a connection was closed.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum DisconnectReason {
    /// Credential missing or rejected during the handshake.
    AuthFailed,
    /// No heartbeat observed within the liveness window.
    HeartbeatTimeout,
    /// Server refused the connection at capacity.
    ServerFull,
    /// Server is shutting down.
    ServerShutdown,
    /// Client requested the close.
    ClientRequest,
}

/// Payload of `connect`.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectPayload {
    /// Opaque credential validated before the connection is registered.
    pub auth_token: String,
}

/// Payload of `connect:ack`.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectAckPayload {
    /// Server-assigned identity of this channel.
    pub connection_id: ConnectionId,
}

/// Payload of `disconnect`.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DisconnectPayload {
    /// Why the connection is being closed.
    pub reason: DisconnectReason,
}

/// Payload of `heartbeat` and `heartbeat:ack`.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HeartbeatPayload {
    /// Monotonic sequence number; the ack echoes it back.
    pub seq: u64,
}

/// A geographic point.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Location {
    /// Latitude in degrees.
    pub lat: f64,
    /// Longitude in degrees.
    pub lng: f64,
}

/// Payload of `driver:available`.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DriverAvailablePayload {
    /// The driver going on duty.
    pub driver_id: DriverId,
    /// Current position, if known.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub location: Option<Location>,
}

/// Payload of `driver:unavailable`.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DriverUnavailablePayload {
    /// The driver going off duty.
    pub driver_id: DriverId,
}

/// Payload of `ride:request`.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RideRequestPayload {
    /// Pickup location description.
    pub origin: String,
    /// Destination description.
    pub destination: String,
    /// The requesting rider.
    pub rider_id: RiderId,
}

/// Payload of `ride:incoming`.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RideIncomingPayload {
    /// The full dispatch proposal.
    pub offer: RideOffer,
}

/// Payload of `ride:assigned`.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RideAssignedPayload {
    /// The ride being assigned.
    pub ride_id: RideId,
    /// The driver who accepted it.
    pub driver_id: DriverId,
}

/// Payload of `ride:noDrivers`.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RideNoDriversPayload {
    /// The ride request that could not be dispatched.
    pub ride_id: RideId,
}

/// Payload of `ride:accept` and `ride:reject`.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RideResponsePayload {
    /// The ride the response refers to.
    pub ride_id: RideId,
    /// The offer being answered.
    pub offer_id: OfferId,
    /// The responding driver.
    pub responder_id: DriverId,
}

/// Ride lifecycle states carried by `ride:status`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum RideState {
    /// Persisted, awaiting a driver.
    Pending,
    /// A driver accepted.
    Assigned,
    /// Pickup happened, ride underway.
    InProgress,
    /// Ride finished.
    Completed,
    /// Ride cancelled.
    Cancelled,
}

/// Payload of `ride:status`.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RideStatusPayload {
    /// The ride whose state changed.
    pub ride_id: RideId,
    /// The new state.
    pub status: RideState,
}
