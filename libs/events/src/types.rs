//! Feed event definitions.

use std::collections::BTreeMap;

use crpark_id::{PoolId, ReservationId};
use serde::{Deserialize, Serialize};

use crate::EventError;

// =============================================================================
// Event Type Constants
// =============================================================================

/// Wire names of the `type` discriminator.
pub mod event_types {
    pub const OCCUPANCY_UPDATE: &str = "occupancy_update";
    pub const RESERVATION_OUTCOME: &str = "reservation_outcome";
    pub const OPTIMIZATION_COMPLETE: &str = "optimization_complete";
}

/// Event classification used for routing and logging.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    OccupancyUpdate,
    ReservationOutcome,
    OptimizationComplete,
}

impl EventKind {
    /// Wire name of this kind.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::OccupancyUpdate => event_types::OCCUPANCY_UPDATE,
            Self::ReservationOutcome => event_types::RESERVATION_OUTCOME,
            Self::OptimizationComplete => event_types::OPTIMIZATION_COMPLETE,
        }
    }

    /// Classify a wire name.
    pub fn from_wire(s: &str) -> Option<Self> {
        match s {
            event_types::OCCUPANCY_UPDATE => Some(Self::OccupancyUpdate),
            event_types::RESERVATION_OUTCOME => Some(Self::ReservationOutcome),
            event_types::OPTIMIZATION_COMPLETE => Some(Self::OptimizationComplete),
            _ => None,
        }
    }
}

impl std::fmt::Display for EventKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

// =============================================================================
// Payloads
// =============================================================================

/// Authoritative occupancy counts for one pool.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OccupancyUpdate {
    pub pool_id: PoolId,
    pub occupied: u32,
    pub available: u32,
    /// Logical timestamp (monotonic per pool upstream).
    pub ts: i64,
}

/// Upstream verdict on a reservation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReservationOutcome {
    pub pool_id: PoolId,
    pub reservation_id: ReservationId,
    pub accepted: bool,
    pub ts: i64,
}

/// Acceptance parameters published by the optimiser for one pool.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PoolParameters {
    /// Acceptance affinity, in (0, 1].
    #[serde(alias = "pa_i")]
    pub pa: f64,

    /// Reserved ratio, in (0, 1].
    #[serde(alias = "rs_i")]
    pub rs: f64,
}

impl PoolParameters {
    /// Both values lie in (0, 1].
    pub fn is_valid(&self) -> bool {
        let in_range = |v: f64| v.is_finite() && v > 0.0 && v <= 1.0;
        in_range(self.pa) && in_range(self.rs)
    }
}

/// The optimiser finished a pass.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OptimizationComplete {
    pub ts: i64,

    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub parameters: BTreeMap<PoolId, PoolParameters>,
}

// =============================================================================
// Feed Event
// =============================================================================

/// One message from the event feed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum FeedEvent {
    OccupancyUpdate(OccupancyUpdate),
    ReservationOutcome(ReservationOutcome),
    OptimizationComplete(OptimizationComplete),
}

impl FeedEvent {
    /// Decode a single JSON document.
    ///
    /// Unknown `type` values are reported as [`EventError::UnknownEventType`]
    /// rather than a generic serialization failure so callers can skip them.
    pub fn from_json(s: &str) -> Result<Self, EventError> {
        let value: serde_json::Value = serde_json::from_str(s)?;

        let Some(kind) = value.get("type").and_then(|t| t.as_str()) else {
            return Err(EventError::InvalidPayload(
                "missing \"type\" discriminator".to_string(),
            ));
        };

        if EventKind::from_wire(kind).is_none() {
            return Err(EventError::UnknownEventType(kind.to_string()));
        }

        serde_json::from_value(value).map_err(|e| EventError::InvalidPayload(e.to_string()))
    }

    pub fn kind(&self) -> EventKind {
        match self {
            Self::OccupancyUpdate(_) => EventKind::OccupancyUpdate,
            Self::ReservationOutcome(_) => EventKind::ReservationOutcome,
            Self::OptimizationComplete(_) => EventKind::OptimizationComplete,
        }
    }

    /// Logical timestamp of the event.
    pub fn ts(&self) -> i64 {
        match self {
            Self::OccupancyUpdate(e) => e.ts,
            Self::ReservationOutcome(e) => e.ts,
            Self::OptimizationComplete(e) => e.ts,
        }
    }

    /// Pool the event is about, if it is pool-scoped.
    pub fn pool_id(&self) -> Option<&PoolId> {
        match self {
            Self::OccupancyUpdate(e) => Some(&e.pool_id),
            Self::ReservationOutcome(e) => Some(&e.pool_id),
            Self::OptimizationComplete(_) => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_occupancy_update_wire_format() {
        let event = FeedEvent::from_json(
            r#"{"type":"occupancy_update","poolId":"lot_001","occupied":12,"available":30,"ts":1700}"#,
        )
        .unwrap();

        assert_eq!(event.kind(), EventKind::OccupancyUpdate);
        assert_eq!(event.ts(), 1700);
        assert_eq!(event.pool_id().unwrap().as_str(), "lot_001");

        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["type"], "occupancy_update");
        assert_eq!(json["poolId"], "lot_001");
    }

    #[test]
    fn test_reservation_outcome_wire_format() {
        let event = FeedEvent::from_json(
            r#"{"type":"reservation_outcome","poolId":"lot_002","reservationId":"resv-1","accepted":false,"ts":5}"#,
        )
        .unwrap();

        let FeedEvent::ReservationOutcome(outcome) = event else {
            panic!("expected reservation_outcome");
        };
        assert_eq!(outcome.reservation_id.as_str(), "resv-1");
        assert!(!outcome.accepted);
    }

    #[test]
    fn test_optimization_complete_without_parameters() {
        let event = FeedEvent::from_json(r#"{"type":"optimization_complete","ts":9}"#).unwrap();
        assert!(event.pool_id().is_none());

        let FeedEvent::OptimizationComplete(done) = event else {
            panic!("expected optimization_complete");
        };
        assert!(done.parameters.is_empty());
    }

    #[test]
    fn test_optimization_complete_accepts_legacy_parameter_names() {
        let event = FeedEvent::from_json(
            r#"{"type":"optimization_complete","ts":10,"parameters":{"lot_001":{"pa_i":0.82,"rs_i":0.2}}}"#,
        )
        .unwrap();
        let FeedEvent::OptimizationComplete(done) = event else {
            panic!("expected optimization_complete");
        };
        let params = done.parameters[&PoolId::parse("lot_001").unwrap()];
        assert_eq!(params.pa, 0.82);
        assert!(params.is_valid());
    }

    #[test]
    fn test_unknown_event_type() {
        let err = FeedEvent::from_json(r#"{"type":"sensor_reading","ts":1}"#).unwrap_err();
        assert_eq!(err, EventError::UnknownEventType("sensor_reading".to_string()));
    }

    #[test]
    fn test_missing_discriminator() {
        let err = FeedEvent::from_json(r#"{"ts":1}"#).unwrap_err();
        assert!(matches!(err, EventError::InvalidPayload(_)));
    }

    #[test]
    fn test_invalid_pool_key_is_payload_error() {
        let err = FeedEvent::from_json(
            r#"{"type":"occupancy_update","poolId":"","occupied":1,"available":1,"ts":1}"#,
        )
        .unwrap_err();
        assert!(matches!(err, EventError::InvalidPayload(_)));
    }

    #[test]
    fn test_pool_parameters_range() {
        assert!(!PoolParameters { pa: 0.0, rs: 0.5 }.is_valid());
        assert!(!PoolParameters { pa: 1.2, rs: 0.5 }.is_valid());
        assert!(PoolParameters { pa: 1.0, rs: 0.1 }.is_valid());
    }
}
