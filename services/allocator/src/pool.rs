//! Resource pools (parking lots) and their live occupancy.

use std::path::Path;

use crpark_id::PoolId;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Acceptance affinity assumed when a pool has never been optimised.
pub const DEFAULT_ACCEPTANCE_AFFINITY: f64 = 0.7;

/// Reserved ratio assumed when a pool has never been optimised.
pub const DEFAULT_RESERVED_RATIO: f64 = 0.5;

/// Errors building or loading pools.
#[derive(Debug, Error)]
pub enum PoolError {
    #[error("pool {pool_id}: occupied {occupied} + reserved {reserved} exceeds capacity {capacity}")]
    OverCapacity {
        pool_id: PoolId,
        capacity: u32,
        occupied: u32,
        reserved: u32,
    },

    #[error("pool {pool_id}: {message}")]
    Invalid { pool_id: PoolId, message: String },

    #[error("failed to read pool seed: {0}")]
    Io(#[from] std::io::Error),

    #[error("invalid pool seed JSON: {0}")]
    Json(#[from] serde_json::Error),
}

/// A point on the earth's surface, in decimal degrees.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct GeoPoint {
    pub lat: f64,
    pub lng: f64,
}

impl GeoPoint {
    pub const fn new(lat: f64, lng: f64) -> Self {
        Self { lat, lng }
    }

    /// Finite and inside the latitude/longitude ranges.
    pub fn is_valid(&self) -> bool {
        self.lat.is_finite()
            && self.lng.is_finite()
            && (-90.0..=90.0).contains(&self.lat)
            && (-180.0..=180.0).contains(&self.lng)
    }
}

/// A group of interchangeable reservable units.
///
/// `occupied + reserved <= capacity` always holds and `available` is
/// derived from the other three counts.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResourcePool {
    pub id: PoolId,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,

    pub location: GeoPoint,
    pub capacity: u32,
    pub occupied: u32,
    pub reserved: u32,
    pub available: u32,

    /// Historical likelihood of honouring a reservation attempt, in (0, 1].
    pub pa: f64,

    /// Reserved ratio, in (0, 1].
    pub rs: f64,
}

impl ResourcePool {
    /// An empty pool with default acceptance parameters.
    pub fn new(id: PoolId, location: GeoPoint, capacity: u32) -> Self {
        Self {
            id,
            name: None,
            location,
            capacity,
            occupied: 0,
            reserved: 0,
            available: capacity,
            pa: DEFAULT_ACCEPTANCE_AFFINITY,
            rs: DEFAULT_RESERVED_RATIO,
        }
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    /// Set occupied and reserved counts, rejecting over-capacity values.
    pub fn with_counts(mut self, occupied: u32, reserved: u32) -> Result<Self, PoolError> {
        self.set_counts(occupied, reserved)?;
        Ok(self)
    }

    pub fn with_parameters(mut self, pa: f64, rs: f64) -> Result<Self, PoolError> {
        if !unit_interval(pa) || !unit_interval(rs) {
            return Err(PoolError::Invalid {
                pool_id: self.id.clone(),
                message: format!("pa {pa} / rs {rs} outside (0, 1]"),
            });
        }
        self.pa = pa;
        self.rs = rs;
        Ok(self)
    }

    pub(crate) fn set_counts(&mut self, occupied: u32, reserved: u32) -> Result<(), PoolError> {
        let used = occupied as u64 + reserved as u64;
        if used > self.capacity as u64 {
            return Err(PoolError::OverCapacity {
                pool_id: self.id.clone(),
                capacity: self.capacity,
                occupied,
                reserved,
            });
        }
        self.occupied = occupied;
        self.reserved = reserved;
        self.available = self.capacity - occupied - reserved;
        Ok(())
    }

    /// Fraction of capacity that is occupied or reserved.
    pub fn utilization(&self) -> f64 {
        if self.capacity == 0 {
            return 1.0;
        }
        (self.occupied + self.reserved) as f64 / self.capacity as f64
    }
}

pub(crate) fn unit_interval(v: f64) -> bool {
    v.is_finite() && v > 0.0 && v <= 1.0
}

/// One row of a pool seed file.
#[derive(Debug, Deserialize)]
struct PoolSeed {
    #[serde(alias = "lot_id")]
    id: PoolId,
    #[serde(default)]
    name: Option<String>,
    location: GeoPoint,
    #[serde(alias = "total_slots")]
    capacity: u32,
    #[serde(default, alias = "occupied_slots")]
    occupied: u32,
    #[serde(default, alias = "reserved_slots")]
    reserved: u32,
    #[serde(default, alias = "pa_i")]
    pa: Option<f64>,
    #[serde(default, alias = "rs_i")]
    rs: Option<f64>,
}

impl TryFrom<PoolSeed> for ResourcePool {
    type Error = PoolError;

    fn try_from(seed: PoolSeed) -> Result<Self, Self::Error> {
        if !seed.location.is_valid() {
            return Err(PoolError::Invalid {
                pool_id: seed.id,
                message: "location out of range".to_string(),
            });
        }

        let mut pool = ResourcePool::new(seed.id, seed.location, seed.capacity)
            .with_counts(seed.occupied, seed.reserved)?
            .with_parameters(
                seed.pa.unwrap_or(DEFAULT_ACCEPTANCE_AFFINITY),
                seed.rs.unwrap_or(DEFAULT_RESERVED_RATIO),
            )?;
        pool.name = seed.name;
        Ok(pool)
    }
}

/// Parse a JSON array of pools.
pub fn parse_seed(json: &str) -> Result<Vec<ResourcePool>, PoolError> {
    let seeds: Vec<PoolSeed> = serde_json::from_str(json)?;
    seeds.into_iter().map(ResourcePool::try_from).collect()
}

/// Load a JSON array of pools from disk.
pub fn load_seed<P: AsRef<Path>>(path: P) -> Result<Vec<ResourcePool>, PoolError> {
    let raw = std::fs::read_to_string(path)?;
    parse_seed(&raw)
}
