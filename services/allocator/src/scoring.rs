//! Distance and candidate scoring.
//!
//! Pure functions over a pool snapshot. Nothing here touches the cache
//! or performs I/O; callers pass in the pools they want ranked.

use std::cmp::Ordering;
use std::collections::BTreeSet;

use crpark_id::PoolId;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::pool::{GeoPoint, ResourcePool};

/// Mean earth radius used for great-circle distances.
pub const EARTH_RADIUS_KM: f64 = 6371.0;

/// Tolerance when checking that weights sum to one.
pub const WEIGHT_SUM_TOLERANCE: f64 = 1e-6;

/// Scoring configuration errors.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum ScoringError {
    #[error("score weights must sum to 1.0, got {0}")]
    WeightSum(f64),

    #[error("score weight {name} is negative or not finite: {value}")]
    InvalidWeight { name: &'static str, value: f64 },

    #[error("invalid scoring parameter {name}: {value}")]
    InvalidParameter { name: &'static str, value: f64 },
}

/// Great-circle distance between two points, in kilometres.
pub fn haversine_km(a: GeoPoint, b: GeoPoint) -> f64 {
    let d_lat = (b.lat - a.lat).to_radians();
    let d_lng = (b.lng - a.lng).to_radians();
    let lat1 = a.lat.to_radians();
    let lat2 = b.lat.to_radians();

    let h = (d_lat / 2.0).sin().powi(2) + lat1.cos() * lat2.cos() * (d_lng / 2.0).sin().powi(2);
    let c = 2.0 * h.sqrt().atan2((1.0 - h).sqrt());
    EARTH_RADIUS_KM * c
}

// =============================================================================
// Configuration
// =============================================================================

/// Weights of the five score components.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ScoreWeights {
    pub distance: f64,
    pub availability: f64,
    pub cost: f64,
    pub waiting: f64,
    pub competition: f64,
}

impl Default for ScoreWeights {
    fn default() -> Self {
        Self {
            distance: 0.25,
            availability: 0.30,
            cost: 0.20,
            waiting: 0.15,
            competition: 0.10,
        }
    }
}

impl ScoreWeights {
    /// Each weight is non-negative and together they sum to one.
    pub fn validate(&self) -> Result<(), ScoringError> {
        let named = [
            ("distance", self.distance),
            ("availability", self.availability),
            ("cost", self.cost),
            ("waiting", self.waiting),
            ("competition", self.competition),
        ];
        for (name, value) in named {
            if !value.is_finite() || value < 0.0 {
                return Err(ScoringError::InvalidWeight { name, value });
            }
        }

        let sum: f64 = named.iter().map(|(_, v)| v).sum();
        if (sum - 1.0).abs() > WEIGHT_SUM_TOLERANCE {
            return Err(ScoringError::WeightSum(sum));
        }
        Ok(())
    }
}

/// Tunable constants for a scoring pass.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScoringConfig {
    pub weights: ScoreWeights,

    /// Eligibility radius for the primary ranking, in km.
    pub primary_radius_km: f64,

    /// Eligibility radius for fallback ranking, in km.
    pub fallback_radius_km: f64,

    pub base_fare: f64,
    pub cost_per_km: f64,
    pub cost_slope: f64,
    /// Cost at which the cost component reaches zero.
    pub cost_cap: f64,

    pub wait_floor_min: f64,
    pub wait_slope_min: f64,
    /// Waiting time at which the waiting component reaches zero.
    pub wait_cap_min: f64,

    /// Price of a minute of waiting, used for the competition cost.
    pub wait_cost_per_min: f64,
}

impl Default for ScoringConfig {
    fn default() -> Self {
        Self {
            weights: ScoreWeights::default(),
            primary_radius_km: 5.0,
            fallback_radius_km: 6.0,
            base_fare: 40.0,
            cost_per_km: 10.0,
            cost_slope: 20.0,
            cost_cap: 200.0,
            wait_floor_min: 2.0,
            wait_slope_min: 8.0,
            wait_cap_min: 10.0,
            wait_cost_per_min: 3.0,
        }
    }
}

impl ScoringConfig {
    pub fn validate(&self) -> Result<(), ScoringError> {
        self.weights.validate()?;

        let positive = [
            ("primary_radius_km", self.primary_radius_km),
            ("fallback_radius_km", self.fallback_radius_km),
            ("cost_cap", self.cost_cap),
            ("wait_cap_min", self.wait_cap_min),
        ];
        for (name, value) in positive {
            if !value.is_finite() || value <= 0.0 {
                return Err(ScoringError::InvalidParameter { name, value });
            }
        }

        let non_negative = [
            ("base_fare", self.base_fare),
            ("cost_per_km", self.cost_per_km),
            ("cost_slope", self.cost_slope),
            ("wait_floor_min", self.wait_floor_min),
            ("wait_slope_min", self.wait_slope_min),
            ("wait_cost_per_min", self.wait_cost_per_min),
        ];
        for (name, value) in non_negative {
            if !value.is_finite() || value < 0.0 {
                return Err(ScoringError::InvalidParameter { name, value });
            }
        }
        Ok(())
    }
}

/// Which eligibility radius a ranking uses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RankingPass {
    #[default]
    Primary,
    Fallback,
}

impl RankingPass {
    pub fn radius_km(&self, cfg: &ScoringConfig) -> f64 {
        match self {
            Self::Primary => cfg.primary_radius_km,
            Self::Fallback => cfg.fallback_radius_km,
        }
    }
}

// =============================================================================
// Candidates
// =============================================================================

/// Where the requester is and where they are going.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct RankQuery {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub origin: Option<GeoPoint>,
    pub destination: GeoPoint,
}

/// A pool scored for one ranking pass.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Candidate {
    pub pool: ResourcePool,

    /// Pool to destination, in km.
    pub distance_km: f64,

    /// Origin to pool, in km, when the origin is known.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub approach_km: Option<f64>,

    pub distance_score: f64,
    pub availability: f64,
    pub cost: f64,
    pub waiting_time_min: f64,
    pub competition_penalty: f64,
    pub total: f64,

    /// Estimated chance the first commit is accepted.
    pub success_probability: f64,

    /// Cost if the slot has to be won in competition.
    pub competition_cost: f64,

    /// Cost weighted by the chance of winning it outright.
    pub expected_cost: f64,
}

/// Score one pool, or `None` if it is not eligible for the pass.
pub fn score_pool(
    pool: &ResourcePool,
    query: &RankQuery,
    pass: RankingPass,
    cfg: &ScoringConfig,
) -> Option<Candidate> {
    if pool.capacity == 0 || pool.available == 0 {
        return None;
    }

    let radius = pass.radius_km(cfg);
    let distance_km = haversine_km(pool.location, query.destination);
    if distance_km > radius {
        return None;
    }

    let utilization = pool.utilization();
    let availability = (1.0 - utilization).clamp(0.0, 1.0);
    let distance_score = (1.0 - distance_km / radius).max(0.0);
    let cost = cfg.base_fare + cfg.cost_per_km * distance_km + utilization * cfg.cost_slope;
    let waiting_time_min = cfg.wait_floor_min.max(utilization * cfg.wait_slope_min);
    let competition_penalty = 1.0 / pool.available as f64;

    let w = &cfg.weights;
    let total = w.distance * distance_score
        + w.availability * availability
        + w.cost * (1.0 - cost / cfg.cost_cap).max(0.0)
        + w.waiting * (1.0 - waiting_time_min / cfg.wait_cap_min).max(0.0)
        + w.competition * (1.0 - competition_penalty);

    let success_probability = pool.pa;
    let competition_cost = cost + waiting_time_min * cfg.wait_cost_per_min;
    let expected_cost =
        success_probability * cost + (1.0 - success_probability) * competition_cost;

    Some(Candidate {
        pool: pool.clone(),
        distance_km,
        approach_km: query.origin.map(|o| haversine_km(o, pool.location)),
        distance_score,
        availability,
        cost,
        waiting_time_min,
        competition_penalty,
        total,
        success_probability,
        competition_cost,
        expected_cost,
    })
}

/// Best candidate first: higher total, then shorter distance, then lower cost.
fn by_preference(a: &Candidate, b: &Candidate) -> Ordering {
    b.total
        .total_cmp(&a.total)
        .then_with(|| a.distance_km.total_cmp(&b.distance_km))
        .then_with(|| a.cost.total_cmp(&b.cost))
}

/// Score and sort every eligible pool not in `exclude`.
pub fn rank(
    pools: &[ResourcePool],
    query: &RankQuery,
    pass: RankingPass,
    exclude: &BTreeSet<PoolId>,
    cfg: &ScoringConfig,
) -> Vec<Candidate> {
    let mut candidates: Vec<Candidate> = pools
        .iter()
        .filter(|p| !exclude.contains(&p.id))
        .filter_map(|p| score_pool(p, query, pass, cfg))
        .collect();
    candidates.sort_by(by_preference);
    candidates
}
