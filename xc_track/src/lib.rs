//! Core task-distance and flight-metrics library for cross-country track replay.
//!
//! Two pure computations live here: the shortest path through an ordered
//! sequence of turnpoint cylinders, and windowed speed/vario/AGL lookups over a
//! recorded track. Neither holds state between calls.

use serde::{Deserialize, Serialize};
use thiserror::Error;

pub mod geo;
pub mod metrics;
pub mod task;
pub mod terrain;
pub mod track;

pub use geo::{from_local, haversine_distance, to_local, GeoPoint, LocalFrame};
pub use metrics::{sample_at, sample_series, series_ticks, MetricsSample};
pub use task::{
    optimize_turnpoints, OptimizedPath, OptimizerDiagnostics, PathCache, PathPoint, Task,
    TurnpointConstraint, TurnpointRole,
};
pub use terrain::{NoTerrain, SampledTerrain, Terrain, TerrainSample};
pub use track::{Fix, Track};

#[derive(Error, Debug, Clone, PartialEq)]
pub enum XcError {
    #[error("insufficient data for computation")]
    InsufficientData,
    #[error("invalid parameter: {0}")]
    InvalidParameter(String),
    #[error("non-finite value encountered in {0}")]
    NonFinite(String),
    #[error("serialization failed: {0}")]
    Serialization(String),
}

/// Tuning for the taut-string relaxation.
///
/// None of these are load-bearing for correctness; realistic tasks settle in
/// 20 to 50 passes and stop early once no point moves more than
/// `shift_epsilon_m` in a pass.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct OptimizerParams {
    pub max_passes: usize,
    pub shift_epsilon_m: f64,
    /// Neighbours at or within this distance are treated as coincident; 0 still
    /// skips exactly coincident pairs.
    pub coincide_epsilon_m: f64,
}

impl Default for OptimizerParams {
    fn default() -> Self {
        Self {
            max_passes: 100,
            shift_epsilon_m: 0.01,
            coincide_epsilon_m: 1e-6,
        }
    }
}

impl OptimizerParams {
    pub fn validate(&self) -> Result<(), XcError> {
        if self.max_passes == 0 {
            return Err(XcError::InvalidParameter("max_passes must be > 0".into()));
        }
        if !(self.shift_epsilon_m.is_finite() && self.shift_epsilon_m >= 0.0) {
            return Err(XcError::InvalidParameter(format!(
                "shift_epsilon_m must be finite and >= 0, got {}",
                self.shift_epsilon_m
            )));
        }
        if !(self.coincide_epsilon_m.is_finite() && self.coincide_epsilon_m >= 0.0) {
            return Err(XcError::InvalidParameter(format!(
                "coincide_epsilon_m must be finite and >= 0, got {}",
                self.coincide_epsilon_m
            )));
        }
        Ok(())
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MetricsParams {
    /// Trailing smoothing window for speed and vario, seconds.
    pub window_s: f64,
}

impl Default for MetricsParams {
    fn default() -> Self {
        Self { window_s: 15.0 }
    }
}

impl MetricsParams {
    pub fn validate(&self) -> Result<(), XcError> {
        if !(self.window_s.is_finite() && self.window_s >= 0.0) {
            return Err(XcError::InvalidParameter(format!(
                "window_s must be finite and >= 0, got {}",
                self.window_s
            )));
        }
        Ok(())
    }

    pub(crate) fn window_ms(&self) -> i64 {
        (self.window_s * 1000.0).round() as i64
    }
}

/// Combined parameter file, as loaded by front ends.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Params {
    pub optimizer: OptimizerParams,
    pub metrics: MetricsParams,
}
