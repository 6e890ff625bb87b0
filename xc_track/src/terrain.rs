//! Ground elevation lookups consumed by the metrics engine.

use std::collections::HashMap;

use ordered_float::OrderedFloat;
use serde::{Deserialize, Serialize};

use crate::XcError;

/// Ground elevation in metres at a coordinate, or `None` when unknown.
pub trait Terrain {
    fn elevation(&self, lat: f64, lon: f64) -> Option<f64>;
}

impl<F> Terrain for F
where
    F: Fn(f64, f64) -> Option<f64>,
{
    fn elevation(&self, lat: f64, lon: f64) -> Option<f64> {
        self(lat, lon)
    }
}

/// Terrain that never knows the ground.
#[derive(Clone, Copy, Debug, Default)]
pub struct NoTerrain;

impl Terrain for NoTerrain {
    fn elevation(&self, _lat: f64, _lon: f64) -> Option<f64> {
        None
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct TerrainSample {
    pub lat: f64,
    pub lon: f64,
    pub elevation_m: f64,
}

/// Sparse elevation samples snapped to a regular degree grid.
///
/// Lookups resolve to the nearest grid node; nodes without a sample are unknown.
#[derive(Clone, Debug)]
pub struct SampledTerrain {
    step_deg: f64,
    nodes: HashMap<(OrderedFloat<f64>, OrderedFloat<f64>), f64>,
}

impl SampledTerrain {
    pub fn new(step_deg: f64) -> Result<Self, XcError> {
        if !(step_deg.is_finite() && step_deg > 0.0) {
            return Err(XcError::InvalidParameter(format!(
                "terrain grid step must be > 0, got {step_deg}"
            )));
        }
        Ok(Self {
            step_deg,
            nodes: HashMap::new(),
        })
    }

    pub fn from_samples(step_deg: f64, samples: &[TerrainSample]) -> Result<Self, XcError> {
        let mut terrain = Self::new(step_deg)?;
        for s in samples {
            terrain.insert(s.lat, s.lon, s.elevation_m)?;
        }
        Ok(terrain)
    }

    /// Later samples overwrite earlier ones on the same node.
    pub fn insert(&mut self, lat: f64, lon: f64, elevation_m: f64) -> Result<(), XcError> {
        if !(lat.is_finite() && lon.is_finite() && elevation_m.is_finite()) {
            return Err(XcError::NonFinite("terrain sample".into()));
        }
        let key = self.node(lat, lon);
        self.nodes.insert(key, elevation_m);
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    fn node(&self, lat: f64, lon: f64) -> (OrderedFloat<f64>, OrderedFloat<f64>) {
        (
            OrderedFloat((lat / self.step_deg).round()),
            OrderedFloat((lon / self.step_deg).round()),
        )
    }
}

impl Terrain for SampledTerrain {
    fn elevation(&self, lat: f64, lon: f64) -> Option<f64> {
        if !(lat.is_finite() && lon.is_finite()) {
            return None;
        }
        self.nodes.get(&self.node(lat, lon)).copied()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_closure_terrain() {
        let flat = |_lat: f64, _lon: f64| Some(420.0);
        assert_eq!(flat.elevation(46.0, 8.0), Some(420.0));
        assert_eq!(NoTerrain.elevation(46.0, 8.0), None);
    }

    #[test]
    fn test_sampled_terrain_nearest_node() {
        let samples = [
            TerrainSample {
                lat: 46.0,
                lon: 8.0,
                elevation_m: 500.0,
            },
            TerrainSample {
                lat: 46.01,
                lon: 8.0,
                elevation_m: 650.0,
            },
        ];
        let terrain = SampledTerrain::from_samples(0.01, &samples).unwrap();
        assert_eq!(terrain.len(), 2);
        assert_eq!(terrain.elevation(46.001, 8.002), Some(500.0));
        assert_eq!(terrain.elevation(46.0089, 7.999), Some(650.0));
        assert_eq!(terrain.elevation(46.05, 8.0), None);
        assert_eq!(terrain.elevation(f64::NAN, 8.0), None);
    }

    #[test]
    fn test_sampled_terrain_rejects_bad_input() {
        assert!(SampledTerrain::new(0.0).is_err());
        let mut terrain = SampledTerrain::new(0.01).unwrap();
        assert!(terrain.insert(46.0, 8.0, f64::NAN).is_err());
        assert!(terrain.is_empty());
    }
}
