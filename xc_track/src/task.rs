//! Shortest path through an ordered sequence of turnpoint cylinders.
//!
//! The path is solved by iterative relaxation in a local plane anchored at the
//! first turnpoint. Each pass visits the points in order and moves each one
//! according to its role:
//!
//! * `Start` seeks its boundary toward the following point (exit).
//! * `End` seeks its boundary toward the preceding point (entry).
//! * `Intermediate` takes the closest point of the neighbour chord to its
//!   centre when that chord cuts the disk, otherwise the boundary point facing
//!   the chord.
//!
//! Endpoint roles are always boundary-seeking, even when the adjacent leg would
//! already cross the cylinder. An endpoint disk that contains its neighbour
//! therefore exits past it, and the result can be longer than the centre route;
//! such solves report `monotone == false` in their diagnostics. The reported
//! distance is measured on the sphere; the plane only drives the relaxation.

use std::collections::HashMap;
use std::fmt::Write as _;

use nalgebra::Vector2;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::{debug, warn};

use crate::geo::{haversine_distance, GeoPoint, LocalFrame};
use crate::{OptimizerParams, XcError};

/// Per-pass planar growth tolerated before a solve is flagged non-monotone.
pub const LENGTH_INCREASE_TOLERANCE_M: f64 = 0.1;

/// Latitudes beyond this are not on the globe.
const MAX_LAT_DEG: f64 = 90.0;
const MAX_LON_DEG: f64 = 180.0;
/// Cylinders wider than this fall outside the local-plane accuracy domain.
pub const MAX_RADIUS_M: f64 = 1_000_000.0;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TurnpointRole {
    Start,
    Intermediate,
    End,
}

impl TurnpointRole {
    pub fn as_str(&self) -> &'static str {
        match self {
            TurnpointRole::Start => "start",
            TurnpointRole::Intermediate => "intermediate",
            TurnpointRole::End => "end",
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct TurnpointConstraint {
    pub center: GeoPoint,
    #[serde(default)]
    pub altitude: Option<f64>,
    pub radius_m: f64,
    pub role: TurnpointRole,
}

impl TurnpointConstraint {
    pub fn new(
        center: GeoPoint,
        altitude: Option<f64>,
        radius_m: f64,
        role: TurnpointRole,
    ) -> Result<Self, XcError> {
        let tp = Self {
            center,
            altitude,
            radius_m,
            role,
        };
        tp.validate()?;
        Ok(tp)
    }

    fn validate(&self) -> Result<(), XcError> {
        if !self.center.is_finite() || !self.radius_m.is_finite() {
            return Err(XcError::NonFinite(format!(
                "turnpoint ({}, {}) r={}",
                self.center.lat, self.center.lon, self.radius_m
            )));
        }
        if self.altitude.is_some_and(|a| !a.is_finite()) {
            return Err(XcError::NonFinite("turnpoint altitude".into()));
        }
        if self.center.lat.abs() > MAX_LAT_DEG || self.center.lon.abs() > MAX_LON_DEG {
            return Err(XcError::InvalidParameter(format!(
                "turnpoint ({}, {}) is outside lat [-90, 90] / lon [-180, 180]",
                self.center.lat, self.center.lon
            )));
        }
        if !(0.0..=MAX_RADIUS_M).contains(&self.radius_m) {
            return Err(XcError::InvalidParameter(format!(
                "turnpoint radius must be within [0, {MAX_RADIUS_M}] m, got {}",
                self.radius_m
            )));
        }
        Ok(())
    }
}

/// An ordered, immutable turnpoint sequence.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Task {
    #[serde(default)]
    name: Option<String>,
    turnpoints: Vec<TurnpointConstraint>,
}

impl Task {
    pub fn new(
        name: Option<String>,
        turnpoints: Vec<TurnpointConstraint>,
    ) -> Result<Self, XcError> {
        let task = Self { name, turnpoints };
        task.validate()?;
        Ok(task)
    }

    /// Checks every turnpoint; deserialized tasks bypass [`Task::new`].
    pub fn validate(&self) -> Result<(), XcError> {
        self.turnpoints.iter().try_for_each(TurnpointConstraint::validate)
    }

    pub fn name(&self) -> Option<&str> {
        self.name.as_deref()
    }

    pub fn turnpoints(&self) -> &[TurnpointConstraint] {
        &self.turnpoints
    }

    pub fn len(&self) -> usize {
        self.turnpoints.len()
    }

    pub fn is_empty(&self) -> bool {
        self.turnpoints.is_empty()
    }

    /// Great-circle length of the centre-to-centre route.
    pub fn center_distance_m(&self) -> f64 {
        self.turnpoints
            .windows(2)
            .map(|w| haversine_distance(w[0].center, w[1].center))
            .sum()
    }

    pub fn optimize(&self, params: &OptimizerParams) -> Result<Option<OptimizedPath>, XcError> {
        optimize_turnpoints(&self.turnpoints, params)
    }

    /// SHA-256 over the canonical JSON form; stable for identical content.
    pub fn content_hash(&self) -> Result<String, XcError> {
        let bytes =
            serde_json::to_vec(self).map_err(|e| XcError::Serialization(e.to_string()))?;
        Ok(sha256_hex(&bytes))
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct PathPoint {
    pub lat: f64,
    pub lon: f64,
    pub altitude: f64,
}

impl PathPoint {
    pub fn geo(&self) -> GeoPoint {
        GeoPoint::new(self.lat, self.lon)
    }
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct OptimizerDiagnostics {
    pub passes: usize,
    pub converged: bool,
    /// Largest single-point movement in the last pass, metres.
    pub final_shift_m: f64,
    /// Planar length before the first pass and after each pass.
    pub planar_length_history: Vec<f64>,
    /// No pass lengthened the path by more than [`LENGTH_INCREASE_TOLERANCE_M`].
    pub monotone: bool,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct OptimizedPath {
    /// One solved touch point per turnpoint, in task order.
    pub points: Vec<PathPoint>,
    pub total_distance_m: f64,
    pub leg_distances_m: Vec<f64>,
    pub diagnostics: OptimizerDiagnostics,
}

/// Solve the shortest path touching each turnpoint in order.
///
/// Returns `Ok(None)` when no path is computable: fewer than two turnpoints, or
/// a sequence that does not open with a `Start` and close with an `End`.
/// A non-finite coordinate anywhere aborts with [`XcError::NonFinite`].
pub fn optimize_turnpoints(
    turnpoints: &[TurnpointConstraint],
    params: &OptimizerParams,
) -> Result<Option<OptimizedPath>, XcError> {
    params.validate()?;
    if turnpoints.len() < 2 {
        debug!(count = turnpoints.len(), "too few turnpoints to optimize");
        return Ok(None);
    }
    for tp in turnpoints {
        tp.validate()?;
    }
    let first_role = turnpoints[0].role;
    let last_role = turnpoints[turnpoints.len() - 1].role;
    if first_role != TurnpointRole::Start || last_role != TurnpointRole::End {
        debug!(
            first = first_role.as_str(),
            last = last_role.as_str(),
            "task must open with a start and close with an end"
        );
        return Ok(None);
    }

    let frame = LocalFrame::new(turnpoints[0].center);
    let centers: Vec<Vector2<f64>> = turnpoints
        .iter()
        .map(|tp| {
            let (x, y) = frame.to_local(tp.center);
            Vector2::new(x, y)
        })
        .collect();
    ensure_finite(&centers, "projected turnpoint centres")?;

    let (points, diagnostics) = relax(turnpoints, &centers, params)?;

    let solved: Vec<PathPoint> = points
        .iter()
        .zip(turnpoints)
        .map(|(p, tp)| {
            let geo = frame.from_local(p.x, p.y);
            PathPoint {
                lat: geo.lat,
                lon: geo.lon,
                altitude: tp.altitude.unwrap_or(0.0),
            }
        })
        .collect();
    if solved.iter().any(|p| !p.lat.is_finite() || !p.lon.is_finite()) {
        warn!("optimized path left the finite domain during unprojection");
        return Err(XcError::NonFinite("unprojected path".into()));
    }

    let leg_distances_m: Vec<f64> = solved
        .windows(2)
        .map(|w| haversine_distance(w[0].geo(), w[1].geo()))
        .collect();
    let total_distance_m: f64 = leg_distances_m.iter().sum();
    if !total_distance_m.is_finite() {
        return Err(XcError::NonFinite("path length".into()));
    }

    debug!(
        turnpoints = turnpoints.len(),
        passes = diagnostics.passes,
        converged = diagnostics.converged,
        total_m = total_distance_m,
        "task optimized"
    );

    Ok(Some(OptimizedPath {
        points: solved,
        total_distance_m,
        leg_distances_m,
        diagnostics,
    }))
}

/// Runs passes from the centres until the shift settles or the pass budget ends.
fn relax(
    turnpoints: &[TurnpointConstraint],
    centers: &[Vector2<f64>],
    params: &OptimizerParams,
) -> Result<(Vec<Vector2<f64>>, OptimizerDiagnostics), XcError> {
    let mut points = centers.to_vec();
    let mut length = planar_length(&points);
    let mut diagnostics = OptimizerDiagnostics {
        planar_length_history: vec![length],
        monotone: true,
        ..OptimizerDiagnostics::default()
    };

    for _ in 0..params.max_passes {
        let shift = relax_pass(turnpoints, centers, &mut points, params.coincide_epsilon_m);
        ensure_finite(&points, "relaxation pass")?;
        diagnostics.passes += 1;
        diagnostics.final_shift_m = shift;

        let next = planar_length(&points);
        if next > length + LENGTH_INCREASE_TOLERANCE_M {
            if diagnostics.monotone {
                warn!(
                    pass = diagnostics.passes,
                    before_m = length,
                    after_m = next,
                    "relaxation pass lengthened the path"
                );
            }
            diagnostics.monotone = false;
        }
        length = next;
        diagnostics.planar_length_history.push(length);

        if shift < params.shift_epsilon_m {
            diagnostics.converged = true;
            break;
        }
    }
    Ok((points, diagnostics))
}

/// One Gauss-Seidel sweep; returns the largest movement of any point.
fn relax_pass(
    turnpoints: &[TurnpointConstraint],
    centers: &[Vector2<f64>],
    points: &mut [Vector2<f64>],
    coincide_eps: f64,
) -> f64 {
    let n = points.len();
    let mut max_shift = 0.0_f64;
    for i in 0..n {
        let center = centers[i];
        let radius = turnpoints[i].radius_m;
        let updated = match turnpoints[i].role {
            TurnpointRole::Start => points
                .get(i + 1)
                .and_then(|&next| boundary_toward(center, radius, next, coincide_eps)),
            TurnpointRole::End => i
                .checked_sub(1)
                .and_then(|prev| boundary_toward(center, radius, points[prev], coincide_eps)),
            TurnpointRole::Intermediate => {
                if i == 0 || i + 1 >= n {
                    None
                } else {
                    chord_or_boundary(center, radius, points[i - 1], points[i + 1], coincide_eps)
                }
            }
        };
        if let Some(p) = updated {
            max_shift = max_shift.max((p - points[i]).norm());
            points[i] = p;
        }
    }
    max_shift
}

/// Point on the circle closest to `target`. `None` when the direction is undefined.
fn boundary_toward(
    center: Vector2<f64>,
    radius: f64,
    target: Vector2<f64>,
    coincide_eps: f64,
) -> Option<Vector2<f64>> {
    if radius <= 0.0 {
        return Some(center);
    }
    let dir = target - center;
    let len = dir.norm();
    if len <= coincide_eps {
        return None;
    }
    Some(center + dir * (radius / len))
}

fn chord_or_boundary(
    center: Vector2<f64>,
    radius: f64,
    a: Vector2<f64>,
    b: Vector2<f64>,
    coincide_eps: f64,
) -> Option<Vector2<f64>> {
    let ab = b - a;
    let len = ab.norm();
    if len <= coincide_eps {
        return None;
    }
    let t = ((center - a).dot(&ab) / (len * len)).clamp(0.0, 1.0);
    let q = a + ab * t;
    let offset = q - center;
    let dist = offset.norm();
    if dist <= radius {
        Some(q)
    } else {
        Some(center + offset * (radius / dist))
    }
}

fn planar_length(points: &[Vector2<f64>]) -> f64 {
    points.windows(2).map(|w| (w[1] - w[0]).norm()).sum()
}

fn ensure_finite(points: &[Vector2<f64>], stage: &str) -> Result<(), XcError> {
    if points.iter().all(|p| p.x.is_finite() && p.y.is_finite()) {
        Ok(())
    } else {
        warn!(stage, "non-finite coordinate, aborting optimization");
        Err(XcError::NonFinite(stage.to_string()))
    }
}

/// Memo of solved paths keyed by task content and optimizer parameters.
#[derive(Debug, Default)]
pub struct PathCache {
    entries: HashMap<String, Option<OptimizedPath>>,
}

impl PathCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }

    /// Failed computations are not cached.
    pub fn get_or_optimize(
        &mut self,
        task: &Task,
        params: &OptimizerParams,
    ) -> Result<Option<&OptimizedPath>, XcError> {
        let key = cache_key(task, params)?;
        if !self.entries.contains_key(&key) {
            let solved = task.optimize(params)?;
            self.entries.insert(key.clone(), solved);
        }
        Ok(self.entries.get(&key).and_then(|p| p.as_ref()))
    }
}

fn cache_key(task: &Task, params: &OptimizerParams) -> Result<String, XcError> {
    let bytes = serde_json::to_vec(&(task, params))
        .map_err(|e| XcError::Serialization(e.to_string()))?;
    Ok(sha256_hex(&bytes))
}

fn sha256_hex(bytes: &[u8]) -> String {
    let digest = Sha256::digest(bytes);
    let mut out = String::with_capacity(digest.len() * 2);
    for b in digest {
        let _ = write!(&mut out, "{:02x}", b);
    }
    out
}
