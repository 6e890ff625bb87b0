//! Local planar projection and great-circle distances.
//!
//! The projection is equirectangular around an origin: metres per degree are
//! evaluated once at the origin latitude and held for the whole frame. That is
//! accurate to well under a metre for the ~200 km extents tasks and tracks span.

use serde::{Deserialize, Serialize};

/// Mean Earth radius for the spherical distance model, metres.
pub const EARTH_RADIUS_M: f64 = 6_371_000.0;

#[derive(Clone, Copy, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct GeoPoint {
    pub lat: f64,
    pub lon: f64,
}

impl GeoPoint {
    pub fn new(lat: f64, lon: f64) -> Self {
        Self { lat, lon }
    }

    pub fn is_finite(&self) -> bool {
        self.lat.is_finite() && self.lon.is_finite()
    }
}

/// Planar frame anchored at `origin`, x east and y north, in metres.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct LocalFrame {
    origin: GeoPoint,
    kx: f64,
    ky: f64,
}

impl LocalFrame {
    pub fn new(origin: GeoPoint) -> Self {
        let lat = origin.lat.to_radians();
        let ky = 111_132.954 - 559.822 * (2.0 * lat).cos();
        let kx = 111_132.954 * lat.cos();
        Self { origin, kx, ky }
    }

    pub fn origin(&self) -> GeoPoint {
        self.origin
    }

    /// Metres per degree of longitude at the origin.
    pub fn kx(&self) -> f64 {
        self.kx
    }

    /// Metres per degree of latitude at the origin.
    pub fn ky(&self) -> f64 {
        self.ky
    }

    pub fn to_local(&self, p: GeoPoint) -> (f64, f64) {
        let x = (p.lon - self.origin.lon) * self.kx;
        let y = (p.lat - self.origin.lat) * self.ky;
        (x, y)
    }

    pub fn from_local(&self, x: f64, y: f64) -> GeoPoint {
        GeoPoint {
            lat: self.origin.lat + y / self.ky,
            lon: self.origin.lon + x / self.kx,
        }
    }
}

/// Project `p` into the frame anchored at `origin`.
pub fn to_local(origin: GeoPoint, p: GeoPoint) -> (f64, f64) {
    LocalFrame::new(origin).to_local(p)
}

/// Inverse of [`to_local`].
pub fn from_local(origin: GeoPoint, x: f64, y: f64) -> GeoPoint {
    LocalFrame::new(origin).from_local(x, y)
}

/// Great-circle distance in metres (haversine on a spherical Earth).
pub fn haversine_distance(a: GeoPoint, b: GeoPoint) -> f64 {
    let dlat = (b.lat - a.lat).to_radians();
    let dlon = (b.lon - a.lon).to_radians();
    let h = (dlat / 2.0).sin().powi(2)
        + a.lat.to_radians().cos() * b.lat.to_radians().cos() * (dlon / 2.0).sin().powi(2);
    let c = 2.0 * h.sqrt().atan2((1.0 - h).sqrt());
    EARTH_RADIUS_M * c
}

/// Sum of great-circle legs along `points`.
pub fn polyline_distance(points: &[GeoPoint]) -> f64 {
    points
        .windows(2)
        .map(|w| haversine_distance(w[0], w[1]))
        .sum()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_haversine_distance() {
        let dist = haversine_distance(GeoPoint::new(0.0, 0.0), GeoPoint::new(0.0, 1.0));
        assert!((dist - 111_195.0).abs() < 200.0);
    }

    #[test]
    fn test_haversine_same_point() {
        let p = GeoPoint::new(46.0, 8.0);
        assert_eq!(haversine_distance(p, p), 0.0);
    }

    #[test]
    fn test_degree_lengths_at_equator() {
        let frame = LocalFrame::new(GeoPoint::new(0.0, 0.0));
        assert!((frame.ky() - 110_573.132).abs() < 1e-6);
        assert!((frame.kx() - 111_132.954).abs() < 1e-6);
    }

    #[test]
    fn test_origin_maps_to_zero() {
        let origin = GeoPoint::new(46.0, 8.0);
        let (x, y) = to_local(origin, origin);
        assert_eq!((x, y), (0.0, 0.0));
    }

    #[test]
    fn test_local_axes_point_east_and_north() {
        let origin = GeoPoint::new(46.0, 8.0);
        let (x, y) = to_local(origin, GeoPoint::new(46.01, 8.0));
        assert!(x.abs() < 1e-9);
        assert!(y > 1_000.0);
        let (x, y) = to_local(origin, GeoPoint::new(46.0, 8.01));
        assert!(x > 700.0);
        assert!(y.abs() < 1e-9);
    }

    #[test]
    fn test_round_trip_within_100km() {
        let origin = GeoPoint::new(46.0, 8.0);
        let frame = LocalFrame::new(origin);
        // Sub-millimetre is about 1e-8 degrees.
        for &(dlat, dlon) in &[
            (0.0, 0.0),
            (0.9, 0.0),
            (-0.9, 0.0),
            (0.0, 1.2),
            (0.0, -1.2),
            (0.63, -0.87),
            (-0.41, 0.99),
        ] {
            let p = GeoPoint::new(origin.lat + dlat, origin.lon + dlon);
            let (x, y) = frame.to_local(p);
            let back = frame.from_local(x, y);
            assert!((back.lat - p.lat).abs() < 1e-8, "lat {} vs {}", back.lat, p.lat);
            assert!((back.lon - p.lon).abs() < 1e-8, "lon {} vs {}", back.lon, p.lon);
        }
    }

    #[test]
    fn test_planar_matches_great_circle_for_short_ranges() {
        let origin = GeoPoint::new(46.0, 8.0);
        let p = GeoPoint::new(46.05, 8.05);
        let (x, y) = to_local(origin, p);
        let planar = (x * x + y * y).sqrt();
        let sphere = haversine_distance(origin, p);
        assert!((planar - sphere).abs() / sphere < 0.005);
    }

    #[test]
    fn test_nan_propagates() {
        let origin = GeoPoint::new(46.0, 8.0);
        let (x, y) = to_local(origin, GeoPoint::new(f64::NAN, 8.0));
        assert!(x.is_finite());
        assert!(y.is_nan());
    }

    #[test]
    fn test_polyline_distance_sums_legs() {
        let a = GeoPoint::new(0.0, 0.0);
        let b = GeoPoint::new(0.0, 1.0);
        let c = GeoPoint::new(0.0, 2.0);
        let total = polyline_distance(&[a, b, c]);
        assert!((total - 2.0 * haversine_distance(a, b)).abs() < 1e-6);
        assert_eq!(polyline_distance(&[a]), 0.0);
    }
}
