use chrono::{DateTime, Utc};
use ndarray::Array1;
use serde::{Deserialize, Serialize};

use crate::geo::GeoPoint;
use crate::XcError;

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Fix {
    /// Milliseconds since the Unix epoch.
    pub timestamp_ms: i64,
    pub lat: f64,
    pub lon: f64,
    #[serde(default)]
    pub gps_altitude: Option<f64>,
    #[serde(default)]
    pub baro_altitude: Option<f64>,
}

impl Fix {
    pub fn new(timestamp_ms: i64, lat: f64, lon: f64) -> Self {
        Self {
            timestamp_ms,
            lat,
            lon,
            gps_altitude: None,
            baro_altitude: None,
        }
    }

    pub fn with_gps_altitude(mut self, alt: f64) -> Self {
        self.gps_altitude = Some(alt);
        self
    }

    pub fn with_baro_altitude(mut self, alt: f64) -> Self {
        self.baro_altitude = Some(alt);
        self
    }

    /// GPS altitude, else barometric, else zero.
    pub fn effective_altitude(&self) -> f64 {
        self.gps_altitude.or(self.baro_altitude).unwrap_or(0.0)
    }

    pub fn position(&self) -> GeoPoint {
        GeoPoint::new(self.lat, self.lon)
    }

    pub fn time(&self) -> Option<DateTime<Utc>> {
        DateTime::from_timestamp_millis(self.timestamp_ms)
    }
}

/// A non-empty, time-ascending fix sequence with cached lookup columns.
#[derive(Clone, Debug)]
pub struct Track {
    fixes: Vec<Fix>,
    times_ms: Array1<i64>,
    altitude_m: Array1<f64>,
}

impl Track {
    /// Sorts by timestamp (stable, so equal stamps keep input order).
    pub fn new(mut fixes: Vec<Fix>) -> Result<Self, XcError> {
        if fixes.is_empty() {
            return Err(XcError::InsufficientData);
        }
        for (idx, fix) in fixes.iter().enumerate() {
            let alt_ok = fix.gps_altitude.map_or(true, f64::is_finite)
                && fix.baro_altitude.map_or(true, f64::is_finite);
            if !fix.position().is_finite() || !alt_ok {
                return Err(XcError::NonFinite(format!("fix #{idx}")));
            }
        }
        fixes.sort_by_key(|f| f.timestamp_ms);

        let times_ms = fixes.iter().map(|f| f.timestamp_ms).collect::<Array1<i64>>();
        let altitude_m = fixes
            .iter()
            .map(Fix::effective_altitude)
            .collect::<Array1<f64>>();
        Ok(Self {
            fixes,
            times_ms,
            altitude_m,
        })
    }

    pub fn fixes(&self) -> &[Fix] {
        &self.fixes
    }

    pub fn len(&self) -> usize {
        self.fixes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.fixes.is_empty()
    }

    pub fn fix(&self, idx: usize) -> Option<&Fix> {
        self.fixes.get(idx)
    }

    pub fn effective_altitude(&self, idx: usize) -> Option<f64> {
        self.altitude_m.get(idx).copied()
    }

    /// Effective altitude per fix, aligned with [`Track::fixes`].
    pub fn altitudes(&self) -> &Array1<f64> {
        &self.altitude_m
    }

    /// Fix timestamps in ascending order.
    pub fn times_ms(&self) -> &Array1<i64> {
        &self.times_ms
    }

    pub fn start_ms(&self) -> i64 {
        self.times_ms[0]
    }

    pub fn end_ms(&self) -> i64 {
        self.times_ms[self.times_ms.len() - 1]
    }

    pub fn duration_ms(&self) -> i64 {
        self.end_ms() - self.start_ms()
    }

    /// Latest fix with `timestamp <= t_ms`, or `None` before the track starts.
    pub fn index_at_or_before(&self, t_ms: i64) -> Option<usize> {
        self.index_at_or_before_within(self.len(), t_ms)
    }

    /// Same as [`Track::index_at_or_before`], restricted to the first `limit` fixes.
    pub fn index_at_or_before_within(&self, limit: usize, t_ms: i64) -> Option<usize> {
        let mut lo = 0usize;
        let mut hi = limit.min(self.times_ms.len());
        while lo < hi {
            let mid = lo + (hi - lo) / 2;
            if self.times_ms[mid] <= t_ms {
                lo = mid + 1;
            } else {
                hi = mid;
            }
        }
        lo.checked_sub(1)
    }
}
