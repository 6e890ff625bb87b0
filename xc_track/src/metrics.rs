//! Instantaneous ground speed, vario and AGL over a recorded track.
//!
//! Every query runs its own binary searches against the immutable [`Track`],
//! so results depend only on the track, the instant and the parameters.

use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::geo::haversine_distance;
use crate::terrain::Terrain;
use crate::track::Track;
use crate::{MetricsParams, XcError};

const MS_TO_KMH: f64 = 3.6;

/// Metrics at one instant; each field is independently unavailable.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct MetricsSample {
    pub timestamp_ms: i64,
    /// Index of the fix in effect at `timestamp_ms`.
    pub fix_index: Option<usize>,
    pub altitude_m: Option<f64>,
    pub speed_kmh: Option<f64>,
    pub vertical_speed_ms: Option<f64>,
    pub agl_m: Option<f64>,
}

impl MetricsSample {
    fn unavailable(timestamp_ms: i64) -> Self {
        Self {
            timestamp_ms,
            ..Self::default()
        }
    }

    fn ensure_finite(&self) -> Result<(), XcError> {
        let fields = [
            ("altitude", self.altitude_m),
            ("speed", self.speed_kmh),
            ("vertical speed", self.vertical_speed_ms),
            ("agl", self.agl_m),
        ];
        for (name, value) in fields {
            if value.is_some_and(|v| !v.is_finite()) {
                warn!(t = self.timestamp_ms, field = name, "non-finite metric");
                return Err(XcError::NonFinite(format!("{name} at t={}", self.timestamp_ms)));
            }
        }
        Ok(())
    }
}

/// Metrics at instant `t_ms` using a trailing window of `params.window_s`.
pub fn sample_at<T>(
    track: &Track,
    t_ms: i64,
    params: &MetricsParams,
    terrain: &T,
) -> Result<MetricsSample, XcError>
where
    T: Terrain + ?Sized,
{
    params.validate()?;
    let Some(i) = track.index_at_or_before(t_ms) else {
        return Ok(MetricsSample::unavailable(t_ms));
    };
    let fix = &track.fixes()[i];
    let times = track.times_ms();
    let altitudes = track.altitudes();
    let altitude = altitudes[i];

    let mut sample = MetricsSample {
        timestamp_ms: t_ms,
        fix_index: Some(i),
        altitude_m: Some(altitude),
        ..MetricsSample::default()
    };

    let window_start = t_ms.saturating_sub(params.window_ms());
    if let Some(j) = track.index_at_or_before_within(i + 1, window_start) {
        let from = &track.fixes()[j];
        let dt = (times[i] - times[j]) as f64 / 1000.0;
        if dt > 0.0 {
            let dist = haversine_distance(from.position(), fix.position());
            sample.speed_kmh = Some(dist / dt * MS_TO_KMH);
            sample.vertical_speed_ms = Some((altitude - altitudes[j]) / dt);
        }
    }

    sample.agl_m = terrain
        .elevation(fix.lat, fix.lon)
        .map(|ground| altitude - ground);

    sample.ensure_finite()?;
    Ok(sample)
}

/// Playback instants every `step_ms` from `start_ms` through `end_ms` inclusive.
///
/// Empty when `end_ms < start_ms`. A span that does not fit in `i64` is rejected
/// rather than wrapped.
pub fn series_ticks(start_ms: i64, end_ms: i64, step_ms: i64) -> Result<Vec<i64>, XcError> {
    if step_ms <= 0 {
        return Err(XcError::InvalidParameter(format!(
            "series step must be > 0 ms, got {step_ms}"
        )));
    }
    if end_ms < start_ms {
        return Ok(Vec::new());
    }
    let span = end_ms.checked_sub(start_ms).ok_or_else(|| {
        XcError::InvalidParameter(format!("series span {start_ms}..={end_ms} overflows"))
    })?;
    (0..=span / step_ms)
        .map(|k| {
            k.checked_mul(step_ms)
                .and_then(|offset| start_ms.checked_add(offset))
                .ok_or_else(|| XcError::InvalidParameter(format!("series tick #{k} overflows")))
        })
        .collect()
}

/// Samples every tick of [`series_ticks`].
pub fn sample_series<T>(
    track: &Track,
    start_ms: i64,
    end_ms: i64,
    step_ms: i64,
    params: &MetricsParams,
    terrain: &T,
) -> Result<Vec<MetricsSample>, XcError>
where
    T: Terrain + ?Sized,
{
    series_ticks(start_ms, end_ms, step_ms)?
        .into_iter()
        .map(|t| sample_at(track, t, params, terrain))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::terrain::NoTerrain;
    use crate::track::Fix;

    /// 1 Hz eastbound track at 46N climbing 2 m/s from 1000 m.
    fn climbing_track(seconds: i64) -> Track {
        let fixes = (0..=seconds)
            .map(|s| {
                Fix::new(s * 1000, 46.0, 8.0 + s as f64 * 0.0002)
                    .with_gps_altitude(1000.0 + 2.0 * s as f64)
            })
            .collect();
        Track::new(fixes).unwrap()
    }

    fn ground(_lat: f64, _lon: f64) -> Option<f64> {
        Some(400.0)
    }

    #[test]
    fn test_speed_and_vario_over_window() {
        let track = climbing_track(60);
        let sample = sample_at(&track, 30_000, &MetricsParams::default(), &ground).unwrap();
        assert_eq!(sample.fix_index, Some(30));
        let vario = sample.vertical_speed_ms.unwrap();
        assert!((vario - 2.0).abs() < 1e-9);
        let leg = haversine_distance(
            track.fixes()[15].position(),
            track.fixes()[30].position(),
        );
        let expected = leg / 15.0 * 3.6;
        assert!((sample.speed_kmh.unwrap() - expected).abs() < 1e-9);
        // ~0.0002 deg/s of longitude at 46N is ~55 km/h.
        assert!(sample.speed_kmh.unwrap() > 50.0 && sample.speed_kmh.unwrap() < 60.0);
    }

    #[test]
    fn test_exact_fix_time_has_no_drift() {
        let track = climbing_track(20);
        let zero = |_lat: f64, _lon: f64| Some(0.0);
        let sample = sample_at(&track, 17_000, &MetricsParams::default(), &zero).unwrap();
        assert_eq!(sample.altitude_m, Some(1034.0));
        assert_eq!(sample.agl_m, Some(1034.0));
    }

    #[test]
    fn test_agl_uses_terrain() {
        let track = climbing_track(20);
        let sample = sample_at(&track, 10_000, &MetricsParams::default(), &ground).unwrap();
        assert_eq!(sample.agl_m, Some(1020.0 - 400.0));
    }

    #[test]
    fn test_unknown_terrain_leaves_agl_unavailable() {
        let track = climbing_track(20);
        let sample = sample_at(&track, 10_000, &MetricsParams::default(), &NoTerrain).unwrap();
        assert_eq!(sample.agl_m, None);
        assert_eq!(sample.altitude_m, Some(1020.0));
    }

    #[test]
    fn test_before_track_start_is_unavailable() {
        let track = climbing_track(20);
        let sample = sample_at(&track, -1, &MetricsParams::default(), &ground).unwrap();
        assert_eq!(sample.fix_index, None);
        assert_eq!(sample.speed_kmh, None);
        assert_eq!(sample.vertical_speed_ms, None);
        assert_eq!(sample.agl_m, None);
    }

    #[test]
    fn test_window_not_yet_filled_is_unavailable() {
        let track = climbing_track(60);
        let sample = sample_at(&track, 14_999, &MetricsParams::default(), &ground).unwrap();
        assert_eq!(sample.speed_kmh, None);
        assert_eq!(sample.vertical_speed_ms, None);
        assert!(sample.agl_m.is_some());

        let sample = sample_at(&track, 15_000, &MetricsParams::default(), &ground).unwrap();
        assert!(sample.speed_kmh.is_some());
    }

    #[test]
    fn test_zero_window_is_unavailable_not_infinite() {
        let track = climbing_track(10);
        let params = MetricsParams { window_s: 0.0 };
        let sample = sample_at(&track, 5_000, &params, &ground).unwrap();
        assert_eq!(sample.speed_kmh, None);
        assert_eq!(sample.vertical_speed_ms, None);
    }

    #[test]
    fn test_sink_keeps_sign() {
        let fixes = (0..=20)
            .map(|s| Fix::new(s * 1000, 46.0, 8.0).with_baro_altitude(2000.0 - 1.5 * s as f64))
            .collect();
        let track = Track::new(fixes).unwrap();
        let sample = sample_at(&track, 20_000, &MetricsParams::default(), &NoTerrain).unwrap();
        assert!((sample.vertical_speed_ms.unwrap() + 1.5).abs() < 1e-9);
        assert_eq!(sample.speed_kmh, Some(0.0));
    }

    #[test]
    fn test_sparse_sampling_uses_actual_dt() {
        // Fixes 40 s apart: the window reaches back to the previous fix.
        let fixes = vec![
            Fix::new(0, 46.0, 8.0).with_gps_altitude(1000.0),
            Fix::new(40_000, 46.0, 8.0).with_gps_altitude(1080.0),
        ];
        let track = Track::new(fixes).unwrap();
        let sample = sample_at(&track, 45_000, &MetricsParams::default(), &NoTerrain).unwrap();
        assert_eq!(sample.fix_index, Some(1));
        assert!((sample.vertical_speed_ms.unwrap() - 2.0).abs() < 1e-12);
    }

    #[test]
    fn test_after_track_end_holds_last_fix() {
        let track = climbing_track(30);
        let sample = sample_at(&track, 31_500, &MetricsParams::default(), &NoTerrain).unwrap();
        assert_eq!(sample.fix_index, Some(30));
        assert!(sample.vertical_speed_ms.is_some());
    }

    #[test]
    fn test_non_finite_terrain_fails_the_call() {
        let track = climbing_track(20);
        let broken = |_lat: f64, _lon: f64| Some(f64::NAN);
        let err = sample_at(&track, 10_000, &MetricsParams::default(), &broken);
        assert!(matches!(err, Err(XcError::NonFinite(_))));
    }

    #[test]
    fn test_repeat_queries_are_identical() {
        let track = climbing_track(120);
        let params = MetricsParams::default();
        let forward: Vec<_> = (0..120)
            .map(|s| sample_at(&track, s * 1000 + 250, &params, &ground).unwrap())
            .collect();
        let backward: Vec<_> = (0..120)
            .rev()
            .map(|s| sample_at(&track, s * 1000 + 250, &params, &ground).unwrap())
            .collect();
        let reversed: Vec<_> = backward.into_iter().rev().collect();
        assert_eq!(forward, reversed);
    }

    #[test]
    fn test_series_ticks() {
        let track = climbing_track(60);
        let series =
            sample_series(&track, 0, 60_000, 500, &MetricsParams::default(), &ground).unwrap();
        assert_eq!(series.len(), 121);
        assert_eq!(series[0].timestamp_ms, 0);
        assert_eq!(series[120].timestamp_ms, 60_000);
        assert!(series[..30].iter().all(|s| s.speed_kmh.is_none()));
        assert!(series[30..].iter().all(|s| s.speed_kmh.is_some()));

        assert!(sample_series(&track, 10, 0, 500, &MetricsParams::default(), &ground)
            .unwrap()
            .is_empty());
        assert!(sample_series(&track, 0, 10, 0, &MetricsParams::default(), &ground).is_err());
    }

    #[test]
    fn test_tick_generation() {
        assert_eq!(series_ticks(0, 2_500, 1_000).unwrap(), vec![0, 1_000, 2_000]);
        assert_eq!(series_ticks(5, 5, 1_000).unwrap(), vec![5]);
        assert!(series_ticks(10, 0, 1_000).unwrap().is_empty());
        assert!(series_ticks(0, 10, 0).is_err());
        assert!(series_ticks(0, 10, -5).is_err());
        assert_eq!(
            series_ticks(i64::MAX - 1, i64::MAX, 1).unwrap(),
            vec![i64::MAX - 1, i64::MAX]
        );
    }

    #[test]
    fn test_tick_span_overflow_is_rejected() {
        assert!(matches!(
            series_ticks(i64::MIN, i64::MAX, 1),
            Err(XcError::InvalidParameter(_))
        ));
        assert!(matches!(
            series_ticks(-1, i64::MAX, i64::MAX),
            Err(XcError::InvalidParameter(_))
        ));
        let track = climbing_track(5);
        let err = sample_series(
            &track,
            i64::MIN,
            0,
            1_000,
            &MetricsParams::default(),
            &NoTerrain,
        );
        assert!(matches!(err, Err(XcError::InvalidParameter(_))));
    }

    #[test]
    fn test_mixed_altitude_sources_use_effective_altitude() {
        // GPS drops out at the window start; the baro reading stands in.
        let fixes = vec![
            Fix::new(0, 46.0, 8.0).with_baro_altitude(1000.0),
            Fix::new(10_000, 46.0, 8.0)
                .with_gps_altitude(1020.0)
                .with_baro_altitude(990.0),
            Fix::new(20_000, 46.0, 8.0),
        ];
        let track = Track::new(fixes).unwrap();
        let params = MetricsParams { window_s: 10.0 };
        let sample = sample_at(&track, 10_000, &params, &NoTerrain).unwrap();
        assert_eq!(sample.altitude_m, Some(1020.0));
        assert!((sample.vertical_speed_ms.unwrap() - 2.0).abs() < 1e-12);
        // A fix with no altitude at all reads as 0 m.
        let sample = sample_at(&track, 20_000, &params, &NoTerrain).unwrap();
        assert_eq!(sample.altitude_m, Some(0.0));
        assert!((sample.vertical_speed_ms.unwrap() + 102.0).abs() < 1e-12);
    }

    #[test]
    fn test_dyn_terrain() {
        let track = climbing_track(20);
        let terrain: Box<dyn Terrain> = Box::new(NoTerrain);
        let sample =
            sample_at(&track, 10_000, &MetricsParams::default(), terrain.as_ref()).unwrap();
        assert_eq!(sample.agl_m, None);
    }
}
