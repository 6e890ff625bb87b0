use std::fs;
use std::fs::File;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::time::Instant;

use anyhow::{anyhow, Context, Result};
use chrono::DateTime;
use clap::{ArgAction, Parser, Subcommand, ValueHint};
use rayon::prelude::*;
use serde::Deserialize;
use tracing::{debug, info, warn};
use tracing_subscriber::EnvFilter;
use xc_track::{
    sample_at, series_ticks, Fix, MetricsSample, NoTerrain, OptimizedPath, Params,
    SampledTerrain, Task, Terrain, TerrainSample, Track,
};

#[derive(Parser, Debug)]
#[command(author, version, about = "Competition task distance and flight replay metrics", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Solve the optimized task route for a task JSON file
    Optimize(OptimizeArgs),
    /// Sample speed, vario and AGL from a track JSON file
    Metrics(MetricsArgs),
}

#[derive(Parser, Debug)]
struct OptimizeArgs {
    /// Task JSON (`{"name": ..., "turnpoints": [...]}`)
    #[arg(required = true, value_hint = ValueHint::FilePath)]
    task: PathBuf,

    /// Output path (`-` for stdout)
    #[arg(short, long, default_value = "-", value_hint = ValueHint::FilePath)]
    output: PathBuf,

    /// Emit the full result as JSON instead of CSV rows
    #[arg(long, action = ArgAction::SetTrue)]
    json: bool,

    /// Optional parameter file (JSON)
    #[arg(long, value_hint = ValueHint::FilePath)]
    params: Option<PathBuf>,

    /// Maximum relaxation passes
    #[arg(long)]
    max_passes: Option<usize>,

    /// Early-stop threshold on per-pass movement (meters)
    #[arg(long)]
    shift_eps: Option<f64>,

    /// Verbose logging
    #[arg(long, action = ArgAction::SetTrue)]
    verbose: bool,
}

#[derive(Parser, Debug)]
struct MetricsArgs {
    /// Track JSON (array of fixes)
    #[arg(required = true, value_hint = ValueHint::FilePath)]
    track: PathBuf,

    /// Query instants (epoch milliseconds or RFC 3339), comma separated
    #[arg(long, value_delimiter = ',')]
    at: Vec<String>,

    /// Series start (defaults to track start)
    #[arg(long)]
    from: Option<String>,

    /// Series end (defaults to track end)
    #[arg(long)]
    to: Option<String>,

    /// Series step in milliseconds
    #[arg(long, default_value_t = 1000)]
    step_ms: i64,

    /// Smoothing window in seconds
    #[arg(long)]
    window: Option<f64>,

    /// Optional terrain grid JSON (`{"step_deg": ..., "samples": [...]}`)
    #[arg(long, value_hint = ValueHint::FilePath)]
    terrain: Option<PathBuf>,

    /// Optional parameter file (JSON)
    #[arg(long, value_hint = ValueHint::FilePath)]
    params: Option<PathBuf>,

    /// Output CSV path (`-` for stdout)
    #[arg(short, long, default_value = "-", value_hint = ValueHint::FilePath)]
    output: PathBuf,

    /// Verbose logging
    #[arg(long, action = ArgAction::SetTrue)]
    verbose: bool,
}

#[derive(Debug, Deserialize)]
struct TerrainGrid {
    step_deg: f64,
    samples: Vec<TerrainSample>,
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    let verbose = match &cli.command {
        Command::Optimize(args) => args.verbose,
        Command::Metrics(args) => args.verbose,
    };
    let default_level = if verbose { "debug" } else { "info" };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(io::stderr)
        .try_init();

    match cli.command {
        Command::Optimize(args) => handle_optimize(args),
        Command::Metrics(args) => handle_metrics(args),
    }
}

fn handle_optimize(args: OptimizeArgs) -> Result<()> {
    let mut params = load_params(args.params.as_deref())?;
    if let Some(passes) = args.max_passes {
        params.optimizer.max_passes = passes;
    }
    if let Some(eps) = args.shift_eps {
        params.optimizer.shift_epsilon_m = eps;
    }

    let text = fs::read_to_string(&args.task)
        .with_context(|| format!("failed to read {}", args.task.display()))?;
    let task: Task = serde_json::from_str(&text)
        .with_context(|| format!("{} is not a valid task", args.task.display()))?;
    task.validate()
        .with_context(|| format!("{} contains an invalid turnpoint", args.task.display()))?;

    let t_solve = Instant::now();
    let path = task
        .optimize(&params.optimizer)
        .with_context(|| format!("optimization failed for {}", args.task.display()))?
        .ok_or_else(|| {
            anyhow!(
                "no optimized path available: need >= 2 turnpoints opening with a start and closing with an end"
            )
        })?;
    debug!(
        "Solve stage: {:.3} ms",
        t_solve.elapsed().as_secs_f64() * 1000.0
    );

    if !path.diagnostics.converged {
        warn!(
            "Relaxation stopped after {} passes without converging (last shift {:.3} m)",
            path.diagnostics.passes, path.diagnostics.final_shift_m
        );
    }
    info!(
        "Task {}: optimized {:.3} km vs {:.3} km centre-to-centre ({} passes)",
        task.name().unwrap_or("<unnamed>"),
        path.total_distance_m / 1000.0,
        task.center_distance_m() / 1000.0,
        path.diagnostics.passes
    );

    if args.json {
        let text = serde_json::to_string_pretty(&path)?;
        write_text(&args.output, &text)
    } else {
        with_csv_writer(&args.output, |writer| write_path_rows(&task, &path, writer))
    }
}

fn handle_metrics(args: MetricsArgs) -> Result<()> {
    let mut params = load_params(args.params.as_deref())?;
    if let Some(window) = args.window {
        params.metrics.window_s = window;
    }
    params.metrics.validate()?;

    let text = fs::read_to_string(&args.track)
        .with_context(|| format!("failed to read {}", args.track.display()))?;
    let fixes: Vec<Fix> = serde_json::from_str(&text)
        .with_context(|| format!("{} is not a valid fix array", args.track.display()))?;
    let track = Track::new(fixes)
        .with_context(|| format!("{} is not a usable track", args.track.display()))?;
    info!(
        "Track loaded: {} fixes over {:.1} min",
        track.len(),
        track.duration_ms() as f64 / 60_000.0
    );

    let terrain: Box<dyn Terrain + Sync> = match args.terrain.as_ref() {
        Some(path) => Box::new(load_terrain(path)?),
        None => Box::new(NoTerrain),
    };

    let ticks = if args.at.is_empty() {
        let start = args
            .from
            .as_deref()
            .map(parse_instant)
            .transpose()?
            .unwrap_or_else(|| track.start_ms());
        let end = args
            .to
            .as_deref()
            .map(parse_instant)
            .transpose()?
            .unwrap_or_else(|| track.end_ms());
        build_ticks(start, end, args.step_ms)?
    } else {
        args.at
            .iter()
            .map(|token| parse_instant(token))
            .collect::<Result<Vec<_>>>()?
    };

    let t_sample = Instant::now();
    let samples = ticks
        .par_iter()
        .map(|&t| {
            sample_at(&track, t, &params.metrics, terrain.as_ref())
                .with_context(|| format!("metrics failed at t={t}"))
        })
        .collect::<Result<Vec<MetricsSample>>>()?;
    debug!(
        "Sample stage: {:.1} ms ({} ticks)",
        t_sample.elapsed().as_secs_f64() * 1000.0,
        samples.len()
    );

    let available = samples.iter().filter(|s| s.speed_kmh.is_some()).count();
    info!(
        "Sampled {} ticks, {} with speed/vario",
        samples.len(),
        available
    );

    with_csv_writer(&args.output, |writer| write_metric_rows(&samples, writer))
}

fn load_params(path: Option<&Path>) -> Result<Params> {
    let Some(path) = path else {
        return Ok(Params::default());
    };
    let text = fs::read_to_string(path)
        .with_context(|| format!("failed to read params {}", path.display()))?;
    let params: Params = serde_json::from_str(&text)
        .with_context(|| format!("{} is not valid params JSON", path.display()))?;
    debug!("Loaded params from {}: {:?}", path.display(), params);
    Ok(params)
}

fn load_terrain(path: &Path) -> Result<SampledTerrain> {
    let text = fs::read_to_string(path)
        .with_context(|| format!("failed to read terrain {}", path.display()))?;
    let grid: TerrainGrid = serde_json::from_str(&text)
        .with_context(|| format!("{} is not a valid terrain grid", path.display()))?;
    let terrain = SampledTerrain::from_samples(grid.step_deg, &grid.samples)
        .with_context(|| format!("invalid terrain grid {}", path.display()))?;
    if terrain.is_empty() {
        warn!("Terrain grid {} had no samples; AGL will be unavailable", path.display());
    }
    Ok(terrain)
}

/// Epoch milliseconds or an RFC 3339 timestamp.
fn parse_instant(token: &str) -> Result<i64> {
    let trimmed = token.trim();
    if let Ok(ms) = trimmed.parse::<i64>() {
        return Ok(ms);
    }
    let time = DateTime::parse_from_rfc3339(trimmed)
        .with_context(|| format!("invalid instant '{}': expected epoch ms or RFC 3339", trimmed))?;
    Ok(time.timestamp_millis())
}

/// Like [`series_ticks`], but an inverted range is a usage error here.
fn build_ticks(start: i64, end: i64, step_ms: i64) -> Result<Vec<i64>> {
    if end < start {
        return Err(anyhow!("series end precedes start"));
    }
    series_ticks(start, end, step_ms).context("invalid --from/--to/--step-ms")
}

fn with_csv_writer<F>(output: &Path, write_rows: F) -> Result<()>
where
    F: FnOnce(&mut csv::Writer<Box<dyn Write>>) -> Result<()>,
{
    let sink: Box<dyn Write> = if output.as_os_str() == "-" {
        Box::new(io::stdout().lock())
    } else {
        Box::new(
            File::create(output)
                .with_context(|| format!("failed to create {}", output.display()))?,
        )
    };
    let mut writer = csv::Writer::from_writer(sink);
    write_rows(&mut writer)?;
    writer.flush()?;
    if output.as_os_str() != "-" {
        info!("Wrote {}", output.display());
    }
    Ok(())
}

fn write_text(output: &Path, text: &str) -> Result<()> {
    if output.as_os_str() == "-" {
        let mut stdout = io::stdout().lock();
        writeln!(stdout, "{text}")?;
        return Ok(());
    }
    fs::write(output, text).with_context(|| format!("failed to write {}", output.display()))?;
    info!("Wrote {}", output.display());
    Ok(())
}

fn write_path_rows<W: Write>(
    task: &Task,
    path: &OptimizedPath,
    writer: &mut csv::Writer<W>,
) -> Result<()> {
    writer.write_record(["index", "role", "lat", "lon", "altitude_m", "leg_m", "cumulative_m"])?;
    let mut cumulative = 0.0;
    for (idx, (point, tp)) in path.points.iter().zip(task.turnpoints()).enumerate() {
        let leg = if idx == 0 {
            0.0
        } else {
            path.leg_distances_m[idx - 1]
        };
        cumulative += leg;
        writer.write_record([
            idx.to_string(),
            tp.role.as_str().to_string(),
            format!("{:.7}", point.lat),
            format!("{:.7}", point.lon),
            format!("{:.1}", point.altitude),
            format!("{:.3}", leg),
            format!("{:.3}", cumulative),
        ])?;
    }
    Ok(())
}

fn write_metric_rows<W: Write>(samples: &[MetricsSample], writer: &mut csv::Writer<W>) -> Result<()> {
    writer.write_record([
        "timestamp_ms",
        "altitude_m",
        "speed_kmh",
        "vertical_speed_ms",
        "agl_m",
    ])?;
    for sample in samples {
        writer.write_record([
            sample.timestamp_ms.to_string(),
            fmt_opt(sample.altitude_m, 1),
            fmt_opt(sample.speed_kmh, 2),
            fmt_opt(sample.vertical_speed_ms, 2),
            fmt_opt(sample.agl_m, 1),
        ])?;
    }
    Ok(())
}

fn fmt_opt(value: Option<f64>, decimals: usize) -> String {
    value
        .map(|v| format!("{:.*}", decimals, v))
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_instant_forms() {
        assert_eq!(parse_instant("1700000000000").unwrap(), 1_700_000_000_000);
        assert_eq!(
            parse_instant("2023-11-14T22:13:20Z").unwrap(),
            1_700_000_000_000
        );
        assert_eq!(
            parse_instant(" 2023-11-14T23:13:20.5+01:00 ").unwrap(),
            1_700_000_000_500
        );
        assert!(parse_instant("yesterday").is_err());
    }

    #[test]
    fn test_build_ticks() {
        assert_eq!(build_ticks(0, 2_500, 1_000).unwrap(), vec![0, 1_000, 2_000]);
        assert_eq!(build_ticks(5, 5, 1_000).unwrap(), vec![5]);
        assert!(build_ticks(0, 10, 0).is_err());
        assert!(build_ticks(10, 0, 1).is_err());
        assert!(build_ticks(i64::MIN, i64::MAX, 1_000).is_err());
    }

    #[test]
    fn test_fmt_opt_blank_when_unavailable() {
        assert_eq!(fmt_opt(None, 2), "");
        assert_eq!(fmt_opt(Some(1.234), 1), "1.2");
    }

    #[test]
    fn test_metric_rows() {
        let samples = vec![
            MetricsSample {
                timestamp_ms: 1_000,
                ..MetricsSample::default()
            },
            MetricsSample {
                timestamp_ms: 2_000,
                fix_index: Some(1),
                altitude_m: Some(1200.0),
                speed_kmh: Some(35.25),
                vertical_speed_ms: Some(-1.5),
                agl_m: None,
            },
        ];
        let mut writer = csv::Writer::from_writer(Vec::new());
        write_metric_rows(&samples, &mut writer).unwrap();
        let text = String::from_utf8(writer.into_inner().unwrap()).unwrap();
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(lines[0], "timestamp_ms,altitude_m,speed_kmh,vertical_speed_ms,agl_m");
        assert_eq!(lines[1], "1000,,,,");
        assert_eq!(lines[2], "2000,1200.0,35.25,-1.50,");
    }
}
