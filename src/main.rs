use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use ndarray::{ArrayD, Axis, Dimension};
use serde::Serialize;
use spinup_db::batch::ProcessBatch;
use spinup_db::config;
use spinup_db::grid::LandSeaMask;
use spinup_db::io::CsvWriter;
use spinup_db::job::BatchSystem;
use spinup_db::lab::{LabBatch, LabModel};
use spinup_db::store::FsStore;
use spinup_db::Model;
use std::fs;
use std::path::Path;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};
use tracing_subscriber::EnvFilter;

const VERSION: &str = env!("CARGO_PKG_VERSION");
const SCHEMA_VERSION: &str = "1.0.0";

#[derive(Parser, Debug)]
#[command(name = "spinup-db")]
#[command(version)]
#[command(about = "Spinup and finite-difference derivative scheduler for ocean model runs")]
struct Args {
    #[command(subcommand)]
    command: Commands,

    /// Path to TOML configuration file
    #[arg(short, long, global = true)]
    config: Option<String>,

    /// Output CSV path
    #[arg(short, long, global = true)]
    out: Option<String>,

    /// Run jobs with the in-process lab model instead of the configured executable
    #[arg(long, global = true)]
    lab: bool,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Model output on the full grid at a parameter vector
    Value {
        /// Comma-separated parameter vector
        #[arg(short, long, value_delimiter = ',', allow_hyphen_values = true)]
        parameters: Vec<f64>,
        /// Time slices per year in the output (default: configured time dimension)
        #[arg(long)]
        time_dim: Option<usize>,
        /// Generate JSON result bundle
        #[arg(long)]
        json: bool,
    },
    /// Finite-difference Jacobian on the full grid at a parameter vector
    Jacobian {
        #[arg(short, long, value_delimiter = ',', allow_hyphen_values = true)]
        parameters: Vec<f64>,
        /// Comma-separated booleans selecting the parameters to differentiate
        #[arg(long, value_delimiter = ',')]
        mask: Option<Vec<bool>>,
        #[arg(long)]
        time_dim: Option<usize>,
        #[arg(long)]
        json: bool,
    },
    /// Look up a parameter vector in the index
    Index {
        #[arg(short, long, value_delimiter = ',', allow_hyphen_values = true)]
        parameters: Vec<f64>,
    },
    /// Validate a configuration file
    Validate,
    /// Show version information
    Version,
}

// ============================================================================
// JSON Output Structures
// ============================================================================

#[derive(Serialize)]
struct Manifest {
    schema_version: String,
    tool_version: String,
    timestamp_utc: String,
    platform: String,
    backend: String,
    config_hash: String,
    config_snapshot: config::Root,
}

#[derive(Serialize)]
struct TracerSummary {
    tracer: String,
    ocean_values: usize,
    min: f64,
    max: f64,
    mean: f64,
}

#[derive(Serialize)]
struct ValueOutput {
    manifest: Manifest,
    parameters: Vec<f64>,
    run: String,
    total_years: u32,
    wall_time_ms: f64,
    tracers: Vec<TracerSummary>,
}

#[derive(Serialize)]
struct JacobianOutput {
    manifest: Manifest,
    parameters: Vec<f64>,
    accuracy_order: u8,
    step_size: f64,
    derivative_years: u32,
    /// Parameter positions stacked on the first axis of each tracer's derivative.
    active_parameters: Vec<usize>,
    wall_time_ms: f64,
    tracers: Vec<Vec<TracerSummary>>,
}

// ============================================================================
// Helper Functions
// ============================================================================

fn compute_hash(data: &str) -> String {
    use std::collections::hash_map::DefaultHasher;
    use std::hash::{Hash, Hasher};
    let mut hasher = DefaultHasher::new();
    data.hash(&mut hasher);
    format!("{:016x}", hasher.finish())
}

/// UTC time as `YYYY-MM-DDTHH:MM:SSZ`, civil date from days since 1970-01-01.
fn get_timestamp() -> String {
    let now = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or_default();
    let (days, clock) = (now / 86_400, now % 86_400);

    // Eras of 400 years starting at 0000-03-01.
    let z = days + 719_468;
    let era = z / 146_097;
    let doe = z - era * 146_097;
    let yoe = (doe - doe / 1460 + doe / 36_524 - doe / 146_096) / 365;
    let doy = doe - (365 * yoe + yoe / 4 - yoe / 100);
    let mp = (5 * doy + 2) / 153;
    let day = doy - (153 * mp + 2) / 5 + 1;
    let month = if mp < 10 { mp + 3 } else { mp - 9 };
    let year = yoe + era * 400 + u64::from(month <= 2);

    format!(
        "{:04}-{:02}-{:02}T{:02}:{:02}:{:02}Z",
        year,
        month,
        day,
        clock / 3600,
        clock % 3600 / 60,
        clock % 60
    )
}

fn create_manifest(cfg: &config::Root, cfg_text: &str, lab: bool) -> Manifest {
    Manifest {
        schema_version: SCHEMA_VERSION.to_string(),
        tool_version: VERSION.to_string(),
        timestamp_utc: get_timestamp(),
        platform: std::env::consts::OS.to_string(),
        backend: if lab { "lab" } else { "process" }.to_string(),
        config_hash: compute_hash(cfg_text),
        config_snapshot: cfg.clone(),
    }
}

fn summarize(tracer: &str, values: &ArrayD<f64>) -> TracerSummary {
    let ocean: Vec<f64> = values.iter().copied().filter(|v| !v.is_nan()).collect();
    let n = ocean.len();
    TracerSummary {
        tracer: tracer.to_string(),
        ocean_values: n,
        min: ocean.iter().copied().fold(f64::NAN, f64::min),
        max: ocean.iter().copied().fold(f64::NAN, f64::max),
        mean: if n > 0 { ocean.iter().sum::<f64>() / n as f64 } else { 0.0 },
    }
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

fn load_config(cfg_path: &str) -> Result<(config::Root, String)> {
    let cfg_text = fs::read_to_string(cfg_path)
        .with_context(|| format!("failed to read config: {}", cfg_path))?;
    let cfg = config::Root::from_toml_str(&cfg_text)
        .with_context(|| format!("failed to parse config: {}", cfg_path))?;
    Ok((cfg, cfg_text))
}

fn create_batch(cfg: &config::Root, lab: bool) -> Result<Box<dyn BatchSystem>> {
    if lab {
        if cfg.database.tracers.len() != 2 {
            bail!(
                "the lab model writes 2 tracers but database.tracers names {}",
                cfg.database.tracers.len()
            );
        }
        let mask = LandSeaMask::from_config(cfg)?;
        return Ok(Box::new(LabBatch::new(
            LabModel::affine(cfg.model_parameter_len()),
            mask,
        )));
    }
    let executable = cfg
        .job
        .executable
        .clone()
        .context("job.executable required unless --lab is given")?;
    Ok(Box::new(ProcessBatch::new(
        executable,
        Duration::from_millis(cfg.job.poll_interval_ms),
    )))
}

fn write_json<T: Serialize>(out_path: &str, value: &T) -> Result<()> {
    let json_path = Path::new(out_path).with_extension("json");
    let json = serde_json::to_string_pretty(value)?;
    fs::write(&json_path, json)
        .with_context(|| format!("failed to write {}", json_path.display()))?;
    eprintln!("[spinup-db] JSON bundle: {}", json_path.display());
    Ok(())
}

// ============================================================================
// Commands
// ============================================================================

fn run_value(
    cfg: &config::Root,
    cfg_text: &str,
    out_path: &str,
    lab: bool,
    parameters: &[f64],
    time_dim: Option<usize>,
    json_output: bool,
) -> Result<()> {
    let store = FsStore::new(&cfg.database.output_dir);
    let batch = create_batch(cfg, lab)?;
    let model = Model::new(cfg.clone(), &store, batch.as_ref())?;
    let time_dim = time_dim.unwrap_or_else(|| cfg.time_dim());

    let start = Instant::now();
    let matched = model
        .matching_run(parameters, &model.target())?
        .context("spinup target requests no run")?;
    let total_years = model.total_years(&matched.run)?;
    let values = model.f_boxes(parameters, time_dim)?;
    let wall_time_ms = start.elapsed().as_secs_f64() * 1000.0;

    let mut w = CsvWriter::create(out_path)?;
    w.write_header(&["tracer", "t", "x", "y", "z", "value"])?;
    for (name, array) in cfg.database.tracers.iter().zip(&values) {
        for (index, value) in array.indexed_iter() {
            if !value.is_nan() {
                w.write_value_row(name, index.slice(), *value)?;
            }
        }
    }
    w.flush()?;

    let tracers: Vec<TracerSummary> = cfg
        .database
        .tracers
        .iter()
        .zip(&values)
        .map(|(name, array)| summarize(name, array))
        .collect();
    eprintln!(
        "[spinup-db] run={} years={} wall_time={:.1} ms",
        matched.run.display(),
        total_years,
        wall_time_ms
    );
    for t in &tracers {
        eprintln!(
            "  {:8} min={:.6e} max={:.6e} mean={:.6e}",
            t.tracer, t.min, t.max, t.mean
        );
    }
    if let Some(warning) = &matched.warning {
        eprintln!("[spinup-db] WARNING: {}", warning);
    }

    if json_output {
        let output = ValueOutput {
            manifest: create_manifest(cfg, cfg_text, lab),
            parameters: parameters.to_vec(),
            run: matched.run.display().to_string(),
            total_years,
            wall_time_ms,
            tracers,
        };
        write_json(out_path, &output)?;
    }
    Ok(())
}

#[allow(clippy::too_many_arguments)]
fn run_jacobian(
    cfg: &config::Root,
    cfg_text: &str,
    out_path: &str,
    lab: bool,
    parameters: &[f64],
    mask: Option<&[bool]>,
    time_dim: Option<usize>,
    json_output: bool,
) -> Result<()> {
    let store = FsStore::new(&cfg.database.output_dir);
    let batch = create_batch(cfg, lab)?;
    let model = Model::new(cfg.clone(), &store, batch.as_ref())?;
    let time_dim = time_dim.unwrap_or_else(|| cfg.time_dim());

    let start = Instant::now();
    let df = model.df_boxes(parameters, time_dim, mask)?;
    let wall_time_ms = start.elapsed().as_secs_f64() * 1000.0;

    let active: Vec<usize> = match mask {
        Some(mask) => mask
            .iter()
            .enumerate()
            .filter(|(_, m)| **m)
            .map(|(i, _)| i)
            .collect(),
        None => (0..parameters.len()).collect(),
    };

    let mut w = CsvWriter::create(out_path)?;
    w.write_header(&["tracer", "parameter", "t", "x", "y", "z", "derivative"])?;
    for (name, array) in cfg.database.tracers.iter().zip(&df) {
        for (index, value) in array.indexed_iter() {
            if value.is_nan() {
                continue;
            }
            let index = index.slice();
            w.write_derivative_row(name, active[index[0]], &index[1..], *value)?;
        }
    }
    w.flush()?;

    eprintln!(
        "[spinup-db] Jacobian: order={} step={:e} years={} wall_time={:.1} ms",
        cfg.derivative.accuracy_order, cfg.derivative.step_size, cfg.derivative.years, wall_time_ms
    );
    eprintln!("  {:8} {:>9} {:>14} {:>14}", "Tracer", "Parameter", "mean", "max");
    eprintln!("  {}", "-".repeat(48));
    let mut tracers = Vec::with_capacity(df.len());
    for (name, array) in cfg.database.tracers.iter().zip(&df) {
        let mut rows = Vec::with_capacity(active.len());
        for (k, parameter) in active.iter().enumerate() {
            let row = summarize(name, &array.index_axis(Axis(0), k).to_owned());
            eprintln!(
                "  {:8} {:>9} {:>14.6e} {:>14.6e}",
                name, parameter, row.mean, row.max
            );
            rows.push(row);
        }
        tracers.push(rows);
    }

    if json_output {
        let output = JacobianOutput {
            manifest: create_manifest(cfg, cfg_text, lab),
            parameters: parameters.to_vec(),
            accuracy_order: cfg.derivative.accuracy_order,
            step_size: cfg.derivative.step_size,
            derivative_years: cfg.derivative.years,
            active_parameters: active,
            wall_time_ms,
            tracers,
        };
        write_json(out_path, &output)?;
    }
    Ok(())
}

fn run_index(cfg: &config::Root, lab: bool, parameters: &[f64]) -> Result<()> {
    let store = FsStore::new(&cfg.database.output_dir);
    let batch = create_batch(cfg, lab)?;
    let model = Model::new(cfg.clone(), &store, batch.as_ref())?;

    match model.parameter_set_dir(parameters, false)? {
        Some(dir) => {
            eprintln!("[spinup-db] stored: {}", dir.display());
            match model.last_run(parameters)? {
                Some(run) => match model.total_years(&run) {
                    Ok(years) => eprintln!("  last run: {} ({} years)", run.display(), years),
                    Err(e) => eprintln!("  last run: {} (years unknown: {})", run.display(), e),
                },
                None => eprintln!("  last run: none"),
            }
        }
        None => eprintln!("[spinup-db] not stored"),
    }
    match model.closest_parameter_set_dir(parameters)? {
        Some(dir) => eprintln!("  closest: {}", dir.display()),
        None => eprintln!("  closest: none (empty index)"),
    }
    Ok(())
}

fn validate_config(cfg_path: &str) -> Result<()> {
    let (cfg, _) = load_config(cfg_path)?;
    LandSeaMask::from_config(&cfg)?;

    eprintln!("[spinup-db] config valid: {}", cfg_path);
    eprintln!(
        "  database: output_dir={}, model={}, time_step={}, tracers={:?}",
        cfg.database.output_dir.display(),
        cfg.database.model_name,
        cfg.database.time_step,
        cfg.database.tracers
    );
    eprintln!(
        "  parameters: n={}, concentration_factor_included={}",
        cfg.model_parameter_len(),
        cfg.parameters.concentration_factor_included
    );
    eprintln!(
        "  spinup: years={}, tolerance={:.0e}, combination={}, max_years={}",
        cfg.spinup.years, cfg.spinup.tolerance, cfg.spinup.combination, cfg.spinup.max_years
    );
    eprintln!(
        "  derivative: years={}, step_size={:e}, accuracy_order={}",
        cfg.derivative.years, cfg.derivative.step_size, cfg.derivative.accuracy_order
    );
    eprintln!(
        "  grid: t={} x={} y={} z={}, mask={}",
        cfg.grid.t_dim,
        cfg.grid.x_dim,
        cfg.grid.y_dim,
        cfg.grid.z_dim,
        cfg.grid
            .mask_file
            .as_ref()
            .map(|p| p.display().to_string())
            .unwrap_or_else(|| "all ocean".to_string())
    );
    match &cfg.job.executable {
        Some(executable) => eprintln!("  job: executable={}", executable.display()),
        None => eprintln!("  job: no executable, only --lab runs possible"),
    }
    Ok(())
}

fn print_version() {
    eprintln!("spinup-db - spinup and derivative scheduler for ocean model runs");
    eprintln!();
    eprintln!("  Version:           {}", VERSION);
    eprintln!("  Schema Version:    {}", SCHEMA_VERSION);
    eprintln!("  Platform:          {}", std::env::consts::OS);
    eprintln!("  Architecture:      {}", std::env::consts::ARCH);
    eprintln!();
    eprintln!("Backends:");
    eprintln!("  - process: runs job.executable with the job options file as argument");
    eprintln!("  - lab:     in-process affine model (--lab)");
}

// ============================================================================
// Main
// ============================================================================

fn main() -> Result<()> {
    let args = Args::parse();
    init_tracing();

    match args.command {
        Commands::Version => {
            print_version();
            Ok(())
        }
        Commands::Validate => {
            let cfg_path = args.config.context("--config required for validate")?;
            validate_config(&cfg_path)
        }
        Commands::Index { parameters } => {
            let cfg_path = args.config.context("--config required")?;
            let (cfg, _) = load_config(&cfg_path)?;
            run_index(&cfg, args.lab, &parameters)
        }
        Commands::Value {
            parameters,
            time_dim,
            json,
        } => {
            let cfg_path = args.config.context("--config required")?;
            let out_path = args.out.unwrap_or_else(|| "results/value.csv".to_string());
            let (cfg, cfg_text) = load_config(&cfg_path)?;

            eprintln!("[spinup-db] v{} - model {}", VERSION, cfg.database.model_name);
            run_value(&cfg, &cfg_text, &out_path, args.lab, &parameters, time_dim, json)
        }
        Commands::Jacobian {
            parameters,
            mask,
            time_dim,
            json,
        } => {
            let cfg_path = args.config.context("--config required")?;
            let out_path = args.out.unwrap_or_else(|| "results/jacobian.csv".to_string());
            let (cfg, cfg_text) = load_config(&cfg_path)?;

            eprintln!("[spinup-db] v{} - model {}", VERSION, cfg.database.model_name);
            run_jacobian(
                &cfg,
                &cfg_text,
                &out_path,
                args.lab,
                &parameters,
                mask.as_deref(),
                time_dim,
                json,
            )
        }
    }
}
