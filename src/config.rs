use crate::error::{EngineError, Result};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

macro_rules! bail {
    ($($arg:tt)*) => {
        return Err(EngineError::Validation(format!($($arg)*)))
    };
}

/// Time steps the model binary supports.
pub const TIME_STEPS: [u32; 7] = [1, 2, 4, 8, 16, 32, 64];

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Root {
    pub database: Database,
    pub parameters: Parameters,
    #[serde(default)]
    pub tolerance: ToleranceOptions,
    #[serde(default)]
    pub spinup: SpinupOptions,
    #[serde(default)]
    pub derivative: DerivativeOptions,
    #[serde(default)]
    pub job: JobOptions,
    #[serde(default)]
    pub grid: GridOptions,
    #[serde(default)]
    pub interpolator: InterpolatorOptions,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Database {
    pub output_dir: PathBuf,
    pub model_name: String,
    #[serde(default = "default_time_step")]
    pub time_step: u32,
    /// Output quantities written by the model, in file order.
    #[serde(default = "default_tracers")]
    pub tracers: Vec<String>,
}

fn default_time_step() -> u32 { 1 }
fn default_tracers() -> Vec<String> {
    vec!["po4".to_string(), "dop".to_string()]
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Parameters {
    pub lower_bound: Vec<f64>,
    pub upper_bound: Vec<f64>,
    /// Scale used to size finite-difference steps.
    pub typical_values: Vec<f64>,
    /// Whether callers pass the total concentration factor as trailing component.
    #[serde(default)]
    pub concentration_factor_included: bool,
}

/// A tolerance given once for all components or per component.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(untagged)]
pub enum Tolerance {
    Scalar(f64),
    PerComponent(Vec<f64>),
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ToleranceOptions {
    #[serde(default = "default_absolute")]
    pub absolute: Tolerance,
    #[serde(default = "default_relative")]
    pub relative: Tolerance,
    #[serde(default = "default_reliable_decimal_places")]
    pub reliable_decimal_places: u32,
}

fn default_absolute() -> Tolerance { Tolerance::Scalar(1e-12) }
fn default_relative() -> Tolerance { Tolerance::Scalar(0.0) }
fn default_reliable_decimal_places() -> u32 { 15 }

impl Default for ToleranceOptions {
    fn default() -> Self {
        Self {
            absolute: default_absolute(),
            relative: default_relative(),
            reliable_decimal_places: default_reliable_decimal_places(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Combination {
    And,
    Or,
}

impl FromStr for Combination {
    type Err = EngineError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "and" => Ok(Self::And),
            "or" => Ok(Self::Or),
            _ => bail!("combination '{}' unknown, use one of {{and, or}}", s),
        }
    }
}

impl fmt::Display for Combination {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::And => write!(f, "and"),
            Self::Or => write!(f, "or"),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct SpinupOptions {
    #[serde(default = "default_spinup_years")]
    pub years: u32,
    #[serde(default)]
    pub tolerance: f64,
    #[serde(default = "default_combination")]
    pub combination: Combination,
    /// Hard cap that satisfies an AND target even if the tolerance is never reached.
    #[serde(default = "default_max_years")]
    pub max_years: u32,
    /// Seed a new chain from the closest stored parameter set with a finished run.
    #[serde(default = "default_true")]
    pub start_from_closest: bool,
}

fn default_spinup_years() -> u32 { 10000 }
fn default_combination() -> Combination { Combination::Or }
fn default_max_years() -> u32 { 50000 }
fn default_true() -> bool { true }

impl Default for SpinupOptions {
    fn default() -> Self {
        Self {
            years: default_spinup_years(),
            tolerance: 0.0,
            combination: default_combination(),
            max_years: default_max_years(),
            start_from_closest: true,
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct DerivativeOptions {
    /// Years each perturbation run continues from the base spinup.
    #[serde(default = "default_derivative_years")]
    pub years: u32,
    #[serde(default = "default_step_size")]
    pub step_size: f64,
    #[serde(default = "default_accuracy_order")]
    pub accuracy_order: u8,
}

fn default_derivative_years() -> u32 { 100 }
fn default_step_size() -> f64 { 1e-7 }
fn default_accuracy_order() -> u8 { 2 }

impl Default for DerivativeOptions {
    fn default() -> Self {
        Self {
            years: default_derivative_years(),
            step_size: default_step_size(),
            accuracy_order: default_accuracy_order(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobKind {
    Spinup,
    Derivative,
    Trajectory,
}

/// Submission options handed through to the batch system.
#[derive(Debug, Clone, Default, PartialEq, Deserialize, Serialize)]
pub struct JobSetup {
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub queue: Option<String>,
    #[serde(default)]
    pub nodes: Option<u32>,
    #[serde(default)]
    pub cpus: Option<u32>,
    #[serde(default)]
    pub walltime_hours: Option<f64>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct JobOptions {
    /// Model binary started by the process backend.
    #[serde(default)]
    pub executable: Option<PathBuf>,
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
    #[serde(default)]
    pub spinup: JobSetup,
    /// Falls back to the spinup setup without node pinning.
    #[serde(default)]
    pub derivative: Option<JobSetup>,
    /// Falls back to the derivative setup.
    #[serde(default)]
    pub trajectory: Option<JobSetup>,
}

fn default_poll_interval_ms() -> u64 { 1000 }

impl Default for JobOptions {
    fn default() -> Self {
        Self {
            executable: None,
            poll_interval_ms: default_poll_interval_ms(),
            spinup: JobSetup::default(),
            derivative: None,
            trajectory: None,
        }
    }
}

impl JobOptions {
    pub fn setup(&self, kind: JobKind) -> JobSetup {
        let derivative = || {
            self.derivative.clone().unwrap_or_else(|| JobSetup {
                nodes: None,
                ..self.spinup.clone()
            })
        };
        match kind {
            JobKind::Spinup => self.spinup.clone(),
            JobKind::Derivative => derivative(),
            JobKind::Trajectory => self.trajectory.clone().unwrap_or_else(|| JobSetup {
                nodes: None,
                ..derivative()
            }),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct GridOptions {
    /// Trajectory time slices per model year at time step 1.
    #[serde(default = "default_t_dim")]
    pub t_dim: usize,
    #[serde(default = "default_x_dim")]
    pub x_dim: usize,
    #[serde(default = "default_y_dim")]
    pub y_dim: usize,
    #[serde(default = "default_z_dim")]
    pub z_dim: usize,
    /// Layer boundaries in metres, `z_dim + 1` increasing values. Uniform 0..5000 m if empty.
    #[serde(default)]
    pub depth_bounds: Vec<f64>,
    /// Text file with `y_dim` rows of `x_dim` ocean layer counts. All-ocean if absent.
    #[serde(default)]
    pub mask_file: Option<PathBuf>,
}

fn default_t_dim() -> usize { 2880 }
fn default_x_dim() -> usize { 128 }
fn default_y_dim() -> usize { 64 }
fn default_z_dim() -> usize { 15 }

impl Default for GridOptions {
    fn default() -> Self {
        Self {
            t_dim: default_t_dim(),
            x_dim: default_x_dim(),
            y_dim: default_y_dim(),
            z_dim: default_z_dim(),
            depth_bounds: Vec::new(),
            mask_file: None,
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct InterpolatorOptions {
    /// Data points blended per query point.
    #[serde(default = "default_neighbours")]
    pub neighbours: usize,
    /// Values > 0 enable clamping of queries into the defined interpolation support.
    #[serde(default = "default_linear_interpolators")]
    pub linear_interpolators: usize,
    /// Periodic overlap (in grid cells) added in t and x.
    #[serde(default = "default_wrap_around")]
    pub wrap_around: f64,
}

fn default_neighbours() -> usize { 8 }
fn default_linear_interpolators() -> usize { 1 }
fn default_wrap_around() -> f64 { 1.0 }

impl Default for InterpolatorOptions {
    fn default() -> Self {
        Self {
            neighbours: default_neighbours(),
            linear_interpolators: default_linear_interpolators(),
            wrap_around: default_wrap_around(),
        }
    }
}

impl Root {
    pub fn from_toml_str(text: &str) -> Result<Self> {
        let cfg: Root =
            toml::from_str(text).map_err(|e| EngineError::Validation(e.to_string()))?;
        cfg.validate()?;
        Ok(cfg)
    }

    pub fn model_parameter_len(&self) -> usize {
        self.parameters.lower_bound.len()
    }

    /// Length of the vectors callers pass in.
    pub fn parameter_len(&self) -> usize {
        self.model_parameter_len() + usize::from(self.parameters.concentration_factor_included)
    }

    /// Length of a stored entry, which always carries the concentration factor.
    pub fn entry_len(&self) -> usize {
        self.model_parameter_len() + 1
    }

    /// Trajectory time slices per model year at the configured time step.
    pub fn time_dim(&self) -> usize {
        self.grid.t_dim / self.database.time_step as usize
    }

    pub fn entry_lower_bound(&self) -> Vec<f64> {
        let mut bound = self.parameters.lower_bound.clone();
        bound.push(0.0);
        bound
    }

    pub fn entry_upper_bound(&self) -> Vec<f64> {
        let mut bound = self.parameters.upper_bound.clone();
        bound.push(f64::INFINITY);
        bound
    }

    pub fn entry_typical_values(&self) -> Vec<f64> {
        let mut typical = self.parameters.typical_values.clone();
        typical.push(1.0);
        typical
    }

    pub fn entry_absolute_tolerance(&self) -> Vec<f64> {
        self.expand_tolerance(&self.tolerance.absolute, 1e-12)
    }

    pub fn entry_relative_tolerance(&self) -> Vec<f64> {
        self.expand_tolerance(&self.tolerance.relative, 0.0)
    }

    fn expand_tolerance(&self, tolerance: &Tolerance, factor_default: f64) -> Vec<f64> {
        match tolerance {
            Tolerance::Scalar(value) => vec![*value; self.entry_len()],
            Tolerance::PerComponent(values) if values.len() == 1 => {
                vec![values[0]; self.entry_len()]
            }
            Tolerance::PerComponent(values) => {
                let mut values = values.clone();
                if !self.parameters.concentration_factor_included {
                    values.push(factor_default);
                }
                values
            }
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.database.model_name.trim().is_empty() {
            bail!("database.model_name must not be empty");
        }
        if !TIME_STEPS.contains(&self.database.time_step) {
            bail!(
                "database.time_step is {} but must be one of {:?}",
                self.database.time_step,
                TIME_STEPS
            );
        }
        if self.database.tracers.is_empty() {
            bail!("database.tracers must name at least one tracer");
        }

        let n = self.model_parameter_len();
        if n == 0 {
            bail!("parameters.lower_bound must not be empty");
        }
        if self.parameters.upper_bound.len() != n || self.parameters.typical_values.len() != n {
            bail!(
                "parameters.upper_bound ({}) and parameters.typical_values ({}) must have length {}",
                self.parameters.upper_bound.len(),
                self.parameters.typical_values.len(),
                n
            );
        }
        for (i, (lo, hi)) in self
            .parameters
            .lower_bound
            .iter()
            .zip(&self.parameters.upper_bound)
            .enumerate()
        {
            if lo > hi {
                bail!("parameters.lower_bound[{}] = {} exceeds upper bound {}", i, lo, hi);
            }
        }
        if let Some(i) = self.parameters.typical_values.iter().position(|v| *v <= 0.0) {
            bail!(
                "parameters.typical_values[{}] = {} must be positive",
                i,
                self.parameters.typical_values[i]
            );
        }

        for (name, tolerance) in [
            ("tolerance.absolute", &self.tolerance.absolute),
            ("tolerance.relative", &self.tolerance.relative),
        ] {
            let values = match tolerance {
                Tolerance::Scalar(value) => vec![*value],
                Tolerance::PerComponent(values) => values.clone(),
            };
            if values.len() != 1 && values.len() != self.parameter_len() {
                bail!(
                    "{} has length {} but must be a scalar or have length {}",
                    name,
                    values.len(),
                    self.parameter_len()
                );
            }
            if values.iter().any(|v| *v < 0.0 || !v.is_finite()) {
                bail!("{} must be finite and non-negative", name);
            }
        }
        if self.tolerance.reliable_decimal_places > 17 {
            bail!("tolerance.reliable_decimal_places must be in [0, 17]");
        }

        if self.spinup.tolerance < 0.0 {
            bail!("spinup.tolerance must be non-negative");
        }
        if self.spinup.max_years == 0 {
            bail!("spinup.max_years must be positive");
        }

        if !(1..=2).contains(&self.derivative.accuracy_order) {
            bail!(
                "derivative.accuracy_order is {} but must be in {{1, 2}}",
                self.derivative.accuracy_order
            );
        }
        if !(self.derivative.step_size > 0.0) {
            bail!("derivative.step_size must be positive");
        }
        if self.derivative.years == 0 {
            bail!("derivative.years must be positive");
        }

        let grid = &self.grid;
        if grid.t_dim == 0 || grid.x_dim == 0 || grid.y_dim == 0 || grid.z_dim == 0 {
            bail!("grid dimensions must be positive");
        }
        if grid.t_dim % self.database.time_step as usize != 0 {
            bail!(
                "grid.t_dim {} is not divisible by database.time_step {}",
                grid.t_dim,
                self.database.time_step
            );
        }
        if !grid.depth_bounds.is_empty() {
            if grid.depth_bounds.len() != grid.z_dim + 1 {
                bail!("grid.depth_bounds must have z_dim + 1 = {} values", grid.z_dim + 1);
            }
            if grid.depth_bounds.windows(2).any(|w| w[0] >= w[1]) {
                bail!("grid.depth_bounds must be strictly increasing");
            }
        }

        if self.interpolator.neighbours == 0 {
            bail!("interpolator.neighbours must be >= 1");
        }
        if self.interpolator.wrap_around < 0.0 {
            bail!("interpolator.wrap_around must be non-negative");
        }

        Ok(())
    }
}
