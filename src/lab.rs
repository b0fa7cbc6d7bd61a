//! In-process synthetic ocean model behind the batch system contract.
//!
//! Each tracer relaxes towards a steady level that is affine in the model
//! parameters,
//!
//! ```text
//! level(years) = steady(p) + (factor * input - steady(p)) * decay^years
//! steady_q(p)  = offset_q + sum_i slope_q,i * p_i
//! ```
//!
//! and the reported convergence tolerance is a function of the total age of
//! the state. Jobs run when they are first polled or waited on, so tests can
//! observe the order of submissions and waits.

use crate::error::{EngineError, Result};
use crate::grid::{GridGeometry, LandSeaMask};
use crate::io::{write_trajectory, TrajectoryRow};
use crate::job::{
    read_report, write_report, BatchSystem, JobDescription, JobReport, JobState, JOB_REPORT_FILE,
};
use crate::store::{read_string, Store};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, PoisonError};
use tracing::debug;

pub const LAB_STATE_FILE: &str = "lab_state.json";

/// Final tracer state of a lab run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LabState {
    /// Years since the initial state, across donor chains.
    pub age: u32,
    pub levels: Vec<f64>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum LabEvent {
    Submit(PathBuf),
    Wait(PathBuf),
}

pub struct LabModel {
    pub offsets: Vec<f64>,
    /// `slopes[q][i]`: sensitivity of tracer `q` to model parameter `i`.
    pub slopes: Vec<Vec<f64>>,
    pub initial: Vec<f64>,
    pub decay: f64,
    /// Tolerance reached after a given total age.
    pub convergence: Box<dyn Fn(u32) -> f64 + Send + Sync>,
}

impl LabModel {
    /// Two tracers, tolerance `10^-age/10`.
    pub fn affine(parameter_len: usize) -> Self {
        Self {
            offsets: vec![2.0, 0.5],
            slopes: vec![
                (0..parameter_len).map(|i| 1.0 + i as f64).collect(),
                (0..parameter_len).map(|i| 0.5 - 0.25 * i as f64).collect(),
            ],
            initial: vec![2.0, 0.5],
            decay: 0.5,
            convergence: Box::new(|age| 10f64.powf(-(age as f64) / 10.0)),
        }
    }

    pub fn with_convergence(mut self, curve: impl Fn(u32) -> f64 + Send + Sync + 'static) -> Self {
        self.convergence = Box::new(curve);
        self
    }

    pub fn tracer_len(&self) -> usize {
        self.offsets.len()
    }

    pub fn steady(&self, parameters: &[f64]) -> Vec<f64> {
        self.offsets
            .iter()
            .zip(&self.slopes)
            .map(|(offset, slopes)| {
                offset + slopes.iter().zip(parameters).map(|(s, p)| s * p).sum::<f64>()
            })
            .collect()
    }

    /// Value of a trajectory cell for a tracer at `level`.
    pub fn cell_value(level: f64, [t, x, y, z]: [usize; 4]) -> f64 {
        level + 0.01 * (x + 2 * y + 3 * z) as f64 + 0.001 * t as f64
    }
}

pub struct LabBatch {
    model: LabModel,
    mask: LandSeaMask,
    pending: Mutex<HashMap<PathBuf, (JobDescription, bool)>>,
    events: Mutex<Vec<LabEvent>>,
    failing: Mutex<bool>,
}

impl LabBatch {
    /// `mask` sets the trajectory grid, its time dimension the slices per year.
    pub fn new(model: LabModel, mask: LandSeaMask) -> Self {
        Self {
            model,
            mask,
            pending: Mutex::new(HashMap::new()),
            events: Mutex::new(Vec::new()),
            failing: Mutex::new(false),
        }
    }

    pub fn model(&self) -> &LabModel {
        &self.model
    }

    /// Jobs submitted while failing is set report a failure.
    pub fn set_failing(&self, failing: bool) {
        *self.failing.lock().unwrap_or_else(PoisonError::into_inner) = failing;
    }

    pub fn events(&self) -> Vec<LabEvent> {
        self.events.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }

    pub fn submissions(&self) -> usize {
        self.events()
            .iter()
            .filter(|e| matches!(e, LabEvent::Submit(_)))
            .count()
    }

    pub fn submitted_dirs(&self) -> Vec<PathBuf> {
        self.events()
            .into_iter()
            .filter_map(|e| match e {
                LabEvent::Submit(dir) => Some(dir),
                LabEvent::Wait(_) => None,
            })
            .collect()
    }

    fn record(&self, event: LabEvent) {
        self.events
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(event);
    }

    fn read_state(store: &dyn Store, run: &Path) -> Result<Option<LabState>> {
        let path = run.join(LAB_STATE_FILE);
        match read_string(store, &path)? {
            Some(text) => serde_json::from_str(&text)
                .map(Some)
                .map_err(|e| EngineError::format(path, e.to_string())),
            None => Ok(None),
        }
    }

    fn execute(&self, store: &dyn Store, run: &Path, description: &JobDescription) -> Result<JobReport> {
        let input = match &description.tracer_input_dir {
            Some(dir) => match Self::read_state(store, dir)? {
                Some(state) => state,
                None => {
                    return Ok(JobReport {
                        exit_code: 1,
                        last_year: 0,
                        last_tolerance: 1.0,
                        diagnostic: format!("no tracer output in {}", dir.display()),
                    })
                }
            },
            None => LabState {
                age: 0,
                levels: self.model.initial.clone(),
            },
        };

        let mut age = input.age;
        let mut years = 0;
        while years < description.years {
            years += 1;
            age += 1;
            if description.tolerance > 0.0 && (self.model.convergence)(age) <= description.tolerance {
                break;
            }
        }

        let steady = self.model.steady(&description.parameters);
        let relax = self.model.decay.powi(years as i32);
        let levels: Vec<f64> = input
            .levels
            .iter()
            .zip(&steady)
            .map(|(level, s)| s + (description.concentration_factor * level - s) * relax)
            .collect();

        let state = LabState { age, levels };
        let text = serde_json::to_string(&state)
            .map_err(|e| EngineError::format(run.join(LAB_STATE_FILE), e.to_string()))?;
        store.write(&run.join(LAB_STATE_FILE), text.as_bytes())?;

        if description.write_trajectory {
            let [t_dim, ..] = self.mask.dims();
            for (q, level) in state.levels.iter().enumerate() {
                let rows = (0..t_dim).flat_map(|t| {
                    self.mask.ocean_cells().map(move |(x, y, z)| TrajectoryRow {
                        t,
                        x,
                        y,
                        z,
                        value: LabModel::cell_value(*level, [t, x, y, z]),
                    })
                });
                write_trajectory(store, run, q, rows)?;
            }
        }

        debug!(run = %run.display(), years, age, "lab job executed");
        Ok(JobReport {
            exit_code: 0,
            last_year: years,
            last_tolerance: (self.model.convergence)(age),
            diagnostic: String::new(),
        })
    }
}

impl BatchSystem for LabBatch {
    fn submit(&self, _store: &dyn Store, run: &Path, description: &JobDescription) -> Result<()> {
        self.record(LabEvent::Submit(run.to_path_buf()));
        let failing = *self.failing.lock().unwrap_or_else(PoisonError::into_inner);
        self.pending
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(run.to_path_buf(), (description.clone(), failing));
        Ok(())
    }

    fn poll(&self, store: &dyn Store, run: &Path) -> Result<JobState> {
        let pending = self
            .pending
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(run);
        // a report written by someone else settles the job
        let pending = pending.filter(|_| !store.exists(&run.join(JOB_REPORT_FILE)));
        if let Some((description, failing)) = pending {
            let report = if failing {
                JobReport {
                    exit_code: 137,
                    last_year: 0,
                    last_tolerance: 1.0,
                    diagnostic: format!("lab job in {} killed", run.display()),
                }
            } else {
                self.execute(store, run, &description)?
            };
            write_report(store, run, &report)?;
        }
        Ok(match read_report(store, run)? {
            Some(report) if report.succeeded() => JobState::Finished(report),
            Some(report) => JobState::Failed(report.diagnostic),
            None => JobState::Running,
        })
    }

    fn wait(&self, store: &dyn Store, run: &Path) -> Result<JobReport> {
        self.record(LabEvent::Wait(run.to_path_buf()));
        match self.poll(store, run)? {
            JobState::Finished(report) => Ok(report),
            JobState::Failed(diagnostic) => Err(EngineError::ExternalJobFailure {
                dir: run.to_path_buf(),
                diagnostic,
            }),
            JobState::Running => Err(EngineError::NotFound(format!(
                "no lab job was submitted for {}",
                run.display()
            ))),
        }
    }
}
