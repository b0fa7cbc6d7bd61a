//! One external simulation invocation bound to a run directory.
//!
//! The run directory holds the job description written before launch and the
//! report the executing side writes on completion. Jobs are identified by
//! their run directory only.

use crate::config::JobSetup;
use crate::error::{EngineError, Result};
use crate::store::{read_string, Store};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tracing::{debug, info};

pub const JOB_OPTIONS_FILE: &str = "job_options.json";
pub const JOB_REPORT_FILE: &str = "job_report.json";
/// Subdirectory with one trajectory file per tracer.
pub const TRAJECTORY_DIR: &str = "trajectory";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobDescription {
    pub model_name: String,
    /// Model parameters without the concentration factor.
    pub parameters: Vec<f64>,
    pub years: u32,
    pub tolerance: f64,
    pub time_step: u32,
    /// Scales the initial tracer state; 1 when continuing a chain.
    pub concentration_factor: f64,
    pub write_trajectory: bool,
    /// Run whose final tracer state is the initial state of this job.
    pub tracer_input_dir: Option<PathBuf>,
    pub setup: JobSetup,
}

/// Written by the executing side once the job has terminated.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobReport {
    pub exit_code: i32,
    /// Years simulated by this job alone.
    pub last_year: u32,
    /// Convergence tolerance reached in the last simulated year.
    pub last_tolerance: f64,
    #[serde(default)]
    pub diagnostic: String,
}

impl JobReport {
    pub fn succeeded(&self) -> bool {
        self.exit_code == 0
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum JobState {
    Running,
    Finished(JobReport),
    Failed(String),
}

/// Contract the engine needs from the batch system.
pub trait BatchSystem {
    /// Hands the job to the batch system without waiting for it.
    fn submit(&self, store: &dyn Store, run: &Path, description: &JobDescription) -> Result<()>;

    fn poll(&self, store: &dyn Store, run: &Path) -> Result<JobState>;

    /// Blocks until the job terminates. A failed job is an `ExternalJobFailure`.
    fn wait(&self, store: &dyn Store, run: &Path) -> Result<JobReport>;
}

pub fn read_report(store: &dyn Store, run: &Path) -> Result<Option<JobReport>> {
    let path = run.join(JOB_REPORT_FILE);
    match read_string(store, &path)? {
        Some(text) => serde_json::from_str(&text)
            .map(Some)
            .map_err(|e| EngineError::format(path, e.to_string())),
        None => Ok(None),
    }
}

pub fn write_report(store: &dyn Store, run: &Path, report: &JobReport) -> Result<()> {
    let path = run.join(JOB_REPORT_FILE);
    let text =
        serde_json::to_string_pretty(report).map_err(|e| EngineError::format(&path, e.to_string()))?;
    store.write(&path, text.as_bytes())
}

pub struct Job<'a> {
    store: &'a dyn Store,
    dir: PathBuf,
    description: Option<JobDescription>,
}

impl<'a> Job<'a> {
    /// Handle on a fresh run directory without a description yet.
    pub fn new(store: &'a dyn Store, dir: impl Into<PathBuf>) -> Self {
        Self {
            store,
            dir: dir.into(),
            description: None,
        }
    }

    /// Fails with `NotFound` if the directory holds no description.
    pub fn open(store: &'a dyn Store, dir: impl Into<PathBuf>) -> Result<Self> {
        let dir = dir.into();
        let description = Self::load_description(store, &dir)?.ok_or_else(|| {
            EngineError::NotFound(format!("no job description in {}", dir.display()))
        })?;
        Ok(Self {
            store,
            dir,
            description: Some(description),
        })
    }

    /// Tolerant open for read-side inspection; a missing or unreadable
    /// description surfaces as `NotFound` from the accessors instead.
    pub fn open_forced(store: &'a dyn Store, dir: impl Into<PathBuf>) -> Self {
        let dir = dir.into();
        let description = match Self::load_description(store, &dir) {
            Ok(description) => description,
            Err(e) => {
                debug!(run = %dir.display(), error = %e, "ignoring unreadable job description");
                None
            }
        };
        Self {
            store,
            dir,
            description,
        }
    }

    fn load_description(store: &dyn Store, dir: &Path) -> Result<Option<JobDescription>> {
        let path = dir.join(JOB_OPTIONS_FILE);
        match read_string(store, &path)? {
            Some(text) => serde_json::from_str(&text)
                .map(Some)
                .map_err(|e| EngineError::format(path, e.to_string())),
            None => Ok(None),
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn write_description(&mut self, description: JobDescription) -> Result<()> {
        let path = self.dir.join(JOB_OPTIONS_FILE);
        let text = serde_json::to_string_pretty(&description)
            .map_err(|e| EngineError::format(&path, e.to_string()))?;
        self.store.write(&path, text.as_bytes())?;
        debug!(run = %self.dir.display(), years = description.years, "job description written");
        self.description = Some(description);
        Ok(())
    }

    pub fn description(&self) -> Result<&JobDescription> {
        self.description.as_ref().ok_or_else(|| {
            EngineError::NotFound(format!("no job description in {}", self.dir.display()))
        })
    }

    pub fn launch(&self, batch: &dyn BatchSystem) -> Result<()> {
        let description = self.description()?;
        info!(
            run = %self.dir.display(),
            years = description.years,
            tolerance = description.tolerance,
            "launching job"
        );
        batch.submit(self.store, &self.dir, description)
    }

    pub fn wait_until_finished(&self, batch: &dyn BatchSystem) -> Result<JobReport> {
        debug!(run = %self.dir.display(), "waiting for job");
        batch.wait(self.store, &self.dir)
    }

    pub fn is_finished(&self) -> Result<bool> {
        Ok(read_report(self.store, &self.dir)?.is_some())
    }

    pub fn report(&self) -> Result<JobReport> {
        read_report(self.store, &self.dir)?.ok_or_else(|| {
            EngineError::NotFound(format!("job in {} has not finished", self.dir.display()))
        })
    }

    pub fn last_year(&self) -> Result<u32> {
        Ok(self.report()?.last_year)
    }

    pub fn last_tolerance(&self) -> Result<f64> {
        Ok(self.report()?.last_tolerance)
    }

    pub fn time_step(&self) -> Result<u32> {
        Ok(self.description()?.time_step)
    }

    pub fn tracer_input_dir(&self) -> Result<Option<&Path>> {
        Ok(self.description()?.tracer_input_dir.as_deref())
    }

    pub fn mark_inputs_read_only(&self, read_only: bool) -> Result<()> {
        let path = self.dir.join(JOB_OPTIONS_FILE);
        if self.store.exists(&path) {
            self.store.set_read_only(&path, read_only)?;
        }
        Ok(())
    }

    /// Everything in the run directory except the description.
    pub fn mark_outputs_read_only(&self, read_only: bool) -> Result<()> {
        let mut pending = vec![self.dir.clone()];
        while let Some(dir) = pending.pop() {
            for name in self.store.list_files(&dir)? {
                let path = dir.join(&name);
                if path != self.dir.join(JOB_OPTIONS_FILE) {
                    self.store.set_read_only(&path, read_only)?;
                }
            }
            for name in self.store.list_dirs(&dir)? {
                pending.push(dir.join(name));
            }
        }
        Ok(())
    }
}
