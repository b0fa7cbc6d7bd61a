//! Finding or producing a spinup run that satisfies a convergence target.
//!
//! A chain of runs is extended one run at a time. Run `k + 1` is launched only
//! after run `k` has been observed finished, and every wait on the batch system
//! happens in this module, never inside path or accessor helpers.
//!
//! An AND target is resolved as two OR sub-goals evaluated in sequence: the
//! year goal `{years, 0}` and then the tolerance goal `{max_years, tolerance}`
//! on top of the run the year goal produced.

use crate::config::{Combination, JobKind, JobSetup, Root, SpinupOptions};
use crate::error::{EngineError, Result, StaleStateWarning};
use crate::index::ParameterIndex;
use crate::job::{BatchSystem, Job, JobDescription, JobReport};
use crate::parameters::ParameterSpace;
use crate::paths::{last_run_dir, make_new_run_dir, run_dir, run_number, Layout};
use crate::store::Store;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Target {
    pub years: u32,
    pub tolerance: f64,
    pub combination: Combination,
}

impl Target {
    pub fn or(years: u32, tolerance: f64) -> Self {
        Self {
            years,
            tolerance,
            combination: Combination::Or,
        }
    }

    pub fn and(years: u32, tolerance: f64) -> Self {
        Self {
            years,
            tolerance,
            combination: Combination::And,
        }
    }

    fn check(&self) -> Result<()> {
        if !(self.tolerance >= 0.0) || !self.tolerance.is_finite() {
            return Err(EngineError::Validation(format!(
                "target tolerance is {} but must be finite and >= 0",
                self.tolerance
            )));
        }
        Ok(())
    }
}

impl From<&SpinupOptions> for Target {
    fn from(options: &SpinupOptions) -> Self {
        Self {
            years: options.years,
            tolerance: options.tolerance,
            combination: options.combination,
        }
    }
}

/// A run satisfying a target, with the warning if it only did so through the year cap.
#[derive(Debug, Clone, PartialEq)]
pub struct Matched {
    pub run: PathBuf,
    pub warning: Option<StaleStateWarning>,
}

#[derive(Debug, Clone, PartialEq)]
enum Verdict {
    Unsatisfied,
    Satisfied,
    CapReached(StaleStateWarning),
}

/// A new run to append to a chain.
#[derive(Debug, Clone)]
pub struct RunRequest<'r> {
    pub chain: &'r Path,
    pub parameters: Vec<f64>,
    pub concentration_factor: f64,
    pub years: u32,
    pub tolerance: f64,
    pub tracer_input_dir: Option<PathBuf>,
    pub setup: JobSetup,
}

pub struct SpinupEngine<'a> {
    store: &'a dyn Store,
    batch: &'a dyn BatchSystem,
    cfg: &'a Root,
    layout: &'a Layout,
    index: &'a ParameterIndex,
}

impl<'a> SpinupEngine<'a> {
    pub fn new(
        store: &'a dyn Store,
        batch: &'a dyn BatchSystem,
        cfg: &'a Root,
        layout: &'a Layout,
        index: &'a ParameterIndex,
    ) -> Self {
        Self {
            store,
            batch,
            cfg,
            layout,
            index,
        }
    }

    pub fn store(&self) -> &'a dyn Store {
        self.store
    }

    pub fn batch(&self) -> &'a dyn BatchSystem {
        self.batch
    }

    pub fn layout(&self) -> &'a Layout {
        self.layout
    }

    /// Index of the parameter set for `entry`, created if `create` is set.
    pub fn parameter_set(&self, entry: &[f64], create: bool) -> Result<Option<usize>> {
        if let Some(index) = self.index.index_of(self.store, entry)? {
            return Ok(Some(index));
        }
        if !create {
            return Ok(None);
        }
        match self.index.add(self.store, entry) {
            Ok(index) => {
                self.store.create_dir_all(&self.layout.spinup_dir(index))?;
                Ok(Some(index))
            }
            // another entry matched in the meantime, use it
            Err(EngineError::AlreadyIndexed(index)) => Ok(Some(index)),
            Err(e) => Err(e),
        }
    }

    pub fn last_run(&self, index: usize) -> Result<Option<PathBuf>> {
        last_run_dir(self.store, &self.layout.spinup_dir(index))
    }

    /// Years simulated by `run` and all its predecessors in the chain.
    pub fn total_years(&self, run: &Path) -> Result<u32> {
        let number = run_number(run).ok_or_else(|| {
            EngineError::Validation(format!("{} is not a run directory", run.display()))
        })?;
        let chain = run.parent().unwrap_or_else(|| Path::new(""));
        let mut total = 0;
        for k in 0..=number {
            total += Job::open_forced(self.store, run_dir(chain, k)).last_year()?;
        }
        Ok(total)
    }

    /// Blocks until the job in `run` has finished and protects its outputs.
    /// Jobs that reported before the wait still go through the batch system
    /// so it can release what it tracks for them.
    pub fn wait_until_run_job_finished(&self, run: &Path) -> Result<JobReport> {
        let job = Job::open(self.store, run)?;
        let waited = job.wait_until_finished(self.batch);
        if job.is_finished()? {
            job.mark_outputs_read_only(true)?;
        }
        let report = waited?;
        if !report.succeeded() {
            return Err(EngineError::ExternalJobFailure {
                dir: run.to_path_buf(),
                diagnostic: report.diagnostic,
            });
        }
        Ok(report)
    }

    /// Allocates the next run directory of the chain, writes its description
    /// and hands it to the batch system without waiting.
    pub fn start_run(&self, request: RunRequest<'_>) -> Result<PathBuf> {
        let dir = make_new_run_dir(self.store, request.chain)?;
        let mut job = Job::new(self.store, &dir);
        job.write_description(JobDescription {
            model_name: self.cfg.database.model_name.clone(),
            parameters: request.parameters,
            years: request.years,
            tolerance: request.tolerance,
            time_step: self.cfg.database.time_step,
            concentration_factor: request.concentration_factor,
            write_trajectory: false,
            tracer_input_dir: request.tracer_input_dir,
            setup: request.setup,
        })?;
        job.mark_inputs_read_only(true)?;
        job.launch(self.batch)?;
        Ok(dir)
    }

    fn evaluate(&self, run: &Path, target: &Target) -> Result<Verdict> {
        let years = self.total_years(run)?;
        let tolerance = Job::open(self.store, run)?.last_tolerance()?;
        let verdict = match target.combination {
            Combination::Or if years >= target.years || tolerance <= target.tolerance => {
                Verdict::Satisfied
            }
            Combination::Or => Verdict::Unsatisfied,
            Combination::And if years >= target.years && tolerance <= target.tolerance => {
                Verdict::Satisfied
            }
            Combination::And if years >= self.cfg.spinup.max_years => {
                Verdict::CapReached(StaleStateWarning::YearCapReached {
                    run: run.to_path_buf(),
                    years,
                    cap: self.cfg.spinup.max_years,
                    reached_tolerance: tolerance,
                    target_tolerance: target.tolerance,
                })
            }
            Combination::And => Verdict::Unsatisfied,
        };
        debug!(run = %run.display(), years, tolerance, ?verdict, "evaluated run");
        Ok(verdict)
    }

    /// Last run of the closest other parameter set whose last run has finished.
    fn closest_finished_run(&self, index: usize) -> Result<Option<PathBuf>> {
        let entry = self.index.value(self.store, index)?;
        for other in self.index.closest_indices(self.store, &entry)? {
            if other == index {
                continue;
            }
            let Some(last) = self.last_run(other)? else {
                continue;
            };
            let job = Job::open_forced(self.store, &last);
            if job.report().is_ok_and(|r| r.succeeded()) {
                return Ok(Some(last));
            }
        }
        Ok(None)
    }

    /// A run of the spinup chain of `index` satisfying `target`, extending the
    /// chain as needed. `None` only for an empty chain and a zero-year target.
    pub fn matching_run(&self, index: usize, target: &Target) -> Result<Option<Matched>> {
        target.check()?;
        let matched = match target.combination {
            Combination::Or => self.year_or_tolerance(index, target.years, target.tolerance)?.map(|run| Matched {
                run,
                warning: None,
            }),
            Combination::And => self.years_and_tolerance(index, target)?,
        };
        if let Some(Matched {
            warning: Some(warning),
            ..
        }) = &matched
        {
            warn!("{}", warning);
        }
        Ok(matched)
    }

    fn years_and_tolerance(&self, index: usize, target: &Target) -> Result<Option<Matched>> {
        let chain = self.layout.spinup_dir(index);
        let verdict_of = |run: PathBuf| -> Result<Option<Matched>> {
            match self.evaluate(&run, target)? {
                Verdict::Satisfied => Ok(Some(Matched { run, warning: None })),
                Verdict::CapReached(warning) => Ok(Some(Matched {
                    run,
                    warning: Some(warning),
                })),
                Verdict::Unsatisfied => Ok(None),
            }
        };

        if let Some(last) = last_run_dir(self.store, &chain)? {
            self.wait_until_run_job_finished(&last)?;
            if let Some(matched) = verdict_of(last)? {
                debug!(run = %matched.run.display(), "AND target already satisfied");
                return Ok(Some(matched));
            }
        }

        // year goal, then tolerance goal on top of the run it produced
        let year_run = self.year_or_tolerance(index, target.years, 0.0)?;
        debug!(run = ?year_run, "year goal reached");
        let Some(run) = self.year_or_tolerance(index, self.cfg.spinup.max_years, target.tolerance)? else {
            return Ok(None);
        };
        match verdict_of(run.clone())? {
            Some(matched) => Ok(Some(matched)),
            None => Err(EngineError::ExternalJobFailure {
                dir: run,
                diagnostic: "run finished without reaching the year or tolerance target".to_string(),
            }),
        }
    }

    fn year_or_tolerance(&self, index: usize, years: u32, tolerance: f64) -> Result<Option<PathBuf>> {
        let chain = self.layout.spinup_dir(index);
        let target = Target::or(years, tolerance);
        let mut launched: Option<PathBuf> = None;
        loop {
            let Some(last) = last_run_dir(self.store, &chain)? else {
                if years == 0 {
                    return Ok(None);
                }
                let seed = if self.cfg.spinup.start_from_closest {
                    self.closest_finished_run(index)?
                } else {
                    None
                };
                if let Some(seed) = &seed {
                    info!(index, seed = %seed.display(), "seeding chain from closest parameter set");
                }
                let run = self.append_run(index, &chain, years, tolerance, seed)?;
                self.wait_until_run_job_finished(&run)?;
                launched = Some(run);
                continue;
            };

            self.wait_until_run_job_finished(&last)?;
            if self.evaluate(&last, &target)? == Verdict::Satisfied {
                if launched.is_none() {
                    info!(run = %last.display(), "reusing run");
                }
                return Ok(Some(last));
            }
            if launched.as_ref() == Some(&last) && Job::open(self.store, &last)?.last_year()? == 0 {
                return Err(EngineError::ExternalJobFailure {
                    dir: last,
                    diagnostic: "job finished without simulating any year".to_string(),
                });
            }

            let remaining = years.saturating_sub(self.total_years(&last)?);
            let run = self.append_run(index, &chain, remaining, tolerance, Some(last))?;
            self.wait_until_run_job_finished(&run)?;
            launched = Some(run);
        }
    }

    /// The concentration factor only scales the initial state of a chain
    /// started from scratch.
    fn append_run(
        &self,
        index: usize,
        chain: &Path,
        years: u32,
        tolerance: f64,
        input: Option<PathBuf>,
    ) -> Result<PathBuf> {
        let entry = self.index.value(self.store, index)?;
        let split = ParameterSpace::split_entry(&entry);
        let concentration_factor = if input.is_none() {
            split.concentration_factor
        } else {
            1.0
        };
        self.start_run(RunRequest {
            chain,
            parameters: split.model,
            concentration_factor,
            years,
            tolerance,
            tracer_input_dir: input,
            setup: self.cfg.job.setup(JobKind::Spinup),
        })
    }
}
