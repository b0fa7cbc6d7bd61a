//! Finite-difference derivatives from perturbed spinup chains.
//!
//! Every perturbed parameter gets its own chain below
//! `derivative/step_<s>/param_<i>_sign_<±1>/`, seeded from a base run of the
//! parameter set's spinup chain and continued for the configured derivative
//! years. All perturbation runs are launched before the first one is awaited.

use crate::config::{DerivativeOptions, JobKind, Root};
use crate::error::{EngineError, Result};
use crate::job::Job;
use crate::parameters::ParameterSpace;
use crate::paths::{last_run_dir, previous_run_dir, run_dir};
use crate::spinup::{RunRequest, SpinupEngine, Target};
use ndarray::{stack, ArrayD, ArrayView, Axis, IxDyn};
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

/// Relative deviation tolerated between stored and expected perturbed values.
const PARAMETER_MATCH: f64 = 1e-12;

/// One evaluation point of a finite difference.
#[derive(Debug, Clone, PartialEq)]
pub struct Perturbation {
    /// Position in the stored entry.
    pub parameter: usize,
    /// Nominal side, +1 forward and -1 backward. Names the chain directory.
    pub side: i32,
    /// Realized step, the actual difference to the unperturbed value.
    pub h: f64,
    pub entry: Vec<f64>,
}

/// Launched perturbation runs of one derivative evaluation.
#[derive(Debug, Clone)]
pub struct DerivativePlan {
    pub base_run: PathBuf,
    /// Per active parameter one (order 1) or two (order 2) runs.
    pub runs: Vec<Vec<(Perturbation, PathBuf)>>,
}

pub struct DerivativeScheduler<'a> {
    engine: &'a SpinupEngine<'a>,
    cfg: &'a Root,
    options: DerivativeOptions,
}

impl<'a> DerivativeScheduler<'a> {
    pub fn new(engine: &'a SpinupEngine<'a>, cfg: &'a Root, options: DerivativeOptions) -> Self {
        Self {
            engine,
            cfg,
            options,
        }
    }

    fn check(&self, entry: &[f64], mask: &[bool]) -> Result<()> {
        if !(1..=2).contains(&self.options.accuracy_order) {
            return Err(EngineError::Validation(format!(
                "accuracy order is {} but must be in {{1, 2}}",
                self.options.accuracy_order
            )));
        }
        if mask.len() != entry.len() {
            return Err(EngineError::Validation(format!(
                "mask has length {} but the parameters have length {}",
                mask.len(),
                entry.len()
            )));
        }
        if !mask.iter().any(|m| *m) {
            return Err(EngineError::Validation(
                "mask selects no parameter".to_string(),
            ));
        }
        if self.options.years == 0 {
            return Err(EngineError::Validation(
                "derivative years must be positive".to_string(),
            ));
        }
        Ok(())
    }

    /// Evaluation points for every masked parameter of `entry`, in mask order.
    ///
    /// Order 1 steps forward and reflects the step if that leaves the bounds.
    /// Order 2 steps both ways and clamps into the bounds; a side left with a
    /// zero step because the parameter sits on that bound is reflected to half
    /// the nominal step on the other side.
    ///
    /// Perturbation runs continue from the base run, whose initial state was
    /// already scaled by the concentration factor, so the steps are taken from
    /// `entry` with the factor reset to 1.
    pub fn perturbations(&self, entry: &[f64], mask: &[bool]) -> Result<Vec<Vec<Perturbation>>> {
        self.check(entry, mask)?;
        let mut start = entry.to_vec();
        if let Some(factor) = start.last_mut() {
            *factor = 1.0;
        }
        let entry = start.as_slice();
        let lower = self.cfg.entry_lower_bound();
        let upper = self.cfg.entry_upper_bound();
        let typical = self.cfg.entry_typical_values();

        let mut result = Vec::new();
        for (i, _) in mask.iter().enumerate().filter(|(_, m)| **m) {
            let nominal = typical[i] * self.options.step_size;
            let inside = |v: f64| v >= lower[i] && v <= upper[i];
            let clamp = |v: f64| v.clamp(lower[i], upper[i]);
            let point = |side: i32, value: f64| -> Result<Perturbation> {
                let h = value - entry[i];
                if h == 0.0 {
                    return Err(EngineError::Validation(format!(
                        "parameter {} = {} cannot be perturbed within [{}, {}]",
                        i, entry[i], lower[i], upper[i]
                    )));
                }
                let mut perturbed = entry.to_vec();
                perturbed[i] = value;
                Ok(Perturbation {
                    parameter: i,
                    side,
                    h,
                    entry: perturbed,
                })
            };

            let points = if self.options.accuracy_order == 1 {
                let forward = entry[i] + nominal;
                let value = if inside(forward) {
                    forward
                } else {
                    clamp(entry[i] - nominal)
                };
                vec![point(1, value)?]
            } else {
                let mut forward = clamp(entry[i] + nominal);
                let mut backward = clamp(entry[i] - nominal);
                if backward == entry[i] {
                    backward = clamp(entry[i] + 0.5 * nominal);
                } else if forward == entry[i] {
                    forward = clamp(entry[i] - 0.5 * nominal);
                }
                vec![point(1, forward)?, point(-1, backward)?]
            };
            let steps: Vec<f64> = points.iter().map(|p| p.h).collect();
            debug!(parameter = i, ?steps, "perturbation steps");
            result.push(points);
        }
        Ok(result)
    }

    /// Base run of the derivative: the spinup run `derivative years` short of `target`.
    fn base_run(&self, index: usize, target: &Target) -> Result<PathBuf> {
        let base_target = Target {
            years: target.years.saturating_sub(self.options.years),
            ..*target
        };
        let matched = self.engine.matching_run(index, &base_target)?.ok_or_else(|| {
            EngineError::Validation(format!(
                "spinup years {} leave no base run for derivative years {}",
                target.years, self.options.years
            ))
        })?;
        let mut base = matched.run;

        if self.options.accuracy_order == 1 {
            if let Some(previous) = previous_run_dir(&base) {
                let years = self.engine.total_years(&base)?;
                if self.engine.total_years(&previous)? + self.options.years == years {
                    debug!(run = %previous.display(), "base collapses onto previous run");
                    base = previous;
                }
            }
        }
        Ok(base)
    }

    /// Run of the base chain continued `derivative years` past the base run.
    pub fn value_run(&self, index: usize, plan: &DerivativePlan) -> Result<PathBuf> {
        let years = self.engine.total_years(&plan.base_run)? + self.options.years;
        let matched = self
            .engine
            .matching_run(index, &Target::or(years, 0.0))?
            .ok_or_else(|| EngineError::NotFound(format!("no run with {} years", years)))?;
        Ok(matched.run)
    }

    fn is_reusable(&self, chain: &Path, base: &Path, perturbation: &Perturbation) -> Result<bool> {
        let store = self.engine.store();
        let Some(last) = last_run_dir(store, chain)? else {
            return Ok(false);
        };
        let first = Job::open_forced(store, run_dir(chain, 0));
        let Ok(description) = first.description() else {
            return Ok(false);
        };
        if description.tracer_input_dir.as_deref() != Some(base) {
            return Ok(false);
        }
        let expected = ParameterSpace::split_entry(&perturbation.entry);
        let same = |a: f64, b: f64| (a - b).abs() <= PARAMETER_MATCH * a.abs().max(b.abs()).max(1.0);
        if description.parameters.len() != expected.model.len()
            || !description
                .parameters
                .iter()
                .zip(&expected.model)
                .all(|(a, b)| same(*a, *b))
            || !same(description.concentration_factor, expected.concentration_factor)
        {
            return Ok(false);
        }

        // unfinished runs are judged by the years they were asked for
        let last_job = Job::open_forced(store, &last);
        let years = if last_job.is_finished()? {
            let report = last_job.report()?;
            if !report.succeeded() {
                return Ok(false);
            }
            self.engine.total_years(&last)?
        } else {
            let requested = last_job.description().map(|d| d.years).unwrap_or(0);
            match previous_run_dir(&last) {
                Some(previous) => self.engine.total_years(&previous)? + requested,
                None => requested,
            }
        };
        Ok(years >= self.options.years)
    }

    /// Resolves the base run and launches, or reuses, every perturbation run
    /// without waiting on any of them.
    pub fn launch(&self, index: usize, entry: &[f64], mask: &[bool], target: &Target) -> Result<DerivativePlan> {
        let perturbations = self.perturbations(entry, mask)?;
        let base_run = self.base_run(index, target)?;
        let layout = self.engine.layout();
        let store = self.engine.store();

        let mut runs = Vec::with_capacity(perturbations.len());
        for points in perturbations {
            let mut launched = Vec::with_capacity(points.len());
            for perturbation in points {
                let chain = layout.partial_derivative_dir(
                    index,
                    self.options.step_size,
                    perturbation.parameter,
                    perturbation.side,
                );
                let run = if self.is_reusable(&chain, &base_run, &perturbation)? {
                    let run = last_run_dir(store, &chain)?
                        .ok_or_else(|| EngineError::NotFound(format!("no run in {}", chain.display())))?;
                    info!(run = %run.display(), "reusing perturbation run");
                    run
                } else {
                    if store.exists(&chain) {
                        warn!(chain = %chain.display(), "replacing stale perturbation run");
                    }
                    store.remove_contents(&chain)?;
                    let split = ParameterSpace::split_entry(&perturbation.entry);
                    self.engine.start_run(RunRequest {
                        chain: &chain,
                        parameters: split.model,
                        concentration_factor: split.concentration_factor,
                        years: self.options.years,
                        tolerance: 0.0,
                        tracer_input_dir: Some(base_run.clone()),
                        setup: self.cfg.job.setup(JobKind::Derivative),
                    })?
                };
                launched.push((perturbation, run));
            }
            runs.push(launched);
        }
        Ok(DerivativePlan { base_run, runs })
    }

    /// Derivative arrays per tracer with the active parameters stacked on axis 0.
    ///
    /// `extract` turns a finished run into one array per tracer.
    pub fn derivative<F>(
        &self,
        index: usize,
        entry: &[f64],
        mask: &[bool],
        target: &Target,
        mut extract: F,
    ) -> Result<Vec<ArrayD<f64>>>
    where
        F: FnMut(&Path) -> Result<Vec<ArrayD<f64>>>,
    {
        let plan = self.launch(index, entry, mask, target)?;
        let value = if self.options.accuracy_order == 1 {
            let run = self.value_run(index, &plan)?;
            Some(extract(&run)?)
        } else {
            None
        };

        let mut per_parameter: Vec<Vec<ArrayD<f64>>> = Vec::with_capacity(plan.runs.len());
        for points in &plan.runs {
            let mut evaluated = Vec::with_capacity(points.len());
            for (perturbation, run) in points {
                self.engine.wait_until_run_job_finished(run)?;
                evaluated.push((perturbation.h, extract(run)?));
            }
            per_parameter.push(combine(value.as_deref(), &evaluated)?);
        }

        let tracers = per_parameter.first().map(Vec::len).unwrap_or(0);
        (0..tracers)
            .map(|q| {
                let views: Vec<ArrayView<f64, IxDyn>> =
                    per_parameter.iter().map(|d| d[q].view()).collect();
                stack(Axis(0), &views).map_err(|e| EngineError::Validation(e.to_string()))
            })
            .collect()
    }
}

/// Finite difference per tracer for one parameter.
fn combine(value: Option<&[ArrayD<f64>]>, evaluated: &[(f64, Vec<ArrayD<f64>>)]) -> Result<Vec<ArrayD<f64>>> {
    match (evaluated, value) {
        ([(h, perturbed)], Some(value)) => Ok(perturbed
            .iter()
            .zip(value)
            .map(|(p, f)| (p - f) / *h)
            .collect()),
        ([(h_forward, forward), (h_backward, backward)], _) => Ok(forward
            .iter()
            .zip(backward)
            .map(|(f, b)| (f - b) / (h_forward - h_backward))
            .collect()),
        _ => Err(EngineError::Validation(
            "finite difference needs one step with a base value or two steps".to_string(),
        )),
    }
}
