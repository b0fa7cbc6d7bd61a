//! Values and derivatives of the model output at parameter vectors.
//!
//! `Model` owns the parameter index, the land-sea mask and one interpolator
//! cache per tracer. Store and batch system are borrowed so the same facade
//! drives the file system backend and the in-memory lab backend.

use crate::config::Root;
use crate::derivative::DerivativeScheduler;
use crate::error::{EngineError, Result};
use crate::grid::LandSeaMask;
use crate::index::ParameterIndex;
use crate::interpolate::InterpolatorCache;
use crate::job::BatchSystem;
use crate::parameters::ParameterSpace;
use crate::paths::Layout;
use crate::spinup::{Matched, SpinupEngine, Target};
use crate::store::Store;
use crate::trajectory::{periods, TrajectoryReader};
use ndarray::ArrayD;
use std::path::{Path, PathBuf};
use tracing::{debug, info};

pub struct Model<'a> {
    cfg: Root,
    store: &'a dyn Store,
    batch: &'a dyn BatchSystem,
    layout: Layout,
    index: ParameterIndex,
    space: ParameterSpace,
    mask: LandSeaMask,
    caches: Vec<InterpolatorCache>,
}

impl<'a> Model<'a> {
    pub fn new(cfg: Root, store: &'a dyn Store, batch: &'a dyn BatchSystem) -> Result<Self> {
        cfg.validate()?;
        let layout = Layout::new(cfg.database.model_name.clone(), cfg.database.time_step);
        let mask = LandSeaMask::from_config(&cfg)?;
        let caches = (0..cfg.database.tracers.len())
            .map(|_| InterpolatorCache::new(cfg.interpolator.clone(), periods(&mask)))
            .collect();
        Ok(Self {
            index: ParameterIndex::new(&cfg, layout.clone()),
            space: ParameterSpace::new(&cfg),
            cfg,
            store,
            batch,
            layout,
            mask,
            caches,
        })
    }

    pub fn config(&self) -> &Root {
        &self.cfg
    }

    pub fn layout(&self) -> &Layout {
        &self.layout
    }

    pub fn mask(&self) -> &LandSeaMask {
        &self.mask
    }

    pub fn caches(&self) -> &[InterpolatorCache] {
        &self.caches
    }

    /// Spinup target from the configuration.
    pub fn target(&self) -> Target {
        Target::from(&self.cfg.spinup)
    }

    fn engine(&self) -> SpinupEngine<'_> {
        SpinupEngine::new(self.store, self.batch, &self.cfg, &self.layout, &self.index)
    }

    /// Parameter set index of `parameters`, created on demand.
    fn parameter_set(&self, parameters: &[f64], create: bool) -> Result<Option<usize>> {
        let entry = self.space.entry(parameters)?;
        self.engine().parameter_set(&entry, create)
    }

    fn require_parameter_set(&self, parameters: &[f64]) -> Result<(usize, Vec<f64>)> {
        let entry = self.space.entry(parameters)?;
        let index = self
            .engine()
            .parameter_set(&entry, true)?
            .ok_or_else(|| EngineError::NotFound(format!("no parameter set for {:?}", parameters)))?;
        Ok((index, entry))
    }

    pub fn parameter_set_dir(&self, parameters: &[f64], create: bool) -> Result<Option<PathBuf>> {
        Ok(self
            .parameter_set(parameters, create)?
            .map(|index| self.layout.parameter_set_dir(index)))
    }

    /// Directory of the stored parameter set nearest to `parameters`.
    pub fn closest_parameter_set_dir(&self, parameters: &[f64]) -> Result<Option<PathBuf>> {
        let entry = self.space.entry(parameters)?;
        Ok(self
            .index
            .closest_index(self.store, &entry)?
            .map(|index| self.layout.parameter_set_dir(index)))
    }

    pub fn matching_run(&self, parameters: &[f64], target: &Target) -> Result<Option<Matched>> {
        let (index, _) = self.require_parameter_set(parameters)?;
        self.engine().matching_run(index, target)
    }

    pub fn last_run(&self, parameters: &[f64]) -> Result<Option<PathBuf>> {
        match self.parameter_set(parameters, false)? {
            Some(index) => self.engine().last_run(index),
            None => Ok(None),
        }
    }

    pub fn total_years(&self, run: &Path) -> Result<u32> {
        self.engine().total_years(run)
    }

    fn spinup_run(&self, parameters: &[f64]) -> Result<(usize, PathBuf)> {
        let (index, _) = self.require_parameter_set(parameters)?;
        let target = self.target();
        let matched = self.engine().matching_run(index, &target)?.ok_or_else(|| {
            EngineError::Validation(format!(
                "spinup target {:?} asks for no run at all",
                target
            ))
        })?;
        debug!(index, run = %matched.run.display(), "spinup run for value");
        Ok((index, matched.run))
    }

    /// Model output per tracer on the full grid, `[t, x, y, z]` with NaN on land.
    pub fn f_boxes(&self, parameters: &[f64], time_dim: usize) -> Result<Vec<ArrayD<f64>>> {
        let (index, run) = self.spinup_run(parameters)?;
        let reader = TrajectoryReader::new(self.store, self.batch, &self.cfg, &self.mask);
        reader.extract_full(&run, &self.layout.trajectory_dir(index), time_dim)
    }

    /// Model output per tracer at `points[tracer]`, given as `[t, lon, lat, depth]`.
    pub fn f_points(&mut self, parameters: &[f64], points: &[Vec<[f64; 4]>]) -> Result<Vec<ArrayD<f64>>> {
        self.check_points(points)?;
        let (index, run) = self.spinup_run(parameters)?;
        let reader = TrajectoryReader::new(self.store, self.batch, &self.cfg, &self.mask);
        reader.extract_at_points(&run, &self.layout.trajectory_dir(index), points, &mut self.caches)
    }

    /// Derivative per tracer on the full grid, active parameters stacked on axis 0.
    pub fn df_boxes(
        &self,
        parameters: &[f64],
        time_dim: usize,
        mask: Option<&[bool]>,
    ) -> Result<Vec<ArrayD<f64>>> {
        let (index, entry, entry_mask) = self.derivative_input(parameters, mask)?;
        let scratch = self.layout.trajectory_dir(index);
        let engine = SpinupEngine::new(self.store, self.batch, &self.cfg, &self.layout, &self.index);
        let scheduler = DerivativeScheduler::new(&engine, &self.cfg, self.cfg.derivative.clone());
        let reader = TrajectoryReader::new(self.store, self.batch, &self.cfg, &self.mask);
        scheduler.derivative(index, &entry, &entry_mask, &self.target(), |run| {
            reader.extract_full(run, &scratch, time_dim)
        })
    }

    /// Derivative per tracer at `points[tracer]`, active parameters stacked on axis 0.
    pub fn df_points(
        &mut self,
        parameters: &[f64],
        points: &[Vec<[f64; 4]>],
        mask: Option<&[bool]>,
    ) -> Result<Vec<ArrayD<f64>>> {
        self.check_points(points)?;
        let (index, entry, entry_mask) = self.derivative_input(parameters, mask)?;
        let scratch = self.layout.trajectory_dir(index);
        let target = self.target();
        let engine = SpinupEngine::new(self.store, self.batch, &self.cfg, &self.layout, &self.index);
        let scheduler = DerivativeScheduler::new(&engine, &self.cfg, self.cfg.derivative.clone());
        let reader = TrajectoryReader::new(self.store, self.batch, &self.cfg, &self.mask);
        let caches = &mut self.caches;
        scheduler.derivative(index, &entry, &entry_mask, &target, |run| {
            reader.extract_at_points(run, &scratch, points, caches)
        })
    }

    fn check_points(&self, points: &[Vec<[f64; 4]>]) -> Result<()> {
        let tracers = self.cfg.database.tracers.len();
        if points.len() != tracers {
            return Err(EngineError::Validation(format!(
                "points given for {} tracers, the model has {}",
                points.len(),
                tracers
            )));
        }
        Ok(())
    }

    /// Parameter set, stored entry and the mask over the entry. A caller's
    /// mask covers the caller's vector; the stored concentration factor is
    /// never differentiated unless the caller passes it.
    fn derivative_input(
        &self,
        parameters: &[f64],
        mask: Option<&[bool]>,
    ) -> Result<(usize, Vec<f64>, Vec<bool>)> {
        let mut entry_mask = match mask {
            Some(mask) if mask.len() != self.space.len() => {
                return Err(EngineError::Validation(format!(
                    "mask has length {} but the parameters have length {}",
                    mask.len(),
                    self.space.len()
                )))
            }
            Some(mask) => mask.to_vec(),
            None => vec![true; self.space.len()],
        };
        if !self.space.factor_included() {
            entry_mask.push(false);
        }
        let order = self.cfg.derivative.accuracy_order;
        if !(1..=2).contains(&order) {
            return Err(EngineError::Validation(format!(
                "accuracy order is {} but must be in {{1, 2}}",
                order
            )));
        }
        let (index, entry) = self.require_parameter_set(parameters)?;
        info!(
            index,
            order,
            active = entry_mask.iter().filter(|m| **m).count(),
            "derivative requested"
        );
        Ok((index, entry, entry_mask))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lab::{LabBatch, LabModel};
    use crate::store::MemStore;

    const CONFIG: &str = r#"
[database]
output_dir = "/tmp/db"
model_name = "lab"

[parameters]
lower_bound = [0.0, 0.0]
upper_bound = [10.0, 10.0]
typical_values = [1.0, 1.0]

[spinup]
years = 20

[grid]
t_dim = 2
x_dim = 2
y_dim = 1
z_dim = 1
"#;

    #[test]
    fn test_parameter_set_dirs() {
        let cfg = Root::from_toml_str(CONFIG).unwrap();
        let store = MemStore::new();
        let batch = LabBatch::new(LabModel::affine(2), LandSeaMask::from_config(&cfg).unwrap());
        let model = Model::new(cfg, &store, &batch).unwrap();

        assert_eq!(model.parameter_set_dir(&[1.0, 2.0], false).unwrap(), None);
        assert_eq!(model.closest_parameter_set_dir(&[1.0, 2.0]).unwrap(), None);
        let dir = model.parameter_set_dir(&[1.0, 2.0], true).unwrap().unwrap();
        assert_eq!(dir, model.layout().parameter_set_dir(0));
        assert!(store.is_dir(&model.layout().spinup_dir(0)));
        model.parameter_set_dir(&[5.0, 5.0], true).unwrap();
        assert_eq!(
            model.closest_parameter_set_dir(&[4.0, 4.5]).unwrap(),
            Some(model.layout().parameter_set_dir(1))
        );
        assert_eq!(model.last_run(&[1.0, 2.0]).unwrap(), None);
        assert_eq!(model.last_run(&[3.0, 3.0]).unwrap(), None);
    }

    #[test]
    fn test_unfinished_last_run_has_no_total_years() {
        let cfg = Root::from_toml_str(CONFIG).unwrap();
        let store = MemStore::new();
        let batch = LabBatch::new(LabModel::affine(2), LandSeaMask::from_config(&cfg).unwrap());
        let model = Model::new(cfg, &store, &batch).unwrap();

        model.parameter_set_dir(&[1.0, 2.0], true).unwrap();
        let run = model.layout().spinup_dir(0).join("run_00");
        store.create_dir(&run).unwrap();
        assert_eq!(model.last_run(&[1.0, 2.0]).unwrap(), Some(run.clone()));
        assert!(matches!(model.total_years(&run), Err(EngineError::NotFound(_))));
    }

    #[test]
    fn test_rejects_bad_inputs_before_launch() {
        let cfg = Root::from_toml_str(CONFIG).unwrap();
        let store = MemStore::new();
        let batch = LabBatch::new(LabModel::affine(2), LandSeaMask::from_config(&cfg).unwrap());
        let mut model = Model::new(cfg, &store, &batch).unwrap();

        assert!(matches!(
            model.f_boxes(&[1.0], 2),
            Err(EngineError::Validation(_))
        ));
        assert!(matches!(
            model.f_boxes(&[11.0, 1.0], 2),
            Err(EngineError::Validation(_))
        ));
        assert!(matches!(
            model.df_boxes(&[1.0, 1.0], 2, Some(&[true, true, true])),
            Err(EngineError::Validation(_))
        ));
        assert!(matches!(
            model.f_points(&[1.0, 1.0], &[vec![]]),
            Err(EngineError::Validation(_))
        ));
        assert_eq!(batch.submissions(), 0);
    }
}
