//! Tracer values of a finished run, on the full grid or at query points.
//!
//! The state at the end of a run is turned into trajectories by a one-year
//! job seeded from that run. The job runs in a scratch run directory below the
//! parameter set and is removed once its files have been read.

use crate::config::{JobKind, Root};
use crate::error::{EngineError, Result};
use crate::grid::{clamp_to_support, GridGeometry, LandSeaMask};
use crate::interpolate::InterpolatorCache;
use crate::io::{read_trajectory, TrajectoryRow};
use crate::job::{BatchSystem, Job, JobDescription};
use crate::paths::make_new_run_dir;
use crate::store::Store;
use ndarray::{s, Array1, Array4, ArrayD, Axis};
use std::path::Path;
use tracing::{debug, info};

pub struct TrajectoryReader<'a> {
    store: &'a dyn Store,
    batch: &'a dyn BatchSystem,
    cfg: &'a Root,
    mask: &'a LandSeaMask,
}

impl<'a> TrajectoryReader<'a> {
    pub fn new(
        store: &'a dyn Store,
        batch: &'a dyn BatchSystem,
        cfg: &'a Root,
        mask: &'a LandSeaMask,
    ) -> Self {
        Self {
            store,
            batch,
            cfg,
            mask,
        }
    }

    /// Runs the trajectory job for `run` in a fresh directory below `scratch`
    /// and returns the rows of every tracer.
    fn trajectories(&self, run: &Path, scratch: &Path) -> Result<Vec<Vec<TrajectoryRow>>> {
        let source = Job::open(self.store, run)?;
        let parameters = source.description()?.parameters.clone();

        let dir = make_new_run_dir(self.store, scratch)?;
        let mut job = Job::new(self.store, &dir);
        job.write_description(JobDescription {
            model_name: self.cfg.database.model_name.clone(),
            parameters,
            years: 1,
            tolerance: 0.0,
            time_step: self.cfg.database.time_step,
            concentration_factor: 1.0,
            write_trajectory: true,
            tracer_input_dir: Some(run.to_path_buf()),
            setup: self.cfg.job.setup(JobKind::Trajectory),
        })?;
        info!(run = %run.display(), scratch = %dir.display(), "extracting trajectory");

        let rows = job
            .launch(self.batch)
            .and_then(|_| job.wait_until_finished(self.batch))
            .and_then(|_| {
                (0..self.cfg.database.tracers.len())
                    .map(|q| read_trajectory(self.store, &dir, q))
                    .collect::<Result<Vec<_>>>()
            });
        self.store.remove_all(&dir)?;
        debug!(scratch = %dir.display(), "removed trajectory directory");
        rows
    }

    /// Per tracer an array `[t, x, y, z]` with `time_dim` slices, NaN on land.
    ///
    /// `time_dim` must divide the number of slices the model writes per year;
    /// consecutive slices are averaged.
    pub fn extract_full(&self, run: &Path, scratch: &Path, time_dim: usize) -> Result<Vec<ArrayD<f64>>> {
        let [written, x_dim, y_dim, z_dim] = self.mask.dims();
        if time_dim == 0 || written % time_dim != 0 {
            return Err(EngineError::Validation(format!(
                "time dimension {} does not divide the {} slices written per year",
                time_dim, written
            )));
        }
        let group = written / time_dim;

        self.trajectories(run, scratch)?
            .into_iter()
            .map(|rows| {
                let mut full = Array4::<f64>::from_elem((written, x_dim, y_dim, z_dim), f64::NAN);
                for row in rows {
                    let [t, x, y, z] = row.index();
                    if let Some(cell) = full.get_mut((t, x, y, z)) {
                        *cell = row.value;
                    }
                }
                let mut averaged = Array4::<f64>::from_elem((time_dim, x_dim, y_dim, z_dim), f64::NAN);
                for slice in 0..time_dim {
                    let window = full.slice(s![slice * group..(slice + 1) * group, .., .., ..]);
                    if let Some(mean) = window.mean_axis(Axis(0)) {
                        averaged.index_axis_mut(Axis(0), slice).assign(&mean);
                    }
                }
                Ok(averaged.into_dyn())
            })
            .collect()
    }

    /// Per tracer the values at `points[tracer]`, given as `[t, lon, lat, depth]`.
    pub fn extract_at_points(
        &self,
        run: &Path,
        scratch: &Path,
        points: &[Vec<[f64; 4]>],
        caches: &mut [InterpolatorCache],
    ) -> Result<Vec<ArrayD<f64>>> {
        let tracers = self.cfg.database.tracers.len();
        if points.len() != tracers || caches.len() != tracers {
            return Err(EngineError::Validation(format!(
                "points given for {} tracers, the model has {}",
                points.len(),
                tracers
            )));
        }
        let queries: Vec<Vec<[f64; 4]>> = points
            .iter()
            .map(|p| self.grid_indices(p))
            .collect();

        self.trajectories(run, scratch)?
            .into_iter()
            .zip(queries)
            .zip(caches.iter_mut())
            .map(|((rows, query), cache)| {
                if query.is_empty() {
                    return Ok(Array1::<f64>::zeros(0).into_dyn());
                }
                let data_points: Vec<[f64; 4]> =
                    rows.iter().map(|r| r.index().map(|i| i as f64)).collect();
                let values: Vec<f64> = rows.iter().map(|r| r.value).collect();
                let result = cache.interpolate(&data_points, &values, &query)?;
                Ok(Array1::from(result).into_dyn())
            })
            .collect()
    }

    /// Fractional grid indices of `points`, clamped into the interpolation
    /// support when linear interpolators are enabled.
    pub fn grid_indices(&self, points: &[[f64; 4]]) -> Vec<[f64; 4]> {
        let mut indices = self.mask.coordinates_to_grid_indices(points);
        if self.cfg.interpolator.linear_interpolators > 0 {
            clamp_to_support(self.mask, &mut indices);
        }
        indices
    }
}

/// Periodic dimensions of the interpolation space: time and longitude.
pub fn periods(mask: &LandSeaMask) -> [Option<f64>; 4] {
    let [t_dim, x_dim, _, _] = mask.dims();
    [Some(t_dim as f64), Some(x_dim as f64), None, None]
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::InterpolatorOptions;
    use crate::lab::{LabBatch, LabModel};
    use crate::store::MemStore;
    use std::path::PathBuf;

    const CONFIG: &str = r#"
[database]
output_dir = "/tmp/db"
model_name = "lab"
tracers = ["po4", "dop"]

[parameters]
lower_bound = [0.0]
upper_bound = [1.0]
typical_values = [0.5]

[grid]
t_dim = 4
x_dim = 3
y_dim = 2
z_dim = 2
depth_bounds = [0.0, 100.0, 300.0]
"#;

    fn finished_run(store: &MemStore, batch: &LabBatch, cfg: &Root) -> PathBuf {
        let run = PathBuf::from("p/spinup/run_00");
        store.create_dir(&run).unwrap();
        let mut job = Job::new(store, &run);
        job.write_description(JobDescription {
            model_name: cfg.database.model_name.clone(),
            parameters: vec![0.5],
            years: 4,
            tolerance: 0.0,
            time_step: 1,
            concentration_factor: 1.0,
            write_trajectory: false,
            tracer_input_dir: None,
            setup: Default::default(),
        })
        .unwrap();
        job.launch(batch).unwrap();
        job.wait_until_finished(batch).unwrap();
        run
    }

    #[test]
    fn test_extract_full_averages_and_cleans_up() {
        let cfg = Root::from_toml_str(CONFIG).unwrap();
        let mask = LandSeaMask::from_config(&cfg).unwrap();
        let store = MemStore::new();
        let batch = LabBatch::new(LabModel::affine(1), mask.clone());
        let run = finished_run(&store, &batch, &cfg);
        let reader = TrajectoryReader::new(&store, &batch, &cfg, &mask);
        let scratch = Path::new("p/trajectory");

        let full = reader.extract_full(&run, scratch, 4).unwrap();
        let halved = reader.extract_full(&run, scratch, 2).unwrap();
        assert_eq!(full.len(), 2);
        assert_eq!(full[0].shape(), &[4, 3, 2, 2]);
        assert_eq!(halved[1].shape(), &[2, 3, 2, 2]);
        // mean of slices 2 and 3 differs from slice 2 by half a slice step
        let diff = halved[0][&[1, 2, 1, 0][..]] - full[0][&[2, 2, 1, 0][..]];
        assert!((diff - 0.0005).abs() < 1e-12);

        assert!(store.list_dirs(scratch).unwrap().is_empty());
        assert!(reader.extract_full(&run, scratch, 3).is_err());
    }

    #[test]
    fn test_points_at_cell_centres_return_cell_values() {
        let cfg = Root::from_toml_str(CONFIG).unwrap();
        let mask = LandSeaMask::from_config(&cfg).unwrap();
        let store = MemStore::new();
        let batch = LabBatch::new(LabModel::affine(1), mask.clone());
        let run = finished_run(&store, &batch, &cfg);
        let reader = TrajectoryReader::new(&store, &batch, &cfg, &mask);
        let scratch = Path::new("p/trajectory");

        let cells = [[1, 2, 0, 1], [3, 0, 1, 0]];
        let points: Vec<[f64; 4]> = cells
            .iter()
            .map(|c| mask.grid_indices_to_coordinates(*c))
            .collect();
        let mut caches: Vec<InterpolatorCache> = (0..2)
            .map(|_| InterpolatorCache::new(InterpolatorOptions::default(), periods(&mask)))
            .collect();
        let at_points = reader
            .extract_at_points(&run, scratch, &[points.clone(), points], &mut caches)
            .unwrap();
        let full = reader.extract_full(&run, scratch, 4).unwrap();
        for q in 0..2 {
            for (i, c) in cells.iter().enumerate() {
                assert!((at_points[q][&[i][..]] - full[q][&c[..]]).abs() < 1e-12);
            }
        }
    }

    #[test]
    fn test_points_per_tracer_are_checked() {
        let cfg = Root::from_toml_str(CONFIG).unwrap();
        let mask = LandSeaMask::from_config(&cfg).unwrap();
        let store = MemStore::new();
        let batch = LabBatch::new(LabModel::affine(1), mask.clone());
        let reader = TrajectoryReader::new(&store, &batch, &cfg, &mask);
        let mut caches = vec![InterpolatorCache::new(InterpolatorOptions::default(), periods(&mask))];
        let err = reader
            .extract_at_points(Path::new("run_00"), Path::new("t"), &[vec![]], &mut caches)
            .unwrap_err();
        assert!(matches!(err, EngineError::Validation(_)));
        assert_eq!(batch.submissions(), 0);
    }
}
