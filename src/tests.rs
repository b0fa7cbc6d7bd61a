//! Scenario tests for the run database
//!
//! Includes:
//! - Spinup matching against the lab backend (OR, AND, reuse, seeding)
//! - Finite-difference accuracy against the analytic lab derivative
//! - Perturbation run bookkeeping (bounds, reuse, stale replacement, launch order)
//! - Interpolation round-trip on the full-grid and point paths

use crate::config::Root;
use crate::error::EngineError;
use crate::job::Job;
use crate::lab::{LabBatch, LabEvent, LabModel};
use crate::model::Model;
use crate::grid::LandSeaMask;
use crate::spinup::Target;
use crate::store::{MemStore, Store};
use ndarray::{ArrayD, Axis};
use std::path::{Path, PathBuf};

const CONFIG: &str = r#"
[database]
output_dir = "/tmp/spinup-db"
model_name = "lab"

[parameters]
lower_bound = [0.0, 0.0]
upper_bound = [10.0, 10.0]
typical_values = [1.0, 2.0]

[spinup]
years = 10
max_years = 1000

[derivative]
years = 2
step_size = 1e-3

[grid]
t_dim = 4
x_dim = 3
y_dim = 2
z_dim = 2
depth_bounds = [0.0, 100.0, 300.0]
"#;

const STEP: f64 = 1e-3;

fn config() -> Root {
    Root::from_toml_str(CONFIG).unwrap()
}

/// Store and lab batch system the model under test borrows.
struct Lab {
    store: MemStore,
    batch: LabBatch,
}

impl Lab {
    fn new(cfg: &Root, model: LabModel) -> Self {
        Self {
            store: MemStore::new(),
            batch: LabBatch::new(model, LandSeaMask::from_config(cfg).unwrap()),
        }
    }

    fn model(&self, cfg: Root) -> Model<'_> {
        Model::new(cfg, &self.store, &self.batch).unwrap()
    }

    fn description_years(&self, run: &Path) -> u32 {
        Job::open(&self.store, run).unwrap().description().unwrap().years
    }

    fn input_of(&self, run: &Path) -> Option<PathBuf> {
        Job::open(&self.store, run)
            .unwrap()
            .tracer_input_dir()
            .unwrap()
            .map(Path::to_path_buf)
    }

    /// Submissions of runs below `dir`.
    fn submissions_below(&self, dir: &Path) -> usize {
        self.batch
            .submitted_dirs()
            .iter()
            .filter(|d| d.starts_with(dir))
            .count()
    }
}

/// Derivative of lab tracer `q` by parameter `i` after `years` perturbed years
/// plus the one-year trajectory job.
fn analytic(model: &LabModel, q: usize, i: usize, years: u32) -> f64 {
    model.slopes[q][i] * (1.0 - model.decay.powi(years as i32 + 1))
}

fn assert_all_close(values: &ArrayD<f64>, expected: f64, tol: f64) {
    for v in values.iter() {
        assert!(
            (v - expected).abs() < tol,
            "value {} differs from {} by more than {}",
            v,
            expected,
            tol
        );
    }
}

// =============================================================================
// Spinup Matching
// =============================================================================

#[test]
fn test_or_target_met_by_years() {
    // tolerance 2e-4 never reaches the 1e-4 target, the years do
    let cfg = config();
    let lab = Lab::new(&cfg, LabModel::affine(2).with_convergence(|_| 2e-4));
    let model = lab.model(cfg);

    let matched = model
        .matching_run(&[1.0, 2.0], &Target::or(100, 1e-4))
        .unwrap()
        .unwrap();
    assert_eq!(lab.batch.submissions(), 1, "exactly one run launched");
    assert_eq!(lab.description_years(&matched.run), 100);
    let job = Job::open(&lab.store, &matched.run).unwrap();
    assert_eq!(job.last_year().unwrap(), 100);
    assert_eq!(job.last_tolerance().unwrap(), 2e-4);
    assert!(matched.warning.is_none());

    let again = model
        .matching_run(&[1.0, 2.0], &Target::or(100, 1e-4))
        .unwrap()
        .unwrap();
    assert_eq!(again.run, matched.run);
    assert_eq!(lab.batch.submissions(), 1, "satisfied chain is not extended");
}

#[test]
fn test_and_target_extends_once_for_tolerance() {
    let cfg = config();
    let lab = Lab::new(
        &cfg,
        LabModel::affine(2).with_convergence(|age| if age < 60 { 1e-5 } else { 1e-7 }),
    );
    let model = lab.model(cfg);
    let p = [1.0, 2.0];

    let first = model.matching_run(&p, &Target::or(50, 0.0)).unwrap().unwrap();
    assert_eq!(model.total_years(&first.run).unwrap(), 50);
    assert_eq!(lab.batch.submissions(), 1);

    // (50 years, 1e-5) fails {50, 1e-6, AND} and is far below the cap
    let matched = model.matching_run(&p, &Target::and(50, 1e-6)).unwrap().unwrap();
    assert_eq!(lab.batch.submissions(), 2, "exactly one extension");
    assert!(matched.warning.is_none());
    assert_eq!(lab.input_of(&matched.run), Some(first.run.clone()));
    let extension = Job::open(&lab.store, &matched.run).unwrap();
    assert_eq!(extension.description().unwrap().tolerance, 1e-6);
    assert_eq!(extension.last_tolerance().unwrap(), 1e-7);
    assert_eq!(model.total_years(&matched.run).unwrap(), 60);
}

#[test]
fn test_total_years_are_monotone() {
    let cfg = config();
    let lab = Lab::new(&cfg, LabModel::affine(2));
    let model = lab.model(cfg);
    let p = [3.0, 4.0];

    let mut runs = Vec::new();
    for years in [10, 25, 40] {
        let matched = model.matching_run(&p, &Target::or(years, 0.0)).unwrap().unwrap();
        assert_eq!(model.total_years(&matched.run).unwrap(), years);
        runs.push(matched.run);
    }
    let names: Vec<String> = runs
        .iter()
        .filter_map(|r| r.file_name()?.to_str().map(str::to_string))
        .collect();
    assert_eq!(names, vec!["run_00", "run_01", "run_02"]);
    assert_eq!(model.total_years(&runs[0]).unwrap(), 10);
    assert_eq!(lab.description_years(&runs[2]), 15);
    assert_eq!(model.last_run(&p).unwrap(), Some(runs[2].clone()));
}

#[test]
fn test_new_chain_is_seeded_from_closest_finished_set() {
    let cfg = config();
    let lab = Lab::new(&cfg, LabModel::affine(2));
    let model = lab.model(cfg.clone());

    let donor = model.matching_run(&[1.0, 1.0], &Target::or(10, 0.0)).unwrap().unwrap();
    // closer set without any run is skipped
    model.parameter_set_dir(&[3.0, 3.0], true).unwrap();
    let seeded = model.matching_run(&[4.0, 4.0], &Target::or(5, 0.0)).unwrap().unwrap();

    assert_eq!(lab.input_of(&seeded.run), Some(donor.run.clone()));
    let description = Job::open(&lab.store, &seeded.run).unwrap().description().unwrap().clone();
    assert_eq!(description.concentration_factor, 1.0);
    assert_eq!(description.years, 5);
    // donor years are not counted
    assert_eq!(model.total_years(&seeded.run).unwrap(), 5);

    let mut cold = cfg;
    cold.spinup.start_from_closest = false;
    let model = lab.model(cold);
    let fresh = model.matching_run(&[6.0, 6.0], &Target::or(5, 0.0)).unwrap().unwrap();
    assert_eq!(lab.input_of(&fresh.run), None);
}

#[test]
fn test_external_failure_is_propagated() {
    let cfg = config();
    let lab = Lab::new(&cfg, LabModel::affine(2));
    let model = lab.model(cfg);
    lab.batch.set_failing(true);

    match model.f_boxes(&[1.0, 2.0], 4) {
        Err(EngineError::ExternalJobFailure { diagnostic, .. }) => {
            assert!(diagnostic.contains("killed"), "diagnostic passed through: {}", diagnostic)
        }
        other => panic!("expected an external job failure, got {:?}", other.map(|v| v.len())),
    }
    assert_eq!(lab.batch.submissions(), 1);
}

// =============================================================================
// Values
// =============================================================================

#[test]
fn test_value_reuses_spinup() {
    let cfg = config();
    let lab = Lab::new(&cfg, LabModel::affine(2));
    let model = lab.model(cfg);
    let p = [1.0, 2.0];

    let first = model.f_boxes(&p, 4).unwrap();
    let spinup = model.layout().spinup_dir(0);
    assert_eq!(lab.submissions_below(&spinup), 1);
    let second = model.f_boxes(&p, 4).unwrap();
    assert_eq!(lab.submissions_below(&spinup), 1, "no spinup run on the second call");
    assert_eq!(first, second);

    assert_eq!(first.len(), 2);
    assert_eq!(first[0].shape(), &[4, 3, 2, 2]);
    let halved = model.f_boxes(&p, 2).unwrap();
    assert_eq!(halved[1].shape(), &[2, 3, 2, 2]);
    // trajectory scratch runs are removed
    assert!(lab.store.list_dirs(&model.layout().trajectory_dir(0)).unwrap().is_empty());
}

#[test]
fn test_interpolation_round_trip() {
    let cfg = config();
    let lab = Lab::new(&cfg, LabModel::affine(2));
    let mut model = lab.model(cfg);
    let p = [1.0, 2.0];

    let cells = [[0, 0, 0, 0], [1, 2, 1, 1], [3, 1, 0, 1]];
    let points: Vec<[f64; 4]> = cells
        .iter()
        .map(|c| model.mask().grid_indices_to_coordinates(*c))
        .collect();
    let per_tracer = vec![points.clone(), points];

    let full = model.f_boxes(&p, 4).unwrap();
    let at_points = model.f_points(&p, &per_tracer).unwrap();
    for q in 0..2 {
        for (i, c) in cells.iter().enumerate() {
            assert!(
                (at_points[q][&[i][..]] - full[q][&c[..]]).abs() < 1e-10,
                "tracer {} cell {:?}",
                q,
                c
            );
        }
    }

    let d_full = model.df_boxes(&p, 4, None).unwrap();
    let d_points = model.df_points(&p, &per_tracer, None).unwrap();
    assert_eq!(d_points[0].shape(), &[2, 3]);
    for q in 0..2 {
        for k in 0..2 {
            for (i, c) in cells.iter().enumerate() {
                let expected = d_full[q][&[k, c[0], c[1], c[2], c[3]][..]];
                assert!((d_points[q][&[k, i][..]] - expected).abs() < 1e-6);
            }
        }
    }
    // one geometry per tracer, only the values change between runs
    assert!(model.caches().iter().all(|c| c.builds() == 1));
}

// =============================================================================
// Derivatives
// =============================================================================

#[test]
fn test_forward_difference_matches_analytic() {
    let mut cfg = config();
    cfg.derivative.accuracy_order = 1;
    let lab = Lab::new(&cfg, LabModel::affine(2));
    let model = lab.model(cfg);

    let df = model.df_boxes(&[1.0, 2.0], 4, None).unwrap();
    assert_eq!(df.len(), 2);
    assert_eq!(df[0].shape(), &[2, 4, 3, 2, 2]);
    for (q, d) in df.iter().enumerate() {
        for i in 0..2 {
            let expected = analytic(lab.batch.model(), q, i, 2);
            assert_all_close(&d.index_axis(Axis(0), i).to_owned(), expected, 1e-6);
        }
    }

    // base run at 8 years, value run continued to 10
    let spinup = model.layout().spinup_dir(0);
    assert_eq!(model.total_years(&spinup.join("run_00")).unwrap(), 8);
    assert_eq!(model.total_years(&spinup.join("run_01")).unwrap(), 10);
    let forward = model.layout().partial_derivative_dir(0, STEP, 1, 1).join("run_00");
    assert_eq!(lab.input_of(&forward), Some(spinup.join("run_00")));
    assert_eq!(lab.description_years(&forward), 2);
    assert_eq!(
        lab.submissions_below(&model.layout().derivative_dir(0, STEP)),
        2,
        "one perturbation per parameter"
    );
}

#[test]
fn test_central_difference_matches_analytic() {
    let cfg = config();
    let lab = Lab::new(&cfg, LabModel::affine(2));
    let model = lab.model(cfg);

    let df = model.df_boxes(&[1.0, 2.0], 2, Some(&[false, true])).unwrap();
    assert_eq!(df[1].shape(), &[1, 2, 3, 2, 2]);
    for (q, d) in df.iter().enumerate() {
        assert_all_close(d, analytic(lab.batch.model(), q, 1, 2), 1e-6);
    }
    let derivative = model.layout().derivative_dir(0, STEP);
    assert_eq!(lab.submissions_below(&derivative), 2);
    assert!(!lab.store.exists(&model.layout().partial_derivative_dir(0, STEP, 0, 1)));
}

#[test]
fn test_scaled_initial_state_does_not_leak_into_differences() {
    for order in [1, 2] {
        let mut cfg = config();
        cfg.parameters.concentration_factor_included = true;
        cfg.derivative.accuracy_order = order;
        let lab = Lab::new(&cfg, LabModel::affine(2));
        let model = lab.model(cfg);

        let df = model
            .df_boxes(&[1.0, 2.0, 0.5], 4, Some(&[true, true, false]))
            .unwrap();
        assert_eq!(df[0].shape(), &[2, 4, 3, 2, 2]);
        for (q, d) in df.iter().enumerate() {
            for i in 0..2 {
                let expected = analytic(lab.batch.model(), q, i, 2);
                assert_all_close(&d.index_axis(Axis(0), i).to_owned(), expected, 1e-6);
            }
        }

        // the spinup chain starts scaled, continuations from it are not
        let spinup = model.layout().spinup_dir(0).join("run_00");
        let factor = |run: &Path| {
            Job::open(&lab.store, run)
                .unwrap()
                .description()
                .unwrap()
                .concentration_factor
        };
        assert_eq!(factor(&spinup), 0.5, "order {}", order);
        for i in 0..2 {
            let run = model
                .layout()
                .partial_derivative_dir(0, STEP, i, 1)
                .join("run_00");
            assert_eq!(factor(&run), 1.0, "order {}", order);
        }
    }
}

#[test]
fn test_lower_bound_is_clamped_under_central_difference() {
    let cfg = config();
    let lab = Lab::new(&cfg, LabModel::affine(2));
    let model = lab.model(cfg);

    let df = model.df_boxes(&[0.0, 2.0], 4, Some(&[true, false])).unwrap();
    for (q, d) in df.iter().enumerate() {
        assert_all_close(d, analytic(lab.batch.model(), q, 0, 2), 1e-6);
    }

    let forward = model.layout().partial_derivative_dir(0, STEP, 0, 1).join("run_00");
    let backward = model.layout().partial_derivative_dir(0, STEP, 0, -1).join("run_00");
    let value = |run: &Path| Job::open(&lab.store, run).unwrap().description().unwrap().parameters[0];
    assert!((value(&forward) - STEP).abs() < 1e-15);
    // no room below the bound, the backward side is reflected to half a step
    assert!((value(&backward) - 0.5 * STEP).abs() < 1e-15);
    assert!(value(&backward) >= 0.0);
}

#[test]
fn test_perturbation_runs_are_reused_or_replaced() {
    let cfg = config();
    let lab = Lab::new(&cfg, LabModel::affine(2));
    let p = [1.0, 2.0];
    let derivative = {
        let model = lab.model(cfg.clone());
        model.df_boxes(&p, 4, None).unwrap();
        model.layout().derivative_dir(0, STEP)
    };
    assert_eq!(lab.submissions_below(&derivative), 4);

    // same target: every perturbation run is reused
    let model = lab.model(cfg.clone());
    model.df_boxes(&p, 4, None).unwrap();
    assert_eq!(lab.submissions_below(&derivative), 4);

    // a longer spinup moves the base run, the old perturbation runs are stale
    let mut longer = cfg;
    longer.spinup.years = 14;
    let model = lab.model(longer);
    let df = model.df_boxes(&p, 4, None).unwrap();
    assert_eq!(lab.submissions_below(&derivative), 8);
    assert_all_close(&df[0].index_axis(Axis(0), 1).to_owned(), analytic(lab.batch.model(), 0, 1, 2), 1e-6);

    let chain = model.layout().partial_derivative_dir(0, STEP, 1, -1);
    assert_eq!(lab.store.list_dirs(&chain).unwrap(), vec!["run_00".to_string()]);
    assert_eq!(
        lab.input_of(&chain.join("run_00")),
        Some(model.layout().spinup_dir(0).join("run_01"))
    );
}

#[test]
fn test_all_perturbations_launched_before_any_wait() {
    let cfg = config();
    let lab = Lab::new(&cfg, LabModel::affine(2));
    let model = lab.model(cfg);
    model.df_boxes(&[1.0, 2.0], 4, None).unwrap();

    let derivative = model.layout().derivative_dir(0, STEP);
    let events = lab.batch.events();
    let submits: Vec<usize> = events
        .iter()
        .enumerate()
        .filter(|(_, e)| matches!(e, LabEvent::Submit(d) if d.starts_with(&derivative)))
        .map(|(n, _)| n)
        .collect();
    let waits: Vec<usize> = events
        .iter()
        .enumerate()
        .filter(|(_, e)| matches!(e, LabEvent::Wait(d) if d.starts_with(&derivative)))
        .map(|(n, _)| n)
        .collect();
    assert_eq!(submits.len(), 4);
    assert_eq!(waits.len(), 4);
    assert!(submits.iter().max() < waits.iter().min());
}

#[test]
fn test_invalid_derivative_requests_launch_nothing() {
    let mut cfg = config();
    cfg.derivative.accuracy_order = 3;
    let lab = Lab::new(&config(), LabModel::affine(2));
    match Model::new(cfg, &lab.store, &lab.batch) {
        Err(EngineError::Validation(message)) => assert!(message.contains("accuracy_order is 3")),
        Err(e) => panic!("expected a validation error, got {}", e),
        Ok(_) => panic!("accuracy order 3 accepted"),
    }

    let model = lab.model(config());
    assert!(matches!(
        model.df_boxes(&[1.0, 2.0], 4, Some(&[true])),
        Err(EngineError::Validation(_))
    ));
    assert!(matches!(
        model.df_boxes(&[1.0, 2.0], 4, Some(&[false, false])),
        Err(EngineError::Validation(_))
    ));
    assert_eq!(lab.batch.submissions(), 0);
}
