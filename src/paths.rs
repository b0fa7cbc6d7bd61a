//! Database layout.
//!
//! ```text
//! model/<model_name>/time_step_<n>/
//!     parameter_lookup.txt
//!     parameter_<i>/
//!         parameters.txt
//!         spinup/run_<k>/
//!         derivative/step_<s>/param_<j>_sign_<±1>/run_<k>/
//!         trajectory/run_<k>/
//! ```
//!
//! Every path is a pure function of the model name, time step and indices.
//! Run numbering is derived by counting run directories, so the store is the
//! only source of truth.

use crate::error::{EngineError, Result};
use crate::store::Store;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

const RUN_PREFIX: &str = "run_";

#[derive(Debug, Clone, PartialEq)]
pub struct Layout {
    model_name: String,
    time_step: u32,
}

impl Layout {
    pub fn new(model_name: impl Into<String>, time_step: u32) -> Self {
        Self {
            model_name: model_name.into(),
            time_step,
        }
    }

    pub fn model_dir(&self) -> PathBuf {
        Path::new("model").join(&self.model_name)
    }

    pub fn time_step_dir(&self) -> PathBuf {
        self.model_dir().join(format!("time_step_{:04}", self.time_step))
    }

    /// Append-only array file of the parameter index.
    pub fn index_file(&self) -> PathBuf {
        self.time_step_dir().join("parameter_lookup.txt")
    }

    pub fn parameter_set_dir(&self, index: usize) -> PathBuf {
        self.time_step_dir().join(format!("parameter_{:05}", index))
    }

    pub fn parameters_file(&self, index: usize) -> PathBuf {
        self.parameter_set_dir(index).join("parameters.txt")
    }

    pub fn spinup_dir(&self, index: usize) -> PathBuf {
        self.parameter_set_dir(index).join("spinup")
    }

    pub fn derivative_dir(&self, index: usize, step_size: f64) -> PathBuf {
        self.parameter_set_dir(index)
            .join("derivative")
            .join(format!("step_{:e}", step_size))
    }

    pub fn partial_derivative_dir(
        &self,
        index: usize,
        step_size: f64,
        parameter: usize,
        sign: i32,
    ) -> PathBuf {
        self.derivative_dir(index, step_size)
            .join(format!("param_{}_sign_{:+}", parameter, sign))
    }

    pub fn trajectory_dir(&self, index: usize) -> PathBuf {
        self.parameter_set_dir(index).join("trajectory")
    }
}

pub fn run_dir(chain: &Path, run: usize) -> PathBuf {
    chain.join(format!("{}{:02}", RUN_PREFIX, run))
}

/// Position of a run inside its chain, parsed from the directory name.
pub fn run_number(run_dir: &Path) -> Option<usize> {
    run_dir
        .file_name()?
        .to_str()?
        .strip_prefix(RUN_PREFIX)?
        .parse()
        .ok()
}

pub fn previous_run_dir(run_dir: &Path) -> Option<PathBuf> {
    let number = run_number(run_dir)?;
    if number == 0 {
        return None;
    }
    Some(self::run_dir(run_dir.parent()?, number - 1))
}

/// Number of run directories in `chain`.
///
/// A listing failure (e.g. the chain vanished mid-scan) counts as an empty chain.
pub fn run_count(store: &dyn Store, chain: &Path) -> usize {
    match store.list_dirs(chain) {
        Ok(names) => names
            .iter()
            .filter(|name| run_number(Path::new(name.as_str())).is_some())
            .count(),
        Err(e) => {
            warn!(chain = %chain.display(), error = %e, "could not list run directories");
            0
        }
    }
}

pub fn last_run_dir(store: &dyn Store, chain: &Path) -> Result<Option<PathBuf>> {
    let count = run_count(store, chain);
    if count == 0 {
        debug!(chain = %chain.display(), "no runs in chain");
        return Ok(None);
    }
    let last = run_dir(chain, count - 1);
    if !store.is_dir(&last) {
        return Err(EngineError::format(
            chain,
            format!("{} run directories but {} is missing", count, last.display()),
        ));
    }
    debug!(run = %last.display(), "last run in chain");
    Ok(Some(last))
}

/// Creates run directory `k` where `k` is the number of runs already in `chain`.
pub fn make_new_run_dir(store: &dyn Store, chain: &Path) -> Result<PathBuf> {
    store.create_dir_all(chain)?;
    let next = run_count(store, chain);
    let dir = run_dir(chain, next);
    debug!(run = %dir.display(), "creating run directory");
    store.create_dir(&dir)?;
    Ok(dir)
}
