//! Spinup and derivative scheduling for biogeochemical ocean model runs.
//!
//! Runs live in a store laid out as
//! `model/<name>/time_step_<n>/parameter_<i>/{spinup,derivative,trajectory}`,
//! addressed through a tolerance-aware parameter index. The batch system that
//! executes the model binary sits behind [`job::BatchSystem`].

pub mod batch;
pub mod config;
pub mod derivative;
pub mod error;
pub mod grid;
pub mod index;
pub mod interpolate;
pub mod io;
pub mod job;
pub mod lab;
pub mod model;
pub mod parameters;
pub mod paths;
pub mod spinup;
pub mod store;
pub mod trajectory;

#[cfg(test)]
mod tests;

pub use error::{EngineError, Result, StaleStateWarning};
pub use model::Model;
