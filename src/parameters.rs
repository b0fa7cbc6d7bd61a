//! Checking parameter vectors and converting them to stored entries.
//!
//! A stored entry always ends with the total concentration factor, which is 1
//! when the caller's vectors do not carry it.

use crate::config::Root;
use crate::error::{EngineError, Result};

#[derive(Debug, Clone, PartialEq)]
pub struct ParameterSpace {
    lower: Vec<f64>,
    upper: Vec<f64>,
    factor_included: bool,
}

/// Model parameters and the concentration factor applied to the initial state.
#[derive(Debug, Clone, PartialEq)]
pub struct ModelParameters {
    pub model: Vec<f64>,
    pub concentration_factor: f64,
}

impl ParameterSpace {
    pub fn new(cfg: &Root) -> Self {
        Self {
            lower: cfg.parameters.lower_bound.clone(),
            upper: cfg.parameters.upper_bound.clone(),
            factor_included: cfg.parameters.concentration_factor_included,
        }
    }

    pub fn model_len(&self) -> usize {
        self.lower.len()
    }

    /// Length of the vectors callers pass in.
    pub fn len(&self) -> usize {
        self.model_len() + usize::from(self.factor_included)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn factor_included(&self) -> bool {
        self.factor_included
    }

    pub fn check(&self, parameters: &[f64]) -> Result<()> {
        if parameters.len() != self.len() {
            return Err(EngineError::Validation(format!(
                "parameters {:?} have length {} but the model expects {}",
                parameters,
                parameters.len(),
                self.len()
            )));
        }
        if let Some(i) = parameters.iter().position(|p| !p.is_finite()) {
            return Err(EngineError::Validation(format!(
                "parameter {} is {} but must be finite",
                i, parameters[i]
            )));
        }
        let split = self.split(parameters);
        if split.concentration_factor < 0.0 {
            return Err(EngineError::Validation(format!(
                "total concentration factor is {} but must be >= 0",
                split.concentration_factor
            )));
        }

        let below: Vec<usize> = (0..self.model_len())
            .filter(|&i| split.model[i] < self.lower[i])
            .collect();
        if !below.is_empty() {
            return Err(EngineError::Validation(format!(
                "parameters {:?} at indices {:?} are below their lower bounds {:?}",
                split.model,
                below,
                below.iter().map(|&i| self.lower[i]).collect::<Vec<_>>()
            )));
        }
        let above: Vec<usize> = (0..self.model_len())
            .filter(|&i| split.model[i] > self.upper[i])
            .collect();
        if !above.is_empty() {
            return Err(EngineError::Validation(format!(
                "parameters {:?} at indices {:?} are above their upper bounds {:?}",
                split.model,
                above,
                above.iter().map(|&i| self.upper[i]).collect::<Vec<_>>()
            )));
        }
        Ok(())
    }

    /// Splits a caller's vector into model parameters and concentration factor.
    pub fn split(&self, parameters: &[f64]) -> ModelParameters {
        if self.factor_included {
            let (model, factor) = parameters.split_at(parameters.len().saturating_sub(1));
            ModelParameters {
                model: model.to_vec(),
                concentration_factor: factor.first().copied().unwrap_or(1.0),
            }
        } else {
            ModelParameters {
                model: parameters.to_vec(),
                concentration_factor: 1.0,
            }
        }
    }

    /// Checked vector converted to its stored form.
    pub fn entry(&self, parameters: &[f64]) -> Result<Vec<f64>> {
        self.check(parameters)?;
        let mut entry = parameters.to_vec();
        if !self.factor_included {
            entry.push(1.0);
        }
        Ok(entry)
    }

    pub fn split_entry(entry: &[f64]) -> ModelParameters {
        let (model, factor) = entry.split_at(entry.len().saturating_sub(1));
        ModelParameters {
            model: model.to_vec(),
            concentration_factor: factor.first().copied().unwrap_or(1.0),
        }
    }
}
