//! Tolerance-aware content-addressed index of parameter vectors.
//!
//! Backed by an append-only array file (one rounded entry per line, the line
//! number is the index) and one value file per index holding the vector at
//! full precision. Indices are never reused or reassigned.

use crate::config::Root;
use crate::error::{EngineError, Result};
use crate::paths::Layout;
use crate::store::{read_string, Store};
use std::cmp::Ordering;
use std::path::PathBuf;
use tracing::{debug, info};

#[derive(Debug, Clone)]
pub struct ParameterIndex {
    layout: Layout,
    entry_len: usize,
    absolute: Vec<f64>,
    relative: Vec<f64>,
    decimal_places: usize,
}

impl ParameterIndex {
    pub fn new(cfg: &Root, layout: Layout) -> Self {
        Self {
            layout,
            entry_len: cfg.entry_len(),
            absolute: cfg.entry_absolute_tolerance(),
            relative: cfg.entry_relative_tolerance(),
            decimal_places: cfg.tolerance.reliable_decimal_places as usize,
        }
    }

    pub fn entry_len(&self) -> usize {
        self.entry_len
    }

    fn array_file(&self) -> PathBuf {
        self.layout.index_file()
    }

    fn round(&self, value: f64) -> f64 {
        format!("{:.*}", self.decimal_places, value)
            .parse()
            .unwrap_or(value)
    }

    fn rounded(&self, vector: &[f64]) -> Vec<f64> {
        vector.iter().map(|v| self.round(*v)).collect()
    }

    fn check_len(&self, vector: &[f64]) -> Result<()> {
        if vector.len() != self.entry_len {
            return Err(EngineError::Validation(format!(
                "index entry {:?} has length {} but entries have length {}",
                vector,
                vector.len(),
                self.entry_len
            )));
        }
        Ok(())
    }

    fn is_matching(&self, stored: &[f64], vector: &[f64]) -> bool {
        stored
            .iter()
            .zip(vector)
            .enumerate()
            .all(|(i, (s, v))| (s - v).abs() <= self.absolute[i] + self.relative[i] * s.abs())
    }

    /// All stored entries in index order, as rounded in the array file.
    pub fn entries(&self, store: &dyn Store) -> Result<Vec<Vec<f64>>> {
        let path = self.array_file();
        let Some(text) = read_string(store, &path)? else {
            return Ok(Vec::new());
        };
        text.lines()
            .filter(|line| !line.trim().is_empty())
            .enumerate()
            .map(|(row, line)| {
                let entry = line
                    .split_whitespace()
                    .map(str::parse::<f64>)
                    .collect::<std::result::Result<Vec<_>, _>>()
                    .map_err(|e| EngineError::format(&path, format!("row {}: {}", row, e)))?;
                if entry.len() != self.entry_len {
                    return Err(EngineError::format(
                        &path,
                        format!("row {} has {} values, expected {}", row, entry.len(), self.entry_len),
                    ));
                }
                Ok(entry)
            })
            .collect()
    }

    pub fn len(&self, store: &dyn Store) -> Result<usize> {
        Ok(self.entries(store)?.len())
    }

    pub fn index_of(&self, store: &dyn Store, vector: &[f64]) -> Result<Option<usize>> {
        self.check_len(vector)?;
        let vector = self.rounded(vector);
        let index = self
            .entries(store)?
            .iter()
            .position(|stored| self.is_matching(stored, &vector));
        debug!(?vector, ?index, "parameter index lookup");
        Ok(index)
    }

    /// Stores a new entry. Fails with `AlreadyIndexed` if a matching entry exists.
    pub fn add(&self, store: &dyn Store, vector: &[f64]) -> Result<usize> {
        if let Some(existing) = self.index_of(store, vector)? {
            return Err(EngineError::AlreadyIndexed(existing));
        }
        let index = self.len(store)?;
        let row: Vec<String> = self.rounded(vector).iter().map(|v| v.to_string()).collect();
        store.append(&self.array_file(), format!("{}\n", row.join(" ")).as_bytes())?;

        let values: Vec<String> = vector.iter().map(|v| v.to_string()).collect();
        store.write(
            &self.layout.parameters_file(index),
            format!("{}\n", values.join("\n")).as_bytes(),
        )?;
        info!(index, ?vector, "added parameter set");
        Ok(index)
    }

    /// Full-precision vector stored at `index`.
    pub fn value(&self, store: &dyn Store, index: usize) -> Result<Vec<f64>> {
        let path = self.layout.parameters_file(index);
        let text = read_string(store, &path)?
            .ok_or_else(|| EngineError::NotFound(format!("no parameters stored at index {}", index)))?;
        text.split_whitespace()
            .map(|v| v.parse::<f64>().map_err(|e| EngineError::format(&path, e.to_string())))
            .collect()
    }

    /// Stored indices ordered by Euclidean distance to `vector`, ties by ascending index.
    pub fn closest_indices(&self, store: &dyn Store, vector: &[f64]) -> Result<Vec<usize>> {
        self.check_len(vector)?;
        let vector = self.rounded(vector);
        let mut distances: Vec<(usize, f64)> = self
            .entries(store)?
            .iter()
            .enumerate()
            .map(|(i, stored)| {
                let d = stored
                    .iter()
                    .zip(&vector)
                    .map(|(s, v)| (s - v).powi(2))
                    .sum::<f64>()
                    .sqrt();
                (i, d)
            })
            .collect();
        distances.sort_by(|a, b| match a.1.total_cmp(&b.1) {
            Ordering::Equal => a.0.cmp(&b.0),
            other => other,
        });
        Ok(distances.into_iter().map(|(i, _)| i).collect())
    }

    pub fn closest_index(&self, store: &dyn Store, vector: &[f64]) -> Result<Option<usize>> {
        Ok(self.closest_indices(store, vector)?.first().copied())
    }
}
