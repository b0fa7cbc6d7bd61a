//! Grid geometry of the ocean model.
//!
//! Points are given as `[t, lon, lat, depth]` with `t` the fraction of the
//! model year, longitudes in degrees east, latitudes in degrees north and
//! depth in metres. Grid indices are fractional `[t, x, y, z]` positions where
//! integer values are cell centres.

use crate::config::Root;
use crate::error::{EngineError, Result};
use std::path::Path;

const DEFAULT_DEPTH: f64 = 5000.0;

pub trait GridGeometry {
    /// `[t, x, y, z]` extents.
    fn dims(&self) -> [usize; 4];

    fn coordinates_to_grid_indices(&self, points: &[[f64; 4]]) -> Vec<[f64; 4]>;

    /// First and last latitude row that holds at least one ocean cell.
    fn ocean_rows(&self) -> Option<(usize, usize)>;
}

#[derive(Debug, Clone, PartialEq)]
pub struct LandSeaMask {
    t_dim: usize,
    x_dim: usize,
    y_dim: usize,
    z_dim: usize,
    /// Ocean layer count per `(y, x)`, 0 on land.
    layers: Vec<usize>,
    depth_bounds: Vec<f64>,
}

impl LandSeaMask {
    /// Every column ocean down to the last layer.
    pub fn all_ocean(t_dim: usize, x_dim: usize, y_dim: usize, z_dim: usize) -> Self {
        Self {
            t_dim,
            x_dim,
            y_dim,
            z_dim,
            layers: vec![z_dim; x_dim * y_dim],
            depth_bounds: uniform_depth_bounds(z_dim),
        }
    }

    pub fn new(
        t_dim: usize,
        x_dim: usize,
        z_dim: usize,
        layers: Vec<Vec<usize>>,
        depth_bounds: Vec<f64>,
    ) -> Result<Self> {
        let y_dim = layers.len();
        if let Some(row) = layers.iter().position(|row| row.len() != x_dim) {
            return Err(EngineError::Validation(format!(
                "mask row {} has {} columns, expected {}",
                row,
                layers[row].len(),
                x_dim
            )));
        }
        if let Some(depth) = layers.iter().flatten().find(|n| **n > z_dim) {
            return Err(EngineError::Validation(format!(
                "mask layer count {} exceeds z_dim {}",
                depth, z_dim
            )));
        }
        if depth_bounds.len() != z_dim + 1 {
            return Err(EngineError::Validation(format!(
                "{} depth bounds given for {} layers",
                depth_bounds.len(),
                z_dim
            )));
        }
        Ok(Self {
            t_dim,
            x_dim,
            y_dim,
            z_dim,
            layers: layers.into_iter().flatten().collect(),
            depth_bounds,
        })
    }

    /// Mask for the configured grid at the configured time step.
    pub fn from_config(cfg: &Root) -> Result<Self> {
        let grid = &cfg.grid;
        let depth_bounds = if grid.depth_bounds.is_empty() {
            uniform_depth_bounds(grid.z_dim)
        } else {
            grid.depth_bounds.clone()
        };
        match &grid.mask_file {
            Some(path) => {
                let layers = read_mask_file(path)?;
                if layers.len() != grid.y_dim {
                    return Err(EngineError::format(
                        path,
                        format!("{} rows, expected y_dim {}", layers.len(), grid.y_dim),
                    ));
                }
                Self::new(cfg.time_dim(), grid.x_dim, grid.z_dim, layers, depth_bounds)
            }
            None => Ok(Self {
                depth_bounds,
                ..Self::all_ocean(cfg.time_dim(), grid.x_dim, grid.y_dim, grid.z_dim)
            }),
        }
    }

    pub fn layers(&self, x: usize, y: usize) -> usize {
        self.layers[y * self.x_dim + x]
    }

    pub fn is_ocean(&self, x: usize, y: usize, z: usize) -> bool {
        x < self.x_dim && y < self.y_dim && z < self.layers(x, y)
    }

    /// Ocean cells as `(x, y, z)` in row-major order.
    pub fn ocean_cells(&self) -> impl Iterator<Item = (usize, usize, usize)> + '_ {
        (0..self.y_dim).flat_map(move |y| {
            (0..self.x_dim).flat_map(move |x| (0..self.layers(x, y)).map(move |z| (x, y, z)))
        })
    }

    pub fn ocean_cell_count(&self) -> usize {
        self.layers.iter().sum()
    }

    fn layer_centres(&self) -> Vec<f64> {
        self.depth_bounds.windows(2).map(|w| 0.5 * (w[0] + w[1])).collect()
    }

    fn depth_to_index(&self, depth: f64) -> f64 {
        let centres = self.layer_centres();
        if centres.len() == 1 {
            let thickness = self.depth_bounds[1] - self.depth_bounds[0];
            return (depth - centres[0]) / thickness;
        }
        // piecewise linear between centres, extended linearly past the ends
        let segment = centres
            .windows(2)
            .position(|w| depth < w[1])
            .unwrap_or(centres.len() - 2);
        let (lo, hi) = (centres[segment], centres[segment + 1]);
        segment as f64 + (depth - lo) / (hi - lo)
    }

    /// Coordinates of the centre of cell `[t, x, y, z]`.
    pub fn grid_indices_to_coordinates(&self, index: [usize; 4]) -> [f64; 4] {
        let [t, x, y, z] = index;
        let centres = self.layer_centres();
        [
            t as f64 / self.t_dim as f64,
            (x as f64 + 0.5) * 360.0 / self.x_dim as f64,
            (y as f64 + 0.5) * 180.0 / self.y_dim as f64 - 90.0,
            centres[z.min(self.z_dim - 1)],
        ]
    }
}

impl GridGeometry for LandSeaMask {
    fn dims(&self) -> [usize; 4] {
        [self.t_dim, self.x_dim, self.y_dim, self.z_dim]
    }

    fn coordinates_to_grid_indices(&self, points: &[[f64; 4]]) -> Vec<[f64; 4]> {
        points
            .iter()
            .map(|&[t, lon, lat, depth]| {
                [
                    t.rem_euclid(1.0) * self.t_dim as f64,
                    (lon.rem_euclid(360.0) * self.x_dim as f64 / 360.0 - 0.5)
                        .rem_euclid(self.x_dim as f64),
                    (lat + 90.0) * self.y_dim as f64 / 180.0 - 0.5,
                    self.depth_to_index(depth),
                ]
            })
            .collect()
    }

    fn ocean_rows(&self) -> Option<(usize, usize)> {
        let rows: Vec<usize> = (0..self.y_dim)
            .filter(|&y| (0..self.x_dim).any(|x| self.layers(x, y) > 0))
            .collect();
        Some((*rows.first()?, *rows.last()?))
    }
}

/// Clamps latitude indices into the ocean rows and depth indices into the layers.
pub fn clamp_to_support(geometry: &dyn GridGeometry, indices: &mut [[f64; 4]]) {
    let [_, _, _, z_dim] = geometry.dims();
    let rows = geometry.ocean_rows();
    for index in indices.iter_mut() {
        if let Some((first, last)) = rows {
            index[2] = index[2].clamp(first as f64, last as f64);
        }
        index[3] = index[3].clamp(0.0, (z_dim - 1) as f64);
    }
}

fn uniform_depth_bounds(z_dim: usize) -> Vec<f64> {
    (0..=z_dim)
        .map(|i| DEFAULT_DEPTH * i as f64 / z_dim as f64)
        .collect()
}

fn read_mask_file(path: &Path) -> Result<Vec<Vec<usize>>> {
    let text = std::fs::read_to_string(path).map_err(|e| EngineError::io(path, e))?;
    text.lines()
        .filter(|line| !line.trim().is_empty() && !line.trim_start().starts_with('#'))
        .map(|line| {
            line.split_whitespace()
                .map(|v| v.parse::<usize>().map_err(|e| EngineError::format(path, e.to_string())))
                .collect()
        })
        .collect()
}
