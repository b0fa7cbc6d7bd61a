//! Scattered-data interpolation in grid index space.
//!
//! Building an [`Interpolator`] locates the nearest data points of every query
//! point and fixes their blending weights. Evaluating it only combines data
//! values, so the same geometry is reused while the values change from run to
//! run.

use crate::config::InterpolatorOptions;
use crate::error::{EngineError, Result};
use std::collections::HashMap;
use tracing::debug;

/// Distances below this count as coincident with a data point.
const COINCIDENCE: f64 = 1e-9;

type Cell = [i64; 4];

#[derive(Debug, Clone)]
pub struct Interpolator {
    value_count: usize,
    /// Per query point the contributing data point indices with normalized weights.
    weights: Vec<Vec<(usize, f64)>>,
}

impl Interpolator {
    /// `periods` marks dimensions that wrap around; data points closer than
    /// `wrap_around` to either end are mirrored across the seam.
    pub fn new(
        data_points: &[[f64; 4]],
        query_points: &[[f64; 4]],
        periods: [Option<f64>; 4],
        options: &InterpolatorOptions,
    ) -> Result<Self> {
        if data_points.is_empty() {
            return Err(EngineError::Validation(
                "cannot interpolate without data points".to_string(),
            ));
        }
        let (points, sources) = with_periodic_images(data_points, periods, options.wrap_around);
        let mut buckets: HashMap<Cell, Vec<usize>> = HashMap::new();
        for (i, point) in points.iter().enumerate() {
            buckets.entry(cell_of(point)).or_default().push(i);
        }
        let bounds = cell_bounds(&points);
        let k = options.neighbours.min(data_points.len());

        let weights = query_points
            .iter()
            .map(|query| {
                let nearest = nearest(&points, &buckets, query, k, &bounds);
                blend(&nearest, &sources)
            })
            .collect();
        debug!(
            data_points = data_points.len(),
            query_points = query_points.len(),
            neighbours = k,
            "built interpolator"
        );
        Ok(Self {
            value_count: data_points.len(),
            weights,
        })
    }

    pub fn query_len(&self) -> usize {
        self.weights.len()
    }

    /// Panics if the result holds a NaN.
    pub fn interpolate(&self, values: &[f64]) -> Result<Vec<f64>> {
        if values.len() != self.value_count {
            return Err(EngineError::Validation(format!(
                "{} data values given for {} data points",
                values.len(),
                self.value_count
            )));
        }
        let result: Vec<f64> = self
            .weights
            .iter()
            .map(|w| w.iter().map(|(i, weight)| weight * values[*i]).sum())
            .collect();
        assert!(
            result.iter().all(|v| !v.is_nan()),
            "interpolation produced NaN values"
        );
        Ok(result)
    }
}

fn cell_of(point: &[f64; 4]) -> Cell {
    point.map(|v| v.floor() as i64)
}

fn distance(a: &[f64; 4], b: &[f64; 4]) -> f64 {
    a.iter().zip(b).map(|(a, b)| (a - b).powi(2)).sum::<f64>().sqrt()
}

fn with_periodic_images(
    data_points: &[[f64; 4]],
    periods: [Option<f64>; 4],
    wrap_around: f64,
) -> (Vec<[f64; 4]>, Vec<usize>) {
    let mut points = data_points.to_vec();
    let mut sources: Vec<usize> = (0..data_points.len()).collect();
    if wrap_around <= 0.0 {
        return (points, sources);
    }
    for (dim, period) in periods.iter().enumerate() {
        let Some(period) = *period else { continue };
        let existing = points.len();
        for i in 0..existing {
            let value = points[i][dim];
            let shift = if value < wrap_around {
                period
            } else if value >= period - wrap_around {
                -period
            } else {
                continue;
            };
            let mut image = points[i];
            image[dim] += shift;
            points.push(image);
            sources.push(sources[i]);
        }
    }
    (points, sources)
}

/// Lowest and highest occupied cell per dimension.
fn cell_bounds(points: &[[f64; 4]]) -> (Cell, Cell) {
    let mut lo = [i64::MAX; 4];
    let mut hi = [i64::MIN; 4];
    for cell in points.iter().map(cell_of) {
        for dim in 0..4 {
            lo[dim] = lo[dim].min(cell[dim]);
            hi[dim] = hi[dim].max(cell[dim]);
        }
    }
    (lo, hi)
}

/// Chebyshev ring radius from `centre` beyond which no data point can lie.
fn search_limit(bounds: &(Cell, Cell), centre: &Cell) -> i64 {
    (0..4)
        .map(|dim| {
            (centre[dim] - bounds.0[dim])
                .abs()
                .max((bounds.1[dim] - centre[dim]).abs())
        })
        .max()
        .unwrap_or(0)
}

fn ring(radius: i64) -> impl Iterator<Item = Cell> {
    let range = move || -radius..=radius;
    range().flat_map(move |a| {
        range().flat_map(move |b| {
            range().flat_map(move |c| {
                range()
                    .map(move |d| [a, b, c, d])
                    .filter(move |o| o.iter().map(|v| v.abs()).max() == Some(radius))
            })
        })
    })
}

/// The `k` data points nearest to `query` as `(point index, distance)`, nearest first.
fn nearest(
    points: &[[f64; 4]],
    buckets: &HashMap<Cell, Vec<usize>>,
    query: &[f64; 4],
    k: usize,
    bounds: &(Cell, Cell),
) -> Vec<(usize, f64)> {
    let centre = cell_of(query);
    let max_radius = search_limit(bounds, &centre);
    let mut found: Vec<(usize, f64)> = Vec::new();
    let mut radius = 0;
    loop {
        for offset in ring(radius) {
            let cell = [
                centre[0] + offset[0],
                centre[1] + offset[1],
                centre[2] + offset[2],
                centre[3] + offset[3],
            ];
            if let Some(members) = buckets.get(&cell) {
                found.extend(members.iter().map(|&i| (i, distance(&points[i], query))));
            }
        }
        found.sort_by(|a, b| a.1.total_cmp(&b.1).then(a.0.cmp(&b.0)));
        // points outside the rings searched so far are at least `radius` away
        let settled = found.len() >= k && found[k - 1].1 <= radius as f64;
        if settled || radius >= max_radius {
            found.truncate(k);
            return found;
        }
        radius += 1;
    }
}

/// Inverse distance weights over data point sources.
fn blend(nearest: &[(usize, f64)], sources: &[usize]) -> Vec<(usize, f64)> {
    if let Some(&(i, d)) = nearest.first() {
        if d < COINCIDENCE {
            return vec![(sources[i], 1.0)];
        }
    }
    let total: f64 = nearest.iter().map(|(_, d)| 1.0 / d).sum();
    nearest
        .iter()
        .map(|&(i, d)| (sources[i], (1.0 / d) / total))
        .collect()
}

/// Owned cache of one interpolator.
///
/// The geometry is rebuilt only when no interpolator is cached or when the
/// data or query points differ from the cached ones.
#[derive(Debug)]
pub struct InterpolatorCache {
    options: InterpolatorOptions,
    periods: [Option<f64>; 4],
    cached: Option<CachedInterpolator>,
    builds: usize,
}

#[derive(Debug)]
struct CachedInterpolator {
    data_points: Vec<[f64; 4]>,
    query_points: Vec<[f64; 4]>,
    interpolator: Interpolator,
}

impl InterpolatorCache {
    pub fn new(options: InterpolatorOptions, periods: [Option<f64>; 4]) -> Self {
        Self {
            options,
            periods,
            cached: None,
            builds: 0,
        }
    }

    /// Number of times the geometry has been built.
    pub fn builds(&self) -> usize {
        self.builds
    }

    pub fn clear(&mut self) {
        self.cached = None;
    }

    pub fn interpolate(
        &mut self,
        data_points: &[[f64; 4]],
        data_values: &[f64],
        query_points: &[[f64; 4]],
    ) -> Result<Vec<f64>> {
        let reusable = self.cached.as_ref().is_some_and(|c| {
            c.data_points.as_slice() == data_points && c.query_points.as_slice() == query_points
        });
        if !reusable {
            let interpolator =
                Interpolator::new(data_points, query_points, self.periods, &self.options)?;
            self.builds += 1;
            self.cached = Some(CachedInterpolator {
                data_points: data_points.to_vec(),
                query_points: query_points.to_vec(),
                interpolator,
            });
        }
        match &self.cached {
            Some(cached) => cached.interpolator.interpolate(data_values),
            None => Err(EngineError::NotFound("interpolator cache is empty".to_string())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn options(neighbours: usize) -> InterpolatorOptions {
        InterpolatorOptions {
            neighbours,
            linear_interpolators: 1,
            wrap_around: 1.0,
        }
    }

    fn lattice() -> (Vec<[f64; 4]>, Vec<f64>) {
        let mut points = Vec::new();
        let mut values = Vec::new();
        for t in 0..4 {
            for x in 0..6 {
                for z in 0..2 {
                    points.push([t as f64, x as f64, 0.0, z as f64]);
                    values.push(t as f64 + 10.0 * x as f64 + 100.0 * z as f64);
                }
            }
        }
        (points, values)
    }

    #[test]
    fn test_exact_data_points_are_reproduced() {
        let (points, values) = lattice();
        let interpolator =
            Interpolator::new(&points, &points, [Some(4.0), Some(6.0), None, None], &options(8))
                .unwrap();
        let result = interpolator.interpolate(&values).unwrap();
        for (got, want) in result.iter().zip(&values) {
            assert!((got - want).abs() < 1e-12);
        }
    }

    #[test]
    fn test_midpoint_blends_neighbours() {
        let points = vec![[0.0, 0.0, 0.0, 0.0], [0.0, 2.0, 0.0, 0.0]];
        let interpolator =
            Interpolator::new(&points, &[[0.0, 1.0, 0.0, 0.0]], [None; 4], &options(2)).unwrap();
        let result = interpolator.interpolate(&[1.0, 3.0]).unwrap();
        assert!((result[0] - 2.0).abs() < 1e-12);
    }

    #[test]
    fn test_periodic_neighbour_across_seam() {
        // a query just below x = 6 is next to x = 0 through the seam
        let points = vec![[0.0, 0.0, 0.0, 0.0], [0.0, 3.0, 0.0, 0.0]];
        let interpolator = Interpolator::new(
            &points,
            &[[0.0, 5.99, 0.0, 0.0]],
            [None, Some(6.0), None, None],
            &options(1),
        )
        .unwrap();
        assert_eq!(interpolator.interpolate(&[7.0, -1.0]).unwrap(), vec![7.0]);
    }

    #[test]
    fn test_cache_swaps_values_without_rebuilding() {
        let (points, values) = lattice();
        let queries = vec![[1.5, 2.5, 0.0, 0.5], [0.0, 0.0, 0.0, 1.0]];
        let mut cache = InterpolatorCache::new(options(8), [Some(4.0), Some(6.0), None, None]);

        let first = cache.interpolate(&points, &values, &queries).unwrap();
        let doubled: Vec<f64> = values.iter().map(|v| 2.0 * v).collect();
        let second = cache.interpolate(&points, &doubled, &queries).unwrap();
        assert_eq!(cache.builds(), 1);
        for (a, b) in first.iter().zip(&second) {
            assert!((2.0 * a - b).abs() < 1e-9);
        }

        cache.interpolate(&points, &values, &queries[..1]).unwrap();
        assert_eq!(cache.builds(), 2);
        cache.clear();
        cache.interpolate(&points, &values, &queries[..1]).unwrap();
        assert_eq!(cache.builds(), 3);
    }

    #[test]
    fn test_rejects_mismatched_values() {
        let (points, values) = lattice();
        let interpolator =
            Interpolator::new(&points, &points[..1], [None; 4], &options(4)).unwrap();
        assert!(interpolator.interpolate(&values[1..]).is_err());
        assert!(Interpolator::new(&[], &points, [None; 4], &options(4)).is_err());
    }

    #[test]
    #[should_panic(expected = "NaN")]
    fn test_nan_output_is_an_invariant_violation() {
        let points = vec![[0.0, 0.0, 0.0, 0.0]];
        let interpolator =
            Interpolator::new(&points, &[[0.5, 0.0, 0.0, 0.0]], [None; 4], &options(1)).unwrap();
        let _ = interpolator.interpolate(&[f64::NAN]);
    }
}
