//! Sparse linearization of the implicit update.
//!
//! The matrix is stored column-compressed in an arena that only grows, in
//! steps of the dislocation count. Column `j` holds the derivative of every
//! neighbour's speed with respect to `x_j`; rows within a column are kept
//! sorted so the transpose entry can be found by binary search.

use nalgebra_sparse::CscMatrix;

use crate::dislocation::{displacement, Dislocation, PointDefect};
use crate::error::{Result, SimulationError};
use crate::interaction::Pinning;
use crate::kernel::StressKernel;

/// Multiplier treated as an unlimited cutoff.
pub const INFINITE_CUTOFF_MULTIPLIER: f64 = 1e20;

/// Pairs farther than the cutoff are kept while `(r - r_c)² < 36.8 r_c²`.
const NEIGHBOURHOOD_FACTOR: f64 = 36.8;

/// Neighbourhood of the Jacobian approximation.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Cutoff {
    multiplier: f64,
    radius: f64,
    radius_sqr: f64,
    inverse_radius_sqr: f64,
}

impl Cutoff {
    /// Cutoff for `dislocation_count` dislocations, in units of their mean spacing.
    pub fn new(multiplier: f64, dislocation_count: usize) -> Self {
        let n = dislocation_count.max(1) as f64;
        let multiplier = if multiplier >= (2.0 * n).sqrt() / 12.0 {
            INFINITE_CUTOFF_MULTIPLIER
        } else {
            multiplier
        };
        let radius = multiplier / n.sqrt();
        let radius_sqr = radius * radius;
        Self {
            multiplier,
            radius,
            radius_sqr,
            inverse_radius_sqr: 1.0 / radius_sqr,
        }
    }

    pub fn multiplier(&self) -> f64 {
        self.multiplier
    }

    pub fn radius(&self) -> f64 {
        self.radius
    }

    /// Weight of a pair at squared distance `r2`, or `None` outside the neighbourhood.
    pub fn attenuation(&self, r2: f64) -> Option<f64> {
        let excess = r2.sqrt() - self.radius;
        if excess * excess >= NEIGHBOURHOOD_FACTOR * self.radius_sqr {
            return None;
        }
        if r2 > self.radius_sqr {
            Some((-excess * excess * self.inverse_radius_sqr).exp())
        } else {
            Some(1.0)
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct SparseJacobian {
    dim: usize,
    col_offsets: Vec<usize>,
    row_indices: Vec<usize>,
    values: Vec<f64>,
    diagonal: Vec<usize>,
    damping: Vec<f64>,
}

impl SparseJacobian {
    pub fn new(dim: usize) -> Result<Self> {
        let mut jacobian = Self::default();
        jacobian.resize(dim)?;
        Ok(jacobian)
    }

    /// Sets the dimension; the arena starts out with room for one entry per column.
    pub fn resize(&mut self, dim: usize) -> Result<()> {
        self.dim = dim;
        self.col_offsets = vec![0; dim + 1];
        self.diagonal = vec![0; dim];
        self.damping = vec![0.0; dim];
        if self.values.len() < dim {
            self.grow(dim - self.values.len())?;
        }
        Ok(())
    }

    fn grow(&mut self, additional: usize) -> Result<()> {
        let oom = |_| SimulationError::OutOfMemory {
            requested: additional,
        };
        self.values.try_reserve_exact(additional).map_err(oom)?;
        self.row_indices.try_reserve_exact(additional).map_err(oom)?;
        let capacity = self.values.len() + additional;
        self.values.resize(capacity, 0.0);
        self.row_indices.resize(capacity, 0);
        Ok(())
    }

    /// A column holds at most `dim` entries.
    fn reserve_column(&mut self, used: usize) -> Result<()> {
        if self.values.len() - used < self.dim {
            self.grow(self.dim)?;
        }
        Ok(())
    }

    fn stored(&self, column: usize, row: usize) -> Option<f64> {
        let range = self.col_offsets[column]..self.col_offsets[column + 1];
        let rows = &self.row_indices[range.clone()];
        rows.binary_search(&row)
            .ok()
            .map(|offset| self.values[range.start + offset])
    }

    /// Builds `M = S·K + I` for the sub-step `step_size` at `positions`.
    ///
    /// `K` is `-step_size` times the speed Jacobian restricted to the cutoff
    /// neighbourhood, `S = diag((1 + d)/2)` and `d` is the per-dislocation
    /// damping weight derived from the diagonal stiffness.
    pub fn assemble<K: StressKernel>(
        &mut self,
        step_size: f64,
        positions: &[Dislocation],
        points: &[PointDefect],
        kernel: &K,
        pinning: &Pinning,
        cutoff: &Cutoff,
    ) -> Result<()> {
        if positions.len() != self.dim {
            self.resize(positions.len())?;
        }
        let n = self.dim;
        let mut used = 0;

        for j in 0..n {
            self.reserve_column(used)?;
            let current = &positions[j];

            for i in 0..j {
                if let Some(value) = self.stored(i, j) {
                    self.row_indices[used] = i;
                    self.values[used] = value;
                    used += 1;
                }
            }

            let mut pinning_stiffness = 0.0;
            for point in points {
                let (dx, dy) = displacement(current.x, current.y, point.x, point.y);
                if let Some(weight) = cutoff.attenuation(dx * dx + dy * dy) {
                    pinning_stiffness += current.b * pinning.stress_diff_x(dx, dy) * weight;
                }
            }
            self.diagonal[j] = used;
            self.row_indices[used] = j;
            self.values[used] = -pinning_stiffness * step_size;
            used += 1;

            for (i, other) in positions.iter().enumerate().skip(j + 1) {
                let (dx, dy) = displacement(other.x, other.y, current.x, current.y);
                if let Some(weight) = cutoff.attenuation(dx * dx + dy * dy) {
                    self.row_indices[used] = i;
                    self.values[used] =
                        step_size * other.b * current.b * kernel.xy_diff_x(dx, dy)? * weight;
                    used += 1;
                }
            }
            self.col_offsets[j + 1] = used;
        }

        for j in 0..n {
            let range = self.col_offsets[j]..self.col_offsets[j + 1];
            let stiffness = -self.values[range].iter().sum::<f64>();
            self.values[self.diagonal[j]] = stiffness;
            self.damping[j] = if stiffness > 0.0 {
                let t = 1.0 / stiffness + 1.0;
                1.0 / (t * t)
            } else {
                0.0
            };
        }

        for j in 0..n {
            for k in self.col_offsets[j]..self.col_offsets[j + 1] {
                self.values[k] *= (1.0 + self.damping[self.row_indices[k]]) * 0.5;
            }
            self.values[self.diagonal[j]] += 1.0;
        }
        Ok(())
    }

    pub fn dim(&self) -> usize {
        self.dim
    }

    pub fn nnz(&self) -> usize {
        self.col_offsets[self.dim]
    }

    /// Allocated arena size in entries.
    pub fn capacity(&self) -> usize {
        self.values.len()
    }

    pub fn damping(&self) -> &[f64] {
        &self.damping
    }

    /// Row scaling `(1 + d_i)/2` applied during assembly.
    pub fn row_scale(&self, row: usize) -> f64 {
        (1.0 + self.damping[row]) * 0.5
    }

    /// Entry at `(row, column)`, zero when outside the pattern.
    pub fn get(&self, row: usize, column: usize) -> f64 {
        self.stored(column, row).unwrap_or(0.0)
    }

    /// Copy of the assembled matrix with every row divided by its scaling.
    ///
    /// Undoing `S` restores the symmetric `K + S⁻¹`.
    pub fn symmetrized(&self) -> Result<CscMatrix<f64>> {
        let nnz = self.nnz();
        let rows = self.row_indices[..nnz].to_vec();
        let values = self.values[..nnz]
            .iter()
            .zip(&rows)
            .map(|(value, &row)| value / self.row_scale(row))
            .collect();
        CscMatrix::try_from_csc_data(self.dim, self.dim, self.col_offsets.clone(), rows, values)
            .map_err(|err| SimulationError::SparseStructure(err.to_string()))
    }
}
