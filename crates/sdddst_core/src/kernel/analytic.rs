use std::f64::consts::PI;

use super::StressKernel;
use crate::error::{Result, SimulationError};

/// Number of periodic images summed on each side.
pub const DEFAULT_IMAGE_COUNT: usize = 8;

/// Below this squared distance the central image uses its leading-order expansion.
const TAYLOR_RADIUS_SQ: f64 = 1e-12;

/// Closed-form image sum of the stress of a dislocation wall.
///
/// Every image `k` contributes the field of an infinite wall along `y`
/// placed at `x = k`, which already carries the `y` periodicity. The two
/// outermost images are weighted linearly in `dx` so that the sum stays
/// periodic in `x` as well.
#[derive(Debug, Clone, Copy)]
pub struct AnalyticKernel {
    images: usize,
}

impl Default for AnalyticKernel {
    fn default() -> Self {
        Self {
            images: DEFAULT_IMAGE_COUNT,
        }
    }
}

impl AnalyticKernel {
    pub fn new(images: usize) -> Result<Self> {
        if images == 0 {
            return Err(SimulationError::InvalidSettings(
                "the analytic kernel needs at least one image".to_string(),
            ));
        }
        Ok(Self { images })
    }

    pub fn images(&self) -> usize {
        self.images
    }
}

/// Terms of a wall field that only depend on `dy`.
#[derive(Clone, Copy)]
struct Row {
    sin_sq: f64,
    cos: f64,
}

impl Row {
    fn new(dy: f64) -> Self {
        let s = (PI * dy).sin();
        let sin_sq = s * s;
        Self {
            sin_sq,
            cos: 1.0 - 2.0 * sin_sq,
        }
    }
}

// cosh(2πx) - cos(2πy) and cosh(2πx)cos(2πy) - 1 written with half angles,
// which keeps both finite-precision accurate when x and y are small.
fn wall_parts(x: f64, row: Row) -> (f64, f64) {
    let sh = (PI * x).sinh();
    let sh_sq = sh * sh;
    let denominator = 2.0 * (sh_sq + row.sin_sq);
    let numerator = 2.0 * (sh_sq - row.sin_sq) - 4.0 * sh_sq * row.sin_sq;
    (numerator, denominator)
}

fn wall(x: f64, row: Row) -> f64 {
    let (numerator, denominator) = wall_parts(x, row);
    x * numerator / (denominator * denominator)
}

fn wall_dx(x: f64, row: Row) -> f64 {
    let (numerator, denominator) = wall_parts(x, row);
    let sinh_2pi = (2.0 * PI * x).sinh();
    let d2 = denominator * denominator;
    numerator / d2
        + x * (2.0 * PI * sinh_2pi * row.cos / d2
            - 4.0 * PI * sinh_2pi * numerator / (d2 * denominator))
}

fn central(dx: f64, dy: f64, row: Row) -> f64 {
    let r2 = dx * dx + dy * dy;
    if r2 < TAYLOR_RADIUS_SQ {
        dx * (dx * dx - dy * dy) / (2.0 * PI * PI * r2 * r2)
    } else {
        wall(dx, row)
    }
}

fn central_dx(dx: f64, dy: f64, row: Row) -> f64 {
    let r2 = dx * dx + dy * dy;
    if r2 < TAYLOR_RADIUS_SQ {
        let (x2, y2) = (dx * dx, dy * dy);
        -(x2 * x2 + y2 * y2 - 6.0 * x2 * y2) / (2.0 * PI * PI * r2 * r2 * r2)
    } else {
        wall_dx(dx, row)
    }
}

fn check_separation(dx: f64, dy: f64) -> Result<()> {
    if dx * dx + dy * dy == 0.0 {
        return Err(SimulationError::CoincidentPositions);
    }
    Ok(())
}

impl StressKernel for AnalyticKernel {
    fn xy(&self, dx: f64, dy: f64) -> Result<f64> {
        check_separation(dx, dy)?;
        let row = Row::new(dy);
        let n = self.images as f64;

        let mut sum = central(dx, dy, row);
        for k in 1..self.images {
            let k = k as f64;
            sum += wall(dx - k, row) + wall(dx + k, row);
        }

        let edge = if dx < 0.0 {
            -dx * wall(dx + n + 1.0, row) + (1.0 + dx) * wall(dx - n, row) + wall(dx + n, row)
        } else {
            dx * wall(dx - n - 1.0, row) + (1.0 - dx) * wall(dx + n, row) + wall(dx - n, row)
        };
        Ok(sum + edge)
    }

    fn xy_diff_x(&self, dx: f64, dy: f64) -> Result<f64> {
        check_separation(dx, dy)?;
        let row = Row::new(dy);
        let n = self.images as f64;

        let mut sum = central_dx(dx, dy, row);
        for k in 1..self.images {
            let k = k as f64;
            sum += wall_dx(dx - k, row) + wall_dx(dx + k, row);
        }

        let edge = if dx < 0.0 {
            -wall(dx + n + 1.0, row) - dx * wall_dx(dx + n + 1.0, row)
                + (1.0 + dx) * wall_dx(dx - n, row)
                + wall(dx - n, row)
                + wall_dx(dx + n, row)
        } else {
            wall(dx - n - 1.0, row) + dx * wall_dx(dx - n - 1.0, row)
                + (1.0 - dx) * wall_dx(dx + n, row)
                - wall(dx + n, row)
                + wall_dx(dx - n, row)
        };
        Ok(sum + edge)
    }
}
