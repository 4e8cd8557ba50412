//! Pairwise shear stress kernels under periodic boundary conditions.
//!
//! Both kernels take a displacement already reduced to `[-0.5, 0.5)` in
//! each direction and return the `xy` shear stress of a unit dislocation
//! together with its derivative along the glide direction.

mod analytic;
mod table;

pub use analytic::AnalyticKernel;
pub use table::{table_file_name, TableKernel, TableQuantity, DEFAULT_TABLE_SIZE};

use crate::error::Result;

pub trait StressKernel {
    /// Shear stress at displacement `(dx, dy)`.
    fn xy(&self, dx: f64, dy: f64) -> Result<f64>;

    /// Derivative of [`StressKernel::xy`] with respect to `dx`.
    fn xy_diff_x(&self, dx: f64, dy: f64) -> Result<f64>;
}

/// Closed set of kernels a simulation can be configured with.
#[derive(Debug, Clone)]
pub enum Kernel {
    Analytic(AnalyticKernel),
    Table(TableKernel),
}

impl Kernel {
    pub fn name(&self) -> &'static str {
        match self {
            Kernel::Analytic(_) => "analytic",
            Kernel::Table(_) => "table",
        }
    }
}

impl Default for Kernel {
    fn default() -> Self {
        Kernel::Analytic(AnalyticKernel::default())
    }
}

impl StressKernel for Kernel {
    fn xy(&self, dx: f64, dy: f64) -> Result<f64> {
        match self {
            Kernel::Analytic(kernel) => kernel.xy(dx, dy),
            Kernel::Table(kernel) => kernel.xy(dx, dy),
        }
    }

    fn xy_diff_x(&self, dx: f64, dy: f64) -> Result<f64> {
        match self {
            Kernel::Analytic(kernel) => kernel.xy_diff_x(dx, dy),
            Kernel::Table(kernel) => kernel.xy_diff_x(dx, dy),
        }
    }
}

/// Central difference of `xy` along `dx`; used to check derivatives.
#[cfg(test)]
pub(crate) fn central_difference(kernel: &impl StressKernel, dx: f64, dy: f64, h: f64) -> f64 {
    let plus = kernel.xy(dx + h, dy).expect("xy should evaluate");
    let minus = kernel.xy(dx - h, dy).expect("xy should evaluate");
    (plus - minus) / (2.0 * h)
}
