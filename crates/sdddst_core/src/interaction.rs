//! Glide speeds from dislocation-dislocation, pinning and external stresses.

use std::f64::consts::PI;

use serde::{Deserialize, Serialize};

use crate::dislocation::{displacement, Dislocation, PointDefect};
use crate::error::Result;
use crate::kernel::StressKernel;
use crate::precision::PrecisionHandler;

/// Below this value of `K·R` the pinning profile is evaluated from its series.
const SERIES_THRESHOLD: f64 = 1e-3;

/// Periodic replacement of `u`.
fn periodic_offset(u: f64) -> f64 {
    (2.0 * PI * u).sin() * 0.5 / PI
}

/// Periodic replacement of `u²`.
fn periodic_sqr(u: f64) -> f64 {
    let s = (PI * u).sin();
    s * s / (PI * PI)
}

/// Short-range interaction of a dislocation with a point defect.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Pinning {
    /// Interaction strength `A`.
    pub strength: f64,
    /// Screening factor `KASQR`.
    pub screening: f64,
}

impl Default for Pinning {
    fn default() -> Self {
        Self {
            strength: 16e-4,
            screening: 1.65 * 1.65 * 1e6 / 256.0,
        }
    }
}

impl Pinning {
    /// Constants rescaled to a cell holding `dislocation_count` dislocations.
    pub fn scaled(&self, dislocation_count: usize) -> Self {
        let n = dislocation_count.max(1) as f64;
        Self {
            strength: self.strength / n.sqrt(),
            screening: self.screening * n,
        }
    }

    /// `h(R) = ((1 - e^{-KR})/R - K e^{-KR}) / R` and `h'(R)`.
    fn profile(&self, r: f64) -> (f64, f64) {
        let k = self.screening;
        if k * r < SERIES_THRESHOLD {
            let (k2, k3) = (k * k, k * k * k);
            let (k4, k5) = (k3 * k, k3 * k2);
            let h = k2 / 2.0 - k3 * r / 3.0 + k4 * r * r / 8.0 - k5 * r * r * r / 30.0;
            let dh = -k3 / 3.0 + k4 * r / 4.0 - k5 * r * r / 10.0;
            return (h, dh);
        }
        let e = (-k * r).exp();
        let one_minus_e = -(-k * r).exp_m1();
        let h = (one_minus_e / r - k * e) / r;
        let dh = 2.0 * k * e / (r * r) - 2.0 * one_minus_e / (r * r * r) + k * k * e / r;
        (h, dh)
    }

    /// Pinning stress for the periodic displacement `(dx, dy)` from a defect,
    /// together with the periodic squared distance.
    pub fn stress(&self, dx: f64, dy: f64) -> (f64, f64) {
        let r = periodic_sqr(dx) + periodic_sqr(dy);
        let (h, _) = self.profile(r);
        (
            2.0 * self.strength * periodic_offset(dx) * periodic_offset(dy) * h,
            r,
        )
    }

    /// Derivative of [`Pinning::stress`] with respect to `dx`.
    pub fn stress_diff_x(&self, dx: f64, dy: f64) -> f64 {
        let r = periodic_sqr(dx) + periodic_sqr(dy);
        let (h, dh) = self.profile(r);
        let x = periodic_offset(dx);
        let y = periodic_offset(dy);
        let dx_offset = (2.0 * PI * dx).cos();
        let dx_sqr = (2.0 * PI * dx).sin() / PI;
        2.0 * self.strength * (dx_offset * y * h + x * y * dh * dx_sqr)
    }
}

/// Everything the glide speed of a dislocation depends on besides positions.
pub struct ForceField<'a, K: StressKernel> {
    pub kernel: &'a K,
    pub points: &'a [PointDefect],
    pub pinning: Pinning,
}

impl<'a, K: StressKernel> ForceField<'a, K> {
    /// Glide speed of every dislocation under `external_stress`.
    ///
    /// The pairwise sum is complete; the Jacobian cutoff does not apply
    /// here. Every separation encountered tightens the tolerance of the
    /// dislocations involved.
    pub fn speeds(
        &self,
        positions: &[Dislocation],
        external_stress: f64,
        precision: &mut PrecisionHandler,
        out: &mut [f64],
    ) -> Result<()> {
        out.fill(0.0);
        for (i, a) in positions.iter().enumerate() {
            for (j, b) in positions.iter().enumerate().skip(i + 1) {
                let (dx, dy) = displacement(a.x, a.y, b.x, b.y);
                let tmp = a.b * b.b * self.kernel.xy(dx, dy)?;

                let r2 = dx * dx + dy * dy;
                precision.update_tolerance(r2, i);
                precision.update_tolerance(r2, j);

                out[i] += tmp;
                out[j] -= tmp;
            }

            for point in self.points {
                let (dx, dy) = displacement(a.x, a.y, point.x, point.y);
                let (stress, r) = self.pinning.stress(dx, dy);
                out[i] -= stress * a.b;
                precision.update_tolerance(r, i);
            }

            out[i] += a.b * external_stress;
        }
        Ok(())
    }
}
