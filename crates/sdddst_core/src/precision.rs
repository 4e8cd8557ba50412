use log::warn;

/// Tolerance floor used when two positions coincide exactly.
pub const EPS: f64 = 1e-12;

/// Per-dislocation tolerance and error bookkeeping for the adaptive step.
///
/// Tolerances are tightened while speeds are evaluated (a dislocation may
/// not move more than a fraction of its distance to the closest neighbour)
/// and errors are recorded from the full step vs. two half steps
/// comparison. The step is accepted while the largest `error² / tolerance`
/// stays below one.
#[derive(Debug, Clone)]
pub struct PrecisionHandler {
    min_precision_sqr: f64,
    tolerance_and_error: Vec<(f64, f64)>,
    max_error_ratio_sqr: f64,
    selected_id: usize,
}

impl Default for PrecisionHandler {
    fn default() -> Self {
        Self::new(1e-6)
    }
}

impl PrecisionHandler {
    pub fn new(min_precision: f64) -> Self {
        Self {
            min_precision_sqr: min_precision * min_precision,
            tolerance_and_error: Vec::new(),
            max_error_ratio_sqr: 0.0,
            selected_id: 0,
        }
    }

    pub fn set_size(&mut self, size: usize) {
        let seed = (self.min_precision_sqr, 0.0);
        self.tolerance_and_error.resize(size, seed);
    }

    pub fn size(&self) -> usize {
        self.tolerance_and_error.len()
    }

    pub fn update_tolerance(&mut self, distance_sqr: f64, id: usize) {
        let candidate = distance_sqr * 0.25 * 1e-2;
        let entry = &mut self.tolerance_and_error[id];
        if candidate < self.min_precision_sqr && candidate < entry.0 {
            if candidate == 0.0 {
                warn!("Dislocation {id} shares its position with another particle");
                entry.0 = EPS;
            } else {
                entry.0 = candidate;
            }
        }
    }

    pub fn update_error(&mut self, error: f64, id: usize) {
        let entry = &mut self.tolerance_and_error[id];
        if entry.1 < error {
            entry.1 = error;
            let ratio = error * error / entry.0;
            if ratio > self.max_error_ratio_sqr {
                self.max_error_ratio_sqr = ratio;
                self.selected_id = id;
            }
        }
    }

    pub fn tolerance(&self, id: usize) -> f64 {
        self.tolerance_and_error[id].0
    }

    pub fn max_error_ratio_sqr(&self) -> f64 {
        self.max_error_ratio_sqr
    }

    /// Dislocation responsible for the largest error ratio.
    pub fn selected_id(&self) -> usize {
        self.selected_id
    }

    pub fn is_acceptable(&self) -> bool {
        self.max_error_ratio_sqr < 1.0
    }

    pub fn new_step_size(&self, old_step_size: f64) -> f64 {
        if self.max_error_ratio_sqr == 0.0 {
            return old_step_size * 2.0;
        }
        let factor = (1.0 / self.max_error_ratio_sqr.sqrt()).powf(1.0 / 3.0).min(2.0);
        0.9 * old_step_size * factor
    }

    pub fn reset(&mut self) {
        self.max_error_ratio_sqr = 0.0;
        self.selected_id = 0;
        for entry in &mut self.tolerance_and_error {
            *entry = (self.min_precision_sqr, 0.0);
        }
    }
}
