use std::fmt;

use crate::format::scientific;

/// Digits after the decimal point of floating point columns.
const LOG_DIGITS: usize = 16;

/// One line of the step log.
///
/// Columns, space separated: time, successful steps, failed steps, max
/// error ratio, mean absolute speed, cutoff, order parameter, external
/// stress, wall-clock seconds since the previous line, accumulated strain,
/// sum of squared speeds, energy. Counters are integers, disabled
/// quantities print as `-` and everything else as `%.16e`.
///
/// Speeds, and the order parameter `Σ b·v`, are evaluated for the accepted
/// configuration under the stress at its start, the same speeds the next
/// step starts from.
#[derive(Debug, Clone, PartialEq)]
pub struct StepRecord {
    pub time: f64,
    pub successful_steps: u64,
    pub failed_steps: u64,
    pub max_error_ratio_sqr: f64,
    pub average_speed: f64,
    pub cutoff: f64,
    pub order_parameter: Option<f64>,
    pub external_stress: f64,
    pub wall_seconds: Option<f64>,
    pub strain: Option<f64>,
    pub speed_square_sum: f64,
    pub energy: f64,
}

struct Column(Option<f64>);

impl fmt::Display for Column {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.0 {
            Some(value) => f.write_str(&scientific(value, LOG_DIGITS)),
            None => f.write_str("-"),
        }
    }
}

fn g(value: f64) -> Column {
    Column(Some(value))
}

impl fmt::Display for StepRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} {} {} {} {} {} {} {} {} {} {} {}",
            g(self.time),
            self.successful_steps,
            self.failed_steps,
            g(self.max_error_ratio_sqr),
            g(self.average_speed),
            g(self.cutoff),
            Column(self.order_parameter),
            g(self.external_stress),
            Column(self.wall_seconds),
            Column(self.strain),
            g(self.speed_square_sum),
            g(self.energy)
        )
    }
}
