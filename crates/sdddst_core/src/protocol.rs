use serde::{Deserialize, Serialize};

/// Instants within one adaptive step at which the external stress is cached.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum StressSlot {
    Original,
    EndOfBigStep,
    EndOfFirstSmallStep,
    EndOfSecondSmallStep,
}

impl StressSlot {
    fn index(self) -> usize {
        match self {
            StressSlot::Original => 0,
            StressSlot::EndOfBigStep => 1,
            StressSlot::EndOfFirstSmallStep => 2,
            StressSlot::EndOfSecondSmallStep => 3,
        }
    }
}

/// Last stress value computed for every slot.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct SlotValues([f64; 4]);

impl SlotValues {
    fn get(&self, slot: StressSlot) -> f64 {
        self.0[slot.index()]
    }

    fn set(&mut self, slot: StressSlot, value: f64) {
        self.0[slot.index()] = value;
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct FixedRateProtocol {
    pub rate: f64,
    values: SlotValues,
}

impl FixedRateProtocol {
    pub fn new(rate: f64) -> Self {
        Self {
            rate,
            values: SlotValues::default(),
        }
    }
}

/// Stress transmitted by a spring pulled at a constant rate.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SpringProtocol {
    pub rate: f64,
    pub spring_constant: f64,
    values: SlotValues,
}

impl SpringProtocol {
    pub fn new(rate: f64, spring_constant: f64) -> Self {
        Self {
            rate,
            spring_constant,
            values: SlotValues::default(),
        }
    }
}

/// Externally applied shear stress.
#[derive(Debug, Clone, Default, PartialEq)]
pub enum ExternalStress {
    #[default]
    Zero,
    FixedRate(FixedRateProtocol),
    Spring(SpringProtocol),
}

impl ExternalStress {
    /// Evaluates the stress at `time` and stores it in `slot`.
    ///
    /// `strain` is the accumulated plastic strain of the configuration the
    /// stress is evaluated for; only the spring protocol depends on it.
    pub fn calculate_stress(&mut self, time: f64, strain: f64, slot: StressSlot) {
        match self {
            ExternalStress::Zero => {}
            ExternalStress::FixedRate(protocol) => protocol.values.set(slot, protocol.rate * time),
            ExternalStress::Spring(protocol) => {
                let value = protocol.spring_constant * (protocol.rate * time - strain);
                protocol.values.set(slot, value.max(0.0));
            }
        }
    }

    pub fn stress(&self, slot: StressSlot) -> f64 {
        match self {
            ExternalStress::Zero => 0.0,
            ExternalStress::FixedRate(protocol) => protocol.values.get(slot),
            ExternalStress::Spring(protocol) => protocol.values.get(slot),
        }
    }

    /// Loading rate of the stress at the start of the current step.
    pub fn stress_derivative(&self, _time: f64) -> f64 {
        match self {
            ExternalStress::Zero => 0.0,
            ExternalStress::FixedRate(protocol) => protocol.rate,
            ExternalStress::Spring(protocol) => {
                if protocol.values.get(StressSlot::Original) > 0.0 {
                    protocol.spring_constant * protocol.rate
                } else {
                    0.0
                }
            }
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            ExternalStress::Zero => "zero-stress",
            ExternalStress::FixedRate(_) => "fixed-rate-stress",
            ExternalStress::Spring(_) => "spring-stress",
        }
    }

    pub fn is_zero(&self) -> bool {
        matches!(self, ExternalStress::Zero)
    }

    pub fn needs_strain(&self) -> bool {
        matches!(self, ExternalStress::Spring(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn zero_protocol_is_always_zero() {
        let mut stress = ExternalStress::Zero;
        stress.calculate_stress(10.0, 0.0, StressSlot::EndOfBigStep);
        assert_eq!(stress.stress(StressSlot::EndOfBigStep), 0.0);
        assert_eq!(stress.stress_derivative(10.0), 0.0);
        assert_eq!(stress.kind(), "zero-stress");
    }

    #[test]
    fn fixed_rate_slots_are_independent() {
        let mut stress = ExternalStress::FixedRate(FixedRateProtocol::new(2.0));
        stress.calculate_stress(1.0, 0.0, StressSlot::Original);
        stress.calculate_stress(1.5, 0.0, StressSlot::EndOfFirstSmallStep);
        stress.calculate_stress(2.0, 0.0, StressSlot::EndOfBigStep);
        assert_eq!(stress.stress(StressSlot::Original), 2.0);
        assert_eq!(stress.stress(StressSlot::EndOfFirstSmallStep), 3.0);
        assert_eq!(stress.stress(StressSlot::EndOfBigStep), 4.0);
        assert_eq!(stress.stress(StressSlot::EndOfSecondSmallStep), 0.0);
        assert_eq!(stress.stress_derivative(1.0), 2.0);
        assert_eq!(stress.kind(), "fixed-rate-stress");
    }

    #[test]
    fn spring_stress_never_goes_negative() {
        let mut stress = ExternalStress::Spring(SpringProtocol::new(1.0, 3.0));
        stress.calculate_stress(2.0, 0.5, StressSlot::Original);
        assert!((stress.stress(StressSlot::Original) - 4.5).abs() < 1e-15);
        assert_eq!(stress.stress_derivative(2.0), 3.0);

        stress.calculate_stress(2.0, 5.0, StressSlot::Original);
        assert_eq!(stress.stress(StressSlot::Original), 0.0);
        assert_eq!(stress.stress_derivative(2.0), 0.0);
        assert!(stress.needs_strain());
    }
}
