//! The adaptive implicit integrator.
//!
//! One step advances the configuration with a full implicit step and with
//! two half steps; their difference estimates the local error, which
//! decides acceptance and the next step size. Each sub-step is a short
//! Newton-like iteration on the x coordinates using the sparse Jacobian.

use std::fmt;
use std::fs;
use std::io::Write;
use std::time::Instant;

use log::{info, warn};

use crate::dislocation::{strain_increment, Dislocation};
use crate::error::{Result, SimulationError};
use crate::interaction::ForceField;
use crate::io;
use crate::jacobian::INFINITE_CUTOFF_MULTIPLIER;
use crate::linear_solver::Factorization;
use crate::precision::PrecisionHandler;
use crate::protocol::StressSlot;
use crate::report::StepRecord;
use crate::state::{RunCounters, SimulationState};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StepOutcome {
    Accepted,
    Rejected,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopReason {
    TimeLimit,
    StepCountLimit,
    StrainIncreaseLimit,
    AvalancheLimit,
    SpeedLimit,
    ExternalStressLimit,
}

impl fmt::Display for StopReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            StopReason::TimeLimit => "time limit reached",
            StopReason::StepCountLimit => "step count limit reached",
            StopReason::StrainIncreaseLimit => "strain increase limit reached",
            StopReason::AvalancheLimit => "avalanche limit reached",
            StopReason::SpeedLimit => "average speed limit reached",
            StopReason::ExternalStressLimit => "external stress limit reached",
        };
        f.write_str(text)
    }
}

/// Snapshot a sub-step writes into; the start positions follow from it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Target {
    BigStep,
    FirstSmall,
    SecondSmall,
}

/// Pair of speed buffers used as (initial, current).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SpeedSet {
    Primary,
    Secondary,
}

#[derive(Debug, Clone, Copy)]
struct SubStep {
    step_size: f64,
    target: Target,
    speeds: SpeedSet,
    compute_initial: bool,
    origin: StressSlot,
    end: StressSlot,
}

/// Updates the avalanche state from the average speed of an accepted step.
fn track_avalanche(counters: &mut RunCounters, average_speed: f64, threshold: f64) {
    if counters.in_avalanche && average_speed < threshold {
        counters.avalanche_count += 1;
        counters.in_avalanche = false;
    } else if average_speed > threshold {
        counters.in_avalanche = true;
    }
}

fn square_sum(speeds: &[f64]) -> f64 {
    speeds.iter().map(|v| v * v).sum()
}

/// Drives a [`SimulationState`] forward, writing one [`StepRecord`] per
/// accepted step into `log`.
pub struct Simulation<'a, W: Write> {
    state: &'a mut SimulationState,
    precision: PrecisionHandler,
    log: W,
    first_step: bool,
    last_wall_clock: Instant,
    energy_accumulator: f64,
}

impl<'a, W: Write> Simulation<'a, W> {
    pub fn new(state: &'a mut SimulationState, log: W) -> Result<Self> {
        state.settings.validate()?;
        let n = state.dislocation_count();
        if n == 0 {
            return Err(SimulationError::NoDislocations);
        }
        if state.settings.limits.is_empty() {
            warn!("No stop limit is set, the simulation runs until interrupted");
        }
        if let Some(sub) = &state.settings.sub_configurations {
            fs::create_dir_all(&sub.directory)
                .map_err(|err| SimulationError::io(&sub.directory, err))?;
        }

        let mut precision = PrecisionHandler::new(state.settings.position_precision);
        precision.set_size(n);

        info!(
            "Simulating {n} dislocations and {} point defects with the {} kernel, {} protocol, cutoff {:e}",
            state.points.len(),
            state.kernel.name(),
            state.external_stress.kind(),
            state.cutoff.radius()
        );

        Ok(Self {
            state,
            precision,
            log,
            first_step: true,
            last_wall_clock: Instant::now(),
            energy_accumulator: 0.0,
        })
    }

    pub fn state(&self) -> &SimulationState {
        &*self.state
    }

    pub fn precision(&self) -> &PrecisionHandler {
        &self.precision
    }

    pub fn log(&self) -> &W {
        &self.log
    }

    /// Steps until a stop limit holds, then writes the result configuration
    /// if a path is configured.
    pub fn run(&mut self) -> Result<StopReason> {
        let reason = loop {
            if let Some(reason) = self.stop_reason() {
                break reason;
            }
            self.step()?;
        };
        self.log.flush().map_err(SimulationError::Log)?;
        info!(
            "Simulation stopped at t = {:e} after {} accepted and {} rejected steps: {reason}",
            self.state.sim_time, self.state.counters.successful_steps, self.state.counters.failed_steps
        );

        if let Some(path) = &self.state.settings.result_path {
            io::write_dislocations(path, &self.state.dislocations)?;
            info!("Final configuration written to {}", path.display());
        }
        Ok(reason)
    }

    /// First limit that holds for the current state.
    pub fn stop_reason(&self) -> Option<StopReason> {
        let state = &*self.state;
        let limits = &state.settings.limits;
        let counters = &state.counters;
        if limits.time.is_some_and(|limit| state.sim_time >= limit) {
            return Some(StopReason::TimeLimit);
        }
        if limits
            .strain_increase
            .is_some_and(|limit| counters.accumulated_strain >= limit)
        {
            return Some(StopReason::StrainIncreaseLimit);
        }
        if limits
            .step_count
            .is_some_and(|limit| counters.successful_steps >= limit)
        {
            return Some(StopReason::StepCountLimit);
        }
        if state.settings.count_avalanches
            && limits
                .avalanche_count
                .is_some_and(|limit| counters.avalanche_count >= limit)
        {
            return Some(StopReason::AvalancheLimit);
        }
        if limits
            .average_speed
            .is_some_and(|limit| counters.average_speed >= limit)
        {
            return Some(StopReason::SpeedLimit);
        }
        if limits.external_stress.is_some_and(|limit| {
            state.external_stress.stress(StressSlot::Original) >= limit
        }) {
            return Some(StopReason::ExternalStressLimit);
        }
        None
    }

    /// One adaptive step: full step, two half steps, then accept or reject.
    pub fn step(&mut self) -> Result<StepOutcome> {
        self.full_step()?;
        self.first_half_step()?;
        let outcome = self.second_half_step()?;

        let next = self.precision.new_step_size(self.state.step_size);
        self.precision.reset();
        let next = match self.state.settings.max_step_size {
            Some(max) if next > max => max,
            _ => next,
        };
        if !(next.is_finite() && next > 0.0) {
            return Err(SimulationError::StepSizeCollapsed(next));
        }
        self.state.step_size = next;
        Ok(outcome)
    }

    fn full_step(&mut self) -> Result<()> {
        self.energy_accumulator = 0.0;
        if self.first_step {
            self.write_first_line()?;
            self.first_step = false;
        }

        let state = &mut *self.state;
        state.snapshots.big_step.clone_from(&state.dislocations);
        self.integrate(SubStep {
            step_size: self.state.step_size,
            target: Target::BigStep,
            speeds: SpeedSet::Primary,
            compute_initial: false,
            origin: StressSlot::Original,
            end: StressSlot::EndOfBigStep,
        })
    }

    fn first_half_step(&mut self) -> Result<()> {
        let state = &mut *self.state;
        state.snapshots.first_small.clone_from(&state.dislocations);
        self.integrate(SubStep {
            step_size: 0.5 * self.state.step_size,
            target: Target::FirstSmall,
            speeds: SpeedSet::Primary,
            compute_initial: true,
            origin: StressSlot::Original,
            end: StressSlot::EndOfFirstSmallStep,
        })
    }

    fn second_half_step(&mut self) -> Result<StepOutcome> {
        let snapshots = &mut self.state.snapshots;
        snapshots.second_small.clone_from(&snapshots.first_small);
        self.integrate(SubStep {
            step_size: 0.5 * self.state.step_size,
            target: Target::SecondSmall,
            speeds: SpeedSet::Secondary,
            compute_initial: true,
            origin: StressSlot::EndOfFirstSmallStep,
            end: StressSlot::EndOfSecondSmallStep,
        })?;

        let state = &*self.state;
        let start_square = square_sum(&state.buffers.initial_speed);
        let half_square = square_sum(&state.buffers.initial_speed2);
        self.energy_accumulator = (start_square + half_square) * 0.5 * state.step_size * 0.5;

        for (i, (big, small)) in state
            .snapshots
            .big_step
            .iter()
            .zip(&state.snapshots.second_small)
            .enumerate()
        {
            self.precision.update_error((big.x - small.x).abs(), i);
        }

        if self.precision.is_acceptable() {
            self.accept(half_square)?;
            Ok(StepOutcome::Accepted)
        } else {
            self.state.counters.failed_steps += 1;
            Ok(StepOutcome::Rejected)
        }
    }

    fn accept(&mut self, half_square: f64) -> Result<()> {
        let state = &mut *self.state;
        let step_size = state.step_size;
        if state.settings.calculate_strain {
            state.counters.accumulated_strain +=
                strain_increment(&state.dislocations, &state.snapshots.first_small);
            state.counters.accumulated_strain +=
                strain_increment(&state.snapshots.first_small, &state.snapshots.second_small);
        }
        std::mem::swap(&mut state.dislocations, &mut state.snapshots.second_small);
        state.sim_time += step_size;
        state.counters.successful_steps += 1;

        let wall_seconds = self.last_wall_clock.elapsed().as_secs_f64();
        self.evaluate_initial_speeds()?;

        let state = &mut *self.state;
        let speeds = &state.buffers.initial_speed;
        let average_speed =
            speeds.iter().map(|v| v.abs()).sum::<f64>() / state.dislocations.len() as f64;
        let speed_square_sum = square_sum(speeds);
        let order_parameter: f64 = state
            .dislocations
            .iter()
            .zip(speeds)
            .map(|(d, v)| d.b * v)
            .sum();

        let counters = &mut state.counters;
        counters.average_speed = average_speed;
        counters.speed_square_sum = speed_square_sum;
        counters.order_parameter = order_parameter;
        if state.settings.count_avalanches {
            track_avalanche(
                counters,
                average_speed,
                state.settings.avalanche_speed_threshold,
            );
        }

        self.energy_accumulator += (half_square + speed_square_sum) * 0.5 * step_size * 0.5;
        let logged_cutoff = state.cutoff.radius();
        if state
            .settings
            .cutoff_revert_speed_threshold
            .is_some_and(|threshold| threshold > average_speed)
        {
            state.revert_cutoff(INFINITE_CUTOFF_MULTIPLIER);
        }
        state.counters.energy += self.energy_accumulator;

        let record = StepRecord {
            time: state.sim_time,
            successful_steps: state.counters.successful_steps,
            failed_steps: state.counters.failed_steps,
            max_error_ratio_sqr: self.precision.max_error_ratio_sqr(),
            average_speed,
            cutoff: logged_cutoff,
            order_parameter: state
                .settings
                .calculate_order_parameter
                .then_some(order_parameter),
            external_stress: state.external_stress.stress(StressSlot::Original),
            wall_seconds: Some(wall_seconds),
            strain: state
                .settings
                .calculate_strain
                .then_some(state.counters.accumulated_strain),
            speed_square_sum,
            energy: state.counters.energy,
        };
        writeln!(self.log, "{record}").map_err(SimulationError::Log)?;

        self.write_sub_configuration()?;
        self.last_wall_clock = Instant::now();
        Ok(())
    }

    /// Logs the state before the first step and caches its initial speeds.
    /// The strain column is always filled here.
    fn write_first_line(&mut self) -> Result<()> {
        self.last_wall_clock = Instant::now();
        self.evaluate_initial_speeds()?;

        let state = &mut *self.state;
        let speeds = &state.buffers.initial_speed;
        let average_speed =
            speeds.iter().map(|v| v.abs()).sum::<f64>() / state.dislocations.len() as f64;
        let speed_square_sum = square_sum(speeds);
        state.counters.average_speed = average_speed;
        state.counters.speed_square_sum = speed_square_sum;

        let record = StepRecord {
            time: state.sim_time,
            successful_steps: state.counters.successful_steps,
            failed_steps: state.counters.failed_steps,
            max_error_ratio_sqr: 0.0,
            average_speed,
            cutoff: state.cutoff.radius(),
            order_parameter: None,
            external_stress: state.external_stress.stress(StressSlot::Original),
            wall_seconds: None,
            strain: Some(state.counters.accumulated_strain),
            speed_square_sum,
            energy: state.counters.energy,
        };
        writeln!(self.log, "{record}").map_err(SimulationError::Log)
    }

    /// Speeds of the live configuration under the `Original` stress.
    fn evaluate_initial_speeds(&mut self) -> Result<()> {
        let pinning = self.state.pinning();
        let SimulationState {
            dislocations,
            points,
            kernel,
            external_stress,
            buffers,
            counters,
            sim_time,
            ..
        } = &mut *self.state;
        external_stress.calculate_stress(
            *sim_time,
            counters.accumulated_strain,
            StressSlot::Original,
        );
        let field = ForceField {
            kernel: &*kernel,
            points: points.as_slice(),
            pinning,
        };
        field.speeds(
            dislocations,
            external_stress.stress(StressSlot::Original),
            &mut self.precision,
            &mut buffers.initial_speed,
        )
    }

    /// Newton-like corrector of one sub-step.
    fn integrate(&mut self, sub: SubStep) -> Result<()> {
        let pinning = self.state.pinning();
        let iterations = self.state.settings.iterations;
        let zero_stress = self.state.external_stress.is_zero();
        let SimulationState {
            dislocations,
            points,
            kernel,
            external_stress,
            cutoff,
            snapshots,
            buffers,
            jacobian,
            counters,
            sim_time,
            step_size,
            ..
        } = &mut *self.state;
        let precision = &mut self.precision;

        let start: &[Dislocation] = dislocations;
        let (new, old): (&mut Vec<Dislocation>, &[Dislocation]) = match sub.target {
            Target::BigStep => (&mut snapshots.big_step, start),
            Target::FirstSmall => (&mut snapshots.first_small, start),
            Target::SecondSmall => (
                &mut snapshots.second_small,
                snapshots.first_small.as_slice(),
            ),
        };
        let (initial, current) = match sub.speeds {
            SpeedSet::Primary => (&mut buffers.initial_speed, &mut buffers.speed),
            SpeedSet::Secondary => (&mut buffers.initial_speed2, &mut buffers.speed2),
        };
        let residual = &mut buffers.residual;
        let correction = &mut buffers.correction;

        let origin_time = match sub.origin {
            StressSlot::EndOfFirstSmallStep => *sim_time + 0.5 * *step_size,
            _ => *sim_time,
        };
        let end_time = match sub.end {
            StressSlot::EndOfFirstSmallStep => *sim_time + 0.5 * *step_size,
            _ => *sim_time + *step_size,
        };
        let base_strain = counters.accumulated_strain;

        let field = ForceField {
            kernel: &*kernel,
            points: points.as_slice(),
            pinning,
        };
        jacobian.assemble(
            sub.step_size,
            new.as_slice(),
            field.points,
            field.kernel,
            &pinning,
            cutoff,
        )?;
        let factorization = Factorization::new(jacobian)?;
        let damping = jacobian.damping();

        if sub.compute_initial {
            external_stress.calculate_stress(
                origin_time,
                base_strain + strain_increment(start, old),
                sub.origin,
            );
            field.speeds(old, external_stress.stress(sub.origin), precision, initial)?;
        }

        let h = sub.step_size;
        for iteration in 0..iterations {
            // new == old before the first correction
            let reuse_initial = iteration == 0 && zero_stress;
            if !reuse_initial {
                external_stress.calculate_stress(
                    end_time,
                    base_strain + strain_increment(start, new.as_slice()),
                    sub.end,
                );
                field.speeds(
                    new.as_slice(),
                    external_stress.stress(sub.end),
                    precision,
                    current,
                )?;
            }
            let speeds = if reuse_initial {
                initial.as_slice()
            } else {
                current.as_slice()
            };

            for (i, g) in residual.iter_mut().enumerate() {
                let d = damping[i];
                *g = new[i].x
                    - (1.0 + d) * 0.5 * h * speeds[i]
                    - old[i].x
                    - (1.0 - d) * 0.5 * h * initial[i];
            }
            factorization.solve(residual, correction)?;
            for (dislocation, dx) in new.iter_mut().zip(correction.iter()) {
                dislocation.x -= dx;
            }
        }
        Ok(())
    }

    fn write_sub_configuration(&mut self) -> Result<()> {
        let state = &mut *self.state;
        let Some(sub) = &state.settings.sub_configurations else {
            return Ok(());
        };
        let counters = &mut state.counters;
        counters.sub_configuration_counter += 1;
        let delay = if counters.in_avalanche {
            sub.delay_during_avalanche
        } else {
            sub.delay
        };
        if counters.sub_configuration_counter < delay {
            return Ok(());
        }
        counters.sub_configuration_counter = 0;
        let path = io::checkpoint_path(&sub.directory, state.sim_time);
        io::write_dislocations(&path, &state.dislocations)?;
        info!("Sub-configuration written to {}", path.display());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::format::scientific;
    use crate::kernel::{AnalyticKernel, Kernel, StressKernel, TableKernel};
    use crate::protocol::{ExternalStress, FixedRateProtocol};
    use crate::settings::{
        SimulationSettings, StopLimits, StressProtocolSettings, SubConfigurationSettings,
    };

    fn state_with(settings: SimulationSettings, dislocations: Vec<Dislocation>) -> SimulationState {
        let external_stress = settings.stress_protocol.build();
        let mut state = SimulationState::new(
            settings,
            Kernel::Analytic(AnalyticKernel::default()),
            external_stress,
        );
        state
            .set_dislocations(dislocations)
            .expect("dislocations should load");
        state
    }

    fn single() -> Vec<Dislocation> {
        vec![Dislocation::new(0.1, 0.2, 1.0)]
    }

    fn opposite_pair() -> Vec<Dislocation> {
        vec![
            Dislocation::new(-0.1, 0.0, 1.0),
            Dislocation::new(0.1, 0.0, -1.0),
        ]
    }

    fn log_lines(log: &[u8]) -> Vec<String> {
        String::from_utf8(log.to_vec())
            .expect("log is utf-8")
            .lines()
            .map(str::to_string)
            .collect()
    }

    fn scratch_dir(name: &str) -> std::path::PathBuf {
        std::env::temp_dir().join(format!("sdddst-sim-{}-{name}", std::process::id()))
    }

    #[test]
    fn lone_dislocation_stays_put_and_doubles_the_step() {
        let mut state = state_with(SimulationSettings::default(), single());
        let mut simulation = Simulation::new(&mut state, Vec::new()).expect("valid state");
        let outcome = simulation.step().expect("step should succeed");
        assert_eq!(outcome, StepOutcome::Accepted);
        drop(simulation);

        assert_eq!(state.dislocations(), single().as_slice());
        assert_eq!(state.step_size, 2e-6);
        assert_eq!(state.sim_time, 1e-6);
        assert_eq!(state.counters.successful_steps, 1);
    }

    #[test]
    fn first_log_line_describes_the_initial_state() {
        let mut state = state_with(SimulationSettings::default(), single());
        let mut simulation = Simulation::new(&mut state, Vec::new()).expect("valid state");
        simulation.step().expect("step should succeed");

        let lines = log_lines(simulation.log());
        assert_eq!(lines.len(), 2);
        let zero = scientific(0.0, 16);
        let cutoff = scientific(1e20, 16);
        assert_eq!(
            lines[0],
            format!("{zero} 0 0 {zero} {zero} {cutoff} - {zero} - {zero} {zero} {zero}")
        );

        let columns: Vec<&str> = lines[1].split(' ').collect();
        assert_eq!(columns.len(), 12);
        assert_eq!(columns[0], scientific(1e-6, 16));
        assert_eq!(columns[0], "9.9999999999999995e-07");
        assert_eq!(
            columns[1..8].join(" "),
            format!("1 0 {zero} {zero} {cutoff} - {zero}")
        );
        assert!(columns[8].parse::<f64>().is_ok());
        assert_eq!(columns[9..].join(" "), format!("- {zero} {zero}"));
    }

    #[test]
    fn opposite_pair_attracts_and_conserves_centre() {
        let mut state = state_with(SimulationSettings::default(), opposite_pair());
        let mut simulation = Simulation::new(&mut state, Vec::new()).expect("valid state");
        let outcome = simulation.step().expect("step should succeed");
        assert_eq!(outcome, StepOutcome::Accepted);
        drop(simulation);

        let moved = state.dislocations();
        assert!(moved[0].x > -0.1);
        assert!(moved[1].x < 0.1);
        assert!((moved[0].x + moved[1].x).abs() < 1e-15);
        assert_eq!(moved[0].y, 0.0);
        assert_eq!(moved[1].y, 0.0);
        assert!(state.step_size > 1e-6);
    }

    #[test]
    fn order_parameter_matches_the_pair_interaction() {
        let settings = SimulationSettings {
            calculate_order_parameter: true,
            ..Default::default()
        };
        let mut state = state_with(settings, opposite_pair());
        let mut simulation = Simulation::new(&mut state, Vec::new()).expect("valid state");
        simulation.step().expect("step should succeed");
        let logged = log_lines(simulation.log())[1]
            .split(' ')
            .nth(6)
            .map(str::to_string)
            .expect("order parameter column");
        drop(simulation);

        // b0·v0 + b1·v1 with v1 = -v0 and b0 = -b1 = 1
        let d = state.dislocations();
        let v0 = d[0].b * d[1].b * AnalyticKernel::default()
            .xy(d[0].x - d[1].x, 0.0)
            .expect("separated pair");
        let expected = 2.0 * v0;
        assert!(expected > 0.0);
        let actual = state.counters.order_parameter;
        assert!((actual - expected).abs() < 1e-12 * expected.abs());
        assert_ne!(logged, "-");
    }

    #[test]
    fn oversized_step_is_rejected_without_moving() {
        let settings = SimulationSettings {
            initial_step_size: 1e-2,
            ..Default::default()
        };
        let pair = vec![
            Dislocation::new(0.0, 0.0, 1.0),
            Dislocation::new(0.01, 0.0, 1.0),
        ];
        let mut state = state_with(settings, pair.clone());
        let mut simulation = Simulation::new(&mut state, Vec::new()).expect("valid state");
        let outcome = simulation.step().expect("step should succeed");
        assert_eq!(outcome, StepOutcome::Rejected);
        let lines = log_lines(simulation.log());
        drop(simulation);

        assert_eq!(lines.len(), 1);
        assert_eq!(state.dislocations(), pair.as_slice());
        assert_eq!(state.sim_time, 0.0);
        assert_eq!(state.counters.failed_steps, 1);
        assert_eq!(state.counters.successful_steps, 0);
        assert!(state.step_size <= 1e-2);
    }

    #[test]
    fn fixed_rate_stress_is_integrated_exactly() {
        let settings = SimulationSettings {
            calculate_strain: true,
            ..Default::default()
        };
        let mut state = SimulationState::new(
            settings,
            Kernel::default(),
            ExternalStress::FixedRate(FixedRateProtocol::new(1.0)),
        );
        state
            .set_dislocations(vec![Dislocation::new(0.0, 0.0, 1.0)])
            .expect("load");
        let mut simulation = Simulation::new(&mut state, Vec::new()).expect("valid state");
        assert_eq!(
            simulation.step().expect("step should succeed"),
            StepOutcome::Accepted
        );
        drop(simulation);

        // trapezoidal rule is exact for a linear stress ramp
        let expected = 0.5 * 1e-12;
        assert!((state.dislocations()[0].x - expected).abs() < 1e-24);
        assert!((state.counters.accumulated_strain - expected).abs() < 1e-24);
        assert_eq!(state.external_stress.stress(StressSlot::Original), 1e-6);
    }

    #[test]
    fn run_stops_at_step_limit_and_writes_result() {
        let result = scratch_dir("result.txt");
        let settings = SimulationSettings {
            limits: StopLimits {
                step_count: Some(3),
                ..Default::default()
            },
            max_step_size: Some(3e-6),
            result_path: Some(result.clone()),
            ..Default::default()
        };
        let mut state = state_with(settings, single());
        let mut simulation = Simulation::new(&mut state, Vec::new()).expect("valid state");
        let reason = simulation.run().expect("run should succeed");
        assert_eq!(reason, StopReason::StepCountLimit);
        assert_eq!(log_lines(simulation.log()).len(), 4);
        drop(simulation);

        assert_eq!(state.counters.successful_steps, 3);
        assert_eq!(state.step_size, 3e-6);
        assert!((state.sim_time - 6e-6).abs() < 1e-20);
        let written = io::read_dislocations(&result).expect("result written");
        std::fs::remove_file(&result).ok();
        assert_eq!(written, single());
    }

    #[test]
    fn run_stops_at_time_limit() {
        let settings = SimulationSettings {
            limits: StopLimits {
                time: Some(5e-6),
                ..Default::default()
            },
            ..Default::default()
        };
        let mut state = state_with(settings, single());
        let mut simulation = Simulation::new(&mut state, Vec::new()).expect("valid state");
        assert_eq!(
            simulation.run().expect("run should succeed"),
            StopReason::TimeLimit
        );
        drop(simulation);
        assert_eq!(state.counters.successful_steps, 3);
        assert!(state.sim_time >= 5e-6);
    }

    #[test]
    fn speed_limit_stops_a_fast_configuration() {
        let settings = SimulationSettings {
            limits: StopLimits {
                average_speed: Some(1e-3),
                ..Default::default()
            },
            ..Default::default()
        };
        let mut state = state_with(settings, opposite_pair());
        let mut simulation = Simulation::new(&mut state, Vec::new()).expect("valid state");
        assert_eq!(
            simulation.run().expect("run should succeed"),
            StopReason::SpeedLimit
        );
        drop(simulation);
        assert_eq!(state.counters.successful_steps, 1);
    }

    #[test]
    fn sub_configurations_follow_the_delay() {
        let directory = scratch_dir("subconfigs");
        std::fs::remove_dir_all(&directory).ok();
        let settings = SimulationSettings {
            limits: StopLimits {
                step_count: Some(4),
                ..Default::default()
            },
            sub_configurations: Some(SubConfigurationSettings {
                directory: directory.clone(),
                delay: 2,
                delay_during_avalanche: 1,
            }),
            ..Default::default()
        };
        let mut state = state_with(settings, single());
        let mut simulation = Simulation::new(&mut state, Vec::new()).expect("valid state");
        simulation.run().expect("run should succeed");

        let written = std::fs::read_dir(&directory)
            .expect("directory created")
            .filter_map(|entry| entry.ok())
            .filter(|entry| entry.path().extension().is_some_and(|ext| ext == "dconf"))
            .count();
        std::fs::remove_dir_all(&directory).ok();
        assert_eq!(written, 2);
    }

    #[test]
    fn slow_motion_reverts_the_cutoff() {
        let settings = SimulationSettings {
            cutoff_multiplier: 0.05,
            cutoff_revert_speed_threshold: Some(1e10),
            ..Default::default()
        };
        let mut state = state_with(settings, opposite_pair());
        let radius = state.cutoff().radius();
        assert!((radius - 0.05 / 2f64.sqrt()).abs() < 1e-15);
        let mut simulation = Simulation::new(&mut state, Vec::new()).expect("valid state");
        simulation.step().expect("step should succeed");
        let logged: f64 = log_lines(simulation.log())[1]
            .split(' ')
            .nth(5)
            .and_then(|column| column.parse().ok())
            .expect("cutoff column");
        drop(simulation);

        assert!((logged - radius).abs() < 1e-6);
        assert_eq!(state.cutoff().multiplier(), INFINITE_CUTOFF_MULTIPLIER);
    }

    #[test]
    fn avalanches_are_counted_when_speed_drops() {
        let mut counters = RunCounters::default();
        track_avalanche(&mut counters, 0.5, 1e-3);
        assert!(counters.in_avalanche);
        track_avalanche(&mut counters, 0.1, 1e-3);
        assert_eq!(counters.avalanche_count, 0);
        track_avalanche(&mut counters, 1e-4, 1e-3);
        assert!(!counters.in_avalanche);
        assert_eq!(counters.avalanche_count, 1);
        track_avalanche(&mut counters, 1e-4, 1e-3);
        assert_eq!(counters.avalanche_count, 1);
    }

    #[test]
    fn empty_state_cannot_be_simulated() {
        let mut state = SimulationState::new(
            SimulationSettings::default(),
            Kernel::default(),
            ExternalStress::Zero,
        );
        assert!(matches!(
            Simulation::new(&mut state, Vec::new()),
            Err(SimulationError::NoDislocations)
        ));
    }

    fn pair_square_sum(kernel: &impl StressKernel, pair: &[Dislocation]) -> f64 {
        let v = kernel
            .xy(pair[0].x - pair[1].x, pair[0].y - pair[1].y)
            .expect("separated pair");
        2.0 * v * v
    }

    #[test]
    fn energy_accumulates_the_trapezoid_of_squared_speeds() {
        let mut state = state_with(SimulationSettings::default(), opposite_pair());
        let mut simulation = Simulation::new(&mut state, Vec::new()).expect("valid state");
        assert_eq!(
            simulation.step().expect("step should succeed"),
            StepOutcome::Accepted
        );
        let logged: f64 = log_lines(simulation.log())[1]
            .split(' ')
            .nth(11)
            .and_then(|column| column.parse().ok())
            .expect("energy column");
        drop(simulation);

        let kernel = AnalyticKernel::default();
        let h = 1e-6;
        let start = pair_square_sum(&kernel, &opposite_pair());
        let half = pair_square_sum(&kernel, &state.snapshots.first_small);
        let end = pair_square_sum(&kernel, state.dislocations());
        let expected = (start + half) * h / 4.0 + (half + end) * h / 4.0;

        assert!(expected > 0.0);
        assert!((state.counters.energy - expected).abs() < 1e-10 * expected);
        assert!((state.counters.speed_square_sum - end).abs() < 1e-10 * end);
        assert!((logged - state.counters.energy).abs() < 1e-15 * expected);
    }

    #[test]
    fn run_stops_at_strain_increase_limit() {
        let settings = SimulationSettings {
            calculate_strain: true,
            stress_protocol: StressProtocolSettings::FixedRate { rate: 1.0 },
            limits: StopLimits {
                strain_increase: Some(1e-12),
                ..Default::default()
            },
            ..Default::default()
        };
        let mut state = state_with(settings, vec![Dislocation::new(0.0, 0.0, 1.0)]);
        let mut simulation = Simulation::new(&mut state, Vec::new()).expect("valid state");
        assert_eq!(
            simulation.run().expect("run should succeed"),
            StopReason::StrainIncreaseLimit
        );
        drop(simulation);

        let strain = state.counters.accumulated_strain;
        assert!(strain >= 1e-12);
        assert!(state.counters.successful_steps >= 2);
        // x(t) = t²/2 under a unit stress rate
        let t = state.sim_time;
        assert!((strain - 0.5 * t * t).abs() < 1e-9 * strain);
    }

    #[test]
    fn run_stops_at_external_stress_limit() {
        let settings = SimulationSettings {
            stress_protocol: StressProtocolSettings::FixedRate { rate: 1.0 },
            limits: StopLimits {
                external_stress: Some(5e-6),
                ..Default::default()
            },
            ..Default::default()
        };
        let mut state = state_with(settings, vec![Dislocation::new(0.0, 0.0, 1.0)]);
        let mut simulation = Simulation::new(&mut state, Vec::new()).expect("valid state");
        assert_eq!(
            simulation.run().expect("run should succeed"),
            StopReason::ExternalStressLimit
        );
        drop(simulation);

        let stress = state.external_stress.stress(StressSlot::Original);
        assert!(stress >= 5e-6);
        assert_eq!(stress, state.sim_time);
    }

    #[test]
    fn run_stops_after_the_requested_avalanches() {
        // a same-sign pair repels, so its speed decays once it separates
        let pair = vec![
            Dislocation::new(-0.1, 0.0, 1.0),
            Dislocation::new(0.1, 0.0, 1.0),
        ];
        let initial_speed = AnalyticKernel::default()
            .xy(0.2, 0.0)
            .expect("separated pair")
            .abs();
        let threshold = 0.5 * initial_speed;
        let settings = SimulationSettings {
            count_avalanches: true,
            avalanche_speed_threshold: threshold,
            limits: StopLimits {
                avalanche_count: Some(1),
                time: Some(50.0),
                ..Default::default()
            },
            ..Default::default()
        };
        let mut state = state_with(settings, pair);
        let mut simulation = Simulation::new(&mut state, Vec::new()).expect("valid state");
        assert_eq!(
            simulation.run().expect("run should succeed"),
            StopReason::AvalancheLimit
        );
        drop(simulation);

        assert_eq!(state.counters.avalanche_count, 1);
        assert!(!state.counters.in_avalanche);
        assert!(state.counters.average_speed < threshold);
        let d = state.dislocations();
        assert!(d[1].x - d[0].x > 0.2);
    }

    #[test]
    fn spring_stress_relaxes_with_the_strain() {
        let spring_constant = 1e5;
        let settings = SimulationSettings {
            calculate_strain: true,
            position_precision: 1e-12,
            stress_protocol: StressProtocolSettings::Spring {
                rate: 1.0,
                spring_constant,
            },
            limits: StopLimits {
                time: Some(2e-5),
                ..Default::default()
            },
            ..Default::default()
        };
        let mut state = state_with(settings, vec![Dislocation::new(0.0, 0.0, 1.0)]);
        let mut simulation = Simulation::new(&mut state, Vec::new()).expect("valid state");
        assert_eq!(
            simulation.run().expect("run should succeed"),
            StopReason::TimeLimit
        );
        drop(simulation);

        // strain' = k·(t − strain) with strain(0) = 0
        let t = state.sim_time;
        let strain = state.counters.accumulated_strain;
        let expected = t - (1.0 - (-spring_constant * t).exp()) / spring_constant;
        assert!((strain - expected).abs() < 1e-3 * expected);
        assert!((state.dislocations()[0].x - strain).abs() < 1e-3 * expected);

        let stress = state.external_stress.stress(StressSlot::Original);
        let loaded = spring_constant * (t - strain);
        assert!((stress - loaded).abs() < 1e-12 * loaded);
        assert!(stress < 0.5 * spring_constant * t);
    }

    #[test]
    fn table_kernel_drives_a_simulation() {
        const N: usize = 128;
        // tabulated fields carry no 1/(2π²) prefactor
        let scale = 2.0 * std::f64::consts::PI * std::f64::consts::PI;
        let analytic = AnalyticKernel::default();
        let mut values = vec![0.0; N * N];
        for i in 0..N {
            for j in 0..N {
                if i != 0 || j != 0 {
                    let x = crate::dislocation::normalize(i as f64 / N as f64);
                    let y = crate::dislocation::normalize(j as f64 / N as f64);
                    values[i * N + j] = scale * analytic.xy(x, y).expect("grid value");
                }
            }
        }
        let kernel = TableKernel::from_xy_table(N, 0.0, values).expect("kernel");
        let settings = SimulationSettings {
            calculate_order_parameter: true,
            ..Default::default()
        };
        let mut state = SimulationState::new(settings, Kernel::Table(kernel), ExternalStress::Zero);
        state.set_dislocations(opposite_pair()).expect("load");
        let mut simulation = Simulation::new(&mut state, Vec::new()).expect("valid state");
        for _ in 0..3 {
            simulation.step().expect("step should succeed");
        }
        drop(simulation);

        assert!(state.counters.successful_steps >= 1);
        let d = state.dislocations();
        assert!(d[0].x > -0.1);
        assert!(d[1].x < 0.1);
        assert!((d[0].x + d[1].x).abs() < 1e-15);

        let v0 = d[0].b * d[1].b * state.kernel.xy(d[0].x - d[1].x, 0.0).expect("separated");
        let expected = 2.0 * v0;
        let actual = state.counters.order_parameter;
        assert!((actual - expected).abs() < 1e-12 * expected.abs());

        // the tabulated field follows the closed form away from the origin
        let closed = scale * analytic.xy(d[0].x - d[1].x, 0.0).expect("separated");
        assert!((v0 - d[0].b * d[1].b * closed).abs() < 1e-2 * closed.abs());
    }
}

