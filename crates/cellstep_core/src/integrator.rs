use crate::bdf::{BdfSolver, SolverStats};
use crate::config::IntegratorConfig;
use crate::events::EventDetector;
use crate::failure::{check_step, report, Failure, StepStatus};
use crate::linalg::try_zeros;
use crate::state::StateVector;
use crate::traits::{Trigger, VectorField};
use serde::{Deserialize, Serialize};

/// Entity-specific callables together with the context they read.
pub struct Dynamics<C> {
    context: C,
    rhs: Box<dyn VectorField<C> + Send>,
    trigger: Option<Box<dyn Trigger<C> + Send>>,
}

impl<C> Dynamics<C> {
    pub fn new(context: C, rhs: impl VectorField<C> + Send + 'static) -> Self {
        Self {
            context,
            rhs: Box::new(rhs),
            trigger: None,
        }
    }

    pub fn with_trigger(mut self, trigger: impl Trigger<C> + Send + 'static) -> Self {
        self.trigger = Some(Box::new(trigger));
        self
    }

    fn bound_rhs(&self) -> impl Fn(f64, &[f64], &mut [f64]) -> anyhow::Result<()> + '_ {
        move |t: f64, y: &[f64], out: &mut [f64]| self.rhs.apply(t, y, &self.context, out)
    }
}

/// A rising crossing of the trigger and the state at that time.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventRecord {
    pub time: f64,
    pub state: StateVector,
}

/// Result of one `advance` call.
#[derive(Debug, Clone, PartialEq)]
pub struct Advance {
    pub time: f64,
    pub state: StateVector,
    pub event: Option<EventRecord>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct IntegratorStats {
    pub solver: SolverStats,
    pub trigger_evaluations: usize,
    pub events: usize,
}

/// Stiff integrator for one entity's continuous state.
///
/// Owns its backend exclusively; every call that moves the trajectory takes
/// `&mut self`, so one instance can never be advanced from two places.
pub struct TrajectoryIntegrator<C> {
    entity: String,
    config: IntegratorConfig,
    dynamics: Dynamics<C>,
    solver: BdfSolver,
    detector: Option<EventDetector>,
    time: f64,
    state: StateVector,
    scratch: Vec<f64>,
}

impl<C> TrajectoryIntegrator<C> {
    /// Builds the backend around `initial_state` at t = 0.
    ///
    /// Each setup stage reports its own failure kind: storage, initial
    /// condition, event registration, each configuration setting, and the
    /// linear solver.
    pub fn create(
        entity: impl Into<String>,
        dimension: usize,
        initial_state: &[f64],
        dynamics: Dynamics<C>,
        config: IntegratorConfig,
    ) -> Result<Self, Failure> {
        let entity = entity.into();
        log::debug!("{entity}: creating integrator for {dimension} states with {config:?}");

        let allocation = |status| {
            report(Failure::Allocation {
                entity: entity.clone(),
                status,
            })
        };
        let mut solver = BdfSolver::allocate(dimension).map_err(allocation)?;
        let scratch = try_zeros(dimension).ok_or_else(|| allocation(StepStatus::MemoryFailure))?;

        let initialization = |status| {
            report(Failure::Initialization {
                entity: entity.clone(),
                status,
            })
        };
        solver
            .initialize(0.0, initial_state, &dynamics.bound_rhs())
            .map_err(initialization)?;

        let detector = if config.event_detection {
            let Some(trigger) = dynamics.trigger.as_deref() else {
                return Err(report(Failure::EventSetup {
                    entity,
                    status: StepStatus::IllegalInput,
                }));
            };
            let mut detector = EventDetector::new(config.event_direction);
            let mut g = |t: f64| evaluate_trigger(trigger, &dynamics.context, t, initial_state);
            detector.arm(0.0, &mut g).map_err(|status| {
                report(Failure::EventSetup {
                    entity: entity.clone(),
                    status,
                })
            })?;
            Some(detector)
        } else {
            None
        };

        let configuration = |setting: &'static str| {
            let entity = entity.clone();
            move |status| {
                report(Failure::Configuration {
                    entity,
                    setting,
                    status,
                })
            }
        };
        solver
            .set_tolerances(config.relative_tolerance, config.absolute_tolerance)
            .map_err(configuration("tolerances"))?;
        solver
            .set_stability_limit_detection(config.stability_limit_detection)
            .map_err(configuration("stability_limit_detection"))?;
        solver
            .set_max_order(config.max_order)
            .map_err(configuration("max_order"))?;
        solver
            .set_max_step(config.max_step.value())
            .map_err(configuration("max_step"))?;
        solver
            .set_initial_step(config.initial_step)
            .map_err(configuration("initial_step"))?;
        if config.max_num_steps == 0 {
            return Err(configuration("max_num_steps")(StepStatus::IllegalInput));
        }

        solver
            .attach_linear_solver(config.linear_solver)
            .map_err(|status| {
                report(Failure::LinearSolver {
                    entity: entity.clone(),
                    status,
                })
            })?;

        Ok(Self {
            entity,
            config,
            dynamics,
            solver,
            detector,
            time: 0.0,
            state: StateVector::from_slice(initial_state),
            scratch,
        })
    }

    /// Moves the trajectory to `target_time`, stopping early at the first
    /// rising trigger crossing in `(time, target_time]`.
    ///
    /// Target times must not decrease. A target equal to the current time
    /// returns the current state without stepping.
    pub fn advance(&mut self, target_time: f64) -> Result<Advance, Failure> {
        let (status, event) = self.run(target_time);
        check_step(&self.entity, self.solver.time(), status)?;
        Ok(Advance {
            time: self.time,
            state: self.state.clone(),
            event,
        })
    }

    fn run(&mut self, target_time: f64) -> (StepStatus, Option<EventRecord>) {
        if target_time.is_nan() {
            return (StepStatus::IllegalInput, None);
        }
        if target_time < self.time {
            return (StepStatus::BadTargetTime, None);
        }
        if target_time == self.time {
            return (StepStatus::Success, None);
        }

        let mut steps = 0usize;
        loop {
            let solver_time = self.solver.time();
            let hi = solver_time.min(target_time);

            if let Some(detector) = self.detector.as_mut() {
                if hi > detector.searched_until() {
                    let found = match self.dynamics.trigger.as_deref() {
                        Some(trigger) => {
                            let solver = &self.solver;
                            let context = &self.dynamics.context;
                            let scratch = &mut self.scratch;
                            let mut g = |t: f64| {
                                solver.interpolate(t, scratch);
                                evaluate_trigger(trigger, context, t, scratch)
                            };
                            detector.search(hi, &mut g)
                        }
                        None => Ok(None),
                    };
                    match found {
                        Ok(Some(root)) => {
                            self.solver.interpolate(root, self.state.as_mut_slice());
                            self.time = root;
                            let event = EventRecord {
                                time: root,
                                state: self.state.clone(),
                            };
                            return (StepStatus::RootReturn, Some(event));
                        }
                        Ok(None) => {}
                        Err(status) => return (status, None),
                    }
                }
            }

            if solver_time >= target_time {
                self.solver.interpolate(target_time, self.state.as_mut_slice());
                self.time = target_time;
                return (StepStatus::Success, None);
            }
            if steps >= self.config.max_num_steps {
                return (StepStatus::TooMuchWork, None);
            }
            let rhs = self.dynamics.bound_rhs();
            if let Err(status) = self.solver.step(&rhs) {
                return (status, None);
            }
            steps += 1;
        }
    }

    /// Restarts the trajectory from `state` at `time`, e.g. after the host
    /// applied a discrete reset. Configuration, context and counters are kept.
    pub fn reinitialize(&mut self, time: f64, state: &[f64]) -> Result<(), Failure> {
        log::debug!("{}: reinitializing at t = {time}", self.entity);
        let initialization = |status| {
            report(Failure::Initialization {
                entity: self.entity.clone(),
                status,
            })
        };
        if state.len() != self.state.len() || state.iter().any(|v| !v.is_finite()) {
            return Err(initialization(StepStatus::IllegalInput));
        }

        // Arm a copy first so a failing trigger leaves the old window intact.
        let armed = match (&self.detector, self.dynamics.trigger.as_deref()) {
            (Some(detector), Some(trigger)) => {
                let mut detector = detector.clone();
                let context = &self.dynamics.context;
                let mut g = |t: f64| evaluate_trigger(trigger, context, t, state);
                detector.arm(time, &mut g).map_err(|status| {
                    report(Failure::EventSetup {
                        entity: self.entity.clone(),
                        status,
                    })
                })?;
                Some(detector)
            }
            _ => None,
        };

        let rhs = self.dynamics.bound_rhs();
        self.solver
            .initialize(time, state, &rhs)
            .map_err(initialization)?;

        self.state.load(state).map_err(|_| initialization(StepStatus::IllegalInput))?;
        self.time = time;
        if armed.is_some() {
            self.detector = armed;
        }
        Ok(())
    }

    pub fn entity(&self) -> &str {
        &self.entity
    }

    pub fn time(&self) -> f64 {
        self.time
    }

    pub fn state(&self) -> &StateVector {
        &self.state
    }

    pub fn config(&self) -> &IntegratorConfig {
        &self.config
    }

    pub fn context(&self) -> &C {
        &self.dynamics.context
    }

    /// Parameter changes take effect from the next internal step.
    pub fn context_mut(&mut self) -> &mut C {
        &mut self.dynamics.context
    }

    pub fn stats(&self) -> IntegratorStats {
        let (trigger_evaluations, events) = match &self.detector {
            Some(detector) => (detector.evaluations(), detector.events()),
            None => (0, 0),
        };
        IntegratorStats {
            solver: self.solver.stats(),
            trigger_evaluations,
            events,
        }
    }
}

fn evaluate_trigger<C>(
    trigger: &(dyn Trigger<C> + Send),
    context: &C,
    t: f64,
    y: &[f64],
) -> Result<f64, StepStatus> {
    trigger.evaluate(t, y, context).map_err(|err| {
        log::debug!("trigger evaluation failed at t = {t}: {err:#}");
        StepStatus::RootFunctionFailure
    })
}

#[cfg(test)]
mod tests {
    use super::{Dynamics, TrajectoryIntegrator};
    use crate::config::{IntegratorConfig, LinearSolverKind, MaxStep};
    use crate::failure::{Failure, StepStatus};
    use crate::traits::Trigger;
    use anyhow::{bail, Result};
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct Decay {
        rate: f64,
    }

    fn decay(_t: f64, y: &[f64], p: &Decay, out: &mut [f64]) -> Result<()> {
        out[0] = -p.rate * y[0];
        Ok(())
    }

    /// Leaky integrator driven towards `drive`; crosses `threshold` once.
    struct Leaky {
        tau: f64,
        drive: f64,
        threshold: f64,
    }

    fn leaky(_t: f64, y: &[f64], p: &Leaky, out: &mut [f64]) -> Result<()> {
        out[0] = (p.drive - y[0]) / p.tau;
        Ok(())
    }

    fn leaky_trigger(_t: f64, y: &[f64], p: &Leaky) -> Result<f64> {
        Ok(y[0] - p.threshold)
    }

    fn tight() -> IntegratorConfig {
        IntegratorConfig::default().with_tolerances(1e-8, 1e-10)
    }

    fn decay_integrator(config: IntegratorConfig) -> TrajectoryIntegrator<Decay> {
        let dynamics = Dynamics::new(Decay { rate: 1.0 }, decay);
        TrajectoryIntegrator::create("decay", 1, &[1.0], dynamics, config)
            .expect("integrator should build")
    }

    fn leaky_integrator() -> TrajectoryIntegrator<Leaky> {
        let params = Leaky {
            tau: 10.0,
            drive: 2.0,
            threshold: 1.0,
        };
        let dynamics = Dynamics::new(params, leaky).with_trigger(leaky_trigger);
        TrajectoryIntegrator::create("leaky", 1, &[0.0], dynamics, tight().with_events())
            .expect("integrator should build")
    }

    fn assert_err_contains<T: std::fmt::Debug>(result: Result<T, Failure>, needle: &str) {
        let err = result.expect_err("expected error");
        let message = format!("{err}");
        assert!(
            message.contains(needle),
            "expected error to contain \"{needle}\", got \"{message}\""
        );
    }

    #[test]
    fn advance_to_zero_returns_initial_state() {
        let mut integrator = decay_integrator(IntegratorConfig::default());
        let out = integrator.advance(0.0).expect("advance should succeed");
        assert_eq!(out.time, 0.0);
        assert_eq!(out.state.as_slice(), &[1.0]);
        assert!(out.event.is_none());
        assert_eq!(integrator.stats().solver.steps, 0);
    }

    #[test]
    fn linear_decay_matches_exponential() {
        for kind in [LinearSolverKind::Diagonal, LinearSolverKind::Dense] {
            let mut integrator = decay_integrator(tight().with_linear_solver(kind));
            for t in [0.1, 0.5, 1.0, 2.0, 5.0, 10.0] {
                let out = integrator.advance(t).expect("advance should succeed");
                assert_eq!(out.time, t);
                let expected = f64::exp(-t);
                assert!(
                    (out.state[0] - expected).abs() < 1e-6,
                    "{kind:?} at t = {t}: {} vs {expected}",
                    out.state[0]
                );
            }
            let mut host = [0.0; 1];
            integrator.state().store(&mut host).expect("store");
            assert!((host[0] - f64::exp(-10.0)).abs() < 1e-6);
        }
    }

    #[test]
    fn host_step_cap_limits_internal_steps() {
        let config = tight().with_max_step(MaxStep::HostStep(0.1));
        let mut integrator = decay_integrator(config);
        for k in 1..=20 {
            integrator.advance(0.1 * k as f64).expect("advance");
            assert!(integrator.stats().solver.last_step <= 0.1 + 1e-15);
        }
        assert!((integrator.state()[0] - (-2.0_f64).exp()).abs() < 1e-6);
    }

    #[test]
    fn repeated_target_does_not_advance_twice() {
        let mut integrator = decay_integrator(tight());
        let first = integrator.advance(0.5).expect("advance");
        let steps = integrator.stats().solver.steps;
        let second = integrator.advance(0.5).expect("advance");
        assert_eq!(first, second);
        assert_eq!(integrator.stats().solver.steps, steps);
    }

    #[test]
    fn backwards_target_is_rejected_without_corrupting_state() {
        let mut integrator = decay_integrator(tight());
        integrator.advance(1.0).expect("advance");
        let err = integrator.advance(0.5).expect_err("backwards target");
        assert_eq!(err.code(), StepStatus::BadTargetTime.code());
        assert!(matches!(err, Failure::Integration { .. }));
        assert_eq!(integrator.time(), 1.0);

        let out = integrator.advance(2.0).expect("advance after rejection");
        assert!((out.state[0] - (-2.0_f64).exp()).abs() < 1e-6);
    }

    #[test]
    fn nan_target_is_illegal_input() {
        let mut integrator = decay_integrator(tight());
        let err = integrator.advance(f64::NAN).expect_err("nan target");
        assert_eq!(err.code(), StepStatus::IllegalInput.code());
    }

    #[test]
    fn rising_crossing_is_reported_inside_interval() {
        let mut integrator = leaky_integrator();
        let expected = 10.0 * 2.0_f64.ln();

        let out = integrator.advance(20.0).expect("advance");
        let event = out.event.expect("crossing expected");
        assert!(event.time > 0.0 && event.time < 20.0);
        assert!((event.time - expected).abs() < 1e-4, "{}", event.time);
        assert!((event.state[0] - 1.0).abs() < 1e-5);
        assert_eq!(out.time, event.time);
        assert_eq!(integrator.time(), event.time);

        let out = integrator.advance(20.0).expect("advance");
        assert!(out.event.is_none());
        assert_eq!(out.time, 20.0);
        let analytic = 2.0 * (1.0 - (-2.0_f64).exp());
        assert!((out.state[0] - analytic).abs() < 1e-5);
        assert_eq!(integrator.stats().events, 1);
    }

    #[test]
    fn reset_after_event_produces_periodic_firing() {
        let mut integrator = leaky_integrator();
        let period = 10.0 * 2.0_f64.ln();
        let mut spikes = Vec::new();
        let mut t = 0.0;
        while t < 40.0 {
            let out = integrator.advance(40.0).expect("advance");
            t = out.time;
            if let Some(event) = out.event {
                spikes.push(event.time);
                integrator
                    .reinitialize(event.time, &[0.0])
                    .expect("reinitialize");
            }
        }
        assert_eq!(spikes.len(), 5);
        for (k, spike) in spikes.iter().enumerate() {
            assert!((spike - period * (k + 1) as f64).abs() < 1e-3, "{spike}");
        }
    }

    #[test]
    fn falling_crossing_is_not_reported() {
        let params = Leaky {
            tau: 1.0,
            drive: -2.0,
            threshold: -1.0,
        };
        // y falls from 0 through the threshold: trigger goes from + to -.
        let dynamics = Dynamics::new(params, leaky).with_trigger(leaky_trigger);
        let mut integrator =
            TrajectoryIntegrator::create("falling", 1, &[0.0], dynamics, tight().with_events())
                .expect("integrator should build");
        let out = integrator.advance(5.0).expect("advance");
        assert!(out.event.is_none());
        assert!(out.state[0] < -1.9);
        assert_eq!(integrator.stats().events, 0);
    }

    #[test]
    fn events_need_a_trigger() {
        let dynamics = Dynamics::new(Decay { rate: 1.0 }, decay);
        let result = TrajectoryIntegrator::create(
            "no_trigger",
            1,
            &[1.0],
            dynamics,
            IntegratorConfig::default().with_events(),
        );
        let err = result.err().expect("event setup should fail");
        assert!(matches!(err, Failure::EventSetup { .. }));
        assert_eq!(err.entity(), "no_trigger");
    }

    fn build_with_trigger(trigger: impl Trigger<Decay> + Send + 'static) -> Result<(), Failure> {
        let dynamics = Dynamics::new(Decay { rate: 1.0 }, decay).with_trigger(trigger);
        TrajectoryIntegrator::create("threshold", 1, &[1.0], dynamics, tight().with_events())
            .map(|_| ())
    }

    #[test]
    fn failing_trigger_at_create_is_an_event_setup_failure() {
        let broken = |_t: f64, _y: &[f64], _p: &Decay| -> Result<f64> { bail!("threshold not set") };
        let undefined = |_t: f64, _y: &[f64], _p: &Decay| -> Result<f64> { Ok(f64::NAN) };
        for result in [build_with_trigger(broken), build_with_trigger(undefined)] {
            let err = result.expect_err("event setup should fail");
            assert!(matches!(err, Failure::EventSetup { .. }));
            assert_eq!(err.entity(), "threshold");
            assert_eq!(err.code(), StepStatus::RootFunctionFailure.code());
        }
    }

    #[test]
    fn create_reports_each_failure_kind() {
        let build = |dimension: usize, state: &[f64], config: IntegratorConfig| {
            let dynamics = Dynamics::new(Decay { rate: 1.0 }, decay);
            TrajectoryIntegrator::create("cell", dimension, state, dynamics, config).map(|_| ())
        };

        let err = build(0, &[], IntegratorConfig::default()).expect_err("zero dimension");
        assert!(matches!(err, Failure::Allocation { .. }));

        let err = build(2, &[1.0], IntegratorConfig::default()).expect_err("short state");
        assert!(matches!(err, Failure::Initialization { .. }));

        let err = build(1, &[f64::NAN], IntegratorConfig::default()).expect_err("nan state");
        assert!(matches!(err, Failure::Initialization { .. }));

        assert_err_contains(
            build(1, &[1.0], IntegratorConfig::default().with_tolerances(-1.0, 1e-8)),
            "tolerances",
        );
        assert_err_contains(
            build(1, &[1.0], IntegratorConfig::default().with_max_order(6)),
            "max_order",
        );
        assert_err_contains(
            build(
                1,
                &[1.0],
                IntegratorConfig::default().with_max_step(MaxStep::Fixed(-1.0)),
            ),
            "max_step",
        );
        let mut config = IntegratorConfig::default();
        config.max_num_steps = 0;
        assert_err_contains(build(1, &[1.0], config), "max_num_steps");
        let mut config = IntegratorConfig::default();
        config.initial_step = Some(-0.1);
        assert_err_contains(build(1, &[1.0], config), "initial_step");
    }

    #[test]
    fn failing_first_evaluation_is_an_initialization_failure() {
        let rhs = |_t: f64, _y: &[f64], _p: &(), _out: &mut [f64]| -> Result<()> {
            bail!("parameters not loaded")
        };
        let result = TrajectoryIntegrator::create(
            "broken",
            1,
            &[0.0],
            Dynamics::new((), rhs),
            IntegratorConfig::default(),
        );
        let err = result.err().expect("initialization should fail");
        assert!(matches!(err, Failure::Initialization { .. }));
        assert_eq!(err.code(), StepStatus::FirstRhsFailure.code());
    }

    #[test]
    fn failing_evaluation_mid_run_is_an_integration_failure() {
        let rhs = |t: f64, y: &[f64], _p: &(), out: &mut [f64]| -> Result<()> {
            if t > 1.0 {
                bail!("left the tabulated range");
            }
            out[0] = -y[0];
            Ok(())
        };
        let mut integrator = TrajectoryIntegrator::create(
            "tabulated",
            1,
            &[1.0],
            Dynamics::new((), rhs),
            tight(),
        )
        .expect("integrator should build");
        integrator.advance(0.5).expect("inside range");
        let err = integrator.advance(2.0).expect_err("outside range");
        assert_eq!(err.entity(), "tabulated");
        assert_eq!(err.code(), StepStatus::RhsFailure.code());
        assert!(matches!(err, Failure::Integration { .. }));
    }

    /// Decay that switches to relaxation towards 1 at t = 0.5. The kink makes
    /// the step controller reject and shrink steps; one evaluation after the
    /// switch fails.
    struct Switched {
        evaluations_after_switch: AtomicUsize,
        fail_at: usize,
    }

    fn switched(t: f64, y: &[f64], p: &Switched, out: &mut [f64]) -> Result<()> {
        if t <= 0.5 {
            out[0] = -y[0];
            return Ok(());
        }
        let n = p.evaluations_after_switch.fetch_add(1, Ordering::Relaxed) + 1;
        if n == p.fail_at {
            bail!("transient lookup failure");
        }
        out[0] = 1.0 - y[0];
        Ok(())
    }

    fn switched_exact(t: f64) -> f64 {
        if t <= 0.5 {
            (-t).exp()
        } else {
            1.0 + ((-0.5_f64).exp() - 1.0) * (-(t - 0.5)).exp()
        }
    }

    #[test]
    fn advance_recovers_after_a_failed_step() {
        for fail_at in 2..=8 {
            let params = Switched {
                evaluations_after_switch: AtomicUsize::new(0),
                fail_at,
            };
            let mut integrator =
                TrajectoryIntegrator::create("switched", 1, &[1.0], Dynamics::new(params, switched), tight())
                    .expect("integrator should build");
            let mut failures = 0;
            for target in [0.25, 1.0, 2.0, 5.0] {
                let out = match integrator.advance(target) {
                    Ok(out) => out,
                    Err(err) => {
                        failures += 1;
                        assert_eq!(err.code(), StepStatus::RhsFailure.code());
                        integrator.advance(target).expect("retry should succeed")
                    }
                };
                assert!(
                    (out.state[0] - switched_exact(target)).abs() < 1e-5,
                    "fail_at = {fail_at}, t = {target}: {}",
                    out.state[0]
                );
            }
            assert_eq!(failures, 1, "fail_at = {fail_at}");
            assert!(integrator.stats().solver.error_test_failures > 0);
        }
    }

    #[test]
    fn rejected_reinitialize_keeps_integrator_usable() {
        let rhs = |_t: f64, y: &[f64], _p: &(), out: &mut [f64]| -> Result<()> {
            if y[0] > 100.0 {
                bail!("outside fitted range");
            }
            out[0] = -y[0];
            Ok(())
        };
        let trigger = |_t: f64, y: &[f64], _p: &()| -> Result<f64> {
            if y[0] < -50.0 {
                bail!("below table range");
            }
            Ok(y[0] - 2.0)
        };
        let dynamics = Dynamics::new((), rhs).with_trigger(trigger);
        let mut integrator =
            TrajectoryIntegrator::create("fitted", 1, &[1.0], dynamics, tight().with_events())
                .expect("integrator should build");
        integrator.advance(1.0).expect("advance");
        let y1 = integrator.state()[0];

        let err = integrator
            .reinitialize(1.0, &[500.0])
            .expect_err("right-hand side rejects the state");
        assert!(matches!(err, Failure::Initialization { .. }));
        assert_eq!(err.code(), StepStatus::FirstRhsFailure.code());

        let err = integrator
            .reinitialize(1.0, &[-60.0])
            .expect_err("trigger rejects the state");
        assert!(matches!(err, Failure::EventSetup { .. }));

        assert_eq!(integrator.time(), 1.0);
        assert_eq!(integrator.state()[0], y1);
        let out = integrator.advance(2.0).expect("still usable");
        assert!(out.event.is_none());
        assert!((out.state[0] - (-2.0_f64).exp()).abs() < 1e-6);
    }

    #[test]
    fn step_budget_is_per_call_and_resumable() {
        let mut config = tight().with_max_step(MaxStep::Fixed(0.01));
        config.max_num_steps = 5;
        let mut integrator = decay_integrator(config);
        let err = integrator.advance(1.0).expect_err("budget exceeded");
        assert_eq!(err.code(), StepStatus::TooMuchWork.code());
        assert_eq!(integrator.time(), 0.0);

        let mut calls = 1;
        let out = loop {
            calls += 1;
            match integrator.advance(1.0) {
                Ok(out) => break out,
                Err(err) => assert_eq!(err.code(), StepStatus::TooMuchWork.code()),
            }
            assert!(calls < 100);
        };
        assert_eq!(out.time, 1.0);
        assert!((out.state[0] - (-1.0_f64).exp()).abs() < 1e-6);
    }

    #[test]
    fn unreachable_accuracy_is_reported() {
        let mut config = IntegratorConfig::default().with_tolerances(0.0, 1e-300);
        config.initial_step = None;
        let mut integrator = decay_integrator(config);
        let err = integrator.advance(1.0).expect_err("too much accuracy");
        assert_eq!(err.code(), StepStatus::TooMuchAccuracy.code());
    }

    #[test]
    fn coupled_oscillator_with_dense_solver() {
        let rhs = |_t: f64, y: &[f64], _p: &(), out: &mut [f64]| -> Result<()> {
            out[0] = y[1];
            out[1] = -y[0];
            Ok(())
        };
        let mut config = IntegratorConfig::default()
            .with_tolerances(1e-7, 1e-9)
            .with_linear_solver(LinearSolverKind::Dense);
        config.max_num_steps = 5000;
        let mut integrator =
            TrajectoryIntegrator::create("oscillator", 2, &[1.0, 0.0], Dynamics::new((), rhs), config)
                .expect("integrator should build");
        let out = integrator.advance(5.0).expect("advance");
        assert!((out.state[0] - 5.0_f64.cos()).abs() < 1e-4);
        assert!((out.state[1] + 5.0_f64.sin()).abs() < 1e-4);
        assert!(integrator.stats().solver.jacobian_evaluations > 0);
    }

    #[test]
    fn context_changes_apply_to_later_steps() {
        let mut integrator = decay_integrator(tight());
        integrator.advance(1.0).expect("advance");
        let y1 = integrator.state()[0];
        integrator.context_mut().rate = 0.0;
        integrator.reinitialize(1.0, &[y1]).expect("reinitialize");
        let out = integrator.advance(3.0).expect("advance");
        assert!((out.state[0] - y1).abs() < 1e-9);
        assert_eq!(integrator.context().rate, 0.0);
    }

    #[test]
    fn reinitialize_rejects_wrong_length() {
        let mut integrator = decay_integrator(tight());
        let err = integrator
            .reinitialize(0.0, &[1.0, 2.0])
            .expect_err("wrong length");
        assert!(matches!(err, Failure::Initialization { .. }));
        let out = integrator.advance(1.0).expect("still usable");
        assert!((out.state[0] - (-1.0_f64).exp()).abs() < 1e-6);
    }

    #[test]
    fn integrator_can_move_between_threads() {
        fn assert_send<T: Send>() {}
        assert_send::<TrajectoryIntegrator<Decay>>();
    }
}
