use serde::{Deserialize, Serialize};

/// Highest order the backward differentiation family stays stable at.
pub const MAX_BDF_ORDER: usize = 5;

/// Upper bound on the internal step size.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub enum MaxStep {
    Unbounded,
    Fixed(f64),
    /// Use the host scheduler's step size as the cap.
    HostStep(f64),
}

impl MaxStep {
    pub fn value(self) -> f64 {
        match self {
            MaxStep::Unbounded => f64::INFINITY,
            MaxStep::Fixed(h) | MaxStep::HostStep(h) => h,
        }
    }
}

/// Which trigger transitions are reported. Only firing (rising) events are
/// of interest to the host.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum EventDirection {
    Rising,
}

impl EventDirection {
    /// True when going from `before` to `after` is a reportable crossing.
    pub fn crossed(self, before: f64, after: f64) -> bool {
        match self {
            EventDirection::Rising => before < 0.0 && after >= 0.0,
        }
    }
}

/// Linear solver used for the Newton correction of the implicit stage.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum LinearSolverKind {
    /// Difference-quotient approximation of the Jacobian diagonal.
    Diagonal,
    /// Full finite-difference Jacobian with LU factorisation.
    Dense,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct IntegratorConfig {
    pub relative_tolerance: f64,
    pub absolute_tolerance: f64,
    pub max_order: usize,
    pub max_step: MaxStep,
    pub event_detection: bool,
    pub event_direction: EventDirection,
    pub stability_limit_detection: bool,
    pub linear_solver: LinearSolverKind,
    /// Internal steps allowed per `advance` call.
    pub max_num_steps: usize,
    /// First internal step; estimated from the initial derivatives if unset.
    pub initial_step: Option<f64>,
}

impl Default for IntegratorConfig {
    fn default() -> Self {
        Self {
            relative_tolerance: 1e-4,
            absolute_tolerance: 1e-8,
            max_order: MAX_BDF_ORDER,
            max_step: MaxStep::Unbounded,
            event_detection: false,
            event_direction: EventDirection::Rising,
            stability_limit_detection: true,
            linear_solver: LinearSolverKind::Diagonal,
            max_num_steps: 500,
            initial_step: None,
        }
    }
}

impl IntegratorConfig {
    pub fn with_tolerances(mut self, relative: f64, absolute: f64) -> Self {
        self.relative_tolerance = relative;
        self.absolute_tolerance = absolute;
        self
    }

    pub fn with_max_step(mut self, max_step: MaxStep) -> Self {
        self.max_step = max_step;
        self
    }

    pub fn with_max_order(mut self, max_order: usize) -> Self {
        self.max_order = max_order;
        self
    }

    pub fn with_events(mut self) -> Self {
        self.event_detection = true;
        self
    }

    pub fn with_linear_solver(mut self, kind: LinearSolverKind) -> Self {
        self.linear_solver = kind;
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SteadyStateSettings {
    pub max_iterations: usize,
    /// Bound on the sum of absolute residual components.
    pub residual_tolerance: f64,
}

impl Default for SteadyStateSettings {
    fn default() -> Self {
        Self {
            max_iterations: 1000,
            residual_tolerance: 1e-7,
        }
    }
}
