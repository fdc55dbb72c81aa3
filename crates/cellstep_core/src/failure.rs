//! Failure taxonomy and backend status codes.
//!
//! The integrator and the steady-state solver run native backends that
//! report integer-coded statuses the way external numerical libraries do.
//! Everything here turns those statuses into a typed [`Failure`] that
//! carries the entity name and the raw code.

use std::fmt;
use thiserror::Error;

/// Status returned by the multistep backend and its root locator.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StepStatus {
    Success,
    RootReturn,
    TooMuchWork,
    TooMuchAccuracy,
    ErrorTestFailure,
    ConvergenceFailure,
    LinearSetupFailure,
    RhsFailure,
    FirstRhsFailure,
    RootFunctionFailure,
    MemoryFailure,
    IllegalInput,
    BadTargetTime,
}

impl StepStatus {
    pub fn code(self) -> i32 {
        match self {
            StepStatus::Success => 0,
            StepStatus::RootReturn => 2,
            StepStatus::TooMuchWork => -1,
            StepStatus::TooMuchAccuracy => -2,
            StepStatus::ErrorTestFailure => -3,
            StepStatus::ConvergenceFailure => -4,
            StepStatus::LinearSetupFailure => -6,
            StepStatus::RhsFailure => -8,
            StepStatus::FirstRhsFailure => -9,
            StepStatus::RootFunctionFailure => -12,
            StepStatus::MemoryFailure => -20,
            StepStatus::IllegalInput => -22,
            StepStatus::BadTargetTime => -25,
        }
    }

    /// Success with or without an event; the only statuses `advance` lets through.
    pub fn is_success(self) -> bool {
        matches!(self, StepStatus::Success | StepStatus::RootReturn)
    }
}

impl fmt::Display for StepStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            StepStatus::Success => "success",
            StepStatus::RootReturn => "success with event",
            StepStatus::TooMuchWork => "too many internal steps before target time",
            StepStatus::TooMuchAccuracy => "requested accuracy below machine precision",
            StepStatus::ErrorTestFailure => "repeated error test failures",
            StepStatus::ConvergenceFailure => "repeated nonlinear convergence failures",
            StepStatus::LinearSetupFailure => "iteration matrix setup failed",
            StepStatus::RhsFailure => "right-hand side evaluation failed",
            StepStatus::FirstRhsFailure => "first right-hand side evaluation failed",
            StepStatus::RootFunctionFailure => "trigger evaluation failed",
            StepStatus::MemoryFailure => "storage allocation refused",
            StepStatus::IllegalInput => "illegal input",
            StepStatus::BadTargetTime => "target time behind current time",
        };
        write!(f, "{} (code {})", text, self.code())
    }
}

/// Status returned by the hybrid nonlinear solver.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HybridStatus {
    Success,
    Continue,
    BadFunction,
    NoProgress,
    NoProgressJacobian,
    MemoryFailure,
    InvalidInput,
}

impl HybridStatus {
    pub fn code(self) -> i32 {
        match self {
            HybridStatus::Success => 0,
            HybridStatus::Continue => -2,
            HybridStatus::InvalidInput => 4,
            HybridStatus::MemoryFailure => 8,
            HybridStatus::BadFunction => 9,
            HybridStatus::NoProgress => 27,
            HybridStatus::NoProgressJacobian => 28,
        }
    }

    /// Statuses after which iteration may go on.
    pub fn is_continuable(self) -> bool {
        matches!(self, HybridStatus::Success | HybridStatus::Continue)
    }
}

impl fmt::Display for HybridStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            HybridStatus::Success => "success",
            HybridStatus::Continue => "iteration has not converged",
            HybridStatus::BadFunction => "residual evaluation failed or was not finite",
            HybridStatus::NoProgress => "iteration is not making progress",
            HybridStatus::NoProgressJacobian => {
                "iteration is not making progress after Jacobian re-evaluation"
            }
            HybridStatus::MemoryFailure => "storage allocation refused",
            HybridStatus::InvalidInput => "invalid problem dimension",
        };
        write!(f, "{} (code {})", text, self.code())
    }
}

#[derive(Debug, Clone, Error)]
pub enum Failure {
    #[error("{entity}: could not allocate solver storage: {status}")]
    Allocation { entity: String, status: StepStatus },

    #[error("{entity}: solver initialisation rejected: {status}")]
    Initialization { entity: String, status: StepStatus },

    #[error("{entity}: event detector setup rejected: {status}")]
    EventSetup { entity: String, status: StepStatus },

    #[error("{entity}: configuration of {setting} rejected: {status}")]
    Configuration {
        entity: String,
        setting: &'static str,
        status: StepStatus,
    },

    #[error("{entity}: linear solver could not be attached: {status}")]
    LinearSolver { entity: String, status: StepStatus },

    #[error("{entity}: integration failed at t = {time}: {status}")]
    Integration {
        entity: String,
        time: f64,
        status: StepStatus,
    },

    #[error("{entity}: steady-state solver failed: {status}")]
    SteadyState { entity: String, status: HybridStatus },
}

impl Failure {
    pub fn entity(&self) -> &str {
        match self {
            Failure::Allocation { entity, .. }
            | Failure::Initialization { entity, .. }
            | Failure::EventSetup { entity, .. }
            | Failure::Configuration { entity, .. }
            | Failure::LinearSolver { entity, .. }
            | Failure::Integration { entity, .. }
            | Failure::SteadyState { entity, .. } => entity,
        }
    }

    /// Raw backend status code.
    pub fn code(&self) -> i32 {
        match self {
            Failure::Allocation { status, .. }
            | Failure::Initialization { status, .. }
            | Failure::EventSetup { status, .. }
            | Failure::Configuration { status, .. }
            | Failure::LinearSolver { status, .. }
            | Failure::Integration { status, .. } => status.code(),
            Failure::SteadyState { status, .. } => status.code(),
        }
    }
}

/// Logs a failure on its way out to the caller.
pub(crate) fn report(failure: Failure) -> Failure {
    log::warn!("{failure}");
    failure
}

/// Lets success statuses through and turns anything else into an
/// `Integration` failure.
pub(crate) fn check_step(entity: &str, time: f64, status: StepStatus) -> Result<StepStatus, Failure> {
    if status.is_success() {
        return Ok(status);
    }
    Err(report(Failure::Integration {
        entity: entity.to_string(),
        time,
        status,
    }))
}

/// Lets continuable statuses through and turns hard failures into a
/// `SteadyState` failure.
pub(crate) fn check_hybrid(entity: &str, status: HybridStatus) -> Result<HybridStatus, Failure> {
    if status.is_continuable() {
        return Ok(status);
    }
    Err(report(Failure::SteadyState {
        entity: entity.to_string(),
        status,
    }))
}
