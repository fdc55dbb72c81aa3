//! `cellstep_core` advances the continuous state of one simulated entity.
//!
//! Key components:
//! - **TrajectoryIntegrator**: owns a variable-order BDF backend per entity and
//!   moves its state to host-chosen target times.
//! - **Event detection**: rising crossings of a scalar trigger are located on
//!   the step interpolant and reported with the crossing time and state.
//! - **SteadyStateSolver**: derivative-free hybrid (Powell) root finder used to
//!   compute consistent initial conditions.
//! - **Failure**: typed failure kinds carrying the entity name and backend code.
//!
//! Right-hand sides, triggers and residuals are plain callables that receive
//! the entity's context by reference.

mod bdf;
pub mod config;
mod events;
pub mod failure;
pub mod integrator;
mod linalg;
pub mod state;
pub mod steady_state;
pub mod traits;

pub use bdf::SolverStats;
pub use config::{
    EventDirection, IntegratorConfig, LinearSolverKind, MaxStep, SteadyStateSettings,
    MAX_BDF_ORDER,
};
pub use failure::{Failure, HybridStatus, StepStatus};
pub use integrator::{Advance, Dynamics, EventRecord, IntegratorStats, TrajectoryIntegrator};
pub use state::{DimensionMismatch, StateVector};
pub use steady_state::{solve_steady_state, SteadyState, SteadyStateSolver};
pub use traits::{Residual, Trigger, VectorField};
