use anyhow::Result;

/// Right-hand side of an entity's ODE system, dy/dt = f(t, y).
///
/// `context` carries the entity-specific parameters; it is handed through
/// unchanged on every call.
pub trait VectorField<C: ?Sized> {
    /// Evaluates the derivative.
    /// t: current time
    /// y: current state
    /// out: buffer to write dy/dt into (same length as `y`)
    fn apply(&self, t: f64, y: &[f64], context: &C, out: &mut [f64]) -> Result<()>;
}

impl<C: ?Sized, F> VectorField<C> for F
where
    F: Fn(f64, &[f64], &C, &mut [f64]) -> Result<()>,
{
    fn apply(&self, t: f64, y: &[f64], context: &C, out: &mut [f64]) -> Result<()> {
        self(t, y, context, out)
    }
}

/// Scalar threshold function. A transition from negative to non-negative
/// marks an event.
pub trait Trigger<C: ?Sized> {
    fn evaluate(&self, t: f64, y: &[f64], context: &C) -> Result<f64>;
}

impl<C: ?Sized, F> Trigger<C> for F
where
    F: Fn(f64, &[f64], &C) -> Result<f64>,
{
    fn evaluate(&self, t: f64, y: &[f64], context: &C) -> Result<f64> {
        self(t, y, context)
    }
}

/// Residual whose root defines a steady state, R(y) = 0.
pub trait Residual<C: ?Sized> {
    /// Writes R(y) into `out` (same length as `y`).
    fn apply(&self, y: &[f64], context: &C, out: &mut [f64]) -> Result<()>;
}

impl<C: ?Sized, F> Residual<C> for F
where
    F: Fn(&[f64], &C, &mut [f64]) -> Result<()>,
{
    fn apply(&self, y: &[f64], context: &C, out: &mut [f64]) -> Result<()> {
        self(y, context, out)
    }
}
