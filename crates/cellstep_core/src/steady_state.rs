use crate::config::SteadyStateSettings;
use crate::failure::{check_hybrid, report, Failure, HybridStatus};
use crate::linalg::try_zeros;
use crate::state::StateVector;
use crate::traits::Residual;
use nalgebra::{DMatrix, DVector};
use serde::{Deserialize, Serialize};

/// Trust-region constants of the hybrid method.
const P1: f64 = 0.1;
const P5: f64 = 0.5;
const P001: f64 = 1e-3;
const P0001: f64 = 1e-4;
const INITIAL_DELTA_FACTOR: f64 = 100.0;
const NO_PROGRESS_ITERATIONS: usize = 10;
const NO_PROGRESS_JACOBIANS: usize = 5;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SteadyState {
    pub state: StateVector,
    /// Sum of absolute residual components at `state`.
    pub residual: f64,
    pub iterations: usize,
    /// False when the iteration budget ran out before the residual
    /// tolerance was met. `state` is then the last iterate.
    pub converged: bool,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct SteadyStateSolver {
    settings: SteadyStateSettings,
}

impl SteadyStateSolver {
    pub fn new(settings: SteadyStateSettings) -> Self {
        Self { settings }
    }

    pub fn settings(&self) -> &SteadyStateSettings {
        &self.settings
    }

    /// Finds a root of `residual` starting from the origin.
    ///
    /// Hard backend statuses fail immediately; running out of iterations
    /// returns the last iterate with `converged == false`.
    pub fn solve<C, R>(
        &self,
        residual: &R,
        dimension: usize,
        context: &C,
        entity: &str,
    ) -> Result<SteadyState, Failure>
    where
        C: ?Sized,
        R: Residual<C> + ?Sized,
    {
        let fail = |status| {
            report(Failure::SteadyState {
                entity: entity.to_string(),
                status,
            })
        };
        if dimension == 0
            || self.settings.max_iterations == 0
            || !(self.settings.residual_tolerance > 0.0)
        {
            return Err(fail(HybridStatus::InvalidInput));
        }
        let origin = try_zeros(dimension).ok_or_else(|| fail(HybridStatus::MemoryFailure))?;

        let mut hybrid = Hybrid::new(residual, context, origin).map_err(fail)?;
        let tolerance = self.settings.residual_tolerance;
        let mut iterations = 0usize;
        let mut residual_sum = hybrid.residual_sum();

        while test_residual(residual_sum, tolerance) == HybridStatus::Continue {
            if iterations == self.settings.max_iterations {
                log::warn!(
                    "{entity}: steady state not reached in {iterations} iterations, residual {residual_sum:e}"
                );
                return Ok(SteadyState {
                    state: StateVector::from(hybrid.x.as_slice().to_vec()),
                    residual: residual_sum,
                    iterations,
                    converged: false,
                });
            }
            iterations += 1;
            check_hybrid(entity, hybrid.iterate())?;
            residual_sum = hybrid.residual_sum();
        }

        log::debug!("{entity}: steady state after {iterations} iterations, residual {residual_sum:e}");
        Ok(SteadyState {
            state: StateVector::from(hybrid.x.as_slice().to_vec()),
            residual: residual_sum,
            iterations,
            converged: true,
        })
    }
}

/// `Success` once the summed absolute residual is below `tolerance`.
fn test_residual(residual_sum: f64, tolerance: f64) -> HybridStatus {
    if residual_sum < tolerance {
        HybridStatus::Success
    } else {
        HybridStatus::Continue
    }
}

/// Solves with the default budget (1000 iterations, tolerance 1e-7).
pub fn solve_steady_state<C, R>(
    residual: &R,
    dimension: usize,
    context: &C,
    entity: &str,
) -> Result<SteadyState, Failure>
where
    C: ?Sized,
    R: Residual<C> + ?Sized,
{
    SteadyStateSolver::default().solve(residual, dimension, context, entity)
}

/// Powell's hybrid method with a finite-difference Jacobian and rank-1
/// (Broyden) updates between re-evaluations.
struct Hybrid<'a, C: ?Sized, R: ?Sized> {
    residual: &'a R,
    context: &'a C,
    x: DVector<f64>,
    f: DVector<f64>,
    jacobian: DMatrix<f64>,
    q: DMatrix<f64>,
    r: DMatrix<f64>,
    diag: DVector<f64>,
    delta: f64,
    fnorm: f64,
    first: bool,
    jacobian_fresh: bool,
    ncfail: usize,
    ncsuc: usize,
    nslow1: usize,
    nslow2: usize,
}

impl<'a, C, R> Hybrid<'a, C, R>
where
    C: ?Sized,
    R: Residual<C> + ?Sized,
{
    fn new(residual: &'a R, context: &'a C, x0: Vec<f64>) -> Result<Self, HybridStatus> {
        let n = x0.len();
        let x = DVector::from_vec(x0);
        let f = evaluate(residual, context, &x)?;
        let jacobian = finite_difference_jacobian(residual, context, &x, &f)?;

        let mut diag = DVector::from_element(n, 1.0);
        for j in 0..n {
            let norm = jacobian.column(j).norm();
            diag[j] = if norm == 0.0 { 1.0 } else { norm };
        }
        let scaled_x = diag.component_mul(&x).norm();
        let delta = if scaled_x > 0.0 {
            INITIAL_DELTA_FACTOR * scaled_x
        } else {
            INITIAL_DELTA_FACTOR
        };
        let fnorm = f.norm();
        let (q, r) = factor(&jacobian);

        Ok(Self {
            residual,
            context,
            x,
            f,
            jacobian,
            q,
            r,
            diag,
            delta,
            fnorm,
            first: true,
            jacobian_fresh: true,
            ncfail: 0,
            ncsuc: 0,
            nslow1: 0,
            nslow2: 0,
        })
    }

    fn residual_sum(&self) -> f64 {
        self.f.iter().map(|v| v.abs()).sum()
    }

    /// One trust-region step. Returns `Success` unless the iteration is
    /// stuck or the residual misbehaves.
    fn iterate(&mut self) -> HybridStatus {
        match self.try_iterate() {
            Ok(status) | Err(status) => status,
        }
    }

    fn try_iterate(&mut self) -> Result<HybridStatus, HybridStatus> {
        let qtf = self.q.tr_mul(&self.f);
        let dx = dogleg(&self.r, &qtf, &self.diag, self.delta);
        let pnorm = self.diag.component_mul(&dx).norm();
        if self.first && pnorm < self.delta {
            self.delta = pnorm;
        }

        let x_trial = &self.x + &dx;
        let f_trial = evaluate(self.residual, self.context, &x_trial)?;
        let fnorm_trial = f_trial.norm();

        let actred = if fnorm_trial < self.fnorm {
            1.0 - (fnorm_trial / self.fnorm).powi(2)
        } else {
            -1.0
        };
        let predicted = &qtf + &self.r * &dx;
        let fnorm_pred = predicted.norm();
        let prered = if fnorm_pred < self.fnorm {
            1.0 - (fnorm_pred / self.fnorm).powi(2)
        } else {
            0.0
        };
        let ratio = if prered > 0.0 { actred / prered } else { 0.0 };

        if ratio < P1 {
            self.ncsuc = 0;
            self.ncfail += 1;
            self.delta *= P5;
        } else {
            self.ncfail = 0;
            self.ncsuc += 1;
            if ratio >= P5 || self.ncsuc > 1 {
                self.delta = self.delta.max(pnorm / P5);
            }
            if (ratio - 1.0).abs() <= P1 {
                self.delta = pnorm / P5;
            }
        }

        let df = &f_trial - &self.f;
        if ratio >= P0001 {
            self.x = x_trial;
            self.f = f_trial;
            self.fnorm = fnorm_trial;
            self.first = false;
        }

        self.nslow1 += 1;
        if actred >= P001 {
            self.nslow1 = 0;
        }
        if self.jacobian_fresh {
            self.nslow2 += 1;
        }
        if actred >= P1 {
            self.nslow2 = 0;
        }
        if self.nslow2 == NO_PROGRESS_JACOBIANS {
            return Err(HybridStatus::NoProgressJacobian);
        }
        if self.nslow1 == NO_PROGRESS_ITERATIONS {
            return Err(HybridStatus::NoProgress);
        }

        if self.ncfail == 2 {
            self.refresh_jacobian()?;
            return Ok(HybridStatus::Success);
        }

        // Broyden: J += (df - J·dx)(D²·dx)ᵀ / pnorm²
        if pnorm > 0.0 {
            let w = df - &self.jacobian * &dx;
            let v = self.diag.component_mul(&self.diag).component_mul(&dx) / (pnorm * pnorm);
            self.jacobian.ger(1.0, &w, &v, 1.0);
            let (q, r) = factor(&self.jacobian);
            self.q = q;
            self.r = r;
        }
        self.jacobian_fresh = false;
        Ok(HybridStatus::Success)
    }

    fn refresh_jacobian(&mut self) -> Result<(), HybridStatus> {
        log::debug!("re-evaluating finite-difference Jacobian");
        self.jacobian = finite_difference_jacobian(self.residual, self.context, &self.x, &self.f)?;
        for j in 0..self.diag.len() {
            self.diag[j] = self.diag[j].max(self.jacobian.column(j).norm());
        }
        let (q, r) = factor(&self.jacobian);
        self.q = q;
        self.r = r;
        self.ncfail = 0;
        self.jacobian_fresh = true;
        Ok(())
    }
}

fn evaluate<C, R>(residual: &R, context: &C, x: &DVector<f64>) -> Result<DVector<f64>, HybridStatus>
where
    C: ?Sized,
    R: Residual<C> + ?Sized,
{
    let mut out = DVector::zeros(x.len());
    if let Err(err) = residual.apply(x.as_slice(), context, out.as_mut_slice()) {
        log::debug!("residual evaluation failed: {err:#}");
        return Err(HybridStatus::BadFunction);
    }
    if out.iter().any(|v| !v.is_finite()) {
        return Err(HybridStatus::BadFunction);
    }
    Ok(out)
}

fn finite_difference_jacobian<C, R>(
    residual: &R,
    context: &C,
    x: &DVector<f64>,
    f: &DVector<f64>,
) -> Result<DMatrix<f64>, HybridStatus>
where
    C: ?Sized,
    R: Residual<C> + ?Sized,
{
    let n = x.len();
    let eps = f64::EPSILON.sqrt();
    let mut jacobian = DMatrix::zeros(n, n);
    let mut shifted = x.clone();
    for j in 0..n {
        let xj = x[j];
        let dx = if xj == 0.0 { eps } else { eps * xj.abs() };
        shifted[j] = xj + dx;
        let f_shifted = evaluate(residual, context, &shifted)?;
        shifted[j] = xj;
        jacobian.set_column(j, &((f_shifted - f) / dx));
    }
    Ok(jacobian)
}

fn factor(jacobian: &DMatrix<f64>) -> (DMatrix<f64>, DMatrix<f64>) {
    let qr = jacobian.clone().qr();
    (qr.q(), qr.r())
}

/// Dogleg step inside the scaled trust region `‖D·p‖ ≤ delta`.
fn dogleg(r: &DMatrix<f64>, qtf: &DVector<f64>, diag: &DVector<f64>, delta: f64) -> DVector<f64> {
    let newton = -solve_upper(r, qtf);
    let qnorm = diag.component_mul(&newton).norm();
    if qnorm <= delta {
        return newton;
    }

    let mut gradient = -r.tr_mul(qtf).component_div(diag);
    let gnorm = gradient.norm();
    if gnorm == 0.0 {
        return newton * (delta / qnorm);
    }
    gradient = (gradient / gnorm).component_div(diag);

    let rg_norm = (r * &gradient).norm();
    let sgnorm = (gnorm / rg_norm) / rg_norm;
    if !sgnorm.is_finite() || sgnorm > delta {
        return gradient * delta;
    }

    let bnorm = qtf.norm();
    let bg = bnorm / gnorm;
    let bq = bnorm / qnorm;
    let dq = delta / qnorm;
    let sd = sgnorm / delta;
    let t1 = bg * bq * sd;
    let u = t1 - dq;
    let t2 = t1 - dq * sd * sd + (u * u + (1.0 - dq * dq) * (1.0 - sd * sd)).sqrt();
    let alpha = dq * (1.0 - sd * sd) / t2;
    let beta = (1.0 - alpha) * sgnorm;
    newton * alpha + gradient * beta
}

/// Back-substitution for R·p = b. Zero pivots are replaced by a small
/// multiple of the largest one so a rank-deficient R still yields a step.
fn solve_upper(r: &DMatrix<f64>, b: &DVector<f64>) -> DVector<f64> {
    let n = b.len();
    let largest = (0..n).map(|i| r[(i, i)].abs()).fold(0.0, f64::max);
    let floor = if largest > 0.0 {
        f64::EPSILON * largest
    } else {
        f64::EPSILON
    };
    let mut p = DVector::zeros(n);
    for i in (0..n).rev() {
        let mut sum = b[i];
        for j in i + 1..n {
            sum -= r[(i, j)] * p[j];
        }
        let pivot = if r[(i, i)] == 0.0 { floor } else { r[(i, i)] };
        p[i] = sum / pivot;
    }
    p
}
