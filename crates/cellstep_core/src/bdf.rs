//! Variable-order, variable-step backward differentiation backend.
//!
//! The solution history is kept as a table of backward differences
//! `D[0] = y_n, D[j] = ∇^j y_n` computed at equal spacing `h`. Changing the
//! step size rescales the table instead of restarting, so order and step
//! size adapt independently. Each step solves the implicit corrector with a
//! modified Newton iteration against `M = I - c·J`, where `J` is a
//! finite-difference Jacobian approximation (diagonal or dense).

use crate::config::{LinearSolverKind, MAX_BDF_ORDER};
use crate::failure::StepStatus;
use crate::linalg::{rms_norm, try_zeros, IterationMatrix, JacobianApprox};
use nalgebra::DMatrix;
use serde::Serialize;

/// Right-hand side as seen by the backend; the context is already bound.
pub(crate) type Rhs<'a> = dyn Fn(f64, &[f64], &mut [f64]) -> anyhow::Result<()> + 'a;

const ROWS: usize = MAX_BDF_ORDER + 3;
const NEWTON_MAXITER: usize = 4;
const MIN_FACTOR: f64 = 0.2;
const MAX_FACTOR: f64 = 10.0;
const MAX_ERROR_TEST_FAILS: usize = 7;
const MAX_CONV_FAILS: usize = 10;
/// Refactor M when c has drifted by more than this fraction.
const MAX_GAMMA_DRIFT: f64 = 0.3;
/// Accepted steps before the Jacobian approximation is refreshed.
const MAX_JACOBIAN_AGE: usize = 20;

/// Counters and current step data of one backend instance.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct SolverStats {
    pub steps: usize,
    pub rhs_evaluations: usize,
    pub jacobian_evaluations: usize,
    pub factorizations: usize,
    pub error_test_failures: usize,
    pub convergence_failures: usize,
    pub stability_order_reductions: usize,
    pub order: usize,
    pub last_step: f64,
    pub time: f64,
}

/// Interpolant of the last accepted step.
struct DenseOutput {
    t: f64,
    h: f64,
    order: usize,
    diffs: Vec<Vec<f64>>,
}

impl DenseOutput {
    fn eval(&self, t: f64, out: &mut [f64]) {
        out.copy_from_slice(&self.diffs[0]);
        let mut p = 1.0;
        for j in 1..=self.order {
            let node = self.t - (j - 1) as f64 * self.h;
            p *= (t - node) / (j as f64 * self.h);
            for (o, d) in out.iter_mut().zip(&self.diffs[j]) {
                *o += d * p;
            }
        }
    }
}

/// Growth factor per step that counts as a spurious root.
const STABILITY_GROWTH: f64 = 1.1;
/// Allowed spread between successive growth factors.
const STABILITY_SPREAD: f64 = 0.1;

/// Tracks `|∇^q y| / (h^q |y|)` over equal steps. A consistent growth factor
/// well above one means a parasitic root of the method has left the unit
/// disc, which happens at order 3 and above on stiff modes.
#[derive(Default)]
struct StabilityMonitor {
    history: [f64; 3],
    len: usize,
}

impl StabilityMonitor {
    fn reset(&mut self) {
        self.len = 0;
    }

    fn record(&mut self, value: f64) {
        if self.len == self.history.len() {
            self.history.rotate_left(1);
            self.history[2] = value;
        } else {
            self.history[self.len] = value;
            self.len += 1;
        }
    }

    fn unstable(&self) -> bool {
        if self.len < self.history.len() {
            return false;
        }
        let [a, b, c] = self.history;
        if !(a > 0.0 && b > 0.0 && c.is_finite()) {
            return false;
        }
        let (r1, r2) = (b / a, c / b);
        r1 > STABILITY_GROWTH && r2 > STABILITY_GROWTH && (r2 / r1 - 1.0).abs() < STABILITY_SPREAD
    }
}

/// Owned backend state for one entity.
pub(crate) struct BdfSolver {
    dim: usize,
    rtol: f64,
    atol: f64,
    newton_tol: f64,
    max_order: usize,
    max_step: f64,
    initial_step: Option<f64>,
    stability_limit_detection: bool,
    linear_solver: LinearSolverKind,

    t: f64,
    h_abs: f64,
    order: usize,
    started: bool,
    n_equal_steps: usize,
    diffs: Vec<Vec<f64>>,
    f0: Vec<f64>,

    jacobian: Option<JacobianApprox>,
    jacobian_age: usize,
    iteration: Option<(IterationMatrix, f64)>,

    gamma: [f64; MAX_BDF_ORDER + 1],
    error_const: [f64; MAX_BDF_ORDER + 2],

    y_pred: Vec<f64>,
    y_new: Vec<f64>,
    psi: Vec<f64>,
    correction: Vec<f64>,
    scale: Vec<f64>,
    work: Vec<f64>,
    work2: Vec<f64>,
    f_base: Vec<f64>,
    increments: Vec<f64>,

    dense: Option<DenseOutput>,
    monitor: StabilityMonitor,
    stats: SolverStats,
}

impl BdfSolver {
    /// Reserves storage for an n-dimensional system.
    pub(crate) fn allocate(dim: usize) -> Result<Self, StepStatus> {
        if dim == 0 {
            return Err(StepStatus::IllegalInput);
        }
        let alloc = || try_zeros(dim).ok_or(StepStatus::MemoryFailure);
        let mut diffs = Vec::new();
        diffs
            .try_reserve_exact(ROWS)
            .map_err(|_| StepStatus::MemoryFailure)?;
        for _ in 0..ROWS {
            diffs.push(alloc()?);
        }

        let mut gamma = [0.0; MAX_BDF_ORDER + 1];
        for k in 1..=MAX_BDF_ORDER {
            gamma[k] = gamma[k - 1] + 1.0 / k as f64;
        }
        let mut error_const = [0.0; MAX_BDF_ORDER + 2];
        for (k, value) in error_const.iter_mut().enumerate() {
            *value = 1.0 / (k + 1) as f64;
        }

        Ok(Self {
            dim,
            rtol: 1e-4,
            atol: 1e-8,
            newton_tol: newton_tolerance(1e-4),
            max_order: MAX_BDF_ORDER,
            max_step: f64::INFINITY,
            initial_step: None,
            stability_limit_detection: false,
            linear_solver: LinearSolverKind::Diagonal,
            t: 0.0,
            h_abs: 0.0,
            order: 1,
            started: false,
            n_equal_steps: 0,
            diffs,
            f0: alloc()?,
            jacobian: None,
            jacobian_age: 0,
            iteration: None,
            gamma,
            error_const,
            y_pred: alloc()?,
            y_new: alloc()?,
            psi: alloc()?,
            correction: alloc()?,
            scale: alloc()?,
            work: alloc()?,
            work2: alloc()?,
            f_base: alloc()?,
            increments: alloc()?,
            dense: None,
            monitor: StabilityMonitor::default(),
            stats: SolverStats {
                order: 1,
                ..SolverStats::default()
            },
        })
    }

    /// Sets the initial condition and evaluates the first derivative.
    /// Also used to restart the history after a discontinuity; on error the
    /// previous history is left as it was.
    pub(crate) fn initialize(&mut self, t0: f64, y0: &[f64], rhs: &Rhs) -> Result<(), StepStatus> {
        if y0.len() != self.dim || !t0.is_finite() || y0.iter().any(|v| !v.is_finite()) {
            return Err(StepStatus::IllegalInput);
        }
        self.stats.rhs_evaluations += 1;
        if let Err(err) = rhs(t0, y0, &mut self.work2) {
            log::debug!("first right-hand side evaluation failed: {err:#}");
            return Err(StepStatus::FirstRhsFailure);
        }
        if self.work2.iter().any(|v| !v.is_finite()) {
            return Err(StepStatus::FirstRhsFailure);
        }

        self.f0.copy_from_slice(&self.work2);
        self.diffs[0].copy_from_slice(y0);
        for row in &mut self.diffs[1..] {
            row.fill(0.0);
        }
        self.t = t0;
        self.h_abs = 0.0;
        self.order = 1;
        self.started = false;
        self.n_equal_steps = 0;
        self.jacobian_age = MAX_JACOBIAN_AGE;
        self.iteration = None;
        self.dense = None;
        self.monitor.reset();
        self.stats.order = 1;
        self.stats.time = t0;
        Ok(())
    }

    pub(crate) fn set_tolerances(&mut self, rtol: f64, atol: f64) -> Result<(), StepStatus> {
        if !(rtol.is_finite() && rtol >= 0.0 && atol.is_finite() && atol > 0.0) {
            return Err(StepStatus::IllegalInput);
        }
        self.rtol = rtol;
        self.atol = atol;
        self.newton_tol = newton_tolerance(rtol);
        Ok(())
    }

    pub(crate) fn set_stability_limit_detection(&mut self, enabled: bool) -> Result<(), StepStatus> {
        self.stability_limit_detection = enabled;
        Ok(())
    }

    pub(crate) fn set_max_order(&mut self, max_order: usize) -> Result<(), StepStatus> {
        if max_order == 0 || max_order > MAX_BDF_ORDER {
            return Err(StepStatus::IllegalInput);
        }
        self.max_order = max_order;
        self.order = self.order.min(max_order);
        Ok(())
    }

    /// `f64::INFINITY` lifts the cap.
    pub(crate) fn set_max_step(&mut self, max_step: f64) -> Result<(), StepStatus> {
        if max_step.is_nan() || max_step <= 0.0 {
            return Err(StepStatus::IllegalInput);
        }
        self.max_step = max_step;
        Ok(())
    }

    pub(crate) fn set_initial_step(&mut self, initial_step: Option<f64>) -> Result<(), StepStatus> {
        if let Some(h) = initial_step {
            if !(h.is_finite() && h > 0.0) {
                return Err(StepStatus::IllegalInput);
            }
        }
        self.initial_step = initial_step;
        Ok(())
    }

    pub(crate) fn attach_linear_solver(&mut self, kind: LinearSolverKind) -> Result<(), StepStatus> {
        if kind == LinearSolverKind::Dense {
            // Reserve the n×n Jacobian up front so a refusal surfaces here.
            let entries = self
                .dim
                .checked_mul(self.dim)
                .and_then(try_zeros)
                .ok_or(StepStatus::MemoryFailure)?;
            self.jacobian = Some(JacobianApprox::Dense {
                dim: self.dim,
                entries,
            });
            self.jacobian_age = MAX_JACOBIAN_AGE;
        } else {
            self.jacobian = None;
        }
        self.linear_solver = kind;
        self.iteration = None;
        Ok(())
    }

    pub(crate) fn time(&self) -> f64 {
        self.t
    }

    #[cfg(test)]
    pub(crate) fn state(&self) -> &[f64] {
        &self.diffs[0]
    }

    pub(crate) fn stats(&self) -> SolverStats {
        self.stats
    }

    /// Evaluates the interpolant of the last step at `t`. Before the first
    /// step this is the initial state.
    pub(crate) fn interpolate(&self, t: f64, out: &mut [f64]) {
        match &self.dense {
            Some(dense) => dense.eval(t, out),
            None => out.copy_from_slice(&self.diffs[0]),
        }
    }

    /// Start of the interval the current interpolant covers.
    #[cfg(test)]
    pub(crate) fn step_start(&self) -> f64 {
        match &self.dense {
            Some(dense) => dense.t - dense.h,
            None => self.t,
        }
    }

    /// Takes one internal step.
    pub(crate) fn step(&mut self, rhs: &Rhs) -> Result<(), StepStatus> {
        if !self.started {
            self.start(rhs)?;
        }
        self.check_accuracy()?;

        let t = self.t;
        let min_step = 10.0 * spacing(t);
        if self.h_abs > self.max_step {
            self.rescale(self.order, self.max_step / self.h_abs);
        } else if self.h_abs < min_step {
            self.rescale(self.order, min_step / self.h_abs);
        }

        let order = self.order;
        let alpha = self.gamma[order];
        let mut error_fails = 0usize;
        let mut conv_fails = 0usize;
        let mut last_failure = StepStatus::ErrorTestFailure;

        let (error_norm, n_iter) = loop {
            let h_abs = self.h_abs;
            if h_abs < min_step {
                return Err(last_failure);
            }
            let t_new = t + h_abs;
            let c = h_abs / alpha;
            self.predict(order, alpha);

            let (converged, n_iter) = self.correct(rhs, t_new, h_abs, c)?;
            if !converged {
                conv_fails += 1;
                self.stats.convergence_failures += 1;
                last_failure = StepStatus::ConvergenceFailure;
                if conv_fails >= MAX_CONV_FAILS {
                    return Err(StepStatus::ConvergenceFailure);
                }
                self.rescale(order, 0.5);
                self.iteration = None;
                continue;
            }

            for i in 0..self.dim {
                self.scale[i] = self.atol + self.rtol * self.y_new[i].abs();
                self.work[i] = self.error_const[order] * self.correction[i];
            }
            let error_norm = rms_norm(&self.work, &self.scale);
            if error_norm > 1.0 {
                error_fails += 1;
                self.stats.error_test_failures += 1;
                last_failure = StepStatus::ErrorTestFailure;
                if error_fails >= MAX_ERROR_TEST_FAILS {
                    return Err(StepStatus::ErrorTestFailure);
                }
                let factor =
                    (safety(n_iter) * error_norm.powf(-1.0 / (order + 1) as f64)).max(MIN_FACTOR);
                self.rescale(order, factor);
                continue;
            }
            break (error_norm, n_iter);
        };

        let h_abs = self.h_abs;
        self.accept(t + h_abs, h_abs);
        self.select_order(error_norm, n_iter);
        Ok(())
    }

    /// Changes the step size by `factor`. The difference table and `h_abs`
    /// always move together, so an error exit leaves a consistent history.
    fn rescale(&mut self, order: usize, factor: f64) {
        change_differences(&mut self.diffs, order, factor);
        self.h_abs *= factor;
        self.n_equal_steps = 0;
    }

    fn start(&mut self, rhs: &Rhs) -> Result<(), StepStatus> {
        let h = match self.initial_step {
            Some(h) => h,
            None => self.estimate_initial_step(rhs)?,
        };
        let h = h.min(self.max_step);
        for (d, f) in self.diffs[1].iter_mut().zip(&self.f0) {
            *d = f * h;
        }
        self.h_abs = h;
        self.started = true;
        Ok(())
    }

    /// Initial step from first and second derivative estimates.
    fn estimate_initial_step(&mut self, rhs: &Rhs) -> Result<f64, StepStatus> {
        let y0 = &self.diffs[0];
        for i in 0..self.dim {
            self.scale[i] = self.atol + self.rtol * y0[i].abs();
        }
        let d0 = rms_norm(y0, &self.scale);
        let d1 = rms_norm(&self.f0, &self.scale);
        let h0 = if d0 < 1e-5 || d1 < 1e-5 || !(d0 / d1).is_finite() {
            1e-6
        } else {
            0.01 * d0 / d1
        };

        for i in 0..self.dim {
            self.work[i] = y0[i] + h0 * self.f0[i];
        }
        self.eval_rhs(rhs, self.t + h0)?;
        for i in 0..self.dim {
            self.work[i] = self.work2[i] - self.f0[i];
        }
        let d2 = rms_norm(&self.work, &self.scale) / h0;

        let h1 = if d1 <= 1e-15 && d2 <= 1e-15 {
            (h0 * 1e-3).max(1e-6)
        } else {
            (0.01 / d1.max(d2)).sqrt()
        };
        let h = (100.0 * h0).min(h1);
        Ok(if h.is_finite() && h > 0.0 { h } else { 1e-6 })
    }

    fn check_accuracy(&mut self) -> Result<(), StepStatus> {
        let y = &self.diffs[0];
        for i in 0..self.dim {
            self.scale[i] = self.atol + self.rtol * y[i].abs();
        }
        if f64::EPSILON * rms_norm(y, &self.scale) > 1.0 {
            return Err(StepStatus::TooMuchAccuracy);
        }
        Ok(())
    }

    fn predict(&mut self, order: usize, alpha: f64) {
        self.y_pred.fill(0.0);
        self.psi.fill(0.0);
        for (j, row) in self.diffs[..=order].iter().enumerate() {
            for i in 0..self.dim {
                self.y_pred[i] += row[i];
                if j > 0 {
                    self.psi[i] += row[i] * self.gamma[j];
                }
            }
        }
        for i in 0..self.dim {
            self.psi[i] /= alpha;
            self.scale[i] = self.atol + self.rtol * self.y_pred[i].abs();
        }
    }

    /// Newton corrector with one Jacobian refresh on failure.
    fn correct(
        &mut self,
        rhs: &Rhs,
        t_new: f64,
        h: f64,
        c: f64,
    ) -> Result<(bool, usize), StepStatus> {
        let mut jacobian_fresh = false;
        if self.jacobian_age >= MAX_JACOBIAN_AGE || self.jacobian.is_none() {
            self.update_jacobian(rhs, t_new, h)?;
            jacobian_fresh = true;
        }
        loop {
            let (converged, n_iter) = if self.ensure_iteration_matrix(c)? {
                self.newton(rhs, t_new, c)?
            } else {
                (false, 0)
            };
            if converged || jacobian_fresh {
                return Ok((converged, n_iter));
            }
            self.update_jacobian(rhs, t_new, h)?;
            jacobian_fresh = true;
        }
    }

    /// Reuses or rebuilds the factored iteration matrix. A singular M only
    /// fails the current attempt (a smaller step may cure it); a Jacobian with
    /// non-finite entries cannot be factored at any step size.
    fn ensure_iteration_matrix(&mut self, c: f64) -> Result<bool, StepStatus> {
        if let Some((_, c_factored)) = &self.iteration {
            if (c / c_factored - 1.0).abs() <= MAX_GAMMA_DRIFT {
                return Ok(true);
            }
        }
        let Some(jacobian) = &self.jacobian else {
            return Ok(false);
        };
        if !jacobian.is_finite() {
            log::debug!("Jacobian approximation has non-finite entries at t = {}", self.t);
            return Err(StepStatus::LinearSetupFailure);
        }
        self.stats.factorizations += 1;
        match IterationMatrix::factor(jacobian, c) {
            Some(matrix) => {
                self.iteration = Some((matrix, c));
                Ok(true)
            }
            None => {
                self.iteration = None;
                Ok(false)
            }
        }
    }

    fn newton(&mut self, rhs: &Rhs, t_new: f64, c: f64) -> Result<(bool, usize), StepStatus> {
        let Some((matrix, _)) = &self.iteration else {
            return Ok((false, 0));
        };
        self.y_new.copy_from_slice(&self.y_pred);
        self.correction.fill(0.0);
        let mut dy_norm_old: Option<f64> = None;

        for k in 0..NEWTON_MAXITER {
            self.stats.rhs_evaluations += 1;
            if let Err(err) = rhs(t_new, &self.y_new, &mut self.work) {
                log::debug!("right-hand side evaluation failed at t = {t_new}: {err:#}");
                return Err(StepStatus::RhsFailure);
            }
            if self.work.iter().any(|v| !v.is_finite()) {
                return Ok((false, k + 1));
            }
            for i in 0..self.dim {
                self.work[i] = c * self.work[i] - self.psi[i] - self.correction[i];
            }
            if !matrix.solve(&mut self.work) {
                return Ok((false, k + 1));
            }
            let dy_norm = rms_norm(&self.work, &self.scale);
            let rate = dy_norm_old.map(|old| dy_norm / old);
            if let Some(rate) = rate {
                if rate >= 1.0
                    || rate.powi((NEWTON_MAXITER - k) as i32) / (1.0 - rate) * dy_norm
                        > self.newton_tol
                {
                    return Ok((false, k + 1));
                }
            }
            for i in 0..self.dim {
                self.y_new[i] += self.work[i];
                self.correction[i] += self.work[i];
            }
            let small = match rate {
                Some(rate) => rate / (1.0 - rate) * dy_norm < self.newton_tol,
                None => false,
            };
            if dy_norm == 0.0 || small {
                return Ok((true, k + 1));
            }
            dy_norm_old = Some(dy_norm);
        }
        Ok((false, NEWTON_MAXITER))
    }

    /// Difference-quotient Jacobian at (t, y_pred). Increments follow
    /// `max(√ε·|y_j|, min_inc·scale_j)` with a floor tied to the size of f.
    fn update_jacobian(&mut self, rhs: &Rhs, t: f64, h: f64) -> Result<(), StepStatus> {
        self.stats.jacobian_evaluations += 1;
        self.jacobian_age = 0;
        self.iteration = None;

        self.work.copy_from_slice(&self.y_pred);
        self.eval_rhs(rhs, t)?;
        self.f_base.copy_from_slice(&self.work2);
        let f_norm = rms_norm(&self.f_base, &self.scale);
        let min_inc = if f_norm > 0.0 && f_norm.is_finite() {
            1000.0 * h * f64::EPSILON * self.dim as f64 * f_norm
        } else {
            1.0
        };
        let increment = |y: f64, scale: f64| (f64::EPSILON.sqrt() * y.abs()).max(min_inc * scale);

        match self.linear_solver {
            LinearSolverKind::Diagonal => {
                for i in 0..self.dim {
                    let y = self.y_pred[i];
                    self.work[i] = y + increment(y, self.scale[i]);
                    self.increments[i] = self.work[i] - y;
                }
                self.eval_rhs(rhs, t)?;
                let mut diag = match self.jacobian.take() {
                    Some(JacobianApprox::Diagonal(diag)) => diag,
                    _ => try_zeros(self.dim).ok_or(StepStatus::MemoryFailure)?,
                };
                for (i, d) in diag.iter_mut().enumerate() {
                    *d = (self.work2[i] - self.f_base[i]) / self.increments[i];
                }
                self.jacobian = Some(JacobianApprox::Diagonal(diag));
            }
            LinearSolverKind::Dense => {
                let dim = self.dim;
                let mut entries = match self.jacobian.take() {
                    Some(JacobianApprox::Dense { entries, .. }) => entries,
                    _ => try_zeros(dim * dim).ok_or(StepStatus::MemoryFailure)?,
                };
                for j in 0..dim {
                    self.work.copy_from_slice(&self.y_pred);
                    let y = self.y_pred[j];
                    self.work[j] = y + increment(y, self.scale[j]);
                    let delta = self.work[j] - y;
                    self.eval_rhs(rhs, t)?;
                    for i in 0..dim {
                        entries[i * dim + j] = (self.work2[i] - self.f_base[i]) / delta;
                    }
                }
                self.jacobian = Some(JacobianApprox::Dense { dim, entries });
            }
        }
        Ok(())
    }

    /// Evaluates f(t, work) into work2.
    fn eval_rhs(&mut self, rhs: &Rhs, t: f64) -> Result<(), StepStatus> {
        self.stats.rhs_evaluations += 1;
        rhs(t, &self.work, &mut self.work2).map_err(|err| {
            log::debug!("right-hand side evaluation failed at t = {t}: {err:#}");
            StepStatus::RhsFailure
        })
    }

    fn accept(&mut self, t_new: f64, h_abs: f64) {
        let order = self.order;
        self.n_equal_steps += 1;
        self.t = t_new;
        self.h_abs = h_abs;
        self.jacobian_age += 1;

        // ∇^{j+1} y_n = ∇^j y_n - ∇^j y_{n-1}; `correction` is ∇^{k+1} y_n.
        for i in 0..self.dim {
            let d = self.correction[i];
            self.diffs[order + 2][i] = d - self.diffs[order + 1][i];
            self.diffs[order + 1][i] = d;
        }
        for j in (0..=order).rev() {
            let (head, tail) = self.diffs.split_at_mut(j + 1);
            for (a, b) in head[j].iter_mut().zip(&tail[0]) {
                *a += b;
            }
        }

        let mut dense = self.dense.take().unwrap_or_else(|| DenseOutput {
            t: t_new,
            h: h_abs,
            order,
            diffs: Vec::new(),
        });
        dense.t = t_new;
        dense.h = h_abs;
        dense.order = order;
        dense.diffs.truncate(0);
        dense.diffs.extend(self.diffs[..=order].iter().cloned());
        self.dense = Some(dense);

        self.stats.steps += 1;
        self.stats.last_step = h_abs;
        self.stats.time = t_new;
    }

    fn select_order(&mut self, error_norm: f64, n_iter: usize) {
        let order = self.order;
        if self.stability_limit_detection && order >= 3 {
            if self.n_equal_steps == 1 {
                self.monitor.reset();
            }
            let rms = |values: &[f64]| {
                (values.iter().map(|v| v * v).sum::<f64>() / values.len() as f64).sqrt()
            };
            let size = rms(&self.diffs[0]) + self.atol;
            let growth = rms(&self.diffs[order]) / (self.h_abs.powi(order as i32) * size);
            self.monitor.record(growth);
        } else {
            self.monitor.reset();
        }

        if self.n_equal_steps < order + 1 {
            return;
        }

        let scaled_norm = |row: usize, k: usize, solver: &Self| -> f64 {
            let c = solver.error_const[k];
            let sum: f64 = solver.diffs[row]
                .iter()
                .zip(&solver.scale)
                .map(|(d, s)| (c * d / s) * (c * d / s))
                .sum();
            (sum / solver.dim as f64).sqrt()
        };
        let error_m = if order > 1 {
            scaled_norm(order, order - 1, self)
        } else {
            f64::INFINITY
        };
        let error_p = if order < self.max_order {
            scaled_norm(order + 2, order + 1, self)
        } else {
            f64::INFINITY
        };

        let norms = [error_m, error_norm, error_p];
        let mut factors = [0.0; 3];
        for (i, (factor, norm)) in factors.iter_mut().zip(norms).enumerate() {
            *factor = norm.powf(-1.0 / (order + i) as f64);
        }

        let mut best = 0usize;
        for i in 1..3 {
            if factors[i] > factors[best] {
                best = i;
            }
        }
        if self.monitor.unstable() {
            log::debug!("stability limit detected at order {order}, t = {}", self.t);
            self.stats.stability_order_reductions += 1;
            self.monitor.reset();
            best = 0;
        }

        let new_order = order + best - 1;
        if new_order != order {
            log::debug!("order change {order} -> {new_order} at t = {}", self.t);
        }
        let factor = (safety(n_iter) * factors[best]).min(MAX_FACTOR);
        self.order = new_order;
        self.stats.order = new_order;
        self.rescale(new_order, factor);
        self.iteration = None;
    }
}

fn newton_tolerance(rtol: f64) -> f64 {
    let rtol = rtol.max(100.0 * f64::EPSILON);
    (10.0 * f64::EPSILON / rtol).max(0.03_f64.min(rtol.sqrt()))
}

fn safety(n_iter: usize) -> f64 {
    0.9 * (2 * NEWTON_MAXITER + 1) as f64 / (2 * NEWTON_MAXITER + n_iter) as f64
}

fn spacing(t: f64) -> f64 {
    (t.abs() * f64::EPSILON).max(f64::MIN_POSITIVE)
}

/// Transformation taking differences at spacing h to spacing factor·h.
fn compute_r(order: usize, factor: f64) -> DMatrix<f64> {
    let n = order + 1;
    let mut m = DMatrix::zeros(n, n);
    for j in 0..n {
        m[(0, j)] = 1.0;
    }
    for i in 1..n {
        for j in 1..n {
            m[(i, j)] = (i as f64 - 1.0 - factor * j as f64) / i as f64;
        }
    }
    for i in 1..n {
        for j in 0..n {
            m[(i, j)] *= m[(i - 1, j)];
        }
    }
    m
}

fn change_differences(diffs: &mut [Vec<f64>], order: usize, factor: f64) {
    let ru = compute_r(order, factor) * compute_r(order, 1.0);
    let old: Vec<Vec<f64>> = diffs[..=order].to_vec();
    for (i, row) in diffs[..=order].iter_mut().enumerate() {
        for (c, value) in row.iter_mut().enumerate() {
            *value = (0..=order).map(|k| ru[(k, i)] * old[k][c]).sum();
        }
    }
}
