use crate::config::EventDirection;
use crate::failure::StepStatus;

const MAX_SEARCH_ITERATIONS: usize = 100;

/// Root-search memory for one scalar trigger.
///
/// Keeps the left end of the not-yet-searched interval together with the
/// trigger value there. The integrator feeds it windows `(t_lo, hi]` that lie
/// inside the last accepted step; the trigger is evaluated on the step's
/// interpolant so the trajectory itself is never touched.
#[derive(Debug, Clone)]
pub(crate) struct EventDetector {
    direction: EventDirection,
    t_lo: f64,
    g_lo: f64,
    evaluations: usize,
    events: usize,
}

impl EventDetector {
    pub(crate) fn new(direction: EventDirection) -> Self {
        Self {
            direction,
            t_lo: 0.0,
            g_lo: 0.0,
            evaluations: 0,
            events: 0,
        }
    }

    /// Sets the search origin. `g` evaluates the trigger on the trajectory.
    pub(crate) fn arm<G>(&mut self, t: f64, g: &mut G) -> Result<(), StepStatus>
    where
        G: FnMut(f64) -> Result<f64, StepStatus>,
    {
        self.g_lo = self.eval(t, g)?;
        self.t_lo = t;
        Ok(())
    }

    pub(crate) fn searched_until(&self) -> f64 {
        self.t_lo
    }

    pub(crate) fn evaluations(&self) -> usize {
        self.evaluations
    }

    pub(crate) fn events(&self) -> usize {
        self.events
    }

    /// Searches `(t_lo, hi]` for the first reportable crossing and moves the
    /// origin to the crossing, or to `hi` when there is none.
    ///
    /// The returned time is the right end of the final bracket, so the
    /// trigger is non-negative there and the crossing is not found again.
    pub(crate) fn search<G>(&mut self, hi: f64, g: &mut G) -> Result<Option<f64>, StepStatus>
    where
        G: FnMut(f64) -> Result<f64, StepStatus>,
    {
        if hi <= self.t_lo {
            return Ok(None);
        }
        let g_hi = self.eval(hi, g)?;
        if !self.direction.crossed(self.g_lo, g_hi) {
            self.t_lo = hi;
            self.g_lo = g_hi;
            return Ok(None);
        }

        let (root, g_root) = self.illinois(self.t_lo, self.g_lo, hi, g_hi, g)?;
        log::debug!("rising crossing located at t = {root}");
        self.t_lo = root;
        self.g_lo = g_root;
        self.events += 1;
        Ok(Some(root))
    }

    /// Regula falsi with the Illinois modification on a bracket
    /// `g(a) < 0 <= g(b)`.
    fn illinois<G>(
        &mut self,
        mut a: f64,
        mut ga: f64,
        mut b: f64,
        mut gb: f64,
        g: &mut G,
    ) -> Result<(f64, f64), StepStatus>
    where
        G: FnMut(f64) -> Result<f64, StepStatus>,
    {
        let tol = 100.0 * f64::EPSILON * (b.abs() + (b - a).abs());
        let mut side = 0i8;
        // Weighted values drive the secant; ga/gb keep the true signs.
        let (mut wa, mut wb) = (ga, gb);

        for _ in 0..MAX_SEARCH_ITERATIONS {
            if b - a <= tol {
                break;
            }
            let mut m = b - wb * (b - a) / (wb - wa);
            if !m.is_finite() || m <= a + 0.5 * tol || m >= b - 0.5 * tol {
                m = 0.5 * (a + b);
            }
            let gm = self.eval(m, g)?;
            if gm >= 0.0 {
                b = m;
                gb = gm;
                wb = gm;
                if side == 1 {
                    wa *= 0.5;
                }
                side = 1;
            } else {
                a = m;
                ga = gm;
                wa = gm;
                if side == -1 {
                    wb *= 0.5;
                }
                side = -1;
            }
        }
        debug_assert!(ga < 0.0);
        Ok((b, gb))
    }

    fn eval<G>(&mut self, t: f64, g: &mut G) -> Result<f64, StepStatus>
    where
        G: FnMut(f64) -> Result<f64, StepStatus>,
    {
        self.evaluations += 1;
        let value = g(t)?;
        if value.is_nan() {
            return Err(StepStatus::RootFunctionFailure);
        }
        Ok(value)
    }
}
