use nalgebra::{DMatrix, DVector, Dyn, LU};

/// Fallible zeroed buffer; `None` when the allocator refuses.
pub(crate) fn try_zeros(len: usize) -> Option<Vec<f64>> {
    let mut buffer = Vec::new();
    buffer.try_reserve_exact(len).ok()?;
    buffer.resize(len, 0.0);
    Some(buffer)
}

/// Root-mean-square norm of `values / scale`.
pub(crate) fn rms_norm(values: &[f64], scale: &[f64]) -> f64 {
    if values.is_empty() {
        return 0.0;
    }
    let sum: f64 = values
        .iter()
        .zip(scale)
        .map(|(v, s)| (v / s) * (v / s))
        .sum();
    (sum / values.len() as f64).sqrt()
}

/// Jacobian approximation kept between steps.
#[derive(Debug, Clone)]
pub(crate) enum JacobianApprox {
    Diagonal(Vec<f64>),
    /// Row-major n×n.
    Dense { dim: usize, entries: Vec<f64> },
}

impl JacobianApprox {
    pub(crate) fn is_finite(&self) -> bool {
        match self {
            JacobianApprox::Diagonal(entries) | JacobianApprox::Dense { entries, .. } => {
                entries.iter().all(|v| v.is_finite())
            }
        }
    }
}

/// Factorised Newton iteration matrix M = I - c·J.
pub(crate) enum IterationMatrix {
    /// Diagonal entries of M.
    Diagonal(Vec<f64>),
    Dense(LU<f64, Dyn, Dyn>),
}

impl IterationMatrix {
    /// Builds and factors M. `None` when M is singular.
    pub(crate) fn factor(jacobian: &JacobianApprox, c: f64) -> Option<Self> {
        match jacobian {
            JacobianApprox::Diagonal(diag) => {
                let entries: Vec<f64> = diag.iter().map(|d| 1.0 - c * d).collect();
                if entries.iter().any(|m| m.abs() <= f64::EPSILON || !m.is_finite()) {
                    return None;
                }
                Some(IterationMatrix::Diagonal(entries))
            }
            JacobianApprox::Dense { dim, entries } => {
                let mut matrix = DMatrix::from_row_slice(*dim, *dim, entries);
                matrix *= -c;
                for i in 0..*dim {
                    matrix[(i, i)] += 1.0;
                }
                if matrix.iter().any(|v| !v.is_finite()) {
                    return None;
                }
                let lu = matrix.lu();
                if !lu.is_invertible() {
                    return None;
                }
                Some(IterationMatrix::Dense(lu))
            }
        }
    }

    /// Solves M x = rhs in place.
    pub(crate) fn solve(&self, rhs: &mut [f64]) -> bool {
        match self {
            IterationMatrix::Diagonal(entries) => {
                for (x, m) in rhs.iter_mut().zip(entries) {
                    *x /= m;
                }
                true
            }
            IterationMatrix::Dense(lu) => {
                let mut b = DVector::from_column_slice(rhs);
                if !lu.solve_mut(&mut b) {
                    return false;
                }
                rhs.copy_from_slice(b.as_slice());
                true
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::{rms_norm, try_zeros, IterationMatrix, JacobianApprox};

    #[test]
    fn rms_norm_scales_componentwise() {
        let norm = rms_norm(&[2.0, 4.0], &[2.0, 2.0]);
        assert!((norm - (2.5_f64).sqrt()).abs() < 1e-12);
        assert_eq!(rms_norm(&[], &[]), 0.0);
    }

    #[test]
    fn try_zeros_returns_requested_length() {
        let buffer = try_zeros(4).expect("small allocation");
        assert_eq!(buffer, vec![0.0; 4]);
    }

    #[test]
    fn diagonal_iteration_matrix_solves() {
        let jac = JacobianApprox::Diagonal(vec![-1.0, -3.0]);
        let m = IterationMatrix::factor(&jac, 0.5).expect("nonsingular");
        let mut rhs = [1.5, 2.5];
        assert!(m.solve(&mut rhs));
        assert!((rhs[0] - 1.0).abs() < 1e-12);
        assert!((rhs[1] - 1.0).abs() < 1e-12);
    }

    #[test]
    fn diagonal_iteration_matrix_rejects_singular() {
        let jac = JacobianApprox::Diagonal(vec![2.0]);
        assert!(IterationMatrix::factor(&jac, 0.5).is_none());
    }

    #[test]
    fn non_finite_jacobian_is_detected() {
        assert!(JacobianApprox::Diagonal(vec![1.0, -2.0]).is_finite());
        let jac = JacobianApprox::Dense {
            dim: 2,
            entries: vec![0.0, f64::NAN, 1.0, 0.0],
        };
        assert!(!jac.is_finite());
    }

    #[test]
    fn dense_iteration_matrix_solves_coupled_system() {
        // J = [[0, 1], [-1, 0]], c = 1 -> M = [[1, -1], [1, 1]]
        let jac = JacobianApprox::Dense {
            dim: 2,
            entries: vec![0.0, 1.0, -1.0, 0.0],
        };
        let m = IterationMatrix::factor(&jac, 1.0).expect("nonsingular");
        let mut rhs = [0.0, 2.0];
        assert!(m.solve(&mut rhs));
        assert!((rhs[0] - 1.0).abs() < 1e-12);
        assert!((rhs[1] - 1.0).abs() < 1e-12);
    }
}
