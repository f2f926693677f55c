//! Continuous-time LQR via the Hamiltonian matrix sign function.
//!
//! The stabilizing solution `P` of `AᵀP + PA - PBR⁻¹BᵀP + Q = 0` spans the
//! stable invariant subspace `[I; P]` of the Hamiltonian
//!
//! ```text
//! H = [  A   -BR⁻¹Bᵀ ]
//!     [ -Q     -Aᵀ   ]
//! ```
//!
//! `W = sign(H)` is computed with the determinant-scaled Newton iteration
//! `Z ← (cZ + (cZ)⁻¹)/2`, after which `P` solves the overdetermined system
//! `[W₁₂; W₂₂ + I]·P = -[W₁₁ + I; W₂₁]` in the least-squares sense.

use nalgebra::DMatrix;

use crate::types::DynamicsError;

const MAX_SIGN_ITERATIONS: usize = 100;
const SIGN_TOLERANCE: f64 = 1e-10;
const SVD_EPS: f64 = 1e-14;

/// Solve the continuous algebraic Riccati equation for its stabilizing root.
pub fn solve_care(
    a: &DMatrix<f64>,
    b: &DMatrix<f64>,
    q: &DMatrix<f64>,
    r: &DMatrix<f64>,
) -> Result<DMatrix<f64>, DynamicsError> {
    let n = a.nrows();
    let m = b.ncols();
    if a.ncols() != n || b.nrows() != n || q.shape() != (n, n) || r.shape() != (m, m) {
        return Err(DynamicsError::Riccati(format!(
            "inconsistent shapes: A {:?}, B {:?}, Q {:?}, R {:?}",
            a.shape(),
            b.shape(),
            q.shape(),
            r.shape()
        )));
    }

    let r_inv = r
        .clone()
        .try_inverse()
        .ok_or_else(|| DynamicsError::Riccati("input cost R is singular".to_string()))?;
    let s = b * r_inv * b.transpose();

    let mut z = DMatrix::<f64>::zeros(2 * n, 2 * n);
    z.view_mut((0, 0), (n, n)).copy_from(a);
    z.view_mut((0, n), (n, n)).copy_from(&(-s));
    z.view_mut((n, 0), (n, n)).copy_from(&(-q));
    z.view_mut((n, n), (n, n)).copy_from(&(-a.transpose()));

    let mut converged = false;
    for iteration in 0..MAX_SIGN_ITERATIONS {
        let z_inv = z.clone().try_inverse().ok_or_else(|| {
            DynamicsError::Riccati("Hamiltonian has eigenvalues on the imaginary axis".to_string())
        })?;
        let det = z.determinant().abs();
        let c = if det.is_finite() && det > 0.0 {
            det.powf(-1.0 / (2 * n) as f64)
        } else {
            1.0
        };
        let next = (&z * c + z_inv / c) * 0.5;
        let delta = (&next - &z).norm() / next.norm().max(1.0);
        z = next;
        if delta < SIGN_TOLERANCE {
            tracing::debug!(iterations = iteration + 1, n, "matrix sign iteration converged");
            converged = true;
            break;
        }
    }
    if !converged {
        return Err(DynamicsError::Riccati(format!(
            "matrix sign iteration did not converge in {MAX_SIGN_ITERATIONS} steps"
        )));
    }

    let identity = DMatrix::<f64>::identity(n, n);
    let mut lhs = DMatrix::<f64>::zeros(2 * n, n);
    lhs.view_mut((0, 0), (n, n)).copy_from(&z.view((0, n), (n, n)));
    lhs.view_mut((n, 0), (n, n))
        .copy_from(&(z.view((n, n), (n, n)) + &identity));
    let mut rhs = DMatrix::<f64>::zeros(2 * n, n);
    rhs.view_mut((0, 0), (n, n))
        .copy_from(&(-(z.view((0, 0), (n, n)) + &identity)));
    rhs.view_mut((n, 0), (n, n))
        .copy_from(&(-z.view((n, 0), (n, n)).clone_owned()));

    let p = lhs
        .svd(true, true)
        .solve(&rhs, SVD_EPS)
        .map_err(|e| DynamicsError::Riccati(e.to_string()))?;
    let p = (&p + p.transpose()) * 0.5;

    if p.iter().any(|v| !v.is_finite()) {
        return Err(DynamicsError::Riccati("non-finite Riccati solution".to_string()));
    }
    Ok(p)
}

/// LQR feedback gain `K = R⁻¹BᵀP` for `u = -Kx`.
pub fn lqr(
    a: &DMatrix<f64>,
    b: &DMatrix<f64>,
    q: &DMatrix<f64>,
    r: &DMatrix<f64>,
) -> Result<DMatrix<f64>, DynamicsError> {
    let p = solve_care(a, b, q, r)?;
    let r_inv = r
        .clone()
        .try_inverse()
        .ok_or_else(|| DynamicsError::Riccati("input cost R is singular".to_string()))?;
    Ok(r_inv * b.transpose() * p)
}
