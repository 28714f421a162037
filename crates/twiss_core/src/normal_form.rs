//! Symplectic normal-form decomposition of a transfer matrix.
//!
//! The transfer matrix is diagonalized into three (or, in 4D mode, two)
//! complex eigenplanes; the real W matrix built column-wise from their
//! real and imaginary parts maps normalized coordinates to physical phase
//! space. Eigenvectors are rescaled to unit symplectic action, which keeps
//! the parametrization meaningful when radiation damping breaks exact
//! symplecticity, and rotated to the Courant-Snyder phase convention.

use std::f64::consts::PI;

use nalgebra::linalg::SVD;
use nalgebra::{Complex, DMatrix, DVector, Matrix2, Matrix4, Matrix6, Vector4};

use crate::error::{Result, TwissError};

/// Default tolerance band around the unit circle for eigenvalue moduli.
pub const DEFAULT_STABILITY_TOL: f64 = 2e-3;

/// Default minimum departure of a diagonal 2x2 block from the identity.
pub const DEFAULT_RESPONSIVENESS_TOL: f64 = 1e-12;

/// The 6x6 symplectic form S, block-diagonal antisymmetric.
pub fn symplectic_form() -> Matrix6<f64> {
    let mut s = Matrix6::zeros();
    for p in 0..3 {
        s[(2 * p, 2 * p + 1)] = 1.0;
        s[(2 * p + 1, 2 * p)] = -1.0;
    }
    s
}

fn symplectic_form_dyn(dim: usize) -> DMatrix<f64> {
    let mut s = DMatrix::zeros(dim, dim);
    for p in 0..dim / 2 {
        s[(2 * p, 2 * p + 1)] = 1.0;
        s[(2 * p + 1, 2 * p)] = -1.0;
    }
    s
}

/// 2x2 rotation by `phi`.
pub fn rot2d(phi: f64) -> Matrix2<f64> {
    Matrix2::new(phi.cos(), phi.sin(), -phi.sin(), phi.cos())
}

/// Projects the matrix onto the nearest symplectic matrix via the Cayley
/// transform (Healy's method). Returns the input unchanged when either
/// intermediate inverse does not exist.
pub fn healy_symplectify(m: &Matrix6<f64>) -> Matrix6<f64> {
    let s = symplectic_form();
    let identity = Matrix6::identity();
    if let Some(inv) = (identity + m).try_inverse() {
        let v = s * (identity - m) * inv;
        let w = (v + v.transpose()) * 0.5;
        if let Some(inv2) = (identity - s * w).try_inverse() {
            return (identity + s * w) * inv2;
        }
    }
    *m
}

/// Result of the normal-form decomposition. `eigenvalues` and `tunes` are
/// indexed by plane (x, y, zeta); in 4D mode the longitudinal entries are
/// the trivial `1` and `0`.
#[derive(Debug, Clone)]
pub struct NormalForm {
    pub w: Matrix6<f64>,
    pub eigenvalues: [Complex<f64>; 3],
    pub tunes: [f64; 3],
}

type EigenPair = (Complex<f64>, DVector<Complex<f64>>);

/// Eigenvalues and eigenvectors of a real matrix; each eigenvector is
/// recovered from the SVD null space of the shifted complex matrix.
fn eigenpairs(matrix: &DMatrix<f64>) -> Result<Vec<EigenPair>> {
    let dim = matrix.nrows();
    let eigenvalues = matrix.complex_eigenvalues();
    let complex_matrix = matrix.map(|v| Complex::new(v, 0.0));

    let mut pairs = Vec::with_capacity(dim);
    for idx in 0..dim {
        let lambda = eigenvalues[idx];

        let mut shifted = complex_matrix.clone();
        for i in 0..dim {
            shifted[(i, i)] -= lambda;
        }

        let svd = SVD::new(shifted, true, true);
        let v_t = svd.v_t.ok_or(TwissError::Degenerate {
            context: "extracting eigenvectors of the transfer matrix",
        })?;
        let row_index = v_t.nrows().saturating_sub(1);
        let mut vector: DVector<Complex<f64>> = v_t.row(row_index).adjoint();
        let norm = vector.norm();
        if norm > 0.0 {
            vector /= Complex::new(norm, 0.0);
        }
        pairs.push((lambda, vector));
    }
    Ok(pairs)
}

/// Groups the eigenpairs into complex-conjugate pairs and assigns one
/// representative (the `Im >= 0` branch) per plane, chosen by the
/// dominant components of its eigenvector.
fn representatives_by_plane(pairs: Vec<EigenPair>, planes: usize) -> Result<Vec<EigenPair>> {
    let dim = pairs.len();
    let mut used = vec![false; dim];
    let mut reps: Vec<EigenPair> = Vec::with_capacity(planes);

    for i in 0..dim {
        if used[i] {
            continue;
        }
        used[i] = true;
        let mut partner = None;
        let mut best = f64::INFINITY;
        for (j, pair) in pairs.iter().enumerate() {
            if used[j] {
                continue;
            }
            let dist = (pair.0 - pairs[i].0.conj()).norm();
            if dist < best {
                best = dist;
                partner = Some(j);
            }
        }
        if let Some(j) = partner {
            used[j] = true;
            if pairs[j].0.im > pairs[i].0.im {
                reps.push(pairs[j].clone());
                continue;
            }
        }
        reps.push(pairs[i].clone());
    }

    if reps.len() < planes {
        return Err(TwissError::Degenerate {
            context: "pairing conjugate eigenplanes",
        });
    }

    let mut assigned: Vec<Option<EigenPair>> = vec![None; planes];
    let mut taken = vec![false; reps.len()];
    for plane in 0..planes {
        let mut best = None;
        let mut best_weight = -1.0;
        for (k, rep) in reps.iter().enumerate() {
            if taken[k] {
                continue;
            }
            let weight = rep.1[2 * plane].norm_sqr() + rep.1[2 * plane + 1].norm_sqr();
            if weight > best_weight {
                best_weight = weight;
                best = Some(k);
            }
        }
        let k = best.ok_or(TwissError::Degenerate {
            context: "assigning eigenplanes",
        })?;
        taken[k] = true;
        assigned[plane] = Some(reps[k].clone());
    }

    Ok(assigned.into_iter().flatten().collect())
}

/// Rescales the eigenvector to unit symplectic action `a' S b = 1`,
/// conjugating the pair first if the action is negative.
fn normalize_symplectic(pair: &mut EigenPair, s: &DMatrix<f64>) -> Result<()> {
    let action = |v: &DVector<Complex<f64>>| -> f64 {
        let a = v.map(|c| c.re);
        let b = v.map(|c| c.im);
        (a.transpose() * s * b)[(0, 0)]
    };
    let mut act = action(&pair.1);
    if act < 0.0 {
        pair.1 = pair.1.map(|c| c.conj());
        pair.0 = pair.0.conj();
        act = -act;
    }
    if act <= f64::EPSILON {
        return Err(TwissError::Degenerate {
            context: "normalizing an eigenplane to unit action",
        });
    }
    let scale = Complex::new(1.0 / act.sqrt(), 0.0);
    pair.1 *= scale;
    Ok(())
}

/// Rotates the eigenvector so that the Courant-Snyder angle of its leading
/// in-plane component vanishes.
fn rotate_courant_snyder(pair: &mut EigenPair, plane: usize) {
    let lead = pair.1[2 * plane];
    let phase = lead.im.atan2(lead.re);
    let rot = Complex::new(0.0, -phase).exp();
    pair.1 *= rot;
}

fn fractional_tune(lambda: Complex<f64>) -> f64 {
    let mut tune = lambda.im.atan2(lambda.re) / (2.0 * PI);
    if tune < 0.0 {
        tune += 1.0;
    }
    tune
}

fn check_responsiveness(r: &Matrix6<f64>, planes: usize, tol: f64) -> Result<()> {
    for plane in 0..planes {
        let block = r.fixed_view::<2, 2>(2 * plane, 2 * plane);
        let response = (block - Matrix2::identity()).abs().max();
        if response < tol {
            return Err(TwissError::MatrixResponsiveness {
                plane,
                response,
                tol,
            });
        }
    }
    Ok(())
}

fn check_stability(matrix: &DMatrix<f64>, tol: f64) -> Result<()> {
    for lambda in matrix.complex_eigenvalues().iter() {
        let modulus = lambda.norm();
        if (modulus - 1.0).abs() > tol {
            return Err(TwissError::MatrixStability { modulus, tol });
        }
    }
    Ok(())
}

/// Decomposes the transfer matrix into its normal form.
///
/// With `only_4d` the longitudinal plane is excluded from the eigenproblem
/// and the corresponding W block is rebuilt analytically from the
/// dispersion of the in-plane 4x4 block, which avoids the ill-conditioned
/// 6D eigenproblem of a frozen-energy line. Tolerances of `None` skip the
/// corresponding check; a too-permissive or too-strict tolerance is the
/// caller's responsibility.
pub fn compute_normal_form(
    r: &Matrix6<f64>,
    only_4d: bool,
    symplectify: bool,
    responsiveness_tol: Option<f64>,
    stability_tol: Option<f64>,
) -> Result<NormalForm> {
    let planes = if only_4d { 2 } else { 3 };
    if let Some(tol) = responsiveness_tol {
        check_responsiveness(r, planes, tol)?;
    }

    let m = if symplectify {
        healy_symplectify(r)
    } else {
        *r
    };

    let dim = 2 * planes;
    let mut block = DMatrix::zeros(dim, dim);
    for i in 0..dim {
        for j in 0..dim {
            block[(i, j)] = m[(i, j)];
        }
    }

    if let Some(tol) = stability_tol {
        check_stability(&block, tol)?;
    }

    let s = symplectic_form_dyn(dim);
    let pairs = eigenpairs(&block)?;
    let mut reps = representatives_by_plane(pairs, planes)?;

    let mut w = Matrix6::zeros();
    let mut eigenvalues = [Complex::new(1.0, 0.0); 3];
    let mut tunes = [0.0f64; 3];
    for (plane, rep) in reps.iter_mut().enumerate() {
        normalize_symplectic(rep, &s)?;
        rotate_courant_snyder(rep, plane);
        for i in 0..dim {
            w[(i, 2 * plane)] = rep.1[i].re;
            w[(i, 2 * plane + 1)] = rep.1[i].im;
        }
        eigenvalues[plane] = rep.0;
        tunes[plane] = fractional_tune(rep.0);
    }

    if only_4d {
        fill_longitudinal_dispersion_block(&mut w, &m)?;
    }

    Ok(NormalForm {
        w,
        eigenvalues,
        tunes,
    })
}

/// Overwrites the longitudinal block of W with the analytic dispersion and
/// crab-dispersion columns obtained from `(R4 - I) d = R[0..4, col]`.
fn fill_longitudinal_dispersion_block(w: &mut Matrix6<f64>, m: &Matrix6<f64>) -> Result<()> {
    let a: Matrix4<f64> = m.fixed_view::<4, 4>(0, 0).into_owned() - Matrix4::identity();
    let lu = a.lu();

    let b_disp = Vector4::new(m[(0, 5)], m[(1, 5)], m[(2, 5)], m[(3, 5)]);
    let disp = lu.solve(&b_disp).ok_or(TwissError::Degenerate {
        context: "solving the 4D dispersion block",
    })?;
    let b_crab = Vector4::new(m[(0, 4)], m[(1, 4)], m[(2, 4)], m[(3, 4)]);
    let crab = lu.solve(&b_crab).ok_or(TwissError::Degenerate {
        context: "solving the 4D crab-dispersion block",
    })?;

    for i in 0..6 {
        w[(4, i)] = 0.0;
        w[(5, i)] = 0.0;
        w[(i, 4)] = 0.0;
        w[(i, 5)] = 0.0;
    }
    w[(4, 4)] = 1.0;
    w[(5, 5)] = 1.0;
    for i in 0..4 {
        w[(i, 5)] = -disp[i];
        w[(i, 4)] = -crab[i];
    }
    Ok(())
}

/// One eigenvalue of the full matrix per plane, paired by the dominant
/// component of the eigenvector. Used for radiation damping constants,
/// where the moduli deviate from one and no stability check applies.
pub fn plane_eigenvalues(r: &Matrix6<f64>) -> Result<[Complex<f64>; 3]> {
    let block = DMatrix::from_fn(6, 6, |i, j| r[(i, j)]);
    let pairs = eigenpairs(&block)?;
    let reps = representatives_by_plane(pairs, 3)?;
    Ok([reps[0].0, reps[1].0, reps[2].0])
}

#[cfg(test)]
mod tests {
    use super::{
        compute_normal_form, healy_symplectify, plane_eigenvalues, rot2d, symplectic_form,
    };
    use nalgebra::Matrix6;
    use std::f64::consts::PI;

    /// Builds a one-turn matrix with prescribed betas and tunes via
    /// `W Rot W^-1`.
    fn toy_one_turn(betx: f64, bety: f64, betz: f64, qx: f64, qy: f64, qs: f64) -> Matrix6<f64> {
        let mut w = Matrix6::zeros();
        for (plane, beta) in [betx, bety, betz].iter().enumerate() {
            w[(2 * plane, 2 * plane)] = beta.sqrt();
            w[(2 * plane + 1, 2 * plane + 1)] = 1.0 / beta.sqrt();
        }
        let mut rot = Matrix6::zeros();
        for (plane, q) in [qx, qy, qs].iter().enumerate() {
            let r = rot2d(2.0 * PI * q);
            rot.fixed_view_mut::<2, 2>(2 * plane, 2 * plane)
                .copy_from(&r);
        }
        w * rot * w.try_inverse().unwrap()
    }

    #[test]
    fn recovers_betas_and_tunes_of_a_rotation_model() {
        let r = toy_one_turn(12.5, 3.2, 800.0, 0.31, 0.27, 0.006);
        let nf = compute_normal_form(&r, false, false, Some(1e-12), Some(2e-3)).unwrap();
        let betx = nf.w[(0, 0)].powi(2) + nf.w[(0, 1)].powi(2);
        let bety = nf.w[(2, 2)].powi(2) + nf.w[(2, 3)].powi(2);
        assert!((betx - 12.5).abs() < 1e-8);
        assert!((bety - 3.2).abs() < 1e-8);
        assert!((nf.tunes[0] - 0.31).abs() < 1e-10);
        assert!((nf.tunes[1] - 0.27).abs() < 1e-10);
        assert!((nf.tunes[2] - 0.006).abs() < 1e-10);
    }

    #[test]
    fn w_matrix_preserves_the_symplectic_form() {
        let r = toy_one_turn(4.0, 9.0, 120.0, 0.18, 0.63, 0.01);
        let nf = compute_normal_form(&r, false, false, None, Some(2e-3)).unwrap();
        let s = symplectic_form();
        let residual = nf.w * s * nf.w.transpose() - s;
        assert!(residual.abs().max() < 1e-9);
    }

    #[test]
    fn unstable_matrix_is_rejected() {
        let mut r = toy_one_turn(4.0, 9.0, 120.0, 0.18, 0.63, 0.01);
        r[(0, 0)] *= 1.5;
        let err = compute_normal_form(&r, false, false, None, Some(2e-3)).unwrap_err();
        assert!(format!("{err}").contains("unstable"));
    }

    #[test]
    fn unresponsive_plane_is_rejected() {
        let r = Matrix6::identity();
        let err = compute_normal_form(&r, false, false, Some(1e-12), None).unwrap_err();
        assert!(format!("{err}").contains("unresponsive"));
    }

    #[test]
    fn symplectified_matrix_satisfies_the_symplectic_condition() {
        let mut r = toy_one_turn(4.0, 9.0, 120.0, 0.18, 0.63, 0.01);
        // Small non-symplectic perturbation, as left by finite differences.
        r[(0, 1)] += 1e-7;
        let m = healy_symplectify(&r);
        let s = symplectic_form();
        let residual = m.transpose() * s * m - s;
        assert!(residual.abs().max() < 1e-12);
        assert!((m - r).abs().max() < 1e-6);
    }

    #[test]
    fn four_d_mode_rebuilds_the_dispersion_block() {
        // Transverse rotations plus a dispersive coupling column.
        let mut r = toy_one_turn(4.0, 9.0, 1.0, 0.18, 0.63, 0.0);
        r.fixed_view_mut::<2, 2>(4, 4).copy_from(&nalgebra::Matrix2::identity());
        r[(0, 5)] = 1.7e-3;
        let nf = compute_normal_form(&r, true, false, None, None).unwrap();
        assert_eq!(nf.tunes[2], 0.0);
        assert_eq!(nf.w[(4, 4)], 1.0);
        assert_eq!(nf.w[(5, 5)], 1.0);
        // Dispersion dx = W[0,5]/W[5,5] solves (R4 - I) d = -R[0..4,5].
        assert!(nf.w[(0, 5)].abs() > 0.0);
    }

    #[test]
    fn plane_eigenvalues_follow_damping_moduli() {
        let r = toy_one_turn(4.0, 9.0, 120.0, 0.18, 0.63, 0.01) * 0.999;
        let lambdas = plane_eigenvalues(&r).unwrap();
        for lambda in lambdas {
            assert!((lambda.norm() - 0.999).abs() < 1e-9);
        }
    }
}
