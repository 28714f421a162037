//! Element-by-element propagation of the optics functions.
//!
//! Twelve probes are launched around the closed orbit, shifted along the
//! columns of the W matrix, and the local W matrix is rebuilt at every
//! element boundary from centered differences of the recorded trajectories.
//! Lattice functions are then extracted per row after renormalizing each
//! eigenplane to unit action and rotating it to the Courant-Snyder phase
//! convention.

use std::f64::consts::PI;

use nalgebra::Matrix6;
use num_complex::Complex;

use crate::bundle::ProbeBundle;
use crate::error::{Result, TwissError};
use crate::normal_form::symplectic_form;
use crate::state::PhaseSpaceState;
use crate::tracker::{ElementRange, TrackConfig, Tracker};

/// Sigma fraction used to scale the eigenvector probes.
pub const DEFAULT_R_SIGMA: f64 = 0.01;

/// Default normalized emittance assumed for probe scaling.
pub const DEFAULT_NEMITT: f64 = 1e-6;

/// Default momentum offset for dispersion probes.
pub const DEFAULT_DELTA_DISP: f64 = 1e-5;

/// Probe amplitude: the smallest of the two transverse sigma fractions
/// and the dispersion momentum offset.
pub fn eigen_scale(
    orbit: &PhaseSpaceState,
    nemitt_x: f64,
    nemitt_y: f64,
    r_sigma: f64,
    delta_disp: f64,
) -> f64 {
    let gemitt_x = nemitt_x / orbit.beta0 / orbit.gamma0;
    let gemitt_y = nemitt_y / orbit.beta0 / orbit.gamma0;
    let scale_x = gemitt_x.sqrt() * r_sigma;
    let scale_y = gemitt_y.sqrt() * r_sigma;
    scale_x.min(scale_y).min(delta_disp)
}

/// Closed-orbit coordinates and local W matrix at every recorded row.
/// The final row corresponds to the exit boundary of the range and carries
/// the name `_end_point`.
#[derive(Debug, Clone)]
pub struct PropagatedOptics {
    pub name: Vec<String>,
    pub s: Vec<f64>,
    pub x: Vec<f64>,
    pub px: Vec<f64>,
    pub y: Vec<f64>,
    pub py: Vec<f64>,
    pub zeta: Vec<f64>,
    pub delta: Vec<f64>,
    pub ptau: Vec<f64>,
    pub w: Vec<Matrix6<f64>>,
    /// Path-length slippage per unit momentum offset, zeroed at the first
    /// row. Its end value divided by the length gives the slip factor.
    pub dzeta: Vec<f64>,
    /// Worst probe state per row; below one marks a loss on that row.
    pub state: Vec<i64>,
}

/// Tracks the probe bundle through the range and rebuilds the W matrix at
/// every element boundary.
pub fn propagate_optics<T: Tracker + ?Sized>(
    tracker: &T,
    orbit: &PhaseSpaceState,
    w_start: &Matrix6<f64>,
    range: ElementRange,
    scale_eigen: f64,
    config: &TrackConfig,
    continue_on_loss: bool,
) -> Result<PropagatedOptics> {
    let mut bundle = ProbeBundle::with_eigen_scale(orbit, w_start, scale_eigen)?;
    let trajectories = tracker.track_recorded(bundle.states_mut(), range, config);

    if !continue_on_loss {
        for (probe, trajectory) in trajectories.probes.iter().enumerate() {
            if trajectory.iter().any(|part| !part.is_alive()) {
                return Err(TwissError::ParticleLoss { probe });
            }
        }
    }

    let rows = trajectories.row_count();
    let mut name = Vec::with_capacity(rows);
    for index in range.start..range.stop {
        name.push(tracker.element_name(index).to_string());
    }
    name.push("_end_point".to_string());

    let mut out = PropagatedOptics {
        name,
        s: trajectories.s.clone(),
        x: Vec::with_capacity(rows),
        px: Vec::with_capacity(rows),
        y: Vec::with_capacity(rows),
        py: Vec::with_capacity(rows),
        zeta: Vec::with_capacity(rows),
        delta: Vec::with_capacity(rows),
        ptau: Vec::with_capacity(rows),
        w: Vec::with_capacity(rows),
        dzeta: Vec::with_capacity(rows),
        state: Vec::with_capacity(rows),
    };

    for row in 0..rows {
        let co = &trajectories.probes[0][row];
        let worst = trajectories
            .probes
            .iter()
            .map(|trajectory| trajectory[row].state)
            .min()
            .unwrap_or(crate::state::STATE_LOST);
        out.state.push(worst);
        out.x.push(co.x);
        out.px.push(co.px);
        out.y.push(co.y);
        out.py.push(co.py);
        out.zeta.push(co.zeta);
        out.delta.push(co.delta);
        out.ptau.push(co.ptau());

        let mut w = Matrix6::zeros();
        for j in 0..6 {
            let plus = &trajectories.probes[1 + j][row];
            let minus = &trajectories.probes[7 + j][row];
            let half = 0.5 / scale_eigen;
            w[(0, j)] = ((plus.x - co.x) - (minus.x - co.x)) * half;
            w[(1, j)] = ((plus.px - co.px) - (minus.px - co.px)) * half;
            w[(2, j)] = ((plus.y - co.y) - (minus.y - co.y)) * half;
            w[(3, j)] = ((plus.py - co.py) - (minus.py - co.py)) * half;
            w[(4, j)] = ((plus.zeta - co.zeta) - (minus.zeta - co.zeta)) * half;
            w[(5, j)] =
                ((plus.ptau() - co.ptau()) - (minus.ptau() - co.ptau())) * half / co.beta0;
        }
        out.w.push(w);

        let plus = &trajectories.probes[6][row];
        let minus = &trajectories.probes[12][row];
        let d_delta = (plus.delta - co.delta) - (minus.delta - co.delta);
        let d_zeta = (plus.zeta - co.zeta) - (minus.zeta - co.zeta);
        out.dzeta.push(if d_delta != 0.0 { d_zeta / d_delta } else { 0.0 });
    }

    let dzeta0 = out.dzeta[0];
    for value in &mut out.dzeta {
        *value -= dzeta0;
    }

    Ok(out)
}

/// Per-row lattice functions extracted from the propagated W matrices.
/// `w` holds the renormalized, Courant-Snyder-rotated matrices.
#[derive(Debug, Clone)]
pub struct LatticeFunctions {
    pub betx: Vec<f64>,
    pub bety: Vec<f64>,
    pub alfx: Vec<f64>,
    pub alfy: Vec<f64>,
    pub gamx: Vec<f64>,
    pub gamy: Vec<f64>,
    pub dx: Vec<f64>,
    pub dpx: Vec<f64>,
    pub dy: Vec<f64>,
    pub dpy: Vec<f64>,
    pub dx_zeta: Vec<f64>,
    pub dy_zeta: Vec<f64>,
    pub betx1: Vec<f64>,
    pub bety1: Vec<f64>,
    pub betx2: Vec<f64>,
    pub bety2: Vec<f64>,
    pub mux: Vec<f64>,
    pub muy: Vec<f64>,
    pub muzeta: Vec<f64>,
    pub nux: Vec<f64>,
    pub nuy: Vec<f64>,
    pub nuzeta: Vec<f64>,
    pub w: Vec<Matrix6<f64>>,
    /// Rows inside thin groups whose values are placeholders; used by the
    /// orchestrator to blank them on request.
    pub i_replace: Vec<usize>,
}

/// Rows belonging to the interior of a zero-length group, paired with the
/// row whose values they should mirror. The last row is always kept.
pub fn thin_group_indices(s: &[f64]) -> (Vec<usize>, Vec<usize>) {
    let n = s.len();
    let mut i_take = vec![0usize];
    for ii in 1..n {
        if s[ii] > s[ii - 1] {
            let last = i_take.len() - 1;
            i_take[last] = ii - 1;
            i_take.push(ii);
        } else {
            let last = i_take[i_take.len() - 1];
            i_take.push(last);
        }
    }
    let mut i_replace = Vec::new();
    let mut i_replace_with = Vec::new();
    for (ii, &take) in i_take.iter().enumerate() {
        if ii != take && ii != n - 1 {
            i_replace.push(ii);
            i_replace_with.push(take);
        }
    }
    (i_replace, i_replace_with)
}

fn unwrap_phases(phases: &[f64]) -> Vec<f64> {
    let mut out = Vec::with_capacity(phases.len());
    let mut offset = 0.0;
    for (i, &phi) in phases.iter().enumerate() {
        if i > 0 {
            let mut diff = phi - phases[i - 1];
            while diff > PI {
                diff -= 2.0 * PI;
                offset -= 2.0 * PI;
            }
            while diff <= -PI {
                diff += 2.0 * PI;
                offset += 2.0 * PI;
            }
        }
        out.push(phi + offset);
    }
    out
}

/// Unit-action magnitude of one eigenplane of `w`, `sqrt(|Re v . S Im v|)`.
fn plane_action(w: &Matrix6<f64>, plane: usize) -> f64 {
    let s = symplectic_form();
    let mut action = 0.0;
    for i in 0..6 {
        for j in 0..6 {
            if s[(i, j)] != 0.0 {
                action += w[(i, 2 * plane)] * s[(i, j)] * w[(j, 2 * plane + 1)];
            }
        }
    }
    action.abs().sqrt()
}

fn rotate_plane(w: &mut Matrix6<f64>, plane: usize, phase: f64) {
    let rot = Complex::new(0.0, -phase).exp();
    for i in 0..6 {
        let v = Complex::new(w[(i, 2 * plane)], w[(i, 2 * plane + 1)]) * rot;
        w[(i, 2 * plane)] = v.re;
        w[(i, 2 * plane + 1)] = v.im;
    }
}

/// Forest's generalized-inverse extraction, used when radiation makes the
/// W matrices non-symplectic. Returns
/// `(betx, alfx, gamx, bety, alfy, gamy, bety1, betx2)` for one row.
fn extract_with_inverse(w: &Matrix6<f64>) -> Result<[f64; 8]> {
    let s = symplectic_form();
    let w_inv = w.try_inverse().ok_or(TwissError::Degenerate {
        context: "inverting a propagated W matrix",
    })?;

    let mut ee = [Matrix6::zeros(); 2];
    for (plane, slot) in ee.iter_mut().enumerate() {
        let mut projector = Matrix6::zeros();
        projector[(2 * plane, 2 * plane)] = 1.0;
        projector[(2 * plane + 1, 2 * plane + 1)] = 1.0;
        *slot = -(w * s * projector * w_inv * s);
    }

    let mut betx = ee[0][(0, 0)];
    let mut alfx = -ee[0][(0, 1)];
    let mut gamx = ee[0][(1, 1)];
    let mut bety = ee[1][(2, 2)];
    let mut alfy = -ee[1][(2, 3)];
    let mut gamy = ee[1][(3, 3)];
    let bety1 = ee[0][(2, 2)].abs();
    let betx2 = ee[1][(0, 0)].abs();

    let sign_x = betx.signum();
    let sign_y = bety.signum();
    betx *= sign_x;
    alfx *= sign_x;
    gamx *= sign_x;
    bety *= sign_y;
    alfy *= sign_y;
    gamy *= sign_y;

    Ok([betx, alfx, gamx, bety, alfy, gamy, bety1, betx2])
}

/// Extracts the lattice functions from the propagated W matrices.
///
/// Each eigenplane is first renormalized to unit action (the `nu` columns
/// record the pre-normalization magnitudes) and rotated to the
/// Courant-Snyder convention. Phases are unwrapped after mirroring the
/// thin-group interior rows, so that zero-length stacks do not corrupt the
/// cumulative phase advance.
pub fn compute_lattice_functions(
    mut ws: Vec<Matrix6<f64>>,
    s: &[f64],
    use_full_inverse: bool,
) -> Result<LatticeFunctions> {
    let rows = ws.len();
    let (i_replace, i_replace_with) = thin_group_indices(s);

    let mut nux = Vec::with_capacity(rows);
    let mut nuy = Vec::with_capacity(rows);
    let mut nuzeta = Vec::with_capacity(rows);
    for w in &mut ws {
        let actions = [plane_action(w, 0), plane_action(w, 1), plane_action(w, 2)];
        for (plane, &action) in actions.iter().enumerate() {
            if action <= f64::EPSILON {
                return Err(TwissError::Degenerate {
                    context: "renormalizing a propagated eigenplane",
                });
            }
            for i in 0..6 {
                w[(i, 2 * plane)] /= action;
                w[(i, 2 * plane + 1)] /= action;
            }
        }
        nux.push(actions[0]);
        nuy.push(actions[1]);
        nuzeta.push(actions[2]);
    }

    let mut phix = Vec::with_capacity(rows);
    let mut phiy = Vec::with_capacity(rows);
    let mut phizeta = Vec::with_capacity(rows);
    for w in &mut ws {
        let px = w[(0, 1)].atan2(w[(0, 0)]);
        let py = w[(2, 3)].atan2(w[(2, 2)]);
        let pz = w[(4, 5)].atan2(w[(4, 4)]);
        rotate_plane(w, 0, px);
        rotate_plane(w, 1, py);
        rotate_plane(w, 2, pz);
        phix.push(px);
        phiy.push(py);
        phizeta.push(pz);
    }

    let mut out = LatticeFunctions {
        betx: Vec::with_capacity(rows),
        bety: Vec::with_capacity(rows),
        alfx: Vec::with_capacity(rows),
        alfy: Vec::with_capacity(rows),
        gamx: Vec::with_capacity(rows),
        gamy: Vec::with_capacity(rows),
        dx: Vec::with_capacity(rows),
        dpx: Vec::with_capacity(rows),
        dy: Vec::with_capacity(rows),
        dpy: Vec::with_capacity(rows),
        dx_zeta: Vec::with_capacity(rows),
        dy_zeta: Vec::with_capacity(rows),
        betx1: Vec::with_capacity(rows),
        bety1: Vec::with_capacity(rows),
        betx2: Vec::with_capacity(rows),
        bety2: Vec::with_capacity(rows),
        mux: Vec::new(),
        muy: Vec::new(),
        muzeta: Vec::new(),
        nux,
        nuy,
        nuzeta,
        w: Vec::new(),
        i_replace: i_replace.clone(),
    };

    for w in &ws {
        let [betx, alfx, gamx, bety, alfy, gamy, bety1, betx2] = if use_full_inverse {
            extract_with_inverse(w)?
        } else {
            [
                w[(0, 0)].powi(2) + w[(0, 1)].powi(2),
                -w[(0, 0)] * w[(1, 0)] - w[(0, 1)] * w[(1, 1)],
                w[(1, 0)].powi(2) + w[(1, 1)].powi(2),
                w[(2, 2)].powi(2) + w[(2, 3)].powi(2),
                -w[(2, 2)] * w[(3, 2)] - w[(2, 3)] * w[(3, 3)],
                w[(3, 2)].powi(2) + w[(3, 3)].powi(2),
                w[(2, 0)].powi(2) + w[(2, 1)].powi(2),
                w[(0, 2)].powi(2) + w[(0, 3)].powi(2),
            ]
        };
        out.betx.push(betx);
        out.alfx.push(alfx);
        out.gamx.push(gamx);
        out.bety.push(bety);
        out.alfy.push(alfy);
        out.gamy.push(gamy);
        out.betx1.push(betx);
        out.bety1.push(bety1);
        out.betx2.push(betx2);
        out.bety2.push(bety);

        // Dispersion as derivatives with respect to pzeta at fixed zeta, and
        // crab dispersion with respect to zeta at fixed pzeta.
        let det_zeta = w[(4, 4)] - w[(4, 5)] * w[(5, 4)] / w[(5, 5)];
        out.dx_zeta
            .push((w[(0, 4)] - w[(0, 5)] * w[(5, 4)] / w[(5, 5)]) / det_zeta);
        out.dy_zeta
            .push((w[(2, 4)] - w[(2, 5)] * w[(5, 4)] / w[(5, 5)]) / det_zeta);
        let det_pzeta = w[(5, 5)] - w[(5, 4)] * w[(4, 5)] / w[(4, 4)];
        out.dx
            .push((w[(0, 5)] - w[(0, 4)] * w[(4, 5)] / w[(4, 4)]) / det_pzeta);
        out.dpx
            .push((w[(1, 5)] - w[(1, 4)] * w[(4, 5)] / w[(4, 4)]) / det_pzeta);
        out.dy
            .push((w[(2, 5)] - w[(2, 4)] * w[(4, 5)] / w[(4, 4)]) / det_pzeta);
        out.dpy
            .push((w[(3, 5)] - w[(3, 4)] * w[(4, 5)] / w[(4, 4)]) / det_pzeta);
    }

    let mut temp_phix = phix.clone();
    let mut temp_phiy = phiy.clone();
    for (&dst, &src) in i_replace.iter().zip(&i_replace_with) {
        temp_phix[dst] = temp_phix[src];
        temp_phiy[dst] = temp_phiy[src];
    }
    out.mux = unwrap_phases(&temp_phix)
        .into_iter()
        .map(|p| p / (2.0 * PI))
        .collect();
    out.muy = unwrap_phases(&temp_phiy)
        .into_iter()
        .map(|p| p / (2.0 * PI))
        .collect();
    out.muzeta = unwrap_phases(&phizeta)
        .into_iter()
        .map(|p| p / (2.0 * PI))
        .collect();
    for mu in [&mut out.mux, &mut out.muy, &mut out.muzeta] {
        let first = mu[0];
        for value in mu.iter_mut() {
            *value -= first;
        }
    }

    out.w = ws;
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::{
        compute_lattice_functions, eigen_scale, propagate_optics, thin_group_indices,
        unwrap_phases,
    };
    use crate::line::{Element, SimpleLine};
    use crate::state::PhaseSpaceState;
    use crate::tracker::{ElementRange, TrackConfig, Tracker};
    use nalgebra::Matrix6;
    use std::f64::consts::PI;

    const PROTON_MASS: f64 = 938.272_088_16e6;

    fn uncoupled_w(betx: f64, bety: f64, betz: f64) -> Matrix6<f64> {
        let mut w = Matrix6::zeros();
        for (plane, beta) in [betx, bety, betz].iter().enumerate() {
            w[(2 * plane, 2 * plane)] = beta.sqrt();
            w[(2 * plane + 1, 2 * plane + 1)] = 1.0 / beta.sqrt();
        }
        w
    }

    #[test]
    fn betx_grows_quadratically_in_a_drift() {
        let mut line = SimpleLine::new();
        line.append("d1", Element::Drift { length: 3.0 });
        line.append("end", Element::Marker);
        let orbit = PhaseSpaceState::reference(PROTON_MASS, 20e9);
        let w0 = uncoupled_w(5.0, 8.0, 900.0);
        let scale = eigen_scale(&orbit, 1e-6, 1e-6, 0.01, 1e-5);

        let optics = propagate_optics(
            &line,
            &orbit,
            &w0,
            ElementRange::full_line(line.element_count()),
            scale,
            &TrackConfig::default(),
            false,
        )
        .unwrap();
        let funcs = compute_lattice_functions(optics.w.clone(), &optics.s, false).unwrap();

        let expected = 5.0 + 3.0f64.powi(2) / 5.0;
        let end = funcs.betx.len() - 1;
        assert!((funcs.betx[0] - 5.0).abs() < 1e-7);
        assert!((funcs.betx[end] - expected).abs() < 1e-6);
        assert!((funcs.bety[end] - (8.0 + 9.0 / 8.0)).abs() < 1e-6);
        let expected_mux = (3.0f64 / 5.0).atan() / (2.0 * PI);
        assert!((funcs.mux[end] - expected_mux).abs() < 1e-8);
    }

    #[test]
    fn dzeta_slope_of_a_drift_matches_the_kinematic_slip() {
        let mut line = SimpleLine::new();
        line.append("d1", Element::Drift { length: 10.0 });
        line.append("end", Element::Marker);
        let orbit = PhaseSpaceState::reference(PROTON_MASS, 2e9);
        let w0 = uncoupled_w(5.0, 8.0, 900.0);
        let scale = eigen_scale(&orbit, 1e-6, 1e-6, 0.01, 1e-5);

        let optics = propagate_optics(
            &line,
            &orbit,
            &w0,
            ElementRange::full_line(line.element_count()),
            scale,
            &TrackConfig::default(),
            false,
        )
        .unwrap();

        let expected = 10.0 / orbit.gamma0.powi(2);
        let end = optics.dzeta.len() - 1;
        assert!(optics.dzeta[0] == 0.0);
        assert!((optics.dzeta[end] - expected).abs() / expected < 1e-4);
    }

    #[test]
    fn thin_group_interior_rows_are_replaced() {
        let s = [0.0, 1.0, 1.0, 1.0, 2.0];
        let (i_replace, i_replace_with) = thin_group_indices(&s);
        assert_eq!(i_replace, vec![2]);
        assert_eq!(i_replace_with, vec![1]);
    }

    #[test]
    fn last_row_is_never_replaced() {
        let s = [0.0, 1.0, 1.0];
        let (i_replace, _) = thin_group_indices(&s);
        assert!(!i_replace.contains(&2));
    }

    #[test]
    fn unwrap_removes_phase_jumps() {
        let phases = [0.1, 2.8, -2.9, -0.3];
        let unwrapped = unwrap_phases(&phases);
        assert!((unwrapped[2] - (2.0 * PI - 2.9)).abs() < 1e-12);
        for pair in unwrapped.windows(2) {
            assert!((pair[1] - pair[0]).abs() < PI);
        }
    }

    #[test]
    fn full_inverse_extraction_matches_the_direct_formulas() {
        let mut line = SimpleLine::new();
        line.append("d1", Element::Drift { length: 2.0 });
        line.append("qf", Element::ThinQuad { k1l: 0.3 });
        line.append("d2", Element::Drift { length: 2.0 });
        line.append("end", Element::Marker);
        let orbit = PhaseSpaceState::reference(PROTON_MASS, 20e9);
        let w0 = uncoupled_w(5.0, 8.0, 900.0);
        let scale = eigen_scale(&orbit, 1e-6, 1e-6, 0.01, 1e-5);

        let optics = propagate_optics(
            &line,
            &orbit,
            &w0,
            ElementRange::full_line(line.element_count()),
            scale,
            &TrackConfig::default(),
            false,
        )
        .unwrap();

        let direct = compute_lattice_functions(optics.w.clone(), &optics.s, false).unwrap();
        let inverse = compute_lattice_functions(optics.w.clone(), &optics.s, true).unwrap();
        for row in 0..direct.betx.len() {
            assert!((direct.betx[row] - inverse.betx[row]).abs() < 1e-8);
            assert!((direct.alfy[row] - inverse.alfy[row]).abs() < 1e-8);
            assert!((direct.gamx[row] - inverse.gamx[row]).abs() < 1e-8);
        }
    }
}
