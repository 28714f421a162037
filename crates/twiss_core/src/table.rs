//! Result types of the optics computation.
//!
//! [`TwissInit`] is the boundary condition of an open-line computation and
//! [`TwissTable`] the element-indexed result. Both are immutable once
//! produced; `reverse()` and row selection return derived values.

use std::f64::consts::PI;

use nalgebra::Matrix6;
use serde::{Deserialize, Serialize};

use crate::closed_orbit::CoSearchInfo;
use crate::error::{Result, TwissError};
use crate::normal_form::rot2d;
use crate::state::PhaseSpaceState;
use crate::tracker::RadiationMode;

/// Counting direction of the frame a table or init was computed in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ReferenceFrame {
    Proper,
    Reverse,
}

impl ReferenceFrame {
    pub fn flipped(self) -> Self {
        match self {
            ReferenceFrame::Proper => ReferenceFrame::Reverse,
            ReferenceFrame::Reverse => ReferenceFrame::Proper,
        }
    }
}

/// Whether the longitudinal plane took part in the solve.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TwissMethod {
    SixD,
    FourD,
}

/// Sign conventions applied when flipping a quantity between the proper
/// and the reversed frame. A reversed line is traversed against the
/// direction the elements were defined in, which flips the longitudinal
/// axis and mirrors the horizontal one; each entry below records the sign
/// a column picks up, and `W_ROW_SIGNS` the per-row signs of the W
/// matrices. This table is the single place where the convention lives.
pub struct FrameTransform;

impl FrameTransform {
    pub const X: f64 = -1.0;
    pub const PX: f64 = 1.0;
    pub const Y: f64 = 1.0;
    pub const PY: f64 = -1.0;
    pub const ZETA: f64 = -1.0;
    pub const DELTA: f64 = 1.0;
    pub const PTAU: f64 = 1.0;
    pub const ALF: f64 = -1.0;
    pub const DX: f64 = -1.0;
    pub const DPX: f64 = 1.0;
    pub const DY: f64 = 1.0;
    pub const DPY: f64 = -1.0;
    pub const DZETA: f64 = -1.0;
    pub const DX_ZETA: f64 = 1.0;
    pub const DY_ZETA: f64 = -1.0;
    pub const W_ROW_SIGNS: [f64; 6] = [-1.0, 1.0, 1.0, -1.0, -1.0, 1.0];

    /// Applies the frame flip to a closed-orbit state.
    pub fn flip_orbit(orbit: &PhaseSpaceState) -> PhaseSpaceState {
        let mut out = *orbit;
        out.x = Self::X * out.x;
        out.py = Self::PY * out.py;
        out.zeta = Self::ZETA * out.zeta;
        out
    }

    /// Applies the per-row signs to a W matrix.
    pub fn flip_w(w: &Matrix6<f64>) -> Matrix6<f64> {
        let mut out = *w;
        for (row, sign) in Self::W_ROW_SIGNS.iter().enumerate() {
            for col in 0..6 {
                out[(row, col)] *= sign;
            }
        }
        out
    }
}

/// Courant-Snyder boundary parameters for building a [`TwissInit`] without
/// a W matrix.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct CourantSnyderInit {
    pub betx: f64,
    pub alfx: f64,
    pub bety: f64,
    pub alfy: f64,
    pub bets: f64,
    pub dx: f64,
    pub dpx: f64,
    pub dy: f64,
    pub dpy: f64,
}

impl Default for CourantSnyderInit {
    fn default() -> Self {
        Self {
            betx: 1.0,
            alfx: 0.0,
            bety: 1.0,
            alfy: 0.0,
            bets: 1.0,
            dx: 0.0,
            dpx: 0.0,
            dy: 0.0,
            dpy: 0.0,
        }
    }
}

/// Boundary condition of an open-line computation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TwissInit {
    pub orbit: PhaseSpaceState,
    pub w: Matrix6<f64>,
    pub element_name: String,
    pub mux: f64,
    pub muy: f64,
    pub muzeta: f64,
    pub dzeta: f64,
    pub reference_frame: ReferenceFrame,
}

impl TwissInit {
    pub fn new(orbit: PhaseSpaceState, w: Matrix6<f64>, element_name: impl Into<String>) -> Self {
        Self {
            orbit,
            w,
            element_name: element_name.into(),
            mux: 0.0,
            muy: 0.0,
            muzeta: 0.0,
            dzeta: 0.0,
            reference_frame: ReferenceFrame::Proper,
        }
    }

    /// Builds the init from uncoupled Courant-Snyder parameters plus
    /// dispersion, via the closed-form symplectic W matrix.
    pub fn from_courant_snyder(
        orbit: PhaseSpaceState,
        element_name: impl Into<String>,
        cs: &CourantSnyderInit,
    ) -> Self {
        let mut base = Matrix6::zeros();
        base[(0, 0)] = cs.betx.sqrt();
        base[(1, 0)] = -cs.alfx / cs.betx.sqrt();
        base[(1, 1)] = 1.0 / cs.betx.sqrt();
        base[(2, 2)] = cs.bety.sqrt();
        base[(3, 2)] = -cs.alfy / cs.bety.sqrt();
        base[(3, 3)] = 1.0 / cs.bety.sqrt();
        let betz = cs.bets.abs();
        base[(4, 4)] = betz.sqrt();
        base[(5, 5)] = 1.0 / betz.sqrt();

        // Dispersion enters through the symplectic translation block
        // coupling the transverse planes to the longitudinal one.
        let mut coupling = Matrix6::identity();
        let d = [cs.dx, cs.dpx, cs.dy, cs.dpy];
        for (i, &di) in d.iter().enumerate() {
            coupling[(i, 5)] = di;
        }
        coupling[(4, 0)] = cs.dpx;
        coupling[(4, 1)] = -cs.dx;
        coupling[(4, 2)] = cs.dpy;
        coupling[(4, 3)] = -cs.dy;

        Self::new(orbit, coupling * base, element_name)
    }

    /// The same boundary condition expressed in the flipped frame, with
    /// the accumulated phases re-zeroed.
    pub fn reverse(&self) -> Self {
        Self {
            orbit: FrameTransform::flip_orbit(&self.orbit),
            w: FrameTransform::flip_w(&self.w),
            element_name: self.element_name.clone(),
            mux: 0.0,
            muy: 0.0,
            muzeta: 0.0,
            dzeta: 0.0,
            reference_frame: self.reference_frame.flipped(),
        }
    }
}

/// Per-turn radiation quantities, present when the caller asked for the
/// energy-loss and damping block.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct RadiationQuantities {
    /// Energy lost per turn, in eV.
    pub eneloss_turn: f64,
    pub damping_constants_turns: [f64; 3],
    pub damping_constants_s: [f64; 3],
    pub partition_numbers: [f64; 3],
}

/// Element-indexed optics table plus global scalars.
#[derive(Debug, Clone)]
pub struct TwissTable {
    pub name: Vec<String>,
    pub s: Vec<f64>,
    pub x: Vec<f64>,
    pub px: Vec<f64>,
    pub y: Vec<f64>,
    pub py: Vec<f64>,
    pub zeta: Vec<f64>,
    pub delta: Vec<f64>,
    pub ptau: Vec<f64>,
    pub state: Vec<i64>,
    pub betx: Vec<f64>,
    pub bety: Vec<f64>,
    pub alfx: Vec<f64>,
    pub alfy: Vec<f64>,
    pub gamx: Vec<f64>,
    pub gamy: Vec<f64>,
    pub betx1: Vec<f64>,
    pub bety1: Vec<f64>,
    pub betx2: Vec<f64>,
    pub bety2: Vec<f64>,
    pub dx: Vec<f64>,
    pub dpx: Vec<f64>,
    pub dy: Vec<f64>,
    pub dpy: Vec<f64>,
    pub dx_zeta: Vec<f64>,
    pub dy_zeta: Vec<f64>,
    pub mux: Vec<f64>,
    pub muy: Vec<f64>,
    pub muzeta: Vec<f64>,
    pub dzeta: Vec<f64>,
    pub nux: Vec<f64>,
    pub nuy: Vec<f64>,
    pub nuzeta: Vec<f64>,
    pub w: Vec<Matrix6<f64>>,
    /// Chromatic phase-advance derivatives, present when chromatic
    /// properties were computed.
    pub dmux: Option<Vec<f64>>,
    pub dmuy: Option<Vec<f64>>,

    pub qx: f64,
    pub qy: f64,
    pub qs: f64,
    pub dqx: Option<f64>,
    pub dqy: Option<f64>,
    pub slip_factor: f64,
    pub momentum_compaction_factor: f64,
    pub betz0: f64,
    pub circumference: f64,
    pub t_rev0: f64,
    pub c_minus: f64,
    pub c_r1_avg: f64,
    pub c_r2_avg: f64,
    pub radiation: Option<RadiationQuantities>,

    pub method: TwissMethod,
    pub radiation_method: RadiationMode,
    pub reference_frame: ReferenceFrame,
    pub particle_on_co: PhaseSpaceState,
    pub r_matrix: Option<Matrix6<f64>>,
    pub co_info: Option<CoSearchInfo>,
}

/// Beam sizes derived from the eigenplane outer products.
#[derive(Debug, Clone)]
pub struct BeamSizes {
    pub name: Vec<String>,
    pub s: Vec<f64>,
    /// Full second-moment matrix per row.
    pub sigma: Vec<Matrix6<f64>>,
    pub sigma_x: Vec<f64>,
    pub sigma_y: Vec<f64>,
}

impl TwissTable {
    pub fn row_count(&self) -> usize {
        self.s.len()
    }

    /// Index of the named row, if present.
    pub fn find_row(&self, name: &str) -> Option<usize> {
        self.name.iter().position(|n| n == name)
    }

    fn row_index(&self, name: &str) -> Result<usize> {
        self.find_row(name)
            .ok_or_else(|| TwissError::Configuration(format!("no element named '{name}'")))
    }

    /// Boundary condition extracted at the named row, suitable for seeding
    /// an open-line computation.
    pub fn get_twiss_init(&self, at_element: &str) -> Result<TwissInit> {
        let row = self.row_index(at_element)?;
        let mut orbit = self.particle_on_co;
        orbit.x = self.x[row];
        orbit.px = self.px[row];
        orbit.y = self.y[row];
        orbit.py = self.py[row];
        orbit.zeta = self.zeta[row];
        orbit.delta = self.delta[row];
        Ok(TwissInit {
            orbit,
            w: self.w[row],
            element_name: self.name[row].clone(),
            mux: self.mux[row],
            muy: self.muy[row],
            muzeta: self.muzeta[row],
            dzeta: self.dzeta[row],
            reference_frame: self.reference_frame,
        })
    }

    /// Transfer matrix between two rows, reconstructed from the local W
    /// matrices and the accumulated phase advances.
    pub fn get_r_matrix(&self, start: &str, stop: &str) -> Result<Matrix6<f64>> {
        let i_start = self.row_index(start)?;
        let i_stop = self.row_index(stop)?;
        if i_start > i_stop {
            return Err(TwissError::Configuration(format!(
                "'{start}' must not come after '{stop}'"
            )));
        }

        let phi_x = 2.0 * PI * (self.mux[i_stop] - self.mux[i_start]);
        let phi_y = 2.0 * PI * (self.muy[i_stop] - self.muy[i_start]);
        let phi_zeta = 2.0 * PI * (self.muzeta[i_stop] - self.muzeta[i_start]);

        let mut rot = Matrix6::zeros();
        rot.fixed_view_mut::<2, 2>(0, 0).copy_from(&rot2d(phi_x));
        rot.fixed_view_mut::<2, 2>(2, 2).copy_from(&rot2d(phi_y));
        rot.fixed_view_mut::<2, 2>(4, 4).copy_from(&rot2d(phi_zeta));

        let w_start_inv = self.w[i_start].try_inverse().ok_or(TwissError::Degenerate {
            context: "inverting the W matrix of the start row",
        })?;
        Ok(self.w[i_stop] * rot * w_start_inv)
    }

    /// Equilibrium beam-size matrices for the given normalized emittances.
    /// In 4D mode the longitudinal eigenplane does not contribute.
    pub fn beam_sizes(&self, nemitt_x: f64, nemitt_y: f64) -> BeamSizes {
        let gemitt_x = nemitt_x / (self.particle_on_co.beta0 * self.particle_on_co.gamma0);
        let gemitt_y = nemitt_y / (self.particle_on_co.beta0 * self.particle_on_co.gamma0);

        let rows = self.row_count();
        let mut sigma = Vec::with_capacity(rows);
        let mut sigma_x = Vec::with_capacity(rows);
        let mut sigma_y = Vec::with_capacity(rows);
        for row in 0..rows {
            let mut w = self.w[row];
            if self.method == TwissMethod::FourD {
                for i in 4..6 {
                    for j in 4..6 {
                        w[(i, j)] = 0.0;
                    }
                }
            }
            let mut total = Matrix6::zeros();
            for i in 0..6 {
                for j in 0..6 {
                    let plane_x = w[(i, 0)] * w[(j, 0)] + w[(i, 1)] * w[(j, 1)];
                    let plane_y = w[(i, 2)] * w[(j, 2)] + w[(i, 3)] * w[(j, 3)];
                    total[(i, j)] = gemitt_x * plane_x + gemitt_y * plane_y;
                }
            }
            sigma_x.push(total[(0, 0)].sqrt());
            sigma_y.push(total[(2, 2)].sqrt());
            sigma.push(total);
        }

        BeamSizes {
            name: self.name.clone(),
            s: self.s.clone(),
            sigma,
            sigma_x,
            sigma_y,
        }
    }

    /// A derived table holding only the requested rows, keeping global
    /// scalars. Row order follows `indices`.
    pub fn rows_at(&self, indices: &[usize]) -> TwissTable {
        let pick = |v: &Vec<f64>| indices.iter().map(|&i| v[i]).collect::<Vec<f64>>();
        TwissTable {
            name: indices.iter().map(|&i| self.name[i].clone()).collect(),
            s: pick(&self.s),
            x: pick(&self.x),
            px: pick(&self.px),
            y: pick(&self.y),
            py: pick(&self.py),
            zeta: pick(&self.zeta),
            delta: pick(&self.delta),
            ptau: pick(&self.ptau),
            state: indices.iter().map(|&i| self.state[i]).collect(),
            betx: pick(&self.betx),
            bety: pick(&self.bety),
            alfx: pick(&self.alfx),
            alfy: pick(&self.alfy),
            gamx: pick(&self.gamx),
            gamy: pick(&self.gamy),
            betx1: pick(&self.betx1),
            bety1: pick(&self.bety1),
            betx2: pick(&self.betx2),
            bety2: pick(&self.bety2),
            dx: pick(&self.dx),
            dpx: pick(&self.dpx),
            dy: pick(&self.dy),
            dpy: pick(&self.dpy),
            dx_zeta: pick(&self.dx_zeta),
            dy_zeta: pick(&self.dy_zeta),
            mux: pick(&self.mux),
            muy: pick(&self.muy),
            muzeta: pick(&self.muzeta),
            dzeta: pick(&self.dzeta),
            nux: pick(&self.nux),
            nuy: pick(&self.nuy),
            nuzeta: pick(&self.nuzeta),
            w: indices.iter().map(|&i| self.w[i]).collect(),
            dmux: self.dmux.as_ref().map(|v| pick(v)),
            dmuy: self.dmuy.as_ref().map(|v| pick(v)),
            ..self.clone_scalars()
        }
    }

    /// Rows selected by element name, in the order given.
    pub fn rows_named(&self, names: &[impl AsRef<str>]) -> Result<TwissTable> {
        let mut indices = Vec::with_capacity(names.len());
        for name in names {
            indices.push(self.row_index(name.as_ref())?);
        }
        Ok(self.rows_at(&indices))
    }

    fn clone_scalars(&self) -> TwissTable {
        TwissTable {
            name: Vec::new(),
            s: Vec::new(),
            x: Vec::new(),
            px: Vec::new(),
            y: Vec::new(),
            py: Vec::new(),
            zeta: Vec::new(),
            delta: Vec::new(),
            ptau: Vec::new(),
            state: Vec::new(),
            betx: Vec::new(),
            bety: Vec::new(),
            alfx: Vec::new(),
            alfy: Vec::new(),
            gamx: Vec::new(),
            gamy: Vec::new(),
            betx1: Vec::new(),
            bety1: Vec::new(),
            betx2: Vec::new(),
            bety2: Vec::new(),
            dx: Vec::new(),
            dpx: Vec::new(),
            dy: Vec::new(),
            dpy: Vec::new(),
            dx_zeta: Vec::new(),
            dy_zeta: Vec::new(),
            mux: Vec::new(),
            muy: Vec::new(),
            muzeta: Vec::new(),
            dzeta: Vec::new(),
            nux: Vec::new(),
            nuy: Vec::new(),
            nuzeta: Vec::new(),
            w: Vec::new(),
            dmux: None,
            dmuy: None,
            qx: self.qx,
            qy: self.qy,
            qs: self.qs,
            dqx: self.dqx,
            dqy: self.dqy,
            slip_factor: self.slip_factor,
            momentum_compaction_factor: self.momentum_compaction_factor,
            betz0: self.betz0,
            circumference: self.circumference,
            t_rev0: self.t_rev0,
            c_minus: self.c_minus,
            c_r1_avg: self.c_r1_avg,
            c_r2_avg: self.c_r2_avg,
            radiation: self.radiation,
            method: self.method,
            radiation_method: self.radiation_method,
            reference_frame: self.reference_frame,
            particle_on_co: self.particle_on_co,
            r_matrix: self.r_matrix,
            co_info: self.co_info,
        }
    }

    /// The same optics expressed in the flipped frame: rows reversed (the
    /// final boundary row stays last), `s` measured from the other end,
    /// signs applied per [`FrameTransform`], phases re-anchored at the new
    /// first row. The sub-range R matrix is frame-dependent and dropped.
    pub fn reverse(&self) -> TwissTable {
        let rev = |v: &[f64], sign: f64| -> Vec<f64> {
            v.iter().rev().map(|value| sign * value).collect()
        };
        let rezero_flip = |v: Vec<f64>| -> Vec<f64> {
            let first = v[0];
            v.into_iter().map(|value| first - value).collect()
        };

        let mut name: Vec<String> = self.name[..self.name.len() - 1]
            .iter()
            .rev()
            .cloned()
            .collect();
        name.push(self.name[self.name.len() - 1].clone());

        let mut out = TwissTable {
            name,
            s: self.s.iter().rev().map(|s| self.circumference - s).collect(),
            x: rev(&self.x, FrameTransform::X),
            px: rev(&self.px, FrameTransform::PX),
            y: rev(&self.y, FrameTransform::Y),
            py: rev(&self.py, FrameTransform::PY),
            zeta: rev(&self.zeta, FrameTransform::ZETA),
            delta: rev(&self.delta, FrameTransform::DELTA),
            ptau: rev(&self.ptau, FrameTransform::PTAU),
            state: self.state.iter().rev().copied().collect(),
            betx: rev(&self.betx, 1.0),
            bety: rev(&self.bety, 1.0),
            alfx: rev(&self.alfx, FrameTransform::ALF),
            alfy: rev(&self.alfy, FrameTransform::ALF),
            gamx: rev(&self.gamx, 1.0),
            gamy: rev(&self.gamy, 1.0),
            betx1: rev(&self.betx1, 1.0),
            bety1: rev(&self.bety1, 1.0),
            betx2: rev(&self.betx2, 1.0),
            bety2: rev(&self.bety2, 1.0),
            dx: rev(&self.dx, FrameTransform::DX),
            dpx: rev(&self.dpx, FrameTransform::DPX),
            dy: rev(&self.dy, FrameTransform::DY),
            dpy: rev(&self.dpy, FrameTransform::DPY),
            dx_zeta: rev(&self.dx_zeta, FrameTransform::DX_ZETA),
            dy_zeta: rev(&self.dy_zeta, FrameTransform::DY_ZETA),
            mux: rezero_flip(self.mux.iter().rev().copied().collect()),
            muy: rezero_flip(self.muy.iter().rev().copied().collect()),
            muzeta: rezero_flip(self.muzeta.iter().rev().copied().collect()),
            dzeta: rezero_flip(rev(&self.dzeta, FrameTransform::DZETA)),
            nux: rev(&self.nux, 1.0),
            nuy: rev(&self.nuy, 1.0),
            nuzeta: rev(&self.nuzeta, 1.0),
            w: self.w.iter().rev().map(FrameTransform::flip_w).collect(),
            dmux: self
                .dmux
                .as_ref()
                .map(|v| v.iter().rev().copied().collect()),
            dmuy: self
                .dmuy
                .as_ref()
                .map(|v| v.iter().rev().copied().collect()),
            ..self.clone_scalars()
        };

        out.particle_on_co = FrameTransform::flip_orbit(&self.particle_on_co);
        out.r_matrix = None;
        out.reference_frame = self.reference_frame.flipped();

        if self.method == TwissMethod::FourD {
            out.qs = 0.0;
            for value in &mut out.muzeta {
                *value = 0.0;
            }
        }

        out
    }
}

#[cfg(test)]
mod tests {
    use super::{CourantSnyderInit, ReferenceFrame, TwissInit};
    use crate::normal_form::symplectic_form;
    use crate::state::PhaseSpaceState;

    const PROTON_MASS: f64 = 938.272_088_16e6;

    #[test]
    fn courant_snyder_init_produces_a_symplectic_w() {
        let orbit = PhaseSpaceState::reference(PROTON_MASS, 20e9);
        let cs = CourantSnyderInit {
            betx: 1.5,
            alfx: -0.2,
            bety: 4.0,
            alfy: 0.7,
            bets: 600.0,
            dx: 1.2,
            dpx: 0.03,
            dy: 0.0,
            dpy: 0.0,
        };
        let init = TwissInit::from_courant_snyder(orbit, "ip1", &cs);
        let s = symplectic_form();
        let residual = init.w * s * init.w.transpose() - s;
        assert!(residual.abs().max() < 1e-12);
        // The implied lattice functions round-trip through the W columns.
        let betx = init.w[(0, 0)].powi(2) + init.w[(0, 1)].powi(2);
        assert!((betx - 1.5).abs() < 1e-12);
        let dx = init.w[(0, 5)] / init.w[(5, 5)];
        assert!((dx - 1.2).abs() < 1e-12);
    }

    #[test]
    fn double_reverse_restores_the_init() {
        let orbit = PhaseSpaceState {
            x: 1e-3,
            px: 2e-4,
            y: -3e-4,
            py: 5e-5,
            zeta: 0.01,
            delta: 1e-4,
            ..PhaseSpaceState::reference(PROTON_MASS, 20e9)
        };
        let init = TwissInit::from_courant_snyder(orbit, "mk", &CourantSnyderInit::default());
        let back = init.reverse().reverse();
        assert_eq!(back.reference_frame, ReferenceFrame::Proper);
        assert!((back.orbit.x - init.orbit.x).abs() < 1e-15);
        assert!((back.orbit.py - init.orbit.py).abs() < 1e-15);
        assert!((back.w - init.w).abs().max() < 1e-15);
    }
}
