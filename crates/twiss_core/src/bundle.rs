use nalgebra::Matrix6;
use serde::{Deserialize, Serialize};

use crate::error::{Result, TwissError};
use crate::state::PhaseSpaceState;

/// Number of probes in a bundle: one reference plus a plus/minus pair for
/// each of the six phase-space directions.
pub const PROBE_COUNT: usize = 13;

/// Per-coordinate steps for finite-difference transfer-matrix estimation.
/// The longitudinal momentum step is specified through `ddelta`; the
/// canonical `pzeta` step is derived from the resulting `ptau` pair.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct FiniteDiffSteps {
    pub dx: f64,
    pub dpx: f64,
    pub dy: f64,
    pub dpy: f64,
    pub dzeta: f64,
    pub ddelta: f64,
}

impl Default for FiniteDiffSteps {
    fn default() -> Self {
        Self {
            dx: 1e-6,
            dpx: 1e-7,
            dy: 1e-6,
            dpy: 1e-7,
            dzeta: 1e-6,
            ddelta: 1e-6,
        }
    }
}

impl FiniteDiffSteps {
    fn as_array(&self) -> [f64; 6] {
        [
            self.dx, self.dpx, self.dy, self.dpy, self.dzeta, self.ddelta,
        ]
    }

    fn validate(&self) -> Result<()> {
        if self.as_array().iter().any(|&d| !(d > 0.0)) {
            return Err(TwissError::Configuration(
                "finite-difference steps must be strictly positive".into(),
            ));
        }
        Ok(())
    }
}

/// A canonical set of 13 probe particles around a reference state.
///
/// Index 0 is the reference copy, indices 1..=6 carry a positive step along
/// phase-space direction `index - 1`, indices 7..=12 the matching negative
/// step. The builder validates shape only; physical plausibility of the
/// steps is the caller's concern.
#[derive(Debug, Clone)]
pub struct ProbeBundle {
    states: [PhaseSpaceState; PROBE_COUNT],
}

impl ProbeBundle {
    /// Bundle with raw per-coordinate steps, shifting `delta` directly in
    /// the longitudinal direction. Used for transfer-matrix estimation.
    pub fn with_coordinate_steps(
        center: &PhaseSpaceState,
        steps: &FiniteDiffSteps,
    ) -> Result<Self> {
        steps.validate()?;
        let arr = steps.as_array();
        let mut states = [*center; PROBE_COUNT];
        for (j, &step) in arr.iter().enumerate() {
            for (slot, sign) in [(1 + j, 1.0), (7 + j, -1.0)] {
                let part = &mut states[slot];
                match j {
                    0 => part.x += sign * step,
                    1 => part.px += sign * step,
                    2 => part.y += sign * step,
                    3 => part.py += sign * step,
                    4 => part.zeta += sign * step,
                    _ => part.delta += sign * step,
                }
            }
        }
        Ok(Self { states })
    }

    /// Bundle shifted along the columns of a W matrix, scaled by `scale`,
    /// in the canonical coordinates `(x, px, y, py, zeta, pzeta)`. Used by
    /// the element-by-element propagator.
    pub fn with_eigen_scale(
        center: &PhaseSpaceState,
        w: &Matrix6<f64>,
        scale: f64,
    ) -> Result<Self> {
        if !(scale > 0.0) {
            return Err(TwissError::Configuration(
                "eigenvector scale must be strictly positive".into(),
            ));
        }
        let mut states = [*center; PROBE_COUNT];
        for j in 0..6 {
            let column = w.column(j);
            let offsets = [
                column[0], column[1], column[2], column[3], column[4], column[5],
            ];
            states[1 + j] = center.shifted_canonical(offsets.map(|o| o * scale));
            states[7 + j] = center.shifted_canonical(offsets.map(|o| o * -scale));
        }
        Ok(Self { states })
    }

    /// The canonical `pzeta` step implied by the delta probe pair, the
    /// divisor for the sixth transfer-matrix column.
    pub fn pzeta_step(&self) -> f64 {
        (self.states[6].ptau() - self.states[12].ptau()) / (2.0 * self.states[0].beta0)
    }

    pub fn states(&self) -> &[PhaseSpaceState; PROBE_COUNT] {
        &self.states
    }

    pub fn states_mut(&mut self) -> &mut [PhaseSpaceState; PROBE_COUNT] {
        &mut self.states
    }

    pub fn center(&self) -> &PhaseSpaceState {
        &self.states[0]
    }

    pub fn plus(&self, direction: usize) -> &PhaseSpaceState {
        &self.states[1 + direction]
    }

    pub fn minus(&self, direction: usize) -> &PhaseSpaceState {
        &self.states[7 + direction]
    }
}

#[cfg(test)]
mod tests {
    use super::{FiniteDiffSteps, ProbeBundle, PROBE_COUNT};
    use crate::state::PhaseSpaceState;
    use nalgebra::Matrix6;

    const PROTON_MASS: f64 = 938.272_088_16e6;

    #[test]
    fn coordinate_bundle_has_symmetric_steps() {
        let center = PhaseSpaceState::reference(PROTON_MASS, 450e9);
        let bundle =
            ProbeBundle::with_coordinate_steps(&center, &FiniteDiffSteps::default()).unwrap();
        assert_eq!(bundle.states().len(), PROBE_COUNT);
        assert_eq!(*bundle.center(), center);
        assert_eq!(bundle.plus(0).x, 1e-6);
        assert_eq!(bundle.minus(0).x, -1e-6);
        assert_eq!(bundle.plus(5).delta, 1e-6);
        assert_eq!(bundle.minus(5).delta, -1e-6);
    }

    #[test]
    fn rejects_non_positive_steps() {
        let center = PhaseSpaceState::reference(PROTON_MASS, 450e9);
        let steps = FiniteDiffSteps {
            dx: 0.0,
            ..FiniteDiffSteps::default()
        };
        assert!(ProbeBundle::with_coordinate_steps(&center, &steps).is_err());
    }

    #[test]
    fn eigen_bundle_shifts_along_w_columns() {
        let center = PhaseSpaceState::reference(PROTON_MASS, 450e9);
        let mut w = Matrix6::identity();
        w[(0, 0)] = 2.0;
        let bundle = ProbeBundle::with_eigen_scale(&center, &w, 1e-5).unwrap();
        assert!((bundle.plus(0).x - 2e-5).abs() < 1e-18);
        assert!((bundle.minus(0).x + 2e-5).abs() < 1e-18);
        // The pzeta direction maps onto delta through the reference frame.
        assert!(bundle.plus(5).delta > 0.0);
        assert!(bundle.minus(5).delta < 0.0);
    }
}
