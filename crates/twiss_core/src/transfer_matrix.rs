//! Finite-difference estimation of the 6x6 transfer matrix.

use nalgebra::{Matrix6, Vector6};

use crate::bundle::{FiniteDiffSteps, ProbeBundle};
use crate::error::{Result, TwissError};
use crate::state::PhaseSpaceState;
use crate::tracker::{ElementRange, TrackConfig, Tracker};

fn canonical_coordinates(part: &PhaseSpaceState) -> Vector6<f64> {
    Vector6::new(part.x, part.px, part.y, part.py, part.zeta, part.pzeta())
}

/// Computes the one-turn (or partial) transfer matrix at `orbit` by
/// centered finite differences on a probe bundle.
///
/// The result is valid only together with the orbit and range it was
/// estimated at, is deterministic given identical inputs, and is not
/// symplectic in general when the line models radiation. Probe loss is a
/// fatal failure of this operation; there is no retry.
pub fn one_turn_matrix<T: Tracker + ?Sized>(
    tracker: &T,
    orbit: &PhaseSpaceState,
    range: ElementRange,
    steps: &FiniteDiffSteps,
    config: &TrackConfig,
) -> Result<Matrix6<f64>> {
    let mut bundle = ProbeBundle::with_coordinate_steps(orbit, steps)?;
    // The canonical longitudinal divisor comes from the untracked delta
    // probe pair.
    let dpzeta = bundle.pzeta_step();
    tracker.track(bundle.states_mut(), range, config);

    let divisors = [steps.dx, steps.dpx, steps.dy, steps.dpy, steps.dzeta, dpzeta];
    let mut result = Matrix6::zeros();
    for j in 0..6 {
        let plus = bundle.plus(j);
        let minus = bundle.minus(j);
        if !plus.is_alive() {
            return Err(TwissError::ParticleLoss { probe: 1 + j });
        }
        if !minus.is_alive() {
            return Err(TwissError::ParticleLoss { probe: 7 + j });
        }
        let column =
            (canonical_coordinates(plus) - canonical_coordinates(minus)) / (2.0 * divisors[j]);
        result.set_column(j, &column);
    }
    Ok(result)
}

#[cfg(test)]
mod tests {
    use super::one_turn_matrix;
    use crate::bundle::FiniteDiffSteps;
    use crate::line::{Element, SimpleLine};
    use crate::state::PhaseSpaceState;
    use crate::tracker::{ElementRange, TrackConfig, Tracker};
    use nalgebra::Matrix6;

    const PROTON_MASS: f64 = 938.272_088_16e6;

    #[test]
    fn recovers_the_linear_block_of_a_fodo_cell() {
        let (f, l) = (0.25, 2.0);
        let mut line = SimpleLine::new();
        line.append("qf", Element::ThinQuad { k1l: f });
        line.append("d1", Element::Drift { length: l });
        line.append("qd", Element::ThinQuad { k1l: -f });
        line.append("d2", Element::Drift { length: l });

        let orbit = PhaseSpaceState::reference(PROTON_MASS, 450e9);
        let r = one_turn_matrix(
            &line,
            &orbit,
            ElementRange::full_line(line.element_count()),
            &FiniteDiffSteps::default(),
            &TrackConfig::default(),
        )
        .unwrap();

        // Thin-lens FODO: M = D(l) QD D(l) QF acting on (x, px).
        let quad = |k: f64| nalgebra::Matrix2::new(1.0, 0.0, -k, 1.0);
        let drift = nalgebra::Matrix2::new(1.0, l, 0.0, 1.0);
        let expected = drift * quad(-f) * drift * quad(f);
        for i in 0..2 {
            for j in 0..2 {
                assert!((r[(i, j)] - expected[(i, j)]).abs() < 1e-8);
            }
        }
    }

    #[test]
    fn is_identity_for_an_empty_range() {
        let mut line = SimpleLine::new();
        line.append("d1", Element::Drift { length: 1.0 });
        let orbit = PhaseSpaceState::reference(PROTON_MASS, 450e9);
        let r = one_turn_matrix(
            &line,
            &orbit,
            ElementRange::new(0, 0),
            &FiniteDiffSteps::default(),
            &TrackConfig::default(),
        )
        .unwrap();
        assert!((r - Matrix6::identity()).norm() < 1e-9);
    }
}
