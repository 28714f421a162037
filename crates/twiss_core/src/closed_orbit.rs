//! Fixed-point search for the closed orbit of a one-turn or partial map.
//!
//! The residual maps a six-vector to the difference between itself and its
//! image under the transport map; a damped Newton iteration with a centered
//! finite-difference Jacobian drives it to zero. In 4D modes the
//! longitudinal residual components are replaced by pinning conditions.

use nalgebra::{Matrix6, Vector6};
use serde::{Deserialize, Serialize};

use crate::bundle::{FiniteDiffSteps, ProbeBundle};
use crate::error::{Result, TwissError};
use crate::state::PhaseSpaceState;
use crate::tracker::{ElementRange, TrackConfig, Tracker};

/// Component-wise absolute tolerances under which an initial guess is
/// accepted without running the solver. The `zeta` component is looser.
pub const DEFAULT_CO_SEARCH_TOL: [f64; 6] = [1e-11, 1e-11, 1e-11, 1e-11, 1e-5, 1e-11];

/// Offsets added to the guess for the single retry after a failed search.
const SECOND_ATTEMPT_SHIFT: [f64; 6] = [1e-5, 1e-7, 1e-5, 1e-7, 1e-4, 1e-5];

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct CoSearchSettings {
    /// Relative tolerance on successive iterates.
    pub tolerance: f64,
    pub max_iterations: usize,
    pub damping: f64,
}

impl Default for CoSearchSettings {
    fn default() -> Self {
        Self {
            tolerance: 1e-6,
            max_iterations: 100,
            damping: 1.0,
        }
    }
}

/// Outcome record of a closed-orbit search, kept on the result table so
/// that best-effort continuations stay inspectable.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct CoSearchInfo {
    pub converged: bool,
    pub iterations: usize,
    pub residual_norm: f64,
    /// True when the initial guess already satisfied the absolute
    /// tolerance vector and no solve was run.
    pub accepted_guess: bool,
}

struct ResidualMap<'a, T: Tracker + ?Sized> {
    tracker: &'a T,
    template: PhaseSpaceState,
    range: ElementRange,
    config: &'a TrackConfig,
    delta0: Option<f64>,
    zeta0: Option<f64>,
    /// Pin values for the components whose residual the pinning modes
    /// would otherwise leave identically zero (and the Newton system
    /// singular).
    free_zeta: f64,
    free_delta: f64,
}

impl<T: Tracker + ?Sized> ResidualMap<'_, T> {
    fn pinned(&self, input: &[f64; 6], mut residual: Vector6<f64>) -> Vector6<f64> {
        if let Some(delta0) = self.delta0 {
            residual[5] = input[5] - delta0;
            if self.zeta0.is_none() {
                residual[4] = input[4] - self.free_zeta;
            }
        }
        if let Some(zeta0) = self.zeta0 {
            residual[4] = input[4] - zeta0;
            if self.delta0.is_none() {
                residual[5] = input[5] - self.free_delta;
            }
        }
        residual
    }

    fn evaluate(&self, coords: &[f64; 6]) -> Result<Vector6<f64>> {
        let mut part = self.template;
        part.set_coordinates(*coords);
        let mut states = [part];
        self.tracker.track(&mut states, self.range, self.config);
        if !states[0].is_alive() {
            return Err(TwissError::ParticleLoss { probe: 0 });
        }
        let out = states[0].coordinates();
        let raw = Vector6::from_iterator((0..6).map(|i| coords[i] - out[i]));
        Ok(self.pinned(coords, raw))
    }

    /// Centered finite-difference Jacobian of the residual, with all probe
    /// maps evaluated in a single tracking call.
    fn jacobian(&self, coords: &[f64; 6]) -> Result<Matrix6<f64>> {
        let steps = FiniteDiffSteps::default();
        let mut part = self.template;
        part.set_coordinates(*coords);
        let mut bundle = ProbeBundle::with_coordinate_steps(&part, &steps)?;
        let inputs: Vec<[f64; 6]> = bundle.states().iter().map(|s| s.coordinates()).collect();
        self.tracker
            .track(bundle.states_mut(), self.range, self.config);

        let mut jac = Matrix6::zeros();
        let divisors = [steps.dx, steps.dpx, steps.dy, steps.dpy, steps.dzeta, steps.ddelta];
        for j in 0..6 {
            for (slot, probe) in [(1 + j, bundle.plus(j)), (7 + j, bundle.minus(j))] {
                if !probe.is_alive() {
                    return Err(TwissError::ParticleLoss { probe: slot });
                }
            }
            let res_plus = {
                let out = bundle.plus(j).coordinates();
                let raw =
                    Vector6::from_iterator((0..6).map(|i| inputs[1 + j][i] - out[i]));
                self.pinned(&inputs[1 + j], raw)
            };
            let res_minus = {
                let out = bundle.minus(j).coordinates();
                let raw =
                    Vector6::from_iterator((0..6).map(|i| inputs[7 + j][i] - out[i]));
                self.pinned(&inputs[7 + j], raw)
            };
            jac.set_column(j, &((res_plus - res_minus) / (2.0 * divisors[j])));
        }
        Ok(jac)
    }
}

/// Solves for the fixed point of the map over `range`, starting from
/// `guess`. `delta0`/`zeta0` pin the momentum or path-length plane for 4D
/// computations. With `continue_on_error` the best available point is
/// returned with `converged = false` instead of raising.
#[allow(clippy::too_many_arguments)]
pub fn find_closed_orbit<T: Tracker + ?Sized>(
    tracker: &T,
    guess: &PhaseSpaceState,
    range: ElementRange,
    delta0: Option<f64>,
    zeta0: Option<f64>,
    settings: &CoSearchSettings,
    config: &TrackConfig,
    continue_on_error: bool,
) -> Result<(PhaseSpaceState, CoSearchInfo)> {
    if !(settings.tolerance > 0.0) {
        return Err(TwissError::Configuration(
            "closed-orbit tolerance must be positive".into(),
        ));
    }
    if settings.max_iterations == 0 {
        return Err(TwissError::Configuration(
            "closed-orbit max_iterations must be greater than zero".into(),
        ));
    }
    if !(settings.damping > 0.0) {
        return Err(TwissError::Configuration(
            "closed-orbit damping must be positive".into(),
        ));
    }

    let map = ResidualMap {
        tracker,
        template: *guess,
        range,
        config,
        delta0,
        zeta0,
        free_zeta: guess.zeta,
        free_delta: guess.delta,
    };

    let mut base = guess.coordinates();
    if let Some(delta0) = delta0 {
        base[5] = delta0;
    }
    if let Some(zeta0) = zeta0 {
        base[4] = zeta0;
    }

    let mut total_iterations = 0usize;
    let mut best = base;
    let mut best_norm = f64::INFINITY;

    for attempt in 0..2 {
        let mut coords = base;
        if attempt > 0 {
            for (c, shift) in coords.iter_mut().zip(SECOND_ATTEMPT_SHIFT) {
                *c += shift;
            }
        }

        let mut residual = map.evaluate(&coords)?;
        if residual
            .iter()
            .zip(DEFAULT_CO_SEARCH_TOL)
            .all(|(r, tol)| r.abs() < tol)
        {
            let mut solved = *guess;
            solved.set_coordinates(coords);
            let info = CoSearchInfo {
                converged: true,
                iterations: total_iterations,
                residual_norm: residual.norm(),
                accepted_guess: true,
            };
            return Ok((solved, info));
        }

        let mut converged = false;
        for _ in 0..settings.max_iterations {
            let jacobian = map.jacobian(&coords)?;
            let step = match jacobian.lu().solve(&residual) {
                Some(step) => step,
                None => break,
            };
            let position = Vector6::from_row_slice(&coords);
            for i in 0..6 {
                coords[i] -= settings.damping * step[i];
            }
            total_iterations += 1;
            residual = map.evaluate(&coords)?;
            if step.norm() <= settings.tolerance * (1.0 + position.norm()) {
                converged = true;
                break;
            }
        }

        let norm = residual.norm();
        if norm < best_norm {
            best_norm = norm;
            best = coords;
        }
        if converged {
            let mut solved = *guess;
            solved.set_coordinates(coords);
            let info = CoSearchInfo {
                converged: true,
                iterations: total_iterations,
                residual_norm: norm,
                accepted_guess: false,
            };
            return Ok((solved, info));
        }
    }

    if !continue_on_error {
        return Err(TwissError::ClosedOrbitSearch {
            iterations: total_iterations,
            residual_norm: best_norm,
        });
    }

    let mut solved = *guess;
    solved.set_coordinates(best);
    let info = CoSearchInfo {
        converged: false,
        iterations: total_iterations,
        residual_norm: best_norm,
        accepted_guess: false,
    };
    Ok((solved, info))
}

#[cfg(test)]
mod tests {
    use super::{find_closed_orbit, CoSearchSettings, DEFAULT_CO_SEARCH_TOL};
    use crate::line::{Element, SimpleLine};
    use crate::state::PhaseSpaceState;
    use crate::tracker::{ElementRange, TrackConfig, Tracker};

    const PROTON_MASS: f64 = 938.272_088_16e6;

    fn kicked_cell(dpx: f64) -> SimpleLine {
        let mut line = SimpleLine::new();
        line.append("qf", Element::ThinQuad { k1l: 0.4 });
        line.append("d1", Element::Drift { length: 2.0 });
        line.append("hk", Element::Kick { dpx, dpy: 0.0 });
        line.append("qd", Element::ThinQuad { k1l: -0.4 });
        line.append("d2", Element::Drift { length: 2.0 });
        line
    }

    #[test]
    fn unkicked_cell_accepts_zero_guess() {
        let line = kicked_cell(0.0);
        let guess = PhaseSpaceState::reference(PROTON_MASS, 450e9);
        let (orbit, info) = find_closed_orbit(
            &line,
            &guess,
            ElementRange::full_line(line.element_count()),
            Some(0.0),
            None,
            &CoSearchSettings::default(),
            &TrackConfig {
                freeze_energy: true,
                ..TrackConfig::default()
            },
            false,
        )
        .unwrap();
        assert!(info.accepted_guess);
        assert_eq!(orbit.x, 0.0);
    }

    #[test]
    fn kicked_cell_returns_nonzero_orbit_with_small_residual() {
        let line = kicked_cell(1e-5);
        let guess = PhaseSpaceState::reference(PROTON_MASS, 450e9);
        let range = ElementRange::full_line(line.element_count());
        let config = TrackConfig {
            freeze_energy: true,
            ..TrackConfig::default()
        };
        let (orbit, info) = find_closed_orbit(
            &line,
            &guess,
            range,
            Some(0.0),
            None,
            &CoSearchSettings::default(),
            &config,
            false,
        )
        .unwrap();
        assert!(info.converged);
        assert!(orbit.x.abs() > 1e-7);

        // One-turn residual must satisfy the absolute tolerance vector.
        let mut states = [orbit];
        line.track(&mut states, range, &config);
        let before = orbit.coordinates();
        let after = states[0].coordinates();
        for i in 0..4 {
            assert!((before[i] - after[i]).abs() < DEFAULT_CO_SEARCH_TOL[i]);
        }
    }

    #[test]
    fn invalid_settings_are_rejected_before_numeric_work() {
        let line = kicked_cell(0.0);
        let guess = PhaseSpaceState::reference(PROTON_MASS, 450e9);
        let settings = CoSearchSettings {
            tolerance: 0.0,
            ..CoSearchSettings::default()
        };
        let err = find_closed_orbit(
            &line,
            &guess,
            ElementRange::full_line(line.element_count()),
            None,
            None,
            &settings,
            &TrackConfig::default(),
            false,
        )
        .unwrap_err();
        assert!(format!("{err}").contains("tolerance"));
    }
}
