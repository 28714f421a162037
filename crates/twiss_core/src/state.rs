use serde::{Deserialize, Serialize};

/// Speed of light in m/s.
pub const C_LIGHT: f64 = 299_792_458.0;

/// State flag value for a particle that is still being tracked.
pub const STATE_ALIVE: i64 = 1;

/// State flag value for a particle lost on an aperture.
pub const STATE_LOST: i64 = 0;

/// A single particle in 6D phase space, together with the reference-frame
/// quantities needed to convert between the momentum deviation `delta`,
/// the energy deviation `ptau` and the canonical `pzeta = ptau / beta0`.
///
/// States are ephemeral: every computation builds fresh copies around the
/// orbit it works on.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PhaseSpaceState {
    pub x: f64,
    pub px: f64,
    pub y: f64,
    pub py: f64,
    pub zeta: f64,
    pub delta: f64,
    /// Reference momentum times c, in eV.
    pub p0c: f64,
    /// Reference relativistic beta.
    pub beta0: f64,
    /// Reference relativistic gamma.
    pub gamma0: f64,
    /// Reference rest mass in eV.
    pub mass0: f64,
    /// 1 while alive, <= 0 once lost.
    pub state: i64,
}

impl PhaseSpaceState {
    /// Builds a reference particle (all coordinates zero) from the rest
    /// mass and the reference momentum, both in eV.
    pub fn reference(mass0: f64, p0c: f64) -> Self {
        let energy0 = (p0c * p0c + mass0 * mass0).sqrt();
        Self {
            x: 0.0,
            px: 0.0,
            y: 0.0,
            py: 0.0,
            zeta: 0.0,
            delta: 0.0,
            p0c,
            beta0: p0c / energy0,
            gamma0: energy0 / mass0,
            mass0,
            state: STATE_ALIVE,
        }
    }

    /// Reference energy in eV.
    pub fn energy0(&self) -> f64 {
        self.mass0 * self.gamma0
    }

    /// Energy deviation normalized to the reference momentum,
    /// `ptau = (E - E0) / p0c`.
    pub fn ptau(&self) -> f64 {
        let one_plus_delta = 1.0 + self.delta;
        let inv_beta0 = 1.0 / self.beta0;
        (one_plus_delta * one_plus_delta - 1.0 + inv_beta0 * inv_beta0).sqrt() - inv_beta0
    }

    /// Canonical longitudinal momentum, `pzeta = ptau / beta0`.
    pub fn pzeta(&self) -> f64 {
        self.ptau() / self.beta0
    }

    /// Sets `delta` so that the canonical longitudinal momentum takes the
    /// requested value.
    pub fn set_pzeta(&mut self, pzeta: f64) {
        let ptau = pzeta * self.beta0;
        self.delta = (ptau * ptau + 2.0 * ptau / self.beta0 + 1.0).sqrt() - 1.0;
    }

    /// Ratio `beta0 / beta` of the reference to the actual velocity.
    pub fn rvv_inverse(&self) -> f64 {
        (1.0 + self.beta0 * self.ptau()) / (1.0 + self.delta)
    }

    /// The six search-space coordinates `(x, px, y, py, zeta, delta)`.
    pub fn coordinates(&self) -> [f64; 6] {
        [self.x, self.px, self.y, self.py, self.zeta, self.delta]
    }

    pub fn set_coordinates(&mut self, coords: [f64; 6]) {
        self.x = coords[0];
        self.px = coords[1];
        self.y = coords[2];
        self.py = coords[3];
        self.zeta = coords[4];
        self.delta = coords[5];
    }

    /// Returns a copy shifted by the given offsets in the canonical
    /// coordinates `(x, px, y, py, zeta, pzeta)`.
    pub fn shifted_canonical(&self, offsets: [f64; 6]) -> Self {
        let mut out = *self;
        out.x += offsets[0];
        out.px += offsets[1];
        out.y += offsets[2];
        out.py += offsets[3];
        out.zeta += offsets[4];
        out.set_pzeta(self.pzeta() + offsets[5]);
        out
    }

    pub fn is_alive(&self) -> bool {
        self.state == STATE_ALIVE
    }
}

#[cfg(test)]
mod tests {
    use super::PhaseSpaceState;

    const PROTON_MASS: f64 = 938.272_088_16e6;

    #[test]
    fn reference_particle_has_consistent_relativistic_factors() {
        let part = PhaseSpaceState::reference(PROTON_MASS, 7e12);
        assert!((part.beta0 * part.gamma0 * PROTON_MASS - 7e12).abs() / 7e12 < 1e-12);
        assert!(part.beta0 < 1.0 && part.beta0 > 0.999);
        assert_eq!(part.ptau(), 0.0);
    }

    #[test]
    fn pzeta_round_trip_recovers_delta() {
        let mut part = PhaseSpaceState::reference(PROTON_MASS, 450e9);
        part.delta = 3e-4;
        let pzeta = part.pzeta();
        let mut other = PhaseSpaceState::reference(PROTON_MASS, 450e9);
        other.set_pzeta(pzeta);
        assert!((other.delta - 3e-4).abs() < 1e-15);
    }

    #[test]
    fn ptau_is_monotonic_in_delta() {
        let mut part = PhaseSpaceState::reference(PROTON_MASS, 26e9);
        part.delta = -1e-3;
        let lo = part.ptau();
        part.delta = 1e-3;
        let hi = part.ptau();
        assert!(hi > 0.0 && lo < 0.0);
    }
}
