//! A minimal thin-lens reference implementation of the [`Tracker`]
//! collaborator, sufficient for tests, demos and lattice studies with
//! drifts, thin multipoles, a linear RF kick and simple apertures.
//! Element-level physics beyond this set belongs to external trackers.

use serde::{Deserialize, Serialize};

use crate::error::{Result, TwissError};
use crate::state::{PhaseSpaceState, STATE_LOST};
use crate::tracker::{ElementRange, Splicable, TrackConfig, Tracker, Trajectories};

/// Thin-lens element set. All kicks are symplectic in the canonical
/// coordinates `(x, px, y, py, zeta, pzeta)`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub enum Element {
    Marker,
    /// Chromatic drift: transverse angles scale with `1/(1 + delta)` and
    /// the arrival time picks up the velocity mismatch through `rvv`.
    Drift { length: f64 },
    /// Thin quadrupole, integrated strength `k1l` in 1/m.
    ThinQuad { k1l: f64 },
    /// Thin dipole of bending angle `k0l`: dispersion kick plus the
    /// conjugate path-length term.
    ThinBend { k0l: f64 },
    /// Thin sextupole, integrated strength `k2l` in 1/m^2.
    ThinSextupole { k2l: f64 },
    /// Linearized RF cavity: `pzeta -= k * zeta`.
    RfLinear { k: f64 },
    /// Constant dipole corrector kick.
    Kick { dpx: f64, dpy: f64 },
    /// Square aperture: particles beyond `half_gap` in either transverse
    /// coordinate are flagged lost.
    Aperture { half_gap: f64 },
}

impl Element {
    pub fn length(&self) -> f64 {
        match self {
            Element::Drift { length } => *length,
            _ => 0.0,
        }
    }

    fn apply(&self, part: &mut PhaseSpaceState, config: &TrackConfig) {
        if !part.is_alive() {
            return;
        }
        let freeze_zeta = config.freeze_longitudinal;
        let freeze_energy = config.freeze_energy || config.freeze_longitudinal;
        match *self {
            Element::Marker => {}
            Element::Drift { length } => {
                let one_plus_delta = 1.0 + part.delta;
                let rvv_inv = part.rvv_inverse();
                let px = part.px;
                let py = part.py;
                part.x += length * px / one_plus_delta;
                part.y += length * py / one_plus_delta;
                if !freeze_zeta {
                    part.zeta += length
                        * (1.0
                            - rvv_inv
                                * (1.0
                                    + (px * px + py * py)
                                        / (2.0 * one_plus_delta * one_plus_delta)));
                }
            }
            Element::ThinQuad { k1l } => {
                part.px -= k1l * part.x;
                part.py += k1l * part.y;
            }
            Element::ThinBend { k0l } => {
                part.px += k0l * part.pzeta();
                if !freeze_zeta {
                    part.zeta -= k0l * part.x;
                }
            }
            Element::ThinSextupole { k2l } => {
                let (x, y) = (part.x, part.y);
                part.px -= 0.5 * k2l * (x * x - y * y);
                part.py += k2l * x * y;
            }
            Element::RfLinear { k } => {
                if !freeze_energy {
                    part.set_pzeta(part.pzeta() - k * part.zeta);
                }
            }
            Element::Kick { dpx, dpy } => {
                part.px += dpx;
                part.py += dpy;
            }
            Element::Aperture { half_gap } => {
                if part.x.abs() > half_gap || part.y.abs() > half_gap {
                    part.state = STATE_LOST;
                }
            }
        }
    }

    fn apply_inverse(&self, part: &mut PhaseSpaceState, config: &TrackConfig) {
        if !part.is_alive() {
            return;
        }
        let freeze_zeta = config.freeze_longitudinal;
        let freeze_energy = config.freeze_energy || config.freeze_longitudinal;
        match *self {
            Element::Marker => {}
            Element::Drift { length } => {
                // px, py and delta are untouched by the forward map, so the
                // inverse reuses them directly.
                let one_plus_delta = 1.0 + part.delta;
                let rvv_inv = part.rvv_inverse();
                let px = part.px;
                let py = part.py;
                part.x -= length * px / one_plus_delta;
                part.y -= length * py / one_plus_delta;
                if !freeze_zeta {
                    part.zeta -= length
                        * (1.0
                            - rvv_inv
                                * (1.0
                                    + (px * px + py * py)
                                        / (2.0 * one_plus_delta * one_plus_delta)));
                }
            }
            Element::ThinQuad { k1l } => {
                part.px += k1l * part.x;
                part.py -= k1l * part.y;
            }
            Element::ThinBend { k0l } => {
                if !freeze_zeta {
                    part.zeta += k0l * part.x;
                }
                part.px -= k0l * part.pzeta();
            }
            Element::ThinSextupole { k2l } => {
                let (x, y) = (part.x, part.y);
                part.px += 0.5 * k2l * (x * x - y * y);
                part.py -= k2l * x * y;
            }
            Element::RfLinear { k } => {
                if !freeze_energy {
                    part.set_pzeta(part.pzeta() + k * part.zeta);
                }
            }
            Element::Kick { dpx, dpy } => {
                part.px -= dpx;
                part.py -= dpy;
            }
            Element::Aperture { half_gap } => {
                if part.x.abs() > half_gap || part.y.abs() > half_gap {
                    part.state = STATE_LOST;
                }
            }
        }
    }
}

/// An ordered element sequence with names and precomputed entry positions.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SimpleLine {
    names: Vec<String>,
    elements: Vec<Element>,
    /// Entry position of each element plus the end of the line;
    /// length `elements.len() + 1`.
    s: Vec<f64>,
}

impl SimpleLine {
    pub fn new() -> Self {
        Self {
            names: Vec::new(),
            elements: Vec::new(),
            s: vec![0.0],
        }
    }

    pub fn append(&mut self, name: impl Into<String>, element: Element) -> &mut Self {
        let end = *self.s.last().unwrap_or(&0.0);
        self.names.push(name.into());
        self.s.push(end + element.length());
        self.elements.push(element);
        self
    }

    pub fn element(&self, index: usize) -> &Element {
        &self.elements[index]
    }

    /// Replaces the element with the given name. The replacement must keep
    /// the length, so the precomputed entry positions stay valid.
    pub fn set_element(&mut self, name: &str, element: Element) -> Result<()> {
        let idx = self
            .find_element(name)
            .ok_or_else(|| TwissError::Configuration(format!("no element named '{name}'")))?;
        if self.elements[idx].length() != element.length() {
            return Err(TwissError::Configuration(format!(
                "cannot change the length of '{name}' in place"
            )));
        }
        self.elements[idx] = element;
        Ok(())
    }
}

impl Default for SimpleLine {
    fn default() -> Self {
        Self::new()
    }
}

impl Tracker for SimpleLine {
    fn element_count(&self) -> usize {
        self.elements.len()
    }

    fn element_name(&self, index: usize) -> &str {
        &self.names[index]
    }

    fn s_position(&self, index: usize) -> f64 {
        self.s[index]
    }

    fn track(&self, states: &mut [PhaseSpaceState], range: ElementRange, config: &TrackConfig) {
        if range.backtrack {
            for idx in (range.start..range.stop).rev() {
                for part in states.iter_mut() {
                    self.elements[idx].apply_inverse(part, config);
                }
            }
        } else {
            for idx in range.start..range.stop {
                for part in states.iter_mut() {
                    self.elements[idx].apply(part, config);
                }
            }
        }
    }

    fn track_recorded(
        &self,
        states: &mut [PhaseSpaceState],
        range: ElementRange,
        config: &TrackConfig,
    ) -> Trajectories {
        let rows = range.row_count();
        let s: Vec<f64> = (range.start..=range.stop).map(|i| self.s[i]).collect();

        let probes: Vec<Vec<PhaseSpaceState>> = if range.backtrack {
            // Fill rows from the exit boundary down to the range start.
            let mut recorded: Vec<Vec<PhaseSpaceState>> =
                states.iter().map(|part| vec![*part; rows]).collect();
            for idx in (range.start..range.stop).rev() {
                for (part, rec) in states.iter_mut().zip(recorded.iter_mut()) {
                    self.elements[idx].apply_inverse(part, config);
                    rec[idx - range.start] = *part;
                }
            }
            recorded
        } else {
            let mut recorded: Vec<Vec<PhaseSpaceState>> = states
                .iter()
                .map(|part| {
                    let mut rec = Vec::with_capacity(rows);
                    rec.push(*part);
                    rec
                })
                .collect();
            for idx in range.start..range.stop {
                for (part, rec) in states.iter_mut().zip(recorded.iter_mut()) {
                    self.elements[idx].apply(part, config);
                    rec.push(*part);
                }
            }
            recorded
        };

        Trajectories { s, probes }
    }

    fn find_element(&self, name: &str) -> Option<usize> {
        self.names.iter().position(|n| n == name)
    }
}

impl Splicable for SimpleLine {
    fn with_markers_at(&self, at_s: &[f64], prefix: &str) -> Result<(Self, Vec<String>)> {
        let mut out = self.clone();
        let mut names = Vec::with_capacity(at_s.len());
        for (ii, &target) in at_s.iter().enumerate() {
            let name = format!("{prefix}{ii}");
            out.insert_marker_at(target, &name)?;
            names.push(name);
        }
        Ok((out, names))
    }
}

impl SimpleLine {
    fn insert_marker_at(&mut self, target: f64, name: &str) -> Result<()> {
        let total = *self.s.last().unwrap_or(&0.0);
        if target < 0.0 || target > total {
            return Err(TwissError::Configuration(format!(
                "requested position {target} outside the line (length {total})"
            )));
        }
        // Find the first element whose entry position reaches the target.
        let mut idx = self.elements.len();
        for (ii, &s_entry) in self.s.iter().take(self.elements.len()).enumerate() {
            if s_entry >= target {
                idx = ii;
                break;
            }
        }
        if idx < self.elements.len() && (self.s[idx] - target).abs() == 0.0 {
            self.names.insert(idx, name.to_string());
            self.elements.insert(idx, Element::Marker);
            self.rebuild_s();
            return Ok(());
        }
        // The target falls inside the preceding element, which must be a
        // drift to be split.
        let host = idx.checked_sub(1).ok_or_else(|| {
            TwissError::Configuration(format!("no element spans position {target}"))
        })?;
        match self.elements[host] {
            Element::Drift { length } => {
                let first = target - self.s[host];
                let second = length - first;
                self.elements[host] = Element::Drift { length: first };
                self.names.insert(host + 1, name.to_string());
                self.elements.insert(host + 1, Element::Marker);
                let tail_name = format!("{}_p", self.names[host]);
                self.names.insert(host + 2, tail_name);
                self.elements
                    .insert(host + 2, Element::Drift { length: second });
                self.rebuild_s();
                Ok(())
            }
            _ => Err(TwissError::Configuration(format!(
                "position {target} falls inside a thin element group"
            ))),
        }
    }

    fn rebuild_s(&mut self) {
        self.s = Vec::with_capacity(self.elements.len() + 1);
        let mut acc = 0.0;
        self.s.push(acc);
        for ele in &self.elements {
            acc += ele.length();
            self.s.push(acc);
        }
    }
}
