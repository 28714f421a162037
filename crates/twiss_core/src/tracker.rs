//! Collaborator traits for the element-level tracking engine.
//!
//! The optics engine never owns the element maps: it hands a set of probe
//! states to a [`Tracker`] and reads back the trajectories. All
//! configuration travels with the call as a [`TrackConfig`] value; the
//! engine never mutates shared tracker state.

use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::state::PhaseSpaceState;

/// How synchrotron-radiation kicks are applied during a tracking pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RadiationMode {
    /// Each particle receives its own radiation kick.
    Full,
    /// Every particle receives the same kick as the closed-orbit probe.
    KickAsClosedOrbit,
    /// Every particle's momenta are scaled as much as the closed orbit's.
    ScaleAsClosedOrbit,
}

/// Per-call tracking configuration.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct TrackConfig {
    /// Freeze both `zeta` and `pzeta` during the pass.
    pub freeze_longitudinal: bool,
    /// Freeze the energy deviation only (`zeta` still evolves).
    pub freeze_energy: bool,
    pub radiation: RadiationMode,
}

impl Default for TrackConfig {
    fn default() -> Self {
        Self {
            freeze_longitudinal: false,
            freeze_energy: false,
            radiation: RadiationMode::Full,
        }
    }
}

/// A contiguous element range, `stop` exclusive. With `backtrack` set the
/// particles start at the exit boundary of the range and the inverse maps
/// are applied in reverse order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ElementRange {
    pub start: usize,
    pub stop: usize,
    pub backtrack: bool,
}

impl ElementRange {
    pub fn new(start: usize, stop: usize) -> Self {
        Self {
            start,
            stop,
            backtrack: false,
        }
    }

    pub fn full_line(element_count: usize) -> Self {
        Self::new(0, element_count)
    }

    pub fn backtracking(mut self) -> Self {
        self.backtrack = true;
        self
    }

    /// Number of recorded rows: one per element entry plus the exit row.
    pub fn row_count(&self) -> usize {
        self.stop - self.start + 1
    }
}

/// Per-probe, per-element trajectory records. Row `i` holds the state at
/// the entry of element `range.start + i`; the final row is the state at
/// the exit boundary of the range.
#[derive(Debug, Clone)]
pub struct Trajectories {
    /// Longitudinal position of each recorded row.
    pub s: Vec<f64>,
    /// One trajectory per probe, in the same order as the input states.
    pub probes: Vec<Vec<PhaseSpaceState>>,
}

impl Trajectories {
    pub fn row_count(&self) -> usize {
        self.s.len()
    }

    pub fn probe_count(&self) -> usize {
        self.probes.len()
    }
}

/// The external tracking collaborator. Implementations must advance all
/// probes of a call deterministically and keep the per-probe order; whether
/// the probes are evaluated in parallel is invisible to the optics engine.
pub trait Tracker {
    fn element_count(&self) -> usize;

    /// Name of the element at `index` (`index < element_count`).
    fn element_name(&self, index: usize) -> &str;

    /// Longitudinal position of the entry boundary of element `index`,
    /// defined for `index <= element_count`.
    fn s_position(&self, index: usize) -> f64;

    fn circumference(&self) -> f64 {
        self.s_position(self.element_count())
    }

    /// Whether the line models synchrotron radiation. Radiation breaks the
    /// symplecticity of transfer matrices and downstream extraction must
    /// switch to the generalized-inverse path.
    fn has_radiation(&self) -> bool {
        false
    }

    /// Advances the states through the range, mutating them in place.
    fn track(&self, states: &mut [PhaseSpaceState], range: ElementRange, config: &TrackConfig);

    /// Advances the states through the range, recording every element-entry
    /// row plus the exit row.
    fn track_recorded(
        &self,
        states: &mut [PhaseSpaceState],
        range: ElementRange,
        config: &TrackConfig,
    ) -> Trajectories;

    /// Index of the named element, if present.
    fn find_element(&self, name: &str) -> Option<usize> {
        (0..self.element_count()).find(|&i| self.element_name(i) == name)
    }
}

/// Capability to splice zero-length markers into a line, used by
/// position-based (`at_s`) optics queries.
pub trait Splicable: Tracker + Sized {
    /// Returns a copy of the line with a marker inserted at each requested
    /// position, together with the generated marker names.
    fn with_markers_at(&self, at_s: &[f64], prefix: &str) -> Result<(Self, Vec<String>)>;
}
