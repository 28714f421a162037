pub mod bundle;
pub mod closed_orbit;
pub mod error;
pub mod line;
pub mod normal_form;
pub mod propagate;
pub mod state;
pub mod table;
/// The `twiss_core` crate computes the linear optics of a particle
/// accelerator lattice from tracking alone: no element is ever asked for
/// its transfer matrix.
///
/// Key components:
/// - **Tracker**: the seam to the tracking engine (`Tracker`, `ElementRange`, `TrackConfig`).
/// - **Closed orbit**: Newton search over recorded probe turns, with optional pinned planes.
/// - **Normal form**: eigen-decomposition of the one-turn matrix into the W matrix and tunes.
/// - **Propagation**: element-by-element optics via a finite-difference probe bundle.
/// - **Twiss**: the orchestrator dispatching periodic, open, 4D/6D and reversed computations.
pub mod tracker;
pub mod transfer_matrix;
pub mod twiss;

pub use error::{Result, TwissError};
pub use table::{TwissInit, TwissTable};
pub use twiss::{twiss, twiss_at_s, InitSpec, TwissOptions};
