use thiserror::Error;

/// Errors produced by the optics engine.
///
/// Configuration errors are raised at the orchestrator boundary before any
/// numeric work. Numeric errors are raised after the relevant component
/// completes, unless the caller opted into best-effort continuation.
#[derive(Debug, Error)]
pub enum TwissError {
    #[error(
        "closed orbit search did not converge after {iterations} iterations \
         (residual norm {residual_norm:.3e})"
    )]
    ClosedOrbitSearch {
        iterations: usize,
        residual_norm: f64,
    },

    #[error(
        "transfer matrix is unstable: eigenvalue modulus {modulus} deviates \
         from the unit circle by more than {tol:.3e}"
    )]
    MatrixStability { modulus: f64, tol: f64 },

    #[error(
        "transfer matrix is unresponsive in plane {plane}: response \
         {response:.3e} is below tolerance {tol:.3e}"
    )]
    MatrixResponsiveness {
        plane: usize,
        response: f64,
        tol: f64,
    },

    #[error("probe particle {probe} was lost during propagation")]
    ParticleLoss { probe: usize },

    #[error("degenerate linear system while {context}")]
    Degenerate { context: &'static str },

    #[error("invalid configuration: {0}")]
    Configuration(String),
}

pub type Result<T> = std::result::Result<T, TwissError>;
