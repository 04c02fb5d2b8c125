use thiserror::Error;

/// Configuration errors raised before any propagation runs.
///
/// Physical edge cases (rays missing the vial, total internal reflection) are
/// never reported here; they contribute zero dose inside the operators.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum TvamError {
    #[error("Invalid angle set: {0}")]
    InvalidAngles(String),
    #[error("Invalid absorption coefficient: {0} (must be finite and non-negative)")]
    InvalidAbsorption(f32),
    #[error("Invalid vial geometry: {0}")]
    InvalidGeometry(String),
    #[error("Invalid DMD diameter: {0} (must be finite and positive)")]
    InvalidDmdDiameter(f32),
    #[error("Invalid wave optics configuration: {0}")]
    InvalidWaveOptics(String),
    #[error(
        "Aperture L = {aperture} does not bound the propagated extent \
         |z_first| + |z_last| = {extent}; the angular spectrum would alias"
    )]
    Aliasing { aperture: f32, extent: f32 },
    #[error("Shape mismatch for {what}: expected {expected:?}, found {found:?}")]
    ShapeMismatch {
        what: &'static str,
        expected: Vec<usize>,
        found: Vec<usize>,
    },
    #[error("Invalid loss function: {0}")]
    InvalidLoss(String),
    #[error("Invalid optimizer settings: {0}")]
    InvalidOptimizer(String),
    #[error("{optimizer} does not support the {scheme} propagation scheme")]
    IncompatibleScheme {
        optimizer: &'static str,
        scheme: &'static str,
    },
    #[error(
        "Adjoint check failed: relative mismatch {mismatch:.3e} exceeds tolerance {tolerance:.1e}"
    )]
    AdjointMismatch { mismatch: f32, tolerance: f32 },
}

pub type TvamResult<T> = Result<T, TvamError>;

pub(crate) fn check_shape(
    what: &'static str,
    expected: &[usize],
    found: &[usize],
) -> TvamResult<()> {
    if expected != found {
        return Err(TvamError::ShapeMismatch {
            what,
            expected: expected.to_vec(),
            found: found.to_vec(),
        });
    }
    Ok(())
}
