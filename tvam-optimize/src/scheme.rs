//! Propagation schemes: how light from one projected pattern deposits dose.
//!
//! A scheme is plain configuration. [`PropagationScheme::build`] validates it
//! against the volume shape and produces the [`Propagator`] the optimizer
//! works with; nothing is propagated before that succeeds.

use ndarray::Array3;
use std::f32::consts::PI;

use crate::Projector;
use crate::error::{TvamError, TvamResult};
use crate::geometry::{Polarization, VialGeometry};
use crate::ray_projector::RayProjector;
use crate::wave_projector::WaveProjector;

/// `n` angles evenly spaced over a full turn, starting at 0.
pub fn uniform_angles(n: usize) -> Vec<f32> {
    (0..n).map(|i| 2.0 * PI * i as f32 / n as f32).collect()
}

/// Straight rays through an index-matched bath.
#[derive(Clone, Debug, PartialEq)]
pub struct ParallelRayOptics {
    /// Radians.
    pub angles: Vec<f32>,
    /// Absorption coefficient. Per voxel when `dmd_diameter` is `None`,
    /// otherwise in the inverse unit of `dmd_diameter`.
    pub mu: Option<f32>,
    /// Physical width of the projected pattern. When set, the volume spans
    /// exactly this width.
    pub dmd_diameter: Option<f32>,
}

impl ParallelRayOptics {
    pub fn new(angles: Vec<f32>) -> Self {
        Self {
            angles,
            mu: None,
            dmd_diameter: None,
        }
    }

    pub fn with_absorption(mut self, mu: f32) -> Self {
        self.mu = Some(mu);
        self
    }

    pub fn with_dmd_diameter(mut self, diameter: f32) -> Self {
        self.dmd_diameter = Some(diameter);
        self
    }
}

/// Rays refracted by a glass vial without index matching.
#[derive(Clone, Debug, PartialEq)]
pub struct VialRayOptics {
    pub angles: Vec<f32>,
    /// Absorption coefficient of the resin, in the inverse length unit of the
    /// geometry.
    pub mu: Option<f32>,
    pub geometry: VialGeometry,
    /// Width of the projected pattern. Defaults to the outer vial diameter; a
    /// larger DMD is simulated at the vial diameter since the excess misses
    /// the vial.
    pub dmd_diameter: Option<f32>,
    pub polarization: Polarization,
}

impl VialRayOptics {
    pub fn new(angles: Vec<f32>, geometry: VialGeometry) -> Self {
        Self {
            angles,
            mu: None,
            geometry,
            dmd_diameter: None,
            polarization: Polarization::default(),
        }
    }

    pub fn with_absorption(mut self, mu: f32) -> Self {
        self.mu = Some(mu);
        self
    }

    pub fn with_dmd_diameter(mut self, diameter: f32) -> Self {
        self.dmd_diameter = Some(diameter);
        self
    }

    pub fn with_polarization(mut self, polarization: Polarization) -> Self {
        self.polarization = polarization;
        self
    }
}

/// Scalar wave propagation with the angular spectrum method.
#[derive(Clone, Debug, PartialEq)]
pub struct WaveOptics {
    pub angles: Vec<f32>,
    /// Absorption coefficient of the intensity, inverse unit of `aperture`.
    pub mu: Option<f32>,
    /// Wavelength inside the medium.
    pub wavelength: f32,
    /// Physical width `L` of the simulated field.
    pub aperture: f32,
    /// Depth of every volume plane relative to the pattern plane, one per
    /// voxel along the propagation direction, increasing.
    pub depths: Vec<f32>,
    /// Sum fields across angles before taking the intensity.
    pub coherent: bool,
}

impl WaveOptics {
    /// Depth planes centred on the pattern plane, one per voxel of an
    /// `n`-wide grid spanning `aperture`.
    pub fn centered(angles: Vec<f32>, wavelength: f32, aperture: f32, n: usize) -> Self {
        let dx = aperture / n as f32;
        let c = (n as f32 - 1.0) / 2.0;
        let depths = (0..n).map(|k| (k as f32 - c) * dx).collect();
        Self {
            angles,
            mu: None,
            wavelength,
            aperture,
            depths,
            coherent: false,
        }
    }

    pub fn with_absorption(mut self, mu: f32) -> Self {
        self.mu = Some(mu);
        self
    }

    pub fn with_coherent(mut self, coherent: bool) -> Self {
        self.coherent = coherent;
        self
    }
}

#[derive(Clone, Debug, PartialEq)]
pub enum PropagationScheme {
    ParallelRay(ParallelRayOptics),
    VialRay(VialRayOptics),
    Wave(WaveOptics),
}

impl PropagationScheme {
    pub fn name(&self) -> &'static str {
        match self {
            PropagationScheme::ParallelRay(_) => "parallel-ray",
            PropagationScheme::VialRay(_) => "vial-ray",
            PropagationScheme::Wave(_) => "wave",
        }
    }

    pub fn angles(&self) -> &[f32] {
        match self {
            PropagationScheme::ParallelRay(o) => &o.angles,
            PropagationScheme::VialRay(o) => &o.angles,
            PropagationScheme::Wave(o) => &o.angles,
        }
    }

    /// Checks everything that does not depend on the volume shape.
    pub fn validate(&self) -> TvamResult<()> {
        validate_angles(self.angles())?;
        match self {
            PropagationScheme::ParallelRay(o) => {
                validate_mu(o.mu)?;
                if let Some(d) = o.dmd_diameter {
                    validate_dmd(d)?;
                }
            }
            PropagationScheme::VialRay(o) => {
                validate_mu(o.mu)?;
                o.geometry.validate()?;
                if let Some(d) = o.dmd_diameter {
                    validate_dmd(d)?;
                }
            }
            PropagationScheme::Wave(o) => {
                validate_mu(o.mu)?;
                if !(o.wavelength.is_finite() && o.wavelength > 0.0) {
                    return Err(TvamError::InvalidWaveOptics(format!(
                        "wavelength must be finite and positive, got {}",
                        o.wavelength
                    )));
                }
                if !(o.aperture.is_finite() && o.aperture > 0.0) {
                    return Err(TvamError::InvalidWaveOptics(format!(
                        "aperture must be finite and positive, got {}",
                        o.aperture
                    )));
                }
                if o.depths.is_empty() || o.depths.iter().any(|z| !z.is_finite()) {
                    return Err(TvamError::InvalidWaveOptics(
                        "depths must be a non-empty list of finite values".into(),
                    ));
                }
                if o.depths.windows(2).any(|w| w[1] <= w[0]) {
                    return Err(TvamError::InvalidWaveOptics(
                        "depths must be strictly increasing".into(),
                    ));
                }
                let extent = o.depths[0].abs() + o.depths[o.depths.len() - 1].abs();
                if extent > o.aperture * (1.0 + ALIASING_SLACK) {
                    return Err(TvamError::Aliasing {
                        aperture: o.aperture,
                        extent,
                    });
                }
            }
        }
        Ok(())
    }

    /// Validates the scheme for a volume of shape `(nx, ny, nz)` and
    /// precomputes its operator.
    pub fn build(&self, volume_dim: (usize, usize, usize)) -> TvamResult<Propagator> {
        self.validate()?;
        let (nx, ny, nz) = volume_dim;
        if nx != ny || nx < 2 || nz == 0 {
            return Err(TvamError::ShapeMismatch {
                what: "volume (must be square in x and y, at least 2 wide)",
                expected: vec![nx, nx, nz.max(1)],
                found: vec![nx, ny, nz],
            });
        }
        let propagator = match self {
            PropagationScheme::ParallelRay(o) => {
                Propagator::Ray(RayProjector::parallel(o, volume_dim))
            }
            PropagationScheme::VialRay(o) => Propagator::Ray(RayProjector::vial(o, volume_dim)?),
            PropagationScheme::Wave(o) => {
                if o.depths.len() != nx {
                    return Err(TvamError::InvalidWaveOptics(format!(
                        "{} depth planes given for a volume {} voxels wide",
                        o.depths.len(),
                        nx
                    )));
                }
                Propagator::Wave(WaveProjector::new(o, volume_dim))
            }
        };
        Ok(propagator)
    }
}

/// Relative slack on the aliasing bound, absorbing the rounding of depths
/// generated from the aperture.
const ALIASING_SLACK: f32 = 1e-3;

fn validate_angles(angles: &[f32]) -> TvamResult<()> {
    if angles.is_empty() {
        return Err(TvamError::InvalidAngles("at least one angle is required".into()));
    }
    if let Some(bad) = angles.iter().find(|a| !a.is_finite()) {
        return Err(TvamError::InvalidAngles(format!("non-finite angle {bad}")));
    }
    Ok(())
}

fn validate_mu(mu: Option<f32>) -> TvamResult<()> {
    match mu {
        Some(m) if !m.is_finite() || m < 0.0 => Err(TvamError::InvalidAbsorption(m)),
        _ => Ok(()),
    }
}

fn validate_dmd(diameter: f32) -> TvamResult<()> {
    if !diameter.is_finite() || diameter <= 0.0 {
        return Err(TvamError::InvalidDmdDiameter(diameter));
    }
    Ok(())
}

/// A built propagation operator, ready for one optimization run.
pub enum Propagator {
    Ray(RayProjector),
    Wave(WaveProjector),
}

impl Projector for Propagator {
    fn pattern_dim(&self) -> (usize, usize, usize) {
        match self {
            Propagator::Ray(p) => p.pattern_dim(),
            Propagator::Wave(p) => p.pattern_dim(),
        }
    }

    fn volume_dim(&self) -> (usize, usize, usize) {
        match self {
            Propagator::Ray(p) => p.volume_dim(),
            Propagator::Wave(p) => p.volume_dim(),
        }
    }

    fn forward(&self, patterns: &Array3<f32>) -> Array3<f32> {
        match self {
            Propagator::Ray(p) => p.forward(patterns),
            Propagator::Wave(p) => p.forward(patterns),
        }
    }

    fn adjoint(&self, patterns: &Array3<f32>, dose_gradient: &Array3<f32>) -> Array3<f32> {
        match self {
            Propagator::Ray(p) => p.adjoint(patterns, dose_gradient),
            Propagator::Wave(p) => p.adjoint(patterns, dose_gradient),
        }
    }

    fn backproject(&self, volume: &Array3<f32>) -> Array3<f32> {
        match self {
            Propagator::Ray(p) => p.backproject(volume),
            Propagator::Wave(p) => p.backproject(volume),
        }
    }

    fn dose_exponent(&self) -> i32 {
        match self {
            Propagator::Ray(p) => p.dose_exponent(),
            Propagator::Wave(p) => p.dose_exponent(),
        }
    }

    fn adjoint_mismatch(&self, seed: u64) -> f32 {
        match self {
            Propagator::Ray(p) => p.adjoint_mismatch(seed),
            Propagator::Wave(p) => p.adjoint_mismatch(seed),
        }
    }

    fn refresh(&mut self) {
        match self {
            Propagator::Ray(p) => p.refresh(),
            Propagator::Wave(p) => p.refresh(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn vial() -> VialGeometry {
        VialGeometry::new(6e-3, 5.5e-3, 1.47, 1.48)
    }

    #[test]
    fn test_uniform_angles_cover_full_turn() {
        let angles = uniform_angles(4);
        assert_eq!(angles.len(), 4);
        assert_eq!(angles[0], 0.0);
        assert!((angles[2] - PI).abs() < 1e-6);
    }

    #[test]
    fn test_validation_rejects_bad_configuration() {
        let empty = PropagationScheme::ParallelRay(ParallelRayOptics::new(vec![]));
        assert!(matches!(empty.validate(), Err(TvamError::InvalidAngles(_))));

        let nan = PropagationScheme::ParallelRay(ParallelRayOptics::new(vec![0.0, f32::NAN]));
        assert!(matches!(nan.validate(), Err(TvamError::InvalidAngles(_))));

        let absorbing = ParallelRayOptics::new(uniform_angles(8)).with_absorption(-1.0);
        let negative_mu = PropagationScheme::ParallelRay(absorbing);
        assert_eq!(negative_mu.validate(), Err(TvamError::InvalidAbsorption(-1.0)));

        let inverted = PropagationScheme::VialRay(VialRayOptics::new(
            uniform_angles(8),
            VialGeometry::new(5e-3, 6e-3, 1.5, 1.5),
        ));
        assert!(matches!(inverted.validate(), Err(TvamError::InvalidGeometry(_))));

        let narrow = VialRayOptics::new(uniform_angles(8), vial()).with_dmd_diameter(0.0);
        let dmd = PropagationScheme::VialRay(narrow);
        assert_eq!(dmd.validate(), Err(TvamError::InvalidDmdDiameter(0.0)));
    }

    #[test]
    fn test_wave_aliasing_is_rejected() {
        let mut optics = WaveOptics::centered(uniform_angles(4), 500e-9, 100e-6, 16);
        assert!(PropagationScheme::Wave(optics.clone()).validate().is_ok());

        optics.depths = (0..16).map(|k| k as f32 * 10e-6).collect();
        let err = PropagationScheme::Wave(optics).validate().unwrap_err();
        assert!(matches!(err, TvamError::Aliasing { .. }));
    }

    #[test]
    fn test_build_requires_square_volume_and_matching_depths() {
        let scheme = PropagationScheme::ParallelRay(ParallelRayOptics::new(uniform_angles(8)));
        assert!(matches!(scheme.build((8, 6, 2)), Err(TvamError::ShapeMismatch { .. })));

        let optics = WaveOptics::centered(uniform_angles(4), 500e-9, 100e-6, 16);
        let wave = PropagationScheme::Wave(optics);
        assert!(matches!(wave.build((12, 12, 4)), Err(TvamError::InvalidWaveOptics(_))));
        assert!(wave.build((16, 16, 4)).is_ok());
    }

    #[test]
    fn test_built_pattern_shape() {
        let scheme = PropagationScheme::ParallelRay(ParallelRayOptics::new(uniform_angles(12)));
        let propagator = scheme.build((10, 10, 3)).unwrap();
        assert_eq!(propagator.pattern_dim(), (10, 12, 3));
        assert_eq!(propagator.volume_dim(), (10, 10, 3));
    }
}
