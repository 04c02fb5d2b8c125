//! Projection pattern optimization for tomographic volumetric additive
//! manufacturing (TVAM).
//!
//! A rotating vial of photoresin is lit from many angles; the dose every voxel
//! accumulates decides whether it polymerizes. This crate models that light
//! transport ([`PropagationScheme`]) and solves for non-negative patterns
//! whose dose prints a target ([`PatternOptimizer`], [`optimize`]).

pub mod error;
pub mod filter;
pub mod geometry;
pub mod loss;
pub mod metrics;
pub mod optimizer;
pub mod ray_projector;
pub mod result;
pub mod scheme;
pub mod wave_projector;

pub use error::{TvamError, TvamResult};
pub use geometry::{Polarization, RandomPolarization, RayPath, VialGeometry};
pub use loss::{LossFunction, LossTarget, LossThreshold, LossThresholdSparsity};
pub use optimizer::{GradientBased, Initialization, OptimizationScheme, Osmo, PatternOptimizer};
pub use result::{OptimizationResult, TerminationReason};
pub use scheme::{
    ParallelRayOptics, PropagationScheme, Propagator, VialRayOptics, WaveOptics, uniform_angles,
};

use ndarray::{Array3, ArrayBase, Data, Ix3};

/// The volume to print. Voxels above 0.5 are object, the rest void.
#[derive(Clone, Debug)]
pub struct TargetVolume {
    pub data: Array3<f32>,
}

impl TargetVolume {
    pub fn new(data: Array3<f32>) -> Self {
        Self { data }
    }

    pub fn from_mask<S: Data<Elem = bool>>(mask: &ArrayBase<S, Ix3>) -> Self {
        Self {
            data: mask.mapv(|inside| if inside { 1.0 } else { 0.0 }),
        }
    }

    pub fn dim(&self) -> (usize, usize, usize) {
        self.data.dim()
    }

    /// Upright cylinder of radius `radius_frac · n / 2` through all `nz` rows.
    pub fn cylinder(n: usize, nz: usize, radius_frac: f32) -> Self {
        let c = (n as f32 - 1.0) / 2.0;
        let r = radius_frac * n as f32 / 2.0;
        Self {
            data: Array3::from_shape_fn((n, n, nz), |(i, j, _)| {
                let (x, y) = (i as f32 - c, j as f32 - c);
                if x * x + y * y <= r * r {
                    1.0
                } else {
                    0.0
                }
            }),
        }
    }

    /// Sphere of radius `radius_frac · min(n, nz) / 2` centred in the volume.
    pub fn sphere(n: usize, nz: usize, radius_frac: f32) -> Self {
        let c = (n as f32 - 1.0) / 2.0;
        let cz = (nz as f32 - 1.0) / 2.0;
        let r = radius_frac * n.min(nz) as f32 / 2.0;
        Self {
            data: Array3::from_shape_fn((n, n, nz), |(i, j, k)| {
                let (x, y, z) = (i as f32 - c, j as f32 - c, k as f32 - cz);
                if x * x + y * y + z * z <= r * r {
                    1.0
                } else {
                    0.0
                }
            }),
        }
    }

    pub fn object_voxels(&self) -> usize {
        self.data.iter().filter(|&&v| v > 0.5).count()
    }
}

/// A dose operator: patterns `(pixel, angle, row)` to dose `(x, y, z)`.
pub trait Projector {
    fn pattern_dim(&self) -> (usize, usize, usize);
    fn volume_dim(&self) -> (usize, usize, usize);

    fn forward(&self, patterns: &Array3<f32>) -> Array3<f32>;

    /// Gradient of `Σ g · forward(p)` with respect to `p`, evaluated at
    /// `patterns`. Linear operators ignore `patterns`.
    fn adjoint(&self, patterns: &Array3<f32>, dose_gradient: &Array3<f32>) -> Array3<f32>;

    /// Maps a volume back to pattern space; the starting point of every
    /// optimization.
    fn backproject(&self, volume: &Array3<f32>) -> Array3<f32>;

    /// `k` in `forward(c · p) = cᵏ · forward(p)`.
    fn dose_exponent(&self) -> i32 {
        1
    }

    /// Relative mismatch of the dot-product test between the linear map and
    /// its adjoint, on random vectors drawn from `seed`.
    fn adjoint_mismatch(&self, seed: u64) -> f32;

    /// Called before every objective evaluation.
    fn refresh(&mut self) {}
}

/// Optimizes patterns for `target` in one call.
///
/// Returns the patterns, the dose they print, and the run summary.
pub fn optimize(
    target: &TargetVolume,
    scheme: PropagationScheme,
    method: OptimizationScheme,
    loss: LossFunction,
) -> TvamResult<(Array3<f32>, Array3<f32>, OptimizationResult)> {
    PatternOptimizer::new(scheme, method, loss).run(target)
}

pub(crate) fn dot(a: &Array3<f32>, b: &Array3<f32>) -> f64 {
    a.iter().zip(b.iter()).map(|(&x, &y)| x as f64 * y as f64).sum()
}

pub(crate) fn relative_mismatch(lhs: f64, rhs: f64) -> f32 {
    let scale = lhs.abs().max(rhs.abs());
    if scale == 0.0 {
        return 0.0;
    }
    ((lhs - rhs).abs() / scale) as f32
}
