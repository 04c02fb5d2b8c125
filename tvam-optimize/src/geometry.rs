//! Closed-form ray geometry for a cylindrical glass vial printed without an
//! index-matching bath.
//!
//! A ray that would strike the vial at height `y` refracts at the outer glass
//! wall and again at the inner wall, then crosses the resin on a straight
//! chord. The chord is re-expressed by the heights `y_i` and `y_f` at which its
//! extension enters and leaves the outer circle, so the ray projector can keep
//! treating every ray as a straight line through the simulation disk.
//!
//! Only the entry interfaces matter for the dose: light leaving the resin on
//! the far side no longer polymerizes anything.

use rand::Rng;
use std::f32::consts::FRAC_PI_2;

use crate::error::{TvamError, TvamResult};

/// Arguments of `sqrt`/`acos` that leave their domain by less than this,
/// relative to their natural scale, are rounding noise and get clamped back
/// into it.
pub const DOMAIN_TOLERANCE: f32 = 1e-5;

/// Sign with `sign(0) = 0`, unlike [`f32::signum`].
pub fn sign(x: f32) -> f32 {
    if x > 0.0 {
        1.0
    } else if x < 0.0 {
        -1.0
    } else {
        0.0
    }
}

/// Intensity transmission of one interface for both polarization states.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Transmission {
    /// p-polarized (electric field in the plane of incidence).
    pub parallel: f32,
    /// s-polarized.
    pub perpendicular: f32,
}

impl Transmission {
    pub const FULL: Self = Self {
        parallel: 1.0,
        perpendicular: 1.0,
    };

    /// Transmission of two interfaces crossed one after the other.
    pub fn then(self, next: Self) -> Self {
        Self {
            parallel: self.parallel * next.parallel,
            perpendicular: self.perpendicular * next.perpendicular,
        }
    }

    pub fn mean(self) -> f32 {
        0.5 * (self.parallel + self.perpendicular)
    }
}

/// Fresnel intensity transmission from medium `n1` into `n2` at incidence
/// angle `theta_i` (radians). `None` means total internal reflection.
///
/// Both coefficients fall continuously to zero as `theta_i` approaches the
/// critical angle, because the transmitted cosine does.
pub fn fresnel_transmission(n1: f32, n2: f32, theta_i: f32) -> Option<Transmission> {
    let sin_t = n1 / n2 * theta_i.sin();
    if sin_t.abs() > 1.0 {
        return None;
    }
    let cos_i = theta_i.cos().abs();
    let cos_t = (1.0 - sin_t * sin_t).max(0.0).sqrt();

    let rs_den = n1 * cos_i + n2 * cos_t;
    let rp_den = n2 * cos_i + n1 * cos_t;
    if rs_den <= 0.0 || rp_den <= 0.0 {
        // Grazing incidence with a grazing transmitted ray: nothing gets through.
        return Some(Transmission {
            parallel: 0.0,
            perpendicular: 0.0,
        });
    }
    let rs = (n1 * cos_i - n2 * cos_t) / rs_den;
    let rp = (n2 * cos_i - n1 * cos_t) / rp_den;
    Some(Transmission {
        parallel: (1.0 - rp * rp).clamp(0.0, 1.0),
        perpendicular: (1.0 - rs * rs).clamp(0.0, 1.0),
    })
}

/// How unpolarized light is weighted between the two Fresnel coefficients.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RandomPolarization {
    /// Every ray carries the average of both states. Deterministic.
    Expectation,
    /// Every ray draws its own mixing weight from a generator seeded with
    /// `seed`; the draw is renewed on each objective evaluation.
    Sampled { seed: u64 },
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Polarization {
    Parallel,
    Perpendicular,
    Random(RandomPolarization),
}

impl Default for Polarization {
    fn default() -> Self {
        Polarization::Random(RandomPolarization::Expectation)
    }
}

impl Polarization {
    /// Collapses a two-state transmission into the weight carried by one ray.
    pub fn weight<R: Rng + ?Sized>(&self, transmission: Transmission, rng: &mut R) -> f32 {
        match self {
            Polarization::Parallel => transmission.parallel,
            Polarization::Perpendicular => transmission.perpendicular,
            Polarization::Random(RandomPolarization::Expectation) => transmission.mean(),
            Polarization::Random(RandomPolarization::Sampled { .. }) => {
                let w: f32 = rng.gen();
                w * transmission.parallel + (1.0 - w) * transmission.perpendicular
            }
        }
    }

    pub fn is_sampled(&self) -> bool {
        matches!(self, Polarization::Random(RandomPolarization::Sampled { .. }))
    }

    pub fn seed(&self) -> u64 {
        match self {
            Polarization::Random(RandomPolarization::Sampled { seed }) => *seed,
            _ => 0,
        }
    }
}

/// Cross-section of the vial: a glass annulus filled with resin.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct VialGeometry {
    pub r_outer: f32,
    pub r_inner: f32,
    pub n_vial: f32,
    pub n_resin: f32,
}

/// A ray that made it into the resin.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct RefractedRay {
    /// Height at which the chord's extension enters the outer circle.
    pub y_i: f32,
    /// Height at which the chord's extension leaves the outer circle.
    pub y_f: f32,
    /// Total signed deflection δ; the chord travels at angle `-δ` to the
    /// optical axis.
    pub deflection: f32,
    /// Signed distance between the chord and the vial axis.
    pub offset: f32,
    /// Air to glass.
    pub outer: Transmission,
    /// Glass to resin.
    pub inner: Transmission,
}

impl RefractedRay {
    pub fn transmission(&self) -> Transmission {
        self.outer.then(self.inner)
    }
}

#[derive(Clone, Copy, Debug, PartialEq)]
pub enum RayPath {
    /// `|y| >= r_outer`: the ray passes beside the vial.
    Miss,
    /// The ray crosses the glass wall without reaching the inner surface.
    GlassOnly,
    /// Reflected totally at the glass/resin interface.
    TotalInternalReflection,
    Refracted(RefractedRay),
}

impl VialGeometry {
    pub fn new(r_outer: f32, r_inner: f32, n_vial: f32, n_resin: f32) -> Self {
        Self {
            r_outer,
            r_inner,
            n_vial,
            n_resin,
        }
    }

    pub fn validate(&self) -> TvamResult<()> {
        let finite = [self.r_outer, self.r_inner, self.n_vial, self.n_resin]
            .iter()
            .all(|v| v.is_finite());
        if !finite {
            return Err(TvamError::InvalidGeometry(format!(
                "all parameters must be finite, got {self:?}"
            )));
        }
        if self.r_inner <= 0.0 || self.r_outer <= 0.0 {
            return Err(TvamError::InvalidGeometry(format!(
                "radii must be positive, got R_outer = {}, R_inner = {}",
                self.r_outer, self.r_inner
            )));
        }
        if self.r_inner >= self.r_outer {
            return Err(TvamError::InvalidGeometry(format!(
                "R_inner ({}) must be strictly less than R_outer ({})",
                self.r_inner, self.r_outer
            )));
        }
        if self.n_vial < 1.0 || self.n_resin < 1.0 {
            return Err(TvamError::InvalidGeometry(format!(
                "refractive indices must be at least 1, got n_vial = {}, n_resin = {}",
                self.n_vial, self.n_resin
            )));
        }
        Ok(())
    }

    /// Traces a ray arriving parallel to the optical axis at signed height `y`.
    pub fn trace(&self, y: f32) -> RayPath {
        let (ro, ri) = (self.r_outer, self.r_inner);
        if y.abs() >= ro {
            return RayPath::Miss;
        }

        let alpha = (y / ro).asin();
        let Some(outer) = fresnel_transmission(1.0, self.n_vial, alpha.abs()) else {
            return RayPath::TotalInternalReflection;
        };
        let beta = (alpha.sin() / self.n_vial).asin();
        let cos_beta = beta.cos();

        // Law of cosines on the chord inside the glass; the smaller root is the
        // first hit of the inner surface.
        let disc = ro * ro * (cos_beta * cos_beta - 1.0) + ri * ri;
        let Some(disc) = clamp_non_negative(disc, ro * ro) else {
            return RayPath::GlassOnly;
        };
        let x = ro * cos_beta - disc.sqrt();
        if x <= 0.0 {
            return RayPath::GlassOnly;
        }

        let cos_arg = (x * x + ri * ri - ro * ro) / (2.0 * ri * x);
        let epsilon = clamp_unit(cos_arg).acos() - FRAC_PI_2;
        let beta_inner = sign(y) * (FRAC_PI_2 - epsilon);

        let gamma_arg = self.n_vial * beta_inner.sin() / self.n_resin;
        if gamma_arg.abs() > 1.0 {
            return RayPath::TotalInternalReflection;
        }
        let Some(inner) = fresnel_transmission(self.n_vial, self.n_resin, beta_inner.abs()) else {
            return RayPath::TotalInternalReflection;
        };
        let gamma = gamma_arg.asin();
        let delta = (alpha - beta) + (beta_inner - gamma);

        let offset = ri * gamma.sin();
        let p = (ro * ro - offset * offset).max(0.0).sqrt();
        let eta = (offset / ro).asin() - delta;
        let y_f = ro * eta.sin();
        let y_i = 2.0 * p * delta.sin() + y_f;

        RayPath::Refracted(RefractedRay {
            y_i,
            y_f,
            deflection: delta,
            offset,
            outer,
            inner,
        })
    }
}

/// `scale` carries the units of `v`, so the tolerance does not depend on
/// whether the vial is measured in metres or millimetres.
fn clamp_non_negative(v: f32, scale: f32) -> Option<f32> {
    if v >= 0.0 {
        Some(v)
    } else if v > -DOMAIN_TOLERANCE * scale {
        Some(0.0)
    } else {
        None
    }
}

fn clamp_unit(v: f32) -> f32 {
    v.clamp(-1.0, 1.0)
}
