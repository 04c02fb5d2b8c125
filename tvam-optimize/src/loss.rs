//! Objectives scoring a dose volume against the target.

use ndarray::{Array3, Zip};

use crate::error::{TvamError, TvamResult, check_shape};
use crate::geometry::sign;

/// Penalises object voxels below the upper threshold or above 1, and void
/// voxels above the lower threshold. Zero inside the satisfied bands.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct LossThreshold {
    /// `(T_L, T_U)`.
    pub thresholds: (f32, f32),
    /// Exponent `K` applied to every violation.
    pub power: i32,
}

impl Default for LossThreshold {
    fn default() -> Self {
        Self {
            thresholds: (0.65, 0.75),
            power: 2,
        }
    }
}

impl LossThreshold {
    pub fn new(lower: f32, upper: f32) -> Self {
        Self {
            thresholds: (lower, upper),
            ..Self::default()
        }
    }

    fn validate(&self) -> TvamResult<()> {
        let (lo, hi) = self.thresholds;
        if !(lo.is_finite() && hi.is_finite() && 0.0 <= lo && lo < hi && hi <= 1.0) {
            return Err(TvamError::InvalidLoss(format!(
                "thresholds must satisfy 0 <= T_L < T_U <= 1, got ({lo}, {hi})"
            )));
        }
        validate_power(self.power)
    }

    /// Adds this voxel's loss to `total` and returns `dL/dI`.
    #[inline]
    fn voxel(&self, dose: f32, object: bool, total: &mut f64) -> f32 {
        let (lo, hi) = self.thresholds;
        let k = self.power;
        if object {
            let under = hi - dose;
            let over = dose - 1.0;
            let mut grad = 0.0;
            if under > 0.0 {
                *total += under.powi(k) as f64;
                grad -= k as f32 * under.powi(k - 1);
            }
            if over > 0.0 {
                *total += over.powi(k) as f64;
                grad += k as f32 * over.powi(k - 1);
            }
            grad
        } else {
            let over = dose - lo;
            if over > 0.0 {
                *total += over.powi(k) as f64;
                k as f32 * over.powi(k - 1)
            } else {
                0.0
            }
        }
    }
}

/// Threshold loss plus `weight · Σ p⁴` over the patterns, which pushes the
/// optimizer towards patterns without isolated bright pixels.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct LossThresholdSparsity {
    pub threshold: LossThreshold,
    pub weight: f32,
}

impl Default for LossThresholdSparsity {
    fn default() -> Self {
        Self {
            threshold: LossThreshold::default(),
            weight: 0.01,
        }
    }
}

/// `Σ |I − t|^K` against the target values themselves.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct LossTarget {
    pub power: i32,
}

impl Default for LossTarget {
    fn default() -> Self {
        Self { power: 2 }
    }
}

#[derive(Clone, Copy, Debug, PartialEq)]
pub enum LossFunction {
    Threshold(LossThreshold),
    ThresholdSparsity(LossThresholdSparsity),
    Target(LossTarget),
}

impl Default for LossFunction {
    fn default() -> Self {
        LossFunction::Threshold(LossThreshold::default())
    }
}

fn validate_power(power: i32) -> TvamResult<()> {
    if power < 1 {
        return Err(TvamError::InvalidLoss(format!("power must be at least 1, got {power}")));
    }
    Ok(())
}

impl LossFunction {
    pub fn name(&self) -> &'static str {
        match self {
            LossFunction::Threshold(_) => "threshold",
            LossFunction::ThresholdSparsity(_) => "threshold-sparsity",
            LossFunction::Target(_) => "target",
        }
    }

    pub fn validate(&self) -> TvamResult<()> {
        match self {
            LossFunction::Threshold(l) => l.validate(),
            LossFunction::ThresholdSparsity(l) => {
                l.threshold.validate()?;
                if !(l.weight.is_finite() && l.weight >= 0.0) {
                    return Err(TvamError::InvalidLoss(format!(
                        "sparsity weight must be finite and non-negative, got {}",
                        l.weight
                    )));
                }
                Ok(())
            }
            LossFunction::Target(l) => validate_power(l.power),
        }
    }

    /// Loss of `dose` against `target` and its gradient with respect to the
    /// dose. Target voxels above 0.5 are object.
    pub fn evaluate(
        &self,
        dose: &Array3<f32>,
        target: &Array3<f32>,
    ) -> TvamResult<(f32, Array3<f32>)> {
        check_shape("dose", target.shape(), dose.shape())?;
        let mut total = 0.0f64;
        let mut grad = Array3::zeros(dose.raw_dim());
        match self {
            LossFunction::Threshold(l) => {
                Zip::from(&mut grad)
                    .and(dose)
                    .and(target)
                    .for_each(|g, &d, &t| *g = l.voxel(d, t > 0.5, &mut total));
            }
            LossFunction::ThresholdSparsity(l) => {
                Zip::from(&mut grad)
                    .and(dose)
                    .and(target)
                    .for_each(|g, &d, &t| *g = l.threshold.voxel(d, t > 0.5, &mut total));
            }
            LossFunction::Target(l) => {
                let k = l.power;
                Zip::from(&mut grad).and(dose).and(target).for_each(|g, &d, &t| {
                    let e = d - t;
                    total += e.abs().powi(k) as f64;
                    *g = k as f32 * e.abs().powi(k - 1) * sign(e);
                });
            }
        }
        Ok((total as f32, grad))
    }

    /// Pattern-space term of the loss and its gradient, if this loss has one.
    pub fn pattern_penalty(&self, patterns: &Array3<f32>) -> Option<(f32, Array3<f32>)> {
        match self {
            LossFunction::ThresholdSparsity(l) if l.weight > 0.0 => {
                let w = l.weight;
                let penalty: f64 = patterns.iter().map(|&p| (p as f64).powi(4)).sum();
                let grad = patterns.mapv(|p| 4.0 * w * p * p * p);
                Some(((w as f64 * penalty) as f32, grad))
            }
            _ => None,
        }
    }
}
