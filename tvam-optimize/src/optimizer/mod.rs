//! Inverse design of the projected patterns.
//!
//! [`PatternOptimizer`] builds the propagation operator for the target, seeds
//! the patterns with a back-projection, and iterates one of two methods:
//! projected L-BFGS on the loss ([`GradientBased`]) or object-space model
//! optimization ([`Osmo`]). Patterns stay non-negative throughout.

mod lbfgs;
mod osmo;

use log::{debug, info};
use ndarray::Array3;
use std::sync::atomic::AtomicBool;
use std::sync::Arc;
use std::time::Instant;

use crate::error::{TvamError, TvamResult};
use crate::filter::apply_ram_lak;
use crate::loss::LossFunction;
use crate::metrics::{best_threshold, voxel_error_rate};
use crate::result::{OptimizationResult, TerminationReason};
use crate::scheme::PropagationScheme;
use crate::{Projector, TargetVolume};

/// How the first patterns are obtained from the target.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum Initialization {
    #[default]
    Backprojection,
    /// Ram-Lak filtered back-projection, clipped at zero.
    FilteredBackprojection,
}

/// Projected limited-memory BFGS on the loss.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct GradientBased {
    pub iterations: usize,
    /// Number of `(s, y)` pairs kept.
    pub history: usize,
    pub store_trace: bool,
    /// Stop once the largest projected gradient component falls below this.
    pub gradient_tolerance: f32,
    /// Stop once the relative loss decrease of an iteration falls below this.
    /// Zero disables the test.
    pub loss_tolerance: f32,
    /// Run the operator dot-product test before iterating.
    pub check_adjoint: bool,
    pub adjoint_tolerance: f32,
    pub initialization: Initialization,
    /// Seed of the dot-product test vectors.
    pub seed: u64,
}

impl Default for GradientBased {
    fn default() -> Self {
        Self {
            iterations: 30,
            history: 10,
            store_trace: true,
            gradient_tolerance: 1e-8,
            loss_tolerance: 0.0,
            check_adjoint: cfg!(debug_assertions),
            adjoint_tolerance: 1e-3,
            initialization: Initialization::Backprojection,
            seed: 42,
        }
    }
}

/// Object-space model optimization. Only meaningful for the linear
/// parallel-ray operator.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Osmo {
    pub iterations: usize,
    /// `(D_l, D_h)`: void voxels above `D_l` and object voxels below `D_h`
    /// update the model.
    pub thresholds: (f32, f32),
    pub initialization: Initialization,
}

impl Default for Osmo {
    fn default() -> Self {
        Self {
            iterations: 10,
            thresholds: (0.7, 0.8),
            initialization: Initialization::Backprojection,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq)]
pub enum OptimizationScheme {
    GradientBased(GradientBased),
    Osmo(Osmo),
}

impl Default for OptimizationScheme {
    fn default() -> Self {
        OptimizationScheme::GradientBased(GradientBased::default())
    }
}

impl OptimizationScheme {
    pub fn name(&self) -> &'static str {
        match self {
            OptimizationScheme::GradientBased(_) => "L-BFGS",
            OptimizationScheme::Osmo(_) => "OSMO",
        }
    }

    pub fn validate(&self) -> TvamResult<()> {
        match self {
            OptimizationScheme::GradientBased(s) => {
                if s.history == 0 {
                    return Err(TvamError::InvalidOptimizer(
                        "history must hold at least one pair".into(),
                    ));
                }
                if !(s.gradient_tolerance >= 0.0
                    && s.loss_tolerance >= 0.0
                    && s.adjoint_tolerance > 0.0)
                {
                    return Err(TvamError::InvalidOptimizer(format!(
                        "tolerances must be non-negative, got gradient {}, loss {}, adjoint {}",
                        s.gradient_tolerance, s.loss_tolerance, s.adjoint_tolerance
                    )));
                }
            }
            OptimizationScheme::Osmo(s) => {
                let (lo, hi) = s.thresholds;
                if !(lo.is_finite() && hi.is_finite() && 0.0 <= lo && lo < hi && hi <= 1.0) {
                    return Err(TvamError::InvalidOptimizer(format!(
                        "OSMO thresholds must satisfy 0 <= D_l < D_h <= 1, got ({lo}, {hi})"
                    )));
                }
            }
        }
        Ok(())
    }
}

/// What an optimization method hands back to [`PatternOptimizer`].
pub(crate) struct Outcome {
    pub patterns: Array3<f32>,
    pub termination: TerminationReason,
    pub iterations: usize,
    pub evaluations: usize,
    pub initial_loss: f32,
    pub final_loss: f32,
    pub trace: Vec<f32>,
}

pub struct PatternOptimizer {
    pub scheme: PropagationScheme,
    pub method: OptimizationScheme,
    pub loss: LossFunction,
    stop_signal: Arc<AtomicBool>,
}

impl PatternOptimizer {
    pub fn new(scheme: PropagationScheme, method: OptimizationScheme, loss: LossFunction) -> Self {
        Self {
            scheme,
            method,
            loss,
            stop_signal: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Shares an externally owned stop signal.
    pub fn with_stop_signal(mut self, stop_signal: Arc<AtomicBool>) -> Self {
        self.stop_signal = stop_signal;
        self
    }

    /// Setting this flag stops the run at the next iteration boundary.
    pub fn stop_signal(&self) -> Arc<AtomicBool> {
        self.stop_signal.clone()
    }

    /// Returns the optimized patterns, the dose they print, and a summary.
    pub fn run(
        &self,
        target: &TargetVolume,
    ) -> TvamResult<(Array3<f32>, Array3<f32>, OptimizationResult)> {
        self.run_with_callback(target, |_, _| {})
    }

    /// Like [`Self::run`], calling `callback(iteration, loss)` after every
    /// completed iteration.
    pub fn run_with_callback<F: FnMut(usize, f32)>(
        &self,
        target: &TargetVolume,
        mut callback: F,
    ) -> TvamResult<(Array3<f32>, Array3<f32>, OptimizationResult)> {
        self.method.validate()?;
        self.loss.validate()?;
        if let OptimizationScheme::Osmo(_) = self.method {
            if !matches!(self.scheme, PropagationScheme::ParallelRay(_)) {
                return Err(TvamError::IncompatibleScheme {
                    optimizer: "OSMO",
                    scheme: self.scheme.name(),
                });
            }
        }

        let mut projector = self.scheme.build(target.dim())?;
        if let OptimizationScheme::GradientBased(settings) = &self.method {
            if settings.check_adjoint {
                let mismatch = projector.adjoint_mismatch(settings.seed);
                debug!("Adjoint dot-product mismatch: {mismatch:.3e}");
                if mismatch > settings.adjoint_tolerance {
                    return Err(TvamError::AdjointMismatch {
                        mismatch,
                        tolerance: settings.adjoint_tolerance,
                    });
                }
            }
        }

        info!(
            "Optimizing {:?} target over {} angles with {} ({} propagation, {} loss)",
            target.dim(),
            self.scheme.angles().len(),
            self.method.name(),
            self.scheme.name(),
            self.loss.name()
        );
        let start = Instant::now();
        let outcome = match &self.method {
            OptimizationScheme::GradientBased(settings) => {
                let seed = initial_patterns(&projector, &target.data, settings.initialization);
                lbfgs::minimize(
                    &mut projector,
                    &target.data,
                    &self.loss,
                    settings,
                    seed,
                    &self.stop_signal,
                    &mut callback,
                )?
            }
            OptimizationScheme::Osmo(settings) => osmo::run(
                &mut projector,
                &target.data,
                &self.loss,
                settings,
                &self.stop_signal,
                &mut callback,
            )?,
        };
        let elapsed = start.elapsed().as_secs_f64();

        let dose = projector.forward(&outcome.patterns);
        let ver = voxel_error_rate(&target.data, &dose);
        let threshold = best_threshold(&target.data, &dose);
        info!(
            "{} finished ({:?}) after {} iterations in {:.2}s: loss {:.4e} -> {:.4e}, \
             VER {:.4}, threshold {:.3}",
            self.method.name(),
            outcome.termination,
            outcome.iterations,
            elapsed,
            outcome.initial_loss,
            outcome.final_loss,
            ver,
            threshold
        );

        let result = OptimizationResult::new(
            self.method.name(),
            outcome.termination,
            outcome.iterations,
            outcome.evaluations + 1,
            outcome.initial_loss,
            outcome.final_loss,
            outcome.trace,
            elapsed,
            ver,
            threshold,
        );
        Ok((outcome.patterns, dose, result))
    }
}

/// Back-projects `volume` into pattern space and clips the result at zero.
pub(crate) fn project_model<P: Projector>(
    projector: &P,
    volume: &Array3<f32>,
    initialization: Initialization,
) -> Array3<f32> {
    let mut patterns = projector.backproject(volume);
    if initialization == Initialization::FilteredBackprojection {
        apply_ram_lak(&mut patterns);
    }
    patterns.mapv_inplace(|v| v.max(0.0));
    patterns
}

/// Seed patterns whose printed dose peaks at 1.
pub(crate) fn initial_patterns<P: Projector>(
    projector: &P,
    target: &Array3<f32>,
    initialization: Initialization,
) -> Array3<f32> {
    let mut patterns = project_model(projector, target, initialization);
    let dose = projector.forward(&patterns);
    normalize_to_peak(projector, &mut patterns, &dose);
    patterns
}

/// Rescales `patterns` so that `dose`, the dose they printed, would peak at 1.
/// Returns the applied dose scale.
pub(crate) fn normalize_to_peak<P: Projector>(
    projector: &P,
    patterns: &mut Array3<f32>,
    dose: &Array3<f32>,
) -> f32 {
    let peak = dose.iter().fold(0.0f32, |m, &v| m.max(v));
    if peak <= 0.0 {
        return 1.0;
    }
    let scale = peak.powf(-1.0 / projector.dose_exponent() as f32);
    *patterns *= scale;
    1.0 / peak
}
