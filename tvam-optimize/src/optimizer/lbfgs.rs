use log::{debug, warn};
use ndarray::{Array3, Zip};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};

use super::{GradientBased, Outcome};
use crate::error::TvamResult;
use crate::loss::LossFunction;
use crate::result::TerminationReason;
use crate::{Projector, dot};

/// Sufficient decrease constant of the Armijo test.
const ARMIJO_C1: f64 = 1e-4;
const MAX_BACKTRACKS: usize = 20;
/// The very first step moves the steepest pixel by this fraction of the
/// brightest pattern value.
const FIRST_STEP_FRACTION: f32 = 0.1;

struct CurvaturePair {
    s: Array3<f32>,
    y: Array3<f32>,
    rho: f32,
}

struct Objective<'a, P> {
    projector: &'a mut P,
    target: &'a Array3<f32>,
    loss: &'a LossFunction,
    evaluations: usize,
}

impl<P: Projector> Objective<'_, P> {
    fn evaluate(&mut self, patterns: &Array3<f32>) -> TvamResult<(f32, Array3<f32>)> {
        self.evaluations += 1;
        self.projector.refresh();
        let dose = self.projector.forward(patterns);
        let (mut value, dose_gradient) = self.loss.evaluate(&dose, self.target)?;
        let mut gradient = self.projector.adjoint(patterns, &dose_gradient);
        if let Some((penalty, penalty_gradient)) = self.loss.pattern_penalty(patterns) {
            value += penalty;
            gradient += &penalty_gradient;
        }
        Ok((value, gradient))
    }
}

/// Gradient with the components that would push a zero pixel negative
/// removed: those pixels are held at the bound.
fn free_gradient(x: &Array3<f32>, g: &Array3<f32>) -> Array3<f32> {
    Zip::from(x)
        .and(g)
        .map_collect(|&x, &g| if x <= 0.0 && g > 0.0 { 0.0 } else { g })
}

/// `-H g` from the two-loop recursion over the stored pairs.
fn two_loop(gradient: &Array3<f32>, history: &VecDeque<CurvaturePair>) -> Array3<f32> {
    let mut q = gradient.clone();
    let mut alphas = Vec::with_capacity(history.len());
    for pair in history.iter().rev() {
        let alpha = pair.rho * dot(&pair.s, &q) as f32;
        q.scaled_add(-alpha, &pair.y);
        alphas.push(alpha);
    }
    if let Some(last) = history.back() {
        let yy = dot(&last.y, &last.y);
        if yy > 0.0 {
            q *= (dot(&last.s, &last.y) / yy) as f32;
        }
    }
    for (pair, alpha) in history.iter().zip(alphas.iter().rev()) {
        let beta = pair.rho * dot(&pair.y, &q) as f32;
        q.scaled_add(alpha - beta, &pair.s);
    }
    q.mapv_inplace(|v| -v);
    q
}

fn steepest_descent(x: &Array3<f32>, free: &Array3<f32>) -> Array3<f32> {
    let g_max = free.iter().fold(0.0f32, |m, &v| m.max(v.abs()));
    if g_max == 0.0 {
        return Array3::zeros(free.raw_dim());
    }
    let x_max = x.iter().fold(0.0f32, |m, &v| m.max(v));
    let reach = if x_max > 0.0 { FIRST_STEP_FRACTION * x_max } else { 1.0 };
    free.mapv(|g| -g * reach / g_max)
}

/// Backtracks along the projected path `max(0, x + t d)` until the Armijo
/// condition holds.
fn line_search<P: Projector>(
    objective: &mut Objective<'_, P>,
    x: &Array3<f32>,
    f: f32,
    g: &Array3<f32>,
    direction: &Array3<f32>,
) -> TvamResult<Option<(Array3<f32>, f32, Array3<f32>)>> {
    let mut step = 1.0f32;
    for _ in 0..MAX_BACKTRACKS {
        let trial = Zip::from(x)
            .and(direction)
            .map_collect(|&x, &d| (x + step * d).max(0.0));
        let moved = &trial - x;
        let decrease = dot(g, &moved);
        if decrease >= 0.0 {
            // Clipping ate the whole step.
            step *= 0.5;
            continue;
        }
        let (f_trial, g_trial) = objective.evaluate(&trial)?;
        if f_trial.is_finite() && (f_trial as f64) <= f as f64 + ARMIJO_C1 * decrease {
            return Ok(Some((trial, f_trial, g_trial)));
        }
        step *= 0.5;
    }
    Ok(None)
}

pub(crate) fn minimize<P: Projector, F: FnMut(usize, f32)>(
    projector: &mut P,
    target: &Array3<f32>,
    loss: &LossFunction,
    settings: &GradientBased,
    mut x: Array3<f32>,
    stop: &AtomicBool,
    callback: &mut F,
) -> TvamResult<Outcome> {
    let mut objective = Objective {
        projector,
        target,
        loss,
        evaluations: 0,
    };
    let (mut f, mut g) = objective.evaluate(&x)?;
    let initial_loss = f;
    let mut best = (f, x.clone());
    let mut history: VecDeque<CurvaturePair> = VecDeque::with_capacity(settings.history);
    let mut trace = Vec::new();
    let mut termination = TerminationReason::BudgetExhausted;
    let mut iterations = 0;

    while iterations < settings.iterations {
        if stop.load(Ordering::Relaxed) {
            termination = TerminationReason::Cancelled;
            break;
        }
        if f == 0.0 {
            debug!("Loss reached zero");
            termination = TerminationReason::Converged;
            break;
        }
        let free = free_gradient(&x, &g);
        let pg_norm = free.iter().fold(0.0f32, |m, &v| m.max(v.abs()));
        if pg_norm <= settings.gradient_tolerance {
            debug!("Projected gradient {pg_norm:.3e} below tolerance");
            termination = TerminationReason::Converged;
            break;
        }

        let mut direction = if history.is_empty() {
            steepest_descent(&x, &free)
        } else {
            let mut d = two_loop(&free, &history);
            Zip::from(&mut d).and(&free).for_each(|d, &g| {
                if g == 0.0 {
                    *d = 0.0;
                }
            });
            if dot(&free, &d) >= 0.0 {
                debug!("Quasi-Newton direction is not a descent direction; resetting history");
                history.clear();
                steepest_descent(&x, &free)
            } else {
                d
            }
        };

        let mut accepted = line_search(&mut objective, &x, f, &g, &direction)?;
        if accepted.is_none() && !history.is_empty() {
            warn!(
                "Line search failed at iteration {}; restarting from steepest descent",
                iterations + 1
            );
            history.clear();
            direction = steepest_descent(&x, &free);
            accepted = line_search(&mut objective, &x, f, &g, &direction)?;
        }
        let Some((x_next, f_next, g_next)) = accepted else {
            warn!("No descent step found at iteration {}", iterations + 1);
            termination = TerminationReason::Converged;
            break;
        };

        let s = &x_next - &x;
        let y = &g_next - &g;
        let sy = dot(&s, &y);
        if sy > 0.0 {
            if history.len() == settings.history {
                history.pop_front();
            }
            history.push_back(CurvaturePair {
                rho: (1.0 / sy) as f32,
                s,
                y,
            });
        }

        let f_prev = f;
        x = x_next;
        f = f_next;
        g = g_next;
        debug_assert!(x.iter().all(|&v| v >= 0.0));
        iterations += 1;

        if settings.store_trace {
            trace.push(f);
        }
        callback(iterations, f);
        debug!("Iteration {iterations}: loss {f:.6e}, {} pairs", history.len());
        if f < best.0 {
            best = (f, x.clone());
        }

        if settings.loss_tolerance > 0.0
            && f_prev > 0.0
            && (f_prev - f) / f_prev <= settings.loss_tolerance
        {
            debug!("Relative loss change below tolerance");
            termination = TerminationReason::Converged;
            break;
        }
    }

    Ok(Outcome {
        patterns: best.1,
        termination,
        iterations,
        evaluations: objective.evaluations,
        initial_loss,
        final_loss: best.0,
        trace,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    use crate::TargetVolume;
    use crate::loss::LossThreshold;
    use crate::optimizer::{Initialization, initial_patterns};
    use crate::ray_projector::RayProjector;
    use crate::scheme::{ParallelRayOptics, uniform_angles};
    use std::cell::Cell;

    /// Records the smallest pixel of every pattern the optimizer evaluates.
    struct Watched<P> {
        inner: P,
        smallest: Cell<f32>,
        calls: Cell<usize>,
    }

    impl<P: Projector> Watched<P> {
        fn new(inner: P) -> Self {
            Self {
                inner,
                smallest: Cell::new(f32::MAX),
                calls: Cell::new(0),
            }
        }

        fn see(&self, patterns: &Array3<f32>) {
            let min = patterns.iter().fold(f32::MAX, |m, &v| m.min(v));
            self.smallest.set(self.smallest.get().min(min));
            self.calls.set(self.calls.get() + 1);
        }
    }

    impl<P: Projector> Projector for Watched<P> {
        fn pattern_dim(&self) -> (usize, usize, usize) {
            self.inner.pattern_dim()
        }

        fn volume_dim(&self) -> (usize, usize, usize) {
            self.inner.volume_dim()
        }

        fn forward(&self, patterns: &Array3<f32>) -> Array3<f32> {
            self.see(patterns);
            self.inner.forward(patterns)
        }

        fn adjoint(&self, patterns: &Array3<f32>, dose_gradient: &Array3<f32>) -> Array3<f32> {
            self.see(patterns);
            self.inner.adjoint(patterns, dose_gradient)
        }

        fn backproject(&self, volume: &Array3<f32>) -> Array3<f32> {
            self.inner.backproject(volume)
        }

        fn dose_exponent(&self) -> i32 {
            self.inner.dose_exponent()
        }

        fn adjoint_mismatch(&self, seed: u64) -> f32 {
            self.inner.adjoint_mismatch(seed)
        }

        fn refresh(&mut self) {
            self.inner.refresh()
        }
    }

    #[test]
    fn test_every_trial_point_stays_non_negative() {
        let target = TargetVolume::cylinder(12, 1, 0.5);
        let optics = ParallelRayOptics::new(uniform_angles(12));
        let mut projector = Watched::new(RayProjector::parallel(&optics, target.dim()));
        let seed = initial_patterns(&projector, &target.data, Initialization::Backprojection);
        let loss = LossFunction::Threshold(LossThreshold::new(0.5, 0.9));
        let settings = GradientBased {
            iterations: 8,
            ..Default::default()
        };

        let outcome = minimize(
            &mut projector,
            &target.data,
            &loss,
            &settings,
            seed,
            &AtomicBool::new(false),
            &mut |_, _| {},
        )
        .unwrap();

        assert!(outcome.iterations >= 1);
        assert!(projector.calls.get() > 2, "only {} evaluations", projector.calls.get());
        assert!(projector.smallest.get() >= 0.0, "trial pixel {}", projector.smallest.get());
        assert!(outcome.patterns.iter().all(|&p| p >= 0.0));
    }

    #[test]
    fn test_free_gradient_holds_pixels_at_bound() {
        let x = Array3::from_shape_vec((3, 1, 1), vec![0.0, 0.0, 1.0]).unwrap();
        let g = Array3::from_shape_vec((3, 1, 1), vec![2.0, -2.0, 2.0]).unwrap();
        let free = free_gradient(&x, &g);
        assert_eq!(free.iter().copied().collect::<Vec<_>>(), vec![0.0, -2.0, 2.0]);
    }

    #[test]
    fn test_two_loop_without_history_is_steepest_descent() {
        let g = Array3::from_shape_vec((2, 1, 1), vec![1.0, -3.0]).unwrap();
        let d = two_loop(&g, &VecDeque::new());
        assert_eq!(d.iter().copied().collect::<Vec<_>>(), vec![-1.0, 3.0]);
    }

    #[test]
    fn test_two_loop_recovers_quadratic_curvature() {
        // f = x^2 / 2 + 2 y^2: one exact pair per axis gives the Newton step.
        let pair = |s: [f32; 2], y: [f32; 2]| {
            let s = Array3::from_shape_vec((2, 1, 1), s.to_vec()).unwrap();
            let y = Array3::from_shape_vec((2, 1, 1), y.to_vec()).unwrap();
            let rho = 1.0 / dot(&s, &y) as f32;
            CurvaturePair { s, y, rho }
        };
        let mut history = VecDeque::new();
        history.push_back(pair([1.0, 0.0], [1.0, 0.0]));
        history.push_back(pair([0.0, 1.0], [0.0, 4.0]));
        let g = Array3::from_shape_vec((2, 1, 1), vec![2.0, 8.0]).unwrap();
        let d = two_loop(&g, &history);
        assert!((d[[0, 0, 0]] + 2.0).abs() < 1e-5);
        assert!((d[[1, 0, 0]] + 2.0).abs() < 1e-5);
    }
}
