use log::debug;
use ndarray::{Array3, Zip};
use std::sync::atomic::{AtomicBool, Ordering};

use super::{Osmo, Outcome, normalize_to_peak, project_model};
use crate::Projector;
use crate::error::TvamResult;
use crate::loss::LossFunction;
use crate::result::TerminationReason;

/// Object-space model optimization.
///
/// The model starts as the target. Each iteration projects it to patterns,
/// prints them, normalizes the dose to a peak of 1, then raises the model on
/// underexposed object voxels and lowers it on overexposed void voxels.
pub(crate) fn run<P: Projector, F: FnMut(usize, f32)>(
    projector: &mut P,
    target: &Array3<f32>,
    loss: &LossFunction,
    settings: &Osmo,
    stop: &AtomicBool,
    callback: &mut F,
) -> TvamResult<Outcome> {
    let (d_l, d_h) = settings.thresholds;
    let mut model = target.clone();
    let mut best: Option<(f32, Array3<f32>)> = None;
    let mut initial_loss = None;
    let mut trace = Vec::with_capacity(settings.iterations);
    let mut termination = TerminationReason::BudgetExhausted;
    let mut iterations = 0;
    let mut evaluations = 0;

    while iterations < settings.iterations {
        if stop.load(Ordering::Relaxed) {
            termination = TerminationReason::Cancelled;
            break;
        }
        projector.refresh();
        let mut patterns = project_model(&*projector, &model, settings.initialization);
        let mut dose = projector.forward(&patterns);
        evaluations += 1;
        let dose_scale = normalize_to_peak(&*projector, &mut patterns, &dose);
        dose *= dose_scale;

        let (mut value, _) = loss.evaluate(&dose, target)?;
        if let Some((penalty, _)) = loss.pattern_penalty(&patterns) {
            value += penalty;
        }
        iterations += 1;
        initial_loss.get_or_insert(value);
        trace.push(value);
        callback(iterations, value);
        debug!("OSMO iteration {iterations}: loss {value:.6e}");
        if best.as_ref().map_or(true, |(f, _)| value < *f) {
            best = Some((value, patterns));
        }

        let mut updated = false;
        Zip::from(&mut model)
            .and(&dose)
            .and(target)
            .for_each(|m, &d, &t| {
                if t > 0.5 {
                    let under = d_h - d;
                    if under > 0.0 {
                        *m += under;
                        updated = true;
                    }
                } else {
                    let over = d - d_l;
                    if over > 0.0 {
                        *m -= over;
                        updated = true;
                    }
                }
            });
        if !updated {
            debug!("Every voxel prints inside the OSMO bands");
            termination = TerminationReason::Converged;
            break;
        }
    }

    let (final_loss, patterns) = match best {
        Some(best) => best,
        // Cancelled before the first iteration: hand back the plain projection.
        None => {
            let mut patterns = project_model(&*projector, &model, settings.initialization);
            let dose = projector.forward(&patterns);
            evaluations += 1;
            let scale = normalize_to_peak(&*projector, &mut patterns, &dose);
            let (value, _) = loss.evaluate(&(dose * scale), target)?;
            (value, patterns)
        }
    };

    Ok(Outcome {
        patterns,
        termination,
        iterations,
        evaluations,
        initial_loss: initial_loss.unwrap_or(final_loss),
        final_loss,
        trace,
    })
}
