use serde::Serialize;

/// Why an optimization run stopped.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TerminationReason {
    /// A stopping criterion was met before the iteration budget ran out.
    Converged,
    BudgetExhausted,
    /// The stop signal was raised between iterations.
    Cancelled,
}

/// Summary of one optimization run.
#[derive(Clone, Debug, Serialize)]
pub struct OptimizationResult {
    method: &'static str,
    termination: TerminationReason,
    iterations: usize,
    evaluations: usize,
    initial_loss: f32,
    final_loss: f32,
    trace: Vec<f32>,
    elapsed_seconds: f64,
    voxel_error_rate: f32,
    best_threshold: f32,
}

impl OptimizationResult {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        method: &'static str,
        termination: TerminationReason,
        iterations: usize,
        evaluations: usize,
        initial_loss: f32,
        final_loss: f32,
        trace: Vec<f32>,
        elapsed_seconds: f64,
        voxel_error_rate: f32,
        best_threshold: f32,
    ) -> Self {
        Self {
            method,
            termination,
            iterations,
            evaluations,
            initial_loss,
            final_loss,
            trace,
            elapsed_seconds,
            voxel_error_rate,
            best_threshold,
        }
    }

    pub fn method(&self) -> &'static str {
        self.method
    }

    pub fn termination(&self) -> TerminationReason {
        self.termination
    }

    pub fn iterations(&self) -> usize {
        self.iterations
    }

    /// Forward propagations spent, line-search trials included.
    pub fn evaluations(&self) -> usize {
        self.evaluations
    }

    pub fn initial_loss(&self) -> f32 {
        self.initial_loss
    }

    pub fn final_loss(&self) -> f32 {
        self.final_loss
    }

    /// Loss after every completed iteration. Empty unless tracing was on.
    pub fn trace(&self) -> &[f32] {
        &self.trace
    }

    pub fn elapsed_seconds(&self) -> f64 {
        self.elapsed_seconds
    }

    pub fn voxel_error_rate(&self) -> f32 {
        self.voxel_error_rate
    }

    /// Dose level that best separates object from void in the final dose.
    pub fn best_threshold(&self) -> f32 {
        self.best_threshold
    }
}
