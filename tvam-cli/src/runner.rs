//! Job runner: turns a parsed configuration into a pattern optimization.

use std::path::Path;
use std::sync::atomic::Ordering;
use std::thread;
use std::time::Duration;

use anyhow::{Context, Result};
use indicatif::{ProgressBar, ProgressStyle};
use log::info;
use ndarray::Array3;
use serde::Serialize;

use tvam_optimize::{
    GradientBased, Initialization, LossFunction, LossTarget, LossThreshold, LossThresholdSparsity,
    OptimizationResult, OptimizationScheme, Osmo, ParallelRayOptics, PatternOptimizer, Polarization,
    PropagationScheme, RandomPolarization, TargetVolume, VialGeometry, VialRayOptics, WaveOptics,
    uniform_angles,
};

use crate::config::{
    AngleSpec, JobConfig, LossConfig, OptimizerConfig, PolarizationConfig, PropagationConfig,
    TargetConfig,
};

/// Command-line overrides of the job file.
#[derive(Debug, Default)]
pub struct RunOptions {
    pub iterations: Option<usize>,
    /// Seconds after which the optimizer is asked to stop.
    pub deadline: Option<f64>,
}

/// Everything written to `result.json`.
#[derive(Debug, Serialize)]
pub struct RunReport {
    pub scheme: &'static str,
    pub loss: &'static str,
    pub target_dim: [usize; 3],
    pub pattern_dim: [usize; 3],
    pub object_voxels: usize,
    pub peak_pattern: f32,
    pub result: OptimizationResult,
}

/// A validated job, ready to optimize.
pub struct Job {
    pub target: TargetVolume,
    pub scheme: PropagationScheme,
    pub method: OptimizationScheme,
    pub loss: LossFunction,
}

fn angles(selection: &AngleSpec) -> Vec<f32> {
    match selection {
        AngleSpec::Uniform { count } => uniform_angles(*count),
        AngleSpec::Degrees { degrees } => degrees.iter().map(|d| d.to_radians()).collect(),
    }
}

fn build_target(config: &TargetConfig) -> TargetVolume {
    match *config {
        TargetConfig::Cylinder { size, rows, radius } => TargetVolume::cylinder(size, rows, radius),
        TargetConfig::Sphere { size, rows, radius } => TargetVolume::sphere(size, rows, radius),
    }
}

fn build_scheme(config: &PropagationConfig, size: usize) -> PropagationScheme {
    match config {
        PropagationConfig::ParallelRay {
            angles: selection,
            mu,
            dmd_diameter,
        } => PropagationScheme::ParallelRay(ParallelRayOptics {
            angles: angles(selection),
            mu: *mu,
            dmd_diameter: *dmd_diameter,
        }),
        PropagationConfig::VialRay {
            angles: selection,
            mu,
            r_outer,
            r_inner,
            n_vial,
            n_resin,
            dmd_diameter,
            polarization,
        } => PropagationScheme::VialRay(VialRayOptics {
            angles: angles(selection),
            mu: *mu,
            geometry: VialGeometry::new(*r_outer, *r_inner, *n_vial, *n_resin),
            dmd_diameter: *dmd_diameter,
            polarization: match polarization {
                PolarizationConfig::Parallel => Polarization::Parallel,
                PolarizationConfig::Perpendicular => Polarization::Perpendicular,
                PolarizationConfig::Expectation => {
                    Polarization::Random(RandomPolarization::Expectation)
                }
                PolarizationConfig::Sampled { seed } => {
                    Polarization::Random(RandomPolarization::Sampled { seed: *seed })
                }
            },
        }),
        PropagationConfig::Wave {
            angles: selection,
            mu,
            wavelength,
            aperture,
            coherent,
        } => {
            let mut optics = WaveOptics::centered(angles(selection), *wavelength, *aperture, size)
                .with_coherent(*coherent);
            optics.mu = *mu;
            PropagationScheme::Wave(optics)
        }
    }
}

fn initialization(filtered: bool) -> Initialization {
    if filtered {
        Initialization::FilteredBackprojection
    } else {
        Initialization::Backprojection
    }
}

fn build_method(config: &OptimizerConfig, iterations: Option<usize>) -> OptimizationScheme {
    match *config {
        OptimizerConfig::Lbfgs {
            iterations: configured,
            history,
            loss_tolerance,
            filtered,
            check_adjoint,
        } => OptimizationScheme::GradientBased(GradientBased {
            iterations: iterations.unwrap_or(configured),
            history,
            loss_tolerance,
            check_adjoint,
            initialization: initialization(filtered),
            ..Default::default()
        }),
        OptimizerConfig::Osmo {
            iterations: configured,
            thresholds,
            filtered,
        } => OptimizationScheme::Osmo(Osmo {
            iterations: iterations.unwrap_or(configured),
            thresholds: (thresholds[0], thresholds[1]),
            initialization: initialization(filtered),
        }),
    }
}

fn build_loss(config: &LossConfig) -> LossFunction {
    match *config {
        LossConfig::Threshold { thresholds, power } => LossFunction::Threshold(LossThreshold {
            thresholds: (thresholds[0], thresholds[1]),
            power,
        }),
        LossConfig::ThresholdSparsity {
            thresholds,
            power,
            weight,
        } => LossFunction::ThresholdSparsity(LossThresholdSparsity {
            threshold: LossThreshold {
                thresholds: (thresholds[0], thresholds[1]),
                power,
            },
            weight,
        }),
        LossConfig::Target { power } => LossFunction::Target(LossTarget { power }),
    }
}

/// Builds the library objects of a job and checks them without optimizing.
pub fn prepare(config: &JobConfig, options: &RunOptions) -> Result<Job> {
    let target = build_target(&config.target);
    let scheme = build_scheme(&config.propagation, config.target.size());
    let method = build_method(&config.optimizer, options.iterations);
    let loss = build_loss(&config.loss);

    scheme.validate().context("Invalid propagation settings")?;
    method.validate().context("Invalid optimizer settings")?;
    loss.validate().context("Invalid loss settings")?;
    scheme
        .build(target.dim())
        .with_context(|| format!("Propagation scheme does not fit a {:?} target", target.dim()))?;
    if target.object_voxels() == 0 {
        anyhow::bail!("Target volume {:?} contains no object voxels", target.dim());
    }

    Ok(Job {
        target,
        scheme,
        method,
        loss,
    })
}

/// Runs the optimization with a progress bar, honouring the deadline.
pub fn run_job(job: Job, options: &RunOptions) -> Result<(Array3<f32>, RunReport)> {
    let Job {
        target,
        scheme,
        method,
        loss,
    } = job;
    let scheme_name = scheme.name();
    let loss_name = loss.name();
    let iterations = match &method {
        OptimizationScheme::GradientBased(s) => s.iterations,
        OptimizationScheme::Osmo(s) => s.iterations,
    };
    let optimizer = PatternOptimizer::new(scheme, method, loss);

    if let Some(seconds) = options.deadline {
        let stop_signal = optimizer.stop_signal();
        thread::spawn(move || {
            thread::sleep(Duration::from_secs_f64(seconds));
            info!("Deadline of {seconds}s reached; stopping at the next iteration");
            stop_signal.store(true, Ordering::Relaxed);
        });
    }

    let pb_opt = ProgressBar::new(iterations as u64);
    pb_opt.set_style(
        ProgressStyle::default_bar().template(
            "{spinner:.green} [{elapsed_precise}] [{bar:40.yellow/red}] {pos}/{len} iterations \
             (loss: {msg})",
        )?,
    );

    let (patterns, _, result) = optimizer
        .run_with_callback(&target, |iter, value| {
            pb_opt.set_position(iter as u64);
            pb_opt.set_message(format!("{:.4e}", value));
        })
        .context("Optimization failed")?;
    pb_opt.finish_with_message(format!("{:?}", result.termination()));

    let (nr, na, nz) = patterns.dim();
    let (tx, ty, tz) = target.dim();
    let report = RunReport {
        scheme: scheme_name,
        loss: loss_name,
        target_dim: [tx, ty, tz],
        pattern_dim: [nr, na, nz],
        object_voxels: target.object_voxels(),
        peak_pattern: patterns.iter().fold(0.0f32, |m, &v| m.max(v)),
        result,
    };
    Ok((patterns, report))
}

pub fn write_report(report: &RunReport, path: &Path) -> Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("Failed to create output directory {}", parent.display()))?;
    }
    let json = serde_json::to_string_pretty(report)?;
    std::fs::write(path, json).with_context(|| format!("Failed to write {}", path.display()))?;
    Ok(())
}

/// One line per pixel: `angle_deg,row,pixel,intensity`.
pub fn write_patterns_csv(patterns: &Array3<f32>, angles: &[f32], path: &Path) -> Result<()> {
    use std::io::{BufWriter, Write};

    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let mut file = BufWriter::new(std::fs::File::create(path)?);

    let (nr, na, nz) = patterns.dim();
    writeln!(file, "# TVAM projection patterns")?;
    writeln!(file, "# Version: {}", env!("CARGO_PKG_VERSION"))?;
    writeln!(file, "# pixels: {nr}, angles: {na}, rows: {nz}")?;
    writeln!(file, "angle_deg,row,pixel,intensity")?;
    for (a, &theta) in angles.iter().enumerate().take(na) {
        for k in 0..nz {
            for r in 0..nr {
                let value = patterns[[r, a, k]];
                writeln!(file, "{:.4},{},{},{:.6e}", theta.to_degrees(), k, r, value)?;
            }
        }
    }
    file.flush()?;
    Ok(())
}
