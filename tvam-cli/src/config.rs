//! TOML configuration deserialisation for optimization jobs.

use serde::Deserialize;

/// Top-level job configuration.
#[derive(Debug, Deserialize)]
pub struct JobConfig {
    pub target: TargetConfig,
    pub propagation: PropagationConfig,
    #[serde(default)]
    pub optimizer: OptimizerConfig,
    #[serde(default)]
    pub loss: LossConfig,
    #[serde(default)]
    pub output: OutputConfig,
}

/// Synthetic target shape. Mesh voxelization happens upstream.
#[derive(Debug, Deserialize)]
#[serde(tag = "shape", rename_all = "snake_case")]
pub enum TargetConfig {
    Cylinder {
        /// Voxels across the vial.
        size: usize,
        rows: usize,
        /// Radius as a fraction of the half width.
        #[serde(default = "default_radius")]
        radius: f32,
    },
    Sphere {
        size: usize,
        rows: usize,
        #[serde(default = "default_radius")]
        radius: f32,
    },
}

impl TargetConfig {
    pub fn size(&self) -> usize {
        match self {
            TargetConfig::Cylinder { size, .. } | TargetConfig::Sphere { size, .. } => *size,
        }
    }
}

fn default_radius() -> f32 {
    0.5
}

/// Projection angles: either an evenly spaced count or an explicit list.
#[derive(Debug, Deserialize)]
#[serde(untagged)]
pub enum AngleSpec {
    Uniform { count: usize },
    Degrees { degrees: Vec<f32> },
}

#[derive(Debug, Deserialize)]
#[serde(tag = "scheme", rename_all = "kebab-case")]
pub enum PropagationConfig {
    ParallelRay {
        angles: AngleSpec,
        mu: Option<f32>,
        dmd_diameter: Option<f32>,
    },
    VialRay {
        angles: AngleSpec,
        mu: Option<f32>,
        r_outer: f32,
        r_inner: f32,
        n_vial: f32,
        n_resin: f32,
        dmd_diameter: Option<f32>,
        #[serde(default)]
        polarization: PolarizationConfig,
    },
    Wave {
        angles: AngleSpec,
        mu: Option<f32>,
        /// Wavelength inside the resin.
        wavelength: f32,
        /// Physical width of the simulated field.
        aperture: f32,
        #[serde(default)]
        coherent: bool,
    },
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PolarizationConfig {
    Parallel,
    Perpendicular,
    #[default]
    Expectation,
    Sampled {
        seed: u64,
    },
}

#[derive(Debug, Deserialize)]
#[serde(tag = "method", rename_all = "kebab-case")]
pub enum OptimizerConfig {
    Lbfgs {
        #[serde(default = "default_lbfgs_iterations")]
        iterations: usize,
        #[serde(default = "default_history")]
        history: usize,
        #[serde(default)]
        loss_tolerance: f32,
        /// Seed with a Ram-Lak filtered back-projection.
        #[serde(default)]
        filtered: bool,
        #[serde(default)]
        check_adjoint: bool,
    },
    Osmo {
        #[serde(default = "default_osmo_iterations")]
        iterations: usize,
        #[serde(default = "default_osmo_thresholds")]
        thresholds: [f32; 2],
        #[serde(default)]
        filtered: bool,
    },
}

impl Default for OptimizerConfig {
    fn default() -> Self {
        OptimizerConfig::Lbfgs {
            iterations: default_lbfgs_iterations(),
            history: default_history(),
            loss_tolerance: 0.0,
            filtered: false,
            check_adjoint: false,
        }
    }
}

fn default_lbfgs_iterations() -> usize {
    30
}
fn default_history() -> usize {
    10
}
fn default_osmo_iterations() -> usize {
    10
}
fn default_osmo_thresholds() -> [f32; 2] {
    [0.7, 0.8]
}

#[derive(Debug, Deserialize)]
#[serde(tag = "kind", rename_all = "kebab-case")]
pub enum LossConfig {
    Threshold {
        #[serde(default = "default_loss_thresholds")]
        thresholds: [f32; 2],
        #[serde(default = "default_power")]
        power: i32,
    },
    ThresholdSparsity {
        #[serde(default = "default_loss_thresholds")]
        thresholds: [f32; 2],
        #[serde(default = "default_power")]
        power: i32,
        #[serde(default = "default_sparsity_weight")]
        weight: f32,
    },
    Target {
        #[serde(default = "default_power")]
        power: i32,
    },
}

impl Default for LossConfig {
    fn default() -> Self {
        LossConfig::Threshold {
            thresholds: default_loss_thresholds(),
            power: default_power(),
        }
    }
}

fn default_loss_thresholds() -> [f32; 2] {
    [0.65, 0.75]
}
fn default_power() -> i32 {
    2
}
fn default_sparsity_weight() -> f32 {
    0.01
}

/// Output configuration.
#[derive(Debug, Deserialize)]
pub struct OutputConfig {
    /// Output directory (default: "./output").
    #[serde(default = "default_output_dir")]
    pub directory: String,
}

impl Default for OutputConfig {
    fn default() -> Self {
        Self {
            directory: default_output_dir(),
        }
    }
}

fn default_output_dir() -> String {
    "./output".into()
}

/// Load and parse a TOML job configuration file.
pub fn load_config(path: &std::path::Path) -> anyhow::Result<JobConfig> {
    let content = std::fs::read_to_string(path)?;
    let config: JobConfig = toml::from_str(&content)?;
    Ok(config)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_vial_job() {
        let job: JobConfig = toml::from_str(
            r#"
            [target]
            shape = "sphere"
            size = 64
            rows = 32

            [propagation]
            scheme = "vial-ray"
            angles = { count = 180 }
            mu = 50.0
            r_outer = 6e-3
            r_inner = 5.5e-3
            n_vial = 1.47
            n_resin = 1.48
            polarization = { sampled = { seed = 7 } }

            [optimizer]
            method = "lbfgs"
            iterations = 12

            [loss]
            kind = "threshold-sparsity"
            weight = 0.1
            "#,
        )
        .unwrap();

        assert_eq!(job.target.size(), 64);
        match job.propagation {
            PropagationConfig::VialRay {
                angles: AngleSpec::Uniform { count },
                polarization: PolarizationConfig::Sampled { seed },
                ..
            } => {
                assert_eq!(count, 180);
                assert_eq!(seed, 7);
            }
            other => panic!("unexpected propagation {other:?}"),
        }
        assert!(matches!(
            job.optimizer,
            OptimizerConfig::Lbfgs { iterations: 12, history: 10, .. }
        ));
        assert!(matches!(job.loss, LossConfig::ThresholdSparsity { power: 2, .. }));
        assert_eq!(job.output.directory, "./output");
    }

    #[test]
    fn test_parse_defaults_and_degree_list() {
        let job: JobConfig = toml::from_str(
            r#"
            [target]
            shape = "cylinder"
            size = 32
            rows = 4
            radius = 0.3

            [propagation]
            scheme = "parallel-ray"
            angles = { degrees = [0.0, 45.0, 90.0, 135.0] }
            "#,
        )
        .unwrap();
        assert!(matches!(
            job.propagation,
            PropagationConfig::ParallelRay { angles: AngleSpec::Degrees { .. }, mu: None, .. }
        ));
        assert!(matches!(job.optimizer, OptimizerConfig::Lbfgs { iterations: 30, .. }));
        assert!(matches!(job.loss, LossConfig::Threshold { power: 2, .. }));
    }
}
