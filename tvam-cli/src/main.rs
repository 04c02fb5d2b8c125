//! TVAM pattern optimizer command-line interface.
//!
//! ```sh
//! tvam-cli run job.toml --iterations 40 --deadline 120
//! tvam-cli validate job.toml
//! ```

mod config;
mod runner;

use clap::{Parser, Subcommand};
use log::info;
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[command(
    author,
    version,
    about = "Projection pattern optimization for tomographic volumetric printing",
    long_about = None
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Optimize patterns for the job described in a TOML file.
    Run {
        /// Path to the job configuration file.
        config: PathBuf,
        /// Output directory (overrides config file setting).
        #[arg(short, long)]
        output: Option<PathBuf>,
        /// Number of optimization iterations (overrides config file setting).
        #[arg(long)]
        iterations: Option<usize>,
        /// Stop after this many seconds and keep the best patterns so far.
        #[arg(long)]
        deadline: Option<f64>,
    },
    /// Check a configuration file without optimizing.
    Validate {
        /// Path to the job configuration file.
        config: PathBuf,
    },
}

fn main() -> anyhow::Result<()> {
    env_logger::init();
    let cli = Cli::parse();

    match cli.command {
        Commands::Run {
            config,
            output,
            iterations,
            deadline,
        } => {
            let job = config::load_config(&config)?;
            println!("Configuration: {}", config.display());

            let options = runner::RunOptions { iterations, deadline };
            let prepared = runner::prepare(&job, &options)?;
            let angles = prepared.scheme.angles().to_vec();
            println!(
                "Target volume dimensions: {:?} ({} object voxels), scheme: {}, method: {}",
                prepared.target.dim(),
                prepared.target.object_voxels(),
                prepared.scheme.name(),
                prepared.method.name()
            );

            let (patterns, report) = runner::run_job(prepared, &options)?;
            info!("Loss trace: {:?}", report.result.trace());

            let out_dir = output.unwrap_or_else(|| PathBuf::from(&job.output.directory));
            runner::write_patterns_csv(&patterns, &angles, &out_dir.join("patterns.csv"))?;
            runner::write_report(&report, &out_dir.join("result.json"))?;

            println!(
                "Optimization finished ({:?}) after {} iterations. Loss {:.4e} -> {:.4e}",
                report.result.termination(),
                report.result.iterations(),
                report.result.initial_loss(),
                report.result.final_loss()
            );
            println!(
                "VER {:.4}, best threshold {:.3}",
                report.result.voxel_error_rate(),
                report.result.best_threshold()
            );
            println!("Results written to {}", out_dir.display());
            Ok(())
        }
        Commands::Validate { config } => {
            let job = config::load_config(&config)?;
            let prepared = runner::prepare(&job, &runner::RunOptions::default())?;
            println!("Configuration is valid: {}", config.display());
            println!("  Target: {:?}", prepared.target.dim());
            println!(
                "  Scheme: {} ({} angles)",
                prepared.scheme.name(),
                prepared.scheme.angles().len()
            );
            println!("  Method: {}", prepared.method.name());
            println!("  Loss:   {}", prepared.loss.name());
            Ok(())
        }
    }
}
