//! TESSERA CLI
//!
//! Runs the built-in workload on a simulated heterogeneous machine and
//! inspects scheduling policies and calibrated performance models.

#![warn(missing_docs)]
#![warn(clippy::all)]

mod demo;

use clap::{Parser, Subcommand};
use color_eyre::Result;
use color_eyre::eyre::eyre;
use console::style;
use indicatif::{ProgressBar, ProgressStyle};
use std::path::{Path, PathBuf};
use tessera_core::Arch;
use tessera_perf::{ModelSummary, PerfRegistry};
use tessera_runtime::{Runtime, RuntimeConfig};
use tessera_sched::SchedPolicy;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "tessera")]
#[command(about = "TESSERA - task runtime for heterogeneous machines", long_about = None)]
struct Cli {
    /// Print machine-readable JSON instead of text
    #[arg(long, global = true)]
    json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the built-in workload
    Run {
        /// CPU workers (defaults to TESSERA_NCPUS or the core count)
        #[arg(long)]
        cpus: Option<usize>,
        /// Simulated CUDA devices
        #[arg(long, default_value_t = 0)]
        cuda: u32,
        /// Simulated OpenCL devices
        #[arg(long, default_value_t = 0)]
        opencl: u32,
        /// Scheduling policy
        #[arg(short, long)]
        policy: Option<SchedPolicy>,
        /// Vector length in bytes
        #[arg(long, default_value_t = 1 << 20)]
        size: usize,
        /// Number of blocks
        #[arg(long, default_value_t = 64)]
        blocks: usize,
        /// Increment passes over every block
        #[arg(long, default_value_t = 8)]
        iterations: usize,
        /// Directory performance models are loaded from and saved to
        #[arg(long)]
        sampling_dir: Option<PathBuf>,
    },
    /// List scheduling policies
    Policies,
    /// Show the performance models stored in a directory
    Models {
        /// Model directory
        #[arg(short, long)]
        dir: PathBuf,
    },
    /// Print the configuration the environment yields
    Config,
}

fn init_tracing(json: bool) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("tessera=info"));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr);
    if json {
        builder.json().init();
    } else {
        builder.init();
    }
}

fn print_json(value: &impl serde::Serialize) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

fn load_models(dir: &Path) -> Result<Vec<ModelSummary>> {
    if !dir.is_dir() {
        return Err(eyre!("{} is not a directory", dir.display()));
    }
    let registry = PerfRegistry::new(1);
    registry.load(dir)?;
    Ok(registry.summaries())
}

fn run(
    json: bool,
    cpus: Option<usize>,
    cuda: u32,
    opencl: u32,
    policy: Option<SchedPolicy>,
    params: demo::DemoParams,
    sampling_dir: Option<PathBuf>,
) -> Result<()> {
    let mut config = RuntimeConfig::from_env()?;
    if let Some(cpus) = cpus {
        config = config.with_ncpus(cpus);
    }
    for device in 0..cuda {
        config = config.with_accelerator(Arch::Cuda, device);
    }
    for device in 0..opencl {
        config = config.with_accelerator(Arch::OpenCl, device);
    }
    if let Some(policy) = policy {
        config = config.with_policy(policy);
    }
    if let Some(dir) = sampling_dir {
        config = config.with_sampling_dir(dir);
    }

    let rt = Runtime::start(config)?;
    let total = (params.iterations + 1) * params.blocks;
    let progress = if json || !console::Term::stderr().is_term() {
        ProgressBar::hidden()
    } else {
        let bar = ProgressBar::new(total as u64);
        bar.set_style(
            ProgressStyle::with_template("{spinner} [{bar:40}] {pos}/{len} tasks")?
                .progress_chars("=> "),
        );
        bar
    };

    let report = demo::run(&rt, params, &progress)?;
    progress.finish_and_clear();
    rt.shutdown()?;

    if json {
        print_json(&report)?;
    } else {
        println!(
            "{} {} tasks in {:.1} ms with {}",
            style("done").green().bold(),
            report.tasks,
            report.elapsed_ms,
            report.sched.policy
        );
        println!("{}", style("worker  arch    node  processed  drain_us").dim());
        for w in &report.sched.workers {
            println!(
                "{:<7} {:<7} {:<5} {:<10} {:.1}",
                w.worker.to_string(),
                w.arch.to_string(),
                w.memory_node.to_string(),
                w.processed,
                w.exp_end - report.sched.now
            );
        }
        let access = &report.msi.access;
        println!(
            "transfers: {} shared, {} owner, {} direct hits, {} invalidations",
            access.loaded_shared, access.loaded_owner, access.direct_access, access.invalidated
        );
    }

    if !report.is_correct() {
        return Err(eyre!(
            "checksum mismatch: got {}, expected {}",
            report.checksum,
            report.expected
        ));
    }
    Ok(())
}

fn main() -> Result<()> {
    color_eyre::install()?;
    let cli = Cli::parse();
    init_tracing(cli.json);

    match cli.command {
        Commands::Run {
            cpus,
            cuda,
            opencl,
            policy,
            size,
            blocks,
            iterations,
            sampling_dir,
        } => run(
            cli.json,
            cpus,
            cuda,
            opencl,
            policy,
            demo::DemoParams {
                size,
                blocks,
                iterations,
            },
            sampling_dir,
        ),
        Commands::Policies => {
            if cli.json {
                return print_json(&SchedPolicy::ALL);
            }
            for policy in SchedPolicy::ALL {
                println!("{:<6} {}", style(policy.name()).bold(), policy.description());
            }
            Ok(())
        }
        Commands::Models { dir } => {
            let summaries = load_models(&dir)?;
            if cli.json {
                return print_json(&summaries);
            }
            if summaries.is_empty() {
                println!("no models in {}", dir.display());
            }
            for s in summaries {
                let archs: Vec<String> = s.archs.iter().map(ToString::to_string).collect();
                println!(
                    "{:<24} {:>8} samples  {}",
                    style(&s.symbol).bold(),
                    s.samples,
                    archs.join(", ")
                );
            }
            Ok(())
        }
        Commands::Config => print_json(&RuntimeConfig::from_env()?),
    }
}
