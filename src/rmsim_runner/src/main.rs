use clap::Parser;
use rmsim_kernel::{BootError, BootOptions, CfgError};
use rmsim_port_std::HostPort;
use std::path::PathBuf;
use thiserror::Error;

mod config;
mod payload;
mod report;

fn main() {
    env_logger::Builder::from_env(
        env_logger::Env::default().default_filter_or("rmsim_runner=info"),
    )
    .init();

    if let Err(e) = main_inner() {
        log::error!("Command failed.\n{:?}", e);
        std::process::exit(1);
    }
}

#[derive(Error, Debug)]
enum MainError {
    #[error("Could not load the task set description '{}'.", .0.display())]
    LoadConfig(PathBuf, #[source] config::ConfigFileError),
    #[error("Could not load the built-in task set description.")]
    LoadBuiltinConfig(#[source] config::ConfigFileError),
    #[error("The task set description is invalid.")]
    BadConfig(#[source] config::ConfigFileError),
    #[error("The task set is invalid.")]
    BadTaskSet(#[source] CfgError),
    #[error("The task set could not be run.")]
    Boot(#[source] BootError),
}

/// Rate-monotonic task set simulator with priority ceiling protected
/// resources
#[derive(Parser)]
#[command(version)]
struct Opt {
    /// Task set description (TOML). The built-in example is used if omitted.
    #[arg(short = 'c', long = "config")]
    config: Option<PathBuf>,
    /// Override the number of jobs run by each task
    #[arg(short = 'n', long = "iterations")]
    iterations: Option<usize>,
    /// Override the number of runs used to measure each task's WCET
    #[arg(long = "profile-reps")]
    profile_reps: Option<usize>,
    /// Override the schedulability test
    #[arg(short = 'p', long = "policy", value_enum)]
    policy: Option<config::Policy>,
    /// Pin the task threads to this CPU
    #[arg(long = "cpu")]
    cpu: Option<usize>,
    /// Print the effective task set description and exit
    #[arg(long = "dump-config")]
    dump_config: bool,
}

fn main_inner() -> anyhow::Result<()> {
    // Parse arguments
    let opt = Opt::parse();

    let mut file = match &opt.config {
        Some(path) => {
            log::debug!("Loading '{}'", path.display());
            config::TaskSetFile::load(path).map_err(|e| MainError::LoadConfig(path.clone(), e))?
        }
        None => config::TaskSetFile::builtin().map_err(MainError::LoadBuiltinConfig)?,
    };

    // Command-line overrides
    if let Some(iterations) = opt.iterations {
        file.override_iterations(iterations);
    }
    if let Some(profile_reps) = opt.profile_reps {
        file.profile_reps = profile_reps;
    }
    if let Some(policy) = opt.policy {
        file.policy = policy;
    }
    if opt.cpu.is_some() {
        file.cpu = opt.cpu;
    }

    // If `--dump-config` is specified, print the description and exit
    if opt.dump_config {
        print!("{}", file.to_toml().map_err(MainError::BadConfig)?);
        return Ok(());
    }

    let prepared = file
        .build()
        .map_err(MainError::BadConfig)?
        .prepare()
        .map_err(MainError::BadTaskSet)?;
    log::debug!("prepared = {:?}", prepared);

    let port = HostPort::new().with_cpu(file.cpu);
    if port.is_realtime() {
        log::info!("Task threads will run with real-time priorities");
    }
    let opts = BootOptions {
        profile_reps: file.profile_reps,
        policy: file.policy.into(),
    };

    let run_report = rmsim_kernel::boot(
        prepared,
        &port,
        &mut report::ConsoleReporter,
        &opts,
    )
    .map_err(MainError::Boot)?;

    // Deadline misses are part of the result, not a failure
    log::info!(
        "Finished with {} missed deadline(s) in total",
        run_report.total_missed_deadlines()
    );

    Ok(())
}
