//! dsim CLI
//!
//! Loads a topology file, runs its check phase, then runs the simulation to
//! completion with every initiator released.

use std::{process, sync::Arc, time::Duration};

use anyhow::{Context, Result};
use clap::Parser;
use dsim::TopologyConfig;
use dsim_engine::{
    AlgorithmFactory, AlgorithmRegistry, LogObserver, Network, NetworkOptions, Topology,
};
use env_logger::Env;

/// Passes of the check phase tried by `--repair` before giving up.
const MAX_REPAIR_PASSES: usize = 8;

/// Command-line arguments for a simulation run
#[derive(Parser, Debug)]
#[command(
    name = "dsim",
    about = "Run a distributed algorithm over a simulated network",
    version = env!("CARGO_PKG_VERSION")
)]
struct Args {
    /// Path to topology configuration file
    #[arg(
        long,
        value_name = "PATH",
        help = "JSON file describing the algorithm, processes and channels"
    )]
    config: String,

    /// Logging level
    #[arg(
        long,
        value_name = "LEVEL",
        default_value = "info",
        help = "Set logging level (error, warn, info, debug, trace)"
    )]
    log_level: String,

    /// Enable verbose output
    #[arg(
        short,
        long,
        help = "Enable verbose logging (equivalent to --log-level=debug)"
    )]
    verbose: bool,

    /// Give up waiting for the run after this many seconds
    #[arg(long, value_name = "SECS", default_value_t = 30)]
    timeout_secs: u64,

    /// Apply every topology correction instead of failing
    #[arg(long)]
    repair: bool,
}

fn main() {
    let args = Args::parse();

    let log_level = if args.verbose {
        "debug"
    } else {
        &args.log_level
    };

    if let Err(e) =
        env_logger::Builder::from_env(Env::default().default_filter_or(log_level)).try_init()
    {
        eprintln!("Failed to initialize logger: {e}");
        process::exit(1);
    }

    if let Err(e) = run(&args) {
        log::error!("Simulation failed: {e}");
        let mut source = e.source();
        while let Some(err) = source {
            log::error!("Caused by: {err}");
            source = err.source();
        }
        process::exit(1);
    }
}

fn run(args: &Args) -> Result<()> {
    let config = TopologyConfig::load_from_file(&args.config)
        .with_context(|| format!("Failed to load configuration from '{}'", args.config))?;

    let registry = AlgorithmRegistry::builtin();
    let factory = registry.resolve(&config.algorithm)?;
    let mut topology = Topology::from_config(&config)?;

    check_topology(&mut topology, factory.as_ref(), args.repair)?;

    let mut network = Network::new(
        topology,
        factory,
        config.params.clone(),
        Arc::new(LogObserver),
        NetworkOptions::from_config(&config),
    )
    .context("Failed to build network")?;

    network.activate().context("Failed to activate network")?;
    let released = network.release_all_initiators();
    log::info!("Released {released} initiator(s)");

    let finished = network.wait_finished(Duration::from_secs(args.timeout_secs));
    for id in network.process_ids() {
        log::info!(
            "p{id}: round {}, {}",
            network.process_round(id)?,
            network.process_status(id)?
        );
    }
    network.shutdown();

    if !finished {
        anyhow::bail!("Run did not finish within {}s", args.timeout_secs);
    }
    Ok(())
}

/// Runs the check phase; with `repair` the corrections are applied, otherwise
/// they are listed and the run is refused.
fn check_topology(topology: &mut Topology, factory: &dyn AlgorithmFactory, repair: bool) -> Result<()> {
    for _ in 0..MAX_REPAIR_PASSES {
        let issues = Network::check(topology, factory);
        if issues.is_empty() {
            return Ok(());
        }
        if !repair {
            for issue in &issues {
                log::error!("{issue} (suggested correction: {})", issue.correction());
            }
            anyhow::bail!(
                "Topology has {} issue(s); rerun with --repair to apply the corrections",
                issues.len()
            );
        }
        for issue in issues {
            let correction = issue.correction();
            log::warn!("{issue}: applying {correction}");
            topology.apply(&correction)?;
        }
    }
    anyhow::bail!("Topology corrections did not converge")
}
