use std::path::PathBuf;
use std::time::Instant;
use anyhow::{Context, Result};
use clap::{ArgAction, Parser};
use tracing::{info, Level};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};
use netcachelib::config::{Mode, NetworkConfig, SimulationOptions};
use netcachelib::simulator::NetworkSimulator;

#[cfg(debug_assertions)]
const DEBUG_DEFAULT: bool = true;

#[cfg(not(debug_assertions))]
const DEBUG_DEFAULT: bool = false;

#[derive(Parser, Debug)]
#[command(about = String::from("In-network cache warm-up simulator"))]
struct Args {
    /// The JSON network description
    config: PathBuf,

    /// no-cache, no-color, tag-color, or the name of a colored mode
    #[arg(short, long, default_value = "no-color")]
    mode: Mode,

    /// Cache sizes in cache router declaration order, comma separated. Defaults to each router's maxSize
    #[arg(short, long, value_delimiter = ',')]
    capacities: Option<Vec<f64>>,

    #[arg(long, default_value_t = 0)]
    run_index: usize,

    #[arg(long, default_value_t = 0)]
    seed: u64,

    /// Synthetic requests issued by each client during warm-up
    #[arg(short, long, default_value_t = 1000)]
    warm_up_requests: usize,

    /// Colors to distribute across the caches, comma separated
    #[arg(long, value_delimiter = ',')]
    colors: Option<Vec<u32>>,

    /// Where cache snapshots and the nearest-color table are written
    #[arg(short, long)]
    snapshot_dir: Option<PathBuf>,

    #[arg(short, long)]
    performance: bool,

    #[arg(short, long, default_value_t = DEBUG_DEFAULT)]
    debug: bool,

    /// Emit logs as JSON lines
    #[arg(long)]
    log_json: bool,

    /// Raise the log level, repeat for more detail
    #[arg(short, long, action = ArgAction::Count)]
    verbose: u8,
}

fn init_logging(args: &Args) {
    let level = match args.verbose {
        0 => Level::WARN,
        1 => Level::INFO,
        2 => Level::DEBUG,
        _ => Level::TRACE,
    };
    let filter = EnvFilter::from_default_env().add_directive(level.into());
    // Logs go to stderr, stdout carries the metrics
    if args.log_json {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().json().with_writer(std::io::stderr))
            .init();
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().with_target(true).with_writer(std::io::stderr))
            .init();
    }
}

fn main() -> Result<()> {
    let start = Instant::now();
    let args = Args::parse();
    init_logging(&args);

    let config = NetworkConfig::from_path(&args.config)?;
    let options = SimulationOptions {
        mode: args.mode.clone(),
        warm_up_requests: args.warm_up_requests,
        colors: args.colors.clone(),
        seed: args.seed,
        snapshot_dir: args.snapshot_dir.clone(),
    };
    let mut simulator = NetworkSimulator::new(&config, options).context("Couldn't build the simulated network")?;
    let capacities = args.capacities.clone().unwrap_or_else(|| simulator.topology().default_capacities());
    info!(?capacities, "starting run {}", args.run_index);
    let report = simulator
        .reconfig(&capacities, args.run_index)
        .with_context(|| format!("Run {} failed", args.run_index))?;

    println!("{}", serde_json::to_string_pretty(&simulator.metrics()).context("Couldn't serialise the output")?);
    if args.performance {
        let end = Instant::now();
        let simulation_time = simulator.get_execution_time();
        let total_time = end - start;
        println!("Simulation time: {}s", simulation_time.as_nanos() as f64 / 1e9);
        println!("Total execution time (includes initial parsing, configuration, and output): {}s", total_time.as_nanos() as f64 / 1e9)
    }
    if args.debug {
        #[cfg(debug_assertions)]
        println!("Running the debug binary, debug mode is enabled by default. If benchmarking, do not use this binary, re-compile with the --release argument when using cargo run");
        println!("Warm-up report: {report:?}");
        if let Some(coloring) = simulator.coloring() {
            let formatted = coloring
                .server_colors
                .iter()
                .map(|(server, color)| format!("{}: {color}", simulator.topology().id(*server)))
                .reduce(|a, b| format!("{a}, {b}"))
                .unwrap_or_default();
            println!("Server colors: ({formatted})");
        }
        if !report.is_complete() {
            println!("Clients left cold: {}", report.unreachable.join(", "));
        }
    }
    Ok(())
}
