//! The batch orchestrator binary: reads a JSON settings file, applies command-line overrides,
//! and drives the whole parameter grid of simulation runs.

use std::time::Instant;

use anyhow::{bail, Result};
use structopt::StructOpt;

use runner::{BatchConfiguration, ExecutionMode, Overrides};

#[derive(StructOpt)]
#[structopt(name = "sumo-batch", about = "Batch runner for SUMO scenario studies")]
struct Args {
    /// Path to the JSON settings file
    #[structopt(long, default_value = "settings/batchRunner.json")]
    settings: String,
    /// Run each simulation to completion before starting the next
    #[structopt(long)]
    sequential: bool,
    /// Show the simulator GUI; implies sequential execution
    #[structopt(long)]
    gui: bool,
    /// Remove the previous results tree before starting
    #[structopt(long)]
    clean: bool,
    /// Leave finished cells uncompressed
    #[structopt(long = "no-gzip")]
    no_gzip: bool,
    /// Override the settings' seed range, as "min,max" (max exclusive)
    #[structopt(long, parse(try_from_str = parse_range))]
    sim: Option<(usize, usize)>,
    /// Only run these behaviour schemes
    #[structopt(long)]
    scheme: Vec<String>,
    /// Only run these demand levels
    #[structopt(long)]
    demand: Vec<String>,
    /// Only run these vehicle mixes
    #[structopt(long)]
    mix: Vec<String>,
}

fn parse_range(raw: &str) -> Result<(usize, usize)> {
    let parts: Vec<&str> = raw.split(',').collect();
    if parts.len() != 2 {
        bail!("expected min,max");
    }
    Ok((parts[0].trim().parse()?, parts[1].trim().parse()?))
}

fn main() -> Result<()> {
    batchutil::logger::setup();
    let args = Args::from_args();

    let config = BatchConfiguration::load(
        &args.settings,
        Overrides {
            sequential: args.sequential,
            gui: args.gui,
            clean: args.clean,
            no_gzip: args.no_gzip,
            sim: args.sim,
            schemes: args.scheme,
            demands: args.demand,
            mixes: args.mix,
        },
    )?;

    banner(&config);

    let started = Instant::now();
    let report = runner::run_batch(&config)?;
    report.print_summary(batchutil::elapsed_seconds(started));
    // Partial failure doesn't change the exit code; the summary above is the signal.
    Ok(())
}

fn banner(config: &BatchConfiguration) {
    println!("Schemes : {:?}", config.schemes);
    println!(
        "Demand levels : {:?}",
        config.demand_levels.keys().collect::<Vec<_>>()
    );
    println!(
        "Vehicle mixes : {:?}",
        config.vehicle_mixes.keys().collect::<Vec<_>>()
    );
    println!(
        "Simulation min - max : {}-{}",
        config.sim_min, config.sim_max
    );
    println!("Seed map : {:?}", runner::seed_map(config));
    println!(
        "Sequential : {}",
        config.mode == ExecutionMode::Sequential
    );
    println!("Zip data : {}", config.archive);
    if config.ics.is_some() {
        println!("Coupled via iCS : true");
    }
}
