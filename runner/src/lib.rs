//! Orchestrates batches of SUMO microsimulation runs over a demand level x vehicle mix x
//! behaviour scheme x seed grid: generates each run's config files from templates, supervises
//! one driver process per run with a bounded retry cap, and gzips each finished cell.
//!
//! Per-run failures never abort siblings or later cells; the batch always runs to the end and
//! the report lists whatever gave up.

#[macro_use]
extern crate log;

use std::time::Instant;

use anyhow::Result;

mod archive;
mod command;
mod configuration;
mod error;
mod grid;
mod materialize;
mod pool;
mod report;

pub use crate::archive::archive_cell;
pub use crate::command::{command_builder, CommandBuilder, DriverCommand, IcsCommand, LaunchPlan};
pub use crate::configuration::{
    BatchConfiguration, DriverConfiguration, ExecutionMode, IcsConfiguration, Overrides,
    Templates,
};
pub use crate::error::BatchError;
pub use crate::grid::{expand_grid, seed_map, Cell, CellPlan, RunSpec};
pub use crate::materialize::{
    copy_static_config, create_cell_dirs, fill_template, materialize_run, plan_paths,
    run_suffix, RunFiles, RunPaths,
};
pub use crate::pool::{ProcessPool, RunTask, TaskOutcome, TaskState};
pub use crate::report::{BatchReport, TimesLog};

pub fn run_batch(config: &BatchConfiguration) -> Result<BatchReport> {
    if config.clean {
        match fs_err::remove_dir_all(&config.results_dir) {
            Ok(()) => println!("Removed previous {}", config.results_dir.display()),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
            Err(err) => warn!("Couldn't clean {}: {}", config.results_dir.display(), err),
        }
    }

    let cells = expand_grid(config)?;
    let builder = command_builder(config);
    let mut times = match &config.times_csv {
        Some(path) => {
            let label = batchutil::basename(config.results_dir.display().to_string());
            Some(TimesLog::open(path, label)?)
        }
        None => None,
    };

    let started = Instant::now();
    let batch_started = report::now_stamp();
    let total_cells = cells.len();
    println!(
        "Total parameter-combinations to be scanned : {}",
        total_cells
    );

    let mut batch_report = BatchReport::new();
    for (done, plan) in cells.iter().enumerate() {
        println!(
            "Demand : {}, Mix : {}, Scheme : {}",
            plan.cell.demand, plan.cell.mix, plan.cell.scheme
        );
        let cell_started = Instant::now();

        if let Err(err) = run_cell(config, builder.as_ref(), plan, &mut batch_report) {
            // Cell-level filesystem trouble; its runs are recorded and the batch moves on.
            error!("Skipping cell {}: {}", plan.cell.describe(), err);
            for spec in &plan.runs {
                if batch_report.skipped.iter().any(|(s, _)| s == spec) {
                    continue;
                }
                batch_report.skipped.push((spec.clone(), err.to_string()));
            }
            continue;
        }

        if config.archive {
            let cell_dir = plan.cell.dir(&config.results_dir);
            println!("Gzipping all files in {}...", cell_dir.display());
            archive_cell(&cell_dir);
        }

        let remaining = total_cells - done - 1;
        if remaining > 0 {
            let per_cell = batchutil::elapsed_seconds(started) / ((done + 1) as f64);
            info!(
                "Estimated time remaining : {:.2} h",
                per_cell * remaining as f64 / 3600.0
            );
        }
        if let Some(times) = &mut times {
            times.record(
                &plan.cell,
                plan.runs.len(),
                batchutil::elapsed_seconds(cell_started),
                &batch_started,
            )?;
        }
    }
    Ok(batch_report)
}

/// Materializes and runs one cell to completion. Only directory-level failures surface as
/// errors; anything per-run lands in the report instead.
fn run_cell(
    config: &BatchConfiguration,
    builder: &dyn CommandBuilder,
    plan: &CellPlan,
    batch_report: &mut BatchReport,
) -> Result<(), BatchError> {
    let cell_dir = create_cell_dirs(config, &plan.cell)?;
    copy_static_config(config, &cell_dir)?;

    let mut tasks = Vec::new();
    for spec in &plan.runs {
        println!("Run : {}, Seed : {}", spec.run_index, spec.seed);
        match materialize_run(config, &cell_dir, spec) {
            Ok(files) => tasks.push(RunTask::new(spec.clone(), builder.build(&files))),
            Err(err @ BatchError::Filesystem { .. }) => return Err(err),
            Err(err) => {
                // Template trouble skips just this run.
                error!(
                    "Run {} of {} skipped: {}",
                    spec.run_index,
                    plan.cell.describe(),
                    err
                );
                batch_report.skipped.push((spec.clone(), err.to_string()));
            }
        }
    }

    let mut pool = ProcessPool::new(config.max_tries, config.poll_interval);
    match config.mode {
        ExecutionMode::Parallel => {
            for task in tasks {
                pool.submit(task);
            }
            println!(
                "Waiting for all simulations for {} to complete...",
                plan.cell.describe()
            );
            pool.drain();
        }
        ExecutionMode::Sequential => {
            // Each task's full retry loop finishes before the next one starts.
            for task in tasks {
                pool.submit(task);
                pool.drain();
            }
        }
    }
    batch_report.outcomes.extend(pool.into_outcomes());
    Ok(())
}
