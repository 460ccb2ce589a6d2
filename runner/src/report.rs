use std::path::Path;

use anyhow::Result;
use chrono::Local;

use crate::grid::{Cell, RunSpec};
use crate::pool::{TaskOutcome, TaskState};

/// What the whole batch did, collected for the closing summary.
#[derive(Default)]
pub struct BatchReport {
    pub outcomes: Vec<TaskOutcome>,
    /// Runs that never launched because their templates couldn't be materialized, with the
    /// reason.
    pub skipped: Vec<(RunSpec, String)>,
}

impl BatchReport {
    pub fn new() -> BatchReport {
        BatchReport::default()
    }

    pub fn total_runs(&self) -> usize {
        self.outcomes.len() + self.skipped.len()
    }

    pub fn failed(&self) -> Vec<&TaskOutcome> {
        self.outcomes
            .iter()
            .filter(|outcome| outcome.state == TaskState::FailedTerminal)
            .collect()
    }

    /// Prints elapsed time, the run count, and an explicit list of every run that ended failed
    /// or skipped. The batch exits 0 regardless; this list is the only failure signal.
    pub fn print_summary(&self, elapsed_seconds: f64) {
        println!(
            "Elapsed time : {} (for {} runs)",
            batchutil::prettyprint_time(elapsed_seconds),
            batchutil::prettyprint_usize(self.total_runs())
        );

        let failed = self.failed();
        if failed.is_empty() && self.skipped.is_empty() {
            println!("All runs succeeded");
            return;
        }
        for outcome in failed {
            println!(
                "FAILED: run {} of {}->{}->{} after {} tries",
                outcome.spec.run_index,
                outcome.spec.demand,
                outcome.spec.mix,
                outcome.spec.scheme,
                outcome.attempts
            );
        }
        for (spec, reason) in &self.skipped {
            println!(
                "SKIPPED: run {} of {}->{}->{} ({})",
                spec.run_index, spec.demand, spec.mix, spec.scheme, reason
            );
        }
    }
}

/// Appends one timing row per finished cell to a CSV, writing the header when the file is new.
pub struct TimesLog {
    writer: csv::Writer<fs_err::File>,
    results_label: String,
}

impl TimesLog {
    pub fn open(path: &Path, results_label: String) -> Result<TimesLog> {
        if let Some(parent) = path.parent() {
            fs_err::create_dir_all(parent)?;
        }
        let fresh = fs_err::metadata(path).map(|m| m.len() == 0).unwrap_or(true);
        let file = fs_err::OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)?;
        let mut writer = csv::WriterBuilder::new()
            .has_headers(false)
            .from_writer(file);
        if fresh {
            writer.write_record([
                "Results", "Scheme", "Demand", "Mix", "Runs", "Seconds", "Start", "End",
            ])?;
        }
        Ok(TimesLog {
            writer,
            results_label,
        })
    }

    pub fn record(
        &mut self,
        cell: &Cell,
        runs: usize,
        seconds: f64,
        batch_started: &str,
    ) -> Result<()> {
        let runs = runs.to_string();
        let seconds = format!("{:.0}", seconds);
        let end = now_stamp();
        self.writer.write_record([
            self.results_label.as_str(),
            cell.scheme.as_str(),
            cell.demand.as_str(),
            cell.mix.as_str(),
            runs.as_str(),
            seconds.as_str(),
            batch_started,
            end.as_str(),
        ])?;
        self.writer.flush()?;
        Ok(())
    }
}

pub fn now_stamp() -> String {
    Local::now().format("%m/%d/%Y, %H:%M:%S").to_string()
}
