use std::path::{Path, PathBuf};

use crate::configuration::BatchConfiguration;
use crate::error::BatchError;

/// The immutable identity of one simulation repetition: which cell, which seed.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RunSpec {
    pub demand: String,
    pub mix: String,
    pub scheme: String,
    /// 0-based within the cell.
    pub run_index: usize,
    /// Always run_index + seed_start, so re-running an index reproduces the same seed.
    pub seed: u64,
}

/// One (demand level, vehicle mix, behaviour scheme) combination, owning a directory of seeded
/// repetitions.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Cell {
    pub demand: String,
    pub mix: String,
    pub scheme: String,
}

impl Cell {
    pub fn dir(&self, results_dir: &Path) -> PathBuf {
        results_dir
            .join(&self.demand)
            .join(&self.mix)
            .join(&self.scheme)
    }

    pub fn describe(&self) -> String {
        format!("{}->{}->{}", self.demand, self.mix, self.scheme)
    }
}

/// A cell together with its runs, in submission order.
pub struct CellPlan {
    pub cell: Cell,
    pub runs: Vec<RunSpec>,
}

pub fn seed_for(run_index: usize, seed_start: u64) -> u64 {
    run_index as u64 + seed_start
}

/// The run_index -> seed assignment for the configured range, for the startup banner.
pub fn seed_map(config: &BatchConfiguration) -> Vec<(usize, u64)> {
    (config.sim_min..config.sim_max)
        .map(|i| (i, seed_for(i, config.seed_start)))
        .collect()
}

/// Enumerates the full parameter grid: demand levels outermost, then mixes, then schemes, then
/// seed indices. The order only matters for directory naming and readable progress output.
pub fn expand_grid(config: &BatchConfiguration) -> Result<Vec<CellPlan>, BatchError> {
    if config.demand_levels.is_empty() {
        return Err(BatchError::Configuration("no demand levels".to_string()));
    }
    if config.vehicle_mixes.is_empty() {
        return Err(BatchError::Configuration("no vehicle mixes".to_string()));
    }
    if config.schemes.is_empty() {
        return Err(BatchError::Configuration("no behaviour schemes".to_string()));
    }
    if config.sim_min >= config.sim_max {
        return Err(BatchError::Configuration(format!(
            "empty seed range [{}, {})",
            config.sim_min, config.sim_max
        )));
    }

    let mut cells = Vec::new();
    for demand in config.demand_levels.keys() {
        for mix in config.vehicle_mixes.keys() {
            for scheme in &config.schemes {
                let cell = Cell {
                    demand: demand.clone(),
                    mix: mix.clone(),
                    scheme: scheme.clone(),
                };
                let runs = (config.sim_min..config.sim_max)
                    .map(|run_index| RunSpec {
                        demand: demand.clone(),
                        mix: mix.clone(),
                        scheme: scheme.clone(),
                        run_index,
                        seed: seed_for(run_index, config.seed_start),
                    })
                    .collect();
                cells.push(CellPlan { cell, runs });
            }
        }
    }
    Ok(cells)
}
