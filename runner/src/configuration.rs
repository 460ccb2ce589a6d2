use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::Result;
use serde::Deserialize;

use crate::error::BatchError;

/// Everything a batch needs, resolved once at startup. Components borrow this; nothing mutates
/// it afterwards.
#[derive(Debug)]
pub struct BatchConfiguration {
    pub work_dir: PathBuf,
    /// Top directory receiving one subtree per cell.
    pub results_dir: PathBuf,
    /// Subdirectory of each cell that receives simulator outputs.
    pub output_dir_rel: String,
    /// The static config tree holding all templates.
    pub config_dir: PathBuf,
    pub config_dir_rel: String,
    /// Where SUMO templates live, relative to the cell directory.
    pub sumo_dir_rel: String,

    pub templates: Templates,

    pub schemes: Vec<String>,
    /// Demand label -> vehicles per hour.
    pub demand_levels: BTreeMap<String, f64>,
    /// Demand label -> short id used in generated file names. Labels without an entry use the
    /// label itself.
    pub demand_ids: BTreeMap<String, String>,
    /// Mix label -> (vehicle type -> share of the demand).
    pub vehicle_mixes: BTreeMap<String, BTreeMap<String, f64>>,
    /// Lane count of the scenario; scales per-type insertion probabilities.
    pub lanes: f64,

    pub sim_min: usize,
    pub sim_max: usize,
    pub seed_start: u64,
    /// Total launches allowed per run before giving up.
    pub max_tries: usize,

    pub driver: DriverConfiguration,
    pub mode: ExecutionMode,
    pub gui: bool,
    pub clean: bool,
    pub archive: bool,
    pub times_csv: Option<PathBuf>,
    pub poll_interval: Duration,
    pub ics: Option<IcsConfiguration>,
}

/// Template files, as absolute paths for reading plus config-dir-relative paths for naming the
/// filled copies and for skipping the originals when the static tree is copied into a cell.
#[derive(Debug)]
pub struct Templates {
    pub sumo_config: PathBuf,
    pub routes: PathBuf,
    pub detectors: PathBuf,
    pub additionals: PathBuf,
    pub vtype_dir: PathBuf,
    /// The vType folder name under the SUMO dir, for locating the copy inside a cell.
    pub vtype_dir_rel: String,
    /// vType files that exist per scheme without being templates, named vTypes<x>_<scheme>.add.xml.
    pub non_templated_vtypes: Vec<String>,
    /// Optional net file name substituted into the SUMO config, relative to the cell's SUMO dir.
    pub net_file: Option<String>,
    /// Config-dir-relative paths excluded from the static copy.
    pub excluded_rel: Vec<PathBuf>,
}

/// How to invoke the per-run driver script.
#[derive(Debug)]
pub struct DriverConfiguration {
    pub interpreter: String,
    pub script: PathBuf,
    /// Scenario selector passed to the driver as --<scenario>.
    pub scenario: String,
    pub sumo_home: Option<String>,
}

/// iTETRIS/iCS coupling, when the batch drives the communication simulator instead of calling
/// the driver script directly.
#[derive(Debug)]
pub struct IcsConfiguration {
    pub binary: String,
    pub itetris_template: PathBuf,
    pub ns3_template: PathBuf,
    /// Where the filled iCS configs land, relative to the cell directory.
    pub ns3_dir_rel: String,
    pub lightcomm: bool,
    pub transaid_bin: String,
    pub sumo_lib: String,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ExecutionMode {
    /// Submit a whole cell at once and poll everything.
    Parallel,
    /// Run each task's full retry loop to a terminal state before the next starts.
    Sequential,
}

/// Command-line adjustments applied on top of the settings file.
#[derive(Default)]
pub struct Overrides {
    pub sequential: bool,
    pub gui: bool,
    pub clean: bool,
    pub no_gzip: bool,
    pub sim: Option<(usize, usize)>,
    pub schemes: Vec<String>,
    pub demands: Vec<String>,
    pub mixes: Vec<String>,
}

#[derive(Deserialize)]
struct RawSettings {
    results_dir: String,
    output_dir: String,
    config_dir: String,
    sumo_folder: String,
    sumo_config: String,
    route_template: String,
    detectors: String,
    additionals: String,
    vtype_dir: String,
    #[serde(default)]
    non_templated_vtypes: Vec<String>,
    net_file: Option<String>,

    schemes: Vec<String>,
    demand_levels: BTreeMap<String, f64>,
    #[serde(default)]
    demand_ids: BTreeMap<String, String>,
    vehicle_mixes: BTreeMap<String, BTreeMap<String, f64>>,
    lanes: f64,

    sim_min: usize,
    sim_max: usize,
    seed_start: u64,
    max_tries: usize,

    #[serde(default = "default_interpreter")]
    interpreter: String,
    runner: String,
    scenario: String,
    sumo_home: Option<String>,

    #[serde(default = "default_true")]
    archive: bool,
    times_csv: Option<String>,
    #[serde(default = "default_poll_interval_ms")]
    poll_interval_ms: u64,
    work_dir: Option<String>,

    ics: Option<RawIcsSettings>,
}

#[derive(Deserialize)]
struct RawIcsSettings {
    itetris_config: String,
    ns3_folder: String,
    ns3_config: String,
    #[serde(default = "default_ics_binary")]
    binary: String,
    #[serde(default)]
    lightcomm: bool,
    transaid_bin: String,
    sumo_lib: String,
}

fn default_interpreter() -> String {
    "python3".to_string()
}

fn default_true() -> bool {
    true
}

fn default_poll_interval_ms() -> u64 {
    250
}

fn default_ics_binary() -> String {
    "iCS".to_string()
}

impl BatchConfiguration {
    pub fn load(settings_path: &str, overrides: Overrides) -> Result<BatchConfiguration> {
        let raw: RawSettings = batchutil::read_json(settings_path)?;
        BatchConfiguration::from_raw(raw, overrides).map_err(anyhow::Error::from)
    }

    fn from_raw(mut raw: RawSettings, overrides: Overrides) -> Result<BatchConfiguration, BatchError> {
        restrict("scheme", &mut raw.schemes, &overrides.schemes)?;
        restrict_map("demand level", &mut raw.demand_levels, &overrides.demands)?;
        restrict_map("vehicle mix", &mut raw.vehicle_mixes, &overrides.mixes)?;

        let (sim_min, sim_max) = overrides.sim.unwrap_or((raw.sim_min, raw.sim_max));

        if raw.schemes.is_empty() {
            return Err(BatchError::Configuration("no behaviour schemes".to_string()));
        }
        if raw.demand_levels.is_empty() {
            return Err(BatchError::Configuration("no demand levels".to_string()));
        }
        if raw.vehicle_mixes.is_empty() {
            return Err(BatchError::Configuration("no vehicle mixes".to_string()));
        }
        if sim_min >= sim_max {
            return Err(BatchError::Configuration(format!(
                "empty seed range [{}, {})",
                sim_min, sim_max
            )));
        }
        if raw.max_tries == 0 {
            return Err(BatchError::Configuration(
                "max_tries must be positive".to_string(),
            ));
        }

        let work_dir = match raw.work_dir {
            Some(dir) => PathBuf::from(dir),
            None => std::env::current_dir().map_err(|source| BatchError::Filesystem {
                path: ".".to_string(),
                source,
            })?,
        };
        let config_dir = work_dir.join(&raw.config_dir);
        let sumo_dir_rel = join_rel(&raw.config_dir, &raw.sumo_folder);
        let sumo_dir = config_dir.join(&raw.sumo_folder);

        let mut excluded_rel = vec![
            rel_path(&raw.sumo_folder, &raw.sumo_config),
            rel_path(&raw.sumo_folder, &raw.route_template),
            rel_path(&raw.sumo_folder, &raw.detectors),
            rel_path(&raw.sumo_folder, &raw.additionals),
        ];
        let ics = match raw.ics {
            Some(ics) => {
                excluded_rel.push(PathBuf::from(&ics.itetris_config));
                excluded_rel.push(rel_path(&ics.ns3_folder, &ics.ns3_config));
                Some(IcsConfiguration {
                    binary: ics.binary,
                    itetris_template: config_dir.join(&ics.itetris_config),
                    ns3_template: config_dir.join(&ics.ns3_folder).join(&ics.ns3_config),
                    ns3_dir_rel: join_rel(&raw.config_dir, &ics.ns3_folder),
                    lightcomm: ics.lightcomm,
                    transaid_bin: ics.transaid_bin,
                    sumo_lib: ics.sumo_lib,
                })
            }
            None => None,
        };

        let templates = Templates {
            sumo_config: sumo_dir.join(&raw.sumo_config),
            routes: sumo_dir.join(&raw.route_template),
            detectors: sumo_dir.join(&raw.detectors),
            additionals: sumo_dir.join(&raw.additionals),
            vtype_dir: sumo_dir.join(&raw.vtype_dir),
            vtype_dir_rel: raw.vtype_dir,
            non_templated_vtypes: raw.non_templated_vtypes,
            net_file: raw.net_file,
            excluded_rel,
        };

        let mode = if overrides.sequential || overrides.gui {
            ExecutionMode::Sequential
        } else {
            ExecutionMode::Parallel
        };

        Ok(BatchConfiguration {
            results_dir: work_dir.join(&raw.results_dir),
            output_dir_rel: raw.output_dir,
            config_dir,
            config_dir_rel: raw.config_dir,
            sumo_dir_rel,
            templates,
            schemes: raw.schemes,
            demand_levels: raw.demand_levels,
            demand_ids: raw.demand_ids,
            vehicle_mixes: raw.vehicle_mixes,
            lanes: raw.lanes,
            sim_min,
            sim_max,
            seed_start: raw.seed_start,
            max_tries: raw.max_tries,
            driver: DriverConfiguration {
                interpreter: raw.interpreter,
                script: work_dir.join(&raw.runner),
                scenario: raw.scenario,
                sumo_home: raw.sumo_home.or_else(|| std::env::var("SUMO_HOME").ok()),
            },
            mode,
            gui: overrides.gui,
            clean: overrides.clean,
            archive: raw.archive && !overrides.no_gzip,
            times_csv: raw.times_csv.map(|p| work_dir.join(p)),
            poll_interval: Duration::from_millis(raw.poll_interval_ms),
            ics,
            work_dir,
        })
    }

    /// The short id embedded in file names for a demand label.
    pub fn demand_id<'a>(&'a self, demand: &'a str) -> &'a str {
        self.demand_ids.get(demand).map(|s| s.as_str()).unwrap_or(demand)
    }
}

fn join_rel(base: &str, sub: &str) -> String {
    format!("{}/{}", base.trim_end_matches('/'), sub)
}

fn rel_path(folder: &str, file: &str) -> PathBuf {
    Path::new(folder).join(file)
}



/// Keeps only the requested schemes, erroring on names the settings don't define.
fn restrict(what: &str, full: &mut Vec<String>, requested: &[String]) -> Result<(), BatchError> {
    if requested.is_empty() {
        return Ok(());
    }
    for name in requested {
        if !full.contains(name) {
            return Err(BatchError::Configuration(format!(
                "unknown {} \"{}\"",
                what, name
            )));
        }
    }
    full.retain(|name| requested.contains(name));
    Ok(())
}

fn restrict_map<V>(
    what: &str,
    full: &mut BTreeMap<String, V>,
    requested: &[String],
) -> Result<(), BatchError> {
    if requested.is_empty() {
        return Ok(());
    }
    for name in requested {
        if !full.contains_key(name) {
            return Err(BatchError::Configuration(format!(
                "unknown {} \"{}\"",
                what, name
            )));
        }
    }
    full.retain(|name, _| requested.contains(name));
    Ok(())
}
