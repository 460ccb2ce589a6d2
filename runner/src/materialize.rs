use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use walkdir::WalkDir;

use crate::configuration::BatchConfiguration;
use crate::error::BatchError;
use crate::grid::{Cell, RunSpec};

/// What materialization hands the command builder: the filled configs plus where the driver
/// should execute and log.
pub struct RunFiles {
    pub spec: RunSpec,
    pub run_id: String,
    pub sumo_config: PathBuf,
    pub itetris_config: Option<PathBuf>,
    pub working_dir: PathBuf,
    pub log_path: PathBuf,
}

/// The fixed output/config paths of one run. Every name embeds the run id, so runs in the same
/// cell never collide on a file.
pub struct RunPaths {
    pub routes: PathBuf,
    pub detectors: PathBuf,
    pub additionals: PathBuf,
    pub sumo_config: PathBuf,
    /// Where the detector measurements land, distinct from the filled detector definition.
    pub detector_data: PathBuf,
    pub ssm: PathBuf,
    pub toc: PathBuf,
    pub emission: PathBuf,
    pub meandata: PathBuf,
    pub lane_changes: PathBuf,
    pub summary: PathBuf,
    pub queue: PathBuf,
    pub tripinfo: PathBuf,
    pub trajectories: PathBuf,
    pub log: PathBuf,
}

impl RunPaths {
    pub fn all(&self) -> Vec<&PathBuf> {
        vec![
            &self.routes,
            &self.detectors,
            &self.additionals,
            &self.sumo_config,
            &self.detector_data,
            &self.ssm,
            &self.toc,
            &self.emission,
            &self.meandata,
            &self.lane_changes,
            &self.summary,
            &self.queue,
            &self.tripinfo,
            &self.trajectories,
            &self.log,
        ]
    }
}

/// The suffix labeling all of a run's generated files, identifying its parameter combination.
pub fn run_suffix(config: &BatchConfiguration, spec: &RunSpec) -> String {
    format!(
        "TD_{}_TM_{}_DB_{}_seed_{}",
        config.demand_id(&spec.demand),
        mix_id(&spec.mix),
        spec.scheme,
        spec.run_index
    )
}

/// "mix_0" -> "0"; labels without a trailing number are used as-is.
fn mix_id(mix: &str) -> &str {
    match mix.rfind('_') {
        Some(i) if i + 1 < mix.len() && mix[i + 1..].chars().all(|c| c.is_ascii_digit()) => {
            &mix[i + 1..]
        }
        _ => mix,
    }
}

pub fn plan_paths(config: &BatchConfiguration, cell_dir: &Path, spec: &RunSpec) -> RunPaths {
    let run_id = run_suffix(config, spec);
    let sumo_dir = cell_dir.join(&config.sumo_dir_rel);
    let out_dir = cell_dir.join(&config.output_dir_rel);
    RunPaths {
        routes: sumo_dir.join(format!("routes_{}.rou.xml", run_id)),
        detectors: sumo_dir.join(format!("detectors_{}.add.xml", run_id)),
        additionals: sumo_dir.join(format!("additionalsOutput_{}.add.xml", run_id)),
        sumo_config: sumo_dir.join(format!("sumoConfig_{}.cfg.xml", run_id)),
        detector_data: out_dir.join(format!("detectors_{}.xml", run_id)),
        ssm: out_dir.join(format!("outputSSM_{}.xml", run_id)),
        toc: out_dir.join(format!("output_{}.xml", run_id)),
        emission: out_dir.join(format!("outputEmission_{}.xml", run_id)),
        meandata: out_dir.join(format!("outputMeandata_{}.xml", run_id)),
        lane_changes: out_dir.join(format!("outputLaneChanges_{}.xml", run_id)),
        summary: out_dir.join(format!("outputSummary_{}.xml", run_id)),
        queue: out_dir.join(format!("outputQueue_{}.xml", run_id)),
        tripinfo: out_dir.join(format!("outputTripinfos_{}.xml", run_id)),
        trajectories: out_dir.join(format!("trajectories_{}.xml", run_id)),
        log: out_dir.join(format!("stdout_{}.txt", run_id)),
    }
}

/// Creates the cell's directory tree. Only a real OS error fails; the tree already existing is
/// fine.
pub fn create_cell_dirs(config: &BatchConfiguration, cell: &Cell) -> Result<PathBuf, BatchError> {
    let cell_dir = cell.dir(&config.results_dir);
    let out_dir = cell_dir.join(&config.output_dir_rel);
    fs_err::create_dir_all(&out_dir).map_err(|source| BatchError::Filesystem {
        path: out_dir.display().to_string(),
        source,
    })?;
    Ok(cell_dir)
}

/// Copies the static config tree into the cell, skipping the template files themselves (each
/// run gets its own filled copy). Files already present are left alone.
pub fn copy_static_config(
    config: &BatchConfiguration,
    cell_dir: &Path,
) -> Result<(), BatchError> {
    let target_root = cell_dir.join(&config.config_dir_rel);
    for entry in WalkDir::new(&config.config_dir) {
        let entry = entry.map_err(|err| BatchError::Filesystem {
            path: config.config_dir.display().to_string(),
            source: err.into(),
        })?;
        if !entry.file_type().is_file() {
            continue;
        }
        let rel = entry.path().strip_prefix(&config.config_dir).unwrap();
        if config.templates.excluded_rel.iter().any(|ex| ex == rel) {
            continue;
        }
        let dest = target_root.join(rel);
        if dest.exists() {
            continue;
        }
        if let Some(parent) = dest.parent() {
            fs_err::create_dir_all(parent).map_err(|source| BatchError::Filesystem {
                path: parent.display().to_string(),
                source,
            })?;
        }
        fs_err::copy(entry.path(), &dest).map_err(|source| BatchError::Filesystem {
            path: dest.display().to_string(),
            source,
        })?;
    }
    Ok(())
}

/// Instantiates every template for one run. Isolated per run: all written files embed the run
/// id, so materializing different runs concurrently can't race.
pub fn materialize_run(
    config: &BatchConfiguration,
    cell_dir: &Path,
    spec: &RunSpec,
) -> Result<RunFiles, BatchError> {
    let run_id = run_suffix(config, spec);
    let paths = plan_paths(config, cell_dir, spec);
    let sumo_dir = cell_dir.join(&config.sumo_dir_rel);
    let mix = &config.vehicle_mixes[&spec.mix];
    let demand = config.demand_levels[&spec.demand];

    // Routes: per-type ids and insertion probabilities, plus the SSM output.
    let mut subs = BTreeMap::new();
    for (vtype, share) in mix {
        subs.insert(
            format!("{}type", vtype),
            format!("veh{}{}", vtype, spec.scheme),
        );
        subs.insert(
            format!("{}prob", vtype),
            format!("{}", config.lanes * share * demand / 3600.0),
        );
    }
    subs.insert("outputSSM".to_string(), display(&paths.ssm));
    fill_template(&config.templates.routes, &paths.routes, &subs)?;

    // Behaviour-specific vType templates, each pointed at this run's ToC output.
    let vtype_ids = fill_vtype_templates(config, &sumo_dir, spec, &run_id, &paths.toc)?;

    let mut subs = BTreeMap::new();
    subs.insert("detectorOutput".to_string(), display(&paths.detector_data));
    fill_template(&config.templates.detectors, &paths.detectors, &subs)?;

    let mut subs = BTreeMap::new();
    subs.insert("outputEmission".to_string(), display(&paths.emission));
    subs.insert("outputMeandata".to_string(), display(&paths.meandata));
    fill_template(&config.templates.additionals, &paths.additionals, &subs)?;

    // The main simulator config ties everything together.
    let mut subs = BTreeMap::new();
    subs.insert("outputLaneChanges".to_string(), display(&paths.lane_changes));
    subs.insert("outputSummary".to_string(), display(&paths.summary));
    subs.insert("outputQueue".to_string(), display(&paths.queue));
    subs.insert("outputTripinfos".to_string(), display(&paths.tripinfo));
    subs.insert("fcdTrajectories".to_string(), display(&paths.trajectories));
    subs.insert("additionalsOutput".to_string(), display(&paths.additionals));
    subs.insert("routesFile".to_string(), display(&paths.routes));
    subs.insert("detectors".to_string(), display(&paths.detectors));
    subs.insert("seed".to_string(), spec.seed.to_string());
    for (id, path) in vtype_ids {
        subs.insert(id, path);
    }
    if let Some(net_file) = &config.templates.net_file {
        subs.insert("netFile".to_string(), display(&sumo_dir.join(net_file)));
    }
    fill_template(&config.templates.sumo_config, &paths.sumo_config, &subs)?;

    let itetris_config = match &config.ics {
        Some(ics) => Some(fill_ics_configs(config, ics, cell_dir, &run_id, &paths)?),
        None => None,
    };

    Ok(RunFiles {
        spec: spec.clone(),
        run_id,
        sumo_config: paths.sumo_config,
        itetris_config,
        working_dir: cell_dir.join(&config.config_dir_rel),
        log_path: paths.log,
    })
}

/// Fills every vType template matching the run's scheme, returning (placeholder id, filled
/// path) pairs for the SUMO config. Non-templated per-scheme files are passed through by name.
fn fill_vtype_templates(
    config: &BatchConfiguration,
    sumo_dir: &Path,
    spec: &RunSpec,
    run_id: &str,
    toc_path: &Path,
) -> Result<Vec<(String, String)>, BatchError> {
    let template_suffix = format!("_{}.add.tpl.xml", spec.scheme);
    let vtype_dir = sumo_dir.join(&config.templates.vtype_dir_rel);

    let mut subs = BTreeMap::new();
    subs.insert("tocFile".to_string(), display(toc_path));

    let mut ids = Vec::new();
    let entries = fs_err::read_dir(&vtype_dir).map_err(|source| BatchError::Filesystem {
        path: vtype_dir.display().to_string(),
        source,
    })?;
    for entry in entries {
        let entry = entry.map_err(|source| BatchError::Filesystem {
            path: vtype_dir.display().to_string(),
            source,
        })?;
        let name = entry.file_name().to_string_lossy().into_owned();
        if let Some(stem) = name.strip_suffix(&template_suffix) {
            let filled = vtype_dir.join(format!("{}_{}_{}.add.xml", stem, spec.scheme, run_id));
            fill_template(&entry.path(), &filled, &subs)?;
            ids.push((stem.to_string(), display(&filled)));
        }
    }

    for vt in &config.templates.non_templated_vtypes {
        let id = format!("vTypes{}", vt);
        let path = vtype_dir.join(format!("{}_{}.add.xml", id, spec.scheme));
        ids.push((id, display(&path)));
    }
    Ok(ids)
}

/// iCS runs need the iTETRIS config and the ns-3 technologies file filled as well.
fn fill_ics_configs(
    config: &BatchConfiguration,
    ics: &crate::configuration::IcsConfiguration,
    cell_dir: &Path,
    run_id: &str,
    paths: &RunPaths,
) -> Result<PathBuf, BatchError> {
    let ns3_dir = cell_dir.join(&ics.ns3_dir_rel);
    let itetris_out = ns3_dir.join(format!("itetrisConfig_{}.cfg.xml", run_id));
    let ns3_out = ns3_dir.join(format!("configTechnologies-ics_{}.xml", run_id));

    let sumo_binary = if config.gui { "sumo-gui" } else { "sumo" };
    let comm_binary = if ics.lightcomm { "lightcomm" } else { "main-inci5" };

    let mut subs = BTreeMap::new();
    subs.insert("sumoConfig".to_string(), display(&paths.sumo_config));
    subs.insert("sumoBinary".to_string(), sumo_binary.to_string());
    subs.insert("ns3ConfigTechnologiesFile".to_string(), display(&ns3_out));
    subs.insert("commBinary".to_string(), comm_binary.to_string());
    fill_template(&ics.itetris_template, &itetris_out, &subs)?;

    let mut subs = BTreeMap::new();
    subs.insert(
        "KPIFilePrefix".to_string(),
        format!("../{}/{}", config.output_dir_rel, run_id),
    );
    fill_template(&ics.ns3_template, &ns3_out, &subs)?;

    Ok(itetris_out)
}

/// Reads a template, substitutes every `{placeholder}` exactly, and writes the result. Any
/// placeholder left over is an error naming the token and the template.
pub fn fill_template(
    template: &Path,
    out: &Path,
    subs: &BTreeMap<String, String>,
) -> Result<(), BatchError> {
    let mut text =
        fs_err::read_to_string(template).map_err(|source| BatchError::TemplateRead {
            template: template.display().to_string(),
            source,
        })?;
    for (key, value) in subs {
        text = text.replace(&format!("{{{}}}", key), value);
    }
    if let Some(placeholder) = find_placeholder(&text) {
        return Err(BatchError::UnresolvedPlaceholder {
            template: template.display().to_string(),
            placeholder,
        });
    }
    if let Some(parent) = out.parent() {
        fs_err::create_dir_all(parent).map_err(|source| BatchError::Filesystem {
            path: parent.display().to_string(),
            source,
        })?;
    }
    fs_err::write(out, text).map_err(|source| BatchError::Filesystem {
        path: out.display().to_string(),
        source,
    })
}

/// Finds the first `{identifier}` token still present after substitution.
fn find_placeholder(text: &str) -> Option<String> {
    let mut search_from = 0;
    while let Some(offset) = text[search_from..].find('{') {
        let start = search_from + offset;
        let rest = &text[start + 1..];
        let mut len = 0;
        for c in rest.chars() {
            let valid = c.is_ascii_alphabetic() || c == '_' || (len > 0 && c.is_ascii_digit());
            if !valid {
                break;
            }
            len += 1;
        }
        if len > 0 && rest[len..].starts_with('}') {
            return Some(rest[..len].to_string());
        }
        search_from = start + 1;
    }
    None
}

fn display(path: &Path) -> String {
    path.display().to_string()
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeSet;

    use super::*;
    use crate::configuration::test_fixtures::minimal_config;
    use crate::grid::expand_grid;

    #[test]
    fn run_suffix_embeds_all_parameters() {
        let config = minimal_config();
        let spec = RunSpec {
            demand: "los_B".to_string(),
            mix: "mix_0".to_string(),
            scheme: "FSP".to_string(),
            run_index: 4,
            seed: 4,
        };
        assert_eq!(run_suffix(&config, &spec), "TD_1_TM_0_DB_FSP_seed_4");
    }

    #[test]
    fn mix_labels_shorten_to_trailing_number() {
        assert_eq!(mix_id("mix_0"), "0");
        assert_eq!(mix_id("mix_12"), "12");
        assert_eq!(mix_id("urban"), "urban");
        assert_eq!(mix_id("mix_"), "mix_");
    }

    #[test]
    fn planned_paths_are_disjoint_across_runs() {
        let config = minimal_config();
        let cells = expand_grid(&config).unwrap();
        let plan = &cells[0];
        let cell_dir = plan.cell.dir(&config.results_dir);

        let mut seen: BTreeSet<PathBuf> = BTreeSet::new();
        for spec in &plan.runs {
            for path in plan_paths(&config, &cell_dir, spec).all() {
                assert!(seen.insert(path.clone()), "collision on {:?}", path);
            }
        }
    }

    #[test]
    fn template_filling_substitutes_exact_tokens() {
        let dir = tempfile::tempdir().unwrap();
        let template = dir.path().join("routes.rou.xml");
        fs_err::write(&template, "<flow prob=\"{LVprob}\" type=\"{LVtype}\"/>").unwrap();

        let out = dir.path().join("filled.xml");
        let mut subs = BTreeMap::new();
        subs.insert("LVprob".to_string(), "0.25".to_string());
        subs.insert("LVtype".to_string(), "vehLVFSP".to_string());
        fill_template(&template, &out, &subs).unwrap();

        assert_eq!(
            fs_err::read_to_string(&out).unwrap(),
            "<flow prob=\"0.25\" type=\"vehLVFSP\"/>"
        );
    }

    #[test]
    fn unresolved_placeholder_names_token_and_template() {
        let dir = tempfile::tempdir().unwrap();
        let template = dir.path().join("detectors.add.xml");
        fs_err::write(&template, "<e2Detector file=\"{detectorOutput}\"/>").unwrap();

        let err = fill_template(&template, &dir.path().join("out.xml"), &BTreeMap::new())
            .unwrap_err();
        match err {
            BatchError::UnresolvedPlaceholder {
                template: t,
                placeholder,
            } => {
                assert_eq!(placeholder, "detectorOutput");
                assert!(t.ends_with("detectors.add.xml"));
            }
            other => panic!("wrong error: {}", other),
        }
    }

    #[test]
    fn braces_without_identifiers_are_not_placeholders() {
        assert_eq!(find_placeholder("plain text"), None);
        assert_eq!(find_placeholder("json-ish {} braces {123}"), None);
        assert_eq!(
            find_placeholder("a {_token2} here"),
            Some("_token2".to_string())
        );
    }
}
