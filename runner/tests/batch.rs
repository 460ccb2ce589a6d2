//! Drives a whole small batch against a fake driver script: one cell, three seeded runs, one
//! of which fails on its first attempt.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use walkdir::WalkDir;

use runner::{
    BatchConfiguration, DriverConfiguration, ExecutionMode, TaskState, Templates,
};

fn write(path: PathBuf, contents: &str) {
    fs_err::create_dir_all(path.parent().unwrap()).unwrap();
    fs_err::write(path, contents).unwrap();
}

/// Lays out a config template tree and a /bin/sh driver under `work`. The driver fails run
/// index 1 exactly once (tracked by a marker file next to the script) and succeeds otherwise.
fn setup(work: &Path) -> BatchConfiguration {
    let config_dir = work.join("config");
    let sumo_dir = config_dir.join("sumo");

    write(
        sumo_dir.join("routes.rou.xml"),
        "<routes>\n  <flow id=\"LV\" type=\"{LVtype}\" probability=\"{LVprob}\"/>\n  \
         <flow id=\"CVToC\" type=\"{CVToCtype}\" probability=\"{CVToCprob}\"/>\n  \
         <device.ssm file=\"{outputSSM}\"/>\n</routes>\n",
    );
    write(
        sumo_dir.join("detectors.add.xml"),
        "<additional>\n  <e2Detector file=\"{detectorOutput}\"/>\n</additional>\n",
    );
    write(
        sumo_dir.join("additionalsOutput.add.xml"),
        "<additional>\n  <edgeData file=\"{outputMeandata}\"/>\n  \
         <emissionData file=\"{outputEmission}\"/>\n</additional>\n",
    );
    write(
        sumo_dir.join("sumoConfig.cfg.xml"),
        "<configuration>\n  <seed value=\"{seed}\"/>\n  <route-files value=\"{routesFile}\"/>\n  \
         <additional-files value=\"{detectors},{additionalsOutput},{vTypesToC}\"/>\n  \
         <summary-output value=\"{outputSummary}\"/>\n  <queue-output value=\"{outputQueue}\"/>\n  \
         <tripinfo-output value=\"{outputTripinfos}\"/>\n  \
         <lanechange-output value=\"{outputLaneChanges}\"/>\n  \
         <fcd-output value=\"{fcdTrajectories}\"/>\n</configuration>\n",
    );
    write(
        sumo_dir.join("vTypes").join("vTypesToC_FSP.add.tpl.xml"),
        "<additional>\n  <vType id=\"vehCVToCFSP\" tocFile=\"{tocFile}\"/>\n</additional>\n",
    );
    // A static file that should just be copied along.
    write(config_dir.join("net.net.xml"), "<net/>\n");

    write(
        work.join("fake_driver.sh"),
        "#!/bin/sh\n\
         # args: -v -c <config> --seed <seed> --motorway --info=...\n\
         [ -f \"$3\" ] || exit 9\n\
         seed=$5\n\
         marker=\"$(dirname \"$0\")/marker_$seed\"\n\
         if [ \"$seed\" = \"1\" ] && [ ! -e \"$marker\" ]; then\n\
           touch \"$marker\"\n\
           exit 1\n\
         fi\n\
         exit 0\n",
    );

    let mut mix = BTreeMap::new();
    mix.insert("CVToC".to_string(), 0.4);
    mix.insert("LV".to_string(), 0.6);

    BatchConfiguration {
        results_dir: work.join("results"),
        output_dir_rel: "results".to_string(),
        config_dir: config_dir.clone(),
        config_dir_rel: "config".to_string(),
        sumo_dir_rel: "config/sumo".to_string(),
        templates: Templates {
            sumo_config: sumo_dir.join("sumoConfig.cfg.xml"),
            routes: sumo_dir.join("routes.rou.xml"),
            detectors: sumo_dir.join("detectors.add.xml"),
            additionals: sumo_dir.join("additionalsOutput.add.xml"),
            vtype_dir: sumo_dir.join("vTypes"),
            vtype_dir_rel: "vTypes".to_string(),
            non_templated_vtypes: Vec::new(),
            net_file: None,
            excluded_rel: vec![
                PathBuf::from("sumo/sumoConfig.cfg.xml"),
                PathBuf::from("sumo/routes.rou.xml"),
                PathBuf::from("sumo/detectors.add.xml"),
                PathBuf::from("sumo/additionalsOutput.add.xml"),
            ],
        },
        schemes: vec!["FSP".to_string()],
        demand_levels: vec![("los_B".to_string(), 3600.0)].into_iter().collect(),
        demand_ids: vec![("los_B".to_string(), "1".to_string())]
            .into_iter()
            .collect(),
        vehicle_mixes: vec![("mix_0".to_string(), mix)].into_iter().collect(),
        lanes: 1.0,
        sim_min: 0,
        sim_max: 3,
        seed_start: 0,
        max_tries: 2,
        driver: DriverConfiguration {
            interpreter: "/bin/sh".to_string(),
            script: work.join("fake_driver.sh"),
            scenario: "motorway".to_string(),
            sumo_home: None,
        },
        mode: ExecutionMode::Parallel,
        gui: false,
        clean: false,
        archive: true,
        times_csv: Some(work.join("times/times.csv")),
        poll_interval: Duration::from_millis(10),
        ics: None,
        work_dir: work.to_path_buf(),
    }
}

fn attempts_by_run(report: &runner::BatchReport) -> BTreeMap<usize, (TaskState, usize)> {
    report
        .outcomes
        .iter()
        .map(|outcome| (outcome.spec.run_index, (outcome.state, outcome.attempts)))
        .collect()
}

#[test]
fn one_cell_with_a_flaky_run() {
    let dir = tempfile::tempdir().unwrap();
    let config = setup(dir.path());

    let report = runner::run_batch(&config).unwrap();

    assert_eq!(report.total_runs(), 3);
    assert!(report.skipped.is_empty());
    let outcomes = attempts_by_run(&report);
    assert_eq!(outcomes[&0], (TaskState::Succeeded, 1));
    assert_eq!(outcomes[&1], (TaskState::Succeeded, 2));
    assert_eq!(outcomes[&2], (TaskState::Succeeded, 1));

    // The cell was archived exactly once: everything under it is .gz, nothing double-zipped.
    let cell_dir = dir.path().join("results/los_B/mix_0/FSP");
    let mut saw_any = false;
    for entry in WalkDir::new(&cell_dir).into_iter().filter_map(|e| e.ok()) {
        if !entry.file_type().is_file() {
            continue;
        }
        saw_any = true;
        let name = entry.file_name().to_string_lossy().into_owned();
        assert!(name.ends_with(".gz"), "unarchived file {}", name);
        assert!(!name.ends_with(".gz.gz"), "double-archived file {}", name);
    }
    assert!(saw_any);

    // The static tree was copied in; the filled config carries this run's seed.
    assert!(cell_dir.join("config/net.net.xml.gz").exists());
    assert!(cell_dir
        .join("config/sumo/sumoConfig_TD_1_TM_0_DB_FSP_seed_2.cfg.xml.gz")
        .exists());

    // One timing row plus the header.
    let times = fs_err::read_to_string(dir.path().join("times/times.csv")).unwrap();
    assert_eq!(times.lines().count(), 2);
}

#[test]
fn exhausted_retries_are_reported_not_fatal() {
    let dir = tempfile::tempdir().unwrap();
    let mut config = setup(dir.path());
    config.archive = false;
    config.times_csv = None;
    // A driver that always fails.
    fs_err::write(dir.path().join("fake_driver.sh"), "#!/bin/sh\nexit 3\n").unwrap();

    let report = runner::run_batch(&config).unwrap();

    assert_eq!(report.total_runs(), 3);
    assert_eq!(report.failed().len(), 3);
    for outcome in &report.outcomes {
        assert_eq!(outcome.state, TaskState::FailedTerminal);
        assert_eq!(outcome.attempts, 2);
    }
}

#[test]
fn sequential_mode_reaches_the_same_terminal_states() {
    let dir = tempfile::tempdir().unwrap();
    let mut config = setup(dir.path());
    config.mode = ExecutionMode::Sequential;
    config.archive = false;
    config.times_csv = None;

    let report = runner::run_batch(&config).unwrap();

    let outcomes = attempts_by_run(&report);
    assert_eq!(outcomes[&0], (TaskState::Succeeded, 1));
    assert_eq!(outcomes[&1], (TaskState::Succeeded, 2));
    assert_eq!(outcomes[&2], (TaskState::Succeeded, 1));
    // Sequential preserves submission order.
    let order: Vec<usize> = report
        .outcomes
        .iter()
        .map(|outcome| outcome.spec.run_index)
        .collect();
    assert_eq!(order, vec![0, 1, 2]);
}

#[test]
fn template_failures_skip_only_their_run() {
    let dir = tempfile::tempdir().unwrap();
    let mut config = setup(dir.path());
    config.archive = false;
    config.times_csv = None;
    // Sabotage the detector template with a token nothing substitutes.
    fs_err::write(
        dir.path().join("config/sumo/detectors.add.xml"),
        "<additional><e2Detector file=\"{detectorOutpu}\"/></additional>",
    )
    .unwrap();

    let report = runner::run_batch(&config).unwrap();

    // Every run hits the same broken template, but the batch itself still completes.
    assert_eq!(report.total_runs(), 3);
    assert_eq!(report.skipped.len(), 3);
    assert!(report.skipped[0].1.contains("detectorOutpu"));
}
