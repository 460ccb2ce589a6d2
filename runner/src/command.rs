use std::path::PathBuf;

use crate::configuration::BatchConfiguration;
use crate::materialize::RunFiles;

/// Everything the pool needs to spawn one attempt of a run.
pub struct LaunchPlan {
    pub argv: Vec<String>,
    pub env: Vec<(String, String)>,
    pub working_dir: PathBuf,
    pub log_path: PathBuf,
}

/// Turns a materialized run into a launchable command line. One implementation is picked at
/// batch start, so nothing downstream branches on the simulator coupling.
pub trait CommandBuilder {
    fn build(&self, files: &RunFiles) -> LaunchPlan;
}

pub fn command_builder(config: &BatchConfiguration) -> Box<dyn CommandBuilder> {
    match &config.ics {
        Some(ics) => Box::new(IcsCommand {
            binary: ics.binary.clone(),
            sumo_home: config.driver.sumo_home.clone(),
            transaid_bin: ics.transaid_bin.clone(),
            sumo_lib: ics.sumo_lib.clone(),
        }),
        None => Box::new(DriverCommand {
            interpreter: config.driver.interpreter.clone(),
            script: config.driver.script.clone(),
            scenario: config.driver.scenario.clone(),
            sumo_home: config.driver.sumo_home.clone(),
            gui: config.gui,
        }),
    }
}

/// Invokes the per-run driver script directly on the generated SUMO config.
pub struct DriverCommand {
    pub interpreter: String,
    pub script: PathBuf,
    pub scenario: String,
    pub sumo_home: Option<String>,
    pub gui: bool,
}

impl CommandBuilder for DriverCommand {
    fn build(&self, files: &RunFiles) -> LaunchPlan {
        let mut argv = vec![
            self.interpreter.clone(),
            self.script.display().to_string(),
            "-v".to_string(),
            "-c".to_string(),
            files.sumo_config.display().to_string(),
            "--seed".to_string(),
            files.spec.seed.to_string(),
        ];
        if self.gui {
            argv.push("--gui".to_string());
        }
        argv.push(format!("--{}", self.scenario));
        argv.push(format!(
            "--info=Run_{}->{}->{}->{}",
            files.spec.run_index, files.spec.demand, files.spec.mix, files.spec.scheme
        ));

        let mut env = Vec::new();
        if let Some(home) = &self.sumo_home {
            env.push(("SUMO_HOME".to_string(), home.clone()));
        }

        LaunchPlan {
            argv,
            env,
            working_dir: files.working_dir.clone(),
            log_path: files.log_path.clone(),
        }
    }
}

/// Invokes the iCS coupling binary, which starts SUMO and ns-3 itself from the iTETRIS config.
pub struct IcsCommand {
    pub binary: String,
    pub sumo_home: Option<String>,
    pub transaid_bin: String,
    pub sumo_lib: String,
}

impl CommandBuilder for IcsCommand {
    fn build(&self, files: &RunFiles) -> LaunchPlan {
        let itetris_config = files
            .itetris_config
            .as_ref()
            .expect("iCS runs always materialize an iTETRIS config");
        let argv = vec![
            self.binary.clone(),
            "-c".to_string(),
            itetris_config.display().to_string(),
        ];

        let mut env = vec![
            ("PATH".to_string(), self.transaid_bin.clone()),
            ("LD_LIBRARY_PATH".to_string(), self.sumo_lib.clone()),
        ];
        if let Some(home) = &self.sumo_home {
            env.push(("SUMO_HOME".to_string(), home.clone()));
        }

        LaunchPlan {
            argv,
            env,
            working_dir: files.working_dir.clone(),
            log_path: files.log_path.clone(),
        }
    }
}
