use std::fs::File;
use std::path::Path;
use std::process::{Child, Command, ExitStatus, Stdio};
use std::thread;
use std::time::Duration;

use crate::command::LaunchPlan;
use crate::grid::RunSpec;

/// Lifecycle of one task. Retrying is transient: the pool relaunches as soon as it observes a
/// failed exit with tries left.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TaskState {
    Pending,
    Running,
    Succeeded,
    Retrying,
    FailedTerminal,
}

/// A launchable run bound to its RunSpec. The pool owns the process handle while in flight.
pub struct RunTask {
    pub spec: RunSpec,
    pub plan: LaunchPlan,
    /// Total launches so far, counting the first.
    pub attempts: usize,
    state: TaskState,
    child: Option<Child>,
}

impl RunTask {
    pub fn new(spec: RunSpec, plan: LaunchPlan) -> RunTask {
        RunTask {
            spec,
            plan,
            attempts: 0,
            state: TaskState::Pending,
            child: None,
        }
    }

    pub fn state(&self) -> TaskState {
        self.state
    }
}

/// How one task ended.
pub struct TaskOutcome {
    pub spec: RunSpec,
    pub state: TaskState,
    pub attempts: usize,
}

/// Launches each task as a child process with its output redirected to a per-run log, polls
/// the children without blocking, and restarts failures until the retry cap. Any non-zero exit
/// or refused spawn is the same retryable failure; there's no priority and no concurrency
/// ceiling beyond what the OS schedules.
pub struct ProcessPool {
    max_tries: usize,
    poll_interval: Duration,
    in_flight: Vec<RunTask>,
    finished: Vec<TaskOutcome>,
}

impl ProcessPool {
    pub fn new(max_tries: usize, poll_interval: Duration) -> ProcessPool {
        ProcessPool {
            max_tries,
            poll_interval,
            in_flight: Vec::new(),
            finished: Vec::new(),
        }
    }

    /// Launches the task without waiting for it. The caller gets control back immediately; the
    /// child is watched by later poll() calls.
    pub fn submit(&mut self, mut task: RunTask) {
        self.launch(&mut task);
        if task.state == TaskState::Running {
            self.in_flight.push(task);
        } else {
            self.finish(task);
        }
    }

    /// Checks every running child with a non-blocking status query, handling whatever exited.
    /// Returns how many tasks are still in flight.
    pub fn poll(&mut self) -> usize {
        let mut still_running = Vec::new();
        for mut task in std::mem::take(&mut self.in_flight) {
            let child = task.child.as_mut().unwrap();
            match child.try_wait() {
                Ok(None) => {
                    still_running.push(task);
                }
                Ok(Some(status)) if status.success() => {
                    task.child = None;
                    task.state = TaskState::Succeeded;
                    println!(
                        "Run {} completed... ({}->{}->{})",
                        task.spec.run_index, task.spec.demand, task.spec.mix, task.spec.scheme
                    );
                    self.finish(task);
                }
                Ok(Some(status)) => {
                    task.child = None;
                    self.handle_failure(&mut task, &describe_exit(status));
                    if task.state == TaskState::Running {
                        still_running.push(task);
                    } else {
                        self.finish(task);
                    }
                }
                Err(err) => {
                    task.child = None;
                    let reason = err.to_string();
                    self.handle_failure(&mut task, &reason);
                    if task.state == TaskState::Running {
                        still_running.push(task);
                    } else {
                        self.finish(task);
                    }
                }
            }
        }
        self.in_flight = still_running;
        self.in_flight.len()
    }

    /// Polls at a fixed interval until nothing is in flight.
    pub fn drain(&mut self) {
        while self.poll() > 0 {
            thread::sleep(self.poll_interval);
        }
    }

    pub fn in_flight(&self) -> usize {
        self.in_flight.len()
    }

    pub fn into_outcomes(self) -> Vec<TaskOutcome> {
        self.finished
    }

    /// Spawns until the OS accepts or the cap is hit. Each spawn attempt counts against
    /// max_tries, exactly like a launched-then-failed run.
    fn launch(&self, task: &mut RunTask) {
        loop {
            task.attempts += 1;
            match spawn(&task.plan) {
                Ok(child) => {
                    task.child = Some(child);
                    task.state = TaskState::Running;
                    return;
                }
                Err(err) => {
                    warn!(
                        "Run {} of {}->{}->{} couldn't launch (attempt {}): {}",
                        task.spec.run_index,
                        task.spec.demand,
                        task.spec.mix,
                        task.spec.scheme,
                        task.attempts,
                        err
                    );
                    if task.attempts >= self.max_tries {
                        task.state = TaskState::FailedTerminal;
                        surface_log(&task.plan.log_path);
                        return;
                    }
                    task.state = TaskState::Retrying;
                }
            }
        }
    }

    fn handle_failure(&self, task: &mut RunTask, reason: &str) {
        if task.attempts < self.max_tries {
            println!(
                "Run {} failed with {}. Restarting...",
                task.spec.run_index, reason
            );
            task.state = TaskState::Retrying;
            // Relaunching truncates the log and bumps the attempt count.
            self.launch(task);
        } else {
            println!(
                "Run {} failed with {}. Giving up after {} tries.",
                task.spec.run_index, reason, task.attempts
            );
            task.state = TaskState::FailedTerminal;
            surface_log(&task.plan.log_path);
        }
    }

    fn finish(&mut self, task: RunTask) {
        self.finished.push(TaskOutcome {
            spec: task.spec,
            state: task.state,
            attempts: task.attempts,
        });
    }
}

fn spawn(plan: &LaunchPlan) -> std::io::Result<Child> {
    // Creating the log fresh each launch wipes whatever the previous attempt wrote.
    let log = File::create(&plan.log_path)?;
    let stderr = log.try_clone()?;
    let mut cmd = Command::new(&plan.argv[0]);
    cmd.args(&plan.argv[1..])
        .current_dir(&plan.working_dir)
        .stdout(Stdio::from(log))
        .stderr(Stdio::from(stderr));
    for (key, value) in &plan.env {
        cmd.env(key, value);
    }
    cmd.spawn()
}

fn describe_exit(status: ExitStatus) -> String {
    match status.code() {
        Some(code) => format!("code {}", code),
        None => "a signal".to_string(),
    }
}

/// Prints a dead run's log so the failure is diagnosable without digging through the results
/// tree.
fn surface_log(path: &Path) {
    match fs_err::read_to_string(path) {
        Ok(contents) => {
            for line in contents.lines() {
                println!("  {}", line);
            }
        }
        Err(err) => warn!("Couldn't read back {}: {}", path.display(), err),
    }
}
