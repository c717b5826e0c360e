//! Task execution engine
//!
//! Runs an [`ExecutionPlan`] either one task at a time or on a bounded pool
//! of blocking workers. Each task goes through the same steps wherever it
//! runs: decide staleness, resolve vars, invoke the body, touch the touch
//! target.
//!
//! There are no timeouts. A body that never returns holds its worker slot
//! until the process is killed.

use std::collections::{BTreeSet, HashMap, HashSet};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use console::style;
use tokio::task::{JoinError, JoinSet};
use tracing::{debug, info, warn};

use crate::error::{BodyError, MillError, Result};
use crate::fs::{FileSystem, RealFs};
use crate::graph::ExecutionPlan;
use crate::registry::Registry;
use crate::staleness::{Decision, SkipReason, Staleness};
use crate::task::Task;
use crate::vars::VarsResolver;

/// Lifecycle state of one task within a run
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TaskState {
    Pending,
    Running,
    Skipped(SkipReason),
    Succeeded,
    Failed,
    /// Never admitted because an earlier task failed
    NotRun,
}

impl TaskState {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, Self::Pending | Self::Running)
    }
}

/// Result of one task
#[derive(Debug)]
pub struct TaskOutcome {
    pub name: String,
    pub state: TaskState,
    pub duration: Duration,
    pub error: Option<MillError>,
}

impl TaskOutcome {
    fn not_run(name: &str) -> Self {
        Self {
            name: name.to_string(),
            state: TaskState::NotRun,
            duration: Duration::ZERO,
            error: None,
        }
    }
}

/// Outcomes of a whole run, in plan order
#[derive(Debug, Default)]
pub struct ExecutionReport {
    outcomes: Vec<TaskOutcome>,
    first_failure: Option<usize>,
    elapsed: Duration,
}

impl ExecutionReport {
    pub fn outcomes(&self) -> &[TaskOutcome] {
        &self.outcomes
    }

    pub fn outcome(&self, name: &str) -> Option<&TaskOutcome> {
        self.outcomes.iter().find(|o| o.name == name)
    }

    pub fn state(&self, name: &str) -> Option<&TaskState> {
        self.outcome(name).map(|o| &o.state)
    }

    /// Names of tasks whose body was invoked and succeeded
    pub fn ran(&self) -> Vec<&str> {
        self.with_state(|s| *s == TaskState::Succeeded)
    }

    pub fn skipped(&self) -> Vec<&str> {
        self.with_state(|s| matches!(s, TaskState::Skipped(_)))
    }

    pub fn not_run(&self) -> Vec<&str> {
        self.with_state(|s| *s == TaskState::NotRun)
    }

    fn with_state(&self, pred: impl Fn(&TaskState) -> bool) -> Vec<&str> {
        self.outcomes
            .iter()
            .filter(|o| pred(&o.state))
            .map(|o| o.name.as_str())
            .collect()
    }

    /// True when no task failed and none was left unrun
    pub fn success(&self) -> bool {
        self.outcomes
            .iter()
            .all(|o| !matches!(o.state, TaskState::Failed | TaskState::NotRun))
    }

    /// Name of the first task that failed, in completion order
    pub fn failed_task(&self) -> Option<&str> {
        self.first_failure.map(|i| self.outcomes[i].name.as_str())
    }

    /// Turn the report into the first failure's error, if any
    pub fn into_result(mut self) -> Result<Self> {
        if let Some(i) = self.first_failure {
            if let Some(err) = self.outcomes[i].error.take() {
                return Err(err);
            }
        }
        Ok(self)
    }

    /// Print the closing line of a run
    pub fn print_summary(&self) {
        let succeeded = self.ran().len();
        let skipped = self.skipped().len();
        let not_run = self.not_run().len();
        let secs = self.elapsed.as_secs_f64();

        match self.failed_task() {
            None => println!(
                "{} {} ran, {} up to date in {:.2}s",
                style("✓").green().bold(),
                succeeded,
                skipped,
                secs
            ),
            Some(task) => println!(
                "{} {} failed; {} ran, {} not run in {:.2}s",
                style("✗").red().bold(),
                style(task).bold(),
                succeeded,
                not_run,
                secs
            ),
        }
    }
}

/// How tasks are dispatched
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum Mode {
    #[default]
    Sequential,
    /// Bounded worker pool; `jobs == 0` uses the available parallelism
    Parallel { jobs: usize },
}

/// Executor configuration
#[derive(Debug, Clone, Default)]
pub struct ExecutorConfig {
    pub mode: Mode,
    /// Run every task regardless of staleness
    pub force: bool,
    /// Run only these tasks regardless of staleness
    pub forced: HashSet<String>,
    /// Suppress `[run]` / `[skip]` progress lines
    pub quiet: bool,
}

/// State a worker needs to execute one task
struct Worker {
    fs: Arc<dyn FileSystem>,
    vars: Arc<VarsResolver>,
    force: bool,
    forced: HashSet<String>,
    quiet: bool,
}

impl Worker {
    fn staleness(&self) -> Staleness<'_> {
        Staleness::new(self.fs.as_ref())
            .force(self.force)
            .forced_tasks(&self.forced)
    }

    fn execute(&self, task: &Task) -> TaskOutcome {
        let start = Instant::now();

        // Run gates are arbitrary code too
        let decision = match catch_unwind(AssertUnwindSafe(|| self.staleness().decide(task))) {
            Ok(decision) => decision,
            Err(payload) => {
                let err = MillError::TaskBody {
                    task: task.name.clone(),
                    source: panic_message("run condition", payload.as_ref()).into(),
                };
                warn!(task = %task.name, error = %err, "task failed");
                return TaskOutcome {
                    name: task.name.clone(),
                    state: TaskState::Failed,
                    duration: start.elapsed(),
                    error: Some(err),
                };
            }
        };

        let (state, error) = match decision {
            Decision::Skip(reason) => {
                debug!(task = %task.name, %reason, "skipping task");
                self.progress("skip", &task.name);
                (TaskState::Skipped(reason), None)
            }
            Decision::Run(reason) => {
                info!(task = %task.name, %reason, "running task");
                self.progress("run", &task.name);
                match self.invoke(task) {
                    Ok(()) => {
                        info!(task = %task.name, elapsed = ?start.elapsed(), "task finished");
                        (TaskState::Succeeded, None)
                    }
                    Err(err) => {
                        warn!(task = %task.name, error = %err, "task failed");
                        (TaskState::Failed, Some(err))
                    }
                }
            }
        };

        TaskOutcome {
            name: task.name.clone(),
            state,
            duration: start.elapsed(),
            error,
        }
    }

    fn invoke(&self, task: &Task) -> Result<()> {
        let vars = self.vars.resolve(task)?;

        let result = catch_unwind(AssertUnwindSafe(|| (task.body)(&vars)))
            .unwrap_or_else(|payload| Err(panic_message("task body", payload.as_ref()).into()));
        result.map_err(|source| MillError::TaskBody {
            task: task.name.clone(),
            source,
        })?;

        if let Some(path) = &task.touch {
            self.fs.touch(path).map_err(|source| MillError::Touch {
                task: task.name.clone(),
                path: path.clone(),
                source,
            })?;
        }

        for out in &task.outputs {
            if !self.fs.exists(out) {
                warn!(task = %task.name, output = %out.display(), "task did not produce its output");
            }
        }

        Ok(())
    }

    fn progress(&self, label: &str, task: &str) {
        if self.quiet {
            return;
        }
        let label = format!("[{}]", label);
        let label = if label == "[run]" {
            style(label).cyan()
        } else {
            style(label).dim()
        };
        println!("{} {}", label, task);
    }
}

fn panic_message(what: &str, payload: &(dyn std::any::Any + Send)) -> String {
    let msg = payload
        .downcast_ref::<&str>()
        .map(|s| s.to_string())
        .or_else(|| payload.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "unknown panic".to_string());
    format!("{} panicked: {}", what, msg)
}

/// Outcome for a task whose worker was cancelled or died before reporting
fn lost(task: &Task, err: JoinError) -> TaskOutcome {
    warn!(task = %task.name, error = %err, "worker lost");
    TaskOutcome {
        name: task.name.clone(),
        state: TaskState::Failed,
        duration: Duration::ZERO,
        error: Some(MillError::TaskBody {
            task: task.name.clone(),
            source: format!("worker lost: {}", err).into(),
        }),
    }
}

/// Task executor
pub struct Executor {
    registry: Arc<Registry>,
    worker: Arc<Worker>,
    mode: Mode,
}

impl Executor {
    pub fn new(registry: Arc<Registry>, vars: VarsResolver, config: ExecutorConfig) -> Self {
        Self::with_fs(registry, vars, config, Arc::new(RealFs))
    }

    pub fn with_fs(
        registry: Arc<Registry>,
        vars: VarsResolver,
        config: ExecutorConfig,
        fs: Arc<dyn FileSystem>,
    ) -> Self {
        Self {
            registry,
            worker: Arc::new(Worker {
                fs,
                vars: Arc::new(vars),
                force: config.force,
                forced: config.forced,
                quiet: config.quiet,
            }),
            mode: config.mode,
        }
    }

    /// Staleness decisions for every task in the plan, without running anything
    pub fn preview(&self, plan: &ExecutionPlan) -> Result<Vec<(String, Decision)>> {
        let staleness = self.worker.staleness();
        plan.names()
            .map(|name| -> Result<(String, Decision)> {
                let task = self.registry.get(name)?;
                Ok((name.to_string(), staleness.decide(task)))
            })
            .collect()
    }

    /// Execute the plan
    pub async fn run(&self, plan: &ExecutionPlan) -> Result<ExecutionReport> {
        self.worker.vars.validate(&self.registry)?;

        let tasks = plan
            .names()
            .map(|name| self.registry.get(name).cloned())
            .collect::<Result<Vec<_>>>()?;

        let start = Instant::now();
        let mut report = match self.mode {
            Mode::Sequential => self.run_sequential(&tasks).await?,
            Mode::Parallel { jobs } => self.run_parallel(plan, &tasks, effective_jobs(jobs)).await?,
        };
        report.elapsed = start.elapsed();

        debug!(
            tasks = tasks.len(),
            ran = report.ran().len(),
            success = report.success(),
            "run finished"
        );
        Ok(report)
    }

    async fn run_sequential(&self, tasks: &[Arc<Task>]) -> Result<ExecutionReport> {
        let mut report = ExecutionReport::default();

        for (i, task) in tasks.iter().enumerate() {
            if report.first_failure.is_some() {
                report.outcomes.push(TaskOutcome::not_run(&task.name));
                continue;
            }

            let worker = Arc::clone(&self.worker);
            let job = Arc::clone(task);
            let outcome = tokio::task::spawn_blocking(move || worker.execute(&job))
                .await
                .unwrap_or_else(|err| lost(task, err));

            if outcome.state == TaskState::Failed {
                report.first_failure = Some(i);
            }
            report.outcomes.push(outcome);
        }

        Ok(report)
    }

    async fn run_parallel(
        &self,
        plan: &ExecutionPlan,
        tasks: &[Arc<Task>],
        jobs: usize,
    ) -> Result<ExecutionReport> {
        let entries = plan.entries();
        let n = tasks.len();

        let mut states = vec![TaskState::Pending; n];
        let mut outcomes: Vec<Option<TaskOutcome>> = (0..n).map(|_| None).collect();
        let mut waiting_on: Vec<usize> = entries.iter().map(|e| e.deps.len()).collect();
        let mut dependents: Vec<Vec<usize>> = vec![Vec::new(); n];
        for (i, entry) in entries.iter().enumerate() {
            for &dep in &entry.deps {
                dependents[dep].push(i);
            }
        }
        let outputs: Vec<HashSet<PathBuf>> = tasks
            .iter()
            .map(|t| t.all_outputs().map(|p| self.registry.output_key(p)).collect())
            .collect();

        // Plan positions, so the lowest eligible position is dispatched first
        let mut ready: BTreeSet<usize> = (0..n).filter(|&i| waiting_on[i] == 0).collect();
        let mut running: Vec<usize> = Vec::new();
        let mut set = JoinSet::new();
        let mut spawned: HashMap<tokio::task::Id, usize> = HashMap::new();
        let mut first_failure = None;

        loop {
            if first_failure.is_none() {
                let admitted: Vec<usize> = {
                    let mut admitted = Vec::new();
                    for &i in &ready {
                        if running.len() + admitted.len() >= jobs {
                            break;
                        }
                        let busy = running
                            .iter()
                            .chain(&admitted)
                            .any(|&r| !outputs[r].is_disjoint(&outputs[i]));
                        if busy {
                            debug!(task = %tasks[i].name, "output set busy, deferring");
                            continue;
                        }
                        admitted.push(i);
                    }
                    admitted
                };

                for i in admitted {
                    ready.remove(&i);
                    running.push(i);
                    states[i] = TaskState::Running;
                    debug!(task = %tasks[i].name, position = i, "dispatching");

                    let worker = Arc::clone(&self.worker);
                    let job = Arc::clone(&tasks[i]);
                    let handle = set.spawn_blocking(move || (i, worker.execute(&job)));
                    spawned.insert(handle.id(), i);
                }
            }

            let Some(joined) = set.join_next().await else {
                break;
            };
            let (i, outcome) = match joined {
                Ok(done) => done,
                Err(err) => match spawned.get(&err.id()) {
                    Some(&i) => (i, lost(&tasks[i], err)),
                    None => return Err(MillError::Io(std::io::Error::other(err.to_string()))),
                },
            };
            running.retain(|&r| r != i);
            states[i] = outcome.state.clone();

            if outcome.state == TaskState::Failed {
                first_failure.get_or_insert(i);
                debug!(task = %tasks[i].name, in_flight = running.len(), "halting admission");
            } else {
                for &d in &dependents[i] {
                    waiting_on[d] -= 1;
                    if waiting_on[d] == 0 && states[d] == TaskState::Pending {
                        ready.insert(d);
                    }
                }
            }
            outcomes[i] = Some(outcome);
        }

        let outcomes = outcomes
            .into_iter()
            .zip(tasks)
            .map(|(outcome, task)| outcome.unwrap_or_else(|| TaskOutcome::not_run(&task.name)))
            .collect();

        Ok(ExecutionReport {
            outcomes,
            first_failure,
            elapsed: Duration::ZERO,
        })
    }
}

fn effective_jobs(jobs: usize) -> usize {
    if jobs > 0 {
        return jobs;
    }
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(4)
}

/// Shorthand for building a body error from a message
pub fn body_error(msg: impl Into<String>) -> BodyError {
    msg.into().into()
}
