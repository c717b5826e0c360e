//! Staleness evaluation
//!
//! Purely timestamp-based, Make style. A task is stale when it is phony, when
//! one of its outputs is missing, or when a file input is newer than the
//! *oldest* output. Run gates are only consulted once the task is stale and
//! can only veto.

use std::collections::HashSet;
use std::fmt;
use std::path::PathBuf;

use crate::fs::FileSystem;
use crate::task::Task;

/// Why a task runs or is skipped
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Decision {
    Run(RunReason),
    Skip(SkipReason),
}

impl Decision {
    pub fn should_run(&self) -> bool {
        matches!(self, Self::Run(_))
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RunReason {
    Forced,
    Phony,
    MissingOutput(PathBuf),
    NewerInput(PathBuf),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SkipReason {
    UpToDate,
    /// `run_if` returned false or `run_if_not` returned true
    Vetoed,
}

impl fmt::Display for RunReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Forced => f.write_str("forced"),
            Self::Phony => f.write_str("phony"),
            Self::MissingOutput(p) => write!(f, "missing output {}", p.display()),
            Self::NewerInput(p) => write!(f, "{} is newer", p.display()),
        }
    }
}

impl fmt::Display for SkipReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::UpToDate => f.write_str("up to date"),
            Self::Vetoed => f.write_str("run condition not met"),
        }
    }
}

/// Decides whether tasks must run against a filesystem snapshot
pub struct Staleness<'a> {
    fs: &'a dyn FileSystem,
    force: bool,
    forced: Option<&'a HashSet<String>>,
}

impl<'a> Staleness<'a> {
    pub fn new(fs: &'a dyn FileSystem) -> Self {
        Self {
            fs,
            force: false,
            forced: None,
        }
    }

    /// Force every task to run
    pub fn force(mut self, force: bool) -> Self {
        self.force = force;
        self
    }

    /// Force only the named tasks
    pub fn forced_tasks(mut self, tasks: &'a HashSet<String>) -> Self {
        self.forced = Some(tasks);
        self
    }

    fn is_forced(&self, task: &Task) -> bool {
        self.force || self.forced.is_some_and(|set| set.contains(&task.name))
    }

    /// Structural check only: force, phony, outputs and input mtimes
    pub fn structural(&self, task: &Task) -> Option<RunReason> {
        if self.is_forced(task) {
            return Some(RunReason::Forced);
        }

        if task.is_phony() {
            return Some(RunReason::Phony);
        }

        let mut oldest_output = None;
        for out in task.all_outputs() {
            match self.fs.modified(out) {
                None => return Some(RunReason::MissingOutput(out.to_path_buf())),
                Some(mtime) => {
                    oldest_output = Some(match oldest_output {
                        Some(oldest) if oldest <= mtime => oldest,
                        _ => mtime,
                    });
                }
            }
        }

        let oldest_output = oldest_output?;
        task.file_inputs()
            .find(|input| {
                self.fs
                    .modified(input)
                    .is_some_and(|mtime| mtime > oldest_output)
            })
            .map(|input| RunReason::NewerInput(input.to_path_buf()))
    }

    /// True if the task must run, run gates included
    pub fn should_run(&self, task: &Task) -> bool {
        self.decide(task).should_run()
    }

    pub fn decide(&self, task: &Task) -> Decision {
        let Some(reason) = self.structural(task) else {
            return Decision::Skip(SkipReason::UpToDate);
        };

        if let Some(gate) = &task.run_if {
            if !gate() {
                return Decision::Skip(SkipReason::Vetoed);
            }
        }
        if let Some(gate) = &task.run_if_not {
            if gate() {
                return Decision::Skip(SkipReason::Vetoed);
            }
        }

        Decision::Run(reason)
    }
}
