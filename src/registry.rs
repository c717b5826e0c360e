//! Task registry
//!
//! Owns every task of one invocation, keyed by name, in registration order.
//! Registration is the only mutation point; once execution starts the
//! registry is shared read-only behind an `Arc`.
//!
//! Output paths are compared by [`Registry::output_key`]: relative paths are
//! anchored on the project root before lexical normalization, so `out/x` and
//! `<root>/out/x` name the same file.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use tracing::debug;

use crate::error::{MillError, Result};
use crate::fs::normalize;
use crate::task::{Task, TaskSpec};

#[derive(Debug, Default)]
pub struct Registry {
    root: PathBuf,
    tasks: Vec<Arc<Task>>,
    by_name: HashMap<String, usize>,
    output_owner: HashMap<PathBuf, usize>,
    default: Option<String>,
}

impl Registry {
    /// A registry rooted at the current directory
    pub fn new() -> Self {
        Self::with_root(std::env::current_dir().unwrap_or_default())
    }

    /// A registry whose relative output paths are anchored on `root`
    pub fn with_root(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            ..Self::default()
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Identity of an output path, used for ownership and overlap checks
    pub fn output_key(&self, path: &Path) -> PathBuf {
        normalize(&self.root.join(path))
    }

    /// Register a task, rejecting duplicate names and duplicate output paths
    pub fn register(&mut self, spec: TaskSpec) -> Result<Arc<Task>> {
        if self.by_name.contains_key(spec.name()) {
            return Err(MillError::DuplicateTask {
                name: spec.name().to_string(),
            });
        }

        let task = spec.build()?;

        let mut claimed: Vec<PathBuf> = Vec::new();
        for out in task.all_outputs() {
            let key = self.output_key(out);
            if let Some(&owner) = self.output_owner.get(&key) {
                return Err(MillError::DuplicateOutput {
                    path: out.to_path_buf(),
                    owner: self.tasks[owner].name.clone(),
                    task: task.name.clone(),
                });
            }
            if claimed.contains(&key) {
                return Err(MillError::DuplicateOutput {
                    path: out.to_path_buf(),
                    owner: task.name.clone(),
                    task: task.name.clone(),
                });
            }
            claimed.push(key);
        }

        let index = self.tasks.len();
        for key in claimed {
            self.output_owner.insert(key, index);
        }
        self.by_name.insert(task.name.clone(), index);

        debug!(task = %task.name, index, "registered task");

        let task = Arc::new(task);
        self.tasks.push(Arc::clone(&task));
        Ok(task)
    }

    /// Get a task by name
    pub fn get(&self, name: &str) -> Result<&Arc<Task>> {
        self.by_name
            .get(name)
            .map(|&i| &self.tasks[i])
            .ok_or_else(|| self.unknown(name))
    }

    pub fn contains(&self, name: &str) -> bool {
        self.by_name.contains_key(name)
    }

    /// Registration index of a task, used for deterministic ordering
    pub fn index_of(&self, name: &str) -> Option<usize> {
        self.by_name.get(name).copied()
    }

    /// All tasks in registration order
    pub fn all(&self) -> &[Arc<Task>] {
        &self.tasks
    }

    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }

    /// The task that declares `path` as an output (or touch target)
    pub fn by_output(&self, path: impl AsRef<Path>) -> Option<&Arc<Task>> {
        self.output_owner
            .get(&self.output_key(path.as_ref()))
            .map(|&i| &self.tasks[i])
    }

    /// Look a target up by task name first, then by output path
    pub fn find_target(&self, target: &str) -> Result<&Arc<Task>> {
        self.get(target)
            .or_else(|err| self.by_output(target).ok_or(err))
    }

    /// Set the task to run when no target is given
    pub fn set_default(&mut self, name: impl Into<String>) -> Result<()> {
        let name = name.into();
        if !self.contains(&name) {
            return Err(self.unknown(&name));
        }
        self.default = Some(name);
        Ok(())
    }

    pub fn default_task(&self) -> Option<&str> {
        self.default.as_deref()
    }

    pub(crate) fn unknown(&self, name: &str) -> MillError {
        MillError::UnknownTask {
            name: name.to_string(),
            available: self.tasks.iter().map(|t| t.name.clone()).collect(),
        }
    }
}
