//! Error types for taskmill
//!
//! Uses `miette` for pretty error reporting with help text.

use miette::Diagnostic;
use std::path::PathBuf;
use thiserror::Error;

/// Error type returned from a task body.
pub type BodyError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// Main error type for taskmill operations
#[derive(Error, Diagnostic, Debug)]
pub enum MillError {
    #[error("Task file not found")]
    #[diagnostic(
        code(taskmill::config::not_found),
        help("Create a Millfile.toml in your project root, or specify one with --file")
    )]
    ConfigNotFound { searched: Vec<PathBuf> },

    #[error("Failed to parse {}", path.display())]
    #[diagnostic(code(taskmill::config::parse))]
    ConfigParse {
        #[source]
        source: toml::de::Error,
        path: PathBuf,
    },

    #[error("Invalid task '{task}': {reason}")]
    #[diagnostic(code(taskmill::config::invalid_task))]
    InvalidTask { task: String, reason: String },

    #[error("Unknown task '{name}'")]
    #[diagnostic(
        code(taskmill::task::not_found),
        help("Run `mill list` to see available tasks")
    )]
    UnknownTask { name: String, available: Vec<String> },

    #[error("Task '{name}' is already registered")]
    #[diagnostic(code(taskmill::task::duplicate))]
    DuplicateTask { name: String },

    #[error("Output '{}' of task '{task}' is already produced by task '{owner}'", path.display())]
    #[diagnostic(
        code(taskmill::task::duplicate_output),
        help("Every output file must be owned by exactly one task")
    )]
    DuplicateOutput {
        path: PathBuf,
        owner: String,
        task: String,
    },

    #[error("Circular dependency detected: {}", cycle.join(" -> "))]
    #[diagnostic(
        code(taskmill::task::cycle),
        help("Check the 'depends' and 'inputs' of the tasks in the cycle")
    )]
    CyclicDependency { cycle: Vec<String> },

    #[error("Task '{task}': {reason}")]
    #[diagnostic(code(taskmill::task::schema))]
    Schema { task: String, reason: String },

    #[error("Task '{task}': unknown var '{var}'")]
    #[diagnostic(code(taskmill::vars::unknown))]
    UnknownVar { task: String, var: String },

    #[error("Task '{task}' var '{var}': expected {expected}, got {received}")]
    #[diagnostic(code(taskmill::vars::type_mismatch))]
    VarType {
        task: String,
        var: String,
        expected: String,
        received: String,
    },

    #[error("Invalid --vars entry {entry:?}: {reason}")]
    #[diagnostic(
        code(taskmill::vars::invalid_entry),
        help("Use `task.var=value` or `task=<json object>`")
    )]
    InvalidVarsEntry { entry: String, reason: String },

    #[error("Vars file not found: {}", path.display())]
    #[diagnostic(code(taskmill::vars::file_not_found))]
    VarsFileNotFound { path: PathBuf },

    #[error("Invalid vars file {}: {reason}", path.display())]
    #[diagnostic(code(taskmill::vars::file_parse))]
    VarsFileParse { path: PathBuf, reason: String },

    #[error("Task '{task}' failed")]
    #[diagnostic(code(taskmill::exec::failed))]
    TaskBody {
        task: String,
        #[source]
        source: BodyError,
    },

    #[error("Failed to touch '{}' for task '{task}'", path.display())]
    #[diagnostic(code(taskmill::exec::touch))]
    Touch {
        task: String,
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("{count} problem(s) found in the task graph")]
    #[diagnostic(code(taskmill::doctor))]
    Preflight {
        count: usize,
        #[help]
        details: String,
    },

    #[error("I/O error")]
    #[diagnostic(code(taskmill::io))]
    Io(#[from] std::io::Error),
}

impl MillError {
    /// Name of the task the error is attributed to, if any
    pub fn task(&self) -> Option<&str> {
        match self {
            Self::InvalidTask { task, .. }
            | Self::DuplicateOutput { task, .. }
            | Self::Schema { task, .. }
            | Self::UnknownVar { task, .. }
            | Self::VarType { task, .. }
            | Self::TaskBody { task, .. }
            | Self::Touch { task, .. } => Some(task),
            Self::DuplicateTask { name } => Some(name),
            _ => None,
        }
    }
}

/// Result type alias for taskmill operations
pub type Result<T> = std::result::Result<T, MillError>;
