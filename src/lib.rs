//! taskmill - a dependency-driven task runner
//!
//! This crate provides both the `mill` CLI and a library for declaring and
//! running tasks.
//!
//! # Features
//!
//! - **Make-style staleness** - a task runs when an output is missing or an
//!   input file is newer than its oldest output
//! - **Typed task vars** - defaults, a TOML vars file and `--vars` overrides
//! - **Parallel execution** - a bounded worker pool that respects dependencies
//! - **Rhai scripting** - script bodies and `run_if` conditions
//!
//! # Example
//!
//! ```toml
//! # Millfile.toml
//!
//! [tasks.compile]
//! inputs = ["src/main.c"]
//! outputs = ["build/app"]
//! run = ["cc -O${opt} -o build/app src/main.c"]
//! vars.opt = 2
//!
//! [tasks.package]
//! inputs = ["build/app"]
//! outputs = ["dist/app.tar.gz"]
//! run = ["tar czf dist/app.tar.gz build/app"]
//! ```
//!
//! # Library Usage
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use taskmill::{build_plan, Executor, ExecutorConfig, Registry, TaskSpec, VarsResolver};
//!
//! #[tokio::main]
//! async fn main() -> taskmill::Result<()> {
//!     let mut registry = Registry::new();
//!     registry.register(TaskSpec::new("a", |_| Ok(())).output("out/a"))?;
//!     registry.register(TaskSpec::noop("b").input_file("out/a").output("out/b"))?;
//!
//!     let plan = build_plan(&registry, &["b"])?;
//!     let executor = Executor::new(Arc::new(registry), VarsResolver::default(), ExecutorConfig::default());
//!     executor.run(&plan).await?.into_result()?;
//!     Ok(())
//! }
//! ```

pub mod config;
pub mod doctor;
pub mod error;
pub mod executor;
pub mod fs;
pub mod graph;
pub mod registry;
pub mod script;
pub mod shell;
pub mod staleness;
pub mod task;
pub mod vars;

// Re-export main types
pub use config::Config;
pub use doctor::{Doctor, Issue};
pub use error::{BodyError, MillError, Result};
pub use executor::{ExecutionReport, Executor, ExecutorConfig, Mode, TaskOutcome, TaskState};
pub use fs::{FileSystem, MemoryFs, RealFs};
pub use graph::{build_plan, ExecutionPlan, Subgraph, TaskGraph};
pub use registry::Registry;
pub use script::ScriptEngine;
pub use shell::{sh, ShOptions};
pub use staleness::{Decision, Staleness};
pub use task::{Input, ParamDecl, Task, TaskSpec, TaskVar, VarType, VarValue};
pub use vars::{ResolvedVars, VarsResolver};
