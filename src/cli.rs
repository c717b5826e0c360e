//! CLI command definitions
//!
//! Uses `clap` derive API for argument parsing.

use std::path::PathBuf;

use clap::{Parser, Subcommand, ValueEnum};

/// mill - dependency-driven task runner
#[derive(Parser, Debug)]
#[command(name = "mill")]
#[command(author, version, about, long_about = None)]
#[command(propagate_version = true)]
pub struct Cli {
    /// Path to the task file (default: search upward for Millfile.toml)
    #[arg(short, long, global = true, env = "MILL_FILE")]
    pub file: Option<PathBuf>,

    /// Change to this directory before doing anything
    #[arg(short = 'C', long, global = true)]
    pub directory: Option<PathBuf>,

    /// Run independent tasks in parallel
    #[arg(short, long, global = true)]
    pub parallel: bool,

    /// Number of parallel workers, 0 = number of CPUs (implies --parallel)
    #[arg(short, long, global = true, env = "MILL_JOBS")]
    pub jobs: Option<usize>,

    /// Run tasks even if they are up to date
    #[arg(short = 'B', long, global = true)]
    pub force: bool,

    /// Suppress progress output
    #[arg(short, long, global = true)]
    pub quiet: bool,

    /// Log engine decisions
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// TOML file with a `[task]` section of var values per task
    #[arg(long, global = true, value_name = "FILE")]
    pub vars_file: Option<PathBuf>,

    /// Var override: `task.var=value` or `task={"var": value}` (repeatable)
    #[arg(long = "vars", global = true, value_name = "OVERRIDE")]
    pub vars: Vec<String>,

    /// Disable colored output
    #[arg(long, global = true)]
    pub no_color: bool,

    #[command(subcommand)]
    pub command: Option<Commands>,

    /// Targets to run (shorthand for `mill run <targets>`)
    pub targets: Vec<String>,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Run one or more targets
    Run {
        /// Task names or output paths
        #[arg(required = true)]
        targets: Vec<String>,

        /// Show what would run without running it
        #[arg(long)]
        dry_run: bool,
    },

    /// List available tasks
    List {
        /// Include generated tasks (names containing ':' or '/')
        #[arg(short, long)]
        all: bool,

        /// Output format
        #[arg(long, default_value = "table")]
        format: ListFormat,
    },

    /// Show the dependency graph under a target
    Graph {
        target: String,

        /// Output format
        #[arg(long, default_value = "text")]
        format: GraphFormat,
    },

    /// Show what a target depends on
    Which {
        target: String,

        /// Show what depends on the target instead
        #[arg(long)]
        dependents: bool,
    },

    /// Force a target and everything downstream of it to run again
    Redo {
        target: String,

        /// Only force the target itself
        #[arg(long)]
        only: bool,
    },

    /// Remove the outputs of tasks
    Clean {
        #[arg(required_unless_present = "all")]
        target: Option<String>,

        /// Also clean everything the target depends on
        #[arg(long)]
        up: bool,

        /// Also clean everything that depends on the target
        #[arg(long)]
        down: bool,

        /// Clean every task
        #[arg(long, conflicts_with_all = ["up", "down"])]
        all: bool,

        /// Print what would be removed without removing it
        #[arg(long)]
        dry: bool,
    },

    /// Check the task graph for cycles and missing inputs
    Doctor { target: Option<String> },
}

#[derive(ValueEnum, Clone, Copy, Debug, Default)]
pub enum ListFormat {
    #[default]
    Table,
    Json,
    Plain,
}

#[derive(ValueEnum, Clone, Copy, Debug, Default)]
pub enum GraphFormat {
    #[default]
    Text,
    Dot,
    Json,
}

impl Cli {
    /// Get the effective command, treating bare targets as `run <targets>`
    pub fn effective_command(&self) -> EffectiveCommand<'_> {
        if let Some(cmd) = &self.command {
            EffectiveCommand::Subcommand(cmd)
        } else if !self.targets.is_empty() {
            EffectiveCommand::RunTargets(&self.targets)
        } else {
            EffectiveCommand::Default
        }
    }
}

pub enum EffectiveCommand<'a> {
    Subcommand(&'a Commands),
    RunTargets(&'a [String]),
    /// No command and no target: run the default task or list tasks
    Default,
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_cli_is_well_formed() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_bare_targets() {
        let cli = Cli::try_parse_from(["mill", "-j", "4", "build", "test"]).unwrap();
        assert_eq!(cli.jobs, Some(4));
        assert!(matches!(
            cli.effective_command(),
            EffectiveCommand::RunTargets(t) if t == ["build", "test"]
        ));
    }

    #[test]
    fn test_flags_after_bare_targets() {
        let cli = Cli::try_parse_from(["mill", "greet", "--vars", "greet.name=mill", "-B"]).unwrap();
        assert!(cli.force);
        assert_eq!(cli.vars, vec!["greet.name=mill"]);
        assert_eq!(cli.targets, vec!["greet"]);
    }

    #[test]
    fn test_repeated_vars() {
        let cli = Cli::try_parse_from([
            "mill",
            "run",
            "build",
            "--vars",
            "build.optimize=true",
            "--vars",
            r#"build={"jobs": 2}"#,
        ])
        .unwrap();
        assert_eq!(cli.vars.len(), 2);
        assert!(matches!(
            cli.command,
            Some(Commands::Run { ref targets, dry_run: false }) if targets == &["build"]
        ));
    }

    #[test]
    fn test_clean_needs_target_or_all() {
        assert!(Cli::try_parse_from(["mill", "clean"]).is_err());
        assert!(Cli::try_parse_from(["mill", "clean", "--all"]).is_ok());
        assert!(Cli::try_parse_from(["mill", "clean", "--all", "--up"]).is_err());
    }

    #[test]
    fn test_no_command() {
        let cli = Cli::try_parse_from(["mill", "-B"]).unwrap();
        assert!(cli.force);
        assert!(matches!(cli.effective_command(), EffectiveCommand::Default));
    }
}
