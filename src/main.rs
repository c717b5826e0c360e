//! mill - dependency-driven task runner
//!
//! Loads a Millfile.toml, plans the requested targets and runs whatever is
//! stale.

use std::collections::HashSet;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use clap::Parser;
use console::style;

mod cli;

use cli::{Cli, Commands, EffectiveCommand, GraphFormat, ListFormat};
use taskmill::config::Settings;
use taskmill::{
    build_plan, Config, Decision, Doctor, Executor, ExecutorConfig, MillError, Mode, RealFs,
    Registry, Result, TaskGraph, VarsResolver,
};

#[tokio::main]
async fn main() -> ExitCode {
    miette::set_panic_hook();

    let cli = Cli::parse();

    let level = if cli.verbose {
        tracing::Level::DEBUG
    } else {
        tracing::Level::WARN
    };
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env().add_directive(level.into()),
        )
        .with_writer(std::io::stderr)
        .without_time()
        .init();

    if cli.no_color {
        console::set_colors_enabled(false);
        console::set_colors_enabled_stderr(false);
    }

    match run(cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("{:?}", miette::Report::new(e));
            ExitCode::FAILURE
        }
    }
}

/// A loaded task file
struct Project {
    registry: Arc<Registry>,
    settings: Settings,
}

impl Project {
    fn load(cli: &Cli) -> Result<Self> {
        let (config, _) = Config::load(cli.file.as_deref())?;
        let settings = config.settings.clone();
        let registry = config.into_registry()?;
        Ok(Self {
            registry: Arc::new(registry),
            settings,
        })
    }

    /// Map targets (task names or output paths) to task names
    fn resolve_targets(&self, targets: &[String]) -> Result<Vec<String>> {
        targets
            .iter()
            .map(|t| self.registry.find_target(t).map(|task| task.name.clone()))
            .collect()
    }

    fn executor(&self, cli: &Cli, forced: HashSet<String>) -> Result<Executor> {
        let vars = VarsResolver::from_sources(cli.vars_file.as_deref(), &cli.vars)?;

        let parallel = cli.parallel || cli.jobs.is_some() || self.settings.parallel;
        let mode = if parallel {
            Mode::Parallel {
                jobs: cli.jobs.or(self.settings.jobs).unwrap_or(0),
            }
        } else {
            Mode::Sequential
        };

        let config = ExecutorConfig {
            mode,
            force: cli.force,
            forced,
            quiet: cli.quiet,
        };
        Ok(Executor::new(Arc::clone(&self.registry), vars, config))
    }
}

async fn run(cli: Cli) -> Result<()> {
    if let Some(dir) = &cli.directory {
        std::env::set_current_dir(dir)?;
    }

    match cli.effective_command() {
        EffectiveCommand::Subcommand(cmd) => run_command(cmd, &cli).await,
        EffectiveCommand::RunTargets(targets) => {
            let project = Project::load(&cli)?;
            run_targets(&project, &cli, targets, false).await
        }
        EffectiveCommand::Default => {
            let project = Project::load(&cli)?;
            match project.registry.default_task() {
                Some(default) => {
                    let targets = [default.to_string()];
                    run_targets(&project, &cli, &targets, false).await
                }
                None => print_task_list(&project.registry, ListFormat::Table, false),
            }
        }
    }
}

async fn run_command(cmd: &Commands, cli: &Cli) -> Result<()> {
    let project = Project::load(cli)?;
    let registry = &project.registry;

    match cmd {
        Commands::Run { targets, dry_run } => run_targets(&project, cli, targets, *dry_run).await,

        Commands::List { all, format } => print_task_list(registry, *format, *all),

        Commands::Graph { target, format } => {
            let name = registry.find_target(target)?.name.clone();
            print_graph(registry, &name, *format)
        }

        Commands::Which { target, dependents } => {
            let name = registry.find_target(target)?.name.clone();
            print_tree(registry, &name, *dependents)
        }

        Commands::Redo { target, only } => {
            let name = registry.find_target(target)?.name.clone();
            let mut targets = vec![name.clone()];
            if !only {
                let graph = TaskGraph::new(registry)?;
                targets.extend(
                    graph
                        .transitive_dependents(&name)?
                        .into_iter()
                        .map(|t| t.name.clone()),
                );
            }
            let forced: HashSet<String> = targets.iter().cloned().collect();
            execute(&project, cli, &targets, forced).await
        }

        Commands::Clean {
            target,
            up,
            down,
            all,
            dry,
        } => clean(registry, target.as_deref(), *up, *down, *all, *dry),

        Commands::Doctor { target } => {
            let target = target
                .as_deref()
                .map(|t| registry.find_target(t).map(|task| task.name.clone()))
                .transpose()?;
            let issues = Doctor::new(registry, &RealFs).check(target.as_deref())?;

            if issues.is_empty() {
                println!("{} no problems found", style("✓").green());
                return Ok(());
            }
            for issue in &issues {
                println!("{} {}", style("✗").red(), issue);
            }
            Err(MillError::Preflight {
                count: issues.len(),
                details: "Fix the problems listed above".to_string(),
            })
        }
    }
}

async fn run_targets(project: &Project, cli: &Cli, targets: &[String], dry_run: bool) -> Result<()> {
    let names = project.resolve_targets(targets)?;

    if dry_run {
        let plan = build_plan(&project.registry, &names)?;
        let executor = project.executor(cli, HashSet::new())?;
        println!("{}", style("Execution plan (dry run):").bold().cyan());
        for (name, decision) in executor.preview(&plan)? {
            match decision {
                Decision::Run(reason) => println!(
                    "  {} {} {}",
                    style("[run]").cyan(),
                    name,
                    style(format!("({})", reason)).dim()
                ),
                Decision::Skip(reason) => println!(
                    "  {} {} {}",
                    style("[skip]").dim(),
                    name,
                    style(format!("({})", reason)).dim()
                ),
            }
        }
        return Ok(());
    }

    execute(project, cli, &names, HashSet::new()).await
}

async fn execute(project: &Project, cli: &Cli, names: &[String], forced: HashSet<String>) -> Result<()> {
    Doctor::new(&project.registry, &RealFs).preflight(names)?;
    let plan = build_plan(&project.registry, names)?;

    let executor = project.executor(cli, forced)?;
    let report = executor.run(&plan).await?;

    if !cli.quiet {
        report.print_summary();
    }
    report.into_result().map(|_| ())
}

/// Generated tasks are hidden from `list` unless `--all` is given
fn is_generated(name: &str) -> bool {
    name.contains(':') || name.contains('/')
}

fn print_task_list(registry: &Registry, format: ListFormat, all: bool) -> Result<()> {
    let default = registry.default_task();
    let mut tasks: Vec<_> = registry
        .all()
        .iter()
        .filter(|t| all || !is_generated(&t.name))
        .collect();
    // Default task first, otherwise registration order
    tasks.sort_by_key(|t| Some(t.name.as_str()) != default);

    match format {
        ListFormat::Table => {
            if tasks.is_empty() {
                println!("No tasks defined");
                return Ok(());
            }
            println!("{}", style("Available tasks:").bold());
            println!();

            let width = tasks.iter().map(|t| t.name.len()).max().unwrap_or(0);
            for task in tasks {
                let marker = if Some(task.name.as_str()) == default {
                    format!(" {}", style("(default)").green())
                } else {
                    String::new()
                };
                println!(
                    "  {}{}  {}{}",
                    style(&task.name).cyan().bold(),
                    " ".repeat(width - task.name.len()),
                    style(task.doc.as_deref().unwrap_or("")).dim(),
                    marker
                );
            }
        }

        ListFormat::Json => {
            let list: Vec<_> = tasks
                .iter()
                .map(|t| {
                    serde_json::json!({
                        "name": t.name,
                        "description": t.doc,
                        "default": Some(t.name.as_str()) == default,
                        "inputs": t.file_inputs().collect::<Vec<_>>(),
                        "depends": t.task_inputs().collect::<Vec<_>>(),
                        "outputs": t.all_outputs().collect::<Vec<_>>(),
                        "vars": t.vars.iter().map(|v| serde_json::json!({
                            "name": v.name,
                            "type": v.ty.as_str(),
                            "default": v.default.as_ref().map(ToString::to_string),
                            "optional": v.optional,
                        })).collect::<Vec<_>>(),
                    })
                })
                .collect();
            println!("{}", to_json(&list)?);
        }

        ListFormat::Plain => {
            for task in tasks {
                println!("{}", task.name);
            }
        }
    }

    Ok(())
}

fn to_json<T: serde::Serialize>(value: &T) -> Result<String> {
    serde_json::to_string_pretty(value).map_err(|e| MillError::Io(e.into()))
}

fn print_graph(registry: &Registry, target: &str, format: GraphFormat) -> Result<()> {
    let subgraph = TaskGraph::new(registry)?.subgraph(target)?;

    match format {
        GraphFormat::Text => {
            println!("{}", style("Task dependency graph:").bold());
            println!();

            for node in &subgraph.nodes {
                let deps: Vec<&str> = subgraph
                    .edges
                    .iter()
                    .filter(|(_, to)| *to == node.name)
                    .map(|(from, _)| from.as_str())
                    .collect();

                if deps.is_empty() {
                    println!("  {}", style(&node.name).cyan().bold());
                } else {
                    println!(
                        "  {} {} {}",
                        style(&node.name).cyan().bold(),
                        style("←").dim(),
                        deps.join(", ")
                    );
                }
            }
        }

        GraphFormat::Dot => {
            println!("digraph mill {{");
            println!("  rankdir=LR;");
            println!("  node [shape=box];");

            for node in &subgraph.nodes {
                let shape = if node.phony { "ellipse" } else { "box" };
                println!("  \"{}\" [shape={}];", node.name, shape);
            }
            for (from, to) in &subgraph.edges {
                println!("  \"{}\" -> \"{}\";", from, to);
            }

            println!("}}");
        }

        GraphFormat::Json => println!("{}", to_json(&subgraph)?),
    }

    Ok(())
}

/// Print the dependency (or dependent) tree of a task
fn print_tree(registry: &Registry, target: &str, dependents: bool) -> Result<()> {
    let graph = TaskGraph::new(registry)?;
    let mut seen = HashSet::new();
    print_branch(&graph, target, dependents, 0, &mut seen)
}

fn print_branch(
    graph: &TaskGraph,
    name: &str,
    dependents: bool,
    depth: usize,
    seen: &mut HashSet<String>,
) -> Result<()> {
    let indent = "  ".repeat(depth);
    if !seen.insert(name.to_string()) {
        println!("{}{} {}", indent, name, style("(see above)").dim());
        return Ok(());
    }

    if depth == 0 {
        println!("{}", style(name).cyan().bold());
    } else {
        println!("{}{}", indent, name);
    }

    let next = if dependents {
        graph.dependents(name)?
    } else {
        graph.dependencies(name)?
    };
    for task in next {
        print_branch(graph, &task.name, dependents, depth + 1, seen)?;
    }
    Ok(())
}

fn clean(
    registry: &Registry,
    target: Option<&str>,
    up: bool,
    down: bool,
    all: bool,
    dry: bool,
) -> Result<()> {
    let mut names: Vec<String> = Vec::new();

    match target {
        _ if all => names.extend(registry.all().iter().map(|t| t.name.clone())),
        Some(target) => {
            let name = registry.find_target(target)?.name.clone();
            if up {
                names.extend(build_plan(registry, &[name.as_str()])?.names().map(String::from));
            }
            if down {
                let graph = TaskGraph::new(registry)?;
                names.extend(
                    graph
                        .transitive_dependents(&name)?
                        .into_iter()
                        .map(|t| t.name.clone()),
                );
            }
            names.push(name);
        }
        None => return Ok(()),
    }

    let mut removed: HashSet<PathBuf> = HashSet::new();
    for name in &names {
        let task = registry.get(name)?;
        for path in task.all_outputs() {
            if !path.exists() || !removed.insert(path.to_path_buf()) {
                continue;
            }
            if dry {
                println!("{} {}", style("would remove").dim(), path.display());
                continue;
            }
            if path.is_dir() {
                std::fs::remove_dir_all(path)?;
            } else {
                std::fs::remove_file(path)?;
            }
            println!("{} {}", style("removed").yellow(), path.display());
        }
    }

    Ok(())
}
