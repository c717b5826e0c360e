//! Configuration parsing for Millfile.toml
//!
//! Tasks are registered in the order they appear in the file; `toml` is built
//! with `preserve_order` so the `[tasks]` table keeps that order.

use serde::Deserialize;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use rhai::AST;
use tracing::{debug, warn};

use crate::error::{BodyError, MillError, Result};
use crate::registry::Registry;
use crate::script::ScriptEngine;
use crate::shell::{sh, ShOptions};
use crate::task::{ParamDecl, TaskSpec, VarType, VarValue};
use crate::vars::ResolvedVars;

/// Default task file names to search for
pub const CONFIG_FILES: &[&str] = &["Millfile.toml", "millfile.toml"];

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct RawConfig {
    #[serde(default)]
    default: Option<String>,
    #[serde(default)]
    env: HashMap<String, String>,
    #[serde(default)]
    settings: Settings,
    #[serde(default)]
    tasks: toml::Table,
}

/// A parsed task file
#[derive(Debug, Clone, Default)]
pub struct Config {
    /// Task to run when no target is given
    pub default: Option<String>,

    /// Global environment variables
    pub env: HashMap<String, String>,

    pub settings: Settings,

    /// Task definitions, in file order
    pub tasks: Vec<(String, TaskConfig)>,
}

/// Global settings
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Settings {
    /// Shell used for `run` commands (defaults to `sh`)
    #[serde(default)]
    pub shell: Option<String>,

    /// Run in parallel mode unless told otherwise
    #[serde(default)]
    pub parallel: bool,

    /// Worker count for parallel mode (0 = number of CPUs)
    #[serde(default)]
    pub jobs: Option<usize>,
}

/// Configuration for a single task
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TaskConfig {
    /// Human-readable description
    #[serde(default)]
    pub desc: Option<String>,

    /// Shell commands, run in order
    #[serde(default)]
    pub run: Vec<String>,

    /// Rhai script to execute (alternative to `run`)
    #[serde(default)]
    pub script: Option<String>,

    /// Tasks that must complete before this one
    #[serde(default)]
    pub depends: Vec<String>,

    /// Files whose modification times make this task stale
    #[serde(default)]
    pub inputs: Vec<PathBuf>,

    /// Files produced by this task
    #[serde(default)]
    pub outputs: Vec<PathBuf>,

    /// Stamp file touched after a successful run
    #[serde(default)]
    pub touch: Option<PathBuf>,

    /// Rhai expression; the task only runs when it is true
    #[serde(default)]
    pub run_if: Option<String>,

    /// Rhai expression; the task does not run when it is true
    #[serde(default)]
    pub run_if_not: Option<String>,

    /// Task-specific environment variables
    #[serde(default)]
    pub env: HashMap<String, String>,

    /// Working directory for this task; relative `inputs`, `outputs` and
    /// `touch` are resolved against it
    #[serde(default)]
    pub cwd: Option<PathBuf>,

    /// Var declarations: either `name = default` or `name = { type, default, optional }`
    #[serde(default)]
    pub vars: toml::Table,
}

/// Long form of a var declaration
#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct VarConfig {
    #[serde(default, rename = "type")]
    ty: Option<String>,
    #[serde(default)]
    default: Option<toml::Value>,
    #[serde(default)]
    optional: bool,
    #[serde(default)]
    variadic: bool,
}

impl TaskConfig {
    /// A declared path as seen from the directory the body runs in
    fn in_cwd(&self, path: &Path) -> PathBuf {
        match &self.cwd {
            Some(cwd) if path.is_relative() => cwd.join(path),
            _ => path.to_path_buf(),
        }
    }

    /// Turn the `vars` table into parameter declarations
    pub fn params(&self, task: &str) -> Result<Vec<ParamDecl>> {
        let schema = |reason: String| MillError::Schema {
            task: task.to_string(),
            reason,
        };

        let mut params = Vec::with_capacity(self.vars.len());
        for (name, value) in &self.vars {
            let mut param = ParamDecl::new(name.as_str());
            match value {
                toml::Value::Table(table) => {
                    let decl: VarConfig = toml::Value::Table(table.clone())
                        .try_into()
                        .map_err(|e| schema(format!("var '{}': {}", name, e)))?;
                    if let Some(ty) = decl.ty {
                        param = param.ty(ty.parse::<VarType>().map_err(schema)?);
                    }
                    if let Some(default) = decl.default {
                        param = param.default_value(default_value(name, default).map_err(schema)?);
                    }
                    param.optional = decl.optional;
                    param.variadic = decl.variadic;
                }
                other => {
                    param = param.default_value(default_value(name, other.clone()).map_err(schema)?);
                }
            }
            params.push(param);
        }
        Ok(params)
    }
}

fn default_value(var: &str, value: toml::Value) -> std::result::Result<VarValue, String> {
    match value {
        toml::Value::String(s) => Ok(VarValue::Text(s)),
        toml::Value::Integer(i) => Ok(VarValue::Integer(i)),
        toml::Value::Float(f) => Ok(VarValue::Real(f)),
        toml::Value::Boolean(b) => Ok(VarValue::Boolean(b)),
        other => Err(format!(
            "default for var '{}' must be text, integer, real or boolean, got {}",
            var,
            other.type_str()
        )),
    }
}

impl Config {
    /// Load configuration from the specified path or search for it
    pub fn load(path: Option<&Path>) -> Result<(Self, PathBuf)> {
        let config_path = match path {
            Some(p) if p.exists() => p.to_path_buf(),
            Some(p) => {
                return Err(MillError::ConfigNotFound {
                    searched: vec![p.to_path_buf()],
                })
            }
            None => Self::find_config()?,
        };

        let content = std::fs::read_to_string(&config_path)?;
        let config = Self::parse(&content, &config_path)?;
        debug!(path = %config_path.display(), tasks = config.tasks.len(), "loaded task file");

        Ok((config, config_path))
    }

    /// Search for a task file starting from the current directory
    fn find_config() -> Result<PathBuf> {
        let mut current = std::env::current_dir()?;
        let mut searched = Vec::new();

        loop {
            for name in CONFIG_FILES {
                let candidate = current.join(name);
                searched.push(candidate.clone());
                if candidate.exists() {
                    return Ok(candidate);
                }
            }

            if !current.pop() {
                break;
            }
        }

        Err(MillError::ConfigNotFound { searched })
    }

    /// Parse task file contents; `path` is only used for error messages
    pub fn parse(content: &str, path: &Path) -> Result<Self> {
        let parse_err = |source| MillError::ConfigParse {
            source,
            path: path.to_path_buf(),
        };

        let raw: RawConfig = toml::from_str(content).map_err(parse_err)?;

        let mut tasks = Vec::with_capacity(raw.tasks.len());
        for (name, value) in raw.tasks {
            let task: TaskConfig = value.try_into().map_err(parse_err)?;
            tasks.push((name, task));
        }

        let config = Self {
            default: raw.default,
            env: raw.env,
            settings: raw.settings,
            tasks,
        };
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<()> {
        let unknown = |name: &str| MillError::UnknownTask {
            name: name.to_string(),
            available: self.task_names().iter().map(|s| s.to_string()).collect(),
        };

        for (name, task) in &self.tasks {
            if !task.run.is_empty() && task.script.is_some() {
                return Err(MillError::InvalidTask {
                    task: name.clone(),
                    reason: "Task cannot have both 'run' and 'script'".to_string(),
                });
            }

            if let Some(dep) = task.depends.iter().find(|d| self.get_task(d).is_none()) {
                return Err(unknown(dep));
            }
        }

        if let Some(default) = &self.default {
            if self.get_task(default).is_none() {
                return Err(unknown(default));
            }
        }

        Ok(())
    }

    pub fn get_task(&self, name: &str) -> Option<&TaskConfig> {
        self.tasks.iter().find(|(n, _)| n == name).map(|(_, t)| t)
    }

    /// Task names in file order
    pub fn task_names(&self) -> Vec<&str> {
        self.tasks.iter().map(|(n, _)| n.as_str()).collect()
    }

    /// Merge environment variables for a task (global + task-specific)
    pub fn task_env(&self, task: &TaskConfig) -> HashMap<String, String> {
        let mut env = self.env.clone();
        env.extend(task.env.clone());
        env
    }

    /// Register every task, in file order
    pub fn into_registry(self) -> Result<Registry> {
        let engine = ScriptEngine::new();
        let mut registry = Registry::new();

        for (name, task) in &self.tasks {
            registry.register(self.task_spec(&engine, name, task)?)?;
        }

        if let Some(default) = &self.default {
            registry.set_default(default.clone())?;
        }

        Ok(registry)
    }

    fn task_spec(&self, engine: &ScriptEngine, name: &str, task: &TaskConfig) -> Result<TaskSpec> {
        let invalid = |reason: String| MillError::InvalidTask {
            task: name.to_string(),
            reason,
        };

        let ctx = Arc::new(BodyContext {
            engine: engine.clone(),
            env: self.task_env(task),
            cwd: task.cwd.clone(),
            shell: self.settings.shell.clone(),
        });

        let mut spec = if let Some(script) = &task.script {
            let ast = engine
                .compile(script)
                .map_err(|e| invalid(format!("script does not compile: {}", e)))?;
            let ctx = Arc::clone(&ctx);
            TaskSpec::new(name, move |vars| ctx.run_script(&ast, vars))
        } else if !task.run.is_empty() {
            let commands = task.run.clone();
            let ctx = Arc::clone(&ctx);
            TaskSpec::new(name, move |vars| ctx.run_commands(&commands, vars))
        } else {
            TaskSpec::noop(name)
        };

        for dep in &task.depends {
            spec = spec.depends_on(dep.as_str());
        }
        for input in &task.inputs {
            spec = spec.input_file(task.in_cwd(input));
        }
        for output in &task.outputs {
            spec = spec.output(task.in_cwd(output));
        }
        if let Some(touch) = &task.touch {
            spec = spec.touch(task.in_cwd(touch));
        }
        if let Some(desc) = &task.desc {
            spec = spec.doc(desc.as_str());
        }
        for param in task.params(name)? {
            spec = spec.param(param);
        }

        if let Some(expr) = &task.run_if {
            let gate = Gate::compile(&ctx, name, "run_if", expr, false).map_err(invalid)?;
            spec = spec.run_if(move || gate.eval());
        }
        if let Some(expr) = &task.run_if_not {
            let gate = Gate::compile(&ctx, name, "run_if_not", expr, true).map_err(invalid)?;
            spec = spec.run_if_not(move || gate.eval());
        }

        Ok(spec)
    }
}

/// What a command or script body needs at run time
struct BodyContext {
    engine: ScriptEngine,
    env: HashMap<String, String>,
    cwd: Option<PathBuf>,
    shell: Option<String>,
}

impl BodyContext {
    fn cwd(&self) -> std::io::Result<PathBuf> {
        match &self.cwd {
            Some(cwd) => Ok(cwd.clone()),
            None => std::env::current_dir(),
        }
    }

    fn run_commands(&self, commands: &[String], vars: &ResolvedVars) -> std::result::Result<(), BodyError> {
        let opts = ShOptions {
            capture: false,
            check: true,
            shell: self.shell.clone(),
            cwd: self.cwd.clone(),
            env: self.env.clone(),
        };

        for cmd in commands {
            let expanded = self.expand(cmd, vars)?;
            sh(&expanded, &opts)?;
        }
        Ok(())
    }

    /// Expand `$name` / `${name}` from the resolved vars, then the environment.
    /// Names that resolve nowhere are left for the shell.
    fn expand(&self, cmd: &str, vars: &ResolvedVars) -> std::result::Result<String, BodyError> {
        let expanded = shellexpand::env_with_context(cmd, |key: &str| {
            if vars.contains(key) {
                return Ok(Some(vars.get(key).map(ToString::to_string).unwrap_or_default()));
            }
            if let Some(value) = self.env.get(key) {
                return Ok(Some(value.clone()));
            }
            match std::env::var(key) {
                Ok(value) => Ok(Some(value)),
                Err(std::env::VarError::NotPresent) => Ok(None),
                Err(e) => Err(e),
            }
        })?;
        Ok(expanded.into_owned())
    }

    fn run_script(&self, ast: &AST, vars: &ResolvedVars) -> std::result::Result<(), BodyError> {
        let printed = self
            .engine
            .execute_ast(ast, vars, &self.env, &self.cwd()?)
            .map_err(|e| e.to_string())?;
        print!("{}", printed);
        Ok(())
    }
}

/// A compiled run condition
struct Gate {
    ctx: Arc<BodyContext>,
    task: String,
    field: &'static str,
    ast: AST,
    /// Value returned when evaluation fails; chosen so a failure vetoes the run
    on_error: bool,
}

impl Gate {
    fn compile(
        ctx: &Arc<BodyContext>,
        task: &str,
        field: &'static str,
        expr: &str,
        on_error: bool,
    ) -> std::result::Result<Self, String> {
        let ast = ctx
            .engine
            .compile_condition(expr)
            .map_err(|e| format!("'{}' is not a valid expression: {}", field, e))?;
        Ok(Self {
            ctx: Arc::clone(ctx),
            task: task.to_string(),
            field,
            ast,
            on_error,
        })
    }

    fn eval(&self) -> bool {
        let result = self.ctx.cwd().map_err(|e| e.to_string()).and_then(|cwd| {
            self.ctx
                .engine
                .eval_condition(&self.ast, &self.ctx.env, &cwd)
                .map_err(|e| e.to_string())
        });

        result.unwrap_or_else(|error| {
            warn!(task = %self.task, condition = self.field, %error, "run condition failed; not running");
            self.on_error
        })
    }
}
