//! Task definitions
//!
//! A [`Task`] is built from a [`TaskSpec`] when it is registered. The spec's
//! parameter declarations are turned into [`TaskVar`]s once, at that point;
//! nothing downstream needs to know how a body describes its parameters.

use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::Arc;

use crate::error::{BodyError, MillError, Result};
use crate::vars::ResolvedVars;

/// Invokable task body
pub type TaskBody = Arc<dyn Fn(&ResolvedVars) -> std::result::Result<(), BodyError> + Send + Sync>;

/// Zero-argument run gate
pub type RunGate = Arc<dyn Fn() -> bool + Send + Sync>;

/// Type of a task variable
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VarType {
    Text,
    Integer,
    Real,
    Boolean,
    Path,
}

impl VarType {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Text => "text",
            Self::Integer => "integer",
            Self::Real => "real",
            Self::Boolean => "boolean",
            Self::Path => "path",
        }
    }
}

impl fmt::Display for VarType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for VarType {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "text" | "str" | "string" => Ok(Self::Text),
            "integer" | "int" => Ok(Self::Integer),
            "real" | "float" => Ok(Self::Real),
            "boolean" | "bool" => Ok(Self::Boolean),
            "path" => Ok(Self::Path),
            other => Err(format!("unsupported var type '{}'", other)),
        }
    }
}

/// A concrete typed var value
#[derive(Debug, Clone, PartialEq)]
pub enum VarValue {
    Text(String),
    Integer(i64),
    Real(f64),
    Boolean(bool),
    Path(PathBuf),
}

impl VarValue {
    pub fn var_type(&self) -> VarType {
        match self {
            Self::Text(_) => VarType::Text,
            Self::Integer(_) => VarType::Integer,
            Self::Real(_) => VarType::Real,
            Self::Boolean(_) => VarType::Boolean,
            Self::Path(_) => VarType::Path,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::Text(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Self::Integer(i) => Some(*i),
            _ => None,
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Self::Real(f) => Some(*f),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Self::Boolean(b) => Some(*b),
            _ => None,
        }
    }

    pub fn as_path(&self) -> Option<&Path> {
        match self {
            Self::Path(p) => Some(p),
            _ => None,
        }
    }

    /// Widen an integer default into a real var; everything else must match exactly.
    fn conform(self, ty: VarType) -> Option<Self> {
        match (self, ty) {
            (Self::Integer(i), VarType::Real) => Some(Self::Real(i as f64)),
            (Self::Text(s), VarType::Path) => Some(Self::Path(PathBuf::from(s))),
            (value, ty) if value.var_type() == ty => Some(value),
            _ => None,
        }
    }
}

impl fmt::Display for VarValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Text(s) => f.write_str(s),
            Self::Integer(i) => write!(f, "{}", i),
            Self::Real(r) => write!(f, "{}", r),
            Self::Boolean(b) => write!(f, "{}", b),
            Self::Path(p) => write!(f, "{}", p.display()),
        }
    }
}

impl From<&str> for VarValue {
    fn from(s: &str) -> Self {
        Self::Text(s.to_string())
    }
}

impl From<String> for VarValue {
    fn from(s: String) -> Self {
        Self::Text(s)
    }
}

impl From<i64> for VarValue {
    fn from(i: i64) -> Self {
        Self::Integer(i)
    }
}

impl From<f64> for VarValue {
    fn from(f: f64) -> Self {
        Self::Real(f)
    }
}

impl From<bool> for VarValue {
    fn from(b: bool) -> Self {
        Self::Boolean(b)
    }
}

impl From<PathBuf> for VarValue {
    fn from(p: PathBuf) -> Self {
        Self::Path(p)
    }
}

/// A configurable parameter of a task
#[derive(Debug, Clone, PartialEq)]
pub struct TaskVar {
    pub name: String,
    pub ty: VarType,
    /// Always `Some` for required vars; may be `None` for optional ones
    pub default: Option<VarValue>,
    pub optional: bool,
}

/// A parameter as declared by a task body, before validation
#[derive(Debug, Clone, Default)]
pub struct ParamDecl {
    pub name: String,
    pub ty: Option<VarType>,
    pub default: Option<VarValue>,
    pub optional: bool,
    pub variadic: bool,
}

impl ParamDecl {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Default::default()
        }
    }

    pub fn ty(mut self, ty: VarType) -> Self {
        self.ty = Some(ty);
        self
    }

    pub fn default_value(mut self, value: impl Into<VarValue>) -> Self {
        self.default = Some(value.into());
        self
    }

    pub fn optional(mut self) -> Self {
        self.optional = true;
        self
    }

    pub fn variadic(mut self) -> Self {
        self.variadic = true;
        self
    }
}

/// Derive the var schema from a task's parameter declarations
pub fn vars_from_params(task: &str, params: &[ParamDecl]) -> Result<Vec<TaskVar>> {
    let schema_error = |reason: String| MillError::Schema {
        task: task.to_string(),
        reason,
    };

    let mut vars: Vec<TaskVar> = Vec::with_capacity(params.len());

    for param in params {
        if param.name.is_empty() {
            return Err(schema_error("var name cannot be empty".to_string()));
        }
        if param.variadic {
            return Err(schema_error(format!(
                "var '{}' is variadic; variadic parameters are not supported",
                param.name
            )));
        }
        if vars.iter().any(|v| v.name == param.name) {
            return Err(schema_error(format!("var '{}' declared twice", param.name)));
        }

        let ty = param
            .ty
            .or_else(|| param.default.as_ref().map(VarValue::var_type))
            .unwrap_or(VarType::Text);

        let default = match param.default.clone() {
            Some(value) => {
                let found = value.var_type();
                Some(value.conform(ty).ok_or_else(|| {
                    schema_error(format!(
                        "default for var '{}' is {}, expected {}",
                        param.name, found, ty
                    ))
                })?)
            }
            None if param.optional => None,
            None => {
                return Err(schema_error(format!(
                    "var '{}' must have a default value or be optional",
                    param.name
                )))
            }
        };

        vars.push(TaskVar {
            name: param.name.clone(),
            ty,
            default,
            optional: param.optional,
        });
    }

    Ok(vars)
}

/// One entry of a task's `inputs`
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Input {
    /// A file whose mtime participates in staleness
    File(PathBuf),
    /// Another task that must finish first
    Task(String),
}

impl Input {
    pub fn file(path: impl Into<PathBuf>) -> Self {
        Self::File(path.into())
    }

    pub fn task(name: impl Into<String>) -> Self {
        Self::Task(name.into())
    }
}

/// A registered unit of work
#[derive(Clone)]
pub struct Task {
    pub name: String,
    pub body: TaskBody,
    pub inputs: Vec<Input>,
    pub outputs: Vec<PathBuf>,
    pub touch: Option<PathBuf>,
    pub vars: Vec<TaskVar>,
    pub run_if: Option<RunGate>,
    pub run_if_not: Option<RunGate>,
    pub doc: Option<String>,
}

impl Task {
    /// No outputs and no touch target: always eligible to run
    pub fn is_phony(&self) -> bool {
        self.outputs.is_empty() && self.touch.is_none()
    }

    /// Declared outputs plus the touch target
    pub fn all_outputs(&self) -> impl Iterator<Item = &Path> {
        self.outputs
            .iter()
            .map(PathBuf::as_path)
            .chain(self.touch.as_deref())
    }

    /// Concrete file inputs, in declaration order
    pub fn file_inputs(&self) -> impl Iterator<Item = &Path> {
        self.inputs.iter().filter_map(|i| match i {
            Input::File(p) => Some(p.as_path()),
            Input::Task(_) => None,
        })
    }

    /// Task-valued inputs, in declaration order
    pub fn task_inputs(&self) -> impl Iterator<Item = &str> {
        self.inputs.iter().filter_map(|i| match i {
            Input::Task(name) => Some(name.as_str()),
            Input::File(_) => None,
        })
    }

    pub fn var(&self, name: &str) -> Option<&TaskVar> {
        self.vars.iter().find(|v| v.name == name)
    }
}

impl fmt::Debug for Task {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Task")
            .field("name", &self.name)
            .field("inputs", &self.inputs)
            .field("outputs", &self.outputs)
            .field("touch", &self.touch)
            .field("vars", &self.vars)
            .field("run_if", &self.run_if.is_some())
            .field("run_if_not", &self.run_if_not.is_some())
            .field("doc", &self.doc)
            .finish_non_exhaustive()
    }
}

/// Declaration of a task, consumed by [`crate::Registry::register`]
pub struct TaskSpec {
    pub(crate) name: String,
    pub(crate) body: TaskBody,
    pub(crate) inputs: Vec<Input>,
    pub(crate) outputs: Vec<PathBuf>,
    pub(crate) touch: Option<PathBuf>,
    pub(crate) params: Vec<ParamDecl>,
    pub(crate) run_if: Option<RunGate>,
    pub(crate) run_if_not: Option<RunGate>,
    pub(crate) doc: Option<String>,
}

impl TaskSpec {
    pub fn new<F>(name: impl Into<String>, body: F) -> Self
    where
        F: Fn(&ResolvedVars) -> std::result::Result<(), BodyError> + Send + Sync + 'static,
    {
        Self {
            name: name.into(),
            body: Arc::new(body),
            inputs: Vec::new(),
            outputs: Vec::new(),
            touch: None,
            params: Vec::new(),
            run_if: None,
            run_if_not: None,
            doc: None,
        }
    }

    /// A task with an empty body, useful for aggregate targets
    pub fn noop(name: impl Into<String>) -> Self {
        Self::new(name, |_| Ok(()))
    }

    pub fn input(mut self, input: Input) -> Self {
        self.inputs.push(input);
        self
    }

    pub fn input_file(self, path: impl Into<PathBuf>) -> Self {
        self.input(Input::file(path))
    }

    pub fn depends_on(self, task: impl Into<String>) -> Self {
        self.input(Input::task(task))
    }

    pub fn output(mut self, path: impl Into<PathBuf>) -> Self {
        self.outputs.push(path.into());
        self
    }

    pub fn touch(mut self, path: impl Into<PathBuf>) -> Self {
        self.touch = Some(path.into());
        self
    }

    pub fn param(mut self, param: ParamDecl) -> Self {
        self.params.push(param);
        self
    }

    pub fn run_if<F>(mut self, gate: F) -> Self
    where
        F: Fn() -> bool + Send + Sync + 'static,
    {
        self.run_if = Some(Arc::new(gate));
        self
    }

    pub fn run_if_not<F>(mut self, gate: F) -> Self
    where
        F: Fn() -> bool + Send + Sync + 'static,
    {
        self.run_if_not = Some(Arc::new(gate));
        self
    }

    pub fn doc(mut self, doc: impl Into<String>) -> Self {
        self.doc = Some(doc.into());
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Validate the parameter list and build the task
    pub(crate) fn build(self) -> Result<Task> {
        let vars = vars_from_params(&self.name, &self.params)?;

        Ok(Task {
            name: self.name,
            body: self.body,
            inputs: self.inputs,
            outputs: self.outputs,
            touch: self.touch,
            vars,
            run_if: self.run_if,
            run_if_not: self.run_if_not,
            doc: self.doc,
        })
    }
}
