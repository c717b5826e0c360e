//! Task variable resolution
//!
//! Values are layered, lowest precedence first:
//!
//! 1. the defaults declared by the task,
//! 2. the `[task]` section of a TOML vars file,
//! 3. `--vars` overrides, applied in the order given.
//!
//! An override is either `task.var=raw` (parsed according to the var's type)
//! or `task={"var": value, ...}` (a JSON object merged key by key). The two
//! are told apart by whether the key left of the first `=` contains a `.`;
//! a task whose own name contains a dot therefore cannot be targeted with the
//! single-var form.

use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};

use tracing::{debug, warn};

use crate::error::{MillError, Result};
use crate::registry::Registry;
use crate::task::{Task, TaskVar, VarType, VarValue};

/// Concrete arguments for one task invocation, in declaration order
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ResolvedVars {
    values: Vec<(String, Option<VarValue>)>,
}

impl ResolvedVars {
    /// Value of a var; `None` if unknown or resolved to absent
    pub fn get(&self, name: &str) -> Option<&VarValue> {
        self.values
            .iter()
            .find(|(n, _)| n == name)
            .and_then(|(_, v)| v.as_ref())
    }

    pub fn contains(&self, name: &str) -> bool {
        self.values.iter().any(|(n, _)| n == name)
    }

    pub fn text(&self, name: &str) -> Option<&str> {
        self.get(name).and_then(VarValue::as_str)
    }

    pub fn integer(&self, name: &str) -> Option<i64> {
        self.get(name).and_then(VarValue::as_i64)
    }

    pub fn real(&self, name: &str) -> Option<f64> {
        self.get(name).and_then(VarValue::as_f64)
    }

    pub fn boolean(&self, name: &str) -> Option<bool> {
        self.get(name).and_then(VarValue::as_bool)
    }

    pub fn path(&self, name: &str) -> Option<&Path> {
        self.get(name).and_then(VarValue::as_path)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, Option<&VarValue>)> {
        self.values.iter().map(|(n, v)| (n.as_str(), v.as_ref()))
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    fn set(&mut self, name: &str, value: Option<VarValue>) {
        if let Some(slot) = self.values.iter_mut().find(|(n, _)| n == name) {
            slot.1 = value;
        }
    }
}

impl<const N: usize> From<[(&str, Option<VarValue>); N]> for ResolvedVars {
    fn from(values: [(&str, Option<VarValue>); N]) -> Self {
        Self {
            values: values
                .into_iter()
                .map(|(n, v)| (n.to_string(), v))
                .collect(),
        }
    }
}

/// A loosely typed value from TOML or JSON, before coercion
#[derive(Debug, Clone, PartialEq)]
enum RawValue {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    Str(String),
    Other(&'static str, String),
}

impl fmt::Display for RawValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Null => f.write_str("null"),
            Self::Bool(b) => write!(f, "boolean ({})", b),
            Self::Int(i) => write!(f, "integer ({})", i),
            Self::Float(x) => write!(f, "real ({})", x),
            Self::Str(s) => write!(f, "text ({:?})", s),
            Self::Other(kind, repr) => write!(f, "{} ({})", kind, repr),
        }
    }
}

impl From<toml::Value> for RawValue {
    fn from(value: toml::Value) -> Self {
        use toml::Value;

        match value {
            Value::Boolean(b) => Self::Bool(b),
            Value::Integer(i) => Self::Int(i),
            Value::Float(f) => Self::Float(f),
            Value::String(s) => Self::Str(s),
            Value::Datetime(dt) => Self::Other("datetime", dt.to_string()),
            Value::Array(arr) => Self::Other("array", Value::Array(arr).to_string()),
            Value::Table(table) => Self::Other("table", Value::Table(table).to_string()),
        }
    }
}

impl From<serde_json::Value> for RawValue {
    fn from(value: serde_json::Value) -> Self {
        use serde_json::Value;

        match value {
            Value::Null => Self::Null,
            Value::Bool(b) => Self::Bool(b),
            Value::Number(n) => match n.as_i64() {
                Some(i) => Self::Int(i),
                None => Self::Float(n.as_f64().unwrap_or(f64::NAN)),
            },
            Value::String(s) => Self::Str(s),
            v @ Value::Array(_) => Self::Other("array", v.to_string()),
            v @ Value::Object(_) => Self::Other("object", v.to_string()),
        }
    }
}

fn type_error(task: &str, var: &TaskVar, received: impl fmt::Display) -> MillError {
    MillError::VarType {
        task: task.to_string(),
        var: var.name.clone(),
        expected: var.ty.to_string(),
        received: received.to_string(),
    }
}

/// Coerce a typed (TOML/JSON) value into the var's type
fn coerce_typed(task: &str, var: &TaskVar, value: RawValue) -> Result<Option<VarValue>> {
    let coerced = match (var.ty, value) {
        (_, RawValue::Null) if var.optional => return Ok(None),
        (VarType::Text, RawValue::Str(s)) => VarValue::Text(s),
        (VarType::Integer, RawValue::Int(i)) => VarValue::Integer(i),
        (VarType::Real, RawValue::Float(f)) => VarValue::Real(f),
        (VarType::Real, RawValue::Int(i)) => VarValue::Real(i as f64),
        (VarType::Boolean, RawValue::Bool(b)) => VarValue::Boolean(b),
        (VarType::Path, RawValue::Str(s)) => VarValue::Path(PathBuf::from(s)),
        (_, other) => return Err(type_error(task, var, other)),
    };
    Ok(Some(coerced))
}

fn lookup_var<'t>(task: &'t Task, name: &str) -> Result<&'t TaskVar> {
    task.var(name).ok_or_else(|| MillError::UnknownVar {
        task: task.name.clone(),
        var: name.to_string(),
    })
}

/// Parse the raw text of a `task.var=raw` override according to the var's type
fn coerce_from_str(task: &str, var: &TaskVar, raw: &str) -> Result<VarValue> {
    let err = || type_error(task, var, RawValue::Str(raw.to_string()));

    Ok(match var.ty {
        VarType::Text => VarValue::Text(raw.to_string()),
        VarType::Integer => VarValue::Integer(raw.trim().parse().map_err(|_| err())?),
        VarType::Real => VarValue::Real(raw.trim().parse().map_err(|_| err())?),
        VarType::Boolean => match raw.to_ascii_lowercase().as_str() {
            "true" => VarValue::Boolean(true),
            "false" => VarValue::Boolean(false),
            _ => return Err(err()),
        },
        VarType::Path => VarValue::Path(PathBuf::from(raw)),
    })
}

/// What an override assigns
#[derive(Debug, Clone, PartialEq)]
pub enum OverrideValue {
    /// `task.var=raw`
    Single { var: String, raw: String },
    /// `task={...}`
    Bulk(serde_json::Map<String, serde_json::Value>),
}

/// One parsed `--vars` entry
#[derive(Debug, Clone, PartialEq)]
pub struct VarsOverride {
    pub original: String,
    pub task: String,
    pub value: OverrideValue,
}

impl VarsOverride {
    pub fn parse(entry: &str) -> Result<Self> {
        let invalid = |reason: &str| MillError::InvalidVarsEntry {
            entry: entry.to_string(),
            reason: reason.to_string(),
        };

        let (key, raw) = entry.split_once('=').ok_or_else(|| invalid("missing '='"))?;
        if key.is_empty() {
            return Err(invalid("missing key"));
        }

        if let Some((task, var)) = key.split_once('.') {
            if task.is_empty() || var.is_empty() {
                return Err(invalid("expected task.var=value"));
            }
            return Ok(Self {
                original: entry.to_string(),
                task: task.to_string(),
                value: OverrideValue::Single {
                    var: var.to_string(),
                    raw: raw.to_string(),
                },
            });
        }

        let parsed: serde_json::Value = serde_json::from_str(raw)
            .map_err(|e| invalid(&format!("invalid JSON: {}", e)))?;
        match parsed {
            serde_json::Value::Object(map) => Ok(Self {
                original: entry.to_string(),
                task: key.to_string(),
                value: OverrideValue::Bulk(map),
            }),
            _ => Err(invalid("bulk value must be a JSON object")),
        }
    }
}

/// A TOML vars file: one table per task
#[derive(Debug, Clone, Default)]
pub struct VarsFile {
    pub path: PathBuf,
    sections: BTreeMap<String, toml::Table>,
}

impl VarsFile {
    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Err(MillError::VarsFileNotFound {
                path: path.to_path_buf(),
            });
        }
        let content = std::fs::read_to_string(path)?;
        Self::parse(&content, path)
    }

    pub fn parse(content: &str, path: &Path) -> Result<Self> {
        let invalid = |reason: String| MillError::VarsFileParse {
            path: path.to_path_buf(),
            reason,
        };

        let table: toml::Table = toml::from_str(content).map_err(|e| invalid(e.to_string()))?;

        let mut sections = BTreeMap::new();
        for (task, values) in table {
            match values {
                toml::Value::Table(values) => {
                    sections.insert(task, values);
                }
                other => {
                    return Err(invalid(format!(
                        "section [{}] must be a table, got {}",
                        task,
                        other.type_str()
                    )))
                }
            }
        }

        Ok(Self {
            path: path.to_path_buf(),
            sections,
        })
    }

    pub fn section(&self, task: &str) -> Option<&toml::Table> {
        self.sections.get(task)
    }

    pub fn task_names(&self) -> impl Iterator<Item = &str> {
        self.sections.keys().map(String::as_str)
    }
}

/// Resolves task vars from defaults, a vars file and overrides
#[derive(Debug, Clone, Default)]
pub struct VarsResolver {
    file: Option<VarsFile>,
    overrides: Vec<VarsOverride>,
}

impl VarsResolver {
    pub fn new(file: Option<VarsFile>, overrides: Vec<VarsOverride>) -> Self {
        Self { file, overrides }
    }

    /// Load the vars file (if any) and parse raw `--vars` entries
    pub fn from_sources<S: AsRef<str>>(file: Option<&Path>, entries: &[S]) -> Result<Self> {
        let file = file.map(VarsFile::load).transpose()?;
        let overrides = entries
            .iter()
            .map(|e| VarsOverride::parse(e.as_ref()))
            .collect::<Result<Vec<_>>>()?;
        Ok(Self::new(file, overrides))
    }

    pub fn overrides(&self) -> &[VarsOverride] {
        &self.overrides
    }

    /// Check task names against the registry before anything runs.
    ///
    /// Unknown sections in the vars file are tolerated since one file may be
    /// shared between projects; unknown tasks in overrides are errors.
    pub fn validate(&self, registry: &Registry) -> Result<()> {
        if let Some(file) = &self.file {
            for task in file.task_names() {
                if !registry.contains(task) {
                    warn!(
                        path = %file.path.display(),
                        task,
                        "vars file has unknown task section"
                    );
                }
            }
        }

        for entry in &self.overrides {
            if !registry.contains(&entry.task) {
                return Err(registry.unknown(&entry.task));
            }
        }

        Ok(())
    }

    /// Resolve the arguments for one task
    pub fn resolve(&self, task: &Task) -> Result<ResolvedVars> {
        let mut resolved = ResolvedVars {
            values: task
                .vars
                .iter()
                .map(|v| (v.name.clone(), v.default.clone()))
                .collect(),
        };
        if let Some(section) = self.file.as_ref().and_then(|f| f.section(&task.name)) {
            for (name, value) in section {
                let var = lookup_var(task, name)?;
                let value = coerce_typed(&task.name, var, value.clone().into())?;
                resolved.set(&var.name, value);
            }
        }

        for entry in self.overrides.iter().filter(|e| e.task == task.name) {
            match &entry.value {
                OverrideValue::Single { var, raw } => {
                    let var = lookup_var(task, var)?;
                    let value = coerce_from_str(&task.name, var, raw)?;
                    resolved.set(&var.name, Some(value));
                }
                OverrideValue::Bulk(map) => {
                    for (name, value) in map {
                        let var = lookup_var(task, name)?;
                        let value = coerce_typed(&task.name, var, value.clone().into())?;
                        resolved.set(&var.name, value);
                    }
                }
            }
        }

        debug!(task = %task.name, vars = resolved.len(), "resolved vars");
        Ok(resolved)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::task::{ParamDecl, TaskSpec};
    use std::sync::Arc;

    fn deploy() -> (Registry, Arc<Task>) {
        let mut registry = Registry::new();
        let task = registry
            .register(
                TaskSpec::noop("deploy")
                    .param(ParamDecl::new("env").ty(VarType::Text).optional())
                    .param(ParamDecl::new("port").default_value(8080i64))
                    .param(ParamDecl::new("dry_run").default_value(false)),
            )
            .unwrap();
        (registry, task)
    }

    fn overrides(entries: &[&str]) -> VarsResolver {
        VarsResolver::from_sources(None, entries).unwrap()
    }

    fn vars_file(content: &str) -> VarsFile {
        VarsFile::parse(content, Path::new("vars.toml")).unwrap()
    }

    #[test]
    fn test_parse_dot_notation() {
        let entry = VarsOverride::parse("deploy.port=3000").unwrap();
        assert_eq!(entry.task, "deploy");
        assert_eq!(
            entry.value,
            OverrideValue::Single {
                var: "port".to_string(),
                raw: "3000".to_string()
            }
        );
    }

    #[test]
    fn test_parse_value_may_contain_equals() {
        let entry = VarsOverride::parse("deploy.flags=a=b").unwrap();
        assert!(matches!(entry.value, OverrideValue::Single { ref raw, .. } if raw == "a=b"));
    }

    #[test]
    fn test_parse_bulk_json() {
        let entry = VarsOverride::parse(r#"deploy={"env":"prod","port":443}"#).unwrap();
        assert_eq!(entry.task, "deploy");
        match entry.value {
            OverrideValue::Bulk(map) => assert_eq!(map.len(), 2),
            other => panic!("unexpected: {:?}", other),
        }
    }

    #[test]
    fn test_parse_errors() {
        for entry in ["deploy.port", "=1", ".port=1", "deploy.=1", "deploy=123", "deploy={bad"] {
            assert!(
                matches!(VarsOverride::parse(entry), Err(MillError::InvalidVarsEntry { .. })),
                "{} should be rejected",
                entry
            );
        }
    }

    #[test]
    fn test_defaults_only() {
        let (_, task) = deploy();
        let resolved = VarsResolver::default().resolve(&task).unwrap();

        assert_eq!(resolved.get("env"), None);
        assert!(resolved.contains("env"));
        assert_eq!(resolved.integer("port"), Some(8080));
        assert_eq!(resolved.boolean("dry_run"), Some(false));
    }

    #[test]
    fn test_vars_file_then_dot_override() {
        let (_, task) = deploy();
        let file = vars_file("[deploy]\nenv = \"production\"\nport = 443\n");
        let resolver = VarsResolver::new(
            Some(file),
            vec![VarsOverride::parse("deploy.port=9090").unwrap()],
        );

        let resolved = resolver.resolve(&task).unwrap();
        assert_eq!(resolved.text("env"), Some("production"));
        assert_eq!(resolved.integer("port"), Some(9090));
    }

    #[test]
    fn test_later_override_wins() {
        let (_, task) = deploy();
        let resolver = overrides(&[
            r#"deploy={"port":1000,"env":"staging"}"#,
            "deploy.port=2000",
            "deploy.port=3000",
        ]);

        let resolved = resolver.resolve(&task).unwrap();
        assert_eq!(resolved.integer("port"), Some(3000));
        assert_eq!(resolved.text("env"), Some("staging"));
    }

    #[test]
    fn test_optional_null_from_bulk_json() {
        let mut registry = Registry::new();
        let task = registry
            .register(
                TaskSpec::noop("deploy")
                    .param(ParamDecl::new("env").ty(VarType::Text).default_value("staging").optional()),
            )
            .unwrap();

        let resolved = overrides(&[r#"deploy={"env":null}"#]).resolve(&task).unwrap();
        assert_eq!(resolved.get("env"), None);
    }

    #[test]
    fn test_null_for_required_var() {
        let (_, task) = deploy();
        let result = overrides(&[r#"deploy={"port":null}"#]).resolve(&task);
        assert!(matches!(result, Err(MillError::VarType { .. })));
    }

    #[test]
    fn test_dot_form_typing() {
        let mut registry = Registry::new();
        let build = registry
            .register(TaskSpec::noop("build").param(ParamDecl::new("optimize").default_value(false)))
            .unwrap();
        let label = registry
            .register(TaskSpec::noop("label").param(ParamDecl::new("optimize").default_value("no")))
            .unwrap();

        let resolved = overrides(&["build.optimize=true"]).resolve(&build).unwrap();
        assert_eq!(resolved.get("optimize"), Some(&VarValue::Boolean(true)));

        let resolved = overrides(&["label.optimize=true"]).resolve(&label).unwrap();
        assert_eq!(resolved.get("optimize"), Some(&VarValue::Text("true".to_string())));

        let resolved = overrides(&["build.optimize=TRUE"]).resolve(&build).unwrap();
        assert_eq!(resolved.boolean("optimize"), Some(true));
    }

    #[test]
    fn test_dot_form_type_errors() {
        let (_, task) = deploy();

        match overrides(&["deploy.dry_run=yes"]).resolve(&task) {
            Err(MillError::VarType {
                task,
                var,
                expected,
                received,
            }) => {
                assert_eq!(task, "deploy");
                assert_eq!(var, "dry_run");
                assert_eq!(expected, "boolean");
                assert!(received.contains("yes"));
            }
            other => panic!("unexpected: {:?}", other),
        }

        assert!(matches!(
            overrides(&["deploy.port=80x"]).resolve(&task),
            Err(MillError::VarType { .. })
        ));
    }

    #[test]
    fn test_type_mismatch_in_bulk_json() {
        let (_, task) = deploy();
        let result = overrides(&[r#"deploy={"port":"not-an-int"}"#]).resolve(&task);
        assert!(matches!(result, Err(MillError::VarType { ref expected, .. }) if expected == "integer"));

        // booleans are not integers
        let result = overrides(&[r#"deploy={"port":true}"#]).resolve(&task);
        assert!(matches!(result, Err(MillError::VarType { .. })));
    }

    #[test]
    fn test_unknown_var() {
        let (_, task) = deploy();
        let result = overrides(&["deploy.nope=1"]).resolve(&task);
        assert!(matches!(result, Err(MillError::UnknownVar { ref var, .. }) if var == "nope"));

        let file = vars_file("[deploy]\nnope = 1\n");
        let result = VarsResolver::new(Some(file), vec![]).resolve(&task);
        assert!(matches!(result, Err(MillError::UnknownVar { .. })));
    }

    #[test]
    fn test_path_and_real_coercion_from_toml() {
        let mut registry = Registry::new();
        let task = registry
            .register(
                TaskSpec::noop("build")
                    .param(ParamDecl::new("output").ty(VarType::Path).default_value("build/app"))
                    .param(ParamDecl::new("ratio").default_value(1.5)),
            )
            .unwrap();

        let file = vars_file("[build]\noutput = \"dist/app\"\nratio = 2\n");
        let resolved = VarsResolver::new(Some(file), vec![]).resolve(&task).unwrap();

        assert_eq!(resolved.path("output"), Some(Path::new("dist/app")));
        assert_eq!(resolved.real("ratio"), Some(2.0));
    }

    #[test]
    fn test_validate_unknown_tasks() {
        let (registry, _) = deploy();

        // Unknown file sections are tolerated
        let file = vars_file("[deploy]\nport = 443\n\n[ghost]\nport = 123\n");
        VarsResolver::new(Some(file), vec![])
            .validate(&registry)
            .unwrap();

        let result = overrides(&["build.port=3000"]).validate(&registry);
        assert!(matches!(result, Err(MillError::UnknownTask { ref name, .. }) if name == "build"));
    }

    #[test]
    fn test_vars_file_errors() {
        let result = VarsFile::parse("port = 1\n", Path::new("v.toml"));
        assert!(matches!(result, Err(MillError::VarsFileParse { .. })));

        let result = VarsFile::load(Path::new("/definitely/not/here.toml"));
        assert!(matches!(result, Err(MillError::VarsFileNotFound { .. })));
    }
}
