//! Rhai scripting for task bodies and run conditions
//!
//! Script bodies see the task's resolved vars as typed constants, plus `env`
//! (a map) and `cwd`. Run conditions are single boolean expressions compiled
//! at load time.

use std::collections::HashMap;
use std::path::Path;
use std::sync::{Arc, Mutex};

use rhai::{Dynamic, Engine, EvalAltResult, Scope, AST};

use crate::shell::{sh, ShOptions};
use crate::task::VarValue;
use crate::vars::ResolvedVars;

type ScriptResult<T> = Result<T, Box<EvalAltResult>>;

/// Script execution engine
#[derive(Debug, Clone, Default)]
pub struct ScriptEngine;

impl ScriptEngine {
    pub fn new() -> Self {
        Self
    }

    fn create_engine() -> Engine {
        let mut engine = Engine::new();

        engine.set_max_expr_depths(64, 64);
        engine.set_max_operations(1_000_000);
        engine.set_max_modules(10);
        engine.set_max_string_size(1024 * 1024);

        Self::register_stdlib(&mut engine);

        engine
    }

    /// Compile a script body
    pub fn compile(&self, script: &str) -> ScriptResult<AST> {
        Self::create_engine().compile(script).map_err(Into::into)
    }

    /// Compile a run condition; it must be a single expression
    pub fn compile_condition(&self, expr: &str) -> ScriptResult<AST> {
        Self::create_engine()
            .compile_expression(expr)
            .map_err(Into::into)
    }

    /// Run a script source once, returning what it printed
    pub fn execute(
        &self,
        script: &str,
        vars: &ResolvedVars,
        env: &HashMap<String, String>,
        cwd: &Path,
    ) -> ScriptResult<String> {
        let ast = self.compile(script)?;
        self.execute_ast(&ast, vars, env, cwd)
    }

    /// Run a compiled script body, returning what it printed
    pub fn execute_ast(
        &self,
        ast: &AST,
        vars: &ResolvedVars,
        env: &HashMap<String, String>,
        cwd: &Path,
    ) -> ScriptResult<String> {
        let mut scope = Scope::new();
        push_env(&mut scope, env, cwd);

        let mut var_map = rhai::Map::new();
        for (name, value) in vars.iter() {
            let value = value.map(var_to_dynamic).unwrap_or(Dynamic::UNIT);
            var_map.insert(name.into(), value.clone());
            scope.push_constant_dynamic(name.to_string(), value);
        }
        scope.push_constant("vars", var_map);

        let output = Arc::new(Mutex::new(String::new()));
        let sink = Arc::clone(&output);

        let mut engine = Self::create_engine();
        engine.on_print(move |s| {
            if let Ok(mut out) = sink.lock() {
                out.push_str(s);
                out.push('\n');
            }
        });

        engine.run_ast_with_scope(&mut scope, ast)?;

        let printed = output.lock().map(|o| o.clone()).unwrap_or_default();
        Ok(printed)
    }

    /// Evaluate a compiled run condition
    pub fn eval_condition(
        &self,
        ast: &AST,
        env: &HashMap<String, String>,
        cwd: &Path,
    ) -> ScriptResult<bool> {
        let mut scope = Scope::new();
        push_env(&mut scope, env, cwd);
        Self::create_engine().eval_ast_with_scope::<bool>(&mut scope, ast)
    }

    fn register_stdlib(engine: &mut Engine) {
        // Files
        engine.register_fn("read_file", |path: &str| -> ScriptResult<String> {
            std::fs::read_to_string(path)
                .map_err(|e| format!("Failed to read file '{}': {}", path, e).into())
        });

        engine.register_fn("write_file", |path: &str, content: &str| -> ScriptResult<()> {
            std::fs::write(path, content)
                .map_err(|e| format!("Failed to write file '{}': {}", path, e).into())
        });

        engine.register_fn("file_exists", |path: &str| Path::new(path).exists());
        engine.register_fn("is_file", |path: &str| Path::new(path).is_file());
        engine.register_fn("is_dir", |path: &str| Path::new(path).is_dir());

        engine.register_fn("mkdir", |path: &str| -> ScriptResult<()> {
            std::fs::create_dir_all(path)
                .map_err(|e| format!("Failed to create directory '{}': {}", path, e).into())
        });

        engine.register_fn("remove", |path: &str| -> ScriptResult<()> {
            let p = Path::new(path);
            let result = if p.is_dir() {
                std::fs::remove_dir_all(p)
            } else {
                std::fs::remove_file(p)
            };
            result.map_err(|e| format!("Failed to remove '{}': {}", path, e).into())
        });

        // Paths
        engine.register_fn("join_path", |a: &str, b: &str| -> String {
            Path::new(a).join(b).to_string_lossy().to_string()
        });

        engine.register_fn("parent_path", |path: &str| -> String {
            Path::new(path)
                .parent()
                .map(|p| p.to_string_lossy().to_string())
                .unwrap_or_default()
        });

        engine.register_fn("file_name", |path: &str| -> String {
            Path::new(path)
                .file_name()
                .map(|n| n.to_string_lossy().to_string())
                .unwrap_or_default()
        });

        engine.register_fn("extension", |path: &str| -> String {
            Path::new(path)
                .extension()
                .map(|e| e.to_string_lossy().to_string())
                .unwrap_or_default()
        });

        engine.register_fn("glob", |pattern: &str| -> ScriptResult<rhai::Array> {
            let paths = glob::glob(pattern)
                .map_err(|e| format!("Invalid glob pattern: {}", e))?
                .filter_map(|p| p.ok())
                .map(|p| Dynamic::from(p.to_string_lossy().to_string()))
                .collect();
            Ok(paths)
        });

        // Shell
        engine.register_fn("sh", |cmd: &str| -> ScriptResult<()> {
            sh(cmd, &ShOptions::default())
                .map(|_| ())
                .map_err(|e| e.to_string().into())
        });

        engine.register_fn("sh_output", |cmd: &str| -> ScriptResult<String> {
            sh(cmd, &ShOptions::captured())
                .map(|out| out.stdout.unwrap_or_default())
                .map_err(|e| e.to_string().into())
        });

        engine.register_fn("get_env", |key: &str| -> String {
            std::env::var(key).unwrap_or_default()
        });

        // JSON
        engine.register_fn("parse_json", |s: &str| -> ScriptResult<Dynamic> {
            let value: serde_json::Value =
                serde_json::from_str(s).map_err(|e| format!("Failed to parse JSON: {}", e))?;
            Ok(json_to_dynamic(value))
        });

        engine.register_fn("to_json", |value: Dynamic| -> ScriptResult<String> {
            let json = dynamic_to_json(value)?;
            serde_json::to_string_pretty(&json)
                .map_err(|e| format!("Failed to serialize JSON: {}", e).into())
        });
    }
}

fn push_env(scope: &mut Scope, env: &HashMap<String, String>, cwd: &Path) {
    let env_map: rhai::Map = env
        .iter()
        .map(|(k, v)| (k.clone().into(), Dynamic::from(v.clone())))
        .collect();
    scope.push_constant("env", env_map);
    scope.push_constant("cwd", cwd.to_string_lossy().to_string());
}

fn var_to_dynamic(value: &VarValue) -> Dynamic {
    match value {
        VarValue::Text(s) => Dynamic::from(s.clone()),
        VarValue::Integer(i) => Dynamic::from(*i),
        VarValue::Real(f) => Dynamic::from(*f),
        VarValue::Boolean(b) => Dynamic::from(*b),
        VarValue::Path(p) => Dynamic::from(p.to_string_lossy().to_string()),
    }
}

fn json_to_dynamic(value: serde_json::Value) -> Dynamic {
    use serde_json::Value;

    match value {
        Value::Null => Dynamic::UNIT,
        Value::Bool(b) => Dynamic::from(b),
        Value::Number(n) => match n.as_i64() {
            Some(i) => Dynamic::from(i),
            None => n.as_f64().map(Dynamic::from).unwrap_or(Dynamic::UNIT),
        },
        Value::String(s) => Dynamic::from(s),
        Value::Array(arr) => {
            Dynamic::from(arr.into_iter().map(json_to_dynamic).collect::<rhai::Array>())
        }
        Value::Object(obj) => {
            let map: rhai::Map = obj
                .into_iter()
                .map(|(k, v)| (k.into(), json_to_dynamic(v)))
                .collect();
            Dynamic::from(map)
        }
    }
}

fn dynamic_to_json(value: Dynamic) -> ScriptResult<serde_json::Value> {
    use serde_json::Value;

    if value.is_unit() {
        return Ok(Value::Null);
    }
    if let Some(b) = value.clone().try_cast::<bool>() {
        return Ok(Value::Bool(b));
    }
    if let Some(i) = value.clone().try_cast::<i64>() {
        return Ok(Value::Number(i.into()));
    }
    if let Some(f) = value.clone().try_cast::<f64>() {
        return Ok(serde_json::Number::from_f64(f)
            .map(Value::Number)
            .unwrap_or(Value::Null));
    }
    if value.is_string() {
        return Ok(Value::String(value.to_string()));
    }
    if let Some(arr) = value.clone().try_cast::<rhai::Array>() {
        let vec = arr
            .into_iter()
            .map(dynamic_to_json)
            .collect::<ScriptResult<Vec<_>>>()?;
        return Ok(Value::Array(vec));
    }
    if let Some(map) = value.try_cast::<rhai::Map>() {
        let obj = map
            .into_iter()
            .map(|(k, v)| dynamic_to_json(v).map(|v| (k.to_string(), v)))
            .collect::<ScriptResult<serde_json::Map<_, _>>>()?;
        return Ok(Value::Object(obj));
    }

    Err("Cannot convert value to JSON".into())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    fn run(script: &str, vars: &ResolvedVars) -> ScriptResult<String> {
        let cwd = std::env::current_dir().unwrap();
        ScriptEngine::new().execute(script, vars, &HashMap::new(), &cwd)
    }

    #[test]
    fn test_print_is_captured() {
        let out = run(r#"print("hello mill");"#, &ResolvedVars::default()).unwrap();
        assert_eq!(out.trim(), "hello mill");
    }

    #[test]
    fn test_typed_vars_in_scope() {
        let vars = ResolvedVars::from([
            ("port", Some(VarValue::Integer(8080))),
            ("optimize", Some(VarValue::Boolean(true))),
            ("out", Some(VarValue::Path(PathBuf::from("build/app")))),
            ("env_name", None),
        ]);

        let out = run(
            r#"
                print(port + 1);
                if optimize { print("fast"); }
                print(out);
                print(type_of(env_name));
                print(vars["port"]);
            "#,
            &vars,
        )
        .unwrap();

        let lines: Vec<_> = out.lines().collect();
        assert_eq!(lines, vec!["8081", "fast", "build/app", "()", "8080"]);
    }

    #[test]
    fn test_vars_are_constant() {
        let vars = ResolvedVars::from([("port", Some(VarValue::Integer(1)))]);
        assert!(run("port = 2;", &vars).is_err());
    }

    #[test]
    fn test_env_access() {
        let mut env = HashMap::new();
        env.insert("MY_VAR".to_string(), "test_value".to_string());
        let cwd = std::env::current_dir().unwrap();

        let out = ScriptEngine::new()
            .execute(r#"print(env["MY_VAR"]);"#, &ResolvedVars::default(), &env, &cwd)
            .unwrap();
        assert_eq!(out.trim(), "test_value");
    }

    #[test]
    fn test_conditions() {
        let engine = ScriptEngine::new();
        let cwd = std::env::current_dir().unwrap();
        let mut env = HashMap::new();
        env.insert("CI".to_string(), "true".to_string());

        let ast = engine.compile_condition(r#"env["CI"] == "true""#).unwrap();
        assert!(engine.eval_condition(&ast, &env, &cwd).unwrap());

        let ast = engine.compile_condition("1 + 1").unwrap();
        assert!(engine.eval_condition(&ast, &env, &cwd).is_err());

        assert!(engine.compile_condition("let x = 1; x").is_err());
    }

    #[test]
    fn test_json_round_trip() {
        let out = run(
            r#"let v = parse_json("{\"a\": [1, 2.5, true]}"); print(v.a[1]); print(to_json(v.a[0]));"#,
            &ResolvedVars::default(),
        )
        .unwrap();
        let lines: Vec<_> = out.lines().collect();
        assert_eq!(lines, vec!["2.5", "1"]);
    }

    #[cfg(unix)]
    #[test]
    fn test_sh_output() {
        let out = run(
            r#"let s = sh_output("echo from-shell"); s.trim(); print(s);"#,
            &ResolvedVars::default(),
        )
        .unwrap();
        assert_eq!(out.trim(), "from-shell");
    }

    #[test]
    fn test_syntax_error_on_compile() {
        assert!(ScriptEngine::new().compile("let = ;").is_err());
    }
}
