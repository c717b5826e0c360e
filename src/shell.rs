//! Shell command helper for task bodies
//!
//! The engine never calls this itself; command and script bodies do. A failed
//! command surfaces as a [`ShError`], which the executor treats like any other
//! body failure.

use std::collections::HashMap;
use std::path::PathBuf;
use std::process::{Command, Stdio};

use thiserror::Error;
use tracing::debug;

#[derive(Error, Debug)]
pub enum ShError {
    #[error("Failed to execute `{command}`")]
    Spawn {
        command: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Command `{command}` failed with exit code {}", code.map(|c| c.to_string()).unwrap_or_else(|| "none".into()))]
    Failed { command: String, code: Option<i32> },
}

/// Options for [`sh`]
#[derive(Debug, Clone)]
pub struct ShOptions {
    /// Capture stdout instead of inheriting it
    pub capture: bool,
    /// Turn a non-zero exit status into an error
    pub check: bool,
    /// Shell binary (defaults to `sh`, or `cmd` on Windows)
    pub shell: Option<String>,
    pub cwd: Option<PathBuf>,
    pub env: HashMap<String, String>,
}

impl Default for ShOptions {
    fn default() -> Self {
        Self {
            capture: false,
            check: true,
            shell: None,
            cwd: None,
            env: HashMap::new(),
        }
    }
}

impl ShOptions {
    pub fn captured() -> Self {
        Self {
            capture: true,
            ..Default::default()
        }
    }
}

/// Result of a shell command
#[derive(Debug, Clone)]
pub struct ShOutput {
    pub code: Option<i32>,
    pub success: bool,
    /// Captured stdout when `capture` was set
    pub stdout: Option<String>,
}

/// Run `cmd` through the shell
pub fn sh(cmd: &str, opts: &ShOptions) -> Result<ShOutput, ShError> {
    let (shell, flag) = match &opts.shell {
        Some(shell) => (shell.as_str(), if cfg!(windows) { "/C" } else { "-c" }),
        None if cfg!(windows) => ("cmd", "/C"),
        None => ("sh", "-c"),
    };

    debug!(command = cmd, shell, "running shell command");

    let mut command = Command::new(shell);
    command.arg(flag).arg(cmd).envs(&opts.env);
    if let Some(cwd) = &opts.cwd {
        command.current_dir(cwd);
    }
    if opts.capture {
        command.stdout(Stdio::piped());
    }

    let spawn_err = |source| ShError::Spawn {
        command: cmd.to_string(),
        source,
    };

    let (status, stdout) = if opts.capture {
        let output = command.output().map_err(spawn_err)?;
        let stdout = String::from_utf8_lossy(&output.stdout).to_string();
        (output.status, Some(stdout))
    } else {
        (command.status().map_err(spawn_err)?, None)
    };

    if opts.check && !status.success() {
        return Err(ShError::Failed {
            command: cmd.to_string(),
            code: status.code(),
        });
    }

    Ok(ShOutput {
        code: status.code(),
        success: status.success(),
        stdout,
    })
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;

    #[test]
    fn test_capture() {
        let out = sh("echo hello", &ShOptions::captured()).unwrap();
        assert!(out.success);
        assert_eq!(out.stdout.as_deref().map(str::trim), Some("hello"));
    }

    #[test]
    fn test_check_failure() {
        let result = sh("exit 3", &ShOptions::captured());
        assert!(matches!(result, Err(ShError::Failed { code: Some(3), .. })));
    }

    #[test]
    fn test_unchecked_failure() {
        let opts = ShOptions {
            check: false,
            ..ShOptions::captured()
        };
        let out = sh("exit 2", &opts).unwrap();
        assert!(!out.success);
        assert_eq!(out.code, Some(2));
    }

    #[test]
    fn test_env_and_cwd() {
        let temp = tempfile::tempdir().unwrap();
        let mut opts = ShOptions::captured();
        opts.cwd = Some(temp.path().to_path_buf());
        opts.env.insert("GREETING".to_string(), "hi".to_string());

        sh("echo $GREETING > greeting.txt", &opts).unwrap();
        let written = std::fs::read_to_string(temp.path().join("greeting.txt")).unwrap();
        assert_eq!(written.trim(), "hi");
    }
}
