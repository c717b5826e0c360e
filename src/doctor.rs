//! Static checks of the task graph
//!
//! Finds problems that would make a run fail or misbehave before any task
//! body is invoked: dependency cycles, and file inputs that do not exist and
//! that no task produces.

use std::fmt;
use std::path::PathBuf;

use crate::error::{MillError, Result};
use crate::fs::FileSystem;
use crate::graph::{build_plan, TaskGraph};
use crate::registry::Registry;

/// A problem found by [`Doctor`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Issue {
    Cycle(Vec<String>),
    MissingInput { task: String, path: PathBuf },
}

impl fmt::Display for Issue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Cycle(cycle) => write!(f, "dependency cycle: {}", cycle.join(" -> ")),
            Self::MissingInput { task, path } => write!(
                f,
                "task '{}' needs '{}', which does not exist and no task produces",
                task,
                path.display()
            ),
        }
    }
}

pub struct Doctor<'a> {
    registry: &'a Registry,
    fs: &'a dyn FileSystem,
}

impl<'a> Doctor<'a> {
    pub fn new(registry: &'a Registry, fs: &'a dyn FileSystem) -> Self {
        Self { registry, fs }
    }

    /// Check the whole registry, or only what `target` depends on
    pub fn check(&self, target: Option<&str>) -> Result<Vec<Issue>> {
        let graph = TaskGraph::new(self.registry)?;
        let mut issues = Vec::new();

        let scope: Vec<&str> = match target {
            Some(target) => {
                match build_plan(self.registry, &[target]) {
                    Err(MillError::CyclicDependency { cycle }) => issues.push(Issue::Cycle(cycle)),
                    Err(e) => return Err(e),
                    Ok(_) => {}
                }
                let mut scope: Vec<&str> = graph
                    .transitive_dependencies(target)?
                    .into_iter()
                    .map(|t| t.name.as_str())
                    .collect();
                scope.push(target);
                scope
            }
            None => {
                if let Some(cycle) = graph.find_cycle() {
                    issues.push(Issue::Cycle(cycle));
                }
                self.registry.all().iter().map(|t| t.name.as_str()).collect()
            }
        };

        for name in scope {
            let task = self.registry.get(name)?;
            for path in task.file_inputs() {
                if !self.fs.exists(path) && self.registry.by_output(path).is_none() {
                    issues.push(Issue::MissingInput {
                        task: task.name.clone(),
                        path: path.to_path_buf(),
                    });
                }
            }
        }

        Ok(issues)
    }

    /// Check every target and fail if anything is wrong
    pub fn preflight<S: AsRef<str>>(&self, targets: &[S]) -> Result<()> {
        let mut issues: Vec<Issue> = Vec::new();
        for target in targets {
            for issue in self.check(Some(target.as_ref()))? {
                if !issues.contains(&issue) {
                    issues.push(issue);
                }
            }
        }

        if issues.is_empty() {
            return Ok(());
        }

        Err(MillError::Preflight {
            count: issues.len(),
            details: issues
                .iter()
                .map(ToString::to_string)
                .collect::<Vec<_>>()
                .join("\n"),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fs::MemoryFs;
    use crate::task::TaskSpec;

    #[test]
    fn test_clean_graph() {
        let fs = MemoryFs::new();
        fs.write("src/main.c");

        let mut registry = Registry::new();
        registry
            .register(TaskSpec::noop("compile").input_file("src/main.c").output("app"))
            .unwrap();
        registry
            .register(TaskSpec::noop("package").input_file("app").output("app.tar"))
            .unwrap();

        let doctor = Doctor::new(&registry, &fs);
        assert!(doctor.check(None).unwrap().is_empty());
        assert!(doctor.preflight(&["package"]).is_ok());
    }

    #[test]
    fn test_missing_input() {
        let fs = MemoryFs::new();
        let mut registry = Registry::new();
        registry
            .register(TaskSpec::noop("compile").input_file("src/gone.c"))
            .unwrap();
        registry.register(TaskSpec::noop("other")).unwrap();

        let doctor = Doctor::new(&registry, &fs);
        assert_eq!(
            doctor.check(None).unwrap(),
            vec![Issue::MissingInput {
                task: "compile".into(),
                path: PathBuf::from("src/gone.c"),
            }]
        );
        assert!(doctor.check(Some("other")).unwrap().is_empty());

        match doctor.preflight(&["compile"]) {
            Err(MillError::Preflight { count, details }) => {
                assert_eq!(count, 1);
                assert!(details.contains("src/gone.c"));
            }
            other => panic!("unexpected: {:?}", other),
        }
    }

    #[test]
    fn test_cycle_reported() {
        let fs = MemoryFs::new();
        let mut registry = Registry::new();
        registry.register(TaskSpec::noop("a").depends_on("b")).unwrap();
        registry.register(TaskSpec::noop("b").depends_on("a")).unwrap();

        let doctor = Doctor::new(&registry, &fs);
        let issues = doctor.check(Some("a")).unwrap();
        assert_eq!(
            issues,
            vec![Issue::Cycle(vec!["a".into(), "b".into(), "a".into()])]
        );
        assert_eq!(doctor.check(None).unwrap().len(), 1);
    }

    #[test]
    fn test_unknown_target() {
        let fs = MemoryFs::new();
        let registry = Registry::new();
        assert!(matches!(
            Doctor::new(&registry, &fs).check(Some("nope")),
            Err(MillError::UnknownTask { .. })
        ));
    }
}
