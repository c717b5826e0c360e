//! Filesystem boundary used by the staleness evaluator and the executor
//!
//! The engine only needs three primitives: existence, modification time and
//! touching a file. `RealFs` goes to disk, `MemoryFs` keeps a fake clock so
//! staleness can be exercised deterministically.

use std::collections::HashMap;
use std::path::{Component, Path, PathBuf};
use std::sync::Mutex;
use std::time::{Duration, SystemTime};

/// Stat/touch service injected into the engine
pub trait FileSystem: Send + Sync {
    /// Modification time of `path`, `None` if it does not exist
    fn modified(&self, path: &Path) -> Option<SystemTime>;

    /// Create `path` if missing and set its modification time to now
    fn touch(&self, path: &Path) -> std::io::Result<()>;

    fn exists(&self, path: &Path) -> bool {
        self.modified(path).is_some()
    }
}

/// The real filesystem
#[derive(Debug, Clone, Default)]
pub struct RealFs;

impl FileSystem for RealFs {
    fn modified(&self, path: &Path) -> Option<SystemTime> {
        std::fs::metadata(path).and_then(|m| m.modified()).ok()
    }

    fn touch(&self, path: &Path) -> std::io::Result<()> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)?;
        }
        let file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)?;
        file.set_modified(SystemTime::now())
    }

    fn exists(&self, path: &Path) -> bool {
        path.exists()
    }
}

/// In-memory filesystem with a manually advanced clock
#[derive(Debug)]
pub struct MemoryFs {
    state: Mutex<MemoryState>,
}

#[derive(Debug)]
struct MemoryState {
    now: SystemTime,
    files: HashMap<PathBuf, SystemTime>,
}

impl MemoryFs {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(MemoryState {
                now: SystemTime::UNIX_EPOCH + Duration::from_secs(1_000_000),
                files: HashMap::new(),
            }),
        }
    }

    /// Advance the clock by one second and return the new time
    pub fn tick(&self) -> SystemTime {
        let mut state = self.lock();
        state.now += Duration::from_secs(1);
        state.now
    }

    /// Write `path` at the current time, then advance the clock
    pub fn write(&self, path: impl AsRef<Path>) {
        let mut state = self.lock();
        let now = state.now;
        state.files.insert(normalize(path.as_ref()), now);
        state.now += Duration::from_secs(1);
    }

    /// Set an explicit modification time
    pub fn set_modified(&self, path: impl AsRef<Path>, time: SystemTime) {
        self.lock().files.insert(normalize(path.as_ref()), time);
    }

    pub fn remove(&self, path: impl AsRef<Path>) {
        self.lock().files.remove(&normalize(path.as_ref()));
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, MemoryState> {
        // A panic while holding the lock leaves plain data behind; keep going.
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl Default for MemoryFs {
    fn default() -> Self {
        Self::new()
    }
}

impl FileSystem for MemoryFs {
    fn modified(&self, path: &Path) -> Option<SystemTime> {
        self.lock().files.get(&normalize(path)).copied()
    }

    fn touch(&self, path: &Path) -> std::io::Result<()> {
        self.write(path);
        Ok(())
    }
}

/// Lexically normalize a path: drop `.` components and fold `..` where possible.
///
/// Used wherever two spellings of the same declared path must compare equal,
/// without touching the disk.
pub fn normalize(path: &Path) -> PathBuf {
    let mut out = PathBuf::new();
    for component in path.components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => {
                let can_pop = matches!(
                    out.components().next_back(),
                    Some(Component::Normal(_))
                );
                if can_pop {
                    out.pop();
                } else if !matches!(
                    out.components().next_back(),
                    Some(Component::RootDir | Component::Prefix(_))
                ) {
                    out.push("..");
                }
            }
            other => out.push(other.as_os_str()),
        }
    }
    if out.as_os_str().is_empty() {
        out.push(".");
    }
    out
}
