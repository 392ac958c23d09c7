// Project file storage seen by cycles

use crate::utils::lock_mutex_recover;
use anyhow::{anyhow, Result};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Component, Path, PathBuf};
use std::sync::Mutex;

/// Project storage. Paths are project-relative with `/` separators.
pub trait FileStore: Send + Sync {
    /// Current content, `None` when the file does not exist
    fn read(&self, path: &str) -> Result<Option<String>>;

    fn write(&self, path: &str, content: &str) -> Result<()>;
}

/// In-memory project, used by tests and dry runs
#[derive(Default)]
pub struct MemoryFileStore {
    files: Mutex<BTreeMap<String, String>>,
}

impl MemoryFileStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_files<I, K, V>(files: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        Self {
            files: Mutex::new(files.into_iter().map(|(k, v)| (k.into(), v.into())).collect()),
        }
    }

    pub fn snapshot(&self) -> BTreeMap<String, String> {
        lock_mutex_recover(&self.files).clone()
    }
}

impl FileStore for MemoryFileStore {
    fn read(&self, path: &str) -> Result<Option<String>> {
        Ok(lock_mutex_recover(&self.files).get(path).cloned())
    }

    fn write(&self, path: &str, content: &str) -> Result<()> {
        lock_mutex_recover(&self.files).insert(path.to_string(), content.to_string());
        Ok(())
    }
}

/// Project rooted on disk
pub struct DiskFileStore {
    root: PathBuf,
}

impl DiskFileStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn resolve(&self, path: &str) -> Result<PathBuf> {
        let relative = Path::new(path);
        let escapes = relative
            .components()
            .any(|c| !matches!(c, Component::Normal(_) | Component::CurDir));
        if escapes {
            return Err(anyhow!("Path '{}' escapes the project root", path));
        }
        Ok(self.root.join(relative))
    }
}

impl FileStore for DiskFileStore {
    fn read(&self, path: &str) -> Result<Option<String>> {
        let full = self.resolve(path)?;
        if !full.exists() {
            return Ok(None);
        }
        fs::read_to_string(&full)
            .map(Some)
            .map_err(|e| anyhow!("Failed to read {:?}: {}", full, e))
    }

    fn write(&self, path: &str, content: &str) -> Result<()> {
        let full = self.resolve(path)?;
        if let Some(parent) = full.parent() {
            fs::create_dir_all(parent)
                .map_err(|e| anyhow!("Failed to create directory {:?}: {}", parent, e))?;
        }
        let temp = full.with_extension("tdd-tmp");
        fs::write(&temp, content).map_err(|e| anyhow!("Failed to write {:?}: {}", temp, e))?;
        fs::rename(&temp, &full)
            .map_err(|e| anyhow!("Failed to rename {:?} to {:?}: {}", temp, full, e))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_memory_store() {
        let store = MemoryFileStore::with_files([("a.x", "one")]);
        assert_eq!(store.read("a.x").unwrap().as_deref(), Some("one"));
        assert!(store.read("b.x").unwrap().is_none());
        store.write("b.x", "two").unwrap();
        assert_eq!(store.snapshot().len(), 2);
    }

    #[test]
    fn test_disk_store_roundtrip() {
        let temp_dir = TempDir::new().unwrap();
        let store = DiskFileStore::new(temp_dir.path());
        store.write("src/lib.x", "fn a() {}").unwrap();
        assert_eq!(store.read("src/lib.x").unwrap().as_deref(), Some("fn a() {}"));
        assert!(store.read("missing.x").unwrap().is_none());
    }

    #[test]
    fn test_disk_store_rejects_escape() {
        let temp_dir = TempDir::new().unwrap();
        let store = DiskFileStore::new(temp_dir.path());
        assert!(store.write("../outside.x", "x").is_err());
        assert!(store.read("/etc/passwd").is_err());
    }
}
