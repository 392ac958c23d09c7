// File-backed JSON record store
//
// Layout: <root>/<collection>/<id>.json, written atomically (temp file + rename)
// while holding an exclusive lock on <root>/<collection>/.lock.

use super::{check_revision, RecordStore, StoreError, StoreResult, StoredRecord};
use chrono::Utc;
use fs2::FileExt;
use std::fs::{self, File, OpenOptions};
use std::path::{Path, PathBuf};

pub struct JsonFileStore {
    root: PathBuf,
}

impl JsonFileStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Store rooted in the project's state directory
    pub fn for_project(project_path: &Path) -> Self {
        Self::new(crate::utils::state_dir(project_path).join("state"))
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn collection_dir(&self, collection: &str) -> PathBuf {
        self.root.join(collection)
    }

    fn record_path(&self, collection: &str, id: &str) -> PathBuf {
        self.collection_dir(collection).join(format!("{}.json", sanitize_id(id)))
    }

    fn lock_collection(&self, collection: &str) -> StoreResult<File> {
        let dir = self.collection_dir(collection);
        ensure_dir(&dir)?;
        let file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(false)
            .open(dir.join(".lock"))
            .map_err(|e| StoreError::Unavailable(format!("Failed to open lock file: {}", e)))?;
        file.lock_exclusive()
            .map_err(|e| StoreError::Unavailable(format!("Failed to lock {}: {}", collection, e)))?;
        Ok(file)
    }
}

impl RecordStore for JsonFileStore {
    fn save(
        &self,
        collection: &str,
        id: &str,
        record: &serde_json::Value,
        expected_revision: Option<u64>,
    ) -> StoreResult<u64> {
        let lock = self.lock_collection(collection)?;
        let path = self.record_path(collection, id);

        let current = if path.exists() {
            Some(read_record(&path)?.revision)
        } else {
            None
        };
        let revision = check_revision(collection, id, current, expected_revision)?;

        let stored = StoredRecord {
            id: id.to_string(),
            revision,
            updated_at: Utc::now(),
            record: record.clone(),
        };
        let content = serde_json::to_string_pretty(&stored)
            .map_err(|e| StoreError::Serialization(e.to_string()))?;
        let result = atomic_write(&path, &content);

        let _ = FileExt::unlock(&lock);
        result.map(|_| revision)
    }

    fn load(&self, collection: &str, id: &str) -> StoreResult<Option<StoredRecord>> {
        let path = self.record_path(collection, id);
        if !path.exists() {
            return Ok(None);
        }
        read_record(&path).map(Some)
    }

    fn list(&self, collection: &str) -> StoreResult<Vec<StoredRecord>> {
        let dir = self.collection_dir(collection);
        if !dir.exists() {
            return Ok(Vec::new());
        }

        let entries = fs::read_dir(&dir)
            .map_err(|e| StoreError::Unavailable(format!("Failed to read {:?}: {}", dir, e)))?;

        let mut records = Vec::new();
        for entry in entries.flatten() {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            match read_record(&path) {
                Ok(record) => records.push(record),
                Err(e) => log::warn!("[Storage] Skipping unreadable record {:?}: {}", path, e),
            }
        }
        records.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(records)
    }
}

/// Keep ids usable as file names
fn sanitize_id(id: &str) -> String {
    id.chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '-' || c == '_' || c == '.' { c } else { '_' })
        .collect()
}

fn ensure_dir(path: &Path) -> StoreResult<()> {
    if !path.exists() {
        fs::create_dir_all(path).map_err(|e| {
            StoreError::Unavailable(format!("Failed to create directory {:?}: {}", path, e))
        })?;
    }
    Ok(())
}

/// Write data to a file atomically (temp file + rename)
fn atomic_write(path: &Path, content: &str) -> StoreResult<()> {
    let temp_path = path.with_extension("tmp");

    if let Some(parent) = path.parent() {
        ensure_dir(parent)?;
    }

    fs::write(&temp_path, content).map_err(|e| {
        StoreError::Unavailable(format!("Failed to write temp file {:?}: {}", temp_path, e))
    })?;

    fs::rename(&temp_path, path).map_err(|e| {
        StoreError::Unavailable(format!("Failed to rename {:?} to {:?}: {}", temp_path, path, e))
    })?;

    Ok(())
}

fn read_record(path: &Path) -> StoreResult<StoredRecord> {
    let content = fs::read_to_string(path)
        .map_err(|e| StoreError::Unavailable(format!("Failed to read file {:?}: {}", path, e)))?;
    serde_json::from_str(&content)
        .map_err(|e| StoreError::Serialization(format!("Failed to parse JSON from {:?}: {}", path, e)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tempfile::TempDir;

    #[test]
    fn test_save_and_load() {
        let temp_dir = TempDir::new().unwrap();
        let store = JsonFileStore::new(temp_dir.path());

        let rev = store.save("cycles", "cyc-1", &json!({"phase": "DESIGN"}), None).unwrap();
        assert_eq!(rev, 1);

        let loaded = store.load("cycles", "cyc-1").unwrap().unwrap();
        assert_eq!(loaded.revision, 1);
        assert_eq!(loaded.record["phase"], "DESIGN");
        assert!(temp_dir.path().join("cycles").join("cyc-1.json").exists());
    }

    #[test]
    fn test_stale_revision_rejected() {
        let temp_dir = TempDir::new().unwrap();
        let store = JsonFileStore::new(temp_dir.path());

        store.save("cycles", "cyc-1", &json!({"n": 1}), None).unwrap();
        let rev = store.save("cycles", "cyc-1", &json!({"n": 2}), Some(1)).unwrap();
        assert_eq!(rev, 2);

        let err = store.save("cycles", "cyc-1", &json!({"n": 3}), Some(1)).unwrap_err();
        assert!(matches!(err, StoreError::RevisionConflict { actual: 2, .. }));

        let loaded = store.load("cycles", "cyc-1").unwrap().unwrap();
        assert_eq!(loaded.record["n"], 2);
    }

    #[test]
    fn test_list_sorted_and_skips_lock() {
        let temp_dir = TempDir::new().unwrap();
        let store = JsonFileStore::new(temp_dir.path());

        store.save("conflicts", "b", &json!({}), None).unwrap();
        store.save("conflicts", "a", &json!({}), None).unwrap();

        let ids: Vec<String> = store.list("conflicts").unwrap().into_iter().map(|r| r.id).collect();
        assert_eq!(ids, vec!["a", "b"]);
        assert!(store.list("allocations").unwrap().is_empty());
    }

    #[test]
    fn test_missing_record() {
        let temp_dir = TempDir::new().unwrap();
        let store = JsonFileStore::new(temp_dir.path());
        assert!(store.load("cycles", "nope").unwrap().is_none());
    }

    #[test]
    fn test_sanitize_id() {
        assert_eq!(sanitize_id("resource-cyc/1"), "resource-cyc_1");
    }
}
