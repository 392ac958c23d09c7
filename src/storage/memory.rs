// In-memory record store, used in tests and as the degraded fallback

use super::{check_revision, RecordStore, StoreError, StoreResult, StoredRecord};
use crate::utils::lock_mutex_recover;
use chrono::Utc;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;

#[derive(Default)]
pub struct MemoryStore {
    records: Mutex<BTreeMap<(String, String), StoredRecord>>,
    unavailable: AtomicBool,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every call fail as if the backing medium went away
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    pub fn len(&self) -> usize {
        lock_mutex_recover(&self.records).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn check_available(&self) -> StoreResult<()> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(StoreError::Unavailable("memory store marked unavailable".to_string()));
        }
        Ok(())
    }
}

impl RecordStore for MemoryStore {
    fn save(
        &self,
        collection: &str,
        id: &str,
        record: &serde_json::Value,
        expected_revision: Option<u64>,
    ) -> StoreResult<u64> {
        self.check_available()?;
        let mut records = lock_mutex_recover(&self.records);
        let key = (collection.to_string(), id.to_string());
        let current = records.get(&key).map(|r| r.revision);
        let revision = check_revision(collection, id, current, expected_revision)?;
        records.insert(
            key,
            StoredRecord {
                id: id.to_string(),
                revision,
                updated_at: Utc::now(),
                record: record.clone(),
            },
        );
        Ok(revision)
    }

    fn load(&self, collection: &str, id: &str) -> StoreResult<Option<StoredRecord>> {
        self.check_available()?;
        let records = lock_mutex_recover(&self.records);
        Ok(records.get(&(collection.to_string(), id.to_string())).cloned())
    }

    fn list(&self, collection: &str) -> StoreResult<Vec<StoredRecord>> {
        self.check_available()?;
        let records = lock_mutex_recover(&self.records);
        Ok(records
            .iter()
            .filter(|((c, _), _)| c == collection)
            .map(|(_, r)| r.clone())
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_revisions_increase() {
        let store = MemoryStore::new();
        assert_eq!(store.save("cycles", "a", &json!(1), None).unwrap(), 1);
        assert_eq!(store.save("cycles", "a", &json!(2), Some(1)).unwrap(), 2);
        assert!(store.save("cycles", "a", &json!(3), None).is_err());
        assert_eq!(store.len(), 1);
    }

    #[test]
    fn test_unavailable() {
        let store = MemoryStore::new();
        store.set_unavailable(true);
        assert!(matches!(
            store.save("cycles", "a", &json!(1), None),
            Err(StoreError::Unavailable(_))
        ));
        store.set_unavailable(false);
        assert!(store.load("cycles", "a").unwrap().is_none());
    }

    #[test]
    fn test_list_filters_collection() {
        let store = MemoryStore::new();
        store.save("cycles", "a", &json!(1), None).unwrap();
        store.save("conflicts", "b", &json!(1), None).unwrap();
        assert_eq!(store.list("cycles").unwrap().len(), 1);
    }
}
