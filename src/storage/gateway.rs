// Persistence gateway with in-memory degradation

use super::{MemoryStore, RecordStore, StoreError, StoredRecord};
use crate::events::{EventBroadcaster, EVENT_STORAGE_DEGRADED};
use crate::utils::lock_mutex_recover;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

/// Front door for all engine persistence.
///
/// Tracks the last revision it wrote per record so each save is an
/// optimistic-concurrency update. The first time the primary store fails
/// the gateway logs a warning, emits `storage:degraded` and serves every
/// later call from an in-memory fallback. It never returns an error to
/// the engine.
pub struct PersistenceGateway {
    primary: Arc<dyn RecordStore>,
    fallback: MemoryStore,
    degraded: AtomicBool,
    revisions: Mutex<HashMap<(String, String), u64>>,
    events: Option<Arc<EventBroadcaster>>,
}

impl PersistenceGateway {
    pub fn new(primary: Arc<dyn RecordStore>) -> Self {
        Self {
            primary,
            fallback: MemoryStore::new(),
            degraded: AtomicBool::new(false),
            revisions: Mutex::new(HashMap::new()),
            events: None,
        }
    }

    /// Gateway with no durable store at all
    pub fn in_memory() -> Self {
        Self::new(Arc::new(MemoryStore::new()))
    }

    pub fn with_events(mut self, events: Arc<EventBroadcaster>) -> Self {
        self.events = Some(events);
        self
    }

    pub fn is_degraded(&self) -> bool {
        self.degraded.load(Ordering::SeqCst)
    }

    fn store(&self) -> &dyn RecordStore {
        if self.is_degraded() {
            &self.fallback as &dyn RecordStore
        } else {
            self.primary.as_ref()
        }
    }

    fn degrade(&self, reason: &str) {
        if self.degraded.swap(true, Ordering::SeqCst) {
            return;
        }
        log::warn!(
            "[Storage] Primary store failed ({}); continuing with in-memory storage",
            reason
        );
        if let Some(events) = &self.events {
            events.broadcast(
                EVENT_STORAGE_DEGRADED,
                None,
                format!("Storage degraded to in-memory operation: {}", reason),
                serde_json::json!({ "reason": reason }),
            );
        }
    }

    /// Save an entity, returning its new revision (None if serialization failed)
    pub fn save<T: Serialize>(&self, collection: &str, id: &str, entity: &T) -> Option<u64> {
        let value = match serde_json::to_value(entity) {
            Ok(v) => v,
            Err(e) => {
                log::error!("[Storage] Failed to serialize {}/{}: {}", collection, id, e);
                return None;
            }
        };

        let key = (collection.to_string(), id.to_string());
        let expected = lock_mutex_recover(&self.revisions).get(&key).copied();

        let result = match self.store().save(collection, id, &value, expected) {
            Err(StoreError::RevisionConflict { actual, .. }) => {
                // Another writer of this store bumped the record; the owning component's view wins
                log::warn!(
                    "[Storage] Revision conflict on {}/{} (expected {:?}, found {}), overwriting",
                    collection,
                    id,
                    expected,
                    actual
                );
                let expected = if actual == 0 { None } else { Some(actual) };
                self.store().save(collection, id, &value, expected)
            }
            other => other,
        };

        let revision = match result {
            Ok(rev) => rev,
            Err(e) => {
                self.degrade(&e.to_string());
                let current = self
                    .fallback
                    .load(collection, id)
                    .ok()
                    .flatten()
                    .map(|r| r.revision);
                match self.fallback.save(collection, id, &value, current) {
                    Ok(rev) => rev,
                    Err(e) => {
                        log::error!("[Storage] In-memory fallback rejected {}/{}: {}", collection, id, e);
                        return None;
                    }
                }
            }
        };

        lock_mutex_recover(&self.revisions).insert(key, revision);
        Some(revision)
    }

    /// Load an entity and its revision
    pub fn load<T: DeserializeOwned>(&self, collection: &str, id: &str) -> Option<(T, u64)> {
        let record = match self.store().load(collection, id) {
            Ok(r) => r,
            Err(e) => {
                self.degrade(&e.to_string());
                self.fallback.load(collection, id).ok().flatten()
            }
        }?;
        decode(collection, record).map(|(entity, rev)| {
            lock_mutex_recover(&self.revisions)
                .insert((collection.to_string(), id.to_string()), rev);
            (entity, rev)
        })
    }

    /// All entities in a collection that decode as `T`
    pub fn list<T: DeserializeOwned>(&self, collection: &str) -> Vec<T> {
        let records = match self.store().list(collection) {
            Ok(r) => r,
            Err(e) => {
                self.degrade(&e.to_string());
                self.fallback.list(collection).unwrap_or_default()
            }
        };
        records
            .into_iter()
            .filter_map(|r| decode(collection, r).map(|(entity, _)| entity))
            .collect()
    }
}

fn decode<T: DeserializeOwned>(collection: &str, record: StoredRecord) -> Option<(T, u64)> {
    match serde_json::from_value(record.record) {
        Ok(entity) => Some((entity, record.revision)),
        Err(e) => {
            log::warn!("[Storage] Skipping undecodable {}/{}: {}", collection, record.id, e);
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;

    #[derive(Debug, Serialize, Deserialize, PartialEq)]
    struct Rec {
        n: u32,
    }

    #[test]
    fn test_save_tracks_revisions() {
        let gateway = PersistenceGateway::in_memory();
        assert_eq!(gateway.save("cycles", "a", &Rec { n: 1 }), Some(1));
        assert_eq!(gateway.save("cycles", "a", &Rec { n: 2 }), Some(2));
        let (rec, rev): (Rec, u64) = gateway.load("cycles", "a").unwrap();
        assert_eq!(rec, Rec { n: 2 });
        assert_eq!(rev, 2);
    }

    #[test]
    fn test_degrades_without_crashing() {
        let primary = Arc::new(MemoryStore::new());
        let events = Arc::new(EventBroadcaster::new());
        let mut rx = events.subscribe();
        let gateway = PersistenceGateway::new(primary.clone()).with_events(events);

        gateway.save("cycles", "a", &Rec { n: 1 });
        primary.set_unavailable(true);

        assert!(gateway.save("cycles", "b", &Rec { n: 2 }).is_some());
        assert!(gateway.is_degraded());
        let (rec, _): (Rec, u64) = gateway.load("cycles", "b").unwrap();
        assert_eq!(rec.n, 2);

        let event = rx.try_recv().unwrap();
        assert_eq!(event.event, EVENT_STORAGE_DEGRADED);
    }

    #[test]
    fn test_external_writer_does_not_block_owner() {
        let primary = Arc::new(MemoryStore::new());
        let gateway = PersistenceGateway::new(primary.clone());
        gateway.save("cycles", "a", &Rec { n: 1 });
        primary
            .save("cycles", "a", &serde_json::json!({"n": 9}), Some(1))
            .unwrap();

        assert_eq!(gateway.save("cycles", "a", &Rec { n: 3 }), Some(3));
        assert!(!gateway.is_degraded());
    }

    #[test]
    fn test_list_decodes() {
        let gateway = PersistenceGateway::in_memory();
        gateway.save("conflicts", "x", &Rec { n: 1 });
        gateway.save("conflicts", "y", &Rec { n: 2 });
        let all: Vec<Rec> = gateway.list("conflicts");
        assert_eq!(all.len(), 2);
    }
}
