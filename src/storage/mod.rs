//! Persistence for cycles, conflicts and allocations
//!
//! Records live in three keyed collections, each record carrying a monotonic
//! revision for optimistic-concurrency updates:
//! - `cycles/` - Cycle records keyed by cycle id
//! - `conflicts/` - Conflict audit records keyed by conflict id
//! - `allocations/` - `resource-<cycle>` and `tokens-<cycle>` records
//!
//! The engine talks to storage only through [`PersistenceGateway`], which
//! degrades to in-memory operation when the primary store fails.

pub mod gateway;
pub mod json_store;
pub mod memory;

pub use gateway::PersistenceGateway;
pub use json_store::JsonFileStore;
pub use memory::MemoryStore;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub const COLLECTION_CYCLES: &str = "cycles";
pub const COLLECTION_CONFLICTS: &str = "conflicts";
pub const COLLECTION_ALLOCATIONS: &str = "allocations";

/// Key of a cycle's resource allocation in the allocations collection
pub fn resource_key(cycle_id: &str) -> String {
    format!("resource-{}", cycle_id)
}

/// Key of a cycle's token allocation in the allocations collection
pub fn tokens_key(cycle_id: &str) -> String {
    format!("tokens-{}", cycle_id)
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("Storage unavailable: {0}")]
    Unavailable(String),

    #[error("Revision conflict on {collection}/{id}: expected {expected:?}, found {actual}")]
    RevisionConflict {
        collection: String,
        id: String,
        expected: Option<u64>,
        actual: u64,
    },

    #[error("Serialization failed: {0}")]
    Serialization(String),
}

pub type StoreResult<T> = Result<T, StoreError>;

/// A persisted record and its revision
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StoredRecord {
    pub id: String,
    pub revision: u64,
    pub updated_at: DateTime<Utc>,
    pub record: serde_json::Value,
}

/// Keyed record storage
///
/// `save` succeeds only when `expected_revision` matches the stored revision
/// (`None` meaning the record must not exist yet) and returns the new revision.
pub trait RecordStore: Send + Sync {
    fn save(
        &self,
        collection: &str,
        id: &str,
        record: &serde_json::Value,
        expected_revision: Option<u64>,
    ) -> StoreResult<u64>;

    fn load(&self, collection: &str, id: &str) -> StoreResult<Option<StoredRecord>>;

    fn list(&self, collection: &str) -> StoreResult<Vec<StoredRecord>>;
}

/// Shared revision check used by both stores
pub(crate) fn check_revision(
    collection: &str,
    id: &str,
    current: Option<u64>,
    expected: Option<u64>,
) -> StoreResult<u64> {
    match (current, expected) {
        (None, None) => Ok(1),
        (Some(actual), Some(exp)) if actual == exp => Ok(actual + 1),
        (current, expected) => Err(StoreError::RevisionConflict {
            collection: collection.to_string(),
            id: id.to_string(),
            expected,
            actual: current.unwrap_or(0),
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_keys() {
        assert_eq!(resource_key("cyc-1"), "resource-cyc-1");
        assert_eq!(tokens_key("cyc-1"), "tokens-cyc-1");
    }

    #[test]
    fn test_check_revision() {
        assert_eq!(check_revision("c", "a", None, None).unwrap(), 1);
        assert_eq!(check_revision("c", "a", Some(3), Some(3)).unwrap(), 4);
        assert!(check_revision("c", "a", Some(3), Some(2)).is_err());
        assert!(check_revision("c", "a", Some(1), None).is_err());
        assert!(check_revision("c", "a", None, Some(1)).is_err());
    }
}
