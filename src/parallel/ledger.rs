// File claim ledger: atomic multi-file read/write reservations
//
// Invariant: at most one write-claim per file, and a file with a write-claim
// has no readers. A multi-file claim is all-or-nothing: shards are locked in
// ascending index order, every file is validated, then every file committed.

use crate::error::{first_violation, Violation};
use crate::models::CycleId;
use crate::utils::lock_mutex_recover;
use serde::{Deserialize, Serialize};
use std::collections::hash_map::DefaultHasher;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::hash::{Hash, Hasher};
use std::sync::{Mutex, MutexGuard};

const SHARD_COUNT: usize = 16;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum ClaimKind {
    Read,
    Write,
}

impl std::fmt::Display for ClaimKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ClaimKind::Read => write!(f, "read"),
            ClaimKind::Write => write!(f, "write"),
        }
    }
}

/// A file reservation held by a cycle
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct FileClaim {
    pub file: String,
    pub owner: CycleId,
    pub kind: ClaimKind,
}

/// Result of a claim attempt
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClaimOutcome {
    Granted,
    /// Nothing was claimed; these existing claims stood in the way
    Denied { blockers: Vec<FileClaim> },
}

impl ClaimOutcome {
    pub fn is_granted(&self) -> bool {
        matches!(self, ClaimOutcome::Granted)
    }
}

#[derive(Debug, Default)]
struct FileEntry {
    writer: Option<CycleId>,
    readers: BTreeSet<CycleId>,
}

impl FileEntry {
    fn is_empty(&self) -> bool {
        self.writer.is_none() && self.readers.is_empty()
    }

    fn blockers(&self, file: &str, cycle_id: &str, kind: ClaimKind) -> Vec<FileClaim> {
        let mut blockers = Vec::new();
        if let Some(writer) = &self.writer {
            if writer != cycle_id {
                blockers.push(FileClaim {
                    file: file.to_string(),
                    owner: writer.clone(),
                    kind: ClaimKind::Write,
                });
            }
        }
        if kind == ClaimKind::Write {
            blockers.extend(self.readers.iter().filter(|r| *r != cycle_id).map(|r| FileClaim {
                file: file.to_string(),
                owner: r.clone(),
                kind: ClaimKind::Read,
            }));
        }
        blockers
    }
}

type Shard = HashMap<String, FileEntry>;

pub struct FileConflictLedger {
    shards: Vec<Mutex<Shard>>,
}

impl FileConflictLedger {
    pub fn new() -> Self {
        Self {
            shards: (0..SHARD_COUNT).map(|_| Mutex::new(HashMap::new())).collect(),
        }
    }

    fn shard_of(file: &str) -> usize {
        let mut hasher = DefaultHasher::new();
        file.hash(&mut hasher);
        (hasher.finish() % SHARD_COUNT as u64) as usize
    }

    /// Lock the shards covering `files` in ascending order
    fn lock_for<'a>(&'a self, files: &BTreeSet<&str>) -> BTreeMap<usize, MutexGuard<'a, Shard>> {
        let indices: BTreeSet<usize> = files.iter().map(|f| Self::shard_of(f)).collect();
        indices
            .into_iter()
            .map(|idx| (idx, lock_mutex_recover(&self.shards[idx])))
            .collect()
    }

    /// Claim every file or none
    pub fn try_claim(&self, cycle_id: &str, files: &[String], kind: ClaimKind) -> bool {
        self.try_claim_detailed(cycle_id, files, kind).is_granted()
    }

    /// Claim every file or none, reporting the claims that blocked a denial.
    /// A cycle may upgrade its own read-claim to a write-claim.
    pub fn try_claim_detailed(&self, cycle_id: &str, files: &[String], kind: ClaimKind) -> ClaimOutcome {
        let files: BTreeSet<&str> = files.iter().map(String::as_str).collect();
        if files.is_empty() {
            return ClaimOutcome::Granted;
        }
        let mut guards = self.lock_for(&files);

        // Phase 1: validate
        let mut blockers = Vec::new();
        for file in &files {
            let shard = &guards[&Self::shard_of(file)];
            if let Some(entry) = shard.get(*file) {
                blockers.extend(entry.blockers(file, cycle_id, kind));
            }
        }
        if !blockers.is_empty() {
            log::debug!(
                "[Ledger] {} claim by {} denied on {} file(s)",
                kind,
                cycle_id,
                blockers.len()
            );
            return ClaimOutcome::Denied { blockers };
        }

        // Phase 2: commit
        for file in &files {
            let Some(shard) = guards.get_mut(&Self::shard_of(file)) else {
                continue;
            };
            let entry = shard.entry(file.to_string()).or_default();
            match kind {
                ClaimKind::Write => {
                    entry.readers.remove(cycle_id);
                    entry.writer = Some(cycle_id.to_string());
                }
                ClaimKind::Read => {
                    // A writer already reads what it writes
                    if entry.writer.as_deref() != Some(cycle_id) {
                        entry.readers.insert(cycle_id.to_string());
                    }
                }
            }
        }
        log::debug!("[Ledger] {} claimed {} file(s) for {}", kind, files.len(), cycle_id);
        ClaimOutcome::Granted
    }

    /// Drop the cycle's claims on `files`. Idempotent and non-blocking on other cycles.
    pub fn release(&self, cycle_id: &str, files: &[String]) {
        let files: BTreeSet<&str> = files.iter().map(String::as_str).collect();
        let mut guards = self.lock_for(&files);
        for file in &files {
            let Some(shard) = guards.get_mut(&Self::shard_of(file)) else {
                continue;
            };
            let now_empty = match shard.get_mut(*file) {
                Some(entry) => {
                    if entry.writer.as_deref() == Some(cycle_id) {
                        entry.writer = None;
                    }
                    entry.readers.remove(cycle_id);
                    entry.is_empty()
                }
                None => false,
            };
            if now_empty {
                shard.remove(*file);
            }
        }
    }

    /// Turn the cycle's write-claims on `files` back into read-claims
    pub fn downgrade(&self, cycle_id: &str, files: &[String]) {
        let files: BTreeSet<&str> = files.iter().map(String::as_str).collect();
        let mut guards = self.lock_for(&files);
        for file in &files {
            if let Some(entry) = guards
                .get_mut(&Self::shard_of(file))
                .and_then(|shard| shard.get_mut(*file))
            {
                if entry.writer.as_deref() == Some(cycle_id) {
                    entry.writer = None;
                    entry.readers.insert(cycle_id.to_string());
                }
            }
        }
    }

    /// Drop every claim the cycle holds
    pub fn release_all(&self, cycle_id: &str) {
        for shard in &self.shards {
            let mut shard = lock_mutex_recover(shard);
            shard.retain(|_, entry| {
                if entry.writer.as_deref() == Some(cycle_id) {
                    entry.writer = None;
                }
                entry.readers.remove(cycle_id);
                !entry.is_empty()
            });
        }
    }

    /// Claims held by one cycle, sorted by file
    pub fn claims_of(&self, cycle_id: &str) -> Vec<FileClaim> {
        let mut claims: Vec<FileClaim> = self
            .snapshot()
            .into_iter()
            .filter(|c| c.owner == cycle_id)
            .collect();
        claims.sort_by(|a, b| a.file.cmp(&b.file));
        claims
    }

    /// Every other cycle holding any claim on `file`
    pub fn holders(&self, file: &str, excluding: &str) -> Vec<FileClaim> {
        let shard = lock_mutex_recover(&self.shards[Self::shard_of(file)]);
        shard
            .get(file)
            .map(|entry| {
                let mut claims = entry.blockers(file, excluding, ClaimKind::Write);
                claims.sort_by(|a, b| a.owner.cmp(&b.owner));
                claims
            })
            .unwrap_or_default()
    }

    pub fn writer_of(&self, file: &str) -> Option<CycleId> {
        let shard = lock_mutex_recover(&self.shards[Self::shard_of(file)]);
        shard.get(file).and_then(|e| e.writer.clone())
    }

    /// All claims. Each shard is read under its own lock.
    pub fn snapshot(&self) -> Vec<FileClaim> {
        let mut claims = Vec::new();
        for shard in &self.shards {
            let shard = lock_mutex_recover(shard);
            for (file, entry) in shard.iter() {
                if let Some(writer) = &entry.writer {
                    claims.push(FileClaim {
                        file: file.clone(),
                        owner: writer.clone(),
                        kind: ClaimKind::Write,
                    });
                }
                claims.extend(entry.readers.iter().map(|r| FileClaim {
                    file: file.clone(),
                    owner: r.clone(),
                    kind: ClaimKind::Read,
                }));
            }
        }
        claims
    }

    /// Files write-claimed alongside readers; the writer is to blame
    pub fn violations(&self) -> Vec<Violation> {
        let mut violations = Vec::new();
        for shard in &self.shards {
            let shard = lock_mutex_recover(shard);
            for (file, entry) in shard.iter() {
                let Some(writer) = &entry.writer else { continue };
                if !entry.readers.is_empty() {
                    violations.push(Violation::new(
                        format!(
                            "file '{}' has a write-claim by {} alongside readers {:?}",
                            file, writer, entry.readers
                        ),
                        vec![writer.clone()],
                    ));
                }
            }
        }
        violations
    }

    pub fn check_invariants(&self) -> Result<(), String> {
        first_violation(self.violations())
    }

    /// Record a write-claim without any checks
    #[cfg(test)]
    pub(crate) fn force_write(&self, cycle_id: &str, file: &str) {
        let mut shard = lock_mutex_recover(&self.shards[Self::shard_of(file)]);
        shard.entry(file.to_string()).or_default().writer = Some(cycle_id.to_string());
    }
}

impl Default for FileConflictLedger {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn files(names: &[&str]) -> Vec<String> {
        names.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_reads_coexist() {
        let ledger = FileConflictLedger::new();
        assert!(ledger.try_claim("a", &files(&["x"]), ClaimKind::Read));
        assert!(ledger.try_claim("b", &files(&["x"]), ClaimKind::Read));
        assert_eq!(ledger.snapshot().len(), 2);
    }

    #[test]
    fn test_write_excludes_everyone() {
        let ledger = FileConflictLedger::new();
        assert!(ledger.try_claim("a", &files(&["x"]), ClaimKind::Write));
        assert!(!ledger.try_claim("b", &files(&["x"]), ClaimKind::Read));
        assert!(!ledger.try_claim("b", &files(&["x"]), ClaimKind::Write));
        assert_eq!(ledger.writer_of("x").as_deref(), Some("a"));
    }

    #[test]
    fn test_write_denied_while_others_read() {
        let ledger = FileConflictLedger::new();
        assert!(ledger.try_claim("a", &files(&["x"]), ClaimKind::Read));
        match ledger.try_claim_detailed("b", &files(&["x"]), ClaimKind::Write) {
            ClaimOutcome::Denied { blockers } => {
                assert_eq!(blockers.len(), 1);
                assert_eq!(blockers[0].owner, "a");
                assert_eq!(blockers[0].kind, ClaimKind::Read);
            }
            ClaimOutcome::Granted => panic!("write must be denied"),
        }
    }

    #[test]
    fn test_upgrade_own_read() {
        let ledger = FileConflictLedger::new();
        assert!(ledger.try_claim("a", &files(&["x", "y"]), ClaimKind::Read));
        assert!(ledger.try_claim("a", &files(&["x"]), ClaimKind::Write));
        assert!(ledger.check_invariants().is_ok());
        let claims = ledger.claims_of("a");
        assert_eq!(claims[0], FileClaim { file: "x".into(), owner: "a".into(), kind: ClaimKind::Write });
        assert_eq!(claims[1].kind, ClaimKind::Read);

        ledger.downgrade("a", &files(&["x"]));
        assert!(ledger.writer_of("x").is_none());
        assert!(ledger.try_claim("b", &files(&["x"]), ClaimKind::Read));
    }

    #[test]
    fn test_failed_claim_leaves_nothing() {
        let ledger = FileConflictLedger::new();
        assert!(ledger.try_claim("a", &files(&["m"]), ClaimKind::Write));
        let many = files(&["c", "d", "e", "f", "g", "h", "m", "z"]);
        assert!(!ledger.try_claim("b", &many, ClaimKind::Write));
        assert!(ledger.claims_of("b").is_empty());
    }

    #[test]
    fn test_release_is_idempotent() {
        let ledger = FileConflictLedger::new();
        assert!(ledger.try_claim("a", &files(&["x", "y"]), ClaimKind::Write));
        ledger.release("a", &files(&["x", "y"]));
        ledger.release("a", &files(&["x", "y"]));
        ledger.release_all("a");
        assert!(ledger.snapshot().is_empty());
        assert!(ledger.try_claim("b", &files(&["x"]), ClaimKind::Write));
    }

    #[test]
    fn test_release_only_own_claims() {
        let ledger = FileConflictLedger::new();
        assert!(ledger.try_claim("a", &files(&["x"]), ClaimKind::Read));
        assert!(ledger.try_claim("b", &files(&["x"]), ClaimKind::Read));
        ledger.release("a", &files(&["x"]));
        assert_eq!(ledger.holders("x", "a").len(), 1);
    }

    #[test]
    fn test_empty_claim_granted() {
        let ledger = FileConflictLedger::new();
        assert!(ledger.try_claim("a", &[], ClaimKind::Write));
    }

    #[test]
    fn test_violation_blames_the_writer() {
        let ledger = FileConflictLedger::new();
        assert!(ledger.try_claim("reader", &files(&["x"]), ClaimKind::Read));
        assert!(ledger.violations().is_empty());

        ledger.force_write("intruder", "x");
        let violations = ledger.violations();
        assert_eq!(violations.len(), 1);
        assert_eq!(violations[0].cycles, vec!["intruder".to_string()]);
        assert!(ledger.check_invariants().is_err());
    }
}
