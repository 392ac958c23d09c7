// Conflict detection for parallel cycles
//
// Static mode runs at admission and predicts collisions between a candidate
// story and every active cycle. Runtime mode classifies an actual write
// contention observed on the ledger or at commit.

use super::structure::{parse_unit_ref, HEADER_UNIT};
use crate::config::ConflictConfig;
use crate::models::{ConflictKind, ConflictSeverity, CycleId, Story};
use crate::utils::{clamp_unit, lock_mutex_recover};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::collections::{BTreeSet, HashMap};
use std::sync::Mutex;

/// Scores how likely two stories are to collide, in [0, 1]
pub trait ConflictPredictor: Send + Sync {
    fn predict(&self, a: &Story, b: &Story) -> f64;
}

/// Jaccard similarity of the declared file sets
pub struct JaccardPredictor;

impl ConflictPredictor for JaccardPredictor {
    fn predict(&self, a: &Story, b: &Story) -> f64 {
        let left: BTreeSet<&str> = a.touched_files.iter().map(String::as_str).collect();
        let right: BTreeSet<&str> = b.touched_files.iter().map(String::as_str).collect();
        let union = left.union(&right).count();
        if union == 0 {
            return 0.0;
        }
        left.intersection(&right).count() as f64 / union as f64
    }
}

/// What the detector needs to know about an active cycle
#[derive(Debug, Clone)]
pub struct CycleProfile {
    pub cycle_id: CycleId,
    pub story: Story,
    pub agent_ids: Vec<String>,
}

/// A predicted or observed collision, before the resolver takes ownership
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DetectedConflict {
    pub kind: ConflictKind,
    pub severity: ConflictSeverity,
    pub probability: f64,
    pub cycles: Vec<CycleId>,
    pub resource_id: String,
    pub units: Vec<String>,
    pub predicted: bool,
    pub detected_at: DateTime<Utc>,
}

/// Observed pair outcomes
#[derive(Debug, Default, Clone, Copy)]
struct PairStats {
    pairings: u32,
    conflicts: u32,
}

impl PairStats {
    fn rate(&self) -> f64 {
        if self.pairings == 0 {
            0.0
        } else {
            self.conflicts as f64 / self.pairings as f64
        }
    }
}

fn pair_key(a: &str, b: &str) -> (String, String) {
    if a <= b {
        (a.to_string(), b.to_string())
    } else {
        (b.to_string(), a.to_string())
    }
}

/// Order: severity desc, probability desc, earlier detection first
pub fn rank_order(a: &DetectedConflict, b: &DetectedConflict) -> Ordering {
    b.severity
        .cmp(&a.severity)
        .then_with(|| b.probability.partial_cmp(&a.probability).unwrap_or(Ordering::Equal))
        .then_with(|| a.detected_at.cmp(&b.detected_at))
}

fn is_test_file(path: &str) -> bool {
    let lower = path.to_lowercase();
    lower.contains("test") || lower.contains("spec")
}

/// Declared units of `story` on `file`
fn units_on(story: &Story, file: &str) -> BTreeSet<String> {
    story
        .touched_units
        .iter()
        .filter_map(|r| parse_unit_ref(r))
        .filter(|(path, _)| *path == file)
        .map(|(_, unit)| unit.to_string())
        .collect()
}

pub struct ConflictDetector {
    config: ConflictConfig,
    predictor: Box<dyn ConflictPredictor>,
    story_history: Mutex<HashMap<(String, String), PairStats>>,
    epic_history: Mutex<HashMap<(String, String), PairStats>>,
}

impl ConflictDetector {
    pub fn new(config: ConflictConfig) -> Self {
        Self::with_predictor(config, Box::new(JaccardPredictor))
    }

    pub fn with_predictor(config: ConflictConfig, predictor: Box<dyn ConflictPredictor>) -> Self {
        Self {
            config,
            predictor,
            story_history: Mutex::new(HashMap::new()),
            epic_history: Mutex::new(HashMap::new()),
        }
    }

    /// Record whether two stories that ran side by side collided
    pub fn record_outcome(&self, a: &Story, b: &Story, collided: bool) {
        let bump = |stats: &mut PairStats| {
            stats.pairings += 1;
            if collided {
                stats.conflicts += 1;
            }
        };
        bump(
            lock_mutex_recover(&self.story_history)
                .entry(pair_key(&a.id, &b.id))
                .or_default(),
        );
        if let (Some(ea), Some(eb)) = (&a.epic_id, &b.epic_id) {
            bump(
                lock_mutex_recover(&self.epic_history)
                    .entry(pair_key(ea, eb))
                    .or_default(),
            );
        }
    }

    /// Historical conflict rate between the stories, or their epics if higher
    pub fn history_rate(&self, a: &Story, b: &Story) -> f64 {
        let story_rate = lock_mutex_recover(&self.story_history)
            .get(&pair_key(&a.id, &b.id))
            .map(PairStats::rate)
            .unwrap_or(0.0);
        let epic_rate = match (&a.epic_id, &b.epic_id) {
            (Some(ea), Some(eb)) => lock_mutex_recover(&self.epic_history)
                .get(&pair_key(ea, eb))
                .map(PairStats::rate)
                .unwrap_or(0.0),
            _ => 0.0,
        };
        story_rate.max(epic_rate)
    }

    pub fn is_history_flagged(&self, a: &Story, b: &Story) -> bool {
        let rate = self.history_rate(a, b);
        rate > 0.0 && rate >= self.config.history_flag_threshold
    }

    /// Pair probability: predictor, raised by history and shared agents
    pub fn pair_probability(&self, candidate: &Story, other: &CycleProfile) -> f64 {
        let mut p = clamp_unit(self.predictor.predict(candidate, &other.story));
        let history = self.history_rate(candidate, &other.story);
        p += (1.0 - p) * history * self.config.history_weight;

        let shares_agent = candidate
            .preferred_agents
            .iter()
            .any(|a| other.agent_ids.contains(a) || other.story.preferred_agents.contains(a));
        if shares_agent {
            p += (1.0 - p) * self.config.shared_agent_weight;
        }
        clamp_unit(p)
    }

    /// Static prediction of a candidate against all active cycles, ranked
    pub fn predict(
        &self,
        candidate_id: &str,
        candidate: &Story,
        active: &[CycleProfile],
    ) -> Vec<DetectedConflict> {
        let now = Utc::now();
        let mut found = Vec::new();

        for other in active {
            let probability = self.pair_probability(candidate, other);
            let flagged = self.is_history_flagged(candidate, &other.story);
            let cycles = vec![candidate_id.to_string(), other.cycle_id.clone()];

            let mine: BTreeSet<&str> = candidate.touched_files.iter().map(String::as_str).collect();
            let theirs: BTreeSet<&str> = other.story.touched_files.iter().map(String::as_str).collect();
            let shared: Vec<&str> = mine.intersection(&theirs).copied().collect();

            if shared.is_empty() {
                if flagged {
                    found.push(DetectedConflict {
                        kind: ConflictKind::Semantic,
                        severity: ConflictSeverity::Low,
                        probability,
                        cycles,
                        resource_id: format!("story:{}", other.story.id),
                        units: Vec::new(),
                        predicted: true,
                        detected_at: now,
                    });
                }
                continue;
            }

            for file in shared {
                let ours = units_on(candidate, file);
                let other_units = units_on(&other.story, file);
                let common: Vec<String> = ours.intersection(&other_units).cloned().collect();

                let kind = if is_test_file(file) {
                    ConflictKind::TestCollision
                } else if common.iter().any(|u| u == HEADER_UNIT) {
                    ConflictKind::ImportConflict
                } else {
                    ConflictKind::FileOverlap
                };
                let severity = if !common.is_empty() {
                    ConflictSeverity::Critical
                } else if flagged {
                    ConflictSeverity::High
                } else if !ours.is_empty() && !other_units.is_empty() {
                    // Both declared their regions and they are disjoint
                    ConflictSeverity::Low
                } else {
                    ConflictSeverity::Medium
                };

                found.push(DetectedConflict {
                    kind,
                    severity,
                    probability,
                    cycles: cycles.clone(),
                    resource_id: file.to_string(),
                    units: common,
                    predicted: true,
                    detected_at: now,
                });
            }
        }

        found.sort_by(rank_order);
        if !found.is_empty() {
            log::info!(
                "[ConflictDetector] {} predicted conflict(s) for {} (top: {} {} p={:.2})",
                found.len(),
                candidate_id,
                found[0].kind,
                found[0].severity,
                found[0].probability
            );
        }
        found
    }

    /// Classify an observed write contention on `file`.
    ///
    /// `writer_units` are the units the writing cycle changed; `other_units`
    /// the units the contending cycle changed, `None` if it has no changes.
    pub fn runtime_conflict(
        &self,
        file: &str,
        writer: &CycleProfile,
        other: &CycleProfile,
        writer_units: &BTreeSet<String>,
        other_units: Option<&BTreeSet<String>>,
    ) -> DetectedConflict {
        let flagged = self.is_history_flagged(&writer.story, &other.story);
        let (severity, common) = match other_units {
            None => (ConflictSeverity::Low, Vec::new()),
            Some(theirs) => {
                let common: Vec<String> = writer_units.intersection(theirs).cloned().collect();
                let severity = if !common.is_empty() {
                    ConflictSeverity::Critical
                } else if flagged {
                    ConflictSeverity::High
                } else {
                    ConflictSeverity::Medium
                };
                (severity, common)
            }
        };

        let conflict = DetectedConflict {
            kind: ConflictKind::ConcurrentWrite,
            severity,
            probability: 1.0,
            cycles: vec![writer.cycle_id.clone(), other.cycle_id.clone()],
            resource_id: file.to_string(),
            units: common,
            predicted: false,
            detected_at: Utc::now(),
        };
        log::warn!(
            "[ConflictDetector] {} {} on {} between {} and {}",
            conflict.severity,
            conflict.kind,
            file,
            writer.cycle_id,
            other.cycle_id
        );
        conflict
    }

    /// Rank a batch of conflicts in place
    pub fn rank(conflicts: &mut [DetectedConflict]) {
        conflicts.sort_by(rank_order);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn profile(id: &str, story: Story) -> CycleProfile {
        CycleProfile {
            cycle_id: id.to_string(),
            story,
            agent_ids: Vec::new(),
        }
    }

    fn detector() -> ConflictDetector {
        ConflictDetector::new(ConflictConfig::default())
    }

    #[test]
    fn test_jaccard() {
        let a = Story::new("A", vec!["x".into(), "y".into()]);
        let b = Story::new("B", vec!["y".into(), "z".into()]);
        let p = JaccardPredictor.predict(&a, &b);
        assert!((p - 1.0 / 3.0).abs() < 1e-9);
        assert_eq!(JaccardPredictor.predict(&Story::new("C", vec![]), &Story::new("D", vec![])), 0.0);
    }

    #[test]
    fn test_disjoint_files_no_conflict() {
        let d = detector();
        let active = vec![profile("c1", Story::new("A", vec!["a.x".into()]))];
        let found = d.predict("c2", &Story::new("B", vec!["b.x".into()]), &active);
        assert!(found.is_empty());
    }

    #[test]
    fn test_file_overlap_predicted_medium() {
        let d = detector();
        let active = vec![profile("c1", Story::new("A", vec!["shared.x".into()]))];
        let found = d.predict("c2", &Story::new("B", vec!["shared.x".into()]), &active);
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].kind, ConflictKind::FileOverlap);
        assert_eq!(found[0].severity, ConflictSeverity::Medium);
        assert!((found[0].probability - 1.0).abs() < 1e-9);
        assert!(found[0].predicted);
    }

    #[test]
    fn test_same_unit_is_critical() {
        let d = detector();
        let a = Story::new("A", vec!["shared.x".into()]).with_units(vec!["shared.x::add".into()]);
        let b = Story::new("B", vec!["shared.x".into()]).with_units(vec!["shared.x::add".into()]);
        let found = d.predict("c2", &b, &[profile("c1", a)]);
        assert_eq!(found[0].severity, ConflictSeverity::Critical);
        assert_eq!(found[0].units, vec!["add".to_string()]);
    }

    #[test]
    fn test_disjoint_units_are_low() {
        let d = detector();
        let a = Story::new("A", vec!["shared.x".into()]).with_units(vec!["shared.x::add".into()]);
        let b = Story::new("B", vec!["shared.x".into()]).with_units(vec!["shared.x::sub".into()]);
        let found = d.predict("c2", &b, &[profile("c1", a)]);
        assert_eq!(found[0].severity, ConflictSeverity::Low);
    }

    #[test]
    fn test_kinds() {
        let d = detector();
        let a = Story::new("A", vec!["tests/api_test.x".into(), "lib.x".into()])
            .with_units(vec!["lib.x::<header>".into()]);
        let b = Story::new("B", vec!["tests/api_test.x".into(), "lib.x".into()])
            .with_units(vec!["lib.x::<header>".into()]);
        let found = d.predict("c2", &b, &[profile("c1", a)]);
        let kinds: Vec<ConflictKind> = found.iter().map(|c| c.kind).collect();
        assert!(kinds.contains(&ConflictKind::TestCollision));
        assert!(kinds.contains(&ConflictKind::ImportConflict));
        // Critical import conflict ranks first
        assert_eq!(found[0].kind, ConflictKind::ImportConflict);
    }

    #[test]
    fn test_history_raises_probability_and_flags_semantic() {
        let d = detector();
        let a = Story::new("A", vec!["a.x".into()]).with_epic("E1");
        let b = Story::new("B", vec!["b.x".into()]).with_epic("E2");
        d.record_outcome(&a, &b, true);
        d.record_outcome(&a, &b, false);
        assert!((d.history_rate(&a, &b) - 0.5).abs() < 1e-9);
        assert!(d.is_history_flagged(&a, &b));

        let found = d.predict("c2", &b, &[profile("c1", a)]);
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].kind, ConflictKind::Semantic);
        assert!((found[0].probability - 0.25).abs() < 1e-9);
    }

    #[test]
    fn test_shared_agent_weight() {
        let d = detector();
        let mut a = profile("c1", Story::new("A", vec!["a.x".into(), "b.x".into()]));
        a.agent_ids = vec!["code-1".to_string()];
        let mut b = Story::new("B", vec!["b.x".into()]);
        let base = d.pair_probability(&b, &a);
        b.preferred_agents = vec!["code-1".to_string()];
        let raised = d.pair_probability(&b, &a);
        assert!((base - 0.5).abs() < 1e-9);
        assert!((raised - 0.6).abs() < 1e-9);
    }

    #[test]
    fn test_runtime_severity() {
        let d = detector();
        let w = profile("c1", Story::new("A", vec!["s.x".into()]));
        let o = profile("c2", Story::new("B", vec!["s.x".into()]));
        let mine: BTreeSet<String> = ["add".to_string()].into_iter().collect();
        let same = mine.clone();
        let other: BTreeSet<String> = ["sub".to_string()].into_iter().collect();

        assert_eq!(d.runtime_conflict("s.x", &w, &o, &mine, Some(&same)).severity, ConflictSeverity::Critical);
        assert_eq!(d.runtime_conflict("s.x", &w, &o, &mine, Some(&other)).severity, ConflictSeverity::Medium);
        assert_eq!(d.runtime_conflict("s.x", &w, &o, &mine, None).severity, ConflictSeverity::Low);

        d.record_outcome(&w.story, &o.story, true);
        let c = d.runtime_conflict("s.x", &w, &o, &mine, Some(&other));
        assert_eq!(c.severity, ConflictSeverity::High);
        assert_eq!(c.kind, ConflictKind::ConcurrentWrite);
    }

    #[test]
    fn test_rank_order() {
        let now = Utc::now();
        let make = |severity, probability, offset| DetectedConflict {
            kind: ConflictKind::FileOverlap,
            severity,
            probability,
            cycles: vec![],
            resource_id: String::new(),
            units: vec![],
            predicted: true,
            detected_at: now + chrono::Duration::milliseconds(offset),
        };
        let mut list = vec![
            make(ConflictSeverity::Low, 0.9, 0),
            make(ConflictSeverity::High, 0.2, 2),
            make(ConflictSeverity::High, 0.2, 1),
            make(ConflictSeverity::High, 0.7, 3),
        ];
        ConflictDetector::rank(&mut list);
        assert_eq!(list[0].probability, 0.7);
        assert_eq!(list[1].detected_at, now + chrono::Duration::milliseconds(1));
        assert_eq!(list[3].severity, ConflictSeverity::Low);
    }
}
