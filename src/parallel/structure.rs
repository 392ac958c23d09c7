// Structural units of a source file, per-unit diff and three-way unit merge
//
// A unit is a top-level declaration (function, class, struct, impl, ...)
// together with the comment/attribute lines directly above it. Everything
// before the first declaration is the `<header>` unit (imports, module docs).

use regex::Regex;
use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::sync::OnceLock;

/// Name of the unit holding everything before the first declaration
pub const HEADER_UNIT: &str = "<header>";

fn declaration_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(
            r"^(?:pub(?:\([^)]*\))?\s+)?(?:export\s+)?(?:default\s+)?(?:async\s+)?(?:unsafe\s+)?(fn|def|class|function|struct|impl|enum|trait|interface)\b\s*(?:<[^>]*>\s*)?([A-Za-z_][A-Za-z0-9_]*)?",
        )
        .expect("declaration regex is valid")
    })
}

fn is_leading_trivia(line: &str) -> bool {
    let t = line.trim_start();
    !t.is_empty()
        && (t.starts_with("//")
            || t.starts_with("/*")
            || t.starts_with('*')
            || t.starts_with('#')
            || t.starts_with('@'))
}

/// One structural unit
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Unit {
    pub name: String,
    pub text: String,
}

/// Split content into ordered units. Names are unique within the file.
pub fn split_units(content: &str) -> Vec<Unit> {
    let lines: Vec<&str> = content.split_inclusive('\n').collect();
    let re = declaration_regex();

    // (line index where the unit starts, name)
    let mut starts: Vec<(usize, String)> = Vec::new();
    let mut seen: BTreeMap<String, usize> = BTreeMap::new();
    for (idx, line) in lines.iter().enumerate() {
        let Some(caps) = re.captures(line) else { continue };
        let keyword = caps.get(1).map(|m| m.as_str()).unwrap_or("unit");
        let base = caps
            .get(2)
            .map(|m| m.as_str().to_string())
            .unwrap_or_else(|| keyword.to_string());
        let count = seen.entry(base.clone()).or_insert(0);
        *count += 1;
        let name = if *count == 1 { base } else { format!("{}#{}", base, count) };

        // Pull directly preceding comments/attributes into this unit
        let floor = starts.last().map(|(s, _)| s + 1).unwrap_or(0);
        let mut start = idx;
        while start > floor && is_leading_trivia(lines[start - 1]) {
            start -= 1;
        }
        starts.push((start, name));
    }

    let mut units = Vec::with_capacity(starts.len() + 1);
    let header_end = starts.first().map(|(s, _)| *s).unwrap_or(lines.len());
    units.push(Unit {
        name: HEADER_UNIT.to_string(),
        text: lines[..header_end].concat(),
    });
    for (i, (start, name)) in starts.iter().enumerate() {
        let end = starts.get(i + 1).map(|(s, _)| *s).unwrap_or(lines.len());
        units.push(Unit {
            name: name.clone(),
            text: lines[*start..end].concat(),
        });
    }
    units
}

/// How one side changed a unit relative to the ancestor
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UnitChange {
    Added(String),
    Modified(String),
    Removed,
}

fn normalize(text: &str) -> &str {
    text.trim_end()
}

/// Units whose content differs between `ancestor` and `side`
pub fn diff_units(ancestor: &str, side: &str) -> BTreeMap<String, UnitChange> {
    let base: BTreeMap<String, String> = split_units(ancestor)
        .into_iter()
        .map(|u| (u.name, u.text))
        .collect();
    let ours: BTreeMap<String, String> = split_units(side)
        .into_iter()
        .map(|u| (u.name, u.text))
        .collect();

    let mut changes = BTreeMap::new();
    for (name, text) in &ours {
        match base.get(name) {
            None => {
                changes.insert(name.clone(), UnitChange::Added(text.clone()));
            }
            Some(old) if normalize(old) != normalize(text) => {
                changes.insert(name.clone(), UnitChange::Modified(text.clone()));
            }
            Some(_) => {}
        }
    }
    for name in base.keys() {
        if !ours.contains_key(name) {
            changes.insert(name.clone(), UnitChange::Removed);
        }
    }
    changes
}

/// Names of the units a side changed
pub fn changed_unit_names(ancestor: &str, side: &str) -> BTreeSet<String> {
    diff_units(ancestor, side).into_keys().collect()
}

/// Outcome of a three-way unit merge
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MergeOutcome {
    Merged(String),
    /// Units both sides changed differently
    Conflict(Vec<String>),
}

/// Merge two sides onto their common ancestor, unit by unit.
/// Succeeds only when the changed-unit sets are disjoint (identical changes
/// count as one); any unit changed differently by both sides fails the merge.
pub fn merge_three_way(ancestor: &str, ours: &str, theirs: &str) -> MergeOutcome {
    let our_changes = diff_units(ancestor, ours);
    let their_changes = diff_units(ancestor, theirs);

    let contested: Vec<String> = our_changes
        .iter()
        .filter_map(|(name, change)| match their_changes.get(name) {
            Some(other) if !same_change(change, other) => Some(name.clone()),
            _ => None,
        })
        .collect();
    if !contested.is_empty() {
        return MergeOutcome::Conflict(contested);
    }

    let base_units = split_units(ancestor);
    let mut merged: Vec<Unit> = Vec::with_capacity(base_units.len());
    for unit in base_units {
        let change = our_changes.get(&unit.name).or_else(|| their_changes.get(&unit.name));
        match change {
            Some(UnitChange::Removed) => {}
            Some(UnitChange::Modified(text)) | Some(UnitChange::Added(text)) => merged.push(Unit {
                name: unit.name,
                text: text.clone(),
            }),
            None => merged.push(unit),
        }
    }

    // Added units go after their predecessor on the side that added them
    let mut placed: HashSet<String> = merged.iter().map(|u| u.name.clone()).collect();
    for side in [ours, theirs] {
        let side_units = split_units(side);
        for (idx, unit) in side_units.iter().enumerate() {
            if placed.contains(&unit.name) {
                continue;
            }
            let added = matches!(
                our_changes.get(&unit.name).or_else(|| their_changes.get(&unit.name)),
                Some(UnitChange::Added(_))
            );
            if !added {
                continue;
            }
            let position = side_units[..idx]
                .iter()
                .rev()
                .find_map(|prev| merged.iter().position(|m| m.name == prev.name))
                .map(|p| p + 1)
                .unwrap_or(merged.len());
            merged.insert(position, unit.clone());
            placed.insert(unit.name.clone());
        }
    }

    MergeOutcome::Merged(join_units(&merged))
}

fn same_change(a: &UnitChange, b: &UnitChange) -> bool {
    match (a, b) {
        (UnitChange::Removed, UnitChange::Removed) => true,
        (UnitChange::Added(x), UnitChange::Added(y))
        | (UnitChange::Modified(x), UnitChange::Modified(y)) => normalize(x) == normalize(y),
        _ => false,
    }
}

fn join_units(units: &[Unit]) -> String {
    let mut out = String::new();
    for unit in units {
        if !out.is_empty() && !out.ends_with('\n') {
            out.push('\n');
        }
        out.push_str(&unit.text);
    }
    out
}

/// Human-readable per-unit diff of one side against the ancestor
pub fn render_diff(ancestor: &str, side: &str) -> String {
    let base: BTreeMap<String, String> = split_units(ancestor)
        .into_iter()
        .map(|u| (u.name, u.text))
        .collect();
    let mut out = String::new();
    for (name, change) in diff_units(ancestor, side) {
        out.push_str(&format!("@@ {} @@\n", name));
        if let Some(old) = base.get(&name) {
            for line in old.lines() {
                out.push_str(&format!("-{}\n", line));
            }
        }
        match change {
            UnitChange::Added(text) | UnitChange::Modified(text) => {
                for line in text.lines() {
                    out.push_str(&format!("+{}\n", line));
                }
            }
            UnitChange::Removed => {}
        }
    }
    out
}

/// ASCII grid of which side touched which unit
pub fn render_unit_grid(ancestor: &str, sides: &[(&str, &str)]) -> String {
    let changes: Vec<(&str, BTreeSet<String>)> = sides
        .iter()
        .map(|(label, content)| (*label, changed_unit_names(ancestor, content)))
        .collect();
    let mut units: BTreeSet<String> = split_units(ancestor).into_iter().map(|u| u.name).collect();
    for (_, names) in &changes {
        units.extend(names.iter().cloned());
    }

    let width = units.iter().map(|u| u.len()).max().unwrap_or(4).max(4);
    let mut out = format!("{:width$} |", "unit", width = width);
    for (label, _) in &changes {
        out.push_str(&format!(" {} |", label));
    }
    out.push('\n');
    for unit in &units {
        out.push_str(&format!("{:width$} |", unit, width = width));
        let touched = changes.iter().filter(|(_, names)| names.contains(unit)).count();
        for (label, names) in &changes {
            let mark = match (names.contains(unit), touched > 1) {
                (true, true) => "!!",
                (true, false) => "**",
                _ => "",
            };
            out.push_str(&format!(" {:w$} |", mark, w = label.len()));
        }
        out.push('\n');
    }
    out
}

/// Split a `path::unit` reference
pub fn parse_unit_ref(reference: &str) -> Option<(&str, &str)> {
    reference.rsplit_once("::")
}
