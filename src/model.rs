// src/model.rs

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

/// Line number inside a file, 1-based
pub type LineNo = u32;

/// A commit as seen by the history walk
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Commit {
    pub id: git2::Oid,
    pub parents: Vec<git2::Oid>,
    /// Commit time in seconds since the epoch
    pub time: i64,
    pub tree: git2::Oid,
}

impl Commit {
    pub fn short_id(&self) -> String {
        let full = self.id.to_string();
        full[..full.len().min(10)].to_string()
    }

    pub fn has_parent(&self, parent: git2::Oid) -> bool {
        self.parents.contains(&parent)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PatchStatus {
    Added,
    Deleted,
    Modified,
    Renamed,
    Copied,
    Other,
}

/// One line of a hunk. A missing number marks an added (no old) or deleted (no new) line.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DiffLine {
    pub old_lineno: Option<LineNo>,
    pub new_lineno: Option<LineNo>,
}

impl DiffLine {
    pub fn context(old: LineNo, new: LineNo) -> Self {
        Self { old_lineno: Some(old), new_lineno: Some(new) }
    }

    pub fn added(new: LineNo) -> Self {
        Self { old_lineno: None, new_lineno: Some(new) }
    }

    pub fn deleted(old: LineNo) -> Self {
        Self { old_lineno: Some(old), new_lineno: None }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Hunk {
    pub lines: Vec<DiffLine>,
}

/// Changes to a single file between two commits
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Patch {
    pub old_path: String,
    pub new_path: String,
    pub status: PatchStatus,
    pub binary: bool,
    pub hunks: Vec<Hunk>,
}

/// Ordered per-file patches between two commits
pub type Diff = Vec<Patch>;

/// Which side of a diff a value belongs to
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Version {
    Old,
    New,
}

/// File path -> lines to instrument during one run
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TargetSpec(pub BTreeMap<String, BTreeSet<LineNo>>);

impl TargetSpec {
    pub fn insert(&mut self, file: &str, line: LineNo) {
        self.0.entry(file.to_string()).or_default().insert(line);
    }

    pub fn is_empty(&self) -> bool {
        self.0.values().all(BTreeSet::is_empty)
    }

    pub fn files(&self) -> impl Iterator<Item = &str> {
        self.0.keys().map(String::as_str)
    }

    pub fn lines(&self, file: &str) -> Option<&BTreeSet<LineNo>> {
        self.0.get(file)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &BTreeSet<LineNo>)> {
        self.0.iter()
    }
}

/// The two target specs derived from one diff
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ModifiedLines {
    pub old: TargetSpec,
    pub new: TargetSpec,
}

impl ModifiedLines {
    pub fn for_version(&self, version: Version) -> &TargetSpec {
        match version {
            Version::Old => &self.old,
            Version::New => &self.new,
        }
    }
}

/// One observation of local state at a matched line
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Snapshot {
    pub code_context: Vec<String>,
    pub target_line: String,
    pub variables: BTreeMap<String, String>,
}

/// File path -> line -> every snapshot taken there, in capture order
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TraceRecord(pub BTreeMap<String, BTreeMap<LineNo, Vec<Snapshot>>>);

impl TraceRecord {
    pub fn push(&mut self, file: &str, line: LineNo, snapshot: Snapshot) {
        self.0
            .entry(file.to_string())
            .or_default()
            .entry(line)
            .or_default()
            .push(snapshot);
    }

    pub fn is_empty(&self) -> bool {
        self.0.values().all(|lines| lines.values().all(Vec::is_empty))
    }

    pub fn snapshots(&self, file: &str, line: LineNo) -> &[Snapshot] {
        self.0
            .get(file)
            .and_then(|lines| lines.get(&line))
            .map_or(&[][..], Vec::as_slice)
    }

    pub fn snapshot_count(&self) -> usize {
        self.0.values().flat_map(|lines| lines.values()).map(Vec::len).sum()
    }
}

/// Which half of an example pair a trace belongs to
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Half {
    /// Captured at the parent commit, bug present
    Negative,
    /// Captured at the child commit, bug fixed
    Positive,
}

impl Half {
    pub fn file_name(self) -> &'static str {
        match self {
            Half::Negative => "negative_example.json",
            Half::Positive => "positive_example.json",
        }
    }

    pub fn version(self) -> Version {
        match self {
            Half::Negative => Version::Old,
            Half::Positive => Version::New,
        }
    }
}

/// Negative/positive traces for one bug-fix commit
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExamplePair {
    pub negative: Option<TraceRecord>,
    pub positive: Option<TraceRecord>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn target_spec_serializes_as_plain_map() {
        let mut spec = TargetSpec::default();
        spec.insert("pkg/foo.py", 3);
        spec.insert("pkg/foo.py", 1);
        let json = serde_json::to_string(&spec).unwrap();
        assert_eq!(json, r#"{"pkg/foo.py":[1,3]}"#);

        let back: TargetSpec = serde_json::from_str(&json).unwrap();
        assert_eq!(back, spec);
    }

    #[test]
    fn trace_record_line_keys_round_trip_through_json() {
        let mut record = TraceRecord::default();
        record.push(
            "foo.py",
            7,
            Snapshot {
                code_context: vec!["a = 1".into()],
                target_line: "b = a + 1".into(),
                variables: BTreeMap::from([("a".to_string(), "1".to_string())]),
            },
        );
        let json = serde_json::to_value(&record).unwrap();
        assert_eq!(json["foo.py"]["7"][0]["target_line"], "b = a + 1");
        assert_eq!(json["foo.py"]["7"][0]["variables"]["a"], "1");

        let back: TraceRecord = serde_json::from_value(json).unwrap();
        assert_eq!(back.snapshots("foo.py", 7).len(), 1);
    }

    #[test]
    fn empty_entries_count_as_empty() {
        let mut spec = TargetSpec::default();
        spec.0.insert("foo.py".into(), BTreeSet::new());
        assert!(spec.is_empty());
        assert!(TraceRecord::default().is_empty());
    }
}
