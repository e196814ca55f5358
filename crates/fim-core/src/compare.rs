//! Merge-join of two working trees into change records.

use crate::attr::{AttrValue, Attribute, AttributeMask, Severity};
use crate::entry::{Entry, WorkingTree};
use crate::file_type::FileType;
use serde::Serialize;
use std::cmp::Ordering;
use tracing::debug;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Classification {
    Added,
    Removed,
    Changed,
}

impl Classification {
    pub const ALL: [Classification; 3] = [Self::Added, Self::Removed, Self::Changed];

    pub fn label(self) -> &'static str {
        match self {
            Self::Added => "Added",
            Self::Removed => "Removed",
            Self::Changed => "Changed",
        }
    }
}

/// One reported attribute of a changed entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AttributeChange {
    pub attribute: Attribute,
    pub old: Option<AttrValue>,
    pub new: Option<AttrValue>,
    /// False for forced attributes that are shown but did not change.
    pub changed: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ChangeRecord {
    pub path: String,
    pub classification: Classification,
    pub file_type: FileType,
    /// Old file type when it differs from the new one.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub old_file_type: Option<FileType>,
    /// Attributes that were actually compared (both masks, minus ignored).
    pub compared: AttributeMask,
    pub changes: Vec<AttributeChange>,
    pub severity: Severity,
    /// Capture failure on the newer side.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl ChangeRecord {
    fn added(entry: &Entry) -> Self {
        Self {
            path: entry.path.clone(),
            classification: Classification::Added,
            file_type: entry.file_type,
            old_file_type: None,
            compared: entry.mask,
            changes: Vec::new(),
            severity: Severity::Medium,
            error: entry.error.clone(),
        }
    }

    fn removed(entry: &Entry) -> Self {
        Self {
            path: entry.path.clone(),
            classification: Classification::Removed,
            file_type: entry.file_type,
            old_file_type: None,
            compared: entry.mask,
            changes: Vec::new(),
            severity: Severity::High,
            error: None,
        }
    }

    /// Attributes whose value differs (forced, unchanged ones excluded).
    pub fn changed_attributes(&self) -> impl Iterator<Item = Attribute> + '_ {
        self.changes.iter().filter(|c| c.changed).map(|c| c.attribute)
    }

    pub fn changed_mask(&self) -> AttributeMask {
        self.changed_attributes().collect()
    }
}

/// Compares entries under a fixed ignore/force policy.
#[derive(Debug, Clone, Copy, Default)]
pub struct Comparator {
    ignore: AttributeMask,
    force: AttributeMask,
}

impl Comparator {
    pub fn new(ignore: AttributeMask, force: AttributeMask) -> Self {
        Self { ignore, force }
    }

    /// Walk both trees in path order. Paths only in `new` are added, only in
    /// `old` removed; paths in both are diffed on the attributes both sides
    /// recorded.
    pub fn compare(&self, old: &WorkingTree, new: &WorkingTree) -> Vec<ChangeRecord> {
        let mut records = Vec::new();
        let mut olds = old.entries().peekable();
        let mut news = new.entries().peekable();
        loop {
            match (olds.peek().copied(), news.peek().copied()) {
                (None, None) => break,
                (Some(o), None) => {
                    olds.next();
                    records.push(ChangeRecord::removed(o));
                }
                (None, Some(n)) => {
                    news.next();
                    records.push(ChangeRecord::added(n));
                }
                (Some(o), Some(n)) => match o.path.cmp(&n.path) {
                    Ordering::Less => {
                        olds.next();
                        records.push(ChangeRecord::removed(o));
                    }
                    Ordering::Greater => {
                        news.next();
                        records.push(ChangeRecord::added(n));
                    }
                    Ordering::Equal => {
                        olds.next();
                        news.next();
                        if let Some(record) = self.diff(o, n) {
                            records.push(record);
                        }
                    }
                },
            }
        }
        debug!(records = records.len(), "comparison complete");
        records
    }

    /// Diff two entries for the same path. When the newer capture failed,
    /// attributes it could not produce are compared too and show up as lost.
    pub fn diff(&self, old: &Entry, new: &Entry) -> Option<ChangeRecord> {
        let lost = match new.error {
            Some(_) => old.mask - new.mask,
            None => AttributeMask::EMPTY,
        };
        let compared = ((old.mask & new.mask) | lost) - self.ignore;
        let mut changes: Vec<AttributeChange> = Vec::new();

        for attr in compared.iter() {
            let (o, n) = (old.get(attr), new.get(attr));
            let changed = match (o, n) {
                (Some(o), Some(n)) => attr.differs(o, n),
                (None, None) => false,
                _ => true,
            };
            if changed {
                changes.push(AttributeChange {
                    attribute: attr,
                    old: o.cloned(),
                    new: n.cloned(),
                    changed: true,
                });
            }
        }
        let type_changed = old.file_type != new.file_type && !self.ignore.contains(Attribute::FileType);
        if changes.is_empty() && !type_changed {
            return None;
        }

        let severity = changes
            .iter()
            .map(|c| c.attribute.severity())
            .chain(type_changed.then_some(Severity::High))
            .max()
            .unwrap_or(Severity::Low);

        for attr in (compared & self.force).iter() {
            if changes.iter().any(|c| c.attribute == attr) {
                continue;
            }
            changes.push(AttributeChange {
                attribute: attr,
                old: old.get(attr).cloned(),
                new: new.get(attr).cloned(),
                changed: false,
            });
        }
        changes.sort_by_key(|c| c.attribute);

        Some(ChangeRecord {
            path: new.path.clone(),
            classification: Classification::Changed,
            file_type: new.file_type,
            old_file_type: type_changed.then_some(old.file_type),
            compared,
            changes,
            severity,
            error: new.error.clone(),
        })
    }

    /// Records for an initialisation run: every entry as added.
    pub fn all_added(tree: &WorkingTree) -> Vec<ChangeRecord> {
        tree.entries().map(ChangeRecord::added).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(path: &str, values: &[(Attribute, AttrValue)]) -> Entry {
        let mut e = Entry::new(path, FileType::Regular);
        for (a, v) in values {
            e.set(*a, v.clone());
        }
        e
    }

    fn digest(s: &str) -> AttrValue {
        AttrValue::Digest(s.as_bytes().to_vec())
    }

    fn passwd(size: u64, sum: &str) -> Entry {
        entry(
            "/etc/passwd",
            &[
                (Attribute::Perm, AttrValue::Mode(0o644)),
                (Attribute::Size, AttrValue::Int(size)),
                (Attribute::Sha256, digest(sum)),
            ],
        )
    }

    #[test]
    fn changed_entry_lists_only_differing_attributes() {
        let old: WorkingTree = [passwd(1200, "abc")].into_iter().collect();
        let new: WorkingTree = [passwd(1205, "def")].into_iter().collect();
        let records = Comparator::default().compare(&old, &new);
        assert_eq!(records.len(), 1);
        let r = &records[0];
        assert_eq!(r.classification, Classification::Changed);
        assert_eq!(
            r.changes,
            vec![
                AttributeChange {
                    attribute: Attribute::Size,
                    old: Some(AttrValue::Int(1200)),
                    new: Some(AttrValue::Int(1205)),
                    changed: true,
                },
                AttributeChange {
                    attribute: Attribute::Sha256,
                    old: Some(digest("abc")),
                    new: Some(digest("def")),
                    changed: true,
                },
            ]
        );
        assert_eq!(r.severity, Severity::High);
    }

    #[test]
    fn added_and_removed_paths() {
        let old: WorkingTree = [passwd(1, "a"), entry("/etc/old", &[])].into_iter().collect();
        let new: WorkingTree = [entry("/etc/new", &[]), passwd(1, "a")].into_iter().collect();
        let records = Comparator::default().compare(&old, &new);
        let summary: Vec<(&str, Classification)> =
            records.iter().map(|r| (r.path.as_str(), r.classification)).collect();
        assert_eq!(
            summary,
            vec![("/etc/new", Classification::Added), ("/etc/old", Classification::Removed)]
        );
        assert_eq!(records[0].severity, Severity::Medium);
        assert_eq!(records[1].severity, Severity::High);
    }

    #[test]
    fn attributes_missing_from_one_mask_are_not_compared() {
        let old = entry("/x", &[(Attribute::Perm, AttrValue::Mode(0o600))]);
        let new = entry(
            "/x",
            &[(Attribute::Perm, AttrValue::Mode(0o600)), (Attribute::Size, AttrValue::Int(9))],
        );
        assert!(Comparator::default().diff(&old, &new).is_none());
    }

    #[test]
    fn ignored_attributes_suppress_differences() {
        let cmp = Comparator::new(AttributeMask::of(&[Attribute::Sha256]), AttributeMask::EMPTY);
        let old = entry("/x", &[(Attribute::Sha256, digest("abc"))]);
        let new = entry("/x", &[(Attribute::Sha256, digest("def"))]);
        assert!(cmp.diff(&old, &new).is_none());
    }

    #[test]
    fn forced_attributes_are_shown_but_never_trigger() {
        let cmp = Comparator::new(AttributeMask::EMPTY, AttributeMask::of(&[Attribute::Perm]));
        assert!(cmp.diff(&passwd(1, "a"), &passwd(1, "a")).is_none());

        let record = cmp.diff(&passwd(1, "a"), &passwd(2, "a")).unwrap();
        let attrs: Vec<(Attribute, bool)> = record.changes.iter().map(|c| (c.attribute, c.changed)).collect();
        assert_eq!(attrs, vec![(Attribute::Perm, false), (Attribute::Size, true)]);
        assert_eq!(record.changed_mask(), AttributeMask::of(&[Attribute::Size]));
        assert_eq!(record.severity, Severity::Medium);
    }

    #[test]
    fn growing_size_flags_only_growth() {
        let grow = |n| entry("/var/log/app.log", &[(Attribute::SizeGrowing, AttrValue::Int(n))]);
        let cmp = Comparator::default();
        assert!(cmp.diff(&grow(100), &grow(50)).is_none());
        assert!(cmp.diff(&grow(100), &grow(150)).is_some());
    }

    #[test]
    fn file_type_change_is_high_severity() {
        let old = Entry::new("/x", FileType::Regular);
        let new = Entry::new("/x", FileType::Symlink);
        let record = Comparator::default().diff(&old, &new).unwrap();
        assert_eq!(record.old_file_type, Some(FileType::Regular));
        assert_eq!(record.severity, Severity::High);
    }

    #[test]
    fn failed_capture_reports_lost_attributes() {
        let old = passwd(10, "abc");
        let mut new = entry(
            "/etc/passwd",
            &[(Attribute::Perm, AttrValue::Mode(0o644)), (Attribute::Size, AttrValue::Int(10))],
        );
        new.record_error("read: Permission denied");

        let record = Comparator::default().diff(&old, &new).unwrap();
        assert_eq!(record.classification, Classification::Changed);
        assert_eq!(record.changed_mask(), AttributeMask::of(&[Attribute::Sha256]));
        assert_eq!(record.changes[0].new, None);
        assert_eq!(record.error.as_deref(), Some("read: Permission denied"));
        assert_eq!(record.severity, Severity::High);

        // Without a capture failure a narrower mask is a rule change, not a difference.
        new.error = None;
        assert!(Comparator::default().diff(&old, &new).is_none());
        let ignoring = Comparator::new(AttributeMask::of(&[Attribute::Sha256]), AttributeMask::EMPTY);
        new.record_error("read: Permission denied");
        assert!(ignoring.diff(&old, &new).is_none());
    }

    #[test]
    fn identical_trees_produce_no_records() {
        let tree: WorkingTree = [passwd(1, "a"), entry("/etc/group", &[])].into_iter().collect();
        assert!(Comparator::default().compare(&tree, &tree.clone()).is_empty());
    }
}
