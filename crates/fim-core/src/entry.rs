use crate::attr::{AttrValue, Attribute, AttributeMask};
use crate::file_type::FileType;
use serde::Serialize;
use std::collections::BTreeMap;

/// Captured state of one path.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Entry {
    pub path: String,
    pub file_type: FileType,
    /// Attributes actually captured; every key of `values` is in the mask.
    pub mask: AttributeMask,
    pub values: BTreeMap<Attribute, AttrValue>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl Entry {
    pub fn new(path: impl Into<String>, file_type: FileType) -> Self {
        Self {
            path: path.into(),
            file_type,
            mask: AttributeMask::EMPTY,
            values: BTreeMap::new(),
            error: None,
        }
    }

    pub fn get(&self, attr: Attribute) -> Option<&AttrValue> {
        self.values.get(&attr)
    }

    pub fn set(&mut self, attr: Attribute, value: AttrValue) {
        self.mask.insert(attr);
        self.values.insert(attr, value);
    }

    /// Drop attributes outside `mask`.
    pub fn restrict(&mut self, mask: AttributeMask) {
        self.mask = self.mask & mask;
        self.values.retain(|attr, _| mask.contains(*attr));
    }

    /// Append a capture failure; several failures on one entry are joined.
    pub fn record_error(&mut self, reason: impl Into<String>) {
        let reason = reason.into();
        self.error = Some(match self.error.take() {
            Some(prev) => format!("{prev}; {reason}"),
            None => reason,
        });
    }
}

/// Result of one traversal pass, ordered by path.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct WorkingTree {
    entries: BTreeMap<String, Entry>,
}

impl WorkingTree {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, entry: Entry) -> Option<Entry> {
        self.entries.insert(entry.path.clone(), entry)
    }

    pub fn get(&self, path: &str) -> Option<&Entry> {
        self.entries.get(path)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn entries(&self) -> impl Iterator<Item = &Entry> {
        self.entries.values()
    }

    pub fn paths(&self) -> impl Iterator<Item = &str> {
        self.entries.keys().map(String::as_str)
    }

    /// Entries whose capture failed at least partially.
    pub fn failures(&self) -> impl Iterator<Item = &Entry> {
        self.entries.values().filter(|e| e.error.is_some())
    }
}

impl FromIterator<Entry> for WorkingTree {
    fn from_iter<I: IntoIterator<Item = Entry>>(iter: I) -> Self {
        let mut tree = Self::new();
        for entry in iter {
            tree.insert(entry);
        }
        tree
    }
}

impl IntoIterator for WorkingTree {
    type Item = Entry;
    type IntoIter = std::collections::btree_map::IntoValues<String, Entry>;

    fn into_iter(self) -> Self::IntoIter {
        self.entries.into_values()
    }
}
