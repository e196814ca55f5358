//! Filters, groups and renders change records.

use crate::attr::{Attribute, AttributeMask};
use crate::compare::{ChangeRecord, Classification};
use crate::entry::Entry;
use crate::file_type::FileType;
use crate::rules::Pattern;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt::{self, Write as _};
use std::str::FromStr;
use tracing::debug;

const RULE: &str = "---------------------------------------------------";

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ReportLevel {
    /// Totals and per-attribute change counts.
    Summary,
    /// Totals and path lists.
    Minimal,
    /// Path lists, attribute values and capture failures.
    #[default]
    Detailed,
}

impl FromStr for ReportLevel {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "summary" => Ok(Self::Summary),
            "minimal" => Ok(Self::Minimal),
            "detailed" => Ok(Self::Detailed),
            other => Err(format!("unknown report level '{other}' (summary, minimal, detailed)")),
        }
    }
}

impl fmt::Display for ReportLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Summary => "summary",
            Self::Minimal => "minimal",
            Self::Detailed => "detailed",
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ReportFormat {
    #[default]
    Text,
    Json,
}

impl FromStr for ReportFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "text" => Ok(Self::Text),
            "json" => Ok(Self::Json),
            other => Err(format!("unknown report format '{other}' (text, json)")),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReportOptions {
    pub level: ReportLevel,
    pub format: ReportFormat,
    pub grouped: bool,
    pub summarize_changes: bool,
    pub detailed_init: bool,
    pub ignore: AttributeMask,
    pub force: AttributeMask,
}

impl Default for ReportOptions {
    fn default() -> Self {
        Self {
            level: ReportLevel::Detailed,
            format: ReportFormat::Text,
            grouped: true,
            summarize_changes: true,
            detailed_init: false,
            ignore: AttributeMask::EMPTY,
            force: AttributeMask::EMPTY,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum RunKind {
    Init,
    Check,
    Update,
    Compare,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct Totals {
    pub entries: usize,
    pub added: usize,
    pub removed: usize,
    pub changed: usize,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Failure {
    pub path: String,
    pub error: String,
}

/// A filtered, level-trimmed report, ready for rendering.
#[derive(Debug, Clone, Serialize)]
pub struct Report {
    pub run: RunKind,
    pub generated_at: DateTime<Utc>,
    pub level: ReportLevel,
    pub totals: Totals,
    /// Number of changed entries per changed attribute.
    pub attribute_changes: BTreeMap<Attribute, usize>,
    pub records: Vec<ChangeRecord>,
    pub failures: Vec<Failure>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub notes: Vec<String>,
}

impl Report {
    pub fn has_differences(&self) -> bool {
        self.totals.added + self.totals.removed + self.totals.changed > 0
    }

    /// Difference bits: 1 added, 2 removed, 4 changed.
    pub fn exit_code(&self) -> i32 {
        let mut code = 0;
        if self.totals.added > 0 {
            code |= 1;
        }
        if self.totals.removed > 0 {
            code |= 2;
        }
        if self.totals.changed > 0 {
            code |= 4;
        }
        code
    }
}

pub struct Reporter<'c> {
    options: &'c ReportOptions,
    limit: Option<&'c Pattern>,
}

impl<'c> Reporter<'c> {
    pub fn new(options: &'c ReportOptions, limit: Option<&'c Pattern>) -> Self {
        Self { options, limit }
    }

    /// Apply the limit pattern, count, and trim to the report level.
    /// `entries` is the number of entries in the newer tree.
    pub fn build<'e, I>(&self, run: RunKind, records: Vec<ChangeRecord>, entries: usize, failed: I) -> Report
    where
        I: IntoIterator<Item = &'e Entry>,
    {
        let before = records.len();
        let mut records: Vec<ChangeRecord> = records.into_iter().filter(|r| self.within_limit(&r.path)).collect();
        if records.len() != before {
            debug!(dropped = before - records.len(), "records outside limit");
        }

        let mut totals = Totals {
            entries,
            ..Totals::default()
        };
        let mut attribute_changes = BTreeMap::new();
        for record in &records {
            match record.classification {
                Classification::Added => totals.added += 1,
                Classification::Removed => totals.removed += 1,
                Classification::Changed => {
                    totals.changed += 1;
                    for attr in record.changed_attributes() {
                        *attribute_changes.entry(attr).or_insert(0) += 1;
                    }
                }
            }
        }

        match self.options.level {
            ReportLevel::Summary => records.clear(),
            ReportLevel::Minimal => records.iter_mut().for_each(|r| r.changes.retain(|c| c.changed)),
            ReportLevel::Detailed => {}
        }
        let failures = match self.options.level {
            ReportLevel::Detailed => failed
                .into_iter()
                .filter(|e| self.within_limit(&e.path))
                .filter_map(|e| {
                    e.error.as_ref().map(|error| Failure {
                        path: e.path.clone(),
                        error: error.clone(),
                    })
                })
                .collect(),
            _ => Vec::new(),
        };

        Report {
            run,
            generated_at: Utc::now(),
            level: self.options.level,
            totals,
            attribute_changes,
            records,
            failures,
            notes: Vec::new(),
        }
    }

    fn within_limit(&self, path: &str) -> bool {
        self.limit.map_or(true, |l| l.matches(path))
    }

    pub fn render(&self, report: &Report) -> Result<String, serde_json::Error> {
        match self.options.format {
            ReportFormat::Json => serde_json::to_string_pretty(report).map(|mut s| {
                s.push('\n');
                s
            }),
            ReportFormat::Text => Ok(self.render_text(report)),
        }
    }

    fn render_text(&self, report: &Report) -> String {
        let mut out = String::new();
        let _ = writeln!(out, "{}", headline(report));
        for note in &report.notes {
            let _ = writeln!(out, "{note}");
        }
        let _ = writeln!(out, "Start timestamp: {}", report.generated_at.format("%Y-%m-%d %H:%M:%S %z"));

        let show_totals = report.run != RunKind::Init || report.has_differences();
        if show_totals {
            let t = &report.totals;
            let _ = writeln!(out, "\nSummary:");
            let _ = writeln!(out, "  Total number of entries:\t{}", t.entries);
            let _ = writeln!(out, "  Added entries:\t\t{}", t.added);
            let _ = writeln!(out, "  Removed entries:\t\t{}", t.removed);
            let _ = writeln!(out, "  Changed entries:\t\t{}", t.changed);
        }

        if report.level == ReportLevel::Summary {
            if !report.attribute_changes.is_empty() {
                section(&mut out, "Changed attributes:");
                for (attr, count) in &report.attribute_changes {
                    let _ = writeln!(out, "  {:<12}: {count}", attr.label());
                }
            }
            return out;
        }

        if self.options.grouped {
            for class in Classification::ALL {
                let records: Vec<&ChangeRecord> =
                    report.records.iter().filter(|r| r.classification == class).collect();
                if records.is_empty() {
                    continue;
                }
                section(&mut out, &format!("{} entries:", class.label()));
                for record in records {
                    let _ = writeln!(out, "{}", self.list_line(record));
                }
            }
        } else if !report.records.is_empty() {
            section(&mut out, "Entries:");
            for record in &report.records {
                let _ = writeln!(out, "{}", self.list_line(record));
            }
        }

        if report.level == ReportLevel::Detailed {
            let changed: Vec<&ChangeRecord> = report
                .records
                .iter()
                .filter(|r| r.classification == Classification::Changed)
                .collect();
            if !changed.is_empty() {
                section(&mut out, "Detailed information about changes:");
                for record in changed {
                    write_details(&mut out, record);
                }
            }
            if !report.failures.is_empty() {
                section(&mut out, "Capture failures:");
                for failure in &report.failures {
                    let _ = writeln!(out, "  {}: {}", failure.path, failure.error);
                }
            }
        }
        out
    }

    fn list_line(&self, record: &ChangeRecord) -> String {
        if self.options.summarize_changes {
            format!("{}: {}", change_summary(record), record.path)
        } else {
            format!("{}: {}", record.classification.label().to_lowercase(), record.path)
        }
    }
}

fn headline(report: &Report) -> String {
    let subject = match report.run {
        RunKind::Init => return "Fim initialized database.".to_string(),
        RunKind::Check | RunKind::Update => "database and filesystem",
        RunKind::Compare => "the two databases",
    };
    if report.has_differences() {
        format!("Fim found differences between {subject}!!")
    } else {
        format!("Fim found NO differences between {subject}. Looks okay!!")
    }
}

fn section(out: &mut String, title: &str) {
    let _ = writeln!(out, "\n{RULE}\n{title}\n{RULE}\n");
}

fn write_details(out: &mut String, record: &ChangeRecord) {
    let kind = match record.old_file_type {
        Some(old) => format!(" (type {old} -> {})", record.file_type),
        None => String::new(),
    };
    let _ = writeln!(out, "{}: {}{kind}", type_name(record), record.path);
    for change in &record.changes {
        let old = change.old.as_ref().map(ToString::to_string).unwrap_or_default();
        let new = change.new.as_ref().map(ToString::to_string).unwrap_or_default();
        let _ = writeln!(out, "  {:<12}: {:<35} | {}", change.attribute.label(), old, new);
    }
    if let Some(error) = &record.error {
        let _ = writeln!(out, "  {:<12}: {error}", "Error");
    }
    out.push('\n');
}

fn type_name(record: &ChangeRecord) -> &'static str {
    match record.file_type {
        FileType::Directory => "Directory",
        FileType::Symlink => "Link",
        _ => "File",
    }
}

/// Columns of the change summary string, after the file type character.
const COLUMNS: [(char, &[Attribute]); 15] = [
    ('l', &[Attribute::LinkName]),
    ('s', &[Attribute::Size, Attribute::SizeGrowing]),
    ('b', &[Attribute::Blocks]),
    ('p', &[Attribute::Perm]),
    ('u', &[Attribute::Uid]),
    ('g', &[Attribute::Gid]),
    ('a', &[Attribute::Atime]),
    ('m', &[Attribute::Mtime]),
    ('c', &[Attribute::Ctime]),
    ('i', &[Attribute::Inode]),
    ('n', &[Attribute::LinkCount]),
    ('H', &[Attribute::Sha256, Attribute::Sha512, Attribute::Blake3]),
    ('A', &[Attribute::Acl]),
    ('X', &[Attribute::Xattrs, Attribute::Selinux, Attribute::E2fsAttrs]),
    ('C', &[Attribute::Capabilities]),
];

/// One character per column: `+` added, `-` removed, the column letter if
/// changed, `.` if compared and unchanged, blank if not compared.
pub fn change_summary(record: &ChangeRecord) -> String {
    let mut out = String::with_capacity(COLUMNS.len() + 1);
    out.push(match record.old_file_type {
        Some(_) => '!',
        None => record.file_type.as_char(),
    });
    let changed = record.changed_mask();
    for (letter, attrs) in COLUMNS {
        let column = AttributeMask::of(attrs);
        let c = match record.classification {
            Classification::Added if record.compared.intersects(column) => '+',
            Classification::Removed if record.compared.intersects(column) => '-',
            Classification::Changed if changed.intersects(column) => letter,
            Classification::Changed if record.compared.intersects(column) => '.',
            _ => ' ',
        };
        out.push(c);
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::attr::{AttrValue, Severity};
    use crate::compare::{AttributeChange, Comparator};
    use crate::entry::WorkingTree;

    const NO_FAILURES: [&Entry; 0] = [];

    fn changed(path: &str) -> ChangeRecord {
        let mut old = Entry::new(path, FileType::Regular);
        old.set(Attribute::Perm, AttrValue::Mode(0o644));
        old.set(Attribute::Size, AttrValue::Int(1200));
        let mut new = old.clone();
        new.set(Attribute::Size, AttrValue::Int(1205));
        Comparator::default().diff(&old, &new).unwrap()
    }

    fn added(path: &str) -> ChangeRecord {
        let mut e = Entry::new(path, FileType::Regular);
        e.set(Attribute::Perm, AttrValue::Mode(0o600));
        let tree: WorkingTree = [e].into_iter().collect();
        Comparator::all_added(&tree).remove(0)
    }

    #[test]
    fn summary_string_marks_columns() {
        let blank = " ".repeat(11);
        assert_eq!(change_summary(&changed("/etc/passwd")), format!("f s .{blank}"));
        assert_eq!(change_summary(&added("/etc/new")), format!("f   +{blank}"));
    }

    #[test]
    fn limit_drops_records_before_counting() {
        let options = ReportOptions::default();
        let limit = Pattern::prefix("/etc/").unwrap();
        let reporter = Reporter::new(&options, Some(&limit));
        let report = reporter.build(
            RunKind::Check,
            vec![changed("/etc/passwd"), added("/var/log/x")],
            10,
            NO_FAILURES,
        );
        assert_eq!(report.records.len(), 1);
        assert_eq!(report.totals.added, 0);
        assert_eq!(report.totals.changed, 1);
        assert_eq!(report.exit_code(), 4);

        let report = reporter.build(RunKind::Check, vec![added("/var/log/x")], 10, NO_FAILURES);
        assert_eq!(report.exit_code(), 0);
        assert!(!report.has_differences());
    }

    #[test]
    fn exit_bits_combine() {
        let options = ReportOptions::default();
        let reporter = Reporter::new(&options, None);
        let mut removed = added("/gone");
        removed.classification = Classification::Removed;
        removed.severity = Severity::High;
        let report = reporter.build(RunKind::Check, vec![added("/new"), removed, changed("/x")], 3, NO_FAILURES);
        assert_eq!(report.exit_code(), 7);
    }

    #[test]
    fn detailed_text_lists_values_and_failures() {
        let options = ReportOptions::default();
        let reporter = Reporter::new(&options, None);
        let mut broken = Entry::new("/etc/shadow", FileType::Regular);
        broken.record_error("read: Permission denied");
        let report = reporter.build(RunKind::Check, vec![changed("/etc/passwd")], 2, [&broken]);
        let text = reporter.render(&report).unwrap();

        assert!(text.starts_with("Fim found differences between database and filesystem!!"));
        assert!(text.contains("Changed entries:\t\t1"));
        assert!(text.contains(&format!("f s .{}: /etc/passwd", " ".repeat(11))));
        assert!(text.contains("File: /etc/passwd"));
        assert!(text.contains("Size        : 1200"));
        assert!(text.contains("| 1205"));
        assert!(!text.contains("Perm        :"));
        assert!(text.contains("/etc/shadow: read: Permission denied"));
    }

    #[test]
    fn summary_level_counts_attributes_only() {
        let options = ReportOptions {
            level: ReportLevel::Summary,
            ..ReportOptions::default()
        };
        let reporter = Reporter::new(&options, None);
        let report = reporter.build(RunKind::Check, vec![changed("/a"), changed("/b")], 2, NO_FAILURES);
        assert!(report.records.is_empty());
        assert_eq!(report.attribute_changes.get(&Attribute::Size), Some(&2));
        let text = reporter.render(&report).unwrap();
        assert!(text.contains("Size        : 2"));
        assert!(!text.contains("/a"));
    }

    #[test]
    fn ungrouped_minimal_keeps_path_order() {
        let options = ReportOptions {
            level: ReportLevel::Minimal,
            grouped: false,
            summarize_changes: false,
            ..ReportOptions::default()
        };
        let reporter = Reporter::new(&options, None);
        let report = reporter.build(RunKind::Check, vec![added("/a"), changed("/b")], 2, NO_FAILURES);
        let text = reporter.render(&report).unwrap();
        let a = text.find("added: /a").unwrap();
        let b = text.find("changed: /b").unwrap();
        assert!(a < b);
        assert!(!text.contains("Detailed information"));
    }

    #[test]
    fn forced_attributes_hidden_at_minimal_level() {
        let options = ReportOptions {
            level: ReportLevel::Minimal,
            ..ReportOptions::default()
        };
        let mut record = changed("/x");
        record.changes.push(AttributeChange {
            attribute: Attribute::Uid,
            old: Some(AttrValue::Int(0)),
            new: Some(AttrValue::Int(0)),
            changed: false,
        });
        let report = Reporter::new(&options, None).build(RunKind::Check, vec![record], 1, NO_FAILURES);
        assert_eq!(report.records[0].changes.len(), 1);
    }

    #[test]
    fn unreadable_content_counts_as_changed_at_minimal_level() {
        let mut old = Entry::new("/etc/shadow", FileType::Regular);
        old.set(Attribute::Size, AttrValue::Int(10));
        old.set(Attribute::Sha256, AttrValue::Digest(vec![0xab; 32]));
        let mut new = Entry::new("/etc/shadow", FileType::Regular);
        new.set(Attribute::Size, AttrValue::Int(10));
        new.record_error("read: Permission denied");
        let old_tree: WorkingTree = [old].into_iter().collect();
        let new_tree: WorkingTree = [new].into_iter().collect();

        let options = ReportOptions {
            level: ReportLevel::Minimal,
            ..ReportOptions::default()
        };
        let reporter = Reporter::new(&options, None);
        let records = Comparator::default().compare(&old_tree, &new_tree);
        let report = reporter.build(RunKind::Check, records, 1, new_tree.failures());
        assert_eq!(report.totals.changed, 1);
        assert_eq!(report.exit_code(), 4);
        assert!(report.failures.is_empty());
        let text = reporter.render(&report).unwrap();
        assert!(text.contains(&format!("f .{}H   : /etc/shadow", " ".repeat(9))));
    }

    #[test]
    fn json_report_is_machine_readable() {
        let options = ReportOptions {
            format: ReportFormat::Json,
            ..ReportOptions::default()
        };
        let reporter = Reporter::new(&options, None);
        let report = reporter.build(RunKind::Compare, vec![changed("/etc/passwd")], 1, NO_FAILURES);
        let value: serde_json::Value = serde_json::from_str(&reporter.render(&report).unwrap()).unwrap();
        assert_eq!(value["run"], "compare");
        assert_eq!(value["totals"]["changed"], 1);
        assert_eq!(value["records"][0]["classification"], "changed");
        assert_eq!(value["records"][0]["changes"][0]["attribute"], "s");
        assert_eq!(value["attribute_changes"]["s"], 1);
    }
}
