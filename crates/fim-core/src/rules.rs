//! Selection rules and the compiled patterns they carry.

use crate::attr::AttributeMask;
use crate::config::ConfigError;
use crate::file_type::{FileType, Restriction};
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::fmt;

/// A compiled path pattern. Patterns are anchored at the start of the path;
/// exact patterns are additionally anchored at the end.
#[derive(Debug, Clone)]
pub struct Pattern {
    raw: String,
    regex: Regex,
}

impl Pattern {
    pub fn prefix(raw: &str) -> Result<Self, ConfigError> {
        Self::compile(raw, format!("^(?:{raw})"))
    }

    pub fn exact(raw: &str) -> Result<Self, ConfigError> {
        Self::compile(raw, format!("^(?:{raw})$"))
    }

    fn compile(raw: &str, anchored: String) -> Result<Self, ConfigError> {
        let regex = Regex::new(&anchored).map_err(|e| ConfigError::InvalidPattern {
            pattern: raw.to_string(),
            reason: e.to_string(),
        })?;
        Ok(Self {
            raw: raw.to_string(),
            regex,
        })
    }

    pub fn matches(&self, path: &str) -> bool {
        self.regex.is_match(path)
    }

    pub fn as_str(&self) -> &str {
        &self.raw
    }
}

impl fmt::Display for Pattern {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.raw)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RuleKind {
    Selection,
    Equals,
    Negative,
}

impl RuleKind {
    pub fn sigil(self) -> &'static str {
        match self {
            Self::Selection => "",
            Self::Equals => "=",
            Self::Negative => "!",
        }
    }
}

impl fmt::Display for RuleKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Selection => "selection",
            Self::Equals => "equals",
            Self::Negative => "negative",
        })
    }
}

/// An already-validated rule as produced by the configuration layer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RuleRecord {
    pub kind: RuleKind,
    pub pattern: String,
    pub restriction: Restriction,
    pub mask: AttributeMask,
    pub source_order: usize,
}

#[derive(Debug, Clone)]
pub struct Rule {
    pub kind: RuleKind,
    pub pattern: Pattern,
    pub restriction: Restriction,
    pub mask: AttributeMask,
    pub source_order: usize,
    anchor: Vec<String>,
    literal: bool,
}

impl Rule {
    pub fn compile(record: RuleRecord) -> Result<Self, ConfigError> {
        let pattern = match record.kind {
            RuleKind::Equals => Pattern::exact(&record.pattern)?,
            RuleKind::Selection | RuleKind::Negative => Pattern::prefix(&record.pattern)?,
        };
        let (anchor, literal) = literal_anchor(&record.pattern);
        Ok(Self {
            kind: record.kind,
            pattern,
            restriction: record.restriction,
            mask: if record.kind == RuleKind::Negative {
                AttributeMask::EMPTY
            } else {
                record.mask
            },
            source_order: record.source_order,
            anchor,
            literal,
        })
    }

    pub fn matches(&self, path: &str, file_type: FileType) -> bool {
        self.restriction.allows(file_type) && self.pattern.matches(path)
    }

    /// Path components of the fixed prefix the rule is indexed under.
    pub fn anchor(&self) -> &[String] {
        &self.anchor
    }

    /// Whether the pattern is a plain path with no regex operators.
    pub fn is_literal(&self) -> bool {
        self.literal
    }

    /// Whether the rule can match paths below the ones it is anchored at.
    pub fn reaches_below(&self) -> bool {
        match self.kind {
            RuleKind::Selection => true,
            RuleKind::Equals => !self.literal,
            RuleKind::Negative => false,
        }
    }
}

impl fmt::Display for Rule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{}", self.kind.sigil(), self.pattern)?;
        if self.restriction != Restriction::Any {
            write!(f, " {}", self.restriction)?;
        }
        if self.kind != RuleKind::Negative {
            write!(f, " {}", self.mask)?;
        }
        Ok(())
    }
}

/// Split the literal (regex-free) prefix of a pattern into whole path
/// components. A component cut short by a regex operator is dropped, and a
/// pattern with top-level alternation or no leading `/` anchors at the root.
fn literal_anchor(raw: &str) -> (Vec<String>, bool) {
    let body = raw.strip_prefix('^').unwrap_or(raw);
    if !body.starts_with('/') || has_alternation(body) {
        return (Vec::new(), false);
    }

    let mut literal = String::new();
    let mut complete = true;
    let mut chars = body.chars().peekable();
    while let Some(c) = chars.next() {
        match c {
            '\\' => match chars.next() {
                Some(n) if !n.is_ascii_alphanumeric() => literal.push(n),
                _ => {
                    complete = false;
                    break;
                }
            },
            '$' if chars.peek().is_none() => break,
            '*' | '?' | '+' | '{' => {
                literal.pop();
                complete = false;
                break;
            }
            '.' | '^' | '$' | '[' | ']' | '(' | ')' => {
                complete = false;
                break;
            }
            c => literal.push(c),
        }
    }

    if !complete {
        match literal.rfind('/') {
            Some(idx) => literal.truncate(idx + 1),
            None => literal.clear(),
        }
    }
    let components = literal
        .split('/')
        .filter(|c| !c.is_empty())
        .map(str::to_string)
        .collect();
    (components, complete)
}

fn has_alternation(body: &str) -> bool {
    let mut escaped = false;
    for c in body.chars() {
        match (escaped, c) {
            (true, _) => escaped = false,
            (false, '\\') => escaped = true,
            (false, '|') => return true,
            _ => {}
        }
    }
    false
}

#[cfg(test)]
mod tests {
    use super::*;

    fn anchor(raw: &str) -> Vec<String> {
        literal_anchor(raw).0
    }

    fn record(kind: RuleKind, pattern: &str) -> RuleRecord {
        RuleRecord {
            kind,
            pattern: pattern.into(),
            restriction: Restriction::Any,
            mask: AttributeMask::hashes(),
            source_order: 0,
        }
    }

    #[test]
    fn anchors_follow_literal_prefix() {
        assert_eq!(anchor("/etc"), vec!["etc"]);
        assert_eq!(anchor("/etc/passwd$"), vec!["etc", "passwd"]);
        assert_eq!(anchor("^/var/log/"), vec!["var", "log"]);
        assert_eq!(anchor("/var/log/.*\\.gz$"), vec!["var", "log"]);
        assert_eq!(anchor("/etc/pass.*"), vec!["etc"]);
        assert_eq!(anchor("/usr/lib64?/x"), vec!["usr"]);
        assert_eq!(anchor("/opt/app\\.d/conf"), vec!["opt", "app.d", "conf"]);
        assert_eq!(anchor("/etc/[a-z]+/x"), vec!["etc"]);
        assert!(anchor("/etc|/bin").is_empty());
        assert!(anchor(".*\\.conf$").is_empty());
        assert!(anchor("/").is_empty());
    }

    #[test]
    fn literal_flag() {
        assert!(literal_anchor("/etc/passwd").1);
        assert!(literal_anchor("/etc/passwd$").1);
        assert!(!literal_anchor("/etc/.*").1);
    }

    #[test]
    fn selection_is_prefix_anchored_and_equals_exact() {
        let sel = Rule::compile(record(RuleKind::Selection, "/etc")).unwrap();
        assert!(sel.matches("/etc", FileType::Directory));
        assert!(sel.matches("/etc/passwd", FileType::Regular));
        assert!(!sel.matches("/usr/etc", FileType::Directory));

        let eq = Rule::compile(record(RuleKind::Equals, "/etc")).unwrap();
        assert!(eq.matches("/etc", FileType::Directory));
        assert!(!eq.matches("/etc/passwd", FileType::Regular));
        assert!(!eq.reaches_below());
    }

    #[test]
    fn negative_rules_carry_no_mask() {
        let neg = Rule::compile(record(RuleKind::Negative, "/proc")).unwrap();
        assert!(neg.mask.is_empty());
        assert_eq!(neg.to_string(), "!/proc");
    }

    #[test]
    fn restriction_filters_file_types() {
        let mut rec = record(RuleKind::Selection, "/var/log");
        rec.restriction = Restriction::Only(FileType::Regular);
        let rule = Rule::compile(rec).unwrap();
        assert!(rule.matches("/var/log/syslog", FileType::Regular));
        assert!(!rule.matches("/var/log/apt", FileType::Directory));
    }

    #[test]
    fn bad_regex_is_a_config_error() {
        let err = Rule::compile(record(RuleKind::Selection, "/etc/(")).unwrap_err();
        assert!(matches!(err, ConfigError::InvalidPattern { .. }));
    }
}
