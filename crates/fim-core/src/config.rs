//! Settings file and the validated, immutable [`Config`] built from it.

use crate::attr::{AttributeGroups, AttributeMask};
use crate::file_type::Restriction;
use crate::report::{ReportFormat, ReportLevel, ReportOptions};
use crate::rules::{Pattern, Rule, RuleKind, RuleRecord};
use crate::tree::RuleTree;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::debug;

pub const DEFAULT_MAX_DEPTH: usize = 512;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read configuration {}: {source}", path.display())]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("malformed configuration {}: {source}", path.display())]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("invalid pattern '{pattern}': {reason}")]
    InvalidPattern { pattern: String, reason: String },

    #[error("unknown attribute or group '{0}'")]
    UnknownGroup(String),

    #[error("'{0}' is an attribute name and cannot be redefined as a group")]
    ReservedGroup(String),

    #[error("invalid group name '{0}'")]
    InvalidGroupName(String),

    #[error("invalid file type restriction '{restriction}' on rule '{pattern}'")]
    InvalidRestriction { pattern: String, restriction: String },

    #[error("rule #{second} '{pattern}' conflicts with rule #{first}")]
    ConflictingRule {
        pattern: String,
        first: usize,
        second: usize,
    },

    #[error("max_depth must be at least 1")]
    InvalidDepth,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GroupSpec {
    pub name: String,
    pub attrs: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RuleSpec {
    pub kind: RuleKind,
    pub pattern: String,
    /// File type character; empty or `?` for any type.
    #[serde(default)]
    pub restriction: String,
    /// Attribute expression; ignored for negative rules.
    #[serde(default)]
    pub attrs: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReportSettings {
    pub level: ReportLevel,
    pub format: ReportFormat,
    pub grouped: bool,
    pub summarize_changes: bool,
    pub detailed_init: bool,
    /// Attribute expression removed from every comparison.
    pub ignore: String,
    /// Attribute expression always shown for changed entries.
    pub force: String,
}

impl Default for ReportSettings {
    fn default() -> Self {
        Self {
            level: ReportLevel::Detailed,
            format: ReportFormat::Text,
            grouped: true,
            summarize_changes: true,
            detailed_init: false,
            ignore: String::new(),
            force: String::new(),
        }
    }
}

/// On-disk configuration, as written by the operator.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub database_in: Option<PathBuf>,
    pub database_out: Option<PathBuf>,
    pub database_new: Option<PathBuf>,
    pub root_prefix: Option<PathBuf>,
    pub limit: Option<String>,
    pub max_depth: usize,
    /// User-defined groups, in definition order; later groups may use
    /// earlier ones.
    pub groups: Vec<GroupSpec>,
    pub rules: Vec<RuleSpec>,
    pub report: ReportSettings,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            database_in: None,
            database_out: None,
            database_new: None,
            root_prefix: None,
            limit: None,
            max_depth: DEFAULT_MAX_DEPTH,
            groups: Vec::new(),
            rules: Vec::new(),
            report: ReportSettings::default(),
        }
    }
}

impl Settings {
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let raw = fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        serde_json::from_str(&raw).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }
}

/// Validated run configuration. Built once, then only borrowed.
#[derive(Debug, Clone)]
pub struct Config {
    pub database_in: Option<PathBuf>,
    pub database_out: Option<PathBuf>,
    pub database_new: Option<PathBuf>,
    pub root_prefix: Option<PathBuf>,
    pub limit: Option<Pattern>,
    pub max_depth: usize,
    pub groups: AttributeGroups,
    pub tree: RuleTree,
    pub report: ReportOptions,
}

impl Config {
    pub fn build(settings: Settings) -> Result<Self, ConfigError> {
        if settings.max_depth == 0 {
            return Err(ConfigError::InvalidDepth);
        }

        let mut groups = AttributeGroups::default();
        for group in &settings.groups {
            let mask = groups.define(&group.name, &group.attrs)?;
            debug!(group = %group.name, %mask, "defined attribute group");
        }

        let mut tree = RuleTree::new();
        let mut seen: HashMap<(String, Restriction), (RuleKind, usize)> = HashMap::new();
        for (order, spec) in settings.rules.iter().enumerate() {
            let restriction = Restriction::parse(&spec.restriction).ok_or_else(|| {
                ConfigError::InvalidRestriction {
                    pattern: spec.pattern.clone(),
                    restriction: spec.restriction.clone(),
                }
            })?;
            match seen.get(&(spec.pattern.clone(), restriction)) {
                Some(&(kind, first)) if kind != spec.kind => {
                    return Err(ConfigError::ConflictingRule {
                        pattern: spec.pattern.clone(),
                        first,
                        second: order,
                    });
                }
                Some(_) => {}
                None => {
                    seen.insert((spec.pattern.clone(), restriction), (spec.kind, order));
                }
            }
            let mask = match spec.kind {
                RuleKind::Negative => AttributeMask::EMPTY,
                RuleKind::Selection | RuleKind::Equals => groups.parse_expr(&spec.attrs)?,
            };
            let rule = Rule::compile(RuleRecord {
                kind: spec.kind,
                pattern: spec.pattern.clone(),
                restriction,
                mask,
                source_order: order,
            })?;
            debug!(order, %rule, "add rule");
            tree.insert(rule);
        }

        let limit = settings.limit.as_deref().map(Pattern::prefix).transpose()?;
        let report = ReportOptions {
            level: settings.report.level,
            format: settings.report.format,
            grouped: settings.report.grouped,
            summarize_changes: settings.report.summarize_changes,
            detailed_init: settings.report.detailed_init,
            ignore: groups.parse_expr(&settings.report.ignore)?,
            force: groups.parse_expr(&settings.report.force)?,
        };

        Ok(Self {
            database_in: settings.database_in,
            database_out: settings.database_out,
            database_new: settings.database_new,
            root_prefix: settings.root_prefix.filter(|p| !p.as_os_str().is_empty()),
            limit,
            max_depth: settings.max_depth,
            groups,
            tree,
            report,
        })
    }

    /// Whether `path` passes the limit pattern (always true without one).
    pub fn within_limit(&self, path: &str) -> bool {
        self.limit.as_ref().map_or(true, |l| l.matches(path))
    }
}
