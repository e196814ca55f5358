//! One entry point per command. Each validates its preconditions before
//! touching the filesystem, then composes the populate, compare and report
//! stages.

use crate::cancel::Cancellation;
use crate::compare::Comparator;
use crate::config::Config;
use crate::database;
use crate::error::{Error, Result, EXIT_OK};
use crate::file_type::FileType;
use crate::matcher::{Matcher, Outcome as MatchOutcome};
use crate::populate::{Populator, Source, Visit};
use crate::report::{Report, Reporter, RunKind};
use std::fmt::Write as _;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::info;

pub const PATH_CHECK_MATCHED: i32 = 0;
pub const PATH_CHECK_NOT_MATCHED: i32 = 1;
pub const PATH_CHECK_OUTSIDE_LIMIT: i32 = 2;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    Init,
    DryInit,
    Check,
    Update,
    Compare,
    ConfigCheck,
    /// `<type>:<absolute path>`
    PathCheck(String),
}

/// Text to print and the process exit code.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Outcome {
    pub output: String,
    pub exit_code: i32,
}

pub fn run(command: &Command, config: &Config, cancel: &Cancellation) -> Result<Outcome> {
    match command {
        Command::Init => init(config, cancel),
        Command::DryInit => dry_init(config, cancel),
        Command::Check => check(config, cancel),
        Command::Update => update(config, cancel),
        Command::Compare => compare(config, cancel),
        Command::ConfigCheck => Ok(config_check(config)),
        Command::PathCheck(query) => path_check(config, query),
    }
}

fn required<'a>(value: &'a Option<PathBuf>, option: &'static str) -> Result<&'a Path> {
    value.as_deref().ok_or(Error::MissingOption(option))
}

fn check_root_prefix(config: &Config) -> Result<()> {
    if let Some(prefix) = &config.root_prefix {
        fs::read_dir(prefix).map_err(|source| Error::RootPrefix {
            path: prefix.clone(),
            source,
        })?;
    }
    Ok(())
}

fn finish(config: &Config, report: &Report, exit_code: i32) -> Result<Outcome> {
    let output = Reporter::new(&config.report, config.limit.as_ref()).render(report)?;
    info!(exit_code, "report generated");
    Ok(Outcome { output, exit_code })
}

/// Capture the filesystem and write a fresh database.
pub fn init(config: &Config, cancel: &Cancellation) -> Result<Outcome> {
    let out = required(&config.database_out, "database_out")?;
    if config.database_in.as_deref() == Some(out) {
        info!(database = %out.display(), "input and output database are the same");
    }
    check_root_prefix(config)?;

    info!("populate tree");
    let tree = Populator::new(config, cancel.clone()).populate(Source::Disk)?;
    info!(database = %out.display(), "write new entries to database");
    let written = database::write_tree(out, &tree)?;

    let records = if config.report.detailed_init {
        Comparator::all_added(&tree)
    } else {
        Vec::new()
    };
    let reporter = Reporter::new(&config.report, config.limit.as_ref());
    let mut report = reporter.build(RunKind::Init, records, tree.len(), tree.failures());
    report
        .notes
        .push(format!("New fim database written to {} ({written} entries)", out.display()));
    finish(config, &report, EXIT_OK)
}

/// Walk and match only: no attributes are captured and nothing is written.
pub fn dry_init(config: &Config, cancel: &Cancellation) -> Result<Outcome> {
    check_root_prefix(config)?;
    info!("populate tree (dry-run)");
    let mut output = String::new();
    Populator::new(config, cancel.clone()).walk_disk(|visit| {
        if let Visit::Path {
            path,
            file_type,
            resolution,
            ..
        } = visit
        {
            if config.within_limit(path) {
                let mark = if resolution.is_included() { 'X' } else { ' ' };
                let _ = writeln!(output, "[{mark}] {file_type} '{path}'");
            }
        }
    })?;
    Ok(Outcome {
        output,
        exit_code: EXIT_OK,
    })
}

/// Compare the stored database with the filesystem.
pub fn check(config: &Config, cancel: &Cancellation) -> Result<Outcome> {
    let db_in = required(&config.database_in, "database_in")?;
    check_root_prefix(config)?;

    let populator = Populator::new(config, cancel.clone());
    let old = populator.populate(Source::Database(db_in))?;
    info!("populate tree");
    let new = populator.populate(Source::Disk)?;

    let records = Comparator::new(config.report.ignore, config.report.force).compare(&old, &new);
    let report = Reporter::new(&config.report, config.limit.as_ref()).build(
        RunKind::Check,
        records,
        new.len(),
        new.failures(),
    );
    finish(config, &report, report.exit_code())
}

/// Check, then write the current state as the new database.
pub fn update(config: &Config, cancel: &Cancellation) -> Result<Outcome> {
    let db_in = required(&config.database_in, "database_in")?;
    let out = required(&config.database_out, "database_out")?;
    if db_in == out {
        return Err(Error::SameDatabase(out.to_path_buf()));
    }
    check_root_prefix(config)?;

    let populator = Populator::new(config, cancel.clone());
    let old = populator.populate(Source::Database(db_in))?;
    info!("populate tree");
    let new = populator.populate(Source::Disk)?;
    let written = database::write_tree(out, &new)?;

    let records = Comparator::new(config.report.ignore, config.report.force).compare(&old, &new);
    let mut report = Reporter::new(&config.report, config.limit.as_ref()).build(
        RunKind::Update,
        records,
        new.len(),
        new.failures(),
    );
    report
        .notes
        .push(format!("New fim database written to {} ({written} entries)", out.display()));
    finish(config, &report, report.exit_code())
}

/// Compare two stored databases; the filesystem is not read.
pub fn compare(config: &Config, cancel: &Cancellation) -> Result<Outcome> {
    let db_in = required(&config.database_in, "database_in")?;
    let db_new = required(&config.database_new, "database_new")?;
    if db_in == db_new {
        return Err(Error::SameInputs(db_in.to_path_buf()));
    }

    let populator = Populator::new(config, cancel.clone());
    let old = populator.populate(Source::Database(db_in))?;
    let new = populator.populate(Source::Database(db_new))?;

    let records = Comparator::new(config.report.ignore, config.report.force).compare(&old, &new);
    let report = Reporter::new(&config.report, config.limit.as_ref()).build(
        RunKind::Compare,
        records,
        new.len(),
        new.failures(),
    );
    finish(config, &report, report.exit_code())
}

/// Print the parsed groups and rule tree.
pub fn config_check(config: &Config) -> Outcome {
    let mut output = String::new();
    let _ = writeln!(output, "Configuration OK");
    let _ = writeln!(output, "rules: {}", config.tree.rule_count());
    if let Some(limit) = &config.limit {
        let _ = writeln!(output, "limit: {limit}");
    }
    let _ = writeln!(output, "\nrule tree:");
    output.push_str(&config.tree.render());
    Outcome {
        output,
        exit_code: EXIT_OK,
    }
}

fn parse_path_query(query: &str) -> Result<(FileType, &str)> {
    let invalid = |reason: String| Error::InvalidArgument {
        option: "--path-check",
        reason,
    };
    let (kind, path) = query
        .split_once(':')
        .ok_or_else(|| invalid("missing file type or path".into()))?;
    let mut chars = kind.chars();
    let file_type = match (chars.next(), chars.next()) {
        (Some(c), None) => FileType::from_char(c).ok_or_else(|| invalid(format!("invalid file type '{c}'")))?,
        _ => return Err(invalid(format!("invalid file type '{kind}'"))),
    };
    if !path.starts_with('/') {
        return Err(invalid(format!("'{path}' needs to be an absolute path")));
    }
    Ok((file_type, path))
}

/// Resolve one `<type>:<path>` query against the rule tree.
pub fn path_check(config: &Config, query: &str) -> Result<Outcome> {
    let (file_type, path) = parse_path_query(query)?;
    if let Some(limit) = config.limit.as_ref().filter(|l| !l.matches(path)) {
        return Ok(Outcome {
            output: format!("[ ] {file_type} '{path}': outside of limit '{limit}'\n"),
            exit_code: PATH_CHECK_OUTSIDE_LIMIT,
        });
    }

    let resolution = Matcher::new(&config.tree).resolve(path, file_type);
    let (mark, detail, exit_code) = match (resolution.outcome, resolution.rule) {
        (MatchOutcome::Selected | MatchOutcome::Equal, Some(rule)) => (
            'X',
            format!("matched by rule #{} '{rule}'", rule.source_order),
            PATH_CHECK_MATCHED,
        ),
        (MatchOutcome::Excluded, Some(rule)) => (
            ' ',
            format!("excluded by rule #{} '{rule}'", rule.source_order),
            PATH_CHECK_NOT_MATCHED,
        ),
        _ => (' ', "not matched by any rule".to_string(), PATH_CHECK_NOT_MATCHED),
    };
    Ok(Outcome {
        output: format!("[{mark}] {file_type} '{path}': {detail}\n"),
        exit_code,
    })
}
