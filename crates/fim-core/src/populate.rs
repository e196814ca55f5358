//! Builds a [`WorkingTree`] from the live filesystem or from a stored
//! database, with every path passed through the same [`Matcher`].

use crate::attr::{AttrValue, Attribute, AttributeMask};
use crate::cancel::Cancellation;
use crate::config::Config;
use crate::database::{self, DatabaseError};
use crate::entry::{Entry, WorkingTree};
use crate::file_type::FileType;
use crate::hashing::{self, Digests};
use crate::matcher::{Matcher, Resolution};
use crate::name;
use crate::source::{default_sources, AttributeSource};
use std::fs;
use std::io::{self, Read};
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::{debug, info, trace, warn};
use walkdir::WalkDir;

#[derive(Debug, Error)]
pub enum PopulateError {
    #[error("traversal cancelled")]
    Cancelled,

    #[error(transparent)]
    Database(#[from] DatabaseError),
}

/// Where a pass reads its entries from.
#[derive(Debug, Clone, Copy)]
pub enum Source<'a> {
    Disk,
    Database(&'a Path),
}

/// One step of a disk walk, handed to [`Populator::walk_disk`] visitors.
#[derive(Debug)]
pub enum Visit<'a> {
    Path {
        path: &'a str,
        disk_path: &'a Path,
        file_type: FileType,
        resolution: &'a Resolution<'a>,
    },
    Unreadable {
        path: &'a str,
        error: &'a walkdir::Error,
    },
}

pub struct Populator<'c> {
    config: &'c Config,
    matcher: Matcher<'c>,
    sources: Vec<Box<dyn AttributeSource>>,
    cancel: Cancellation,
}

impl<'c> Populator<'c> {
    pub fn new(config: &'c Config, cancel: Cancellation) -> Self {
        Self {
            config,
            matcher: Matcher::new(&config.tree),
            sources: default_sources(),
            cancel,
        }
    }

    /// Replace the extended attribute producers.
    pub fn with_sources(mut self, sources: Vec<Box<dyn AttributeSource>>) -> Self {
        self.sources = sources;
        self
    }

    /// Attributes this populator can actually capture.
    pub fn available(&self) -> AttributeMask {
        let mut mask = AttributeMask::hashes();
        mask.insert(Attribute::LinkName);
        mask |= stat_attributes();
        for source in &self.sources {
            mask |= source.provides();
        }
        mask
    }

    pub fn populate(&self, source: Source<'_>) -> Result<WorkingTree, PopulateError> {
        match source {
            Source::Disk => self.from_disk(),
            Source::Database(path) => self.from_database(path),
        }
    }

    pub fn from_disk(&self) -> Result<WorkingTree, PopulateError> {
        let mut tree = WorkingTree::new();
        let mut pending: Vec<(String, String)> = Vec::new();
        self.walk_disk(|visit| match visit {
            Visit::Path {
                path,
                disk_path,
                file_type,
                resolution,
            } => {
                if resolution.is_included() {
                    tree.insert(self.capture(path, disk_path, file_type, resolution.mask));
                }
            }
            Visit::Unreadable { path, error } => pending.push((path.to_string(), error.to_string())),
        })?;
        for (path, error) in pending {
            if let Some(mut entry) = tree.get(&path).cloned() {
                entry.record_error(format!("read directory: {error}"));
                tree.insert(entry);
            }
        }
        info!(entries = tree.len(), failures = tree.failures().count(), "disk pass complete");
        Ok(tree)
    }

    pub fn from_database(&self, path: &Path) -> Result<WorkingTree, PopulateError> {
        info!(database = %path.display(), "load database");
        let reader = database::Reader::open(path)?;
        self.from_records(reader)
    }

    /// Replay stored entries through the matcher. Entries no longer
    /// selected are dropped; the rest are trimmed to their resolved mask.
    pub fn from_records<I>(&self, records: I) -> Result<WorkingTree, PopulateError>
    where
        I: IntoIterator<Item = Result<Entry, DatabaseError>>,
    {
        let mut tree = WorkingTree::new();
        for record in records {
            if self.cancel.is_cancelled() {
                return Err(PopulateError::Cancelled);
            }
            let mut entry = record?;
            let resolution = self.matcher.resolve(&entry.path, entry.file_type);
            if !resolution.is_included() {
                trace!(path = %entry.path, outcome = ?resolution.outcome, "skip stored entry");
                continue;
            }
            entry.restrict(resolution.mask);
            tree.insert(entry);
        }
        debug!(entries = tree.len(), "database pass complete");
        Ok(tree)
    }

    /// Depth-first walk from the rule tree's roots, in lexical order,
    /// never following symlinks. Directories are entered only while the
    /// rule tree can still select something below them.
    pub fn walk_disk<F>(&self, mut visit: F) -> Result<(), PopulateError>
    where
        F: FnMut(Visit<'_>),
    {
        for root in self.config.tree.roots() {
            let disk_root = self.disk_path(&root);
            if let Err(e) = fs::symlink_metadata(&disk_root) {
                if e.kind() == io::ErrorKind::NotFound {
                    debug!(path = %root, "rules refer to a non-existent path");
                } else {
                    warn!(path = %root, error = %e, "cannot stat traversal root");
                }
                continue;
            }
            debug!(path = %root, disk = %disk_root.display(), "walk");

            let mut it = WalkDir::new(&disk_root)
                .follow_links(false)
                .follow_root_links(false)
                .sort_by_file_name()
                .max_depth(self.config.max_depth)
                .into_iter();
            while let Some(next) = it.next() {
                if self.cancel.is_cancelled() {
                    return Err(PopulateError::Cancelled);
                }
                let dent = match next {
                    Ok(dent) => dent,
                    Err(e) => {
                        let path = e
                            .path()
                            .map(|p| self.logical_path(&root, &disk_root, p))
                            .unwrap_or_else(|| root.clone());
                        warn!(%path, error = %e, "walk error");
                        visit(Visit::Unreadable {
                            path: &path,
                            error: &e,
                        });
                        continue;
                    }
                };
                let Some(file_type) = FileType::from_std(dent.file_type()) else {
                    warn!(path = %dent.path().display(), "unsupported file type");
                    continue;
                };
                let path = self.logical_path(&root, &disk_root, dent.path());
                let resolution = self.matcher.resolve(&path, file_type);
                trace!(%path, outcome = ?resolution.outcome, mask = %resolution.mask, "resolve");

                visit(Visit::Path {
                    path: &path,
                    disk_path: dent.path(),
                    file_type,
                    resolution: &resolution,
                });

                if file_type == FileType::Directory && resolution.descend && dent.depth() == self.config.max_depth {
                    warn!(%path, max_depth = self.config.max_depth, "recursion ceiling reached");
                }
                if file_type == FileType::Directory && !resolution.descend {
                    it.skip_current_dir();
                }
            }
        }
        Ok(())
    }

    /// Disk location of a logical path, honouring the root prefix. Escaped
    /// name bytes are decoded; a malformed escape is taken literally.
    pub fn disk_path(&self, path: &str) -> PathBuf {
        let rel = path.trim_start_matches('/');
        let rel = name::decode(rel).unwrap_or_else(|_| rel.into());
        match &self.config.root_prefix {
            Some(prefix) => prefix.join(rel),
            None => Path::new("/").join(rel),
        }
    }

    fn logical_path(&self, root: &str, disk_root: &Path, disk: &Path) -> String {
        let rel = disk.strip_prefix(disk_root).unwrap_or(disk);
        let mut path = root.trim_end_matches('/').to_string();
        for component in rel.components() {
            path.push('/');
            path.push_str(&name::encode(component.as_os_str()));
        }
        if path.is_empty() {
            path.push('/');
        }
        path
    }

    /// Capture the attributes in `mask` that apply to this file type and
    /// that can be produced here. Failures are recorded on the entry.
    pub fn capture(&self, path: &str, disk_path: &Path, file_type: FileType, mask: AttributeMask) -> Entry {
        let mut wanted = mask & self.available();
        if file_type != FileType::Regular {
            wanted = wanted - AttributeMask::hashes();
        }
        if file_type != FileType::Symlink {
            wanted.remove(Attribute::LinkName);
        }

        let mut entry = Entry::new(path, file_type);
        let meta = match fs::symlink_metadata(disk_path) {
            Ok(meta) => meta,
            Err(e) => {
                warn!(%path, error = %e, "lstat failed");
                entry.record_error(format!("lstat: {e}"));
                return entry;
            }
        };
        if FileType::from_std(meta.file_type()) != Some(file_type) {
            entry.record_error("file type changed during scan");
            return entry;
        }

        capture_stat(&meta, wanted, &mut entry);

        if wanted.contains(Attribute::LinkName) {
            match fs::read_link(disk_path) {
                Ok(target) => entry.set(
                    Attribute::LinkName,
                    AttrValue::Text(name::encode(target.as_os_str())),
                ),
                Err(e) => entry.record_error(format!("readlink: {e}")),
            }
        }

        let hashes = wanted & AttributeMask::hashes();
        if !hashes.is_empty() {
            let hashed = open_content(disk_path)
                .map_err(|e| format!("read: {e}"))
                .and_then(|mut file| hash_content(&mut file, hashes, meta.len()));
            match hashed {
                Ok(digests) => {
                    for (attr, digest) in digests.values {
                        entry.set(attr, AttrValue::Digest(digest));
                    }
                }
                Err(reason) => {
                    warn!(%path, %reason, "hashing failed");
                    entry.record_error(reason);
                }
            }
        }

        for source in &self.sources {
            let want = wanted & source.provides();
            if want.is_empty() {
                continue;
            }
            match source.fetch(disk_path, file_type, want) {
                Ok(values) => {
                    for (attr, value) in values.into_iter().filter(|(a, _)| want.contains(*a)) {
                        entry.set(attr, value);
                    }
                }
                Err(e) => {
                    warn!(%path, source = source.name(), error = %e, "attribute source failed");
                    entry.record_error(format!("{}: {e}", source.name()));
                }
            }
        }
        entry
    }
}

fn open_content(path: &Path) -> io::Result<fs::File> {
    let mut opts = fs::OpenOptions::new();
    opts.read(true);
    #[cfg(unix)]
    {
        use std::os::unix::fs::OpenOptionsExt;
        opts.custom_flags(libc::O_NOFOLLOW | libc::O_NONBLOCK);
    }
    opts.open(path)
}

/// Hash `reader` and check the byte count against the size seen by lstat.
fn hash_content<R: Read>(reader: &mut R, mask: AttributeMask, expected: u64) -> Result<Digests, String> {
    let digests = hashing::digest_reader(reader, mask).map_err(|e| format!("read: {e}"))?;
    if digests.bytes != expected {
        return Err(format!(
            "read {} bytes, expected {expected}: file changed while hashing",
            digests.bytes
        ));
    }
    Ok(digests)
}

#[cfg(unix)]
fn stat_attributes() -> AttributeMask {
    AttributeMask::stat()
}

#[cfg(not(unix))]
fn stat_attributes() -> AttributeMask {
    AttributeMask::of(&[
        Attribute::FileType,
        Attribute::Size,
        Attribute::SizeGrowing,
        Attribute::Atime,
        Attribute::Mtime,
    ])
}

#[cfg(unix)]
fn capture_stat(meta: &fs::Metadata, wanted: AttributeMask, entry: &mut Entry) {
    use chrono::{TimeZone, Utc};
    use std::os::unix::fs::MetadataExt;

    let time = |secs: i64, nsecs: i64| {
        u32::try_from(nsecs)
            .ok()
            .and_then(|n| Utc.timestamp_opt(secs, n).single())
            .map(AttrValue::Time)
    };
    for attr in (wanted & AttributeMask::stat()).iter() {
        let value = match attr {
            Attribute::Perm => Some(AttrValue::Mode(meta.mode() & 0o7777)),
            Attribute::FileType => Some(AttrValue::FileType(entry.file_type)),
            Attribute::Inode => Some(AttrValue::Int(meta.ino())),
            Attribute::LinkCount => Some(AttrValue::Int(meta.nlink())),
            Attribute::Uid => Some(AttrValue::Int(u64::from(meta.uid()))),
            Attribute::Gid => Some(AttrValue::Int(u64::from(meta.gid()))),
            Attribute::Size | Attribute::SizeGrowing => Some(AttrValue::Int(meta.size())),
            Attribute::Blocks => Some(AttrValue::Int(meta.blocks())),
            Attribute::Atime => time(meta.atime(), meta.atime_nsec()),
            Attribute::Mtime => time(meta.mtime(), meta.mtime_nsec()),
            Attribute::Ctime => time(meta.ctime(), meta.ctime_nsec()),
            _ => continue,
        };
        match value {
            Some(value) => entry.set(attr, value),
            None => entry.record_error(format!("{} out of range", attr.label())),
        }
    }
}

#[cfg(not(unix))]
fn capture_stat(meta: &fs::Metadata, wanted: AttributeMask, entry: &mut Entry) {
    use chrono::{DateTime, Utc};

    for attr in (wanted & stat_attributes()).iter() {
        let value = match attr {
            Attribute::FileType => Some(AttrValue::FileType(entry.file_type)),
            Attribute::Size | Attribute::SizeGrowing => Some(AttrValue::Int(meta.len())),
            Attribute::Atime => meta.accessed().ok().map(|t| AttrValue::Time(DateTime::<Utc>::from(t))),
            Attribute::Mtime => meta.modified().ok().map(|t| AttrValue::Time(DateTime::<Utc>::from(t))),
            _ => continue,
        };
        match value {
            Some(value) => entry.set(attr, value),
            None => entry.record_error(format!("{} unavailable", attr.label())),
        }
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use crate::config::{RuleSpec, Settings};
    use crate::matcher::Outcome;
    use crate::rules::RuleKind;
    use std::os::unix::fs::symlink;

    fn config(root: &Path, rules: &[(RuleKind, &str, &str)]) -> Config {
        Config::build(Settings {
            root_prefix: Some(root.to_path_buf()),
            rules: rules
                .iter()
                .map(|(kind, pattern, attrs)| RuleSpec {
                    kind: *kind,
                    pattern: pattern.to_string(),
                    restriction: String::new(),
                    attrs: attrs.to_string(),
                })
                .collect(),
            ..Settings::default()
        })
        .unwrap()
    }

    fn fixture() -> tempfile::TempDir {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path();
        fs::create_dir_all(root.join("etc/ssh")).unwrap();
        fs::create_dir_all(root.join("tmp/cache")).unwrap();
        fs::create_dir_all(root.join("usr/bin")).unwrap();
        fs::write(root.join("etc/passwd"), b"root:x:0:0\n").unwrap();
        fs::write(root.join("etc/ssh/sshd_config"), b"Port 22\n").unwrap();
        fs::write(root.join("tmp/cache/blob"), b"junk").unwrap();
        fs::write(root.join("usr/bin/tool"), b"#!/bin/sh\n").unwrap();
        symlink("passwd", root.join("etc/passwd.link")).unwrap();
        dir
    }

    #[test]
    fn walks_only_selected_subtrees() {
        let dir = fixture();
        let cfg = config(dir.path(), &[(RuleKind::Selection, "/etc", "p+sha256")]);
        let tree = Populator::new(&cfg, Cancellation::new()).from_disk().unwrap();
        let paths: Vec<&str> = tree.paths().collect();
        assert_eq!(
            paths,
            vec!["/etc", "/etc/passwd", "/etc/passwd.link", "/etc/ssh", "/etc/ssh/sshd_config"]
        );
    }

    #[test]
    fn hashes_only_regular_files_and_links_only_symlinks() {
        let dir = fixture();
        let cfg = config(dir.path(), &[(RuleKind::Selection, "/etc", "p+l+s+sha256+blake3")]);
        let tree = Populator::new(&cfg, Cancellation::new()).from_disk().unwrap();

        let passwd = tree.get("/etc/passwd").unwrap();
        assert!(passwd.error.is_none());
        assert!(passwd.mask.contains(Attribute::Sha256));
        assert!(passwd.mask.contains(Attribute::Blake3));
        assert!(!passwd.mask.contains(Attribute::LinkName));
        assert_eq!(passwd.get(Attribute::Size), Some(&AttrValue::Int(11)));

        let link = tree.get("/etc/passwd.link").unwrap();
        assert_eq!(link.file_type, FileType::Symlink);
        assert_eq!(link.get(Attribute::LinkName), Some(&AttrValue::Text("passwd".into())));
        assert!(!link.mask.intersects(AttributeMask::hashes()));

        let etc = tree.get("/etc").unwrap();
        assert_eq!(etc.file_type, FileType::Directory);
        assert!(!etc.mask.intersects(AttributeMask::hashes()));
    }

    #[test]
    fn negative_rules_prune_subtrees() {
        let dir = fixture();
        let cfg = config(
            dir.path(),
            &[
                (RuleKind::Selection, "/", "p"),
                (RuleKind::Negative, "/tmp$", ""),
                (RuleKind::Negative, "/usr/bin/.*", ""),
            ],
        );
        let mut visited = Vec::new();
        let pop = Populator::new(&cfg, Cancellation::new());
        pop.walk_disk(|v| {
            if let Visit::Path { path, resolution, .. } = v {
                visited.push((path.to_string(), resolution.outcome));
            }
        })
        .unwrap();
        assert!(visited.contains(&("/tmp".to_string(), Outcome::Excluded)));
        assert!(!visited.iter().any(|(p, _)| p.starts_with("/tmp/")));
        assert!(visited.contains(&("/usr/bin/tool".to_string(), Outcome::Excluded)));

        let tree = pop.from_disk().unwrap();
        assert!(tree.get("/").is_some());
        assert!(tree.get("/usr/bin").is_some());
        assert!(tree.get("/tmp").is_none());
        assert!(tree.get("/usr/bin/tool").is_none());
    }

    #[test]
    fn vanished_file_is_recorded_with_error() {
        let dir = fixture();
        let cfg = config(dir.path(), &[(RuleKind::Selection, "/etc", "p+sha256")]);
        let pop = Populator::new(&cfg, Cancellation::new());
        let entry = pop.capture(
            "/etc/gone",
            &dir.path().join("etc/gone"),
            FileType::Regular,
            AttributeMask::of(&[Attribute::Perm, Attribute::Sha256]),
        );
        assert!(entry.error.as_deref().unwrap().starts_with("lstat"));
        assert!(entry.mask.is_empty());
    }

    #[test]
    fn short_read_is_a_capture_error() {
        let mask = AttributeMask::of(&[Attribute::Sha256]);
        let err = hash_content(&mut &b"Port 22\n"[..], mask, 64).unwrap_err();
        assert_eq!(err, "read 8 bytes, expected 64: file changed while hashing");
        let digests = hash_content(&mut &b"Port 22\n"[..], mask, 8).unwrap();
        assert_eq!(digests.values.len(), 1);
    }

    #[test]
    fn unreadable_directory_is_recorded_with_error() {
        use std::os::unix::fs::PermissionsExt;

        if unsafe { libc::geteuid() } == 0 {
            return;
        }
        let dir = fixture();
        let locked = dir.path().join("etc/locked");
        fs::create_dir(&locked).unwrap();
        fs::write(locked.join("inner"), b"x").unwrap();
        fs::set_permissions(&locked, fs::Permissions::from_mode(0o000)).unwrap();

        let cfg = config(dir.path(), &[(RuleKind::Selection, "/etc", "p")]);
        let tree = Populator::new(&cfg, Cancellation::new()).populate(Source::Disk);
        fs::set_permissions(&locked, fs::Permissions::from_mode(0o755)).unwrap();

        let tree = tree.unwrap();
        let entry = tree.get("/etc/locked").unwrap();
        assert!(entry.error.as_deref().unwrap().starts_with("read directory:"));
        assert!(entry.mask.contains(Attribute::Perm));
        assert!(tree.get("/etc/locked/inner").is_none());
        assert!(tree.get("/etc/passwd").unwrap().error.is_none());
    }

    #[test]
    fn recursion_ceiling_stops_the_walk() {
        let dir = fixture();
        let mut cfg = config(dir.path(), &[(RuleKind::Selection, "/", "p")]);
        cfg.max_depth = 2;
        let tree = Populator::new(&cfg, Cancellation::new()).populate(Source::Disk).unwrap();
        assert!(tree.get("/etc/ssh").is_some());
        assert!(tree.get("/usr/bin").is_some());
        assert!(tree.get("/etc/ssh/sshd_config").is_none());
        assert!(tree.get("/usr/bin/tool").is_none());
        assert!(tree.paths().all(|p| p.matches('/').count() <= 2));
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn undecodable_names_stay_distinct_and_reload() {
        use std::ffi::OsStr;
        use std::os::unix::ffi::OsStrExt;

        let dir = fixture();
        let etc = dir.path().join("etc");
        fs::write(etc.join(OsStr::from_bytes(b"a\xff")), b"one").unwrap();
        fs::write(etc.join(OsStr::from_bytes(b"a\xfe")), b"two").unwrap();
        fs::write(etc.join("100%"), b"three").unwrap();

        let cfg = config(dir.path(), &[(RuleKind::Selection, "/etc", "sha256")]);
        let pop = Populator::new(&cfg, Cancellation::new());
        let tree = pop.populate(Source::Disk).unwrap();
        for path in ["/etc/a%FF", "/etc/a%FE", "/etc/100%25"] {
            let entry = tree.get(path).unwrap();
            assert!(entry.error.is_none(), "{path}");
            assert!(entry.mask.contains(Attribute::Sha256), "{path}");
        }
        assert_ne!(
            tree.get("/etc/a%FF").unwrap().get(Attribute::Sha256),
            tree.get("/etc/a%FE").unwrap().get(Attribute::Sha256)
        );
        assert_eq!(pop.disk_path("/etc/a%FF"), etc.join(OsStr::from_bytes(b"a\xff")));
        assert_eq!(pop.disk_path("/etc/100%25"), etc.join("100%"));

        let db = dir.path().join("fim.db");
        database::write_tree(&db, &tree).unwrap();
        assert_eq!(pop.populate(Source::Database(&db)).unwrap(), tree);
    }

    #[test]
    fn attribute_source_failure_is_recorded() {
        struct Unsupported;

        impl AttributeSource for Unsupported {
            fn name(&self) -> &'static str {
                "stub"
            }

            fn provides(&self) -> AttributeMask {
                AttributeMask::of(&[Attribute::Xattrs])
            }

            fn fetch(&self, _: &Path, _: FileType, _: AttributeMask) -> io::Result<Vec<(Attribute, AttrValue)>> {
                Err(io::Error::new(io::ErrorKind::Unsupported, "not supported"))
            }
        }

        let dir = fixture();
        let cfg = config(dir.path(), &[(RuleKind::Selection, "/etc", "p+xattrs")]);
        let pop = Populator::new(&cfg, Cancellation::new()).with_sources(vec![Box::new(Unsupported)]);
        let tree = pop.populate(Source::Disk).unwrap();
        let passwd = tree.get("/etc/passwd").unwrap();
        assert_eq!(passwd.error.as_deref(), Some("stub: not supported"));
        assert!(passwd.mask.contains(Attribute::Perm));
        assert!(!passwd.mask.contains(Attribute::Xattrs));
    }

    #[test]
    fn cancelled_pass_yields_no_tree() {
        let dir = fixture();
        let cfg = config(dir.path(), &[(RuleKind::Selection, "/", "p")]);
        let cancel = Cancellation::new();
        cancel.cancel();
        let err = Populator::new(&cfg, cancel).from_disk().unwrap_err();
        assert!(matches!(err, PopulateError::Cancelled));
    }

    #[test]
    fn stored_records_are_rematched() {
        let dir = fixture();
        let cfg = config(
            dir.path(),
            &[(RuleKind::Selection, "/etc", "p+u"), (RuleKind::Negative, "/etc/ssh$", "")],
        );
        let mut kept = Entry::new("/etc/passwd", FileType::Regular);
        kept.set(Attribute::Perm, AttrValue::Mode(0o644));
        kept.set(Attribute::Size, AttrValue::Int(10));
        let dropped = Entry::new("/etc/ssh/sshd_config", FileType::Regular);
        let unmatched = Entry::new("/var/log/syslog", FileType::Regular);

        let tree = Populator::new(&cfg, Cancellation::new())
            .from_records([Ok(kept), Ok(dropped), Ok(unmatched)])
            .unwrap();
        assert_eq!(tree.len(), 1);
        let passwd = tree.get("/etc/passwd").unwrap();
        assert_eq!(passwd.mask, AttributeMask::of(&[Attribute::Perm]));
    }
}
