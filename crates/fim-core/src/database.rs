//! Line-oriented database file.
//!
//! ```text
//! {"format":"fim-db","version":1,"created_at":"...","attributes":["l","p",...]}
//! ["/etc/passwd","f","p+s+sha256",420,1200,"9f86d0..."]
//! ["/etc/shadow","f","p",416,"read: Permission denied (os error 13)"]
//! {"entries":2,"sha256":"..."}
//! ```
//!
//! Each entry line carries the path, the type character, the mask as `+`
//! joined attribute names, one value per mask attribute in canonical order
//! and an optional trailing capture error. The footer commits to the entry
//! count and a SHA-256 over the entry lines.

use crate::attr::{AttrValue, Attribute, AttributeMask};
use crate::entry::{Entry, WorkingTree};
use crate::file_type::FileType;
use crate::name;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};
use std::fs::{self, File};
use std::io::{self, BufRead, BufReader, BufWriter, Lines, Write};
use std::path::{Path, PathBuf};
use tempfile::NamedTempFile;
use thiserror::Error;
use tracing::{debug, info};

pub const FORMAT: &str = "fim-db";
pub const VERSION: u32 = 1;

#[derive(Debug, Error)]
pub enum DatabaseError {
    #[error("database {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("database {} line {line}: {reason}", path.display())]
    Malformed {
        path: PathBuf,
        line: usize,
        reason: String,
    },

    #[error("{} is not a fim database", path.display())]
    NotADatabase { path: PathBuf },

    #[error("database {} has unsupported version {version}", path.display())]
    UnsupportedVersion { path: PathBuf, version: u32 },

    #[error("database {} is truncated: footer missing", path.display())]
    MissingFooter { path: PathBuf },

    #[error("database {} failed checksum verification", path.display())]
    ChecksumMismatch { path: PathBuf },

    #[error("database {} footer records {expected} entries but {actual} were read", path.display())]
    CountMismatch {
        path: PathBuf,
        expected: u64,
        actual: u64,
    },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Header {
    pub format: String,
    pub version: u32,
    pub created_at: DateTime<Utc>,
    pub attributes: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct Footer {
    entries: u64,
    sha256: String,
}

fn io_err(path: &Path) -> impl FnOnce(io::Error) -> DatabaseError + '_ {
    move |source| DatabaseError::Io {
        path: path.to_path_buf(),
        source,
    }
}

/// Encode one entry as a database line (without the newline).
pub fn encode_entry(entry: &Entry) -> String {
    let mask: AttributeMask = entry.values.keys().copied().collect();
    let mut fields = Vec::with_capacity(mask.len() + 4);
    fields.push(Value::String(entry.path.clone()));
    fields.push(Value::String(entry.file_type.as_char().to_string()));
    fields.push(Value::String(mask.to_string()));
    fields.extend(mask.iter().filter_map(|a| entry.get(a)).map(AttrValue::to_json));
    if let Some(error) = &entry.error {
        fields.push(Value::String(error.clone()));
    }
    Value::Array(fields).to_string()
}

/// Decode an entry line. Errors are plain reasons; the reader adds the
/// location.
pub fn decode_entry(fields: &[Value]) -> Result<Entry, String> {
    let text = |i: usize, what: &str| {
        fields
            .get(i)
            .and_then(Value::as_str)
            .ok_or_else(|| format!("missing {what}"))
    };
    let path = text(0, "path")?;
    if !path.starts_with('/') {
        return Err(format!("path '{path}' is not absolute"));
    }
    name::decode(path).map_err(|e| e.to_string())?;
    let type_char = text(1, "file type")?;
    let file_type = {
        let mut chars = type_char.chars();
        match (chars.next().and_then(FileType::from_char), chars.next()) {
            (Some(t), None) => t,
            _ => return Err(format!("invalid file type '{type_char}'")),
        }
    };
    let mask_names = text(2, "attribute list")?;
    let mask = AttributeMask::parse_names(mask_names)
        .ok_or_else(|| format!("invalid attribute list '{mask_names}'"))?;

    let mut entry = Entry::new(path, file_type);
    let mut idx = 3;
    for attr in mask.iter() {
        let raw = fields
            .get(idx)
            .ok_or_else(|| format!("missing value for {}", attr.config_name()))?;
        let value = AttrValue::from_json(attr.kind(), raw)
            .map_err(|e| format!("{}: {e}", attr.config_name()))?;
        entry.set(attr, value);
        idx += 1;
    }
    match &fields[idx.min(fields.len())..] {
        [] => {}
        [Value::String(error)] => entry.error = Some(error.clone()),
        _ => return Err("unexpected trailing fields".into()),
    }
    Ok(entry)
}

/// Streams entries into a temp file next to the destination; the file is
/// renamed into place by [`Writer::finish`].
pub struct Writer {
    path: PathBuf,
    out: BufWriter<NamedTempFile>,
    hasher: Sha256,
    count: u64,
}

impl Writer {
    pub fn create(path: &Path) -> Result<Self, DatabaseError> {
        let dir = match path.parent() {
            Some(p) if !p.as_os_str().is_empty() => p,
            _ => Path::new("."),
        };
        fs::create_dir_all(dir).map_err(io_err(path))?;
        let tmp = NamedTempFile::new_in(dir).map_err(io_err(path))?;
        let mut writer = Self {
            path: path.to_path_buf(),
            out: BufWriter::new(tmp),
            hasher: Sha256::new(),
            count: 0,
        };
        let header = Header {
            format: FORMAT.to_string(),
            version: VERSION,
            created_at: Utc::now(),
            attributes: Attribute::ALL.iter().map(|a| a.config_name().to_string()).collect(),
        };
        let line = serde_json::to_string(&header).map_err(|e| DatabaseError::Malformed {
            path: path.to_path_buf(),
            line: 1,
            reason: e.to_string(),
        })?;
        writer.write_line(&line)?;
        Ok(writer)
    }

    fn write_line(&mut self, line: &str) -> Result<(), DatabaseError> {
        self.out
            .write_all(line.as_bytes())
            .and_then(|_| self.out.write_all(b"\n"))
            .map_err(io_err(&self.path))
    }

    pub fn write_entry(&mut self, entry: &Entry) -> Result<(), DatabaseError> {
        let line = encode_entry(entry);
        self.hasher.update(line.as_bytes());
        self.hasher.update(b"\n");
        self.count += 1;
        self.write_line(&line)
    }

    /// Write the footer, sync and move the file into place.
    pub fn finish(mut self) -> Result<u64, DatabaseError> {
        let footer = Footer {
            entries: self.count,
            sha256: hex::encode(self.hasher.clone().finalize()),
        };
        let line = serde_json::to_string(&footer).map_err(|e| DatabaseError::Malformed {
            path: self.path.clone(),
            line: self.count as usize + 2,
            reason: e.to_string(),
        })?;
        self.write_line(&line)?;

        let path = self.path;
        let tmp = self
            .out
            .into_inner()
            .map_err(|e| io_err(&path)(e.into_error()))?;
        tmp.as_file().sync_all().map_err(io_err(&path))?;
        tmp.persist(&path).map_err(|e| io_err(&path)(e.error))?;
        info!(database = %path.display(), entries = self.count, "database written");
        Ok(self.count)
    }
}

/// Write a whole tree.
pub fn write_tree(path: &Path, tree: &WorkingTree) -> Result<u64, DatabaseError> {
    let mut writer = Writer::create(path)?;
    for entry in tree.entries() {
        writer.write_entry(entry)?;
    }
    writer.finish()
}

/// Iterates over the entries of a database file, verifying the footer when
/// the end is reached.
pub struct Reader {
    path: PathBuf,
    lines: Lines<BufReader<File>>,
    line_no: usize,
    header: Header,
    hasher: Sha256,
    count: u64,
    done: bool,
}

impl Reader {
    pub fn open(path: &Path) -> Result<Self, DatabaseError> {
        let file = File::open(path).map_err(io_err(path))?;
        let mut lines = BufReader::new(file).lines();
        let first = match lines.next() {
            Some(line) => line.map_err(io_err(path))?,
            None => {
                return Err(DatabaseError::NotADatabase {
                    path: path.to_path_buf(),
                })
            }
        };
        let header: Header = serde_json::from_str(&first).map_err(|_| DatabaseError::NotADatabase {
            path: path.to_path_buf(),
        })?;
        if header.format != FORMAT {
            return Err(DatabaseError::NotADatabase {
                path: path.to_path_buf(),
            });
        }
        if header.version != VERSION {
            return Err(DatabaseError::UnsupportedVersion {
                path: path.to_path_buf(),
                version: header.version,
            });
        }
        if let Some(unknown) = header
            .attributes
            .iter()
            .find(|name| Attribute::from_config_name(name).is_none())
        {
            return Err(DatabaseError::Malformed {
                path: path.to_path_buf(),
                line: 1,
                reason: format!("unknown attribute '{unknown}'"),
            });
        }
        debug!(database = %path.display(), created_at = %header.created_at, "opened database");
        Ok(Self {
            path: path.to_path_buf(),
            lines,
            line_no: 1,
            header,
            hasher: Sha256::new(),
            count: 0,
            done: false,
        })
    }

    pub fn header(&self) -> &Header {
        &self.header
    }

    fn malformed(&self, reason: impl Into<String>) -> DatabaseError {
        DatabaseError::Malformed {
            path: self.path.clone(),
            line: self.line_no,
            reason: reason.into(),
        }
    }

    fn verify(&self, footer: Footer) -> Result<(), DatabaseError> {
        if footer.entries != self.count {
            return Err(DatabaseError::CountMismatch {
                path: self.path.clone(),
                expected: footer.entries,
                actual: self.count,
            });
        }
        if hex::encode(self.hasher.clone().finalize()) != footer.sha256 {
            return Err(DatabaseError::ChecksumMismatch {
                path: self.path.clone(),
            });
        }
        Ok(())
    }

    fn next_record(&mut self) -> Option<Result<Entry, DatabaseError>> {
        let line = match self.lines.next()? {
            Ok(line) => line,
            Err(e) => return Some(Err(io_err(&self.path)(e))),
        };
        self.line_no += 1;

        if self.done {
            return Some(Err(self.malformed("data after footer")));
        }
        let value: Value = match serde_json::from_str(&line) {
            Ok(v) => v,
            Err(e) => return Some(Err(self.malformed(e.to_string()))),
        };
        match value {
            Value::Array(fields) => {
                self.hasher.update(line.as_bytes());
                self.hasher.update(b"\n");
                self.count += 1;
                Some(decode_entry(&fields).map_err(|reason| self.malformed(reason)))
            }
            Value::Object(_) => {
                self.done = true;
                let footer: Footer = match serde_json::from_value(value) {
                    Ok(f) => f,
                    Err(e) => return Some(Err(self.malformed(format!("footer: {e}")))),
                };
                match self.verify(footer) {
                    Ok(()) => self.next_record(),
                    Err(e) => Some(Err(e)),
                }
            }
            _ => Some(Err(self.malformed("expected an entry array"))),
        }
    }
}

impl Iterator for Reader {
    type Item = Result<Entry, DatabaseError>;

    fn next(&mut self) -> Option<Self::Item> {
        match self.next_record() {
            Some(item) => Some(item),
            None if !self.done => {
                self.done = true;
                Some(Err(DatabaseError::MissingFooter {
                    path: self.path.clone(),
                }))
            }
            None => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use std::collections::BTreeMap;

    fn sample() -> WorkingTree {
        let mut passwd = Entry::new("/etc/passwd", FileType::Regular);
        passwd.set(Attribute::Perm, AttrValue::Mode(0o644));
        passwd.set(Attribute::Size, AttrValue::Int(1200));
        passwd.set(Attribute::Mtime, AttrValue::Time(Utc.timestamp_opt(1_700_000_000, 123_456_789).unwrap()));
        passwd.set(Attribute::Sha256, AttrValue::Digest(vec![0xab; 32]));
        let mut xattrs = BTreeMap::new();
        xattrs.insert("user.origin".to_string(), vec![0, 159, 146, 150]);
        passwd.set(Attribute::Xattrs, AttrValue::Xattrs(xattrs));

        let mut link = Entry::new("/etc/localtime", FileType::Symlink);
        link.set(Attribute::LinkName, AttrValue::Text("/usr/share/zoneinfo/UTC".into()));

        let mut broken = Entry::new("/etc/shadow", FileType::Regular);
        broken.set(Attribute::Perm, AttrValue::Mode(0o640));
        broken.record_error("read: Permission denied");

        let bare = Entry::new("/etc/unmonitored", FileType::Fifo);
        [passwd, link, broken, bare].into_iter().collect()
    }

    #[test]
    fn tree_survives_write_and_read() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("fim.db");
        let tree = sample();
        assert_eq!(write_tree(&path, &tree).unwrap(), 4);

        let reader = Reader::open(&path).unwrap();
        assert_eq!(reader.header().version, VERSION);
        let loaded: WorkingTree = reader.collect::<Result<_, _>>().unwrap();
        assert_eq!(loaded, tree);
    }

    #[test]
    fn entry_line_layout() {
        let tree = sample();
        let line = encode_entry(tree.get("/etc/shadow").unwrap());
        assert_eq!(line, r#"["/etc/shadow","f","p",416,"read: Permission denied"]"#);
        let line = encode_entry(tree.get("/etc/unmonitored").unwrap());
        assert_eq!(line, r#"["/etc/unmonitored","p",""]"#);
    }

    #[test]
    fn tampered_database_fails_verification() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("fim.db");
        write_tree(&path, &sample()).unwrap();
        let text = fs::read_to_string(&path).unwrap().replace(",1200,", ",1201,");
        fs::write(&path, text).unwrap();

        let result: Result<Vec<Entry>, _> = Reader::open(&path).unwrap().collect();
        assert!(matches!(result, Err(DatabaseError::ChecksumMismatch { .. })));
    }

    #[test]
    fn truncated_database_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("fim.db");
        write_tree(&path, &sample()).unwrap();
        let text = fs::read_to_string(&path).unwrap();
        let without_footer: Vec<&str> = text.lines().collect();
        fs::write(&path, without_footer[..without_footer.len() - 1].join("\n")).unwrap();

        let result: Result<Vec<Entry>, _> = Reader::open(&path).unwrap().collect();
        assert!(matches!(result, Err(DatabaseError::MissingFooter { .. })));
    }

    #[test]
    fn foreign_files_are_not_databases() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("notes.txt");
        fs::write(&path, "hello\n").unwrap();
        assert!(matches!(Reader::open(&path), Err(DatabaseError::NotADatabase { .. })));
        assert!(matches!(
            Reader::open(&dir.path().join("missing.db")),
            Err(DatabaseError::Io { .. })
        ));
    }

    #[test]
    fn malformed_records_report_their_line() {
        let err = decode_entry(&serde_json::from_str::<Vec<Value>>(r#"["/x","f","p"]"#).unwrap()).unwrap_err();
        assert_eq!(err, "missing value for p");
        let err = decode_entry(&serde_json::from_str::<Vec<Value>>(r#"["x","f",""]"#).unwrap()).unwrap_err();
        assert!(err.contains("not absolute"));
        let err = decode_entry(&serde_json::from_str::<Vec<Value>>(r#"["/x","q",""]"#).unwrap()).unwrap_err();
        assert!(err.contains("file type"));
        let err = decode_entry(&serde_json::from_str::<Vec<Value>>(r#"["/etc/a%zz","f",""]"#).unwrap()).unwrap_err();
        assert!(err.contains("malformed escape"));
        assert!(decode_entry(&serde_json::from_str::<Vec<Value>>(r#"["/etc/a%FF","f",""]"#).unwrap()).is_ok());
    }
}
