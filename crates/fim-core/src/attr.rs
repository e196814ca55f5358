//! Recordable attributes, attribute masks and captured attribute values.
//!
//! Every attribute defines its value kind, comparison and serialization once,
//! here; the populator, comparator, reporter and database codec only ever go
//! through [`Attribute`] and [`AttrValue`].

use crate::config::ConfigError;
use crate::file_type::FileType;
use base64::{engine::general_purpose, Engine as _};
use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Serialize, Serializer};
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::ops::{BitAnd, BitOr, BitOrAssign, Sub};

/// One recordable file property. Declaration order is the canonical
/// attribute order used by the database codec and the reports.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Attribute {
    LinkName,
    Perm,
    FileType,
    Inode,
    LinkCount,
    Uid,
    Gid,
    Size,
    SizeGrowing,
    Blocks,
    Atime,
    Mtime,
    Ctime,
    Sha256,
    Sha512,
    Blake3,
    Acl,
    Xattrs,
    Selinux,
    E2fsAttrs,
    Capabilities,
}

/// How an attribute's value is represented.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ValueKind {
    Text,
    Int,
    Mode,
    Time,
    Digest,
    FileType,
    Xattrs,
}

/// How much a change to an attribute matters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Low,
    Medium,
    High,
}

impl Attribute {
    pub const ALL: [Attribute; 21] = [
        Attribute::LinkName,
        Attribute::Perm,
        Attribute::FileType,
        Attribute::Inode,
        Attribute::LinkCount,
        Attribute::Uid,
        Attribute::Gid,
        Attribute::Size,
        Attribute::SizeGrowing,
        Attribute::Blocks,
        Attribute::Atime,
        Attribute::Mtime,
        Attribute::Ctime,
        Attribute::Sha256,
        Attribute::Sha512,
        Attribute::Blake3,
        Attribute::Acl,
        Attribute::Xattrs,
        Attribute::Selinux,
        Attribute::E2fsAttrs,
        Attribute::Capabilities,
    ];

    pub const fn bit(self) -> u64 {
        1u64 << (self as u32)
    }

    /// Name used in configuration expressions and in the database.
    pub fn config_name(self) -> &'static str {
        match self {
            Self::LinkName => "l",
            Self::Perm => "p",
            Self::FileType => "ftype",
            Self::Inode => "i",
            Self::LinkCount => "n",
            Self::Uid => "u",
            Self::Gid => "g",
            Self::Size => "s",
            Self::SizeGrowing => "S",
            Self::Blocks => "b",
            Self::Atime => "a",
            Self::Mtime => "m",
            Self::Ctime => "c",
            Self::Sha256 => "sha256",
            Self::Sha512 => "sha512",
            Self::Blake3 => "blake3",
            Self::Acl => "acl",
            Self::Xattrs => "xattrs",
            Self::Selinux => "selinux",
            Self::E2fsAttrs => "e2fsattrs",
            Self::Capabilities => "caps",
        }
    }

    pub fn from_config_name(name: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|a| a.config_name() == name)
    }

    /// Human readable label for reports.
    pub fn label(self) -> &'static str {
        match self {
            Self::LinkName => "Link",
            Self::Perm => "Perm",
            Self::FileType => "File type",
            Self::Inode => "Inode",
            Self::LinkCount => "Linkcount",
            Self::Uid => "UID",
            Self::Gid => "GID",
            Self::Size => "Size",
            Self::SizeGrowing => "Size (>)",
            Self::Blocks => "Block count",
            Self::Atime => "Atime",
            Self::Mtime => "Mtime",
            Self::Ctime => "Ctime",
            Self::Sha256 => "SHA256",
            Self::Sha512 => "SHA512",
            Self::Blake3 => "BLAKE3",
            Self::Acl => "ACL",
            Self::Xattrs => "XAttrs",
            Self::Selinux => "SELinux",
            Self::E2fsAttrs => "E2FSAttrs",
            Self::Capabilities => "Caps",
        }
    }

    pub fn kind(self) -> ValueKind {
        match self {
            Self::LinkName | Self::Acl | Self::Selinux | Self::E2fsAttrs | Self::Capabilities => {
                ValueKind::Text
            }
            Self::Perm => ValueKind::Mode,
            Self::FileType => ValueKind::FileType,
            Self::Inode
            | Self::LinkCount
            | Self::Uid
            | Self::Gid
            | Self::Size
            | Self::SizeGrowing
            | Self::Blocks => ValueKind::Int,
            Self::Atime | Self::Mtime | Self::Ctime => ValueKind::Time,
            Self::Sha256 | Self::Sha512 | Self::Blake3 => ValueKind::Digest,
            Self::Xattrs => ValueKind::Xattrs,
        }
    }

    pub fn is_hash(self) -> bool {
        matches!(self, Self::Sha256 | Self::Sha512 | Self::Blake3)
    }

    pub fn severity(self) -> Severity {
        match self {
            Self::Sha256
            | Self::Sha512
            | Self::Blake3
            | Self::LinkName
            | Self::FileType
            | Self::Selinux
            | Self::Capabilities => Severity::High,
            Self::Atime | Self::Mtime | Self::Ctime => Severity::Low,
            _ => Severity::Medium,
        }
    }

    /// Whether `old -> new` counts as a change for this attribute.
    ///
    /// The growing-size attribute only flags an increase; everything else is
    /// exact equality.
    pub fn differs(self, old: &AttrValue, new: &AttrValue) -> bool {
        match (self, old, new) {
            (Self::SizeGrowing, AttrValue::Int(o), AttrValue::Int(n)) => n > o,
            _ => old != new,
        }
    }
}

impl fmt::Display for Attribute {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.config_name())
    }
}

impl Serialize for Attribute {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.config_name())
    }
}

/// Fixed-width bitset of [`Attribute`]s.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct AttributeMask(u64);

impl AttributeMask {
    pub const EMPTY: AttributeMask = AttributeMask(0);

    pub const fn from_bits(bits: u64) -> Self {
        Self(bits)
    }

    pub const fn bits(self) -> u64 {
        self.0
    }

    pub fn of(attrs: &[Attribute]) -> Self {
        attrs.iter().copied().collect()
    }

    pub fn all() -> Self {
        Attribute::ALL.into_iter().collect()
    }

    pub fn hashes() -> Self {
        Self::of(&[Attribute::Sha256, Attribute::Sha512, Attribute::Blake3])
    }

    /// Extended attribute group (`X`).
    pub fn extended() -> Self {
        Self::of(&[
            Attribute::Acl,
            Attribute::Xattrs,
            Attribute::Selinux,
            Attribute::E2fsAttrs,
            Attribute::Capabilities,
        ])
    }

    /// Attributes taken straight from `lstat`.
    pub fn stat() -> Self {
        Self::of(&[
            Attribute::Perm,
            Attribute::FileType,
            Attribute::Inode,
            Attribute::LinkCount,
            Attribute::Uid,
            Attribute::Gid,
            Attribute::Size,
            Attribute::SizeGrowing,
            Attribute::Blocks,
            Attribute::Atime,
            Attribute::Mtime,
            Attribute::Ctime,
        ])
    }

    pub fn contains(self, attr: Attribute) -> bool {
        self.0 & attr.bit() != 0
    }

    pub fn insert(&mut self, attr: Attribute) {
        self.0 |= attr.bit();
    }

    pub fn remove(&mut self, attr: Attribute) {
        self.0 &= !attr.bit();
    }

    pub fn is_empty(self) -> bool {
        self.0 == 0
    }

    pub fn is_subset(self, other: AttributeMask) -> bool {
        self.0 & !other.0 == 0
    }

    pub fn intersects(self, other: AttributeMask) -> bool {
        self.0 & other.0 != 0
    }

    pub fn len(self) -> usize {
        self.0.count_ones() as usize
    }

    /// Attributes in canonical order.
    pub fn iter(self) -> impl Iterator<Item = Attribute> {
        Attribute::ALL.into_iter().filter(move |a| self.contains(*a))
    }

    /// Parse a `+`-joined list of attribute names (the form written by
    /// `Display`).
    pub fn parse_names(s: &str) -> Option<Self> {
        let mut mask = Self::EMPTY;
        for name in s.split('+').filter(|n| !n.is_empty()) {
            mask.insert(Attribute::from_config_name(name)?);
        }
        Some(mask)
    }
}

impl FromIterator<Attribute> for AttributeMask {
    fn from_iter<I: IntoIterator<Item = Attribute>>(iter: I) -> Self {
        let mut mask = Self::EMPTY;
        for a in iter {
            mask.insert(a);
        }
        mask
    }
}

impl BitOr for AttributeMask {
    type Output = Self;
    fn bitor(self, rhs: Self) -> Self {
        Self(self.0 | rhs.0)
    }
}

impl BitOrAssign for AttributeMask {
    fn bitor_assign(&mut self, rhs: Self) {
        self.0 |= rhs.0;
    }
}

impl BitAnd for AttributeMask {
    type Output = Self;
    fn bitand(self, rhs: Self) -> Self {
        Self(self.0 & rhs.0)
    }
}

impl Sub for AttributeMask {
    type Output = Self;
    fn sub(self, rhs: Self) -> Self {
        Self(self.0 & !rhs.0)
    }
}

impl fmt::Display for AttributeMask {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let names: Vec<&str> = self.iter().map(Attribute::config_name).collect();
        f.write_str(&names.join("+"))
    }
}

impl Serialize for AttributeMask {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_seq(self.iter().map(Attribute::config_name))
    }
}

/// Named attribute groups usable in configuration expressions.
#[derive(Debug, Clone)]
pub struct AttributeGroups {
    groups: HashMap<String, AttributeMask>,
}

impl Default for AttributeGroups {
    fn default() -> Self {
        use Attribute::*;
        let mut groups = HashMap::new();
        for attr in Attribute::ALL {
            groups.insert(attr.config_name().to_string(), AttributeMask::of(&[attr]));
        }
        let x = AttributeMask::extended();
        let common = AttributeMask::of(&[Perm, FileType, Inode, LinkCount, Uid, Gid]);
        groups.insert(
            "R".into(),
            common | AttributeMask::of(&[Size, LinkName, Mtime, Ctime, Sha256]) | x,
        );
        groups.insert("L".into(), common | AttributeMask::of(&[LinkName]) | x);
        groups.insert(">".into(), common | AttributeMask::of(&[SizeGrowing, LinkName]) | x);
        groups.insert("H".into(), AttributeMask::hashes());
        groups.insert("X".into(), x);
        groups.insert("E".into(), AttributeMask::EMPTY);
        Self { groups }
    }
}

impl AttributeGroups {
    pub fn get(&self, name: &str) -> Option<AttributeMask> {
        self.groups.get(name).copied()
    }

    /// Define (or redefine) a compound group. Single attribute names are
    /// reserved.
    pub fn define(&mut self, name: &str, expr: &str) -> Result<AttributeMask, ConfigError> {
        if name.is_empty() || name.contains(['+', '-']) || name.contains(char::is_whitespace) {
            return Err(ConfigError::InvalidGroupName(name.to_string()));
        }
        if Attribute::from_config_name(name).is_some() {
            return Err(ConfigError::ReservedGroup(name.to_string()));
        }
        let mask = self.parse_expr(expr)?;
        self.groups.insert(name.to_string(), mask);
        Ok(mask)
    }

    /// Expand an expression like `R+sha512-m`.
    pub fn parse_expr(&self, expr: &str) -> Result<AttributeMask, ConfigError> {
        let expr = expr.trim();
        let mut mask = AttributeMask::EMPTY;
        let mut add = true;
        let mut token = String::new();
        let apply = |token: &str, add: bool, mask: &mut AttributeMask| -> Result<(), ConfigError> {
            if token.is_empty() {
                return Ok(());
            }
            let group = self
                .get(token)
                .ok_or_else(|| ConfigError::UnknownGroup(token.to_string()))?;
            if add {
                *mask |= group;
            } else {
                *mask = *mask - group;
            }
            Ok(())
        };
        for c in expr.chars() {
            match c {
                '+' | '-' => {
                    apply(&token, add, &mut mask)?;
                    token.clear();
                    add = c == '+';
                }
                c if c.is_whitespace() => {}
                c => token.push(c),
            }
        }
        apply(&token, add, &mut mask)?;
        Ok(mask)
    }
}

/// A captured attribute value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AttrValue {
    Text(String),
    Int(u64),
    Mode(u32),
    Time(DateTime<Utc>),
    Digest(Vec<u8>),
    FileType(FileType),
    Xattrs(BTreeMap<String, Vec<u8>>),
}

impl AttrValue {
    pub fn kind(&self) -> ValueKind {
        match self {
            Self::Text(_) => ValueKind::Text,
            Self::Int(_) => ValueKind::Int,
            Self::Mode(_) => ValueKind::Mode,
            Self::Time(_) => ValueKind::Time,
            Self::Digest(_) => ValueKind::Digest,
            Self::FileType(_) => ValueKind::FileType,
            Self::Xattrs(_) => ValueKind::Xattrs,
        }
    }

    pub fn to_json(&self) -> serde_json::Value {
        use serde_json::Value;
        match self {
            Self::Text(s) => Value::String(s.clone()),
            Self::Int(n) => Value::from(*n),
            Self::Mode(m) => Value::from(*m),
            Self::Time(t) => Value::String(t.to_rfc3339_opts(SecondsFormat::Nanos, true)),
            Self::Digest(d) => Value::String(hex::encode(d)),
            Self::FileType(t) => Value::String(t.as_char().to_string()),
            Self::Xattrs(map) => Value::Object(
                map.iter()
                    .map(|(k, v)| (k.clone(), Value::String(general_purpose::STANDARD.encode(v))))
                    .collect(),
            ),
        }
    }

    pub fn from_json(kind: ValueKind, value: &serde_json::Value) -> Result<Self, String> {
        use serde_json::Value;
        match (kind, value) {
            (ValueKind::Text, Value::String(s)) => Ok(Self::Text(s.clone())),
            (ValueKind::Int, Value::Number(n)) => n
                .as_u64()
                .map(Self::Int)
                .ok_or_else(|| format!("invalid integer {n}")),
            (ValueKind::Mode, Value::Number(n)) => n
                .as_u64()
                .and_then(|m| u32::try_from(m).ok())
                .map(Self::Mode)
                .ok_or_else(|| format!("invalid mode {n}")),
            (ValueKind::Time, Value::String(s)) => DateTime::parse_from_rfc3339(s)
                .map(|t| Self::Time(t.with_timezone(&Utc)))
                .map_err(|e| format!("invalid timestamp '{s}': {e}")),
            (ValueKind::Digest, Value::String(s)) => hex::decode(s)
                .map(Self::Digest)
                .map_err(|e| format!("invalid digest '{s}': {e}")),
            (ValueKind::FileType, Value::String(s)) => {
                let mut chars = s.chars();
                match (chars.next().and_then(FileType::from_char), chars.next()) {
                    (Some(t), None) => Ok(Self::FileType(t)),
                    _ => Err(format!("invalid file type '{s}'")),
                }
            }
            (ValueKind::Xattrs, Value::Object(map)) => {
                let mut out = BTreeMap::new();
                for (k, v) in map {
                    let encoded = v.as_str().ok_or_else(|| format!("xattr {k} is not a string"))?;
                    let bytes = general_purpose::STANDARD
                        .decode(encoded)
                        .map_err(|e| format!("xattr {k}: {e}"))?;
                    out.insert(k.clone(), bytes);
                }
                Ok(Self::Xattrs(out))
            }
            (kind, other) => Err(format!("expected {kind:?} value, found {other}")),
        }
    }
}

impl fmt::Display for AttrValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Text(s) => f.write_str(s),
            Self::Int(n) => write!(f, "{n}"),
            Self::Mode(m) => write!(f, "{:04o}", m & 0o7777),
            Self::Time(t) => write!(f, "{}", t.format("%Y-%m-%d %H:%M:%S%.f %z")),
            Self::Digest(d) => f.write_str(&hex::encode(d)),
            Self::FileType(t) => write!(f, "{t}"),
            Self::Xattrs(map) => {
                let names: Vec<&str> = map.keys().map(String::as_str).collect();
                write!(f, "num={} [{}]", map.len(), names.join(", "))
            }
        }
    }
}

impl Serialize for AttrValue {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        self.to_json().serialize(serializer)
    }
}
