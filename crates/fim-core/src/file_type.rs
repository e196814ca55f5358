use serde::{Deserialize, Serialize};
use std::fmt;

/// Resolved type of a filesystem object, as reported by `lstat`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FileType {
    Regular,
    Directory,
    Symlink,
    Socket,
    Fifo,
    Block,
    Char,
}

impl FileType {
    pub const ALL: [FileType; 7] = [
        FileType::Regular,
        FileType::Directory,
        FileType::Symlink,
        FileType::Socket,
        FileType::Fifo,
        FileType::Block,
        FileType::Char,
    ];

    pub fn as_char(self) -> char {
        match self {
            Self::Regular => 'f',
            Self::Directory => 'd',
            Self::Symlink => 'l',
            Self::Socket => 's',
            Self::Fifo => 'p',
            Self::Block => 'b',
            Self::Char => 'c',
        }
    }

    pub fn from_char(c: char) -> Option<Self> {
        Self::ALL.into_iter().find(|t| t.as_char() == c)
    }

    /// Map a `std` file type (never followed through symlinks).
    pub fn from_std(ft: std::fs::FileType) -> Option<Self> {
        if ft.is_symlink() {
            return Some(Self::Symlink);
        }
        if ft.is_dir() {
            return Some(Self::Directory);
        }
        if ft.is_file() {
            return Some(Self::Regular);
        }
        #[cfg(unix)]
        {
            use std::os::unix::fs::FileTypeExt;
            if ft.is_socket() {
                return Some(Self::Socket);
            }
            if ft.is_fifo() {
                return Some(Self::Fifo);
            }
            if ft.is_block_device() {
                return Some(Self::Block);
            }
            if ft.is_char_device() {
                return Some(Self::Char);
            }
        }
        None
    }
}

impl fmt::Display for FileType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_char())
    }
}

/// File-type filter carried by a rule.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum Restriction {
    #[default]
    Any,
    Only(FileType),
}

impl Restriction {
    pub fn allows(self, file_type: FileType) -> bool {
        match self {
            Self::Any => true,
            Self::Only(t) => t == file_type,
        }
    }

    /// Parse the restriction alphabet; `?` and the empty string mean any type.
    pub fn parse(s: &str) -> Option<Self> {
        let mut chars = s.chars();
        match (chars.next(), chars.next()) {
            (None, _) | (Some('?'), None) => Some(Self::Any),
            (Some(c), None) => FileType::from_char(c).map(Self::Only),
            _ => None,
        }
    }
}

impl fmt::Display for Restriction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Any => write!(f, "?"),
            Self::Only(t) => write!(f, "{t}"),
        }
    }
}
