use crate::config::ConfigError;
use crate::database::DatabaseError;
use crate::populate::PopulateError;
use std::path::PathBuf;
use thiserror::Error;

pub const EXIT_OK: i32 = 0;
pub const EXIT_INVALID_ARGUMENT: i32 = 15;
pub const EXIT_INVALID_CONFIG: i32 = 17;
pub const EXIT_IO: i32 = 18;
pub const EXIT_CANCELLED: i32 = 130;

#[derive(Debug, Error)]
pub enum Error {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Database error: {0}")]
    Database(#[from] DatabaseError),

    #[error("missing '{0}', config option is required")]
    MissingOption(&'static str),

    #[error("input and output database cannot be the same when doing database update: {}", .0.display())]
    SameDatabase(PathBuf),

    #[error("both input databases cannot be the same when doing database compare: {}", .0.display())]
    SameInputs(PathBuf),

    #[error("root_prefix {} is not an accessible directory: {source}", path.display())]
    RootPrefix {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid argument {option}: {reason}")]
    InvalidArgument { option: &'static str, reason: String },

    #[error("Serialisation error: {0}")]
    Serialisation(#[from] serde_json::Error),

    #[error("cannot determine default directories")]
    NoProjectDirs,

    #[error("cancelled")]
    Cancelled,
}

impl From<PopulateError> for Error {
    fn from(err: PopulateError) -> Self {
        match err {
            PopulateError::Cancelled => Self::Cancelled,
            PopulateError::Database(e) => Self::Database(e),
        }
    }
}

impl Error {
    /// Reserved process exit code for this error class.
    pub fn exit_code(&self) -> i32 {
        match self {
            Self::Config(_) | Self::RootPrefix { .. } | Self::NoProjectDirs => EXIT_INVALID_CONFIG,
            Self::Database(DatabaseError::Io { .. }) | Self::Serialisation(_) => EXIT_IO,
            Self::Database(_)
            | Self::MissingOption(_)
            | Self::SameDatabase(_)
            | Self::SameInputs(_)
            | Self::InvalidArgument { .. } => EXIT_INVALID_ARGUMENT,
            Self::Cancelled => EXIT_CANCELLED,
        }
    }
}

pub type Result<T, E = Error> = std::result::Result<T, E>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_classes_map_to_reserved_codes() {
        assert_eq!(Error::Config(ConfigError::InvalidDepth).exit_code(), EXIT_INVALID_CONFIG);
        assert_eq!(Error::MissingOption("database_in").exit_code(), EXIT_INVALID_ARGUMENT);
        assert_eq!(Error::from(PopulateError::Cancelled).exit_code(), EXIT_CANCELLED);
        let io = Error::Database(DatabaseError::Io {
            path: "/var/lib/fim/fim.db".into(),
            source: std::io::Error::from(std::io::ErrorKind::NotFound),
        });
        assert_eq!(io.exit_code(), EXIT_IO);
        assert_eq!(
            Error::Database(DatabaseError::MissingFooter { path: "/x".into() }).exit_code(),
            EXIT_INVALID_ARGUMENT
        );
    }
}
