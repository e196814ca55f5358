//! Rule-driven file integrity monitoring: capture selected file attributes
//! into a database and report what changed since.

pub mod actions;
pub mod attr;
pub mod cancel;
pub mod compare;
pub mod config;
pub mod database;
pub mod entry;
pub mod error;
pub mod file_type;
pub mod hashing;
pub mod matcher;
pub mod name;
pub mod paths;
pub mod populate;
pub mod report;
pub mod rules;
pub mod source;
pub mod tree;

pub use actions::{Command, Outcome};
pub use attr::{AttrValue, Attribute, AttributeMask};
pub use cancel::Cancellation;
pub use config::{Config, ConfigError, Settings};
pub use entry::{Entry, WorkingTree};
pub use error::{Error, Result};
pub use file_type::FileType;
