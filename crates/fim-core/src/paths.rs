use crate::config::Settings;
use crate::error::{Error, Result};
use directories::ProjectDirs;
use std::path::PathBuf;

pub const APP_QUALIFIER: &str = "com";
pub const APP_ORG: &str = "darklock";
pub const APP_NAME: &str = "fim";

pub const CONFIG_ENV: &str = "FIM_CONFIG";

fn project_dirs() -> Result<ProjectDirs> {
    ProjectDirs::from(APP_QUALIFIER, APP_ORG, APP_NAME).ok_or(Error::NoProjectDirs)
}

pub fn data_dir() -> Result<PathBuf> {
    Ok(project_dirs()?.data_dir().to_path_buf())
}

pub fn config_path() -> Result<PathBuf> {
    if let Ok(override_path) = std::env::var(CONFIG_ENV) {
        return Ok(PathBuf::from(override_path));
    }
    Ok(project_dirs()?.config_dir().join("fim.json"))
}

pub fn database_path() -> Result<PathBuf> {
    Ok(data_dir()?.join("fim.db"))
}

pub fn new_database_path() -> Result<PathBuf> {
    Ok(data_dir()?.join("fim.db.new"))
}

/// Fill unset database locations with the per-user defaults. The second
/// database for `compare` has no default.
pub fn apply_defaults(settings: &mut Settings) -> Result<()> {
    if settings.database_in.is_none() {
        settings.database_in = Some(database_path()?);
    }
    if settings.database_out.is_none() {
        settings.database_out = Some(new_database_path()?);
    }
    Ok(())
}
