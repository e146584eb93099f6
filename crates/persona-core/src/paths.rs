use directories::ProjectDirs;
use std::path::PathBuf;

use crate::error::{Result, VaultError};

pub const APP_QUALIFIER: &str = "com";
pub const APP_ORG: &str = "persona";
pub const APP_NAME: &str = "persona";

pub const STORE_FILE: &str = "store.json";
pub const CONFIG_FILE: &str = "config.json";

pub fn data_dir() -> Result<PathBuf> {
    if let Ok(override_path) = std::env::var("PERSONA_DATA_DIR") {
        return Ok(PathBuf::from(override_path));
    }
    let dirs = ProjectDirs::from(APP_QUALIFIER, APP_ORG, APP_NAME)
        .ok_or_else(|| VaultError::StorageUnavailable("cannot determine data directory".into()))?;
    Ok(dirs.data_dir().to_path_buf())
}

pub fn store_path() -> Result<PathBuf> {
    Ok(data_dir()?.join(STORE_FILE))
}

pub fn config_path() -> Result<PathBuf> {
    Ok(data_dir()?.join(CONFIG_FILE))
}
