//! Configuration loading and root folder resolution
//!
//! Root folder priority order:
//! 1. Command-line argument (highest priority)
//! 2. Environment variable
//! 3. TOML config file
//! 4. OS-dependent compiled default (fallback)

use crate::{Error, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

/// Environment variable consulted for the root folder
pub const ROOT_FOLDER_ENV: &str = "CAP_ROOT_FOLDER";

/// Database file name inside the root folder
pub const DATABASE_FILE: &str = "cap_engine.db";

/// Directory name used under the platform config/data dirs
const APP_DIR: &str = "cap-engine";

/// Contents of the optional TOML config file
#[derive(Debug, Clone, Default, Deserialize)]
pub struct TomlConfig {
    /// Root folder holding the database
    pub root_folder: Option<PathBuf>,
    /// Default tracing filter when RUST_LOG is unset
    pub log_level: Option<String>,
    /// Admin HTTP bind address
    pub bind_addr: Option<String>,
}

impl TomlConfig {
    /// Parse a TOML config file
    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        toml::from_str(&content)
            .map_err(|e| Error::Config(format!("Invalid config file {}: {}", path.display(), e)))
    }

    /// Load the platform config file, or defaults when it is missing or malformed
    ///
    /// A missing config file is not an error.
    pub fn load_or_default() -> Self {
        match config_file_path() {
            Ok(path) => match Self::from_file(&path) {
                Ok(config) => {
                    debug!("Loaded config file: {}", path.display());
                    config
                }
                Err(e) => {
                    warn!("Ignoring config file: {}", e);
                    Self::default()
                }
            },
            Err(_) => Self::default(),
        }
    }
}

/// Resolve the root folder
pub fn resolve_root_folder(
    cli_arg: Option<&Path>,
    env_var_name: &str,
    toml_config: &TomlConfig,
) -> PathBuf {
    // Priority 1: Command-line argument
    if let Some(path) = cli_arg {
        return path.to_path_buf();
    }

    // Priority 2: Environment variable
    if let Ok(path) = std::env::var(env_var_name) {
        if !path.trim().is_empty() {
            return PathBuf::from(path);
        }
    }

    // Priority 3: TOML config file
    if let Some(root_folder) = &toml_config.root_folder {
        return root_folder.clone();
    }

    // Priority 4: OS-dependent compiled default
    default_root_folder()
}

/// Create the root folder if missing and return the database path inside it
pub fn prepare_root_folder(root_folder: &Path) -> Result<PathBuf> {
    std::fs::create_dir_all(root_folder)?;
    Ok(root_folder.join(DATABASE_FILE))
}

/// Get default configuration file path for the platform
fn config_file_path() -> Result<PathBuf> {
    let user_config = dirs::config_dir().map(|d| d.join(APP_DIR).join("config.toml"));
    if let Some(path) = user_config {
        if path.exists() {
            return Ok(path);
        }
    }

    if cfg!(target_os = "linux") {
        let system_config = PathBuf::from("/etc").join(APP_DIR).join("config.toml");
        if system_config.exists() {
            return Ok(system_config);
        }
    }

    Err(Error::Config("No config file found".to_string()))
}

/// Get OS-dependent default root folder path
pub fn default_root_folder() -> PathBuf {
    dirs::data_local_dir()
        .map(|d| d.join(APP_DIR))
        .unwrap_or_else(|| PathBuf::from("./cap_engine_data"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cli_argument_wins() {
        let toml_config = TomlConfig {
            root_folder: Some(PathBuf::from("/from/toml")),
            ..Default::default()
        };
        let resolved = resolve_root_folder(
            Some(Path::new("/from/cli")),
            "CAP_TEST_UNSET_VARIABLE_CLI",
            &toml_config,
        );
        assert_eq!(resolved, PathBuf::from("/from/cli"));
    }

    #[test]
    fn test_toml_used_when_no_cli_or_env() {
        let toml_config = TomlConfig {
            root_folder: Some(PathBuf::from("/from/toml")),
            ..Default::default()
        };
        let resolved = resolve_root_folder(None, "CAP_TEST_UNSET_VARIABLE_TOML", &toml_config);
        assert_eq!(resolved, PathBuf::from("/from/toml"));
    }

    #[test]
    fn test_falls_back_to_default() {
        let resolved = resolve_root_folder(
            None,
            "CAP_TEST_UNSET_VARIABLE_DEFAULT",
            &TomlConfig::default(),
        );
        assert_eq!(resolved, default_root_folder());
    }

    #[test]
    fn test_toml_parsing() {
        let config: TomlConfig = toml::from_str(
            r#"
            root_folder = "/srv/cap"
            log_level = "debug"
            "#,
        )
        .unwrap();
        assert_eq!(config.root_folder, Some(PathBuf::from("/srv/cap")));
        assert_eq!(config.log_level.as_deref(), Some("debug"));
        assert!(config.bind_addr.is_none());
    }
}
