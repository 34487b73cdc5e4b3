//! Tests for root folder resolution and the TOML config file
//!
//! Tests that manipulate CAP_ROOT_FOLDER are marked #[serial] so they do not
//! race on the process environment.

use cap_common::config::{
    default_root_folder, prepare_root_folder, resolve_root_folder, TomlConfig, DATABASE_FILE,
    ROOT_FOLDER_ENV,
};
use serial_test::serial;
use std::env;
use std::path::{Path, PathBuf};

#[test]
#[serial]
fn test_env_var_beats_toml() {
    env::set_var(ROOT_FOLDER_ENV, "/tmp/cap-test-env-folder");
    let toml_config = TomlConfig {
        root_folder: Some(PathBuf::from("/tmp/cap-test-toml-folder")),
        ..Default::default()
    };

    let resolved = resolve_root_folder(None, ROOT_FOLDER_ENV, &toml_config);
    env::remove_var(ROOT_FOLDER_ENV);

    assert_eq!(resolved, PathBuf::from("/tmp/cap-test-env-folder"));
}

#[test]
#[serial]
fn test_cli_beats_env_var() {
    env::set_var(ROOT_FOLDER_ENV, "/tmp/cap-test-env-folder");

    let resolved = resolve_root_folder(
        Some(Path::new("/tmp/cap-test-cli-folder")),
        ROOT_FOLDER_ENV,
        &TomlConfig::default(),
    );
    env::remove_var(ROOT_FOLDER_ENV);

    assert_eq!(resolved, PathBuf::from("/tmp/cap-test-cli-folder"));
}

#[test]
#[serial]
fn test_empty_env_var_is_ignored() {
    env::set_var(ROOT_FOLDER_ENV, "  ");

    let resolved = resolve_root_folder(None, ROOT_FOLDER_ENV, &TomlConfig::default());
    env::remove_var(ROOT_FOLDER_ENV);

    assert_eq!(resolved, default_root_folder());
}

#[test]
fn test_config_file_round_trip() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("config.toml");
    std::fs::write(
        &path,
        "root_folder = \"/var/lib/cap\"\nbind_addr = \"0.0.0.0:5810\"\n",
    )
    .unwrap();

    let config = TomlConfig::from_file(&path).unwrap();
    assert_eq!(config.root_folder, Some(PathBuf::from("/var/lib/cap")));
    assert_eq!(config.bind_addr.as_deref(), Some("0.0.0.0:5810"));
}

#[test]
fn test_malformed_config_file_is_config_error() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("config.toml");
    std::fs::write(&path, "root_folder = [").unwrap();

    let err = TomlConfig::from_file(&path).unwrap_err();
    assert!(matches!(err, cap_common::Error::Config(_)));
}

#[test]
fn test_prepare_root_folder_creates_directory() {
    let dir = tempfile::tempdir().unwrap();
    let root = dir.path().join("a").join("b");

    let db_path = prepare_root_folder(&root).unwrap();
    assert!(root.is_dir());
    assert_eq!(db_path, root.join(DATABASE_FILE));
}
