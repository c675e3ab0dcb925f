// Configuration loading tests

mod common;
use common::setup_logging;

use chatsync::config::{self, SyncConfig, PAGE_SIZE_ENV};

#[test]
fn test_path_override_and_env_page_size() {
    setup_logging();
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("chatsync.json");

    let mut saved = SyncConfig::default();
    saved.typing_timeout_ms = 1500;
    saved.page_size = 30;
    config::save_config_to(&saved, &path).unwrap();
    config::set_config_path_override(path.clone());

    std::env::set_var(PAGE_SIZE_ENV, "12");
    let loaded = config::load_config().unwrap();
    assert_eq!(loaded.page_size, 12);
    assert_eq!(loaded.typing_timeout_ms, 1500);

    // Invalid values are ignored
    std::env::set_var(PAGE_SIZE_ENV, "zero");
    assert_eq!(config::load_config().unwrap().page_size, 30);
    std::env::remove_var(PAGE_SIZE_ENV);
}

#[test]
fn test_malformed_file_is_an_error() {
    setup_logging();
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("broken.json");
    std::fs::write(&path, "{ not json").unwrap();

    assert!(config::load_config_from(&path).is_err());
}
