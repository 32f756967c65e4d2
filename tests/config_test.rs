//! Tests for config loading

use std::io::Write;
use std::path::Path;
use std::time::Duration;

use resenha::config::Config;

#[test]
fn test_config_file_exists() {
    let config_path = Path::new("config.toml");
    assert!(
        config_path.exists(),
        "config.toml should exist in project root"
    );
}

#[test]
fn test_shipped_config_matches_defaults() {
    let config = Config::from_file(Path::new("config.toml")).unwrap();
    config.validate().unwrap();

    let defaults = Config::default();
    assert_eq!(config.queue.crawl_capacity, defaults.queue.crawl_capacity);
    assert_eq!(config.queue.resolve_queue, defaults.queue.resolve_queue);
    assert_eq!(config.identity.cooldown(), defaults.identity.cooldown());
    assert_eq!(config.pagination.page_ceiling_min, 70);
    assert_eq!(config.pagination.page_ceiling_max, 100);
    assert_eq!(config.quota.reset_day, 8);
    assert_eq!(config.quota.reset_hour, 17);
    assert_eq!(config.storage.checkpoint_ttl(), Duration::from_secs(7 * 86_400));
}

#[test]
fn test_file_with_single_section() {
    let mut file = tempfile::NamedTempFile::new().unwrap();
    writeln!(file, "[queue]\ncrawl_capacity = 1").unwrap();

    let config = Config::from_file(file.path()).unwrap();
    assert_eq!(config.queue.crawl_capacity, 1);
    assert_eq!(config.queue.resolve_capacity, 20);
    assert_eq!(config.identity.max_attempts, 5);
}

#[test]
fn test_invalid_reset_day_is_rejected() {
    let mut file = tempfile::NamedTempFile::new().unwrap();
    writeln!(file, "[quota]\nreset_day = 32").unwrap();

    let config = Config::from_file(file.path()).unwrap();
    assert!(config.validate().is_err());
}

#[test]
fn test_malformed_file_is_an_error() {
    let mut file = tempfile::NamedTempFile::new().unwrap();
    writeln!(file, "[queue\ncrawl_capacity = ").unwrap();

    let err = Config::from_file(file.path()).unwrap_err();
    assert!(format!("{err:#}").contains("Failed to parse TOML"));
}

#[test]
fn test_missing_file_is_an_error() {
    assert!(Config::from_file(Path::new("does-not-exist.toml")).is_err());
}
