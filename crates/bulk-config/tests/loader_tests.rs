//! Config loader tests: file discovery and environment overrides

use bulk_config::{AppConfig, ConfigError, ConfigLoader};
use std::io::Write;
use tempfile::NamedTempFile;

fn write_config(content: &str) -> NamedTempFile {
    let mut file = NamedTempFile::new().unwrap();
    file.write_all(content.as_bytes()).unwrap();
    file
}

const NO_ENV: [(&str, &str); 0] = [];

#[test]
fn test_load_from_explicit_path() {
    let file = write_config(
        r#"
[smpp]
endpoints = ["10.0.0.1:5001", "10.0.0.2:5001"]
system_id = "lbtest"
password = "123456"

[workers]
count = 4

[batch]
size = 20
tps = 200
"#,
    );

    let config = ConfigLoader::with_path(file.path()).with_env(NO_ENV).load().unwrap();

    assert_eq!(config.smpp.endpoints, vec!["10.0.0.1:5001", "10.0.0.2:5001"]);
    assert_eq!(config.smpp.system_id, "lbtest");
    assert_eq!(config.workers.count, 4);
    assert_eq!(config.batch.size, 20);
    assert_eq!(config.batch.tps, 200);
    // untouched sections keep defaults
    assert_eq!(config.workers.shutdown_timeout_ms, 5000);
    config.validate().unwrap();
}

#[test]
fn test_env_overrides_file() {
    let file = write_config("[workers]\ncount = 4\n[batch]\ntps = 100\n");

    let config = ConfigLoader::with_path(file.path())
        .with_env([
            ("BULK_SMS_WORKERS_COUNT", "8"),
            ("BULK_SMS_BATCH_TPS", "250"),
            ("BULK_SMS_SMPP_ENDPOINTS", "10.0.0.1:5001, 10.0.0.2:5001,"),
            ("BULK_SMS_SMPP_SYSTEM_ID", "override"),
        ])
        .load()
        .unwrap();

    assert_eq!(config.workers.count, 8);
    assert_eq!(config.batch.tps, 250);
    assert_eq!(config.smpp.endpoints, vec!["10.0.0.1:5001", "10.0.0.2:5001"]);
    assert_eq!(config.smpp.system_id, "override");
}

#[test]
fn test_unparsable_env_override_is_ignored() {
    let file = write_config("[workers]\ncount = 4\n");

    let config = ConfigLoader::with_path(file.path())
        .with_env([("BULK_SMS_WORKERS_COUNT", "many")])
        .load()
        .unwrap();

    assert_eq!(config.workers.count, 4);
}

#[test]
fn test_config_path_from_env() {
    let file = write_config("[batch]\nsize = 99\n");
    let path = file.path().to_string_lossy().to_string();

    let config = ConfigLoader::new()
        .with_env([("BULK_SMS_CONFIG", path.as_str())])
        .load()
        .unwrap();

    assert_eq!(config.batch.size, 99);
}

#[test]
fn test_missing_explicit_path_is_error() {
    let dir = tempfile::tempdir().unwrap();
    let result = ConfigLoader::with_path(dir.path().join("absent.toml"))
        .with_env(NO_ENV)
        .load();

    assert!(matches!(result, Err(ConfigError::ReadError(_))));
}

#[test]
fn test_invalid_toml_is_parse_error() {
    let file = write_config("[workers\ncount = ");
    let result = AppConfig::from_file(file.path());
    assert!(matches!(result, Err(ConfigError::ParseError(_))));
}
