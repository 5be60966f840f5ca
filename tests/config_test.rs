use std::path::PathBuf;

use ce_queue::config::Config;

const VARS: [&str; 5] = [
    "CEQ_DATABASE_PATH",
    "CEQ_MAX_EXECUTION_COUNT",
    "CEQ_SWEEP_INTERVAL_SECS",
    "OTEL_ENDPOINT",
    "LOG_LEVEL",
];

fn clear_env() {
    unsafe {
        for var in VARS {
            std::env::remove_var(var);
        }
    }
}

// Environment variables are process-wide, so every env scenario runs in one
// test to avoid races between test threads.
#[test]
fn config_from_env() {
    clear_env();
    let err = Config::from_env().unwrap_err();
    assert!(err.to_string().contains("CEQ_DATABASE_PATH"));

    unsafe {
        std::env::set_var("CEQ_DATABASE_PATH", "/var/lib/ceq/queue.db");
    }
    let config = Config::from_env().unwrap();
    assert_eq!(config.database_path, PathBuf::from("/var/lib/ceq/queue.db"));
    assert_eq!(config.max_execution_count, 2);
    assert_eq!(config.sweep_interval_secs, 60);
    assert_eq!(config.log_level, "info");
    assert!(config.otel_endpoint.is_none());

    unsafe {
        std::env::set_var("CEQ_MAX_EXECUTION_COUNT", "5");
        std::env::set_var("CEQ_SWEEP_INTERVAL_SECS", "10");
        std::env::set_var("OTEL_ENDPOINT", "http://localhost:4317");
        std::env::set_var("LOG_LEVEL", "debug");
    }
    let config = Config::from_env().unwrap();
    assert_eq!(config.queue_settings().max_execution_count, 5);
    assert_eq!(config.sweep_interval(), std::time::Duration::from_secs(10));
    assert_eq!(config.otel_endpoint.as_deref(), Some("http://localhost:4317"));
    assert_eq!(config.log_level, "debug");

    unsafe {
        std::env::set_var("CEQ_MAX_EXECUTION_COUNT", "many");
    }
    let err = Config::from_env().unwrap_err();
    assert!(err.to_string().contains("CEQ_MAX_EXECUTION_COUNT"));

    unsafe {
        std::env::set_var("CEQ_MAX_EXECUTION_COUNT", "0");
    }
    assert!(Config::from_env().is_err());

    clear_env();
}

#[test]
fn config_from_toml_applies_defaults() {
    let config = Config::from_toml(r#"database_path = "queue.db""#).unwrap();
    assert_eq!(config.database_path, PathBuf::from("queue.db"));
    assert_eq!(config.max_execution_count, 2);
    assert_eq!(config.sweep_interval_secs, 60);
    assert_eq!(config.log_level, "info");
}

#[test]
fn config_from_toml_reads_every_key() {
    let config = Config::from_toml(
        r#"
        database_path = "/data/ce.db"
        max_execution_count = 3
        sweep_interval_secs = 30
        otel_endpoint = "http://collector:4317"
        log_level = "ce_queue=debug"
        "#,
    )
    .unwrap();
    assert_eq!(config.max_execution_count, 3);
    assert_eq!(config.sweep_interval_secs, 30);
    assert_eq!(config.otel_endpoint.as_deref(), Some("http://collector:4317"));
    assert_eq!(config.log_level, "ce_queue=debug");
}

#[test]
fn config_from_toml_rejects_missing_database_and_zero_interval() {
    assert!(Config::from_toml("max_execution_count = 2").is_err());
    assert!(
        Config::from_toml(
            r#"
            database_path = "queue.db"
            sweep_interval_secs = 0
            "#
        )
        .is_err()
    );
}

#[test]
fn config_from_missing_file_names_the_path() {
    let err = Config::from_file(std::path::Path::new("/nonexistent/ceq.toml")).unwrap_err();
    assert!(err.to_string().contains("/nonexistent/ceq.toml"));
}
