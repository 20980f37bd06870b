//! Exercises `AppConfig::load` against a real file on disk plus the
//! bare-env-var override contract, rather than constructing `AppConfig`
//! values in memory.

use std::fs;
use std::sync::Mutex;

use oipd::config::AppConfig;
use tempfile::TempDir;

/// `AppConfig::load` reads process-wide environment state, so tests that
/// touch it within this file must not run concurrently with each other.
static ENV_LOCK: Mutex<()> = Mutex::new(());

fn write_config(dir: &TempDir, contents: &str) -> String {
    let path = dir.path().join("config.toml");
    fs::write(&path, contents).unwrap();
    path.to_string_lossy().into_owned()
}

#[test]
fn loads_values_from_file() {
    let _guard = ENV_LOCK.lock().unwrap();
    let dir = TempDir::new().unwrap();
    let path = write_config(
        &dir,
        r#"
            [elasticsearch]
            host = "http://es.internal:9200"

            [gun]
            peers = ["wss://peer-a.example"]

            [resolver]
            resolve_depth_max = 5
        "#,
    );

    std::env::set_var("OIPD_CONFIG", &path);
    for var in [
        "ELASTICSEARCH_HOST",
        "GUN_PEERS",
        "ARWEAVE_GATEWAY_PRIMARY",
        "ARWEAVE_GATEWAY_FALLBACK",
        "RESOLVE_DEPTH_MAX",
        "CACHE_MAX_ENTRIES",
        "CACHE_TTL_MS",
        "JWT_SECRET",
        "PUBLIC_API_BASE_URL",
    ] {
        std::env::remove_var(var);
    }

    let config = AppConfig::load().unwrap();
    std::env::remove_var("OIPD_CONFIG");

    assert_eq!(config.elasticsearch.host, "http://es.internal:9200");
    assert_eq!(config.gun.peers, vec!["wss://peer-a.example".to_string()]);
    assert_eq!(config.resolver.resolve_depth_max, 5);
    // Untouched sections still carry their defaults.
    assert_eq!(config.server.port, 3000);
}

#[test]
fn bare_env_vars_win_over_file_and_prefixed_env() {
    let _guard = ENV_LOCK.lock().unwrap();
    let dir = TempDir::new().unwrap();
    let path = write_config(
        &dir,
        r#"
            [elasticsearch]
            host = "http://from-file:9200"
        "#,
    );

    std::env::set_var("OIPD_CONFIG", &path);
    std::env::set_var("OIPD_ELASTICSEARCH_HOST", "http://from-prefixed-env:9200");
    std::env::set_var("ELASTICSEARCH_HOST", "http://from-bare-env:9200");
    std::env::set_var("GUN_PEERS", " wss://a.example, wss://b.example ,,");

    let config = AppConfig::load().unwrap();

    std::env::remove_var("OIPD_CONFIG");
    std::env::remove_var("OIPD_ELASTICSEARCH_HOST");
    std::env::remove_var("ELASTICSEARCH_HOST");
    std::env::remove_var("GUN_PEERS");

    assert_eq!(config.elasticsearch.host, "http://from-bare-env:9200");
    assert_eq!(
        config.gun.peers,
        vec!["wss://a.example".to_string(), "wss://b.example".to_string()]
    );
}

#[test]
fn missing_file_falls_back_to_defaults() {
    let _guard = ENV_LOCK.lock().unwrap();
    let dir = TempDir::new().unwrap();
    let missing_path = dir.path().join("does-not-exist.toml");

    std::env::set_var("OIPD_CONFIG", missing_path.to_string_lossy().as_ref());
    for var in [
        "ELASTICSEARCH_HOST",
        "GUN_PEERS",
        "ARWEAVE_GATEWAY_PRIMARY",
        "ARWEAVE_GATEWAY_FALLBACK",
        "RESOLVE_DEPTH_MAX",
        "CACHE_MAX_ENTRIES",
        "CACHE_TTL_MS",
        "JWT_SECRET",
        "PUBLIC_API_BASE_URL",
    ] {
        std::env::remove_var(var);
    }

    let config = AppConfig::load().unwrap();
    std::env::remove_var("OIPD_CONFIG");

    assert_eq!(config.elasticsearch.host, "http://localhost:9200");
    assert_eq!(config.resolver.resolve_depth_max, 3);
}
