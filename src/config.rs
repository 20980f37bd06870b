use std::env;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::Deserialize;

const DEFAULT_CACHE_MAX_ENTRIES: u64 = 10_000;
const DEFAULT_CACHE_TTL_MS: u64 = 3_600_000; // 1 hour
const DEFAULT_RESOLVE_DEPTH_MAX: u32 = 3;

/// Top-level application configuration loaded from file + environment.
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct AppConfig {
    pub server: ServerConfig,
    pub elasticsearch: ElasticsearchSection,
    pub arweave: ArweaveSection,
    pub gun: GunSection,
    pub resolver: ResolverSection,
    pub logging: LoggingSection,
    pub auth: AuthSection,
    pub admin: AdminSection,
}

impl AppConfig {
    /// Load configuration from disk and environment.
    pub fn load() -> Result<Self> {
        let config_path = env::var("OIPD_CONFIG").unwrap_or_else(|_| "config.toml".to_string());

        let mut builder = config::Config::builder();

        if Path::new(&config_path).exists() {
            builder = builder.add_source(config::File::from(PathBuf::from(&config_path)));
        }

        builder = builder.add_source(
            config::Environment::with_prefix("OIPD")
                .separator("_")
                .try_parsing(true),
        );

        let settings = builder.build()?;
        let mut config: Self = settings.try_deserialize()?;

        // Bare (unprefixed) environment variables named directly by the
        // operator-facing contract; these win over both the config file
        // and the OIPD_-prefixed form.
        if let Ok(host) = env::var("ELASTICSEARCH_HOST") {
            config.elasticsearch.host = host;
        }
        if let Ok(peers) = env::var("GUN_PEERS") {
            config.gun.peers = peers
                .split(',')
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(str::to_string)
                .collect();
        }
        if let Ok(primary) = env::var("ARWEAVE_GATEWAY_PRIMARY") {
            config.arweave.gateway_primary = primary;
        }
        if let Ok(fallback) = env::var("ARWEAVE_GATEWAY_FALLBACK") {
            config.arweave.gateway_fallback = Some(fallback);
        }
        if let Ok(depth) = env::var("RESOLVE_DEPTH_MAX") {
            config.resolver.resolve_depth_max =
                depth.parse().context("invalid RESOLVE_DEPTH_MAX")?;
        }
        if let Ok(entries) = env::var("CACHE_MAX_ENTRIES") {
            config.resolver.cache_max_entries =
                entries.parse().context("invalid CACHE_MAX_ENTRIES")?;
        }
        if let Ok(ttl) = env::var("CACHE_TTL_MS") {
            config.resolver.cache_ttl_ms = ttl.parse().context("invalid CACHE_TTL_MS")?;
        }
        if let Ok(secret) = env::var("JWT_SECRET") {
            config.auth.jwt_secret = secret;
        }
        if let Ok(base_url) = env::var("PUBLIC_API_BASE_URL") {
            config.admin.public_api_base_url = Some(base_url);
        }

        if config.logging.level.trim().is_empty() {
            config.logging.level = "info".to_string();
        }

        Ok(config)
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 3000,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ElasticsearchSection {
    pub host: String,
    pub records_index: String,
    pub templates_index: String,
    pub singletons_index: String,
}

impl Default for ElasticsearchSection {
    fn default() -> Self {
        Self {
            host: "http://localhost:9200".to_string(),
            records_index: "oip-records".to_string(),
            templates_index: "oip-templates".to_string(),
            singletons_index: "oip-singletons".to_string(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ArweaveSection {
    pub gateway_primary: String,
    pub gateway_fallback: Option<String>,
    pub poll_interval_secs: u64,
    pub max_in_flight_fetches: usize,
}

impl Default for ArweaveSection {
    fn default() -> Self {
        Self {
            gateway_primary: "https://arweave.net".to_string(),
            gateway_fallback: Some("https://arweave.dev".to_string()),
            poll_interval_secs: 30,
            max_in_flight_fetches: 8,
        }
    }
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct GunSection {
    /// Operator-configured peer whitelist. The daemon never discovers
    /// peers outside this set (C7).
    pub peers: Vec<String>,
    pub poll_interval_secs: Option<u64>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ResolverSection {
    pub resolve_depth_max: u32,
    pub resolve_depth_default: u32,
    pub cache_max_entries: u64,
    pub cache_ttl_ms: u64,
    pub not_found_cache_max_entries: u64,
    pub not_found_cache_ttl_ms: u64,
}

impl Default for ResolverSection {
    fn default() -> Self {
        Self {
            resolve_depth_max: DEFAULT_RESOLVE_DEPTH_MAX,
            resolve_depth_default: 0,
            cache_max_entries: DEFAULT_CACHE_MAX_ENTRIES,
            cache_ttl_ms: DEFAULT_CACHE_TTL_MS,
            not_found_cache_max_entries: 10_000,
            not_found_cache_ttl_ms: DEFAULT_CACHE_TTL_MS,
        }
    }
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct LoggingSection {
    pub level: String,
    pub format: LogFormat,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Json,
    Text,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct AuthSection {
    pub jwt_secret: String,
    /// Hex-encoded secp256k1 secret key the daemon signs with when a
    /// `POST /records` caller doesn't present its own `creator_signature`.
    pub node_wallet_private_key_hex: Option<String>,
}

impl Default for AuthSection {
    fn default() -> Self {
        Self {
            jwt_secret: "development-secret-change-me".to_string(),
            node_wallet_private_key_hex: None,
        }
    }
}

/// Admin-domain deletion override configuration (see `ownership::is_admin_override`).
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct AdminSection {
    pub base_domain: Option<String>,
    pub public_api_base_url: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_spec_constants() {
        let cfg = AppConfig::default();
        assert_eq!(cfg.resolver.resolve_depth_max, 3);
        assert_eq!(cfg.resolver.cache_max_entries, 10_000);
        assert_eq!(cfg.resolver.cache_ttl_ms, 3_600_000);
        assert_eq!(cfg.resolver.not_found_cache_max_entries, 10_000);
    }

    #[test]
    fn gun_peers_parse_from_env_csv() {
        let peers: Vec<String> = "wss://a.example,  wss://b.example ,,"
            .split(',')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(str::to_string)
            .collect();
        assert_eq!(peers, vec!["wss://a.example", "wss://b.example"]);
    }
}
