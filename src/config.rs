use std::net::IpAddr;
use std::path::Path;

use chrono::Duration;
use figment::{
    Figment,
    providers::{Env, Format, Serialized, Toml},
};
use serde::{Deserialize, Serialize};

/// Environment variable prefix, nested keys are separated with `__`
/// (e.g. `AUTHGUARD_RATE_LIMITS__DEBUG_BYPASS=true`).
pub const ENV_PREFIX: &str = "AUTHGUARD_";

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to load configuration: {0}")]
    Load(#[from] figment::Error),

    #[error("missing required OAuth configuration: {}", .0.join(", "))]
    MissingOAuthSettings(Vec<String>),

    #[error("Invalid configuration value for {key}: {reason}")]
    InvalidValue { key: String, reason: String },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum Environment {
    #[default]
    Development,
    Production,
}

impl Environment {
    pub fn as_str(&self) -> &'static str {
        match self {
            Environment::Development => "development",
            Environment::Production => "production",
        }
    }

    pub fn is_production(&self) -> bool {
        matches!(self, Environment::Production)
    }
}

/// Configuration for the authguard server
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct Config {
    pub environment: Environment,
    pub server: ServerConfig,
    pub csrf: CsrfConfig,
    pub rate_limits: RateLimitConfig,
    pub oauth: OAuthConfig,
    pub audit: AuditConfig,
    pub sweeper: SweeperConfig,
    pub store: StoreConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    /// Peers whose `X-Forwarded-For` / `X-Real-IP` headers are believed.
    /// Empty means the socket peer is always the caller.
    pub trusted_proxies: Vec<IpAddr>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 4000,
            trusted_proxies: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CsrfConfig {
    /// Methods that never carry a CSRF token
    pub ignore_methods: Vec<String>,
    pub header_name: String,
    pub body_field: String,
    /// Header token and body token must both be present and equal
    pub require_double_submit: bool,
    /// Upper bound on the age of a client-supplied token timestamp
    pub max_age_secs: i64,
    pub timestamp_header: String,
    pub session_cookie: String,
    pub session_ttl_secs: i64,
    /// Path prefix for token-authenticated API calls
    pub api_prefix: String,
}

impl Default for CsrfConfig {
    fn default() -> Self {
        Self {
            ignore_methods: vec!["GET".to_string(), "HEAD".to_string(), "OPTIONS".to_string()],
            header_name: "x-csrf-token".to_string(),
            body_field: "_csrf".to_string(),
            require_double_submit: true,
            max_age_secs: 3600,
            timestamp_header: "x-csrf-timestamp".to_string(),
            session_cookie: "sid".to_string(),
            session_ttl_secs: 86_400,
            api_prefix: "/api/".to_string(),
        }
    }
}

impl CsrfConfig {
    /// Stricter profile used for the enhanced CSRF guard
    pub fn enhanced() -> Self {
        Self {
            max_age_secs: 1800,
            ..Self::default()
        }
    }

    pub fn max_age(&self) -> Duration {
        Duration::seconds(self.max_age_secs)
    }

    pub fn session_ttl(&self) -> Duration {
        Duration::seconds(self.session_ttl_secs)
    }

    pub fn is_ignored_method(&self, method: &str) -> bool {
        self.ignore_methods
            .iter()
            .any(|m| m.eq_ignore_ascii_case(method))
    }
}

/// One fixed-window admission rule
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RateLimitRule {
    pub window_ms: u64,
    pub max: u32,
    pub message: String,
}

impl RateLimitRule {
    pub fn new(window_ms: u64, max: u32, message: impl Into<String>) -> Self {
        Self {
            window_ms,
            max,
            message: message.into(),
        }
    }

    pub fn window(&self) -> Duration {
        Duration::milliseconds(i64::try_from(self.window_ms).unwrap_or(i64::MAX))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RateLimitConfig {
    pub initiate: RateLimitRule,
    pub callback: RateLimitRule,
    pub refresh: RateLimitRule,
    /// Header that marks trusted internal traffic; honoured outside production only
    pub trusted_internal_header: Option<String>,
    pub debug_path_prefixes: Vec<String>,
    /// Disables every limiter. Must stay false in production.
    pub debug_bypass: bool,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            initiate: RateLimitRule::new(
                15 * 60 * 1000,
                10,
                "Too many OAuth initiation attempts, please try again later",
            ),
            callback: RateLimitRule::new(
                15 * 60 * 1000,
                20,
                "Too many OAuth callback attempts, please try again later",
            ),
            refresh: RateLimitRule::new(
                60 * 60 * 1000,
                30,
                "Too many token refresh attempts, please try again later",
            ),
            trusted_internal_header: None,
            debug_path_prefixes: vec!["/oauth/debug".to_string()],
            debug_bypass: false,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct OAuthConfig {
    pub allowed_platforms: Vec<String>,
    pub allowed_origins: Vec<String>,
    pub allowed_roles: Vec<String>,
    pub redirect_base_url: Option<String>,
    pub state_ttl_secs: i64,
}

impl Default for OAuthConfig {
    fn default() -> Self {
        Self {
            allowed_platforms: ["twitter", "linkedin", "facebook", "instagram"]
                .iter()
                .map(|p| p.to_string())
                .collect(),
            allowed_origins: Vec::new(),
            allowed_roles: ["owner", "admin", "editor"]
                .iter()
                .map(|r| r.to_string())
                .collect(),
            redirect_base_url: None,
            state_ttl_secs: 3600,
        }
    }
}

impl OAuthConfig {
    pub fn state_ttl(&self) -> Duration {
        Duration::seconds(self.state_ttl_secs)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AuditConfig {
    pub cache_ttl_secs: i64,
    pub retention_days: i64,
    /// Events waiting for the audit worker before new ones are dropped
    pub queue_capacity: usize,
}

impl Default for AuditConfig {
    fn default() -> Self {
        Self {
            cache_ttl_secs: 86_400,
            retention_days: 30,
            queue_capacity: 1024,
        }
    }
}

impl AuditConfig {
    pub fn cache_ttl(&self) -> Duration {
        Duration::seconds(self.cache_ttl_secs)
    }

    pub fn retention(&self) -> Duration {
        Duration::days(self.retention_days)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SweeperConfig {
    pub interval_secs: u64,
    pub batch_size: u32,
    pub max_batches_per_run: u32,
}

impl Default for SweeperConfig {
    fn default() -> Self {
        Self {
            interval_secs: 3600,
            batch_size: 1000,
            max_batches_per_run: 10,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum StoreBackend {
    #[default]
    Memory,
    Postgres,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    pub backend: StoreBackend,
    pub database_url: Option<String>,
    pub max_connections: u32,
    pub acquire_timeout_ms: u64,
    pub auto_migrate: bool,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            backend: StoreBackend::Memory,
            database_url: None,
            max_connections: 5,
            acquire_timeout_ms: 2000,
            auto_migrate: true,
        }
    }
}

impl Config {
    /// Layer defaults, an optional TOML file and `AUTHGUARD_*` environment variables
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let mut figment = Figment::from(Serialized::defaults(Config::default()));
        if let Some(path) = path {
            figment = figment.merge(Toml::file(path));
        }
        let config = figment
            .merge(Env::prefixed(ENV_PREFIX).split("__"))
            .extract()?;
        Ok(config)
    }

    /// Check settings the server cannot run correctly without.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let mut missing = Vec::new();
        if self.oauth.allowed_platforms.is_empty() {
            missing.push("oauth.allowed_platforms".to_string());
        }
        if self
            .oauth
            .redirect_base_url
            .as_deref()
            .is_none_or(|url| url.trim().is_empty())
        {
            missing.push("oauth.redirect_base_url".to_string());
        }
        if !missing.is_empty() {
            return Err(ConfigError::MissingOAuthSettings(missing));
        }

        for (name, rule) in [
            ("initiate", &self.rate_limits.initiate),
            ("callback", &self.rate_limits.callback),
            ("refresh", &self.rate_limits.refresh),
        ] {
            if rule.window_ms == 0 || rule.max == 0 {
                return Err(ConfigError::InvalidValue {
                    key: format!("rate_limits.{}", name),
                    reason: "window_ms and max must be greater than zero".to_string(),
                });
            }
        }

        if self.store.backend == StoreBackend::Postgres && self.store.database_url.is_none() {
            return Err(ConfigError::InvalidValue {
                key: "store.database_url".to_string(),
                reason: "required for the postgres backend".to_string(),
            });
        }

        Ok(())
    }

    pub fn server_addr(&self) -> String {
        format!("{}:{}", self.server.host, self.server.port)
    }

    /// Config suitable for tests: loopback, chosen port, OAuth settings present
    pub fn test_config_with_port(port: u16) -> Self {
        let mut config = Self::default();
        config.server.host = "127.0.0.1".to_string();
        config.server.port = port;
        config.oauth.redirect_base_url = Some("http://127.0.0.1".to_string());
        config
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_documented_values() {
        let config = Config::default();
        assert_eq!(config.csrf.ignore_methods, vec!["GET", "HEAD", "OPTIONS"]);
        assert_eq!(config.csrf.body_field, "_csrf");
        assert!(config.csrf.require_double_submit);
        assert_eq!(config.csrf.max_age(), Duration::hours(1));
        assert_eq!(CsrfConfig::enhanced().max_age(), Duration::minutes(30));
        assert!(!config.rate_limits.debug_bypass);
        assert!(config.server.trusted_proxies.is_empty());
        assert_eq!(config.environment, Environment::Development);
    }

    #[test]
    fn ignored_methods_are_case_insensitive() {
        let csrf = CsrfConfig::default();
        assert!(csrf.is_ignored_method("get"));
        assert!(csrf.is_ignored_method("OPTIONS"));
        assert!(!csrf.is_ignored_method("POST"));
    }

    #[test]
    fn validate_reports_missing_oauth_settings() {
        let mut config = Config::default();
        config.oauth.allowed_platforms.clear();

        let err = config.validate().unwrap_err();
        match err {
            ConfigError::MissingOAuthSettings(missing) => {
                assert!(missing.contains(&"oauth.allowed_platforms".to_string()));
                assert!(missing.contains(&"oauth.redirect_base_url".to_string()));
            }
            other => panic!("unexpected error: {}", other),
        }
    }

    #[test]
    fn validate_rejects_zero_rate_limit() {
        let mut config = Config::test_config_with_port(0);
        config.rate_limits.refresh.max = 0;
        let err = config.validate().unwrap_err();
        assert_eq!(
            err.to_string(),
            "Invalid configuration value for rate_limits.refresh: window_ms and max must be greater than zero"
        );
    }

    #[test]
    fn validate_requires_database_url_for_postgres() {
        let mut config = Config::test_config_with_port(0);
        config.store.backend = StoreBackend::Postgres;
        assert!(config.validate().is_err());

        config.store.database_url = Some("postgres://localhost/authguard".to_string());
        assert!(config.validate().is_ok());
    }

    #[test]
    fn load_reads_toml_and_environment() {
        figment::Jail::expect_with(|jail| {
            jail.create_file(
                "authguard.toml",
                r#"
                environment = "production"

                [server]
                trusted_proxies = ["10.0.0.5", "::1"]

                [csrf]
                max_age_secs = 900

                [rate_limits.initiate]
                window_ms = 60000
                max = 5
                message = "slow down"
                "#,
            )?;
            jail.set_env("AUTHGUARD_RATE_LIMITS__DEBUG_BYPASS", "true");

            let config = Config::load(Some(Path::new("authguard.toml")))
                .map_err(|e| e.to_string())?;
            assert_eq!(config.environment, Environment::Production);
            assert_eq!(config.csrf.max_age_secs, 900);
            assert_eq!(config.rate_limits.initiate.max, 5);
            assert_eq!(config.rate_limits.initiate.window_ms, 60_000);
            assert!(config.rate_limits.debug_bypass);
            assert_eq!(
                config.server.trusted_proxies,
                vec![
                    "10.0.0.5".parse::<IpAddr>().unwrap(),
                    "::1".parse::<IpAddr>().unwrap()
                ]
            );
            // untouched sections keep their defaults
            assert_eq!(config.rate_limits.callback.max, 20);
            Ok(())
        });
    }
}
