use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::ServerError;

/// Full runtime configuration, loaded from `alyx.toml`.
///
/// Every key is overridable by environment variable
/// `ALYX_<SECTION>_<KEY>` (dots become underscores, uppercased):
/// `ALYX_SERVER_PORT=9000`, `ALYX_AUTH_JWT_SECRET=...`.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct AlyxConfig {
    pub server: ServerConfig,
    pub database: DatabaseConfig,
    pub auth: AuthConfig,
    pub functions: FunctionsConfig,
    pub realtime: RealtimeConfig,
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    pub cors: CorsConfig,
    /// Whole-request deadline in seconds.
    pub request_timeout: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 8090,
            cors: CorsConfig::default(),
            request_timeout: 30,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CorsConfig {
    pub enabled: bool,
    pub origins: Vec<String>,
    pub methods: Vec<String>,
    pub headers: Vec<String>,
    pub credentials: bool,
    pub max_age: u64,
}

impl Default for CorsConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            origins: vec!["*".to_string()],
            methods: vec![
                "GET".into(),
                "POST".into(),
                "PATCH".into(),
                "DELETE".into(),
                "OPTIONS".into(),
            ],
            headers: vec!["Authorization".into(), "Content-Type".into()],
            credentials: false,
            max_age: 3600,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DatabaseConfig {
    pub path: PathBuf,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("alyx.db"),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct AuthConfig {
    pub jwt: JwtConfig,
    pub password: PasswordConfig,
    /// Provider name to client credentials.
    pub oauth: BTreeMap<String, OAuthProviderConfig>,
    /// Endpoint name ("login", "register", ...) to per-IP
    /// requests-per-minute cap.
    pub rate_limit: BTreeMap<String, u32>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct JwtConfig {
    pub secret: String,
    /// Access-token lifetime in seconds.
    pub access_ttl: u64,
    /// Refresh-token lifetime in seconds.
    pub refresh_ttl: u64,
    pub issuer: String,
}

impl Default for JwtConfig {
    fn default() -> Self {
        Self {
            secret: String::new(),
            access_ttl: 900,
            refresh_ttl: 60 * 60 * 24 * 14,
            issuer: "alyx".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PasswordConfig {
    pub min_length: usize,
    pub require_uppercase: bool,
    pub require_number: bool,
}

impl Default for PasswordConfig {
    fn default() -> Self {
        Self {
            min_length: 8,
            require_uppercase: false,
            require_number: false,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct OAuthProviderConfig {
    pub client_id: String,
    pub client_secret: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FunctionsConfig {
    pub enabled: bool,
    /// Directory of function sources.
    pub dir: PathBuf,
    /// Default per-invocation timeout in milliseconds.
    pub timeout: u64,
    pub pool: PoolConfig,
    /// Days to keep terminal execution records.
    pub retention_days: u32,
}

impl Default for FunctionsConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            dir: PathBuf::from("functions"),
            timeout: 30_000,
            pool: PoolConfig::default(),
            retention_days: 30,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PoolConfig {
    pub min_warm: usize,
    pub max_instances: usize,
    /// Seconds a ready worker may idle before draining.
    pub idle_timeout: u64,
    /// Memory cap passed to the runtime command (MiB).
    pub memory_limit: u64,
    /// CPU share passed to the runtime command (millicores).
    pub cpu_limit: u64,
    /// Seconds a caller waits for a worker before `pool_exhausted`.
    pub acquire_timeout: u64,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            min_warm: 1,
            max_instances: 4,
            idle_timeout: 120,
            memory_limit: 256,
            cpu_limit: 1000,
            acquire_timeout: 10,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RealtimeConfig {
    pub enabled: bool,
    pub max_connections: usize,
    pub max_subscriptions_per_client: usize,
    /// Per-subscription delivery queue capacity.
    pub change_buffer_size: usize,
}

impl Default for RealtimeConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            max_connections: 1024,
            max_subscriptions_per_client: 32,
            change_buffer_size: 256,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// trace | debug | info | warn | error
    pub level: String,
    /// text | json
    pub format: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: "text".to_string(),
        }
    }
}

impl AlyxConfig {
    /// Loads `path` (if it exists) and applies environment overrides.
    pub fn load(path: Option<&Path>) -> Result<Self, ServerError> {
        let mut config = match path {
            Some(path) if path.exists() => {
                let text = std::fs::read_to_string(path).map_err(|e| {
                    ServerError::Config(format!("read {}: {e}", path.display()))
                })?;
                toml::from_str(&text)
                    .map_err(|e| ServerError::Config(format!("{}: {e}", path.display())))?
            }
            _ => Self::default(),
        };
        config.apply_env(&collect_alyx_env());
        Ok(config)
    }

    /// Applies `ALYX_*` overrides. Split out (and given the variables
    /// as input) so tests never touch the process environment.
    pub fn apply_env(&mut self, vars: &BTreeMap<String, String>) {
        for (key, value) in vars {
            match key.as_str() {
                "ALYX_SERVER_HOST" => self.server.host = value.clone(),
                "ALYX_SERVER_PORT" => {
                    if let Ok(port) = value.parse() {
                        self.server.port = port;
                    }
                }
                "ALYX_SERVER_REQUEST_TIMEOUT" => {
                    if let Ok(v) = value.parse() {
                        self.server.request_timeout = v;
                    }
                }
                "ALYX_SERVER_CORS_ENABLED" => {
                    self.server.cors.enabled = value == "true" || value == "1";
                }
                "ALYX_SERVER_CORS_ORIGINS" => {
                    self.server.cors.origins =
                        value.split(',').map(|s| s.trim().to_string()).collect();
                }
                "ALYX_DATABASE_PATH" => self.database.path = PathBuf::from(value),
                "ALYX_AUTH_JWT_SECRET" => self.auth.jwt.secret = value.clone(),
                "ALYX_AUTH_JWT_ACCESS_TTL" => {
                    if let Ok(v) = value.parse() {
                        self.auth.jwt.access_ttl = v;
                    }
                }
                "ALYX_AUTH_JWT_REFRESH_TTL" => {
                    if let Ok(v) = value.parse() {
                        self.auth.jwt.refresh_ttl = v;
                    }
                }
                "ALYX_AUTH_JWT_ISSUER" => self.auth.jwt.issuer = value.clone(),
                "ALYX_AUTH_PASSWORD_MIN_LENGTH" => {
                    if let Ok(v) = value.parse() {
                        self.auth.password.min_length = v;
                    }
                }
                "ALYX_AUTH_PASSWORD_REQUIRE_UPPERCASE" => {
                    self.auth.password.require_uppercase = value == "true" || value == "1";
                }
                "ALYX_AUTH_PASSWORD_REQUIRE_NUMBER" => {
                    self.auth.password.require_number = value == "true" || value == "1";
                }
                "ALYX_FUNCTIONS_ENABLED" => {
                    self.functions.enabled = value == "true" || value == "1";
                }
                "ALYX_FUNCTIONS_DIR" => self.functions.dir = PathBuf::from(value),
                "ALYX_FUNCTIONS_TIMEOUT" => {
                    if let Ok(v) = value.parse() {
                        self.functions.timeout = v;
                    }
                }
                "ALYX_FUNCTIONS_POOL_MIN_WARM" => {
                    if let Ok(v) = value.parse() {
                        self.functions.pool.min_warm = v;
                    }
                }
                "ALYX_FUNCTIONS_POOL_MAX_INSTANCES" => {
                    if let Ok(v) = value.parse() {
                        self.functions.pool.max_instances = v;
                    }
                }
                "ALYX_FUNCTIONS_POOL_IDLE_TIMEOUT" => {
                    if let Ok(v) = value.parse() {
                        self.functions.pool.idle_timeout = v;
                    }
                }
                "ALYX_REALTIME_ENABLED" => {
                    self.realtime.enabled = value == "true" || value == "1";
                }
                "ALYX_REALTIME_MAX_CONNECTIONS" => {
                    if let Ok(v) = value.parse() {
                        self.realtime.max_connections = v;
                    }
                }
                "ALYX_REALTIME_MAX_SUBSCRIPTIONS_PER_CLIENT" => {
                    if let Ok(v) = value.parse() {
                        self.realtime.max_subscriptions_per_client = v;
                    }
                }
                "ALYX_REALTIME_CHANGE_BUFFER_SIZE" => {
                    if let Ok(v) = value.parse() {
                        self.realtime.change_buffer_size = v;
                    }
                }
                "ALYX_LOGGING_LEVEL" => self.logging.level = value.clone(),
                "ALYX_LOGGING_FORMAT" => self.logging.format = value.clone(),
                other => {
                    // Provider credentials arrive as
                    // ALYX_AUTH_OAUTH_<PROVIDER>_CLIENT_ID / _CLIENT_SECRET.
                    if let Some(rest) = other.strip_prefix("ALYX_AUTH_OAUTH_") {
                        if let Some(provider) = rest.strip_suffix("_CLIENT_ID") {
                            self.auth
                                .oauth
                                .entry(provider.to_lowercase())
                                .or_default()
                                .client_id = value.clone();
                        } else if let Some(provider) = rest.strip_suffix("_CLIENT_SECRET") {
                            self.auth
                                .oauth
                                .entry(provider.to_lowercase())
                                .or_default()
                                .client_secret = value.clone();
                        }
                    } else if let Some(endpoint) = other.strip_prefix("ALYX_AUTH_RATE_LIMIT_") {
                        if let Ok(v) = value.parse() {
                            self.auth
                                .rate_limit
                                .insert(endpoint.to_lowercase(), v);
                        }
                    }
                }
            }
        }
    }

    /// The socket address to bind.
    pub fn bind_addr(&self) -> String {
        format!("{}:{}", self.server.host, self.server.port)
    }
}

fn collect_alyx_env() -> BTreeMap<String, String> {
    std::env::vars()
        .filter(|(k, _)| k.starts_with("ALYX_"))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_sane() {
        let config = AlyxConfig::default();
        assert_eq!(config.server.port, 8090);
        assert_eq!(config.realtime.change_buffer_size, 256);
        assert_eq!(config.functions.pool.min_warm, 1);
        assert_eq!(config.auth.password.min_length, 8);
    }

    #[test]
    fn toml_parse_partial_document() {
        let config: AlyxConfig = toml::from_str(
            r#"
            [server]
            port = 9000

            [auth.jwt]
            secret = "s3cret"

            [auth.rate_limit]
            login = 10
            "#,
        )
        .unwrap();
        assert_eq!(config.server.port, 9000);
        assert_eq!(config.auth.jwt.secret, "s3cret");
        assert_eq!(config.auth.rate_limit.get("login"), Some(&10));
        // Untouched sections keep defaults.
        assert_eq!(config.server.host, "127.0.0.1");
    }

    #[test]
    fn env_overrides_dotted_keys() {
        let mut config = AlyxConfig::default();
        let vars = BTreeMap::from([
            ("ALYX_SERVER_PORT".to_string(), "9999".to_string()),
            ("ALYX_AUTH_JWT_SECRET".to_string(), "from-env".to_string()),
            ("ALYX_LOGGING_FORMAT".to_string(), "json".to_string()),
            (
                "ALYX_SERVER_CORS_ORIGINS".to_string(),
                "https://a.com, https://b.com".to_string(),
            ),
        ]);
        config.apply_env(&vars);
        assert_eq!(config.server.port, 9999);
        assert_eq!(config.auth.jwt.secret, "from-env");
        assert_eq!(config.logging.format, "json");
        assert_eq!(
            config.server.cors.origins,
            vec!["https://a.com", "https://b.com"]
        );
    }

    #[test]
    fn env_oauth_provider_credentials() {
        let mut config = AlyxConfig::default();
        let vars = BTreeMap::from([
            (
                "ALYX_AUTH_OAUTH_GITHUB_CLIENT_ID".to_string(),
                "abc".to_string(),
            ),
            (
                "ALYX_AUTH_OAUTH_GITHUB_CLIENT_SECRET".to_string(),
                "xyz".to_string(),
            ),
        ]);
        config.apply_env(&vars);
        let github = config.auth.oauth.get("github").unwrap();
        assert_eq!(github.client_id, "abc");
        assert_eq!(github.client_secret, "xyz");
    }

    #[test]
    fn env_rate_limit_per_endpoint() {
        let mut config = AlyxConfig::default();
        let vars = BTreeMap::from([(
            "ALYX_AUTH_RATE_LIMIT_LOGIN".to_string(),
            "5".to_string(),
        )]);
        config.apply_env(&vars);
        assert_eq!(config.auth.rate_limit.get("login"), Some(&5));
    }

    #[test]
    fn invalid_numeric_override_ignored() {
        let mut config = AlyxConfig::default();
        let vars = BTreeMap::from([("ALYX_SERVER_PORT".to_string(), "not-a-port".to_string())]);
        config.apply_env(&vars);
        assert_eq!(config.server.port, 8090);
    }
}
