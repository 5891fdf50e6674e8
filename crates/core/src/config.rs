use std::env;
use std::fs;
use std::path::{Path, PathBuf};

use secrecy::SecretString;
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Clone, Debug)]
pub struct AppConfig {
    pub database: DatabaseConfig,
    pub provider: ProviderConfig,
    pub sync: SyncConfig,
    pub server: ServerConfig,
    pub logging: LoggingConfig,
}

#[derive(Clone, Debug)]
pub struct DatabaseConfig {
    pub url: String,
    pub max_connections: u32,
    pub timeout_secs: u64,
}

/// Connection settings for the upstream voice/SMS provider.
///
/// Token lifecycle (refresh, rotation) is owned by the deployment; Threadline
/// only ever reads the current bearer token.
#[derive(Clone, Debug)]
pub struct ProviderConfig {
    pub base_url: String,
    pub api_token: SecretString,
    pub timeout_secs: u64,
}

#[derive(Clone, Debug)]
pub struct SyncConfig {
    /// Messages requested per page from the provider.
    pub page_size: u32,
    /// Per-message processing errors tolerated before a session fails.
    pub error_budget: u32,
    /// Fixed delay between page fetches, to stay under provider quotas.
    pub page_delay_ms: u64,
    /// Window within which identical phone/body/direction messages are
    /// treated as the same logical message.
    pub duplicate_window_hours: i64,
    /// How far back an `initial` sync reaches.
    pub max_history_days: i64,
    /// Lookback for an `incremental` sync with no completed predecessor.
    pub incremental_lookback_hours: i64,
    /// Threshold for fuzzy identity matches.
    pub min_match_confidence: f64,
    /// Platform label stamped on conversations created from this feed.
    pub default_platform: String,
}

#[derive(Clone, Debug)]
pub struct ServerConfig {
    pub bind_address: String,
    pub port: u16,
    pub graceful_shutdown_secs: u64,
}

#[derive(Clone, Debug)]
pub struct LoggingConfig {
    pub level: String,
    pub format: LogFormat,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogFormat {
    Compact,
    Pretty,
    Json,
}

#[derive(Clone, Debug, Default)]
pub struct ConfigOverrides {
    pub database_url: Option<String>,
    pub provider_base_url: Option<String>,
    pub provider_api_token: Option<String>,
    pub sync_page_size: Option<u32>,
    pub sync_error_budget: Option<u32>,
    pub log_level: Option<String>,
}

#[derive(Clone, Debug, Default)]
pub struct LoadOptions {
    pub config_path: Option<PathBuf>,
    pub require_file: bool,
    pub overrides: ConfigOverrides,
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("could not read config file `{path}`: {source}")]
    ReadFile { path: PathBuf, source: std::io::Error },
    #[error("could not parse config file `{path}`: {source}")]
    ParseFile { path: PathBuf, source: toml::de::Error },
    #[error("required config file was not found: `{0}`")]
    MissingConfigFile(PathBuf),
    #[error("environment variable interpolation failed for `{var}`")]
    MissingEnvInterpolation { var: String },
    #[error("unterminated environment interpolation expression")]
    UnterminatedInterpolation,
    #[error("invalid environment override for `{key}`: `{value}`")]
    InvalidEnvOverride { key: String, value: String },
    #[error("configuration validation failed: {0}")]
    Validation(String),
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            database: DatabaseConfig {
                url: "sqlite://threadline.db".to_string(),
                max_connections: 5,
                timeout_secs: 30,
            },
            provider: ProviderConfig {
                base_url: "https://api.example-telecom.test".to_string(),
                api_token: String::new().into(),
                timeout_secs: 30,
            },
            sync: SyncConfig {
                page_size: 50,
                error_budget: 5,
                page_delay_ms: 250,
                duplicate_window_hours: 24,
                max_history_days: 90,
                incremental_lookback_hours: 24,
                min_match_confidence: 0.8,
                default_platform: "sms".to_string(),
            },
            server: ServerConfig {
                bind_address: "127.0.0.1".to_string(),
                port: 8080,
                graceful_shutdown_secs: 15,
            },
            logging: LoggingConfig { level: "info".to_string(), format: LogFormat::Compact },
        }
    }
}

fn secret_value(value: String) -> SecretString {
    value.into()
}

impl std::str::FromStr for LogFormat {
    type Err = ConfigError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "compact" => Ok(Self::Compact),
            "pretty" => Ok(Self::Pretty),
            "json" => Ok(Self::Json),
            other => Err(ConfigError::Validation(format!(
                "unsupported log format `{other}` (expected compact|pretty|json)"
            ))),
        }
    }
}

#[derive(Debug, Default, Deserialize)]
struct ConfigPatch {
    database: Option<DatabasePatch>,
    provider: Option<ProviderPatch>,
    sync: Option<SyncPatch>,
    server: Option<ServerPatch>,
    logging: Option<LoggingPatch>,
}

#[derive(Debug, Default, Deserialize)]
struct DatabasePatch {
    url: Option<String>,
    max_connections: Option<u32>,
    timeout_secs: Option<u64>,
}

#[derive(Debug, Default, Deserialize)]
struct ProviderPatch {
    base_url: Option<String>,
    api_token: Option<String>,
    timeout_secs: Option<u64>,
}

#[derive(Debug, Default, Deserialize)]
struct SyncPatch {
    page_size: Option<u32>,
    error_budget: Option<u32>,
    page_delay_ms: Option<u64>,
    duplicate_window_hours: Option<i64>,
    max_history_days: Option<i64>,
    incremental_lookback_hours: Option<i64>,
    min_match_confidence: Option<f64>,
    default_platform: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct ServerPatch {
    bind_address: Option<String>,
    port: Option<u16>,
    graceful_shutdown_secs: Option<u64>,
}

#[derive(Debug, Default, Deserialize)]
struct LoggingPatch {
    level: Option<String>,
    format: Option<LogFormat>,
}

impl AppConfig {
    pub fn load(options: LoadOptions) -> Result<Self, ConfigError> {
        let mut config = Self::default();
        let maybe_path = resolve_config_path(options.config_path.as_deref());

        if let Some(path) = maybe_path {
            let patch = read_patch(&path)?;
            config.apply_patch(patch);
        } else if options.require_file {
            let expected = options.config_path.unwrap_or_else(|| PathBuf::from("threadline.toml"));
            return Err(ConfigError::MissingConfigFile(expected));
        }

        config.apply_env_overrides()?;
        config.apply_overrides(options.overrides);
        config.validate()?;

        Ok(config)
    }

    fn apply_patch(&mut self, patch: ConfigPatch) {
        if let Some(database) = patch.database {
            if let Some(url) = database.url {
                self.database.url = url;
            }
            if let Some(max_connections) = database.max_connections {
                self.database.max_connections = max_connections;
            }
            if let Some(timeout_secs) = database.timeout_secs {
                self.database.timeout_secs = timeout_secs;
            }
        }

        if let Some(provider) = patch.provider {
            if let Some(base_url) = provider.base_url {
                self.provider.base_url = base_url;
            }
            if let Some(api_token_value) = provider.api_token {
                self.provider.api_token = secret_value(api_token_value);
            }
            if let Some(timeout_secs) = provider.timeout_secs {
                self.provider.timeout_secs = timeout_secs;
            }
        }

        if let Some(sync) = patch.sync {
            if let Some(page_size) = sync.page_size {
                self.sync.page_size = page_size;
            }
            if let Some(error_budget) = sync.error_budget {
                self.sync.error_budget = error_budget;
            }
            if let Some(page_delay_ms) = sync.page_delay_ms {
                self.sync.page_delay_ms = page_delay_ms;
            }
            if let Some(duplicate_window_hours) = sync.duplicate_window_hours {
                self.sync.duplicate_window_hours = duplicate_window_hours;
            }
            if let Some(max_history_days) = sync.max_history_days {
                self.sync.max_history_days = max_history_days;
            }
            if let Some(incremental_lookback_hours) = sync.incremental_lookback_hours {
                self.sync.incremental_lookback_hours = incremental_lookback_hours;
            }
            if let Some(min_match_confidence) = sync.min_match_confidence {
                self.sync.min_match_confidence = min_match_confidence;
            }
            if let Some(default_platform) = sync.default_platform {
                self.sync.default_platform = default_platform;
            }
        }

        if let Some(server) = patch.server {
            if let Some(bind_address) = server.bind_address {
                self.server.bind_address = bind_address;
            }
            if let Some(port) = server.port {
                self.server.port = port;
            }
            if let Some(graceful_shutdown_secs) = server.graceful_shutdown_secs {
                self.server.graceful_shutdown_secs = graceful_shutdown_secs;
            }
        }

        if let Some(logging) = patch.logging {
            if let Some(level) = logging.level {
                self.logging.level = level;
            }
            if let Some(format) = logging.format {
                self.logging.format = format;
            }
        }
    }

    fn apply_env_overrides(&mut self) -> Result<(), ConfigError> {
        if let Some(value) = read_env("THREADLINE_DATABASE_URL") {
            self.database.url = value;
        }
        if let Some(value) = read_env("THREADLINE_DATABASE_MAX_CONNECTIONS") {
            self.database.max_connections =
                parse_u32("THREADLINE_DATABASE_MAX_CONNECTIONS", &value)?;
        }
        if let Some(value) = read_env("THREADLINE_DATABASE_TIMEOUT_SECS") {
            self.database.timeout_secs = parse_u64("THREADLINE_DATABASE_TIMEOUT_SECS", &value)?;
        }

        if let Some(value) = read_env("THREADLINE_PROVIDER_BASE_URL") {
            self.provider.base_url = value;
        }
        if let Some(value) = read_env("THREADLINE_PROVIDER_API_TOKEN") {
            self.provider.api_token = secret_value(value);
        }
        if let Some(value) = read_env("THREADLINE_PROVIDER_TIMEOUT_SECS") {
            self.provider.timeout_secs = parse_u64("THREADLINE_PROVIDER_TIMEOUT_SECS", &value)?;
        }

        if let Some(value) = read_env("THREADLINE_SYNC_PAGE_SIZE") {
            self.sync.page_size = parse_u32("THREADLINE_SYNC_PAGE_SIZE", &value)?;
        }
        if let Some(value) = read_env("THREADLINE_SYNC_ERROR_BUDGET") {
            self.sync.error_budget = parse_u32("THREADLINE_SYNC_ERROR_BUDGET", &value)?;
        }
        if let Some(value) = read_env("THREADLINE_SYNC_PAGE_DELAY_MS") {
            self.sync.page_delay_ms = parse_u64("THREADLINE_SYNC_PAGE_DELAY_MS", &value)?;
        }
        if let Some(value) = read_env("THREADLINE_SYNC_DUPLICATE_WINDOW_HOURS") {
            self.sync.duplicate_window_hours =
                parse_i64("THREADLINE_SYNC_DUPLICATE_WINDOW_HOURS", &value)?;
        }
        if let Some(value) = read_env("THREADLINE_SYNC_MAX_HISTORY_DAYS") {
            self.sync.max_history_days = parse_i64("THREADLINE_SYNC_MAX_HISTORY_DAYS", &value)?;
        }
        if let Some(value) = read_env("THREADLINE_SYNC_INCREMENTAL_LOOKBACK_HOURS") {
            self.sync.incremental_lookback_hours =
                parse_i64("THREADLINE_SYNC_INCREMENTAL_LOOKBACK_HOURS", &value)?;
        }
        if let Some(value) = read_env("THREADLINE_SYNC_MIN_MATCH_CONFIDENCE") {
            self.sync.min_match_confidence =
                parse_f64("THREADLINE_SYNC_MIN_MATCH_CONFIDENCE", &value)?;
        }
        if let Some(value) = read_env("THREADLINE_SYNC_DEFAULT_PLATFORM") {
            self.sync.default_platform = value;
        }

        if let Some(value) = read_env("THREADLINE_SERVER_BIND_ADDRESS") {
            self.server.bind_address = value;
        }
        if let Some(value) = read_env("THREADLINE_SERVER_PORT") {
            self.server.port = parse_u16("THREADLINE_SERVER_PORT", &value)?;
        }
        if let Some(value) = read_env("THREADLINE_SERVER_GRACEFUL_SHUTDOWN_SECS") {
            self.server.graceful_shutdown_secs =
                parse_u64("THREADLINE_SERVER_GRACEFUL_SHUTDOWN_SECS", &value)?;
        }

        let log_level =
            read_env("THREADLINE_LOGGING_LEVEL").or_else(|| read_env("THREADLINE_LOG_LEVEL"));
        if let Some(value) = log_level {
            self.logging.level = value;
        }
        let log_format =
            read_env("THREADLINE_LOGGING_FORMAT").or_else(|| read_env("THREADLINE_LOG_FORMAT"));
        if let Some(value) = log_format {
            self.logging.format = value.parse()?;
        }

        Ok(())
    }

    fn apply_overrides(&mut self, overrides: ConfigOverrides) {
        if let Some(database_url) = overrides.database_url {
            self.database.url = database_url;
        }
        if let Some(base_url) = overrides.provider_base_url {
            self.provider.base_url = base_url;
        }
        if let Some(api_token) = overrides.provider_api_token {
            self.provider.api_token = secret_value(api_token);
        }
        if let Some(page_size) = overrides.sync_page_size {
            self.sync.page_size = page_size;
        }
        if let Some(error_budget) = overrides.sync_error_budget {
            self.sync.error_budget = error_budget;
        }
        if let Some(log_level) = overrides.log_level {
            self.logging.level = log_level;
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        validate_database(&self.database)?;
        validate_provider(&self.provider)?;
        validate_sync(&self.sync)?;
        validate_server(&self.server)?;
        validate_logging(&self.logging)?;
        Ok(())
    }
}

fn resolve_config_path(explicit_path: Option<&Path>) -> Option<PathBuf> {
    if let Some(path) = explicit_path {
        return path.exists().then_some(path.to_path_buf());
    }

    [PathBuf::from("threadline.toml"), PathBuf::from("config/threadline.toml")]
        .into_iter()
        .find(|path| path.exists())
}

fn read_patch(path: &Path) -> Result<ConfigPatch, ConfigError> {
    let raw = fs::read_to_string(path)
        .map_err(|source| ConfigError::ReadFile { path: path.to_path_buf(), source })?;

    let interpolated = interpolate_env_vars(&raw)?;
    toml::from_str::<ConfigPatch>(&interpolated)
        .map_err(|source| ConfigError::ParseFile { path: path.to_path_buf(), source })
}

fn interpolate_env_vars(input: &str) -> Result<String, ConfigError> {
    let mut output = String::with_capacity(input.len());
    let mut chars = input.chars().peekable();

    while let Some(ch) = chars.next() {
        if ch == '$' && matches!(chars.peek(), Some('{')) {
            chars.next();
            let mut key = String::new();

            loop {
                match chars.next() {
                    Some('}') => break,
                    Some(next) => key.push(next),
                    None => return Err(ConfigError::UnterminatedInterpolation),
                }
            }

            let value = env::var(&key)
                .map_err(|_| ConfigError::MissingEnvInterpolation { var: key.clone() })?;
            output.push_str(&value);
            continue;
        }

        output.push(ch);
    }

    Ok(output)
}

fn validate_database(database: &DatabaseConfig) -> Result<(), ConfigError> {
    let url = database.url.trim();
    let sqlite_url =
        url.starts_with("sqlite://") || url.starts_with("sqlite::") || url == ":memory:";
    if !sqlite_url {
        return Err(ConfigError::Validation(
            "database.url must be a sqlite URL (`sqlite://...`, `sqlite::...`, or `:memory:`)"
                .to_string(),
        ));
    }

    if database.max_connections == 0 {
        return Err(ConfigError::Validation(
            "database.max_connections must be greater than zero".to_string(),
        ));
    }

    if database.timeout_secs == 0 || database.timeout_secs > 300 {
        return Err(ConfigError::Validation(
            "database.timeout_secs must be in range 1..=300".to_string(),
        ));
    }

    Ok(())
}

fn validate_provider(provider: &ProviderConfig) -> Result<(), ConfigError> {
    let base_url = provider.base_url.trim();
    if !(base_url.starts_with("http://") || base_url.starts_with("https://")) {
        return Err(ConfigError::Validation(
            "provider.base_url must start with http:// or https://".to_string(),
        ));
    }

    if provider.timeout_secs == 0 || provider.timeout_secs > 300 {
        return Err(ConfigError::Validation(
            "provider.timeout_secs must be in range 1..=300".to_string(),
        ));
    }

    Ok(())
}

fn validate_sync(sync: &SyncConfig) -> Result<(), ConfigError> {
    if sync.page_size == 0 || sync.page_size > 500 {
        return Err(ConfigError::Validation("sync.page_size must be in range 1..=500".to_string()));
    }

    if sync.duplicate_window_hours <= 0 {
        return Err(ConfigError::Validation(
            "sync.duplicate_window_hours must be positive".to_string(),
        ));
    }

    if sync.max_history_days <= 0 {
        return Err(ConfigError::Validation("sync.max_history_days must be positive".to_string()));
    }

    if sync.incremental_lookback_hours <= 0 {
        return Err(ConfigError::Validation(
            "sync.incremental_lookback_hours must be positive".to_string(),
        ));
    }

    if !(0.0..=1.0).contains(&sync.min_match_confidence) {
        return Err(ConfigError::Validation(
            "sync.min_match_confidence must be in range 0.0..=1.0".to_string(),
        ));
    }

    if sync.default_platform.trim().is_empty() {
        return Err(ConfigError::Validation("sync.default_platform must not be empty".to_string()));
    }

    Ok(())
}

fn validate_server(server: &ServerConfig) -> Result<(), ConfigError> {
    if server.bind_address.trim().is_empty() {
        return Err(ConfigError::Validation("server.bind_address must not be empty".to_string()));
    }

    if server.port == 0 {
        return Err(ConfigError::Validation("server.port must be nonzero".to_string()));
    }

    Ok(())
}

fn validate_logging(logging: &LoggingConfig) -> Result<(), ConfigError> {
    const LEVELS: [&str; 5] = ["trace", "debug", "info", "warn", "error"];
    let level = logging.level.trim().to_ascii_lowercase();
    if !LEVELS.contains(&level.as_str()) {
        return Err(ConfigError::Validation(format!(
            "logging.level must be one of trace|debug|info|warn|error, got `{}`",
            logging.level
        )));
    }

    Ok(())
}

fn read_env(key: &str) -> Option<String> {
    env::var(key).ok().map(|value| value.trim().to_string()).filter(|value| !value.is_empty())
}

fn parse_u16(key: &str, value: &str) -> Result<u16, ConfigError> {
    value
        .parse()
        .map_err(|_| ConfigError::InvalidEnvOverride { key: key.to_string(), value: value.into() })
}

fn parse_u32(key: &str, value: &str) -> Result<u32, ConfigError> {
    value
        .parse()
        .map_err(|_| ConfigError::InvalidEnvOverride { key: key.to_string(), value: value.into() })
}

fn parse_u64(key: &str, value: &str) -> Result<u64, ConfigError> {
    value
        .parse()
        .map_err(|_| ConfigError::InvalidEnvOverride { key: key.to_string(), value: value.into() })
}

fn parse_i64(key: &str, value: &str) -> Result<i64, ConfigError> {
    value
        .parse()
        .map_err(|_| ConfigError::InvalidEnvOverride { key: key.to_string(), value: value.into() })
}

fn parse_f64(key: &str, value: &str) -> Result<f64, ConfigError> {
    value
        .parse()
        .map_err(|_| ConfigError::InvalidEnvOverride { key: key.to_string(), value: value.into() })
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use super::{AppConfig, ConfigError, ConfigOverrides, LoadOptions, LogFormat};

    #[test]
    fn defaults_validate() {
        let config = AppConfig::default();
        assert!(config.validate().is_ok());
    }

    #[test]
    fn overrides_take_precedence_over_defaults() {
        let config = AppConfig::load(LoadOptions {
            overrides: ConfigOverrides {
                database_url: Some("sqlite::memory:".to_string()),
                sync_page_size: Some(10),
                sync_error_budget: Some(2),
                ..ConfigOverrides::default()
            },
            ..LoadOptions::default()
        })
        .expect("load");

        assert_eq!(config.database.url, "sqlite::memory:");
        assert_eq!(config.sync.page_size, 10);
        assert_eq!(config.sync.error_budget, 2);
    }

    #[test]
    fn toml_file_patch_is_applied() {
        let mut file = tempfile::NamedTempFile::new().expect("temp file");
        writeln!(
            file,
            r#"
[database]
url = "sqlite://feed.db"

[sync]
page_size = 25
duplicate_window_hours = 48

[logging]
level = "debug"
format = "json"
"#
        )
        .expect("write config");

        let config = AppConfig::load(LoadOptions {
            config_path: Some(file.path().to_path_buf()),
            require_file: true,
            ..LoadOptions::default()
        })
        .expect("load");

        assert_eq!(config.database.url, "sqlite://feed.db");
        assert_eq!(config.sync.page_size, 25);
        assert_eq!(config.sync.duplicate_window_hours, 48);
        assert_eq!(config.logging.level, "debug");
        assert_eq!(config.logging.format, LogFormat::Json);
    }

    #[test]
    fn missing_required_file_is_an_error() {
        let result = AppConfig::load(LoadOptions {
            config_path: Some("does-not-exist.toml".into()),
            require_file: true,
            ..LoadOptions::default()
        });

        assert!(matches!(result, Err(ConfigError::MissingConfigFile(_))));
    }

    #[test]
    fn invalid_confidence_fails_validation() {
        let mut config = AppConfig::default();
        config.sync.min_match_confidence = 1.5;

        let result = config.validate();
        assert!(matches!(result, Err(ConfigError::Validation(_))));
    }

    #[test]
    fn non_sqlite_database_url_fails_validation() {
        let mut config = AppConfig::default();
        config.database.url = "postgres://localhost/feed".to_string();

        assert!(config.validate().is_err());
    }
}
