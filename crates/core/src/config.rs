use std::env;
use std::fs;
use std::path::{Path, PathBuf};

use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::domain::policy::max_execution_timeout_ms;

#[derive(Clone, Debug)]
pub struct AppConfig {
    pub database: DatabaseConfig,
    pub server: ServerConfig,
    pub engine: EngineConfig,
    pub upstream: UpstreamConfig,
    pub logging: LoggingConfig,
}

#[derive(Clone, Debug)]
pub struct DatabaseConfig {
    pub url: String,
    pub max_connections: u32,
    pub timeout_secs: u64,
}

#[derive(Clone, Debug)]
pub struct ServerConfig {
    pub bind_address: String,
    pub port: u16,
    pub graceful_shutdown_secs: u64,
}

/// Knobs governing dispatch, queue leasing, retries, reaping, and the
/// safety guards. Populated once at boot and immutable afterwards.
#[derive(Clone, Debug)]
pub struct EngineConfig {
    /// Ceiling for synchronous (immediate-mode) execution.
    pub immediate_budget_ms: u64,
    /// How long a duplicate submission returns the original result.
    pub dedup_window_hours: u64,
    pub lease_ms: u64,
    pub lease_renew_ms: u64,
    pub worker_count: usize,
    pub worker_shutdown_grace_ms: u64,
    /// Cadence of the stale lock / expired lease reaper.
    pub reaper_interval_ms: u64,
    pub max_attempts_fast: u32,
    pub max_attempts_medium: u32,
    pub max_attempts_long: u32,
    /// Installer-extensible additions to the masking denylist.
    pub log_mask_patterns: Vec<String>,
    /// Must exceed the largest execution budget in the timeout matrix.
    pub cancellation_token_ttl_secs: u64,
}

#[derive(Clone, Debug)]
pub struct UpstreamConfig {
    pub asset_base_url: String,
    pub automation_base_url: String,
    pub secrets_base_url: String,
    pub rbac_base_url: String,
    pub api_token: Option<SecretString>,
    pub request_timeout_secs: u64,
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
    pub log_level: Option<String>,
    pub worker_count: Option<usize>,
    pub immediate_budget_ms: Option<u64>,
    pub bind_address: Option<String>,
    pub port: Option<u16>,
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
                url: "sqlite://fleetrun.db".to_string(),
                max_connections: 5,
                timeout_secs: 30,
            },
            server: ServerConfig {
                bind_address: "127.0.0.1".to_string(),
                port: 8080,
                graceful_shutdown_secs: 15,
            },
            engine: EngineConfig {
                immediate_budget_ms: 8_000,
                dedup_window_hours: 24,
                lease_ms: 120_000,
                lease_renew_ms: 30_000,
                worker_count: 4,
                worker_shutdown_grace_ms: 30_000,
                reaper_interval_ms: 60_000,
                max_attempts_fast: 2,
                max_attempts_medium: 3,
                max_attempts_long: 5,
                log_mask_patterns: Vec::new(),
                cancellation_token_ttl_secs: 8 * 60 * 60,
            },
            upstream: UpstreamConfig {
                asset_base_url: "http://localhost:9001".to_string(),
                automation_base_url: "http://localhost:9002".to_string(),
                secrets_base_url: "http://localhost:9003".to_string(),
                rbac_base_url: "http://localhost:9004".to_string(),
                api_token: None,
                request_timeout_secs: 30,
            },
            logging: LoggingConfig { level: "info".to_string(), format: LogFormat::Compact },
        }
    }
}

impl EngineConfig {
    pub fn max_attempts_for(&self, sla_class: crate::domain::execution::SlaClass) -> u32 {
        match sla_class {
            crate::domain::execution::SlaClass::Fast => self.max_attempts_fast,
            crate::domain::execution::SlaClass::Medium => self.max_attempts_medium,
            crate::domain::execution::SlaClass::Long => self.max_attempts_long,
        }
    }
}

impl std::str::FromStr for LogFormat {
    type Err = ConfigError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        let normalised = value.trim().to_ascii_lowercase();
        match normalised.as_str() {
            "compact" => Ok(Self::Compact),
            "pretty" => Ok(Self::Pretty),
            "json" => Ok(Self::Json),
            _ => Err(ConfigError::Validation(format!(
                "unsupported log format `{normalised}` (expected compact|pretty|json)"
            ))),
        }
    }
}

impl AppConfig {
    pub fn load(options: LoadOptions) -> Result<Self, ConfigError> {
        let mut config = Self::default();
        let maybe_path = resolve_config_path(options.config_path.as_deref());

        if let Some(path) = maybe_path {
            let patch = read_patch(&path)?;
            config.apply_patch(patch);
        } else if options.require_file {
            let expected = options.config_path.unwrap_or_else(|| PathBuf::from("fleetrun.toml"));
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

        if let Some(engine) = patch.engine {
            if let Some(immediate_budget_ms) = engine.immediate_budget_ms {
                self.engine.immediate_budget_ms = immediate_budget_ms;
            }
            if let Some(dedup_window_hours) = engine.dedup_window_hours {
                self.engine.dedup_window_hours = dedup_window_hours;
            }
            if let Some(lease_ms) = engine.lease_ms {
                self.engine.lease_ms = lease_ms;
            }
            if let Some(lease_renew_ms) = engine.lease_renew_ms {
                self.engine.lease_renew_ms = lease_renew_ms;
            }
            if let Some(worker_count) = engine.worker_count {
                self.engine.worker_count = worker_count;
            }
            if let Some(worker_shutdown_grace_ms) = engine.worker_shutdown_grace_ms {
                self.engine.worker_shutdown_grace_ms = worker_shutdown_grace_ms;
            }
            if let Some(reaper_interval_ms) = engine.reaper_interval_ms {
                self.engine.reaper_interval_ms = reaper_interval_ms;
            }
            if let Some(max_attempts_fast) = engine.max_attempts_fast {
                self.engine.max_attempts_fast = max_attempts_fast;
            }
            if let Some(max_attempts_medium) = engine.max_attempts_medium {
                self.engine.max_attempts_medium = max_attempts_medium;
            }
            if let Some(max_attempts_long) = engine.max_attempts_long {
                self.engine.max_attempts_long = max_attempts_long;
            }
            if let Some(log_mask_patterns) = engine.log_mask_patterns {
                self.engine.log_mask_patterns = log_mask_patterns;
            }
            if let Some(cancellation_token_ttl_secs) = engine.cancellation_token_ttl_secs {
                self.engine.cancellation_token_ttl_secs = cancellation_token_ttl_secs;
            }
        }

        if let Some(upstream) = patch.upstream {
            if let Some(asset_base_url) = upstream.asset_base_url {
                self.upstream.asset_base_url = asset_base_url;
            }
            if let Some(automation_base_url) = upstream.automation_base_url {
                self.upstream.automation_base_url = automation_base_url;
            }
            if let Some(secrets_base_url) = upstream.secrets_base_url {
                self.upstream.secrets_base_url = secrets_base_url;
            }
            if let Some(rbac_base_url) = upstream.rbac_base_url {
                self.upstream.rbac_base_url = rbac_base_url;
            }
            if let Some(api_token_value) = upstream.api_token {
                self.upstream.api_token = Some(api_token_value.into());
            }
            if let Some(request_timeout_secs) = upstream.request_timeout_secs {
                self.upstream.request_timeout_secs = request_timeout_secs;
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
        if let Some(value) = read_env("FLEETRUN_DATABASE_URL") {
            self.database.url = value;
        }
        if let Some(value) = read_env("FLEETRUN_DATABASE_MAX_CONNECTIONS") {
            self.database.max_connections = parse_env::<u32>("FLEETRUN_DATABASE_MAX_CONNECTIONS", &value)?;
        }

        if let Some(value) = read_env("FLEETRUN_SERVER_BIND_ADDRESS") {
            self.server.bind_address = value;
        }
        if let Some(value) = read_env("FLEETRUN_SERVER_PORT") {
            self.server.port = parse_env::<u16>("FLEETRUN_SERVER_PORT", &value)?;
        }

        if let Some(value) = read_env("FLEETRUN_IMMEDIATE_BUDGET_MS") {
            self.engine.immediate_budget_ms = parse_env::<u64>("FLEETRUN_IMMEDIATE_BUDGET_MS", &value)?;
        }
        if let Some(value) = read_env("FLEETRUN_DEDUP_WINDOW_HOURS") {
            self.engine.dedup_window_hours = parse_env::<u64>("FLEETRUN_DEDUP_WINDOW_HOURS", &value)?;
        }
        if let Some(value) = read_env("FLEETRUN_LEASE_MS") {
            self.engine.lease_ms = parse_env::<u64>("FLEETRUN_LEASE_MS", &value)?;
        }
        if let Some(value) = read_env("FLEETRUN_WORKER_COUNT") {
            self.engine.worker_count = parse_env::<u64>("FLEETRUN_WORKER_COUNT", &value)? as usize;
        }

        if let Some(value) = read_env("FLEETRUN_UPSTREAM_ASSET_BASE_URL") {
            self.upstream.asset_base_url = value;
        }
        if let Some(value) = read_env("FLEETRUN_UPSTREAM_AUTOMATION_BASE_URL") {
            self.upstream.automation_base_url = value;
        }
        if let Some(value) = read_env("FLEETRUN_UPSTREAM_SECRETS_BASE_URL") {
            self.upstream.secrets_base_url = value;
        }
        if let Some(value) = read_env("FLEETRUN_UPSTREAM_RBAC_BASE_URL") {
            self.upstream.rbac_base_url = value;
        }
        if let Some(value) = read_env("FLEETRUN_UPSTREAM_API_TOKEN") {
            self.upstream.api_token = Some(value.into());
        }

        let log_level =
            read_env("FLEETRUN_LOGGING_LEVEL").or_else(|| read_env("FLEETRUN_LOG_LEVEL"));
        if let Some(value) = log_level {
            self.logging.level = value;
        }
        let log_format =
            read_env("FLEETRUN_LOGGING_FORMAT").or_else(|| read_env("FLEETRUN_LOG_FORMAT"));
        if let Some(value) = log_format {
            self.logging.format = value.parse()?;
        }

        Ok(())
    }

    fn apply_overrides(&mut self, overrides: ConfigOverrides) {
        if let Some(database_url) = overrides.database_url {
            self.database.url = database_url;
        }
        if let Some(log_level) = overrides.log_level {
            self.logging.level = log_level;
        }
        if let Some(worker_count) = overrides.worker_count {
            self.engine.worker_count = worker_count;
        }
        if let Some(immediate_budget_ms) = overrides.immediate_budget_ms {
            self.engine.immediate_budget_ms = immediate_budget_ms;
        }
        if let Some(bind_address) = overrides.bind_address {
            self.server.bind_address = bind_address;
        }
        if let Some(port) = overrides.port {
            self.server.port = port;
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        validate_database(&self.database)?;
        validate_server(&self.server)?;
        validate_engine(&self.engine)?;
        validate_upstream(&self.upstream)?;
        validate_logging(&self.logging)?;
        Ok(())
    }
}

fn resolve_config_path(explicit_path: Option<&Path>) -> Option<PathBuf> {
    if let Some(path) = explicit_path {
        return path.exists().then_some(path.to_path_buf());
    }

    [PathBuf::from("fleetrun.toml"), PathBuf::from("config/fleetrun.toml")]
        .into_iter()
        .find(|path| path.exists())
}

fn read_patch(path: &Path) -> Result<ConfigPatch, ConfigError> {
    let raw = fs::read_to_string(path)
        .map_err(|source| ConfigError::ReadFile { path: path.to_path_buf(), source })?;
    let rendered = interpolate_env_vars(&raw)?;
    toml::from_str(&rendered)
        .map_err(|source| ConfigError::ParseFile { path: path.to_path_buf(), source })
}

/// Substitute every `${VAR}` in the raw config text with the variable's
/// value. A reference to an unset variable is an error rather than an empty
/// string, so a missing secret fails the boot instead of silently producing
/// a blank credential.
fn interpolate_env_vars(raw: &str) -> Result<String, ConfigError> {
    let mut rendered = String::with_capacity(raw.len());
    let mut remainder = raw;

    while let Some(marker) = remainder.find("${") {
        rendered.push_str(&remainder[..marker]);
        let expression = &remainder[marker + 2..];
        let Some(close) = expression.find('}') else {
            return Err(ConfigError::UnterminatedInterpolation);
        };

        let var = &expression[..close];
        let value =
            env::var(var).map_err(|_| ConfigError::MissingEnvInterpolation { var: var.to_string() })?;
        rendered.push_str(&value);
        remainder = &expression[close + 1..];
    }

    rendered.push_str(remainder);
    Ok(rendered)
}

fn validate_database(database: &DatabaseConfig) -> Result<(), ConfigError> {
    let url = database.url.trim();
    let is_sqlite = url == ":memory:"
        || ["sqlite://", "sqlite::"].iter().any(|prefix| url.starts_with(prefix));
    if !is_sqlite {
        return Err(ConfigError::Validation(format!(
            "database.url must be a sqlite URL (`sqlite://...`, `sqlite::...`, or `:memory:`), \
             got `{url}`"
        )));
    }

    if database.max_connections == 0 {
        return Err(ConfigError::Validation(
            "database.max_connections must be at least 1".to_string(),
        ));
    }

    if !(1..=300).contains(&database.timeout_secs) {
        return Err(ConfigError::Validation(
            "database.timeout_secs must be in range 1..=300".to_string(),
        ));
    }

    Ok(())
}

fn validate_server(server: &ServerConfig) -> Result<(), ConfigError> {
    if server.port == 0 {
        return Err(ConfigError::Validation("server.port must be greater than zero".to_string()));
    }

    if server.graceful_shutdown_secs == 0 {
        return Err(ConfigError::Validation(
            "server.graceful_shutdown_secs must be greater than zero".to_string(),
        ));
    }

    Ok(())
}

fn validate_engine(engine: &EngineConfig) -> Result<(), ConfigError> {
    if engine.immediate_budget_ms == 0 {
        return Err(ConfigError::Validation(
            "engine.immediate_budget_ms must be greater than zero".to_string(),
        ));
    }

    if engine.worker_count == 0 {
        return Err(ConfigError::Validation(
            "engine.worker_count must be greater than zero".to_string(),
        ));
    }

    if engine.lease_renew_ms >= engine.lease_ms {
        return Err(ConfigError::Validation(
            "engine.lease_renew_ms must be below engine.lease_ms or leases expire mid-run"
                .to_string(),
        ));
    }

    if engine.reaper_interval_ms == 0 {
        return Err(ConfigError::Validation(
            "engine.reaper_interval_ms must be greater than zero".to_string(),
        ));
    }

    if engine.max_attempts_fast == 0
        || engine.max_attempts_medium == 0
        || engine.max_attempts_long == 0
    {
        return Err(ConfigError::Validation(
            "engine.max_attempts_* must all be greater than zero".to_string(),
        ));
    }

    let token_ttl_ms = engine.cancellation_token_ttl_secs.saturating_mul(1000);
    if token_ttl_ms <= max_execution_timeout_ms() {
        return Err(ConfigError::Validation(format!(
            "engine.cancellation_token_ttl_secs must exceed the largest execution budget ({}ms)",
            max_execution_timeout_ms()
        )));
    }

    Ok(())
}

fn validate_upstream(upstream: &UpstreamConfig) -> Result<(), ConfigError> {
    for (name, url) in [
        ("upstream.asset_base_url", &upstream.asset_base_url),
        ("upstream.automation_base_url", &upstream.automation_base_url),
        ("upstream.secrets_base_url", &upstream.secrets_base_url),
        ("upstream.rbac_base_url", &upstream.rbac_base_url),
    ] {
        if !url.starts_with("http://") && !url.starts_with("https://") {
            return Err(ConfigError::Validation(format!(
                "{name} must start with http:// or https://"
            )));
        }
    }

    if upstream.request_timeout_secs == 0 || upstream.request_timeout_secs > 600 {
        return Err(ConfigError::Validation(
            "upstream.request_timeout_secs must be in range 1..=600".to_string(),
        ));
    }

    Ok(())
}

fn validate_logging(logging: &LoggingConfig) -> Result<(), ConfigError> {
    let level = logging.level.trim().to_ascii_lowercase();
    if ["trace", "debug", "info", "warn", "error"].contains(&level.as_str()) {
        Ok(())
    } else {
        Err(ConfigError::Validation(
            "logging.level must be one of trace|debug|info|warn|error".to_string(),
        ))
    }
}

fn read_env(key: &str) -> Option<String> {
    match env::var(key) {
        Ok(value) if !value.trim().is_empty() => Some(value),
        _ => None,
    }
}

fn parse_env<T: std::str::FromStr>(key: &str, value: &str) -> Result<T, ConfigError> {
    value.parse().map_err(|_| ConfigError::InvalidEnvOverride {
        key: key.to_string(),
        value: value.to_string(),
    })
}

#[derive(Debug, Default, Deserialize)]
struct ConfigPatch {
    database: Option<DatabasePatch>,
    server: Option<ServerPatch>,
    engine: Option<EnginePatch>,
    upstream: Option<UpstreamPatch>,
    logging: Option<LoggingPatch>,
}

#[derive(Debug, Default, Deserialize)]
struct DatabasePatch {
    url: Option<String>,
    max_connections: Option<u32>,
    timeout_secs: Option<u64>,
}

#[derive(Debug, Default, Deserialize)]
struct ServerPatch {
    bind_address: Option<String>,
    port: Option<u16>,
    graceful_shutdown_secs: Option<u64>,
}

#[derive(Debug, Default, Deserialize)]
struct EnginePatch {
    immediate_budget_ms: Option<u64>,
    dedup_window_hours: Option<u64>,
    lease_ms: Option<u64>,
    lease_renew_ms: Option<u64>,
    worker_count: Option<usize>,
    worker_shutdown_grace_ms: Option<u64>,
    reaper_interval_ms: Option<u64>,
    max_attempts_fast: Option<u32>,
    max_attempts_medium: Option<u32>,
    max_attempts_long: Option<u32>,
    log_mask_patterns: Option<Vec<String>>,
    cancellation_token_ttl_secs: Option<u64>,
}

#[derive(Debug, Default, Deserialize)]
struct UpstreamPatch {
    asset_base_url: Option<String>,
    automation_base_url: Option<String>,
    secrets_base_url: Option<String>,
    rbac_base_url: Option<String>,
    api_token: Option<String>,
    request_timeout_secs: Option<u64>,
}

#[derive(Debug, Default, Deserialize)]
struct LoggingPatch {
    level: Option<String>,
    format: Option<LogFormat>,
}
