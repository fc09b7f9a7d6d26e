// Configuration loading and validation (bot.toml, credentials.toml).

use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use chrono_tz::Tz;
use serde::Deserialize;
use thiserror::Error;

// ---------------------------------------------------------------------------
// Error types
// ---------------------------------------------------------------------------

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("config file not found: {path}")]
    FileNotFound { path: PathBuf },

    #[error("failed to parse config file {path}: {source}")]
    ParseError {
        path: PathBuf,
        source: toml::de::Error,
    },

    #[error("validation error for field `{field}`: {message}")]
    ValidationError { field: String, message: String },

    #[error("failed to initialize config from defaults: {message}")]
    DefaultsCopyError { message: String },
}

impl ConfigError {
    fn invalid(field: &str, message: impl Into<String>) -> Self {
        ConfigError::ValidationError {
            field: field.to_string(),
            message: message.into(),
        }
    }
}

// ---------------------------------------------------------------------------
// Top-level assembled Config
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct Config {
    pub store: StoreConfig,
    pub channel: ChannelConfig,
    pub report: ReportSchedule,
    pub llm: LlmConfig,
    pub relay: RelayConfig,
    pub logging: LoggingConfig,
    pub credentials: CredentialsConfig,
}

// ---------------------------------------------------------------------------
// bot.toml structs
// ---------------------------------------------------------------------------

/// Raw deserialization target for the entire bot.toml file.
#[derive(Debug, Clone, Deserialize)]
struct BotFile {
    store: StoreConfig,
    #[serde(default)]
    channel: ChannelConfig,
    report: ReportSection,
    llm: LlmConfig,
    #[serde(default)]
    relay: RelayConfig,
    #[serde(default)]
    logging: LoggingConfig,
}

/// Which profile store backend the bot runs against.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StoreBackend {
    /// Local SQLite database.
    Sqlite,
    /// Remote profile API.
    Api,
}

#[derive(Debug, Clone, Deserialize)]
pub struct StoreConfig {
    pub backend: StoreBackend,
    #[serde(default = "default_database_path")]
    pub database_path: String,
    #[serde(default)]
    pub api_url: Option<String>,
    /// With the sqlite backend, repeat user/bot creation on the remote API.
    #[serde(default)]
    pub mirror_to_api: bool,
}

fn default_database_path() -> String {
    "boto-sapiens.db".to_string()
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct ChannelConfig {
    /// Destination chat for published chronicles. `None` disables publishing.
    #[serde(default)]
    pub id: Option<i64>,
}

#[derive(Debug, Clone, Deserialize)]
struct ReportSection {
    time: String,
    timezone: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct LlmConfig {
    pub base_url: String,
    pub model: String,
    pub chronicle_max_tokens: u32,
    pub report_max_tokens: u32,
    pub chronicle_temperature: f32,
    pub report_temperature: f32,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RelayConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default = "default_relay_bot_name")]
    pub bot_name: String,
    #[serde(default = "default_relay_port")]
    pub listen_port: u16,
    #[serde(default)]
    pub webhook_url: Option<String>,
}

impl Default for RelayConfig {
    fn default() -> Self {
        RelayConfig {
            enabled: false,
            url: None,
            bot_name: default_relay_bot_name(),
            listen_port: default_relay_port(),
            webhook_url: None,
        }
    }
}

fn default_relay_bot_name() -> String {
    "ChroniclerBot".to_string()
}

fn default_relay_port() -> u16 {
    8081
}

#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        LoggingConfig {
            level: default_log_level(),
        }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

// ---------------------------------------------------------------------------
// credentials.toml structs
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Deserialize, Default)]
pub struct CredentialsConfig {
    pub bot_token: Option<String>,
    pub openai_api_key: Option<String>,
}

// ---------------------------------------------------------------------------
// Report schedule
// ---------------------------------------------------------------------------

/// A wall-clock time of day, parsed from `HH:MM`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DailyTime {
    pub hour: u32,
    pub minute: u32,
}

impl FromStr for DailyTime {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (h, m) = s
            .trim()
            .split_once(':')
            .ok_or_else(|| format!("expected HH:MM, got {s:?}"))?;
        let hour: u32 = h
            .parse()
            .map_err(|_| format!("invalid hour in {s:?}"))?;
        let minute: u32 = m
            .parse()
            .map_err(|_| format!("invalid minute in {s:?}"))?;
        if hour > 23 || minute > 59 {
            return Err(format!("time out of range: {s:?}"));
        }
        Ok(DailyTime { hour, minute })
    }
}

impl fmt::Display for DailyTime {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:02}:{:02}", self.hour, self.minute)
    }
}

/// When the daily ecosystem report fires.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ReportSchedule {
    pub time: DailyTime,
    pub timezone: Tz,
}

// ---------------------------------------------------------------------------
// Loading logic
// ---------------------------------------------------------------------------

/// Load and validate configuration from `config/bot.toml` and (optionally)
/// `config/credentials.toml`, relative to `base_dir`.
///
/// Does not copy defaults; `load_config()` does that first.
pub fn load_config_from(base_dir: &Path) -> Result<Config, ConfigError> {
    let config_dir = base_dir.join("config");

    let bot_path = config_dir.join("bot.toml");
    let bot_text = read_file(&bot_path)?;

    let credentials_path = config_dir.join("credentials.toml");
    let credentials_text = if credentials_path.exists() {
        Some(read_file(&credentials_path)?)
    } else {
        None
    };

    parse_config(
        &bot_text,
        &bot_path,
        credentials_text.as_deref(),
        &credentials_path,
    )
}

impl Config {
    /// Build a validated config straight from TOML text.
    pub fn from_toml(bot_toml: &str, credentials_toml: Option<&str>) -> Result<Config, ConfigError> {
        parse_config(
            bot_toml,
            Path::new("bot.toml"),
            credentials_toml,
            Path::new("credentials.toml"),
        )
    }
}

fn parse_config(
    bot_text: &str,
    bot_path: &Path,
    credentials_text: Option<&str>,
    credentials_path: &Path,
) -> Result<Config, ConfigError> {
    let bot_file: BotFile = toml::from_str(bot_text).map_err(|e| ConfigError::ParseError {
        path: bot_path.to_path_buf(),
        source: e,
    })?;

    let credentials = match credentials_text {
        Some(text) => toml::from_str(text).map_err(|e| ConfigError::ParseError {
            path: credentials_path.to_path_buf(),
            source: e,
        })?,
        None => CredentialsConfig::default(),
    };

    let time = bot_file
        .report
        .time
        .parse::<DailyTime>()
        .map_err(|msg| ConfigError::invalid("report.time", msg))?;
    let timezone = bot_file
        .report
        .timezone
        .parse::<Tz>()
        .map_err(|_| {
            ConfigError::invalid(
                "report.timezone",
                format!("unknown timezone {:?}", bot_file.report.timezone),
            )
        })?;

    let config = Config {
        store: bot_file.store,
        channel: bot_file.channel,
        report: ReportSchedule { time, timezone },
        llm: bot_file.llm,
        relay: bot_file.relay,
        logging: bot_file.logging,
        credentials,
    };

    validate(&config)?;

    Ok(config)
}

/// Ensure all config files exist by copying missing ones from `defaults/`.
/// Returns the list of files that were copied. Skips `.example` files.
pub fn ensure_config_files(base_dir: &Path) -> Result<Vec<PathBuf>, ConfigError> {
    let defaults_dir = base_dir.join("defaults");
    let config_dir = base_dir.join("config");

    if !defaults_dir.exists() {
        if !config_dir.exists() {
            return Err(ConfigError::DefaultsCopyError {
                message: format!(
                    "neither defaults/ nor config/ directory found in {}; \
                     run from the repository root",
                    base_dir.display()
                ),
            });
        }
        return Ok(vec![]);
    }

    std::fs::create_dir_all(&config_dir).map_err(|e| ConfigError::DefaultsCopyError {
        message: format!("failed to create config directory: {e}"),
    })?;

    let entries = std::fs::read_dir(&defaults_dir).map_err(|e| ConfigError::DefaultsCopyError {
        message: format!("failed to read defaults directory: {e}"),
    })?;

    let mut copied = Vec::new();
    for entry in entries {
        let entry = entry.map_err(|e| ConfigError::DefaultsCopyError {
            message: format!("failed to read defaults entry: {e}"),
        })?;
        let path = entry.path();
        if !path.is_file() {
            continue;
        }
        let Some(file_name) = path.file_name() else {
            continue;
        };
        if file_name.to_str().is_some_and(|n| n.ends_with(".example")) {
            continue;
        }

        let target = config_dir.join(file_name);
        match std::fs::OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&target)
        {
            Ok(mut dest) => {
                let content = std::fs::read(&path).map_err(|e| ConfigError::DefaultsCopyError {
                    message: format!("failed to read {}: {e}", path.display()),
                })?;
                std::io::Write::write_all(&mut dest, &content).map_err(|e| {
                    ConfigError::DefaultsCopyError {
                        message: format!("failed to write {}: {e}", target.display()),
                    }
                })?;
                copied.push(target);
            }
            // Never overwrite a file the operator already edited.
            Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {}
            Err(e) => {
                return Err(ConfigError::DefaultsCopyError {
                    message: format!("failed to create {}: {e}", target.display()),
                });
            }
        }
    }

    Ok(copied)
}

/// Load config relative to the current working directory, copying defaults
/// first.
pub fn load_config() -> Result<Config, ConfigError> {
    let cwd = std::env::current_dir().map_err(|_| ConfigError::FileNotFound {
        path: PathBuf::from("."),
    })?;
    ensure_config_files(&cwd)?;
    load_config_from(&cwd)
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

fn read_file(path: &Path) -> Result<String, ConfigError> {
    std::fs::read_to_string(path).map_err(|_| ConfigError::FileNotFound {
        path: path.to_path_buf(),
    })
}

fn is_blank(value: &Option<String>) -> bool {
    value.as_deref().map_or(true, |s| s.trim().is_empty())
}

// ---------------------------------------------------------------------------
// Validation
// ---------------------------------------------------------------------------

fn validate(config: &Config) -> Result<(), ConfigError> {
    if is_blank(&config.credentials.bot_token) {
        return Err(ConfigError::invalid(
            "credentials.bot_token",
            "a chat bot token is required",
        ));
    }

    let store = &config.store;
    if store.backend == StoreBackend::Api && is_blank(&store.api_url) {
        return Err(ConfigError::invalid(
            "store.api_url",
            "required when store.backend = \"api\"",
        ));
    }
    if store.mirror_to_api && is_blank(&store.api_url) {
        return Err(ConfigError::invalid(
            "store.api_url",
            "required when store.mirror_to_api = true",
        ));
    }
    if store.backend == StoreBackend::Sqlite && store.database_path.trim().is_empty() {
        return Err(ConfigError::invalid(
            "store.database_path",
            "must not be empty",
        ));
    }

    let llm = &config.llm;
    if llm.chronicle_max_tokens == 0 {
        return Err(ConfigError::invalid("llm.chronicle_max_tokens", "must be > 0"));
    }
    if llm.report_max_tokens == 0 {
        return Err(ConfigError::invalid("llm.report_max_tokens", "must be > 0"));
    }
    for (name, value) in [
        ("llm.chronicle_temperature", llm.chronicle_temperature),
        ("llm.report_temperature", llm.report_temperature),
    ] {
        if !(0.0..=2.0).contains(&value) {
            return Err(ConfigError::invalid(
                name,
                format!("must be between 0.0 and 2.0 inclusive, got {value}"),
            ));
        }
    }

    let relay = &config.relay;
    if relay.enabled {
        if is_blank(&relay.url) {
            return Err(ConfigError::invalid("relay.url", "required when relay is enabled"));
        }
        if is_blank(&relay.webhook_url) {
            return Err(ConfigError::invalid(
                "relay.webhook_url",
                "required when relay is enabled",
            ));
        }
    }

    Ok(())
}

// ---------------------------------------------------------------------------
// Unit tests
// ---------------------------------------------------------------------------
