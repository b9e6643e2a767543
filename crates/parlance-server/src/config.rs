//! Server configuration loading from file and environment variables.

use serde::Deserialize;
use std::net::{IpAddr, Ipv4Addr};
use std::time::Duration;
use thiserror::Error;

/// Top-level server configuration.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Config {
    /// Server network settings.
    #[serde(default)]
    pub server: ServerConfig,

    /// Database settings.
    #[serde(default)]
    pub database: DatabaseConfig,

    /// Logging settings.
    #[serde(default)]
    pub logging: LoggingConfig,

    /// Speech and language-model service endpoints.
    #[serde(default)]
    pub services: ServiceConfig,

    /// Per-call session limits.
    #[serde(default)]
    pub session: SessionConfig,
}

/// Network configuration for the HTTP server.
#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    /// Host address to bind to.
    #[serde(default = "default_host")]
    pub host: IpAddr,

    /// Port to listen on.
    #[serde(default = "default_port")]
    pub port: u16,
}

/// Database configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct DatabaseConfig {
    /// Path to the SQLite database file.
    #[serde(default = "default_db_path")]
    pub path: String,

    #[serde(default = "default_busy_timeout_ms")]
    pub busy_timeout_ms: u64,

    #[serde(default = "default_pool_max_size")]
    pub pool_max_size: u32,
}

/// Logging configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    /// Log level filter (e.g., "info", "debug", "parlance_voice=debug,info").
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Whether to output logs in JSON format.
    #[serde(default)]
    pub json: bool,
}

/// Hosted speech and model services.
#[derive(Clone, Deserialize)]
pub struct ServiceConfig {
    #[serde(default = "default_stt_url")]
    pub stt_url: String,

    #[serde(default = "default_tts_url")]
    pub tts_url: String,

    /// Key for both speech endpoints. Usually supplied via `DEEPGRAM_API_KEY`.
    #[serde(default)]
    pub speech_api_key: String,

    #[serde(default = "default_llm_base_url")]
    pub llm_base_url: String,

    #[serde(default = "default_llm_model")]
    pub llm_model: String,

    /// Usually supplied via `OPENAI_API_KEY`.
    #[serde(default)]
    pub llm_api_key: String,

    /// Silence after which the recognizer reports an utterance end.
    #[serde(default = "default_utterance_end_ms")]
    pub utterance_end_ms: u32,

    #[serde(default = "default_endpointing_ms")]
    pub endpointing_ms: u32,
}

/// Limits applied to every media session.
#[derive(Debug, Clone, Deserialize)]
pub struct SessionConfig {
    /// Calls are force-closed after this long.
    #[serde(default = "default_max_duration_secs")]
    pub max_duration_secs: u64,

    #[serde(default = "default_max_queued_utterances")]
    pub max_queued_utterances: usize,

    /// Upper bound on the agent configuration lookup before falling back.
    #[serde(default = "default_config_lookup_timeout_ms")]
    pub config_lookup_timeout_ms: u64,

    #[serde(default = "default_browser_sample_rate")]
    pub browser_input_sample_rate: u32,

    #[serde(default = "default_browser_sample_rate")]
    pub browser_output_sample_rate: u32,
}

impl SessionConfig {
    pub fn max_duration(&self) -> Duration {
        Duration::from_secs(self.max_duration_secs)
    }

    pub fn config_lookup_timeout(&self) -> Duration {
        Duration::from_millis(self.config_lookup_timeout_ms)
    }
}

fn default_host() -> IpAddr {
    IpAddr::V4(Ipv4Addr::new(127, 0, 0, 1))
}

fn default_port() -> u16 {
    3000
}

fn default_db_path() -> String {
    "parlance.db".to_string()
}

fn default_busy_timeout_ms() -> u64 {
    5_000
}

fn default_pool_max_size() -> u32 {
    8
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_stt_url() -> String {
    parlance_voice::deepgram::DEFAULT_LISTEN_URL.to_string()
}

fn default_tts_url() -> String {
    parlance_voice::deepgram::DEFAULT_SPEAK_URL.to_string()
}

fn default_llm_base_url() -> String {
    parlance_voice::openai::DEFAULT_BASE_URL.to_string()
}

fn default_llm_model() -> String {
    "gpt-4o-mini".to_string()
}

fn default_utterance_end_ms() -> u32 {
    1000
}

fn default_endpointing_ms() -> u32 {
    300
}

fn default_max_duration_secs() -> u64 {
    600
}

fn default_max_queued_utterances() -> usize {
    parlance_voice::pipeline::DEFAULT_MAX_QUEUED_UTTERANCES
}

fn default_config_lookup_timeout_ms() -> u64 {
    2_000
}

fn default_browser_sample_rate() -> u32 {
    16_000
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
        }
    }
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            path: default_db_path(),
            busy_timeout_ms: default_busy_timeout_ms(),
            pool_max_size: default_pool_max_size(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            json: false,
        }
    }
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            stt_url: default_stt_url(),
            tts_url: default_tts_url(),
            speech_api_key: String::new(),
            llm_base_url: default_llm_base_url(),
            llm_model: default_llm_model(),
            llm_api_key: String::new(),
            utterance_end_ms: default_utterance_end_ms(),
            endpointing_ms: default_endpointing_ms(),
        }
    }
}

impl std::fmt::Debug for ServiceConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        fn redact(key: &str) -> &'static str {
            if key.is_empty() {
                "<unset>"
            } else {
                "[redacted]"
            }
        }
        f.debug_struct("ServiceConfig")
            .field("stt_url", &self.stt_url)
            .field("tts_url", &self.tts_url)
            .field("speech_api_key", &redact(&self.speech_api_key))
            .field("llm_base_url", &self.llm_base_url)
            .field("llm_model", &self.llm_model)
            .field("llm_api_key", &redact(&self.llm_api_key))
            .field("utterance_end_ms", &self.utterance_end_ms)
            .field("endpointing_ms", &self.endpointing_ms)
            .finish()
    }
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            max_duration_secs: default_max_duration_secs(),
            max_queued_utterances: default_max_queued_utterances(),
            config_lookup_timeout_ms: default_config_lookup_timeout_ms(),
            browser_input_sample_rate: default_browser_sample_rate(),
            browser_output_sample_rate: default_browser_sample_rate(),
        }
    }
}

/// Errors that can occur when loading configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// Failed to read the configuration file.
    #[error("failed to read config file: {0}")]
    FileRead(#[from] std::io::Error),

    /// Failed to parse the configuration file.
    #[error("failed to parse config file: {0}")]
    Parse(#[from] toml::de::Error),
}

/// Loads configuration from a TOML file, falling back to defaults.
///
/// Environment variable overrides:
/// - `PARLANCE_HOST` overrides `server.host`
/// - `PARLANCE_PORT` overrides `server.port`
/// - `PARLANCE_DB_PATH` overrides `database.path`
/// - `PARLANCE_LOG_LEVEL` overrides `logging.level`
/// - `PARLANCE_LOG_JSON` overrides `logging.json` (set to "true" to enable)
/// - `PARLANCE_MAX_SESSION_SECS` overrides `session.max_duration_secs`
/// - `PARLANCE_LLM_BASE_URL` overrides `services.llm_base_url`
/// - `PARLANCE_LLM_MODEL` overrides `services.llm_model`
/// - `DEEPGRAM_API_KEY` overrides `services.speech_api_key`
/// - `OPENAI_API_KEY` overrides `services.llm_api_key`
///
/// # Errors
///
/// Returns `ConfigError` if the file exists but cannot be read or parsed.
pub fn load_config(path: Option<&str>) -> Result<Config, ConfigError> {
    let mut config = match path {
        Some(p) => match std::fs::read_to_string(p) {
            Ok(contents) => toml::from_str(&contents)?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                tracing::info!(path = p, "config file not found, using defaults");
                Config::default()
            }
            Err(e) => return Err(ConfigError::FileRead(e)),
        },
        None => Config::default(),
    };

    apply_env_overrides(&mut config, |name| std::env::var(name).ok());
    Ok(config)
}

/// Applies overrides from `lookup`, which maps a variable name to its value.
///
/// Unparseable numeric values are ignored; empty values never clear a key.
pub fn apply_env_overrides<F>(config: &mut Config, lookup: F)
where
    F: Fn(&str) -> Option<String>,
{
    let var = |name: &str| lookup(name).filter(|value| !value.trim().is_empty());

    if let Some(host) = var("PARLANCE_HOST") {
        if let Ok(parsed) = host.parse() {
            config.server.host = parsed;
        }
    }
    if let Some(port) = var("PARLANCE_PORT") {
        if let Ok(parsed) = port.parse() {
            config.server.port = parsed;
        }
    }
    if let Some(db_path) = var("PARLANCE_DB_PATH") {
        config.database.path = db_path;
    }
    if let Some(level) = var("PARLANCE_LOG_LEVEL") {
        config.logging.level = level;
    }
    if let Some(json) = var("PARLANCE_LOG_JSON") {
        config.logging.json = json == "true" || json == "1";
    }
    if let Some(secs) = var("PARLANCE_MAX_SESSION_SECS") {
        if let Ok(parsed) = secs.parse() {
            config.session.max_duration_secs = parsed;
        }
    }
    if let Some(url) = var("PARLANCE_LLM_BASE_URL") {
        config.services.llm_base_url = url;
    }
    if let Some(model) = var("PARLANCE_LLM_MODEL") {
        config.services.llm_model = model;
    }
    if let Some(key) = var("DEEPGRAM_API_KEY") {
        config.services.speech_api_key = key;
    }
    if let Some(key) = var("OPENAI_API_KEY") {
        config.services.llm_api_key = key;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::io::Write;

    fn env(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |name| map.get(name).cloned()
    }

    #[test]
    fn defaults_match_documented_values() {
        let config = Config::default();
        assert_eq!(config.server.port, 3000);
        assert_eq!(config.database.path, "parlance.db");
        assert_eq!(config.session.max_duration_secs, 600);
        assert_eq!(config.session.max_queued_utterances, 8);
        assert_eq!(config.session.config_lookup_timeout(), Duration::from_secs(2));
        assert_eq!(config.services.utterance_end_ms, 1000);
        assert_eq!(config.services.llm_model, "gpt-4o-mini");
        assert!(config.services.speech_api_key.is_empty());
    }

    #[test]
    fn file_values_fill_sections_and_keep_defaults() {
        let mut file = tempfile::NamedTempFile::new().expect("temp file");
        writeln!(
            file,
            r#"
[server]
port = 8088

[session]
max_duration_secs = 120
browser_output_sample_rate = 24000

[services]
llm_model = "local-model"
"#
        )
        .expect("write config");

        let path = file.path().to_str().expect("utf-8 path");
        let config = load_config(Some(path)).expect("config loads");
        assert_eq!(config.server.port, 8088);
        assert_eq!(config.session.max_duration(), Duration::from_secs(120));
        assert_eq!(config.session.browser_output_sample_rate, 24_000);
        assert_eq!(config.session.browser_input_sample_rate, 16_000);
        assert_eq!(config.services.llm_model, "local-model");
        assert_eq!(config.database.pool_max_size, 8);
    }

    #[test]
    fn missing_file_falls_back_to_defaults() {
        let dir = tempfile::tempdir().expect("temp dir");
        let path = dir.path().join("absent.toml");
        let config = load_config(path.to_str()).expect("defaults");
        assert_eq!(config.server.port, 3000);
    }

    #[test]
    fn malformed_file_is_a_parse_error() {
        let mut file = tempfile::NamedTempFile::new().expect("temp file");
        writeln!(file, "[server]\nport = \"not a number\"").expect("write config");
        let path = file.path().to_str().expect("utf-8 path");
        assert!(matches!(load_config(Some(path)), Err(ConfigError::Parse(_))));
    }

    #[test]
    fn environment_overrides_file_values() {
        let mut config = Config::default();
        apply_env_overrides(
            &mut config,
            env(&[
                ("PARLANCE_PORT", "9000"),
                ("PARLANCE_HOST", "0.0.0.0"),
                ("PARLANCE_LOG_JSON", "1"),
                ("PARLANCE_MAX_SESSION_SECS", "30"),
                ("DEEPGRAM_API_KEY", "dg-secret"),
                ("OPENAI_API_KEY", "sk-secret"),
                ("PARLANCE_LLM_MODEL", "gpt-4o"),
            ]),
        );
        assert_eq!(config.server.port, 9000);
        assert_eq!(config.server.host, IpAddr::V4(Ipv4Addr::UNSPECIFIED));
        assert!(config.logging.json);
        assert_eq!(config.session.max_duration_secs, 30);
        assert_eq!(config.services.speech_api_key, "dg-secret");
        assert_eq!(config.services.llm_api_key, "sk-secret");
        assert_eq!(config.services.llm_model, "gpt-4o");
    }

    #[test]
    fn unparseable_or_empty_overrides_are_ignored() {
        let mut config = Config::default();
        config.services.llm_api_key = "from-file".into();
        apply_env_overrides(
            &mut config,
            env(&[("PARLANCE_PORT", "eighty"), ("OPENAI_API_KEY", "  ")]),
        );
        assert_eq!(config.server.port, 3000);
        assert_eq!(config.services.llm_api_key, "from-file");
    }

    #[test]
    fn debug_output_redacts_keys() {
        let mut config = Config::default();
        config.services.speech_api_key = "dg-secret".into();
        let rendered = format!("{config:?}");
        assert!(!rendered.contains("dg-secret"));
        assert!(rendered.contains("[redacted]"));
        assert!(rendered.contains("<unset>"));
    }
}
