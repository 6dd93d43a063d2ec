use std::env;
use std::path::PathBuf;
use std::time::Duration;

use reqwest::Url;
use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    Development,
    Production,
}

/// Compute unit configuration. `from_env` fails fast on a missing or
/// malformed required option; optional knobs fall back to the defaults
/// below.
#[derive(Debug, Clone)]
pub struct CuConfig {
    pub sequencer_url: Url,
    pub gateway_url: Url,
    pub db_path: PathBuf,
    pub db_max_listeners: usize,
    /// Aggregate byte bound over cached (compressed) process memory.
    pub process_memory_cache_max_size: usize,
    pub process_memory_cache_ttl: Duration,
    /// Block height above which the legacy Load transform is sunset.
    pub ao_load_max_block: u64,
    /// Evaluations between periodic checkpoint publishes; 0 disables the
    /// periodic path (eviction-driven publishes always remain).
    pub checkpoint_interval: u64,
    pub mode: Mode,
    pub port: u16,
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("required option {0} is not set")]
    Missing(&'static str),
    #[error("option {name} has invalid value '{value}': {reason}")]
    Invalid {
        name: &'static str,
        value: String,
        reason: String,
    },
}

impl Default for CuConfig {
    fn default() -> Self {
        Self {
            sequencer_url: Url::parse("http://localhost:4003").unwrap(),
            gateway_url: Url::parse("http://localhost:4000").unwrap(),
            db_path: PathBuf::from("./ao-cache"),
            db_max_listeners: 100,
            process_memory_cache_max_size: 1_000_000_000,
            process_memory_cache_ttl: Duration::from_secs(60 * 60),
            ao_load_max_block: 1_262_519,
            checkpoint_interval: 0,
            mode: Mode::Development,
            port: 6363,
        }
    }
}

impl CuConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        let defaults = CuConfig::default();
        Ok(CuConfig {
            sequencer_url: required_url("SEQUENCER_URL")?,
            gateway_url: required_url("GATEWAY_URL")?,
            db_path: PathBuf::from(required("DB_PATH")?),
            db_max_listeners: optional("DB_MAX_LISTENERS", defaults.db_max_listeners)?,
            process_memory_cache_max_size: optional(
                "PROCESS_MEMORY_CACHE_MAX_SIZE",
                defaults.process_memory_cache_max_size,
            )?,
            process_memory_cache_ttl: Duration::from_millis(optional(
                "PROCESS_MEMORY_CACHE_TTL",
                defaults.process_memory_cache_ttl.as_millis() as u64,
            )?),
            ao_load_max_block: optional("AO_LOAD_MAX_BLOCK", defaults.ao_load_max_block)?,
            checkpoint_interval: optional("CHECKPOINT_INTERVAL", defaults.checkpoint_interval)?,
            mode: parse_mode(env::var("MODE").ok().as_deref())?,
            port: optional("PORT", defaults.port)?,
        })
    }
}

fn required(name: &'static str) -> Result<String, ConfigError> {
    env::var(name).map_err(|_| ConfigError::Missing(name))
}

fn required_url(name: &'static str) -> Result<Url, ConfigError> {
    let value = required(name)?;
    Url::parse(&value).map_err(|e| ConfigError::Invalid {
        name,
        value,
        reason: e.to_string(),
    })
}

fn optional<T: std::str::FromStr>(name: &'static str, default: T) -> Result<T, ConfigError>
where
    T::Err: std::fmt::Display,
{
    match env::var(name) {
        Err(_) => Ok(default),
        Ok(value) => value.parse().map_err(|e: T::Err| ConfigError::Invalid {
            name,
            value,
            reason: e.to_string(),
        }),
    }
}

fn parse_mode(raw: Option<&str>) -> Result<Mode, ConfigError> {
    match raw {
        None | Some("development") => Ok(Mode::Development),
        Some("production") => Ok(Mode::Production),
        Some(other) => Err(ConfigError::Invalid {
            name: "MODE",
            value: other.to_string(),
            reason: "expected 'development' or 'production'".into(),
        }),
    }
}
