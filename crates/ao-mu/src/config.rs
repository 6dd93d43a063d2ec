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

/// Messenger unit configuration; `from_env` fails fast on missing or
/// malformed required options.
#[derive(Debug, Clone)]
pub struct MuConfig {
    pub cu_url: Url,
    pub sequencer_url: Url,
    /// Keyfile for the MU's signing wallet.
    pub wallet_path: PathBuf,
    pub mode: Mode,
    pub port: u16,
    /// Bound on crank recursion depth.
    pub crank_depth_limit: u32,
    pub monitor_interval: Duration,
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

impl Default for MuConfig {
    fn default() -> Self {
        Self {
            cu_url: Url::parse("http://localhost:6363").unwrap(),
            sequencer_url: Url::parse("http://localhost:4003").unwrap(),
            wallet_path: PathBuf::from("./wallet.json"),
            mode: Mode::Development,
            port: 3004,
            crank_depth_limit: 10,
            monitor_interval: Duration::from_secs(1),
        }
    }
}

impl MuConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        let defaults = MuConfig::default();
        Ok(MuConfig {
            cu_url: required_url("CU_URL")?,
            sequencer_url: required_url("SEQUENCER_URL")?,
            wallet_path: PathBuf::from(required("MU_WALLET")?),
            mode: parse_mode(env::var("MODE").ok().as_deref())?,
            port: optional("PORT", defaults.port)?,
            crank_depth_limit: optional("CRANK_DEPTH_LIMIT", defaults.crank_depth_limit)?,
            monitor_interval: Duration::from_millis(optional(
                "MONITOR_INTERVAL_MS",
                defaults.monitor_interval.as_millis() as u64,
            )?),
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

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_bound_the_crank() {
        let cfg = MuConfig::default();
        assert!(cfg.crank_depth_limit > 0);
        assert_eq!(cfg.monitor_interval, Duration::from_secs(1));
    }

    #[test]
    fn mode_rejects_unknown_values() {
        assert!(parse_mode(Some("staging")).is_err());
        assert_eq!(parse_mode(None).unwrap(), Mode::Development);
    }
}
