use anyhow::{Context, Result};
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use crate::api::GenerationOptions;
use crate::pairing::DEFAULT_SERVER_PORT;

// --- Client Settings ---

const ENV_PREFIX: &str = "LABPORT_";

/// Runtime settings for the phone-side client, read from `LABPORT_*`
/// environment variables with defaults matching the desktop server.
#[derive(Clone, Debug)]
pub struct ClientConfig {
    pub default_port: u16,
    pub connect_timeout: Duration,
    pub health_timeout: Duration,
    pub request_timeout: Duration,
    pub join_timeout: Duration,
    /// Number of prior messages included in the context window.
    pub context_window: usize,
    pub generation: GenerationOptions,
    pub database_path: PathBuf,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            default_port: DEFAULT_SERVER_PORT,
            connect_timeout: Duration::from_secs(10),
            health_timeout: Duration::from_secs(5),
            request_timeout: Duration::from_secs(300),
            join_timeout: Duration::from_secs(30),
            context_window: 6,
            generation: GenerationOptions::default(),
            database_path: PathBuf::from("labport.sqlite"),
        }
    }
}

impl ClientConfig {
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Builds the configuration from an arbitrary variable source.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let defaults = Self::default();
        let get = |key: &str| lookup(&format!("{}{}", ENV_PREFIX, key));

        let config = Self {
            default_port: parse_or(&get, "DEFAULT_PORT", defaults.default_port)?,
            connect_timeout: secs_or(&get, "CONNECT_TIMEOUT_SECS", defaults.connect_timeout)?,
            health_timeout: secs_or(&get, "HEALTH_TIMEOUT_SECS", defaults.health_timeout)?,
            request_timeout: secs_or(&get, "REQUEST_TIMEOUT_SECS", defaults.request_timeout)?,
            join_timeout: secs_or(&get, "JOIN_TIMEOUT_SECS", defaults.join_timeout)?,
            context_window: parse_or(&get, "CONTEXT_WINDOW", defaults.context_window)?,
            generation: GenerationOptions {
                max_tokens: parse_or(&get, "MAX_TOKENS", defaults.generation.max_tokens)?,
                temperature: parse_or(&get, "TEMPERATURE", defaults.generation.temperature)?,
                top_k: parse_or(&get, "TOP_K", defaults.generation.top_k)?,
                top_p: parse_or(&get, "TOP_P", defaults.generation.top_p)?,
            },
            database_path: get("DB_PATH").map(PathBuf::from).unwrap_or(defaults.database_path),
        };

        if config.default_port == 0 {
            anyhow::bail!("{}DEFAULT_PORT must be a non-zero port", ENV_PREFIX);
        }
        if !(1..=4096).contains(&config.generation.max_tokens) {
            anyhow::bail!("{}MAX_TOKENS must be between 1 and 4096", ENV_PREFIX);
        }
        log::debug!("Loaded client configuration: {:?}", config);
        Ok(config)
    }
}

fn parse_or<T>(get: &impl Fn(&str) -> Option<String>, key: &str, default: T) -> Result<T>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    match get(key) {
        Some(raw) => raw.trim().parse::<T>().context(format!(
            "Failed to parse environment variable '{}{}' (value '{}')",
            ENV_PREFIX, key, raw
        )),
        None => Ok(default),
    }
}

fn secs_or(get: &impl Fn(&str) -> Option<String>, key: &str, default: Duration) -> Result<Duration> {
    parse_or(get, key, default.as_secs()).map(Duration::from_secs)
}
