use anyhow::{Context, Result};
use ::config::{Config, Environment};
use serde::Deserialize;

use crate::assemble::PersistMode;

pub const ENV_PREFIX: &str = "SCRAPEMARK";

/// Runtime settings, read from `SCRAPEMARK_*` environment variables.
///
/// The scraping and summarization keys also fall back to the unprefixed
/// `SPIDER_API_KEY` / `OPENAI_API_KEY` variables.
#[derive(Debug, Clone, Deserialize)]
pub struct Settings {
    #[serde(default = "default_db_path")]
    pub db_path: String,
    #[serde(default = "default_bind")]
    pub bind: String,
    #[serde(default)]
    pub persist_mode: PersistMode,

    #[serde(default)]
    pub spider_api_key: Option<String>,

    #[serde(default)]
    pub openai_api_key: Option<String>,
    #[serde(default = "default_openai_base_url")]
    pub openai_base_url: String,
    #[serde(default = "default_openai_model")]
    pub openai_model: String,
    #[serde(default = "default_openai_temperature")]
    pub openai_temperature: f32,
    #[serde(default = "default_timeout_secs")]
    pub openai_timeout_secs: u64,

    /// Base URL of the auth service (`<auth_url>/user` resolves a bearer token).
    #[serde(default)]
    pub auth_url: Option<String>,
    #[serde(default)]
    pub auth_api_key: Option<String>,
    #[serde(default = "default_timeout_secs")]
    pub auth_timeout_secs: u64,
}

fn default_db_path() -> String {
    "data/scrapemark.sqlite".into()
}

fn default_bind() -> String {
    "127.0.0.1:8080".into()
}

fn default_openai_base_url() -> String {
    "https://api.openai.com/v1".into()
}

fn default_openai_model() -> String {
    "gpt-4o-mini".into()
}

fn default_openai_temperature() -> f32 {
    0.7
}

fn default_timeout_secs() -> u64 {
    30
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            db_path: default_db_path(),
            bind: default_bind(),
            persist_mode: PersistMode::default(),
            spider_api_key: None,
            openai_api_key: None,
            openai_base_url: default_openai_base_url(),
            openai_model: default_openai_model(),
            openai_temperature: default_openai_temperature(),
            openai_timeout_secs: default_timeout_secs(),
            auth_url: None,
            auth_api_key: None,
            auth_timeout_secs: default_timeout_secs(),
        }
    }
}

impl Settings {
    pub fn load() -> Result<Self> {
        let config = Config::builder()
            .add_source(Environment::with_prefix(ENV_PREFIX))
            .build()
            .context("Failed to read settings from environment")?;
        let mut settings = Self::from_config(config)?;
        settings.spider_api_key = non_empty(settings.spider_api_key)
            .or_else(|| non_empty(std::env::var("SPIDER_API_KEY").ok()));
        settings.openai_api_key = non_empty(settings.openai_api_key)
            .or_else(|| non_empty(std::env::var("OPENAI_API_KEY").ok()));
        Ok(settings)
    }

    pub fn from_config(config: Config) -> Result<Self> {
        config
            .try_deserialize()
            .context("Invalid scrapemark settings")
    }
}

fn non_empty(value: Option<String>) -> Option<String> {
    value.filter(|v| !v.trim().is_empty())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_when_nothing_is_set() {
        let settings = Settings::from_config(Config::builder().build().unwrap()).unwrap();
        assert_eq!(settings.db_path, "data/scrapemark.sqlite");
        assert_eq!(settings.persist_mode, PersistMode::BestEffort);
        assert_eq!(settings.openai_model, "gpt-4o-mini");
        assert!(settings.openai_api_key.is_none());
    }

    #[test]
    fn overrides_are_applied() {
        let config = Config::builder()
            .set_override("persist_mode", "atomic")
            .unwrap()
            .set_override("openai_model", "gpt-4o")
            .unwrap()
            .set_override("openai_temperature", 0.2)
            .unwrap()
            .build()
            .unwrap();
        let settings = Settings::from_config(config).unwrap();
        assert_eq!(settings.persist_mode, PersistMode::Atomic);
        assert_eq!(settings.openai_model, "gpt-4o");
        assert!((settings.openai_temperature - 0.2).abs() < f32::EPSILON);
    }

    #[test]
    fn blank_keys_count_as_missing() {
        assert_eq!(non_empty(Some("  ".into())), None);
        assert_eq!(non_empty(Some("sk".into())), Some("sk".into()));
    }
}
