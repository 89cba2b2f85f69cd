// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Configuration loading from environment variables.

use std::path::PathBuf;
use std::time::Duration;

use crate::assistant::{DEFAULT_CRAWL_INTERVAL, DEFAULT_MODEL};
use crate::provider::openai::DEFAULT_BASE_URL;

/// docubot configuration
#[derive(Clone)]
pub struct Config {
    /// OpenAI API key
    pub api_key: String,
    /// SQLite database file
    pub database_path: PathBuf,
    /// OpenAI API root
    pub openai_base_url: String,
    /// Model used when creating assistants
    pub model: String,
    /// ID of the assistant created on startup
    pub assistant_id: String,
    /// Site crawled by the startup assistant; none means no assistant is created
    pub site_url: Option<String>,
    /// Delay between crawl iterations
    pub crawl_interval: Duration,
    /// Polling interval for waits
    pub poll_interval: Duration,
}

impl std::fmt::Debug for Config {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Config")
            .field("api_key", &"<redacted>")
            .field("database_path", &self.database_path)
            .field("openai_base_url", &self.openai_base_url)
            .field("model", &self.model)
            .field("assistant_id", &self.assistant_id)
            .field("site_url", &self.site_url)
            .field("crawl_interval", &self.crawl_interval)
            .field("poll_interval", &self.poll_interval)
            .finish()
    }
}

impl Config {
    /// Load configuration from environment variables.
    ///
    /// Required:
    /// - `OPENAI_API_KEY`: API key for the assistant provider
    ///
    /// Optional (with defaults):
    /// - `DOCUBOT_DATABASE_PATH`: SQLite file (default: `.data/docubot.db`)
    /// - `DOCUBOT_OPENAI_BASE_URL`: API root (default: `https://api.openai.com/v1`)
    /// - `DOCUBOT_MODEL`: model for new assistants (default: `gpt-3.5-turbo`)
    /// - `DOCUBOT_ASSISTANT_ID`: ID of the startup assistant (default: `docubot`)
    /// - `DOCUBOT_SITE_URL`: site to crawl; unset disables the startup assistant
    /// - `DOCUBOT_CRAWL_INTERVAL_SECS`: seconds between crawls (default: 3600)
    /// - `DOCUBOT_POLL_INTERVAL_MS`: wait polling interval (default: 500)
    pub fn from_env() -> Result<Self, ConfigError> {
        let api_key = std::env::var("OPENAI_API_KEY")
            .ok()
            .filter(|v| !v.is_empty())
            .ok_or(ConfigError::Missing("OPENAI_API_KEY"))?;

        let database_path = std::env::var("DOCUBOT_DATABASE_PATH")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from(".data/docubot.db"));

        let openai_base_url = std::env::var("DOCUBOT_OPENAI_BASE_URL")
            .unwrap_or_else(|_| DEFAULT_BASE_URL.to_string());

        let model = std::env::var("DOCUBOT_MODEL").unwrap_or_else(|_| DEFAULT_MODEL.to_string());

        let assistant_id =
            std::env::var("DOCUBOT_ASSISTANT_ID").unwrap_or_else(|_| "docubot".to_string());
        if assistant_id.is_empty() {
            return Err(ConfigError::Invalid(
                "DOCUBOT_ASSISTANT_ID",
                "must not be empty",
            ));
        }

        let site_url = std::env::var("DOCUBOT_SITE_URL")
            .ok()
            .filter(|v| !v.is_empty());

        let crawl_interval_secs: u64 = std::env::var("DOCUBOT_CRAWL_INTERVAL_SECS")
            .unwrap_or_else(|_| DEFAULT_CRAWL_INTERVAL.as_secs().to_string())
            .parse()
            .map_err(|_| {
                ConfigError::Invalid("DOCUBOT_CRAWL_INTERVAL_SECS", "must be a positive integer")
            })?;

        let poll_interval_ms: u64 = std::env::var("DOCUBOT_POLL_INTERVAL_MS")
            .unwrap_or_else(|_| "500".to_string())
            .parse()
            .map_err(|_| {
                ConfigError::Invalid("DOCUBOT_POLL_INTERVAL_MS", "must be a positive integer")
            })?;

        if crawl_interval_secs == 0 {
            return Err(ConfigError::Invalid(
                "DOCUBOT_CRAWL_INTERVAL_SECS",
                "must be a positive integer",
            ));
        }
        if poll_interval_ms == 0 {
            return Err(ConfigError::Invalid(
                "DOCUBOT_POLL_INTERVAL_MS",
                "must be a positive integer",
            ));
        }

        Ok(Self {
            api_key,
            database_path,
            openai_base_url,
            model,
            assistant_id,
            site_url,
            crawl_interval: Duration::from_secs(crawl_interval_secs),
            poll_interval: Duration::from_millis(poll_interval_ms),
        })
    }
}

/// Configuration errors
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// A required environment variable is missing.
    #[error("missing required environment variable: {0}")]
    Missing(&'static str),

    /// An environment variable has an invalid value.
    #[error("invalid value for {0}: {1}")]
    Invalid(&'static str, &'static str),
}
