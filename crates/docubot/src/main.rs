// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! docubot server
//!
//! Opens the database, resumes every unfinished instance, creates the
//! configured assistant when `DOCUBOT_SITE_URL` is set, and runs until Ctrl-C.

use std::sync::Arc;

use docubot::crawler::SitemapCrawler;
use docubot::provider::OpenAiProvider;
use docubot::{AssistantRef, Config, register_workflows};
use docubot_core::persistence::SqlitePersistence;
use docubot_sdk::{RetryConfig, RuntimeConfig, WorkflowRuntime};
use tracing::{info, warn};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .init();

    // Load .env file if present
    if let Err(e) = dotenvy::dotenv() {
        warn!("No .env file loaded: {}", e);
    }

    let config = Config::from_env()?;

    info!(
        database_path = %config.database_path.display(),
        model = %config.model,
        crawl_interval_secs = config.crawl_interval.as_secs(),
        "Starting docubot"
    );

    let persistence = Arc::new(SqlitePersistence::from_path(&config.database_path).await?);
    info!("Database ready");

    let provider = Arc::new(OpenAiProvider::new(&config.api_key, &config.openai_base_url)?);
    let crawler = Arc::new(SitemapCrawler::default());

    let runtime_config = RuntimeConfig {
        wait: RetryConfig::fixed(config.poll_interval.as_millis() as u64),
        ..RuntimeConfig::default()
    };

    let builder = WorkflowRuntime::builder()
        .persistence(persistence)
        .config(runtime_config);
    let runtime = register_workflows(
        builder,
        provider,
        crawler,
        &config.model,
        config.crawl_interval,
    )
    .build()?;

    let resumed = runtime.resume_unfinished().await?;
    info!(resumed, "Runtime started");

    if let Some(site_url) = &config.site_url {
        let assistant = AssistantRef::new(runtime.clone(), &config.assistant_id);
        let created = assistant.create(&config.assistant_id, site_url).await?;
        info!(
            assistant_id = %config.assistant_id,
            site_url = %site_url,
            created,
            "Assistant scheduled"
        );
    }

    // Wait for shutdown signal
    tokio::signal::ctrl_c().await?;
    info!("Shutdown signal received");

    runtime.shutdown().await;

    info!("docubot shut down");

    Ok(())
}
