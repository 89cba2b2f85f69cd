// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! docubot keeps an assistant's knowledge base in sync with a crawled site and
//! runs conversation turns against it.
//!
//! - [`assistant`]: provisioning and the periodic crawl loop
//! - [`thread`]: conversation threads and the turn scheduler
//! - [`manifest`]: naming and cleanup of uploaded crawl documents
//! - [`provider`]: the remote assistant API
//! - [`crawler`]: the site crawler
//! - [`document`]: rendering of crawled pages to PDF
//!
//! Everything runs as durable instances of a
//! [`WorkflowRuntime`](docubot_sdk::WorkflowRuntime); see
//! [`register_workflows`].

pub mod assistant;
pub mod config;
pub mod crawler;
pub mod document;
pub mod manifest;
pub mod provider;
pub mod thread;

use std::sync::Arc;
use std::time::Duration;

use docubot_sdk::WorkflowRuntimeBuilder;

pub use assistant::{AssistantRecord, AssistantRef};
pub use config::{Config, ConfigError};
pub use thread::{QueryRecord, ThreadRecord, ThreadRef};

use crate::assistant::{CrawlLoopWorkflow, ProvisionWorkflow};
use crate::crawler::Crawler;
use crate::provider::AssistantProvider;
use crate::thread::{CreateThreadWorkflow, QueryWorkflow};

/// Register every docubot workflow on `builder`.
pub fn register_workflows(
    builder: WorkflowRuntimeBuilder,
    provider: Arc<dyn AssistantProvider>,
    crawler: Arc<dyn Crawler>,
    model: &str,
    crawl_interval: Duration,
) -> WorkflowRuntimeBuilder {
    builder
        .workflow(ProvisionWorkflow::new(provider.clone(), model))
        .workflow(CrawlLoopWorkflow::new(provider.clone(), crawler).with_interval(crawl_interval))
        .workflow(CreateThreadWorkflow::new(provider.clone()))
        .workflow(QueryWorkflow::new(provider))
}
