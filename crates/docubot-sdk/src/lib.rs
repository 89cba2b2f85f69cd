// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Docubot SDK - Durable workflow primitives on top of docubot-core.
//!
//! Workflows run inside a [`WorkflowRuntime`] and perform every side effect
//! through a [`WorkflowContext`], which memoizes results in checkpoints so
//! that a crashed or retried iteration replays instead of repeating work.
//!
//! # Features
//!
//! - **Idempotent steps**: [`WorkflowContext::retry_idempotent`] retries with
//!   backoff and memoizes the successful result
//! - **At-most-once steps**: [`WorkflowContext::retry_at_most_once`] never
//!   re-runs a call that may already have taken effect
//! - **Waits**: [`WorkflowContext::wait_until`] polls a predicate without
//!   holding a thread
//! - **Periodic loops**: a workflow returns [`Control::Loop`] and the runtime
//!   persists its next iteration and wake time
//! - **Versioned records**: [`StateRef`] reads and writes JSON records with
//!   compare-and-swap, and `write_once` ties a mutation to a checkpoint
//!
//! # Quick Start
//!
//! ```ignore
//! use docubot_sdk::{Control, StepError, Workflow, WorkflowContext, WorkflowRuntime};
//!
//! struct Counter;
//!
//! #[async_trait::async_trait]
//! impl Workflow for Counter {
//!     fn kind(&self) -> &'static str {
//!         "counter"
//!     }
//!
//!     async fn run(&self, ctx: WorkflowContext, _input: serde_json::Value) -> docubot_sdk::Result<Control> {
//!         let n: u64 = ctx
//!             .retry_idempotent("fetch", || async { Ok::<_, StepError>(42) })
//!             .await?;
//!         tracing::info!(n, iteration = ctx.iteration(), "fetched");
//!         Ok(Control::loop_after(std::time::Duration::from_secs(60)))
//!     }
//! }
//!
//! let runtime = WorkflowRuntime::builder()
//!     .persistence(persistence)
//!     .workflow(Counter)
//!     .build()?;
//! runtime.schedule("counter", "counter-1", &()).await?;
//! ```

#![deny(missing_docs)]

mod context;
mod error;
mod runtime;
mod state;
mod types;

pub use context::WorkflowContext;
pub use error::{Result, SdkError, StepError};
pub use runtime::{Control, RuntimeConfig, Workflow, WorkflowRuntime, WorkflowRuntimeBuilder};
pub use state::StateRef;
pub use types::{InstanceStatus, RetryConfig, RetryStrategy};

// Re-export the storage crate for users wiring up persistence.
pub use docubot_core;
