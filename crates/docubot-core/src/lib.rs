// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Docubot Core - Durable Storage
//!
//! This crate owns everything docubot persists to survive a crash: workflow
//! instances and their loop position, step checkpoints, retry attempts, and
//! the versioned application records (assistants, threads) that workflows
//! mutate.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                               docubot                                   │
//! │      (Assistant provisioning, crawl loop, thread turn scheduler)        │
//! └─────────────────────────────────────────────────────────────────────────┘
//!                                    │
//!                                    ▼
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                             docubot-sdk                                 │
//! │    (WorkflowRuntime, retry_idempotent, retry_at_most_once, wait_until)  │
//! └─────────────────────────────────────────────────────────────────────────┘
//!                                    │
//!                                    ▼
//! ┌───────────────────────┐
//! │    docubot-core       │
//! │  (This Crate)         │
//! │  Persistence trait    │
//! └───────────────────────┘
//!           │
//!           ▼
//! ┌───────────────────────┐
//! │        SQLite         │
//! │  (Durable Storage)    │
//! └───────────────────────┘
//! ```
//!
//! # Checkpoint Semantics
//!
//! Checkpoints are keyed by `(instance_id, checkpoint_id)`:
//!
//! 1. **First save**: stores the state and reports that it was inserted
//! 2. **Subsequent saves with the same key**: leave the stored state untouched
//! 3. **Load**: returns the stored state for resume
//!
//! # State Records
//!
//! Application records are JSON documents addressed by `(state_type, state_id)`
//! and carry a `version` counter. Writers read a record, mutate it, and commit
//! with [`Persistence::compare_and_swap_state`], which only applies when the
//! version is unchanged. A checkpoint may be committed in the same transaction
//! so that a mutation is applied exactly once per workflow step.
//!
//! # Instance Status State Machine
//!
//! ```text
//!                     ┌─────────┐
//!                     │ PENDING │
//!                     └────┬────┘
//!                          │ launch
//!                          ▼
//!                     ┌─────────┐   loop   ┌──────────┐
//!          ┌──────────│ RUNNING │─────────►│ SLEEPING │
//!          │          └────┬────┘◄─────────└──────────┘
//!          │               │          wake
//!     complete           fail
//!          │               │
//!          ▼               ▼
//!    ┌───────────┐    ┌────────┐
//!    │ COMPLETED │    │ FAILED │
//!    └───────────┘    └────────┘
//! ```
//!
//! # Modules
//!
//! - [`error`]: Error types with stable error codes
//! - [`migrations`]: Embedded SQLite migrations
//! - [`persistence`]: Persistence trait and the SQLite backend

#![deny(missing_docs)]

/// Error types for Core operations.
pub mod error;

/// Embedded database migrations.
pub mod migrations;

/// Persistence trait, records, and backends.
pub mod persistence;

pub use error::{CoreError, Result};
