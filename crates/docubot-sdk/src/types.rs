// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! High-level types for the SDK.

use std::fmt;
use std::str::FromStr;
use std::time::Duration;

/// Instance status as stored in the `instances` table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InstanceStatus {
    /// Instance is created but not yet started
    Pending,
    /// Instance is currently executing
    Running,
    /// Looping instance is waiting for its next iteration
    Sleeping,
    /// Instance finished successfully
    Completed,
    /// Instance finished with an error
    Failed,
}

impl InstanceStatus {
    /// Database representation.
    pub fn as_str(&self) -> &'static str {
        match self {
            InstanceStatus::Pending => "pending",
            InstanceStatus::Running => "running",
            InstanceStatus::Sleeping => "sleeping",
            InstanceStatus::Completed => "completed",
            InstanceStatus::Failed => "failed",
        }
    }

    /// Completed or failed.
    pub fn is_terminal(&self) -> bool {
        matches!(self, InstanceStatus::Completed | InstanceStatus::Failed)
    }
}

impl fmt::Display for InstanceStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for InstanceStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(InstanceStatus::Pending),
            "running" => Ok(InstanceStatus::Running),
            "sleeping" => Ok(InstanceStatus::Sleeping),
            "completed" => Ok(InstanceStatus::Completed),
            "failed" => Ok(InstanceStatus::Failed),
            other => Err(format!("unknown instance status '{}'", other)),
        }
    }
}

// ============================================================================
// Retry Configuration
// ============================================================================

/// Retry strategy for durable steps.
///
/// Determines how delay between retry attempts is calculated.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RetryStrategy {
    /// Exponential backoff: delay * 2^(attempt-1), capped at `max_delay_ms`
    ///
    /// First retry: delay * 1
    /// Second retry: delay * 2
    /// Third retry: delay * 4
    /// ...
    #[default]
    ExponentialBackoff,
    /// Same delay before every attempt
    Fixed,
}

/// Configuration for retry and polling behavior.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryConfig {
    /// Maximum number of retry attempts. `None` retries forever.
    pub max_retries: Option<u32>,
    /// Base delay between retries in milliseconds.
    pub delay_ms: u64,
    /// Upper bound for a single delay in milliseconds.
    pub max_delay_ms: u64,
    /// Retry strategy for calculating delays.
    pub strategy: RetryStrategy,
}

impl RetryConfig {
    /// Create a new retry configuration with a 60 second delay cap.
    pub fn new(max_retries: Option<u32>, delay_ms: u64, strategy: RetryStrategy) -> Self {
        Self {
            max_retries,
            delay_ms,
            max_delay_ms: 60_000,
            strategy,
        }
    }

    /// Unbounded polling on a fixed interval.
    pub fn fixed(delay_ms: u64) -> Self {
        Self {
            max_retries: None,
            delay_ms,
            max_delay_ms: delay_ms,
            strategy: RetryStrategy::Fixed,
        }
    }

    /// Set the delay cap.
    pub fn with_max_delay_ms(mut self, max_delay_ms: u64) -> Self {
        self.max_delay_ms = max_delay_ms;
        self
    }

    /// Calculate delay for a given attempt (1-indexed).
    ///
    /// Returns the duration to wait before the given retry attempt.
    /// Attempt 1 is the first retry (after the initial failure).
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let delay = match self.strategy {
            RetryStrategy::ExponentialBackoff => {
                let multiplier = 2u64.saturating_pow(attempt.saturating_sub(1));
                self.delay_ms.saturating_mul(multiplier)
            }
            RetryStrategy::Fixed => self.delay_ms,
        };
        Duration::from_millis(delay.min(self.max_delay_ms))
    }

    /// Whether the given retry attempt (1-indexed) is within budget.
    pub fn allows_attempt(&self, attempt: u32) -> bool {
        self.max_retries.is_none_or(|max| attempt <= max)
    }
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: Some(5),
            delay_ms: 1000,
            max_delay_ms: 60_000,
            strategy: RetryStrategy::default(),
        }
    }
}
