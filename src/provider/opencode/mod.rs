//! Providers for the opencode agent runtime

pub mod cli;
pub mod runner;
pub mod storage;

pub use cli::CliProvider;
pub use runner::{RunConfig, Runner, StreamEvent};
pub use storage::StorageProvider;

use chrono::{DateTime, Duration, Utc};

use crate::agent::Status;

/// Activity newer than this means the session is running
pub const RUNNING_WINDOW: Duration = Duration::seconds(60);

/// Activity newer than this (but older than the running window) means idle
pub const IDLE_WINDOW: Duration = Duration::minutes(30);

/// Error parts older than this no longer mark the session errored
pub const ERROR_WINDOW: Duration = Duration::minutes(5);

/// Assumed model input window for context utilization estimates
pub const CONTEXT_WINDOW_TOKENS: u64 = 200_000;

/// Rough bytes-per-token ratio used for token estimates
pub const BYTES_PER_TOKEN: u64 = 4;

/// Time-window status rule shared by both opencode providers
pub(crate) fn status_from_activity(last_activity: DateTime<Utc>, now: DateTime<Utc>) -> Status {
    let delta = now - last_activity;
    if delta < RUNNING_WINDOW {
        Status::Running
    } else if delta < IDLE_WINDOW {
        Status::Idle
    } else {
        Status::Completed
    }
}

/// Per-1k-token cost rates
#[derive(Debug, Clone, Copy)]
pub struct TokenCosts {
    pub input: f64,
    pub output: f64,
}

impl Default for TokenCosts {
    fn default() -> Self {
        Self {
            input: 0.003,
            output: 0.015,
        }
    }
}
