//! Configuration constants and connection settings for the loader
//!
//! This module centralizes all tunable parameters used throughout the
//! application, plus the connection settings handed to the pool.

use derive_builder::Builder;
use std::time::Duration;

use crate::db::Backend;

// ============================================================================
// Connection Pool Configuration
// ============================================================================

pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(100);

/// Number of attempts made to open a single connection before giving up
pub const CONNECT_RETRIES: u32 = 5;

pub const DEFAULT_MAX_CONNECTIONS: usize = 5;

/// How long SQLite waits on a locked database before reporting busy
pub const SQLITE_BUSY_TIMEOUT: Duration = Duration::from_secs(30);

// ============================================================================
// Worker Configuration
// ============================================================================

/// Retries after the first attempt, so a statement runs at most
/// `DEFAULT_MAX_RETRIES + 1` times
pub const DEFAULT_MAX_RETRIES: u32 = 5;

/// Base delay between statement attempts, doubled on each retry
pub const RETRY_BASE_DELAY: Duration = Duration::from_millis(100);

/// Upper bound for the doubled retry delay
pub const RETRY_MAX_DELAY: Duration = Duration::from_secs(10);

/// Rows per multi-row INSERT, and surrogate-key span per merge statement
pub const DEFAULT_BATCH_SIZE: usize = 500;

// ============================================================================
// Table Layout
// ============================================================================

/// Surrogate auto-increment key carried by every staging table
pub const ENTRY_COLUMN: &str = "entry";

pub const STAGE_PREFIX: &str = "stage_";

/// Name of the staging table that lands rows for `table`
pub fn stage_table_name(table: &str) -> String {
    format!("{STAGE_PREFIX}{table}")
}

/// Connection parameters for every connection the pool opens
#[derive(Debug, Clone, Builder)]
pub struct ConnectionConfig {
    #[builder(default = "Backend::Postgres")]
    pub backend: Backend,
    #[builder(setter(into), default = "\"localhost\".to_string()")]
    pub host: String,
    #[builder(default)]
    pub port: Option<u16>,
    #[builder(setter(into), default)]
    pub username: String,
    #[builder(setter(into), default)]
    pub password: String,
    /// Database name, or the database file path for SQLite
    #[builder(setter(into))]
    pub database: String,
    #[builder(default = "DEFAULT_MAX_CONNECTIONS")]
    pub max_connections: usize,
}

/// Bounded retry behaviour shared by connect and execute
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub base_delay: Duration,
}

impl RetryPolicy {
    pub fn new(max_retries: u32) -> Self {
        Self {
            max_retries,
            base_delay: RETRY_BASE_DELAY,
        }
    }

    /// A policy that retries immediately
    #[cfg(test)]
    pub fn immediate(max_retries: u32) -> Self {
        Self {
            max_retries,
            base_delay: Duration::ZERO,
        }
    }

    /// Delay to sleep before retry number `attempt` (1-based)
    pub fn delay_for(&self, attempt: u32) -> Duration {
        if self.base_delay.is_zero() {
            return Duration::ZERO;
        }
        let factor = 2u32.saturating_pow(attempt.saturating_sub(1));
        self.base_delay.saturating_mul(factor).min(RETRY_MAX_DELAY)
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_RETRIES)
    }
}

/// Per-run settings for the insertion pipeline
#[derive(Debug, Clone, Builder)]
pub struct LoadConfig {
    #[builder(default = "DEFAULT_BATCH_SIZE")]
    pub batch_size: usize,
    #[builder(default)]
    pub retry: RetryPolicy,
}

impl Default for LoadConfig {
    fn default() -> Self {
        Self {
            batch_size: DEFAULT_BATCH_SIZE,
            retry: RetryPolicy::default(),
        }
    }
}
