//! Configuration options for the index compactor.

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Tunables for a table compaction run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CompactorOptions {
    /// Number of source files read concurrently, for both the tenant
    /// prefetch pool and the per-merge ingestion pool.
    /// Default: 50
    pub read_concurrency: usize,

    /// Number of entries handed to the writer per batch when streaming
    /// a source file.
    /// Default: 10000
    pub batch_size: usize,

    /// Minimum age of a single compacted file before it is recreated to
    /// reclaim free pages.
    /// Default: 12 hours
    pub recreate_older_than: Duration,

    /// Upper bound on the bytes copied in one transaction during recreation.
    /// Default: 100MB
    pub max_recreate_txn_bytes: usize,
}

impl Default for CompactorOptions {
    fn default() -> Self {
        Self {
            read_concurrency: 50,
            batch_size: 10_000,
            recreate_older_than: Duration::from_secs(12 * 60 * 60),
            max_recreate_txn_bytes: 100 * 1024 * 1024, // 100MB
        }
    }
}

impl CompactorOptions {
    /// Creates a new CompactorOptions with default values.
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the number of concurrent readers.
    pub fn read_concurrency(mut self, value: usize) -> Self {
        self.read_concurrency = value;
        self
    }

    /// Sets the reader batch size.
    pub fn batch_size(mut self, size: usize) -> Self {
        self.batch_size = size;
        self
    }

    /// Sets the recreation age threshold.
    pub fn recreate_older_than(mut self, age: Duration) -> Self {
        self.recreate_older_than = age;
        self
    }

    /// Sets the recreation transaction size cap.
    pub fn max_recreate_txn_bytes(mut self, size: usize) -> Self {
        self.max_recreate_txn_bytes = size;
        self
    }

    /// Parses options from JSON. Missing fields take their defaults.
    pub fn from_json(json: &str) -> crate::Result<Self> {
        let options: Self = serde_json::from_str(json)?;
        options.validate()?;
        Ok(options)
    }

    /// Validates the options and returns an error if any are invalid.
    pub fn validate(&self) -> crate::Result<()> {
        if self.read_concurrency == 0 {
            return Err(crate::Error::invalid_argument("read_concurrency must be > 0"));
        }
        if self.batch_size == 0 {
            return Err(crate::Error::invalid_argument("batch_size must be > 0"));
        }
        if self.max_recreate_txn_bytes == 0 {
            return Err(crate::Error::invalid_argument("max_recreate_txn_bytes must be > 0"));
        }
        Ok(())
    }
}

/// Schema period a table belongs to.
///
/// Tables are named `<index_prefix><unix_secs / period_secs>`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeriodConfig {
    /// First day the period applies to, as `YYYY-MM-DD`.
    pub from: String,

    /// Prefix shared by every table of this period.
    pub index_prefix: String,

    /// Time span covered by one table.
    #[serde(default = "default_period")]
    pub period: Duration,
}

fn default_period() -> Duration {
    Duration::from_secs(24 * 60 * 60)
}

impl Default for PeriodConfig {
    fn default() -> Self {
        Self { from: "1970-01-01".to_string(), index_prefix: "index_".to_string(), period: default_period() }
    }
}

impl PeriodConfig {
    /// Creates a period config with the default 24h table period.
    pub fn new(from: impl Into<String>, index_prefix: impl Into<String>) -> Self {
        Self { from: from.into(), index_prefix: index_prefix.into(), period: default_period() }
    }

    /// Validates the period config.
    pub fn validate(&self) -> crate::Result<()> {
        if self.period.as_secs() == 0 {
            return Err(crate::Error::invalid_argument("period must be at least one second"));
        }
        let parts: Vec<&str> = self.from.split('-').collect();
        let well_formed = parts.len() == 3
            && parts[0].len() == 4
            && parts[1].len() == 2
            && parts[2].len() == 2
            && parts.iter().all(|p| p.bytes().all(|b| b.is_ascii_digit()));
        if !well_formed {
            return Err(crate::Error::invalid_argument(format!(
                "period start {:?} is not formatted as YYYY-MM-DD",
                self.from
            )));
        }
        Ok(())
    }

    /// Extracts the table number from a table name of this period.
    pub fn table_number(&self, table_name: &str) -> Option<u64> {
        table_name.strip_prefix(&self.index_prefix)?.parse().ok()
    }
}
