//! Configuration for EpochKV
//!
//! Centralized connection settings with sensible defaults.

use std::time::Duration;

use crate::error::{EpochError, Result};

/// Settings recognized by a connection
#[derive(Debug, Clone)]
pub struct ConnectionSettings {
    // -------------------------------------------------------------------------
    // Worker Configuration
    // -------------------------------------------------------------------------
    /// Number of worker threads (each owns exactly one engine session)
    pub worker_thread_count: usize,

    /// How long an idle worker waits for work before refreshing (milliseconds)
    pub worker_refresh_interval_ms: u64,

    // -------------------------------------------------------------------------
    // Maintenance Configuration
    // -------------------------------------------------------------------------
    /// Interval between background checkpoint checks (milliseconds)
    pub maintenance_interval_ms: u64,

    /// Number of checkpoints kept on disk
    pub checkpoint_retention: usize,

    // -------------------------------------------------------------------------
    // Engine Configuration
    // -------------------------------------------------------------------------
    /// Initial capacity of the engine's hash index
    pub index_size: usize,

    /// Hybrid log sizing
    pub log: LogSettings,
}

/// Sizing of the engine's in-memory log region
#[derive(Debug, Clone, Copy)]
pub struct LogSettings {
    /// Max records held in memory before the oldest half is evicted to disk
    pub memory_records: usize,

    /// Records at the tail that are still considered mutable
    /// (everything below them is read-only and eligible for compaction)
    pub mutable_records: usize,
}

impl Default for LogSettings {
    fn default() -> Self {
        Self {
            memory_records: 1 << 20,
            mutable_records: 1 << 16,
        }
    }
}

impl Default for ConnectionSettings {
    fn default() -> Self {
        let workers = std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(1);

        Self {
            worker_thread_count: workers.max(1),
            worker_refresh_interval_ms: 10,
            maintenance_interval_ms: 1000,
            checkpoint_retention: 4,
            index_size: 1 << 16,
            log: LogSettings::default(),
        }
    }
}

impl ConnectionSettings {
    /// Create a new settings builder
    pub fn builder() -> ConnectionSettingsBuilder {
        ConnectionSettingsBuilder::default()
    }

    /// Check that every option is usable
    pub fn validate(&self) -> Result<()> {
        if self.worker_thread_count == 0 {
            return Err(EpochError::Config(
                "worker_thread_count must be at least 1".to_string(),
            ));
        }
        if self.worker_refresh_interval_ms == 0 {
            return Err(EpochError::Config(
                "worker_refresh_interval_ms must be positive".to_string(),
            ));
        }
        if self.maintenance_interval_ms == 0 {
            return Err(EpochError::Config(
                "maintenance_interval_ms must be positive".to_string(),
            ));
        }
        if self.checkpoint_retention == 0 {
            return Err(EpochError::Config(
                "checkpoint_retention must be at least 1".to_string(),
            ));
        }
        if self.log.memory_records == 0 {
            return Err(EpochError::Config(
                "log.memory_records must be at least 1".to_string(),
            ));
        }
        if self.log.mutable_records > self.log.memory_records {
            return Err(EpochError::Config(format!(
                "log.mutable_records ({}) exceeds log.memory_records ({})",
                self.log.mutable_records, self.log.memory_records
            )));
        }
        Ok(())
    }

    /// Idle wait bound for workers
    pub fn worker_refresh_interval(&self) -> Duration {
        Duration::from_millis(self.worker_refresh_interval_ms)
    }

    /// Background checkpoint cadence
    pub fn maintenance_interval(&self) -> Duration {
        Duration::from_millis(self.maintenance_interval_ms)
    }
}

/// Builder for ConnectionSettings
#[derive(Default)]
pub struct ConnectionSettingsBuilder {
    settings: ConnectionSettings,
}

impl ConnectionSettingsBuilder {
    /// Set the number of worker threads
    pub fn worker_thread_count(mut self, count: usize) -> Self {
        self.settings.worker_thread_count = count;
        self
    }

    /// Set the idle refresh interval (in milliseconds)
    pub fn worker_refresh_interval_ms(mut self, ms: u64) -> Self {
        self.settings.worker_refresh_interval_ms = ms;
        self
    }

    /// Set the maintenance interval (in milliseconds)
    pub fn maintenance_interval_ms(mut self, ms: u64) -> Self {
        self.settings.maintenance_interval_ms = ms;
        self
    }

    /// Set how many checkpoints are kept on disk
    pub fn checkpoint_retention(mut self, count: usize) -> Self {
        self.settings.checkpoint_retention = count;
        self
    }

    /// Set the initial index capacity
    pub fn index_size(mut self, size: usize) -> Self {
        self.settings.index_size = size;
        self
    }

    /// Set the in-memory record budget of the log
    pub fn memory_records(mut self, count: usize) -> Self {
        self.settings.log.memory_records = count;
        self
    }

    /// Set the size of the mutable tail of the log
    pub fn mutable_records(mut self, count: usize) -> Self {
        self.settings.log.mutable_records = count;
        self
    }

    pub fn build(self) -> ConnectionSettings {
        self.settings
    }
}
