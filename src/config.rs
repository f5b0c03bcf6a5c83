use crate::error::EngineError;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Runtime configuration for an engine instance.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub max_batch_size: usize,
    /// Estimated row count above which reads switch to cursor pagination.
    pub cursor_pagination_threshold: u64,
    pub max_result_rows: usize,
    pub default_page_size: usize,
    pub deep_offset_warning_rows: u64,
    pub schema_load_timeout_ms: u64,
    pub statement_timeout_ms: u64,
    pub backup_timeout_ms: u64,
    /// How long a write may wait for its database's queue slot.
    pub queue_wait_timeout_ms: u64,
    pub backup_dir: PathBuf,
    /// Stores at or below this size are backed up whole instead of per table.
    pub whole_database_backup_max_bytes: u64,
    pub restore_journal_capacity: usize,
    pub foreign_key_probes: bool,
    pub check_constraint_probes: bool,
    /// Tables with more columns than this get projection-narrowing advice.
    pub wide_table_columns: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_batch_size: 1000,
            cursor_pagination_threshold: 1000,
            max_result_rows: 1000,
            default_page_size: 100,
            deep_offset_warning_rows: 10_000,
            schema_load_timeout_ms: 5_000,
            statement_timeout_ms: 10_000,
            backup_timeout_ms: 30_000,
            queue_wait_timeout_ms: 30_000,
            backup_dir: std::env::temp_dir().join("storebridge-backups"),
            whole_database_backup_max_bytes: 8 * 1024 * 1024,
            restore_journal_capacity: 64,
            foreign_key_probes: true,
            check_constraint_probes: true,
            wide_table_columns: 12,
        }
    }
}

impl EngineConfig {
    pub fn development() -> Self {
        Self {
            schema_load_timeout_ms: 1_000,
            statement_timeout_ms: 2_000,
            backup_timeout_ms: 5_000,
            queue_wait_timeout_ms: 5_000,
            backup_dir: std::env::temp_dir().join("storebridge-dev-backups"),
            ..Self::default()
        }
    }

    /// Every probe on, per-table backups only.
    pub fn strict() -> Self {
        Self {
            foreign_key_probes: true,
            check_constraint_probes: true,
            whole_database_backup_max_bytes: 0,
            ..Self::default()
        }
    }

    pub fn with_backup_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.backup_dir = dir.into();
        self
    }

    pub fn from_json_file(path: &Path) -> Result<Self, EngineError> {
        let bytes = std::fs::read(path)?;
        let config: EngineConfig =
            serde_json::from_slice(&bytes).map_err(|e| EngineError::Decode(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), EngineError> {
        let invalid = |message: &str| {
            Err(EngineError::InvalidConfig {
                message: message.to_string(),
            })
        };
        if self.max_batch_size == 0 {
            return invalid("max_batch_size must be > 0");
        }
        if self.max_result_rows == 0 {
            return invalid("max_result_rows must be > 0");
        }
        if self.default_page_size == 0 || self.default_page_size > self.max_result_rows {
            return invalid("default_page_size must be in 1..=max_result_rows");
        }
        if self.schema_load_timeout_ms == 0
            || self.statement_timeout_ms == 0
            || self.backup_timeout_ms == 0
            || self.queue_wait_timeout_ms == 0
        {
            return invalid("timeouts must be > 0");
        }
        if self.restore_journal_capacity == 0 {
            return invalid("restore_journal_capacity must be > 0");
        }
        if self.backup_dir.as_os_str().is_empty() {
            return invalid("backup_dir must not be empty");
        }
        Ok(())
    }

    pub fn schema_load_timeout(&self) -> Duration {
        Duration::from_millis(self.schema_load_timeout_ms)
    }

    pub fn statement_timeout(&self) -> Duration {
        Duration::from_millis(self.statement_timeout_ms)
    }

    pub fn backup_timeout(&self) -> Duration {
        Duration::from_millis(self.backup_timeout_ms)
    }

    pub fn queue_wait_timeout(&self) -> Duration {
        Duration::from_millis(self.queue_wait_timeout_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::EngineConfig;
    use crate::error::EngineError;

    #[test]
    fn defaults_are_valid() {
        let config = EngineConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.max_batch_size, 1000);
        assert_eq!(config.cursor_pagination_threshold, 1000);
        assert!(EngineConfig::development().validate().is_ok());
        assert_eq!(EngineConfig::strict().whole_database_backup_max_bytes, 0);
    }

    #[test]
    fn zero_limits_are_rejected() {
        let config = EngineConfig {
            max_batch_size: 0,
            ..EngineConfig::default()
        };
        assert!(matches!(
            config.validate(),
            Err(EngineError::InvalidConfig { .. })
        ));
        let config = EngineConfig {
            default_page_size: 5_000,
            ..EngineConfig::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn partial_json_fills_in_defaults() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("engine.json");
        std::fs::write(&path, r#"{ "max_batch_size": 250, "foreign_key_probes": false }"#)
            .expect("write");
        let config = EngineConfig::from_json_file(&path).expect("load");
        assert_eq!(config.max_batch_size, 250);
        assert!(!config.foreign_key_probes);
        assert_eq!(config.max_result_rows, 1000);
    }
}
