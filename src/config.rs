//! Configuration for the replicator.
//!
//! Configuration is passed to [`NodeRegistry::new()`](crate::coordinator::NodeRegistry::new)
//! and can be constructed programmatically or deserialized from YAML/JSON.
//! Per-node settings (source, sink, projection, link field) live in the
//! control store, not here.
//!
//! # Quick Start
//!
//! ```rust
//! use index_replicator::config::{EngineConfig, TailConfig};
//!
//! let config = EngineConfig {
//!     tail: TailConfig {
//!         max_batch: 500,
//!         ..Default::default()
//!     },
//!     ..Default::default()
//! };
//! assert_eq!(config.tail.min_gap_ms, 150);
//! ```
//!
//! # Configuration Structure
//!
//! ```text
//! EngineConfig
//! ├── registry: RegistryConfig   # Control-store polling
//! ├── scan: ScanConfig           # Initial copy paging and index settings
//! ├── tail: TailConfig           # Adaptive flush thresholds
//! └── control: ControlConfig     # SQLite control store
//! ```
//!
//! # YAML Example
//!
//! ```yaml
//! registry:
//!   poll_interval: "15s"
//! scan:
//!   page_size: 1000
//!   relax_index_settings: true
//! tail:
//!   max_batch: 1000
//!   min_gap_ms: 150
//!   max_age_ms: 3500
//! control:
//!   sqlite_path: "/var/lib/index-replicator/sync_nodes.db"
//! ```

use crate::sink::IndexSettings;
use serde::{Deserialize, Serialize};
use std::time::Duration;

// ═══════════════════════════════════════════════════════════════════════════════
// Top-level config
// ═══════════════════════════════════════════════════════════════════════════════

/// The top-level config object.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EngineConfig {
    #[serde(default)]
    pub registry: RegistryConfig,

    #[serde(default)]
    pub scan: ScanConfig,

    #[serde(default)]
    pub tail: TailConfig,

    #[serde(default)]
    pub control: ControlConfig,
}

impl EngineConfig {
    /// Create a config for testing: fast polling, in-memory control store.
    pub fn for_testing() -> Self {
        Self {
            registry: RegistryConfig {
                poll_interval: "50ms".to_string(),
            },
            scan: ScanConfig::default(),
            tail: TailConfig::default(),
            control: ControlConfig::in_memory(),
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// RegistryConfig
// ═══════════════════════════════════════════════════════════════════════════════

/// Node registry polling.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegistryConfig {
    /// Interval between control-store polls (humantime, e.g. "15s").
    #[serde(default = "default_poll_interval")]
    pub poll_interval: String,
}

fn default_poll_interval() -> String {
    "15s".to_string()
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            poll_interval: default_poll_interval(),
        }
    }
}

impl RegistryConfig {
    /// Parse the poll_interval string to a Duration.
    pub fn poll_interval_duration(&self) -> Duration {
        humantime::parse_duration(&self.poll_interval).unwrap_or(Duration::from_secs(15))
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// ScanConfig
// ═══════════════════════════════════════════════════════════════════════════════

/// Initial copy settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScanConfig {
    /// Documents per page (and per bulk write).
    #[serde(default = "default_page_size")]
    pub page_size: usize,

    /// Relax refresh/replicas while copying a fresh index.
    #[serde(default = "default_true")]
    pub relax_index_settings: bool,

    #[serde(default = "default_bulk_refresh_interval")]
    pub bulk_refresh_interval: String,

    #[serde(default)]
    pub bulk_replicas: u32,

    /// Restored when the scan completes.
    #[serde(default = "default_normal_refresh_interval")]
    pub normal_refresh_interval: String,

    #[serde(default = "default_normal_replicas")]
    pub normal_replicas: u32,
}

fn default_page_size() -> usize {
    1000
}

fn default_true() -> bool {
    true
}

fn default_bulk_refresh_interval() -> String {
    "-1".to_string()
}

fn default_normal_refresh_interval() -> String {
    "1s".to_string()
}

fn default_normal_replicas() -> u32 {
    1
}

impl Default for ScanConfig {
    fn default() -> Self {
        Self {
            page_size: 1000,
            relax_index_settings: true,
            bulk_refresh_interval: "-1".to_string(),
            bulk_replicas: 0,
            normal_refresh_interval: "1s".to_string(),
            normal_replicas: 1,
        }
    }
}

impl ScanConfig {
    /// Settings applied while bulk loading.
    pub fn bulk_settings(&self) -> IndexSettings {
        IndexSettings::new(self.bulk_refresh_interval.clone(), self.bulk_replicas)
    }

    /// Settings restored after the scan.
    pub fn normal_settings(&self) -> IndexSettings {
        IndexSettings::new(self.normal_refresh_interval.clone(), self.normal_replicas)
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// TailConfig
// ═══════════════════════════════════════════════════════════════════════════════

/// Adaptive flush thresholds for the tail worker.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TailConfig {
    /// Buffered operations that force a flush in bulk mode.
    #[serde(default = "default_max_batch")]
    pub max_batch: usize,

    /// Two flushes closer than this arm bulk mode.
    #[serde(default = "default_min_gap_ms")]
    pub min_gap_ms: u64,

    /// Oldest buffered operation age that forces a downgrade flush.
    #[serde(default = "default_max_age_ms")]
    pub max_age_ms: u64,

    /// Flush a bulk-mode buffer when the feed goes quiet.
    #[serde(default = "default_true")]
    pub idle_flush: bool,
}

fn default_max_batch() -> usize {
    1000
}

fn default_min_gap_ms() -> u64 {
    150
}

fn default_max_age_ms() -> u64 {
    3500
}

impl Default for TailConfig {
    fn default() -> Self {
        Self {
            max_batch: 1000,
            min_gap_ms: 150,
            max_age_ms: 3500,
            idle_flush: true,
        }
    }
}

impl TailConfig {
    pub fn min_gap(&self) -> Duration {
        Duration::from_millis(self.min_gap_ms)
    }

    pub fn max_age(&self) -> Duration {
        Duration::from_millis(self.max_age_ms)
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// ControlConfig
// ═══════════════════════════════════════════════════════════════════════════════

/// Control store persistence.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ControlConfig {
    /// Path to the SQLite database holding sync nodes.
    pub sqlite_path: String,

    /// Whether to use WAL mode for SQLite (recommended).
    #[serde(default = "default_true")]
    pub wal_mode: bool,
}

impl Default for ControlConfig {
    fn default() -> Self {
        Self {
            sqlite_path: "sync_nodes.db".to_string(),
            wal_mode: true,
        }
    }
}

impl ControlConfig {
    /// Create an in-memory config for testing.
    pub fn in_memory() -> Self {
        Self {
            sqlite_path: ":memory:".to_string(),
            wal_mode: false,
        }
    }

    /// Open the configured SQLite store.
    pub async fn open(&self) -> crate::Result<crate::control::SqliteControlStore> {
        crate::control::SqliteControlStore::new(&self.sqlite_path, self.wal_mode).await
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Tests
// ═══════════════════════════════════════════════════════════════════════════════

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_poll_interval_parsing() {
        let config = RegistryConfig {
            poll_interval: "500ms".to_string(),
        };
        assert_eq!(config.poll_interval_duration(), Duration::from_millis(500));

        let config = RegistryConfig {
            poll_interval: "2m".to_string(),
        };
        assert_eq!(config.poll_interval_duration(), Duration::from_secs(120));
    }

    #[test]
    fn test_poll_interval_invalid_fallback() {
        let config = RegistryConfig {
            poll_interval: "soon".to_string(),
        };
        assert_eq!(config.poll_interval_duration(), Duration::from_secs(15));
    }

    #[test]
    fn test_defaults() {
        let config = EngineConfig::default();
        assert_eq!(config.registry.poll_interval_duration(), Duration::from_secs(15));
        assert_eq!(config.scan.page_size, 1000);
        assert_eq!(config.tail.max_batch, 1000);
        assert_eq!(config.tail.min_gap(), Duration::from_millis(150));
        assert_eq!(config.tail.max_age(), Duration::from_millis(3500));
        assert!(config.tail.idle_flush);
        assert_eq!(config.control.sqlite_path, "sync_nodes.db");
        assert!(config.control.wal_mode);
    }

    #[test]
    fn test_scan_settings() {
        let scan = ScanConfig::default();
        assert_eq!(scan.bulk_settings(), IndexSettings::new("-1", 0));
        assert_eq!(scan.normal_settings(), IndexSettings::new("1s", 1));
    }

    #[test]
    fn test_for_testing_config() {
        let config = EngineConfig::for_testing();
        assert_eq!(config.registry.poll_interval_duration(), Duration::from_millis(50));
        assert_eq!(config.control.sqlite_path, ":memory:");
        assert!(!config.control.wal_mode);
    }

    #[test]
    fn test_partial_json_uses_defaults() {
        let json = r#"{ "tail": { "max_batch": 250 }, "control": { "sqlite_path": "/tmp/n.db" } }"#;
        let config: EngineConfig = serde_json::from_str(json).unwrap();
        assert_eq!(config.tail.max_batch, 250);
        assert_eq!(config.tail.min_gap_ms, 150);
        assert_eq!(config.scan.page_size, 1000);
        assert_eq!(config.control.sqlite_path, "/tmp/n.db");
        assert!(config.control.wal_mode);
    }

    #[test]
    fn test_config_json_roundtrip() {
        let config = EngineConfig::for_testing();
        let json = serde_json::to_string(&config).unwrap();
        let parsed: EngineConfig = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed.registry.poll_interval, "50ms");
        assert_eq!(parsed.scan.bulk_refresh_interval, "-1");
    }

    #[tokio::test]
    async fn test_control_config_opens_in_memory_store() {
        let store = ControlConfig::in_memory().open().await.unwrap();
        assert_eq!(store.path(), ":memory:");
    }
}
