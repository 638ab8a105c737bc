use serde::{Serialize, Deserialize};
use crate::query::cache::CacheStats;

/// Data source statistics for monitoring
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DataSourceStats {
    // Keys
    pub open_keys: usize,
    pub keys_on_disk: usize,
    pub live_references: usize,    // outstanding searcher checkouts

    // Log
    pub log_version: i64,
    pub log_size_bytes: u64,
    pub last_committed_tx: i64,
    pub open_transactions: usize,

    // Recovery
    pub recovering: bool,
    pub in_doubt: usize,

    pub cache_stats: CacheStats,
}

impl DataSourceStats {
    pub fn health(&self) -> HealthStatus {
        if self.in_doubt > 0 {
            HealthStatus::Degraded(format!("{} prepared transaction(s) await a decision", self.in_doubt))
        } else if self.recovering {
            HealthStatus::Degraded("recovery has not been completed".to_string())
        } else {
            HealthStatus::Healthy
        }
    }
}

/// Health check status
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub enum HealthStatus {
    Healthy,
    Degraded(String),
}

impl HealthStatus {
    pub fn is_healthy(&self) -> bool {
        matches!(self, HealthStatus::Healthy)
    }
}
