use std::collections::HashMap;
use std::path::{Path, PathBuf};
use serde::{Deserialize, Serialize};
use crate::core::error::{Error, ErrorKind, Result};
use crate::index::strategy::IndexStrategy;
use crate::storage::log::SyncMode;

/// Smallest heap tantivy accepts for a single indexing thread.
pub const MIN_WRITER_HEAP_BYTES: usize = 15_000_000;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub storage_path: PathBuf,
    pub strategy: IndexStrategy,

    pub writer_heap_bytes: usize,   // per-key writer memory budget
    pub lazy_threshold: usize,      // hits above this are fetched lazily

    pub sync_mode: SyncMode,
    pub log_rotate_bytes: u64,
    pub auto_recovery_complete: bool,

    /// Read caches enabled at open, key -> max entries.
    pub caches: HashMap<String, usize>,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            storage_path: PathBuf::from("./data"),
            strategy: IndexStrategy::Exact,

            writer_heap_bytes: 50_000_000,
            lazy_threshold: 100,

            sync_mode: SyncMode::Immediate,
            log_rotate_bytes: 10 * 1024 * 1024,
            auto_recovery_complete: true,

            caches: HashMap::new(),
        }
    }
}

impl Config {
    pub fn new(storage_path: impl Into<PathBuf>) -> Self {
        Config {
            storage_path: storage_path.into(),
            ..Config::default()
        }
    }

    pub fn with_strategy(mut self, strategy: IndexStrategy) -> Self {
        self.strategy = strategy;
        self
    }

    pub fn with_cache(mut self, key: impl Into<String>, capacity: usize) -> Self {
        self.caches.insert(key.into(), capacity);
        self
    }

    pub fn from_json_file(path: &Path) -> Result<Self> {
        let data = std::fs::read(path)?;
        let config: Config = serde_json::from_slice(&data)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.writer_heap_bytes < MIN_WRITER_HEAP_BYTES {
            return Err(Error::new(
                ErrorKind::InvalidArgument,
                format!(
                    "writer_heap_bytes {} is below the minimum of {}",
                    self.writer_heap_bytes, MIN_WRITER_HEAP_BYTES
                ),
            ));
        }
        if self.strategy.is_tokenized() && !self.caches.is_empty() {
            return Err(Error::new(
                ErrorKind::Unsupported,
                format!("read caches cannot be used with the {:?} strategy", self.strategy),
            ));
        }
        if self.caches.values().any(|&capacity| capacity == 0) {
            return Err(Error::new(ErrorKind::InvalidArgument, "cache capacity must be positive"));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn partial_json_falls_back_to_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        std::fs::write(&path, r#"{"storage_path": "/tmp/idx", "lazy_threshold": 7, "caches": {"name": 64}}"#).unwrap();

        let config = Config::from_json_file(&path).unwrap();
        assert_eq!(config.storage_path, PathBuf::from("/tmp/idx"));
        assert_eq!(config.lazy_threshold, 7);
        assert_eq!(config.caches.get("name"), Some(&64));
        assert_eq!(config.strategy, IndexStrategy::Exact);
        assert_eq!(config.writer_heap_bytes, 50_000_000);
    }

    #[test]
    fn caches_rejected_for_fulltext() {
        let config = Config::new("/tmp/idx")
            .with_strategy(IndexStrategy::Fulltext)
            .with_cache("title", 10);
        assert_eq!(config.validate().unwrap_err().kind(), ErrorKind::Unsupported);
    }

    #[test]
    fn tiny_heap_rejected() {
        let mut config = Config::default();
        config.writer_heap_bytes = 1024;
        assert_eq!(config.validate().unwrap_err().kind(), ErrorKind::InvalidArgument);
    }
}
