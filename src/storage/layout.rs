use std::fmt::Write as _;
use std::fs;
use std::path::PathBuf;
use crate::core::error::Result;

/// Directory structure for data files
#[derive(Debug, Clone)]
pub struct StorageLayout {
    pub base_dir: PathBuf,  // Root directory
    pub keys_dir: PathBuf,  // One tantivy index per key, created on first write
}

impl StorageLayout {
    pub fn new(base_dir: PathBuf) -> Result<Self> {
        let keys_dir = base_dir.join("keys");
        fs::create_dir_all(&keys_dir)?;

        Ok(StorageLayout { base_dir, keys_dir })
    }

    pub fn key_dir(&self, key: &str) -> PathBuf {
        self.keys_dir.join(encode_key(key))
    }

    pub fn log_path(&self) -> PathBuf {
        self.base_dir.join("index.log")
    }

    pub fn metadata_path(&self) -> PathBuf {
        self.base_dir.join("index.meta")
    }

    pub fn lock_path(&self) -> PathBuf {
        self.base_dir.join(".lock")
    }
}

/// Maps an index key to a file name; anything outside `[A-Za-z0-9_-]` is
/// escaped as `%XX` per UTF-8 byte, so distinct keys never share a directory.
pub fn encode_key(key: &str) -> String {
    let mut out = String::with_capacity(key.len());
    for byte in key.bytes() {
        if byte.is_ascii_alphanumeric() || byte == b'_' || byte == b'-' {
            out.push(byte as char);
        } else {
            let _ = write!(out, "%{:02X}", byte);
        }
    }
    if out.is_empty() {
        out.push('%');
    }
    out
}
