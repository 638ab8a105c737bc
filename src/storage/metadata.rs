use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::Path;
use chrono::Utc;
use parking_lot::Mutex;
use uuid::Uuid;
use crate::core::error::Result;

pub const RECORD_LEN: usize = 24;

/// Identity and version of a data source, persisted as a fixed 24-byte record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MetadataRecord {
    pub creation_time: i64,
    pub random_id: i64,
    pub version: i64,
}

impl MetadataRecord {
    pub fn fresh() -> Self {
        MetadataRecord {
            creation_time: Utc::now().timestamp_millis(),
            random_id: Uuid::new_v4().as_u64_pair().0 as i64,
            version: 0,
        }
    }

    pub fn to_bytes(&self) -> [u8; RECORD_LEN] {
        let mut buf = [0u8; RECORD_LEN];
        buf[0..8].copy_from_slice(&self.creation_time.to_be_bytes());
        buf[8..16].copy_from_slice(&self.random_id.to_be_bytes());
        buf[16..24].copy_from_slice(&self.version.to_be_bytes());
        buf
    }

    pub fn from_bytes(buf: &[u8; RECORD_LEN]) -> Self {
        let field = |i: usize| {
            let mut raw = [0u8; 8];
            raw.copy_from_slice(&buf[i..i + 8]);
            i64::from_be_bytes(raw)
        };
        MetadataRecord {
            creation_time: field(0),
            random_id: field(8),
            version: field(16),
        }
    }

    /// Two data sources are the same resource manager iff their identity matches.
    pub fn same_identity(&self, other: &MetadataRecord) -> bool {
        self.creation_time == other.creation_time && self.random_id == other.random_id
    }
}

struct Inner {
    file: File,
    record: MetadataRecord,
}

pub struct MetadataStore {
    inner: Mutex<Inner>,
}

impl MetadataStore {
    /// Opens the record at `path`, creating a fresh identity if the file is new.
    pub fn open(path: &Path) -> Result<Self> {
        let mut file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(path)?;

        let len = file.metadata()?.len();
        // the record is only ever rewritten whole, so a short file is one
        // whose creation never finished
        let record = if len < RECORD_LEN as u64 {
            if len > 0 {
                tracing::warn!(path = %path.display(), bytes = len, "metadata record is incomplete, creating a fresh one");
            }
            let record = MetadataRecord::fresh();
            write_record(&mut file, &record)?;
            tracing::info!(path = %path.display(), random_id = record.random_id, "created index metadata");
            record
        } else {
            let mut buf = [0u8; RECORD_LEN];
            file.seek(SeekFrom::Start(0))?;
            file.read_exact(&mut buf)?;
            MetadataRecord::from_bytes(&buf)
        };

        Ok(MetadataStore {
            inner: Mutex::new(Inner { file, record }),
        })
    }

    pub fn record(&self) -> MetadataRecord {
        self.inner.lock().record
    }

    pub fn version(&self) -> i64 {
        self.inner.lock().record.version
    }

    /// Bumps the version and rewrites the record, returning the previous version.
    pub fn get_and_set_new_version(&self) -> Result<i64> {
        let mut inner = self.inner.lock();
        let previous = inner.record.version;
        let mut next = inner.record;
        next.version = previous + 1;
        write_record(&mut inner.file, &next)?;
        inner.record = next;
        Ok(previous)
    }
}

fn write_record(file: &mut File, record: &MetadataRecord) -> Result<()> {
    file.seek(SeekFrom::Start(0))?;
    file.write_all(&record.to_bytes())?;
    file.sync_data()?;
    Ok(())
}
