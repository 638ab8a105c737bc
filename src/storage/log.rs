use std::collections::HashSet;
use std::fs::{self, File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use bytes::{Buf, BufMut};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use crate::core::error::{Error, Result};
use crate::storage::command::Command;
use crate::xa::xid::Xid;

const LOG_MAGIC: u32 = 0x5458_4C47; // "TXLG"
const LOG_FORMAT: u32 = 1;
pub const LOG_HEADER_LEN: usize = 4 + 4 + 8 + 8 + 4;

const START: u8 = 1;
const COMMAND: u8 = 2;
const PREPARE: u8 = 3;
const COMMIT: u8 = 4;
const DONE: u8 = 5;

/// kind + local id
const ENTRY_HEAD_LEN: usize = 1 + 4;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum SyncMode {
    #[default]
    Immediate, // fsync on prepare and commit
    None,      // Let OS handle it
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LogEntry {
    Start { local_id: i32, xid: Xid },
    Command { local_id: i32, command: Command },
    Prepare { local_id: i32 },
    Commit { local_id: i32, tx_id: i64 },
    Done { local_id: i32 },
}

impl LogEntry {
    pub fn local_id(&self) -> i32 {
        match self {
            LogEntry::Start { local_id, .. }
            | LogEntry::Command { local_id, .. }
            | LogEntry::Prepare { local_id }
            | LogEntry::Commit { local_id, .. }
            | LogEntry::Done { local_id } => *local_id,
        }
    }

    fn encode(&self, buf: &mut Vec<u8>) {
        match self {
            LogEntry::Start { local_id, xid } => {
                buf.put_u8(START);
                buf.put_i32(*local_id);
                xid.encode(buf);
            }
            LogEntry::Command { local_id, command } => {
                buf.put_u8(COMMAND);
                buf.put_i32(*local_id);
                command.encode(buf);
            }
            LogEntry::Prepare { local_id } => {
                buf.put_u8(PREPARE);
                buf.put_i32(*local_id);
            }
            LogEntry::Commit { local_id, tx_id } => {
                buf.put_u8(COMMIT);
                buf.put_i32(*local_id);
                buf.put_i64(*tx_id);
            }
            LogEntry::Done { local_id } => {
                buf.put_u8(DONE);
                buf.put_i32(*local_id);
            }
        }
    }

    /// Decodes one entry; `None` means the log ends here (possibly mid-entry).
    fn decode(bytes: &[u8]) -> Result<Option<(LogEntry, usize)>> {
        if bytes.len() < ENTRY_HEAD_LEN {
            return Ok(None);
        }
        let mut head = bytes;
        let kind = head.get_u8();
        let local_id = head.get_i32();
        let body = &bytes[ENTRY_HEAD_LEN..];

        let decoded = match kind {
            START => Xid::decode(body)?.map(|(xid, n)| (LogEntry::Start { local_id, xid }, n)),
            COMMAND => Command::decode(body)?.map(|(command, n)| (LogEntry::Command { local_id, command }, n)),
            PREPARE => Some((LogEntry::Prepare { local_id }, 0)),
            COMMIT => {
                if body.len() < 8 {
                    None
                } else {
                    let mut b = body;
                    Some((LogEntry::Commit { local_id, tx_id: b.get_i64() }, 8))
                }
            }
            DONE => Some((LogEntry::Done { local_id }, 0)),
            other => return Err(Error::corrupt(format!("unknown log entry kind {}", other))),
        };
        Ok(decoded.map(|(entry, n)| (entry, ENTRY_HEAD_LEN + n)))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LogHeader {
    pub log_version: i64,
    pub last_committed_tx: i64,
}

impl LogHeader {
    fn to_bytes(self) -> [u8; LOG_HEADER_LEN] {
        let mut buf = Vec::with_capacity(LOG_HEADER_LEN);
        buf.put_u32(LOG_MAGIC);
        buf.put_u32(LOG_FORMAT);
        buf.put_i64(self.log_version);
        buf.put_i64(self.last_committed_tx);
        let crc = crc32fast::hash(&buf);
        buf.put_u32(crc);

        let mut out = [0u8; LOG_HEADER_LEN];
        out.copy_from_slice(&buf);
        out
    }

    fn from_bytes(bytes: &[u8]) -> Result<Self> {
        if bytes.len() < LOG_HEADER_LEN {
            return Err(Error::corrupt("log header is truncated"));
        }
        let crc_expected = crc32fast::hash(&bytes[..LOG_HEADER_LEN - 4]);
        let mut cur = bytes;
        let magic = cur.get_u32();
        let format = cur.get_u32();
        let log_version = cur.get_i64();
        let last_committed_tx = cur.get_i64();
        let crc = cur.get_u32();

        if magic != LOG_MAGIC {
            return Err(Error::corrupt(format!("bad log magic {:#x}", magic)));
        }
        if format != LOG_FORMAT {
            return Err(Error::corrupt(format!("unsupported log format {}", format)));
        }
        if crc != crc_expected {
            return Err(Error::corrupt("log header checksum mismatch"));
        }
        Ok(LogHeader { log_version, last_committed_tx })
    }
}

/// Result of opening a log: the valid entries found, in log order.
#[derive(Debug)]
pub struct LogScan {
    pub header: LogHeader,
    pub entries: Vec<LogEntry>,
    pub truncated_bytes: u64,
}

struct LogInner {
    file: File,
    header: LogHeader,
    position: u64,
    next_local_id: i32,
    open: HashSet<i32>,
    last_committed_tx: i64,
}

/// Durable transaction log for index commands.
///
/// Each transaction is written as Start, its Commands, then Prepare and/or
/// Commit, and finally Done once the index has applied it.
pub struct LogicalLog {
    path: PathBuf,
    sync_mode: SyncMode,
    inner: Mutex<LogInner>,
}

impl LogicalLog {
    /// Opens (or creates) the log and returns every valid entry in it.
    ///
    /// A torn tail is cut off so that new entries follow the valid prefix.
    pub fn open(path: &Path, sync_mode: SyncMode, log_version: i64) -> Result<(Self, LogScan)> {
        let mut file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(path)?;

        let mut data = Vec::new();
        file.read_to_end(&mut data)?;

        let (header, entries, valid_len) = if data.len() < LOG_HEADER_LEN {
            // a header shorter than its fixed size was never finished
            if !data.is_empty() {
                tracing::warn!(path = %path.display(), bytes = data.len(), "log header is incomplete, starting a fresh log");
                file.set_len(0)?;
                data.clear();
            }
            let header = LogHeader { log_version, last_committed_tx: 0 };
            file.seek(SeekFrom::Start(0))?;
            file.write_all(&header.to_bytes())?;
            file.sync_data()?;
            (header, Vec::new(), LOG_HEADER_LEN)
        } else {
            let header = LogHeader::from_bytes(&data)?;
            let (entries, used) = scan_entries(&data[LOG_HEADER_LEN..])?;
            (header, entries, LOG_HEADER_LEN + used)
        };

        let truncated_bytes = data.len().saturating_sub(valid_len) as u64;
        if truncated_bytes > 0 {
            tracing::warn!(
                path = %path.display(),
                truncated_bytes,
                "log ends with a partial entry, discarding it"
            );
            file.set_len(valid_len as u64)?;
        }
        let position = file.seek(SeekFrom::Start(valid_len as u64))?;

        let mut open = HashSet::new();
        let mut next_local_id = 1;
        let mut last_committed_tx = header.last_committed_tx;
        for entry in &entries {
            next_local_id = next_local_id.max(entry.local_id() + 1);
            match entry {
                LogEntry::Start { local_id, .. } => {
                    open.insert(*local_id);
                }
                LogEntry::Commit { tx_id, .. } => last_committed_tx = last_committed_tx.max(*tx_id),
                LogEntry::Done { local_id } => {
                    open.remove(local_id);
                }
                _ => {}
            }
        }

        let log = LogicalLog {
            path: path.to_path_buf(),
            sync_mode,
            inner: Mutex::new(LogInner {
                file,
                header,
                position,
                next_local_id,
                open,
                last_committed_tx,
            }),
        };
        Ok((log, LogScan { header, entries, truncated_bytes }))
    }

    /// Writes Start and the transaction's commands, returning its local id.
    pub fn begin(&self, xid: &Xid, commands: &[Command]) -> Result<i32> {
        let mut inner = self.inner.lock();
        let local_id = inner.next_local_id;
        inner.next_local_id += 1;

        let mut buf = Vec::new();
        LogEntry::Start { local_id, xid: xid.clone() }.encode(&mut buf);
        for command in commands {
            LogEntry::Command { local_id, command: command.clone() }.encode(&mut buf);
        }
        write_entries(&mut inner, &buf)?;
        inner.open.insert(local_id);
        Ok(local_id)
    }

    pub fn prepare(&self, local_id: i32) -> Result<()> {
        let mut inner = self.inner.lock();
        let mut buf = Vec::new();
        LogEntry::Prepare { local_id }.encode(&mut buf);
        write_entries(&mut inner, &buf)?;
        self.force(&mut inner)
    }

    /// Records the commit decision and returns the assigned transaction number.
    pub fn commit(&self, local_id: i32) -> Result<i64> {
        let mut inner = self.inner.lock();
        let tx_id = inner.last_committed_tx + 1;
        let mut buf = Vec::new();
        LogEntry::Commit { local_id, tx_id }.encode(&mut buf);
        write_entries(&mut inner, &buf)?;
        self.force(&mut inner)?;
        inner.last_committed_tx = tx_id;
        Ok(tx_id)
    }

    /// Marks a transaction finished, whether it was applied or rolled back.
    pub fn done(&self, local_id: i32) -> Result<()> {
        let mut inner = self.inner.lock();
        let mut buf = Vec::new();
        LogEntry::Done { local_id }.encode(&mut buf);
        write_entries(&mut inner, &buf)?;
        inner.open.remove(&local_id);
        Ok(())
    }

    pub fn last_committed_tx(&self) -> i64 {
        self.inner.lock().last_committed_tx
    }

    pub fn log_version(&self) -> i64 {
        self.inner.lock().header.log_version
    }

    pub fn open_transactions(&self) -> usize {
        self.inner.lock().open.len()
    }

    pub fn size(&self) -> u64 {
        self.inner.lock().position
    }

    /// Starts a fresh log file under `new_version` if no transaction is open.
    ///
    /// The new header carries the last committed transaction number forward.
    pub fn rotate(&self, new_version: i64) -> Result<bool> {
        let mut inner = self.inner.lock();
        if !inner.open.is_empty() {
            return Ok(false);
        }
        inner.file.sync_data()?;

        let header = LogHeader {
            log_version: new_version,
            last_committed_tx: inner.last_committed_tx,
        };
        let tmp = self.path.with_extension("log.tmp");
        {
            let mut fresh = File::create(&tmp)?;
            fresh.write_all(&header.to_bytes())?;
            fresh.sync_all()?;
        }
        fs::rename(&tmp, &self.path)?;

        let mut file = OpenOptions::new().read(true).write(true).open(&self.path)?;
        let position = file.seek(SeekFrom::End(0))?;
        inner.file = file;
        inner.header = header;
        inner.position = position;

        tracing::info!(
            path = %self.path.display(),
            log_version = new_version,
            last_committed_tx = header.last_committed_tx,
            "rotated index log"
        );
        Ok(true)
    }

    pub fn sync(&self) -> Result<()> {
        self.inner.lock().file.sync_data()?;
        Ok(())
    }

    fn force(&self, inner: &mut LogInner) -> Result<()> {
        match self.sync_mode {
            SyncMode::Immediate => inner.file.sync_data()?,
            SyncMode::None => {}
        }
        Ok(())
    }
}

fn write_entries(inner: &mut LogInner, buf: &[u8]) -> Result<()> {
    inner.file.write_all(buf)?;
    inner.position += buf.len() as u64;
    Ok(())
}

/// Decodes entries until the data runs out or an entry is cut short.
fn scan_entries(data: &[u8]) -> Result<(Vec<LogEntry>, usize)> {
    let mut entries = Vec::new();
    let mut offset = 0;
    while let Some((entry, used)) = LogEntry::decode(&data[offset..])? {
        entries.push(entry);
        offset += used;
    }
    Ok((entries, offset))
}
