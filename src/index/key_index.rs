use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use parking_lot::{Mutex, MutexGuard, RwLock};
use tantivy::index::SegmentId;
use tantivy::{Index, IndexReader, IndexWriter, ReloadPolicy, Searcher};
use crate::core::error::{Error, Result};
use crate::index::strategy::{IndexStrategy, KeyFields};
use crate::reader::searcher_ref::{SearcherCheckout, SearcherRef};

/// Open tantivy handle of one key.
pub struct IndexHandle {
    pub index: Index,
    pub reader: IndexReader,
    pub fields: KeyFields,
}

struct Slot {
    handle: Option<IndexHandle>,
    current: Option<Arc<SearcherRef>>,
    fingerprint: Vec<(SegmentId, u32)>, // segment id + deleted docs of `current`
    generation: u64,
}

/// Resources of one index key: its directory, tantivy handle and the
/// cached searcher reference.
///
/// `write_lock` serializes everything that writes to the key. The slot lock
/// guards the handle and searcher; its exclusive section is the swap.
pub struct KeyIndex {
    key: String,
    dir: PathBuf,
    strategy: IndexStrategy,

    write_lock: Mutex<()>,
    slot: RwLock<Slot>,
}

impl KeyIndex {
    pub fn new(key: impl Into<String>, dir: PathBuf, strategy: IndexStrategy) -> Self {
        KeyIndex {
            key: key.into(),
            dir,
            strategy,
            write_lock: Mutex::new(()),
            slot: RwLock::new(Slot {
                handle: None,
                current: None,
                fingerprint: Vec::new(),
                generation: 0,
            }),
        }
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn exists_on_disk(&self) -> bool {
        self.dir.join("meta.json").is_file()
    }

    pub fn lock_writes(&self) -> MutexGuard<'_, ()> {
        self.write_lock.lock()
    }

    /// Generation of the searcher readers currently see; bumped by every swap.
    pub fn generation(&self) -> u64 {
        self.slot.read().generation
    }

    /// Runs `publish` only if `generation` is still current.
    ///
    /// The slot stays read-locked meanwhile, so no swap can slip in between
    /// the check and the publish.
    pub fn publish_if_current(&self, generation: u64, publish: impl FnOnce()) -> bool {
        let slot = self.slot.read();
        if slot.generation != generation {
            return false;
        }
        publish();
        true
    }

    /// Checks out the cached searcher, loading it from disk on first use.
    ///
    /// `None` means the key has no index on disk.
    pub fn checkout(&self) -> Result<Option<SearcherCheckout>> {
        {
            let slot = self.slot.read();
            if let Some(current) = &slot.current {
                return Ok(current.acquire());
            }
            if slot.handle.is_none() && !self.exists_on_disk() {
                return Ok(None);
            }
        }

        let mut slot = self.slot.write();
        if slot.current.is_none() {
            if slot.handle.is_none() {
                match self.open_handle(false)? {
                    Some(handle) => slot.handle = Some(handle),
                    None => return Ok(None),
                }
            }
            if let Some(handle) = &slot.handle {
                handle.reader.reload()?;
                let searcher = handle.reader.searcher();
                self.install(&mut slot, searcher);
            }
        }
        Ok(slot.current.as_ref().and_then(|current| current.acquire()))
    }

    /// Reloads the reader and swaps in a new searcher if the segment set or
    /// any delete count changed. Returns whether a swap happened.
    pub fn refresh(&self) -> Result<bool> {
        let reader = match &self.slot.read().handle {
            Some(handle) => handle.reader.clone(),
            None => return Ok(false),
        };
        reader.reload()?;
        let searcher = reader.searcher();

        let mut slot = self.slot.write();
        if slot.current.is_some() && slot.fingerprint == fingerprint(&searcher) {
            return Ok(false);
        }
        self.install(&mut slot, searcher);
        Ok(true)
    }

    /// A writer on this key's index, creating the index if needed.
    ///
    /// Callers must hold `lock_writes`.
    pub fn writer(&self, heap_bytes: usize) -> Result<IndexWriter> {
        let index = {
            let mut slot = self.slot.write();
            if slot.handle.is_none() {
                slot.handle = self.open_handle(true)?;
            }
            match &slot.handle {
                Some(handle) => handle.index.clone(),
                None => return Err(Error::invalid_state("key index could not be created")),
            }
        };
        Ok(index.writer_with_num_threads(1, heap_bytes)?)
    }

    /// Field handles of the open index, if any.
    pub fn fields(&self) -> Option<KeyFields> {
        self.slot.read().handle.as_ref().map(|handle| handle.fields)
    }

    /// Forgets the handle and deletes the key's directory.
    ///
    /// Callers must hold `lock_writes` and must have dropped any writer.
    pub fn drop_storage(&self) -> Result<()> {
        let mut slot = self.slot.write();
        slot.handle = None;
        slot.fingerprint.clear();
        slot.generation += 1;
        if let Some(old) = slot.current.take() {
            old.detach_or_close();
        }
        match fs::remove_dir_all(&self.dir) {
            Ok(()) => {}
            Err(err) if err.kind() == io::ErrorKind::NotFound => {}
            Err(err) => return Err(err.into()),
        }
        tracing::debug!(key = %self.key, generation = slot.generation, "dropped key index");
        Ok(())
    }

    /// Disposes the searcher unconditionally; used on shutdown.
    pub fn close(&self) {
        let mut slot = self.slot.write();
        if let Some(current) = slot.current.take() {
            current.close();
        }
        slot.handle = None;
    }

    /// Checkouts outstanding on the current searcher.
    pub fn live_references(&self) -> usize {
        self.slot.read().current.as_ref().map_or(0, |current| current.ref_count())
    }

    fn install(&self, slot: &mut Slot, searcher: Searcher) {
        slot.generation += 1;
        slot.fingerprint = fingerprint(&searcher);
        let fresh = SearcherRef::new(self.key.clone(), slot.generation, searcher);
        if let Some(old) = slot.current.replace(fresh) {
            let closed = old.detach_or_close();
            tracing::debug!(
                key = %self.key,
                generation = slot.generation,
                previous_closed = closed,
                "swapped key searcher"
            );
        }
    }

    fn open_handle(&self, create: bool) -> Result<Option<IndexHandle>> {
        let index = if self.exists_on_disk() {
            Index::open_in_dir(&self.dir)?
        } else if create {
            fs::create_dir_all(&self.dir)?;
            Index::create_in_dir(&self.dir, self.strategy.schema(false))?
        } else {
            return Ok(None);
        };
        IndexStrategy::register_tokenizers(&index);
        let fields = self.strategy.fields(&index.schema())?;
        let reader: IndexReader = index
            .reader_builder()
            .reload_policy(ReloadPolicy::Manual)
            .try_into()?;
        Ok(Some(IndexHandle { index, reader, fields }))
    }
}

fn fingerprint(searcher: &Searcher) -> Vec<(SegmentId, u32)> {
    searcher
        .segment_readers()
        .iter()
        .map(|segment| (segment.segment_id(), segment.num_deleted_docs()))
        .collect()
}
