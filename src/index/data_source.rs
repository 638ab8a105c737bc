use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::fs;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use parking_lot::{Mutex, RwLock};
use tantivy::collector::DocSetCollector;
use tantivy::{DocAddress, IndexWriter};
use crate::core::config::Config;
use crate::core::error::{Error, ErrorKind, Result};
use crate::core::stats::DataSourceStats;
use crate::index::key_index::KeyIndex;
use crate::index::strategy::{delete_query, IndexStrategy, KeyFields};
use crate::query::cache::ReadCache;
use crate::reader::hits::IndexHits;
use crate::reader::searcher_ref::SearcherCheckout;
use crate::storage::command::Command;
use crate::storage::file_lock::FileLock;
use crate::storage::layout::StorageLayout;
use crate::storage::log::{LogicalLog, LOG_HEADER_LEN};
use crate::storage::metadata::{MetadataRecord, MetadataStore};
use crate::storage::recovery::{RecoveredTx, RecoveryPlan};
use crate::xa::resource::XaDataSource;
use crate::xa::xid::Xid;

/// Work done through pooled writers while recovery is in progress.
#[derive(Default)]
struct RecoveryState {
    writers: HashMap<String, IndexWriter>,
    touched: BTreeSet<String>,
    finished: Vec<i32>,    // applied, Done entry still owed
}

/// Owner of every persisted resource of the index: key indexes, read
/// caches, the metadata record and the logical log.
///
/// A data source starts out recovering. Until `recovery_complete`, committed
/// work goes through pooled writers that are not committed to tantivy, so
/// it is durable only through the log.
pub struct DataSource {
    config: Config,
    layout: StorageLayout,
    _lock: FileLock,

    metadata: MetadataStore,
    log: LogicalLog,
    cache: ReadCache,

    keys: RwLock<HashMap<String, Arc<KeyIndex>>>,
    commit_gate: RwLock<()>, // commits share it, ending recovery takes it alone
    recovery: Mutex<Option<RecoveryState>>,
    in_doubt: Mutex<Vec<RecoveredTx>>,
    closed: AtomicBool,
}

impl DataSource {
    /// Opens the data source at `config.storage_path` and recovers it.
    ///
    /// 1. Lock the directory and read the metadata record
    /// 2. Scan the log and classify what it holds
    /// 3. Replay committed work, keep prepared work in doubt
    /// 4. Complete recovery right away if configured to
    pub fn open(config: Config) -> Result<Self> {
        config.validate()?;
        let layout = StorageLayout::new(config.storage_path.clone())?;
        let lock = FileLock::acquire(&layout)?;

        let metadata = MetadataStore::open(&layout.metadata_path())?;
        let (log, scan) = LogicalLog::open(&layout.log_path(), config.sync_mode, metadata.version())?;
        let plan = RecoveryPlan::from_entries(scan.entries);

        let cache = ReadCache::new();
        for (key, capacity) in &config.caches {
            cache.enable(key, *capacity)?;
        }

        let source = DataSource {
            config,
            layout,
            _lock: lock,
            metadata,
            log,
            cache,
            keys: RwLock::new(HashMap::new()),
            commit_gate: RwLock::new(()),
            recovery: Mutex::new(Some(RecoveryState::default())),
            in_doubt: Mutex::new(Vec::new()),
            closed: AtomicBool::new(false),
        };
        source.recover(plan)?;

        if source.config.auto_recovery_complete {
            source.recovery_complete()?;
        }
        Ok(source)
    }

    fn recover(&self, plan: RecoveryPlan) -> Result<()> {
        for local_id in &plan.discarded {
            tracing::warn!(local_id, "discarding unprepared transaction found in log");
            self.log.done(*local_id)?;
        }
        for tx in &plan.to_replay {
            tracing::debug!(local_id = tx.local_id, tx_id = ?tx.tx_id, commands = tx.commands.len(), "replaying");
            let batches = self.batches(&tx.commands);
            let _guards: Vec<_> = batches.iter().map(|(key_index, _)| key_index.lock_writes()).collect();
            self.apply_batches(&batches)?;
            self.finish(tx.local_id)?;
        }

        if plan.is_clean() {
            tracing::debug!(path = %self.layout.base_dir.display(), "index log is clean");
            return Ok(());
        }
        tracing::info!(
            path = %self.layout.base_dir.display(),
            replayed = plan.to_replay.len(),
            in_doubt = plan.in_doubt.len(),
            discarded = plan.discarded.len(),
            last_committed_tx = self.log.last_committed_tx(),
            "recovered index log"
        );
        *self.in_doubt.lock() = plan.in_doubt;
        Ok(())
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn strategy(&self) -> IndexStrategy {
        self.config.strategy
    }

    pub fn identity(&self) -> MetadataRecord {
        self.metadata.record()
    }

    pub fn is_recovering(&self) -> bool {
        self.recovery.lock().is_some()
    }

    /// Resolves `key` to its resources, creating the entry on first use.
    pub fn key_index(&self, key: &str) -> Arc<KeyIndex> {
        if let Some(key_index) = self.keys.read().get(key) {
            return Arc::clone(key_index);
        }
        let mut keys = self.keys.write();
        let key_index = keys.entry(key.to_string()).or_insert_with(|| {
            Arc::new(KeyIndex::new(key, self.layout.key_dir(key), self.config.strategy))
        });
        Arc::clone(key_index)
    }

    /// Like `key_index`, but only for keys already open or present on disk.
    fn existing_key_index(&self, key: &str) -> Option<Arc<KeyIndex>> {
        if let Some(key_index) = self.keys.read().get(key) {
            return Some(Arc::clone(key_index));
        }
        if !self.layout.key_dir(key).join("meta.json").is_file() {
            return None;
        }
        Some(self.key_index(key))
    }

    // ---- reads ----

    /// Committed entities with `key` matching `value`.
    ///
    /// Served from the read cache when the key has one. Large results of
    /// exact lookups are fetched lazily and keep their searcher checked out.
    pub fn nodes(&self, key: &str, value: &str) -> Result<IndexHits> {
        self.ensure_open()?;
        if let Some(ids) = self.cache.lookup(key, value) {
            return Ok(IndexHits::materialized(ids));
        }
        let cached = self.cache.is_enabled(key);
        let Some(key_index) = self.existing_key_index(key) else {
            return Ok(IndexHits::empty());
        };

        let generation = key_index.generation();
        let Some(checkout) = key_index.checkout()? else {
            if cached {
                key_index.publish_if_current(generation, || self.cache.put(key, value, Vec::new()));
            }
            return Ok(IndexHits::empty());
        };

        let (fields, addresses) = self.search(&checkout, value)?;
        let lazy = !cached
            && self.config.strategy == IndexStrategy::Exact
            && addresses.len() > self.config.lazy_threshold;
        if lazy {
            return Ok(IndexHits::lazy(checkout, addresses, fields));
        }

        let generation = checkout.generation();
        let ids = IndexHits::lazy(checkout, addresses, fields).into_ids()?;
        if cached {
            let published = key_index.publish_if_current(generation, || self.cache.put(key, value, ids.clone()));
            if !published {
                tracing::debug!(key, "searcher changed during lookup, cache fill dropped");
            }
        }
        Ok(IndexHits::materialized(ids))
    }

    fn search(&self, checkout: &SearcherCheckout, value: &str) -> Result<(KeyFields, Vec<DocAddress>)> {
        let searcher = checkout.searcher();
        let fields = self.config.strategy.fields(searcher.schema())?;
        let query = self.config.strategy.form_query(searcher.index(), &fields, value)?;
        let mut addresses: Vec<DocAddress> = searcher.search(query.as_ref(), &DocSetCollector)?.into_iter().collect();
        addresses.sort();
        Ok((fields, addresses))
    }

    // ---- caches ----

    pub fn enable_cache(&self, key: &str, capacity: usize) -> Result<()> {
        if self.config.strategy.is_tokenized() {
            return Err(Error::new(
                ErrorKind::Unsupported,
                format!("cannot cache key {:?} under the {:?} strategy", key, self.config.strategy),
            ));
        }
        self.cache.enable(key, capacity)?;
        tracing::debug!(key, capacity, "read cache enabled");
        Ok(())
    }

    pub fn disable_cache(&self, key: &str) {
        self.cache.disable(key);
    }

    pub fn is_cache_enabled(&self, key: &str) -> bool {
        self.cache.is_enabled(key)
    }

    pub fn invalidate(&self, key: &str, value: &str) {
        self.cache.invalidate(key, value);
    }

    // ---- transactions ----

    /// Writes the transaction and its prepare record to the log, returning
    /// its local id there.
    pub fn prepare(&self, xid: &Xid, commands: &[Command]) -> Result<i32> {
        self.ensure_open()?;
        let local_id = self.log.begin(xid, commands)?;
        self.log.prepare(local_id)?;
        tracing::debug!(?xid, local_id, commands = commands.len(), "prepared index transaction");
        Ok(local_id)
    }

    /// Logs the commit decision and applies `commands` to the key indexes.
    ///
    /// `prepared` is the local id from `prepare`; `None` for a one-phase
    /// commit. All touched keys stay write-locked from the commit record until
    /// the work is applied, so per-key apply order is log order.
    pub fn commit(&self, xid: &Xid, prepared: Option<i32>, commands: &[Command]) -> Result<i64> {
        self.ensure_open()?;
        let tx_id = {
            let _gate = self.commit_gate.read();
            let local_id = match prepared {
                Some(local_id) => local_id,
                None => self.log.begin(xid, commands)?,
            };

            let batches = self.batches(commands);
            let _guards: Vec<_> = batches.iter().map(|(key_index, _)| key_index.lock_writes()).collect();

            let tx_id = self.log.commit(local_id)?;
            self.apply_batches(&batches)?;
            self.finish(local_id)?;
            tracing::debug!(?xid, tx_id, keys = batches.len(), commands = commands.len(), "committed index transaction");
            tx_id
        };
        self.maybe_rotate()?;
        Ok(tx_id)
    }

    /// Abandons a prepared transaction.
    pub fn rollback_prepared(&self, local_id: i32) -> Result<()> {
        self.ensure_open()?;
        self.log.done(local_id)?;
        self.maybe_rotate()
    }

    /// Prepared transactions found by recovery that still await a decision.
    pub fn in_doubt(&self) -> Vec<Xid> {
        self.in_doubt.lock().iter().map(|tx| tx.xid.clone()).collect()
    }

    /// Commits or rolls back an in-doubt transaction; `false` if `xid` is
    /// not in doubt.
    pub fn resolve_in_doubt(&self, xid: &Xid, commit: bool) -> Result<bool> {
        let tx = {
            let mut in_doubt = self.in_doubt.lock();
            match in_doubt.iter().position(|tx| &tx.xid == xid) {
                Some(position) => in_doubt.remove(position),
                None => return Ok(false),
            }
        };
        if commit {
            self.commit(xid, Some(tx.local_id), &tx.commands)?;
        } else {
            self.rollback_prepared(tx.local_id)?;
        }
        tracing::info!(?xid, commit, "resolved in-doubt transaction");
        Ok(true)
    }

    /// Groups commands per key, sorted by key, keeping staging order within
    /// each key.
    fn batches<'a>(&self, commands: &'a [Command]) -> Vec<(Arc<KeyIndex>, Vec<&'a Command>)> {
        let mut by_key: BTreeMap<&str, Vec<&Command>> = BTreeMap::new();
        for command in commands {
            by_key.entry(command.key()).or_default().push(command);
        }
        by_key
            .into_iter()
            .map(|(key, commands)| (self.key_index(key), commands))
            .collect()
    }

    /// Callers hold the write lock of every key in `batches`.
    fn apply_batches(&self, batches: &[(Arc<KeyIndex>, Vec<&Command>)]) -> Result<()> {
        for (key_index, commands) in batches {
            let key = key_index.key();
            let pooled = self
                .recovery
                .lock()
                .as_mut()
                .map(|state| state.writers.remove(key));

            match pooled {
                Some(writer) => {
                    let writer = self.apply_key(key_index, commands, writer)?;
                    if let Some(state) = self.recovery.lock().as_mut() {
                        state.touched.insert(key.to_string());
                        if let Some(writer) = writer {
                            state.writers.insert(key.to_string(), writer);
                        }
                    }
                }
                None => {
                    if let Some(mut writer) = self.apply_key(key_index, commands, None)? {
                        writer.commit()?;
                        writer.wait_merging_threads()?;
                    }
                    key_index.refresh()?;
                    self.invalidate_touched(key, commands);
                }
            }
        }
        Ok(())
    }

    /// Replays one key's commands on `writer`, returning the writer still
    /// holding uncommitted work, if any.
    fn apply_key(
        &self,
        key_index: &KeyIndex,
        commands: &[&Command],
        mut writer: Option<IndexWriter>,
    ) -> Result<Option<IndexWriter>> {
        let strategy = self.config.strategy;
        for command in commands {
            if command.is_drop_key() {
                // uncommitted work goes with the key
                drop(writer.take());
                key_index.drop_storage()?;
                continue;
            }
            if writer.is_none() && !key_index.exists_on_disk() && matches!(command, Command::Remove { .. }) {
                continue;
            }

            let active = match writer.take() {
                Some(active) => active,
                None => key_index.writer(self.config.writer_heap_bytes)?,
            };
            let fields = key_index
                .fields()
                .ok_or_else(|| Error::invalid_state(format!("key {:?} has no open index", key_index.key())))?;

            match command {
                Command::Add { entity, value, .. } => {
                    if let Some(query) = delete_query(&fields, Some(*entity), Some(value.as_str())) {
                        active.delete_query(query)?;
                    }
                    active.add_document(strategy.document(&fields, *entity, value))?;
                }
                Command::Remove { entity, value, .. } => {
                    if let Some(query) = delete_query(&fields, *entity, value.as_deref()) {
                        active.delete_query(query)?;
                    }
                }
            }
            writer = Some(active);
        }
        Ok(writer)
    }

    fn invalidate_touched(&self, key: &str, commands: &[&Command]) {
        for command in commands {
            match command {
                Command::Add { value, .. } | Command::Remove { value: Some(value), .. } => {
                    self.cache.invalidate(key, value);
                }
                Command::Remove { value: None, .. } => {
                    self.cache.invalidate_key(key);
                    return;
                }
            }
        }
    }

    /// Marks a transaction done, or defers that until recovery completes.
    fn finish(&self, local_id: i32) -> Result<()> {
        if let Some(state) = self.recovery.lock().as_mut() {
            state.finished.push(local_id);
            return Ok(());
        }
        self.log.done(local_id)
    }

    fn maybe_rotate(&self) -> Result<()> {
        if self.log.size() < self.config.log_rotate_bytes {
            return Ok(());
        }
        self.rotate_log()
    }

    fn rotate_log(&self) -> Result<()> {
        if self.log.open_transactions() > 0 || self.is_recovering() {
            return Ok(());
        }
        let version = self.metadata.get_and_set_new_version()? + 1;
        self.log.rotate(version)?;
        Ok(())
    }

    fn complete_recovery(&self) -> Result<()> {
        let (keys, transactions) = {
            let _gate = self.commit_gate.write();
            let Some(state) = self.recovery.lock().take() else {
                return Ok(());
            };

            for (key, mut writer) in state.writers {
                let key_index = self.key_index(&key);
                let _guard = key_index.lock_writes();
                writer.commit()?;
                writer.wait_merging_threads()?;
            }
            for key in &state.touched {
                let key_index = self.key_index(key);
                let _guard = key_index.lock_writes();
                key_index.refresh()?;
                self.cache.invalidate_key(key);
            }
            for local_id in &state.finished {
                self.log.done(*local_id)?;
            }
            (state.touched.len(), state.finished.len())
        };

        let in_doubt = self.in_doubt.lock().len();
        if in_doubt == 0 && self.log.size() > LOG_HEADER_LEN as u64 {
            self.rotate_log()?;
        }
        tracing::info!(keys, transactions, in_doubt, "recovery complete");
        Ok(())
    }

    // ---- lifecycle ----

    pub fn stats(&self) -> DataSourceStats {
        let keys = self.keys.read();
        let keys_on_disk = fs::read_dir(&self.layout.keys_dir)
            .map(|entries| entries.count())
            .unwrap_or(0);
        DataSourceStats {
            open_keys: keys.len(),
            keys_on_disk,
            live_references: keys.values().map(|key_index| key_index.live_references()).sum(),
            log_version: self.log.log_version(),
            log_size_bytes: self.log.size(),
            last_committed_tx: self.log.last_committed_tx(),
            open_transactions: self.log.open_transactions(),
            recovering: self.is_recovering(),
            in_doubt: self.in_doubt.lock().len(),
            cache_stats: self.cache.stats(),
        }
    }

    /// Commits pending recovery work, disposes every searcher and syncs the
    /// log. Later calls do nothing.
    pub fn close(&self) -> Result<()> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        self.complete_recovery()?;
        for key_index in self.keys.read().values() {
            key_index.close();
        }
        self.log.sync()?;
        tracing::info!(path = %self.layout.base_dir.display(), "closed data source");
        Ok(())
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    fn ensure_open(&self) -> Result<()> {
        if self.is_closed() {
            return Err(Error::invalid_state("data source is closed"));
        }
        Ok(())
    }
}

impl XaDataSource for DataSource {
    fn current_version(&self) -> i64 {
        self.metadata.version()
    }

    fn get_and_set_new_version(&self) -> Result<i64> {
        self.metadata.get_and_set_new_version()
    }

    fn last_committed_tx(&self) -> i64 {
        self.log.last_committed_tx()
    }

    fn recovery_complete(&self) -> Result<()> {
        self.ensure_open()?;
        self.complete_recovery()
    }
}

impl Drop for DataSource {
    fn drop(&mut self) {
        if let Err(err) = self.close() {
            tracing::warn!(error = %err, "closing data source failed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::types::EntityId;

    fn open(dir: &std::path::Path) -> DataSource {
        DataSource::open(Config::new(dir)).unwrap()
    }

    fn xid(n: u8) -> Xid {
        Xid::new(7, vec![n], vec![1]).unwrap()
    }

    fn ids(source: &DataSource, key: &str, value: &str) -> Vec<i64> {
        let mut ids: Vec<i64> = source
            .nodes(key, value)
            .unwrap()
            .into_ids()
            .unwrap()
            .into_iter()
            .map(|id| id.0)
            .collect();
        ids.sort();
        ids
    }

    #[test]
    fn one_phase_commit_is_visible_and_logged() {
        let dir = tempfile::tempdir().unwrap();
        let source = open(dir.path());
        let commands = vec![
            Command::add(EntityId(1), "name", "alice"),
            Command::add(EntityId(2), "name", "alice"),
            Command::add(EntityId(3), "name", "bob"),
        ];
        let tx_id = source.commit(&xid(1), None, &commands).unwrap();

        assert_eq!(tx_id, 1);
        assert_eq!(source.last_committed_tx(), 1);
        assert_eq!(ids(&source, "name", "alice"), vec![1, 2]);
        assert_eq!(ids(&source, "name", "bob"), vec![3]);
        assert!(ids(&source, "other", "alice").is_empty());
    }

    #[test]
    fn repeated_add_does_not_duplicate() {
        let dir = tempfile::tempdir().unwrap();
        let source = open(dir.path());
        let add = [Command::add(EntityId(1), "name", "alice")];
        source.commit(&xid(1), None, &add).unwrap();
        source.commit(&xid(2), None, &add).unwrap();
        assert_eq!(source.nodes("name", "alice").unwrap().size(), 1);
    }

    #[test]
    fn remove_shapes_delete_what_they_name() {
        let dir = tempfile::tempdir().unwrap();
        let source = open(dir.path());
        source
            .commit(&xid(1), None, &[
                Command::add(EntityId(1), "tag", "red"),
                Command::add(EntityId(1), "tag", "blue"),
                Command::add(EntityId(2), "tag", "red"),
            ])
            .unwrap();

        source.commit(&xid(2), None, &[Command::remove_value(EntityId(2), "tag", "red")]).unwrap();
        assert_eq!(ids(&source, "tag", "red"), vec![1]);

        source.commit(&xid(3), None, &[Command::remove_entity(EntityId(1), "tag")]).unwrap();
        assert!(ids(&source, "tag", "red").is_empty());
        assert!(ids(&source, "tag", "blue").is_empty());

        source.commit(&xid(4), None, &[Command::add(EntityId(5), "tag", "red"), Command::drop_key("tag")]).unwrap();
        assert!(ids(&source, "tag", "red").is_empty());
        assert!(!source.key_index("tag").exists_on_disk());
    }

    #[test]
    fn lookups_of_unwritten_keys_open_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let source = open(dir.path());
        for n in 0..10 {
            assert!(ids(&source, &format!("never{}", n), "v").is_empty());
        }
        assert_eq!(source.stats().open_keys, 0);

        source.commit(&xid(1), None, &[Command::add(EntityId(1), "name", "alice")]).unwrap();
        assert_eq!(source.stats().open_keys, 1);
        drop(source);

        // a key written by an earlier run is opened by its first lookup
        let source = open(dir.path());
        assert_eq!(ids(&source, "name", "alice"), vec![1]);
        assert_eq!(source.stats().open_keys, 1);
    }

    #[test]
    fn disabled_cache_falls_back_to_the_index() {
        let dir = tempfile::tempdir().unwrap();
        let source = DataSource::open(Config::new(dir.path()).with_cache("name", 16)).unwrap();
        source.commit(&xid(1), None, &[Command::add(EntityId(1), "name", "alice")]).unwrap();
        assert_eq!(ids(&source, "name", "alice"), vec![1]);
        assert_eq!(source.stats().cache_stats.size, 1);

        source.invalidate("name", "alice");
        assert_eq!(source.stats().cache_stats.size, 0);

        source.disable_cache("name");
        assert!(!source.is_cache_enabled("name"));
        assert_eq!(ids(&source, "name", "alice"), vec![1]);
        assert_eq!(source.stats().cache_stats.size, 0);
    }

    #[test]
    fn cache_sees_commits() {
        let dir = tempfile::tempdir().unwrap();
        let source = DataSource::open(Config::new(dir.path()).with_cache("name", 16)).unwrap();
        assert!(ids(&source, "name", "alice").is_empty());

        source.commit(&xid(1), None, &[Command::add(EntityId(1), "name", "alice")]).unwrap();
        assert_eq!(ids(&source, "name", "alice"), vec![1]);
        assert_eq!(ids(&source, "name", "alice"), vec![1]);
        assert!(source.stats().cache_stats.hit_count >= 1);

        source.commit(&xid(2), None, &[Command::remove_entity(EntityId(1), "name")]).unwrap();
        assert!(ids(&source, "name", "alice").is_empty());
    }

    #[test]
    fn caching_tokenized_keys_is_unsupported() {
        let dir = tempfile::tempdir().unwrap();
        let config = Config::new(dir.path()).with_strategy(IndexStrategy::Fulltext);
        let source = DataSource::open(config).unwrap();
        assert_eq!(source.enable_cache("title", 4).unwrap_err().kind(), ErrorKind::Unsupported);
    }

    #[test]
    fn large_exact_results_are_lazy() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = Config::new(dir.path());
        config.lazy_threshold = 2;
        let source = DataSource::open(config).unwrap();
        let commands: Vec<Command> = (0..5).map(|i| Command::add(EntityId(i), "kind", "user")).collect();
        source.commit(&xid(1), None, &commands).unwrap();

        let hits = source.nodes("kind", "user").unwrap();
        assert!(hits.is_lazy());
        assert_eq!(hits.size(), 5);
        assert_eq!(source.stats().live_references, 1);
        assert_eq!(hits.into_ids().unwrap().len(), 5);
        assert_eq!(source.stats().live_references, 0);
    }

    #[test]
    fn second_open_of_the_same_directory_is_locked() {
        let dir = tempfile::tempdir().unwrap();
        let _source = open(dir.path());
        let err = DataSource::open(Config::new(dir.path())).err().unwrap();
        assert_eq!(err.kind(), ErrorKind::Locked);
    }

    #[test]
    fn closed_source_refuses_work() {
        let dir = tempfile::tempdir().unwrap();
        let source = open(dir.path());
        source.close().unwrap();
        assert_eq!(source.nodes("k", "v").err().unwrap().kind(), ErrorKind::InvalidState);
        assert!(source.close().is_ok());
    }
}
