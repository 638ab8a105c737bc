use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;
use crate::core::error::{Error, ErrorKind, Result};
use crate::core::types::{EntityId, Mutation};
use crate::index::data_source::DataSource;
use crate::mvcc::fulltext::FulltextOverlay;
use crate::mvcc::overlay::KeyOverlay;
use crate::reader::hits::IndexHits;
use crate::storage::command::Command;
use crate::xa::resource::Vote;
use crate::xa::xid::Xid;

/// Transaction state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransactionState {
    Active,
    Prepared,
    Committed,
    RolledBack,
}

/// One transaction branch against the index.
///
/// Mutations are staged as commands and mirrored into per-key overlays so
/// the transaction reads its own writes. Nothing reaches the data source
/// before prepare.
pub struct IndexTransaction {
    xid: Xid,
    state: TransactionState,
    source: Arc<DataSource>,

    overlays: HashMap<String, KeyOverlay>,
    fulltext: HashMap<String, FulltextOverlay>, // tokenized strategies only
    commands: Vec<Command>,

    prepared: Option<i32>, // local id in the log once prepared
}

impl IndexTransaction {
    pub fn begin(source: Arc<DataSource>, xid: Xid) -> Self {
        IndexTransaction {
            xid,
            state: TransactionState::Active,
            source,
            overlays: HashMap::new(),
            fulltext: HashMap::new(),
            commands: Vec::new(),
            prepared: None,
        }
    }

    pub fn xid(&self) -> &Xid {
        &self.xid
    }

    pub fn state(&self) -> TransactionState {
        self.state
    }

    pub fn is_finished(&self) -> bool {
        matches!(self.state, TransactionState::Committed | TransactionState::RolledBack)
    }

    pub fn apply(&mut self, mutation: Mutation) -> Result<()> {
        match mutation {
            Mutation::Add { entity, key, value } => self.index(entity, &key, &value),
            Mutation::RemoveValue { entity, key, value } => self.remove_value(entity, &key, &value),
            Mutation::RemoveEntity { entity, key } => self.remove_entity(entity, &key),
            Mutation::DropKey { key } => self.drop_key(&key),
        }
    }

    pub fn index(&mut self, entity: EntityId, key: &str, value: &str) -> Result<()> {
        self.check_active()?;
        check_entity(entity)?;
        check_value(value)?;

        self.overlay(key).add(entity, value);
        if let Some(fulltext) = self.fulltext_overlay(key)? {
            fulltext.add(entity, value)?;
        }

        self.commands.push(Command::add(entity, key, value));
        Ok(())
    }

    pub fn remove_value(&mut self, entity: EntityId, key: &str, value: &str) -> Result<()> {
        self.check_active()?;
        check_entity(entity)?;
        check_value(value)?;

        let cancelled = self.overlay(key).remove_value(entity, value);
        if let Some(fulltext) = self.fulltext_overlay(key)? {
            fulltext.remove_value(entity, value, cancelled)?;
        }

        self.commands.push(Command::remove_value(entity, key, value));
        Ok(())
    }

    pub fn remove_entity(&mut self, entity: EntityId, key: &str) -> Result<()> {
        self.check_active()?;
        check_entity(entity)?;

        self.overlay(key).remove_entity(entity);
        if let Some(fulltext) = self.fulltext_overlay(key)? {
            fulltext.remove_entity(entity)?;
        }

        self.commands.push(Command::remove_entity(entity, key));
        Ok(())
    }

    pub fn drop_key(&mut self, key: &str) -> Result<()> {
        self.check_active()?;

        self.overlay(key).drop_all();
        if let Some(fulltext) = self.fulltext_overlay(key)? {
            fulltext.reset()?;
        }

        self.commands.push(Command::drop_key(key));
        Ok(())
    }

    /// Entities with `key` matching `value` as this transaction sees them:
    /// committed state minus its removals, plus its additions.
    pub fn nodes(&mut self, key: &str, value: &str) -> Result<IndexHits> {
        let untouched = self.overlays.get(key).is_none_or(|overlay| overlay.is_untouched());
        if untouched {
            return self.source.nodes(key, value);
        }
        let Some(overlay) = self.overlays.get(key) else {
            return Ok(IndexHits::empty());
        };

        let committed = if overlay.all {
            Vec::new()
        } else {
            self.source.nodes(key, value)?.into_ids()?
        };

        let mut seen = HashSet::new();
        let mut ids = Vec::with_capacity(committed.len());
        match self.fulltext.get_mut(key) {
            Some(fulltext) => {
                let hidden: HashSet<EntityId> = fulltext.removed_matches(value)?.into_iter().collect();
                for id in committed {
                    if !hidden.contains(&id) && seen.insert(id) {
                        ids.push(id);
                    }
                }
                for id in fulltext.added_matches(value)? {
                    if seen.insert(id) {
                        ids.push(id);
                    }
                }
            }
            None => {
                for id in committed {
                    if !overlay.hides(id, value) && seen.insert(id) {
                        ids.push(id);
                    }
                }
                let mut added: Vec<EntityId> = overlay.added_for(value).collect();
                added.sort();
                for id in added {
                    if seen.insert(id) {
                        ids.push(id);
                    }
                }
            }
        }
        Ok(IndexHits::materialized(ids))
    }

    /// Phase one: logs the staged commands, grouped per key.
    ///
    /// A transaction that staged nothing votes read-only and is finished.
    pub fn prepare(&mut self) -> Result<Vote> {
        self.check_active()?;
        if self.commands.is_empty() {
            self.finish(TransactionState::Committed);
            return Ok(Vote::ReadOnly);
        }

        let commands = self.ordered_commands();
        let local_id = self.source.prepare(&self.xid, &commands)?;
        self.commands = commands;
        self.prepared = Some(local_id);
        self.state = TransactionState::Prepared;
        Ok(Vote::Ok)
    }

    /// Phase two, or both phases at once with `one_phase`.
    pub fn commit(&mut self, one_phase: bool) -> Result<()> {
        match (self.state, one_phase) {
            (TransactionState::Active, true) => {
                if !self.commands.is_empty() {
                    let commands = self.ordered_commands();
                    self.source.commit(&self.xid, None, &commands)?;
                }
            }
            (TransactionState::Prepared, false) => {
                self.source.commit(&self.xid, self.prepared, &self.commands)?;
            }
            (TransactionState::Active, false) => {
                return Err(Error::invalid_state("two-phase commit of a transaction that is not prepared"));
            }
            (TransactionState::Prepared, true) => {
                return Err(Error::invalid_state("one-phase commit of a prepared transaction"));
            }
            (state, _) => {
                return Err(Error::invalid_state(format!("cannot commit a transaction in state {:?}", state)));
            }
        }
        self.finish(TransactionState::Committed);
        Ok(())
    }

    /// Discards everything staged. A prepared transaction is also marked
    /// finished in the log; the index itself is never touched.
    pub fn rollback(&mut self) -> Result<()> {
        match self.state {
            TransactionState::Active => {}
            TransactionState::Prepared => {
                if let Some(local_id) = self.prepared {
                    self.source.rollback_prepared(local_id)?;
                }
            }
            state => {
                return Err(Error::invalid_state(format!("cannot roll back a transaction in state {:?}", state)));
            }
        }
        self.finish(TransactionState::RolledBack);
        Ok(())
    }

    fn finish(&mut self, state: TransactionState) {
        self.state = state;
        self.overlays.clear();
        self.fulltext.clear();
        self.commands.clear();
        self.prepared = None;
    }

    /// Commands grouped by key in key order, staging order within a key.
    fn ordered_commands(&self) -> Vec<Command> {
        let mut by_key: BTreeMap<&str, Vec<&Command>> = BTreeMap::new();
        for command in &self.commands {
            by_key.entry(command.key()).or_default().push(command);
        }
        by_key.into_values().flatten().cloned().collect()
    }

    fn overlay(&mut self, key: &str) -> &mut KeyOverlay {
        self.overlays.entry(key.to_string()).or_default()
    }

    fn fulltext_overlay(&mut self, key: &str) -> Result<Option<&mut FulltextOverlay>> {
        let strategy = self.source.strategy();
        if !strategy.is_tokenized() {
            return Ok(None);
        }
        if !self.fulltext.contains_key(key) {
            self.fulltext.insert(key.to_string(), FulltextOverlay::new(strategy)?);
        }
        Ok(self.fulltext.get_mut(key))
    }

    fn check_active(&self) -> Result<()> {
        if self.state != TransactionState::Active {
            return Err(Error::invalid_state(format!("transaction is {:?}, not active", self.state)));
        }
        Ok(())
    }
}

fn check_entity(entity: EntityId) -> Result<()> {
    if entity.0 < 0 {
        return Err(Error::new(ErrorKind::InvalidArgument, format!("negative entity id {}", entity)));
    }
    Ok(())
}

fn check_value(value: &str) -> Result<()> {
    if value.is_empty() {
        return Err(Error::new(ErrorKind::InvalidArgument, "index values must not be empty"));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::config::Config;
    use crate::index::strategy::IndexStrategy;

    fn source(dir: &std::path::Path, strategy: IndexStrategy) -> Arc<DataSource> {
        Arc::new(DataSource::open(Config::new(dir).with_strategy(strategy)).unwrap())
    }

    fn xid(n: u8) -> Xid {
        Xid::new(1, vec![n], vec![]).unwrap()
    }

    fn ids(tx: &mut IndexTransaction, key: &str, value: &str) -> Vec<i64> {
        let mut ids: Vec<i64> = tx.nodes(key, value).unwrap().into_ids().unwrap().into_iter().map(|id| id.0).collect();
        ids.sort();
        ids
    }

    #[test]
    fn commands_are_grouped_per_key_in_staging_order() {
        let dir = tempfile::tempdir().unwrap();
        let mut tx = IndexTransaction::begin(source(dir.path(), IndexStrategy::Exact), xid(1));
        tx.index(EntityId(1), "b", "x").unwrap();
        tx.index(EntityId(2), "a", "y").unwrap();
        tx.remove_value(EntityId(1), "b", "x").unwrap();
        tx.remove_entity(EntityId(3), "a").unwrap();

        let ordered = tx.ordered_commands();
        assert_eq!(ordered.len(), 4);
        assert_eq!(ordered[0], Command::add(EntityId(2), "a", "y"));
        assert_eq!(ordered[1], Command::remove_entity(EntityId(3), "a"));
        assert_eq!(ordered[2], Command::add(EntityId(1), "b", "x"));
        assert_eq!(ordered[3], Command::remove_value(EntityId(1), "b", "x"));
    }

    #[test]
    fn empty_transaction_votes_read_only() {
        let dir = tempfile::tempdir().unwrap();
        let source = source(dir.path(), IndexStrategy::Exact);
        let mut tx = IndexTransaction::begin(Arc::clone(&source), xid(1));
        assert_eq!(tx.prepare().unwrap(), Vote::ReadOnly);
        assert!(tx.is_finished());
        assert_eq!(source.stats().open_transactions, 0);
    }

    #[test]
    fn exact_overlay_reads_own_writes() {
        let dir = tempfile::tempdir().unwrap();
        let source = source(dir.path(), IndexStrategy::Exact);
        let mut setup = IndexTransaction::begin(Arc::clone(&source), xid(1));
        setup.index(EntityId(1), "name", "alice").unwrap();
        setup.index(EntityId(2), "name", "alice").unwrap();
        setup.commit(true).unwrap();

        let mut tx = IndexTransaction::begin(source, xid(2));
        tx.index(EntityId(3), "name", "alice").unwrap();
        tx.remove_value(EntityId(1), "name", "alice").unwrap();
        assert_eq!(ids(&mut tx, "name", "alice"), vec![2, 3]);

        tx.remove_entity(EntityId(2), "name").unwrap();
        assert_eq!(ids(&mut tx, "name", "alice"), vec![3]);

        tx.drop_key("name").unwrap();
        assert!(ids(&mut tx, "name", "alice").is_empty());
        tx.index(EntityId(9), "name", "alice").unwrap();
        assert_eq!(ids(&mut tx, "name", "alice"), vec![9]);
    }

    #[test]
    fn fulltext_overlay_reads_own_writes() {
        let dir = tempfile::tempdir().unwrap();
        let source = source(dir.path(), IndexStrategy::Fulltext);
        let mut setup = IndexTransaction::begin(Arc::clone(&source), xid(1));
        setup.index(EntityId(1), "title", "Quick Brown Fox").unwrap();
        setup.index(EntityId(2), "title", "quick silver").unwrap();
        setup.commit(true).unwrap();

        let mut tx = IndexTransaction::begin(source, xid(2));
        assert_eq!(ids(&mut tx, "title", "QUICK"), vec![1, 2]);

        tx.remove_value(EntityId(1), "title", "Quick Brown Fox").unwrap();
        tx.index(EntityId(3), "title", "a quick test").unwrap();
        assert_eq!(ids(&mut tx, "title", "quick"), vec![2, 3]);

        tx.remove_entity(EntityId(2), "title").unwrap();
        assert_eq!(ids(&mut tx, "title", "quick"), vec![3]);
    }

    #[test]
    fn fulltext_removal_hides_the_entity_until_commit() {
        let dir = tempfile::tempdir().unwrap();
        let source = source(dir.path(), IndexStrategy::Fulltext);
        let mut setup = IndexTransaction::begin(Arc::clone(&source), xid(1));
        setup.index(EntityId(1), "title", "quick fox").unwrap();
        setup.index(EntityId(1), "title", "quick dog").unwrap();
        setup.commit(true).unwrap();

        let mut tx = IndexTransaction::begin(Arc::clone(&source), xid(2));
        tx.remove_value(EntityId(1), "title", "quick fox").unwrap();
        // "quick dog" still matches, but the removal hides the whole entity here
        assert!(ids(&mut tx, "title", "quick").is_empty());
        assert_eq!(ids(&mut tx, "title", "dog"), vec![1]);
        tx.commit(true).unwrap();

        let mut after = IndexTransaction::begin(source, xid(3));
        assert_eq!(ids(&mut after, "title", "quick"), vec![1]);
        assert!(ids(&mut after, "title", "fox").is_empty());
    }

    #[test]
    fn invalid_arguments_and_states() {
        let dir = tempfile::tempdir().unwrap();
        let mut tx = IndexTransaction::begin(source(dir.path(), IndexStrategy::Exact), xid(1));
        assert_eq!(tx.index(EntityId(-1), "k", "v").unwrap_err().kind(), ErrorKind::InvalidArgument);
        assert_eq!(tx.index(EntityId(1), "k", "").unwrap_err().kind(), ErrorKind::InvalidArgument);

        tx.index(EntityId(1), "k", "v").unwrap();
        assert_eq!(tx.commit(false).unwrap_err().kind(), ErrorKind::InvalidState);
        assert_eq!(tx.prepare().unwrap(), Vote::Ok);
        assert_eq!(tx.index(EntityId(2), "k", "v").unwrap_err().kind(), ErrorKind::InvalidState);
        tx.rollback().unwrap();
        assert_eq!(tx.state(), TransactionState::RolledBack);
        assert!(tx.rollback().is_err());
    }
}
