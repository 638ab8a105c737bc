use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use uuid::Uuid;
use crate::core::config::Config;
use crate::core::error::{Error, ErrorKind, Result};
use crate::core::stats::DataSourceStats;
use crate::core::transaction::IndexTransaction;
use crate::core::types::{EntityId, Isolation, Mutation};
use crate::index::data_source::DataSource;
use crate::reader::hits::IndexHits;
use crate::storage::metadata::MetadataRecord;
use crate::xa::resource::{Vote, XaDataSource, XaResource};
use crate::xa::xid::Xid;

/// Entry point of the index: owns the data source and hands out
/// connections.
///
/// Reads through the service see committed state only.
pub struct IndexService {
    source: Arc<DataSource>,
    local_xids: Arc<AtomicU64>,
}

impl IndexService {
    pub fn open(config: Config) -> Result<Self> {
        let source = Arc::new(DataSource::open(config)?);
        Ok(IndexService {
            source,
            // seeded so local xids from an earlier run do not collide with
            // in-doubt ones found by recovery
            local_xids: Arc::new(AtomicU64::new(Uuid::new_v4().as_u64_pair().0)),
        })
    }

    pub fn connect(&self) -> IndexConnection {
        IndexConnection {
            source: Arc::clone(&self.source),
            local_xids: Arc::clone(&self.local_xids),
            tx: None,
        }
    }

    pub fn data_source(&self) -> &Arc<DataSource> {
        &self.source
    }

    pub fn nodes(&self, key: &str, value: &str) -> Result<IndexHits> {
        self.source.nodes(key, value)
    }

    pub fn single_node(&self, key: &str, value: &str) -> Result<Option<EntityId>> {
        self.source.nodes(key, value)?.single()
    }

    pub fn enable_cache(&self, key: &str, capacity: usize) -> Result<()> {
        self.source.enable_cache(key, capacity)
    }

    pub fn recovery_complete(&self) -> Result<()> {
        self.source.recovery_complete()
    }

    pub fn stats(&self) -> DataSourceStats {
        self.source.stats()
    }

    pub fn shutdown(&self) -> Result<()> {
        self.source.close()
    }
}

/// A client session. Holds at most one transaction at a time and is not
/// meant to be shared between threads.
pub struct IndexConnection {
    source: Arc<DataSource>,
    local_xids: Arc<AtomicU64>,
    tx: Option<IndexTransaction>,
}

impl IndexConnection {
    pub fn index(&mut self, entity: EntityId, key: &str, value: &str) -> Result<()> {
        self.transaction()?.index(entity, key, value)
    }

    pub fn remove_value(&mut self, entity: EntityId, key: &str, value: &str) -> Result<()> {
        self.transaction()?.remove_value(entity, key, value)
    }

    pub fn remove_entity(&mut self, entity: EntityId, key: &str) -> Result<()> {
        self.transaction()?.remove_entity(entity, key)
    }

    pub fn drop_key(&mut self, key: &str) -> Result<()> {
        self.transaction()?.drop_key(key)
    }

    /// Runs `mutation` in this connection's transaction, or with
    /// `OtherTxSync` in a private one committed before returning.
    pub fn apply(&mut self, isolation: Isolation, mutation: Mutation) -> Result<()> {
        match isolation {
            Isolation::SameTx => self.transaction()?.apply(mutation),
            Isolation::OtherTxSync => {
                let xid = Xid::local(self.local_xids.fetch_add(1, Ordering::Relaxed));
                let mut tx = IndexTransaction::begin(Arc::clone(&self.source), xid);
                tx.apply(mutation)?;
                if tx.prepare()? == Vote::Ok {
                    tx.commit(false)?;
                }
                Ok(())
            }
        }
    }

    /// Lookup through the current transaction if there is one.
    pub fn nodes(&mut self, key: &str, value: &str) -> Result<IndexHits> {
        match self.tx.as_mut() {
            Some(tx) => tx.nodes(key, value),
            None => self.source.nodes(key, value),
        }
    }

    pub fn single_node(&mut self, key: &str, value: &str) -> Result<Option<EntityId>> {
        self.nodes(key, value)?.single()
    }

    pub fn current_xid(&self) -> Option<&Xid> {
        self.tx.as_ref().map(|tx| tx.xid())
    }

    fn transaction(&mut self) -> Result<&mut IndexTransaction> {
        self.tx
            .as_mut()
            .ok_or_else(|| Error::new(ErrorKind::NoTransaction, "no transaction started on this connection"))
    }

    /// The connection's transaction if it is `xid`.
    fn branch(&mut self, xid: &Xid) -> Option<&mut IndexTransaction> {
        self.tx.as_mut().filter(|tx| tx.xid() == xid)
    }

    fn clear_finished(&mut self) {
        if self.tx.as_ref().is_some_and(|tx| tx.is_finished()) {
            self.tx = None;
        }
    }
}

impl XaResource for IndexConnection {
    fn start(&mut self, xid: &Xid) -> Result<()> {
        if let Some(tx) = &self.tx {
            if tx.xid() == xid {
                return Ok(());
            }
            return Err(Error::invalid_state(format!(
                "connection is already in transaction {:?}",
                tx.xid()
            )));
        }
        self.tx = Some(IndexTransaction::begin(Arc::clone(&self.source), xid.clone()));
        Ok(())
    }

    fn end(&mut self, xid: &Xid) -> Result<()> {
        match self.branch(xid) {
            Some(_) => Ok(()),
            None => Err(unknown_xid(xid)),
        }
    }

    fn prepare(&mut self, xid: &Xid) -> Result<Vote> {
        let tx = self.branch(xid).ok_or_else(|| unknown_xid(xid))?;
        let vote = tx.prepare()?;
        self.clear_finished();
        Ok(vote)
    }

    fn commit(&mut self, xid: &Xid, one_phase: bool) -> Result<()> {
        if let Some(tx) = self.branch(xid) {
            let result = tx.commit(one_phase);
            self.clear_finished();
            return result;
        }
        if self.source.resolve_in_doubt(xid, true)? {
            return Ok(());
        }
        Err(unknown_xid(xid))
    }

    fn rollback(&mut self, xid: &Xid) -> Result<()> {
        if let Some(tx) = self.branch(xid) {
            let result = tx.rollback();
            self.clear_finished();
            return result;
        }
        if self.source.resolve_in_doubt(xid, false)? {
            return Ok(());
        }
        Err(unknown_xid(xid))
    }

    fn recover(&self) -> Result<Vec<Xid>> {
        Ok(self.source.in_doubt())
    }

    fn identity(&self) -> MetadataRecord {
        self.source.identity()
    }
}

fn unknown_xid(xid: &Xid) -> Error {
    Error::new(ErrorKind::NotFound, format!("no transaction branch {:?} here", xid))
}
