use tantivy::collector::DocSetCollector;
use tantivy::{DocAddress, Index, IndexReader, IndexWriter, ReloadPolicy, TantivyDocument};
use crate::core::config::MIN_WRITER_HEAP_BYTES;
use crate::core::error::{Error, Result};
use crate::core::types::EntityId;
use crate::index::strategy::{delete_query, entity_of, IndexStrategy, KeyFields};

/// In-memory index of one side (added or removed) of a transaction's
/// changes to a tokenized key.
struct TxIndex {
    index: Index,
    writer: IndexWriter,
    reader: IndexReader,
    fields: KeyFields,
    dirty: bool,
}

impl TxIndex {
    fn new(strategy: IndexStrategy) -> Result<Self> {
        let index = Index::create_in_ram(strategy.schema(true));
        IndexStrategy::register_tokenizers(&index);
        let fields = strategy.fields(&index.schema())?;
        let writer = index.writer_with_num_threads(1, MIN_WRITER_HEAP_BYTES)?;
        let reader: IndexReader = index
            .reader_builder()
            .reload_policy(ReloadPolicy::Manual)
            .try_into()?;
        Ok(TxIndex { index, writer, reader, fields, dirty: false })
    }

    fn insert(&mut self, doc: TantivyDocument) -> Result<()> {
        self.writer.add_document(doc)?;
        self.dirty = true;
        Ok(())
    }

    fn delete(&mut self, entity: EntityId, value: Option<&str>) -> Result<()> {
        if let Some(query) = delete_query(&self.fields, Some(entity), value) {
            self.writer.delete_query(query)?;
            self.dirty = true;
        }
        Ok(())
    }

    /// Entities hit by `value`'s query or by an entity marker.
    fn matches(&mut self, strategy: IndexStrategy, value: &str) -> Result<Vec<EntityId>> {
        if self.dirty {
            self.writer.commit()?;
            self.reader.reload()?;
            self.dirty = false;
        }
        let query = IndexStrategy::with_marker(&self.fields, strategy.form_query(&self.index, &self.fields, value)?);
        let searcher = self.reader.searcher();
        let mut addresses: Vec<DocAddress> = searcher.search(query.as_ref(), &DocSetCollector)?.into_iter().collect();
        addresses.sort();

        let mut ids = Vec::with_capacity(addresses.len());
        for address in addresses {
            let doc: TantivyDocument = searcher.doc(address)?;
            let entity = entity_of(&doc, &self.fields)
                .ok_or_else(|| Error::corrupt(format!("transaction document {:?} has no entity id", address)))?;
            if !ids.contains(&entity) {
                ids.push(entity);
            }
        }
        Ok(ids)
    }
}

/// Uncommitted changes to a tokenized key, kept searchable.
///
/// Lookups inside the transaction form the same query the committed index
/// gets and run it here too, so that word matching agrees on both sides.
pub struct FulltextOverlay {
    strategy: IndexStrategy,
    added: TxIndex,
    removed: TxIndex,
}

impl FulltextOverlay {
    pub fn new(strategy: IndexStrategy) -> Result<Self> {
        Ok(FulltextOverlay {
            strategy,
            added: TxIndex::new(strategy)?,
            removed: TxIndex::new(strategy)?,
        })
    }

    pub fn add(&mut self, entity: EntityId, value: &str) -> Result<()> {
        self.removed.delete(entity, Some(value))?;
        self.added.delete(entity, Some(value))?;
        let doc = self.strategy.document(&self.added.fields, entity, value);
        self.added.insert(doc)
    }

    /// Mirrors a value removal; `cancelled` says the overlay only dropped a
    /// pending add.
    pub fn remove_value(&mut self, entity: EntityId, value: &str, cancelled: bool) -> Result<()> {
        if cancelled {
            return self.added.delete(entity, Some(value));
        }
        let doc = self.strategy.document(&self.removed.fields, entity, value);
        self.removed.insert(doc)
    }

    pub fn remove_entity(&mut self, entity: EntityId) -> Result<()> {
        self.added.delete(entity, None)?;
        self.removed.delete(entity, None)?;
        let marker = IndexStrategy::marker_document(&self.removed.fields, entity)?;
        self.removed.insert(marker)
    }

    /// Starts over, for a dropped key.
    pub fn reset(&mut self) -> Result<()> {
        *self = FulltextOverlay::new(self.strategy)?;
        Ok(())
    }

    pub fn added_matches(&mut self, value: &str) -> Result<Vec<EntityId>> {
        self.added.matches(self.strategy, value)
    }

    /// Entities whose removed values (or entity marker) match `value`.
    ///
    /// Matching is per entity, not per value: an entity is reported even if
    /// another of its committed values still matches, so reads inside the
    /// transaction hide it although a read after commit would return it.
    pub fn removed_matches(&mut self, value: &str) -> Result<Vec<EntityId>> {
        self.removed.matches(self.strategy, value)
    }
}
