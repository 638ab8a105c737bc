use std::collections::HashSet;
use tantivy::{DocAddress, TantivyDocument};
use crate::core::error::{Error, ErrorKind, Result};
use crate::core::types::EntityId;
use crate::index::strategy::{entity_of, KeyFields};
use crate::reader::searcher_ref::SearcherCheckout;

/// Entities matching a lookup, in index order, with a size known up front.
///
/// Small results are fully materialized. Larger ones hold a checkout of the
/// searcher they were computed on and load entity ids as they are iterated,
/// so the searcher cannot be closed underneath the iteration.
pub struct IndexHits {
    size: usize,
    inner: Inner,
}

enum Inner {
    Materialized(std::vec::IntoIter<EntityId>),
    Lazy(LazyHits),
}

struct LazyHits {
    checkout: Option<SearcherCheckout>,
    addresses: std::vec::IntoIter<DocAddress>,
    fields: KeyFields,
    seen: HashSet<EntityId>,
}

impl IndexHits {
    pub fn empty() -> Self {
        IndexHits::materialized(Vec::new())
    }

    pub fn materialized(ids: Vec<EntityId>) -> Self {
        IndexHits {
            size: ids.len(),
            inner: Inner::Materialized(ids.into_iter()),
        }
    }

    pub(crate) fn lazy(checkout: SearcherCheckout, addresses: Vec<DocAddress>, fields: KeyFields) -> Self {
        IndexHits {
            size: addresses.len(),
            inner: Inner::Lazy(LazyHits {
                checkout: Some(checkout),
                addresses: addresses.into_iter(),
                fields,
                seen: HashSet::new(),
            }),
        }
    }

    pub fn size(&self) -> usize {
        self.size
    }

    pub fn is_lazy(&self) -> bool {
        matches!(self.inner, Inner::Lazy(_))
    }

    pub fn into_ids(self) -> Result<Vec<EntityId>> {
        self.collect()
    }

    /// The only hit, `None` for no hits, an error for more than one.
    pub fn single(mut self) -> Result<Option<EntityId>> {
        let first = match self.next() {
            None => return Ok(None),
            Some(hit) => hit?,
        };
        match self.next() {
            None => Ok(Some(first)),
            Some(second) => Err(Error::new(
                ErrorKind::Cardinality,
                format!("more than one hit: {} and {}", first, second?),
            )),
        }
    }
}

impl Iterator for IndexHits {
    type Item = Result<EntityId>;

    fn next(&mut self) -> Option<Self::Item> {
        match &mut self.inner {
            Inner::Materialized(ids) => ids.next().map(Ok),
            Inner::Lazy(lazy) => lazy.next(),
        }
    }
}

impl LazyHits {
    fn next(&mut self) -> Option<Result<EntityId>> {
        loop {
            let checkout = self.checkout.as_ref()?;
            let Some(address) = self.addresses.next() else {
                self.finish();
                return None;
            };
            let doc: TantivyDocument = match checkout.searcher().doc(address) {
                Ok(doc) => doc,
                Err(err) => {
                    self.finish();
                    return Some(Err(err.into()));
                }
            };
            let Some(entity) = entity_of(&doc, &self.fields) else {
                self.finish();
                return Some(Err(Error::corrupt(format!("document {:?} has no entity id", address))));
            };
            if self.seen.insert(entity) {
                return Some(Ok(entity));
            }
        }
    }

    fn finish(&mut self) {
        if let Some(checkout) = self.checkout.take() {
            let key = checkout.owner().key().to_string();
            if checkout.release() {
                tracing::debug!(key = %key, "closed superseded searcher after lazy iteration");
            }
        }
    }
}
