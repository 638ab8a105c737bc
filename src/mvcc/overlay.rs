use std::collections::{HashMap, HashSet};
use crate::core::types::EntityId;

/// value -> entities, with the reverse entity -> values index kept in step.
#[derive(Debug, Default, Clone)]
pub struct ValueMap {
    by_value: HashMap<String, HashSet<EntityId>>,
    by_entity: HashMap<EntityId, HashSet<String>>,
}

impl ValueMap {
    pub fn insert(&mut self, entity: EntityId, value: &str) -> bool {
        let added = self.by_value.entry(value.to_string()).or_default().insert(entity);
        self.by_entity.entry(entity).or_default().insert(value.to_string());
        added
    }

    pub fn remove(&mut self, entity: EntityId, value: &str) -> bool {
        let removed = match self.by_value.get_mut(value) {
            Some(ids) => {
                let removed = ids.remove(&entity);
                if ids.is_empty() {
                    self.by_value.remove(value);
                }
                removed
            }
            None => false,
        };
        if let Some(values) = self.by_entity.get_mut(&entity) {
            values.remove(value);
            if values.is_empty() {
                self.by_entity.remove(&entity);
            }
        }
        removed
    }

    /// Drops every value of `entity`, returning the values it had.
    pub fn remove_entity(&mut self, entity: EntityId) -> Vec<String> {
        let values: Vec<String> = self
            .by_entity
            .remove(&entity)
            .map(|values| values.into_iter().collect())
            .unwrap_or_default();
        for value in &values {
            if let Some(ids) = self.by_value.get_mut(value) {
                ids.remove(&entity);
                if ids.is_empty() {
                    self.by_value.remove(value);
                }
            }
        }
        values
    }

    pub fn contains(&self, entity: EntityId, value: &str) -> bool {
        self.by_value.get(value).is_some_and(|ids| ids.contains(&entity))
    }

    pub fn ids(&self, value: &str) -> Option<&HashSet<EntityId>> {
        self.by_value.get(value)
    }

    pub fn is_empty(&self) -> bool {
        self.by_value.is_empty()
    }

    pub fn clear(&mut self) {
        self.by_value.clear();
        self.by_entity.clear();
    }
}

/// Uncommitted changes of one transaction to one key.
///
/// A triple is never in both `added` and `removed`: recording it on one
/// side takes it off the other.
#[derive(Debug, Default, Clone)]
pub struct KeyOverlay {
    pub added: ValueMap,
    pub removed: ValueMap,
    /// Entities whose every committed mapping under this key is removed.
    pub removed_entities: HashSet<EntityId>,
    /// The whole key index is dropped.
    pub all: bool,
}

impl KeyOverlay {
    pub fn add(&mut self, entity: EntityId, value: &str) {
        self.removed.remove(entity, value);
        self.added.insert(entity, value);
    }

    /// Cancels a pending add if there is one, else records a removal.
    /// Returns whether an add was cancelled.
    pub fn remove_value(&mut self, entity: EntityId, value: &str) -> bool {
        if self.added.remove(entity, value) {
            return true;
        }
        self.removed.insert(entity, value);
        false
    }

    /// Returns the values whose pending adds were cancelled.
    pub fn remove_entity(&mut self, entity: EntityId) -> Vec<String> {
        let cancelled = self.added.remove_entity(entity);
        self.removed.remove_entity(entity);
        self.removed_entities.insert(entity);
        cancelled
    }

    pub fn drop_all(&mut self) {
        self.added.clear();
        self.removed.clear();
        self.removed_entities.clear();
        self.all = true;
    }

    pub fn added_for(&self, value: &str) -> impl Iterator<Item = EntityId> + '_ {
        self.added.ids(value).into_iter().flatten().copied()
    }

    /// Whether a committed `(entity, value)` is hidden from this transaction.
    pub fn hides(&self, entity: EntityId, value: &str) -> bool {
        self.all || self.removed_entities.contains(&entity) || self.removed.contains(entity, value)
    }

    pub fn is_untouched(&self) -> bool {
        self.added.is_empty() && self.removed.is_empty() && self.removed_entities.is_empty() && !self.all
    }
}
