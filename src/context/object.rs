use crate::core::ObjectId;
use crate::storage::{ObjectRecord, RelationValue};
use std::collections::{BTreeMap, BTreeSet};

/// Lifecycle of an object inside one context
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ObjectState {
    /// Created in this context, never committed
    Inserted,
    /// Loaded from the store and unchanged since
    Fetched,
    /// Loaded from the store and modified in memory
    Updated,
    /// Marked for removal on the next save
    Deleted,
}

impl ObjectState {
    pub fn is_dirty(&self) -> bool {
        !matches!(self, ObjectState::Fetched)
    }
}

/// An object registered with a context
#[derive(Debug, Clone)]
pub struct ManagedObject {
    pub id: ObjectId,
    pub record: ObjectRecord,
    pub state: ObjectState,
    /// Store version the record was loaded at; zero for inserted objects
    pub base_version: u64,
    /// Relationship links as of `base_version`; saves send the difference
    pub base_relations: BTreeMap<String, RelationValue>,
    /// Fields modified since the object was loaded
    pub changed: BTreeSet<String>,
}

impl ManagedObject {
    pub fn inserted(id: ObjectId, record: ObjectRecord) -> Self {
        Self {
            id,
            record,
            state: ObjectState::Inserted,
            base_version: 0,
            base_relations: BTreeMap::new(),
            changed: BTreeSet::new(),
        }
    }

    pub fn fetched(id: ObjectId, record: ObjectRecord) -> Self {
        let base_version = record.version;
        let base_relations = record.relations.clone();
        Self {
            id,
            record,
            state: ObjectState::Fetched,
            base_version,
            base_relations,
            changed: BTreeSet::new(),
        }
    }

    pub fn entity(&self) -> &str {
        &self.record.entity
    }

    pub fn is_deleted(&self) -> bool {
        self.state == ObjectState::Deleted
    }

    pub(crate) fn mark_changed(&mut self, field: &str) {
        if self.state == ObjectState::Fetched {
            self.state = ObjectState::Updated;
        }
        self.changed.insert(field.to_string());
    }

    /// Replace the record with a fresh copy from the store
    pub(crate) fn refresh(&mut self, record: ObjectRecord) {
        self.rebase(&record);
        self.record = record;
        self.state = ObjectState::Fetched;
        self.changed.clear();
    }

    /// Adopt the store row as the base of pending changes
    pub(crate) fn rebase(&mut self, stored: &ObjectRecord) {
        self.base_version = stored.version;
        self.base_relations = stored.relations.clone();
    }
}
