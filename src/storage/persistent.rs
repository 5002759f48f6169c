//! The persistent store: committed object rows shared by every context.

use super::catalog::EntityCatalog;
use super::descriptor::RelationshipDescriptor;
use super::persistence::{SnapshotManager, StoreSnapshot};
use super::record::{ObjectRecord, RelationValue};
use crate::config::StoreKind;
use crate::context::MergePolicy;
use crate::core::{ContextId, DaoError, ObjectId, Result};
use crate::expression::Predicate;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::RwLock;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::broadcast;
use uuid::Uuid;

/// One object change submitted by a context save
#[derive(Debug, Clone)]
pub enum PendingWrite {
    Insert {
        id: ObjectId,
        record: ObjectRecord,
    },
    Update {
        id: ObjectId,
        /// Row version the context read before changing the object
        base_version: u64,
        /// Relationship links as read at `base_version`
        base_relations: BTreeMap<String, RelationValue>,
        record: ObjectRecord,
        /// Attribute and relationship names modified in memory
        changed: BTreeSet<String>,
    },
    Delete {
        id: ObjectId,
        base_version: u64,
    },
}

impl PendingWrite {
    pub fn id(&self) -> ObjectId {
        match self {
            PendingWrite::Insert { id, .. }
            | PendingWrite::Update { id, .. }
            | PendingWrite::Delete { id, .. } => *id,
        }
    }
}

/// Notification published after every successful commit
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StoreChange {
    pub origin: ContextId,
    pub inserted: Vec<ObjectId>,
    pub updated: Vec<ObjectId>,
    pub deleted: Vec<ObjectId>,
}

impl StoreChange {
    fn new(origin: ContextId) -> Self {
        Self {
            origin,
            ..Default::default()
        }
    }

    pub fn is_empty(&self) -> bool {
        self.inserted.is_empty() && self.updated.is_empty() && self.deleted.is_empty()
    }

    fn mark_updated(&mut self, id: ObjectId) {
        if !self.inserted.contains(&id) && !self.updated.contains(&id) {
            self.updated.push(id);
        }
    }
}

pub struct PersistentStore {
    id: Uuid,
    catalog: EntityCatalog,
    rows: RwLock<im::OrdMap<ObjectId, ObjectRecord>>,
    next_id: AtomicU64,
    changes: broadcast::Sender<StoreChange>,
    snapshot: Option<SnapshotManager>,
}

impl std::fmt::Debug for PersistentStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PersistentStore")
            .field("id", &self.id)
            .field("entities", &self.catalog.entity_names())
            .field("snapshot", &self.snapshot.as_ref().map(|s| s.path().to_path_buf()))
            .finish()
    }
}

impl PersistentStore {
    /// Open a store, reloading the snapshot file of a binary store if present
    pub fn open(kind: &StoreKind, catalog: EntityCatalog, change_buffer: usize) -> Result<Self> {
        let (changes, _) = broadcast::channel(change_buffer.max(1));
        let snapshot = match kind {
            StoreKind::Memory => None,
            StoreKind::Binary(path) => Some(SnapshotManager::new(path)),
        };

        let (rows, next_id) = match snapshot.as_ref().map(|s| s.load()).transpose()?.flatten() {
            Some(loaded) => {
                for record in loaded.rows.values() {
                    catalog.entity(&record.entity)?;
                }
                log::debug!(
                    "Loaded {} rows from snapshot written at {}",
                    loaded.metadata.row_count,
                    loaded.metadata.created_at
                );
                (loaded.rows, loaded.next_id)
            }
            None => (im::OrdMap::new(), 1),
        };

        Ok(Self {
            id: Uuid::new_v4(),
            catalog,
            rows: RwLock::new(rows),
            next_id: AtomicU64::new(next_id),
            changes,
            snapshot,
        })
    }

    pub fn in_memory(catalog: EntityCatalog) -> Self {
        let (changes, _) = broadcast::channel(1024);
        Self {
            id: Uuid::new_v4(),
            catalog,
            rows: RwLock::new(im::OrdMap::new()),
            next_id: AtomicU64::new(1),
            changes,
            snapshot: None,
        }
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn catalog(&self) -> &EntityCatalog {
        &self.catalog
    }

    pub fn allocate_id(&self) -> ObjectId {
        ObjectId(self.next_id.fetch_add(1, Ordering::SeqCst))
    }

    pub fn subscribe(&self) -> broadcast::Receiver<StoreChange> {
        self.changes.subscribe()
    }

    pub fn record(&self, id: ObjectId) -> Result<Option<ObjectRecord>> {
        Ok(self.rows.read()?.get(&id).cloned())
    }

    /// Point-in-time view of every committed row
    pub fn rows(&self) -> Result<im::OrdMap<ObjectId, ObjectRecord>> {
        Ok(self.rows.read()?.clone())
    }

    pub fn count(&self, entity: &str) -> Result<usize> {
        self.catalog.entity(entity)?;
        Ok(self
            .rows
            .read()?
            .values()
            .filter(|record| record.entity == entity)
            .count())
    }

    /// Apply a batch of writes atomically.
    ///
    /// Conflicts are detected against the row versions the context read. Under
    /// `MergePolicy::Error` any conflict aborts the whole batch before a single
    /// row changes.
    pub fn commit(
        &self,
        writes: Vec<PendingWrite>,
        policy: MergePolicy,
        origin: ContextId,
    ) -> Result<StoreChange> {
        let mut guard = self.rows.write()?;
        let mut rows = guard.clone();
        let mut change = StoreChange::new(origin);

        if policy == MergePolicy::Error {
            for write in &writes {
                let (id, base_version) = match write {
                    PendingWrite::Update {
                        id, base_version, ..
                    }
                    | PendingWrite::Delete { id, base_version } => (*id, *base_version),
                    PendingWrite::Insert { .. } => continue,
                };
                match rows.get(&id) {
                    Some(current) if current.version == base_version => {}
                    Some(current) => {
                        return Err(DaoError::MergeConflict {
                            entity: current.entity.clone(),
                            object: id,
                        });
                    }
                    None if matches!(write, PendingWrite::Update { .. }) => {
                        return Err(DaoError::ObjectNotFound(id));
                    }
                    None => {}
                }
            }
        }

        let mut inserted = BTreeSet::new();
        let mut updated = BTreeSet::new();
        let mut edits = Vec::new();
        let mut doomed = Vec::new();
        for write in writes {
            match write {
                PendingWrite::Insert { id, mut record } => {
                    self.catalog.entity(&record.entity)?;
                    // Links go through the editor so their inverses follow
                    for (name, relation) in record.relations.iter_mut() {
                        match relation {
                            RelationValue::One(target) => {
                                if let Some(target) = target.take() {
                                    edits.push(LinkEdit::SetOne {
                                        id,
                                        name: name.clone(),
                                        target: Some(target),
                                    });
                                }
                            }
                            RelationValue::Many(targets) => {
                                for target in std::mem::take(targets) {
                                    edits.push(LinkEdit::Add {
                                        id,
                                        name: name.clone(),
                                        target,
                                    });
                                }
                            }
                        }
                    }
                    record.version = 1;
                    rows.insert(id, record);
                    inserted.insert(id);
                    change.inserted.push(id);
                }
                PendingWrite::Update {
                    id,
                    base_version,
                    base_relations,
                    record,
                    changed,
                } => {
                    let Some(current) = rows.get(&id).cloned() else {
                        log::warn!("Dropping update of {}: removed from the store", id);
                        continue;
                    };
                    if current.version != base_version && policy == MergePolicy::StoreTrump {
                        log::debug!("Store row of {} wins the merge", id);
                        continue;
                    }
                    let descriptor = self.catalog.entity(&current.entity)?;
                    let mut merged = current;
                    for key in &changed {
                        match descriptor.get_relationship(key) {
                            Some(relationship) if relationship.is_to_many() => {
                                let wanted = record.to_many(key);
                                let base = match base_relations.get(key) {
                                    Some(RelationValue::Many(set)) => set.clone(),
                                    _ => BTreeSet::new(),
                                };
                                for target in base.difference(&wanted) {
                                    edits.push(LinkEdit::Remove {
                                        id,
                                        name: key.clone(),
                                        target: *target,
                                    });
                                }
                                for target in wanted.difference(&base) {
                                    edits.push(LinkEdit::Add {
                                        id,
                                        name: key.clone(),
                                        target: *target,
                                    });
                                }
                            }
                            Some(_) => edits.push(LinkEdit::SetOne {
                                id,
                                name: key.clone(),
                                target: record.to_one(key),
                            }),
                            None => match record.values.get(key) {
                                Some(value) => {
                                    merged.values.insert(key.clone(), value.clone());
                                }
                                None => {
                                    merged.values.remove(key);
                                }
                            },
                        }
                    }
                    rows.insert(id, merged);
                    updated.insert(id);
                }
                PendingWrite::Delete { id, .. } => doomed.push(id),
            }
        }

        let mut editor = LinkEditor::new(&self.catalog, &mut rows);
        for edit in edits {
            editor.apply(edit)?;
        }
        updated.extend(editor.touched);

        let mut deleted = Vec::new();
        for id in doomed {
            if rows.remove(&id).is_some() {
                deleted.push(id);
            }
        }
        for id in updated.difference(&inserted) {
            if let Some(row) = rows.get_mut(id) {
                row.version += 1;
                change.mark_updated(*id);
            }
        }

        Self::nullify_references(&mut rows, &deleted, &mut change);
        change.deleted = deleted;

        self.persist(&rows)?;
        *guard = rows;
        drop(guard);

        self.publish(&change);
        Ok(change)
    }

    /// Delete every committed row of `entity` that matches `predicate`
    pub fn batch_delete(
        &self,
        entity: &str,
        predicate: Option<&Predicate>,
        origin: ContextId,
    ) -> Result<StoreChange> {
        self.catalog.entity(entity)?;

        let mut guard = self.rows.write()?;
        let mut rows = guard.clone();
        let matching: Vec<ObjectId> = rows
            .iter()
            .filter(|(_, record)| {
                record.entity == entity && predicate.is_none_or(|p| p.evaluate(record))
            })
            .map(|(id, _)| *id)
            .collect();

        let mut change = StoreChange::new(origin);
        for id in &matching {
            rows.remove(id);
        }
        Self::nullify_references(&mut rows, &matching, &mut change);
        change.deleted = matching;

        if !change.is_empty() {
            self.persist(&rows)?;
            *guard = rows;
        }
        drop(guard);

        self.publish(&change);
        Ok(change)
    }

    fn nullify_references(
        rows: &mut im::OrdMap<ObjectId, ObjectRecord>,
        deleted: &[ObjectId],
        change: &mut StoreChange,
    ) {
        if deleted.is_empty() {
            return;
        }
        let referencing: Vec<ObjectId> = rows
            .iter()
            .filter(|(_, record)| deleted.iter().any(|d| record.references(*d)))
            .map(|(id, _)| *id)
            .collect();

        for id in referencing {
            if let Some(record) = rows.get_mut(&id) {
                for target in deleted {
                    record.remove_references(*target);
                }
                record.version += 1;
                change.mark_updated(id);
            }
        }
    }

    fn persist(&self, rows: &im::OrdMap<ObjectId, ObjectRecord>) -> Result<()> {
        if let Some(snapshot) = &self.snapshot {
            let next_id = self.next_id.load(Ordering::SeqCst);
            snapshot.save(&StoreSnapshot::new(rows.clone(), next_id))?;
        }
        Ok(())
    }

    fn publish(&self, change: &StoreChange) {
        if change.is_empty() {
            return;
        }
        // No receivers is fine: nobody else is watching this store
        let _ = self.changes.send(change.clone());
    }
}

/// One relationship edit taken from a pending write
#[derive(Debug)]
enum LinkEdit {
    SetOne {
        id: ObjectId,
        name: String,
        target: Option<ObjectId>,
    },
    Add {
        id: ObjectId,
        name: String,
        target: ObjectId,
    },
    Remove {
        id: ObjectId,
        name: String,
        target: ObjectId,
    },
}

/// Applies link edits to a working copy of the rows, keeping both sides of
/// every inverse pair in step. Edits against rows that are gone are skipped.
struct LinkEditor<'a> {
    catalog: &'a EntityCatalog,
    rows: &'a mut im::OrdMap<ObjectId, ObjectRecord>,
    touched: BTreeSet<ObjectId>,
}

impl<'a> LinkEditor<'a> {
    fn new(catalog: &'a EntityCatalog, rows: &'a mut im::OrdMap<ObjectId, ObjectRecord>) -> Self {
        Self {
            catalog,
            rows,
            touched: BTreeSet::new(),
        }
    }

    fn apply(&mut self, edit: LinkEdit) -> Result<()> {
        match edit {
            LinkEdit::SetOne { id, name, target } => self.set_one(id, &name, target),
            LinkEdit::Add { id, name, target } => self.add(id, &name, target),
            LinkEdit::Remove { id, name, target } => self.remove(id, &name, target),
        }
    }

    fn relationship(&self, id: ObjectId, name: &str) -> Result<Option<RelationshipDescriptor>> {
        let Some(row) = self.rows.get(&id) else {
            return Ok(None);
        };
        Ok(self
            .catalog
            .entity(&row.entity)?
            .get_relationship(name)
            .cloned())
    }

    fn relation_mut(
        &mut self,
        id: ObjectId,
        relationship: &RelationshipDescriptor,
    ) -> Option<&mut RelationValue> {
        let row = self.rows.get_mut(&id)?;
        Some(
            row.relations
                .entry(relationship.name.clone())
                .or_insert_with(|| {
                    if relationship.is_to_many() {
                        RelationValue::Many(BTreeSet::new())
                    } else {
                        RelationValue::One(None)
                    }
                }),
        )
    }

    fn set_one(&mut self, id: ObjectId, name: &str, target: Option<ObjectId>) -> Result<()> {
        let Some(relationship) = self.relationship(id, name)? else {
            return Ok(());
        };
        if let Some(target) = target.filter(|t| !self.rows.contains_key(t)) {
            log::debug!("Skipping link {}.{} -> {}: target is gone", id, name, target);
            return Ok(());
        }
        let previous = self.rows.get(&id).and_then(|row| row.to_one(name));
        if previous == target {
            return Ok(());
        }
        if let Some(slot) = self.relation_mut(id, &relationship) {
            *slot = RelationValue::One(target);
            self.touched.insert(id);
        }

        if let Some(inverse) = &relationship.inverse {
            if let Some(previous) = previous {
                self.detach(previous, inverse, id)?;
            }
            if let Some(target) = target {
                self.attach(target, inverse, id, name)?;
            }
        }
        Ok(())
    }

    fn add(&mut self, id: ObjectId, name: &str, target: ObjectId) -> Result<()> {
        let Some(relationship) = self.relationship(id, name)? else {
            return Ok(());
        };
        if !self.rows.contains_key(&target) {
            log::debug!("Skipping link {}.{} -> {}: target is gone", id, name, target);
            return Ok(());
        }
        let added = match self.relation_mut(id, &relationship) {
            Some(RelationValue::Many(set)) => set.insert(target),
            _ => false,
        };
        if added {
            self.touched.insert(id);
        }
        if let Some(inverse) = &relationship.inverse {
            self.attach(target, inverse, id, name)?;
        }
        Ok(())
    }

    fn remove(&mut self, id: ObjectId, name: &str, target: ObjectId) -> Result<()> {
        let Some(relationship) = self.relationship(id, name)? else {
            return Ok(());
        };
        let removed = self
            .relation_mut(id, &relationship)
            .is_some_and(|relation| relation.remove(target));
        if !removed {
            return Ok(());
        }
        self.touched.insert(id);
        if let Some(inverse) = &relationship.inverse {
            self.detach(target, inverse, id)?;
        }
        Ok(())
    }

    /// Point `inverse` on `target` back at `source`. A to-one inverse that
    /// pointed elsewhere loses the old holder's `forward` link.
    fn attach(
        &mut self,
        target: ObjectId,
        inverse: &str,
        source: ObjectId,
        forward: &str,
    ) -> Result<()> {
        let Some(relationship) = self.relationship(target, inverse)? else {
            return Ok(());
        };
        if relationship.is_to_many() {
            let added = match self.relation_mut(target, &relationship) {
                Some(RelationValue::Many(set)) => set.insert(source),
                _ => false,
            };
            if added {
                self.touched.insert(target);
            }
            return Ok(());
        }

        let previous = self.rows.get(&target).and_then(|row| row.to_one(inverse));
        if previous == Some(source) {
            return Ok(());
        }
        if let Some(previous) = previous {
            self.detach(previous, forward, target)?;
        }
        if let Some(slot) = self.relation_mut(target, &relationship) {
            *slot = RelationValue::One(Some(source));
            self.touched.insert(target);
        }
        Ok(())
    }

    fn detach(&mut self, holder: ObjectId, relation: &str, target: ObjectId) -> Result<()> {
        let Some(relationship) = self.relationship(holder, relation)? else {
            return Ok(());
        };
        if self
            .relation_mut(holder, &relationship)
            .is_some_and(|r| r.remove(target))
        {
            self.touched.insert(holder);
        }
        Ok(())
    }
}
