use super::merge::MergePolicy;
use super::object::{ManagedObject, ObjectState};
use crate::core::{ContextId, DaoError, ObjectId, Result, Value};
use crate::expression::{FetchRequest, Predicate, compare_records};
use crate::storage::{
    Cardinality, EntityCatalog, ObjectRecord, PendingWrite, PersistentStore, RelationValue,
    RelationshipDescriptor, StoreChange,
};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use tokio::sync::broadcast::{self, error::TryRecvError};

/// A working set of managed objects over one persistent store.
///
/// Reads fall through to the store and register the object; writes stay in
/// the context until `save`. Every mutating method takes `&mut self`, so a
/// context is confined to whoever holds it. Use `ContextHandle` to share one
/// across tasks.
pub struct ObjectContext {
    id: ContextId,
    store: Arc<PersistentStore>,
    catalog: EntityCatalog,
    merge_policy: MergePolicy,
    objects: BTreeMap<ObjectId, ManagedObject>,
    changes: broadcast::Receiver<StoreChange>,
    /// Pre-images of objects touched since `begin_savepoint`
    journal: Option<BTreeMap<ObjectId, Option<ManagedObject>>>,
}

impl std::fmt::Debug for ObjectContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ObjectContext")
            .field("id", &self.id)
            .field("merge_policy", &self.merge_policy)
            .field("registered", &self.objects.len())
            .finish()
    }
}

impl ObjectContext {
    pub fn new(store: Arc<PersistentStore>, merge_policy: MergePolicy) -> Self {
        let changes = store.subscribe();
        let catalog = store.catalog().clone();
        Self {
            id: ContextId::new(),
            store,
            catalog,
            merge_policy,
            objects: BTreeMap::new(),
            changes,
            journal: None,
        }
    }

    pub fn id(&self) -> ContextId {
        self.id
    }

    pub fn catalog(&self) -> &EntityCatalog {
        &self.catalog
    }

    pub fn store(&self) -> &Arc<PersistentStore> {
        &self.store
    }

    pub fn merge_policy(&self) -> MergePolicy {
        self.merge_policy
    }

    pub fn set_merge_policy(&mut self, policy: MergePolicy) {
        self.merge_policy = policy;
    }

    /// Register the object with the context, loading it from the store if needed
    fn load<'a>(
        objects: &'a mut BTreeMap<ObjectId, ManagedObject>,
        store: &PersistentStore,
        id: ObjectId,
    ) -> Result<&'a mut ManagedObject> {
        if !objects.contains_key(&id) {
            let record = store.record(id)?.ok_or(DaoError::ObjectNotFound(id))?;
            objects.insert(id, ManagedObject::fetched(id, record));
        }
        match objects.get_mut(&id) {
            Some(object) if object.is_deleted() => Err(DaoError::ObjectDeleted(id)),
            Some(object) => Ok(object),
            None => Err(DaoError::ObjectNotFound(id)),
        }
    }

    fn loaded(&mut self, id: ObjectId) -> Result<&mut ManagedObject> {
        self.remember(id);
        Self::load(&mut self.objects, &self.store, id)
    }

    fn remember(&mut self, id: ObjectId) {
        if let Some(journal) = &mut self.journal {
            journal
                .entry(id)
                .or_insert_with(|| self.objects.get(&id).cloned());
        }
    }

    /// Start journaling so a failed unit of work can be undone without
    /// discarding earlier pending changes. Returns false if one is already open.
    pub(crate) fn begin_savepoint(&mut self) -> bool {
        if self.journal.is_some() {
            return false;
        }
        self.journal = Some(BTreeMap::new());
        true
    }

    /// Keep everything done since `begin_savepoint`
    pub(crate) fn release_savepoint(&mut self) {
        self.journal = None;
    }

    /// Restore every object touched since `begin_savepoint`
    pub(crate) fn rollback_to_savepoint(&mut self) {
        let Some(journal) = self.journal.take() else {
            return;
        };
        let restored = journal.len();
        for (id, before) in journal {
            match before {
                Some(object) => {
                    self.objects.insert(id, object);
                }
                None => {
                    self.objects.remove(&id);
                }
            }
        }
        log::debug!("{} restored {} object(s) to the savepoint", self.id, restored);
    }

    // ------------------------------------------------------------------
    // Objects
    // ------------------------------------------------------------------

    /// Create a new, uncommitted instance of `entity`
    pub fn insert(&mut self, entity: &str) -> Result<ObjectId> {
        let descriptor = self.catalog.entity(entity)?;
        let record = ObjectRecord::new(descriptor);
        let id = self.store.allocate_id();
        self.remember(id);
        self.objects.insert(id, ManagedObject::inserted(id, record));
        log::debug!("{} inserted {} {}", self.id, entity, id);
        Ok(id)
    }

    pub fn object(&mut self, id: ObjectId) -> Result<&ManagedObject> {
        self.loaded(id).map(|object| &*object)
    }

    /// Object already registered with this context, without touching the store
    pub fn registered(&self, id: ObjectId) -> Option<&ManagedObject> {
        self.objects.get(&id)
    }

    pub fn registered_count(&self) -> usize {
        self.objects.len()
    }

    pub fn entity_of(&mut self, id: ObjectId) -> Result<String> {
        Ok(self.loaded(id)?.entity().to_string())
    }

    pub fn value(&mut self, id: ObjectId, attribute: &str) -> Result<Value> {
        let object = Self::load(&mut self.objects, &self.store, id)?;
        self.catalog
            .entity(object.entity())?
            .attribute_named(attribute)?;
        Ok(object.record.value(attribute).clone())
    }

    /// Set an attribute, coercing the value to the declared type
    pub fn set_value(
        &mut self,
        id: ObjectId,
        attribute: &str,
        value: impl Into<Value>,
    ) -> Result<()> {
        let value = value.into();
        self.remember(id);
        let object = Self::load(&mut self.objects, &self.store, id)?;
        let descriptor = self.catalog.entity(object.entity())?;
        let attribute_type = descriptor.attribute_named(attribute)?.attribute_type;

        let found = value.type_name();
        let value = attribute_type.coerce(value).map_err(|_| {
            DaoError::TypeMismatch(format!(
                "{}.{} expects {}, got {}",
                descriptor.name, attribute, attribute_type, found
            ))
        })?;

        if object.record.value(attribute) == &value {
            return Ok(());
        }
        if value.is_null() {
            object.record.values.remove(attribute);
        } else {
            object.record.values.insert(attribute.to_string(), value);
        }
        object.mark_changed(attribute);
        Ok(())
    }

    // ------------------------------------------------------------------
    // Relationships
    // ------------------------------------------------------------------

    fn relationship_of(
        &mut self,
        id: ObjectId,
        name: &str,
        expected: Cardinality,
    ) -> Result<RelationshipDescriptor> {
        let object = Self::load(&mut self.objects, &self.store, id)?;
        let descriptor = self.catalog.entity(object.entity())?;
        let relationship = descriptor.relationship_named(name)?;
        if relationship.cardinality != expected {
            return Err(DaoError::CardinalityMismatch {
                entity: descriptor.name.clone(),
                relationship: name.to_string(),
                expected: expected.label(),
            });
        }
        Ok(relationship.clone())
    }

    fn check_destination(&mut self, target: ObjectId, relationship: &RelationshipDescriptor) -> Result<()> {
        let object = self.loaded(target)?;
        if object.entity() != relationship.destination {
            return Err(DaoError::TypeMismatch(format!(
                "{} is a {}, relationship '{}' expects {}",
                target,
                object.entity(),
                relationship.name,
                relationship.destination
            )));
        }
        Ok(())
    }

    fn write_relation(&mut self, id: ObjectId, name: &str, value: RelationValue) -> Result<()> {
        let object = self.loaded(id)?;
        object.record.relations.insert(name.to_string(), value);
        object.mark_changed(name);
        Ok(())
    }

    /// Remove `target` from `relation` on `holder`. Gone objects are skipped.
    fn detach(&mut self, holder: ObjectId, relation: &str, target: ObjectId) -> Result<()> {
        let object = match self.loaded(holder) {
            Ok(object) => object,
            Err(DaoError::ObjectNotFound(_) | DaoError::ObjectDeleted(_)) => return Ok(()),
            Err(e) => return Err(e),
        };
        let removed = object
            .record
            .relations
            .get_mut(relation)
            .is_some_and(|r| r.remove(target));
        if removed {
            object.mark_changed(relation);
        }
        Ok(())
    }

    /// Point `inverse` on `target` back at `source`. When the inverse is
    /// to-one, the previous holder loses its forward link to `target`.
    fn attach_inverse(
        &mut self,
        target: ObjectId,
        inverse: &str,
        source: ObjectId,
        forward: &str,
    ) -> Result<()> {
        let target_entity = self.entity_of(target)?;
        let inverse_relationship = self
            .catalog
            .entity(&target_entity)?
            .relationship_named(inverse)?
            .clone();

        if inverse_relationship.is_to_many() {
            let object = self.loaded(target)?;
            let inserted = match object.record.relations.get_mut(inverse) {
                Some(RelationValue::Many(set)) => set.insert(source),
                _ => {
                    let set: BTreeSet<ObjectId> = [source].into_iter().collect();
                    object
                        .record
                        .relations
                        .insert(inverse.to_string(), RelationValue::Many(set));
                    true
                }
            };
            if inserted {
                object.mark_changed(inverse);
            }
            return Ok(());
        }

        let previous = self.loaded(target)?.record.to_one(inverse);
        if previous == Some(source) {
            return Ok(());
        }
        if let Some(previous) = previous {
            self.detach(previous, forward, target)?;
        }
        self.write_relation(target, inverse, RelationValue::One(Some(source)))
    }

    pub fn to_one(&mut self, id: ObjectId, relationship: &str) -> Result<Option<ObjectId>> {
        self.relationship_of(id, relationship, Cardinality::ToOne)?;
        Ok(self.loaded(id)?.record.to_one(relationship))
    }

    /// Replace a to-one link. The inverse side follows automatically.
    pub fn set_to_one(
        &mut self,
        id: ObjectId,
        relationship: &str,
        target: Option<ObjectId>,
    ) -> Result<()> {
        let descriptor = self.relationship_of(id, relationship, Cardinality::ToOne)?;
        if let Some(target) = target {
            self.check_destination(target, &descriptor)?;
        }

        let previous = self.loaded(id)?.record.to_one(relationship);
        if previous == target {
            return Ok(());
        }
        self.write_relation(id, relationship, RelationValue::One(target))?;

        if let Some(inverse) = &descriptor.inverse {
            if let Some(previous) = previous {
                self.detach(previous, inverse, id)?;
            }
            if let Some(target) = target {
                self.attach_inverse(target, inverse, id, relationship)?;
            }
        }
        Ok(())
    }

    pub fn to_many(&mut self, id: ObjectId, relationship: &str) -> Result<BTreeSet<ObjectId>> {
        self.relationship_of(id, relationship, Cardinality::ToMany)?;
        Ok(self.loaded(id)?.record.to_many(relationship))
    }

    /// Replace a to-many set. Removed and added members get their inverse updated.
    pub fn set_to_many(
        &mut self,
        id: ObjectId,
        relationship: &str,
        targets: BTreeSet<ObjectId>,
    ) -> Result<()> {
        let descriptor = self.relationship_of(id, relationship, Cardinality::ToMany)?;
        for target in &targets {
            self.check_destination(*target, &descriptor)?;
        }

        let previous = self.loaded(id)?.record.to_many(relationship);
        if previous == targets {
            return Ok(());
        }
        let removed: Vec<ObjectId> = previous.difference(&targets).copied().collect();
        let added: Vec<ObjectId> = targets.difference(&previous).copied().collect();
        self.write_relation(id, relationship, RelationValue::Many(targets))?;

        if let Some(inverse) = &descriptor.inverse {
            for target in removed {
                self.detach(target, inverse, id)?;
            }
            for target in added {
                self.attach_inverse(target, inverse, id, relationship)?;
            }
        }
        Ok(())
    }

    pub fn add_to_many(&mut self, id: ObjectId, relationship: &str, target: ObjectId) -> Result<()> {
        let mut targets = self.to_many(id, relationship)?;
        if targets.insert(target) {
            self.set_to_many(id, relationship, targets)?;
        }
        Ok(())
    }

    pub fn remove_from_many(
        &mut self,
        id: ObjectId,
        relationship: &str,
        target: ObjectId,
    ) -> Result<()> {
        let mut targets = self.to_many(id, relationship)?;
        if targets.remove(&target) {
            self.set_to_many(id, relationship, targets)?;
        }
        Ok(())
    }

    /// Mark an object for removal and unlink it from everything registered here
    pub fn delete(&mut self, id: ObjectId) -> Result<()> {
        let object = self.loaded(id)?;
        let state = object.state;
        let entity = object.entity().to_string();
        let links: Vec<(String, Vec<ObjectId>)> = object
            .record
            .relations
            .iter()
            .map(|(name, relation)| (name.clone(), relation.targets()))
            .collect();

        let descriptor = Arc::clone(self.catalog.entity(&entity)?);
        for (name, targets) in links {
            let inverse = descriptor
                .get_relationship(&name)
                .and_then(|r| r.inverse.as_deref());
            if let Some(inverse) = inverse {
                for target in targets {
                    self.detach(target, inverse, id)?;
                }
            }
        }

        let referencing: Vec<ObjectId> = self
            .objects
            .iter()
            .filter(|(other_id, other)| {
                **other_id != id && !other.is_deleted() && other.record.references(id)
            })
            .map(|(other_id, _)| *other_id)
            .collect();
        for other_id in referencing {
            self.remember(other_id);
            if let Some(other) = self.objects.get_mut(&other_id) {
                for name in other.record.remove_references(id) {
                    other.mark_changed(&name);
                }
            }
        }

        if state == ObjectState::Inserted {
            self.objects.remove(&id);
        } else if let Some(object) = self.objects.get_mut(&id) {
            object.state = ObjectState::Deleted;
        }
        log::debug!("{} deleted {} {}", self.id, entity, id);
        Ok(())
    }

    // ------------------------------------------------------------------
    // Fetching
    // ------------------------------------------------------------------

    /// Run a fetch against the store merged with this context's pending changes
    pub fn fetch(&self, request: &FetchRequest) -> Result<Vec<ObjectId>> {
        self.catalog.entity(&request.entity)?;
        let rows = self.store.rows()?;

        let mut matches: Vec<(ObjectId, &ObjectRecord)> = Vec::new();
        for (id, stored) in rows.iter() {
            let record = match self.objects.get(id) {
                Some(object) if object.is_deleted() => continue,
                Some(object) => &object.record,
                None => stored,
            };
            if request.matches(record) {
                matches.push((*id, record));
            }
        }
        for (id, object) in &self.objects {
            if object.state == ObjectState::Inserted && request.matches(&object.record) {
                matches.push((*id, &object.record));
            }
        }

        matches.sort_by(|left, right| compare_records(&request.sorts, *left, *right));
        Ok(matches
            .into_iter()
            .skip(request.offset)
            .take(request.limit.unwrap_or(usize::MAX))
            .map(|(id, _)| id)
            .collect())
    }

    pub fn count(&self, entity: &str, predicate: Option<Predicate>) -> Result<usize> {
        let mut request = FetchRequest::new(entity);
        request.predicate = predicate;
        Ok(self.fetch(&request)?.len())
    }

    /// Delete matching committed objects directly in the store.
    ///
    /// Pending inserts are not affected. The result is merged into this
    /// context right away; other contexts see it through `merge_remote_changes`.
    pub fn batch_delete(&mut self, entity: &str, predicate: Option<&Predicate>) -> Result<Vec<ObjectId>> {
        let change = self.store.batch_delete(entity, predicate, self.id)?;
        self.apply_change(&change, true)?;
        log::debug!(
            "{} batch deleted {} {} object(s)",
            self.id,
            change.deleted.len(),
            entity
        );
        Ok(change.deleted)
    }

    // ------------------------------------------------------------------
    // Unit of work
    // ------------------------------------------------------------------

    pub fn has_changes(&self) -> bool {
        self.objects.values().any(|o| o.state.is_dirty())
    }

    fn validate_required(&self) -> Result<()> {
        let pending = self
            .objects
            .values()
            .filter(|o| matches!(o.state, ObjectState::Inserted | ObjectState::Updated));
        for object in pending {
            let descriptor = self.catalog.entity(object.entity())?;
            for attribute in descriptor.attributes.iter().filter(|a| !a.optional) {
                if object.record.value(&attribute.name).is_null() {
                    return Err(DaoError::ConstraintViolation(format!(
                        "{}.{} is required ({})",
                        descriptor.name, attribute.name, object.id
                    )));
                }
            }
        }
        Ok(())
    }

    /// Commit pending changes. A failed save leaves the context untouched.
    pub fn save(&mut self) -> Result<()> {
        if !self.has_changes() {
            return Ok(());
        }
        self.validate_required()?;

        let mut inserts = Vec::new();
        let mut updates = Vec::new();
        let mut deletes = Vec::new();
        for object in self.objects.values() {
            match object.state {
                ObjectState::Inserted => inserts.push(PendingWrite::Insert {
                    id: object.id,
                    record: object.record.clone(),
                }),
                ObjectState::Updated => updates.push(PendingWrite::Update {
                    id: object.id,
                    base_version: object.base_version,
                    base_relations: object.base_relations.clone(),
                    record: object.record.clone(),
                    changed: object.changed.clone(),
                }),
                ObjectState::Deleted => deletes.push(PendingWrite::Delete {
                    id: object.id,
                    base_version: object.base_version,
                }),
                ObjectState::Fetched => {}
            }
        }

        let mut writes = inserts;
        writes.append(&mut updates);
        writes.append(&mut deletes);
        let written: Vec<ObjectId> = writes.iter().map(PendingWrite::id).collect();

        let change = self.store.commit(writes, self.merge_policy, self.id)?;

        for id in written.iter().chain(&change.updated) {
            let stored = self.store.record(*id)?;
            let Some(object) = self.objects.get_mut(id) else {
                continue;
            };
            match stored {
                Some(record) => object.refresh(record),
                None => {
                    self.objects.remove(id);
                }
            }
        }

        log::debug!(
            "{} saved: {} inserted, {} updated, {} deleted",
            self.id,
            change.inserted.len(),
            change.updated.len(),
            change.deleted.len()
        );
        Ok(())
    }

    /// Discard every pending change and forget all registered objects
    pub fn rollback(&mut self) {
        self.objects.clear();
    }

    /// Reload a clean object from the store
    pub fn refresh(&mut self, id: ObjectId) -> Result<()> {
        match self.store.record(id)? {
            Some(record) => {
                if let Some(object) = self.objects.get_mut(&id) {
                    object.refresh(record);
                }
            }
            None => {
                self.objects.remove(&id);
            }
        }
        Ok(())
    }

    fn refresh_clean(&mut self) -> Result<()> {
        let clean: Vec<ObjectId> = self
            .objects
            .values()
            .filter(|o| o.state == ObjectState::Fetched)
            .map(|o| o.id)
            .collect();
        for id in clean {
            self.refresh(id)?;
        }
        Ok(())
    }

    /// Fold one store change into the registered objects.
    ///
    /// With `rebase`, dirty objects touched by the change adopt the new store
    /// version; this is only correct for changes this context issued itself.
    fn apply_change(&mut self, change: &StoreChange, rebase: bool) -> Result<()> {
        for id in &change.deleted {
            self.objects.remove(id);
        }
        if !change.deleted.is_empty() {
            for object in self.objects.values_mut() {
                for target in &change.deleted {
                    for name in object.record.remove_references(*target) {
                        if object.state.is_dirty() {
                            object.mark_changed(&name);
                        }
                    }
                }
            }
        }

        for id in change.inserted.iter().chain(&change.updated) {
            let Some(object) = self.objects.get_mut(id) else {
                continue;
            };
            match object.state {
                ObjectState::Fetched => {
                    if let Some(record) = self.store.record(*id)? {
                        object.refresh(record);
                    }
                }
                _ if rebase => {
                    if let Some(record) = self.store.record(*id)? {
                        object.rebase(&record);
                    }
                }
                _ => {}
            }
        }
        Ok(())
    }

    /// Apply changes committed by other contexts on the same store.
    ///
    /// Deleted objects are evicted and clean objects are refreshed. Objects
    /// with pending changes keep them; their conflicts surface at save time.
    /// Returns the number of notifications applied.
    pub fn merge_remote_changes(&mut self) -> Result<usize> {
        let mut merged = 0;
        loop {
            match self.changes.try_recv() {
                Ok(change) => {
                    if change.origin == self.id {
                        continue;
                    }
                    self.apply_change(&change, false)?;
                    merged += 1;
                }
                Err(TryRecvError::Lagged(skipped)) => {
                    log::warn!(
                        "{} missed {} store notifications, refreshing clean objects",
                        self.id,
                        skipped
                    );
                    self.refresh_clean()?;
                    merged += 1;
                }
                Err(TryRecvError::Empty) | Err(TryRecvError::Closed) => break,
            }
        }
        Ok(merged)
    }
}
