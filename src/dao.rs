//! Store access layer: fetch, identity lookup, insert and delete by entity name.

use crate::context::ObjectContext;
use crate::core::{DaoError, ObjectId, Result, Value};
use crate::expression::{FetchRequest, Predicate, SortDescriptor};
use crate::storage::EntityCatalog;
use std::collections::BTreeMap;

/// Data-access object over a borrowed context.
///
/// A `Dao` is created per unit of work (see `ContextHandle::perform_dao`) and
/// only ever touches the store through its context.
pub struct Dao<'c> {
    context: &'c mut ObjectContext,
}

impl<'c> Dao<'c> {
    pub fn new(context: &'c mut ObjectContext) -> Self {
        Self { context }
    }

    pub fn context(&mut self) -> &mut ObjectContext {
        &mut *self.context
    }

    pub fn catalog(&self) -> &EntityCatalog {
        self.context.catalog()
    }

    pub fn fetch(&self, request: &FetchRequest) -> Result<Vec<ObjectId>> {
        self.context.fetch(request)
    }

    pub fn fetch_one(
        &self,
        entity: &str,
        predicate: Option<Predicate>,
        sorts: Vec<SortDescriptor>,
    ) -> Result<Option<ObjectId>> {
        let request = FetchRequest {
            predicate,
            ..FetchRequest::new(entity)
        }
        .sorts(sorts)
        .limit(1);
        Ok(self.context.fetch(&request)?.into_iter().next())
    }

    pub fn fetch_all(
        &self,
        entity: &str,
        predicate: Option<Predicate>,
        sorts: Vec<SortDescriptor>,
        limit: Option<usize>,
    ) -> Result<Vec<ObjectId>> {
        let request = FetchRequest {
            predicate,
            limit,
            ..FetchRequest::new(entity)
        }
        .sorts(sorts);
        self.context.fetch(&request)
    }

    fn unique_key_request(
        &self,
        entity: &str,
        keys: &BTreeMap<String, Value>,
    ) -> Result<FetchRequest> {
        let descriptor = self.catalog().entity(entity)?;
        let Some(first_key) = keys.keys().next() else {
            return Err(DaoError::EmptyUniqueKeys(entity.to_string()));
        };
        for key in keys.keys() {
            descriptor.attribute_named(key)?;
        }
        Ok(FetchRequest::new(entity)
            .predicate(Predicate::all_equal(keys))
            .sort(SortDescriptor::asc(first_key.clone())))
    }

    /// Find the object whose attributes equal every given key value.
    ///
    /// When more than one object matches, the lowest id wins and a warning is
    /// logged.
    pub fn fetch_by_unique_keys(
        &self,
        entity: &str,
        keys: &BTreeMap<String, Value>,
    ) -> Result<Option<ObjectId>> {
        let request = self.unique_key_request(entity, keys)?.limit(2);
        let found = self.context.fetch(&request)?;
        if found.len() > 1 {
            log::warn!(
                "{} objects of {} match unique keys {:?}; using {}",
                found.len(),
                entity,
                keys,
                found[0]
            );
        }
        Ok(found.into_iter().next())
    }

    pub fn fetch_all_by_unique_keys(
        &self,
        entity: &str,
        keys: &BTreeMap<String, Value>,
        limit: Option<usize>,
    ) -> Result<Vec<ObjectId>> {
        let mut request = self.unique_key_request(entity, keys)?;
        request.limit = limit;
        self.context.fetch(&request)
    }

    pub fn insert(&mut self, entity: &str) -> Result<ObjectId> {
        self.context.insert(entity)
    }

    /// Fetch by unique keys, or insert a new object carrying those key values.
    /// Returns whether an insert happened.
    pub fn create_or_fetch(
        &mut self,
        entity: &str,
        keys: &BTreeMap<String, Value>,
    ) -> Result<(bool, ObjectId)> {
        if let Some(existing) = self.fetch_by_unique_keys(entity, keys)? {
            return Ok((false, existing));
        }
        let id = self.context.insert(entity)?;
        for (key, value) in keys {
            self.context.set_value(id, key, value.clone())?;
        }
        Ok((true, id))
    }

    pub fn delete(&mut self, id: ObjectId) -> Result<()> {
        self.context.delete(id)
    }

    /// Remove every committed object of `entity` matching `predicate` in one
    /// store operation
    pub fn batch_delete(
        &mut self,
        entity: &str,
        predicate: Option<Predicate>,
    ) -> Result<Vec<ObjectId>> {
        self.context.batch_delete(entity, predicate.as_ref())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::MergePolicy;
    use crate::core::AttributeType;
    use crate::storage::{EntityDescriptor, PersistentStore};
    use std::sync::Arc;

    fn context() -> ObjectContext {
        let catalog = EntityCatalog::new()
            .with_entity(
                EntityDescriptor::new("User")
                    .required("id", AttributeType::Integer)
                    .attribute("name", AttributeType::Text),
            )
            .unwrap();
        ObjectContext::new(Arc::new(PersistentStore::in_memory(catalog)), MergePolicy::Error)
    }

    fn keys(id: i64) -> BTreeMap<String, Value> {
        let mut keys = BTreeMap::new();
        keys.insert("id".to_string(), Value::Integer(id));
        keys
    }

    #[test]
    fn test_empty_keys_is_typed_error() {
        let mut ctx = context();
        let dao = Dao::new(&mut ctx);
        assert!(matches!(
            dao.fetch_by_unique_keys("User", &BTreeMap::new()),
            Err(DaoError::EmptyUniqueKeys(_))
        ));
    }

    #[test]
    fn test_create_or_fetch() {
        let mut ctx = context();
        let mut dao = Dao::new(&mut ctx);
        let (inserted, first) = dao.create_or_fetch("User", &keys(1)).unwrap();
        assert!(inserted);
        let (inserted, again) = dao.create_or_fetch("User", &keys(1)).unwrap();
        assert!(!inserted);
        assert_eq!(first, again);
        assert_eq!(dao.fetch_by_unique_keys("User", &keys(1)).unwrap(), Some(first));
        assert_eq!(dao.fetch_by_unique_keys("User", &keys(2)).unwrap(), None);
    }

    #[test]
    fn test_ambiguous_keys_pick_lowest_id() {
        let mut ctx = context();
        let mut dao = Dao::new(&mut ctx);
        let first = dao.insert("User").unwrap();
        let second = dao.insert("User").unwrap();
        for id in [second, first] {
            dao.context().set_value(id, "id", 5).unwrap();
        }
        assert_eq!(dao.fetch_by_unique_keys("User", &keys(5)).unwrap(), Some(first));
        assert_eq!(
            dao.fetch_all_by_unique_keys("User", &keys(5), None).unwrap(),
            vec![first, second]
        );
    }

    #[test]
    fn test_fetch_no_match_is_empty() {
        let mut ctx = context();
        let dao = Dao::new(&mut ctx);
        assert_eq!(dao.fetch_one("User", None, vec![]).unwrap(), None);
        assert!(dao.fetch_all("User", None, vec![], Some(3)).unwrap().is_empty());
        assert!(matches!(
            dao.fetch_one("Ghost", None, vec![]),
            Err(DaoError::EntityNotFound(_))
        ));
    }

    #[test]
    fn test_batch_delete_through_dao() {
        let mut ctx = context();
        let mut dao = Dao::new(&mut ctx);
        for id in 1..=3 {
            dao.create_or_fetch("User", &keys(id)).unwrap();
        }
        dao.context().save().unwrap();

        let deleted = dao
            .batch_delete("User", Some(Predicate::le("id", 2)))
            .unwrap();
        assert_eq!(deleted.len(), 2);
        let remaining = dao
            .fetch_all("User", None, vec![SortDescriptor::asc("id")], None)
            .unwrap();
        assert_eq!(remaining.len(), 1);
    }
}
