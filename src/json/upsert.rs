//! Recursive JSON upsert: maps nested JSON nodes onto a linked object graph.

use super::JsonNode;
use super::converter::JsonToValueConverter;
use super::error::{ObjectRef, UpsertError, UpsertResult, json_kind};
use super::policy::{IdentityPolicy, PolicyAdapter};
use crate::context::{ContextHandle, PerformHandle};
use crate::core::ObjectId;
use crate::dao::Dao;
use crate::storage::{FieldKind, RelationshipDescriptor};
use serde_json::Value as JsonValue;
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{Level, event, info_span};

/// What to do with JSON fields the entity does not declare
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum UnknownFieldPolicy {
    /// Fail with `UpsertError::UnknownField`
    #[default]
    Strict,
    /// Skip the field
    Ignore,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct UpsertOptions {
    pub unknown_fields: UnknownFieldPolicy,
}

impl UpsertOptions {
    pub fn lenient() -> Self {
        Self {
            unknown_fields: UnknownFieldPolicy::Ignore,
        }
    }
}

/// Inserts or updates objects from JSON, resolving identity through an
/// [`IdentityPolicy`].
///
/// Upserting a node whose key values match an existing object updates that
/// object. To-many relationships are merged: existing members are never
/// removed.
pub struct JsonUpserter<'p> {
    policy: PolicyAdapter<'p>,
    options: UpsertOptions,
}

impl<'p> JsonUpserter<'p> {
    pub fn new(policy: &'p dyn IdentityPolicy) -> Self {
        Self::with_options(policy, UpsertOptions::default())
    }

    pub fn with_options(policy: &'p dyn IdentityPolicy, options: UpsertOptions) -> Self {
        Self {
            policy: PolicyAdapter::new(policy),
            options,
        }
    }

    /// Upsert every node as an instance of `root`.
    ///
    /// Returns one id per non-empty node, in input order. Changes stay in the
    /// dao's context until it is saved. On error the context is left exactly
    /// as it was before the call.
    pub fn upsert(
        &self,
        dao: &mut Dao<'_>,
        nodes: &[JsonNode],
        root: &str,
    ) -> UpsertResult<Vec<ObjectId>> {
        let span = info_span!("json.upsert", root = %root, nodes = nodes.len());
        let _enter = span.enter();

        dao.catalog().entity(root)?;
        let owns_savepoint = dao.context().begin_savepoint();
        let mut ids = Vec::with_capacity(nodes.len());
        for node in nodes {
            match self.upsert_node(dao, node, root) {
                Ok(Some(id)) => ids.push(id),
                Ok(None) => {}
                Err(err) => {
                    event!(Level::DEBUG, error = %err, "json upsert failed, undoing partial work");
                    if owns_savepoint {
                        dao.context().rollback_to_savepoint();
                    }
                    return Err(err);
                }
            }
        }
        if owns_savepoint {
            dao.context().release_savepoint();
        }

        event!(Level::DEBUG, produced = ids.len(), "json upsert finished");
        Ok(ids)
    }

    /// Upsert a document whose top level is one object or an array of objects
    pub fn upsert_value(
        &self,
        dao: &mut Dao<'_>,
        document: &JsonValue,
        root: &str,
    ) -> UpsertResult<Vec<ObjectId>> {
        match document {
            JsonValue::Object(node) => self.upsert(dao, std::slice::from_ref(node), root),
            JsonValue::Array(items) => {
                let nodes = items
                    .iter()
                    .map(|item| match item {
                        JsonValue::Object(node) => Ok(node.clone()),
                        other => Err(UpsertError::InvalidStructure(format!(
                            "expected an array of objects, found an element of type {}",
                            json_kind(other)
                        ))),
                    })
                    .collect::<UpsertResult<Vec<_>>>()?;
                self.upsert(dao, &nodes, root)
            }
            other => Err(UpsertError::InvalidStructure(format!(
                "expected an object or an array of objects, found {}",
                json_kind(other)
            ))),
        }
    }

    pub fn upsert_str(
        &self,
        dao: &mut Dao<'_>,
        document: &str,
        root: &str,
    ) -> UpsertResult<Vec<ObjectId>> {
        let document: JsonValue = serde_json::from_str(document)?;
        self.upsert_value(dao, &document, root)
    }

    fn upsert_node(
        &self,
        dao: &mut Dao<'_>,
        node: &JsonNode,
        entity: &str,
    ) -> UpsertResult<Option<ObjectId>> {
        if node.is_empty() {
            return Ok(None);
        }
        let descriptor = Arc::clone(dao.catalog().entity(entity)?);

        let mut identity = BTreeMap::new();
        for json_name in self.policy.primary_keys(entity)? {
            let store_name = self.policy.field_name(&json_name, entity);
            let attribute = descriptor.attribute_named(&store_name)?;
            let raw = node
                .get(&json_name)
                .filter(|value| !value.is_null())
                .ok_or_else(|| UpsertError::MissingKeyValue {
                    entity: entity.to_string(),
                    field: json_name.clone(),
                })?;
            let value = JsonToValueConverter::convert(raw, attribute.attribute_type).map_err(
                |err| UpsertError::InvalidKeyValue {
                    entity: entity.to_string(),
                    field: json_name.clone(),
                    reason: err.to_string(),
                },
            )?;
            identity.insert(store_name, value);
        }

        let (inserted, id) = dao.create_or_fetch(entity, &identity)?;
        event!(
            Level::TRACE,
            entity = %entity,
            object = %id,
            inserted,
            "resolved node identity"
        );

        let parent = ObjectRef {
            entity: entity.to_string(),
            id,
        };
        for (json_name, value) in node {
            let store_name = self.policy.field_name(json_name, entity);
            match descriptor.classify(&store_name) {
                FieldKind::Relationship(relationship) => {
                    self.merge_relationship(dao, &parent, relationship, value)?;
                }
                FieldKind::Attribute(attribute) => {
                    let Some(adjusted) = self.policy.field_value(value, &store_name, &parent)
                    else {
                        continue;
                    };
                    let converted =
                        JsonToValueConverter::convert(&adjusted, attribute.attribute_type)
                            .map_err(|err| UpsertError::InvalidScalar {
                                field: json_name.clone(),
                                parent: parent.clone(),
                                reason: err.to_string(),
                            })?;
                    dao.context().set_value(id, &store_name, converted)?;
                }
                FieldKind::Unknown => match self.options.unknown_fields {
                    UnknownFieldPolicy::Strict => {
                        return Err(UpsertError::UnknownField {
                            field: json_name.clone(),
                            parent,
                        });
                    }
                    UnknownFieldPolicy::Ignore => {
                        event!(Level::DEBUG, field = %json_name, parent = %parent, "skipping unknown field");
                    }
                },
            }
        }

        Ok(Some(id))
    }

    fn merge_relationship(
        &self,
        dao: &mut Dao<'_>,
        parent: &ObjectRef,
        relationship: &RelationshipDescriptor,
        value: &JsonValue,
    ) -> UpsertResult<()> {
        match value {
            JsonValue::Object(child) if relationship.is_to_many() => {
                self.union(dao, parent, relationship, &[child])
            }
            JsonValue::Object(child) => {
                // An empty node produces nothing and keeps the current link
                if let Some(child_id) = self.upsert_node(dao, child, &relationship.destination)? {
                    dao.context()
                        .set_to_one(parent.id, &relationship.name, Some(child_id))?;
                }
                Ok(())
            }
            JsonValue::Array(_) if !relationship.is_to_many() => Err(UpsertError::ToOneGivenArray {
                relationship: relationship.name.clone(),
                parent: parent.clone(),
            }),
            JsonValue::Array(items) => {
                let children = items
                    .iter()
                    .map(|item| {
                        item.as_object()
                            .ok_or_else(|| UpsertError::UnsupportedRelationshipValue {
                                relationship: relationship.name.clone(),
                                parent: parent.clone(),
                                found: json_kind(item),
                            })
                    })
                    .collect::<UpsertResult<Vec<_>>>()?;
                self.union(dao, parent, relationship, &children)
            }
            other => Err(UpsertError::UnsupportedRelationshipValue {
                relationship: relationship.name.clone(),
                parent: parent.clone(),
                found: json_kind(other),
            }),
        }
    }

    /// Link the upserted children in addition to whatever is already linked
    fn union(
        &self,
        dao: &mut Dao<'_>,
        parent: &ObjectRef,
        relationship: &RelationshipDescriptor,
        children: &[&JsonNode],
    ) -> UpsertResult<()> {
        let mut produced = Vec::with_capacity(children.len());
        for child in children {
            if let Some(id) = self.upsert_node(dao, child, &relationship.destination)? {
                produced.push(id);
            }
        }

        let mut members = dao.context().to_many(parent.id, &relationship.name)?;
        members.extend(produced);
        dao.context()
            .set_to_many(parent.id, &relationship.name, members)?;
        Ok(())
    }
}

/// Run an upsert on the context's queue.
///
/// Failures are logged and delivered as `None`; call [`JsonUpserter::upsert`]
/// inside `ContextHandle::perform` when the error detail matters.
pub fn upsert_async<P>(
    handle: &ContextHandle,
    nodes: Vec<JsonNode>,
    root: impl Into<String>,
    policy: P,
    options: UpsertOptions,
) -> PerformHandle<Option<Vec<ObjectId>>>
where
    P: IdentityPolicy + Send + 'static,
{
    let root = root.into();
    handle.perform_dao(move |dao| {
        let upserter = JsonUpserter::with_options(&policy, options);
        match upserter.upsert(dao, &nodes, &root) {
            Ok(ids) => Some(ids),
            Err(err) => {
                event!(Level::WARN, error = %err, root = %root, "async json upsert failed");
                None
            }
        }
    })
}
