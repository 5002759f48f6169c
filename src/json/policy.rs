//! Identity policy: which fields identify an object, and how JSON names and
//! values map onto the store.

use super::error::{ObjectRef, UpsertError, UpsertResult};
use serde_json::Value as JsonValue;
use std::collections::HashMap;

/// Supplies identity and field mapping for the upsert engine.
///
/// All three operations are required. Implementations that only care about
/// keys can delegate the other two to [`defaults`].
pub trait IdentityPolicy {
    /// JSON field names whose values identify an instance of `entity`
    fn primary_key_fields(&self, entity: &str) -> Vec<String>;

    /// Store attribute or relationship name for a JSON field name
    fn adjust_field_name(&self, original: &str, entity: &str) -> String;

    /// Value to store for an attribute, or `None` to leave it untouched
    fn adjust_field_value(
        &self,
        value: &JsonValue,
        field: &str,
        object: &ObjectRef,
    ) -> Option<JsonValue>;
}

pub mod defaults {
    use serde_json::Value as JsonValue;

    /// JSON names are store names
    pub fn identity_field_name(original: &str) -> String {
        original.to_string()
    }

    /// `null` leaves the field untouched; everything else is kept as-is
    pub fn identity_field_value(value: &JsonValue) -> Option<JsonValue> {
        match value {
            JsonValue::Null => None,
            other => Some(other.clone()),
        }
    }
}

/// Table-driven policy: key fields and JSON renames per entity
#[derive(Debug, Clone, Default)]
pub struct PrimaryKeyTable {
    keys: HashMap<String, Vec<String>>,
    renames: HashMap<String, HashMap<String, String>>,
}

impl PrimaryKeyTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_keys<I, S>(mut self, entity: impl Into<String>, fields: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.keys
            .insert(entity.into(), fields.into_iter().map(Into::into).collect());
        self
    }

    /// Map the JSON field `json_name` of `entity` to the store name `store_name`
    pub fn with_rename(
        mut self,
        entity: impl Into<String>,
        json_name: impl Into<String>,
        store_name: impl Into<String>,
    ) -> Self {
        self.renames
            .entry(entity.into())
            .or_default()
            .insert(json_name.into(), store_name.into());
        self
    }
}

impl IdentityPolicy for PrimaryKeyTable {
    fn primary_key_fields(&self, entity: &str) -> Vec<String> {
        self.keys.get(entity).cloned().unwrap_or_default()
    }

    fn adjust_field_name(&self, original: &str, entity: &str) -> String {
        self.renames
            .get(entity)
            .and_then(|renames| renames.get(original))
            .cloned()
            .unwrap_or_else(|| defaults::identity_field_name(original))
    }

    fn adjust_field_value(
        &self,
        value: &JsonValue,
        _field: &str,
        _object: &ObjectRef,
    ) -> Option<JsonValue> {
        defaults::identity_field_value(value)
    }
}

/// Borrows a policy for one upsert call and normalizes what it returns
#[derive(Clone, Copy)]
pub(crate) struct PolicyAdapter<'p> {
    policy: &'p dyn IdentityPolicy,
}

impl<'p> PolicyAdapter<'p> {
    pub(crate) fn new(policy: &'p dyn IdentityPolicy) -> Self {
        Self { policy }
    }

    /// Non-empty, deduplicated, sorted key fields
    pub(crate) fn primary_keys(&self, entity: &str) -> UpsertResult<Vec<String>> {
        let mut keys = self.policy.primary_key_fields(entity);
        keys.sort();
        keys.dedup();
        if keys.is_empty() {
            return Err(UpsertError::MissingPrimaryKeys {
                entity: entity.to_string(),
            });
        }
        Ok(keys)
    }

    pub(crate) fn field_name(&self, original: &str, entity: &str) -> String {
        self.policy.adjust_field_name(original, entity)
    }

    pub(crate) fn field_value(
        &self,
        value: &JsonValue,
        field: &str,
        object: &ObjectRef,
    ) -> Option<JsonValue> {
        self.policy.adjust_field_value(value, field, object)
    }
}
