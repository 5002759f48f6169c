//! Errors raised while mapping JSON documents onto the object graph

use crate::core::{DaoError, ObjectId};
use std::fmt;
use thiserror::Error;

pub type UpsertResult<T> = Result<T, UpsertError>;

/// The object a field belongs to, for error reporting
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ObjectRef {
    pub entity: String,
    pub id: ObjectId,
}

impl fmt::Display for ObjectRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}({})", self.entity, self.id)
    }
}

#[derive(Debug, Error)]
pub enum UpsertError {
    #[error("No primary key fields configured for entity '{entity}'")]
    MissingPrimaryKeys { entity: String },

    #[error("Primary key '{field}' of {entity} is missing or null")]
    MissingKeyValue { entity: String, field: String },

    #[error("Primary key '{field}' of {entity} is invalid: {reason}")]
    InvalidKeyValue {
        entity: String,
        field: String,
        reason: String,
    },

    #[error("Relationship '{relationship}' of {parent} is to-one but received an array")]
    ToOneGivenArray {
        relationship: String,
        parent: ObjectRef,
    },

    #[error("Relationship '{relationship}' of {parent} cannot take a JSON {found}")]
    UnsupportedRelationshipValue {
        relationship: String,
        parent: ObjectRef,
        found: &'static str,
    },

    #[error("Field '{field}' of {parent} is invalid: {reason}")]
    InvalidScalar {
        field: String,
        parent: ObjectRef,
        reason: String,
    },

    #[error("Unknown field '{field}' for {parent}")]
    UnknownField { field: String, parent: ObjectRef },

    #[error("Invalid document structure: {0}")]
    InvalidStructure(String),

    #[error("JSON parse error: {0}")]
    Parse(String),

    #[error("Store error: {0}")]
    Store(#[from] DaoError),
}

impl UpsertError {
    /// Identity is misconfigured; retrying with other data will not help
    pub fn is_configuration(&self) -> bool {
        matches!(
            self,
            UpsertError::MissingPrimaryKeys { .. }
                | UpsertError::MissingKeyValue { .. }
                | UpsertError::InvalidKeyValue { .. }
        )
    }

    /// The document does not fit the model at one field
    pub fn is_shape_mismatch(&self) -> bool {
        matches!(
            self,
            UpsertError::ToOneGivenArray { .. }
                | UpsertError::UnsupportedRelationshipValue { .. }
                | UpsertError::InvalidScalar { .. }
                | UpsertError::UnknownField { .. }
        )
    }
}

impl From<serde_json::Error> for UpsertError {
    fn from(err: serde_json::Error) -> Self {
        UpsertError::Parse(err.to_string())
    }
}

/// Human name of a JSON value's kind
pub(crate) fn json_kind(value: &serde_json::Value) -> &'static str {
    match value {
        serde_json::Value::Null => "null",
        serde_json::Value::Bool(_) => "boolean",
        serde_json::Value::Number(_) => "number",
        serde_json::Value::String(_) => "string",
        serde_json::Value::Array(_) => "array",
        serde_json::Value::Object(_) => "object",
    }
}
