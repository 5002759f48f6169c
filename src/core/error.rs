use crate::core::ObjectId;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum DaoError {
    #[error("Entity '{0}' not found in catalog")]
    EntityNotFound(String),

    #[error("Attribute '{attribute}' not found on entity '{entity}'")]
    AttributeNotFound { entity: String, attribute: String },

    #[error("Relationship '{relationship}' not found on entity '{entity}'")]
    RelationshipNotFound { entity: String, relationship: String },

    #[error("Object {0} not found")]
    ObjectNotFound(ObjectId),

    #[error("Object {0} has been deleted")]
    ObjectDeleted(ObjectId),

    #[error("Type mismatch: {0}")]
    TypeMismatch(String),

    #[error("Relationship '{relationship}' on entity '{entity}' is not {expected}")]
    CardinalityMismatch {
        entity: String,
        relationship: String,
        expected: &'static str,
    },

    #[error("Constraint violation: {0}")]
    ConstraintViolation(String),

    #[error("Invalid model: {0}")]
    InvalidModel(String),

    #[error("Unique key lookup on entity '{0}' requires at least one key")]
    EmptyUniqueKeys(String),

    #[error("Merge conflict on {entity} object {object}")]
    MergeConflict { entity: String, object: ObjectId },

    #[error("Context queue has been closed")]
    ContextClosed,

    #[error("Parse error: {0}")]
    ParseError(String),

    #[error("Lock error: {0}")]
    LockError(String),

    #[error("I/O error: {0}")]
    IoError(String),
}

pub type Result<T> = std::result::Result<T, DaoError>;

impl<T> From<std::sync::PoisonError<T>> for DaoError {
    fn from(err: std::sync::PoisonError<T>) -> Self {
        Self::LockError(err.to_string())
    }
}
