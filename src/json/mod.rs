//! JSON ingestion
//!
//! Maps arbitrary nested JSON documents onto the managed object graph.
//!
//! # Architecture
//!
//! - `upsert.rs` - the recursive engine (JsonUpserter)
//! - `policy.rs` - identity resolution strategy (IdentityPolicy, PrimaryKeyTable)
//! - `converter.rs` - JSON scalar to attribute value conversion
//! - `error.rs` - domain-specific errors

mod converter;
mod error;
pub mod policy;
mod upsert;

pub use converter::JsonToValueConverter;
pub use error::{ObjectRef, UpsertError, UpsertResult};
pub use policy::{IdentityPolicy, PrimaryKeyTable, defaults};
pub use upsert::{JsonUpserter, UnknownFieldPolicy, UpsertOptions, upsert_async};

/// One JSON object: field name to scalar, nested object, or array of objects
pub type JsonNode = serde_json::Map<String, serde_json::Value>;
