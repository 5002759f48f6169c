// ============================================================================
// graphdao Library
// ============================================================================
//
// A managed-object store with a generic data-access layer and a recursive
// JSON upsert engine on top.
//
// Layers, bottom-up:
// - `core`       values, ids, errors
// - `storage`    entity catalog, committed rows, snapshot files
// - `expression` fetch predicates and sort descriptors
// - `context`    working sets, merge policies, confined queues
// - `dao`        fetch / identity lookup / insert / delete by entity name
// - `json`       JSON to object-graph upsert
// - `stack`      store + contexts wired from a `StackConfig`

pub mod config;
pub mod context;
pub mod core;
pub mod dao;
pub mod expression;
pub mod json;
pub mod prelude;
pub mod stack;
pub mod storage;

pub use config::{StackConfig, StoreKind};
pub use context::{ContextHandle, MergePolicy, ObjectContext, PerformHandle};
pub use core::{AttributeType, ContextId, DaoError, ObjectId, Result, Value};
pub use dao::Dao;
pub use expression::{FetchRequest, Predicate, SortDescriptor};
pub use json::{
    IdentityPolicy, JsonNode, JsonUpserter, PrimaryKeyTable, UnknownFieldPolicy, UpsertError,
    UpsertOptions, UpsertResult,
};
pub use stack::DataStack;
pub use storage::{EntityCatalog, EntityDescriptor};
