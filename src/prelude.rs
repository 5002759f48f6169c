//! Everything a typical ingestion job needs, in one import.
//!
//! ```ignore
//! use graphdao::prelude::*;
//! ```

pub use crate::config::{StackConfig, StoreKind};
pub use crate::context::{ContextHandle, MergePolicy, ObjectContext, ObjectState};
pub use crate::core::{AttributeType, DaoError, ObjectId, Result, Value};
pub use crate::dao::Dao;
pub use crate::expression::{FetchRequest, Predicate, SortDescriptor};
pub use crate::json::{
    IdentityPolicy, JsonNode, JsonUpserter, ObjectRef, PrimaryKeyTable, UnknownFieldPolicy,
    UpsertError, UpsertOptions, defaults, upsert_async,
};
pub use crate::stack::DataStack;
pub use crate::storage::{EntityCatalog, EntityDescriptor};
