//! Object contexts: working sets of managed objects over a persistent store.

pub mod merge;
pub mod object;
pub mod object_context;
pub mod queue;

pub use merge::MergePolicy;
pub use object::{ManagedObject, ObjectState};
pub use object_context::ObjectContext;
pub use queue::{ContextHandle, PerformHandle};
