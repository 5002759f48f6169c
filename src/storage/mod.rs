pub mod catalog;
pub mod descriptor;
pub mod persistence;
pub mod persistent;
pub mod record;

pub use catalog::EntityCatalog;
pub use descriptor::{
    AttributeDescriptor, Cardinality, EntityDescriptor, FieldKind, RelationshipDescriptor,
};
pub use persistence::{SnapshotManager, StoreSnapshot};
pub use persistent::{PendingWrite, PersistentStore, StoreChange};
pub use record::{ObjectRecord, RelationValue};
