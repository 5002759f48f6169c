pub mod error;
pub mod types;
pub mod value;

pub use error::{DaoError, Result};
pub use types::{ContextId, ObjectId};
pub use value::{AttributeType, Value};
