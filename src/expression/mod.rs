pub mod pattern;
pub mod predicate;

pub use pattern::eval_like;
pub use predicate::{CompareOp, FetchRequest, Predicate, SortDescriptor, compare_records};
