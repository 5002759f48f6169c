//! Fetch predicates and sort descriptors evaluated against object records.

use super::pattern::eval_like;
use crate::core::{ObjectId, Value};
use crate::storage::ObjectRecord;
use std::cmp::Ordering;
use std::collections::BTreeMap;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompareOp {
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
}

/// Boolean filter over the attributes of an object
#[derive(Debug, Clone, PartialEq)]
pub enum Predicate {
    True,
    Compare {
        key: String,
        op: CompareOp,
        value: Value,
    },
    In {
        key: String,
        values: Vec<Value>,
    },
    IsNull(String),
    Like {
        key: String,
        pattern: String,
        case_sensitive: bool,
    },
    And(Vec<Predicate>),
    Or(Vec<Predicate>),
    Not(Box<Predicate>),
}

impl Predicate {
    fn compare(key: impl Into<String>, op: CompareOp, value: impl Into<Value>) -> Self {
        Predicate::Compare {
            key: key.into(),
            op,
            value: value.into(),
        }
    }

    pub fn eq(key: impl Into<String>, value: impl Into<Value>) -> Self {
        Self::compare(key, CompareOp::Eq, value)
    }

    pub fn ne(key: impl Into<String>, value: impl Into<Value>) -> Self {
        Self::compare(key, CompareOp::Ne, value)
    }

    pub fn lt(key: impl Into<String>, value: impl Into<Value>) -> Self {
        Self::compare(key, CompareOp::Lt, value)
    }

    pub fn le(key: impl Into<String>, value: impl Into<Value>) -> Self {
        Self::compare(key, CompareOp::Le, value)
    }

    pub fn gt(key: impl Into<String>, value: impl Into<Value>) -> Self {
        Self::compare(key, CompareOp::Gt, value)
    }

    pub fn ge(key: impl Into<String>, value: impl Into<Value>) -> Self {
        Self::compare(key, CompareOp::Ge, value)
    }

    pub fn is_in(key: impl Into<String>, values: Vec<Value>) -> Self {
        Predicate::In {
            key: key.into(),
            values,
        }
    }

    pub fn is_null(key: impl Into<String>) -> Self {
        Predicate::IsNull(key.into())
    }

    pub fn like(key: impl Into<String>, pattern: impl Into<String>) -> Self {
        Predicate::Like {
            key: key.into(),
            pattern: pattern.into(),
            case_sensitive: true,
        }
    }

    pub fn ilike(key: impl Into<String>, pattern: impl Into<String>) -> Self {
        Predicate::Like {
            key: key.into(),
            pattern: pattern.into(),
            case_sensitive: false,
        }
    }

    /// Conjunction of `key == value` for every pair
    pub fn all_equal(keys: &BTreeMap<String, Value>) -> Self {
        Predicate::And(
            keys.iter()
                .map(|(key, value)| Predicate::eq(key.clone(), value.clone()))
                .collect(),
        )
    }

    pub fn and(self, other: Predicate) -> Self {
        match self {
            Predicate::And(mut parts) => {
                parts.push(other);
                Predicate::And(parts)
            }
            first => Predicate::And(vec![first, other]),
        }
    }

    pub fn or(self, other: Predicate) -> Self {
        match self {
            Predicate::Or(mut parts) => {
                parts.push(other);
                Predicate::Or(parts)
            }
            first => Predicate::Or(vec![first, other]),
        }
    }

    pub fn negate(self) -> Self {
        Predicate::Not(Box::new(self))
    }

    /// Evaluate against a record. Incomparable values never match.
    pub fn evaluate(&self, record: &ObjectRecord) -> bool {
        match self {
            Predicate::True => true,
            Predicate::Compare { key, op, value } => {
                let actual = record.value(key);
                match op {
                    CompareOp::Eq => actual == value,
                    CompareOp::Ne => actual != value,
                    ordered => {
                        if actual.is_null() || value.is_null() {
                            return false;
                        }
                        match actual.compare(value) {
                            Ok(ordering) => match ordered {
                                CompareOp::Lt => ordering == Ordering::Less,
                                CompareOp::Le => ordering != Ordering::Greater,
                                CompareOp::Gt => ordering == Ordering::Greater,
                                CompareOp::Ge => ordering != Ordering::Less,
                                CompareOp::Eq | CompareOp::Ne => false,
                            },
                            Err(_) => false,
                        }
                    }
                }
            }
            Predicate::In { key, values } => {
                let actual = record.value(key);
                values.iter().any(|v| v == actual)
            }
            Predicate::IsNull(key) => record.value(key).is_null(),
            Predicate::Like {
                key,
                pattern,
                case_sensitive,
            } => match record.value(key).as_str() {
                Some(text) => eval_like(text, pattern, *case_sensitive).unwrap_or(false),
                None => false,
            },
            Predicate::And(parts) => parts.iter().all(|p| p.evaluate(record)),
            Predicate::Or(parts) => parts.iter().any(|p| p.evaluate(record)),
            Predicate::Not(inner) => !inner.evaluate(record),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SortDescriptor {
    pub key: String,
    pub ascending: bool,
}

impl SortDescriptor {
    pub fn asc(key: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            ascending: true,
        }
    }

    pub fn desc(key: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            ascending: false,
        }
    }
}

/// Order two records by the given descriptors, falling back to object id so
/// the result is always deterministic.
pub fn compare_records(
    sorts: &[SortDescriptor],
    (left_id, left): (ObjectId, &ObjectRecord),
    (right_id, right): (ObjectId, &ObjectRecord),
) -> Ordering {
    for sort in sorts {
        let ordering = left
            .value(&sort.key)
            .compare(right.value(&sort.key))
            .unwrap_or(Ordering::Equal);
        let ordering = if sort.ascending {
            ordering
        } else {
            ordering.reverse()
        };
        if ordering != Ordering::Equal {
            return ordering;
        }
    }
    left_id.cmp(&right_id)
}

/// Everything a context needs to answer one fetch
#[derive(Debug, Clone, PartialEq)]
pub struct FetchRequest {
    pub entity: String,
    pub predicate: Option<Predicate>,
    pub sorts: Vec<SortDescriptor>,
    pub offset: usize,
    pub limit: Option<usize>,
}

impl FetchRequest {
    pub fn new(entity: impl Into<String>) -> Self {
        Self {
            entity: entity.into(),
            predicate: None,
            sorts: Vec::new(),
            offset: 0,
            limit: None,
        }
    }

    pub fn predicate(mut self, predicate: Predicate) -> Self {
        self.predicate = Some(predicate);
        self
    }

    pub fn sort(mut self, sort: SortDescriptor) -> Self {
        self.sorts.push(sort);
        self
    }

    pub fn sorts(mut self, sorts: Vec<SortDescriptor>) -> Self {
        self.sorts = sorts;
        self
    }

    pub fn offset(mut self, offset: usize) -> Self {
        self.offset = offset;
        self
    }

    pub fn limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    pub fn matches(&self, record: &ObjectRecord) -> bool {
        record.entity == self.entity
            && self
                .predicate
                .as_ref()
                .is_none_or(|predicate| predicate.evaluate(record))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::AttributeType;
    use crate::storage::EntityDescriptor;

    fn user(id: i64, name: &str, age: Option<i64>) -> ObjectRecord {
        let descriptor = EntityDescriptor::new("User")
            .attribute("id", AttributeType::Integer)
            .attribute("name", AttributeType::Text)
            .attribute("age", AttributeType::Integer);
        let mut record = ObjectRecord::new(&descriptor);
        record.values.insert("id".into(), Value::Integer(id));
        record.values.insert("name".into(), Value::Text(name.into()));
        if let Some(age) = age {
            record.values.insert("age".into(), Value::Integer(age));
        }
        record
    }

    #[test]
    fn test_comparisons() {
        let alice = user(1, "Alice", Some(30));
        assert!(Predicate::eq("name", "Alice").evaluate(&alice));
        assert!(Predicate::gt("age", 25).evaluate(&alice));
        assert!(!Predicate::lt("age", 25).evaluate(&alice));
        assert!(Predicate::ge("age", 30).and(Predicate::le("age", 30)).evaluate(&alice));
        assert!(!Predicate::gt("name", 3).evaluate(&alice));
    }

    #[test]
    fn test_null_handling() {
        let bob = user(2, "Bob", None);
        assert!(Predicate::is_null("age").evaluate(&bob));
        assert!(!Predicate::gt("age", 0).evaluate(&bob));
        assert!(Predicate::eq("age", Value::Null).evaluate(&bob));
    }

    #[test]
    fn test_boolean_combinators() {
        let alice = user(1, "Alice", Some(30));
        let either = Predicate::eq("name", "Bob").or(Predicate::like("name", "Al%"));
        assert!(either.evaluate(&alice));
        assert!(!either.clone().negate().evaluate(&alice));
        assert!(Predicate::is_in("id", vec![Value::Integer(3), Value::Integer(1)]).evaluate(&alice));
        assert!(Predicate::ilike("name", "ALICE").evaluate(&alice));
    }

    #[test]
    fn test_all_equal() {
        let alice = user(1, "Alice", Some(30));
        let mut keys = BTreeMap::new();
        keys.insert("id".to_string(), Value::Integer(1));
        keys.insert("name".to_string(), Value::from("Alice"));
        assert!(Predicate::all_equal(&keys).evaluate(&alice));
        keys.insert("name".to_string(), Value::from("Bob"));
        assert!(!Predicate::all_equal(&keys).evaluate(&alice));
    }

    #[test]
    fn test_compare_records_is_deterministic() {
        let a = user(1, "Same", Some(1));
        let b = user(2, "Same", Some(1));
        let sorts = vec![SortDescriptor::asc("name")];
        assert_eq!(
            compare_records(&sorts, (ObjectId(5), &a), (ObjectId(9), &b)),
            Ordering::Less
        );
        let by_id_desc = vec![SortDescriptor::desc("id")];
        assert_eq!(
            compare_records(&by_id_desc, (ObjectId(5), &a), (ObjectId(9), &b)),
            Ordering::Greater
        );
    }
}
