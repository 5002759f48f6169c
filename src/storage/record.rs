use super::descriptor::EntityDescriptor;
use crate::core::{ObjectId, Value};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

static NULL: Value = Value::Null;

/// Current target(s) of one relationship
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum RelationValue {
    One(Option<ObjectId>),
    Many(BTreeSet<ObjectId>),
}

impl RelationValue {
    /// Drop `target` from this relation. Returns true if anything changed.
    pub fn remove(&mut self, target: ObjectId) -> bool {
        match self {
            RelationValue::One(current) if *current == Some(target) => {
                *current = None;
                true
            }
            RelationValue::One(_) => false,
            RelationValue::Many(set) => set.remove(&target),
        }
    }

    pub fn contains(&self, target: ObjectId) -> bool {
        match self {
            RelationValue::One(current) => *current == Some(target),
            RelationValue::Many(set) => set.contains(&target),
        }
    }

    pub fn targets(&self) -> Vec<ObjectId> {
        match self {
            RelationValue::One(current) => current.iter().copied().collect(),
            RelationValue::Many(set) => set.iter().copied().collect(),
        }
    }
}

/// The stored state of one object: attribute values plus relationship links.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ObjectRecord {
    pub entity: String,
    pub values: BTreeMap<String, Value>,
    pub relations: BTreeMap<String, RelationValue>,
    /// Bumped on every committed change; drives optimistic merge checks
    pub version: u64,
}

impl ObjectRecord {
    /// Empty record with every relationship of `descriptor` initialized
    pub fn new(descriptor: &EntityDescriptor) -> Self {
        let relations = descriptor
            .relationships
            .iter()
            .map(|r| {
                let empty = if r.is_to_many() {
                    RelationValue::Many(BTreeSet::new())
                } else {
                    RelationValue::One(None)
                };
                (r.name.clone(), empty)
            })
            .collect();

        Self {
            entity: descriptor.name.clone(),
            values: BTreeMap::new(),
            relations,
            version: 0,
        }
    }

    /// Attribute value, NULL when never set
    pub fn value(&self, attribute: &str) -> &Value {
        self.values.get(attribute).unwrap_or(&NULL)
    }

    pub fn to_one(&self, relationship: &str) -> Option<ObjectId> {
        match self.relations.get(relationship) {
            Some(RelationValue::One(target)) => *target,
            _ => None,
        }
    }

    pub fn to_many(&self, relationship: &str) -> BTreeSet<ObjectId> {
        match self.relations.get(relationship) {
            Some(RelationValue::Many(set)) => set.clone(),
            _ => BTreeSet::new(),
        }
    }

    /// Remove every link to `target`. Returns the names of the relations touched.
    pub fn remove_references(&mut self, target: ObjectId) -> Vec<String> {
        self.relations
            .iter_mut()
            .filter_map(|(name, relation)| relation.remove(target).then(|| name.clone()))
            .collect()
    }

    pub fn references(&self, target: ObjectId) -> bool {
        self.relations.values().any(|r| r.contains(target))
    }
}
