//! Entity descriptors: the statically registered shape of every entity type.
//!
//! A descriptor lists scalar attributes and relationships by name. The
//! upsert engine and the object context classify field names against it
//! instead of discovering members at runtime.

use crate::core::{AttributeType, DaoError, Result};
use serde::{Deserialize, Serialize};

fn default_optional() -> bool {
    true
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AttributeDescriptor {
    pub name: String,
    #[serde(rename = "type")]
    pub attribute_type: AttributeType,
    /// Optional attributes may stay NULL when the object is saved
    #[serde(default = "default_optional")]
    pub optional: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Cardinality {
    ToOne,
    ToMany,
}

impl Cardinality {
    pub fn is_to_many(&self) -> bool {
        matches!(self, Cardinality::ToMany)
    }

    pub fn label(&self) -> &'static str {
        match self {
            Cardinality::ToOne => "to-one",
            Cardinality::ToMany => "to-many",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RelationshipDescriptor {
    pub name: String,
    /// Entity name of the related objects
    pub destination: String,
    pub cardinality: Cardinality,
    /// Relationship on the destination entity that points back, if any
    #[serde(default)]
    pub inverse: Option<String>,
}

impl RelationshipDescriptor {
    pub fn is_to_many(&self) -> bool {
        self.cardinality.is_to_many()
    }
}

/// Classification of a field name against an entity descriptor
#[derive(Debug, Clone, Copy)]
pub enum FieldKind<'a> {
    Attribute(&'a AttributeDescriptor),
    Relationship(&'a RelationshipDescriptor),
    Unknown,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EntityDescriptor {
    pub name: String,
    #[serde(default)]
    pub attributes: Vec<AttributeDescriptor>,
    #[serde(default)]
    pub relationships: Vec<RelationshipDescriptor>,
}

impl EntityDescriptor {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            attributes: Vec::new(),
            relationships: Vec::new(),
        }
    }

    /// Add an optional attribute
    pub fn attribute(mut self, name: impl Into<String>, attribute_type: AttributeType) -> Self {
        self.attributes.push(AttributeDescriptor {
            name: name.into(),
            attribute_type,
            optional: true,
        });
        self
    }

    /// Add an attribute that must hold a value when the object is saved
    pub fn required(mut self, name: impl Into<String>, attribute_type: AttributeType) -> Self {
        self.attributes.push(AttributeDescriptor {
            name: name.into(),
            attribute_type,
            optional: false,
        });
        self
    }

    pub fn to_one(self, name: impl Into<String>, destination: impl Into<String>) -> Self {
        self.relationship(name, destination, Cardinality::ToOne)
    }

    pub fn to_many(self, name: impl Into<String>, destination: impl Into<String>) -> Self {
        self.relationship(name, destination, Cardinality::ToMany)
    }

    fn relationship(
        mut self,
        name: impl Into<String>,
        destination: impl Into<String>,
        cardinality: Cardinality,
    ) -> Self {
        self.relationships.push(RelationshipDescriptor {
            name: name.into(),
            destination: destination.into(),
            cardinality,
            inverse: None,
        });
        self
    }

    /// Set the inverse of the most recently added relationship
    pub fn inverse(mut self, inverse: impl Into<String>) -> Self {
        if let Some(last) = self.relationships.last_mut() {
            last.inverse = Some(inverse.into());
        }
        self
    }

    pub fn get_attribute(&self, name: &str) -> Option<&AttributeDescriptor> {
        self.attributes.iter().find(|a| a.name == name)
    }

    pub fn get_relationship(&self, name: &str) -> Option<&RelationshipDescriptor> {
        self.relationships.iter().find(|r| r.name == name)
    }

    pub fn attribute_named(&self, name: &str) -> Result<&AttributeDescriptor> {
        self.get_attribute(name)
            .ok_or_else(|| DaoError::AttributeNotFound {
                entity: self.name.clone(),
                attribute: name.to_string(),
            })
    }

    pub fn relationship_named(&self, name: &str) -> Result<&RelationshipDescriptor> {
        self.get_relationship(name)
            .ok_or_else(|| DaoError::RelationshipNotFound {
                entity: self.name.clone(),
                relationship: name.to_string(),
            })
    }

    pub fn classify(&self, name: &str) -> FieldKind<'_> {
        if let Some(relationship) = self.get_relationship(name) {
            return FieldKind::Relationship(relationship);
        }
        match self.get_attribute(name) {
            Some(attribute) => FieldKind::Attribute(attribute),
            None => FieldKind::Unknown,
        }
    }

    pub fn attribute_names(&self) -> impl Iterator<Item = &str> {
        self.attributes.iter().map(|a| a.name.as_str())
    }

    pub fn relationship_names(&self) -> impl Iterator<Item = &str> {
        self.relationships.iter().map(|r| r.name.as_str())
    }
}
