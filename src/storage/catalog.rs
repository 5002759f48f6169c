use super::descriptor::EntityDescriptor;
use crate::core::{DaoError, Result};
use serde::Deserialize;
use std::collections::HashMap;
use std::sync::Arc;

/// Catalog holds the entity descriptors of one model.
///
/// Immutable once built; cloning only bumps a reference count, so every
/// context and every upsert call can keep its own copy without locking.
#[derive(Debug, Clone, Default)]
pub struct EntityCatalog {
    entities: Arc<HashMap<String, Arc<EntityDescriptor>>>,
}

#[derive(Deserialize)]
struct ModelDocument {
    entities: Vec<EntityDescriptor>,
}

impl EntityCatalog {
    pub fn new() -> Self {
        Self {
            entities: Arc::new(HashMap::new()),
        }
    }

    /// Add an entity, returning a NEW catalog (copy-on-write)
    pub fn with_entity(self, descriptor: EntityDescriptor) -> Result<Self> {
        let name = descriptor.name.clone();
        if self.entities.contains_key(&name) {
            return Err(DaoError::InvalidModel(format!(
                "Entity '{}' is already registered",
                name
            )));
        }

        let mut entities = (*self.entities).clone();
        entities.insert(name, Arc::new(descriptor));

        Ok(Self {
            entities: Arc::new(entities),
        })
    }

    /// Build a catalog from a model document: `{"entities": [...]}`
    pub fn from_json(document: &str) -> Result<Self> {
        let model: ModelDocument =
            serde_json::from_str(document).map_err(|e| DaoError::ParseError(e.to_string()))?;

        let mut catalog = Self::new();
        for entity in model.entities {
            catalog = catalog.with_entity(entity)?;
        }
        catalog.validate()?;
        Ok(catalog)
    }

    pub fn entity(&self, name: &str) -> Result<&Arc<EntityDescriptor>> {
        self.entities
            .get(name)
            .ok_or_else(|| DaoError::EntityNotFound(name.to_string()))
    }

    pub fn contains(&self, name: &str) -> bool {
        self.entities.contains_key(name)
    }

    pub fn entity_names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.entities.keys().map(|s| s.as_str()).collect();
        names.sort_unstable();
        names
    }

    /// Descriptors in name order
    pub fn entities(&self) -> impl Iterator<Item = &Arc<EntityDescriptor>> {
        let mut entities: Vec<&Arc<EntityDescriptor>> = self.entities.values().collect();
        entities.sort_unstable_by(|a, b| a.name.cmp(&b.name));
        entities.into_iter()
    }

    pub fn len(&self) -> usize {
        self.entities.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entities.is_empty()
    }

    /// Check that relationships resolve and inverses are symmetric.
    pub fn validate(&self) -> Result<()> {
        for entity in self.entities.values() {
            let mut seen = std::collections::HashSet::new();
            for name in entity.attribute_names().chain(entity.relationship_names()) {
                if !seen.insert(name) {
                    return Err(DaoError::InvalidModel(format!(
                        "Field '{}' is declared twice on entity '{}'",
                        name, entity.name
                    )));
                }
            }

            for relationship in &entity.relationships {
                let destination = self.entities.get(&relationship.destination).ok_or_else(|| {
                    DaoError::InvalidModel(format!(
                        "Relationship '{}.{}' points to unknown entity '{}'",
                        entity.name, relationship.name, relationship.destination
                    ))
                })?;

                let Some(inverse_name) = &relationship.inverse else {
                    continue;
                };

                let inverse = destination.get_relationship(inverse_name).ok_or_else(|| {
                    DaoError::InvalidModel(format!(
                        "Inverse '{}.{}' of '{}.{}' does not exist",
                        destination.name, inverse_name, entity.name, relationship.name
                    ))
                })?;

                if inverse.destination != entity.name
                    || inverse.inverse.as_deref() != Some(relationship.name.as_str())
                {
                    return Err(DaoError::InvalidModel(format!(
                        "Inverse '{}.{}' does not point back to '{}.{}'",
                        destination.name, inverse_name, entity.name, relationship.name
                    )));
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::AttributeType;

    fn user() -> EntityDescriptor {
        EntityDescriptor::new("User")
            .required("id", AttributeType::Integer)
            .to_many("profileSet", "Profile")
            .inverse("user")
    }

    fn profile() -> EntityDescriptor {
        EntityDescriptor::new("Profile")
            .required("id", AttributeType::Integer)
            .to_one("user", "User")
            .inverse("profileSet")
    }

    #[test]
    fn test_catalog_copy_on_write() {
        let base = EntityCatalog::new();
        let with_user = base.clone().with_entity(user()).unwrap();
        assert!(base.is_empty());
        assert!(with_user.contains("User"));
        assert!(with_user.clone().with_entity(user()).is_err());
    }

    #[test]
    fn test_validate_symmetric_inverse() {
        let catalog = EntityCatalog::new()
            .with_entity(user())
            .unwrap()
            .with_entity(profile())
            .unwrap();
        catalog.validate().unwrap();
        assert_eq!(catalog.entity_names(), vec!["Profile", "User"]);
        let names: Vec<&str> = catalog.entities().map(|e| e.name.as_str()).collect();
        assert_eq!(names, vec!["Profile", "User"]);
    }

    #[test]
    fn test_validate_rejects_dangling_destination() {
        let catalog = EntityCatalog::new().with_entity(user()).unwrap();
        assert!(matches!(catalog.validate(), Err(DaoError::InvalidModel(_))));
    }

    #[test]
    fn test_validate_rejects_asymmetric_inverse() {
        let broken_profile = EntityDescriptor::new("Profile")
            .to_one("user", "User")
            .inverse("somethingElse");
        let catalog = EntityCatalog::new()
            .with_entity(user())
            .unwrap()
            .with_entity(broken_profile)
            .unwrap();
        assert!(catalog.validate().is_err());
    }

    #[test]
    fn test_from_json_model() {
        let model = r#"{"entities": [
            {"name": "Tag", "attributes": [{"name": "label", "type": "text"}]}
        ]}"#;
        let catalog = EntityCatalog::from_json(model).unwrap();
        assert_eq!(catalog.len(), 1);
        assert!(catalog.entity("Tag").unwrap().get_attribute("label").is_some());
        assert!(matches!(
            catalog.entity("User"),
            Err(DaoError::EntityNotFound(_))
        ));
    }
}
