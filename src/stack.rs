//! The data stack: one persistent store plus the contexts working on it.

use crate::config::StackConfig;
use crate::context::{ContextHandle, ObjectContext};
use crate::core::Result;
use crate::storage::{EntityCatalog, PersistentStore};
use std::sync::Arc;

pub struct DataStack {
    config: StackConfig,
    store: Arc<PersistentStore>,
    view: ObjectContext,
}

impl std::fmt::Debug for DataStack {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DataStack")
            .field("store", &self.config.store)
            .field("view", &self.view)
            .finish()
    }
}

impl DataStack {
    /// Validate the catalog and open the configured store
    pub fn open(config: StackConfig, catalog: EntityCatalog) -> Result<Self> {
        config.validate()?;
        catalog.validate()?;

        let store = Arc::new(PersistentStore::open(
            &config.store,
            catalog,
            config.change_buffer,
        )?);
        let view = ObjectContext::new(Arc::clone(&store), config.view_merge_policy);
        log::info!(
            "Opened {} store with {} entities",
            config.store.to_url(),
            store.catalog().len()
        );
        for entity in store.catalog().entities() {
            log::debug!(
                "Entity {}: {} attribute(s), {} relationship(s)",
                entity.name,
                entity.attributes.len(),
                entity.relationships.len()
            );
        }

        Ok(Self {
            config,
            store,
            view,
        })
    }

    pub fn in_memory(catalog: EntityCatalog) -> Result<Self> {
        Self::open(StackConfig::default(), catalog)
    }

    pub fn config(&self) -> &StackConfig {
        &self.config
    }

    pub fn catalog(&self) -> &EntityCatalog {
        self.store.catalog()
    }

    pub fn store(&self) -> &Arc<PersistentStore> {
        &self.store
    }

    /// The long-lived context owned by the stack
    pub fn view_context(&mut self) -> &mut ObjectContext {
        &mut self.view
    }

    /// A fresh context using the background merge policy
    pub fn new_background_context(&self) -> ObjectContext {
        ObjectContext::new(Arc::clone(&self.store), self.config.background_merge_policy)
    }

    /// A background context confined to its own queue. Needs a tokio runtime.
    pub fn spawn_background_context(&self) -> ContextHandle {
        ContextHandle::spawn(self.new_background_context())
    }

    /// Save `context` if it has changes. Returns whether anything was committed.
    pub fn save(context: &mut ObjectContext) -> Result<bool> {
        if !context.has_changes() {
            return Ok(false);
        }
        context.save()?;
        Ok(true)
    }

    pub fn save_view(&mut self) -> Result<bool> {
        Self::save(&mut self.view)
    }
}
