use crate::context::MergePolicy;
use crate::core::{DaoError, Result};
use std::path::PathBuf;

/// Where the persistent store keeps its rows
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StoreKind {
    /// Rows live only as long as the process
    Memory,
    /// Rows are snapshotted to a MessagePack file after every commit
    Binary(PathBuf),
}

impl StoreKind {
    /// Parse a store URL
    ///
    /// Format: `memory://` or `binary://<path>`
    ///
    /// # Examples
    ///
    /// ```ignore
    /// let kind = StoreKind::from_url("binary:///var/lib/app/store.snapshot")?;
    /// ```
    pub fn from_url(url: &str) -> Result<Self> {
        if url == "memory://" || url == "memory" {
            return Ok(StoreKind::Memory);
        }
        match url.strip_prefix("binary://") {
            Some("") => Err(DaoError::ParseError(
                "binary:// store URL needs a file path".to_string(),
            )),
            Some(path) => Ok(StoreKind::Binary(PathBuf::from(path))),
            None => Err(DaoError::ParseError(format!(
                "Unsupported store URL '{}': expected memory:// or binary://<path>",
                url
            ))),
        }
    }

    pub fn to_url(&self) -> String {
        match self {
            StoreKind::Memory => "memory://".to_string(),
            StoreKind::Binary(path) => format!("binary://{}", path.display()),
        }
    }
}

/// Data stack configuration
#[derive(Debug, Clone)]
pub struct StackConfig {
    pub store: StoreKind,

    /// Merge policy of the view context
    pub view_merge_policy: MergePolicy,

    /// Merge policy of every background context
    pub background_merge_policy: MergePolicy,

    /// Capacity of the store change channel; slower contexts fall back to a
    /// full refresh
    pub change_buffer: usize,
}

impl Default for StackConfig {
    fn default() -> Self {
        Self::new(StoreKind::Memory)
    }
}

impl StackConfig {
    pub fn new(store: StoreKind) -> Self {
        Self {
            store,
            view_merge_policy: MergePolicy::Error,
            background_merge_policy: MergePolicy::PropertyObjectTrump,
            change_buffer: 1024,
        }
    }

    pub fn from_url(url: &str) -> Result<Self> {
        Ok(Self::new(StoreKind::from_url(url)?))
    }

    /// Set the view context merge policy
    pub fn view_merge_policy(mut self, policy: MergePolicy) -> Self {
        self.view_merge_policy = policy;
        self
    }

    /// Set the background context merge policy
    pub fn background_merge_policy(mut self, policy: MergePolicy) -> Self {
        self.background_merge_policy = policy;
        self
    }

    pub fn change_buffer(mut self, capacity: usize) -> Self {
        self.change_buffer = capacity;
        self
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<()> {
        if self.change_buffer == 0 {
            return Err(DaoError::InvalidModel(
                "change_buffer must be > 0".to_string(),
            ));
        }
        Ok(())
    }
}
