use serde::{Deserialize, Serialize};
use std::fmt;

/// How a save resolves objects whose stored row changed after they were read
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MergePolicy {
    /// Fail the save with `MergeConflict`
    #[default]
    Error,
    /// Properties changed in memory overwrite the stored row; untouched
    /// properties keep the stored values
    PropertyObjectTrump,
    /// The stored row wins; in-memory changes to conflicting objects are dropped
    StoreTrump,
}

impl MergePolicy {
    pub fn parse(name: &str) -> Option<Self> {
        match name.to_ascii_lowercase().as_str() {
            "error" => Some(MergePolicy::Error),
            "property_object_trump" | "object" => Some(MergePolicy::PropertyObjectTrump),
            "store_trump" | "store" => Some(MergePolicy::StoreTrump),
            _ => None,
        }
    }
}

impl fmt::Display for MergePolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            MergePolicy::Error => "error",
            MergePolicy::PropertyObjectTrump => "property_object_trump",
            MergePolicy::StoreTrump => "store_trump",
        };
        write!(f, "{}", name)
    }
}
