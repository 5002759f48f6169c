//! Snapshot persistence for the binary store.
//!
//! Every commit rewrites the full snapshot. The file is written to a temp file
//! in the same directory and renamed over the old one, so a crash mid-write
//! leaves the previous snapshot intact.

use super::record::ObjectRecord;
use crate::core::{DaoError, ObjectId, Result};
use serde::{Deserialize, Serialize};
use std::fs::{self, File};
use std::io::{BufWriter, Read, Write};
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

const SNAPSHOT_FORMAT_VERSION: u32 = 1;

#[derive(Debug, Serialize, Deserialize)]
pub struct StoreSnapshot {
    pub version: u32,
    pub next_id: u64,
    pub rows: im::OrdMap<ObjectId, ObjectRecord>,
    pub metadata: SnapshotMetadata,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct SnapshotMetadata {
    pub created_at: u64,
    pub row_count: usize,
}

impl StoreSnapshot {
    pub fn new(rows: im::OrdMap<ObjectId, ObjectRecord>, next_id: u64) -> Self {
        let created_at = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis() as u64)
            .unwrap_or_default();
        let row_count = rows.len();

        Self {
            version: SNAPSHOT_FORMAT_VERSION,
            next_id,
            rows,
            metadata: SnapshotMetadata {
                created_at,
                row_count,
            },
        }
    }
}

#[derive(Debug, Clone)]
pub struct SnapshotManager {
    snapshot_path: PathBuf,
}

impl SnapshotManager {
    pub fn new<P: AsRef<Path>>(snapshot_path: P) -> Self {
        Self {
            snapshot_path: snapshot_path.as_ref().to_path_buf(),
        }
    }

    pub fn path(&self) -> &Path {
        &self.snapshot_path
    }

    pub fn save(&self, snapshot: &StoreSnapshot) -> Result<()> {
        let parent = match self.snapshot_path.parent() {
            Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
            _ => PathBuf::from("."),
        };
        fs::create_dir_all(&parent).map_err(|e| {
            DaoError::IoError(format!("Failed to create snapshot directory: {}", e))
        })?;

        let serialized = rmp_serde::to_vec_named(snapshot)
            .map_err(|e| DaoError::IoError(format!("Failed to serialize snapshot: {}", e)))?;

        let temp_file = tempfile::NamedTempFile::new_in(&parent)
            .map_err(|e| DaoError::IoError(format!("Failed to create temp file: {}", e)))?;
        let mut writer = BufWriter::new(temp_file);
        writer
            .write_all(&serialized)
            .map_err(|e| DaoError::IoError(format!("Failed to write snapshot: {}", e)))?;
        let temp_file = writer
            .into_inner()
            .map_err(|e| DaoError::IoError(format!("Failed to flush snapshot: {}", e)))?;
        temp_file
            .as_file()
            .sync_all()
            .map_err(|e| DaoError::IoError(format!("Failed to sync snapshot: {}", e)))?;
        temp_file
            .persist(&self.snapshot_path)
            .map_err(|e| DaoError::IoError(format!("Failed to rename snapshot: {}", e)))?;
        Ok(())
    }

    pub fn load(&self) -> Result<Option<StoreSnapshot>> {
        if !self.snapshot_path.exists() {
            return Ok(None);
        }
        let mut file = File::open(&self.snapshot_path)
            .map_err(|e| DaoError::IoError(format!("Failed to open snapshot: {}", e)))?;
        let mut data = Vec::new();
        file.read_to_end(&mut data)
            .map_err(|e| DaoError::IoError(format!("Failed to read snapshot: {}", e)))?;
        let snapshot: StoreSnapshot = rmp_serde::from_slice(&data)
            .map_err(|e| DaoError::IoError(format!("Failed to deserialize snapshot: {}", e)))?;

        if snapshot.version != SNAPSHOT_FORMAT_VERSION {
            return Err(DaoError::IoError(format!(
                "Unsupported snapshot version {}",
                snapshot.version
            )));
        }
        Ok(Some(snapshot))
    }

    pub fn exists(&self) -> bool {
        self.snapshot_path.exists()
    }

    pub fn delete(&self) -> Result<()> {
        if self.snapshot_path.exists() {
            fs::remove_file(&self.snapshot_path)
                .map_err(|e| DaoError::IoError(format!("Failed to delete snapshot: {}", e)))?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::{AttributeType, Value};
    use crate::storage::EntityDescriptor;
    use tempfile::TempDir;

    #[test]
    fn test_snapshot_save_and_load() {
        let temp_dir = TempDir::new().unwrap();
        let manager = SnapshotManager::new(temp_dir.path().join("nested/store.snapshot"));
        assert!(manager.load().unwrap().is_none());

        let descriptor = EntityDescriptor::new("User")
            .attribute("name", AttributeType::Text)
            .attribute("balance", AttributeType::Decimal);
        let mut record = ObjectRecord::new(&descriptor);
        record.values.insert("name".into(), Value::from("Alice"));
        record
            .values
            .insert("balance".into(), Value::Decimal("12.50".parse().unwrap()));
        record.version = 3;

        let mut rows = im::OrdMap::new();
        rows.insert(ObjectId(7), record.clone());
        manager.save(&StoreSnapshot::new(rows, 8)).unwrap();
        assert!(manager.exists());

        let loaded = manager.load().unwrap().unwrap();
        assert_eq!(loaded.next_id, 8);
        assert_eq!(loaded.metadata.row_count, 1);
        assert_eq!(loaded.rows.get(&ObjectId(7)), Some(&record));
    }

    #[test]
    fn test_snapshot_overwrite_and_delete() {
        let temp_dir = TempDir::new().unwrap();
        let manager = SnapshotManager::new(temp_dir.path().join("store.snapshot"));
        manager.save(&StoreSnapshot::new(im::OrdMap::new(), 1)).unwrap();
        manager.save(&StoreSnapshot::new(im::OrdMap::new(), 5)).unwrap();
        assert_eq!(manager.load().unwrap().unwrap().next_id, 5);

        manager.delete().unwrap();
        assert!(!manager.exists());
    }
}
