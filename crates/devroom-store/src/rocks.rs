//! `RocksDB` storage implementation.
//!
//! This module provides the `RocksStore` implementation of the `Store` trait.

use std::path::Path;
use std::sync::Arc;

use devroom_core::{BridgeId, DeploymentId, FileId, ProjectId, RoomId, UserId};
use parking_lot::Mutex;
use rocksdb::{
    BoundColumnFamily, ColumnFamilyDescriptor, DBWithThreadMode, Direction, IteratorMode,
    MultiThreaded, Options, WriteBatch,
};

use crate::error::{Result, StoreError};
use crate::keys;
use crate::schema::{all_column_families, cf};
use crate::types::{
    BridgeConnection, BridgeStatus, Cursor, Deployment, FileRecord, OperationRecord, Project,
    Room, RoomMember, User,
};
use crate::Store;

/// RocksDB-backed storage implementation.
pub struct RocksStore {
    db: Arc<DBWithThreadMode<MultiThreaded>>,
    /// Serializes read-check-write sequences on unique indexes.
    index_lock: Mutex<()>,
}

impl RocksStore {
    /// Open or create a `RocksDB` database at the given path.
    ///
    /// # Errors
    ///
    /// Returns an error if the database cannot be opened or created.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let mut opts = Options::default();
        opts.create_if_missing(true);
        opts.create_missing_column_families(true);

        let cf_descriptors: Vec<_> = all_column_families()
            .into_iter()
            .map(|name| ColumnFamilyDescriptor::new(name, Options::default()))
            .collect();

        let db = DBWithThreadMode::open_cf_descriptors(&opts, path, cf_descriptors)
            .map_err(|e| StoreError::Database(e.to_string()))?;

        Ok(Self {
            db: Arc::new(db),
            index_lock: Mutex::new(()),
        })
    }

    /// Get a column family handle.
    fn cf(&self, name: &str) -> Result<Arc<BoundColumnFamily<'_>>> {
        self.db
            .cf_handle(name)
            .ok_or_else(|| StoreError::Database(format!("column family not found: {name}")))
    }

    /// Serialize a value using CBOR.
    fn serialize<T: serde::Serialize>(value: &T) -> Result<Vec<u8>> {
        let mut buf = Vec::new();
        ciborium::into_writer(value, &mut buf)
            .map_err(|e| StoreError::Serialization(e.to_string()))?;
        Ok(buf)
    }

    /// Deserialize a value from CBOR.
    fn deserialize<T: serde::de::DeserializeOwned>(data: &[u8]) -> Result<T> {
        ciborium::from_reader(data).map_err(|e| StoreError::Serialization(e.to_string()))
    }

    /// Read and decode a single record.
    fn get_value<T: serde::de::DeserializeOwned>(&self, cf_name: &str, key: &[u8]) -> Result<Option<T>> {
        let cf = self.cf(cf_name)?;
        self.db
            .get_cf(&cf, key)
            .map_err(|e| StoreError::Database(e.to_string()))?
            .map(|data| Self::deserialize(&data))
            .transpose()
    }

    /// Encode and write a single record.
    fn put_value<T: serde::Serialize>(&self, cf_name: &str, key: &[u8], value: &T) -> Result<()> {
        let cf = self.cf(cf_name)?;
        let value = Self::serialize(value)?;
        self.db
            .put_cf(&cf, key, value)
            .map_err(|e| StoreError::Database(e.to_string()))
    }

    /// Collect every `(key, value)` pair whose key starts with `prefix`.
    fn scan_prefix(&self, cf_name: &str, prefix: &[u8]) -> Result<Vec<(Box<[u8]>, Box<[u8]>)>> {
        let cf = self.cf(cf_name)?;
        let iter = self
            .db
            .iterator_cf(&cf, IteratorMode::From(prefix, Direction::Forward));

        let mut entries = Vec::new();
        for item in iter {
            let (key, value) = item.map_err(|e| StoreError::Database(e.to_string()))?;

            // Stop if we're past the prefix
            if !key.starts_with(prefix) {
                break;
            }
            entries.push((key, value));
        }
        Ok(entries)
    }

    fn write(&self, batch: WriteBatch) -> Result<()> {
        self.db
            .write(batch)
            .map_err(|e| StoreError::Database(e.to_string()))
    }
}

impl Store for RocksStore {
    // =========================================================================
    // Users, rooms and projects
    // =========================================================================

    fn put_user(&self, user: &User) -> Result<()> {
        self.put_value(cf::USERS, &keys::id_key(&user.user_id), user)
    }

    fn get_user(&self, user_id: &UserId) -> Result<Option<User>> {
        self.get_value(cf::USERS, &keys::id_key(user_id))
    }

    fn put_room(&self, room: &Room) -> Result<()> {
        self.put_value(cf::ROOMS, &keys::id_key(&room.room_id), room)
    }

    fn get_room(&self, room_id: &RoomId) -> Result<Option<Room>> {
        self.get_value(cf::ROOMS, &keys::id_key(room_id))
    }

    fn put_room_member(&self, member: &RoomMember) -> Result<()> {
        let key = keys::pair_key(&member.room_id, &member.user_id);
        self.put_value(cf::ROOM_MEMBERS, &key, member)
    }

    fn get_room_member(&self, room_id: &RoomId, user_id: &UserId) -> Result<Option<RoomMember>> {
        self.get_value(cf::ROOM_MEMBERS, &keys::pair_key(room_id, user_id))
    }

    fn list_room_members(&self, room_id: &RoomId) -> Result<Vec<RoomMember>> {
        self.scan_prefix(cf::ROOM_MEMBERS, &keys::id_key(room_id))?
            .iter()
            .map(|(_, value)| Self::deserialize(value))
            .collect()
    }

    fn put_project(&self, project: &Project) -> Result<()> {
        self.put_value(cf::PROJECTS, &keys::id_key(&project.project_id), project)
    }

    fn get_project(&self, project_id: &ProjectId) -> Result<Option<Project>> {
        self.get_value(cf::PROJECTS, &keys::id_key(project_id))
    }

    // =========================================================================
    // Files and cursors
    // =========================================================================

    fn create_file(&self, file: &FileRecord) -> Result<()> {
        let cf_files = self.cf(cf::FILES)?;
        let cf_by_path = self.cf(cf::FILES_BY_PATH)?;

        let path_key = keys::project_path_key(&file.project_id, &file.path);
        let value = Self::serialize(file)?;

        let _guard = self.index_lock.lock();

        let taken = self
            .db
            .get_cf(&cf_by_path, &path_key)
            .map_err(|e| StoreError::Database(e.to_string()))?
            .is_some();
        if taken {
            return Err(StoreError::AlreadyExists(file.path.clone()));
        }

        let mut batch = WriteBatch::default();
        batch.put_cf(&cf_files, keys::id_key(&file.file_id), &value);
        batch.put_cf(&cf_by_path, &path_key, file.file_id.as_bytes());
        self.write(batch)
    }

    fn put_file(&self, file: &FileRecord) -> Result<()> {
        let _guard = self.index_lock.lock();

        // The path index is keyed by the stored path, so a file may not be
        // re-pointed through a plain snapshot write.
        let existing: FileRecord = self
            .get_value(cf::FILES, &keys::id_key(&file.file_id))?
            .ok_or(StoreError::NotFound)?;
        if existing.path != file.path || existing.project_id != file.project_id {
            return Err(StoreError::Database(format!(
                "file {} cannot change path through a snapshot write",
                file.file_id
            )));
        }

        self.put_value(cf::FILES, &keys::id_key(&file.file_id), file)
    }

    fn get_file(&self, file_id: &FileId) -> Result<Option<FileRecord>> {
        self.get_value(cf::FILES, &keys::id_key(file_id))
    }

    fn get_file_by_path(&self, project_id: &ProjectId, path: &str) -> Result<Option<FileRecord>> {
        let cf_by_path = self.cf(cf::FILES_BY_PATH)?;
        let path_key = keys::project_path_key(project_id, path);

        let Some(raw_id) = self
            .db
            .get_cf(&cf_by_path, &path_key)
            .map_err(|e| StoreError::Database(e.to_string()))?
        else {
            return Ok(None);
        };

        let file_id = keys::decode_file_id(&raw_id)
            .ok_or_else(|| StoreError::Serialization("malformed file index entry".to_string()))?;
        self.get_file(&file_id)
    }

    fn delete_file(&self, file_id: &FileId) -> Result<FileRecord> {
        let cf_files = self.cf(cf::FILES)?;
        let cf_by_path = self.cf(cf::FILES_BY_PATH)?;
        let cf_cursors = self.cf(cf::CURSORS)?;

        let _guard = self.index_lock.lock();

        let file = self.get_file(file_id)?.ok_or(StoreError::NotFound)?;

        let mut batch = WriteBatch::default();
        batch.delete_cf(&cf_files, keys::id_key(file_id));
        batch.delete_cf(&cf_by_path, keys::project_path_key(&file.project_id, &file.path));
        for (key, _) in self.scan_prefix(cf::CURSORS, &keys::id_key(file_id))? {
            batch.delete_cf(&cf_cursors, key);
        }
        self.write(batch)?;

        Ok(file)
    }

    fn list_files(&self, project_id: &ProjectId) -> Result<Vec<FileRecord>> {
        // The path index is ordered by `project || path`, so files come back sorted.
        let mut files = Vec::new();
        for (_, raw_id) in self.scan_prefix(cf::FILES_BY_PATH, &keys::id_key(project_id))? {
            let Some(file_id) = keys::decode_file_id(&raw_id) else {
                tracing::warn!(project_id = %project_id, "Skipping malformed file index entry");
                continue;
            };
            if let Some(file) = self.get_file(&file_id)? {
                files.push(file);
            }
        }
        Ok(files)
    }

    fn put_cursor(&self, cursor: &Cursor) -> Result<()> {
        let key = keys::pair_key(&cursor.file_id, &cursor.user_id);
        self.put_value(cf::CURSORS, &key, cursor)
    }

    fn list_cursors(&self, file_id: &FileId) -> Result<Vec<Cursor>> {
        self.scan_prefix(cf::CURSORS, &keys::id_key(file_id))?
            .iter()
            .map(|(_, value)| Self::deserialize(value))
            .collect()
    }

    // =========================================================================
    // Bridge sessions
    // =========================================================================

    fn put_bridge(&self, bridge: &BridgeConnection) -> Result<()> {
        self.put_value(cf::BRIDGES, &keys::id_key(&bridge.bridge_id), bridge)
    }

    fn get_bridge(&self, bridge_id: &BridgeId) -> Result<Option<BridgeConnection>> {
        self.get_value(cf::BRIDGES, &keys::id_key(bridge_id))
    }

    fn update_bridge_status(&self, bridge_id: &BridgeId, status: BridgeStatus) -> Result<()> {
        let mut bridge = self.get_bridge(bridge_id)?.ok_or(StoreError::NotFound)?;
        if bridge.status == BridgeStatus::Syncing && status == BridgeStatus::Connected {
            bridge.last_sync_at = Some(chrono::Utc::now());
        }
        bridge.status = status;
        self.put_bridge(&bridge)
    }

    // =========================================================================
    // Deployments and audit
    // =========================================================================

    fn put_deployment(&self, deployment: &Deployment) -> Result<()> {
        let cf_deployments = self.cf(cf::DEPLOYMENTS)?;
        let cf_by_project = self.cf(cf::DEPLOYMENTS_BY_PROJECT)?;

        let value = Self::serialize(deployment)?;

        let mut batch = WriteBatch::default();
        batch.put_cf(&cf_deployments, keys::id_key(&deployment.deployment_id), &value);
        // Index entry is idempotent
        batch.put_cf(
            &cf_by_project,
            keys::pair_key(&deployment.project_id, &deployment.deployment_id),
            b"",
        );
        self.write(batch)
    }

    fn get_deployment(&self, deployment_id: &DeploymentId) -> Result<Option<Deployment>> {
        self.get_value(cf::DEPLOYMENTS, &keys::id_key(deployment_id))
    }

    fn list_deployments_by_project(
        &self,
        project_id: &ProjectId,
        limit: usize,
    ) -> Result<Vec<Deployment>> {
        let mut deployments = Vec::new();
        for (key, _) in self.scan_prefix(cf::DEPLOYMENTS_BY_PROJECT, &keys::id_key(project_id))? {
            let Some(deployment_id) = keys::extract_deployment_id(&key) else {
                continue;
            };
            if let Some(deployment) = self.get_deployment(&deployment_id)? {
                deployments.push(deployment);
            }
        }

        deployments.sort_by(|a, b| b.started_at.cmp(&a.started_at));
        deployments.truncate(limit);
        Ok(deployments)
    }

    fn append_operation(&self, record: &OperationRecord) -> Result<()> {
        let key = keys::operation_key(&record.project_id, &record.record_id);

        let _guard = self.index_lock.lock();
        if self.get_value::<OperationRecord>(cf::OPERATIONS, &key)?.is_some() {
            return Err(StoreError::AlreadyExists(record.record_id.to_string()));
        }
        self.put_value(cf::OPERATIONS, &key, record)
    }

    fn list_operations(&self, project_id: &ProjectId) -> Result<Vec<OperationRecord>> {
        let mut records: Vec<OperationRecord> = self
            .scan_prefix(cf::OPERATIONS, &keys::id_key(project_id))?
            .iter()
            .map(|(_, value)| Self::deserialize(value))
            .collect::<Result<_>>()?;
        records.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        Ok(records)
    }
}
