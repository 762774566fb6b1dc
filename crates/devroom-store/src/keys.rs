//! Key encoding utilities for `RocksDB`.
//!
//! Every ID is a 16-byte UUID, so composite keys are plain concatenations and
//! a parent ID is always a valid prefix for scanning its children.

use devroom_core::{DeploymentId, FileId, ProjectId, RecordId, UserId};

/// Length of every encoded identifier.
pub const ID_LEN: usize = 16;

/// Encode a single-ID key.
#[must_use]
pub fn id_key(id: &impl AsRef<[u8]>) -> Vec<u8> {
    id.as_ref().to_vec()
}

/// Encode a composite `parent || child` key.
#[must_use]
pub fn pair_key(parent: &impl AsRef<[u8]>, child: &impl AsRef<[u8]>) -> Vec<u8> {
    let parent = parent.as_ref();
    let child = child.as_ref();
    let mut key = Vec::with_capacity(parent.len() + child.len());
    key.extend_from_slice(parent);
    key.extend_from_slice(child);
    key
}

/// Encode the `project_id || path` unique index key.
#[must_use]
pub fn project_path_key(project_id: &ProjectId, path: &str) -> Vec<u8> {
    pair_key(project_id, &path.as_bytes())
}

/// Extract the second 16-byte ID from a `parent || child` key.
///
/// Returns `None` if the key is shorter than two IDs.
#[must_use]
pub fn child_bytes(key: &[u8]) -> Option<[u8; ID_LEN]> {
    key.get(ID_LEN..ID_LEN * 2)?.try_into().ok()
}

/// Extract the user ID from a `room_id || user_id` or `file_id || user_id` key.
#[must_use]
pub fn extract_user_id(key: &[u8]) -> Option<UserId> {
    child_bytes(key).map(UserId::from_bytes)
}

/// Extract the deployment ID from a `project_id || deployment_id` key.
#[must_use]
pub fn extract_deployment_id(key: &[u8]) -> Option<DeploymentId> {
    child_bytes(key).map(DeploymentId::from_bytes)
}

/// Decode a file ID stored as an index value.
#[must_use]
pub fn decode_file_id(value: &[u8]) -> Option<FileId> {
    let bytes: [u8; ID_LEN] = value.try_into().ok()?;
    Some(FileId::from_bytes(bytes))
}

/// Encode an audit record key, `project_id || record_id`.
#[must_use]
pub fn operation_key(project_id: &ProjectId, record_id: &RecordId) -> Vec<u8> {
    pair_key(project_id, record_id)
}
