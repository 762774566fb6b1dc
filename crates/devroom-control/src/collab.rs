//! Collaboration broadcaster.
//!
//! Mediates content changes, cursor moves and file lifecycle events between
//! the connections of a room. Content is always a whole snapshot; the stored
//! state is whatever the last accepted write put there.
//!
//! Writes to one file are serialized from the conflict check through the
//! broadcast, so receivers see edits in the order they were stored.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use devroom_core::{normalize_path, ConnectionId, FileId, ProjectId, RoomId};
use devroom_store::{Cursor, FileRecord, Selection, Store};
use parking_lot::Mutex;
use serde::Deserialize;

use crate::access;
use crate::error::{ControlError, Result};
use crate::events::{FileView, ServerEvent, Topic};
use crate::presence::Presence;

/// Number of write-lock stripes shared by all files.
const WRITE_STRIPES: usize = 64;

/// A write competing with the stored snapshot.
#[derive(Debug, Clone, Copy)]
pub struct IncomingWrite<'a> {
    /// Proposed full content.
    pub content: &'a str,
    /// When the writer last modified the content. `None` for live edits,
    /// which are always the newest write.
    pub modified_at: Option<DateTime<Utc>>,
}

/// Outcome of a conflict check.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Resolution {
    /// Store this content.
    Accept(String),
    /// Keep the stored snapshot.
    Skip,
}

/// Strategy deciding what happens when a write meets an existing snapshot.
pub trait ConflictResolver: Send + Sync {
    /// Decide between the stored snapshot and an incoming write.
    fn merge(&self, current: &FileRecord, incoming: &IncomingWrite<'_>) -> Resolution;
}

/// The incoming write replaces the snapshot unless it is not strictly newer.
#[derive(Debug, Default, Clone, Copy)]
pub struct LastWriteWins;

impl ConflictResolver for LastWriteWins {
    fn merge(&self, current: &FileRecord, incoming: &IncomingWrite<'_>) -> Resolution {
        match incoming.modified_at {
            Some(at) if at <= current.updated_at => Resolution::Skip,
            _ => Resolution::Accept(incoming.content.to_string()),
        }
    }
}

/// `code-change` payload.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CodeChange {
    /// Room.
    pub room_id: RoomId,
    /// File being edited.
    pub file_id: FileId,
    /// New full content.
    pub content: String,
    /// Advisory edit metadata relayed to receivers.
    #[serde(default)]
    pub change_ops: serde_json::Value,
}

/// `cursor-update` payload.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CursorMove {
    /// Room.
    pub room_id: RoomId,
    /// File the cursor is in.
    pub file_id: FileId,
    /// Absolute offset.
    pub position: u64,
    /// Zero-based line.
    pub line: u32,
    /// Zero-based column.
    pub column: u32,
    /// Optional selection.
    #[serde(default)]
    pub selection: Option<Selection>,
}

/// `file-created` payload.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NewFile {
    /// Room.
    pub room_id: RoomId,
    /// Project the file goes into.
    pub project_id: ProjectId,
    /// Project-relative path.
    pub path: String,
    /// Initial content.
    #[serde(default)]
    pub content: String,
}

/// Mediates live edits between the connections of a room.
pub struct CollabService<S: Store> {
    presence: Arc<Presence<S>>,
    resolver: Arc<dyn ConflictResolver>,
    write_locks: Box<[Mutex<()>]>,
}

impl<S: Store> CollabService<S> {
    /// Create the service with last-write-wins conflict handling.
    #[must_use]
    pub fn new(presence: Arc<Presence<S>>) -> Self {
        Self::with_resolver(presence, Arc::new(LastWriteWins))
    }

    /// Create the service with a custom conflict strategy.
    #[must_use]
    pub fn with_resolver(presence: Arc<Presence<S>>, resolver: Arc<dyn ConflictResolver>) -> Self {
        Self {
            presence,
            resolver,
            write_locks: (0..WRITE_STRIPES).map(|_| Mutex::new(())).collect(),
        }
    }

    fn store(&self) -> &S {
        self.presence.store()
    }

    /// The lock serializing content writes to `file_id`.
    fn write_lock(&self, file_id: &FileId) -> &Mutex<()> {
        let hash = file_id
            .as_bytes()
            .iter()
            .fold(0usize, |acc, b| acc.wrapping_mul(31).wrapping_add(usize::from(*b)));
        &self.write_locks[hash % self.write_locks.len()]
    }

    /// Load a file and check that it belongs to a project of `room_id`.
    fn file_in_room(&self, file_id: &FileId, room_id: &RoomId) -> Result<FileRecord> {
        let file = self
            .store()
            .get_file(file_id)?
            .ok_or_else(|| ControlError::NotFound(format!("file {file_id}")))?;
        access::project_in_room(self.store(), &file.project_id, room_id)
            .map_err(|_| ControlError::NotFound(format!("file {file_id}")))?;
        Ok(file)
    }

    /// Replace a file's content and relay it to the rest of the room.
    ///
    /// # Errors
    ///
    /// Returns `Forbidden` without write access, `NotFound` if the file is
    /// not in the room.
    pub fn code_change(&self, conn: ConnectionId, change: CodeChange) -> Result<FileRecord> {
        let topic = Topic::collab(change.room_id);
        let (user, _) = self.presence.authorize(conn, &topic, true)?;

        let _guard = self.write_lock(&change.file_id).lock();
        let mut file = self.file_in_room(&change.file_id, &change.room_id)?;

        let incoming = IncomingWrite {
            content: &change.content,
            modified_at: None,
        };
        let Resolution::Accept(content) = self.resolver.merge(&file, &incoming) else {
            tracing::debug!(file_id = %file.file_id, "Code change skipped by resolver");
            return Ok(file);
        };

        file.content = content;
        file.updated_at = Utc::now();
        self.store()
            .put_file(&file)
            .map_err(|e| ControlError::from_store(e, format_args!("file {}", file.file_id)))?;

        self.presence.registry().broadcast(
            &topic,
            ServerEvent::CodeChange {
                room_id: change.room_id,
                file_id: file.file_id,
                content: file.content.clone(),
                change_ops: change.change_ops,
                user,
                at: file.updated_at,
            },
            Some(conn),
        );

        Ok(file)
    }

    /// Record a cursor position and relay it to the room.
    ///
    /// Persistence is best effort; the broadcast always happens.
    ///
    /// # Errors
    ///
    /// Returns `Forbidden` if the connection hasn't joined, `NotFound` if the
    /// file is not in the room.
    pub fn cursor_update(&self, conn: ConnectionId, update: CursorMove) -> Result<()> {
        let topic = Topic::collab(update.room_id);
        let (user, _) = self.presence.authorize(conn, &topic, false)?;
        self.file_in_room(&update.file_id, &update.room_id)?;

        let now = Utc::now();
        let cursor = Cursor {
            file_id: update.file_id,
            user_id: user.id,
            position: update.position,
            line: update.line,
            column: update.column,
            selection: update.selection,
            updated_at: now,
        };
        if let Err(e) = self.store().put_cursor(&cursor) {
            tracing::warn!(
                file_id = %update.file_id,
                user_id = %user.id,
                error = %e,
                "Failed to persist cursor"
            );
        }

        self.presence.registry().broadcast(
            &topic,
            ServerEvent::CursorUpdate {
                room_id: update.room_id,
                file_id: update.file_id,
                position: update.position,
                line: update.line,
                column: update.column,
                selection: update.selection,
                user,
                at: now,
            },
            Some(conn),
        );
        Ok(())
    }

    /// Create a file and announce it to the whole room, originator included.
    ///
    /// # Errors
    ///
    /// Returns `Validation` for bad or duplicate paths, `NotFound` if the
    /// project is not in the room, `Forbidden` without write access.
    pub fn file_created(&self, conn: ConnectionId, new_file: NewFile) -> Result<FileRecord> {
        let topic = Topic::collab(new_file.room_id);
        let (user, _) = self.presence.authorize(conn, &topic, true)?;
        access::project_in_room(self.store(), &new_file.project_id, &new_file.room_id)?;

        let path = normalize_path(&new_file.path)?;
        let now = Utc::now();
        let file = FileRecord {
            file_id: FileId::generate(),
            project_id: new_file.project_id,
            path,
            content: new_file.content,
            created_at: now,
            updated_at: now,
        };
        self.store()
            .create_file(&file)
            .map_err(|e| ControlError::from_store(e, format_args!("file {}", file.path)))?;

        tracing::info!(
            room_id = %new_file.room_id,
            file_id = %file.file_id,
            path = %file.path,
            "File created"
        );

        self.presence.registry().broadcast(
            &topic,
            ServerEvent::FileCreated {
                room_id: new_file.room_id,
                file: FileView::from(&file),
                user,
                at: now,
            },
            None,
        );
        Ok(file)
    }

    /// Delete a file and announce it to the whole room, originator included.
    ///
    /// # Errors
    ///
    /// Returns `NotFound` if the file is not in the room, `Forbidden` without
    /// write access.
    pub fn file_deleted(&self, conn: ConnectionId, room_id: RoomId, file_id: FileId) -> Result<()> {
        let topic = Topic::collab(room_id);
        let (user, _) = self.presence.authorize(conn, &topic, true)?;

        let _guard = self.write_lock(&file_id).lock();
        self.file_in_room(&file_id, &room_id)?;

        let removed = self
            .store()
            .delete_file(&file_id)
            .map_err(|e| ControlError::from_store(e, format_args!("file {file_id}")))?;

        tracing::info!(room_id = %room_id, file_id = %file_id, path = %removed.path, "File deleted");

        self.presence.registry().broadcast(
            &topic,
            ServerEvent::FileDeleted {
                room_id,
                file_id,
                path: removed.path,
                user,
                at: Utc::now(),
            },
            None,
        );
        Ok(())
    }

    /// Live cursors of a file.
    ///
    /// # Errors
    ///
    /// Returns `Forbidden` if the connection hasn't joined, `NotFound` if the
    /// file is not in the room.
    pub fn cursors(&self, conn: ConnectionId, room_id: RoomId, file_id: FileId) -> Result<Vec<Cursor>> {
        self.presence
            .authorize(conn, &Topic::collab(room_id), false)?;
        self.file_in_room(&file_id, &room_id)?;
        Ok(self.store().list_cursors(&file_id)?)
    }
}
