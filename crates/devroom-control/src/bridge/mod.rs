//! Bridge sync reconciler.
//!
//! An external editor registers a bridge session for one room, then keeps its
//! local workspace and the server's file set in step with `sync-files` and
//! `pull-files`. Conflicts are settled by the same [`ConflictResolver`] the
//! collaboration broadcaster uses, fed with the editor's local modification
//! time. The bridge also relays allow-listed commands and git operations to
//! the registered workspace.
//!
//! Bridge events are delivered on the bridge topic and mirrored to the
//! room's collab topic so browser participants see editor activity.

pub mod command;
pub mod git;

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use devroom_core::{
    normalize_path, BridgeId, ConnectionId, ContentHash, FileId, ProjectId, RecordId, RoomId,
    UserId,
};
use devroom_store::{
    BridgeConnection, BridgeStatus, FileRecord, OperationKind, OperationRecord, PublicUser, Store,
    StoreError,
};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

use crate::access;
use crate::collab::{ConflictResolver, IncomingWrite, LastWriteWins, Resolution};
use crate::config::ControlConfig;
use crate::error::{ControlError, Result};
use crate::events::{ServerEvent, Topic};
use crate::presence::{Membership, Presence};
use crate::sandbox::{combine_streams, CommandOutput, CommandSandbox, CommandSpec};

pub use command::CommandPolicy;
pub use git::{GitOperation, GitParams};

// ============================================================================
// Payloads
// ============================================================================

/// `register` payload.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RegisterBridge {
    /// Room to synchronize with.
    pub room_id: RoomId,
    /// Editor kind.
    pub editor_type: String,
    /// Editor version.
    pub editor_version: String,
    /// Absolute path of the local workspace.
    pub workspace_path: String,
}

/// One file of a `sync-files` batch.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncFile {
    /// Project-relative path.
    pub path: String,
    /// Full local content.
    pub content: String,
    /// Local modification time, Unix epoch milliseconds.
    pub local_modified_at: i64,
}

/// `sync-files` payload.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncFiles {
    /// Room.
    pub room_id: RoomId,
    /// Project the files belong to.
    pub project_id: ProjectId,
    /// The batch.
    pub files: Vec<SyncFile>,
}

/// `pull-files` payload.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PullFiles {
    /// Room.
    pub room_id: RoomId,
    /// Project.
    pub project_id: ProjectId,
    /// Only files modified after this Unix epoch millisecond timestamp.
    #[serde(default)]
    pub since: Option<i64>,
}

/// `execute-command` payload.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecuteCommand {
    /// Room.
    pub room_id: RoomId,
    /// Project.
    pub project_id: ProjectId,
    /// Command line.
    pub command: String,
    /// Working directory relative to the workspace.
    #[serde(default)]
    pub cwd: Option<String>,
}

/// `git-operation` payload.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GitRequest {
    /// Room.
    pub room_id: RoomId,
    /// Project.
    pub project_id: ProjectId,
    /// `status`, `add`, `commit`, `push`, `pull` or `branch`.
    pub operation: String,
    /// Operation parameters.
    #[serde(default)]
    pub params: GitParams,
}

// ============================================================================
// Results
// ============================================================================

/// Reply to `register`.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Registration {
    /// The new bridge session.
    pub bridge_id: BridgeId,
    /// The bridge room membership.
    pub membership: Membership,
}

/// Per-file outcome of a sync.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SyncOutcome {
    /// The path was new on the server.
    Created,
    /// The server copy was older and was replaced.
    Updated,
    /// The server copy was at least as new; nothing changed.
    Skipped,
    /// The file could not be applied.
    Error,
}

/// Per-file result of a sync.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncResult {
    /// Path as sent by the editor.
    pub path: String,
    /// Outcome.
    pub status: SyncOutcome,
    /// Server file ID, when the file exists.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub file_id: Option<FileId>,
    /// Failure reason for `Error`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

/// A file returned by `pull-files`.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PulledFile {
    /// File ID.
    pub file_id: FileId,
    /// Normalized path.
    pub path: String,
    /// Full content.
    pub content: String,
    /// blake3 of the content.
    pub content_hash: ContentHash,
    /// Last accepted write, Unix epoch milliseconds.
    pub modified_at: i64,
}

/// Outcome of a relayed command or git operation.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CommandResult {
    /// What ran.
    pub command: String,
    /// Captured stdout.
    pub stdout: String,
    /// Captured stderr.
    pub stderr: String,
    /// Exit code, if the process exited.
    pub exit_code: Option<i32>,
    /// Whether the process was killed by the timeout.
    pub timed_out: bool,
    /// Exit code zero within the timeout.
    pub success: bool,
    /// Wall-clock duration.
    pub duration_ms: u64,
}

impl CommandResult {
    fn new(command: String, output: &CommandOutput) -> Self {
        Self {
            command,
            stdout: output.stdout.clone(),
            stderr: output.stderr.clone(),
            exit_code: output.exit_code,
            timed_out: output.timed_out,
            success: output.success(),
            duration_ms: output.duration_ms,
        }
    }
}

// ============================================================================
// Service
// ============================================================================

#[derive(Debug, Clone)]
struct BridgeSession {
    bridge_id: BridgeId,
    user_id: UserId,
    room_id: RoomId,
    workspace: PathBuf,
}

/// Reconciles external editor workspaces with the server's file set.
pub struct BridgeService<S: Store> {
    presence: Arc<Presence<S>>,
    resolver: Arc<dyn ConflictResolver>,
    sandbox: Arc<dyn CommandSandbox>,
    policy: CommandPolicy,
    command_timeout: Duration,
    sessions: RwLock<HashMap<ConnectionId, BridgeSession>>,
}

impl<S: Store> BridgeService<S> {
    /// Create the service with last-write-wins conflict handling.
    #[must_use]
    pub fn new(
        presence: Arc<Presence<S>>,
        sandbox: Arc<dyn CommandSandbox>,
        config: &ControlConfig,
    ) -> Self {
        Self::with_resolver(presence, sandbox, Arc::new(LastWriteWins), config)
    }

    /// Create the service with a custom conflict strategy.
    #[must_use]
    pub fn with_resolver(
        presence: Arc<Presence<S>>,
        sandbox: Arc<dyn CommandSandbox>,
        resolver: Arc<dyn ConflictResolver>,
        config: &ControlConfig,
    ) -> Self {
        Self {
            presence,
            resolver,
            sandbox,
            policy: CommandPolicy::new(&config.allowed_commands),
            command_timeout: config.command_timeout,
            sessions: RwLock::new(HashMap::new()),
        }
    }

    fn store(&self) -> &S {
        self.presence.store()
    }

    /// Number of registered bridge sessions.
    #[must_use]
    pub fn session_count(&self) -> usize {
        self.sessions.read().len()
    }

    fn session(&self, conn: ConnectionId, room_id: &RoomId) -> Result<BridgeSession> {
        let sessions = self.sessions.read();
        let session = sessions
            .get(&conn)
            .ok_or_else(|| ControlError::Forbidden("register the bridge first".to_string()))?;
        if session.room_id != *room_id {
            return Err(ControlError::Forbidden(format!(
                "bridge is registered for room {}",
                session.room_id
            )));
        }
        Ok(session.clone())
    }

    fn announce(&self, room_id: RoomId, event: ServerEvent, exclude: Option<ConnectionId>) {
        self.presence.registry().broadcast_all(
            &[Topic::bridge(room_id), Topic::collab(room_id)],
            event,
            exclude,
        );
    }

    // ========================================================================
    // Registration
    // ========================================================================

    /// Register an external editor on this connection and join the room's
    /// bridge topic.
    ///
    /// # Errors
    ///
    /// Returns `Unauthenticated`, `Validation` for a relative workspace path
    /// or a second registration on the same connection, and the errors of
    /// [`Presence::join`].
    pub fn register(&self, conn: ConnectionId, request: RegisterBridge) -> Result<Registration> {
        let user = self.presence.registry().identity(conn)?;

        let workspace = PathBuf::from(&request.workspace_path);
        if !workspace.is_absolute() {
            return Err(ControlError::Validation(
                "workspace path must be absolute".to_string(),
            ));
        }
        if self.sessions.read().contains_key(&conn) {
            return Err(ControlError::Validation(
                "connection already has a registered bridge".to_string(),
            ));
        }

        let membership = self.presence.join(conn, Topic::bridge(request.room_id))?;

        let now = Utc::now();
        let record = BridgeConnection {
            bridge_id: BridgeId::generate(),
            user_id: user.id,
            room_id: request.room_id,
            editor_type: request.editor_type,
            editor_version: request.editor_version,
            workspace_path: request.workspace_path,
            status: BridgeStatus::Connected,
            connected_at: now,
            last_sync_at: None,
        };
        self.store().put_bridge(&record)?;

        self.sessions.write().insert(
            conn,
            BridgeSession {
                bridge_id: record.bridge_id,
                user_id: user.id,
                room_id: record.room_id,
                workspace,
            },
        );

        tracing::info!(
            bridge_id = %record.bridge_id,
            room_id = %record.room_id,
            user_id = %user.id,
            editor = %record.editor_type,
            "Bridge registered"
        );

        self.announce(
            record.room_id,
            ServerEvent::EditorConnected {
                room_id: record.room_id,
                bridge_id: record.bridge_id,
                editor_type: record.editor_type,
                editor_version: record.editor_version,
                user,
                at: now,
            },
            Some(conn),
        );

        Ok(Registration {
            bridge_id: record.bridge_id,
            membership,
        })
    }

    /// Tear down the bridge session of a connection, if it has one.
    ///
    /// The record is kept as `disconnected` and the room is notified.
    pub fn disconnect(&self, conn: ConnectionId) -> Option<BridgeId> {
        let session = self.sessions.write().remove(&conn)?;

        if let Err(e) = self
            .store()
            .update_bridge_status(&session.bridge_id, BridgeStatus::Disconnected)
        {
            tracing::warn!(bridge_id = %session.bridge_id, error = %e, "Failed to mark bridge disconnected");
        }

        tracing::info!(bridge_id = %session.bridge_id, room_id = %session.room_id, "Bridge disconnected");

        self.announce(
            session.room_id,
            ServerEvent::EditorDisconnected {
                room_id: session.room_id,
                bridge_id: session.bridge_id,
                user: self.presence.public_user(&session.user_id),
                at: Utc::now(),
            },
            Some(conn),
        );
        Some(session.bridge_id)
    }

    // ========================================================================
    // File sync
    // ========================================================================

    /// Apply a batch of local files.
    ///
    /// Each file is reconciled on its own; a failing file is reported as
    /// `error` and does not affect the others.
    ///
    /// # Errors
    ///
    /// Returns `Forbidden` without a registered bridge or write access, and
    /// `NotFound` if the project is not in the room.
    pub fn sync_files(&self, conn: ConnectionId, batch: SyncFiles) -> Result<Vec<SyncResult>> {
        let session = self.session(conn, &batch.room_id)?;
        let (user, _) = self
            .presence
            .authorize(conn, &Topic::bridge(batch.room_id), true)?;
        access::project_in_room(self.store(), &batch.project_id, &batch.room_id)?;

        self.store()
            .update_bridge_status(&session.bridge_id, BridgeStatus::Syncing)
            .map_err(|e| ControlError::from_store(e, format_args!("bridge {}", session.bridge_id)))?;

        let results: Vec<SyncResult> = batch
            .files
            .into_iter()
            .map(|file| {
                let path = file.path.clone();
                match self.sync_one(&batch.project_id, file) {
                    Ok((status, file_id)) => SyncResult {
                        path,
                        status,
                        file_id: Some(file_id),
                        message: None,
                    },
                    Err(e) => {
                        tracing::debug!(path = %path, error = %e, "Sync of file failed");
                        SyncResult {
                            path,
                            status: SyncOutcome::Error,
                            file_id: None,
                            message: Some(e.to_string()),
                        }
                    }
                }
            })
            .collect();

        if let Err(e) = self
            .store()
            .update_bridge_status(&session.bridge_id, BridgeStatus::Connected)
        {
            tracing::warn!(bridge_id = %session.bridge_id, error = %e, "Failed to finish sync");
        }

        let count = |outcome: SyncOutcome| results.iter().filter(|r| r.status == outcome).count();
        let (created, updated, skipped, failed) = (
            count(SyncOutcome::Created),
            count(SyncOutcome::Updated),
            count(SyncOutcome::Skipped),
            count(SyncOutcome::Error),
        );

        tracing::info!(
            bridge_id = %session.bridge_id,
            project_id = %batch.project_id,
            created,
            updated,
            skipped,
            failed,
            "Files synced"
        );

        self.announce(
            batch.room_id,
            ServerEvent::FilesSynced {
                room_id: batch.room_id,
                project_id: batch.project_id,
                created,
                updated,
                skipped,
                failed,
                user,
                at: Utc::now(),
            },
            Some(conn),
        );

        Ok(results)
    }

    fn sync_one(&self, project_id: &ProjectId, file: SyncFile) -> Result<(SyncOutcome, FileId)> {
        let path = normalize_path(&file.path)?;
        let modified_at = DateTime::from_timestamp_millis(file.local_modified_at).ok_or_else(|| {
            ControlError::Validation(format!("invalid timestamp {}", file.local_modified_at))
        })?;

        if let Some(current) = self.store().get_file_by_path(project_id, &path)? {
            return self.overwrite(current, &file.content, modified_at);
        }

        let record = FileRecord {
            file_id: FileId::generate(),
            project_id: *project_id,
            path,
            content: file.content,
            created_at: Utc::now(),
            updated_at: modified_at,
        };
        match self.store().create_file(&record) {
            Ok(()) => Ok((SyncOutcome::Created, record.file_id)),
            // Someone created the path since the lookup; reconcile against theirs.
            Err(StoreError::AlreadyExists(_)) => {
                let current = self
                    .store()
                    .get_file_by_path(project_id, &record.path)?
                    .ok_or_else(|| ControlError::NotFound(format!("file {}", record.path)))?;
                self.overwrite(current, &record.content, modified_at)
            }
            Err(e) => Err(e.into()),
        }
    }

    fn overwrite(
        &self,
        mut current: FileRecord,
        content: &str,
        modified_at: DateTime<Utc>,
    ) -> Result<(SyncOutcome, FileId)> {
        let incoming = IncomingWrite {
            content,
            modified_at: Some(modified_at),
        };
        match self.resolver.merge(&current, &incoming) {
            Resolution::Skip => Ok((SyncOutcome::Skipped, current.file_id)),
            Resolution::Accept(content) => {
                current.content = content;
                current.updated_at = modified_at;
                self.store()
                    .put_file(&current)
                    .map_err(|e| ControlError::from_store(e, format_args!("file {}", current.path)))?;
                Ok((SyncOutcome::Updated, current.file_id))
            }
        }
    }

    /// Files of a project modified after `since`, or all of them.
    ///
    /// # Errors
    ///
    /// Returns `Forbidden` if the connection hasn't joined the bridge topic,
    /// `NotFound` if the project is not in the room.
    pub fn pull_files(&self, conn: ConnectionId, request: &PullFiles) -> Result<Vec<PulledFile>> {
        self.presence
            .authorize(conn, &Topic::bridge(request.room_id), false)?;
        access::project_in_room(self.store(), &request.project_id, &request.room_id)?;

        let files = self
            .store()
            .list_files(&request.project_id)?
            .into_iter()
            .filter(|f| request.since.map_or(true, |since| f.updated_at.timestamp_millis() > since))
            .map(|f| PulledFile {
                content_hash: ContentHash::of(&f.content),
                modified_at: f.updated_at.timestamp_millis(),
                file_id: f.file_id,
                path: f.path,
                content: f.content,
            })
            .collect();
        Ok(files)
    }

    // ========================================================================
    // Command relay
    // ========================================================================

    /// Run an allow-listed command in the bridge workspace.
    ///
    /// A command that runs and fails is a successful call with
    /// `success: false`.
    ///
    /// # Errors
    ///
    /// Returns `Validation` for commands outside the allow-list or a `cwd`
    /// outside the workspace; nothing is spawned in that case. Returns
    /// `Forbidden` without a registered bridge or write access.
    pub async fn execute_command(
        &self,
        conn: ConnectionId,
        request: ExecuteCommand,
    ) -> Result<CommandResult> {
        let session = self.session(conn, &request.room_id)?;
        let (user, _) = self
            .presence
            .authorize(conn, &Topic::bridge(request.room_id), true)?;
        access::project_in_room(self.store(), &request.project_id, &request.room_id)?;

        let argv = self.policy.check(&request.command)?;
        let cwd = resolve_cwd(&session.workspace, request.cwd.as_deref())?;
        let spec = CommandSpec::from_argv(argv, cwd, self.command_timeout)?;

        let result = self.run(&spec).await;
        self.record(
            &session,
            request.project_id,
            OperationKind::Command,
            &result,
            user,
            conn,
        );
        Ok(result)
    }

    /// Run a git operation in the bridge workspace.
    ///
    /// # Errors
    ///
    /// Returns `Validation` for unknown operations or bad parameters,
    /// `Forbidden` without a registered bridge or write access.
    pub async fn git_operation(&self, conn: ConnectionId, request: GitRequest) -> Result<CommandResult> {
        let session = self.session(conn, &request.room_id)?;
        let (user, _) = self
            .presence
            .authorize(conn, &Topic::bridge(request.room_id), true)?;
        access::project_in_room(self.store(), &request.project_id, &request.room_id)?;

        let op = GitOperation::parse(&request.operation, request.params)?;
        let spec = CommandSpec::from_argv(op.argv(), session.workspace.clone(), self.command_timeout)?;

        let result = self.run(&spec).await;
        self.record(
            &session,
            request.project_id,
            OperationKind::Git,
            &result,
            user,
            conn,
        );
        Ok(result)
    }

    async fn run(&self, spec: &CommandSpec) -> CommandResult {
        let output = match self.sandbox.run(spec).await {
            Ok(output) => output,
            Err(e) => {
                tracing::warn!(command = %spec.display(), error = %e, "Command could not run");
                CommandOutput {
                    stderr: e.to_string(),
                    ..CommandOutput::default()
                }
            }
        };
        CommandResult::new(spec.display(), &output)
    }

    fn record(
        &self,
        session: &BridgeSession,
        project_id: ProjectId,
        kind: OperationKind,
        result: &CommandResult,
        user: PublicUser,
        conn: ConnectionId,
    ) {
        let output = combine_streams(&result.stdout, &result.stderr);

        let record = OperationRecord {
            record_id: RecordId::generate(),
            user_id: session.user_id,
            project_id,
            kind,
            operation: result.command.clone(),
            output: output.clone(),
            success: result.success,
            created_at: Utc::now(),
        };
        if let Err(e) = self.store().append_operation(&record) {
            tracing::error!(record_id = %record.record_id, error = %e, "Failed to append operation record");
        }

        tracing::info!(
            bridge_id = %session.bridge_id,
            command = %result.command,
            success = result.success,
            duration_ms = result.duration_ms,
            "Operation finished"
        );

        // The caller gets the result as the reply.
        self.announce(
            session.room_id,
            ServerEvent::TeamActivity {
                room_id: session.room_id,
                project_id,
                kind,
                operation: record.operation,
                output,
                success: record.success,
                user,
                at: record.created_at,
            },
            Some(conn),
        );
    }
}

/// Resolve a client-supplied working directory inside `workspace`.
fn resolve_cwd(workspace: &Path, cwd: Option<&str>) -> Result<PathBuf> {
    let Some(cwd) = cwd.map(str::trim).filter(|c| !c.is_empty() && *c != ".") else {
        return Ok(workspace.to_path_buf());
    };

    let relative = if Path::new(cwd).is_absolute() {
        let inside = Path::new(cwd).strip_prefix(workspace).map_err(|_| {
            ControlError::Validation(format!("cwd {cwd} is outside the workspace"))
        })?;
        if inside.as_os_str().is_empty() {
            return Ok(workspace.to_path_buf());
        }
        inside.to_string_lossy().into_owned()
    } else {
        cwd.to_string()
    };

    let relative = normalize_path(&relative)
        .map_err(|_| ControlError::Validation(format!("cwd {cwd} is outside the workspace")))?;
    Ok(workspace.join(relative))
}
