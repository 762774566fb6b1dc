//! Socket message formats.
//!
//! Inbound frames are JSON objects tagged by `type`:
//!
//! ```text
//! {"type": "code-change", "requestId": "7", "token": "...", "roomId": "...", ...}
//! ```
//!
//! Every inbound frame is answered with exactly one `ack` or `error` carrying
//! the same `requestId`. Room events are pushed as they happen, tagged with
//! their own `type`.

use chrono::{DateTime, Utc};
use devroom_control::{
    CodeChange, ControlError, CursorMove, ExecuteCommand, GitRequest, Namespace, NewFile,
    PullFiles, RegisterBridge, StartDeployment, SyncFiles,
};
use devroom_core::{DeploymentId, FileId, ProjectId, RoomId, UserId};
use devroom_store::{Cursor, Selection};
use serde::{Deserialize, Serialize};

/// An inbound frame.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClientMessage {
    /// Bearer credential. Required on privileged operations.
    #[serde(default)]
    pub token: Option<String>,
    /// Echoed back on the reply.
    #[serde(default)]
    pub request_id: Option<String>,
    /// The operation.
    #[serde(flatten)]
    pub op: ClientOp,
}

/// Operations a client can send.
#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case", rename_all_fields = "camelCase")]
pub enum ClientOp {
    /// Bind the message token to the connection.
    Authenticate,
    /// Liveness check.
    Ping,
    /// Join a room through this socket's namespace.
    JoinRoom {
        /// Room.
        room_id: RoomId,
    },
    /// Leave a room.
    LeaveRoom {
        /// Room.
        room_id: RoomId,
    },
    /// Replace a file's content.
    CodeChange(CodeChange),
    /// Move the caller's cursor.
    CursorUpdate(CursorMove),
    /// Create a file.
    FileCreated(NewFile),
    /// Delete a file.
    FileDeleted {
        /// Room.
        room_id: RoomId,
        /// File.
        file_id: FileId,
    },
    /// Live cursors of a file.
    GetCursors {
        /// Room.
        room_id: RoomId,
        /// File.
        file_id: FileId,
    },
    /// Register an external editor.
    Register(RegisterBridge),
    /// Push local files.
    SyncFiles(SyncFiles),
    /// Fetch server files.
    PullFiles(PullFiles),
    /// Run an allow-listed command in the workspace.
    ExecuteCommand(ExecuteCommand),
    /// Run a git operation in the workspace.
    GitOperation(GitRequest),
    /// Start a deployment.
    StartDeployment(StartDeployment),
    /// Cancel a deployment.
    CancelDeployment {
        /// Deployment.
        deployment_id: DeploymentId,
    },
    /// Current state of a deployment.
    GetStatus {
        /// Deployment.
        deployment_id: DeploymentId,
    },
    /// Recent deployments of a project.
    DeploymentHistory {
        /// Project.
        project_id: ProjectId,
        /// Page size.
        #[serde(default)]
        limit: Option<usize>,
    },
}

impl ClientOp {
    /// Wire name, for logs.
    #[must_use]
    pub const fn name(&self) -> &'static str {
        match self {
            Self::Authenticate => "authenticate",
            Self::Ping => "ping",
            Self::JoinRoom { .. } => "join-room",
            Self::LeaveRoom { .. } => "leave-room",
            Self::CodeChange(_) => "code-change",
            Self::CursorUpdate(_) => "cursor-update",
            Self::FileCreated(_) => "file-created",
            Self::FileDeleted { .. } => "file-deleted",
            Self::GetCursors { .. } => "get-cursors",
            Self::Register(_) => "register",
            Self::SyncFiles(_) => "sync-files",
            Self::PullFiles(_) => "pull-files",
            Self::ExecuteCommand(_) => "execute-command",
            Self::GitOperation(_) => "git-operation",
            Self::StartDeployment(_) => "start-deployment",
            Self::CancelDeployment { .. } => "cancel-deployment",
            Self::GetStatus { .. } => "get-status",
            Self::DeploymentHistory { .. } => "deployment-history",
        }
    }

    /// The namespace serving this operation, or `None` if every socket does.
    #[must_use]
    pub const fn namespace(&self) -> Option<Namespace> {
        match self {
            Self::Authenticate | Self::Ping | Self::JoinRoom { .. } | Self::LeaveRoom { .. } => None,
            Self::CodeChange(_)
            | Self::CursorUpdate(_)
            | Self::FileCreated(_)
            | Self::FileDeleted { .. }
            | Self::GetCursors { .. } => Some(Namespace::Collab),
            Self::Register(_)
            | Self::SyncFiles(_)
            | Self::PullFiles(_)
            | Self::ExecuteCommand(_)
            | Self::GitOperation(_) => Some(Namespace::Bridge),
            Self::StartDeployment(_)
            | Self::CancelDeployment { .. }
            | Self::GetStatus { .. }
            | Self::DeploymentHistory { .. } => Some(Namespace::Deploy),
        }
    }

    /// Operations that must carry a token of their own.
    #[must_use]
    pub const fn is_privileged(&self) -> bool {
        matches!(
            self,
            Self::Authenticate
                | Self::FileCreated(_)
                | Self::FileDeleted { .. }
                | Self::Register(_)
                | Self::SyncFiles(_)
                | Self::ExecuteCommand(_)
                | Self::GitOperation(_)
                | Self::StartDeployment(_)
                | Self::CancelDeployment { .. }
        )
    }

    /// Operations that wait on a child process and run off the read loop.
    #[must_use]
    pub const fn is_long_running(&self) -> bool {
        matches!(self, Self::ExecuteCommand(_) | Self::GitOperation(_))
    }

    /// Check that this socket serves the operation.
    ///
    /// # Errors
    ///
    /// Returns `Validation` for operations of another namespace.
    pub fn check_namespace(&self, socket: Namespace) -> Result<(), ControlError> {
        match self.namespace() {
            Some(ns) if ns != socket => Err(ControlError::Validation(format!(
                "{} is not available on the {socket} socket",
                self.name()
            ))),
            _ => Ok(()),
        }
    }
}

/// A reply to one inbound frame.
#[derive(Debug, Serialize)]
#[serde(tag = "type", rename_all = "kebab-case", rename_all_fields = "camelCase")]
pub enum Reply {
    /// The operation succeeded.
    Ack {
        /// The request's `requestId`.
        request_id: Option<String>,
        /// Operation result.
        result: serde_json::Value,
    },
    /// The operation failed. Nothing else about the connection changed.
    Error {
        /// The request's `requestId`.
        request_id: Option<String>,
        /// Stable error code.
        code: &'static str,
        /// Human-readable reason.
        message: String,
    },
}

impl Reply {
    /// Build the reply for an operation outcome.
    #[must_use]
    pub fn from_result(
        request_id: Option<String>,
        result: Result<serde_json::Value, ControlError>,
    ) -> Self {
        match result {
            Ok(result) => Self::Ack { request_id, result },
            Err(e) => Self::error(request_id, &e),
        }
    }

    /// Build an `error` reply. Internal details are logged, not sent.
    #[must_use]
    pub fn error(request_id: Option<String>, err: &ControlError) -> Self {
        let code = err.code();
        let message = if code == "internal" {
            tracing::error!(error = %err, "Socket operation failed");
            "internal error".to_string()
        } else {
            err.to_string()
        };
        Self::Error {
            request_id,
            code,
            message,
        }
    }
}

/// A live cursor as sent to clients.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CursorView {
    /// File.
    pub file_id: FileId,
    /// Cursor owner.
    pub user_id: UserId,
    /// Absolute offset.
    pub position: u64,
    /// Zero-based line.
    pub line: u32,
    /// Zero-based column.
    pub column: u32,
    /// Optional selection.
    pub selection: Option<Selection>,
    /// Last activity.
    pub updated_at: DateTime<Utc>,
}

impl From<Cursor> for CursorView {
    fn from(cursor: Cursor) -> Self {
        Self {
            file_id: cursor.file_id,
            user_id: cursor.user_id,
            position: cursor.position,
            line: cursor.line,
            column: cursor.column,
            selection: cursor.selection,
            updated_at: cursor.updated_at,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn parses_envelope_and_payload() {
        let room_id = RoomId::generate();
        let file_id = FileId::generate();
        let message: ClientMessage = serde_json::from_value(json!({
            "type": "code-change",
            "requestId": "r1",
            "roomId": room_id.to_string(),
            "fileId": file_id.to_string(),
            "content": "fn main() {}",
            "changeOps": [{"insert": "x"}],
        }))
        .unwrap();

        assert_eq!(message.request_id.as_deref(), Some("r1"));
        assert!(message.token.is_none());
        match message.op {
            ClientOp::CodeChange(change) => {
                assert_eq!(change.room_id, room_id);
                assert_eq!(change.file_id, file_id);
                assert_eq!(change.content, "fn main() {}");
            }
            other => panic!("expected code-change, got {other:?}"),
        }
    }

    #[test]
    fn parses_unit_and_struct_variants() {
        let message: ClientMessage =
            serde_json::from_value(json!({"type": "authenticate", "token": "abc"})).unwrap();
        assert!(matches!(message.op, ClientOp::Authenticate));
        assert_eq!(message.token.as_deref(), Some("abc"));

        let project_id = ProjectId::generate();
        let message: ClientMessage = serde_json::from_value(json!({
            "type": "deployment-history",
            "projectId": project_id.to_string(),
            "limit": 5,
        }))
        .unwrap();
        match message.op {
            ClientOp::DeploymentHistory { project_id: p, limit } => {
                assert_eq!(p, project_id);
                assert_eq!(limit, Some(5));
            }
            other => panic!("expected deployment-history, got {other:?}"),
        }
    }

    #[test]
    fn rejects_unknown_type() {
        let result = serde_json::from_value::<ClientMessage>(json!({"type": "drop-tables"}));
        assert!(result.is_err());
    }

    #[test]
    fn namespace_routing() {
        let op = ClientOp::GetStatus {
            deployment_id: DeploymentId::generate(),
        };
        assert!(op.check_namespace(Namespace::Deploy).is_ok());
        assert!(matches!(
            op.check_namespace(Namespace::Collab),
            Err(ControlError::Validation(_))
        ));
        assert!(ClientOp::Ping.check_namespace(Namespace::Bridge).is_ok());
    }

    #[test]
    fn privileged_operations() {
        assert!(ClientOp::Authenticate.is_privileged());
        assert!(ClientOp::CancelDeployment {
            deployment_id: DeploymentId::generate()
        }
        .is_privileged());
        assert!(!ClientOp::GetStatus {
            deployment_id: DeploymentId::generate()
        }
        .is_privileged());
    }

    #[test]
    fn replies_are_tagged() {
        let ack = serde_json::to_value(Reply::Ack {
            request_id: Some("1".to_string()),
            result: json!({"ok": true}),
        })
        .unwrap();
        assert_eq!(ack["type"], "ack");
        assert_eq!(ack["requestId"], "1");

        let error = serde_json::to_value(Reply::error(
            None,
            &ControlError::Forbidden("no access".to_string()),
        ))
        .unwrap();
        assert_eq!(error["type"], "error");
        assert_eq!(error["code"], "forbidden");
        assert!(error["requestId"].is_null());

        let internal = serde_json::to_value(Reply::error(
            None,
            &ControlError::Internal("disk on fire".to_string()),
        ))
        .unwrap();
        assert_eq!(internal["message"], "internal error");
    }
}
