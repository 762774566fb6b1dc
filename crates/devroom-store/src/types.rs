//! Domain types stored in the database.
//!
//! These types represent the persisted state of users, rooms, projects, files,
//! cursors, bridge sessions, deployments and the operation audit log.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use devroom_core::{BridgeId, DeploymentId, FileId, ProjectId, RecordId, RoomId, UserId};
use serde::{Deserialize, Serialize};

/// A user record (synced from the identity provider).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct User {
    /// Unique identifier for the user.
    pub user_id: UserId,
    /// User's email address. Never broadcast.
    pub email: String,
    /// Name shown to other room members.
    pub display_name: String,
    /// Optional avatar image URL.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub avatar_url: Option<String>,
    /// Creation timestamp.
    pub created_at: DateTime<Utc>,
}

impl User {
    /// The identity other participants are allowed to see.
    #[must_use]
    pub fn public(&self) -> PublicUser {
        PublicUser {
            id: self.user_id,
            display_name: self.display_name.clone(),
            avatar_url: self.avatar_url.clone(),
        }
    }
}

/// The public face of a user, safe to include in broadcasts.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PublicUser {
    /// User ID.
    pub id: UserId,
    /// Display name.
    pub display_name: String,
    /// Avatar URL.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub avatar_url: Option<String>,
}

impl PublicUser {
    /// A placeholder for users that have a valid token but no stored profile yet.
    #[must_use]
    pub fn anonymous(id: UserId) -> Self {
        Self {
            id,
            display_name: "anonymous".to_string(),
            avatar_url: None,
        }
    }
}

/// A collaboration room.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Room {
    /// Room ID.
    pub room_id: RoomId,
    /// The user who created the room.
    pub owner_id: UserId,
    /// Human-readable name.
    pub name: String,
    /// Public rooms can be joined read-only by anyone.
    pub is_public: bool,
    /// Creation timestamp.
    pub created_at: DateTime<Utc>,
}

/// What a listed room member may do.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MemberRole {
    /// May edit files, run commands and deploy.
    Editor,
    /// May only observe.
    Viewer,
}

/// A listed member of a room.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RoomMember {
    /// Room the membership belongs to.
    pub room_id: RoomId,
    /// The member.
    pub user_id: UserId,
    /// Granted role.
    pub role: MemberRole,
    /// When the membership was granted.
    pub added_at: DateTime<Utc>,
}

/// A project inside a room.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Project {
    /// Project ID.
    pub project_id: ProjectId,
    /// Room the project belongs to.
    pub room_id: RoomId,
    /// Project owner.
    pub owner_id: UserId,
    /// Human-readable name.
    pub name: String,
    /// Creation timestamp.
    pub created_at: DateTime<Utc>,
}

/// A file snapshot. Content is always replaced as a whole.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FileRecord {
    /// File ID.
    pub file_id: FileId,
    /// Owning project.
    pub project_id: ProjectId,
    /// Normalized project-relative path, unique within the project.
    pub path: String,
    /// Full text content.
    pub content: String,
    /// Creation timestamp.
    pub created_at: DateTime<Utc>,
    /// Timestamp of the most recently accepted write.
    pub updated_at: DateTime<Utc>,
}

/// A text selection inside a file, as absolute offsets.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Selection {
    /// Selection anchor offset.
    pub start: u64,
    /// Selection head offset.
    pub end: u64,
}

/// The live cursor of one user in one file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Cursor {
    /// File the cursor is in.
    pub file_id: FileId,
    /// Cursor owner.
    pub user_id: UserId,
    /// Absolute character offset.
    pub position: u64,
    /// Zero-based line.
    pub line: u32,
    /// Zero-based column.
    pub column: u32,
    /// Optional selection.
    #[serde(default)]
    pub selection: Option<Selection>,
    /// Last activity.
    pub updated_at: DateTime<Utc>,
}

/// Lifecycle of an external editor bridge session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BridgeStatus {
    /// Registered and idle.
    Connected,
    /// A sync batch is being applied.
    Syncing,
    /// The socket is gone.
    Disconnected,
}

/// A registered external editor session.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BridgeConnection {
    /// Bridge session ID.
    pub bridge_id: BridgeId,
    /// Owning user.
    pub user_id: UserId,
    /// Room the editor synchronizes with.
    pub room_id: RoomId,
    /// Editor kind (e.g. `vscode`).
    pub editor_type: String,
    /// Editor version string.
    pub editor_version: String,
    /// Absolute path of the local workspace.
    pub workspace_path: String,
    /// Current status.
    pub status: BridgeStatus,
    /// Registration timestamp.
    pub connected_at: DateTime<Utc>,
    /// Last completed sync.
    #[serde(default)]
    pub last_sync_at: Option<DateTime<Utc>>,
}

/// Deployment state machine states.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
#[repr(u8)]
pub enum DeploymentStatus {
    /// Record written, task not yet started.
    Pending = 1,
    /// Materializing files, installing and building.
    Building = 2,
    /// Running the provider step.
    Deploying = 3,
    /// Deployed; terminal.
    Success = 4,
    /// Faulted or cancelled; terminal.
    Failed = 5,
}

impl DeploymentStatus {
    /// Convert the status to its numeric representation.
    #[must_use]
    pub const fn as_u8(self) -> u8 {
        self as u8
    }

    /// Returns true for `Success` and `Failed`.
    #[must_use]
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Success | Self::Failed)
    }
}

/// Build and deploy settings supplied when a deployment starts.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeploymentConfig {
    /// Optional build command, e.g. `npm run build`.
    #[serde(default)]
    pub build_command: Option<String>,
    /// Skip dependency installation when false.
    #[serde(default = "default_install")]
    pub install: bool,
    /// Directory (relative to the project root) holding build output.
    #[serde(default)]
    pub output_dir: Option<String>,
    /// Extra environment for install and build steps.
    #[serde(default)]
    pub env: BTreeMap<String, String>,
}

const fn default_install() -> bool {
    true
}

impl Default for DeploymentConfig {
    fn default() -> Self {
        Self {
            build_command: None,
            install: default_install(),
            output_dir: None,
            env: BTreeMap::new(),
        }
    }
}

/// One progress line of a deployment.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeployLogLine {
    /// When the line was emitted.
    pub at: DateTime<Utc>,
    /// Status at emission time.
    pub status: DeploymentStatus,
    /// Progress percent at emission time.
    pub progress: u8,
    /// Free text.
    pub message: String,
}

/// A deployment record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Deployment {
    /// Deployment ID.
    pub deployment_id: DeploymentId,
    /// Project being deployed.
    pub project_id: ProjectId,
    /// Room that receives progress events.
    pub room_id: RoomId,
    /// User who started the deployment.
    pub user_id: UserId,
    /// Provider identifier (e.g. `static`).
    pub provider: String,
    /// Settings.
    pub config: DeploymentConfig,
    /// Current status.
    pub status: DeploymentStatus,
    /// Progress percent (0-100).
    pub progress: u8,
    /// Ordered log lines.
    pub logs: Vec<DeployLogLine>,
    /// Reachable URL once deployed.
    #[serde(default)]
    pub url: Option<String>,
    /// Failure reason.
    #[serde(default)]
    pub error: Option<String>,
    /// Start timestamp.
    pub started_at: DateTime<Utc>,
    /// End timestamp, set when terminal.
    #[serde(default)]
    pub finished_at: Option<DateTime<Utc>>,
}

/// What an audit record describes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OperationKind {
    /// A git operation.
    Git,
    /// An allow-listed build/test command.
    Command,
}

/// Append-only audit entry for a git or command execution.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OperationRecord {
    /// Record ID.
    pub record_id: RecordId,
    /// Acting user.
    pub user_id: UserId,
    /// Project the operation ran against.
    pub project_id: ProjectId,
    /// Operation kind.
    pub kind: OperationKind,
    /// Operation name or command line.
    pub operation: String,
    /// Captured output.
    pub output: String,
    /// Whether it succeeded.
    pub success: bool,
    /// Execution timestamp.
    pub created_at: DateTime<Utc>,
}
