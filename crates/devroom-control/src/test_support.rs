//! Shared fixtures for unit tests.

use std::collections::VecDeque;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use devroom_core::{ConnectionId, FileId, ProjectId, RoomId, UserId};
use devroom_store::{
    FileRecord, MemberRole, Project, Room, RoomMember, RocksStore, Store, User,
};
use parking_lot::Mutex;
use tempfile::TempDir;
use tokio::sync::mpsc;

use crate::config::ControlConfig;
use crate::error::Result;
use crate::events::ServerEvent;
use crate::presence::{Presence, PresenceRegistry};
use crate::sandbox::{CommandOutput, CommandSandbox, CommandSpec};

/// A private room with an owner, an editor, a viewer, a project, and a user
/// with no access at all.
pub struct Fixture {
    pub dir: TempDir,
    pub store: Arc<RocksStore>,
    pub owner: UserId,
    pub editor: UserId,
    pub viewer: UserId,
    pub outsider: UserId,
    pub room_id: RoomId,
    pub project_id: ProjectId,
}

impl Fixture {
    pub fn new() -> Self {
        let dir = TempDir::new().unwrap();
        let store = Arc::new(RocksStore::open(dir.path().join("db")).unwrap());
        let now = Utc::now();

        let [owner, editor, viewer, outsider] = ["owner", "editor", "viewer", "outsider"].map(|name| {
            let user = User {
                user_id: UserId::generate(),
                email: format!("{name}@example.com"),
                display_name: name.to_string(),
                avatar_url: None,
                created_at: now,
            };
            store.put_user(&user).unwrap();
            user.user_id
        });

        let room_id = RoomId::generate();
        store
            .put_room(&Room {
                room_id,
                owner_id: owner,
                name: "team".to_string(),
                is_public: false,
                created_at: now,
            })
            .unwrap();
        for (user_id, role) in [(editor, MemberRole::Editor), (viewer, MemberRole::Viewer)] {
            store
                .put_room_member(&RoomMember {
                    room_id,
                    user_id,
                    role,
                    added_at: now,
                })
                .unwrap();
        }

        let project_id = ProjectId::generate();
        store
            .put_project(&Project {
                project_id,
                room_id,
                owner_id: owner,
                name: "site".to_string(),
                created_at: now,
            })
            .unwrap();

        Self {
            dir,
            store,
            owner,
            editor,
            viewer,
            outsider,
            room_id,
            project_id,
        }
    }

    pub fn presence(&self) -> Arc<Presence<RocksStore>> {
        Arc::new(Presence::new(
            Arc::clone(&self.store),
            Arc::new(PresenceRegistry::new()),
        ))
    }

    /// Open an authenticated connection.
    pub fn connect(
        &self,
        presence: &Presence<RocksStore>,
        user_id: &UserId,
    ) -> (ConnectionId, mpsc::UnboundedReceiver<Arc<ServerEvent>>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let conn = presence.registry().connect(tx);
        presence.authenticate(conn, user_id).unwrap();
        (conn, rx)
    }

    /// Create a file in the fixture project.
    pub fn file(&self, path: &str, content: &str) -> FileRecord {
        let now = Utc::now();
        let file = FileRecord {
            file_id: FileId::generate(),
            project_id: self.project_id,
            path: path.to_string(),
            content: content.to_string(),
            created_at: now,
            updated_at: now,
        };
        self.store.create_file(&file).unwrap();
        file
    }

    /// A file in a project of some other room.
    pub fn foreign_file(&self) -> FileRecord {
        let now = Utc::now();
        let room_id = self.public_room();
        let project_id = ProjectId::generate();
        self.store
            .put_project(&Project {
                project_id,
                room_id,
                owner_id: self.outsider,
                name: "elsewhere".to_string(),
                created_at: now,
            })
            .unwrap();
        let file = FileRecord {
            file_id: FileId::generate(),
            project_id,
            path: "secret.txt".to_string(),
            content: "not yours".to_string(),
            created_at: now,
            updated_at: now,
        };
        self.store.create_file(&file).unwrap();
        file
    }

    /// A public room owned by the outsider.
    pub fn public_room(&self) -> RoomId {
        let room_id = RoomId::generate();
        self.store
            .put_room(&Room {
                room_id,
                owner_id: self.outsider,
                name: "open".to_string(),
                is_public: true,
                created_at: Utc::now(),
            })
            .unwrap();
        room_id
    }

    /// An empty directory inside the fixture's temp dir.
    pub fn workspace(&self, name: &str) -> PathBuf {
        let path = self.dir.path().join(name);
        std::fs::create_dir_all(&path).unwrap();
        path
    }

    /// Engine configuration writing only inside the fixture's temp dir.
    pub fn config(&self) -> ControlConfig {
        ControlConfig {
            deploy_work_root: self.dir.path().join("work"),
            publish_root: self.dir.path().join("sites"),
            public_base_url: "http://sites.test".to_string(),
            ..ControlConfig::default()
        }
    }
}

/// Everything queued on a connection so far.
pub fn drain_events(rx: &mut mpsc::UnboundedReceiver<Arc<ServerEvent>>) -> Vec<Arc<ServerEvent>> {
    let mut events = Vec::new();
    while let Ok(event) = rx.try_recv() {
        events.push(event);
    }
    events
}

/// Records every spec and answers with queued outputs, or success.
#[derive(Default)]
pub struct FakeSandbox {
    pub specs: Mutex<Vec<CommandSpec>>,
    outputs: Mutex<VecDeque<Result<CommandOutput>>>,
    delay: Option<Duration>,
}

impl FakeSandbox {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn with_delay(delay: Duration) -> Arc<Self> {
        Arc::new(Self {
            delay: Some(delay),
            ..Self::default()
        })
    }

    pub fn push(&self, output: Result<CommandOutput>) {
        self.outputs.lock().push_back(output);
    }

    pub fn ran(&self) -> Vec<String> {
        self.specs.lock().iter().map(CommandSpec::display).collect()
    }
}

pub fn exited(code: i32, stdout: &str) -> CommandOutput {
    CommandOutput {
        stdout: stdout.to_string(),
        exit_code: Some(code),
        ..CommandOutput::default()
    }
}

#[async_trait]
impl CommandSandbox for FakeSandbox {
    async fn run(&self, spec: &CommandSpec) -> Result<CommandOutput> {
        self.specs.lock().push(spec.clone());
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        let queued = self.outputs.lock().pop_front();
        queued.unwrap_or_else(|| Ok(exited(0, "ok")))
    }
}
