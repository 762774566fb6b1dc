//! Shared fixture for gateway tests: a seeded on-disk store, an engine and
//! the router, authenticated with the mock verifier.

#![allow(dead_code)]

use std::sync::Arc;

use axum::http::header::AUTHORIZATION;
use axum::http::{HeaderName, HeaderValue};
use axum::Router;
use chrono::Utc;
use devroom_auth::MockTokenVerifier;
use devroom_control::{ControlConfig, Engine};
use devroom_core::{FileId, ProjectId, RoomId, UserId};
use devroom_gateway::{create_router, GatewayConfig, GatewayState};
use devroom_store::{FileRecord, MemberRole, Project, RocksStore, Room, RoomMember, Store, User};
use tempfile::TempDir;

/// A private room with an owner, an editor and a viewer, one project holding
/// `index.html`, and a user with no access.
pub struct TestApp {
    pub dir: TempDir,
    pub store: Arc<RocksStore>,
    pub engine: Arc<Engine<RocksStore>>,
    pub owner: UserId,
    pub editor: UserId,
    pub viewer: UserId,
    pub outsider: UserId,
    pub room_id: RoomId,
    pub project_id: ProjectId,
    pub file_id: FileId,
}

impl TestApp {
    pub fn new() -> Self {
        let dir = TempDir::new().unwrap();
        let store = Arc::new(RocksStore::open(dir.path().join("db")).unwrap());
        let now = Utc::now();

        let [owner, editor, viewer, outsider] =
            ["Olive", "Eddie", "Vera", "Otto"].map(|name| {
                let user = User {
                    user_id: UserId::generate(),
                    email: format!("{}@example.com", name.to_lowercase()),
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
                name: "launch".to_string(),
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
                name: "landing".to_string(),
                created_at: now,
            })
            .unwrap();

        let file_id = FileId::generate();
        store
            .create_file(&FileRecord {
                file_id,
                project_id,
                path: "index.html".to_string(),
                content: "<h1>hello</h1>".to_string(),
                created_at: now,
                updated_at: now,
            })
            .unwrap();

        let config = ControlConfig {
            deploy_work_root: dir.path().join("work"),
            publish_root: dir.path().join("sites"),
            public_base_url: "http://sites.test".to_string(),
            ..ControlConfig::default()
        };
        let engine = Arc::new(Engine::new(Arc::clone(&store), config).unwrap());

        Self {
            dir,
            store,
            engine,
            owner,
            editor,
            viewer,
            outsider,
            room_id,
            project_id,
            file_id,
        }
    }

    pub fn router(&self) -> Router {
        let state = GatewayState::new(
            Arc::clone(&self.engine),
            Arc::new(MockTokenVerifier),
            GatewayConfig::default(),
        );
        create_router(state)
    }
}

pub fn token(user_id: &UserId) -> String {
    MockTokenVerifier::token_for(user_id)
}

pub fn bearer(user_id: &UserId) -> (HeaderName, HeaderValue) {
    (
        AUTHORIZATION,
        HeaderValue::from_str(&format!("Bearer {}", token(user_id))).unwrap(),
    )
}
