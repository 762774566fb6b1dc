//! End-to-end socket tests against a gateway bound to an ephemeral port.

mod common;

use std::collections::VecDeque;
use std::net::SocketAddr;
use std::time::Duration;

use futures::{SinkExt, StreamExt};
use serde_json::{json, Value};
use tokio::net::TcpStream;
use tokio::time::timeout;
use tokio_tungstenite::tungstenite::{Error as WsError, Message};
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};

use common::{token, TestApp};
use devroom_core::UserId;
use devroom_store::Store;

/// Timeout for receiving one message.
const MESSAGE_TIMEOUT: Duration = Duration::from_secs(10);

async fn spawn_server(app: &TestApp) -> SocketAddr {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let router = app.router();
    tokio::spawn(async move {
        axum::serve(listener, router).await.unwrap();
    });
    addr
}

/// A socket client that keeps room events apart from replies.
struct Client {
    socket: WebSocketStream<MaybeTlsStream<TcpStream>>,
    events: VecDeque<Value>,
    next_id: u32,
}

impl Client {
    async fn connect(addr: SocketAddr, namespace: &str, user: Option<&UserId>) -> Self {
        let url = match user {
            Some(user) => format!("ws://{addr}/v1/ws/{namespace}?token={}", token(user)),
            None => format!("ws://{addr}/v1/ws/{namespace}"),
        };
        let (socket, _) = connect_async(url).await.unwrap();
        Self {
            socket,
            events: VecDeque::new(),
            next_id: 0,
        }
    }

    async fn recv(&mut self) -> Value {
        loop {
            let frame = timeout(MESSAGE_TIMEOUT, self.socket.next())
                .await
                .expect("timed out waiting for a message")
                .expect("socket closed")
                .unwrap();
            if let Message::Text(text) = frame {
                return serde_json::from_str(&text).unwrap();
            }
        }
    }

    /// Send an operation and wait for its `ack` or `error`.
    async fn request(&mut self, mut message: Value) -> Value {
        self.next_id += 1;
        let request_id = self.next_id.to_string();
        message["requestId"] = json!(request_id);
        self.socket
            .send(Message::Text(message.to_string()))
            .await
            .unwrap();

        loop {
            let value = self.recv().await;
            let is_reply = value["type"] == "ack" || value["type"] == "error";
            if is_reply && value["requestId"] == request_id.as_str() {
                return value;
            }
            self.events.push_back(value);
        }
    }

    /// The next room event of a type, skipping others.
    async fn event(&mut self, kind: &str) -> Value {
        while let Some(value) = self.events.pop_front() {
            if value["type"] == kind {
                return value;
            }
        }
        loop {
            let value = self.recv().await;
            if value["type"] == kind {
                return value;
            }
        }
    }

    async fn join(&mut self, app: &TestApp) -> Value {
        self.request(json!({"type": "join-room", "roomId": app.room_id.to_string()}))
            .await
    }
}

fn assert_ack(reply: &Value) {
    assert_eq!(reply["type"], "ack", "expected ack, got {reply}");
}

fn assert_error(reply: &Value, code: &str) {
    assert_eq!(reply["type"], "error", "expected error, got {reply}");
    assert_eq!(reply["code"], code, "{reply}");
}

#[tokio::test]
async fn last_write_wins_and_author_is_excluded() {
    let app = TestApp::new();
    let addr = spawn_server(&app).await;

    let mut alice = Client::connect(addr, "collab", Some(&app.owner)).await;
    let mut bob = Client::connect(addr, "collab", Some(&app.editor)).await;
    assert_ack(&alice.join(&app).await);
    let joined = bob.join(&app).await;
    assert_ack(&joined);
    assert_eq!(joined["result"]["members"].as_array().unwrap().len(), 2);

    let change = |content: &str| {
        json!({
            "type": "code-change",
            "roomId": app.room_id.to_string(),
            "fileId": app.file_id.to_string(),
            "content": content,
            "changeOps": {"kind": "replace"},
        })
    };

    assert_ack(&alice.request(change("x")).await);
    let seen_by_bob = bob.event("code-change").await;
    assert_eq!(seen_by_bob["content"], "x");
    assert_eq!(seen_by_bob["user"]["displayName"], "Olive");

    assert_ack(&bob.request(change("y")).await);
    let seen_by_alice = alice.event("code-change").await;
    assert_eq!(seen_by_alice["content"], "y");
    assert_eq!(seen_by_alice["changeOps"]["kind"], "replace");

    let stored = app.store.get_file(&app.file_id).unwrap().unwrap();
    assert_eq!(stored.content, "y");

    // Alice never got her own write echoed.
    let pong = alice.request(json!({"type": "ping"})).await;
    assert_ack(&pong);
    assert!(alice
        .events
        .iter()
        .all(|e| !(e["type"] == "code-change" && e["content"] == "x")));
}

#[tokio::test]
async fn outsider_join_is_denied_without_dropping_the_socket() {
    let app = TestApp::new();
    let addr = spawn_server(&app).await;

    let mut otto = Client::connect(addr, "collab", Some(&app.outsider)).await;
    assert_error(&otto.join(&app).await, "forbidden");
    assert_eq!(app.engine.registry().topic_count(), 0);

    assert_ack(&otto.request(json!({"type": "ping"})).await);
}

#[tokio::test]
async fn privileged_operations_need_a_message_token() {
    let app = TestApp::new();
    let addr = spawn_server(&app).await;

    let mut eddie = Client::connect(addr, "collab", None).await;
    assert_error(&eddie.join(&app).await, "unauthenticated");

    let auth = eddie
        .request(json!({"type": "authenticate", "token": token(&app.editor)}))
        .await;
    assert_ack(&auth);
    assert_eq!(auth["result"]["displayName"], "Eddie");
    assert_ack(&eddie.join(&app).await);

    let create = json!({
        "type": "file-created",
        "roomId": app.room_id.to_string(),
        "projectId": app.project_id.to_string(),
        "path": "/src/app.js",
        "content": "export {}",
    });
    assert_error(&eddie.request(create.clone()).await, "unauthenticated");

    let mut with_token = create;
    with_token["token"] = json!(token(&app.editor));
    let reply = eddie.request(with_token).await;
    assert_ack(&reply);
    assert_eq!(reply["result"]["path"], "src/app.js");

    // The originator is part of the broadcast.
    let event = eddie.event("file-created").await;
    assert_eq!(event["file"]["path"], "src/app.js");

    // A token for someone else cannot take over the connection.
    let mut hijack = json!({
        "type": "file-deleted",
        "roomId": app.room_id.to_string(),
        "fileId": app.file_id.to_string(),
    });
    hijack["token"] = json!(token(&app.owner));
    assert_error(&eddie.request(hijack).await, "forbidden");
    assert!(app.store.get_file(&app.file_id).unwrap().is_some());
}

#[tokio::test]
async fn operations_are_scoped_to_their_namespace() {
    let app = TestApp::new();
    let addr = spawn_server(&app).await;

    let mut client = Client::connect(addr, "deploy", Some(&app.owner)).await;
    let reply = client
        .request(json!({
            "type": "cursor-update",
            "roomId": app.room_id.to_string(),
            "fileId": app.file_id.to_string(),
            "position": 0,
            "line": 0,
            "column": 0,
        }))
        .await;
    assert_error(&reply, "validation");

    let reply = client.request(json!({"type": "no-such-op"})).await;
    assert_error(&reply, "validation");
}

#[tokio::test]
async fn bridge_sync_and_command_policy() {
    let app = TestApp::new();
    let addr = spawn_server(&app).await;
    let workspace = app.dir.path().join("workspace");
    std::fs::create_dir_all(&workspace).unwrap();

    let mut watcher = Client::connect(addr, "collab", Some(&app.owner)).await;
    assert_ack(&watcher.join(&app).await);

    let mut editor = Client::connect(addr, "bridge", Some(&app.editor)).await;
    let registered = editor
        .request(json!({
            "type": "register",
            "token": token(&app.editor),
            "roomId": app.room_id.to_string(),
            "editorType": "vscode",
            "editorVersion": "1.95.0",
            "workspacePath": workspace.display().to_string(),
        }))
        .await;
    assert_ack(&registered);
    assert!(registered["result"]["bridgeId"].is_string());

    let connected = watcher.event("editor-connected").await;
    assert_eq!(connected["editorType"], "vscode");

    let sync = |content: &str, at: i64| {
        json!({
            "type": "sync-files",
            "token": token(&app.editor),
            "roomId": app.room_id.to_string(),
            "projectId": app.project_id.to_string(),
            "files": [{"path": "a.txt", "content": content, "localModifiedAt": at}],
        })
    };

    let first = editor.request(sync("v1", 100)).await;
    assert_ack(&first);
    assert_eq!(first["result"]["results"][0]["status"], "created");

    let older = editor.request(sync("v0", 40)).await;
    assert_ack(&older);
    assert_eq!(older["result"]["results"][0]["status"], "skipped");

    let synced = watcher.event("files-synced").await;
    assert_eq!(synced["created"], 1);

    let pulled = editor
        .request(json!({
            "type": "pull-files",
            "roomId": app.room_id.to_string(),
            "projectId": app.project_id.to_string(),
            "since": 99,
        }))
        .await;
    assert_ack(&pulled);
    let files = pulled["result"]["files"].as_array().unwrap();
    assert_eq!(files.len(), 1);
    assert_eq!(files[0]["path"], "a.txt");
    assert_eq!(files[0]["content"], "v1");

    let rejected = editor
        .request(json!({
            "type": "execute-command",
            "token": token(&app.editor),
            "roomId": app.room_id.to_string(),
            "projectId": app.project_id.to_string(),
            "command": "rm -rf /",
        }))
        .await;
    assert_error(&rejected, "validation");
}

#[tokio::test]
async fn deploy_socket_streams_progress() {
    let app = TestApp::new();
    let addr = spawn_server(&app).await;

    let mut owner = Client::connect(addr, "deploy", Some(&app.owner)).await;
    assert_ack(&owner.join(&app).await);

    let started = owner
        .request(json!({
            "type": "start-deployment",
            "token": token(&app.owner),
            "roomId": app.room_id.to_string(),
            "projectId": app.project_id.to_string(),
        }))
        .await;
    assert_ack(&started);
    assert_eq!(started["result"]["status"], "pending");
    let deployment_id = started["result"]["deploymentId"].as_str().unwrap().to_string();

    let mut statuses = Vec::new();
    loop {
        let event = owner.event("deployment-progress").await;
        assert_eq!(event["deploymentId"], deployment_id.as_str());
        let status = event["status"].as_str().unwrap().to_string();
        if statuses.last() != Some(&status) {
            statuses.push(status.clone());
        }
        if status == "success" || status == "failed" {
            break;
        }
    }
    assert_eq!(statuses, ["building", "deploying", "success"]);

    let status = owner
        .request(json!({"type": "get-status", "deploymentId": deployment_id}))
        .await;
    assert_ack(&status);
    assert_eq!(status["result"]["progress"], 100);
}

#[tokio::test]
async fn invalid_upgrade_credential_is_rejected() {
    let app = TestApp::new();
    let addr = spawn_server(&app).await;

    let result = connect_async(format!("ws://{addr}/v1/ws/collab?token=forged")).await;
    match result {
        Err(WsError::Http(response)) => assert_eq!(response.status(), 401),
        other => panic!("expected HTTP 401, got {other:?}"),
    }
}
