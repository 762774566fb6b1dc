//! Room sockets.
//!
//! One socket per namespace: `/v1/ws/collab`, `/v1/ws/bridge` and
//! `/v1/ws/deploy`. Each socket is one registry connection. A writer task
//! drains the connection's outbox (room events) and the reply queue onto the
//! socket; the read loop parses frames and runs them against the engine.
//! A failing operation is answered with an `error` reply and never closes the
//! socket.

use std::sync::Arc;

use axum::extract::ws::{Message, WebSocket};
use axum::extract::{Path, Query, State, WebSocketUpgrade};
use axum::http::HeaderMap;
use axum::response::Response;
use chrono::Utc;
use futures::stream::SplitSink;
use futures::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tokio::sync::mpsc;

use devroom_auth::TokenVerifier;
use devroom_control::events::FileView;
use devroom_control::{ConnectionId, ControlError, Namespace, ServerEvent, Topic};
use devroom_core::UserId;
use devroom_store::Store;

use crate::auth::bearer_token;
use crate::error::ApiError;
use crate::handlers::deployments::DeploymentResponse;
use crate::protocol::{ClientMessage, ClientOp, CursorView, Reply};
use crate::state::GatewayState;

type Replies = mpsc::UnboundedSender<Reply>;

/// Query parameters accepted at upgrade.
#[derive(Debug, Deserialize)]
pub struct WsQuery {
    /// Bearer credential, for clients that cannot set headers.
    #[serde(default)]
    pub token: Option<String>,
}

/// Upgrade to a room socket.
///
/// A credential given at upgrade (header or `?token=`) binds the connection
/// immediately; without one the client must send `authenticate` first.
///
/// # Errors
///
/// Returns `404` for unknown namespaces and `401` for a credential that does
/// not verify.
pub async fn websocket_handler<S, V>(
    ws: WebSocketUpgrade,
    State(state): State<Arc<GatewayState<S, V>>>,
    Path(namespace): Path<String>,
    Query(query): Query<WsQuery>,
    headers: HeaderMap,
) -> Result<Response, ApiError>
where
    S: Store + 'static,
    V: TokenVerifier + 'static,
{
    let namespace = parse_namespace(&namespace)?;

    let token = bearer_token(&headers)
        .map(ToString::to_string)
        .or(query.token);
    let user_id = match token {
        Some(token) => Some(state.verifier.verify(&token).await?.user_id),
        None => None,
    };

    tracing::info!(
        namespace = %namespace,
        user_id = ?user_id,
        "WebSocket connection initiated"
    );

    Ok(ws.on_upgrade(move |socket| handle_socket(socket, state, namespace, user_id)))
}

fn parse_namespace(s: &str) -> Result<Namespace, ApiError> {
    Namespace::ALL
        .into_iter()
        .find(|ns| ns.as_str() == s)
        .ok_or_else(|| ApiError::NotFound(format!("socket namespace {s}")))
}

/// Run one socket until the client goes away, idles out, or the engine
/// drains it.
async fn handle_socket<S, V>(
    socket: WebSocket,
    state: Arc<GatewayState<S, V>>,
    namespace: Namespace,
    user_id: Option<UserId>,
) where
    S: Store + 'static,
    V: TokenVerifier + 'static,
{
    let engine = Arc::clone(&state.engine);
    let (event_tx, event_rx) = mpsc::unbounded_channel();
    let (reply_tx, reply_rx) = mpsc::unbounded_channel();
    let conn = engine.registry().connect(event_tx);

    if let Some(user_id) = user_id {
        if let Err(e) = engine.presence().authenticate(conn, &user_id) {
            tracing::warn!(connection_id = %conn, error = %e, "Failed to bind upgrade credential");
        }
    }

    let (sink, mut stream) = socket.split();
    let writer = tokio::spawn(write_loop(sink, event_rx, reply_rx, conn));

    let idle = state.config.websocket_timeout();
    loop {
        let frame = match tokio::time::timeout(idle, stream.next()).await {
            Ok(Some(Ok(frame))) => frame,
            Ok(Some(Err(e))) => {
                tracing::debug!(connection_id = %conn, error = %e, "Socket read failed");
                break;
            }
            Ok(None) => break,
            Err(_) => {
                tracing::debug!(connection_id = %conn, idle_seconds = idle.as_secs(), "Socket idle, closing");
                break;
            }
        };

        match frame {
            Message::Text(text) => handle_frame(&state, conn, namespace, &reply_tx, &text).await,
            Message::Binary(_) => send_reply(
                &reply_tx,
                Reply::error(
                    None,
                    &ControlError::Validation("binary frames are not supported".to_string()),
                ),
            ),
            Message::Close(_) => break,
            Message::Ping(_) | Message::Pong(_) => {}
        }
    }

    engine.disconnect(conn);
    drop(reply_tx);
    if let Err(e) = writer.await {
        tracing::warn!(connection_id = %conn, error = %e, "Socket writer panicked");
    }

    tracing::info!(connection_id = %conn, namespace = %namespace, "WebSocket connection closed");
}

async fn write_loop(
    mut sink: SplitSink<WebSocket, Message>,
    mut events: mpsc::UnboundedReceiver<Arc<ServerEvent>>,
    mut replies: mpsc::UnboundedReceiver<Reply>,
    conn: ConnectionId,
) {
    loop {
        let encoded = tokio::select! {
            reply = replies.recv() => match reply {
                Some(reply) => serde_json::to_string(&reply),
                None => break,
            },
            event = events.recv() => match event {
                Some(event) => serde_json::to_string(&*event),
                None => break,
            },
        };

        let text = match encoded {
            Ok(text) => text,
            Err(e) => {
                tracing::warn!(connection_id = %conn, error = %e, "Failed to encode outbound message");
                continue;
            }
        };

        if let Err(e) = sink.send(Message::Text(text)).await {
            tracing::debug!(connection_id = %conn, error = %e, "Socket write failed");
            return;
        }
    }

    if let Err(e) = sink.close().await {
        tracing::debug!(connection_id = %conn, error = %e, "Socket close failed");
    }
}

fn send_reply(replies: &Replies, reply: Reply) {
    // A closed queue means the socket is already gone.
    if replies.send(reply).is_err() {
        tracing::debug!("Dropped reply for closed socket");
    }
}

async fn handle_frame<S, V>(
    state: &Arc<GatewayState<S, V>>,
    conn: ConnectionId,
    namespace: Namespace,
    replies: &Replies,
    text: &str,
) where
    S: Store + 'static,
    V: TokenVerifier + 'static,
{
    let message: ClientMessage = match serde_json::from_str(text) {
        Ok(message) => message,
        Err(e) => {
            let err = ControlError::Validation(format!("invalid message: {e}"));
            send_reply(replies, Reply::error(request_id_of(text), &err));
            return;
        }
    };

    if message.op.is_long_running() {
        let state = Arc::clone(state);
        let replies = replies.clone();
        tokio::spawn(async move {
            let reply = run(&state, conn, namespace, message).await;
            send_reply(&replies, reply);
        });
    } else {
        let reply = run(state, conn, namespace, message).await;
        send_reply(replies, reply);
    }
}

async fn run<S, V>(
    state: &GatewayState<S, V>,
    conn: ConnectionId,
    namespace: Namespace,
    message: ClientMessage,
) -> Reply
where
    S: Store + 'static,
    V: TokenVerifier + 'static,
{
    let ClientMessage {
        token,
        request_id,
        op,
    } = message;
    let name = op.name();

    let result = execute(state, conn, namespace, token, op).await;
    if let Err(e) = &result {
        tracing::debug!(
            connection_id = %conn,
            operation = name,
            code = e.code(),
            error = %e,
            "Socket operation rejected"
        );
    }
    Reply::from_result(request_id, result)
}

/// Best-effort `requestId` of a frame that failed to parse as a message.
fn request_id_of(text: &str) -> Option<String> {
    let value: Value = serde_json::from_str(text).ok()?;
    value.get("requestId")?.as_str().map(str::to_owned)
}

fn to_json<T: Serialize>(value: &T) -> Result<Value, ControlError> {
    serde_json::to_value(value)
        .map_err(|e| ControlError::Internal(format!("failed to encode result: {e}")))
}

async fn execute<S, V>(
    state: &GatewayState<S, V>,
    conn: ConnectionId,
    namespace: Namespace,
    token: Option<String>,
    op: ClientOp,
) -> Result<Value, ControlError>
where
    S: Store + 'static,
    V: TokenVerifier + 'static,
{
    op.check_namespace(namespace)?;

    let engine = &state.engine;
    if op.is_privileged() {
        let token = token.ok_or(ControlError::Unauthenticated)?;
        let identity = state.verifier.verify(&token).await?;
        engine.presence().authenticate(conn, &identity.user_id)?;
    }

    match op {
        ClientOp::Authenticate => to_json(&engine.registry().identity(conn)?),
        ClientOp::Ping => Ok(json!({ "at": Utc::now() })),
        ClientOp::JoinRoom { room_id } => {
            to_json(&engine.presence().join(conn, Topic::new(namespace, room_id))?)
        }
        ClientOp::LeaveRoom { room_id } => {
            engine.presence().leave(conn, Topic::new(namespace, room_id))?;
            Ok(json!({ "roomId": room_id }))
        }

        // Collab
        ClientOp::CodeChange(change) => {
            let file = engine.collab().code_change(conn, change)?;
            to_json(&FileView::from(&file))
        }
        ClientOp::CursorUpdate(update) => {
            engine.collab().cursor_update(conn, update)?;
            Ok(Value::Null)
        }
        ClientOp::FileCreated(new_file) => {
            let file = engine.collab().file_created(conn, new_file)?;
            to_json(&FileView::from(&file))
        }
        ClientOp::FileDeleted { room_id, file_id } => {
            engine.collab().file_deleted(conn, room_id, file_id)?;
            Ok(json!({ "fileId": file_id }))
        }
        ClientOp::GetCursors { room_id, file_id } => {
            let cursors: Vec<CursorView> = engine
                .collab()
                .cursors(conn, room_id, file_id)?
                .into_iter()
                .map(CursorView::from)
                .collect();
            to_json(&cursors)
        }

        // Bridge
        ClientOp::Register(request) => to_json(&engine.bridge().register(conn, request)?),
        ClientOp::SyncFiles(batch) => {
            let results = engine.bridge().sync_files(conn, batch)?;
            Ok(json!({ "results": to_json(&results)? }))
        }
        ClientOp::PullFiles(request) => {
            let files = engine.bridge().pull_files(conn, &request)?;
            Ok(json!({ "files": to_json(&files)? }))
        }
        ClientOp::ExecuteCommand(request) => {
            to_json(&engine.bridge().execute_command(conn, request).await?)
        }
        ClientOp::GitOperation(request) => {
            to_json(&engine.bridge().git_operation(conn, request).await?)
        }

        // Deploy
        ClientOp::StartDeployment(request) => {
            let user = engine.registry().identity(conn)?;
            let deployment = engine.deploy().start(&user.id, request)?;
            to_json(&DeploymentResponse::from(deployment))
        }
        ClientOp::CancelDeployment { deployment_id } => {
            let user = engine.registry().identity(conn)?;
            let deployment = engine.deploy().cancel(&user.id, &deployment_id)?;
            to_json(&DeploymentResponse::from(deployment))
        }
        ClientOp::GetStatus { deployment_id } => {
            let user = engine.registry().identity(conn)?;
            let deployment = engine.deploy().get_status(&user.id, &deployment_id)?;
            to_json(&DeploymentResponse::from(deployment))
        }
        ClientOp::DeploymentHistory { project_id, limit } => {
            let user = engine.registry().identity(conn)?;
            let deployments: Vec<DeploymentResponse> = engine
                .deploy()
                .history(&user.id, &project_id, limit)?
                .into_iter()
                .map(DeploymentResponse::from)
                .collect();
            to_json(&deployments)
        }
    }
}
