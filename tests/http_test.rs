mod common;

use std::sync::Arc;
use std::time::Duration;

use axum::body::{to_bytes, Body};
use axum::http::{header, Request, StatusCode};
use axum::Router;
use common::*;
use serde_json::{json, Value};
use sheets_bridge::config::{self, Config};
use sheets_bridge::db::SqliteHost;
use sheets_bridge::dispatch::{FollowUpHandler, FollowUpRequest};
use sheets_bridge::handlers::{router, AppState};
use sheets_bridge::host::FormsHost;
use sheets_bridge::model::UploadFieldSelector;
use sheets_bridge::nonce::UPLOAD_ACTION;
use tempfile::TempDir;
use tower::ServiceExt;

struct TestApp {
    router: Router,
    host: Arc<SqliteHost>,
    state: Arc<AppState>,
    transport: Arc<RecordingTransport>,
    uploads: TempDir,
}

async fn test_app(authorized: bool) -> TestApp {
    let host = setup_host().await;
    if authorized {
        authorize(&host).await;
    }
    let tokens = token_manager(host.clone());
    let drive = Arc::new(RecordingDrive::default());
    let uploads = tempfile::tempdir().unwrap();
    let transport = Arc::new(RecordingTransport::default());
    let cfg: Config = serde_yaml::from_str(config::example()).unwrap();

    let follow_up = FollowUpHandler::new(
        host.clone(),
        processor(host.clone(), tokens.clone(), drive.clone(), uploads.path()),
        signer(),
        Duration::from_secs(5),
    );
    let state = Arc::new(AppState {
        cfg,
        host: host.clone(),
        tokens,
        connector: Arc::new(FixedConnector(drive)),
        follow_up: Arc::new(follow_up),
        transport: transport.clone(),
        signer: signer(),
    });
    TestApp {
        router: router(state.clone()),
        host,
        state,
        transport,
        uploads,
    }
}

async fn send(app: &TestApp, req: Request<Body>) -> (StatusCode, Option<String>, Vec<u8>) {
    let res = app.router.clone().oneshot(req).await.unwrap();
    let status = res.status();
    let location = res
        .headers()
        .get(header::LOCATION)
        .map(|v| v.to_str().unwrap().to_string());
    let body = to_bytes(res.into_body(), usize::MAX).await.unwrap().to_vec();
    (status, location, body)
}

async fn get_json(app: &TestApp, uri: &str) -> Value {
    let req = Request::builder().uri(uri).body(Body::empty()).unwrap();
    let (status, _, body) = send(app, req).await;
    assert_eq!(status, StatusCode::OK);
    serde_json::from_slice(&body).unwrap()
}

fn post_json(uri: &str, body: &Value) -> Request<Body> {
    Request::builder()
        .method("POST")
        .uri(uri)
        .header(header::CONTENT_TYPE, "application/json")
        .body(Body::from(body.to_string()))
        .unwrap()
}

#[tokio::test]
async fn field_map_requires_sheet_id() {
    let app = test_app(true).await;
    let body = get_json(&app, "/ajax/field-map").await;
    assert_eq!(body, json!({ "success": false, "data": { "error": "Could not get sheet ID" } }));
}

#[tokio::test]
async fn field_map_lists_header_columns() {
    let app = test_app(true).await;
    let body = get_json(&app, "/ajax/field-map?sheet_id=sheet-1").await;
    assert_eq!(body["success"], true);
    assert_eq!(
        body["data"]["choices"],
        json!([
            { "label": "Name", "value": "0", "name": "0" },
            { "label": "CV", "value": "1", "name": "1" },
        ])
    );
    let html = body["data"]["html"].as_str().unwrap();
    assert!(html.contains("<option value=\"1\">CV</option>"));
}

#[tokio::test]
async fn sheet_choices_start_with_placeholder() {
    let app = test_app(true).await;
    let body = get_json(&app, "/ajax/sheets").await;
    let choices = body["data"]["choices"].as_array().unwrap();
    assert_eq!(choices.len(), 3);
    assert_eq!(choices[0], json!({ "label": "- Select a Sheet -", "value": "" }));
    assert_eq!(choices[1], json!({ "label": "Leads", "value": "sheet-1" }));

    let unauthorized = test_app(false).await;
    let body = get_json(&unauthorized, "/ajax/sheets").await;
    assert_eq!(body["data"]["choices"].as_array().unwrap().len(), 1);
}

#[tokio::test]
async fn deferred_rejects_forged_or_malformed_calls() {
    let app = test_app(true).await;
    let form = application_form(7);
    let feeds = install(
        &app.host,
        &form,
        vec![feed(7, "CV", UploadFieldSelector::Field(1), "/cv")],
    )
    .await;
    let forged = FollowUpRequest {
        action: UPLOAD_ACTION.into(),
        feed: feeds[0].clone(),
        entry_id: 1,
        form_id: 7,
        position: 0,
        is_last_feed: true,
        nonce: "0123456789".into(),
        notification_events: None,
    };

    let (status, _, body) = send(&app, post_json("/deferred", &serde_json::to_value(&forged).unwrap())).await;
    assert_eq!(status, StatusCode::FORBIDDEN);
    assert!(body.is_empty());

    let req = Request::builder()
        .method("POST")
        .uri("/deferred")
        .body(Body::from("action=sheets_bridge_upload"))
        .unwrap();
    let (status, _, body) = send(&app, req).await;
    assert_eq!(status, StatusCode::FORBIDDEN);
    assert!(body.is_empty());
}

#[tokio::test]
async fn deferred_processes_signed_call() {
    let app = test_app(true).await;
    let form = application_form(8);
    let feeds = install(
        &app.host,
        &form,
        vec![feed(8, "CV", UploadFieldSelector::Field(1), "/cv")],
    )
    .await;
    let cv = local_upload(app.uploads.path(), "cv.pdf", "cv");
    let entry = app.host.create_entry(8, values(&[(1, &cv)])).await.unwrap();

    let request = FollowUpRequest {
        action: UPLOAD_ACTION.into(),
        feed: feeds[0].clone(),
        entry_id: entry.id,
        form_id: 8,
        position: 0,
        is_last_feed: true,
        nonce: app.state.signer.create(),
        notification_events: Some(vec!["form_submission".into()]),
    };
    let (status, _, body) = send(&app, post_json("/deferred", &serde_json::to_value(&request).unwrap())).await;
    assert_eq!(status, StatusCode::OK);
    let body: Value = serde_json::from_slice(&body).unwrap();
    assert_eq!(body, json!({ "reconciled": true, "errors": [] }));

    let stored = app.host.get_entry(entry.id).await.unwrap().unwrap();
    assert!(stored.value(1).starts_with("https://drive.google.com/file/d/"));
}

#[tokio::test]
async fn submission_responds_then_starts_follow_ups() {
    let app = test_app(true).await;
    let form = application_form(9);
    install(
        &app.host,
        &form,
        vec![feed(9, "CV", UploadFieldSelector::Field(1), "/cv")],
    )
    .await;
    let cv = local_upload(app.uploads.path(), "cv.pdf", "cv");

    let (status, _, body) = send(
        &app,
        post_json("/submissions", &json!({ "form_id": 9, "values": { "1": cv, "2": "Ada" } })),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    let body: Value = serde_json::from_slice(&body).unwrap();
    assert_eq!(body["queued"], 1);
    assert_eq!(body["suppressed"], json!(["form_submission", "payment_completed"]));
    assert_eq!(body["sent"], json!([]));

    let mut sent = Vec::new();
    for _ in 0..100 {
        sent = app.transport.sent();
        if !sent.is_empty() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert_eq!(sent.len(), 1);
    assert!(sent[0].is_last_feed);
    assert_eq!(sent[0].entry_id, body["entry_id"].as_i64().unwrap());
    assert!(app.state.signer.verify(&sent[0].nonce).is_some());

    let (status, _, _) = send(&app, post_json("/submissions", &json!({ "form_id": 404 }))).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn oauth_callback_reports_errors_on_return_page() {
    let app = test_app(true).await;

    let req = Request::builder()
        .uri("/auth/callback?error=access_denied")
        .body(Body::empty())
        .unwrap();
    let (status, location, _) = send(&app, req).await;
    assert_eq!(status, StatusCode::SEE_OTHER);
    assert_eq!(
        location.as_deref(),
        Some("http://127.0.0.1:8080/settings?auth=error&message=access_denied")
    );

    let req = Request::builder()
        .uri("/auth/callback?code=stale")
        .body(Body::empty())
        .unwrap();
    let (status, location, _) = send(&app, req).await;
    assert_eq!(status, StatusCode::SEE_OTHER);
    let location = location.unwrap();
    assert!(location.starts_with("http://127.0.0.1:8080/settings?auth=error&message="));
    assert!(location.contains("expired"));

    let body = get_json(&app, "/auth/url").await;
    assert_eq!(body["url"], "https://accounts.example/consent");
}

#[tokio::test]
async fn deauthorize_clears_token() {
    let app = test_app(true).await;
    assert!(app.state.tokens.has_token().await.unwrap());

    let req = Request::builder()
        .uri("/auth/deauthorize")
        .body(Body::empty())
        .unwrap();
    let (status, _, _) = send(&app, req).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    let req = Request::builder()
        .uri("/auth/deauthorize?deauth=1")
        .body(Body::empty())
        .unwrap();
    let (status, location, _) = send(&app, req).await;
    assert_eq!(status, StatusCode::SEE_OTHER);
    assert_eq!(
        location.as_deref(),
        Some("http://127.0.0.1:8080/settings?deauth=success")
    );
    assert!(!app.state.tokens.has_token().await.unwrap());
}
