mod common;

use actix_web::{
    http::StatusCode,
    test::{self, TestRequest},
    web::Data,
    App,
};
use common::*;
use drogue_dm::{server::routes, ActionType, ActivityEntry, DownloadRecord, DownloadSettings, DownloadStatus};
use serde_json::{json, Value};
use wiremock::MockServer;

#[actix_web::test]
async fn downloads_can_be_started_and_listed() {
    let dir = tempfile::tempdir().unwrap();
    let server = MockServer::start().await;
    serve(&server, "a.bin", body(500)).await;
    let manager = launch(&dir).await;
    let app = test::init_service(
        App::new()
            .app_data(Data::new(manager.clone()))
            .configure(routes),
    )
    .await;

    let req = TestRequest::post()
        .uri("/downloads")
        .set_json(json!({ "url": format!("{}/a.bin", server.uri()), "filePath": "a.bin" }))
        .to_request();
    let resp = test::call_service(&app, req).await;
    assert_eq!(resp.status(), StatusCode::CREATED);
    let created: Value = test::read_body_json(resp).await;
    let id = created["id"].as_str().unwrap().to_string();
    wait_for_status(&manager, &id, DownloadStatus::Completed).await;

    let req = TestRequest::get().uri("/downloads").to_request();
    let records: Vec<DownloadRecord> = test::call_and_read_body_json(&app, req).await;
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].id, id);

    let req = TestRequest::get()
        .uri(&format!("/downloads/{}", id))
        .to_request();
    let record: Value = test::call_and_read_body_json(&app, req).await;
    assert_eq!(record["status"], "completed");
    assert_eq!(record["downloadedSize"], 500);

    // Completed downloads can't be paused.
    let req = TestRequest::post()
        .uri(&format!("/downloads/{}/pause", id))
        .to_request();
    let resp = test::call_service(&app, req).await;
    assert_eq!(resp.status(), StatusCode::CONFLICT);

    let req = TestRequest::get().uri("/stats").to_request();
    let stats: Value = test::call_and_read_body_json(&app, req).await;
    assert_eq!(stats["completedDownloads"], 1);
    assert_eq!(stats["totalDownloadedSize"], 500);

    let req = TestRequest::get()
        .uri("/files/exists?path=a.bin")
        .to_request();
    let exists: Value = test::call_and_read_body_json(&app, req).await;
    assert_eq!(exists["exists"], true);

    let req = TestRequest::post()
        .uri("/downloads/clear-completed")
        .to_request();
    let cleared: Value = test::call_and_read_body_json(&app, req).await;
    assert_eq!(cleared["count"], 1);
}

#[actix_web::test]
async fn bad_requests_get_error_statuses() {
    let dir = tempfile::tempdir().unwrap();
    let manager = launch(&dir).await;
    let app = test::init_service(
        App::new()
            .app_data(Data::new(manager.clone()))
            .configure(routes),
    )
    .await;

    let req = TestRequest::post()
        .uri("/downloads")
        .set_json(json!({ "url": "", "filePath": "a.bin" }))
        .to_request();
    let resp = test::call_service(&app, req).await;
    assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
    let error: Value = test::read_body_json(resp).await;
    assert!(error["error"].as_str().unwrap().contains("url"));

    let req = TestRequest::get().uri("/downloads/missing").to_request();
    let resp = test::call_service(&app, req).await;
    assert_eq!(resp.status(), StatusCode::NOT_FOUND);

    let req = TestRequest::post()
        .uri("/downloads/missing/explode")
        .to_request();
    let resp = test::call_service(&app, req).await;
    assert_eq!(resp.status(), StatusCode::BAD_REQUEST);

    let req = TestRequest::post()
        .uri("/downloads/bulk/pause")
        .set_json(json!({ "ids": ["missing"] }))
        .to_request();
    let outcome: Value = test::call_and_read_body_json(&app, req).await;
    assert_eq!(outcome["succeeded"], json!([]));
    assert_eq!(outcome["skipped"][0]["id"], "missing");
}

#[actix_web::test]
async fn settings_and_directory_can_be_changed() {
    let dir = tempfile::tempdir().unwrap();
    let manager = launch(&dir).await;
    let app = test::init_service(
        App::new()
            .app_data(Data::new(manager.clone()))
            .configure(routes),
    )
    .await;

    let req = TestRequest::get().uri("/settings").to_request();
    let settings: DownloadSettings = test::call_and_read_body_json(&app, req).await;
    assert_eq!(settings, DownloadSettings::default());

    let req = TestRequest::patch()
        .uri("/settings")
        .set_json(json!({ "speedLimitBytesPerSec": 1000000, "divideSpeedEnabled": true }))
        .to_request();
    let settings: DownloadSettings = test::call_and_read_body_json(&app, req).await;
    assert_eq!(settings.speed_limit_bytes_per_sec, 1_000_000);
    assert!(settings.divide_speed_enabled);
    assert_eq!(settings.max_simultaneous_downloads, 3);

    let req = TestRequest::patch()
        .uri("/settings")
        .set_json(json!({ "maxSimultaneousDownloads": 11 }))
        .to_request();
    let resp = test::call_service(&app, req).await;
    assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
    assert_eq!(manager.settings().max_simultaneous_downloads, 3);

    let target = dir.path().join("target");
    let req = TestRequest::put()
        .uri("/download-directory")
        .set_json(json!({ "path": target.display().to_string() }))
        .to_request();
    let resp = test::call_service(&app, req).await;
    assert_eq!(resp.status(), StatusCode::OK);

    let req = TestRequest::get().uri("/download-directory").to_request();
    let directory: Value = test::call_and_read_body_json(&app, req).await;
    assert_eq!(directory["path"], target.display().to_string());
}

#[actix_web::test]
async fn activities_can_be_recorded_and_cleared() {
    let dir = tempfile::tempdir().unwrap();
    let manager = launch(&dir).await;
    let app = test::init_service(
        App::new()
            .app_data(Data::new(manager.clone()))
            .configure(routes),
    )
    .await;

    let req = TestRequest::post()
        .uri("/activities")
        .set_json(json!({ "details": "opened the download list" }))
        .to_request();
    let resp = test::call_service(&app, req).await;
    assert_eq!(resp.status(), StatusCode::CREATED);

    let req = TestRequest::get().uri("/activities").to_request();
    let entries: Vec<ActivityEntry> = test::call_and_read_body_json(&app, req).await;
    assert_eq!(entries.len(), 1);
    assert_eq!(entries[0].action_type, ActionType::UserInteraction);
    assert_eq!(
        entries[0].details.as_deref(),
        Some("opened the download list")
    );

    let req = TestRequest::delete().uri("/activities").to_request();
    let cleared: Value = test::call_and_read_body_json(&app, req).await;
    assert_eq!(cleared["count"], 1);
    assert!(manager.activities().await.is_empty());
}
