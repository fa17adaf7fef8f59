#![allow(dead_code)]

use std::future::Future;
use std::time::Duration;

use drogue_dm::{DownloadManager, DownloadRecord, DownloadStatus, EngineConfig};
use tempfile::TempDir;
use wiremock::{
    matchers::{method, path},
    Mock, MockServer, Request, Respond, ResponseTemplate,
};

pub fn store_url(dir: &TempDir) -> String {
    format!("sqlite://{}", dir.path().join("store.sqlite").display())
}

/// Short intervals so tests see progress and checkpoints quickly. The stall
/// sweep is pushed far out, tests trigger it by hand.
pub fn test_config(dir: &TempDir) -> EngineConfig {
    let mut config = EngineConfig::new(store_url(dir), dir.path().join("downloads"));
    config.progress_interval = Duration::from_millis(20);
    config.checkpoint_interval = Duration::from_millis(20);
    config.stall_sweep_interval = Duration::from_secs(3600);
    config
}

pub async fn launch(dir: &TempDir) -> DownloadManager {
    DownloadManager::launch(test_config(dir)).await.unwrap()
}

/// Deterministic content that makes misplaced bytes easy to spot.
pub fn body(len: usize) -> Vec<u8> {
    (0..len).map(|i| (i % 251) as u8).collect()
}

/// Poll `check` until it holds, failing the test after ten seconds.
pub async fn wait_for<F, Fut>(what: &str, mut check: F)
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    let deadline = tokio::time::Instant::now() + Duration::from_secs(10);
    while !check().await {
        if tokio::time::Instant::now() > deadline {
            panic!("Timed out waiting for {}", what);
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}

pub async fn wait_for_status(manager: &DownloadManager, id: &str, status: DownloadStatus) {
    wait_for(&format!("{} to be {}", id, status), move || async move {
        manager
            .download(id)
            .await
            .map(|record| record.status == status)
            .unwrap_or(false)
    })
    .await;
}

pub async fn record(manager: &DownloadManager, id: &str) -> DownloadRecord {
    manager.download(id).await.unwrap()
}

/// Serves a body and honours `Range: bytes=N-` with a 206.
pub struct RangeResponder {
    pub body: Vec<u8>,
}

impl Respond for RangeResponder {
    fn respond(&self, request: &Request) -> ResponseTemplate {
        let start = request
            .headers
            .get("range")
            .and_then(|value| value.to_str().ok())
            .and_then(|value| value.strip_prefix("bytes="))
            .and_then(|value| value.trim_end_matches('-').parse::<usize>().ok());
        match start {
            Some(start) if start < self.body.len() => ResponseTemplate::new(206)
                .insert_header(
                    "content-range",
                    format!(
                        "bytes {}-{}/{}",
                        start,
                        self.body.len() - 1,
                        self.body.len()
                    ),
                )
                .set_body_bytes(self.body[start..].to_vec()),
            _ => ResponseTemplate::new(200).set_body_bytes(self.body.clone()),
        }
    }
}

pub async fn serve(server: &MockServer, file: &str, body: Vec<u8>) {
    Mock::given(method("GET"))
        .and(path(format!("/{}", file)))
        .respond_with(RangeResponder { body })
        .mount(server)
        .await;
}

pub async fn serve_slowly(server: &MockServer, file: &str, body: Vec<u8>, delay: Duration) {
    Mock::given(method("GET"))
        .and(path(format!("/{}", file)))
        .respond_with(ResponseTemplate::new(200).set_body_bytes(body).set_delay(delay))
        .mount(server)
        .await;
}

/// Always answers with the whole body, as servers without range support do.
pub async fn serve_ignoring_ranges(server: &MockServer, file: &str, body: Vec<u8>) {
    Mock::given(method("GET"))
        .and(path(format!("/{}", file)))
        .respond_with(ResponseTemplate::new(200).set_body_bytes(body))
        .mount(server)
        .await;
}

/// Range headers of every request the server has seen.
pub async fn range_headers(server: &MockServer) -> Vec<String> {
    server
        .received_requests()
        .await
        .unwrap_or_default()
        .iter()
        .filter_map(|request| request.headers.get("range"))
        .filter_map(|value| value.to_str().ok().map(str::to_string))
        .collect()
}
