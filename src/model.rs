//! Records shared between the engine, the store and the HTTP surface.

use std::fmt;
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};

pub(crate) fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or_default()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DownloadStatus {
    Queued,
    Downloading,
    Paused,
    Completed,
    Error,
    Cancelled,
}

impl fmt::Display for DownloadStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DownloadStatus::Queued => write!(f, "queued"),
            DownloadStatus::Downloading => write!(f, "downloading"),
            DownloadStatus::Paused => write!(f, "paused"),
            DownloadStatus::Completed => write!(f, "completed"),
            DownloadStatus::Error => write!(f, "error"),
            DownloadStatus::Cancelled => write!(f, "cancelled"),
        }
    }
}

/// Why a download ended up in `error`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FailureKind {
    Transport,
    /// The partial file no longer matches its checkpoint, only a restart helps.
    Integrity,
    Capacity,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DownloadRecord {
    pub id: String,
    pub url: String,
    pub file_path: String,
    pub file_name: String,
    pub file_extension: String,
    pub status: DownloadStatus,
    /// 0 while the size is unknown.
    pub total_size: u64,
    pub downloaded_size: u64,
    pub progress: Option<f64>,
    /// Bytes per second.
    pub speed: f64,
    /// Seconds.
    pub time_remaining: Option<u64>,
    pub start_time: Option<u64>,
    pub error: Option<String>,
    pub failure_kind: Option<FailureKind>,
}

impl DownloadRecord {
    pub fn new(id: String, url: String, file_path: String, file_name: String) -> Self {
        let file_extension = file_extension(&file_name);
        DownloadRecord {
            id,
            url,
            file_path,
            file_name,
            file_extension,
            status: DownloadStatus::Queued,
            total_size: 0,
            downloaded_size: 0,
            progress: None,
            speed: 0f64,
            time_remaining: None,
            start_time: None,
            error: None,
            failure_kind: None,
        }
    }

    /// Recalculate `progress` and `time_remaining` from the byte counts and speed.
    pub fn refresh_derived(&mut self) {
        if self.status != DownloadStatus::Downloading {
            self.speed = 0f64;
        }
        self.progress = (self.total_size > 0)
            .then(|| self.downloaded_size as f64 / self.total_size as f64 * 100f64);
        self.time_remaining = if self.total_size > 0 && self.speed > 0f64 {
            let remaining = self.total_size.saturating_sub(self.downloaded_size);
            Some((remaining as f64 / self.speed).ceil() as u64)
        } else {
            None
        };
    }

    pub fn is_active(&self) -> bool {
        matches!(
            self.status,
            DownloadStatus::Downloading | DownloadStatus::Paused | DownloadStatus::Queued
        )
    }
}

fn file_extension(file_name: &str) -> String {
    match file_name.rsplit_once('.') {
        Some((stem, ext)) if !stem.is_empty() => ext.to_lowercase(),
        _ => String::new(),
    }
}

/// Durable checkpoint of the bytes written so far.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PartialDownloadInfo {
    pub id: String,
    pub file_path: String,
    pub downloaded_bytes: u64,
    pub total_bytes: u64,
    pub last_modified: u64,
    /// Hex SHA-256 of the first `downloaded_bytes` bytes of the file.
    pub checksum: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DownloadStats {
    pub total_downloads: usize,
    pub active_downloads: usize,
    pub completed_downloads: usize,
    pub total_downloaded_size: u64,
    pub average_speed: f64,
}

impl DownloadStats {
    pub fn from_records<'a>(records: impl IntoIterator<Item = &'a DownloadRecord>) -> Self {
        let mut stats = DownloadStats::default();
        let mut downloading = 0usize;
        let mut speed_sum = 0f64;
        for record in records {
            stats.total_downloads += 1;
            if record.is_active() {
                stats.active_downloads += 1;
            }
            match record.status {
                DownloadStatus::Completed => {
                    stats.completed_downloads += 1;
                    stats.total_downloaded_size += record.downloaded_size;
                }
                DownloadStatus::Downloading => {
                    downloading += 1;
                    speed_sum += record.speed;
                }
                _ => {}
            }
        }
        if downloading > 0 {
            stats.average_speed = speed_sum / downloading as f64;
        }
        stats
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ActionType {
    DownloadStarted,
    DownloadCompleted,
    DownloadPaused,
    DownloadResumed,
    DownloadCancelled,
    DownloadError,
    FileAdded,
    StatusChanged,
    UserInteraction,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ActivityEntry {
    pub id: String,
    pub timestamp: u64,
    pub action_type: ActionType,
    pub file_name: Option<String>,
    pub identifier: Option<String>,
    pub status: Option<DownloadStatus>,
    pub details: Option<String>,
}

/// An activity entry that has not been assigned an id and timestamp yet.
#[derive(Debug, Clone)]
pub struct NewActivity {
    pub action_type: ActionType,
    pub file_name: Option<String>,
    pub identifier: Option<String>,
    pub status: Option<DownloadStatus>,
    pub details: Option<String>,
}

impl NewActivity {
    pub fn new(action_type: ActionType) -> Self {
        NewActivity {
            action_type,
            file_name: None,
            identifier: None,
            status: None,
            details: None,
        }
    }

    pub fn for_download(mut self, record: &DownloadRecord) -> Self {
        self.file_name = Some(record.file_name.clone());
        self.identifier = Some(record.id.clone());
        self.status = Some(record.status);
        self
    }

    pub fn details(mut self, details: impl Into<String>) -> Self {
        self.details = Some(details.into());
        self
    }
}

/// Request to add a new download.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NewDownload {
    pub url: String,
    pub file_path: String,
    #[serde(default)]
    pub file_name: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BulkSkip {
    pub id: String,
    pub reason: String,
}

/// Per-id outcome of a bulk command. A failure on one id never aborts the rest.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct BulkOutcome {
    pub succeeded: Vec<String>,
    pub skipped: Vec<BulkSkip>,
}

/// Result of the start-up sweep over downloads interrupted by a crash.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct RecoveryReport {
    pub resumed: Vec<String>,
    pub failed: Vec<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(status: DownloadStatus, downloaded: u64, total: u64, speed: f64) -> DownloadRecord {
        let mut record = DownloadRecord::new(
            "id".to_string(),
            "http://example.com/a.zip".to_string(),
            "/tmp/a.zip".to_string(),
            "a.zip".to_string(),
        );
        record.status = status;
        record.downloaded_size = downloaded;
        record.total_size = total;
        record.speed = speed;
        record
    }

    #[test]
    fn progress_is_undefined_without_a_total() {
        let mut r = record(DownloadStatus::Downloading, 100, 0, 50f64);
        r.refresh_derived();
        assert_eq!(r.progress, None);
        assert_eq!(r.time_remaining, None);
    }

    #[test]
    fn derived_fields_follow_byte_counts() {
        let mut r = record(DownloadStatus::Downloading, 250, 1000, 100f64);
        r.refresh_derived();
        assert_eq!(r.progress, Some(25f64));
        assert_eq!(r.time_remaining, Some(8));
    }

    #[test]
    fn speed_decays_outside_downloading() {
        let mut r = record(DownloadStatus::Paused, 250, 1000, 100f64);
        r.refresh_derived();
        assert_eq!(r.speed, 0f64);
        assert_eq!(r.time_remaining, None);
    }

    #[test]
    fn extension_is_taken_from_the_name() {
        assert_eq!(file_extension("game.tar.GZ"), "gz");
        assert_eq!(file_extension(".bashrc"), "");
        assert_eq!(file_extension("README"), "");
    }

    #[test]
    fn stats_cover_active_and_completed() {
        let records = vec![
            record(DownloadStatus::Downloading, 10, 100, 200f64),
            record(DownloadStatus::Downloading, 10, 100, 100f64),
            record(DownloadStatus::Queued, 0, 0, 0f64),
            record(DownloadStatus::Paused, 5, 10, 0f64),
            record(DownloadStatus::Completed, 700, 700, 0f64),
            record(DownloadStatus::Error, 3, 10, 0f64),
        ];
        let stats = DownloadStats::from_records(&records);
        assert_eq!(stats.total_downloads, 6);
        assert_eq!(stats.active_downloads, 4);
        assert_eq!(stats.completed_downloads, 1);
        assert_eq!(stats.total_downloaded_size, 700);
        assert_eq!(stats.average_speed, 150f64);
    }
}
