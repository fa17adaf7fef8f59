//! A download manager: a persistent queue of HTTP downloads with admission
//! control, shared speed limits, pause and resume through range requests, and
//! crash recovery from checksummed checkpoints.

pub mod activity;
pub mod avg_range;
pub mod config;
pub mod coordinator;
pub mod downloader;
pub mod engine;
pub mod error;
pub mod files;
pub mod model;
pub mod rate_limiter;
pub mod server;
pub mod settings;
pub mod store;

pub use config::{EngineConfig, ServerConfig};
pub use engine::{Command, DownloadManager};
pub use error::{DownloadError, Result};
pub use model::{
    ActionType, ActivityEntry, BulkOutcome, DownloadRecord, DownloadStats, DownloadStatus,
    FailureKind, PartialDownloadInfo,
};
pub use settings::{DownloadSettings, SettingsPatch};
