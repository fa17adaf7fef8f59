use std::path::Path;

use cuttlestore::Cuttlestore;
use futures::StreamExt;
use serde::{Deserialize, Serialize};
use tokio::fs::{self, OpenOptions};
use tracing::{debug, warn};

use crate::{
    error::{DownloadError, Result},
    model::{ActivityEntry, DownloadRecord, PartialDownloadInfo},
    settings::DownloadSettings,
};

const DOWNLOAD_PREFIX: &str = "download:";
const ACTIVITY_PREFIX: &str = "activity:";
const SETTINGS_KEY: &str = "settings";

/// A download and its checkpoint, written together so the status and the
/// partial byte count never disagree after a crash.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoredDownload {
    pub record: DownloadRecord,
    pub checkpoint: Option<PartialDownloadInfo>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoredSettings {
    pub settings: DownloadSettings,
    pub download_directory: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Stored {
    Download(StoredDownload),
    Activity(ActivityEntry),
    Settings(StoredSettings),
}

fn store_error(err: impl std::fmt::Display) -> DownloadError {
    DownloadError::Store(err.to_string())
}

/// Durable record of downloads, activity and settings. All three share one
/// cuttlestore, keyed by prefix.
#[derive(Debug, Clone)]
pub struct Store {
    inner: Cuttlestore<Stored>,
}

impl Store {
    pub async fn open(connection: &str) -> Result<Self> {
        // SQLite won't create the database file on its own.
        if let Some(path) = connection.strip_prefix("sqlite://") {
            let path = Path::new(path);
            if let Some(parent) = path.parent() {
                fs::create_dir_all(parent).await?;
            }
            OpenOptions::new()
                .write(true)
                .create(true)
                .open(path)
                .await?;
        }
        debug!("Opening store at {}", connection);
        let inner = Cuttlestore::new(connection.to_string())
            .await
            .map_err(store_error)?;
        Ok(Store { inner })
    }

    async fn scan(&self) -> Result<Vec<Stored>> {
        let entries = self.inner.scan().await.map_err(store_error)?;
        let entries = entries.collect::<Vec<_>>().await;
        Ok(entries
            .into_iter()
            .filter_map(|entry| match entry {
                Ok((_key, value)) => Some(value),
                Err(err) => {
                    warn!("Skipping unreadable store entry: {}", err);
                    None
                }
            })
            .collect())
    }

    pub async fn put_download(&self, download: &StoredDownload) -> Result<()> {
        self.inner
            .put(
                format!("{}{}", DOWNLOAD_PREFIX, download.record.id),
                &Stored::Download(download.clone()),
            )
            .await
            .map_err(store_error)
    }

    pub async fn delete_download(&self, id: &str) -> Result<()> {
        self.inner
            .delete(format!("{}{}", DOWNLOAD_PREFIX, id))
            .await
            .map_err(store_error)
    }

    /// All stored downloads in creation order.
    pub async fn load_downloads(&self) -> Result<Vec<StoredDownload>> {
        let mut downloads = self
            .scan()
            .await?
            .into_iter()
            .filter_map(|value| match value {
                Stored::Download(download) => Some(download),
                _ => None,
            })
            .collect::<Vec<_>>();
        downloads.sort_by(|a, b| a.record.id.cmp(&b.record.id));
        Ok(downloads)
    }

    pub async fn put_activity(&self, entry: &ActivityEntry) -> Result<()> {
        self.inner
            .put(
                format!("{}{}", ACTIVITY_PREFIX, entry.id),
                &Stored::Activity(entry.clone()),
            )
            .await
            .map_err(store_error)
    }

    pub async fn delete_activity(&self, id: &str) -> Result<()> {
        self.inner
            .delete(format!("{}{}", ACTIVITY_PREFIX, id))
            .await
            .map_err(store_error)
    }

    /// All stored activity entries, oldest first.
    pub async fn load_activities(&self) -> Result<Vec<ActivityEntry>> {
        let mut entries = self
            .scan()
            .await?
            .into_iter()
            .filter_map(|value| match value {
                Stored::Activity(entry) => Some(entry),
                _ => None,
            })
            .collect::<Vec<_>>();
        entries.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(entries)
    }

    pub async fn put_settings(&self, settings: &StoredSettings) -> Result<()> {
        self.inner
            .put(SETTINGS_KEY.to_string(), &Stored::Settings(settings.clone()))
            .await
            .map_err(store_error)
    }

    pub async fn load_settings(&self) -> Result<Option<StoredSettings>> {
        match self
            .inner
            .get(SETTINGS_KEY.to_string())
            .await
            .map_err(store_error)?
        {
            Some(Stored::Settings(settings)) => Ok(Some(settings)),
            _ => Ok(None),
        }
    }
}
