use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::{fs, sync::watch};
use tracing::info;

use crate::{
    error::{DownloadError, Result},
    store::{Store, StoredSettings},
};

pub const MIN_SIMULTANEOUS_DOWNLOADS: usize = 1;
pub const MAX_SIMULTANEOUS_DOWNLOADS: usize = 10;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DownloadSettings {
    /// 0 means unlimited.
    pub speed_limit_bytes_per_sec: u64,
    /// Share the speed limit between running downloads instead of giving
    /// each of them the full limit.
    pub divide_speed_enabled: bool,
    pub max_simultaneous_downloads: usize,
    pub disable_range_requests: bool,
}

impl Default for DownloadSettings {
    fn default() -> Self {
        DownloadSettings {
            speed_limit_bytes_per_sec: 0,
            divide_speed_enabled: false,
            max_simultaneous_downloads: 3,
            disable_range_requests: false,
        }
    }
}

/// A partial settings update, fields left out stay as they are.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SettingsPatch {
    pub speed_limit_bytes_per_sec: Option<u64>,
    pub divide_speed_enabled: Option<bool>,
    pub max_simultaneous_downloads: Option<usize>,
    pub disable_range_requests: Option<bool>,
}

impl DownloadSettings {
    pub fn apply(&self, patch: &SettingsPatch) -> Result<DownloadSettings> {
        let settings = DownloadSettings {
            speed_limit_bytes_per_sec: patch
                .speed_limit_bytes_per_sec
                .unwrap_or(self.speed_limit_bytes_per_sec),
            divide_speed_enabled: patch
                .divide_speed_enabled
                .unwrap_or(self.divide_speed_enabled),
            max_simultaneous_downloads: patch
                .max_simultaneous_downloads
                .unwrap_or(self.max_simultaneous_downloads),
            disable_range_requests: patch
                .disable_range_requests
                .unwrap_or(self.disable_range_requests),
        };
        settings.validate()?;
        Ok(settings)
    }

    pub fn validate(&self) -> Result<()> {
        if !(MIN_SIMULTANEOUS_DOWNLOADS..=MAX_SIMULTANEOUS_DOWNLOADS)
            .contains(&self.max_simultaneous_downloads)
        {
            return Err(DownloadError::Validation(format!(
                "maxSimultaneousDownloads must be between {} and {}, got {}",
                MIN_SIMULTANEOUS_DOWNLOADS, MAX_SIMULTANEOUS_DOWNLOADS, self.max_simultaneous_downloads
            )));
        }
        Ok(())
    }
}

/// Holds the download policy and the download directory. Readers subscribe
/// to changes instead of polling a global.
#[derive(Debug, Clone)]
pub struct SettingsStore {
    settings: Arc<watch::Sender<DownloadSettings>>,
    download_directory: Arc<watch::Sender<PathBuf>>,
    store: Store,
}

impl SettingsStore {
    pub async fn load(store: Store, default_directory: PathBuf) -> Result<Self> {
        let (settings, download_directory) = match store.load_settings().await? {
            Some(stored) if stored.settings.validate().is_ok() => {
                (stored.settings, PathBuf::from(stored.download_directory))
            }
            _ => (DownloadSettings::default(), default_directory),
        };
        let (settings, _) = watch::channel(settings);
        let (download_directory, _) = watch::channel(download_directory);
        Ok(SettingsStore {
            settings: Arc::new(settings),
            download_directory: Arc::new(download_directory),
            store,
        })
    }

    pub fn get(&self) -> DownloadSettings {
        self.settings.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<DownloadSettings> {
        self.settings.subscribe()
    }

    pub async fn update(&self, patch: &SettingsPatch) -> Result<DownloadSettings> {
        let updated = self.get().apply(patch)?;
        // Readers only see settings that made it to the store.
        self.persist(&updated, &self.download_directory()).await?;
        self.settings.send_replace(updated.clone());
        info!("Download settings changed to {:?}", updated);
        Ok(updated)
    }

    pub fn download_directory(&self) -> PathBuf {
        self.download_directory.borrow().clone()
    }

    pub async fn set_download_directory(&self, path: &str) -> Result<PathBuf> {
        if path.trim().is_empty() {
            return Err(DownloadError::Validation(
                "download directory must not be empty".to_string(),
            ));
        }
        let path = PathBuf::from(path);
        fs::create_dir_all(&path).await?;
        self.persist(&self.get(), &path).await?;
        self.download_directory.send_replace(path.clone());
        info!("Download directory changed to {}", path.display());
        Ok(path)
    }

    async fn persist(&self, settings: &DownloadSettings, download_directory: &Path) -> Result<()> {
        self.store
            .put_settings(&StoredSettings {
                settings: settings.clone(),
                download_directory: download_directory.display().to_string(),
            })
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn patch_keeps_unset_fields() {
        let settings = DownloadSettings::default();
        let patched = settings
            .apply(&SettingsPatch {
                speed_limit_bytes_per_sec: Some(1_000_000),
                ..Default::default()
            })
            .unwrap();
        assert_eq!(patched.speed_limit_bytes_per_sec, 1_000_000);
        assert_eq!(
            patched.max_simultaneous_downloads,
            settings.max_simultaneous_downloads
        );
    }

    #[test]
    fn concurrency_cap_is_bounded() {
        let settings = DownloadSettings::default();
        for bad in [0, 11] {
            let err = settings
                .apply(&SettingsPatch {
                    max_simultaneous_downloads: Some(bad),
                    ..Default::default()
                })
                .unwrap_err();
            assert!(matches!(err, DownloadError::Validation(_)));
        }
        assert!(settings
            .apply(&SettingsPatch {
                max_simultaneous_downloads: Some(10),
                ..Default::default()
            })
            .is_ok());
    }

    #[tokio::test]
    async fn settings_survive_a_reload() {
        let dir = tempfile::tempdir().unwrap();
        let url = format!("sqlite://{}", dir.path().join("store.sqlite").display());
        let store = Store::open(&url).await.unwrap();
        let settings = SettingsStore::load(store.clone(), dir.path().join("downloads"))
            .await
            .unwrap();

        let mut changes = settings.subscribe();
        settings
            .update(&SettingsPatch {
                divide_speed_enabled: Some(true),
                max_simultaneous_downloads: Some(5),
                ..Default::default()
            })
            .await
            .unwrap();
        assert!(changes.has_changed().unwrap());
        assert!(changes.borrow_and_update().divide_speed_enabled);

        let elsewhere = dir.path().join("elsewhere");
        settings
            .set_download_directory(&elsewhere.display().to_string())
            .await
            .unwrap();
        assert!(elsewhere.is_dir());
        assert!(settings.set_download_directory("  ").await.is_err());
        assert_eq!(settings.download_directory(), elsewhere);

        let reloaded = SettingsStore::load(store, dir.path().join("downloads"))
            .await
            .unwrap();
        assert_eq!(reloaded.get().max_simultaneous_downloads, 5);
        assert_eq!(reloaded.download_directory(), elsewhere);
    }

    #[tokio::test]
    async fn failed_changes_are_not_published() {
        let dir = tempfile::tempdir().unwrap();
        let url = format!("sqlite://{}", dir.path().join("store.sqlite").display());
        let store = Store::open(&url).await.unwrap();
        let downloads = dir.path().join("downloads");
        let settings = SettingsStore::load(store.clone(), downloads.clone())
            .await
            .unwrap();
        let changes = settings.subscribe();

        // A directory can't be created below a regular file.
        let blocker = dir.path().join("file");
        std::fs::write(&blocker, b"not a directory").unwrap();
        let below_file = blocker.join("downloads");
        assert!(settings
            .set_download_directory(&below_file.display().to_string())
            .await
            .is_err());
        assert_eq!(settings.download_directory(), downloads);

        assert!(settings
            .update(&SettingsPatch {
                max_simultaneous_downloads: Some(0),
                ..Default::default()
            })
            .await
            .is_err());
        assert!(!changes.has_changed().unwrap());
        assert!(store.load_settings().await.unwrap().is_none());
    }
}
