use std::path::{Path, PathBuf};

use ractor::{call, cast, Actor, ActorRef};
use reqwest::Client;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, info, warn};

use crate::{
    activity::ActivityLog,
    config::EngineConfig,
    coordinator::{Coordinator, CoordinatorMsg},
    downloader::TransferTiming,
    error::{DownloadError, Result},
    files,
    model::{
        ActionType, ActivityEntry, BulkOutcome, BulkSkip, DownloadRecord, DownloadStats,
        NewActivity, NewDownload, RecoveryReport,
    },
    rate_limiter::RateLimiter,
    settings::{DownloadSettings, SettingsPatch, SettingsStore},
    store::Store,
};

fn unavailable(err: impl std::fmt::Debug) -> DownloadError {
    DownloadError::Unavailable(format!("{:?}", err))
}

/// Single-download commands that also come in bulk.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command {
    Pause,
    Resume,
    Cancel,
    CancelAndDelete,
}

impl Command {
    fn past_tense(&self) -> &'static str {
        match self {
            Command::Pause => "paused",
            Command::Resume => "resumed",
            Command::Cancel => "cancelled",
            Command::CancelAndDelete => "cancelled and deleted",
        }
    }
}

/// Handle to a running download engine. Cheap to clone, every clone talks to
/// the same coordinator.
#[derive(Debug, Clone)]
pub struct DownloadManager {
    coordinator: ActorRef<Coordinator>,
    settings: SettingsStore,
    activity: ActivityLog,
}

impl DownloadManager {
    /// Open the store, restore settings, activity and downloads, and start
    /// the coordinator. Interrupted downloads stay as they were until
    /// [`DownloadManager::resume_interrupted_downloads`] is called.
    pub async fn launch(config: EngineConfig) -> Result<Self> {
        let store = Store::open(&config.store_path).await?;
        let settings = SettingsStore::load(store.clone(), config.download_directory.clone()).await?;
        let activity = ActivityLog::load(store.clone(), config.activity_retention).await?;
        let downloads = store.load_downloads().await?;
        info!(
            "Loaded {} downloads from {}",
            downloads.len(),
            config.store_path
        );

        let coordinator = Coordinator {
            store,
            limiter: RateLimiter::new(settings.subscribe()),
            settings: settings.clone(),
            activity: activity.clone(),
            client: Client::new(),
            timing: TransferTiming {
                progress_interval: config.progress_interval,
                checkpoint_interval: config.checkpoint_interval,
            },
            stall_threshold: config.stall_threshold,
        };
        let (coordinator, _) = Actor::spawn(None, coordinator, downloads)
            .await
            .map_err(unavailable)?;

        let sweeper = coordinator.clone();
        let sweep_interval = config.stall_sweep_interval;
        tokio::spawn(async move {
            let mut ticks = interval(sweep_interval);
            ticks.set_missed_tick_behavior(MissedTickBehavior::Delay);
            // The first tick completes immediately.
            ticks.tick().await;
            loop {
                ticks.tick().await;
                if cast!(sweeper, CoordinatorMsg::SweepStalled).is_err() {
                    debug!("Coordinator stopped, ending the stall sweep");
                    break;
                }
            }
        });

        Ok(DownloadManager {
            coordinator,
            settings,
            activity,
        })
    }

    #[tracing::instrument(level = "debug", skip(self))]
    pub async fn start(&self, url: &str, file_path: &str, file_name: &str) -> Result<String> {
        let request = NewDownload {
            url: url.to_string(),
            file_path: file_path.to_string(),
            file_name: file_name.to_string(),
        };
        call!(self.coordinator, CoordinatorMsg::Start, request).map_err(unavailable)?
    }

    pub async fn command(&self, command: Command, id: &str) -> Result<()> {
        let id = id.to_string();
        let reply = match command {
            Command::Pause => call!(self.coordinator, CoordinatorMsg::Pause, id),
            Command::Resume => call!(self.coordinator, CoordinatorMsg::Resume, id),
            Command::Cancel => call!(self.coordinator, CoordinatorMsg::Cancel, id),
            Command::CancelAndDelete => {
                call!(self.coordinator, CoordinatorMsg::CancelAndDelete, id)
            }
        };
        reply.map_err(unavailable)?
    }

    #[tracing::instrument(level = "debug", skip(self))]
    pub async fn pause(&self, id: &str) -> Result<()> {
        self.command(Command::Pause, id).await
    }

    #[tracing::instrument(level = "debug", skip(self))]
    pub async fn resume(&self, id: &str) -> Result<()> {
        self.command(Command::Resume, id).await
    }

    #[tracing::instrument(level = "debug", skip(self))]
    pub async fn cancel(&self, id: &str) -> Result<()> {
        self.command(Command::Cancel, id).await
    }

    #[tracing::instrument(level = "debug", skip(self))]
    pub async fn cancel_and_delete(&self, id: &str) -> Result<()> {
        self.command(Command::CancelAndDelete, id).await
    }

    #[tracing::instrument(level = "debug", skip(self))]
    pub async fn restart(&self, id: &str) -> Result<()> {
        call!(self.coordinator, CoordinatorMsg::Restart, id.to_string()).map_err(unavailable)?
    }

    /// Apply `command` to every id. One id failing never stops the others,
    /// the failures are reported as skipped.
    #[tracing::instrument(level = "debug", skip(self))]
    pub async fn bulk(&self, command: Command, ids: &[String]) -> BulkOutcome {
        let mut outcome = BulkOutcome::default();
        for id in ids {
            match self.command(command, id).await {
                Ok(()) => outcome.succeeded.push(id.clone()),
                Err(err) => {
                    debug!("Bulk {:?} skipped {}: {}", command, id, err);
                    outcome.skipped.push(BulkSkip {
                        id: id.clone(),
                        reason: err.to_string(),
                    });
                }
            }
        }
        self.record_interaction(format!(
            "Bulk {} {} downloads",
            command.past_tense(),
            outcome.succeeded.len()
        ))
        .await;
        outcome
    }

    pub async fn pause_many(&self, ids: &[String]) -> BulkOutcome {
        self.bulk(Command::Pause, ids).await
    }

    pub async fn resume_many(&self, ids: &[String]) -> BulkOutcome {
        self.bulk(Command::Resume, ids).await
    }

    pub async fn cancel_many(&self, ids: &[String]) -> BulkOutcome {
        self.bulk(Command::Cancel, ids).await
    }

    pub async fn cancel_and_delete_many(&self, ids: &[String]) -> BulkOutcome {
        self.bulk(Command::CancelAndDelete, ids).await
    }

    /// Every known download, oldest first.
    pub async fn active_downloads(&self) -> Result<Vec<DownloadRecord>> {
        call!(self.coordinator, CoordinatorMsg::List).map_err(unavailable)
    }

    pub async fn download(&self, id: &str) -> Result<DownloadRecord> {
        call!(self.coordinator, CoordinatorMsg::Get, id.to_string())
            .map_err(unavailable)?
            .ok_or_else(|| DownloadError::NotFound(id.to_string()))
    }

    pub async fn stats(&self) -> Result<DownloadStats> {
        call!(self.coordinator, CoordinatorMsg::Stats).map_err(unavailable)
    }

    pub async fn clear_completed(&self) -> Result<usize> {
        call!(self.coordinator, CoordinatorMsg::ClearCompleted).map_err(unavailable)
    }

    /// Ids of the stalled downloads that turned out to be complete.
    pub async fn check_and_fix_stalled(&self) -> Result<Vec<String>> {
        call!(self.coordinator, CoordinatorMsg::CheckStalled).map_err(unavailable)
    }

    /// Pick up downloads a previous process left running. Safe to call more
    /// than once, downloads this process already runs are not touched.
    pub async fn resume_interrupted_downloads(&self) -> Result<RecoveryReport> {
        let report =
            call!(self.coordinator, CoordinatorMsg::ResumeInterrupted).map_err(unavailable)?;
        if !report.resumed.is_empty() || !report.failed.is_empty() {
            info!(
                "Resumed {} interrupted downloads, {} could not be resumed",
                report.resumed.len(),
                report.failed.len()
            );
        }
        Ok(report)
    }

    pub fn settings(&self) -> DownloadSettings {
        self.settings.get()
    }

    #[tracing::instrument(level = "debug", skip(self))]
    pub async fn set_settings(&self, patch: SettingsPatch) -> Result<DownloadSettings> {
        call!(self.coordinator, CoordinatorMsg::UpdateSettings, patch).map_err(unavailable)?
    }

    pub fn download_directory(&self) -> PathBuf {
        self.settings.download_directory()
    }

    #[tracing::instrument(level = "debug", skip(self))]
    pub async fn set_download_directory(&self, path: &str) -> Result<PathBuf> {
        let path = self.settings.set_download_directory(path).await?;
        self.record_interaction(format!("Download directory set to {}", path.display()))
            .await;
        Ok(path)
    }

    /// Oldest first.
    pub async fn activities(&self) -> Vec<ActivityEntry> {
        self.activity.all().await
    }

    pub async fn record_interaction(&self, details: impl Into<String>) -> ActivityEntry {
        self.activity
            .record(NewActivity::new(ActionType::UserInteraction).details(details))
            .await
    }

    pub async fn clear_activities(&self) -> Result<usize> {
        self.activity.clear().await
    }

    /// Relative paths are looked up in the download directory.
    pub async fn check_file_exists(&self, path: &str) -> bool {
        let path = Path::new(path);
        if path.is_absolute() {
            files::file_exists(path).await
        } else {
            files::file_exists(&self.download_directory().join(path)).await
        }
    }

    #[tracing::instrument(level = "debug", skip(self))]
    pub async fn reveal_in_folder(&self, id: &str) -> Result<()> {
        let record = self.download(id).await?;
        let path = PathBuf::from(&record.file_path);
        if !files::file_exists(&path).await {
            return Err(DownloadError::NotFound(record.file_path));
        }
        files::reveal_in_folder(&path).map_err(|err| {
            warn!("Could not reveal {}: {}", path.display(), err);
            DownloadError::Unavailable(format!("file manager: {}", err))
        })?;
        self.record_interaction(format!("Revealed {} in its folder", record.file_name))
            .await;
        Ok(())
    }

    /// Stop the coordinator. Running downloaders are linked to it and stop
    /// with it.
    pub fn shutdown(&self) {
        info!("Shutting down the download engine");
        self.coordinator.stop(None);
    }
}
