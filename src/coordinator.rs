use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use ractor::{
    concurrency::JoinHandle, Actor, ActorId, ActorProcessingErr, ActorRef, RpcReplyPort,
    SupervisionEvent,
};
use reqwest::{Client, Url};
use tokio::{
    fs,
    sync::{watch, Mutex},
};
use tracing::{debug, error, info, warn};
use ulid::{Generator, Ulid};

use crate::{
    activity::ActivityLog,
    downloader::{
        Control, Downloader, ProgressReport, TransferOutcome, TransferPlan, TransferReport,
        TransferTiming,
    },
    error::DownloadError,
    files::{self, resolve_destination, url_to_filename},
    model::{
        unix_now, ActionType, DownloadRecord, DownloadStats, DownloadStatus, FailureKind,
        NewActivity, NewDownload, PartialDownloadInfo, RecoveryReport,
    },
    rate_limiter::RateLimiter,
    settings::{DownloadSettings, SettingsPatch, SettingsStore},
    store::{Store, StoredDownload},
};

type Reply<T> = RpcReplyPort<Result<T, DownloadError>>;

/// Owns every download record and decides which ones may run. All commands
/// go through its mailbox, so admission decisions are never made twice at
/// the same time.
#[derive(Debug)]
pub struct Coordinator {
    pub store: Store,
    pub settings: SettingsStore,
    pub limiter: RateLimiter,
    pub activity: ActivityLog,
    pub client: Client,
    pub timing: TransferTiming,
    /// How long a download may go without progress before the stall sweep
    /// looks at its file.
    pub stall_threshold: Duration,
}

pub struct Entry {
    pub record: DownloadRecord,
    pub checkpoint: Option<PartialDownloadInfo>,
    run: u64,
    /// Present while a downloader is working on this entry.
    control: Option<watch::Sender<Control>>,
    file_lock: Arc<Mutex<()>>,
    last_progress_at: Instant,
}

impl Entry {
    fn new(record: DownloadRecord, checkpoint: Option<PartialDownloadInfo>) -> Self {
        Entry {
            record,
            checkpoint,
            run: 0,
            control: None,
            file_lock: Arc::new(Mutex::new(())),
            last_progress_at: Instant::now(),
        }
    }

    /// Tell a running downloader to stop, and forget about it.
    fn signal(&mut self, control: Control) {
        if let Some(sender) = self.control.take() {
            sender.send_replace(control);
        }
    }

    fn stored(&self) -> StoredDownload {
        StoredDownload {
            record: self.record.clone(),
            checkpoint: self.checkpoint.clone(),
        }
    }
}

#[derive(Debug)]
pub struct DownloaderRef {
    pub download_id: String,
    pub run: u64,
    pub actor: ActorRef<Downloader>,
    pub handle: JoinHandle<()>,
}

pub struct CoordinatorState {
    /// Keyed by id, and ids sort in creation order.
    pub downloads: BTreeMap<String, Entry>,
    pub children: HashMap<ActorId, DownloaderRef>,
    ids: Generator,
}

impl CoordinatorState {
    fn downloading_count(&self) -> usize {
        self.downloads
            .values()
            .filter(|e| e.record.status == DownloadStatus::Downloading)
            .count()
    }

    fn next_queued(&self) -> Option<String> {
        self.downloads
            .values()
            .find(|e| e.record.status == DownloadStatus::Queued)
            .map(|e| e.record.id.clone())
    }

    fn entry(&mut self, id: &str) -> Result<&mut Entry, DownloadError> {
        self.downloads
            .get_mut(id)
            .ok_or_else(|| DownloadError::NotFound(id.to_string()))
    }
}

pub enum CoordinatorMsg {
    Start(NewDownload, Reply<String>),
    Pause(String, Reply<()>),
    Resume(String, Reply<()>),
    Cancel(String, Reply<()>),
    CancelAndDelete(String, Reply<()>),
    Restart(String, Reply<()>),
    ClearCompleted(RpcReplyPort<usize>),
    CheckStalled(RpcReplyPort<Vec<String>>),
    /// Periodic stall sweep, nobody waits for the result.
    SweepStalled,
    ResumeInterrupted(RpcReplyPort<RecoveryReport>),
    UpdateSettings(SettingsPatch, Reply<DownloadSettings>),
    List(RpcReplyPort<Vec<DownloadRecord>>),
    Get(String, RpcReplyPort<Option<DownloadRecord>>),
    Stats(RpcReplyPort<DownloadStats>),
    Progress(ProgressReport),
    Finished(TransferReport),
}

fn invalid(entry: &Entry, action: &'static str) -> DownloadError {
    DownloadError::InvalidState {
        id: entry.record.id.clone(),
        status: entry.record.status,
        action,
    }
}

/// Only absolute http(s) URLs with a host can be downloaded.
fn check_url(url: &str) -> Result<(), DownloadError> {
    if url.is_empty() {
        return Err(DownloadError::Validation("url must not be empty".to_string()));
    }
    let parsed = Url::parse(url)
        .map_err(|err| DownloadError::Validation(format!("invalid url {}: {}", url, err)))?;
    if !matches!(parsed.scheme(), "http" | "https") {
        return Err(DownloadError::Validation(format!(
            "unsupported url scheme {}",
            parsed.scheme()
        )));
    }
    if parsed.host_str().map_or(true, str::is_empty) {
        return Err(DownloadError::Validation(format!("url {} has no host", url)));
    }
    Ok(())
}

async fn remove_partial_file(path: &str) {
    if let Err(err) = fs::remove_file(path).await {
        if err.kind() != std::io::ErrorKind::NotFound {
            warn!("Failed to delete {}: {}", path, err);
        }
    }
}

impl Coordinator {
    async fn persist(&self, entry: &Entry) {
        if let Err(err) = self.store.put_download(&entry.stored()).await {
            error!("Failed to persist download {}: {}", entry.record.id, err);
        }
    }

    async fn log(&self, activity: NewActivity) {
        self.activity.record(activity).await;
    }

    /// Admit queued downloads, oldest first, until the concurrency cap is hit.
    async fn pump(&self, myself: &ActorRef<Self>, state: &mut CoordinatorState) {
        let max = self.settings.get().max_simultaneous_downloads;
        while state.downloading_count() < max {
            let Some(id) = state.next_queued() else {
                break;
            };
            self.admit(myself, state, &id).await;
        }
        self.limiter.set_active(state.downloading_count());
    }

    async fn admit(&self, myself: &ActorRef<Self>, state: &mut CoordinatorState, id: &str) {
        let settings = self.settings.get();
        let Some(entry) = state.downloads.get_mut(id) else {
            return;
        };

        let resume_from = match (&entry.checkpoint, settings.disable_range_requests) {
            (Some(checkpoint), false) => checkpoint.downloaded_bytes,
            _ => 0,
        };
        let checksum = entry
            .checkpoint
            .as_ref()
            .filter(|_| resume_from > 0)
            .map(|checkpoint| checkpoint.checksum.clone());

        entry.run += 1;
        entry.record.status = DownloadStatus::Downloading;
        entry.record.downloaded_size = resume_from;
        entry.record.start_time.get_or_insert_with(unix_now);
        entry.record.error = None;
        entry.record.failure_kind = None;
        entry.record.refresh_derived();
        entry.last_progress_at = Instant::now();

        let (control, receiver) = watch::channel(Control::Run);
        entry.control = Some(control);
        let run = entry.run;
        let downloader = Downloader {
            plan: TransferPlan {
                id: id.to_string(),
                run,
                url: entry.record.url.clone(),
                destination: PathBuf::from(&entry.record.file_path),
                resume_from,
                checksum,
                disable_range_requests: settings.disable_range_requests,
            },
            control: receiver,
            file_lock: entry.file_lock.clone(),
            coordinator: myself.clone(), // cloning the reference, not the actor
            client: self.client.clone(),
            limiter: self.limiter.clone(),
            timing: self.timing.clone(),
        };

        match Actor::spawn_linked(None, downloader, (), myself.get_cell()).await {
            Ok((actor, handle)) => {
                state.children.insert(
                    actor.get_id(),
                    DownloaderRef {
                        download_id: id.to_string(),
                        run,
                        actor,
                        handle,
                    },
                );
                if let Some(entry) = state.downloads.get(id) {
                    info!("Admitted download {} from byte {}", id, resume_from);
                    self.persist(entry).await;
                    self.log(
                        NewActivity::new(ActionType::DownloadStarted)
                            .for_download(&entry.record)
                            .details(format!("Started from byte {}", resume_from)),
                    )
                    .await;
                }
            }
            Err(err) => {
                error!("Failed to spawn downloader for {}: {}", id, err);
                self.fail(
                    state,
                    id,
                    FailureKind::Transport,
                    format!("could not start the transfer: {}", err),
                )
                .await;
            }
        }
    }

    async fn fail(
        &self,
        state: &mut CoordinatorState,
        id: &str,
        kind: FailureKind,
        message: String,
    ) {
        let Some(entry) = state.downloads.get_mut(id) else {
            return;
        };
        entry.signal(Control::Cancel);
        entry.record.status = DownloadStatus::Error;
        entry.record.error = Some(message.clone());
        entry.record.failure_kind = Some(kind);
        entry.record.refresh_derived();
        warn!("Download {} failed: {}", id, message);
        self.persist(entry).await;
        self.log(
            NewActivity::new(ActionType::DownloadError)
                .for_download(&entry.record)
                .details(format!("{:?} error: {}", kind, message)),
        )
        .await;
    }

    async fn start(
        &self,
        myself: &ActorRef<Self>,
        state: &mut CoordinatorState,
        request: NewDownload,
    ) -> Result<String, DownloadError> {
        let url = request.url.trim();
        check_url(url)?;
        if request.file_path.trim().is_empty() {
            return Err(DownloadError::Validation(
                "file path must not be empty".to_string(),
            ));
        }

        let requested_name = request.file_name.trim();
        let fallback_name = url_to_filename(url);
        let destination = resolve_destination(
            &self.settings.download_directory(),
            request.file_path.trim(),
            if requested_name.is_empty() {
                fallback_name.as_str()
            } else {
                requested_name
            },
        )
        .await;
        let file_name = if requested_name.is_empty() {
            destination
                .file_name()
                .map(|name| name.to_string_lossy().to_string())
                .unwrap_or(fallback_name)
        } else {
            requested_name.to_string()
        };

        // The generator only fails when a millisecond runs out of ids.
        let id = state
            .ids
            .generate()
            .unwrap_or_else(|_| Ulid::new())
            .to_string();
        let record = DownloadRecord::new(
            id.clone(),
            url.to_string(),
            destination.display().to_string(),
            file_name,
        );
        debug!("Queued download {} of {}", id, url);

        let entry = Entry::new(record, None);
        self.persist(&entry).await;
        self.log(
            NewActivity::new(ActionType::FileAdded)
                .for_download(&entry.record)
                .details(format!("Added download of {}", url)),
        )
        .await;
        state.downloads.insert(id.clone(), entry);

        self.pump(myself, state).await;
        Ok(id)
    }

    async fn pause(
        &self,
        myself: &ActorRef<Self>,
        state: &mut CoordinatorState,
        id: &str,
    ) -> Result<(), DownloadError> {
        let entry = state.entry(id)?;
        if entry.record.status != DownloadStatus::Downloading {
            return Err(invalid(entry, "pause"));
        }
        // Keep the control sender, the downloader's last checkpoint still
        // belongs to this run.
        if let Some(control) = &entry.control {
            control.send_replace(Control::Pause);
        }
        entry.record.status = DownloadStatus::Paused;
        entry.record.refresh_derived();
        info!("Paused download {}", id);
        self.persist(entry).await;
        self.log(NewActivity::new(ActionType::DownloadPaused).for_download(&entry.record))
            .await;

        self.pump(myself, state).await;
        Ok(())
    }

    async fn resume(
        &self,
        myself: &ActorRef<Self>,
        state: &mut CoordinatorState,
        id: &str,
    ) -> Result<(), DownloadError> {
        let entry = state.entry(id)?;
        let resumable = match entry.record.status {
            DownloadStatus::Paused => true,
            DownloadStatus::Error | DownloadStatus::Cancelled => {
                entry.checkpoint.is_some()
                    && entry.record.failure_kind != Some(FailureKind::Integrity)
            }
            _ => false,
        };
        if !resumable {
            return Err(invalid(entry, "resume"));
        }

        entry.record.status = DownloadStatus::Queued;
        entry.record.error = None;
        entry.record.failure_kind = None;
        entry.record.refresh_derived();
        info!("Resuming download {}", id);
        self.persist(entry).await;
        self.log(NewActivity::new(ActionType::DownloadResumed).for_download(&entry.record))
            .await;

        self.pump(myself, state).await;
        Ok(())
    }

    async fn cancel(
        &self,
        myself: &ActorRef<Self>,
        state: &mut CoordinatorState,
        id: &str,
        delete: bool,
    ) -> Result<(), DownloadError> {
        let entry = state.entry(id)?;
        match entry.record.status {
            DownloadStatus::Completed => return Err(invalid(entry, "cancel")),
            DownloadStatus::Cancelled if !delete => return Err(invalid(entry, "cancel")),
            _ => {}
        }

        if delete {
            // The downloader deletes the file itself once it lets go of it.
            entry.signal(Control::Discard);
            entry.record.status = DownloadStatus::Cancelled;
            entry.record.refresh_derived();
            let record = entry.record.clone();
            state.downloads.remove(id);

            remove_partial_file(&record.file_path).await;
            if let Err(err) = self.store.delete_download(id).await {
                error!("Failed to delete stored download {}: {}", id, err);
            }
            info!("Cancelled download {} and deleted its partial file", id);
            self.log(
                NewActivity::new(ActionType::DownloadCancelled)
                    .for_download(&record)
                    .details("Deleted the partial file"),
            )
            .await;
        } else {
            if let Some(control) = &entry.control {
                control.send_replace(Control::Cancel);
            }
            entry.record.status = DownloadStatus::Cancelled;
            entry.record.refresh_derived();
            info!("Cancelled download {}", id);
            self.persist(entry).await;
            self.log(
                NewActivity::new(ActionType::DownloadCancelled).for_download(&entry.record),
            )
            .await;
        }

        self.pump(myself, state).await;
        Ok(())
    }

    async fn restart(
        &self,
        myself: &ActorRef<Self>,
        state: &mut CoordinatorState,
        id: &str,
    ) -> Result<(), DownloadError> {
        let entry = state.entry(id)?;
        if !matches!(
            entry.record.status,
            DownloadStatus::Error | DownloadStatus::Cancelled | DownloadStatus::Completed
        ) {
            return Err(invalid(entry, "restart"));
        }

        entry.signal(Control::Cancel);
        // Anything a previous downloader still reports is stale now.
        entry.run += 1;
        entry.checkpoint = None;
        entry.record.status = DownloadStatus::Queued;
        entry.record.downloaded_size = 0;
        entry.record.total_size = 0;
        entry.record.error = None;
        entry.record.failure_kind = None;
        entry.record.refresh_derived();
        remove_partial_file(&entry.record.file_path).await;
        info!("Restarting download {} from byte 0", id);
        self.persist(entry).await;
        self.log(
            NewActivity::new(ActionType::StatusChanged)
                .for_download(&entry.record)
                .details("Restarted from byte 0"),
        )
        .await;

        self.pump(myself, state).await;
        Ok(())
    }

    async fn clear_completed(&self, state: &mut CoordinatorState) -> usize {
        let completed = state
            .downloads
            .values()
            .filter(|e| e.record.status == DownloadStatus::Completed)
            .map(|e| e.record.id.clone())
            .collect::<Vec<_>>();
        for id in &completed {
            state.downloads.remove(id);
            if let Err(err) = self.store.delete_download(id).await {
                error!("Failed to delete stored download {}: {}", id, err);
            }
        }
        info!("Cleared {} completed downloads", completed.len());
        self.log(
            NewActivity::new(ActionType::UserInteraction)
                .details(format!("Cleared {} completed downloads", completed.len())),
        )
        .await;
        completed.len()
    }

    /// Find downloads stuck in `downloading` whose file is already complete
    /// and mark them completed. Downloads that are genuinely behind are left
    /// alone.
    async fn check_stalled(
        &self,
        myself: &ActorRef<Self>,
        state: &mut CoordinatorState,
    ) -> Vec<String> {
        let stalled = state
            .downloads
            .values()
            .filter(|e| {
                e.record.status == DownloadStatus::Downloading
                    && e.last_progress_at.elapsed() >= self.stall_threshold
            })
            .map(|e| {
                let expected = match e.record.total_size {
                    0 => e.checkpoint.as_ref().map(|c| c.total_bytes).unwrap_or(0),
                    total => total,
                };
                (e.record.id.clone(), e.record.file_path.clone(), expected)
            })
            .collect::<Vec<_>>();

        let mut fixed = Vec::new();
        for (id, path, expected) in stalled {
            if expected == 0 {
                continue;
            }
            let on_disk = files::file_size(Path::new(&path)).await;
            if on_disk != expected {
                debug!(
                    "Download {} is stalled at {} of {} bytes",
                    id, on_disk, expected
                );
                continue;
            }
            let Some(entry) = state.downloads.get_mut(&id) else {
                continue;
            };
            entry.signal(Control::Cancel);
            entry.run += 1;
            entry.checkpoint = None;
            entry.record.status = DownloadStatus::Completed;
            entry.record.downloaded_size = expected;
            entry.record.total_size = expected;
            entry.record.refresh_derived();
            info!("Download {} was stalled but its file is complete", id);
            self.persist(entry).await;
            self.log(
                NewActivity::new(ActionType::StatusChanged)
                    .for_download(&entry.record)
                    .details("File on disk is complete, marked as completed"),
            )
            .await;
            fixed.push(id);
        }

        if !fixed.is_empty() {
            self.pump(myself, state).await;
        }
        fixed
    }

    /// Downloads left in `downloading` by a previous process. A partial file
    /// holding at least the checkpointed bytes resumes; the downloader
    /// re-hashes that prefix and cuts off whatever was written after the
    /// checkpoint. A file shorter than its checkpoint is an integrity error.
    async fn resume_interrupted(
        &self,
        myself: &ActorRef<Self>,
        state: &mut CoordinatorState,
    ) -> RecoveryReport {
        let interrupted = state
            .downloads
            .values()
            .filter(|e| e.record.status == DownloadStatus::Downloading && e.control.is_none())
            .map(|e| e.record.id.clone())
            .collect::<Vec<_>>();

        let mut report = RecoveryReport::default();
        for id in interrupted {
            let Some(entry) = state.downloads.get_mut(&id) else {
                continue;
            };
            let expected = entry
                .checkpoint
                .as_ref()
                .map(|c| c.downloaded_bytes)
                .unwrap_or(0);
            let on_disk = files::file_size(Path::new(&entry.record.file_path)).await;

            if on_disk >= expected {
                entry.record.status = DownloadStatus::Queued;
                entry.record.refresh_derived();
                info!("Resuming interrupted download {} from byte {}", id, expected);
                self.persist(entry).await;
                self.log(
                    NewActivity::new(ActionType::DownloadResumed)
                        .for_download(&entry.record)
                        .details(format!("Resumed after an interruption at byte {}", expected)),
                )
                .await;
                report.resumed.push(id);
            } else {
                let message = format!(
                    "checkpoint recorded {} bytes but the file on disk has only {}",
                    expected, on_disk
                );
                self.fail(state, &id, FailureKind::Integrity, message).await;
                report.failed.push(id);
            }
        }

        self.pump(myself, state).await;
        report
    }

    async fn update_settings(
        &self,
        myself: &ActorRef<Self>,
        state: &mut CoordinatorState,
        patch: SettingsPatch,
    ) -> Result<DownloadSettings, DownloadError> {
        let settings = self.settings.update(&patch).await?;
        // A higher cap admits more right away, a lower one only affects
        // future admissions.
        self.pump(myself, state).await;
        Ok(settings)
    }

    async fn progress(&self, state: &mut CoordinatorState, report: ProgressReport) {
        let Some(entry) = state.downloads.get_mut(&report.id) else {
            return;
        };
        if entry.run != report.run {
            debug!("Ignoring progress from an earlier run of {}", report.id);
            return;
        }

        if report.reset {
            entry.record.downloaded_size = report.downloaded;
            entry.checkpoint = None;
            entry.last_progress_at = Instant::now();
        } else if report.downloaded > entry.record.downloaded_size {
            entry.record.downloaded_size = report.downloaded;
            entry.last_progress_at = Instant::now();
        }
        if let Some(total) = report.total {
            entry.record.total_size = total;
        }
        if entry.record.status == DownloadStatus::Downloading {
            entry.record.speed = report.speed;
        }
        entry.record.refresh_derived();

        if let Some(checksum) = report.checksum {
            entry.checkpoint = Some(PartialDownloadInfo {
                id: entry.record.id.clone(),
                file_path: entry.record.file_path.clone(),
                downloaded_bytes: report.downloaded,
                total_bytes: entry.record.total_size,
                last_modified: unix_now(),
                checksum,
            });
            self.persist(entry).await;
        }
    }

    async fn finished(
        &self,
        myself: &ActorRef<Self>,
        state: &mut CoordinatorState,
        report: TransferReport,
    ) {
        let Some(entry) = state.downloads.get_mut(&report.id) else {
            return;
        };
        if entry.run != report.run {
            debug!("Ignoring outcome of an earlier run of {}", report.id);
            return;
        }
        entry.control = None;

        match report.outcome {
            TransferOutcome::Completed { total } => {
                if matches!(
                    entry.record.status,
                    DownloadStatus::Downloading | DownloadStatus::Paused
                ) {
                    entry.record.status = DownloadStatus::Completed;
                    entry.record.downloaded_size = total;
                    entry.record.total_size = total;
                    entry.checkpoint = None;
                    entry.record.refresh_derived();
                    info!("Download finished: {}", entry.record.url);
                    self.persist(entry).await;
                    self.log(
                        NewActivity::new(ActionType::DownloadCompleted)
                            .for_download(&entry.record)
                            .details(format!("Downloaded {} bytes", total)),
                    )
                    .await;
                }
            }
            TransferOutcome::Stopped => {
                debug!("Downloader for {} stopped", report.id);
            }
            TransferOutcome::Failed { kind, message } => {
                if entry.record.status == DownloadStatus::Downloading {
                    self.fail(state, &report.id, kind, message).await;
                }
            }
        }

        self.pump(myself, state).await;
    }
}

#[async_trait::async_trait]
impl Actor for Coordinator {
    type Msg = CoordinatorMsg;
    type State = CoordinatorState;
    /// Downloads loaded from the store.
    type Arguments = Vec<StoredDownload>;

    async fn pre_start(
        &self,
        _myself: ActorRef<Self>,
        stored: Vec<StoredDownload>,
    ) -> Result<Self::State, ActorProcessingErr> {
        debug!("Starting coordinator with {} downloads", stored.len());
        let downloads = stored
            .into_iter()
            .map(|stored| {
                let mut record = stored.record;
                record.speed = 0f64;
                record.refresh_derived();
                (record.id.clone(), Entry::new(record, stored.checkpoint))
            })
            .collect();
        Ok(CoordinatorState {
            downloads,
            children: HashMap::new(),
            ids: Generator::new(),
        })
    }

    async fn handle(
        &self,
        myself: ActorRef<Self>,
        message: Self::Msg,
        state: &mut Self::State,
    ) -> Result<(), ActorProcessingErr> {
        // A caller that gave up waiting is not an error, so failed replies are ignored.
        match message {
            CoordinatorMsg::Start(request, reply) => {
                let _ = reply.send(self.start(&myself, state, request).await);
            }
            CoordinatorMsg::Pause(id, reply) => {
                let _ = reply.send(self.pause(&myself, state, &id).await);
            }
            CoordinatorMsg::Resume(id, reply) => {
                let _ = reply.send(self.resume(&myself, state, &id).await);
            }
            CoordinatorMsg::Cancel(id, reply) => {
                let _ = reply.send(self.cancel(&myself, state, &id, false).await);
            }
            CoordinatorMsg::CancelAndDelete(id, reply) => {
                let _ = reply.send(self.cancel(&myself, state, &id, true).await);
            }
            CoordinatorMsg::Restart(id, reply) => {
                let _ = reply.send(self.restart(&myself, state, &id).await);
            }
            CoordinatorMsg::ClearCompleted(reply) => {
                let _ = reply.send(self.clear_completed(state).await);
            }
            CoordinatorMsg::CheckStalled(reply) => {
                let _ = reply.send(self.check_stalled(&myself, state).await);
            }
            CoordinatorMsg::SweepStalled => {
                self.check_stalled(&myself, state).await;
            }
            CoordinatorMsg::ResumeInterrupted(reply) => {
                let _ = reply.send(self.resume_interrupted(&myself, state).await);
            }
            CoordinatorMsg::UpdateSettings(patch, reply) => {
                let _ = reply.send(self.update_settings(&myself, state, patch).await);
            }
            CoordinatorMsg::List(reply) => {
                let records = state.downloads.values().map(|e| e.record.clone()).collect();
                let _ = reply.send(records);
            }
            CoordinatorMsg::Get(id, reply) => {
                let _ = reply.send(state.downloads.get(&id).map(|e| e.record.clone()));
            }
            CoordinatorMsg::Stats(reply) => {
                let _ = reply.send(DownloadStats::from_records(
                    state.downloads.values().map(|e| &e.record),
                ));
            }
            CoordinatorMsg::Progress(report) => {
                self.progress(state, report).await;
            }
            CoordinatorMsg::Finished(report) => {
                self.finished(&myself, state, report).await;
            }
        }

        Ok(())
    }

    async fn handle_supervisor_evt(
        &self,
        myself: ActorRef<Self>,
        message: SupervisionEvent,
        state: &mut Self::State,
    ) -> Result<(), ActorProcessingErr> {
        match message {
            SupervisionEvent::ActorTerminated(child, _state, _reason) => {
                if let Some(child) = state.children.remove(&child.get_id()) {
                    debug!("Downloader for {} exited", child.download_id);
                }
                Ok(())
            }
            SupervisionEvent::ActorPanicked(child, err) => {
                let Some(child) = state.children.remove(&child.get_id()) else {
                    return Ok(());
                };
                error!("Downloader for {} crashed: {:?}", child.download_id, err);

                let still_running = state.downloads.get(&child.download_id).map_or(false, |e| {
                    e.run == child.run && e.record.status == DownloadStatus::Downloading
                });
                if still_running {
                    self.fail(
                        state,
                        &child.download_id,
                        FailureKind::Transport,
                        format!("the transfer crashed: {}", err),
                    )
                    .await;
                    self.pump(&myself, state).await;
                }
                Ok(())
            }
            _ => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_http_urls_are_accepted() {
        assert!(check_url("https://example.com/a.zip").is_ok());
        assert!(check_url("http://127.0.0.1:8080/files/a.zip?x=1").is_ok());
        for bad in ["", "not a url", "/relative/a.zip", "ftp://example.com/a.zip", "file:///etc/passwd"] {
            assert!(
                matches!(check_url(bad), Err(DownloadError::Validation(_))),
                "{} was accepted",
                bad
            );
        }
    }
}
