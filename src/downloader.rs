use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures::StreamExt;
use ractor::{cast, Actor, ActorProcessingErr, ActorRef};
use reqwest::{
    header::{CONTENT_RANGE, RANGE},
    Client, Response, StatusCode,
};
use sha2::{Digest, Sha256};
use tokio::{
    fs::{self, File, OpenOptions},
    io::{AsyncReadExt, AsyncWriteExt},
    sync::{watch, Mutex},
};
use tracing::{debug, info, warn};

use crate::{
    avg_range::MovingAverage,
    coordinator::{Coordinator, CoordinatorMsg},
    error::{DownloadError, Result},
    files,
    model::FailureKind,
    rate_limiter::{RateLimiter, Throttle},
};

/// What the coordinator wants a running transfer to do.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Control {
    Run,
    /// Stop and keep the partial file for a later resume.
    Pause,
    Cancel,
    /// Stop and delete the partial file.
    Discard,
}

#[derive(Debug, Clone)]
pub struct TransferTiming {
    /// How often progress and speed are reported.
    pub progress_interval: Duration,
    /// How often a report carries a checkpoint to persist.
    pub checkpoint_interval: Duration,
}

#[derive(Debug, Clone)]
pub struct TransferPlan {
    pub id: String,
    /// Admission counter of the download, reports from older runs are ignored.
    pub run: u64,
    pub url: String,
    pub destination: PathBuf,
    /// Continue after this many bytes, 0 to start fresh.
    pub resume_from: u64,
    /// Checksum of the first `resume_from` bytes, if a checkpoint recorded one.
    pub checksum: Option<String>,
    pub disable_range_requests: bool,
}

#[derive(Debug, Clone)]
pub struct ProgressReport {
    pub id: String,
    pub run: u64,
    pub downloaded: u64,
    pub total: Option<u64>,
    /// Bytes per second.
    pub speed: f64,
    /// Present when the bytes up to `downloaded` are flushed and should be
    /// checkpointed.
    pub checksum: Option<String>,
    /// The server ignored a range request and the file was truncated.
    pub reset: bool,
}

#[derive(Debug, Clone)]
pub enum TransferOutcome {
    Completed { total: u64 },
    /// Paused, cancelled or discarded on request.
    Stopped,
    Failed { kind: FailureKind, message: String },
}

#[derive(Debug, Clone)]
pub struct TransferReport {
    pub id: String,
    pub run: u64,
    pub outcome: TransferOutcome,
}

/// Resolves once the coordinator asks the transfer to stop. A dropped sender
/// counts as a cancel.
async fn stop_requested(control: &mut watch::Receiver<Control>) -> Control {
    loop {
        let current = *control.borrow_and_update();
        if current != Control::Run {
            return current;
        }
        if control.changed().await.is_err() {
            return Control::Cancel;
        }
    }
}

/// First byte and total size from a `Content-Range: bytes 0-99/1000` header.
/// The total is `None` when the server sends `*`.
fn parse_content_range(value: &str) -> Option<(u64, Option<u64>)> {
    let (range, total) = value.trim().strip_prefix("bytes")?.trim().split_once('/')?;
    let (start, _end) = range.split_once('-')?;
    Some((start.trim().parse().ok()?, total.trim().parse().ok()))
}

fn content_range(response: &Response) -> Option<(u64, Option<u64>)> {
    parse_content_range(response.headers().get(CONTENT_RANGE)?.to_str().ok()?)
}

struct PartialFile {
    file: File,
    hasher: Sha256,
    downloaded: u64,
    total: Option<u64>,
}

impl PartialFile {
    fn checksum(&self) -> String {
        hex::encode(self.hasher.clone().finalize())
    }
}

/// An actor that downloads a single file.
#[derive(Debug)]
pub struct Downloader {
    pub plan: TransferPlan,
    pub control: watch::Receiver<Control>,
    /// Held for the whole transfer so a resumed transfer can't open the file
    /// while a stopping one is still writing to it.
    pub file_lock: Arc<Mutex<()>>,
    pub coordinator: ActorRef<Coordinator>,
    pub client: Client,
    pub limiter: RateLimiter,
    pub timing: TransferTiming,
}

impl Downloader {
    fn report(&self, partial: &PartialFile, speed: f64, checkpoint: bool, reset: bool) {
        let report = ProgressReport {
            id: self.plan.id.clone(),
            run: self.plan.run,
            downloaded: partial.downloaded,
            total: partial.total,
            speed,
            checksum: checkpoint.then(|| partial.checksum()),
            reset,
        };
        if let Err(err) = cast!(self.coordinator, CoordinatorMsg::Progress(report)) {
            debug!("Could not report progress for {}: {:?}", self.plan.id, err);
        }
    }

    /// Hash the bytes a checkpoint covers and make sure they are still the
    /// bytes that were checkpointed.
    async fn verify_partial(&self) -> Result<Sha256> {
        let expected = self.plan.resume_from;
        let on_disk = files::file_size(&self.plan.destination).await;
        if on_disk < expected {
            return Err(DownloadError::Integrity(format!(
                "{} has {} bytes, the checkpoint recorded {}",
                self.plan.destination.display(),
                on_disk,
                expected
            )));
        }

        let mut hasher = Sha256::new();
        let mut file = File::open(&self.plan.destination).await?.take(expected);
        let mut buffer = vec![0u8; 64 * 1024];
        loop {
            let read = file.read(&mut buffer).await?;
            if read == 0 {
                break;
            }
            hasher.update(&buffer[..read]);
        }

        if let Some(checksum) = &self.plan.checksum {
            let actual = hex::encode(hasher.clone().finalize());
            if &actual != checksum {
                return Err(DownloadError::Integrity(format!(
                    "the first {} bytes of {} changed since they were checkpointed",
                    expected,
                    self.plan.destination.display()
                )));
            }
        }
        Ok(hasher)
    }

    async fn stopped(&self, stop: Control) -> Result<TransferOutcome> {
        if stop == Control::Discard {
            info!("Discarding partial file {}", self.plan.destination.display());
            if let Err(err) = fs::remove_file(&self.plan.destination).await {
                if err.kind() != std::io::ErrorKind::NotFound {
                    warn!(
                        "Failed to delete {}: {}",
                        self.plan.destination.display(),
                        err
                    );
                }
            }
        }
        Ok(TransferOutcome::Stopped)
    }

    async fn transfer(&self) -> Result<TransferOutcome> {
        let _file_guard = self.file_lock.clone().lock_owned().await;
        let mut control = self.control.clone();
        let stop = *control.borrow_and_update();
        if stop != Control::Run {
            return self.stopped(stop).await;
        }

        let plan = &self.plan;
        if let Some(parent) = plan.destination.parent() {
            fs::create_dir_all(parent).await?;
        }

        let mut offset = 0u64;
        let mut hasher = Sha256::new();
        if plan.resume_from > 0 && !plan.disable_range_requests {
            hasher = self.verify_partial().await?;
            offset = plan.resume_from;
        }

        let mut request = self.client.get(&plan.url);
        if offset > 0 {
            request = request.header(RANGE, format!("bytes={}-", offset));
        }
        let response = tokio::select! {
            stop = stop_requested(&mut control) => return self.stopped(stop).await,
            response = request.send() => response?,
        };

        let status = response.status();
        if !status.is_success() {
            return Err(DownloadError::Transport(format!(
                "{} responded with {}",
                plan.url, status
            )));
        }
        let resuming = offset > 0 && status == StatusCode::PARTIAL_CONTENT;
        let reset = offset > 0 && !resuming;
        if reset {
            info!(
                "Server ignored the range request for {}, starting over",
                plan.url
            );
            offset = 0;
            hasher = Sha256::new();
        }

        let total = if resuming {
            let range = content_range(&response);
            if let Some((start, _)) = range {
                if start != offset {
                    return Err(DownloadError::Transport(format!(
                        "{} sent bytes from {} when asked for bytes from {}",
                        plan.url, start, offset
                    )));
                }
            }
            range
                .and_then(|(_, total)| total)
                .or_else(|| response.content_length().map(|length| length + offset))
        } else {
            response.content_length()
        };
        if let Some(total) = total {
            let needed = total.saturating_sub(offset);
            if let Some(free) = files::free_space(&plan.destination).await {
                if free < needed {
                    return Err(DownloadError::Capacity(format!(
                        "{} bytes needed but only {} are free",
                        needed, free
                    )));
                }
            }
        }

        let file = OpenOptions::new()
            .write(true)
            .create(true)
            // If resuming, keep the verified prefix and append to it. Anything
            // past the checkpoint is cut off first.
            .truncate(!resuming)
            .append(resuming)
            .open(&plan.destination)
            .await?;
        if resuming {
            file.set_len(offset).await?;
        }

        let mut partial = PartialFile {
            file,
            hasher,
            downloaded: offset,
            total,
        };
        self.report(&partial, 0f64, reset, reset);

        let mut throttle = self.limiter.throttle();
        let streamed = self
            .stream_body(response, &mut control, &mut throttle, &mut partial)
            .await;

        // Whatever happened, make the written bytes durable before checkpointing them.
        partial.file.flush().await?;
        partial.file.sync_all().await?;

        let stop = match streamed {
            Ok(stop) => stop,
            Err(err) => {
                self.report(&partial, 0f64, true, false);
                return Err(err);
            }
        };
        match stop {
            Some(Control::Discard) => {
                drop(partial);
                self.stopped(Control::Discard).await
            }
            Some(stop) => {
                self.report(&partial, 0f64, true, false);
                self.stopped(stop).await
            }
            None => {
                if let Some(total) = partial.total {
                    if partial.downloaded != total {
                        self.report(&partial, 0f64, true, false);
                        return Err(DownloadError::Transport(format!(
                            "connection closed after {} of {} bytes",
                            partial.downloaded, total
                        )));
                    }
                }
                Ok(TransferOutcome::Completed {
                    total: partial.downloaded,
                })
            }
        }
    }

    /// Copy the response body into the file until it ends or a stop is
    /// requested. Returns the stop request, if there was one.
    async fn stream_body(
        &self,
        response: Response,
        control: &mut watch::Receiver<Control>,
        throttle: &mut Throttle,
        partial: &mut PartialFile,
    ) -> Result<Option<Control>> {
        let mut speed = MovingAverage::new();
        let mut last_report = Instant::now();
        let mut last_checkpoint = Instant::now();
        let mut bytes_since_report = 0u64;

        let mut bytes = response.bytes_stream();
        loop {
            let chunk = tokio::select! {
                stop = stop_requested(control) => return Ok(Some(stop)),
                chunk = bytes.next() => chunk,
            };
            let Some(chunk) = chunk else {
                return Ok(None);
            };
            let chunk = chunk?;
            if let Some(total) = partial.total {
                if partial.downloaded + chunk.len() as u64 > total {
                    return Err(DownloadError::Transport(format!(
                        "server sent more than the advertised {} bytes",
                        total
                    )));
                }
            }

            let slice_len = throttle.slice_len();
            for slice in chunk.chunks(slice_len) {
                // Bytes dropped here were never written, so stopping mid-wait
                // leaves the file consistent with the count.
                tokio::select! {
                    stop = stop_requested(control) => return Ok(Some(stop)),
                    _ = throttle.acquire(slice.len()) => {}
                }
                partial.file.write_all(slice).await?;
                partial.hasher.update(slice);
                partial.downloaded += slice.len() as u64;
                bytes_since_report += slice.len() as u64;

                let since_report = last_report.elapsed();
                if since_report >= self.timing.progress_interval {
                    speed.add(bytes_since_report, since_report.as_millis() as u64);
                    let checkpoint = last_checkpoint.elapsed() >= self.timing.checkpoint_interval;
                    if checkpoint {
                        partial.file.flush().await?;
                        last_checkpoint = Instant::now();
                    }
                    self.report(partial, speed.bytes_per_second(), checkpoint, false);
                    last_report = Instant::now();
                    bytes_since_report = 0;
                }
            }
        }
    }
}

#[async_trait::async_trait]
impl Actor for Downloader {
    /// Downloader does not accept any messages, the coordinator steers it
    /// through the control channel.
    type Msg = ();

    type State = ();
    type Arguments = ();

    async fn pre_start(
        &self,
        _myself: ActorRef<Self>,
        _: (),
    ) -> std::result::Result<Self::State, ActorProcessingErr> {
        Ok(())
    }

    /// Run the transfer and tell the coordinator how it ended.
    async fn post_start(
        &self,
        myself: ActorRef<Self>,
        _state: &mut Self::State,
    ) -> std::result::Result<(), ActorProcessingErr> {
        info!(
            "Downloading {} to {} from byte {}",
            self.plan.url,
            self.plan.destination.display(),
            self.plan.resume_from
        );
        let outcome = match self.transfer().await {
            Ok(outcome) => outcome,
            Err(err) => {
                warn!("Download {} failed: {}", self.plan.id, err);
                TransferOutcome::Failed {
                    kind: err.failure_kind(),
                    message: err.to_string(),
                }
            }
        };

        let report = TransferReport {
            id: self.plan.id.clone(),
            run: self.plan.run,
            outcome,
        };
        if let Err(err) = cast!(self.coordinator, CoordinatorMsg::Finished(report)) {
            warn!("Coordinator is gone, dropping outcome of {}: {:?}", self.plan.id, err);
        }
        myself.stop(None);
        Ok(())
    }
}
