//! Managed transfer queue
//!
//! Items are admitted in insertion order by a scheduler task woken through
//! a [`Notify`]. Each admitted item runs as its own task holding an
//! [`ActiveSlot`]; dropping the slot frees the concurrency slot, finalizes
//! the item and wakes the scheduler, on every exit path including panics.
//!
//! The queue lock is only held for field updates. Events go out after it
//! is released.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::sync::{broadcast, Notify};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::error::SftpError;
use super::fs::RemoteFs;
use super::path_utils::{local_file_name, remote_file_name};
use super::transfer::{check_transfer_control, copy_chunks, TransferControl};
use super::types::constants::{DEFAULT_CONCURRENT_TRANSFERS, MAX_CONCURRENT_TRANSFERS};

const EVENT_CAPACITY: usize = 256;

const IDLE_POLL_INTERVAL: Duration = Duration::from_millis(20);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransferDirection {
    Upload,
    Download,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransferStatus {
    Pending,
    InProgress,
    Completed,
    Failed,
    Cancelled,
}

impl TransferStatus {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            TransferStatus::Completed | TransferStatus::Failed | TransferStatus::Cancelled
        )
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransferItem {
    pub id: u64,
    /// Basename of the source
    pub file_name: String,
    pub remote_path: String,
    pub local_path: PathBuf,
    pub direction: TransferDirection,
    pub total_bytes: u64,
    pub transferred_bytes: u64,
    pub status: TransferStatus,
    pub error: Option<String>,
    pub start_time: Option<DateTime<Utc>>,
    pub end_time: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct QueueStats {
    pub pending: usize,
    pub in_progress: usize,
    pub completed: usize,
    pub failed: usize,
    pub cancelled: usize,
}

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum TransferEvent {
    Added {
        item: TransferItem,
    },
    Updated {
        item: TransferItem,
    },
    #[serde(rename_all = "camelCase")]
    Progress {
        id: u64,
        transferred_bytes: u64,
        total_bytes: u64,
    },
    Removed {
        ids: Vec<u64>,
    },
}

struct QueueEntry {
    item: TransferItem,
    control: Arc<TransferControl>,
}

struct QueueState {
    /// Insertion order is scheduling order
    entries: Vec<QueueEntry>,
    next_id: u64,
    active: usize,
    /// Admission bound; may sit below `active` right after being lowered
    limit: usize,
    fs: Option<Arc<dyn RemoteFs>>,
    shut_down: bool,
}

impl QueueState {
    fn entry_mut(&mut self, id: u64) -> Option<&mut QueueEntry> {
        self.entries.iter_mut().find(|e| e.item.id == id)
    }
}

struct QueueInner {
    state: Mutex<QueueState>,
    work: Notify,
    events: broadcast::Sender<TransferEvent>,
    shutdown: CancellationToken,
}

/// Everything a worker needs, copied out of the queue at admission
struct Job {
    id: u64,
    direction: TransferDirection,
    remote_path: String,
    local_path: PathBuf,
    control: Arc<TransferControl>,
    fs: Arc<dyn RemoteFs>,
}

impl QueueInner {
    fn emit(&self, event: TransferEvent) {
        // Err only means nobody is listening
        let _ = self.events.send(event);
    }

    /// Move Pending items to InProgress while slots are free
    fn admit_ready(&self) -> Vec<Job> {
        let mut jobs = Vec::new();
        let mut events = Vec::new();
        {
            let mut guard = self.state.lock();
            let state = &mut *guard;
            if state.shut_down {
                return jobs;
            }
            let Some(fs) = state.fs.clone() else {
                return jobs;
            };

            while state.active < state.limit {
                let Some(entry) = state
                    .entries
                    .iter_mut()
                    .find(|e| e.item.status == TransferStatus::Pending)
                else {
                    break;
                };

                entry.item.status = TransferStatus::InProgress;
                entry.item.start_time = Some(Utc::now());
                state.active += 1;

                events.push(TransferEvent::Updated {
                    item: entry.item.clone(),
                });
                jobs.push(Job {
                    id: entry.item.id,
                    direction: entry.item.direction,
                    remote_path: entry.item.remote_path.clone(),
                    local_path: entry.item.local_path.clone(),
                    control: entry.control.clone(),
                    fs: fs.clone(),
                });
            }
        }

        for event in events {
            self.emit(event);
        }
        jobs
    }

    fn set_total(&self, id: u64, total: u64) {
        let found = {
            let mut state = self.state.lock();
            state
                .entry_mut(id)
                .map(|entry| entry.item.total_bytes = total)
                .is_some()
        };
        if found {
            self.emit(TransferEvent::Progress {
                id,
                transferred_bytes: 0,
                total_bytes: total,
            });
        }
    }

    fn record_progress(&self, id: u64, transferred: u64, total: u64) {
        {
            let mut state = self.state.lock();
            if let Some(entry) = state.entry_mut(id) {
                if entry.item.status == TransferStatus::InProgress {
                    entry.item.transferred_bytes = transferred;
                }
            }
        }
        self.emit(TransferEvent::Progress {
            id,
            transferred_bytes: transferred,
            total_bytes: total,
        });
    }

    /// Mark the item Completed unless a cancel got there first
    fn commit_success(&self, id: u64, bytes: u64) -> bool {
        let mut state = self.state.lock();
        match state.entry_mut(id) {
            Some(entry) if entry.item.status == TransferStatus::InProgress => {
                entry.item.status = TransferStatus::Completed;
                entry.item.transferred_bytes = bytes;
                entry.item.total_bytes = bytes;
                true
            }
            // Cancelled, possibly already cleared
            _ => false,
        }
    }

    fn release(&self, id: u64, outcome: Result<u64, SftpError>) {
        let event = {
            let mut guard = self.state.lock();
            let state = &mut *guard;
            state.active = state.active.saturating_sub(1);

            state.entry_mut(id).map(|entry| {
                let item = &mut entry.item;
                match (item.status, outcome) {
                    (TransferStatus::Cancelled, _) | (TransferStatus::Completed, _) => {}
                    (_, Ok(bytes)) => {
                        item.status = TransferStatus::Completed;
                        item.transferred_bytes = bytes;
                        item.total_bytes = bytes;
                    }
                    (_, Err(SftpError::TransferCancelled)) => {
                        item.status = TransferStatus::Cancelled;
                    }
                    (_, Err(e)) => {
                        item.status = TransferStatus::Failed;
                        item.error = Some(e.to_string());
                    }
                }
                if item.end_time.is_none() {
                    item.end_time = Some(Utc::now());
                }
                TransferEvent::Updated { item: item.clone() }
            })
        };

        if let Some(event) = event {
            self.emit(event);
        }
        self.work.notify_one();
    }
}

/// Holds one concurrency slot for the lifetime of a worker
struct ActiveSlot {
    inner: Arc<QueueInner>,
    id: u64,
    outcome: Option<Result<u64, SftpError>>,
}

impl ActiveSlot {
    fn finish(mut self, outcome: Result<u64, SftpError>) {
        self.outcome = Some(outcome);
    }
}

impl Drop for ActiveSlot {
    fn drop(&mut self) {
        let outcome = self
            .outcome
            .take()
            .unwrap_or_else(|| Err(SftpError::TransferError("transfer task aborted".to_string())));
        self.inner.release(self.id, outcome);
    }
}

async fn run_scheduler(inner: Arc<QueueInner>) {
    loop {
        for job in inner.admit_ready() {
            let slot = ActiveSlot {
                inner: inner.clone(),
                id: job.id,
                outcome: None,
            };
            tokio::spawn(run_job(inner.clone(), job, slot));
        }

        tokio::select! {
            _ = inner.shutdown.cancelled() => break,
            _ = inner.work.notified() => {}
        }
    }
    debug!("Transfer scheduler stopped");
}

async fn run_job(inner: Arc<QueueInner>, job: Job, slot: ActiveSlot) {
    let result = match job.direction {
        TransferDirection::Download => download(&inner, &job).await,
        TransferDirection::Upload => upload(&inner, &job).await,
    };

    match &result {
        Ok(bytes) => info!("Transfer {} completed: {} bytes", job.id, bytes),
        Err(SftpError::TransferCancelled) => info!("Transfer {} cancelled", job.id),
        Err(e) => warn!("Transfer {} failed: {}", job.id, e),
    }
    slot.finish(result);
}

/// Where a partial artifact would be left behind
enum Destination<'a> {
    Local(&'a Path),
    Remote(&'a dyn RemoteFs, &'a str),
}

impl Destination<'_> {
    async fn remove(&self) {
        let result = match self {
            Destination::Local(path) => tokio::fs::remove_file(path).await.map_err(SftpError::from),
            Destination::Remote(fs, path) => fs.remove_file(path).await,
        };
        if let Err(e) = result {
            warn!("Failed to remove partial transfer destination: {}", e);
        }
    }
}

async fn download(inner: &QueueInner, job: &Job) -> Result<u64, SftpError> {
    let total = job.fs.stat(&job.remote_path).await?.size;
    inner.set_total(job.id, total);

    let mut reader = job.fs.open_read(&job.remote_path).await?;
    check_transfer_control(&job.control)?;
    let mut writer = tokio::fs::File::create(&job.local_path)
        .await
        .map_err(|e| SftpError::from_io(e, &job.local_path.to_string_lossy()))?;

    let result = copy_into(inner, job, total, &mut reader, &mut writer).await;
    drop(writer);
    drop(reader);

    settle(inner, job, result, Destination::Local(&job.local_path)).await
}

async fn upload(inner: &QueueInner, job: &Job) -> Result<u64, SftpError> {
    let local = job.local_path.to_string_lossy().to_string();
    let total = tokio::fs::metadata(&job.local_path)
        .await
        .map_err(|e| SftpError::from_io(e, &local))?
        .len();
    inner.set_total(job.id, total);

    let mut reader = tokio::fs::File::open(&job.local_path)
        .await
        .map_err(|e| SftpError::from_io(e, &local))?;
    check_transfer_control(&job.control)?;
    let mut writer = job.fs.create(&job.remote_path).await?;

    let result = copy_into(inner, job, total, &mut reader, &mut writer).await;
    drop(writer);
    drop(reader);

    settle(
        inner,
        job,
        result,
        Destination::Remote(job.fs.as_ref(), &job.remote_path),
    )
    .await
}

async fn copy_into<R, W>(
    inner: &QueueInner,
    job: &Job,
    total: u64,
    reader: &mut R,
    writer: &mut W,
) -> Result<u64, SftpError>
where
    R: AsyncRead + Unpin + ?Sized,
    W: AsyncWrite + Unpin + ?Sized,
{
    let copied = copy_chunks(reader, writer, &job.control, |done| {
        inner.record_progress(job.id, done, total)
    })
    .await?;

    writer
        .shutdown()
        .await
        .map_err(|e| SftpError::TransferError(format!("flush failed: {}", e)))?;
    Ok(copied)
}

/// Commit a finished copy, or remove the destination. Runs before the
/// slot is released so no partial file outlives its item.
async fn settle(
    inner: &QueueInner,
    job: &Job,
    result: Result<u64, SftpError>,
    destination: Destination<'_>,
) -> Result<u64, SftpError> {
    let outcome = result.and_then(|bytes| {
        if inner.commit_success(job.id, bytes) {
            Ok(bytes)
        } else {
            Err(SftpError::TransferCancelled)
        }
    });
    if outcome.is_err() {
        destination.remove().await;
    }
    outcome
}

/// Transfer queue bound to one connection's file sub-channel
pub struct TransferQueue {
    inner: Arc<QueueInner>,
}

impl TransferQueue {
    /// Must be called inside a Tokio runtime; spawns the scheduler.
    pub fn new(max_concurrent: usize) -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        let inner = Arc::new(QueueInner {
            state: Mutex::new(QueueState {
                entries: Vec::new(),
                next_id: 1,
                active: 0,
                limit: max_concurrent.clamp(1, MAX_CONCURRENT_TRANSFERS),
                fs: None,
                shut_down: false,
            }),
            work: Notify::new(),
            events,
            shutdown: CancellationToken::new(),
        });

        tokio::spawn(run_scheduler(inner.clone()));
        Self { inner }
    }

    /// Attach the remote filesystem; Pending items start flowing
    pub fn attach(&self, fs: Arc<dyn RemoteFs>) {
        self.inner.state.lock().fs = Some(fs);
        self.inner.work.notify_one();
    }

    /// Stop admitting new work. Running items keep their own handle.
    pub fn detach(&self) -> Option<Arc<dyn RemoteFs>> {
        self.inner.state.lock().fs.take()
    }

    pub fn is_ready(&self) -> bool {
        let state = self.inner.state.lock();
        state.fs.is_some() && !state.shut_down
    }

    pub fn enqueue_download(
        &self,
        remote_path: &str,
        local_path: impl Into<PathBuf>,
    ) -> Result<TransferItem, SftpError> {
        let file_name = remote_file_name(remote_path).to_string();
        self.enqueue(
            TransferDirection::Download,
            file_name,
            remote_path,
            local_path.into(),
        )
    }

    pub fn enqueue_upload(
        &self,
        local_path: impl Into<PathBuf>,
        remote_path: &str,
    ) -> Result<TransferItem, SftpError> {
        let local_path = local_path.into();
        let file_name = local_file_name(&local_path);
        self.enqueue(TransferDirection::Upload, file_name, remote_path, local_path)
    }

    fn enqueue(
        &self,
        direction: TransferDirection,
        file_name: String,
        remote_path: &str,
        local_path: PathBuf,
    ) -> Result<TransferItem, SftpError> {
        let item = {
            let mut state = self.inner.state.lock();
            if state.shut_down || state.fs.is_none() {
                return Err(SftpError::NotReady);
            }

            let id = state.next_id;
            state.next_id += 1;
            let item = TransferItem {
                id,
                file_name,
                remote_path: remote_path.to_string(),
                local_path,
                direction,
                total_bytes: 0,
                transferred_bytes: 0,
                status: TransferStatus::Pending,
                error: None,
                start_time: None,
                end_time: None,
            };
            state.entries.push(QueueEntry {
                item: item.clone(),
                control: Arc::new(TransferControl::new()),
            });
            item
        };

        debug!("Queued {:?} #{}: {}", direction, item.id, item.remote_path);
        self.inner.emit(TransferEvent::Added { item: item.clone() });
        self.inner.work.notify_one();
        Ok(item)
    }

    /// Cancel a Pending or InProgress item. No-op on terminal items.
    pub fn cancel(&self, id: u64) -> Result<(), SftpError> {
        let event = {
            let mut state = self.inner.state.lock();
            let entry = state.entry_mut(id).ok_or(SftpError::TransferNotFound(id))?;
            match entry.item.status {
                TransferStatus::Pending => {
                    entry.item.status = TransferStatus::Cancelled;
                    entry.item.end_time = Some(Utc::now());
                }
                TransferStatus::InProgress => {
                    // The worker sees this at its next chunk boundary
                    entry.control.cancel();
                    entry.item.status = TransferStatus::Cancelled;
                }
                _ => return Ok(()),
            }
            TransferEvent::Updated {
                item: entry.item.clone(),
            }
        };

        info!("Cancelled transfer {}", id);
        self.inner.emit(event);
        Ok(())
    }

    /// Drop every terminal item from the list. Returns how many went.
    pub fn clear_completed(&self) -> usize {
        let ids: Vec<u64> = {
            let mut state = self.inner.state.lock();
            let ids = state
                .entries
                .iter()
                .filter(|e| e.item.status.is_terminal())
                .map(|e| e.item.id)
                .collect();
            state.entries.retain(|e| !e.item.status.is_terminal());
            ids
        };

        let count = ids.len();
        if count > 0 {
            self.inner.emit(TransferEvent::Removed { ids });
        }
        count
    }

    pub fn items(&self) -> Vec<TransferItem> {
        self.inner
            .state
            .lock()
            .entries
            .iter()
            .map(|e| e.item.clone())
            .collect()
    }

    pub fn get(&self, id: u64) -> Option<TransferItem> {
        self.inner
            .state
            .lock()
            .entries
            .iter()
            .find(|e| e.item.id == id)
            .map(|e| e.item.clone())
    }

    pub fn subscribe(&self) -> broadcast::Receiver<TransferEvent> {
        self.inner.events.subscribe()
    }

    pub fn stats(&self) -> QueueStats {
        let state = self.inner.state.lock();
        let mut stats = QueueStats::default();
        for entry in &state.entries {
            match entry.item.status {
                TransferStatus::Pending => stats.pending += 1,
                TransferStatus::InProgress => stats.in_progress += 1,
                TransferStatus::Completed => stats.completed += 1,
                TransferStatus::Failed => stats.failed += 1,
                TransferStatus::Cancelled => stats.cancelled += 1,
            }
        }
        stats
    }

    /// Running workers, including cancelled ones still unwinding
    pub fn active_count(&self) -> usize {
        self.inner.state.lock().active
    }

    /// Effective bound on running workers.
    ///
    /// After the limit is lowered, workers already running keep it raised
    /// until they drain, so `active_count() <= max_concurrent()` always holds.
    pub fn max_concurrent(&self) -> usize {
        let state = self.inner.state.lock();
        state.limit.max(state.active)
    }

    /// Clamped to 1..=10. Lowering it never interrupts running items; new
    /// admissions wait until the running count is below the new limit.
    pub fn set_max_concurrent(&self, max: usize) {
        let clamped = max.clamp(1, MAX_CONCURRENT_TRANSFERS);
        self.inner.state.lock().limit = clamped;
        info!("Max concurrent transfers set to: {}", clamped);
        self.inner.work.notify_one();
    }

    /// Cancel everything and refuse further work. Idempotent.
    pub fn shutdown(&self) {
        let events: Vec<TransferEvent> = {
            let mut state = self.inner.state.lock();
            if state.shut_down {
                return;
            }
            state.shut_down = true;

            let now = Utc::now();
            state
                .entries
                .iter_mut()
                .filter(|e| !e.item.status.is_terminal())
                .map(|entry| {
                    if entry.item.status == TransferStatus::Pending {
                        entry.item.end_time = Some(now);
                    }
                    entry.control.cancel();
                    entry.item.status = TransferStatus::Cancelled;
                    TransferEvent::Updated {
                        item: entry.item.clone(),
                    }
                })
                .collect()
        };

        self.inner.shutdown.cancel();
        info!("Transfer queue shut down, {} items cancelled", events.len());
        for event in events {
            self.inner.emit(event);
        }
    }

    /// Wait until no worker is running. Returns false on timeout.
    pub async fn wait_idle(&self, timeout: Duration) -> bool {
        tokio::time::timeout(timeout, async {
            while self.active_count() > 0 {
                tokio::time::sleep(IDLE_POLL_INTERVAL).await;
            }
        })
        .await
        .is_ok()
    }
}

impl Default for TransferQueue {
    fn default() -> Self {
        Self::new(DEFAULT_CONCURRENT_TRANSFERS)
    }
}

impl Drop for TransferQueue {
    fn drop(&mut self) {
        self.shutdown();
    }
}
