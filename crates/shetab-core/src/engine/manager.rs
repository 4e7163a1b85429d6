//! Download Manager - registry and worker pool for all downloads
//!
//! This is the top-level coordinator that:
//! - Validates and registers submitted downloads
//! - Starts/pauses/resumes/cancels downloads
//! - Keeps at most `max_concurrent_downloads` items downloading
//! - Runs the dispatcher tasks that admit queued items as slots free up

use crate::engine::download_task::{part_files, DownloadTask, TaskOutcome};
use crate::engine::events::{EventSink, ProgressCallback};
use crate::engine::merger::remove_parts;
use crate::engine::probe::{sanitize_filename, FileProbe};
use crate::error::ShetabError;
use chrono::Utc;
use parking_lot::Mutex;
use reqwest::Client;
use shetab_types::{
    CoreEvent, Download, DownloadSnapshot, DownloadStatus, EngineConfig, HistoryRecord, LinkInfo,
    TransferMode,
};
use std::collections::{HashMap, HashSet, VecDeque};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use tokio::sync::{broadcast, Notify};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use url::Url;
use uuid::Uuid;

const EVENT_CAPACITY: usize = 1024;

/// Per-download control state
struct DownloadEntry {
    item: Arc<Mutex<Download>>,
    /// Token of the current run; replaced on every start
    cancel: Mutex<CancellationToken>,
    /// Handle of the current run, awaited by the next run and by cancel
    task: Mutex<Option<JoinHandle<()>>>,
    /// Set once the merge begins
    finalizing: Arc<AtomicBool>,
}

impl DownloadEntry {
    fn new(download: Download) -> Self {
        Self {
            item: Arc::new(Mutex::new(download)),
            cancel: Mutex::new(CancellationToken::new()),
            task: Mutex::new(None),
            finalizing: Arc::new(AtomicBool::new(false)),
        }
    }

    fn status(&self) -> DownloadStatus {
        self.item.lock().status
    }
}

#[derive(Default)]
struct RegistryState {
    items: HashMap<Uuid, Arc<DownloadEntry>>,
    /// Items holding a concurrency slot
    active: HashSet<Uuid>,
    /// FIFO of items waiting for a slot
    pending: VecDeque<Uuid>,
}

/// Download manager that coordinates all downloads
pub struct DownloadManager {
    config: Arc<EngineConfig>,
    /// HTTP client shared by every request
    client: Client,
    /// Directory for segment part files
    temp_dir: PathBuf,
    /// Lock order: `state`, then an item, then its token or task slot
    state: Mutex<RegistryState>,
    history: Mutex<Vec<HistoryRecord>>,
    events: EventSink,
    notify: Arc<Notify>,
    shutdown: CancellationToken,
}

impl DownloadManager {
    /// Create a new download manager
    ///
    /// Must be called from within a tokio runtime; the dispatcher tasks are
    /// spawned immediately.
    pub fn new(config: EngineConfig) -> Result<Arc<Self>, ShetabError> {
        Self::with_callback(config, None)
    }

    /// Create a manager that also invokes `callback` on every progress tick
    /// and status change
    pub fn with_callback(
        config: EngineConfig,
        callback: Option<ProgressCallback>,
    ) -> Result<Arc<Self>, ShetabError> {
        let config = config.normalized();

        let temp_dir = config
            .temp_dir
            .clone()
            .unwrap_or_else(|| std::env::temp_dir().join("shetab"));
        std::fs::create_dir_all(&temp_dir)?;

        let client = Client::builder()
            .user_agent(config.user_agent.as_str())
            .connect_timeout(config.connect_timeout())
            .build()?;

        let manager = Arc::new(Self {
            config: Arc::new(config),
            client,
            temp_dir,
            state: Mutex::new(RegistryState::default()),
            history: Mutex::new(Vec::new()),
            events: EventSink::new(EVENT_CAPACITY, callback),
            notify: Arc::new(Notify::new()),
            shutdown: CancellationToken::new(),
        });
        manager.spawn_dispatchers();

        info!(
            "Download manager ready: {} concurrent, {} segments max, parts in {:?}",
            manager.config.max_concurrent_downloads,
            manager.config.max_segments_per_download,
            manager.temp_dir
        );
        Ok(manager)
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Subscribe to engine events
    pub fn subscribe(&self) -> broadcast::Receiver<CoreEvent> {
        self.events.subscribe()
    }

    /// Probe a URL for metadata without registering anything
    pub async fn probe_url(&self, url: &str) -> Result<LinkInfo, ShetabError> {
        let url = parse_url(url)?;
        FileProbe::new(self.client.clone(), self.config.read_timeout())
            .probe(&url)
            .await
    }

    /// Register a download and start it if a slot is free
    ///
    /// Validation failures create nothing. Everything after this call is
    /// reported through snapshots, events and the callback.
    pub fn submit(
        self: &Arc<Self>,
        url: &str,
        destination: impl AsRef<Path>,
        filename: Option<&str>,
    ) -> Result<Uuid, ShetabError> {
        let url = parse_url(url)?;
        let destination = destination.as_ref();
        validate_destination(destination)?;

        let mut download = Download::new(url.to_string(), destination.to_path_buf());
        if let Some(name) = filename {
            download.filename =
                sanitize_filename(name).ok_or_else(|| ShetabError::InvalidDestination {
                    path: destination.join(name),
                    reason: "not a valid file name".to_string(),
                })?;
            download.explicit_filename = true;
        }

        let id = download.id;
        info!("Submitted download {} for {}", id, url);
        self.events.added(&download);
        self.state
            .lock()
            .items
            .insert(id, Arc::new(DownloadEntry::new(download)));

        self.start(id);
        Ok(id)
    }

    /// Start a `Pending` or `Paused` download, queueing it when no slot is free
    pub fn start(self: &Arc<Self>, id: Uuid) -> bool {
        self.request_slot(id, |status| {
            matches!(status, DownloadStatus::Pending | DownloadStatus::Paused)
        })
    }

    /// Resume a `Paused` download, queueing it when no slot is free
    pub fn resume(self: &Arc<Self>, id: Uuid) -> bool {
        self.request_slot(id, |status| status == DownloadStatus::Paused)
    }

    fn request_slot(self: &Arc<Self>, id: Uuid, allowed: impl Fn(DownloadStatus) -> bool) -> bool {
        let launched = {
            let mut state = self.state.lock();
            let Some(entry) = state.items.get(&id).cloned() else {
                return false;
            };
            if !allowed(entry.status()) || state.active.contains(&id) {
                return false;
            }

            if state.active.len() < self.config.max_concurrent_downloads {
                self.launch(&mut state, id, &entry)
            } else {
                if !state.pending.contains(&id) {
                    debug!("No free slot, queueing download {}", id);
                    state.pending.push_back(id);
                }
                None
            }
        };

        if let Some(snapshot) = launched {
            self.events.status_changed(snapshot);
        }
        true
    }

    /// Claim a slot and spawn a run; called with the registry lock held
    fn launch(
        self: &Arc<Self>,
        state: &mut RegistryState,
        id: Uuid,
        entry: &Arc<DownloadEntry>,
    ) -> Option<DownloadSnapshot> {
        let cancel = CancellationToken::new();
        let snapshot = {
            let mut item = entry.item.lock();
            if !item.status.can_transition_to(DownloadStatus::Downloading) {
                return None;
            }

            // A stream without range support can only start over
            if item.transfer_mode() == TransferMode::Stream
                && !item.range_supported
                && item.downloaded > 0
            {
                info!("Download {} cannot resume, restarting from byte 0", id);
                for segment in &mut item.segments {
                    segment.downloaded = 0;
                    segment.complete = false;
                    segment.error = None;
                }
                item.downloaded = 0;
            }

            item.status = DownloadStatus::Downloading;
            item.error = None;
            item.speed = 0;
            item.started_at.get_or_insert_with(Utc::now);
            entry.finalizing.store(false, Ordering::SeqCst);
            *entry.cancel.lock() = cancel.clone();
            item.snapshot()
        };

        state.active.insert(id);
        state.pending.retain(|queued| *queued != id);

        let task = DownloadTask::new(
            id,
            Arc::clone(&entry.item),
            self.client.clone(),
            Arc::clone(&self.config),
            self.temp_dir.clone(),
            self.events.clone(),
            cancel,
            Arc::clone(&entry.finalizing),
        );

        let manager = Arc::downgrade(self);
        let mut slot = entry.task.lock();
        let task = task.after(slot.take());
        *slot = Some(tokio::spawn(async move {
            let outcome = task.run().await;
            if let Some(manager) = manager.upgrade() {
                manager.finish_run(id, outcome).await;
            }
        }));

        info!(
            "Started download {} ({} of {} slots in use)",
            id,
            state.active.len(),
            self.config.max_concurrent_downloads
        );
        Some(snapshot)
    }

    /// Apply the terminal status reported by a finished run
    async fn finish_run(&self, id: Uuid, outcome: TaskOutcome) {
        let (status, error) = match outcome {
            TaskOutcome::Interrupted => return,
            TaskOutcome::Completed => (DownloadStatus::Completed, None),
            TaskOutcome::Failed(message) => (DownloadStatus::Error, Some(message)),
        };

        let Some(entry) = self.state.lock().items.get(&id).cloned() else {
            return;
        };

        let settled = {
            let mut item = entry.item.lock();
            if item.status == DownloadStatus::Downloading {
                item.status = status;
                item.error = error;
                item.speed = 0;
                item.completed_at = Some(Utc::now());
                Ok((item.snapshot(), item.history_record()))
            } else {
                Err((item.status, item.path()))
            }
        };

        match settled {
            Ok((snapshot, record)) => {
                self.release_slot(id);
                self.events.status_changed(snapshot);
                self.record(record);
            }
            Err((current, output)) => {
                // Cancelled while the merge was running
                if status == DownloadStatus::Completed && current == DownloadStatus::Canceled {
                    if let Err(e) = tokio::fs::remove_file(&output).await {
                        warn!("Failed to remove cancelled output {:?}: {}", output, e);
                    }
                }
            }
        }
    }

    /// Pause a downloading item; part files are kept
    pub fn pause(&self, id: Uuid) -> bool {
        let snapshot = {
            let mut state = self.state.lock();
            let Some(entry) = state.items.get(&id).cloned() else {
                return false;
            };

            let snapshot = {
                let mut item = entry.item.lock();
                if item.status != DownloadStatus::Downloading
                    || entry.finalizing.load(Ordering::SeqCst)
                {
                    return false;
                }
                item.status = DownloadStatus::Paused;
                item.speed = 0;
                entry.cancel.lock().cancel();
                item.snapshot()
            };

            state.active.remove(&id);
            snapshot
        };

        info!("Paused download {}", id);
        self.notify.notify_one();
        self.events.status_changed(snapshot);
        true
    }

    /// Cancel a non-terminal download and delete its partial data
    ///
    /// Returns once the run has exited and no part files remain.
    pub async fn cancel(&self, id: Uuid) -> bool {
        let (entry, snapshot, record, freed) = {
            let mut state = self.state.lock();
            let Some(entry) = state.items.get(&id).cloned() else {
                return false;
            };

            let (snapshot, record) = {
                let mut item = entry.item.lock();
                if !item.status.can_transition_to(DownloadStatus::Canceled) {
                    return false;
                }
                item.status = DownloadStatus::Canceled;
                item.speed = 0;
                item.completed_at = Some(Utc::now());
                entry.cancel.lock().cancel();
                (item.snapshot(), item.history_record())
            };

            state.pending.retain(|queued| *queued != id);
            let freed = state.active.remove(&id);
            (entry, snapshot, record, freed)
        };

        info!("Cancelled download {}", id);
        if freed {
            self.notify.notify_one();
        }
        self.events.status_changed(snapshot);

        let running = entry.task.lock().take();
        if let Some(handle) = running {
            let _ = handle.await;
        }

        let parts = part_files(&self.temp_dir, &entry.item.lock());
        remove_parts(&parts).await;

        self.record(record);
        true
    }

    /// Remove a download from the registry, cancelling it first if needed
    pub async fn remove(&self, id: Uuid) -> bool {
        let Some(entry) = self.state.lock().items.get(&id).cloned() else {
            return false;
        };

        if !entry.status().is_terminal() {
            self.cancel(id).await;
        }

        let removed = {
            let mut state = self.state.lock();
            state.pending.retain(|queued| *queued != id);
            state.items.remove(&id).is_some()
        };

        if removed {
            info!("Removed download {}", id);
            self.events.removed(id);
        }
        removed
    }

    pub fn get_status(&self, id: Uuid) -> Option<DownloadSnapshot> {
        let entry = self.state.lock().items.get(&id).cloned()?;
        let snapshot = entry.item.lock().snapshot();
        Some(snapshot)
    }

    /// Snapshots of every registered download, oldest first
    pub fn get_all(&self) -> Vec<DownloadSnapshot> {
        let state = self.state.lock();
        let mut items: Vec<_> = state
            .items
            .values()
            .map(|entry| {
                let item = entry.item.lock();
                (item.created_at, item.snapshot())
            })
            .collect();
        items.sort_by_key(|(created_at, _)| *created_at);
        items.into_iter().map(|(_, snapshot)| snapshot).collect()
    }

    /// Full copy of a download, segments included
    pub fn get_download(&self, id: Uuid) -> Option<Download> {
        let entry = self.state.lock().items.get(&id).cloned()?;
        let download = entry.item.lock().clone();
        Some(download)
    }

    /// Number of downloads holding a slot
    pub fn active_count(&self) -> usize {
        self.state.lock().active.len()
    }

    /// Records of every download that reached a terminal state
    pub fn history(&self) -> Vec<HistoryRecord> {
        self.history.lock().clone()
    }

    pub fn clear_history(&self) {
        self.history.lock().clear();
    }

    /// Stop the dispatcher tasks; running downloads are left alone
    pub fn shutdown(&self) {
        self.shutdown.cancel();
    }

    fn record(&self, record: HistoryRecord) {
        self.history.lock().push(record.clone());
        self.events.finished(record);
    }

    fn release_slot(&self, id: Uuid) {
        if self.state.lock().active.remove(&id) {
            self.notify.notify_one();
        }
    }

    fn spawn_dispatchers(self: &Arc<Self>) {
        for worker in 0..self.config.dispatcher_workers {
            let manager: Weak<Self> = Arc::downgrade(self);
            let notify = Arc::clone(&self.notify);
            let shutdown = self.shutdown.clone();

            tokio::spawn(async move {
                debug!("Dispatcher {} started", worker);
                loop {
                    {
                        let Some(manager) = manager.upgrade() else {
                            break;
                        };
                        while manager.dispatch_next() {}
                    }

                    tokio::select! {
                        _ = shutdown.cancelled() => break,
                        _ = notify.notified() => {}
                    }
                }
                debug!("Dispatcher {} stopped", worker);
            });
        }
    }

    /// Admit the next queued item if a slot is free; false when idle
    fn dispatch_next(self: &Arc<Self>) -> bool {
        let launched = {
            let mut state = self.state.lock();
            if state.active.len() >= self.config.max_concurrent_downloads {
                return false;
            }

            let mut next = None;
            while let Some(id) = state.pending.pop_front() {
                if let Some(entry) = state.items.get(&id) {
                    if entry.status().can_transition_to(DownloadStatus::Downloading) {
                        next = Some((id, Arc::clone(entry)));
                        break;
                    }
                }
            }

            if next.is_none() && self.config.auto_resume_paused {
                next = state
                    .items
                    .iter()
                    .filter(|(id, entry)| {
                        !state.active.contains(*id) && entry.status() == DownloadStatus::Paused
                    })
                    .min_by_key(|(_, entry)| entry.item.lock().created_at)
                    .map(|(id, entry)| (*id, Arc::clone(entry)));
                if let Some((id, _)) = &next {
                    info!("Auto-resuming paused download {}", id);
                }
            }

            let Some((id, entry)) = next else {
                return false;
            };
            self.launch(&mut state, id, &entry)
        };

        if let Some(snapshot) = launched {
            self.events.status_changed(snapshot);
        }
        true
    }
}

impl Drop for DownloadManager {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

fn parse_url(url: &str) -> Result<Url, ShetabError> {
    let parsed = Url::parse(url).map_err(|e| ShetabError::InvalidUrl(format!("{}: {}", url, e)))?;
    match parsed.scheme() {
        "http" | "https" => Ok(parsed),
        scheme => Err(ShetabError::InvalidUrl(format!(
            "unsupported scheme {:?} in {}",
            scheme, url
        ))),
    }
}

fn validate_destination(path: &Path) -> Result<(), ShetabError> {
    let invalid = |reason: &str| ShetabError::InvalidDestination {
        path: path.to_path_buf(),
        reason: reason.to_string(),
    };

    let metadata = std::fs::metadata(path).map_err(|_| invalid("does not exist"))?;
    if !metadata.is_dir() {
        return Err(invalid("not a directory"));
    }
    if metadata.permissions().readonly() {
        return Err(invalid("not writable"));
    }
    Ok(())
}
