//! Download task - coordinates segment workers for one download
//!
//! A task runs once per start or resume. It probes and plans the download on
//! its first run, spawns one worker per incomplete segment, monitors their
//! progress and merges the part files when every segment is complete.
//! Status changes into terminal states are applied by the manager from the
//! returned [`TaskOutcome`].

use crate::engine::events::EventSink;
use crate::engine::merger::{remove_parts, PartMerger};
use crate::engine::planner::plan_segments;
use crate::engine::probe::FileProbe;
use crate::engine::progress::ProgressAggregator;
use crate::engine::segment_worker::{
    part_path, ChunkReporter, SegmentOutcome, SegmentWorker, WorkerContext,
};
use crate::error::ShetabError;
use parking_lot::Mutex;
use reqwest::Client;
use shetab_types::{Download, DownloadStatus, EngineConfig, TransferMode};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::task::{JoinHandle, JoinSet};
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};
use url::Url;
use uuid::Uuid;

/// How a task run ended
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TaskOutcome {
    /// All bytes merged into the final file
    Completed,
    /// Probe, transfer or merge failure; the item becomes `Error`
    Failed(String),
    /// Paused or cancelled; the manager already applied the status
    Interrupted,
}

/// Part files of every planned segment, in index order
pub fn part_files(part_dir: &Path, download: &Download) -> Vec<PathBuf> {
    download
        .segments
        .iter()
        .map(|s| part_path(part_dir, download.id, s.index))
        .collect()
}

/// One run of a download
pub struct DownloadTask {
    id: Uuid,
    item: Arc<Mutex<Download>>,
    client: Client,
    config: Arc<EngineConfig>,
    part_dir: PathBuf,
    events: EventSink,
    cancel: CancellationToken,
    finalizing: Arc<AtomicBool>,
    previous: Option<JoinHandle<()>>,
}

impl DownloadTask {
    /// Create a new download task
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        id: Uuid,
        item: Arc<Mutex<Download>>,
        client: Client,
        config: Arc<EngineConfig>,
        part_dir: PathBuf,
        events: EventSink,
        cancel: CancellationToken,
        finalizing: Arc<AtomicBool>,
    ) -> Self {
        Self {
            id,
            item,
            client,
            config,
            part_dir,
            events,
            cancel,
            finalizing,
            previous: None,
        }
    }

    /// Wait for an earlier run of the same item before touching its files
    pub fn after(mut self, previous: Option<JoinHandle<()>>) -> Self {
        self.previous = previous;
        self
    }

    /// Run the download to completion, failure or interruption
    pub async fn run(mut self) -> TaskOutcome {
        if let Some(previous) = self.previous.take() {
            debug!("Download {} waiting for previous run to exit", self.id);
            let _ = previous.await;
        }

        if self.cancel.is_cancelled() {
            return TaskOutcome::Interrupted;
        }

        info!("Starting download task for {}", self.id);

        match self.execute().await {
            Ok(outcome) => outcome,
            Err(e) => self.fail(e.to_string()).await,
        }
    }

    async fn execute(&self) -> Result<TaskOutcome, ShetabError> {
        let planned = self.item.lock().is_planned();
        if !planned {
            let interrupted = self.prepare().await?;
            if interrupted {
                return Ok(TaskOutcome::Interrupted);
            }
        }

        let mode = self.item.lock().transfer_mode();
        match mode {
            TransferMode::Stream => self.download_stream().await,
            TransferMode::Segmented => self.download_segmented().await,
        }
    }

    /// Probe the URL and store the segment plan; returns true if interrupted
    async fn prepare(&self) -> Result<bool, ShetabError> {
        let url = {
            let item = self.item.lock();
            Url::parse(&item.url).map_err(|e| ShetabError::InvalidUrl(e.to_string()))?
        };

        let probe = FileProbe::new(self.client.clone(), self.config.read_timeout());
        let info = tokio::select! {
            biased;
            _ = self.cancel.cancelled() => return Ok(true),
            info = probe.probe(&url) => info?,
        };

        let plan = plan_segments(
            info.size,
            info.resumable,
            self.config.max_segments_per_download,
            self.config.min_segment_size,
        );

        let mut item = self.item.lock();
        if item.status != DownloadStatus::Downloading {
            return Ok(true);
        }
        item.size = info.size;
        item.range_supported = info.resumable;
        item.final_url = info.final_url;
        if !item.explicit_filename {
            if let Some(filename) = info.filename {
                item.filename = filename;
            }
        }
        item.segments = plan.segments;

        info!(
            "Download {} planned: {:?} mode, {} segment(s), size {:?}, file {:?}",
            self.id,
            plan.mode,
            item.segments.len(),
            item.size,
            item.filename
        );
        Ok(false)
    }

    fn worker_context(&self, cancel: CancellationToken) -> WorkerContext {
        let item = self.item.lock();
        WorkerContext {
            client: self.client.clone(),
            url: item.effective_url().to_string(),
            item: Arc::clone(&self.item),
            cancel,
            mode: item.transfer_mode(),
            range_supported: item.range_supported,
            chunk_size: self.config.chunk_size,
            read_timeout: self.config.read_timeout(),
        }
    }

    /// Single connection; progress is reported at chunk boundaries
    async fn download_stream(&self) -> Result<TaskOutcome, ShetabError> {
        let ctx = self.worker_context(self.cancel.clone());
        let reporter = ChunkReporter::new(self.events.clone(), self.config.monitor_interval());
        let worker = SegmentWorker::new(self.id, 0, &self.part_dir, ctx).with_reporter(reporter);

        match worker.run().await {
            SegmentOutcome::Completed => self.finalize().await,
            SegmentOutcome::Interrupted => Ok(TaskOutcome::Interrupted),
            SegmentOutcome::Failed(message) => Ok(self.fail(message).await),
        }
    }

    /// One worker per incomplete segment, watched by the monitor loop
    async fn download_segmented(&self) -> Result<TaskOutcome, ShetabError> {
        let workers_cancel = self.cancel.child_token();
        let ctx = self.worker_context(workers_cancel.clone());

        let incomplete: Vec<u32> = {
            let item = self.item.lock();
            item.segments
                .iter()
                .filter(|s| !s.complete)
                .map(|s| s.index)
                .collect()
        };
        info!(
            "Download {} spawning {} segment worker(s)",
            self.id,
            incomplete.len()
        );

        let mut workers = JoinSet::new();
        for index in incomplete {
            let worker = SegmentWorker::new(self.id, index, &self.part_dir, ctx.clone());
            workers.spawn(worker.run());
        }

        let mut aggregator = ProgressAggregator::new();
        let mut ticker = tokio::time::interval(self.config.monitor_interval());
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = ticker.tick() => {}
                Some(joined) = workers.join_next(), if !workers.is_empty() => {
                    if let Err(e) = joined {
                        workers_cancel.cancel();
                        drain(&mut workers).await;
                        return Ok(self.fail(format!("segment worker crashed: {}", e)).await);
                    }
                    continue;
                }
            }

            if self.cancel.is_cancelled() {
                drain(&mut workers).await;
                return Ok(TaskOutcome::Interrupted);
            }

            if let Some(snapshot) = aggregator.tick(&self.item) {
                self.events.progress(snapshot);
            }

            let (failure, all_complete) = {
                let item = self.item.lock();
                let failure = item.segments.iter().find_map(|s| s.error.clone());
                let all_complete = item.segments.iter().all(|s| s.complete);
                (failure, all_complete)
            };

            if let Some(message) = failure {
                workers_cancel.cancel();
                drain(&mut workers).await;
                return Ok(self.fail(message).await);
            }

            if all_complete {
                drain(&mut workers).await;
                return self.finalize().await;
            }
        }
    }

    /// Merge the parts; pause is refused from here on
    async fn finalize(&self) -> Result<TaskOutcome, ShetabError> {
        let (parts, output, expected) = {
            let mut item = self.item.lock();
            if item.status != DownloadStatus::Downloading {
                return Ok(TaskOutcome::Interrupted);
            }
            self.finalizing.store(true, Ordering::SeqCst);

            let downloaded: u64 = item.segments.iter().map(|s| s.downloaded).sum();
            item.downloaded = downloaded;
            let expected = *item.size.get_or_insert(downloaded);
            (part_files(&self.part_dir, &item), item.path(), expected)
        };

        match PartMerger::merge(&parts, &output, expected).await {
            Ok(_) => {
                info!("Download {} completed: {:?}", self.id, output);
                Ok(TaskOutcome::Completed)
            }
            Err(e) => Ok(TaskOutcome::Failed(e.to_string())),
        }
    }

    /// Drop all partial data and report the failure
    async fn fail(&self, message: String) -> TaskOutcome {
        let parts = {
            let item = self.item.lock();
            // Paused or cancelled in the meantime; that status wins
            if item.status != DownloadStatus::Downloading {
                return TaskOutcome::Interrupted;
            }
            part_files(&self.part_dir, &item)
        };

        error!("Download {} failed: {}", self.id, message);
        remove_parts(&parts).await;
        TaskOutcome::Failed(message)
    }
}

async fn drain(workers: &mut JoinSet<SegmentOutcome>) {
    while workers.join_next().await.is_some() {}
}
