//! Segment worker - downloads a single segment to a part file
//!
//! Each segment worker is independent and writes to its own part file.
//! On completion, all part files are merged into the final file.

use crate::engine::events::EventSink;
use crate::engine::probe::total_from_content_range;
use crate::engine::progress::ProgressAggregator;
use crate::error::ShetabError;
use futures::TryStreamExt;
use parking_lot::Mutex;
use reqwest::{header, Client, StatusCode};
use shetab_types::{Download, DownloadStatus, TransferMode};
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::fs::{File, OpenOptions};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncSeekExt, AsyncWriteExt};
use tokio_util::io::StreamReader;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Path of the part file holding one segment's bytes
pub fn part_path(dir: &Path, download_id: Uuid, index: u32) -> PathBuf {
    dir.join(format!("{}_segment_{}.part", download_id, index))
}

/// How a worker run ended
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SegmentOutcome {
    /// Every byte of the segment is on disk
    Completed,
    /// The cancellation token was raised; partial bytes are kept
    Interrupted,
    /// Transport or I/O failure, recorded on the segment
    Failed(String),
}

/// Everything a worker shares with its coordinator
#[derive(Clone)]
pub struct WorkerContext {
    pub client: Client,
    pub url: String,
    pub item: Arc<Mutex<Download>>,
    pub cancel: CancellationToken,
    pub mode: TransferMode,
    pub range_supported: bool,
    pub chunk_size: usize,
    pub read_timeout: Duration,
}

/// Pushes snapshots at chunk boundaries (stream mode has no monitor)
pub struct ChunkReporter {
    events: EventSink,
    aggregator: ProgressAggregator,
    interval: Duration,
    last_tick: Option<Instant>,
}

impl ChunkReporter {
    pub fn new(events: EventSink, interval: Duration) -> Self {
        Self {
            events,
            aggregator: ProgressAggregator::new(),
            interval,
            last_tick: None,
        }
    }

    fn report(&mut self, item: &Mutex<Download>) {
        let due = self.last_tick.map_or(true, |t| t.elapsed() >= self.interval);
        let snapshot = if due {
            self.last_tick = Some(Instant::now());
            self.aggregator.tick(item)
        } else {
            let item = item.lock();
            (item.status == DownloadStatus::Downloading).then(|| item.snapshot())
        };
        if let Some(snapshot) = snapshot {
            self.events.progress(snapshot);
        }
    }
}

/// A segment worker that downloads a byte range to a part file
pub struct SegmentWorker {
    download_id: Uuid,
    index: u32,
    part_path: PathBuf,
    ctx: WorkerContext,
    reporter: Option<ChunkReporter>,
}

impl SegmentWorker {
    /// Create a new segment worker
    pub fn new(download_id: Uuid, index: u32, part_dir: &Path, ctx: WorkerContext) -> Self {
        Self {
            download_id,
            index,
            part_path: part_path(part_dir, download_id, index),
            ctx,
            reporter: None,
        }
    }

    /// Report progress on every chunk instead of relying on a monitor
    pub fn with_reporter(mut self, reporter: ChunkReporter) -> Self {
        self.reporter = Some(reporter);
        self
    }

    /// Run the segment download
    pub async fn run(mut self) -> SegmentOutcome {
        let result = self.transfer().await;
        let index = self.index as usize;

        match result {
            Ok(true) => {
                let mut item = self.ctx.item.lock();
                if item.status != DownloadStatus::Downloading {
                    return SegmentOutcome::Interrupted;
                }
                let discovered = {
                    let segment = &mut item.segments[index];
                    segment.complete = true;
                    if segment.is_unknown_size() {
                        if segment.downloaded > 0 {
                            segment.end = segment.start + segment.downloaded - 1;
                        }
                        Some(segment.start + segment.downloaded)
                    } else {
                        None
                    }
                };
                if let Some(size) = discovered {
                    item.size = Some(size);
                }
                info!(
                    "Segment {} of {} complete ({} bytes)",
                    self.index, self.download_id, item.segments[index].downloaded
                );
                SegmentOutcome::Completed
            }
            Ok(false) => {
                info!("Segment {} of {} interrupted", self.index, self.download_id);
                SegmentOutcome::Interrupted
            }
            Err(_) if self.ctx.cancel.is_cancelled() => {
                debug!(
                    "Segment {} of {} stopped during cancellation",
                    self.index, self.download_id
                );
                SegmentOutcome::Interrupted
            }
            Err(e) => {
                let message = format!("segment {}: {}", self.index, e);
                let mut item = self.ctx.item.lock();
                if item.status != DownloadStatus::Downloading {
                    return SegmentOutcome::Interrupted;
                }
                warn!("Download {} {}", self.download_id, message);
                item.segments[index].error = Some(message.clone());
                SegmentOutcome::Failed(message)
            }
        }
    }

    /// Returns `Ok(true)` when the segment finished, `Ok(false)` when interrupted
    async fn transfer(&mut self) -> Result<bool, ShetabError> {
        let index = self.index as usize;
        let (start, end, downloaded, unknown_size) = {
            let item = self.ctx.item.lock();
            let segment = &item.segments[index];
            if segment.complete {
                return Ok(true);
            }
            (
                segment.start,
                segment.end,
                segment.downloaded,
                segment.is_unknown_size(),
            )
        };

        let mut file = self.open_part_file(downloaded).await?;

        let start_byte = start + downloaded;
        if !unknown_size && start_byte > end {
            return Ok(true);
        }

        let ranged = match self.ctx.mode {
            TransferMode::Segmented => true,
            TransferMode::Stream => downloaded > 0 && self.ctx.range_supported,
        };

        let mut request = self.ctx.client.get(&self.ctx.url);
        if ranged {
            let range_header = if unknown_size {
                format!("bytes={}-", start_byte)
            } else {
                format!("bytes={}-{}", start_byte, end)
            };
            debug!("Segment {} requesting range: {}", self.index, range_header);
            request = request.header(header::RANGE, range_header);
        }

        let send = tokio::time::timeout(self.ctx.read_timeout, request.send());
        let response = tokio::select! {
            biased;
            _ = self.ctx.cancel.cancelled() => return Ok(false),
            response = send => response.map_err(|_| ShetabError::Timeout)??,
        };

        let status = response.status();
        if ranged && status != StatusCode::PARTIAL_CONTENT {
            return Err(if status.is_success() {
                ShetabError::RangeIgnored {
                    index: self.index,
                    status: status.as_u16(),
                }
            } else {
                ShetabError::ServerError {
                    status: status.as_u16(),
                    message: format!("segment {} request rejected", self.index),
                }
            });
        }
        if !status.is_success() {
            return Err(ShetabError::ServerError {
                status: status.as_u16(),
                message: format!("segment {} request rejected", self.index),
            });
        }

        if unknown_size {
            self.discover_size(&response, start_byte);
        }

        let stream = response
            .bytes_stream()
            .map_err(|e| io::Error::new(io::ErrorKind::Other, e));
        let reader = StreamReader::new(stream);
        tokio::pin!(reader);

        // Always flush, so a resumed worker sees every counted byte on disk
        let pumped = self.pump(reader, &mut file).await;
        let flushed = file.flush().await;
        let finished = pumped?;
        flushed?;

        if !finished {
            return Ok(false);
        }

        file.sync_all().await?;

        let item = self.ctx.item.lock();
        let segment = &item.segments[index];
        if !segment.is_unknown_size() && segment.downloaded < segment.size() {
            return Err(ShetabError::Truncated {
                expected: segment.size(),
                received: segment.downloaded,
            });
        }
        Ok(true)
    }

    /// Open the part file positioned after the bytes already counted
    async fn open_part_file(&self, downloaded: u64) -> Result<File, ShetabError> {
        let mut file = OpenOptions::new()
            .create(true)
            .write(true)
            .open(&self.part_path)
            .await?;

        let existing = file.metadata().await?.len();
        if existing < downloaded {
            return Err(ShetabError::Io(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                format!(
                    "part file {:?} holds {} bytes but {} were recorded",
                    self.part_path, existing, downloaded
                ),
            )));
        }
        if existing > downloaded {
            file.set_len(downloaded).await?;
        }
        file.seek(io::SeekFrom::Start(downloaded)).await?;

        if downloaded > 0 {
            info!("Resuming segment {} from byte {}", self.index, downloaded);
        }
        Ok(file)
    }

    /// Learn the total length of an open-ended stream from its headers
    fn discover_size(&self, response: &reqwest::Response, start_byte: u64) {
        let headers = response.headers();
        let total = headers
            .get(header::CONTENT_RANGE)
            .and_then(|v| v.to_str().ok())
            .and_then(total_from_content_range)
            .or_else(|| {
                headers
                    .get(header::CONTENT_LENGTH)
                    .and_then(|v| v.to_str().ok())
                    .and_then(|v| v.parse::<u64>().ok())
                    .map(|len| start_byte + len)
            });

        if let Some(total) = total.filter(|&total| total > 0) {
            let mut item = self.ctx.item.lock();
            if item.status != DownloadStatus::Downloading {
                return;
            }
            info!("Got total size from response headers: {} bytes", total);
            item.segments[self.index as usize].end = total - 1;
            item.size = Some(total);
        }
    }

    /// Copy the body into the part file chunk by chunk
    async fn pump<R>(&mut self, mut reader: R, file: &mut File) -> Result<bool, ShetabError>
    where
        R: AsyncRead + Unpin,
    {
        let index = self.index as usize;
        let mut buffer = vec![0u8; self.ctx.chunk_size];

        loop {
            let read = tokio::time::timeout(self.ctx.read_timeout, reader.read(&mut buffer));
            let n = tokio::select! {
                biased;
                _ = self.ctx.cancel.cancelled() => return Ok(false),
                read = read => read.map_err(|_| ShetabError::Timeout)??,
            };
            if n == 0 {
                return Ok(true);
            }

            let overflow = {
                let item = self.ctx.item.lock();
                let segment = &item.segments[index];
                segment
                    .remaining()
                    .is_some_and(|remaining| n as u64 > remaining)
                    .then(|| segment.size())
            };
            if let Some(expected) = overflow {
                return Err(ShetabError::Overflow { expected });
            }

            file.write_all(&buffer[..n]).await?;

            // Bytes written after a pause or cancel stay uncounted; a resumed
            // worker truncates the part file back to the counter
            {
                let mut item = self.ctx.item.lock();
                if item.status != DownloadStatus::Downloading {
                    return Ok(false);
                }
                item.segments[index].downloaded += n as u64;
                item.downloaded += n as u64;
            }

            if let Some(reporter) = self.reporter.as_mut() {
                reporter.report(&self.ctx.item);
            }

            if self.ctx.cancel.is_cancelled() {
                return Ok(false);
            }
        }
    }
}
