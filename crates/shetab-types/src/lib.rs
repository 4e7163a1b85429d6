//! Shared types for Shetab
//!
//! This crate contains the data model shared between the download engine
//! and its callers (the CLI, or any other front end).

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;
use uuid::Uuid;

// ============================================================================
// Download Types
// ============================================================================

/// Represents a single download item
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Download {
    pub id: Uuid,
    pub url: String,
    /// URL after following redirects during the probe
    pub final_url: Option<String>,
    pub filename: String,
    /// Whether `filename` was chosen by the caller (the probe must not replace it)
    #[serde(default)]
    pub explicit_filename: bool,
    /// Destination directory
    pub destination: PathBuf,
    pub size: Option<u64>,
    pub downloaded: u64,
    /// Current speed in bytes per second
    pub speed: u64,
    pub status: DownloadStatus,
    #[serde(default)]
    pub range_supported: bool,
    pub segments: Vec<Segment>,
    pub error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl Download {
    pub fn new(url: String, destination: PathBuf) -> Self {
        let id = Uuid::new_v4();
        let filename = placeholder_filename(id);

        Self {
            id,
            url,
            final_url: None,
            filename,
            explicit_filename: false,
            destination,
            size: None,
            downloaded: 0,
            speed: 0,
            status: DownloadStatus::Pending,
            range_supported: false,
            segments: Vec::new(),
            error: None,
            created_at: Utc::now(),
            started_at: None,
            completed_at: None,
        }
    }

    /// Full path of the final output file
    pub fn path(&self) -> PathBuf {
        self.destination.join(&self.filename)
    }

    /// URL to fetch bytes from (post-redirect when known)
    pub fn effective_url(&self) -> &str {
        self.final_url.as_deref().unwrap_or(&self.url)
    }

    /// Whether the segment plan has been computed
    pub fn is_planned(&self) -> bool {
        !self.segments.is_empty()
    }

    pub fn transfer_mode(&self) -> TransferMode {
        if self.segments.len() > 1 {
            TransferMode::Segmented
        } else {
            TransferMode::Stream
        }
    }

    pub fn progress(&self) -> f64 {
        match self.size {
            Some(size) if size > 0 => {
                ((self.downloaded as f64 / size as f64) * 100.0).min(100.0)
            }
            _ => 0.0,
        }
    }

    /// Estimated seconds remaining at the current speed
    pub fn eta(&self) -> Option<u64> {
        match self.size {
            Some(size) if self.speed > 0 => Some(size.saturating_sub(self.downloaded) / self.speed),
            _ => None,
        }
    }

    pub fn snapshot(&self) -> DownloadSnapshot {
        DownloadSnapshot {
            id: self.id,
            status: self.status,
            filename: self.filename.clone(),
            downloaded: self.downloaded,
            total: self.size,
            speed: self.speed,
            progress_percent: self.progress(),
            eta_secs: self.eta(),
            error: self.error.clone(),
        }
    }

    pub fn history_record(&self) -> HistoryRecord {
        HistoryRecord {
            id: self.id,
            url: self.url.clone(),
            destination_path: self.path(),
            filename: self.filename.clone(),
            size: self.size,
            status: self.status,
            start_time: self.started_at,
            end_time: self.completed_at,
            error_message: self.error.clone(),
        }
    }
}

/// Name used until the probe (or the caller) provides a better one
pub fn placeholder_filename(id: Uuid) -> String {
    let short = id.simple().to_string();
    format!("download_{}", &short[..8])
}

/// Status of a download
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DownloadStatus {
    Pending,
    Downloading,
    Paused,
    Completed,
    Error,
    Canceled,
}

impl DownloadStatus {
    /// Terminal items are frozen until removed
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            DownloadStatus::Completed | DownloadStatus::Error | DownloadStatus::Canceled
        )
    }

    /// The transition table of the download state machine
    pub fn can_transition_to(self, next: DownloadStatus) -> bool {
        use DownloadStatus::*;

        matches!(
            (self, next),
            (Pending, Downloading)
                | (Pending, Error)
                | (Pending, Canceled)
                | (Downloading, Paused)
                | (Downloading, Completed)
                | (Downloading, Error)
                | (Downloading, Canceled)
                | (Paused, Downloading)
                | (Paused, Canceled)
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            DownloadStatus::Pending => "pending",
            DownloadStatus::Downloading => "downloading",
            DownloadStatus::Paused => "paused",
            DownloadStatus::Completed => "completed",
            DownloadStatus::Error => "error",
            DownloadStatus::Canceled => "canceled",
        }
    }
}

impl std::fmt::Display for DownloadStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// How the bytes of a download are fetched
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransferMode {
    /// One unranged request for the whole body
    Stream,
    /// Several ranged requests fetched concurrently
    Segmented,
}

/// A segment of a multi-part download
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Segment {
    pub index: u32,
    pub start: u64,
    /// Inclusive; `u64::MAX` when the length is unknown
    pub end: u64,
    pub downloaded: u64,
    pub complete: bool,
    #[serde(default)]
    pub error: Option<String>,
}

impl Segment {
    pub fn new(index: u32, start: u64, end: u64) -> Self {
        Self {
            index,
            start,
            end,
            downloaded: 0,
            complete: false,
            error: None,
        }
    }

    /// A segment of unknown length starting at zero
    pub fn unbounded() -> Self {
        Self::new(0, 0, u64::MAX)
    }

    /// Get the total size of this segment in bytes
    /// Returns u64::MAX for unknown size segments (where end = u64::MAX)
    pub fn size(&self) -> u64 {
        if self.end == u64::MAX {
            u64::MAX
        } else {
            self.end - self.start + 1
        }
    }

    /// Check if this is an unknown size segment
    pub fn is_unknown_size(&self) -> bool {
        self.end == u64::MAX
    }

    /// Bytes still missing, `None` when the length is unknown
    pub fn remaining(&self) -> Option<u64> {
        if self.is_unknown_size() {
            None
        } else {
            Some(self.size().saturating_sub(self.downloaded))
        }
    }

    pub fn progress(&self) -> f64 {
        if self.is_unknown_size() {
            0.0
        } else {
            (self.downloaded as f64 / self.size() as f64) * 100.0
        }
    }
}

/// Point-in-time view of a download handed to callers
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DownloadSnapshot {
    pub id: Uuid,
    pub status: DownloadStatus,
    pub filename: String,
    pub downloaded: u64,
    pub total: Option<u64>,
    pub speed: u64,
    pub progress_percent: f64,
    pub eta_secs: Option<u64>,
    pub error: Option<String>,
}

/// Record produced when a download reaches a terminal status
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HistoryRecord {
    pub id: Uuid,
    pub url: String,
    pub destination_path: PathBuf,
    pub filename: String,
    pub size: Option<u64>,
    pub status: DownloadStatus,
    pub start_time: Option<DateTime<Utc>>,
    pub end_time: Option<DateTime<Utc>>,
    pub error_message: Option<String>,
}

// ============================================================================
// Configuration
// ============================================================================

/// Engine configuration, fixed for the lifetime of a manager
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub max_concurrent_downloads: usize,
    pub max_segments_per_download: u32,
    /// Smallest segment worth a separate connection, in bytes
    pub min_segment_size: u64,
    /// Bytes read from the network between progress/cancellation checks
    pub chunk_size: usize,
    pub connect_timeout_secs: u64,
    pub read_timeout_secs: u64,
    pub monitor_interval_ms: u64,
    /// Number of tasks pulling ids off the pending queue
    pub dispatcher_workers: usize,
    /// Where part files live; `shetab` under the system temp dir when unset
    pub temp_dir: Option<PathBuf>,
    pub user_agent: String,
    /// Re-offer a paused download when the queue is empty and a slot frees
    pub auto_resume_paused: bool,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_concurrent_downloads: 3,
            max_segments_per_download: 5,
            min_segment_size: 1024 * 1024,
            chunk_size: 1024 * 1024,
            connect_timeout_secs: 30,
            read_timeout_secs: 30,
            monitor_interval_ms: 500,
            dispatcher_workers: 2,
            temp_dir: None,
            user_agent: format!("Shetab/{}", env!("CARGO_PKG_VERSION")),
            auto_resume_paused: false,
        }
    }
}

impl EngineConfig {
    /// Clamp values where zero has no useful meaning
    pub fn normalized(mut self) -> Self {
        self.max_concurrent_downloads = self.max_concurrent_downloads.max(1);
        self.max_segments_per_download = self.max_segments_per_download.max(1);
        self.min_segment_size = self.min_segment_size.max(1);
        self.chunk_size = self.chunk_size.max(1);
        self.connect_timeout_secs = self.connect_timeout_secs.max(1);
        self.read_timeout_secs = self.read_timeout_secs.max(1);
        self.monitor_interval_ms = self.monitor_interval_ms.max(1);
        self.dispatcher_workers = self.dispatcher_workers.max(1);
        self
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }

    pub fn read_timeout(&self) -> Duration {
        Duration::from_secs(self.read_timeout_secs)
    }

    pub fn monitor_interval(&self) -> Duration {
        Duration::from_millis(self.monitor_interval_ms)
    }
}

// ============================================================================
// Event Types
// ============================================================================

/// Events emitted by the core to its callers
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload")]
pub enum CoreEvent {
    DownloadAdded {
        download: Download,
    },
    DownloadProgress {
        snapshot: DownloadSnapshot,
    },
    DownloadStatusChanged {
        id: Uuid,
        status: DownloadStatus,
        error: Option<String>,
    },
    DownloadFinished {
        record: HistoryRecord,
    },
    DownloadRemoved {
        id: Uuid,
    },
}

// ============================================================================
// API Types
// ============================================================================

/// Information about a link (from probing)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LinkInfo {
    pub url: String,
    pub final_url: Option<String>,
    pub filename: Option<String>,
    pub size: Option<u64>,
    pub content_type: Option<String>,
    pub resumable: bool,
}
