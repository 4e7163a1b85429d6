//! Download engine
//!
//! Probing, segment planning, segment workers, progress aggregation,
//! part merging and the manager that schedules it all.

mod download_task;
mod events;
mod manager;
mod merger;
mod planner;
mod probe;
mod progress;
mod segment_worker;

pub use download_task::{part_files, DownloadTask, TaskOutcome};
pub use events::{EventSink, ProgressCallback};
pub use manager::DownloadManager;
pub use merger::{remove_parts, PartMerger};
pub use planner::{plan_segments, SegmentPlan};
pub use probe::{filename_from_disposition, filename_from_url, total_from_content_range, FileProbe};
pub use progress::{ProgressAggregator, SpeedTracker, SPEED_WINDOW};
pub use segment_worker::{part_path, ChunkReporter, SegmentOutcome, SegmentWorker, WorkerContext};
