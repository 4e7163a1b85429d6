//! Progress aggregation - turns cumulative byte counters into speed

use parking_lot::Mutex;
use shetab_types::{Download, DownloadSnapshot, DownloadStatus};
use std::collections::VecDeque;
use std::time::{Duration, Instant};

/// Averaging window for the reported speed (10 ticks at the default interval)
pub const SPEED_WINDOW: Duration = Duration::from_secs(5);

/// Sliding-window speed over (time, cumulative bytes) samples
#[derive(Debug)]
pub struct SpeedTracker {
    window: Duration,
    samples: VecDeque<(Instant, u64)>,
}

impl SpeedTracker {
    pub fn new(window: Duration) -> Self {
        Self {
            window,
            samples: VecDeque::with_capacity(16),
        }
    }

    /// Record a sample and return the speed in bytes per second
    pub fn record(&mut self, now: Instant, downloaded: u64) -> u64 {
        // A counter that went backwards means the transfer restarted
        if self.samples.back().is_some_and(|&(_, last)| downloaded < last) {
            self.samples.clear();
        }
        self.samples.push_back((now, downloaded));

        // Keep one sample at or beyond the window edge as the baseline
        while self.samples.len() > 2
            && now.saturating_duration_since(self.samples[1].0) >= self.window
        {
            self.samples.pop_front();
        }

        let (first_time, first_bytes) = self.samples[0];
        let elapsed = now.saturating_duration_since(first_time).as_secs_f64();
        if elapsed <= 0.0 {
            return 0;
        }
        (downloaded.saturating_sub(first_bytes) as f64 / elapsed) as u64
    }

}

/// Samples a shared download item and refreshes its aggregate counters
#[derive(Debug)]
pub struct ProgressAggregator {
    tracker: SpeedTracker,
}

impl ProgressAggregator {
    pub fn new() -> Self {
        Self {
            tracker: SpeedTracker::new(SPEED_WINDOW),
        }
    }

    /// Recompute downloaded bytes and speed under the item lock
    ///
    /// Returns `None` once the item has left `Downloading`; its counters are
    /// then owned by whoever changed the status.
    pub fn tick(&mut self, item: &Mutex<Download>) -> Option<DownloadSnapshot> {
        self.tick_at(item, Instant::now())
    }

    pub fn tick_at(&mut self, item: &Mutex<Download>, now: Instant) -> Option<DownloadSnapshot> {
        let mut download = item.lock();
        if download.status != DownloadStatus::Downloading {
            return None;
        }
        let downloaded: u64 = download.segments.iter().map(|s| s.downloaded).sum();
        download.downloaded = downloaded;
        download.speed = self.tracker.record(now, downloaded);
        Some(download.snapshot())
    }
}

impl Default for ProgressAggregator {
    fn default() -> Self {
        Self::new()
    }
}
