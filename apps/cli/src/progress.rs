//! Progress bar utilities for CLI downloads

use crate::output::format_bytes;
use console::style;
use indicatif::{MultiProgress, ProgressBar, ProgressDrawTarget, ProgressStyle};
use shetab_types::{CoreEvent, DownloadSnapshot, DownloadStatus};
use std::collections::HashMap;
use uuid::Uuid;

/// Manages progress bars for multiple downloads
pub struct DownloadProgress {
    multi: MultiProgress,
    bars: HashMap<Uuid, ProgressBar>,
}

impl DownloadProgress {
    pub fn new(visible: bool) -> Self {
        let multi = if visible {
            MultiProgress::new()
        } else {
            MultiProgress::with_draw_target(ProgressDrawTarget::hidden())
        };
        Self {
            multi,
            bars: HashMap::new(),
        }
    }

    /// Create a progress bar for a download
    pub fn add_download(&mut self, snapshot: &DownloadSnapshot) {
        let pb = self.multi.add(ProgressBar::new(snapshot.total.unwrap_or(0)));

        pb.set_style(
            ProgressStyle::default_bar()
                .template("{spinner:.green} {msg:30!} [{bar:40.cyan/blue}] {bytes}/{total_bytes} ({bytes_per_sec}, {eta})")
                .unwrap_or_else(|_| ProgressStyle::default_bar())
                .progress_chars("█▓▒░  "),
        );

        pb.set_message(snapshot.filename.clone());
        pb.set_position(snapshot.downloaded);
        self.bars.insert(snapshot.id, pb);
    }

    /// Update a progress bar from an event
    pub fn handle_event(&self, event: &CoreEvent) {
        match event {
            CoreEvent::DownloadProgress { snapshot } => {
                if let Some(pb) = self.bars.get(&snapshot.id) {
                    if let Some(total) = snapshot.total {
                        pb.set_length(total);
                    }
                    pb.set_position(snapshot.downloaded);
                    pb.set_message(snapshot.filename.clone());
                }
            }

            CoreEvent::DownloadStatusChanged { id, status, error } => {
                let Some(pb) = self.bars.get(id) else {
                    return;
                };

                match status {
                    DownloadStatus::Completed => {
                        pb.finish_with_message(format!(
                            "{} {}",
                            style("✓").green().bold(),
                            format_bytes(pb.position())
                        ));
                    }
                    DownloadStatus::Error => {
                        pb.abandon_with_message(format!(
                            "{} Failed: {}",
                            style("✗").red().bold(),
                            error.as_deref().unwrap_or("Unknown error")
                        ));
                    }
                    DownloadStatus::Paused => {
                        pb.set_message(format!("{} Paused", style("⏸").yellow()));
                    }
                    DownloadStatus::Canceled => {
                        pb.abandon_with_message(format!("{} Cancelled", style("○").dim()));
                    }
                    DownloadStatus::Pending | DownloadStatus::Downloading => {}
                }
            }

            _ => {}
        }
    }

    /// Clear all progress bars
    pub fn clear(&mut self) {
        for (_, pb) in self.bars.drain() {
            if !pb.is_finished() {
                pb.finish_and_clear();
            }
        }
    }
}
