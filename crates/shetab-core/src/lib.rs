//! Shetab Core - Download Engine
//!
//! This crate provides the segmented, resumable download engine for Shetab.
//! A [`DownloadManager`] accepts downloads, probes each resource, splits it
//! into byte-range segments fetched in parallel, merges the parts and keeps
//! at most a configured number of downloads running at once.

pub mod engine;
mod error;

pub use engine::{DownloadManager, ProgressCallback};
pub use error::*;

pub use shetab_types::{
    CoreEvent, Download, DownloadSnapshot, DownloadStatus, EngineConfig, HistoryRecord, LinkInfo,
    Segment, TransferMode,
};
