//! CLI command implementations

use crate::output::{format_bytes, format_duration, format_speed, print_json};
use crate::progress::DownloadProgress;
use crate::OutputFormat;
use anyhow::{bail, Result};
use console::style;
use serde::Serialize;
use shetab_core::DownloadManager;
use shetab_types::{CoreEvent, DownloadStatus, EngineConfig, HistoryRecord, LinkInfo};
use std::collections::HashSet;
use std::path::PathBuf;
use tokio::sync::broadcast::error::RecvError;
use tracing::debug;
use uuid::Uuid;

// ============================================================================
// Download Commands
// ============================================================================

#[derive(Serialize)]
struct Rejected {
    url: String,
    error: String,
}

#[derive(Serialize)]
struct GetReport {
    downloads: Vec<HistoryRecord>,
    rejected: Vec<Rejected>,
}

pub async fn get(
    urls: Vec<String>,
    dir: PathBuf,
    filename: Option<String>,
    config: EngineConfig,
    format: OutputFormat,
) -> Result<()> {
    if filename.is_some() && urls.len() > 1 {
        bail!("--filename can only be used with a single URL");
    }

    let manager = DownloadManager::new(config)?;
    let mut events = manager.subscribe();
    let mut progress = DownloadProgress::new(matches!(format, OutputFormat::Human));

    let mut waiting: HashSet<Uuid> = HashSet::new();
    let mut rejected = Vec::new();
    for url in &urls {
        match manager.submit(url, &dir, filename.as_deref()) {
            Ok(id) => {
                if let Some(snapshot) = manager.get_status(id) {
                    progress.add_download(&snapshot);
                }
                waiting.insert(id);
            }
            Err(e) => rejected.push(Rejected {
                url: url.clone(),
                error: e.to_string(),
            }),
        }
    }

    let mut records = Vec::new();
    let ctrl_c = tokio::signal::ctrl_c();
    tokio::pin!(ctrl_c);

    while !waiting.is_empty() {
        tokio::select! {
            event = events.recv() => match event {
                Ok(event) => {
                    progress.handle_event(&event);
                    if let CoreEvent::DownloadFinished { record } = event {
                        if waiting.remove(&record.id) {
                            records.push(record);
                        }
                    }
                }
                Err(RecvError::Lagged(skipped)) => {
                    debug!("Event receiver lagged by {} events", skipped);
                    for record in manager.history() {
                        if waiting.remove(&record.id) {
                            records.push(record);
                        }
                    }
                }
                Err(RecvError::Closed) => break,
            },
            _ = &mut ctrl_c => {
                progress.clear();
                for id in &waiting {
                    manager.cancel(*id).await;
                }
                bail!("interrupted, {} download(s) cancelled", waiting.len());
            }
        }
    }

    let failed = rejected.len()
        + records
            .iter()
            .filter(|r| r.status != DownloadStatus::Completed)
            .count();

    match format {
        OutputFormat::Json => print_json(&GetReport {
            downloads: records,
            rejected,
        })?,
        OutputFormat::Human => {
            for rejection in &rejected {
                println!(
                    "{} {}: {}",
                    style("✗").red(),
                    rejection.url,
                    style(&rejection.error).red()
                );
            }
            for record in &records {
                print_record(record);
            }
        }
    }

    if failed > 0 {
        bail!("{} of {} download(s) failed", failed, urls.len());
    }
    Ok(())
}

fn print_record(record: &HistoryRecord) {
    match record.status {
        DownloadStatus::Completed => {
            let size = record.size.unwrap_or(0);
            let seconds = record
                .start_time
                .zip(record.end_time)
                .map(|(start, end)| (end - start).num_seconds().max(0) as u64)
                .unwrap_or(0);
            println!(
                "{} {} {}",
                style("✓").green().bold(),
                style(&record.filename).cyan(),
                style(format!(
                    "({} in {}, {})",
                    format_bytes(size),
                    format_duration(seconds),
                    format_speed(size / seconds.max(1))
                ))
                .dim()
            );
            println!("    {}", record.destination_path.display());
        }
        status => {
            println!(
                "{} {} {}: {}",
                style("✗").red().bold(),
                style(&record.filename).cyan(),
                status,
                record.error_message.as_deref().unwrap_or("no details")
            );
        }
    }
}

// ============================================================================
// Probe Commands
// ============================================================================

#[derive(Serialize)]
struct ProbeResult {
    url: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    info: Option<LinkInfo>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<String>,
}

pub async fn probe_urls(urls: Vec<String>, format: OutputFormat) -> Result<()> {
    let manager = DownloadManager::new(EngineConfig::default())?;

    let mut results = Vec::with_capacity(urls.len());
    for url in urls {
        let result = match manager.probe_url(&url).await {
            Ok(info) => ProbeResult {
                url,
                info: Some(info),
                error: None,
            },
            Err(e) => ProbeResult {
                url,
                info: None,
                error: Some(e.to_string()),
            },
        };
        results.push(result);
    }

    match format {
        OutputFormat::Json => print_json(&results)?,
        OutputFormat::Human => {
            for result in &results {
                match (&result.info, &result.error) {
                    (Some(info), _) => print_link_info(info),
                    (None, error) => println!(
                        "{} {}: {}",
                        style("✗").red(),
                        result.url,
                        style(error.as_deref().unwrap_or("unknown error")).red()
                    ),
                }
            }
        }
    }

    Ok(())
}

fn print_link_info(info: &LinkInfo) {
    println!(
        "{} {}",
        style("✓").green(),
        info.filename.as_deref().unwrap_or(&info.url)
    );
    if let Some(final_url) = &info.final_url {
        println!("    Redirects to: {}", final_url);
    }
    match info.size {
        Some(size) => println!("    Size: {}", format_bytes(size)),
        None => println!("    Size: {}", style("unknown").dim()),
    }
    if let Some(ref ct) = info.content_type {
        println!("    Type: {}", ct);
    }
    println!(
        "    Resumable: {}",
        if info.resumable {
            style("Yes").green()
        } else {
            style("No").yellow()
        }
    );
}
