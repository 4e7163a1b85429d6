//! Part merger - assembles completed segment files into the final file

use crate::error::ShetabError;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use tokio::fs::{self, File};
use tokio::io::{AsyncWriteExt, BufReader, BufWriter};
use tracing::{error, info, warn};

const MERGE_BUFFER: usize = 1024 * 1024;

pub struct PartMerger;

impl PartMerger {
    /// Concatenate `parts` (already in index order) into `output`
    ///
    /// The result must be exactly `expected_size` bytes long. Part files are
    /// removed afterwards whether or not the merge succeeded; on failure the
    /// partial output is removed too.
    pub async fn merge(
        parts: &[PathBuf],
        output: &Path,
        expected_size: u64,
    ) -> Result<u64, ShetabError> {
        info!("Merging {} parts into {:?}", parts.len(), output);

        let result = Self::concatenate(parts, output, expected_size).await;

        if let Err(e) = &result {
            error!("Merge into {:?} failed: {}", output, e);
            remove_quietly(output).await;
        }
        remove_parts(parts).await;

        result
    }

    async fn concatenate(
        parts: &[PathBuf],
        output: &Path,
        expected_size: u64,
    ) -> Result<u64, ShetabError> {
        let file = File::create(output)
            .await
            .map_err(|e| merge_error("create", output, e))?;
        let mut writer = BufWriter::with_capacity(MERGE_BUFFER, file);
        let mut total: u64 = 0;

        for part in parts {
            let input = File::open(part)
                .await
                .map_err(|e| merge_error("open", part, e))?;
            let mut reader = BufReader::with_capacity(MERGE_BUFFER, input);
            total += tokio::io::copy(&mut reader, &mut writer)
                .await
                .map_err(|e| merge_error("copy", part, e))?;
        }

        writer
            .flush()
            .await
            .map_err(|e| merge_error("flush", output, e))?;
        writer
            .get_mut()
            .sync_all()
            .await
            .map_err(|e| merge_error("sync", output, e))?;

        if total != expected_size {
            return Err(ShetabError::Merge(format!(
                "merged file is {} bytes, expected {}",
                total, expected_size
            )));
        }

        info!("Merge complete: {:?} ({} bytes)", output, total);
        Ok(total)
    }
}

fn merge_error(action: &str, path: &Path, e: std::io::Error) -> ShetabError {
    ShetabError::Merge(format!("failed to {} {:?}: {}", action, path, e))
}

/// Best-effort removal of segment part files
pub async fn remove_parts(parts: &[PathBuf]) {
    for part in parts {
        remove_quietly(part).await;
    }
}

async fn remove_quietly(path: &Path) {
    if let Err(e) = fs::remove_file(path).await {
        if e.kind() != ErrorKind::NotFound {
            warn!("Failed to remove {:?}: {}", path, e);
        }
    }
}
