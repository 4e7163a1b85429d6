//! File probe - learns size, range support and filename without the body

use crate::error::ShetabError;
use reqwest::header::{self, HeaderMap};
use reqwest::{Client, StatusCode};
use shetab_types::LinkInfo;
use std::time::Duration;
use tracing::{debug, info, warn};
use url::Url;

/// Issues metadata-only requests against a remote resource
#[derive(Clone)]
pub struct FileProbe {
    client: Client,
    timeout: Duration,
}

impl FileProbe {
    pub fn new(client: Client, timeout: Duration) -> Self {
        Self { client, timeout }
    }

    /// Probe a URL for metadata
    ///
    /// Redirects are followed by the client. A network error, timeout or
    /// non-2xx answer to the HEAD request is returned as an error.
    pub async fn probe(&self, url: &Url) -> Result<LinkInfo, ShetabError> {
        info!("Probing URL: {}", url);

        let response = self
            .client
            .head(url.as_str())
            .timeout(self.timeout)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            return Err(ShetabError::Probe(format!("HEAD {} returned {}", url, status)));
        }

        let final_url = response.url().clone();
        let headers = response.headers();

        let mut size = content_length(headers);
        let mut resumable = header_str(headers, header::ACCEPT_RANGES)
            .map(|v| v.split(',').any(|unit| unit.trim().eq_ignore_ascii_case("bytes")))
            .unwrap_or(false);
        let content_type = header_str(headers, header::CONTENT_TYPE).map(str::to_string);

        let filename = header_str(headers, header::CONTENT_DISPOSITION)
            .and_then(filename_from_disposition)
            .or_else(|| filename_from_url(&final_url))
            .or_else(|| filename_from_url(url));

        // HEAD without a length: some CDNs only answer ranged GETs properly
        if size.is_none() {
            debug!("HEAD returned no Content-Length, trying bytes=0-0 on {}", final_url);
            match self
                .client
                .get(final_url.as_str())
                .header(header::RANGE, "bytes=0-0")
                .timeout(self.timeout)
                .send()
                .await
            {
                Ok(range_response) if range_response.status() == StatusCode::PARTIAL_CONTENT => {
                    resumable = true;
                    size = header_str(range_response.headers(), header::CONTENT_RANGE)
                        .and_then(total_from_content_range);
                }
                Ok(range_response) if range_response.status() == StatusCode::OK => {
                    resumable = false;
                    size = content_length(range_response.headers());
                }
                Ok(range_response) => {
                    debug!("Range probe answered {}", range_response.status());
                }
                Err(e) => {
                    warn!("Range probe failed: {} - continuing without size info", e);
                }
            }
        }

        info!(
            "Probed {}: size={:?}, resumable={}, filename={:?}",
            url, size, resumable, filename
        );

        let final_url = final_url.to_string();
        Ok(LinkInfo {
            url: url.to_string(),
            final_url: (final_url != url.as_str()).then_some(final_url),
            filename,
            size,
            content_type,
            resumable,
        })
    }
}

fn header_str(headers: &HeaderMap, name: header::HeaderName) -> Option<&str> {
    headers.get(name).and_then(|v| v.to_str().ok())
}

fn content_length(headers: &HeaderMap) -> Option<u64> {
    header_str(headers, header::CONTENT_LENGTH).and_then(|v| v.trim().parse().ok())
}

/// Total length from a `Content-Range` value such as `bytes 0-0/12345`
pub fn total_from_content_range(value: &str) -> Option<u64> {
    let total = value.rsplit('/').next()?.trim();
    if total == "*" {
        return None;
    }
    total.parse().ok()
}

/// Filename from a `Content-Disposition` value
///
/// The RFC 5987 `filename*` form wins over the plain `filename` parameter.
pub fn filename_from_disposition(value: &str) -> Option<String> {
    let mut plain = None;

    for param in value.split(';') {
        let Some((key, raw)) = param.trim().split_once('=') else {
            continue;
        };
        let raw = raw.trim().trim_matches('"');

        match key.trim().to_ascii_lowercase().as_str() {
            "filename*" => {
                // charset'language'percent-encoded-name
                let encoded = raw.splitn(3, '\'').nth(2).unwrap_or(raw);
                if let Some(name) = urlencoding::decode(encoded)
                    .ok()
                    .and_then(|decoded| sanitize_filename(&decoded))
                {
                    return Some(name);
                }
            }
            "filename" => plain = sanitize_filename(raw),
            _ => {}
        }
    }

    plain
}

/// Percent-decoded last path segment of a URL
pub fn filename_from_url(url: &Url) -> Option<String> {
    let last = url.path_segments()?.next_back()?;
    let decoded = urlencoding::decode(last).ok()?;
    sanitize_filename(&decoded)
}

/// Strip directories and reject names that cannot be a file
pub(crate) fn sanitize_filename(name: &str) -> Option<String> {
    let name = name
        .rsplit(|c: char| c == '/' || c == '\\')
        .next()
        .unwrap_or(name)
        .trim();
    match name {
        "" | "." | ".." => None,
        _ => Some(name.to_string()),
    }
}
