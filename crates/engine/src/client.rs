//! Shared HTTP client construction.
//!
//! Grounded on `ChunkedDownloader::new`'s client builder in the teacher
//! codebase, generalized with the connection-pool and timeout settings
//! named in the engine's external-interfaces contract.

use std::time::Duration;

use crate::config::EngineConfig;
use crate::error::EngineError;

/// Builds the single [`reqwest::Client`] shared by preflight and all chunk
/// workers for one process: connection reuse and HTTP/2 enabled,
/// compression left off since range semantics don't compose with
/// transparent decompression, up to `max_connections_per_host` idle
/// connections kept warm per host.
pub fn build_client(config: &EngineConfig) -> Result<reqwest::Client, EngineError> {
    // Compression features are intentionally left out of this crate's
    // reqwest dependency: transparent decompression doesn't compose with
    // `Range` semantics, so there is nothing to disable here.
    reqwest::Client::builder()
        .user_agent(platform::USER_AGENT)
        .pool_max_idle_per_host(config.max_connections_per_host)
        .connect_timeout(config.tls_handshake_timeout)
        .build()
        .map_err(|e| EngineError::Preflight(e.to_string()))
}

/// Result of a successful preflight `HEAD`.
#[derive(Debug, Clone)]
pub struct PreflightInfo {
    pub size: u64,
    pub accepts_ranges: bool,
    pub filename: String,
}

/// Issues the preflight `HEAD url` with a bounded timeout, records
/// `Content-Length` (failing if unknown or `<= 0`) and whether
/// `Accept-Ranges: bytes` is advertised. Range support is informational:
/// the engine proceeds either way and relies on per-chunk status codes
/// (spec §4.4).
pub async fn preflight(
    client: &reqwest::Client,
    url: &str,
    timeout: Duration,
) -> Result<PreflightInfo, EngineError> {
    let response = client
        .head(url)
        .timeout(timeout)
        .send()
        .await
        .map_err(|e| EngineError::Preflight(e.to_string()))?;

    if !response.status().is_success() {
        return Err(EngineError::Preflight(format!(
            "HEAD {url} returned {}",
            response.status()
        )));
    }

    let size = response.content_length().ok_or(EngineError::UnknownSize)?;
    if size == 0 {
        return Err(EngineError::EmptyFile);
    }

    let accepts_ranges = response
        .headers()
        .get("accept-ranges")
        .and_then(|v| v.to_str().ok())
        .map(|v| v.eq_ignore_ascii_case("bytes"))
        .unwrap_or(false);

    let filename = filename_from_url(url);

    Ok(PreflightInfo { size, accepts_ranges, filename })
}

/// Derives a final filename from the last segment of the URL's path,
/// falling back to a generic name when the path has no usable tail (e.g.
/// a bare host or a trailing slash).
pub fn filename_from_url(url: &str) -> String {
    reqwest::Url::parse(url)
        .ok()
        .and_then(|u| {
            u.path_segments()
                .and_then(|mut segs| segs.next_back().map(str::to_string))
                .filter(|s| !s.is_empty())
        })
        .unwrap_or_else(|| "download.bin".to_string())
}
