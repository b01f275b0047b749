//! HTTP transport for transfer execution.
//!
//! This module provides the [`HttpTransport`] struct which wraps a pooled
//! HTTP client and exposes exactly the two operations the executor needs: a
//! HEAD probe for size/validator metadata and a streaming GET that can
//! resume from a byte offset.

use std::time::Duration;

use reqwest::header::{
    ACCEPT_ENCODING, ACCEPT_RANGES, CONTENT_LENGTH, ETAG, HeaderMap, HeaderValue, LAST_MODIFIED,
    RANGE, RETRY_AFTER,
};
use reqwest::{Client, Response};
use tracing::{debug, instrument};

use super::error::TransferError;
use crate::config::{DEFAULT_CONNECT_TIMEOUT, DEFAULT_READ_TIMEOUT};

/// User-Agent sent with every request.
const USER_AGENT: &str = concat!("downlink/", env!("CARGO_PKG_VERSION"));

/// Metadata learned from a HEAD probe.
#[derive(Debug, Clone)]
pub struct HeadInfo {
    /// Size the server declared, when present.
    pub total_bytes: Option<u64>,
    /// Opaque content validator (ETag, or Last-Modified as a fallback).
    pub validator: Option<String>,
    /// Whether the server advertises byte-range support.
    pub accepts_ranges: bool,
}

/// HTTP transport with streaming and range-resume support.
///
/// Designed to be created once and shared across all transfers, taking
/// advantage of connection pooling.
///
/// # Example
///
/// ```no_run
/// use downlink::engine::HttpTransport;
///
/// # async fn example() -> Result<(), Box<dyn std::error::Error>> {
/// let transport = HttpTransport::new();
/// let info = transport.head("https://example.com/file.bin").await?;
/// println!("size: {:?}", info.total_bytes);
/// # Ok(())
/// # }
/// ```
#[derive(Debug, Clone)]
pub struct HttpTransport {
    client: Client,
}

impl Default for HttpTransport {
    fn default() -> Self {
        Self::new()
    }
}

impl HttpTransport {
    /// Creates a transport with default timeouts.
    ///
    /// Default configuration:
    /// - Connect timeout: 30 seconds
    /// - Read timeout: 60 seconds, applied per read rather than to the
    ///   whole request so long transfers are never cut off mid-stream
    ///
    /// # Panics
    ///
    /// Panics if the HTTP client builder fails to build with the static
    /// configuration. This should never happen in practice.
    #[must_use]
    #[allow(clippy::expect_used)]
    pub fn new() -> Self {
        Self::with_timeouts(DEFAULT_CONNECT_TIMEOUT, DEFAULT_READ_TIMEOUT)
    }

    /// Creates a transport with explicit timeout values.
    ///
    /// # Panics
    ///
    /// Panics if the HTTP client builder fails to build with the supplied
    /// timeout configuration.
    #[must_use]
    #[allow(clippy::expect_used)]
    pub fn with_timeouts(connect_timeout: Duration, read_timeout: Duration) -> Self {
        // Identity encoding keeps byte counts exact for range arithmetic.
        let mut headers = HeaderMap::new();
        headers.insert(ACCEPT_ENCODING, HeaderValue::from_static("identity"));

        let client = Client::builder()
            .connect_timeout(connect_timeout)
            .read_timeout(read_timeout)
            .user_agent(USER_AGENT)
            .default_headers(headers)
            .build()
            .expect("failed to build HTTP client with static configuration");
        Self { client }
    }

    /// Probes a URL for size, validator, and range support.
    ///
    /// # Errors
    ///
    /// Returns `TransferError` if the request fails (network error,
    /// timeout) or the server answers with a non-success status.
    #[instrument(level = "debug", skip(self), fields(url = %url))]
    pub async fn head(&self, url: &str) -> Result<HeadInfo, TransferError> {
        let response = self.client.head(url).send().await.map_err(|e| {
            if e.is_timeout() {
                TransferError::timeout(url)
            } else {
                TransferError::network(url, e)
            }
        })?;
        check_status(url, &response)?;

        let headers = response.headers();
        let info = HeadInfo {
            total_bytes: content_length_of(headers),
            validator: validator_of(headers),
            accepts_ranges: accepts_byte_ranges(headers),
        };
        debug!(
            total_bytes = ?info.total_bytes,
            accepts_ranges = info.accepts_ranges,
            "HEAD probe complete"
        );
        Ok(info)
    }

    /// Starts a streaming GET, optionally resuming from a byte offset.
    ///
    /// When `resume_from` is nonzero a `Range: bytes=<offset>-` header is
    /// sent. The caller must check the response status: 206 confirms the
    /// server honored the range, while 200 means it ignored it and is
    /// sending the whole body from byte zero.
    ///
    /// # Errors
    ///
    /// Returns `TransferError` if the request fails (network error,
    /// timeout) or the server answers with a non-success status.
    #[instrument(level = "debug", skip(self), fields(url = %url, resume_from))]
    pub async fn get(&self, url: &str, resume_from: u64) -> Result<Response, TransferError> {
        let mut request = self.client.get(url);
        if resume_from > 0 {
            request = request.header(RANGE, format!("bytes={resume_from}-"));
        }

        let response = request.send().await.map_err(|e| {
            if e.is_timeout() {
                TransferError::timeout(url)
            } else {
                TransferError::network(url, e)
            }
        })?;
        check_status(url, &response)?;
        Ok(response)
    }

    /// Returns a reference to the underlying reqwest client.
    ///
    /// This can be used for advanced operations not covered by this wrapper.
    #[must_use]
    pub fn inner(&self) -> &Client {
        &self.client
    }
}

/// Maps a non-success response to the matching error, carrying the raw
/// Retry-After header for rate-limit statuses.
fn check_status(url: &str, response: &Response) -> Result<(), TransferError> {
    let status = response.status();
    if status.is_success() {
        return Ok(());
    }

    let retry_after = response
        .headers()
        .get(RETRY_AFTER)
        .and_then(|v| v.to_str().ok())
        .map(std::string::ToString::to_string);
    Err(TransferError::from_status(url, status.as_u16(), retry_after))
}

fn content_length_of(headers: &HeaderMap) -> Option<u64> {
    headers
        .get(CONTENT_LENGTH)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.parse::<u64>().ok())
}

/// Picks the content validator: ETag when present, Last-Modified otherwise.
pub(crate) fn validator_of(headers: &HeaderMap) -> Option<String> {
    headers
        .get(ETAG)
        .or_else(|| headers.get(LAST_MODIFIED))
        .and_then(|v| v.to_str().ok())
        .map(std::string::ToString::to_string)
}

fn accepts_byte_ranges(headers: &HeaderMap) -> bool {
    headers
        .get(ACCEPT_RANGES)
        .and_then(|v| v.to_str().ok())
        .is_some_and(|v| v.eq_ignore_ascii_case("bytes"))
}

/// Derives the expected final file size from a GET response.
///
/// For a 206 the Content-Length covers only the remaining suffix, so the
/// resumed prefix is added back; for a 200 it is the whole file.
pub(crate) fn expected_total(response: &Response, resume_from: u64) -> Option<u64> {
    let current = content_length_of(response.headers());
    if response.status().as_u16() == 206 {
        current.map(|remaining| resume_from.saturating_add(remaining))
    } else {
        current
    }
}
