//! Transfer executor: runs one download end to end.
//!
//! The executor owns the per-transfer mechanics the scheduler delegates:
//! probing the server, deciding whether the persisted partial file can be
//! resumed, streaming the body through the bandwidth throttle, and
//! checkpointing progress so a crash loses at most the checkpoint interval.
//!
//! # Resume rules
//!
//! A transfer resumes from `min(checkpointed bytes, on-disk size)`; any
//! tail past the last durable checkpoint is truncated and re-downloaded.
//! Resume is abandoned and the transfer restarts from byte zero when the
//! server's validator no longer matches the stored one, or when the server
//! does not accept byte ranges (including answering a range request with a
//! plain 200).

use std::io::SeekFrom;
use std::path::Path;
use std::sync::Arc;

use futures_util::StreamExt;
use tokio::fs::{File, OpenOptions};
use tokio::io::{AsyncSeekExt, AsyncWriteExt, BufWriter};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use super::error::TransferError;
use super::progress::{ProgressSink, ProgressTracker};
use super::transport::{HttpTransport, expected_total, validator_of};
use crate::config::EngineConfig;
use crate::limit::{BandwidthManager, BandwidthThrottle, RateLimiter};
use crate::task::{Task, TaskStore};

/// Metadata produced by a successful transfer.
#[derive(Debug, Clone)]
pub struct TransferOutcome {
    /// Final file size in bytes.
    pub bytes_downloaded: u64,
    /// Size the server declared, or the final size when it never did.
    pub total_bytes: Option<u64>,
    /// Content validator observed on the response, if any.
    pub validator: Option<String>,
    /// Whether an HTTP range resume was used.
    pub resumed: bool,
}

/// Executes individual transfers on behalf of the scheduler.
///
/// One executor is shared by all transfers; per-transfer state (offset,
/// tracker, file handle) lives on the stack of [`run`](Self::run).
pub struct TransferExecutor {
    transport: Arc<HttpTransport>,
    limiter: Arc<RateLimiter>,
    bandwidth: Arc<BandwidthManager>,
    store: Arc<dyn TaskStore>,
    sink: Arc<dyn ProgressSink>,
    checkpoint_bytes: u64,
    delete_on_error: bool,
}

impl TransferExecutor {
    /// Creates an executor over the shared transport, limiters, and store.
    pub fn new(
        transport: Arc<HttpTransport>,
        limiter: Arc<RateLimiter>,
        bandwidth: Arc<BandwidthManager>,
        store: Arc<dyn TaskStore>,
        sink: Arc<dyn ProgressSink>,
        config: &EngineConfig,
    ) -> Self {
        Self {
            transport,
            limiter,
            bandwidth,
            store,
            sink,
            checkpoint_bytes: config.checkpoint_bytes,
            delete_on_error: config.delete_on_error,
        }
    }

    /// Runs one transfer to completion, cancellation, or failure.
    ///
    /// Registers the task with the bandwidth manager for the duration of
    /// the transfer so every active task gets its fair share, and records
    /// consumed bytes against the task's counter.
    ///
    /// # Errors
    ///
    /// Returns `TransferError` describing the failure; `Cancelled` when the
    /// token fired. The persisted checkpoint always reflects bytes that
    /// are durably on disk, so any failure mode is resumable (subject to
    /// the resume rules above).
    #[instrument(skip(self, task, token), fields(task_id = task.id, url = %task.url))]
    pub async fn run(
        &self,
        task: &Task,
        token: &CancellationToken,
    ) -> Result<TransferOutcome, TransferError> {
        let throttle = self.bandwidth.register(task.id);
        let result = self.transfer(task, &throttle, token).await;
        let session_bytes = self.bandwidth.unregister(task.id);

        match &result {
            Ok(outcome) => {
                info!(
                    bytes = outcome.bytes_downloaded,
                    resumed = outcome.resumed,
                    "transfer complete"
                );
            }
            Err(error) if error.is_cancelled() => {
                debug!(session_bytes, "transfer stopped by cancellation");
            }
            Err(error) => {
                debug!(error = %error, session_bytes, "transfer failed");
                if self.delete_on_error {
                    self.discard_partial(task).await;
                }
            }
        }
        result
    }

    async fn transfer(
        &self,
        task: &Task,
        throttle: &BandwidthThrottle,
        token: &CancellationToken,
    ) -> Result<TransferOutcome, TransferError> {
        let url = task.url.as_str();
        let path = task.destination().to_path_buf();

        // Metadata probe, gated by the operation limiter. Some origins
        // reject HEAD outright; treat that as "no metadata" and let the GET
        // decide.
        let head = match self.limiter.execute(self.transport.head(url)).await? {
            Ok(info) => Some(info),
            Err(TransferError::ClientError {
                status: 405 | 501, ..
            }) => None,
            Err(error) => return Err(error),
        };

        let mut offset = resume_offset(task, &path).await;
        if offset > 0 {
            let current_validator = head.as_ref().and_then(|h| h.validator.as_deref());
            let validator_changed = matches!(
                (task.validator.as_deref(), current_validator),
                (Some(stored), Some(current)) if stored != current
            );
            if validator_changed {
                debug!(
                    stored = ?task.validator,
                    current = ?current_validator,
                    "content changed on server; discarding partial file"
                );
                if let Err(e) = tokio::fs::remove_file(&path).await {
                    if e.kind() != std::io::ErrorKind::NotFound {
                        warn!(path = %path.display(), error = %e, "failed to remove stale partial file");
                    }
                }
                offset = 0;
            } else if !head.as_ref().is_none_or(|h| h.accepts_ranges) {
                debug!("server does not accept ranges; restarting from zero");
                offset = 0;
            }
        }

        // The GET itself holds an operation permit only until the response
        // headers arrive; the long-lived body stream must not starve other
        // short operations.
        let permit = self.limiter.acquire().await?;
        let response = self.transport.get(url, offset).await;
        drop(permit);
        let response = response?;

        let resumed = offset > 0 && response.status().as_u16() == 206;
        if offset > 0 && !resumed {
            debug!("server ignored range request; restarting from zero");
            offset = 0;
        }

        let total = expected_total(&response, offset)
            .or_else(|| head.as_ref().and_then(|h| h.total_bytes));
        let validator =
            validator_of(response.headers()).or_else(|| head.and_then(|h| h.validator));

        let file = open_destination(&path, offset).await?;
        let mut writer = BufWriter::new(file);
        let mut stream = response.bytes_stream();
        let mut tracker = ProgressTracker::new(task.id, task.file_name.clone(), offset, total);
        let mut downloaded = offset;
        let mut last_checkpoint = offset;

        // Record learned metadata up front so even a first-chunk crash can
        // validate its partial file later.
        self.checkpoint(task.id, offset, total, validator.as_deref())
            .await;

        while let Some(chunk_result) = stream.next().await {
            let chunk = chunk_result.map_err(|e| {
                if e.is_timeout() {
                    TransferError::timeout(url)
                } else {
                    TransferError::network(url, e)
                }
            })?;

            if token.is_cancelled() {
                if flush(&mut writer, &path).await.is_ok() {
                    self.checkpoint(task.id, downloaded, total, None).await;
                }
                return Err(TransferError::Cancelled);
            }

            let len = chunk.len() as u64;
            throttle.consume(len).await;
            writer
                .write_all(&chunk)
                .await
                .map_err(|e| TransferError::io(&path, e))?;
            downloaded += len;
            self.bandwidth.record_consumption(task.id, len);
            self.sink.on_progress(&tracker.record(len));

            if downloaded - last_checkpoint >= self.checkpoint_bytes {
                flush(&mut writer, &path).await?;
                self.checkpoint(task.id, downloaded, total, None).await;
                last_checkpoint = downloaded;
            }
        }

        flush(&mut writer, &path).await?;

        if total.is_some_and(|expected| expected != downloaded) {
            return Err(TransferError::integrity(
                &path,
                total.unwrap_or(0),
                downloaded,
            ));
        }

        let total_bytes = total.or(Some(downloaded));
        self.checkpoint(task.id, downloaded, total_bytes, validator.as_deref())
            .await;

        Ok(TransferOutcome {
            bytes_downloaded: downloaded,
            total_bytes,
            validator,
            resumed,
        })
    }

    /// Persists a progress checkpoint, best effort. A failed checkpoint
    /// costs crash-recovery granularity, not the transfer.
    async fn checkpoint(&self, task_id: i64, bytes: u64, total: Option<u64>, validator: Option<&str>) {
        let partial = i64::try_from(bytes).unwrap_or(i64::MAX);
        let total = total.map(|t| i64::try_from(t).unwrap_or(i64::MAX));
        if let Err(e) = self
            .store
            .checkpoint_progress(task_id, partial, total, validator)
            .await
        {
            warn!(task_id, error = %e, "failed to checkpoint transfer progress");
        }
    }

    async fn discard_partial(&self, task: &Task) {
        let path = task.destination();
        if let Err(e) = tokio::fs::remove_file(path).await {
            if e.kind() != std::io::ErrorKind::NotFound {
                warn!(path = %path.display(), error = %e, "failed to delete partial file");
            }
        }
        self.checkpoint(task.id, 0, None, None).await;
    }
}

/// Picks the byte offset a transfer may safely resume from.
///
/// The durable checkpoint is the authoritative claim; bytes on disk past
/// it were never acknowledged and will be truncated. A missing or shorter
/// file lowers the offset accordingly.
async fn resume_offset(task: &Task, path: &Path) -> u64 {
    let disk_len = tokio::fs::metadata(path)
        .await
        .map(|meta| meta.len())
        .unwrap_or(0);
    let checkpointed = u64::try_from(task.partial_bytes).unwrap_or(0);
    checkpointed.min(disk_len)
}

/// Opens the destination positioned at `offset`, truncating anything past
/// it. Parent directories are created as needed.
async fn open_destination(path: &Path, offset: u64) -> Result<File, TransferError> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| TransferError::io(path, e))?;
        }
    }

    if offset == 0 {
        return File::create(path)
            .await
            .map_err(|e| TransferError::io(path, e));
    }

    let mut file = OpenOptions::new()
        .create(true)
        .write(true)
        .open(path)
        .await
        .map_err(|e| TransferError::io(path, e))?;
    file.set_len(offset)
        .await
        .map_err(|e| TransferError::io(path, e))?;
    file.seek(SeekFrom::Start(offset))
        .await
        .map_err(|e| TransferError::io(path, e))?;
    Ok(file)
}

async fn flush(writer: &mut BufWriter<File>, path: &Path) -> Result<(), TransferError> {
    writer
        .flush()
        .await
        .map_err(|e| TransferError::io(path, e))
}
