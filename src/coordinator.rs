//! Upload coordination: job creation, chunk intake, dispatch, cancel, status, retry.
//!
//! `initialize` creates the parent and all sub-jobs, then links them with a single atomic
//! write of the fully populated id list — a reader never observes a partially linked
//! parent. Uploaded chunks are stored, recorded, and dispatched for processing through
//! the `chunk_processing` gate (or handed to an injected queue when one is configured).

use std::sync::Arc;

use async_trait::async_trait;
use serde::Serialize;
use tokio::time::{Duration, sleep};
use tracing::{info, warn};
use uuid::Uuid;

use crate::blob::{BlobStore, chunk_object_key};
use crate::chunker::AudioFormat;
use crate::error::{Error, Result};
use crate::events::{EventHub, StreamEvent};
use crate::job::{ByteRange, ParentJob, ParentStatus, SubJob, SubJobStatus, now_millis};
use crate::job_store::{ParentJobStore, SubJobStore};
use crate::limiter::{GateKind, RateLimiter};
use crate::opts::{
    DEFAULT_CHUNK_MB, DEFAULT_MAX_CONCURRENT_UPLOADS, MAX_CHUNK_MB, MAX_FILE_BYTES, MIN_CHUNK_MB,
    MIN_FILE_BYTES, ProcessingOptions, UPLOAD_HANDLE_EXPIRY_SECONDS,
};
use crate::processor::ChunkProcessor;

/// Tolerated deviation between a chunk's declared range and the uploaded byte count.
const SIZE_TOLERANCE_PERCENT: u64 = 10;

/// Re-reads of the parent while waiting for the sub-job linkage to become visible.
const RESOLVE_RETRY_DELAYS_SECS: [u64; 3] = [1, 2, 3];

/// Optional hand-off point for chunk processing. When a queue is injected, uploads are
/// acknowledged as soon as the task is enqueued; otherwise processing runs in-process.
#[async_trait]
pub trait ChunkQueue: Send + Sync {
    async fn enqueue(&self, sub_job_id: Uuid) -> Result<()>;
}

/// Everything a client needs to start uploading chunks.
#[derive(Debug, Clone, Serialize)]
pub struct InitializeResponse {
    pub parent_job_id: Uuid,
    pub stream_url: String,
    pub upload_urls: Vec<String>,
    pub sub_jobs: Vec<UploadHandle>,
    pub chunk_info: ChunkInfo,
    pub processing_options: ProcessingOptions,
}

#[derive(Debug, Clone, Serialize)]
pub struct UploadHandle {
    pub chunk_index: u32,
    pub sub_job_id: Uuid,
    pub byte_range: ByteRange,
    pub expected_size: u64,
    pub upload_url: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct ChunkInfo {
    pub total_chunks: u32,
    pub chunk_size_bytes: u64,
    pub total_size: u64,
    pub max_concurrent_uploads: usize,
    pub upload_handle_expiry_seconds: u64,
}

/// Result of accepting one chunk upload.
#[derive(Debug, Clone, Serialize)]
pub struct AcceptedChunk {
    pub parent_job_id: Uuid,
    pub chunk_index: u32,
    pub sub_job_id: Uuid,
    pub actual_size: u64,
    pub dispatched: bool,
}

/// Diagnostic state for one chunk in the status report.
#[derive(Debug, Clone, Serialize)]
pub struct ChunkStatus {
    pub chunk_index: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sub_job_id: Option<Uuid>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status: Option<SubJobStatus>,
    pub retry_count: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub retry_recommendation: Option<RetryKind>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RetryKind {
    /// The chunk bytes never arrived (or the sub-job is missing): re-upload.
    Upload,
    /// The bytes are stored but processing failed: re-enqueue.
    Processing,
}

/// Health derived by recomputing from sub-job records.
#[derive(Debug, Clone, Serialize)]
pub struct JobHealth {
    pub sub_jobs_linked: bool,
    pub missing_sub_jobs: u32,
    pub counters_consistent: bool,
}

/// Full diagnostic state of one parent.
#[derive(Debug, Clone, Serialize)]
pub struct StatusReport {
    pub parent_job_id: Uuid,
    pub filename: String,
    pub status: ParentStatus,
    pub total_chunks: u32,
    pub uploaded_chunks: u32,
    pub completed_chunks: u32,
    pub failed_chunks: u32,
    pub skipped_chunks: u32,
    pub upload_percent: f64,
    pub completion_percent: f64,
    pub chunks: Vec<ChunkStatus>,
    pub health: JobHealth,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub final_transcript: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
}

/// Result of a manual retry request.
#[derive(Debug, Clone, Serialize)]
pub struct RetryOutcome {
    pub parent_job_id: Uuid,
    pub chunk_index: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sub_job_id: Option<Uuid>,
    pub action: RetryKind,
}

pub struct UploadCoordinator {
    parents: ParentJobStore,
    sub_jobs: SubJobStore,
    blob: Arc<dyn BlobStore>,
    limiter: Arc<RateLimiter>,
    hub: Arc<EventHub>,
    processor: Arc<ChunkProcessor>,
    queue: Option<Arc<dyn ChunkQueue>>,
    bucket: String,
    max_concurrent_uploads: usize,
}

impl UploadCoordinator {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        parents: ParentJobStore,
        sub_jobs: SubJobStore,
        blob: Arc<dyn BlobStore>,
        limiter: Arc<RateLimiter>,
        hub: Arc<EventHub>,
        processor: Arc<ChunkProcessor>,
        queue: Option<Arc<dyn ChunkQueue>>,
        bucket: impl Into<String>,
    ) -> Self {
        Self {
            parents,
            sub_jobs,
            blob,
            limiter,
            hub,
            processor,
            queue,
            bucket: bucket.into(),
            max_concurrent_uploads: DEFAULT_MAX_CONCURRENT_UPLOADS,
        }
    }

    /// Create the parent and its sub-jobs, returning per-chunk upload handles.
    pub async fn initialize(
        &self,
        filename: &str,
        total_size: u64,
        chunk_size_mb: Option<u64>,
        options: ProcessingOptions,
    ) -> Result<InitializeResponse> {
        if filename.trim().is_empty() {
            return Err(Error::validation("filename must not be empty"));
        }
        let chunk_size_mb = chunk_size_mb.unwrap_or(DEFAULT_CHUNK_MB);
        if !(MIN_CHUNK_MB..=MAX_CHUNK_MB).contains(&chunk_size_mb) {
            return Err(Error::validation(format!(
                "chunk size must be between {MIN_CHUNK_MB} and {MAX_CHUNK_MB} MiB"
            )));
        }
        if total_size == 0 {
            return Err(Error::validation("total size must be positive"));
        }
        if total_size < MIN_FILE_BYTES {
            return Err(Error::validation("File too small for chunked upload"));
        }
        if total_size > MAX_FILE_BYTES {
            return Err(Error::validation("File too large for chunked upload"));
        }

        let chunk_size_bytes = chunk_size_mb * 1024 * 1024;
        let total_chunks = total_size.div_ceil(chunk_size_bytes) as u32;

        let parent = ParentJob::new(
            filename.to_owned(),
            total_size,
            chunk_size_bytes,
            total_chunks,
            options.clone(),
        );
        self.parents.create(&parent).await?;
        self.hub.open(parent.id);

        let extension = AudioFormat::from_filename(filename).extension();
        let mut sub_job_ids = Vec::with_capacity(total_chunks as usize);
        let mut handles = Vec::with_capacity(total_chunks as usize);
        for index in 0..total_chunks {
            let range = parent.byte_range_for(index);
            let sub = SubJob::new(
                parent.id,
                index,
                range,
                chunk_object_key(parent.id, index, extension),
            );
            self.sub_jobs.create(&sub).await?;
            handles.push(UploadHandle {
                chunk_index: index,
                sub_job_id: sub.id,
                byte_range: range,
                expected_size: range.len(),
                upload_url: upload_url(parent.id, index),
            });
            sub_job_ids.push(Some(sub.id));
        }

        // Single write of the fully populated list: readers never see partial linkage.
        self.parents
            .update(parent.id, |p| p.sub_job_ids = sub_job_ids.clone())
            .await?;

        info!(
            parent_id = %parent.id,
            filename,
            total_size,
            total_chunks,
            chunk_size_bytes,
            "chunked upload initialized"
        );

        Ok(InitializeResponse {
            parent_job_id: parent.id,
            stream_url: format!("/chunked-stream/{}", parent.id),
            upload_urls: handles.iter().map(|h| h.upload_url.clone()).collect(),
            sub_jobs: handles,
            chunk_info: ChunkInfo {
                total_chunks,
                chunk_size_bytes,
                total_size,
                max_concurrent_uploads: self.max_concurrent_uploads,
                upload_handle_expiry_seconds: UPLOAD_HANDLE_EXPIRY_SECONDS,
            },
            processing_options: options,
        })
    }

    /// Store one uploaded chunk, record it, and dispatch processing.
    pub async fn accept_chunk_upload(
        &self,
        parent_id: Uuid,
        chunk_index: u32,
        bytes: Vec<u8>,
    ) -> Result<AcceptedChunk> {
        let parent = self.parents.get(parent_id).await?;
        if parent.status == ParentStatus::Cancelled {
            return Err(Error::validation("job is cancelled"));
        }
        if chunk_index >= parent.total_chunks {
            return Err(Error::validation(format!(
                "chunk index {chunk_index} out of range (job has {} chunks)",
                parent.total_chunks
            )));
        }

        let expected = parent.byte_range_for(chunk_index).len();
        let actual = bytes.len() as u64;
        let tolerance = expected * SIZE_TOLERANCE_PERCENT / 100;
        if actual.abs_diff(expected) > tolerance {
            return Err(Error::validation(format!(
                "chunk {chunk_index} size mismatch: expected {expected} bytes (\u{b1}{SIZE_TOLERANCE_PERCENT}%), got {actual}"
            )));
        }

        let format = AudioFormat::from_filename(&parent.filename);
        let key = chunk_object_key(parent_id, chunk_index, format.extension());
        self.blob
            .put(&self.bucket, &key, bytes, content_type_for(format))
            .await?;

        let parent = self.parents.mark_chunk_uploaded(parent_id, chunk_index).await?;
        self.publish_progress(&parent);

        let sub_job_id = self.resolve_sub_job_id(parent_id, chunk_index).await?;
        self.sub_jobs
            .update(sub_job_id, |s| {
                if !s.status.is_terminal() {
                    s.status = SubJobStatus::Uploaded;
                }
                s.actual_size = Some(actual);
                s.uploaded_at = Some(now_millis());
            })
            .await?;

        let dispatched = self.dispatch(sub_job_id, parent.options.clone()).await?;
        Ok(AcceptedChunk {
            parent_job_id: parent_id,
            chunk_index,
            sub_job_id,
            actual_size: actual,
            dispatched,
        })
    }

    /// Record a chunk that was uploaded out-of-band (presigned path) and dispatch it.
    pub async fn complete_chunk_upload(
        &self,
        parent_id: Uuid,
        chunk_index: u32,
        actual_size: u64,
    ) -> Result<AcceptedChunk> {
        let parent = self.parents.get(parent_id).await?;
        if parent.status == ParentStatus::Cancelled {
            return Err(Error::validation("job is cancelled"));
        }
        let format = AudioFormat::from_filename(&parent.filename);
        let key = chunk_object_key(parent_id, chunk_index, format.extension());
        let meta = self.blob.head(&self.bucket, &key).await.map_err(|_| {
            Error::validation(format!(
                "chunk {chunk_index} was not found in the object store; upload it first"
            ))
        })?;
        if actual_size != 0 && meta.size != actual_size {
            warn!(
                parent_id = %parent_id,
                chunk_index,
                declared = actual_size,
                stored = meta.size,
                "declared upload size disagrees with the stored object"
            );
        }

        let parent = self.parents.mark_chunk_uploaded(parent_id, chunk_index).await?;
        self.publish_progress(&parent);

        let sub_job_id = self.resolve_sub_job_id(parent_id, chunk_index).await?;
        self.sub_jobs
            .update(sub_job_id, |s| {
                if !s.status.is_terminal() {
                    s.status = SubJobStatus::Uploaded;
                }
                s.actual_size = Some(meta.size);
                s.uploaded_at = Some(now_millis());
            })
            .await?;

        let dispatched = self.dispatch(sub_job_id, parent.options.clone()).await?;
        Ok(AcceptedChunk {
            parent_job_id: parent_id,
            chunk_index,
            sub_job_id,
            actual_size: meta.size,
            dispatched,
        })
    }

    /// Cancel a job: delete every sub-job's object and record, then mark the parent.
    /// Cancelling an already-cancelled job is a no-op.
    pub async fn cancel(&self, parent_id: Uuid, reason: Option<&str>) -> Result<ParentJob> {
        let parent = self.parents.get(parent_id).await?;
        if parent.status == ParentStatus::Cancelled {
            return Ok(parent);
        }

        for id in parent.sub_job_ids.iter().flatten() {
            if let Ok(sub) = self.sub_jobs.get(*id).await {
                let _ = self.blob.delete(&self.bucket, &sub.object_key).await;
            }
            self.sub_jobs.delete(*id).await?;
        }

        let reason = reason.unwrap_or("cancelled by client").to_owned();
        let parent = self
            .parents
            .update(parent_id, |p| {
                p.status = ParentStatus::Cancelled;
                p.cancelled_at = Some(now_millis());
                p.error_message = Some(reason.clone());
            })
            .await?;
        self.hub.close(parent_id);
        info!(parent_id = %parent_id, reason = %reason, "job cancelled");
        Ok(parent)
    }

    /// Full diagnostic state, recomputed from sub-job records rather than the parent's
    /// drift-prone counters.
    pub async fn status(&self, parent_id: Uuid) -> Result<StatusReport> {
        let parent = self.parents.get(parent_id).await?;
        let sub_jobs = self.sub_jobs.for_parent(&parent).await?;

        let mut uploaded = 0u32;
        let mut completed = 0u32;
        let mut failed = 0u32;
        let mut skipped = 0u32;
        let mut missing = 0u32;
        let mut chunks = Vec::with_capacity(sub_jobs.len());

        for (index, slot) in sub_jobs.iter().enumerate() {
            let index = index as u32;
            match slot {
                Some(sub) => {
                    if sub.uploaded_at.is_some() {
                        uploaded += 1;
                    }
                    match sub.status {
                        SubJobStatus::Done => completed += 1,
                        SubJobStatus::Failed => failed += 1,
                        SubJobStatus::Skipped => skipped += 1,
                        _ => {}
                    }
                    let recommendation = match sub.status {
                        SubJobStatus::Pending => Some(RetryKind::Upload),
                        SubJobStatus::Failed => Some(RetryKind::Processing),
                        _ => None,
                    };
                    chunks.push(ChunkStatus {
                        chunk_index: index,
                        sub_job_id: Some(sub.id),
                        status: Some(sub.status),
                        retry_count: sub.retry_count,
                        error_message: sub.error_message.clone(),
                        retry_recommendation: recommendation,
                    });
                }
                None => {
                    missing += 1;
                    chunks.push(ChunkStatus {
                        chunk_index: index,
                        sub_job_id: None,
                        status: None,
                        retry_count: 0,
                        error_message: None,
                        retry_recommendation: Some(RetryKind::Upload),
                    });
                }
            }
        }

        let counters_consistent = parent.uploaded_chunks == uploaded
            && parent.completed_chunks == completed
            && parent.failed_chunks == failed + skipped;

        Ok(StatusReport {
            parent_job_id: parent.id,
            filename: parent.filename.clone(),
            status: parent.status,
            total_chunks: parent.total_chunks,
            uploaded_chunks: uploaded,
            completed_chunks: completed,
            failed_chunks: failed,
            skipped_chunks: skipped,
            upload_percent: percent(uploaded, parent.total_chunks),
            completion_percent: percent(completed + failed + skipped, parent.total_chunks),
            chunks,
            health: JobHealth {
                sub_jobs_linked: parent.is_linked(),
                missing_sub_jobs: missing,
                counters_consistent,
            },
            final_transcript: parent.final_transcript,
            error_message: parent.error_message,
        })
    }

    /// Manual retry for one chunk. `failed` and `uploaded` sub-jobs are reset and
    /// re-enqueued; chunks whose bytes never arrived need a re-upload instead.
    pub async fn retry(&self, parent_id: Uuid, chunk_index: u32) -> Result<RetryOutcome> {
        let parent = self.parents.get(parent_id).await?;
        if parent.status == ParentStatus::Cancelled {
            return Err(Error::validation("job is cancelled"));
        }
        let slot = parent
            .sub_job_ids
            .get(chunk_index as usize)
            .copied()
            .flatten();
        let Some(sub_job_id) = slot else {
            return Ok(RetryOutcome {
                parent_job_id: parent_id,
                chunk_index,
                sub_job_id: None,
                action: RetryKind::Upload,
            });
        };

        let sub = self.sub_jobs.get(sub_job_id).await?;
        match sub.status {
            SubJobStatus::Failed | SubJobStatus::Uploaded => {}
            SubJobStatus::Pending => {
                return Ok(RetryOutcome {
                    parent_job_id: parent_id,
                    chunk_index,
                    sub_job_id: Some(sub_job_id),
                    action: RetryKind::Upload,
                });
            }
            status => {
                return Err(Error::validation(format!(
                    "sub-job is {}; only failed or uploaded sub-jobs can be retried",
                    status_name(status)
                )));
            }
        }

        let was_failed = sub.status == SubJobStatus::Failed;
        self.sub_jobs
            .update(sub_job_id, |s| {
                s.status = SubJobStatus::Uploaded;
                s.retry_count = 0;
                s.final_retry_count = None;
                s.error_message = None;
                s.error_category = None;
                s.last_failed_at = None;
                s.finished_at = None;
            })
            .await?;

        // A finalized parent comes back to life; its stream channel reopens so a client
        // can re-subscribe for the retried chunk's events.
        self.hub.open(parent_id);
        self.parents
            .update(parent_id, |p| {
                if was_failed {
                    p.failed_chunks = p.failed_chunks.saturating_sub(1);
                }
                if matches!(p.status, ParentStatus::Done | ParentStatus::Failed) {
                    p.status = ParentStatus::Processing;
                    p.final_transcript = None;
                    p.segments = None;
                    p.completed_at = None;
                    p.error_message = None;
                }
            })
            .await?;

        self.dispatch(sub_job_id, parent.options.clone()).await?;
        info!(parent_id = %parent_id, chunk_index, sub_job_id = %sub_job_id, "chunk re-enqueued");
        Ok(RetryOutcome {
            parent_job_id: parent_id,
            chunk_index,
            sub_job_id: Some(sub_job_id),
            action: RetryKind::Processing,
        })
    }

    /// Hand the sub-job to the queue when one is configured, otherwise spawn an
    /// in-process task admitted through the `chunk_processing` gate. Returns whether
    /// processing was started in-process (`false` means queued).
    async fn dispatch(&self, sub_job_id: Uuid, options: ProcessingOptions) -> Result<bool> {
        if let Some(queue) = &self.queue {
            queue.enqueue(sub_job_id).await?;
            return Ok(false);
        }

        let processor = self.processor.clone();
        let limiter = self.limiter.clone();
        tokio::spawn(async move {
            let outcome = limiter
                .run(GateKind::ChunkProcessing, processor.process(sub_job_id, &options))
                .await;
            if let Err(err) = outcome {
                warn!(sub_job_id = %sub_job_id, error = %err, "chunk processing task failed");
            }
        });
        Ok(true)
    }

    /// The linkage write and an upload can race on a freshly created job; re-read the
    /// parent a few times before declaring the sub-job missing.
    async fn resolve_sub_job_id(&self, parent_id: Uuid, chunk_index: u32) -> Result<Uuid> {
        let mut delays = RESOLVE_RETRY_DELAYS_SECS.iter();
        loop {
            let parent = self.parents.get(parent_id).await?;
            if let Some(id) = parent
                .sub_job_ids
                .get(chunk_index as usize)
                .copied()
                .flatten()
            {
                return Ok(id);
            }
            match delays.next() {
                Some(delay) => {
                    warn!(
                        parent_id = %parent_id,
                        chunk_index,
                        delay_secs = delay,
                        "sub-job not linked yet; waiting for readback"
                    );
                    sleep(Duration::from_secs(*delay)).await;
                }
                None => {
                    return Err(Error::not_found(format!(
                        "sub-job for chunk {chunk_index} of parent {parent_id}"
                    )));
                }
            }
        }
    }

    fn publish_progress(&self, parent: &ParentJob) {
        self.hub.publish(
            parent.id,
            StreamEvent::Progress {
                parent_job_id: parent.id,
                uploaded_chunks: parent.uploaded_chunks,
                completed_chunks: parent.completed_chunks,
                failed_chunks: parent.failed_chunks,
                total_chunks: parent.total_chunks,
                upload_percent: parent.upload_percent(),
                completion_percent: parent.completion_percent(),
            },
        );
    }
}

fn upload_url(parent_id: Uuid, chunk_index: u32) -> String {
    format!("/chunk-upload?parent_job_id={parent_id}&chunk_index={chunk_index}")
}

fn content_type_for(format: AudioFormat) -> &'static str {
    match format {
        AudioFormat::Wav => "audio/wav",
        AudioFormat::Mp3 => "audio/mpeg",
        AudioFormat::Mp4 => "audio/mp4",
        AudioFormat::Flac => "audio/flac",
        AudioFormat::Ogg => "audio/ogg",
        AudioFormat::Other => "application/octet-stream",
    }
}

fn status_name(status: SubJobStatus) -> &'static str {
    match status {
        SubJobStatus::Pending => "pending",
        SubJobStatus::Uploaded => "uploaded",
        SubJobStatus::Processing => "processing",
        SubJobStatus::Done => "done",
        SubJobStatus::Failed => "failed",
        SubJobStatus::Skipped => "skipped",
    }
}

fn percent(done: u32, total: u32) -> f64 {
    if total == 0 {
        return 0.0;
    }
    (f64::from(done) / f64::from(total) * 100.0).min(100.0)
}
