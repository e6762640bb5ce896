//! The per-chunk processing engine.
//!
//! One call to [`ChunkProcessor::process`] owns a sub-job from `uploaded` to a terminal
//! state: fetch the chunk bytes, run the conservative first-chunk preprocessing, call the
//! speech backend under the retry policy, optionally correct the text, and commit the
//! result. The caller guarantees no two workers process the same sub-job concurrently;
//! every terminal write re-checks the parent so cancelled jobs become no-ops.

use std::sync::Arc;
use std::time::Instant;

use tokio::time::{Duration, sleep};
use tracing::{info, warn};
use uuid::Uuid;

use crate::backend::{SpeechBackend, Transcription};
use crate::blob::BlobStore;
use crate::chunker::{AudioFormat, mp3, wav, zero_density};
use crate::classify::{
    ErrorCategory, backoff_millis, classify, inner_max_attempts, outer_round_cap,
    should_skip_first_chunk,
};
use crate::error::{Error, Result};
use crate::events::{EventHub, SKIP_STRATEGY_METADATA_ONLY, StreamEvent};
use crate::job::{ParentJob, SubJob, SubJobStatus, now_millis};
use crate::job_store::{ParentJobStore, SubJobStore};
use crate::limiter::{GateKind, RateLimiter};
use crate::opts::ProcessingOptions;

use crate::assembler::Assembler;

/// How a `process` call settled its sub-job.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChunkOutcome {
    Done,
    Skipped,
    Failed,
    /// The parent was cancelled (or its records deleted) before we could commit.
    CancelledNoOp,
}

/// Terminal failure of the whole retry policy for one chunk.
#[derive(Debug, Clone)]
struct TranscribeFailure {
    category: ErrorCategory,
    message: String,
    attempts: u32,
}

pub struct ChunkProcessor {
    parents: ParentJobStore,
    sub_jobs: SubJobStore,
    blob: Arc<dyn BlobStore>,
    speech: Arc<dyn SpeechBackend>,
    llm: Option<Arc<dyn crate::backend::LlmBackend>>,
    limiter: Arc<RateLimiter>,
    hub: Arc<EventHub>,
    assembler: Arc<Assembler>,
    bucket: String,
}

impl ChunkProcessor {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        parents: ParentJobStore,
        sub_jobs: SubJobStore,
        blob: Arc<dyn BlobStore>,
        speech: Arc<dyn SpeechBackend>,
        llm: Option<Arc<dyn crate::backend::LlmBackend>>,
        limiter: Arc<RateLimiter>,
        hub: Arc<EventHub>,
        assembler: Arc<Assembler>,
        bucket: impl Into<String>,
    ) -> Self {
        Self {
            parents,
            sub_jobs,
            blob,
            speech,
            llm,
            limiter,
            hub,
            assembler,
            bucket: bucket.into(),
        }
    }

    /// Drive one sub-job to a terminal state.
    pub async fn process(&self, sub_job_id: Uuid, opts: &ProcessingOptions) -> Result<ChunkOutcome> {
        let started = Instant::now();

        let sub = self.sub_jobs.get(sub_job_id).await?;
        if sub.status.is_terminal() {
            return Ok(match sub.status {
                SubJobStatus::Done => ChunkOutcome::Done,
                SubJobStatus::Skipped => ChunkOutcome::Skipped,
                _ => ChunkOutcome::Failed,
            });
        }

        let parent = match self.parents.get(sub.parent_id).await {
            Ok(parent) if parent.status != crate::job::ParentStatus::Cancelled => parent,
            _ => return Ok(ChunkOutcome::CancelledNoOp),
        };

        let sub = self
            .sub_jobs
            .update(sub_job_id, |s| {
                s.status = SubJobStatus::Processing;
                s.processing_started_at = Some(now_millis());
            })
            .await?;
        self.parents.mark_processing(sub.parent_id).await?;

        let format = AudioFormat::from_filename(&parent.filename);
        let bytes = self.blob.get(&self.bucket, &sub.object_key).await?;
        let first_chunk = sub.chunk_index == 0;

        let bytes = if first_chunk {
            prepare_first_chunk(bytes, format)
        } else if bytes.is_empty() {
            return self
                .commit_failure(
                    &sub,
                    TranscribeFailure {
                        category: ErrorCategory::AudioEmpty,
                        message: "chunk buffer is empty".to_owned(),
                        attempts: 0,
                    },
                )
                .await;
        } else {
            bytes
        };

        let extension = format.extension();
        let model = opts.model.as_deref();

        match self
            .transcribe_chunk(&sub, &bytes, extension, model, first_chunk)
            .await
        {
            Ok((transcription, attempts)) => {
                self.commit_success(&sub, opts, transcription, attempts, started)
                    .await
            }
            Err(failure) => {
                if first_chunk {
                    self.log_first_chunk_diagnostics(&sub, &bytes, format);
                    // One permissive-extension fallback before giving up on the head.
                    let fallback_ext = if extension == "mp3" { "wav" } else { "mp3" };
                    let fallback = self
                        .limiter
                        .run(
                            GateKind::Transcription,
                            self.speech.transcribe(&bytes, fallback_ext, model),
                        )
                        .await;
                    match fallback {
                        Ok(transcription) => {
                            info!(
                                sub_job_id = %sub.id,
                                fallback_ext,
                                "first-chunk fallback transcription succeeded"
                            );
                            return self
                                .commit_success(
                                    &sub,
                                    opts,
                                    transcription,
                                    failure.attempts + 1,
                                    started,
                                )
                                .await;
                        }
                        Err(err) => {
                            let failure = TranscribeFailure {
                                category: classify(err.status, &err.message),
                                message: err.message,
                                attempts: failure.attempts + 1,
                            };
                            return self.commit_failure(&sub, failure).await;
                        }
                    }
                }
                self.commit_failure(&sub, failure).await
            }
        }
    }

    /// Full retry policy: an inner attempt loop with exponential backoff, then outer
    /// whole-rounds capped per error category.
    async fn transcribe_chunk(
        &self,
        sub: &SubJob,
        bytes: &[u8],
        extension: &str,
        model: Option<&str>,
        first_chunk: bool,
    ) -> std::result::Result<(Transcription, u32), TranscribeFailure> {
        let mut total_attempts = 0u32;
        let mut outer_round = 0u32;

        loop {
            match self
                .transcribe_with_retry(sub, bytes, extension, model, first_chunk, total_attempts)
                .await
            {
                Ok((transcription, attempts)) => {
                    return Ok((transcription, total_attempts + attempts));
                }
                Err(mut failure) => {
                    total_attempts += failure.attempts;
                    let cap = outer_round_cap(failure.category, first_chunk);
                    if outer_round >= cap {
                        failure.attempts = total_attempts;
                        return Err(failure);
                    }
                    outer_round += 1;
                    warn!(
                        sub_job_id = %sub.id,
                        chunk_index = sub.chunk_index,
                        category = failure.category.as_str(),
                        outer_round,
                        cap,
                        "retry attempts exhausted; starting another round"
                    );
                    sleep(Duration::from_millis(backoff_millis(outer_round))).await;
                }
            }
        }
    }

    /// Inner attempt loop. Every category except `auth_error` is worth retrying here;
    /// the per-category caps are enforced by the outer rounds.
    async fn transcribe_with_retry(
        &self,
        sub: &SubJob,
        bytes: &[u8],
        extension: &str,
        model: Option<&str>,
        first_chunk: bool,
        attempts_so_far: u32,
    ) -> std::result::Result<(Transcription, u32), TranscribeFailure> {
        let max_attempts = inner_max_attempts(first_chunk);
        let mut attempt = 0u32;

        loop {
            attempt += 1;
            let result = self
                .limiter
                .run(
                    GateKind::Transcription,
                    self.speech.transcribe(bytes, extension, model),
                )
                .await;

            let err = match result {
                Ok(transcription) => return Ok((transcription, attempt)),
                Err(err) => err,
            };

            let category = classify(err.status, &err.message);
            warn!(
                sub_job_id = %sub.id,
                chunk_index = sub.chunk_index,
                attempt,
                max_attempts,
                category = category.as_str(),
                error = %err.message,
                "transcription attempt failed"
            );

            // Keep the record's retry bookkeeping fresh; best-effort, the terminal write
            // is what matters.
            let total = attempts_so_far + attempt;
            let _ = self
                .sub_jobs
                .update(sub.id, |s| {
                    s.retry_count = total.saturating_sub(1);
                    s.error_message = Some(err.message.clone());
                    s.error_category = Some(category);
                    s.last_failed_at = Some(now_millis());
                })
                .await;

            if !category.inner_retryable() || attempt >= max_attempts {
                return Err(TranscribeFailure {
                    category,
                    message: err.message,
                    attempts: attempt,
                });
            }
            sleep(Duration::from_millis(backoff_millis(attempt))).await;
        }
    }

    async fn commit_success(
        &self,
        sub: &SubJob,
        opts: &ProcessingOptions,
        transcription: Transcription,
        attempts: u32,
        started: Instant,
    ) -> Result<ChunkOutcome> {
        let raw_text = transcription.text;

        let (corrected_text, llm_applied) = if opts.per_chunk_correction() && !raw_text.is_empty() {
            match &self.llm {
                Some(llm) => match self.limiter.run(GateKind::Llm, llm.correct(&raw_text)).await {
                    Ok(corrected) => (Some(corrected), true),
                    Err(err) => {
                        warn!(
                            sub_job_id = %sub.id,
                            error = %err,
                            "per-chunk correction failed; keeping raw text"
                        );
                        (None, false)
                    }
                },
                None => (None, false),
            }
        } else {
            (None, false)
        };

        if self.parent_gone_or_cancelled(sub.parent_id).await {
            return Ok(ChunkOutcome::CancelledNoOp);
        }

        let processing_time_ms = started.elapsed().as_millis() as u64;
        let retry_count = attempts.saturating_sub(1);
        let updated = self
            .sub_jobs
            .update(sub.id, |s| {
                s.status = SubJobStatus::Done;
                s.raw_text = Some(raw_text.clone());
                s.corrected_text = corrected_text.clone();
                s.segments = transcription.segments.clone();
                s.duration = transcription.duration;
                s.processing_time_ms = Some(processing_time_ms);
                s.llm_applied = llm_applied;
                s.retry_count = retry_count;
                s.final_retry_count = Some(retry_count);
                s.error_message = None;
                s.error_category = None;
                s.finished_at = Some(now_millis());
            })
            .await?;

        let parent = self
            .parents
            .mark_chunk_completed(sub.parent_id, sub.chunk_index)
            .await?;
        self.publish_progress(&parent);
        self.hub.publish(
            sub.parent_id,
            StreamEvent::ChunkComplete {
                chunk_index: sub.chunk_index,
                parent_job_id: sub.parent_id,
                text: updated.effective_text().unwrap_or_default().to_owned(),
                raw_text: updated.raw_text.clone().unwrap_or_default(),
                corrected_text: updated.corrected_text.clone(),
                segments: updated.segments.clone(),
                processing_time: processing_time_ms,
                llm_applied,
            },
        );
        info!(
            sub_job_id = %sub.id,
            chunk_index = sub.chunk_index,
            attempts,
            processing_time_ms,
            "chunk transcribed"
        );

        self.assembler.maybe_finalize(sub.parent_id).await?;
        Ok(ChunkOutcome::Done)
    }

    async fn commit_failure(
        &self,
        sub: &SubJob,
        failure: TranscribeFailure,
    ) -> Result<ChunkOutcome> {
        if self.parent_gone_or_cancelled(sub.parent_id).await {
            return Ok(ChunkOutcome::CancelledNoOp);
        }

        let first_chunk = sub.chunk_index == 0;
        let skip = first_chunk
            && should_skip_first_chunk(failure.category, &failure.message, failure.attempts);
        let retry_count = failure.attempts.saturating_sub(1);

        let status = if skip {
            SubJobStatus::Skipped
        } else {
            SubJobStatus::Failed
        };
        self.sub_jobs
            .update(sub.id, |s| {
                s.status = status;
                s.error_message = Some(failure.message.clone());
                s.error_category = Some(failure.category);
                s.retry_count = retry_count;
                s.final_retry_count = Some(retry_count);
                s.last_failed_at = Some(now_millis());
                s.finished_at = Some(now_millis());
                if skip {
                    // A skipped chunk contributes an empty transcript, not a failure.
                    s.raw_text = Some(String::new());
                }
            })
            .await?;

        let parent = self
            .parents
            .mark_chunk_failed(sub.parent_id, sub.chunk_index)
            .await?;
        self.publish_progress(&parent);

        if skip {
            info!(
                sub_job_id = %sub.id,
                attempts = failure.attempts,
                reason = %failure.message,
                "first chunk skipped as non-audio"
            );
            self.hub.publish(
                sub.parent_id,
                StreamEvent::ChunkSkipped {
                    chunk_index: sub.chunk_index,
                    parent_job_id: sub.parent_id,
                    reason: failure.message,
                    strategy: SKIP_STRATEGY_METADATA_ONLY.to_owned(),
                },
            );
        } else {
            warn!(
                sub_job_id = %sub.id,
                chunk_index = sub.chunk_index,
                category = failure.category.as_str(),
                attempts = failure.attempts,
                error = %failure.message,
                "chunk failed terminally"
            );
            self.hub.publish(
                sub.parent_id,
                StreamEvent::ChunkError {
                    chunk_index: sub.chunk_index,
                    parent_job_id: sub.parent_id,
                    error: failure.message,
                    error_type: failure.category.as_str().to_owned(),
                    retry_count,
                },
            );
        }

        self.assembler.maybe_finalize(sub.parent_id).await?;
        Ok(if skip {
            ChunkOutcome::Skipped
        } else {
            ChunkOutcome::Failed
        })
    }

    async fn parent_gone_or_cancelled(&self, parent_id: Uuid) -> bool {
        match self.parents.get(parent_id).await {
            Ok(parent) => parent.status == crate::job::ParentStatus::Cancelled,
            Err(Error::NotFound(_)) => true,
            Err(_) => false,
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

    fn log_first_chunk_diagnostics(&self, sub: &SubJob, bytes: &[u8], format: AudioFormat) {
        let density = zero_density(bytes, 1024);
        let id3 = mp3::id3_tag_len(bytes);
        let wav_header = wav::parse_header(bytes).is_some();
        let mp3_frames = !mp3::scan_frames(bytes).is_empty();
        warn!(
            sub_job_id = %sub.id,
            format = ?format,
            size = bytes.len(),
            zero_density = density,
            id3_tag_bytes = id3,
            wav_header,
            mp3_frames,
            "first chunk exhausted retries; format diagnostics"
        );
    }
}

/// Conservative preprocessing for the head of the file.
///
/// Only an MP3 head with an oversized ID3v2 tag is rewritten, and only when enough audio
/// survives to be worth transcribing on its own. Everything else passes through
/// unchanged; for a tag-only chunk the skip rule is the right tool, not byte surgery.
pub(crate) fn prepare_first_chunk(bytes: Vec<u8>, format: AudioFormat) -> Vec<u8> {
    let density = zero_density(&bytes, 1024);
    if density > 0.5 {
        warn!(
            zero_density = density,
            "first 1 KiB of chunk 0 is mostly zero bytes; head may be corrupted"
        );
    }

    if format != AudioFormat::Mp3 {
        return bytes;
    }
    let Some(tag_len) = mp3::id3_tag_len(&bytes) else {
        return bytes;
    };
    if tag_len >= bytes.len() {
        // Tag-only chunk: nothing to salvage by trimming.
        return bytes;
    }
    let audio_tail = bytes.len() - tag_len;
    if tag_len * 2 > bytes.len() && audio_tail > 1024 {
        info!(
            tag_len,
            audio_tail, "dropping oversized ID3 tag from chunk 0 before transcription"
        );
        return bytes[tag_len..].to_vec();
    }
    bytes
}
