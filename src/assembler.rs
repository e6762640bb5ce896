//! Final transcript assembly.
//!
//! Once every sub-job of a parent is terminal, the assembler concatenates the `done`
//! chunks' text in chunk-index order, optionally runs the post-mode LLM correction, writes
//! the result onto the parent, and emits the `final` event — which also closes the stream,
//! so `final` is guaranteed to be the last event a subscriber sees.

use std::sync::Arc;

use tokio::time::{Duration, sleep};
use tracing::{info, warn};
use uuid::Uuid;

use crate::backend::LlmBackend;
use crate::error::{Error, Result};
use crate::events::{EventHub, StreamEvent};
use crate::job::{ParentStatus, Segment, SubJob, now_millis};
use crate::job_store::{ParentJobStore, SubJobStore};
use crate::limiter::{GateKind, RateLimiter};

/// Attempts for the post-mode correction call.
const POST_CORRECTION_ATTEMPTS: u32 = 4;
/// Backoff between post-correction attempts: 1 s, 3 s, 9 s (capped at 20 s).
const POST_CORRECTION_MAX_BACKOFF_SECS: u64 = 20;

pub struct Assembler {
    parents: ParentJobStore,
    sub_jobs: SubJobStore,
    llm: Option<Arc<dyn LlmBackend>>,
    limiter: Arc<RateLimiter>,
    hub: Arc<EventHub>,
}

impl Assembler {
    pub fn new(
        parents: ParentJobStore,
        sub_jobs: SubJobStore,
        llm: Option<Arc<dyn LlmBackend>>,
        limiter: Arc<RateLimiter>,
        hub: Arc<EventHub>,
    ) -> Self {
        Self {
            parents,
            sub_jobs,
            llm,
            limiter,
            hub,
        }
    }

    /// Finalize `parent_id` if every sub-job is terminal. Returns whether this call did
    /// the finalization. Safe to call after every chunk settles; non-ready parents and
    /// parents finalized by a racing caller return `false`.
    pub async fn maybe_finalize(&self, parent_id: Uuid) -> Result<bool> {
        let parent = match self.parents.get(parent_id).await {
            Ok(parent) => parent,
            Err(Error::NotFound(_)) => return Ok(false),
            Err(err) => return Err(err),
        };
        if parent.status.is_terminal() || !parent.is_linked() {
            return Ok(false);
        }

        let sub_jobs = self.sub_jobs.for_parent(&parent).await?;
        let all_terminal = sub_jobs
            .iter()
            .all(|s| s.as_ref().is_some_and(|s| s.status.is_terminal()));
        if !all_terminal {
            return Ok(false);
        }

        let done: Vec<&SubJob> = sub_jobs
            .iter()
            .flatten()
            .filter(|s| s.effective_text().is_some())
            .collect();

        let mut transcript = done
            .iter()
            .filter_map(|s| s.effective_text())
            .map(str::trim)
            .filter(|t| !t.is_empty())
            .collect::<Vec<_>>()
            .join(" ");

        if parent.options.post_correction() && !transcript.is_empty() {
            transcript = self.correct_with_retries(&transcript).await;
        }

        let segments = aggregate_segments(&done);
        let status = if done.is_empty() {
            ParentStatus::Failed
        } else {
            ParentStatus::Done
        };

        let mut finalized_here = false;
        self.parents
            .update(parent_id, |p| {
                if p.status.is_terminal() {
                    return;
                }
                p.status = status;
                p.final_transcript = Some(transcript.clone());
                p.segments = Some(segments.clone());
                p.completed_at = Some(now_millis());
                if status == ParentStatus::Failed {
                    p.error_message = Some("no chunk produced a transcript".to_owned());
                }
                finalized_here = true;
            })
            .await?;
        if !finalized_here {
            return Ok(false);
        }

        info!(
            parent_id = %parent_id,
            status = ?status,
            chunks_done = done.len(),
            transcript_len = transcript.len(),
            "parent finalized"
        );
        self.hub.publish_final(
            parent_id,
            StreamEvent::Final {
                parent_job_id: parent_id,
                final_transcript: transcript,
                segments,
            },
        );
        Ok(true)
    }

    async fn correct_with_retries(&self, transcript: &str) -> String {
        let Some(llm) = &self.llm else {
            return transcript.to_owned();
        };

        for attempt in 1..=POST_CORRECTION_ATTEMPTS {
            match self
                .limiter
                .run(GateKind::Llm, llm.correct(transcript))
                .await
            {
                Ok(corrected) if !corrected.trim().is_empty() => return corrected,
                Ok(_) => {
                    warn!(attempt, "post correction returned an empty transcript; keeping raw");
                    return transcript.to_owned();
                }
                Err(err) => {
                    warn!(attempt, error = %err, "post correction attempt failed");
                    if attempt < POST_CORRECTION_ATTEMPTS {
                        sleep(Duration::from_secs(post_correction_backoff_secs(attempt))).await;
                    }
                }
            }
        }
        warn!("post correction exhausted retries; keeping raw transcript");
        transcript.to_owned()
    }
}

fn post_correction_backoff_secs(attempt: u32) -> u64 {
    3u64.saturating_pow(attempt.saturating_sub(1))
        .min(POST_CORRECTION_MAX_BACKOFF_SECS)
}

/// Concatenate chunk segments in index order, offsetting each chunk's times by the
/// cumulative duration of the chunks before it so the list is monotone over the file.
fn aggregate_segments(done: &[&SubJob]) -> Vec<Segment> {
    let mut segments = Vec::new();
    let mut offset = 0.0f64;
    for sub in done {
        for seg in &sub.segments {
            segments.push(Segment {
                start: seg.start + offset,
                end: seg.end + offset,
                text: seg.text.clone(),
            });
        }
        let chunk_span = sub
            .duration
            .or_else(|| sub.segments.last().map(|s| s.end))
            .unwrap_or(0.0);
        offset += chunk_span;
    }
    segments
}
