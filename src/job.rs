//! Parent and sub-job records.
//!
//! A parent job coordinates one uploaded file; each sub-job owns one byte-range chunk of
//! that file. Both are closed-schema JSON records held in the key-value store, so every
//! field the pipeline touches is named here rather than living in a free-form map.

use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::classify::ErrorCategory;
use crate::opts::ProcessingOptions;

/// Milliseconds since the Unix epoch. All record timestamps use this clock.
pub(crate) fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

/// One transcribed span of audio, in seconds relative to the start of its chunk until the
/// assembler offsets it into file time.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Segment {
    pub start: f64,
    pub end: f64,
    pub text: String,
}

/// A half-open byte range `[start, end)` within the uploaded file.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct ByteRange {
    pub start: u64,
    pub end: u64,
}

impl ByteRange {
    pub fn len(&self) -> u64 {
        self.end.saturating_sub(self.start)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ParentStatus {
    Initialized,
    Uploading,
    Processing,
    Done,
    Failed,
    Cancelled,
}

impl ParentStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Done | Self::Failed | Self::Cancelled)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SubJobStatus {
    Pending,
    Uploaded,
    Processing,
    Done,
    Failed,
    Skipped,
}

impl SubJobStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Done | Self::Failed | Self::Skipped)
    }
}

/// Coordination record for one file's worth of sub-jobs.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ParentJob {
    pub id: Uuid,
    pub filename: String,
    pub total_size: u64,
    pub chunk_size_bytes: u64,
    pub total_chunks: u32,
    pub status: ParentStatus,

    /// Slot `i` holds the id of the sub-job covering chunk index `i`. Slots are only `None`
    /// between parent creation and the single linkage write that fills the whole list.
    pub sub_job_ids: Vec<Option<Uuid>>,

    // Counters are last-writer-wins hints; exact values are recomputed from sub-job records
    // where precision matters.
    pub uploaded_chunks: u32,
    pub completed_chunks: u32,
    pub failed_chunks: u32,

    pub options: ProcessingOptions,

    pub created_at: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub processing_started_at: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub first_chunk_completed_at: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cancelled_at: Option<u64>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub final_transcript: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub segments: Option<Vec<Segment>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
}

impl ParentJob {
    pub fn new(
        filename: String,
        total_size: u64,
        chunk_size_bytes: u64,
        total_chunks: u32,
        options: ProcessingOptions,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            filename,
            total_size,
            chunk_size_bytes,
            total_chunks,
            status: ParentStatus::Initialized,
            sub_job_ids: vec![None; total_chunks as usize],
            uploaded_chunks: 0,
            completed_chunks: 0,
            failed_chunks: 0,
            options,
            created_at: now_millis(),
            processing_started_at: None,
            first_chunk_completed_at: None,
            completed_at: None,
            cancelled_at: None,
            final_transcript: None,
            segments: None,
            error_message: None,
        }
    }

    /// The byte range chunk `index` covers. The last chunk absorbs the remainder.
    pub fn byte_range_for(&self, index: u32) -> ByteRange {
        let start = u64::from(index) * self.chunk_size_bytes;
        let end = (start + self.chunk_size_bytes).min(self.total_size);
        ByteRange { start, end }
    }

    pub fn upload_percent(&self) -> f64 {
        percent(self.uploaded_chunks, self.total_chunks)
    }

    pub fn completion_percent(&self) -> f64 {
        percent(self.completed_chunks + self.failed_chunks, self.total_chunks)
    }

    /// True once every slot in `sub_job_ids` has been filled by the linkage write.
    pub fn is_linked(&self) -> bool {
        self.sub_job_ids.len() == self.total_chunks as usize
            && self.sub_job_ids.iter().all(Option::is_some)
    }
}

fn percent(done: u32, total: u32) -> f64 {
    if total == 0 {
        return 0.0;
    }
    (f64::from(done) / f64::from(total) * 100.0).min(100.0)
}

/// Processing record for one chunk.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubJob {
    pub id: Uuid,
    pub parent_id: Uuid,
    pub chunk_index: u32,
    pub byte_range: ByteRange,
    pub status: SubJobStatus,

    /// Path of the uploaded chunk in the blob store. Owned by this record and deleted with it.
    pub object_key: String,

    /// Declared size from the chunk plan.
    pub size: u64,
    /// Observed size after upload.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub actual_size: Option<u64>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub raw_text: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub corrected_text: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub segments: Vec<Segment>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub duration: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub processing_time_ms: Option<u64>,
    #[serde(default)]
    pub llm_applied: bool,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_category: Option<ErrorCategory>,
    #[serde(default)]
    pub retry_count: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub final_retry_count: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_failed_at: Option<u64>,

    pub created_at: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub uploaded_at: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub processing_started_at: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<u64>,
}

impl SubJob {
    pub fn new(parent_id: Uuid, chunk_index: u32, byte_range: ByteRange, object_key: String) -> Self {
        Self {
            id: Uuid::new_v4(),
            parent_id,
            chunk_index,
            byte_range,
            status: SubJobStatus::Pending,
            object_key,
            size: byte_range.len(),
            actual_size: None,
            raw_text: None,
            corrected_text: None,
            segments: Vec::new(),
            duration: None,
            processing_time_ms: None,
            llm_applied: false,
            error_message: None,
            error_category: None,
            retry_count: 0,
            final_retry_count: None,
            last_failed_at: None,
            created_at: now_millis(),
            uploaded_at: None,
            processing_started_at: None,
            finished_at: None,
        }
    }

    /// The text the assembler should use for this chunk.
    pub fn effective_text(&self) -> Option<&str> {
        self.corrected_text
            .as_deref()
            .or(self.raw_text.as_deref())
            .filter(|_| self.status == SubJobStatus::Done)
    }
}
