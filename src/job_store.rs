//! Job record stores over the key-value contract.
//!
//! Both stores serialize records as JSON strings under `parent:{id}` / `subjob:{id}` keys
//! with the 24 h in-flight TTL, refreshed to the 7-day TTL once a parent is terminal.
//! `update` is read-modify-write; there is no compare-and-swap, so status transitions rely
//! on the processor's single-writer discipline and counters are last-writer-wins hints.

use std::sync::Arc;

use tracing::warn;
use uuid::Uuid;

use crate::error::{Error, Result};
use crate::job::{ParentJob, ParentStatus, SubJob, now_millis};
use crate::kv::KvStore;
use crate::opts::{COMPLETED_JOB_TTL_SECONDS, JOB_TTL_SECONDS};

fn parent_key(id: Uuid) -> String {
    format!("parent:{id}")
}

fn sub_job_key(id: Uuid) -> String {
    format!("subjob:{id}")
}

fn record_ttl(terminal: bool) -> Option<u64> {
    Some(if terminal {
        COMPLETED_JOB_TTL_SECONDS
    } else {
        JOB_TTL_SECONDS
    })
}

/// CRUD for sub-job records.
#[derive(Clone)]
pub struct SubJobStore {
    kv: Arc<dyn KvStore>,
}

impl SubJobStore {
    pub fn new(kv: Arc<dyn KvStore>) -> Self {
        Self { kv }
    }

    pub async fn create(&self, sub_job: &SubJob) -> Result<()> {
        self.put(sub_job).await
    }

    pub async fn get(&self, id: Uuid) -> Result<SubJob> {
        let raw = self
            .kv
            .get(&sub_job_key(id))
            .await?
            .ok_or_else(|| Error::not_found(format!("sub-job {id}")))?;
        Ok(serde_json::from_str(&raw)?)
    }

    /// Read-modify-write a single record. The patch closure mutates the fields it cares
    /// about; everything else is written back unchanged.
    pub async fn update<F>(&self, id: Uuid, patch: F) -> Result<SubJob>
    where
        F: FnOnce(&mut SubJob),
    {
        let mut sub_job = self.get(id).await?;
        patch(&mut sub_job);
        self.put(&sub_job).await?;
        Ok(sub_job)
    }

    pub async fn delete(&self, id: Uuid) -> Result<()> {
        self.kv.delete(&sub_job_key(id)).await
    }

    /// Fetch every linked sub-job of `parent`, in chunk-index order. Unlinked or missing
    /// slots come back as `None` so callers can report them instead of failing.
    pub async fn for_parent(&self, parent: &ParentJob) -> Result<Vec<Option<SubJob>>> {
        let mut sub_jobs = Vec::with_capacity(parent.sub_job_ids.len());
        for slot in &parent.sub_job_ids {
            let sub_job = match slot {
                Some(id) => self.get(*id).await.ok(),
                None => None,
            };
            sub_jobs.push(sub_job);
        }
        Ok(sub_jobs)
    }

    async fn put(&self, sub_job: &SubJob) -> Result<()> {
        let raw = serde_json::to_string(sub_job)?;
        self.kv
            .put(
                &sub_job_key(sub_job.id),
                raw,
                record_ttl(sub_job.status.is_terminal()),
            )
            .await
    }
}

/// CRUD plus the semantic mutations for parent records.
#[derive(Clone)]
pub struct ParentJobStore {
    kv: Arc<dyn KvStore>,
}

impl ParentJobStore {
    pub fn new(kv: Arc<dyn KvStore>) -> Self {
        Self { kv }
    }

    pub async fn create(&self, parent: &ParentJob) -> Result<()> {
        self.put(parent).await
    }

    pub async fn get(&self, id: Uuid) -> Result<ParentJob> {
        let raw = self
            .kv
            .get(&parent_key(id))
            .await?
            .ok_or_else(|| Error::not_found(format!("parent job {id}")))?;
        Ok(serde_json::from_str(&raw)?)
    }

    pub async fn update<F>(&self, id: Uuid, patch: F) -> Result<ParentJob>
    where
        F: FnOnce(&mut ParentJob),
    {
        let mut parent = self.get(id).await?;
        patch(&mut parent);
        self.put(&parent).await?;
        Ok(parent)
    }

    pub async fn delete(&self, id: Uuid) -> Result<()> {
        self.kv.delete(&parent_key(id)).await
    }

    /// Record one uploaded chunk: bump the counter, move an `initialized` parent to
    /// `uploading`, and stamp `processing_started_at` on the first upload.
    pub async fn mark_chunk_uploaded(&self, id: Uuid, chunk_index: u32) -> Result<ParentJob> {
        let parent = self
            .update(id, |parent| {
                if parent.status.is_terminal() {
                    return;
                }
                parent.uploaded_chunks = parent.uploaded_chunks.saturating_add(1);
                if parent.status == ParentStatus::Initialized {
                    parent.status = ParentStatus::Uploading;
                }
                if parent.processing_started_at.is_none() {
                    parent.processing_started_at = Some(now_millis());
                }
            })
            .await?;
        if parent.uploaded_chunks > parent.total_chunks {
            warn!(
                parent_id = %id,
                chunk_index,
                uploaded = parent.uploaded_chunks,
                total = parent.total_chunks,
                "uploaded counter drifted past total; status reads recompute from sub-jobs"
            );
        }
        Ok(parent)
    }

    /// Record one completed chunk and stamp `first_chunk_completed_at` once.
    pub async fn mark_chunk_completed(&self, id: Uuid, _chunk_index: u32) -> Result<ParentJob> {
        self.update(id, |parent| {
            if parent.status.is_terminal() {
                return;
            }
            parent.completed_chunks = parent.completed_chunks.saturating_add(1);
            if parent.first_chunk_completed_at.is_none() {
                parent.first_chunk_completed_at = Some(now_millis());
            }
        })
        .await
    }

    /// Record one terminally failed chunk.
    pub async fn mark_chunk_failed(&self, id: Uuid, _chunk_index: u32) -> Result<ParentJob> {
        self.update(id, |parent| {
            if parent.status.is_terminal() {
                return;
            }
            parent.failed_chunks = parent.failed_chunks.saturating_add(1);
        })
        .await
    }

    /// Move a non-terminal parent to `processing` once chunk work actually starts.
    pub async fn mark_processing(&self, id: Uuid) -> Result<ParentJob> {
        self.update(id, |parent| {
            if !parent.status.is_terminal() {
                parent.status = ParentStatus::Processing;
            }
        })
        .await
    }

    async fn put(&self, parent: &ParentJob) -> Result<()> {
        let raw = serde_json::to_string(parent)?;
        self.kv
            .put(
                &parent_key(parent.id),
                raw,
                record_ttl(parent.status.is_terminal()),
            )
            .await
    }
}
