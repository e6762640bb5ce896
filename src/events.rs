//! Lifecycle events and the per-parent fan-out hub.
//!
//! Every parent job gets one multi-producer, single-subscriber channel. Producers (chunk
//! processors, the assembler) publish typed events; the single subscriber drains them into
//! an SSE response. Delivery is best-effort: events for unknown or already-closed parents
//! are dropped, and exactly-once delivery is not guaranteed.

use std::collections::HashMap;
use std::sync::Mutex;

use serde::Serialize;
use tokio::sync::mpsc;
use uuid::Uuid;

use crate::job::Segment;

/// Strategy tag carried on skip events.
pub const SKIP_STRATEGY_METADATA_ONLY: &str = "skip_metadata_only";

/// One event on a parent's stream. Serializes with a `type` tag matching the wire schema.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StreamEvent {
    ChunkComplete {
        chunk_index: u32,
        parent_job_id: Uuid,
        text: String,
        raw_text: String,
        corrected_text: Option<String>,
        segments: Vec<Segment>,
        processing_time: u64,
        llm_applied: bool,
    },
    ChunkError {
        chunk_index: u32,
        parent_job_id: Uuid,
        error: String,
        error_type: String,
        retry_count: u32,
    },
    ChunkSkipped {
        chunk_index: u32,
        parent_job_id: Uuid,
        reason: String,
        strategy: String,
    },
    Progress {
        parent_job_id: Uuid,
        uploaded_chunks: u32,
        completed_chunks: u32,
        failed_chunks: u32,
        total_chunks: u32,
        upload_percent: f64,
        completion_percent: f64,
    },
    Final {
        parent_job_id: Uuid,
        final_transcript: String,
        segments: Vec<Segment>,
    },
}

struct ChannelSlot {
    tx: mpsc::UnboundedSender<StreamEvent>,
    rx: Option<mpsc::UnboundedReceiver<StreamEvent>>,
}

/// Registry of per-parent event channels.
#[derive(Default)]
pub struct EventHub {
    channels: Mutex<HashMap<Uuid, ChannelSlot>>,
}

impl EventHub {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create the channel for `parent_id` if it doesn't exist yet. Idempotent.
    pub fn open(&self, parent_id: Uuid) {
        let mut channels = self.channels.lock().expect("event hub poisoned");
        channels.entry(parent_id).or_insert_with(|| {
            let (tx, rx) = mpsc::unbounded_channel();
            ChannelSlot { tx, rx: Some(rx) }
        });
    }

    /// Publish an event. Dropped silently when the parent's channel is missing or closed.
    pub fn publish(&self, parent_id: Uuid, event: StreamEvent) {
        let channels = self.channels.lock().expect("event hub poisoned");
        if let Some(slot) = channels.get(&parent_id) {
            let _ = slot.tx.send(event);
        }
    }

    /// Publish the terminal event and close the channel in one step, so nothing can land
    /// on the stream after it. The subscriber drains buffered events, sees this one last,
    /// then the stream ends.
    pub fn publish_final(&self, parent_id: Uuid, event: StreamEvent) {
        let mut channels = self.channels.lock().expect("event hub poisoned");
        if let Some(slot) = channels.remove(&parent_id) {
            let _ = slot.tx.send(event);
        }
    }

    /// Take the single subscriber end for `parent_id`. Returns `None` when the parent is
    /// unknown, already closed, or already subscribed — callers close the stream
    /// immediately in that case.
    pub fn subscribe(&self, parent_id: Uuid) -> Option<mpsc::UnboundedReceiver<StreamEvent>> {
        let mut channels = self.channels.lock().expect("event hub poisoned");
        channels.get_mut(&parent_id).and_then(|slot| slot.rx.take())
    }

    /// Drop the channel without a final event (cancellation path).
    pub fn close(&self, parent_id: Uuid) {
        let mut channels = self.channels.lock().expect("event hub poisoned");
        channels.remove(&parent_id);
    }
}
