//! End-to-end pipeline scenarios over the in-memory stores and a scripted speech stub.
//!
//! Time is paused in every test, so retry backoffs run instantly while preserving their
//! ordering semantics.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tokio::sync::mpsc::UnboundedReceiver;
use tokio::time::{Duration, timeout};
use uuid::Uuid;

use longhand::assembler::Assembler;
use longhand::backend::{BackendError, LlmBackend, SpeechBackend, Transcription};
use longhand::blob::MemoryBlobStore;
use longhand::coordinator::{RetryKind, UploadCoordinator};
use longhand::events::{EventHub, StreamEvent};
use longhand::job::{ParentStatus, Segment, SubJobStatus};
use longhand::job_store::{ParentJobStore, SubJobStore};
use longhand::kv::{KvStore, MemoryKvStore};
use longhand::limiter::RateLimiter;
use longhand::opts::{LlmMode, ProcessingOptions};
use longhand::processor::ChunkProcessor;

const MIB: u64 = 1024 * 1024;
const BUCKET: &str = "longhand";

/// Scripted speech backend: the closure sees the audio bytes and the 1-based attempt
/// number for that chunk (keyed by the chunk's first byte).
type SpeechScript =
    dyn Fn(&[u8], u32) -> Result<Transcription, BackendError> + Send + Sync + 'static;

struct StubSpeech {
    attempts: Mutex<HashMap<u8, u32>>,
    total_calls: AtomicU32,
    script: Box<SpeechScript>,
}

impl StubSpeech {
    fn new(
        script: impl Fn(&[u8], u32) -> Result<Transcription, BackendError> + Send + Sync + 'static,
    ) -> Arc<Self> {
        Arc::new(Self {
            attempts: Mutex::new(HashMap::new()),
            total_calls: AtomicU32::new(0),
            script: Box::new(script),
        })
    }

    fn attempts_for(&self, key: u8) -> u32 {
        self.attempts.lock().unwrap().get(&key).copied().unwrap_or(0)
    }
}

#[async_trait]
impl SpeechBackend for StubSpeech {
    async fn transcribe(
        &self,
        audio: &[u8],
        _extension: &str,
        _model: Option<&str>,
    ) -> Result<Transcription, BackendError> {
        self.total_calls.fetch_add(1, Ordering::SeqCst);
        let key = audio.first().copied().unwrap_or(0);
        let attempt = {
            let mut attempts = self.attempts.lock().unwrap();
            let slot = attempts.entry(key).or_insert(0);
            *slot += 1;
            *slot
        };
        (self.script)(audio, attempt)
    }
}

struct UppercaseLlm;

#[async_trait]
impl LlmBackend for UppercaseLlm {
    async fn correct(&self, text: &str) -> Result<String, BackendError> {
        Ok(text.to_uppercase())
    }
}

struct Pipeline {
    coordinator: Arc<UploadCoordinator>,
    parents: ParentJobStore,
    sub_jobs: SubJobStore,
    hub: Arc<EventHub>,
    blob: Arc<MemoryBlobStore>,
}

fn build_pipeline(speech: Arc<StubSpeech>, llm: Option<Arc<dyn LlmBackend>>) -> Pipeline {
    let kv: Arc<dyn KvStore> = Arc::new(MemoryKvStore::new());
    let blob = Arc::new(MemoryBlobStore::new());
    let parents = ParentJobStore::new(kv.clone());
    let sub_jobs = SubJobStore::new(kv);
    let limiter = Arc::new(RateLimiter::default());
    let hub = Arc::new(EventHub::new());

    let assembler = Arc::new(Assembler::new(
        parents.clone(),
        sub_jobs.clone(),
        llm.clone(),
        limiter.clone(),
        hub.clone(),
    ));
    let processor = Arc::new(ChunkProcessor::new(
        parents.clone(),
        sub_jobs.clone(),
        blob.clone(),
        speech,
        llm,
        limiter.clone(),
        hub.clone(),
        assembler,
        BUCKET,
    ));
    let coordinator = Arc::new(UploadCoordinator::new(
        parents.clone(),
        sub_jobs.clone(),
        blob.clone(),
        limiter,
        hub.clone(),
        processor,
        None,
        BUCKET,
    ));

    Pipeline {
        coordinator,
        parents,
        sub_jobs,
        hub,
        blob,
    }
}

fn chunk_bytes(index: u8, len: u64) -> Vec<u8> {
    vec![index; len as usize]
}

fn text_by_first_byte(audio: &[u8]) -> &'static str {
    match audio.first() {
        Some(0) => "alpha",
        Some(1) => "bravo",
        Some(2) => "charlie",
        _ => "delta",
    }
}

fn ok_transcription(audio: &[u8]) -> Transcription {
    let text = text_by_first_byte(audio);
    Transcription {
        text: text.to_owned(),
        segments: vec![Segment {
            start: 0.0,
            end: 2.0,
            text: text.to_owned(),
        }],
        duration: Some(2.0),
    }
}

/// Drain the stream until it closes, with a generous (paused-time) guard.
async fn drain_events(mut rx: UnboundedReceiver<StreamEvent>) -> Vec<StreamEvent> {
    let mut events = Vec::new();
    loop {
        match timeout(Duration::from_secs(3600), rx.recv()).await {
            Ok(Some(event)) => events.push(event),
            Ok(None) => return events,
            Err(_) => panic!("event stream never closed; got {} events so far", events.len()),
        }
    }
}

fn event_type(event: &StreamEvent) -> &'static str {
    match event {
        StreamEvent::ChunkComplete { .. } => "chunk_complete",
        StreamEvent::ChunkError { .. } => "chunk_error",
        StreamEvent::ChunkSkipped { .. } => "chunk_skipped",
        StreamEvent::Progress { .. } => "progress",
        StreamEvent::Final { .. } => "final",
    }
}

#[tokio::test(start_paused = true)]
async fn s1_happy_path_three_chunks() {
    let speech = StubSpeech::new(|audio, _| Ok(ok_transcription(audio)));
    let pipeline = build_pipeline(speech, None);

    let init = pipeline
        .coordinator
        .initialize("talk.mp3", 12 * MIB, Some(5), ProcessingOptions::default())
        .await
        .unwrap();
    let parent_id = init.parent_job_id;

    assert_eq!(init.chunk_info.total_chunks, 3);
    assert_eq!(init.sub_jobs.len(), 3);
    let sizes: Vec<u64> = init.sub_jobs.iter().map(|h| h.expected_size).collect();
    assert_eq!(sizes, vec![5 * MIB, 5 * MIB, 2 * MIB]);
    // The ranges tile [0, total_size) exactly.
    let mut covered = 0u64;
    for handle in &init.sub_jobs {
        assert_eq!(handle.byte_range.start, covered);
        covered = handle.byte_range.end;
    }
    assert_eq!(covered, 12 * MIB);

    let rx = pipeline.hub.subscribe(parent_id).expect("stream should exist");

    // Upload out of order; completion events may arrive in any order.
    for index in [2u8, 0, 1] {
        let size = init.sub_jobs[index as usize].expected_size;
        pipeline
            .coordinator
            .accept_chunk_upload(parent_id, u32::from(index), chunk_bytes(index, size))
            .await
            .unwrap();
    }

    let events = drain_events(rx).await;
    let completes = events
        .iter()
        .filter(|e| event_type(e) == "chunk_complete")
        .count();
    assert_eq!(completes, 3);
    assert_eq!(
        event_type(events.last().unwrap()),
        "final",
        "the final event must close the stream"
    );

    let Some(StreamEvent::Final {
        final_transcript, ..
    }) = events.last()
    else {
        unreachable!()
    };
    assert_eq!(final_transcript, "alpha bravo charlie");

    let parent = pipeline.parents.get(parent_id).await.unwrap();
    assert_eq!(parent.status, ParentStatus::Done);
    assert_eq!(parent.final_transcript.as_deref(), Some("alpha bravo charlie"));
    let segments = parent.segments.unwrap();
    assert_eq!(segments.len(), 3);
    assert_eq!(segments[1].start, 2.0, "chunk segments are offset into file time");
    assert_eq!(segments[2].start, 4.0);
}

#[tokio::test(start_paused = true)]
async fn s2_tag_only_first_chunk_is_skipped() {
    let speech = StubSpeech::new(|audio, _| {
        if audio.starts_with(b"ID3") {
            Err(BackendError::new(Some(400), "no audio found"))
        } else {
            Ok(ok_transcription(audio))
        }
    });
    let pipeline = build_pipeline(speech.clone(), None);

    let init = pipeline
        .coordinator
        .initialize("tagged.mp3", 10 * MIB, Some(5), ProcessingOptions::default())
        .await
        .unwrap();
    let parent_id = init.parent_job_id;
    let rx = pipeline.hub.subscribe(parent_id).unwrap();

    // Chunk 0 is one giant ID3v2 tag (syncsafe size claiming the whole chunk).
    let mut tag = vec![b'I', b'D', b'3', 0x04, 0x00, 0x00, 0x7F, 0x7F, 0x7F, 0x7F];
    tag.resize(5 * MIB as usize, 0x00);
    pipeline
        .coordinator
        .accept_chunk_upload(parent_id, 0, tag)
        .await
        .unwrap();
    pipeline
        .coordinator
        .accept_chunk_upload(parent_id, 1, chunk_bytes(1, 5 * MIB))
        .await
        .unwrap();

    let events = drain_events(rx).await;
    assert!(
        events.iter().any(|e| event_type(e) == "chunk_skipped"),
        "chunk 0 must be skipped, not failed"
    );
    assert!(events.iter().all(|e| event_type(e) != "chunk_error"));
    assert_eq!(event_type(events.last().unwrap()), "final");

    assert!(
        speech.attempts_for(b'I') >= 5,
        "the skip rule requires at least five attempts, saw {}",
        speech.attempts_for(b'I')
    );

    let parent = pipeline.parents.get(parent_id).await.unwrap();
    assert_eq!(parent.status, ParentStatus::Done);
    assert_eq!(
        parent.final_transcript.as_deref(),
        Some("bravo"),
        "the skipped chunk is excluded from the transcript"
    );

    let subs = pipeline.sub_jobs.for_parent(&parent).await.unwrap();
    assert_eq!(subs[0].as_ref().unwrap().status, SubJobStatus::Skipped);
    assert_eq!(subs[1].as_ref().unwrap().status, SubJobStatus::Done);
}

#[tokio::test(start_paused = true)]
async fn s3_transient_rate_limit_is_retried_transparently() {
    let speech = StubSpeech::new(|audio, attempt| {
        if audio.first() == Some(&0) && attempt <= 2 {
            Err(BackendError::new(Some(429), "too many requests"))
        } else {
            Ok(ok_transcription(audio))
        }
    });
    let pipeline = build_pipeline(speech, None);

    let init = pipeline
        .coordinator
        .initialize("talk.mp3", 10 * MIB, Some(5), ProcessingOptions::default())
        .await
        .unwrap();
    let parent_id = init.parent_job_id;
    let rx = pipeline.hub.subscribe(parent_id).unwrap();

    for index in [0u8, 1] {
        pipeline
            .coordinator
            .accept_chunk_upload(parent_id, u32::from(index), chunk_bytes(index, 5 * MIB))
            .await
            .unwrap();
    }

    let events = drain_events(rx).await;
    assert!(
        events.iter().all(|e| event_type(e) != "chunk_error"),
        "retryable failures must stay hidden from the stream"
    );

    let parent = pipeline.parents.get(parent_id).await.unwrap();
    assert_eq!(parent.status, ParentStatus::Done);
    let subs = pipeline.sub_jobs.for_parent(&parent).await.unwrap();
    let chunk0 = subs[0].as_ref().unwrap();
    assert_eq!(chunk0.status, SubJobStatus::Done);
    assert!(chunk0.final_retry_count.unwrap() >= 2);
}

#[tokio::test(start_paused = true)]
async fn s4_auth_failure_surfaces_without_retries() {
    let speech = StubSpeech::new(|audio, _| {
        if audio.first() == Some(&1) {
            Err(BackendError::new(Some(401), "unauthorized"))
        } else {
            Ok(ok_transcription(audio))
        }
    });
    let speech_handle = speech.clone();
    let pipeline = build_pipeline(speech, None);

    let init = pipeline
        .coordinator
        .initialize("talk.mp3", 10 * MIB, Some(5), ProcessingOptions::default())
        .await
        .unwrap();
    let parent_id = init.parent_job_id;
    let rx = pipeline.hub.subscribe(parent_id).unwrap();

    for index in [0u8, 1] {
        pipeline
            .coordinator
            .accept_chunk_upload(parent_id, u32::from(index), chunk_bytes(index, 5 * MIB))
            .await
            .unwrap();
    }

    let events = drain_events(rx).await;
    let error_event = events
        .iter()
        .find(|e| event_type(e) == "chunk_error")
        .expect("the auth failure must surface");
    let StreamEvent::ChunkError {
        error_type,
        retry_count,
        chunk_index,
        ..
    } = error_event
    else {
        unreachable!()
    };
    assert_eq!(error_type, "auth_error");
    assert_eq!(*retry_count, 0, "auth errors get zero retries");
    assert_eq!(*chunk_index, 1);
    assert_eq!(speech_handle.attempts_for(1), 1);

    // A non-chunk-0 failure does not fail the parent when another chunk succeeded.
    let parent = pipeline.parents.get(parent_id).await.unwrap();
    assert_eq!(parent.status, ParentStatus::Done);
    assert_eq!(parent.final_transcript.as_deref(), Some("alpha"));
}

#[tokio::test(start_paused = true)]
async fn s5_undersized_files_are_rejected() {
    let speech = StubSpeech::new(|audio, _| Ok(ok_transcription(audio)));
    let pipeline = build_pipeline(speech, None);

    let err = pipeline
        .coordinator
        .initialize("tiny.mp3", 4 * MIB, Some(5), ProcessingOptions::default())
        .await
        .unwrap_err();
    assert!(
        err.to_string().contains("File too small for chunked upload"),
        "got: {err}"
    );
}

#[tokio::test(start_paused = true)]
async fn s6_linkage_is_atomic() {
    let speech = StubSpeech::new(|audio, _| Ok(ok_transcription(audio)));
    let pipeline = build_pipeline(speech, None);

    let init = pipeline
        .coordinator
        .initialize("talk.mp3", 20 * MIB, Some(5), ProcessingOptions::default())
        .await
        .unwrap();

    // One read of the parent record: the full list is present, no null slots.
    let parent = pipeline.parents.get(init.parent_job_id).await.unwrap();
    assert_eq!(parent.sub_job_ids.len(), 4);
    assert!(parent.sub_job_ids.iter().all(Option::is_some));
    assert!(parent.is_linked());

    // Every sub-job was visible under its id before the linkage.
    for handle in &init.sub_jobs {
        let sub = pipeline.sub_jobs.get(handle.sub_job_id).await.unwrap();
        assert_eq!(sub.parent_id, init.parent_job_id);
        assert_eq!(sub.status, SubJobStatus::Pending);
    }
}

#[tokio::test(start_paused = true)]
async fn per_chunk_llm_correction_is_applied() {
    let speech = StubSpeech::new(|audio, _| Ok(ok_transcription(audio)));
    let llm: Arc<dyn LlmBackend> = Arc::new(UppercaseLlm);
    let pipeline = build_pipeline(speech, Some(llm));

    let options = ProcessingOptions {
        use_llm: true,
        llm_mode: Some(LlmMode::PerChunk),
        ..Default::default()
    };
    let init = pipeline
        .coordinator
        .initialize("talk.mp3", 10 * MIB, Some(5), options)
        .await
        .unwrap();
    let parent_id = init.parent_job_id;
    let rx = pipeline.hub.subscribe(parent_id).unwrap();

    for index in [0u8, 1] {
        pipeline
            .coordinator
            .accept_chunk_upload(parent_id, u32::from(index), chunk_bytes(index, 5 * MIB))
            .await
            .unwrap();
    }

    let events = drain_events(rx).await;
    let complete = events
        .iter()
        .find(|e| matches!(e, StreamEvent::ChunkComplete { chunk_index: 0, .. }))
        .unwrap();
    let StreamEvent::ChunkComplete {
        corrected_text,
        llm_applied,
        ..
    } = complete
    else {
        unreachable!()
    };
    assert_eq!(corrected_text.as_deref(), Some("ALPHA"));
    assert!(llm_applied);

    let parent = pipeline.parents.get(parent_id).await.unwrap();
    assert_eq!(parent.final_transcript.as_deref(), Some("ALPHA BRAVO"));
}

#[tokio::test(start_paused = true)]
async fn post_mode_llm_corrects_the_assembled_transcript() {
    let speech = StubSpeech::new(|audio, _| Ok(ok_transcription(audio)));
    let llm: Arc<dyn LlmBackend> = Arc::new(UppercaseLlm);
    let pipeline = build_pipeline(speech, Some(llm));

    let options = ProcessingOptions {
        use_llm: true,
        llm_mode: Some(LlmMode::Post),
        ..Default::default()
    };
    let init = pipeline
        .coordinator
        .initialize("talk.mp3", 10 * MIB, Some(5), options)
        .await
        .unwrap();
    let parent_id = init.parent_job_id;
    let rx = pipeline.hub.subscribe(parent_id).unwrap();

    for index in [0u8, 1] {
        pipeline
            .coordinator
            .accept_chunk_upload(parent_id, u32::from(index), chunk_bytes(index, 5 * MIB))
            .await
            .unwrap();
    }

    let events = drain_events(rx).await;
    let Some(StreamEvent::Final {
        final_transcript, ..
    }) = events.last()
    else {
        panic!("missing final event")
    };
    assert_eq!(final_transcript, "ALPHA BRAVO");

    // Per-chunk texts stay raw in post mode.
    let parent = pipeline.parents.get(parent_id).await.unwrap();
    let subs = pipeline.sub_jobs.for_parent(&parent).await.unwrap();
    assert!(subs[0].as_ref().unwrap().corrected_text.is_none());
}

#[tokio::test(start_paused = true)]
async fn cancel_is_clean_and_idempotent() {
    let speech = StubSpeech::new(|audio, _| Ok(ok_transcription(audio)));
    let pipeline = build_pipeline(speech, None);

    let init = pipeline
        .coordinator
        .initialize("talk.mp3", 10 * MIB, Some(5), ProcessingOptions::default())
        .await
        .unwrap();
    let parent_id = init.parent_job_id;
    pipeline
        .coordinator
        .accept_chunk_upload(parent_id, 0, chunk_bytes(0, 5 * MIB))
        .await
        .unwrap();

    pipeline
        .coordinator
        .cancel(parent_id, Some("user abandoned"))
        .await
        .unwrap();

    let report = pipeline.coordinator.status(parent_id).await.unwrap();
    assert_eq!(report.status, ParentStatus::Cancelled);
    assert_eq!(report.health.missing_sub_jobs, report.total_chunks);
    assert_eq!(pipeline.blob.object_count(), 0, "chunk objects are deleted on cancel");

    // Re-cancel is a no-op.
    let again = pipeline.coordinator.cancel(parent_id, None).await.unwrap();
    assert_eq!(again.status, ParentStatus::Cancelled);
    assert_eq!(again.error_message.as_deref(), Some("user abandoned"));
}

#[tokio::test(start_paused = true)]
async fn manual_retry_recovers_a_failed_chunk() {
    // Chunk 1 fails terminally on the first pass (auth), then succeeds after retry.
    let speech = StubSpeech::new(|audio, attempt| {
        if audio.first() == Some(&1) && attempt == 1 {
            Err(BackendError::new(Some(401), "unauthorized"))
        } else {
            Ok(ok_transcription(audio))
        }
    });
    let pipeline = build_pipeline(speech, None);

    let init = pipeline
        .coordinator
        .initialize("talk.mp3", 10 * MIB, Some(5), ProcessingOptions::default())
        .await
        .unwrap();
    let parent_id = init.parent_job_id;
    let rx = pipeline.hub.subscribe(parent_id).unwrap();

    for index in [0u8, 1] {
        pipeline
            .coordinator
            .accept_chunk_upload(parent_id, u32::from(index), chunk_bytes(index, 5 * MIB))
            .await
            .unwrap();
    }
    drain_events(rx).await;

    let parent = pipeline.parents.get(parent_id).await.unwrap();
    let subs = pipeline.sub_jobs.for_parent(&parent).await.unwrap();
    let failed = subs[1].as_ref().unwrap();
    assert_eq!(failed.status, SubJobStatus::Failed);

    let outcome = pipeline.coordinator.retry(parent_id, 1).await.unwrap();
    assert_eq!(outcome.action, RetryKind::Processing);

    // The retried chunk's events land on a fresh stream. The retry task may already have
    // finished (and re-closed the channel) by the time we subscribe, so tolerate both.
    if let Some(rx) = pipeline.hub.subscribe(parent_id) {
        let events = drain_events(rx).await;
        assert_eq!(event_type(events.last().unwrap()), "final");
    }
    wait_for_status(&pipeline, parent_id, ParentStatus::Done).await;

    let parent = pipeline.parents.get(parent_id).await.unwrap();
    assert_eq!(parent.status, ParentStatus::Done);
    assert_eq!(parent.final_transcript.as_deref(), Some("alpha bravo"));
    let subs = pipeline.sub_jobs.for_parent(&parent).await.unwrap();
    let recovered = subs[1].as_ref().unwrap();
    assert_eq!(recovered.status, SubJobStatus::Done);
    assert!(recovered.error_message.is_none(), "retry clears error fields");
}

#[tokio::test(start_paused = true)]
async fn oversized_chunk_uploads_are_rejected() {
    let speech = StubSpeech::new(|audio, _| Ok(ok_transcription(audio)));
    let pipeline = build_pipeline(speech, None);

    let init = pipeline
        .coordinator
        .initialize("talk.mp3", 10 * MIB, Some(5), ProcessingOptions::default())
        .await
        .unwrap();

    // 25% over the declared range is outside the ±10% tolerance.
    let err = pipeline
        .coordinator
        .accept_chunk_upload(init.parent_job_id, 0, chunk_bytes(0, 5 * MIB + MIB + MIB / 4))
        .await
        .unwrap_err();
    assert!(err.to_string().contains("size mismatch"), "got: {err}");
}

#[tokio::test(start_paused = true)]
async fn status_recomputes_counters_from_sub_jobs() {
    let speech = StubSpeech::new(|audio, _| Ok(ok_transcription(audio)));
    let pipeline = build_pipeline(speech, None);

    let init = pipeline
        .coordinator
        .initialize("talk.mp3", 15 * MIB, Some(5), ProcessingOptions::default())
        .await
        .unwrap();
    let parent_id = init.parent_job_id;
    let rx = pipeline.hub.subscribe(parent_id).unwrap();

    // Upload only two of three chunks.
    for index in [0u8, 1] {
        pipeline
            .coordinator
            .accept_chunk_upload(parent_id, u32::from(index), chunk_bytes(index, 5 * MIB))
            .await
            .unwrap();
    }
    drop(rx);

    // Wait until both uploaded chunks are done.
    for iteration in 0.. {
        assert!(iteration < 10_000, "uploaded chunks never finished processing");
        let report = pipeline.coordinator.status(parent_id).await.unwrap();
        if report.completed_chunks == 2 {
            assert_eq!(report.uploaded_chunks, 2);
            assert!(report.health.sub_jobs_linked);
            assert_eq!(report.health.missing_sub_jobs, 0);
            assert!(report.health.counters_consistent);
            let pending = &report.chunks[2];
            assert_eq!(pending.retry_recommendation, Some(RetryKind::Upload));
            assert_eq!(report.status, ParentStatus::Processing, "job is still in flight");
            break;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
}

/// Poll the parent until it reaches `expected`, bounded so a hang fails loudly.
async fn wait_for_status(pipeline: &Pipeline, parent_id: Uuid, expected: ParentStatus) {
    for iteration in 0.. {
        assert!(iteration < 10_000, "parent never reached {expected:?}");
        let parent = pipeline.parents.get(parent_id).await.unwrap();
        if parent.status == expected {
            return;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
}
