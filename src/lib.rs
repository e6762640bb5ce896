//! `longhand` — a chunked streaming transcription pipeline.
//!
//! Large audio files are split into independently decodable byte-range chunks, uploaded
//! chunk by chunk, and transcribed in parallel against an external speech-to-text API,
//! with per-chunk and aggregate results streamed to the client as server-sent events.
//!
//! This crate provides:
//! - Parent/sub-job records and their state machines over a key-value store
//! - A boundary-aware audio chunker (WAV, MP3, naive fallback)
//! - The per-chunk processing engine with retry, fallback, and skip policies
//! - A four-gate rate limiter and a per-job event stream
//! - The upload coordinator and final-transcript assembler
//!
//! The library is designed to be driven by a long-running HTTP server (see the
//! `longhand-server` binary) but stays independent of it: stores, backends, and queues
//! are injected through traits, so tests and other frontends wire their own.

// Crate-wide error type.
pub mod error;

// Job records, options, and error classification.
pub mod classify;
pub mod job;
pub mod opts;

// Store contracts and the stores built on them.
pub mod blob;
pub mod job_store;
pub mod kv;

// Boundary-aware audio chunking.
pub mod chunker;

// External API seams and their HTTP implementations.
pub mod backend;
pub mod backends;

// The pipeline itself.
pub mod assembler;
pub mod coordinator;
pub mod events;
pub mod limiter;
pub mod processor;

// Logging configuration.
pub mod logging;

pub use error::{Error, Result};
pub use logging::init as init_logging;
