//! Bounded-concurrency gates for the four classes of pipeline work.
//!
//! Each gate is a token-bounded semaphore with FIFO admission. Callers wrap their async
//! operation in [`RateLimiter::run`]; acquisition is cancel-safe (a caller dropped while
//! waiting releases its queue slot), and timeouts are the caller's responsibility.

use std::future::Future;
use std::sync::atomic::{AtomicUsize, Ordering};

use serde::Serialize;
use tokio::sync::Semaphore;

/// The four operation classes admitted through the limiter.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GateKind {
    Transcription,
    Llm,
    JobSpawn,
    ChunkProcessing,
}

/// Permit counts per gate.
#[derive(Debug, Clone, Copy)]
pub struct GateLimits {
    pub transcription: usize,
    pub llm: usize,
    pub job_spawn: usize,
    pub chunk_processing: usize,
}

impl Default for GateLimits {
    fn default() -> Self {
        Self {
            transcription: 8,
            llm: 4,
            job_spawn: 8,
            chunk_processing: 4,
        }
    }
}

/// Point-in-time view of one gate, for operational endpoints.
#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq)]
pub struct GateSnapshot {
    pub in_flight: usize,
    pub waiting: usize,
}

/// Snapshot of all four gates.
#[derive(Debug, Clone, Copy, Serialize)]
pub struct LimiterSnapshot {
    pub transcription: GateSnapshot,
    pub llm: GateSnapshot,
    pub job_spawn: GateSnapshot,
    pub chunk_processing: GateSnapshot,
}

/// Decrements a counter on drop, so waiting/in-flight counts stay right even when the
/// surrounding future is cancelled mid-await.
struct CountGuard<'a>(&'a AtomicUsize);

impl<'a> CountGuard<'a> {
    fn enter(counter: &'a AtomicUsize) -> Self {
        counter.fetch_add(1, Ordering::SeqCst);
        Self(counter)
    }
}

impl Drop for CountGuard<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

struct Gate {
    semaphore: Semaphore,
    in_flight: AtomicUsize,
    waiting: AtomicUsize,
}

impl Gate {
    fn new(permits: usize) -> Self {
        Self {
            semaphore: Semaphore::new(permits.max(1)),
            in_flight: AtomicUsize::new(0),
            waiting: AtomicUsize::new(0),
        }
    }

    async fn run<F, T>(&self, op: F) -> T
    where
        F: Future<Output = T>,
    {
        let queued = CountGuard::enter(&self.waiting);
        let _permit = self
            .semaphore
            .acquire()
            .await
            .expect("gate semaphore is never closed");
        drop(queued);

        let _running = CountGuard::enter(&self.in_flight);
        op.await
    }

    fn snapshot(&self) -> GateSnapshot {
        GateSnapshot {
            in_flight: self.in_flight.load(Ordering::SeqCst),
            waiting: self.waiting.load(Ordering::SeqCst),
        }
    }
}

/// Four independent gates; see [`GateKind`].
pub struct RateLimiter {
    transcription: Gate,
    llm: Gate,
    job_spawn: Gate,
    chunk_processing: Gate,
}

impl RateLimiter {
    pub fn new(limits: GateLimits) -> Self {
        Self {
            transcription: Gate::new(limits.transcription),
            llm: Gate::new(limits.llm),
            job_spawn: Gate::new(limits.job_spawn),
            chunk_processing: Gate::new(limits.chunk_processing),
        }
    }

    fn gate(&self, kind: GateKind) -> &Gate {
        match kind {
            GateKind::Transcription => &self.transcription,
            GateKind::Llm => &self.llm,
            GateKind::JobSpawn => &self.job_spawn,
            GateKind::ChunkProcessing => &self.chunk_processing,
        }
    }

    /// Run `op` once a permit for `kind` is available. Admission is FIFO per gate.
    pub async fn run<F, T>(&self, kind: GateKind, op: F) -> T
    where
        F: Future<Output = T>,
    {
        self.gate(kind).run(op).await
    }

    pub fn snapshot(&self) -> LimiterSnapshot {
        LimiterSnapshot {
            transcription: self.transcription.snapshot(),
            llm: self.llm.snapshot(),
            job_spawn: self.job_spawn.snapshot(),
            chunk_processing: self.chunk_processing.snapshot(),
        }
    }
}

impl Default for RateLimiter {
    fn default() -> Self {
        Self::new(GateLimits::default())
    }
}
