//! Byte-range decomposition and per-chunk state.
//!
//! [`ChunkPlan::build`] is a pure function from `(size, chunk_size)` to a
//! dense partition of `[0, size-1]`. [`Chunk`] is the mutable unit a
//! [`crate::worker::ChunkWorker`] drives from pending to completed; its
//! fields are guarded by a single lock per chunk (held only for the field
//! access itself, never across a blocking call).

use std::sync::{Arc, Mutex};

use tokio_util::sync::CancellationToken as TokioCancellationToken;

/// Minimum chunk size: 5 MiB.
pub const MIN_CHUNK_SIZE: u64 = 5 * 1024 * 1024;
/// Maximum chunk size: 50 MiB.
pub const MAX_CHUNK_SIZE: u64 = 50 * 1024 * 1024;
/// Default chunk size when history is unknown or throughput is "medium": 30 MiB.
pub const DEFAULT_CHUNK_SIZE: u64 = 30 * 1024 * 1024;

/// Tolerance for treating a chunk as complete despite trailing padding, per
/// the engine's resolved `IsComplete` tolerance (ε = 32 bytes, not 1024).
pub const COMPLETE_EPSILON: u64 = 32;

/// Upper bound on concurrently running workers within one download.
pub const MAX_CONCURRENT_CHUNKS: usize = 8;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChunkStatus {
    Pending,
    Active,
    Paused,
    Completed,
    Failed,
}

/// A first-class cancellation signal owned by a [`Chunk`].
///
/// Wraps [`tokio_util::sync::CancellationToken`] behind the
/// trigger/poll/reset vocabulary the engine's design calls for, so call
/// sites never reach for the underlying cancel/child-token API directly.
#[derive(Debug, Clone)]
pub struct CancellationToken(TokioCancellationToken);

impl CancellationToken {
    pub fn new() -> Self {
        Self(TokioCancellationToken::new())
    }

    /// Fires the signal. Idempotent.
    pub fn trigger(&self) {
        self.0.cancel();
    }

    /// Returns whether the signal has fired.
    pub fn poll(&self) -> bool {
        self.0.is_cancelled()
    }

    /// Replaces this token's internal state with a fresh, un-fired signal.
    /// Used on resume, where workers must observe a clean signal rather
    /// than the one that paused them.
    pub fn reset(&mut self) {
        self.0 = TokioCancellationToken::new();
    }

    /// Resolves once [`Self::trigger`] has been called.
    pub async fn cancelled(&self) {
        self.0.cancelled().await;
    }
}

impl Default for CancellationToken {
    fn default() -> Self {
        Self::new()
    }
}

/// One contiguous byte range of the file, plus its live download state.
#[derive(Debug, Clone)]
pub struct Chunk {
    pub id: u32,
    pub start: u64,
    pub end: u64,
    inner: Arc<Mutex<ChunkInner>>,
}

#[derive(Debug)]
struct ChunkInner {
    progress: u64,
    status: ChunkStatus,
    error: Option<String>,
    cancel: CancellationToken,
}

impl Chunk {
    fn new(id: u32, start: u64, end: u64) -> Self {
        Self {
            id,
            start,
            end,
            inner: Arc::new(Mutex::new(ChunkInner {
                progress: 0,
                status: ChunkStatus::Pending,
                error: None,
                cancel: CancellationToken::new(),
            })),
        }
    }

    /// Length of this chunk's byte range, inclusive.
    pub fn len(&self) -> u64 {
        self.end - self.start + 1
    }

    pub fn progress(&self) -> u64 {
        self.inner.lock().unwrap().progress
    }

    pub fn status(&self) -> ChunkStatus {
        self.inner.lock().unwrap().status
    }

    pub fn error(&self) -> Option<String> {
        self.inner.lock().unwrap().error.clone()
    }

    pub fn set_progress(&self, progress: u64) {
        self.inner.lock().unwrap().progress = progress;
    }

    pub fn set_status(&self, status: ChunkStatus) {
        self.inner.lock().unwrap().status = status;
    }

    pub fn set_error(&self, error: impl Into<String>) {
        self.inner.lock().unwrap().error = Some(error.into());
    }

    /// Marks the chunk completed, forcing `progress` to exactly `len()` per
    /// the end-of-body completion rule (trailing padding within ε is
    /// discarded from the recorded progress).
    pub fn mark_completed(&self) {
        let mut inner = self.inner.lock().unwrap();
        inner.progress = self.len();
        inner.status = ChunkStatus::Completed;
        inner.error = None;
    }

    pub fn is_complete(&self) -> bool {
        self.status() == ChunkStatus::Completed
    }

    /// True once remaining bytes fall within [`COMPLETE_EPSILON`], used by
    /// the aggregate-progress tie-break rule to count a near-finished
    /// active chunk as fully contributed.
    pub fn is_within_epsilon(&self) -> bool {
        self.len().saturating_sub(self.progress()) <= COMPLETE_EPSILON
    }

    pub fn cancel_token(&self) -> CancellationToken {
        self.inner.lock().unwrap().cancel.clone()
    }

    /// Replaces this chunk's cancellation signal with a fresh one and
    /// resets its status to pending, for a resume restart.
    pub fn reset_for_resume(&self) {
        let mut inner = self.inner.lock().unwrap();
        if inner.status != ChunkStatus::Completed {
            inner.status = ChunkStatus::Pending;
            inner.cancel.reset();
            inner.error = None;
        }
    }
}

/// Pure byte-range decomposition of a file into [`Chunk`]s.
pub struct ChunkPlan;

impl ChunkPlan {
    /// Splits `size` bytes into chunks of `chunk_size`, with the last chunk
    /// absorbing the remainder. `size <= chunk_size` yields a single chunk
    /// covering the whole file. `chunk_size` is clamped to
    /// `[MIN_CHUNK_SIZE, MAX_CHUNK_SIZE]` before use.
    ///
    /// # Panics
    ///
    /// Never called with `size == 0`; the Coordinator rejects that at
    /// preflight per the engine's boundary contract.
    pub fn build(size: u64, chunk_size: u64) -> Vec<Chunk> {
        let chunk_size = chunk_size.clamp(MIN_CHUNK_SIZE, MAX_CHUNK_SIZE);

        if size <= chunk_size {
            return vec![Chunk::new(0, 0, size - 1)];
        }

        let mut chunks = Vec::new();
        let mut start = 0u64;
        let mut id = 0u32;

        while start < size {
            let end = (start + chunk_size - 1).min(size - 1);
            chunks.push(Chunk::new(id, start, end));
            start = end + 1;
            id += 1;
        }

        chunks
    }
}

/// Exponentially-tracked average throughput per URL, driving the adaptive
/// chunk-size policy (spec §4.2 / §9: keyed by speed, not byte count).
#[derive(Debug, Default)]
pub struct AdaptiveSizer {
    history: std::collections::HashMap<String, f64>,
}

/// Tunable thresholds for [`AdaptiveSizer::chunk_size_for`].
#[derive(Debug, Clone, Copy)]
pub struct AdaptiveThresholds {
    /// Bytes/sec at or above which [`MAX_CHUNK_SIZE`] is used.
    pub fast_bps: f64,
    /// Bytes/sec at or above which [`DEFAULT_CHUNK_SIZE`] is used.
    pub medium_bps: f64,
    /// Smoothing factor for the exponential average, in `(0, 1]`.
    pub smoothing: f64,
}

impl Default for AdaptiveThresholds {
    fn default() -> Self {
        Self {
            fast_bps: 10.0 * 1024.0 * 1024.0,
            medium_bps: 2.0 * 1024.0 * 1024.0,
            smoothing: 0.3,
        }
    }
}

impl AdaptiveSizer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Picks a chunk size for `url` from its tracked average throughput.
    /// Unknown history falls back to [`DEFAULT_CHUNK_SIZE`].
    pub fn chunk_size_for(&self, url: &str, thresholds: &AdaptiveThresholds) -> u64 {
        match self.history.get(url) {
            Some(&bps) if bps >= thresholds.fast_bps => MAX_CHUNK_SIZE,
            Some(&bps) if bps >= thresholds.medium_bps => DEFAULT_CHUNK_SIZE,
            Some(_) => MIN_CHUNK_SIZE,
            None => DEFAULT_CHUNK_SIZE,
        }
    }

    /// Folds a newly observed average throughput (bytes/sec over the whole
    /// download) into `url`'s tracked history.
    pub fn record(&mut self, url: &str, observed_bps: f64, thresholds: &AdaptiveThresholds) {
        let entry = self.history.entry(url.to_string()).or_insert(observed_bps);
        *entry = thresholds.smoothing * observed_bps + (1.0 - thresholds.smoothing) * *entry;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn single_chunk_when_size_le_chunk_size() {
        let chunks = ChunkPlan::build(1000, MIN_CHUNK_SIZE);
        assert_eq!(chunks.len(), 1);
        assert_eq!(chunks[0].start, 0);
        assert_eq!(chunks[0].end, 999);
    }

    #[test]
    fn last_chunk_absorbs_remainder() {
        let chunks = ChunkPlan::build(100, 30);
        assert_eq!(chunks.len(), 4);
        assert_eq!(chunks[0].start, 0);
        assert_eq!(chunks[0].end, 29);
        assert_eq!(chunks[3].start, 90);
        assert_eq!(chunks[3].end, 99);
    }

    #[test]
    fn chunks_partition_with_no_gaps_or_overlap() {
        let chunks = ChunkPlan::build(100 * 1024 * 1024, DEFAULT_CHUNK_SIZE);
        assert_eq!(chunks.len(), 4);
        let mut expect_start = 0u64;
        for c in &chunks {
            assert_eq!(c.start, expect_start);
            expect_start = c.end + 1;
        }
        assert_eq!(expect_start, 100 * 1024 * 1024);
    }

    #[test]
    fn chunk_size_clamped_to_bounds() {
        let chunks = ChunkPlan::build(1000, 1); // way below MIN
        // clamped to MIN, and 1000 < MIN so single chunk
        assert_eq!(chunks.len(), 1);

        let chunks = ChunkPlan::build(200 * 1024 * 1024, u64::MAX); // way above MAX
        let expected = (200 * 1024 * 1024 + MAX_CHUNK_SIZE - 1) / MAX_CHUNK_SIZE;
        assert_eq!(chunks.len() as u64, expected);
    }

    #[test]
    fn size_below_min_chunk_is_one_chunk() {
        let chunks = ChunkPlan::build(1024, MIN_CHUNK_SIZE);
        assert_eq!(chunks.len(), 1);
    }

    #[test]
    fn completed_chunk_progress_equals_length() {
        let chunks = ChunkPlan::build(1000, MIN_CHUNK_SIZE);
        chunks[0].mark_completed();
        assert_eq!(chunks[0].progress(), chunks[0].len());
        assert!(chunks[0].is_complete());
    }

    #[test]
    fn is_within_epsilon_respects_32_byte_tolerance() {
        let chunks = ChunkPlan::build(1000, MIN_CHUNK_SIZE);
        chunks[0].set_progress(1000 - 32);
        assert!(chunks[0].is_within_epsilon());
        chunks[0].set_progress(1000 - 33);
        assert!(!chunks[0].is_within_epsilon());
    }

    #[test]
    fn reset_for_resume_skips_completed_chunks() {
        let chunks = ChunkPlan::build(1000, MIN_CHUNK_SIZE);
        chunks[0].mark_completed();
        chunks[0].reset_for_resume();
        assert_eq!(chunks[0].status(), ChunkStatus::Completed);
    }

    #[test]
    fn reset_for_resume_repends_incomplete_chunks() {
        let chunks = ChunkPlan::build(1000, MIN_CHUNK_SIZE);
        chunks[0].set_status(ChunkStatus::Paused);
        chunks[0].reset_for_resume();
        assert_eq!(chunks[0].status(), ChunkStatus::Pending);
    }

    #[tokio::test]
    async fn cancellation_token_trigger_and_reset() {
        let mut token = CancellationToken::new();
        assert!(!token.poll());
        token.trigger();
        assert!(token.poll());
        token.cancelled().await; // resolves immediately once triggered

        token.reset();
        assert!(!token.poll());
    }

    #[test]
    fn adaptive_sizer_unknown_history_uses_default() {
        let sizer = AdaptiveSizer::new();
        let thresholds = AdaptiveThresholds::default();
        assert_eq!(sizer.chunk_size_for("http://x", &thresholds), DEFAULT_CHUNK_SIZE);
    }

    #[test]
    fn adaptive_sizer_fast_history_uses_max() {
        let mut sizer = AdaptiveSizer::new();
        let thresholds = AdaptiveThresholds::default();
        sizer.record("http://x", thresholds.fast_bps * 2.0, &thresholds);
        assert_eq!(sizer.chunk_size_for("http://x", &thresholds), MAX_CHUNK_SIZE);
    }

    #[test]
    fn adaptive_sizer_slow_history_uses_min() {
        let mut sizer = AdaptiveSizer::new();
        let thresholds = AdaptiveThresholds::default();
        sizer.record("http://x", 100.0, &thresholds);
        assert_eq!(sizer.chunk_size_for("http://x", &thresholds), MIN_CHUNK_SIZE);
    }
}
