//! Engine-wide tunables.
//!
//! The engine has no persistent settings store (an explicit non-goal), so
//! there is no config-file format here: an embedding process (the `api`
//! crate, or a test harness) constructs an [`EngineConfig`] and passes it
//! to a [`crate::registry::Registry`].

use std::time::Duration;

use crate::chunk::AdaptiveThresholds;

/// Controls the short sleeps between finalization events that exist only
/// for client UI cadence (spec §9: "sleeps used as ordering primitives"
/// are replaced by explicit emit-then-flush; these remain as a pacing
/// knob, not an ordering mechanism).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FinalizationPacing {
    /// No pauses between finalization events.
    Off,
    /// ~300 ms, suited to a human watching a progress bar.
    UiFriendly,
    /// ~1 s, suited to visually inspecting finalization while debugging.
    Debug,
}

impl FinalizationPacing {
    pub fn delay(self) -> Duration {
        match self {
            FinalizationPacing::Off => Duration::ZERO,
            FinalizationPacing::UiFriendly => Duration::from_millis(300),
            FinalizationPacing::Debug => Duration::from_secs(1),
        }
    }
}

#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub max_concurrent_chunks: usize,
    pub max_retries_per_chunk: u32,
    pub stall_timeout: Duration,
    pub request_timeout: Duration,
    pub preflight_timeout: Duration,
    pub tls_handshake_timeout: Duration,
    pub progress_report_interval: Duration,
    pub read_buffer_size: usize,
    pub hash_buffer_size: usize,
    pub max_connections_per_host: usize,
    pub adaptive_thresholds: AdaptiveThresholds,
    pub finalization_pacing: FinalizationPacing,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_concurrent_chunks: crate::chunk::MAX_CONCURRENT_CHUNKS,
            max_retries_per_chunk: 5,
            stall_timeout: Duration::from_secs(60),
            request_timeout: Duration::from_secs(30),
            preflight_timeout: Duration::from_secs(30),
            tls_handshake_timeout: Duration::from_secs(10),
            progress_report_interval: Duration::from_millis(100),
            read_buffer_size: 512 * 1024,
            hash_buffer_size: 8 * 1024 * 1024,
            max_connections_per_host: 20,
            adaptive_thresholds: AdaptiveThresholds::default(),
            finalization_pacing: FinalizationPacing::UiFriendly,
        }
    }
}
