//! Multi-connection HTTP download engine: chunked, resumable, checksummed.
//!
//! An embedder (the `api` crate's WebSocket server, or a test harness)
//! builds a [`Registry`], wraps its own socket or in-process channel in a
//! [`Transport`], and feeds inbound [`Command`]s to
//! [`Registry::dispatch`]. Everything downstream — preflight, chunk
//! planning, worker retries, pause/resume/cancel, merge, and SHA-256 — is
//! this crate's concern.

mod chunk;
mod client;
mod config;
mod coordinator;
mod error;
mod hash;
mod progress;
mod registry;
mod transport;
mod worker;

pub use chunk::{AdaptiveThresholds, Chunk, ChunkPlan, ChunkStatus, CancellationToken};
pub use client::{build_client, filename_from_url, preflight, PreflightInfo};
pub use config::{EngineConfig, FinalizationPacing};
pub use coordinator::Coordinator;
pub use error::{ChunkError, EngineError};
pub use hash::sha256_file;
pub use progress::{aggregate_downloaded, capped_aggregate};
pub use registry::{LightState, Registry};
pub use transport::{
    ChunkStatusWire, ChunkWire, Command, Event, InProcessTransport, ProgressStatus, Transport,
};
