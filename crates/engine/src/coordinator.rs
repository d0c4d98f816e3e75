//! Single download lifecycle: preflight, plan, run workers, pause/resume,
//! cancel, and the nine-step finalization sequence.
//!
//! Grounded on the teacher's `ChunkedDownloader::download`/
//! `download_resumable` (`examples/Fluxaus-FluxDM/crates/engine/src/chunked.rs`),
//! restructured from one-shot `tokio::spawn` + join into a persistent,
//! signal-driven task: a [`Coordinator`] is a thin handle around an
//! `mpsc` control channel, and the task it owns a clone of itself for
//! (`run`) carries the actual state machine. The [`crate::registry::Registry`]
//! stores only a `Weak` reference; the task is the coordinator's sole
//! strong owner until finalization (or cancel) drops it.

use std::sync::Arc;
use std::time::Instant;

use tokio::sync::{mpsc, Semaphore};
use tokio::task::JoinSet;

use crate::chunk::{Chunk, ChunkPlan, ChunkStatus};
use crate::client;
use crate::config::EngineConfig;
use crate::hash;
use crate::progress::capped_aggregate;
use crate::registry::Registry;
use crate::transport::{ChunkWire, Event, ProgressStatus, Transport};
use crate::worker::{self, WorkerContext};
use storage::TempLayout;

enum ControlSignal {
    Pause,
    Resume,
    Cancel,
}

/// A handle to one running download. Cheap to clone, routes commands into
/// the task that actually owns the download's state.
pub struct Coordinator {
    url: String,
    control_tx: mpsc::UnboundedSender<ControlSignal>,
}

impl Coordinator {
    pub fn url(&self) -> &str {
        &self.url
    }

    pub fn pause(&self) {
        let _ = self.control_tx.send(ControlSignal::Pause);
    }

    pub fn resume(&self) {
        let _ = self.control_tx.send(ControlSignal::Resume);
    }

    pub fn cancel(&self) {
        let _ = self.control_tx.send(ControlSignal::Cancel);
    }

    /// Spawns the task driving `url` end-to-end and returns a handle for
    /// routing control commands. The returned `Arc` may be dropped by the
    /// caller immediately: the spawned task keeps its own clone alive for
    /// as long as the download is live.
    pub fn spawn(
        url: String,
        registry: Arc<Registry>,
        transport: Arc<dyn Transport>,
        client: reqwest::Client,
        config: Arc<EngineConfig>,
    ) -> Arc<Coordinator> {
        let (control_tx, control_rx) = mpsc::unbounded_channel();
        let coordinator = Arc::new(Coordinator { url: url.clone(), control_tx });
        let owned = coordinator.clone();

        tokio::spawn(async move {
            run(url, registry, transport, client, config, control_rx, owned).await;
        });

        coordinator
    }
}

async fn run(
    url: String,
    registry: Arc<Registry>,
    transport: Arc<dyn Transport>,
    client: reqwest::Client,
    config: Arc<EngineConfig>,
    mut control_rx: mpsc::UnboundedReceiver<ControlSignal>,
    coordinator: Arc<Coordinator>,
) {
    let preflight = match client::preflight(&client, &url, config.preflight_timeout).await {
        Ok(p) => p,
        Err(e) => {
            transport.send(Event::Error { url: Some(url.clone()), message: e.to_string() }).await;
            return;
        }
    };

    transport
        .send(Event::Log {
            url: Some(url.clone()),
            message: format!(
                "size={} filename={} accept_ranges={}",
                preflight.size, preflight.filename, preflight.accepts_ranges
            ),
        })
        .await;

    let chunk_size = registry.chunk_size_for(&url);
    let chunks = ChunkPlan::build(preflight.size, chunk_size);
    let layout = TempLayout::new(&platform::temp_root(), &preflight.filename);

    if let Err(e) = layout.ensure().await {
        transport.send(Event::Error { url: Some(url.clone()), message: e.to_string() }).await;
        return;
    }

    for chunk in &chunks {
        transport.send(Event::ChunkInit { url: url.clone(), chunk: ChunkWire::pending(chunk) }).await;
    }

    if let Err(e) = registry.try_insert(&url, Arc::downgrade(&coordinator)) {
        transport.send(Event::Error { url: Some(url.clone()), message: e.to_string() }).await;
        let _ = layout.remove().await;
        return;
    }

    let chunks = Arc::new(chunks);
    let semaphore = Arc::new(Semaphore::new(config.max_concurrent_chunks));
    let started_at = Instant::now();
    let mut paused = false;

    'outer: loop {
        let worker_ctx = Arc::new(WorkerContext {
            url: url.clone(),
            client: client.clone(),
            config: config.clone(),
            transport: transport.clone(),
            layout: layout.clone(),
            total_size: preflight.size,
            all_chunks: chunks.clone(),
        });

        let mut join_set = JoinSet::new();
        for chunk in chunks.iter().filter(|c| !c.is_complete()) {
            let worker_ctx = worker_ctx.clone();
            let chunk = chunk.clone();
            let semaphore = semaphore.clone();
            join_set.spawn(async move {
                let _permit = semaphore.acquire_owned().await.expect("semaphore is never closed");
                worker::run(&worker_ctx, &chunk).await;
            });
        }

        let mut cancel_requested = false;

        while !join_set.is_empty() {
            tokio::select! {
                _ = join_set.join_next() => {}
                signal = control_rx.recv() => {
                    match signal {
                        Some(ControlSignal::Pause) => {
                            paused = true;
                            for chunk in chunks.iter() {
                                chunk.cancel_token().trigger();
                            }
                        }
                        Some(ControlSignal::Cancel) | None => {
                            cancel_requested = true;
                            for chunk in chunks.iter() {
                                chunk.cancel_token().trigger();
                            }
                        }
                        Some(ControlSignal::Resume) => {
                            // No pause is in effect yet; nothing to resume
                            // while workers are still actively running.
                        }
                    }
                }
            }
        }

        if cancel_requested {
            registry.remove(&url);
            let _ = layout.remove().await;
            transport.send(Event::Log { url: Some(url.clone()), message: "download cancelled".into() }).await;
            transport
                .send(Event::CancelConfirmed { url: url.clone(), message: "download cancelled".into() })
                .await;
            return;
        }

        if paused {
            emit_pause_confirmation(&transport, &url, &chunks, preflight.size).await;
            registry.set_paused(&url, true);

            loop {
                match control_rx.recv().await {
                    Some(ControlSignal::Resume) => {
                        registry.set_paused(&url, false);
                        transport
                            .send(Event::ResumeConfirmed { url: url.clone(), message: "download resumed".into() })
                            .await;
                        for chunk in chunks.iter() {
                            chunk.reset_for_resume();
                        }
                        paused = false;
                        continue 'outer;
                    }
                    Some(ControlSignal::Cancel) | None => {
                        registry.remove(&url);
                        let _ = layout.remove().await;
                        transport.send(Event::Log { url: Some(url.clone()), message: "download cancelled".into() }).await;
                        transport
                            .send(Event::CancelConfirmed { url: url.clone(), message: "download cancelled".into() })
                            .await;
                        return;
                    }
                    Some(ControlSignal::Pause) => {
                        // Pause is idempotent: resend the same confirmations.
                        emit_pause_confirmation(&transport, &url, &chunks, preflight.size).await;
                    }
                }
            }
        }

        // Not paused, not cancelled: every worker reached a terminal state.
        break;
    }

    finalize(
        &url,
        &transport,
        &config,
        &registry,
        &chunks,
        preflight.size,
        &preflight.filename,
        &layout,
        started_at,
    )
    .await;
}

async fn emit_pause_confirmation(transport: &Arc<dyn Transport>, url: &str, chunks: &[Chunk], total_size: u64) {
    transport
        .send(Event::PauseConfirmed { url: url.to_string(), message: "download paused".into() })
        .await;
    transport
        .send(Event::Progress {
            url: url.to_string(),
            bytes_received: capped_aggregate(chunks, total_size),
            total_bytes: total_size,
            speed: 0.0,
            status: ProgressStatus::Paused,
        })
        .await;
    for chunk in chunks.iter() {
        if chunk.status() == ChunkStatus::Paused {
            transport
                .send(Event::ChunkProgress { url: url.to_string(), chunk: ChunkWire::snapshot(chunk, Some(0.0)) })
                .await;
        }
    }
}

/// The nine-step finalization sequence: completeness check, paced
/// 99.9%/100% progress events, merge, completion log, SHA-256, and
/// Registry/temp-directory cleanup.
#[allow(clippy::too_many_arguments)]
async fn finalize(
    url: &str,
    transport: &Arc<dyn Transport>,
    config: &EngineConfig,
    registry: &Registry,
    chunks: &[Chunk],
    size: u64,
    filename: &str,
    layout: &TempLayout,
    started_at: Instant,
) {
    let incomplete: Vec<u32> = chunks.iter().filter(|c| !c.is_complete()).map(|c| c.id).collect();
    if !incomplete.is_empty() {
        transport
            .send(Event::Error {
                url: Some(url.to_string()),
                message: format!("incomplete chunks: {incomplete:?}"),
            })
            .await;
        return;
    }

    let elapsed = started_at.elapsed().as_secs_f64();
    if elapsed > 0.0 {
        registry.record_throughput(url, size as f64 / elapsed);
    }

    let pacing = config.finalization_pacing.delay();

    transport
        .send(Event::Progress {
            url: url.to_string(),
            bytes_received: size.saturating_sub(1),
            total_bytes: size,
            speed: 0.0,
            status: ProgressStatus::Downloading,
        })
        .await;
    transport.send(Event::Log { url: Some(url.to_string()), message: "\u{1F4E5} 99.9%".into() }).await;
    if !pacing.is_zero() {
        tokio::time::sleep(pacing).await;
    }

    transport
        .send(Event::Progress {
            url: url.to_string(),
            bytes_received: size,
            total_bytes: size,
            speed: 0.0,
            status: ProgressStatus::Completed,
        })
        .await;
    transport.send(Event::Log { url: Some(url.to_string()), message: "\u{1F4E5} 100.0%".into() }).await;
    if !pacing.is_zero() {
        tokio::time::sleep(pacing).await;
    }

    transport
        .send(Event::Log { url: Some(url.to_string()), message: "\u{1F504} Merging chunks...".into() })
        .await;

    let destination = match platform::downloads_dir() {
        Ok(dir) => dir.join(filename),
        Err(e) => {
            transport.send(Event::Error { url: Some(url.to_string()), message: e.to_string() }).await;
            return;
        }
    };

    if let Err(e) = storage::merge_chunks(layout, chunks.len() as u32, &destination, size).await {
        transport.send(Event::Error { url: Some(url.to_string()), message: e.to_string() }).await;
        return;
    }

    transport
        .send(Event::Log {
            url: Some(url.to_string()),
            message: "\u{2705} Download completed successfully".into(),
        })
        .await;
    if !pacing.is_zero() {
        tokio::time::sleep(pacing).await;
    }

    transport
        .send(Event::Log { url: Some(url.to_string()), message: "\u{1F510} Starting SHA-256...".into() })
        .await;
    let hash_started = Instant::now();
    match hash::sha256_file(&destination, config.hash_buffer_size).await {
        Ok(checksum) => {
            transport
                .send(Event::ChecksumResult {
                    url: url.to_string(),
                    filename: filename.to_string(),
                    checksum,
                    duration: hash_started.elapsed().as_millis() as u64,
                })
                .await;
        }
        Err(e) => {
            transport
                .send(Event::Error { url: Some(url.to_string()), message: format!("checksum failed: {e}") })
                .await;
        }
    }

    registry.remove(url);

    if let Err(e) = layout.remove().await {
        tracing::warn!(url, error = %e, "failed to remove temp directory after finalization");
    }
}
