//! Process-wide routing table for active downloads.
//!
//! Grounded on the re-architecture note in this engine's design notes
//! ("global mutable state becomes a single explicit Registry component"):
//! FluxDM's own `storage`/`api` crates were empty stubs with no precedent
//! to generalize, so the two-view shape here follows the contract named
//! for this component directly — an authoritative coordinator map plus a
//! cheap state view for command routing that never touches the
//! coordinator lock.

use std::collections::HashMap;
use std::sync::{Arc, RwLock, Weak};

use dashmap::DashMap;

use crate::chunk::{AdaptiveSizer, AdaptiveThresholds};
use crate::config::EngineConfig;
use crate::coordinator::Coordinator;
use crate::error::EngineError;
use crate::transport::{Command, Event, Transport};

/// Cheap, lock-light snapshot of a download's activity, read by command
/// routing without acquiring the coordinator map's lock.
#[derive(Debug, Clone, Copy, Default)]
pub struct LightState {
    pub active: bool,
    pub paused: bool,
}

/// Maintains the two views keyed by URL: the authoritative coordinator map
/// (weak references — the owning task is each Coordinator's sole strong
/// owner) and the lightweight state map, plus the adaptive chunk-size
/// history that outlives any single download.
pub struct Registry {
    coordinators: RwLock<HashMap<String, Weak<Coordinator>>>,
    states: DashMap<String, LightState>,
    adaptive: std::sync::Mutex<AdaptiveSizer>,
    thresholds: AdaptiveThresholds,
}

impl Registry {
    pub fn new() -> Self {
        Self::with_thresholds(AdaptiveThresholds::default())
    }

    /// Builds a `Registry` whose adaptive chunk-size policy uses
    /// `thresholds` rather than the default fast/medium cutoffs, per
    /// `EngineConfig::adaptive_thresholds` — the knob an embedding process
    /// tunes without touching code.
    pub fn with_thresholds(thresholds: AdaptiveThresholds) -> Self {
        Self {
            coordinators: RwLock::new(HashMap::new()),
            states: DashMap::new(),
            adaptive: std::sync::Mutex::new(AdaptiveSizer::new()),
            thresholds,
        }
    }

    /// Builds a `Registry` using the adaptive thresholds carried by
    /// `config`, so a configured `EngineConfig` and the `Registry` it
    /// drives never diverge.
    pub fn from_config(config: &EngineConfig) -> Self {
        Self::with_thresholds(config.adaptive_thresholds)
    }

    /// Live coordinator for `url`, if one is currently registered.
    pub fn get(&self, url: &str) -> Option<Arc<Coordinator>> {
        self.coordinators.read().unwrap().get(url).and_then(Weak::upgrade)
    }

    fn is_active(&self, url: &str) -> bool {
        self.get(url).is_some()
    }

    /// Registers `coordinator` for `url`. Fails with
    /// [`EngineError::AlreadyInProgress`] if a live coordinator is already
    /// registered for this URL, mirroring the Planning-stage insert
    /// contract: the first download is unaffected by a rejected duplicate.
    pub fn try_insert(&self, url: &str, coordinator: Weak<Coordinator>) -> Result<(), EngineError> {
        let mut map = self.coordinators.write().unwrap();
        if let Some(existing) = map.get(url) {
            if existing.upgrade().is_some() {
                return Err(EngineError::AlreadyInProgress { url: url.to_string() });
            }
        }
        map.insert(url.to_string(), coordinator);
        self.states.insert(url.to_string(), LightState { active: true, paused: false });
        Ok(())
    }

    /// Removes `url` from both views. Called only from finalization's last
    /// step or from cancel.
    pub fn remove(&self, url: &str) {
        self.coordinators.write().unwrap().remove(url);
        self.states.remove(url);
    }

    pub fn set_paused(&self, url: &str, paused: bool) {
        if let Some(mut entry) = self.states.get_mut(url) {
            entry.paused = paused;
        }
    }

    pub fn state(&self, url: &str) -> Option<LightState> {
        self.states.get(url).map(|entry| *entry)
    }

    /// Chunk size the adaptive policy recommends for a fresh download of
    /// `url`, from previously observed throughput.
    pub fn chunk_size_for(&self, url: &str) -> u64 {
        self.adaptive.lock().unwrap().chunk_size_for(url, &self.thresholds)
    }

    /// Folds a completed download's observed throughput into the adaptive
    /// history, read back by the next [`Self::chunk_size_for`] call for
    /// this URL.
    pub fn record_throughput(&self, url: &str, observed_bps: f64) {
        self.adaptive.lock().unwrap().record(url, observed_bps, &self.thresholds);
    }

    /// Routes one inbound [`Command`] to the appropriate coordinator,
    /// spawning a new one for `start_download` and emitting the
    /// informational log + confirming event contract for pause/resume/
    /// cancel/checksum on an unknown URL.
    pub async fn dispatch(
        self: &Arc<Self>,
        command: Command,
        transport: Arc<dyn Transport>,
        client: reqwest::Client,
        config: Arc<EngineConfig>,
    ) {
        match command {
            Command::StartDownload { url, use_chunks } => {
                if !use_chunks {
                    transport
                        .send(Event::Log {
                            url: Some(url.clone()),
                            message: "non-chunked transfer is not supported; downloading in chunks".into(),
                        })
                        .await;
                }
                if self.is_active(&url) {
                    transport
                        .send(Event::Error {
                            url: Some(url.clone()),
                            message: EngineError::AlreadyInProgress { url }.to_string(),
                        })
                        .await;
                    return;
                }
                Coordinator::spawn(url, self.clone(), transport, client, config);
            }
            Command::PauseDownload { url } => match self.get(&url) {
                Some(coordinator) => coordinator.pause(),
                None => unknown_url(&transport, &url, Event::PauseConfirmed { url: url.clone(), message: "nothing to pause".into() }).await,
            },
            Command::ResumeDownload { url } => match self.get(&url) {
                Some(coordinator) => coordinator.resume(),
                None => unknown_url(&transport, &url, Event::ResumeConfirmed { url: url.clone(), message: "nothing to resume".into() }).await,
            },
            Command::CancelDownload { url } => match self.get(&url) {
                Some(coordinator) => coordinator.cancel(),
                None => unknown_url(&transport, &url, Event::CancelConfirmed { url: url.clone(), message: "nothing to cancel".into() }).await,
            },
            Command::CalculateChecksum { url, filename } => {
                self.calculate_checksum(url, filename, transport, config).await;
            }
            Command::Ping => transport.send(Event::Pong).await,
        }
    }

    /// Hashes an already-downloaded file from the downloads directory,
    /// independent of whether `url` still has a live coordinator.
    async fn calculate_checksum(
        &self,
        url: String,
        filename: String,
        transport: Arc<dyn Transport>,
        config: Arc<EngineConfig>,
    ) {
        if !self.is_active(&url) {
            transport
                .send(Event::Log {
                    url: Some(url.clone()),
                    message: "no active download for this URL; checksumming existing file".into(),
                })
                .await;
        }

        let path = match platform::downloads_dir() {
            Ok(dir) => dir.join(&filename),
            Err(e) => {
                transport.send(Event::Error { url: Some(url), message: e.to_string() }).await;
                return;
            }
        };

        let started = std::time::Instant::now();
        match crate::hash::sha256_file(&path, config.hash_buffer_size).await {
            Ok(checksum) => {
                transport
                    .send(Event::ChecksumResult {
                        url,
                        filename,
                        checksum,
                        duration: started.elapsed().as_millis() as u64,
                    })
                    .await;
            }
            Err(e) => {
                transport.send(Event::Error { url: Some(url), message: e.to_string() }).await;
            }
        }
    }
}

async fn unknown_url(transport: &Arc<dyn Transport>, url: &str, confirming: Event) {
    transport
        .send(Event::Log { url: Some(url.to_string()), message: "no active download for this URL".into() })
        .await;
    transport.send(confirming).await;
}

impl Default for Registry {
    fn default() -> Self {
        Self::new()
    }
}
