//! The bidirectional message channel between the engine and its
//! controlling client: inbound [`Command`]s, outbound [`Event`]s.
//!
//! [`Transport`] is the seam the engine is coded against; the `api` crate
//! supplies the production WebSocket implementation, and
//! [`InProcessTransport`] backs this crate's own tests. Both carry the
//! same tagged JSON shapes, since `Command`/`Event` derive `serde`
//! directly rather than each transport inventing its own envelope.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, Mutex};

use crate::chunk::ChunkStatus;

#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Command {
    StartDownload { url: String, #[serde(default = "default_true")] use_chunks: bool },
    PauseDownload { url: String },
    ResumeDownload { url: String },
    CancelDownload { url: String },
    CalculateChecksum { url: String, filename: String },
    Ping,
}

fn default_true() -> bool {
    true
}

/// `status` carried on a top-level `progress` event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ProgressStatus {
    Starting,
    Downloading,
    Paused,
    Completed,
}

#[derive(Debug, Clone, Serialize)]
pub struct ChunkWire {
    pub id: u32,
    pub start: u64,
    pub end: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub progress: Option<u64>,
    pub status: ChunkStatusWire,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub speed: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub completed: Option<bool>,
}

/// Wire spelling of [`ChunkStatus`] (kept as a separate type so the
/// internal enum can evolve without touching the serialized vocabulary).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ChunkStatusWire {
    Pending,
    Active,
    Paused,
    Completed,
    Failed,
}

impl From<ChunkStatus> for ChunkStatusWire {
    fn from(s: ChunkStatus) -> Self {
        match s {
            ChunkStatus::Pending => ChunkStatusWire::Pending,
            ChunkStatus::Active => ChunkStatusWire::Active,
            ChunkStatus::Paused => ChunkStatusWire::Paused,
            ChunkStatus::Completed => ChunkStatusWire::Completed,
            ChunkStatus::Failed => ChunkStatusWire::Failed,
        }
    }
}

impl ChunkWire {
    /// Snapshots a live [`crate::chunk::Chunk`] for the wire, optionally
    /// carrying an instantaneous speed.
    pub fn snapshot(chunk: &crate::chunk::Chunk, speed: Option<f64>) -> Self {
        Self {
            id: chunk.id,
            start: chunk.start,
            end: chunk.end,
            progress: Some(chunk.progress()),
            status: chunk.status().into(),
            speed,
            completed: Some(chunk.is_complete()),
        }
    }

    /// A freshly planned chunk, as emitted by `chunk_init`.
    pub fn pending(chunk: &crate::chunk::Chunk) -> Self {
        Self {
            id: chunk.id,
            start: chunk.start,
            end: chunk.end,
            progress: Some(0),
            status: ChunkStatusWire::Pending,
            speed: None,
            completed: None,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Event {
    ServerInfo {
        implementation: String,
        features: Vec<String>,
        chunks_supported: bool,
    },
    Progress {
        url: String,
        #[serde(rename = "bytesReceived")]
        bytes_received: u64,
        #[serde(rename = "totalBytes")]
        total_bytes: u64,
        speed: f64,
        status: ProgressStatus,
    },
    ChunkInit {
        url: String,
        chunk: ChunkWire,
    },
    ChunkProgress {
        url: String,
        chunk: ChunkWire,
    },
    ChunkRetry {
        url: String,
        chunk: ChunkWire,
        retry: u32,
        max_retries: u32,
        delay: f64,
    },
    Log {
        url: Option<String>,
        message: String,
    },
    Error {
        url: Option<String>,
        message: String,
    },
    PauseConfirmed {
        url: String,
        message: String,
    },
    ResumeConfirmed {
        url: String,
        message: String,
    },
    CancelConfirmed {
        url: String,
        message: String,
    },
    ChecksumResult {
        url: String,
        filename: String,
        checksum: String,
        duration: u64,
    },
    Pong,
}

/// The engine's view of its controlling channel: frames in, frames out.
///
/// Sends must appear atomic on the wire (no interleaving between a
/// worker's `chunk_progress` and the Coordinator's `progress`, say); each
/// implementation is responsible for serializing concurrent `send` calls
/// behind its own lock. A closed transport is not an error: `send` simply
/// becomes a no-op for a dropped receiver, matching the "events are
/// dropped silently" contract for a download that outlives its client
/// connection.
#[async_trait::async_trait]
pub trait Transport: Send + Sync {
    async fn send(&self, event: Event);
    async fn recv(&self) -> Option<Command>;
}

/// An in-process `Transport` backed by `tokio::sync::mpsc`, used by this
/// workspace's own tests and by embedders with no network boundary.
pub struct InProcessTransport {
    commands_rx: Mutex<mpsc::UnboundedReceiver<Command>>,
    events_tx: mpsc::UnboundedSender<Event>,
    send_lock: Mutex<()>,
}

impl InProcessTransport {
    /// Creates a connected pair: a `Transport` for the engine side, and
    /// plain channel handles for a test driving commands in / reading
    /// events out.
    pub fn pair() -> (Arc<Self>, mpsc::UnboundedSender<Command>, mpsc::UnboundedReceiver<Event>) {
        let (commands_tx, commands_rx) = mpsc::unbounded_channel();
        let (events_tx, events_rx) = mpsc::unbounded_channel();

        let transport = Arc::new(Self {
            commands_rx: Mutex::new(commands_rx),
            events_tx,
            send_lock: Mutex::new(()),
        });

        (transport, commands_tx, events_rx)
    }
}

#[async_trait::async_trait]
impl Transport for InProcessTransport {
    async fn send(&self, event: Event) {
        let _guard = self.send_lock.lock().await;
        // A dropped receiver means the client disconnected; per the
        // transport contract this is not an error, the event is dropped.
        let _ = self.events_tx.send(event);
    }

    async fn recv(&self) -> Option<Command> {
        self.commands_rx.lock().await.recv().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn command_deserializes_from_tagged_json() {
        let json = r#"{"type": "start_download", "url": "http://x/a.bin", "use_chunks": true}"#;
        let cmd: Command = serde_json::from_str(json).unwrap();
        assert!(matches!(cmd, Command::StartDownload { url, use_chunks: true } if url == "http://x/a.bin"));
    }

    #[test]
    fn start_download_use_chunks_defaults_true() {
        let json = r#"{"type": "start_download", "url": "http://x/a.bin"}"#;
        let cmd: Command = serde_json::from_str(json).unwrap();
        assert!(matches!(cmd, Command::StartDownload { use_chunks: true, .. }));
    }

    #[test]
    fn malformed_command_fails_to_parse_without_panicking() {
        let json = r#"{"type": "not_a_real_command"}"#;
        let result: Result<Command, _> = serde_json::from_str(json);
        assert!(result.is_err());
    }

    #[test]
    fn progress_event_serializes_camel_case_fields() {
        let event = Event::Progress {
            url: "http://x".into(),
            bytes_received: 10,
            total_bytes: 100,
            speed: 5.0,
            status: ProgressStatus::Downloading,
        };
        let value = serde_json::to_value(&event).unwrap();
        assert_eq!(value["type"], "progress");
        assert_eq!(value["bytesReceived"], 10);
        assert_eq!(value["totalBytes"], 100);
        assert_eq!(value["status"], "downloading");
    }

    #[test]
    fn checksum_result_carries_64_char_field_name() {
        let event = Event::ChecksumResult {
            url: "http://x".into(),
            filename: "a.bin".into(),
            checksum: "a".repeat(64),
            duration: 1234,
        };
        let value = serde_json::to_value(&event).unwrap();
        assert_eq!(value["checksum"].as_str().unwrap().len(), 64);
    }

    #[tokio::test]
    async fn in_process_transport_round_trips_commands_and_events() {
        let (transport, commands_tx, mut events_rx) = InProcessTransport::pair();

        commands_tx
            .send(Command::StartDownload { url: "http://x/a.bin".into(), use_chunks: true })
            .unwrap();
        let received = transport.recv().await.unwrap();
        assert!(matches!(received, Command::StartDownload { .. }));

        transport
            .send(Event::Log { url: None, message: "hello".into() })
            .await;
        let event = events_rx.recv().await.unwrap();
        assert!(matches!(event, Event::Log { message, .. } if message == "hello"));
    }

    #[tokio::test]
    async fn send_after_receiver_dropped_does_not_panic() {
        let (transport, _commands_tx, events_rx) = InProcessTransport::pair();
        drop(events_rx);
        transport.send(Event::Pong).await;
    }
}
