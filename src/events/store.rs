//! Append-only JSONL event log with live listener fan-out and replay.
//!
//! Writes are best-effort: a failed append increments a counter and never
//! blocks or aborts the publisher. Listeners get bounded queues; when a
//! queue is full the newest event is dropped for that listener only.

use super::Event;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use tokio::io::AsyncWriteExt;
use tokio::sync::mpsc;

/// Queue capacity per live listener.
const LISTENER_CAP: usize = 1_000;

/// Maximum events replayed to a reconnecting subscriber.
pub const REPLAY_CAP: usize = 500;

/// Event types subject to sampling when `sample_rate < 1`.
const SAMPLED_TYPES: &[&str] = &[super::types::FETCH_PROGRESS];

pub struct EventStore {
    path: PathBuf,
    sample_rate: f64,
    listeners: Mutex<HashMap<u64, mpsc::Sender<Event>>>,
    next_listener: AtomicU64,
    cursors: Mutex<HashMap<String, f64>>,
    write_errors: AtomicU64,
    dropped_events: AtomicU64,
}

impl EventStore {
    pub fn new(path: PathBuf, sample_rate: f64) -> Self {
        Self {
            path,
            sample_rate: sample_rate.clamp(0.0, 1.0),
            listeners: Mutex::new(HashMap::new()),
            next_listener: AtomicU64::new(0),
            cursors: Mutex::new(HashMap::new()),
            write_errors: AtomicU64::new(0),
            dropped_events: AtomicU64::new(0),
        }
    }

    pub fn path(&self) -> &PathBuf {
        &self.path
    }

    /// Append one event and fan it out to live listeners. Sampled-out events
    /// skip the file but still reach listeners.
    pub async fn append(&self, event: &Event) {
        let sampled_out = self.sample_rate < 1.0
            && SAMPLED_TYPES.contains(&event.event_type.as_str())
            && rand::random::<f64>() > self.sample_rate;

        if !sampled_out {
            if let Err(err) = self.write_line(event).await {
                self.write_errors.fetch_add(1, Ordering::Relaxed);
                tracing::warn!(error = %err, "event log append failed");
            }
        }
        self.broadcast(event);
    }

    async fn write_line(&self, event: &Event) -> std::io::Result<()> {
        if let Some(parent) = self.path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let mut line = serde_json::to_string(event).map_err(std::io::Error::other)?;
        line.push('\n');
        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .await?;
        file.write_all(line.as_bytes()).await?;
        file.flush().await
    }

    fn broadcast(&self, event: &Event) {
        let mut listeners = self.listeners.lock().unwrap_or_else(|p| p.into_inner());
        let mut closed = Vec::new();
        for (&id, sender) in listeners.iter() {
            match sender.try_send(event.clone()) {
                Ok(()) => {}
                Err(mpsc::error::TrySendError::Full(_)) => {
                    self.dropped_events.fetch_add(1, Ordering::Relaxed);
                }
                Err(mpsc::error::TrySendError::Closed(_)) => closed.push(id),
            }
        }
        for id in closed {
            listeners.remove(&id);
        }
    }

    /// Register a live listener. Drop the receiver to unsubscribe.
    pub fn register_listener(&self) -> (u64, mpsc::Receiver<Event>) {
        let (sender, receiver) = mpsc::channel(LISTENER_CAP);
        let id = self.next_listener.fetch_add(1, Ordering::Relaxed);
        self.listeners
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .insert(id, sender);
        (id, receiver)
    }

    pub fn unregister_listener(&self, id: u64) {
        self.listeners
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .remove(&id);
    }

    pub fn listener_count(&self) -> usize {
        self.listeners
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .len()
    }

    /// Last `n` events from the log, oldest first. Unparseable lines skipped.
    pub async fn tail(&self, n: usize) -> Vec<Event> {
        let events = self.read_all().await;
        let skip = events.len().saturating_sub(n);
        events.into_iter().skip(skip).collect()
    }

    /// Events strictly after `ts`, optionally filtered by type, capped at
    /// `limit`.
    pub async fn after(&self, ts: f64, limit: usize, event_type: Option<&str>) -> Vec<Event> {
        let mut out = Vec::new();
        for event in self.read_all().await {
            if event.ts <= ts {
                continue;
            }
            if let Some(filter) = event_type {
                if event.event_type != filter {
                    continue;
                }
            }
            out.push(event);
            if out.len() >= limit {
                break;
            }
        }
        out
    }

    async fn read_all(&self) -> Vec<Event> {
        let Ok(text) = tokio::fs::read_to_string(&self.path).await else {
            return Vec::new();
        };
        text.lines()
            .filter_map(|line| serde_json::from_str(line).ok())
            .collect()
    }

    /// Remember a client's replay cursor (`x-client-id` support).
    pub fn set_cursor(&self, client_id: &str, ts: f64) {
        self.cursors
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .insert(client_id.to_string(), ts);
    }

    pub fn cursor(&self, client_id: &str) -> Option<f64> {
        self.cursors
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .get(client_id)
            .copied()
    }

    pub fn write_errors(&self) -> u64 {
        self.write_errors.load(Ordering::Relaxed)
    }

    /// Readiness probe: verify the log is writable by appending a probe event.
    pub async fn probe(&self) -> bool {
        let event = Event::new(super::types::READY_PROBE, serde_json::json!({}), "api");
        self.write_line(&event).await.is_ok()
    }
}

impl std::fmt::Debug for EventStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventStore")
            .field("path", &self.path)
            .field("listeners", &self.listener_count())
            .finish()
    }
}
