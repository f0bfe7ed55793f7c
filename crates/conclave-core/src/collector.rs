//! Structured telemetry events and their non-blocking fan-out.
//!
//! [`TelemetryCollector::record`] never waits and never fails. Events go
//! onto a bounded channel drained by one background task, which hands each
//! event to every backend in turn. A backend error or panic is logged and
//! the remaining backends still see the event.

use std::collections::BTreeMap;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::FutureExt;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use tokio::io::AsyncWriteExt;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, warn};

use crate::dispatch::panic_message;

const QUEUE_CAPACITY: usize = 1024;
const DEFAULT_BATCH_SIZE: usize = 32;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EventLevel {
    #[default]
    Info,
    Warn,
    Error,
}

/// One structured event. Built with the `with_*` methods, then recorded.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TelemetryEvent {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub trace_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub span_id: Option<String>,
    #[serde(default)]
    pub attrs: BTreeMap<String, Value>,
    pub timestamp: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duration_ms: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default)]
    pub level: EventLevel,
}

impl TelemetryEvent {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            trace_id: None,
            span_id: None,
            attrs: BTreeMap::new(),
            timestamp: Utc::now(),
            duration_ms: None,
            error: None,
            level: EventLevel::Info,
        }
    }

    pub fn warn(mut self) -> Self {
        self.level = EventLevel::Warn;
        self
    }

    pub fn error_level(mut self) -> Self {
        self.level = EventLevel::Error;
        self
    }

    pub fn with_trace(mut self, trace_id: impl Into<String>) -> Self {
        self.trace_id = Some(trace_id.into());
        self
    }

    pub fn with_span(mut self, span_id: impl Into<String>) -> Self {
        self.span_id = Some(span_id.into());
        self
    }

    pub fn with_attr(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.attrs.insert(key.into(), value.into());
        self
    }

    pub fn with_duration(mut self, duration_ms: u64) -> Self {
        self.duration_ms = Some(duration_ms);
        self
    }

    pub fn with_error(mut self, error: impl Into<String>) -> Self {
        self.error = Some(error.into());
        self
    }
}

#[derive(Debug, Error)]
pub enum TelemetryError {
    #[error("telemetry io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("telemetry serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("telemetry backend error: {0}")]
    Backend(String),
}

#[async_trait]
pub trait TelemetryBackend: Send + Sync {
    fn name(&self) -> &str;

    async fn send(&self, event: &TelemetryEvent) -> Result<(), TelemetryError>;

    async fn flush(&self) -> Result<(), TelemetryError> {
        Ok(())
    }
}

enum Command {
    Event(Box<TelemetryEvent>),
    Flush(oneshot::Sender<()>),
}

/// Handle to the fan-out task. Cheap to clone.
#[derive(Clone, Default)]
pub struct TelemetryCollector {
    tx: Option<mpsc::Sender<Command>>,
}

impl std::fmt::Debug for TelemetryCollector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TelemetryCollector")
            .field("enabled", &self.is_enabled())
            .finish()
    }
}

impl TelemetryCollector {
    /// Start the fan-out task on the current tokio runtime.
    ///
    /// With no backends, or outside a runtime, the collector is a no-op.
    pub fn new(backends: Vec<Arc<dyn TelemetryBackend>>) -> Self {
        if backends.is_empty() {
            return Self::disabled();
        }
        let Ok(handle) = tokio::runtime::Handle::try_current() else {
            warn!("no tokio runtime; telemetry disabled");
            return Self::disabled();
        };

        let (tx, rx) = mpsc::channel(QUEUE_CAPACITY);
        handle.spawn(fan_out(rx, backends));
        Self { tx: Some(tx) }
    }

    pub fn disabled() -> Self {
        Self { tx: None }
    }

    pub fn is_enabled(&self) -> bool {
        self.tx.is_some()
    }

    /// Queue `event` for delivery. Drops it (with a log line) if the queue is full.
    pub fn record(&self, event: TelemetryEvent) {
        let Some(tx) = &self.tx else {
            return;
        };
        if let Err(err) = tx.try_send(Command::Event(Box::new(event))) {
            let reason = match err {
                mpsc::error::TrySendError::Full(_) => "queue full",
                mpsc::error::TrySendError::Closed(_) => "collector stopped",
            };
            warn!(reason, "telemetry event dropped");
        }
    }

    /// Wait until every event recorded before this call reached the
    /// backends, then flush each backend.
    pub async fn flush(&self) {
        let Some(tx) = &self.tx else {
            return;
        };
        let (done_tx, done_rx) = oneshot::channel();
        if tx.send(Command::Flush(done_tx)).await.is_ok() {
            let _ = done_rx.await;
        }
    }
}

async fn fan_out(mut rx: mpsc::Receiver<Command>, backends: Vec<Arc<dyn TelemetryBackend>>) {
    while let Some(command) = rx.recv().await {
        match command {
            Command::Event(event) => {
                for backend in &backends {
                    if let Err(err) = contained(backend.send(&event)).await {
                        warn!(backend = backend.name(), event = %event.name, error = %err, "telemetry backend failed");
                    }
                }
            }
            Command::Flush(done) => {
                for backend in &backends {
                    if let Err(err) = contained(backend.flush()).await {
                        warn!(backend = backend.name(), error = %err, "telemetry flush failed");
                    }
                }
                let _ = done.send(());
            }
        }
    }
    for backend in &backends {
        if let Err(err) = contained(backend.flush()).await {
            warn!(backend = backend.name(), error = %err, "telemetry flush on shutdown failed");
        }
    }
    debug!("telemetry fan-out stopped");
}

/// Await one backend call; a panic inside it becomes an error.
async fn contained<F>(call: F) -> Result<(), TelemetryError>
where
    F: Future<Output = Result<(), TelemetryError>>,
{
    AssertUnwindSafe(call)
        .catch_unwind()
        .await
        .unwrap_or_else(|payload| {
            Err(TelemetryError::Backend(format!(
                "backend panicked: {}",
                panic_message(payload.as_ref())
            )))
        })
}

// ---------------------------------------------------------------------------
// Backends
// ---------------------------------------------------------------------------

/// Keeps every event in memory.
#[derive(Debug, Default)]
pub struct MemoryBackend {
    events: Mutex<Vec<TelemetryEvent>>,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<TelemetryEvent> {
        self.events
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn named(&self, name: &str) -> Vec<TelemetryEvent> {
        self.events()
            .into_iter()
            .filter(|e| e.name == name)
            .collect()
    }
}

#[async_trait]
impl TelemetryBackend for MemoryBackend {
    fn name(&self) -> &str {
        "memory"
    }

    async fn send(&self, event: &TelemetryEvent) -> Result<(), TelemetryError> {
        self.events
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(event.clone());
        Ok(())
    }
}

/// Appends one JSON object per line, written in batches.
pub struct JsonlFileBackend {
    path: PathBuf,
    batch_size: usize,
    buffer: tokio::sync::Mutex<Vec<String>>,
}

impl JsonlFileBackend {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            batch_size: DEFAULT_BATCH_SIZE,
            buffer: tokio::sync::Mutex::new(Vec::new()),
        }
    }

    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size.max(1);
        self
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Append the buffered lines. A batch that fails to write is dropped.
    async fn write_lines(&self, lines: &mut Vec<String>) -> Result<(), TelemetryError> {
        if lines.is_empty() {
            return Ok(());
        }
        let batch = std::mem::take(lines);
        let result = self.append(&batch).await;
        if result.is_err() {
            warn!(path = %self.path.display(), dropped = batch.len(), "telemetry batch dropped");
        }
        result
    }

    async fn append(&self, lines: &[String]) -> Result<(), TelemetryError> {
        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(parent).await?;
        }
        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .await?;
        let mut chunk = String::new();
        for line in lines.iter() {
            chunk.push_str(line);
            chunk.push('\n');
        }
        file.write_all(chunk.as_bytes()).await?;
        file.flush().await?;
        Ok(())
    }
}

#[async_trait]
impl TelemetryBackend for JsonlFileBackend {
    fn name(&self) -> &str {
        "jsonl"
    }

    async fn send(&self, event: &TelemetryEvent) -> Result<(), TelemetryError> {
        let line = serde_json::to_string(event)?;
        let mut buffer = self.buffer.lock().await;
        buffer.push(line);
        if buffer.len() >= self.batch_size {
            self.write_lines(&mut buffer).await?;
        }
        Ok(())
    }

    async fn flush(&self) -> Result<(), TelemetryError> {
        let mut buffer = self.buffer.lock().await;
        self.write_lines(&mut buffer).await
    }
}

/// Re-emits events as `tracing` events for whatever subscriber is installed.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingBackend;

#[async_trait]
impl TelemetryBackend for TracingBackend {
    fn name(&self) -> &str {
        "tracing"
    }

    async fn send(&self, event: &TelemetryEvent) -> Result<(), TelemetryError> {
        let attrs = serde_json::to_string(&event.attrs)?;
        let trace_id = event.trace_id.as_deref().unwrap_or("");
        let error = event.error.as_deref().unwrap_or("");
        match event.level {
            EventLevel::Info => tracing::info!(
                event = %event.name, trace_id, attrs = %attrs, duration_ms = event.duration_ms, "telemetry"
            ),
            EventLevel::Warn => tracing::warn!(
                event = %event.name, trace_id, attrs = %attrs, error, "telemetry"
            ),
            EventLevel::Error => tracing::error!(
                event = %event.name, trace_id, attrs = %attrs, error, "telemetry"
            ),
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct FailingBackend;

    #[async_trait]
    impl TelemetryBackend for FailingBackend {
        fn name(&self) -> &str {
            "failing"
        }

        async fn send(&self, _event: &TelemetryEvent) -> Result<(), TelemetryError> {
            Err(TelemetryError::Backend("sink unavailable".to_string()))
        }
    }

    struct PanickingBackend;

    #[async_trait]
    impl TelemetryBackend for PanickingBackend {
        fn name(&self) -> &str {
            "panicking"
        }

        async fn send(&self, event: &TelemetryEvent) -> Result<(), TelemetryError> {
            panic!("cannot encode {}", event.name)
        }

        async fn flush(&self) -> Result<(), TelemetryError> {
            panic!("flush exploded")
        }
    }

    #[test]
    fn test_event_builder() {
        let event = TelemetryEvent::new("phase.decided")
            .with_trace("run-1")
            .with_attr("phase", "coding")
            .with_attr("score", 0.5)
            .with_duration(12)
            .warn();
        assert_eq!(event.attrs["phase"], Value::from("coding"));
        assert_eq!(event.level, EventLevel::Warn);
        assert_eq!(event.duration_ms, Some(12));
    }

    #[tokio::test]
    async fn test_failing_backend_does_not_starve_others() {
        let memory = Arc::new(MemoryBackend::new());
        let collector = TelemetryCollector::new(vec![Arc::new(FailingBackend), memory.clone()]);
        collector.record(TelemetryEvent::new("a"));
        collector.record(TelemetryEvent::new("b"));
        collector.flush().await;
        let names: Vec<_> = memory.events().into_iter().map(|e| e.name).collect();
        assert_eq!(names, vec!["a", "b"]);
    }

    #[tokio::test]
    async fn test_panicking_backend_does_not_starve_others() {
        let memory = Arc::new(MemoryBackend::new());
        let collector =
            TelemetryCollector::new(vec![Arc::new(PanickingBackend), memory.clone()]);
        collector.record(TelemetryEvent::new("boom"));
        collector.flush().await;
        collector.record(TelemetryEvent::new("after"));
        collector.flush().await;
        let names: Vec<_> = memory.events().into_iter().map(|e| e.name).collect();
        assert_eq!(names, vec!["boom", "after"]);
    }

    #[tokio::test]
    async fn test_contained_reports_panic_message() {
        let err = contained(PanickingBackend.send(&TelemetryEvent::new("x")))
            .await
            .unwrap_err();
        assert!(err.to_string().contains("cannot encode x"));
    }

    #[tokio::test]
    async fn test_disabled_collector_is_noop() {
        let collector = TelemetryCollector::new(Vec::new());
        assert!(!collector.is_enabled());
        collector.record(TelemetryEvent::new("ignored"));
        collector.flush().await;
    }

    #[tokio::test]
    async fn test_jsonl_backend_batches_until_flush() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("events.jsonl");
        let backend = JsonlFileBackend::new(&path).with_batch_size(2);

        backend.send(&TelemetryEvent::new("one")).await.unwrap();
        assert!(!path.exists());
        backend.send(&TelemetryEvent::new("two")).await.unwrap();
        backend.send(&TelemetryEvent::new("three")).await.unwrap();
        assert_eq!(std::fs::read_to_string(&path).unwrap().lines().count(), 2);

        backend.flush().await.unwrap();
        let text = std::fs::read_to_string(&path).unwrap();
        let names: Vec<String> = text
            .lines()
            .map(|l| serde_json::from_str::<TelemetryEvent>(l).unwrap().name)
            .collect();
        assert_eq!(names, vec!["one", "two", "three"]);
    }

    #[tokio::test]
    async fn test_jsonl_backend_drops_batch_it_cannot_write() {
        let dir = tempfile::tempdir().unwrap();
        // A directory cannot be opened for appending.
        let backend = JsonlFileBackend::new(dir.path()).with_batch_size(2);

        backend.send(&TelemetryEvent::new("one")).await.unwrap();
        assert!(backend.send(&TelemetryEvent::new("two")).await.is_err());

        // The failed batch is gone, so the buffer refills from empty.
        backend.send(&TelemetryEvent::new("three")).await.unwrap();
        assert!(backend.flush().await.is_err());
        backend.flush().await.unwrap();
    }
}
