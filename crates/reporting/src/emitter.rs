//! Non-blocking delivery of telemetry to a sink.
//!
//! The check path only ever calls `try_send` on a bounded channel; a worker
//! thread drains it into an [`EventSink`]. A full queue drops the record.

use std::fs::{self, File, OpenOptions};
use std::io::{self, BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::mpsc::{self, SyncSender, TrySendError};
use std::sync::{Arc, Mutex, RwLock};
use std::thread::{self, JoinHandle};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use policy_engine::event::{EventEmitter, TelemetryEvent};

use crate::dependency::DependencyRecord;

/// Everything the agent ships to the telemetry backend.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "record", rename_all = "snake_case")]
pub enum TelemetryRecord {
    Event(TelemetryEvent),
    Dependency(DependencyRecord),
}

pub trait EventSink: Send {
    fn write(&mut self, record: &TelemetryRecord) -> io::Result<()>;

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

/// Appends one JSON object per line.
pub struct JsonlSink {
    path: PathBuf,
    writer: BufWriter<File>,
}

impl JsonlSink {
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("create event log directory {}", parent.display()))?;
        }
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .with_context(|| format!("open event log {}", path.display()))?;
        Ok(Self {
            path: path.to_path_buf(),
            writer: BufWriter::new(file),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl EventSink for JsonlSink {
    fn write(&mut self, record: &TelemetryRecord) -> io::Result<()> {
        serde_json::to_writer(&mut self.writer, record)?;
        self.writer.write_all(b"\n")?;
        self.writer.flush()
    }

    fn flush(&mut self) -> io::Result<()> {
        self.writer.flush()
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct EmitterStats {
    pub delivered: u64,
    pub dropped: u64,
    pub failed: u64,
}

#[derive(Default)]
struct Counters {
    delivered: AtomicU64,
    dropped: AtomicU64,
    failed: AtomicU64,
}

pub struct ChannelEmitter {
    /// Read-locked on every emit; only shutdown takes the write lock.
    sender: RwLock<Option<SyncSender<TelemetryRecord>>>,
    worker: Mutex<Option<JoinHandle<()>>>,
    counters: Arc<Counters>,
}

impl ChannelEmitter {
    pub fn spawn(mut sink: Box<dyn EventSink>, capacity: usize) -> Result<Self> {
        let (sender, receiver) = mpsc::sync_channel::<TelemetryRecord>(capacity.max(1));
        let counters = Arc::new(Counters::default());
        let worker_counters = Arc::clone(&counters);
        let worker = thread::Builder::new()
            .name("rasp-telemetry".to_string())
            .spawn(move || {
                for record in receiver {
                    match sink.write(&record) {
                        Ok(()) => {
                            worker_counters.delivered.fetch_add(1, Ordering::Relaxed);
                        }
                        Err(err) => {
                            worker_counters.failed.fetch_add(1, Ordering::Relaxed);
                            tracing::warn!(error = %err, "telemetry delivery failed");
                        }
                    }
                }
                if let Err(err) = sink.flush() {
                    tracing::warn!(error = %err, "telemetry flush failed");
                }
            })
            .context("spawn telemetry worker")?;

        Ok(Self {
            sender: RwLock::new(Some(sender)),
            worker: Mutex::new(Some(worker)),
            counters,
        })
    }

    pub fn record_dependency(&self, record: DependencyRecord) {
        self.send(TelemetryRecord::Dependency(record));
    }

    pub fn stats(&self) -> EmitterStats {
        EmitterStats {
            delivered: self.counters.delivered.load(Ordering::Relaxed),
            dropped: self.counters.dropped.load(Ordering::Relaxed),
            failed: self.counters.failed.load(Ordering::Relaxed),
        }
    }

    /// Closes the queue and waits for the worker to drain it.
    pub fn shutdown(&self) {
        let sender = self
            .sender
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take();
        drop(sender);
        let worker = self
            .worker
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take();
        if let Some(worker) = worker {
            if worker.join().is_err() {
                tracing::warn!("telemetry worker panicked");
            }
        }
    }

    fn send(&self, record: TelemetryRecord) {
        let guard = self
            .sender
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        let Some(sender) = guard.as_ref() else {
            self.counters.dropped.fetch_add(1, Ordering::Relaxed);
            return;
        };
        match sender.try_send(record) {
            Ok(()) => {}
            Err(TrySendError::Full(_)) => {
                self.counters.dropped.fetch_add(1, Ordering::Relaxed);
                tracing::warn!("telemetry queue full, dropping record");
            }
            Err(TrySendError::Disconnected(_)) => {
                self.counters.dropped.fetch_add(1, Ordering::Relaxed);
                tracing::debug!("telemetry worker gone, dropping record");
            }
        }
    }
}

impl EventEmitter for ChannelEmitter {
    fn emit(&self, event: TelemetryEvent) {
        self.send(TelemetryRecord::Event(event));
    }
}

impl Drop for ChannelEmitter {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// Keeps events in memory; used by replay sessions and tests.
#[derive(Debug, Default)]
pub struct MemoryEmitter {
    events: Mutex<Vec<TelemetryEvent>>,
}

impl MemoryEmitter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<TelemetryEvent> {
        self.lock().clone()
    }

    pub fn take(&self) -> Vec<TelemetryEvent> {
        std::mem::take(&mut *self.lock())
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Vec<TelemetryEvent>> {
        self.events.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl EventEmitter for MemoryEmitter {
    fn emit(&self, event: TelemetryEvent) {
        self.lock().push(event);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use policy_engine::decision::Decision;
    use rasp_core::ids::AgentId;
    use rasp_core::types::{AgentMetadata, CheckKind, CheckParameter};
    use std::sync::Barrier;
    use std::time::Duration;

    fn agent() -> AgentMetadata {
        AgentMetadata {
            host_name: "web-1".to_string(),
            agent_id: AgentId::new(),
            app_id: "shop".to_string(),
        }
    }

    fn event(command: &str) -> TelemetryEvent {
        let param = CheckParameter::new(CheckKind::Command {
            command: command.to_string(),
        });
        TelemetryEvent::from_decision(&param, &Decision::fail_open("x"), false, &agent())
    }

    struct SharedSink(Arc<Mutex<Vec<TelemetryRecord>>>);

    impl EventSink for SharedSink {
        fn write(&mut self, record: &TelemetryRecord) -> io::Result<()> {
            self.0.lock().unwrap().push(record.clone());
            Ok(())
        }
    }

    /// Blocks on the first write until the test releases it.
    struct GatedSink {
        gate: Arc<Barrier>,
        opened: bool,
    }

    impl EventSink for GatedSink {
        fn write(&mut self, _record: &TelemetryRecord) -> io::Result<()> {
            if !self.opened {
                self.gate.wait();
                self.opened = true;
            }
            Ok(())
        }
    }

    struct FailingSink;

    impl EventSink for FailingSink {
        fn write(&mut self, _record: &TelemetryRecord) -> io::Result<()> {
            Err(io::Error::new(io::ErrorKind::Other, "backend down"))
        }
    }

    #[test]
    fn test_channel_emitter_delivers_in_order() {
        let store = Arc::new(Mutex::new(Vec::new()));
        let emitter = ChannelEmitter::spawn(Box::new(SharedSink(Arc::clone(&store))), 16).unwrap();
        emitter.emit(event("a"));
        emitter.emit(event("b"));
        emitter.record_dependency(DependencyRecord::new(&agent(), "v", "p", "1", vec![], "test"));
        emitter.shutdown();

        let records = store.lock().unwrap();
        assert_eq!(records.len(), 3);
        match &records[1] {
            TelemetryRecord::Event(event) => assert_eq!(event.params["command"], "b"),
            other => panic!("unexpected record {other:?}"),
        }
        assert!(matches!(records[2], TelemetryRecord::Dependency(_)));
        assert_eq!(emitter.stats().delivered, 3);
    }

    #[test]
    fn test_full_queue_drops_without_blocking() {
        let gate = Arc::new(Barrier::new(2));
        let emitter = ChannelEmitter::spawn(
            Box::new(GatedSink {
                gate: Arc::clone(&gate),
                opened: false,
            }),
            1,
        )
        .unwrap();

        // The worker takes the first record and blocks in the sink, the
        // second fills the queue, the rest are dropped.
        emitter.emit(event("1"));
        std::thread::sleep(Duration::from_millis(50));
        for i in 0..5 {
            emitter.emit(event(&i.to_string()));
        }
        assert_eq!(emitter.stats().dropped, 4);

        gate.wait();
        emitter.shutdown();
        assert_eq!(emitter.stats().delivered, 2);
    }

    #[test]
    fn test_sink_failures_are_counted_not_propagated() {
        let emitter = ChannelEmitter::spawn(Box::new(FailingSink), 4).unwrap();
        emitter.emit(event("a"));
        emitter.shutdown();
        assert_eq!(emitter.stats().failed, 1);

        emitter.emit(event("after shutdown"));
        assert_eq!(emitter.stats().dropped, 1);
    }

    #[test]
    fn test_jsonl_sink_appends_lines() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("events.jsonl");
        {
            let emitter = ChannelEmitter::spawn(Box::new(JsonlSink::open(&path).unwrap()), 8).unwrap();
            emitter.emit(event("whoami"));
        }
        {
            let mut sink = JsonlSink::open(&path).unwrap();
            sink.write(&TelemetryRecord::Event(event("id"))).unwrap();
        }

        let contents = std::fs::read_to_string(&path).unwrap();
        let lines: Vec<&str> = contents.lines().collect();
        assert_eq!(lines.len(), 2);
        let first: serde_json::Value = serde_json::from_str(lines[0]).unwrap();
        assert_eq!(first["record"], "event");
        assert_eq!(first["params"]["command"], "whoami");
        let second: TelemetryRecord = serde_json::from_str(lines[1]).unwrap();
        assert!(matches!(second, TelemetryRecord::Event(_)));
    }

    #[test]
    fn test_concurrent_emitters_all_delivered() {
        let store = Arc::new(Mutex::new(Vec::new()));
        let emitter = Arc::new(
            ChannelEmitter::spawn(Box::new(SharedSink(Arc::clone(&store))), 512).unwrap(),
        );
        let handles: Vec<_> = (0..8)
            .map(|worker| {
                let emitter = Arc::clone(&emitter);
                std::thread::spawn(move || {
                    for i in 0..50 {
                        emitter.emit(event(&format!("{worker}-{i}")));
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }
        emitter.shutdown();

        let stats = emitter.stats();
        assert_eq!(stats.delivered + stats.dropped, 400);
        assert_eq!(store.lock().unwrap().len() as u64, stats.delivered);
    }

    #[test]
    fn test_memory_emitter() {
        let emitter = MemoryEmitter::new();
        emitter.emit(event("a"));
        assert_eq!(emitter.len(), 1);
        assert_eq!(emitter.take().len(), 1);
        assert!(emitter.is_empty());
    }
}
