//! Telemetry events emitted by the engine.
//!
//! Event names are part of the external contract; sinks are pluggable so
//! the CLI (or an external collector) can subscribe without the engine
//! knowing where events go. The default sink logs through `tracing`.

use std::sync::{Arc, Mutex, OnceLock};
use std::time::Instant;

use tracing::debug;

/// Contract event names.
pub mod names {
    pub const PIPELINE_START: &str = "pipeline.start";
    pub const PIPELINE_STOP: &str = "pipeline.stop";
    pub const PIPELINE_EXCEPTION: &str = "pipeline.exception";
    pub const TASK_START: &str = "task.start";
    pub const TASK_STOP: &str = "task.stop";
    pub const TASK_EXCEPTION: &str = "task.exception";
    pub const COMMAND_START: &str = "command.start";
    pub const COMMAND_STOP: &str = "command.stop";
    pub const SSH_CONNECT_START: &str = "ssh.connect.start";
    pub const SSH_CONNECT_STOP: &str = "ssh.connect.stop";
}

/// Milliseconds on the process-wide monotonic clock.
pub fn now_ms() -> u64 {
    static EPOCH: OnceLock<Instant> = OnceLock::new();
    EPOCH.get_or_init(Instant::now).elapsed().as_millis() as u64
}

/// One emitted event.
#[derive(Debug, Clone)]
pub struct Event {
    pub name: &'static str,
    /// Monotonic timestamp, milliseconds since engine start.
    pub at_ms: u64,
    /// Present on stop events.
    pub duration_ms: Option<u64>,
    /// Event-specific metadata (task name, host, exit code, reason).
    pub meta: serde_json::Value,
}

impl Event {
    pub fn new(name: &'static str, meta: serde_json::Value) -> Self {
        Self {
            name,
            at_ms: now_ms(),
            duration_ms: None,
            meta,
        }
    }

    pub fn with_duration(mut self, duration_ms: u64) -> Self {
        self.duration_ms = Some(duration_ms);
        self
    }
}

/// Receives engine events.
pub trait TelemetrySink: Send + Sync {
    fn emit(&self, event: Event);
}

/// Default sink: structured tracing output.
pub struct TracingSink;

impl TelemetrySink for TracingSink {
    fn emit(&self, event: Event) {
        debug!(
            target: "nexus::telemetry",
            event = event.name,
            at_ms = event.at_ms,
            duration_ms = event.duration_ms,
            meta = %event.meta,
            "telemetry"
        );
    }
}

/// Drops everything; for callers that opt out.
pub struct NullSink;

impl TelemetrySink for NullSink {
    fn emit(&self, _event: Event) {}
}

/// Buffers events in memory; used by tests and the dry-run inspector.
#[derive(Default)]
pub struct CollectingSink {
    events: Mutex<Vec<Event>>,
}

impl CollectingSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<Event> {
        self.events.lock().unwrap().clone()
    }

    pub fn names(&self) -> Vec<&'static str> {
        self.events.lock().unwrap().iter().map(|e| e.name).collect()
    }
}

impl TelemetrySink for CollectingSink {
    fn emit(&self, event: Event) {
        self.events.lock().unwrap().push(event);
    }
}

/// Shared handle the engine threads through its components.
pub type SharedSink = Arc<dyn TelemetrySink>;

pub fn tracing_sink() -> SharedSink {
    Arc::new(TracingSink)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_now_ms_is_monotonic() {
        let a = now_ms();
        let b = now_ms();
        assert!(b >= a);
    }

    #[test]
    fn test_collecting_sink_orders_events() {
        let sink = CollectingSink::new();
        sink.emit(Event::new(names::PIPELINE_START, serde_json::json!({})));
        sink.emit(
            Event::new(names::PIPELINE_STOP, serde_json::json!({"status": "ok"}))
                .with_duration(42),
        );

        let events = sink.events();
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].name, "pipeline.start");
        assert_eq!(events[1].duration_ms, Some(42));
        assert_eq!(events[1].meta["status"], "ok");
    }
}
