//! Deferred handler notifications.
//!
//! One queue per pipeline run, passed explicitly through the executor
//! rather than living in ambient state. Insertion is atomic and
//! idempotent; a handler name appears at most once in any flush.

use std::collections::BTreeSet;
use std::sync::Mutex;

/// When a notification should fire.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NotifyTiming {
    /// Run during the collective flush at pipeline end.
    End,
    /// The caller runs the handler now; the flush will not repeat it.
    Immediate,
}

/// Marker returned by `enqueue`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Enqueued {
    /// Queued for the end-of-run flush (or already queued).
    Queued,
    /// The caller must run the handler now.
    RunNow,
}

#[derive(Default)]
struct QueueState {
    /// Every handler notified during the run.
    members: BTreeSet<String>,
    /// Subset already run immediately; excluded from the flush.
    ran_immediately: BTreeSet<String>,
}

/// Deduplicating set of handler names triggered during a run.
#[derive(Default)]
pub struct HandlerQueue {
    state: Mutex<QueueState>,
}

impl HandlerQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds `name` to the queue. For `Immediate`, a `RunNow` marker is
    /// returned only the first time; membership deduplicates reruns.
    pub fn enqueue(&self, name: &str, timing: NotifyTiming) -> Enqueued {
        let mut state = self.state.lock().unwrap();
        match timing {
            NotifyTiming::End => {
                state.members.insert(name.to_string());
                Enqueued::Queued
            }
            NotifyTiming::Immediate => {
                if state.members.insert(name.to_string()) {
                    state.ran_immediately.insert(name.to_string());
                    Enqueued::RunNow
                } else {
                    Enqueued::Queued
                }
            }
        }
    }

    /// Drains the queue, returning names in ascending order. Handlers that
    /// already ran immediately are not returned again.
    pub fn flush(&self) -> Vec<String> {
        let mut state = self.state.lock().unwrap();
        let ran = std::mem::take(&mut state.ran_immediately);
        let members = std::mem::take(&mut state.members);
        members.into_iter().filter(|name| !ran.contains(name)).collect()
    }

    pub fn list(&self) -> Vec<String> {
        self.state.lock().unwrap().members.iter().cloned().collect()
    }

    pub fn queued(&self, name: &str) -> bool {
        self.state.lock().unwrap().members.contains(name)
    }

    pub fn any_queued(&self) -> bool {
        !self.state.lock().unwrap().members.is_empty()
    }

    pub fn count(&self) -> usize {
        self.state.lock().unwrap().members.len()
    }

    pub fn clear(&self) {
        let mut state = self.state.lock().unwrap();
        state.members.clear();
        state.ran_immediately.clear();
    }
}
