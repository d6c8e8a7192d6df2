//! Single-shot timers feeding expiries back into the dispatch context.
//!
//! Every arm bumps a per-kind generation. An expiry carries the generation it
//! was armed with and is ignored unless it is still current, so a cancel that
//! races with delivery is harmless.

use super::event::GapEvent;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::trace;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TimerKind {
    FastAdv,
    LimitedDiscovery,
    Observe,
    Inquiry,
    RemoteName,
    SyncEstablish,
}

/// Scheduling backend. Implementations only deliver
/// `GapEvent::TimerExpired` later; bookkeeping lives in [`Timers`].
pub trait TimerBackend: Send {
    fn schedule(&mut self, kind: TimerKind, generation: u64, after: Duration);
    fn cancel(&mut self, kind: TimerKind);
}

pub struct Timers {
    backend: Box<dyn TimerBackend>,
    generations: HashMap<TimerKind, u64>,
    armed: HashMap<TimerKind, u64>,
}

impl Timers {
    pub fn new(backend: Box<dyn TimerBackend>) -> Self {
        Self {
            backend,
            generations: HashMap::new(),
            armed: HashMap::new(),
        }
    }

    /// (Re)arm a timer; any earlier arming of the same kind is superseded
    pub fn arm(&mut self, kind: TimerKind, after: Duration) {
        let generation = self.generations.entry(kind).or_insert(0);
        *generation += 1;
        let generation = *generation;
        self.backend.cancel(kind);
        self.armed.insert(kind, generation);
        trace!("Arming {:?} timer ({:?}, generation {})", kind, after, generation);
        self.backend.schedule(kind, generation, after);
    }

    pub fn cancel(&mut self, kind: TimerKind) {
        if self.armed.remove(&kind).is_some() {
            trace!("Cancelled {:?} timer", kind);
            self.backend.cancel(kind);
        }
    }

    pub fn is_armed(&self, kind: TimerKind) -> bool {
        self.armed.contains_key(&kind)
    }

    /// Accept an expiry. True only for the generation currently armed, which
    /// is then disarmed.
    pub fn consume(&mut self, kind: TimerKind, generation: u64) -> bool {
        match self.armed.get(&kind) {
            Some(current) if *current == generation => {
                self.armed.remove(&kind);
                true
            }
            _ => {
                trace!("Ignoring stale {:?} expiry (generation {})", kind, generation);
                false
            }
        }
    }
}

/// Backend sleeping on the tokio runtime. Must be used from within one.
pub struct TokioTimerBackend {
    events: mpsc::UnboundedSender<GapEvent>,
    tasks: HashMap<TimerKind, JoinHandle<()>>,
}

impl TokioTimerBackend {
    pub fn new(events: mpsc::UnboundedSender<GapEvent>) -> Self {
        Self {
            events,
            tasks: HashMap::new(),
        }
    }
}

impl TimerBackend for TokioTimerBackend {
    fn schedule(&mut self, kind: TimerKind, generation: u64, after: Duration) {
        let events = self.events.clone();
        let task = tokio::spawn(async move {
            tokio::time::sleep(after).await;
            // Receiver gone means the runtime shut down
            let _ = events.send(GapEvent::TimerExpired { kind, generation });
        });
        if let Some(previous) = self.tasks.insert(kind, task) {
            previous.abort();
        }
    }

    fn cancel(&mut self, kind: TimerKind) {
        if let Some(task) = self.tasks.remove(&kind) {
            task.abort();
        }
    }
}

impl Drop for TokioTimerBackend {
    fn drop(&mut self) {
        for (_, task) in self.tasks.drain() {
            task.abort();
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ScheduledTimer {
    pub kind: TimerKind,
    pub generation: u64,
    pub after: Duration,
}

/// Backend that never fires on its own. Shared handle so a driver can fire
/// timers after handing the backend to the subsystem.
#[derive(Debug, Clone, Default)]
pub struct ManualTimers {
    scheduled: Arc<Mutex<HashMap<TimerKind, ScheduledTimer>>>,
}

impl ManualTimers {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn scheduled(&self, kind: TimerKind) -> Option<ScheduledTimer> {
        self.scheduled.lock().get(&kind).copied()
    }

    pub fn is_scheduled(&self, kind: TimerKind) -> bool {
        self.scheduled.lock().contains_key(&kind)
    }

    /// Expiry event for a pending timer, removing it from the schedule
    pub fn fire(&self, kind: TimerKind) -> Option<GapEvent> {
        self.scheduled
            .lock()
            .remove(&kind)
            .map(|t| GapEvent::TimerExpired {
                kind: t.kind,
                generation: t.generation,
            })
    }
}

impl TimerBackend for ManualTimers {
    fn schedule(&mut self, kind: TimerKind, generation: u64, after: Duration) {
        self.scheduled.lock().insert(
            kind,
            ScheduledTimer {
                kind,
                generation,
                after,
            },
        );
    }

    fn cancel(&mut self, kind: TimerKind) {
        self.scheduled.lock().remove(&kind);
    }
}
