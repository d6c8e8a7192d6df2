//! Async driver: runs a [`GapSubsystem`] inside one tokio task.
//!
//! Controller events and timer expiries arrive on one channel, operations from
//! other tasks on another. Both are served by the same task, so the engine
//! never sees concurrent access. Notifications are forwarded on an unbounded
//! channel after every step.

use crate::config::GapConfig;
use crate::gap::{GapEvent, GapNotification, GapSubsystem, TokioTimerBackend};
use crate::hci::{ControllerCapabilities, HciSink};
use crate::GapError;
use anyhow::{anyhow, Context, Result};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, info, trace};

type Call = Box<dyn FnOnce(&mut GapSubsystem) + Send>;

pub struct GapRuntime {
    events: mpsc::UnboundedSender<GapEvent>,
    calls: mpsc::UnboundedSender<Call>,
    task: JoinHandle<GapSubsystem>,
}

impl GapRuntime {
    /// Start the engine with default collaborators. Must be called from
    /// within a tokio runtime.
    pub fn spawn(
        config: GapConfig,
        caps: ControllerCapabilities,
        hci: Box<dyn HciSink>,
    ) -> Result<(Self, mpsc::UnboundedReceiver<GapNotification>), GapError> {
        Self::spawn_with(config, caps, hci, |gap| gap)
    }

    /// Like [`GapRuntime::spawn`], with a hook to swap collaborators before
    /// the task starts
    pub fn spawn_with(
        config: GapConfig,
        caps: ControllerCapabilities,
        hci: Box<dyn HciSink>,
        configure: impl FnOnce(GapSubsystem) -> GapSubsystem,
    ) -> Result<(Self, mpsc::UnboundedReceiver<GapNotification>), GapError> {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let (calls_tx, calls_rx) = mpsc::unbounded_channel();
        let (notify_tx, notify_rx) = mpsc::unbounded_channel();

        let timers = TokioTimerBackend::new(events_tx.clone());
        let gap = configure(GapSubsystem::new(config, caps, hci, Box::new(timers))?);
        let task = tokio::spawn(run(gap, events_rx, calls_rx, notify_tx));
        info!("GAP runtime started");

        Ok((
            Self {
                events: events_tx,
                calls: calls_tx,
                task,
            },
            notify_rx,
        ))
    }

    /// Handle for an HCI transport to feed controller events in
    pub fn event_sender(&self) -> mpsc::UnboundedSender<GapEvent> {
        self.events.clone()
    }

    pub fn inject(&self, event: GapEvent) -> Result<()> {
        self.events
            .send(event)
            .map_err(|_| anyhow!("GAP runtime stopped"))
    }

    /// Run `f` against the engine on its own task and return the result
    pub async fn call<F, R>(&self, f: F) -> Result<R>
    where
        F: FnOnce(&mut GapSubsystem) -> R + Send + 'static,
        R: Send + 'static,
    {
        let (tx, rx) = oneshot::channel();
        self.calls
            .send(Box::new(move |gap| {
                let _ = tx.send(f(gap));
            }))
            .map_err(|_| anyhow!("GAP runtime stopped"))?;
        rx.await.context("GAP runtime dropped the call")
    }

    /// Stop the task and hand the engine back
    pub async fn shutdown(self) -> Result<GapSubsystem> {
        drop(self.calls);
        self.task.await.context("GAP runtime task failed")
    }
}

async fn run(
    mut gap: GapSubsystem,
    mut events: mpsc::UnboundedReceiver<GapEvent>,
    mut calls: mpsc::UnboundedReceiver<Call>,
    notifications: mpsc::UnboundedSender<GapNotification>,
) -> GapSubsystem {
    loop {
        tokio::select! {
            Some(event) = events.recv() => {
                trace!("Dispatching {:?}", event);
                gap.dispatch(event);
            }
            call = calls.recv() => match call {
                Some(call) => call(&mut gap),
                None => break,
            },
        }
        for notification in gap.take_notifications() {
            if notifications.send(notification).is_err() {
                trace!("No notification listener");
            }
        }
    }
    debug!("GAP runtime stopped");
    gap
}
