//! Registry of running Views, reference-counted per dependency.
//!
//! Views report through two shared channels, one for changes and one for
//! errors. Every message carries the serial of the View that sent it, and
//! [`Watcher::next`] drops messages from Views that have since been stopped
//! or replaced, so a removed dependency is never reported again.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use tether_core::{Dependency, Retrier};
use tether_store::Store;

use crate::brain::Brain;
use crate::error::ViewError;
use crate::view::{ChangeMsg, ErrorMsg, View};

/// Notification surfaced to the Runner.
#[derive(Debug)]
pub enum WatchEvent {
    Changed(Dependency),
    Failed {
        dependency: Dependency,
        error: ViewError,
    },
}

struct ViewSlot {
    refs: usize,
    serial: u64,
    token: CancellationToken,
    task: JoinHandle<()>,
    /// Set by the View before it reports exhausted retries.
    gave_up: Arc<AtomicBool>,
}

impl ViewSlot {
    fn halt(&self) {
        self.token.cancel();
        self.task.abort();
    }

    fn needs_restart(&self) -> bool {
        self.gave_up.load(Ordering::Acquire) || self.task.is_finished()
    }
}

pub struct Watcher {
    store: Arc<dyn Store>,
    brain: Brain,
    retrier: Retrier,
    wait: Duration,
    views: HashMap<Dependency, ViewSlot>,
    next_serial: u64,
    changes_tx: UnboundedSender<ChangeMsg>,
    changes_rx: UnboundedReceiver<ChangeMsg>,
    errors_tx: UnboundedSender<ErrorMsg>,
    errors_rx: UnboundedReceiver<ErrorMsg>,
    stopped: bool,
}

impl Watcher {
    pub fn new(store: Arc<dyn Store>, brain: Brain, retrier: Retrier, wait: Duration) -> Self {
        let (changes_tx, changes_rx) = mpsc::unbounded_channel();
        let (errors_tx, errors_rx) = mpsc::unbounded_channel();
        Self {
            store,
            brain,
            retrier,
            wait,
            views: HashMap::new(),
            next_serial: 0,
            changes_tx,
            changes_rx,
            errors_tx,
            errors_rx,
            stopped: false,
        }
    }

    /// Retry policy and block wait for Views started from now on.
    pub fn set_policy(&mut self, retrier: Retrier, wait: Duration) {
        self.retrier = retrier;
        self.wait = wait;
    }

    fn spawn_view(&mut self, dependency: &Dependency, refs: usize) -> ViewSlot {
        self.next_serial += 1;
        let token = CancellationToken::new();
        let gave_up = Arc::new(AtomicBool::new(false));
        let view = View {
            dependency: dependency.clone(),
            serial: self.next_serial,
            store: Arc::clone(&self.store),
            brain: self.brain.clone(),
            retrier: self.retrier.clone(),
            wait: self.wait,
            changes: self.changes_tx.clone(),
            errors: self.errors_tx.clone(),
            gave_up: Arc::clone(&gave_up),
        };
        let task = tokio::spawn(view.run(token.clone()));
        ViewSlot {
            refs,
            serial: self.next_serial,
            token,
            task,
            gave_up,
        }
    }

    fn restart(&mut self, dependency: &Dependency) {
        let refs = self.views.get(dependency).map_or(1, |slot| slot.refs);
        let slot = self.spawn_view(dependency, refs);
        if let Some(old) = self.views.insert(dependency.clone(), slot) {
            old.halt();
        }
    }

    /// Reference `dependency`, starting a View if none is running.
    ///
    /// Returns true when a View was started. A View that gave up after
    /// exhausting retries is restarted, even if its task has not exited yet.
    pub fn add(&mut self, dependency: &Dependency) -> bool {
        if self.stopped {
            warn!(dependency = %dependency, "watcher stopped, ignoring add");
            return false;
        }

        if let Some(slot) = self.views.get_mut(dependency) {
            slot.refs += 1;
            if !slot.needs_restart() {
                return false;
            }
            debug!(dependency = %dependency, "restarting failed view");
            self.restart(dependency);
            return true;
        }

        let slot = self.spawn_view(dependency, 1);
        self.views.insert(dependency.clone(), slot);
        debug!(dependency = %dependency, views = self.views.len(), "watching");
        true
    }

    /// Drop one reference to `dependency`. The last reference stops the View
    /// and forgets its value. Returns true when the View was stopped.
    pub fn remove(&mut self, dependency: &Dependency) -> bool {
        let Some(slot) = self.views.get_mut(dependency) else {
            return false;
        };
        slot.refs = slot.refs.saturating_sub(1);
        if slot.refs > 0 {
            return false;
        }

        if let Some(slot) = self.views.remove(dependency) {
            slot.halt();
        }
        self.brain.forget(dependency);
        debug!(dependency = %dependency, views = self.views.len(), "stopped watching");
        true
    }

    /// Restart every View that gave up. Returns how many.
    pub fn revive(&mut self) -> usize {
        if self.stopped {
            return 0;
        }
        let finished: Vec<Dependency> = self
            .views
            .iter()
            .filter(|(_, slot)| slot.needs_restart())
            .map(|(dependency, _)| dependency.clone())
            .collect();
        for dependency in &finished {
            self.restart(dependency);
        }
        if !finished.is_empty() {
            info!(count = finished.len(), "restarted failed views");
        }
        finished.len()
    }

    fn is_current(&self, dependency: &Dependency, serial: u64) -> bool {
        self.views
            .get(dependency)
            .is_some_and(|slot| slot.serial == serial)
    }

    /// Next notification from a live View. Changes are preferred over errors
    /// when both are pending. Returns `None` once stopped and drained.
    pub async fn next(&mut self) -> Option<WatchEvent> {
        loop {
            let (serial, event) = tokio::select! {
                biased;
                Some((serial, dependency)) = self.changes_rx.recv() => {
                    (serial, WatchEvent::Changed(dependency))
                }
                Some((serial, dependency, error)) = self.errors_rx.recv() => {
                    (serial, WatchEvent::Failed { dependency, error })
                }
                else => return None,
            };
            let dependency = match &event {
                WatchEvent::Changed(dependency) | WatchEvent::Failed { dependency, .. } => {
                    dependency
                }
            };
            if self.is_current(dependency, serial) {
                return Some(event);
            }
        }
    }

    /// Stop every View and wait for them to exit. Notifications already
    /// queued can still be drained with [`next`](Self::next). Idempotent.
    pub async fn stop(&mut self) {
        if self.stopped {
            return;
        }
        self.stopped = true;

        for slot in self.views.values() {
            slot.token.cancel();
        }
        for (dependency, slot) in self.views.iter_mut() {
            if let Err(e) = (&mut slot.task).await {
                if !e.is_cancelled() {
                    warn!(dependency = %dependency, error = %e, "view task failed");
                }
            }
        }
        self.changes_rx.close();
        self.errors_rx.close();
        info!(views = self.views.len(), "watcher stopped");
    }

    pub fn is_stopped(&self) -> bool {
        self.stopped
    }

    /// Number of tracked dependencies, each with exactly one View.
    pub fn view_count(&self) -> usize {
        self.views.len()
    }

    pub fn references(&self, dependency: &Dependency) -> usize {
        self.views.get(dependency).map_or(0, |slot| slot.refs)
    }

    pub fn is_watching(&self, dependency: &Dependency) -> bool {
        self.views.contains_key(dependency)
    }

    pub fn brain(&self) -> &Brain {
        &self.brain
    }
}

impl Drop for Watcher {
    fn drop(&mut self) {
        for slot in self.views.values() {
            slot.halt();
        }
    }
}
