//! Long-poll loop for a single dependency.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc::UnboundedSender;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, trace, warn};

use tether_core::{Dependency, Retrier};
use tether_store::{ReadResult, Store};

use crate::brain::{Brain, Remembered};
use crate::error::ViewError;

/// Change notification: the View's serial and its dependency.
pub(crate) type ChangeMsg = (u64, Dependency);
/// Error notification, sent once right before the View stops.
pub(crate) type ErrorMsg = (u64, Dependency, ViewError);

pub(crate) struct View {
    pub dependency: Dependency,
    /// Distinguishes this View from earlier Views of the same dependency.
    pub serial: u64,
    pub store: Arc<dyn Store>,
    pub brain: Brain,
    pub retrier: Retrier,
    pub wait: Duration,
    pub changes: UnboundedSender<ChangeMsg>,
    pub errors: UnboundedSender<ErrorMsg>,
    /// Raised before the exhausted-retries error is sent.
    pub gave_up: Arc<AtomicBool>,
}

impl View {
    /// Poll until `stopped` fires or retries run out.
    pub async fn run(self, stopped: CancellationToken) {
        let dependency = &self.dependency;
        let mut index = 0u64;
        let mut attempt = 0u32;
        debug!(dependency = %dependency, "view started");

        loop {
            let read = tokio::select! {
                biased;
                _ = stopped.cancelled() => break,
                read = self.store.blocking_read(dependency, index, self.wait) => read,
            };

            match read {
                Ok(ReadResult {
                    value,
                    index: remote,
                }) => {
                    attempt = 0;
                    if remote == index && self.brain.contains(dependency) {
                        trace!(dependency = %dependency, index, "blocking read timed out");
                        continue;
                    }
                    // An index that goes backwards means the store was reset.
                    index = if remote < index { 0 } else { remote.max(1) };

                    match self.brain.remember(dependency, value, remote, &stopped) {
                        Remembered::Changed => {
                            debug!(dependency = %dependency, index = remote, "received update");
                            if self.changes.send((self.serial, dependency.clone())).is_err() {
                                break;
                            }
                        }
                        Remembered::Unchanged => {
                            trace!(dependency = %dependency, index = remote, "index moved, value unchanged");
                        }
                        Remembered::Cancelled => break,
                    }
                }
                Err(err) => match self.retrier.next(attempt) {
                    Some(delay) => {
                        attempt += 1;
                        warn!(
                            dependency = %dependency,
                            error = %err,
                            attempt,
                            delay_ms = delay.as_millis() as u64,
                            "blocking read failed, retrying",
                        );
                        tokio::select! {
                            biased;
                            _ = stopped.cancelled() => break,
                            _ = tokio::time::sleep(delay) => {}
                        }
                    }
                    None => {
                        error!(dependency = %dependency, error = %err, attempts = attempt, "giving up on dependency");
                        self.gave_up.store(true, Ordering::Release);
                        if !stopped.is_cancelled() {
                            let _ = self.errors.send((
                                self.serial,
                                dependency.clone(),
                                ViewError::ExhaustedRetries {
                                    attempts: attempt,
                                    source: err,
                                },
                            ));
                        }
                        break;
                    }
                },
            }
        }

        debug!(dependency = %dependency, "view stopped");
    }
}
