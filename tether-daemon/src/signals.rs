//! OS signals as Runner lifecycle events.
//!
//! | Signal                               | Event       |
//! |--------------------------------------|-------------|
//! | `reload_signal` (default `SIGHUP`)   | `Reload`    |
//! | `kill_signal` (default `SIGINT`)     | `Kill`      |
//! | `SIGINT`, `SIGTERM` when not mapped  | `Interrupt` |

use tokio::task::JoinHandle;
use tracing::info;

use tether_core::SignalName;

use crate::error::DaemonError;
use crate::runner::{Lifecycle, RunnerHandle};

/// Signal name to event mapping. The first mapping for a name wins.
pub fn mapping(reload: &SignalName, kill: &SignalName) -> Vec<(String, Lifecycle)> {
    let mut mapping: Vec<(String, Lifecycle)> = Vec::new();
    let candidates = [
        (reload.as_str(), Lifecycle::Reload),
        (kill.as_str(), Lifecycle::Kill),
        ("SIGINT", Lifecycle::Interrupt),
        ("SIGTERM", Lifecycle::Interrupt),
    ];
    for (name, event) in candidates {
        if !mapping.iter().any(|(mapped, _)| mapped == name) {
            mapping.push((name.to_owned(), event));
        }
    }
    mapping
}

/// Forwards signals to a Runner until dropped.
#[derive(Debug)]
pub struct SignalForwarder {
    tasks: Vec<JoinHandle<()>>,
}

impl SignalForwarder {
    #[cfg(unix)]
    pub fn install(
        reload: &SignalName,
        kill: &SignalName,
        handle: RunnerHandle,
    ) -> Result<Self, DaemonError> {
        use tokio::signal::unix::signal;

        let mut tasks = Vec::new();
        for (name, event) in mapping(reload, kill) {
            let Some(kind) = unix::kind(&name) else {
                continue;
            };
            let mut stream = signal(kind).map_err(|e| DaemonError::Io {
                path: format!("signal:{name}").into(),
                source: e,
            })?;
            let handle = handle.clone();
            tasks.push(tokio::spawn(async move {
                while stream.recv().await.is_some() {
                    info!(signal = %name, ?event, "received signal");
                    if !handle.send(event) {
                        break;
                    }
                }
            }));
        }
        Ok(Self { tasks })
    }

    #[cfg(not(unix))]
    pub fn install(
        _reload: &SignalName,
        _kill: &SignalName,
        handle: RunnerHandle,
    ) -> Result<Self, DaemonError> {
        let task = tokio::spawn(async move {
            while tokio::signal::ctrl_c().await.is_ok() {
                info!("received ctrl-c");
                if !handle.send(Lifecycle::Interrupt) {
                    break;
                }
            }
        });
        Ok(Self { tasks: vec![task] })
    }
}

impl Drop for SignalForwarder {
    fn drop(&mut self) {
        for task in &self.tasks {
            task.abort();
        }
    }
}

#[cfg(unix)]
mod unix {
    use tokio::signal::unix::SignalKind;

    pub(super) fn kind(name: &str) -> Option<SignalKind> {
        Some(match name {
            "SIGHUP" => SignalKind::hangup(),
            "SIGINT" => SignalKind::interrupt(),
            "SIGQUIT" => SignalKind::quit(),
            "SIGTERM" => SignalKind::terminate(),
            "SIGUSR1" => SignalKind::user_defined1(),
            "SIGUSR2" => SignalKind::user_defined2(),
            _ => return None,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn name(s: &str) -> SignalName {
        s.parse().expect("signal name")
    }

    #[test]
    fn default_mapping() {
        let mapping = mapping(&name("SIGHUP"), &name("SIGINT"));
        assert_eq!(
            mapping,
            vec![
                ("SIGHUP".to_owned(), Lifecycle::Reload),
                ("SIGINT".to_owned(), Lifecycle::Kill),
                ("SIGTERM".to_owned(), Lifecycle::Interrupt),
            ]
        );
    }

    #[test]
    fn custom_signals_leave_interrupt_defaults() {
        let mapping = mapping(&name("SIGUSR1"), &name("SIGUSR2"));
        assert!(mapping.contains(&("SIGUSR1".to_owned(), Lifecycle::Reload)));
        assert!(mapping.contains(&("SIGUSR2".to_owned(), Lifecycle::Kill)));
        assert!(mapping.contains(&("SIGINT".to_owned(), Lifecycle::Interrupt)));
        assert!(mapping.contains(&("SIGTERM".to_owned(), Lifecycle::Interrupt)));
    }

    #[test]
    fn reload_wins_when_names_collide() {
        let mapping = mapping(&name("SIGHUP"), &name("SIGHUP"));
        assert_eq!(mapping[0], ("SIGHUP".to_owned(), Lifecycle::Reload));
        assert_eq!(mapping.len(), 3);
    }
}
