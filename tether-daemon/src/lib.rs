//! Watch-and-reconcile engine: Views long-poll the store, the Watcher fans
//! their updates in, and the Runner renders templates once changes settle.

pub mod brain;
mod error;
pub mod exec;
pub mod pid;
pub mod quiescence;
pub mod runner;
mod runtime;
pub mod signals;
mod view;
pub mod watcher;

pub use brain::{Brain, BrainEntry, Remembered};
pub use error::{DaemonError, ReloadError, ViewError};
pub use exec::CommandError;
pub use pid::PidFile;
pub use quiescence::Quiescence;
pub use runner::{ConfigSource, Lifecycle, RunOutcome, Runner, RunnerHandle, RunnerState};
pub use runtime::{init_tracing, run, start_blocking};
pub use signals::SignalForwarder;
pub use watcher::{WatchEvent, Watcher};
