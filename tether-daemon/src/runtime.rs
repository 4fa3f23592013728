use std::sync::Arc;

use tether_core::Config;
use tether_store::{ConsulStore, Store};
use tether_sync::{DrySink, FileSink, OutputSink};

use crate::error::{io_err, DaemonError};
use crate::pid::PidFile;
use crate::runner::{ConfigSource, RunOutcome, Runner};
use crate::signals::SignalForwarder;

/// Start the daemon and block the current thread until it exits.
pub fn start_blocking(
    config: Config,
    source: impl ConfigSource + 'static,
) -> Result<RunOutcome, DaemonError> {
    init_tracing(&config.log_level, config.log_json);
    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .map_err(|e| io_err("tokio-runtime", e))?;
    runtime.block_on(run(config, Box::new(source)))
}

/// Wire the Consul store, output sink, pid file and signals, then run.
pub async fn run(config: Config, source: Box<dyn ConfigSource>) -> Result<RunOutcome, DaemonError> {
    config.validate()?;
    let _pid = config.pid_file.as_deref().map(PidFile::create).transpose()?;

    let store: Arc<dyn Store> = Arc::new(ConsulStore::new(&config.consul)?);
    let sink: Box<dyn OutputSink> = if config.dry {
        Box::new(DrySink::stdout())
    } else {
        Box::new(FileSink::new())
    };
    tracing::info!(address = %config.consul.address, "connecting to consul");

    let reload_signal = config.reload_signal.clone();
    let kill_signal = config.kill_signal.clone();
    let runner = Runner::new(config, store, sink, source)?;
    let _signals = SignalForwarder::install(&reload_signal, &kill_signal, runner.handle())?;

    runner.run().await
}

/// Install the global subscriber. `RUST_LOG` wins over `level`; logs go to
/// stderr so dry-run output on stdout stays clean.
pub fn init_tracing(level: &str, json: bool) {
    use tracing_subscriber::{fmt, EnvFilter};

    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(level.to_ascii_lowercase()))
        .unwrap_or_else(|_| EnvFilter::new("info"));
    let builder = fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr);
    let _ = if json {
        builder.json().try_init()
    } else {
        builder.try_init()
    };
}
