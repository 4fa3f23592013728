//! Top-level reconciliation loop.
//!
//! The Runner owns the templates, the Watcher and the output sink, and is the
//! only place their state changes. One `select!` multiplexes lifecycle
//! events, Watcher notifications and the earliest quiescence deadline.
//!
//! ## Render procedure (per fired template)
//!
//! 1. Disarm the quiescence timer.
//! 2. Skip if a tracked dependency has never been received.
//! 3. Render against the Brain snapshot.
//! 4. Reconcile the tracked dependency set with what the render touched.
//! 5. `NotReady`: stop here. `Ready`: hand the contents to the sink.
//! 6. Run the template's command if the destination was written.

use std::collections::BTreeSet;
use std::sync::Arc;

use tokio::sync::{mpsc, watch};
use tokio::time::Instant;
use tracing::{debug, error, info};

use tether_core::{Config, ConfigError, Dependency, Retrier, TemplateConfig, Values};
use tether_renderer::{RenderOutcome, Template};
use tether_store::Store;
use tether_sync::{OutputSink, WriteRequest, WriteResult};

use crate::brain::Brain;
use crate::error::{DaemonError, ReloadError};
use crate::exec::run_command;
use crate::quiescence::Quiescence;
use crate::watcher::{WatchEvent, Watcher};

/// Lifecycle event, delivered by signals or a [`RunnerHandle`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Lifecycle {
    Reload,
    Kill,
    Interrupt,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunnerState {
    Idle,
    /// At least one template's quiescence timer is armed.
    Waiting,
    Rendering,
    Stopped,
}

/// How a run ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunOutcome {
    /// Once mode: every template rendered.
    Completed,
    /// Kill event or [`RunnerHandle::stop`].
    Stopped,
    Interrupted,
}

/// Produces a fresh configuration on reload.
pub trait ConfigSource: Send {
    fn load(&mut self) -> Result<Config, ConfigError>;
}

impl<F> ConfigSource for F
where
    F: FnMut() -> Result<Config, ConfigError> + Send,
{
    fn load(&mut self) -> Result<Config, ConfigError> {
        self()
    }
}

/// Control surface for a running [`Runner`].
#[derive(Debug, Clone)]
pub struct RunnerHandle {
    events: mpsc::UnboundedSender<Lifecycle>,
    state: watch::Receiver<RunnerState>,
}

impl RunnerHandle {
    /// Deliver `event`; false once the Runner is gone.
    pub fn send(&self, event: Lifecycle) -> bool {
        self.events.send(event).is_ok()
    }

    pub fn stop(&self) -> bool {
        self.send(Lifecycle::Kill)
    }

    pub fn reload(&self) -> bool {
        self.send(Lifecycle::Reload)
    }

    pub fn state(&self) -> RunnerState {
        *self.state.borrow()
    }

    pub fn subscribe(&self) -> watch::Receiver<RunnerState> {
        self.state.clone()
    }
}

struct TemplateState {
    config: TemplateConfig,
    template: Template,
    quiescence: Quiescence,
    /// Dependencies referenced with the Watcher on this template's behalf.
    tracked: BTreeSet<Dependency>,
    renders: u64,
}

impl TemplateState {
    fn id(&self) -> &str {
        self.template.name()
    }
}

fn compile_templates(config: &Config) -> Result<Vec<TemplateState>, tether_renderer::RenderError> {
    config
        .templates
        .iter()
        .map(|tc| {
            Ok(TemplateState {
                template: Template::compile(tc)?,
                quiescence: Quiescence::new(tc.effective_wait(&config.wait)),
                config: tc.clone(),
                tracked: BTreeSet::new(),
                renders: 0,
            })
        })
        .collect()
}

/// Settings that cannot change for the lifetime of a run.
fn pin_fixed(mut fresh: Config, current: &Config) -> Config {
    fresh.consul = current.consul.clone();
    fresh.once = current.once;
    fresh.dry = current.dry;
    fresh.pid_file = current.pid_file.clone();
    fresh.kill_signal = current.kill_signal.clone();
    fresh.reload_signal = current.reload_signal.clone();
    fresh.log_level = current.log_level.clone();
    fresh.log_json = current.log_json;
    fresh
}

enum Step {
    Lifecycle(Option<Lifecycle>),
    Watch(Option<WatchEvent>),
    Tick,
}

async fn sleep_until(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

pub struct Runner {
    config: Config,
    source: Box<dyn ConfigSource>,
    sink: Box<dyn OutputSink>,
    brain: Brain,
    watcher: Watcher,
    templates: Vec<TemplateState>,
    events_tx: mpsc::UnboundedSender<Lifecycle>,
    events_rx: mpsc::UnboundedReceiver<Lifecycle>,
    state_tx: watch::Sender<RunnerState>,
}

impl Runner {
    /// Validate `config` and compile its templates. Nothing is watched until
    /// [`run`](Self::run).
    pub fn new(
        config: Config,
        store: Arc<dyn Store>,
        sink: Box<dyn OutputSink>,
        source: Box<dyn ConfigSource>,
    ) -> Result<Self, DaemonError> {
        config.validate()?;
        let templates = compile_templates(&config)?;

        let brain = Brain::new();
        let watcher = Watcher::new(
            store,
            brain.clone(),
            Retrier::from_config(&config.consul.retry),
            config.block_query_wait,
        );
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let (state_tx, _) = watch::channel(RunnerState::Idle);

        Ok(Self {
            config,
            source,
            sink,
            brain,
            watcher,
            templates,
            events_tx,
            events_rx,
            state_tx,
        })
    }

    pub fn handle(&self) -> RunnerHandle {
        RunnerHandle {
            events: self.events_tx.clone(),
            state: self.state_tx.subscribe(),
        }
    }

    pub fn brain(&self) -> &Brain {
        &self.brain
    }

    fn set_state(&self, state: RunnerState) {
        self.state_tx.send_if_modified(|current| {
            let changed = *current != state;
            *current = state;
            changed
        });
    }

    /// Run until once-mode completion, a kill/interrupt event, or a fatal
    /// error. The Watcher is stopped before returning in every case.
    pub async fn run(mut self) -> Result<RunOutcome, DaemonError> {
        info!(
            templates = self.templates.len(),
            once = self.config.once,
            dry = self.config.dry,
            "runner starting",
        );
        let result = self.run_loop().await;

        self.set_state(RunnerState::Stopped);
        self.watcher.stop().await;
        match &result {
            Ok(outcome) => info!(?outcome, "runner stopped"),
            Err(e) => error!(error = %e, "runner failed"),
        }
        result
    }

    async fn run_loop(&mut self) -> Result<RunOutcome, DaemonError> {
        self.render_all().await?;

        loop {
            self.fire_ready().await?;
            if self.completed() {
                info!("all templates rendered, exiting (once mode)");
                return Ok(RunOutcome::Completed);
            }

            let deadline = self
                .templates
                .iter()
                .filter_map(|t| t.quiescence.deadline())
                .min();
            self.set_state(if deadline.is_some() {
                RunnerState::Waiting
            } else {
                RunnerState::Idle
            });

            let step = tokio::select! {
                biased;
                event = self.events_rx.recv() => Step::Lifecycle(event),
                event = self.watcher.next() => Step::Watch(event),
                _ = sleep_until(deadline) => Step::Tick,
            };

            match step {
                Step::Lifecycle(Some(Lifecycle::Reload)) => self.reload().await?,
                Step::Lifecycle(Some(Lifecycle::Kill)) | Step::Lifecycle(None) => {
                    info!("stop requested");
                    return Ok(RunOutcome::Stopped);
                }
                Step::Lifecycle(Some(Lifecycle::Interrupt)) => {
                    info!("interrupted");
                    return Ok(RunOutcome::Interrupted);
                }
                Step::Watch(Some(WatchEvent::Changed(dependency))) => self.on_change(&dependency),
                Step::Watch(Some(WatchEvent::Failed { dependency, error })) => {
                    error!(dependency = %dependency, error = %error, "dependency watch failed");
                    if self.config.once && self.blocks_completion(&dependency) {
                        return Err(DaemonError::Dependency {
                            dependency,
                            source: error,
                        });
                    }
                }
                Step::Watch(None) => return Err(DaemonError::ChannelClosed("watcher")),
                Step::Tick => {}
            }
        }
    }

    fn completed(&self) -> bool {
        self.config.once && self.templates.iter().all(|t| t.renders > 0)
    }

    /// Whether a template that has not rendered yet depends on `dependency`.
    fn blocks_completion(&self, dependency: &Dependency) -> bool {
        self.templates
            .iter()
            .any(|t| t.renders == 0 && t.tracked.contains(dependency))
    }

    fn on_change(&mut self, dependency: &Dependency) {
        let now = Instant::now();
        for t in &mut self.templates {
            if t.tracked.contains(dependency) {
                t.quiescence.observe(now);
                debug!(template = %t.id(), dependency = %dependency, "change observed");
            }
        }
    }

    /// Render every template now, regardless of quiescence. Used at start and
    /// after reload so each template discovers its dependencies.
    async fn render_all(&mut self) -> Result<(), DaemonError> {
        let snapshot = Arc::new(self.brain.snapshot());
        for i in 0..self.templates.len() {
            self.fire(i, &snapshot).await?;
        }
        Ok(())
    }

    async fn fire_ready(&mut self) -> Result<(), DaemonError> {
        let now = Instant::now();
        let ready: Vec<usize> = self
            .templates
            .iter()
            .enumerate()
            .filter(|(_, t)| t.quiescence.ready(now))
            .map(|(i, _)| i)
            .collect();
        if ready.is_empty() {
            return Ok(());
        }
        let snapshot = Arc::new(self.brain.snapshot());
        for i in ready {
            self.fire(i, &snapshot).await?;
        }
        Ok(())
    }

    /// Errors are fatal only in once mode; otherwise they are reported and
    /// the template waits for its next change.
    async fn fire(&mut self, i: usize, snapshot: &Arc<Values>) -> Result<(), DaemonError> {
        match self.render_one(i, snapshot).await {
            Err(e) if !self.config.once => {
                error!(template = %self.templates[i].id(), error = %e, "render cycle failed");
                Ok(())
            }
            other => other,
        }
    }

    async fn render_one(&mut self, i: usize, snapshot: &Arc<Values>) -> Result<(), DaemonError> {
        self.set_state(RunnerState::Rendering);
        let t = &mut self.templates[i];
        t.quiescence.reset();

        if let Some(missing) = t.tracked.iter().find(|d| !snapshot.contains_key(*d)) {
            debug!(template = %t.id(), dependency = %missing, "not ready, skipping render");
            return Ok(());
        }

        let outcome = match t.template.render(Arc::clone(snapshot)) {
            Ok(outcome) => outcome,
            Err(source) => {
                // Keep watching what the failed render touched so a later
                // change can fix it.
                if let Some(dependencies) = source.dependencies() {
                    reconcile(&mut self.watcher, &mut t.tracked, dependencies);
                }
                return Err(DaemonError::Render {
                    template: t.id().to_owned(),
                    source,
                });
            }
        };
        reconcile(&mut self.watcher, &mut t.tracked, outcome.dependencies());

        let contents = match outcome {
            RenderOutcome::NotReady { missing, .. } => {
                debug!(template = %t.id(), missing = missing.len(), "waiting for dependencies");
                return Ok(());
            }
            RenderOutcome::Ready { contents, .. } => contents,
        };

        let result = self
            .sink
            .write(&WriteRequest {
                destination: &t.config.destination,
                contents: &contents,
                perms: t.config.perms,
                backup: t.config.backup,
            })
            .map_err(|source| DaemonError::Output {
                template: t.id().to_owned(),
                source,
            })?;
        t.renders += 1;

        if let (WriteResult::Written { .. }, Some(command)) = (&result, &t.config.command) {
            info!(template = %t.id(), command = %command, "running command");
            let output = run_command(command, t.config.command_timeout)
                .await
                .map_err(|source| DaemonError::Command {
                    template: t.id().to_owned(),
                    source,
                })?;
            if !output.is_empty() {
                info!(template = %t.id(), output = %output.trim_end(), "command output");
            }
        }
        debug!(template = %t.id(), result = ?result, "render complete");
        Ok(())
    }

    async fn reload(&mut self) -> Result<(), DaemonError> {
        info!("reloading configuration");
        let (config, templates) = match self.prepare_reload() {
            Ok(prepared) => prepared,
            Err(e) if self.config.reload_fatal => return Err(DaemonError::Reload(e)),
            Err(e) => {
                error!(error = %e, "reload failed, keeping previous configuration");
                return Ok(());
            }
        };

        self.watcher.set_policy(
            Retrier::from_config(&config.consul.retry),
            config.block_query_wait,
        );
        let previous = std::mem::replace(&mut self.templates, templates);
        self.config = config;

        // New references first so entries still in use survive the removals.
        self.render_all().await?;
        for t in previous {
            for dependency in &t.tracked {
                self.watcher.remove(dependency);
            }
        }
        self.watcher.revive();

        info!(
            templates = self.templates.len(),
            views = self.watcher.view_count(),
            "reload complete",
        );
        Ok(())
    }

    fn prepare_reload(&mut self) -> Result<(Config, Vec<TemplateState>), ReloadError> {
        let config = pin_fixed(self.source.load()?, &self.config);
        config.validate()?;
        let templates = compile_templates(&config)?;
        Ok((config, templates))
    }
}

/// Make `tracked` equal `wanted`, adding and removing Watcher references.
fn reconcile(watcher: &mut Watcher, tracked: &mut BTreeSet<Dependency>, wanted: &BTreeSet<Dependency>) {
    if tracked == wanted {
        return;
    }
    for dependency in wanted.difference(tracked) {
        watcher.add(dependency);
    }
    for dependency in tracked.difference(wanted) {
        watcher.remove(dependency);
    }
    *tracked = wanted.clone();
}

impl std::fmt::Debug for Runner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Runner")
            .field("templates", &self.templates.len())
            .field("views", &self.watcher.view_count())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use tether_store::MemoryStore;

    fn template(destination: &str, contents: &str) -> TemplateConfig {
        TemplateConfig {
            contents: Some(contents.to_owned()),
            destination: destination.into(),
            ..TemplateConfig::default()
        }
    }

    #[test]
    fn pin_fixed_keeps_connection_and_modes() {
        let mut current = Config::default();
        current.consul.address = "consul:8500".into();
        current.once = true;
        current.dry = true;

        let mut fresh = Config::default();
        fresh.consul.address = "elsewhere:8500".into();
        fresh.block_query_wait = Duration::from_secs(5);

        let pinned = pin_fixed(fresh, &current);
        assert_eq!(pinned.consul.address, "consul:8500");
        assert!(pinned.once && pinned.dry);
        assert_eq!(pinned.block_query_wait, Duration::from_secs(5));
    }

    #[tokio::test(start_paused = true)]
    async fn reconcile_adds_and_removes_references() {
        let store = MemoryStore::new();
        let mut watcher = Watcher::new(
            Arc::new(store),
            Brain::new(),
            Retrier::disabled(),
            Duration::from_secs(60),
        );
        let a = Dependency::key("a");
        let b = Dependency::key("b");
        let mut tracked = BTreeSet::new();

        reconcile(&mut watcher, &mut tracked, &BTreeSet::from([a.clone(), b.clone()]));
        assert_eq!(watcher.view_count(), 2);

        reconcile(&mut watcher, &mut tracked, &BTreeSet::from([b.clone()]));
        assert!(!watcher.is_watching(&a));
        assert_eq!(watcher.references(&b), 1);
        assert_eq!(tracked, BTreeSet::from([b]));
    }

    #[tokio::test]
    async fn invalid_config_is_rejected_up_front() {
        let mut config = Config::default();
        config.templates.push(template("out", "x"));
        config.templates.push(template("out", "y"));

        let err = Runner::new(
            config,
            Arc::new(MemoryStore::new()),
            Box::new(tether_sync::DrySink::new(Vec::new())),
            Box::new(|| Ok::<_, ConfigError>(Config::default())),
        )
        .unwrap_err();
        assert!(err.is_config(), "got: {err}");
    }

    #[tokio::test]
    async fn template_syntax_error_is_a_config_error() {
        let mut config = Config::default();
        config.templates.push(template("out", "{{ unclosed"));

        let err = Runner::new(
            config,
            Arc::new(MemoryStore::new()),
            Box::new(tether_sync::DrySink::new(Vec::new())),
            Box::new(|| Ok::<_, ConfigError>(Config::default())),
        )
        .unwrap_err();
        assert!(matches!(err, DaemonError::Template(_)), "got: {err}");
    }
}
