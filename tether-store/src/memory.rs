//! In-process [`Store`] with Consul-like blocking semantics.
//!
//! The store keeps one global index, bumped by every mutation. A blocking
//! read returns as soon as the index moves past `since`, or after `wait` with
//! the current value and an unchanged index. Reads can be made to fail for a
//! dependency, and every read is counted so callers can observe how many
//! watches are open against a dependency.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::watch;
use tokio::time::Instant;

use tether_core::{Dependency, DependencyValue, KeyPair, ServiceInstance};

use crate::error::StoreError;
use crate::store::{ReadResult, Store};

#[derive(Debug, Default)]
struct State {
    index: u64,
    keys: BTreeMap<String, String>,
    services: HashMap<String, Vec<ServiceInstance>>,
    /// Remaining injected failures; `None` fails until `recover`.
    failures: HashMap<Dependency, Option<u32>>,
    reads: HashMap<Dependency, usize>,
    active: HashMap<Dependency, usize>,
}

struct Inner {
    state: Mutex<State>,
    index_tx: watch::Sender<u64>,
}

#[derive(Clone)]
pub struct MemoryStore {
    inner: Arc<Inner>,
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryStore {
    pub fn new() -> Self {
        let (index_tx, _) = watch::channel(1);
        Self {
            inner: Arc::new(Inner {
                state: Mutex::new(State {
                    index: 1,
                    ..State::default()
                }),
                index_tx,
            }),
        }
    }

    fn state(&self) -> MutexGuard<'_, State> {
        self.inner
            .state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    fn mutate(&self, f: impl FnOnce(&mut State)) -> u64 {
        let index = {
            let mut state = self.state();
            f(&mut state);
            state.index += 1;
            state.index
        };
        self.inner.index_tx.send_replace(index);
        index
    }

    /// Set a key; returns the new store index.
    pub fn set_key(&self, path: &str, value: &str) -> u64 {
        let path = path.trim_matches('/').to_owned();
        let value = value.to_owned();
        self.mutate(move |state| {
            state.keys.insert(path, value);
        })
    }

    pub fn delete_key(&self, path: &str) -> u64 {
        let path = path.trim_matches('/').to_owned();
        self.mutate(move |state| {
            state.keys.remove(&path);
        })
    }

    /// Replace the healthy instances of a service.
    pub fn set_service(&self, name: &str, instances: Vec<ServiceInstance>) -> u64 {
        let name = name.to_owned();
        self.mutate(move |state| {
            state.services.insert(name, instances);
        })
    }

    /// Advance the index without changing any data.
    pub fn touch(&self) -> u64 {
        self.mutate(|_| {})
    }

    pub fn index(&self) -> u64 {
        self.state().index
    }

    /// Make reads of `dependency` fail: `times` reads, or every read when `None`.
    pub fn fail(&self, dependency: &Dependency, times: Option<u32>) {
        self.state().failures.insert(dependency.clone(), times);
    }

    pub fn recover(&self, dependency: &Dependency) {
        self.state().failures.remove(dependency);
    }

    /// Total reads issued for `dependency`, failed ones included.
    pub fn reads(&self, dependency: &Dependency) -> usize {
        self.state().reads.get(dependency).copied().unwrap_or(0)
    }

    /// Reads of `dependency` currently blocked inside the store.
    pub fn active_reads(&self, dependency: &Dependency) -> usize {
        self.state().active.get(dependency).copied().unwrap_or(0)
    }

    fn begin_read(&self, dependency: &Dependency) -> Result<ActiveRead, StoreError> {
        let mut state = self.state();
        *state.reads.entry(dependency.clone()).or_default() += 1;

        let fails = match state.failures.get(dependency).copied() {
            None => false,
            Some(None) => true,
            Some(Some(0)) => {
                state.failures.remove(dependency);
                false
            }
            Some(Some(n)) => {
                state.failures.insert(dependency.clone(), Some(n - 1));
                true
            }
        };
        if fails {
            return Err(StoreError::Transport(format!(
                "injected failure for {dependency}"
            )));
        }

        *state.active.entry(dependency.clone()).or_default() += 1;
        Ok(ActiveRead {
            store: self.clone(),
            dependency: dependency.clone(),
        })
    }

    fn current(&self, dependency: &Dependency) -> ReadResult {
        let state = self.state();
        ReadResult {
            value: resolve(&state, dependency),
            index: state.index,
        }
    }
}

fn resolve(state: &State, dependency: &Dependency) -> DependencyValue {
    match dependency {
        Dependency::Key { path } => DependencyValue::Key(state.keys.get(path).cloned()),
        Dependency::KeyPrefix { prefix } => DependencyValue::KeyPrefix(
            state
                .keys
                .range(prefix.clone()..)
                .take_while(|(k, _)| k.starts_with(prefix.as_str()))
                .filter(|(k, _)| k.len() > prefix.len())
                .map(|(k, v)| KeyPair {
                    key: k[prefix.len()..].to_owned(),
                    value: v.clone(),
                })
                .collect(),
        ),
        Dependency::Service { name, tag } => DependencyValue::Service(
            state
                .services
                .get(name)
                .map(|instances| {
                    instances
                        .iter()
                        .filter(|i| tag.as_ref().map_or(true, |t| i.tags.contains(t)))
                        .cloned()
                        .collect()
                })
                .unwrap_or_default(),
        ),
    }
}

/// Decrements the active-read count when the read finishes or is dropped.
struct ActiveRead {
    store: MemoryStore,
    dependency: Dependency,
}

impl Drop for ActiveRead {
    fn drop(&mut self) {
        let mut state = self.store.state();
        if let Some(count) = state.active.get_mut(&self.dependency) {
            *count = count.saturating_sub(1);
            if *count == 0 {
                state.active.remove(&self.dependency);
            }
        }
    }
}

#[async_trait]
impl Store for MemoryStore {
    async fn blocking_read(
        &self,
        dependency: &Dependency,
        since: u64,
        wait: Duration,
    ) -> Result<ReadResult, StoreError> {
        let _active = self.begin_read(dependency)?;
        // Subscribe before the first check so no bump between check and wait is lost.
        let mut changes = self.inner.index_tx.subscribe();
        // No deadline when `wait` does not fit in an Instant.
        let deadline = Instant::now().checked_add(wait);

        loop {
            let result = self.current(dependency);
            if since == 0 || result.index > since {
                return Ok(result);
            }
            let changed = match deadline {
                Some(deadline) => tokio::time::timeout_at(deadline, changes.changed())
                    .await
                    .ok(),
                None => Some(changes.changed().await),
            };
            match changed {
                Some(Ok(())) => continue,
                Some(Err(_)) | None => return Ok(self.current(dependency)),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const WAIT: Duration = Duration::from_secs(30);

    #[tokio::test(start_paused = true)]
    async fn zero_since_returns_immediately() {
        let store = MemoryStore::new();
        let read = store
            .blocking_read(&Dependency::key("foo"), 0, WAIT)
            .await
            .expect("read");
        assert_eq!(read.value, DependencyValue::Key(None));
        assert_eq!(read.index, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn blocks_until_index_moves() {
        let store = MemoryStore::new();
        let dep = Dependency::key("foo");
        let since = store.index();

        let reader = {
            let store = store.clone();
            let dep = dep.clone();
            tokio::spawn(async move { store.blocking_read(&dep, since, WAIT).await })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(store.active_reads(&dep), 1);

        store.set_key("foo", "bar");
        let read = reader.await.expect("join").expect("read");
        assert_eq!(read.value, DependencyValue::Key(Some("bar".into())));
        assert!(read.index > since);
        assert_eq!(store.active_reads(&dep), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn timeout_returns_same_index() {
        let store = MemoryStore::new();
        let dep = Dependency::key("foo");
        let since = store.index();

        let started = Instant::now();
        let read = store.blocking_read(&dep, since, WAIT).await.expect("read");
        assert_eq!(read.index, since);
        assert!(started.elapsed() >= WAIT);
    }

    #[tokio::test(start_paused = true)]
    async fn unrepresentable_wait_still_wakes_on_change() {
        let store = MemoryStore::new();
        let dep = Dependency::key("foo");
        let since = store.index();

        let reader = {
            let store = store.clone();
            let dep = dep.clone();
            tokio::spawn(async move { store.blocking_read(&dep, since, Duration::MAX).await })
        };
        tokio::time::sleep(Duration::from_secs(3600)).await;
        assert_eq!(store.active_reads(&dep), 1);

        store.set_key("foo", "bar");
        let read = reader.await.expect("join").expect("read");
        assert_eq!(read.value, DependencyValue::Key(Some("bar".into())));
    }

    #[tokio::test]
    async fn injected_failures_count_down() {
        let store = MemoryStore::new();
        let dep = Dependency::key("foo");
        store.fail(&dep, Some(2));

        assert!(store.blocking_read(&dep, 0, WAIT).await.is_err());
        assert!(store.blocking_read(&dep, 0, WAIT).await.is_err());
        assert!(store.blocking_read(&dep, 0, WAIT).await.is_ok());
        assert_eq!(store.reads(&dep), 3);
    }

    #[test]
    fn prefix_and_service_resolution() {
        let store = MemoryStore::new();
        store.set_key("app/port", "8080");
        store.set_key("app/db/host", "db");
        store.set_key("apple", "no");
        store.set_service(
            "web",
            vec![
                ServiceInstance {
                    id: "web-1".into(),
                    name: "web".into(),
                    node: "n1".into(),
                    address: "10.0.0.1".into(),
                    port: 80,
                    tags: vec!["canary".into()],
                },
                ServiceInstance {
                    id: "web-2".into(),
                    name: "web".into(),
                    node: "n2".into(),
                    address: "10.0.0.2".into(),
                    port: 80,
                    tags: vec![],
                },
            ],
        );

        let state = store.state();
        match resolve(&state, &Dependency::key_prefix("app/")) {
            DependencyValue::KeyPrefix(pairs) => {
                let keys: Vec<_> = pairs.iter().map(|p| p.key.as_str()).collect();
                assert_eq!(keys, vec!["db/host", "port"]);
            }
            other => panic!("unexpected value: {other:?}"),
        }
        match resolve(&state, &Dependency::service("web", Some("canary"))) {
            DependencyValue::Service(instances) => {
                assert_eq!(instances.len(), 1);
                assert_eq!(instances[0].id, "web-1");
            }
            other => panic!("unexpected value: {other:?}"),
        }
    }
}
