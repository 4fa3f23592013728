//! Latest known value per dependency.
//!
//! Each entry is written only by the View that owns its dependency and read
//! by the Runner. A single lock guards the map so a reader always sees a
//! matching (value, index) pair.

use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

use chrono::{DateTime, Utc};
use tokio_util::sync::CancellationToken;

use tether_core::{Dependency, DependencyValue, Values};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BrainEntry {
    pub value: DependencyValue,
    pub index: u64,
    pub received_at: DateTime<Utc>,
}

/// Outcome of [`Brain::remember`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Remembered {
    /// First value for the dependency, or a different one.
    Changed,
    /// Same value; only the index was refreshed.
    Unchanged,
    /// The writing View was stopped; nothing was stored.
    Cancelled,
}

#[derive(Debug, Clone, Default)]
pub struct Brain {
    entries: Arc<RwLock<HashMap<Dependency, BrainEntry>>>,
}

impl Brain {
    pub fn new() -> Self {
        Self::default()
    }

    fn read(&self) -> RwLockReadGuard<'_, HashMap<Dependency, BrainEntry>> {
        self.entries.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, HashMap<Dependency, BrainEntry>> {
        self.entries.write().unwrap_or_else(PoisonError::into_inner)
    }

    /// Store `value` unless `stopped` has fired.
    ///
    /// The cancellation check happens under the write lock, so once a View
    /// is cancelled and its entry forgotten, it cannot bring the entry back.
    pub fn remember(
        &self,
        dependency: &Dependency,
        value: DependencyValue,
        index: u64,
        stopped: &CancellationToken,
    ) -> Remembered {
        let mut entries = self.write();
        if stopped.is_cancelled() {
            return Remembered::Cancelled;
        }
        let changed = entries
            .get(dependency)
            .map_or(true, |entry| entry.value != value);
        entries.insert(
            dependency.clone(),
            BrainEntry {
                value,
                index,
                received_at: Utc::now(),
            },
        );
        if changed {
            Remembered::Changed
        } else {
            Remembered::Unchanged
        }
    }

    pub fn forget(&self, dependency: &Dependency) -> Option<BrainEntry> {
        self.write().remove(dependency)
    }

    pub fn get(&self, dependency: &Dependency) -> Option<BrainEntry> {
        self.read().get(dependency).cloned()
    }

    /// Whether a value has been received for `dependency`.
    pub fn contains(&self, dependency: &Dependency) -> bool {
        self.read().contains_key(dependency)
    }

    /// Every received value, for a render pass.
    pub fn snapshot(&self) -> Values {
        self.read()
            .iter()
            .map(|(dependency, entry)| (dependency.clone(), entry.value.clone()))
            .collect()
    }

    pub fn len(&self) -> usize {
        self.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.read().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn value(v: &str) -> DependencyValue {
        DependencyValue::Key(Some(v.to_owned()))
    }

    #[test]
    fn first_value_is_a_change() {
        let brain = Brain::new();
        let dep = Dependency::key("foo");
        let token = CancellationToken::new();

        assert!(!brain.contains(&dep));
        assert_eq!(brain.remember(&dep, value("bar"), 2, &token), Remembered::Changed);
        let entry = brain.get(&dep).expect("entry");
        assert_eq!(entry.value, value("bar"));
        assert_eq!(entry.index, 2);
    }

    #[test]
    fn equal_value_refreshes_index_only() {
        let brain = Brain::new();
        let dep = Dependency::key("foo");
        let token = CancellationToken::new();

        brain.remember(&dep, value("bar"), 2, &token);
        assert_eq!(brain.remember(&dep, value("bar"), 5, &token), Remembered::Unchanged);
        assert_eq!(brain.get(&dep).expect("entry").index, 5);
        assert_eq!(brain.remember(&dep, value("baz"), 6, &token), Remembered::Changed);
    }

    #[test]
    fn absent_key_counts_as_received() {
        let brain = Brain::new();
        let dep = Dependency::key("foo");
        brain.remember(&dep, DependencyValue::Key(None), 1, &CancellationToken::new());
        assert!(brain.contains(&dep));
        assert_eq!(brain.snapshot().len(), 1);
    }

    #[test]
    fn cancelled_writer_cannot_resurrect_entry() {
        let brain = Brain::new();
        let dep = Dependency::key("foo");
        let token = CancellationToken::new();

        brain.remember(&dep, value("bar"), 2, &token);
        token.cancel();
        brain.forget(&dep);

        assert_eq!(brain.remember(&dep, value("late"), 3, &token), Remembered::Cancelled);
        assert!(brain.is_empty());
    }
}
