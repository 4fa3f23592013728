//! Reference counting in the Watcher under arbitrary add/remove sequences.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use proptest::prelude::*;
use tether_core::{Dependency, Retrier};
use tether_daemon::{Brain, Watcher};
use tether_store::MemoryStore;

#[derive(Debug, Clone)]
enum Op {
    Add(usize),
    Remove(usize),
}

fn op() -> impl Strategy<Value = Op> {
    prop_oneof![
        (0..4usize).prop_map(Op::Add),
        (0..4usize).prop_map(Op::Remove),
    ]
}

fn dependency(i: usize) -> Dependency {
    match i {
        0 => Dependency::key("app/a"),
        1 => Dependency::key("app/b"),
        2 => Dependency::key_prefix("app/"),
        _ => Dependency::service("web", Some("blue")),
    }
}

proptest! {
    #[test]
    fn one_view_per_referenced_dependency(ops in prop::collection::vec(op(), 1..60)) {
        tokio_test::block_on(async move {
            let store = MemoryStore::new();
            store.set_key("app/a", "1");
            let brain = Brain::new();
            let mut watcher = Watcher::new(
                Arc::new(store),
                brain.clone(),
                Retrier::disabled(),
                Duration::from_secs(60),
            );
            let mut model: HashMap<usize, usize> = HashMap::new();

            for op in ops {
                match op {
                    Op::Add(i) => {
                        let refs = model.entry(i).or_default();
                        let started = watcher.add(&dependency(i));
                        assert_eq!(started, *refs == 0, "start only on first reference");
                        *refs += 1;
                    }
                    Op::Remove(i) => {
                        let refs = model.entry(i).or_default();
                        let stopped = watcher.remove(&dependency(i));
                        assert_eq!(stopped, *refs == 1, "stop only on last reference");
                        *refs = refs.saturating_sub(1);
                        if *refs == 0 {
                            assert!(!brain.contains(&dependency(i)));
                        }
                    }
                }
                // Let Views run their reads between steps.
                tokio::task::yield_now().await;

                for i in 0..4 {
                    let refs = model.get(&i).copied().unwrap_or(0);
                    assert_eq!(watcher.references(&dependency(i)), refs);
                    assert_eq!(watcher.is_watching(&dependency(i)), refs > 0);
                }
                let live = model.values().filter(|refs| **refs > 0).count();
                assert_eq!(watcher.view_count(), live);
            }

            watcher.stop().await;
        });
    }
}
