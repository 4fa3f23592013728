//! Template functions backed by a value snapshot.
//!
//! | Function                          | Dependency              | Placeholder when unknown |
//! |-----------------------------------|-------------------------|--------------------------|
//! | `key(path)`                       | `Key(path)`             | `""`                     |
//! | `key_or_default(path, default)`   | `Key(path)`             | `default`                |
//! | `keys(prefix)` / `tree(prefix)`   | `KeyPrefix(prefix)`     | `[]`                     |
//! | `service(name, tag?)`             | `Service(name, tag)`    | `[]`                     |
//! | `env(name)`                       | none                    | `""`                     |
//!
//! Tera functions take named arguments only: `{{ key(path="app/port") }}`.

use std::collections::{BTreeSet, HashMap};
use std::sync::{Arc, Mutex, PoisonError};

use tera::{Tera, Value};

use tether_core::{Dependency, DependencyValue, Values};

/// Dependencies touched during one render.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct Recorded {
    pub used: BTreeSet<Dependency>,
    pub missing: BTreeSet<Dependency>,
}

/// Shared state behind the functions registered for a single render.
#[derive(Clone)]
pub struct Scope {
    values: Arc<Values>,
    recorded: Arc<Mutex<Recorded>>,
}

impl Scope {
    pub fn new(values: Arc<Values>) -> Self {
        Self {
            values,
            recorded: Arc::new(Mutex::new(Recorded::default())),
        }
    }

    fn lookup(&self, dependency: Dependency) -> Option<DependencyValue> {
        let mut recorded = self
            .recorded
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        let value = self.values.get(&dependency).cloned();
        if value.is_none() {
            recorded.missing.insert(dependency.clone());
        }
        recorded.used.insert(dependency);
        value
    }

    pub fn recorded(&self) -> Recorded {
        self.recorded
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Register every template function on `tera`, bound to this scope.
    pub fn register(&self, tera: &mut Tera) {
        let scope = self.clone();
        tera.register_function("key", move |args: &HashMap<String, Value>| {
            let path = required_str(args, "key", "path")?;
            Ok(match scope.lookup(Dependency::key(path)) {
                Some(DependencyValue::Key(Some(value))) => Value::String(value),
                _ => Value::String(String::new()),
            })
        });

        let scope = self.clone();
        tera.register_function(
            "key_or_default",
            move |args: &HashMap<String, Value>| {
                let path = required_str(args, "key_or_default", "path")?;
                let default = args.get("default").cloned().unwrap_or(Value::Null);
                Ok(match scope.lookup(Dependency::key(path)) {
                    Some(DependencyValue::Key(Some(value))) => Value::String(value),
                    _ => default,
                })
            },
        );

        for name in ["keys", "tree"] {
            let scope = self.clone();
            tera.register_function(name, move |args: &HashMap<String, Value>| {
                let prefix = required_str(args, name, "prefix")?;
                match scope.lookup(Dependency::key_prefix(prefix)) {
                    Some(value @ DependencyValue::KeyPrefix(_)) => to_value(&value),
                    _ => Ok(Value::Array(Vec::new())),
                }
            });
        }

        let scope = self.clone();
        tera.register_function("service", move |args: &HashMap<String, Value>| {
            let name = required_str(args, "service", "name")?;
            let tag = args.get("tag").and_then(Value::as_str);
            match scope.lookup(Dependency::service(name, tag)) {
                Some(value @ DependencyValue::Service(_)) => to_value(&value),
                _ => Ok(Value::Array(Vec::new())),
            }
        });

        tera.register_function("env", |args: &HashMap<String, Value>| {
            let name = required_str(args, "env", "name")?;
            Ok(Value::String(std::env::var(name).unwrap_or_default()))
        });
    }
}

fn required_str<'a>(
    args: &'a HashMap<String, Value>,
    function: &str,
    arg: &str,
) -> tera::Result<&'a str> {
    match args.get(arg) {
        Some(Value::String(s)) if !s.is_empty() => Ok(s.as_str()),
        Some(other) => Err(tera::Error::msg(format!(
            "{function}: `{arg}` must be a non-empty string, got {other}"
        ))),
        None => Err(tera::Error::msg(format!(
            "{function}: missing required argument `{arg}`"
        ))),
    }
}

fn to_value(value: &DependencyValue) -> tera::Result<Value> {
    serde_json::to_value(value).map_err(|e| tera::Error::msg(e.to_string()))
}
