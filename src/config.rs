//! Dynamic configuration
//!
//! A process-wide registry binding typed values to a hierarchical, dotted
//! lowercase namespace (`fiber.stack_size`, `tcp.connect.timeout`, ...).
//! Values can be overridden from YAML, and every variable supports change
//! listeners that observe the old and new value.
//!
//! ```rust
//! use spindle::config::Config;
//!
//! let port = Config::lookup_with("server.port", 8080u16, "listen port");
//! port.add_listener(|old, new| println!("port changed {} -> {}", old, new));
//! Config::load_yaml_str("server:\n  port: 9090").unwrap();
//! assert_eq!(port.value(), 9090);
//! ```
use std::any::Any;
use std::collections::HashMap;
use std::fs;
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};

use log::{error, warn};
use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::error::Error;

/// Bound on what a configuration variable can hold.
pub trait ConfigItem:
    Serialize + DeserializeOwned + Clone + PartialEq + Send + Sync + 'static
{
}

impl<T> ConfigItem for T where
    T: Serialize + DeserializeOwned + Clone + PartialEq + Send + Sync + 'static
{
}

/// Type-erased view of a registered variable, for the registry and loaders.
pub trait ConfigValue: Send + Sync {
    fn name(&self) -> &str;
    fn description(&self) -> &str;
    fn type_name(&self) -> &'static str;
    fn to_yaml(&self) -> Result<String, Error>;
    fn to_json(&self) -> Result<String, Error>;
    fn load_yaml(&self, node: &serde_yaml::Value) -> Result<(), Error>;
    fn as_any(self: Arc<Self>) -> Arc<dyn Any + Send + Sync>;
}

static LISTENER_ID: AtomicU64 = AtomicU64::new(0);

type Listener<T> = Arc<dyn Fn(&T, &T) + Send + Sync>;

/// A typed configuration variable.
pub struct ConfigVar<T> {
    name: String,
    description: String,
    value: RwLock<T>,
    listeners: Mutex<HashMap<u64, Listener<T>>>,
}

impl<T: ConfigItem> ConfigVar<T> {
    fn new(name: String, description: &str, value: T) -> Self {
        ConfigVar {
            name,
            description: description.to_string(),
            value: RwLock::new(value),
            listeners: Mutex::new(HashMap::new()),
        }
    }

    pub fn value(&self) -> T {
        self.value.read().unwrap().clone()
    }

    /// Replace the value. Listeners fire with (old, new) only when the value
    /// actually changes, outside of any lock held by this variable.
    pub fn set(&self, value: T) {
        let old = {
            let mut current = self.value.write().unwrap();
            if *current == value {
                return;
            }
            std::mem::replace(&mut *current, value.clone())
        };
        let listeners: Vec<Listener<T>> =
            self.listeners.lock().unwrap().values().cloned().collect();
        for listener in listeners {
            listener(&old, &value);
        }
    }

    /// Register a change listener; the returned key can be passed to
    /// [del_listener](#method.del_listener).
    pub fn add_listener<F>(&self, listener: F) -> u64
    where
        F: Fn(&T, &T) + Send + Sync + 'static,
    {
        let key = LISTENER_ID.fetch_add(1, Ordering::Relaxed) + 1;
        self.listeners
            .lock()
            .unwrap()
            .insert(key, Arc::new(listener));
        key
    }

    pub fn del_listener(&self, key: u64) {
        self.listeners.lock().unwrap().remove(&key);
    }

    pub fn clear_listeners(&self) {
        self.listeners.lock().unwrap().clear();
    }
}

impl<T: ConfigItem> ConfigValue for ConfigVar<T> {
    fn name(&self) -> &str {
        &self.name
    }

    fn description(&self) -> &str {
        &self.description
    }

    fn type_name(&self) -> &'static str {
        std::any::type_name::<T>()
    }

    fn to_yaml(&self) -> Result<String, Error> {
        Ok(serde_yaml::to_string(&*self.value.read().unwrap())?)
    }

    fn to_json(&self) -> Result<String, Error> {
        Ok(serde_json::to_string(&*self.value.read().unwrap())?)
    }

    fn load_yaml(&self, node: &serde_yaml::Value) -> Result<(), Error> {
        let value: T = serde_yaml::from_value(node.clone())?;
        self.set(value);
        Ok(())
    }

    fn as_any(self: Arc<Self>) -> Arc<dyn Any + Send + Sync> {
        self
    }
}

lazy_static! {
    static ref REGISTRY: RwLock<HashMap<String, Arc<dyn ConfigValue>>> =
        RwLock::new(HashMap::new());
    // Values loaded from YAML before their variable was registered. Applied
    // on first lookup so startup order does not matter.
    static ref PENDING: Mutex<HashMap<String, serde_yaml::Value>> = Mutex::new(HashMap::new());
}

fn valid_name(name: &str) -> bool {
    !name.is_empty()
        && name
            .chars()
            .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '.' || c == '_')
}

/// The process-wide configuration registry.
pub struct Config;

impl Config {
    /// Return the variable registered under `name`, creating it with
    /// `default` if absent. A name registered under a different type is a
    /// contract violation.
    pub fn lookup_with<T: ConfigItem>(
        name: &str,
        default: T,
        description: &str,
    ) -> Arc<ConfigVar<T>> {
        let name = name.to_ascii_lowercase();
        assert!(valid_name(&name), "invalid config name: {}", name);
        let var = {
            let mut registry = REGISTRY.write().unwrap();
            if let Some(existing) = registry.get(&name) {
                let type_name = existing.type_name();
                return match existing.clone().as_any().downcast::<ConfigVar<T>>() {
                    Ok(var) => var,
                    Err(_) => panic!(
                        "config {} already registered as {}, requested {}",
                        name,
                        type_name,
                        std::any::type_name::<T>()
                    ),
                };
            }
            let var = Arc::new(ConfigVar::new(name.clone(), description, default));
            registry.insert(name.clone(), var.clone());
            var
        };
        let preloaded = PENDING.lock().unwrap().remove(&name);
        if let Some(node) = preloaded {
            if let Err(e) = var.load_yaml(&node) {
                warn!(target: "system", "config {}: discarding preloaded value: {}", name, e);
            }
        }
        var
    }

    /// Return the variable registered under `name`, or None if it is absent
    /// or holds another type.
    pub fn lookup<T: ConfigItem>(name: &str) -> Option<Arc<ConfigVar<T>>> {
        let name = name.to_ascii_lowercase();
        let existing = REGISTRY.read().unwrap().get(&name).cloned()?;
        let type_name = existing.type_name();
        match existing.as_any().downcast::<ConfigVar<T>>() {
            Ok(var) => Some(var),
            Err(_) => {
                error!(
                    target: "system",
                    "config {} exists but holds a {}, requested {}",
                    name,
                    type_name,
                    std::any::type_name::<T>()
                );
                None
            }
        }
    }

    /// Apply a YAML document: mappings flatten into dotted names, matching
    /// variables are updated, unknown names are retained for later
    /// registration. A value of the wrong type is logged and skipped.
    pub fn load_yaml_str(source: &str) -> Result<(), Error> {
        let root: serde_yaml::Value = serde_yaml::from_str(source)?;
        let mut nodes = Vec::new();
        list_members("", &root, &mut nodes);
        for (name, node) in nodes {
            let var = REGISTRY.read().unwrap().get(&name).cloned();
            match var {
                Some(var) => {
                    if let Err(e) = var.load_yaml(&node) {
                        error!(target: "system", "config {}: {}", name, e);
                    }
                }
                None => {
                    PENDING.lock().unwrap().insert(name, node);
                }
            }
        }
        Ok(())
    }

    pub fn load_file<P: AsRef<Path>>(path: P) -> Result<(), Error> {
        let source = fs::read_to_string(path)?;
        Self::load_yaml_str(&source)
    }

    /// Visit every registered variable.
    pub fn visit<F>(mut visitor: F)
    where
        F: FnMut(&Arc<dyn ConfigValue>),
    {
        for var in REGISTRY.read().unwrap().values() {
            visitor(var);
        }
    }

    /// Dump the whole registry as a JSON object, for diagnostics.
    pub fn dump() -> Result<String, Error> {
        let mut map = serde_json::Map::new();
        let registry = REGISTRY.read().unwrap();
        for (name, var) in registry.iter() {
            map.insert(name.clone(), serde_json::from_str(&var.to_json()?)?);
        }
        Ok(serde_json::to_string_pretty(&serde_json::Value::Object(
            map,
        ))?)
    }
}

fn list_members(prefix: &str, node: &serde_yaml::Value, out: &mut Vec<(String, serde_yaml::Value)>) {
    if !prefix.is_empty() {
        if !valid_name(prefix) {
            error!(target: "system", "config: invalid name {} in loaded document", prefix);
            return;
        }
        out.push((prefix.to_string(), node.clone()));
    }
    if let serde_yaml::Value::Mapping(mapping) = node {
        for (key, value) in mapping {
            if let Some(key) = key.as_str() {
                let child = if prefix.is_empty() {
                    key.to_ascii_lowercase()
                } else {
                    format!("{}.{}", prefix, key.to_ascii_lowercase())
                };
                list_members(&child, value, out);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn name_validation() {
        assert!(valid_name("fiber.stack_size"));
        assert!(valid_name("a_b.c9"));
        assert!(!valid_name(""));
        assert!(!valid_name("Fiber.Stack"));
        assert!(!valid_name("a b"));
    }

    #[test]
    fn flatten_nested_mapping() {
        let root: serde_yaml::Value =
            serde_yaml::from_str("outer:\n  inner: 1\n  other:\n    leaf: x").unwrap();
        let mut nodes = Vec::new();
        list_members("", &root, &mut nodes);
        let names: Vec<&str> = nodes.iter().map(|(n, _)| n.as_str()).collect();
        assert!(names.contains(&"outer.inner"));
        assert!(names.contains(&"outer.other.leaf"));
    }
}
