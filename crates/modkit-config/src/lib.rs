//! Layered configuration for modkit.
//!
//! Configuration is a single JSON tree addressed with dot paths
//! (`bus.history_capacity`).  Layers merge in precedence order: built-in
//! defaults, then TOML files, then `MODKIT_`-prefixed environment
//! variables.  Later layers win key-by-key; sibling keys from earlier
//! layers survive.
//!
//! Listeners registered with [`ConfigManager::on_change`] are invoked
//! synchronously after every mutation with the changed paths and the new
//! snapshot.
//!
//! # Usage
//!
//! ```rust
//! use modkit_config::ConfigManager;
//!
//! let config = ConfigManager::new();
//! config.set("bus.history_capacity", serde_json::json!(512)).unwrap();
//!
//! let capacity: u64 = config.get_or("bus.history_capacity", 256);
//! assert_eq!(capacity, 512);
//! ```

use std::collections::HashMap;
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};

use serde_json::Value;
use thiserror::Error;

/// Environment variables with this prefix override configuration keys.
/// `MODKIT_BUS__HISTORY_CAPACITY=512` sets `bus.history_capacity`.
pub const ENV_PREFIX: &str = "MODKIT_";

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

/// Errors produced by the configuration layer.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// The configuration file could not be read.
    #[error("cannot read config file: {0}")]
    Io(#[from] std::io::Error),

    /// The configuration file is not valid TOML.
    #[error("cannot parse config file: {0}")]
    Parse(#[from] toml::de::Error),

    /// A dot path is empty, malformed, or traverses a non-object value.
    #[error("invalid config key `{key}`: {reason}")]
    InvalidKey { key: String, reason: String },
}

pub type Result<T> = std::result::Result<T, ConfigError>;

// ---------------------------------------------------------------------------
// Manager
// ---------------------------------------------------------------------------

/// Identifies one registered change listener.
pub type ListenerId = u64;

/// Callback invoked after a mutation with the changed dot paths and the new
/// full snapshot.
pub type Listener = Arc<dyn Fn(&[String], &Value) + Send + Sync>;

/// Thread-safe configuration tree with dot-path access and change
/// notifications.
///
/// Cheaply cloneable (`Arc`-backed).
#[derive(Clone)]
pub struct ConfigManager {
    inner: Arc<ManagerInner>,
}

struct ManagerInner {
    tree: RwLock<Value>,
    listeners: Mutex<HashMap<ListenerId, Listener>>,
    next_listener: AtomicU64,
}

impl ConfigManager {
    /// An empty configuration tree.
    #[must_use]
    pub fn new() -> Self {
        Self::with_defaults(Value::Object(serde_json::Map::new()))
    }

    /// A tree seeded with built-in defaults (the lowest-precedence layer).
    #[must_use]
    pub fn with_defaults(defaults: Value) -> Self {
        Self {
            inner: Arc::new(ManagerInner {
                tree: RwLock::new(defaults),
                listeners: Mutex::new(HashMap::new()),
                next_listener: AtomicU64::new(1),
            }),
        }
    }

    // -- Reads --------------------------------------------------------------

    /// Look up a dot path.  Returns `None` when any segment is missing.
    pub fn get(&self, path: &str) -> Option<Value> {
        let tree = self.inner.tree.read().unwrap_or_else(|e| e.into_inner());
        let mut node = &*tree;
        for segment in path.split('.') {
            node = node.as_object()?.get(segment)?;
        }
        Some(node.clone())
    }

    /// Look up a dot path and deserialize it, falling back to `default` when
    /// the key is missing or has an incompatible shape.
    pub fn get_or<T: serde::de::DeserializeOwned>(&self, path: &str, default: T) -> T {
        self.get(path)
            .and_then(|v| serde_json::from_value(v).ok())
            .unwrap_or(default)
    }

    /// Clone of the full tree.
    pub fn snapshot(&self) -> Value {
        self.inner
            .tree
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    // -- Writes -------------------------------------------------------------

    /// Set one dot path, creating intermediate objects as needed.  Fails
    /// when the path traverses an existing non-object value.  Listeners are
    /// notified after the write.
    pub fn set(&self, path: &str, value: Value) -> Result<()> {
        validate_path(path)?;
        {
            let mut tree = self.inner.tree.write().unwrap_or_else(|e| e.into_inner());
            set_path(&mut tree, path, value)?;
        }
        tracing::debug!(key = %path, "config key set");
        self.notify(&[path.to_string()]);
        Ok(())
    }

    /// Read a TOML file and merge it over the current tree.  Returns the
    /// top-level dot paths the file touched.
    pub fn load_file(&self, path: &Path) -> Result<Vec<String>> {
        let text = std::fs::read_to_string(path)?;
        let parsed: toml::Value = toml::from_str(&text)?;
        let layer = toml_to_json(parsed);

        let changed = top_level_keys(&layer);
        {
            let mut tree = self.inner.tree.write().unwrap_or_else(|e| e.into_inner());
            merge(&mut tree, layer);
        }

        tracing::info!(
            file = %path.display(),
            keys = changed.len(),
            "configuration file loaded"
        );
        self.notify(&changed);
        Ok(changed)
    }

    /// Apply `MODKIT_`-prefixed environment variables as the
    /// highest-precedence layer.  `__` in the variable name becomes a dot,
    /// the rest is lowercased: `MODKIT_BUS__HISTORY_CAPACITY` targets
    /// `bus.history_capacity`.  Values parse as JSON scalars where possible
    /// and fall back to plain strings.  Returns the paths overridden.
    pub fn apply_env_overrides(&self) -> Vec<String> {
        let mut changed = Vec::new();

        for (name, raw) in std::env::vars() {
            let Some(stripped) = name.strip_prefix(ENV_PREFIX) else {
                continue;
            };
            let path = stripped.to_lowercase().replace("__", ".");
            if validate_path(&path).is_err() {
                tracing::warn!(variable = %name, "environment override has invalid key; skipped");
                continue;
            }

            let value = serde_json::from_str(&raw).unwrap_or(Value::String(raw));
            let mut tree = self.inner.tree.write().unwrap_or_else(|e| e.into_inner());
            match set_path(&mut tree, &path, value) {
                Ok(()) => {
                    tracing::debug!(key = %path, variable = %name, "environment override applied");
                    changed.push(path);
                }
                Err(e) => {
                    tracing::warn!(variable = %name, error = %e, "environment override skipped");
                }
            }
        }

        if !changed.is_empty() {
            changed.sort();
            self.notify(&changed);
        }
        changed
    }

    // -- Listeners ----------------------------------------------------------

    /// Register a change listener.  Invoked synchronously after every
    /// mutation; keep callbacks short and offload real work.
    pub fn on_change(&self, listener: Listener) -> ListenerId {
        let id = self.inner.next_listener.fetch_add(1, Ordering::Relaxed);
        self.inner
            .listeners
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(id, listener);
        id
    }

    /// Remove a listener.  Returns `true` if it was registered.
    pub fn remove_listener(&self, id: ListenerId) -> bool {
        self.inner
            .listeners
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(&id)
            .is_some()
    }

    fn notify(&self, changed: &[String]) {
        let listeners: Vec<Listener> = self
            .inner
            .listeners
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .values()
            .cloned()
            .collect();
        if listeners.is_empty() {
            return;
        }

        let snapshot = self.snapshot();
        for listener in listeners {
            listener(changed, &snapshot);
        }
    }
}

impl Default for ConfigManager {
    fn default() -> Self {
        Self::new()
    }
}

// ---------------------------------------------------------------------------
// Tree helpers
// ---------------------------------------------------------------------------

fn validate_path(path: &str) -> Result<()> {
    if path.is_empty() || path.split('.').any(str::is_empty) {
        return Err(ConfigError::InvalidKey {
            key: path.to_string(),
            reason: "path must be non-empty dot-separated segments".to_string(),
        });
    }
    Ok(())
}

/// Walk to the parent of the last segment, creating intermediate objects,
/// then insert.  A non-object value on the way is an error, never silently
/// replaced.
fn set_path(tree: &mut Value, path: &str, value: Value) -> Result<()> {
    let segments: Vec<&str> = path.split('.').collect();
    let mut node = tree;

    for segment in &segments[..segments.len() - 1] {
        let map = node.as_object_mut().ok_or_else(|| ConfigError::InvalidKey {
            key: path.to_string(),
            reason: format!("`{segment}` is not a table"),
        })?;
        node = map
            .entry(segment.to_string())
            .or_insert_with(|| Value::Object(serde_json::Map::new()));
    }

    let last = segments[segments.len() - 1];
    let map = node.as_object_mut().ok_or_else(|| ConfigError::InvalidKey {
        key: path.to_string(),
        reason: format!("parent of `{last}` is not a table"),
    })?;
    map.insert(last.to_string(), value);
    Ok(())
}

/// Deep merge: objects merge key-by-key, everything else replaces.
fn merge(base: &mut Value, layer: Value) {
    match (base, layer) {
        (Value::Object(base_map), Value::Object(layer_map)) => {
            for (key, value) in layer_map {
                match base_map.get_mut(&key) {
                    Some(existing) => merge(existing, value),
                    None => {
                        base_map.insert(key, value);
                    }
                }
            }
        }
        (base, layer) => *base = layer,
    }
}

fn top_level_keys(layer: &Value) -> Vec<String> {
    layer
        .as_object()
        .map(|m| m.keys().cloned().collect())
        .unwrap_or_default()
}

fn toml_to_json(value: toml::Value) -> Value {
    match value {
        toml::Value::String(s) => Value::String(s),
        toml::Value::Integer(i) => Value::Number(i.into()),
        toml::Value::Float(f) => serde_json::Number::from_f64(f)
            .map(Value::Number)
            .unwrap_or(Value::Null),
        toml::Value::Boolean(b) => Value::Bool(b),
        toml::Value::Datetime(dt) => Value::String(dt.to_string()),
        toml::Value::Array(items) => Value::Array(items.into_iter().map(toml_to_json).collect()),
        toml::Value::Table(table) => Value::Object(
            table
                .into_iter()
                .map(|(k, v)| (k, toml_to_json(v)))
                .collect(),
        ),
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
