//! Module manifests and registry records.
//!
//! Every module is described by a declarative `module.toml` file: identity,
//! dependencies, declared event types, configuration defaults and lifecycle
//! flags.  The orchestrator parses manifests at discovery time into
//! [`ModuleInfo`] records and layers runtime state on top.
//!
//! # Manifest format
//!
//! ```toml
//! name = "weather-sensor"
//! version = "1.2.0"
//! type = "sensor"
//! description = "Polls the weather API"
//! provides = ["weather.updated"]
//! consumes = ["system.health_check"]
//! priority = "low"
//! hot_reload = true
//! auto_restart = true
//!
//! [dependencies]
//! modules = ["http-client"]
//!
//! [optional_dependencies]
//! modules = ["metrics"]
//!
//! [config]
//! poll_interval_secs = 60
//! ```

use std::fmt;
use std::path::{Path, PathBuf};
use std::time::SystemTime;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{KernelError, Result};
use crate::event::EventPriority;
use crate::health::HealthStatus;

/// The manifest filename the orchestrator looks for during discovery.
pub const MANIFEST_FILE: &str = "module.toml";

// ---------------------------------------------------------------------------
// Manifest
// ---------------------------------------------------------------------------

/// Coarse classification of a module.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ModuleType {
    /// Kernel-adjacent infrastructure.
    Core,
    /// Bridges an external service into the event fabric.
    Adapter,
    /// Produces events from the outside world.
    Sensor,
    /// General long-running capability.
    Service,
    /// Any other tag; preserved verbatim for forward compatibility.
    #[serde(untagged)]
    Other(String),
}

impl Default for ModuleType {
    fn default() -> Self {
        Self::Service
    }
}

impl fmt::Display for ModuleType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Core => write!(f, "core"),
            Self::Adapter => write!(f, "adapter"),
            Self::Sensor => write!(f, "sensor"),
            Self::Service => write!(f, "service"),
            Self::Other(tag) => write!(f, "{tag}"),
        }
    }
}

/// A named list of module dependencies.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DependencyList {
    #[serde(default)]
    pub modules: Vec<String>,
}

/// The declarative description of one module.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModuleManifest {
    /// Unique module name; the registry key.
    pub name: String,
    /// Semantic version string.
    pub version: String,
    /// Module classification tag.
    #[serde(rename = "type", default)]
    pub module_type: ModuleType,
    /// Human-readable description.
    #[serde(default)]
    pub description: String,
    /// Hard dependencies: must be `Running` before this module loads.
    #[serde(default)]
    pub dependencies: DependencyList,
    /// Soft dependencies: used when present, never blocking.
    #[serde(default)]
    pub optional_dependencies: DependencyList,
    /// Event types this module publishes.  Documentation/validation aid;
    /// not enforced at runtime.
    #[serde(default)]
    pub provides: Vec<String>,
    /// Event types this module subscribes to.  Documentation aid.
    #[serde(default)]
    pub consumes: Vec<String>,
    /// JSON-schema-shaped description of the config keys.
    #[serde(default = "empty_table")]
    pub config_schema: serde_json::Value,
    /// Default configuration handed to the module on load.
    #[serde(default = "empty_table")]
    pub config: serde_json::Value,
    /// Declared startup priority; also the reverse-unload ordering key.
    #[serde(default)]
    pub priority: EventPriority,
    /// Whether the hot-reload watcher tracks this module's manifest.
    #[serde(default)]
    pub hot_reload: bool,
    /// Whether the health monitor restarts this module after a failure.
    #[serde(default)]
    pub auto_restart: bool,
}

fn empty_table() -> serde_json::Value {
    serde_json::Value::Object(serde_json::Map::new())
}

impl ModuleManifest {
    /// Minimal manifest for programmatically registered modules.
    pub fn new(name: impl Into<String>, version: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            version: version.into(),
            module_type: ModuleType::default(),
            description: String::new(),
            dependencies: DependencyList::default(),
            optional_dependencies: DependencyList::default(),
            provides: Vec::new(),
            consumes: Vec::new(),
            config_schema: empty_table(),
            config: empty_table(),
            priority: EventPriority::default(),
            hot_reload: false,
            auto_restart: false,
        }
    }

    /// Parse a manifest from TOML text.
    pub fn from_toml(text: &str) -> Result<Self> {
        let manifest: Self = toml::from_str(text).map_err(|e| KernelError::Validation {
            reason: format!("invalid manifest: {e}"),
        })?;

        if manifest.name.is_empty() {
            return Err(KernelError::Validation {
                reason: "manifest `name` must not be empty".to_string(),
            });
        }
        Ok(manifest)
    }

    /// Serialize back to the declarative TOML form.
    pub fn to_toml(&self) -> Result<String> {
        toml::to_string_pretty(self).map_err(|e| KernelError::Internal(e.to_string()))
    }

    /// Read and parse a manifest file.
    pub fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path).map_err(|e| KernelError::Validation {
            reason: format!("cannot read manifest {}: {e}", path.display()),
        })?;
        Self::from_toml(&text)
    }
}

// ---------------------------------------------------------------------------
// Lifecycle state
// ---------------------------------------------------------------------------

/// Module lifecycle state machine.
///
/// ```text
/// Discovered -> Loading -> Loaded -> Initializing -> Running
///                                                      |-> Paused
///                                                      |-> Failed
///                                      Running -> Unloading -> Unloaded
/// ```
///
/// `Failed` is reachable from any in-progress state and is terminal until an
/// explicit reload clears it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ModuleState {
    Discovered,
    Loading,
    Loaded,
    Initializing,
    Running,
    Paused,
    Failed,
    Unloading,
    Unloaded,
}

impl fmt::Display for ModuleState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Discovered => "discovered",
            Self::Loading => "loading",
            Self::Loaded => "loaded",
            Self::Initializing => "initializing",
            Self::Running => "running",
            Self::Paused => "paused",
            Self::Failed => "failed",
            Self::Unloading => "unloading",
            Self::Unloaded => "unloaded",
        };
        write!(f, "{s}")
    }
}

// ---------------------------------------------------------------------------
// Registry record
// ---------------------------------------------------------------------------

/// A manifest plus the runtime state the orchestrator layers on top.
///
/// Mutated only by the orchestrator under its registry lock.
#[derive(Debug, Clone)]
pub struct ModuleInfo {
    pub manifest: ModuleManifest,
    pub state: ModuleState,
    pub last_error: Option<String>,
    pub health: Option<HealthStatus>,
    pub loaded_at: Option<DateTime<Utc>>,
    /// Where the manifest was discovered; `None` for programmatic modules.
    pub manifest_path: Option<PathBuf>,
    /// Cached manifest mtime, compared by the hot-reload watcher.
    pub source_mtime: Option<SystemTime>,
}

impl ModuleInfo {
    /// A freshly discovered, not-yet-loaded module.
    pub fn discovered(
        manifest: ModuleManifest,
        manifest_path: Option<PathBuf>,
        source_mtime: Option<SystemTime>,
    ) -> Self {
        Self {
            manifest,
            state: ModuleState::Discovered,
            last_error: None,
            health: None,
            loaded_at: None,
            manifest_path,
            source_mtime,
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
