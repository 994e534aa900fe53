//! Kernel error types.
//!
//! All kernel subsystems surface errors through [`KernelError`], which is the
//! single error type returned by every public API in this crate.  Each variant
//! carries enough context for callers to decide how to handle the failure
//! without inspecting opaque strings.
//!
//! Propagation policy: a failing subscriber or queued handler is isolated --
//! its error is logged and dead-lettered, never returned to the publisher or
//! to other subscribers.  A failing module load marks that module `Failed`
//! and is reported via a high-priority event; only a dependency cycle aborts
//! a whole batch load.

/// Unified error type for the modkit kernel.
#[derive(Debug, thiserror::Error)]
pub enum KernelError {
    // -- Configuration errors -----------------------------------------------
    /// Bad or missing configuration.
    #[error("configuration error: {reason}")]
    Configuration { reason: String },

    // -- Module errors ------------------------------------------------------
    /// Loading a module failed.  Wraps the module name and the underlying
    /// cause so operators can see which unit broke.
    #[error("failed to load module `{module}`: {reason}")]
    ModuleLoad { module: String, reason: String },

    /// The dependency graph contains a cycle.  Names every module that is
    /// part of the unresolved residue after topological sorting.
    #[error("circular dependency involving modules: {}", cycle.join(", "))]
    CircularDependency { cycle: Vec<String> },

    /// The referenced module is not present in the orchestrator registry.
    #[error("module not found: {module}")]
    ModuleNotFound { module: String },

    /// Unloading was refused because other running modules still declare a
    /// hard dependency on this one (pass `force` to override).
    #[error("module `{module}` is still required by: {}", dependents.join(", "))]
    DependencyViolation {
        module: String,
        dependents: Vec<String>,
    },

    // -- Event bus errors ---------------------------------------------------
    /// Publish/dispatch plumbing failure (persistence, replay, internal
    /// channel breakage).
    #[error("message bus error: {reason}")]
    MessageBus { reason: String },

    /// The bus rejected a publish because it is not running.  Publishes are
    /// never silently dropped.
    #[error("event bus is not running")]
    BusNotRunning,

    // -- Scheduler errors ---------------------------------------------------
    /// The scheduler has been shut down and will not accept new work.
    #[error("scheduler is shut down")]
    SchedulerShutdown,

    // -- Validation ---------------------------------------------------------
    /// A caller-supplied value (event type, subscription pattern, config
    /// key) has an invalid format.
    #[error("validation error: {reason}")]
    Validation { reason: String },

    // -- Generic ------------------------------------------------------------
    /// Catch-all for unexpected internal errors that don't fit a specific
    /// variant.  Prefer a typed variant whenever possible.
    #[error("internal kernel error: {0}")]
    Internal(String),
}

impl From<modkit_config::ConfigError> for KernelError {
    fn from(err: modkit_config::ConfigError) -> Self {
        Self::Configuration {
            reason: err.to_string(),
        }
    }
}

/// Convenience alias used throughout the kernel crate.
pub type Result<T> = std::result::Result<T, KernelError>;
