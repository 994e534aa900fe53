//! modkit runtime kernel.
//!
//! This crate provides the runtime services an event-driven worker process
//! is assembled from:
//!
//! - **[`bus`]** -- Publish/subscribe event bus with exact and wildcard
//!   pattern matching, per-delivery task isolation, dead-lettering, and
//!   durable-log replay.
//! - **[`scheduler`]** -- Priority-tiered task scheduler built on
//!   [`crossbeam::queue::SegQueue`], with disjoint per-tier worker pools
//!   and exponential-backoff retries.
//! - **[`orchestrator`]** -- Module discovery from `module.toml` manifests,
//!   topological dependency resolution, lifecycle supervision and
//!   hot-reload.
//! - **[`health`]** -- Periodic health polling, process-level aggregation
//!   and auto-restart of failed modules.
//! - **[`kernel`]** -- The façade that wires all of the above (plus the
//!   [`modkit_config`] tree) into one embeddable runtime.
//! - **[`error`]** -- Unified kernel error types via [`thiserror`].
//!
//! All public types are `Send + Sync` and designed for use within a
//! multi-threaded tokio runtime.

pub mod bus;
pub mod error;
pub mod event;
pub mod health;
pub mod kernel;
pub mod manifest;
pub mod module;
pub mod orchestrator;
pub mod scheduler;

// Re-export the most commonly used types at the crate root for convenience.
pub use bus::{DeadLetter, EventBus, EventBusConfig, EventHandler, EventLog, MemoryEventLog, handler};
pub use error::{KernelError, Result};
pub use event::{Event, EventPriority};
pub use health::{HealthCheck, HealthMonitor, HealthMonitorConfig, HealthStatus};
pub use kernel::{Kernel, KernelConfig};
pub use manifest::{ModuleInfo, ModuleManifest, ModuleState, ModuleType};
pub use module::{Module, ModuleContext, ModuleFactory};
pub use orchestrator::ModuleOrchestrator;
pub use scheduler::{PriorityScheduler, SchedulerConfig, SchedulerStats};
