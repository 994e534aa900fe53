//! Module code contract.
//!
//! A module is a constructible unit exposing `initialize`/`start`/`stop`/
//! `health_check` (and optionally `on_config_change`).  This trait is the
//! only boundary the orchestrator depends on -- it does not care how a
//! module is implemented internally.
//!
//! Implementations are supplied through registered factories rather than
//! dynamic code loading: the orchestrator constructs a fresh instance from
//! the factory registered under the module's manifest name, so the contract
//! is validated by the compiler instead of by attribute probing.  Handler
//! registration happens with explicit [`ModuleContext::subscribe`] calls
//! inside `initialize`.

use std::sync::Arc;

use async_trait::async_trait;

use crate::bus::{EventBus, EventHandler, SubscriptionId};
use crate::error::Result;
use crate::event::Event;
use crate::health::HealthCheck;
use crate::scheduler::PriorityScheduler;

/// Everything a module needs from the kernel: its name, a bus handle, a
/// scheduler handle, and its scoped configuration from the manifest.
#[derive(Clone)]
pub struct ModuleContext {
    /// The module's manifest name.
    pub name: String,
    /// Publish/subscribe fabric.
    pub bus: EventBus,
    /// Tiered, retry-protected execution.
    pub scheduler: PriorityScheduler,
    /// Module-scoped configuration (manifest defaults merged with overrides).
    pub config: serde_json::Value,
}

impl ModuleContext {
    /// Subscribe to an event pattern on behalf of this module.
    ///
    /// Registrations made this way are owned by the module and removed
    /// automatically when it is unloaded.
    pub fn subscribe(
        &self,
        pattern: &str,
        handler: Arc<dyn EventHandler>,
    ) -> Result<SubscriptionId> {
        self.bus.subscribe_owned(pattern, Some(&self.name), handler)
    }

    /// Publish an event sourced from this module.
    pub async fn publish(&self, event_type: &str) -> Result<usize> {
        self.bus.publish(Event::new(event_type, &self.name)).await
    }
}

/// The lifecycle contract every module implements.
#[async_trait]
pub trait Module: Send + Sync {
    /// Wire up subscriptions and internal state.  Called once, before
    /// [`Module::start`]; the context carries the module's bus handle and
    /// scoped configuration.
    async fn initialize(&mut self, ctx: ModuleContext) -> Result<()>;

    /// Begin doing work.  Called after a successful `initialize`.
    async fn start(&mut self) -> Result<()>;

    /// Stop doing work and release resources.  Called on unload; the
    /// orchestrator removes the module's subscriptions afterwards.
    async fn stop(&mut self) -> Result<()>;

    /// Produce a fresh health report.
    async fn health_check(&self) -> Result<HealthCheck>;

    /// React to a configuration change.  Default is a no-op.
    async fn on_config_change(
        &mut self,
        _changed: &[String],
        _config: &serde_json::Value,
    ) -> Result<()> {
        Ok(())
    }
}

/// Factory that constructs module instances.
///
/// Registered with the orchestrator under the manifest name; a fresh
/// instance is created on every load (including hot-reloads).
pub type ModuleFactory = Arc<dyn Fn() -> Box<dyn Module> + Send + Sync>;
