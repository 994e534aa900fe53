//! Module orchestrator: discovery, dependency resolution, lifecycle, and
//! hot-reload.
//!
//! The orchestrator owns the module registry.  Manifests are discovered on
//! disk, resolved into a load order with Kahn's algorithm, and loaded by
//! constructing instances from registered factories.  Every registry
//! mutation (register/load/unload/unregister) is serialized by one
//! orchestrator-wide async mutex; module *execution* is not serialized --
//! live instances sit behind their own per-module locks, so health checks
//! and event handling proceed concurrently with bookkeeping.
//!
//! Failure containment: a load error marks that one module `Failed`,
//! records the cause, cleans up partially-acquired resources (subscriptions
//! removed, instance dropped) and reports via a high-priority event.  Only a
//! dependency cycle aborts a whole batch load, before anything is loaded.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use chrono::Utc;
use dashmap::DashMap;
use tokio::sync::{Mutex, Notify};
use tokio::task::JoinHandle;

use crate::bus::EventBus;
use crate::error::{KernelError, Result};
use crate::event::{Event, EventPriority};
use crate::health::HealthStatus;
use crate::manifest::{MANIFEST_FILE, ModuleInfo, ModuleManifest, ModuleState};
use crate::module::{Module, ModuleContext, ModuleFactory};
use crate::scheduler::PriorityScheduler;

/// A live module instance behind its own lock.
pub type ModuleInstance = Arc<Mutex<Box<dyn Module>>>;

struct ModuleEntry {
    info: ModuleInfo,
    instance: Option<ModuleInstance>,
}

/// Discovers, loads, supervises and unloads modules.
///
/// Cheaply cloneable (`Arc`-backed).
#[derive(Clone)]
pub struct ModuleOrchestrator {
    inner: Arc<OrchestratorInner>,
}

struct OrchestratorInner {
    registry: Mutex<HashMap<String, ModuleEntry>>,
    factories: DashMap<String, ModuleFactory>,
    bus: EventBus,
    scheduler: PriorityScheduler,
    watcher_stop: Notify,
}

impl ModuleOrchestrator {
    #[must_use]
    pub fn new(bus: EventBus, scheduler: PriorityScheduler) -> Self {
        Self {
            inner: Arc::new(OrchestratorInner {
                registry: Mutex::new(HashMap::new()),
                factories: DashMap::new(),
                bus,
                scheduler,
                watcher_stop: Notify::new(),
            }),
        }
    }

    /// The bus handle this orchestrator publishes lifecycle events on.
    #[must_use]
    pub fn bus(&self) -> &EventBus {
        &self.inner.bus
    }

    /// The scheduler handle shared with loaded modules.
    #[must_use]
    pub fn scheduler(&self) -> &PriorityScheduler {
        &self.inner.scheduler
    }

    // -- Factories and registration -----------------------------------------

    /// Register the factory that constructs instances for the named module.
    ///
    /// The trait bound validates the code contract at registration time; a
    /// module whose manifest has no matching factory fails to load.
    pub fn register_factory(&self, name: impl Into<String>, factory: ModuleFactory) {
        let name = name.into();
        tracing::debug!(module = %name, "module factory registered");
        self.inner.factories.insert(name, factory);
    }

    /// Register a manifest directly, bypassing filesystem discovery.
    /// Duplicate names are rejected with a warning rather than an error.
    pub async fn register_manifest(&self, manifest: ModuleManifest) {
        let mut registry = self.inner.registry.lock().await;
        Self::register_entry(&mut registry, ModuleInfo::discovered(manifest, None, None));
    }

    fn register_entry(registry: &mut HashMap<String, ModuleEntry>, info: ModuleInfo) -> bool {
        let name = info.manifest.name.clone();
        if registry.contains_key(&name) {
            tracing::warn!(module = %name, "duplicate module name; manifest ignored");
            return false;
        }
        tracing::info!(
            module = %name,
            version = %info.manifest.version,
            module_type = %info.manifest.module_type,
            "module discovered"
        );
        registry.insert(name, ModuleEntry { info, instance: None });
        true
    }

    // -- Discovery ----------------------------------------------------------

    /// Scan directories for manifest files and register each as
    /// `Discovered`.  Each directory is searched for a `module.toml` direct
    /// child and for `<subdir>/module.toml` one level down.  Unparseable
    /// manifests are skipped with a warning.  Returns the names registered
    /// by this call.
    pub async fn discover(&self, paths: &[PathBuf]) -> Result<Vec<String>> {
        let mut manifest_files = Vec::new();

        for dir in paths {
            if !dir.exists() {
                tracing::debug!(path = %dir.display(), "module directory does not exist");
                continue;
            }

            let direct = dir.join(MANIFEST_FILE);
            if direct.is_file() {
                manifest_files.push(direct);
            }

            let entries = std::fs::read_dir(dir).map_err(|e| KernelError::Configuration {
                reason: format!("cannot scan {}: {e}", dir.display()),
            })?;
            for entry in entries.flatten() {
                let candidate = entry.path().join(MANIFEST_FILE);
                if entry.path().is_dir() && candidate.is_file() {
                    manifest_files.push(candidate);
                }
            }
        }

        let mut registered = Vec::new();
        let mut registry = self.inner.registry.lock().await;

        for path in manifest_files {
            match ModuleManifest::load(&path) {
                Ok(manifest) => {
                    let name = manifest.name.clone();
                    let mtime = manifest_mtime(&path);
                    let info = ModuleInfo::discovered(manifest, Some(path), mtime);
                    if Self::register_entry(&mut registry, info) {
                        registered.push(name);
                    }
                }
                Err(e) => {
                    tracing::warn!(path = %path.display(), error = %e, "failed to parse manifest");
                }
            }
        }

        tracing::info!(count = registered.len(), "manifest discovery complete");
        Ok(registered)
    }

    // -- Dependency resolution ----------------------------------------------

    /// Topologically sort the registry by hard dependencies (Kahn's
    /// algorithm).  Ties among ready nodes break by ascending declared
    /// priority, then name, so the order is deterministic.  A residual set
    /// after the sort is a cycle and fails the whole resolution.
    pub async fn resolve_order(&self) -> Result<Vec<String>> {
        let registry = self.inner.registry.lock().await;
        Self::resolve_order_locked(&registry)
    }

    fn resolve_order_locked(registry: &HashMap<String, ModuleEntry>) -> Result<Vec<String>> {
        let mut indegree: HashMap<&str, usize> = HashMap::new();
        let mut dependents: HashMap<&str, Vec<&str>> = HashMap::new();

        for (name, entry) in registry.iter() {
            indegree.entry(name).or_insert(0);
            for dep in &entry.info.manifest.dependencies.modules {
                // Edges to unknown modules are not part of the graph; the
                // missing dependency is reported at load time instead.
                if let Some((dep_key, _)) = registry.get_key_value(dep.as_str()) {
                    *indegree.entry(name).or_insert(0) += 1;
                    dependents.entry(dep_key).or_default().push(name);
                }
            }
        }

        let mut ready: Vec<&str> = indegree
            .iter()
            .filter(|(_, degree)| **degree == 0)
            .map(|(name, _)| *name)
            .collect();

        let mut order = Vec::with_capacity(registry.len());
        while !ready.is_empty() {
            ready.sort_by_key(|name| {
                let priority = registry[*name].info.manifest.priority;
                (priority.index(), *name)
            });
            let next = ready.remove(0);
            order.push(next.to_string());

            for dependent in dependents.get(next).into_iter().flatten() {
                if let Some(degree) = indegree.get_mut(dependent) {
                    *degree -= 1;
                    if *degree == 0 {
                        ready.push(*dependent);
                    }
                }
            }
        }

        if order.len() < registry.len() {
            let mut cycle: Vec<String> = registry
                .keys()
                .filter(|name| !order.contains(name))
                .cloned()
                .collect();
            cycle.sort();
            return Err(KernelError::CircularDependency { cycle });
        }

        Ok(order)
    }

    // -- Loading ------------------------------------------------------------

    /// Load one module: verify hard dependencies, construct from the
    /// registered factory, `initialize`, then `start`.
    pub async fn load_module(&self, name: &str) -> Result<()> {
        let mut registry = self.inner.registry.lock().await;
        self.load_locked(&mut registry, name).await
    }

    /// Resolve the full load order and load every module.  A cycle aborts
    /// the batch before anything loads; an individual module failure is
    /// reported and the batch continues.  Returns the successfully loaded
    /// names in load order.
    pub async fn load_all(&self) -> Result<Vec<String>> {
        let mut registry = self.inner.registry.lock().await;
        let order = Self::resolve_order_locked(&registry)?;

        let mut loaded = Vec::new();
        for name in order {
            match self.load_locked(&mut registry, &name).await {
                Ok(()) => loaded.push(name),
                Err(e) => {
                    tracing::error!(module = %name, error = %e, "module failed to load; batch continues");
                }
            }
        }

        tracing::info!(loaded = loaded.len(), total = registry.len(), "batch load complete");
        Ok(loaded)
    }

    async fn load_locked(
        &self,
        registry: &mut HashMap<String, ModuleEntry>,
        name: &str,
    ) -> Result<()> {
        let entry = registry.get(name).ok_or_else(|| KernelError::ModuleNotFound {
            module: name.to_string(),
        })?;

        if entry.info.state == ModuleState::Running {
            tracing::debug!(module = %name, "already running; load skipped");
            return Ok(());
        }

        // Hard dependencies must be running; optional ones never block.
        for dep in entry.info.manifest.dependencies.modules.clone() {
            let running = registry
                .get(&dep)
                .map(|e| e.info.state == ModuleState::Running)
                .unwrap_or(false);
            if !running {
                let err = KernelError::ModuleLoad {
                    module: name.to_string(),
                    reason: format!("hard dependency `{dep}` is not running"),
                };
                self.fail_module(registry, name, &err.to_string()).await;
                return Err(err);
            }
        }

        let factory = match self.inner.factories.get(name) {
            Some(f) => Arc::clone(&f),
            None => {
                let err = KernelError::ModuleLoad {
                    module: name.to_string(),
                    reason: "no factory registered for this module".to_string(),
                };
                self.fail_module(registry, name, &err.to_string()).await;
                return Err(err);
            }
        };

        let Some(entry) = registry.get_mut(name) else {
            return Err(KernelError::ModuleNotFound {
                module: name.to_string(),
            });
        };
        entry.info.state = ModuleState::Loading;
        let mut instance = factory();
        entry.info.state = ModuleState::Loaded;

        let ctx = ModuleContext {
            name: name.to_string(),
            bus: self.inner.bus.clone(),
            scheduler: self.inner.scheduler.clone(),
            config: entry.info.manifest.config.clone(),
        };

        entry.info.state = ModuleState::Initializing;
        if let Err(e) = instance.initialize(ctx).await {
            let err = KernelError::ModuleLoad {
                module: name.to_string(),
                reason: format!("initialize failed: {e}"),
            };
            self.fail_module(registry, name, &err.to_string()).await;
            return Err(err);
        }

        if let Err(e) = instance.start().await {
            // Roll back what initialize may have acquired before dropping
            // the half-started instance.
            if let Err(stop_err) = instance.stop().await {
                tracing::debug!(module = %name, error = %stop_err, "cleanup stop failed");
            }
            let err = KernelError::ModuleLoad {
                module: name.to_string(),
                reason: format!("start failed: {e}"),
            };
            self.fail_module(registry, name, &err.to_string()).await;
            return Err(err);
        }

        let Some(entry) = registry.get_mut(name) else {
            return Err(KernelError::ModuleNotFound {
                module: name.to_string(),
            });
        };
        entry.info.state = ModuleState::Running;
        entry.info.last_error = None;
        entry.info.loaded_at = Some(Utc::now());
        entry.instance = Some(Arc::new(Mutex::new(instance)));

        tracing::info!(module = %name, "module running");
        self.emit(
            Event::new("module.loaded", "orchestrator")
                .with_data("module", serde_json::json!(name)),
        )
        .await;

        Ok(())
    }

    /// Mark a module failed, record the cause, and clean up partial state so
    /// no orphaned subscriptions or half-started instances remain.
    async fn fail_module(
        &self,
        registry: &mut HashMap<String, ModuleEntry>,
        name: &str,
        reason: &str,
    ) {
        if let Some(entry) = registry.get_mut(name) {
            entry.info.state = ModuleState::Failed;
            entry.info.last_error = Some(reason.to_string());
            entry.instance = None;
        }
        self.inner.bus.unsubscribe_all(name);

        self.emit(
            Event::new("module.load_failed", "orchestrator")
                .with_priority(EventPriority::High)
                .with_data("module", serde_json::json!(name))
                .with_data("error", serde_json::json!(reason)),
        )
        .await;
    }

    // -- Unloading ----------------------------------------------------------

    /// Unload a module.  Refused while other running modules still declare
    /// it as a hard dependency, unless `force` is set.
    pub async fn unload_module(&self, name: &str, force: bool) -> Result<()> {
        let mut registry = self.inner.registry.lock().await;
        self.unload_locked(&mut registry, name, force).await
    }

    async fn unload_locked(
        &self,
        registry: &mut HashMap<String, ModuleEntry>,
        name: &str,
        force: bool,
    ) -> Result<()> {
        if !registry.contains_key(name) {
            return Err(KernelError::ModuleNotFound {
                module: name.to_string(),
            });
        }

        let mut dependents: Vec<String> = registry
            .iter()
            .filter(|(other, entry)| {
                other.as_str() != name
                    && entry.info.state == ModuleState::Running
                    && entry
                        .info
                        .manifest
                        .dependencies
                        .modules
                        .iter()
                        .any(|d| d == name)
            })
            .map(|(other, _)| other.clone())
            .collect();
        dependents.sort();

        if !dependents.is_empty() {
            if !force {
                return Err(KernelError::DependencyViolation {
                    module: name.to_string(),
                    dependents,
                });
            }
            tracing::warn!(
                module = %name,
                dependents = ?dependents,
                "force-unloading module with running dependents"
            );
        }

        let Some(entry) = registry.get_mut(name) else {
            return Err(KernelError::ModuleNotFound {
                module: name.to_string(),
            });
        };
        entry.info.state = ModuleState::Unloading;

        if let Some(instance) = entry.instance.take() {
            let mut guard = instance.lock().await;
            if let Err(e) = guard.stop().await {
                tracing::warn!(module = %name, error = %e, "module stop failed during unload");
                entry.info.last_error = Some(e.to_string());
            }
        }

        self.inner.bus.unsubscribe_all(name);

        entry.info.state = ModuleState::Unloaded;
        entry.info.loaded_at = None;
        entry.info.health = None;

        tracing::info!(module = %name, "module unloaded");
        self.emit(
            Event::new("module.unloaded", "orchestrator")
                .with_data("module", serde_json::json!(name)),
        )
        .await;

        Ok(())
    }

    /// Remove a module from the registry entirely.  The module must not be
    /// running.
    pub async fn unregister(&self, name: &str) -> Result<()> {
        let mut registry = self.inner.registry.lock().await;
        match registry.get(name) {
            None => Err(KernelError::ModuleNotFound {
                module: name.to_string(),
            }),
            Some(entry) if entry.info.state == ModuleState::Running => {
                Err(KernelError::Validation {
                    reason: format!("module `{name}` must be unloaded before unregistering"),
                })
            }
            Some(_) => {
                registry.remove(name);
                tracing::info!(module = %name, "module unregistered");
                Ok(())
            }
        }
    }

    // -- Reload -------------------------------------------------------------

    /// Unload (forced), re-read the manifest from disk so config changes
    /// take effect, and load again.  This is the hot-reload path and also
    /// how `Failed` state is cleared.
    pub async fn reload_module(&self, name: &str) -> Result<()> {
        let mut registry = self.inner.registry.lock().await;

        let has_instance = registry
            .get(name)
            .ok_or_else(|| KernelError::ModuleNotFound {
                module: name.to_string(),
            })?
            .instance
            .is_some();

        if has_instance {
            self.unload_locked(&mut registry, name, true).await?;
        }

        let Some(entry) = registry.get_mut(name) else {
            return Err(KernelError::ModuleNotFound {
                module: name.to_string(),
            });
        };
        if let Some(path) = entry.info.manifest_path.clone() {
            match ModuleManifest::load(&path) {
                Ok(manifest) => {
                    entry.info.manifest = manifest;
                    entry.info.source_mtime = manifest_mtime(&path);
                }
                Err(e) => {
                    tracing::warn!(
                        module = %name,
                        error = %e,
                        "manifest re-read failed; reloading with previous manifest"
                    );
                }
            }
        }
        entry.info.state = ModuleState::Discovered;
        entry.info.last_error = None;

        self.load_locked(&mut registry, name).await
    }

    // -- Hot reload watcher --------------------------------------------------

    /// Spawn the background watcher that compares manifest mtimes at the
    /// given interval and reloads hot-reload-enabled modules whose source
    /// changed on disk.
    pub fn start_hot_reload(&self, interval: Duration) -> JoinHandle<()> {
        let orchestrator = self.clone();
        tokio::spawn(async move {
            tracing::info!(interval_ms = interval.as_millis() as u64, "hot-reload watcher started");
            loop {
                tokio::select! {
                    _ = orchestrator.inner.watcher_stop.notified() => break,
                    _ = tokio::time::sleep(interval) => {}
                }

                for name in orchestrator.stale_modules().await {
                    tracing::info!(module = %name, "manifest changed on disk; hot-reloading");
                    if let Err(e) = orchestrator.reload_module(&name).await {
                        tracing::warn!(module = %name, error = %e, "hot-reload failed");
                    }
                }
            }
            tracing::info!("hot-reload watcher stopped");
        })
    }

    /// Signal the hot-reload watcher to exit.
    pub fn stop_hot_reload(&self) {
        self.inner.watcher_stop.notify_one();
    }

    async fn stale_modules(&self) -> Vec<String> {
        let registry = self.inner.registry.lock().await;
        registry
            .iter()
            .filter(|(_, entry)| {
                entry.info.manifest.hot_reload && entry.info.state == ModuleState::Running
            })
            .filter_map(|(name, entry)| {
                let path = entry.info.manifest_path.as_ref()?;
                let current = manifest_mtime(path)?;
                (Some(current) != entry.info.source_mtime).then(|| name.clone())
            })
            .collect()
    }

    // -- Shutdown -----------------------------------------------------------

    /// Unload every module in reverse priority order (background tiers
    /// first) and stop the watcher.  Used during kernel shutdown.
    pub async fn shutdown(&self) {
        self.stop_hot_reload();

        let mut registry = self.inner.registry.lock().await;

        let mut names: Vec<(usize, String)> = registry
            .iter()
            .filter(|(_, entry)| entry.instance.is_some())
            .map(|(name, entry)| (entry.info.manifest.priority.index(), name.clone()))
            .collect();
        // Reverse priority: the lowest-priority/background modules go first.
        names.sort_by(|a, b| b.0.cmp(&a.0).then_with(|| a.1.cmp(&b.1)));

        for (_, name) in names {
            if let Err(e) = self.unload_locked(&mut registry, &name, true).await {
                tracing::warn!(module = %name, error = %e, "unload failed during shutdown");
            }
        }

        tracing::info!("orchestrator shut down");
    }

    // -- Introspection (used by the health monitor and operators) -----------

    /// Snapshot of one module's registry record.
    pub async fn module_info(&self, name: &str) -> Option<ModuleInfo> {
        let registry = self.inner.registry.lock().await;
        registry.get(name).map(|e| e.info.clone())
    }

    /// Snapshot of every registry record.
    pub async fn list_modules(&self) -> Vec<ModuleInfo> {
        let registry = self.inner.registry.lock().await;
        registry.values().map(|e| e.info.clone()).collect()
    }

    /// Handles to every running instance, for health polling.  The registry
    /// lock is released before any instance lock is taken.
    pub async fn running_instances(&self) -> Vec<(String, ModuleInstance)> {
        let registry = self.inner.registry.lock().await;
        registry
            .iter()
            .filter(|(_, entry)| entry.info.state == ModuleState::Running)
            .filter_map(|(name, entry)| {
                entry
                    .instance
                    .as_ref()
                    .map(|i| (name.clone(), Arc::clone(i)))
            })
            .collect()
    }

    /// Names of `Failed` modules whose manifest opts into auto-restart.
    pub async fn restart_candidates(&self) -> Vec<String> {
        let registry = self.inner.registry.lock().await;
        let mut names: Vec<String> = registry
            .iter()
            .filter(|(_, entry)| {
                entry.info.state == ModuleState::Failed && entry.info.manifest.auto_restart
            })
            .map(|(name, _)| name.clone())
            .collect();
        names.sort();
        names
    }

    /// (running, failed, total) module counts.
    pub async fn counts(&self) -> (usize, usize, usize) {
        let registry = self.inner.registry.lock().await;
        let running = registry
            .values()
            .filter(|e| e.info.state == ModuleState::Running)
            .count();
        let failed = registry
            .values()
            .filter(|e| e.info.state == ModuleState::Failed)
            .count();
        (running, failed, registry.len())
    }

    /// Record the latest polled health status for a module.
    pub async fn record_health(&self, name: &str, status: HealthStatus) {
        let mut registry = self.inner.registry.lock().await;
        if let Some(entry) = registry.get_mut(name) {
            entry.info.health = Some(status);
        }
    }

    /// Forward a configuration change to every running module.
    pub async fn notify_config_change(&self, changed: Vec<String>, config: serde_json::Value) {
        for (name, instance) in self.running_instances().await {
            let mut guard = instance.lock().await;
            if let Err(e) = guard.on_config_change(&changed, &config).await {
                tracing::warn!(module = %name, error = %e, "on_config_change failed");
            }
        }
    }

    // -- Private helpers ----------------------------------------------------

    /// Publish a lifecycle event, tolerating a stopped bus (expected during
    /// startup and shutdown).
    async fn emit(&self, event: Event) {
        if let Err(e) = self.inner.bus.publish(event).await {
            tracing::trace!(error = %e, "lifecycle event not published");
        }
    }
}

fn manifest_mtime(path: &Path) -> Option<SystemTime> {
    std::fs::metadata(path).and_then(|m| m.modified()).ok()
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::health::HealthCheck;
    use crate::scheduler::SchedulerConfig;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicU32, Ordering};

    /// Minimal well-behaved module that counts lifecycle calls.
    struct TestModule {
        starts: Arc<AtomicU32>,
        stops: Arc<AtomicU32>,
        fail_on_start: bool,
    }

    #[async_trait]
    impl Module for TestModule {
        async fn initialize(&mut self, ctx: ModuleContext) -> Result<()> {
            ctx.subscribe("test.*", crate::bus::handler(|_| async { Ok(()) }))?;
            Ok(())
        }

        async fn start(&mut self) -> Result<()> {
            if self.fail_on_start {
                return Err(KernelError::Internal("boom".to_string()));
            }
            self.starts.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }

        async fn stop(&mut self) -> Result<()> {
            self.stops.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }

        async fn health_check(&self) -> Result<HealthCheck> {
            Ok(HealthCheck::healthy("test-module", "ok"))
        }
    }

    struct Fixture {
        orchestrator: ModuleOrchestrator,
        starts: Arc<AtomicU32>,
        stops: Arc<AtomicU32>,
    }

    fn fixture() -> Fixture {
        let bus = EventBus::default();
        bus.start();
        let scheduler = PriorityScheduler::new(SchedulerConfig::default(), bus.clone());
        Fixture {
            orchestrator: ModuleOrchestrator::new(bus, scheduler),
            starts: Arc::new(AtomicU32::new(0)),
            stops: Arc::new(AtomicU32::new(0)),
        }
    }

    impl Fixture {
        fn factory(&self, fail_on_start: bool) -> ModuleFactory {
            let starts = Arc::clone(&self.starts);
            let stops = Arc::clone(&self.stops);
            Arc::new(move || {
                Box::new(TestModule {
                    starts: Arc::clone(&starts),
                    stops: Arc::clone(&stops),
                    fail_on_start,
                })
            })
        }

        async fn add_module(&self, name: &str, deps: &[&str], priority: EventPriority) {
            let mut manifest = ModuleManifest::new(name, "1.0.0");
            manifest.dependencies.modules = deps.iter().map(|s| s.to_string()).collect();
            manifest.priority = priority;
            self.orchestrator.register_manifest(manifest).await;
            self.orchestrator.register_factory(name, self.factory(false));
        }
    }

    #[tokio::test]
    async fn loads_in_dependency_order() {
        let fx = fixture();
        // Register out of order on purpose.
        fx.add_module("c", &["b"], EventPriority::Normal).await;
        fx.add_module("a", &[], EventPriority::Normal).await;
        fx.add_module("b", &["a"], EventPriority::Normal).await;

        let order = fx.orchestrator.resolve_order().await.unwrap();
        assert_eq!(order, vec!["a", "b", "c"]);

        let loaded = fx.orchestrator.load_all().await.unwrap();
        assert_eq!(loaded, vec!["a", "b", "c"]);
        assert_eq!(fx.starts.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn diamond_dependency_is_valid() {
        let fx = fixture();
        fx.add_module("a", &[], EventPriority::Normal).await;
        fx.add_module("b", &["a"], EventPriority::Normal).await;
        fx.add_module("c", &["b", "a"], EventPriority::Normal).await;

        let order = fx.orchestrator.resolve_order().await.unwrap();
        assert_eq!(order, vec!["a", "b", "c"]);
    }

    #[tokio::test]
    async fn cycle_fails_batch_and_loads_nothing() {
        let fx = fixture();
        fx.add_module("a", &["c"], EventPriority::Normal).await;
        fx.add_module("b", &["a"], EventPriority::Normal).await;
        fx.add_module("c", &["b"], EventPriority::Normal).await;

        let err = fx.orchestrator.load_all().await.unwrap_err();
        match err {
            KernelError::CircularDependency { cycle } => {
                assert_eq!(cycle, vec!["a", "b", "c"]);
            }
            other => panic!("expected CircularDependency, got {other}"),
        }
        assert_eq!(fx.starts.load(Ordering::SeqCst), 0);
        let (running, _, _) = fx.orchestrator.counts().await;
        assert_eq!(running, 0);
    }

    #[tokio::test]
    async fn priority_breaks_ties_among_ready_nodes() {
        let fx = fixture();
        fx.add_module("zeta", &[], EventPriority::Critical).await;
        fx.add_module("alpha", &[], EventPriority::Low).await;
        fx.add_module("mid", &[], EventPriority::Normal).await;

        let order = fx.orchestrator.resolve_order().await.unwrap();
        assert_eq!(order, vec!["zeta", "mid", "alpha"]);
    }

    #[tokio::test]
    async fn load_failure_marks_failed_and_cleans_up() {
        let fx = fixture();
        let mut manifest = ModuleManifest::new("broken", "1.0.0");
        manifest.auto_restart = true;
        fx.orchestrator.register_manifest(manifest).await;
        fx.orchestrator
            .register_factory("broken", fx.factory(true));

        let err = fx.orchestrator.load_module("broken").await.unwrap_err();
        assert!(matches!(err, KernelError::ModuleLoad { .. }));

        let info = fx.orchestrator.module_info("broken").await.unwrap();
        assert_eq!(info.state, ModuleState::Failed);
        assert!(info.last_error.is_some());

        // The subscription made in initialize was rolled back.
        let bus_stats = fx.orchestrator.inner.bus.stats();
        assert_eq!(bus_stats.wildcard_patterns, 0);

        assert_eq!(
            fx.orchestrator.restart_candidates().await,
            vec!["broken".to_string()]
        );
    }

    #[tokio::test]
    async fn missing_factory_fails_load() {
        let fx = fixture();
        fx.orchestrator
            .register_manifest(ModuleManifest::new("ghost", "1.0.0"))
            .await;

        let err = fx.orchestrator.load_module("ghost").await.unwrap_err();
        assert!(matches!(err, KernelError::ModuleLoad { .. }));
    }

    #[tokio::test]
    async fn unload_refused_while_dependents_run() {
        let fx = fixture();
        fx.add_module("a", &[], EventPriority::Normal).await;
        fx.add_module("b", &["a"], EventPriority::Normal).await;
        fx.orchestrator.load_all().await.unwrap();

        let err = fx.orchestrator.unload_module("a", false).await.unwrap_err();
        match err {
            KernelError::DependencyViolation { dependents, .. } => {
                assert_eq!(dependents, vec!["b".to_string()]);
            }
            other => panic!("expected DependencyViolation, got {other}"),
        }

        // Force proceeds.
        fx.orchestrator.unload_module("a", true).await.unwrap();
        let info = fx.orchestrator.module_info("a").await.unwrap();
        assert_eq!(info.state, ModuleState::Unloaded);
        assert_eq!(fx.stops.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn reload_clears_failed_state() {
        let fx = fixture();
        fx.orchestrator
            .register_manifest(ModuleManifest::new("flaky", "1.0.0"))
            .await;
        fx.orchestrator.register_factory("flaky", fx.factory(true));

        assert!(fx.orchestrator.load_module("flaky").await.is_err());

        // Swap in a working factory, as if the module was fixed.
        fx.orchestrator.register_factory("flaky", fx.factory(false));
        fx.orchestrator.reload_module("flaky").await.unwrap();

        let info = fx.orchestrator.module_info("flaky").await.unwrap();
        assert_eq!(info.state, ModuleState::Running);
        assert!(info.last_error.is_none());
    }

    #[tokio::test]
    async fn discover_from_directories() {
        let tmp = tempfile::tempdir().unwrap();
        let dir = tmp.path().join("alpha");
        std::fs::create_dir(&dir).unwrap();
        std::fs::write(
            dir.join(MANIFEST_FILE),
            "name = \"alpha\"\nversion = \"1.0.0\"\n",
        )
        .unwrap();

        // Duplicate name in a second directory is skipped with a warning.
        let dup = tmp.path().join("alpha-copy");
        std::fs::create_dir(&dup).unwrap();
        std::fs::write(
            dup.join(MANIFEST_FILE),
            "name = \"alpha\"\nversion = \"2.0.0\"\n",
        )
        .unwrap();

        let fx = fixture();
        let registered = fx
            .orchestrator
            .discover(&[tmp.path().to_path_buf()])
            .await
            .unwrap();
        assert_eq!(registered, vec!["alpha"]);

        let info = fx.orchestrator.module_info("alpha").await.unwrap();
        assert_eq!(info.state, ModuleState::Discovered);
        assert!(info.manifest_path.is_some());
        assert!(info.source_mtime.is_some());
    }

    #[tokio::test]
    async fn shutdown_unloads_reverse_priority() {
        let fx = fixture();
        fx.add_module("critical-mod", &[], EventPriority::Critical).await;
        fx.add_module("deferred-mod", &[], EventPriority::Deferred).await;
        fx.orchestrator.load_all().await.unwrap();

        fx.orchestrator.shutdown().await;
        let (running, _, _) = fx.orchestrator.counts().await;
        assert_eq!(running, 0);
        assert_eq!(fx.stops.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn unregister_requires_unloaded() {
        let fx = fixture();
        fx.add_module("m", &[], EventPriority::Normal).await;
        fx.orchestrator.load_all().await.unwrap();

        assert!(fx.orchestrator.unregister("m").await.is_err());
        fx.orchestrator.unload_module("m", false).await.unwrap();
        fx.orchestrator.unregister("m").await.unwrap();
        assert!(fx.orchestrator.module_info("m").await.is_none());
    }
}
