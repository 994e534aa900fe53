//! Kernel façade: construction, wiring and lifecycle of all subsystems.
//!
//! [`Kernel`] owns one [`EventBus`], one [`PriorityScheduler`], one
//! [`ModuleOrchestrator`], one [`HealthMonitor`] and one
//! [`ConfigManager`], wired together so embedders only touch this type:
//!
//! ```rust,no_run
//! # use modkit_kernel::kernel::{Kernel, KernelConfig};
//! # async fn example() -> modkit_kernel::error::Result<()> {
//! let kernel = Kernel::new(KernelConfig::default());
//! // kernel.register_module(manifest, factory).await;
//! kernel.init().await?;
//! kernel.run();
//! // ... the process does its work ...
//! kernel.shutdown().await;
//! # Ok(())
//! # }
//! ```
//!
//! Startup order: bus first, then configuration (file, then environment
//! overrides), then module discovery and batch load.  Shutdown reverses
//! it: monitors stop, modules unload while the bus still delivers their
//! lifecycle events, then the scheduler and finally the bus drain.

use std::path::PathBuf;
use std::sync::Mutex;
use std::time::Duration;

use modkit_config::ConfigManager;
use tokio::task::JoinHandle;

use crate::bus::{EventBus, EventBusConfig, EventLog};
use crate::error::Result;
use crate::health::{HealthMonitor, HealthMonitorConfig};
use crate::manifest::ModuleManifest;
use crate::module::ModuleFactory;
use crate::orchestrator::ModuleOrchestrator;
use crate::scheduler::{PriorityScheduler, SchedulerConfig};

/// Top-level kernel configuration, one field per subsystem.
#[derive(Debug, Clone)]
pub struct KernelConfig {
    pub bus: EventBusConfig,
    pub scheduler: SchedulerConfig,
    pub health: HealthMonitorConfig,
    /// Directories scanned for module manifests during [`Kernel::init`].
    pub module_paths: Vec<PathBuf>,
    /// How often the hot-reload watcher compares manifest mtimes.
    pub hot_reload_interval: Duration,
    /// Optional TOML file merged into the configuration tree at init.
    pub config_file: Option<PathBuf>,
}

impl Default for KernelConfig {
    fn default() -> Self {
        Self {
            bus: EventBusConfig::default(),
            scheduler: SchedulerConfig::default(),
            health: HealthMonitorConfig::default(),
            module_paths: vec![PathBuf::from("modules")],
            hot_reload_interval: Duration::from_secs(2),
            config_file: None,
        }
    }
}

/// The assembled runtime kernel.
pub struct Kernel {
    config: KernelConfig,
    settings: ConfigManager,
    bus: EventBus,
    scheduler: PriorityScheduler,
    orchestrator: ModuleOrchestrator,
    monitor: HealthMonitor,
    /// Background task handles collected by [`Kernel::run`], joined or
    /// aborted on shutdown.
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl Kernel {
    /// Assemble every subsystem.  Nothing starts until [`Kernel::init`].
    #[must_use]
    pub fn new(config: KernelConfig) -> Self {
        let bus = EventBus::new(config.bus.clone());
        let scheduler = PriorityScheduler::new(config.scheduler.clone(), bus.clone());
        let orchestrator = ModuleOrchestrator::new(bus.clone(), scheduler.clone());
        let monitor = HealthMonitor::new(config.health.clone(), orchestrator.clone());

        Self {
            config,
            settings: ConfigManager::new(),
            bus,
            scheduler,
            orchestrator,
            monitor,
            tasks: Mutex::new(Vec::new()),
        }
    }

    // -- Accessors ----------------------------------------------------------

    pub fn bus(&self) -> &EventBus {
        &self.bus
    }

    pub fn scheduler(&self) -> &PriorityScheduler {
        &self.scheduler
    }

    pub fn orchestrator(&self) -> &ModuleOrchestrator {
        &self.orchestrator
    }

    pub fn monitor(&self) -> &HealthMonitor {
        &self.monitor
    }

    /// The layered configuration tree shared with modules.
    pub fn settings(&self) -> &ConfigManager {
        &self.settings
    }

    /// Attach a durable event log used by persistent publishes and replay.
    pub fn set_event_log(&self, log: std::sync::Arc<dyn EventLog>) {
        self.bus.set_event_log(log);
    }

    /// Register a module programmatically: its manifest plus the factory
    /// that constructs instances.
    pub async fn register_module(&self, manifest: ModuleManifest, factory: ModuleFactory) {
        let name = manifest.name.clone();
        self.orchestrator.register_manifest(manifest).await;
        self.orchestrator.register_factory(name, factory);
    }

    // -- Lifecycle ----------------------------------------------------------

    /// Bring the kernel up: start the bus, layer configuration (file, then
    /// environment), discover manifests, and batch-load every module in
    /// dependency order.  Returns the loaded module names.
    pub async fn init(&self) -> Result<Vec<String>> {
        tracing::info!("kernel initializing");
        self.bus.start();

        if let Some(file) = &self.config.config_file {
            self.settings.load_file(file)?;
        }
        self.settings.apply_env_overrides();

        if !self.config.module_paths.is_empty() {
            self.orchestrator.discover(&self.config.module_paths).await?;
        }

        let loaded = self.orchestrator.load_all().await?;
        tracing::info!(modules = loaded.len(), "kernel initialized");
        Ok(loaded)
    }

    /// Start the background machinery: scheduler worker pools, the
    /// hot-reload watcher, the health monitor, and the bridge that forwards
    /// configuration changes to running modules.
    pub fn run(&self) {
        let mut tasks = self.tasks.lock().unwrap_or_else(|e| e.into_inner());

        tasks.extend(self.scheduler.start());
        tasks.push(self.orchestrator.start_hot_reload(self.config.hot_reload_interval));
        tasks.push(self.monitor.start());

        // Config listeners are synchronous; module notification is async
        // work, so it hops onto the runtime.
        let orchestrator = self.orchestrator.clone();
        self.settings.on_change(std::sync::Arc::new(move |changed, snapshot| {
            let orchestrator = orchestrator.clone();
            let changed = changed.to_vec();
            let snapshot = snapshot.clone();
            tokio::spawn(async move {
                orchestrator.notify_config_change(changed, snapshot).await;
            });
        }));

        tracing::info!("kernel running");
    }

    /// Graceful teardown: stop the monitors, unload every module in reverse
    /// priority order while the bus still delivers lifecycle events, then
    /// drain the scheduler and the bus.
    pub async fn shutdown(&self) {
        tracing::info!("kernel shutting down");

        self.monitor.stop();
        self.orchestrator.shutdown().await;

        self.scheduler.shutdown();
        let tasks: Vec<JoinHandle<()>> = {
            let mut guard = self.tasks.lock().unwrap_or_else(|e| e.into_inner());
            guard.drain(..).collect()
        };
        for task in tasks {
            // Workers exit once their queue drains; watchers were signalled
            // above.
            if tokio::time::timeout(Duration::from_secs(5), task).await.is_err() {
                tracing::warn!("background task did not stop in time");
            }
        }

        self.bus.stop().await;
        tracing::info!("kernel stopped");
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Result as KernelResult;
    use crate::health::HealthCheck;
    use crate::module::{Module, ModuleContext};
    use async_trait::async_trait;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicU32, Ordering};

    struct Probe {
        started: Arc<AtomicU32>,
        stopped: Arc<AtomicU32>,
        config_changes: Arc<AtomicU32>,
    }

    #[async_trait]
    impl Module for Probe {
        async fn initialize(&mut self, _ctx: ModuleContext) -> KernelResult<()> {
            Ok(())
        }
        async fn start(&mut self) -> KernelResult<()> {
            self.started.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
        async fn stop(&mut self) -> KernelResult<()> {
            self.stopped.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
        async fn health_check(&self) -> KernelResult<HealthCheck> {
            Ok(HealthCheck::healthy("probe", "ok"))
        }
        async fn on_config_change(
            &mut self,
            _changed: &[String],
            _config: &serde_json::Value,
        ) -> KernelResult<()> {
            self.config_changes.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    fn probe_factory(
        started: &Arc<AtomicU32>,
        stopped: &Arc<AtomicU32>,
        config_changes: &Arc<AtomicU32>,
    ) -> ModuleFactory {
        let started = Arc::clone(started);
        let stopped = Arc::clone(stopped);
        let config_changes = Arc::clone(config_changes);
        Arc::new(move || {
            Box::new(Probe {
                started: Arc::clone(&started),
                stopped: Arc::clone(&stopped),
                config_changes: Arc::clone(&config_changes),
            })
        })
    }

    fn quiet_config() -> KernelConfig {
        KernelConfig {
            module_paths: Vec::new(),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn full_lifecycle() {
        let started = Arc::new(AtomicU32::new(0));
        let stopped = Arc::new(AtomicU32::new(0));
        let changes = Arc::new(AtomicU32::new(0));

        let kernel = Kernel::new(quiet_config());
        kernel
            .register_module(
                ModuleManifest::new("probe", "1.0.0"),
                probe_factory(&started, &stopped, &changes),
            )
            .await;

        let loaded = kernel.init().await.unwrap();
        assert_eq!(loaded, vec!["probe"]);
        assert_eq!(started.load(Ordering::SeqCst), 1);

        kernel.run();
        kernel.shutdown().await;
        assert_eq!(stopped.load(Ordering::SeqCst), 1);
        assert!(!kernel.bus().is_running());
    }

    #[tokio::test]
    async fn config_change_reaches_modules() {
        let started = Arc::new(AtomicU32::new(0));
        let stopped = Arc::new(AtomicU32::new(0));
        let changes = Arc::new(AtomicU32::new(0));

        let kernel = Kernel::new(quiet_config());
        kernel
            .register_module(
                ModuleManifest::new("probe", "1.0.0"),
                probe_factory(&started, &stopped, &changes),
            )
            .await;
        kernel.init().await.unwrap();
        kernel.run();

        kernel
            .settings()
            .set("probe.verbose", serde_json::json!(true))
            .unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(changes.load(Ordering::SeqCst), 1);

        kernel.shutdown().await;
    }

    #[tokio::test]
    async fn init_loads_config_file() {
        let tmp = tempfile::tempdir().unwrap();
        let file = tmp.path().join("kernel.toml");
        std::fs::write(&file, "[bus]\nhistory_capacity = 42\n").unwrap();

        let kernel = Kernel::new(KernelConfig {
            module_paths: Vec::new(),
            config_file: Some(file),
            ..Default::default()
        });
        kernel.init().await.unwrap();

        assert_eq!(
            kernel.settings().get("bus.history_capacity"),
            Some(serde_json::json!(42))
        );
        kernel.shutdown().await;
    }

    #[tokio::test]
    async fn init_discovers_from_module_paths() {
        let tmp = tempfile::tempdir().unwrap();
        let dir = tmp.path().join("echo");
        std::fs::create_dir(&dir).unwrap();
        std::fs::write(
            dir.join(crate::manifest::MANIFEST_FILE),
            "name = \"echo\"\nversion = \"1.0.0\"\n",
        )
        .unwrap();

        let started = Arc::new(AtomicU32::new(0));
        let stopped = Arc::new(AtomicU32::new(0));
        let changes = Arc::new(AtomicU32::new(0));

        let kernel = Kernel::new(KernelConfig {
            module_paths: vec![tmp.path().to_path_buf()],
            ..Default::default()
        });
        kernel
            .orchestrator()
            .register_factory("echo", probe_factory(&started, &stopped, &changes));

        let loaded = kernel.init().await.unwrap();
        assert_eq!(loaded, vec!["echo"]);
        kernel.shutdown().await;
    }
}
