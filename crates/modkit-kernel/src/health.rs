//! Periodic health polling, aggregation and auto-restart.
//!
//! The monitor asks every running module for a [`HealthCheck`] at a fixed
//! interval, folds the answers into one aggregate status for the whole
//! process, and publishes the result as a `system.health_check` event so
//! modules (and operators tailing the bus) can react.  Modules that failed
//! and opted into `auto_restart` in their manifest are reloaded on the same
//! tick.
//!
//! Aggregation is a pure function of the healthy fraction, so it is tested
//! directly without spinning up the polling loop.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::Notify;
use tokio::task::JoinHandle;

use crate::event::{Event, EventPriority};
use crate::orchestrator::ModuleOrchestrator;

// ---------------------------------------------------------------------------
// Status and report types
// ---------------------------------------------------------------------------

/// Three-level health verdict, for one module or for the whole process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HealthStatus {
    Healthy,
    Degraded,
    Unhealthy,
}

impl std::fmt::Display for HealthStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Healthy => "healthy",
            Self::Degraded => "degraded",
            Self::Unhealthy => "unhealthy",
        };
        write!(f, "{s}")
    }
}

/// One health report from one component.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthCheck {
    /// Who is reporting.
    pub component: String,
    pub status: HealthStatus,
    /// Free-form operator-facing explanation.
    pub message: String,
    pub timestamp: DateTime<Utc>,
    /// Numeric gauges the component chooses to expose.
    #[serde(default)]
    pub metrics: HashMap<String, f64>,
}

impl HealthCheck {
    pub fn healthy(component: impl Into<String>, message: impl Into<String>) -> Self {
        Self::with_status(component, HealthStatus::Healthy, message)
    }

    pub fn degraded(component: impl Into<String>, message: impl Into<String>) -> Self {
        Self::with_status(component, HealthStatus::Degraded, message)
    }

    pub fn unhealthy(component: impl Into<String>, message: impl Into<String>) -> Self {
        Self::with_status(component, HealthStatus::Unhealthy, message)
    }

    fn with_status(
        component: impl Into<String>,
        status: HealthStatus,
        message: impl Into<String>,
    ) -> Self {
        Self {
            component: component.into(),
            status,
            message: message.into(),
            timestamp: Utc::now(),
            metrics: HashMap::new(),
        }
    }

    /// Attach a numeric gauge to the report.
    #[must_use]
    pub fn with_metric(mut self, name: impl Into<String>, value: f64) -> Self {
        self.metrics.insert(name.into(), value);
        self
    }
}

// ---------------------------------------------------------------------------
// Monitor
// ---------------------------------------------------------------------------

/// Monitor tuning knobs.
#[derive(Debug, Clone)]
pub struct HealthMonitorConfig {
    /// How often the poll loop runs.
    pub interval: Duration,
    /// Healthy fraction at or above which a partially unhealthy process is
    /// `Degraded` rather than `Unhealthy`.
    pub degraded_threshold: f64,
    /// How long one module gets to answer a health check before it is
    /// counted unhealthy.
    pub check_timeout: Duration,
}

impl Default for HealthMonitorConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(30),
            degraded_threshold: 0.7,
            check_timeout: Duration::from_secs(5),
        }
    }
}

/// Result of one monitor tick.
#[derive(Debug, Clone)]
pub struct HealthSnapshot {
    pub aggregate: HealthStatus,
    pub module_status: HashMap<String, HealthStatus>,
    pub healthy: usize,
    pub total: usize,
    pub failed_modules: usize,
}

/// Polls module health, publishes aggregate reports, restarts failed
/// modules that asked for it.
///
/// Cheaply cloneable (`Arc`-backed).
#[derive(Clone)]
pub struct HealthMonitor {
    inner: Arc<MonitorInner>,
}

struct MonitorInner {
    config: HealthMonitorConfig,
    orchestrator: ModuleOrchestrator,
    stop: Notify,
    started: Instant,
}

impl HealthMonitor {
    #[must_use]
    pub fn new(config: HealthMonitorConfig, orchestrator: ModuleOrchestrator) -> Self {
        Self {
            inner: Arc::new(MonitorInner {
                config,
                orchestrator,
                stop: Notify::new(),
                started: Instant::now(),
            }),
        }
    }

    /// Spawn the background poll loop.
    pub fn start(&self) -> JoinHandle<()> {
        let monitor = self.clone();
        tokio::spawn(async move {
            tracing::info!(
                interval_ms = monitor.inner.config.interval.as_millis() as u64,
                "health monitor started"
            );
            loop {
                tokio::select! {
                    _ = monitor.inner.stop.notified() => break,
                    _ = tokio::time::sleep(monitor.inner.config.interval) => {}
                }
                monitor.poll().await;
            }
            tracing::info!("health monitor stopped");
        })
    }

    /// Signal the poll loop to exit.
    pub fn stop(&self) {
        self.inner.stop.notify_one();
    }

    /// Run one monitor tick: poll every running module, record and publish
    /// the aggregate, then restart failed auto-restart modules.
    ///
    /// Instance locks are taken one at a time, never under the registry
    /// lock, so a slow health check does not stall lifecycle operations.
    pub async fn poll(&self) -> HealthSnapshot {
        let orchestrator = &self.inner.orchestrator;
        let mut module_status = HashMap::new();

        for (name, instance) in orchestrator.running_instances().await {
            let status = {
                let guard = instance.lock().await;
                let check = tokio::time::timeout(
                    self.inner.config.check_timeout,
                    guard.health_check(),
                )
                .await;
                match check {
                    Ok(Ok(report)) => {
                        tracing::debug!(
                            module = %name,
                            status = %report.status,
                            message = %report.message,
                            "health check"
                        );
                        report.status
                    }
                    Ok(Err(e)) => {
                        tracing::warn!(module = %name, error = %e, "health check failed");
                        HealthStatus::Unhealthy
                    }
                    Err(_) => {
                        tracing::warn!(module = %name, "health check timed out");
                        HealthStatus::Unhealthy
                    }
                }
            };

            orchestrator.record_health(&name, status).await;
            module_status.insert(name, status);
        }

        let healthy = module_status
            .values()
            .filter(|s| **s == HealthStatus::Healthy)
            .count();
        let total = module_status.len();
        let (running, failed_modules, _) = orchestrator.counts().await;

        let aggregate = aggregate_status(healthy, total, self.inner.config.degraded_threshold);

        tracing::info!(
            aggregate = %aggregate,
            healthy,
            total,
            failed = failed_modules,
            "health tick"
        );

        self.publish_report(aggregate, &module_status, healthy, total, running, failed_modules)
            .await;
        self.restart_failed().await;

        HealthSnapshot {
            aggregate,
            module_status,
            healthy,
            total,
            failed_modules,
        }
    }

    async fn publish_report(
        &self,
        aggregate: HealthStatus,
        module_status: &HashMap<String, HealthStatus>,
        healthy: usize,
        total: usize,
        running: usize,
        failed: usize,
    ) {
        let per_module: serde_json::Value = module_status
            .iter()
            .map(|(name, status)| (name.clone(), serde_json::json!(status)))
            .collect::<serde_json::Map<String, serde_json::Value>>()
            .into();

        let scheduler = self.inner.orchestrator.scheduler().stats();
        let bus = self.inner.orchestrator.bus().stats();

        let event = Event::new("system.health_check", "health-monitor")
            .with_data("status", serde_json::json!(aggregate))
            .with_data("modules", per_module)
            .with_data("healthy", serde_json::json!(healthy))
            .with_data("total", serde_json::json!(total))
            .with_data("running", serde_json::json!(running))
            .with_data("failed", serde_json::json!(failed))
            .with_data(
                "uptime_secs",
                serde_json::json!(self.inner.started.elapsed().as_secs()),
            )
            .with_data("queue_depths", serde_json::json!(scheduler.queued))
            .with_data("events_published", serde_json::json!(bus.published))
            .with_data("events_dead_lettered", serde_json::json!(bus.dead_lettered));

        if let Err(e) = self.inner.orchestrator.bus().publish(event).await {
            tracing::trace!(error = %e, "health report not published");
        }
    }

    /// Reload every `Failed` module whose manifest opted into auto-restart.
    /// A restart that fails again is reported as a critical event and left
    /// for the next tick.
    async fn restart_failed(&self) {
        let orchestrator = &self.inner.orchestrator;
        for name in orchestrator.restart_candidates().await {
            tracing::info!(module = %name, "auto-restarting failed module");
            if let Err(e) = orchestrator.reload_module(&name).await {
                tracing::error!(module = %name, error = %e, "auto-restart failed");
                let event = Event::new("system.module_restart_failed", "health-monitor")
                    .with_priority(EventPriority::Critical)
                    .with_data("module", serde_json::json!(name))
                    .with_data("error", serde_json::json!(e.to_string()));
                if let Err(e) = orchestrator.bus().publish(event).await {
                    tracing::trace!(error = %e, "restart failure event not published");
                }
            }
        }
    }
}

/// Fold per-module verdicts into one process-level status.
///
/// No modules at all is vacuously healthy; every module healthy is healthy;
/// a healthy fraction at or above the threshold is degraded; below it the
/// process is unhealthy.
#[must_use]
pub fn aggregate_status(healthy: usize, total: usize, degraded_threshold: f64) -> HealthStatus {
    if total == 0 || healthy == total {
        return HealthStatus::Healthy;
    }
    let fraction = healthy as f64 / total as f64;
    if fraction >= degraded_threshold {
        HealthStatus::Degraded
    } else {
        HealthStatus::Unhealthy
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
