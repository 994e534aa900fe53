//! Priority-tiered task scheduler.
//!
//! Five fixed tiers (`Critical` through `Deferred`), each backed by its own
//! FIFO [`crossbeam::queue::SegQueue`] and its own pool of worker loops.
//! Tiers are deliberately separate structures rather than one merged heap:
//! a stalled or backlogged tier can never block another tier's forward
//! progress, because the pools share nothing but the bus handle.
//!
//! Each work item wraps one [`Event`] and the handler that must process it.
//! On success the scheduler publishes a `task.completed` event with the
//! observed latency; on failure the item is retried with exponential backoff
//! until its retry budget is exhausted, at which point exactly one
//! `task.failed` event is published (durably, when a log is attached).
//!
//! Ordering guarantee: within one tier, items are dequeued in enqueue order.
//! Across tiers there is no relative ordering by design.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use crossbeam::queue::SegQueue;
use tokio::sync::Notify;
use tokio::task::JoinHandle;

use crate::bus::{EventBus, EventHandler};
use crate::error::{KernelError, Result};
use crate::event::{Event, EventPriority};

// ---------------------------------------------------------------------------
// Public types
// ---------------------------------------------------------------------------

/// One unit of queued work: an event plus the handler that must process it.
pub struct QueueItem {
    /// The event being processed.
    pub event: Arc<Event>,
    /// The tier this item was enqueued on.
    pub tier: EventPriority,
    /// When the item entered the queue.
    pub enqueued_at: DateTime<Utc>,
    /// Retries consumed so far.
    pub retries: u32,
    /// Retry budget.
    pub max_retries: u32,
    handler: Arc<dyn EventHandler>,
}

/// Scheduler tuning knobs.
#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    /// Worker pool size per tier, indexed by [`EventPriority::index`].
    pub workers: [usize; 5],
    /// Default retry budget for [`PriorityScheduler::enqueue`].
    pub max_retries: u32,
    /// Base delay for exponential backoff.
    pub backoff_base: Duration,
    /// Upper bound on a single backoff delay.
    pub backoff_cap: Duration,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            workers: [4, 8, 16, 4, 2],
            max_retries: 3,
            backoff_base: Duration::from_millis(100),
            backoff_cap: Duration::from_secs(30),
        }
    }
}

/// Snapshot of scheduler counters and per-tier queue depths.
#[derive(Debug, Clone, Copy, Default)]
pub struct SchedulerStats {
    /// Queue depth per tier, indexed by [`EventPriority::index`].
    pub queued: [usize; 5],
    pub processed: u64,
    pub failed: u64,
    pub retried: u64,
}

// ---------------------------------------------------------------------------
// Scheduler
// ---------------------------------------------------------------------------

/// Priority-tiered scheduler with disjoint worker pools.
///
/// Cheaply cloneable (`Arc`-backed) and safe to share across tasks.
#[derive(Clone)]
pub struct PriorityScheduler {
    inner: Arc<SchedulerInner>,
}

struct TierQueue {
    queue: SegQueue<QueueItem>,
    notify: Notify,
}

struct SchedulerInner {
    config: SchedulerConfig,
    tiers: [TierQueue; 5],
    bus: EventBus,
    shutdown: AtomicBool,
    processed: AtomicU64,
    failed: AtomicU64,
    retried: AtomicU64,
}

impl PriorityScheduler {
    /// Create a scheduler **without** starting any workers.  Call
    /// [`PriorityScheduler::start`] to spawn the per-tier pools.
    #[must_use]
    pub fn new(config: SchedulerConfig, bus: EventBus) -> Self {
        Self {
            inner: Arc::new(SchedulerInner {
                config,
                tiers: std::array::from_fn(|_| TierQueue {
                    queue: SegQueue::new(),
                    notify: Notify::new(),
                }),
                bus,
                shutdown: AtomicBool::new(false),
                processed: AtomicU64::new(0),
                failed: AtomicU64::new(0),
                retried: AtomicU64::new(0),
            }),
        }
    }

    /// Spawn every tier's worker pool onto the tokio runtime.
    ///
    /// Returns the worker handles; they resolve once the scheduler shuts
    /// down and the tier queues drain.
    pub fn start(&self) -> Vec<JoinHandle<()>> {
        let mut handles = Vec::new();
        for tier in EventPriority::ALL {
            let pool = self.inner.config.workers[tier.index()];
            for worker in 0..pool {
                let inner = Arc::clone(&self.inner);
                handles.push(tokio::spawn(async move {
                    Self::worker_loop(inner, tier, worker).await;
                }));
            }
        }
        tracing::info!(workers = handles.len(), "scheduler worker pools started");
        handles
    }

    /// Enqueue an event on a tier with the default retry budget.
    pub fn enqueue(
        &self,
        event: Arc<Event>,
        tier: EventPriority,
        handler: Arc<dyn EventHandler>,
    ) -> Result<()> {
        self.enqueue_with_retries(event, tier, handler, self.inner.config.max_retries)
    }

    /// Enqueue with an explicit retry budget.
    pub fn enqueue_with_retries(
        &self,
        event: Arc<Event>,
        tier: EventPriority,
        handler: Arc<dyn EventHandler>,
        max_retries: u32,
    ) -> Result<()> {
        if self.inner.shutdown.load(Ordering::Acquire) {
            return Err(KernelError::SchedulerShutdown);
        }

        tracing::debug!(
            event_type = %event.event_type,
            event_id = %event.id,
            tier = %tier,
            "item enqueued"
        );

        let tq = &self.inner.tiers[tier.index()];
        tq.queue.push(QueueItem {
            event,
            tier,
            enqueued_at: Utc::now(),
            retries: 0,
            max_retries,
            handler,
        });
        tq.notify.notify_one();
        Ok(())
    }

    /// Snapshot of queue depths and counters.
    pub fn stats(&self) -> SchedulerStats {
        let mut queued = [0usize; 5];
        for tier in EventPriority::ALL {
            queued[tier.index()] = self.inner.tiers[tier.index()].queue.len();
        }
        SchedulerStats {
            queued,
            processed: self.inner.processed.load(Ordering::Relaxed),
            failed: self.inner.failed.load(Ordering::Relaxed),
            retried: self.inner.retried.load(Ordering::Relaxed),
        }
    }

    /// Stop accepting new work.  Workers exit once their tier queue drains.
    pub fn shutdown(&self) {
        tracing::info!("scheduler shutdown requested");
        self.inner.shutdown.store(true, Ordering::Release);
        for tier in &self.inner.tiers {
            tier.notify.notify_waiters();
        }
    }

    // -- Private helpers ----------------------------------------------------

    /// Backoff delay for the n-th retry (1-indexed): `base * 2^(n-1)`,
    /// clamped to the configured cap.
    fn backoff_delay(config: &SchedulerConfig, retry: u32) -> Duration {
        let shift = retry.saturating_sub(1).min(16);
        config
            .backoff_base
            .saturating_mul(1u32 << shift)
            .min(config.backoff_cap)
    }

    async fn worker_loop(inner: Arc<SchedulerInner>, tier: EventPriority, worker: usize) {
        tracing::debug!(tier = %tier, worker, "scheduler worker started");
        let idx = tier.index();

        loop {
            match inner.tiers[idx].queue.pop() {
                Some(item) => Self::process(&inner, item).await,
                None => {
                    if inner.shutdown.load(Ordering::Acquire) {
                        break;
                    }
                    // Park until new work arrives.  The sleep arm re-checks
                    // the shutdown flag, covering wakeups lost to the
                    // notify/registration race.
                    tokio::select! {
                        _ = inner.tiers[idx].notify.notified() => {}
                        _ = tokio::time::sleep(Duration::from_millis(100)) => {}
                    }
                }
            }
        }

        tracing::debug!(tier = %tier, worker, "scheduler worker stopped");
    }

    /// Terminal failure path: count the loss and publish exactly one
    /// durable `task.failed` event for the item.
    async fn fail_permanently(inner: &Arc<SchedulerInner>, item: &QueueItem, reason: &str) {
        inner.failed.fetch_add(1, Ordering::Relaxed);

        let failed = Event::new("task.failed", "scheduler")
            .child_of(&item.event)
            .with_priority(EventPriority::High)
            .with_data("event_id", serde_json::json!(item.event.id))
            .with_data("tier", serde_json::json!(item.tier.to_string()))
            .with_data("retries", serde_json::json!(item.retries))
            .with_data("error", serde_json::json!(reason));
        if let Err(e) = inner.bus.publish_persistent(failed).await {
            tracing::warn!(error = %e, "could not publish task.failed");
        }
    }

    async fn process(inner: &Arc<SchedulerInner>, mut item: QueueItem) {
        let started = Instant::now();
        let result = item.handler.handle(Arc::clone(&item.event)).await;

        match result {
            Ok(()) => {
                inner.processed.fetch_add(1, Ordering::Relaxed);
                let latency_ms = started.elapsed().as_millis() as u64;

                tracing::debug!(
                    event_id = %item.event.id,
                    tier = %item.tier,
                    latency_ms,
                    "task completed"
                );

                let completed = Event::new("task.completed", "scheduler")
                    .child_of(&item.event)
                    .with_data("event_id", serde_json::json!(item.event.id))
                    .with_data("tier", serde_json::json!(item.tier.to_string()))
                    .with_data("latency_ms", serde_json::json!(latency_ms));
                if let Err(e) = inner.bus.publish(completed).await {
                    tracing::trace!(error = %e, "could not publish task.completed");
                }
            }
            Err(reason) => {
                if item.retries < item.max_retries {
                    item.retries += 1;
                    inner.retried.fetch_add(1, Ordering::Relaxed);
                    let delay = Self::backoff_delay(&inner.config, item.retries);

                    tracing::warn!(
                        event_id = %item.event.id,
                        tier = %item.tier,
                        retry = item.retries,
                        max_retries = item.max_retries,
                        delay_ms = delay.as_millis() as u64,
                        error = %reason,
                        "task failed; retrying with backoff"
                    );

                    let inner = Arc::clone(inner);
                    tokio::spawn(async move {
                        tokio::time::sleep(delay).await;
                        // Shutdown may have drained the workers during the
                        // backoff; a re-enqueued item would sit in the queue
                        // forever, so it fails terminally instead.
                        if inner.shutdown.load(Ordering::Acquire) {
                            tracing::warn!(
                                event_id = %item.event.id,
                                tier = %item.tier,
                                "scheduler shut down during backoff; failing task"
                            );
                            Self::fail_permanently(&inner, &item, &reason).await;
                            return;
                        }
                        let tq = &inner.tiers[item.tier.index()];
                        tq.queue.push(item);
                        tq.notify.notify_one();
                    });
                } else {
                    tracing::error!(
                        event_id = %item.event.id,
                        tier = %item.tier,
                        retries = item.retries,
                        error = %reason,
                        "task failed permanently; retry budget exhausted"
                    );
                    Self::fail_permanently(inner, &item, &reason).await;
                }
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::handler;
    use std::sync::Mutex;
    use std::sync::atomic::AtomicU32;

    fn single_worker_config() -> SchedulerConfig {
        SchedulerConfig {
            workers: [1, 1, 1, 1, 1],
            max_retries: 3,
            backoff_base: Duration::from_millis(1),
            backoff_cap: Duration::from_millis(10),
        }
    }

    fn started_bus() -> EventBus {
        let bus = EventBus::default();
        bus.start();
        bus
    }

    #[tokio::test]
    async fn processes_item_and_publishes_completion() {
        let bus = started_bus();
        let completions = Arc::new(AtomicU32::new(0));
        let c = Arc::clone(&completions);
        bus.subscribe(
            "task.completed",
            handler(move |_| {
                let c = Arc::clone(&c);
                async move {
                    c.fetch_add(1, Ordering::SeqCst);
                    Ok(())
                }
            }),
        )
        .unwrap();

        let scheduler = PriorityScheduler::new(single_worker_config(), bus);
        let handles = scheduler.start();

        let ran = Arc::new(AtomicU32::new(0));
        let r = Arc::clone(&ran);
        scheduler
            .enqueue(
                Arc::new(Event::new("work.do", "test")),
                EventPriority::Normal,
                handler(move |_| {
                    let r = Arc::clone(&r);
                    async move {
                        r.fetch_add(1, Ordering::SeqCst);
                        Ok(())
                    }
                }),
            )
            .unwrap();

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(ran.load(Ordering::SeqCst), 1);
        assert_eq!(completions.load(Ordering::SeqCst), 1);
        assert_eq!(scheduler.stats().processed, 1);

        scheduler.shutdown();
        for h in handles {
            h.await.unwrap();
        }
    }

    #[tokio::test]
    async fn fifo_order_within_tier() {
        let scheduler = PriorityScheduler::new(single_worker_config(), started_bus());

        let order = Arc::new(Mutex::new(Vec::new()));
        for label in ["first", "second", "third"] {
            let order = Arc::clone(&order);
            scheduler
                .enqueue(
                    Arc::new(Event::new("work.do", "test")),
                    EventPriority::Normal,
                    handler(move |_| {
                        let order = Arc::clone(&order);
                        async move {
                            order.lock().unwrap().push(label);
                            Ok(())
                        }
                    }),
                )
                .unwrap();
        }

        // Start workers after enqueueing so ordering is deterministic.
        let handles = scheduler.start();
        tokio::time::sleep(Duration::from_millis(100)).await;

        assert_eq!(*order.lock().unwrap(), vec!["first", "second", "third"]);

        scheduler.shutdown();
        for h in handles {
            h.await.unwrap();
        }
    }

    #[tokio::test]
    async fn exhausted_retries_produce_one_task_failed() {
        let bus = started_bus();
        let failures = Arc::new(AtomicU32::new(0));
        let f = Arc::clone(&failures);
        bus.subscribe(
            "task.failed",
            handler(move |_| {
                let f = Arc::clone(&f);
                async move {
                    f.fetch_add(1, Ordering::SeqCst);
                    Ok(())
                }
            }),
        )
        .unwrap();

        let scheduler = PriorityScheduler::new(single_worker_config(), bus);
        let handles = scheduler.start();

        let attempts = Arc::new(AtomicU32::new(0));
        let a = Arc::clone(&attempts);
        scheduler
            .enqueue_with_retries(
                Arc::new(Event::new("work.do", "test")),
                EventPriority::Normal,
                handler(move |_| {
                    let a = Arc::clone(&a);
                    async move {
                        a.fetch_add(1, Ordering::SeqCst);
                        Err("always fails".to_string())
                    }
                }),
                2,
            )
            .unwrap();

        tokio::time::sleep(Duration::from_millis(300)).await;

        // Initial attempt plus exactly max_retries retries.
        assert_eq!(attempts.load(Ordering::SeqCst), 3);
        assert_eq!(failures.load(Ordering::SeqCst), 1);

        let stats = scheduler.stats();
        assert_eq!(stats.retried, 2);
        assert_eq!(stats.failed, 1);

        scheduler.shutdown();
        for h in handles {
            h.await.unwrap();
        }
    }

    #[tokio::test]
    async fn stalled_tier_does_not_block_other_tiers() {
        let scheduler = PriorityScheduler::new(single_worker_config(), started_bus());
        let handles = scheduler.start();

        // Stall the only Deferred worker.
        scheduler
            .enqueue(
                Arc::new(Event::new("slow.work", "test")),
                EventPriority::Deferred,
                handler(|_| async {
                    tokio::time::sleep(Duration::from_secs(30)).await;
                    Ok(())
                }),
            )
            .unwrap();

        let ran = Arc::new(AtomicU32::new(0));
        let r = Arc::clone(&ran);
        scheduler
            .enqueue(
                Arc::new(Event::new("urgent.work", "test")),
                EventPriority::Critical,
                handler(move |_| {
                    let r = Arc::clone(&r);
                    async move {
                        r.fetch_add(1, Ordering::SeqCst);
                        Ok(())
                    }
                }),
            )
            .unwrap();

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(ran.load(Ordering::SeqCst), 1, "critical tier made progress");

        scheduler.shutdown();
        for h in handles {
            h.abort();
        }
    }

    #[tokio::test]
    async fn shutdown_during_backoff_fails_task_terminally() {
        let bus = started_bus();
        let failures = Arc::new(AtomicU32::new(0));
        let f = Arc::clone(&failures);
        bus.subscribe(
            "task.failed",
            handler(move |_| {
                let f = Arc::clone(&f);
                async move {
                    f.fetch_add(1, Ordering::SeqCst);
                    Ok(())
                }
            }),
        )
        .unwrap();

        let scheduler = PriorityScheduler::new(
            SchedulerConfig {
                workers: [1, 1, 1, 1, 1],
                max_retries: 3,
                backoff_base: Duration::from_millis(200),
                backoff_cap: Duration::from_secs(1),
            },
            bus,
        );
        let handles = scheduler.start();

        scheduler
            .enqueue(
                Arc::new(Event::new("work.do", "test")),
                EventPriority::Normal,
                handler(|_| async { Err("always fails".to_string()) }),
            )
            .unwrap();

        // First attempt fails fast; its retry is now sleeping out the
        // backoff.  Shut down while it sleeps.
        tokio::time::sleep(Duration::from_millis(50)).await;
        scheduler.shutdown();
        for h in handles {
            h.await.unwrap();
        }

        // The backoff task notices the shutdown and fails the item
        // terminally instead of stranding it in a drained queue.
        tokio::time::sleep(Duration::from_millis(400)).await;
        assert_eq!(failures.load(Ordering::SeqCst), 1);

        let stats = scheduler.stats();
        assert_eq!(stats.failed, 1);
        assert_eq!(stats.queued.iter().sum::<usize>(), 0);
    }

    #[tokio::test]
    async fn shutdown_rejects_new_work() {
        let scheduler = PriorityScheduler::new(single_worker_config(), started_bus());
        scheduler.shutdown();

        let result = scheduler.enqueue(
            Arc::new(Event::new("late.work", "test")),
            EventPriority::Normal,
            handler(|_| async { Ok(()) }),
        );
        assert!(matches!(result, Err(KernelError::SchedulerShutdown)));
    }

    #[test]
    fn backoff_grows_exponentially_and_caps() {
        let config = SchedulerConfig {
            backoff_base: Duration::from_millis(100),
            backoff_cap: Duration::from_secs(1),
            ..Default::default()
        };
        assert_eq!(
            PriorityScheduler::backoff_delay(&config, 1),
            Duration::from_millis(100)
        );
        assert_eq!(
            PriorityScheduler::backoff_delay(&config, 2),
            Duration::from_millis(200)
        );
        assert_eq!(
            PriorityScheduler::backoff_delay(&config, 3),
            Duration::from_millis(400)
        );
        assert_eq!(
            PriorityScheduler::backoff_delay(&config, 10),
            Duration::from_secs(1)
        );
    }
}
