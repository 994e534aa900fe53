//! Publish/subscribe event bus with pattern matching.
//!
//! The bus fans each published [`Event`] out to the union of subscribers
//! whose pattern matches its type: exact patterns live in a fast-path map,
//! wildcard patterns (`module.*`) are compiled to anchored regexes once at
//! subscribe time.  Every delivery runs as its own tokio task, so a slow or
//! failing subscriber never stalls the publisher or its peers.
//!
//! Failed deliveries are counted and retained in a bounded dead-letter ring
//! for inspection; every publish is appended to a bounded history ring.
//! When a durable [`EventLog`] collaborator is configured, persistent
//! publishes append to it *before* fan-out so a crash between append and
//! dispatch still allows replay.
//!
//! # Usage
//!
//! ```rust,no_run
//! # use std::sync::Arc;
//! # use modkit_kernel::bus::{EventBus, handler};
//! # use modkit_kernel::event::Event;
//! # async fn example() {
//! let bus = EventBus::default();
//! bus.start();
//!
//! bus.subscribe("module.*", handler(|event| async move {
//!     println!("{}", event.event_type);
//!     Ok(())
//! })).unwrap();
//!
//! bus.publish(Event::new("module.loaded", "orchestrator")).await.unwrap();
//! # }
//! ```

use std::collections::{HashMap, VecDeque};
use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use regex::Regex;
use tokio::sync::Notify;
use uuid::Uuid;

use crate::error::{KernelError, Result};
use crate::event::{Event, validate_event_type};

// ---------------------------------------------------------------------------
// Handler contract
// ---------------------------------------------------------------------------

/// Identifies one subscription registration.
pub type SubscriptionId = Uuid;

/// A subscriber callback.
///
/// Handlers are async; synchronous work simply returns a ready future.  A
/// returned `Err` marks the delivery failed: it is counted, dead-lettered,
/// and never propagated to the publisher or to other subscribers.
#[async_trait]
pub trait EventHandler: Send + Sync {
    async fn handle(&self, event: Arc<Event>) -> std::result::Result<(), String>;
}

struct FnHandler<F>(F);

#[async_trait]
impl<F, Fut> EventHandler for FnHandler<F>
where
    F: Fn(Arc<Event>) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = std::result::Result<(), String>> + Send + 'static,
{
    async fn handle(&self, event: Arc<Event>) -> std::result::Result<(), String> {
        (self.0)(event).await
    }
}

/// Wrap an async closure as an [`EventHandler`].
pub fn handler<F, Fut>(f: F) -> Arc<dyn EventHandler>
where
    F: Fn(Arc<Event>) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = std::result::Result<(), String>> + Send + 'static,
{
    Arc::new(FnHandler(f))
}

// ---------------------------------------------------------------------------
// Durable log collaborator
// ---------------------------------------------------------------------------

/// Optional durable append-only log the bus persists events to.
///
/// This is a plugin seam, not a requirement: when no log is configured,
/// persistent publishes silently fall back to memory-only delivery.
#[async_trait]
pub trait EventLog: Send + Sync {
    /// Append one event to the named stream.
    async fn append(&self, stream: &str, event: &Event) -> Result<()>;

    /// Read every event in the stream starting at `cursor`, in append order.
    async fn read_from(&self, stream: &str, cursor: usize) -> Result<Vec<Event>>;
}

/// In-memory [`EventLog`] used in tests and single-process deployments.
#[derive(Default)]
pub struct MemoryEventLog {
    streams: DashMap<String, Vec<Event>>,
}

impl MemoryEventLog {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of events recorded in the named stream.
    pub fn len(&self, stream: &str) -> usize {
        self.streams.get(stream).map(|s| s.len()).unwrap_or(0)
    }
}

#[async_trait]
impl EventLog for MemoryEventLog {
    async fn append(&self, stream: &str, event: &Event) -> Result<()> {
        self.streams
            .entry(stream.to_string())
            .or_default()
            .push(event.clone());
        Ok(())
    }

    async fn read_from(&self, stream: &str, cursor: usize) -> Result<Vec<Event>> {
        Ok(self
            .streams
            .get(stream)
            .map(|s| s.iter().skip(cursor).cloned().collect())
            .unwrap_or_default())
    }
}

// ---------------------------------------------------------------------------
// Subscription table
// ---------------------------------------------------------------------------

#[derive(Clone)]
struct Subscription {
    id: SubscriptionId,
    module: Option<String>,
    handler: Arc<dyn EventHandler>,
}

struct WildcardEntry {
    pattern: String,
    regex: Regex,
    subs: Vec<Subscription>,
}

#[derive(Default)]
struct SubscriptionTable {
    /// Exact event-type patterns -- the fast path.
    exact: HashMap<String, Vec<Subscription>>,
    /// Wildcard patterns, compiled once at subscribe time.
    wildcard: Vec<WildcardEntry>,
}

/// Compile a dot-segment glob into an anchored regex.
///
/// `*` matches exactly one segment: `a.*` matches `a.b` but not `a.b.c`
/// or `a`.
fn compile_pattern(pattern: &str) -> Result<Regex> {
    let translated: Vec<String> = pattern
        .split('.')
        .map(|segment| {
            if segment == "*" {
                "[^.]+".to_string()
            } else {
                regex::escape(segment)
            }
        })
        .collect();
    let anchored = format!("^{}$", translated.join(r"\."));

    Regex::new(&anchored).map_err(|e| KernelError::Validation {
        reason: format!("invalid pattern `{pattern}`: {e}"),
    })
}

/// Validate a subscription pattern: like an event type, but `*` is allowed
/// as a whole segment.
fn validate_pattern(pattern: &str) -> Result<()> {
    if pattern.is_empty() {
        return Err(KernelError::Validation {
            reason: "subscription pattern must not be empty".to_string(),
        });
    }

    for segment in pattern.split('.') {
        if segment == "*" {
            continue;
        }
        if segment.is_empty() {
            return Err(KernelError::Validation {
                reason: format!("pattern `{pattern}` contains an empty segment"),
            });
        }
        if segment.contains('*') {
            return Err(KernelError::Validation {
                reason: format!("pattern `{pattern}`: `*` must be a whole segment"),
            });
        }
        if !segment
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
        {
            return Err(KernelError::Validation {
                reason: format!("pattern `{pattern}` contains invalid characters"),
            });
        }
    }

    Ok(())
}

// ---------------------------------------------------------------------------
// Dead letters, stats, config
// ---------------------------------------------------------------------------

/// A delivery that permanently failed, retained for inspection.
#[derive(Debug, Clone)]
pub struct DeadLetter {
    pub event: Arc<Event>,
    pub subscription: SubscriptionId,
    pub module: Option<String>,
    pub reason: String,
    pub timestamp: DateTime<Utc>,
}

/// Snapshot of bus counters.
#[derive(Debug, Clone, Copy, Default)]
pub struct EventBusStats {
    pub published: u64,
    pub delivered: u64,
    pub failed: u64,
    pub dead_lettered: u64,
    pub exact_patterns: usize,
    pub wildcard_patterns: usize,
}

/// Bus tuning knobs.
#[derive(Debug, Clone)]
pub struct EventBusConfig {
    /// Capacity of the introspection history ring.
    pub history_capacity: usize,
    /// Capacity of the dead-letter ring.
    pub dead_letter_capacity: usize,
    /// How long `stop` waits for in-flight dispatch before giving up.
    pub shutdown_grace: Duration,
}

impl Default for EventBusConfig {
    fn default() -> Self {
        Self {
            history_capacity: 256,
            dead_letter_capacity: 128,
            shutdown_grace: Duration::from_secs(5),
        }
    }
}

// ---------------------------------------------------------------------------
// EventBus
// ---------------------------------------------------------------------------

/// In-process publish/subscribe fabric.
///
/// Cheaply cloneable (`Arc`-backed) and `Send + Sync`.
#[derive(Clone)]
pub struct EventBus {
    inner: Arc<BusInner>,
}

struct BusInner {
    config: EventBusConfig,
    subs: RwLock<SubscriptionTable>,
    log: RwLock<Option<Arc<dyn EventLog>>>,
    running: AtomicBool,
    in_flight: AtomicUsize,
    drained: Notify,
    published: AtomicU64,
    delivered: AtomicU64,
    failed: AtomicU64,
    dead_lettered: AtomicU64,
    history: Mutex<VecDeque<Arc<Event>>>,
    dead_letters: Mutex<VecDeque<DeadLetter>>,
}

impl EventBus {
    /// Create a bus with the given configuration.  The bus starts stopped;
    /// call [`EventBus::start`] before publishing.
    #[must_use]
    pub fn new(config: EventBusConfig) -> Self {
        Self {
            inner: Arc::new(BusInner {
                config,
                subs: RwLock::new(SubscriptionTable::default()),
                log: RwLock::new(None),
                running: AtomicBool::new(false),
                in_flight: AtomicUsize::new(0),
                drained: Notify::new(),
                published: AtomicU64::new(0),
                delivered: AtomicU64::new(0),
                failed: AtomicU64::new(0),
                dead_lettered: AtomicU64::new(0),
                history: Mutex::new(VecDeque::new()),
                dead_letters: Mutex::new(VecDeque::new()),
            }),
        }
    }

    /// Attach a durable log collaborator used by persistent publishes and
    /// replay.
    pub fn set_event_log(&self, log: Arc<dyn EventLog>) {
        *self.inner.log.write().unwrap_or_else(|e| e.into_inner()) = Some(log);
        tracing::info!("durable event log attached to bus");
    }

    /// Begin accepting publishes.
    pub fn start(&self) {
        self.inner.running.store(true, Ordering::Release);
        tracing::info!("event bus started");
    }

    /// Whether the bus currently accepts publishes.
    pub fn is_running(&self) -> bool {
        self.inner.running.load(Ordering::Acquire)
    }

    // -- Publishing ---------------------------------------------------------

    /// Publish an event to every matching subscriber, memory-only.
    ///
    /// Returns the number of handlers the event was dispatched to.  The call
    /// is fire-and-forget with respect to subscriber execution: each delivery
    /// runs as its own tokio task.
    pub async fn publish(&self, event: Event) -> Result<usize> {
        self.publish_inner(event, false).await
    }

    /// Publish an event, appending it to the durable log **before** fan-out.
    ///
    /// The event is appended to the stream named after its event type.  When
    /// no log collaborator is configured, persistence is skipped silently and
    /// the event is delivered memory-only.
    pub async fn publish_persistent(&self, event: Event) -> Result<usize> {
        self.publish_inner(event, true).await
    }

    async fn publish_inner(&self, event: Event, persist: bool) -> Result<usize> {
        if !self.is_running() {
            return Err(KernelError::BusNotRunning);
        }
        validate_event_type(&event.event_type)?;

        let event = Arc::new(event);

        if persist {
            let log = self
                .inner
                .log
                .read()
                .unwrap_or_else(|e| e.into_inner())
                .clone();
            match log {
                Some(log) => {
                    // Append-before-fan-out: a crash after this point can
                    // still be recovered by replay.
                    log.append(&event.event_type, &event).await?;
                }
                None => {
                    tracing::trace!(
                        event_type = %event.event_type,
                        "persist requested but no event log configured; delivering memory-only"
                    );
                }
            }
        }

        self.record_history(Arc::clone(&event));
        self.inner.published.fetch_add(1, Ordering::Relaxed);

        Ok(self.fan_out(event))
    }

    /// Dispatch one event through the matching path.  Returns the number of
    /// deliveries spawned.
    fn fan_out(&self, event: Arc<Event>) -> usize {
        let matches = self.matching_subscriptions(&event);

        tracing::trace!(
            event_type = %event.event_type,
            event_id = %event.id,
            handlers = matches.len(),
            "event fan-out"
        );

        for sub in &matches {
            self.inner.in_flight.fetch_add(1, Ordering::AcqRel);

            let inner = Arc::clone(&self.inner);
            let sub = sub.clone();
            let event = Arc::clone(&event);

            tokio::spawn(async move {
                match sub.handler.handle(Arc::clone(&event)).await {
                    Ok(()) => {
                        inner.delivered.fetch_add(1, Ordering::Relaxed);
                    }
                    Err(reason) => {
                        inner.failed.fetch_add(1, Ordering::Relaxed);
                        tracing::warn!(
                            event_type = %event.event_type,
                            event_id = %event.id,
                            module = sub.module.as_deref().unwrap_or("-"),
                            error = %reason,
                            "subscriber failed; event dead-lettered"
                        );
                        BusInner::push_dead_letter(
                            &inner,
                            DeadLetter {
                                event,
                                subscription: sub.id,
                                module: sub.module,
                                reason,
                                timestamp: Utc::now(),
                            },
                        );
                    }
                }

                if inner.in_flight.fetch_sub(1, Ordering::AcqRel) == 1 {
                    inner.drained.notify_one();
                }
            });
        }

        matches.len()
    }

    /// Compute the union of exact and wildcard matches for an event,
    /// deduplicated by handler identity and filtered by destination.
    fn matching_subscriptions(&self, event: &Event) -> Vec<Subscription> {
        let table = self.inner.subs.read().unwrap_or_else(|e| e.into_inner());

        let mut seen: Vec<usize> = Vec::new();
        let mut matches = Vec::new();

        let mut push = |sub: &Subscription| {
            // Dedup by handler identity: the same handler registered under
            // several matching patterns is invoked once per publish.
            let key = Arc::as_ptr(&sub.handler) as *const () as usize;
            if seen.contains(&key) {
                return;
            }
            if let Some(dest) = &event.destination {
                if sub.module.as_deref() != Some(dest.as_str()) {
                    return;
                }
            }
            seen.push(key);
            matches.push(sub.clone());
        };

        if let Some(subs) = table.exact.get(&event.event_type) {
            for sub in subs {
                push(sub);
            }
        }

        for entry in &table.wildcard {
            if entry.regex.is_match(&event.event_type) {
                for sub in &entry.subs {
                    push(sub);
                }
            }
        }

        matches
    }

    // -- Subscriptions ------------------------------------------------------

    /// Subscribe a handler to an exact event type or a wildcard pattern.
    pub fn subscribe(&self, pattern: &str, handler: Arc<dyn EventHandler>) -> Result<SubscriptionId> {
        self.subscribe_owned(pattern, None, handler)
    }

    /// Subscribe on behalf of a module, so [`EventBus::unsubscribe_all`] can
    /// remove every registration at unload time.
    pub fn subscribe_owned(
        &self,
        pattern: &str,
        module: Option<&str>,
        handler: Arc<dyn EventHandler>,
    ) -> Result<SubscriptionId> {
        validate_pattern(pattern)?;

        let sub = Subscription {
            id: Uuid::now_v7(),
            module: module.map(str::to_string),
            handler,
        };
        let id = sub.id;

        let mut table = self.inner.subs.write().unwrap_or_else(|e| e.into_inner());

        if pattern.contains('*') {
            if let Some(entry) = table.wildcard.iter_mut().find(|e| e.pattern == pattern) {
                entry.subs.push(sub);
            } else {
                let regex = compile_pattern(pattern)?;
                table.wildcard.push(WildcardEntry {
                    pattern: pattern.to_string(),
                    regex,
                    subs: vec![sub],
                });
            }
        } else {
            table.exact.entry(pattern.to_string()).or_default().push(sub);
        }

        tracing::debug!(
            pattern = %pattern,
            module = module.unwrap_or("-"),
            subscription = %id,
            "subscription added"
        );

        Ok(id)
    }

    /// Remove one registration.  Returns `true` if it existed.
    pub fn unsubscribe(&self, pattern: &str, id: SubscriptionId) -> bool {
        let mut table = self.inner.subs.write().unwrap_or_else(|e| e.into_inner());

        let removed = if pattern.contains('*') {
            let mut removed = false;
            if let Some(entry) = table.wildcard.iter_mut().find(|e| e.pattern == pattern) {
                let before = entry.subs.len();
                entry.subs.retain(|s| s.id != id);
                removed = entry.subs.len() < before;
            }
            table.wildcard.retain(|e| !e.subs.is_empty());
            removed
        } else if let Some(subs) = table.exact.get_mut(pattern) {
            let before = subs.len();
            subs.retain(|s| s.id != id);
            let removed = subs.len() < before;
            if subs.is_empty() {
                table.exact.remove(pattern);
            }
            removed
        } else {
            false
        };

        if removed {
            tracing::debug!(pattern = %pattern, subscription = %id, "subscription removed");
        }
        removed
    }

    /// Remove every registration owned by `module`.  Returns the number
    /// removed.  Used by the orchestrator on unload.
    pub fn unsubscribe_all(&self, module: &str) -> usize {
        let mut table = self.inner.subs.write().unwrap_or_else(|e| e.into_inner());
        let mut removed = 0;

        table.exact.retain(|_, subs| {
            let before = subs.len();
            subs.retain(|s| s.module.as_deref() != Some(module));
            removed += before - subs.len();
            !subs.is_empty()
        });

        for entry in &mut table.wildcard {
            let before = entry.subs.len();
            entry.subs.retain(|s| s.module.as_deref() != Some(module));
            removed += before - entry.subs.len();
        }
        table.wildcard.retain(|e| !e.subs.is_empty());

        if removed > 0 {
            tracing::debug!(module = %module, count = removed, "module subscriptions removed");
        }
        removed
    }

    // -- Replay -------------------------------------------------------------

    /// Re-materialize events from the durable log in original order.
    ///
    /// Fails with [`KernelError::MessageBus`] when no log collaborator is
    /// configured.
    pub async fn replay(&self, stream: &str, cursor: usize) -> Result<Vec<Arc<Event>>> {
        let log = self
            .inner
            .log
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
            .ok_or_else(|| KernelError::MessageBus {
                reason: "replay requested but no event log configured".to_string(),
            })?;

        let events = log.read_from(stream, cursor).await?;
        tracing::debug!(stream = %stream, cursor, count = events.len(), "events replayed");
        Ok(events.into_iter().map(Arc::new).collect())
    }

    /// Replay events and re-dispatch them through the normal handler-matching
    /// path.  Returns the total number of deliveries spawned.
    pub async fn replay_dispatch(&self, stream: &str, cursor: usize) -> Result<usize> {
        if !self.is_running() {
            return Err(KernelError::BusNotRunning);
        }

        let events = self.replay(stream, cursor).await?;
        let mut dispatched = 0;
        for event in events {
            dispatched += self.fan_out(event);
        }
        Ok(dispatched)
    }

    // -- Introspection ------------------------------------------------------

    /// Snapshot of the bus counters and table sizes.
    pub fn stats(&self) -> EventBusStats {
        let table = self.inner.subs.read().unwrap_or_else(|e| e.into_inner());
        EventBusStats {
            published: self.inner.published.load(Ordering::Relaxed),
            delivered: self.inner.delivered.load(Ordering::Relaxed),
            failed: self.inner.failed.load(Ordering::Relaxed),
            dead_lettered: self.inner.dead_lettered.load(Ordering::Relaxed),
            exact_patterns: table.exact.len(),
            wildcard_patterns: table.wildcard.len(),
        }
    }

    /// Recent events, oldest first.
    pub fn history(&self) -> Vec<Arc<Event>> {
        self.inner
            .history
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .iter()
            .cloned()
            .collect()
    }

    /// Retained failed deliveries, oldest first.
    pub fn dead_letters(&self) -> Vec<DeadLetter> {
        self.inner
            .dead_letters
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .iter()
            .cloned()
            .collect()
    }

    // -- Shutdown -----------------------------------------------------------

    /// Stop accepting publishes and wait for in-flight dispatch to drain,
    /// up to the configured grace period.  Stragglers are detached tasks and
    /// are left to finish on their own.
    pub async fn stop(&self) {
        self.inner.running.store(false, Ordering::Release);

        let drain = async {
            loop {
                if self.inner.in_flight.load(Ordering::Acquire) == 0 {
                    break;
                }
                self.inner.drained.notified().await;
            }
        };

        match tokio::time::timeout(self.inner.config.shutdown_grace, drain).await {
            Ok(()) => tracing::info!("event bus stopped; all dispatch drained"),
            Err(_) => tracing::warn!(
                in_flight = self.inner.in_flight.load(Ordering::Acquire),
                "event bus stopped with dispatch still in flight"
            ),
        }
    }

    // -- Private helpers ----------------------------------------------------

    fn record_history(&self, event: Arc<Event>) {
        let mut history = self
            .inner
            .history
            .lock()
            .unwrap_or_else(|e| e.into_inner());
        if history.len() >= self.inner.config.history_capacity {
            history.pop_front();
        }
        history.push_back(event);
    }
}

impl BusInner {
    fn push_dead_letter(inner: &Arc<BusInner>, letter: DeadLetter) {
        let mut dead = inner
            .dead_letters
            .lock()
            .unwrap_or_else(|e| e.into_inner());
        if dead.len() >= inner.config.dead_letter_capacity {
            dead.pop_front();
        }
        dead.push_back(letter);
        inner.dead_lettered.fetch_add(1, Ordering::Relaxed);
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(EventBusConfig::default())
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicU32;

    fn counting_handler(counter: Arc<AtomicU32>) -> Arc<dyn EventHandler> {
        handler(move |_event| {
            let counter = Arc::clone(&counter);
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }
        })
    }

    async fn settle() {
        tokio::time::sleep(Duration::from_millis(50)).await;
    }

    #[tokio::test]
    async fn publish_requires_running_bus() {
        let bus = EventBus::default();
        let result = bus.publish(Event::new("a.b", "test")).await;
        assert!(matches!(result, Err(KernelError::BusNotRunning)));

        bus.start();
        assert!(bus.publish(Event::new("a.b", "test")).await.is_ok());

        bus.stop().await;
        let result = bus.publish(Event::new("a.b", "test")).await;
        assert!(matches!(result, Err(KernelError::BusNotRunning)));
    }

    #[tokio::test]
    async fn exact_and_wildcard_union() {
        let bus = EventBus::default();
        bus.start();

        let exact = Arc::new(AtomicU32::new(0));
        let wild = Arc::new(AtomicU32::new(0));
        bus.subscribe("module.loaded", counting_handler(Arc::clone(&exact)))
            .unwrap();
        bus.subscribe("module.*", counting_handler(Arc::clone(&wild)))
            .unwrap();

        let dispatched = bus
            .publish(Event::new("module.loaded", "orchestrator"))
            .await
            .unwrap();
        assert_eq!(dispatched, 2);

        settle().await;
        assert_eq!(exact.load(Ordering::SeqCst), 1);
        assert_eq!(wild.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn wildcard_matches_single_segment_only() {
        let bus = EventBus::default();
        bus.start();

        let counter = Arc::new(AtomicU32::new(0));
        bus.subscribe("a.*", counting_handler(Arc::clone(&counter)))
            .unwrap();

        assert_eq!(bus.publish(Event::new("a.b", "t")).await.unwrap(), 1);
        assert_eq!(bus.publish(Event::new("a.c", "t")).await.unwrap(), 1);
        assert_eq!(bus.publish(Event::new("a.b.c", "t")).await.unwrap(), 0);
        assert_eq!(bus.publish(Event::new("a", "t")).await.unwrap(), 0);

        settle().await;
        assert_eq!(counter.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn same_handler_two_matching_patterns_invoked_once() {
        let bus = EventBus::default();
        bus.start();

        let counter = Arc::new(AtomicU32::new(0));
        let h = counting_handler(Arc::clone(&counter));
        bus.subscribe("module.loaded", Arc::clone(&h)).unwrap();
        bus.subscribe("module.*", h).unwrap();

        let dispatched = bus
            .publish(Event::new("module.loaded", "t"))
            .await
            .unwrap();
        assert_eq!(dispatched, 1);

        settle().await;
        assert_eq!(counter.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn failing_handler_is_isolated_and_dead_lettered() {
        let bus = EventBus::default();
        bus.start();

        let ok_count = Arc::new(AtomicU32::new(0));
        bus.subscribe(
            "job.run",
            handler(|_| async { Err("handler exploded".to_string()) }),
        )
        .unwrap();
        bus.subscribe("job.run", counting_handler(Arc::clone(&ok_count)))
            .unwrap();

        bus.publish(Event::new("job.run", "t")).await.unwrap();
        settle().await;

        // The healthy subscriber still received the event.
        assert_eq!(ok_count.load(Ordering::SeqCst), 1);

        let dead = bus.dead_letters();
        assert_eq!(dead.len(), 1);
        assert_eq!(dead[0].reason, "handler exploded");
        assert_eq!(dead[0].event.event_type, "job.run");

        let stats = bus.stats();
        assert_eq!(stats.failed, 1);
        assert_eq!(stats.delivered, 1);
    }

    #[tokio::test]
    async fn destination_restricts_delivery() {
        let bus = EventBus::default();
        bus.start();

        let for_alpha = Arc::new(AtomicU32::new(0));
        let for_beta = Arc::new(AtomicU32::new(0));
        bus.subscribe_owned("ping.sent", Some("alpha"), counting_handler(Arc::clone(&for_alpha)))
            .unwrap();
        bus.subscribe_owned("ping.sent", Some("beta"), counting_handler(Arc::clone(&for_beta)))
            .unwrap();

        bus.publish(Event::new("ping.sent", "t").with_destination("alpha"))
            .await
            .unwrap();
        settle().await;

        assert_eq!(for_alpha.load(Ordering::SeqCst), 1);
        assert_eq!(for_beta.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn unsubscribe_all_removes_module_registrations() {
        let bus = EventBus::default();
        bus.start();

        let counter = Arc::new(AtomicU32::new(0));
        bus.subscribe_owned("a.b", Some("m"), counting_handler(Arc::clone(&counter)))
            .unwrap();
        bus.subscribe_owned("a.*", Some("m"), counting_handler(Arc::clone(&counter)))
            .unwrap();
        bus.subscribe_owned("c.d", Some("other"), counting_handler(Arc::clone(&counter)))
            .unwrap();

        assert_eq!(bus.unsubscribe_all("m"), 2);

        assert_eq!(bus.publish(Event::new("a.b", "t")).await.unwrap(), 0);
        assert_eq!(bus.publish(Event::new("c.d", "t")).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn unsubscribe_single_registration() {
        let bus = EventBus::default();
        bus.start();

        let counter = Arc::new(AtomicU32::new(0));
        let id = bus
            .subscribe("x.y", counting_handler(Arc::clone(&counter)))
            .unwrap();

        assert!(bus.unsubscribe("x.y", id));
        assert!(!bus.unsubscribe("x.y", id));
        assert_eq!(bus.publish(Event::new("x.y", "t")).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn invalid_patterns_rejected() {
        let bus = EventBus::default();
        let noop = handler(|_| async { Ok(()) });

        assert!(bus.subscribe("", Arc::clone(&noop)).is_err());
        assert!(bus.subscribe("a..b", Arc::clone(&noop)).is_err());
        assert!(bus.subscribe("a.b*", Arc::clone(&noop)).is_err());
        assert!(bus.subscribe("a.*", noop).is_ok());
    }

    #[tokio::test]
    async fn persistent_publish_and_replay() {
        let bus = EventBus::default();
        let log = Arc::new(MemoryEventLog::new());
        bus.set_event_log(log.clone());
        bus.start();

        let first = Event::new("order.created", "shop").with_data("n", serde_json::json!(1));
        let second = Event::new("order.created", "shop").with_data("n", serde_json::json!(2));
        let first_id = first.id;

        bus.publish_persistent(first).await.unwrap();
        bus.publish_persistent(second).await.unwrap();
        assert_eq!(log.len("order.created"), 2);

        // Replay preserves original order.
        let replayed = bus.replay("order.created", 0).await.unwrap();
        assert_eq!(replayed.len(), 2);
        assert_eq!(replayed[0].id, first_id);

        // Cursor skips already-seen events.
        let tail = bus.replay("order.created", 1).await.unwrap();
        assert_eq!(tail.len(), 1);

        // A late subscriber recovers missed state through re-dispatch.
        let counter = Arc::new(AtomicU32::new(0));
        bus.subscribe("order.created", counting_handler(Arc::clone(&counter)))
            .unwrap();
        let dispatched = bus.replay_dispatch("order.created", 0).await.unwrap();
        assert_eq!(dispatched, 2);
        settle().await;
        assert_eq!(counter.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn persist_without_log_is_memory_only() {
        let bus = EventBus::default();
        bus.start();

        // No log configured: persistence silently skipped.
        assert!(
            bus.publish_persistent(Event::new("a.b", "t"))
                .await
                .is_ok()
        );
        assert!(bus.replay("a.b", 0).await.is_err());
    }

    #[tokio::test]
    async fn history_is_bounded() {
        let bus = EventBus::new(EventBusConfig {
            history_capacity: 4,
            ..Default::default()
        });
        bus.start();

        for i in 0..10 {
            bus.publish(Event::new("tick.tock", "t").with_data("i", serde_json::json!(i)))
                .await
                .unwrap();
        }

        let history = bus.history();
        assert_eq!(history.len(), 4);
        assert_eq!(history[0].data["i"], serde_json::json!(6));
        assert_eq!(bus.stats().published, 10);
    }

    #[tokio::test]
    async fn slow_subscriber_does_not_block_publisher() {
        let bus = EventBus::default();
        bus.start();

        bus.subscribe(
            "slow.event",
            handler(|_| async {
                tokio::time::sleep(Duration::from_secs(5)).await;
                Ok(())
            }),
        )
        .unwrap();

        let started = std::time::Instant::now();
        bus.publish(Event::new("slow.event", "t")).await.unwrap();
        assert!(started.elapsed() < Duration::from_millis(500));
    }
}
