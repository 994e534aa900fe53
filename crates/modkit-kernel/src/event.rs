//! Event value type and priority tiers.
//!
//! An [`Event`] is the only currency modules use to talk to each other.  It is
//! a plain value record: once constructed it is never mutated, and the bus
//! hands it to subscribers behind an [`std::sync::Arc`] so fan-out does not
//! clone the payload.
//!
//! Event types are dotted strings (`module.loaded`, `task.failed`).
//! Subscription patterns may replace whole segments with `*`; published types
//! never contain wildcards.

use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{KernelError, Result};

// ---------------------------------------------------------------------------
// Priority tiers
// ---------------------------------------------------------------------------

/// Priority tier, ordered lowest-number-first.
///
/// The same five tiers are used for the `priority` field carried by every
/// [`Event`] and for selecting a [scheduler](crate::scheduler) lane.  Bus
/// fan-out is priority-blind; only an explicit scheduler enqueue is tiered.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventPriority {
    /// Must execute before anything else.
    Critical = 0,
    /// Important but not safety-critical.
    High = 1,
    /// Default priority for most events.
    Normal = 2,
    /// Background / best-effort.
    Low = 3,
    /// Bulk work that can wait indefinitely.
    Deferred = 4,
}

impl EventPriority {
    /// All tiers in ascending priority-number order.
    pub const ALL: [EventPriority; 5] = [
        EventPriority::Critical,
        EventPriority::High,
        EventPriority::Normal,
        EventPriority::Low,
        EventPriority::Deferred,
    ];

    /// Index of this tier into per-tier arrays.
    pub fn index(self) -> usize {
        self as usize
    }
}

impl Default for EventPriority {
    fn default() -> Self {
        Self::Normal
    }
}

impl fmt::Display for EventPriority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Critical => write!(f, "critical"),
            Self::High => write!(f, "high"),
            Self::Normal => write!(f, "normal"),
            Self::Low => write!(f, "low"),
            Self::Deferred => write!(f, "deferred"),
        }
    }
}

impl FromStr for EventPriority {
    type Err = KernelError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "critical" => Ok(Self::Critical),
            "high" => Ok(Self::High),
            "normal" => Ok(Self::Normal),
            "low" => Ok(Self::Low),
            "deferred" => Ok(Self::Deferred),
            other => Err(KernelError::Validation {
                reason: format!("unknown priority tier `{other}`"),
            }),
        }
    }
}

// ---------------------------------------------------------------------------
// Event
// ---------------------------------------------------------------------------

/// An immutable event record.
///
/// Construct with [`Event::new`] and the `with_*` builder methods; the `id`
/// is a time-ordered UUID v7 assigned once and never changed.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
    /// Globally unique, immutable identifier.
    pub id: Uuid,
    /// Dotted event-type string (e.g. `module.loaded`).
    pub event_type: String,
    /// Name of the module that published this event.
    pub source: String,
    /// Target module; `None` means broadcast to every matching subscriber.
    pub destination: Option<String>,
    /// String-keyed payload.
    pub data: HashMap<String, serde_json::Value>,
    /// Free-form metadata; always contains `created_at`.
    pub metadata: HashMap<String, serde_json::Value>,
    /// When the event was constructed.
    pub timestamp: DateTime<Utc>,
    /// Priority tier carried for callers that enqueue into the scheduler.
    pub priority: EventPriority,
    /// Correlates causally-related event chains.
    pub correlation_id: Option<Uuid>,
    /// The event that directly caused this one.
    pub parent_id: Option<Uuid>,
}

impl Event {
    /// Create a new broadcast event with `Normal` priority and an empty
    /// payload.
    pub fn new(event_type: impl Into<String>, source: impl Into<String>) -> Self {
        let timestamp = Utc::now();
        let mut metadata = HashMap::new();
        metadata.insert(
            "created_at".to_string(),
            serde_json::Value::String(timestamp.to_rfc3339()),
        );

        Self {
            id: Uuid::now_v7(),
            event_type: event_type.into(),
            source: source.into(),
            destination: None,
            data: HashMap::new(),
            metadata,
            timestamp,
            priority: EventPriority::Normal,
            correlation_id: None,
            parent_id: None,
        }
    }

    /// Attach a payload entry.
    #[must_use]
    pub fn with_data(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
        self.data.insert(key.into(), value);
        self
    }

    /// Attach a metadata entry.
    #[must_use]
    pub fn with_metadata(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
        self.metadata.insert(key.into(), value);
        self
    }

    /// Address the event to a single module instead of broadcasting.
    #[must_use]
    pub fn with_destination(mut self, module: impl Into<String>) -> Self {
        self.destination = Some(module.into());
        self
    }

    /// Set the priority tier.
    #[must_use]
    pub fn with_priority(mut self, priority: EventPriority) -> Self {
        self.priority = priority;
        self
    }

    /// Set the correlation id explicitly.
    #[must_use]
    pub fn with_correlation(mut self, correlation_id: Uuid) -> Self {
        self.correlation_id = Some(correlation_id);
        self
    }

    /// Mark this event as caused by `parent`.
    ///
    /// The parent id is recorded and the correlation id is inherited (falling
    /// back to the parent's own id when the parent starts a chain).
    #[must_use]
    pub fn child_of(mut self, parent: &Event) -> Self {
        self.parent_id = Some(parent.id);
        self.correlation_id = parent.correlation_id.or(Some(parent.id));
        self
    }
}

// ---------------------------------------------------------------------------
// Validation
// ---------------------------------------------------------------------------

/// Validate a concrete (publishable) event-type string.
///
/// Every dot-separated segment must be non-empty and consist of alphanumeric
/// characters, `_` or `-`.  Wildcards are not allowed in published types.
pub fn validate_event_type(event_type: &str) -> Result<()> {
    if event_type.is_empty() {
        return Err(KernelError::Validation {
            reason: "event type must not be empty".to_string(),
        });
    }

    for segment in event_type.split('.') {
        if segment.is_empty() {
            return Err(KernelError::Validation {
                reason: format!("event type `{event_type}` contains an empty segment"),
            });
        }
        if !segment
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
        {
            return Err(KernelError::Validation {
                reason: format!("event type `{event_type}` contains invalid characters"),
            });
        }
    }

    Ok(())
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
