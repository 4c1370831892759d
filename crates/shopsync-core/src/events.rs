//! Outward-facing events
//!
//! Components publish [`SyncEvent`]s on a shared [`EventBus`]; UI and
//! observability collaborators subscribe. Publishing never blocks and never
//! fails: events sent with no subscriber are dropped, and a lagging
//! subscriber skips ahead.

use std::time::Duration;

use tokio::sync::broadcast;
use tracing::trace;

use crate::conflict::{ConflictSeverity, ConflictType, ResolutionStrategy};
use crate::connectivity::NetworkState;
use crate::error::RetryReason;
use crate::models::EntityType;
use crate::sync::{CycleReport, SyncPhase, SyncTrigger};

const DEFAULT_CAPACITY: usize = 256;

/// Events emitted by the sync core
#[derive(Debug, Clone)]
pub enum SyncEvent {
    /// Network state changed
    ConnectivityChanged(NetworkState),
    /// Came back online after being offline (debounced)
    Reconnected,

    /// A sync cycle started
    CycleStarted {
        session_id: String,
        trigger: SyncTrigger,
    },
    /// Progress within a cycle
    CycleProgress {
        session_id: String,
        phase: SyncPhase,
        processed: usize,
        total: usize,
    },
    /// A sync cycle reached a terminal state
    CycleFinished(CycleReport),

    ConflictDetected {
        conflict_id: String,
        entity_type: EntityType,
        entity_id: String,
        conflict_type: ConflictType,
        severity: ConflictSeverity,
    },
    ConflictResolved {
        conflict_id: String,
        strategy: ResolutionStrategy,
    },
    /// A conflict needs a human decision
    ManualResolutionRequired { conflict_id: String },
    /// Automatic resolution failed too many times
    ConflictEscalated { conflict_id: String, attempts: u32 },

    /// A retried call failed and will be attempted again after `delay`
    RetryAttempt {
        label: String,
        attempt: u32,
        reason: RetryReason,
        delay: Duration,
    },
    RetrySucceeded { label: String, attempts: u32 },
    RetryExhausted {
        label: String,
        attempts: u32,
        reason: RetryReason,
    },
    RetryCancelled { label: String, attempts: u32 },
}

/// Broadcast channel shared by all components
#[derive(Debug, Clone)]
pub struct EventBus {
    tx: broadcast::Sender<SyncEvent>,
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY)
    }
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    /// Publish an event to all current subscribers
    pub fn emit(&self, event: SyncEvent) {
        if self.tx.send(event).is_err() {
            trace!("Event dropped, no subscribers");
        }
    }

    /// Subscribe to events published from now on
    pub fn subscribe(&self) -> broadcast::Receiver<SyncEvent> {
        self.tx.subscribe()
    }

    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_emit_reaches_all_subscribers() {
        let bus = EventBus::default();
        let mut a = bus.subscribe();
        let mut b = bus.subscribe();

        bus.emit(SyncEvent::Reconnected);

        assert!(matches!(a.recv().await.unwrap(), SyncEvent::Reconnected));
        assert!(matches!(b.recv().await.unwrap(), SyncEvent::Reconnected));
    }

    #[test]
    fn test_emit_without_subscribers_is_silent() {
        let bus = EventBus::default();
        assert_eq!(bus.subscriber_count(), 0);
        bus.emit(SyncEvent::Reconnected);
    }
}
