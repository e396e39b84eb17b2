//! # Event Bus
//!
//! Typed publish/subscribe fan-out from the engine to external observers
//! (presentation, entitlement layer).
//!
//! ```text
//! publishers                         subscribers
//! ──────────                         ───────────
//! SyncCoordinator ──┐               ┌──► Subscription [ItemsChanged]
//! InviteProtocol ───┼─► EventBus ───┼──► Subscription [UserRolesChanged, ...]
//! VaultKeyManager ──┤  (broadcast)  └──► Subscription [all kinds]
//! ContactRegistry ──┘
//! ```
//!
//! Dropping a [`Subscription`] unsubscribes it.

use std::collections::HashSet;

use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tracing::{debug, warn};

use cinder_core::ItemId;
use cinder_store::ItemsChanged;

use crate::coordinator::SyncOutcome;
use crate::error::SyncError;

const EVENT_CAPACITY: usize = 256;

/// Discriminant of [`EngineEvent`], used for subscription filters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    ItemsChanged,
    DuplicateOnConflict,
    SyncCompleted,
    SyncFailed,
    InvitesChanged,
    ContactsChanged,
    TrustRequestReceived,
    VaultKeyRotated,
    VaultKeyInstalled,
    SyncSharedVaultFromScratchCompleted,
    IntegrityFailure,
    KeyVersionUnavailable,
    UserRolesChanged,
    FeaturesAvailabilityChanged,
    SharedVaultRemoved,
}

/// Everything the engine tells the outside world.
#[derive(Debug, Clone)]
pub enum EngineEvent {
    ItemsChanged(ItemsChanged),
    /// Informational: two copies of an item now exist.
    DuplicateOnConflict { original: ItemId, duplicate: ItemId },
    SyncCompleted(SyncOutcome),
    SyncFailed { error: SyncError },
    InvitesChanged,
    ContactsChanged,
    TrustRequestReceived { contact_uuid: String },
    VaultKeyRotated { vault: String, version: u64 },
    VaultKeyInstalled { vault: String, version: u64 },
    SyncSharedVaultFromScratchCompleted { vault: String },
    IntegrityFailure { message_id: String, reason: String },
    KeyVersionUnavailable { item_id: ItemId, scope: String, version: u64 },
    UserRolesChanged { roles: Vec<String> },
    FeaturesAvailabilityChanged,
    SharedVaultRemoved { vault: String },
}

impl EngineEvent {
    pub fn kind(&self) -> EventKind {
        match self {
            EngineEvent::ItemsChanged(_) => EventKind::ItemsChanged,
            EngineEvent::DuplicateOnConflict { .. } => EventKind::DuplicateOnConflict,
            EngineEvent::SyncCompleted(_) => EventKind::SyncCompleted,
            EngineEvent::SyncFailed { .. } => EventKind::SyncFailed,
            EngineEvent::InvitesChanged => EventKind::InvitesChanged,
            EngineEvent::ContactsChanged => EventKind::ContactsChanged,
            EngineEvent::TrustRequestReceived { .. } => EventKind::TrustRequestReceived,
            EngineEvent::VaultKeyRotated { .. } => EventKind::VaultKeyRotated,
            EngineEvent::VaultKeyInstalled { .. } => EventKind::VaultKeyInstalled,
            EngineEvent::SyncSharedVaultFromScratchCompleted { .. } => {
                EventKind::SyncSharedVaultFromScratchCompleted
            }
            EngineEvent::IntegrityFailure { .. } => EventKind::IntegrityFailure,
            EngineEvent::KeyVersionUnavailable { .. } => EventKind::KeyVersionUnavailable,
            EngineEvent::UserRolesChanged { .. } => EventKind::UserRolesChanged,
            EngineEvent::FeaturesAvailabilityChanged => EventKind::FeaturesAvailabilityChanged,
            EngineEvent::SharedVaultRemoved { .. } => EventKind::SharedVaultRemoved,
        }
    }
}

/// Cloneable publisher handle.
#[derive(Debug, Clone)]
pub struct EventBus {
    tx: broadcast::Sender<EngineEvent>,
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

impl EventBus {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(EVENT_CAPACITY);
        EventBus { tx }
    }

    /// Publishes to every current subscriber. No subscribers is not an error.
    pub fn publish(&self, event: EngineEvent) {
        let kind = event.kind();
        let receivers = self.tx.send(event).unwrap_or(0);
        debug!(?kind, receivers, "Event published");
    }

    pub fn publish_all(&self, events: impl IntoIterator<Item = EngineEvent>) {
        for event in events {
            self.publish(event);
        }
    }

    /// Subscribes to the given kinds only.
    pub fn subscribe(&self, kinds: &[EventKind]) -> Subscription {
        Subscription {
            rx: self.tx.subscribe(),
            kinds: Some(kinds.iter().copied().collect()),
        }
    }

    /// Subscribes to every kind.
    pub fn subscribe_all(&self) -> Subscription {
        Subscription {
            rx: self.tx.subscribe(),
            kinds: None,
        }
    }

    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }
}

/// A live subscription. Dropping it unsubscribes.
#[derive(Debug)]
pub struct Subscription {
    rx: broadcast::Receiver<EngineEvent>,
    kinds: Option<HashSet<EventKind>>,
}

impl Subscription {
    fn wants(&self, event: &EngineEvent) -> bool {
        self.kinds
            .as_ref()
            .map_or(true, |kinds| kinds.contains(&event.kind()))
    }

    /// Next matching event, or `None` once the bus is gone.
    pub async fn recv(&mut self) -> Option<EngineEvent> {
        loop {
            match self.rx.recv().await {
                Ok(event) if self.wants(&event) => return Some(event),
                Ok(_) => continue,
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!(skipped, "Event subscriber lagged");
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }

    /// Next matching event already queued, without waiting.
    pub fn try_recv(&mut self) -> Option<EngineEvent> {
        loop {
            match self.rx.try_recv() {
                Ok(event) if self.wants(&event) => return Some(event),
                Ok(_) => continue,
                Err(broadcast::error::TryRecvError::Lagged(skipped)) => {
                    warn!(skipped, "Event subscriber lagged");
                }
                Err(_) => return None,
            }
        }
    }

    /// Every matching event already queued.
    pub fn drain(&mut self) -> Vec<EngineEvent> {
        std::iter::from_fn(|| self.try_recv()).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_subscription_filters_kinds() {
        let bus = EventBus::new();
        let mut invites = bus.subscribe(&[EventKind::InvitesChanged]);
        let mut everything = bus.subscribe_all();

        bus.publish(EngineEvent::ContactsChanged);
        bus.publish(EngineEvent::InvitesChanged);

        assert_eq!(invites.recv().await.unwrap().kind(), EventKind::InvitesChanged);
        assert!(invites.try_recv().is_none());
        assert_eq!(everything.drain().len(), 2);
    }

    #[test]
    fn test_drop_unsubscribes() {
        let bus = EventBus::new();
        let subscription = bus.subscribe_all();
        assert_eq!(bus.subscriber_count(), 1);
        drop(subscription);
        assert_eq!(bus.subscriber_count(), 0);

        // publishing with no subscribers is fine
        bus.publish(EngineEvent::FeaturesAvailabilityChanged);
    }
}
