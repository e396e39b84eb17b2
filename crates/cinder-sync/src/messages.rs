//! # Asymmetric Message Channel
//!
//! Sends and receives signed, sealed envelopes between users who do not yet
//! share a vault key. Transport-agnostic: outbound envelopes go to the
//! [`OutboundQueue`], inbound ones arrive inside a sync response.
//!
//! ## Inbound Path
//! ```text
//! sync response.asymmetric_messages
//!        │
//!        ▼
//!  ingest() ── sender registered? ── no ──► IntegrityFailure, discarded
//!        │            │ yes
//!        │            ▼
//!        │     signature verifies against the registered key? ── no ──┐
//!        │            │ yes                                           │
//!        │            ▼                                               │
//!        │     opens with our identity key? ── no ────────────────────┤
//!        │            │ yes                                           ▼
//!        │            ▼                                     warn!, event, dropped
//!        │        inbox ──► drain() ──► routed by kind
//! ```
//!
//! Redelivered ids are skipped. Only the most recent
//! [`SEEN_MESSAGE_CAPACITY`] ids are remembered.

use std::collections::{HashSet, VecDeque};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use tokio::sync::Mutex;
use tracing::{debug, warn};
use uuid::Uuid;
use zeroize::Zeroizing;

use cinder_core::{Envelope, IdentityKeyPair, MessageKind};

use crate::contacts::TrustedContactRegistry;
use crate::error::{CollaborationError, CollaborationResult};
use crate::events::{EngineEvent, EventBus};
use crate::outbox::OutboundQueue;
use crate::protocol::{AsymmetricMessageServerHash, OutboundMessage};

/// How many processed message ids are kept for duplicate detection.
pub const SEEN_MESSAGE_CAPACITY: usize = 1024;

/// Recently processed message ids, oldest evicted first.
struct SeenIds {
    ids: HashSet<String>,
    order: VecDeque<String>,
    capacity: usize,
}

impl SeenIds {
    fn new(capacity: usize) -> Self {
        SeenIds {
            ids: HashSet::new(),
            order: VecDeque::new(),
            capacity,
        }
    }

    /// Returns false when `id` was already seen.
    fn insert(&mut self, id: &str) -> bool {
        if !self.ids.insert(id.to_string()) {
            return false;
        }
        self.order.push_back(id.to_string());
        while self.order.len() > self.capacity {
            if let Some(oldest) = self.order.pop_front() {
                self.ids.remove(&oldest);
            }
        }
        true
    }

    #[cfg(test)]
    fn len(&self) -> usize {
        self.order.len()
    }
}

/// A verified, decrypted inbound message.
#[derive(Debug, Clone)]
pub struct InboundMessage {
    pub message_id: String,
    pub sender_uuid: String,
    pub kind: MessageKind,
    pub body: Zeroizing<Vec<u8>>,
    pub received_at: DateTime<Utc>,
}

impl InboundMessage {
    /// Deserializes the JSON body.
    pub fn parse<T: serde::de::DeserializeOwned>(&self) -> CollaborationResult<T> {
        serde_json::from_slice(&self.body).map_err(|e| self.integrity_failure(e.to_string()))
    }

    pub fn integrity_failure(&self, reason: impl Into<String>) -> CollaborationError {
        CollaborationError::IntegrityFailure {
            message_id: self.message_id.clone(),
            reason: reason.into(),
        }
    }
}

pub struct AsymmetricMessageChannel {
    identity: Arc<IdentityKeyPair>,
    contacts: Arc<TrustedContactRegistry>,
    outbox: Arc<OutboundQueue>,
    events: EventBus,
    inbox: Mutex<Vec<InboundMessage>>,
    seen: Mutex<SeenIds>,
}

impl AsymmetricMessageChannel {
    pub fn new(
        identity: Arc<IdentityKeyPair>,
        contacts: Arc<TrustedContactRegistry>,
        outbox: Arc<OutboundQueue>,
        events: EventBus,
    ) -> Self {
        AsymmetricMessageChannel {
            identity,
            contacts,
            outbox,
            events,
            inbox: Mutex::new(Vec::new()),
            seen: Mutex::new(SeenIds::new(SEEN_MESSAGE_CAPACITY)),
        }
    }

    /// Seals `payload` to `recipient_public_key` and queues it.
    /// Returns the message id.
    pub async fn send(
        &self,
        recipient_uuid: &str,
        recipient_public_key: &str,
        kind: MessageKind,
        payload: &[u8],
    ) -> CollaborationResult<String> {
        let envelope = Envelope::seal(kind, payload, &self.identity, recipient_public_key)?;
        let message_id = Uuid::new_v4().to_string();
        self.outbox
            .push_message(OutboundMessage {
                uuid: message_id.clone(),
                recipient_uuid: recipient_uuid.to_string(),
                envelope,
            })
            .await;
        Ok(message_id)
    }

    /// Sends to a trusted contact's registered encryption key.
    pub async fn send_to_contact(
        &self,
        contact_uuid: &str,
        kind: MessageKind,
        payload: &[u8],
    ) -> CollaborationResult<String> {
        let contact = self.contacts.get(contact_uuid).await.ok_or_else(|| {
            CollaborationError::UntrustedRecipient {
                contact: contact_uuid.to_string(),
            }
        })?;
        self.send(contact_uuid, &contact.encryption_public_key, kind, payload).await
    }

    /// Seals for a trusted contact without queueing. Invites carry their
    /// envelope inside the invite record instead of the message list.
    pub async fn seal_for_contact(
        &self,
        contact_uuid: &str,
        kind: MessageKind,
        payload: &[u8],
    ) -> CollaborationResult<Envelope> {
        let contact = self.contacts.get(contact_uuid).await.ok_or_else(|| {
            CollaborationError::UntrustedRecipient {
                contact: contact_uuid.to_string(),
            }
        })?;
        Ok(Envelope::seal(kind, payload, &self.identity, &contact.encryption_public_key)?)
    }

    /// Decrypts an envelope addressed to this device. No sender check.
    pub fn open(&self, envelope: &Envelope) -> CollaborationResult<Zeroizing<Vec<u8>>> {
        Ok(Zeroizing::new(envelope.open(&self.identity)?))
    }

    /// Whether an envelope is addressed to this device's identity.
    pub fn is_addressed_to_me(&self, envelope: &Envelope) -> bool {
        envelope.recipient_public_key == self.identity.public().encryption_public_key
    }

    /// Verifies and decrypts inbound messages into the inbox.
    ///
    /// Returns the integrity failures; the offending messages are dropped.
    pub async fn ingest(&self, messages: Vec<AsymmetricMessageServerHash>) -> Vec<CollaborationError> {
        let mut failures = Vec::new();

        for message in messages {
            if !self.seen.lock().await.insert(&message.uuid) {
                debug!(message_id = %message.uuid, "Skipping already processed message");
                continue;
            }

            match self.open_message(&message).await {
                Ok(inbound) => {
                    debug!(message_id = %inbound.message_id, kind = %inbound.kind, "Message accepted");
                    self.inbox.lock().await.push(inbound);
                }
                Err(err) => {
                    self.report(&err);
                    failures.push(err);
                }
            }
        }

        failures
    }

    async fn open_message(
        &self,
        message: &AsymmetricMessageServerHash,
    ) -> CollaborationResult<InboundMessage> {
        let failure = |reason: String| CollaborationError::IntegrityFailure {
            message_id: message.uuid.clone(),
            reason,
        };

        let sender = self
            .contacts
            .get(&message.sender_uuid)
            .await
            .ok_or_else(|| failure(format!("sender {} is not a registered contact", message.sender_uuid)))?;

        message
            .envelope
            .verify(&sender.signing_public_key)
            .map_err(|e| failure(e.to_string()))?;

        let body = message
            .envelope
            .open(&self.identity)
            .map_err(|e| failure(e.to_string()))?;

        Ok(InboundMessage {
            message_id: message.uuid.clone(),
            sender_uuid: message.sender_uuid.clone(),
            kind: message.envelope.kind,
            body: Zeroizing::new(body),
            received_at: message.created_at,
        })
    }

    /// Logs and publishes an integrity failure.
    pub fn report(&self, err: &CollaborationError) {
        if let CollaborationError::IntegrityFailure { message_id, reason } = err {
            warn!(message_id = %message_id, reason = %reason, "Discarding unverifiable message");
            self.events.publish(EngineEvent::IntegrityFailure {
                message_id: message_id.clone(),
                reason: reason.clone(),
            });
        }
    }

    /// Takes every accepted message. Drained messages are not kept.
    pub async fn drain(&self) -> Vec<InboundMessage> {
        std::mem::take(&mut *self.inbox.lock().await)
    }
}
