//! # Trusted Contact Registry
//!
//! The only writer of collaborator public keys. Every other component reads
//! contacts through this registry.
//!
//! ## Trust Paths
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                                                                         │
//! │  user action ──► create_or_edit_trusted_contact ──► name edits only    │
//! │                                                     once keys are set   │
//! │                                                                         │
//! │  user action ──► re_trust ────────────────────────► replaces keys      │
//! │                                                                         │
//! │  inbound trust-confirmation ──► pending request ──► accept_trust_request│
//! │  (verified against the           (never applied     (user action)       │
//! │   sender's registered key)        automatically)                        │
//! │                                                                         │
//! │  untrusted invite ──► establish_trust_for_invite (InviteProtocol)       │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use tracing::{debug, info};

use cinder_core::validation::{validate_display_name, validate_public_key, validate_user_uuid};
use cinder_core::{PublicIdentity, TrustedContact};

use crate::error::{CollaborationError, CollaborationResult};
use crate::events::{EngineEvent, EventBus};

/// Input to contact creation and re-trust.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContactDraft {
    pub contact_uuid: String,
    pub name: String,
    pub encryption_public_key: String,
    pub signing_public_key: String,
}

impl ContactDraft {
    pub fn new(contact_uuid: impl Into<String>, name: impl Into<String>, keys: &PublicIdentity) -> Self {
        ContactDraft {
            contact_uuid: contact_uuid.into(),
            name: name.into(),
            encryption_public_key: keys.encryption_public_key.clone(),
            signing_public_key: keys.signing_public_key.clone(),
        }
    }

    fn validate(&self) -> CollaborationResult<()> {
        validate_user_uuid("contact_uuid", &self.contact_uuid)?;
        validate_display_name(&self.name)?;
        validate_public_key("encryption_public_key", &self.encryption_public_key)?;
        validate_public_key("signing_public_key", &self.signing_public_key)?;
        Ok(())
    }

    fn same_keys(&self, contact: &TrustedContact) -> bool {
        self.encryption_public_key == contact.encryption_public_key
            && self.signing_public_key == contact.signing_public_key
    }
}

/// A verified trust confirmation awaiting the user's decision.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TrustRequest {
    pub message_id: String,
    pub draft: ContactDraft,
    pub received_at: DateTime<Utc>,
}

/// Registry of trusted contacts plus pending trust requests.
#[derive(Debug)]
pub struct TrustedContactRegistry {
    contacts: RwLock<HashMap<String, TrustedContact>>,
    pending: RwLock<HashMap<String, TrustRequest>>,
    events: EventBus,
}

impl TrustedContactRegistry {
    pub fn new(events: EventBus) -> Self {
        TrustedContactRegistry {
            contacts: RwLock::new(HashMap::new()),
            pending: RwLock::new(HashMap::new()),
            events,
        }
    }

    // =========================================================================
    // Reads
    // =========================================================================

    pub async fn get(&self, contact_uuid: &str) -> Option<TrustedContact> {
        self.contacts.read().await.get(contact_uuid).cloned()
    }

    pub async fn is_trusted(&self, contact_uuid: &str) -> bool {
        self.contacts.read().await.contains_key(contact_uuid)
    }

    /// Every contact, sorted by name.
    pub async fn all(&self) -> Vec<TrustedContact> {
        let mut contacts: Vec<TrustedContact> = self.contacts.read().await.values().cloned().collect();
        contacts.sort_by(|a, b| a.name.cmp(&b.name).then_with(|| a.contact_uuid.cmp(&b.contact_uuid)));
        contacts
    }

    // =========================================================================
    // User Actions
    // =========================================================================

    /// Adds a contact, or renames an existing one.
    ///
    /// Keys of an existing contact only change through [`Self::re_trust`].
    pub async fn create_or_edit_trusted_contact(
        &self,
        draft: ContactDraft,
    ) -> CollaborationResult<TrustedContact> {
        draft.validate()?;
        let now = Utc::now();

        let contact = {
            let mut contacts = self.contacts.write().await;
            match contacts.get_mut(&draft.contact_uuid) {
                Some(existing) => {
                    if !draft.same_keys(existing) {
                        return Err(CollaborationError::ContactKeysImmutable {
                            contact: draft.contact_uuid,
                        });
                    }
                    existing.name = draft.name;
                    existing.updated_at = now;
                    debug!(contact = %existing.contact_uuid, "Trusted contact renamed");
                    existing.clone()
                }
                None => {
                    let contact = TrustedContact {
                        contact_uuid: draft.contact_uuid.clone(),
                        name: draft.name,
                        encryption_public_key: draft.encryption_public_key,
                        signing_public_key: draft.signing_public_key,
                        created_at: now,
                        updated_at: now,
                    };
                    contacts.insert(draft.contact_uuid, contact.clone());
                    info!(contact = %contact.contact_uuid, "Trusted contact added");
                    contact
                }
            }
        };

        self.events.publish(EngineEvent::ContactsChanged);
        Ok(contact)
    }

    /// Explicitly re-verifies a contact, replacing its public keys.
    pub async fn re_trust(&self, draft: ContactDraft) -> CollaborationResult<TrustedContact> {
        draft.validate()?;

        let contact = {
            let mut contacts = self.contacts.write().await;
            let existing = contacts
                .get_mut(&draft.contact_uuid)
                .ok_or_else(|| CollaborationError::ContactNotFound(draft.contact_uuid.clone()))?;
            existing.name = draft.name;
            existing.encryption_public_key = draft.encryption_public_key;
            existing.signing_public_key = draft.signing_public_key;
            existing.updated_at = Utc::now();
            existing.clone()
        };

        self.pending.write().await.remove(&contact.contact_uuid);
        info!(contact = %contact.contact_uuid, "Trusted contact re-verified");
        self.events.publish(EngineEvent::ContactsChanged);
        Ok(contact)
    }

    pub async fn remove(&self, contact_uuid: &str) -> CollaborationResult<TrustedContact> {
        let removed = self
            .contacts
            .write()
            .await
            .remove(contact_uuid)
            .ok_or_else(|| CollaborationError::ContactNotFound(contact_uuid.to_string()))?;
        self.pending.write().await.remove(contact_uuid);
        info!(contact = %contact_uuid, "Trusted contact removed");
        self.events.publish(EngineEvent::ContactsChanged);
        Ok(removed)
    }

    // =========================================================================
    // Trust Requests
    // =========================================================================

    /// Holds a verified trust confirmation until the user decides.
    pub async fn record_trust_request(&self, request: TrustRequest) {
        let contact_uuid = request.draft.contact_uuid.clone();
        self.pending.write().await.insert(contact_uuid.clone(), request);
        debug!(contact = %contact_uuid, "Trust request recorded");
        self.events.publish(EngineEvent::TrustRequestReceived { contact_uuid });
    }

    pub async fn pending_trust_requests(&self) -> Vec<TrustRequest> {
        let mut requests: Vec<TrustRequest> = self.pending.read().await.values().cloned().collect();
        requests.sort_by(|a, b| a.received_at.cmp(&b.received_at));
        requests
    }

    /// Applies a pending trust request.
    pub async fn accept_trust_request(&self, contact_uuid: &str) -> CollaborationResult<TrustedContact> {
        let request = self
            .pending
            .write()
            .await
            .remove(contact_uuid)
            .ok_or_else(|| CollaborationError::ContactNotFound(contact_uuid.to_string()))?;

        if self.is_trusted(contact_uuid).await {
            self.re_trust(request.draft).await
        } else {
            self.create_or_edit_trusted_contact(request.draft).await
        }
    }

    pub async fn dismiss_trust_request(&self, contact_uuid: &str) -> bool {
        self.pending.write().await.remove(contact_uuid).is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cinder_core::IdentityKeyPair;
    use uuid::Uuid;

    fn draft(name: &str, keys: &PublicIdentity) -> ContactDraft {
        ContactDraft::new(Uuid::new_v4().to_string(), name, keys)
    }

    #[tokio::test]
    async fn test_create_then_rename() {
        let registry = TrustedContactRegistry::new(EventBus::new());
        let keys = IdentityKeyPair::generate().public();
        let bob = draft("Bob", &keys);

        registry.create_or_edit_trusted_contact(bob.clone()).await.unwrap();
        let renamed = registry
            .create_or_edit_trusted_contact(ContactDraft {
                name: "Robert".into(),
                ..bob.clone()
            })
            .await
            .unwrap();

        assert_eq!(renamed.name, "Robert");
        assert!(registry.is_trusted(&bob.contact_uuid).await);
        assert_eq!(registry.all().await.len(), 1);
    }

    #[tokio::test]
    async fn test_keys_change_only_through_re_trust() {
        let registry = TrustedContactRegistry::new(EventBus::new());
        let bob = draft("Bob", &IdentityKeyPair::generate().public());
        registry.create_or_edit_trusted_contact(bob.clone()).await.unwrap();

        let new_keys = IdentityKeyPair::generate().public();
        let changed = ContactDraft::new(bob.contact_uuid.clone(), "Bob", &new_keys);
        let err = registry
            .create_or_edit_trusted_contact(changed.clone())
            .await
            .unwrap_err();
        assert!(matches!(err, CollaborationError::ContactKeysImmutable { .. }));

        let contact = registry.re_trust(changed).await.unwrap();
        assert_eq!(contact.signing_public_key, new_keys.signing_public_key);
    }

    #[tokio::test]
    async fn test_rejects_malformed_keys() {
        let registry = TrustedContactRegistry::new(EventBus::new());
        let mut bad = draft("Bob", &IdentityKeyPair::generate().public());
        bad.signing_public_key = "not-base64!".into();
        let err = registry.create_or_edit_trusted_contact(bad).await.unwrap_err();
        assert!(matches!(err, CollaborationError::Validation(_)));
    }

    #[tokio::test]
    async fn test_trust_request_waits_for_user() {
        let bus = EventBus::new();
        let mut events = bus.subscribe(&[crate::events::EventKind::TrustRequestReceived]);
        let registry = TrustedContactRegistry::new(bus);
        let carol = draft("Carol", &IdentityKeyPair::generate().public());

        registry
            .record_trust_request(TrustRequest {
                message_id: "m1".into(),
                draft: carol.clone(),
                received_at: Utc::now(),
            })
            .await;

        assert!(!registry.is_trusted(&carol.contact_uuid).await);
        assert!(events.try_recv().is_some());

        registry.accept_trust_request(&carol.contact_uuid).await.unwrap();
        assert!(registry.is_trusted(&carol.contact_uuid).await);
        assert!(registry.pending_trust_requests().await.is_empty());
    }
}
