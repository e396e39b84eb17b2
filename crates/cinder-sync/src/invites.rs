//! # Invite Protocol
//!
//! The vault invite state machine, on top of the message channel (sealing)
//! and the vault key manager (key material).
//!
//! ## States
//! ```text
//!                       accept (invitee, trusted sender)
//!                    ┌──────────────────────────────► Accepted
//!                    │
//!   create ──► Pending ── decline (invitee) ─────────► Declined
//!   (trusted         │
//!    invitee)        └── revoke (inviter) ───────────► Revoked
//!                                                        │
//!                          server later reports Accepted │ (race)
//!                                                        ▼
//!                                   remove member + rotate vault key
//! ```
//!
//! An invite from a sender that is not a trusted contact is listed with
//! `is_trusted == false`. Accepting it fails with `UntrustedSender` until
//! the user runs [`InviteProtocol::establish_trust_for_invite`].

use std::collections::HashMap;
use std::sync::Arc;

use chrono::Utc;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};
use uuid::Uuid;
use zeroize::Zeroizing;

use cinder_core::{
    Envelope, Invite, InviteStatus, MessageKind, PublicIdentity, SharedVault,
    SharedVaultPermission, SymmetricKey, TrustedContact, VaultMember,
};

use crate::contacts::{ContactDraft, TrustedContactRegistry};
use crate::error::{CollaborationError, SyncError, SyncResult};
use crate::events::{EngineEvent, EventBus};
use crate::messages::AsymmetricMessageChannel;
use crate::outbox::OutboundQueue;
use crate::protocol::{InvitePayload, InviteStatusUpdate, SharedVaultInviteServerHash};
use crate::vault_keys::{MembershipChange, VaultKeyManager};

/// Which side of an invite this device is on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InviteDirection {
    Inbound,
    Outbound,
}

#[derive(Debug, Clone)]
struct InviteRecord {
    invite: Invite,
    direction: InviteDirection,
    /// Keys an inbound invite was signed with. Kept after the envelope is dropped.
    inviter_keys: Option<PublicIdentity>,
    /// Dropped once the invite is terminal.
    envelope: Option<Envelope>,
}

/// An inbound invite as shown to the user.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingInvite {
    pub invite: Invite,
    /// The inviter is a trusted contact and signed with the registered key.
    pub is_trusted: bool,
    pub inviter_keys: PublicIdentity,
}

/// Result of accepting an invite.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AcceptedInvite {
    pub invite: Invite,
    pub vault: SharedVault,
}

pub struct InviteProtocol {
    user_uuid: String,
    invites: RwLock<HashMap<String, InviteRecord>>,
    contacts: Arc<TrustedContactRegistry>,
    channel: Arc<AsymmetricMessageChannel>,
    keys: Arc<VaultKeyManager>,
    outbox: Arc<OutboundQueue>,
    events: EventBus,
}

impl InviteProtocol {
    pub fn new(
        user_uuid: impl Into<String>,
        contacts: Arc<TrustedContactRegistry>,
        channel: Arc<AsymmetricMessageChannel>,
        keys: Arc<VaultKeyManager>,
        outbox: Arc<OutboundQueue>,
        events: EventBus,
    ) -> Self {
        InviteProtocol {
            user_uuid: user_uuid.into(),
            invites: RwLock::new(HashMap::new()),
            contacts,
            channel,
            keys,
            outbox,
            events,
        }
    }

    // =========================================================================
    // Queries
    // =========================================================================

    pub async fn get(&self, invite_uuid: &str) -> Option<Invite> {
        self.invites.read().await.get(invite_uuid).map(|r| r.invite.clone())
    }

    /// Inbound invites still waiting for a decision, oldest first.
    pub async fn pending_invites(&self) -> Vec<PendingInvite> {
        let records: Vec<InviteRecord> = self
            .invites
            .read()
            .await
            .values()
            .filter(|r| r.direction == InviteDirection::Inbound && r.invite.status == InviteStatus::Pending)
            .cloned()
            .collect();

        let mut pending = Vec::with_capacity(records.len());
        for record in records {
            let Some(inviter_keys) = record.inviter_keys else {
                continue;
            };
            let contact = self.contacts.get(&record.invite.inviter_uuid).await;
            pending.push(PendingInvite {
                is_trusted: signed_by(contact.as_ref(), &inviter_keys),
                invite: record.invite,
                inviter_keys,
            });
        }
        pending.sort_by(|a, b| a.invite.created_at.cmp(&b.invite.created_at));
        pending
    }

    /// Invites this user sent, oldest first.
    pub async fn outbound_invites(&self) -> Vec<Invite> {
        let mut invites: Vec<Invite> = self
            .invites
            .read()
            .await
            .values()
            .filter(|r| r.direction == InviteDirection::Outbound)
            .map(|r| r.invite.clone())
            .collect();
        invites.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        invites
    }

    // =========================================================================
    // Inviter Side
    // =========================================================================

    /// Invites a trusted contact into a vault at the current key version.
    pub async fn create(
        &self,
        vault_uuid: &str,
        invitee_uuid: &str,
        permission: SharedVaultPermission,
    ) -> SyncResult<Invite> {
        if !self.contacts.is_trusted(invitee_uuid).await {
            return Err(CollaborationError::UntrustedRecipient {
                contact: invitee_uuid.to_string(),
            }
            .into());
        }

        let vault = self
            .keys
            .vault(vault_uuid)
            .await
            .ok_or_else(|| CollaborationError::VaultNotFound(vault_uuid.to_string()))?;
        if !self
            .keys
            .local_permission(vault_uuid)
            .await
            .is_some_and(|p| p.can_invite())
        {
            return Err(CollaborationError::PermissionDenied {
                vault: vault_uuid.to_string(),
                reason: "only the owner or an admin can invite".into(),
            }
            .into());
        }

        let key = self.keys.current_key(&vault.scope()).await?;
        let payload = InvitePayload {
            shared_vault_uuid: vault.uuid.clone(),
            vault_name: vault.name.clone(),
            owner_uuid: vault.owner_uuid.clone(),
            key_version: key.version(),
            vault_key: key.to_base64().to_string(),
            permission,
        };
        let body = Zeroizing::new(serde_json::to_vec(&payload)?);
        let envelope = self
            .channel
            .seal_for_contact(invitee_uuid, MessageKind::Invite, &body)
            .await?;

        let invite = Invite {
            uuid: Uuid::new_v4().to_string(),
            shared_vault_uuid: vault.uuid.clone(),
            inviter_uuid: self.user_uuid.clone(),
            invitee_uuid: invitee_uuid.to_string(),
            permission,
            status: InviteStatus::Pending,
            created_at: Utc::now(),
        };

        self.outbox
            .push_invite(SharedVaultInviteServerHash {
                uuid: invite.uuid.clone(),
                shared_vault_uuid: invite.shared_vault_uuid.clone(),
                sender_uuid: invite.inviter_uuid.clone(),
                recipient_uuid: invite.invitee_uuid.clone(),
                permission,
                status: InviteStatus::Pending,
                encrypted_message: envelope,
                created_at: invite.created_at,
            })
            .await;

        self.invites.write().await.insert(
            invite.uuid.clone(),
            InviteRecord {
                invite: invite.clone(),
                direction: InviteDirection::Outbound,
                inviter_keys: None,
                envelope: None,
            },
        );

        info!(invite = %invite.uuid, vault = %vault_uuid, invitee = %invitee_uuid, "Invite created");
        self.events.publish(EngineEvent::InvitesChanged);
        Ok(invite)
    }

    /// Withdraws a pending invite.
    ///
    /// If the server already counts the invitee as a member, they are
    /// removed and the vault key is rotated.
    pub async fn revoke(&self, invite_uuid: &str) -> SyncResult<Invite> {
        let invite = self.transition(invite_uuid, InviteStatus::Revoked, true).await?;
        self.outbox
            .push_invite_update(InviteStatusUpdate {
                invite_uuid: invite.uuid.clone(),
                status: InviteStatus::Revoked,
            })
            .await;
        info!(invite = %invite.uuid, "Invite revoked");

        let already_member = self
            .keys
            .permission_of(&invite.shared_vault_uuid, &invite.invitee_uuid)
            .await
            .is_some();
        if already_member {
            self.close_revoked_window(&invite).await?;
        }

        self.events.publish(EngineEvent::InvitesChanged);
        Ok(invite)
    }

    async fn close_revoked_window(&self, invite: &Invite) -> SyncResult<()> {
        warn!(
            invite = %invite.uuid,
            invitee = %invite.invitee_uuid,
            "Revoked invite was accepted; removing member and rotating key"
        );
        self.keys
            .apply_membership_change(
                &invite.shared_vault_uuid,
                MembershipChange::Remove {
                    user_uuid: invite.invitee_uuid.clone(),
                },
            )
            .await?;
        Ok(())
    }

    // =========================================================================
    // Invitee Side
    // =========================================================================

    /// Accepts an invite from a trusted inviter and installs the vault key.
    ///
    /// The caller runs the vault-scoped sync from scratch afterwards.
    pub async fn accept(&self, invite_uuid: &str) -> SyncResult<AcceptedInvite> {
        let record = self
            .invites
            .read()
            .await
            .get(invite_uuid)
            .cloned()
            .ok_or_else(|| CollaborationError::InviteNotFound(invite_uuid.to_string()))?;
        check_transition(&record, InviteStatus::Accepted, false)?;

        let invite = &record.invite;
        let untrusted = || CollaborationError::UntrustedSender {
            contact: invite.inviter_uuid.clone(),
        };
        let contact = self.contacts.get(&invite.inviter_uuid).await.ok_or_else(untrusted)?;
        let envelope = record.envelope.as_ref().ok_or_else(untrusted)?;
        envelope.verify(&contact.signing_public_key).map_err(|_| untrusted())?;

        let integrity = |reason: String| CollaborationError::IntegrityFailure {
            message_id: invite.uuid.clone(),
            reason,
        };
        let body = self.channel.open(envelope).map_err(|e| integrity(e.to_string()))?;
        let payload: InvitePayload =
            serde_json::from_slice(&body).map_err(|e| integrity(e.to_string()))?;
        if payload.shared_vault_uuid != invite.shared_vault_uuid {
            return Err(integrity("invite body names a different vault".into()).into());
        }
        let key = SymmetricKey::from_base64(&payload.vault_key, payload.key_version)
            .map_err(|e| integrity(e.to_string()))?;

        let vault = SharedVault {
            uuid: payload.shared_vault_uuid.clone(),
            name: payload.vault_name.clone(),
            owner_uuid: payload.owner_uuid.clone(),
            key_version: payload.key_version,
            members: vec![VaultMember {
                user_uuid: self.user_uuid.clone(),
                permission: invite.permission,
            }],
        };
        self.keys.join_vault(vault.clone(), key).await;

        let invite = self.transition(invite_uuid, InviteStatus::Accepted, false).await?;
        self.outbox
            .push_invite_update(InviteStatusUpdate {
                invite_uuid: invite.uuid.clone(),
                status: InviteStatus::Accepted,
            })
            .await;

        info!(invite = %invite.uuid, vault = %vault.uuid, version = payload.key_version, "Invite accepted");
        self.events.publish(EngineEvent::InvitesChanged);
        Ok(AcceptedInvite { invite, vault })
    }

    /// Declines an invite. Its envelope, and the key inside, is discarded.
    pub async fn decline(&self, invite_uuid: &str) -> SyncResult<Invite> {
        let invite = self.transition(invite_uuid, InviteStatus::Declined, false).await?;
        self.outbox
            .push_invite_update(InviteStatusUpdate {
                invite_uuid: invite.uuid.clone(),
                status: InviteStatus::Declined,
            })
            .await;
        info!(invite = %invite.uuid, "Invite declined");
        self.events.publish(EngineEvent::InvitesChanged);
        Ok(invite)
    }

    /// Registers the inviter of an untrusted invite as a trusted contact,
    /// using the keys the invite was signed with.
    pub async fn establish_trust_for_invite(
        &self,
        invite_uuid: &str,
        contact_name: &str,
    ) -> SyncResult<TrustedContact> {
        let record = self
            .invites
            .read()
            .await
            .get(invite_uuid)
            .cloned()
            .ok_or_else(|| CollaborationError::InviteNotFound(invite_uuid.to_string()))?;
        let inviter_keys = record
            .inviter_keys
            .filter(|_| record.direction == InviteDirection::Inbound)
            .ok_or_else(|| CollaborationError::InviteNotFound(invite_uuid.to_string()))?;

        let contact = self
            .contacts
            .create_or_edit_trusted_contact(ContactDraft::new(
                record.invite.inviter_uuid.clone(),
                contact_name,
                &inviter_keys,
            ))
            .await?;
        self.events.publish(EngineEvent::InvitesChanged);
        Ok(contact)
    }

    // =========================================================================
    // Server Updates
    // =========================================================================

    /// Applies the invite list of a sync response.
    ///
    /// Inbound invites whose envelope is not validly signed by the key it
    /// names, or not addressed to this device, are dropped.
    pub async fn ingest(&self, hashes: Vec<SharedVaultInviteServerHash>) -> Vec<SyncError> {
        let mut errors = Vec::new();
        let mut changed = false;

        for hash in hashes {
            if hash.recipient_uuid == self.user_uuid {
                match self.ingest_inbound(hash).await {
                    Ok(did_change) => changed |= did_change,
                    Err(err) => {
                        self.channel.report(&err);
                        errors.push(err.into());
                    }
                }
            } else if hash.sender_uuid == self.user_uuid {
                match self.ingest_outbound(&hash).await {
                    Ok(did_change) => changed |= did_change,
                    Err(err) => errors.push(err),
                }
            } else {
                debug!(invite = %hash.uuid, "Ignoring invite that does not involve this user");
            }
        }

        if changed {
            self.events.publish(EngineEvent::InvitesChanged);
        }
        errors
    }

    async fn ingest_inbound(&self, hash: SharedVaultInviteServerHash) -> Result<bool, CollaborationError> {
        let mut invites = self.invites.write().await;

        if let Some(record) = invites.get_mut(&hash.uuid) {
            if record.invite.status == hash.status || record.invite.status.is_terminal() {
                return Ok(false);
            }
            record.invite.status = hash.status;
            if hash.status.is_terminal() {
                record.envelope = None;
            }
            return Ok(true);
        }
        if hash.status.is_terminal() {
            return Ok(false);
        }

        let integrity = |reason: &str| CollaborationError::IntegrityFailure {
            message_id: hash.uuid.clone(),
            reason: reason.to_string(),
        };
        let envelope = hash.encrypted_message;
        if envelope.kind != MessageKind::Invite {
            return Err(integrity("envelope is not an invite"));
        }
        if !self.channel.is_addressed_to_me(&envelope) {
            return Err(integrity("invite is not addressed to this identity"));
        }
        envelope
            .verify(&envelope.sender_signing_public_key)
            .map_err(|_| integrity("invite signature does not match its signer"))?;

        let invite = Invite {
            uuid: hash.uuid.clone(),
            shared_vault_uuid: hash.shared_vault_uuid,
            inviter_uuid: hash.sender_uuid,
            invitee_uuid: hash.recipient_uuid,
            permission: hash.permission,
            status: InviteStatus::Pending,
            created_at: hash.created_at,
        };
        debug!(invite = %invite.uuid, inviter = %invite.inviter_uuid, "Invite received");
        invites.insert(
            hash.uuid,
            InviteRecord {
                invite,
                direction: InviteDirection::Inbound,
                inviter_keys: Some(PublicIdentity {
                    encryption_public_key: envelope.sender_encryption_public_key.clone(),
                    signing_public_key: envelope.sender_signing_public_key.clone(),
                }),
                envelope: Some(envelope),
            },
        );
        Ok(true)
    }

    async fn ingest_outbound(&self, hash: &SharedVaultInviteServerHash) -> SyncResult<bool> {
        let revoked_but_accepted = {
            let mut invites = self.invites.write().await;
            let Some(record) = invites.get_mut(&hash.uuid) else {
                return Ok(false);
            };
            if record.invite.status == hash.status {
                return Ok(false);
            }
            if record.invite.status == InviteStatus::Revoked && hash.status == InviteStatus::Accepted {
                Some(record.invite.clone())
            } else if record.invite.status == InviteStatus::Pending {
                record.invite.status = hash.status;
                None
            } else {
                return Ok(false);
            }
        };

        match revoked_but_accepted {
            Some(invite) => self.close_revoked_window(&invite).await?,
            None if hash.status == InviteStatus::Accepted => {
                self.keys
                    .apply_membership_change(
                        &hash.shared_vault_uuid,
                        MembershipChange::Add(VaultMember {
                            user_uuid: hash.recipient_uuid.clone(),
                            permission: hash.permission,
                        }),
                    )
                    .await?;
                info!(invite = %hash.uuid, member = %hash.recipient_uuid, "Invite accepted by invitee");
            }
            None => {}
        }
        Ok(true)
    }

    async fn transition(
        &self,
        invite_uuid: &str,
        next: InviteStatus,
        actor_is_inviter: bool,
    ) -> SyncResult<Invite> {
        let mut invites = self.invites.write().await;
        let record = invites
            .get_mut(invite_uuid)
            .ok_or_else(|| CollaborationError::InviteNotFound(invite_uuid.to_string()))?;
        check_transition(record, next, actor_is_inviter)?;
        record.invite.status = next;
        record.envelope = None;
        Ok(record.invite.clone())
    }
}

fn check_transition(
    record: &InviteRecord,
    next: InviteStatus,
    actor_is_inviter: bool,
) -> Result<(), CollaborationError> {
    let is_inviter_side = record.direction == InviteDirection::Outbound;
    if is_inviter_side != actor_is_inviter
        || !record.invite.status.can_transition_to(next, actor_is_inviter)
    {
        return Err(CollaborationError::InvalidInviteTransition {
            invite: record.invite.uuid.clone(),
            from: record.invite.status,
            to: next,
        });
    }
    Ok(())
}

fn signed_by(contact: Option<&TrustedContact>, keys: &PublicIdentity) -> bool {
    contact.is_some_and(|c| c.signing_public_key == keys.signing_public_key)
}

#[cfg(test)]
mod tests {
    use super::*;
    use cinder_core::{IdentityKeyPair, INITIAL_KEY_VERSION};
    use cinder_store::ItemStore;

    struct Party {
        uuid: String,
        identity: Arc<IdentityKeyPair>,
        contacts: Arc<TrustedContactRegistry>,
        outbox: Arc<OutboundQueue>,
        keys: Arc<VaultKeyManager>,
        invites: InviteProtocol,
    }

    fn party() -> Party {
        let uuid = Uuid::new_v4().to_string();
        let events = EventBus::new();
        let identity = Arc::new(IdentityKeyPair::generate());
        let contacts = Arc::new(TrustedContactRegistry::new(events.clone()));
        let outbox = Arc::new(OutboundQueue::new());
        let channel = Arc::new(AsymmetricMessageChannel::new(
            identity.clone(),
            contacts.clone(),
            outbox.clone(),
            events.clone(),
        ));
        let keys = Arc::new(VaultKeyManager::new(
            uuid.clone(),
            SymmetricKey::generate(INITIAL_KEY_VERSION),
            Arc::new(ItemStore::new()),
            channel.clone(),
            outbox.clone(),
            events.clone(),
        ));
        let invites = InviteProtocol::new(
            uuid.clone(),
            contacts.clone(),
            channel,
            keys.clone(),
            outbox.clone(),
            events,
        );
        Party {
            uuid,
            identity,
            contacts,
            outbox,
            keys,
            invites,
        }
    }

    async fn trust(who: &Party, whom: &Party) {
        who.contacts
            .create_or_edit_trusted_contact(ContactDraft::new(whom.uuid.clone(), "peer", &whom.identity.public()))
            .await
            .unwrap();
    }

    /// Alice owns a vault and has invited Bob; Bob has received the invite.
    async fn invited(bob_trusts_alice: bool) -> (Party, Party, SharedVault, Invite) {
        let alice = party();
        let bob = party();
        trust(&alice, &bob).await;
        if bob_trusts_alice {
            trust(&bob, &alice).await;
        }

        let vault = alice.keys.create_shared_vault("Team").await.unwrap();
        let invite = alice
            .invites
            .create(&vault.uuid, &bob.uuid, SharedVaultPermission::Write)
            .await
            .unwrap();

        let delivered = alice.outbox.snapshot().await.invites;
        assert!(bob.invites.ingest(delivered).await.is_empty());
        (alice, bob, vault, invite)
    }

    #[tokio::test]
    async fn test_accept_installs_vault_key() {
        let (alice, bob, vault, invite) = invited(true).await;

        let pending = bob.invites.pending_invites().await;
        assert_eq!(pending.len(), 1);
        assert!(pending[0].is_trusted);

        let accepted = bob.invites.accept(&invite.uuid).await.unwrap();
        assert_eq!(accepted.invite.status, InviteStatus::Accepted);
        assert_eq!(accepted.vault.owner_uuid, alice.uuid);
        assert_eq!(bob.keys.held_versions(&vault.uuid).await, vec![INITIAL_KEY_VERSION]);
        assert_eq!(
            bob.keys.local_permission(&vault.uuid).await,
            Some(SharedVaultPermission::Write)
        );

        let alice_key = alice.keys.current_key(&vault.scope()).await.unwrap();
        let bob_key = bob.keys.current_key(&vault.scope()).await.unwrap();
        assert_eq!(*alice_key.to_base64(), *bob_key.to_base64());

        assert!(bob
            .outbox
            .snapshot()
            .await
            .invite_updates
            .iter()
            .any(|u| u.status == InviteStatus::Accepted));
    }

    #[tokio::test]
    async fn test_decline_keeps_no_key_material() {
        let (_alice, bob, vault, invite) = invited(true).await;

        let declined = bob.invites.decline(&invite.uuid).await.unwrap();
        assert_eq!(declined.status, InviteStatus::Declined);
        assert!(!bob.keys.has_key_material(&vault.uuid).await);
        assert!(bob.invites.pending_invites().await.is_empty());

        let err = bob.invites.accept(&invite.uuid).await.unwrap_err();
        assert!(matches!(
            err,
            SyncError::Collaboration(CollaborationError::InvalidInviteTransition { .. })
        ));
    }

    #[tokio::test]
    async fn test_invite_requires_trusted_invitee() {
        let alice = party();
        let stranger = party();
        let vault = alice.keys.create_shared_vault("Team").await.unwrap();

        let err = alice
            .invites
            .create(&vault.uuid, &stranger.uuid, SharedVaultPermission::Read)
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            SyncError::Collaboration(CollaborationError::UntrustedRecipient { .. })
        ));
        assert!(alice.outbox.snapshot().await.invites.is_empty());
    }

    #[tokio::test]
    async fn test_untrusted_inviter_blocks_accept_until_trust_established() {
        let (_alice, bob, vault, invite) = invited(false).await;

        let pending = bob.invites.pending_invites().await;
        assert_eq!(pending.len(), 1);
        assert!(!pending[0].is_trusted);

        let err = bob.invites.accept(&invite.uuid).await.unwrap_err();
        assert!(matches!(
            err,
            SyncError::Collaboration(CollaborationError::UntrustedSender { .. })
        ));
        assert_eq!(bob.invites.get(&invite.uuid).await.unwrap().status, InviteStatus::Pending);
        assert!(!bob.keys.has_key_material(&vault.uuid).await);

        bob.invites
            .establish_trust_for_invite(&invite.uuid, "Alice")
            .await
            .unwrap();
        bob.invites.accept(&invite.uuid).await.unwrap();
        assert!(bob.keys.has_key_material(&vault.uuid).await);
    }

    #[tokio::test]
    async fn test_only_inviter_can_revoke() {
        let (alice, bob, _vault, invite) = invited(true).await;

        assert!(bob.invites.revoke(&invite.uuid).await.is_err());
        let revoked = alice.invites.revoke(&invite.uuid).await.unwrap();
        assert_eq!(revoked.status, InviteStatus::Revoked);
    }

    #[tokio::test]
    async fn test_accept_after_revoke_removes_member_and_rotates() {
        let (alice, bob, vault, invite) = invited(true).await;
        alice.invites.revoke(&invite.uuid).await.unwrap();

        // the server reports bob's accept, which raced the revoke
        let mut reported = alice.outbox.snapshot().await.invites[0].clone();
        reported.status = InviteStatus::Accepted;
        assert!(alice.invites.ingest(vec![reported]).await.is_empty());

        assert_eq!(
            alice.keys.held_versions(&vault.uuid).await,
            vec![INITIAL_KEY_VERSION, INITIAL_KEY_VERSION + 1]
        );
        assert!(alice.keys.permission_of(&vault.uuid, &bob.uuid).await.is_none());
        // no rotated key goes to the removed member
        assert!(alice.outbox.snapshot().await.messages.is_empty());
    }

    #[tokio::test]
    async fn test_invite_for_another_identity_is_rejected() {
        let (alice, _bob, _vault, _invite) = invited(true).await;
        let carol = party();

        let mut misrouted = alice.outbox.snapshot().await.invites[0].clone();
        misrouted.recipient_uuid = carol.uuid.clone();
        let errors = carol.invites.ingest(vec![misrouted]).await;

        assert_eq!(errors.len(), 1);
        assert!(matches!(
            errors[0],
            SyncError::Collaboration(CollaborationError::IntegrityFailure { .. })
        ));
        assert!(carol.invites.pending_invites().await.is_empty());
    }
}
