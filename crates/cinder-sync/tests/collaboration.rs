//! Multi-user flows through an in-memory relay server.

mod common;

use std::sync::Arc;

use chrono::Utc;
use uuid::Uuid;

use cinder_core::{
    ContentType, Envelope, IdentityKeyPair, InviteStatus, MessageKind, SharedVault,
    SharedVaultPermission,
};
use cinder_sync::protocol::AsymmetricMessageServerHash;
use cinder_sync::{CollaborationError, EngineEvent, EventKind, SyncError};

use common::{start_engine, trust, EngineOptions, FakeServer, TestEngine};

async fn user(server: &Arc<FakeServer>) -> TestEngine {
    let user_uuid = Uuid::new_v4().to_string();
    start_engine(
        server.client(&user_uuid),
        EngineOptions {
            user_uuid,
            ..Default::default()
        },
    )
    .await
}

/// Alice owns a vault with one note and has invited `member`.
async fn invite_into_vault(
    alice: &TestEngine,
    member: &TestEngine,
    vault: &SharedVault,
) -> String {
    let invite = alice
        .engine
        .invite(&vault.uuid, &member.user_uuid, SharedVaultPermission::Write)
        .await
        .unwrap();
    alice.engine.sync().await.unwrap();
    member.engine.sync().await.unwrap();
    invite.uuid
}

#[tokio::test]
async fn test_invite_accept_downloads_vault() {
    let server = FakeServer::new();
    let alice = user(&server).await;
    let bob = user(&server).await;
    trust(&alice, &bob, "Bob").await;
    trust(&bob, &alice, "Alice").await;

    let vault = alice.engine.create_shared_vault("Team").await.unwrap();
    let note = alice
        .engine
        .create_item(ContentType::Note, "hello team", vault.scope())
        .await
        .unwrap();
    let invite_uuid = invite_into_vault(&alice, &bob, &vault).await;

    let pending = bob.engine.pending_invites().await;
    assert_eq!(pending.len(), 1);
    assert!(pending[0].is_trusted);
    assert_eq!(pending[0].invite.inviter_uuid, alice.user_uuid);

    let mut completed = bob
        .engine
        .subscribe(&[EventKind::SyncSharedVaultFromScratchCompleted]);
    let accepted = bob.engine.accept_invite(&invite_uuid).await.unwrap();
    assert_eq!(accepted.invite.status, InviteStatus::Accepted);
    assert!(completed.try_recv().is_some());

    let downloaded = bob.engine.item(&note.id).await.unwrap();
    assert_eq!(downloaded.content, "hello team");
    assert_eq!(downloaded.scope, vault.scope());

    let server_vault = server.vault(&vault.uuid).unwrap();
    assert!(server_vault.members.iter().any(|m| m.user_uuid == bob.user_uuid));
}

#[tokio::test]
async fn test_second_device_of_same_account_reads_vault() {
    let server = FakeServer::new();
    let laptop = user(&server).await;
    let phone = start_engine(
        server.client(&laptop.user_uuid),
        EngineOptions {
            user_uuid: laptop.user_uuid.clone(),
            personal_key: laptop.personal_key.clone(),
            ..Default::default()
        },
    )
    .await;

    let vault = laptop.engine.create_shared_vault("Team").await.unwrap();
    let note = laptop
        .engine
        .create_item(ContentType::Note, "written on the laptop", vault.scope())
        .await
        .unwrap();
    laptop.engine.sync().await.unwrap();

    let outcome = phone.engine.sync().await.unwrap();
    assert_eq!(outcome.parked, 0);
    assert!(outcome.fatal_warning().is_none());
    assert_eq!(
        phone.engine.item(&note.id).await.unwrap().content,
        "written on the laptop"
    );

    // the phone can write into the vault, and a rotation reaches it too
    let reply = phone
        .engine
        .create_item(ContentType::Note, "written on the phone", vault.scope())
        .await
        .unwrap();
    phone.engine.sync().await.unwrap();
    laptop.engine.rotate_vault_key(&vault.uuid).await.unwrap();
    let rotated = laptop
        .engine
        .create_item(ContentType::Note, "after rotation", vault.scope())
        .await
        .unwrap();
    laptop.engine.sync().await.unwrap();

    let outcome = phone.engine.sync().await.unwrap();
    assert_eq!(outcome.parked, 0);
    assert_eq!(
        phone.engine.item(&rotated.id).await.unwrap().content,
        "after rotation"
    );
    assert_eq!(
        laptop.engine.item(&reply.id).await.unwrap().content,
        "written on the phone"
    );
}

#[tokio::test]
async fn test_declined_invite_cannot_be_accepted() {
    let server = FakeServer::new();
    let alice = user(&server).await;
    let bob = user(&server).await;
    trust(&alice, &bob, "Bob").await;
    trust(&bob, &alice, "Alice").await;

    let vault = alice.engine.create_shared_vault("Team").await.unwrap();
    let invite_uuid = invite_into_vault(&alice, &bob, &vault).await;

    bob.engine.decline_invite(&invite_uuid).await.unwrap();
    let err = bob.engine.accept_invite(&invite_uuid).await.unwrap_err();

    assert!(matches!(
        err,
        SyncError::Collaboration(CollaborationError::InvalidInviteTransition { .. })
    ));
    assert!(bob.engine.vaults().await.is_empty());
}

#[tokio::test]
async fn test_untrusted_invite_needs_trust_first() {
    let server = FakeServer::new();
    let alice = user(&server).await;
    let bob = user(&server).await;
    trust(&alice, &bob, "Bob").await;

    let vault = alice.engine.create_shared_vault("Team").await.unwrap();
    let invite_uuid = invite_into_vault(&alice, &bob, &vault).await;

    let pending = bob.engine.pending_invites().await;
    assert_eq!(pending.len(), 1);
    assert!(!pending[0].is_trusted);

    let err = bob.engine.accept_invite(&invite_uuid).await.unwrap_err();
    assert!(matches!(
        err,
        SyncError::Collaboration(CollaborationError::UntrustedSender { .. })
    ));

    let contact = bob
        .engine
        .establish_trust_for_invite(&invite_uuid, "Alice")
        .await
        .unwrap();
    assert_eq!(contact.contact_uuid, alice.user_uuid);

    bob.engine.accept_invite(&invite_uuid).await.unwrap();
    assert_eq!(bob.engine.vaults().await.len(), 1);
}

#[tokio::test]
async fn test_removed_member_loses_vault_and_misses_rotation() {
    let server = FakeServer::new();
    let alice = user(&server).await;
    let bob = user(&server).await;
    let carol = user(&server).await;
    for (who, whom, name) in [
        (&alice, &bob, "Bob"),
        (&alice, &carol, "Carol"),
        (&bob, &alice, "Alice"),
        (&carol, &alice, "Alice"),
    ] {
        trust(who, whom, name).await;
    }

    let vault = alice.engine.create_shared_vault("Team").await.unwrap();
    let old_note = alice
        .engine
        .create_item(ContentType::Note, "before", vault.scope())
        .await
        .unwrap();
    let bob_invite = invite_into_vault(&alice, &bob, &vault).await;
    let carol_invite = invite_into_vault(&alice, &carol, &vault).await;
    bob.engine.accept_invite(&bob_invite).await.unwrap();
    carol.engine.accept_invite(&carol_invite).await.unwrap();
    alice.engine.sync().await.unwrap();
    assert!(bob.engine.item(&old_note.id).await.is_some());

    let report = alice
        .engine
        .remove_member(&vault.uuid, &bob.user_uuid)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(report.key_version, 2);
    assert_eq!(report.recipients, vec![carol.user_uuid.clone()]);

    let new_note = alice
        .engine
        .create_item(ContentType::Note, "after", vault.scope())
        .await
        .unwrap();
    alice.engine.sync().await.unwrap();

    let mut installed = carol.engine.subscribe(&[EventKind::VaultKeyInstalled]);
    carol.engine.sync().await.unwrap();
    assert!(installed.try_recv().is_some());
    assert_eq!(carol.engine.item(&new_note.id).await.unwrap().content, "after");

    bob.engine.sync().await.unwrap();
    assert!(bob.engine.vaults().await.is_empty());
    assert!(bob.engine.item(&old_note.id).await.is_none());
    assert!(bob.engine.item(&new_note.id).await.is_none());
}

#[tokio::test]
async fn test_forged_message_is_discarded() {
    let server = FakeServer::new();
    let alice = user(&server).await;
    let bob = user(&server).await;
    trust(&bob, &alice, "Alice").await;

    let forger = IdentityKeyPair::generate();
    let bob_keys = bob.engine.public_identity();
    let envelope = Envelope::seal(
        MessageKind::KeyRotation,
        b"{}",
        &forger,
        &bob_keys.encryption_public_key,
    )
    .unwrap();
    server.inject_message(
        &bob.user_uuid,
        AsymmetricMessageServerHash {
            uuid: Uuid::new_v4().to_string(),
            sender_uuid: alice.user_uuid.clone(),
            envelope,
            created_at: Utc::now(),
        },
    );

    let mut failures = bob.engine.subscribe(&[EventKind::IntegrityFailure]);
    let outcome = bob.engine.sync().await.unwrap();

    assert_eq!(outcome.integrity_failures, 1);
    assert!(matches!(
        failures.try_recv(),
        Some(EngineEvent::IntegrityFailure { .. })
    ));
    assert_eq!(server.inbox_len(&bob.user_uuid), 0);
}

#[tokio::test]
async fn test_trust_confirmation_becomes_trust_request() {
    let server = FakeServer::new();
    let alice = user(&server).await;
    let bob = user(&server).await;
    trust(&alice, &bob, "Bob").await;
    trust(&bob, &alice, "Al").await;

    alice
        .engine
        .send_trust_confirmation(&bob.user_uuid, "Alice")
        .await
        .unwrap();
    alice.engine.sync().await.unwrap();
    assert_eq!(server.inbox_len(&bob.user_uuid), 1);

    let mut requests = bob.engine.subscribe(&[EventKind::TrustRequestReceived]);
    bob.engine.sync().await.unwrap();
    assert!(requests.try_recv().is_some());

    let pending = bob.engine.pending_trust_requests().await;
    assert_eq!(pending.len(), 1);
    assert_eq!(pending[0].draft.contact_uuid, alice.user_uuid);
    assert_eq!(pending[0].draft.name, "Alice");

    let contact = bob
        .engine
        .accept_trust_request(&alice.user_uuid)
        .await
        .unwrap();
    assert_eq!(contact.name, "Alice");
    assert!(bob.engine.pending_trust_requests().await.is_empty());
}

#[tokio::test]
async fn test_read_only_member_cannot_write() {
    let server = FakeServer::new();
    let alice = user(&server).await;
    let bob = user(&server).await;
    trust(&alice, &bob, "Bob").await;
    trust(&bob, &alice, "Alice").await;

    let vault = alice.engine.create_shared_vault("Team").await.unwrap();
    let invite = alice
        .engine
        .invite(&vault.uuid, &bob.user_uuid, SharedVaultPermission::Read)
        .await
        .unwrap();
    alice.engine.sync().await.unwrap();
    bob.engine.sync().await.unwrap();
    bob.engine.accept_invite(&invite.uuid).await.unwrap();

    let err = bob
        .engine
        .create_item(ContentType::Note, "nope", vault.scope())
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        SyncError::Collaboration(CollaborationError::PermissionDenied { .. })
    ));
}
