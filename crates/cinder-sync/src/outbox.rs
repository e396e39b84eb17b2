//! # Outbound Queue
//!
//! Holds everything that reaches the server outside the item stream until
//! the next sync cycle flushes it.
//!
//! ## Flush Flow
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                                                                         │
//! │  InviteProtocol ──┐                                                     │
//! │  VaultKeyManager ─┼──► push_*() ──► ┌─────────────────────────────┐    │
//! │  MessageChannel ──┘                 │ OutboundBatch (in memory)   │    │
//! │                                     │  invites | messages |       │    │
//! │                                     │  invite_updates | vault ops │    │
//! │                                     └──────────────┬──────────────┘    │
//! │                                                    │ flush()            │
//! │                                                    ▼                    │
//! │  1. Snapshot: clone the queued entries, note how many of each           │
//! │  2. Send:     endpoint.post_outbound(snapshot)                          │
//! │  3. Ack:      drop exactly the entries that were sent                   │
//! │  4. Failure:  queue untouched, error returned to the cycle              │
//! │                                                                         │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! Entries pushed while a flush is in flight stay queued for the next one.

use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::error::SyncResult;
use crate::protocol::{
    InviteStatusUpdate, OutboundBatch, OutboundMessage, SharedVaultInviteServerHash,
    VaultOperation,
};
use crate::transport::SyncEndpoint;

/// Queue of outbound side-channel operations.
#[derive(Debug, Default)]
pub struct OutboundQueue {
    batch: Mutex<OutboundBatch>,
}

impl OutboundQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn push_message(&self, message: OutboundMessage) {
        debug!(
            message_id = %message.uuid,
            recipient = %message.recipient_uuid,
            kind = %message.envelope.kind,
            "Queued asymmetric message"
        );
        self.batch.lock().await.messages.push(message);
    }

    pub async fn push_invite(&self, invite: SharedVaultInviteServerHash) {
        debug!(invite = %invite.uuid, vault = %invite.shared_vault_uuid, "Queued invite");
        self.batch.lock().await.invites.push(invite);
    }

    pub async fn push_invite_update(&self, update: InviteStatusUpdate) {
        debug!(invite = %update.invite_uuid, status = %update.status, "Queued invite update");
        self.batch.lock().await.invite_updates.push(update);
    }

    pub async fn push_vault_operation(&self, operation: VaultOperation) {
        debug!(?operation, "Queued vault operation");
        self.batch.lock().await.vault_operations.push(operation);
    }

    pub async fn len(&self) -> usize {
        self.batch.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.batch.lock().await.is_empty()
    }

    /// Copy of the queued entries.
    pub async fn snapshot(&self) -> OutboundBatch {
        self.batch.lock().await.clone()
    }

    /// Sends every queued entry in one call. Returns how many were sent.
    pub async fn flush(&self, endpoint: &dyn SyncEndpoint) -> SyncResult<usize> {
        let pending = self.snapshot().await;
        if pending.is_empty() {
            return Ok(0);
        }

        let sent = SentCounts::of(&pending);
        let total = pending.len();

        if let Err(e) = endpoint.post_outbound(pending).await {
            warn!(error = %e, queued = total, "Outbound flush failed, keeping queue");
            return Err(e);
        }

        let mut batch = self.batch.lock().await;
        batch.invites.drain(..sent.invites);
        batch.messages.drain(..sent.messages);
        batch.invite_updates.drain(..sent.invite_updates);
        batch.vault_operations.drain(..sent.vault_operations);

        info!(sent = total, remaining = batch.len(), "Outbound queue flushed");
        Ok(total)
    }
}

struct SentCounts {
    invites: usize,
    messages: usize,
    invite_updates: usize,
    vault_operations: usize,
}

impl SentCounts {
    fn of(batch: &OutboundBatch) -> Self {
        SentCounts {
            invites: batch.invites.len(),
            messages: batch.messages.len(),
            invite_updates: batch.invite_updates.len(),
            vault_operations: batch.vault_operations.len(),
        }
    }
}
