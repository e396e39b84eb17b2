//! # Cryptographic Primitives
//!
//! Symmetric item encryption and signed asymmetric envelopes.
//!
//! ## Item Encryption
//! ```text
//! plaintext ──► ChaCha20-Poly1305(vault key, random nonce, AAD) ──► EncryptedPayload
//!                                                   │
//!                         AAD = "cinder-item-v1" ‖ item id ‖ content type
//! ```
//! The AAD binds a ciphertext to its item, so a server cannot swap payloads
//! between items without failing authentication.
//!
//! ## Envelope Sealing
//! ```text
//! ┌──────────────────────────────────────────────────────────────────────────┐
//! │ sender                                                                   │
//! │   ephemeral X25519 ──DH──► recipient X25519 public key                    │
//! │            │                                                             │
//! │            ▼                                                             │
//! │   HKDF-SHA256(salt = eph ‖ recipient, info = label ‖ kind) ──► body key  │
//! │            │                                                             │
//! │            ▼                                                             │
//! │   ChaCha20-Poly1305(body key, nonce, AAD = kind) ──► ciphertext           │
//! │            │                                                             │
//! │            ▼                                                             │
//! │   Ed25519 sign(kind ‖ sender keys ‖ recipient ‖ eph ‖ nonce ‖ ciphertext) │
//! └──────────────────────────────────────────────────────────────────────────┘
//! ```
//! Opening checks the recipient key, derives the same body key from the
//! recipient's static secret and decrypts. Verifying the signature against a
//! *trusted* signing key is a separate step owned by the caller.

use base64::{engine::general_purpose::STANDARD, Engine};
use chacha20poly1305::{
    aead::{Aead, AeadCore, KeyInit, OsRng, Payload},
    ChaCha20Poly1305, Nonce,
};
use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey};
use hkdf::Hkdf;
use rand::RngCore;
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use std::fmt;
use x25519_dalek::{PublicKey, StaticSecret};
use zeroize::{Zeroize, ZeroizeOnDrop, Zeroizing};

use crate::error::CryptoError;
use crate::types::{ContentType, ItemId, MessageKind};

const KEY_LEN: usize = 32;
const NONCE_LEN: usize = 12;
const ITEM_AAD_LABEL: &[u8] = b"cinder-item-v1";
const ENVELOPE_INFO_LABEL: &[u8] = b"cinder-envelope-v1";

// =============================================================================
// Symmetric Keys
// =============================================================================

/// A versioned 256-bit symmetric key. Wiped on drop.
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct SymmetricKey {
    bytes: [u8; KEY_LEN],
    version: u64,
}

impl SymmetricKey {
    /// Generates a fresh random key.
    pub fn generate(version: u64) -> Self {
        let mut bytes = [0u8; KEY_LEN];
        OsRng.fill_bytes(&mut bytes);
        SymmetricKey { bytes, version }
    }

    pub fn from_bytes(bytes: [u8; KEY_LEN], version: u64) -> Self {
        SymmetricKey { bytes, version }
    }

    /// Decodes a key previously exported with [`SymmetricKey::to_base64`].
    pub fn from_base64(encoded: &str, version: u64) -> Result<Self, CryptoError> {
        let decoded = Zeroizing::new(STANDARD.decode(encoded)?);
        let bytes: [u8; KEY_LEN] = decoded
            .as_slice()
            .try_into()
            .map_err(|_| CryptoError::InvalidKey(format!("expected {} bytes", KEY_LEN)))?;
        Ok(SymmetricKey { bytes, version })
    }

    /// Exports the raw key. Only ever placed inside an envelope body.
    pub fn to_base64(&self) -> Zeroizing<String> {
        Zeroizing::new(STANDARD.encode(self.bytes))
    }

    pub fn version(&self) -> u64 {
        self.version
    }

    fn cipher(&self) -> ChaCha20Poly1305 {
        ChaCha20Poly1305::new((&self.bytes).into())
    }

    /// Encrypts `plaintext` bound to `aad`.
    pub fn encrypt(&self, plaintext: &[u8], aad: &[u8]) -> Result<EncryptedPayload, CryptoError> {
        let nonce = ChaCha20Poly1305::generate_nonce(&mut OsRng);
        let ciphertext = self
            .cipher()
            .encrypt(&nonce, Payload { msg: plaintext, aad })
            .map_err(|e| CryptoError::EncryptionFailed(e.to_string()))?;

        Ok(EncryptedPayload {
            key_version: self.version,
            nonce: STANDARD.encode(nonce),
            ciphertext: STANDARD.encode(ciphertext),
        })
    }

    /// Decrypts a payload produced under this key with the same `aad`.
    pub fn decrypt(&self, payload: &EncryptedPayload, aad: &[u8]) -> Result<Vec<u8>, CryptoError> {
        if payload.key_version != self.version {
            return Err(CryptoError::InvalidKey(format!(
                "payload needs key version {}, have {}",
                payload.key_version, self.version
            )));
        }
        let nonce = decode_nonce(&payload.nonce)?;
        let ciphertext = STANDARD.decode(&payload.ciphertext)?;
        self.cipher()
            .decrypt(&nonce, Payload { msg: &ciphertext, aad })
            .map_err(|_| CryptoError::AuthenticationFailed)
    }
}

impl fmt::Debug for SymmetricKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SymmetricKey")
            .field("version", &self.version)
            .finish_non_exhaustive()
    }
}

/// Associated data binding a ciphertext to one item.
pub fn item_aad(id: &ItemId, content_type: &ContentType) -> Vec<u8> {
    let type_name = content_type.to_string();
    let mut aad = Vec::with_capacity(ITEM_AAD_LABEL.len() + id.as_str().len() + type_name.len() + 2);
    aad.extend_from_slice(ITEM_AAD_LABEL);
    aad.push(0);
    aad.extend_from_slice(id.as_str().as_bytes());
    aad.push(0);
    aad.extend_from_slice(type_name.as_bytes());
    aad
}

/// Ciphertext of one item as stored and transmitted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EncryptedPayload {
    pub key_version: u64,
    /// Base64 nonce.
    pub nonce: String,
    /// Base64 ciphertext with tag.
    pub ciphertext: String,
}

fn decode_nonce(encoded: &str) -> Result<Nonce, CryptoError> {
    let bytes = STANDARD.decode(encoded)?;
    if bytes.len() != NONCE_LEN {
        return Err(CryptoError::Encoding(format!(
            "nonce must be {} bytes, got {}",
            NONCE_LEN,
            bytes.len()
        )));
    }
    Ok(Nonce::clone_from_slice(&bytes))
}

fn decode_key32(encoded: &str, what: &str) -> Result<[u8; KEY_LEN], CryptoError> {
    let bytes = STANDARD.decode(encoded)?;
    bytes
        .as_slice()
        .try_into()
        .map_err(|_| CryptoError::InvalidKey(format!("{} must be {} bytes", what, KEY_LEN)))
}

// =============================================================================
// Identity Keys
// =============================================================================

/// Public half of a user identity, base64 encoded.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PublicIdentity {
    pub encryption_public_key: String,
    pub signing_public_key: String,
}

/// A user's long-term X25519 encryption key and Ed25519 signing key.
pub struct IdentityKeyPair {
    encryption: StaticSecret,
    signing: SigningKey,
}

impl IdentityKeyPair {
    pub fn generate() -> Self {
        IdentityKeyPair {
            encryption: StaticSecret::random_from_rng(OsRng),
            signing: SigningKey::generate(&mut OsRng),
        }
    }

    /// Restores an identity from its two 32-byte secrets.
    pub fn from_secret_bytes(encryption: [u8; KEY_LEN], signing: [u8; KEY_LEN]) -> Self {
        IdentityKeyPair {
            encryption: StaticSecret::from(encryption),
            signing: SigningKey::from_bytes(&signing),
        }
    }

    pub fn public(&self) -> PublicIdentity {
        PublicIdentity {
            encryption_public_key: STANDARD.encode(PublicKey::from(&self.encryption).as_bytes()),
            signing_public_key: STANDARD.encode(self.signing.verifying_key().as_bytes()),
        }
    }
}

impl fmt::Debug for IdentityKeyPair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("IdentityKeyPair")
            .field("public", &self.public())
            .finish_non_exhaustive()
    }
}

// =============================================================================
// Envelope
// =============================================================================

/// A signed, asymmetrically encrypted message between two users.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Envelope {
    pub kind: MessageKind,
    pub sender_signing_public_key: String,
    pub sender_encryption_public_key: String,
    pub recipient_public_key: String,
    pub ephemeral_public_key: String,
    pub nonce: String,
    pub ciphertext: String,
    pub signature: String,
}

impl Envelope {
    /// Encrypts `body` to `recipient_public_key` and signs it as `sender`.
    pub fn seal(
        kind: MessageKind,
        body: &[u8],
        sender: &IdentityKeyPair,
        recipient_public_key: &str,
    ) -> Result<Self, CryptoError> {
        let recipient = PublicKey::from(decode_key32(recipient_public_key, "recipient key")?);
        let ephemeral = StaticSecret::random_from_rng(OsRng);
        let ephemeral_public = PublicKey::from(&ephemeral);

        let body_key = derive_body_key(&ephemeral, &ephemeral_public, &recipient, kind)?;
        let nonce = ChaCha20Poly1305::generate_nonce(&mut OsRng);
        let ciphertext = ChaCha20Poly1305::new((&*body_key).into())
            .encrypt(
                &nonce,
                Payload {
                    msg: body,
                    aad: kind.as_str().as_bytes(),
                },
            )
            .map_err(|e| CryptoError::EncryptionFailed(e.to_string()))?;

        let sender_public = sender.public();
        let mut envelope = Envelope {
            kind,
            sender_signing_public_key: sender_public.signing_public_key,
            sender_encryption_public_key: sender_public.encryption_public_key,
            recipient_public_key: STANDARD.encode(recipient.as_bytes()),
            ephemeral_public_key: STANDARD.encode(ephemeral_public.as_bytes()),
            nonce: STANDARD.encode(nonce),
            ciphertext: STANDARD.encode(ciphertext),
            signature: String::new(),
        };
        let signature = sender.signing.sign(&envelope.signed_bytes());
        envelope.signature = STANDARD.encode(signature.to_bytes());
        Ok(envelope)
    }

    /// Checks the signature against an expected (trusted) signing key.
    ///
    /// Fails if the envelope claims a different signer or the signature is bad.
    pub fn verify(&self, trusted_signing_public_key: &str) -> Result<(), CryptoError> {
        if self.sender_signing_public_key != trusted_signing_public_key {
            return Err(CryptoError::InvalidSignature);
        }
        let key_bytes = decode_key32(trusted_signing_public_key, "signing key")?;
        let verifying_key = VerifyingKey::from_bytes(&key_bytes)
            .map_err(|e| CryptoError::InvalidKey(e.to_string()))?;
        let signature_bytes: [u8; 64] = STANDARD
            .decode(&self.signature)?
            .as_slice()
            .try_into()
            .map_err(|_| CryptoError::InvalidSignature)?;
        let signature = Signature::from_bytes(&signature_bytes);
        verifying_key
            .verify(&self.signed_bytes(), &signature)
            .map_err(|_| CryptoError::InvalidSignature)
    }

    /// Decrypts the body with the recipient's identity.
    pub fn open(&self, recipient: &IdentityKeyPair) -> Result<Vec<u8>, CryptoError> {
        if recipient.public().encryption_public_key != self.recipient_public_key {
            return Err(CryptoError::WrongRecipient);
        }
        let ephemeral_public = PublicKey::from(decode_key32(&self.ephemeral_public_key, "ephemeral key")?);
        let recipient_public = PublicKey::from(&recipient.encryption);

        let shared = recipient.encryption.diffie_hellman(&ephemeral_public);
        let body_key = expand_body_key(shared.as_bytes(), &ephemeral_public, &recipient_public, self.kind)?;
        let nonce = decode_nonce(&self.nonce)?;
        let ciphertext = STANDARD.decode(&self.ciphertext)?;

        ChaCha20Poly1305::new((&*body_key).into())
            .decrypt(
                &nonce,
                Payload {
                    msg: &ciphertext,
                    aad: self.kind.as_str().as_bytes(),
                },
            )
            .map_err(|_| CryptoError::AuthenticationFailed)
    }

    fn signed_bytes(&self) -> Vec<u8> {
        let parts: [&[u8]; 7] = [
            self.kind.as_str().as_bytes(),
            self.sender_signing_public_key.as_bytes(),
            self.sender_encryption_public_key.as_bytes(),
            self.recipient_public_key.as_bytes(),
            self.ephemeral_public_key.as_bytes(),
            self.nonce.as_bytes(),
            self.ciphertext.as_bytes(),
        ];
        let mut out = Vec::new();
        for part in parts {
            out.extend_from_slice(&(part.len() as u32).to_be_bytes());
            out.extend_from_slice(part);
        }
        out
    }
}

fn derive_body_key(
    ephemeral: &StaticSecret,
    ephemeral_public: &PublicKey,
    recipient: &PublicKey,
    kind: MessageKind,
) -> Result<Zeroizing<[u8; KEY_LEN]>, CryptoError> {
    let shared = ephemeral.diffie_hellman(recipient);
    expand_body_key(shared.as_bytes(), ephemeral_public, recipient, kind)
}

fn expand_body_key(
    shared: &[u8; KEY_LEN],
    ephemeral_public: &PublicKey,
    recipient: &PublicKey,
    kind: MessageKind,
) -> Result<Zeroizing<[u8; KEY_LEN]>, CryptoError> {
    let mut salt = [0u8; KEY_LEN * 2];
    salt[..KEY_LEN].copy_from_slice(ephemeral_public.as_bytes());
    salt[KEY_LEN..].copy_from_slice(recipient.as_bytes());

    let mut info = ENVELOPE_INFO_LABEL.to_vec();
    info.extend_from_slice(kind.as_str().as_bytes());

    let mut okm = Zeroizing::new([0u8; KEY_LEN]);
    Hkdf::<Sha256>::new(Some(&salt), shared)
        .expand(&info, &mut okm[..])
        .map_err(|e| CryptoError::EncryptionFailed(e.to_string()))?;
    Ok(okm)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_item_encryption_roundtrip() {
        let key = SymmetricKey::generate(1);
        let aad = item_aad(&ItemId::from("n1"), &ContentType::Note);
        let payload = key.encrypt(b"secret note", &aad).unwrap();

        assert_eq!(payload.key_version, 1);
        assert_eq!(key.decrypt(&payload, &aad).unwrap(), b"secret note");
    }

    #[test]
    fn test_item_ciphertext_bound_to_item() {
        let key = SymmetricKey::generate(1);
        let payload = key
            .encrypt(b"x", &item_aad(&ItemId::from("n1"), &ContentType::Note))
            .unwrap();
        let other = item_aad(&ItemId::from("n2"), &ContentType::Note);
        assert_eq!(key.decrypt(&payload, &other), Err(CryptoError::AuthenticationFailed));
    }

    #[test]
    fn test_decrypt_rejects_version_mismatch() {
        let v1 = SymmetricKey::generate(1);
        let v2 = SymmetricKey::generate(2);
        let payload = v1.encrypt(b"x", b"aad").unwrap();
        assert!(matches!(v2.decrypt(&payload, b"aad"), Err(CryptoError::InvalidKey(_))));
    }

    #[test]
    fn test_key_base64_export() {
        let key = SymmetricKey::generate(7);
        let restored = SymmetricKey::from_base64(&key.to_base64(), 7).unwrap();
        let payload = key.encrypt(b"x", b"").unwrap();
        assert_eq!(restored.decrypt(&payload, b"").unwrap(), b"x");
        assert!(SymmetricKey::from_base64("AAAA", 1).is_err());
    }

    #[test]
    fn test_envelope_seal_open_verify() {
        let alice = IdentityKeyPair::generate();
        let bob = IdentityKeyPair::generate();
        let bob_public = bob.public();

        let envelope = Envelope::seal(
            MessageKind::Invite,
            b"vault key",
            &alice,
            &bob_public.encryption_public_key,
        )
        .unwrap();

        envelope.verify(&alice.public().signing_public_key).unwrap();
        assert_eq!(envelope.open(&bob).unwrap(), b"vault key");
    }

    #[test]
    fn test_envelope_wrong_recipient() {
        let alice = IdentityKeyPair::generate();
        let bob = IdentityKeyPair::generate();
        let eve = IdentityKeyPair::generate();
        let envelope = Envelope::seal(
            MessageKind::KeyRotation,
            b"k",
            &alice,
            &bob.public().encryption_public_key,
        )
        .unwrap();
        assert_eq!(envelope.open(&eve), Err(CryptoError::WrongRecipient));
    }

    #[test]
    fn test_envelope_tampering_detected() {
        let alice = IdentityKeyPair::generate();
        let bob = IdentityKeyPair::generate();
        let mut envelope = Envelope::seal(
            MessageKind::Invite,
            b"k",
            &alice,
            &bob.public().encryption_public_key,
        )
        .unwrap();

        envelope.kind = MessageKind::KeyRotation;
        assert_eq!(
            envelope.verify(&alice.public().signing_public_key),
            Err(CryptoError::InvalidSignature)
        );
    }

    #[test]
    fn test_envelope_untrusted_signer_rejected() {
        let alice = IdentityKeyPair::generate();
        let mallory = IdentityKeyPair::generate();
        let bob = IdentityKeyPair::generate();
        let envelope = Envelope::seal(
            MessageKind::Invite,
            b"k",
            &mallory,
            &bob.public().encryption_public_key,
        )
        .unwrap();
        assert_eq!(
            envelope.verify(&alice.public().signing_public_key),
            Err(CryptoError::InvalidSignature)
        );
    }
}
