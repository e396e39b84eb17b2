//! # Error Types
//!
//! Domain-specific error types for cinder-core.
//!
//! ## Error Hierarchy
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                         Error Types                                     │
//! │                                                                         │
//! │  cinder-core errors (this file)                                        │
//! │  ├── CoreError        - Umbrella for domain failures                   │
//! │  ├── CryptoError      - Encryption, decryption, signature failures     │
//! │  └── ValidationError  - Input validation failures                      │
//! │                                                                         │
//! │  cinder-store errors (separate crate)                                  │
//! │  └── DbError          - Persistence failures                           │
//! │                                                                         │
//! │  cinder-sync errors (separate crate)                                   │
//! │  ├── SyncError          - Cycle, transport, key availability           │
//! │  └── CollaborationError - Trust, invites, integrity                    │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Design Principles
//! 1. Use `thiserror` for derive macros (not manual impl)
//! 2. Include context in error messages (item id, vault, version)
//! 3. Never include key material or plaintext in a message

use thiserror::Error;

/// Result type for core operations.
pub type CoreResult<T> = Result<T, CoreError>;

// =============================================================================
// Core Error
// =============================================================================

/// Core domain errors.
#[derive(Debug, Error)]
pub enum CoreError {
    /// A cryptographic operation failed.
    #[error("Crypto error: {0}")]
    Crypto(#[from] CryptoError),

    /// Validation error (wraps ValidationError).
    #[error("Validation error: {0}")]
    Validation(#[from] ValidationError),

    /// A payload could not be (de)serialized.
    #[error("Serialization failed: {0}")]
    Serialization(String),
}

impl From<serde_json::Error> for CoreError {
    fn from(err: serde_json::Error) -> Self {
        CoreError::Serialization(err.to_string())
    }
}

// =============================================================================
// Crypto Error
// =============================================================================

/// Cryptographic failures.
///
/// ## Handling
/// None of these are fatal to the engine. The offending item or message is
/// quarantined by the caller and the rest of the cycle proceeds.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CryptoError {
    /// Encryption failed.
    #[error("Encryption failed: {0}")]
    EncryptionFailed(String),

    /// Ciphertext did not authenticate (wrong key, tampered data).
    #[error("Authentication failed")]
    AuthenticationFailed,

    /// Key bytes had the wrong length or shape.
    #[error("Invalid key: {0}")]
    InvalidKey(String),

    /// Signature did not verify against the expected signing key.
    #[error("Invalid signature")]
    InvalidSignature,

    /// Base64 or length decoding failed.
    #[error("Encoding error: {0}")]
    Encoding(String),

    /// Envelope was addressed to a different recipient key.
    #[error("Envelope is addressed to another recipient")]
    WrongRecipient,
}

impl From<base64::DecodeError> for CryptoError {
    fn from(err: base64::DecodeError) -> Self {
        CryptoError::Encoding(err.to_string())
    }
}

// =============================================================================
// Validation Error
// =============================================================================

/// Input validation errors.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ValidationError {
    /// A required field is missing or empty.
    #[error("{field} is required")]
    Required { field: String },

    /// Field value is too long.
    #[error("{field} must be at most {max} characters")]
    TooLong { field: String, max: usize },

    /// Field value has an invalid format.
    #[error("{field} has invalid format: {reason}")]
    InvalidFormat { field: String, reason: String },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_crypto_error_wraps_into_core() {
        let err: CoreError = CryptoError::AuthenticationFailed.into();
        assert!(err.to_string().contains("Authentication failed"));
    }

    #[test]
    fn test_validation_error_display() {
        let err = ValidationError::TooLong {
            field: "name".into(),
            max: 10,
        };
        assert_eq!(err.to_string(), "name must be at most 10 characters");
    }
}
