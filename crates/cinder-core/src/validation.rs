//! # Validation Module
//!
//! Input validation for user-supplied values: contact details, vault names
//! and public keys.
//!
//! ## Where validation happens
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │  Layer 1: Embedding application                                        │
//! │  └── Form checks, immediate feedback                                   │
//! │           │                                                             │
//! │           ▼                                                             │
//! │  Layer 2: Engine entry points (cinder-sync)                            │
//! │  └── THIS MODULE: shape and length rules                               │
//! │           │                                                             │
//! │           ▼                                                             │
//! │  Layer 3: Crypto                                                       │
//! │  └── Key decoding rejects anything that is not a real key              │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Usage
//! ```rust
//! use cinder_core::validation::{validate_display_name, validate_vault_name};
//!
//! validate_display_name("Alice").unwrap();
//! assert!(validate_vault_name("").is_err());
//! ```

use base64::{engine::general_purpose::STANDARD, Engine};
use uuid::Uuid;

use crate::error::ValidationError;
use crate::{MAX_DISPLAY_NAME_LEN, MAX_VAULT_NAME_LEN};

/// Result type for validation operations.
pub type ValidationResult<T> = Result<T, ValidationError>;

// =============================================================================
// String Validators
// =============================================================================

fn validate_name(field: &str, value: &str, max: usize) -> ValidationResult<()> {
    let value = value.trim();

    if value.is_empty() {
        return Err(ValidationError::Required {
            field: field.to_string(),
        });
    }

    if value.chars().count() > max {
        return Err(ValidationError::TooLong {
            field: field.to_string(),
            max,
        });
    }

    Ok(())
}

/// Validates a trusted contact's display name.
///
/// ## Rules
/// - Must not be blank
/// - At most 100 characters
pub fn validate_display_name(name: &str) -> ValidationResult<()> {
    validate_name("name", name, MAX_DISPLAY_NAME_LEN)
}

/// Validates a shared vault name.
pub fn validate_vault_name(name: &str) -> ValidationResult<()> {
    validate_name("vault name", name, MAX_VAULT_NAME_LEN)
}

/// Validates a user or contact uuid.
pub fn validate_user_uuid(field: &str, value: &str) -> ValidationResult<()> {
    if value.trim().is_empty() {
        return Err(ValidationError::Required {
            field: field.to_string(),
        });
    }

    Uuid::parse_str(value).map_err(|e| ValidationError::InvalidFormat {
        field: field.to_string(),
        reason: e.to_string(),
    })?;

    Ok(())
}

// =============================================================================
// Key Validators
// =============================================================================

/// Validates a base64 encoded 32-byte public key (X25519 or Ed25519).
pub fn validate_public_key(field: &str, encoded: &str) -> ValidationResult<()> {
    if encoded.is_empty() {
        return Err(ValidationError::Required {
            field: field.to_string(),
        });
    }

    let bytes = STANDARD
        .decode(encoded)
        .map_err(|e| ValidationError::InvalidFormat {
            field: field.to_string(),
            reason: e.to_string(),
        })?;

    if bytes.len() != 32 {
        return Err(ValidationError::InvalidFormat {
            field: field.to_string(),
            reason: format!("expected 32 bytes, got {}", bytes.len()),
        });
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::IdentityKeyPair;

    #[test]
    fn test_validate_display_name() {
        assert!(validate_display_name("Alice").is_ok());
        assert!(validate_display_name("   ").is_err());
        assert!(validate_display_name(&"a".repeat(101)).is_err());
    }

    #[test]
    fn test_validate_vault_name() {
        assert!(validate_vault_name("Family").is_ok());
        assert!(matches!(
            validate_vault_name(""),
            Err(ValidationError::Required { .. })
        ));
    }

    #[test]
    fn test_validate_user_uuid() {
        assert!(validate_user_uuid("contact_uuid", &Uuid::new_v4().to_string()).is_ok());
        assert!(matches!(
            validate_user_uuid("contact_uuid", "bob"),
            Err(ValidationError::InvalidFormat { .. })
        ));
    }

    #[test]
    fn test_validate_public_key() {
        let identity = IdentityKeyPair::generate().public();
        assert!(validate_public_key("key", &identity.encryption_public_key).is_ok());
        assert!(validate_public_key("key", &identity.signing_public_key).is_ok());
        assert!(validate_public_key("key", "not base64!").is_err());
        assert!(validate_public_key("key", "AAAA").is_err());
        assert!(validate_public_key("key", "").is_err());
    }
}
