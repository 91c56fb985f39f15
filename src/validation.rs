//! Input validation for reconciliation operations.
//!
//! Validates user-supplied identifiers before they reach the provider or the
//! datastore, to prevent injection into queries and to fail fast on obviously
//! malformed input.

use crate::error::{PaysyncError, Result};

/// Maximum length for local user ids.
const MAX_USER_ID_LENGTH: usize = 64;

/// Maximum length for provider price ids.
const MAX_PRICE_ID_LENGTH: usize = 128;

/// Validate a local user id.
///
/// User ids must not be empty, not exceed 64 characters, and contain only
/// alphanumeric characters, underscores, and hyphens (UUIDs qualify).
pub fn validate_user_id(id: &str) -> Result<()> {
    if id.is_empty() {
        return Err(PaysyncError::InvalidInput(
            "user id cannot be empty".to_string(),
        ));
    }

    if id.len() > MAX_USER_ID_LENGTH {
        return Err(PaysyncError::InvalidInput(format!(
            "user id exceeds maximum length of {}",
            MAX_USER_ID_LENGTH
        )));
    }

    if !id
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
    {
        return Err(PaysyncError::InvalidInput(
            "user id contains invalid characters (only alphanumeric, underscore, and hyphen allowed)"
                .to_string(),
        ));
    }

    Ok(())
}

/// Validate a provider price id.
pub fn validate_price_id(id: &str) -> Result<()> {
    if id.is_empty() {
        return Err(PaysyncError::InvalidInput(
            "price id cannot be empty".to_string(),
        ));
    }

    if id.len() > MAX_PRICE_ID_LENGTH {
        return Err(PaysyncError::InvalidInput(format!(
            "price id exceeds maximum length of {}",
            MAX_PRICE_ID_LENGTH
        )));
    }

    if !id
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
    {
        return Err(PaysyncError::InvalidInput(
            "price id contains invalid characters".to_string(),
        ));
    }

    Ok(())
}

/// Validate an email address well enough to send to the provider.
pub fn validate_email(email: &str) -> Result<()> {
    let trimmed = email.trim();
    if trimmed.is_empty() {
        return Err(PaysyncError::InvalidInput(
            "email cannot be empty".to_string(),
        ));
    }
    if !trimmed.contains('@') {
        return Err(PaysyncError::InvalidInput(
            "email is not a valid address".to_string(),
        ));
    }
    Ok(())
}

/// Describe a provider id by its documented prefix, for log messages only.
///
/// Never used for control flow: the provider issues opaque identifiers and
/// the prefix is a human-readability convention.
#[must_use]
pub fn id_kind(id: &str) -> &'static str {
    if id.starts_with("cus_") {
        "customer"
    } else if id.starts_with("pm_") {
        "payment method"
    } else if id.starts_with("sub_") {
        "subscription"
    } else if id.starts_with("price_") {
        "price"
    } else {
        "identifier"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validate_user_id_accepts_uuid() {
        assert!(validate_user_id("550e8400-e29b-41d4-a716-446655440000").is_ok());
        assert!(validate_user_id("user_123").is_ok());
    }

    #[test]
    fn test_validate_user_id_rejects_bad_input() {
        assert!(validate_user_id("").is_err());
        assert!(validate_user_id("user<script>").is_err());
        assert!(validate_user_id(&"x".repeat(65)).is_err());
    }

    #[test]
    fn test_validate_price_id() {
        assert!(validate_price_id("price_1NxyzABC").is_ok());
        assert!(validate_price_id("").is_err());
        assert!(validate_price_id("price id with spaces").is_err());
    }

    #[test]
    fn test_validate_email() {
        assert!(validate_email("a@example.com").is_ok());
        assert!(validate_email("  ").is_err());
        assert!(validate_email("not-an-email").is_err());
    }

    #[test]
    fn test_id_kind_is_descriptive_only() {
        assert_eq!(id_kind("cus_abc"), "customer");
        assert_eq!(id_kind("pm_abc"), "payment method");
        assert_eq!(id_kind("sub_abc"), "subscription");
        assert_eq!(id_kind("price_abc"), "price");
        assert_eq!(id_kind("something_else"), "identifier");
    }
}
