//! Error types for reconciliation operations.
//!
//! Each failure kind that callers must handle differently gets its own
//! variant: identity conflicts and ownership conflicts need manual review or
//! user messaging, transient provider failures are retryable, and schema
//! mismatches are deployment defects that must never be retried.

/// The main error type for reconciliation operations.
#[derive(Debug, thiserror::Error)]
pub enum PaysyncError {
    /// The user could not be resolved to a single provider customer id, or
    /// the supplied customer id does not match the stored mapping.
    ///
    /// Not auto-resolved; surfaced for manual review.
    #[error("identity conflict for user '{user_id}': {detail}")]
    IdentityConflict { user_id: String, detail: String },

    /// The payment method is attached to another customer that is actively
    /// using it, so it is unsafe to reassign.
    #[error(
        "payment method '{payment_method_id}' is in active use by customer '{owner}' and cannot be reassigned"
    )]
    PaymentMethodOwnershipConflict {
        payment_method_id: String,
        owner: String,
    },

    /// Network, rate-limit, or 5xx-class failure from the billing provider.
    ///
    /// Retryable by the caller with backoff. Timeouts land here too: the
    /// remote side effect may still have occurred, so callers must re-resolve
    /// identity rather than assume nothing happened.
    #[error("transient provider failure during '{operation}': {message}")]
    ProviderTransient {
        operation: String,
        message: String,
        http_status: Option<u16>,
    },

    /// The billing provider rejected the request (4xx-class, non-transient).
    #[error("provider rejected '{operation}': {message}")]
    Provider {
        operation: String,
        message: String,
        code: Option<String>,
        http_status: Option<u16>,
    },

    /// The local datastore rejected a write due to a column or constraint
    /// mismatch. Fatal, never retried: indicates a deployment/migration
    /// defect and must reach operator-visible logs immediately.
    #[error("schema mismatch writing to '{table}': {message}")]
    SchemaMismatch { table: String, message: String },

    /// A record the operation depends on does not exist.
    #[error("not found: {0}")]
    NotFound(String),

    /// An input failed validation before any remote call was made.
    #[error("invalid input: {0}")]
    InvalidInput(String),

    /// Datastore failure that is not a schema mismatch.
    #[error("storage error: {0}")]
    Storage(String),

    /// An unexpected internal error.
    #[error("internal error: {0}")]
    Internal(String),

    #[error(transparent)]
    Anyhow(#[from] anyhow::Error),
}

impl PaysyncError {
    /// Check if the caller may retry this operation.
    ///
    /// Only transient provider failures (and rate limits / 5xx responses)
    /// qualify. Schema mismatches and conflicts are never retryable.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::ProviderTransient { .. } => true,
            Self::Provider { http_status, .. } => {
                matches!(http_status, Some(429) | Some(500..=599))
            }
            _ => false,
        }
    }

    /// Check if this is a client-caused error (bad input, conflicts).
    #[must_use]
    pub fn is_client_error(&self) -> bool {
        match self {
            Self::IdentityConflict { .. }
            | Self::PaymentMethodOwnershipConflict { .. }
            | Self::NotFound(_)
            | Self::InvalidInput(_) => true,
            Self::Provider { http_status, .. } => matches!(http_status, Some(400..=499)),
            _ => false,
        }
    }

    /// Check if this error indicates a local schema/migration defect.
    #[must_use]
    pub fn is_schema_mismatch(&self) -> bool {
        matches!(self, Self::SchemaMismatch { .. })
    }
}

/// Result type alias for reconciliation operations.
pub type Result<T> = std::result::Result<T, PaysyncError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = PaysyncError::IdentityConflict {
            user_id: "u1".to_string(),
            detail: "3 provider customers match email".to_string(),
        };
        assert_eq!(
            err.to_string(),
            "identity conflict for user 'u1': 3 provider customers match email"
        );

        let err = PaysyncError::SchemaMismatch {
            table: "subscription_mirror".to_string(),
            message: "column \"price_id\" does not exist".to_string(),
        };
        assert!(err.to_string().contains("subscription_mirror"));
    }

    #[test]
    fn test_retryable_classification() {
        let err = PaysyncError::ProviderTransient {
            operation: "create_customer".to_string(),
            message: "connection reset".to_string(),
            http_status: None,
        };
        assert!(err.is_retryable());
        assert!(!err.is_client_error());

        let err = PaysyncError::Provider {
            operation: "attach_payment_method".to_string(),
            message: "card declined".to_string(),
            code: Some("card_declined".to_string()),
            http_status: Some(402),
        };
        assert!(!err.is_retryable());
        assert!(err.is_client_error());

        let err = PaysyncError::Provider {
            operation: "list_customers".to_string(),
            message: "rate limited".to_string(),
            code: None,
            http_status: Some(429),
        };
        assert!(err.is_retryable());
    }

    #[test]
    fn test_schema_mismatch_never_retryable() {
        let err = PaysyncError::SchemaMismatch {
            table: "customer_mappings".to_string(),
            message: "constraint violation".to_string(),
        };
        assert!(err.is_schema_mismatch());
        assert!(!err.is_retryable());
        assert!(!err.is_client_error());
    }

    #[test]
    fn test_conflicts_are_client_errors() {
        let err = PaysyncError::PaymentMethodOwnershipConflict {
            payment_method_id: "pm_1".to_string(),
            owner: "cus_B".to_string(),
        };
        assert!(err.is_client_error());
        assert!(!err.is_retryable());
    }
}
