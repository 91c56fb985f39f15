//! Storage abstraction for the customer mapping and subscription mirror.
//!
//! Two tables back the reconciliation flow: `customer_mappings` (local user
//! id to provider customer id, written once per user) and
//! `subscription_mirror` (a local copy of each user's provider subscription,
//! refreshed after every mutation). Implement [`ReconcileStore`] to plug in
//! a database; [`test::InMemoryStore`] covers tests.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::Result;

/// Subscription status mirrored from the provider.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SubscriptionStatus {
    Incomplete,
    Active,
    Trialing,
    PastDue,
    Canceled,
}

impl SubscriptionStatus {
    /// Map a provider status string onto the mirrored set.
    ///
    /// Unknown statuses collapse to `Canceled` so an unrecognized state never
    /// grants access.
    #[must_use]
    pub fn from_provider(status: &str) -> Self {
        match status {
            "incomplete" | "incomplete_expired" => Self::Incomplete,
            "active" => Self::Active,
            "trialing" => Self::Trialing,
            "past_due" | "unpaid" => Self::PastDue,
            _ => Self::Canceled,
        }
    }

    /// Status as stored in the mirror.
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Incomplete => "incomplete",
            Self::Active => "active",
            Self::Trialing => "trialing",
            Self::PastDue => "past_due",
            Self::Canceled => "canceled",
        }
    }

    /// Check whether the subscription grants access.
    #[must_use]
    pub fn is_active(&self) -> bool {
        matches!(self, Self::Active | Self::Trialing)
    }
}

/// A row in the local subscription mirror.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoredSubscription {
    /// Provider subscription id.
    pub provider_subscription_id: String,
    /// Provider customer id the subscription belongs to.
    pub provider_customer_id: String,
    /// Price id of the subscription item.
    pub price_id: String,
    /// Mirrored status.
    pub status: SubscriptionStatus,
    /// Current billing period start (Unix timestamp).
    pub current_period_start: u64,
    /// Current billing period end (Unix timestamp).
    pub current_period_end: u64,
    /// Whether the subscription cancels at period end.
    pub cancel_at_period_end: bool,
    /// When this row was last written (Unix timestamp).
    pub updated_at: u64,
}

impl StoredSubscription {
    /// Build a mirror row from provider subscription data.
    #[must_use]
    pub fn from_provider(data: &crate::client::ProviderSubscriptionData) -> Self {
        Self {
            provider_subscription_id: data.id.clone(),
            provider_customer_id: data.customer_id.clone(),
            price_id: data.price_id.clone(),
            status: SubscriptionStatus::from_provider(&data.status),
            current_period_start: data.current_period_start,
            current_period_end: data.current_period_end,
            cancel_at_period_end: data.cancel_at_period_end,
            updated_at: now_unix(),
        }
    }
}

fn now_unix() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

/// Storage backend for the customer mapping and subscription mirror.
#[async_trait]
pub trait ReconcileStore: Send + Sync {
    /// Look up the provider customer id mapped to a local user.
    async fn get_customer_id(&self, user_id: &str) -> Result<Option<String>>;

    /// Persist a user-to-customer mapping, first writer wins.
    ///
    /// Must be an insert that does nothing on conflict, and must return the
    /// mapping that is actually persisted afterward. Under a concurrent
    /// first call both writers observe the same winner.
    async fn link_customer(&self, user_id: &str, customer_id: &str) -> Result<String>;

    /// Look up the mirrored subscription for a local user.
    async fn get_subscription(&self, user_id: &str) -> Result<Option<StoredSubscription>>;

    /// Look up a mirrored subscription by its provider id.
    async fn get_subscription_by_provider_id(
        &self,
        provider_subscription_id: &str,
    ) -> Result<Option<StoredSubscription>>;

    /// Upsert the mirrored subscription for a local user.
    ///
    /// A column or constraint failure must surface as
    /// [`crate::PaysyncError::SchemaMismatch`] so it is never retried.
    async fn save_subscription(
        &self,
        user_id: &str,
        subscription: &StoredSubscription,
    ) -> Result<()>;
}

/// In-memory store for testing.
#[cfg(any(test, feature = "test-support"))]
pub mod test {
    use super::*;
    use crate::error::PaysyncError;
    use std::collections::HashMap;
    use std::sync::{Arc, Mutex, RwLock};

    /// In-memory [`ReconcileStore`] with first-writer-wins mapping semantics.
    #[derive(Default, Clone)]
    pub struct InMemoryStore {
        inner: Arc<Inner>,
    }

    #[derive(Default)]
    struct Inner {
        mappings: RwLock<HashMap<String, String>>,
        subscriptions: RwLock<HashMap<String, StoredSubscription>>,
        schema_fault: Mutex<Option<String>>,
    }

    impl InMemoryStore {
        /// Create an empty store.
        #[must_use]
        pub fn new() -> Self {
            Self::default()
        }

        /// Seed a user-to-customer mapping directly.
        pub fn seed_mapping(&self, user_id: &str, customer_id: &str) {
            self.inner
                .mappings
                .write()
                .unwrap()
                .insert(user_id.to_string(), customer_id.to_string());
        }

        /// Make the next `save_subscription` fail with a schema mismatch.
        pub fn inject_schema_fault(&self, message: &str) {
            *self.inner.schema_fault.lock().unwrap() = Some(message.to_string());
        }

        /// Number of mapping rows currently stored.
        pub fn mapping_count(&self) -> usize {
            self.inner.mappings.read().unwrap().len()
        }
    }

    #[async_trait]
    impl ReconcileStore for InMemoryStore {
        async fn get_customer_id(&self, user_id: &str) -> Result<Option<String>> {
            Ok(self.inner.mappings.read().unwrap().get(user_id).cloned())
        }

        async fn link_customer(&self, user_id: &str, customer_id: &str) -> Result<String> {
            let mut mappings = self.inner.mappings.write().unwrap();
            let winner = mappings
                .entry(user_id.to_string())
                .or_insert_with(|| customer_id.to_string());
            Ok(winner.clone())
        }

        async fn get_subscription(&self, user_id: &str) -> Result<Option<StoredSubscription>> {
            Ok(self
                .inner
                .subscriptions
                .read()
                .unwrap()
                .get(user_id)
                .cloned())
        }

        async fn get_subscription_by_provider_id(
            &self,
            provider_subscription_id: &str,
        ) -> Result<Option<StoredSubscription>> {
            Ok(self
                .inner
                .subscriptions
                .read()
                .unwrap()
                .values()
                .find(|s| s.provider_subscription_id == provider_subscription_id)
                .cloned())
        }

        async fn save_subscription(
            &self,
            user_id: &str,
            subscription: &StoredSubscription,
        ) -> Result<()> {
            if let Some(message) = self.inner.schema_fault.lock().unwrap().take() {
                return Err(PaysyncError::SchemaMismatch {
                    table: "subscription_mirror".to_string(),
                    message,
                });
            }

            self.inner
                .subscriptions
                .write()
                .unwrap()
                .insert(user_id.to_string(), subscription.clone());
            Ok(())
        }
    }
}
