//! Subscription reconciliation and local mirroring.
//!
//! Creates or updates the user's provider subscription and upserts the
//! local mirror row from the provider's response. The mirror is written
//! from what the provider returned, never from what was requested, so the
//! local row can't drift ahead of reality.

use crate::client::{CreateSubscriptionRequest, SubscriptionClient};
use crate::error::{PaysyncError, Result};
use crate::storage::{ReconcileStore, StoredSubscription};
use crate::validation::{validate_price_id, validate_user_id};

/// Reconciles provider subscriptions with the local mirror.
#[derive(Clone)]
pub struct SubscriptionReconciler<S, C> {
    store: S,
    client: C,
}

impl<S: ReconcileStore, C: SubscriptionClient> SubscriptionReconciler<S, C> {
    /// Create a reconciler over a store and a provider client.
    pub fn new(store: S, client: C) -> Self {
        Self { store, client }
    }

    /// Move the user onto the given price, creating a subscription if none
    /// exists, and mirror the result locally.
    ///
    /// Hard precondition: `customer_id` must equal the stored mapping for
    /// the user. A mismatch aborts with [`PaysyncError::IdentityConflict`]
    /// before any provider call, so a subscription can never be created on
    /// the wrong customer.
    pub async fn change_plan(
        &self,
        user_id: &str,
        customer_id: &str,
        price_id: &str,
        default_payment_method: Option<&str>,
    ) -> Result<StoredSubscription> {
        validate_user_id(user_id)?;
        validate_price_id(price_id)?;

        self.assert_customer_mapped(user_id, customer_id).await?;

        let existing = self.store.get_subscription(user_id).await?;

        let data = match existing {
            Some(stored) if stored.status.is_active() => {
                if stored.price_id == price_id {
                    tracing::debug!(
                        target: "paysync::subscription",
                        user_id = %user_id,
                        price_id = %price_id,
                        "already on requested price, refreshing mirror"
                    );
                    self.client
                        .get_subscription(&stored.provider_subscription_id)
                        .await?
                } else {
                    self.client
                        .update_subscription_price(&stored.provider_subscription_id, price_id)
                        .await?
                }
            }
            _ => {
                self.client
                    .create_subscription(CreateSubscriptionRequest {
                        customer_id: customer_id.to_string(),
                        price_id: price_id.to_string(),
                        user_id: user_id.to_string(),
                        default_payment_method: default_payment_method.map(String::from),
                    })
                    .await?
            }
        };

        let mirrored = StoredSubscription::from_provider(&data);
        // A schema mismatch here is fatal and propagates untouched.
        self.store.save_subscription(user_id, &mirrored).await?;

        tracing::info!(
            target: "paysync::subscription",
            user_id = %user_id,
            subscription_id = %mirrored.provider_subscription_id,
            price_id = %mirrored.price_id,
            status = %mirrored.status.as_str(),
            "subscription mirrored"
        );

        Ok(mirrored)
    }

    /// Re-fetch the user's subscription from the provider and re-mirror it.
    ///
    /// Used after a suspected drift (webhook gap, timed-out mutation) to
    /// bring the local row back in line with provider state.
    pub async fn refresh(&self, user_id: &str) -> Result<Option<StoredSubscription>> {
        validate_user_id(user_id)?;

        let Some(stored) = self.store.get_subscription(user_id).await? else {
            return Ok(None);
        };

        let data = self
            .client
            .get_subscription(&stored.provider_subscription_id)
            .await?;
        let mirrored = StoredSubscription::from_provider(&data);
        self.store.save_subscription(user_id, &mirrored).await?;

        Ok(Some(mirrored))
    }

    async fn assert_customer_mapped(&self, user_id: &str, customer_id: &str) -> Result<()> {
        match self.store.get_customer_id(user_id).await? {
            Some(mapped) if mapped == customer_id => Ok(()),
            Some(mapped) => Err(PaysyncError::IdentityConflict {
                user_id: user_id.to_string(),
                detail: format!(
                    "customer '{}' does not match stored mapping '{}'",
                    customer_id, mapped
                ),
            }),
            None => Err(PaysyncError::IdentityConflict {
                user_id: user_id.to_string(),
                detail: "no customer mapping exists; resolve identity first".to_string(),
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::test::MockProviderClient;
    use crate::storage::test::InMemoryStore;
    use crate::storage::SubscriptionStatus;

    fn reconciler() -> (
        InMemoryStore,
        MockProviderClient,
        SubscriptionReconciler<InMemoryStore, MockProviderClient>,
    ) {
        let store = InMemoryStore::new();
        let client = MockProviderClient::new();
        let reconciler = SubscriptionReconciler::new(store.clone(), client.clone());
        (store, client, reconciler)
    }

    #[tokio::test]
    async fn test_creates_subscription_and_mirrors_it() {
        let (store, client, reconciler) = reconciler();
        store.seed_mapping("u1", "cus_A");

        let mirrored = reconciler
            .change_plan("u1", "cus_A", "price_basic", None)
            .await
            .unwrap();

        assert_eq!(client.create_subscription_calls(), 1);
        assert_eq!(mirrored.provider_customer_id, "cus_A");
        assert_eq!(mirrored.price_id, "price_basic");
        assert_eq!(mirrored.status, SubscriptionStatus::Active);
        assert_eq!(
            store.get_subscription("u1").await.unwrap(),
            Some(mirrored)
        );
    }

    #[tokio::test]
    async fn test_updates_existing_subscription_price() {
        let (store, client, reconciler) = reconciler();
        store.seed_mapping("u1", "cus_A");

        reconciler
            .change_plan("u1", "cus_A", "price_basic", None)
            .await
            .unwrap();
        let upgraded = reconciler
            .change_plan("u1", "cus_A", "price_pro", None)
            .await
            .unwrap();

        assert_eq!(client.create_subscription_calls(), 1);
        assert_eq!(client.update_subscription_calls(), 1);
        assert_eq!(upgraded.price_id, "price_pro");
        assert_eq!(
            store.get_subscription("u1").await.unwrap().unwrap().price_id,
            "price_pro"
        );
    }

    #[tokio::test]
    async fn test_same_price_issues_no_mutation() {
        let (store, client, reconciler) = reconciler();
        store.seed_mapping("u1", "cus_A");

        reconciler
            .change_plan("u1", "cus_A", "price_basic", None)
            .await
            .unwrap();
        let baseline = client.mutation_calls();

        reconciler
            .change_plan("u1", "cus_A", "price_basic", None)
            .await
            .unwrap();
        assert_eq!(client.mutation_calls(), baseline);
    }

    #[tokio::test]
    async fn test_mapping_mismatch_aborts_before_provider_calls() {
        let (store, client, reconciler) = reconciler();
        store.seed_mapping("u1", "cus_A");

        let err = reconciler
            .change_plan("u1", "cus_WRONG", "price_basic", None)
            .await
            .unwrap_err();
        assert!(matches!(err, PaysyncError::IdentityConflict { .. }));
        assert_eq!(client.mutation_calls(), 0);
    }

    #[tokio::test]
    async fn test_missing_mapping_aborts() {
        let (_store, client, reconciler) = reconciler();

        let err = reconciler
            .change_plan("u1", "cus_A", "price_basic", None)
            .await
            .unwrap_err();
        assert!(matches!(err, PaysyncError::IdentityConflict { .. }));
        assert_eq!(client.mutation_calls(), 0);
    }

    #[tokio::test]
    async fn test_schema_mismatch_propagates_fatally() {
        let (store, _client, reconciler) = reconciler();
        store.seed_mapping("u1", "cus_A");
        store.inject_schema_fault("column \"cancel_at_period_end\" does not exist");

        let err = reconciler
            .change_plan("u1", "cus_A", "price_basic", None)
            .await
            .unwrap_err();
        assert!(err.is_schema_mismatch());
        assert!(!err.is_retryable());
    }

    #[tokio::test]
    async fn test_canceled_subscription_gets_replaced() {
        let (store, client, reconciler) = reconciler();
        store.seed_mapping("u1", "cus_A");
        store
            .save_subscription(
                "u1",
                &StoredSubscription {
                    provider_subscription_id: "sub_old".to_string(),
                    provider_customer_id: "cus_A".to_string(),
                    price_id: "price_basic".to_string(),
                    status: SubscriptionStatus::Canceled,
                    current_period_start: 0,
                    current_period_end: 0,
                    cancel_at_period_end: false,
                    updated_at: 0,
                },
            )
            .await
            .unwrap();

        let mirrored = reconciler
            .change_plan("u1", "cus_A", "price_basic", None)
            .await
            .unwrap();
        assert_eq!(client.create_subscription_calls(), 1);
        assert_ne!(mirrored.provider_subscription_id, "sub_old");
    }

    #[tokio::test]
    async fn test_refresh_remirrors_provider_state() {
        let (store, client, reconciler) = reconciler();
        store.seed_mapping("u1", "cus_A");

        let mirrored = reconciler
            .change_plan("u1", "cus_A", "price_basic", None)
            .await
            .unwrap();

        // Provider-side drift the mirror doesn't know about yet.
        client
            .update_subscription_price(&mirrored.provider_subscription_id, "price_pro")
            .await
            .unwrap();

        let refreshed = reconciler.refresh("u1").await.unwrap().unwrap();
        assert_eq!(refreshed.price_id, "price_pro");
        assert_eq!(
            store.get_subscription("u1").await.unwrap().unwrap().price_id,
            "price_pro"
        );
    }

    #[tokio::test]
    async fn test_refresh_without_mirror_is_none() {
        let (_store, _client, reconciler) = reconciler();
        assert_eq!(reconciler.refresh("u1").await.unwrap(), None);
    }
}
