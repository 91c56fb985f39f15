//! Top-level reconciliation facade.
//!
//! Composes identity resolution, payment method repair, and subscription
//! reconciliation into the two entry points applications call: make a user
//! billing-ready before charging anything, and change their plan.

use crate::client::ProviderClient;
use crate::config::ReconcilerConfig;
use crate::error::Result;
use crate::identity::IdentityResolver;
use crate::payment::PaymentMethodRepair;
use crate::storage::{ReconcileStore, StoredSubscription};
use crate::subscription::SubscriptionReconciler;

/// A user's resolved billing identity.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BillingIdentity {
    /// Provider customer id mapped to the user.
    pub customer_id: String,
    /// Payment method confirmed attached to the customer, if one was given.
    pub payment_method_id: Option<String>,
}

/// Orchestrates the full reconciliation flow.
///
/// Steps run strictly in order: identity first, then payment method repair
/// against the resolved customer, then subscription work. Each later step
/// only ever sees state the earlier steps have settled.
#[derive(Clone)]
pub struct Reconciler<S, C> {
    identity: IdentityResolver<S, C>,
    payment: PaymentMethodRepair<C>,
    subscription: SubscriptionReconciler<S, C>,
}

impl<S, C> Reconciler<S, C>
where
    S: ReconcileStore + Clone,
    C: ProviderClient + Clone,
{
    /// Create a reconciler over a store and a provider client.
    pub fn new(store: S, client: C, config: &ReconcilerConfig) -> Self {
        Self {
            identity: IdentityResolver::new(store.clone(), client.clone()),
            payment: PaymentMethodRepair::new(client.clone(), config.set_default_on_attach),
            subscription: SubscriptionReconciler::new(store, client),
        }
    }

    /// Resolve the user's customer and, if given, repair the payment
    /// method's attachment to it.
    ///
    /// Safe to call before every billing operation: when everything is
    /// already consistent this issues no provider mutations.
    pub async fn ensure_billing_ready(
        &self,
        user_id: &str,
        email: &str,
        payment_method_id: Option<&str>,
    ) -> Result<BillingIdentity> {
        let customer_id = self.identity.resolve(user_id, email).await?;

        if let Some(pm) = payment_method_id {
            self.payment.ensure_attached(pm, &customer_id).await?;
        }

        Ok(BillingIdentity {
            customer_id,
            payment_method_id: payment_method_id.map(String::from),
        })
    }

    /// Make the user billing-ready, then move them onto the given price.
    pub async fn change_plan(
        &self,
        user_id: &str,
        email: &str,
        payment_method_id: Option<&str>,
        price_id: &str,
    ) -> Result<StoredSubscription> {
        let identity = self
            .ensure_billing_ready(user_id, email, payment_method_id)
            .await?;

        self.subscription
            .change_plan(
                user_id,
                &identity.customer_id,
                price_id,
                identity.payment_method_id.as_deref(),
            )
            .await
    }

    /// Access the identity resolver directly.
    pub fn identity(&self) -> &IdentityResolver<S, C> {
        &self.identity
    }

    /// Access the subscription reconciler directly.
    pub fn subscriptions(&self) -> &SubscriptionReconciler<S, C> {
        &self.subscription
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::test::MockProviderClient;
    use crate::client::PaymentMethodClient;
    use crate::error::PaysyncError;
    use crate::storage::test::InMemoryStore;
    use crate::storage::SubscriptionStatus;

    fn config() -> ReconcilerConfig {
        ReconcilerConfig::new("sk_test_12345678901234567890").unwrap()
    }

    fn reconciler() -> (
        InMemoryStore,
        MockProviderClient,
        Reconciler<InMemoryStore, MockProviderClient>,
    ) {
        let store = InMemoryStore::new();
        let client = MockProviderClient::new();
        let reconciler = Reconciler::new(store.clone(), client.clone(), &config());
        (store, client, reconciler)
    }

    #[tokio::test]
    async fn test_full_flow_from_nothing() {
        let (store, client, reconciler) = reconciler();
        client.seed_payment_method("pm_1", None);

        let sub = reconciler
            .change_plan("u1", "a@example.com", Some("pm_1"), "price_pro")
            .await
            .unwrap();

        assert_eq!(sub.price_id, "price_pro");
        assert_eq!(sub.status, SubscriptionStatus::Active);

        let customer_id = store.get_customer_id("u1").await.unwrap().unwrap();
        assert_eq!(sub.provider_customer_id, customer_id);
        let method = client.retrieve_payment_method("pm_1").await.unwrap();
        assert_eq!(method.customer.as_deref(), Some(customer_id.as_str()));
        // Default promotion follows the attach.
        assert_eq!(client.set_default_calls(), 1);
    }

    #[tokio::test]
    async fn test_consistent_state_issues_no_mutations() {
        let (_store, client, reconciler) = reconciler();
        client.seed_payment_method("pm_1", None);

        reconciler
            .ensure_billing_ready("u1", "a@example.com", Some("pm_1"))
            .await
            .unwrap();
        let baseline = client.mutation_calls();

        // Second call finds everything already consistent.
        let identity = reconciler
            .ensure_billing_ready("u1", "a@example.com", Some("pm_1"))
            .await
            .unwrap();
        assert_eq!(client.mutation_calls(), baseline);
        assert_eq!(identity.payment_method_id.as_deref(), Some("pm_1"));
    }

    #[tokio::test]
    async fn test_repairs_method_attached_to_stale_customer() {
        let (store, client, reconciler) = reconciler();
        store.seed_mapping("u1", "cus_right");
        client.seed_customer("cus_right", "a@example.com", Some("u1"));
        // Method landed on a stale customer with no active subscriptions.
        client.seed_customer("cus_stale", "old@example.com", None);
        client.seed_payment_method("pm_1", Some("cus_stale"));

        let identity = reconciler
            .ensure_billing_ready("u1", "a@example.com", Some("pm_1"))
            .await
            .unwrap();
        assert_eq!(identity.customer_id, "cus_right");
        assert_eq!(client.detach_calls(), 1);
        assert_eq!(client.attach_calls(), 1);

        let method = client.retrieve_payment_method("pm_1").await.unwrap();
        assert_eq!(method.customer.as_deref(), Some("cus_right"));
    }

    #[tokio::test]
    async fn test_ownership_conflict_stops_before_subscription_work() {
        let (store, client, reconciler) = reconciler();
        store.seed_mapping("u1", "cus_A");
        client.seed_customer("cus_A", "a@example.com", Some("u1"));
        client.seed_payment_method("pm_1", Some("cus_B"));
        client.seed_subscription("sub_live", "cus_B", "price_pro", "active", Some("pm_1"));

        let err = reconciler
            .change_plan("u1", "a@example.com", Some("pm_1"), "price_pro")
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            PaysyncError::PaymentMethodOwnershipConflict { .. }
        ));
        assert_eq!(client.create_subscription_calls(), 0);
        assert_eq!(store.get_subscription("u1").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_change_plan_without_payment_method() {
        let (_store, client, reconciler) = reconciler();

        let sub = reconciler
            .change_plan("u1", "a@example.com", None, "price_basic")
            .await
            .unwrap();
        assert_eq!(sub.price_id, "price_basic");
        assert_eq!(client.attach_calls(), 0);
        assert_eq!(client.set_default_calls(), 0);
    }

    #[tokio::test]
    async fn test_concurrent_onboarding_converges_on_one_identity() {
        let (store, _client, reconciler) = reconciler();
        let other = reconciler.clone();

        let (a, b) = tokio::join!(
            reconciler.ensure_billing_ready("u1", "a@example.com", None),
            other.ensure_billing_ready("u1", "a@example.com", None),
        );

        assert_eq!(a.unwrap().customer_id, b.unwrap().customer_id);
        assert_eq!(store.mapping_count(), 1);
    }
}
