//! Payment method attachment repair.
//!
//! Before a payment method is used for a customer it must be attached to
//! that customer on the provider side. Client-supplied methods can arrive
//! unattached or attached to the wrong customer (stale sessions, shared
//! browser profiles, reused tokens); this module classifies the attachment
//! and repairs it when safe to do so.

use crate::client::{CustomerClient, PaymentMethodClient, ProviderPaymentMethod, SubscriptionClient};
use crate::error::{PaysyncError, Result};

/// Where a payment method is attached, relative to a target customer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Attachment {
    /// Not attached to any customer.
    Unattached,
    /// Already attached to the target customer.
    AttachedCorrect,
    /// Attached to some other customer.
    AttachedWrong {
        /// Customer currently holding the method.
        current: String,
    },
}

impl Attachment {
    /// Classify a payment method against a target customer.
    #[must_use]
    pub fn of(method: &ProviderPaymentMethod, target_customer: &str) -> Self {
        match method.customer.as_deref() {
            None => Self::Unattached,
            Some(current) if current == target_customer => Self::AttachedCorrect,
            Some(current) => Self::AttachedWrong {
                current: current.to_string(),
            },
        }
    }
}

/// What the repair did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RepairOutcome {
    /// Already attached correctly; no provider mutation was issued.
    AlreadyAttached,
    /// Attached a previously unattached method.
    Attached,
    /// Detached from another customer and attached to the target.
    Reattached {
        /// Customer the method was detached from.
        previous: String,
    },
}

/// Repairs payment method attachment against the billing provider.
#[derive(Clone)]
pub struct PaymentMethodRepair<C> {
    client: C,
    set_default_on_attach: bool,
}

impl<C> PaymentMethodRepair<C>
where
    C: CustomerClient + PaymentMethodClient + SubscriptionClient,
{
    /// Create a repairer over a provider client.
    pub fn new(client: C, set_default_on_attach: bool) -> Self {
        Self {
            client,
            set_default_on_attach,
        }
    }

    /// Ensure the payment method is attached to the target customer.
    ///
    /// Correct attachment is a pure no-op: zero provider mutations. A
    /// wrongly attached method is reassigned only after confirming the
    /// current holder is not actively using it; otherwise
    /// [`PaysyncError::PaymentMethodOwnershipConflict`] is returned and
    /// nothing is changed.
    pub async fn ensure_attached(
        &self,
        payment_method_id: &str,
        customer_id: &str,
    ) -> Result<RepairOutcome> {
        let method = self.client.retrieve_payment_method(payment_method_id).await?;

        let outcome = match Attachment::of(&method, customer_id) {
            Attachment::AttachedCorrect => return Ok(RepairOutcome::AlreadyAttached),
            Attachment::Unattached => {
                self.client
                    .attach_payment_method(payment_method_id, customer_id)
                    .await?;
                tracing::info!(
                    target: "paysync::payment",
                    payment_method_id = %payment_method_id,
                    customer_id = %customer_id,
                    "attached payment method"
                );
                RepairOutcome::Attached
            }
            Attachment::AttachedWrong { current } => {
                self.check_not_in_active_use(payment_method_id, &current)
                    .await?;

                // Detach failure is tolerated: the subsequent attach moves
                // the method regardless, and the provider may have already
                // released it.
                if let Err(err) = self.client.detach_payment_method(payment_method_id).await {
                    tracing::warn!(
                        target: "paysync::payment",
                        payment_method_id = %payment_method_id,
                        current = %current,
                        error = %err,
                        "detach before reattach failed, continuing"
                    );
                }

                self.client
                    .attach_payment_method(payment_method_id, customer_id)
                    .await?;
                tracing::info!(
                    target: "paysync::payment",
                    payment_method_id = %payment_method_id,
                    previous = %current,
                    customer_id = %customer_id,
                    "reattached payment method"
                );
                RepairOutcome::Reattached { previous: current }
            }
        };

        if self.set_default_on_attach {
            self.client
                .set_default_payment_method(customer_id, payment_method_id)
                .await?;
        }

        Ok(outcome)
    }

    /// Refuse to steal a payment method its current holder depends on.
    ///
    /// In use means: an active or trialing subscription of the holder names
    /// the method as its default, or the method is the holder's customer
    /// default while any of their subscriptions is active.
    async fn check_not_in_active_use(&self, payment_method_id: &str, owner: &str) -> Result<()> {
        let subscriptions = self.client.list_subscriptions(owner).await?;

        let named_by_active_sub = subscriptions
            .iter()
            .filter(|s| s.is_active())
            .any(|s| s.default_payment_method.as_deref() == Some(payment_method_id));

        let customer_default_in_use = if named_by_active_sub {
            false
        } else {
            let default = self.client.get_default_payment_method(owner).await?;
            default.as_deref() == Some(payment_method_id)
                && subscriptions.iter().any(|s| s.is_active())
        };

        if named_by_active_sub || customer_default_in_use {
            return Err(PaysyncError::PaymentMethodOwnershipConflict {
                payment_method_id: payment_method_id.to_string(),
                owner: owner.to_string(),
            });
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::test::MockProviderClient;

    fn repair(client: &MockProviderClient) -> PaymentMethodRepair<MockProviderClient> {
        PaymentMethodRepair::new(client.clone(), false)
    }

    #[test]
    fn test_attachment_classification() {
        let mut method = ProviderPaymentMethod {
            id: "pm_1".to_string(),
            customer: None,
            card_brand: None,
            card_last4: None,
        };
        assert_eq!(Attachment::of(&method, "cus_A"), Attachment::Unattached);

        method.customer = Some("cus_A".to_string());
        assert_eq!(Attachment::of(&method, "cus_A"), Attachment::AttachedCorrect);

        method.customer = Some("cus_B".to_string());
        assert_eq!(
            Attachment::of(&method, "cus_A"),
            Attachment::AttachedWrong {
                current: "cus_B".to_string()
            }
        );
    }

    #[tokio::test]
    async fn test_correct_attachment_is_pure_noop() {
        let client = MockProviderClient::new();
        client.seed_payment_method("pm_1", Some("cus_A"));

        let outcome = repair(&client).ensure_attached("pm_1", "cus_A").await.unwrap();
        assert_eq!(outcome, RepairOutcome::AlreadyAttached);
        assert_eq!(client.mutation_calls(), 0);
    }

    #[tokio::test]
    async fn test_unattached_method_is_attached() {
        let client = MockProviderClient::new();
        client.seed_payment_method("pm_1", None);

        let outcome = repair(&client).ensure_attached("pm_1", "cus_A").await.unwrap();
        assert_eq!(outcome, RepairOutcome::Attached);
        assert_eq!(client.attach_calls(), 1);
        assert_eq!(client.detach_calls(), 0);

        let method = client.retrieve_payment_method("pm_1").await.unwrap();
        assert_eq!(method.customer.as_deref(), Some("cus_A"));
    }

    #[tokio::test]
    async fn test_wrongly_attached_idle_method_is_reassigned() {
        let client = MockProviderClient::new();
        client.seed_payment_method("pm_1", Some("cus_B"));
        // cus_B has a canceled subscription only, so the method is idle.
        client.seed_subscription("sub_old", "cus_B", "price_basic", "canceled", Some("pm_1"));

        let outcome = repair(&client).ensure_attached("pm_1", "cus_A").await.unwrap();
        assert_eq!(
            outcome,
            RepairOutcome::Reattached {
                previous: "cus_B".to_string()
            }
        );
        assert_eq!(client.detach_calls(), 1);
        assert_eq!(client.attach_calls(), 1);

        let method = client.retrieve_payment_method("pm_1").await.unwrap();
        assert_eq!(method.customer.as_deref(), Some("cus_A"));
    }

    #[tokio::test]
    async fn test_method_in_active_use_is_never_stolen() {
        let client = MockProviderClient::new();
        client.seed_payment_method("pm_1", Some("cus_B"));
        client.seed_subscription("sub_live", "cus_B", "price_pro", "active", Some("pm_1"));

        let err = repair(&client)
            .ensure_attached("pm_1", "cus_A")
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            PaysyncError::PaymentMethodOwnershipConflict { .. }
        ));
        // No mutation was issued; the method still belongs to cus_B.
        assert_eq!(client.mutation_calls(), 0);
        let method = client.retrieve_payment_method("pm_1").await.unwrap();
        assert_eq!(method.customer.as_deref(), Some("cus_B"));
    }

    #[tokio::test]
    async fn test_customer_default_with_active_sub_blocks_reassignment() {
        let client = MockProviderClient::new();
        client.seed_payment_method("pm_1", Some("cus_B"));
        // The active subscription doesn't name pm_1 directly, but pm_1 is
        // the customer default backing it.
        client.seed_subscription("sub_live", "cus_B", "price_pro", "active", None);
        client
            .set_default_payment_method("cus_B", "pm_1")
            .await
            .unwrap();
        let baseline = client.mutation_calls();

        let err = repair(&client)
            .ensure_attached("pm_1", "cus_A")
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            PaysyncError::PaymentMethodOwnershipConflict { .. }
        ));
        assert_eq!(client.mutation_calls(), baseline);
    }

    #[tokio::test]
    async fn test_trialing_subscription_counts_as_active_use() {
        let client = MockProviderClient::new();
        client.seed_payment_method("pm_1", Some("cus_B"));
        client.seed_subscription("sub_trial", "cus_B", "price_pro", "trialing", Some("pm_1"));

        let result = repair(&client).ensure_attached("pm_1", "cus_A").await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn test_attach_failure_propagates() {
        let client = MockProviderClient::new();
        client.seed_payment_method("pm_1", None);
        client.fail_next_attach();

        let err = repair(&client)
            .ensure_attached("pm_1", "cus_A")
            .await
            .unwrap_err();
        assert!(matches!(err, PaysyncError::Provider { .. }));
    }

    #[tokio::test]
    async fn test_set_default_applied_after_attach_only() {
        let client = MockProviderClient::new();
        client.seed_payment_method("pm_1", None);
        client.seed_payment_method("pm_2", Some("cus_A"));
        let repairer = PaymentMethodRepair::new(client.clone(), true);

        repairer.ensure_attached("pm_1", "cus_A").await.unwrap();
        assert_eq!(client.set_default_calls(), 1);

        // Correct attachment stays a pure no-op even with promotion on.
        repairer.ensure_attached("pm_2", "cus_A").await.unwrap();
        assert_eq!(client.set_default_calls(), 1);
    }
}
