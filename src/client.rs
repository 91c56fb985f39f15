//! Provider client traits and data types.
//!
//! The billing provider is consumed through these traits so that the
//! reconciliation logic can be tested without network calls and so that
//! different client implementations can be swapped in. The production
//! implementation is [`crate::LiveProviderClient`].

use crate::error::Result;

/// A customer as known to the billing provider.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProviderCustomer {
    /// Provider-issued customer id.
    pub id: String,
    /// Email on the customer record.
    pub email: Option<String>,
    /// Correlating local user id, from customer metadata (if set).
    pub user_id: Option<String>,
}

/// A payment method as known to the billing provider.
///
/// The `customer` field is the provider's authoritative view of which
/// customer the method is attached to; the local mirror is never trusted for
/// this.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProviderPaymentMethod {
    /// Provider-issued payment method id.
    pub id: String,
    /// Customer the method is currently attached to, if any.
    pub customer: Option<String>,
    /// Card brand (visa, mastercard, amex, etc.), when available.
    pub card_brand: Option<String>,
    /// Last 4 digits of the card, when available.
    pub card_last4: Option<String>,
}

/// Provider subscription state, as returned by create/update/get calls.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProviderSubscriptionData {
    /// Provider-issued subscription id.
    pub id: String,
    /// Customer the subscription belongs to.
    pub customer_id: String,
    /// Price id of the (single) subscription item.
    pub price_id: String,
    /// Status string as reported by the provider.
    pub status: String,
    /// Default payment method on the subscription, if set.
    pub default_payment_method: Option<String>,
    /// Current billing period start (Unix timestamp).
    pub current_period_start: u64,
    /// Current billing period end (Unix timestamp).
    pub current_period_end: u64,
    /// Whether the subscription will cancel at period end.
    pub cancel_at_period_end: bool,
}

/// Request to create a provider customer.
#[derive(Debug, Clone)]
pub struct CreateCustomerRequest {
    /// Customer email address.
    pub email: String,
    /// Local user id, stored as correlating metadata and used to derive the
    /// idempotency key for the creation call.
    pub user_id: String,
}

/// Request to create a provider subscription.
#[derive(Debug, Clone)]
pub struct CreateSubscriptionRequest {
    /// Customer the subscription is created on.
    pub customer_id: String,
    /// Target price id.
    pub price_id: String,
    /// Local user id, stored as correlating metadata.
    pub user_id: String,
    /// Payment method to set as the subscription default, if any.
    pub default_payment_method: Option<String>,
}

/// Customer operations against the billing provider.
pub trait CustomerClient: Send + Sync {
    /// Create a new customer.
    async fn create_customer(&self, request: CreateCustomerRequest) -> Result<ProviderCustomer>;

    /// Retrieve a customer by id.
    async fn retrieve_customer(&self, customer_id: &str) -> Result<ProviderCustomer>;

    /// List customers matching an email address.
    async fn list_customers_by_email(&self, email: &str) -> Result<Vec<ProviderCustomer>>;

    /// Set the customer's default payment method.
    async fn set_default_payment_method(
        &self,
        customer_id: &str,
        payment_method_id: &str,
    ) -> Result<()>;

    /// Get the customer's default payment method.
    async fn get_default_payment_method(&self, customer_id: &str) -> Result<Option<String>>;
}

/// Payment method operations against the billing provider.
pub trait PaymentMethodClient: Send + Sync {
    /// Retrieve a payment method, including its current attachment.
    async fn retrieve_payment_method(
        &self,
        payment_method_id: &str,
    ) -> Result<ProviderPaymentMethod>;

    /// List payment methods attached to a customer.
    async fn list_payment_methods(
        &self,
        customer_id: &str,
        limit: u8,
    ) -> Result<Vec<ProviderPaymentMethod>>;

    /// Attach a payment method to a customer.
    async fn attach_payment_method(
        &self,
        payment_method_id: &str,
        customer_id: &str,
    ) -> Result<ProviderPaymentMethod>;

    /// Detach a payment method from whatever customer currently holds it.
    async fn detach_payment_method(&self, payment_method_id: &str) -> Result<()>;
}

/// Subscription operations against the billing provider.
pub trait SubscriptionClient: Send + Sync {
    /// Create a subscription on a customer for a price.
    async fn create_subscription(
        &self,
        request: CreateSubscriptionRequest,
    ) -> Result<ProviderSubscriptionData>;

    /// Change the price on an existing subscription.
    async fn update_subscription_price(
        &self,
        subscription_id: &str,
        price_id: &str,
    ) -> Result<ProviderSubscriptionData>;

    /// Get subscription details.
    async fn get_subscription(&self, subscription_id: &str) -> Result<ProviderSubscriptionData>;

    /// List subscriptions belonging to a customer.
    async fn list_subscriptions(&self, customer_id: &str) -> Result<Vec<ProviderSubscriptionData>>;
}

/// Umbrella trait for clients implementing all provider operations.
///
/// Blanket-implemented for any type implementing the three concern traits.
pub trait ProviderClient: CustomerClient + PaymentMethodClient + SubscriptionClient {}

impl<T: CustomerClient + PaymentMethodClient + SubscriptionClient> ProviderClient for T {}

impl ProviderSubscriptionData {
    /// Check if the subscription is in an active state (including trialing).
    #[must_use]
    pub fn is_active(&self) -> bool {
        matches!(self.status.as_str(), "active" | "trialing")
    }
}

/// Mock provider client for testing.
#[cfg(any(test, feature = "test-support"))]
pub mod test {
    use super::*;
    use crate::error::PaysyncError;
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
    use std::sync::{Arc, RwLock};

    /// Mock provider client backed by in-memory state.
    ///
    /// Tracks mutation call counts so tests can assert that no-op repairs
    /// issue zero provider mutations.
    #[derive(Default, Clone)]
    pub struct MockProviderClient {
        inner: Arc<Inner>,
    }

    #[derive(Default)]
    struct Inner {
        id_counter: AtomicU64,
        customers: RwLock<HashMap<String, MockCustomer>>,
        payment_methods: RwLock<HashMap<String, ProviderPaymentMethod>>,
        subscriptions: RwLock<HashMap<String, ProviderSubscriptionData>>,
        defaults: RwLock<HashMap<String, String>>,
        fail_next_attach: AtomicBool,
        calls: CallCounts,
    }

    #[derive(Default)]
    struct CallCounts {
        create_customer: AtomicU64,
        attach: AtomicU64,
        detach: AtomicU64,
        set_default: AtomicU64,
        create_subscription: AtomicU64,
        update_subscription: AtomicU64,
    }

    #[derive(Clone)]
    struct MockCustomer {
        email: String,
        user_id: Option<String>,
    }

    impl MockProviderClient {
        /// Create a new mock client.
        #[must_use]
        pub fn new() -> Self {
            Self::default()
        }

        /// Seed a customer record.
        pub fn seed_customer(&self, id: &str, email: &str, user_id: Option<&str>) {
            self.inner.customers.write().unwrap().insert(
                id.to_string(),
                MockCustomer {
                    email: email.to_string(),
                    user_id: user_id.map(String::from),
                },
            );
        }

        /// Seed a payment method, optionally already attached to a customer.
        pub fn seed_payment_method(&self, id: &str, customer: Option<&str>) {
            self.inner.payment_methods.write().unwrap().insert(
                id.to_string(),
                ProviderPaymentMethod {
                    id: id.to_string(),
                    customer: customer.map(String::from),
                    card_brand: Some("visa".to_string()),
                    card_last4: Some("4242".to_string()),
                },
            );
        }

        /// Seed a subscription record.
        pub fn seed_subscription(
            &self,
            id: &str,
            customer_id: &str,
            price_id: &str,
            status: &str,
            default_payment_method: Option<&str>,
        ) {
            self.inner.subscriptions.write().unwrap().insert(
                id.to_string(),
                ProviderSubscriptionData {
                    id: id.to_string(),
                    customer_id: customer_id.to_string(),
                    price_id: price_id.to_string(),
                    status: status.to_string(),
                    default_payment_method: default_payment_method.map(String::from),
                    current_period_start: 1_700_000_000,
                    current_period_end: 1_702_592_000,
                    cancel_at_period_end: false,
                },
            );
        }

        /// Make the next attach call fail with a card error.
        pub fn fail_next_attach(&self) {
            self.inner.fail_next_attach.store(true, Ordering::SeqCst);
        }

        /// Number of customers created so far.
        pub fn create_customer_calls(&self) -> u64 {
            self.inner.calls.create_customer.load(Ordering::SeqCst)
        }

        /// Number of attach calls so far.
        pub fn attach_calls(&self) -> u64 {
            self.inner.calls.attach.load(Ordering::SeqCst)
        }

        /// Number of detach calls so far.
        pub fn detach_calls(&self) -> u64 {
            self.inner.calls.detach.load(Ordering::SeqCst)
        }

        /// Number of set-default calls so far.
        pub fn set_default_calls(&self) -> u64 {
            self.inner.calls.set_default.load(Ordering::SeqCst)
        }

        /// Number of subscription creations so far.
        pub fn create_subscription_calls(&self) -> u64 {
            self.inner.calls.create_subscription.load(Ordering::SeqCst)
        }

        /// Number of subscription updates so far.
        pub fn update_subscription_calls(&self) -> u64 {
            self.inner.calls.update_subscription.load(Ordering::SeqCst)
        }

        /// Total mutation calls issued against the provider.
        pub fn mutation_calls(&self) -> u64 {
            self.create_customer_calls()
                + self.attach_calls()
                + self.detach_calls()
                + self.set_default_calls()
                + self.create_subscription_calls()
                + self.update_subscription_calls()
        }

        /// Count customers currently holding the given email.
        pub fn customers_with_email(&self, email: &str) -> usize {
            self.inner
                .customers
                .read()
                .unwrap()
                .values()
                .filter(|c| c.email == email)
                .count()
        }
    }

    impl CustomerClient for MockProviderClient {
        async fn create_customer(&self, request: CreateCustomerRequest) -> Result<ProviderCustomer> {
            self.inner.calls.create_customer.fetch_add(1, Ordering::SeqCst);
            let id = format!(
                "cus_mock_{}",
                self.inner.id_counter.fetch_add(1, Ordering::SeqCst)
            );
            self.inner.customers.write().unwrap().insert(
                id.clone(),
                MockCustomer {
                    email: request.email.clone(),
                    user_id: Some(request.user_id.clone()),
                },
            );
            Ok(ProviderCustomer {
                id,
                email: Some(request.email),
                user_id: Some(request.user_id),
            })
        }

        async fn retrieve_customer(&self, customer_id: &str) -> Result<ProviderCustomer> {
            let customers = self.inner.customers.read().unwrap();
            customers
                .get(customer_id)
                .map(|c| ProviderCustomer {
                    id: customer_id.to_string(),
                    email: Some(c.email.clone()),
                    user_id: c.user_id.clone(),
                })
                .ok_or_else(|| {
                    PaysyncError::NotFound(format!("customer not found: {}", customer_id))
                })
        }

        async fn list_customers_by_email(&self, email: &str) -> Result<Vec<ProviderCustomer>> {
            let customers = self.inner.customers.read().unwrap();
            let mut matches: Vec<ProviderCustomer> = customers
                .iter()
                .filter(|(_, c)| c.email == email)
                .map(|(id, c)| ProviderCustomer {
                    id: id.clone(),
                    email: Some(c.email.clone()),
                    user_id: c.user_id.clone(),
                })
                .collect();
            matches.sort_by(|a, b| a.id.cmp(&b.id));
            Ok(matches)
        }

        async fn set_default_payment_method(
            &self,
            customer_id: &str,
            payment_method_id: &str,
        ) -> Result<()> {
            self.inner.calls.set_default.fetch_add(1, Ordering::SeqCst);
            self.inner
                .defaults
                .write()
                .unwrap()
                .insert(customer_id.to_string(), payment_method_id.to_string());
            Ok(())
        }

        async fn get_default_payment_method(&self, customer_id: &str) -> Result<Option<String>> {
            Ok(self.inner.defaults.read().unwrap().get(customer_id).cloned())
        }
    }

    impl PaymentMethodClient for MockProviderClient {
        async fn retrieve_payment_method(
            &self,
            payment_method_id: &str,
        ) -> Result<ProviderPaymentMethod> {
            let methods = self.inner.payment_methods.read().unwrap();
            methods.get(payment_method_id).cloned().ok_or_else(|| {
                PaysyncError::NotFound(format!("payment method not found: {}", payment_method_id))
            })
        }

        async fn list_payment_methods(
            &self,
            customer_id: &str,
            limit: u8,
        ) -> Result<Vec<ProviderPaymentMethod>> {
            let methods = self.inner.payment_methods.read().unwrap();
            Ok(methods
                .values()
                .filter(|m| m.customer.as_deref() == Some(customer_id))
                .take(usize::from(limit))
                .cloned()
                .collect())
        }

        async fn attach_payment_method(
            &self,
            payment_method_id: &str,
            customer_id: &str,
        ) -> Result<ProviderPaymentMethod> {
            self.inner.calls.attach.fetch_add(1, Ordering::SeqCst);

            if self.inner.fail_next_attach.swap(false, Ordering::SeqCst) {
                return Err(PaysyncError::Provider {
                    operation: "attach_payment_method".to_string(),
                    message: "card has been deactivated".to_string(),
                    code: Some("card_declined".to_string()),
                    http_status: Some(402),
                });
            }

            let mut methods = self.inner.payment_methods.write().unwrap();
            let method = methods.get_mut(payment_method_id).ok_or_else(|| {
                PaysyncError::NotFound(format!("payment method not found: {}", payment_method_id))
            })?;
            method.customer = Some(customer_id.to_string());
            Ok(method.clone())
        }

        async fn detach_payment_method(&self, payment_method_id: &str) -> Result<()> {
            self.inner.calls.detach.fetch_add(1, Ordering::SeqCst);

            let mut methods = self.inner.payment_methods.write().unwrap();
            let method = methods.get_mut(payment_method_id).ok_or_else(|| {
                PaysyncError::NotFound(format!("payment method not found: {}", payment_method_id))
            })?;
            if method.customer.is_none() {
                // Mirrors the provider, which rejects detaching an unattached method.
                return Err(PaysyncError::Provider {
                    operation: "detach_payment_method".to_string(),
                    message: "payment method is not attached to a customer".to_string(),
                    code: None,
                    http_status: Some(400),
                });
            }
            method.customer = None;
            Ok(())
        }
    }

    impl SubscriptionClient for MockProviderClient {
        async fn create_subscription(
            &self,
            request: CreateSubscriptionRequest,
        ) -> Result<ProviderSubscriptionData> {
            self.inner
                .calls
                .create_subscription
                .fetch_add(1, Ordering::SeqCst);
            let id = format!(
                "sub_mock_{}",
                self.inner.id_counter.fetch_add(1, Ordering::SeqCst)
            );
            let data = ProviderSubscriptionData {
                id: id.clone(),
                customer_id: request.customer_id,
                price_id: request.price_id,
                status: "active".to_string(),
                default_payment_method: request.default_payment_method,
                current_period_start: 1_700_000_000,
                current_period_end: 1_702_592_000,
                cancel_at_period_end: false,
            };
            self.inner
                .subscriptions
                .write()
                .unwrap()
                .insert(id, data.clone());
            Ok(data)
        }

        async fn update_subscription_price(
            &self,
            subscription_id: &str,
            price_id: &str,
        ) -> Result<ProviderSubscriptionData> {
            self.inner
                .calls
                .update_subscription
                .fetch_add(1, Ordering::SeqCst);
            let mut subs = self.inner.subscriptions.write().unwrap();
            let sub = subs.get_mut(subscription_id).ok_or_else(|| {
                PaysyncError::NotFound(format!("subscription not found: {}", subscription_id))
            })?;
            sub.price_id = price_id.to_string();
            Ok(sub.clone())
        }

        async fn get_subscription(
            &self,
            subscription_id: &str,
        ) -> Result<ProviderSubscriptionData> {
            let subs = self.inner.subscriptions.read().unwrap();
            subs.get(subscription_id).cloned().ok_or_else(|| {
                PaysyncError::NotFound(format!("subscription not found: {}", subscription_id))
            })
        }

        async fn list_subscriptions(
            &self,
            customer_id: &str,
        ) -> Result<Vec<ProviderSubscriptionData>> {
            let subs = self.inner.subscriptions.read().unwrap();
            Ok(subs
                .values()
                .filter(|s| s.customer_id == customer_id)
                .cloned()
                .collect())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::test::MockProviderClient;
    use super::*;

    #[tokio::test]
    async fn test_mock_customer_lifecycle() {
        let client = MockProviderClient::new();

        let customer = client
            .create_customer(CreateCustomerRequest {
                email: "a@example.com".to_string(),
                user_id: "u1".to_string(),
            })
            .await
            .unwrap();
        assert!(customer.id.starts_with("cus_mock_"));

        let found = client.retrieve_customer(&customer.id).await.unwrap();
        assert_eq!(found.user_id.as_deref(), Some("u1"));

        let matches = client.list_customers_by_email("a@example.com").await.unwrap();
        assert_eq!(matches.len(), 1);
    }

    #[tokio::test]
    async fn test_mock_counts_mutations() {
        let client = MockProviderClient::new();
        client.seed_payment_method("pm_1", None);

        assert_eq!(client.mutation_calls(), 0);
        client.attach_payment_method("pm_1", "cus_A").await.unwrap();
        assert_eq!(client.attach_calls(), 1);
        client.detach_payment_method("pm_1").await.unwrap();
        assert_eq!(client.detach_calls(), 1);
        assert_eq!(client.mutation_calls(), 2);
    }

    #[tokio::test]
    async fn test_mock_detach_unattached_is_error() {
        let client = MockProviderClient::new();
        client.seed_payment_method("pm_1", None);

        let result = client.detach_payment_method("pm_1").await;
        assert!(result.is_err());
    }

    #[test]
    fn test_subscription_is_active() {
        let mut data = ProviderSubscriptionData {
            id: "sub_1".to_string(),
            customer_id: "cus_1".to_string(),
            price_id: "price_1".to_string(),
            status: "active".to_string(),
            default_payment_method: None,
            current_period_start: 0,
            current_period_end: 0,
            cancel_at_period_end: false,
        };
        assert!(data.is_active());
        data.status = "trialing".to_string();
        assert!(data.is_active());
        data.status = "canceled".to_string();
        assert!(!data.is_active());
    }
}
