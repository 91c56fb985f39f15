//! Live Stripe-backed provider client.
//!
//! Production implementation of the provider traits with retry logic for
//! reads, idempotency keys for mutations, secure key handling, and error
//! mapping onto the crate's taxonomy.

use secrecy::ExposeSecret;
use std::time::Duration;

use crate::client::{
    CreateCustomerRequest, CreateSubscriptionRequest, CustomerClient, PaymentMethodClient,
    ProviderCustomer, ProviderPaymentMethod, ProviderSubscriptionData, SubscriptionClient,
};
use crate::config::ReconcilerConfig;
use crate::error::{PaysyncError, Result};

// ============================================================================
// Constants
// ============================================================================

/// Metadata key correlating a provider customer back to the local user.
const META_USER_ID: &str = "user_id";

// ============================================================================
// Secret Key Validation
// ============================================================================

/// Error returned when secret key validation fails.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InvalidSecretKeyError {
    /// Description of why the key is invalid.
    pub reason: String,
}

impl std::fmt::Display for InvalidSecretKeyError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Invalid provider secret key: {}", self.reason)
    }
}

impl std::error::Error for InvalidSecretKeyError {}

/// Validate a provider secret key format.
///
/// Valid formats:
/// - `sk_test_*` - Test mode secret key
/// - `sk_live_*` - Live mode secret key
/// - `rk_test_*` - Test mode restricted key
/// - `rk_live_*` - Live mode restricted key
pub fn validate_secret_key(key: &str) -> std::result::Result<(), InvalidSecretKeyError> {
    const MIN_KEY_LENGTH: usize = 20;

    if key.is_empty() {
        return Err(InvalidSecretKeyError {
            reason: "secret key cannot be empty".to_string(),
        });
    }

    if key.len() < MIN_KEY_LENGTH {
        return Err(InvalidSecretKeyError {
            reason: format!("secret key too short (minimum {} characters)", MIN_KEY_LENGTH),
        });
    }

    let valid_prefixes = ["sk_test_", "sk_live_", "rk_test_", "rk_live_"];
    if !valid_prefixes.iter().any(|prefix| key.starts_with(prefix)) {
        return Err(InvalidSecretKeyError {
            reason: "secret key must start with sk_test_, sk_live_, rk_test_, or rk_live_"
                .to_string(),
        });
    }

    Ok(())
}

// ============================================================================
// ID Parsing Helpers
// ============================================================================

#[inline]
fn parse_customer_id(id: &str) -> Result<stripe::CustomerId> {
    id.parse()
        .map_err(|_| PaysyncError::InvalidInput(format!("invalid customer id: {}", id)))
}

#[inline]
fn parse_payment_method_id(id: &str) -> Result<stripe::PaymentMethodId> {
    id.parse()
        .map_err(|_| PaysyncError::InvalidInput(format!("invalid payment method id: {}", id)))
}

#[inline]
fn parse_subscription_id(id: &str) -> Result<stripe::SubscriptionId> {
    id.parse()
        .map_err(|_| PaysyncError::InvalidInput(format!("invalid subscription id: {}", id)))
}

// ============================================================================
// Live Provider Client
// ============================================================================

/// Live Stripe client for production use.
///
/// Implements the provider traits with:
/// - Secure key handling using `SecretString` via [`ReconcilerConfig`]
/// - Retry logic with exponential backoff for read operations
/// - Idempotency keys on every mutating operation
/// - Error mapping onto [`PaysyncError`]
///
/// Mutations are never retried internally. A timed-out mutation surfaces as
/// [`PaysyncError::ProviderTransient`] and the caller must re-resolve state
/// before trying again, because the remote side effect may have landed.
#[derive(Clone)]
pub struct LiveProviderClient {
    client: stripe::Client,
    config: ReconcilerConfig,
}

impl LiveProviderClient {
    /// Create a new live client from validated configuration.
    ///
    /// # Errors
    ///
    /// Returns an error if the configured secret key format is invalid.
    pub fn new(config: ReconcilerConfig) -> std::result::Result<Self, InvalidSecretKeyError> {
        validate_secret_key(config.secret_key.expose_secret())?;

        let client = stripe::Client::new(config.secret_key.expose_secret()).with_app_info(
            "paysync".to_string(),
            Some(env!("CARGO_PKG_VERSION").to_string()),
            None,
        );

        Ok(Self { client, config })
    }

    /// Check if the client is using a test mode key.
    #[must_use]
    pub fn is_test_mode(&self) -> bool {
        self.config.is_test_mode()
    }

    /// Get the configured per-call timeout.
    #[inline]
    #[must_use]
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.config.timeout_seconds)
    }

    /// Generate a random idempotency key for a mutating operation.
    #[inline]
    fn generate_idempotency_key(operation: &str) -> String {
        format!("{}_{}", operation, uuid::Uuid::new_v4())
    }

    /// Get a client configured with a fresh idempotency key.
    #[inline]
    fn idempotent_client(&self, operation: &str) -> stripe::Client {
        let key = Self::generate_idempotency_key(operation);
        self.client
            .clone()
            .with_strategy(stripe::RequestStrategy::Idempotent(key))
    }

    /// Get a client with a deterministic idempotency key.
    ///
    /// Customer creation uses a key derived from the local user id, so a
    /// retried or concurrent first call replays the same provider request
    /// instead of minting a duplicate customer.
    #[inline]
    fn keyed_client(&self, key: String) -> stripe::Client {
        self.client
            .clone()
            .with_strategy(stripe::RequestStrategy::Idempotent(key))
    }

    /// Execute a read with timeout, retrying transient failures.
    async fn read<T, F, Fut>(&self, operation: &str, operation_fn: F) -> Result<T>
    where
        F: Fn() -> Fut,
        Fut: std::future::Future<Output = std::result::Result<T, stripe::StripeError>>,
    {
        let timeout_duration = self.timeout();
        let mut attempts = 0;

        loop {
            let result = tokio::time::timeout(timeout_duration, operation_fn()).await;

            match result {
                Ok(Ok(value)) => return Ok(value),
                Ok(Err(e)) => {
                    if !is_retryable_error(&e) || attempts >= self.config.max_read_retries {
                        return Err(map_stripe_error(e, operation));
                    }
                    self.log_retry(operation, attempts, &e);
                    self.sleep_with_backoff(attempts).await;
                    attempts += 1;
                }
                Err(_timeout) => {
                    if attempts >= self.config.max_read_retries {
                        return Err(timeout_error(operation, self.config.timeout_seconds));
                    }
                    tracing::warn!(
                        target: "paysync::provider",
                        operation = operation,
                        attempt = attempts + 1,
                        timeout_seconds = self.config.timeout_seconds,
                        "provider read timed out, retrying"
                    );
                    self.sleep_with_backoff(attempts).await;
                    attempts += 1;
                }
            }
        }
    }

    /// Execute a mutation with timeout, exactly one attempt.
    async fn mutate<T, Fut>(&self, operation: &str, future: Fut) -> Result<T>
    where
        Fut: std::future::Future<Output = std::result::Result<T, stripe::StripeError>>,
    {
        match tokio::time::timeout(self.timeout(), future).await {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(e)) => Err(map_stripe_error(e, operation)),
            Err(_timeout) => Err(timeout_error(operation, self.config.timeout_seconds)),
        }
    }

    #[inline]
    fn log_retry(&self, operation: &str, attempts: u32, error: &stripe::StripeError) {
        let delay = calculate_backoff_delay(
            attempts,
            self.config.base_delay_ms,
            self.config.max_delay_ms,
        );
        tracing::warn!(
            target: "paysync::provider",
            operation = operation,
            attempt = attempts + 1,
            delay_ms = delay.as_millis() as u64,
            error = %error,
            "retrying provider read after transient error"
        );
    }

    #[inline]
    async fn sleep_with_backoff(&self, attempts: u32) {
        let delay = calculate_backoff_delay(
            attempts,
            self.config.base_delay_ms,
            self.config.max_delay_ms,
        );
        tokio::time::sleep(delay).await;
    }
}

// Debug implementation that doesn't expose the secret key
impl std::fmt::Debug for LiveProviderClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LiveProviderClient")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

// ============================================================================
// Retry Support
// ============================================================================

/// Check if a provider error is retryable on a read path.
#[inline]
fn is_retryable_error(error: &stripe::StripeError) -> bool {
    match error {
        stripe::StripeError::Stripe(request_error) => {
            let status = request_error.http_status;
            status == 429 || (500..600).contains(&status)
        }
        stripe::StripeError::Timeout => true,
        _ => false,
    }
}

/// Calculate backoff delay with exponential backoff and jitter.
#[inline]
fn calculate_backoff_delay(attempt: u32, base_ms: u64, max_ms: u64) -> Duration {
    let delay_ms = base_ms.saturating_mul(2_u64.saturating_pow(attempt));
    let delay_ms = delay_ms.min(max_ms);

    // Add jitter (0-25% of delay)
    let jitter = if delay_ms > 0 {
        fastrand::u64(0..=delay_ms / 4)
    } else {
        0
    };
    Duration::from_millis(delay_ms.saturating_add(jitter))
}

// ============================================================================
// Error Mapping
// ============================================================================

#[inline]
fn timeout_error(operation: &str, timeout_seconds: u64) -> PaysyncError {
    PaysyncError::ProviderTransient {
        operation: operation.to_string(),
        message: format!("request timed out after {} seconds", timeout_seconds),
        http_status: Some(408),
    }
}

/// Map Stripe errors onto the crate's taxonomy.
fn map_stripe_error(error: stripe::StripeError, operation: &str) -> PaysyncError {
    match error {
        stripe::StripeError::Stripe(request_error) => {
            let http_status = request_error.http_status;
            let message = request_error
                .message
                .clone()
                .unwrap_or_else(|| "unknown provider error".to_string());

            if http_status == 429 || (500..600).contains(&http_status) {
                return PaysyncError::ProviderTransient {
                    operation: operation.to_string(),
                    message,
                    http_status: Some(http_status),
                };
            }

            PaysyncError::Provider {
                operation: operation.to_string(),
                message,
                code: request_error.code.as_ref().map(|c| format!("{c:?}")),
                http_status: Some(http_status),
            }
        }
        stripe::StripeError::Timeout => PaysyncError::ProviderTransient {
            operation: operation.to_string(),
            message: "request timed out".to_string(),
            http_status: Some(408),
        },
        stripe::StripeError::QueryStringSerialize(e) => {
            PaysyncError::Internal(format!("failed to serialize request: {e}"))
        }
        stripe::StripeError::JSONSerialize(e) => {
            PaysyncError::Internal(format!("failed to serialize JSON: {e}"))
        }
        stripe::StripeError::UnsupportedVersion => {
            PaysyncError::Internal("unsupported provider API version".to_string())
        }
        stripe::StripeError::ClientError(msg) => {
            PaysyncError::Internal(format!("HTTP client error: {msg}"))
        }
    }
}

// ============================================================================
// Data Mapping
// ============================================================================

fn map_customer(customer: stripe::Customer) -> ProviderCustomer {
    let user_id = customer
        .metadata
        .as_ref()
        .and_then(|m| m.get(META_USER_ID))
        .cloned();

    ProviderCustomer {
        id: customer.id.to_string(),
        email: customer.email,
        user_id,
    }
}

fn map_payment_method(method: stripe::PaymentMethod) -> ProviderPaymentMethod {
    ProviderPaymentMethod {
        id: method.id.to_string(),
        customer: method.customer.as_ref().map(|c| c.id().to_string()),
        card_brand: method.card.as_ref().map(|c| c.brand.clone()),
        card_last4: method.card.as_ref().map(|c| c.last4.clone()),
    }
}

fn map_subscription(sub: stripe::Subscription) -> Result<ProviderSubscriptionData> {
    let status = match sub.status {
        stripe::SubscriptionStatus::Active => "active",
        stripe::SubscriptionStatus::Canceled => "canceled",
        stripe::SubscriptionStatus::Incomplete => "incomplete",
        stripe::SubscriptionStatus::IncompleteExpired => "incomplete_expired",
        stripe::SubscriptionStatus::PastDue => "past_due",
        stripe::SubscriptionStatus::Trialing => "trialing",
        stripe::SubscriptionStatus::Unpaid => "unpaid",
        stripe::SubscriptionStatus::Paused => "paused",
    };

    let customer_id = match &sub.customer {
        stripe::Expandable::Id(id) => id.to_string(),
        stripe::Expandable::Object(c) => c.id.to_string(),
    };

    let price_id = sub
        .items
        .data
        .first()
        .and_then(|item| item.price.as_ref())
        .map(|price| price.id.to_string())
        .ok_or_else(|| {
            PaysyncError::Internal(format!("subscription {} has no priced item", sub.id))
        })?;

    let default_payment_method = sub
        .default_payment_method
        .as_ref()
        .map(|pm| pm.id().to_string());

    Ok(ProviderSubscriptionData {
        id: sub.id.to_string(),
        customer_id,
        price_id,
        status: status.to_string(),
        default_payment_method,
        current_period_start: sub.current_period_start.max(0) as u64,
        current_period_end: sub.current_period_end.max(0) as u64,
        cancel_at_period_end: sub.cancel_at_period_end,
    })
}

// ============================================================================
// CustomerClient Implementation
// ============================================================================

impl CustomerClient for LiveProviderClient {
    async fn create_customer(&self, request: CreateCustomerRequest) -> Result<ProviderCustomer> {
        // Deterministic key: a replayed first call for the same user hits
        // the provider's idempotency cache instead of creating a duplicate.
        let client = self.keyed_client(format!("customer_create_{}", request.user_id));

        let mut params = stripe::CreateCustomer::new();
        params.email = Some(&request.email);

        let mut meta = std::collections::HashMap::new();
        meta.insert(META_USER_ID.to_string(), request.user_id.clone());
        params.metadata = Some(meta);

        let customer = self
            .mutate("create_customer", stripe::Customer::create(&client, params))
            .await?;

        Ok(map_customer(customer))
    }

    async fn retrieve_customer(&self, customer_id: &str) -> Result<ProviderCustomer> {
        let customer_id = parse_customer_id(customer_id)?;

        let customer = self
            .read("retrieve_customer", || {
                let client = self.client.clone();
                let customer_id = customer_id.clone();
                async move { stripe::Customer::retrieve(&client, &customer_id, &[]).await }
            })
            .await?;

        Ok(map_customer(customer))
    }

    async fn list_customers_by_email(&self, email: &str) -> Result<Vec<ProviderCustomer>> {
        let list = self
            .read("list_customers_by_email", || {
                let client = self.client.clone();
                let mut params = stripe::ListCustomers::new();
                params.email = Some(email);
                params.limit = Some(100);
                async move { stripe::Customer::list(&client, &params).await }
            })
            .await?;

        Ok(list.data.into_iter().map(map_customer).collect())
    }

    async fn set_default_payment_method(
        &self,
        customer_id: &str,
        payment_method_id: &str,
    ) -> Result<()> {
        let client = self.idempotent_client("set_default_payment_method");
        let customer_id = parse_customer_id(customer_id)?;

        let mut params = stripe::UpdateCustomer::new();
        params.invoice_settings = Some(stripe::CustomerInvoiceSettings {
            default_payment_method: Some(payment_method_id.to_string()),
            ..Default::default()
        });

        self.mutate(
            "set_default_payment_method",
            stripe::Customer::update(&client, &customer_id, params),
        )
        .await?;

        Ok(())
    }

    async fn get_default_payment_method(&self, customer_id: &str) -> Result<Option<String>> {
        let customer_id = parse_customer_id(customer_id)?;

        let customer = self
            .read("get_default_payment_method", || {
                let client = self.client.clone();
                let customer_id = customer_id.clone();
                async move { stripe::Customer::retrieve(&client, &customer_id, &[]).await }
            })
            .await?;

        Ok(customer
            .invoice_settings
            .and_then(|settings| settings.default_payment_method)
            .map(|pm| pm.id().to_string()))
    }
}

// ============================================================================
// PaymentMethodClient Implementation
// ============================================================================

impl PaymentMethodClient for LiveProviderClient {
    async fn retrieve_payment_method(
        &self,
        payment_method_id: &str,
    ) -> Result<ProviderPaymentMethod> {
        let pm_id = parse_payment_method_id(payment_method_id)?;

        let method = self
            .read("retrieve_payment_method", || {
                let client = self.client.clone();
                let pm_id = pm_id.clone();
                async move { stripe::PaymentMethod::retrieve(&client, &pm_id, &[]).await }
            })
            .await?;

        Ok(map_payment_method(method))
    }

    async fn list_payment_methods(
        &self,
        customer_id: &str,
        limit: u8,
    ) -> Result<Vec<ProviderPaymentMethod>> {
        let customer_id = parse_customer_id(customer_id)?;

        let list = self
            .read("list_payment_methods", || {
                let client = self.client.clone();
                let mut params = stripe::ListPaymentMethods::new();
                params.customer = Some(customer_id.clone());
                params.type_ = Some(stripe::PaymentMethodTypeFilter::Card);
                params.limit = Some(u64::from(limit));
                async move { stripe::PaymentMethod::list(&client, &params).await }
            })
            .await?;

        Ok(list.data.into_iter().map(map_payment_method).collect())
    }

    async fn attach_payment_method(
        &self,
        payment_method_id: &str,
        customer_id: &str,
    ) -> Result<ProviderPaymentMethod> {
        let client = self.idempotent_client("attach_payment_method");
        let pm_id = parse_payment_method_id(payment_method_id)?;
        let customer_id = parse_customer_id(customer_id)?;

        let method = self
            .mutate(
                "attach_payment_method",
                stripe::PaymentMethod::attach(
                    &client,
                    &pm_id,
                    stripe::AttachPaymentMethod {
                        customer: customer_id,
                    },
                ),
            )
            .await?;

        Ok(map_payment_method(method))
    }

    async fn detach_payment_method(&self, payment_method_id: &str) -> Result<()> {
        let client = self.idempotent_client("detach_payment_method");
        let pm_id = parse_payment_method_id(payment_method_id)?;

        self.mutate(
            "detach_payment_method",
            stripe::PaymentMethod::detach(&client, &pm_id),
        )
        .await?;

        Ok(())
    }
}

// ============================================================================
// SubscriptionClient Implementation
// ============================================================================

impl SubscriptionClient for LiveProviderClient {
    async fn create_subscription(
        &self,
        request: CreateSubscriptionRequest,
    ) -> Result<ProviderSubscriptionData> {
        let client = self.idempotent_client("create_subscription");
        let customer_id = parse_customer_id(&request.customer_id)?;

        let mut params = stripe::CreateSubscription::new(customer_id);
        params.items = Some(vec![stripe::CreateSubscriptionItems {
            price: Some(request.price_id.clone()),
            ..Default::default()
        }]);
        if let Some(ref pm) = request.default_payment_method {
            params.default_payment_method = Some(pm);
        }

        let mut meta = std::collections::HashMap::new();
        meta.insert(META_USER_ID.to_string(), request.user_id.clone());
        params.metadata = Some(meta);

        let subscription = self
            .mutate(
                "create_subscription",
                stripe::Subscription::create(&client, params),
            )
            .await?;

        map_subscription(subscription)
    }

    async fn update_subscription_price(
        &self,
        subscription_id: &str,
        price_id: &str,
    ) -> Result<ProviderSubscriptionData> {
        let sub_id = parse_subscription_id(subscription_id)?;

        // Read the current item id first; a price change replaces the item
        // in place rather than stacking a second one.
        let current = self
            .read("get_subscription_items", || {
                let client = self.client.clone();
                let sub_id = sub_id.clone();
                async move { stripe::Subscription::retrieve(&client, &sub_id, &[]).await }
            })
            .await?;

        let item_id = current
            .items
            .data
            .first()
            .map(|item| item.id.to_string())
            .ok_or_else(|| {
                PaysyncError::Internal(format!("subscription {} has no items", subscription_id))
            })?;

        let client = self.idempotent_client("update_subscription_price");
        let mut params = stripe::UpdateSubscription::new();
        params.items = Some(vec![stripe::UpdateSubscriptionItems {
            id: Some(item_id),
            price: Some(price_id.to_string()),
            ..Default::default()
        }]);
        {
            use stripe::generated::billing::subscription::SubscriptionProrationBehavior;
            params.proration_behavior = Some(SubscriptionProrationBehavior::CreateProrations);
        }

        let subscription = self
            .mutate(
                "update_subscription_price",
                stripe::Subscription::update(&client, &sub_id, params),
            )
            .await?;

        map_subscription(subscription)
    }

    async fn get_subscription(&self, subscription_id: &str) -> Result<ProviderSubscriptionData> {
        let sub_id = parse_subscription_id(subscription_id)?;

        let subscription = self
            .read("get_subscription", || {
                let client = self.client.clone();
                let sub_id = sub_id.clone();
                async move { stripe::Subscription::retrieve(&client, &sub_id, &[]).await }
            })
            .await?;

        map_subscription(subscription)
    }

    async fn list_subscriptions(&self, customer_id: &str) -> Result<Vec<ProviderSubscriptionData>> {
        let customer_id = parse_customer_id(customer_id)?;

        let list = self
            .read("list_subscriptions", || {
                let client = self.client.clone();
                let mut params = stripe::ListSubscriptions::new();
                params.customer = Some(customer_id.clone());
                params.limit = Some(100);
                async move { stripe::Subscription::list(&client, &params).await }
            })
            .await?;

        list.data.into_iter().map(map_subscription).collect()
    }
}

// ============================================================================
// Tests
// ============================================================================
