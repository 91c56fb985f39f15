//! Configuration for the reconciler and the live provider client.
//!
//! Credentials are injected at construction and held in [`SecretString`] so
//! they never appear in debug output or logs. Nothing in this crate reads
//! ambient global state after startup.

use secrecy::{ExposeSecret, SecretString};

use crate::live_client::{validate_secret_key, InvalidSecretKeyError};

/// Environment variable holding the provider secret key.
const ENV_SECRET_KEY: &str = "PAYSYNC_SECRET_KEY";
/// Environment variable overriding the per-call timeout.
const ENV_TIMEOUT_SECONDS: &str = "PAYSYNC_TIMEOUT_SECONDS";
/// Environment variable overriding the read-retry budget.
const ENV_MAX_READ_RETRIES: &str = "PAYSYNC_MAX_READ_RETRIES";

/// Configuration for reconciliation operations.
///
/// Built once at process start and passed explicitly to [`crate::Reconciler`]
/// and [`crate::LiveProviderClient`].
#[derive(Clone)]
pub struct ReconcilerConfig {
    /// Provider secret key (`sk_test_`, `sk_live_`, or restricted `rk_*`).
    pub secret_key: SecretString,
    /// Bounded timeout applied to every provider call, in seconds.
    pub timeout_seconds: u64,
    /// Maximum retry attempts for idempotent read operations.
    ///
    /// Mutations (create/attach/detach) are never retried internally, to
    /// avoid duplicate side effects.
    pub max_read_retries: u32,
    /// Base delay for exponential backoff between read retries, in ms.
    pub base_delay_ms: u64,
    /// Maximum delay between read retries, in ms.
    pub max_delay_ms: u64,
    /// Whether a payment method is promoted to the customer's default after
    /// the repair performs an attach.
    pub set_default_on_attach: bool,
}

impl ReconcilerConfig {
    /// Create a config with default knobs for the given secret key.
    ///
    /// # Errors
    ///
    /// Returns an error if the secret key format is invalid.
    pub fn new(
        secret_key: impl Into<SecretString>,
    ) -> std::result::Result<Self, InvalidSecretKeyError> {
        let secret_key: SecretString = secret_key.into();
        validate_secret_key(secret_key.expose_secret())?;

        Ok(Self {
            secret_key,
            timeout_seconds: 10,
            max_read_retries: 2,
            base_delay_ms: 500,
            max_delay_ms: 15_000,
            set_default_on_attach: true,
        })
    }

    /// Load configuration from the environment.
    ///
    /// Requires `PAYSYNC_SECRET_KEY`; `PAYSYNC_TIMEOUT_SECONDS` and
    /// `PAYSYNC_MAX_READ_RETRIES` override the defaults when present.
    pub fn from_env() -> anyhow::Result<Self> {
        let key = std::env::var(ENV_SECRET_KEY)
            .map_err(|_| anyhow::anyhow!("{} must be set", ENV_SECRET_KEY))?;

        let mut config = Self::new(key).map_err(|e| anyhow::anyhow!("{}", e))?;

        if let Ok(value) = std::env::var(ENV_TIMEOUT_SECONDS) {
            config.timeout_seconds = value
                .parse()
                .map_err(|_| anyhow::anyhow!("{} must be a positive integer", ENV_TIMEOUT_SECONDS))?;
        }

        if let Ok(value) = std::env::var(ENV_MAX_READ_RETRIES) {
            config.max_read_retries = value
                .parse()
                .map_err(|_| anyhow::anyhow!("{} must be a non-negative integer", ENV_MAX_READ_RETRIES))?;
        }

        Ok(config)
    }

    /// Set the per-call timeout.
    #[must_use]
    pub fn timeout_seconds(mut self, seconds: u64) -> Self {
        self.timeout_seconds = seconds;
        self
    }

    /// Set the read-retry budget.
    #[must_use]
    pub fn max_read_retries(mut self, retries: u32) -> Self {
        self.max_read_retries = retries;
        self
    }

    /// Set the base backoff delay.
    #[must_use]
    pub fn base_delay_ms(mut self, ms: u64) -> Self {
        self.base_delay_ms = ms;
        self
    }

    /// Set the maximum backoff delay.
    #[must_use]
    pub fn max_delay_ms(mut self, ms: u64) -> Self {
        self.max_delay_ms = ms;
        self
    }

    /// Control default-payment-method promotion after attach.
    #[must_use]
    pub fn set_default_on_attach(mut self, enabled: bool) -> Self {
        self.set_default_on_attach = enabled;
        self
    }

    /// Check if the configured key is a test-mode key.
    #[must_use]
    pub fn is_test_mode(&self) -> bool {
        let key = self.secret_key.expose_secret();
        key.starts_with("sk_test_") || key.starts_with("rk_test_")
    }
}

// Debug implementation that doesn't expose the secret key
impl std::fmt::Debug for ReconcilerConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReconcilerConfig")
            .field("timeout_seconds", &self.timeout_seconds)
            .field("max_read_retries", &self.max_read_retries)
            .field("base_delay_ms", &self.base_delay_ms)
            .field("max_delay_ms", &self.max_delay_ms)
            .field("set_default_on_attach", &self.set_default_on_attach)
            .field("is_test_mode", &self.is_test_mode())
            .finish_non_exhaustive()
    }
}
