//! Paysync - billing-provider reconciliation for SaaS applications.
//!
//! Keeps three things consistent between a billing provider (the service of
//! record for customers, payment methods, and subscriptions) and the
//! application's own datastore:
//!
//! - **Identity**: exactly one provider customer per local user, created on
//!   first use and never duplicated, even under concurrent first calls.
//! - **Payment-method ownership**: a payment method supplied by a client is
//!   guaranteed to be attached to the resolved customer before it is used,
//!   with misattachments repaired transparently when safe.
//! - **Subscription mirror**: the local subscription row always reflects the
//!   provider's status and price for the mapped customer.
//!
//! # Example
//!
//! ```rust,ignore
//! use paysync::{Reconciler, ReconcilerConfig, LiveProviderClient};
//!
//! let config = ReconcilerConfig::from_env()?;
//! let client = LiveProviderClient::new(config.clone())?;
//! let reconciler = Reconciler::new(store, client, &config);
//!
//! // Before any billing operation for a user:
//! let identity = reconciler
//!     .ensure_billing_ready(&user.id, &user.email, Some("pm_abc123"))
//!     .await?;
//!
//! // Change plan, mirroring the result locally:
//! let sub = reconciler
//!     .change_plan(&user.id, &user.email, Some("pm_abc123"), "price_pro")
//!     .await?;
//! ```
//!
//! Provider access goes through the traits in [`client`], so the whole flow
//! is testable without network calls; [`LiveProviderClient`] is the
//! production implementation backed by Stripe.

#![allow(async_fn_in_trait)] // client traits use plain async fns; storage uses async_trait

pub mod client;
pub mod config;
pub mod error;
pub mod identity;
pub mod live_client;
pub mod payment;
pub mod reconcile;
#[cfg(feature = "store-seaorm")]
pub mod sea_orm_store;
pub mod storage;
pub mod subscription;
pub mod validation;

// Error exports
pub use error::{PaysyncError, Result};

// Config exports
pub use config::ReconcilerConfig;

// Client exports
pub use client::{
    CreateCustomerRequest, CreateSubscriptionRequest, CustomerClient, PaymentMethodClient,
    ProviderClient, ProviderCustomer, ProviderPaymentMethod, ProviderSubscriptionData,
    SubscriptionClient,
};

// Storage exports
pub use storage::{ReconcileStore, StoredSubscription, SubscriptionStatus};

// Identity exports
pub use identity::IdentityResolver;

// Payment exports
pub use payment::{Attachment, PaymentMethodRepair, RepairOutcome};

// Subscription exports
pub use subscription::SubscriptionReconciler;

// Facade exports
pub use reconcile::{BillingIdentity, Reconciler};

// Live client exports (production provider client)
pub use live_client::{InvalidSecretKeyError, LiveProviderClient};

// SeaORM storage exports
#[cfg(feature = "store-seaorm")]
pub use sea_orm_store::SeaOrmReconcileStore;

// Test exports
#[cfg(any(test, feature = "test-support"))]
pub use client::test::MockProviderClient;

#[cfg(any(test, feature = "test-support"))]
pub use storage::test::InMemoryStore;

// Validation exports
pub use validation::{id_kind, validate_price_id, validate_user_id};
