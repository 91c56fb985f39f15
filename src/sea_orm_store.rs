//! SeaORM-backed reconciliation storage.
//!
//! Production persistence for the customer mapping and subscription mirror.
//! Enabled with the `store-seaorm` feature.
//!
//! # Example
//!
//! ```rust,ignore
//! use paysync::SeaOrmReconcileStore;
//! use sea_orm::DatabaseConnection;
//!
//! let store = SeaOrmReconcileStore::new(db.clone());
//! let reconciler = Reconciler::new(store, client, &config);
//! ```

use async_trait::async_trait;
use sea_orm::{
    sea_query::OnConflict, ColumnTrait, DatabaseConnection, DbErr, EntityTrait, QueryFilter, Set,
};

use crate::error::{PaysyncError, Result};
use crate::storage::{ReconcileStore, StoredSubscription, SubscriptionStatus};

// =============================================================================
// SeaORM Entities
// =============================================================================

mod entity {
    use sea_orm::entity::prelude::*;

    pub mod customer_mapping {
        use super::*;

        #[derive(Clone, Debug, PartialEq, Eq, DeriveEntityModel)]
        #[sea_orm(table_name = "customer_mappings")]
        pub struct Model {
            #[sea_orm(primary_key, auto_increment = false)]
            pub user_id: String,
            pub provider_customer_id: String,
            pub created_at: DateTimeWithTimeZone,
        }

        #[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
        pub enum Relation {}

        impl ActiveModelBehavior for ActiveModel {}
    }

    pub mod subscription_mirror {
        use super::*;

        #[derive(Clone, Debug, PartialEq, Eq, DeriveEntityModel)]
        #[sea_orm(table_name = "subscription_mirror")]
        pub struct Model {
            #[sea_orm(primary_key, auto_increment = false)]
            pub user_id: String,
            #[sea_orm(unique)]
            pub provider_subscription_id: String,
            pub provider_customer_id: String,
            pub price_id: String,
            pub status: String,
            pub current_period_start: i64,
            pub current_period_end: i64,
            pub cancel_at_period_end: bool,
            pub updated_at: i64,
            pub created_at: DateTimeWithTimeZone,
        }

        #[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
        pub enum Relation {}

        impl ActiveModelBehavior for ActiveModel {}
    }
}

use entity::{customer_mapping, subscription_mirror};

// =============================================================================
// Helpers
// =============================================================================

/// Convert i64 to u64 safely (negative values become 0).
#[inline]
fn i64_to_u64(value: i64) -> u64 {
    u64::try_from(value).unwrap_or(0)
}

/// Convert u64 to i64 safely (values > i64::MAX become i64::MAX).
#[inline]
fn u64_to_i64(value: u64) -> i64 {
    i64::try_from(value).unwrap_or(i64::MAX)
}

fn model_to_stored_subscription(model: subscription_mirror::Model) -> StoredSubscription {
    StoredSubscription {
        provider_subscription_id: model.provider_subscription_id,
        provider_customer_id: model.provider_customer_id,
        price_id: model.price_id,
        status: SubscriptionStatus::from_provider(&model.status),
        current_period_start: i64_to_u64(model.current_period_start),
        current_period_end: i64_to_u64(model.current_period_end),
        cancel_at_period_end: model.cancel_at_period_end,
        updated_at: i64_to_u64(model.updated_at),
    }
}

fn subscription_to_active_model(
    user_id: &str,
    subscription: &StoredSubscription,
    created_at: sea_orm::prelude::DateTimeWithTimeZone,
) -> subscription_mirror::ActiveModel {
    subscription_mirror::ActiveModel {
        user_id: Set(user_id.to_string()),
        provider_subscription_id: Set(subscription.provider_subscription_id.clone()),
        provider_customer_id: Set(subscription.provider_customer_id.clone()),
        price_id: Set(subscription.price_id.clone()),
        status: Set(subscription.status.as_str().to_string()),
        current_period_start: Set(u64_to_i64(subscription.current_period_start)),
        current_period_end: Set(u64_to_i64(subscription.current_period_end)),
        cancel_at_period_end: Set(subscription.cancel_at_period_end),
        updated_at: Set(u64_to_i64(subscription.updated_at)),
        created_at: Set(created_at),
    }
}

/// Classify a database error for a given table.
///
/// Column and constraint failures indicate the deployed schema disagrees
/// with the code and become fatal [`PaysyncError::SchemaMismatch`]; anything
/// else is an ordinary storage failure.
fn classify_db_err(table: &str, err: DbErr) -> PaysyncError {
    let message = err.to_string();
    let lowered = message.to_lowercase();

    let schema_indicators = [
        "does not exist",
        "no such column",
        "no such table",
        "unknown column",
        "violates not-null constraint",
        "violates check constraint",
        "datatype mismatch",
    ];

    if schema_indicators.iter().any(|i| lowered.contains(i)) {
        return PaysyncError::SchemaMismatch {
            table: table.to_string(),
            message,
        };
    }

    PaysyncError::Storage(message)
}

// =============================================================================
// SeaOrmReconcileStore
// =============================================================================

/// SeaORM-backed store implementing [`ReconcileStore`].
///
/// The mapping insert uses `ON CONFLICT DO NOTHING` followed by a re-read,
/// so concurrent first writers converge on the same persisted customer id
/// without error-string matching.
#[derive(Clone, Debug)]
pub struct SeaOrmReconcileStore {
    db: DatabaseConnection,
}

impl SeaOrmReconcileStore {
    /// Create a new SeaORM store over an existing connection.
    #[must_use]
    pub fn new(db: DatabaseConnection) -> Self {
        Self { db }
    }

    /// Get a reference to the underlying database connection.
    #[must_use]
    pub fn connection(&self) -> &DatabaseConnection {
        &self.db
    }
}

#[async_trait]
impl ReconcileStore for SeaOrmReconcileStore {
    async fn get_customer_id(&self, user_id: &str) -> Result<Option<String>> {
        tracing::debug!(user_id = %user_id, "fetching customer mapping");

        let mapping = customer_mapping::Entity::find_by_id(user_id)
            .one(&self.db)
            .await
            .map_err(|e| classify_db_err("customer_mappings", e))?;

        Ok(mapping.map(|m| m.provider_customer_id))
    }

    async fn link_customer(&self, user_id: &str, customer_id: &str) -> Result<String> {
        tracing::debug!(
            user_id = %user_id,
            customer_id = %customer_id,
            "linking customer mapping"
        );

        let now = chrono::Utc::now().fixed_offset();

        let mapping = customer_mapping::ActiveModel {
            user_id: Set(user_id.to_string()),
            provider_customer_id: Set(customer_id.to_string()),
            created_at: Set(now),
        };

        // First writer wins: conflicting inserts do nothing.
        customer_mapping::Entity::insert(mapping)
            .on_conflict(
                OnConflict::column(customer_mapping::Column::UserId)
                    .do_nothing()
                    .to_owned(),
            )
            .do_nothing()
            .exec(&self.db)
            .await
            .map_err(|e| classify_db_err("customer_mappings", e))?;

        // Re-read to learn which write actually landed.
        let persisted = customer_mapping::Entity::find_by_id(user_id)
            .one(&self.db)
            .await
            .map_err(|e| classify_db_err("customer_mappings", e))?
            .ok_or_else(|| {
                PaysyncError::Storage(format!(
                    "customer mapping for '{}' missing after insert",
                    user_id
                ))
            })?;

        Ok(persisted.provider_customer_id)
    }

    async fn get_subscription(&self, user_id: &str) -> Result<Option<StoredSubscription>> {
        tracing::debug!(user_id = %user_id, "fetching mirrored subscription");

        let subscription = subscription_mirror::Entity::find_by_id(user_id)
            .one(&self.db)
            .await
            .map_err(|e| classify_db_err("subscription_mirror", e))?;

        Ok(subscription.map(model_to_stored_subscription))
    }

    async fn get_subscription_by_provider_id(
        &self,
        provider_subscription_id: &str,
    ) -> Result<Option<StoredSubscription>> {
        tracing::debug!(
            provider_subscription_id = %provider_subscription_id,
            "fetching mirrored subscription by provider id"
        );

        let subscription = subscription_mirror::Entity::find()
            .filter(
                subscription_mirror::Column::ProviderSubscriptionId.eq(provider_subscription_id),
            )
            .one(&self.db)
            .await
            .map_err(|e| classify_db_err("subscription_mirror", e))?;

        Ok(subscription.map(model_to_stored_subscription))
    }

    async fn save_subscription(
        &self,
        user_id: &str,
        subscription: &StoredSubscription,
    ) -> Result<()> {
        tracing::debug!(
            user_id = %user_id,
            provider_subscription_id = %subscription.provider_subscription_id,
            status = %subscription.status.as_str(),
            "saving mirrored subscription"
        );

        let now = chrono::Utc::now().fixed_offset();
        let active_model = subscription_to_active_model(user_id, subscription, now);

        subscription_mirror::Entity::insert(active_model)
            .on_conflict(
                OnConflict::column(subscription_mirror::Column::UserId)
                    .update_columns([
                        subscription_mirror::Column::ProviderSubscriptionId,
                        subscription_mirror::Column::ProviderCustomerId,
                        subscription_mirror::Column::PriceId,
                        subscription_mirror::Column::Status,
                        subscription_mirror::Column::CurrentPeriodStart,
                        subscription_mirror::Column::CurrentPeriodEnd,
                        subscription_mirror::Column::CancelAtPeriodEnd,
                        subscription_mirror::Column::UpdatedAt,
                    ])
                    .to_owned(),
            )
            .exec(&self.db)
            .await
            .map_err(|e| classify_db_err("subscription_mirror", e))?;

        Ok(())
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_model_to_stored_subscription() {
        let model = subscription_mirror::Model {
            user_id: "u1".to_string(),
            provider_subscription_id: "sub_abc".to_string(),
            provider_customer_id: "cus_xyz".to_string(),
            price_id: "price_pro".to_string(),
            status: "active".to_string(),
            current_period_start: 1_700_000_000,
            current_period_end: 1_702_592_000,
            cancel_at_period_end: false,
            updated_at: 1_700_000_000,
            created_at: chrono::Utc::now().fixed_offset(),
        };

        let stored = model_to_stored_subscription(model);

        assert_eq!(stored.provider_subscription_id, "sub_abc");
        assert_eq!(stored.provider_customer_id, "cus_xyz");
        assert_eq!(stored.price_id, "price_pro");
        assert_eq!(stored.status, SubscriptionStatus::Active);
        assert_eq!(stored.current_period_start, 1_700_000_000);
        assert!(!stored.cancel_at_period_end);
    }

    #[test]
    fn test_negative_periods_clamp_to_zero() {
        let model = subscription_mirror::Model {
            user_id: "u1".to_string(),
            provider_subscription_id: "sub_abc".to_string(),
            provider_customer_id: "cus_xyz".to_string(),
            price_id: "price_pro".to_string(),
            status: "active".to_string(),
            current_period_start: -5,
            current_period_end: -1,
            cancel_at_period_end: false,
            updated_at: 0,
            created_at: chrono::Utc::now().fixed_offset(),
        };

        let stored = model_to_stored_subscription(model);
        assert_eq!(stored.current_period_start, 0);
        assert_eq!(stored.current_period_end, 0);
    }

    #[test]
    fn test_classify_db_err_schema_mismatch() {
        let err = classify_db_err(
            "subscription_mirror",
            DbErr::Custom("column \"price_id\" of relation \"subscription_mirror\" does not exist".to_string()),
        );
        assert!(err.is_schema_mismatch());

        let err = classify_db_err(
            "customer_mappings",
            DbErr::Custom("null value in column \"user_id\" violates not-null constraint".to_string()),
        );
        assert!(err.is_schema_mismatch());
    }

    #[test]
    fn test_classify_db_err_storage() {
        let err = classify_db_err(
            "subscription_mirror",
            DbErr::Custom("connection refused".to_string()),
        );
        assert!(matches!(err, PaysyncError::Storage(_)));
        assert!(!err.is_schema_mismatch());
    }
}
