//! Identity resolution between local users and provider customers.
//!
//! Guarantees at most one provider customer per local user. The stored
//! mapping is authoritative once written: email search is only a fallback
//! for users who predate the mapping table, and provider-side state never
//! overrides an existing mapping.

use crate::client::{CreateCustomerRequest, CustomerClient, ProviderCustomer};
use crate::error::{PaysyncError, Result};
use crate::storage::ReconcileStore;
use crate::validation::{validate_email, validate_user_id};

/// Resolves a local user to exactly one provider customer id.
///
/// Resolution order: stored mapping, then provider email search (adopting a
/// unique match), then customer creation. The final mapping write is
/// first-writer-wins, so concurrent first calls for the same user converge
/// on a single customer id.
#[derive(Clone)]
pub struct IdentityResolver<S, C> {
    store: S,
    client: C,
}

impl<S: ReconcileStore, C: CustomerClient> IdentityResolver<S, C> {
    /// Create a resolver over a store and a provider client.
    pub fn new(store: S, client: C) -> Self {
        Self { store, client }
    }

    /// Resolve the user to a provider customer id, creating one if needed.
    ///
    /// # Errors
    ///
    /// Returns [`PaysyncError::IdentityConflict`] when the provider holds
    /// multiple customers for the email and none can be disambiguated by
    /// correlating metadata.
    pub async fn resolve(&self, user_id: &str, email: &str) -> Result<String> {
        self.resolve_with_options(user_id, email, false).await
    }

    /// Resolve with explicit control over email adoption.
    ///
    /// With `force_create` the email-search fallback is skipped and a new
    /// customer is created whenever no mapping exists. The mapping lookup
    /// still runs first; an existing mapping always wins.
    pub async fn resolve_with_options(
        &self,
        user_id: &str,
        email: &str,
        force_create: bool,
    ) -> Result<String> {
        validate_user_id(user_id)?;
        validate_email(email)?;

        // Fast path: the stored mapping is authoritative.
        if let Some(customer_id) = self.store.get_customer_id(user_id).await? {
            return Ok(customer_id);
        }

        let candidate = if force_create {
            None
        } else {
            self.find_by_email(user_id, email).await?
        };

        let candidate_id = match candidate {
            Some(customer) => {
                tracing::info!(
                    target: "paysync::identity",
                    user_id = %user_id,
                    customer_id = %customer.id,
                    "adopting existing provider customer by email"
                );
                customer.id
            }
            None => {
                let created = self
                    .client
                    .create_customer(CreateCustomerRequest {
                        email: email.to_string(),
                        user_id: user_id.to_string(),
                    })
                    .await?;
                tracing::info!(
                    target: "paysync::identity",
                    user_id = %user_id,
                    customer_id = %created.id,
                    "created provider customer"
                );
                created.id
            }
        };

        self.commit_mapping(user_id, &candidate_id).await
    }

    /// Write the mapping and return whichever customer id actually won.
    async fn commit_mapping(&self, user_id: &str, candidate_id: &str) -> Result<String> {
        match self.store.link_customer(user_id, candidate_id).await {
            Ok(winner) => {
                if winner != candidate_id {
                    // A concurrent resolution won the insert. The loser's
                    // customer stays orphaned on the provider side rather
                    // than risking a delete of a customer in use.
                    tracing::warn!(
                        target: "paysync::identity",
                        user_id = %user_id,
                        winner = %winner,
                        orphaned = %candidate_id,
                        "concurrent customer creation lost the mapping race"
                    );
                }
                Ok(winner)
            }
            Err(link_err) => {
                // The insert can fail on a unique-constraint race. Re-read
                // once: a mapping present now means another writer won.
                match self.store.get_customer_id(user_id).await? {
                    Some(winner) => {
                        tracing::warn!(
                            target: "paysync::identity",
                            user_id = %user_id,
                            winner = %winner,
                            orphaned = %candidate_id,
                            "mapping insert failed, adopting concurrent winner"
                        );
                        Ok(winner)
                    }
                    None => Err(link_err),
                }
            }
        }
    }

    /// Search the provider for a customer holding this email.
    ///
    /// A unique match is adopted. Multiple matches are disambiguated by the
    /// correlating user id in customer metadata; anything else is an
    /// identity conflict requiring manual review.
    async fn find_by_email(
        &self,
        user_id: &str,
        email: &str,
    ) -> Result<Option<ProviderCustomer>> {
        let matches = self.client.list_customers_by_email(email).await?;

        match matches.len() {
            0 => Ok(None),
            1 => Ok(matches.into_iter().next()),
            n => {
                let mut correlated: Vec<ProviderCustomer> = matches
                    .into_iter()
                    .filter(|c| c.user_id.as_deref() == Some(user_id))
                    .collect();

                if correlated.len() == 1 {
                    return Ok(correlated.pop());
                }

                Err(PaysyncError::IdentityConflict {
                    user_id: user_id.to_string(),
                    detail: format!(
                        "{} provider customers match email and {} carry the user's metadata",
                        n,
                        correlated.len()
                    ),
                })
            }
        }
    }
}
