pub mod memory;
pub mod postgres;

use async_trait::async_trait;
use rust_decimal::Decimal;

use crate::errors::Result;
use crate::models::endpoint::NewEndpoint;
use crate::models::{Endpoint, Token};

/// Result of one billing debit against one token.
#[derive(Debug, Clone, PartialEq)]
pub enum ChargeOutcome {
    /// `charge` was taken; `token` is the post-debit state.
    Debited { token: Token, charge: Decimal },
    /// Funds do not cover `charge`; nothing was taken.
    Depleted { token: Token, charge: Decimal },
}

/// Persistent Token / Endpoint records.
///
/// Every mutation of a token's balance or endpoint count is serialized per
/// token. Implementations: PgStore (PostgreSQL, row locks), MemoryStore
/// (in-process, per-entry locks).
#[async_trait]
pub trait LedgerStore: Send + Sync {
    async fn create_token(
        &self,
        is_admin: bool,
        initial_funds: Decimal,
        ttl_days: i64,
    ) -> Result<Token>;

    /// `AppError::NotFound` when the token does not exist.
    async fn get_token(&self, token_id: &str) -> Result<Token>;

    /// Oldest first.
    async fn list_tokens(&self, offset: i64, limit: i64) -> Result<Vec<Token>>;

    /// Atomically add `delta` (may be negative) to the balance.
    /// `AppError::InsufficientFunds` if the result would drop below zero.
    async fn adjust_funds(&self, token_id: &str, delta: Decimal) -> Result<Token>;

    /// Debit `per_endpoint_charge × endpoint_count` if affordable, reading the
    /// count under the same lock as the balance.
    async fn charge_usage(&self, token_id: &str, per_endpoint_charge: Decimal)
        -> Result<ChargeOutcome>;

    /// Set `endpoint_count` to the number of live endpoint rows.
    async fn recompute_endpoint_count(&self, token_id: &str) -> Result<i32>;

    /// `AppError::NotFound` if the owning token is gone,
    /// `AppError::Conflict` if the token already holds that name.
    async fn insert_endpoint(&self, endpoint: NewEndpoint) -> Result<Endpoint>;

    async fn list_endpoints(&self, token_id: &str) -> Result<Vec<Endpoint>>;

    /// Ownership-scoped lookup.
    async fn find_endpoint(&self, token_id: &str, name: &str) -> Result<Option<Endpoint>>;

    /// Returns false if there was no such row.
    async fn delete_endpoint_record(&self, instance_id: i64) -> Result<bool>;

    /// Removes the token row only. `AppError::Conflict` while endpoints remain.
    async fn delete_token_record(&self, token_id: &str) -> Result<()>;
}
