use std::sync::Arc;

use async_trait::async_trait;
use chrono::Duration;
use rust_decimal::Decimal;
use sqlx::PgPool;

use super::{ChargeOutcome, LedgerStore};
use crate::clock::Clock;
use crate::errors::{AppError, Result};
use crate::models::endpoint::NewEndpoint;
use crate::models::token::{generate_secret, validate_new_token};
use crate::models::{Endpoint, Token};

const TOKEN_COLUMNS: &str =
    "id, is_admin, funds_available, expiration, endpoint_count, created_at";
const ENDPOINT_COLUMNS: &str = "instance_id, token_id, name, datacenter, server_ip, created_at";

#[derive(Clone)]
pub struct PgStore {
    pool: PgPool,
    clock: Arc<dyn Clock>,
}

impl PgStore {
    pub async fn connect(database_url: &str, clock: Arc<dyn Clock>) -> anyhow::Result<Self> {
        let pool = PgPool::connect(database_url).await?;
        Ok(Self { pool, clock })
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Run pending migrations from the migrations/ directory.
    pub async fn migrate(&self) -> anyhow::Result<()> {
        sqlx::migrate!("./migrations").run(&self.pool).await?;
        Ok(())
    }

    /// Lock the token row for the rest of `tx`.
    async fn lock_token(
        tx: &mut sqlx::Transaction<'_, sqlx::Postgres>,
        token_id: &str,
    ) -> Result<Token> {
        let sql = format!("SELECT {} FROM tokens WHERE id = $1 FOR UPDATE", TOKEN_COLUMNS);
        sqlx::query_as::<_, Token>(&sql)
            .bind(token_id)
            .fetch_optional(&mut **tx)
            .await?
            .ok_or_else(|| AppError::not_found("token"))
    }
}

#[async_trait]
impl LedgerStore for PgStore {
    async fn create_token(
        &self,
        is_admin: bool,
        initial_funds: Decimal,
        ttl_days: i64,
    ) -> Result<Token> {
        validate_new_token(initial_funds, ttl_days)?;
        let now = self.clock.now();
        let sql = format!(
            r#"INSERT INTO tokens (id, is_admin, funds_available, expiration, endpoint_count, created_at)
               VALUES ($1, $2, $3, $4, 0, $5)
               RETURNING {}"#,
            TOKEN_COLUMNS
        );
        let token = sqlx::query_as::<_, Token>(&sql)
            .bind(generate_secret())
            .bind(is_admin)
            .bind(initial_funds)
            .bind(now + Duration::days(ttl_days))
            .bind(now)
            .fetch_one(&self.pool)
            .await?;
        Ok(token)
    }

    async fn get_token(&self, token_id: &str) -> Result<Token> {
        let sql = format!("SELECT {} FROM tokens WHERE id = $1", TOKEN_COLUMNS);
        sqlx::query_as::<_, Token>(&sql)
            .bind(token_id)
            .fetch_optional(&self.pool)
            .await?
            .ok_or_else(|| AppError::not_found("token"))
    }

    async fn list_tokens(&self, offset: i64, limit: i64) -> Result<Vec<Token>> {
        let sql = format!(
            "SELECT {} FROM tokens ORDER BY created_at ASC, id ASC OFFSET $1 LIMIT $2",
            TOKEN_COLUMNS
        );
        let rows = sqlx::query_as::<_, Token>(&sql)
            .bind(offset.max(0))
            .bind(limit.max(0))
            .fetch_all(&self.pool)
            .await?;
        Ok(rows)
    }

    async fn adjust_funds(&self, token_id: &str, delta: Decimal) -> Result<Token> {
        let mut tx = self.pool.begin().await?;
        let token = Self::lock_token(&mut tx, token_id).await?;

        let next = token.funds_available + delta;
        if next < Decimal::ZERO {
            return Err(AppError::InsufficientFunds);
        }

        let sql = format!(
            "UPDATE tokens SET funds_available = $2 WHERE id = $1 RETURNING {}",
            TOKEN_COLUMNS
        );
        let updated = sqlx::query_as::<_, Token>(&sql)
            .bind(token_id)
            .bind(next)
            .fetch_one(&mut *tx)
            .await?;
        tx.commit().await?;
        Ok(updated)
    }

    async fn charge_usage(
        &self,
        token_id: &str,
        per_endpoint_charge: Decimal,
    ) -> Result<ChargeOutcome> {
        let mut tx = self.pool.begin().await?;
        let token = Self::lock_token(&mut tx, token_id).await?;

        let charge = per_endpoint_charge * Decimal::from(token.endpoint_count);
        if token.funds_available - charge < Decimal::ZERO {
            tx.rollback().await?;
            return Ok(ChargeOutcome::Depleted { token, charge });
        }

        let sql = format!(
            "UPDATE tokens SET funds_available = funds_available - $2 WHERE id = $1 RETURNING {}",
            TOKEN_COLUMNS
        );
        let updated = sqlx::query_as::<_, Token>(&sql)
            .bind(token_id)
            .bind(charge)
            .fetch_one(&mut *tx)
            .await?;
        tx.commit().await?;
        Ok(ChargeOutcome::Debited {
            token: updated,
            charge,
        })
    }

    async fn recompute_endpoint_count(&self, token_id: &str) -> Result<i32> {
        // Single statement: the UPDATE row lock serializes it with debits.
        let count = sqlx::query_scalar::<_, i32>(
            r#"UPDATE tokens
               SET endpoint_count = (SELECT COUNT(*)::INT FROM endpoints WHERE token_id = $1)
               WHERE id = $1
               RETURNING endpoint_count"#,
        )
        .bind(token_id)
        .fetch_optional(&self.pool)
        .await?
        .ok_or_else(|| AppError::not_found("token"))?;
        Ok(count)
    }

    async fn insert_endpoint(&self, endpoint: NewEndpoint) -> Result<Endpoint> {
        let mut tx = self.pool.begin().await?;
        Self::lock_token(&mut tx, &endpoint.token_id).await?;

        let sql = format!(
            r#"INSERT INTO endpoints (instance_id, token_id, name, datacenter, server_ip, created_at)
               VALUES ($1, $2, $3, $4, $5, $6)
               ON CONFLICT DO NOTHING
               RETURNING {}"#,
            ENDPOINT_COLUMNS
        );
        let row = sqlx::query_as::<_, Endpoint>(&sql)
            .bind(endpoint.instance_id)
            .bind(&endpoint.token_id)
            .bind(&endpoint.name)
            .bind(&endpoint.datacenter)
            .bind(&endpoint.server_ip)
            .bind(self.clock.now())
            .fetch_optional(&mut *tx)
            .await?;

        let Some(row) = row else {
            tx.rollback().await?;
            return Err(AppError::Conflict(format!(
                "endpoint '{}' (instance {}) already recorded",
                endpoint.name, endpoint.instance_id
            )));
        };
        tx.commit().await?;
        Ok(row)
    }

    async fn list_endpoints(&self, token_id: &str) -> Result<Vec<Endpoint>> {
        let sql = format!(
            "SELECT {} FROM endpoints WHERE token_id = $1 ORDER BY created_at ASC, instance_id ASC",
            ENDPOINT_COLUMNS
        );
        let rows = sqlx::query_as::<_, Endpoint>(&sql)
            .bind(token_id)
            .fetch_all(&self.pool)
            .await?;
        Ok(rows)
    }

    async fn find_endpoint(&self, token_id: &str, name: &str) -> Result<Option<Endpoint>> {
        let sql = format!(
            "SELECT {} FROM endpoints WHERE token_id = $1 AND name = $2",
            ENDPOINT_COLUMNS
        );
        let row = sqlx::query_as::<_, Endpoint>(&sql)
            .bind(token_id)
            .bind(name)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row)
    }

    async fn delete_endpoint_record(&self, instance_id: i64) -> Result<bool> {
        let result = sqlx::query("DELETE FROM endpoints WHERE instance_id = $1")
            .bind(instance_id)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn delete_token_record(&self, token_id: &str) -> Result<()> {
        let mut tx = self.pool.begin().await?;
        Self::lock_token(&mut tx, token_id).await?;

        let remaining = sqlx::query_scalar::<_, i64>(
            "SELECT COUNT(*) FROM endpoints WHERE token_id = $1",
        )
        .bind(token_id)
        .fetch_one(&mut *tx)
        .await?;
        if remaining > 0 {
            tx.rollback().await?;
            return Err(AppError::Conflict(format!(
                "token still owns {} endpoint(s)",
                remaining
            )));
        }

        sqlx::query("DELETE FROM tokens WHERE id = $1")
            .bind(token_id)
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;
        Ok(())
    }
}
