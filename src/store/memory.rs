//! In-process ledger backed by `DashMap`.
//!
//! Used by the test suite and by `yvpn serve --ephemeral`. A token's balance
//! and count are mutated only while holding that token's map entry; lock
//! order is always tokens → endpoints.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::Duration;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use rust_decimal::Decimal;

use super::{ChargeOutcome, LedgerStore};
use crate::clock::Clock;
use crate::errors::{AppError, Result};
use crate::models::endpoint::NewEndpoint;
use crate::models::token::{generate_secret, validate_new_token};
use crate::models::{Endpoint, Token};

pub struct MemoryStore {
    tokens: DashMap<String, Token>,
    endpoints: DashMap<i64, Endpoint>,
    clock: Arc<dyn Clock>,
}

impl MemoryStore {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self {
            tokens: DashMap::new(),
            endpoints: DashMap::new(),
            clock,
        }
    }

    fn count_owned(&self, token_id: &str) -> i32 {
        self.endpoints
            .iter()
            .filter(|e| e.token_id == token_id)
            .count() as i32
    }
}

#[async_trait]
impl LedgerStore for MemoryStore {
    async fn create_token(
        &self,
        is_admin: bool,
        initial_funds: Decimal,
        ttl_days: i64,
    ) -> Result<Token> {
        validate_new_token(initial_funds, ttl_days)?;
        let now = self.clock.now();
        let token = Token {
            id: generate_secret(),
            is_admin,
            funds_available: initial_funds,
            expiration: now + Duration::days(ttl_days),
            endpoint_count: 0,
            created_at: now,
        };

        match self.tokens.entry(token.id.clone()) {
            Entry::Vacant(slot) => {
                slot.insert(token.clone());
                Ok(token)
            }
            Entry::Occupied(_) => Err(AppError::Conflict("token id collision".to_string())),
        }
    }

    async fn get_token(&self, token_id: &str) -> Result<Token> {
        self.tokens
            .get(token_id)
            .map(|t| t.value().clone())
            .ok_or_else(|| AppError::not_found("token"))
    }

    async fn list_tokens(&self, offset: i64, limit: i64) -> Result<Vec<Token>> {
        let mut tokens: Vec<Token> = self.tokens.iter().map(|t| t.value().clone()).collect();
        tokens.sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.id.cmp(&b.id)));
        Ok(tokens
            .into_iter()
            .skip(offset.max(0) as usize)
            .take(limit.max(0) as usize)
            .collect())
    }

    async fn adjust_funds(&self, token_id: &str, delta: Decimal) -> Result<Token> {
        let mut token = self
            .tokens
            .get_mut(token_id)
            .ok_or_else(|| AppError::not_found("token"))?;

        let next = token.funds_available + delta;
        if next < Decimal::ZERO {
            return Err(AppError::InsufficientFunds);
        }
        token.funds_available = next;
        Ok(token.clone())
    }

    async fn charge_usage(
        &self,
        token_id: &str,
        per_endpoint_charge: Decimal,
    ) -> Result<ChargeOutcome> {
        let mut token = self
            .tokens
            .get_mut(token_id)
            .ok_or_else(|| AppError::not_found("token"))?;

        let charge = per_endpoint_charge * Decimal::from(token.endpoint_count);
        if token.funds_available - charge >= Decimal::ZERO {
            token.funds_available -= charge;
            Ok(ChargeOutcome::Debited {
                token: token.clone(),
                charge,
            })
        } else {
            Ok(ChargeOutcome::Depleted {
                token: token.clone(),
                charge,
            })
        }
    }

    async fn recompute_endpoint_count(&self, token_id: &str) -> Result<i32> {
        let mut token = self
            .tokens
            .get_mut(token_id)
            .ok_or_else(|| AppError::not_found("token"))?;

        token.endpoint_count = self.count_owned(token_id);
        Ok(token.endpoint_count)
    }

    async fn insert_endpoint(&self, endpoint: NewEndpoint) -> Result<Endpoint> {
        // Held until the row is in, so a concurrent token delete cannot slip between.
        let _token = self
            .tokens
            .get_mut(&endpoint.token_id)
            .ok_or_else(|| AppError::not_found("token"))?;

        let name_taken = self
            .endpoints
            .iter()
            .any(|e| e.token_id == endpoint.token_id && e.name == endpoint.name);
        if name_taken {
            return Err(AppError::Conflict(format!(
                "endpoint name '{}' already in use",
                endpoint.name
            )));
        }

        let row = Endpoint {
            instance_id: endpoint.instance_id,
            token_id: endpoint.token_id,
            name: endpoint.name,
            datacenter: endpoint.datacenter,
            server_ip: endpoint.server_ip,
            created_at: self.clock.now(),
        };
        match self.endpoints.entry(row.instance_id) {
            Entry::Vacant(slot) => {
                slot.insert(row.clone());
                Ok(row)
            }
            Entry::Occupied(_) => Err(AppError::Conflict(format!(
                "instance {} already recorded",
                row.instance_id
            ))),
        }
    }

    async fn list_endpoints(&self, token_id: &str) -> Result<Vec<Endpoint>> {
        let mut rows: Vec<Endpoint> = self
            .endpoints
            .iter()
            .filter(|e| e.token_id == token_id)
            .map(|e| e.value().clone())
            .collect();
        rows.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.instance_id.cmp(&b.instance_id)));
        Ok(rows)
    }

    async fn find_endpoint(&self, token_id: &str, name: &str) -> Result<Option<Endpoint>> {
        Ok(self
            .endpoints
            .iter()
            .find(|e| e.token_id == token_id && e.name == name)
            .map(|e| e.value().clone()))
    }

    async fn delete_endpoint_record(&self, instance_id: i64) -> Result<bool> {
        Ok(self.endpoints.remove(&instance_id).is_some())
    }

    async fn delete_token_record(&self, token_id: &str) -> Result<()> {
        match self.tokens.entry(token_id.to_string()) {
            Entry::Occupied(slot) => {
                if self.count_owned(token_id) > 0 {
                    return Err(AppError::Conflict(
                        "token still owns endpoints".to_string(),
                    ));
                }
                slot.remove();
                Ok(())
            }
            Entry::Vacant(_) => Err(AppError::not_found("token")),
        }
    }
}
