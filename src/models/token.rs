use chrono::{DateTime, Utc};
use rand::rngs::OsRng;
use rand::RngCore;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::errors::{AppError, Result};

/// Number of trailing token characters embedded in endpoint names.
pub const NAME_SUFFIX_LEN: usize = 6;

/// An access credential that doubles as a prepaid balance.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, sqlx::FromRow)]
pub struct Token {
    pub id: String,
    pub is_admin: bool,
    pub funds_available: Decimal,
    pub expiration: DateTime<Utc>,
    pub endpoint_count: i32,
    pub created_at: DateTime<Utc>,
}

impl Token {
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        now > self.expiration
    }

    /// Last few characters of the secret, used to label the token's endpoints.
    pub fn name_suffix(&self) -> &str {
        let start = self
            .id
            .char_indices()
            .rev()
            .nth(NAME_SUFFIX_LEN - 1)
            .map(|(i, _)| i)
            .unwrap_or(0);
        &self.id[start..]
    }
}

/// 32 random bytes from the OS RNG, hex encoded.
pub fn generate_secret() -> String {
    let mut random_bytes = [0u8; 32];
    OsRng.fill_bytes(&mut random_bytes);
    hex::encode(random_bytes)
}

pub fn validate_new_token(initial_funds: Decimal, ttl_days: i64) -> Result<()> {
    if initial_funds.is_sign_negative() {
        return Err(AppError::Validation(
            "initial funds must not be negative".to_string(),
        ));
    }
    if ttl_days < 0 {
        return Err(AppError::Validation(
            "days_till_expiration must not be negative".to_string(),
        ));
    }
    // chrono panics on absurd durations
    if ttl_days > 36_500 {
        return Err(AppError::Validation(
            "days_till_expiration must be at most 36500".to_string(),
        ));
    }
    Ok(())
}
