//! The activation charge taken before provisioning starts.

use std::sync::Arc;

use rust_decimal::Decimal;
use tracing::warn;

use crate::errors::Result;
use crate::models::Token;
use crate::store::LedgerStore;

/// Funds reserved for a create in flight.
///
/// `settle` keeps the charge, `refund` returns it. Dropping the hold without
/// either returns it from a spawned task.
pub struct PrepaidHold {
    store: Arc<dyn LedgerStore>,
    token_id: String,
    suffix: String,
    amount: Decimal,
    settled: bool,
}

impl PrepaidHold {
    /// Debit `amount` now. A zero amount touches nothing.
    pub async fn reserve(
        store: Arc<dyn LedgerStore>,
        token: &Token,
        amount: Decimal,
    ) -> Result<Self> {
        if !amount.is_zero() {
            store.adjust_funds(&token.id, -amount).await?;
        }
        Ok(Self {
            store,
            token_id: token.id.clone(),
            suffix: token.name_suffix().to_string(),
            amount,
            settled: false,
        })
    }

    pub fn settle(mut self) {
        self.settled = true;
    }

    pub async fn refund(mut self) {
        self.settled = true;
        credit(self.store.as_ref(), &self.token_id, &self.suffix, self.amount).await;
    }
}

impl Drop for PrepaidHold {
    fn drop(&mut self) {
        if self.settled || self.amount.is_zero() {
            return;
        }
        let store = self.store.clone();
        let token_id = std::mem::take(&mut self.token_id);
        let suffix = std::mem::take(&mut self.suffix);
        let amount = self.amount;
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn(async move {
                    credit(store.as_ref(), &token_id, &suffix, amount).await;
                });
            }
            Err(_) => warn!(token = %suffix, %amount, "activation charge not refunded: no runtime"),
        }
    }
}

async fn credit(store: &dyn LedgerStore, token_id: &str, suffix: &str, amount: Decimal) {
    if amount.is_zero() {
        return;
    }
    if let Err(e) = store.adjust_funds(token_id, amount).await {
        warn!(token = suffix, %amount, error = %e, "could not refund activation charge");
    }
}
