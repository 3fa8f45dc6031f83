//! Background job: debit every token for its running endpoints.
//!
//! Runs once per billing period. Tokens that cannot cover the period, and
//! (optionally) tokens past their expiration, are torn down through the same
//! cascade an admin delete uses.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{self, Instant, MissedTickBehavior};
use tracing::{debug, error, info, warn};

use crate::clock::Clock;
use crate::errors::{AppError, Result};
use crate::lifecycle::EndpointManager;
use crate::metrics;
use crate::models::Token;
use crate::store::ChargeOutcome;

const PAGE_SIZE: i64 = 500;

/// Per-tick counts, one per token processed.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct TickReport {
    pub debited: usize,
    pub depleted: usize,
    pub expired: usize,
    pub failed: usize,
}

pub struct BillingScheduler {
    lifecycle: Arc<EndpointManager>,
    clock: Arc<dyn Clock>,
    period: Duration,
    reap_expired: bool,
}

/// Owns the running scheduler task.
pub struct BillingHandle {
    shutdown: watch::Sender<bool>,
    task: JoinHandle<()>,
}

impl BillingHandle {
    /// Signal the task and wait for it; an in-flight tick runs to completion.
    pub async fn stop(self) {
        let _ = self.shutdown.send(true);
        if let Err(e) = self.task.await {
            warn!(error = %e, "billing task ended abnormally");
        }
    }
}

impl BillingScheduler {
    pub fn new(
        lifecycle: Arc<EndpointManager>,
        clock: Arc<dyn Clock>,
        period: Duration,
        reap_expired: bool,
    ) -> Self {
        Self {
            lifecycle,
            clock,
            period,
            reap_expired,
        }
    }

    pub fn period(&self) -> Duration {
        self.period
    }

    /// Spawn the periodic task. The first tick fires one period after start.
    pub fn start(self: Arc<Self>) -> BillingHandle {
        let (shutdown, mut shutdown_rx) = watch::channel(false);
        let period = self.period;

        let task = tokio::spawn(async move {
            let mut interval = time::interval_at(Instant::now() + period, period);
            interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
            info!(period_secs = period.as_secs(), "billing scheduler started");

            loop {
                tokio::select! {
                    _ = interval.tick() => {
                        if let Err(e) = self.tick().await {
                            error!(error = %e, "billing tick failed");
                        }
                    }
                    _ = shutdown_rx.changed() => break,
                }
            }
            info!("billing scheduler stopped");
        });

        BillingHandle { shutdown, task }
    }

    /// One billing pass over the whole ledger.
    ///
    /// Only a failure to list tokens aborts the pass; per-token failures are
    /// logged and counted.
    pub async fn tick(&self) -> Result<TickReport> {
        let now = self.clock.now();
        let charge = self.lifecycle.rate().per_period(self.period);

        // Snapshot first: cascades remove rows and would shift later pages.
        let tokens = self.all_tokens().await?;
        let mut report = TickReport::default();
        for token in &tokens {
            self.bill_token(token, now, charge, &mut report).await;
        }

        metrics::record_billing_tick();
        info!(
            tokens = tokens.len(),
            debited = report.debited,
            depleted = report.depleted,
            expired = report.expired,
            failed = report.failed,
            "billing tick complete"
        );
        Ok(report)
    }

    async fn all_tokens(&self) -> Result<Vec<Token>> {
        let store = self.lifecycle.store();
        let mut tokens = Vec::new();
        let mut offset = 0;
        loop {
            let page = store.list_tokens(offset, PAGE_SIZE).await?;
            let fetched = page.len() as i64;
            tokens.extend(page);
            if fetched < PAGE_SIZE {
                return Ok(tokens);
            }
            offset += PAGE_SIZE;
        }
    }

    async fn bill_token(
        &self,
        token: &Token,
        now: DateTime<Utc>,
        per_endpoint_charge: Decimal,
        report: &mut TickReport,
    ) {
        let suffix = token.name_suffix();

        if self.reap_expired && token.is_expired(now) {
            match self.lifecycle.delete_token(&token.id).await {
                Ok(()) | Err(AppError::NotFound(_)) => {
                    info!(token = suffix, expiration = %token.expiration, "expired token reaped");
                    report.expired += 1;
                    metrics::record_billed_token("expired", Decimal::ZERO);
                }
                Err(e) => {
                    error!(token = suffix, error = %e, "failed to reap expired token");
                    report.failed += 1;
                    metrics::record_billed_token("failed", Decimal::ZERO);
                }
            }
            return;
        }

        match self
            .lifecycle
            .store()
            .charge_usage(&token.id, per_endpoint_charge)
            .await
        {
            Ok(ChargeOutcome::Debited { token, charge }) => {
                debug!(token = token.name_suffix(), charge = %charge, funds = %token.funds_available, "token debited");
                report.debited += 1;
                metrics::record_billed_token("billed", charge);
            }
            Ok(ChargeOutcome::Depleted { token, charge }) => {
                warn!(
                    token = token.name_suffix(),
                    charge = %charge,
                    funds = %token.funds_available,
                    endpoints = token.endpoint_count,
                    "funds depleted, tearing down token"
                );
                match self.lifecycle.delete_token(&token.id).await {
                    Ok(()) | Err(AppError::NotFound(_)) => {
                        report.depleted += 1;
                        metrics::record_billed_token("depleted", Decimal::ZERO);
                    }
                    Err(e) => {
                        error!(token = token.name_suffix(), error = %e, "failed to tear down depleted token");
                        report.failed += 1;
                        metrics::record_billed_token("failed", Decimal::ZERO);
                    }
                }
            }
            // Deleted between the listing and the debit.
            Err(AppError::NotFound(_)) => {
                debug!(token = suffix, "token vanished before billing");
            }
            Err(e) => {
                error!(token = suffix, error = %e, "failed to bill token");
                report.failed += 1;
                metrics::record_billed_token("failed", Decimal::ZERO);
            }
        }
    }
}
