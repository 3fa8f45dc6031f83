use std::str::FromStr;
use std::time::Duration;

use rust_decimal::Decimal;

/// Droplet price (USD/hour) for the `s-1vcpu-1gb` size.
pub const DEFAULT_PROVIDER_HOURLY_RATE: &str = "0.00893";
pub const DEFAULT_MARKUP: &str = "2";

/// What one endpoint costs its token.
///
/// `per_minute = provider_hourly_rate × markup / 60`
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BillingRate {
    pub provider_hourly_rate: Decimal,
    pub markup: Decimal,
}

impl Default for BillingRate {
    fn default() -> Self {
        Self {
            provider_hourly_rate: Decimal::from_str(DEFAULT_PROVIDER_HOURLY_RATE)
                .unwrap_or(Decimal::ZERO),
            markup: Decimal::from_str(DEFAULT_MARKUP).unwrap_or(Decimal::ONE),
        }
    }
}

impl BillingRate {
    /// A rate that charges exactly `per_minute` per endpoint-minute.
    pub fn per_minute_of(per_minute: Decimal) -> Self {
        Self {
            provider_hourly_rate: per_minute * Decimal::from(60),
            markup: Decimal::ONE,
        }
    }

    pub fn hourly(&self) -> Decimal {
        self.provider_hourly_rate * self.markup
    }

    pub fn per_minute(&self) -> Decimal {
        self.hourly() / Decimal::from(60)
    }

    pub fn daily(&self) -> Decimal {
        self.hourly() * Decimal::from(24)
    }

    /// Charge per endpoint for one billing period of the given length.
    pub fn per_period(&self, period: Duration) -> Decimal {
        self.per_minute() * Decimal::from(period.as_secs()) / Decimal::from(60)
    }

    /// Days until `funds` run out at the current endpoint count.
    /// `None` when nothing is being billed.
    pub fn estimate_depletion_days(&self, funds: Decimal, endpoint_count: i32) -> Option<Decimal> {
        if endpoint_count <= 0 {
            return None;
        }
        let daily_cost = self.daily() * Decimal::from(endpoint_count);
        if daily_cost.is_zero() {
            return None;
        }
        Some((funds / daily_cost).round_dp(2))
    }
}
