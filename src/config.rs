use std::str::FromStr;
use std::time::Duration;

use rust_decimal::Decimal;

use crate::lifecycle::poll::PollPolicy;
use crate::lifecycle::LifecycleConfig;
use crate::models::billing::{DEFAULT_MARKUP, DEFAULT_PROVIDER_HOURLY_RATE};
use crate::models::BillingRate;
use crate::provider::digital_ocean::{DigitalOceanSettings, DEFAULT_API_URL};

#[derive(Debug, Clone)]
pub struct Config {
    pub port: u16,
    pub database_url: String,
    pub digitalocean_token: String,
    pub digitalocean_api_url: String,
    /// Droplet image (snapshot id or slug) every endpoint boots from.
    pub endpoint_image: String,
    pub endpoint_size: String,
    pub rate: BillingRate,
    pub billing_period: Duration,
    /// Minutes of usage reserved from the balance when an endpoint is requested.
    pub prepaid_minutes: Decimal,
    /// Tear down tokens past their expiration during billing.
    pub reap_expired: bool,
    pub provision_timeout: Duration,
    pub poll_interval: Duration,
    pub poll_max_interval: Duration,
    pub max_status_errors: u32,
    pub region_retry_limit: u32,
    pub dashboard_origin: String,
    pub json_logs: bool,
    pub production: bool,
}

impl Config {
    pub fn lifecycle(&self) -> LifecycleConfig {
        LifecycleConfig {
            image: self.endpoint_image.clone(),
            size: self.endpoint_size.clone(),
            prepaid_minutes: self.prepaid_minutes,
            poll: PollPolicy {
                initial_interval: self.poll_interval,
                max_interval: self.poll_max_interval,
                timeout: self.provision_timeout,
                max_consecutive_errors: self.max_status_errors,
            },
        }
    }

    pub fn digital_ocean(&self) -> DigitalOceanSettings {
        DigitalOceanSettings {
            api_url: self.digitalocean_api_url.clone(),
            api_token: self.digitalocean_token.clone(),
            region_retry_limit: self.region_retry_limit,
        }
    }
}

pub fn load() -> anyhow::Result<Config> {
    dotenvy::dotenv().ok();

    let production = std::env::var("YVPN_ENV")
        .or_else(|_| std::env::var("RUST_ENV"))
        .map(|v| v == "production")
        .unwrap_or(false);

    let digitalocean_token = std::env::var("DIGITALOCEAN_TOKEN").unwrap_or_default();
    let endpoint_image = std::env::var("ENDPOINT_IMAGE").unwrap_or_default();
    if production {
        if digitalocean_token.is_empty() {
            anyhow::bail!("DIGITALOCEAN_TOKEN must be set when YVPN_ENV=production");
        }
        if endpoint_image.is_empty() {
            anyhow::bail!("ENDPOINT_IMAGE must be set when YVPN_ENV=production");
        }
    } else if digitalocean_token.is_empty() {
        eprintln!("DIGITALOCEAN_TOKEN is not set; provider calls will be rejected.");
    }

    Ok(Config {
        port: env_or("YVPN_PORT", 8000),
        database_url: std::env::var("DATABASE_URL")
            .unwrap_or_else(|_| "postgres://localhost/yourvpn".into()),
        digitalocean_token,
        digitalocean_api_url: std::env::var("DIGITALOCEAN_API_URL")
            .unwrap_or_else(|_| DEFAULT_API_URL.into()),
        endpoint_image,
        endpoint_size: std::env::var("ENDPOINT_SIZE").unwrap_or_else(|_| "s-1vcpu-1gb".into()),
        rate: BillingRate {
            provider_hourly_rate: decimal_env(
                "YVPN_PROVIDER_HOURLY_RATE",
                DEFAULT_PROVIDER_HOURLY_RATE,
            )?,
            markup: decimal_env("YVPN_MARKUP", DEFAULT_MARKUP)?,
        },
        billing_period: Duration::from_secs(env_or("YVPN_BILLING_PERIOD_SECS", 60).max(1)),
        prepaid_minutes: decimal_env("YVPN_PREPAID_MINUTES", "1")?,
        reap_expired: env_or("YVPN_REAP_EXPIRED", true),
        provision_timeout: Duration::from_secs(env_or("YVPN_PROVISION_TIMEOUT_SECS", 300)),
        poll_interval: Duration::from_millis(env_or("YVPN_POLL_INTERVAL_MS", 1000)),
        poll_max_interval: Duration::from_millis(env_or("YVPN_POLL_MAX_INTERVAL_MS", 10_000)),
        max_status_errors: env_or("YVPN_MAX_STATUS_ERRORS", 3),
        region_retry_limit: env_or("YVPN_REGION_RETRY_LIMIT", 3),
        dashboard_origin: std::env::var("DASHBOARD_ORIGIN")
            .unwrap_or_else(|_| "http://localhost:3000".into()),
        json_logs: std::env::var("YVPN_LOG_FORMAT")
            .map(|v| v.eq_ignore_ascii_case("json"))
            .unwrap_or(false),
        production,
    })
}

fn env_or<T: FromStr>(key: &str, default: T) -> T {
    std::env::var(key)
        .ok()
        .and_then(|v| v.trim().parse().ok())
        .unwrap_or(default)
}

/// Money settings are refused rather than silently defaulted when malformed.
fn decimal_env(key: &str, default: &str) -> anyhow::Result<Decimal> {
    let raw = std::env::var(key).unwrap_or_else(|_| default.to_string());
    let value = Decimal::from_str(raw.trim())
        .map_err(|e| anyhow::anyhow!("{} is not a valid decimal ({}): {}", key, raw, e))?;
    if value.is_sign_negative() {
        anyhow::bail!("{} must not be negative", key);
    }
    Ok(value)
}
