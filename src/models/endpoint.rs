use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A provisioned VPN endpoint: one droplet owned by one token.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, sqlx::FromRow)]
pub struct Endpoint {
    pub instance_id: i64,
    pub token_id: String,
    pub name: String,
    pub datacenter: String,
    pub server_ip: String,
    pub created_at: DateTime<Utc>,
}

/// Fields known once the droplet is active and before the row exists.
#[derive(Debug, Clone)]
pub struct NewEndpoint {
    pub instance_id: i64,
    pub token_id: String,
    pub name: String,
    pub datacenter: String,
    pub server_ip: String,
}

/// `{tokenSuffix}-{sequence}-{datacenter}`
pub fn endpoint_name(token_suffix: &str, sequence: i32, datacenter: &str) -> String {
    format!("{}-{}-{}", token_suffix, sequence, datacenter)
}
