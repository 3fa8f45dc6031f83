pub mod digital_ocean;

use std::collections::BTreeSet;

use async_trait::async_trait;
use thiserror::Error;

/// Remote API failures, already translated out of provider-specific codes.
#[derive(Debug, Error)]
pub enum ProviderError {
    #[error("provider API returned {status}: {message}")]
    Api { status: u16, message: String },

    #[error("remote resource not found: {0}")]
    NotFound(String),

    #[error("transport error: {0}")]
    Transport(String),

    #[error("unexpected provider response: {0}")]
    Decode(String),

    #[error("instance creation failed in every region tried ({attempts} attempts): {last}")]
    RegionsExhausted { attempts: u32, last: String },
}

#[derive(Debug, Clone, PartialEq)]
pub struct InstanceRequest {
    pub name: String,
    pub key_id: i64,
    pub datacenter: String,
    pub image: String,
    pub size: String,
    /// The caller asked for any region: on failure the client may retry elsewhere.
    pub reroll_region: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub struct CreatedInstance {
    pub instance_id: i64,
    /// Name the provider actually stored (rewritten if the region was rerolled).
    pub name: String,
    pub datacenter: String,
}

#[derive(Debug, Clone, PartialEq)]
pub struct InstanceStatus {
    pub status: String,
    pub public_ipv4: Option<String>,
}

impl InstanceStatus {
    pub fn is_active(&self) -> bool {
        self.status == "active"
    }
}

/// Compute + key API of a cloud provider.
/// Implementations: DigitalOceanClient.
#[async_trait]
pub trait CloudProvider: Send + Sync {
    /// Region slugs currently accepting new instances.
    async fn list_datacenters(&self) -> Result<BTreeSet<String>, ProviderError>;

    /// Store an SSH public key, returning the provider's key reference.
    async fn register_key(&self, name: &str, public_key: &str) -> Result<i64, ProviderError>;

    async fn delete_key(&self, key_id: i64) -> Result<(), ProviderError>;

    async fn create_instance(
        &self,
        request: &InstanceRequest,
    ) -> Result<CreatedInstance, ProviderError>;

    async fn get_instance_status(&self, instance_id: i64) -> Result<InstanceStatus, ProviderError>;

    /// Returns `ProviderError::NotFound` if the instance is already gone.
    async fn delete_instance(&self, instance_id: i64) -> Result<(), ProviderError>;
}
