//! A registered SSH key that must not outlive instance creation.

use std::sync::Arc;

use tracing::{debug, warn};

use crate::provider::{CloudProvider, ProviderError};

/// Holds a remote key reference until `release` is awaited.
///
/// If the owning future is dropped first (request cancelled, panic), the
/// key is deleted from a spawned task instead.
pub struct KeyLease {
    provider: Arc<dyn CloudProvider>,
    key_id: i64,
    released: bool,
}

impl KeyLease {
    pub async fn register(
        provider: Arc<dyn CloudProvider>,
        name: &str,
        public_key: &str,
    ) -> Result<Self, ProviderError> {
        let key_id = provider.register_key(name, public_key).await?;
        Ok(Self {
            provider,
            key_id,
            released: false,
        })
    }

    pub fn key_id(&self) -> i64 {
        self.key_id
    }

    /// Failure is logged, never propagated: the instance outcome matters more.
    pub async fn release(mut self) {
        self.released = true;
        match self.provider.delete_key(self.key_id).await {
            Ok(()) => debug!(key_id = self.key_id, "ssh key released"),
            Err(e) => warn!(key_id = self.key_id, error = %e, "failed to delete ssh key"),
        }
    }
}

impl Drop for KeyLease {
    fn drop(&mut self) {
        if self.released {
            return;
        }
        let provider = self.provider.clone();
        let key_id = self.key_id;
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn(async move {
                    if let Err(e) = provider.delete_key(key_id).await {
                        warn!(key_id, error = %e, "failed to delete abandoned ssh key");
                    }
                });
            }
            Err(_) => warn!(key_id, "ssh key leaked: no runtime to delete it from"),
        }
    }
}
