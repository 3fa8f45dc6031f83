//! A created instance that has no ledger row yet.

use std::sync::Arc;

use tracing::{debug, error};

use crate::provider::{CloudProvider, ProviderError};

use super::EndpointState;

/// Owns a freshly created instance until it is recorded.
///
/// `keep` hands ownership to the ledger row; `discard` deletes the instance.
/// Dropping the lease without either (request cancelled, panic) deletes it
/// from a spawned task.
pub struct InstanceLease {
    provider: Arc<dyn CloudProvider>,
    instance_id: i64,
    settled: bool,
}

impl InstanceLease {
    pub fn new(provider: Arc<dyn CloudProvider>, instance_id: i64) -> Self {
        Self {
            provider,
            instance_id,
            settled: false,
        }
    }

    pub fn instance_id(&self) -> i64 {
        self.instance_id
    }

    /// The instance now belongs to a ledger row.
    pub fn keep(mut self) {
        self.settled = true;
    }

    /// Best-effort removal; a failed delete is logged with the orphaned id.
    pub async fn discard(mut self) {
        self.settled = true;
        delete_unrecorded(self.provider.as_ref(), self.instance_id).await;
    }
}

impl Drop for InstanceLease {
    fn drop(&mut self) {
        if self.settled {
            return;
        }
        let provider = self.provider.clone();
        let instance_id = self.instance_id;
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                debug!(instance_id, "create abandoned, deleting its instance");
                handle.spawn(async move {
                    delete_unrecorded(provider.as_ref(), instance_id).await;
                });
            }
            Err(_) => error!(
                instance_id,
                "instance orphaned at the provider: no runtime to delete it from"
            ),
        }
    }
}

async fn delete_unrecorded(provider: &dyn CloudProvider, instance_id: i64) {
    debug!(instance_id, state = %EndpointState::Deleting, "discarding unrecorded instance");
    match provider.delete_instance(instance_id).await {
        Ok(()) | Err(ProviderError::NotFound(_)) => {
            debug!(instance_id, state = %EndpointState::Deleted, "unrecorded instance deleted")
        }
        Err(e) => error!(
            instance_id,
            error = %e,
            "failed to delete unrecorded instance; it is orphaned at the provider"
        ),
    }
}
