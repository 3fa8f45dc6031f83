//! Waiting for a fresh droplet to report `active`.

use std::time::Duration;

use tokio::time::sleep;
use tracing::{debug, warn};

use crate::errors::AppError;
use crate::provider::{CloudProvider, InstanceStatus, ProviderError};

#[derive(Debug, Clone)]
pub struct PollPolicy {
    pub initial_interval: Duration,
    pub max_interval: Duration,
    /// Overall bound on the wait.
    pub timeout: Duration,
    /// Consecutive status-call failures tolerated before giving up.
    pub max_consecutive_errors: u32,
}

impl Default for PollPolicy {
    fn default() -> Self {
        Self {
            initial_interval: Duration::from_secs(1),
            max_interval: Duration::from_secs(10),
            timeout: Duration::from_secs(300),
            max_consecutive_errors: 3,
        }
    }
}

impl PollPolicy {
    /// initial × 2^attempt, capped at `max_interval`.
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let factor = 2u32.saturating_pow(attempt.min(16));
        self.initial_interval
            .saturating_mul(factor)
            .min(self.max_interval)
    }
}

/// Poll until the instance is active and return its last status.
///
/// Errors: `ProvisioningTimeout` once `policy.timeout` elapses,
/// `Provider` after too many consecutive status failures.
pub async fn wait_until_active(
    provider: &dyn CloudProvider,
    instance_id: i64,
    policy: &PollPolicy,
) -> Result<InstanceStatus, AppError> {
    match tokio::time::timeout(policy.timeout, poll(provider, instance_id, policy)).await {
        Ok(result) => result.map_err(AppError::from),
        Err(_) => Err(AppError::ProvisioningTimeout(format!(
            "instance {} not active after {:?}",
            instance_id, policy.timeout
        ))),
    }
}

async fn poll(
    provider: &dyn CloudProvider,
    instance_id: i64,
    policy: &PollPolicy,
) -> Result<InstanceStatus, ProviderError> {
    let mut attempt = 0u32;
    let mut consecutive_errors = 0u32;

    loop {
        match provider.get_instance_status(instance_id).await {
            Ok(status) if status.is_active() => return Ok(status),
            Ok(status) => {
                consecutive_errors = 0;
                debug!(instance_id, status = %status.status, attempt, "instance not active yet");
            }
            Err(e) => {
                consecutive_errors += 1;
                if consecutive_errors > policy.max_consecutive_errors {
                    return Err(e);
                }
                warn!(instance_id, error = %e, consecutive_errors, "instance status check failed");
            }
        }

        sleep(policy.delay_for_attempt(attempt)).await;
        attempt = attempt.saturating_add(1);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backoff_doubles_then_caps() {
        let policy = PollPolicy::default();
        assert_eq!(policy.delay_for_attempt(0), Duration::from_secs(1));
        assert_eq!(policy.delay_for_attempt(1), Duration::from_secs(2));
        assert_eq!(policy.delay_for_attempt(3), Duration::from_secs(8));
        assert_eq!(policy.delay_for_attempt(4), Duration::from_secs(10));
        assert_eq!(policy.delay_for_attempt(u32::MAX), Duration::from_secs(10));
    }
}
