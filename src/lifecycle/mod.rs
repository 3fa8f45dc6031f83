//! Endpoint lifecycle: provisioning, teardown, and token cascade.
//!
//! Per endpoint:
//! `Requested → ProvisioningKey → ProvisioningInstance → WaitingActive → Ready`,
//! and later `Deleting → Deleted`. Remote resources are always released
//! before their ledger rows, and no ledger lock is held while waiting on the
//! provider.

pub mod instance_lease;
pub mod key_lease;
pub mod poll;
pub mod prepaid;

use std::collections::{BTreeSet, HashSet};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use futures::future::join_all;
use rand::seq::IteratorRandom;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use tracing::{debug, error, info, warn};

use crate::errors::{AppError, Result};
use crate::metrics;
use crate::models::endpoint::{endpoint_name, NewEndpoint};
use crate::models::{BillingRate, Endpoint, Token};
use crate::provider::{CloudProvider, InstanceRequest, ProviderError};
use crate::store::LedgerStore;

use instance_lease::InstanceLease;
use key_lease::KeyLease;
use poll::PollPolicy;
use prepaid::PrepaidHold;

pub const RANDOM_REGION: &str = "random";

/// Attempts at deleting a token row when endpoints keep appearing underneath.
const CASCADE_PASSES: u32 = 3;
const CASCADE_RETRY_DELAY: Duration = Duration::from_millis(50);
/// Attempts at recording an endpoint when a concurrent create took its name.
const NAME_ATTEMPTS: u32 = 32;

#[derive(Debug, Clone)]
pub struct LifecycleConfig {
    pub image: String,
    pub size: String,
    /// Billing minutes charged up front when an endpoint is requested.
    pub prepaid_minutes: Decimal,
    pub poll: PollPolicy,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EndpointState {
    Requested,
    ProvisioningKey,
    ProvisioningInstance,
    WaitingActive,
    Ready,
    Deleting,
    Deleted,
}

impl EndpointState {
    pub fn as_str(&self) -> &'static str {
        match self {
            EndpointState::Requested => "requested",
            EndpointState::ProvisioningKey => "provisioning_key",
            EndpointState::ProvisioningInstance => "provisioning_instance",
            EndpointState::WaitingActive => "waiting_active",
            EndpointState::Ready => "ready",
            EndpointState::Deleting => "deleting",
            EndpointState::Deleted => "deleted",
        }
    }
}

impl fmt::Display for EndpointState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct CreateEndpointRequest {
    pub region: String,
    pub ssh_pub_key: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ProvisionedEndpoint {
    pub server_ip: String,
    pub endpoint_name: String,
}

impl From<Endpoint> for ProvisionedEndpoint {
    fn from(e: Endpoint) -> Self {
        Self {
            server_ip: e.server_ip,
            endpoint_name: e.name,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct TokenStatus {
    pub endpoints: Vec<ProvisionedEndpoint>,
    pub funds: Decimal,
    /// Days until the balance runs out; null while nothing is billed.
    pub est_depletion: Option<Decimal>,
}

/// Resolve a requested region against the provider's available set.
/// Returns the concrete datacenter and whether it was picked at random.
pub fn resolve_region(requested: &str, available: &BTreeSet<String>) -> Result<(String, bool)> {
    if requested == RANDOM_REGION {
        let chosen = available
            .iter()
            .choose(&mut rand::thread_rng())
            .cloned()
            .ok_or_else(|| {
                AppError::Validation("No datacenters are currently available.".to_string())
            })?;
        return Ok((chosen, true));
    }

    if available.contains(requested) {
        Ok((requested.to_string(), false))
    } else {
        Err(AppError::Validation(format!(
            "Datacenter '{}' not available. Try 'random' or one of these: {:?}",
            requested,
            available.iter().collect::<Vec<_>>()
        )))
    }
}

pub struct EndpointManager {
    store: Arc<dyn LedgerStore>,
    provider: Arc<dyn CloudProvider>,
    rate: BillingRate,
    config: LifecycleConfig,
    /// Instances with a teardown in flight.
    teardowns: DashMap<i64, ()>,
}

/// Removes its instance from the in-flight set when dropped.
struct TeardownClaim<'a> {
    teardowns: &'a DashMap<i64, ()>,
    instance_id: i64,
}

impl Drop for TeardownClaim<'_> {
    fn drop(&mut self) {
        self.teardowns.remove(&self.instance_id);
    }
}

impl EndpointManager {
    pub fn new(
        store: Arc<dyn LedgerStore>,
        provider: Arc<dyn CloudProvider>,
        rate: BillingRate,
        config: LifecycleConfig,
    ) -> Self {
        Self {
            store,
            provider,
            rate,
            config,
            teardowns: DashMap::new(),
        }
    }

    pub fn store(&self) -> &Arc<dyn LedgerStore> {
        &self.store
    }

    pub fn rate(&self) -> BillingRate {
        self.rate
    }

    pub fn activation_charge(&self) -> Decimal {
        self.rate.per_minute() * self.config.prepaid_minutes
    }

    pub async fn list_datacenters(&self) -> Result<Vec<String>> {
        Ok(self.provider.list_datacenters().await?.into_iter().collect())
    }

    // ── Create ───────────────────────────────────────────────

    pub async fn create_endpoint(
        &self,
        token_id: &str,
        request: &CreateEndpointRequest,
    ) -> Result<ProvisionedEndpoint> {
        let token = self.store.get_token(token_id).await?;
        debug!(token = token.name_suffix(), region = %request.region, state = %EndpointState::Requested, "endpoint requested");
        if token.funds_available <= Decimal::ZERO {
            return Err(AppError::InsufficientFunds);
        }

        let available = self.provider.list_datacenters().await?;
        let (datacenter, random) = resolve_region(&request.region, &available)?;
        let public_key = request.ssh_pub_key.trim();
        if public_key.is_empty() {
            return Err(AppError::Validation("SSH public key required.".to_string()));
        }

        let hold =
            PrepaidHold::reserve(self.store.clone(), &token, self.activation_charge()).await?;

        let result = self.provision(&token, datacenter, random, public_key).await;
        match &result {
            Ok(_) => hold.settle(),
            Err(_) => hold.refund().await,
        }
        metrics::record_provisioning(result.is_ok());
        result
    }

    async fn provision(
        &self,
        token: &Token,
        datacenter: String,
        reroll_region: bool,
        public_key: &str,
    ) -> Result<ProvisionedEndpoint> {
        let name = self.next_endpoint_name(&token.id, &datacenter).await?;

        log_transition(&name, EndpointState::ProvisioningKey);
        let lease = KeyLease::register(self.provider.clone(), &name, public_key).await?;

        log_transition(&name, EndpointState::ProvisioningInstance);
        let created = self
            .provider
            .create_instance(&InstanceRequest {
                name: name.clone(),
                key_id: lease.key_id(),
                datacenter,
                image: self.config.image.clone(),
                size: self.config.size.clone(),
                reroll_region,
            })
            .await;
        lease.release().await;
        let created = created?;

        let instance = InstanceLease::new(self.provider.clone(), created.instance_id);

        log_transition(&created.name, EndpointState::WaitingActive);
        let status = match poll::wait_until_active(
            self.provider.as_ref(),
            instance.instance_id(),
            &self.config.poll,
        )
        .await
        {
            Ok(status) => status,
            Err(e) => {
                instance.discard().await;
                return Err(e);
            }
        };
        let Some(server_ip) = status.public_ipv4 else {
            instance.discard().await;
            return Err(ProviderError::Decode(format!(
                "instance {} has no public IPv4 address",
                created.instance_id
            ))
            .into());
        };

        log_transition(&created.name, EndpointState::Ready);
        let endpoint = match self
            .record_endpoint(token, created.instance_id, created.name, created.datacenter, server_ip)
            .await
        {
            Ok(endpoint) => endpoint,
            Err(e) => {
                instance.discard().await;
                return Err(e);
            }
        };
        instance.keep();

        // The row is committed; a stale count is corrected by the next recompute.
        if let Err(e) = self.store.recompute_endpoint_count(&token.id).await {
            warn!(
                token = token.name_suffix(),
                endpoint = %endpoint.name,
                error = %e,
                "endpoint recorded but count recompute failed"
            );
        }

        info!(
            endpoint = %endpoint.name,
            instance_id = endpoint.instance_id,
            server_ip = %endpoint.server_ip,
            "endpoint ready"
        );
        Ok(endpoint.into())
    }

    /// Insert the row, renaming if a concurrent create claimed the name first.
    async fn record_endpoint(
        &self,
        token: &Token,
        instance_id: i64,
        name: String,
        datacenter: String,
        server_ip: String,
    ) -> Result<Endpoint> {
        let mut name = name;
        let mut attempt = 0;
        loop {
            attempt += 1;
            let row = NewEndpoint {
                instance_id,
                token_id: token.id.clone(),
                name: name.clone(),
                datacenter: datacenter.clone(),
                server_ip: server_ip.clone(),
            };
            match self.store.insert_endpoint(row).await {
                Err(AppError::Conflict(reason)) if attempt < NAME_ATTEMPTS => {
                    debug!(endpoint = %name, reason = %reason, "endpoint name taken, renaming");
                    name = self.next_endpoint_name(&token.id, &datacenter).await?;
                }
                other => return other,
            }
        }
    }

    /// `{suffix}-{endpoint_count + 1}-{dc}`, skipping sequences the token already uses.
    async fn next_endpoint_name(&self, token_id: &str, datacenter: &str) -> Result<String> {
        let token = self.store.get_token(token_id).await?;
        let taken: HashSet<String> = self
            .store
            .list_endpoints(token_id)
            .await?
            .into_iter()
            .map(|e| e.name)
            .collect();

        let mut sequence = token.endpoint_count + 1;
        loop {
            let candidate = endpoint_name(token.name_suffix(), sequence, datacenter);
            if !taken.contains(&candidate) {
                return Ok(candidate);
            }
            sequence += 1;
        }
    }

    // ── Delete ───────────────────────────────────────────────

    /// Destroy one of the caller's endpoints by name.
    pub async fn delete_endpoint(&self, token_id: &str, endpoint_name: &str) -> Result<()> {
        let endpoint = self
            .store
            .find_endpoint(token_id, endpoint_name)
            .await?
            .ok_or_else(|| AppError::not_found("endpoint"))?;
        self.teardown(&endpoint).await
    }

    /// Tear down every endpoint the token owns, then the token itself.
    ///
    /// If any remote teardown fails the token row stays, so the next attempt
    /// (or billing tick) can retry without orphaning droplets.
    pub async fn delete_token(&self, token_id: &str) -> Result<()> {
        self.store.get_token(token_id).await?;

        let mut pass = 0;
        loop {
            pass += 1;
            let endpoints = self.store.list_endpoints(token_id).await?;
            let results = join_all(endpoints.iter().map(|e| self.teardown(e))).await;

            let mut first_error = None;
            for (endpoint, result) in endpoints.iter().zip(results) {
                match result {
                    // NotFound: someone else is already tearing it down.
                    Ok(()) | Err(AppError::NotFound(_)) => {}
                    Err(e) => {
                        error!(endpoint = %endpoint.name, instance_id = endpoint.instance_id, error = %e, "endpoint teardown failed");
                        first_error.get_or_insert(e);
                    }
                }
            }
            if let Some(e) = first_error {
                return Err(e);
            }

            match self.store.delete_token_record(token_id).await {
                Ok(()) => {
                    info!(endpoints = endpoints.len(), "token deleted");
                    return Ok(());
                }
                Err(AppError::Conflict(reason)) if pass < CASCADE_PASSES => {
                    debug!(pass, reason = %reason, "endpoints remain under token, retrying teardown");
                    tokio::time::sleep(CASCADE_RETRY_DELAY).await;
                }
                Err(e) => return Err(e),
            }
        }
    }

    async fn teardown(&self, endpoint: &Endpoint) -> Result<()> {
        let Some(_claim) = self.claim_teardown(endpoint.instance_id) else {
            return Err(AppError::not_found("endpoint"));
        };
        // Re-check under the claim: a teardown that just finished already removed the row.
        let still_recorded = self
            .store
            .find_endpoint(&endpoint.token_id, &endpoint.name)
            .await?
            .is_some_and(|e| e.instance_id == endpoint.instance_id);
        if !still_recorded {
            return Err(AppError::not_found("endpoint"));
        }

        log_transition(&endpoint.name, EndpointState::Deleting);
        match self.provider.delete_instance(endpoint.instance_id).await {
            Ok(()) => {}
            Err(ProviderError::NotFound(_)) => {
                warn!(instance_id = endpoint.instance_id, "instance already gone at provider")
            }
            Err(e) => return Err(e.into()),
        }

        self.store.delete_endpoint_record(endpoint.instance_id).await?;
        match self.store.recompute_endpoint_count(&endpoint.token_id).await {
            // A cascade may remove the token as soon as its last row is gone.
            Ok(_) | Err(AppError::NotFound(_)) => {}
            Err(e) => return Err(e),
        }
        log_transition(&endpoint.name, EndpointState::Deleted);
        metrics::record_teardown();
        Ok(())
    }

    fn claim_teardown(&self, instance_id: i64) -> Option<TeardownClaim<'_>> {
        match self.teardowns.entry(instance_id) {
            Entry::Occupied(_) => None,
            Entry::Vacant(slot) => {
                slot.insert(());
                Some(TeardownClaim {
                    teardowns: &self.teardowns,
                    instance_id,
                })
            }
        }
    }

    // ── Read ─────────────────────────────────────────────────

    pub async fn token_status(&self, token_id: &str) -> Result<TokenStatus> {
        let token = self.store.get_token(token_id).await?;
        let endpoints = self.store.list_endpoints(token_id).await?;
        let est_depletion = self
            .rate
            .estimate_depletion_days(token.funds_available, endpoints.len() as i32);

        Ok(TokenStatus {
            endpoints: endpoints.into_iter().map(ProvisionedEndpoint::from).collect(),
            funds: token.funds_available,
            est_depletion,
        })
    }
}

fn log_transition(endpoint: &str, state: EndpointState) {
    debug!(endpoint, state = %state, "endpoint state transition");
}
