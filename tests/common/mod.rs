//! Shared fixtures: an in-process cloud provider and a wired-up ledger.

#![allow(dead_code)]

use std::collections::{BTreeSet, HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{TimeZone, Utc};
use rust_decimal::Decimal;

use yourvpn::clock::{Clock, ManualClock};
use yourvpn::errors::{AppError, Result as AppResult};
use yourvpn::lifecycle::poll::PollPolicy;
use yourvpn::lifecycle::{CreateEndpointRequest, EndpointManager, LifecycleConfig};
use yourvpn::models::endpoint::NewEndpoint;
use yourvpn::models::{BillingRate, Endpoint, Token};
use yourvpn::provider::{
    CloudProvider, CreatedInstance, InstanceRequest, InstanceStatus, ProviderError,
};
use yourvpn::store::memory::MemoryStore;
use yourvpn::store::{ChargeOutcome, LedgerStore};

/// Cloud provider double. Instances become active on their first status
/// check unless told otherwise.
#[derive(Default)]
pub struct FakeProvider {
    pub datacenters: Mutex<BTreeSet<String>>,
    next_id: AtomicI64,
    instances: Mutex<HashMap<i64, InstanceRequest>>,
    live_keys: Mutex<HashSet<i64>>,
    deleted_instances: Mutex<Vec<i64>>,
    pub create_calls: AtomicUsize,
    pub fail_create: AtomicBool,
    pub never_active: AtomicBool,
    pub fail_status: AtomicBool,
    pub fail_delete: AtomicBool,
    pub omit_ip: AtomicBool,
}

impl FakeProvider {
    pub fn new(datacenters: &[&str]) -> Self {
        let provider = Self::default();
        provider.next_id.store(1000, Ordering::SeqCst);
        *provider.datacenters.lock().unwrap() = datacenters.iter().map(|s| s.to_string()).collect();
        provider
    }

    pub fn live_instances(&self) -> Vec<i64> {
        let mut ids: Vec<i64> = self.instances.lock().unwrap().keys().copied().collect();
        ids.sort();
        ids
    }

    pub fn live_keys(&self) -> usize {
        self.live_keys.lock().unwrap().len()
    }

    /// Every successful remote instance deletion, in order.
    pub fn deleted_instances(&self) -> Vec<i64> {
        self.deleted_instances.lock().unwrap().clone()
    }

    pub fn instance_request(&self, instance_id: i64) -> Option<InstanceRequest> {
        self.instances.lock().unwrap().get(&instance_id).cloned()
    }
}

#[async_trait]
impl CloudProvider for FakeProvider {
    async fn list_datacenters(&self) -> Result<BTreeSet<String>, ProviderError> {
        Ok(self.datacenters.lock().unwrap().clone())
    }

    async fn register_key(&self, _name: &str, public_key: &str) -> Result<i64, ProviderError> {
        if public_key.is_empty() {
            return Err(ProviderError::Api {
                status: 422,
                message: "public_key is required".into(),
            });
        }
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        self.live_keys.lock().unwrap().insert(id);
        Ok(id)
    }

    async fn delete_key(&self, key_id: i64) -> Result<(), ProviderError> {
        if self.live_keys.lock().unwrap().remove(&key_id) {
            Ok(())
        } else {
            Err(ProviderError::NotFound(format!("key {}", key_id)))
        }
    }

    async fn create_instance(
        &self,
        request: &InstanceRequest,
    ) -> Result<CreatedInstance, ProviderError> {
        self.create_calls.fetch_add(1, Ordering::SeqCst);
        if self.fail_create.load(Ordering::SeqCst) {
            return Err(ProviderError::Api {
                status: 422,
                message: "region is out of capacity".into(),
            });
        }
        tokio::task::yield_now().await;
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        self.instances.lock().unwrap().insert(id, request.clone());
        Ok(CreatedInstance {
            instance_id: id,
            name: request.name.clone(),
            datacenter: request.datacenter.clone(),
        })
    }

    async fn get_instance_status(&self, instance_id: i64) -> Result<InstanceStatus, ProviderError> {
        if self.fail_status.load(Ordering::SeqCst) {
            return Err(ProviderError::Transport("connection reset".into()));
        }
        if !self.instances.lock().unwrap().contains_key(&instance_id) {
            return Err(ProviderError::NotFound(format!("droplet {}", instance_id)));
        }
        if self.never_active.load(Ordering::SeqCst) {
            return Ok(InstanceStatus {
                status: "new".into(),
                public_ipv4: None,
            });
        }
        let public_ipv4 = if self.omit_ip.load(Ordering::SeqCst) {
            None
        } else {
            Some(format!("203.0.113.{}", instance_id % 250))
        };
        Ok(InstanceStatus {
            status: "active".into(),
            public_ipv4,
        })
    }

    async fn delete_instance(&self, instance_id: i64) -> Result<(), ProviderError> {
        if self.fail_delete.load(Ordering::SeqCst) {
            return Err(ProviderError::Api {
                status: 500,
                message: "internal error".into(),
            });
        }
        tokio::task::yield_now().await;
        if self.instances.lock().unwrap().remove(&instance_id).is_none() {
            return Err(ProviderError::NotFound(format!("droplet {}", instance_id)));
        }
        self.deleted_instances.lock().unwrap().push(instance_id);
        Ok(())
    }
}

pub struct Harness {
    pub clock: Arc<ManualClock>,
    pub store: Arc<MemoryStore>,
    pub provider: Arc<FakeProvider>,
    pub lifecycle: Arc<EndpointManager>,
}

pub fn fast_poll() -> PollPolicy {
    PollPolicy {
        initial_interval: Duration::from_millis(1),
        max_interval: Duration::from_millis(5),
        timeout: Duration::from_millis(200),
        max_consecutive_errors: 3,
    }
}

/// 0.1 per endpoint-minute, nothing prepaid.
pub fn harness() -> Harness {
    harness_with(BillingRate::per_minute_of(Decimal::new(1, 1)), Decimal::ZERO)
}

pub fn harness_with(rate: BillingRate, prepaid_minutes: Decimal) -> Harness {
    let clock = Arc::new(ManualClock::new(
        Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap(),
    ));
    let store = Arc::new(MemoryStore::new(clock.clone() as Arc<dyn Clock>));
    let provider = Arc::new(FakeProvider::new(&["ams3", "nyc1", "sfo3"]));
    let lifecycle = Arc::new(EndpointManager::new(
        store.clone() as Arc<dyn LedgerStore>,
        provider.clone() as Arc<dyn CloudProvider>,
        rate,
        LifecycleConfig {
            image: "wireguard-snapshot".into(),
            size: "s-1vcpu-1gb".into(),
            prepaid_minutes,
            poll: fast_poll(),
        },
    ));
    Harness {
        clock,
        store,
        provider,
        lifecycle,
    }
}

pub fn request(region: &str) -> CreateEndpointRequest {
    CreateEndpointRequest {
        region: region.to_string(),
        ssh_pub_key: "ssh-ed25519 AAAAC3NzaC1lZDI1NTE5AAAAIExample user@laptop".to_string(),
    }
}

/// Ledger whose endpoint-count recompute can be made to fail on demand.
pub struct FlakyCountStore {
    inner: Arc<MemoryStore>,
    pub fail_recompute: AtomicBool,
}

impl FlakyCountStore {
    pub fn new(inner: Arc<MemoryStore>) -> Self {
        Self {
            inner,
            fail_recompute: AtomicBool::new(false),
        }
    }
}

#[async_trait]
impl LedgerStore for FlakyCountStore {
    async fn create_token(&self, is_admin: bool, funds: Decimal, ttl_days: i64) -> AppResult<Token> {
        self.inner.create_token(is_admin, funds, ttl_days).await
    }

    async fn get_token(&self, token_id: &str) -> AppResult<Token> {
        self.inner.get_token(token_id).await
    }

    async fn list_tokens(&self, offset: i64, limit: i64) -> AppResult<Vec<Token>> {
        self.inner.list_tokens(offset, limit).await
    }

    async fn adjust_funds(&self, token_id: &str, delta: Decimal) -> AppResult<Token> {
        self.inner.adjust_funds(token_id, delta).await
    }

    async fn charge_usage(&self, token_id: &str, charge: Decimal) -> AppResult<ChargeOutcome> {
        self.inner.charge_usage(token_id, charge).await
    }

    async fn recompute_endpoint_count(&self, token_id: &str) -> AppResult<i32> {
        if self.fail_recompute.load(Ordering::SeqCst) {
            return Err(AppError::Internal(anyhow::anyhow!("connection reset by peer")));
        }
        self.inner.recompute_endpoint_count(token_id).await
    }

    async fn insert_endpoint(&self, endpoint: NewEndpoint) -> AppResult<Endpoint> {
        self.inner.insert_endpoint(endpoint).await
    }

    async fn list_endpoints(&self, token_id: &str) -> AppResult<Vec<Endpoint>> {
        self.inner.list_endpoints(token_id).await
    }

    async fn find_endpoint(&self, token_id: &str, name: &str) -> AppResult<Option<Endpoint>> {
        self.inner.find_endpoint(token_id, name).await
    }

    async fn delete_endpoint_record(&self, instance_id: i64) -> AppResult<bool> {
        self.inner.delete_endpoint_record(instance_id).await
    }

    async fn delete_token_record(&self, token_id: &str) -> AppResult<()> {
        self.inner.delete_token_record(token_id).await
    }
}
