//! DigitalOcean droplet + SSH key API client.
//!
//! Idempotent calls (GET/DELETE) go through a `reqwest-middleware` stack that
//! retries transient failures. Creation calls do not: a replayed POST can
//! leave a second droplet nobody is billed for.

use std::collections::BTreeSet;
use std::time::Duration;

use async_trait::async_trait;
use rand::seq::IteratorRandom;
use reqwest::StatusCode;
use reqwest_middleware::{ClientBuilder, ClientWithMiddleware};
use reqwest_retry::{policies::ExponentialBackoff, RetryTransientMiddleware};
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::{debug, info, warn};

use super::{CloudProvider, CreatedInstance, InstanceRequest, InstanceStatus, ProviderError};

pub const DEFAULT_API_URL: &str = "https://api.digitalocean.com/v2";

#[derive(Debug, Clone)]
pub struct DigitalOceanSettings {
    pub api_url: String,
    pub api_token: String,
    /// Total creation attempts when the caller asked for a random region.
    pub region_retry_limit: u32,
}

pub struct DigitalOceanClient {
    client: ClientWithMiddleware,
    plain: reqwest::Client,
    settings: DigitalOceanSettings,
}

// ── Wire types ────────────────────────────────────────────────

#[derive(Deserialize)]
struct RegionsResponse {
    regions: Vec<Region>,
}

#[derive(Deserialize)]
struct Region {
    slug: String,
    #[serde(default = "default_available")]
    available: bool,
}

fn default_available() -> bool {
    true
}

#[derive(Deserialize)]
struct SshKeyEnvelope {
    ssh_key: SshKey,
}

#[derive(Deserialize)]
struct SshKey {
    id: i64,
}

#[derive(Deserialize)]
struct DropletEnvelope {
    droplet: Droplet,
}

#[derive(Deserialize)]
struct Droplet {
    id: i64,
    name: String,
    #[serde(default)]
    status: String,
    #[serde(default)]
    networks: Networks,
}

#[derive(Deserialize, Default)]
struct Networks {
    #[serde(default)]
    v4: Vec<NetworkV4>,
}

#[derive(Deserialize)]
struct NetworkV4 {
    ip_address: String,
    #[serde(rename = "type")]
    kind: String,
}

impl Droplet {
    fn public_ipv4(&self) -> Option<String> {
        self.networks
            .v4
            .iter()
            .find(|n| n.kind == "public")
            .map(|n| n.ip_address.clone())
    }
}

// ── Client ────────────────────────────────────────────────────

impl DigitalOceanClient {
    pub fn new(settings: DigitalOceanSettings) -> anyhow::Result<Self> {
        let plain = reqwest::Client::builder()
            .use_rustls_tls()
            .timeout(Duration::from_secs(30))
            .connect_timeout(Duration::from_secs(5))
            .build()?;

        // Retries: 3 times, exponential backoff
        let retry_policy = ExponentialBackoff::builder().build_with_max_retries(3);
        let client = ClientBuilder::new(plain.clone())
            .with(RetryTransientMiddleware::new_with_policy(retry_policy))
            .build();

        Ok(Self {
            client,
            plain,
            settings,
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.settings.api_url.trim_end_matches('/'), path)
    }

    fn bearer(&self) -> String {
        format!("Bearer {}", self.settings.api_token)
    }

    async fn post_droplet(&self, body: &Value) -> Result<Droplet, ProviderError> {
        let resp = self
            .plain
            .post(self.url("/droplets"))
            .header(reqwest::header::AUTHORIZATION, self.bearer())
            .json(body)
            .send()
            .await
            .map_err(|e| ProviderError::Transport(e.to_string()))?;

        if !resp.status().is_success() {
            return Err(error_from_response(resp).await);
        }
        let envelope: DropletEnvelope = resp
            .json()
            .await
            .map_err(|e| ProviderError::Decode(e.to_string()))?;
        Ok(envelope.droplet)
    }

    async fn delete(&self, path: &str) -> Result<(), ProviderError> {
        let resp = self
            .client
            .delete(self.url(path))
            .header(reqwest::header::AUTHORIZATION, self.bearer())
            .send()
            .await
            .map_err(|e| ProviderError::Transport(e.to_string()))?;

        if resp.status().is_success() {
            Ok(())
        } else {
            Err(error_from_response(resp).await)
        }
    }
}

#[async_trait]
impl CloudProvider for DigitalOceanClient {
    async fn list_datacenters(&self) -> Result<BTreeSet<String>, ProviderError> {
        let resp = self
            .client
            .get(self.url("/regions?per_page=200"))
            .header(reqwest::header::AUTHORIZATION, self.bearer())
            .send()
            .await
            .map_err(|e| ProviderError::Transport(e.to_string()))?;

        if !resp.status().is_success() {
            return Err(error_from_response(resp).await);
        }
        let body: RegionsResponse = resp
            .json()
            .await
            .map_err(|e| ProviderError::Decode(e.to_string()))?;

        Ok(body
            .regions
            .into_iter()
            .filter(|r| r.available)
            .map(|r| r.slug)
            .collect())
    }

    async fn register_key(&self, name: &str, public_key: &str) -> Result<i64, ProviderError> {
        let resp = self
            .plain
            .post(self.url("/account/keys"))
            .header(reqwest::header::AUTHORIZATION, self.bearer())
            .json(&json!({ "name": name, "public_key": public_key }))
            .send()
            .await
            .map_err(|e| ProviderError::Transport(e.to_string()))?;

        if !resp.status().is_success() {
            return Err(error_from_response(resp).await);
        }
        let envelope: SshKeyEnvelope = resp
            .json()
            .await
            .map_err(|e| ProviderError::Decode(e.to_string()))?;
        debug!(key_id = envelope.ssh_key.id, name, "registered ssh key");
        Ok(envelope.ssh_key.id)
    }

    async fn delete_key(&self, key_id: i64) -> Result<(), ProviderError> {
        self.delete(&format!("/account/keys/{}", key_id)).await
    }

    async fn create_instance(
        &self,
        request: &InstanceRequest,
    ) -> Result<CreatedInstance, ProviderError> {
        let attempts_allowed = if request.reroll_region {
            self.settings.region_retry_limit.max(1)
        } else {
            1
        };
        let mut name = request.name.clone();
        let mut datacenter = request.datacenter.clone();
        let mut attempt = 0;

        loop {
            attempt += 1;
            let body = json!({
                "name": name,
                "region": datacenter,
                "size": request.size,
                "image": image_value(&request.image),
                "ssh_keys": [request.key_id],
            });

            match self.post_droplet(&body).await {
                Ok(droplet) => {
                    info!(
                        instance_id = droplet.id,
                        name = %droplet.name,
                        datacenter = %datacenter,
                        attempt,
                        "droplet creation accepted"
                    );
                    return Ok(CreatedInstance {
                        instance_id: droplet.id,
                        name: droplet.name,
                        datacenter,
                    });
                }
                Err(e) if attempt < attempts_allowed => {
                    let available = self.list_datacenters().await?;
                    let next = available
                        .iter()
                        .choose(&mut rand::thread_rng())
                        .cloned()
                        .ok_or_else(|| {
                            ProviderError::Decode("provider reported no available regions".into())
                        })?;
                    warn!(
                        failed_region = %datacenter,
                        next_region = %next,
                        attempt,
                        error = %e,
                        "droplet creation failed, retrying in another region"
                    );
                    name = reroll_name(&name, &datacenter, &next);
                    datacenter = next;
                }
                Err(e) if request.reroll_region => {
                    return Err(ProviderError::RegionsExhausted {
                        attempts: attempt,
                        last: e.to_string(),
                    })
                }
                Err(e) => return Err(e),
            }
        }
    }

    async fn get_instance_status(&self, instance_id: i64) -> Result<InstanceStatus, ProviderError> {
        let resp = self
            .client
            .get(self.url(&format!("/droplets/{}", instance_id)))
            .header(reqwest::header::AUTHORIZATION, self.bearer())
            .send()
            .await
            .map_err(|e| ProviderError::Transport(e.to_string()))?;

        if !resp.status().is_success() {
            return Err(error_from_response(resp).await);
        }
        let envelope: DropletEnvelope = resp
            .json()
            .await
            .map_err(|e| ProviderError::Decode(e.to_string()))?;

        Ok(InstanceStatus {
            public_ipv4: envelope.droplet.public_ipv4(),
            status: envelope.droplet.status,
        })
    }

    async fn delete_instance(&self, instance_id: i64) -> Result<(), ProviderError> {
        self.delete(&format!("/droplets/{}", instance_id)).await
    }
}

/// DigitalOcean error bodies look like `{"id": "...", "message": "..."}`.
async fn error_from_response(resp: reqwest::Response) -> ProviderError {
    let status = resp.status();
    let message = match resp.json::<Value>().await {
        Ok(body) => body
            .get("message")
            .and_then(Value::as_str)
            .map(str::to_string)
            .unwrap_or_else(|| body.to_string()),
        Err(_) => status.canonical_reason().unwrap_or("unknown error").to_string(),
    };

    if status == StatusCode::NOT_FOUND {
        ProviderError::NotFound(message)
    } else {
        ProviderError::Api {
            status: status.as_u16(),
            message,
        }
    }
}

/// Image ids are numeric for snapshots and strings for public slugs.
fn image_value(image: &str) -> Value {
    image
        .parse::<i64>()
        .map(Value::from)
        .unwrap_or_else(|_| Value::from(image))
}

/// Swap the trailing datacenter of an endpoint name for a new one.
pub fn reroll_name(name: &str, old_datacenter: &str, new_datacenter: &str) -> String {
    match name.strip_suffix(old_datacenter) {
        Some(prefix) => format!("{}{}", prefix, new_datacenter),
        None => name.to_string(),
    }
}
