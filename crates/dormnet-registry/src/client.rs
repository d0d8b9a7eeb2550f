//! Ruleset delivery to the firewall daemon
//!
//! `activate` only enqueues. A dispatch task drains the whole queue into one
//! request whenever the queue is non-empty and no batch is open. A ruleset that
//! has not been sent yet is replaced in place by a newer one for the same VLAN,
//! so each request carries at most one ruleset per VLAN.

use crate::{RegistryError, RegistryResult};
use async_trait::async_trait;
use dormnet_common::wire::encode_batch;
use dormnet_common::{HostList, VlanRuleset, API_KEY_HEADER, FIREWALL_API_PREFIX};
use parking_lot::{Mutex, RwLock};
use reqwest::StatusCode;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Registry side view of the firewall
pub trait FirewallLink: Send + Sync {
    /// Queue rulesets for delivery
    fn activate(&self, rulesets: Vec<VlanRuleset>);
    /// Hold deliveries until `finish_batch`
    fn start_batch(&self);
    /// Release held deliveries
    fn finish_batch(&self);
    /// Last known host list
    fn hosts(&self) -> HostList;
}

/// Holds a batch open until dropped
pub struct BatchGuard<'a> {
    link: &'a dyn FirewallLink,
}

impl<'a> BatchGuard<'a> {
    /// Open a batch on `link`
    pub fn new(link: &'a dyn FirewallLink) -> Self {
        link.start_batch();
        Self { link }
    }
}

impl Drop for BatchGuard<'_> {
    fn drop(&mut self) {
        self.link.finish_batch();
    }
}

/// Wire access to the firewall API
#[async_trait]
pub trait RulesetTransport: Send + Sync {
    /// Send one batch of rulesets
    async fn push_rulesets(&self, rulesets: &[VlanRuleset]) -> RegistryResult<()>;
    /// Fetch the current host list
    async fn fetch_hosts(&self) -> RegistryResult<HostList>;
}

/// HTTP transport to the firewall daemon
pub struct HttpTransport {
    client: reqwest::Client,
    base_url: String,
    api_key: String,
}

impl HttpTransport {
    /// Transport to the daemon at `base_url`, e.g. `http://10.0.0.1:8081`.
    /// Without `timeout` requests wait as long as the HTTP client's defaults allow.
    pub fn new(base_url: impl Into<String>, api_key: impl Into<String>, timeout: Option<Duration>) -> RegistryResult<Self> {
        let mut builder = reqwest::Client::builder();
        if let Some(timeout) = timeout {
            builder = builder.timeout(timeout);
        }
        let client = builder.build().map_err(|e| RegistryError::Sync(e.to_string()))?;
        Ok(Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            api_key: api_key.into(),
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}{}", self.base_url, FIREWALL_API_PREFIX, path)
    }
}

#[async_trait]
impl RulesetTransport for HttpTransport {
    async fn push_rulesets(&self, rulesets: &[VlanRuleset]) -> RegistryResult<()> {
        let body = encode_batch(rulesets)?;
        let response = self
            .client
            .post(self.url("/rules"))
            .header(API_KEY_HEADER, &self.api_key)
            .header(reqwest::header::CONTENT_TYPE, "application/json")
            .body(body)
            .send()
            .await
            .map_err(|e| RegistryError::Sync(e.to_string()))?;

        let status = response.status();
        let text = response.text().await.unwrap_or_default();
        match status {
            StatusCode::OK if text == "OK" => Ok(()),
            StatusCode::OK => Err(RegistryError::Sync(format!("unexpected response body: {text}"))),
            StatusCode::FORBIDDEN => Err(RegistryError::Sync("incorrect API key".into())),
            status => Err(RegistryError::Sync(format!("status {status}: {text}"))),
        }
    }

    async fn fetch_hosts(&self) -> RegistryResult<HostList> {
        let response = self
            .client
            .get(self.url("/hosts"))
            .header(API_KEY_HEADER, &self.api_key)
            .send()
            .await
            .map_err(|e| RegistryError::Sync(e.to_string()))?;
        if response.status() != StatusCode::OK {
            return Err(RegistryError::Sync(format!("status {}", response.status())));
        }
        response
            .json()
            .await
            .map_err(|e| RegistryError::Sync(e.to_string()))
    }
}

#[derive(Default)]
struct Queue {
    pending: Vec<VlanRuleset>,
    paused: bool,
    stopped: bool,
}

/// Batching, deduplicating ruleset sender
pub struct RulesetSyncClient {
    queue: Mutex<Queue>,
    wakeup: Notify,
    hosts: RwLock<HostList>,
    transport: Arc<dyn RulesetTransport>,
    dispatcher: Mutex<Option<JoinHandle<()>>>,
}

impl RulesetSyncClient {
    /// Pull the host list once and start the dispatch task.
    ///
    /// An unreachable firewall only logs a warning; it pushes its host list
    /// itself once it comes up.
    pub async fn connect(transport: Arc<dyn RulesetTransport>) -> Arc<Self> {
        let hosts = match transport.fetch_hosts().await {
            Ok(hosts) => {
                info!("fetched {} hosts from firewall", hosts.len());
                hosts
            }
            Err(e) => {
                warn!("could not fetch host list from firewall: {}", e);
                HostList::new()
            }
        };

        let client = Arc::new(Self {
            queue: Mutex::new(Queue::default()),
            wakeup: Notify::new(),
            hosts: RwLock::new(hosts),
            transport,
            dispatcher: Mutex::new(None),
        });
        let handle = tokio::spawn(client.clone().dispatch());
        *client.dispatcher.lock() = Some(handle);
        client
    }

    async fn dispatch(self: Arc<Self>) {
        loop {
            let notified = self.wakeup.notified();
            let batch = {
                let mut queue = self.queue.lock();
                if queue.stopped {
                    return;
                }
                if queue.paused || queue.pending.is_empty() {
                    None
                } else {
                    Some(std::mem::take(&mut queue.pending))
                }
            };

            let Some(batch) = batch else {
                notified.await;
                continue;
            };

            let vlans: Vec<i32> = batch.iter().map(|r| r.vlan).collect();
            match self.transport.push_rulesets(&batch).await {
                Ok(()) => debug!(?vlans, "rulesets delivered"),
                Err(e) => warn!(?vlans, "failed to deliver rulesets: {}", e),
            }
        }
    }

    /// Rulesets waiting for delivery
    pub fn pending(&self) -> Vec<VlanRuleset> {
        self.queue.lock().pending.clone()
    }

    /// Replace the cached host list
    pub fn update_hosts(&self, hosts: HostList) {
        debug!("host list updated ({} hosts)", hosts.len());
        *self.hosts.write() = hosts;
    }

    /// Stop dispatching. Queued rulesets are dropped.
    pub async fn shutdown(&self) {
        self.queue.lock().stopped = true;
        self.wakeup.notify_one();
        let handle = self.dispatcher.lock().take();
        if let Some(handle) = handle {
            let _ = handle.await;
        }
    }
}

impl FirewallLink for RulesetSyncClient {
    fn activate(&self, rulesets: Vec<VlanRuleset>) {
        let mut queue = self.queue.lock();
        for ruleset in rulesets {
            match queue.pending.iter_mut().find(|p| p.vlan == ruleset.vlan) {
                Some(slot) => *slot = ruleset,
                None => queue.pending.push(ruleset),
            }
        }
        self.wakeup.notify_one();
    }

    fn start_batch(&self) {
        self.queue.lock().paused = true;
    }

    fn finish_batch(&self) {
        self.queue.lock().paused = false;
        self.wakeup.notify_one();
    }

    fn hosts(&self) -> HostList {
        self.hosts.read().clone()
    }
}
