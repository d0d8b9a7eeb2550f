//! Host list push to the tenant registry

use crate::watcher::HostListener;
use crate::FirewallError;
use dormnet_common::{HostList, API_KEY_HEADER};
use reqwest::StatusCode;
use std::time::Duration;
use tokio::runtime::Handle;

/// Posts every new host list to the registry
pub struct HttpHostPush {
    client: reqwest::Client,
    url: String,
    api_key: String,
    runtime: Handle,
}

impl HttpHostPush {
    /// Push listener sending to `url`. Requests are driven on `runtime` from the
    /// notifier thread.
    pub fn new(url: impl Into<String>, api_key: impl Into<String>, runtime: Handle) -> Result<Self, FirewallError> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(10))
            .build()
            .map_err(|e| FirewallError::Push(e.to_string()))?;
        Ok(Self {
            client,
            url: url.into(),
            api_key: api_key.into(),
            runtime,
        })
    }
}

impl HostListener for HttpHostPush {
    fn hosts_updated(&self, hosts: &HostList) -> Result<(), FirewallError> {
        let request = self
            .client
            .post(&self.url)
            .header(API_KEY_HEADER, &self.api_key)
            .json(hosts)
            .send();
        let response = self
            .runtime
            .block_on(request)
            .map_err(|e| FirewallError::Push(format!("{}: {}", self.url, e)))?;

        match response.status() {
            StatusCode::OK => {
                tracing::debug!("pushed {} hosts", hosts.len());
                Ok(())
            }
            StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => {
                Err(FirewallError::Push("incorrect API key".into()))
            }
            status => Err(FirewallError::Push(format!("unexpected response status {status}"))),
        }
    }
}
