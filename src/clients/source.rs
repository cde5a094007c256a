//! HTTP monitor source.
//!
//! Queries an external watcher service for new content. The service contract
//! is `GET {base}/check` with the monitor's identity as query parameters,
//! answering `{items: [{content_id, title, payload}]}`.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Client, Url};
use serde::Deserialize;

use crate::store::models::Monitor;
use crate::trigger::monitor::{MonitorSource, SourceItem};
use crate::util::error::{CoreError, CoreResult};

#[derive(Debug, Deserialize)]
struct CheckResponse {
    items: Vec<SourceItem>,
}

#[derive(Debug, Clone)]
pub struct HttpMonitorSource {
    client: Client,
    base_url: Url,
}

impl HttpMonitorSource {
    pub fn new(base_url: impl Into<String>, timeout: Duration) -> CoreResult<Self> {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| CoreError::permanent(format!("failed to build source client: {e}")))?;
        let base_url = Url::parse(&base_url.into())
            .map_err(|e| CoreError::bad_request(format!("invalid monitor source URL: {e}")))?;
        Ok(Self { client, base_url })
    }
}

#[async_trait]
impl MonitorSource for HttpMonitorSource {
    async fn fetch(&self, monitor: &Monitor) -> CoreResult<Vec<SourceItem>> {
        let mut url = self
            .base_url
            .join("check")
            .map_err(|e| CoreError::bad_request(format!("invalid monitor source URL: {e}")))?;
        url.query_pairs_mut()
            .append_pair("platform", &monitor.platform)
            .append_pair("type", monitor.monitor_type.as_str())
            .append_pair("target", &monitor.target_identifier);

        let response = self.client.get(url).send().await?.error_for_status()?;
        let body: CheckResponse = response
            .json()
            .await
            .map_err(|e| CoreError::transient(format!("monitor source decode: {e}")))?;
        Ok(body.items)
    }
}
