//! Upload transport seam.
//!
//! The core never talks to a platform API directly; it hands fully resolved
//! publish metadata to a transport. The HTTP implementation posts the batch
//! wire format to an external uploader service; the mock implementation is
//! selected by configuration and scripted by tests.

use std::collections::VecDeque;
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::{Client, Url};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::util::error::{CoreError, CoreResult};

#[derive(Debug, Clone, Serialize)]
pub struct UploadVideo {
    pub path: String,
    pub title: String,
    pub description: String,
    pub tags: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub thumbnail: Option<String>,
    pub visibility: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct UploadRequest {
    pub uid: Uuid,
    pub profile_ref: String,
    pub video: UploadVideo,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum UploadStatus {
    #[serde(rename = "SUCCESS")]
    Success,
    #[serde(rename = "FAIL")]
    Fail,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UploadOutcome {
    pub uid: Uuid,
    pub status: UploadStatus,
    #[serde(default)]
    pub video_id: Option<String>,
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default)]
    pub error: Option<String>,
    #[serde(default)]
    pub retry_able: Option<bool>,
}

#[async_trait]
pub trait UploadTransport: Send + Sync {
    /// Upload a batch; one outcome per request uid. Transport-level failures
    /// (connect, timeout, 5xx) are errors; per-item failures come back as
    /// `FAIL` outcomes.
    async fn upload(&self, batch: Vec<UploadRequest>) -> CoreResult<Vec<UploadOutcome>>;
}

#[derive(Debug, Serialize)]
struct UploadBatchRequest {
    tasks: Vec<UploadRequest>,
}

#[derive(Debug, Deserialize)]
struct UploadBatchResponse {
    results: Vec<UploadOutcome>,
}

#[derive(Debug, Clone)]
pub struct HttpUploadTransport {
    client: Client,
    endpoint: Url,
}

impl HttpUploadTransport {
    pub fn new(endpoint: impl Into<String>, timeout: Duration) -> CoreResult<Self> {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| CoreError::permanent(format!("failed to build upload client: {e}")))?;
        let endpoint = Url::parse(&endpoint.into())
            .map_err(|e| CoreError::bad_request(format!("invalid upload endpoint: {e}")))?;
        Ok(Self { client, endpoint })
    }
}

#[async_trait]
impl UploadTransport for HttpUploadTransport {
    async fn upload(&self, batch: Vec<UploadRequest>) -> CoreResult<Vec<UploadOutcome>> {
        let response = self
            .client
            .post(self.endpoint.clone())
            .json(&UploadBatchRequest { tasks: batch })
            .send()
            .await?
            .error_for_status()?;
        let body: UploadBatchResponse = response
            .json()
            .await
            .map_err(|e| CoreError::transient(format!("upload response decode: {e}")))?;
        Ok(body.results)
    }
}

/// One recorded transport invocation, for test assertions.
#[derive(Debug, Clone)]
pub struct UploadCall {
    pub at: DateTime<Utc>,
    pub uids: Vec<Uuid>,
}

/// Scriptable transport. Without a script every upload succeeds with a
/// fabricated platform id; tests can queue per-call outcomes.
#[derive(Debug, Default)]
pub struct MockUploadTransport {
    script: Mutex<VecDeque<Vec<UploadOutcome>>>,
    calls: Mutex<Vec<UploadCall>>,
}

impl MockUploadTransport {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue the outcomes for the next call. Outcomes are matched to
    /// requests by uid; unmatched requests fall back to success.
    pub fn push_script(&self, outcomes: Vec<UploadOutcome>) {
        self.script
            .lock()
            .expect("script mutex poisoned")
            .push_back(outcomes);
    }

    #[must_use]
    pub fn calls(&self) -> Vec<UploadCall> {
        self.calls.lock().expect("calls mutex poisoned").clone()
    }

    fn default_outcome(uid: Uuid) -> UploadOutcome {
        UploadOutcome {
            uid,
            status: UploadStatus::Success,
            video_id: Some(format!("mock-{uid}")),
            url: Some(format!("https://videos.example/{uid}")),
            error: None,
            retry_able: None,
        }
    }
}

#[async_trait]
impl UploadTransport for MockUploadTransport {
    async fn upload(&self, batch: Vec<UploadRequest>) -> CoreResult<Vec<UploadOutcome>> {
        self.calls
            .lock()
            .expect("calls mutex poisoned")
            .push(UploadCall {
                at: Utc::now(),
                uids: batch.iter().map(|r| r.uid).collect(),
            });

        let scripted = self
            .script
            .lock()
            .expect("script mutex poisoned")
            .pop_front();
        Ok(batch
            .iter()
            .map(|request| {
                scripted
                    .as_ref()
                    .and_then(|outcomes| outcomes.iter().find(|o| o.uid == request.uid))
                    .cloned()
                    .unwrap_or_else(|| Self::default_outcome(request.uid))
            })
            .collect())
    }
}
