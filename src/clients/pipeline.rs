//! HTTP pipeline runner.
//!
//! Treats `implementation_ref` as the endpoint of an external pipeline
//! service and posts `{pipeline_id, params}` to it. The deadline around the
//! whole invocation is enforced by the execution engine; the client timeout
//! here only bounds a single HTTP exchange.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Client, Url};
use serde::Serialize;
use serde_json::Value;

use crate::registry::{PipelineOutcome, PipelineRunner};
use crate::store::models::PipelineDescriptor;
use crate::util::error::{CoreError, CoreResult};

#[derive(Debug, Serialize)]
struct InvokeRequest<'a> {
    pipeline_id: &'a str,
    params: &'a Value,
}

#[derive(Debug, Clone)]
pub struct HttpPipelineRunner {
    client: Client,
}

impl HttpPipelineRunner {
    pub fn new(timeout: Duration) -> CoreResult<Self> {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| CoreError::permanent(format!("failed to build pipeline client: {e}")))?;
        Ok(Self { client })
    }
}

#[async_trait]
impl PipelineRunner for HttpPipelineRunner {
    async fn run(
        &self,
        descriptor: &PipelineDescriptor,
        params: &Value,
    ) -> CoreResult<PipelineOutcome> {
        let endpoint = Url::parse(&descriptor.implementation_ref).map_err(|e| {
            CoreError::bad_request(format!(
                "pipeline {} has an invalid implementation_ref: {e}",
                descriptor.pipeline_id
            ))
        })?;

        let response = self
            .client
            .post(endpoint)
            .json(&InvokeRequest {
                pipeline_id: &descriptor.pipeline_id,
                params,
            })
            .send()
            .await?
            .error_for_status()?;

        response
            .json()
            .await
            .map_err(|e| CoreError::transient(format!("pipeline response decode: {e}")))
    }
}
