//! Pipeline registry.
//!
//! Holds pipeline descriptors and invokes implementations through the
//! [`PipelineRunner`] seam. The registry knows nothing about how a pipeline
//! is implemented; the bundled HTTP runner lives in `clients::pipeline`.

use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::store::AutoPublishStore;
use crate::store::models::{PipelineDescriptor, PipelineFilter, PipelineStatus};
use crate::util::error::{CoreError, CoreResult};

/// What an implementation hands back. `metadata` feeds variant template
/// rendering; `artifacts` carries opaque file references (video, thumbnail).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineOutcome {
    pub success: bool,
    #[serde(default)]
    pub artifacts: Value,
    #[serde(default)]
    pub metadata: Map<String, Value>,
    #[serde(default)]
    pub error: Option<String>,
    #[serde(default)]
    pub retry_able: Option<bool>,
}

#[async_trait]
pub trait PipelineRunner: Send + Sync {
    async fn run(
        &self,
        descriptor: &PipelineDescriptor,
        params: &Value,
    ) -> CoreResult<PipelineOutcome>;
}

pub struct PipelineRegistry {
    store: Arc<dyn AutoPublishStore>,
    runner: Arc<dyn PipelineRunner>,
}

impl PipelineRegistry {
    pub fn new(store: Arc<dyn AutoPublishStore>, runner: Arc<dyn PipelineRunner>) -> Self {
        Self { store, runner }
    }

    /// Upsert by `pipeline_id`. The parameter schema must itself be a valid
    /// JSON Schema; a descriptor that cannot validate anything is rejected
    /// here rather than at invocation time.
    pub async fn register(&self, descriptor: PipelineDescriptor) -> CoreResult<()> {
        jsonschema::validator_for(&descriptor.parameter_schema).map_err(|e| {
            CoreError::bad_request(format!("parameter_schema is not a valid JSON Schema: {e}"))
        })?;
        self.store.upsert_pipeline(descriptor).await
    }

    pub async fn get(&self, pipeline_id: &str) -> CoreResult<PipelineDescriptor> {
        self.store.get_pipeline(pipeline_id).await
    }

    pub async fn list(&self, filter: PipelineFilter) -> CoreResult<Vec<PipelineDescriptor>> {
        self.store.list_pipelines(filter).await
    }

    pub async fn delete(&self, pipeline_id: &str) -> CoreResult<()> {
        self.store.delete_pipeline(pipeline_id).await
    }

    /// Validate `params` against the descriptor's schema and delegate to the
    /// runner. Schema mismatches are `BadRequest` (never retried); semantic
    /// failures surface as `Transient` or `Permanent` per the runner's
    /// `retry_able` hint.
    pub async fn invoke(&self, pipeline_id: &str, params: &Value) -> CoreResult<PipelineOutcome> {
        let descriptor = self.store.get_pipeline(pipeline_id).await?;
        if descriptor.status == PipelineStatus::Deprecated {
            return Err(CoreError::conflict(format!(
                "pipeline {pipeline_id} is deprecated"
            )));
        }

        let validator = jsonschema::validator_for(&descriptor.parameter_schema)
            .map_err(|e| CoreError::bad_request(format!("stored schema is invalid: {e}")))?;
        if let Err(error) = validator.validate(params) {
            return Err(CoreError::bad_request(format!(
                "pipeline params rejected by schema: {error}"
            )));
        }

        let outcome = self.runner.run(&descriptor, params).await?;
        if outcome.success {
            Ok(outcome)
        } else {
            let message = outcome
                .error
                .unwrap_or_else(|| "pipeline reported failure without a reason".to_string());
            if outcome.retry_able.unwrap_or(false) {
                Err(CoreError::transient(message))
            } else {
                Err(CoreError::permanent(message))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use serde_json::json;

    use crate::store::MemoryStore;

    struct ScriptedRunner {
        outcome: PipelineOutcome,
    }

    #[async_trait]
    impl PipelineRunner for ScriptedRunner {
        async fn run(
            &self,
            _descriptor: &PipelineDescriptor,
            _params: &Value,
        ) -> CoreResult<PipelineOutcome> {
            Ok(self.outcome.clone())
        }
    }

    fn descriptor(pipeline_id: &str, schema: Value) -> PipelineDescriptor {
        PipelineDescriptor {
            pipeline_id: pipeline_id.to_string(),
            display_name: "Story video".to_string(),
            type_tag: "story".to_string(),
            implementation_ref: "http://pipelines.local/story".to_string(),
            parameter_schema: schema,
            supported_platforms: vec!["youtube".to_string()],
            version: "1".to_string(),
            status: PipelineStatus::Active,
            created_at: Utc::now(),
            updated_at: Utc::now(),
        }
    }

    fn registry(outcome: PipelineOutcome) -> PipelineRegistry {
        PipelineRegistry::new(
            Arc::new(MemoryStore::new()),
            Arc::new(ScriptedRunner { outcome }),
        )
    }

    fn ok_outcome() -> PipelineOutcome {
        PipelineOutcome {
            success: true,
            artifacts: json!({"video": "/tmp/out.mp4"}),
            metadata: Map::new(),
            error: None,
            retry_able: None,
        }
    }

    #[tokio::test]
    async fn register_rejects_invalid_schema() {
        let registry = registry(ok_outcome());
        let bad = descriptor("p1", json!({"type": 5}));
        let error = registry.register(bad).await.expect_err("must reject");
        assert_eq!(error.code(), "bad_request");
    }

    #[tokio::test]
    async fn invoke_validates_params_against_schema() {
        let registry = registry(ok_outcome());
        let schema = json!({
            "type": "object",
            "properties": {"length": {"type": "integer"}},
            "required": ["length"],
        });
        registry
            .register(descriptor("p1", schema))
            .await
            .expect("registers");

        let error = registry
            .invoke("p1", &json!({"length": "long"}))
            .await
            .expect_err("wrong type must fail");
        assert_eq!(error.code(), "bad_request");

        let outcome = registry
            .invoke("p1", &json!({"length": 30}))
            .await
            .expect("valid params run");
        assert!(outcome.success);
    }

    #[tokio::test]
    async fn invoke_maps_failure_through_retry_hint() {
        let registry = registry(PipelineOutcome {
            success: false,
            artifacts: Value::Null,
            metadata: Map::new(),
            error: Some("renderer crashed".to_string()),
            retry_able: Some(true),
        });
        registry
            .register(descriptor("p1", json!({"type": "object"})))
            .await
            .expect("registers");

        let error = registry
            .invoke("p1", &json!({}))
            .await
            .expect_err("failure surfaces");
        assert!(error.retry_able());

        let registry = registry_with_permanent_failure().await;
        let error = registry
            .invoke("p1", &json!({}))
            .await
            .expect_err("failure surfaces");
        assert!(!error.retry_able());
        assert_eq!(error.code(), "permanent");
    }

    async fn registry_with_permanent_failure() -> PipelineRegistry {
        let registry = registry(PipelineOutcome {
            success: false,
            artifacts: Value::Null,
            metadata: Map::new(),
            error: Some("content rejected".to_string()),
            retry_able: Some(false),
        });
        registry
            .register(descriptor("p1", json!({"type": "object"})))
            .await
            .expect("registers");
        registry
    }

    #[tokio::test]
    async fn deprecated_pipelines_cannot_be_invoked() {
        let registry = registry(ok_outcome());
        let mut dep = descriptor("p1", json!({"type": "object"}));
        dep.status = PipelineStatus::Deprecated;
        registry.register(dep).await.expect("registers");

        let error = registry
            .invoke("p1", &json!({}))
            .await
            .expect_err("deprecated is not invokable");
        assert_eq!(error.code(), "conflict");
    }

    #[tokio::test]
    async fn missing_pipeline_is_not_found() {
        let registry = registry(ok_outcome());
        let error = registry
            .invoke("ghost", &json!({}))
            .await
            .expect_err("missing pipeline");
        assert_eq!(error.code(), "not_found");
    }
}
