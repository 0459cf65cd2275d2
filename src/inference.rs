// Inference boundary: the opaque call that turns a canonical snapshot into a
// reply. The server only carries function calls back; the client executes them.

use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

use crate::metrics;
use crate::snapshot::model::Role;
use crate::snapshot::Snapshot;

/// A function invocation requested by the model.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FunctionCall {
    pub name: String,
    #[serde(default)]
    pub arguments: Value,
}

/// What the provider answered for one snapshot.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct InferenceResponse {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
    #[serde(default)]
    pub function_calls: Vec<FunctionCall>,
}

#[derive(Debug, Clone, PartialEq, Error)]
pub enum InferenceError {
    #[error("inference timed out after {0:?}")]
    Timeout(Duration),
    #[error("inference provider failed: {0}")]
    Provider(String),
    #[error("malformed inference response: {0}")]
    MalformedResponse(String),
}

impl InferenceError {
    pub fn kind(&self) -> &'static str {
        match self {
            InferenceError::Timeout(_) => "inference_timeout",
            InferenceError::Provider(_) => "inference_failed",
            InferenceError::MalformedResponse(_) => "malformed_response",
        }
    }
}

/// Backend that produces replies from a canonical snapshot.
#[async_trait]
pub trait InferenceProvider: Send + Sync {
    fn name(&self) -> &str;

    async fn infer(&self, context: &Snapshot) -> Result<InferenceResponse, InferenceError>;
}

/// Replies with `Echo: <latest user text>`.
#[derive(Debug, Default, Clone)]
pub struct EchoProvider;

#[async_trait]
impl InferenceProvider for EchoProvider {
    fn name(&self) -> &str {
        "echo"
    }

    async fn infer(&self, context: &Snapshot) -> Result<InferenceResponse, InferenceError> {
        let text = context
            .latest_turn(Role::User)
            .map(|turn| format!("Echo: {}", turn.text));
        Ok(InferenceResponse {
            text,
            function_calls: Vec::new(),
        })
    }
}

/// Run the provider with a deadline. Dropping the future on timeout discards the
/// pending response; the caller's cached snapshot is never touched here.
pub async fn infer_with_timeout(
    provider: &Arc<dyn InferenceProvider>,
    context: &Snapshot,
    timeout: Duration,
) -> Result<InferenceResponse, InferenceError> {
    let start = Instant::now();
    let result = match tokio::time::timeout(timeout, provider.infer(context)).await {
        Ok(result) => result.and_then(check_response),
        Err(_) => Err(InferenceError::Timeout(timeout)),
    };

    metrics::INFERENCE_DURATION_SECONDS
        .with_label_values(&[provider.name()])
        .observe(start.elapsed().as_secs_f64());

    if let Err(e) = &result {
        metrics::INFERENCE_FAILURES_TOTAL
            .with_label_values(&[e.kind()])
            .inc();
        tracing::warn!(provider = provider.name(), "Inference failed: {e}");
    }
    result
}

fn check_response(response: InferenceResponse) -> Result<InferenceResponse, InferenceError> {
    if let Some(call) = response.function_calls.iter().find(|c| c.name.is_empty()) {
        return Err(InferenceError::MalformedResponse(format!(
            "function call without a name (arguments: {})",
            call.arguments
        )));
    }
    Ok(response)
}
