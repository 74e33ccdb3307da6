//! Interception wrapper producing guarded tools with an unchanged external
//! shape.

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;

use crate::tool::{Tool, ToolError, Toolset};

use super::pipeline::{GuardError, GuardPipeline};

/// A tool whose declared shape is identical to the wrapped original but
/// whose behaviour is intercepted by a [`GuardPipeline`].
///
/// `name`, `description`, and `input_schema` delegate to the wrapped tool;
/// `needs_approval` always answers, using the tool's own predicate when it
/// declares one and the pipeline's policy probe otherwise; `execute` runs
/// the full guard sequence. The wrapped tool value is never mutated.
pub struct GuardedTool {
    inner: Arc<dyn Tool>,
    pipeline: Arc<GuardPipeline>,
}

impl GuardedTool {
    /// Wrap a tool in a pipeline.
    pub fn new(pipeline: Arc<GuardPipeline>, inner: Arc<dyn Tool>) -> Self {
        Self { inner, pipeline }
    }
}

impl std::fmt::Debug for GuardedTool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GuardedTool")
            .field("name", &self.inner.name())
            .finish_non_exhaustive()
    }
}

#[async_trait]
impl Tool for GuardedTool {
    fn name(&self) -> &str {
        self.inner.name()
    }

    fn description(&self) -> Option<&str> {
        self.inner.description()
    }

    fn input_schema(&self) -> Value {
        self.inner.input_schema()
    }

    async fn needs_approval(&self, input: &Value) -> Option<bool> {
        Some(
            self.pipeline
                .approval_required(self.inner.as_ref(), input)
                .await,
        )
    }

    async fn execute(&self, input: Value) -> Result<Value, ToolError> {
        match self.pipeline.run(self.inner.as_ref(), input).await {
            Ok(output) => Ok(output),
            // Underlying functional failures pass through unchanged; guard
            // rejections are flattened into the tool error channel because
            // the wrapper must keep the host-facing shape.
            Err(GuardError::Tool(inner)) => Err(inner),
            Err(other) => Err(ToolError::ExecutionFailed(other.to_string())),
        }
    }
}

impl GuardPipeline {
    /// Wrap a single tool, sharing this pipeline's context and policy.
    pub fn wrap(self: &Arc<Self>, tool: Arc<dyn Tool>) -> Arc<dyn Tool> {
        Arc::new(GuardedTool::new(Arc::clone(self), tool))
    }

    /// Wrap every tool in a toolset. All wrapped tools share one request
    /// context, so the call budget spans the whole set.
    pub fn wrap_toolset(self: &Arc<Self>, tools: Toolset) -> Toolset {
        tools
            .into_iter()
            .map(|(name, tool)| (name, self.wrap(tool)))
            .collect()
    }
}
