//! Tool descriptors: the capability interface shared with the host framework.
//!
//! A [`Tool`] is an externally invocable action with a name, an optional
//! description, an opaque input-shape descriptor, an optional declared
//! approval predicate, and an execute entry point. The guard core requires
//! nothing beyond this shape; hosts keep tools in a [`Toolset`] keyed by
//! name.

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;

/// Errors from tool execution.
#[derive(Debug, thiserror::Error)]
pub enum ToolError {
    /// The input did not satisfy the tool's expectations.
    #[error("invalid tool input: {0}")]
    InvalidInput(String),

    /// The tool ran and failed for its own reasons.
    #[error("tool execution failed: {0}")]
    ExecutionFailed(String),

    /// The descriptor carries no execute entry point.
    #[error("tool {0} has no execute entry point")]
    NotExecutable(String),
}

/// An externally invocable capability.
///
/// `description`, `input_schema`, and `needs_approval` are all optional in
/// the interface sense: the defaults declare nothing, and the guard layer
/// fills the gaps (synthesizing an approval predicate from policy, treating
/// the schema as opaque). Descriptor-only tools without a real execute entry
/// point should return [`ToolError::NotExecutable`].
#[async_trait]
pub trait Tool: Send + Sync {
    /// Name, unique within a toolset.
    fn name(&self) -> &str;

    /// Optional free-text description.
    fn description(&self) -> Option<&str> {
        None
    }

    /// Opaque input-shape descriptor (e.g. a JSON Schema). Never inspected
    /// by the guard core.
    fn input_schema(&self) -> Value {
        Value::Null
    }

    /// Declared approval requirement for this input, if the tool carries
    /// one. `None` means the tool declares nothing and the guard synthesizes
    /// a predicate from policy.
    async fn needs_approval(&self, _input: &Value) -> Option<bool> {
        None
    }

    /// Run the tool.
    ///
    /// # Errors
    ///
    /// Returns [`ToolError`] on invalid input or execution failure.
    async fn execute(&self, input: Value) -> Result<Value, ToolError>;
}

/// A toolset: capability descriptors keyed by name.
pub type Toolset = HashMap<String, Arc<dyn Tool>>;

/// Boxed async execute entry point backing [`FnTool`].
type ExecuteFn = Arc<
    dyn Fn(Value) -> Pin<Box<dyn Future<Output = Result<Value, ToolError>> + Send>> + Send + Sync,
>;

/// Closure-backed tool for hosts that register plain async functions.
#[derive(Clone)]
pub struct FnTool {
    name: String,
    description: Option<String>,
    schema: Value,
    approval: Option<bool>,
    execute: ExecuteFn,
}

impl FnTool {
    /// Create a tool from a name and an async execute function.
    pub fn new<F, Fut>(name: impl Into<String>, execute: F) -> Self
    where
        F: Fn(Value) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Value, ToolError>> + Send + 'static,
    {
        Self {
            name: name.into(),
            description: None,
            schema: Value::Null,
            approval: None,
            execute: Arc::new(move |input| Box::pin(execute(input))),
        }
    }

    /// Attach a free-text description.
    #[must_use]
    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    /// Attach an input-shape descriptor.
    #[must_use]
    pub fn with_schema(mut self, schema: Value) -> Self {
        self.schema = schema;
        self
    }

    /// Declare a fixed approval requirement, overriding policy synthesis.
    #[must_use]
    pub fn with_approval(mut self, needs_approval: bool) -> Self {
        self.approval = Some(needs_approval);
        self
    }
}

impl std::fmt::Debug for FnTool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FnTool")
            .field("name", &self.name)
            .field("description", &self.description)
            .field("approval", &self.approval)
            .finish_non_exhaustive()
    }
}

#[async_trait]
impl Tool for FnTool {
    fn name(&self) -> &str {
        &self.name
    }

    fn description(&self) -> Option<&str> {
        self.description.as_deref()
    }

    fn input_schema(&self) -> Value {
        self.schema.clone()
    }

    async fn needs_approval(&self, _input: &Value) -> Option<bool> {
        self.approval
    }

    async fn execute(&self, input: Value) -> Result<Value, ToolError> {
        (self.execute)(input).await
    }
}
