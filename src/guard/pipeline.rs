//! The guard pipeline: check sequence, timeout race, and audit emission.

use std::sync::Arc;
use std::time::{Duration, Instant};

use serde_json::Value;
use tracing::{debug, warn};

use crate::audit::{AuditEvent, AuditSink};
use crate::policy::{Decision, Policy, PolicyError};
use crate::redact::{default_redactor, Redactor};
use crate::tool::{Tool, ToolError};

use super::context::{BudgetBreach, GuardContext};

/// Default per-call execution timeout in milliseconds.
pub const DEFAULT_TIMEOUT_MS: u64 = 15_000;

/// Failures surfaced to the host for a guarded invocation.
///
/// Nothing is swallowed: every rejected or failed call maps to exactly one
/// of these, and underlying tool failures pass through unchanged.
#[derive(Debug, thiserror::Error)]
pub enum GuardError {
    /// The policy denied the call; other calls in the request may proceed.
    #[error("denied by policy: {reason}")]
    Denied {
        /// The decision's reason.
        reason: String,
    },

    /// A budget ceiling was breached; recoverable only with a fresh context.
    #[error("budget exceeded: {0}")]
    BudgetExceeded(#[from] BudgetBreach),

    /// The tool did not complete within the allotted window. The abandoned
    /// execution may still complete side effects afterwards, so treat this
    /// as "unknown outcome", not "guaranteed no-op".
    #[error("tool {tool} timed out after {timeout_ms}ms")]
    Timeout {
        /// The tool that timed out.
        tool: String,
        /// The elapsed timeout.
        timeout_ms: u64,
    },

    /// The policy itself failed while classifying or deciding; the call is
    /// blocked (fail closed).
    #[error("policy evaluation failed, call blocked: {0}")]
    Policy(#[from] PolicyError),

    /// The underlying tool failed for its own reasons, passed through
    /// unchanged once past the guard checks.
    #[error(transparent)]
    Tool(#[from] ToolError),
}

/// Optional construction-time configuration for a [`GuardPipeline`].
///
/// Every field has a default: a fresh [`GuardContext`] with an
/// auto-generated request id, no audit sink, the default pattern redactor,
/// and a 15-second per-call timeout.
#[derive(Default)]
pub struct GuardOptions {
    /// Pre-built request context to share with other pipelines or the host.
    pub context: Option<Arc<GuardContext>>,
    /// Audit sink; `None` disables audit emission.
    pub sink: Option<Arc<dyn AuditSink>>,
    /// Redactor applied to inputs on the audit path.
    pub redactor: Option<Arc<dyn Redactor>>,
    /// Per-call execution timeout.
    pub timeout: Option<Duration>,
}

impl std::fmt::Debug for GuardOptions {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GuardOptions")
            .field("context", &self.context)
            .field("has_sink", &self.sink.is_some())
            .field("has_redactor", &self.redactor.is_some())
            .field("timeout", &self.timeout)
            .finish()
    }
}

/// Orchestrates classification, decision, budget checks, timeout-bounded
/// execution, and audit emission around each wrapped tool.
///
/// The pipeline is the sole producer of [`AuditEvent`]s. Policy and redactor
/// are shared read-only; the context is the only shared mutable state.
pub struct GuardPipeline {
    policy: Arc<dyn Policy>,
    context: Arc<GuardContext>,
    sink: Option<Arc<dyn AuditSink>>,
    redactor: Arc<dyn Redactor>,
    timeout: Duration,
}

impl std::fmt::Debug for GuardPipeline {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GuardPipeline")
            .field("context", &self.context)
            .field("timeout", &self.timeout)
            .finish_non_exhaustive()
    }
}

impl GuardPipeline {
    /// Create a pipeline from a policy and options.
    pub fn new(policy: Arc<dyn Policy>, options: GuardOptions) -> Self {
        Self {
            policy,
            context: options
                .context
                .unwrap_or_else(|| Arc::new(GuardContext::default())),
            sink: options.sink,
            redactor: options.redactor.unwrap_or_else(default_redactor),
            timeout: options
                .timeout
                .unwrap_or(Duration::from_millis(DEFAULT_TIMEOUT_MS)),
        }
    }

    /// The request context shared by all invocations through this pipeline.
    pub fn context(&self) -> &Arc<GuardContext> {
        &self.context
    }

    /// The per-call execution timeout.
    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Run one guarded invocation: audit, budgets, policy, timeout, execute.
    ///
    /// The caller receives the tool's original, unredacted result; redaction
    /// applies only to the audit copy of the input. If the timer wins the
    /// race, the in-flight execution future is dropped — side effects it had
    /// already started (spawned tasks, remote calls) may still land after
    /// the timeout is reported.
    ///
    /// # Errors
    ///
    /// Returns [`GuardError`] for denied, over-budget, timed-out, or failed
    /// calls; see the error type for the full taxonomy.
    pub async fn run(&self, tool: &dyn Tool, input: Value) -> Result<Value, GuardError> {
        let name = tool.name().to_owned();
        let request_id = self.context.request_id();

        self.emit(AuditEvent::attempted(
            request_id,
            &name,
            self.redactor.redact(&input),
        ))
        .await;

        if let Err(breach) = self.context.register_call() {
            self.emit(AuditEvent::budget_exceeded(
                request_id,
                &name,
                breach.to_string(),
            ))
            .await;
            return Err(GuardError::BudgetExceeded(breach));
        }

        if let Err(breach) = self.context.check_duration() {
            self.emit(AuditEvent::budget_exceeded(
                request_id,
                &name,
                breach.to_string(),
            ))
            .await;
            return Err(GuardError::BudgetExceeded(breach));
        }

        let decision = match self.evaluate(&name, &input).await {
            Ok(decision) => decision,
            Err(e) => {
                // Fail closed: a failing policy is a hard block here.
                self.emit(AuditEvent::blocked(request_id, &name, e.to_string()))
                    .await;
                return Err(GuardError::Policy(e));
            }
        };

        match decision {
            Decision::Deny { reason } => {
                self.emit(AuditEvent::blocked(request_id, &name, reason.clone()))
                    .await;
                return Err(GuardError::Denied { reason });
            }
            Decision::NeedsApproval { reason } => {
                // Informational only: pausing for a human is owned by the host.
                self.emit(AuditEvent::needs_approval(request_id, &name, reason))
                    .await;
            }
            Decision::Allow => {}
        }

        let started = Instant::now();
        match tokio::time::timeout(self.timeout, tool.execute(input)).await {
            Ok(Ok(output)) => {
                self.emit(AuditEvent::executed(request_id, &name, started.elapsed()))
                    .await;
                Ok(output)
            }
            Ok(Err(e)) => {
                debug!(tool = %name, error = %e, "tool execution failed");
                Err(GuardError::Tool(e))
            }
            Err(_) => {
                self.emit(AuditEvent::timeout(request_id, &name, self.timeout))
                    .await;
                Err(GuardError::Timeout {
                    tool: name,
                    timeout_ms: u64::try_from(self.timeout.as_millis()).unwrap_or(u64::MAX),
                })
            }
        }
    }

    /// Pre-execution approval probe.
    ///
    /// Honors a tool-declared predicate first; otherwise runs classify and
    /// decide and reports whether the decision carries an approval
    /// requirement. A failing policy probes as `true` (fail closed).
    pub async fn approval_required(&self, tool: &dyn Tool, input: &Value) -> bool {
        if let Some(declared) = tool.needs_approval(input).await {
            return declared;
        }
        match self.evaluate(tool.name(), input).await {
            Ok(decision) => decision.needs_approval(),
            Err(e) => {
                warn!(
                    tool = tool.name(),
                    error = %e,
                    "policy failed during approval probe, failing closed"
                );
                true
            }
        }
    }

    /// Classify then decide.
    async fn evaluate(&self, name: &str, input: &Value) -> Result<Decision, PolicyError> {
        let classification = self.policy.classify(name, input).await?;
        self.policy
            .decide(name, input, &self.context, &classification)
            .await
    }

    /// Fire-and-forget audit emission: sink failures are logged, never
    /// surfaced to the guarded caller.
    async fn emit(&self, event: AuditEvent) {
        let Some(sink) = &self.sink else {
            return;
        };
        if let Err(e) = sink.emit(&event).await {
            warn!(error = %e, kind = event.kind(), "audit sink failed");
        }
    }
}
