//! Tests for `src/guard/pipeline.rs` — the full check sequence, budgets,
//! timeout race, fail-closed policy errors, and audit ordering.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{json, Value};

use toolguard::audit::{AuditEvent, AuditSink, MemorySink, SinkError};
use toolguard::guard::{GuardContext, GuardError, GuardOptions, GuardPipeline};
use toolguard::policy::{Classification, Policy, PolicyError, SimplePolicy};
use toolguard::redact::REDACTION_MARKER;
use toolguard::tool::{FnTool, Tool, ToolError};

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

fn echo_tool(name: &str) -> FnTool {
    FnTool::new(name, |input| async move { Ok(input) })
}

struct Harness {
    pipeline: GuardPipeline,
    sink: Arc<MemorySink>,
    context: Arc<GuardContext>,
}

impl Harness {
    fn new(policy: SimplePolicy, max_calls: u32, max_duration: Option<Duration>) -> Self {
        let sink = Arc::new(MemorySink::new());
        let context = Arc::new(GuardContext::with_request_id(
            "req-test",
            max_calls,
            max_duration,
        ));
        let pipeline = GuardPipeline::new(
            Arc::new(policy),
            GuardOptions {
                context: Some(Arc::clone(&context)),
                sink: Some(Arc::clone(&sink) as Arc<dyn AuditSink>),
                redactor: None,
                timeout: None,
            },
        );
        Self {
            pipeline,
            sink,
            context,
        }
    }

    fn event_kinds(&self) -> Vec<String> {
        self.sink
            .events()
            .iter()
            .map(|event| event.kind().to_owned())
            .collect()
    }
}

/// A policy that always fails during classification.
struct FaultyPolicy;

#[async_trait]
impl Policy for FaultyPolicy {
    async fn classify(&self, name: &str, _input: &Value) -> Result<Classification, PolicyError> {
        Err(PolicyError::Classification {
            tool: name.to_owned(),
            detail: "ruleset unreachable".to_owned(),
        })
    }

    async fn decide(
        &self,
        name: &str,
        _input: &Value,
        _ctx: &GuardContext,
        _classification: &Classification,
    ) -> Result<toolguard::policy::Decision, PolicyError> {
        Err(PolicyError::Decision {
            tool: name.to_owned(),
            detail: "unreachable".to_owned(),
        })
    }
}

/// A sink that always fails, for isolation tests.
struct BrokenSink;

#[async_trait]
impl AuditSink for BrokenSink {
    async fn emit(&self, _event: &AuditEvent) -> Result<(), SinkError> {
        Err(SinkError::Closed)
    }
}

// ---------------------------------------------------------------------------
// Happy path and event ordering
// ---------------------------------------------------------------------------

#[tokio::test]
async fn allowed_call_executes_and_audits_in_order() {
    let harness = Harness::new(SimplePolicy::new(), 8, None);
    let tool = echo_tool("get_weather");

    let output = harness
        .pipeline
        .run(&tool, json!({"city": "Utrecht"}))
        .await
        .expect("allowed call");
    assert_eq!(output, json!({"city": "Utrecht"}));
    assert_eq!(harness.event_kinds(), ["attempted", "executed"]);
}

#[tokio::test]
async fn caller_receives_unredacted_result() {
    let secret = "sk-ant-REDACTED";
    let harness = Harness::new(SimplePolicy::new(), 8, None);
    let tool = echo_tool("get_credentials");

    let input = json!({"api_key": secret});
    let output = harness
        .pipeline
        .run(&tool, input.clone())
        .await
        .expect("allowed call");

    // The functional result is authentic.
    assert_eq!(output, input);

    // The audited copy is not.
    let events = harness.sink.events();
    let AuditEvent::Attempted { input: audited, .. } = &events[0] else {
        panic!("first event must be attempted");
    };
    let audited_key = audited["api_key"].as_str().expect("string");
    assert!(!audited_key.contains(secret));
    assert!(audited_key.contains(REDACTION_MARKER));
}

#[tokio::test]
async fn approval_flagged_call_still_executes_with_needs_approval_event() {
    let harness = Harness::new(SimplePolicy::new(), 8, None);
    let tool = echo_tool("delete_user");

    harness
        .pipeline
        .run(&tool, json!({"id": 7}))
        .await
        .expect("approval is informational on the execute path");
    assert_eq!(
        harness.event_kinds(),
        ["attempted", "needs_approval", "executed"]
    );
}

// ---------------------------------------------------------------------------
// Policy blocking
// ---------------------------------------------------------------------------

#[tokio::test]
async fn denylisted_call_never_reaches_the_tool() {
    let ran = Arc::new(AtomicBool::new(false));
    let ran_clone = Arc::clone(&ran);
    let tool = FnTool::new("delete_resource", move |_input| {
        let ran = Arc::clone(&ran_clone);
        async move {
            ran.store(true, Ordering::SeqCst);
            Ok(Value::Null)
        }
    });

    let harness = Harness::new(
        SimplePolicy::new().with_denylist(["delete_resource"]),
        8,
        None,
    );

    let err = harness
        .pipeline
        .run(&tool, json!({}))
        .await
        .expect_err("must be denied");
    assert!(matches!(err, GuardError::Denied { .. }));
    assert!(!ran.load(Ordering::SeqCst), "tool must not run");

    let kinds = harness.event_kinds();
    assert_eq!(kinds, ["attempted", "blocked"]);
    assert!(!kinds.iter().any(|kind| kind == "executed"));
}

#[tokio::test]
async fn policy_failure_blocks_the_call() {
    let sink = Arc::new(MemorySink::new());
    let pipeline = GuardPipeline::new(
        Arc::new(FaultyPolicy),
        GuardOptions {
            sink: Some(Arc::clone(&sink) as Arc<dyn AuditSink>),
            ..GuardOptions::default()
        },
    );
    let tool = echo_tool("get_weather");

    let err = pipeline
        .run(&tool, json!({}))
        .await
        .expect_err("fail closed");
    assert!(matches!(err, GuardError::Policy(_)));

    let kinds: Vec<&str> = sink.events().iter().map(AuditEvent::kind).collect();
    assert_eq!(kinds, ["attempted", "blocked"]);
}

#[tokio::test]
async fn policy_failure_probes_as_approval_required() {
    let pipeline = GuardPipeline::new(Arc::new(FaultyPolicy), GuardOptions::default());
    let tool = echo_tool("get_weather");
    assert!(pipeline.approval_required(&tool, &json!({})).await);
}

#[tokio::test]
async fn approval_probe_reflects_policy_decision() {
    let harness = Harness::new(SimplePolicy::new(), 8, None);

    assert!(
        harness
            .pipeline
            .approval_required(&echo_tool("delete_user"), &json!({}))
            .await
    );
    assert!(
        !harness
            .pipeline
            .approval_required(&echo_tool("get_weather"), &json!({}))
            .await
    );
    // Deny carries no approval requirement; the execute path blocks it.
    let denying = Harness::new(SimplePolicy::new().with_denylist(["get_weather"]), 8, None);
    assert!(
        !denying
            .pipeline
            .approval_required(&echo_tool("get_weather"), &json!({}))
            .await
    );
}

// ---------------------------------------------------------------------------
// Budgets
// ---------------------------------------------------------------------------

#[tokio::test]
async fn call_budget_admits_exactly_max_calls() {
    let harness = Harness::new(SimplePolicy::new(), 2, None);
    let tool = echo_tool("get_weather");

    harness.pipeline.run(&tool, json!({})).await.expect("call 1");
    harness.pipeline.run(&tool, json!({})).await.expect("call 2");

    let err = harness
        .pipeline
        .run(&tool, json!({}))
        .await
        .expect_err("call 3 over budget");
    assert!(matches!(err, GuardError::BudgetExceeded(_)));

    // The counter is left past the ceiling, not rolled back.
    assert_eq!(harness.context.calls_made(), 3);
    assert_eq!(
        harness.event_kinds(),
        [
            "attempted",
            "executed",
            "attempted",
            "executed",
            "attempted",
            "budget_exceeded"
        ]
    );
}

#[tokio::test]
async fn duration_budget_rejects_late_calls() {
    let harness = Harness::new(SimplePolicy::new(), 8, Some(Duration::from_millis(15)));
    let tool = echo_tool("get_weather");

    tokio::time::sleep(Duration::from_millis(40)).await;

    let err = harness
        .pipeline
        .run(&tool, json!({}))
        .await
        .expect_err("past the duration ceiling");
    assert!(matches!(err, GuardError::BudgetExceeded(_)));
    assert_eq!(harness.event_kinds(), ["attempted", "budget_exceeded"]);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn racing_invocations_respect_the_call_budget() {
    let harness = Harness::new(SimplePolicy::new(), 4, None);
    let pipeline = Arc::new(harness.pipeline);

    let mut handles = Vec::new();
    for _ in 0..16 {
        let pipeline = Arc::clone(&pipeline);
        handles.push(tokio::spawn(async move {
            let tool = echo_tool("get_weather");
            pipeline.run(&tool, json!({})).await.is_ok()
        }));
    }

    let mut succeeded = 0_u32;
    for handle in handles {
        if handle.await.expect("join") {
            succeeded = succeeded.saturating_add(1);
        }
    }
    assert_eq!(succeeded, 4);
}

// ---------------------------------------------------------------------------
// Timeout race
// ---------------------------------------------------------------------------

#[tokio::test(start_paused = true)]
async fn slow_tool_times_out_and_never_reports_executed() {
    let sink = Arc::new(MemorySink::new());
    let pipeline = GuardPipeline::new(
        Arc::new(SimplePolicy::new()),
        GuardOptions {
            sink: Some(Arc::clone(&sink) as Arc<dyn AuditSink>),
            timeout: Some(Duration::from_millis(50)),
            ..GuardOptions::default()
        },
    );
    let tool = FnTool::new("slow_lookup", |_input| async {
        tokio::time::sleep(Duration::from_secs(3600)).await;
        Ok(Value::Null)
    });

    let err = pipeline
        .run(&tool, json!({}))
        .await
        .expect_err("must time out");
    assert!(matches!(
        err,
        GuardError::Timeout { timeout_ms: 50, .. }
    ));

    let kinds: Vec<&str> = sink.events().iter().map(AuditEvent::kind).collect();
    assert_eq!(kinds.last().copied(), Some("timeout"));
    assert!(!kinds.contains(&"executed"));
}

#[tokio::test]
async fn fast_tool_beats_the_timer() {
    let pipeline = GuardPipeline::new(
        Arc::new(SimplePolicy::new()),
        GuardOptions {
            timeout: Some(Duration::from_secs(5)),
            ..GuardOptions::default()
        },
    );
    let tool = echo_tool("get_weather");
    pipeline.run(&tool, json!({})).await.expect("fast call");
}

// ---------------------------------------------------------------------------
// Tool failures and sink isolation
// ---------------------------------------------------------------------------

#[tokio::test]
async fn tool_failures_propagate_unchanged() {
    let harness = Harness::new(SimplePolicy::new(), 8, None);
    let tool = FnTool::new("get_weather", |_input| async {
        Err::<Value, _>(ToolError::InvalidInput("missing field: city".to_owned()))
    });

    let err = harness
        .pipeline
        .run(&tool, json!({}))
        .await
        .expect_err("tool failed");
    assert!(matches!(
        err,
        GuardError::Tool(ToolError::InvalidInput(ref detail)) if detail.contains("city")
    ));
    // Functional failures terminate the sequence with no further event.
    assert_eq!(harness.event_kinds(), ["attempted"]);
}

#[tokio::test]
async fn sink_failure_never_aborts_the_invocation() {
    let pipeline = GuardPipeline::new(
        Arc::new(SimplePolicy::new()),
        GuardOptions {
            sink: Some(Arc::new(BrokenSink)),
            ..GuardOptions::default()
        },
    );
    let tool = echo_tool("get_weather");

    pipeline
        .run(&tool, json!({"q": "ok"}))
        .await
        .expect("sink failure is swallowed");
}

#[tokio::test]
async fn default_options_generate_a_request_id() {
    let pipeline = GuardPipeline::new(Arc::new(SimplePolicy::new()), GuardOptions::default());
    assert!(!pipeline.context().request_id().is_empty());
    assert_eq!(pipeline.context().max_calls(), 8);
    assert_eq!(pipeline.timeout(), Duration::from_millis(15_000));
}
