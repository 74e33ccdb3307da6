//! Tests for `src/guard/wrapper.rs` — shape preservation, synthesized
//! approval predicates, and whole-toolset wrapping.

use std::sync::Arc;

use serde_json::{json, Value};

use toolguard::audit::{AuditSink, MemorySink};
use toolguard::guard::{GuardContext, GuardOptions, GuardPipeline};
use toolguard::policy::SimplePolicy;
use toolguard::tool::{FnTool, Tool, ToolError, Toolset};

fn pipeline(policy: SimplePolicy, max_calls: u32) -> (Arc<GuardPipeline>, Arc<MemorySink>) {
    let sink = Arc::new(MemorySink::new());
    let pipeline = Arc::new(GuardPipeline::new(
        Arc::new(policy),
        GuardOptions {
            context: Some(Arc::new(GuardContext::with_request_id(
                "req-wrap",
                max_calls,
                None,
            ))),
            sink: Some(Arc::clone(&sink) as Arc<dyn AuditSink>),
            ..GuardOptions::default()
        },
    ));
    (pipeline, sink)
}

#[tokio::test]
async fn wrapped_tool_keeps_its_declared_shape() {
    let (pipeline, _sink) = pipeline(SimplePolicy::new(), 8);
    let schema = json!({"type": "object", "properties": {"city": {"type": "string"}}});
    let tool: Arc<dyn Tool> = Arc::new(
        FnTool::new("get_weather", |input| async move { Ok(input) })
            .with_description("Current weather for a city")
            .with_schema(schema.clone()),
    );

    let guarded = pipeline.wrap(tool);
    assert_eq!(guarded.name(), "get_weather");
    assert_eq!(guarded.description(), Some("Current weather for a city"));
    assert_eq!(guarded.input_schema(), schema);
}

#[tokio::test]
async fn wrapper_synthesizes_an_approval_predicate() {
    let (pipeline, _sink) = pipeline(SimplePolicy::new(), 8);

    let read_tool = pipeline.wrap(Arc::new(FnTool::new("get_weather", |input| async move {
        Ok(input)
    })));
    assert_eq!(read_tool.needs_approval(&json!({})).await, Some(false));

    let admin_tool = pipeline.wrap(Arc::new(FnTool::new("delete_user", |input| async move {
        Ok(input)
    })));
    assert_eq!(admin_tool.needs_approval(&json!({})).await, Some(true));
}

#[tokio::test]
async fn declared_approval_predicate_wins_over_policy() {
    let (pipeline, _sink) = pipeline(SimplePolicy::new(), 8);

    // Admin-named, but the host declared approval unnecessary.
    let tool = pipeline.wrap(Arc::new(
        FnTool::new("delete_cache", |input| async move { Ok(input) }).with_approval(false),
    ));
    assert_eq!(tool.needs_approval(&json!({})).await, Some(false));
}

#[tokio::test]
async fn wrapped_execute_passes_tool_errors_through_unchanged() {
    let (pipeline, _sink) = pipeline(SimplePolicy::new(), 8);
    let tool = pipeline.wrap(Arc::new(FnTool::new("get_weather", |_input| async {
        Err::<Value, _>(ToolError::InvalidInput("missing field: city".to_owned()))
    })));

    let err = tool.execute(json!({})).await.expect_err("tool failed");
    assert!(matches!(err, ToolError::InvalidInput(ref detail) if detail.contains("city")));
}

#[tokio::test]
async fn wrapped_execute_flattens_guard_rejections_into_tool_errors() {
    let (pipeline, sink) = pipeline(SimplePolicy::new().with_denylist(["drop_database"]), 8);
    let tool = pipeline.wrap(Arc::new(FnTool::new("drop_database", |input| async move {
        Ok(input)
    })));

    let err = tool.execute(json!({})).await.expect_err("denied");
    assert!(matches!(
        err,
        ToolError::ExecutionFailed(ref detail) if detail.contains("denied by policy")
    ));
    let kinds: Vec<&str> = sink.events().iter().map(|event| event.kind()).collect();
    assert_eq!(kinds, ["attempted", "blocked"]);
}

#[tokio::test]
async fn toolset_shares_one_call_budget() {
    let (pipeline, sink) = pipeline(SimplePolicy::new(), 1);

    let mut tools: Toolset = Toolset::new();
    tools.insert(
        "get_weather".to_owned(),
        Arc::new(FnTool::new("get_weather", |input| async move { Ok(input) })),
    );
    tools.insert(
        "get_news".to_owned(),
        Arc::new(FnTool::new("get_news", |input| async move { Ok(input) })),
    );
    let guarded = pipeline.wrap_toolset(tools);
    assert_eq!(guarded.len(), 2);

    let weather = guarded.get("get_weather").expect("wrapped tool");
    let news = guarded.get("get_news").expect("wrapped tool");

    weather.execute(json!({})).await.expect("first call fits");
    let err = news
        .execute(json!({}))
        .await
        .expect_err("budget spans the toolset");
    assert!(matches!(
        err,
        ToolError::ExecutionFailed(ref detail) if detail.contains("budget exceeded")
    ));

    let kinds: Vec<&str> = sink.events().iter().map(|event| event.kind()).collect();
    assert_eq!(kinds, ["attempted", "executed", "attempted", "budget_exceeded"]);
}
