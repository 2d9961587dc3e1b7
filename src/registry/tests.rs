use super::*;
use crate::builder::{HandlerOutput, ToolBuilder, TriState};
use crate::compiler::compile;
use std::sync::Arc;

fn handler() -> crate::builder::ActionHandler {
    Arc::new(|_ctx, _args| Box::pin(async { Ok(HandlerOutput::Value(serde_json::json!("ok"))) }))
}

fn compiled_tool(name: &str) -> CompiledTool {
    let mut b = ToolBuilder::new(name);
    b.add_action(
        "get",
        None,
        TriState::True,
        TriState::False,
        TriState::True,
        Vec::<String>::new(),
        handler(),
        None,
    )
    .unwrap();
    b.add_action(
        "delete",
        None,
        TriState::False,
        TriState::True,
        TriState::False,
        Vec::<String>::new(),
        handler(),
        None,
    )
    .unwrap();
    compile(&mut b).unwrap()
}

#[tokio::test]
async fn register_rejects_duplicate_names() {
    let registry = ToolRegistry::default();
    registry.register(compiled_tool("billing")).await.unwrap();
    let err = registry.register(compiled_tool("billing")).await.unwrap_err();
    assert_eq!(err.code(), crate::error::ErrorCode::DuplicateTool);
}

#[tokio::test]
async fn route_call_to_unregistered_tool_is_unknown_tool() {
    let registry = ToolRegistry::default();
    let resp = registry
        .route_call("ghost", AccessPolicy::Full, DispatchContext::default(), serde_json::json!({"action": "get"}))
        .await;
    assert!(resp.is_error());
}

#[tokio::test]
async fn denied_policy_hides_tool_entirely() {
    let registry = ToolRegistry::default();
    registry.register(compiled_tool("billing")).await.unwrap();
    assert!(registry.view(AccessPolicy::Denied).await.is_empty());
    let resp = registry
        .route_call("billing", AccessPolicy::Denied, DispatchContext::default(), serde_json::json!({"action": "get"}))
        .await;
    assert!(resp.is_error());
}

#[tokio::test]
async fn read_only_policy_filters_destructive_actions() {
    let registry = ToolRegistry::default();
    registry.register(compiled_tool("billing")).await.unwrap();

    let view = registry.view(AccessPolicy::ReadOnly).await;
    assert_eq!(view.len(), 1);
    let one_of = view[0].input_schema["oneOf"].as_array().unwrap();
    assert_eq!(one_of.len(), 1);

    let ok = registry
        .route_call("billing", AccessPolicy::ReadOnly, DispatchContext::default(), serde_json::json!({"action": "get"}))
        .await;
    assert!(!ok.is_error());

    let rejected = registry
        .route_call(
            "billing",
            AccessPolicy::ReadOnly,
            DispatchContext::default(),
            serde_json::json!({"action": "delete"}),
        )
        .await;
    assert!(rejected.is_error());
}

#[tokio::test]
async fn clear_empties_the_registry() {
    let registry = ToolRegistry::default();
    registry.register(compiled_tool("billing")).await.unwrap();
    assert_eq!(registry.size().await, 1);
    registry.clear().await;
    assert_eq!(registry.size().await, 0);
}

fn tagged_tool(name: &str, tags: &[&str]) -> CompiledTool {
    let mut b = ToolBuilder::new(name);
    for t in tags {
        b.tag(*t).unwrap();
    }
    b.add_action(
        "get",
        None,
        TriState::True,
        TriState::False,
        TriState::True,
        Vec::<String>::new(),
        handler(),
        None,
    )
    .unwrap();
    compile(&mut b).unwrap()
}

#[tokio::test]
async fn get_tools_applies_and_or_exclude_clauses() {
    let registry = ToolRegistry::default();
    registry.register(tagged_tool("billing", &["finance", "write"])).await.unwrap();
    registry.register(tagged_tool("reports", &["finance", "read"])).await.unwrap();
    registry.register(tagged_tool("search", &["utility"])).await.unwrap();

    let and_filter = TagFilter {
        tags: vec!["finance".into(), "write".into()],
        ..Default::default()
    };
    let names: Vec<String> = registry.get_tools(&and_filter, AccessPolicy::Full).await.into_iter().map(|t| t.name).collect();
    assert_eq!(names, vec!["billing".to_string()]);

    let or_filter = TagFilter {
        any_tag: vec!["utility".into(), "write".into()],
        ..Default::default()
    };
    let mut names: Vec<String> = registry.get_tools(&or_filter, AccessPolicy::Full).await.into_iter().map(|t| t.name).collect();
    names.sort();
    assert_eq!(names, vec!["billing".to_string(), "search".to_string()]);

    let exclude_filter = TagFilter {
        exclude: vec!["utility".into()],
        ..Default::default()
    };
    let mut names: Vec<String> = registry.get_tools(&exclude_filter, AccessPolicy::Full).await.into_iter().map(|t| t.name).collect();
    names.sort();
    assert_eq!(names, vec!["billing".to_string(), "reports".to_string()]);
}
