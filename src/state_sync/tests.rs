use super::*;
use crate::builder::{HandlerOutput, ToolBuilder, TriState};
use crate::compiler::compile;
use std::sync::Arc;

fn tool_with_invalidation() -> CompiledTool {
    let mut b = ToolBuilder::new("billing");
    b.add_action(
        "pay",
        None,
        TriState::False,
        TriState::True,
        TriState::False,
        Vec::<String>::new(),
        Arc::new(|_ctx, _args| Box::pin(async { Ok(HandlerOutput::Value(serde_json::json!("ok"))) })),
        None,
    )
    .unwrap();
    b.invalidates("pay", ["invoices.*"]).unwrap();
    compile(&mut b).unwrap()
}

#[test]
fn error_responses_bypass_decoration() {
    let compiled = tool_with_invalidation();
    let sink = RecordingSink::default();
    let error_resp = ToolResponse::error(crate::error::ErrorCode::HandlerError, "boom", None, None);

    let decorated = decorate(&compiled, "pay", &sink, error_resp);

    assert!(decorated.is_error());
    assert_eq!(decorated.content.len(), 1);
    assert!(sink.seen().is_empty());
}

#[test]
fn successful_response_gets_cache_invalidation_block_and_notifies_sink() {
    let compiled = tool_with_invalidation();
    let sink = RecordingSink::default();
    let ok_resp = ToolResponse::text("paid");

    let decorated = decorate(&compiled, "pay", &sink, ok_resp);

    assert!(!decorated.is_error());
    assert_eq!(decorated.content.len(), 2);
    assert_eq!(sink.seen(), vec!["fusion://stale/invoices.*".to_string()]);
}

#[test]
fn wildcard_and_specific_hints_merge() {
    let mut hints = IndexMap::new();
    hints.insert(
        "*".to_string(),
        StateSyncHint {
            invalidates: vec!["audit.log".to_string()],
            cache_control: None,
        },
    );
    hints.insert(
        "pay".to_string(),
        StateSyncHint {
            invalidates: vec!["invoices.*".to_string()],
            cache_control: Some(CacheControl::NoStore),
        },
    );

    let merged = effective_hint(&hints, "pay");
    assert_eq!(merged.invalidates, vec!["audit.log".to_string(), "invoices.*".to_string()]);
    assert_eq!(merged.cache_control, Some(CacheControl::NoStore));
}

#[test]
fn xml_escape_handles_reserved_characters() {
    assert_eq!(xml_escape("<a & \"b\">"), "&lt;a &amp; &quot;b&quot;&gt;");
}

#[test]
fn cache_invalidation_block_is_well_formed_and_escaped() {
    let block = cache_invalidation_block("pay<1>", &["invoices.*".to_string()]);
    let ContentBlock::Text { text } = block else { panic!("expected text block") };
    assert!(text.starts_with("<cache_invalidation cause=\"pay&lt;1&gt;\">"));
    assert!(text.contains("<pattern>invoices.*</pattern>"));
}

#[test]
fn glob_patterns_match_dotted_resource_paths() {
    let set = compile_patterns(&["invoices.*".to_string()]).unwrap();
    assert!(set.is_match("invoices/created"));
    assert!(!set.is_match("billing/created"));
}

#[test]
fn detect_overlaps_flags_broader_pattern_subsuming_narrower() {
    let patterns = vec!["invoices.*".to_string(), "invoices.created".to_string(), "billing.*".to_string()];
    let overlaps = detect_overlaps(&patterns);
    assert!(overlaps.contains(&("invoices.*".to_string(), "invoices.created".to_string())));
    assert!(!overlaps.iter().any(|(a, b)| a == "billing.*" && b == "invoices.created"));
}
