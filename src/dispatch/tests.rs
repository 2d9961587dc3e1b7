use super::*;
use crate::builder::{HandlerOutput, Middleware, Next, TriState, ToolBuilder};
use crate::compiler::compile;
use crate::error::Result;
use crate::schema::StringField;
use indexmap::IndexMap;
use std::sync::Arc;

fn echo_handler() -> crate::builder::ActionHandler {
    Arc::new(|_ctx, args| Box::pin(async move { Ok(HandlerOutput::Value(args)) }))
}

fn builder_with_one_action() -> ToolBuilder {
    let mut b = ToolBuilder::new("billing");
    let mut common = IndexMap::new();
    common.insert(
        "account_id".to_string(),
        Arc::new(StringField {
            optional: false,
            description: None,
        }) as crate::schema::SchemaField,
    );
    b.common_schema(common).unwrap();
    b.add_action(
        "pay",
        None,
        TriState::False,
        TriState::True,
        TriState::False,
        Vec::<String>::new(),
        echo_handler(),
        None,
    )
    .unwrap();
    b
}

#[tokio::test]
async fn missing_discriminator_yields_unknown_action() {
    let mut b = builder_with_one_action();
    let compiled = compile(&mut b).unwrap();
    let resp = dispatch(&compiled, DispatchContext::default(), serde_json::json!({})).await;
    assert!(resp.is_error());
}

#[tokio::test]
async fn unknown_action_lists_available_keys() {
    let mut b = builder_with_one_action();
    let compiled = compile(&mut b).unwrap();
    let resp = dispatch(&compiled, DispatchContext::default(), serde_json::json!({"action": "nope"})).await;
    assert!(resp.is_error());
    let crate::response::ContentBlock::Text { text } = &resp.content[0] else {
        panic!("expected text")
    };
    assert!(text.contains("pay"));
}

#[tokio::test]
async fn validation_error_reports_missing_required_field() {
    let mut b = builder_with_one_action();
    let compiled = compile(&mut b).unwrap();
    let resp = dispatch(&compiled, DispatchContext::default(), serde_json::json!({"action": "pay"})).await;
    assert!(resp.is_error());
}

#[tokio::test]
async fn valid_call_invokes_handler_through_middleware() {
    struct Counting(Arc<std::sync::atomic::AtomicUsize>);
    #[async_trait::async_trait]
    impl Middleware for Counting {
        async fn call(&self, ctx: DispatchContext, args: Value, next: Next) -> Result<crate::response::ToolResponse> {
            self.0.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
            next.run(ctx, args).await
        }
    }

    let counter = Arc::new(std::sync::atomic::AtomicUsize::new(0));
    let mut b = builder_with_one_action();
    b.middleware(Arc::new(Counting(counter.clone()))).unwrap();
    let compiled = compile(&mut b).unwrap();

    let resp = dispatch(
        &compiled,
        DispatchContext::default(),
        serde_json::json!({"action": "pay", "account_id": "acct_1"}),
    )
    .await;

    assert!(!resp.is_error());
    assert_eq!(counter.load(std::sync::atomic::Ordering::SeqCst), 1);
}
