use super::*;
use indexmap::IndexMap;

fn builder() -> ToolBuilder {
    ToolBuilder::new("billing")
}

#[test]
fn add_action_rejects_dotted_names() {
    let mut b = builder();
    let err = b
        .add_action(
            "pay.now",
            None,
            TriState::Unset,
            TriState::Unset,
            TriState::Unset,
            Vec::<String>::new(),
            noop_handler(),
            None,
        )
        .unwrap_err();
    assert_eq!(err.code(), crate::error::ErrorCode::DottedActionName);
}

#[test]
fn add_action_rejects_duplicates() {
    let mut b = builder();
    b.add_action(
        "pay",
        None,
        TriState::Unset,
        TriState::Unset,
        TriState::Unset,
        Vec::<String>::new(),
        noop_handler(),
        None,
    )
    .unwrap();
    let err = b
        .add_action(
            "pay",
            None,
            TriState::Unset,
            TriState::Unset,
            TriState::Unset,
            Vec::<String>::new(),
            noop_handler(),
            None,
        )
        .unwrap_err();
    assert_eq!(err.code(), crate::error::ErrorCode::DuplicateAction);
}

#[test]
fn group_compounds_action_keys_and_scopes_omit_common() {
    let mut b = builder();
    b.open_group("invoices").unwrap();
    b.group_omit_common(["account_id"]).unwrap();
    b.add_action(
        "list",
        None,
        TriState::True,
        TriState::False,
        TriState::Unset,
        Vec::<String>::new(),
        noop_handler(),
        None,
    )
    .unwrap();
    b.close_group().unwrap();

    assert!(b.actions.contains_key("invoices.list"));
    let action = &b.actions["invoices.list"];
    assert!(action.omit_common.contains("account_id"));
}

#[test]
fn frozen_builder_rejects_mutation() {
    let mut b = builder();
    b.frozen = true;
    let err = b.description("nope").unwrap_err();
    assert_eq!(err.code(), crate::error::ErrorCode::BuilderFrozen);
}

#[test]
fn invalidates_accumulates_across_calls() {
    let mut b = builder();
    b.invalidates("pay", ["invoices.*"]).unwrap();
    b.invalidates("pay", ["balance"]).unwrap();
    let hint = &b.state_sync_hints["pay"];
    assert_eq!(hint.invalidates, vec!["invoices.*".to_string(), "balance".to_string()]);
}

#[test]
fn cached_and_stale_are_last_write_wins() {
    let mut b = builder();
    b.cached("get").unwrap();
    b.stale("get").unwrap();
    assert_eq!(b.state_sync_hints["get"].cache_control, Some(CacheControl::NoStore));
}

#[test]
fn middleware_for_action_combines_global_and_group_scope() {
    struct Marker;
    #[async_trait::async_trait]
    impl Middleware for Marker {
        async fn call(&self, ctx: DispatchContext, args: Value, next: Next) -> Result<ToolResponse> {
            next.run(ctx, args).await
        }
    }

    let mut b = builder();
    b.middleware(Arc::new(Marker)).unwrap();
    b.open_group("invoices").unwrap();
    b.middleware(Arc::new(Marker)).unwrap();
    b.add_action(
        "list",
        None,
        TriState::Unset,
        TriState::Unset,
        TriState::Unset,
        Vec::<String>::new(),
        noop_handler(),
        None,
    )
    .unwrap();
    b.close_group().unwrap();

    assert_eq!(b.middleware_for_action("invoices.list").len(), 2);
    assert_eq!(b.middleware_for_action("other").len(), 1);
}

#[test]
fn common_schema_replaces_rather_than_merges() {
    let mut b = builder();
    let mut first = IndexMap::new();
    first.insert(
        "a".to_string(),
        Arc::new(crate::schema::StringField {
            optional: false,
            description: None,
        }) as SchemaField,
    );
    b.common_schema(first).unwrap();

    let mut second = IndexMap::new();
    second.insert(
        "b".to_string(),
        Arc::new(crate::schema::StringField {
            optional: false,
            description: None,
        }) as SchemaField,
    );
    b.common_schema(second).unwrap();

    let schema = b.common_schema.unwrap();
    assert!(!schema.contains_key("a"));
    assert!(schema.contains_key("b"));
}
