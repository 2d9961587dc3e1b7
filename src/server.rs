//! Thin async facade wiring the registry, state-sync decorator, and
//! capability introspector together behind the handful of RPC-shaped
//! operations a transport collaborator calls into (`tools/list`,
//! `tools/call`, `resources/list`, `resources/read`). Grounded on
//! `oxicrab::gateway::mod`, the teacher's own state-holding façade in front
//! of `ToolRegistry`/`SubagentManager` — this module plays the same role,
//! narrowed to the seams spec §6 actually names.

use std::sync::{Arc, RwLock as StdRwLock};

use indexmap::IndexMap;
use serde_json::{Value, json};

use crate::builder::DispatchContext;
use crate::introspector::{ContractChange, Lockfile, ToolContract, diff, top_actionable};
use crate::registry::{AccessPolicy, TagFilter, ToolRegistry, ToolSummary};
use crate::response::{ContentBlock, ToolResponse};
use crate::state_sync::{self, NotificationSink};

/// Default URI of the introspection manifest resource (spec §4.4 / §6).
pub const MANIFEST_URI: &str = "fusion://manifest.json";

const CONTRACT_AWARENESS_TOP_N: usize = 5;

/// Binds a [`ToolRegistry`] to the four operations a transport expects,
/// applying state-sync decoration after every successful call and the
/// contract-awareness self-healing hook after every `VALIDATION_ERROR`.
pub struct Server {
    registry: Arc<ToolRegistry>,
    notification_sink: Arc<dyn NotificationSink>,
    server_name: String,
    framework_version: String,
    deltas: StdRwLock<IndexMap<String, Vec<ContractChange>>>,
}

impl Server {
    pub fn new(registry: Arc<ToolRegistry>, notification_sink: Arc<dyn NotificationSink>, server_name: impl Into<String>) -> Self {
        Self {
            registry,
            notification_sink,
            server_name: server_name.into(),
            framework_version: crate::VERSION.to_string(),
            deltas: StdRwLock::new(IndexMap::new()),
        }
    }

    pub fn registry(&self) -> &Arc<ToolRegistry> {
        &self.registry
    }

    /// Records the active contract-drift deltas for `tool`, to be injected
    /// into any subsequent `VALIDATION_ERROR` response for that tool's
    /// actions until replaced or cleared.
    pub fn set_deltas(&self, tool: impl Into<String>, deltas: Vec<ContractChange>) {
        self.deltas
            .write()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .insert(tool.into(), deltas);
    }

    pub fn clear_deltas(&self, tool: &str) {
        self.deltas.write().unwrap_or_else(std::sync::PoisonError::into_inner).shift_remove(tool);
    }

    /// `tools/list`, filtered by tag and narrowed by access policy.
    pub async fn list_tools(&self, policy: AccessPolicy, filter: &TagFilter) -> Vec<ToolSummary> {
        self.registry.get_tools(filter, policy).await
    }

    /// `tools/call`: routes through the registry's dispatch, then applies
    /// state-sync decoration and the contract-awareness hook in that order,
    /// matching the "decoration happens strictly after handler completion
    /// and strictly before the response is surfaced" ordering guarantee.
    pub async fn call_tool(&self, policy: AccessPolicy, ctx: DispatchContext, tool_name: &str, args: Value) -> ToolResponse {
        let action_key = args.get("action").and_then(Value::as_str).unwrap_or_default().to_string();
        let response = self.registry.route_call(tool_name, policy, ctx, args).await;

        let Some(tool) = self.registry.get(tool_name).await else {
            return response;
        };

        let decorated = state_sync::decorate(&tool, &action_key, self.notification_sink.as_ref(), response);
        self.inject_contract_awareness(tool_name, &action_key, decorated)
    }

    fn inject_contract_awareness(&self, tool_name: &str, action: &str, mut response: ToolResponse) -> ToolResponse {
        if response.error_code().as_deref() != Some("VALIDATION_ERROR") {
            return response;
        }

        let deltas = self.deltas.read().unwrap_or_else(std::sync::PoisonError::into_inner);
        let Some(relevant) = deltas.get(tool_name) else {
            return response;
        };
        let top = top_actionable(relevant, CONTRACT_AWARENESS_TOP_N);
        if top.is_empty() {
            return response;
        }

        let items = top
            .iter()
            .map(|c| format!("  <delta severity=\"{:?}\">{}</delta>", c.severity, state_sync::xml_escape(&c.description)))
            .collect::<Vec<_>>()
            .join("\n");
        let text = format!("<contract_awareness action=\"{}\">\n{items}\n</contract_awareness>", state_sync::xml_escape(action));
        response.content.push(ContentBlock::text(text));
        response
    }

    /// `resources/list`: a single entry naming the introspection manifest.
    pub async fn list_resources(&self) -> Vec<Value> {
        vec![json!({
            "uri": MANIFEST_URI,
            "name": "fusion-core tool manifest",
            "mimeType": "application/json",
        })]
    }

    /// `resources/read`: serves the current lockfile-shaped manifest,
    /// freshly derived from every registered tool. `None` for any URI other
    /// than [`MANIFEST_URI`].
    pub async fn read_resource(&self, uri: &str) -> Option<Value> {
        if uri != MANIFEST_URI {
            return None;
        }

        let tools = self.registry.list_all().await;
        let contracts: Vec<ToolContract> = tools.iter().map(|t| ToolContract::derive(t)).collect();
        let lockfile = Lockfile::generate(contracts, self.server_name.clone(), self.framework_version.clone(), chrono::Utc::now());
        let text = lockfile.to_pretty_string().ok()?;

        Some(json!({
            "uri": uri,
            "mimeType": "application/json",
            "text": text,
        }))
    }

    /// Registers a listener for the registry's debounced `tools/list_changed`
    /// notification, mirroring the shape of `notifications/tools/list_changed`
    /// named in spec §6. The caller supplies the sink (e.g. a transport
    /// write-half); this facade only wires the registry's change events to
    /// it.
    pub async fn on_tools_changed(&self, listener: Arc<dyn Fn() + Send + Sync>) {
        self.registry.on_change(listener).await;
    }

    /// Computes a fresh contract diff for `tool_name` against `previous` and
    /// records it via [`Self::set_deltas`] in one step, for callers wiring
    /// CI-style drift detection directly into a live server.
    pub async fn record_drift(&self, tool_name: &str, previous: &ToolContract) -> Option<Vec<ContractChange>> {
        let tool = self.registry.get(tool_name).await?;
        let current = ToolContract::derive(&tool);
        let deltas = diff(previous, &current);
        self.set_deltas(tool_name, deltas.clone());
        Some(deltas)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::builder::{HandlerOutput, ToolBuilder, TriState};
    use crate::compiler::compile;
    use crate::introspector::Severity;
    use crate::state_sync::RecordingSink;
    use std::sync::Arc;

    fn billing_tool() -> crate::compiler::CompiledTool {
        let mut b = ToolBuilder::new("billing");
        let mut common = IndexMap::new();
        common.insert(
            "workspace_id".to_string(),
            Arc::new(crate::schema::StringField { optional: false, description: None }) as crate::schema::SchemaField,
        );
        b.common_schema(common).unwrap();
        b.add_action(
            "pay",
            None,
            TriState::False,
            TriState::True,
            TriState::False,
            Vec::<String>::new(),
            Arc::new(|_ctx, _args| Box::pin(async { Ok(HandlerOutput::Value(serde_json::json!("paid"))) })),
            None,
        )
        .unwrap();
        b.invalidates("pay", vec!["billing.invoices.*"]).unwrap();
        compile(&mut b).unwrap()
    }

    async fn server() -> (Server, Arc<RecordingSink>) {
        let registry = Arc::new(ToolRegistry::default());
        registry.register(billing_tool()).await.unwrap();
        let sink = Arc::new(RecordingSink::default());
        let server = Server::new(registry, sink.clone(), "test-server");
        (server, sink)
    }

    #[tokio::test]
    async fn call_tool_decorates_successful_response_with_invalidation() {
        let (server, sink) = server().await;
        let resp = server
            .call_tool(
                AccessPolicy::Full,
                DispatchContext::default(),
                "billing",
                serde_json::json!({"action": "pay", "workspace_id": "w1"}),
            )
            .await;

        assert!(!resp.is_error());
        let has_invalidation = resp.content.iter().any(|c| matches!(c, ContentBlock::Text { text } if text.contains("cache_invalidation")));
        assert!(has_invalidation);
        assert_eq!(sink.seen(), vec!["fusion://stale/billing.invoices.*".to_string()]);
    }

    #[tokio::test]
    async fn call_tool_with_missing_required_field_is_validation_error() {
        let (server, _sink) = server().await;
        let resp = server
            .call_tool(AccessPolicy::Full, DispatchContext::default(), "billing", serde_json::json!({"action": "pay"}))
            .await;
        assert!(resp.is_error());
        assert_eq!(resp.error_code().as_deref(), Some("VALIDATION_ERROR"));
    }

    #[tokio::test]
    async fn validation_error_carries_contract_awareness_when_deltas_are_set() {
        let (server, _sink) = server().await;
        server.set_deltas(
            "billing",
            vec![ContractChange {
                severity: Severity::Breaking,
                description: "action 'pay' became destructive".into(),
            }],
        );

        let resp = server
            .call_tool(AccessPolicy::Full, DispatchContext::default(), "billing", serde_json::json!({"action": "pay"}))
            .await;

        let has_awareness = resp.content.iter().any(|c| matches!(c, ContentBlock::Text { text } if text.contains("contract_awareness")));
        assert!(has_awareness);
    }

    #[tokio::test]
    async fn read_resource_serves_the_manifest_uri_only() {
        let (server, _sink) = server().await;
        assert!(server.read_resource("fusion://something/else").await.is_none());

        let manifest = server.read_resource(MANIFEST_URI).await.unwrap();
        let text = manifest["text"].as_str().unwrap();
        assert!(text.contains("\"lockfileVersion\""));
        assert!(text.contains("\"billing\""));
    }

    #[tokio::test]
    async fn list_tools_respects_access_policy() {
        let (server, _sink) = server().await;
        let full = server.list_tools(AccessPolicy::Full, &TagFilter::default()).await;
        assert_eq!(full.len(), 1);

        let read_only = server.list_tools(AccessPolicy::ReadOnly, &TagFilter::default()).await;
        assert!(read_only.is_empty());
    }
}
