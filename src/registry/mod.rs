//! The tool registry: holds compiled tools, routes calls by name, and
//! exposes capability-filtered views. Grounded on
//! `oxicrab::agent::tools::registry::ToolRegistry` for the register/execute
//! shape, and on `read_only_wrapper::ReadOnlyToolWrapper` +
//! `agent::subagent::build_subagent_tools` for the dual
//! schema-filter/execution-reject enforcement behind [`AccessPolicy`].

use std::sync::Arc;
use std::time::Duration;

use indexmap::IndexMap;
use serde_json::{Value, json};
use tokio::sync::{Mutex, RwLock};
use tokio::task::JoinHandle;

use crate::builder::{DispatchContext, TriState};
use crate::compiler::CompiledTool;
use crate::dispatch;
use crate::error::{ErrorCode, FusionError, Result};
use crate::response::ToolResponse;

#[cfg(test)]
mod tests;

const DEFAULT_DEBOUNCE: Duration = Duration::from_millis(100);

/// What a caller is allowed to see and invoke in a given view of the
/// registry. `ReadOnly` enforces at two layers: the listing only shows
/// actions annotated `readOnly = true`, and `route_call` independently
/// rejects any other action even if a caller somehow names it directly.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AccessPolicy {
    Full,
    ReadOnly,
    Denied,
}

/// Tag-based listing filter for `getTools`: `tags` is an AND (every tag must
/// be present), `any_tag` is an OR (at least one must be present), and
/// `exclude` drops any tool carrying one of the listed tags. An empty filter
/// matches everything — the three clauses compose by conjunction, each
/// clause a no-op when empty.
#[derive(Debug, Clone, Default)]
pub struct TagFilter {
    pub tags: Vec<String>,
    pub any_tag: Vec<String>,
    pub exclude: Vec<String>,
}

impl TagFilter {
    pub fn matches(&self, tool_tags: &[String]) -> bool {
        let all_present = self.tags.iter().all(|t| tool_tags.contains(t));
        let any_present = self.any_tag.is_empty() || self.any_tag.iter().any(|t| tool_tags.contains(t));
        let none_excluded = !self.exclude.iter().any(|t| tool_tags.contains(t));
        all_present && any_present && none_excluded
    }
}

/// A summary suitable for a `list_tools`-style response: name, description,
/// schema, and annotations, filtered per [`AccessPolicy`].
#[derive(Debug, Clone)]
pub struct ToolSummary {
    pub name: String,
    pub description: Option<String>,
    pub input_schema: Value,
    pub tags: Vec<String>,
    pub fingerprint: String,
}

pub struct ToolRegistry {
    tools: RwLock<IndexMap<String, Arc<CompiledTool>>>,
    listeners: RwLock<Vec<Arc<dyn Fn() + Send + Sync>>>,
    debounce: Duration,
    pending_notify: Mutex<Option<JoinHandle<()>>>,
}

impl Default for ToolRegistry {
    fn default() -> Self {
        Self::new(DEFAULT_DEBOUNCE)
    }
}

impl ToolRegistry {
    pub fn new(debounce: Duration) -> Self {
        Self {
            tools: RwLock::new(IndexMap::new()),
            listeners: RwLock::new(Vec::new()),
            debounce,
            pending_notify: Mutex::new(None),
        }
    }

    /// Registers a compiled tool. Fails with `DUPLICATE_TOOL` if a tool by
    /// this name is already present.
    pub async fn register(&self, tool: CompiledTool) -> Result<()> {
        let mut tools = self.tools.write().await;
        if tools.contains_key(&tool.name) {
            return Err(FusionError::DuplicateTool(tool.name));
        }
        tools.insert(tool.name.clone(), Arc::new(tool));
        drop(tools);
        self.notify_changed().await;
        Ok(())
    }

    pub async fn has(&self, name: &str) -> bool {
        self.tools.read().await.contains_key(name)
    }

    pub async fn size(&self) -> usize {
        self.tools.read().await.len()
    }

    pub async fn clear(&self) {
        self.tools.write().await.clear();
        self.notify_changed().await;
    }

    /// Registers a listener invoked (debounced) whenever the tool set
    /// changes.
    pub async fn on_change(&self, listener: Arc<dyn Fn() + Send + Sync>) {
        self.listeners.write().await.push(listener);
    }

    /// Debounces rapid successive registry mutations into a single
    /// notification roughly `debounce` after the last change, matching the
    /// batching behavior the state-sync decorator relies on.
    async fn notify_changed(&self) {
        let mut pending = self.pending_notify.lock().await;
        if let Some(handle) = pending.take() {
            handle.abort();
        }

        let listeners = self.listeners.read().await.clone();
        let delay = self.debounce;
        *pending = Some(tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            for listener in &listeners {
                listener();
            }
        }));
    }

    /// Looks up a tool by name without any policy filtering. Intended for
    /// internal composition (e.g. the state-sync decorator, the
    /// introspector); callers handling untrusted requests should go through
    /// [`Self::view`] instead.
    pub async fn get(&self, name: &str) -> Option<Arc<CompiledTool>> {
        self.tools.read().await.get(name).cloned()
    }

    pub async fn list_all(&self) -> Vec<Arc<CompiledTool>> {
        self.tools.read().await.values().cloned().collect()
    }

    /// Routes a call to the named tool's dispatch pipeline under the given
    /// access policy. `Denied` tools and actions a `ReadOnly` policy
    /// excludes both fail the same way a genuinely unknown tool/action
    /// would, rather than with a distinct "forbidden" code — the caller
    /// cannot distinguish "doesn't exist" from "exists, but you can't use
    /// it".
    pub async fn route_call(&self, name: &str, policy: AccessPolicy, ctx: DispatchContext, args: Value) -> ToolResponse {
        if policy == AccessPolicy::Denied {
            return unknown_tool(&self.tool_names().await, name);
        }

        let Some(tool) = self.get(name).await else {
            return unknown_tool(&self.tool_names().await, name);
        };

        if policy == AccessPolicy::ReadOnly {
            let action_key = args.get("action").and_then(Value::as_str).unwrap_or_default();
            match tool.dispatch.get(action_key) {
                Some(entry) if entry.read_only.is_true() => {}
                _ => {
                    return ToolResponse::error(
                        ErrorCode::UnknownAction,
                        format!("action '{action_key}' is not available under a read-only policy"),
                        None,
                        Some(read_only_action_keys(&tool)),
                    );
                }
            }
        }

        dispatch::dispatch(&tool, ctx, args).await
    }

    async fn tool_names(&self) -> Vec<String> {
        self.tools.read().await.keys().cloned().collect()
    }

    /// Produces a capability-filtered listing. `Denied` yields an empty
    /// list; `ReadOnly` narrows each tool's schema to its read-only action
    /// branches (and drops tools left with none).
    pub async fn view(&self, policy: AccessPolicy) -> Vec<ToolSummary> {
        let tools = self.tools.read().await;
        match policy {
            AccessPolicy::Denied => Vec::new(),
            AccessPolicy::Full => tools.values().map(|t| full_summary(t)).collect(),
            AccessPolicy::ReadOnly => tools.values().filter_map(|t| read_only_summary(t)).collect(),
        }
    }

    /// Produces a capability- and tag-filtered listing: the spec's
    /// `getTools(filter)`. Composes with [`Self::view`]'s policy narrowing —
    /// a tool must survive both before it is returned.
    pub async fn get_tools(&self, filter: &TagFilter, policy: AccessPolicy) -> Vec<ToolSummary> {
        self.view(policy).await.into_iter().filter(|t| filter.matches(&t.tags)).collect()
    }
}

fn unknown_tool(available: &[String], name: &str) -> ToolResponse {
    ToolResponse::error(
        ErrorCode::UnknownTool,
        format!("unknown tool '{name}'"),
        None,
        Some(available.to_vec()),
    )
}

fn full_summary(tool: &CompiledTool) -> ToolSummary {
    ToolSummary {
        name: tool.name.clone(),
        description: tool.description.clone(),
        input_schema: tool.input_schema.clone(),
        tags: tool.tags.clone(),
        fingerprint: tool.fingerprint.clone(),
    }
}

fn read_only_action_keys(tool: &CompiledTool) -> Vec<String> {
    tool.dispatch
        .values()
        .filter(|e| e.read_only == TriState::True)
        .map(|e| e.action_key.clone())
        .collect()
}

fn read_only_summary(tool: &CompiledTool) -> Option<ToolSummary> {
    let keep: Vec<&str> = read_only_action_keys(tool).iter().map(String::as_str).collect();
    if keep.is_empty() {
        return None;
    }

    let one_of = tool.input_schema["oneOf"]
        .as_array()
        .cloned()
        .unwrap_or_default()
        .into_iter()
        .filter(|branch| {
            branch["properties"]["action"]["const"]
                .as_str()
                .is_some_and(|a| keep.contains(&a))
        })
        .collect::<Vec<_>>();

    Some(ToolSummary {
        name: tool.name.clone(),
        description: tool.description.clone(),
        input_schema: json!({
            "type": "object",
            "discriminator": {"propertyName": "action"},
            "oneOf": one_of,
        }),
        tags: tool.tags.clone(),
        fingerprint: tool.fingerprint.clone(),
    })
}
