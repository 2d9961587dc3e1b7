//! Accumulates the declarative description of a tool: actions, common
//! schema, groups, middleware, state-sync hints. Frozen on first `compile`.
//!
//! Mirrors the shape of `oxicrab::agent::tools::base::Tool` (name,
//! description, parameters, capabilities) but as a builder that produces a
//! [`crate::compiler::CompiledTool`] instead of a hand-written trait impl.

use indexmap::{IndexMap, IndexSet};
use serde_json::Value;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use crate::error::{FusionError, Result};
use crate::response::ToolResponse;
use crate::schema::SchemaField;

#[cfg(test)]
mod tests;

/// Context passed to every handler and middleware call. Caller-owned and
/// caller-isolated per request — the core never shares mutable state across
/// concurrent calls through this type.
#[derive(Debug, Clone, Default)]
pub struct DispatchContext {
    pub metadata: IndexMap<String, Value>,
}

/// Tri-state flag: true / false / absent. At most two of
/// `read_only`/`destructive`/`idempotent` may be simultaneously asserted
/// (checked at compile time, not here).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TriState {
    #[default]
    Unset,
    True,
    False,
}

impl TriState {
    pub fn is_asserted(self) -> bool {
        !matches!(self, Self::Unset)
    }

    pub fn is_true(self) -> bool {
        matches!(self, Self::True)
    }
}

/// What an action handler produced before implicit-wrapping is applied.
pub enum HandlerOutput {
    Response(ToolResponse),
    Value(Value),
}

impl From<ToolResponse> for HandlerOutput {
    fn from(r: ToolResponse) -> Self {
        Self::Response(r)
    }
}

impl From<Value> for HandlerOutput {
    fn from(v: Value) -> Self {
        Self::Value(v)
    }
}

impl From<String> for HandlerOutput {
    fn from(s: String) -> Self {
        Self::Value(Value::String(s))
    }
}

pub type HandlerFuture = Pin<Box<dyn Future<Output = Result<HandlerOutput>> + Send>>;

/// The handler closure an action spec carries: `(ctx, args) -> Response`.
pub type ActionHandler = Arc<dyn Fn(DispatchContext, Value) -> HandlerFuture + Send + Sync>;

pub type ResponseFuture = Pin<Box<dyn Future<Output = Result<ToolResponse>> + Send>>;

/// The dispatch-facing handler shape (post implicit-wrapping). Middleware
/// chains are composed in terms of this type.
pub type Handler = Arc<dyn Fn(DispatchContext, Value) -> ResponseFuture + Send + Sync>;

/// A middleware thunk: `(ctx, args, next)`. `next` carries the remainder of
/// the chain, innermost being the action handler. No hidden reflection —
/// just ordinary functions folded together at compile time.
#[async_trait::async_trait]
pub trait Middleware: Send + Sync {
    async fn call(&self, ctx: DispatchContext, args: Value, next: Next) -> Result<ToolResponse>;
}

/// The remainder of a middleware chain, bound as a thunk.
#[derive(Clone)]
pub struct Next {
    inner: Handler,
}

impl Next {
    pub fn new(inner: Handler) -> Self {
        Self { inner }
    }

    pub fn run(self, ctx: DispatchContext, args: Value) -> ResponseFuture {
        (self.inner)(ctx, args)
    }
}

/// Presenter hint controlling how a handler's output is rendered; opaque to
/// the core, interpreted only by the embedding application's response
/// pipeline.
#[derive(Debug, Clone)]
pub struct Presenter {
    pub name: String,
}

/// A single action within a tool.
pub struct ActionSpec {
    pub key: String,
    pub schema: Option<IndexMap<String, SchemaField>>,
    pub read_only: TriState,
    pub destructive: TriState,
    pub idempotent: TriState,
    pub omit_common: IndexSet<String>,
    pub handler: ActionHandler,
    pub returns: Option<Presenter>,
}

/// `cacheControl` as carried by a state-sync hint.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheControl {
    Immutable,
    NoStore,
}

/// Accumulated state-sync hint for one match pattern (action name, compound
/// `group.action`, or `*`).
#[derive(Debug, Clone, Default)]
pub struct StateSyncHint {
    pub invalidates: Vec<String>,
    pub cache_control: Option<CacheControl>,
}

#[derive(Default)]
struct GroupScope {
    middleware: Vec<Arc<dyn Middleware>>,
    omit_common: IndexSet<String>,
}

/// Accumulates the declarative description of a tool. Frozen by
/// [`crate::compiler::compile`]; subsequent mutators fail with
/// [`FusionError::BuilderFrozen`].
pub struct ToolBuilder {
    pub(crate) name: String,
    pub(crate) description: Option<String>,
    pub(crate) tags: IndexSet<String>,
    pub(crate) annotations: IndexMap<String, Value>,
    pub(crate) common_schema: Option<IndexMap<String, SchemaField>>,
    pub(crate) actions: IndexMap<String, ActionSpec>,
    pub(crate) global_middleware: Vec<Arc<dyn Middleware>>,
    groups: IndexMap<String, GroupScope>,
    current_group: Option<String>,
    pub(crate) state_sync_hints: IndexMap<String, StateSyncHint>,
    pub(crate) action_sources: IndexMap<String, String>,
    pub(crate) frozen: bool,
}

impl ToolBuilder {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            description: None,
            tags: IndexSet::new(),
            annotations: IndexMap::new(),
            common_schema: None,
            actions: IndexMap::new(),
            global_middleware: Vec::new(),
            groups: IndexMap::new(),
            current_group: None,
            state_sync_hints: IndexMap::new(),
            action_sources: IndexMap::new(),
            frozen: false,
        }
    }

    fn check_not_frozen(&self) -> Result<()> {
        if self.frozen {
            return Err(FusionError::BuilderFrozen);
        }
        Ok(())
    }

    pub fn description(&mut self, description: impl Into<String>) -> Result<&mut Self> {
        self.check_not_frozen()?;
        self.description = Some(description.into());
        Ok(self)
    }

    pub fn tag(&mut self, tag: impl Into<String>) -> Result<&mut Self> {
        self.check_not_frozen()?;
        self.tags.insert(tag.into());
        Ok(self)
    }

    pub fn annotate(&mut self, key: impl Into<String>, value: Value) -> Result<&mut Self> {
        self.check_not_frozen()?;
        self.annotations.insert(key.into(), value);
        Ok(self)
    }

    /// Replaces (never merges) the shared field shape.
    pub fn common_schema(&mut self, fields: IndexMap<String, SchemaField>) -> Result<&mut Self> {
        self.check_not_frozen()?;
        self.common_schema = Some(fields);
        Ok(self)
    }

    /// Opens a group scope. Nested groups are not supported — calling this
    /// while a group is already open closes the previous one implicitly.
    pub fn open_group(&mut self, name: impl Into<String>) -> Result<&mut Self> {
        self.check_not_frozen()?;
        let name = name.into();
        self.groups.entry(name.clone()).or_default();
        self.current_group = Some(name);
        Ok(self)
    }

    pub fn close_group(&mut self) -> Result<&mut Self> {
        self.check_not_frozen()?;
        self.current_group = None;
        Ok(self)
    }

    /// Appends middleware to the current scope (tool-global, or the open
    /// group if one is active).
    pub fn middleware(&mut self, mw: Arc<dyn Middleware>) -> Result<&mut Self> {
        self.check_not_frozen()?;
        match &self.current_group {
            Some(group) => self.groups.entry(group.clone()).or_default().middleware.push(mw),
            None => self.global_middleware.push(mw),
        }
        Ok(self)
    }

    /// Per-group omission, applied as a default to every action added while
    /// this group is open (individual actions may add more via
    /// `add_action`'s `omit_common` parameter).
    pub fn group_omit_common(&mut self, fields: impl IntoIterator<Item = impl Into<String>>) -> Result<&mut Self> {
        self.check_not_frozen()?;
        let Some(group) = &self.current_group else {
            return Ok(self);
        };
        let scope = self.groups.entry(group.clone()).or_default();
        for f in fields {
            scope.omit_common.insert(f.into());
        }
        Ok(self)
    }

    /// Adds an action. Fails with `DUPLICATE_ACTION` if the key already
    /// exists (key is compounded with the open group's name, if any), or
    /// `DOTTED_ACTION_NAME` if the bare name contains `.`.
    #[allow(clippy::too_many_arguments)]
    pub fn add_action(
        &mut self,
        name: impl Into<String>,
        schema: Option<IndexMap<String, SchemaField>>,
        read_only: TriState,
        destructive: TriState,
        idempotent: TriState,
        omit_common: impl IntoIterator<Item = impl Into<String>>,
        handler: ActionHandler,
        returns: Option<Presenter>,
    ) -> Result<&mut Self> {
        self.check_not_frozen()?;
        let name = name.into();
        if name.contains('.') {
            return Err(FusionError::DottedActionName(name));
        }

        let key = match &self.current_group {
            Some(group) => format!("{group}.{name}"),
            None => name,
        };

        if self.actions.contains_key(&key) {
            return Err(FusionError::DuplicateAction(key));
        }

        let mut omit: IndexSet<String> = omit_common.into_iter().map(Into::into).collect();
        if let Some(group) = &self.current_group
            && let Some(scope) = self.groups.get(group)
        {
            for f in &scope.omit_common {
                omit.insert(f.clone());
            }
        }

        self.actions.insert(
            key.clone(),
            ActionSpec {
                key,
                schema,
                read_only,
                destructive,
                idempotent,
                omit_common: omit,
                handler,
                returns,
            },
        );
        Ok(self)
    }

    /// Appends invalidation patterns for the given match key (action name,
    /// `group.action`, or `*`). Multiple calls accumulate.
    pub fn invalidates(
        &mut self,
        match_pattern: impl Into<String>,
        patterns: impl IntoIterator<Item = impl Into<String>>,
    ) -> Result<&mut Self> {
        self.check_not_frozen()?;
        let entry = self.state_sync_hints.entry(match_pattern.into()).or_default();
        entry.invalidates.extend(patterns.into_iter().map(Into::into));
        Ok(self)
    }

    /// Sets `cacheControl = "immutable"`. Mutually exclusive with `stale`;
    /// last write wins.
    pub fn cached(&mut self, match_pattern: impl Into<String>) -> Result<&mut Self> {
        self.check_not_frozen()?;
        self.state_sync_hints.entry(match_pattern.into()).or_default().cache_control =
            Some(CacheControl::Immutable);
        Ok(self)
    }

    /// Sets `cacheControl = "no-store"`. Mutually exclusive with `cached`;
    /// last write wins.
    pub fn stale(&mut self, match_pattern: impl Into<String>) -> Result<&mut Self> {
        self.check_not_frozen()?;
        self.state_sync_hints.entry(match_pattern.into()).or_default().cache_control =
            Some(CacheControl::NoStore);
        Ok(self)
    }

    /// Attaches the handler's source text for the entitlement scanner to
    /// analyze at compile time. Optional: an action with no recorded source
    /// is simply skipped by the scanner rather than treated as a violation.
    pub fn action_source(&mut self, action_key: impl Into<String>, source: impl Into<String>) -> Result<&mut Self> {
        self.check_not_frozen()?;
        self.action_sources.insert(action_key.into(), source.into());
        Ok(self)
    }

    pub(crate) fn middleware_for_action(&self, action_key: &str) -> Vec<Arc<dyn Middleware>> {
        let group_name = action_key.split_once('.').map(|(g, _)| g);
        let mut chain = self.global_middleware.clone();
        if let Some(group_name) = group_name
            && let Some(scope) = self.groups.get(group_name)
        {
            chain.extend(scope.middleware.iter().cloned());
        }
        chain
    }
}

#[cfg(test)]
pub(crate) fn noop_handler() -> ActionHandler {
    Arc::new(|_ctx, _args| Box::pin(async { Ok(HandlerOutput::Response(ToolResponse::empty())) }))
}
