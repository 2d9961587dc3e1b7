//! Compiles a frozen [`ToolBuilder`] into a [`CompiledTool`]: a single
//! discriminated-union input schema plus an O(1) dispatch table keyed by
//! action. Grounded on `oxicrab::agent::tools::registry`'s `canonical_json`
//! (field-sorted, null-dropped serialization used for fingerprinting) and on
//! the registry's three-phase execute pipeline for how middleware chains are
//! folded around a handler.

use indexmap::IndexMap;
use serde_json::{Map, Value, json};
use sha2::{Digest, Sha256};
use std::sync::Arc;

use crate::builder::{
    ActionSpec, DispatchContext, HandlerOutput, Middleware, Next, ResponseFuture, StateSyncHint, ToolBuilder, TriState,
};
use crate::entitlement::{self, ClaimVerdict, Claims};
use crate::error::{FieldViolation, FusionError, Result};
use crate::response::ToolResponse;
use crate::schema::TypeDescriptor;


type Validator = Arc<dyn Fn(&Value) -> Vec<FieldViolation> + Send + Sync>;

/// One entry in the compiled dispatch table.
pub struct DispatchEntry {
    pub action_key: String,
    pub read_only: TriState,
    pub destructive: TriState,
    pub idempotent: TriState,
    pub(crate) validator: Validator,
    pub(crate) handler: Arc<dyn Fn(DispatchContext, Value) -> ResponseFuture + Send + Sync>,
}

impl DispatchEntry {
    pub async fn invoke(&self, ctx: DispatchContext, args: Value) -> Result<ToolResponse> {
        (self.handler)(ctx, args).await
    }

    /// Validates `args` against this action's field shape. Self-contained:
    /// does not require the originating [`ToolBuilder`] to still be alive.
    pub fn validate(&self, args: &Value) -> Vec<FieldViolation> {
        (self.validator)(args)
    }
}

/// The output of compiling a tool: a discriminated-union JSON schema, an
/// O(1) dispatch table, the accumulated state-sync hints, and a stable
/// content fingerprint.
pub struct CompiledTool {
    pub name: String,
    pub description: Option<String>,
    pub tags: Vec<String>,
    pub annotations: IndexMap<String, Value>,
    pub input_schema: Value,
    pub dispatch: IndexMap<String, DispatchEntry>,
    pub state_sync: IndexMap<String, StateSyncHint>,
    /// Per-action entitlement scan, present only for actions whose handler
    /// source was registered via `ToolBuilder::action_source`.
    pub entitlements: IndexMap<String, ClaimVerdict>,
    pub fingerprint: String,
}

impl CompiledTool {
    pub fn action_keys(&self) -> Vec<&str> {
        self.dispatch.keys().map(String::as_str).collect()
    }

    /// Rolls every scanned action's entitlements up into a single tool-level
    /// summary: a category is asserted if any action's handler source
    /// tripped it, and `raw` is the de-duplicated union of pattern names.
    pub fn aggregate_entitlements(&self) -> entitlement::Entitlements {
        let mut out = entitlement::Entitlements::default();
        for verdict in self.entitlements.values() {
            out.filesystem |= verdict.entitlements.filesystem;
            out.network |= verdict.entitlements.network;
            out.subprocess |= verdict.entitlements.subprocess;
            out.crypto |= verdict.entitlements.crypto;
            out.code_evaluation |= verdict.entitlements.code_evaluation;
            out.raw.extend(verdict.entitlements.raw.iter().cloned());
        }
        out.raw.sort();
        out.raw.dedup();
        out
    }
}

/// Canonical serialization used for fingerprinting: object keys sorted,
/// `null` values dropped, arrays preserved in order. Mirrors the teacher's
/// `canonical_json` helper used for cache keys.
pub(crate) fn canonical_json(value: &Value) -> String {
    canonical_value(value).to_string()
}

fn canonical_value(value: &Value) -> Value {
    match value {
        Value::Object(map) => {
            let mut sorted: Vec<(&String, &Value)> = map.iter().filter(|(_, v)| !v.is_null()).collect();
            sorted.sort_by(|a, b| a.0.cmp(b.0));
            let mut out = Map::new();
            for (k, v) in sorted {
                out.insert(k.clone(), canonical_value(v));
            }
            Value::Object(out)
        }
        Value::Array(items) => Value::Array(items.iter().map(canonical_value).collect()),
        other => other.clone(),
    }
}

fn type_descriptor_to_json(td: &TypeDescriptor) -> Value {
    match td {
        TypeDescriptor::String => json!({"type": "string"}),
        TypeDescriptor::Integer => json!({"type": "integer"}),
        TypeDescriptor::Number => json!({"type": "number"}),
        TypeDescriptor::Boolean => json!({"type": "boolean"}),
        TypeDescriptor::Enum(values) => json!({"type": "string", "enum": values}),
        TypeDescriptor::Array(inner) => json!({"type": "array", "items": type_descriptor_to_json(inner)}),
        TypeDescriptor::Object(fields) => {
            let mut props = Map::new();
            for (name, td) in fields {
                props.insert(name.clone(), type_descriptor_to_json(td));
            }
            json!({"type": "object", "properties": props})
        }
    }
}

/// Computes `S(f)`: the set of action keys that require common field `f`
/// (i.e. did not list it in their `omitCommon` set).
fn required_by(builder: &ToolBuilder, field: &str) -> Vec<String> {
    builder
        .actions
        .values()
        .filter(|a| !a.omit_common.contains(field))
        .map(|a| a.key.clone())
        .collect()
}

fn annotate_common_field(description: Option<&str>, required_by: &[String], total_actions: usize) -> Option<String> {
    let suffix = if required_by.len() == total_actions {
        "(always required)".to_string()
    } else {
        format!("Required for: {}", required_by.join(", "))
    };
    Some(match description {
        Some(d) if !d.is_empty() => format!("{d} {suffix}"),
        _ => suffix,
    })
}

fn detect_schema_conflicts(builder: &ToolBuilder) -> Result<()> {
    let mut seen: IndexMap<String, (TypeDescriptor, String)> = IndexMap::new();

    let mut check = |field: &str, td: TypeDescriptor, action_key: &str| -> Result<()> {
        match seen.get(field) {
            Some((existing_td, existing_action)) if existing_td != &td => Err(FusionError::SchemaConflict {
                field: field.to_string(),
                actions: vec![existing_action.clone(), action_key.to_string()],
            }),
            _ => {
                seen.insert(field.to_string(), (td, action_key.to_string()));
                Ok(())
            }
        }
    };

    if let Some(common) = &builder.common_schema {
        for (name, field) in common {
            check(name, field.describe().type_descriptor, "<common>")?;
        }
    }

    for action in builder.actions.values() {
        if let Some(schema) = &action.schema {
            for (name, field) in schema {
                check(name, field.describe().type_descriptor, &action.key)?;
            }
        }
    }

    Ok(())
}

/// At most two of `readOnly`/`destructive`/`idempotent` may be simultaneously
/// asserted `true` on a single action (spec §3) — `false` and `Unset` both
/// leave the flag un-asserted, so a handler can still be explicitly
/// `read_only = false` alongside two `true` flags.
fn detect_overasserted_flags(builder: &ToolBuilder) -> Result<()> {
    for action in builder.actions.values() {
        let asserted = [action.read_only, action.destructive, action.idempotent]
            .into_iter()
            .filter(|t| t.is_true())
            .count();
        if asserted == 3 {
            return Err(FusionError::TooManyFlagsAsserted { action: action.key.clone() });
        }
    }
    Ok(())
}

fn build_action_schema(builder: &ToolBuilder, action: &ActionSpec) -> Value {
    let mut properties = Map::new();
    let mut required = Vec::new();

    properties.insert(
        "action".to_string(),
        json!({"type": "string", "const": action.key, "description": "discriminator"}),
    );
    required.push("action".to_string());

    if let Some(common) = &builder.common_schema {
        for (name, field) in common {
            if action.omit_common.contains(name) {
                continue;
            }
            let desc = field.describe();
            let mut schema = type_descriptor_to_json(&desc.type_descriptor);
            let ann = annotate_common_field(desc.description.as_deref(), &required_by(builder, name), builder.actions.len());
            if let (Value::Object(obj), Some(ann)) = (&mut schema, ann) {
                obj.insert("description".to_string(), Value::String(ann));
            }
            if !field.is_optional() {
                required.push(name.clone());
            }
            properties.insert(name.clone(), schema);
        }
    }

    if let Some(action_schema) = &action.schema {
        for (name, field) in action_schema {
            let desc = field.describe();
            let schema = type_descriptor_to_json(&desc.type_descriptor);
            if !field.is_optional() {
                required.push(name.clone());
            }
            properties.insert(name.clone(), schema);
        }
    }

    json!({
        "type": "object",
        "properties": properties,
        "required": required,
    })
}

/// Builds a self-contained validator closure for one action: it captures
/// clones of the relevant `Arc<dyn FieldSchema>` entries so it outlives the
/// builder that produced it.
fn build_validator(builder: &ToolBuilder, action: &ActionSpec) -> Validator {
    let mut fields: Vec<(String, crate::schema::SchemaField)> = Vec::new();

    if let Some(common) = &builder.common_schema {
        for (name, field) in common {
            if !action.omit_common.contains(name) {
                fields.push((name.clone(), field.clone()));
            }
        }
    }
    if let Some(schema) = &action.schema {
        for (name, field) in schema {
            fields.push((name.clone(), field.clone()));
        }
    }

    Arc::new(move |args: &Value| {
        let obj = args.as_object();
        fields
            .iter()
            .filter_map(|(name, field)| {
                let value = obj.and_then(|o| o.get(name));
                field.validate(name, value).err()
            })
            .collect()
    })
}

fn wrap_with_implicit_response(
    tool: String,
    action: String,
    handler: crate::builder::ActionHandler,
) -> Arc<dyn Fn(DispatchContext, Value) -> ResponseFuture + Send + Sync> {
    Arc::new(move |ctx, args| {
        let handler = handler.clone();
        let tool = tool.clone();
        let action = action.clone();
        Box::pin(async move {
            match handler(ctx, args).await {
                Ok(HandlerOutput::Response(r)) => Ok(r.ensure_non_empty()),
                Ok(HandlerOutput::Value(v)) => Ok(ToolResponse::implicit(v)),
                Err(FusionError::Internal(e)) => Err(FusionError::Handler {
                    tool,
                    action,
                    message: e.to_string(),
                }),
                Err(e) => Err(e),
            }
        })
    })
}

fn compose_middleware(mws: Vec<Arc<dyn Middleware>>, handler: Arc<dyn Fn(DispatchContext, Value) -> ResponseFuture + Send + Sync>) -> Arc<dyn Fn(DispatchContext, Value) -> ResponseFuture + Send + Sync> {
    mws.into_iter().rev().fold(handler, |acc, mw| {
        let next_inner = acc;
        Arc::new(move |ctx: DispatchContext, args: Value| {
            let mw = mw.clone();
            let next = Next::new(next_inner.clone());
            Box::pin(async move { mw.call(ctx, args, next).await }) as ResponseFuture
        })
    })
}

/// Compiles the builder. Freezes it as a side effect, matching the spec's
/// "frozen on first compile" rule — a second call on the same builder
/// recompiles from the same frozen state rather than failing, since
/// freezing only blocks *mutation*, not re-reading.
pub fn compile(builder: &mut ToolBuilder) -> Result<CompiledTool> {
    builder.frozen = true;

    if builder.actions.is_empty() {
        return Err(FusionError::Internal(anyhow::anyhow!("tool '{}' has no actions", builder.name)));
    }

    detect_schema_conflicts(builder)?;
    detect_overasserted_flags(builder)?;

    let mut one_of = Vec::new();
    let mut dispatch = IndexMap::new();
    let mut entitlements = IndexMap::new();

    for action in builder.actions.values() {
        one_of.push(build_action_schema(builder, action));

        let mws = builder.middleware_for_action(&action.key);
        let inner = wrap_with_implicit_response(builder.name.clone(), action.key.clone(), action.handler.clone());
        let composed = compose_middleware(mws, inner);
        let validator = build_validator(builder, action);

        dispatch.insert(
            action.key.clone(),
            DispatchEntry {
                action_key: action.key.clone(),
                read_only: action.read_only,
                destructive: action.destructive,
                idempotent: action.idempotent,
                validator,
                handler: composed,
            },
        );

        if let Some(source) = builder.action_sources.get(&action.key) {
            let claims = Claims {
                read_only: action.read_only.is_true(),
                destructive: action.destructive == TriState::True,
                allowed: Vec::new(),
            };
            entitlements.insert(action.key.clone(), entitlement::scan_and_validate(source, &claims));
        }
    }

    let input_schema = json!({
        "type": "object",
        "discriminator": {"propertyName": "action"},
        "oneOf": one_of,
    });

    let fingerprint_source = json!({
        "name": builder.name,
        "description": builder.description,
        "tags": builder.tags.iter().cloned().collect::<Vec<_>>(),
        "annotations": builder.annotations,
        "schema": input_schema,
        "actions": builder.actions.keys().cloned().collect::<Vec<_>>(),
    });
    let digest = Sha256::digest(canonical_json(&fingerprint_source).as_bytes());
    let fingerprint = hex::encode(digest);

    Ok(CompiledTool {
        name: builder.name.clone(),
        description: builder.description.clone(),
        tags: builder.tags.iter().cloned().collect(),
        annotations: builder.annotations.clone(),
        input_schema,
        dispatch,
        state_sync: builder.state_sync_hints.clone(),
        entitlements,
        fingerprint,
    })
}
