//! Derives a [`ToolContract`]: a stable, serializable description of a
//! compiled tool's surface, declared behavior, and rough token cost, used
//! for drift detection against a lockfile.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};

use crate::builder::TriState;
use crate::compiler::{CompiledTool, canonical_json};
use crate::entitlement::Entitlements;

fn tristate_label(t: TriState) -> &'static str {
    match t {
        TriState::Unset => "unset",
        TriState::True => "true",
        TriState::False => "false",
    }
}

/// Per-action declared behavior: the three tri-state safety flags.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ActionBehavior {
    pub action: String,
    pub read_only: String,
    pub destructive: String,
    pub idempotent: String,
}

/// A rough, comparable proxy for how expensive an action's surface is to
/// hand to a model: field count and description length. Not a byte-exact
/// token count — just enough signal to flag a contract that grew
/// considerably heavier.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct TokenEconomics {
    pub total_field_count: usize,
    pub total_description_chars: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ToolContract {
    pub name: String,
    pub tags: Vec<String>,
    pub fingerprint: String,
    pub action_keys: Vec<String>,
    pub schema_digest: String,
    pub behavior: Vec<ActionBehavior>,
    pub token_economics: TokenEconomics,
    pub entitlements: Entitlements,
    /// A digest over the tool's full contract — schema, declared behavior,
    /// token economics, and entitlements — not just the schema-level
    /// `fingerprint`. This is what drift detection in [`crate::introspector::Lockfile::check`]
    /// compares, so a handler gaining an entitlement (e.g. a new
    /// `std::fs::write` call) without touching its schema still registers as
    /// changed.
    pub integrity: String,
}

fn schema_digest(schema: &Value) -> String {
    let digest = Sha256::digest(canonical_json(schema).as_bytes());
    hex::encode(digest)
}

fn integrity_digest(
    fingerprint: &str,
    action_keys: &[String],
    schema_digest: &str,
    behavior: &[ActionBehavior],
    token_economics: &TokenEconomics,
    entitlements: &Entitlements,
) -> String {
    let value = serde_json::json!({
        "fingerprint": fingerprint,
        "actionKeys": action_keys,
        "schemaDigest": schema_digest,
        "behavior": behavior,
        "tokenEconomics": token_economics,
        "entitlements": entitlements,
    });
    let digest = Sha256::digest(canonical_json(&value).as_bytes());
    hex::encode(digest)
}

fn count_fields_and_chars(schema: &Value) -> (usize, usize) {
    let mut fields = 0;
    let mut chars = 0;
    if let Some(one_of) = schema.get("oneOf").and_then(Value::as_array) {
        for branch in one_of {
            if let Some(props) = branch.get("properties").and_then(Value::as_object) {
                fields += props.len();
                for (_, field) in props {
                    if let Some(desc) = field.get("description").and_then(Value::as_str) {
                        chars += desc.len();
                    }
                }
            }
        }
    }
    (fields, chars)
}

impl ToolContract {
    pub fn derive(tool: &CompiledTool) -> Self {
        let mut action_keys: Vec<String> = tool.dispatch.keys().cloned().collect();
        action_keys.sort();

        let mut behavior: Vec<ActionBehavior> = tool
            .dispatch
            .values()
            .map(|entry| ActionBehavior {
                action: entry.action_key.clone(),
                read_only: tristate_label(entry.read_only).to_string(),
                destructive: tristate_label(entry.destructive).to_string(),
                idempotent: tristate_label(entry.idempotent).to_string(),
            })
            .collect();
        behavior.sort_by(|a, b| a.action.cmp(&b.action));

        let (total_field_count, total_description_chars) = count_fields_and_chars(&tool.input_schema);
        let schema_digest = schema_digest(&tool.input_schema);
        let token_economics = TokenEconomics {
            total_field_count,
            total_description_chars,
        };
        let entitlements = tool.aggregate_entitlements();
        let integrity = integrity_digest(&tool.fingerprint, &action_keys, &schema_digest, &behavior, &token_economics, &entitlements);

        Self {
            name: tool.name.clone(),
            tags: tool.tags.clone(),
            fingerprint: tool.fingerprint.clone(),
            action_keys,
            schema_digest,
            behavior,
            token_economics,
            entitlements,
            integrity,
        }
    }

    pub fn behavior_for(&self, action: &str) -> Option<&ActionBehavior> {
        self.behavior.iter().find(|b| b.action == action)
    }
}
