//! The five-stage dispatch pipeline: parse the discriminator, validate,
//! run the middleware chain down to the handler, then return a uniform
//! response envelope. Unlike most of this crate's surface, dispatch never
//! propagates a `Result` to its caller — every outcome, including
//! `UNKNOWN_ACTION` and `VALIDATION_ERROR`, is rendered as a
//! [`ToolResponse`], matching the "uniform envelope" requirement callers
//! depend on.

use serde_json::Value;

use crate::builder::DispatchContext;
use crate::compiler::CompiledTool;
use crate::error::ErrorCode;
use crate::response::ToolResponse;

#[cfg(test)]
mod tests;

/// Runs the full dispatch pipeline for one call against a compiled tool.
pub async fn dispatch(compiled: &CompiledTool, ctx: DispatchContext, args: Value) -> ToolResponse {
    let Some(action_key) = args.get("action").and_then(Value::as_str) else {
        return unknown_action(compiled, "<missing>");
    };

    let Some(entry) = compiled.dispatch.get(action_key) else {
        return unknown_action(compiled, action_key);
    };

    let violations = entry.validate(&args);
    if !violations.is_empty() {
        let message = violations
            .iter()
            .map(|v| format!("{}: {}", v.path, v.message))
            .collect::<Vec<_>>()
            .join("; ");
        return ToolResponse::error(ErrorCode::ValidationError, message, None, None);
    }

    match entry.invoke(ctx, args).await {
        Ok(response) => response,
        Err(e) => ToolResponse::error(e.code(), e.to_string(), None, None),
    }
}

fn unknown_action(compiled: &CompiledTool, action: &str) -> ToolResponse {
    let available: Vec<String> = compiled.action_keys().into_iter().map(String::from).collect();
    ToolResponse::error(
        ErrorCode::UnknownAction,
        format!("unknown action '{action}'"),
        Some("call list_tools to see available actions".to_string()),
        Some(available),
    )
}
