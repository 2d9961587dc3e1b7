use thiserror::Error;

use crate::sandbox::SandboxFault;

/// Canonical error kinds from the tool-compilation and dispatch contract.
///
/// These are codes, not exception types: every variant below is surfaced to
/// callers as a stable string (`ErrorCode::as_str`) inside the response
/// envelope's structured error object, never as a host stack trace or
/// validator class name.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCode {
    UnknownTool,
    UnknownAction,
    ValidationError,
    DuplicateTool,
    DuplicateAction,
    DottedActionName,
    SchemaConflict,
    TooManyFlagsAsserted,
    BuilderFrozen,
    HandlerError,
    SandboxTimeout,
    SandboxRuntime,
    SandboxAborted,
    SandboxInvalidCode,
    SandboxOutputTooLarge,
    SandboxUnavailable,
}

impl ErrorCode {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::UnknownTool => "UNKNOWN_TOOL",
            Self::UnknownAction => "UNKNOWN_ACTION",
            Self::ValidationError => "VALIDATION_ERROR",
            Self::DuplicateTool => "DUPLICATE_TOOL",
            Self::DuplicateAction => "DUPLICATE_ACTION",
            Self::DottedActionName => "DOTTED_ACTION_NAME",
            Self::SchemaConflict => "SCHEMA_CONFLICT",
            Self::TooManyFlagsAsserted => "TOO_MANY_FLAGS_ASSERTED",
            Self::BuilderFrozen => "BUILDER_FROZEN",
            Self::HandlerError => "HANDLER_ERROR",
            Self::SandboxTimeout => "TIMEOUT",
            Self::SandboxRuntime => "RUNTIME",
            Self::SandboxAborted => "ABORTED",
            Self::SandboxInvalidCode => "INVALID_CODE",
            Self::SandboxOutputTooLarge => "OUTPUT_TOO_LARGE",
            Self::SandboxUnavailable => "UNAVAILABLE",
        }
    }
}

impl std::fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// A single offending field path inside a `VALIDATION_ERROR`.
#[derive(Debug, Clone)]
pub struct FieldViolation {
    pub path: String,
    pub message: String,
}

/// Typed error hierarchy for the tool compilation and dispatch core.
///
/// Use at module boundaries (compile, register, route, validate). Leaf
/// helper functions may continue to return `anyhow::Result` internally — the
/// `Internal` variant allows seamless conversion via `?`.
#[derive(Debug, Error)]
pub enum FusionError {
    #[error("unknown tool '{name}'; registered tools: {available:?}")]
    UnknownTool { name: String, available: Vec<String> },

    #[error("unknown action '{action}' for tool '{tool}'; available actions: {available:?}")]
    UnknownAction {
        tool: String,
        action: String,
        available: Vec<String>,
    },

    #[error("validation failed for {tool}.{action}: {violations:?}")]
    Validation {
        tool: String,
        action: String,
        violations: Vec<FieldViolation>,
    },

    #[error("tool '{0}' is already registered")]
    DuplicateTool(String),

    #[error("action '{0}' already exists on this tool")]
    DuplicateAction(String),

    #[error("action name '{0}' must not contain '.'")]
    DottedActionName(String),

    #[error("field '{field}' has conflicting type descriptors across actions {actions:?}")]
    SchemaConflict { field: String, actions: Vec<String> },

    #[error("action '{action}' asserts all three of readOnly/destructive/idempotent; at most two may be co-asserted")]
    TooManyFlagsAsserted { action: String },

    #[error("builder is frozen; compile() was already called")]
    BuilderFrozen,

    #[error("handler error in {tool}.{action}: {message}")]
    Handler {
        tool: String,
        action: String,
        message: String,
    },

    #[error("sandbox fault: {0}")]
    Sandbox(#[from] SandboxFault),

    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

impl FusionError {
    pub fn code(&self) -> ErrorCode {
        match self {
            Self::UnknownTool { .. } => ErrorCode::UnknownTool,
            Self::UnknownAction { .. } => ErrorCode::UnknownAction,
            Self::Validation { .. } => ErrorCode::ValidationError,
            Self::DuplicateTool(_) => ErrorCode::DuplicateTool,
            Self::DuplicateAction(_) => ErrorCode::DuplicateAction,
            Self::DottedActionName(_) => ErrorCode::DottedActionName,
            Self::SchemaConflict { .. } => ErrorCode::SchemaConflict,
            Self::TooManyFlagsAsserted { .. } => ErrorCode::TooManyFlagsAsserted,
            Self::BuilderFrozen => ErrorCode::BuilderFrozen,
            Self::Handler { .. } => ErrorCode::HandlerError,
            Self::Sandbox(fault) => fault.code(),
            Self::Internal(_) => ErrorCode::HandlerError,
        }
    }

    /// Whether this error kind is fatal at registration/compile time rather
    /// than local to a single dispatch call.
    pub fn is_compile_time(&self) -> bool {
        matches!(
            self,
            Self::DuplicateTool(_)
                | Self::DuplicateAction(_)
                | Self::DottedActionName(_)
                | Self::SchemaConflict { .. }
                | Self::TooManyFlagsAsserted { .. }
                | Self::BuilderFrozen
        )
    }
}

pub type Result<T> = std::result::Result<T, FusionError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_code_strings_match_spec() {
        assert_eq!(ErrorCode::UnknownTool.as_str(), "UNKNOWN_TOOL");
        assert_eq!(ErrorCode::SandboxOutputTooLarge.as_str(), "OUTPUT_TOO_LARGE");
    }

    #[test]
    fn compile_time_classification() {
        assert!(FusionError::BuilderFrozen.is_compile_time());
        assert!(!FusionError::Handler {
            tool: "t".into(),
            action: "a".into(),
            message: "boom".into()
        }
        .is_compile_time());
    }
}
