//! Command handler trait and handler-side error types.
//!
//! Handlers are the seam between the engine and the embedding host's domain
//! logic: object creation, mesh edits, material setup. The engine never
//! knows what a handler does — it only validates, invokes, and records.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Outcome of handler-declared parameter validation.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Validation {
    /// Whether the parameters are acceptable.
    pub valid: bool,
    /// Individual validation failures, empty when valid.
    #[serde(default)]
    pub errors: Vec<String>,
}

impl Validation {
    /// Accepts the parameters.
    #[must_use]
    pub fn ok() -> Self {
        Self {
            valid: true,
            errors: Vec::new(),
        }
    }

    /// Rejects the parameters with a single reason.
    #[must_use]
    pub fn reject(reason: impl Into<String>) -> Self {
        Self {
            valid: false,
            errors: vec![reason.into()],
        }
    }

    /// Rejects the parameters with multiple reasons.
    #[must_use]
    pub fn reject_all(reasons: Vec<String>) -> Self {
        Self {
            valid: false,
            errors: reasons,
        }
    }
}

/// Handler failure categories.
///
/// The category feeds error-pattern aggregation: failures with the same
/// category and message prefix are counted as one recurring pattern.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum HandlerErrorKind {
    /// A parameter had the right shape but an unusable value.
    InvalidArgument,
    /// The entity the command targets does not exist in the host.
    MissingObject,
    /// The host cannot perform this operation in its current mode.
    UnsupportedOperation,
    /// The host application's state rejected the mutation.
    HostState,
    /// An I/O operation inside the handler failed.
    Io,
    /// The handler panicked; converted to a failure at the dispatch boundary.
    Panic,
    /// Unclassified failure.
    Unknown,
}

impl HandlerErrorKind {
    /// Returns a lowercase label suitable for metrics and pattern keys.
    #[must_use]
    pub const fn as_label(&self) -> &'static str {
        match self {
            Self::InvalidArgument => "invalid_argument",
            Self::MissingObject => "missing_object",
            Self::UnsupportedOperation => "unsupported_operation",
            Self::HostState => "host_state",
            Self::Io => "io",
            Self::Panic => "panic",
            Self::Unknown => "unknown",
        }
    }
}

impl Default for HandlerErrorKind {
    fn default() -> Self {
        Self::Unknown
    }
}

impl std::fmt::Display for HandlerErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_label())
    }
}

/// Failure raised by a command handler.
#[derive(Debug, Clone, thiserror::Error, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
#[error("{kind}: {message}")]
pub struct HandlerError {
    /// Failure category.
    pub kind: HandlerErrorKind,
    /// Failure message.
    pub message: String,
    /// Optional extra detail (truncated backtraces, host error codes).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}

impl HandlerError {
    /// Creates a new handler error.
    #[must_use]
    pub fn new(kind: HandlerErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            detail: None,
        }
    }

    /// Sets extra failure detail.
    #[must_use]
    pub fn with_detail(mut self, detail: impl Into<String>) -> Self {
        self.detail = Some(detail.into());
        self
    }

    /// Creates an invalid-argument error.
    #[must_use]
    pub fn invalid_argument(message: impl Into<String>) -> Self {
        Self::new(HandlerErrorKind::InvalidArgument, message)
    }

    /// Creates a missing-object error.
    #[must_use]
    pub fn missing_object(message: impl Into<String>) -> Self {
        Self::new(HandlerErrorKind::MissingObject, message)
    }

    /// Creates a host-state error.
    #[must_use]
    pub fn host_state(message: impl Into<String>) -> Self {
        Self::new(HandlerErrorKind::HostState, message)
    }
}

/// A registered command implementation.
///
/// Implementations run on the host's apply thread; they may freely mutate
/// host state. Validation must be side-effect free: when it rejects, the
/// engine guarantees `execute` is never called for that invocation.
pub trait CommandHandler: Send + Sync {
    /// One-line human description, surfaced through registry listings.
    fn describe(&self) -> &str {
        ""
    }

    /// Optional JSON schema for the handler's parameters.
    ///
    /// Used by schema/documentation generation in the wire layer.
    fn schema(&self) -> Option<Value> {
        None
    }

    /// Validates parameters before execution.
    ///
    /// The default accepts everything.
    fn validate(&self, params: &Value) -> Validation {
        let _ = params;
        Validation::ok()
    }

    /// Executes the command against host state.
    ///
    /// # Errors
    ///
    /// Returns a [`HandlerError`] describing the failure; host state may
    /// already be partially mutated when this happens.
    fn execute(&self, params: &Value) -> Result<Value, HandlerError>;
}

/// A handler that succeeds without touching anything.
#[derive(Debug, Default)]
pub struct NoOpHandler;

impl CommandHandler for NoOpHandler {
    fn describe(&self) -> &str {
        "does nothing and succeeds"
    }

    fn execute(&self, _params: &Value) -> Result<Value, HandlerError> {
        Ok(Value::Null)
    }
}

/// A handler that always fails with a configurable error.
#[derive(Debug)]
pub struct FailingHandler {
    error: HandlerError,
}

impl FailingHandler {
    /// Creates a new failing handler with the given error.
    #[must_use]
    pub const fn new(error: HandlerError) -> Self {
        Self { error }
    }
}

impl CommandHandler for FailingHandler {
    fn describe(&self) -> &str {
        "always fails"
    }

    fn execute(&self, _params: &Value) -> Result<Value, HandlerError> {
        Err(self.error.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn validation_default_accepts() {
        let handler = NoOpHandler;
        let validation = handler.validate(&json!({"anything": true}));
        assert!(validation.valid);
        assert!(validation.errors.is_empty());
    }

    #[test]
    fn reject_collects_reason() {
        let validation = Validation::reject("missing 'type'");
        assert!(!validation.valid);
        assert_eq!(validation.errors, vec!["missing 'type'".to_string()]);
    }

    #[test]
    fn noop_handler_returns_null() {
        let handler = NoOpHandler;
        let result = handler.execute(&json!({})).unwrap();
        assert!(result.is_null());
    }

    #[test]
    fn failing_handler_fails() {
        let handler = FailingHandler::new(HandlerError::missing_object("no such object 'Cube'"));
        let err = handler.execute(&json!({})).unwrap_err();
        assert_eq!(err.kind, HandlerErrorKind::MissingObject);
        assert!(err.to_string().contains("missing_object"));
    }

    #[test]
    fn handler_error_detail_is_optional_on_the_wire() {
        let err = HandlerError::invalid_argument("angle out of range");
        let json = serde_json::to_value(&err).unwrap();
        assert!(json.get("detail").is_none());

        let err = err.with_detail("angle=400");
        let json = serde_json::to_value(&err).unwrap();
        assert_eq!(json["detail"], "angle=400");
    }
}
