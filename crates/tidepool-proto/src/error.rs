use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Machine-checkable classification of a remote call failure.
///
/// The kind is the cross-boundary contract; `name`/`message` text exists
/// for humans and must never be matched on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WireErrorKind {
    /// The callee has no handler registered at the requested path.
    ProcedureNotRegistered,
    /// The handler ran and returned an error.
    HandlerFailed,
}

/// The error payload of an `rpc_exception` frame.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WireError {
    pub kind: WireErrorKind,
    pub name: String,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stack: Option<String>,
    #[serde(default, skip_serializing_if = "Map::is_empty")]
    pub details: Map<String, Value>,
}

impl WireError {
    pub fn procedure_not_registered(path: impl Into<String>) -> Self {
        let path = path.into();
        let mut details = Map::new();
        details.insert("path".to_string(), Value::String(path.clone()));
        Self {
            kind: WireErrorKind::ProcedureNotRegistered,
            name: "ProcedureNotRegistered".to_string(),
            message: format!("procedure '{path}' is not registered"),
            stack: None,
            details,
        }
    }

    pub fn handler_failed(name: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            kind: WireErrorKind::HandlerFailed,
            name: name.into(),
            message: message.into(),
            stack: None,
            details: Map::new(),
        }
    }

    /// The procedure path carried by a `ProcedureNotRegistered` payload.
    pub fn procedure_path(&self) -> Option<&str> {
        self.details.get("path").and_then(Value::as_str)
    }
}

impl std::fmt::Display for WireError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.name, self.message)
    }
}
