use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Shared protocol definitions for daemon-client communication
/// This module provides a single source of truth for all IPC message types
/// to ensure consistency between daemon and direct execution modes.
///
/// The wire format is newline-delimited JSON, one request per connection:
///   client line 1: `{"token": "<hex>"}`
///   client line 2: `{"command": "<name>", "args": {...}}`
///   daemon line 1: `{"success": bool, "data": ..., "error": ..., "cached": bool, "metadata": {...}}`

/// Maximum size of a single protocol line. Anything larger is rejected
/// before parsing so a misbehaving peer cannot balloon daemon memory.
pub const MAX_MESSAGE_SIZE: usize = 1024 * 1024;

/// First line sent by a client: the shared-secret token.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct AuthLine {
    pub token: String,
}

/// Second line sent by a client: the command to execute.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct CommandRequest {
    pub command: String,

    #[serde(default)]
    pub args: Map<String, Value>,
}

impl CommandRequest {
    pub fn new(command: impl Into<String>) -> Self {
        Self {
            command: command.into(),
            args: Map::new(),
        }
    }

    pub fn with_arg(mut self, key: &str, value: Value) -> Self {
        self.args.insert(key.to_string(), value);
        self
    }

    /// String view of an argument, accepting both string and scalar encodings
    pub fn arg_str(&self, key: &str) -> Option<String> {
        match self.args.get(key)? {
            Value::String(s) => Some(s.clone()),
            Value::Number(n) => Some(n.to_string()),
            Value::Bool(b) => Some(b.to_string()),
            _ => None,
        }
    }

    pub fn arg_usize(&self, key: &str) -> Option<usize> {
        match self.args.get(key)? {
            Value::Number(n) => n.as_u64().map(|n| n as usize),
            Value::String(s) => s.parse().ok(),
            _ => None,
        }
    }

    pub fn arg_bool(&self, key: &str) -> Option<bool> {
        match self.args.get(key)? {
            Value::Bool(b) => Some(*b),
            Value::String(s) => s.parse().ok(),
            _ => None,
        }
    }
}

/// Single response line written back by the daemon (or synthesized by the
/// client's direct-execution fallback). Immutable once constructed.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct CommandResult {
    pub success: bool,

    #[serde(default)]
    pub data: Option<String>,

    #[serde(default)]
    pub error: Option<String>,

    #[serde(default)]
    pub cached: bool,

    #[serde(default)]
    pub metadata: Map<String, Value>,
}

impl CommandResult {
    pub fn ok(data: impl Into<String>) -> Self {
        Self {
            success: true,
            data: Some(data.into()),
            error: None,
            cached: false,
            metadata: Map::new(),
        }
    }

    pub fn err(message: impl Into<String>) -> Self {
        Self {
            success: false,
            data: None,
            error: Some(message.into()),
            cached: false,
            metadata: Map::new(),
        }
    }

    pub fn with_meta(mut self, key: &str, value: Value) -> Self {
        self.metadata.insert(key.to_string(), value);
        self
    }

    /// Mark a result as served from the daemon's cache, stamping its age
    pub fn into_cached(mut self, age_seconds: u64) -> Self {
        self.cached = true;
        self.metadata
            .insert("cache_age_seconds".to_string(), Value::from(age_seconds));
        self
    }
}

/// Validate a raw protocol line before attempting to parse it
pub fn validate_message_size(line: &str) -> Result<(), String> {
    if line.len() > MAX_MESSAGE_SIZE {
        return Err(format!(
            "message of {} bytes exceeds maximum of {} bytes",
            line.len(),
            MAX_MESSAGE_SIZE
        ));
    }
    Ok(())
}
