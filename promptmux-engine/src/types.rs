//! Core types shared across the engine layer
//!
//! Defines the caller-visible session configuration, the pool bucketing key,
//! and the typed message stream produced by the parser.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::hash_map::DefaultHasher;
use std::collections::{BTreeSet, HashMap};
use std::fmt;
use std::hash::{Hash, Hasher};
use std::path::PathBuf;
use std::time::Duration;
use uuid::Uuid;

/// Inclusive bounds for `SessionConfig::max_turns`
pub const MAX_TURNS_MIN: u32 = 1;
/// Upper bound for `SessionConfig::max_turns`
pub const MAX_TURNS_MAX: u32 = 50;

/// Identifier of a caller-facing session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SessionId(Uuid);

impl SessionId {
    /// Generate a fresh id
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for SessionId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// Identifier of one prompt execution
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RequestId(Uuid);

impl RequestId {
    /// Generate a fresh id
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for RequestId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for RequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// Caller-visible knobs for one session.
///
/// Immutable once a session has been created from it; the compatibility key
/// is derived from the fields that affect engine behavior.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionConfig {
    /// Working directory the engine process is started in
    pub working_dir: PathBuf,
    /// Optional system prompt passed to the engine
    pub system_prompt: Option<String>,
    /// Maximum conversation turns per prompt, in `[1, 50]`
    pub max_turns: u32,
    /// Tools the engine may invoke without prompting
    pub allowed_tools: BTreeSet<String>,
    /// Extra environment variables merged into the child environment
    pub env: HashMap<String, String>,
    /// Explicit OAuth token; falls back to the credentials provider when unset
    pub oauth_token: Option<String>,
    /// Idle time after which a pooled session is evicted
    pub max_idle: Duration,
    /// Total lifetime after which a pooled session is evicted
    pub max_lifetime: Duration,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            working_dir: PathBuf::from("."),
            system_prompt: None,
            max_turns: 10,
            allowed_tools: BTreeSet::new(),
            env: HashMap::new(),
            oauth_token: None,
            max_idle: Duration::from_secs(600),
            max_lifetime: Duration::from_secs(3600),
        }
    }
}

impl SessionConfig {
    /// Create a new config builder
    pub fn builder() -> SessionConfigBuilder {
        SessionConfigBuilder::default()
    }

    /// Validate bounds. Called once at session creation; configs are
    /// immutable afterwards.
    pub fn validate(&self) -> crate::errors::Result<()> {
        if self.max_turns < MAX_TURNS_MIN || self.max_turns > MAX_TURNS_MAX {
            return Err(crate::errors::EngineError::invalid_config(format!(
                "max_turns must be in [{MAX_TURNS_MIN}, {MAX_TURNS_MAX}], got {}",
                self.max_turns
            )));
        }
        if self.working_dir.as_os_str().is_empty() {
            return Err(crate::errors::EngineError::invalid_config(
                "working_dir must not be empty",
            ));
        }
        Ok(())
    }

    /// Pool bucketing key for this config
    pub fn key(&self) -> CompatibilityKey {
        CompatibilityKey::of(self)
    }
}

/// Builder for [`SessionConfig`]
#[derive(Debug, Default)]
pub struct SessionConfigBuilder {
    config: SessionConfig,
}

impl SessionConfigBuilder {
    /// Set the working directory
    pub fn working_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.config.working_dir = dir.into();
        self
    }

    /// Set the system prompt
    pub fn system_prompt(mut self, prompt: impl Into<String>) -> Self {
        self.config.system_prompt = Some(prompt.into());
        self
    }

    /// Set the maximum turns per prompt
    pub fn max_turns(mut self, turns: u32) -> Self {
        self.config.max_turns = turns;
        self
    }

    /// Replace the allowed tool set
    pub fn allowed_tools<I, S>(mut self, tools: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.config.allowed_tools = tools.into_iter().map(Into::into).collect();
        self
    }

    /// Add a single allowed tool
    pub fn allow_tool(mut self, tool: impl Into<String>) -> Self {
        self.config.allowed_tools.insert(tool.into());
        self
    }

    /// Add an environment variable for the engine process
    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.config.env.insert(key.into(), value.into());
        self
    }

    /// Set an explicit OAuth token
    pub fn oauth_token(mut self, token: impl Into<String>) -> Self {
        self.config.oauth_token = Some(token.into());
        self
    }

    /// Set the idle eviction window
    pub fn max_idle(mut self, idle: Duration) -> Self {
        self.config.max_idle = idle;
        self
    }

    /// Set the lifetime eviction window
    pub fn max_lifetime(mut self, lifetime: Duration) -> Self {
        self.config.max_lifetime = lifetime;
        self
    }

    /// Finish building
    pub fn build(self) -> SessionConfig {
        self.config
    }
}

/// Hash identifying sessions that may be safely reused for a request.
///
/// Equal keys imply interchangeable sessions: same working directory, system
/// prompt, turn budget and tool set. Credentials and eviction windows do not
/// participate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CompatibilityKey(u64);

impl CompatibilityKey {
    /// Derive the key from a config
    pub fn of(config: &SessionConfig) -> Self {
        let mut hasher = DefaultHasher::new();
        config.working_dir.hash(&mut hasher);
        config.system_prompt.hash(&mut hasher);
        config.max_turns.hash(&mut hasher);
        // BTreeSet iterates in sorted order, so equal sets hash equally.
        for tool in &config.allowed_tools {
            tool.hash(&mut hasher);
        }
        Self(hasher.finish())
    }
}

impl fmt::Display for CompatibilityKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:016x}", self.0)
    }
}

/// Why a request was cancelled
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CancelReason {
    /// The caller asked for cancellation
    Caller,
    /// The request deadline elapsed
    Timeout,
}

/// Stable machine-readable error label carried by terminal `Error` messages,
/// lifecycle events and metrics.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// See [`crate::errors::EngineError::SpawnFailed`]
    SpawnFailed,
    /// See [`crate::errors::EngineError::AuthFailed`]
    AuthFailed,
    /// See [`crate::errors::EngineError::InsufficientCredits`]
    InsufficientCredits,
    /// See [`crate::errors::EngineError::ProcessCrashed`]; no output had been
    /// delivered yet
    ProcessCrashed,
    /// See [`crate::errors::EngineError::ProcessCrashed`]; the crash happened
    /// after part of the response had already been delivered, so a retry
    /// would duplicate output
    PartialFailure,
    /// See [`crate::errors::EngineError::StreamProtocol`]
    StreamProtocol,
    /// See [`crate::errors::EngineError::Timeout`]
    Timeout,
    /// See [`crate::errors::EngineError::Cancelled`]
    Cancelled,
    /// See [`crate::errors::EngineError::PoolExhausted`]
    PoolExhausted,
    /// See [`crate::errors::EngineError::CircuitOpen`]
    CircuitOpen,
    /// See [`crate::errors::EngineError::InvalidConfig`]
    InvalidConfig,
    /// See [`crate::errors::EngineError::NotFound`]
    NotFound,
    /// See [`crate::errors::EngineError::Internal`]
    Internal,
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            Self::SpawnFailed => "spawn_failed",
            Self::AuthFailed => "auth_failed",
            Self::InsufficientCredits => "insufficient_credits",
            Self::ProcessCrashed => "process_crashed",
            Self::PartialFailure => "partial_failure",
            Self::StreamProtocol => "stream_protocol",
            Self::Timeout => "timeout",
            Self::Cancelled => "cancelled",
            Self::PoolExhausted => "pool_exhausted",
            Self::CircuitOpen => "circuit_open",
            Self::InvalidConfig => "invalid_config",
            Self::NotFound => "not_found",
            Self::Internal => "internal",
        };
        f.write_str(label)
    }
}

/// One unit of engine output, stamped with a monotonic timestamp.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    /// The typed payload
    #[serde(flatten)]
    pub payload: MessagePayload,
    /// Monotonic milliseconds from the injected clock
    pub timestamp_ms: u64,
}

impl Message {
    /// Construct a stamped message
    pub fn new(payload: MessagePayload, timestamp_ms: u64) -> Self {
        Self {
            payload,
            timestamp_ms,
        }
    }

    /// Whether this message ends a request's sequence
    pub fn is_terminal(&self) -> bool {
        self.payload.is_terminal()
    }
}

/// Typed engine output, discriminated by the wire `type` field.
///
/// Unknown wire discriminants are passed through as [`MessagePayload::SystemInfo`]
/// and never fail the stream.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum MessagePayload {
    /// Plain text output, including non-JSON diagnostic lines
    Text {
        /// The text content
        content: String,
    },
    /// The engine invoked a tool
    ToolUse {
        /// Tool invocation id
        id: String,
        /// Tool name
        name: String,
        /// Tool input parameters
        input: Value,
    },
    /// Result of a tool invocation
    ToolResult {
        /// Id of the originating tool invocation
        tool_use_id: String,
        /// Tool output, if any
        content: Option<Value>,
        /// Whether the tool failed
        is_error: bool,
    },
    /// Terminal failure for the request
    Error {
        /// Classified error kind
        kind: ErrorKind,
        /// Human-readable detail
        detail: String,
    },
    /// Engine status information; also carries unknown message types verbatim
    #[serde(rename = "system")]
    SystemInfo {
        /// Status subtype, `"unknown"` for unrecognized discriminants
        subtype: String,
        /// Raw payload
        data: Value,
    },
    /// Terminal success for the request
    Complete {
        /// Engine-reported statistics, if any
        stats: Option<Value>,
    },
    /// Terminal cancellation for the request
    Cancelled {
        /// Why the request was cancelled
        reason: CancelReason,
    },
}

impl MessagePayload {
    /// Whether this payload ends a request's sequence
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::Error { .. } | Self::Complete { .. } | Self::Cancelled { .. }
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(turns: u32) -> SessionConfig {
        SessionConfig::builder()
            .working_dir("/ws")
            .max_turns(turns)
            .allow_tool("Read")
            .build()
    }

    #[test]
    fn builder_sets_fields() {
        let cfg = SessionConfig::builder()
            .working_dir("/tmp/project")
            .system_prompt("be terse")
            .max_turns(3)
            .allowed_tools(["Read", "Write"])
            .env("RUST_LOG", "debug")
            .oauth_token("tok")
            .build();
        assert_eq!(cfg.working_dir, PathBuf::from("/tmp/project"));
        assert_eq!(cfg.system_prompt.as_deref(), Some("be terse"));
        assert_eq!(cfg.max_turns, 3);
        assert!(cfg.allowed_tools.contains("Write"));
        assert_eq!(cfg.env.get("RUST_LOG").map(String::as_str), Some("debug"));
        assert_eq!(cfg.oauth_token.as_deref(), Some("tok"));
    }

    #[test]
    fn max_turns_bounds_are_enforced() {
        assert!(config(0).validate().is_err());
        assert!(config(1).validate().is_ok());
        assert!(config(50).validate().is_ok());
        assert!(config(51).validate().is_err());
    }

    #[test]
    fn equal_configs_share_a_key() {
        assert_eq!(config(3).key(), config(3).key());
    }

    #[test]
    fn key_ignores_credentials_and_eviction_windows() {
        let base = config(3);
        let mut other = base.clone();
        other.oauth_token = Some("secret".into());
        other.max_idle = Duration::from_secs(1);
        other.env.insert("X".into(), "y".into());
        assert_eq!(base.key(), other.key());
    }

    #[test]
    fn key_diverges_on_system_prompt() {
        let base = config(3);
        let mut other = base.clone();
        other.system_prompt = Some("different".into());
        assert_ne!(base.key(), other.key());
    }

    #[test]
    fn key_diverges_on_tool_set() {
        let base = config(3);
        let mut other = base.clone();
        other.allowed_tools.insert("Bash".into());
        assert_ne!(base.key(), other.key());
    }

    #[test]
    fn terminal_payloads() {
        assert!(MessagePayload::Complete { stats: None }.is_terminal());
        assert!(
            MessagePayload::Error {
                kind: ErrorKind::Internal,
                detail: "x".into()
            }
            .is_terminal()
        );
        assert!(
            MessagePayload::Cancelled {
                reason: CancelReason::Timeout
            }
            .is_terminal()
        );
        assert!(
            !MessagePayload::Text {
                content: "hi".into()
            }
            .is_terminal()
        );
    }

    #[test]
    fn payload_serializes_with_wire_discriminants() {
        let text = serde_json::to_value(Message::new(
            MessagePayload::Text {
                content: "hi".into(),
            },
            7,
        ))
        .unwrap();
        assert_eq!(text["type"], "text");
        assert_eq!(text["timestamp_ms"], 7);

        let sys = serde_json::to_value(MessagePayload::SystemInfo {
            subtype: "status".into(),
            data: serde_json::json!({"ready": true}),
        })
        .unwrap();
        assert_eq!(sys["type"], "system");
    }
}
