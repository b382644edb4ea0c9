//! Line-framed JSON stream parsing
//!
//! Converts the process event stream into typed [`Message`]s. The parser is
//! deliberately tolerant: unknown discriminants pass through as system info
//! and non-JSON lines become text, because the engine occasionally emits
//! human-readable diagnostics on stdout. Only transport-level faults (an
//! oversized line, the stream closing) terminate it.

use crate::clock::Clock;
use crate::errors::EngineError;
use crate::process::{classify_stderr, ProcessEvent};
use crate::types::{ErrorKind, Message, MessagePayload};
use futures::stream::Stream;
use serde_json::Value;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::debug;

/// Parse one stdout line into a payload.
///
/// Returns `None` for empty lines. Never fails: anything that is not a
/// well-formed protocol object degrades to `Text`.
pub fn parse_line(raw: &[u8]) -> Option<MessagePayload> {
    let mut line = raw;
    if line.last() == Some(&b'\r') {
        line = &line[..line.len() - 1];
    }
    if line.iter().all(|b| b.is_ascii_whitespace()) {
        return None;
    }

    let as_text = || MessagePayload::Text {
        content: String::from_utf8_lossy(line).into_owned(),
    };

    let json: Value = match serde_json::from_slice(line) {
        Ok(v @ Value::Object(_)) => v,
        _ => return Some(as_text()),
    };

    let Some(msg_type) = json.get("type").and_then(|v| v.as_str()) else {
        // A JSON object without a discriminant is not a protocol message.
        return Some(as_text());
    };

    let payload = match msg_type {
        "text" => MessagePayload::Text {
            content: json
                .get("text")
                .and_then(|v| v.as_str())
                .unwrap_or_default()
                .to_string(),
        },
        "tool_use" => MessagePayload::ToolUse {
            id: json
                .get("id")
                .and_then(|v| v.as_str())
                .unwrap_or_default()
                .to_string(),
            name: json
                .get("name")
                .and_then(|v| v.as_str())
                .unwrap_or_default()
                .to_string(),
            input: json
                .get("input")
                .cloned()
                .unwrap_or_else(|| Value::Object(serde_json::Map::new())),
        },
        "tool_result" => MessagePayload::ToolResult {
            tool_use_id: json
                .get("tool_use_id")
                .and_then(|v| v.as_str())
                .unwrap_or_default()
                .to_string(),
            content: json.get("content").cloned(),
            is_error: json
                .get("is_error")
                .and_then(|v| v.as_bool())
                .unwrap_or(false),
        },
        "error" => {
            let detail = json
                .get("message")
                .and_then(|v| v.as_str())
                .unwrap_or("engine reported an error")
                .to_string();
            let code = json.get("code").and_then(|v| v.as_str());
            MessagePayload::Error {
                kind: classify_error_line(code, &detail),
                detail,
            }
        },
        "system" => MessagePayload::SystemInfo {
            subtype: json
                .get("subtype")
                .and_then(|v| v.as_str())
                .unwrap_or("unknown")
                .to_string(),
            data: json.get("data").cloned().unwrap_or(Value::Null),
        },
        "complete" => MessagePayload::Complete {
            stats: json.get("stats").cloned(),
        },
        other => {
            debug!("passing through unknown message type: {other}");
            MessagePayload::SystemInfo {
                subtype: "unknown".to_string(),
                data: json,
            }
        },
    };
    Some(payload)
}

/// Classify an engine-reported error line into the taxonomy.
fn classify_error_line(code: Option<&str>, detail: &str) -> ErrorKind {
    let hay = format!("{} {}", code.unwrap_or(""), detail).to_lowercase();
    if hay.contains("auth") || hay.contains("unauthorized") || hay.contains("api key") {
        ErrorKind::AuthFailed
    } else if hay.contains("credit") {
        ErrorKind::InsufficientCredits
    } else {
        ErrorKind::Internal
    }
}

/// Turn a process event stream into a lazy sequence of stamped messages.
///
/// Strictly forward-only; consumed by exactly one session. A stream error or
/// process exit appends a terminal `Error` and ends the stream. The consumer
/// decides what a premature exit means for its in-flight request.
pub fn message_stream(
    mut events: mpsc::Receiver<ProcessEvent>,
    clock: Arc<dyn Clock>,
) -> impl Stream<Item = Message> + Send {
    async_stream::stream! {
        while let Some(event) = events.recv().await {
            match event {
                ProcessEvent::Line(raw) => {
                    if let Some(payload) = parse_line(&raw) {
                        yield Message::new(payload, clock.timestamp_ms());
                    }
                },
                ProcessEvent::StreamError(error) => {
                    yield Message::new(
                        MessagePayload::Error {
                            kind: error.kind(),
                            detail: error.to_string(),
                        },
                        clock.timestamp_ms(),
                    );
                    break;
                },
                ProcessEvent::Exited { code, stderr_tail } => {
                    let error = classify_stderr(&stderr_tail).unwrap_or(
                        EngineError::ProcessCrashed {
                            exit_code: code,
                            after_first_message: false,
                        },
                    );
                    yield Message::new(
                        MessagePayload::Error {
                            kind: error.kind(),
                            detail: error.to_string(),
                        },
                        clock.timestamp_ms(),
                    );
                    break;
                },
            }
        }
    }
}
