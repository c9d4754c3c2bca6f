//! Wire protocol for the stdin request server.
//!
//! The protocol is newline-delimited JSON over stdin/stdout: one request
//! object per input line, exactly one response line back. Responses are the
//! model's decoded payload, an `{"error": ..., "detail": ...}` object, or a
//! control acknowledgment.

use serde::Deserialize;
use serde_json::{json, Value};
use std::path::PathBuf;

/// One inference request, decoded from a single input line.
///
/// Override fields apply to this request only and never persist. A field
/// that is absent or `null` means "no override"; an explicitly empty string
/// overrides the configured default and suppresses that role. Constraint
/// override fields for the inactive mode are ignored.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Request {
    /// The user prompt (required).
    pub user: String,
    /// System prompt override.
    pub system: Option<String>,
    /// Assistant prompt override.
    pub assistant: Option<String>,
    /// Inline grammar override (mode=grammar).
    pub grammar: Option<String>,
    /// Grammar file override, served through the artifact cache.
    pub grammar_path: Option<PathBuf>,
    /// Inline JSON Schema override (mode=json).
    pub json_schema: Option<Value>,
    /// Schema file override, served through the artifact cache.
    pub json_schema_path: Option<PathBuf>,
}

/// Loop-management command carried in the `__cmd` field.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command {
    /// Liveness probe; answered without a model call.
    Ping,
    /// Stop the serve loop (`quit`, `exit`, or `stop`).
    Quit,
}

/// Error kinds surfaced on the response stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Malformed input line or missing required field.
    BadRequest,
    /// The endpoint returned text that does not parse as JSON.
    NonJsonOutput,
    /// Artifact loading or the inference call failed.
    Exception,
}

impl ErrorKind {
    pub fn as_str(self) -> &'static str {
        match self {
            ErrorKind::BadRequest => "bad_request",
            ErrorKind::NonJsonOutput => "non_json_output",
            ErrorKind::Exception => "exception",
        }
    }
}

/// Structured error payload written as a response line.
#[derive(Debug, Clone, PartialEq)]
pub struct ErrorBody {
    pub error: ErrorKind,
    pub detail: String,
}

impl ErrorBody {
    pub fn bad_request(detail: impl Into<String>) -> Self {
        Self {
            error: ErrorKind::BadRequest,
            detail: detail.into(),
        }
    }

    pub fn non_json_output(detail: impl Into<String>) -> Self {
        Self {
            error: ErrorKind::NonJsonOutput,
            detail: detail.into(),
        }
    }

    pub fn exception(detail: impl Into<String>) -> Self {
        Self {
            error: ErrorKind::Exception,
            detail: detail.into(),
        }
    }
}

impl From<ErrorBody> for Value {
    fn from(body: ErrorBody) -> Self {
        json!({ "error": body.error.as_str(), "detail": body.detail })
    }
}

/// Acknowledgment for a `ping` command.
pub fn pong_ack() -> Value {
    json!({ "ok": true, "pong": true })
}

/// Acknowledgment for a quit command, the last line the server emits.
pub fn bye_ack() -> Value {
    json!({ "ok": true, "bye": true })
}

/// Outcome of classifying one non-blank input line.
#[derive(Debug)]
pub enum Parsed {
    /// A control command.
    Control(Command),
    /// A well-formed inference request.
    Request(Request),
    /// A rejected line, with the `bad_request` body to emit.
    Malformed(ErrorBody),
}

/// Classify one input line.
///
/// Control commands win over request fields. An unrecognized `__cmd` value
/// falls through to normal request handling rather than being rejected.
pub fn parse_line(line: &str) -> Parsed {
    let value: Value = match serde_json::from_str(line) {
        Ok(value) => value,
        Err(_) => return Parsed::Malformed(ErrorBody::bad_request("invalid json line")),
    };

    if let Some(cmd) = value.get("__cmd").and_then(Value::as_str) {
        match cmd {
            "ping" => return Parsed::Control(Command::Ping),
            "quit" | "exit" | "stop" => return Parsed::Control(Command::Quit),
            _ => {}
        }
    }

    if !value.get("user").is_some_and(Value::is_string) {
        return Parsed::Malformed(ErrorBody::bad_request("missing 'user' string"));
    }

    match serde_json::from_value::<Request>(value) {
        Ok(request) => Parsed::Request(request),
        Err(err) => Parsed::Malformed(ErrorBody::bad_request(err.to_string())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn expect_request(line: &str) -> Request {
        match parse_line(line) {
            Parsed::Request(request) => request,
            other => panic!("expected request, got {:?}", other),
        }
    }

    fn expect_malformed(line: &str) -> ErrorBody {
        match parse_line(line) {
            Parsed::Malformed(body) => body,
            other => panic!("expected malformed, got {:?}", other),
        }
    }

    #[test]
    fn test_invalid_json_line() {
        let body = expect_malformed("not-json");
        assert_eq!(body, ErrorBody::bad_request("invalid json line"));
    }

    #[test]
    fn test_ping_command() {
        assert!(matches!(
            parse_line(r#"{"__cmd":"ping"}"#),
            Parsed::Control(Command::Ping)
        ));
    }

    #[test]
    fn test_quit_aliases() {
        for line in [
            r#"{"__cmd":"quit"}"#,
            r#"{"__cmd":"exit"}"#,
            r#"{"__cmd":"stop"}"#,
        ] {
            assert!(matches!(parse_line(line), Parsed::Control(Command::Quit)));
        }
    }

    #[test]
    fn test_control_wins_over_user_field() {
        assert!(matches!(
            parse_line(r#"{"__cmd":"ping","user":"hello"}"#),
            Parsed::Control(Command::Ping)
        ));
    }

    #[test]
    fn test_unknown_command_falls_through() {
        let request = expect_request(r#"{"__cmd":"reload","user":"hello"}"#);
        assert_eq!(request.user, "hello");

        let body = expect_malformed(r#"{"__cmd":"reload"}"#);
        assert_eq!(body, ErrorBody::bad_request("missing 'user' string"));
    }

    #[test]
    fn test_missing_user() {
        let body = expect_malformed(r#"{"system":"x"}"#);
        assert_eq!(body, ErrorBody::bad_request("missing 'user' string"));
    }

    #[test]
    fn test_non_object_lines() {
        for line in [r#"[1,2]"#, r#""text""#, "42", "null"] {
            let body = expect_malformed(line);
            assert_eq!(body, ErrorBody::bad_request("missing 'user' string"));
        }
    }

    #[test]
    fn test_non_string_user() {
        let body = expect_malformed(r#"{"user":42}"#);
        assert_eq!(body, ErrorBody::bad_request("missing 'user' string"));
    }

    #[test]
    fn test_overrides_extracted() {
        let request = expect_request(
            r#"{"user":"u","system":"s","assistant":"a","grammar":"g","json_schema":{"type":"object"}}"#,
        );
        assert_eq!(request.user, "u");
        assert_eq!(request.system.as_deref(), Some("s"));
        assert_eq!(request.assistant.as_deref(), Some("a"));
        assert_eq!(request.grammar.as_deref(), Some("g"));
        assert!(request.json_schema.is_some());
        assert!(request.grammar_path.is_none());
    }

    #[test]
    fn test_null_override_means_absent() {
        let request = expect_request(r#"{"user":"u","system":null}"#);
        assert!(request.system.is_none());
    }

    #[test]
    fn test_empty_override_preserved() {
        // An explicit empty string is a real override; it suppresses the role
        // downstream rather than falling back to the default.
        let request = expect_request(r#"{"user":"u","system":""}"#);
        assert_eq!(request.system.as_deref(), Some(""));
    }

    #[test]
    fn test_wrongly_typed_override_rejected() {
        let body = expect_malformed(r#"{"user":"u","system":7}"#);
        assert_eq!(body.error, ErrorKind::BadRequest);
        assert!(body.detail.contains("invalid type"));
    }

    #[test]
    fn test_unknown_fields_ignored() {
        let request = expect_request(r#"{"user":"u","trace_id":"abc"}"#);
        assert_eq!(request.user, "u");
    }

    #[test]
    fn test_error_body_to_value() {
        let value = Value::from(ErrorBody::exception("boom"));
        assert_eq!(value, json!({"error": "exception", "detail": "boom"}));
    }
}
