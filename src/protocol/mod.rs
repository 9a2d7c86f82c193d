//! Cross-frame envelope schema shared by both directions.
//!
//! The wire format is the JSON object the parent frame exchanges via
//! `postMessage`: `{ type, executionId, payload: { code?, result?, error?, timestamp } }`.
pub mod validator;

use std::sync::atomic::{AtomicI64, Ordering};

use serde::{Deserialize, Serialize};
use uuid::Uuid;

pub use validator::{EnvelopeValidator, ExecuteRequest, RejectReason};

/// A raw cross-document message event: the sender's origin as reported
/// by the browser, and whatever `data` it posted. Nothing in `data` is
/// trusted until it has been through [`EnvelopeValidator`].
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct FrameEvent {
    pub origin: String,
    #[serde(default)]
    pub data: serde_json::Value,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum MessageType {
    ExecuteCode,
    ExecutionResult,
    SandboxReady,
}

impl MessageType {
    /// Parses the wire name; `None` for anything outside the protocol.
    pub fn from_wire(name: &str) -> Option<Self> {
        match name {
            "EXECUTE_CODE" => Some(Self::ExecuteCode),
            "EXECUTION_RESULT" => Some(Self::ExecutionResult),
            "SANDBOX_READY" => Some(Self::SandboxReady),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Envelope {
    #[serde(rename = "type")]
    pub kind: MessageType,
    pub execution_id: String,
    pub payload: Payload,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Payload {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub code: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// Epoch milliseconds. Informational only.
    #[serde(default)]
    pub timestamp: i64,
}

/// Final report of one execution. Carrying either a result or an
/// error, never both, is what keeps `EXECUTION_RESULT` payloads well-formed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Report {
    Success(String),
    Failure(String),
}

impl Envelope {
    /// Readiness announcement with a freshly generated correlation token.
    pub fn ready() -> Self {
        Self {
            kind: MessageType::SandboxReady,
            execution_id: generate_id(),
            payload: Payload {
                timestamp: now_millis(),
                ..Payload::default()
            },
        }
    }

    pub fn result(execution_id: &str, report: Report) -> Self {
        let (result, error) = match report {
            Report::Success(text) => (Some(text), None),
            Report::Failure(text) => (None, Some(text)),
        };
        Self {
            kind: MessageType::ExecutionResult,
            execution_id: execution_id.to_string(),
            payload: Payload {
                result,
                error,
                timestamp: now_millis(),
                ..Payload::default()
            },
        }
    }

    /// Request envelope as the parent frame builds it.
    pub fn execute(execution_id: &str, code: &str) -> Self {
        Self {
            kind: MessageType::ExecuteCode,
            execution_id: execution_id.to_string(),
            payload: Payload {
                code: Some(code.to_string()),
                timestamp: now_millis(),
                ..Payload::default()
            },
        }
    }
}

/// Opaque correlation token for envelopes the sandbox originates.
pub fn generate_id() -> String {
    Uuid::new_v4().simple().to_string()
}

static LAST_TIMESTAMP: AtomicI64 = AtomicI64::new(0);

/// Wall-clock epoch milliseconds, clamped so successive envelopes never
/// carry a smaller timestamp than an earlier one.
pub fn now_millis() -> i64 {
    let now = chrono::Utc::now().timestamp_millis();
    let previous = LAST_TIMESTAMP.fetch_max(now, Ordering::SeqCst);
    previous.max(now)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_ready_envelope_shape() {
        let ready = Envelope::ready();
        let value = serde_json::to_value(&ready).unwrap();
        assert_eq!(value["type"], "SANDBOX_READY");
        assert!(!ready.execution_id.is_empty());
        assert!(value["payload"]["timestamp"].as_i64().unwrap() > 0);
        assert!(value["payload"].get("code").is_none());
        assert!(value["payload"].get("result").is_none());
        assert!(value["payload"].get("error").is_none());
    }

    #[test]
    fn test_ready_ids_are_fresh() {
        assert_ne!(Envelope::ready().execution_id, Envelope::ready().execution_id);
    }

    #[test]
    fn test_success_result_has_no_error_field() {
        let env = Envelope::result("abc123", Report::Success("ok".into()));
        let value = serde_json::to_value(&env).unwrap();
        assert_eq!(value["type"], "EXECUTION_RESULT");
        assert_eq!(value["executionId"], "abc123");
        assert_eq!(value["payload"]["result"], "ok");
        assert!(value["payload"].get("error").is_none());
    }

    #[test]
    fn test_failure_result_has_no_result_field() {
        let env = Envelope::result("abc123", Report::Failure("boom".into()));
        let value = serde_json::to_value(&env).unwrap();
        assert_eq!(value["payload"]["error"], "boom");
        assert!(value["payload"].get("result").is_none());
    }

    #[test]
    fn test_deserialize_parent_request() {
        let env: Envelope = serde_json::from_value(json!({
            "type": "EXECUTE_CODE",
            "executionId": "abc123",
            "payload": { "code": "export default () => null;", "timestamp": 1 }
        }))
        .unwrap();
        assert_eq!(env.kind, MessageType::ExecuteCode);
        assert_eq!(env.payload.code.as_deref(), Some("export default () => null;"));
        assert_eq!(env.payload.timestamp, 1);
    }

    #[test]
    fn test_message_type_from_wire() {
        assert_eq!(MessageType::from_wire("EXECUTE_CODE"), Some(MessageType::ExecuteCode));
        assert_eq!(MessageType::from_wire("SANDBOX_READY"), Some(MessageType::SandboxReady));
        assert_eq!(MessageType::from_wire("execute_code"), None);
        assert_eq!(MessageType::from_wire("PING"), None);
    }

    #[test]
    fn test_timestamps_never_decrease() {
        let mut last = 0;
        for _ in 0..100 {
            let ts = now_millis();
            assert!(ts >= last);
            last = ts;
        }
    }
}
