use std::fmt;
use std::sync::Arc;

use serde_json::Value;
use tracing::{debug, warn};

use super::{FrameEvent, MessageType};
use crate::config::Config;

/// Why an inbound event was dropped. Only ever logged, never sent
/// back: a reply would confirm the sandbox's presence to the sender.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RejectReason {
    UntrustedOrigin,
    MissingExecutionId,
    UnknownType,
}

impl fmt::Display for RejectReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::UntrustedOrigin => "untrusted_origin",
            Self::MissingExecutionId => "missing_execution_id",
            Self::UnknownType => "unknown_type",
        };
        f.write_str(name)
    }
}

impl std::error::Error for RejectReason {}

/// A validated `EXECUTE_CODE` request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecuteRequest {
    pub origin: String,
    pub execution_id: String,
    /// Empty when the payload carried no code.
    pub code: String,
}

/// Checks inbound events against the allowlist and the envelope schema.
pub struct EnvelopeValidator {
    config: Arc<Config>,
}

impl EnvelopeValidator {
    pub fn new(config: Arc<Config>) -> Self {
        Self { config }
    }

    /// Runs the checks in order; the first failing one wins.
    pub fn validate(&self, event: &FrameEvent) -> Result<ExecuteRequest, RejectReason> {
        let result = self.check(event);
        match &result {
            Ok(request) => debug!(
                origin = %request.origin,
                execution_id = %request.execution_id,
                "Message accepted"
            ),
            Err(RejectReason::UntrustedOrigin) => warn!(
                origin = %event.origin,
                "Security: untrusted origin blocked"
            ),
            Err(RejectReason::MissingExecutionId) => warn!(
                origin = %event.origin,
                "Security: message without execution id dropped"
            ),
            Err(RejectReason::UnknownType) => warn!(
                origin = %event.origin,
                message_type = %type_name(&event.data),
                "Unknown message type dropped"
            ),
        }
        result
    }

    fn check(&self, event: &FrameEvent) -> Result<ExecuteRequest, RejectReason> {
        if !self.config.is_allowed_origin(&event.origin) {
            return Err(RejectReason::UntrustedOrigin);
        }

        let execution_id = event
            .data
            .get("executionId")
            .and_then(Value::as_str)
            .filter(|id| !id.is_empty())
            .ok_or(RejectReason::MissingExecutionId)?;

        let kind = event
            .data
            .get("type")
            .and_then(Value::as_str)
            .and_then(MessageType::from_wire);
        if kind != Some(MessageType::ExecuteCode) {
            return Err(RejectReason::UnknownType);
        }

        let code = event
            .data
            .get("payload")
            .and_then(|payload| payload.get("code"))
            .and_then(Value::as_str)
            .unwrap_or_default();

        Ok(ExecuteRequest {
            origin: event.origin.clone(),
            execution_id: execution_id.to_string(),
            code: code.to_string(),
        })
    }
}

fn type_name(data: &Value) -> String {
    match data.get("type") {
        Some(Value::String(name)) => name.clone(),
        Some(other) => other.to_string(),
        None => "<missing>".to_string(),
    }
}
