use std::fmt;

/// Characters of source shown in the session preview.
const PREVIEW_CHARS: usize = 500;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionStatus {
    Pending,
    Succeeded,
    Failed,
}

/// One `EXECUTE_CODE` request, from acceptance until the next request
/// supersedes it or the bridge is torn down.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecutionSession {
    pub execution_id: String,
    pub source_code: String,
    pub status: SessionStatus,
    pub result_summary: Option<String>,
    pub error_message: Option<String>,
}

impl ExecutionSession {
    pub fn new(execution_id: &str, source_code: &str) -> Self {
        Self {
            execution_id: execution_id.to_string(),
            source_code: source_code.to_string(),
            status: SessionStatus::Pending,
            result_summary: None,
            error_message: None,
        }
    }

    pub fn succeed(&mut self, summary: &str) {
        self.status = SessionStatus::Succeeded;
        self.result_summary = Some(summary.to_string());
        self.error_message = None;
    }

    pub fn fail(&mut self, message: &str) {
        self.status = SessionStatus::Failed;
        self.result_summary = None;
        self.error_message = Some(message.to_string());
    }

    /// Leading part of the source, `...`-suffixed when cut.
    pub fn preview(&self) -> String {
        let mut chars = self.source_code.chars();
        let head: String = chars.by_ref().take(PREVIEW_CHARS).collect();
        if chars.next().is_some() {
            format!("{head}...")
        } else {
            head
        }
    }
}

/// What the sandbox page shows the user. Rejected messages never reach it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StatusLine {
    Waiting,
    NoCode,
    Executing(String),
    Completed,
    Failed(String),
}

impl fmt::Display for StatusLine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Waiting => f.write_str("Ready for code execution..."),
            Self::NoCode => f.write_str(crate::engine::NO_CODE_MESSAGE),
            Self::Executing(id) => {
                let short: String = id.chars().take(8).collect();
                write!(f, "Executing code (ID: {short}...)")
            }
            Self::Completed => f.write_str("Execution completed successfully"),
            Self::Failed(message) => write!(f, "Error: {message}"),
        }
    }
}
