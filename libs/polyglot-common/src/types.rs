use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

/// Default wall-clock budget for one execution
pub const DEFAULT_TIMEOUT_MS: u64 = 30_000;

/// Default cap on combined stdout and stderr of one execution
pub const DEFAULT_MAX_OUTPUT_BYTES: usize = 1024 * 1024;

/// Output reported when a successful execution wrote nothing to stdout
pub const EMPTY_OUTPUT_PLACEHOLDER: &str = "execution completed";

/// Languages the service knows how to run.
///
/// The set is closed: a request naming anything else is rejected before a
/// backend is chosen.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Language {
    JavaScript,
    TypeScript,
    Python,
    C,
    Rust,
    Bash,
}

impl Language {
    pub const ALL: [Language; 6] = [
        Language::JavaScript,
        Language::TypeScript,
        Language::Python,
        Language::C,
        Language::Rust,
        Language::Bash,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Language::JavaScript => "javascript",
            Language::TypeScript => "typescript",
            Language::Python => "python",
            Language::C => "c",
            Language::Rust => "rust",
            Language::Bash => "bash",
        }
    }
}

impl fmt::Display for Language {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unsupported language: {0}")]
pub struct UnknownLanguage(pub String);

impl FromStr for Language {
    type Err = UnknownLanguage;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let normalized = s.trim().to_lowercase();
        Language::ALL
            .iter()
            .copied()
            .find(|lang| lang.as_str() == normalized)
            .ok_or_else(|| UnknownLanguage(s.to_string()))
    }
}

/// Inbound execution request as received over HTTP or the channel.
///
/// `language` stays a plain string here so that an unknown value can be
/// reported with the supported set instead of failing deserialization.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecutionRequest {
    #[serde(default)]
    pub code: String,
    #[serde(default)]
    pub language: String,
    #[serde(default)]
    pub timeout_ms: Option<u64>,
}

impl ExecutionRequest {
    pub fn new(language: impl Into<String>, code: impl Into<String>) -> Self {
        Self {
            code: code.into(),
            language: language.into(),
            timeout_ms: None,
        }
    }

    pub fn with_timeout_ms(mut self, timeout_ms: u64) -> Self {
        self.timeout_ms = Some(timeout_ms);
        self
    }
}

/// Why an execution did not succeed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FailureKind {
    /// Compiler rejected the source; the binary never ran
    Compilation,
    /// Non-zero exit, fatal signal or thrown exception
    Runtime,
    /// Killed after exceeding its wall-clock budget
    Timeout,
    /// Interpreter or compiler could not be started at all
    Spawn,
}

impl fmt::Display for FailureKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            FailureKind::Compilation => "compilation",
            FailureKind::Runtime => "runtime",
            FailureKind::Timeout => "timeout",
            FailureKind::Spawn => "spawn",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecutionResult {
    pub execution_id: Uuid,
    pub success: bool,
    pub output: String,
    pub error: Option<String>,
    pub execution_time_ms: u64,
    pub language: Language,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure_kind: Option<FailureKind>,
}

impl ExecutionResult {
    pub fn is_timeout(&self) -> bool {
        self.failure_kind == Some(FailureKind::Timeout)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HistoryEntry {
    #[serde(flatten)]
    pub result: ExecutionResult,
    pub code: String,
    /// RFC 3339, UTC
    pub timestamp: String,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MetricsSnapshot {
    pub executions: u64,
    pub errors: u64,
    pub total_execution_time_ms: u64,
    pub average_execution_time_ms: f64,
}

/// Progress notifications for a single streamed execution.
///
/// Within one execution `Started` comes first, chunk events follow in
/// process write order per stream, and exactly one of `Completed` or
/// `Failed` ends the sequence.
#[derive(Debug, Clone, PartialEq)]
pub enum ExecutionEvent {
    Started {
        execution_id: Uuid,
    },
    Stdout {
        data: String,
    },
    Stderr {
        data: String,
    },
    Completed {
        execution_id: Uuid,
        success: bool,
        execution_time_ms: u64,
        error: Option<String>,
        failure_kind: Option<FailureKind>,
    },
    Failed {
        execution_id: Option<Uuid>,
        error: String,
    },
}

impl ExecutionEvent {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            ExecutionEvent::Completed { .. } | ExecutionEvent::Failed { .. }
        )
    }
}

/// Frames a client may send on the streaming channel
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum ChannelRequest {
    Execute(ExecutionRequest),
}

/// Frames pushed to a streaming channel client
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum ChannelFrame {
    #[serde(rename_all = "camelCase")]
    Start { execution_id: Uuid },
    Stdout { data: String },
    Stderr { data: String },
    #[serde(rename_all = "camelCase")]
    Complete {
        success: bool,
        execution_time_ms: u64,
        execution_id: Uuid,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        error: Option<String>,
    },
    #[serde(rename_all = "camelCase")]
    Error {
        error: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        execution_id: Option<Uuid>,
        /// Set when the request named a language the service does not run
        #[serde(default, skip_serializing_if = "Option::is_none")]
        supported_languages: Option<Vec<Language>>,
    },
}

impl ChannelFrame {
    pub fn error(message: impl Into<String>) -> Self {
        ChannelFrame::Error {
            error: message.into(),
            execution_id: None,
            supported_languages: None,
        }
    }

    /// Error frame for a request naming an unknown language
    pub fn unsupported_language(message: impl Into<String>, supported: Vec<Language>) -> Self {
        ChannelFrame::Error {
            error: message.into(),
            execution_id: None,
            supported_languages: Some(supported),
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, ChannelFrame::Complete { .. } | ChannelFrame::Error { .. })
    }
}

impl From<ExecutionEvent> for ChannelFrame {
    fn from(event: ExecutionEvent) -> Self {
        match event {
            ExecutionEvent::Started { execution_id } => ChannelFrame::Start { execution_id },
            ExecutionEvent::Stdout { data } => ChannelFrame::Stdout { data },
            ExecutionEvent::Stderr { data } => ChannelFrame::Stderr { data },
            ExecutionEvent::Completed {
                execution_id,
                success,
                execution_time_ms,
                error,
                ..
            } => ChannelFrame::Complete {
                success,
                execution_time_ms,
                execution_id,
                error,
            },
            ExecutionEvent::Failed {
                execution_id,
                error,
            } => ChannelFrame::Error {
                error,
                execution_id,
                supported_languages: None,
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_language_parsing_is_case_insensitive() {
        assert_eq!("Python".parse::<Language>(), Ok(Language::Python));
        assert_eq!(" javascript ".parse::<Language>(), Ok(Language::JavaScript));
        assert_eq!("c".parse::<Language>(), Ok(Language::C));
        assert!("cobol".parse::<Language>().is_err());
    }

    #[test]
    fn test_language_wire_name_matches_display() {
        for lang in Language::ALL {
            let wire = serde_json::to_value(lang).unwrap();
            assert_eq!(wire, json!(lang.to_string()));
        }
    }

    #[test]
    fn test_request_defaults_missing_fields() {
        let req: ExecutionRequest = serde_json::from_value(json!({ "language": "python" })).unwrap();
        assert!(req.code.is_empty());
        assert_eq!(req.timeout_ms, None);

        let req: ExecutionRequest =
            serde_json::from_value(json!({ "code": "x", "language": "bash", "timeoutMs": 5000 }))
                .unwrap();
        assert_eq!(req.timeout_ms, Some(5000));
    }

    #[test]
    fn test_result_serializes_camel_case() {
        let result = ExecutionResult {
            execution_id: Uuid::nil(),
            success: false,
            output: String::new(),
            error: Some("boom".into()),
            execution_time_ms: 12,
            language: Language::Rust,
            failure_kind: Some(FailureKind::Timeout),
        };
        let value = serde_json::to_value(&result).unwrap();
        assert_eq!(value["executionTimeMs"], 12);
        assert_eq!(value["language"], "rust");
        assert_eq!(value["failureKind"], "timeout");
        assert!(result.is_timeout());
    }

    #[test]
    fn test_history_entry_flattens_result() {
        let entry = HistoryEntry {
            result: ExecutionResult {
                execution_id: Uuid::nil(),
                success: true,
                output: "2\n".into(),
                error: None,
                execution_time_ms: 3,
                language: Language::Python,
                failure_kind: None,
            },
            code: "print(1+1)".into(),
            timestamp: "2024-01-01T00:00:00.000Z".into(),
        };
        let value = serde_json::to_value(&entry).unwrap();
        assert_eq!(value["output"], "2\n");
        assert_eq!(value["code"], "print(1+1)");
        assert!(value.get("failureKind").is_none());
    }

    #[test]
    fn test_channel_request_parses_execute_frame() {
        let frame: ChannelRequest = serde_json::from_str(
            r#"{"type":"execute","code":"print(1)","language":"python","timeoutMs":1000}"#,
        )
        .unwrap();
        let ChannelRequest::Execute(req) = frame;
        assert_eq!(req.language, "python");
        assert_eq!(req.timeout_ms, Some(1000));

        assert!(serde_json::from_str::<ChannelRequest>(r#"{"type":"launch"}"#).is_err());
    }

    #[test]
    fn test_channel_frames_wire_shape() {
        let id = Uuid::new_v4();
        let start = serde_json::to_value(ChannelFrame::Start { execution_id: id }).unwrap();
        assert_eq!(start, json!({ "type": "start", "executionId": id }));

        let complete = serde_json::to_value(ChannelFrame::from(ExecutionEvent::Completed {
            execution_id: id,
            success: true,
            execution_time_ms: 7,
            error: None,
            failure_kind: None,
        }))
        .unwrap();
        assert_eq!(
            complete,
            json!({ "type": "complete", "success": true, "executionTimeMs": 7, "executionId": id })
        );

        let error = serde_json::to_value(ChannelFrame::error("bad frame")).unwrap();
        assert_eq!(error, json!({ "type": "error", "error": "bad frame" }));

        let unsupported = serde_json::to_value(ChannelFrame::unsupported_language(
            "unsupported language 'cobol'",
            vec![Language::Python, Language::C],
        ))
        .unwrap();
        assert_eq!(
            unsupported,
            json!({
                "type": "error",
                "error": "unsupported language 'cobol'",
                "supportedLanguages": ["python", "c"],
            })
        );
    }
}
