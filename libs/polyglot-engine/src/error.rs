use polyglot_common::types::Language;
use std::time::Duration;

/// Reasons an execution request is refused before any backend runs
#[derive(Debug, thiserror::Error)]
pub enum ExecuteError {
    #[error("code is required")]
    MissingCode,

    #[error("unsupported language '{language}'")]
    UnsupportedLanguage {
        language: String,
        supported: Vec<Language>,
    },

    #[error("too many requests, retry in {}s", retry_after.as_secs().max(1))]
    RateLimited { retry_after: Duration },

    #[error("internal execution fault: {0}")]
    Internal(String),
}

impl ExecuteError {
    /// Stable machine-readable code for the HTTP and channel layers
    pub fn code(&self) -> &'static str {
        match self {
            ExecuteError::MissingCode => "missing_code",
            ExecuteError::UnsupportedLanguage { .. } => "unsupported_language",
            ExecuteError::RateLimited { .. } => "rate_limited",
            ExecuteError::Internal(_) => "internal",
        }
    }
}

/// Failures of the backend machinery itself, as opposed to failures of the
/// user's program
#[derive(Debug, thiserror::Error)]
pub enum BackendError {
    #[error("Failed to spawn '{program}': {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },

    #[error("I/O error while {context}: {source}")]
    Io {
        context: &'static str,
        #[source]
        source: std::io::Error,
    },
}

impl BackendError {
    pub fn io(context: &'static str, source: std::io::Error) -> Self {
        BackendError::Io { context, source }
    }

    pub fn is_spawn(&self) -> bool {
        matches!(self, BackendError::Spawn { .. })
    }
}
