//! Execution Coordinator
//!
//! **Responsibility:**
//! Turn an [`ExecutionRequest`] into an [`ExecutionResult`].
//!
//! **Flow:**
//! 1. Validate code and language (no backend is touched on failure)
//! 2. Charge the request to the caller's rate-limit window
//! 3. Dispatch to the language's backend with a fresh execution id,
//!    timeout and output sink
//! 4. Normalize the raw backend outcome and record it in the ledger
//!
//! The coordinator never fails a request because the user's program
//! failed; those outcomes are results with `success == false`.

use crate::backend::{
    build_table, BackendJob, BackendOptions, BackendOutput, BackendTable, ExecutionBackend,
    RunStatus,
};
use crate::error::{BackendError, ExecuteError};
use crate::language_config::{BackendKind, LanguageConfigManager};
use crate::ledger::Ledger;
use crate::rate_limit::{ClientKey, RateLimiter};
use crate::sink::{OutputSink, EVENT_BUFFER};
use polyglot_common::config::ServerConfig;
use polyglot_common::types::{
    ExecutionEvent, ExecutionRequest, ExecutionResult, FailureKind, Language,
    DEFAULT_MAX_OUTPUT_BYTES, DEFAULT_TIMEOUT_MS, EMPTY_OUTPUT_PLACEHOLDER,
};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tracing::{error, info, instrument, warn};
use uuid::Uuid;

#[derive(Debug, Clone)]
pub struct CoordinatorOptions {
    /// Parent directory for per-execution artifact directories
    pub scratch_dir: PathBuf,
    pub default_timeout_ms: u64,
    pub max_timeout_ms: u64,
    /// Combined stdout and stderr bytes kept per execution
    pub max_output_bytes: usize,
}

impl Default for CoordinatorOptions {
    fn default() -> Self {
        Self {
            scratch_dir: std::env::temp_dir().join("polyglot"),
            default_timeout_ms: DEFAULT_TIMEOUT_MS,
            max_timeout_ms: 120_000,
            max_output_bytes: DEFAULT_MAX_OUTPUT_BYTES,
        }
    }
}

impl CoordinatorOptions {
    pub fn from_config(config: &ServerConfig) -> Self {
        Self {
            scratch_dir: config.scratch_dir.clone(),
            default_timeout_ms: config.default_timeout_ms,
            max_timeout_ms: config.max_timeout_ms,
            max_output_bytes: config.max_output_bytes,
        }
    }

    /// Requested timeout, or the default, clamped to `1..=max_timeout_ms`
    pub fn effective_timeout_ms(&self, requested: Option<u64>) -> u64 {
        requested
            .unwrap_or(self.default_timeout_ms)
            .clamp(1, self.max_timeout_ms.max(1))
    }
}

/// Events of one streamed execution
pub struct ExecutionStream {
    pub execution_id: Uuid,
    pub language: Language,
    events: mpsc::Receiver<ExecutionEvent>,
}

impl ExecutionStream {
    /// Next event; `None` once the terminal event has been received
    pub async fn next(&mut self) -> Option<ExecutionEvent> {
        self.events.recv().await
    }
}

/// A request that passed validation and the rate limiter
struct Admitted {
    execution_id: Uuid,
    language: Language,
    code: String,
    timeout_ms: u64,
    backend: Arc<dyn ExecutionBackend>,
}

struct Inner {
    backends: BackendTable,
    limiter: RateLimiter,
    ledger: Arc<Ledger>,
    options: CoordinatorOptions,
}

/// Cheap to clone; clones share backends, limiter and ledger
#[derive(Clone)]
pub struct Coordinator {
    inner: Arc<Inner>,
}

impl Coordinator {
    pub fn new(
        languages: &LanguageConfigManager,
        backend_options: &BackendOptions,
        limiter: RateLimiter,
        ledger: Arc<Ledger>,
        options: CoordinatorOptions,
    ) -> anyhow::Result<Self> {
        let backends = build_table(languages, backend_options)?;
        Ok(Self::with_backends(backends, limiter, ledger, options))
    }

    /// Build around an explicit backend table
    pub fn with_backends(
        backends: BackendTable,
        limiter: RateLimiter,
        ledger: Arc<Ledger>,
        options: CoordinatorOptions,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                backends,
                limiter,
                ledger,
                options,
            }),
        }
    }

    pub fn supported_languages(&self) -> Vec<Language> {
        Language::ALL
            .into_iter()
            .filter(|lang| self.inner.backends.contains_key(lang))
            .collect()
    }

    pub fn backend_kind(&self, language: Language) -> Option<BackendKind> {
        self.inner.backends.get(&language).map(|b| b.kind())
    }

    pub fn ledger(&self) -> Arc<Ledger> {
        self.inner.ledger.clone()
    }

    pub fn options(&self) -> &CoordinatorOptions {
        &self.inner.options
    }

    fn validate(&self, request: ExecutionRequest) -> Result<Admitted, ExecuteError> {
        if request.code.trim().is_empty() {
            return Err(ExecuteError::MissingCode);
        }

        let unsupported = || ExecuteError::UnsupportedLanguage {
            language: request.language.clone(),
            supported: self.supported_languages(),
        };
        let language: Language = request.language.parse().map_err(|_| unsupported())?;
        let backend = self
            .inner
            .backends
            .get(&language)
            .cloned()
            .ok_or_else(unsupported)?;

        Ok(Admitted {
            execution_id: Uuid::new_v4(),
            language,
            timeout_ms: self.inner.options.effective_timeout_ms(request.timeout_ms),
            code: request.code,
            backend,
        })
    }

    fn admit(&self, client: &ClientKey, request: ExecutionRequest) -> Result<Admitted, ExecuteError> {
        let admitted = self.validate(request)?;
        self.inner
            .limiter
            .check(client)
            .map_err(|retry_after| {
                warn!(client = %client, retry_after_ms = retry_after.as_millis() as u64, "Request rate limited");
                ExecuteError::RateLimited { retry_after }
            })?;
        Ok(admitted)
    }

    /// Run to completion and return the normalized result
    #[instrument(skip_all, fields(client = %client, language = %request.language))]
    pub async fn execute(
        &self,
        client: &ClientKey,
        request: ExecutionRequest,
    ) -> Result<ExecutionResult, ExecuteError> {
        let admitted = self.admit(client, request)?;
        self.run_isolated(admitted, OutputSink::disabled()).await
    }

    /// Validate and rate-limit now, then run in the background while
    /// events flow through the returned stream.
    ///
    /// The stream yields `Started`, output chunks, then exactly one of
    /// `Completed` or `Failed`.
    #[instrument(skip_all, fields(client = %client, language = %request.language))]
    pub async fn execute_streaming(
        &self,
        client: &ClientKey,
        request: ExecutionRequest,
    ) -> Result<ExecutionStream, ExecuteError> {
        let admitted = self.admit(client, request)?;
        let execution_id = admitted.execution_id;
        let language = admitted.language;

        let (tx, rx) = mpsc::channel(EVENT_BUFFER);
        let _ = tx.send(ExecutionEvent::Started { execution_id }).await;
        let sink = OutputSink::new(tx);

        let this = self.clone();
        tokio::spawn(async move {
            let outcome = this.run_isolated(admitted, sink.clone()).await;
            // Sealing first guarantees no chunk trails the terminal event
            let Some(tx) = sink.seal().await else {
                return;
            };
            let terminal = match outcome {
                Err(e) => ExecutionEvent::Failed {
                    execution_id: Some(execution_id),
                    error: e.to_string(),
                },
                Ok(result) if result.failure_kind == Some(FailureKind::Spawn) => {
                    ExecutionEvent::Failed {
                        execution_id: Some(result.execution_id),
                        error: result.error.unwrap_or_default(),
                    }
                }
                Ok(result) => ExecutionEvent::Completed {
                    execution_id: result.execution_id,
                    success: result.success,
                    execution_time_ms: result.execution_time_ms,
                    error: result.error,
                    failure_kind: result.failure_kind,
                },
            };
            let _ = tx.send(terminal).await;
        });

        Ok(ExecutionStream {
            execution_id,
            language,
            events: rx,
        })
    }

    /// Run on a task of its own so a panicking backend surfaces as
    /// [`ExecuteError::Internal`] instead of tearing down the caller
    async fn run_isolated(
        &self,
        admitted: Admitted,
        sink: OutputSink,
    ) -> Result<ExecutionResult, ExecuteError> {
        let execution_id = admitted.execution_id;
        let this = self.clone();
        tokio::spawn(async move { this.run_admitted(admitted, &sink).await })
            .await
            .map_err(|join_error| {
                error!(%execution_id, error = %join_error, "Execution task aborted");
                ExecuteError::Internal(format!("execution {} aborted", execution_id))
            })
    }

    async fn run_admitted(&self, admitted: Admitted, sink: &OutputSink) -> ExecutionResult {
        let Admitted {
            execution_id,
            language,
            code,
            timeout_ms,
            backend,
        } = admitted;

        info!(%execution_id, %language, timeout_ms, "Execution started");

        let job = BackendJob {
            execution_id,
            code: &code,
            timeout: Duration::from_millis(timeout_ms),
            scratch_dir: &self.inner.options.scratch_dir,
            sink,
            max_output_bytes: self.inner.options.max_output_bytes,
        };
        let started = Instant::now();
        let outcome = backend.run(&job).await;
        let execution_ms = started.elapsed().as_millis() as u64;

        let result = normalize(execution_id, language, outcome, timeout_ms, execution_ms);
        match result.failure_kind {
            None => info!(%execution_id, %language, execution_ms, "Execution succeeded"),
            Some(FailureKind::Spawn) => warn!(
                %execution_id,
                %language,
                error = result.error.as_deref().unwrap_or(""),
                "Execution could not be started"
            ),
            Some(kind) => info!(%execution_id, %language, execution_ms, failure_kind = %kind, "Execution failed"),
        }

        self.inner.ledger.record(&result, &code).await;
        result
    }
}

/// Map a raw backend outcome onto the client-facing result
fn normalize(
    execution_id: Uuid,
    language: Language,
    outcome: Result<BackendOutput, BackendError>,
    timeout_ms: u64,
    execution_time_ms: u64,
) -> ExecutionResult {
    let failed = |output: String, kind: FailureKind, error: String| ExecutionResult {
        execution_id,
        success: false,
        output,
        error: Some(error),
        execution_time_ms,
        language,
        failure_kind: Some(kind),
    };

    let output = match outcome {
        Ok(output) => output,
        // Scratch I/O and interpreter faults are infrastructure failures too
        Err(e) => return failed(String::new(), FailureKind::Spawn, e.to_string()),
    };
    let BackendOutput {
        stdout,
        stderr,
        status,
    } = output;
    let stderr_or = |fallback: String| {
        if stderr.trim().is_empty() {
            fallback
        } else {
            stderr.clone()
        }
    };

    match status {
        RunStatus::Exited(0) => ExecutionResult {
            execution_id,
            success: true,
            output: if stdout.is_empty() {
                EMPTY_OUTPUT_PLACEHOLDER.to_string()
            } else {
                stdout
            },
            error: None,
            execution_time_ms,
            language,
            failure_kind: None,
        },
        RunStatus::Exited(code) => {
            let error = stderr_or(format!("Process exited with code {}", code));
            failed(stdout, FailureKind::Runtime, error)
        }
        RunStatus::Signaled(signal) => {
            let fallback = match signal {
                Some(signal) => format!("Process terminated by signal {}", signal),
                None => "Process terminated abnormally".to_string(),
            };
            let error = stderr_or(fallback);
            failed(stdout, FailureKind::Runtime, error)
        }
        RunStatus::Threw(message) => failed(stdout, FailureKind::Runtime, message),
        RunStatus::CompilationFailed { exit_code } => {
            let error = stderr_or(match exit_code {
                Some(code) => format!("Compilation failed with exit code {}", code),
                None => "Compilation failed".to_string(),
            });
            failed(stdout, FailureKind::Compilation, error)
        }
        RunStatus::TimedOut => failed(
            stdout,
            FailureKind::Timeout,
            format!("Execution timed out after {} ms", timeout_ms),
        ),
        RunStatus::OutputLimitExceeded { limit_bytes } => failed(
            stdout,
            FailureKind::Runtime,
            format!("Output limit of {} bytes exceeded", limit_bytes),
        ),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn output(stdout: &str, stderr: &str, status: RunStatus) -> Result<BackendOutput, BackendError> {
        Ok(BackendOutput {
            stdout: stdout.to_string(),
            stderr: stderr.to_string(),
            status,
        })
    }

    fn norm(outcome: Result<BackendOutput, BackendError>) -> ExecutionResult {
        normalize(Uuid::nil(), Language::Python, outcome, 1000, 5)
    }

    #[test]
    fn test_success_uses_stdout_or_placeholder() {
        let r = norm(output("2\n", "", RunStatus::Exited(0)));
        assert!(r.success);
        assert_eq!(r.output, "2\n");
        assert_eq!(r.error, None);
        assert_eq!(r.failure_kind, None);

        let r = norm(output("", "warning\n", RunStatus::Exited(0)));
        assert!(r.success);
        assert_eq!(r.output, EMPTY_OUTPUT_PLACEHOLDER);
    }

    #[test]
    fn test_non_zero_exit_prefers_stderr() {
        let r = norm(output("partial", "Traceback\n", RunStatus::Exited(1)));
        assert!(!r.success);
        assert_eq!(r.output, "partial");
        assert_eq!(r.error.as_deref(), Some("Traceback\n"));
        assert_eq!(r.failure_kind, Some(FailureKind::Runtime));

        let r = norm(output("", "", RunStatus::Exited(3)));
        assert_eq!(r.error.as_deref(), Some("Process exited with code 3"));
    }

    #[test]
    fn test_signal_and_throw_are_runtime_failures() {
        let r = norm(output("", "", RunStatus::Signaled(Some(9))));
        assert_eq!(r.failure_kind, Some(FailureKind::Runtime));
        assert_eq!(r.error.as_deref(), Some("Process terminated by signal 9"));

        let r = norm(output("", "", RunStatus::Threw("Error: boom".into())));
        assert_eq!(r.failure_kind, Some(FailureKind::Runtime));
        assert_eq!(r.error.as_deref(), Some("Error: boom"));
    }

    #[test]
    fn test_compilation_failure() {
        let r = norm(output(
            "",
            "main.c:1:1: error: unknown type name 'this'\n",
            RunStatus::CompilationFailed { exit_code: Some(1) },
        ));
        assert_eq!(r.failure_kind, Some(FailureKind::Compilation));
        assert!(r.error.unwrap().contains("unknown type name"));
    }

    #[test]
    fn test_timeout_message_names_budget() {
        let r = norm(output("tick\n", "", RunStatus::TimedOut));
        assert!(r.is_timeout());
        assert_eq!(r.error.as_deref(), Some("Execution timed out after 1000 ms"));
        assert_eq!(r.output, "tick\n");
    }

    #[test]
    fn test_output_limit_keeps_truncated_output() {
        let r = norm(output(
            "aaaa\n[output truncated]\n",
            "",
            RunStatus::OutputLimitExceeded { limit_bytes: 4 },
        ));
        assert!(!r.success);
        assert_eq!(r.failure_kind, Some(FailureKind::Runtime));
        assert_eq!(r.error.as_deref(), Some("Output limit of 4 bytes exceeded"));
        assert!(r.output.starts_with("aaaa"));
    }

    #[test]
    fn test_spawn_failure_is_distinct_kind() {
        let err = BackendError::Spawn {
            program: "python3".into(),
            source: std::io::Error::new(std::io::ErrorKind::NotFound, "No such file or directory"),
        };
        let r = norm(Err(err));
        assert_eq!(r.failure_kind, Some(FailureKind::Spawn));
        assert!(r.error.unwrap().starts_with("Failed to spawn 'python3'"));
    }

    #[test]
    fn test_timeout_clamping() {
        let options = CoordinatorOptions {
            default_timeout_ms: 30_000,
            max_timeout_ms: 120_000,
            ..Default::default()
        };
        assert_eq!(options.effective_timeout_ms(None), 30_000);
        assert_eq!(options.effective_timeout_ms(Some(0)), 1);
        assert_eq!(options.effective_timeout_ms(Some(5_000)), 5_000);
        assert_eq!(options.effective_timeout_ms(Some(10_000_000)), 120_000);
    }
}
