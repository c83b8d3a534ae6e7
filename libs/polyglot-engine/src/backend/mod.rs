//! Execution Backends
//!
//! **Core Responsibility:**
//! Run source code for one language family and report raw stdout, stderr
//! and how the run terminated.
//!
//! **Boundary:**
//! - Backends know HOW to run code (interpreter context, subprocess,
//!   compiler pipeline)
//! - Backends do NOT decide what counts as success for the client, build
//!   result records or touch the history ledger; the coordinator does
//!
//! Three strategies implement [`ExecutionBackend`]:
//! - [`in_process::InProcessBackend`]: JavaScript evaluated by boa in a
//!   killable worker process ([`js_worker`])
//! - [`interpreter::InterpreterBackend`]: interpreter spawned as a child
//! - [`compiled::CompiledBackend`]: compile to a scratch binary, then run it

pub mod compiled;
pub mod in_process;
pub mod interpreter;
pub mod js_worker;
pub mod process;

use crate::error::BackendError;
use crate::language_config::{BackendKind, LanguageConfigManager};
use crate::sink::OutputSink;
use anyhow::Result;
use process::ProcessExit;
use async_trait::async_trait;
use polyglot_common::types::Language;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

/// Everything a backend needs for one run
pub struct BackendJob<'a> {
    pub execution_id: Uuid,
    pub code: &'a str,
    pub timeout: Duration,
    pub scratch_dir: &'a Path,
    pub sink: &'a OutputSink,
    /// Combined stdout and stderr bytes kept before the run is stopped
    pub max_output_bytes: usize,
}

/// How a run terminated
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RunStatus {
    /// Process exited on its own, or in-process evaluation completed (0)
    Exited(i32),
    /// Process died from a signal it did not ask for
    Signaled(Option<i32>),
    /// Budget exhausted; the process was killed
    TimedOut,
    /// Compiler exited non-zero; the binary was never run
    CompilationFailed { exit_code: Option<i32> },
    /// In-process evaluation threw
    Threw(String),
    /// Output crossed the byte limit; the run was stopped
    OutputLimitExceeded { limit_bytes: usize },
}

impl RunStatus {
    pub(crate) fn from_exit(exit: ProcessExit, limit_bytes: usize) -> Self {
        match exit {
            ProcessExit::Exited(code) => RunStatus::Exited(code),
            ProcessExit::Signaled(signal) => RunStatus::Signaled(signal),
            ProcessExit::TimedOut => RunStatus::TimedOut,
            ProcessExit::OutputLimitExceeded => RunStatus::OutputLimitExceeded { limit_bytes },
        }
    }
}

/// Raw output of a run
#[derive(Debug, Clone)]
pub struct BackendOutput {
    pub stdout: String,
    pub stderr: String,
    pub status: RunStatus,
}

impl BackendOutput {
    pub fn succeeded(&self) -> bool {
        self.status == RunStatus::Exited(0)
    }
}

#[async_trait]
pub trait ExecutionBackend: Send + Sync {
    fn kind(&self) -> BackendKind;

    /// Run `job.code` within `job.timeout`, forwarding output chunks to
    /// `job.sink` as they are produced.
    ///
    /// `Err` is reserved for failures of the machinery (spawn, scratch
    /// I/O); failures of the user's program are reported in
    /// [`BackendOutput::status`].
    async fn run(&self, job: &BackendJob<'_>) -> Result<BackendOutput, BackendError>;
}

/// Knobs that are not per-language
#[derive(Debug, Clone)]
pub struct BackendOptions {
    pub js_loop_iteration_limit: u64,
    /// Binary hosting the JavaScript worker; the running executable when unset
    pub js_worker_program: Option<PathBuf>,
}

impl Default for BackendOptions {
    fn default() -> Self {
        Self {
            js_loop_iteration_limit: 50_000_000,
            js_worker_program: None,
        }
    }
}

/// Language to backend lookup, resolved once at startup
pub type BackendTable = HashMap<Language, Arc<dyn ExecutionBackend>>;

pub fn build_table(config: &LanguageConfigManager, options: &BackendOptions) -> Result<BackendTable> {
    let mut table: BackendTable = HashMap::new();
    for language in config.list_languages() {
        let lang_config = config.get_config(&language)?.clone();
        let backend: Arc<dyn ExecutionBackend> = match lang_config.backend {
            BackendKind::InProcess => {
                let backend = match &options.js_worker_program {
                    Some(program) => in_process::InProcessBackend::new(
                        program.clone(),
                        options.js_loop_iteration_limit,
                    ),
                    None => in_process::InProcessBackend::hosted_by_current_exe(
                        options.js_loop_iteration_limit,
                    )?,
                };
                Arc::new(backend)
            }
            BackendKind::Interpreter => Arc::new(interpreter::InterpreterBackend::new(lang_config)),
            BackendKind::Compiled => Arc::new(compiled::CompiledBackend::new(lang_config)?),
        };
        table.insert(language, backend);
    }
    Ok(table)
}

/// Substitute `{code}`, `{source}` and `{binary}` in a command template
pub(crate) fn render_template(
    template: &str,
    code: Option<&str>,
    source: Option<&Path>,
    binary: Option<&Path>,
) -> String {
    use crate::language_config::{BINARY_PLACEHOLDER, CODE_PLACEHOLDER, SOURCE_PLACEHOLDER};

    // An argument that is exactly the code placeholder is taken verbatim so
    // code containing other placeholders is never re-expanded
    if template == CODE_PLACEHOLDER {
        return code.unwrap_or_default().to_string();
    }

    let mut rendered = template.to_string();
    if let Some(source) = source {
        rendered = rendered.replace(SOURCE_PLACEHOLDER, &source.to_string_lossy());
    }
    if let Some(binary) = binary {
        rendered = rendered.replace(BINARY_PLACEHOLDER, &binary.to_string_lossy());
    }
    if let Some(code) = code {
        rendered = rendered.replace(CODE_PLACEHOLDER, code);
    }
    rendered
}
