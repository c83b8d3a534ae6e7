use super::process::{run_process, ProcessExit, ProcessSpec};
use super::{render_template, BackendJob, BackendOutput, ExecutionBackend, RunStatus};
use crate::artifact::ArtifactGuard;
use crate::error::BackendError;
use crate::language_config::{BackendKind, CompileStep, LanguageConfig};
use anyhow::Context;
use async_trait::async_trait;
use std::time::{Duration, Instant};
use tracing::{debug, info, instrument, warn};

/// Compile-then-run pipeline for ahead-of-time compiled languages.
///
/// **Phases:**
/// 1. Write the source into a per-execution artifact directory
/// 2. Run the compiler with half of the budget
/// 3. On compiler failure stop: diagnostics become the error, the binary
///    is never started
/// 4. Otherwise run the binary with whatever budget remains
///
/// The artifact directory is removed on every path out of `run`.
pub struct CompiledBackend {
    config: LanguageConfig,
    compile: CompileStep,
}

impl CompiledBackend {
    pub fn new(config: LanguageConfig) -> anyhow::Result<Self> {
        let compile = config
            .compile
            .clone()
            .with_context(|| format!("Language '{}' has no compile step", config.name))?;
        Ok(Self { config, compile })
    }

    async fn compile_and_run(
        &self,
        job: &BackendJob<'_>,
        artifact: &ArtifactGuard,
    ) -> Result<BackendOutput, BackendError> {
        artifact.write_source(job.code).await?;
        let source = Some(artifact.source_path());
        let binary = Some(artifact.binary_path());
        let workdir = artifact.dir().map(|d| d.to_path_buf());

        let compile_timeout = compile_budget(job.timeout);
        let compile_spec = ProcessSpec {
            program: render_template(&self.compile.command, None, source, binary),
            args: self
                .compile
                .args
                .iter()
                .map(|arg| render_template(arg, None, source, binary))
                .collect(),
            env: self.config.env.clone(),
            stdin: None,
            cwd: workdir.clone(),
            output_limit: Some(job.max_output_bytes),
        };

        let started = Instant::now();
        let compiled = run_process(&compile_spec, compile_timeout, job.sink).await?;
        let compile_ms = started.elapsed().as_millis() as u64;

        match compiled.exit {
            ProcessExit::Exited(0) => {
                info!(compile_ms, "Compilation succeeded");
            }
            ProcessExit::TimedOut => {
                warn!(compile_ms, "Compilation timed out");
                return Ok(BackendOutput {
                    stdout: compiled.stdout,
                    stderr: compiled.stderr,
                    status: RunStatus::TimedOut,
                });
            }
            ProcessExit::OutputLimitExceeded => {
                warn!(compile_ms, "Compiler output exceeded the limit");
                return Ok(BackendOutput {
                    stdout: compiled.stdout,
                    stderr: compiled.stderr,
                    status: RunStatus::OutputLimitExceeded {
                        limit_bytes: job.max_output_bytes,
                    },
                });
            }
            exit => {
                let exit_code = match exit {
                    ProcessExit::Exited(code) => Some(code),
                    _ => None,
                };
                let diagnostics = if compiled.stderr.trim().is_empty() {
                    compiled.stdout
                } else {
                    compiled.stderr
                };
                warn!(
                    compile_ms,
                    exit_code = ?exit_code,
                    error_preview = diagnostics.lines().next().unwrap_or(""),
                    "Compilation failed"
                );
                return Ok(BackendOutput {
                    stdout: String::new(),
                    stderr: diagnostics,
                    status: RunStatus::CompilationFailed { exit_code },
                });
            }
        }

        let run_budget = job.timeout.saturating_sub(started.elapsed());
        if run_budget.is_zero() {
            return Ok(BackendOutput {
                stdout: String::new(),
                stderr: compiled.stderr,
                status: RunStatus::TimedOut,
            });
        }

        let execution = &self.config.execution;
        let run_spec = ProcessSpec {
            program: render_template(&execution.command, None, source, binary),
            args: execution
                .args
                .iter()
                .map(|arg| render_template(arg, None, source, binary))
                .collect(),
            env: self.config.env.clone(),
            stdin: None,
            cwd: workdir,
            output_limit: Some(job.max_output_bytes),
        };
        debug!(run_budget_ms = run_budget.as_millis() as u64, "Running compiled binary");

        let output = run_process(&run_spec, run_budget, job.sink).await?;
        Ok(BackendOutput {
            stdout: output.stdout,
            stderr: output.stderr,
            status: RunStatus::from_exit(output.exit, job.max_output_bytes),
        })
    }
}

#[async_trait]
impl ExecutionBackend for CompiledBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::Compiled
    }

    #[instrument(skip_all, fields(execution_id = %job.execution_id, language = %self.config.name))]
    async fn run(&self, job: &BackendJob<'_>) -> Result<BackendOutput, BackendError> {
        let artifact = ArtifactGuard::create(
            job.scratch_dir,
            job.execution_id,
            &self.config.execution.file_extension,
        )?;
        let result = self.compile_and_run(job, &artifact).await;
        artifact.cleanup();
        result
    }
}

/// Share of the total budget the compiler may use
pub fn compile_budget(total: Duration) -> Duration {
    total / 2
}
