use super::process::{run_process, ProcessSpec};
use super::{render_template, BackendJob, BackendOutput, ExecutionBackend, RunStatus};
use crate::artifact::ArtifactGuard;
use crate::error::BackendError;
use crate::language_config::{BackendKind, LanguageConfig};
use async_trait::async_trait;
use tracing::instrument;

/// Runs code through an external interpreter (python3, bash, tsx, ...).
///
/// Code reaches the interpreter through one of three routes, chosen by the
/// language configuration: substituted into the arguments (`{code}`),
/// written to a scratch file (`{source}`), or piped on stdin.
pub struct InterpreterBackend {
    config: LanguageConfig,
}

impl InterpreterBackend {
    pub fn new(config: LanguageConfig) -> Self {
        Self { config }
    }
}

#[async_trait]
impl ExecutionBackend for InterpreterBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::Interpreter
    }

    #[instrument(skip_all, fields(execution_id = %job.execution_id, language = %self.config.name))]
    async fn run(&self, job: &BackendJob<'_>) -> Result<BackendOutput, BackendError> {
        let execution = &self.config.execution;

        let artifact = if execution.needs_source_file() {
            let artifact =
                ArtifactGuard::create(job.scratch_dir, job.execution_id, &execution.file_extension)?;
            artifact.write_source(job.code).await?;
            Some(artifact)
        } else {
            None
        };
        let source = artifact.as_ref().map(|a| a.source_path());

        let spec = ProcessSpec {
            program: render_template(&execution.command, None, source, None),
            args: execution
                .args
                .iter()
                .map(|arg| render_template(arg, Some(job.code), source, None))
                .collect(),
            env: self.config.env.clone(),
            stdin: execution.stdin.then(|| job.code.to_string()),
            cwd: artifact.as_ref().and_then(|a| a.dir().map(|d| d.to_path_buf())),
            output_limit: Some(job.max_output_bytes),
        };

        let result = run_process(&spec, job.timeout, job.sink).await;
        if let Some(artifact) = artifact {
            artifact.cleanup();
        }
        let output = result?;

        Ok(BackendOutput {
            stdout: output.stdout,
            stderr: output.stderr,
            status: RunStatus::from_exit(output.exit, job.max_output_bytes),
        })
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use crate::language_config::LanguageExecution;
    use crate::sink::OutputSink;
    use std::collections::BTreeMap;
    use std::time::Duration;
    use uuid::Uuid;

    fn shell_config(args: &[&str], stdin: bool) -> LanguageConfig {
        LanguageConfig {
            name: "bash".to_string(),
            backend: BackendKind::Interpreter,
            execution: LanguageExecution {
                command: "sh".to_string(),
                args: args.iter().map(|s| s.to_string()).collect(),
                file_extension: "sh".to_string(),
                stdin,
            },
            compile: None,
            env: BTreeMap::new(),
        }
    }

    async fn run(backend: &InterpreterBackend, scratch: &std::path::Path, code: &str) -> BackendOutput {
        let sink = OutputSink::disabled();
        let job = BackendJob {
            execution_id: Uuid::new_v4(),
            code,
            timeout: Duration::from_secs(5),
            scratch_dir: scratch,
            sink: &sink,
            max_output_bytes: 1024,
        };
        backend.run(&job).await.unwrap()
    }

    #[tokio::test]
    async fn test_code_as_argument() {
        let scratch = tempfile::tempdir().unwrap();
        let backend = InterpreterBackend::new(shell_config(&["-c", "{code}"], false));
        let output = run(&backend, scratch.path(), "echo $((1+1))").await;
        assert_eq!(output.stdout, "2\n");
        assert!(output.succeeded());
    }

    #[tokio::test]
    async fn test_code_on_stdin() {
        let scratch = tempfile::tempdir().unwrap();
        let backend = InterpreterBackend::new(shell_config(&["-s"], true));
        let output = run(&backend, scratch.path(), "echo piped; exit 4").await;
        assert_eq!(output.stdout, "piped\n");
        assert_eq!(output.status, RunStatus::Exited(4));
    }

    #[tokio::test]
    async fn test_code_in_source_file_is_cleaned_up() {
        let scratch = tempfile::tempdir().unwrap();
        let backend = InterpreterBackend::new(shell_config(&["{source}"], false));
        let output = run(&backend, scratch.path(), "echo from-file").await;
        assert_eq!(output.stdout, "from-file\n");
        assert_eq!(std::fs::read_dir(scratch.path()).unwrap().count(), 0);
    }

    #[tokio::test]
    async fn test_missing_interpreter_is_spawn_error() {
        let scratch = tempfile::tempdir().unwrap();
        let mut config = shell_config(&["-c", "{code}"], false);
        config.execution.command = "no-such-interpreter-xyz".to_string();
        let backend = InterpreterBackend::new(config);
        let sink = OutputSink::disabled();
        let job = BackendJob {
            execution_id: Uuid::new_v4(),
            code: "whatever",
            timeout: Duration::from_secs(1),
            scratch_dir: scratch.path(),
            sink: &sink,
            max_output_bytes: 1024,
        };
        assert!(backend.run(&job).await.unwrap_err().is_spawn());
    }

    #[tokio::test]
    async fn test_flooding_interpreter_is_stopped_at_output_limit() {
        let scratch = tempfile::tempdir().unwrap();
        let backend = InterpreterBackend::new(shell_config(&["-c", "{code}"], false));
        let output = run(&backend, scratch.path(), "while :; do echo flood; done").await;
        assert_eq!(output.status, RunStatus::OutputLimitExceeded { limit_bytes: 1024 });
        assert!(output.stdout.ends_with(crate::backend::process::TRUNCATION_MARKER));
        assert_eq!(
            output.stdout.len(),
            1024 + crate::backend::process::TRUNCATION_MARKER.len()
        );
    }

    #[tokio::test]
    #[ignore] // Requires python3 on PATH
    async fn test_builtin_python_prints() {
        let scratch = tempfile::tempdir().unwrap();
        let backend =
            InterpreterBackend::new(crate::language_config::builtin_config(polyglot_common::types::Language::Python));
        let output = run(&backend, scratch.path(), "print(1+1)").await;
        assert_eq!(output.stdout.trim(), "2");
        assert!(output.succeeded());
    }
}
