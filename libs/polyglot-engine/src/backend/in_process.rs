use super::js_worker::{WorkerFrame, WorkerSettings};
use super::process::{run_process, ProcessExit, ProcessSpec};
use super::{BackendJob, BackendOutput, ExecutionBackend, RunStatus};
use crate::error::BackendError;
use crate::language_config::BackendKind;
use crate::sink::{OutputSink, Stream, EVENT_BUFFER};
use anyhow::Context as _;
use async_trait::async_trait;
use polyglot_common::types::ExecutionEvent;
use std::path::PathBuf;
use tokio::sync::mpsc;
use tracing::{instrument, warn};

/// Raw worker stdout allowed per byte of script output; JSON framing and
/// escaping inflate the payload
const FRAME_OVERHEAD_FACTOR: usize = 8;
const FRAME_SLACK_BYTES: usize = 64 * 1024;

/// Runs JavaScript with the embedded boa engine.
///
/// Every run gets a fresh worker process (see [`super::js_worker`]), so a
/// script that outlives its budget is killed with its process group
/// instead of occupying a thread of the server.
pub struct InProcessBackend {
    program: PathBuf,
    loop_iteration_limit: u64,
}

impl InProcessBackend {
    /// `program` must call `js_worker::run_if_requested` at startup
    pub fn new(program: impl Into<PathBuf>, loop_iteration_limit: u64) -> Self {
        Self {
            program: program.into(),
            loop_iteration_limit,
        }
    }

    /// Worker hosted by the running binary
    pub fn hosted_by_current_exe(loop_iteration_limit: u64) -> anyhow::Result<Self> {
        let program = std::env::current_exe()
            .context("Failed to locate the running executable to host the JavaScript worker")?;
        Ok(Self::new(program, loop_iteration_limit))
    }
}

#[async_trait]
impl ExecutionBackend for InProcessBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::InProcess
    }

    #[instrument(skip_all, fields(execution_id = %job.execution_id, language = "javascript"))]
    async fn run(&self, job: &BackendJob<'_>) -> Result<BackendOutput, BackendError> {
        let settings = WorkerSettings {
            loop_iteration_limit: self.loop_iteration_limit,
            max_output_bytes: job.max_output_bytes,
        };
        let spec = ProcessSpec {
            program: self.program.to_string_lossy().into_owned(),
            args: settings.to_args(),
            stdin: Some(job.code.to_string()),
            output_limit: Some(
                job.max_output_bytes
                    .saturating_mul(FRAME_OVERHEAD_FACTOR)
                    .saturating_add(FRAME_SLACK_BYTES),
            ),
            ..ProcessSpec::default()
        };

        let (tx, rx) = mpsc::channel(EVENT_BUFFER);
        let raw = OutputSink::new(tx);
        let worker = async {
            let result = run_process(&spec, job.timeout, &raw).await;
            // Closes the channel so decoding ends after the last chunk
            drop(raw.seal().await);
            result
        };
        let (result, decoded) = tokio::join!(worker, decode_frames(rx, job.sink));
        let output = result?;

        let status = decoded.status(output.exit, job.max_output_bytes);
        if status == RunStatus::TimedOut {
            warn!(
                timeout_ms = job.timeout.as_millis() as u64,
                "JavaScript worker exceeded its budget"
            );
        }
        Ok(BackendOutput {
            stdout: decoded.stdout,
            stderr: decoded.stderr,
            status,
        })
    }
}

/// What the worker reported, reassembled from its frames
#[derive(Debug, Default)]
struct Decoded {
    stdout: String,
    stderr: String,
    threw: Option<String>,
    loop_limit: bool,
    output_limit: bool,
}

impl Decoded {
    async fn apply(&mut self, line: &str, sink: &OutputSink) {
        if line.is_empty() {
            return;
        }
        match serde_json::from_str::<WorkerFrame>(line) {
            Ok(WorkerFrame::Stdout { data }) => {
                self.stdout.push_str(&data);
                sink.emit(Stream::Stdout, data).await;
            }
            Ok(WorkerFrame::Stderr { data }) => {
                self.stderr.push_str(&data);
                sink.emit(Stream::Stderr, data).await;
            }
            Ok(WorkerFrame::Threw { message }) => self.threw = Some(message),
            Ok(WorkerFrame::LoopLimit) => self.loop_limit = true,
            Ok(WorkerFrame::OutputLimit) => self.output_limit = true,
            Err(_) => {
                // Not a frame; keep it visible rather than lose it
                let text = format!("{}\n", line);
                self.stderr.push_str(&text);
                sink.emit(Stream::Stderr, text).await;
            }
        }
    }

    fn status(&self, exit: ProcessExit, limit_bytes: usize) -> RunStatus {
        match exit {
            ProcessExit::OutputLimitExceeded => RunStatus::OutputLimitExceeded { limit_bytes },
            _ if self.output_limit => RunStatus::OutputLimitExceeded { limit_bytes },
            ProcessExit::TimedOut => RunStatus::TimedOut,
            _ if self.loop_limit => RunStatus::TimedOut,
            ProcessExit::Exited(0) if self.threw.is_some() => {
                RunStatus::Threw(self.threw.clone().unwrap_or_default())
            }
            ProcessExit::Exited(code) => RunStatus::Exited(code),
            ProcessExit::Signaled(signal) => RunStatus::Signaled(signal),
        }
    }
}

/// Turn raw worker output into script output, forwarding it to `sink` as
/// each frame completes. Worker stderr (a crash report) passes through.
async fn decode_frames(mut rx: mpsc::Receiver<ExecutionEvent>, sink: &OutputSink) -> Decoded {
    let mut decoded = Decoded::default();
    let mut pending = String::new();
    while let Some(event) = rx.recv().await {
        match event {
            ExecutionEvent::Stdout { data } => {
                pending.push_str(&data);
                while let Some(end) = pending.find('\n') {
                    let line: String = pending.drain(..=end).collect();
                    decoded.apply(line.trim_end(), sink).await;
                }
            }
            ExecutionEvent::Stderr { data } => {
                decoded.stderr.push_str(&data);
                sink.emit(Stream::Stderr, data).await;
            }
            _ => {}
        }
    }
    decoded.apply(pending.trim_end(), sink).await;
    decoded
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use std::os::unix::fs::PermissionsExt;
    use std::path::Path;
    use std::time::{Duration, Instant};
    use uuid::Uuid;

    /// A stand-in worker: a shell script that ignores its arguments
    fn fake_worker(dir: &Path, body: &str) -> PathBuf {
        let path = dir.join("worker.sh");
        std::fs::write(&path, format!("#!/bin/sh\ncat > /dev/null\n{}\n", body)).unwrap();
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
        path
    }

    async fn run_with(program: PathBuf, timeout: Duration, sink: &OutputSink) -> BackendOutput {
        let scratch = std::env::temp_dir();
        let backend = InProcessBackend::new(program, 1_000_000);
        let job = BackendJob {
            execution_id: Uuid::new_v4(),
            code: "ignored",
            timeout,
            scratch_dir: &scratch,
            sink,
            max_output_bytes: 1024,
        };
        backend.run(&job).await.unwrap()
    }

    async fn run(program: PathBuf) -> BackendOutput {
        run_with(program, Duration::from_secs(5), &OutputSink::disabled()).await
    }

    #[tokio::test]
    async fn test_frames_become_output_and_are_streamed() {
        let dir = tempfile::tempdir().unwrap();
        let worker = fake_worker(
            dir.path(),
            r#"echo '{"kind":"stdout","data":"a\n"}'
echo '{"kind":"stderr","data":"b\n"}'"#,
        );
        let (tx, mut rx) = mpsc::channel(EVENT_BUFFER);
        let sink = OutputSink::new(tx);
        let output = run_with(worker, Duration::from_secs(5), &sink).await;
        assert_eq!(output.stdout, "a\n");
        assert_eq!(output.stderr, "b\n");
        assert!(output.succeeded());
        assert_eq!(rx.recv().await, Some(ExecutionEvent::Stdout { data: "a\n".into() }));
        assert_eq!(rx.recv().await, Some(ExecutionEvent::Stderr { data: "b\n".into() }));
    }

    #[tokio::test]
    async fn test_threw_frame_sets_status() {
        let dir = tempfile::tempdir().unwrap();
        let worker = fake_worker(
            dir.path(),
            r#"echo '{"kind":"stdout","data":"before\n"}'
echo '{"kind":"threw","message":"Error: boom"}'"#,
        );
        let output = run(worker).await;
        assert_eq!(output.stdout, "before\n");
        assert_eq!(output.status, RunStatus::Threw("Error: boom".into()));
    }

    #[tokio::test]
    async fn test_loop_limit_frame_reads_as_timeout() {
        let dir = tempfile::tempdir().unwrap();
        let worker = fake_worker(dir.path(), r#"echo '{"kind":"loop_limit"}'"#);
        assert_eq!(run(worker).await.status, RunStatus::TimedOut);
    }

    #[tokio::test]
    async fn test_output_limit_frame_sets_status() {
        let dir = tempfile::tempdir().unwrap();
        let worker = fake_worker(
            dir.path(),
            r#"echo '{"kind":"stdout","data":"xx"}'
echo '{"kind":"output_limit"}'"#,
        );
        assert_eq!(
            run(worker).await.status,
            RunStatus::OutputLimitExceeded { limit_bytes: 1024 }
        );
    }

    #[tokio::test]
    async fn test_runaway_worker_is_killed_at_timeout() {
        let dir = tempfile::tempdir().unwrap();
        let worker = fake_worker(dir.path(), "while :; do :; done");
        let start = Instant::now();
        let output = run_with(worker, Duration::from_millis(400), &OutputSink::disabled()).await;
        assert_eq!(output.status, RunStatus::TimedOut);
        assert!(start.elapsed() < Duration::from_millis(400 + 500));
    }

    #[tokio::test]
    async fn test_crashed_worker_reports_exit_and_stderr() {
        let dir = tempfile::tempdir().unwrap();
        let worker = fake_worker(dir.path(), "echo 'worker panicked' >&2; exit 101");
        let output = run(worker).await;
        assert_eq!(output.status, RunStatus::Exited(101));
        assert_eq!(output.stderr, "worker panicked\n");
    }

    #[tokio::test]
    async fn test_stray_lines_are_kept_on_stderr() {
        let dir = tempfile::tempdir().unwrap();
        let worker = fake_worker(dir.path(), "echo 'not a frame'");
        let output = run(worker).await;
        assert!(output.stdout.is_empty());
        assert_eq!(output.stderr, "not a frame\n");
    }

    #[tokio::test]
    async fn test_frames_split_across_chunks_are_reassembled() {
        let (tx, rx) = mpsc::channel(EVENT_BUFFER);
        for piece in [r#"{"kind":"std"#, r#"out","data":"hel"#, "lo\\n\"}\n{\"kind\":\"loop_limit\"}"] {
            tx.send(ExecutionEvent::Stdout { data: piece.into() }).await.unwrap();
        }
        drop(tx);
        let decoded = decode_frames(rx, &OutputSink::disabled()).await;
        assert_eq!(decoded.stdout, "hello\n");
        assert!(decoded.loop_limit);
    }

    #[test]
    fn test_limits_outrank_exit_codes() {
        let decoded = Decoded {
            threw: Some("late".into()),
            loop_limit: true,
            ..Decoded::default()
        };
        assert_eq!(decoded.status(ProcessExit::Exited(0), 8), RunStatus::TimedOut);
        assert_eq!(
            decoded.status(ProcessExit::OutputLimitExceeded, 8),
            RunStatus::OutputLimitExceeded { limit_bytes: 8 }
        );
        let decoded = Decoded::default();
        assert_eq!(decoded.status(ProcessExit::TimedOut, 8), RunStatus::TimedOut);
        assert_eq!(decoded.status(ProcessExit::Signaled(Some(9)), 8), RunStatus::Signaled(Some(9)));
    }
}
