// Subprocess runner shared by every backend

use crate::error::BackendError;
use crate::sink::{OutputSink, Stream, Utf8Chunker};
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::process::{ExitStatus, Stdio};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tokio::process::{Child, Command};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

const READ_CHUNK_BYTES: usize = 8 * 1024;

/// How long pipe readers may keep draining after the process is gone
const READER_GRACE: Duration = Duration::from_millis(250);

/// Appended to the stream that crossed the output limit
pub const TRUNCATION_MARKER: &str = "\n[output truncated]\n";

/// A fully rendered command line
#[derive(Debug, Clone, Default)]
pub struct ProcessSpec {
    pub program: String,
    pub args: Vec<String>,
    pub env: BTreeMap<String, String>,
    pub stdin: Option<String>,
    pub cwd: Option<PathBuf>,
    /// Combined stdout and stderr bytes kept before the process is killed
    pub output_limit: Option<usize>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessExit {
    Exited(i32),
    Signaled(Option<i32>),
    TimedOut,
    OutputLimitExceeded,
}

#[derive(Debug, Clone)]
pub struct ProcessOutput {
    pub stdout: String,
    pub stderr: String,
    pub exit: ProcessExit,
}

/// Byte allowance shared by the stdout and stderr readers of one process
struct OutputBudget {
    remaining: Mutex<usize>,
    tripped: AtomicBool,
    exhausted: CancellationToken,
}

impl OutputBudget {
    fn new(limit: Option<usize>) -> Self {
        Self {
            remaining: Mutex::new(limit.unwrap_or(usize::MAX)),
            tripped: AtomicBool::new(false),
            exhausted: CancellationToken::new(),
        }
    }

    /// How many of `wanted` bytes may still be kept
    fn grant(&self, wanted: usize) -> usize {
        let mut remaining = self
            .remaining
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        let granted = wanted.min(*remaining);
        *remaining -= granted;
        granted
    }

    /// True for the first caller only
    fn trip(&self) -> bool {
        let first = !self.tripped.swap(true, Ordering::SeqCst);
        self.exhausted.cancel();
        first
    }
}

/// Spawn `spec`, stream its output into `sink` and wait at most `timeout`.
///
/// The child runs in its own process group. The timer, the output budget
/// and the wait race each other; whichever ends first, the whole group is
/// killed while the leader is still unreaped, then the leader is reaped.
/// Output produced before the kill is kept.
pub async fn run_process(
    spec: &ProcessSpec,
    timeout: Duration,
    sink: &OutputSink,
) -> Result<ProcessOutput, BackendError> {
    let mut cmd = Command::new(&spec.program);
    cmd.args(&spec.args)
        .envs(&spec.env)
        .stdin(if spec.stdin.is_some() {
            Stdio::piped()
        } else {
            Stdio::null()
        })
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);
    if let Some(cwd) = &spec.cwd {
        cmd.current_dir(cwd);
    }
    #[cfg(unix)]
    cmd.process_group(0);

    let mut child = cmd.spawn().map_err(|source| BackendError::Spawn {
        program: spec.program.clone(),
        source,
    })?;
    let pid = child.id();
    debug!(program = %spec.program, pid = ?pid, timeout_ms = timeout.as_millis() as u64, "Process spawned");

    if let (Some(input), Some(mut stdin)) = (spec.stdin.clone(), child.stdin.take()) {
        tokio::spawn(async move {
            // Broken pipe just means the program stopped reading
            let _ = stdin.write_all(input.as_bytes()).await;
            let _ = stdin.shutdown().await;
        });
    }

    let budget = Arc::new(OutputBudget::new(spec.output_limit));
    let stdout_buf = Arc::new(Mutex::new(String::new()));
    let stderr_buf = Arc::new(Mutex::new(String::new()));
    let stdout_reader = spawn_reader(
        child.stdout.take(),
        Stream::Stdout,
        sink.clone(),
        stdout_buf.clone(),
        budget.clone(),
    );
    let stderr_reader = spawn_reader(
        child.stderr.take(),
        Stream::Stderr,
        sink.clone(),
        stderr_buf.clone(),
        budget.clone(),
    );

    let token = CancellationToken::new();
    let timer = {
        let token = token.clone();
        tokio::spawn(async move {
            tokio::time::sleep(timeout).await;
            token.cancel();
        })
    };

    let stopped = tokio::select! {
        waited = wait_for_exit(&mut child, pid) => match waited {
            Ok(()) => None,
            Err(e) => {
                timer.abort();
                kill_process_group(pid);
                let _ = child.start_kill();
                let _ = child.wait().await;
                return Err(BackendError::io("waiting for process", e));
            }
        },
        _ = token.cancelled() => {
            warn!(program = %spec.program, pid = ?pid, timeout_ms = timeout.as_millis() as u64, "Process timed out - killing process group");
            Some(ProcessExit::TimedOut)
        }
        _ = budget.exhausted.cancelled() => {
            warn!(program = %spec.program, pid = ?pid, limit = ?spec.output_limit, "Output limit exceeded - killing process group");
            Some(ProcessExit::OutputLimitExceeded)
        }
    };
    timer.abort();

    // The leader is not reaped yet, so the group id still names our group.
    // Background children left in it would keep the pipes open.
    kill_process_group(pid);
    if stopped.is_some() {
        let _ = child.start_kill();
    }
    let status = child.wait().await;

    drain_reader(stdout_reader).await;
    drain_reader(stderr_reader).await;

    let exit = match (stopped, status) {
        (Some(exit), _) => exit,
        (None, Ok(status)) => exit_from_status(status),
        (None, Err(e)) => return Err(BackendError::io("waiting for process", e)),
    };

    Ok(ProcessOutput {
        stdout: take_buffer(&stdout_buf),
        stderr: take_buffer(&stderr_buf),
        exit,
    })
}

/// Resolve once the child has exited, leaving it unreaped
#[cfg(unix)]
async fn wait_for_exit(_child: &mut Child, pid: Option<u32>) -> std::io::Result<()> {
    let Some(pid) = pid else {
        return Ok(());
    };
    tokio::task::spawn_blocking(move || loop {
        // SAFETY: siginfo_t is plain data that waitid fills in; a zeroed
        // value is a valid initial state.
        let mut info: libc::siginfo_t = unsafe { std::mem::zeroed() };
        // SAFETY: WNOWAIT leaves the child waitable, so tokio still reaps
        // it through Child::wait afterwards.
        let rc = unsafe {
            libc::waitid(
                libc::P_PID,
                pid as libc::id_t,
                &mut info,
                libc::WEXITED | libc::WNOWAIT,
            )
        };
        if rc == 0 {
            return Ok(());
        }
        let err = std::io::Error::last_os_error();
        if err.kind() != std::io::ErrorKind::Interrupted {
            return Err(err);
        }
    })
    .await
    .map_err(std::io::Error::other)?
}

#[cfg(not(unix))]
async fn wait_for_exit(child: &mut Child, _pid: Option<u32>) -> std::io::Result<()> {
    child.wait().await.map(|_| ())
}

fn spawn_reader<R>(
    pipe: Option<R>,
    stream: Stream,
    sink: OutputSink,
    buffer: Arc<Mutex<String>>,
    budget: Arc<OutputBudget>,
) -> Option<JoinHandle<()>>
where
    R: AsyncRead + Unpin + Send + 'static,
{
    let mut pipe = pipe?;
    Some(tokio::spawn(async move {
        let mut chunk = vec![0u8; READ_CHUNK_BYTES];
        let mut decoder = Utf8Chunker::default();
        loop {
            match pipe.read(&mut chunk).await {
                Ok(0) => break,
                Ok(n) => {
                    let text = decoder.push(&chunk[..n]);
                    if !forward(text, stream, &sink, &buffer, &budget).await {
                        return;
                    }
                }
                Err(e) => {
                    debug!(stream = ?stream, error = %e, "Pipe read failed");
                    break;
                }
            }
        }
        let rest = decoder.finish();
        forward(rest, stream, &sink, &buffer, &budget).await;
    }))
}

/// Keep and stream `text` within the budget; false once the budget is spent
async fn forward(
    mut text: String,
    stream: Stream,
    sink: &OutputSink,
    buffer: &Mutex<String>,
    budget: &OutputBudget,
) -> bool {
    let granted = budget.grant(text.len());
    if granted == text.len() {
        append(buffer, &text);
        sink.emit(stream, text).await;
        return true;
    }

    let mut cut = granted;
    while !text.is_char_boundary(cut) {
        cut -= 1;
    }
    text.truncate(cut);
    if budget.trip() {
        text.push_str(TRUNCATION_MARKER);
    }
    append(buffer, &text);
    sink.emit(stream, text).await;
    false
}

fn append(buffer: &Mutex<String>, text: &str) {
    if text.is_empty() {
        return;
    }
    buffer
        .lock()
        .unwrap_or_else(|poisoned| poisoned.into_inner())
        .push_str(text);
}

fn take_buffer(buffer: &Mutex<String>) -> String {
    std::mem::take(&mut *buffer.lock().unwrap_or_else(|poisoned| poisoned.into_inner()))
}

async fn drain_reader(reader: Option<JoinHandle<()>>) {
    let Some(mut handle) = reader else {
        return;
    };
    if tokio::time::timeout(READER_GRACE, &mut handle).await.is_err() {
        debug!("Pipe reader did not finish within grace period - aborting");
        handle.abort();
    }
}

fn kill_process_group(pid: Option<u32>) {
    #[cfg(unix)]
    if let Some(pid) = pid {
        // SAFETY: kill(2) with a negative pid signals the process group we
        // created at spawn; no memory is shared with the callee.
        unsafe {
            libc::kill(-(pid as i32), libc::SIGKILL);
        }
    }
    #[cfg(not(unix))]
    let _ = pid;
}

fn exit_from_status(status: ExitStatus) -> ProcessExit {
    match status.code() {
        Some(code) => ProcessExit::Exited(code),
        None => ProcessExit::Signaled(signal_of(status)),
    }
}

#[cfg(unix)]
fn signal_of(status: ExitStatus) -> Option<i32> {
    use std::os::unix::process::ExitStatusExt;
    status.signal()
}

#[cfg(not(unix))]
fn signal_of(_status: ExitStatus) -> Option<i32> {
    None
}
