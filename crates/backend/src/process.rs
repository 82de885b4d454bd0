//! Backend process handle
//!
//! Spawns the backend executable with piped stdio and exposes it as:
//! - a `ProcessHandle` for stdin writes and termination requests
//! - a `ProcessEvents` receiver yielding raw output chunks, then exactly one
//!   `Exited` event once both output pipes have closed.
//!
//! Each spawn gets three background tasks: one reader per output pipe, a
//! stdin writer, and a monitor that owns the `Child` and reaps it.

use std::path::PathBuf;
use std::process::{ExitStatus, Stdio};
use std::sync::{Arc, OnceLock};
use std::time::Duration;

use bytes::Bytes;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tokio::process::{Child, ChildStdin};
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::BackendError;

const READ_CHUNK_BYTES: usize = 8 * 1024;
const EVENT_CHANNEL_CAPACITY: usize = 256;
const STDIN_CHANNEL_CAPACITY: usize = 256;
/// How long to wait for output pipes to close after the child was reaped.
/// Grandchildren inheriting the pipes would otherwise hold `Exited` back forever.
const OUTPUT_DRAIN_TIMEOUT: Duration = Duration::from_secs(2);

/// Executable and arguments for one backend run
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LaunchSpec {
    pub program: PathBuf,
    pub args: Vec<String>,
    pub cwd: Option<PathBuf>,
    pub env: Vec<(String, String)>,
}

impl LaunchSpec {
    pub fn new<I, S>(program: impl Into<PathBuf>, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            program: program.into(),
            args: args.into_iter().map(Into::into).collect(),
            cwd: None,
            env: Vec::new(),
        }
    }

    pub fn current_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.cwd = Some(dir.into());
        self
    }

    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.push((key.into(), value.into()));
        self
    }

    /// Human readable command line, for logs.
    pub fn display_command(&self) -> String {
        let mut out = self.program.display().to_string();
        for arg in &self.args {
            out.push(' ');
            out.push_str(arg);
        }
        out
    }
}

/// Which pipe a chunk came from
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputStream {
    Stdout,
    Stderr,
}

impl OutputStream {
    pub fn as_str(&self) -> &'static str {
        match self {
            OutputStream::Stdout => "stdout",
            OutputStream::Stderr => "stderr",
        }
    }
}

/// How the child terminated
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExitInfo {
    /// Exit code, `None` when killed by a signal
    pub code: Option<i32>,
    /// Terminating signal (unix only)
    pub signal: Option<i32>,
}

impl ExitInfo {
    pub fn success(&self) -> bool {
        self.code == Some(0)
    }

    fn from_status(status: &ExitStatus) -> Self {
        Self {
            code: status.code(),
            signal: exit_signal(status),
        }
    }
}

/// Events emitted by a running backend
#[derive(Debug, Clone)]
pub enum ProcessEvent {
    /// Raw bytes read from one pipe; not aligned to lines
    Output { stream: OutputStream, chunk: Bytes },
    /// Terminal event; no output follows it
    Exited(ExitInfo),
}

/// Receiving side of a backend's event stream.
#[derive(Debug)]
pub struct ProcessEvents {
    rx: mpsc::Receiver<ProcessEvent>,
}

impl ProcessEvents {
    /// Next event, or `None` after `Exited` has been delivered.
    pub async fn recv(&mut self) -> Option<ProcessEvent> {
        self.rx.recv().await
    }
}

enum Control {
    Terminate,
    Kill,
}

/// Handle to one live backend process (one run).
pub struct ProcessHandle {
    run_id: String,
    pid: Option<u32>,
    spec: LaunchSpec,
    stdin_tx: mpsc::Sender<Bytes>,
    control_tx: mpsc::UnboundedSender<Control>,
    exit: Arc<OnceLock<ExitInfo>>,
}

impl std::fmt::Debug for ProcessHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProcessHandle")
            .field("run_id", &self.run_id)
            .field("pid", &self.pid)
            .field("program", &self.spec.program)
            .field("exit", &self.exit.get())
            .finish()
    }
}

/// Spawn the backend described by `spec`.
///
/// Must be called from within a Tokio runtime.
pub fn spawn(spec: LaunchSpec) -> Result<(ProcessHandle, ProcessEvents), BackendError> {
    let run_id = uuid::Uuid::new_v4().to_string();

    let mut command = tokio::process::Command::new(&spec.program);
    command
        .args(&spec.args)
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);
    if let Some(dir) = &spec.cwd {
        command.current_dir(dir);
    }
    for (key, value) in &spec.env {
        command.env(key, value);
    }

    info!(
        component = "backend_process",
        event = "backend.spawn",
        run_id = %run_id,
        command = %spec.display_command(),
        cwd = ?spec.cwd,
        "Spawning backend process"
    );

    let mut child = command.spawn().map_err(|source| BackendError::Spawn {
        program: spec.program.display().to_string(),
        source,
    })?;
    let pid = child.id();

    let stdin = child.stdin.take().ok_or(BackendError::MissingPipe("stdin"))?;
    let stdout = child
        .stdout
        .take()
        .ok_or(BackendError::MissingPipe("stdout"))?;
    let stderr = child
        .stderr
        .take()
        .ok_or(BackendError::MissingPipe("stderr"))?;

    let (event_tx, event_rx) = mpsc::channel::<ProcessEvent>(EVENT_CHANNEL_CAPACITY);
    let (stdin_tx, stdin_rx) = mpsc::channel::<Bytes>(STDIN_CHANNEL_CAPACITY);
    let (control_tx, control_rx) = mpsc::unbounded_channel::<Control>();
    let exit = Arc::new(OnceLock::new());

    let readers = vec![
        tokio::spawn(read_output(
            stdout,
            OutputStream::Stdout,
            event_tx.clone(),
            run_id.clone(),
        )),
        tokio::spawn(read_output(
            stderr,
            OutputStream::Stderr,
            event_tx.clone(),
            run_id.clone(),
        )),
    ];
    tokio::spawn(stdin_writer(stdin, stdin_rx, run_id.clone()));
    tokio::spawn(monitor(
        child,
        pid,
        control_rx,
        readers,
        event_tx,
        exit.clone(),
        run_id.clone(),
    ));

    info!(
        component = "backend_process",
        event = "backend.spawned",
        run_id = %run_id,
        pid = ?pid,
        "Backend process started"
    );

    let handle = ProcessHandle {
        run_id,
        pid,
        spec,
        stdin_tx,
        control_tx,
        exit,
    };
    Ok((handle, ProcessEvents { rx: event_rx }))
}

impl ProcessHandle {
    pub fn run_id(&self) -> &str {
        &self.run_id
    }

    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    pub fn spec(&self) -> &LaunchSpec {
        &self.spec
    }

    pub fn is_running(&self) -> bool {
        self.exit.get().is_none()
    }

    /// Exit details, set once the child has been reaped.
    pub fn exit_info(&self) -> Option<ExitInfo> {
        self.exit.get().copied()
    }

    /// Queue bytes for the child's stdin without waiting.
    ///
    /// Fails with `InputFull` when the child has stopped draining stdin and
    /// the queue is at capacity.
    pub fn write_input(&self, data: impl Into<Bytes>) -> Result<(), BackendError> {
        if !self.is_running() {
            return Err(BackendError::NotRunning);
        }
        self.stdin_tx.try_send(data.into()).map_err(|e| match e {
            TrySendError::Full(_) => BackendError::InputFull,
            TrySendError::Closed(_) => BackendError::NotRunning,
        })
    }

    /// Write `text` followed by a line terminator.
    pub fn write_line(&self, text: &str) -> Result<(), BackendError> {
        let mut line = String::with_capacity(text.len() + 1);
        line.push_str(text);
        line.push('\n');
        self.write_input(line)
    }

    /// Ask the child to exit (SIGTERM on unix). No-op once it has exited.
    pub fn terminate(&self) {
        if !self.is_running() {
            return;
        }
        debug!(
            component = "backend_process",
            event = "backend.terminate_requested",
            run_id = %self.run_id,
            pid = ?self.pid,
            "Requesting backend termination"
        );
        let _ = self.control_tx.send(Control::Terminate);
    }

    /// Forcefully kill the child. No-op once it has exited.
    pub fn kill(&self) {
        if !self.is_running() {
            return;
        }
        warn!(
            component = "backend_process",
            event = "backend.kill_requested",
            run_id = %self.run_id,
            pid = ?self.pid,
            "Force killing backend process"
        );
        let _ = self.control_tx.send(Control::Kill);
    }
}

async fn read_output<R>(
    mut reader: R,
    stream: OutputStream,
    event_tx: mpsc::Sender<ProcessEvent>,
    run_id: String,
) where
    R: AsyncRead + Unpin,
{
    let mut buf = vec![0u8; READ_CHUNK_BYTES];
    loop {
        match reader.read(&mut buf).await {
            Ok(0) => break,
            Ok(n) => {
                let chunk = Bytes::copy_from_slice(&buf[..n]);
                if event_tx
                    .send(ProcessEvent::Output { stream, chunk })
                    .await
                    .is_err()
                {
                    debug!(
                        component = "backend_process",
                        event = "backend.output.receiver_dropped",
                        run_id = %run_id,
                        stream = stream.as_str(),
                        "Event receiver dropped, stopping reader"
                    );
                    return;
                }
            }
            Err(e) => {
                warn!(
                    component = "backend_process",
                    event = "backend.output.read_error",
                    run_id = %run_id,
                    stream = stream.as_str(),
                    error = %e,
                    "Error reading backend output"
                );
                break;
            }
        }
    }
    debug!(
        component = "backend_process",
        event = "backend.output.eof",
        run_id = %run_id,
        stream = stream.as_str(),
        "Backend output pipe closed"
    );
}

async fn stdin_writer(mut stdin: ChildStdin, mut rx: mpsc::Receiver<Bytes>, run_id: String) {
    while let Some(data) = rx.recv().await {
        if let Err(e) = stdin.write_all(&data).await {
            error!(
                component = "backend_process",
                event = "backend.stdin.write_error",
                run_id = %run_id,
                error = %e,
                "Failed to write to backend stdin"
            );
            break;
        }
        if let Err(e) = stdin.flush().await {
            error!(
                component = "backend_process",
                event = "backend.stdin.flush_error",
                run_id = %run_id,
                error = %e,
                "Failed to flush backend stdin"
            );
            break;
        }
    }
    debug!(
        component = "backend_process",
        event = "backend.stdin.closed",
        run_id = %run_id,
        "Stdin writer task ended"
    );
}

async fn monitor(
    mut child: Child,
    pid: Option<u32>,
    mut control_rx: mpsc::UnboundedReceiver<Control>,
    readers: Vec<JoinHandle<()>>,
    event_tx: mpsc::Sender<ProcessEvent>,
    exit: Arc<OnceLock<ExitInfo>>,
    run_id: String,
) {
    let status = loop {
        tokio::select! {
            status = child.wait() => break status,
            Some(control) = control_rx.recv() => match control {
                Control::Terminate => {
                    if let Err(e) = send_terminate(&mut child, pid) {
                        warn!(
                            component = "backend_process",
                            event = "backend.terminate_failed",
                            run_id = %run_id,
                            error = %e,
                            "Failed to signal backend process"
                        );
                    }
                }
                Control::Kill => {
                    if let Err(e) = child.start_kill() {
                        warn!(
                            component = "backend_process",
                            event = "backend.kill_failed",
                            run_id = %run_id,
                            error = %e,
                            "Failed to kill backend process"
                        );
                    }
                }
            },
        }
    };

    let info = match status {
        Ok(status) => ExitInfo::from_status(&status),
        Err(e) => {
            error!(
                component = "backend_process",
                event = "backend.wait_failed",
                run_id = %run_id,
                error = %e,
                "Failed to wait on backend process"
            );
            ExitInfo {
                code: None,
                signal: None,
            }
        }
    };

    let aborts: Vec<_> = readers.iter().map(JoinHandle::abort_handle).collect();
    if tokio::time::timeout(OUTPUT_DRAIN_TIMEOUT, futures::future::join_all(readers))
        .await
        .is_err()
    {
        warn!(
            component = "backend_process",
            event = "backend.output.drain_timeout",
            run_id = %run_id,
            "Output pipes still open after exit, abandoning readers"
        );
        for abort in aborts {
            abort.abort();
        }
    }

    let _ = exit.set(info);
    info!(
        component = "backend_process",
        event = "backend.exited",
        run_id = %run_id,
        code = ?info.code,
        signal = ?info.signal,
        "Backend process exited"
    );
    let _ = event_tx.send(ProcessEvent::Exited(info)).await;
}

#[cfg(unix)]
fn send_terminate(_child: &mut Child, pid: Option<u32>) -> std::io::Result<()> {
    // The monitor has not reaped the child yet, so the pid cannot have been reused.
    let Some(pid) = pid else {
        return Ok(());
    };
    let rc = unsafe { libc::kill(pid as libc::pid_t, libc::SIGTERM) };
    if rc == 0 {
        Ok(())
    } else {
        Err(std::io::Error::last_os_error())
    }
}

#[cfg(not(unix))]
fn send_terminate(child: &mut Child, _pid: Option<u32>) -> std::io::Result<()> {
    child.start_kill()
}

#[cfg(unix)]
fn exit_signal(status: &ExitStatus) -> Option<i32> {
    use std::os::unix::process::ExitStatusExt;
    status.signal()
}

#[cfg(not(unix))]
fn exit_signal(_status: &ExitStatus) -> Option<i32> {
    None
}
