//! Backend supervisor: owns the single backend process.
//!
//! Runs as one actor task. `SupervisorHandle` callers send commands over an
//! mpsc channel and the actor applies them one at a time, so lifecycle
//! transitions never interleave. Lock-free reads go through `ArcSwap`.
//!
//! Each run gets an output pump that decodes stdout/stderr, broadcasts the
//! text to the relay and finally reports the exit back to the actor. A new
//! run is only spawned after that report, so no output of an old run can
//! follow output of the next one.

use std::sync::Arc;
use std::time::Duration;

use arc_swap::ArcSwap;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, error, info, warn};

use ultra_backend::{
    BackendError, ExitInfo, LaunchSpec, OutputStream, ProcessEvent, ProcessEvents, ProcessHandle,
    Utf8ChunkDecoder,
};
use ultra_classifier::{GENERIC_ERROR_MESSAGE, RATE_LIMIT_MARKER, RATE_LIMIT_MESSAGE};
use ultra_protocol::{ServerMessage, SupervisorSnapshot, SupervisorState};

use crate::relay::RelayChannel;

const COMMAND_CHANNEL_CAPACITY: usize = 64;
const SNAPSHOT_POLL_INTERVAL: Duration = Duration::from_millis(25);

pub const DEFAULT_GRACE_PERIOD: Duration = Duration::from_secs(5);

#[derive(Debug, Clone)]
pub struct SupervisorConfig {
    pub launch: LaunchSpec,
    /// Time between the termination request and the forced kill
    pub grace_period: Duration,
}

impl SupervisorConfig {
    pub fn new(launch: LaunchSpec) -> Self {
        Self {
            launch,
            grace_period: DEFAULT_GRACE_PERIOD,
        }
    }

    pub fn with_grace_period(mut self, grace_period: Duration) -> Self {
        self.grace_period = grace_period;
        self
    }
}

#[derive(Debug, Error)]
pub enum SupervisorError {
    #[error("Backend is already {0}")]
    AlreadyActive(SupervisorState),

    #[error("Backend unavailable: {0}")]
    BackendUnavailable(String),

    #[error("Backend process is not running")]
    NotRunning,

    #[error("Could not write to backend: {0}")]
    Input(BackendError),

    #[error("Supervisor is not running")]
    Unavailable,
}

impl SupervisorError {
    /// Stable code used in `error` events.
    pub fn code(&self) -> &'static str {
        match self {
            SupervisorError::AlreadyActive(_) => "already_active",
            SupervisorError::BackendUnavailable(_) => "backend_unavailable",
            SupervisorError::NotRunning => "not_running",
            SupervisorError::Input(_) => "backend_input_failed",
            SupervisorError::Unavailable => "supervisor_unavailable",
        }
    }

    /// Whether the supervisor already told every client about this failure.
    pub fn is_broadcast(&self) -> bool {
        matches!(
            self,
            SupervisorError::BackendUnavailable(_)
                | SupervisorError::NotRunning
                | SupervisorError::Input(_)
        )
    }
}

type Reply = oneshot::Sender<Result<(), SupervisorError>>;

enum SupervisorCommand {
    Start { reply: Reply },
    Restart { reply: Reply },
    Stop { reply: Reply },
    Forward { text: String, reply: Reply },
    /// Sent by a run's output pump once all of its output was broadcast
    Exited {
        run_id: String,
        exit: ExitInfo,
        rate_limited: bool,
    },
    GraceElapsed { run_id: String },
}

/// Handle to the supervisor actor (cheap to Clone).
#[derive(Clone)]
pub struct SupervisorHandle {
    command_tx: mpsc::Sender<SupervisorCommand>,
    snapshot: Arc<ArcSwap<SupervisorSnapshot>>,
}

impl SupervisorHandle {
    /// Spawn the supervisor actor. Must be called from within a Tokio runtime.
    pub fn spawn(config: SupervisorConfig, relay: Arc<RelayChannel>) -> Self {
        let (command_tx, command_rx) = mpsc::channel(COMMAND_CHANNEL_CAPACITY);
        let snapshot = Arc::new(ArcSwap::from_pointee(SupervisorSnapshot::default()));

        let supervisor = Supervisor {
            config,
            relay,
            snapshot: snapshot.clone(),
            command_tx: command_tx.downgrade(),
            state: SupervisorState::Idle,
            active: None,
            last_run_id: None,
            last_exit_code: None,
            restart_pending: false,
        };
        tokio::spawn(supervisor.run(command_rx));

        Self {
            command_tx,
            snapshot,
        }
    }

    pub async fn start(&self) -> Result<(), SupervisorError> {
        self.request(|reply| SupervisorCommand::Start { reply }).await
    }

    pub async fn restart(&self) -> Result<(), SupervisorError> {
        self.request(|reply| SupervisorCommand::Restart { reply })
            .await
    }

    pub async fn stop(&self) -> Result<(), SupervisorError> {
        self.request(|reply| SupervisorCommand::Stop { reply }).await
    }

    /// Write `text` plus a line terminator to the backend's stdin.
    pub async fn forward_to_backend(&self, text: impl Into<String>) -> Result<(), SupervisorError> {
        let text = text.into();
        self.request(|reply| SupervisorCommand::Forward { text, reply })
            .await
    }

    /// Lock-free snapshot read.
    pub fn snapshot(&self) -> Arc<SupervisorSnapshot> {
        self.snapshot.load_full()
    }

    /// Wait until the supervisor reaches `state`. Returns `false` on timeout.
    pub async fn wait_for_state(&self, state: SupervisorState, timeout: Duration) -> bool {
        let poll = async {
            while self.snapshot().state != state {
                tokio::time::sleep(SNAPSHOT_POLL_INTERVAL).await;
            }
        };
        tokio::time::timeout(timeout, poll).await.is_ok()
    }

    /// Stop the backend and wait for it to exit.
    pub async fn shutdown(&self, timeout: Duration) -> bool {
        if let Err(e) = self.stop().await {
            warn!(
                component = "supervisor",
                event = "supervisor.shutdown.stop_failed",
                error = %e,
                "Stop request failed during shutdown"
            );
            return false;
        }
        self.wait_for_state(SupervisorState::Idle, timeout).await
    }

    async fn request(
        &self,
        make: impl FnOnce(Reply) -> SupervisorCommand,
    ) -> Result<(), SupervisorError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.command_tx
            .send(make(reply_tx))
            .await
            .map_err(|_| SupervisorError::Unavailable)?;
        reply_rx.await.map_err(|_| SupervisorError::Unavailable)?
    }
}

struct Supervisor {
    config: SupervisorConfig,
    relay: Arc<RelayChannel>,
    snapshot: Arc<ArcSwap<SupervisorSnapshot>>,
    /// Weak: the actor stops once every handle is dropped.
    command_tx: mpsc::WeakSender<SupervisorCommand>,
    state: SupervisorState,
    active: Option<ProcessHandle>,
    last_run_id: Option<String>,
    last_exit_code: Option<i32>,
    restart_pending: bool,
}

impl Supervisor {
    async fn run(mut self, mut command_rx: mpsc::Receiver<SupervisorCommand>) {
        self.publish();
        while let Some(cmd) = command_rx.recv().await {
            self.handle(cmd);
        }

        if let Some(handle) = self.active.take() {
            info!(
                component = "supervisor",
                event = "supervisor.actor.closing",
                run_id = %handle.run_id(),
                "Supervisor dropped with a live backend, terminating it"
            );
            handle.terminate();
        }
    }

    fn handle(&mut self, cmd: SupervisorCommand) {
        match cmd {
            SupervisorCommand::Start { reply } => {
                let _ = reply.send(self.start());
            }
            SupervisorCommand::Restart { reply } => {
                let _ = reply.send(self.restart());
            }
            SupervisorCommand::Stop { reply } => {
                let _ = reply.send(self.stop());
            }
            SupervisorCommand::Forward { text, reply } => {
                let _ = reply.send(self.forward(&text));
            }
            SupervisorCommand::Exited {
                run_id,
                exit,
                rate_limited,
            } => self.exited(&run_id, exit, rate_limited),
            SupervisorCommand::GraceElapsed { run_id } => self.grace_elapsed(&run_id),
        }
    }

    fn start(&mut self) -> Result<(), SupervisorError> {
        if self.state != SupervisorState::Idle {
            info!(
                component = "supervisor",
                event = "supervisor.start.rejected",
                state = %self.state,
                "Start ignored, backend already active"
            );
            return Err(SupervisorError::AlreadyActive(self.state));
        }

        self.set_state(SupervisorState::Starting);
        match ultra_backend::spawn(self.config.launch.clone()) {
            Ok((handle, events)) => {
                self.spawn_pump(handle.run_id().to_string(), events);
                self.last_run_id = Some(handle.run_id().to_string());
                self.active = Some(handle);
                self.set_state(SupervisorState::Running);
                Ok(())
            }
            Err(e) => {
                error!(
                    component = "supervisor",
                    event = "supervisor.start.failed",
                    command = %self.config.launch.display_command(),
                    error = %e,
                    "Failed to spawn backend"
                );
                let err = SupervisorError::BackendUnavailable(e.to_string());
                self.relay
                    .broadcast(ServerMessage::error(err.code(), err.to_string()));
                self.set_state(SupervisorState::Idle);
                Err(err)
            }
        }
    }

    fn restart(&mut self) -> Result<(), SupervisorError> {
        match self.state {
            SupervisorState::Idle => self.start(),
            SupervisorState::Starting | SupervisorState::Running => {
                info!(
                    component = "supervisor",
                    event = "supervisor.restart.requested",
                    run_id = ?self.last_run_id,
                    "Restarting backend once the current run exits"
                );
                self.restart_pending = true;
                self.begin_termination();
                Ok(())
            }
            SupervisorState::Stopping => {
                self.restart_pending = true;
                self.publish();
                Ok(())
            }
        }
    }

    fn stop(&mut self) -> Result<(), SupervisorError> {
        let cleared_restart = std::mem::take(&mut self.restart_pending);
        match self.state {
            SupervisorState::Idle => {
                debug!(
                    component = "supervisor",
                    event = "supervisor.stop.noop",
                    "Stop ignored, backend idle"
                );
            }
            SupervisorState::Stopping => {
                if cleared_restart {
                    self.publish();
                }
            }
            SupervisorState::Starting | SupervisorState::Running => self.begin_termination(),
        }
        Ok(())
    }

    fn forward(&mut self, text: &str) -> Result<(), SupervisorError> {
        let result = match &self.active {
            Some(handle) => handle.write_line(text).map_err(|e| match e {
                BackendError::NotRunning => SupervisorError::NotRunning,
                other => SupervisorError::Input(other),
            }),
            None => Err(SupervisorError::NotRunning),
        };

        match &result {
            Ok(()) => debug!(
                component = "supervisor",
                event = "supervisor.forward",
                bytes = text.len() + 1,
                "Forwarded input to backend"
            ),
            Err(e) => {
                warn!(
                    component = "supervisor",
                    event = "supervisor.forward.failed",
                    state = %self.state,
                    error = %e,
                    "Could not forward input to backend"
                );
                self.relay
                    .broadcast(ServerMessage::error(e.code(), e.to_string()));
            }
        }
        result
    }

    fn exited(&mut self, run_id: &str, exit: ExitInfo, rate_limited: bool) {
        if self.active.as_ref().map(ProcessHandle::run_id) != Some(run_id) {
            debug!(
                component = "supervisor",
                event = "supervisor.exit.stale",
                run_id = %run_id,
                "Ignoring exit of a run that is no longer active"
            );
            return;
        }

        let crashed = self.state == SupervisorState::Running && !exit.success();
        self.active = None;
        self.last_exit_code = exit.code;

        if crashed {
            let message = if rate_limited {
                RATE_LIMIT_MESSAGE
            } else {
                GENERIC_ERROR_MESSAGE
            };
            warn!(
                component = "supervisor",
                event = "supervisor.backend.crashed",
                run_id = %run_id,
                exit_code = ?exit.code,
                signal = ?exit.signal,
                rate_limited,
                "Backend exited unexpectedly"
            );
            self.relay
                .broadcast(ServerMessage::error("backend_crashed", message));
        } else {
            info!(
                component = "supervisor",
                event = "supervisor.backend.exited",
                run_id = %run_id,
                exit_code = ?exit.code,
                signal = ?exit.signal,
                "Backend exited"
            );
        }

        self.relay.broadcast(ServerMessage::BackendExited {
            code: exit.code,
            crashed,
        });
        self.set_state(SupervisorState::Idle);

        if std::mem::take(&mut self.restart_pending) {
            // Spawn failures were already reported to clients by `start`.
            let _ = self.start();
        }
    }

    fn grace_elapsed(&mut self, run_id: &str) {
        if self.state != SupervisorState::Stopping {
            return;
        }
        let Some(handle) = self.active.as_ref().filter(|h| h.run_id() == run_id) else {
            return;
        };
        if handle.is_running() {
            warn!(
                component = "supervisor",
                event = "supervisor.stop.force_kill",
                run_id = %run_id,
                grace_ms = self.config.grace_period.as_millis() as u64,
                "Backend ignored termination, killing it"
            );
            handle.kill();
        }
    }

    fn begin_termination(&mut self) {
        if let Some(handle) = &self.active {
            handle.terminate();
            self.schedule_grace_timer(handle.run_id().to_string());
        }
        self.set_state(SupervisorState::Stopping);
    }

    fn schedule_grace_timer(&self, run_id: String) {
        let command_tx = self.command_tx.clone();
        let grace = self.config.grace_period;
        tokio::spawn(async move {
            tokio::time::sleep(grace).await;
            if let Some(command_tx) = command_tx.upgrade() {
                let _ = command_tx
                    .send(SupervisorCommand::GraceElapsed { run_id })
                    .await;
            }
        });
    }

    fn spawn_pump(&self, run_id: String, events: ProcessEvents) {
        tokio::spawn(pump_output(
            run_id,
            events,
            self.relay.clone(),
            self.command_tx.clone(),
        ));
    }

    fn set_state(&mut self, state: SupervisorState) {
        if self.state != state {
            debug!(
                component = "supervisor",
                event = "supervisor.state",
                from = %self.state,
                to = %state,
                "Supervisor state changed"
            );
        }
        self.state = state;
        self.publish();
    }

    fn publish(&self) {
        let snapshot = SupervisorSnapshot {
            state: self.state,
            pid: self.active.as_ref().and_then(ProcessHandle::pid),
            run_id: self.last_run_id.clone(),
            restart_pending: self.restart_pending,
            last_exit_code: self.last_exit_code,
        };
        self.snapshot.store(Arc::new(snapshot.clone()));
        self.relay
            .broadcast(ServerMessage::BackendStatus { snapshot });
    }
}

/// Forward one run's output to the relay, then report its exit.
async fn pump_output(
    run_id: String,
    mut events: ProcessEvents,
    relay: Arc<RelayChannel>,
    command_tx: mpsc::WeakSender<SupervisorCommand>,
) {
    let mut stdout = Utf8ChunkDecoder::new();
    let mut stderr = Utf8ChunkDecoder::new();
    let mut rate_limit = MarkerWatch::new(RATE_LIMIT_MARKER);

    while let Some(event) = events.recv().await {
        match event {
            ProcessEvent::Output { stream, chunk } => {
                let text = match stream {
                    OutputStream::Stdout => stdout.decode(&chunk),
                    OutputStream::Stderr => stderr.decode(&chunk),
                };
                emit_text(&relay, &run_id, stream, text, &mut rate_limit);
            }
            ProcessEvent::Exited(exit) => {
                emit_text(
                    &relay,
                    &run_id,
                    OutputStream::Stdout,
                    stdout.finish(),
                    &mut rate_limit,
                );
                emit_text(
                    &relay,
                    &run_id,
                    OutputStream::Stderr,
                    stderr.finish(),
                    &mut rate_limit,
                );
                if let Some(command_tx) = command_tx.upgrade() {
                    let _ = command_tx
                        .send(SupervisorCommand::Exited {
                            run_id,
                            exit,
                            rate_limited: rate_limit.seen(),
                        })
                        .await;
                }
                return;
            }
        }
    }
}

fn emit_text(
    relay: &RelayChannel,
    run_id: &str,
    stream: OutputStream,
    text: String,
    rate_limit: &mut MarkerWatch,
) {
    if text.is_empty() {
        return;
    }
    debug!(
        component = "supervisor",
        event = "backend.output",
        run_id = %run_id,
        stream = stream.as_str(),
        bytes = text.len(),
        text = %text,
        "Backend output"
    );
    let msg = match stream {
        OutputStream::Stdout => ServerMessage::BackendOutput { text },
        OutputStream::Stderr => {
            rate_limit.observe(&text);
            ServerMessage::BackendError { text }
        }
    };
    relay.broadcast(msg);
}

/// Detects a marker in a text stream even when it straddles two chunks.
struct MarkerWatch {
    marker: &'static str,
    tail: String,
    seen: bool,
}

impl MarkerWatch {
    fn new(marker: &'static str) -> Self {
        Self {
            marker,
            tail: String::new(),
            seen: false,
        }
    }

    fn observe(&mut self, text: &str) {
        if self.seen {
            return;
        }
        self.tail.push_str(text);
        if self.tail.contains(self.marker) {
            self.seen = true;
            self.tail.clear();
            return;
        }
        let keep = self.marker.len().saturating_sub(1);
        if self.tail.len() > keep {
            let mut cut = self.tail.len() - keep;
            while !self.tail.is_char_boundary(cut) {
                cut += 1;
            }
            self.tail.drain(..cut);
        }
    }

    fn seen(&self) -> bool {
        self.seen
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;

    const WAIT: Duration = Duration::from_secs(10);

    fn supervisor_for(
        program: &str,
        args: &[&str],
    ) -> (SupervisorHandle, mpsc::Receiver<ServerMessage>) {
        supervisor_with_grace(program, args, DEFAULT_GRACE_PERIOD)
    }

    fn supervisor_with_grace(
        program: &str,
        args: &[&str],
        grace_period: Duration,
    ) -> (SupervisorHandle, mpsc::Receiver<ServerMessage>) {
        let relay = Arc::new(RelayChannel::with_queue_capacity(1024));
        let (_client, rx) = relay.connect();
        let config = SupervisorConfig::new(LaunchSpec::new(program, args.iter().copied()))
            .with_grace_period(grace_period);
        (SupervisorHandle::spawn(config, relay), rx)
    }

    /// Receive until `pred` matches, returning everything seen up to and including the match.
    async fn recv_until(
        rx: &mut mpsc::Receiver<ServerMessage>,
        pred: impl Fn(&ServerMessage) -> bool,
    ) -> Vec<ServerMessage> {
        let mut seen = Vec::new();
        let found = tokio::time::timeout(WAIT, async {
            while let Some(msg) = rx.recv().await {
                let done = pred(&msg);
                seen.push(msg);
                if done {
                    return true;
                }
            }
            false
        })
        .await;
        assert!(matches!(found, Ok(true)), "expected message not seen, saw {seen:?}");
        seen
    }

    fn is_exit(msg: &ServerMessage) -> bool {
        matches!(msg, ServerMessage::BackendExited { .. })
    }

    fn is_error(msg: &ServerMessage) -> bool {
        matches!(msg, ServerMessage::Error { .. })
    }

    #[tokio::test]
    async fn second_start_is_rejected_and_keeps_one_process() {
        let (supervisor, _rx) = supervisor_for("sleep", &["30"]);

        supervisor.start().await.unwrap();
        let first = supervisor.snapshot();
        assert_eq!(first.state, SupervisorState::Running);
        assert!(first.pid.is_some());

        let err = supervisor.start().await.unwrap_err();
        assert!(matches!(
            err,
            SupervisorError::AlreadyActive(SupervisorState::Running)
        ));
        let second = supervisor.snapshot();
        assert_eq!(second.pid, first.pid);
        assert_eq!(second.run_id, first.run_id);

        supervisor.stop().await.unwrap();
        assert!(supervisor.wait_for_state(SupervisorState::Idle, WAIT).await);
    }

    #[tokio::test]
    async fn forwarded_text_reaches_stdin_with_newline() {
        let (supervisor, mut rx) = supervisor_for("cat", &[]);
        supervisor.start().await.unwrap();

        supervisor.forward_to_backend("User: hello").await.unwrap();
        let seen = recv_until(&mut rx, |msg| {
            matches!(msg, ServerMessage::BackendOutput { .. })
        })
        .await;
        assert_eq!(
            seen.last(),
            Some(&ServerMessage::BackendOutput {
                text: "User: hello\n".into()
            })
        );

        supervisor.stop().await.unwrap();
        assert!(supervisor.wait_for_state(SupervisorState::Idle, WAIT).await);
    }

    #[tokio::test]
    async fn forward_without_backend_fails_and_notifies_clients() {
        let (supervisor, mut rx) = supervisor_for("cat", &[]);

        let err = supervisor.forward_to_backend("anyone there?").await.unwrap_err();
        assert!(matches!(err, SupervisorError::NotRunning));
        assert!(err.is_broadcast());

        let seen = recv_until(&mut rx, is_error).await;
        match seen.last() {
            Some(ServerMessage::Error { code, .. }) => assert_eq!(code, "not_running"),
            other => panic!("expected error event, got {other:?}"),
        }
        assert_eq!(supervisor.snapshot().state, SupervisorState::Idle);
    }

    #[tokio::test]
    async fn spawn_failure_reports_unavailable_and_returns_to_idle() {
        let (supervisor, mut rx) = supervisor_for("/definitely/not/a/python", &["-u", "main.py"]);

        let err = supervisor.start().await.unwrap_err();
        assert!(matches!(err, SupervisorError::BackendUnavailable(_)));

        let seen = recv_until(&mut rx, is_error).await;
        match seen.last() {
            Some(ServerMessage::Error { code, .. }) => assert_eq!(code, "backend_unavailable"),
            other => panic!("expected error event, got {other:?}"),
        }
        let snapshot = supervisor.snapshot();
        assert_eq!(snapshot.state, SupervisorState::Idle);
        assert_eq!(snapshot.pid, None);

        // Idle again, so another attempt is allowed.
        assert!(matches!(
            supervisor.start().await,
            Err(SupervisorError::BackendUnavailable(_))
        ));
    }

    #[tokio::test]
    async fn crash_with_rate_limit_marker_reports_credit_message() {
        let (supervisor, mut rx) = supervisor_for(
            "sh",
            &[
                "-c",
                "printf 'openai.RateLi' >&2; printf 'mitError: quota exceeded' >&2; exit 1",
            ],
        );
        supervisor.start().await.unwrap();

        let seen = recv_until(&mut rx, is_exit).await;
        let stderr: String = seen
            .iter()
            .filter_map(|msg| match msg {
                ServerMessage::BackendError { text } => Some(text.as_str()),
                _ => None,
            })
            .collect();
        assert!(stderr.contains("openai.RateLimitError"));
        assert!(seen.contains(&ServerMessage::error("backend_crashed", RATE_LIMIT_MESSAGE)));
        assert_eq!(
            seen.last(),
            Some(&ServerMessage::BackendExited {
                code: Some(1),
                crashed: true
            })
        );

        assert!(supervisor.wait_for_state(SupervisorState::Idle, WAIT).await);
        assert_eq!(supervisor.snapshot().last_exit_code, Some(1));
    }

    #[tokio::test]
    async fn crash_without_marker_reports_generic_message() {
        let (supervisor, mut rx) = supervisor_for("sh", &["-c", "echo boom >&2; exit 2"]);
        supervisor.start().await.unwrap();

        let seen = recv_until(&mut rx, is_exit).await;
        assert!(seen.contains(&ServerMessage::error("backend_crashed", GENERIC_ERROR_MESSAGE)));
        assert!(!seen.contains(&ServerMessage::error("backend_crashed", RATE_LIMIT_MESSAGE)));
    }

    #[tokio::test]
    async fn clean_exit_is_not_a_crash() {
        let (supervisor, mut rx) = supervisor_for("sh", &["-c", "echo 'Loading...'"]);
        supervisor.start().await.unwrap();

        let seen = recv_until(&mut rx, is_exit).await;
        assert!(seen.contains(&ServerMessage::BackendOutput {
            text: "Loading...\n".into()
        }));
        assert!(!seen.iter().any(is_error));
        assert_eq!(
            seen.last(),
            Some(&ServerMessage::BackendExited {
                code: Some(0),
                crashed: false
            })
        );
    }

    #[tokio::test]
    async fn restart_spawns_the_next_run_only_after_the_old_one_exits() {
        let (supervisor, mut rx) = supervisor_for("sleep", &["30"]);
        supervisor.start().await.unwrap();
        let first = supervisor.snapshot();

        supervisor.restart().await.unwrap();
        let first_run = first.run_id.clone();
        let seen = recv_until(&mut rx, |msg| match msg {
            ServerMessage::BackendStatus { snapshot } => {
                snapshot.state == SupervisorState::Running && snapshot.run_id != first_run
            }
            _ => false,
        })
        .await;

        let exits: Vec<_> = seen.iter().filter(|msg| is_exit(msg)).collect();
        assert_eq!(
            exits,
            vec![&ServerMessage::BackendExited {
                code: None,
                crashed: false
            }]
        );
        let exit_at = seen.iter().position(is_exit).unwrap();
        assert_eq!(exit_at, seen.len() - 4, "exit precedes Idle, Starting, Running: {seen:?}");

        let second = supervisor.snapshot();
        assert_eq!(second.state, SupervisorState::Running);
        assert_ne!(second.pid, first.pid);
        assert!(!second.restart_pending);

        supervisor.stop().await.unwrap();
        assert!(supervisor.wait_for_state(SupervisorState::Idle, WAIT).await);
    }

    #[tokio::test]
    async fn stop_kills_a_backend_that_ignores_termination() {
        let (supervisor, mut rx) = supervisor_with_grace(
            "sh",
            &["-c", "trap '' TERM; echo ready; exec sleep 30"],
            Duration::from_millis(200),
        );
        supervisor.start().await.unwrap();
        recv_until(&mut rx, |msg| {
            matches!(msg, ServerMessage::BackendOutput { text } if text.contains("ready"))
        })
        .await;

        supervisor.stop().await.unwrap();
        assert_eq!(supervisor.snapshot().state, SupervisorState::Stopping);

        let seen = recv_until(&mut rx, is_exit).await;
        assert_eq!(
            seen.last(),
            Some(&ServerMessage::BackendExited {
                code: None,
                crashed: false
            })
        );
        assert!(supervisor.wait_for_state(SupervisorState::Idle, WAIT).await);
    }

    #[tokio::test]
    async fn stop_while_idle_is_a_no_op() {
        let (supervisor, _rx) = supervisor_for("sleep", &["30"]);
        supervisor.stop().await.unwrap();
        assert_eq!(supervisor.snapshot().state, SupervisorState::Idle);
        assert_eq!(supervisor.snapshot().run_id, None);
    }

    #[tokio::test]
    async fn stop_cancels_a_pending_restart() {
        let (supervisor, mut rx) = supervisor_with_grace(
            "sh",
            &["-c", "trap '' TERM; echo ready; exec sleep 30"],
            Duration::from_millis(300),
        );
        supervisor.start().await.unwrap();
        recv_until(&mut rx, |msg| {
            matches!(msg, ServerMessage::BackendOutput { text } if text.contains("ready"))
        })
        .await;

        supervisor.stop().await.unwrap();
        supervisor.restart().await.unwrap();
        assert!(supervisor.snapshot().restart_pending);
        supervisor.stop().await.unwrap();
        assert!(!supervisor.snapshot().restart_pending);

        assert!(supervisor.wait_for_state(SupervisorState::Idle, WAIT).await);
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(supervisor.snapshot().state, SupervisorState::Idle);
    }

    #[test]
    fn marker_watch_spans_chunk_boundaries() {
        let mut watch = MarkerWatch::new(RATE_LIMIT_MARKER);
        watch.observe("Traceback: openai.Rate");
        assert!(!watch.seen());
        watch.observe("LimitError: nope");
        assert!(watch.seen());

        let mut watch = MarkerWatch::new(RATE_LIMIT_MARKER);
        watch.observe("ééééééééééééééééééééééé openai.");
        watch.observe("APIError");
        assert!(!watch.seen());
    }
}
