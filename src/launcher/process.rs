//! Backend child process supervision
//!
//! One supervisor task per session owns the `Child` and its
//! `SessionMachine`. Reader tasks forward output lines over an mpsc
//! channel; stop requests arrive over a oneshot. Outcomes are published on
//! the event bus and the first readiness (or failure) resolves the launch.

use std::path::Path;
use std::process::{ExitStatus, Stdio};
use std::time::Duration;

use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;

use super::output_filter::is_noisy;
use super::session::{ExitInfo, LaunchState, SessionInput, SessionMachine, SessionOutcome};
use crate::error::{LauncherError, Result};
use crate::events::{EventBus, LauncherEvent, OutputStream};
use crate::platform::hide_console_window;

/// How long to keep draining output after the child exited
const DRAIN_TIMEOUT: Duration = Duration::from_millis(500);

#[derive(Debug)]
pub struct OutputLine {
    pub stream: OutputStream,
    pub text: String,
}

/// Forward lines of `reader` to `tx` until EOF or the receiver goes away.
///
/// Invalid UTF-8 is replaced rather than ending the stream.
pub fn spawn_line_reader<R>(reader: R, stream: OutputStream, tx: mpsc::Sender<OutputLine>) -> JoinHandle<()>
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut reader = BufReader::new(reader);
        let mut buf = Vec::new();

        loop {
            buf.clear();
            match reader.read_until(b'\n', &mut buf).await {
                Ok(0) => break,
                Ok(_) => {
                    let text = String::from_utf8_lossy(&buf)
                        .trim_end_matches(['\r', '\n'])
                        .to_string();
                    if tx.send(OutputLine { stream, text }).await.is_err() {
                        break;
                    }
                }
                Err(e) => {
                    log::debug!("Output reader ({:?}) stopped: {}", stream, e);
                    break;
                }
            }
        }
    })
}

/// Spawn a child with piped stdout/stderr feeding a fresh line channel
pub fn spawn_with_output(mut cmd: Command) -> std::io::Result<(Child, mpsc::Receiver<OutputLine>)> {
    cmd.stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);
    hide_console_window(&mut cmd);

    let mut child = cmd.spawn()?;
    let (tx, rx) = mpsc::channel(256);

    if let Some(stdout) = child.stdout.take() {
        spawn_line_reader(stdout, OutputStream::Stdout, tx.clone());
    }
    if let Some(stderr) = child.stderr.take() {
        spawn_line_reader(stderr, OutputStream::Stderr, tx);
    }

    Ok((child, rx))
}

/// Ask the child to exit; force-kill if it is still alive after `timeout`
pub async fn terminate(child: &mut Child, timeout: Duration) -> std::io::Result<ExitStatus> {
    if let Some(status) = child.try_wait()? {
        return Ok(status);
    }

    send_terminate(child);

    match tokio::time::timeout(timeout, child.wait()).await {
        Ok(status) => status,
        Err(_) => {
            log::warn!("Process did not exit within {:?}, killing it", timeout);
            child.kill().await?;
            child.wait().await
        }
    }
}

#[cfg(unix)]
fn send_terminate(child: &mut Child) {
    if let Some(pid) = child.id() {
        // SAFETY: signalling a pid we spawned and have not yet reaped
        let rc = unsafe { libc::kill(pid as libc::pid_t, libc::SIGTERM) };
        if rc != 0 {
            log::warn!("SIGTERM to {} failed: {}", pid, std::io::Error::last_os_error());
        }
    }
}

#[cfg(not(unix))]
fn send_terminate(child: &mut Child) {
    if let Err(e) = child.start_kill() {
        log::warn!("Failed to kill process: {}", e);
    }
}

fn exit_info(status: std::io::Result<ExitStatus>) -> ExitInfo {
    match status {
        Ok(status) => {
            #[cfg(unix)]
            let signal = std::os::unix::process::ExitStatusExt::signal(&status);
            #[cfg(not(unix))]
            let signal = None;

            ExitInfo {
                code: status.code(),
                signal,
                error: None,
            }
        }
        Err(e) => ExitInfo {
            error: Some(format!("failed to wait for backend: {}", e)),
            ..Default::default()
        },
    }
}

pub struct SupervisorOptions {
    pub events: EventBus,
    /// Forward noisy lines too
    pub debug_output: bool,
    /// Emit `ServerReady` on readiness (built-in frontend only)
    pub announce_ready: bool,
    pub stop_timeout: Duration,
}

/// Caller's handle on a running backend session
pub struct SessionHandle {
    pid: u32,
    stop_tx: Option<oneshot::Sender<()>>,
    state: watch::Receiver<LaunchState>,
    task: JoinHandle<()>,
    stop_timeout: Duration,
}

impl SessionHandle {
    pub fn pid(&self) -> u32 {
        self.pid
    }

    pub fn state(&self) -> LaunchState {
        *self.state.borrow()
    }

    /// Request an intentional stop and wait for the supervisor to finish
    pub async fn stop(mut self) {
        if let Some(tx) = self.stop_tx.take() {
            // Err means the supervisor already finished
            let _ = tx.send(());
        }

        let grace = self.stop_timeout + Duration::from_secs(5);
        match tokio::time::timeout(grace, &mut self.task).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => log::error!("Backend supervisor task failed: {}", e),
            Err(_) => {
                log::error!("Backend {} did not stop within {:?}", self.pid, grace);
                self.task.abort();
            }
        }
    }
}

/// Spawn the backend and its supervisor.
///
/// The returned receiver resolves with the pid on readiness, or with the
/// launch failure if the process exits first.
pub fn spawn_backend(
    launcher: &Path,
    args: &[String],
    options: SupervisorOptions,
) -> Result<(SessionHandle, oneshot::Receiver<Result<u32>>)> {
    let mut cmd = Command::new(launcher);
    cmd.args(args);
    if let Some(dir) = launcher.parent() {
        cmd.current_dir(dir);
    }

    let (child, lines) = spawn_with_output(cmd)
        .map_err(|e| LauncherError::LaunchFailed(format!("failed to spawn {}: {}", launcher.display(), e)))?;

    let pid = child.id().unwrap_or_default();
    log::info!("Spawned backend {} (pid {})", launcher.display(), pid);

    let (stop_tx, stop_rx) = oneshot::channel();
    let (ready_tx, ready_rx) = oneshot::channel();
    let (state_tx, state_rx) = watch::channel(LaunchState::Starting);
    let stop_timeout = options.stop_timeout;

    let supervisor = Supervisor {
        machine: SessionMachine::new(),
        ready_tx: Some(ready_tx),
        state_tx,
        options,
    };
    let task = tokio::spawn(supervisor.run(child, pid, lines, stop_rx));

    let handle = SessionHandle {
        pid,
        stop_tx: Some(stop_tx),
        state: state_rx,
        task,
        stop_timeout,
    };

    Ok((handle, ready_rx))
}

struct Supervisor {
    machine: SessionMachine,
    ready_tx: Option<oneshot::Sender<Result<u32>>>,
    state_tx: watch::Sender<LaunchState>,
    options: SupervisorOptions,
}

impl Supervisor {
    async fn run(
        mut self,
        mut child: Child,
        pid: u32,
        mut lines: mpsc::Receiver<OutputLine>,
        mut stop_rx: oneshot::Receiver<()>,
    ) {
        self.apply(SessionInput::Spawned { pid });

        let status = loop {
            tokio::select! {
                Some(line) = lines.recv() => self.on_line(line),
                res = &mut stop_rx => {
                    if res.is_ok() {
                        log::info!("Stopping backend (pid {})", pid);
                        self.apply(SessionInput::StopRequested);
                    }
                    // A dropped handle also ends the session
                    break terminate(&mut child, self.options.stop_timeout).await;
                }
                status = child.wait() => break status,
            }
        };

        // Readers may still hold the final lines, including the marker
        let deadline = tokio::time::Instant::now() + DRAIN_TIMEOUT;
        while let Ok(Some(line)) = tokio::time::timeout_at(deadline, lines.recv()).await {
            self.on_line(line);
        }

        let info = exit_info(status);
        log::info!("Backend (pid {}) exited: {:?}", pid, info);
        self.apply(SessionInput::Exited(info));

        if let Some(tx) = self.ready_tx.take() {
            let _ = tx.send(Err(LauncherError::Aborted));
        }
    }

    fn on_line(&mut self, line: OutputLine) {
        log::debug!("[backend {:?}] {}", line.stream, line.text);

        let forward = self.options.debug_output || !is_noisy(&line.text);
        if forward {
            self.options.events.emit(LauncherEvent::Output {
                stream: line.stream,
                line: line.text.clone(),
            });
        }

        self.apply(SessionInput::Line(line.text));
    }

    fn apply(&mut self, input: SessionInput) {
        let outcome = self.machine.apply(input);
        self.state_tx.send_replace(self.machine.state());

        let Some(outcome) = outcome else { return };
        let events = &self.options.events;

        match outcome {
            SessionOutcome::Ready { pid } => {
                log::info!("Backend ready (pid {})", pid);
                if let Some(tx) = self.ready_tx.take() {
                    let _ = tx.send(Ok(pid));
                }
                if self.options.announce_ready {
                    events.emit(LauncherEvent::ServerReady { pid });
                }
            }
            SessionOutcome::LaunchFailed { message } => {
                log::error!("Backend failed to start: {}", message);
                events.emit(LauncherEvent::LaunchFailed {
                    message: message.clone(),
                });
                if let Some(tx) = self.ready_tx.take() {
                    let _ = tx.send(Err(LauncherError::LaunchFailed(message)));
                }
            }
            SessionOutcome::Crashed(report) => {
                log::error!("Backend crashed: {}", report.message);
                events.emit(LauncherEvent::Crashed(report));
            }
            SessionOutcome::Stopped => {
                log::info!("Backend stopped");
                events.emit(LauncherEvent::Stopped);
            }
        }
    }
}
