//! Launch session state machine
//!
//! Pure state: no I/O, no clocks. The supervisor task feeds it inputs and
//! acts on the returned outcomes, so every transition goes through
//! `SessionMachine::apply`.

use std::collections::VecDeque;

use serde::Serialize;

use super::output_filter::contains_ready_marker;
use crate::events::CrashReport;

/// Output lines kept for launch failure messages
const TAIL_LINES: usize = 20;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case", tag = "state")]
pub enum LaunchState {
    Idle,
    Starting,
    Running { ready: bool },
    Stopped,
    /// Unexpected exit after readiness
    Crashed,
}

/// How the child process ended
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExitInfo {
    pub code: Option<i32>,
    pub signal: Option<i32>,
    /// Set when waiting on the child itself failed
    pub error: Option<String>,
}

impl ExitInfo {
    fn is_abnormal(&self) -> bool {
        self.signal.is_some() || self.error.is_some() || self.code != Some(0)
    }

    fn describe(&self) -> String {
        match (self.code, self.signal, &self.error) {
            (_, _, Some(error)) => error.clone(),
            (_, Some(signal), _) => format!("terminated by signal {}", signal),
            (Some(code), _, _) => format!("exited with code {}", code),
            (None, None, None) => "exited".to_string(),
        }
    }
}

#[derive(Debug, Clone)]
pub enum SessionInput {
    Spawned { pid: u32 },
    Line(String),
    StopRequested,
    Exited(ExitInfo),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionOutcome {
    /// First readiness marker; happens at most once per session
    Ready { pid: u32 },
    /// Exit before readiness
    LaunchFailed { message: String },
    Crashed(CrashReport),
    Stopped,
}

#[derive(Debug)]
pub struct SessionMachine {
    state: LaunchState,
    pid: u32,
    is_intentional_stop: bool,
    has_started_successfully: bool,
    tail: VecDeque<String>,
}

impl Default for SessionMachine {
    fn default() -> Self {
        Self::new()
    }
}

impl SessionMachine {
    pub fn new() -> Self {
        Self {
            state: LaunchState::Starting,
            pid: 0,
            is_intentional_stop: false,
            has_started_successfully: false,
            tail: VecDeque::with_capacity(TAIL_LINES),
        }
    }

    pub fn state(&self) -> LaunchState {
        self.state
    }

    pub fn is_ready(&self) -> bool {
        matches!(self.state, LaunchState::Running { ready: true })
    }

    pub fn apply(&mut self, input: SessionInput) -> Option<SessionOutcome> {
        match input {
            SessionInput::Spawned { pid } => {
                if self.state == LaunchState::Starting {
                    self.pid = pid;
                    self.state = LaunchState::Running { ready: false };
                }
                None
            }

            SessionInput::Line(line) => {
                let became_ready =
                    self.state == (LaunchState::Running { ready: false }) && contains_ready_marker(&line);

                if self.tail.len() == TAIL_LINES {
                    self.tail.pop_front();
                }
                self.tail.push_back(line);

                if became_ready {
                    self.state = LaunchState::Running { ready: true };
                    self.has_started_successfully = true;
                    return Some(SessionOutcome::Ready { pid: self.pid });
                }
                None
            }

            SessionInput::StopRequested => {
                self.is_intentional_stop = true;
                None
            }

            SessionInput::Exited(info) => self.on_exit(info),
        }
    }

    fn on_exit(&mut self, info: ExitInfo) -> Option<SessionOutcome> {
        if matches!(self.state, LaunchState::Stopped | LaunchState::Crashed) {
            return None;
        }

        if !self.has_started_successfully {
            self.state = LaunchState::Stopped;
            if self.is_intentional_stop {
                return Some(SessionOutcome::Stopped);
            }
            return Some(SessionOutcome::LaunchFailed {
                message: self.failure_message(&info),
            });
        }

        if self.is_intentional_stop || !info.is_abnormal() {
            self.state = LaunchState::Stopped;
            return Some(SessionOutcome::Stopped);
        }

        self.state = LaunchState::Crashed;
        Some(SessionOutcome::Crashed(CrashReport {
            pid: self.pid,
            exit_code: info.code,
            signal: info.signal,
            message: format!("Backend {}", info.describe()),
        }))
    }

    fn failure_message(&self, info: &ExitInfo) -> String {
        let mut message = format!("backend {} before it was ready", info.describe());
        if !self.tail.is_empty() {
            message.push('\n');
            message.push_str(&self.tail.iter().cloned().collect::<Vec<_>>().join("\n"));
        }
        message
    }
}
