//! Pre-launch shell commands
//!
//! Started right before the backend and left running alongside it. They
//! are not awaited; `kill_all` tears them down with the session.

use std::time::Duration;

use tokio::process::{Child, Command};
use tokio::sync::Mutex;

use super::process::{spawn_with_output, terminate};
use crate::events::{EventBus, LauncherEvent};

#[derive(Default)]
pub struct PreLaunchCommands {
    children: Mutex<Vec<(String, Child)>>,
}

fn shell_command(command: &str) -> Command {
    if cfg!(windows) {
        let mut cmd = Command::new("cmd");
        cmd.arg("/C").arg(command);
        cmd
    } else {
        let mut cmd = Command::new("sh");
        cmd.arg("-c").arg(command);
        cmd
    }
}

impl PreLaunchCommands {
    pub fn new() -> Self {
        Self::default()
    }

    /// Spawn each command through the platform shell, forwarding its output
    pub async fn spawn_all(&self, commands: &[String], events: &EventBus) {
        let mut children = self.children.lock().await;

        for command in commands.iter().filter(|c| !c.trim().is_empty()) {
            match spawn_with_output(shell_command(command)) {
                Ok((child, mut lines)) => {
                    log::info!("Started pre-launch command '{}' (pid {:?})", command, child.id());

                    let events = events.clone();
                    tokio::spawn(async move {
                        while let Some(line) = lines.recv().await {
                            events.emit(LauncherEvent::Output {
                                stream: line.stream,
                                line: line.text,
                            });
                        }
                    });

                    children.push((command.clone(), child));
                }
                Err(e) => log::error!("Failed to start pre-launch command '{}': {}", command, e),
            }
        }
    }

    pub async fn kill_all(&self, timeout: Duration) {
        let children: Vec<(String, Child)> = self.children.lock().await.drain(..).collect();

        for (command, mut child) in children {
            match terminate(&mut child, timeout).await {
                Ok(status) => log::info!("Pre-launch command '{}' ended: {}", command, status),
                Err(e) => log::warn!("Failed to stop pre-launch command '{}': {}", command, e),
            }
        }
    }

    pub async fn running(&self) -> usize {
        self.children.lock().await.len()
    }
}
