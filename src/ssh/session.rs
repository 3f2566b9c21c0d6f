//! Interactive shell and one-shot command execution

use std::sync::Arc;

use russh::client::Msg;
use russh::{Channel, ChannelMsg, Pty};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use super::error::SshError;
use super::handle_owner::HandleController;

const TERM: &str = "xterm";

/// Echo on, CR/NL translation on, control-char echo off, 14.4 kbaud
const TERMINAL_MODES: &[(Pty, u32)] = &[
    (Pty::ECHO, 1),
    (Pty::ICRNL, 1),
    (Pty::ONLCR, 1),
    (Pty::ECHOCTL, 0),
    (Pty::TTY_OP_ISPEED, 14400),
    (Pty::TTY_OP_OSPEED, 14400),
];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShellStream {
    Stdout,
    Stderr,
}

/// Receives relayed shell output. Called from the relay task, so it must
/// not block.
pub trait ShellSink: Send + Sync {
    fn on_output(&self, stream: ShellStream, data: &[u8]);

    /// Shell ended; `exit_status` is set when the server reported one
    fn on_closed(&self, _exit_status: Option<u32>) {}
}

/// Watches output for markers that mean the remote session is over
pub trait SessionEndDetector: Send + Sync {
    fn is_session_end(&self, data: &[u8]) -> bool;
}

/// Matches `logout` or `connection closed`, case-insensitively
#[derive(Debug, Default, Clone, Copy)]
pub struct LogoutDetector;

impl SessionEndDetector for LogoutDetector {
    fn is_session_end(&self, data: &[u8]) -> bool {
        let text = String::from_utf8_lossy(data).to_lowercase();
        text.contains("logout") || text.contains("connection closed")
    }
}

/// Commands that can be sent to the relay task
#[derive(Debug)]
enum ShellCommand {
    Data(Vec<u8>),
    Resize { cols: u32, rows: u32 },
    Close,
}

/// A PTY-backed channel whose shell has not been started yet
pub struct PreparedShell {
    channel: Channel<Msg>,
    cols: u32,
    rows: u32,
}

/// Open a session channel and allocate a PTY on it
pub async fn open_shell(
    controller: &HandleController,
    cols: u32,
    rows: u32,
) -> Result<PreparedShell, SshError> {
    let channel = controller.open_session_channel().await?;

    channel
        .request_pty(false, TERM, cols, rows, 0, 0, TERMINAL_MODES)
        .await
        .map_err(|e| SshError::ChannelError(format!("PTY request failed: {}", e)))?;

    debug!("PTY allocated ({}x{})", cols, rows);
    Ok(PreparedShell {
        channel,
        cols,
        rows,
    })
}

impl PreparedShell {
    pub fn dimensions(&self) -> (u32, u32) {
        (self.cols, self.rows)
    }

    /// Request the shell and start relaying into `sink`.
    ///
    /// `teardown` is cancelled when the shell ends, either because the
    /// remote closed the channel or because `detector` fired.
    pub async fn start(
        self,
        label: String,
        sink: Arc<dyn ShellSink>,
        detector: Option<Arc<dyn SessionEndDetector>>,
        teardown: CancellationToken,
    ) -> Result<ShellHandle, SshError> {
        let mut channel = self.channel;
        channel
            .request_shell(false)
            .await
            .map_err(|e| SshError::ChannelError(format!("Shell request failed: {}", e)))?;

        info!("Interactive shell started for {}", label);

        let (cmd_tx, mut cmd_rx) = mpsc::channel::<ShellCommand>(1024);

        let task = tokio::spawn(async move {
            let mut exit_status = None;

            loop {
                tokio::select! {
                    cmd = cmd_rx.recv() => match cmd {
                        Some(ShellCommand::Data(data)) => {
                            if let Err(e) = channel.data(&data[..]).await {
                                error!("Failed to send data to shell for {}: {}", label, e);
                                break;
                            }
                        }
                        Some(ShellCommand::Resize { cols, rows }) => {
                            if let Err(e) = channel.window_change(cols, rows, 0, 0).await {
                                // Best effort, keep relaying
                                debug!("Failed to resize PTY for {}: {}", label, e);
                            }
                        }
                        Some(ShellCommand::Close) | None => {
                            let _ = channel.eof().await;
                            let _ = channel.close().await;
                            break;
                        }
                    },

                    msg = channel.wait() => match msg {
                        Some(ChannelMsg::Data { data }) => {
                            sink.on_output(ShellStream::Stdout, &data);
                            if detector.as_ref().is_some_and(|d| d.is_session_end(&data)) {
                                info!("Session end marker seen for {}", label);
                                break;
                            }
                        }
                        Some(ChannelMsg::ExtendedData { data, ext }) => {
                            if ext == 1 {
                                sink.on_output(ShellStream::Stderr, &data);
                                if detector.as_ref().is_some_and(|d| d.is_session_end(&data)) {
                                    info!("Session end marker seen for {}", label);
                                    break;
                                }
                            }
                        }
                        Some(ChannelMsg::ExitStatus { exit_status: status }) => {
                            info!("Shell exit status {} for {}", status, label);
                            exit_status = Some(status);
                        }
                        Some(ChannelMsg::Eof) => {
                            debug!("Shell EOF for {}", label);
                        }
                        Some(ChannelMsg::Close) | None => {
                            info!("Shell channel closed for {}", label);
                            break;
                        }
                        Some(_) => {}
                    },
                }
            }

            sink.on_closed(exit_status);
            teardown.cancel();
            info!("Shell relay terminated for {}", label);
        });

        Ok(ShellHandle { cmd_tx, task })
    }
}

/// Input side of a running shell
pub struct ShellHandle {
    cmd_tx: mpsc::Sender<ShellCommand>,
    task: JoinHandle<()>,
}

impl ShellHandle {
    pub async fn write(&self, data: &[u8]) -> Result<(), SshError> {
        self.cmd_tx
            .send(ShellCommand::Data(data.to_vec()))
            .await
            .map_err(|_| SshError::ChannelError("Shell has ended".to_string()))
    }

    /// Best effort; silently ignored once the shell has ended
    pub fn resize(&self, rows: u32, cols: u32) {
        let _ = self.cmd_tx.try_send(ShellCommand::Resize { cols, rows });
    }

    /// Idempotent
    pub fn close(&self) {
        let _ = self.cmd_tx.try_send(ShellCommand::Close);
    }

    pub fn is_running(&self) -> bool {
        !self.task.is_finished()
    }
}

/// Run `command` to completion and return stdout and stderr combined.
///
/// A non-zero exit status is an error carrying the output.
pub async fn run_command(controller: &HandleController, command: &str) -> Result<String, SshError> {
    let mut channel = controller.open_session_channel().await?;
    channel
        .exec(true, command)
        .await
        .map_err(|e| SshError::ChannelError(format!("Exec request failed: {}", e)))?;

    let mut output = Vec::new();
    let mut exit_status = None;
    while let Some(msg) = channel.wait().await {
        match msg {
            ChannelMsg::Data { data } => output.extend_from_slice(&data),
            ChannelMsg::ExtendedData { data, .. } => output.extend_from_slice(&data),
            ChannelMsg::ExitStatus { exit_status: status } => exit_status = Some(status),
            ChannelMsg::Close => break,
            _ => {}
        }
    }

    let output = String::from_utf8_lossy(&output).into_owned();
    match exit_status {
        Some(0) => Ok(output),
        Some(exit_status) => Err(SshError::CommandFailed {
            exit_status,
            output,
        }),
        None => Err(SshError::SessionError(
            "Command terminated without exit status".to_string(),
        )),
    }
}
