use std::fmt;
use std::future;
use std::io;
use std::process::{ExitStatus, Stdio};

use async_trait::async_trait;
use nix::errno::Errno;
use nix::sys::signal::{self, Signal};
use nix::unistd::Pid;
use tokio::process::Command;
use tokio::sync::watch;
use tracing::{debug, warn};

#[derive(Debug, Clone, thiserror::Error)]
pub enum ExitError {
    #[error("exited with {0}")]
    Status(ExitStatus),
    #[error("could not wait for the process: {0}")]
    Wait(String),
}

/// A running build process.
#[async_trait]
pub trait Process: Send + Sync + fmt::Display {
    /// Resolves once, when the process exits. After that it never resolves
    /// again, so it can be polled in every iteration of a `select!` loop.
    async fn finished(&mut self) -> Result<(), ExitError>;

    /// Terminates the process and waits until it has exited.
    async fn kill(&mut self) -> io::Result<()>;

    fn is_running(&self) -> bool;
}

type ExitState = Option<Result<(), ExitError>>;

/// A child process whose exit is collected by a background task. Dropping a
/// running process sends it `SIGTERM` without waiting.
pub struct CmdProcess {
    command: String,
    pid: Option<u32>,
    exit: watch::Receiver<ExitState>,
    reported: bool,
}

impl CmdProcess {
    /// Spawns `program` with inherited stdio.
    pub fn spawn(program: &str, args: &[String]) -> io::Result<CmdProcess> {
        let command = std::iter::once(program)
            .chain(args.iter().map(String::as_str))
            .collect::<Vec<_>>()
            .join(" ");

        let mut child = Command::new(program)
            .args(args)
            .stdin(Stdio::null())
            .spawn()?;
        let pid = child.id();

        let (exit_tx, exit) = watch::channel(None);
        tokio::spawn(async move {
            let state = match child.wait().await {
                Ok(status) if status.success() => Ok(()),
                Ok(status) => Err(ExitError::Status(status)),
                Err(e) => Err(ExitError::Wait(e.to_string())),
            };
            let _ = exit_tx.send(Some(state));
        });

        debug!(pid, "started {command}");
        Ok(CmdProcess {
            command,
            pid,
            exit,
            reported: false,
        })
    }

    pub fn id(&self) -> Option<u32> {
        self.pid
    }

    /// Sends `SIGTERM`, which make passes on to the recipes it is running.
    fn terminate(&self) -> nix::Result<()> {
        let Some(pid) = self.pid else {
            return Ok(());
        };
        match signal::kill(Pid::from_raw(pid as i32), Signal::SIGTERM) {
            Ok(()) | Err(Errno::ESRCH) => Ok(()),
            Err(errno) => Err(errno),
        }
    }

    async fn wait(&mut self) -> Result<(), ExitError> {
        match self.exit.wait_for(Option::is_some).await {
            Ok(state) => (*state).clone().unwrap_or(Ok(())),
            Err(_) => Err(ExitError::Wait("exit watcher stopped".to_string())),
        }
    }
}

#[async_trait]
impl Process for CmdProcess {
    async fn finished(&mut self) -> Result<(), ExitError> {
        if self.reported {
            return future::pending().await;
        }
        let result = self.wait().await;
        self.reported = true;
        result
    }

    async fn kill(&mut self) -> io::Result<()> {
        if !self.is_running() {
            return Ok(());
        }
        self.terminate()?;
        let _ = self.wait().await;
        Ok(())
    }

    fn is_running(&self) -> bool {
        self.exit.borrow().is_none()
    }
}

impl Drop for CmdProcess {
    fn drop(&mut self) {
        if self.is_running() {
            if let Err(e) = self.terminate() {
                warn!("Error stopping {}: {e}", self.command);
            }
        }
    }
}

impl fmt::Display for CmdProcess {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.command)
    }
}
