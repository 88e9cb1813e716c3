use std::io;
use std::path::Path;
use std::process::Command;

use nix::sys::signal::{self, Signal};
use nix::unistd::{getpid, getppid, Pid};
use tokio::signal::unix::{signal, SignalKind};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

#[derive(Debug, thiserror::Error)]
pub enum ReadyError {
    #[error("Error running ps for process {pid}: {source}")]
    Ps {
        pid: Pid,
        #[source]
        source: io::Error,
    },
    #[error("Unexpected ps output for process {pid}: '{output}'")]
    PsOutput { pid: Pid, output: String },
    #[error("Error signalling process {pid}: {source}")]
    Signal {
        pid: Pid,
        #[source]
        source: nix::Error,
    },
}

/// Listens for ready signals sent by `remake --ready`.
///
/// Only a single goal can use them: with several goals there is no telling
/// which build sent the signal, so they are received and ignored.
pub fn listen(goal_count: usize) -> io::Result<Option<mpsc::Receiver<()>>> {
    let mut signals = signal(SignalKind::user_defined1())?;
    if goal_count != 1 {
        tokio::spawn(async move {
            while signals.recv().await.is_some() {
                warn!("Ignoring ready signal: it is only supported with a single goal");
            }
        });
        return Ok(None);
    }

    let (tx, rx) = mpsc::channel(1);
    tokio::spawn(async move {
        while signals.recv().await.is_some() {
            debug!("received ready signal");
            // A ready signal that is already pending covers this one too.
            if let Err(mpsc::error::TrySendError::Closed(())) = tx.try_send(()) {
                break;
            }
        }
    });
    Ok(Some(rx))
}

/// Sends a ready signal to the closest ancestor process that runs the same
/// program as this one, which is the remake that started the build running
/// `remake --ready`. Returns whether such a process was found.
pub fn send_ready_signal() -> Result<bool, ReadyError> {
    let name = process_name(getpid())?;

    let mut ancestor = getppid();
    loop {
        if ancestor.as_raw() <= 1 {
            info!("No parent {name} process to signal");
            return Ok(false);
        }
        if process_name(ancestor)? == name {
            break;
        }
        ancestor = parent_id(ancestor)?;
    }

    signal::kill(ancestor, Signal::SIGUSR1).map_err(|source| ReadyError::Signal {
        pid: ancestor,
        source,
    })?;
    debug!(pid = ancestor.as_raw(), "sent ready signal");
    Ok(true)
}

fn process_name(pid: Pid) -> Result<String, ReadyError> {
    let output = ps(pid, "comm=")?;
    // Some systems print the full path of the executable.
    Ok(Path::new(&output)
        .file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or(output))
}

fn parent_id(pid: Pid) -> Result<Pid, ReadyError> {
    let output = ps(pid, "ppid=")?;
    output
        .parse()
        .map(Pid::from_raw)
        .map_err(|_| ReadyError::PsOutput { pid, output })
}

fn ps(pid: Pid, format: &str) -> Result<String, ReadyError> {
    let output = Command::new("ps")
        .args(["-p", &pid.to_string(), "-o", format])
        .output()
        .map_err(|source| ReadyError::Ps { pid, source })?;
    let text = String::from_utf8_lossy(&output.stdout).trim().to_string();
    if !output.status.success() || text.is_empty() {
        return Err(ReadyError::PsOutput { pid, output: text });
    }
    Ok(text)
}
