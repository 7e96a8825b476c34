//! External tool invocation bounded by a deadline.
//!
//! Benchmarks block on one tool run at a time. The child itself is
//! supervised on the tokio runtime and terminated once its deadline passes
//! or a shutdown is requested.

use std::process::{ExitStatus, Output, Stdio};
use std::time::Duration;

use anyhow::{Context, Result};
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::{Child, Command};
use tokio::runtime::Handle;
use tokio::sync::watch;
use tracing::{debug, warn};

/// How long a child gets to exit after SIGTERM before it is killed.
const TERMINATE_GRACE: Duration = Duration::from_secs(5);

#[derive(Debug, Error)]
pub enum ExecError {
    #[error("{program} not found")]
    NotFound { program: String },

    #[error("failed to spawn {program}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to collect output of {program}: {source}")]
    Wait {
        program: String,
        #[source]
        source: std::io::Error,
    },

    #[error("{program} still running after {}s, killed", .after.as_secs())]
    Timeout { program: String, after: Duration },

    #[error("{program} stopped: shutdown requested")]
    Cancelled { program: String },
}

/// Sender side of the shutdown signal handed to a [`Runner`].
pub type ShutdownSender = watch::Sender<bool>;

/// Create a shutdown channel. Sending `true` stops the running child and
/// refuses to start new ones.
pub fn shutdown_channel() -> (ShutdownSender, watch::Receiver<bool>) {
    watch::channel(false)
}

/// Resolves once `true` has been sent. A dropped sender never resolves.
async fn shutdown_requested(shutdown: &mut watch::Receiver<bool>) {
    loop {
        if *shutdown.borrow_and_update() {
            return;
        }
        if shutdown.changed().await.is_err() {
            std::future::pending::<()>().await;
        }
    }
}

async fn read_pipe<R: AsyncRead + Unpin>(pipe: Option<R>) -> std::io::Result<Vec<u8>> {
    let mut buf = Vec::new();
    if let Some(mut pipe) = pipe {
        pipe.read_to_end(&mut buf).await?;
    }
    Ok(buf)
}

/// SIGTERM first so iperf3 can end the test with its server, then SIGKILL
/// after [`TERMINATE_GRACE`]. Always reaps the child.
async fn terminate_child(child: &mut Child) {
    #[cfg(unix)]
    {
        if let Some(pid) = child.id() {
            unsafe {
                libc::kill(pid as i32, libc::SIGTERM);
            }
        }
    }

    match tokio::time::timeout(TERMINATE_GRACE, child.wait()).await {
        Ok(Ok(status)) => {
            debug!(exit_code = status.code(), "child exited after SIGTERM");
        }
        Ok(Err(e)) => {
            warn!(error = %e, "error waiting for child after SIGTERM");
        }
        Err(_) => {
            warn!("child did not exit after SIGTERM, sending SIGKILL");
            if let Err(e) = child.kill().await {
                warn!(error = %e, "failed to SIGKILL child");
            }
        }
    }
}

enum Ending {
    Exited(std::io::Result<ExitStatus>),
    TimedOut,
    Cancelled,
}

/// Run `program args...` to completion, capturing stdout and stderr.
///
/// The child is terminated and reaped when `deadline` elapses or when the
/// shutdown signal fires. Nothing is spawned if shutdown was already
/// requested.
pub async fn run_with_deadline(
    program: &str,
    args: &[String],
    deadline: Duration,
    mut shutdown: watch::Receiver<bool>,
) -> Result<Output, ExecError> {
    if *shutdown.borrow() {
        return Err(ExecError::Cancelled {
            program: program.to_string(),
        });
    }
    debug!(%program, ?args, deadline_secs = deadline.as_secs_f64(), "spawning");

    let mut child = Command::new(program)
        .args(args)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .spawn()
        .map_err(|source| {
            if source.kind() == std::io::ErrorKind::NotFound {
                ExecError::NotFound {
                    program: program.to_string(),
                }
            } else {
                ExecError::Spawn {
                    program: program.to_string(),
                    source,
                }
            }
        })?;
    let pid = child.id();

    let stdout = tokio::spawn(read_pipe(child.stdout.take()));
    let stderr = tokio::spawn(read_pipe(child.stderr.take()));

    let ending = tokio::select! {
        biased;

        _ = shutdown_requested(&mut shutdown) => Ending::Cancelled,
        status = child.wait() => Ending::Exited(status),
        _ = tokio::time::sleep(deadline) => Ending::TimedOut,
    };

    match ending {
        Ending::Exited(Ok(status)) => {
            debug!(%program, ?pid, exit_code = status.code(), "exited");
            let wait_err = |source: std::io::Error| ExecError::Wait {
                program: program.to_string(),
                source,
            };
            let stdout = stdout
                .await
                .map_err(|e| wait_err(std::io::Error::other(e)))?
                .map_err(wait_err)?;
            let stderr = stderr
                .await
                .map_err(|e| wait_err(std::io::Error::other(e)))?
                .map_err(wait_err)?;
            Ok(Output {
                status,
                stdout,
                stderr,
            })
        }
        Ending::Exited(Err(source)) => Err(ExecError::Wait {
            program: program.to_string(),
            source,
        }),
        Ending::TimedOut => {
            warn!(%program, ?pid, deadline_secs = deadline.as_secs(), "deadline exceeded, terminating");
            terminate_child(&mut child).await;
            Err(ExecError::Timeout {
                program: program.to_string(),
                after: deadline,
            })
        }
        Ending::Cancelled => {
            warn!(%program, ?pid, "shutdown requested, terminating");
            terminate_child(&mut child).await;
            Err(ExecError::Cancelled {
                program: program.to_string(),
            })
        }
    }
}

/// Blocking front-end over [`run_with_deadline`] for code running on a
/// blocking thread (the benchmark loops).
#[derive(Debug, Clone)]
pub struct Runner {
    handle: Handle,
    shutdown: watch::Receiver<bool>,
}

impl Runner {
    /// Runner without a shutdown signal.
    pub fn new(handle: Handle) -> Self {
        let (_, shutdown) = shutdown_channel();
        Self::with_shutdown(handle, shutdown)
    }

    pub fn with_shutdown(handle: Handle, shutdown: watch::Receiver<bool>) -> Self {
        Self { handle, shutdown }
    }

    /// Bind to the runtime the caller is running inside.
    pub fn current(shutdown: watch::Receiver<bool>) -> Result<Self> {
        let handle = Handle::try_current().context("no tokio runtime available for process supervision")?;
        Ok(Self::with_shutdown(handle, shutdown))
    }

    /// Must not be called from an async task; use `spawn_blocking`.
    pub fn run(&self, program: &str, args: &[String], deadline: Duration) -> Result<Output, ExecError> {
        self.handle
            .block_on(run_with_deadline(program, args, deadline, self.shutdown.clone()))
    }
}
