//! Worker launchers
//!
//! [`ProcessLauncher`] starts the current executable as a worker process and
//! speaks the control protocol over its stdin, one JSON message per line.
//! [`TaskLauncher`] runs workers as tasks inside the current process.

use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Arc;

use async_trait::async_trait;
use futures::future::BoxFuture;
use tokio::io::AsyncWriteExt;
use tokio::process::{ChildStdin, Command};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use super::{ControlMessage, WorkerExit};
use crate::error::{Error, Result};

/// Starts workers and reports their exits
#[async_trait]
pub trait WorkerLauncher: Send + Sync {
    /// Start worker `id`; its exit is reported once on `exits`
    async fn launch(&self, id: usize, exits: mpsc::UnboundedSender<WorkerExit>) -> Result<WorkerHandle>;
}

/// Supervisor-side handle to a running worker
#[derive(Debug)]
pub struct WorkerHandle {
    id: usize,
    pid: Option<u32>,
    control: mpsc::UnboundedSender<ControlMessage>,
    kill: CancellationToken,
}

impl WorkerHandle {
    pub fn new(
        id: usize,
        pid: Option<u32>,
        control: mpsc::UnboundedSender<ControlMessage>,
        kill: CancellationToken,
    ) -> Self {
        Self {
            id,
            pid,
            control,
            kill,
        }
    }

    pub fn id(&self) -> usize {
        self.id
    }

    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    /// Queue a control message for the worker
    pub fn send(&self, msg: ControlMessage) -> Result<()> {
        self.control
            .send(msg)
            .map_err(|_| Error::Supervisor(format!("worker {} control channel closed", self.id)))
    }

    /// Terminate the worker without draining
    pub fn kill(&self) {
        self.kill.cancel();
    }
}

// =============================================================================
// Process Launcher
// =============================================================================

/// Launches `<program> <args> worker --id <n>` child processes
#[derive(Debug, Clone)]
pub struct ProcessLauncher {
    program: PathBuf,
    args: Vec<String>,
}

impl ProcessLauncher {
    pub fn new(program: impl Into<PathBuf>, args: Vec<String>) -> Self {
        Self {
            program: program.into(),
            args,
        }
    }

    /// Launcher re-executing the running binary
    pub fn current_exe(args: Vec<String>) -> Result<Self> {
        let program = std::env::current_exe()
            .map_err(|e| Error::Supervisor(format!("cannot locate current executable: {}", e)))?;
        Ok(Self::new(program, args))
    }
}

#[async_trait]
impl WorkerLauncher for ProcessLauncher {
    async fn launch(&self, id: usize, exits: mpsc::UnboundedSender<WorkerExit>) -> Result<WorkerHandle> {
        let mut child = Command::new(&self.program)
            .args(&self.args)
            .arg("worker")
            .arg("--id")
            .arg(id.to_string())
            .stdin(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| Error::Supervisor(format!("failed to start worker {}: {}", id, e)))?;

        let pid = child.id();
        let mut stdin = child.stdin.take();
        let (control_tx, mut control_rx) = mpsc::unbounded_channel();
        let kill = CancellationToken::new();
        let killer = kill.clone();

        tokio::spawn(async move {
            let mut control_open = true;
            let mut killed = false;
            let status = loop {
                tokio::select! {
                    status = child.wait() => break status,
                    msg = control_rx.recv(), if control_open => match msg {
                        Some(msg) => {
                            if let Err(e) = write_control(&mut stdin, msg).await {
                                tracing::warn!(worker = id, error = %e, "Failed to write control message");
                            }
                        }
                        None => control_open = false,
                    },
                    _ = killer.cancelled(), if !killed => {
                        killed = true;
                        if let Err(e) = child.start_kill() {
                            tracing::warn!(worker = id, error = %e, "Failed to kill worker");
                        }
                    }
                }
            };

            let code = match status {
                Ok(status) => status.code(),
                Err(e) => {
                    tracing::warn!(worker = id, error = %e, "Failed to wait for worker");
                    None
                }
            };
            let _ = exits.send(WorkerExit { id, pid, code });
        });

        Ok(WorkerHandle::new(id, pid, control_tx, kill))
    }
}

async fn write_control(stdin: &mut Option<ChildStdin>, msg: ControlMessage) -> Result<()> {
    let Some(pipe) = stdin.as_mut() else {
        return Err(Error::Supervisor("worker stdin is closed".into()));
    };
    let mut line = serde_json::to_vec(&msg)?;
    line.push(b'\n');
    pipe.write_all(&line).await?;
    pipe.flush().await?;
    Ok(())
}

// =============================================================================
// Task Launcher
// =============================================================================

type TaskBody = dyn Fn(usize, mpsc::UnboundedReceiver<ControlMessage>) -> BoxFuture<'static, i32> + Send + Sync;

/// Runs each worker as a task in the current process; the body's return
/// value is the worker's exit code
#[derive(Clone)]
pub struct TaskLauncher {
    body: Arc<TaskBody>,
}

impl TaskLauncher {
    pub fn new<F>(body: F) -> Self
    where
        F: Fn(usize, mpsc::UnboundedReceiver<ControlMessage>) -> BoxFuture<'static, i32> + Send + Sync + 'static,
    {
        Self { body: Arc::new(body) }
    }
}

#[async_trait]
impl WorkerLauncher for TaskLauncher {
    async fn launch(&self, id: usize, exits: mpsc::UnboundedSender<WorkerExit>) -> Result<WorkerHandle> {
        let (control_tx, control_rx) = mpsc::unbounded_channel();
        let kill = CancellationToken::new();
        let killer = kill.clone();
        let body = (self.body)(id, control_rx);

        tokio::spawn(async move {
            let code = tokio::select! {
                code = body => Some(code),
                _ = killer.cancelled() => None,
            };
            let _ = exits.send(WorkerExit { id, pid: None, code });
        });

        Ok(WorkerHandle::new(id, None, control_tx, kill))
    }
}
