//! Process host: spawns tool-server processes and relays their output.
//!
//! The stdio transport only owns framing; starting, feeding and killing the
//! child is delegated to a [`ProcessHost`], keyed by server id.

use crate::error::McpError;
use bytes::Bytes;
use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::process::Stdio;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::process::{ChildStdin, Command};
use tokio::sync::{mpsc, oneshot};

/// How long a process that exited on its own may keep its stdout open.
const STDOUT_DRAIN_TIMEOUT: Duration = Duration::from_secs(1);

/// What to launch.
#[derive(Debug, Clone, Default)]
pub struct ProcessSpec {
    pub command: String,
    pub args: Vec<String>,
    pub env: HashMap<String, String>,
    /// Run through `$SHELL -l -c` so the user's login PATH applies.
    pub login_shell: bool,
}

/// Output from a running process.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProcessEvent {
    /// Raw standard-output bytes; chunk boundaries are arbitrary.
    Stdout(Bytes),
    /// One line of standard error.
    Stderr(String),
    /// The process has exited. Follows every `Stdout` event it wrote
    /// before exiting.
    Exit(Option<i32>),
}

/// A freshly spawned process.
pub struct SpawnedProcess {
    pub pid: Option<u32>,
    pub events: mpsc::UnboundedReceiver<ProcessEvent>,
}

pub type HostFuture<'a, T> = Pin<Box<dyn Future<Output = Result<T, McpError>> + Send + 'a>>;

/// The capability to run tool-server processes.
pub trait ProcessHost: Send + Sync {
    /// Start a process registered under `server_id`.
    fn spawn(&self, server_id: &str, spec: &ProcessSpec) -> Result<SpawnedProcess, McpError>;

    /// Write bytes to the process's standard input.
    fn write<'a>(&'a self, server_id: &'a str, data: &'a [u8]) -> HostFuture<'a, ()>;

    /// Kill the process. Unknown ids are a no-op.
    fn kill<'a>(&'a self, server_id: &'a str) -> HostFuture<'a, ()>;

    fn is_running(&self, server_id: &str) -> bool;
}

struct ManagedProcess {
    stdin: Arc<tokio::sync::Mutex<ChildStdin>>,
    kill_tx: Option<oneshot::Sender<()>>,
    pid: Option<u32>,
}

/// [`ProcessHost`] backed by `tokio::process`.
#[derive(Clone, Default)]
pub struct TokioProcessHost {
    processes: Arc<Mutex<HashMap<String, ManagedProcess>>>,
}

impl TokioProcessHost {
    pub fn new() -> Self {
        Self::default()
    }

    fn build_command(spec: &ProcessSpec) -> Command {
        if spec.login_shell {
            let shell = std::env::var("SHELL").unwrap_or_else(|_| "/bin/sh".to_string());
            let mut cmd = Command::new(shell);
            cmd.arg("-l").arg("-c").arg(login_shell_line(spec));
            cmd
        } else {
            let mut cmd = Command::new(&spec.command);
            cmd.args(&spec.args).envs(&spec.env);
            cmd
        }
    }
}

/// Build the `-c` argument: exported env vars followed by the quoted command.
fn login_shell_line(spec: &ProcessSpec) -> String {
    let mut env: Vec<_> = spec.env.iter().collect();
    env.sort();
    let mut line = String::new();
    for (key, value) in env {
        line.push_str(&format!("export {key}={}; ", shell_quote(value)));
    }
    line.push_str(&shell_quote(&spec.command));
    for arg in &spec.args {
        line.push(' ');
        line.push_str(&shell_quote(arg));
    }
    line
}

fn shell_quote(s: &str) -> String {
    if !s.is_empty()
        && s
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || "-_./:=@%+,".contains(c))
    {
        s.to_string()
    } else {
        format!("'{}'", s.replace('\'', r"'\''"))
    }
}

impl ProcessHost for TokioProcessHost {
    fn spawn(&self, server_id: &str, spec: &ProcessSpec) -> Result<SpawnedProcess, McpError> {
        let mut cmd = Self::build_command(spec);
        cmd.stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let mut child = cmd.spawn().map_err(|e| McpError::SpawnFailed {
            name: spec.command.clone(),
            source: e,
        })?;
        let pid = child.id();

        let missing = |pipe: &str| McpError::SpawnFailed {
            name: spec.command.clone(),
            source: std::io::Error::other(format!("{pipe} was not piped")),
        };
        let stdin = child.stdin.take().ok_or_else(|| missing("stdin"))?;
        let mut stdout = child.stdout.take().ok_or_else(|| missing("stdout"))?;
        let stderr = child.stderr.take().ok_or_else(|| missing("stderr"))?;

        let (events_tx, events) = mpsc::unbounded_channel();

        let stdout_tx = events_tx.clone();
        let stdout_reader = tokio::spawn(async move {
            let mut buf = vec![0u8; 8192];
            loop {
                match stdout.read(&mut buf).await {
                    Ok(0) | Err(_) => break,
                    Ok(n) => {
                        let chunk = Bytes::copy_from_slice(&buf[..n]);
                        if stdout_tx.send(ProcessEvent::Stdout(chunk)).is_err() {
                            break;
                        }
                    }
                }
            }
        });

        let stderr_tx = events_tx.clone();
        tokio::spawn(async move {
            let mut lines = BufReader::new(stderr).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                if stderr_tx.send(ProcessEvent::Stderr(line)).is_err() {
                    break;
                }
            }
        });

        let (kill_tx, kill_rx) = oneshot::channel();
        let processes = Arc::clone(&self.processes);
        let id = server_id.to_string();
        tokio::spawn(async move {
            let code = tokio::select! {
                status = child.wait() => {
                    // Output written just before exit may still be in the pipe.
                    if tokio::time::timeout(STDOUT_DRAIN_TIMEOUT, stdout_reader).await.is_err() {
                        tracing::debug!(server = %id, "stdout still open after exit");
                    }
                    status.ok().and_then(|s| s.code())
                }
                _ = kill_rx => {
                    let _ = child.kill().await;
                    None
                }
            };
            {
                let mut processes = processes.lock().unwrap_or_else(PoisonError::into_inner);
                // A restart may already have registered a new process under this id.
                if processes.get(&id).is_some_and(|p| p.pid == pid) {
                    processes.remove(&id);
                }
            }
            tracing::debug!(server = %id, ?code, "MCP server process exited");
            let _ = events_tx.send(ProcessEvent::Exit(code));
        });

        let managed = ManagedProcess {
            stdin: Arc::new(tokio::sync::Mutex::new(stdin)),
            kill_tx: Some(kill_tx),
            pid,
        };
        let previous = self
            .processes
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(server_id.to_string(), managed);
        if let Some(mut old) = previous {
            if let Some(tx) = old.kill_tx.take() {
                let _ = tx.send(());
            }
        }

        tracing::info!(server = %server_id, ?pid, command = %spec.command, "Spawned MCP server");
        Ok(SpawnedProcess { pid, events })
    }

    fn write<'a>(&'a self, server_id: &'a str, data: &'a [u8]) -> HostFuture<'a, ()> {
        Box::pin(async move {
            let stdin = self
                .processes
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .get(server_id)
                .map(|p| Arc::clone(&p.stdin))
                .ok_or_else(|| McpError::ServerNotRunning {
                    name: server_id.to_string(),
                })?;
            let mut stdin = stdin.lock().await;
            stdin.write_all(data).await?;
            stdin.flush().await?;
            Ok(())
        })
    }

    fn kill<'a>(&'a self, server_id: &'a str) -> HostFuture<'a, ()> {
        Box::pin(async move {
            let removed = self
                .processes
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .remove(server_id);
            if let Some(mut process) = removed {
                if let Some(tx) = process.kill_tx.take() {
                    let _ = tx.send(());
                }
                tracing::info!(server = %server_id, "Killed MCP server");
            }
            Ok(())
        })
    }

    fn is_running(&self, server_id: &str) -> bool {
        self.processes
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .contains_key(server_id)
    }
}
