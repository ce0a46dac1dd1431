//! PTY process management.
//!
//! This module owns one OS process attached to a pseudo-terminal. Bytes pass
//! through untouched in both directions. Three blocking threads serve each
//! process: a reader feeding a bounded output queue, a writer draining the
//! input queue, and a waiter that reaps the child and reports its exit status.

use std::io::{Read, Write};
use std::path::PathBuf;
use std::sync::Mutex as StdMutex;
use std::time::Duration;

use nix::sys::signal::{self, Signal};
use nix::unistd::Pid;
use portable_pty::{native_pty_system, Child, ChildKiller, CommandBuilder, MasterPty, PtySize};
use tokio::sync::{mpsc, oneshot, watch, Mutex};

use super::error::SessionError;
use super::SessionId;

/// Buffer size for reading from PTY.
const READ_BUFFER_SIZE: usize = 4096;

/// Input chunks queued ahead of the writer thread.
const INPUT_QUEUE_CAPACITY: usize = 128;

/// Parameters for spawning a shell on a fresh PTY.
#[derive(Debug, Clone)]
pub struct PtySpawnOptions {
    /// Session the process belongs to (used for logging).
    pub session_id: SessionId,
    /// Program to run.
    pub shell: String,
    /// Program arguments.
    pub args: Vec<String>,
    /// Complete environment. Nothing else is inherited.
    pub env: Vec<(String, String)>,
    /// Working directory.
    pub cwd: PathBuf,
    /// Terminal width in columns.
    pub cols: u16,
    /// Terminal height in rows.
    pub rows: u16,
    /// Output chunks buffered before the reader thread blocks.
    pub output_capacity: usize,
}

/// How a PTY process ended.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PtyExit {
    /// Exit code when the process exited normally.
    pub exit_code: Option<u32>,
    /// Signal name, when the PTY backend reports one.
    pub signal: Option<String>,
}

impl From<portable_pty::ExitStatus> for PtyExit {
    /// portable-pty 0.8 keeps the signal name private and folds a fatal signal
    /// into exit code 1, so only the code is reported.
    fn from(status: portable_pty::ExitStatus) -> Self {
        PtyExit {
            exit_code: Some(status.exit_code()),
            signal: None,
        }
    }
}

/// Notifications produced by a PTY process.
///
/// `output` yields chunks in the order the process produced them and closes
/// when the PTY reaches EOF. `exit` resolves once, after the child is reaped.
pub struct PtyEvents {
    /// Output chunks.
    pub output: mpsc::Receiver<Vec<u8>>,
    /// Exit status.
    pub exit: oneshot::Receiver<PtyExit>,
}

/// A process running on a pseudo-terminal.
pub struct PtyProcess {
    session_id: SessionId,

    /// The PTY master handle, used for resizing.
    master: Mutex<Box<dyn MasterPty + Send>>,

    /// Queue feeding the writer thread.
    input_tx: mpsc::Sender<Vec<u8>>,

    /// Fallback killer when the platform gives no pid.
    killer: StdMutex<Box<dyn ChildKiller + Send + Sync>>,

    /// Flips to `true` once the child has been reaped.
    exited: watch::Receiver<bool>,

    pid: Option<u32>,
}

impl PtyProcess {
    /// Spawns a process on a new PTY.
    ///
    /// Failures (bad shell path, permission denied, unusable cwd) are returned
    /// immediately and never retried.
    pub fn spawn(options: PtySpawnOptions) -> Result<(Self, PtyEvents), SessionError> {
        let pty_system = native_pty_system();

        let pair = pty_system
            .openpty(PtySize {
                rows: options.rows,
                cols: options.cols,
                pixel_width: 0,
                pixel_height: 0,
            })
            .map_err(|e| SessionError::SpawnFailed(e.to_string()))?;

        let mut cmd = CommandBuilder::new(&options.shell);
        cmd.args(&options.args);
        cmd.cwd(&options.cwd);
        cmd.env_clear();
        for (key, value) in &options.env {
            cmd.env(key, value);
        }

        let mut child = pair
            .slave
            .spawn_command(cmd)
            .map_err(|e| SessionError::SpawnFailed(e.to_string()))?;

        // The master only sees EOF once every slave handle is closed.
        drop(pair.slave);

        let pid = child.process_id();
        let killer = child.clone_killer();

        let io = pair
            .master
            .try_clone_reader()
            .and_then(|reader| Ok((reader, pair.master.take_writer()?)));
        let (reader, writer) = match io {
            Ok(io) => io,
            Err(e) => {
                let _ = child.kill();
                let _ = child.wait();
                return Err(SessionError::SpawnFailed(e.to_string()));
            }
        };

        let (output_tx, output_rx) = mpsc::channel(options.output_capacity.max(1));
        let (input_tx, input_rx) = mpsc::channel(INPUT_QUEUE_CAPACITY);
        let (exit_tx, exit_rx) = oneshot::channel();
        let (exited_tx, exited_rx) = watch::channel(false);

        let id = options.session_id.clone();
        let label = id.clone();
        spawn_thread("pty-reader", &id, move || read_loop(label, reader, output_tx))?;

        let label = id.clone();
        spawn_thread("pty-writer", &id, move || write_loop(label, writer, input_rx))?;

        let label = id.clone();
        spawn_thread("pty-waiter", &id, move || {
            wait_child(label, child, exited_tx, exit_tx)
        })?;

        tracing::debug!(
            session_id = %id,
            pid = ?pid,
            shell = %options.shell,
            cwd = %options.cwd.display(),
            "Spawned PTY process"
        );

        let process = PtyProcess {
            session_id: id,
            master: Mutex::new(pair.master),
            input_tx,
            killer: StdMutex::new(killer),
            exited: exited_rx,
            pid,
        };

        Ok((
            process,
            PtyEvents {
                output: output_rx,
                exit: exit_rx,
            },
        ))
    }

    /// Returns the process ID, if available.
    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    /// Returns whether the process has not been reaped yet.
    pub fn is_running(&self) -> bool {
        !*self.exited.borrow()
    }

    /// Queues input for the process.
    ///
    /// Returns once the bytes are queued; it does not wait for the process to
    /// read them.
    pub async fn write(&self, data: &[u8]) -> Result<(), SessionError> {
        if !self.is_running() {
            return Err(SessionError::WriteToDeadSession(self.session_id.clone()));
        }

        self.input_tx
            .send(data.to_vec())
            .await
            .map_err(|_| SessionError::WriteToDeadSession(self.session_id.clone()))
    }

    /// Resizes the PTY. The process receives `SIGWINCH`.
    pub async fn resize(&self, cols: u16, rows: u16) -> Result<(), SessionError> {
        if !self.is_running() {
            return Err(SessionError::WriteToDeadSession(self.session_id.clone()));
        }

        let master = self.master.lock().await;
        master
            .resize(PtySize {
                rows,
                cols,
                pixel_width: 0,
                pixel_height: 0,
            })
            .map_err(|e| SessionError::ResizeFailed(e.to_string()))
    }

    /// Sends `signal` to the process. A process that is already gone is not an
    /// error.
    pub fn kill(&self, signal: Signal) -> Result<(), SessionError> {
        if !self.is_running() {
            return Ok(());
        }

        match self.pid {
            Some(pid) => match signal::kill(Pid::from_raw(pid as i32), signal) {
                Ok(()) | Err(nix::errno::Errno::ESRCH) => Ok(()),
                Err(e) => Err(SessionError::KillFailed(e.to_string())),
            },
            None => {
                let mut killer = self
                    .killer
                    .lock()
                    .map_err(|_| SessionError::KillFailed("killer lock poisoned".to_string()))?;
                killer
                    .kill()
                    .map_err(|e| SessionError::KillFailed(e.to_string()))
            }
        }
    }

    /// Waits until the child has been reaped.
    pub async fn wait_exit(&self) {
        let mut exited = self.exited.clone();
        let _ = exited.wait_for(|done| *done).await;
    }

    /// Hangs up the process and escalates to `SIGKILL` if it is still alive
    /// after `grace`.
    pub async fn terminate(&self, grace: Duration) -> Result<(), SessionError> {
        if !self.is_running() {
            return Ok(());
        }

        self.kill(Signal::SIGHUP)?;

        if tokio::time::timeout(grace, self.wait_exit()).await.is_err() {
            tracing::warn!(
                session_id = %self.session_id,
                pid = ?self.pid,
                "Process ignored SIGHUP, sending SIGKILL"
            );
            self.kill(Signal::SIGKILL)?;
            self.wait_exit().await;
        }

        Ok(())
    }
}

fn spawn_thread<F>(role: &str, session_id: &str, body: F) -> Result<(), SessionError>
where
    F: FnOnce() + Send + 'static,
{
    let short: String = session_id.chars().take(8).collect();
    std::thread::Builder::new()
        .name(format!("{}-{}", role, short))
        .spawn(body)
        .map(|_| ())
        .map_err(|e| SessionError::SpawnFailed(format!("failed to start {} thread: {}", role, e)))
}

fn read_loop(session_id: SessionId, mut reader: Box<dyn Read + Send>, output_tx: mpsc::Sender<Vec<u8>>) {
    let mut buffer = vec![0u8; READ_BUFFER_SIZE];
    loop {
        match reader.read(&mut buffer) {
            Ok(0) => {
                tracing::debug!(session_id = %session_id, "PTY EOF");
                break;
            }
            Ok(n) => {
                // Blocks when the forwarder falls behind.
                if output_tx.blocking_send(buffer[..n].to_vec()).is_err() {
                    tracing::trace!(session_id = %session_id, "Output queue closed");
                    break;
                }
            }
            Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
            Err(e) => {
                // EIO is how Linux reports a hung-up PTY.
                tracing::debug!(session_id = %session_id, error = %e, "PTY read ended");
                break;
            }
        }
    }
}

fn write_loop(
    session_id: SessionId,
    mut writer: Box<dyn Write + Send>,
    mut input_rx: mpsc::Receiver<Vec<u8>>,
) {
    while let Some(chunk) = input_rx.blocking_recv() {
        if let Err(e) = writer.write_all(&chunk).and_then(|_| writer.flush()) {
            tracing::debug!(session_id = %session_id, error = %e, "PTY write failed");
            break;
        }
    }
}

fn wait_child(
    session_id: SessionId,
    mut child: Box<dyn Child + Send + Sync>,
    exited_tx: watch::Sender<bool>,
    exit_tx: oneshot::Sender<PtyExit>,
) {
    let exit = match child.wait() {
        Ok(status) => PtyExit::from(status),
        Err(e) => {
            tracing::error!(session_id = %session_id, error = %e, "Failed to wait for PTY child");
            PtyExit::default()
        }
    };

    let _ = exited_tx.send(true);
    tracing::info!(
        session_id = %session_id,
        exit_code = ?exit.exit_code,
        signal = ?exit.signal,
        "PTY process exited"
    );
    let _ = exit_tx.send(exit);
}
