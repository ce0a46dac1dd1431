//! A live terminal session.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, OnceLock};
use std::time::Duration;

use protocol::messages::{DetachReason, SessionDetached, SessionEnded};
use protocol::{EndReason, ServerEnvelope, ServerMessage, SessionDescriptor};
use tokio::sync::{watch, Mutex};

use super::clock::Clock;
use super::error::SessionError;
use super::output::{OutboundFrame, OutputState, TransportBinding, TransportId};
use super::pty::{PtyExit, PtyProcess};
use super::{OwnerId, SessionId};

/// How long a superseded connection's queue may stay full before its
/// `session_detached` notice is dropped.
const SUPERSEDED_NOTICE_TIMEOUT: Duration = Duration::from_secs(5);

/// A PTY process owned by one user, plus its output routing.
pub struct Session {
    id: SessionId,
    owner: OwnerId,
    process: PtyProcess,
    cwd: PathBuf,
    /// Columns in the high half, rows in the low half.
    geometry: AtomicU32,
    created_at: u64,
    last_activity: AtomicU64,
    output: Mutex<OutputState>,
    /// Bumped under the `output` lock whenever the binding changes.
    rebound: watch::Sender<u64>,
    end_reason: OnceLock<EndReason>,
    clock: Arc<dyn Clock>,
    output_counts_as_activity: bool,
}

/// Construction parameters for [`Session`].
pub(crate) struct SessionParts {
    pub id: SessionId,
    pub owner: OwnerId,
    pub process: PtyProcess,
    pub cwd: PathBuf,
    pub cols: u16,
    pub rows: u16,
    pub clock: Arc<dyn Clock>,
    pub replay_capacity: usize,
    pub output_counts_as_activity: bool,
}

fn pack(cols: u16, rows: u16) -> u32 {
    ((cols as u32) << 16) | rows as u32
}

impl Session {
    pub(crate) fn new(parts: SessionParts) -> Self {
        let now = parts.clock.now_millis();
        Self {
            id: parts.id,
            owner: parts.owner,
            process: parts.process,
            cwd: parts.cwd,
            geometry: AtomicU32::new(pack(parts.cols, parts.rows)),
            created_at: now,
            last_activity: AtomicU64::new(now),
            output: Mutex::new(OutputState::new(parts.replay_capacity)),
            rebound: watch::Sender::new(0),
            end_reason: OnceLock::new(),
            clock: parts.clock,
            output_counts_as_activity: parts.output_counts_as_activity,
        }
    }

    /// Returns the session ID.
    pub fn id(&self) -> &SessionId {
        &self.id
    }

    /// Returns the owner ID.
    pub fn owner(&self) -> &OwnerId {
        &self.owner
    }

    /// Returns the shell's process ID (0 when the platform gives none).
    pub fn pid(&self) -> u32 {
        self.process.pid().unwrap_or(0)
    }

    /// Returns the working directory the shell started in.
    pub fn cwd(&self) -> &Path {
        &self.cwd
    }

    /// Returns the current `(cols, rows)`.
    pub fn geometry(&self) -> (u16, u16) {
        let packed = self.geometry.load(Ordering::Acquire);
        ((packed >> 16) as u16, packed as u16)
    }

    /// Creation time in Unix epoch milliseconds.
    pub fn created_at(&self) -> u64 {
        self.created_at
    }

    /// Last activity time in Unix epoch milliseconds.
    pub fn last_activity_at(&self) -> u64 {
        self.last_activity.load(Ordering::Acquire)
    }

    /// How long the session has been idle, as of `now` (epoch millis).
    pub fn idle_for(&self, now: u64) -> Duration {
        Duration::from_millis(now.saturating_sub(self.last_activity_at()))
    }

    /// Returns whether the process is still running.
    pub fn is_running(&self) -> bool {
        self.process.is_running()
    }

    pub(crate) fn process(&self) -> &PtyProcess {
        &self.process
    }

    /// Returns a snapshot of the session's public state.
    pub fn descriptor(&self) -> SessionDescriptor {
        let (cols, rows) = self.geometry();
        SessionDescriptor {
            session_id: self.id.clone(),
            pid: self.pid(),
            cwd: self.cwd.display().to_string(),
            cols,
            rows,
            created_at: self.created_at,
            last_activity_at: self.last_activity_at(),
        }
    }

    /// Records activity at the current time.
    pub fn touch(&self) {
        self.last_activity
            .fetch_max(self.clock.now_millis(), Ordering::AcqRel);
    }

    /// Writes input to the process.
    pub async fn write(&self, data: &[u8]) -> Result<(), SessionError> {
        self.touch();
        self.process.write(data).await
    }

    /// Resizes the terminal.
    pub async fn resize(&self, cols: u16, rows: u16) -> Result<(), SessionError> {
        if cols == 0 || rows == 0 {
            return Err(SessionError::ResizeFailed(format!(
                "invalid geometry {}x{}",
                cols, rows
            )));
        }

        self.process.resize(cols, rows).await?;
        self.geometry.store(pack(cols, rows), Ordering::Release);
        self.touch();

        tracing::debug!(session_id = %self.id, cols, rows, "Resized session");
        Ok(())
    }

    /// Routes one output chunk to the replay ring and the bound transport.
    ///
    /// Waits for room in the transport's queue, so a slow client slows the
    /// reader thread rather than losing bytes. If the binding changes while
    /// waiting, the send is abandoned: the chunk is already in the replay ring
    /// the new transport received.
    pub(crate) async fn deliver(&self, data: Vec<u8>) {
        if self.output_counts_as_activity {
            self.touch();
        }

        let (binding, mut rebound) = {
            let mut output = self.output.lock().await;
            output.replay.push(&data);
            (output.binding.clone(), self.rebound.subscribe())
        };

        let Some(binding) = binding else {
            return;
        };

        tokio::select! {
            sent = binding.tx.send(OutboundFrame::Output(data)) => {
                if sent.is_err() {
                    tracing::debug!(
                        session_id = %self.id,
                        transport_id = binding.id,
                        "Bound transport is gone, unbinding"
                    );
                    self.unbind(binding.id).await;
                }
            }
            _ = rebound.changed() => {
                tracing::debug!(
                    session_id = %self.id,
                    transport_id = binding.id,
                    "Binding changed while output was queued"
                );
            }
        }
    }

    /// Binds a transport, replacing any previous one.
    ///
    /// `ack` is queued on the new transport first, then the replay ring. A
    /// different previously bound transport receives a `session_detached`
    /// notice. Fails with [`SessionError::NotFound`] once the session has
    /// ended.
    pub async fn bind(
        &self,
        binding: TransportBinding,
        ack: Option<OutboundFrame>,
    ) -> Result<(), SessionError> {
        let previous = {
            let mut output = self.output.lock().await;
            if output.ended {
                return Err(SessionError::NotFound(self.id.clone()));
            }

            if let Some(ack) = ack {
                let _ = binding.tx.send(ack).await;
            }
            if !output.replay.is_empty() {
                let _ = binding
                    .tx
                    .send(OutboundFrame::Output(output.replay.snapshot()))
                    .await;
            }
            let previous = output.binding.replace(binding.clone());
            self.rebound.send_modify(|generation| *generation += 1);
            previous
        };

        if let Some(previous) = previous.filter(|p| p.id != binding.id) {
            let notice = ServerEnvelope::event(ServerMessage::SessionDetached(SessionDetached {
                session_id: self.id.clone(),
                reason: DetachReason::Superseded,
            }));
            tracing::info!(
                session_id = %self.id,
                previous = previous.id,
                transport_id = binding.id,
                "Session attached by another connection"
            );
            tokio::spawn(async move {
                let _ = previous
                    .tx
                    .send_timeout(OutboundFrame::Message(notice), SUPERSEDED_NOTICE_TIMEOUT)
                    .await;
            });
        }

        Ok(())
    }

    /// Unbinds `transport_id` if it is the bound transport.
    pub async fn unbind(&self, transport_id: TransportId) -> bool {
        let mut output = self.output.lock().await;
        match &output.binding {
            Some(binding) if binding.id == transport_id => {
                output.binding = None;
                self.rebound.send_modify(|generation| *generation += 1);
                true
            }
            _ => false,
        }
    }

    /// Returns the bound transport, if any.
    pub async fn bound_transport(&self) -> Option<TransportId> {
        self.output.lock().await.binding.as_ref().map(|b| b.id)
    }

    /// Records why the session is ending. Only the first reason sticks.
    pub(crate) fn mark_ended(&self, reason: EndReason) {
        let _ = self.end_reason.set(reason);
    }

    /// The recorded end reason, [`EndReason::ProcessExited`] if none was set.
    pub fn end_reason(&self) -> EndReason {
        self.end_reason
            .get()
            .copied()
            .unwrap_or(EndReason::ProcessExited)
    }

    /// Tells the bound transport the session ended and unbinds it.
    pub(crate) async fn finish(&self, exit: PtyExit) {
        let reason = self.end_reason();
        let binding = {
            let mut output = self.output.lock().await;
            output.ended = true;
            self.rebound.send_modify(|generation| *generation += 1);
            output.binding.take()
        };

        tracing::info!(
            session_id = %self.id,
            owner = %self.owner,
            exit_code = ?exit.exit_code,
            signal = ?exit.signal,
            reason = ?reason,
            "Session ended"
        );

        if let Some(binding) = binding {
            let ended = ServerEnvelope::event(ServerMessage::SessionEnded(SessionEnded {
                session_id: self.id.clone(),
                exit_code: exit.exit_code,
                signal: exit.signal,
                reason,
            }));
            let _ = binding.tx.send(OutboundFrame::Message(ended)).await;
        }
    }
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("id", &self.id)
            .field("owner", &self.owner)
            .field("pid", &self.process.pid())
            .field("cwd", &self.cwd)
            .field("geometry", &self.geometry())
            .finish()
    }
}
