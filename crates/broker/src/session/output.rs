//! Session output routing.
//!
//! Each session forwards its PTY output to at most one bound transport. While
//! no transport is bound, the most recent output is kept in a bounded replay
//! ring and handed to the next transport that attaches.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use protocol::ServerEnvelope;
use tokio::sync::mpsc;

use super::pty::{PtyEvents, PtyExit};
use super::record::Session;
use super::registry::SessionRegistry;

/// How long to keep draining output after the process has been reaped.
const EXIT_DRAIN_GRACE: Duration = Duration::from_millis(500);

/// Identifier of one client connection.
pub type TransportId = u64;

static NEXT_TRANSPORT_ID: AtomicU64 = AtomicU64::new(1);

/// Allocates a process-unique transport identifier.
pub fn next_transport_id() -> TransportId {
    NEXT_TRANSPORT_ID.fetch_add(1, Ordering::Relaxed)
}

/// A frame queued for a client connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OutboundFrame {
    /// Raw terminal bytes.
    Output(Vec<u8>),
    /// A control message.
    Message(ServerEnvelope),
}

/// Handle to a connection's outbound queue.
///
/// A session holds at most one binding. The binding does not own the
/// connection: dropping it never closes anything.
#[derive(Debug, Clone)]
pub struct TransportBinding {
    /// Connection the queue belongs to.
    pub id: TransportId,
    /// Outbound queue.
    pub tx: mpsc::Sender<OutboundFrame>,
}

impl TransportBinding {
    /// Creates a binding for the given connection.
    pub fn new(id: TransportId, tx: mpsc::Sender<OutboundFrame>) -> Self {
        Self { id, tx }
    }
}

/// Bounded ring of the most recent output bytes.
///
/// When full, the oldest bytes are discarded.
#[derive(Debug)]
pub struct ReplayBuffer {
    buf: VecDeque<u8>,
    capacity: usize,
    dropped: u64,
}

impl ReplayBuffer {
    /// Creates a ring holding up to `capacity` bytes. Zero disables replay.
    pub fn new(capacity: usize) -> Self {
        Self {
            buf: VecDeque::with_capacity(capacity.min(64 * 1024)),
            capacity,
            dropped: 0,
        }
    }

    /// Appends bytes, evicting the oldest on overflow.
    pub fn push(&mut self, data: &[u8]) {
        if self.capacity == 0 {
            self.dropped += data.len() as u64;
            return;
        }

        if data.len() >= self.capacity {
            self.dropped += (self.buf.len() + data.len() - self.capacity) as u64;
            self.buf.clear();
            self.buf.extend(&data[data.len() - self.capacity..]);
            return;
        }

        let overflow = (self.buf.len() + data.len()).saturating_sub(self.capacity);
        if overflow > 0 {
            self.buf.drain(..overflow);
            self.dropped += overflow as u64;
        }
        self.buf.extend(data);
    }

    /// Returns the buffered bytes, oldest first.
    pub fn snapshot(&self) -> Vec<u8> {
        self.buf.iter().copied().collect()
    }

    /// Number of buffered bytes.
    pub fn len(&self) -> usize {
        self.buf.len()
    }

    /// Returns true if nothing is buffered.
    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    /// Total bytes evicted so far.
    pub fn dropped(&self) -> u64 {
        self.dropped
    }
}

/// Output routing state of one session.
#[derive(Debug)]
pub struct OutputState {
    /// Currently bound transport.
    pub binding: Option<TransportBinding>,
    /// Recent output for reattach.
    pub replay: ReplayBuffer,
    /// Set once the session has told its transport it ended.
    pub ended: bool,
}

impl OutputState {
    /// Creates an unbound state with the given replay capacity.
    pub fn new(replay_capacity: usize) -> Self {
        Self {
            binding: None,
            replay: ReplayBuffer::new(replay_capacity),
            ended: false,
        }
    }
}

/// Pumps a session's PTY events until the process is gone.
///
/// Output chunks are delivered in order. Once the process has been reaped, the
/// remaining output is drained for a short grace period, the bound transport is
/// told the session ended, and the session is removed from the registry.
pub(crate) async fn forward_output(
    session: Arc<Session>,
    mut events: PtyEvents,
    registry: Weak<SessionRegistry>,
) {
    let mut output_open = true;

    let exit = loop {
        tokio::select! {
            biased;

            chunk = events.output.recv(), if output_open => match chunk {
                Some(data) => session.deliver(data).await,
                None => output_open = false,
            },

            exit = &mut events.exit => break exit.unwrap_or_default(),
        }
    };

    if output_open {
        let drain = async {
            while let Some(data) = events.output.recv().await {
                session.deliver(data).await;
            }
        };
        if tokio::time::timeout(EXIT_DRAIN_GRACE, drain).await.is_err() {
            tracing::debug!(
                session_id = %session.id(),
                "PTY still open after process exit, dropping remaining output"
            );
        }
    }

    finish(&session, exit, registry).await;
}

async fn finish(session: &Arc<Session>, exit: PtyExit, registry: Weak<SessionRegistry>) {
    session.finish(exit).await;

    if let Some(registry) = registry.upgrade() {
        registry.remove_ended(session);
    }
}
