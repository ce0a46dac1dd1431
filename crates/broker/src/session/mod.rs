//! Session management module.
//!
//! This module provides PTY spawning and session lifecycle management.
//! Sessions can be created, attached to, detached from, resized, and
//! destroyed. Process lifetime is independent of any client connection.

pub mod clock;
pub mod error;
pub mod output;
pub mod pty;
pub mod record;
pub mod registry;

/// Unique identifier for a session.
pub type SessionId = String;

/// Identity of the user owning a session.
pub type OwnerId = String;

pub use clock::{Clock, ManualClock, SystemClock};
pub use error::SessionError;
pub use output::{next_transport_id, OutboundFrame, TransportBinding, TransportId};
pub use pty::{PtyEvents, PtyExit, PtyProcess, PtySpawnOptions};
pub use record::Session;
pub use registry::{CreateOptions, RegistryStats, SessionRegistry, UserStats};
