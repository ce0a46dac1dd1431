//! # PtyBroker Protocol Library
//!
//! This crate defines the messages exchanged between a browser terminal panel
//! and the PtyBroker session broker.
//!
//! ## Transport Layout
//!
//! ```text
//! ┌─────────────────────────────────────────┐
//! │   Control messages (JSON text frames)   │  Envelope { id, payload }
//! ├─────────────────────────────────────────┤
//! │   Terminal bytes (binary frames)        │  raw, never re-encoded
//! ├─────────────────────────────────────────┤
//! │              WebSocket                  │
//! └─────────────────────────────────────────┘
//! ```
//!
//! ## Example Usage
//!
//! ```rust
//! use protocol::{ClientEnvelope, ClientMessage, Envelope};
//! use protocol::messages::CreateSession;
//!
//! let request = Envelope::reply(Some(1), ClientMessage::CreateSession(CreateSession::default()));
//! let json = request.to_json().unwrap();
//!
//! let parsed = ClientEnvelope::from_json(&json).unwrap();
//! assert_eq!(parsed, request);
//! ```
//!
//! ## Modules
//!
//! - [`messages`]: Request, acknowledgment and event definitions
//! - [`error`]: Error types

pub mod error;
pub mod messages;

pub use error::{ProtocolError, Result};
pub use messages::{
    ClientEnvelope, ClientMessage, EndReason, Envelope, ErrorCode, ErrorMessage, ServerEnvelope,
    ServerMessage, SessionDescriptor, DEFAULT_COLS, DEFAULT_ROWS,
};
