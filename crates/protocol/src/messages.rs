//! Protocol message definitions for PtyBroker.
//!
//! This module defines the request vocabulary a client sends over the terminal
//! WebSocket and the acknowledgments and events the broker sends back. Control
//! messages travel as JSON text frames wrapped in an [`Envelope`]; terminal
//! input and output travel as raw binary frames and never pass through this
//! module.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::error::Result;

/// Default terminal width used when a create request omits it.
pub const DEFAULT_COLS: u16 = 80;

/// Default terminal height used when a create request omits it.
pub const DEFAULT_ROWS: u16 = 24;

/// Envelope wrapper for all control messages.
///
/// Requests that expect an acknowledgment carry an `id`; the broker echoes it
/// on the matching response. One-way frames and unsolicited events have no id.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Envelope<T> {
    /// Correlation identifier chosen by the client.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<u64>,
    /// The actual message payload.
    pub payload: T,
}

impl<T> Envelope<T> {
    /// Create an envelope correlated with a request id.
    pub fn reply(id: Option<u64>, payload: T) -> Self {
        Self { id, payload }
    }

    /// Create an uncorrelated envelope (events, notices).
    pub fn event(payload: T) -> Self {
        Self { id: None, payload }
    }
}

impl<T: Serialize> Envelope<T> {
    /// Serialize the envelope to a JSON string.
    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }
}

impl<T: DeserializeOwned> Envelope<T> {
    /// Parse an envelope from a JSON string.
    pub fn from_json(text: &str) -> Result<Self> {
        Ok(serde_json::from_str(text)?)
    }
}

/// Envelope carrying a client request.
pub type ClientEnvelope = Envelope<ClientMessage>;

/// Envelope carrying a broker response or event.
pub type ServerEnvelope = Envelope<ServerMessage>;

// ============================================================================
// Client -> broker
// ============================================================================

/// Messages sent by a client.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMessage {
    /// Spawn a new shell session and bind this connection to it.
    CreateSession(CreateSession),
    /// Bind this connection to an existing session.
    AttachSession(AttachSession),
    /// Unbind this connection from its session without destroying it.
    DetachSession,
    /// Text input for the bound session. Binary frames are the preferred path.
    TerminalInput(TerminalInput),
    /// New geometry for the bound session.
    TerminalResize(TerminalResize),
    /// Destroy a session (the bound one when no id is given).
    DestroySession(DestroySession),
    /// List the caller's sessions.
    ListSessions,
    /// Keepalive.
    Ping,
}

impl ClientMessage {
    /// Returns whether the message expects an acknowledgment.
    pub fn expects_reply(&self) -> bool {
        !matches!(
            self,
            ClientMessage::TerminalInput(_) | ClientMessage::TerminalResize(_)
        )
    }
}

/// Request to create a new shell session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CreateSession {
    /// Requested terminal columns.
    #[serde(default = "default_cols")]
    pub cols: u16,
    /// Requested terminal rows.
    #[serde(default = "default_rows")]
    pub rows: u16,
    /// Working directory; created if it does not exist.
    #[serde(default)]
    pub cwd: Option<String>,
}

impl Default for CreateSession {
    fn default() -> Self {
        Self {
            cols: DEFAULT_COLS,
            rows: DEFAULT_ROWS,
            cwd: None,
        }
    }
}

fn default_cols() -> u16 {
    DEFAULT_COLS
}

fn default_rows() -> u16 {
    DEFAULT_ROWS
}

/// Request to attach to an existing session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AttachSession {
    /// Session ID to attach to.
    pub session_id: String,
}

/// Text input for the bound session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TerminalInput {
    /// Input passed to the process untouched.
    pub data: String,
}

/// Terminal resize notification.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TerminalResize {
    /// New terminal columns.
    pub cols: u16,
    /// New terminal rows.
    pub rows: u16,
}

/// Request to destroy a session.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DestroySession {
    /// Session to destroy; defaults to the bound session.
    #[serde(default)]
    pub session_id: Option<String>,
}

// ============================================================================
// Broker -> client
// ============================================================================

/// Messages sent by the broker.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMessage {
    /// Acknowledges `create_session`.
    SessionCreated(SessionCreated),
    /// Acknowledges `attach_session`.
    SessionAttached(SessionAttached),
    /// The connection is no longer bound to the session.
    SessionDetached(SessionDetached),
    /// Acknowledges `destroy_session`.
    SessionDestroyed(SessionDestroyed),
    /// Acknowledges `list_sessions`.
    SessionList(SessionList),
    /// The session's process is gone. Sent once, to the bound connection.
    SessionEnded(SessionEnded),
    /// A request failed, or a non-fatal notice.
    Error(ErrorMessage),
    /// Reply to `ping`.
    Pong,
}

/// Snapshot of a session's public state.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionDescriptor {
    /// Unique session identifier.
    pub session_id: String,
    /// Process ID of the shell.
    pub pid: u32,
    /// Working directory the shell was started in.
    pub cwd: String,
    /// Current terminal columns.
    pub cols: u16,
    /// Current terminal rows.
    pub rows: u16,
    /// Creation time, Unix epoch milliseconds.
    pub created_at: u64,
    /// Last activity time, Unix epoch milliseconds.
    pub last_activity_at: u64,
}

/// Response confirming session creation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionCreated {
    pub session: SessionDescriptor,
}

/// Response confirming attachment.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionAttached {
    pub session: SessionDescriptor,
}

/// Why a connection stopped receiving a session's output.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DetachReason {
    /// The client asked to detach.
    Requested,
    /// Another connection attached to the session.
    Superseded,
}

/// Detach notification.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionDetached {
    pub session_id: String,
    pub reason: DetachReason,
}

/// Response confirming destruction.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionDestroyed {
    pub session_id: String,
}

/// Response listing the caller's sessions.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionList {
    pub sessions: Vec<SessionDescriptor>,
}

/// What ended a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EndReason {
    /// The process exited on its own (e.g. the user typed `exit`).
    ProcessExited,
    /// An explicit destroy request.
    Destroyed,
    /// The idle sweep reclaimed the session.
    IdleTimeout,
    /// The broker is shutting down.
    Shutdown,
}

/// Session ended notification.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionEnded {
    /// Session ID that ended.
    pub session_id: String,
    /// Exit code if the process exited normally.
    pub exit_code: Option<u32>,
    /// Signal name if the process was killed by a signal.
    pub signal: Option<String>,
    /// What triggered the end.
    pub reason: EndReason,
}

/// Error or notice message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorMessage {
    /// Error code for programmatic handling.
    pub code: ErrorCode,
    /// Human-readable error message.
    pub message: String,
    /// Optional context (e.g., session_id).
    pub context: Option<String>,
    /// Whether the client can act on the error and retry.
    pub recoverable: bool,
}

/// Error codes for common error conditions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCode {
    /// The owner already has the maximum number of sessions.
    SessionLimitExceeded,
    /// The referenced session does not exist (or belongs to someone else).
    SessionNotFound,
    /// The shell process could not be started.
    ProcessSpawnFailed,
    /// The connection carries no valid identity.
    TransportAuthRequired,
    /// Input arrived for a session whose process is already gone.
    WriteToDeadSession,
    /// The caller lacks the required role.
    Forbidden,
    /// Malformed or out-of-context request.
    InvalidRequest,
    /// Server-side error.
    InternalError,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_create_session_defaults() {
        let env = ClientEnvelope::from_json(r#"{"id":1,"payload":{"type":"create_session"}}"#)
            .unwrap();
        assert_eq!(env.id, Some(1));
        assert_eq!(env.payload, ClientMessage::CreateSession(CreateSession::default()));
    }

    #[test]
    fn test_create_session_with_fields() {
        let env = ClientEnvelope::from_json(
            r#"{"id":7,"payload":{"type":"create_session","cols":120,"rows":40,"cwd":"/tmp"}}"#,
        )
        .unwrap();
        match env.payload {
            ClientMessage::CreateSession(req) => {
                assert_eq!(req.cols, 120);
                assert_eq!(req.rows, 40);
                assert_eq!(req.cwd.as_deref(), Some("/tmp"));
            }
            other => panic!("unexpected message: {:?}", other),
        }
    }

    #[test]
    fn test_one_way_frames_have_no_id() {
        let env =
            ClientEnvelope::from_json(r#"{"payload":{"type":"terminal_resize","cols":100,"rows":30}}"#)
                .unwrap();
        assert_eq!(env.id, None);
        assert!(!env.payload.expects_reply());
        assert_eq!(
            env.payload,
            ClientMessage::TerminalResize(TerminalResize { cols: 100, rows: 30 })
        );
    }

    #[test]
    fn test_destroy_session_without_id() {
        let env =
            ClientEnvelope::from_json(r#"{"id":3,"payload":{"type":"destroy_session"}}"#).unwrap();
        assert_eq!(
            env.payload,
            ClientMessage::DestroySession(DestroySession { session_id: None })
        );
        assert!(env.payload.expects_reply());
    }

    #[test]
    fn test_unit_requests() {
        let list =
            ClientEnvelope::from_json(r#"{"id":4,"payload":{"type":"list_sessions"}}"#).unwrap();
        assert_eq!(list.payload, ClientMessage::ListSessions);

        let ping = ClientEnvelope::from_json(r#"{"id":5,"payload":{"type":"ping"}}"#).unwrap();
        assert_eq!(ping.payload, ClientMessage::Ping);
    }

    #[test]
    fn test_unknown_type_rejected() {
        let result = ClientEnvelope::from_json(r#"{"id":1,"payload":{"type":"format_disk"}}"#);
        assert!(result.is_err());
    }

    #[test]
    fn test_session_ended_shape() {
        let env = ServerEnvelope::event(ServerMessage::SessionEnded(SessionEnded {
            session_id: "abc".to_string(),
            exit_code: Some(0),
            signal: None,
            reason: EndReason::ProcessExited,
        }));
        let json: serde_json::Value = serde_json::from_str(&env.to_json().unwrap()).unwrap();

        assert!(json.get("id").is_none());
        assert_eq!(json["payload"]["type"], "session_ended");
        assert_eq!(json["payload"]["session_id"], "abc");
        assert_eq!(json["payload"]["exit_code"], 0);
        assert_eq!(json["payload"]["reason"], "process_exited");
    }

    #[test]
    fn test_error_reply_echoes_id() {
        let env = ServerEnvelope::reply(
            Some(9),
            ServerMessage::Error(ErrorMessage {
                code: ErrorCode::SessionLimitExceeded,
                message: "limit of 5 sessions reached".to_string(),
                context: None,
                recoverable: true,
            }),
        );
        let json: serde_json::Value = serde_json::from_str(&env.to_json().unwrap()).unwrap();

        assert_eq!(json["id"], 9);
        assert_eq!(json["payload"]["type"], "error");
        assert_eq!(json["payload"]["code"], "session_limit_exceeded");
        assert_eq!(json["payload"]["recoverable"], true);
    }

    #[test]
    fn test_session_list_parses_back() {
        let descriptor = SessionDescriptor {
            session_id: "s1".to_string(),
            pid: 4242,
            cwd: "/tmp".to_string(),
            cols: 80,
            rows: 24,
            created_at: 1_700_000_000_000,
            last_activity_at: 1_700_000_000_500,
        };
        let env = ServerEnvelope::reply(
            Some(2),
            ServerMessage::SessionList(SessionList {
                sessions: vec![descriptor.clone()],
            }),
        );
        let parsed = ServerEnvelope::from_json(&env.to_json().unwrap()).unwrap();

        match parsed.payload {
            ServerMessage::SessionList(list) => assert_eq!(list.sessions, vec![descriptor]),
            other => panic!("unexpected message: {:?}", other),
        }
    }
}
