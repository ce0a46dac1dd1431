//! Per-connection request handling.
//!
//! A [`Connection`] binds one client connection to at most one session at a
//! time. It turns client requests into registry and session calls and queues
//! acknowledgments on the connection's outbound queue. It never owns the
//! session: dropping the connection only unbinds.

use std::path::PathBuf;
use std::sync::{Arc, Weak};

use protocol::messages::{
    CreateSession, DetachReason, SessionAttached, SessionCreated, SessionDestroyed,
    SessionDetached, SessionList,
};
use protocol::{
    ClientEnvelope, ClientMessage, ErrorCode, ErrorMessage, ServerEnvelope, ServerMessage,
};
use thiserror::Error;
use tokio::sync::mpsc;

use super::auth::Identity;
use crate::session::{
    CreateOptions, OutboundFrame, Session, SessionError, SessionId, SessionRegistry,
    TransportBinding, TransportId,
};

/// Errors produced while handling a client request.
#[derive(Debug, Error)]
pub enum AdapterError {
    /// The registry or session rejected the request.
    #[error(transparent)]
    Session(#[from] SessionError),

    /// The request was malformed or made no sense in the current state.
    #[error("invalid request: {0}")]
    InvalidRequest(String),
}

impl AdapterError {
    /// Converts the error into a wire error message.
    pub fn to_error_message(&self) -> ErrorMessage {
        match self {
            AdapterError::Session(e) => e.to_error_message(),
            AdapterError::InvalidRequest(msg) => ErrorMessage {
                code: ErrorCode::InvalidRequest,
                message: msg.clone(),
                context: None,
                recoverable: true,
            },
        }
    }
}

/// The session a connection is bound to.
///
/// Held weakly: once the registry and the output forwarder let go of an ended
/// session, its PTY is released even if the connection stays open.
struct BoundSession {
    session_id: SessionId,
    session: Weak<Session>,
}

impl BoundSession {
    fn new(session: &Arc<Session>) -> Self {
        Self {
            session_id: session.id().clone(),
            session: Arc::downgrade(session),
        }
    }

    fn is_alive(&self) -> bool {
        self.session.strong_count() > 0
    }
}

/// State of one client connection.
pub struct Connection {
    identity: Identity,
    transport_id: TransportId,
    registry: Arc<SessionRegistry>,
    outbound: mpsc::Sender<OutboundFrame>,
    current: Option<BoundSession>,
}

impl Connection {
    /// Creates the state for a freshly accepted connection.
    pub fn new(
        identity: Identity,
        transport_id: TransportId,
        registry: Arc<SessionRegistry>,
        outbound: mpsc::Sender<OutboundFrame>,
    ) -> Self {
        Self {
            identity,
            transport_id,
            registry,
            outbound,
            current: None,
        }
    }

    /// Returns the caller's identity.
    pub fn identity(&self) -> &Identity {
        &self.identity
    }

    /// Returns this connection's transport ID.
    pub fn transport_id(&self) -> TransportId {
        self.transport_id
    }

    /// Returns the ID of the bound session, if it is still alive.
    pub fn current_session(&self) -> Option<&str> {
        self.current
            .as_ref()
            .filter(|bound| bound.is_alive())
            .map(|bound| bound.session_id.as_str())
    }

    fn owner(&self) -> &str {
        &self.identity.user_id
    }

    async fn send(&self, envelope: ServerEnvelope) {
        if self
            .outbound
            .send(OutboundFrame::Message(envelope))
            .await
            .is_err()
        {
            tracing::debug!(transport_id = self.transport_id, "Outbound queue closed");
        }
    }

    /// Handles a JSON text frame.
    pub async fn handle_text(&mut self, text: &str) {
        match ClientEnvelope::from_json(text) {
            Ok(envelope) => self.handle_envelope(envelope).await,
            Err(e) => {
                let error = AdapterError::InvalidRequest(format!("malformed message: {}", e));
                self.send(ServerEnvelope::event(ServerMessage::Error(
                    error.to_error_message(),
                )))
                .await;
            }
        }
    }

    /// Handles a decoded request and sends its acknowledgment or error.
    pub async fn handle_envelope(&mut self, envelope: ClientEnvelope) {
        let id = envelope.id;
        let expects_reply = envelope.payload.expects_reply();

        match self.handle_message(id, envelope.payload).await {
            Ok(Some(reply)) => self.send(ServerEnvelope::reply(id, reply)).await,
            Ok(None) => {}
            Err(e) => {
                tracing::debug!(
                    transport_id = self.transport_id,
                    owner = %self.owner(),
                    error = %e,
                    "Request failed"
                );
                let dead_session =
                    matches!(e, AdapterError::Session(SessionError::WriteToDeadSession(_)));
                if expects_reply || dead_session {
                    self.send(ServerEnvelope::reply(
                        id,
                        ServerMessage::Error(e.to_error_message()),
                    ))
                    .await;
                }
            }
        }
    }

    /// Executes one request. Returns the acknowledgment, if the request has one.
    ///
    /// For create and attach the acknowledgment is queued by the session
    /// itself, ahead of any replayed output.
    pub async fn handle_message(
        &mut self,
        id: Option<u64>,
        message: ClientMessage,
    ) -> Result<Option<ServerMessage>, AdapterError> {
        match message {
            ClientMessage::CreateSession(request) => {
                self.create(id, request).await?;
                Ok(None)
            }
            ClientMessage::AttachSession(request) => {
                self.attach(id, &request.session_id).await?;
                Ok(None)
            }
            ClientMessage::DetachSession => Ok(Some(self.detach().await?)),
            ClientMessage::TerminalInput(input) => {
                self.handle_input(input.data.as_bytes()).await?;
                Ok(None)
            }
            ClientMessage::TerminalResize(resize) => {
                self.resize(resize.cols, resize.rows).await?;
                Ok(None)
            }
            ClientMessage::DestroySession(request) => {
                Ok(Some(self.destroy(request.session_id).await?))
            }
            ClientMessage::ListSessions => Ok(Some(ServerMessage::SessionList(SessionList {
                sessions: self.registry.list(self.owner()),
            }))),
            ClientMessage::Ping => Ok(Some(ServerMessage::Pong)),
        }
    }

    async fn create(&mut self, id: Option<u64>, request: CreateSession) -> Result<(), AdapterError> {
        let session = self
            .registry
            .create(
                self.owner(),
                CreateOptions {
                    cols: request.cols,
                    rows: request.rows,
                    cwd: request.cwd.map(PathBuf::from),
                },
            )
            .await?;

        let ack = ServerMessage::SessionCreated(SessionCreated {
            session: session.descriptor(),
        });
        self.bind_to(session, ServerEnvelope::reply(id, ack)).await
    }

    async fn attach(&mut self, id: Option<u64>, session_id: &str) -> Result<(), AdapterError> {
        let session = self
            .registry
            .get(self.owner(), session_id)
            .ok_or_else(|| SessionError::NotFound(session_id.to_string()))?;

        let ack = ServerMessage::SessionAttached(SessionAttached {
            session: session.descriptor(),
        });
        self.bind_to(session, ServerEnvelope::reply(id, ack)).await
    }

    async fn bind_to(
        &mut self,
        session: Arc<Session>,
        ack: ServerEnvelope,
    ) -> Result<(), AdapterError> {
        let already_bound = self
            .current
            .as_ref()
            .and_then(|bound| bound.session.upgrade())
            .is_some_and(|current| Arc::ptr_eq(&current, &session));
        if already_bound {
            self.send(ack).await;
            return Ok(());
        }

        self.release_current().await;
        session
            .bind(
                TransportBinding::new(self.transport_id, self.outbound.clone()),
                Some(OutboundFrame::Message(ack)),
            )
            .await?;

        tracing::info!(
            session_id = %session.id(),
            owner = %self.owner(),
            transport_id = self.transport_id,
            "Connection bound to session"
        );
        self.current = Some(BoundSession::new(&session));
        Ok(())
    }

    /// Unbinds from the current session without touching the process.
    /// Returns the ID of the session that was bound.
    async fn release_current(&mut self) -> Option<SessionId> {
        let bound = self.current.take()?;
        if let Some(session) = bound.session.upgrade() {
            session.unbind(self.transport_id).await;
        }
        Some(bound.session_id)
    }

    async fn detach(&mut self) -> Result<ServerMessage, AdapterError> {
        let session_id = self
            .release_current()
            .await
            .ok_or_else(|| AdapterError::InvalidRequest("no session is attached".to_string()))?;

        tracing::info!(
            session_id = %session_id,
            transport_id = self.transport_id,
            "Connection detached from session"
        );
        Ok(ServerMessage::SessionDetached(SessionDetached {
            session_id,
            reason: DetachReason::Requested,
        }))
    }

    /// Handles a binary frame: raw terminal input.
    pub async fn handle_binary(&mut self, data: &[u8]) {
        if let Err(e) = self.handle_input(data).await {
            self.send(ServerEnvelope::event(ServerMessage::Error(
                e.to_error_message(),
            )))
            .await;
        }
    }

    /// Writes input to the bound session.
    ///
    /// Input is dropped while nothing is bound. If the bound session has
    /// already ended, the connection is unbound and the error is returned.
    pub async fn handle_input(&mut self, data: &[u8]) -> Result<(), AdapterError> {
        let Some(bound) = &self.current else {
            tracing::trace!(transport_id = self.transport_id, "Dropping input, no session bound");
            return Ok(());
        };
        let Some(session) = bound.session.upgrade() else {
            let session_id = bound.session_id.clone();
            self.current = None;
            return Err(SessionError::WriteToDeadSession(session_id).into());
        };

        if let Err(e) = session.write(data).await {
            if matches!(e, SessionError::WriteToDeadSession(_)) {
                self.release_current().await;
            }
            return Err(e.into());
        }
        Ok(())
    }

    async fn resize(&mut self, cols: u16, rows: u16) -> Result<(), AdapterError> {
        let Some(session) = self.current.as_ref().and_then(|b| b.session.upgrade()) else {
            return Ok(());
        };
        session.resize(cols, rows).await?;
        Ok(())
    }

    async fn destroy(&mut self, session_id: Option<String>) -> Result<ServerMessage, AdapterError> {
        let session_id = match session_id {
            Some(id) => id,
            None => self
                .current_session()
                .map(str::to_string)
                .ok_or_else(|| {
                    AdapterError::InvalidRequest(
                        "no session id given and no session is attached".to_string(),
                    )
                })?,
        };

        if self.current_session() == Some(session_id.as_str()) {
            self.release_current().await;
        }

        if !self.registry.destroy(self.owner(), &session_id).await {
            return Err(SessionError::NotFound(session_id).into());
        }

        Ok(ServerMessage::SessionDestroyed(SessionDestroyed { session_id }))
    }

    /// Called when the connection goes away. The session keeps running.
    pub async fn disconnect(&mut self) {
        if let Some(session_id) = self.release_current().await {
            tracing::info!(
                session_id = %session_id,
                transport_id = self.transport_id,
                "Connection closed, session detached"
            );
        }
    }
}
