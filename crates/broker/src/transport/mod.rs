//! Client-facing transport.
//!
//! - [`ws`]: the `/terminal` WebSocket endpoint
//! - [`http`]: the `/api/terminal-pty` REST routes
//! - [`adapter`]: request handling for one connection
//! - [`auth`]: identity resolution

pub mod adapter;
pub mod auth;
pub mod http;
pub mod ws;

use std::sync::Arc;

use axum::{routing::get, Extension, Router};
use tower_http::trace::TraceLayer;

use crate::session::SessionRegistry;

pub use adapter::{AdapterError, Connection};
pub use auth::{
    AuthError, Identity, IdentityProvider, RequireIdentity, Role, SharedIdentityProvider,
    StaticTokenProvider,
};

/// Default capacity of a connection's outbound queue.
pub const DEFAULT_OUTBOUND_CAPACITY: usize = 256;

/// State shared by all handlers.
#[derive(Clone)]
pub struct AppState {
    pub registry: Arc<SessionRegistry>,
    pub outbound_capacity: usize,
}

impl AppState {
    /// Creates handler state over `registry`.
    pub fn new(registry: Arc<SessionRegistry>) -> Self {
        Self {
            registry,
            outbound_capacity: DEFAULT_OUTBOUND_CAPACITY,
        }
    }
}

/// Builds the full HTTP router.
pub fn router(state: AppState, identity: SharedIdentityProvider) -> Router {
    Router::new()
        .route("/terminal", get(ws::terminal_handler))
        .nest("/api/terminal-pty", http::routes())
        .layer(Extension(identity))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}
