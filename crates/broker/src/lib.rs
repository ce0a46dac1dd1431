//! # PtyBroker Library
//!
//! This crate provides the terminal session broker: it owns pseudo-terminal
//! processes, streams their bytes to browser clients over WebSocket, and keeps
//! each process alive independently of the connection that created it.
//!
//! ## Overview
//!
//! - **PTY Processes**: Spawn shells with an explicit environment and relay
//!   raw bytes in both directions
//! - **Session Registry**: Per-user sessions with enforced caps, attach and
//!   detach, and a single removal path for every way a session can end
//! - **Transport**: WebSocket terminal endpoint plus a small REST API
//! - **Idle Reaper**: Periodic reclamation of abandoned sessions
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                          Broker                             │
//! ├─────────────────────────────────────────────────────────────┤
//! │  ┌──────────────────────┐      ┌──────────────────────────┐ │
//! │  │  WebSocket /terminal │      │  REST /api/terminal-pty  │ │
//! │  └──────────┬───────────┘      └────────────┬─────────────┘ │
//! │             └──────────────┬────────────────┘               │
//! │                  ┌─────────▼──────────┐   ┌──────────────┐  │
//! │                  │  Session Registry  │◄──│  Idle Reaper │  │
//! │                  └─────────┬──────────┘   └──────────────┘  │
//! │                  ┌─────────▼──────────┐                     │
//! │                  │    PTY Process     │                     │
//! │                  └────────────────────┘                     │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use broker::{Broker, Config};
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let mut config = Config::load_default()?;
//!     config.apply_env_overrides();
//!
//!     let broker = Broker::new(config)?;
//!     broker.run().await
//! }
//! ```
//!
//! ## Modules
//!
//! - [`config`]: Configuration loading and defaults
//! - [`session`]: PTY processes and the session registry
//! - [`transport`]: WebSocket and REST endpoints, identity
//! - [`reaper`]: Idle session reclamation
//! - [`server`]: Broker wiring and lifecycle

pub mod config;
pub mod reaper;
pub mod server;
pub mod session;
pub mod transport;

// Re-export protocol for convenience
pub use protocol;

pub use config::Config;
pub use reaper::IdleReaper;
pub use server::Broker;
pub use session::{
    Clock, CreateOptions, ManualClock, RegistryStats, Session, SessionError, SessionId,
    SessionRegistry, SystemClock,
};
pub use transport::{Identity, IdentityProvider, Role, StaticTokenProvider};
