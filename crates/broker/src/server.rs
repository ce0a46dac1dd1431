//! Broker wiring.
//!
//! [`Broker`] owns the session registry and the identity provider, builds the
//! HTTP router, runs the idle reaper and tears everything down on shutdown.

use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{Context, Result};
use axum::Router;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::config::Config;
use crate::reaper::IdleReaper;
use crate::session::{Clock, SessionRegistry, SystemClock};
use crate::transport::{self, AppState, SharedIdentityProvider, StaticTokenProvider};

/// The session broker.
pub struct Broker {
    config: Config,
    registry: Arc<SessionRegistry>,
    identity: SharedIdentityProvider,
    shutdown_token: CancellationToken,
}

impl Broker {
    /// Creates a broker from validated configuration, using the system clock
    /// and the configured token table.
    pub fn new(config: Config) -> Result<Self> {
        config.validate().context("Invalid configuration")?;

        let identity = Arc::new(StaticTokenProvider::from_config(&config.auth));
        if identity.is_empty() {
            warn!("No auth tokens configured; every connection will be refused");
        }

        Ok(Self::with_parts(config, Arc::new(SystemClock), identity))
    }

    /// Creates a broker from explicit parts.
    pub fn with_parts(
        config: Config,
        clock: Arc<dyn Clock>,
        identity: SharedIdentityProvider,
    ) -> Self {
        let registry = Arc::new(SessionRegistry::new(config.session.clone(), clock));
        Self {
            config,
            registry,
            identity,
            shutdown_token: CancellationToken::new(),
        }
    }

    /// Returns the configuration.
    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Returns the session registry.
    pub fn registry(&self) -> &Arc<SessionRegistry> {
        &self.registry
    }

    /// Builds the HTTP router.
    pub fn router(&self) -> Router {
        let state = AppState {
            registry: self.registry.clone(),
            outbound_capacity: self.config.session.output_queue_capacity,
        };
        transport::router(state, self.identity.clone())
    }

    /// Serves on an already bound listener until [`Broker::shutdown`] is
    /// called, then destroys every session.
    pub async fn serve(&self, listener: TcpListener) -> Result<()> {
        let addr = listener
            .local_addr()
            .context("Failed to read listener address")?;
        info!("PtyBroker listening on {}", addr);

        let reaper = IdleReaper::new(self.registry.clone()).spawn(self.shutdown_token.child_token());

        let token = self.shutdown_token.clone();
        let result = axum::serve(listener, self.router())
            .with_graceful_shutdown(async move { token.cancelled().await })
            .await
            .context("HTTP server failed");

        self.shutdown_token.cancel();
        if let Err(e) = reaper.await {
            warn!("Idle reaper task failed: {}", e);
        }

        let destroyed = self.registry.destroy_all().await;
        info!(destroyed, "PtyBroker stopped");

        result
    }

    /// Binds the configured listen address and serves.
    pub async fn run(&self) -> Result<()> {
        let addr: SocketAddr = self
            .config
            .broker
            .listen_addr
            .parse()
            .with_context(|| format!("Invalid listen address: {}", self.config.broker.listen_addr))?;

        let listener = TcpListener::bind(addr)
            .await
            .with_context(|| format!("Failed to bind {}", addr))?;

        self.serve(listener).await
    }

    /// Requests a graceful shutdown.
    pub fn shutdown(&self) {
        info!("Shutdown requested");
        self.shutdown_token.cancel();
    }

    /// Returns the shutdown token for external tasks to observe shutdown.
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown_token.clone()
    }
}
