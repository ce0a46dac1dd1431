//! Idle session reaper.
//!
//! A periodic sweep that destroys sessions nobody has touched for longer than
//! the configured idle timeout.

use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::session::SessionRegistry;

/// Periodically reclaims idle sessions.
pub struct IdleReaper {
    registry: Arc<SessionRegistry>,
    interval: Duration,
}

impl IdleReaper {
    /// Creates a reaper using the registry's configured sweep interval.
    pub fn new(registry: Arc<SessionRegistry>) -> Self {
        let interval = registry.config().reap_interval();
        Self { registry, interval }
    }

    /// Overrides the sweep interval.
    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }

    /// Runs one sweep and returns the number of sessions destroyed.
    pub async fn sweep(&self) -> usize {
        let reaped = self.registry.reap_idle().await;
        if reaped > 0 {
            info!(reaped, remaining = self.registry.count(), "Idle sweep reclaimed sessions");
        } else {
            debug!("Idle sweep found nothing to reclaim");
        }
        reaped
    }

    /// Starts sweeping in the background until `shutdown` is cancelled.
    ///
    /// The first sweep runs one interval after start.
    pub fn spawn(self, shutdown: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(self.interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            ticker.tick().await;

            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => {
                        debug!("Idle reaper received shutdown signal");
                        break;
                    }
                    _ = ticker.tick() => {
                        self.sweep().await;
                    }
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SessionConfig;
    use crate::session::{CreateOptions, ManualClock};
    use tempfile::TempDir;

    fn registry(dir: &TempDir, clock: Arc<ManualClock>) -> Arc<SessionRegistry> {
        let config = SessionConfig {
            shell: "/bin/sh".to_string(),
            default_cwd: dir.path().to_path_buf(),
            idle_timeout_secs: 60,
            output_counts_as_activity: false,
            kill_grace_ms: 500,
            ..SessionConfig::default()
        };
        Arc::new(SessionRegistry::new(config, clock))
    }

    #[tokio::test]
    async fn test_sweep_reclaims_idle_session() {
        let dir = TempDir::new().unwrap();
        let clock = Arc::new(ManualClock::new(0));
        let registry = registry(&dir, clock.clone());
        let session = registry.create("alice", CreateOptions::default()).await.unwrap();

        let reaper = IdleReaper::new(registry.clone());
        assert_eq!(reaper.sweep().await, 0);

        clock.advance(Duration::from_secs(61));
        assert_eq!(reaper.sweep().await, 1);
        assert!(registry.get("alice", session.id()).is_none());
    }

    #[tokio::test]
    async fn test_background_sweep_runs_on_interval() {
        let dir = TempDir::new().unwrap();
        let clock = Arc::new(ManualClock::new(0));
        let registry = registry(&dir, clock.clone());
        let session = registry.create("alice", CreateOptions::default()).await.unwrap();
        clock.advance(Duration::from_secs(120));

        let shutdown = CancellationToken::new();
        let handle = IdleReaper::new(registry.clone())
            .with_interval(Duration::from_millis(50))
            .spawn(shutdown.clone());

        for _ in 0..50 {
            if registry.get("alice", session.id()).is_none() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        assert!(registry.get("alice", session.id()).is_none());

        shutdown.cancel();
        handle.await.unwrap();
    }

    #[tokio::test]
    async fn test_spawned_reaper_stops_on_cancel() {
        let dir = TempDir::new().unwrap();
        let clock = Arc::new(ManualClock::new(0));
        let shutdown = CancellationToken::new();

        let handle = IdleReaper::new(registry(&dir, clock)).spawn(shutdown.clone());
        shutdown.cancel();

        tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .expect("reaper did not stop")
            .unwrap();
    }
}
