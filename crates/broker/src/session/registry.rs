//! Session registry.
//!
//! The registry is the single source of truth for which sessions exist and
//! who owns them. Sessions are grouped by owner in a [`DashMap`], so per-owner
//! capacity checks take only that owner's shard lock.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use dashmap::DashMap;
use futures_util::future::join_all;
use protocol::{EndReason, SessionDescriptor, DEFAULT_COLS, DEFAULT_ROWS};
use serde::Serialize;
use uuid::Uuid;

use super::clock::Clock;
use super::error::SessionError;
use super::output::forward_output;
use super::pty::{PtyProcess, PtySpawnOptions};
use super::record::{Session, SessionParts};
use super::{OwnerId, SessionId};
use crate::config::SessionConfig;

/// Options for creating a session.
#[derive(Debug, Clone, Default)]
pub struct CreateOptions {
    /// Terminal width; 0 selects the default.
    pub cols: u16,
    /// Terminal height; 0 selects the default.
    pub rows: u16,
    /// Working directory; the configured default when `None`.
    pub cwd: Option<PathBuf>,
}

/// Per-user session count.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct UserStats {
    pub user_id: OwnerId,
    pub session_count: usize,
}

/// Aggregate registry statistics.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RegistryStats {
    pub total_users: usize,
    pub total_sessions: usize,
    pub max_sessions_per_user: usize,
    pub idle_timeout_secs: u64,
    pub user_stats: Vec<UserStats>,
}

#[derive(Default)]
struct OwnerSlot {
    sessions: HashMap<SessionId, Arc<Session>>,
    /// Creations that passed the capacity check but have not spawned yet.
    reserved: usize,
}

impl OwnerSlot {
    fn occupancy(&self) -> usize {
        self.sessions.len() + self.reserved
    }

    fn is_vacant(&self) -> bool {
        self.sessions.is_empty() && self.reserved == 0
    }
}

/// A claimed slot for one session that is being spawned.
///
/// Dropping the reservation without committing gives the slot back.
struct Reservation<'a> {
    registry: &'a SessionRegistry,
    owner: OwnerId,
    committed: bool,
}

impl Reservation<'_> {
    fn commit(mut self, session: Arc<Session>) {
        let mut slot = self.registry.owners.entry(self.owner.clone()).or_default();
        slot.reserved = slot.reserved.saturating_sub(1);
        slot.sessions.insert(session.id().clone(), session);
        self.committed = true;
    }
}

impl Drop for Reservation<'_> {
    fn drop(&mut self) {
        if self.committed {
            return;
        }

        if let Some(mut slot) = self.registry.owners.get_mut(&self.owner) {
            slot.reserved = slot.reserved.saturating_sub(1);
        }
        self.registry.live.fetch_sub(1, Ordering::AcqRel);
        self.registry.prune_owner(&self.owner);
    }
}

/// In-memory store of all live sessions.
pub struct SessionRegistry {
    owners: DashMap<OwnerId, OwnerSlot>,
    /// Live plus reserved sessions across all owners.
    live: AtomicUsize,
    config: SessionConfig,
    clock: Arc<dyn Clock>,
}

impl SessionRegistry {
    /// Creates an empty registry.
    pub fn new(config: SessionConfig, clock: Arc<dyn Clock>) -> Self {
        Self {
            owners: DashMap::new(),
            live: AtomicUsize::new(0),
            config,
            clock,
        }
    }

    /// Returns the session configuration.
    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    /// Returns the registry's clock.
    pub fn clock(&self) -> &Arc<dyn Clock> {
        &self.clock
    }

    fn reserve(&self, owner: &str) -> Result<Reservation<'_>, SessionError> {
        let max_total = self.config.max_total_sessions;
        if self
            .live
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| {
                (max_total == 0 || n < max_total).then_some(n + 1)
            })
            .is_err()
        {
            return Err(SessionError::CapacityExhausted(max_total));
        }

        let max = self.config.max_sessions_per_user;
        let admitted = {
            let mut slot = self.owners.entry(owner.to_string()).or_default();
            if slot.occupancy() >= max {
                false
            } else {
                slot.reserved += 1;
                true
            }
        };

        if !admitted {
            self.live.fetch_sub(1, Ordering::AcqRel);
            self.prune_owner(owner);
            return Err(SessionError::LimitExceeded {
                owner: owner.to_string(),
                max,
            });
        }

        Ok(Reservation {
            registry: self,
            owner: owner.to_string(),
            committed: false,
        })
    }

    fn prune_owner(&self, owner: &str) {
        self.owners.remove_if(owner, |_, slot| slot.is_vacant());
    }

    /// Spawns a new session for `owner`.
    ///
    /// The owner's cap is checked and a slot reserved before anything is
    /// spawned. A missing working directory is created. On spawn failure the
    /// registry is left as it was.
    pub async fn create(
        self: &Arc<Self>,
        owner: &str,
        options: CreateOptions,
    ) -> Result<Arc<Session>, SessionError> {
        let reservation = self.reserve(owner)?;

        let cwd = options
            .cwd
            .unwrap_or_else(|| self.config.default_cwd.clone());
        prepare_cwd(&cwd).await?;

        let cols = if options.cols == 0 { DEFAULT_COLS } else { options.cols };
        let rows = if options.rows == 0 { DEFAULT_ROWS } else { options.rows };
        let id = Uuid::new_v4().to_string();

        let (process, events) = PtyProcess::spawn(PtySpawnOptions {
            session_id: id.clone(),
            shell: self.config.shell.clone(),
            args: self.config.shell_args.clone(),
            env: self.spawn_env(),
            cwd: cwd.clone(),
            cols,
            rows,
            output_capacity: self.config.output_queue_capacity,
        })
        .inspect_err(|e| {
            tracing::error!(owner = %owner, shell = %self.config.shell, error = %e, "Failed to spawn session");
        })?;

        let session = Arc::new(Session::new(SessionParts {
            id: id.clone(),
            owner: owner.to_string(),
            process,
            cwd,
            cols,
            rows,
            clock: self.clock.clone(),
            replay_capacity: self.config.replay_buffer_bytes,
            output_counts_as_activity: self.config.output_counts_as_activity,
        }));

        reservation.commit(session.clone());
        tokio::spawn(forward_output(
            session.clone(),
            events,
            Arc::downgrade(self),
        ));

        tracing::info!(
            session_id = %id,
            owner = %owner,
            pid = session.pid(),
            cols,
            rows,
            "Created session"
        );

        Ok(session)
    }

    /// Builds the child environment from scratch.
    fn spawn_env(&self) -> Vec<(String, String)> {
        let env = &self.config.environment;
        let mut vars = vec![
            ("TERM".to_string(), env.term.clone()),
            ("COLORTERM".to_string(), "truecolor".to_string()),
            ("HOME".to_string(), env.home.display().to_string()),
            ("USER".to_string(), env.user.clone()),
            ("SHELL".to_string(), self.config.shell.clone()),
            ("PATH".to_string(), env.path.clone()),
            ("LANG".to_string(), env.lang.clone()),
            ("LC_ALL".to_string(), env.lang.clone()),
        ];
        vars.extend(env.extra.iter().map(|(k, v)| (k.clone(), v.clone())));
        vars
    }

    /// Looks up one of `owner`'s sessions.
    pub fn get(&self, owner: &str, session_id: &str) -> Option<Arc<Session>> {
        self.owners
            .get(owner)
            .and_then(|slot| slot.sessions.get(session_id).cloned())
    }

    /// Lists `owner`'s sessions, oldest first.
    pub fn list(&self, owner: &str) -> Vec<SessionDescriptor> {
        let sessions: Vec<Arc<Session>> = self
            .owners
            .get(owner)
            .map(|slot| slot.sessions.values().cloned().collect())
            .unwrap_or_default();

        let mut descriptors: Vec<SessionDescriptor> =
            sessions.iter().map(|s| s.descriptor()).collect();
        descriptors.sort_by(|a, b| {
            a.created_at
                .cmp(&b.created_at)
                .then_with(|| a.session_id.cmp(&b.session_id))
        });
        descriptors
    }

    /// Number of live sessions across all owners.
    pub fn count(&self) -> usize {
        self.owners.iter().map(|slot| slot.sessions.len()).sum()
    }

    /// Number of live sessions held by `owner`.
    pub fn count_for(&self, owner: &str) -> usize {
        self.owners
            .get(owner)
            .map(|slot| slot.sessions.len())
            .unwrap_or(0)
    }

    /// Removes a session from the map. Exactly one caller wins.
    fn take(&self, owner: &str, session_id: &str) -> Option<Arc<Session>> {
        let taken = self
            .owners
            .get_mut(owner)
            .and_then(|mut slot| slot.sessions.remove(session_id));

        if taken.is_some() {
            self.live.fetch_sub(1, Ordering::AcqRel);
            self.prune_owner(owner);
        }
        taken
    }

    /// Destroys one of `owner`'s sessions.
    ///
    /// Returns `false` if the session does not exist, was already destroyed,
    /// or belongs to someone else.
    pub async fn destroy(&self, owner: &str, session_id: &str) -> bool {
        self.destroy_with(owner, session_id, EndReason::Destroyed)
            .await
    }

    pub(crate) async fn destroy_with(
        &self,
        owner: &str,
        session_id: &str,
        reason: EndReason,
    ) -> bool {
        let Some(session) = self.take(owner, session_id) else {
            return false;
        };

        session.mark_ended(reason);
        tracing::info!(session_id = %session_id, owner = %owner, reason = ?reason, "Destroying session");

        if let Err(e) = session.process().terminate(self.config.kill_grace()).await {
            tracing::error!(session_id = %session_id, error = %e, "Failed to kill session process");
        }
        true
    }

    /// Drops a session whose process exited on its own.
    pub(crate) fn remove_ended(&self, session: &Arc<Session>) {
        let removed = self
            .owners
            .get_mut(session.owner())
            .map(|mut slot| {
                let same = slot
                    .sessions
                    .get(session.id())
                    .is_some_and(|current| Arc::ptr_eq(current, session));
                same && slot.sessions.remove(session.id()).is_some()
            })
            .unwrap_or(false);

        if removed {
            self.live.fetch_sub(1, Ordering::AcqRel);
            self.prune_owner(session.owner());
            tracing::debug!(session_id = %session.id(), "Removed exited session");
        }
    }

    async fn destroy_many(&self, targets: Vec<(OwnerId, SessionId)>, reason: EndReason) -> usize {
        let results = join_all(
            targets
                .iter()
                .map(|(owner, id)| self.destroy_with(owner, id, reason)),
        )
        .await;
        results.into_iter().filter(|destroyed| *destroyed).count()
    }

    /// Destroys every session held by `owner`.
    pub async fn destroy_all_for_owner(&self, owner: &str) -> usize {
        let targets: Vec<(OwnerId, SessionId)> = self
            .owners
            .get(owner)
            .map(|slot| {
                slot.sessions
                    .keys()
                    .map(|id| (owner.to_string(), id.clone()))
                    .collect()
            })
            .unwrap_or_default();

        self.destroy_many(targets, EndReason::Destroyed).await
    }

    /// Destroys every session. Used at shutdown.
    pub async fn destroy_all(&self) -> usize {
        let targets = self.snapshot_ids(|_| true);
        let count = self.destroy_many(targets, EndReason::Shutdown).await;
        if count > 0 {
            tracing::info!(count, "Destroyed all sessions");
        }
        count
    }

    /// Destroys every session idle for longer than the configured timeout.
    pub async fn reap_idle(&self) -> usize {
        let now = self.clock.now_millis();
        let timeout = self.config.idle_timeout();
        let targets = self.snapshot_ids(|session| session.idle_for(now) > timeout);

        for (owner, id) in &targets {
            tracing::info!(session_id = %id, owner = %owner, "Reaping idle session");
        }
        self.destroy_many(targets, EndReason::IdleTimeout).await
    }

    fn snapshot_ids<F>(&self, filter: F) -> Vec<(OwnerId, SessionId)>
    where
        F: Fn(&Session) -> bool,
    {
        self.owners
            .iter()
            .flat_map(|slot| {
                slot.sessions
                    .values()
                    .filter(|s| filter(s))
                    .map(|s| (s.owner().clone(), s.id().clone()))
                    .collect::<Vec<_>>()
            })
            .collect()
    }

    /// Returns aggregate statistics.
    pub fn stats(&self) -> RegistryStats {
        let mut user_stats: Vec<UserStats> = self
            .owners
            .iter()
            .filter(|slot| !slot.sessions.is_empty())
            .map(|slot| UserStats {
                user_id: slot.key().clone(),
                session_count: slot.sessions.len(),
            })
            .collect();
        user_stats.sort_by(|a, b| a.user_id.cmp(&b.user_id));

        RegistryStats {
            total_users: user_stats.len(),
            total_sessions: user_stats.iter().map(|u| u.session_count).sum(),
            max_sessions_per_user: self.config.max_sessions_per_user,
            idle_timeout_secs: self.config.idle_timeout_secs,
            user_stats,
        }
    }
}

async fn prepare_cwd(cwd: &Path) -> Result<(), SessionError> {
    tokio::fs::create_dir_all(cwd).await.map_err(|e| {
        SessionError::SpawnFailed(format!(
            "cannot create working directory {}: {}",
            cwd.display(),
            e
        ))
    })?;

    let metadata = tokio::fs::metadata(cwd).await?;
    if !metadata.is_dir() {
        return Err(SessionError::SpawnFailed(format!(
            "working directory {} is not a directory",
            cwd.display()
        )));
    }
    Ok(())
}
