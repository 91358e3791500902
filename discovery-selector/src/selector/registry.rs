//! In-memory bookkeeping of candidate endpoints.

use std::{
    collections::{HashMap, HashSet},
    sync::{Arc, Mutex, MutexGuard},
    time::Duration,
};

use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};
use url::Url;

use super::health::BackupHealthData;
use crate::util;

/// Tracks the current working candidate list, known-unhealthy endpoints and
/// known-behind backups. Each selector instance owns exactly one registry;
/// there is no process-wide state.
///
/// The unhealthy and backup sets are cleared in full by debounced TTL timers:
/// re-arming cancels the pending timer, so the clock restarts on every
/// successful selection round.
#[derive(Debug)]
pub(crate) struct CandidateRegistry {
    unhealthy_ttl: Duration,
    backups_ttl: Duration,
    state: Mutex<RegistryState>,
}

#[derive(Debug, Default)]
struct RegistryState {
    working_set: Vec<Url>,
    unhealthy: HashSet<Url>,
    backups: HashMap<Url, BackupHealthData>,
    unhealthy_cleanup: Option<CancellationToken>,
    backups_cleanup: Option<CancellationToken>,
}

impl CandidateRegistry {
    pub fn new(bootstrap: Vec<Url>, unhealthy_ttl: Duration, backups_ttl: Duration) -> Self {
        Self {
            unhealthy_ttl,
            backups_ttl,
            state: Mutex::new(RegistryState {
                working_set: bootstrap,
                ..Default::default()
            }),
        }
    }

    fn state(&self) -> MutexGuard<'_, RegistryState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn working_set(&self) -> Vec<Url> {
        self.state().working_set.clone()
    }

    /// Replaces the working set wholesale with a fresh peer list. Empty
    /// lists are ignored: a node that reports no peers must not wipe the
    /// candidates we already know about.
    pub fn refresh_working_set(&self, peers: Vec<Url>) {
        if peers.is_empty() {
            warn!("could not load new service list from healthy node");
            return;
        }
        debug!("refreshed service list with {} nodes", peers.len());
        self.state().working_set = peers;
    }

    pub fn mark_unhealthy(&self, endpoint: Url) {
        self.state().unhealthy.insert(endpoint);
    }

    pub fn mark_backup(&self, endpoint: Url, data: BackupHealthData) {
        self.state().backups.insert(endpoint, data);
    }

    pub fn unhealthy_snapshot(&self) -> HashSet<Url> {
        self.state().unhealthy.clone()
    }

    pub fn backups(&self) -> Vec<(Url, BackupHealthData)> {
        self.state()
            .backups
            .iter()
            .map(|(endpoint, data)| (endpoint.clone(), data.clone()))
            .collect()
    }

    pub fn has_backups(&self) -> bool {
        !self.state().backups.is_empty()
    }

    /// Forgets everything we learned so a future selection can re-probe all
    /// candidates. Used after total selection failure.
    pub fn reset(&self) {
        let mut state = self.state();
        state.unhealthy.clear();
        state.backups.clear();
    }

    /// Arms (or re-arms) the TTL timers that clear the unhealthy and backup
    /// sets, cancelling any pending timers first.
    pub fn schedule_cleanup(self: &Arc<Self>) {
        let unhealthy_token = CancellationToken::new();
        let backups_token = CancellationToken::new();
        {
            let mut state = self.state();
            if let Some(token) = state.unhealthy_cleanup.take() {
                token.cancel();
            }
            if let Some(token) = state.backups_cleanup.take() {
                token.cancel();
            }
            state.unhealthy_cleanup = Some(unhealthy_token.clone());
            state.backups_cleanup = Some(backups_token.clone());
        }

        let registry = Arc::downgrade(self);
        let ttl = self.unhealthy_ttl;
        util::spawn(async move {
            tokio::select! {
                _ = unhealthy_token.cancelled() => {}
                _ = tokio::time::sleep(ttl) => {
                    if let Some(registry) = registry.upgrade() {
                        debug!("unhealthy ttl elapsed, clearing known-unhealthy endpoints");
                        registry.state().unhealthy.clear();
                    }
                }
            }
        });

        let registry = Arc::downgrade(self);
        let ttl = self.backups_ttl;
        util::spawn(async move {
            tokio::select! {
                _ = backups_token.cancelled() => {}
                _ = tokio::time::sleep(ttl) => {
                    if let Some(registry) = registry.upgrade() {
                        debug!("backups ttl elapsed, clearing known-behind backups");
                        registry.state().backups.clear();
                    }
                }
            }
        });
    }
}
