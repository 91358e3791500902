//! Health-aware selection of a discovery node endpoint.
//!
//! The selector holds a working set of candidate endpoints, races concurrent
//! health probes against a sampled round of them, and keeps serving the winner
//! until evidence arrives that it degraded. Candidates that fail a freshness
//! threshold are remembered as backups; candidates that fail outright are
//! remembered as unhealthy, both with a bounded TTL so that transient outages
//! do not exclude a node forever.

pub mod builder;
pub mod cache;
pub mod config;
mod decision;
pub mod error;
mod events;
pub mod health;
pub mod middleware;
mod registry;

#[cfg(test)]
mod selector_test;

use std::{
    sync::{Arc, Mutex, MutexGuard, RwLock, RwLockReadGuard},
    time::Duration,
};

use async_channel::Receiver;
use futures_util::{stream::FuturesUnordered, StreamExt};
use rand::seq::SliceRandom;
use reqwest::Client;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use url::Url;

use self::{
    cache::{SelectionCache, SelectorStorage},
    config::{ConfigUpdate, HealthCheckThresholds, SelectorConfig},
    decision::{DecisionStage, DecisionTree},
    events::EventEmitter,
    health::{check_health, BackupHealthData, HealthCheckOutcome, HealthStatus},
    middleware::SelectorMiddleware,
    registry::CandidateRegistry,
};

#[derive(Debug, Default)]
struct SelectionState {
    selected: Option<Url>,
    is_behind: bool,
}

/// Picks and monitors a healthy discovery node endpoint on behalf of a client.
///
/// Construct one via [`DiscoveryNodeSelector::builder`]. All methods take
/// `&self`; wrap the selector in an [`Arc`] to share it across tasks.
///
/// ```rust,no_run
/// # async fn run() -> Result<(), discovery_selector::SelectorError> {
/// use discovery_selector::DiscoveryNodeSelector;
///
/// let selector = DiscoveryNodeSelector::builder()
///     .with_bootstrap_services(["https://discoverynode.example.com"])
///     .build()?;
/// let endpoint = selector.get_selected_endpoint().await;
/// # Ok(())
/// # }
/// ```
#[derive(Debug)]
pub struct DiscoveryNodeSelector {
    config: RwLock<SelectorConfig>,
    client: Client,
    registry: Arc<CandidateRegistry>,
    cache: SelectionCache,
    emitter: EventEmitter,
    state: Mutex<SelectionState>,
    /// Single-flight guard: concurrent callers wait for the in-progress
    /// selection instead of starting their own.
    selection_lock: async_lock::Mutex<()>,
}

impl DiscoveryNodeSelector {
    /// Returns a builder for configuring a selector.
    pub fn builder() -> builder::DiscoveryNodeSelectorBuilder {
        builder::DiscoveryNodeSelectorBuilder::new()
    }

    pub(crate) fn from_parts(
        config: SelectorConfig,
        initial_selected: Option<Url>,
        storage: Option<Arc<dyn SelectorStorage>>,
        client: Client,
    ) -> Self {
        let registry = Arc::new(CandidateRegistry::new(
            config.bootstrap_services.clone(),
            config.unhealthy_ttl,
            config.backups_ttl,
        ));
        let cache = SelectionCache::new(storage, config.cache_ttl);
        Self {
            config: RwLock::new(config),
            client,
            registry,
            cache,
            emitter: EventEmitter::new(),
            state: Mutex::new(SelectionState {
                selected: initial_selected,
                is_behind: false,
            }),
            selection_lock: async_lock::Mutex::new(()),
        }
    }

    /// Returns the active endpoint, running a full selection first if none is
    /// active yet. `None` means every candidate was exhausted; a later call
    /// starts over from a clean slate.
    pub async fn get_selected_endpoint(&self) -> Option<Url> {
        if let Some(selected) = self.current_selection() {
            return Some(selected);
        }
        self.select(None).await
    }

    /// Whether the active endpoint was chosen from the backup tier and is
    /// known to be lagging.
    pub fn is_behind(&self) -> bool {
        self.state().is_behind
    }

    /// Registers a listener for selection changes. Every newly selected
    /// healthy endpoint is delivered to all live subscribers, in order.
    pub fn subscribe(&self) -> Receiver<Url> {
        self.emitter.subscribe()
    }

    /// Returns a request middleware bound to this selector.
    pub fn create_middleware(self: &Arc<Self>) -> SelectorMiddleware {
        SelectorMiddleware::new(Arc::clone(self))
    }

    /// Refreshes the working set from the active endpoint's reported peer
    /// list and returns it. Selects first if nothing is selected yet.
    pub async fn get_services(&self) -> Vec<Url> {
        if let Some(selected) = self.get_selected_endpoint().await {
            let outcome = self.probe(&selected).await;
            if let Some(peers) = outcome.peers {
                self.registry.refresh_working_set(peers);
            }
        }
        self.registry.working_set()
    }

    /// Applies a partial configuration update. Changing the health thresholds
    /// always invalidates the active selection; changing the allowlist or
    /// blocklist invalidates it only when the active endpoint is no longer
    /// eligible. The next [`get_selected_endpoint`](Self::get_selected_endpoint)
    /// call reselects.
    pub fn update_config(&self, update: ConfigUpdate) {
        let thresholds_changed = update.health_check_thresholds.is_some();
        let (allowlist, blocklist) = {
            let mut config = self
                .config
                .write()
                .unwrap_or_else(|poisoned| poisoned.into_inner());
            if let Some(thresholds) = update.health_check_thresholds {
                config.health_check_thresholds = thresholds;
            }
            if let Some(allowlist) = update.allowlist {
                config.allowlist = Some(allowlist);
            }
            if let Some(blocklist) = update.blocklist {
                config.blocklist = Some(blocklist);
            }
            (config.allowlist.clone(), config.blocklist.clone())
        };

        let mut state = self.state();
        let Some(selected) = state.selected.clone() else {
            return;
        };
        let excluded = allowlist.as_ref().is_some_and(|list| !list.contains(&selected))
            || blocklist.as_ref().is_some_and(|list| list.contains(&selected));
        if thresholds_changed || excluded {
            debug!(endpoint = %selected, "configuration update invalidated the active selection");
            state.selected = None;
        }
    }

    /// Runs a selection, returning the chosen endpoint.
    ///
    /// Only one selection runs at a time: latecomers block on the in-progress
    /// one and adopt its result, unless that result is the very endpoint they
    /// are trying to move away from.
    pub(crate) async fn select(&self, prev_selected: Option<Url>) -> Option<Url> {
        let _in_flight = self.selection_lock.lock().await;
        if let Some(current) = self.current_selection() {
            if prev_selected.as_ref() != Some(&current) {
                return Some(current);
            }
        }
        self.do_select().await
    }

    async fn do_select(&self) -> Option<Url> {
        let mut tree = DecisionTree::new();
        let (allowlist, blocklist) = {
            let config = self.config();
            (config.allowlist.clone(), config.blocklist.clone())
        };

        if let Some(cached) = self.cache.get(allowlist.as_ref()).await {
            tree.push_val(DecisionStage::CheckShortCircuit, cached.as_str());
            if !blocklist.as_ref().is_some_and(|list| list.contains(&cached)) {
                self.set_selected(cached.clone());
                info!(endpoint = %cached, decision_tree = %tree, "reusing recently selected discovery node");
                return Some(cached);
            }
        }

        let mut services = self.registry.working_set();
        tree.push_urls(DecisionStage::GetAllServices, &services);
        if let Some(allowlist) = &allowlist {
            services.retain(|service| allowlist.contains(service));
            tree.push_urls(DecisionStage::FilterToAllowlist, &services);
        }
        if let Some(blocklist) = &blocklist {
            services.retain(|service| !blocklist.contains(service));
            tree.push_urls(DecisionStage::FilterFromBlocklist, &services);
        }

        let max_round = self.config().max_concurrent_requests;
        let mut attempted = 0_usize;
        loop {
            let unhealthy = self.registry.unhealthy_snapshot();
            let eligible: Vec<Url> = services
                .iter()
                .filter(|service| !unhealthy.contains(*service))
                .cloned()
                .collect();
            tree.push_urls(DecisionStage::FilterOutKnownUnhealthy, &eligible);

            if eligible.is_empty() {
                tree.push(DecisionStage::NoServicesLeftToTry);
                if let Some(backup) = self.select_from_backups() {
                    tree.push_val(DecisionStage::SelectedFromBackup, backup.as_str());
                    self.set_selected(backup.clone());
                    self.set_is_behind(true);
                    info!(endpoint = %backup, decision_tree = %tree, "selected a behind discovery node as backup");
                    return Some(backup);
                }
                self.registry.reset();
                tree.push(DecisionStage::FailedAndResetting);
                error!(attempted, decision_tree = %tree, "no healthy or backup discovery nodes available");
                return None;
            }

            let round: Vec<Url> = {
                let mut rng = rand::thread_rng();
                eligible
                    .choose_multiple(&mut rng, max_round)
                    .cloned()
                    .collect()
            };
            tree.push_urls(DecisionStage::GetSelectionRound, &round);
            attempted += round.len();

            if let Some(winner) = self.any_healthy_endpoint(round).await {
                tree.push_val(DecisionStage::MadeASelection, winner.as_str());
                self.registry.schedule_cleanup();
                self.set_selected(winner.clone());
                self.set_is_behind(false);
                self.cache.set(&winner).await;
                self.emitter.emit(&winner);
                info!(endpoint = %winner, attempted, decision_tree = %tree, "selected discovery node");
                return Some(winner);
            }
            tree.push(DecisionStage::RoundFailedRetry);
            debug!(attempted, "no healthy node in this round, retrying");
        }
    }

    /// Races health probes against a round of candidates and returns the
    /// first healthy one. The remaining probes are cancelled as soon as a
    /// winner emerges; losers are recorded as unhealthy or backups.
    async fn any_healthy_endpoint(&self, round: Vec<Url>) -> Option<Url> {
        let (thresholds, timeout) = self.probe_settings();
        let cancel = CancellationToken::new();
        let mut probes: FuturesUnordered<_> = round
            .into_iter()
            .map(|endpoint| {
                let cancel = cancel.clone();
                let client = self.client.clone();
                let thresholds = thresholds.clone();
                async move {
                    tokio::select! {
                        _ = cancel.cancelled() => (endpoint, None),
                        outcome = check_health(&client, &endpoint, &thresholds, timeout) => {
                            (endpoint, Some(outcome))
                        }
                    }
                }
            })
            .collect();

        while let Some((endpoint, outcome)) = probes.next().await {
            let Some(outcome) = outcome else {
                continue;
            };
            match outcome.status {
                HealthStatus::Healthy => {
                    debug!(%endpoint, "health check passed");
                    cancel.cancel();
                    if let Some(peers) = outcome.peers {
                        self.registry.refresh_working_set(peers);
                    }
                    return Some(endpoint);
                }
                HealthStatus::Behind(reason) => {
                    debug!(%endpoint, %reason, "node is behind, keeping as backup");
                    self.registry.mark_unhealthy(endpoint.clone());
                    if let Some(data) = outcome.data {
                        self.registry.mark_backup(endpoint, data);
                    }
                }
                HealthStatus::Unhealthy(reason) => {
                    debug!(%endpoint, %reason, "node is unhealthy");
                    self.registry.mark_unhealthy(endpoint);
                }
            }
        }
        None
    }

    /// Picks the best known-behind node: highest version first, then the
    /// smallest block lag. A backup within the configured block diff wins
    /// over the overall best-sorted one.
    fn select_from_backups(&self) -> Option<Url> {
        let mut backups = self.registry.backups();
        backups.sort_by(|(_, a), (_, b)| {
            b.version
                .cmp(&a.version)
                .then(a.block_difference.cmp(&b.block_difference))
        });
        let max_block_diff = self.config().health_check_thresholds.max_block_diff;
        backups
            .iter()
            .find(|(_, data)| data.block_difference <= max_block_diff)
            .or_else(|| backups.first())
            .map(|(endpoint, _)| endpoint.clone())
    }

    /// Reacts to fresh health evidence about `endpoint` (normally the active
    /// one), reselecting when it shows degradation. Returns the endpoint to
    /// use from here on.
    pub(crate) async fn reselect_if_necessary(
        &self,
        endpoint: &Url,
        status: HealthStatus,
        data: Option<BackupHealthData>,
    ) -> Option<Url> {
        match status {
            HealthStatus::Healthy => {
                self.set_is_behind(false);
                Some(endpoint.clone())
            }
            // Already knowingly on a behind node; another Behind observation
            // adds nothing and must not trigger a reselection storm.
            HealthStatus::Behind(_) if self.is_behind() => Some(endpoint.clone()),
            status => {
                warn!(%endpoint, ?status, "active discovery node degraded, reselecting");
                self.registry.mark_unhealthy(endpoint.clone());
                if let (HealthStatus::Behind(_), Some(data)) = (&status, data) {
                    self.registry.mark_backup(endpoint.clone(), data);
                }
                self.cache.clear().await;
                self.select(Some(endpoint.clone())).await
            }
        }
    }

    pub(crate) async fn probe(&self, endpoint: &Url) -> HealthCheckOutcome {
        let (thresholds, timeout) = self.probe_settings();
        check_health(&self.client, endpoint, &thresholds, timeout).await
    }

    pub(crate) fn thresholds(&self) -> HealthCheckThresholds {
        self.config().health_check_thresholds.clone()
    }

    fn probe_settings(&self) -> (HealthCheckThresholds, Duration) {
        let config = self.config();
        (
            config.health_check_thresholds.clone(),
            config.request_timeout,
        )
    }

    fn config(&self) -> RwLockReadGuard<'_, SelectorConfig> {
        self.config
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn state(&self) -> MutexGuard<'_, SelectionState> {
        self.state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn current_selection(&self) -> Option<Url> {
        self.state().selected.clone()
    }

    fn set_selected(&self, endpoint: Url) {
        self.state().selected = Some(endpoint);
    }

    fn set_is_behind(&self, is_behind: bool) {
        let mut state = self.state();
        if is_behind && !state.is_behind {
            warn!(endpoint = ?state.selected, "using a behind discovery node, data may be stale");
        } else if !is_behind && state.is_behind {
            info!(endpoint = ?state.selected, "discovery node is no longer behind");
        }
        state.is_behind = is_behind;
    }
}
