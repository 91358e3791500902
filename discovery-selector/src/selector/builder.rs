//! Builder interface for constructing a [`DiscoveryNodeSelector`].

use std::{collections::HashSet, sync::Arc, time::Duration};

use reqwest::Client;
use url::Url;

use super::{
    cache::SelectorStorage,
    config::{
        HealthCheckThresholds, SelectorConfig, DEFAULT_BACKUPS_TTL, DEFAULT_CACHE_TTL,
        DEFAULT_MAX_CONCURRENT_REQUESTS, DEFAULT_REQUEST_TIMEOUT, DEFAULT_UNHEALTHY_TTL,
    },
    error::SelectorError,
    DiscoveryNodeSelector,
};

/// A builder for a [`DiscoveryNodeSelector`].
#[derive(Debug)]
pub struct DiscoveryNodeSelectorBuilder {
    bootstrap_services: Vec<String>,
    initial_selected_node: Option<String>,
    allowlist: Option<Vec<String>>,
    blocklist: Option<Vec<String>>,
    max_concurrent_requests: usize,
    request_timeout: Duration,
    unhealthy_ttl: Duration,
    backups_ttl: Duration,
    cache_ttl: Option<Duration>,
    health_check_thresholds: HealthCheckThresholds,
    storage: Option<Arc<dyn SelectorStorage>>,
    client: Option<Client>,
}

impl Default for DiscoveryNodeSelectorBuilder {
    fn default() -> Self {
        Self {
            bootstrap_services: vec![],
            initial_selected_node: None,
            allowlist: None,
            blocklist: None,
            max_concurrent_requests: DEFAULT_MAX_CONCURRENT_REQUESTS,
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
            unhealthy_ttl: DEFAULT_UNHEALTHY_TTL,
            backups_ttl: DEFAULT_BACKUPS_TTL,
            cache_ttl: Some(DEFAULT_CACHE_TTL),
            health_check_thresholds: HealthCheckThresholds::default(),
            storage: None,
            client: None,
        }
    }
}

impl DiscoveryNodeSelectorBuilder {
    /// Creates a builder with the default configuration.
    pub fn new() -> Self {
        Self::default()
    }

    /// Seeds the candidate list. At least one endpoint is needed for a
    /// selection to ever succeed, unless an initial node is also given.
    pub fn with_bootstrap_services<S: Into<String>>(
        mut self,
        services: impl IntoIterator<Item = S>,
    ) -> Self {
        self.bootstrap_services = services.into_iter().map(Into::into).collect();
        self
    }

    /// Adopts `endpoint` as already selected, skipping the initial probe.
    /// Ignored when the endpoint fails the allowlist or blocklist.
    pub fn with_initial_selected_node(mut self, endpoint: impl Into<String>) -> Self {
        self.initial_selected_node = Some(endpoint.into());
        self
    }

    /// Restricts eligibility to exactly these endpoints.
    pub fn with_allowlist<S: Into<String>>(
        mut self,
        allowlist: impl IntoIterator<Item = S>,
    ) -> Self {
        self.allowlist = Some(allowlist.into_iter().map(Into::into).collect());
        self
    }

    /// Excludes these endpoints from eligibility.
    pub fn with_blocklist<S: Into<String>>(
        mut self,
        blocklist: impl IntoIterator<Item = S>,
    ) -> Self {
        self.blocklist = Some(blocklist.into_iter().map(Into::into).collect());
        self
    }

    /// Caps how many health probes are raced concurrently in one selection
    /// round. Defaults to 6.
    pub fn with_max_concurrent_requests(mut self, max: usize) -> Self {
        self.max_concurrent_requests = max;
        self
    }

    /// Hard timeout for a single health probe. Defaults to 30 seconds.
    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    /// How long known-unhealthy endpoints stay excluded before the next
    /// selection may probe them again. Defaults to one hour.
    pub fn with_unhealthy_ttl(mut self, ttl: Duration) -> Self {
        self.unhealthy_ttl = ttl;
        self
    }

    /// How long known-behind backups are remembered. Defaults to two minutes.
    pub fn with_backups_ttl(mut self, ttl: Duration) -> Self {
        self.backups_ttl = ttl;
        self
    }

    /// Lifetime of the persisted selection in the injected storage; `None`
    /// never expires it. Defaults to ten minutes.
    pub fn with_cache_ttl(mut self, ttl: Option<Duration>) -> Self {
        self.cache_ttl = ttl;
        self
    }

    /// Freshness thresholds a node must satisfy to be `Healthy`.
    pub fn with_health_check_thresholds(mut self, thresholds: HealthCheckThresholds) -> Self {
        self.health_check_thresholds = thresholds;
        self
    }

    /// Persists the selected endpoint in `storage` so later instances can
    /// short-circuit the initial selection. Without storage nothing is
    /// persisted.
    pub fn with_storage(mut self, storage: Arc<dyn SelectorStorage>) -> Self {
        self.storage = Some(storage);
        self
    }

    /// Uses a preconfigured HTTP client instead of constructing one.
    pub fn with_client(mut self, client: Client) -> Self {
        self.client = Some(client);
        self
    }

    /// Builds the selector. Fails if any configured endpoint is not a valid
    /// URL or the HTTP client cannot be constructed.
    pub fn build(self) -> Result<DiscoveryNodeSelector, SelectorError> {
        let bootstrap_services: Vec<Url> = parse_endpoints(&self.bootstrap_services)?;
        let allowlist: Option<HashSet<Url>> = self
            .allowlist
            .as_deref()
            .map(parse_endpoints)
            .transpose()?;
        let blocklist: Option<HashSet<Url>> = self
            .blocklist
            .as_deref()
            .map(parse_endpoints)
            .transpose()?;
        let initial_selected = self
            .initial_selected_node
            .as_deref()
            .map(Url::parse)
            .transpose()?
            .filter(|endpoint| {
                allowlist
                    .as_ref()
                    .map_or(true, |list| list.contains(endpoint))
                    && !blocklist
                        .as_ref()
                        .is_some_and(|list| list.contains(endpoint))
            });
        let client = match self.client {
            Some(client) => client,
            None => Client::builder().build()?,
        };

        let config = SelectorConfig {
            bootstrap_services,
            allowlist,
            blocklist,
            max_concurrent_requests: self.max_concurrent_requests.max(1),
            request_timeout: self.request_timeout,
            unhealthy_ttl: self.unhealthy_ttl,
            backups_ttl: self.backups_ttl,
            cache_ttl: self.cache_ttl,
            health_check_thresholds: self.health_check_thresholds,
        };
        Ok(DiscoveryNodeSelector::from_parts(
            config,
            initial_selected,
            self.storage,
            client,
        ))
    }
}

fn parse_endpoints<C: FromIterator<Url>>(endpoints: &[String]) -> Result<C, SelectorError> {
    endpoints
        .iter()
        .map(|endpoint| Url::parse(endpoint).map_err(SelectorError::from))
        .collect()
}
