//! Selector configuration: thresholds, TTLs, and runtime updates.

use std::{collections::HashSet, time::Duration};

use semver::Version;
use url::Url;

/// See [`with_max_concurrent_requests`](super::builder::DiscoveryNodeSelectorBuilder::with_max_concurrent_requests).
pub(crate) const DEFAULT_MAX_CONCURRENT_REQUESTS: usize = 6;
/// See [`with_request_timeout`](super::builder::DiscoveryNodeSelectorBuilder::with_request_timeout).
pub(crate) const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(30);
/// See [`with_unhealthy_ttl`](super::builder::DiscoveryNodeSelectorBuilder::with_unhealthy_ttl).
pub(crate) const DEFAULT_UNHEALTHY_TTL: Duration = Duration::from_secs(3600);
/// See [`with_backups_ttl`](super::builder::DiscoveryNodeSelectorBuilder::with_backups_ttl).
pub(crate) const DEFAULT_BACKUPS_TTL: Duration = Duration::from_secs(120);
/// See [`with_cache_ttl`](super::builder::DiscoveryNodeSelectorBuilder::with_cache_ttl).
pub(crate) const DEFAULT_CACHE_TTL: Duration = Duration::from_secs(600);
/// Default for [`HealthCheckThresholds::max_block_diff`].
pub const DEFAULT_MAX_BLOCK_DIFF: i64 = 15;

/// Freshness thresholds a node must satisfy to be classified `Healthy`.
///
/// Immutable for the life of a selection round; replacing them via
/// [`update_config`](super::DiscoveryNodeSelector::update_config) forces a
/// reselection.
#[derive(Debug, Clone, PartialEq)]
pub struct HealthCheckThresholds {
    /// Minimum acceptable node version. Nodes below the floor are `Behind`,
    /// nodes that report no parseable version at all are `Unhealthy`.
    /// `None` disables version checking.
    pub min_version: Option<Version>,
    /// Maximum acceptable lag between the chain block counter and the node's
    /// indexed block counter.
    pub max_block_diff: i64,
    /// Maximum acceptable lag on the secondary plays slot counters.
    /// `None` disables the check.
    pub max_slot_diff_plays: Option<i64>,
}

impl Default for HealthCheckThresholds {
    fn default() -> Self {
        Self {
            min_version: None,
            max_block_diff: DEFAULT_MAX_BLOCK_DIFF,
            max_slot_diff_plays: None,
        }
    }
}

/// Resolved selector configuration. Built by
/// [`DiscoveryNodeSelectorBuilder`](super::builder::DiscoveryNodeSelectorBuilder).
#[derive(Debug, Clone)]
pub(crate) struct SelectorConfig {
    /// Seed candidate list; replaced wholesale when a healthy node reports a
    /// fresh peer list.
    pub bootstrap_services: Vec<Url>,
    /// If set, only these endpoints are ever eligible.
    pub allowlist: Option<HashSet<Url>>,
    /// If set, these endpoints are never eligible.
    pub blocklist: Option<HashSet<Url>>,
    /// Upper bound on concurrently raced probes per round.
    pub max_concurrent_requests: usize,
    /// Hard timeout for a single health probe.
    pub request_timeout: Duration,
    /// How long known-unhealthy endpoints stay excluded.
    pub unhealthy_ttl: Duration,
    /// How long known-behind backups are remembered.
    pub backups_ttl: Duration,
    /// Lifetime of the persisted selection; `None` never expires.
    pub cache_ttl: Option<Duration>,
    pub health_check_thresholds: HealthCheckThresholds,
}

/// A partial configuration update applied to a live selector.
///
/// `None` fields keep their current value. Bootstrap services and the initial
/// node are fixed at construction and cannot be updated.
#[derive(Debug, Clone, Default)]
pub struct ConfigUpdate {
    /// Replacement freshness thresholds. Setting this always invalidates the
    /// active selection.
    pub health_check_thresholds: Option<HealthCheckThresholds>,
    /// Replacement allowlist.
    pub allowlist: Option<HashSet<Url>>,
    /// Replacement blocklist.
    pub blocklist: Option<HashSet<Url>>,
}
