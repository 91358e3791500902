//! Health probing and classification of discovery nodes.
//!
//! Two payload shapes exist in the wild: the bare `/health_check` endpoint
//! and the same health fields embedded in ordinary API response bodies. Both
//! are funneled through a single classification function so the selection
//! engine and the reselection monitor can never disagree on what `Behind`
//! means.

use std::{fmt, time::Duration};

use reqwest::{Client, Method, Request};
use semver::Version;
use serde::Deserialize;
use serde_json::Value;
use thiserror::Error;
use url::Url;

use super::config::HealthCheckThresholds;

/// Service identity a candidate must report to be considered at all.
pub(crate) const EXPECTED_SERVICE: &str = "discovery-node";

const HEALTH_CHECK_PATH: &str = "health_check";

/// Classification of one probe result against the configured thresholds.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HealthStatus {
    /// Reachable, correct identity, within every freshness threshold.
    Healthy,
    /// Reachable and nominally correct, but failing a freshness threshold.
    Behind(BehindReason),
    /// Not usable: unreachable, wrong identity, or unclassifiable.
    Unhealthy(UnhealthyReason),
}

impl HealthStatus {
    /// Whether this status allows the node to be selected as-is.
    pub fn is_healthy(&self) -> bool {
        matches!(self, HealthStatus::Healthy)
    }
}

/// Which freshness threshold a `Behind` node failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BehindReason {
    /// Below the configured minimum version.
    Version,
    /// Block indexing lag above the configured maximum.
    BlockDiff,
    /// Plays slot indexing lag above the configured maximum.
    SlotDiff,
}

impl fmt::Display for BehindReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BehindReason::Version => write!(f, "version"),
            BehindReason::BlockDiff => write!(f, "block diff"),
            BehindReason::SlotDiff => write!(f, "slot diff"),
        }
    }
}

/// Why a node was classified `Unhealthy`.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum UnhealthyReason {
    /// The probe did not complete within the request timeout.
    #[error("health check request timed out")]
    Timeout,
    /// The probe failed at the transport level or got a non-success status.
    #[error("health check transport error: {0}")]
    Transport(String),
    /// The node reported a service identity other than `discovery-node`.
    #[error("unexpected service name: {0}")]
    Name(String),
    /// A version floor is configured but the node reported no parseable
    /// version.
    #[error("missing or unparseable version")]
    Version,
    /// The response body could not be interpreted as health data.
    #[error("malformed health payload: {0}")]
    MalformedPayload(String),
}

/// Health metrics retained for a `Behind` node so it can later serve as a
/// backup choice.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackupHealthData {
    /// How far behind the chain the node's indexing was.
    pub block_difference: i64,
    /// The version the node reported, when parseable.
    pub version: Option<Version>,
}

/// Result of probing one endpoint.
#[derive(Debug, Clone)]
pub struct HealthCheckOutcome {
    /// The classification of the probed node.
    pub status: HealthStatus,
    /// Present whenever the probe got a classifiable payload back.
    pub data: Option<BackupHealthData>,
    /// Peer list reported by the node, used to refresh the working set.
    pub peers: Option<Vec<Url>>,
}

impl HealthCheckOutcome {
    fn unhealthy(reason: UnhealthyReason) -> Self {
        Self {
            status: HealthStatus::Unhealthy(reason),
            data: None,
            peers: None,
        }
    }
}

/// Body of `GET {endpoint}/health_check`.
#[derive(Debug, Clone, Deserialize)]
pub(crate) struct HealthCheckResponse {
    pub data: Option<HealthCheckData>,
}

#[derive(Debug, Clone, Deserialize, Default)]
pub(crate) struct HealthCheckData {
    pub service: Option<String>,
    pub version: Option<String>,
    pub block_difference: Option<i64>,
    pub latest_chain_slot_plays: Option<i64>,
    pub latest_indexed_slot_plays: Option<i64>,
    pub network: Option<HealthCheckNetwork>,
}

#[derive(Debug, Clone, Deserialize, Default)]
pub(crate) struct HealthCheckNetwork {
    pub discovery_nodes: Option<Vec<String>>,
}

/// Health fields embedded in ordinary API response bodies.
#[derive(Debug, Clone, Deserialize, Default)]
pub struct ApiHealthData {
    /// Head block of the chain as the node sees it.
    pub latest_chain_block: Option<i64>,
    /// Last block the node has indexed.
    pub latest_indexed_block: Option<i64>,
    /// Head plays slot of the chain as the node sees it.
    pub latest_chain_slot_plays: Option<i64>,
    /// Last plays slot the node has indexed.
    pub latest_indexed_slot_plays: Option<i64>,
    /// Service identity and version, when reported.
    pub version: Option<ApiVersionInfo>,
}

/// Identity block embedded in API response bodies.
#[derive(Debug, Clone, Deserialize, Default)]
pub struct ApiVersionInfo {
    /// Reported service identity.
    pub service: Option<String>,
    /// Reported semantic version.
    pub version: Option<String>,
}

impl ApiHealthData {
    /// Extracts embedded health fields from an arbitrary response body.
    /// Returns `None` when the body carries no health markers at all, in
    /// which case the response tells us nothing about node health.
    pub fn from_value(value: &Value) -> Option<Self> {
        let data: ApiHealthData = serde_json::from_value(value.clone()).ok()?;
        if data.version.is_none() && data.latest_chain_block.is_none() {
            return None;
        }
        Some(data)
    }
}

/// Normalized view over both payload shapes.
struct HealthSummary<'a> {
    service: Option<&'a str>,
    version: Option<&'a str>,
    block_difference: Option<i64>,
    slot_diff_plays: Option<i64>,
}

/// The single classification function both probe paths go through.
///
/// Order of checks: service identity, version floor, block diff, slot diff.
/// A lag comparison with either side absent is healthy on that axis.
fn classify(
    summary: &HealthSummary<'_>,
    thresholds: &HealthCheckThresholds,
) -> (HealthStatus, Option<BackupHealthData>) {
    if let Some(service) = summary.service {
        if service != EXPECTED_SERVICE {
            return (
                HealthStatus::Unhealthy(UnhealthyReason::Name(service.to_string())),
                None,
            );
        }
    }

    let version = summary.version.and_then(|v| Version::parse(v).ok());
    let data = BackupHealthData {
        block_difference: summary.block_difference.unwrap_or(0),
        version: version.clone(),
    };

    if let Some(min_version) = &thresholds.min_version {
        let Some(version) = &version else {
            return (HealthStatus::Unhealthy(UnhealthyReason::Version), None);
        };
        if version < min_version {
            return (HealthStatus::Behind(BehindReason::Version), Some(data));
        }
    }

    if let Some(diff) = summary.block_difference {
        if diff > thresholds.max_block_diff {
            return (HealthStatus::Behind(BehindReason::BlockDiff), Some(data));
        }
    }

    if let (Some(max), Some(diff)) = (thresholds.max_slot_diff_plays, summary.slot_diff_plays) {
        if diff > max {
            return (HealthStatus::Behind(BehindReason::SlotDiff), Some(data));
        }
    }

    (HealthStatus::Healthy, Some(data))
}

pub(crate) fn classify_health_check(
    data: &HealthCheckData,
    thresholds: &HealthCheckThresholds,
) -> (HealthStatus, Option<BackupHealthData>) {
    let slot_diff_plays = match (data.latest_chain_slot_plays, data.latest_indexed_slot_plays) {
        (Some(chain), Some(indexed)) => Some(chain - indexed),
        _ => None,
    };
    classify(
        &HealthSummary {
            // A bare health check that omits the service field is not a
            // discovery node.
            service: Some(data.service.as_deref().unwrap_or_default()),
            version: data.version.as_deref(),
            block_difference: data.block_difference,
            slot_diff_plays,
        },
        thresholds,
    )
}

pub(crate) fn classify_api_health(
    data: &ApiHealthData,
    thresholds: &HealthCheckThresholds,
) -> (HealthStatus, Option<BackupHealthData>) {
    let block_difference = match (data.latest_chain_block, data.latest_indexed_block) {
        (Some(chain), Some(indexed)) => Some(chain - indexed),
        _ => None,
    };
    let slot_diff_plays = match (data.latest_chain_slot_plays, data.latest_indexed_slot_plays) {
        (Some(chain), Some(indexed)) => Some(chain - indexed),
        _ => None,
    };
    let version_info = data.version.as_ref();
    classify(
        &HealthSummary {
            service: version_info.and_then(|v| v.service.as_deref()),
            version: version_info.and_then(|v| v.version.as_deref()),
            block_difference,
            slot_diff_plays,
        },
        thresholds,
    )
}

/// Issues one time-bounded health request against `endpoint` and classifies
/// the result. Purely informational; transport failures and timeouts are
/// folded into `Unhealthy`, never returned as errors.
pub(crate) async fn check_health(
    client: &Client,
    endpoint: &Url,
    thresholds: &HealthCheckThresholds,
    timeout: Duration,
) -> HealthCheckOutcome {
    let url = match endpoint.join(HEALTH_CHECK_PATH) {
        Ok(url) => url,
        Err(err) => {
            return HealthCheckOutcome::unhealthy(UnhealthyReason::Transport(format!(
                "invalid health check url: {err}"
            )))
        }
    };

    let mut request = Request::new(Method::GET, url);
    *request.timeout_mut() = Some(timeout);

    let response = match client.execute(request).await {
        Ok(response) => response,
        Err(err) if err.is_timeout() => {
            return HealthCheckOutcome::unhealthy(UnhealthyReason::Timeout)
        }
        Err(err) => {
            return HealthCheckOutcome::unhealthy(UnhealthyReason::Transport(err.to_string()))
        }
    };

    if !response.status().is_success() {
        return HealthCheckOutcome::unhealthy(UnhealthyReason::Transport(format!(
            "unexpected http status {}",
            response.status()
        )));
    }

    let body: HealthCheckResponse = match response.json().await {
        Ok(body) => body,
        Err(err) => {
            return HealthCheckOutcome::unhealthy(UnhealthyReason::MalformedPayload(
                err.to_string(),
            ))
        }
    };
    let Some(data) = body.data else {
        return HealthCheckOutcome::unhealthy(UnhealthyReason::MalformedPayload(
            "missing data field".to_string(),
        ));
    };

    let (status, backup) = classify_health_check(&data, thresholds);
    let peers = data.network.and_then(|network| {
        network.discovery_nodes.map(|nodes| {
            nodes
                .iter()
                .filter_map(|node| Url::parse(node).ok())
                .collect()
        })
    });
    HealthCheckOutcome {
        status,
        data: backup,
        peers,
    }
}
