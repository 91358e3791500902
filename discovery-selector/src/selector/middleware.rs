//! Request middleware that keeps the selector informed.
//!
//! API traffic already carries health markers in its response bodies, so most
//! degradation is noticed without spending extra probes: the middleware feeds
//! every response outcome back into the selector, which reselects when the
//! active node turns out to be behind or down.

use std::sync::Arc;

use serde_json::Value;
use tracing::warn;
use url::Url;

use super::{
    error::SelectorError,
    health::{classify_api_health, ApiHealthData},
    DiscoveryNodeSelector,
};

/// What the middleware needs to know about a completed request.
#[derive(Debug, Clone)]
pub struct ResponseInfo {
    /// The endpoint the request was sent to.
    pub endpoint: Url,
    /// HTTP status code of the response.
    pub status: u16,
    /// Parsed response body, when one was available.
    pub body: Option<Value>,
}

/// Rewrites relative request paths onto the selected endpoint and monitors
/// responses for signs that the endpoint degraded.
///
/// Obtain one via [`DiscoveryNodeSelector::create_middleware`]; clones share
/// the same selector.
#[derive(Debug, Clone)]
pub struct SelectorMiddleware {
    selector: Arc<DiscoveryNodeSelector>,
}

impl SelectorMiddleware {
    pub(crate) fn new(selector: Arc<DiscoveryNodeSelector>) -> Self {
        Self { selector }
    }

    /// Resolves a request target. Absolute URLs pass through untouched;
    /// relative paths are joined onto the selected endpoint, selecting one
    /// first if necessary.
    pub async fn pre(&self, url: &str) -> Result<Url, SelectorError> {
        if url.starts_with("http") {
            return Ok(Url::parse(url)?);
        }
        let endpoint = self
            .selector
            .get_selected_endpoint()
            .await
            .ok_or(SelectorError::NoHealthyNodes)?;
        Ok(endpoint.join(url)?)
    }

    /// Feeds a completed response back into the selector.
    ///
    /// Success bodies are mined for embedded health data. Server errors
    /// trigger an out-of-band health probe. Client errors say nothing about
    /// node health and are only logged.
    pub async fn post(&self, response: ResponseInfo) {
        let ResponseInfo {
            endpoint,
            status,
            body,
        } = response;
        if (200..300).contains(&status) {
            let Some(data) = body.as_ref().and_then(ApiHealthData::from_value) else {
                return;
            };
            let thresholds = self.selector.thresholds();
            let (health, backup) = classify_api_health(&data, &thresholds);
            self.selector
                .reselect_if_necessary(&endpoint, health, backup)
                .await;
        } else if status < 500 {
            warn!(%endpoint, status, "client error from discovery node, not reselecting");
        } else {
            self.check_and_reselect(&endpoint).await;
        }
    }

    /// Reports a transport-level failure where no response arrived at all.
    pub async fn on_transport_error(&self, endpoint: &Url) {
        self.check_and_reselect(endpoint).await;
    }

    async fn check_and_reselect(&self, endpoint: &Url) {
        warn!(%endpoint, "request to discovery node failed, probing its health");
        let outcome = self.selector.probe(endpoint).await;
        self.selector
            .reselect_if_necessary(endpoint, outcome.status, outcome.data)
            .await;
    }
}
