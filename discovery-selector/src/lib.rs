//! `discovery-selector` picks a healthy discovery node endpoint for a client
//! to talk to, out of a fleet of independently operated candidates of varying
//! quality, and keeps monitoring that choice for as long as the client runs.
//!
//! ## Overview
//! A selection races concurrent health probes against a random sample of
//! candidates and takes the first one that is reachable, reports the right
//! service identity, and is within the configured freshness thresholds.
//! Candidates that are reachable but lagging are remembered as backups: when
//! no fully healthy node exists the selector falls back to the least-behind
//! backup rather than failing. Unhealthy candidates are excluded for a
//! bounded TTL so that transient outages do not blacklist a node forever.
//!
//! The optional [`SelectorStorage`] capability persists the last selection so
//! a fresh process can skip the initial probing entirely, and the
//! [`SelectorMiddleware`] watches ordinary API traffic for embedded health
//! data so degradation is usually noticed without extra probes.
//!
//! ## Example
//! ```rust,no_run
//! use discovery_selector::DiscoveryNodeSelector;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), discovery_selector::SelectorError> {
//!     let selector = DiscoveryNodeSelector::builder()
//!         .with_bootstrap_services([
//!             "https://node1.discovery.example.com",
//!             "https://node2.discovery.example.com",
//!         ])
//!         .build()?;
//!     match selector.get_selected_endpoint().await {
//!         Some(endpoint) => println!("using {endpoint}"),
//!         None => eprintln!("no usable discovery node"),
//!     }
//!     Ok(())
//! }
//! ```
#![warn(missing_docs, missing_debug_implementations)]

pub mod selector;
mod util;

pub use selector::{
    builder::DiscoveryNodeSelectorBuilder,
    cache::{MemoryStorage, SelectorStorage},
    config::{ConfigUpdate, HealthCheckThresholds},
    error::{SelectorError, StorageError},
    health::{
        ApiHealthData, ApiVersionInfo, BackupHealthData, BehindReason, HealthStatus,
        UnhealthyReason,
    },
    middleware::{ResponseInfo, SelectorMiddleware},
    DiscoveryNodeSelector,
};
