use std::{
    net::TcpListener,
    sync::{Arc, Once},
    time::{Duration, Instant},
};

use mockito::{Mock, Server, ServerGuard};
use semver::Version;
use serde_json::json;
use tracing::Level;
use tracing_subscriber::FmtSubscriber;
use url::Url;

use super::{
    builder::DiscoveryNodeSelectorBuilder,
    cache::MemoryStorage,
    config::{ConfigUpdate, HealthCheckThresholds},
    middleware::ResponseInfo,
};

static TRACING_INIT: Once = Once::new();

fn setup_tracing() {
    TRACING_INIT.call_once(|| {
        FmtSubscriber::builder().with_max_level(Level::DEBUG).init();
    });
}

fn url(s: &str) -> Url {
    Url::parse(s).unwrap()
}

fn health_body(version: &str, block_diff: i64) -> String {
    json!({
        "data": {
            "service": "discovery-node",
            "version": version,
            "block_difference": block_diff,
        }
    })
    .to_string()
}

fn health_body_with_peers(version: &str, block_diff: i64, peers: &[&str]) -> String {
    json!({
        "data": {
            "service": "discovery-node",
            "version": version,
            "block_difference": block_diff,
            "network": { "discovery_nodes": peers },
        }
    })
    .to_string()
}

/// Body of an ordinary API response with embedded health markers.
fn api_body(chain: i64, indexed: i64) -> serde_json::Value {
    json!({
        "latest_chain_block": chain,
        "latest_indexed_block": indexed,
        "version": { "service": "discovery-node", "version": "1.2.3" },
    })
}

async fn node(status: usize, body: &str) -> (ServerGuard, Mock, String) {
    let mut server = Server::new_async().await;
    let mock = server
        .mock("GET", "/health_check")
        .with_status(status)
        .with_header("content-type", "application/json")
        .with_body(body)
        .create_async()
        .await;
    let node_url = server.url();
    (server, mock, node_url)
}

async fn healthy_node() -> (ServerGuard, Mock, String) {
    node(200, &health_body("1.2.3", 0)).await
}

async fn behind_node(version: &str, block_diff: i64) -> (ServerGuard, Mock, String) {
    node(200, &health_body(version, block_diff)).await
}

async fn broken_node() -> (ServerGuard, Mock, String) {
    node(500, "server exploded").await
}

#[tokio::test]
async fn selects_a_healthy_node_over_degraded_ones() {
    setup_tracing();
    let (_s1, _m1, healthy) = healthy_node().await;
    let (_s2, _m2, behind) = behind_node("1.2.3", 50).await;
    let (_s3, _m3, broken) = broken_node().await;

    let selector = DiscoveryNodeSelectorBuilder::new()
        .with_bootstrap_services([healthy.clone(), behind, broken])
        .build()
        .unwrap();
    let subscription = selector.subscribe();

    assert_eq!(selector.get_selected_endpoint().await, Some(url(&healthy)));
    assert!(!selector.is_behind());
    // Subscribers hear about the new selection.
    assert_eq!(subscription.recv().await.unwrap(), url(&healthy));
}

#[tokio::test]
async fn falls_back_to_least_behind_backup() {
    setup_tracing();
    let (_s1, _m1, closer) = behind_node("1.2.3", 20).await;
    let (_s2, _m2, further) = behind_node("1.2.3", 50).await;

    let selector = DiscoveryNodeSelectorBuilder::new()
        .with_bootstrap_services([closer.clone(), further])
        .build()
        .unwrap();

    assert_eq!(selector.get_selected_endpoint().await, Some(url(&closer)));
    assert!(selector.is_behind());
}

#[tokio::test]
async fn prefers_newer_version_among_backups() {
    setup_tracing();
    let (_s1, _m1, older) = behind_node("1.2.3", 20).await;
    let (_s2, _m2, newer) = behind_node("1.2.4", 50).await;

    let selector = DiscoveryNodeSelectorBuilder::new()
        .with_bootstrap_services([older, newer.clone()])
        .build()
        .unwrap();

    assert_eq!(selector.get_selected_endpoint().await, Some(url(&newer)));
    assert!(selector.is_behind());
}

#[tokio::test]
async fn prefers_backup_within_block_threshold_over_newer_version() {
    setup_tracing();
    // Both nodes are below the version floor; the nearly caught-up one wins
    // even though its version is older.
    let (_s1, _m1, newer_but_behind) = behind_node("1.2.4", 50).await;
    let (_s2, _m2, caught_up) = behind_node("1.2.3", 10).await;

    let selector = DiscoveryNodeSelectorBuilder::new()
        .with_bootstrap_services([newer_but_behind, caught_up.clone()])
        .with_health_check_thresholds(HealthCheckThresholds {
            min_version: Some(Version::new(1, 2, 5)),
            ..Default::default()
        })
        .build()
        .unwrap();

    assert_eq!(selector.get_selected_endpoint().await, Some(url(&caught_up)));
    assert!(selector.is_behind());
}

#[tokio::test]
async fn allowlist_limits_the_candidates() {
    setup_tracing();
    let (_s1, m1, excluded) = healthy_node().await;
    let (_s2, _m2, allowed) = healthy_node().await;

    let selector = DiscoveryNodeSelectorBuilder::new()
        .with_bootstrap_services([excluded, allowed.clone()])
        .with_allowlist([allowed.clone()])
        .build()
        .unwrap();

    assert_eq!(selector.get_selected_endpoint().await, Some(url(&allowed)));
    m1.expect(0).assert_async().await;
}

#[tokio::test]
async fn blocklist_excludes_candidates() {
    setup_tracing();
    let (_s1, m1, blocked) = healthy_node().await;
    let (_s2, _m2, usable) = healthy_node().await;

    let selector = DiscoveryNodeSelectorBuilder::new()
        .with_bootstrap_services([blocked.clone(), usable.clone()])
        .with_blocklist([blocked])
        .build()
        .unwrap();

    assert_eq!(selector.get_selected_endpoint().await, Some(url(&usable)));
    m1.expect(0).assert_async().await;
}

#[tokio::test]
async fn updating_the_allowlist_reselects() {
    setup_tracing();
    let (_s1, _m1, first) = healthy_node().await;
    let (_s2, _m2, second) = healthy_node().await;

    let selector = DiscoveryNodeSelectorBuilder::new()
        .with_bootstrap_services([first.clone(), second.clone()])
        .with_allowlist([first.clone()])
        .build()
        .unwrap();
    assert_eq!(selector.get_selected_endpoint().await, Some(url(&first)));

    selector.update_config(ConfigUpdate {
        allowlist: Some([url(&second)].into_iter().collect()),
        ..Default::default()
    });
    assert_eq!(selector.get_selected_endpoint().await, Some(url(&second)));
}

#[tokio::test]
async fn updating_thresholds_reevaluates_the_selection() {
    setup_tracing();
    let (_s1, _m1, only) = healthy_node().await;

    let selector = DiscoveryNodeSelectorBuilder::new()
        .with_bootstrap_services([only.clone()])
        .build()
        .unwrap();
    assert_eq!(selector.get_selected_endpoint().await, Some(url(&only)));
    assert!(!selector.is_behind());

    // Raising the version floor above what the node runs demotes it to a
    // backup on the next selection.
    selector.update_config(ConfigUpdate {
        health_check_thresholds: Some(HealthCheckThresholds {
            min_version: Some(Version::new(9, 0, 0)),
            ..Default::default()
        }),
        ..Default::default()
    });
    assert_eq!(selector.get_selected_endpoint().await, Some(url(&only)));
    assert!(selector.is_behind());
}

#[tokio::test]
async fn preconfigured_node_is_used_without_probing() {
    setup_tracing();
    let (_s1, m1, preconfigured) = healthy_node().await;

    let selector = DiscoveryNodeSelectorBuilder::new()
        .with_bootstrap_services([preconfigured.clone()])
        .with_initial_selected_node(preconfigured.clone())
        .build()
        .unwrap();

    assert_eq!(
        selector.get_selected_endpoint().await,
        Some(url(&preconfigured))
    );
    m1.expect(0).assert_async().await;
}

#[tokio::test]
async fn concurrent_callers_share_one_selection() {
    setup_tracing();
    let (_s1, m1, only) = healthy_node().await;

    let selector = Arc::new(
        DiscoveryNodeSelectorBuilder::new()
            .with_bootstrap_services([only.clone()])
            .build()
            .unwrap(),
    );

    let callers: Vec<_> = (0..8)
        .map(|_| {
            let selector = Arc::clone(&selector);
            tokio::spawn(async move { selector.get_selected_endpoint().await })
        })
        .collect();
    for caller in callers {
        assert_eq!(caller.await.unwrap(), Some(url(&only)));
    }
    // Exactly one probe ran; everyone else adopted its result.
    m1.expect(1).assert_async().await;
}

#[tokio::test]
async fn unresponsive_nodes_are_bounded_by_the_request_timeout() {
    setup_tracing();
    // Accepts connections but never answers.
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let silent = format!("http://{}", listener.local_addr().unwrap());

    let selector = DiscoveryNodeSelectorBuilder::new()
        .with_bootstrap_services([silent])
        .with_request_timeout(Duration::from_millis(100))
        .build()
        .unwrap();

    let started = Instant::now();
    assert_eq!(selector.get_selected_endpoint().await, None);
    assert!(started.elapsed() < Duration::from_secs(5));
}

#[tokio::test]
async fn exhausting_every_candidate_resets_for_the_next_attempt() {
    setup_tracing();
    let (_s1, m1, broken) = broken_node().await;

    let selector = DiscoveryNodeSelectorBuilder::new()
        .with_bootstrap_services([broken])
        .build()
        .unwrap();

    assert_eq!(selector.get_selected_endpoint().await, None);
    // The failure wiped the unhealthy memory, so the node is probed again.
    assert_eq!(selector.get_selected_endpoint().await, None);
    m1.expect_at_least(2).assert_async().await;
}

#[tokio::test]
async fn selection_is_persisted_and_readopted() {
    setup_tracing();
    let (_s1, m1, only) = healthy_node().await;
    let storage = Arc::new(MemoryStorage::new());

    let first = DiscoveryNodeSelectorBuilder::new()
        .with_bootstrap_services([only.clone()])
        .with_storage(storage.clone())
        .build()
        .unwrap();
    assert_eq!(first.get_selected_endpoint().await, Some(url(&only)));

    // A fresh instance sharing the storage short-circuits the probe.
    let second = DiscoveryNodeSelectorBuilder::new()
        .with_bootstrap_services([only.clone()])
        .with_storage(storage)
        .build()
        .unwrap();
    assert_eq!(second.get_selected_endpoint().await, Some(url(&only)));
    m1.expect(1).assert_async().await;
}

#[tokio::test]
async fn blocklisted_cached_node_is_not_readopted() {
    setup_tracing();
    let (_s1, _m1, cached) = healthy_node().await;
    let (_s2, _m2, other) = healthy_node().await;
    let storage = Arc::new(MemoryStorage::new());

    let first = DiscoveryNodeSelectorBuilder::new()
        .with_bootstrap_services([cached.clone()])
        .with_storage(storage.clone())
        .build()
        .unwrap();
    assert_eq!(first.get_selected_endpoint().await, Some(url(&cached)));

    let second = DiscoveryNodeSelectorBuilder::new()
        .with_bootstrap_services([cached.clone(), other.clone()])
        .with_blocklist([cached])
        .with_storage(storage)
        .build()
        .unwrap();
    assert_eq!(second.get_selected_endpoint().await, Some(url(&other)));
}

#[tokio::test]
async fn refreshes_the_candidate_list_from_the_selected_node() {
    setup_tracing();
    let peers = ["https://dn2.example.com", "https://dn3.example.com"];
    let (_s1, _m1, seed) = node(200, &health_body_with_peers("1.2.3", 0, &peers)).await;

    let selector = DiscoveryNodeSelectorBuilder::new()
        .with_bootstrap_services([seed.clone()])
        .build()
        .unwrap();

    assert_eq!(selector.get_selected_endpoint().await, Some(url(&seed)));
    let services = selector.get_services().await;
    assert_eq!(
        services,
        peers.iter().map(|peer| url(peer)).collect::<Vec<_>>()
    );
}

#[tokio::test]
async fn middleware_resolves_relative_paths_against_the_selection() {
    setup_tracing();
    let selector = Arc::new(
        DiscoveryNodeSelectorBuilder::new()
            .with_initial_selected_node("https://dn1.example.com")
            .build()
            .unwrap(),
    );
    let middleware = selector.create_middleware();

    assert_eq!(
        middleware.pre("/v1/full/tracks").await.unwrap(),
        url("https://dn1.example.com/v1/full/tracks")
    );
    // Absolute URLs pass through untouched.
    assert_eq!(
        middleware.pre("https://elsewhere.example.com/x").await.unwrap(),
        url("https://elsewhere.example.com/x")
    );
}

#[tokio::test]
async fn middleware_reselects_when_a_response_body_reports_lag() {
    setup_tracing();
    let (_s1, _m1, replacement) = healthy_node().await;
    let degraded = "https://dn1.example.com";

    let selector = Arc::new(
        DiscoveryNodeSelectorBuilder::new()
            .with_bootstrap_services([replacement.clone()])
            .with_initial_selected_node(degraded)
            .build()
            .unwrap(),
    );
    let middleware = selector.create_middleware();
    let subscription = selector.subscribe();

    middleware
        .post(ResponseInfo {
            endpoint: url(degraded),
            status: 200,
            body: Some(api_body(100, 50)),
        })
        .await;

    assert_eq!(
        selector.get_selected_endpoint().await,
        Some(url(&replacement))
    );
    assert!(!selector.is_behind());
    assert_eq!(subscription.recv().await.unwrap(), url(&replacement));
}

#[tokio::test]
async fn middleware_ignores_client_errors() {
    setup_tracing();
    let (_s1, _m1, replacement) = healthy_node().await;
    let selected = "https://dn1.example.com";

    let selector = Arc::new(
        DiscoveryNodeSelectorBuilder::new()
            .with_bootstrap_services([replacement])
            .with_initial_selected_node(selected)
            .build()
            .unwrap(),
    );
    let middleware = selector.create_middleware();

    // A 404 says nothing about node health. Were the node probed here it
    // would fail (nothing is listening) and trigger a reselection.
    middleware
        .post(ResponseInfo {
            endpoint: url(selected),
            status: 404,
            body: None,
        })
        .await;

    assert_eq!(selector.get_selected_endpoint().await, Some(url(selected)));
}

#[tokio::test]
async fn middleware_probes_and_reselects_on_server_errors() {
    setup_tracing();
    let (_s1, _m1, broken) = broken_node().await;
    let (_s2, _m2, replacement) = healthy_node().await;

    let selector = Arc::new(
        DiscoveryNodeSelectorBuilder::new()
            .with_bootstrap_services([replacement.clone()])
            .with_initial_selected_node(broken.clone())
            .build()
            .unwrap(),
    );
    let middleware = selector.create_middleware();

    middleware
        .post(ResponseInfo {
            endpoint: url(&broken),
            status: 500,
            body: None,
        })
        .await;

    assert_eq!(
        selector.get_selected_endpoint().await,
        Some(url(&replacement))
    );
}

#[tokio::test]
async fn repeated_lag_reports_do_not_cause_reselection_storms() {
    setup_tracing();
    let (_s1, _m1, behind) = behind_node("1.2.3", 50).await;
    let (_s2, m2, healthy) = healthy_node().await;

    // Only the behind node is eligible at first, so it gets selected as a
    // knowingly-behind backup.
    let selector = Arc::new(
        DiscoveryNodeSelectorBuilder::new()
            .with_bootstrap_services([behind.clone(), healthy.clone()])
            .with_allowlist([behind.clone()])
            .build()
            .unwrap(),
    );
    assert_eq!(selector.get_selected_endpoint().await, Some(url(&behind)));
    assert!(selector.is_behind());

    // Widen the allowlist without invalidating the current selection.
    selector.update_config(ConfigUpdate {
        allowlist: Some([url(&behind), url(&healthy)].into_iter().collect()),
        ..Default::default()
    });

    // Another "behind" observation adds nothing we did not already know, so
    // the healthy node must not be probed for a replacement.
    let middleware = selector.create_middleware();
    middleware
        .post(ResponseInfo {
            endpoint: url(&behind),
            status: 200,
            body: Some(api_body(100, 50)),
        })
        .await;

    assert_eq!(selector.get_selected_endpoint().await, Some(url(&behind)));
    assert!(selector.is_behind());
    m2.expect(0).assert_async().await;
}

#[tokio::test]
async fn outright_failure_of_a_behind_node_reselects() {
    setup_tracing();
    let (mut s1, m1, behind) = behind_node("1.2.3", 50).await;
    let (_s2, _m2, healthy) = healthy_node().await;

    let selector = Arc::new(
        DiscoveryNodeSelectorBuilder::new()
            .with_bootstrap_services([behind.clone(), healthy.clone()])
            .with_allowlist([behind.clone()])
            .build()
            .unwrap(),
    );
    assert_eq!(selector.get_selected_endpoint().await, Some(url(&behind)));
    assert!(selector.is_behind());

    selector.update_config(ConfigUpdate {
        allowlist: Some([url(&behind), url(&healthy)].into_iter().collect()),
        ..Default::default()
    });

    // The behind node stops responding entirely.
    m1.remove_async().await;
    let _m1_down = s1
        .mock("GET", "/health_check")
        .with_status(500)
        .with_body("gone")
        .create_async()
        .await;

    let middleware = selector.create_middleware();
    middleware
        .post(ResponseInfo {
            endpoint: url(&behind),
            status: 500,
            body: None,
        })
        .await;

    assert_eq!(selector.get_selected_endpoint().await, Some(url(&healthy)));
    assert!(!selector.is_behind());
}

#[tokio::test]
async fn healthy_response_body_clears_the_behind_flag() {
    setup_tracing();
    let (_s1, _m1, behind) = behind_node("1.2.3", 50).await;

    let selector = Arc::new(
        DiscoveryNodeSelectorBuilder::new()
            .with_bootstrap_services([behind.clone()])
            .build()
            .unwrap(),
    );
    assert_eq!(selector.get_selected_endpoint().await, Some(url(&behind)));
    assert!(selector.is_behind());

    // The node caught up; an ordinary response shows no lag anymore.
    let middleware = selector.create_middleware();
    middleware
        .post(ResponseInfo {
            endpoint: url(&behind),
            status: 200,
            body: Some(api_body(100, 100)),
        })
        .await;

    assert_eq!(selector.get_selected_endpoint().await, Some(url(&behind)));
    assert!(!selector.is_behind());
}
