use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::{Duration, Instant};

use axum::http::StatusCode;
use axum::routing::get;
use axum::Router;
use reqwest::Client;
use serde_json::Value;
use tokio::time::sleep;

mod common;
use common::*;

use peerstat::types::{ClusterStatus, EXPOSED_PORTS_FIELD};

const PEER_TIMEOUT: Duration = Duration::from_millis(700);

async fn get_cluster(url: String) -> anyhow::Result<(StatusCode, Value)> {
    let resp = Client::new().get(url).send().await?;
    let status = StatusCode::from_u16(resp.status().as_u16())?;
    Ok((status, resp.json().await?))
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn slow_peer_does_not_hold_up_the_others() -> anyhow::Result<()> {
    let idle = Arc::new(StaticRegistry::with_peers(Vec::new()));
    let peer1 = start_node(
        FakeRuntime::Running(vec![workload("a1"), workload("a2")]),
        Arc::clone(&idle),
        PEER_TIMEOUT,
    )
    .await;
    let peer3 = start_node(
        FakeRuntime::Running(vec![workload("c1")]),
        Arc::clone(&idle),
        PEER_TIMEOUT,
    )
    .await;
    let (slow_addr, slow_handle) = spawn_router(Router::new().route(
        "/status/local",
        get(|| async {
            sleep(Duration::from_secs(30)).await;
            "{}"
        }),
    ))
    .await;

    let slow = peer_at(slow_addr);
    let registry = Arc::new(StaticRegistry::with_peers(vec![
        peer_at(peer1.local_addr()),
        slow.clone(),
        peer_at(peer3.local_addr()),
    ]));
    let node = start_node(FakeRuntime::Running(Vec::new()), Arc::clone(&registry), PEER_TIMEOUT).await;

    let started = Instant::now();
    let (status, body) = get_cluster(format!("http://{}/status", node.local_addr())).await?;
    let elapsed = started.elapsed();

    assert_eq!(status, StatusCode::OK);
    // Peers are queried together: one timeout, not three.
    assert!(elapsed >= PEER_TIMEOUT, "returned before the slow peer timed out: {:?}", elapsed);
    assert!(elapsed < PEER_TIMEOUT * 2, "peers were not queried concurrently: {:?}", elapsed);

    let cluster: ClusterStatus = serde_json::from_value(body)?;
    assert_eq!(cluster.hosts.len(), 3);

    let first = &cluster.hosts[&peer_at(peer1.local_addr()).address()];
    let containers = first.containers.as_ref().expect("peer 1 containers");
    assert_eq!(containers.len(), 2);
    assert!(containers.iter().all(|c| c.get(EXPOSED_PORTS_FIELD).is_none()));
    assert!(first.error.is_none());
    assert_eq!(first.port, Some(peer1.local_addr().port()));

    let third = &cluster.hosts[&peer_at(peer3.local_addr()).address()];
    assert_eq!(third.containers.as_ref().map(Vec::len), Some(1));

    let timed_out = &cluster.hosts[&slow.address()];
    assert!(timed_out.containers.is_none());
    let error = timed_out.error.as_deref().expect("slow peer error");
    assert!(error.contains("timed out"), "unexpected error: {}", error);
    assert_eq!(timed_out.host.as_deref(), Some("127.0.0.1"));
    assert_eq!(timed_out.port, Some(slow_addr.port()));

    slow_handle.abort();
    node.stop().await;
    peer1.stop().await;
    peer3.stop().await;
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn peer_failures_are_reported_per_peer() -> anyhow::Result<()> {
    let idle = Arc::new(StaticRegistry::with_peers(Vec::new()));
    let broken = start_node(
        FakeRuntime::Broken("Docker daemon is not running".into()),
        Arc::clone(&idle),
        PEER_TIMEOUT,
    )
    .await;
    let (garbage_addr, garbage_handle) = spawn_router(
        Router::new().route("/status/local", get(|| async { "<html>hello</html>" })),
    )
    .await;
    let (teapot_addr, teapot_handle) = spawn_router(Router::new().route(
        "/status/local",
        get(|| async { (StatusCode::IM_A_TEAPOT, "{}") }),
    ))
    .await;
    let refused = closed_addr().await;

    let registry = Arc::new(StaticRegistry::with_peers(vec![
        peer_at(broken.local_addr()),
        peer_at(garbage_addr),
        peer_at(teapot_addr),
        peer_at(refused),
    ]));
    let node = start_node(FakeRuntime::Running(Vec::new()), registry, PEER_TIMEOUT).await;

    let (status, body) = get_cluster(format!("http://{}/status", node.local_addr())).await?;
    assert_eq!(status, StatusCode::OK);
    let cluster: ClusterStatus = serde_json::from_value(body)?;
    assert_eq!(cluster.hosts.len(), 4);

    let relayed = &cluster.hosts[&peer_at(broken.local_addr()).address()];
    assert!(relayed
        .error
        .as_deref()
        .is_some_and(|e| e.contains("Docker daemon is not running")));
    assert_eq!(relayed.port, Some(broken.local_addr().port()));

    let garbage = &cluster.hosts[&peer_at(garbage_addr).address()];
    assert!(garbage
        .error
        .as_deref()
        .is_some_and(|e| e.starts_with("malformed response")));

    let teapot = &cluster.hosts[&peer_at(teapot_addr).address()];
    assert!(teapot.error.as_deref().is_some_and(|e| e.contains("418")));

    let gone = &cluster.hosts[&peer_at(refused).address()];
    assert!(gone.error.is_some());
    assert!(gone.containers.is_none());
    assert_eq!(gone.port, Some(refused.port()));

    garbage_handle.abort();
    teapot_handle.abort();
    node.stop().await;
    broken.stop().await;
    Ok(())
}

#[tokio::test]
async fn registry_failure_fails_the_whole_request() -> anyhow::Result<()> {
    let registry = Arc::new(StaticRegistry::unavailable());
    let node = start_node(FakeRuntime::Running(Vec::new()), Arc::clone(&registry), PEER_TIMEOUT).await;

    let (status, body) = get_cluster(format!("http://{}/status", node.local_addr())).await?;
    assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
    assert!(body["error"]
        .as_str()
        .is_some_and(|e| e.contains("no leader")));
    assert!(body.get("hosts").is_none());
    assert_eq!(registry.list_calls.load(Ordering::SeqCst), 1);

    node.stop().await;
    Ok(())
}

#[tokio::test]
async fn empty_cluster_is_an_empty_map() -> anyhow::Result<()> {
    let registry = Arc::new(StaticRegistry::with_peers(Vec::new()));
    let node = start_node(FakeRuntime::Running(Vec::new()), Arc::clone(&registry), PEER_TIMEOUT).await;

    for _ in 0..2 {
        let (status, body) = get_cluster(format!("http://{}/status", node.local_addr())).await?;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body, serde_json::json!({"hosts": {}}));
    }
    // Every request asks the registry again.
    assert_eq!(registry.list_calls.load(Ordering::SeqCst), 2);

    node.stop().await;
    Ok(())
}

#[tokio::test]
async fn bare_object_from_peer_means_no_containers() -> anyhow::Result<()> {
    let (idle_addr, idle_handle) = spawn_router(
        Router::new().route("/status/local", get(|| async { "{}" })),
    )
    .await;
    let registry = Arc::new(StaticRegistry::with_peers(vec![peer_at(idle_addr)]));
    let node = start_node(FakeRuntime::Running(Vec::new()), registry, PEER_TIMEOUT).await;

    let (status, body) = get_cluster(format!("http://{}/status", node.local_addr())).await?;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(
        body["hosts"][peer_at(idle_addr).address()],
        serde_json::json!({"containers": [], "host": "127.0.0.1", "port": idle_addr.port()})
    );

    idle_handle.abort();
    node.stop().await;
    Ok(())
}
