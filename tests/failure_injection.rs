//! Failure injection tests: retries, health eviction, circuit breaking,
//! failover and automatic middleware rollback.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use api_gateway::config::MiddlewareConfig;
use axum::http::StatusCode;
use serde_json::json;

mod common;

/// Backend that counts hits and answers `status` with `body`.
async fn counting_backend(status: u16, body: &'static str) -> (SocketAddr, Arc<AtomicU32>) {
    let hits = Arc::new(AtomicU32::new(0));
    let counter = hits.clone();
    let addr = common::start_backend(move |_| {
        counter.fetch_add(1, Ordering::SeqCst);
        async move { (status, body.to_string()) }
    })
    .await;
    (addr, hits)
}

#[tokio::test]
async fn test_retry_on_failure() {
    let calls = Arc::new(AtomicU32::new(0));
    let counter = calls.clone();
    let backend = common::start_backend(move |_| {
        let count = counter.fetch_add(1, Ordering::SeqCst);
        async move {
            if count < 2 {
                (503, "unavailable".to_string())
            } else {
                (200, "recovered".to_string())
            }
        }
    })
    .await;

    let mut config = common::quiet_config();
    config.retries.enabled = true;
    config.retries.base_delay_ms = 1;
    config.retries.max_delay_ms = 5;
    let mut service = common::service("flaky", "/", &[backend]);
    service.retry_count = 3;
    config.services.push(service);
    let gw = common::start_gateway(config).await;

    let res = common::client().get(gw.url("/")).send().await.unwrap();
    assert_eq!(res.status(), StatusCode::OK);
    assert_eq!(res.text().await.unwrap(), "recovered");
    assert_eq!(calls.load(Ordering::SeqCst), 3);
}

#[tokio::test]
async fn test_post_is_not_retried() {
    let (backend, hits) = counting_backend(503, "unavailable").await;

    let mut config = common::quiet_config();
    config.retries.enabled = true;
    let mut service = common::service("svc", "/", &[backend]);
    service.retry_count = 3;
    config.services.push(service);
    let gw = common::start_gateway(config).await;

    let res = common::client().post(gw.url("/orders")).body("{}").send().await.unwrap();
    assert_eq!(res.status(), StatusCode::SERVICE_UNAVAILABLE);
    assert_eq!(hits.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_health_check_evicts_failing_target() {
    let failing = Arc::new(AtomicBool::new(false));
    let one = common::start_fixed_backend(200, "one").await;
    let flag = failing.clone();
    let two = common::start_backend(move |_| {
        let status = if flag.load(Ordering::SeqCst) { 500 } else { 200 };
        async move { (status, "two".to_string()) }
    })
    .await;

    let mut config = common::quiet_config();
    config.health_check.enabled = true;
    config.health_check.interval_secs = 1;
    config.health_check.timeout_ms = 500;
    config.health_check.unhealthy_threshold = 2;
    config.services.push(common::service("svc", "/", &[one, two]));
    let gw = common::start_gateway(config).await;
    let client = common::client();

    failing.store(true, Ordering::SeqCst);

    let mut evicted = false;
    for _ in 0..40 {
        let mut bodies = Vec::new();
        for _ in 0..4 {
            let res = client.get(gw.url("/")).send().await.unwrap();
            bodies.push(res.text().await.unwrap());
        }
        if bodies.iter().all(|b| b == "one") {
            evicted = true;
            break;
        }
        tokio::time::sleep(Duration::from_millis(200)).await;
    }
    assert!(evicted, "failing target was never removed from rotation");

    let alerts = gw.state.recent_alerts.list();
    assert!(alerts.iter().any(|a| a.kind.as_str() == "target-down"));
}

#[tokio::test]
async fn test_circuit_opens_after_threshold() {
    let (backend, hits) = counting_backend(503, "unavailable").await;

    let mut config = common::quiet_config();
    config.circuit_breaker.failure_threshold = 2;
    config.services.push(common::service("svc", "/", &[backend]));
    let gw = common::start_gateway(config).await;
    let client = common::client();

    for _ in 0..2 {
        let res = client.get(gw.url("/")).send().await.unwrap();
        assert_eq!(res.status(), StatusCode::SERVICE_UNAVAILABLE);
    }

    let res = client.get(gw.url("/")).send().await.unwrap();
    assert_eq!(res.status(), StatusCode::SERVICE_UNAVAILABLE);
    assert_eq!(res.headers()["x-gateway-outcome"], "circuit-open");
    assert!(res.headers().contains_key("retry-after"));
    assert_eq!(hits.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn test_failover_to_healthy_target() {
    let (bad, bad_hits) = counting_backend(503, "bad").await;
    let (good, _) = counting_backend(200, "good").await;

    let mut config = common::quiet_config();
    config.circuit_breaker.failure_threshold = 1;
    config.services.push(common::service("svc", "/", &[bad, good]));
    let gw = common::start_gateway(config).await;
    let client = common::client();

    // Round robin reaches both targets in the first two requests.
    for _ in 0..2 {
        client.get(gw.url("/")).send().await.unwrap();
    }

    for _ in 0..6 {
        let res = client.get(gw.url("/")).send().await.unwrap();
        assert_eq!(res.status(), StatusCode::OK);
        assert_eq!(res.text().await.unwrap(), "good");
    }
    assert_eq!(bad_hits.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_bad_middleware_update_is_rolled_back() {
    let backend = common::start_fixed_backend(200, "ok").await;

    let mut config = common::quiet_config();
    config.rollback.failure_threshold = 3;
    config.services.push(common::service("svc", "/", &[backend]));
    config.middleware.push(MiddlewareConfig {
        name: "inject".into(),
        kind: "header-injection".into(),
        priority: 10,
        config: json!({ "response_headers": { "x-inject": "good" } }),
        ..Default::default()
    });
    let gw = common::start_gateway(config).await;
    let client = common::client();

    let res = client.get(gw.url("/")).send().await.unwrap();
    assert_eq!(res.status(), StatusCode::OK);

    gw.state
        .chain
        .update_config("inject", json!({ "request_headers": 5 }))
        .unwrap();

    for _ in 0..3 {
        let res = client.get(gw.url("/")).send().await.unwrap();
        assert_eq!(res.status(), StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(res.headers()["x-gateway-outcome"], "internal-error");
    }

    let res = client.get(gw.url("/")).send().await.unwrap();
    assert_eq!(res.status(), StatusCode::OK);
    assert_eq!(
        gw.state.chain.get("inject").unwrap().settings().config["response_headers"]["x-inject"],
        "good"
    );

    let alerts = gw.state.recent_alerts.list();
    assert!(alerts
        .iter()
        .any(|a| a.kind.as_str() == "middleware-rolled-back" && a.subject == "inject"));
}
