//! Proxy forwarder: the terminal of the pre-routing pipeline.
//!
//! # Responsibilities
//! - Select a healthy target through the service's load balancer
//! - Consult the target's circuit breaker before any network attempt
//! - Bound each attempt with the service timeout
//! - Retry idempotent requests within the retry budget
//!
//! # Data Flow
//! ```text
//! Exchange (service matched)
//!     → pool.select()            no healthy target → UpstreamUnavailable
//!     → breaker.try_acquire()    open → try other healthy targets → CircuitOpen
//!     → timeout(client.request + body)
//!     → permit.success() / permit.failure()
//!     → retry with backoff, or return the response / error
//! ```
//!
//! # Design Decisions
//! - Upstream 502/503/504 count as breaker failures and are retried, but when
//!   no retry is left the upstream response is returned unchanged
//! - Circuit-open rejections are never retried here
//! - A retry that finds every breaker open returns the previous attempt's
//!   outcome instead of the rejection

use std::sync::Arc;

use axum::body::{Body, Bytes};
use axum::http::Response;
use futures_util::future::BoxFuture;
use hyper_util::{
    client::legacy::{connect::HttpConnector, Client},
    rt::TokioExecutor,
};

use crate::config::schema::RetryConfig;
use crate::error::GatewayError;
use crate::http::request::{strip_hop_by_hop, upstream_request};
use crate::load_balancer::{ServicePool, Target, TargetPools};
use crate::middleware::{Exchange, MiddlewareError, Terminal};
use crate::resilience::backoff::Backoff;
use crate::resilience::circuit_breaker::{BreakerRegistry, CallPermit};
use crate::resilience::retries::{is_failure_status, is_retryable, RetryBudget};
use crate::routing::ServiceRoute;

pub struct Forwarder {
    client: Client<HttpConnector, Body>,
    pools: Arc<TargetPools>,
    breakers: Arc<BreakerRegistry>,
    retry_budget: Arc<RetryBudget>,
    backoff: Backoff,
    retries_enabled: bool,
    max_body_bytes: usize,
}

impl Forwarder {
    pub fn new(
        pools: Arc<TargetPools>,
        breakers: Arc<BreakerRegistry>,
        retries: &RetryConfig,
        max_body_bytes: usize,
    ) -> Self {
        let client = Client::builder(TokioExecutor::new()).build(HttpConnector::new());
        Self {
            client,
            pools,
            breakers,
            retry_budget: Arc::new(RetryBudget::from_config(retries)),
            backoff: Backoff::from(retries),
            retries_enabled: retries.enabled,
            max_body_bytes,
        }
    }

    /// Forward the exchange's request to one of the route's targets.
    pub async fn forward(
        &self,
        route: &ServiceRoute,
        exchange: &Exchange,
    ) -> Result<Response<Bytes>, GatewayError> {
        let pool = self
            .pools
            .pool(&route.name)
            .ok_or_else(|| GatewayError::UpstreamUnavailable(route.name.clone()))?;

        self.retry_budget.record_request();
        let max_attempts = 1 + if self.retries_enabled { route.retry_count } else { 0 };
        let method = &exchange.request.method;
        let mut attempt = 0;
        let mut previous: Option<Result<Response<Bytes>, GatewayError>> = None;

        loop {
            attempt += 1;
            let (target, permit) = match self.acquire(&pool) {
                Ok(acquired) => acquired,
                Err(e) => match previous {
                    // A retry found no admissible target: report what the
                    // last attempt actually got.
                    Some(last) => {
                        tracing::info!(
                            request_id = %exchange.request_id,
                            service = %route.name,
                            attempt,
                            error = %e,
                            "No target for retry, returning previous outcome"
                        );
                        return last;
                    }
                    None => return Err(e),
                },
            };
            let outcome = self.send(route, &target, exchange).await;

            let status = outcome.as_ref().ok().map(|r| r.status());
            let failed = match &outcome {
                Ok(response) => is_failure_status(response.status()),
                Err(_) => true,
            };
            if failed {
                permit.failure();
            } else {
                permit.success();
            }

            if failed
                && attempt < max_attempts
                && is_retryable(method, status)
                && self.retry_budget.try_retry()
            {
                let delay = self.backoff.delay(attempt);
                tracing::info!(
                    request_id = %exchange.request_id,
                    service = %route.name,
                    target_addr = %target.address,
                    attempt,
                    delay = ?delay,
                    status = status.map(|s| s.as_u16()),
                    "Retrying upstream request"
                );
                tokio::time::sleep(delay).await;
                previous = Some(outcome);
                continue;
            }

            if let Err(e) = &outcome {
                tracing::warn!(
                    request_id = %exchange.request_id,
                    service = %route.name,
                    target_addr = %target.address,
                    attempt,
                    error = %e,
                    "Upstream request failed"
                );
            }
            return outcome;
        }
    }

    /// Pick a target whose breaker admits a call.
    fn acquire(&self, pool: &ServicePool) -> Result<(Arc<Target>, CallPermit), GatewayError> {
        let first = pool.select()?;
        let rejection = match self.breakers.get(&first.address).try_acquire() {
            Ok(permit) => return Ok((first, permit)),
            Err(e) => e,
        };

        for member in pool.healthy() {
            if member.target.address == first.address {
                continue;
            }
            if let Ok(permit) = self.breakers.get(&member.target.address).try_acquire() {
                tracing::debug!(
                    service = %pool.service(),
                    skipped = %first.address,
                    target_addr = %member.target.address,
                    "Circuit open, using another target"
                );
                return Ok((member.target, permit));
            }
        }
        Err(rejection)
    }

    async fn send(
        &self,
        route: &ServiceRoute,
        target: &Target,
        exchange: &Exchange,
    ) -> Result<Response<Bytes>, GatewayError> {
        let request = upstream_request(exchange, route, target)?;

        let call = async {
            let response = self
                .client
                .request(request)
                .await
                .map_err(|e| GatewayError::UpstreamFailed {
                    target: target.address.clone(),
                    reason: e.to_string(),
                })?;
            let (mut parts, body) = response.into_parts();
            let body = axum::body::to_bytes(Body::new(body), self.max_body_bytes)
                .await
                .map_err(|e| GatewayError::UpstreamFailed {
                    target: target.address.clone(),
                    reason: format!("reading response body: {e}"),
                })?;
            strip_hop_by_hop(&mut parts.headers);
            Ok(Response::from_parts(parts, body))
        };

        match tokio::time::timeout(route.timeout, call).await {
            Ok(result) => result,
            Err(_) => Err(GatewayError::UpstreamTimeout {
                target: target.address.clone(),
                timeout: route.timeout,
            }),
        }
    }
}

impl Terminal for Forwarder {
    fn call<'a>(&'a self, mut exchange: Exchange) -> BoxFuture<'a, Result<Exchange, MiddlewareError>> {
        Box::pin(async move {
            let route = exchange
                .service
                .clone()
                .ok_or_else(|| GatewayError::NoRoute(exchange.path().to_string()))?;
            let response = self.forward(&route, &exchange).await?;
            exchange.upstream_called = true;
            Ok(exchange.respond(response))
        })
    }
}

impl std::fmt::Debug for Forwarder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Forwarder")
            .field("retries_enabled", &self.retries_enabled)
            .field("backoff", &self.backoff)
            .field("max_body_bytes", &self.max_body_bytes)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use std::net::SocketAddr;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    use axum::http::{Method, Request, StatusCode};
    use axum::routing::any;
    use axum::Router;
    use tokio::net::TcpListener;

    use super::*;
    use crate::config::schema::LoadBalancing;
    use crate::resilience::circuit_breaker::BreakerSettings;
    use crate::routing::TargetSpec;

    /// Backend answering `status` and counting hits.
    async fn backend(status: StatusCode) -> (SocketAddr, Arc<AtomicUsize>) {
        let hits = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&hits);
        let app = Router::new().fallback(any(move || {
            let counter = Arc::clone(&counter);
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
                (status, "backend")
            }
        }));
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        (addr, hits)
    }

    fn route(addrs: &[SocketAddr], retry_count: u32) -> Arc<ServiceRoute> {
        Arc::new(ServiceRoute {
            name: "orders".into(),
            path_prefix: "/orders".into(),
            targets: addrs
                .iter()
                .map(|a| TargetSpec {
                    address: a.to_string(),
                    weight: 1,
                })
                .collect(),
            timeout: Duration::from_secs(2),
            retry_count,
            strategy: LoadBalancing::RoundRobin,
            strip_prefix: false,
        })
    }

    fn forwarder(route: &Arc<ServiceRoute>) -> (Forwarder, Arc<BreakerRegistry>) {
        let pools = Arc::new(TargetPools::new());
        pools.rebuild(std::slice::from_ref(route));
        let breakers = Arc::new(BreakerRegistry::new(BreakerSettings {
            failure_threshold: 1,
            window: Duration::from_secs(60),
            cooldown: Duration::from_secs(60),
        }));
        let retries = RetryConfig {
            base_delay_ms: 1,
            max_delay_ms: 5,
            ..Default::default()
        };
        let forwarder = Forwarder::new(pools, Arc::clone(&breakers), &retries, 1024 * 1024);
        (forwarder, breakers)
    }

    fn exchange(method: Method, route: &Arc<ServiceRoute>) -> Exchange {
        let (parts, _) = Request::builder()
            .method(method)
            .uri("/orders/1")
            .body(())
            .unwrap()
            .into_parts();
        Exchange::new("req-1", None, parts, Bytes::new(), Some(Arc::clone(route)))
    }

    #[tokio::test]
    async fn test_success_sets_response() {
        let (addr, hits) = backend(StatusCode::OK).await;
        let route = route(&[addr], 0);
        let (forwarder, _) = forwarder(&route);

        let exchange = forwarder.call(exchange(Method::GET, &route)).await.unwrap();
        assert!(exchange.upstream_called);
        let response = exchange.response.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(&response.body()[..], b"backend");
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_idempotent_request_retries_on_another_target() {
        let (bad, bad_hits) = backend(StatusCode::SERVICE_UNAVAILABLE).await;
        let (good, good_hits) = backend(StatusCode::OK).await;
        let route = route(&[bad, good], 2);
        let (forwarder, _) = forwarder(&route);

        let response = forwarder.forward(&route, &exchange(Method::GET, &route)).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(bad_hits.load(Ordering::SeqCst), 1);
        assert_eq!(good_hits.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_post_is_not_retried() {
        let (bad, bad_hits) = backend(StatusCode::BAD_GATEWAY).await;
        let route = route(&[bad], 3);
        let (forwarder, _) = forwarder(&route);

        let response = forwarder.forward(&route, &exchange(Method::POST, &route)).await.unwrap();
        assert_eq!(response.status(), StatusCode::BAD_GATEWAY);
        assert_eq!(bad_hits.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_open_circuit_rejects_without_network_attempt() {
        let (bad, bad_hits) = backend(StatusCode::SERVICE_UNAVAILABLE).await;
        let route = route(&[bad], 0);
        let (forwarder, breakers) = forwarder(&route);

        // Threshold 1: the first failure opens the circuit.
        forwarder.forward(&route, &exchange(Method::GET, &route)).await.unwrap();
        assert_eq!(breakers.get(&bad.to_string()).state(), crate::resilience::CircuitState::Open);

        let err = forwarder
            .forward(&route, &exchange(Method::GET, &route))
            .await
            .unwrap_err();
        assert!(matches!(err, GatewayError::CircuitOpen { .. }));
        assert_eq!(bad_hits.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_retry_blocked_by_open_circuit_keeps_upstream_response() {
        let (bad, bad_hits) = backend(StatusCode::SERVICE_UNAVAILABLE).await;
        let route = route(&[bad], 3);
        let (forwarder, _) = forwarder(&route);

        // The first 503 opens the only breaker; the retry has nowhere to go.
        let response = forwarder.forward(&route, &exchange(Method::GET, &route)).await.unwrap();
        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(&response.body()[..], b"backend");
        assert_eq!(bad_hits.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_open_circuit_fails_over_to_healthy_target() {
        let (first, first_hits) = backend(StatusCode::OK).await;
        let (second, second_hits) = backend(StatusCode::OK).await;
        let route = route(&[first, second], 0);
        let (forwarder, breakers) = forwarder(&route);

        breakers.get(&first.to_string()).try_acquire().unwrap().failure();
        for _ in 0..4 {
            let response = forwarder.forward(&route, &exchange(Method::GET, &route)).await.unwrap();
            assert_eq!(response.status(), StatusCode::OK);
        }
        assert_eq!(first_hits.load(Ordering::SeqCst), 0);
        assert_eq!(second_hits.load(Ordering::SeqCst), 4);
    }

    #[tokio::test]
    async fn test_unreachable_target_is_upstream_failure() {
        // Bind then drop to get a port nobody listens on.
        let addr = {
            let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
            listener.local_addr().unwrap()
        };
        let route = route(&[addr], 0);
        let (forwarder, _) = forwarder(&route);

        let err = forwarder
            .forward(&route, &exchange(Method::GET, &route))
            .await
            .unwrap_err();
        assert!(matches!(err, GatewayError::UpstreamFailed { .. }));
        assert_eq!(err.status(), StatusCode::BAD_GATEWAY);
    }
}
