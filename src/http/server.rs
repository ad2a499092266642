//! HTTP server setup and request dispatch.
//!
//! # Responsibilities
//! - Build the gateway components from configuration and share them as `AppState`
//! - Create the Axum router with the ambient layers (trace, request ID, timeout,
//!   admission control)
//! - Run the three middleware phases around the forwarder
//! - Apply configuration reloads while traffic is in flight
//!
//! # Data Flow
//! ```text
//! request → [trace] → [request id] → [timeout] → [rate limit]
//!     → gateway_handler
//!         → buffer body → route lookup
//!         → pre-routing pipeline → Forwarder (terminal)
//!         → post-routing pipeline (only when the backend was called)
//!         → pre-response pipeline (always, also for error responses)
//!     → client response
//! ```
//!
//! # Design Decisions
//! - Unmatched paths skip pre-routing and post-routing; they still get a 404
//!   through pre-response
//! - Reloads touch routes, pools and middleware only; listener, limiter and
//!   breaker settings need a restart

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use arc_swap::ArcSwap;
use axum::{
    body::{Body, Bytes},
    extract::{ConnectInfo, State},
    http::{Request, Response},
    routing::any,
    Router,
};
use tokio::net::TcpListener;
use tokio::sync::{broadcast, mpsc};
use tower_http::{
    request_id::{MakeRequestUuid, PropagateRequestIdLayer, SetRequestIdLayer},
    timeout::TimeoutLayer,
    trace::TraceLayer,
};

use crate::config::schema::{GatewayConfig, ServiceConfig};
use crate::error::GatewayError;
use crate::health::{AlertManager, CheckSettings, HealthChecker, HttpProbe, RecentAlerts};
use crate::http::forwarder::Forwarder;
use crate::http::request::{buffer_body, request_id};
use crate::http::response::into_client_response;
use crate::load_balancer::{Target, TargetPools};
use crate::middleware::{
    BuiltinResolver, ChainLoader, Exchange, HandlerResolver, HealthMonitor, MiddlewareChain,
    MiddlewareTester, MonitorSettings, Passthrough, Phase, RollbackManager,
};
use crate::observability::metrics;
use crate::resilience::{BreakerRegistry, BreakerSettings};
use crate::routing::{RouteTable, ServiceRoute};
use crate::security::{rate_limit_middleware, RateLimiter};

const RECENT_ALERTS: usize = 100;

/// Application state injected into handlers.
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<ArcSwap<GatewayConfig>>,
    pub routes: Arc<RouteTable>,
    pub pools: Arc<TargetPools>,
    pub breakers: Arc<BreakerRegistry>,
    pub health_checker: Arc<HealthChecker>,
    pub chain: Arc<MiddlewareChain>,
    pub resolver: Arc<dyn HandlerResolver>,
    pub loader: Arc<ChainLoader>,
    pub rollback: Arc<RollbackManager>,
    pub monitor: Arc<HealthMonitor>,
    pub tester: Arc<MiddlewareTester>,
    pub forwarder: Arc<Forwarder>,
    pub rate_limiter: Arc<RateLimiter>,
    pub alerts: Arc<AlertManager>,
    pub recent_alerts: Arc<RecentAlerts>,
    pub started_at: Instant,
    background: Arc<AtomicBool>,
}

impl AppState {
    /// Build every component and load the configured routes and middleware.
    ///
    /// No background task is started; see [`AppState::start_background`].
    pub fn new(config: GatewayConfig) -> Self {
        let recent_alerts = Arc::new(RecentAlerts::new(RECENT_ALERTS));
        let alerts = Arc::new(AlertManager::from_config(&config.alerts, Arc::clone(&recent_alerts)));

        let pools = Arc::new(TargetPools::new());
        let breakers = Arc::new(BreakerRegistry::new(BreakerSettings::from(&config.circuit_breaker)));
        let health_checker = Arc::new(HealthChecker::new(
            Arc::new(HttpProbe::from_config(&config.health_check)),
            CheckSettings::from(&config.health_check),
            Arc::clone(&alerts),
        ));

        let chain = Arc::new(MiddlewareChain::new(config.rollback.snapshot_on_update));
        let resolver: Arc<dyn HandlerResolver> = Arc::new(BuiltinResolver);
        let loader = Arc::new(ChainLoader::new(Arc::clone(&chain), Arc::clone(&resolver)));
        let rollback = RollbackManager::from_config(&config.rollback, Arc::clone(&chain), Arc::clone(&alerts));
        let monitor = Arc::new(HealthMonitor::new(
            Arc::clone(&chain),
            Arc::clone(&alerts),
            MonitorSettings::from(&config.middleware_health),
        ));
        let tester = Arc::new(MiddlewareTester::new(
            Arc::clone(&chain),
            Duration::from_millis(config.middleware_health.sandbox_timeout_ms),
        ));

        let forwarder = Arc::new(Forwarder::new(
            Arc::clone(&pools),
            Arc::clone(&breakers),
            &config.retries,
            config.listener.max_body_bytes,
        ));

        let state = Self {
            config: Arc::new(ArcSwap::from_pointee(config.clone())),
            routes: Arc::new(RouteTable::new()),
            pools,
            breakers,
            health_checker,
            chain,
            resolver,
            loader,
            rollback,
            monitor,
            tester,
            forwarder,
            rate_limiter: Arc::new(RateLimiter::from_config(&config.rate_limit)),
            alerts,
            recent_alerts,
            started_at: Instant::now(),
            background: Arc::new(AtomicBool::new(false)),
        };
        state.apply_config(config);
        state
    }

    /// Replace the route table and rebuild the target pools.
    ///
    /// Targets whose address persists keep their health. Breakers of removed
    /// targets are dropped and health checks follow the new target set once
    /// background tasks run.
    pub fn load_routes(&self, services: &[ServiceConfig]) -> Vec<Arc<Target>> {
        let routes = self
            .routes
            .replace(services.iter().map(ServiceRoute::from_config).collect());
        let targets = self.pools.rebuild(&routes);

        let live: Vec<String> = targets.iter().map(|t| t.address.clone()).collect();
        self.breakers.retain(&live);

        if self.background.load(Ordering::Acquire) && self.config.load().health_check.enabled {
            self.health_checker.sync(&targets);
        }
        tracing::info!(routes = routes.len(), targets = targets.len(), "Routes loaded");
        targets
    }

    /// Apply a (re)loaded configuration: routes first, then middleware.
    pub fn apply_config(&self, config: GatewayConfig) {
        self.config.store(Arc::new(config.clone()));
        self.load_routes(&config.services);

        let errors = self.loader.reconcile(&config.middleware);
        for (name, error) in &errors {
            tracing::error!(middleware = %name, error = %error, "Middleware definition rejected");
        }
        tracing::info!(
            middleware = self.chain.len(),
            rejected = errors.len(),
            "Middleware reconciled"
        );
    }

    /// Start health checks and the middleware health monitor.
    pub fn start_background(&self, shutdown: broadcast::Receiver<()>) {
        self.background.store(true, Ordering::Release);
        let config = self.config.load();

        if config.health_check.enabled {
            self.health_checker.sync(&self.pools.targets());
        }
        if config.middleware_health.enabled {
            tokio::spawn(Arc::clone(&self.monitor).run(shutdown));
        }
    }

    /// Stop every background check task.
    pub fn stop_background(&self) {
        self.background.store(false, Ordering::Release);
        self.health_checker.stop();
        self.monitor.stop();
    }

    /// Run an exchange through all phases and produce the buffered response.
    pub async fn process(&self, exchange: Exchange) -> Response<Bytes> {
        let path = exchange.path().to_string();
        let fallback = Fallback::of(&exchange);

        let routed = if exchange.service.is_some() {
            self.route_and_forward(exchange, &path).await
        } else {
            Err(GatewayError::NoRoute(path.clone()))
        };

        let exchange = match routed {
            Ok(exchange) if exchange.response.is_some() => exchange,
            Ok(exchange) => {
                tracing::error!(request_id = %exchange.request_id, "Pipeline finished without a response");
                let error = GatewayError::InternalProcessing {
                    middleware: "pipeline".to_string(),
                    reason: "no response produced".to_string(),
                };
                fallback.into_exchange(error.to_response())
            }
            Err(error) => {
                tracing::debug!(
                    request_id = %fallback.request_id,
                    outcome = error.outcome(),
                    error = %error,
                    "Request rejected"
                );
                fallback.into_exchange(error.to_response())
            }
        };

        let pre_response = self.chain.build_pipeline(Phase::PreResponse, &path);
        match pre_response.execute(exchange, &Passthrough).await {
            Ok(exchange) => exchange.response.unwrap_or_else(|| {
                GatewayError::InternalProcessing {
                    middleware: "pre-response".to_string(),
                    reason: "response removed".to_string(),
                }
                .to_response()
            }),
            Err(error) => error.to_response(),
        }
    }

    async fn route_and_forward(&self, exchange: Exchange, path: &str) -> Result<Exchange, GatewayError> {
        let pre_routing = self.chain.build_pipeline(Phase::PreRouting, path);
        let exchange = pre_routing.execute(exchange, self.forwarder.as_ref()).await?;

        if !exchange.upstream_called {
            return Ok(exchange);
        }
        let post_routing = self.chain.build_pipeline(Phase::PostRouting, path);
        post_routing.execute(exchange, &Passthrough).await
    }
}

impl std::fmt::Debug for AppState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AppState")
            .field("routes", &self.routes.routes().len())
            .field("middleware", &self.chain.len())
            .finish()
    }
}

/// What is needed to answer a request whose exchange was consumed by an error.
struct Fallback {
    request_id: String,
    client_addr: Option<SocketAddr>,
    request: axum::http::request::Parts,
    service: Option<Arc<ServiceRoute>>,
}

impl Fallback {
    fn of(exchange: &Exchange) -> Self {
        let mut builder = Request::builder()
            .method(exchange.request.method.clone())
            .uri(exchange.request.uri.clone())
            .version(exchange.request.version);
        if let Some(headers) = builder.headers_mut() {
            headers.clone_from(&exchange.request.headers);
        }
        let request = match builder.body(()) {
            Ok(request) => request.into_parts().0,
            Err(_) => Request::new(()).into_parts().0,
        };
        Self {
            request_id: exchange.request_id.clone(),
            client_addr: exchange.client_addr,
            request,
            service: exchange.service.clone(),
        }
    }

    fn into_exchange(self, response: Response<Bytes>) -> Exchange {
        Exchange::new(self.request_id, self.client_addr, self.request, Bytes::new(), self.service)
            .respond(response)
    }
}

/// HTTP server for the gateway.
pub struct HttpServer {
    router: Router,
    state: AppState,
}

impl HttpServer {
    /// Create a new HTTP server with the given configuration.
    pub fn new(config: GatewayConfig) -> Self {
        let state = AppState::new(config);
        let router = Self::build_router(state.clone());
        Self { router, state }
    }

    pub fn state(&self) -> &AppState {
        &self.state
    }

    /// Build the Axum router with all middleware layers.
    #[allow(deprecated)]
    fn build_router(state: AppState) -> Router {
        let config = state.config.load_full();
        let limiter = Arc::clone(&state.rate_limiter);

        let mut router = Router::new()
            .route("/{*path}", any(gateway_handler))
            .route("/", any(gateway_handler))
            .with_state(state);

        if config.rate_limit.enabled {
            router = router.layer(axum::middleware::from_fn_with_state(limiter, rate_limit_middleware));
        }

        router
            .layer(TimeoutLayer::new(Duration::from_secs(config.listener.request_timeout_secs)))
            .layer(PropagateRequestIdLayer::x_request_id())
            .layer(SetRequestIdLayer::x_request_id(MakeRequestUuid))
            .layer(TraceLayer::new_for_http())
    }

    /// Serve until shutdown, applying configuration updates as they arrive.
    pub async fn run(
        self,
        listener: TcpListener,
        mut config_updates: mpsc::UnboundedReceiver<GatewayConfig>,
        mut shutdown: broadcast::Receiver<()>,
    ) -> Result<(), std::io::Error> {
        let addr = listener.local_addr()?;
        tracing::info!(address = %addr, "HTTP server starting");

        self.state.start_background(shutdown.resubscribe());

        let reload_state = self.state.clone();
        let mut reload_shutdown = shutdown.resubscribe();
        let reloader = tokio::spawn(async move {
            loop {
                tokio::select! {
                    update = config_updates.recv() => match update {
                        Some(config) => {
                            tracing::info!("Applying configuration update");
                            reload_state.apply_config(config);
                        }
                        None => break,
                    },
                    _ = reload_shutdown.recv() => break,
                }
            }
        });

        let app = self.router.into_make_service_with_connect_info::<SocketAddr>();
        axum::serve(listener, app)
            .with_graceful_shutdown(async move {
                let _ = shutdown.recv().await;
                tracing::info!("Shutdown signal received");
            })
            .await?;

        reloader.abort();
        self.state.stop_background();
        tracing::info!("HTTP server stopped");
        Ok(())
    }
}

/// Entry point for every proxied request.
async fn gateway_handler(
    State(state): State<AppState>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    request: Request<Body>,
) -> axum::response::Response {
    let start_time = Instant::now();
    let (parts, body) = request.into_parts();
    let request_id = request_id(&parts.headers);
    let method = parts.method.to_string();

    let service = state.routes.lookup(parts.uri.path());
    let service_name = service
        .as_ref()
        .map(|s| s.name.clone())
        .unwrap_or_else(|| "none".to_string());

    tracing::debug!(
        request_id = %request_id,
        method = %method,
        path = %parts.uri.path(),
        service = %service_name,
        "Handling request"
    );

    let max_body_bytes = state.config.load().listener.max_body_bytes;
    let response = match buffer_body(body, max_body_bytes).await {
        Ok(body) => {
            let exchange = Exchange::new(request_id.clone(), Some(addr), parts, body, service);
            state.process(exchange).await
        }
        Err(error) => {
            let exchange = Exchange::new(request_id.clone(), Some(addr), parts, Bytes::new(), service)
                .respond(error.to_response());
            let path = exchange.path().to_string();
            match state
                .chain
                .build_pipeline(Phase::PreResponse, &path)
                .execute(exchange, &Passthrough)
                .await
            {
                Ok(exchange) => exchange.response.unwrap_or_else(|| error.to_response()),
                Err(e) => e.to_response(),
            }
        }
    };

    metrics::record_request(&method, &service_name, response.status().as_u16(), start_time);
    into_client_response(response, &request_id)
}

#[cfg(test)]
mod tests {
    use axum::http::StatusCode;
    use futures_util::future::BoxFuture;
    use parking_lot::Mutex;
    use serde_json::{json, Value};

    use super::*;
    use crate::config::schema::TargetConfig;
    use crate::error::X_GATEWAY_OUTCOME;
    use crate::middleware::builtin::HeaderInjection;
    use crate::middleware::pipeline::tests::Tracer;
    use crate::middleware::{Middleware, MiddlewareError, Next};

    /// Answers 403 without calling the rest of the pipeline.
    struct Deny;

    impl Middleware for Deny {
        fn handle<'a>(
            &'a self,
            _config: &'a Value,
            exchange: Exchange,
            _next: Next<'a>,
        ) -> BoxFuture<'a, Result<Exchange, MiddlewareError>> {
            Box::pin(async move {
                let response = Response::builder()
                    .status(StatusCode::FORBIDDEN)
                    .body(Bytes::from_static(b"denied"))
                    .map_err(|e| MiddlewareError::handler(e.to_string()))?;
                Ok(exchange.respond(response))
            })
        }
    }

    fn state() -> AppState {
        let config = GatewayConfig {
            services: vec![ServiceConfig {
                name: "users".into(),
                path_prefix: "/users".into(),
                targets: vec![TargetConfig {
                    address: "127.0.0.1:1".into(),
                    weight: 1,
                }],
                ..Default::default()
            }],
            ..Default::default()
        };
        AppState::new(config)
    }

    fn exchange(state: &AppState, path: &str) -> Exchange {
        let (parts, _) = Request::builder().uri(path).body(()).unwrap().into_parts();
        let service = state.routes.lookup(path);
        Exchange::new("req-1", None, parts, Bytes::new(), service)
    }

    fn register(state: &AppState, name: &str, handler: Arc<dyn Middleware>, priority: i64, phase: &str) {
        state
            .chain
            .register(name, handler, priority, vec!["*".into()], phase, Value::Null)
            .unwrap();
    }

    #[tokio::test]
    async fn test_unmatched_path_gets_404_through_pre_response() {
        let state = state();
        let trace = Arc::new(Mutex::new(Vec::new()));
        register(&state, "pre", Arc::new(Tracer { name: "pre", trace: trace.clone() }), 1, "pre-routing");
        register(&state, "inject", Arc::new(HeaderInjection), 1, "pre-response");
        state
            .chain
            .update_config("inject", json!({ "response_headers": { "x-edge": "1" } }))
            .unwrap();

        let response = state.process(exchange(&state, "/nowhere")).await;
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
        assert_eq!(response.headers()[X_GATEWAY_OUTCOME], "no-route");
        assert_eq!(response.headers()["x-edge"], "1");
        assert!(trace.lock().is_empty());
    }

    #[tokio::test]
    async fn test_short_circuit_skips_forwarder_and_post_routing() {
        let state = state();
        let trace = Arc::new(Mutex::new(Vec::new()));
        register(&state, "deny", Arc::new(Deny), 10, "pre-routing");
        register(&state, "post", Arc::new(Tracer { name: "post", trace: trace.clone() }), 1, "post-routing");
        register(&state, "final", Arc::new(Tracer { name: "final", trace: trace.clone() }), 1, "pre-response");

        let response = state.process(exchange(&state, "/users/1")).await;
        assert_eq!(response.status(), StatusCode::FORBIDDEN);
        assert_eq!(&response.body()[..], b"denied");
        assert_eq!(*trace.lock(), vec!["final"]);
        // No network attempt was made against the unreachable target.
        assert!(state.breakers.statuses().is_empty());
    }

    #[tokio::test]
    async fn test_upstream_failure_still_runs_pre_response() {
        let state = state();
        let trace = Arc::new(Mutex::new(Vec::new()));
        register(&state, "post", Arc::new(Tracer { name: "post", trace: trace.clone() }), 1, "post-routing");
        register(&state, "final", Arc::new(Tracer { name: "final", trace: trace.clone() }), 1, "pre-response");

        let response = state.process(exchange(&state, "/users/1")).await;
        assert_eq!(response.status(), StatusCode::BAD_GATEWAY);
        assert_eq!(*trace.lock(), vec!["final"]);
    }

    #[tokio::test]
    async fn test_apply_config_reloads_routes_and_middleware() {
        let state = state();
        assert!(state.routes.lookup("/orders").is_none());

        let mut config = (*state.config.load_full()).clone();
        config.services.push(ServiceConfig {
            name: "orders".into(),
            path_prefix: "/orders".into(),
            targets: vec![TargetConfig {
                address: "127.0.0.1:2".into(),
                weight: 1,
            }],
            ..Default::default()
        });
        config.middleware.push(crate::config::schema::MiddlewareConfig {
            name: "log".into(),
            kind: "request-logger".into(),
            ..Default::default()
        });
        state.apply_config(config);

        assert_eq!(state.routes.lookup("/orders/9").unwrap().name, "orders");
        assert_eq!(state.pools.targets().len(), 2);
        assert!(state.chain.contains("log"));
    }
}
