//! Configuration schema definitions.
//!
//! This module defines the complete configuration structure for the gateway.
//! All types derive Serde traits for deserialization from config files.

use serde::{Deserialize, Serialize};

/// Root configuration for the API gateway.
#[derive(Debug, Clone, Deserialize, Serialize, Default)]
#[serde(default)]
pub struct GatewayConfig {
    /// Listener configuration (bind address, body limits).
    pub listener: ListenerConfig,

    /// Service route definitions (the route table source).
    pub services: Vec<ServiceConfig>,

    /// Middleware registrations (the chain source).
    pub middleware: Vec<MiddlewareConfig>,

    /// Active backend health check settings.
    pub health_check: HealthCheckConfig,

    /// Per-target circuit breaker settings.
    pub circuit_breaker: CircuitBreakerConfig,

    /// Admission control settings.
    pub rate_limit: RateLimitConfig,

    /// Retry configuration.
    pub retries: RetryConfig,

    /// Middleware health classification settings.
    pub middleware_health: MiddlewareHealthConfig,

    /// Snapshot and auto-rollback settings.
    pub rollback: RollbackConfig,

    /// Alert delivery settings.
    pub alerts: AlertConfig,

    /// Observability settings.
    pub observability: ObservabilityConfig,

    #[serde(default)]
    pub admin: AdminConfig,
}

/// Listener configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ListenerConfig {
    /// Bind address (e.g., "0.0.0.0:8080").
    pub bind_address: String,

    /// Maximum buffered request/response body size in bytes.
    pub max_body_bytes: usize,

    /// Hard ceiling on total request handling time in seconds.
    pub request_timeout_secs: u64,
}

impl Default for ListenerConfig {
    fn default() -> Self {
        Self {
            bind_address: "0.0.0.0:8080".to_string(),
            max_body_bytes: 2 * 1024 * 1024,
            request_timeout_secs: 60,
        }
    }
}

/// Load-balancing strategy for a service.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum LoadBalancing {
    #[default]
    RoundRobin,
    Random,
    Weighted,
}

/// A service: path prefix mapped to an ordered list of targets.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ServiceConfig {
    /// Service identifier for logging/metrics.
    pub name: String,

    /// Path prefix owned by this service (e.g., "/api/users").
    pub path_prefix: String,

    /// Backend targets.
    pub targets: Vec<TargetConfig>,

    /// Per-call upstream timeout in milliseconds.
    #[serde(default = "default_service_timeout_ms")]
    pub timeout_ms: u64,

    /// Number of retries after the first attempt.
    #[serde(default)]
    pub retry_count: u32,

    #[serde(default)]
    pub load_balancing: LoadBalancing,

    /// Remove the matched prefix before forwarding.
    #[serde(default)]
    pub strip_prefix: bool,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            name: String::new(),
            path_prefix: "/".to_string(),
            targets: Vec::new(),
            timeout_ms: default_service_timeout_ms(),
            retry_count: 0,
            load_balancing: LoadBalancing::default(),
            strip_prefix: false,
        }
    }
}

fn default_service_timeout_ms() -> u64 {
    30_000
}

/// Backend target configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct TargetConfig {
    /// Target address ("127.0.0.1:3000" or "http://host:port").
    pub address: String,

    /// Weight for weighted load balancing (default: 1).
    #[serde(default = "default_weight")]
    pub weight: u32,
}

fn default_weight() -> u32 {
    1
}

/// A middleware registration as supplied by the definition source.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct MiddlewareConfig {
    /// Unique registration name.
    pub name: String,

    /// Handler kind handed to the resolver (e.g., "request-logger").
    pub kind: String,

    /// Execution priority, 0..=1000, lower runs first.
    #[serde(default = "default_priority")]
    pub priority: i64,

    /// Route patterns this middleware applies to.
    #[serde(default = "default_routes")]
    pub routes: Vec<String>,

    /// One of "pre-routing", "post-routing", "pre-response".
    #[serde(default = "default_phase")]
    pub phase: String,

    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Opaque handler configuration.
    #[serde(default)]
    pub config: serde_json::Value,
}

impl Default for MiddlewareConfig {
    fn default() -> Self {
        Self {
            name: String::new(),
            kind: String::new(),
            priority: default_priority(),
            routes: default_routes(),
            phase: default_phase(),
            enabled: true,
            config: serde_json::Value::Null,
        }
    }
}

fn default_priority() -> i64 {
    500
}

fn default_routes() -> Vec<String> {
    vec!["*".to_string()]
}

fn default_phase() -> String {
    "pre-routing".to_string()
}

fn default_true() -> bool {
    true
}

/// Health check configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct HealthCheckConfig {
    /// Enable active health checks.
    pub enabled: bool,

    /// Health check interval in seconds.
    pub interval_secs: u64,

    /// Health check timeout in milliseconds (independent of request timeouts).
    pub timeout_ms: u64,

    /// Path to probe for HTTP health checks.
    pub path: String,

    /// Status codes counted as a passing check.
    pub expected_status: Vec<u16>,

    /// Number of consecutive failures before marking unhealthy.
    pub unhealthy_threshold: u32,

    /// Number of consecutive successes before marking healthy.
    pub healthy_threshold: u32,
}

impl Default for HealthCheckConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            interval_secs: 10,
            timeout_ms: 2_000,
            path: "/health".to_string(),
            expected_status: vec![200, 204],
            unhealthy_threshold: 3,
            healthy_threshold: 2,
        }
    }
}

/// Circuit breaker configuration (per target).
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct CircuitBreakerConfig {
    /// Failures within the window that open the circuit.
    pub failure_threshold: u32,

    /// Failure counting window in seconds.
    pub window_secs: u64,

    /// How long the circuit stays open before a trial call, in seconds.
    pub cooldown_secs: u64,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            window_secs: 60,
            cooldown_secs: 30,
        }
    }
}

/// How admission keys are derived from a request.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum RateLimitKey {
    /// Client IP address.
    #[default]
    Ip,
    /// `X-API-Key` header, falling back to client IP.
    ApiKey,
}

/// Rate limiting configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct RateLimitConfig {
    /// Enable rate limiting.
    pub enabled: bool,

    /// Bucket capacity (burst size).
    pub capacity: u32,

    /// Tokens added per second.
    pub refill_per_sec: f64,

    pub key: RateLimitKey,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            capacity: 50,
            refill_per_sec: 100.0,
            key: RateLimitKey::Ip,
        }
    }
}

/// Retry configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct RetryConfig {
    /// Enable retries (the count itself is per service).
    pub enabled: bool,

    /// Base delay for exponential backoff in milliseconds.
    pub base_delay_ms: u64,

    /// Maximum delay for exponential backoff in milliseconds.
    pub max_delay_ms: u64,

    /// Percentage of requests that can be retries (retry budget).
    /// e.g., 0.1 for 10% budget.
    pub budget_ratio: f32,

    /// Retries always allowed regardless of the ratio.
    pub budget_min_retries: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            base_delay_ms: 50,
            max_delay_ms: 2000,
            budget_ratio: 0.2,
            budget_min_retries: 10,
        }
    }
}

/// Middleware health classification thresholds.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct MiddlewareHealthConfig {
    pub enabled: bool,

    /// Check interval in seconds; also the trailing window for error rate.
    pub interval_secs: u64,

    /// Error rate above which an entry is degraded.
    pub error_rate_threshold: f64,

    /// Average latency above which an entry is degraded, in milliseconds.
    pub latency_threshold_ms: u64,

    /// Consecutive failures that make an entry unhealthy.
    pub unhealthy_consecutive_failures: u64,

    /// Sandbox test timeout in milliseconds.
    pub sandbox_timeout_ms: u64,
}

impl Default for MiddlewareHealthConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            interval_secs: 30,
            error_rate_threshold: 0.1,
            latency_threshold_ms: 1_000,
            unhealthy_consecutive_failures: 5,
            sandbox_timeout_ms: 5_000,
        }
    }
}

/// Snapshot and auto-rollback configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct RollbackConfig {
    /// Roll back automatically when consecutive failures cross the threshold.
    pub auto_rollback: bool,

    pub failure_threshold: u64,

    /// Capture a snapshot before every settings update.
    pub snapshot_on_update: bool,
}

impl Default for RollbackConfig {
    fn default() -> Self {
        Self {
            auto_rollback: true,
            failure_threshold: 5,
            snapshot_on_update: true,
        }
    }
}

/// Alert delivery configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct AlertConfig {
    /// Minimum seconds between two alerts of the same kind for the same subject.
    pub throttle_secs: u64,

    /// Optional webhook receiving JSON alerts.
    pub webhook_url: Option<String>,
}

impl Default for AlertConfig {
    fn default() -> Self {
        Self {
            throttle_secs: 300,
            webhook_url: None,
        }
    }
}

/// Observability configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ObservabilityConfig {
    /// Log level (trace, debug, info, warn, error).
    pub log_level: String,

    /// Enable metrics endpoint.
    pub metrics_enabled: bool,

    /// Metrics endpoint bind address.
    pub metrics_address: String,
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            metrics_enabled: true,
            metrics_address: "0.0.0.0:9090".to_string(),
        }
    }
}

/// Admin surface configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct AdminConfig {
    /// Enable admin API.
    pub enabled: bool,

    /// API key for authentication (Bearer token).
    pub api_key: String,

    /// Admin API bind address.
    pub bind_address: String,
}

impl Default for AdminConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            // WARNING: This is a placeholder! Change this in production.
            api_key: "CHANGE_ME_IN_PRODUCTION".to_string(),
            bind_address: "127.0.0.1:8081".to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_minimal_toml() {
        let config: GatewayConfig = toml::from_str(
            r#"
            [[services]]
            name = "users"
            path_prefix = "/api/users"
            load_balancing = "weighted"
            targets = [{ address = "127.0.0.1:3000", weight = 3 }]

            [[middleware]]
            name = "inject"
            kind = "header-injection"
            priority = 10
            routes = ["/api/*"]
            config = { request_headers = { x-team = "core" } }
            "#,
        )
        .unwrap();

        let svc = &config.services[0];
        assert_eq!(svc.load_balancing, LoadBalancing::Weighted);
        assert_eq!(svc.timeout_ms, 30_000);
        assert_eq!(svc.targets[0].weight, 3);

        let mw = &config.middleware[0];
        assert_eq!(mw.phase, "pre-routing");
        assert!(mw.enabled);
        assert_eq!(mw.config["request_headers"]["x-team"], "core");
        assert_eq!(config.circuit_breaker.cooldown_secs, 30);
    }
}
