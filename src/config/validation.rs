//! Configuration validation.
//!
//! # Responsibilities
//! - Semantic validation (serde handles syntactic)
//! - Validate value ranges (timeouts > 0, priorities, ratios)
//! - Detect duplicate service and middleware names
//!
//! # Design Decisions
//! - Returns all validation errors, not just the first
//! - Validation is a pure function: GatewayConfig → Result<(), Vec<ValidationError>>
//! - Runs before a config is accepted, on startup and on every reload
//! - Middleware kinds are not checked here; the resolver reports unknown kinds

use std::collections::HashSet;
use std::net::SocketAddr;

use thiserror::Error;

use crate::config::schema::GatewayConfig;
use crate::load_balancer::backend::parse_target_url;
use crate::middleware::entry::{validate_priority, Phase};

/// One semantic problem, located by a dotted field path.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{field}: {message}")]
pub struct ValidationError {
    pub field: String,
    pub message: String,
}

impl ValidationError {
    fn new(field: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            field: field.into(),
            message: message.into(),
        }
    }
}

pub fn validate_config(config: &GatewayConfig) -> Result<(), Vec<ValidationError>> {
    let mut errors = Vec::new();

    if config.listener.bind_address.parse::<SocketAddr>().is_err() {
        errors.push(ValidationError::new("listener.bind_address", "must be a socket address"));
    }
    if config.listener.max_body_bytes == 0 {
        errors.push(ValidationError::new("listener.max_body_bytes", "must be greater than 0"));
    }
    if config.listener.request_timeout_secs == 0 {
        errors.push(ValidationError::new("listener.request_timeout_secs", "must be greater than 0"));
    }

    validate_services(config, &mut errors);
    validate_middleware(config, &mut errors);

    let health = &config.health_check;
    if health.enabled {
        if health.interval_secs == 0 {
            errors.push(ValidationError::new("health_check.interval_secs", "must be greater than 0"));
        }
        if health.timeout_ms == 0 {
            errors.push(ValidationError::new("health_check.timeout_ms", "must be greater than 0"));
        }
        if !health.path.starts_with('/') {
            errors.push(ValidationError::new("health_check.path", "must start with '/'"));
        }
    }

    if config.circuit_breaker.failure_threshold == 0 {
        errors.push(ValidationError::new("circuit_breaker.failure_threshold", "must be greater than 0"));
    }
    if config.circuit_breaker.window_secs == 0 {
        errors.push(ValidationError::new("circuit_breaker.window_secs", "must be greater than 0"));
    }

    let rate = &config.rate_limit;
    if rate.enabled && (rate.capacity == 0 || rate.refill_per_sec <= 0.0) {
        errors.push(ValidationError::new(
            "rate_limit",
            "capacity and refill_per_sec must be positive when enabled",
        ));
    }

    let retries = &config.retries;
    if !(0.0..=1.0).contains(&retries.budget_ratio) {
        errors.push(ValidationError::new("retries.budget_ratio", "must be between 0.0 and 1.0"));
    }
    if retries.base_delay_ms > retries.max_delay_ms {
        errors.push(ValidationError::new("retries.base_delay_ms", "must not exceed max_delay_ms"));
    }

    let mh = &config.middleware_health;
    if mh.enabled && mh.interval_secs == 0 {
        errors.push(ValidationError::new("middleware_health.interval_secs", "must be greater than 0"));
    }
    if !(0.0..=1.0).contains(&mh.error_rate_threshold) {
        errors.push(ValidationError::new(
            "middleware_health.error_rate_threshold",
            "must be between 0.0 and 1.0",
        ));
    }

    if config.rollback.auto_rollback && config.rollback.failure_threshold == 0 {
        errors.push(ValidationError::new("rollback.failure_threshold", "must be greater than 0"));
    }

    if let Some(url) = &config.alerts.webhook_url {
        if url::Url::parse(url).is_err() {
            errors.push(ValidationError::new("alerts.webhook_url", "must be a valid URL"));
        }
    }

    if config.observability.metrics_enabled
        && config.observability.metrics_address.parse::<SocketAddr>().is_err()
    {
        errors.push(ValidationError::new("observability.metrics_address", "must be a socket address"));
    }

    if config.admin.enabled {
        if config.admin.api_key.is_empty() {
            errors.push(ValidationError::new("admin.api_key", "must not be empty"));
        }
        if config.admin.bind_address.parse::<SocketAddr>().is_err() {
            errors.push(ValidationError::new("admin.bind_address", "must be a socket address"));
        }
    }

    if errors.is_empty() {
        Ok(())
    } else {
        Err(errors)
    }
}

fn validate_services(config: &GatewayConfig, errors: &mut Vec<ValidationError>) {
    let mut names = HashSet::new();
    let mut prefixes = HashSet::new();

    for (i, service) in config.services.iter().enumerate() {
        let field = |name: &str| format!("services[{i}].{name}");

        if service.name.is_empty() {
            errors.push(ValidationError::new(field("name"), "must not be empty"));
        } else if !names.insert(service.name.as_str()) {
            errors.push(ValidationError::new(field("name"), format!("duplicate service '{}'", service.name)));
        }

        if !service.path_prefix.starts_with('/') {
            errors.push(ValidationError::new(field("path_prefix"), "must start with '/'"));
        } else {
            let normalized = service.path_prefix.trim_end_matches('/').to_string();
            if !prefixes.insert(normalized) {
                errors.push(ValidationError::new(
                    field("path_prefix"),
                    format!("prefix '{}' is already owned by another service", service.path_prefix),
                ));
            }
        }

        if service.targets.is_empty() {
            errors.push(ValidationError::new(field("targets"), "at least one target is required"));
        }
        for (j, target) in service.targets.iter().enumerate() {
            if let Err(e) = parse_target_url(&target.address) {
                errors.push(ValidationError::new(
                    format!("services[{i}].targets[{j}].address"),
                    format!("invalid address '{}': {e}", target.address),
                ));
            }
            if target.weight == 0 {
                errors.push(ValidationError::new(
                    format!("services[{i}].targets[{j}].weight"),
                    "must be greater than 0",
                ));
            }
        }

        if service.timeout_ms == 0 {
            errors.push(ValidationError::new(field("timeout_ms"), "must be greater than 0"));
        }
    }
}

fn validate_middleware(config: &GatewayConfig, errors: &mut Vec<ValidationError>) {
    let mut names = HashSet::new();

    for (i, middleware) in config.middleware.iter().enumerate() {
        let field = |name: &str| format!("middleware[{i}].{name}");

        if middleware.name.is_empty() {
            errors.push(ValidationError::new(field("name"), "must not be empty"));
        } else if !names.insert(middleware.name.as_str()) {
            errors.push(ValidationError::new(
                field("name"),
                format!("duplicate middleware '{}'", middleware.name),
            ));
        }
        if middleware.kind.is_empty() {
            errors.push(ValidationError::new(field("kind"), "must not be empty"));
        }
        if let Err(e) = validate_priority(middleware.priority) {
            errors.push(ValidationError::new(field("priority"), e.to_string()));
        }
        if let Err(e) = middleware.phase.parse::<Phase>() {
            errors.push(ValidationError::new(field("phase"), e.to_string()));
        }
        if middleware.routes.is_empty() {
            errors.push(ValidationError::new(field("routes"), "at least one route pattern is required"));
        }
    }
}
