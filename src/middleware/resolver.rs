//! Handler resolution and reconciliation of configured middleware.
//!
//! # Responsibilities
//! - Turn a configured middleware kind into a callable handler
//! - Reconcile the `[[middleware]]` definitions against the live chain
//!
//! # Design Decisions
//! - The chain never resolves handlers itself; it only receives trait objects
//! - Reconciliation goes through the regular register/update/unregister
//!   operations, so a reload gets the same validation and snapshots as an
//!   administrative change
//! - A handler is re-resolved only when an entry's kind changes

use std::sync::Arc;

use dashmap::DashMap;
use serde_json::Value;
use thiserror::Error;

use crate::config::schema::MiddlewareConfig;
use crate::error::GatewayError;
use crate::middleware::builtin::{HeaderInjection, RequestLogger};
use crate::middleware::chain::MiddlewareChain;
use crate::middleware::handler::Middleware;

#[derive(Debug, Error)]
pub enum ResolveError {
    #[error("unknown middleware kind '{0}'")]
    UnknownKind(String),

    #[error(transparent)]
    Chain(#[from] GatewayError),
}

/// Produces handlers by kind.
pub trait HandlerResolver: Send + Sync {
    fn resolve(&self, kind: &str, config: &Value) -> Result<Arc<dyn Middleware>, ResolveError>;
}

/// Resolves the compiled-in handlers.
#[derive(Debug, Default, Clone, Copy)]
pub struct BuiltinResolver;

impl HandlerResolver for BuiltinResolver {
    fn resolve(&self, kind: &str, _config: &Value) -> Result<Arc<dyn Middleware>, ResolveError> {
        match kind {
            "request-logger" => Ok(Arc::new(RequestLogger)),
            "header-injection" => Ok(Arc::new(HeaderInjection)),
            other => Err(ResolveError::UnknownKind(other.to_string())),
        }
    }
}

/// Keeps the chain in line with the configured middleware list.
pub struct ChainLoader {
    chain: Arc<MiddlewareChain>,
    resolver: Arc<dyn HandlerResolver>,
    /// Kind of every entry this loader registered.
    managed: DashMap<String, String>,
}

impl ChainLoader {
    pub fn new(chain: Arc<MiddlewareChain>, resolver: Arc<dyn HandlerResolver>) -> Self {
        Self {
            chain,
            resolver,
            managed: DashMap::new(),
        }
    }

    /// Register, update and unregister entries so the chain matches `configs`.
    ///
    /// Entries registered by other means (the admin surface) are left alone.
    /// Every definition is attempted; the errors are returned together.
    pub fn reconcile(&self, configs: &[MiddlewareConfig]) -> Vec<(String, ResolveError)> {
        let mut errors = Vec::new();

        let stale: Vec<String> = self
            .managed
            .iter()
            .filter(|m| !configs.iter().any(|c| &c.name == m.key()))
            .map(|m| m.key().clone())
            .collect();
        for name in stale {
            self.managed.remove(&name);
            match self.chain.unregister(&name) {
                Ok(()) | Err(GatewayError::NotFound { .. }) => {}
                Err(e) => errors.push((name, e.into())),
            }
        }

        for config in configs {
            if let Err(e) = self.apply(config) {
                tracing::warn!(middleware = %config.name, error = %e, "Failed to apply middleware definition");
                errors.push((config.name.clone(), e));
            }
        }
        errors
    }

    fn apply(&self, config: &MiddlewareConfig) -> Result<(), ResolveError> {
        let same_kind = self
            .managed
            .get(&config.name)
            .is_some_and(|kind| kind.value() == &config.kind);

        let Some(entry) = self.chain.get(&config.name).filter(|_| same_kind) else {
            // New, or its kind changed: (re)register with a fresh handler.
            let handler = self.resolver.resolve(&config.kind, &config.config)?;
            if self.managed.contains_key(&config.name) && self.chain.contains(&config.name) {
                self.chain.unregister(&config.name)?;
            }
            self.chain.register(
                &config.name,
                handler,
                config.priority,
                config.routes.clone(),
                &config.phase,
                config.config.clone(),
            )?;
            if !config.enabled {
                self.chain.set_enabled(&config.name, false)?;
            }
            self.managed.insert(config.name.clone(), config.kind.clone());
            return Ok(());
        };

        let current = entry.settings();
        if i64::from(current.priority) != config.priority {
            self.chain.update_priority(&config.name, config.priority)?;
        }
        if current.routes != config.routes {
            self.chain.update_routes(&config.name, config.routes.clone())?;
        }
        if current.phase.as_str() != config.phase {
            self.chain.update_phase(&config.name, &config.phase)?;
        }
        if current.config != config.config {
            self.chain.update_config(&config.name, config.config.clone())?;
        }
        if current.enabled != config.enabled {
            self.chain.set_enabled(&config.name, config.enabled)?;
        }
        Ok(())
    }
}

impl std::fmt::Debug for ChainLoader {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChainLoader")
            .field("managed", &self.managed.len())
            .finish()
    }
}
