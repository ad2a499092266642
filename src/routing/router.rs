//! Service route table.
//!
//! # Responsibilities
//! - Map a request path to the service that owns it
//! - Hold per-service forwarding policy (timeout, retries, strategy)
//! - Publish route set replacements atomically
//!
//! # Design Decisions
//! - The table is an `ArcSwap` of an immutable route list; lookups never lock
//! - Longest matching prefix wins, so lookup is independent of config order

use std::sync::Arc;
use std::time::Duration;

use arc_swap::ArcSwap;

use crate::config::schema::{LoadBalancing, ServiceConfig};

/// A backend endpoint as declared on a service.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TargetSpec {
    pub address: String,
    pub weight: u32,
}

/// A service: a path prefix mapped to targets plus forwarding policy.
#[derive(Debug, Clone)]
pub struct ServiceRoute {
    pub name: String,
    pub path_prefix: String,
    pub targets: Vec<TargetSpec>,
    pub timeout: Duration,
    pub retry_count: u32,
    pub strategy: LoadBalancing,
    pub strip_prefix: bool,
}

impl ServiceRoute {
    pub fn from_config(config: &ServiceConfig) -> Self {
        Self {
            name: config.name.clone(),
            path_prefix: normalize_prefix(&config.path_prefix),
            targets: config
                .targets
                .iter()
                .map(|t| TargetSpec {
                    address: t.address.clone(),
                    weight: t.weight,
                })
                .collect(),
            timeout: Duration::from_millis(config.timeout_ms),
            retry_count: config.retry_count,
            strategy: config.load_balancing,
            strip_prefix: config.strip_prefix,
        }
    }

    /// Whether this route owns `path`.
    pub fn matches(&self, path: &str) -> bool {
        let prefix = self.path_prefix.as_str();
        prefix == "/"
            || path == prefix
            || (path.starts_with(prefix) && path.as_bytes().get(prefix.len()) == Some(&b'/'))
    }

    /// Path (and query) to send upstream.
    pub fn upstream_path(&self, path: &str, query: Option<&str>) -> String {
        let path = if self.strip_prefix && self.path_prefix != "/" {
            match path.strip_prefix(self.path_prefix.as_str()) {
                Some("") | None => "/",
                Some(rest) => rest,
            }
        } else {
            path
        };

        match query {
            Some(q) => format!("{path}?{q}"),
            None => path.to_string(),
        }
    }
}

fn normalize_prefix(prefix: &str) -> String {
    let trimmed = prefix.trim_end_matches('/');
    if trimmed.is_empty() {
        "/".to_string()
    } else {
        trimmed.to_string()
    }
}

/// The live route table.
#[derive(Debug)]
pub struct RouteTable {
    routes: ArcSwap<Vec<Arc<ServiceRoute>>>,
}

impl RouteTable {
    pub fn new() -> Self {
        Self {
            routes: ArcSwap::from_pointee(Vec::new()),
        }
    }

    pub fn from_config(services: &[ServiceConfig]) -> Self {
        let table = Self::new();
        table.replace(services.iter().map(ServiceRoute::from_config).collect());
        table
    }

    /// Atomically replace every route.
    pub fn replace(&self, routes: Vec<ServiceRoute>) -> Arc<Vec<Arc<ServiceRoute>>> {
        let routes: Arc<Vec<Arc<ServiceRoute>>> = Arc::new(routes.into_iter().map(Arc::new).collect());
        self.routes.store(routes.clone());
        routes
    }

    /// Find the service owning `path` (longest prefix wins).
    pub fn lookup(&self, path: &str) -> Option<Arc<ServiceRoute>> {
        self.routes
            .load()
            .iter()
            .filter(|r| r.matches(path))
            .max_by_key(|r| r.path_prefix.len())
            .cloned()
    }

    pub fn routes(&self) -> Arc<Vec<Arc<ServiceRoute>>> {
        self.routes.load_full()
    }
}

impl Default for RouteTable {
    fn default() -> Self {
        Self::new()
    }
}
