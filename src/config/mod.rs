//! Configuration management subsystem.
//!
//! # Data Flow
//! ```text
//! config file (TOML)
//!     → loader.rs (parse & deserialize)
//!     → validation.rs (semantic checks)
//!     → GatewayConfig (validated)
//!     → AppState::apply_config
//!
//! On file change:
//!     watcher.rs detects change
//!     → loader.rs loads and validates the new config
//!     → mpsc channel → server applies routes and middleware in place
//! ```
//!
//! # Design Decisions
//! - A config is applied whole or not at all; invalid reloads are logged and dropped
//! - All fields have defaults to allow minimal configs
//! - Validation separates syntactic (serde) from semantic checks

pub mod loader;
pub mod schema;
pub mod validation;
pub mod watcher;

pub use loader::{load_config, parse_config, ConfigError};
pub use schema::{GatewayConfig, MiddlewareConfig, ServiceConfig, TargetConfig};
pub use validation::{validate_config, ValidationError};
pub use watcher::ConfigWatcher;
