//! HTTP protocol handling subsystem.
//!
//! # Data Flow
//! ```text
//! TCP connection
//!     → server.rs (Axum setup, ambient layers, phase execution)
//!     → request.rs (request ID, body buffering, upstream request)
//!     → forwarder.rs (target selection, breaker, timeout, retries)
//!     → response.rs (client response headers)
//!     → Send to client
//! ```

pub mod forwarder;
pub mod request;
pub mod response;
pub mod server;

pub use forwarder::Forwarder;
pub use request::X_REQUEST_ID;
pub use server::{AppState, HttpServer};
