//! # CIVITAS - Citizen Data Edge Service
//!
//! A read-through / write-behind cache and merge layer between an HTTP API
//! and two slower systems of record: a document store holding authoritative
//! base citizen data and a collection of citizen-declared overrides.
//!
//! ## Architecture
//!
//! - `kv`: typed client layer over the external key/value store
//! - `store`: document-store gateway with optimistic-version upserts
//! - `cache`: two-tier cache, negative caching, degraded-mode serving
//! - `queue`: durable write-behind FIFOs and the worker pool draining them
//! - `merge`: pure base+overlay merge with provenance and freshness
//! - `profile`: staged write state machine for overlay and user config
//! - `verify`: phone verification (issue/confirm/cancel, rate-limited)
//! - `monitor`: metrics aggregation and the degraded-mode controller
//! - `api`: axum routes, auth middleware, response mapping

#![warn(clippy::all)]

// Core plumbing
pub mod config;
pub mod error;
pub mod models;

// External stores
pub mod kv;
pub mod store;

// Cache and write-behind
pub mod cache;
pub mod queue;

// Domain engines
pub mod merge;
pub mod profile;
pub mod verify;

// Cross-cutting
pub mod audit;
pub mod monitor;
pub mod notifier;

// Surface and wiring
pub mod api;
pub mod app;

// Re-export commonly used types
pub use app::{App, AppContext};
pub use config::ServiceConfig;
pub use error::{ServiceError, ServiceResult};

/// Re-export version information
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Re-export crate name
pub const NAME: &str = env!("CARGO_PKG_NAME");
