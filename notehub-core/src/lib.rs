//! # notehub-core
//!
//! Shared foundation for the notehub control plane: configuration, error
//! types, the domain model, the Postgres-backed store and the typed HTTP
//! clients for sibling services (auth, compute manager, resource monitor).
//!
//! The two binaries — the orchestrator and the sync relay — both build on
//! this crate and nothing here spawns a listener of its own.

pub mod cache;
pub mod clients;
pub mod config;
pub mod error;
pub mod model;
pub mod observability;
pub mod store;

pub use cache::TokenCache;
pub use config::{Config, SyncMode};
pub use error::{Error, Result};
pub use store::PostgresStore;
