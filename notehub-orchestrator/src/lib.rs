//! # notehub-orchestrator
//!
//! The control plane process: accepts authenticated user traffic,
//! provisions per-user editor and runtime containers on demand,
//! reverse-proxies HTTP and WebSocket traffic to them, reacts to
//! resource-pressure and idle events, and supervises sibling services.

pub mod caddy;
pub mod containers;
pub mod events;
pub mod lifecycle;
pub mod proxy;
pub mod server;
pub mod session;
pub mod state;
pub mod supervisor;
pub mod ui;

pub use state::AppState;
