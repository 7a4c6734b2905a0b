//! # Relay Server
//!
//! HTTP and WebSocket front door for the multi-tenant event relay.
//!
//! Tenants authenticate with a key from the key file, listen on `/ws` and
//! submit events through `/api/*`. Each tenant's events are relayed to and from
//! its own MQTT broker.

pub mod auth;
pub mod config;
pub mod error;
pub mod handlers;
pub mod metrics;

pub use auth::KeyRegistry;
pub use config::Config;
pub use error::ApiError;
pub use handlers::{build_app, run_server, AppState};
