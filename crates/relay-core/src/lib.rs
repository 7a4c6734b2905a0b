//! # tenvis-relay-core
//!
//! Tenant broker links, socket fan-out and event routing for the relay.
//!
//! This crate provides the building blocks behind the HTTP front door:
//!
//! - **Store** - Durable tenant to broker config mapping
//! - **Link** - One tenant's broker session (`MqttLink` over `rumqttc`)
//! - **Manager** - At most one link per tenant, created lazily
//! - **Hub** - Live push sockets grouped by tenant
//! - **Router** - Routes submitted and broker events to sockets and brokers
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────┐     ┌─────────────┐     ┌─────────────┐
//! │ Front door  │────▶│ EventRouter │────▶│  SocketHub  │
//! └─────────────┘     └─────────────┘     └─────────────┘
//!                        │      ▲
//!                        ▼      │ inbound queue
//!                 ┌─────────────┐     ┌─────────────┐
//!                 │   Manager   │────▶│ BrokerLink  │
//!                 └─────────────┘     └─────────────┘
//! ```

pub mod enrich;
pub mod hub;
pub mod link;
pub mod manager;
pub mod mqtt;
pub mod router;
pub mod store;
pub mod tenant;

pub use hub::{BroadcastReport, HubConfig, HubStats, SocketHub};
pub use link::{
    inbound_channel, BrokerLink, InboundSender, LinkError, LinkEvent, LinkFactory,
    DEFAULT_INBOUND_CAPACITY,
};
pub use manager::{ManagerError, TenantConnectionManager};
pub use mqtt::{MqttLink, MqttLinkFactory, MqttSettings};
pub use router::{EventRouter, SubmitReport};
pub use store::{BrokerConfigStore, ConfigMedium, JsonFileMedium, MemoryMedium, StoreError};
pub use tenant::TenantKey;
