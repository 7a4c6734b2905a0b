//! # relay-protocol
//!
//! Wire types for the Relay multi-tenant event relay.
//!
//! Everything that crosses a process boundary is defined here:
//!
//! - `Event` - The `{type, data}` envelope relayed between HTTP ingestion,
//!   the tenant's MQTT broker and the tenant's push sockets
//! - `BrokerConfig` - A tenant's broker connection settings, including
//!   per-event-type topic overrides
//! - `codec` - JSON encoding/decoding with size limits
//!
//! ## Example
//!
//! ```rust
//! use relay_protocol::{codec, Event};
//! use serde_json::json;
//!
//! let event = Event::new("arrival", json!({"status": "ST-M1003"}));
//!
//! let encoded = codec::encode(&event).unwrap();
//! let decoded = codec::decode(&encoded).unwrap();
//! assert_eq!(event, decoded);
//! ```

pub mod broker;
pub mod codec;
pub mod event;

pub use broker::BrokerConfig;
pub use codec::{decode, encode, ProtocolError};
pub use event::{Event, LinkStatus};
