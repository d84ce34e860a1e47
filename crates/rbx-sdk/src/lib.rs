// File: `crates/rbx-sdk/src/lib.rs`
//! # rbx-sdk
//!
//! Client SDK for Replibox: live databox replicas and channel subscriptions
//! that survive an unreliable, reconnecting transport.
//!
//! # Quick Start
//!
//! ```rust
//! use rbx_sdk::prelude::*;
//! use serde_json::json;
//! use std::sync::Arc;
//!
//! # #[tokio::main(flavor = "current_thread")]
//! # async fn main() -> rbx_sdk::Result<()> {
//! // Stand-in server answering the connect handshake and fetches.
//! let transport = Arc::new(MemoryTransport::new().with_responder(|event, _payload| {
//!     Ok(match event {
//!         ">D" => json!({"ci": 0, "i": "in", "o": "out", "d": {"___o___": {"a": 1}}}),
//!         _ => json!({"c": 1, "d": {"___o___": {"b": 2}}}),
//!     })
//! }));
//! let client = Client::new(transport, ClientConfig::default());
//!
//! let databox = client.databox("profiles", DataboxConfig::default());
//! databox.connect().await?;
//! databox.fetch(json!({})).await?;
//!
//! assert_eq!(databox.data(), json!({"a": 1, "b": 2}));
//! # Ok(())
//! # }
//! ```
//!
//! # Architecture
//!
//! - [`transport`] - Transport boundary and an in-memory transport
//! - [`connection`] - Connect-timeout policies and acknowledged requests
//! - [`databox`] - Databox session over a [`rbx_core::Head`] replica
//! - [`state`] - Databox lifecycle state machine
//! - [`reload`] - Replay-or-resnapshot strategies after a reconnect
//! - [`channel`] - Reference-counted channel subscriptions
//! - [`protocol`] - Wire shapes
//! - [`config`] - Client and databox configuration
//! - [`error`] - Error types

pub mod channel;
pub mod client;
pub mod config;
pub mod connection;
pub mod databox;
pub mod error;
pub mod protocol;
pub mod reload;
pub mod state;
pub mod transport;

// Re-exports for convenience
pub use channel::{Channel, ChannelEngine, ChannelEvent, ChannelId, HandleId, SubscribeRequest};
pub use client::Client;
pub use config::{ClientConfig, ClientConfigBuilder, DataboxConfig, DataboxConfigBuilder};
pub use connection::{AbortTrigger, ConnectTimeout};
pub use databox::{Databox, DataboxEvent, FetchOutcome};
pub use error::{ClientError, Result, TimeoutKind};
pub use protocol::SessionTarget;
pub use reload::{
    AlwaysResnapshot, CudHistory, GapInfo, HistoryReload, ReloadDecision, ReloadStrategy,
    TimeWindowReload,
};
pub use state::DataboxState;
pub use transport::{MemoryTransport, RecordedRequest, Transport, TransportError, TransportEvent};

// Re-export commonly used types of the replica and cud crates
pub use rbx_core::{Comparator, ComponentOptions, Head, Node, ValueMerger};
pub use rbx_cud::{CudApplied, CudId, CudOperation, CudPackage, DbQuery};

/// Prelude module for convenient imports.
pub mod prelude {
    pub use crate::channel::{Channel, ChannelEvent, ChannelId, SubscribeRequest};
    pub use crate::client::Client;
    pub use crate::config::{ClientConfig, DataboxConfig, DataboxConfigBuilder};
    pub use crate::connection::ConnectTimeout;
    pub use crate::databox::{Databox, DataboxEvent};
    pub use crate::error::ClientError;
    pub use crate::transport::{MemoryTransport, Transport};
}
