//! High-level client for the Replibox SDK.

use crate::channel::{Channel, ChannelEngine};
use crate::config::{ClientConfig, DataboxConfig};
use crate::connection::{ensure_connected, ConnectTimeout};
use crate::databox::Databox;
use crate::error::Result;
use crate::transport::{MemoryTransport, Transport};
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::warn;

type DataboxKey = (String, Option<String>);

/// The Replibox client.
///
/// Owns the transport, one channel engine and the databoxes created through
/// it.
///
/// # Example
///
/// ```rust
/// use rbx_sdk::{Client, ClientConfig, DataboxConfigBuilder};
///
/// let client = Client::new_with_memory_transport(ClientConfig::default());
/// let profiles = client.databox("profiles", DataboxConfigBuilder::new().member("eu").build());
///
/// assert_eq!(profiles.identifier(), "profiles");
/// assert!(!profiles.is_connected());
/// ```
pub struct Client<T: Transport> {
    config: ClientConfig,
    transport: Arc<T>,
    channels: Arc<ChannelEngine<T>>,
    channels_attached: AtomicBool,
    databoxes: RwLock<HashMap<DataboxKey, Databox<T>>>,
}

impl Client<MemoryTransport> {
    /// Create a client over a fresh in-memory transport.
    pub fn new_with_memory_transport(config: ClientConfig) -> Self {
        Self::new(Arc::new(MemoryTransport::new()), config)
    }
}

impl<T: Transport> Client<T> {
    pub fn new(transport: Arc<T>, config: ClientConfig) -> Self {
        let channels = Arc::new(ChannelEngine::new(Arc::clone(&transport), &config));
        Self {
            config,
            transport,
            channels,
            channels_attached: AtomicBool::new(false),
            databoxes: RwLock::new(HashMap::new()),
        }
    }

    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    pub fn transport(&self) -> &Arc<T> {
        &self.transport
    }

    pub fn channel_engine(&self) -> &Arc<ChannelEngine<T>> {
        &self.channels
    }

    /// Connect the transport under the given policy.
    pub async fn connect(&self, policy: ConnectTimeout) -> Result<()> {
        ensure_connected(&self.transport, policy.resolve(&self.config.connect_timeout)).await
    }

    /// Get the databox for `identifier` and the configured member, creating
    /// it on first use.
    ///
    /// An existing databox keeps the configuration it was created with.
    pub fn databox(&self, identifier: impl Into<String>, config: DataboxConfig) -> Databox<T> {
        let key = (identifier.into(), config.member.clone());
        let mut databoxes = self.databoxes.write();
        databoxes
            .entry(key)
            .or_insert_with_key(|(identifier, _)| {
                Databox::new(identifier.clone(), Arc::clone(&self.transport), config, &self.config)
            })
            .clone()
    }

    /// Identifiers and members of all databoxes created so far.
    pub fn databox_keys(&self) -> Vec<DataboxKey> {
        let mut keys: Vec<DataboxKey> = self.databoxes.read().keys().cloned().collect();
        keys.sort();
        keys
    }

    /// Create a channel handle.
    ///
    /// The channel engine starts listening to the transport with the first
    /// handle, so it must be called inside a tokio runtime.
    pub fn channel(&self) -> Channel<T> {
        if !self.channels_attached.swap(true, Ordering::SeqCst) {
            self.channels.attach();
        }
        Channel::new(Arc::clone(&self.channels))
    }

    /// Disconnect every databox; returns how many were disconnected cleanly.
    pub async fn disconnect_all_databoxes(&self) -> usize {
        let databoxes: Vec<Databox<T>> = self.databoxes.read().values().cloned().collect();
        let mut disconnected = 0;
        for databox in databoxes {
            match databox.disconnect().await {
                Ok(()) => disconnected += 1,
                Err(err) => warn!(databox = %databox.identifier(), %err, "databox disconnect failed"),
            }
        }
        disconnected
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::DataboxConfigBuilder;
    use crate::state::DataboxState;

    #[test]
    fn test_databox_is_shared_per_member() {
        let client = Client::new_with_memory_transport(ClientConfig::default());

        let first = client.databox("rooms", DataboxConfig::default());
        let again = client.databox("rooms", DataboxConfig::default());
        let member = client.databox("rooms", DataboxConfigBuilder::new().member("eu").build());

        assert_eq!(first.state(), DataboxState::Disconnected);
        assert_eq!(again.identifier(), first.identifier());
        assert_eq!(member.member(), Some("eu"));
        assert_eq!(
            client.databox_keys(),
            vec![
                ("rooms".to_string(), None),
                ("rooms".to_string(), Some("eu".to_string()))
            ]
        );
    }

    #[tokio::test]
    async fn test_connect_uses_policy() {
        let client = Client::new_with_memory_transport(ClientConfig::default());
        tokio_test::assert_ok!(client.connect(ConnectTimeout::Default).await);
        assert!(client.transport().is_connected());
        assert_eq!(client.disconnect_all_databoxes().await, 0);
    }
}
