//! Client and databox configuration.

use crate::connection::ConnectTimeout;
use crate::reload::{HistoryReload, ReloadStrategy};
use rbx_core::{Comparator, ComponentOptions, ValueMerger};
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;

/// Configuration for the Replibox client.
#[derive(Clone, Debug)]
pub struct ClientConfig {
    /// Policy for actions that need a connection, such as subscribing.
    pub connect_timeout: ConnectTimeout,
    /// Policy for databox connects and fetches.
    pub databox_connect_timeout: ConnectTimeout,
    /// How long to wait for a server acknowledgement.
    pub response_timeout: Duration,
    /// Capacity of the event channels handed to consumers.
    pub event_buffer: usize,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            connect_timeout: ConnectTimeout::After(Duration::from_secs(3)),
            databox_connect_timeout: ConnectTimeout::After(Duration::from_secs(3)),
            response_timeout: Duration::from_secs(10),
            event_buffer: 256,
        }
    }
}

/// Builder for client configuration.
pub struct ClientConfigBuilder {
    config: ClientConfig,
}

impl ClientConfigBuilder {
    pub fn new() -> Self {
        Self {
            config: ClientConfig::default(),
        }
    }

    pub fn connect_timeout(mut self, policy: ConnectTimeout) -> Self {
        self.config.connect_timeout = policy;
        self
    }

    pub fn databox_connect_timeout(mut self, policy: ConnectTimeout) -> Self {
        self.config.databox_connect_timeout = policy;
        self
    }

    pub fn response_timeout(mut self, timeout: Duration) -> Self {
        self.config.response_timeout = timeout;
        self
    }

    pub fn event_buffer(mut self, capacity: usize) -> Self {
        self.config.event_buffer = capacity.max(1);
        self
    }

    pub fn build(self) -> ClientConfig {
        self.config
    }
}

impl Default for ClientConfigBuilder {
    fn default() -> Self {
        Self::new()
    }
}

/// Configuration of one databox.
#[derive(Clone, Debug)]
pub struct DataboxConfig {
    /// Member key for databox families.
    pub member: Option<String>,
    pub api_level: Option<u32>,
    /// Input forwarded to the server with the connect request.
    pub init_input: Option<Value>,
    /// Send the last session token on reconnect to restore the fetch position.
    pub token_restore: bool,
    /// Overrides the client-wide databox connect policy.
    pub connect_timeout: ConnectTimeout,
    pub comparator: Option<Comparator>,
    pub value_merger: Option<ValueMerger>,
    pub reload_strategy: Arc<dyn ReloadStrategy>,
}

impl DataboxConfig {
    /// Tree-wide component options derived from this configuration.
    pub fn component_options(&self) -> ComponentOptions {
        ComponentOptions {
            comparator: self.comparator.clone(),
            value_merger: self.value_merger.clone(),
        }
    }
}

impl Default for DataboxConfig {
    fn default() -> Self {
        Self {
            member: None,
            api_level: None,
            init_input: None,
            token_restore: true,
            connect_timeout: ConnectTimeout::Default,
            comparator: None,
            value_merger: None,
            reload_strategy: Arc::new(HistoryReload),
        }
    }
}

/// Builder for databox configuration.
pub struct DataboxConfigBuilder {
    config: DataboxConfig,
}

impl DataboxConfigBuilder {
    pub fn new() -> Self {
        Self {
            config: DataboxConfig::default(),
        }
    }

    pub fn member(mut self, member: impl Into<String>) -> Self {
        self.config.member = Some(member.into());
        self
    }

    pub fn api_level(mut self, level: u32) -> Self {
        self.config.api_level = Some(level);
        self
    }

    pub fn init_input(mut self, input: Value) -> Self {
        self.config.init_input = Some(input);
        self
    }

    pub fn token_restore(mut self, enabled: bool) -> Self {
        self.config.token_restore = enabled;
        self
    }

    pub fn connect_timeout(mut self, policy: ConnectTimeout) -> Self {
        self.config.connect_timeout = policy;
        self
    }

    pub fn comparator(mut self, comparator: Comparator) -> Self {
        self.config.comparator = Some(comparator);
        self
    }

    pub fn value_merger(mut self, merger: ValueMerger) -> Self {
        self.config.value_merger = Some(merger);
        self
    }

    pub fn reload_strategy(mut self, strategy: impl ReloadStrategy + 'static) -> Self {
        self.config.reload_strategy = Arc::new(strategy);
        self
    }

    pub fn build(self) -> DataboxConfig {
        self.config
    }
}

impl Default for DataboxConfigBuilder {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::reload::AlwaysResnapshot;
    use serde_json::json;

    #[test]
    fn test_client_config_builder() {
        let config = ClientConfigBuilder::new()
            .connect_timeout(ConnectTimeout::Fail)
            .response_timeout(Duration::from_millis(500))
            .event_buffer(0)
            .build();

        assert!(matches!(config.connect_timeout, ConnectTimeout::Fail));
        assert!(matches!(config.databox_connect_timeout, ConnectTimeout::After(_)));
        assert_eq!(config.response_timeout, Duration::from_millis(500));
        assert_eq!(config.event_buffer, 1);
    }

    #[test]
    fn test_databox_config_builder() {
        let config = DataboxConfigBuilder::new()
            .member("room-1")
            .api_level(2)
            .init_input(json!({"limit": 10}))
            .comparator(Comparator::ascending())
            .reload_strategy(AlwaysResnapshot)
            .build();

        assert_eq!(config.member.as_deref(), Some("room-1"));
        assert_eq!(config.api_level, Some(2));
        assert!(config.component_options().comparator.is_some());
        assert!(config.token_restore);
        assert!(format!("{:?}", config.reload_strategy).contains("AlwaysResnapshot"));
    }
}
