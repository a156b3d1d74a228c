use parking_lot::RwLock;
use std::{sync::Arc, time::Duration};
use tracing::{debug, info, warn};

use crate::{
    channel::Channel,
    error::{AntError, Result},
    event::{EventDispatcher, Listener, ListenerId},
    protocol::{Capabilities, Message, MessageId},
    transport::{SerialTransport, Transport, UsbTransport},
    types::{EventCode, Network, NodeConfig, SerialParams, UsbParams},
};

/// One ANT dongle: its event dispatcher, network table and channel pool
///
/// # Examples
///
/// ```no_run
/// use ant_sensors::{ChannelId, ChannelType, Network, Node, NodeConfig, SerialParams};
///
/// #[tokio::main]
/// async fn main() -> Result<(), Box<dyn std::error::Error>> {
///     let node = Node::serial(SerialParams::default(), NodeConfig::default());
///     node.start().await?;
///
///     let mut network = Network::ant_plus();
///     node.set_network_key(0, &mut network).await?;
///
///     let channel = node.acquire_channel()?;
///     channel.assign(&network, ChannelType::TwoWayReceive).await?;
///     channel.set_id(ChannelId::wildcard(0x78)).await?;
///     channel.set_rf_freq(57).await?;
///     channel.set_period(8070).await?;
///     channel.open().await?;
///
///     node.stop().await?;
///     Ok(())
/// }
/// ```
pub struct Node {
    dispatcher: Arc<EventDispatcher>,
    networks: RwLock<Vec<Option<Network>>>,
    channels: RwLock<Vec<Arc<Channel>>>,
    capabilities: RwLock<Option<Capabilities>>,
}

impl Node {
    /// Create a node over any transport; nothing is sent until [`Self::start`]
    #[must_use]
    pub fn new(transport: Box<dyn Transport>, config: NodeConfig) -> Self {
        Self {
            dispatcher: Arc::new(EventDispatcher::new(transport, config)),
            networks: RwLock::new(Vec::new()),
            channels: RwLock::new(Vec::new()),
            capabilities: RwLock::new(None),
        }
    }

    /// Create a node for a USB-serial dongle
    #[must_use]
    pub fn serial(params: SerialParams, config: NodeConfig) -> Self {
        Self::new(Box::new(SerialTransport::new(params)), config)
    }

    /// Create a node for an ANT USB stick
    #[must_use]
    pub fn usb(params: UsbParams, config: NodeConfig) -> Self {
        Self::new(Box::new(UsbTransport::new(params)), config)
    }

    /// Timing configuration
    #[must_use]
    pub fn config(&self) -> &NodeConfig {
        self.dispatcher.config()
    }

    /// Whether the node has been started and not stopped
    #[must_use]
    pub fn is_running(&self) -> bool {
        self.dispatcher.is_running()
    }

    /// Read error that stopped the node on its own, if any
    #[must_use]
    pub fn last_failure(&self) -> Option<String> {
        self.dispatcher.last_failure()
    }

    /// Start the dispatcher, reset the dongle and size the channel pool from
    /// its capabilities
    ///
    /// A dongle that never sends a startup frame after reset is tolerated.
    ///
    /// # Errors
    ///
    /// Returns [`AntError::NodeAlreadyRunning`] if already started, the
    /// transport's error if it cannot be opened, or [`AntError::WaitTimeout`]
    /// if the dongle does not report its capabilities. On error the node is
    /// stopped again.
    pub async fn start(&self) -> Result<()> {
        self.dispatcher.start().await?;

        if let Err(e) = self.initialize().await {
            warn!("Node start failed: {}", e);
            if let Err(stop_error) = self.dispatcher.stop().await {
                warn!("Stopping after failed start also failed: {}", stop_error);
            }
            return Err(e);
        }

        Ok(())
    }

    async fn initialize(&self) -> Result<()> {
        let config = self.config().clone();

        self.dispatcher.write(&Message::SystemReset).await?;
        if config.wait_for_startup {
            match self
                .dispatcher
                .wait_for_message_type(
                    MessageId::Startup as u8,
                    Duration::from_millis(config.startup_timeout_ms),
                )
                .await
            {
                Ok(Message::Startup { reason }) => {
                    debug!("Dongle started (reason 0x{:02X})", reason);
                }
                Ok(_) => {}
                Err(e) if e.is_timeout() => warn!("No startup frame after reset, continuing"),
                Err(e) => return Err(e),
            }
        }

        self.dispatcher
            .write(&Message::request(0, MessageId::Capabilities))
            .await?;
        let capabilities = match self
            .dispatcher
            .wait_for_message_type(
                MessageId::Capabilities as u8,
                Duration::from_millis(config.message_timeout_ms),
            )
            .await?
        {
            Message::Capabilities(capabilities) => capabilities,
            other => {
                return Err(AntError::Malformed(format!(
                    "expected capabilities, got {other}"
                )))
            }
        };

        *self.channels.write() = (0..capabilities.max_channels)
            .map(|number| Arc::new(Channel::new(number, self.dispatcher.clone())))
            .collect();
        *self.networks.write() = vec![None; usize::from(capabilities.max_networks)];
        *self.capabilities.write() = Some(capabilities);

        info!(
            "ANT node started: {} channels, {} networks",
            capabilities.max_channels, capabilities.max_networks
        );
        Ok(())
    }

    /// Reset the dongle and stop the dispatcher
    ///
    /// The reset is not acknowledged, so it is sent without waiting.
    ///
    /// # Errors
    ///
    /// Returns the transport's error if it cannot be closed.
    pub async fn stop(&self) -> Result<()> {
        if self.is_running() {
            if let Err(e) = self.dispatcher.write(&Message::SystemReset).await {
                warn!("Reset before stop failed: {}", e);
            }
        }

        self.dispatcher.stop().await?;
        info!("ANT node stopped");
        Ok(())
    }

    /// Capabilities reported at start
    #[must_use]
    pub fn capabilities(&self) -> Option<Capabilities> {
        *self.capabilities.read()
    }

    /// Every channel in the pool
    #[must_use]
    pub fn channels(&self) -> Vec<Arc<Channel>> {
        self.channels.read().clone()
    }

    /// Networks configured so far, indexed by network number
    #[must_use]
    pub fn networks(&self) -> Vec<Option<Network>> {
        self.networks.read().clone()
    }

    /// Install `network`'s key as network `number` and record the number on it
    ///
    /// # Errors
    ///
    /// Returns [`AntError::InvalidParameters`] if `number` is beyond the
    /// dongle's network count, [`AntError::ChannelConfig`] if the dongle
    /// rejects the key, or [`AntError::WaitTimeout`] if it never answers.
    pub async fn set_network_key(&self, number: u8, network: &mut Network) -> Result<()> {
        let available = self.networks.read().len();
        if usize::from(number) >= available {
            return Err(AntError::InvalidParameters(format!(
                "network {number} is out of range, the dongle has {available}"
            )));
        }

        let ack = self
            .dispatcher
            .write_and_wait_for_ack(
                &Message::NetworkKey {
                    network: number,
                    key: network.key,
                },
                Duration::from_millis(self.config().ack_timeout_ms),
            )
            .await?;

        if let Message::ChannelEvent(event) = &ack {
            if event.event_code() != EventCode::NoError {
                return Err(AntError::ChannelConfig {
                    operation: "set network key",
                    channel: number,
                    code: event.code,
                });
            }
        }

        network.number = number;
        if let Some(slot) = self.networks.write().get_mut(usize::from(number)) {
            *slot = Some(network.clone());
        }
        info!("Network {} set to {}", number, network);
        Ok(())
    }

    /// Claim the first channel no profile is using
    ///
    /// # Errors
    ///
    /// Returns [`AntError::NodeNotRunning`] before start, or
    /// [`AntError::NoFreeChannel`] when every channel is claimed.
    pub fn acquire_channel(&self) -> Result<Arc<Channel>> {
        let channels = self.channels.read();
        if channels.is_empty() {
            return Err(AntError::NodeNotRunning);
        }

        channels
            .iter()
            .find(|channel| !channel.is_assigned() && channel.try_claim())
            .cloned()
            .ok_or(AntError::NoFreeChannel)
    }

    /// Send a frame without waiting for a response
    ///
    /// # Errors
    ///
    /// Returns [`AntError::NodeNotRunning`] before start, or a codec or
    /// transport error.
    pub async fn send(&self, message: &Message) -> Result<()> {
        self.dispatcher.write(message).await
    }

    /// Register a listener that sees every decoded frame
    pub async fn register_listener(&self, listener: Arc<dyn Listener>) -> ListenerId {
        self.dispatcher.register_listener(listener).await
    }

    /// Remove a listener registered with [`Self::register_listener`]
    pub async fn remove_listener(&self, id: ListenerId) -> bool {
        self.dispatcher.remove_listener(id).await
    }

    /// Firmware version string of the dongle
    ///
    /// # Errors
    ///
    /// Returns [`AntError::WaitTimeout`] if the dongle does not answer.
    pub async fn version(&self) -> Result<String> {
        match self.request(MessageId::Version).await? {
            Message::Version { version } => Ok(String::from_utf8_lossy(&version)
                .trim_end_matches('\0')
                .to_string()),
            other => Err(AntError::Malformed(format!("expected version, got {other}"))),
        }
    }

    /// Serial number of the dongle
    ///
    /// # Errors
    ///
    /// Returns [`AntError::WaitTimeout`] if the dongle does not answer.
    pub async fn serial_number(&self) -> Result<u32> {
        match self.request(MessageId::SerialNumber).await? {
            Message::SerialNumber { serial } => Ok(u32::from_le_bytes(serial)),
            other => Err(AntError::Malformed(format!(
                "expected serial number, got {other}"
            ))),
        }
    }

    async fn request(&self, message_id: MessageId) -> Result<Message> {
        self.dispatcher
            .write(&Message::request(0, message_id))
            .await?;
        self.dispatcher
            .wait_for_message_type(
                message_id as u8,
                Duration::from_millis(self.config().message_timeout_ms),
            )
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::MockTransport;
    use tokio_test::assert_ok;

    fn quick_config() -> NodeConfig {
        NodeConfig {
            ack_timeout_ms: 200,
            message_timeout_ms: 200,
            startup_timeout_ms: 50,
            ..NodeConfig::default()
        }
    }

    #[tokio::test]
    async fn test_start_sizes_pools_from_capabilities() {
        let mock = MockTransport::new().with_channels(4);
        let node = Node::new(Box::new(mock.clone()), quick_config());

        assert_ok!(node.start().await);
        assert!(node.is_running());
        assert_eq!(node.channels().len(), 4);
        assert_eq!(node.networks().len(), 3);
        assert_eq!(node.capabilities().map(|caps| caps.max_channels), Some(4));

        let types: Vec<u8> = mock.written().iter().map(Message::msg_type).collect();
        assert_eq!(types, vec![0x4A, 0x4D]);

        assert_ok!(node.stop().await);
        assert!(!node.is_running());
        assert!(!mock.is_open());
        assert_eq!(mock.written_of_type(MessageId::SystemReset).len(), 2);
    }

    #[tokio::test]
    async fn test_start_tolerates_missing_startup_frame() {
        let mock = MockTransport::new().without_startup();
        let node = Node::new(Box::new(mock), quick_config());

        assert_ok!(node.start().await);
        assert_eq!(node.channels().len(), 8);
        assert_ok!(node.stop().await);
    }

    #[tokio::test]
    async fn test_start_fails_without_capabilities() {
        let mock = MockTransport::new().silent();
        let node = Node::new(Box::new(mock.clone()), quick_config());

        let result = node.start().await;
        assert!(matches!(result, Err(AntError::WaitTimeout { .. })));
        assert!(!node.is_running());
        assert!(!mock.is_open());
    }

    #[tokio::test]
    async fn test_set_network_key() {
        let mock = MockTransport::new();
        let node = Node::new(Box::new(mock.clone()), quick_config());
        assert_ok!(node.start().await);

        let mut network = Network::ant_plus();
        assert_ok!(node.set_network_key(1, &mut network).await);
        assert_eq!(network.number, 1);
        assert_eq!(node.networks()[1], Some(network.clone()));

        let mut out_of_range = Network::ant_plus();
        assert!(matches!(
            node.set_network_key(3, &mut out_of_range).await,
            Err(AntError::InvalidParameters(_))
        ));

        mock.reject(MessageId::NetworkKey, 0x29);
        assert!(matches!(
            node.set_network_key(0, &mut network).await,
            Err(AntError::ChannelConfig { code: 0x29, .. })
        ));

        assert_ok!(node.stop().await);
    }

    #[tokio::test]
    async fn test_acquire_channel_claims_each_channel_once() {
        let mock = MockTransport::new().with_channels(2);
        let node = Node::new(Box::new(mock), quick_config());

        assert!(matches!(
            node.acquire_channel(),
            Err(AntError::NodeNotRunning)
        ));
        assert_ok!(node.start().await);

        let first = node.acquire_channel().unwrap();
        let second = node.acquire_channel().unwrap();
        assert_ne!(first.number(), second.number());
        assert!(matches!(node.acquire_channel(), Err(AntError::NoFreeChannel)));

        first.release();
        assert_eq!(node.acquire_channel().unwrap().number(), first.number());

        assert_ok!(node.stop().await);
    }

    #[tokio::test]
    async fn test_version_and_serial_number() {
        let mock = MockTransport::new();
        let node = Node::new(Box::new(mock), quick_config());
        assert_ok!(node.start().await);

        assert_eq!(node.version().await.unwrap(), "AJK3.10");
        assert_eq!(node.serial_number().await.unwrap(), 0x1234_5678);

        assert_ok!(node.stop().await);
    }

    #[tokio::test]
    async fn test_send_requires_running_node() {
        let node = Node::new(Box::new(MockTransport::new()), quick_config());
        assert!(matches!(
            node.send(&Message::SystemReset).await,
            Err(AntError::NodeNotRunning)
        ));
    }
}
