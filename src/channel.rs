use async_trait::async_trait;
use parking_lot::{Mutex as SyncMutex, RwLock};
use serde::{Deserialize, Serialize};
use std::{
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Weak,
    },
    time::Duration,
};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::{
    error::{AntError, Result},
    event::{EventDispatcher, Listener, ListenerId},
    protocol::{Message, MessageId},
    types::{ChannelId, ChannelType, EventCode, Network},
};

/// Values last accepted by the dongle for one channel
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChannelConfig {
    /// Network number the channel is assigned to
    pub network: Option<u8>,
    /// Channel type chosen at assignment
    pub channel_type: Option<ChannelType>,
    /// Channel ID to search for or transmit as
    pub id: Option<ChannelId>,
    /// RF frequency offset from 2400 MHz
    pub frequency: Option<u8>,
    /// Message period in 1/32768 s counts
    pub period: Option<u16>,
    /// Search timeout in 2.5 s counts
    pub search_timeout: Option<u8>,
    /// Transmit power level
    pub tx_power: Option<u8>,
}

/// One logical radio channel of a node
///
/// Every setter sends its configuration frame and waits for the dongle to
/// acknowledge it. `assign` must come first and `open` last.
pub struct Channel {
    number: u8,
    dispatcher: Arc<EventDispatcher>,
    config: RwLock<ChannelConfig>,
    claimed: AtomicBool,
    listeners: Mutex<Vec<(ListenerId, Arc<dyn Listener>)>>,
    registration: SyncMutex<Option<ListenerId>>,
}

/// Dispatcher listener that forwards frames for one channel
struct ChannelRelay(Weak<Channel>);

#[async_trait]
impl Listener for ChannelRelay {
    async fn process(&self, message: &Message) -> Result<()> {
        match self.0.upgrade() {
            Some(channel) if message.channel_number() == Some(channel.number) => {
                channel.forward(message).await;
                Ok(())
            }
            _ => Ok(()),
        }
    }
}

impl Channel {
    pub(crate) fn new(number: u8, dispatcher: Arc<EventDispatcher>) -> Self {
        Self {
            number,
            dispatcher,
            config: RwLock::new(ChannelConfig::default()),
            claimed: AtomicBool::new(false),
            listeners: Mutex::new(Vec::new()),
            registration: SyncMutex::new(None),
        }
    }

    /// Channel number on the node
    #[must_use]
    pub const fn number(&self) -> u8 {
        self.number
    }

    /// Snapshot of the cached configuration
    #[must_use]
    pub fn config(&self) -> ChannelConfig {
        self.config.read().clone()
    }

    /// Whether the channel has been assigned to a network
    #[must_use]
    pub fn is_assigned(&self) -> bool {
        self.config.read().network.is_some()
    }

    /// Whether the channel is open and forwarding frames
    #[must_use]
    pub fn is_open(&self) -> bool {
        self.registration.lock().is_some()
    }

    /// Whether a profile currently holds this channel
    #[must_use]
    pub fn is_claimed(&self) -> bool {
        self.claimed.load(Ordering::SeqCst)
    }

    pub(crate) fn try_claim(&self) -> bool {
        self.claimed
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
    }

    pub(crate) fn release(&self) {
        self.claimed.store(false, Ordering::SeqCst);
    }

    /// Register a listener for frames addressed to this channel while it is open
    pub async fn register_listener(&self, listener: Arc<dyn Listener>) -> ListenerId {
        let id = ListenerId::new();
        self.listeners.lock().await.push((id, listener));
        id
    }

    /// Remove a channel listener; returns whether it was registered
    pub async fn remove_listener(&self, id: ListenerId) -> bool {
        let mut listeners = self.listeners.lock().await;
        let before = listeners.len();
        listeners.retain(|(registered, _)| *registered != id);
        listeners.len() != before
    }

    async fn forward(&self, message: &Message) {
        let listeners = self.listeners.lock().await;
        for (id, listener) in listeners.iter() {
            if let Err(e) = listener.process(message).await {
                warn!(
                    "Channel {} listener {:?} failed on {}: {}",
                    self.number, id, message, e
                );
            }
        }
    }

    fn ack_timeout(&self) -> Duration {
        Duration::from_millis(self.dispatcher.config().ack_timeout_ms)
    }

    fn require_assigned(&self, operation: &str) -> Result<()> {
        if self.is_assigned() {
            Ok(())
        } else {
            Err(AntError::InvalidState(format!(
                "channel {} must be assigned before it can {operation}",
                self.number
            )))
        }
    }

    async fn configure(&self, operation: &'static str, message: Message) -> Result<()> {
        let ack = self
            .dispatcher
            .write_and_wait_for_ack(&message, self.ack_timeout())
            .await?;

        match ack {
            Message::ChannelEvent(event) if event.event_code() == EventCode::NoError => {
                debug!("Channel {}: {} accepted", self.number, operation);
                Ok(())
            }
            Message::ChannelEvent(event) => Err(AntError::ChannelConfig {
                operation,
                channel: self.number,
                code: event.code,
            }),
            other => Err(AntError::Malformed(format!(
                "expected a channel response, got {other}"
            ))),
        }
    }

    /// Assign the channel to `network` with the given channel type
    ///
    /// # Errors
    ///
    /// Returns [`AntError::ChannelConfig`] if the dongle rejects the
    /// assignment, or [`AntError::WaitTimeout`] if it never answers.
    pub async fn assign(&self, network: &Network, channel_type: ChannelType) -> Result<()> {
        self.configure(
            "assign",
            Message::channel_assign(self.number, channel_type, network.number),
        )
        .await?;

        let mut config = self.config.write();
        config.network = Some(network.number);
        config.channel_type = Some(channel_type);
        Ok(())
    }

    /// Set the channel ID to search for; zero fields act as wildcards
    ///
    /// # Errors
    ///
    /// Returns [`AntError::InvalidState`] before `assign`, otherwise as [`Self::assign`].
    pub async fn set_id(&self, id: ChannelId) -> Result<()> {
        self.require_assigned("set its id")?;
        self.configure(
            "set id",
            Message::ChannelId {
                channel: self.number,
                id,
            },
        )
        .await?;
        self.config.write().id = Some(id);
        Ok(())
    }

    /// Set the RF frequency offset, 0..=124
    ///
    /// # Errors
    ///
    /// Returns [`AntError::Malformed`] for an out-of-range offset, otherwise as [`Self::set_id`].
    pub async fn set_rf_freq(&self, frequency: u8) -> Result<()> {
        let message = Message::channel_frequency(self.number, frequency)?;
        self.require_assigned("set its frequency")?;
        self.configure("set frequency", message).await?;
        self.config.write().frequency = Some(frequency);
        Ok(())
    }

    /// Set the message period in 1/32768 s counts
    ///
    /// # Errors
    ///
    /// As [`Self::set_id`].
    pub async fn set_period(&self, period: u16) -> Result<()> {
        self.require_assigned("set its period")?;
        self.configure(
            "set period",
            Message::ChannelPeriod {
                channel: self.number,
                period,
            },
        )
        .await?;
        self.config.write().period = Some(period);
        Ok(())
    }

    /// Set the search timeout in 2.5 s counts (255 searches forever)
    ///
    /// # Errors
    ///
    /// As [`Self::set_id`].
    pub async fn set_search_timeout(&self, timeout: u8) -> Result<()> {
        self.require_assigned("set its search timeout")?;
        self.configure(
            "set search timeout",
            Message::ChannelSearchTimeout {
                channel: self.number,
                timeout,
            },
        )
        .await?;
        self.config.write().search_timeout = Some(timeout);
        Ok(())
    }

    /// Set the transmit power level, 0..=4
    ///
    /// # Errors
    ///
    /// As [`Self::set_rf_freq`].
    pub async fn set_tx_power(&self, power: u8) -> Result<()> {
        let message = Message::channel_tx_power(self.number, power)?;
        self.require_assigned("set its transmit power")?;
        self.configure("set tx power", message).await?;
        self.config.write().tx_power = Some(power);
        Ok(())
    }

    /// Open the channel and start forwarding its frames to channel listeners
    ///
    /// # Errors
    ///
    /// As [`Self::set_id`].
    pub async fn open(self: &Arc<Self>) -> Result<()> {
        self.require_assigned("open")?;
        self.configure(
            "open",
            Message::ChannelOpen {
                channel: self.number,
            },
        )
        .await?;

        let relay = Arc::new(ChannelRelay(Arc::downgrade(self)));
        let id = self.dispatcher.register_listener(relay).await;
        let previous = self.registration.lock().replace(id);
        if let Some(previous) = previous {
            self.dispatcher.remove_listener(previous).await;
        }

        info!("Channel {} opened", self.number);
        Ok(())
    }

    /// Close the channel and wait until the dongle reports it closed
    ///
    /// The acknowledgement of the close frame only means the request was
    /// accepted; the channel is closed once the CHANNEL_CLOSED event arrives.
    ///
    /// # Errors
    ///
    /// As [`Self::set_id`], plus [`AntError::WaitTimeout`] if the
    /// CHANNEL_CLOSED event does not arrive.
    pub async fn close(&self) -> Result<()> {
        self.require_assigned("close")?;

        let number = self.number;
        let closed_event = |frame: &Message| {
            matches!(
                frame,
                Message::ChannelEvent(event)
                    if event.channel == number
                        && event.is_event()
                        && event.event_code() == EventCode::ChannelClosed
            )
        };

        let stale = self.dispatcher.discard_messages(closed_event);
        if stale > 0 {
            debug!("Channel {}: dropped {} earlier CHANNEL_CLOSED events", number, stale);
        }

        self.configure("close", Message::ChannelClose { channel: number })
            .await?;

        let timeout = Duration::from_millis(self.dispatcher.config().message_timeout_ms);
        let closed = self.dispatcher.wait_for_message(timeout, closed_event).await;

        self.deregister().await;

        if closed.is_none() {
            return Err(AntError::timeout(
                format!("channel {number} to close"),
                timeout,
            ));
        }

        info!("Channel {} closed", self.number);
        Ok(())
    }

    /// Unassign the channel and return it to the node's pool
    ///
    /// # Errors
    ///
    /// As [`Self::set_id`].
    pub async fn unassign(&self) -> Result<()> {
        self.require_assigned("be unassigned")?;
        self.configure(
            "unassign",
            Message::ChannelUnassign {
                channel: self.number,
            },
        )
        .await?;

        self.deregister().await;
        *self.config.write() = ChannelConfig::default();
        self.release();
        Ok(())
    }

    /// Ask the dongle to send the given message for this channel
    ///
    /// # Errors
    ///
    /// Returns [`AntError::NodeNotRunning`] or a transport error.
    pub async fn request(&self, message_id: MessageId) -> Result<()> {
        self.dispatcher
            .write(&Message::request(self.number, message_id))
            .await
    }

    /// Send a frame without waiting for any response
    ///
    /// # Errors
    ///
    /// As [`Self::request`], or a codec error if the frame cannot be encoded.
    pub async fn send(&self, message: &Message) -> Result<()> {
        self.dispatcher.write(message).await
    }

    async fn deregister(&self) {
        let registration = self.registration.lock().take();
        if let Some(id) = registration {
            self.dispatcher.remove_listener(id).await;
        }
    }
}

impl std::fmt::Debug for Channel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Channel")
            .field("number", &self.number)
            .field("config", &*self.config.read())
            .field("claimed", &self.is_claimed())
            .finish_non_exhaustive()
    }
}
