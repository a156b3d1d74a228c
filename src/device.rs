use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use std::{
    fmt,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    time::Duration,
};
use tracing::{debug, info, warn};

use crate::{
    channel::Channel,
    error::{AntError, Result},
    event::{Listener, ListenerId},
    node::Node,
    protocol::{ChannelData, Message, MessageId},
    types::{ChannelId, ChannelState, ChannelType, EventCode, Network, ANT_PLUS_FREQUENCY},
};

/// Search timeout used when the caller has no preference
pub const DEFAULT_SEARCH_TIMEOUT: Duration = Duration::from_secs(30);

/// Seconds per search timeout count
const SEARCH_TIMEOUT_UNIT_SECS: f64 = 2.5;

/// Payload decoder for one ANT+ device category
///
/// The decoder sees every broadcast the channel receives, in arrival order,
/// and is reset to its default each time the profile is opened.
pub trait ProfileDecoder: Default + Send + 'static {
    /// Display name passed to callbacks
    const NAME: &'static str;
    /// ANT+ device type searched for
    const DEVICE_TYPE: u8;
    /// Channel period in 1/32768 s counts
    const CHANNEL_PERIOD: u16;
    /// RF frequency offset
    const CHANNEL_FREQUENCY: u8 = ANT_PLUS_FREQUENCY;

    /// Decoded data delivered to the data callback
    type Event: fmt::Debug + Send + Sync + 'static;
    /// Snapshot of everything decoded so far
    type Telemetry: Clone + fmt::Debug + Serialize;

    /// Decode one 8-byte data page
    fn decode(&mut self, data: &[u8; 8]) -> Option<Self::Event>;

    /// Current telemetry snapshot
    fn telemetry(&self) -> Self::Telemetry;
}

type PairedCallback = Box<dyn Fn(&str, ChannelId) + Send + Sync>;
type DeviceCallback = Box<dyn Fn(&str) + Send + Sync>;
type DataCallback<E> = Box<dyn Fn(&E) + Send + Sync>;

/// Callbacks invoked from the node's reader task
///
/// Callbacks must return quickly and must not wait on the node; hand work
/// off to another task instead.
pub struct ProfileCallbacks<E> {
    on_device_paired: Option<PairedCallback>,
    on_channel_closed: Option<DeviceCallback>,
    on_search_timeout: Option<DeviceCallback>,
    on_data: Option<DataCallback<E>>,
}

impl<E> Default for ProfileCallbacks<E> {
    fn default() -> Self {
        Self {
            on_device_paired: None,
            on_channel_closed: None,
            on_search_timeout: None,
            on_data: None,
        }
    }
}

impl<E> ProfileCallbacks<E> {
    /// Called with the device's channel ID once it has paired
    #[must_use]
    pub fn on_device_paired(mut self, f: impl Fn(&str, ChannelId) + Send + Sync + 'static) -> Self {
        self.on_device_paired = Some(Box::new(f));
        self
    }

    /// Called when the dongle reports the channel closed
    #[must_use]
    pub fn on_channel_closed(mut self, f: impl Fn(&str) + Send + Sync + 'static) -> Self {
        self.on_channel_closed = Some(Box::new(f));
        self
    }

    /// Called when the search gives up without finding a device
    #[must_use]
    pub fn on_search_timeout(mut self, f: impl Fn(&str) + Send + Sync + 'static) -> Self {
        self.on_search_timeout = Some(Box::new(f));
        self
    }

    /// Called with every decoded data event
    #[must_use]
    pub fn on_data(mut self, f: impl Fn(&E) + Send + Sync + 'static) -> Self {
        self.on_data = Some(Box::new(f));
        self
    }
}

struct ProfileShared<D: ProfileDecoder> {
    state: Mutex<ChannelState>,
    detected: AtomicBool,
    paired: Mutex<Option<ChannelId>>,
    channel: RwLock<Option<Arc<Channel>>>,
    decoder: Mutex<D>,
    callbacks: ProfileCallbacks<D::Event>,
}

impl<D: ProfileDecoder> ProfileShared<D> {
    async fn on_broadcast(&self, data: &ChannelData) -> Result<()> {
        let event = self.decoder.lock().decode(&data.data);
        if let (Some(event), Some(callback)) = (&event, &self.callbacks.on_data) {
            callback(event);
        }

        if !self.detected.swap(true, Ordering::SeqCst) {
            let channel = self.channel.read().clone();
            if let Some(channel) = channel {
                debug!("{}: first broadcast, requesting channel id", D::NAME);
                channel.request(MessageId::ChannelId).await?;
            }
        }
        Ok(())
    }

    fn on_channel_id(&self, id: ChannelId) {
        *self.state.lock() = ChannelState::Open;
        *self.paired.lock() = Some(id);
        info!("{} paired with {}", D::NAME, id);

        if let Some(callback) = &self.callbacks.on_device_paired {
            callback(D::NAME, id);
        }
    }

    fn on_event(&self, code: EventCode) {
        match code {
            EventCode::RxSearchTimeout => {
                *self.state.lock() = ChannelState::SearchTimeout;
                info!("{}: search timed out", D::NAME);
                if let Some(callback) = &self.callbacks.on_search_timeout {
                    callback(D::NAME);
                }
            }
            EventCode::ChannelClosed => {
                *self.state.lock() = ChannelState::Closed;
                info!("{}: channel closed", D::NAME);
                if let Some(callback) = &self.callbacks.on_channel_closed {
                    callback(D::NAME);
                }
            }
            EventCode::RxFailGoToSearch => {
                *self.state.lock() = ChannelState::Searching;
                debug!("{}: lost device, searching again", D::NAME);
            }
            _ => {}
        }
    }
}

#[async_trait]
impl<D: ProfileDecoder> Listener for ProfileShared<D> {
    async fn process(&self, message: &Message) -> Result<()> {
        match message {
            Message::BroadcastData(data) => self.on_broadcast(data).await?,
            Message::ChannelId { id, .. } => self.on_channel_id(*id),
            Message::ChannelEvent(event) if event.is_event() => self.on_event(event.event_code()),
            _ => {}
        }
        Ok(())
    }
}

/// Pairing state machine for one ANT+ sensor over one borrowed channel
///
/// `open` takes a free channel from the node and starts a search; the first
/// broadcast triggers a channel ID request and the answer moves the profile to
/// [`ChannelState::Open`]. `close` returns the channel to the node.
pub struct DeviceProfile<D: ProfileDecoder> {
    node: Arc<Node>,
    network: Network,
    shared: Arc<ProfileShared<D>>,
    listener: Mutex<Option<ListenerId>>,
}

impl<D: ProfileDecoder> DeviceProfile<D> {
    /// Create a closed profile that will search on `network`
    #[must_use]
    pub fn new(node: Arc<Node>, network: Network, callbacks: ProfileCallbacks<D::Event>) -> Self {
        Self {
            node,
            network,
            shared: Arc::new(ProfileShared {
                state: Mutex::new(ChannelState::Closed),
                detected: AtomicBool::new(false),
                paired: Mutex::new(None),
                channel: RwLock::new(None),
                decoder: Mutex::new(D::default()),
                callbacks,
            }),
            listener: Mutex::new(None),
        }
    }

    /// Display name of the device category
    #[must_use]
    pub const fn name(&self) -> &'static str {
        D::NAME
    }

    /// Current pairing state
    #[must_use]
    pub fn state(&self) -> ChannelState {
        *self.shared.state.lock()
    }

    /// Channel ID of the paired device, once known
    #[must_use]
    pub fn channel_id(&self) -> Option<ChannelId> {
        *self.shared.paired.lock()
    }

    /// Channel borrowed from the node while open
    #[must_use]
    pub fn channel(&self) -> Option<Arc<Channel>> {
        self.shared.channel.read().clone()
    }

    /// Snapshot of the decoded telemetry
    #[must_use]
    pub fn telemetry(&self) -> D::Telemetry {
        self.shared.decoder.lock().telemetry()
    }

    /// Start searching for a device
    ///
    /// With `channel_id` of `None` any device of this category pairs. The
    /// search timeout is sent in 2.5 s counts, capped at 255.
    ///
    /// # Errors
    ///
    /// Returns [`AntError::InvalidState`] if already open,
    /// [`AntError::NoFreeChannel`] if the node has no channel left, or the
    /// error of the configuration step that failed. On error the channel is
    /// returned to the node.
    pub async fn open(
        &self,
        channel_id: Option<ChannelId>,
        search_timeout: Duration,
    ) -> Result<()> {
        if self.channel().is_some() {
            return Err(AntError::InvalidState(format!("{} is already open", D::NAME)));
        }

        let channel = self.node.acquire_channel()?;
        let listener = channel.register_listener(self.shared.clone()).await;
        *self.listener.lock() = Some(listener);
        *self.shared.channel.write() = Some(channel.clone());
        *self.shared.decoder.lock() = D::default();
        *self.shared.paired.lock() = None;
        self.shared.detected.store(false, Ordering::SeqCst);

        let id = channel_id.unwrap_or_else(|| ChannelId::wildcard(D::DEVICE_TYPE));
        if let Err(e) = self.configure(&channel, id, search_timeout).await {
            warn!("{}: open failed on channel {}: {}", D::NAME, channel.number(), e);
            self.release(&channel).await;
            return Err(e);
        }

        info!(
            "{}: searching for {} on channel {}",
            D::NAME,
            id,
            channel.number()
        );
        Ok(())
    }

    async fn configure(
        &self,
        channel: &Arc<Channel>,
        id: ChannelId,
        search_timeout: Duration,
    ) -> Result<()> {
        channel
            .assign(&self.network, ChannelType::TwoWayReceive)
            .await?;
        channel.set_id(id).await?;
        channel.set_rf_freq(D::CHANNEL_FREQUENCY).await?;
        channel.set_period(D::CHANNEL_PERIOD).await?;
        channel
            .set_search_timeout(search_timeout_counts(search_timeout))
            .await?;

        *self.shared.state.lock() = ChannelState::Searching;
        channel.open().await
    }

    /// Close the channel if the device has not already closed it, then
    /// return it to the node
    ///
    /// # Errors
    ///
    /// Returns [`AntError::InvalidState`] if not open, or the error of the
    /// close or unassign step.
    pub async fn close(&self) -> Result<()> {
        let channel = self
            .channel()
            .ok_or_else(|| AntError::InvalidState(format!("{} is not open", D::NAME)))?;

        if self.state() != ChannelState::Closed {
            channel.close().await?;
        }
        channel.unassign().await?;
        self.release(&channel).await;

        info!("{}: closed", D::NAME);
        Ok(())
    }

    /// Send an 8-byte page to the device as acknowledged data
    ///
    /// # Errors
    ///
    /// Returns [`AntError::InvalidState`] if not open, or
    /// [`AntError::Malformed`] if `data` is not 8 bytes long.
    pub async fn send_acknowledged(&self, data: &[u8]) -> Result<()> {
        let channel = self
            .channel()
            .ok_or_else(|| AntError::InvalidState(format!("{} is not open", D::NAME)))?;
        let message = Message::acknowledged_data(channel.number(), data)?;
        channel.send(&message).await
    }

    async fn release(&self, channel: &Arc<Channel>) {
        let listener = self.listener.lock().take();
        if let Some(listener) = listener {
            channel.remove_listener(listener).await;
        }

        if channel.is_assigned() {
            if let Err(e) = channel.unassign().await {
                warn!("{}: unassign of channel {} failed: {}", D::NAME, channel.number(), e);
            }
        }
        channel.release();

        *self.shared.channel.write() = None;
        *self.shared.state.lock() = ChannelState::Closed;
    }
}

/// Convert a search timeout to 2.5 s counts, capped at 255
#[must_use]
#[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
pub fn search_timeout_counts(timeout: Duration) -> u8 {
    (timeout.as_secs_f64() / SEARCH_TIMEOUT_UNIT_SECS)
        .floor()
        .clamp(0.0, 255.0) as u8
}
