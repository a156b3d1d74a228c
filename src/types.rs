use serde::{Deserialize, Serialize};
use std::fmt;

use crate::error::{AntError, Result};

/// Network key of the public ANT+ network
pub const ANT_PLUS_NETWORK_KEY: [u8; 8] = [0xB9, 0xA5, 0x21, 0xFB, 0xBD, 0x72, 0xC3, 0x45];

/// Network number conventionally used for the public network
pub const NETWORK_NUMBER_PUBLIC: u8 = 0;

/// RF frequency offset used by ANT+ devices (2400 + 57 = 2457 MHz)
pub const ANT_PLUS_FREQUENCY: u8 = 57;

/// Highest valid RF frequency offset (2524 MHz)
pub const MAX_FREQUENCY: u8 = 124;

/// Highest valid transmit power level
pub const MAX_TX_POWER: u8 = 4;

/// Channel type, set when the channel is assigned
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ChannelType {
    /// Bidirectional slave channel
    TwoWayReceive = 0x00,
    /// Bidirectional master channel
    TwoWayTransmit = 0x10,
    /// Shared bidirectional slave channel
    SharedReceive = 0x20,
    /// Shared bidirectional master channel
    SharedTransmit = 0x30,
    /// Receive-only slave channel
    OneWayReceive = 0x40,
    /// Transmit-only master channel
    OneWayTransmit = 0x50,
}

impl TryFrom<u8> for ChannelType {
    type Error = AntError;

    fn try_from(value: u8) -> Result<Self> {
        match value {
            0x00 => Ok(Self::TwoWayReceive),
            0x10 => Ok(Self::TwoWayTransmit),
            0x20 => Ok(Self::SharedReceive),
            0x30 => Ok(Self::SharedTransmit),
            0x40 => Ok(Self::OneWayReceive),
            0x50 => Ok(Self::OneWayTransmit),
            other => Err(AntError::Malformed(format!(
                "unknown channel type 0x{other:02X}"
            ))),
        }
    }
}

impl fmt::Display for ChannelType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::TwoWayReceive => write!(f, "Two-way Receive"),
            Self::TwoWayTransmit => write!(f, "Two-way Transmit"),
            Self::SharedReceive => write!(f, "Shared Receive"),
            Self::SharedTransmit => write!(f, "Shared Transmit"),
            Self::OneWayReceive => write!(f, "One-way Receive"),
            Self::OneWayTransmit => write!(f, "One-way Transmit"),
        }
    }
}

/// Code carried by a channel event or a channel response frame
///
/// Asynchronous events (search timeout, channel closed, ...) and
/// acknowledgements of configuration frames share one code space.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum EventCode {
    /// Configuration frame accepted
    NoError,
    /// Search found nothing before the search timeout
    RxSearchTimeout,
    /// A message was missed in the expected time slot
    RxFail,
    /// A broadcast was transmitted
    Tx,
    /// Receiving a burst transfer failed
    TransferRxFailed,
    /// Acknowledged or burst transfer completed
    TransferTxCompleted,
    /// Acknowledged or burst transfer failed
    TransferTxFailed,
    /// Channel has been closed
    ChannelClosed,
    /// Too many missed messages, channel went back to search
    RxFailGoToSearch,
    /// Channel collided with another channel
    ChannelCollision,
    /// Burst transfer started
    TransferTxStart,
    /// Command not valid in the channel's current state
    ChannelInWrongState,
    /// Channel is not open
    ChannelNotOpened,
    /// Channel ID was not set before opening
    ChannelIdNotSet,
    /// A transfer is still in progress
    TransferInProgress,
    /// Message is not valid
    InvalidMessage,
    /// Network number is not valid
    InvalidNetworkNumber,
    /// Code not known to this library
    Other(u8),
}

impl From<u8> for EventCode {
    fn from(value: u8) -> Self {
        match value {
            0x00 => Self::NoError,
            0x01 => Self::RxSearchTimeout,
            0x02 => Self::RxFail,
            0x03 => Self::Tx,
            0x04 => Self::TransferRxFailed,
            0x05 => Self::TransferTxCompleted,
            0x06 => Self::TransferTxFailed,
            0x07 => Self::ChannelClosed,
            0x08 => Self::RxFailGoToSearch,
            0x09 => Self::ChannelCollision,
            0x0A => Self::TransferTxStart,
            0x15 => Self::ChannelInWrongState,
            0x16 => Self::ChannelNotOpened,
            0x18 => Self::ChannelIdNotSet,
            0x1F => Self::TransferInProgress,
            0x28 => Self::InvalidMessage,
            0x29 => Self::InvalidNetworkNumber,
            other => Self::Other(other),
        }
    }
}

impl From<EventCode> for u8 {
    fn from(code: EventCode) -> Self {
        match code {
            EventCode::NoError => 0x00,
            EventCode::RxSearchTimeout => 0x01,
            EventCode::RxFail => 0x02,
            EventCode::Tx => 0x03,
            EventCode::TransferRxFailed => 0x04,
            EventCode::TransferTxCompleted => 0x05,
            EventCode::TransferTxFailed => 0x06,
            EventCode::ChannelClosed => 0x07,
            EventCode::RxFailGoToSearch => 0x08,
            EventCode::ChannelCollision => 0x09,
            EventCode::TransferTxStart => 0x0A,
            EventCode::ChannelInWrongState => 0x15,
            EventCode::ChannelNotOpened => 0x16,
            EventCode::ChannelIdNotSet => 0x18,
            EventCode::TransferInProgress => 0x1F,
            EventCode::InvalidMessage => 0x28,
            EventCode::InvalidNetworkNumber => 0x29,
            EventCode::Other(other) => other,
        }
    }
}

impl fmt::Display for EventCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NoError => write!(f, "OK"),
            Self::Other(code) => write!(f, "0x{code:02X}"),
            known => write!(f, "{known:?}"),
        }
    }
}

/// Pairing state of a device profile
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ChannelState {
    /// Channel open, looking for a device
    Searching,
    /// Search gave up; the profile must be reopened
    SearchTimeout,
    /// Paired and receiving data
    Open,
    /// Not open
    Closed,
}

impl fmt::Display for ChannelState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Searching => write!(f, "Searching"),
            Self::SearchTimeout => write!(f, "Search Timeout"),
            Self::Open => write!(f, "Open"),
            Self::Closed => write!(f, "Closed"),
        }
    }
}

/// Connection state reported to dashboard-level consumers
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConnectionState {
    /// No paired sensor
    NotConnected,
    /// Sensor paired and delivering data
    Connected,
    /// Sensor paired but its data is too old to trust
    Stale,
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NotConnected => write!(f, "Not Connected"),
            Self::Connected => write!(f, "Connected"),
            Self::Stale => write!(f, "Stale"),
        }
    }
}

/// Identity of one physical sensor on a channel
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct ChannelId {
    /// Device number, 0 acts as a wildcard while searching
    pub device_number: u16,
    /// Device type (0x78 heart rate, 0x0B bicycle power, ...)
    pub device_type: u8,
    /// Transmission type, 0 acts as a wildcard while searching
    pub transmission_type: u8,
}

impl ChannelId {
    /// Create a new channel ID
    #[must_use]
    pub const fn new(device_number: u16, device_type: u8, transmission_type: u8) -> Self {
        Self {
            device_number,
            device_type,
            transmission_type,
        }
    }

    /// Wildcard ID matching any device of the given type
    #[must_use]
    pub const fn wildcard(device_type: u8) -> Self {
        Self::new(0, device_type, 0)
    }
}

impl fmt::Display for ChannelId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "(device number = {}, device type = {}, transmission type = {})",
            self.device_number, self.device_type, self.transmission_type
        )
    }
}

/// A radio network: key plus the slot it occupies on the node
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Network {
    /// 8-byte network key
    pub key: [u8; 8],
    /// Optional display name
    pub name: Option<String>,
    /// Network number assigned by `Node::set_network_key`
    pub number: u8,
}

impl Network {
    /// Create a network with the given key
    #[must_use]
    pub fn new(key: [u8; 8], name: Option<String>) -> Self {
        Self {
            key,
            name,
            number: 0,
        }
    }

    /// The public ANT+ network
    #[must_use]
    pub fn ant_plus() -> Self {
        Self::new(ANT_PLUS_NETWORK_KEY, Some("N:ANT+".to_string()))
    }
}

impl fmt::Display for Network {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.name {
            Some(name) => write!(f, "{name}"),
            None => write!(f, "{:02X?}", self.key),
        }
    }
}

/// Timing and buffering configuration of a node
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeConfig {
    /// How long to wait for a configuration acknowledgement
    pub ack_timeout_ms: u64,
    /// How long to wait for a specific response frame
    pub message_timeout_ms: u64,
    /// How long to wait for the startup frame after a reset
    pub startup_timeout_ms: u64,
    /// Wait for a startup frame after reset; some dongles never send one
    pub wait_for_startup: bool,
    /// Maximum bytes requested from the transport per read
    pub read_chunk_size: usize,
    /// Sleep between polls of the wait queues
    pub poll_interval_ms: u64,
    /// Capacity of the ack and message wait queues
    pub queue_capacity: usize,
    /// Consecutive failed transport reads after which the reader gives up
    pub max_read_failures: u32,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            ack_timeout_ms: 10_000,
            message_timeout_ms: 10_000,
            startup_timeout_ms: 2_000,
            wait_for_startup: true,
            read_chunk_size: 20,
            poll_interval_ms: 1,
            queue_capacity: 25,
            max_read_failures: 10,
        }
    }
}

/// Serial port parameters for a USB-serial dongle
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SerialParams {
    /// Device path, e.g. `/dev/ttyUSB0`
    pub path: String,
    /// Baud rate
    pub baud_rate: u32,
    /// Per-read timeout in milliseconds
    pub read_timeout_ms: u64,
}

impl Default for SerialParams {
    fn default() -> Self {
        Self {
            path: "/dev/ttyUSB0".to_string(),
            baud_rate: 115_200,
            read_timeout_ms: 10,
        }
    }
}

/// USB vendor ID of Dynastream ANT sticks
pub const ANT_USB_VENDOR_ID: u16 = 0x0FCF;

/// USB product ID of the ANTUSB2 stick
pub const ANT_USB2_PRODUCT_ID: u16 = 0x1008;

/// USB parameters for a dongle driven directly over bulk endpoints
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UsbParams {
    /// USB vendor ID
    pub vendor_id: u16,
    /// USB product ID
    pub product_id: u16,
    /// Interface number to claim
    pub interface: u8,
    /// Bulk IN endpoint address
    pub in_endpoint: u8,
    /// Bulk OUT endpoint address
    pub out_endpoint: u8,
    /// Size of each bulk IN transfer
    pub transfer_size: usize,
    /// Per-read timeout in milliseconds
    pub read_timeout_ms: u64,
    /// Per-write timeout in milliseconds
    pub write_timeout_ms: u64,
}

impl Default for UsbParams {
    fn default() -> Self {
        Self {
            vendor_id: ANT_USB_VENDOR_ID,
            product_id: ANT_USB2_PRODUCT_ID,
            interface: 0,
            in_endpoint: 0x81,
            out_endpoint: 0x01,
            transfer_size: 64,
            read_timeout_ms: 10,
            write_timeout_ms: 1_000,
        }
    }
}
