use crate::{
    error::{AntError, Result},
    types::{ChannelId, ChannelType, EventCode, MAX_FREQUENCY, MAX_TX_POWER},
};
use bytes::{Buf, BufMut, Bytes, BytesMut};
use std::fmt;

/// First byte of every frame sent to or received from the dongle
pub const SYNC: u8 = 0xA4;

/// Largest payload a frame may carry
pub const MAX_PAYLOAD_SIZE: usize = 9;

/// Sync, length, type and checksum bytes around the payload
pub const FRAME_OVERHEAD: usize = 4;

/// Shortest buffer that can hold a decodable frame
pub const MIN_FRAME_SIZE: usize = FRAME_OVERHEAD + 1;

/// Message ID carried by a channel event frame that is an asynchronous event
/// rather than the acknowledgement of a specific message
pub const CHANNEL_EVENT_MESSAGE_ID: u8 = 0x01;

/// Bytes of application data carried by broadcast, acknowledged and burst frames
pub const DATA_SIZE: usize = 8;

const HEADER_SIZE: usize = 3;

/// Frame type codes understood by this library
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum MessageId {
    /// Channel event or response to a configuration message
    ChannelEvent = 0x40,
    /// Unassign a channel
    ChannelUnassign = 0x41,
    /// Assign a channel to a network with a channel type
    ChannelAssign = 0x42,
    /// Set the channel message period
    ChannelPeriod = 0x43,
    /// Set the channel search timeout
    ChannelSearchTimeout = 0x44,
    /// Set the channel RF frequency
    ChannelFrequency = 0x45,
    /// Set a network key
    NetworkKey = 0x46,
    /// Set the transmit power of all channels
    TxPower = 0x47,
    /// Reset the dongle
    SystemReset = 0x4A,
    /// Open a channel
    ChannelOpen = 0x4B,
    /// Close a channel
    ChannelClose = 0x4C,
    /// Ask the dongle to send a given message
    ChannelRequest = 0x4D,
    /// Broadcast data
    BroadcastData = 0x4E,
    /// Acknowledged data
    AcknowledgedData = 0x4F,
    /// Burst data
    BurstData = 0x50,
    /// Channel ID (set, or response to a request)
    ChannelId = 0x51,
    /// Channel status response
    ChannelStatus = 0x52,
    /// Capabilities response
    Capabilities = 0x54,
    /// Set the transmit power of one channel
    ChannelTxPower = 0x60,
    /// Serial number response
    SerialNumber = 0x61,
    /// Startup notification after a reset
    Startup = 0x6F,
    /// Version response
    Version = 0x3E,
}

impl MessageId {
    /// Convert from u8
    #[must_use]
    pub const fn from_u8(value: u8) -> Option<Self> {
        match value {
            0x40 => Some(Self::ChannelEvent),
            0x41 => Some(Self::ChannelUnassign),
            0x42 => Some(Self::ChannelAssign),
            0x43 => Some(Self::ChannelPeriod),
            0x44 => Some(Self::ChannelSearchTimeout),
            0x45 => Some(Self::ChannelFrequency),
            0x46 => Some(Self::NetworkKey),
            0x47 => Some(Self::TxPower),
            0x4A => Some(Self::SystemReset),
            0x4B => Some(Self::ChannelOpen),
            0x4C => Some(Self::ChannelClose),
            0x4D => Some(Self::ChannelRequest),
            0x4E => Some(Self::BroadcastData),
            0x4F => Some(Self::AcknowledgedData),
            0x50 => Some(Self::BurstData),
            0x51 => Some(Self::ChannelId),
            0x52 => Some(Self::ChannelStatus),
            0x54 => Some(Self::Capabilities),
            0x60 => Some(Self::ChannelTxPower),
            0x61 => Some(Self::SerialNumber),
            0x6F => Some(Self::Startup),
            0x3E => Some(Self::Version),
            _ => None,
        }
    }
}

/// Channel event or response to a configuration message
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChannelEvent {
    /// Channel the event refers to
    pub channel: u8,
    /// Type code of the acknowledged message, or 0x01 for an event
    pub message_id: u8,
    /// Response or event code
    pub code: u8,
}

impl ChannelEvent {
    /// Whether this frame is an asynchronous event rather than an acknowledgement
    #[must_use]
    pub const fn is_event(&self) -> bool {
        self.message_id == CHANNEL_EVENT_MESSAGE_ID
    }

    /// Decoded response or event code
    #[must_use]
    pub fn event_code(&self) -> EventCode {
        EventCode::from(self.code)
    }
}

/// Payload of broadcast, acknowledged and burst data frames
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChannelData {
    /// Channel number (burst frames carry a sequence number in the top 3 bits)
    pub channel: u8,
    /// Profile-specific data page
    pub data: [u8; DATA_SIZE],
}

impl ChannelData {
    /// Create a data payload, requiring exactly 8 bytes of data
    ///
    /// # Errors
    ///
    /// Returns [`AntError::Malformed`] if `data` is not 8 bytes long.
    pub fn new(channel: u8, data: &[u8]) -> Result<Self> {
        let data = <[u8; DATA_SIZE]>::try_from(data).map_err(|_| {
            AntError::Malformed(format!(
                "channel data must be {DATA_SIZE} bytes, got {}",
                data.len()
            ))
        })?;
        Ok(Self { channel, data })
    }
}

/// Capabilities reported by the dongle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Capabilities {
    /// Number of channels available
    pub max_channels: u8,
    /// Number of networks available
    pub max_networks: u8,
    /// Standard options bit field
    pub standard_options: u8,
    /// Advanced options bit field
    pub advanced_options: u8,
    /// Second advanced options byte, absent on some firmware
    pub advanced_options2: Option<u8>,
}

impl Capabilities {
    /// Option bytes as (standard, advanced, advanced 2), the last defaulting to zero
    #[must_use]
    pub fn options(&self) -> (u8, u8, u8) {
        (
            self.standard_options,
            self.advanced_options,
            self.advanced_options2.unwrap_or(0),
        )
    }
}

/// Frame with a type code this library has no schema for
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawFrame {
    /// Type code
    pub msg_type: u8,
    /// Untouched payload
    pub payload: Bytes,
}

/// A protocol frame, typed by its type code
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Message {
    /// Channel event or configuration acknowledgement
    ChannelEvent(ChannelEvent),
    /// Unassign a channel
    ChannelUnassign {
        /// Channel number
        channel: u8,
    },
    /// Assign a channel
    ChannelAssign {
        /// Channel number
        channel: u8,
        /// Channel type
        channel_type: ChannelType,
        /// Network number
        network: u8,
    },
    /// Set the channel period in 1/32768 s counts
    ChannelPeriod {
        /// Channel number
        channel: u8,
        /// Period counts
        period: u16,
    },
    /// Set the search timeout in 2.5 s counts (255 = infinite)
    ChannelSearchTimeout {
        /// Channel number
        channel: u8,
        /// Timeout counts
        timeout: u8,
    },
    /// Set the RF frequency as an offset from 2400 MHz
    ChannelFrequency {
        /// Channel number
        channel: u8,
        /// Frequency offset, 0..=124
        frequency: u8,
    },
    /// Set the transmit power of one channel
    ChannelTxPower {
        /// Channel number
        channel: u8,
        /// Power level, 0..=4
        power: u8,
    },
    /// Set a network key
    NetworkKey {
        /// Network number
        network: u8,
        /// 8-byte key
        key: [u8; 8],
    },
    /// Set the transmit power of all channels
    TxPower {
        /// Power level, 0..=4
        power: u8,
    },
    /// Reset the dongle
    SystemReset,
    /// Open a channel
    ChannelOpen {
        /// Channel number
        channel: u8,
    },
    /// Close a channel
    ChannelClose {
        /// Channel number
        channel: u8,
    },
    /// Request that the dongle sends a message
    ChannelRequest {
        /// Channel number
        channel: u8,
        /// Type code of the requested message
        message_id: u8,
    },
    /// Broadcast data
    BroadcastData(ChannelData),
    /// Acknowledged data
    AcknowledgedData(ChannelData),
    /// Burst data
    BurstData(ChannelData),
    /// Channel ID
    ChannelId {
        /// Channel number
        channel: u8,
        /// Device identity
        id: ChannelId,
    },
    /// Channel status response
    ChannelStatus {
        /// Channel number
        channel: u8,
        /// Status bit field
        status: u8,
    },
    /// Capabilities response
    Capabilities(Capabilities),
    /// Serial number response
    SerialNumber {
        /// 4 serial number bytes, little-endian
        serial: [u8; 4],
    },
    /// Startup notification
    Startup {
        /// Reset reason bit field
        reason: u8,
    },
    /// Version response
    Version {
        /// Null-padded ASCII version string
        version: [u8; 9],
    },
    /// Any other in-range type code
    Raw(RawFrame),
}

type DecodeFn = fn(&[u8]) -> Result<Message>;

/// Type code to payload decoder; codes missing here decode as [`Message::Raw`]
static DECODERS: [(MessageId, DecodeFn); 22] = [
    (MessageId::ChannelEvent, decode_channel_event),
    (MessageId::ChannelUnassign, decode_channel_unassign),
    (MessageId::ChannelAssign, decode_channel_assign),
    (MessageId::ChannelPeriod, decode_channel_period),
    (MessageId::ChannelSearchTimeout, decode_channel_search_timeout),
    (MessageId::ChannelFrequency, decode_channel_frequency),
    (MessageId::NetworkKey, decode_network_key),
    (MessageId::TxPower, decode_tx_power),
    (MessageId::SystemReset, decode_system_reset),
    (MessageId::ChannelOpen, decode_channel_open),
    (MessageId::ChannelClose, decode_channel_close),
    (MessageId::ChannelRequest, decode_channel_request),
    (MessageId::BroadcastData, decode_broadcast_data),
    (MessageId::AcknowledgedData, decode_acknowledged_data),
    (MessageId::BurstData, decode_burst_data),
    (MessageId::ChannelId, decode_channel_id),
    (MessageId::ChannelStatus, decode_channel_status),
    (MessageId::Capabilities, decode_capabilities),
    (MessageId::ChannelTxPower, decode_channel_tx_power),
    (MessageId::SerialNumber, decode_serial_number),
    (MessageId::Startup, decode_startup),
    (MessageId::Version, decode_version),
];

fn decoder_for(msg_type: u8) -> Option<DecodeFn> {
    DECODERS
        .iter()
        .find(|(id, _)| *id as u8 == msg_type)
        .map(|(_, decode)| *decode)
}

impl Message {
    /// Assign `channel` on `network`
    #[must_use]
    pub const fn channel_assign(channel: u8, channel_type: ChannelType, network: u8) -> Self {
        Self::ChannelAssign {
            channel,
            channel_type,
            network,
        }
    }

    /// Set the RF frequency of `channel`
    ///
    /// # Errors
    ///
    /// Returns [`AntError::Malformed`] if `frequency` is above 124.
    pub fn channel_frequency(channel: u8, frequency: u8) -> Result<Self> {
        let message = Self::ChannelFrequency { channel, frequency };
        message.validate()?;
        Ok(message)
    }

    /// Set the transmit power of `channel`
    ///
    /// # Errors
    ///
    /// Returns [`AntError::Malformed`] if `power` is above 4.
    pub fn channel_tx_power(channel: u8, power: u8) -> Result<Self> {
        let message = Self::ChannelTxPower { channel, power };
        message.validate()?;
        Ok(message)
    }

    /// Ask the dongle to send the message with type code `message_id`
    #[must_use]
    pub const fn request(channel: u8, message_id: MessageId) -> Self {
        Self::ChannelRequest {
            channel,
            message_id: message_id as u8,
        }
    }

    /// Acknowledged data frame carrying `data` on `channel`
    ///
    /// # Errors
    ///
    /// Returns [`AntError::Malformed`] if `data` is not 8 bytes long.
    pub fn acknowledged_data(channel: u8, data: &[u8]) -> Result<Self> {
        Ok(Self::AcknowledgedData(ChannelData::new(channel, data)?))
    }

    /// Build a frame from a type code and payload, using the typed schema when one exists
    ///
    /// # Errors
    ///
    /// Returns [`AntError::Malformed`] if the payload is longer than 9 bytes or
    /// does not fit the schema of a known type code.
    pub fn from_parts(msg_type: u8, payload: &[u8]) -> Result<Self> {
        if payload.len() > MAX_PAYLOAD_SIZE {
            return Err(AntError::Malformed(format!(
                "payload of {} bytes exceeds {MAX_PAYLOAD_SIZE}",
                payload.len()
            )));
        }

        let message = match decoder_for(msg_type) {
            Some(decode) => decode(payload)?,
            None => Self::Raw(RawFrame {
                msg_type,
                payload: Bytes::copy_from_slice(payload),
            }),
        };
        message.validate()?;
        Ok(message)
    }

    /// Type code of this frame
    #[must_use]
    pub fn msg_type(&self) -> u8 {
        let id = match self {
            Self::ChannelEvent(_) => MessageId::ChannelEvent,
            Self::ChannelUnassign { .. } => MessageId::ChannelUnassign,
            Self::ChannelAssign { .. } => MessageId::ChannelAssign,
            Self::ChannelPeriod { .. } => MessageId::ChannelPeriod,
            Self::ChannelSearchTimeout { .. } => MessageId::ChannelSearchTimeout,
            Self::ChannelFrequency { .. } => MessageId::ChannelFrequency,
            Self::ChannelTxPower { .. } => MessageId::ChannelTxPower,
            Self::NetworkKey { .. } => MessageId::NetworkKey,
            Self::TxPower { .. } => MessageId::TxPower,
            Self::SystemReset => MessageId::SystemReset,
            Self::ChannelOpen { .. } => MessageId::ChannelOpen,
            Self::ChannelClose { .. } => MessageId::ChannelClose,
            Self::ChannelRequest { .. } => MessageId::ChannelRequest,
            Self::BroadcastData(_) => MessageId::BroadcastData,
            Self::AcknowledgedData(_) => MessageId::AcknowledgedData,
            Self::BurstData(_) => MessageId::BurstData,
            Self::ChannelId { .. } => MessageId::ChannelId,
            Self::ChannelStatus { .. } => MessageId::ChannelStatus,
            Self::Capabilities(_) => MessageId::Capabilities,
            Self::SerialNumber { .. } => MessageId::SerialNumber,
            Self::Startup { .. } => MessageId::Startup,
            Self::Version { .. } => MessageId::Version,
            Self::Raw(raw) => return raw.msg_type,
        };
        id as u8
    }

    /// Channel number for frames that address a single channel
    #[must_use]
    pub const fn channel_number(&self) -> Option<u8> {
        match self {
            Self::ChannelEvent(ChannelEvent { channel, .. })
            | Self::ChannelUnassign { channel }
            | Self::ChannelAssign { channel, .. }
            | Self::ChannelPeriod { channel, .. }
            | Self::ChannelSearchTimeout { channel, .. }
            | Self::ChannelFrequency { channel, .. }
            | Self::ChannelTxPower { channel, .. }
            | Self::ChannelOpen { channel }
            | Self::ChannelClose { channel }
            | Self::ChannelRequest { channel, .. }
            | Self::ChannelId { channel, .. }
            | Self::ChannelStatus { channel, .. } => Some(*channel),
            Self::BroadcastData(data) | Self::AcknowledgedData(data) => Some(data.channel),
            Self::BurstData(data) => Some(data.channel & 0x1F),
            _ => None,
        }
    }

    /// Channel byte the dongle echoes in the acknowledgement of this frame
    ///
    /// Network key acks carry the network number and TX power acks carry 0.
    #[must_use]
    pub const fn ack_channel(&self) -> Option<u8> {
        match self {
            Self::NetworkKey { network, .. } => Some(*network),
            Self::TxPower { .. } => Some(0),
            _ => self.channel_number(),
        }
    }

    /// Serialize the payload in wire order
    #[must_use]
    pub fn payload(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(MAX_PAYLOAD_SIZE);

        match self {
            Self::ChannelEvent(event) => {
                buf.put_u8(event.channel);
                buf.put_u8(event.message_id);
                buf.put_u8(event.code);
            }
            Self::ChannelUnassign { channel }
            | Self::ChannelOpen { channel }
            | Self::ChannelClose { channel } => buf.put_u8(*channel),
            Self::ChannelAssign {
                channel,
                channel_type,
                network,
            } => {
                buf.put_u8(*channel);
                buf.put_u8(*channel_type as u8);
                buf.put_u8(*network);
            }
            Self::ChannelPeriod { channel, period } => {
                buf.put_u8(*channel);
                buf.put_u16_le(*period);
            }
            Self::ChannelSearchTimeout {
                channel,
                timeout: value,
            }
            | Self::ChannelFrequency {
                channel,
                frequency: value,
            }
            | Self::ChannelTxPower {
                channel,
                power: value,
            }
            | Self::ChannelRequest {
                channel,
                message_id: value,
            }
            | Self::ChannelStatus {
                channel,
                status: value,
            } => {
                buf.put_u8(*channel);
                buf.put_u8(*value);
            }
            Self::NetworkKey { network, key } => {
                buf.put_u8(*network);
                buf.put_slice(key);
            }
            Self::TxPower { power } => {
                buf.put_u8(0);
                buf.put_u8(*power);
            }
            Self::SystemReset => buf.put_u8(0),
            Self::BroadcastData(data) | Self::AcknowledgedData(data) | Self::BurstData(data) => {
                buf.put_u8(data.channel);
                buf.put_slice(&data.data);
            }
            Self::ChannelId { channel, id } => {
                buf.put_u8(*channel);
                buf.put_u16_le(id.device_number);
                buf.put_u8(id.device_type);
                buf.put_u8(id.transmission_type);
            }
            Self::Capabilities(caps) => {
                buf.put_u8(caps.max_channels);
                buf.put_u8(caps.max_networks);
                buf.put_u8(caps.standard_options);
                buf.put_u8(caps.advanced_options);
                if let Some(options2) = caps.advanced_options2 {
                    buf.put_u8(options2);
                }
            }
            Self::SerialNumber { serial } => buf.put_slice(serial),
            Self::Startup { reason } => buf.put_u8(*reason),
            Self::Version { version } => buf.put_slice(version),
            Self::Raw(raw) => buf.put_slice(&raw.payload),
        }

        buf.freeze()
    }

    /// Check payload length and field ranges
    ///
    /// # Errors
    ///
    /// Returns [`AntError::Malformed`] naming the offending field.
    pub fn validate(&self) -> Result<()> {
        match self {
            Self::ChannelFrequency { frequency, .. } if *frequency > MAX_FREQUENCY => {
                Err(AntError::Malformed(format!(
                    "frequency offset {frequency} exceeds {MAX_FREQUENCY}"
                )))
            }
            Self::ChannelTxPower { power, .. } | Self::TxPower { power }
                if *power > MAX_TX_POWER =>
            {
                Err(AntError::Malformed(format!(
                    "transmit power {power} exceeds {MAX_TX_POWER}"
                )))
            }
            Self::Raw(raw) if raw.payload.len() > MAX_PAYLOAD_SIZE => Err(AntError::Malformed(
                format!(
                    "payload of {} bytes exceeds {MAX_PAYLOAD_SIZE}",
                    raw.payload.len()
                ),
            )),
            _ => Ok(()),
        }
    }

    /// Size of the encoded frame: payload plus sync, length, type and checksum
    #[must_use]
    pub fn encoded_len(&self) -> usize {
        self.payload().len() + FRAME_OVERHEAD
    }

    /// Encode to a complete wire frame
    ///
    /// # Errors
    ///
    /// Returns [`AntError::Malformed`] if the payload is too long or a field
    /// is out of range.
    pub fn encode(&self) -> Result<Bytes> {
        self.validate()?;
        let payload = self.payload();

        let mut buf = BytesMut::with_capacity(payload.len() + FRAME_OVERHEAD);
        buf.put_u8(SYNC);
        #[allow(clippy::cast_possible_truncation)]
        buf.put_u8(payload.len() as u8);
        buf.put_u8(self.msg_type());
        buf.extend_from_slice(&payload);
        buf.put_u8(checksum(&buf));

        Ok(buf.freeze())
    }
}

impl fmt::Display for Message {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::ChannelEvent(event) if event.is_event() => {
                write!(f, "<ChannelEvent: C({}): {}>", event.channel, event.event_code())
            }
            Self::ChannelEvent(event) => match MessageId::from_u8(event.message_id) {
                Some(id) => write!(
                    f,
                    "<ChannelResponse: '{id:?}' on C({}): {}>",
                    event.channel,
                    event.event_code()
                ),
                None => write!(
                    f,
                    "<ChannelResponse: 0x{:02X} on C({}): {}>",
                    event.message_id,
                    event.channel,
                    event.event_code()
                ),
            },
            other => {
                let name = MessageId::from_u8(other.msg_type())
                    .map_or_else(|| format!("0x{:02X}", other.msg_type()), |id| format!("{id:?}"));
                match other.channel_number() {
                    Some(channel) => write!(f, "<{name}: C({channel})>"),
                    None => write!(f, "<{name}>"),
                }
            }
        }
    }
}

/// XOR of every byte given; pass the frame up to (not including) the checksum byte
#[must_use]
pub fn checksum(bytes: &[u8]) -> u8 {
    bytes.iter().fold(0, |acc, byte| acc ^ byte)
}

/// Decode the frame at the front of `buf`, returning it with the number of bytes it spans
///
/// # Errors
///
/// - [`AntError::Incomplete`] if `buf` holds fewer bytes than the frame needs;
///   keep the bytes and retry once more have arrived.
/// - [`AntError::Corrupted`] if the first byte is not the sync byte or the
///   checksum does not match; skip to the next sync byte and retry.
/// - [`AntError::Malformed`] if the frame is intact but its payload does not
///   fit the schema of its type code.
pub fn decode_frame(buf: &[u8]) -> Result<(Message, usize)> {
    if buf.len() < MIN_FRAME_SIZE {
        return Err(AntError::Incomplete {
            needed: MIN_FRAME_SIZE,
            available: buf.len(),
        });
    }

    let sync = buf[0];
    if sync != SYNC {
        return Err(AntError::Corrupted(format!(
            "expected sync byte 0x{SYNC:02X}, got 0x{sync:02X}"
        )));
    }

    let length = usize::from(buf[1]);
    let frame_len = length + FRAME_OVERHEAD;
    if buf.len() < frame_len {
        return Err(AntError::Incomplete {
            needed: frame_len,
            available: buf.len(),
        });
    }

    let expected = checksum(&buf[..frame_len - 1]);
    let actual = buf[frame_len - 1];
    if expected != actual {
        return Err(AntError::Corrupted(format!(
            "checksum should be 0x{expected:02X} but was 0x{actual:02X}"
        )));
    }

    let message = Message::from_parts(buf[2], &buf[HEADER_SIZE..HEADER_SIZE + length])?;
    Ok((message, frame_len))
}

/// Decode the frame at the front of `buf`
///
/// # Errors
///
/// See [`decode_frame`].
pub fn decode(buf: &[u8]) -> Result<Message> {
    decode_frame(buf).map(|(message, _)| message)
}

fn fixed<const N: usize>(payload: &[u8], what: &str) -> Result<[u8; N]> {
    <[u8; N]>::try_from(payload).map_err(|_| {
        AntError::Malformed(format!(
            "{what} payload must be {N} bytes, got {}",
            payload.len()
        ))
    })
}

fn decode_channel_event(payload: &[u8]) -> Result<Message> {
    let [channel, message_id, code] = fixed(payload, "channel event")?;
    Ok(Message::ChannelEvent(ChannelEvent {
        channel,
        message_id,
        code,
    }))
}

fn decode_channel_unassign(payload: &[u8]) -> Result<Message> {
    let [channel] = fixed(payload, "channel unassign")?;
    Ok(Message::ChannelUnassign { channel })
}

fn decode_channel_assign(payload: &[u8]) -> Result<Message> {
    let [channel, channel_type, network] = fixed(payload, "channel assign")?;
    Ok(Message::ChannelAssign {
        channel,
        channel_type: ChannelType::try_from(channel_type)?,
        network,
    })
}

fn decode_channel_period(payload: &[u8]) -> Result<Message> {
    let raw: [u8; 3] = fixed(payload, "channel period")?;
    let mut buf = &raw[..];
    let channel = buf.get_u8();
    let period = buf.get_u16_le();
    Ok(Message::ChannelPeriod { channel, period })
}

fn decode_channel_search_timeout(payload: &[u8]) -> Result<Message> {
    let [channel, timeout] = fixed(payload, "search timeout")?;
    Ok(Message::ChannelSearchTimeout { channel, timeout })
}

fn decode_channel_frequency(payload: &[u8]) -> Result<Message> {
    let [channel, frequency] = fixed(payload, "channel frequency")?;
    Ok(Message::ChannelFrequency { channel, frequency })
}

fn decode_channel_tx_power(payload: &[u8]) -> Result<Message> {
    let [channel, power] = fixed(payload, "channel tx power")?;
    Ok(Message::ChannelTxPower { channel, power })
}

fn decode_network_key(payload: &[u8]) -> Result<Message> {
    let raw: [u8; 9] = fixed(payload, "network key")?;
    let mut key = [0u8; 8];
    key.copy_from_slice(&raw[1..]);
    Ok(Message::NetworkKey {
        network: raw[0],
        key,
    })
}

fn decode_tx_power(payload: &[u8]) -> Result<Message> {
    let [_, power] = fixed(payload, "tx power")?;
    Ok(Message::TxPower { power })
}

fn decode_system_reset(payload: &[u8]) -> Result<Message> {
    let [_] = fixed(payload, "system reset")?;
    Ok(Message::SystemReset)
}

fn decode_channel_open(payload: &[u8]) -> Result<Message> {
    let [channel] = fixed(payload, "channel open")?;
    Ok(Message::ChannelOpen { channel })
}

fn decode_channel_close(payload: &[u8]) -> Result<Message> {
    let [channel] = fixed(payload, "channel close")?;
    Ok(Message::ChannelClose { channel })
}

fn decode_channel_request(payload: &[u8]) -> Result<Message> {
    let [channel, message_id] = fixed(payload, "channel request")?;
    Ok(Message::ChannelRequest {
        channel,
        message_id,
    })
}

fn decode_channel_data(payload: &[u8]) -> Result<ChannelData> {
    let raw: [u8; 9] = fixed(payload, "channel data")?;
    ChannelData::new(raw[0], &raw[1..])
}

fn decode_broadcast_data(payload: &[u8]) -> Result<Message> {
    decode_channel_data(payload).map(Message::BroadcastData)
}

fn decode_acknowledged_data(payload: &[u8]) -> Result<Message> {
    decode_channel_data(payload).map(Message::AcknowledgedData)
}

fn decode_burst_data(payload: &[u8]) -> Result<Message> {
    decode_channel_data(payload).map(Message::BurstData)
}

fn decode_channel_id(payload: &[u8]) -> Result<Message> {
    let raw: [u8; 5] = fixed(payload, "channel id")?;
    let mut buf = &raw[..];
    let channel = buf.get_u8();
    let device_number = buf.get_u16_le();
    let device_type = buf.get_u8();
    let transmission_type = buf.get_u8();
    Ok(Message::ChannelId {
        channel,
        id: ChannelId::new(device_number, device_type, transmission_type),
    })
}

fn decode_channel_status(payload: &[u8]) -> Result<Message> {
    let [channel, status] = fixed(payload, "channel status")?;
    Ok(Message::ChannelStatus { channel, status })
}

fn decode_capabilities(payload: &[u8]) -> Result<Message> {
    let advanced_options2 = match payload.len() {
        4 => None,
        5 => Some(payload[4]),
        other => {
            return Err(AntError::Malformed(format!(
                "capabilities payload must be 4 or 5 bytes, got {other}"
            )))
        }
    };
    Ok(Message::Capabilities(Capabilities {
        max_channels: payload[0],
        max_networks: payload[1],
        standard_options: payload[2],
        advanced_options: payload[3],
        advanced_options2,
    }))
}

fn decode_serial_number(payload: &[u8]) -> Result<Message> {
    let serial = fixed(payload, "serial number")?;
    Ok(Message::SerialNumber { serial })
}

fn decode_startup(payload: &[u8]) -> Result<Message> {
    let [reason] = fixed(payload, "startup")?;
    Ok(Message::Startup { reason })
}

fn decode_version(payload: &[u8]) -> Result<Message> {
    let version = fixed(payload, "version")?;
    Ok(Message::Version { version })
}
