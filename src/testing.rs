//! In-memory dongle used by the unit tests

use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use parking_lot::Mutex;
use std::{collections::HashMap, sync::Arc, time::Duration};

use crate::{
    error::{AntError, Result},
    protocol::{
        decode, Capabilities, ChannelData, ChannelEvent, Message, MessageId,
        CHANNEL_EVENT_MESSAGE_ID,
    },
    transport::Transport,
    types::{ChannelId, EventCode},
};

#[derive(Debug)]
struct MockState {
    open: bool,
    inbound: BytesMut,
    written: Vec<Message>,
    auto_respond: bool,
    send_startup: bool,
    close_event: bool,
    fail_reads: bool,
    capabilities: Capabilities,
    response_codes: HashMap<u8, u8>,
    channel_ids: HashMap<u8, ChannelId>,
}

/// Transport that answers configuration frames the way a healthy dongle does
///
/// Clones share state, so a test keeps one clone to inject frames and inspect
/// what was written after the other has been handed to a node.
#[derive(Debug, Clone)]
pub struct MockTransport {
    state: Arc<Mutex<MockState>>,
}

impl Default for MockTransport {
    fn default() -> Self {
        Self::new()
    }
}

impl MockTransport {
    pub fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(MockState {
                open: false,
                inbound: BytesMut::new(),
                written: Vec::new(),
                auto_respond: true,
                send_startup: true,
                close_event: true,
                fail_reads: false,
                capabilities: Capabilities {
                    max_channels: 8,
                    max_networks: 3,
                    standard_options: 0,
                    advanced_options: 0xBA,
                    advanced_options2: Some(0x36),
                },
                response_codes: HashMap::new(),
                channel_ids: HashMap::new(),
            })),
        }
    }

    /// Stop answering reset with a startup frame
    pub fn without_startup(self) -> Self {
        self.state.lock().send_startup = false;
        self
    }

    /// Answer nothing at all
    pub fn silent(self) -> Self {
        self.state.lock().auto_respond = false;
        self
    }

    /// Acknowledge close frames without following up with CHANNEL_CLOSED
    pub fn without_close_event(self) -> Self {
        self.state.lock().close_event = false;
        self
    }

    /// Make every read fail from now on, like an unplugged dongle
    pub fn fail_reads(&self) {
        self.state.lock().fail_reads = true;
    }

    pub fn with_channels(self, max_channels: u8) -> Self {
        self.state.lock().capabilities.max_channels = max_channels;
        self
    }

    /// Acknowledge every frame of `msg_type` with `code` instead of success
    pub fn reject(&self, msg_type: MessageId, code: u8) {
        self.state
            .lock()
            .response_codes
            .insert(msg_type as u8, code);
    }

    pub fn inject(&self, message: &Message) {
        let bytes = message.encode().expect("encodable test frame");
        self.inject_bytes(&bytes);
    }

    pub fn inject_bytes(&self, bytes: &[u8]) {
        self.state.lock().inbound.extend_from_slice(bytes);
    }

    pub fn broadcast(&self, channel: u8, data: [u8; 8]) {
        self.inject(&Message::BroadcastData(ChannelData { channel, data }));
    }

    pub fn event(&self, channel: u8, code: EventCode) {
        self.inject(&Message::ChannelEvent(ChannelEvent {
            channel,
            message_id: CHANNEL_EVENT_MESSAGE_ID,
            code: code.into(),
        }));
    }

    pub fn written(&self) -> Vec<Message> {
        self.state.lock().written.clone()
    }

    pub fn written_of_type(&self, msg_type: MessageId) -> Vec<Message> {
        self.written()
            .into_iter()
            .filter(|message| message.msg_type() == msg_type as u8)
            .collect()
    }

    pub fn clear_written(&self) {
        self.state.lock().written.clear();
    }

    pub fn is_open(&self) -> bool {
        self.state.lock().open
    }

    fn respond(state: &mut MockState, message: &Message) {
        let mut replies = Vec::new();
        let ack = |channel: u8, msg_type: u8| {
            Message::ChannelEvent(ChannelEvent {
                channel,
                message_id: msg_type,
                code: state.response_codes.get(&msg_type).copied().unwrap_or(0),
            })
        };

        match message {
            Message::SystemReset => {
                if state.send_startup {
                    replies.push(Message::Startup { reason: 0x20 });
                }
            }
            Message::ChannelRequest {
                channel,
                message_id,
            } => match MessageId::from_u8(*message_id) {
                Some(MessageId::Capabilities) => {
                    replies.push(Message::Capabilities(state.capabilities));
                }
                Some(MessageId::Version) => replies.push(Message::Version {
                    version: *b"AJK3.10\0\0",
                }),
                Some(MessageId::SerialNumber) => replies.push(Message::SerialNumber {
                    serial: [0x78, 0x56, 0x34, 0x12],
                }),
                Some(MessageId::ChannelId) => replies.push(Message::ChannelId {
                    channel: *channel,
                    id: state
                        .channel_ids
                        .get(channel)
                        .copied()
                        .unwrap_or_default(),
                }),
                Some(MessageId::ChannelStatus) => replies.push(Message::ChannelStatus {
                    channel: *channel,
                    status: 0x03,
                }),
                _ => {}
            },
            Message::ChannelClose { channel } => {
                let closed = ack(*channel, message.msg_type());
                let accepted = matches!(&closed, Message::ChannelEvent(event) if event.code == 0);
                replies.push(closed);
                if accepted && state.close_event {
                    replies.push(Message::ChannelEvent(ChannelEvent {
                        channel: *channel,
                        message_id: CHANNEL_EVENT_MESSAGE_ID,
                        code: EventCode::ChannelClosed.into(),
                    }));
                }
            }
            Message::ChannelId { channel, id } => {
                replies.push(ack(*channel, message.msg_type()));
                state.channel_ids.insert(*channel, *id);
            }
            Message::NetworkKey { network, .. } => {
                replies.push(ack(*network, message.msg_type()));
            }
            Message::TxPower { .. } => replies.push(ack(0, message.msg_type())),
            Message::AcknowledgedData(data) => {
                replies.push(Message::ChannelEvent(ChannelEvent {
                    channel: data.channel,
                    message_id: CHANNEL_EVENT_MESSAGE_ID,
                    code: EventCode::TransferTxCompleted.into(),
                }));
            }
            Message::ChannelUnassign { channel }
            | Message::ChannelAssign { channel, .. }
            | Message::ChannelPeriod { channel, .. }
            | Message::ChannelSearchTimeout { channel, .. }
            | Message::ChannelFrequency { channel, .. }
            | Message::ChannelTxPower { channel, .. }
            | Message::ChannelOpen { channel } => {
                replies.push(ack(*channel, message.msg_type()));
            }
            _ => {}
        }

        for reply in replies {
            if let Ok(bytes) = reply.encode() {
                state.inbound.extend_from_slice(&bytes);
            }
        }
    }
}

#[async_trait]
impl Transport for MockTransport {
    async fn open(&mut self) -> Result<()> {
        self.state.lock().open = true;
        Ok(())
    }

    async fn close(&mut self) -> Result<()> {
        self.state.lock().open = false;
        Ok(())
    }

    async fn read(&mut self, max: usize) -> Result<Bytes> {
        let chunk = {
            let mut state = self.state.lock();
            if !state.open {
                return Err(AntError::Transport("mock transport is closed".to_string()));
            }
            if state.fail_reads {
                return Err(AntError::Transport("mock transport unplugged".to_string()));
            }
            let take = max.min(state.inbound.len());
            state.inbound.split_to(take).freeze()
        };

        if chunk.is_empty() {
            tokio::time::sleep(Duration::from_millis(2)).await;
        }
        Ok(chunk)
    }

    async fn write(&mut self, data: &[u8]) -> Result<usize> {
        let mut state = self.state.lock();
        if !state.open {
            return Err(AntError::Transport("mock transport is closed".to_string()));
        }

        let message = decode(data)?;
        if state.auto_respond {
            Self::respond(&mut state, &message);
        }
        state.written.push(message);
        Ok(data.len())
    }

    fn is_open(&self) -> bool {
        self.state.lock().open
    }
}

/// Poll `condition` until it holds or two seconds pass
pub async fn eventually(mut condition: impl FnMut() -> bool) -> bool {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
    while tokio::time::Instant::now() < deadline {
        if condition() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(2)).await;
    }
    condition()
}
