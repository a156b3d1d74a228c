use async_trait::async_trait;
use bytes::{Buf, BytesMut};
use futures::FutureExt;
use parking_lot::Mutex as SyncMutex;
use std::{
    collections::VecDeque,
    panic::AssertUnwindSafe,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    time::Duration,
};
use tokio::{sync::Mutex, task::JoinHandle, time::Instant};
use tracing::{debug, error, info, trace, warn};
use uuid::Uuid;

use crate::{
    error::{AntError, Result},
    protocol::{decode_frame, Message, MessageId, SYNC},
    transport::Transport,
    types::NodeConfig,
};

/// Receiver of every decoded frame
///
/// Listeners run on the reader task, in registration order. They must return
/// quickly; a listener that blocks stalls every other listener and every
/// pending wait.
#[async_trait]
pub trait Listener: Send + Sync {
    /// Handle one frame; errors are logged and do not stop the reader
    async fn process(&self, message: &Message) -> Result<()>;
}

/// Handle returned when registering a listener
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerId(Uuid);

impl ListenerId {
    pub(crate) fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

/// Bounded FIFO of frames awaiting a matching wait; the oldest frame is
/// dropped when full
#[derive(Debug)]
struct WaitQueue {
    frames: SyncMutex<VecDeque<Message>>,
    capacity: usize,
}

impl WaitQueue {
    fn new(capacity: usize) -> Self {
        Self {
            frames: SyncMutex::new(VecDeque::with_capacity(capacity)),
            capacity: capacity.max(1),
        }
    }

    fn push(&self, message: Message) {
        let mut frames = self.frames.lock();
        if frames.len() >= self.capacity {
            frames.pop_front();
        }
        frames.push_back(message);
    }

    fn take(&self, mut matches: impl FnMut(&Message) -> bool) -> Option<Message> {
        let mut frames = self.frames.lock();
        let index = frames.iter().position(|message| matches(message))?;
        frames.remove(index)
    }

    fn discard(&self, mut matches: impl FnMut(&Message) -> bool) -> usize {
        let mut frames = self.frames.lock();
        let before = frames.len();
        frames.retain(|message| !matches(message));
        before - frames.len()
    }

    fn len(&self) -> usize {
        self.frames.lock().len()
    }

    fn clear(&self) {
        self.frames.lock().clear();
    }
}

const READ_RETRY_DELAY: Duration = Duration::from_millis(10);
const MAX_READ_RETRY_DELAY: Duration = Duration::from_secs(1);

/// Captures configuration acknowledgements
struct AckQueue(Arc<WaitQueue>);

#[async_trait]
impl Listener for AckQueue {
    async fn process(&self, message: &Message) -> Result<()> {
        if let Message::ChannelEvent(event) = message {
            if !event.is_event() {
                self.0.push(message.clone());
            }
        }
        Ok(())
    }
}

/// Captures every frame for [`EventDispatcher::wait_for_message_type`]
struct MessageQueue(Arc<WaitQueue>);

#[async_trait]
impl Listener for MessageQueue {
    async fn process(&self, message: &Message) -> Result<()> {
        self.0.push(message.clone());
        Ok(())
    }
}

type ListenerList = Arc<Mutex<Vec<(ListenerId, Arc<dyn Listener>)>>>;

/// Owns the transport, decodes incoming frames on a background task and fans
/// them out to listeners
pub struct EventDispatcher {
    transport: Arc<Mutex<Box<dyn Transport>>>,
    listeners: ListenerList,
    acks: Arc<WaitQueue>,
    messages: Arc<WaitQueue>,
    running: Arc<AtomicBool>,
    failure: Arc<SyncMutex<Option<String>>>,
    reader: SyncMutex<Option<JoinHandle<()>>>,
    config: NodeConfig,
}

impl EventDispatcher {
    /// Create a dispatcher with the built-in ack and message queues registered
    #[must_use]
    pub fn new(transport: Box<dyn Transport>, config: NodeConfig) -> Self {
        let acks = Arc::new(WaitQueue::new(config.queue_capacity));
        let messages = Arc::new(WaitQueue::new(config.queue_capacity));

        let builtin: Vec<(ListenerId, Arc<dyn Listener>)> = vec![
            (ListenerId::new(), Arc::new(AckQueue(acks.clone()))),
            (ListenerId::new(), Arc::new(MessageQueue(messages.clone()))),
        ];

        Self {
            transport: Arc::new(Mutex::new(transport)),
            listeners: Arc::new(Mutex::new(builtin)),
            acks,
            messages,
            running: Arc::new(AtomicBool::new(false)),
            failure: Arc::new(SyncMutex::new(None)),
            reader: SyncMutex::new(None),
            config,
        }
    }

    /// Timing configuration
    #[must_use]
    pub const fn config(&self) -> &NodeConfig {
        &self.config
    }

    /// Whether the reader task is running
    ///
    /// Turns false on its own when the transport keeps failing; see
    /// [`Self::last_failure`].
    #[must_use]
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Read error that made the reader task give up, if any
    #[must_use]
    pub fn last_failure(&self) -> Option<String> {
        self.failure.lock().clone()
    }

    /// Open the transport and spawn the reader task
    ///
    /// # Errors
    ///
    /// Returns [`AntError::NodeAlreadyRunning`] if already started, or the
    /// transport's error if it cannot be opened.
    pub async fn start(&self) -> Result<()> {
        if self.running.swap(true, Ordering::SeqCst) {
            return Err(AntError::NodeAlreadyRunning);
        }

        if let Err(e) = self.transport.lock().await.open().await {
            self.running.store(false, Ordering::SeqCst);
            return Err(e);
        }

        self.acks.clear();
        self.messages.clear();
        *self.failure.lock() = None;

        let task = tokio::spawn(pump(
            self.transport.clone(),
            self.listeners.clone(),
            Reader {
                running: self.running.clone(),
                failure: self.failure.clone(),
                chunk_size: self.config.read_chunk_size.max(1),
                max_failures: self.config.max_read_failures.max(1),
            },
        ));
        *self.reader.lock() = Some(task);

        info!("Event dispatcher started");
        Ok(())
    }

    /// Stop the reader task and close the transport
    ///
    /// Returns once the reader task has exited. Stopping a dispatcher that is
    /// not running only closes the transport.
    ///
    /// # Errors
    ///
    /// Returns the transport's error if closing it fails.
    pub async fn stop(&self) -> Result<()> {
        self.running.store(false, Ordering::SeqCst);

        let task = self.reader.lock().take();
        if let Some(task) = task {
            if let Err(e) = task.await {
                error!("Reader task ended abnormally: {}", e);
            }
            info!("Event dispatcher stopped");
        }

        self.transport.lock().await.close().await
    }

    /// Register a listener; it sees every frame decoded from now on
    pub async fn register_listener(&self, listener: Arc<dyn Listener>) -> ListenerId {
        let id = ListenerId::new();
        self.listeners.lock().await.push((id, listener));
        id
    }

    /// Remove a listener; returns whether it was registered
    pub async fn remove_listener(&self, id: ListenerId) -> bool {
        let mut listeners = self.listeners.lock().await;
        let before = listeners.len();
        listeners.retain(|(registered, _)| *registered != id);
        listeners.len() != before
    }

    /// Encode and write a frame
    ///
    /// # Errors
    ///
    /// Returns [`AntError::NodeNotRunning`] before `start`, a codec error if
    /// the frame cannot be encoded, or the transport's write error.
    pub async fn write(&self, message: &Message) -> Result<()> {
        if !self.is_running() {
            return Err(AntError::NodeNotRunning);
        }

        let bytes = message.encode()?;
        debug!("Sending {}", message);
        trace!("TX {:02X?}", &bytes[..]);

        self.transport.lock().await.write(&bytes).await?;
        Ok(())
    }

    /// Write a frame and wait for the acknowledgement echoing its type code
    /// and channel
    ///
    /// The returned frame is always a [`Message::ChannelEvent`]; the caller
    /// decides what a non-zero response code means.
    ///
    /// # Errors
    ///
    /// Returns [`AntError::WaitTimeout`] if no acknowledgement arrives within
    /// `timeout`, or any error from [`Self::write`].
    pub async fn write_and_wait_for_ack(
        &self,
        message: &Message,
        timeout: Duration,
    ) -> Result<Message> {
        let msg_type = message.msg_type();
        let channel = message.ack_channel();
        self.write(message).await?;

        let ack = self
            .poll(&self.acks, timeout, |frame| {
                matches!(frame, Message::ChannelEvent(event)
                    if event.message_id == msg_type
                        && channel.is_none_or(|channel| event.channel == channel))
            })
            .await;

        ack.ok_or_else(|| {
            let what = MessageId::from_u8(msg_type).map_or_else(
                || format!("ack for 0x{msg_type:02X}"),
                |id| format!("ack for {id:?}"),
            );
            AntError::timeout(what, timeout)
        })
    }

    /// Wait for the next frame with the given type code
    ///
    /// Frames that arrived before the call and are still queued count.
    ///
    /// # Errors
    ///
    /// Returns [`AntError::WaitTimeout`] if none arrives within `timeout`.
    pub async fn wait_for_message_type(&self, msg_type: u8, timeout: Duration) -> Result<Message> {
        self.wait_for_message(timeout, |frame| frame.msg_type() == msg_type)
            .await
            .ok_or_else(|| {
                let what = MessageId::from_u8(msg_type)
                    .map_or_else(|| format!("message 0x{msg_type:02X}"), |id| format!("{id:?}"));
                AntError::timeout(what, timeout)
            })
    }

    /// Wait for the next queued frame satisfying `matches`
    pub(crate) async fn wait_for_message(
        &self,
        timeout: Duration,
        matches: impl FnMut(&Message) -> bool,
    ) -> Option<Message> {
        self.poll(&self.messages, timeout, matches).await
    }

    /// Drop queued frames satisfying `matches`; returns how many were dropped
    pub(crate) fn discard_messages(&self, matches: impl FnMut(&Message) -> bool) -> usize {
        self.messages.discard(matches)
    }

    async fn poll(
        &self,
        queue: &WaitQueue,
        timeout: Duration,
        mut matches: impl FnMut(&Message) -> bool,
    ) -> Option<Message> {
        let deadline = Instant::now() + timeout;
        let interval = Duration::from_millis(self.config.poll_interval_ms.max(1));

        loop {
            if let Some(frame) = queue.take(&mut matches) {
                return Some(frame);
            }
            if Instant::now() >= deadline {
                return None;
            }
            tokio::time::sleep(interval).await;
        }
    }

    #[cfg(test)]
    pub(crate) fn queued(&self) -> (usize, usize) {
        (self.acks.len(), self.messages.len())
    }
}

struct Reader {
    running: Arc<AtomicBool>,
    failure: Arc<SyncMutex<Option<String>>>,
    chunk_size: usize,
    max_failures: u32,
}

fn retry_delay(failures: u32) -> Duration {
    let factor = 2u32.saturating_pow(failures.saturating_sub(1));
    READ_RETRY_DELAY
        .saturating_mul(factor)
        .min(MAX_READ_RETRY_DELAY)
}

/// Reader loop: read, decode every complete frame, dispatch, repeat
///
/// Failed reads are retried with a growing delay; after `max_failures` in a
/// row the loop stops and records the error.
async fn pump(transport: Arc<Mutex<Box<dyn Transport>>>, listeners: ListenerList, reader: Reader) {
    let Reader {
        running,
        failure,
        chunk_size,
        max_failures,
    } = reader;
    let mut buffer = BytesMut::with_capacity(chunk_size * 4);
    let mut failures = 0u32;

    while running.load(Ordering::SeqCst) {
        let read = transport.lock().await.read(chunk_size).await;
        let chunk = match read {
            Ok(chunk) => {
                failures = 0;
                chunk
            }
            Err(e) => {
                if !running.load(Ordering::SeqCst) {
                    break;
                }
                failures += 1;
                if failures >= max_failures {
                    error!("Transport read failed {} times in a row, stopping: {}", failures, e);
                    *failure.lock() = Some(e.to_string());
                    running.store(false, Ordering::SeqCst);
                    break;
                }
                let delay = retry_delay(failures);
                warn!(
                    "Transport read failed ({}/{}), retrying in {:?}: {}",
                    failures, max_failures, delay, e
                );
                tokio::time::sleep(delay).await;
                continue;
            }
        };

        if chunk.is_empty() {
            continue;
        }
        trace!("RX {:02X?}", &chunk[..]);
        buffer.extend_from_slice(&chunk);

        while !buffer.is_empty() {
            match decode_frame(&buffer) {
                Ok((message, consumed)) => {
                    buffer.advance(consumed);
                    dispatch(&listeners, &message).await;
                }
                Err(AntError::Incomplete { .. }) => break,
                Err(e) => {
                    let skipped = resync(&mut buffer);
                    warn!("Dropped {} bytes: {}", skipped, e);
                }
            }
        }
    }

    debug!("Reader task exiting");
}

/// Discard the byte at the head and everything up to the next sync byte
fn resync(buffer: &mut BytesMut) -> usize {
    let skip = buffer
        .iter()
        .skip(1)
        .position(|byte| *byte == SYNC)
        .map_or(buffer.len(), |index| index + 1);
    buffer.advance(skip);
    skip
}

async fn dispatch(listeners: &ListenerList, message: &Message) {
    trace!("Dispatching {}", message);
    let listeners = listeners.lock().await;

    for (id, listener) in listeners.iter() {
        match AssertUnwindSafe(listener.process(message))
            .catch_unwind()
            .await
        {
            Ok(Ok(())) => {}
            Ok(Err(e)) => warn!("Listener {:?} failed on {}: {}", id, message, e),
            Err(_) => error!("Listener {:?} panicked on {}", id, message),
        }
    }
}
