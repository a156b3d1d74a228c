use thiserror::Error;

/// Errors that can occur when talking to an ANT node and its channels
#[derive(Error, Debug)]
pub enum AntError {
    /// Not enough bytes buffered to decode a frame yet
    #[error("Incomplete frame: need {needed} bytes, have {available}")]
    Incomplete {
        /// Bytes required for the frame
        needed: usize,
        /// Bytes currently buffered
        available: usize,
    },

    /// Bad sync byte or checksum; the stream must be resynchronized
    #[error("Corrupted frame: {0}")]
    Corrupted(String),

    /// Payload length or a field value is out of range
    #[error("Malformed message: {0}")]
    Malformed(String),

    /// A configuration acknowledgement carried a failure response code
    #[error("Channel {channel}: could not {operation} (response 0x{code:02X})")]
    ChannelConfig {
        /// Name of the configuration step
        operation: &'static str,
        /// Channel number the step was sent on
        channel: u8,
        /// Response code returned by the dongle
        code: u8,
    },

    /// No matching acknowledgement or message arrived in time
    #[error("Timed out after {timeout_ms}ms waiting for {what}")]
    WaitTimeout {
        /// Description of what was awaited
        what: String,
        /// Timeout duration in milliseconds
        timeout_ms: u64,
    },

    /// Node has not been started
    #[error("ANT node is not running")]
    NodeNotRunning,

    /// Node was started twice
    #[error("ANT node is already running")]
    NodeAlreadyRunning,

    /// Every channel in the pool is assigned
    #[error("No free channel available")]
    NoFreeChannel,

    /// Operation not allowed in the current state
    #[error("Invalid state: {0}")]
    InvalidState(String),

    /// Invalid caller-supplied parameters
    #[error("Invalid parameters: {0}")]
    InvalidParameters(String),

    /// Transport failure other than a plain I/O error
    #[error("Transport error: {0}")]
    Transport(String),

    /// Serial port errors
    #[error("Serial port error: {0}")]
    Serial(#[from] serialport::Error),

    /// USB bulk transfer errors
    #[error("USB transfer error: {0}")]
    Usb(#[from] nusb::transfer::TransferError),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type for ANT operations
pub type Result<T> = std::result::Result<T, AntError>;

impl AntError {
    /// Check if this error came from decoding a frame
    #[must_use]
    pub const fn is_frame_error(&self) -> bool {
        matches!(
            self,
            Self::Incomplete { .. } | Self::Corrupted(_) | Self::Malformed(_)
        )
    }

    /// Check if this error is a wait timeout
    #[must_use]
    pub const fn is_timeout(&self) -> bool {
        matches!(self, Self::WaitTimeout { .. })
    }

    /// Check if retrying the operation may succeed
    ///
    /// A timeout or a full channel pool can clear up on its own; a rejected
    /// configuration or a malformed message will not.
    #[must_use]
    pub const fn is_recoverable(&self) -> bool {
        matches!(
            self,
            Self::Incomplete { .. } | Self::WaitTimeout { .. } | Self::NoFreeChannel
        )
    }

    pub(crate) fn timeout(what: impl Into<String>, timeout: std::time::Duration) -> Self {
        Self::WaitTimeout {
            what: what.into(),
            timeout_ms: u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX),
        }
    }
}
