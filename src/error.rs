use crate::codec::FrameFormatError;
use crate::frame::FrameKind;
use crate::method::MethodSignature;
use std::io;
use thiserror::Error;

/// Errors surfaced by the protocol engine.
///
/// Transport and frame-format failures are fatal: the connection is torn
/// down and every waiter sees the error. `UnexpectedFrame`,
/// `UnexpectedMethod`, and `ChannelClosedByPeer` are scoped to one channel
/// and leave the connection usable. `HeartbeatTimeout` and `Timeout` are
/// recoverable at the caller's discretion.
#[derive(Debug, Error)]
pub enum AmqpError {
    /// I/O failure on the byte stream, including EOF mid-protocol
    #[error("transport error: {0}")]
    Transport(#[from] io::Error),

    /// Malformed wire data; fatal to the connection
    #[error("frame format error: {0}")]
    FrameFormat(#[from] FrameFormatError),

    /// Frame kind did not match what the channel's content assembly
    /// expected next
    #[error("channel {channel}: received {kind:?} frame while expecting {expected:?}")]
    UnexpectedFrame {
        channel: u16,
        kind: FrameKind,
        expected: FrameKind,
    },

    /// Received a method this channel has no handler for
    #[error("channel {channel}: unexpected method {sig}")]
    UnexpectedMethod {
        channel: u16,
        sig: MethodSignature,
    },

    /// The server sent Connection.Close
    #[error("connection closed by peer: {reply_code} {reply_text}")]
    ConnectionClosedByPeer {
        reply_code: u16,
        reply_text: String,
        cause: MethodSignature,
    },

    /// The server sent Channel.Close
    #[error("channel {channel} closed by peer: {reply_code} {reply_text}")]
    ChannelClosedByPeer {
        channel: u16,
        reply_code: u16,
        reply_text: String,
        cause: MethodSignature,
    },

    /// Every id in `[1, channel_max]` is in use
    #[error("no free channel ids (channel_max={channel_max})")]
    NoFreeChannels { channel_max: u16 },

    /// Two consecutive heartbeat intervals passed without inbound traffic
    #[error("too many missed heartbeats")]
    HeartbeatTimeout,

    /// A read deadline expired, or the wait was cancelled
    #[error("operation timed out")]
    Timeout,

    /// Operation attempted in a state that cannot serve it
    #[error("invalid state: {0}")]
    InvalidState(&'static str),
}

/// Result type alias for engine operations.
pub type AmqpResult<T> = Result<T, AmqpError>;

impl AmqpError {
    /// True for errors that leave the connection unusable.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            AmqpError::Transport(_)
                | AmqpError::FrameFormat(_)
                | AmqpError::ConnectionClosedByPeer { .. }
        )
    }
}
