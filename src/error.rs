use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Violations of the block/message ordering rules of the event stream.
#[derive(Debug, Error, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ProtocolError {
    #[error("block {requested} started while block {open} is still open")]
    BlockAlreadyOpen { open: usize, requested: usize },
    #[error("block {index} was already closed for this message")]
    BlockReopened { index: usize },
    #[error("event for block {index} but no block is open")]
    NoOpenBlock { index: usize },
    #[error("event for block {got} but block {open} is open")]
    IndexMismatch { open: usize, got: usize },
    #[error("{delta} delta does not fit the open {block} block {index}")]
    DeltaKindMismatch {
        index: usize,
        block: String,
        delta: String,
    },
    #[error("invalid input for tool use {id}: {message}")]
    InvalidToolInput { id: String, message: String },
    #[error("message_start while a message is already in progress")]
    MessageAlreadyStarted,
    #[error("message_stop without a message in progress")]
    NoMessageInProgress,
    #[error("message_stop while block {index} is still open")]
    MessageStopWithOpenBlock { index: usize },
    #[error("stream ended before the message was complete")]
    StreamEnded,
}

/// A single chunk that could not be decoded into an event.
#[derive(Debug, Error, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[error("malformed chunk: {message}")]
pub struct DecodeError {
    pub message: String,
    /// Leading bytes of the offending chunk, lossily decoded.
    pub excerpt: String,
}

impl DecodeError {
    const EXCERPT_LEN: usize = 120;

    pub fn new(message: impl Into<String>, chunk: &[u8]) -> Self {
        let end = chunk.len().min(Self::EXCERPT_LEN);
        Self {
            message: message.into(),
            excerpt: String::from_utf8_lossy(&chunk[..end]).into_owned(),
        }
    }
}

/// Failures raised by a [`crate::Device`] while executing an action.
#[derive(Debug, Error, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum DeviceError {
    #[error("device action failed: {0}")]
    Failed(String),
    #[error("device does not support {0}")]
    Unsupported(String),
}

#[derive(Debug, Error, Clone, PartialEq, Serialize, Deserialize)]
pub enum Error {
    #[error("transport error: {0}")]
    Transport(String),
    #[error(transparent)]
    Decode(#[from] DecodeError),
    #[error("{count} consecutive malformed chunks, last: {last}")]
    MalformedStream { count: usize, last: DecodeError },
    #[error("protocol error: {0}")]
    Protocol(#[from] ProtocolError),
    #[error("unknown tool: {name}")]
    UnknownTool { name: String },
    #[error(transparent)]
    Device(#[from] DeviceError),
    #[error("provider error ({kind}): {message}")]
    Provider {
        kind: String,
        message: String,
        status_code: Option<u16>,
    },
    #[error("config error: {0}")]
    Config(String),
    #[error("turn limit of {0} reached")]
    TurnLimit(usize),
    #[error("internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Recoverable errors never end a run: a malformed chunk is skipped and a
    /// device failure is reported back to the model as a tool result.
    pub fn is_recoverable(&self) -> bool {
        matches!(self, Error::Decode(_) | Error::Device(_))
    }

    pub(crate) fn transport(err: impl std::fmt::Display) -> Self {
        Error::Transport(err.to_string())
    }
}
