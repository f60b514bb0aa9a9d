use std::io;
use std::net::SocketAddr;

use thiserror::Error;

use crate::net::socket_id::SocketId;

/// Failures of the Thrift-compatible primitive codecs.
#[derive(Debug, Error)]
pub enum CodecError {
    #[error("buffer underflow: needed {needed} bytes, {remaining} remaining")]
    Underflow { needed: usize, remaining: usize },
    #[error("malformed varint: {0}")]
    Varint(String),
    #[error("negative size {0}")]
    NegativeSize(i64),
    /// A string or container announced more elements than the configured limit allows
    #[error("size {size} exceeds the configured limit of {limit}")]
    SizeLimit { size: usize, limit: usize },
    #[error("bad protocol version {0:#x}")]
    BadVersion(u32),
    #[error("invalid data: {0}")]
    InvalidData(String),
    #[error("nesting deeper than {0} levels")]
    DepthLimit(usize),
}

/// Failures of the packet coder, i.e. framing and message dispatch on top of a codec.
#[derive(Debug, Error)]
pub enum CoderError {
    #[error("frame length {len} exceeds maximum of {max}")]
    FrameTooLarge { len: usize, max: usize },
    #[error("frame declares {declared} bytes but {consumed} were consumed")]
    LengthMismatch { declared: usize, consumed: usize },
    #[error("unknown thrift protocol {0}")]
    UnknownProtocol(u32),
    #[error("snappy: {0}")]
    Compression(#[from] snap::Error),
    #[error(transparent)]
    Codec(#[from] CodecError),
    #[error("unknown message {0}")]
    UnknownMessage(String),
    #[error("invalid forward message: {0}")]
    Forward(String),
}

impl CoderError {
    pub fn is_size_limit(&self) -> bool {
        matches!(self, CoderError::Codec(CodecError::SizeLimit { .. }))
    }

    pub fn is_unknown_message(&self) -> bool {
        matches!(self, CoderError::UnknownMessage(_))
    }
}

#[derive(Debug, Error)]
pub enum ChannelError {
    #[error("channel is stopped")]
    Stopped,
    #[error("send queue is full ({limit} messages)")]
    QueueFull { limit: usize },
    #[error("connection closed by peer")]
    Closed,
    #[error(transparent)]
    Io(#[from] io::Error),
    #[error(transparent)]
    Coder(#[from] CoderError),
    #[error("{0}")]
    Handler(String),
}

#[derive(Debug, Error)]
pub enum ManagerError {
    #[error("inbound connection limit of {limit} reached")]
    InboundLimit { limit: usize },
    #[error("socket id {0} is already registered")]
    DuplicateSocketId(SocketId),
    #[error("no live channel {0}")]
    ChannelNotFound(SocketId),
    #[error("broadcast message {0} without nonce")]
    MissingNonce(String),
    #[error("no active channel")]
    NoActiveChannel,
    #[error("message {0} has no route path")]
    MissingPath(String),
    #[error("no neighbor on the route path of message {0}")]
    NoRoute(String),
    #[error("already {0} for {1}")]
    Duplicate(&'static str, SocketAddr),
    #[error("not listening on {0}")]
    NoListener(SocketAddr),
    #[error("no pending connect to {0}")]
    NoConnector(SocketAddr),
    #[error("connection manager is stopped")]
    Stopped,
    #[error(transparent)]
    Channel(#[from] ChannelError),
}
