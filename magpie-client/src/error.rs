use std::io;

use thiserror::Error;

use crate::packet::ConnectReturnCode;

/// Errors surfaced by client operations.
#[derive(Debug, Error)]
pub enum Error {
    /// A required parameter was missing or empty.
    #[error("null parameter: {0}")]
    NullParameter(&'static str),

    /// A string was not valid for the field it was used in, for example a
    /// topic name carrying a `+` or `#` wildcard.
    #[error("bad UTF-8 string")]
    BadUtf8String,

    /// The client is not connected.
    #[error("client is disconnected")]
    Disconnected,

    /// A non-blocking publish found the in-flight window full.
    #[error("maximum messages in flight")]
    MaxMessagesInflight,

    /// Every packet identifier is taken by an in-flight message.
    #[error("no more message ids available")]
    NoMoreMessageIds,

    /// The persistence store failed.
    #[error("persistence: {0}")]
    Persistence(String),

    /// A bounded wait elapsed.
    #[error("operation timed out")]
    Timeout,

    /// The broker refused the connection.
    #[error("{0}")]
    ConnectionRefused(ConnectReturnCode),

    /// The broker refused a subscription (SUBACK return code 0x80).
    #[error("subscribe failed")]
    SubscribeFailed,

    /// The peer violated the protocol.
    #[error("protocol error: {0}")]
    Protocol(&'static str),

    /// The operation is not valid in the client's current state.
    #[error("invalid state: {0}")]
    InvalidState(&'static str),

    /// The handle was used after `destroy`.
    #[error("client destroyed")]
    Destroyed,

    /// Transport failure.
    #[error(transparent)]
    Io(#[from] io::Error),
}
