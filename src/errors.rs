// Copyright (c) 2026, The amqp-messenger Authors
// MIT License
// All rights reserved.

//! # Error Types
//!
//! This module defines the error taxonomy of the crate. Broker I/O failures are
//! `TransportError`, payload problems are `DecodeError`, invalid connection
//! strings or options are `ConfigurationError` (raised at construction, never
//! at consume time), and handler outcomes are `HandlerError`.

use thiserror::Error;

/// Boxed error type carried as the cause of a handler failure.
pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Represents a failed broker operation.
///
/// Each variant names the operation that failed and carries the underlying
/// lapin error as its source. The transport layer never retries on its own;
/// these errors always surface to the caller.
#[derive(Error, Debug)]
pub enum TransportError {
    /// Error establishing a connection to the broker
    #[error("failure to connect")]
    Connect(#[source] lapin::Error),

    /// Error creating a channel from an established connection
    #[error("failure to create a channel")]
    Channel(#[source] lapin::Error),

    /// Error fetching a pending delivery from the queue
    #[error("failure to fetch a delivery")]
    Get(#[source] lapin::Error),

    /// Error acknowledging a delivery
    #[error("failure to ack message")]
    Ack(#[source] lapin::Error),

    /// Error negative-acknowledging a delivery
    #[error("failure to nack message")]
    Nack(#[source] lapin::Error),

    /// Error publishing a message
    #[error("failure to publish")]
    Publish(#[source] lapin::Error),

    /// Error declaring an exchange with the given name
    #[error("failure to declare the exchange `{0}`")]
    DeclareExchange(String, #[source] lapin::Error),

    /// Error declaring a queue with the given name
    #[error("failure to declare the queue `{0}`")]
    DeclareQueue(String, #[source] lapin::Error),

    /// Error binding a queue to an exchange
    #[error("failure to bind the queue `{0}` to the exchange `{1}`")]
    BindQueue(String, String, #[source] lapin::Error),

    /// A retry was requested on a connection without a retry policy
    #[error("no retry policy is configured for this transport")]
    RetryNotConfigured,
}

/// Represents a payload that could not be turned into a domain envelope.
#[derive(Error, Debug)]
pub enum DecodeError {
    /// The message body could not be parsed
    #[error("failure to parse payload")]
    Payload(#[source] serde_json::Error),

    /// The `type` header names a message type this consumer does not know
    #[error("unsupported message type `{0}`")]
    UnsupportedType(String),
}

/// Represents an invalid connection string or option set.
///
/// Raised eagerly while building a [`ConnectionConfig`], so a misconfigured
/// transport fails at startup instead of while consuming.
///
/// [`ConnectionConfig`]: crate::config::ConnectionConfig
#[derive(Error, Debug, PartialEq, Eq)]
pub enum ConfigurationError {
    /// The DSN could not be parsed
    #[error("the given AMQP DSN `{0}` is invalid")]
    InvalidDsn(String),

    /// A broker argument that must be numeric was not
    #[error("integer expected for queue argument `{0}`")]
    IntegerExpected(String),

    /// An option carried a value of the wrong shape
    #[error("invalid value `{1}` for option `{0}`")]
    InvalidValue(String, String),

    /// An option name is not part of the recognized surface
    #[error("unknown option `{0}`")]
    UnknownOption(String),
}

/// Represents a failed dispatch of an envelope to the message bus.
///
/// The worker uses the variant to classify the disposition: an
/// [`Unrecoverable`](HandlerError::Unrecoverable) failure is rejected
/// immediately, everything else goes through retry accounting.
#[derive(Error, Debug)]
pub enum HandlerError {
    /// Retrying is known to be futile, the message must be rejected
    #[error("unrecoverable failure while handling the message")]
    Unrecoverable(#[source] BoxError),

    /// The handler failed but a later attempt may succeed
    #[error("failure while handling the message")]
    Recoverable(#[source] BoxError),

    /// The payload could not be decoded into an envelope
    #[error(transparent)]
    Decode(#[from] DecodeError),
}

impl HandlerError {
    /// Whether this failure bypasses retry accounting entirely.
    pub fn is_unrecoverable(&self) -> bool {
        matches!(self, HandlerError::Unrecoverable(_))
    }
}
