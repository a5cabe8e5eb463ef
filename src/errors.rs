// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Error Types for the RabbitMQ Bridge
//!
//! Errors are grouped by the layer that raises them. Declarative problems
//! (topology, envelope construction, preference lists) and protocol mismatches
//! (missing codecs) are never retried. Broker failures are logged where they
//! happen and surfaced through [`AmqpError`], which also wraps every other
//! error type so callers can use a single `Result` alias at the seams.

use std::time::Duration;
use thiserror::Error;

/// Aggregated topology validation failure.
///
/// Validation collects every violation before failing, so the message
/// enumerates all of them, one per line.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("invalid topology ({} violations){}", .violations.len(), render(.violations))]
pub struct TopologyError {
    violations: Vec<String>,
}

fn render(violations: &[String]) -> String {
    violations
        .iter()
        .map(|violation| format!("\n  - {}", violation))
        .collect()
}

impl TopologyError {
    pub(crate) fn new(violations: Vec<String>) -> Self {
        TopologyError { violations }
    }

    /// Every violation found, in the order they were detected.
    pub fn violations(&self) -> &[String] {
        &self.violations
    }
}

/// Errors raised while constructing message envelopes.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum EnvelopeError {
    /// Delivery mode outside the two recognized values
    #[error("invalid delivery mode `{0}`, expected 1 (transient) or 2 (persistent)")]
    InvalidDeliveryMode(u8),

    /// A response carried a correlation id different from its request's
    #[error("response correlation id `{found}` does not match request correlation id `{expected}`")]
    CorrelationMismatch { expected: String, found: String },

    /// A response's exchange or routing key was overridden
    #[error("the {0} of a response is derived from its request and cannot be changed")]
    DestinationPinned(&'static str),

    /// A builder was finished without content
    #[error("message has no content")]
    MissingContent,

    /// An incoming response arrived without a correlation id
    #[error("incoming response has no correlation id")]
    MissingCorrelationId,
}

/// Errors raised while parsing or applying an Accept-Encoding preference list.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum EncodingError {
    /// An entry could not be parsed
    #[error("malformed accept-encoding entry `{0}`")]
    Malformed(String),

    /// A weight outside [0, 1]
    #[error("accept-encoding weight `{0}` is out of range [0, 1]")]
    WeightOutOfRange(String),

    /// No supported encoding is acceptable to the peer
    #[error("no acceptable content encoding in `{0}`")]
    NotAcceptable(String),

    /// A content-encoding this bridge cannot decode
    #[error("unsupported content encoding `{0}`")]
    Unsupported(String),
}

/// Errors raised by the serialization negotiator.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CodecError {
    /// No registered reader accepts the message
    #[error("no applicable reader for payload type `{0}`")]
    NoReader(&'static str),

    /// No registered writer accepts the message
    #[error("no applicable writer for payload type `{0}`")]
    NoWriter(&'static str),

    /// The serialized message would exceed the configured bound
    #[error("message too large: exceeds the maximum of {max} bytes")]
    TooLarge { max: usize },

    /// Reader failure
    #[error("failure to decode payload: {0}")]
    Decode(String),

    /// Writer failure
    #[error("failure to encode payload: {0}")]
    Encode(String),

    /// Content encoding negotiation failure
    #[error(transparent)]
    Encoding(#[from] EncodingError),
}

/// Represents errors that can occur during AMQP/RabbitMQ operations.
///
/// Covers connection, channel, declaration, publishing and consumer failures,
/// and wraps the validation and negotiation errors of the other layers.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum AmqpError {
    /// Error establishing a connection to the RabbitMQ server
    #[error("failure to connect: {0}")]
    ConnectionError(String),

    /// The retry loop ran out of wall-clock budget
    #[error("failure to connect within {elapsed:?} after {attempts} attempts")]
    ConnectDeadlineExceeded { attempts: u32, elapsed: Duration },

    /// The retry loop ran out of attempts while budget remained
    #[error("failure to connect after {attempts} attempts")]
    ConnectAttemptsExhausted { attempts: u32 },

    /// The retry loop was interrupted by the caller
    #[error("connection attempt interrupted")]
    Interrupted,

    /// Error creating a channel from an established connection
    #[error("failure to create a channel: {0}")]
    ChannelError(String),

    /// The channel pool was closed
    #[error("channel pool is closed")]
    PoolClosed,

    /// Error declaring an exchange with the given name
    #[error("failure to declare an exchange `{0}`")]
    DeclareExchangeError(String),

    /// Error declaring a queue with the given name
    #[error("failure to declare a queue `{0}`")]
    DeclareQueueError(String),

    /// Error binding an exchange to a queue
    #[error("failure to bind exchange `{0}` to queue `{1}`")]
    BindingExchangeToQueueError(String, String),

    /// Error publishing a message
    #[error("failure to publish: {0}")]
    PublishingError(String),

    /// Error acknowledging a message
    #[error("failure to ack message")]
    AckMessageError,

    /// Error rejecting a message
    #[error("failure to reject message")]
    RejectMessageError,

    /// Error configuring Quality of Service parameters
    #[error("failure to configure qos `{0}`")]
    QoSDeclarationError(String),

    /// Error declaring a consumer
    #[error("failure to declare consumer on `{0}`")]
    ConsumerDeclarationError(String),

    /// Error cancelling a consumer
    #[error("failure to cancel consumer `{0}`")]
    ConsumerCancelError(String),

    /// Error consuming a message
    #[error("failure to consume message `{0}`")]
    ConsumerError(String),

    /// The consumer is not in a state that allows the operation
    #[error("consumer on `{0}` is already {1}")]
    ConsumerState(String, &'static str),

    /// Error parsing configuration
    #[error("invalid configuration: {0}")]
    ConfigError(String),

    #[error(transparent)]
    Topology(#[from] TopologyError),

    #[error(transparent)]
    Envelope(#[from] EnvelopeError),

    #[error(transparent)]
    Codec(#[from] CodecError),
}

impl AmqpError {
    /// True for both ways the connection retry loop can give up.
    pub fn is_timeout(&self) -> bool {
        matches!(
            self,
            AmqpError::ConnectDeadlineExceeded { .. } | AmqpError::ConnectAttemptsExhausted { .. }
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn topology_error_lists_every_violation() {
        let err = TopologyError::new(vec!["first".to_owned(), "second".to_owned()]);
        let msg = err.to_string();

        assert_eq!(msg, "invalid topology (2 violations)\n  - first\n  - second");
        let source: &dyn std::error::Error = &err;
        assert!(source.source().is_none());
    }

    #[test]
    fn both_retry_exhaustion_variants_are_timeouts() {
        assert!(AmqpError::ConnectAttemptsExhausted { attempts: 3 }.is_timeout());
        assert!(AmqpError::ConnectDeadlineExceeded {
            attempts: 1,
            elapsed: Duration::from_secs(1)
        }
        .is_timeout());
        assert!(!AmqpError::Interrupted.is_timeout());
    }
}
