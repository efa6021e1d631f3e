// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Error Types
//!
//! Each concern of the consumption pipeline owns its error type: broker operations
//! (`AmqpError`), the envelope codec (`CodecError`), topology provisioning
//! (`ProvisionError`), publishing (`PublishError`) and the failures a message
//! handler reports back to the dispatcher (`HandlerError`).

use thiserror::Error;

/// Represents errors that can occur during AMQP/RabbitMQ operations.
///
/// Each variant names the broker operation that failed. Variants carrying a
/// `String` hold the name of the queue, exchange or consumer involved.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum AmqpError {
    /// Configuration could not be loaded or is invalid
    #[error("invalid configuration: {0}")]
    ConfigError(String),

    /// Error establishing a connection to the RabbitMQ server
    #[error("failure to connect")]
    ConnectionError,

    /// Error creating a channel from an established connection
    #[error("failure to create a channel")]
    ChannelError,

    /// Error declaring an exchange with the given name
    #[error("failure to declare an exchange `{0}`")]
    DeclareExchangeError(String),

    /// Error declaring a queue with the given name
    #[error("failure to declare a queue `{0}`")]
    DeclareQueueError(String),

    /// The broker refused a redeclaration because the arguments differ (AMQP 406)
    #[error("precondition failed redeclaring `{0}`")]
    PreconditionFailed(String),

    /// Error binding a queue to an exchange
    #[error("failure to bind queue `{1}` to exchange `{0}`")]
    BindingExchangeToQueueError(String, String),

    /// Error binding a consumer to a queue
    #[error("failure to declare consumer `{0}`")]
    BindingConsumerError(String),

    /// Error publishing a message
    #[error("failure to publish")]
    PublishingError,

    /// The broker negatively acknowledged a publish on a confirm channel
    #[error("publish was nacked by the broker")]
    PublishNackedError,

    /// The broker returned a mandatory publish because no queue matched its
    /// routing key
    #[error("message to `{0}` was returned as unroutable")]
    PublishReturnedError(String),

    /// Error acknowledging a message
    #[error("failure to ack message")]
    AckMessageError,

    /// Error negative-acknowledging a message
    #[error("failure to nack message")]
    NackMessageError,

    /// Error republishing a message to a retry tier
    #[error("failure to republish message to `{0}`")]
    RepublishError(String),

    /// Error configuring Quality of Service parameters
    #[error("failure to configure qos `{0}`")]
    QoSDeclarationError(String),

    /// Error consuming a message
    #[error("failure to consume message `{0}`")]
    ConsumerError(String),
}

/// Errors produced while encoding or decoding a message envelope.
///
/// A codec error on the consuming side is a corruption signal for that delivery,
/// never a retryable business failure.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CodecError {
    #[error("malformed message: {0}")]
    Malformed(String),

    #[error("failure to decrypt message")]
    Decryption,

    #[error("invalid encryption key: {0}")]
    InvalidKey(String),

    #[error("failure to serialize envelope: {0}")]
    Serialization(String),
}

/// Errors raised while declaring the retry/dead-letter topology.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ProvisionError {
    /// An existing queue was declared with different arguments
    #[error("queue `{queue}` already exists with conflicting arguments")]
    Conflict { queue: String },

    #[error("invalid topology descriptor: {0}")]
    InvalidDescriptor(String),

    #[error(transparent)]
    Broker(#[from] AmqpError),
}

/// Errors surfaced by a publish call. They are never retried internally.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PublishError {
    #[error(transparent)]
    Codec(#[from] CodecError),

    #[error(transparent)]
    Broker(#[from] AmqpError),

    /// The broker negatively acknowledged the publish
    #[error("message was nacked by the broker")]
    Nacked,

    /// No queue is bound for the routing key, the broker returned the message
    #[error("message to `{0}` could not be routed")]
    Unroutable(String),
}

/// Errors ending a receiver's consume loop.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ReceiveError {
    #[error(transparent)]
    Provision(#[from] ProvisionError),

    #[error(transparent)]
    Codec(#[from] CodecError),

    #[error(transparent)]
    Broker(#[from] AmqpError),

    /// The consumer stopped after a failure it could neither retry nor dead-letter
    #[error("consumer on `{0}` halted, operator intervention required")]
    Halted(String),
}

/// Failure reported by a message handler.
///
/// The variant is the classification the retry policy acts on.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum HandlerError {
    /// Transient failure, redelivery is expected to help
    #[error("retryable failure: {0}")]
    Retryable(String),

    /// Permanent failure, the message skips the retry tiers
    #[error("non-retryable failure: {0}")]
    NonRetryable(String),

    /// Any failure the handler did not classify
    #[error("unclassified failure: {0}")]
    Unclassified(String),
}

impl HandlerError {
    /// Creates a transient failure. The message moves to the next retry tier
    /// until the tiers are exhausted.
    ///
    /// # Parameters
    /// * `msg` - Description logged with the failure
    pub fn retryable(msg: impl Into<String>) -> Self {
        HandlerError::Retryable(msg.into())
    }

    /// Creates a permanent failure. The message is dead-lettered right away, or
    /// halts the consumer when no dead-letter queue exists.
    pub fn non_retryable(msg: impl Into<String>) -> Self {
        HandlerError::NonRetryable(msg.into())
    }

    /// Creates a failure the handler could not classify. Treated like
    /// [`HandlerError::non_retryable`].
    pub fn unclassified(msg: impl Into<String>) -> Self {
        HandlerError::Unclassified(msg.into())
    }
}
