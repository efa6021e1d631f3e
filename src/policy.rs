// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Retry/Dead-Letter Policy
//!
//! Maps a handler outcome and the attempt number to the broker action that ends
//! the delivery. Anything the handler did not explicitly mark as retryable is
//! treated as permanent, and without a dead-letter queue permanent failures halt
//! the consumer instead of being requeued into a tight redelivery loop.

use crate::errors::{CodecError, HandlerError};

/// Classified result of one handler invocation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConsumerOutcome {
    Success,
    RetryableFailure(String),
    NonRetryableFailure(String),
    UnclassifiedFailure(String),
}

impl ConsumerOutcome {
    pub fn is_success(&self) -> bool {
        matches!(self, ConsumerOutcome::Success)
    }

    /// Failure description, empty for `Success`.
    pub fn reason(&self) -> &str {
        match self {
            ConsumerOutcome::Success => "",
            ConsumerOutcome::RetryableFailure(reason)
            | ConsumerOutcome::NonRetryableFailure(reason)
            | ConsumerOutcome::UnclassifiedFailure(reason) => reason,
        }
    }
}

impl From<Result<(), HandlerError>> for ConsumerOutcome {
    fn from(result: Result<(), HandlerError>) -> Self {
        match result {
            Ok(()) => ConsumerOutcome::Success,
            Err(HandlerError::Retryable(reason)) => ConsumerOutcome::RetryableFailure(reason),
            Err(HandlerError::NonRetryable(reason)) => ConsumerOutcome::NonRetryableFailure(reason),
            Err(HandlerError::Unclassified(reason)) => ConsumerOutcome::UnclassifiedFailure(reason),
        }
    }
}

impl From<CodecError> for ConsumerOutcome {
    fn from(err: CodecError) -> Self {
        ConsumerOutcome::UnclassifiedFailure(err.to_string())
    }
}

/// Broker action ending a delivery.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Action {
    /// Acknowledge and forget the message.
    Ack,
    /// Publish a copy to retry tier `k` with `x-retry = k`, then ack the original.
    RepublishTier(u32),
    /// Reject without requeue so the broker forwards it to the dead-letter queue.
    DeadLetter,
    /// Reject without requeue and stop consuming.
    Halt,
}

/// Decides the action for `outcome` on a message already retried `retry_count` times.
pub fn decide(
    outcome: &ConsumerOutcome,
    retry_count: u32,
    max_retries: u32,
    dead_letter_enabled: bool,
) -> Action {
    let give_up = if dead_letter_enabled {
        Action::DeadLetter
    } else {
        Action::Halt
    };

    match outcome {
        ConsumerOutcome::Success => Action::Ack,
        ConsumerOutcome::RetryableFailure(_) if retry_count < max_retries => {
            Action::RepublishTier(retry_count + 1)
        }
        ConsumerOutcome::RetryableFailure(_)
        | ConsumerOutcome::NonRetryableFailure(_)
        | ConsumerOutcome::UnclassifiedFailure(_) => give_up,
    }
}
