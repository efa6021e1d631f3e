// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Messaging Contracts
//!
//! Provider-neutral sending and receiving. A [`Sender`] publishes a typed message
//! with optional metadata, a [`Receiver`] runs a [`ConsumerHandler`] for every
//! message until it is cancelled.

use crate::{
    envelope::MetaData,
    errors::{HandlerError, PublishError, ReceiveError},
};
use async_trait::async_trait;
use std::{future::Future, sync::Arc};
use tokio_util::sync::CancellationToken;

/// Publishes messages of type `T`.
#[async_trait]
pub trait Sender<T>: Send + Sync {
    /// Publishes `message`. Failures are returned, never retried.
    async fn send(&self, message: &T, metadata: Option<MetaData>) -> Result<(), PublishError>;
}

/// Consumes messages of type `T`.
#[async_trait]
pub trait Receiver<T>: Send + Sync {
    /// Runs `handler` for each message until `cancel` fires. An in-flight handler
    /// is always allowed to finish.
    async fn receive(
        &self,
        handler: Arc<dyn ConsumerHandler<T>>,
        cancel: CancellationToken,
    ) -> Result<(), ReceiveError>;
}

/// Processes one decoded message.
///
/// The returned error is the failure classification: [`HandlerError::Retryable`]
/// sends the message through the retry tiers, anything else skips them.
#[async_trait]
pub trait ConsumerHandler<T>: Send + Sync {
    async fn handle(
        &self,
        message: T,
        metadata: MetaData,
        cancel: CancellationToken,
    ) -> Result<(), HandlerError>;
}

/// [`ConsumerHandler`] backed by an async closure. Built with [`handler_fn`].
pub struct FnHandler<F> {
    f: F,
}

/// Wraps an async closure into a [`ConsumerHandler`].
///
/// ```ignore
/// let handler = handler_fn(|order: Order, _meta: MetaData, _cancel: CancellationToken| async move {
///     store(order).await.map_err(|e| HandlerError::retryable(e.to_string()))
/// });
/// ```
pub fn handler_fn<F>(f: F) -> FnHandler<F> {
    FnHandler { f }
}

#[async_trait]
impl<T, F, Fut> ConsumerHandler<T> for FnHandler<F>
where
    T: Send + 'static,
    F: Fn(T, MetaData, CancellationToken) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<(), HandlerError>> + Send + 'static,
{
    async fn handle(
        &self,
        message: T,
        metadata: MetaData,
        cancel: CancellationToken,
    ) -> Result<(), HandlerError> {
        (self.f)(message, metadata, cancel).await
    }
}
