// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # RabbitMQ Receiver
//!
//! [`RabbitMQReceiver`] implements the [`Receiver`] contract over one connection and
//! one channel, both opened when `receive` starts and closed when it returns:
//!
//! - the retry topology is provisioned first when automatic creation is enabled,
//! - the channel prefetch is fixed at one, so at most one delivery is unacknowledged,
//! - deliveries are processed strictly one after another in broker order,
//! - cancellation stops accepting deliveries but lets the in-flight handler finish,
//! - a halted delivery stops the consumer until an operator restarts it.

use crate::{
    channel::{close_channel, close_connection, create_channel, new_amqp_connection, AmqpChannel, BrokerChannel},
    config::{RabbitMQConfigs, ReceiverOptions},
    consumer::DeliveryProcessor,
    delivery::InboundDelivery,
    envelope::EncryptionKey,
    errors::{AmqpError, ReceiveError},
    messaging::{ConsumerHandler, Receiver},
    policy::Action,
    topology::{provision, TopologyDescriptor},
};
use async_trait::async_trait;
use futures_util::{Stream, StreamExt};
use lapin::{
    options::{BasicCancelOptions, BasicConsumeOptions, BasicQosOptions},
    types::FieldTable,
    Channel,
};
use serde::de::DeserializeOwned;
use std::{marker::PhantomData, sync::Arc};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};
use uuid::Uuid;

/// Flow-control window: unacknowledged deliveries allowed per channel.
pub const PREFETCH_COUNT: u16 = 1;

/// Where the consumer loop of a channel currently is.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DispatcherState {
    Idle,
    Delivering,
    Acking,
    Republishing,
    DeadLettering,
    Halted,
}

impl From<Action> for DispatcherState {
    fn from(action: Action) -> Self {
        match action {
            Action::Ack => DispatcherState::Acking,
            Action::RepublishTier(_) => DispatcherState::Republishing,
            Action::DeadLetter => DispatcherState::DeadLettering,
            Action::Halt => DispatcherState::Halted,
        }
    }
}

/// Consumes a RabbitMQ queue with retry tiers and dead-lettering.
pub struct RabbitMQReceiver<T> {
    cfg: RabbitMQConfigs,
    options: ReceiverOptions,
    descriptor: TopologyDescriptor,
    key: Option<EncryptionKey>,
    _message: PhantomData<fn() -> T>,
}

impl<T> RabbitMQReceiver<T> {
    /// Validates `options` and builds the receiver. No connection is opened yet.
    pub fn new(cfg: RabbitMQConfigs, options: ReceiverOptions) -> Result<Self, ReceiveError> {
        let descriptor = options.topology_descriptor()?;
        let key = options.encryption_key()?;

        Ok(RabbitMQReceiver {
            cfg,
            options,
            descriptor,
            key,
            _message: PhantomData,
        })
    }

    pub fn descriptor(&self) -> &TopologyDescriptor {
        &self.descriptor
    }

    fn consumer_tag(&self) -> String {
        if self.options.consumer_tag.is_empty() {
            format!("{}-{}", self.descriptor.primary_queue(), Uuid::new_v4())
        } else {
            self.options.consumer_tag.clone()
        }
    }
}

#[async_trait]
impl<T> Receiver<T> for RabbitMQReceiver<T>
where
    T: DeserializeOwned + Send + 'static,
{
    async fn receive(
        &self,
        handler: Arc<dyn ConsumerHandler<T>>,
        cancel: CancellationToken,
    ) -> Result<(), ReceiveError> {
        let conn = new_amqp_connection(&self.cfg).await?;

        let result = match create_channel(&conn).await {
            Ok(channel) => {
                let result = self.consume_channel(&channel, handler, &cancel).await;
                close_channel(&channel).await;
                result
            }
            Err(err) => Err(err.into()),
        };

        close_connection(&conn).await;
        debug!(queue = self.descriptor.primary_queue(), "receiver stopped");

        result
    }
}

impl<T> RabbitMQReceiver<T>
where
    T: DeserializeOwned + Send + 'static,
{
    async fn consume_channel(
        &self,
        channel: &Arc<Channel>,
        handler: Arc<dyn ConsumerHandler<T>>,
        cancel: &CancellationToken,
    ) -> Result<(), ReceiveError> {
        let broker = AmqpChannel::with_confirms(channel.clone()).await?;
        let queue = self.descriptor.primary_queue();

        if self.options.automatic_create_enabled {
            provision(&broker, &self.descriptor).await?;
        }

        if let Err(err) = channel
            .basic_qos(PREFETCH_COUNT, BasicQosOptions { global: false })
            .await
        {
            error!(error = err.to_string(), "failure to configure qos");
            return Err(AmqpError::QoSDeclarationError(queue.to_owned()).into());
        }

        let consumer = match channel
            .basic_consume(
                queue,
                &self.consumer_tag(),
                BasicConsumeOptions {
                    no_local: false,
                    no_ack: false,
                    exclusive: false,
                    nowait: false,
                },
                FieldTable::default(),
            )
            .await
        {
            Err(err) => {
                error!(error = err.to_string(), "error to create the consumer");
                Err(AmqpError::BindingConsumerError(queue.to_owned()))
            }
            Ok(c) => Ok(c),
        }?;

        let consumer_tag = consumer.tag();
        let deliveries = consumer.map(|result| {
            result
                .map(InboundDelivery::from)
                .map_err(|err| AmqpError::ConsumerError(err.to_string()))
        });

        let processor = DeliveryProcessor::new(&self.descriptor, self.key.clone(), handler);
        let result = dispatch(deliveries, &broker, &processor, cancel, queue).await;

        if channel.status().connected() {
            if let Err(err) = channel
                .basic_cancel(consumer_tag.as_str(), BasicCancelOptions { nowait: false })
                .await
            {
                error!(error = err.to_string(), "failure to cancel consumer");
            }
        }

        result
    }
}

/// Drives `deliveries` through `processor` one at a time until cancellation,
/// a halt, a settlement failure or the end of the stream.
///
/// Cancellation is only observed between deliveries.
pub async fn dispatch<T, S>(
    mut deliveries: S,
    channel: &dyn BrokerChannel,
    processor: &DeliveryProcessor<T>,
    cancel: &CancellationToken,
    queue: &str,
) -> Result<(), ReceiveError>
where
    T: DeserializeOwned + Send + 'static,
    S: Stream<Item = Result<InboundDelivery, AmqpError>> + Unpin + Send,
{
    let mut state = DispatcherState::Idle;

    loop {
        let next = tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                debug!(queue, "cancellation requested, consumer stopping");
                return Ok(());
            }
            next = deliveries.next() => next,
        };

        let delivery = match next {
            Some(Ok(delivery)) => delivery,
            Some(Err(err)) => {
                error!(error = err.to_string(), "errors consume msg");
                continue;
            }
            None if cancel.is_cancelled() => return Ok(()),
            None => {
                warn!(queue, "delivery stream closed");
                return Err(AmqpError::ConsumerError(queue.to_owned()).into());
            }
        };

        state = transition(state, DispatcherState::Delivering);
        let action = processor.process(channel, &delivery, cancel).await?;
        state = transition(state, action.into());

        if state == DispatcherState::Halted {
            return Err(ReceiveError::Halted(queue.to_owned()));
        }
        state = transition(state, DispatcherState::Idle);
    }
}

fn transition(from: DispatcherState, to: DispatcherState) -> DispatcherState {
    debug!(from = ?from, to = ?to, "dispatcher state");
    to
}
