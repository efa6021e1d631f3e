// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # AMQP Channel Management
//!
//! This module handles the creation of AMQP connections and channels, and defines
//! [`BrokerChannel`]: the set of broker operations the provisioner, the consumer and
//! the publisher need. [`AmqpChannel`] implements it over a lapin channel.

use crate::{
    config::RabbitMQConfigs,
    errors::AmqpError,
    exchange::ExchangeDefinition,
    queue::{QueueBinding, QueueDefinition},
};
use async_trait::async_trait;
use lapin::{
    options::{
        BasicAckOptions, BasicNackOptions, BasicPublishOptions, ConfirmSelectOptions,
        ExchangeDeclareOptions, QueueBindOptions, QueueDeclareOptions,
    },
    protocol::{basic::AMQPProperties, AMQPErrorKind, AMQPSoftError},
    publisher_confirm::Confirmation,
    types::{FieldTable, LongString},
    Channel, Connection, ConnectionProperties,
};
use std::sync::Arc;
use tracing::{debug, error};

/// Reply code sent when closing channels and connections normally.
pub const AMQP_REPLY_SUCCESS: u16 = 200;

/// Broker operations used by the retry pipeline.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait BrokerChannel: Send + Sync {
    async fn declare_exchange(&self, def: &ExchangeDefinition) -> Result<(), AmqpError>;

    /// Declares a queue. Redeclaring with identical arguments is a no-op, differing
    /// arguments fail with [`AmqpError::PreconditionFailed`].
    async fn declare_queue(&self, def: &QueueDefinition) -> Result<(), AmqpError>;

    async fn bind_queue(&self, binding: &QueueBinding) -> Result<(), AmqpError>;

    /// Publishes a mandatory, confirmed message.
    ///
    /// # Returns
    /// `Ok(())` once the broker routed and confirmed it. A message no queue
    /// accepted fails with [`AmqpError::PublishReturnedError`], a nack with
    /// [`AmqpError::PublishNackedError`].
    async fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        payload: &[u8],
        properties: AMQPProperties,
    ) -> Result<(), AmqpError>;

    async fn ack(&self, delivery_tag: u64) -> Result<(), AmqpError>;

    async fn nack(&self, delivery_tag: u64, requeue: bool) -> Result<(), AmqpError>;
}

/// Creates a new AMQP connection to the broker described by `cfg`.
pub async fn new_amqp_connection(cfg: &RabbitMQConfigs) -> Result<Arc<Connection>, AmqpError> {
    debug!("creating amqp connection...");
    let options = ConnectionProperties::default()
        .with_connection_name(LongString::from(cfg.connection_name.clone()));

    match Connection::connect(&cfg.uri(), options).await {
        Ok(conn) => {
            debug!("amqp connected");
            Ok(Arc::new(conn))
        }
        Err(err) => {
            error!(error = err.to_string(), "failure to connect");
            Err(AmqpError::ConnectionError)
        }
    }
}

/// Creates a channel on an established connection.
pub async fn create_channel(conn: &Connection) -> Result<Arc<Channel>, AmqpError> {
    debug!("creating amqp channel...");
    match conn.create_channel().await {
        Ok(c) => {
            debug!("channel created");
            Ok(Arc::new(c))
        }
        Err(err) => {
            error!(error = err.to_string(), "error to create the channel");
            Err(AmqpError::ChannelError)
        }
    }
}

/// Creates a new connection and a channel on it.
///
/// # Example
/// ```ignore
/// let (conn, channel) = new_amqp_channel(&RabbitMQConfigs::from_env()?).await?;
/// ```
pub async fn new_amqp_channel(
    cfg: &RabbitMQConfigs,
) -> Result<(Arc<Connection>, Arc<Channel>), AmqpError> {
    let conn = new_amqp_connection(cfg).await?;
    let channel = create_channel(&conn).await?;
    Ok((conn, channel))
}

/// Closes a channel, logging instead of failing when it is already gone.
pub async fn close_channel(channel: &Channel) {
    if !channel.status().connected() {
        return;
    }
    if let Err(err) = channel.close(AMQP_REPLY_SUCCESS, "OK").await {
        error!(error = err.to_string(), "failure to close channel");
    }
}

/// Closes a connection, logging instead of failing when it is already gone.
pub async fn close_connection(conn: &Connection) {
    if !conn.status().connected() {
        return;
    }
    if let Err(err) = conn.close(AMQP_REPLY_SUCCESS, "OK").await {
        error!(error = err.to_string(), "failure to close connection");
    }
}

/// [`BrokerChannel`] over a lapin channel.
#[derive(Clone)]
pub struct AmqpChannel {
    channel: Arc<Channel>,
}

impl AmqpChannel {
    pub fn new(channel: Arc<Channel>) -> Self {
        AmqpChannel { channel }
    }

    /// Wraps `channel` after switching it to publisher-confirm mode, so that
    /// [`BrokerChannel::publish`] waits for the broker's ack or nack.
    pub async fn with_confirms(channel: Arc<Channel>) -> Result<Self, AmqpError> {
        if let Err(err) = channel
            .confirm_select(ConfirmSelectOptions { nowait: false })
            .await
        {
            error!(error = err.to_string(), "failure to enable publisher confirms");
            return Err(AmqpError::ChannelError);
        }

        Ok(AmqpChannel { channel })
    }

    pub fn inner(&self) -> &Arc<Channel> {
        &self.channel
    }
}

fn is_precondition_failed(err: &lapin::Error) -> bool {
    match err {
        lapin::Error::ProtocolError(amqp) => {
            matches!(amqp.kind(), AMQPErrorKind::Soft(AMQPSoftError::PRECONDITIONFAILED))
        }
        _ => false,
    }
}

#[async_trait]
impl BrokerChannel for AmqpChannel {
    async fn declare_exchange(&self, def: &ExchangeDefinition) -> Result<(), AmqpError> {
        debug!("creating exchange: {}", def.name);

        match self
            .channel
            .exchange_declare(
                &def.name,
                def.kind.clone().into(),
                ExchangeDeclareOptions {
                    passive: false,
                    durable: def.durable,
                    auto_delete: false,
                    internal: false,
                    nowait: false,
                },
                FieldTable::default(),
            )
            .await
        {
            Err(err) if is_precondition_failed(&err) => {
                error!(
                    error = err.to_string(),
                    name = def.name.as_str(),
                    "exchange redeclared with other arguments"
                );
                Err(AmqpError::PreconditionFailed(def.name.clone()))
            }
            Err(err) => {
                error!(
                    error = err.to_string(),
                    name = def.name.as_str(),
                    "error to declare the exchange"
                );
                Err(AmqpError::DeclareExchangeError(def.name.clone()))
            }
            _ => {
                debug!("exchange: {} was created", def.name);
                Ok(())
            }
        }
    }

    async fn declare_queue(&self, def: &QueueDefinition) -> Result<(), AmqpError> {
        debug!("creating queue: {}", def.name);

        match self
            .channel
            .queue_declare(
                &def.name,
                QueueDeclareOptions {
                    passive: false,
                    durable: def.durable,
                    exclusive: false,
                    auto_delete: false,
                    nowait: false,
                },
                def.arguments(),
            )
            .await
        {
            Err(err) if is_precondition_failed(&err) => {
                error!(
                    error = err.to_string(),
                    name = def.name.as_str(),
                    "queue redeclared with other arguments"
                );
                Err(AmqpError::PreconditionFailed(def.name.clone()))
            }
            Err(err) => {
                error!(
                    error = err.to_string(),
                    name = def.name.as_str(),
                    "failure to declare queue"
                );
                Err(AmqpError::DeclareQueueError(def.name.clone()))
            }
            _ => {
                debug!("queue: {} was created", def.name);
                Ok(())
            }
        }
    }

    async fn bind_queue(&self, binding: &QueueBinding) -> Result<(), AmqpError> {
        debug!(
            "binding queue: {} to the exchange: {} with the key: {}",
            binding.queue_name, binding.exchange_name, binding.routing_key
        );

        match self
            .channel
            .queue_bind(
                &binding.queue_name,
                &binding.exchange_name,
                &binding.routing_key,
                QueueBindOptions { nowait: false },
                FieldTable::default(),
            )
            .await
        {
            Err(err) => {
                error!(error = err.to_string(), "error to bind queue to exchange");
                Err(AmqpError::BindingExchangeToQueueError(
                    binding.exchange_name.clone(),
                    binding.queue_name.clone(),
                ))
            }
            _ => Ok(()),
        }
    }

    async fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        payload: &[u8],
        properties: AMQPProperties,
    ) -> Result<(), AmqpError> {
        let confirm = match self
            .channel
            .basic_publish(
                exchange,
                routing_key,
                BasicPublishOptions {
                    immediate: false,
                    mandatory: true,
                },
                payload,
                properties,
            )
            .await
        {
            Ok(confirm) => confirm,
            Err(err) => {
                error!(error = err.to_string(), "error publishing message");
                return Err(AmqpError::PublishingError);
            }
        };

        match confirm.await {
            Ok(Confirmation::Nack(_)) => {
                error!(exchange, routing_key, "publish nacked by the broker");
                Err(AmqpError::PublishNackedError)
            }
            Ok(Confirmation::Ack(Some(returned))) => {
                error!(
                    exchange,
                    routing_key,
                    reply_code = returned.reply_code,
                    reply_text = returned.reply_text.as_str(),
                    "publish returned as unroutable"
                );
                Err(AmqpError::PublishReturnedError(routing_key.to_owned()))
            }
            Ok(_) => Ok(()),
            Err(err) => {
                error!(error = err.to_string(), "error waiting publish confirmation");
                Err(AmqpError::PublishingError)
            }
        }
    }

    async fn ack(&self, delivery_tag: u64) -> Result<(), AmqpError> {
        self.channel
            .basic_ack(delivery_tag, BasicAckOptions { multiple: false })
            .await
            .map_err(|err| {
                error!(error = err.to_string(), delivery_tag, "error whiling ack msg");
                AmqpError::AckMessageError
            })
    }

    async fn nack(&self, delivery_tag: u64, requeue: bool) -> Result<(), AmqpError> {
        self.channel
            .basic_nack(
                delivery_tag,
                BasicNackOptions {
                    multiple: false,
                    requeue,
                },
            )
            .await
            .map_err(|err| {
                error!(error = err.to_string(), delivery_tag, "error whiling nack msg");
                AmqpError::NackMessageError
            })
    }
}
