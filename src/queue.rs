// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Queue Definitions
//!
//! A `QueueDefinition` is one queue declaration: its name, durability and the
//! `x-*` arguments RabbitMQ uses for TTL, dead-letter forwarding and queue type.
//! The topology provisioner builds one per primary, retry-tier and dead-letter queue.

use crate::errors::ProvisionError;
use lapin::types::{AMQPValue, FieldTable, LongInt, LongString, ShortString};
use serde::Deserialize;
use std::{collections::BTreeMap, time::Duration};

/// Header field used to specify a dead letter exchange
pub const AMQP_HEADERS_DEAD_LETTER_EXCHANGE: &str = "x-dead-letter-exchange";
/// Header field used to specify a dead letter routing key
pub const AMQP_HEADERS_DEAD_LETTER_ROUTING_KEY: &str = "x-dead-letter-routing-key";
/// Header field used to specify message TTL
pub const AMQP_HEADERS_MESSAGE_TTL: &str = "x-message-ttl";
/// Header field used to select the queue type
pub const AMQP_HEADERS_QUEUE_TYPE: &str = "x-queue-type";
/// Header field enabling single active consumer
pub const AMQP_HEADERS_SINGLE_ACTIVE_CONSUMER: &str = "x-single-active-consumer";

/// Largest TTL the broker accepts in `x-message-ttl`, a signed 32-bit millisecond count.
pub const MAX_MESSAGE_TTL: Duration = Duration::from_millis(i32::MAX as u64);

/// Whether declared queues survive a broker restart.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum QueueDurability {
    #[default]
    #[serde(alias = "Durable")]
    Durable,
    #[serde(alias = "Transient")]
    Transient,
}

/// Storage type of the primary queue.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum QueueType {
    #[default]
    #[serde(alias = "Classic")]
    Classic,
    #[serde(alias = "Quorum")]
    Quorum,
    #[serde(alias = "Stream")]
    Stream,
}

impl QueueType {
    /// Value of the `x-queue-type` argument, `None` for the broker default.
    pub fn argument(&self) -> Option<&'static str> {
        match self {
            QueueType::Classic => None,
            QueueType::Quorum => Some("quorum"),
            QueueType::Stream => Some("stream"),
        }
    }
}

/// Definition of a RabbitMQ queue with its configuration parameters.
///
/// Built with chained calls, the arguments end up in the `queue.declare` frame.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct QueueDefinition {
    pub(crate) name: String,
    pub(crate) durable: bool,
    pub(crate) args: BTreeMap<ShortString, AMQPValue>,
}

impl QueueDefinition {
    /// Creates a durable queue definition with no arguments.
    pub fn new(name: &str) -> QueueDefinition {
        QueueDefinition {
            name: name.to_owned(),
            durable: true,
            args: BTreeMap::new(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn is_durable(&self) -> bool {
        self.durable
    }

    /// Sets the durability of the queue. Quorum and stream queues stay durable
    /// whatever the mode.
    pub fn durability(mut self, mode: QueueDurability) -> Self {
        if self.args.contains_key(AMQP_HEADERS_QUEUE_TYPE) {
            return self;
        }
        self.durable = mode == QueueDurability::Durable;
        self
    }

    /// Sets the message Time-To-Live (TTL) for the queue.
    ///
    /// # Parameters
    /// * `ttl` - How long a message stays in the queue, at most [`MAX_MESSAGE_TTL`]
    ///
    /// # Returns
    /// The updated definition, or `InvalidDescriptor` when `ttl` does not fit in
    /// the `x-message-ttl` argument
    pub fn ttl(mut self, ttl: Duration) -> Result<Self, ProvisionError> {
        let millis = i32::try_from(ttl.as_millis()).map_err(|_| {
            ProvisionError::InvalidDescriptor(format!(
                "ttl of queue `{}` exceeds {}ms",
                self.name,
                MAX_MESSAGE_TTL.as_millis()
            ))
        })?;

        self.args.insert(
            ShortString::from(AMQP_HEADERS_MESSAGE_TTL),
            AMQPValue::LongInt(LongInt::from(millis)),
        );
        Ok(self)
    }

    /// Forwards expired and rejected messages through the default exchange to
    /// the queue named `routing_key`.
    pub fn dead_letter_to(mut self, routing_key: &str) -> Self {
        self.args.insert(
            ShortString::from(AMQP_HEADERS_DEAD_LETTER_EXCHANGE),
            AMQPValue::LongString(LongString::from("")),
        );
        self.args.insert(
            ShortString::from(AMQP_HEADERS_DEAD_LETTER_ROUTING_KEY),
            AMQPValue::LongString(LongString::from(routing_key)),
        );
        self
    }

    pub fn queue_type(mut self, kind: &QueueType) -> Self {
        if let Some(value) = kind.argument() {
            self.args.insert(
                ShortString::from(AMQP_HEADERS_QUEUE_TYPE),
                AMQPValue::LongString(LongString::from(value)),
            );
            // quorum and stream queues are always durable
            self.durable = true;
        }
        self
    }

    pub fn single_active_consumer(mut self) -> Self {
        self.args.insert(
            ShortString::from(AMQP_HEADERS_SINGLE_ACTIVE_CONSUMER),
            AMQPValue::Boolean(true),
        );
        self
    }

    pub fn arguments(&self) -> FieldTable {
        FieldTable::from(self.args.clone())
    }

    pub fn argument(&self, key: &str) -> Option<&AMQPValue> {
        self.args.get(key)
    }

    /// TTL in milliseconds, if one was set.
    pub fn ttl_millis(&self) -> Option<i64> {
        match self.args.get(AMQP_HEADERS_MESSAGE_TTL) {
            Some(AMQPValue::LongInt(v)) => Some(i64::from(*v)),
            _ => None,
        }
    }
}

/// Binding of a queue to an exchange.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueBinding {
    pub(crate) queue_name: String,
    pub(crate) exchange_name: String,
    pub(crate) routing_key: String,
}

impl QueueBinding {
    /// Creates a new queue binding for the given queue.
    ///
    /// The exchange name and routing key are empty until set.
    pub fn new(queue: &str) -> QueueBinding {
        QueueBinding {
            queue_name: queue.to_owned(),
            exchange_name: String::new(),
            routing_key: String::new(),
        }
    }

    pub fn exchange(mut self, exchange: &str) -> Self {
        self.exchange_name = exchange.to_owned();
        self
    }

    pub fn routing_key(mut self, key: &str) -> Self {
        self.routing_key = key.to_owned();
        self
    }
}
