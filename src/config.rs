// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Configuration
//!
//! Connection settings for the broker and the options of a sender or receiver.
//! Everything is plain `serde` data so it can be built in code or loaded from
//! `RABBITMQ_*` environment variables through the `config` crate.

use crate::{
    envelope::EncryptionKey,
    errors::{AmqpError, CodecError, ProvisionError},
    exchange::ExchangeKind,
    queue::{QueueDurability, QueueType},
    topology::{RetrySchedule, TopologyDescriptor},
};
use config::{Config, Environment};
use serde::Deserialize;
use std::time::Duration;
use tracing::error;

/// Environment variable prefix used by the `from_env` loaders.
pub const ENV_PREFIX: &str = "RABBITMQ";

/// Default delay of the first retry tier, tier k waits k times this value.
pub const DEFAULT_RETRY_BASE_DELAY_MS: u64 = 5000;

/// Broker connection settings.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct RabbitMQConfigs {
    pub host: String,
    pub port: u16,
    pub user: String,
    pub password: String,
    pub vhost: String,
    pub connection_name: String,
}

impl Default for RabbitMQConfigs {
    fn default() -> Self {
        RabbitMQConfigs {
            host: "localhost".to_owned(),
            port: 5672,
            user: "guest".to_owned(),
            password: "guest".to_owned(),
            vhost: String::new(),
            connection_name: "amqp-retry".to_owned(),
        }
    }
}

impl RabbitMQConfigs {
    /// Loads the connection settings from `RABBITMQ_HOST`, `RABBITMQ_PORT`,
    /// `RABBITMQ_USER`, `RABBITMQ_PASSWORD`, `RABBITMQ_VHOST` and
    /// `RABBITMQ_CONNECTION_NAME`. Missing variables keep their defaults.
    pub fn from_env() -> Result<Self, AmqpError> {
        load_from_env(Environment::with_prefix(ENV_PREFIX))
    }

    /// Renders the `amqp://` URI for this configuration.
    ///
    /// The root vhost `/` is percent-encoded, an empty vhost selects the broker default.
    pub fn uri(&self) -> String {
        let vhost = if self.vhost == "/" {
            "%2f"
        } else {
            self.vhost.as_str()
        };

        format!(
            "amqp://{}:{}@{}:{}/{}",
            self.user, self.password, self.host, self.port, vhost
        )
    }
}

/// Options of a [`RabbitMQReceiver`](crate::dispatcher::RabbitMQReceiver).
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct ReceiverOptions {
    pub queue_name: String,
    pub exchange_name: String,
    pub routing_key: String,
    /// Declare the primary, retry and dead-letter queues before consuming.
    pub automatic_create_enabled: bool,
    /// Declare `exchange_name` with this kind before binding.
    pub exchange_kind: Option<ExchangeKind>,
    pub queue_type: QueueType,
    /// `durable` (default) or `transient`, applied to every declared queue.
    pub queue_durability: QueueDurability,
    pub single_active_consumer: bool,
    pub dead_letter_enabled: bool,
    pub max_retry_count: u32,
    pub retry_base_delay_ms: u64,
    /// Explicit per-tier delays. When non-empty it replaces the linear schedule.
    pub retry_intervals_ms: Vec<u64>,
    /// Base64 AES key, decryption is enabled when set.
    pub message_encryption_key: Option<String>,
    pub consumer_tag: String,
}

impl Default for ReceiverOptions {
    fn default() -> Self {
        ReceiverOptions {
            queue_name: String::new(),
            exchange_name: String::new(),
            routing_key: String::new(),
            automatic_create_enabled: true,
            exchange_kind: None,
            queue_type: QueueType::Classic,
            queue_durability: QueueDurability::Durable,
            single_active_consumer: false,
            dead_letter_enabled: true,
            max_retry_count: 0,
            retry_base_delay_ms: DEFAULT_RETRY_BASE_DELAY_MS,
            retry_intervals_ms: vec![],
            message_encryption_key: None,
            consumer_tag: String::new(),
        }
    }
}

impl ReceiverOptions {
    pub fn new(queue_name: &str) -> Self {
        ReceiverOptions {
            queue_name: queue_name.to_owned(),
            ..Default::default()
        }
    }

    /// Loads receiver options from `RABBITMQ_QUEUE_NAME`, `RABBITMQ_MAX_RETRY_COUNT`,
    /// `RABBITMQ_RETRY_INTERVALS_MS` (comma separated) and friends.
    pub fn from_env() -> Result<Self, AmqpError> {
        load_from_env(
            Environment::with_prefix(ENV_PREFIX)
                .try_parsing(true)
                .list_separator(",")
                .with_list_parse_key("retry_intervals_ms"),
        )
    }

    /// Builds the immutable topology this receiver consumes from.
    pub fn topology_descriptor(&self) -> Result<TopologyDescriptor, ProvisionError> {
        let schedule = if self.retry_intervals_ms.is_empty() {
            RetrySchedule::Linear(Duration::from_millis(self.retry_base_delay_ms))
        } else {
            RetrySchedule::Intervals(
                self.retry_intervals_ms
                    .iter()
                    .map(|ms| Duration::from_millis(*ms))
                    .collect(),
            )
        };

        let mut descriptor = TopologyDescriptor::new(&self.queue_name)
            .exchange(&self.exchange_name, &self.routing_key)
            .queue_type(self.queue_type.clone())
            .durability(self.queue_durability)
            .retries(self.max_retry_count, schedule);

        if let Some(kind) = &self.exchange_kind {
            descriptor = descriptor.declare_exchange(kind.clone());
        }
        if self.dead_letter_enabled {
            descriptor = descriptor.with_dead_letter();
        }
        if self.single_active_consumer {
            descriptor = descriptor.single_active_consumer();
        }

        descriptor.validate()?;
        Ok(descriptor)
    }

    pub fn encryption_key(&self) -> Result<Option<EncryptionKey>, CodecError> {
        parse_key(&self.message_encryption_key)
    }
}

/// Options of a [`RabbitMQSender`](crate::publisher::RabbitMQSender).
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct SenderOptions {
    pub exchange_name: String,
    pub routing_key: String,
    /// Base64 AES key, encryption is enabled when set.
    pub message_encryption_key: Option<String>,
}

impl SenderOptions {
    pub fn new(exchange_name: &str, routing_key: &str) -> Self {
        SenderOptions {
            exchange_name: exchange_name.to_owned(),
            routing_key: routing_key.to_owned(),
            message_encryption_key: None,
        }
    }

    pub fn from_env() -> Result<Self, AmqpError> {
        load_from_env(Environment::with_prefix(ENV_PREFIX))
    }

    pub fn encryption_key(&self) -> Result<Option<EncryptionKey>, CodecError> {
        parse_key(&self.message_encryption_key)
    }
}

fn parse_key(key: &Option<String>) -> Result<Option<EncryptionKey>, CodecError> {
    match key.as_deref() {
        None | Some("") => Ok(None),
        Some(encoded) => EncryptionKey::from_base64(encoded).map(Some),
    }
}

fn load_from_env<T>(source: Environment) -> Result<T, AmqpError>
where
    T: serde::de::DeserializeOwned,
{
    Config::builder()
        .add_source(source)
        .build()
        .and_then(|cfg| cfg.try_deserialize::<T>())
        .map_err(|err| {
            error!(error = err.to_string(), "failure to load configuration");
            AmqpError::ConfigError(err.to_string())
        })
}
