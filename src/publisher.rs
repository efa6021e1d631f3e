// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # RabbitMQ Message Publisher
//!
//! [`RabbitMQSender`] publishes typed messages to a configured exchange and routing
//! key. Every message is wrapped in the JSON envelope, optionally encrypted, marked
//! persistent and published with confirms. The current OpenTelemetry context is
//! propagated in the message headers.

use crate::{
    channel::{close_channel, create_channel, new_amqp_connection, AmqpChannel, BrokerChannel},
    config::{RabbitMQConfigs, SenderOptions},
    consumer::PERSISTENT_DELIVERY_MODE,
    delivery::{AMQP_HEADERS_ENCRYPTED, AMQP_HEADERS_ENCRYPTED_IV},
    envelope::{encode, EncodedMessage, EncryptionKey, MetaData},
    errors::{AmqpError, PublishError},
    messaging::Sender,
    otel,
};
use async_trait::async_trait;
use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use chrono::Utc;
use lapin::{
    protocol::basic::AMQPProperties,
    types::{AMQPValue, FieldTable, LongString, ShortString},
    Connection,
};
use serde::Serialize;
use std::{collections::BTreeMap, marker::PhantomData, sync::Arc};
use tracing::{debug, error};
use uuid::Uuid;

/// Default content type for JSON messages
pub const JSON_CONTENT_TYPE: &str = "application/json";

/// Publishes messages of type `T` to RabbitMQ.
pub struct RabbitMQSender<T> {
    conn: Arc<Connection>,
    options: SenderOptions,
    key: Option<EncryptionKey>,
    _message: PhantomData<fn(&T)>,
}

impl<T> RabbitMQSender<T> {
    /// Builds a sender on an existing connection.
    ///
    /// # Parameters
    /// * `conn` - Connection shared with other senders, each publish opens its own channel
    /// * `options` - Target exchange, routing key and optional encryption key
    ///
    /// # Returns
    /// The sender, or a codec error when the encryption key is invalid
    pub fn new(conn: Arc<Connection>, options: SenderOptions) -> Result<Self, PublishError> {
        let key = options.encryption_key()?;

        Ok(RabbitMQSender {
            conn,
            options,
            key,
            _message: PhantomData,
        })
    }

    /// Opens a dedicated connection and builds a sender on it.
    ///
    /// # Returns
    /// The sender, or a broker error when the connection cannot be opened
    pub async fn connect(cfg: &RabbitMQConfigs, options: SenderOptions) -> Result<Self, PublishError> {
        let conn = new_amqp_connection(cfg).await?;
        Self::new(conn, options)
    }
}

#[async_trait]
impl<T> Sender<T> for RabbitMQSender<T>
where
    T: Serialize + Send + Sync,
{
    async fn send(&self, message: &T, metadata: Option<MetaData>) -> Result<(), PublishError> {
        let channel = create_channel(&self.conn).await?;

        let result = match AmqpChannel::with_confirms(channel.clone()).await {
            Ok(broker) => {
                publish_envelope(
                    &broker,
                    &self.options,
                    self.key.as_ref(),
                    message,
                    metadata.unwrap_or_default(),
                )
                .await
            }
            Err(err) => Err(err.into()),
        };

        close_channel(&channel).await;
        result
    }
}

/// Encodes `message` and publishes it on `channel` with the sender's exchange and
/// routing key. Missing `MessageId` and `EnqueuedDateTime` are filled in.
pub async fn publish_envelope<T>(
    channel: &dyn BrokerChannel,
    options: &SenderOptions,
    key: Option<&EncryptionKey>,
    message: &T,
    metadata: MetaData,
) -> Result<(), PublishError>
where
    T: Serialize,
{
    let metadata = stamp(metadata);
    let encoded = encode(message, &metadata, key)?;
    let properties = properties(&metadata, &encoded);

    debug!(
        exchange = options.exchange_name.as_str(),
        routing_key = options.routing_key.as_str(),
        encrypted = encoded.iv.is_some(),
        "publishing message"
    );

    match channel
        .publish(
            &options.exchange_name,
            &options.routing_key,
            &encoded.body,
            properties,
        )
        .await
    {
        Err(AmqpError::PublishNackedError) => Err(PublishError::Nacked),
        Err(AmqpError::PublishReturnedError(routing_key)) => {
            Err(PublishError::Unroutable(routing_key))
        }
        Err(err) => {
            error!(error = err.to_string(), "error publishing message");
            Err(err.into())
        }
        Ok(()) => Ok(()),
    }
}

fn stamp(mut metadata: MetaData) -> MetaData {
    if metadata.message_id.as_deref().map_or(true, str::is_empty) {
        metadata.message_id = Some(Uuid::new_v4().to_string());
    }
    metadata.enqueued_date_time = Some(Utc::now());
    metadata
}

fn properties(metadata: &MetaData, encoded: &EncodedMessage) -> AMQPProperties {
    let mut headers = BTreeMap::<ShortString, AMQPValue>::default();
    otel::inject_current_context(&mut headers);

    if let Some(iv) = encoded.iv {
        headers.insert(
            ShortString::from(AMQP_HEADERS_ENCRYPTED),
            AMQPValue::Boolean(true),
        );
        headers.insert(
            ShortString::from(AMQP_HEADERS_ENCRYPTED_IV),
            AMQPValue::LongString(LongString::from(BASE64.encode(iv))),
        );
    }

    let mut props = AMQPProperties::default()
        .with_content_type(ShortString::from(JSON_CONTENT_TYPE))
        .with_delivery_mode(PERSISTENT_DELIVERY_MODE)
        .with_headers(FieldTable::from(headers));

    if let Some(id) = &metadata.message_id {
        props = props.with_message_id(ShortString::from(id.clone()));
    }
    if let Some(id) = &metadata.correlation_id {
        props = props.with_correlation_id(ShortString::from(id.clone()));
    }

    props
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{channel::MockBrokerChannel, envelope::decode};
    use serde::Deserialize;
    use std::sync::Mutex;

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    struct Order {
        id: u32,
    }

    type Captured = Arc<Mutex<Vec<(String, String, Vec<u8>, AMQPProperties)>>>;

    fn capturing_channel(captured: Captured) -> MockBrokerChannel {
        let mut channel = MockBrokerChannel::new();
        channel
            .expect_publish()
            .times(1)
            .returning(move |exchange, key, payload, props| {
                captured.lock().unwrap().push((
                    exchange.to_owned(),
                    key.to_owned(),
                    payload.to_vec(),
                    props,
                ));
                Ok(())
            });
        channel
    }

    #[tokio::test]
    async fn publishes_persistent_envelope_with_generated_id() {
        let captured = Captured::default();
        let channel = capturing_channel(captured.clone());
        let options = SenderOptions::new("orders", "order.created");

        let metadata = MetaData {
            correlation_id: Some("corr-1".to_owned()),
            ..MetaData::default()
        };
        publish_envelope(&channel, &options, None, &Order { id: 7 }, metadata)
            .await
            .unwrap();

        let (exchange, key, body, props) = captured.lock().unwrap().remove(0);
        assert_eq!(exchange, "orders");
        assert_eq!(key, "order.created");
        assert_eq!(props.delivery_mode(), &Some(PERSISTENT_DELIVERY_MODE));
        assert_eq!(
            props.content_type().as_ref().map(|c| c.as_str()),
            Some(JSON_CONTENT_TYPE)
        );
        assert_eq!(
            props.correlation_id().as_ref().map(|c| c.as_str()),
            Some("corr-1")
        );

        let (order, meta): (Order, MetaData) = decode(&body, None).unwrap();
        assert_eq!(order, Order { id: 7 });
        assert!(meta.enqueued_date_time.is_some());
        assert_eq!(meta.correlation_id.as_deref(), Some("corr-1"));
        assert_eq!(
            props.message_id().as_ref().map(|c| c.as_str().to_owned()),
            meta.message_id
        );
    }

    #[tokio::test]
    async fn keeps_caller_message_id() {
        let captured = Captured::default();
        let channel = capturing_channel(captured.clone());

        let metadata = MetaData {
            message_id: Some("msg-1".to_owned()),
            ..MetaData::default()
        };
        publish_envelope(&channel, &SenderOptions::new("", "jobs"), None, &1u32, metadata)
            .await
            .unwrap();

        let (_, _, body, _) = captured.lock().unwrap().remove(0);
        let (_, meta): (u32, MetaData) = decode(&body, None).unwrap();
        assert_eq!(meta.message_id.as_deref(), Some("msg-1"));
    }

    #[tokio::test]
    async fn encrypted_messages_carry_iv_header() {
        let captured = Captured::default();
        let channel = capturing_channel(captured.clone());
        let key = EncryptionKey::generate();

        publish_envelope(
            &channel,
            &SenderOptions::new("orders", "k"),
            Some(&key),
            &Order { id: 1 },
            MetaData::default(),
        )
        .await
        .unwrap();

        let (_, _, body, props) = captured.lock().unwrap().remove(0);
        let headers = props.headers().clone().unwrap_or_default();
        let headers = headers.inner();
        assert_eq!(
            headers.get(AMQP_HEADERS_ENCRYPTED),
            Some(&AMQPValue::Boolean(true))
        );

        let iv = match headers.get(AMQP_HEADERS_ENCRYPTED_IV) {
            Some(AMQPValue::LongString(iv)) => String::from_utf8_lossy(iv.as_bytes()).into_owned(),
            other => panic!("unexpected iv header {other:?}"),
        };
        let body_text = String::from_utf8(body.clone()).unwrap();
        assert!(body_text.starts_with(&format!("{iv}.")));

        let (order, _): (Order, MetaData) = decode(&body, Some(&key)).unwrap();
        assert_eq!(order, Order { id: 1 });
    }

    #[tokio::test]
    async fn broker_nack_is_reported() {
        let mut channel = MockBrokerChannel::new();
        channel
            .expect_publish()
            .times(1)
            .returning(|_, _, _, _| Err(AmqpError::PublishNackedError));

        let result = publish_envelope(
            &channel,
            &SenderOptions::new("orders", "k"),
            None,
            &1u32,
            MetaData::default(),
        )
        .await;
        assert_eq!(result, Err(PublishError::Nacked));
    }

    #[tokio::test]
    async fn unroutable_message_is_reported() {
        let mut channel = MockBrokerChannel::new();
        channel
            .expect_publish()
            .times(1)
            .returning(|_, key, _, _| Err(AmqpError::PublishReturnedError(key.to_owned())));

        let result = publish_envelope(
            &channel,
            &SenderOptions::new("", "missing"),
            None,
            &1u32,
            MetaData::default(),
        )
        .await;
        assert_eq!(result, Err(PublishError::Unroutable("missing".to_owned())));
    }

    #[tokio::test]
    async fn broker_failures_are_propagated() {
        let mut channel = MockBrokerChannel::new();
        channel
            .expect_publish()
            .times(1)
            .returning(|_, _, _, _| Err(AmqpError::PublishingError));

        let result = publish_envelope(
            &channel,
            &SenderOptions::new("orders", "k"),
            None,
            &1u32,
            MetaData::default(),
        )
        .await;
        assert_eq!(result, Err(PublishError::Broker(AmqpError::PublishingError)));
    }
}
