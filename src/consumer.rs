// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # RabbitMQ Message Consumer
//!
//! Processing of a single delivery:
//! 1. Parse the attempt headers and open a consumer span
//! 2. Decode (and decrypt) the envelope
//! 3. Run the handler, catching panics
//! 4. Ask the policy for the action matching the outcome
//! 5. Ack, republish to the next retry tier, dead-letter or halt
//!
//! A delivery that cannot be decoded is an unclassified failure: it is never retried.

use crate::{
    channel::BrokerChannel,
    delivery::{with_retry_header, InboundDelivery},
    envelope::{decode, EncryptionKey, MetaData},
    errors::AmqpError,
    messaging::ConsumerHandler,
    otel,
    policy::{decide, Action, ConsumerOutcome},
    topology::{retry_queue_name, TopologyDescriptor},
};
use futures_util::FutureExt;
use opentelemetry::{
    global::{self, BoxedTracer},
    trace::{Span, Status},
};
use serde::de::DeserializeOwned;
use std::{any::Any, borrow::Cow, panic::AssertUnwindSafe, sync::Arc};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};

/// AMQP delivery mode marking a message persistent.
pub const PERSISTENT_DELIVERY_MODE: u8 = 2;

/// Processes deliveries of one primary queue with a single handler.
pub struct DeliveryProcessor<T> {
    queue: String,
    max_retries: u32,
    dead_letter_enabled: bool,
    key: Option<EncryptionKey>,
    handler: Arc<dyn ConsumerHandler<T>>,
    tracer: BoxedTracer,
}

impl<T> DeliveryProcessor<T>
where
    T: DeserializeOwned + Send + 'static,
{
    /// Creates a processor for the primary queue of `descriptor`.
    ///
    /// # Parameters
    /// * `descriptor` - Supplies the queue name, retry tier count and dead-letter flag
    /// * `key` - Decrypts every delivery when set
    /// * `handler` - Business handler invoked once per decoded message
    pub fn new(
        descriptor: &TopologyDescriptor,
        key: Option<EncryptionKey>,
        handler: Arc<dyn ConsumerHandler<T>>,
    ) -> Self {
        DeliveryProcessor {
            queue: descriptor.primary_queue().to_owned(),
            max_retries: descriptor.retry_tier_count(),
            dead_letter_enabled: descriptor.dead_letter_enabled(),
            key,
            handler,
            tracer: global::tracer(otel::CONSUMER_TRACER_NAME),
        }
    }

    /// Runs `delivery` through the handler and settles it on `channel`.
    ///
    /// Returns the action taken. An error means the broker rejected the
    /// settlement and the delivery is still unacknowledged.
    pub async fn process(
        &self,
        channel: &dyn BrokerChannel,
        delivery: &InboundDelivery,
        cancel: &CancellationToken,
    ) -> Result<Action, AmqpError> {
        let attempt = delivery.attempt();
        let (_ctx, mut span) = otel::new_span(&delivery.properties, &self.tracer, &self.queue);

        debug!(
            queue = self.queue.as_str(),
            delivery_tag = attempt.delivery_tag,
            retry = attempt.retry_count,
            encrypted = attempt.encrypted,
            "received"
        );

        let outcome = match decode::<T>(&delivery.data, self.key.as_ref()) {
            Ok((message, metadata)) => self.invoke(message, metadata, cancel.clone()).await,
            Err(err) => {
                warn!(error = err.to_string(), "failure to decode message");
                ConsumerOutcome::from(err)
            }
        };

        let action = decide(
            &outcome,
            attempt.retry_count,
            self.max_retries,
            self.dead_letter_enabled,
        );

        if !outcome.is_success() {
            span.set_status(Status::Error {
                description: Cow::from(outcome.reason().to_owned()),
            });
        }

        let result = self.settle(channel, delivery, &outcome, action).await;
        match &result {
            Err(err) => {
                span.record_error(err);
                span.set_status(Status::Error {
                    description: Cow::from(err.to_string()),
                });
            }
            Ok(Action::Ack) => span.set_status(Status::Ok),
            Ok(_) => {}
        }

        result
    }

    async fn invoke(&self, message: T, metadata: MetaData, cancel: CancellationToken) -> ConsumerOutcome {
        let handled = AssertUnwindSafe(self.handler.handle(message, metadata, cancel))
            .catch_unwind()
            .await;

        match handled {
            Ok(result) => ConsumerOutcome::from(result),
            Err(panic) => {
                let reason = panic_reason(panic);
                error!(queue = self.queue.as_str(), reason = reason.as_str(), "handler panicked");
                ConsumerOutcome::UnclassifiedFailure(reason)
            }
        }
    }

    async fn settle(
        &self,
        channel: &dyn BrokerChannel,
        delivery: &InboundDelivery,
        outcome: &ConsumerOutcome,
        action: Action,
    ) -> Result<Action, AmqpError> {
        let tag = delivery.delivery_tag;

        match action {
            Action::Ack => {
                debug!("message successfully processed");
                channel.ack(tag).await?;
            }
            Action::RepublishTier(tier) => {
                let retry_queue = retry_queue_name(&self.queue, tier);
                warn!(
                    reason = outcome.reason(),
                    retry = tier,
                    queue = retry_queue.as_str(),
                    "error whiling handling msg, requeuing for latter"
                );

                let headers = with_retry_header(delivery.properties.headers().as_ref(), tier);
                let properties = delivery
                    .properties
                    .clone()
                    .with_headers(headers)
                    .with_delivery_mode(PERSISTENT_DELIVERY_MODE);

                channel
                    .publish("", &retry_queue, &delivery.data, properties)
                    .await
                    .map_err(|_| AmqpError::RepublishError(retry_queue.clone()))?;
                channel.ack(tag).await?;
            }
            Action::DeadLetter => {
                error!(reason = outcome.reason(), "sending to dlq");
                channel.nack(tag, false).await?;
            }
            Action::Halt => {
                error!(
                    queue = self.queue.as_str(),
                    reason = outcome.reason(),
                    "message can't be retried or dead-lettered, halting consumer"
                );
                channel.nack(tag, false).await?;
            }
        }

        Ok(action)
    }
}

fn panic_reason(panic: Box<dyn Any + Send>) -> String {
    if let Some(msg) = panic.downcast_ref::<&str>() {
        return format!("handler panicked: {msg}");
    }
    if let Some(msg) = panic.downcast_ref::<String>() {
        return format!("handler panicked: {msg}");
    }
    "handler panicked".to_owned()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        channel::MockBrokerChannel,
        delivery::AMQP_HEADERS_RETRY,
        envelope::encode,
        errors::HandlerError,
        messaging::handler_fn,
        topology::RetrySchedule,
    };
    use lapin::{
        protocol::basic::AMQPProperties,
        types::{AMQPValue, FieldTable, ShortString},
    };
    use mockall::predicate::eq;
    use std::{collections::BTreeMap, time::Duration};

    fn descriptor(dead_letter: bool) -> TopologyDescriptor {
        let d = TopologyDescriptor::new("orders")
            .retries(3, RetrySchedule::Linear(Duration::from_secs(1)));
        if dead_letter {
            d.with_dead_letter()
        } else {
            d
        }
    }

    fn delivery(tag: u64, retry: Option<i32>) -> InboundDelivery {
        let body = encode(&"pizza".to_owned(), &MetaData::default(), None).unwrap().body;
        let mut props = AMQPProperties::default();
        if let Some(retry) = retry {
            let mut headers = BTreeMap::new();
            headers.insert(ShortString::from(AMQP_HEADERS_RETRY), AMQPValue::LongInt(retry));
            props = props.with_headers(FieldTable::from(headers));
        }
        InboundDelivery::new(tag, props, body)
    }

    fn processor(
        dead_letter: bool,
        result: Result<(), HandlerError>,
    ) -> DeliveryProcessor<String> {
        let handler = handler_fn(move |_: String, _: MetaData, _: CancellationToken| {
            let result = result.clone();
            async move { result }
        });
        DeliveryProcessor::new(&descriptor(dead_letter), None, Arc::new(handler))
    }

    #[tokio::test]
    async fn success_is_acked() {
        let mut channel = MockBrokerChannel::new();
        channel.expect_ack().with(eq(1)).times(1).returning(|_| Ok(()));
        channel.expect_nack().never();
        channel.expect_publish().never();

        let action = processor(true, Ok(()))
            .process(&channel, &delivery(1, None), &CancellationToken::new())
            .await;
        assert_eq!(action, Ok(Action::Ack));
    }

    #[tokio::test]
    async fn retryable_failure_republishes_to_next_tier_then_acks() {
        let mut channel = MockBrokerChannel::new();
        let original = delivery(5, Some(1));
        let body = original.data.clone();

        channel
            .expect_publish()
            .withf(move |exchange, key, payload, props| {
                let retry = props
                    .headers()
                    .as_ref()
                    .and_then(|h| h.inner().get(AMQP_HEADERS_RETRY).cloned());
                exchange.is_empty()
                    && key == "orders-retry-2"
                    && payload == body.as_slice()
                    && retry == Some(AMQPValue::LongInt(2))
                    && props.delivery_mode() == &Some(PERSISTENT_DELIVERY_MODE)
            })
            .times(1)
            .returning(|_, _, _, _| Ok(()));
        channel.expect_ack().with(eq(5)).times(1).returning(|_| Ok(()));
        channel.expect_nack().never();

        let action = processor(true, Err(HandlerError::retryable("timeout")))
            .process(&channel, &original, &CancellationToken::new())
            .await;
        assert_eq!(action, Ok(Action::RepublishTier(2)));
    }

    #[tokio::test]
    async fn failed_republish_leaves_delivery_unacked() {
        let mut channel = MockBrokerChannel::new();
        channel
            .expect_publish()
            .returning(|_, _, _, _| Err(AmqpError::PublishingError));
        channel.expect_ack().never();
        channel.expect_nack().never();

        let action = processor(true, Err(HandlerError::retryable("timeout")))
            .process(&channel, &delivery(2, None), &CancellationToken::new())
            .await;
        assert_eq!(
            action,
            Err(AmqpError::RepublishError("orders-retry-1".to_owned()))
        );
    }

    #[tokio::test]
    async fn missing_retry_queue_keeps_delivery_unacked() {
        let mut channel = MockBrokerChannel::new();
        channel
            .expect_publish()
            .withf(|_, key, _, _| key == "orders-retry-1")
            .times(1)
            .returning(|_, key, _, _| Err(AmqpError::PublishReturnedError(key.to_owned())));
        channel.expect_ack().never();
        channel.expect_nack().never();

        let action = processor(true, Err(HandlerError::retryable("timeout")))
            .process(&channel, &delivery(4, None), &CancellationToken::new())
            .await;
        assert_eq!(
            action,
            Err(AmqpError::RepublishError("orders-retry-1".to_owned()))
        );
    }

    #[tokio::test]
    async fn exhausted_retries_are_dead_lettered() {
        let mut channel = MockBrokerChannel::new();
        channel
            .expect_nack()
            .with(eq(9), eq(false))
            .times(1)
            .returning(|_, _| Ok(()));
        channel.expect_publish().never();
        channel.expect_ack().never();

        let action = processor(true, Err(HandlerError::retryable("timeout")))
            .process(&channel, &delivery(9, Some(3)), &CancellationToken::new())
            .await;
        assert_eq!(action, Ok(Action::DeadLetter));
    }

    #[tokio::test]
    async fn unclassified_failure_without_dead_letter_halts() {
        let mut channel = MockBrokerChannel::new();
        channel
            .expect_nack()
            .with(eq(3), eq(false))
            .times(1)
            .returning(|_, _| Ok(()));
        channel.expect_publish().never();

        let action = processor(false, Err(HandlerError::unclassified("boom")))
            .process(&channel, &delivery(3, None), &CancellationToken::new())
            .await;
        assert_eq!(action, Ok(Action::Halt));
    }

    #[tokio::test]
    async fn handler_panic_is_unclassified() {
        let mut channel = MockBrokerChannel::new();
        channel.expect_nack().times(1).returning(|_, _| Ok(()));
        channel.expect_publish().never();

        let handler = handler_fn(|_: String, _: MetaData, _: CancellationToken| async move {
            if true {
                panic!("kaboom");
            }
            Ok::<(), HandlerError>(())
        });
        let processor = DeliveryProcessor::new(&descriptor(true), None, Arc::new(handler));

        let action = processor
            .process(&channel, &delivery(4, None), &CancellationToken::new())
            .await;
        assert_eq!(action, Ok(Action::DeadLetter));
    }

    #[tokio::test]
    async fn undecodable_body_is_never_retried() {
        let mut channel = MockBrokerChannel::new();
        channel.expect_nack().times(1).returning(|_, _| Ok(()));
        channel.expect_publish().never();

        let handler = handler_fn(|_: String, _: MetaData, _: CancellationToken| async move {
            Err::<(), _>(HandlerError::retryable("never called"))
        });
        let processor = DeliveryProcessor::new(
            &descriptor(true),
            Some(EncryptionKey::generate()),
            Arc::new(handler),
        );

        let action = processor
            .process(&channel, &delivery(6, None), &CancellationToken::new())
            .await;
        assert_eq!(action, Ok(Action::DeadLetter));
    }
}
