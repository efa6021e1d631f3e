// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Deliveries and Attempt Headers
//!
//! The broker-agnostic view of a received message and the typed attempt state
//! parsed from its headers.

use lapin::{
    message::Delivery,
    protocol::basic::AMQPProperties,
    types::{AMQPValue, FieldTable, LongInt, ShortString},
};

/// Header carrying how many times a message was republished to a retry tier.
pub const AMQP_HEADERS_RETRY: &str = "x-retry";
/// Header flagging an encrypted body.
pub const AMQP_HEADERS_ENCRYPTED: &str = "x-encrypted";
/// Header carrying the base64 IV of an encrypted body.
pub const AMQP_HEADERS_ENCRYPTED_IV: &str = "x-encrypted-iv";

/// A message handed to the dispatcher by the broker.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct InboundDelivery {
    pub delivery_tag: u64,
    pub properties: AMQPProperties,
    pub data: Vec<u8>,
}

impl InboundDelivery {
    pub fn new(delivery_tag: u64, properties: AMQPProperties, data: Vec<u8>) -> Self {
        InboundDelivery {
            delivery_tag,
            properties,
            data,
        }
    }

    pub fn attempt(&self) -> DeliveryAttempt {
        DeliveryAttempt::from_delivery(self.delivery_tag, &self.properties)
    }
}

impl From<Delivery> for InboundDelivery {
    fn from(delivery: Delivery) -> Self {
        InboundDelivery {
            delivery_tag: delivery.delivery_tag,
            properties: delivery.properties,
            data: delivery.data,
        }
    }
}

/// Attempt state of one delivery, parsed from the known headers.
///
/// Absent or unreadable headers fall back to a first attempt without encryption.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DeliveryAttempt {
    pub delivery_tag: u64,
    pub retry_count: u32,
    pub encrypted: bool,
    pub iv: Option<String>,
}

impl DeliveryAttempt {
    pub fn from_delivery(delivery_tag: u64, props: &AMQPProperties) -> Self {
        let headers = props.headers().clone().unwrap_or_default();
        let headers = headers.inner();

        let retry_count = headers
            .get(AMQP_HEADERS_RETRY)
            .and_then(parse_count)
            .unwrap_or_default();

        let encrypted = matches!(
            headers.get(AMQP_HEADERS_ENCRYPTED),
            Some(AMQPValue::Boolean(true))
        );

        let iv = headers.get(AMQP_HEADERS_ENCRYPTED_IV).and_then(as_text);

        DeliveryAttempt {
            delivery_tag,
            retry_count,
            encrypted,
            iv,
        }
    }
}

/// Returns a copy of `headers` with the retry counter set to `retry_count`.
pub fn with_retry_header(headers: Option<&FieldTable>, retry_count: u32) -> FieldTable {
    let mut table = headers.cloned().unwrap_or_default();
    table.insert(
        ShortString::from(AMQP_HEADERS_RETRY),
        AMQPValue::LongInt(LongInt::from(retry_count.min(i32::MAX as u32) as i32)),
    );
    table
}

fn parse_count(value: &AMQPValue) -> Option<u32> {
    let count: i64 = match value {
        AMQPValue::ShortShortInt(v) => i64::from(*v),
        AMQPValue::ShortShortUInt(v) => i64::from(*v),
        AMQPValue::ShortInt(v) => i64::from(*v),
        AMQPValue::ShortUInt(v) => i64::from(*v),
        AMQPValue::LongInt(v) => i64::from(*v),
        AMQPValue::LongUInt(v) => i64::from(*v),
        AMQPValue::LongLongInt(v) => *v,
        AMQPValue::LongString(_) | AMQPValue::ShortString(_) => as_text(value)?.trim().parse().ok()?,
        _ => return None,
    };

    u32::try_from(count.max(0)).ok()
}

fn as_text(value: &AMQPValue) -> Option<String> {
    match value {
        AMQPValue::LongString(v) => std::str::from_utf8(v.as_bytes()).ok().map(str::to_owned),
        AMQPValue::ShortString(v) => Some(v.as_str().to_owned()),
        _ => None,
    }
}
