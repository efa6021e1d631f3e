// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Retry Topology
//!
//! A receiver consumes from one primary queue `Q` backed by:
//! - `Q-retry-1` .. `Q-retry-N`: one queue per retry tier, each holding a failed
//!   message for its TTL and then dead-lettering it back to `Q` through the default
//!   exchange. Tier TTLs strictly increase with the tier number.
//! - `Q-dead-letters` (optional): where `Q` forwards rejected messages.
//!
//! [`provision`] declares all of them in that order. Declaring the same descriptor
//! twice is a no-op on the broker, while a changed descriptor (for example a new
//! TTL on an existing tier) fails with [`ProvisionError::Conflict`].

use crate::{
    channel::BrokerChannel,
    errors::{AmqpError, ProvisionError},
    exchange::{ExchangeDefinition, ExchangeKind},
    queue::{QueueBinding, QueueDefinition, QueueDurability, QueueType, MAX_MESSAGE_TTL},
};
use std::time::Duration;
use tracing::{debug, error};

/// Suffix of retry tier queues, followed by the tier number.
pub const RETRY_QUEUE_SUFFIX: &str = "-retry-";
/// Suffix of the dead-letter queue.
pub const DEAD_LETTER_QUEUE_SUFFIX: &str = "-dead-letters";

/// Delay applied by each retry tier.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RetrySchedule {
    /// Tier k waits `base * k`.
    Linear(Duration),
    /// Tier k waits `intervals[k - 1]`. Must cover every tier and strictly increase.
    Intervals(Vec<Duration>),
}

impl Default for RetrySchedule {
    fn default() -> Self {
        RetrySchedule::Linear(Duration::from_secs(5))
    }
}

/// Name of retry tier `tier` (1-based) for `queue`.
pub fn retry_queue_name(queue: &str, tier: u32) -> String {
    format!("{queue}{RETRY_QUEUE_SUFFIX}{tier}")
}

/// Name of the dead-letter queue for `queue`.
pub fn dead_letter_queue_name(queue: &str) -> String {
    format!("{queue}{DEAD_LETTER_QUEUE_SUFFIX}")
}

/// Everything needed to declare a receiver's queues. Immutable once the receiver starts.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TopologyDescriptor {
    primary_queue: String,
    exchange: String,
    routing_key: String,
    exchange_kind: Option<ExchangeKind>,
    retry_tier_count: u32,
    retry_schedule: RetrySchedule,
    dead_letter_enabled: bool,
    queue_type: QueueType,
    durability: QueueDurability,
    single_active_consumer: bool,
}

impl TopologyDescriptor {
    /// A primary queue with no retry tiers and no dead-letter queue.
    pub fn new(primary_queue: &str) -> Self {
        TopologyDescriptor {
            primary_queue: primary_queue.to_owned(),
            exchange: String::new(),
            routing_key: String::new(),
            exchange_kind: None,
            retry_tier_count: 0,
            retry_schedule: RetrySchedule::default(),
            dead_letter_enabled: false,
            queue_type: QueueType::Classic,
            durability: QueueDurability::Durable,
            single_active_consumer: false,
        }
    }

    /// Binds the primary queue to `exchange` with `routing_key`. An empty exchange
    /// means the default exchange, which needs no binding.
    pub fn exchange(mut self, exchange: &str, routing_key: &str) -> Self {
        self.exchange = exchange.to_owned();
        self.routing_key = routing_key.to_owned();
        self
    }

    /// Declares the exchange with `kind` before binding to it.
    pub fn declare_exchange(mut self, kind: ExchangeKind) -> Self {
        self.exchange_kind = Some(kind);
        self
    }

    /// One retry tier per allowed retry, delays taken from `schedule`.
    pub fn retries(mut self, max_retries: u32, schedule: RetrySchedule) -> Self {
        self.retry_tier_count = max_retries;
        self.retry_schedule = schedule;
        self
    }

    /// Adds the `Q-dead-letters` queue and makes the primary queue forward
    /// rejected messages to it. Without it permanent failures halt the consumer.
    pub fn with_dead_letter(mut self) -> Self {
        self.dead_letter_enabled = true;
        self
    }

    /// Storage type of the primary queue. Retry and dead-letter queues stay classic.
    pub fn queue_type(mut self, queue_type: QueueType) -> Self {
        self.queue_type = queue_type;
        self
    }

    /// Durability of every declared queue, and of the exchange when it is declared.
    ///
    /// # Parameters
    /// * `durability` - `Transient` queues lose their messages on a broker restart
    pub fn durability(mut self, durability: QueueDurability) -> Self {
        self.durability = durability;
        self
    }

    /// Lets the broker deliver the primary queue to a single consumer at a time,
    /// the others standing by.
    pub fn single_active_consumer(mut self) -> Self {
        self.single_active_consumer = true;
        self
    }

    pub fn primary_queue(&self) -> &str {
        &self.primary_queue
    }

    pub fn exchange_name(&self) -> &str {
        &self.exchange
    }

    pub fn routing_key(&self) -> &str {
        &self.routing_key
    }

    /// Number of retry tiers, equal to the maximum retry count.
    pub fn retry_tier_count(&self) -> u32 {
        self.retry_tier_count
    }

    pub fn dead_letter_enabled(&self) -> bool {
        self.dead_letter_enabled
    }

    pub fn queue_durability(&self) -> QueueDurability {
        self.durability
    }

    pub fn retry_queue(&self, tier: u32) -> String {
        retry_queue_name(&self.primary_queue, tier)
    }

    pub fn dead_letter_queue(&self) -> Option<String> {
        self.dead_letter_enabled
            .then(|| dead_letter_queue_name(&self.primary_queue))
    }

    /// TTL of retry tier `tier` (1-based), `None` outside `1..=retry_tier_count`.
    pub fn tier_ttl(&self, tier: u32) -> Option<Duration> {
        if tier == 0 || tier > self.retry_tier_count {
            return None;
        }

        match &self.retry_schedule {
            RetrySchedule::Linear(base) => base.checked_mul(tier),
            RetrySchedule::Intervals(intervals) => intervals.get(tier as usize - 1).copied(),
        }
    }

    /// Checks the invariants a provisioned topology relies on: a non-empty queue
    /// name, a TTL for every tier, TTLs the broker can represent and strictly
    /// increasing TTLs.
    pub fn validate(&self) -> Result<(), ProvisionError> {
        if self.primary_queue.trim().is_empty() {
            return Err(ProvisionError::InvalidDescriptor(
                "primary queue name is empty".to_owned(),
            ));
        }

        if let RetrySchedule::Intervals(intervals) = &self.retry_schedule {
            if intervals.len() < self.retry_tier_count as usize {
                return Err(ProvisionError::InvalidDescriptor(format!(
                    "{} retry tiers configured but only {} retry intervals",
                    self.retry_tier_count,
                    intervals.len()
                )));
            }
        }

        let mut previous = Duration::ZERO;
        for tier in 1..=self.retry_tier_count {
            let Some(ttl) = self.tier_ttl(tier) else {
                return Err(ProvisionError::InvalidDescriptor(format!(
                    "retry tier {tier} has no ttl"
                )));
            };
            if ttl > MAX_MESSAGE_TTL {
                return Err(ProvisionError::InvalidDescriptor(format!(
                    "retry tier {tier} ttl exceeds {}ms",
                    MAX_MESSAGE_TTL.as_millis()
                )));
            }
            if ttl <= previous {
                return Err(ProvisionError::InvalidDescriptor(format!(
                    "retry tier {tier} ttl must be greater than {}ms",
                    previous.as_millis()
                )));
            }
            previous = ttl;
        }

        Ok(())
    }

    /// Queue declarations in the order they must be applied: dead-letter queue,
    /// retry tiers, then the primary queue.
    ///
    /// # Returns
    /// The definitions, or `InvalidDescriptor` when a tier has no representable TTL
    pub fn queue_definitions(&self) -> Result<Vec<QueueDefinition>, ProvisionError> {
        let mut defs = vec![];

        let dead_letter_queue = self.dead_letter_queue();
        if let Some(name) = &dead_letter_queue {
            defs.push(QueueDefinition::new(name).durability(self.durability));
        }

        for tier in 1..=self.retry_tier_count {
            let ttl = self.tier_ttl(tier).ok_or_else(|| {
                ProvisionError::InvalidDescriptor(format!("retry tier {tier} has no ttl"))
            })?;
            defs.push(
                QueueDefinition::new(&self.retry_queue(tier))
                    .durability(self.durability)
                    .ttl(ttl)?
                    .dead_letter_to(&self.primary_queue),
            );
        }

        let mut primary = QueueDefinition::new(&self.primary_queue)
            .durability(self.durability)
            .queue_type(&self.queue_type);
        if let Some(name) = &dead_letter_queue {
            primary = primary.dead_letter_to(name);
        }
        if self.single_active_consumer {
            primary = primary.single_active_consumer();
        }
        defs.push(primary);

        Ok(defs)
    }

    fn binding(&self) -> Option<QueueBinding> {
        if self.exchange.is_empty() {
            return None;
        }

        Some(
            QueueBinding::new(&self.primary_queue)
                .exchange(&self.exchange)
                .routing_key(&self.routing_key),
        )
    }
}

/// Declares the topology described by `descriptor`.
///
/// # Parameters
/// * `channel` - Channel the declarations are sent on
/// * `descriptor` - Queues, tiers and binding to declare, validated first
///
/// # Returns
/// `Ok(())` when every declaration succeeded or already matched the broker,
/// `Conflict` when an existing queue was declared with other arguments
pub async fn provision(
    channel: &dyn BrokerChannel,
    descriptor: &TopologyDescriptor,
) -> Result<(), ProvisionError> {
    descriptor.validate()?;

    if let (Some(kind), false) = (&descriptor.exchange_kind, descriptor.exchange.is_empty()) {
        let mut def = ExchangeDefinition::new(&descriptor.exchange).kind(kind.clone());
        if descriptor.durability == QueueDurability::Transient {
            def = def.transient();
        }
        channel.declare_exchange(&def).await.map_err(conflict)?;
    }

    for def in descriptor.queue_definitions()? {
        channel.declare_queue(&def).await.map_err(conflict)?;
    }

    if let Some(binding) = descriptor.binding() {
        channel.bind_queue(&binding).await?;
    }

    debug!(
        queue = descriptor.primary_queue.as_str(),
        retry_tiers = descriptor.retry_tier_count,
        dead_letter = descriptor.dead_letter_enabled,
        "topology provisioned"
    );

    Ok(())
}

fn conflict(err: AmqpError) -> ProvisionError {
    match err {
        AmqpError::PreconditionFailed(queue) => {
            error!(queue = queue.as_str(), "topology conflicts with the declared one");
            ProvisionError::Conflict { queue }
        }
        other => ProvisionError::Broker(other),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{channel::MockBrokerChannel, queue::AMQP_HEADERS_DEAD_LETTER_ROUTING_KEY};
    use lapin::types::{AMQPValue, LongString};
    use mockall::Sequence;

    fn descriptor() -> TopologyDescriptor {
        TopologyDescriptor::new("orders")
            .exchange("events", "order.created")
            .retries(3, RetrySchedule::Linear(Duration::from_secs(5)))
            .with_dead_letter()
    }

    #[test]
    fn linear_schedule_grows_with_tier() {
        let d = descriptor();
        assert_eq!(d.tier_ttl(0), None);
        assert_eq!(d.tier_ttl(1), Some(Duration::from_secs(5)));
        assert_eq!(d.tier_ttl(2), Some(Duration::from_secs(10)));
        assert_eq!(d.tier_ttl(3), Some(Duration::from_secs(15)));
        assert_eq!(d.tier_ttl(4), None);
    }

    #[test]
    fn naming_convention() {
        let d = descriptor();
        assert_eq!(d.retry_queue(2), "orders-retry-2");
        assert_eq!(d.dead_letter_queue().as_deref(), Some("orders-dead-letters"));
        assert_eq!(TopologyDescriptor::new("orders").dead_letter_queue(), None);
    }

    #[test]
    fn declarations_follow_dead_letter_tiers_primary_order() {
        let defs = descriptor().queue_definitions().unwrap();
        let names: Vec<&str> = defs.iter().map(|d| d.name()).collect();
        assert_eq!(
            names,
            vec![
                "orders-dead-letters",
                "orders-retry-1",
                "orders-retry-2",
                "orders-retry-3",
                "orders"
            ]
        );

        let ttls: Vec<i64> = defs[1..4].iter().filter_map(|d| d.ttl_millis()).collect();
        assert_eq!(ttls, vec![5000, 10_000, 15_000]);

        for tier in &defs[1..4] {
            assert_eq!(
                tier.argument(AMQP_HEADERS_DEAD_LETTER_ROUTING_KEY),
                Some(&AMQPValue::LongString(LongString::from("orders")))
            );
        }

        assert_eq!(
            defs[4].argument(AMQP_HEADERS_DEAD_LETTER_ROUTING_KEY),
            Some(&AMQPValue::LongString(LongString::from("orders-dead-letters")))
        );
    }

    #[test]
    fn primary_without_dead_letter_has_no_forwarding() {
        let defs = TopologyDescriptor::new("orders")
            .retries(1, RetrySchedule::Linear(Duration::from_secs(1)))
            .queue_definitions()
            .unwrap();

        assert_eq!(defs.len(), 2);
        assert!(defs[1]
            .argument(AMQP_HEADERS_DEAD_LETTER_ROUTING_KEY)
            .is_none());
    }

    #[test]
    fn validate_rejects_non_increasing_intervals() {
        let d = TopologyDescriptor::new("orders").retries(
            3,
            RetrySchedule::Intervals(vec![
                Duration::from_secs(10),
                Duration::from_secs(10),
                Duration::from_secs(30),
            ]),
        );
        assert!(matches!(d.validate(), Err(ProvisionError::InvalidDescriptor(_))));

        let d = TopologyDescriptor::new("orders").retries(1, RetrySchedule::Linear(Duration::ZERO));
        assert!(matches!(d.validate(), Err(ProvisionError::InvalidDescriptor(_))));

        let d = TopologyDescriptor::new(" ");
        assert!(matches!(d.validate(), Err(ProvisionError::InvalidDescriptor(_))));
    }

    #[test]
    fn validate_ignores_extra_intervals() {
        let d = TopologyDescriptor::new("orders").retries(
            2,
            RetrySchedule::Intervals(vec![
                Duration::from_secs(10),
                Duration::from_secs(30),
                Duration::from_secs(1),
            ]),
        );
        assert!(d.validate().is_ok());
        assert_eq!(d.queue_definitions().unwrap().len(), 3);
    }

    #[test]
    fn validate_rejects_ttls_beyond_broker_limit() {
        let day = Duration::from_secs(24 * 60 * 60);
        let d = TopologyDescriptor::new("orders")
            .retries(2, RetrySchedule::Intervals(vec![day * 25, day * 30]));

        assert!(matches!(d.validate(), Err(ProvisionError::InvalidDescriptor(_))));
        assert!(matches!(
            d.queue_definitions(),
            Err(ProvisionError::InvalidDescriptor(_))
        ));

        let d = TopologyDescriptor::new("orders")
            .retries(2, RetrySchedule::Intervals(vec![day, MAX_MESSAGE_TTL]));
        assert!(d.validate().is_ok());

        let ttls: Vec<i64> = d
            .queue_definitions()
            .unwrap()
            .iter()
            .filter_map(|def| def.ttl_millis())
            .collect();
        assert_eq!(ttls, vec![86_400_000, i64::from(i32::MAX)]);
    }

    #[test]
    fn transient_durability_applies_to_every_classic_queue() {
        let defs = descriptor()
            .durability(QueueDurability::Transient)
            .queue_definitions()
            .unwrap();
        assert!(defs.iter().all(|def| !def.is_durable()));

        let defs = descriptor()
            .durability(QueueDurability::Transient)
            .queue_type(QueueType::Quorum)
            .queue_definitions()
            .unwrap();
        let (primary, others) = defs.split_last().unwrap();
        assert!(primary.is_durable());
        assert!(others.iter().all(|def| !def.is_durable()));

        assert!(descriptor().queue_definitions().unwrap().iter().all(|def| def.is_durable()));
    }

    #[tokio::test]
    async fn transient_topology_declares_transient_exchange() {
        let mut channel = MockBrokerChannel::new();
        channel
            .expect_declare_exchange()
            .withf(|def| def.name() == "events" && !def.is_durable())
            .times(1)
            .returning(|_| Ok(()));
        channel
            .expect_declare_queue()
            .withf(|def| !def.is_durable())
            .times(5)
            .returning(|_| Ok(()));
        channel.expect_bind_queue().times(1).returning(|_| Ok(()));

        let d = descriptor()
            .declare_exchange(ExchangeKind::Fanout)
            .durability(QueueDurability::Transient);
        assert_eq!(provision(&channel, &d).await, Ok(()));
    }

    #[tokio::test]
    async fn provision_declares_in_order_and_binds() {
        let mut channel = MockBrokerChannel::new();
        let mut seq = Sequence::new();

        for name in [
            "orders-dead-letters",
            "orders-retry-1",
            "orders-retry-2",
            "orders-retry-3",
            "orders",
        ] {
            channel
                .expect_declare_queue()
                .withf(move |def| def.name() == name)
                .times(1)
                .in_sequence(&mut seq)
                .returning(|_| Ok(()));
        }
        channel
            .expect_bind_queue()
            .withf(|b| {
                b.queue_name == "orders" && b.exchange_name == "events" && b.routing_key == "order.created"
            })
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_| Ok(()));
        channel.expect_declare_exchange().never();

        assert_eq!(provision(&channel, &descriptor()).await, Ok(()));
    }

    #[tokio::test]
    async fn provision_skips_binding_on_default_exchange() {
        let mut channel = MockBrokerChannel::new();
        channel.expect_declare_queue().times(1).returning(|_| Ok(()));
        channel.expect_bind_queue().never();

        let d = TopologyDescriptor::new("orders");
        assert_eq!(provision(&channel, &d).await, Ok(()));
    }

    #[tokio::test]
    async fn provision_declares_exchange_when_kind_is_set() {
        let mut channel = MockBrokerChannel::new();
        channel
            .expect_declare_exchange()
            .withf(|def| def.name() == "events" && def.exchange_kind() == &ExchangeKind::Topic)
            .times(1)
            .returning(|_| Ok(()));
        channel.expect_declare_queue().returning(|_| Ok(()));
        channel.expect_bind_queue().returning(|_| Ok(()));

        let d = descriptor().declare_exchange(ExchangeKind::Topic);
        assert_eq!(provision(&channel, &d).await, Ok(()));
    }

    #[tokio::test]
    async fn precondition_failure_surfaces_as_conflict() {
        let mut channel = MockBrokerChannel::new();
        channel
            .expect_declare_queue()
            .withf(|def| def.name() == "orders-dead-letters")
            .returning(|_| Ok(()));
        channel
            .expect_declare_queue()
            .withf(|def| def.name() == "orders-retry-1")
            .returning(|def| Err(AmqpError::PreconditionFailed(def.name().to_owned())));
        channel.expect_bind_queue().never();

        assert_eq!(
            provision(&channel, &descriptor()).await,
            Err(ProvisionError::Conflict {
                queue: "orders-retry-1".to_owned()
            })
        );
    }

    #[tokio::test]
    async fn invalid_descriptor_never_reaches_the_broker() {
        let mut channel = MockBrokerChannel::new();
        channel.expect_declare_queue().never();

        let d = TopologyDescriptor::new("orders")
            .retries(2, RetrySchedule::Intervals(vec![Duration::from_secs(1)]));
        assert!(matches!(
            provision(&channel, &d).await,
            Err(ProvisionError::InvalidDescriptor(_))
        ));
    }
}
