// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! Broker reachability check.

use crate::{
    channel::{close_channel, close_connection, create_channel, new_amqp_connection},
    config::RabbitMQConfigs,
};
use tracing::warn;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HealthStatus {
    Healthy,
    Degraded(String),
}

impl HealthStatus {
    pub fn is_healthy(&self) -> bool {
        matches!(self, HealthStatus::Healthy)
    }
}

/// Opens a connection and a channel to the broker, then closes both.
pub async fn check_health(cfg: &RabbitMQConfigs) -> HealthStatus {
    let conn = match new_amqp_connection(cfg).await {
        Ok(conn) => conn,
        Err(err) => {
            warn!(host = cfg.host.as_str(), port = cfg.port, "broker unreachable");
            return HealthStatus::Degraded(err.to_string());
        }
    };

    let status = match create_channel(&conn).await {
        Ok(channel) => {
            close_channel(&channel).await;
            HealthStatus::Healthy
        }
        Err(err) => HealthStatus::Degraded(err.to_string()),
    };

    close_connection(&conn).await;
    status
}
