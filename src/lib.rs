// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

mod otel;

pub mod channel;
pub mod config;
pub mod consumer;
pub mod delivery;
pub mod dispatcher;
pub mod envelope;
pub mod errors;
pub mod exchange;
pub mod health;
pub mod messaging;
pub mod policy;
pub mod publisher;
pub mod queue;
pub mod topology;
