// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

pub mod acker;
pub mod channel;
pub mod codec;
pub mod config;
pub mod connection;
pub mod consumer;
pub mod dispatcher;
pub mod encoding;
pub mod errors;
pub mod exchange;
pub mod message;
pub mod otel;
pub mod pool;
pub mod publisher;
pub mod queue;
pub mod topology;
