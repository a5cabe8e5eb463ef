// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Queue Declarations and Bindings
//!
//! Types for describing RabbitMQ queues and the bindings that attach them to
//! exchanges. Queue arguments such as message TTL, length limits and
//! dead-lettering are written into the queue's argument table, which is
//! passed verbatim to the broker on declaration.

use lapin::types::{AMQPValue, FieldTable, LongInt, LongString, ShortString};
use std::{collections::BTreeMap, fmt};

/// Constant for the header field used to specify a dead letter exchange
pub const AMQP_HEADERS_DEAD_LETTER_EXCHANGE: &str = "x-dead-letter-exchange";
/// Constant for the header field used to specify a dead letter routing key
pub const AMQP_HEADERS_DEAD_LETTER_ROUTING_KEY: &str = "x-dead-letter-routing-key";
/// Constant for the header field used to specify message TTL
pub const AMQP_HEADERS_MESSAGE_TTL: &str = "x-message-ttl";
/// Constant for the header field used to specify maximum queue length
pub const AMQP_HEADERS_MAX_LENGTH: &str = "x-max-length";
/// Constant for the header field used to specify maximum queue size in bytes
pub const AMQP_HEADERS_MAX_LENGTH_BYTES: &str = "x-max-length-bytes";

/// Pseudo-queue used for direct-reply RPC. It exists implicitly on every
/// broker and must never be declared or bound.
pub const DIRECT_REPLY_TO: &str = "amq.rabbitmq.reply-to";

/// Definition of a RabbitMQ queue.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct QueueDefinition {
    pub(crate) name: String,
    pub(crate) durable: bool,
    pub(crate) auto_delete: bool,
    pub(crate) exclusive: bool,
    pub(crate) params: BTreeMap<ShortString, AMQPValue>,
}

impl QueueDefinition {
    /// Creates a new, non-durable queue definition.
    pub fn new(name: &str) -> QueueDefinition {
        QueueDefinition {
            name: name.to_owned(),
            ..QueueDefinition::default()
        }
    }

    pub fn durable(mut self) -> Self {
        self.durable = true;
        self
    }

    pub fn auto_delete(mut self) -> Self {
        self.auto_delete = true;
        self
    }

    pub fn exclusive(mut self) -> Self {
        self.exclusive = true;
        self
    }

    /// Message TTL in milliseconds.
    pub fn ttl(self, ttl: i32) -> Self {
        self.param(AMQP_HEADERS_MESSAGE_TTL, AMQPValue::LongInt(LongInt::from(ttl)))
    }

    pub fn max_length(self, max: i32) -> Self {
        self.param(AMQP_HEADERS_MAX_LENGTH, AMQPValue::LongInt(LongInt::from(max)))
    }

    pub fn max_length_bytes(self, max_bytes: i32) -> Self {
        self.param(
            AMQP_HEADERS_MAX_LENGTH_BYTES,
            AMQPValue::LongInt(LongInt::from(max_bytes)),
        )
    }

    /// Dead-letters rejected or expired messages to `exchange` with `routing_key`.
    pub fn dead_letter(self, exchange: &str, routing_key: &str) -> Self {
        self.param(
            AMQP_HEADERS_DEAD_LETTER_EXCHANGE,
            AMQPValue::LongString(LongString::from(exchange)),
        )
        .param(
            AMQP_HEADERS_DEAD_LETTER_ROUTING_KEY,
            AMQPValue::LongString(LongString::from(routing_key)),
        )
    }

    pub fn param(mut self, key: &str, value: AMQPValue) -> Self {
        self.params.insert(ShortString::from(key), value);
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn is_durable(&self) -> bool {
        self.durable
    }

    pub(crate) fn arguments(&self) -> FieldTable {
        FieldTable::from(self.params.clone())
    }
}

impl fmt::Display for QueueDefinition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "queue `{}` (durable: {}, auto_delete: {}, exclusive: {}, args: {:?})",
            self.name, self.durable, self.auto_delete, self.exclusive, self.params
        )
    }
}

/// Binds a queue to an exchange under a routing key.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct QueueBinding {
    pub(crate) queue_name: String,
    pub(crate) exchange_name: String,
    pub(crate) routing_key: String,
    pub(crate) params: BTreeMap<ShortString, AMQPValue>,
}

impl QueueBinding {
    pub fn new(queue: &str) -> QueueBinding {
        QueueBinding {
            queue_name: queue.to_owned(),
            ..QueueBinding::default()
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

    pub fn param(mut self, key: &str, value: AMQPValue) -> Self {
        self.params.insert(ShortString::from(key), value);
        self
    }

    pub fn queue_name(&self) -> &str {
        &self.queue_name
    }

    pub fn exchange_name(&self) -> &str {
        &self.exchange_name
    }

    pub(crate) fn arguments(&self) -> FieldTable {
        FieldTable::from(self.params.clone())
    }
}

impl fmt::Display for QueueBinding {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "binding `{}` -> `{}` (key `{}`)",
            self.exchange_name, self.queue_name, self.routing_key
        )
    }
}
