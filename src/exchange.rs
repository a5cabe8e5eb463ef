// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Exchange Declarations
//!
//! Types for describing RabbitMQ exchanges. Exchanges are the routing mechanism
//! that determines how messages are distributed to queues. Definitions are
//! plain values built with a consuming builder and compared structurally, so
//! the topology validator can tell identical re-declarations from conflicting
//! ones.

use lapin::types::{AMQPValue, FieldTable, LongString, ShortString};
use std::{collections::BTreeMap, fmt};

/// Constant for the header field used to specify the delayed exchange type
pub const AMQP_HEADERS_DELAYED_EXCHANGE_TYPE: &str = "x-delayed-type";

/// The nameless default exchange every queue is implicitly bound to.
pub const DEFAULT_EXCHANGE: &str = "";

/// Exchanges every broker pre-declares. They can be bound to but never
/// redeclared.
pub const BUILTIN_EXCHANGES: [&str; 7] = [
    DEFAULT_EXCHANGE,
    "amq.direct",
    "amq.fanout",
    "amq.topic",
    "amq.headers",
    "amq.match",
    "amq.rabbitmq.trace",
];

/// Returns true when `name` is one of the broker's pre-declared exchanges.
pub fn is_builtin_exchange(name: &str) -> bool {
    BUILTIN_EXCHANGES.contains(&name)
}

/// Represents the types of exchanges available in RabbitMQ.
///
/// - Direct: exact match of routing keys
/// - Fanout: every bound queue regardless of routing key
/// - Topic: wildcard pattern matching of routing keys
/// - Headers: header values instead of routing keys
/// - XMessageDelayed: delayed delivery (plugin required)
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum ExchangeKind {
    #[default]
    Direct,
    Fanout,
    Topic,
    Headers,
    XMessageDelayed,
}

impl From<&ExchangeKind> for lapin::ExchangeKind {
    fn from(kind: &ExchangeKind) -> Self {
        match kind {
            ExchangeKind::Direct => lapin::ExchangeKind::Direct,
            ExchangeKind::Fanout => lapin::ExchangeKind::Fanout,
            ExchangeKind::Headers => lapin::ExchangeKind::Headers,
            ExchangeKind::Topic => lapin::ExchangeKind::Topic,
            ExchangeKind::XMessageDelayed => {
                lapin::ExchangeKind::Custom("x-delayed-message".to_owned())
            }
        }
    }
}

/// Definition of a RabbitMQ exchange with its configuration parameters.
#[derive(Debug, Clone, PartialEq)]
pub struct ExchangeDefinition {
    pub(crate) name: String,
    pub(crate) kind: ExchangeKind,
    pub(crate) durable: bool,
    pub(crate) auto_delete: bool,
    pub(crate) internal: bool,
    pub(crate) params: BTreeMap<ShortString, AMQPValue>,
}

impl ExchangeDefinition {
    /// Creates a new, non-durable direct exchange definition.
    pub fn new(name: &str) -> ExchangeDefinition {
        ExchangeDefinition {
            name: name.to_owned(),
            kind: ExchangeKind::Direct,
            durable: false,
            auto_delete: false,
            internal: false,
            params: BTreeMap::default(),
        }
    }

    pub fn kind(mut self, kind: ExchangeKind) -> Self {
        self.kind = kind;
        self
    }

    pub fn direct(self) -> Self {
        self.kind(ExchangeKind::Direct)
    }

    pub fn fanout(self) -> Self {
        self.kind(ExchangeKind::Fanout)
    }

    pub fn topic(self) -> Self {
        self.kind(ExchangeKind::Topic)
    }

    pub fn headers(self) -> Self {
        self.kind(ExchangeKind::Headers)
    }

    /// Creates a delayed direct exchange.
    ///
    /// This requires the x-delayed-message plugin to be installed on the RabbitMQ server.
    pub fn direct_delayed(self) -> Self {
        self.delayed("direct")
    }

    /// Creates a delayed fanout exchange.
    ///
    /// This requires the x-delayed-message plugin to be installed on the RabbitMQ server.
    pub fn fanout_delayed(self) -> Self {
        self.delayed("fanout")
    }

    fn delayed(mut self, underlying: &str) -> Self {
        self.kind = ExchangeKind::XMessageDelayed;
        self.params.insert(
            ShortString::from(AMQP_HEADERS_DELAYED_EXCHANGE_TYPE),
            AMQPValue::LongString(LongString::from(underlying)),
        );
        self
    }

    /// Replaces the exchange arguments.
    pub fn params(mut self, params: BTreeMap<ShortString, AMQPValue>) -> Self {
        self.params = params;
        self
    }

    /// Adds a single argument to the exchange.
    pub fn param(mut self, key: &str, value: AMQPValue) -> Self {
        self.params.insert(ShortString::from(key), value);
        self
    }

    /// Deletes the exchange once the last binding is removed.
    pub fn auto_delete(mut self) -> Self {
        self.auto_delete = true;
        self
    }

    /// Makes the exchange durable, persisting across broker restarts.
    pub fn durable(mut self) -> Self {
        self.durable = true;
        self
    }

    /// Makes the exchange internal, preventing direct publishing.
    pub fn internal(mut self) -> Self {
        self.internal = true;
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn exchange_kind(&self) -> &ExchangeKind {
        &self.kind
    }

    pub fn is_durable(&self) -> bool {
        self.durable
    }

    pub fn is_auto_delete(&self) -> bool {
        self.auto_delete
    }

    pub(crate) fn arguments(&self) -> FieldTable {
        FieldTable::from(self.params.clone())
    }
}

impl fmt::Display for ExchangeDefinition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "exchange `{}` ({:?}, durable: {}, auto_delete: {}, internal: {}, args: {:?})",
            self.name, self.kind, self.durable, self.auto_delete, self.internal, self.params
        )
    }
}
