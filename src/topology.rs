// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # RabbitMQ Topology Management
//!
//! This module provides functionality for defining, validating and installing
//! RabbitMQ topology components: exchanges, queues and the bindings between
//! them.
//!
//! The main components are:
//! - `TopologyBuilder`: collects declarations from any number of sources
//! - `Topology`: the validated, immutable result, installable through a channel
//!
//! Validation is exhaustive rather than fail-fast: every violation is
//! collected and reported in a single [`TopologyError`].

use crate::{
    channel::AmqpChannel,
    errors::{AmqpError, TopologyError},
    exchange::{is_builtin_exchange, ExchangeDefinition},
    queue::{QueueBinding, QueueDefinition, DIRECT_REPLY_TO},
};
use lapin::options::{ExchangeDeclareOptions, QueueDeclareOptions};
use std::collections::{BTreeMap, HashSet};
use tracing::debug;

/// Collects exchange, queue and binding declarations before validation.
///
/// Declarations form a set per category: adding a declaration identical to
/// one already present is a no-op, while two different declarations under
/// the same name are reported by [`TopologyBuilder::build`].
#[derive(Debug, Clone, Default)]
pub struct TopologyBuilder {
    exchanges: Vec<ExchangeDefinition>,
    queues: Vec<QueueDefinition>,
    bindings: Vec<QueueBinding>,
}

impl TopologyBuilder {
    pub fn new() -> Self {
        TopologyBuilder::default()
    }

    /// Adds an exchange definition to the topology.
    pub fn exchange(mut self, def: ExchangeDefinition) -> Self {
        insert_unique(&mut self.exchanges, def);
        self
    }

    /// Adds a queue definition to the topology.
    pub fn queue(mut self, def: QueueDefinition) -> Self {
        insert_unique(&mut self.queues, def);
        self
    }

    /// Adds a queue-to-exchange binding to the topology.
    pub fn queue_binding(mut self, binding: QueueBinding) -> Self {
        insert_unique(&mut self.bindings, binding);
        self
    }

    /// Unions every declaration of `other` into this builder.
    pub fn merge(mut self, other: &Topology) -> Self {
        for def in &other.exchanges {
            insert_unique(&mut self.exchanges, def.clone());
        }
        for def in &other.queues {
            insert_unique(&mut self.queues, def.clone());
        }
        for binding in &other.bindings {
            insert_unique(&mut self.bindings, binding.clone());
        }
        self
    }

    /// Validates the collected declarations.
    pub fn build(self) -> Result<Topology, TopologyError> {
        let mut violations = vec![];

        for (name, defs) in group_by_name(&self.exchanges, |def| &def.name) {
            if defs.len() > 1 {
                violations.push(conflict("exchange", name, &defs));
            }
            if is_builtin_exchange(name) {
                violations.push(format!(
                    "exchange `{}` is pre-declared by the broker and cannot be redeclared",
                    name
                ));
            }
        }

        for (name, defs) in group_by_name(&self.queues, |def| &def.name) {
            if defs.len() > 1 {
                violations.push(conflict("queue", name, &defs));
            }
            if name == DIRECT_REPLY_TO {
                violations.push(format!(
                    "queue `{}` is the direct reply-to pseudo-queue and cannot be declared",
                    name
                ));
            }
        }

        let exchange_names: HashSet<&str> =
            self.exchanges.iter().map(|def| def.name.as_str()).collect();
        let queue_names: HashSet<&str> = self.queues.iter().map(|def| def.name.as_str()).collect();

        for binding in &self.bindings {
            if binding.queue_name == DIRECT_REPLY_TO {
                violations.push(format!(
                    "{} targets the direct reply-to pseudo-queue, which cannot be bound",
                    binding
                ));
            } else if !queue_names.contains(binding.queue_name.as_str()) {
                violations.push(format!(
                    "{} references undeclared queue `{}`",
                    binding, binding.queue_name
                ));
            }

            if !exchange_names.contains(binding.exchange_name.as_str())
                && !is_builtin_exchange(&binding.exchange_name)
            {
                violations.push(format!(
                    "{} references undeclared exchange `{}`",
                    binding, binding.exchange_name
                ));
            }
        }

        if !violations.is_empty() {
            return Err(TopologyError::new(violations));
        }

        Ok(Topology {
            exchanges: self.exchanges,
            queues: self.queues,
            bindings: self.bindings,
        })
    }
}

fn insert_unique<T: PartialEq>(items: &mut Vec<T>, item: T) {
    if !items.contains(&item) {
        items.push(item);
    }
}

fn group_by_name<'a, T>(
    items: &'a [T],
    name: impl Fn(&'a T) -> &'a String,
) -> BTreeMap<&'a str, Vec<&'a T>> {
    let mut groups: BTreeMap<&str, Vec<&T>> = BTreeMap::new();
    for item in items {
        groups.entry(name(item).as_str()).or_default().push(item);
    }
    groups
}

fn conflict<T: std::fmt::Display>(category: &str, name: &str, defs: &[&T]) -> String {
    let listed: Vec<String> = defs.iter().map(|def| def.to_string()).collect();
    format!(
        "{} `{}` is declared {} times with conflicting settings: {}",
        category,
        name,
        defs.len(),
        listed.join("; ")
    )
}

/// A validated set of exchanges, queues and bindings.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Topology {
    exchanges: Vec<ExchangeDefinition>,
    queues: Vec<QueueDefinition>,
    bindings: Vec<QueueBinding>,
}

impl Topology {
    pub fn builder() -> TopologyBuilder {
        TopologyBuilder::new()
    }

    pub fn exchanges(&self) -> &[ExchangeDefinition] {
        &self.exchanges
    }

    pub fn queues(&self) -> &[QueueDefinition] {
        &self.queues
    }

    pub fn bindings(&self) -> &[QueueBinding] {
        &self.bindings
    }

    /// The smallest sub-topology needed to start consuming `queue`: its
    /// declaration, every binding that targets it and the declared exchanges
    /// those bindings reference.
    pub fn for_queue(&self, queue: &str) -> Topology {
        let bindings: Vec<QueueBinding> = self
            .bindings
            .iter()
            .filter(|binding| binding.queue_name == queue)
            .cloned()
            .collect();

        let exchanges = self
            .exchanges
            .iter()
            .filter(|def| bindings.iter().any(|b| b.exchange_name == def.name))
            .cloned()
            .collect();

        let queues = self
            .queues
            .iter()
            .filter(|def| def.name == queue)
            .cloned()
            .collect();

        Topology {
            exchanges,
            queues,
            bindings,
        }
    }

    /// Installs the topology to the RabbitMQ server.
    ///
    /// Exchanges are declared first, then queues, then bindings, each in
    /// declaration order. The first broker failure aborts the installation.
    pub async fn install(&self, channel: &dyn AmqpChannel) -> Result<(), AmqpError> {
        self.install_exchanges(channel).await?;
        self.install_queues(channel).await?;
        self.binding_queues(channel).await
    }

    async fn install_exchanges(&self, channel: &dyn AmqpChannel) -> Result<(), AmqpError> {
        for exch in &self.exchanges {
            debug!("creating exchange: {}", exch.name);

            channel
                .exchange_declare(
                    &exch.name,
                    (&exch.kind).into(),
                    ExchangeDeclareOptions {
                        passive: false,
                        durable: exch.durable,
                        auto_delete: exch.auto_delete,
                        internal: exch.internal,
                        nowait: false,
                    },
                    exch.arguments(),
                )
                .await?;

            debug!("exchange: {} was created", exch.name);
        }

        Ok(())
    }

    async fn install_queues(&self, channel: &dyn AmqpChannel) -> Result<(), AmqpError> {
        for def in &self.queues {
            debug!("creating queue: {}", def.name);

            channel
                .queue_declare(
                    &def.name,
                    QueueDeclareOptions {
                        passive: false,
                        durable: def.durable,
                        exclusive: def.exclusive,
                        auto_delete: def.auto_delete,
                        nowait: false,
                    },
                    def.arguments(),
                )
                .await?;

            debug!("queue: {} was created", def.name);
        }

        Ok(())
    }

    async fn binding_queues(&self, channel: &dyn AmqpChannel) -> Result<(), AmqpError> {
        for binding in &self.bindings {
            debug!(
                "binding queue: {} to the exchange: {} with the key: {}",
                binding.queue_name, binding.exchange_name, binding.routing_key
            );

            channel
                .queue_bind(
                    &binding.queue_name,
                    &binding.exchange_name,
                    &binding.routing_key,
                    binding.arguments(),
                )
                .await?;
        }

        debug!("queues were bound");

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::MockAmqpChannel;
    use mockall::Sequence;

    fn orders_topology() -> TopologyBuilder {
        Topology::builder()
            .exchange(ExchangeDefinition::new("orders").topic().durable())
            .exchange(ExchangeDefinition::new("audit").fanout())
            .queue(QueueDefinition::new("orders.created").durable())
            .queue(QueueDefinition::new("audit.all"))
            .queue_binding(
                QueueBinding::new("orders.created")
                    .exchange("orders")
                    .routing_key("created.*"),
            )
            .queue_binding(QueueBinding::new("audit.all").exchange("audit"))
            .queue_binding(QueueBinding::new("orders.created").exchange("amq.topic"))
    }

    #[test]
    fn valid_topology_builds() {
        let topology = orders_topology().build().unwrap();

        assert_eq!(topology.exchanges().len(), 2);
        assert_eq!(topology.queues().len(), 2);
        assert_eq!(topology.bindings().len(), 3);
    }

    #[test]
    fn conflicting_exchanges_mention_both_declarations() {
        let err = Topology::builder()
            .exchange(ExchangeDefinition::new("orders").topic())
            .exchange(ExchangeDefinition::new("orders").fanout())
            .build()
            .unwrap_err();

        assert_eq!(err.violations().len(), 1);
        let msg = err.to_string();
        assert!(msg.contains("Topic"));
        assert!(msg.contains("Fanout"));
    }

    #[test]
    fn conflicting_queues_are_rejected() {
        let err = Topology::builder()
            .queue(QueueDefinition::new("jobs"))
            .queue(QueueDefinition::new("jobs").durable())
            .build()
            .unwrap_err();

        assert!(err.to_string().contains("queue `jobs` is declared 2 times"));
    }

    #[test]
    fn identical_declarations_collapse() {
        let topology = Topology::builder()
            .queue(QueueDefinition::new("jobs"))
            .queue(QueueDefinition::new("jobs"))
            .build()
            .unwrap();

        assert_eq!(topology.queues().len(), 1);
    }

    #[test]
    fn builtin_exchange_cannot_be_redeclared() {
        let err = Topology::builder()
            .exchange(ExchangeDefinition::new("amq.direct"))
            .build()
            .unwrap_err();

        assert!(err.to_string().contains("pre-declared"));
    }

    #[test]
    fn binding_to_unknown_exchange_or_queue_fails() {
        let err = Topology::builder()
            .queue(QueueDefinition::new("jobs"))
            .queue_binding(QueueBinding::new("jobs").exchange("missing"))
            .queue_binding(QueueBinding::new("ghost").exchange("amq.fanout"))
            .build()
            .unwrap_err();

        assert_eq!(err.violations().len(), 2);
        assert!(err.violations()[0].contains("undeclared exchange `missing`"));
        assert!(err.violations()[1].contains("undeclared queue `ghost`"));
    }

    #[test]
    fn direct_reply_queue_is_reserved() {
        let err = Topology::builder()
            .queue(QueueDefinition::new(DIRECT_REPLY_TO))
            .queue_binding(QueueBinding::new(DIRECT_REPLY_TO).exchange("amq.direct"))
            .build()
            .unwrap_err();

        assert_eq!(err.violations().len(), 2);
    }

    #[test]
    fn all_violations_are_reported_together() {
        let err = Topology::builder()
            .exchange(ExchangeDefinition::new("amq.topic"))
            .queue(QueueDefinition::new("a"))
            .queue(QueueDefinition::new("a").exclusive())
            .queue_binding(QueueBinding::new("a").exchange("nowhere"))
            .build()
            .unwrap_err();

        assert_eq!(err.violations().len(), 3);
    }

    #[test]
    fn merge_unions_and_revalidates() {
        let base = orders_topology().build().unwrap();

        let merged = Topology::builder()
            .queue(QueueDefinition::new("orders.created").durable())
            .queue(QueueDefinition::new("billing"))
            .queue_binding(QueueBinding::new("billing").exchange("orders"))
            .merge(&base)
            .build()
            .unwrap();
        assert_eq!(merged.queues().len(), 3);

        let conflicting = Topology::builder()
            .queue(QueueDefinition::new("orders.created"))
            .merge(&base)
            .build();
        assert!(conflicting.is_err());
    }

    #[test]
    fn for_queue_selects_minimal_subset() {
        let topology = orders_topology().build().unwrap();
        let subset = topology.for_queue("orders.created");

        assert_eq!(subset.queues().len(), 1);
        assert_eq!(subset.bindings().len(), 2);
        assert_eq!(subset.exchanges().len(), 1);
        assert_eq!(subset.exchanges()[0].name(), "orders");
    }

    #[tokio::test]
    async fn install_declares_in_order() {
        let topology = orders_topology().build().unwrap();
        let mut channel = MockAmqpChannel::new();
        let mut seq = Sequence::new();

        channel
            .expect_exchange_declare()
            .times(2)
            .in_sequence(&mut seq)
            .returning(|_, _, _, _| Ok(()));
        channel
            .expect_queue_declare()
            .times(2)
            .in_sequence(&mut seq)
            .returning(|_, _, _| Ok(()));
        channel
            .expect_queue_bind()
            .times(3)
            .in_sequence(&mut seq)
            .returning(|_, _, _, _| Ok(()));

        topology.install(&channel).await.unwrap();
    }

    #[tokio::test]
    async fn install_stops_at_first_failure() {
        let topology = orders_topology().build().unwrap();
        let mut channel = MockAmqpChannel::new();

        channel
            .expect_exchange_declare()
            .times(1)
            .returning(|name, _, _, _| Err(AmqpError::DeclareExchangeError(name.to_string())));
        channel.expect_queue_declare().never();
        channel.expect_queue_bind().never();

        let err = topology.install(&channel).await.unwrap_err();
        assert_eq!(err, AmqpError::DeclareExchangeError("orders".to_owned()));
    }
}
