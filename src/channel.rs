// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # AMQP Channel Management
//!
//! This module defines the broker primitives the bridge is built on: an
//! [`AmqpConnection`] that hands out channels and reports shutdowns, and an
//! [`AmqpChannel`] exposing declare/publish/consume/ack operations. The
//! lapin-backed implementations live here too; everything above this module
//! only talks to the traits, which keeps pooling, dispatching and topology
//! installation testable without a running broker.

use crate::errors::AmqpError;
use async_trait::async_trait;
use futures_util::{stream::BoxStream, StreamExt};
use lapin::{
    message::Delivery,
    options::{
        BasicAckOptions, BasicCancelOptions, BasicConsumeOptions, BasicPublishOptions,
        BasicQosOptions, BasicRejectOptions, ExchangeDeclareOptions, QueueBindOptions,
        QueueDeclareOptions,
    },
    types::FieldTable,
    BasicProperties, Channel, Connection, ExchangeKind,
};
use std::sync::{Arc, Mutex};
use tracing::{debug, error, info};

/// Reply code sent when the application closes a channel or connection.
pub const AMQP_REPLY_SUCCESS: u16 = 200;

/// A single delivery as handed out by the broker.
#[derive(Debug, Clone, Default)]
pub struct BrokerDelivery {
    pub delivery_tag: u64,
    pub exchange: String,
    pub routing_key: String,
    pub redelivered: bool,
    pub properties: BasicProperties,
    pub data: Vec<u8>,
}

impl From<Delivery> for BrokerDelivery {
    fn from(delivery: Delivery) -> Self {
        BrokerDelivery {
            delivery_tag: delivery.delivery_tag,
            exchange: delivery.exchange.to_string(),
            routing_key: delivery.routing_key.to_string(),
            redelivered: delivery.redelivered,
            properties: delivery.properties,
            data: delivery.data,
        }
    }
}

/// Stream of deliveries for one consumer. It ends when the broker cancels
/// the consumer or the channel goes away.
pub type DeliveryStream = BoxStream<'static, Result<BrokerDelivery, AmqpError>>;

/// Who initiated a connection shutdown.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShutdownInitiator {
    Application,
    Broker,
}

/// Notification delivered to shutdown listeners.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShutdownSignal {
    pub initiator: ShutdownInitiator,
    pub reason: String,
}

pub type ShutdownListener = Box<dyn Fn(&ShutdownSignal) + Send + Sync>;

/// Broker operations available on one channel.
///
/// A channel is not meant for concurrent use by several borrowers; the pool
/// guarantees a single borrower at a time.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait AmqpChannel: Send + Sync {
    async fn exchange_declare(
        &self,
        name: &str,
        kind: ExchangeKind,
        options: ExchangeDeclareOptions,
        arguments: FieldTable,
    ) -> Result<(), AmqpError>;

    async fn queue_declare(
        &self,
        name: &str,
        options: QueueDeclareOptions,
        arguments: FieldTable,
    ) -> Result<(), AmqpError>;

    async fn queue_bind(
        &self,
        queue: &str,
        exchange: &str,
        routing_key: &str,
        arguments: FieldTable,
    ) -> Result<(), AmqpError>;

    async fn basic_publish(
        &self,
        exchange: &str,
        routing_key: &str,
        payload: &[u8],
        properties: BasicProperties,
    ) -> Result<(), AmqpError>;

    async fn basic_qos(&self, prefetch_count: u16) -> Result<(), AmqpError>;

    async fn basic_consume(
        &self,
        queue: &str,
        consumer_tag: &str,
        no_ack: bool,
    ) -> Result<DeliveryStream, AmqpError>;

    async fn basic_cancel(&self, consumer_tag: &str) -> Result<(), AmqpError>;

    async fn basic_ack(&self, delivery_tag: u64) -> Result<(), AmqpError>;

    async fn basic_reject(&self, delivery_tag: u64, requeue: bool) -> Result<(), AmqpError>;

    fn is_open(&self) -> bool;

    async fn close(&self) -> Result<(), AmqpError>;
}

/// A broker connection that channels are multiplexed over.
#[async_trait]
pub trait AmqpConnection: Send + Sync {
    async fn create_channel(&self) -> Result<Arc<dyn AmqpChannel>, AmqpError>;

    /// Highest channel count negotiated with the broker; 0 means unlimited.
    fn channel_max(&self) -> u16;

    fn is_open(&self) -> bool;

    /// Registers a listener invoked once when the connection shuts down.
    fn on_shutdown(&self, listener: ShutdownListener);

    async fn close(&self) -> Result<(), AmqpError>;
}

/// [`AmqpChannel`] backed by a lapin channel.
pub struct LapinChannel {
    inner: Channel,
}

impl LapinChannel {
    pub fn new(inner: Channel) -> Self {
        LapinChannel { inner }
    }
}

#[async_trait]
impl AmqpChannel for LapinChannel {
    async fn exchange_declare(
        &self,
        name: &str,
        kind: ExchangeKind,
        options: ExchangeDeclareOptions,
        arguments: FieldTable,
    ) -> Result<(), AmqpError> {
        self.inner
            .exchange_declare(name, kind, options, arguments)
            .await
            .map_err(|err| {
                error!(error = err.to_string(), name, "error to declare the exchange");
                AmqpError::DeclareExchangeError(name.to_owned())
            })
    }

    async fn queue_declare(
        &self,
        name: &str,
        options: QueueDeclareOptions,
        arguments: FieldTable,
    ) -> Result<(), AmqpError> {
        match self.inner.queue_declare(name, options, arguments).await {
            Err(err) => {
                error!(error = err.to_string(), name, "error to declare the queue");
                Err(AmqpError::DeclareQueueError(name.to_owned()))
            }
            _ => Ok(()),
        }
    }

    async fn queue_bind(
        &self,
        queue: &str,
        exchange: &str,
        routing_key: &str,
        arguments: FieldTable,
    ) -> Result<(), AmqpError> {
        self.inner
            .queue_bind(
                queue,
                exchange,
                routing_key,
                QueueBindOptions { nowait: false },
                arguments,
            )
            .await
            .map_err(|err| {
                error!(error = err.to_string(), "error to bind queue to exchange");
                AmqpError::BindingExchangeToQueueError(exchange.to_owned(), queue.to_owned())
            })
    }

    async fn basic_publish(
        &self,
        exchange: &str,
        routing_key: &str,
        payload: &[u8],
        properties: BasicProperties,
    ) -> Result<(), AmqpError> {
        match self
            .inner
            .basic_publish(
                exchange,
                routing_key,
                BasicPublishOptions {
                    immediate: false,
                    mandatory: false,
                },
                payload,
                properties,
            )
            .await
        {
            Err(err) => {
                error!(error = err.to_string(), "error publishing message");
                Err(AmqpError::PublishingError(err.to_string()))
            }
            _ => Ok(()),
        }
    }

    async fn basic_qos(&self, prefetch_count: u16) -> Result<(), AmqpError> {
        self.inner
            .basic_qos(prefetch_count, BasicQosOptions { global: false })
            .await
            .map_err(|err| {
                error!(error = err.to_string(), "error to configure qos");
                AmqpError::QoSDeclarationError(err.to_string())
            })
    }

    async fn basic_consume(
        &self,
        queue: &str,
        consumer_tag: &str,
        no_ack: bool,
    ) -> Result<DeliveryStream, AmqpError> {
        let consumer = self
            .inner
            .basic_consume(
                queue,
                consumer_tag,
                BasicConsumeOptions {
                    no_local: false,
                    no_ack,
                    exclusive: false,
                    nowait: false,
                },
                FieldTable::default(),
            )
            .await
            .map_err(|err| {
                error!(error = err.to_string(), queue, "error to create the consumer");
                AmqpError::ConsumerDeclarationError(queue.to_owned())
            })?;

        Ok(consumer
            .map(|result| {
                result
                    .map(BrokerDelivery::from)
                    .map_err(|err| AmqpError::ConsumerError(err.to_string()))
            })
            .boxed())
    }

    async fn basic_cancel(&self, consumer_tag: &str) -> Result<(), AmqpError> {
        self.inner
            .basic_cancel(consumer_tag, BasicCancelOptions { nowait: false })
            .await
            .map_err(|err| {
                error!(error = err.to_string(), consumer_tag, "error to cancel consumer");
                AmqpError::ConsumerCancelError(consumer_tag.to_owned())
            })
    }

    async fn basic_ack(&self, delivery_tag: u64) -> Result<(), AmqpError> {
        self.inner
            .basic_ack(delivery_tag, BasicAckOptions { multiple: false })
            .await
            .map_err(|err| {
                error!(error = err.to_string(), "error whiling ack msg");
                AmqpError::AckMessageError
            })
    }

    async fn basic_reject(&self, delivery_tag: u64, requeue: bool) -> Result<(), AmqpError> {
        self.inner
            .basic_reject(delivery_tag, BasicRejectOptions { requeue })
            .await
            .map_err(|err| {
                error!(error = err.to_string(), "error whiling reject msg");
                AmqpError::RejectMessageError
            })
    }

    fn is_open(&self) -> bool {
        self.inner.status().connected()
    }

    async fn close(&self) -> Result<(), AmqpError> {
        if !self.inner.status().connected() {
            return Ok(());
        }

        self.inner
            .close(AMQP_REPLY_SUCCESS, "channel closed by application")
            .await
            .map_err(|err| {
                error!(error = err.to_string(), "error to close the channel");
                AmqpError::ChannelError(err.to_string())
            })
    }
}

/// [`AmqpConnection`] backed by a lapin connection.
///
/// lapin keeps a single error handler per connection, so listeners are fanned
/// out from here. Broker or network failures reach listeners through that
/// handler; [`AmqpConnection::close`] notifies them as application-initiated.
pub struct LapinConnection {
    inner: Connection,
    listeners: Arc<Mutex<Vec<ShutdownListener>>>,
}

impl LapinConnection {
    pub fn new(inner: Connection) -> Self {
        let listeners: Arc<Mutex<Vec<ShutdownListener>>> = Arc::default();

        let on_error = listeners.clone();
        inner.on_error(move |err| {
            notify(
                &on_error,
                &ShutdownSignal {
                    initiator: ShutdownInitiator::Broker,
                    reason: err.to_string(),
                },
            );
        });

        LapinConnection { inner, listeners }
    }
}

fn notify(listeners: &Mutex<Vec<ShutdownListener>>, signal: &ShutdownSignal) {
    match listeners.lock() {
        Ok(listeners) => listeners.iter().for_each(|listener| listener(signal)),
        Err(_) => error!("shutdown listeners lock poisoned"),
    }
}

#[async_trait]
impl AmqpConnection for LapinConnection {
    async fn create_channel(&self) -> Result<Arc<dyn AmqpChannel>, AmqpError> {
        debug!("creating amqp channel...");
        match self.inner.create_channel().await {
            Ok(c) => {
                debug!("channel created");
                Ok(Arc::new(LapinChannel::new(c)))
            }
            Err(err) => {
                error!(error = err.to_string(), "error to create the channel");
                Err(AmqpError::ChannelError(err.to_string()))
            }
        }
    }

    fn channel_max(&self) -> u16 {
        self.inner.configuration().channel_max()
    }

    fn is_open(&self) -> bool {
        self.inner.status().connected()
    }

    fn on_shutdown(&self, listener: ShutdownListener) {
        match self.listeners.lock() {
            Ok(mut listeners) => listeners.push(listener),
            Err(_) => error!("shutdown listeners lock poisoned"),
        }
    }

    async fn close(&self) -> Result<(), AmqpError> {
        info!("closing amqp connection");
        let result = self
            .inner
            .close(AMQP_REPLY_SUCCESS, "connection closed by application")
            .await
            .map_err(|err| {
                error!(error = err.to_string(), "error to close the connection");
                AmqpError::ConnectionError(err.to_string())
            });

        notify(
            &self.listeners,
            &ShutdownSignal {
                initiator: ShutdownInitiator::Application,
                reason: "connection closed by application".to_owned(),
            },
        );

        result
    }
}
