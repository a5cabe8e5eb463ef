// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # RabbitMQ Message Publisher
//!
//! Publishes [`Outgoing`] messages through the channel pool. Typed messages
//! are encoded by a [`Negotiator`] first; the trace context of the caller is
//! injected into the headers and every message gets a fresh message id.

use crate::{
    channel::AmqpChannel,
    codec::Negotiator,
    errors::AmqpError,
    message::Outgoing,
    otel,
    pool::ChannelPool,
};
use futures_util::FutureExt;
use lapin::{types::ShortString, BasicProperties};
use opentelemetry::Context;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tracing::{debug, error};
use uuid::Uuid;

pub struct RabbitMQPublisher {
    pool: ChannelPool,
}

/// A message ready for the wire.
struct Publication {
    exchange: String,
    routing_key: String,
    properties: BasicProperties,
    payload: Vec<u8>,
}

impl RabbitMQPublisher {
    pub fn new(pool: ChannelPool) -> Arc<RabbitMQPublisher> {
        Arc::new(RabbitMQPublisher { pool })
    }

    /// Encodes `message` and publishes it.
    pub async fn publish<T: 'static>(
        &self,
        ctx: &Context,
        negotiator: &Negotiator<T>,
        message: Outgoing<T>,
    ) -> Result<(), AmqpError> {
        let encoded = negotiator.encode(message)?;
        self.publish_raw(ctx, encoded).await
    }

    /// Publishes an already encoded message.
    pub async fn publish_raw(
        &self,
        ctx: &Context,
        message: Outgoing<Vec<u8>>,
    ) -> Result<(), AmqpError> {
        let publication = prepare(ctx, message);
        let correlation_id = publication
            .properties
            .correlation_id()
            .as_ref()
            .map(|id| id.to_string())
            .unwrap_or_default();

        let exchange = publication.exchange.clone();
        let routing_key = publication.routing_key.clone();
        let result = self.pool.with_item(move |channel| send(channel.as_ref(), publication).boxed()).await;

        if let Err(err) = &result {
            error!(
                error = err.to_string(),
                exchange,
                routing_key,
                correlation_id,
                "error publishing message"
            );
        }
        result
    }

    /// Publishes an already encoded message on a background task. Failures
    /// are logged only.
    pub fn publish_detached(&self, ctx: &Context, message: Outgoing<Vec<u8>>) -> JoinHandle<()> {
        let publication = prepare(ctx, message);
        self.pool
            .run(move |channel| send(channel.as_ref(), publication).boxed())
    }

    pub async fn close(&self) {
        self.pool.close().await;
    }
}

fn prepare(ctx: &Context, message: Outgoing<Vec<u8>>) -> Publication {
    let (exchange, routing_key, mut properties, payload) = message.into_envelope().into_parts();
    otel::inject_context(ctx, &mut properties);

    Publication {
        exchange,
        routing_key,
        properties: BasicProperties::from(&properties)
            .with_message_id(ShortString::from(Uuid::new_v4().to_string())),
        payload,
    }
}

async fn send(channel: &dyn AmqpChannel, publication: Publication) -> Result<(), AmqpError> {
    debug!(
        exchange = publication.exchange,
        routing_key = publication.routing_key,
        size = publication.payload.len(),
        "publishing message"
    );

    channel
        .basic_publish(
            &publication.exchange,
            &publication.routing_key,
            &publication.payload,
            publication.properties,
        )
        .await
}
