// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # RabbitMQ Message Consumer
//!
//! Processing of a single delivery: classify it into an [`Incoming`]
//! envelope, decode it with the consumer's negotiator, and hand it to the
//! application's [`MessageHandler`] inside a consumer span.
//!
//! A delivery that cannot be classified or decoded, or whose handler fails,
//! is rejected without requeue and logged with its exchange, routing key
//! and correlation id. Requeueing would hand the same failing message
//! straight back.

use crate::{
    acker::Acknowledger, channel::BrokerDelivery, codec::Negotiator, errors::AmqpError,
    message::Incoming, otel,
};
use async_trait::async_trait;
use opentelemetry::{
    global::BoxedTracer,
    trace::{Status, TraceContextExt},
    Context,
};
use std::{borrow::Cow, sync::Arc};
use tracing::{debug, error};

/// Application callback invoked for each decoded delivery.
///
/// `ctx` carries the consumer span. In manual-ack mode the handler settles
/// the delivery through `ack`, possibly after returning; requests carry a
/// response builder seeded with the reply destination.
#[async_trait]
pub trait MessageHandler<T>: Send + Sync {
    async fn handle(
        &self,
        ctx: &Context,
        message: Incoming<T>,
        ack: Acknowledger,
    ) -> Result<(), AmqpError>;
}

/// Routing details kept for logging once the delivery has been consumed.
struct Origin {
    exchange: String,
    routing_key: String,
    correlation_id: String,
}

impl Origin {
    fn of(delivery: &BrokerDelivery) -> Self {
        Origin {
            exchange: delivery.exchange.clone(),
            routing_key: delivery.routing_key.clone(),
            correlation_id: delivery
                .properties
                .correlation_id()
                .as_ref()
                .map(|id| id.to_string())
                .unwrap_or_default(),
        }
    }
}

/// Processes one delivery consumed from `queue`.
pub(crate) async fn consume<T: Send + 'static>(
    tracer: &BoxedTracer,
    delivery: BrokerDelivery,
    queue: &str,
    ack: Acknowledger,
    negotiator: &Negotiator<T>,
    handler: Arc<dyn MessageHandler<T>>,
) -> Result<(), AmqpError> {
    let origin = Origin::of(&delivery);
    let span_name = match delivery.properties.kind() {
        Some(kind) => kind.to_string(),
        None => queue.to_owned(),
    };

    let (ctx, span) = otel::new_span(delivery.properties.headers().as_ref(), tracer, &span_name);
    let ctx = ctx.with_span(span);

    debug!(
        exchange = origin.exchange,
        routing_key = origin.routing_key,
        queue,
        "received delivery"
    );

    let result = dispatch(&ctx, delivery, queue, ack.clone(), negotiator, handler).await;

    match result {
        Ok(()) => {
            ctx.span().set_status(Status::Ok);
            Ok(())
        }
        Err(err) => {
            error!(
                error = err.to_string(),
                exchange = origin.exchange,
                routing_key = origin.routing_key,
                correlation_id = origin.correlation_id,
                "failure processing delivery, rejecting it"
            );
            ctx.span().record_error(&err);
            ctx.span().set_status(Status::Error {
                description: Cow::from("failure processing delivery"),
            });

            if let Err(reject_err) = ack.reject(false).await {
                error!(error = reject_err.to_string(), "error whiling reject msg");
                return Err(reject_err);
            }
            Err(err)
        }
    }
}

async fn dispatch<T: Send + 'static>(
    ctx: &Context,
    delivery: BrokerDelivery,
    queue: &str,
    ack: Acknowledger,
    negotiator: &Negotiator<T>,
    handler: Arc<dyn MessageHandler<T>>,
) -> Result<(), AmqpError> {
    let raw = Incoming::from_delivery(delivery, queue)?;
    let message = negotiator.decode(raw)?;

    handler.handle(ctx, message, ack).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        acker::OutstandingAcks,
        channel::MockAmqpChannel,
        codec::{JsonCodec, TextCodec, TEXT_CONTENT_TYPE},
        errors::CodecError,
        queue::DIRECT_REPLY_TO,
    };
    use lapin::{types::ShortString, BasicProperties};
    use opentelemetry::global;
    use std::sync::Mutex;

    #[derive(Default)]
    struct Recording {
        seen: Mutex<Vec<Incoming<String>>>,
        fail: bool,
    }

    #[async_trait]
    impl MessageHandler<String> for Recording {
        async fn handle(
            &self,
            _: &Context,
            message: Incoming<String>,
            ack: Acknowledger,
        ) -> Result<(), AmqpError> {
            self.seen.lock().unwrap().push(message);
            if self.fail {
                return Err(AmqpError::ConsumerError("handler failed".to_owned()));
            }
            ack.ack().await
        }
    }

    fn delivery(properties: BasicProperties, data: &[u8]) -> BrokerDelivery {
        BrokerDelivery {
            delivery_tag: 42,
            exchange: "orders".to_owned(),
            routing_key: "order.created".to_owned(),
            redelivered: false,
            properties: properties.with_content_type(ShortString::from(TEXT_CONTENT_TYPE)),
            data: data.to_vec(),
        }
    }

    fn text_negotiator() -> Negotiator<String> {
        Negotiator::default().with_reader(TextCodec)
    }

    fn manual(channel: MockAmqpChannel) -> (Acknowledger, Arc<OutstandingAcks>) {
        let acks = OutstandingAcks::new();
        (Acknowledger::manual(Arc::new(channel), 42, &acks), acks)
    }

    #[tokio::test]
    async fn decodes_and_hands_over_a_cast() {
        let mut channel = MockAmqpChannel::new();
        channel.expect_basic_ack().times(1).returning(|_| Ok(()));
        let (ack, acks) = manual(channel);
        let handler = Arc::new(Recording::default());

        consume(
            &global::tracer(otel::TRACER_NAME),
            delivery(BasicProperties::default(), b"hello"),
            "orders.q",
            ack,
            &text_negotiator(),
            handler.clone(),
        )
        .await
        .unwrap();

        let seen = handler.seen.lock().unwrap();
        assert!(matches!(seen[0], Incoming::Cast(_)));
        assert_eq!(seen[0].content(), "hello");
        assert_eq!(seen[0].delivery().queue, "orders.q");
        assert_eq!(acks.outstanding(), 0);
    }

    #[tokio::test]
    async fn request_carries_a_seeded_response_builder() {
        let (ack, _acks) = manual({
            let mut channel = MockAmqpChannel::new();
            channel.expect_basic_ack().returning(|_| Ok(()));
            channel
        });
        let handler = Arc::new(Recording::default());
        let properties = BasicProperties::default()
            .with_reply_to(ShortString::from(DIRECT_REPLY_TO))
            .with_correlation_id(ShortString::from("c-1"));

        consume(
            &global::tracer(otel::TRACER_NAME),
            delivery(properties, b"ping"),
            "rpc.q",
            ack,
            &text_negotiator(),
            handler.clone(),
        )
        .await
        .unwrap();

        let seen = handler.seen.lock().unwrap();
        let Incoming::Request(request) = &seen[0] else {
            panic!("expected a request");
        };
        let response = request.response_builder().content("pong".to_owned()).build().unwrap();
        assert_eq!(response.exchange(), "");
        assert_eq!(response.routing_key(), DIRECT_REPLY_TO);
        assert_eq!(response.properties().correlation_id(), Some("c-1"));
    }

    #[tokio::test]
    async fn handler_failure_rejects_without_requeue() {
        let mut channel = MockAmqpChannel::new();
        channel
            .expect_basic_reject()
            .withf(|tag, requeue| *tag == 42 && !*requeue)
            .times(1)
            .returning(|_, _| Ok(()));
        let (ack, acks) = manual(channel);
        let handler = Arc::new(Recording {
            fail: true,
            ..Recording::default()
        });

        let err = consume(
            &global::tracer(otel::TRACER_NAME),
            delivery(BasicProperties::default(), b"hello"),
            "orders.q",
            ack,
            &text_negotiator(),
            handler,
        )
        .await
        .unwrap_err();

        assert_eq!(err, AmqpError::ConsumerError("handler failed".to_owned()));
        assert_eq!(acks.outstanding(), 0);
    }

    #[tokio::test]
    async fn undecodable_delivery_is_rejected() {
        let mut channel = MockAmqpChannel::new();
        channel.expect_basic_reject().times(1).returning(|_, _| Ok(()));
        let (ack, _acks) = manual(channel);
        let handler = Arc::new(Recording::default());
        let negotiator: Negotiator<String> = Negotiator::default();

        let err = consume(
            &global::tracer(otel::TRACER_NAME),
            delivery(BasicProperties::default(), b"hello"),
            "orders.q",
            ack,
            &negotiator,
            handler.clone(),
        )
        .await
        .unwrap_err();

        assert!(matches!(err, AmqpError::Codec(CodecError::NoReader(_))));
        assert!(handler.seen.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn response_without_correlation_id_is_rejected() {
        let mut channel = MockAmqpChannel::new();
        channel.expect_basic_reject().times(1).returning(|_, _| Ok(()));
        let (ack, _acks) = manual(channel);

        let err = consume(
            &global::tracer(otel::TRACER_NAME),
            delivery(BasicProperties::default(), b"{}"),
            DIRECT_REPLY_TO,
            ack,
            &Negotiator::<String>::default().with_reader(JsonCodec::new()),
            Arc::new(Recording::default()),
        )
        .await
        .unwrap_err();

        assert!(matches!(err, AmqpError::Envelope(_)));
    }
}
