// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # RabbitMQ Message Dispatcher
//!
//! A [`RabbitMQDispatcher`] consumes one queue on a dedicated channel and
//! hands every delivery to a [`MessageHandler`] on its own task, so a slow
//! handler never holds up the next delivery.
//!
//! The dispatcher is either stopped or started. Starting sets the prefetch
//! count and begins consuming. It goes back to stopped when the application
//! stops it, when the broker cancels the consumer, or when the connection
//! shuts down. Stopping cancels the consumer first, then waits (up to the
//! drain timeout) for outstanding manual acknowledgements, and only then
//! closes the channel.

use crate::{
    acker::{Acknowledger, OutstandingAcks},
    channel::{AmqpChannel, AmqpConnection, DeliveryStream},
    codec::Negotiator,
    config::{AckMode, ConsumerConfig},
    consumer::{consume, MessageHandler},
    errors::AmqpError,
    otel::TRACER_NAME,
    queue::DIRECT_REPLY_TO,
    topology::Topology,
};
use futures_util::StreamExt;
use opentelemetry::global;
use std::{
    sync::{Arc, Mutex},
    time::Duration,
};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConsumerState {
    Stopped,
    Started,
}

/// Resources of a started consumer.
struct Running {
    channel: Arc<dyn AmqpChannel>,
    task: JoinHandle<()>,
}

/// Consumes a single queue.
pub struct RabbitMQDispatcher<T> {
    connection: Arc<dyn AmqpConnection>,
    queue: String,
    consumer_tag: String,
    cfg: ConsumerConfig,
    topology: Option<Topology>,
    negotiator: Arc<Negotiator<T>>,
    handler: Arc<dyn MessageHandler<T>>,
    acks: Arc<OutstandingAcks>,
    state: Arc<Mutex<ConsumerState>>,
    running: tokio::sync::Mutex<Option<Running>>,
}

impl<T: Send + 'static> RabbitMQDispatcher<T> {
    pub fn new(
        connection: Arc<dyn AmqpConnection>,
        queue: &str,
        cfg: ConsumerConfig,
        negotiator: Arc<Negotiator<T>>,
        handler: Arc<dyn MessageHandler<T>>,
    ) -> Self {
        let state = Arc::new(Mutex::new(ConsumerState::Stopped));

        let on_shutdown = state.clone();
        let shutdown_queue = queue.to_owned();
        connection.on_shutdown(Box::new(move |_| {
            if transition(&on_shutdown, ConsumerState::Stopped) == ConsumerState::Started {
                warn!(queue = shutdown_queue, "connection shut down, consumer stopped");
            }
        }));

        RabbitMQDispatcher {
            connection,
            queue: queue.to_owned(),
            consumer_tag: format!("{}-{}", queue, Uuid::new_v4()),
            cfg,
            topology: None,
            negotiator,
            handler,
            acks: OutstandingAcks::new(),
            state,
            running: tokio::sync::Mutex::new(None),
        }
    }

    /// Declares the part of `topology` this queue needs before consuming.
    pub fn with_topology(mut self, topology: &Topology) -> Self {
        self.topology = Some(topology.for_queue(&self.queue));
        self
    }

    pub fn queue(&self) -> &str {
        &self.queue
    }

    pub fn state(&self) -> ConsumerState {
        current(&self.state)
    }

    /// Manual acknowledgements handed out and not yet settled.
    pub fn outstanding_acks(&self) -> usize {
        self.acks.outstanding()
    }

    fn ack_mode(&self) -> AckMode {
        // the direct reply-to pseudo-queue only supports auto-ack
        if self.queue == DIRECT_REPLY_TO {
            return AckMode::Auto;
        }
        self.cfg.ack_mode
    }

    pub async fn start(&self) -> Result<(), AmqpError> {
        let mut running = self.running.lock().await;
        if current(&self.state) == ConsumerState::Started {
            return Err(AmqpError::ConsumerState(self.queue.clone(), "started"));
        }
        self.release_stale(&mut running).await;

        let channel = self.connection.create_channel().await?;
        let ack_mode = self.ack_mode();

        let deliveries = match self.subscribe(channel.as_ref(), ack_mode).await {
            Ok(deliveries) => deliveries,
            Err(err) => {
                error!(error = err.to_string(), queue = self.queue, "failure to start consumer");
                close_channel(&self.queue, channel.as_ref()).await;
                return Err(err);
            }
        };

        transition(&self.state, ConsumerState::Started);
        info!(queue = self.queue, prefetch = self.cfg.prefetch, "consumer started");

        let task = tokio::spawn(dispatch_loop(
            deliveries,
            DispatchContext {
                queue: self.queue.clone(),
                ack_mode,
                drain_timeout: self.cfg.drain_timeout(),
                channel: channel.clone(),
                negotiator: self.negotiator.clone(),
                handler: self.handler.clone(),
                acks: self.acks.clone(),
                state: self.state.clone(),
            },
        ));

        *running = Some(Running { channel, task });
        Ok(())
    }

    async fn subscribe(
        &self,
        channel: &dyn AmqpChannel,
        ack_mode: AckMode,
    ) -> Result<DeliveryStream, AmqpError> {
        if let Some(topology) = &self.topology {
            topology.install(channel).await?;
        }

        channel.basic_qos(self.cfg.prefetch).await?;
        channel
            .basic_consume(&self.queue, &self.consumer_tag, ack_mode == AckMode::Auto)
            .await
    }

    pub async fn stop(&self) -> Result<(), AmqpError> {
        let mut running = self.running.lock().await;
        if transition(&self.state, ConsumerState::Stopped) == ConsumerState::Stopped {
            self.release_stale(&mut running).await;
            return Err(AmqpError::ConsumerState(self.queue.clone(), "stopped"));
        }

        let Some(Running { channel, task }) = running.take() else {
            return Ok(());
        };

        let cancelled = channel.basic_cancel(&self.consumer_tag).await;
        task.abort();

        drain(&self.queue, &self.acks, self.cfg.drain_timeout()).await;
        close_channel(&self.queue, channel.as_ref()).await;
        info!(queue = self.queue, "consumer stopped");

        cancelled
    }

    /// Releases what a consumer stopped by the broker or by a connection
    /// shutdown left behind.
    async fn release_stale(&self, running: &mut Option<Running>) {
        let Some(Running { channel, task }) = running.take() else {
            return;
        };

        debug!(queue = self.queue, "releasing resources of a stopped consumer");
        task.abort();
        drain(&self.queue, &self.acks, self.cfg.drain_timeout()).await;
        close_channel(&self.queue, channel.as_ref()).await;
    }
}

/// Everything the delivery loop needs, detached from the dispatcher.
struct DispatchContext<T> {
    queue: String,
    ack_mode: AckMode,
    drain_timeout: Duration,
    channel: Arc<dyn AmqpChannel>,
    negotiator: Arc<Negotiator<T>>,
    handler: Arc<dyn MessageHandler<T>>,
    acks: Arc<OutstandingAcks>,
    state: Arc<Mutex<ConsumerState>>,
}

async fn dispatch_loop<T: Send + 'static>(mut deliveries: DeliveryStream, cx: DispatchContext<T>) {
    while let Some(result) = deliveries.next().await {
        let delivery = match result {
            Ok(delivery) => delivery,
            Err(err) => {
                error!(error = err.to_string(), queue = cx.queue, "errors consume msg");
                continue;
            }
        };

        let ack = match cx.ack_mode {
            AckMode::Auto => Acknowledger::Auto,
            AckMode::Manual => {
                Acknowledger::manual(cx.channel.clone(), delivery.delivery_tag, &cx.acks)
            }
        };

        let queue = cx.queue.clone();
        let negotiator = cx.negotiator.clone();
        let handler = cx.handler.clone();
        tokio::spawn(async move {
            let tracer = global::tracer(TRACER_NAME);
            // failures are logged where they happen
            let _ = consume(&tracer, delivery, &queue, ack, &negotiator, handler).await;
        });
    }

    // stream ended without a stop request: the broker cancelled us or the
    // channel went away
    if transition(&cx.state, ConsumerState::Stopped) == ConsumerState::Started {
        warn!(queue = cx.queue, "consumer cancelled by broker");
        drain(&cx.queue, &cx.acks, cx.drain_timeout).await;
        close_channel(&cx.queue, cx.channel.as_ref()).await;
    }
}

async fn drain(queue: &str, acks: &OutstandingAcks, timeout: Duration) {
    debug!(queue, outstanding = acks.outstanding(), "waiting for outstanding acks");
    if tokio::time::timeout(timeout, acks.drained()).await.is_err() {
        warn!(
            queue,
            outstanding = acks.outstanding(),
            "drain timeout elapsed with unsettled deliveries"
        );
    }
}

async fn close_channel(queue: &str, channel: &dyn AmqpChannel) {
    if !channel.is_open() {
        return;
    }
    if let Err(err) = channel.close().await {
        error!(error = err.to_string(), queue, "failure to close consumer channel");
    }
}

fn current(state: &Mutex<ConsumerState>) -> ConsumerState {
    state
        .lock()
        .map(|state| *state)
        .unwrap_or(ConsumerState::Stopped)
}

/// Moves to `next`, returning the previous state.
fn transition(state: &Mutex<ConsumerState>, next: ConsumerState) -> ConsumerState {
    match state.lock() {
        Ok(mut state) => std::mem::replace(&mut *state, next),
        Err(_) => {
            error!("consumer state lock poisoned");
            ConsumerState::Stopped
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        channel::{BrokerDelivery, ShutdownInitiator, ShutdownListener, ShutdownSignal},
        codec::{TextCodec, TEXT_CONTENT_TYPE},
        message::Incoming,
    };
    use async_trait::async_trait;
    use lapin::{
        options::{ExchangeDeclareOptions, QueueDeclareOptions},
        types::{FieldTable, ShortString},
        BasicProperties, ExchangeKind,
    };
    use opentelemetry::Context;
    use std::sync::atomic::{AtomicBool, Ordering};
    use tokio::sync::mpsc;

    /// Channel whose deliveries come from an mpsc sender held by the test.
    struct FakeChannel {
        calls: Mutex<Vec<String>>,
        deliveries: Mutex<Option<mpsc::UnboundedReceiver<BrokerDelivery>>>,
        open: AtomicBool,
    }

    impl FakeChannel {
        fn new() -> (Arc<Self>, mpsc::UnboundedSender<BrokerDelivery>) {
            let (tx, rx) = mpsc::unbounded_channel();
            let channel = FakeChannel {
                calls: Mutex::new(vec![]),
                deliveries: Mutex::new(Some(rx)),
                open: AtomicBool::new(true),
            };
            (Arc::new(channel), tx)
        }

        fn record(&self, call: String) {
            self.calls.lock().unwrap().push(call);
        }

        fn calls(&self) -> Vec<String> {
            self.calls.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl AmqpChannel for FakeChannel {
        async fn exchange_declare(
            &self,
            name: &str,
            _: ExchangeKind,
            _: ExchangeDeclareOptions,
            _: FieldTable,
        ) -> Result<(), AmqpError> {
            self.record(format!("exchange {}", name));
            Ok(())
        }

        async fn queue_declare(
            &self,
            name: &str,
            _: QueueDeclareOptions,
            _: FieldTable,
        ) -> Result<(), AmqpError> {
            self.record(format!("queue {}", name));
            Ok(())
        }

        async fn queue_bind(&self, queue: &str, exchange: &str, _: &str, _: FieldTable) -> Result<(), AmqpError> {
            self.record(format!("bind {} {}", exchange, queue));
            Ok(())
        }

        async fn basic_publish(
            &self,
            _: &str,
            _: &str,
            _: &[u8],
            _: BasicProperties,
        ) -> Result<(), AmqpError> {
            Ok(())
        }

        async fn basic_qos(&self, prefetch_count: u16) -> Result<(), AmqpError> {
            self.record(format!("qos {}", prefetch_count));
            Ok(())
        }

        async fn basic_consume(
            &self,
            queue: &str,
            _: &str,
            no_ack: bool,
        ) -> Result<DeliveryStream, AmqpError> {
            self.record(format!("consume {} no_ack={}", queue, no_ack));
            let rx = self
                .deliveries
                .lock()
                .unwrap()
                .take()
                .ok_or_else(|| AmqpError::ConsumerDeclarationError(queue.to_owned()))?;

            Ok(futures_util::stream::unfold(rx, |mut rx| async move {
                rx.recv().await.map(|delivery| (Ok(delivery), rx))
            })
            .boxed())
        }

        async fn basic_cancel(&self, _: &str) -> Result<(), AmqpError> {
            self.record("cancel".to_owned());
            Ok(())
        }

        async fn basic_ack(&self, delivery_tag: u64) -> Result<(), AmqpError> {
            self.record(format!("ack {}", delivery_tag));
            Ok(())
        }

        async fn basic_reject(&self, delivery_tag: u64, requeue: bool) -> Result<(), AmqpError> {
            self.record(format!("reject {} requeue={}", delivery_tag, requeue));
            Ok(())
        }

        fn is_open(&self) -> bool {
            self.open.load(Ordering::SeqCst)
        }

        async fn close(&self) -> Result<(), AmqpError> {
            self.record("close".to_owned());
            self.open.store(false, Ordering::SeqCst);
            Ok(())
        }
    }

    struct FakeConnection {
        channel: Arc<FakeChannel>,
        listeners: Mutex<Vec<ShutdownListener>>,
    }

    impl FakeConnection {
        fn shut_down(&self) {
            let signal = ShutdownSignal {
                initiator: ShutdownInitiator::Broker,
                reason: "connection reset".to_owned(),
            };
            self.listeners.lock().unwrap().iter().for_each(|listener| listener(&signal));
        }
    }

    #[async_trait]
    impl AmqpConnection for FakeConnection {
        async fn create_channel(&self) -> Result<Arc<dyn AmqpChannel>, AmqpError> {
            Ok(self.channel.clone())
        }

        fn channel_max(&self) -> u16 {
            0
        }

        fn is_open(&self) -> bool {
            true
        }

        fn on_shutdown(&self, listener: ShutdownListener) {
            self.listeners.lock().unwrap().push(listener);
        }

        async fn close(&self) -> Result<(), AmqpError> {
            Ok(())
        }
    }

    /// Forwards every message and its ack handle to the test.
    struct Forwarding {
        tx: mpsc::UnboundedSender<(Incoming<String>, Acknowledger)>,
    }

    #[async_trait]
    impl MessageHandler<String> for Forwarding {
        async fn handle(
            &self,
            _: &Context,
            message: Incoming<String>,
            ack: Acknowledger,
        ) -> Result<(), AmqpError> {
            let _ = self.tx.send((message, ack));
            Ok(())
        }
    }

    struct Fixture {
        connection: Arc<FakeConnection>,
        channel: Arc<FakeChannel>,
        deliveries: mpsc::UnboundedSender<BrokerDelivery>,
        handled: mpsc::UnboundedReceiver<(Incoming<String>, Acknowledger)>,
        dispatcher: RabbitMQDispatcher<String>,
    }

    fn fixture(queue: &str, ack_mode: AckMode) -> Fixture {
        let (channel, deliveries) = FakeChannel::new();
        let connection = Arc::new(FakeConnection {
            channel: channel.clone(),
            listeners: Mutex::new(vec![]),
        });
        let (tx, handled) = mpsc::unbounded_channel();
        let cfg = ConsumerConfig {
            ack_mode,
            prefetch: 5,
            drain_timeout_ms: 1_000,
        };

        let dispatcher = RabbitMQDispatcher::new(
            connection.clone(),
            queue,
            cfg,
            Arc::new(Negotiator::default().with_reader(TextCodec)),
            Arc::new(Forwarding { tx }),
        );

        Fixture {
            connection,
            channel,
            deliveries,
            handled,
            dispatcher,
        }
    }

    fn delivery(tag: u64, body: &str) -> BrokerDelivery {
        BrokerDelivery {
            delivery_tag: tag,
            exchange: "orders".to_owned(),
            routing_key: "order.created".to_owned(),
            properties: BasicProperties::default()
                .with_content_type(ShortString::from(TEXT_CONTENT_TYPE)),
            data: body.as_bytes().to_vec(),
            ..BrokerDelivery::default()
        }
    }

    async fn wait_for_state(dispatcher: &RabbitMQDispatcher<String>, state: ConsumerState) {
        while dispatcher.state() != state {
            tokio::task::yield_now().await;
        }
    }

    #[tokio::test]
    async fn start_sets_qos_before_consuming() {
        let f = fixture("orders.q", AckMode::Manual);

        f.dispatcher.start().await.unwrap();

        assert_eq!(f.dispatcher.state(), ConsumerState::Started);
        assert_eq!(f.channel.calls(), vec!["qos 5", "consume orders.q no_ack=false"]);
    }

    #[tokio::test]
    async fn start_installs_the_queue_topology() {
        use crate::{
            exchange::ExchangeDefinition,
            queue::{QueueBinding, QueueDefinition},
        };

        let topology = Topology::builder()
            .exchange(ExchangeDefinition::new("orders").topic())
            .exchange(ExchangeDefinition::new("billing"))
            .queue(QueueDefinition::new("orders.q"))
            .queue(QueueDefinition::new("billing.q"))
            .queue_binding(QueueBinding::new("orders.q").exchange("orders").routing_key("order.*"))
            .queue_binding(QueueBinding::new("billing.q").exchange("billing"))
            .build()
            .unwrap();
        let f = fixture("orders.q", AckMode::Auto);
        let dispatcher = f.dispatcher.with_topology(&topology);

        dispatcher.start().await.unwrap();

        assert_eq!(
            f.channel.calls(),
            vec![
                "exchange orders",
                "queue orders.q",
                "bind orders orders.q",
                "qos 5",
                "consume orders.q no_ack=true",
            ]
        );
    }

    #[tokio::test]
    async fn starting_twice_fails() {
        let f = fixture("orders.q", AckMode::Auto);
        f.dispatcher.start().await.unwrap();

        assert_eq!(
            f.dispatcher.start().await,
            Err(AmqpError::ConsumerState("orders.q".to_owned(), "started"))
        );
    }

    #[tokio::test]
    async fn stopping_a_stopped_consumer_fails() {
        let f = fixture("orders.q", AckMode::Auto);

        assert_eq!(
            f.dispatcher.stop().await,
            Err(AmqpError::ConsumerState("orders.q".to_owned(), "stopped"))
        );
    }

    #[tokio::test]
    async fn deliveries_reach_the_handler_and_ack() {
        let mut f = fixture("orders.q", AckMode::Manual);
        f.dispatcher.start().await.unwrap();

        f.deliveries.send(delivery(1, "first")).unwrap();
        f.deliveries.send(delivery(2, "second")).unwrap();

        let mut bodies = vec![];
        for _ in 0..2 {
            let (message, ack) = f.handled.recv().await.unwrap();
            assert!(ack.is_manual());
            ack.ack().await.unwrap();
            bodies.push(message.content().clone());
        }
        bodies.sort();

        assert_eq!(bodies, vec!["first", "second"]);
        assert_eq!(f.dispatcher.outstanding_acks(), 0);
    }

    #[tokio::test]
    async fn direct_reply_to_is_always_auto_ack() {
        let f = fixture(DIRECT_REPLY_TO, AckMode::Manual);

        f.dispatcher.start().await.unwrap();

        assert_eq!(
            f.channel.calls().last().unwrap(),
            &format!("consume {} no_ack=true", DIRECT_REPLY_TO)
        );
    }

    #[tokio::test(start_paused = true)]
    async fn stop_waits_for_outstanding_acks_before_closing() {
        let mut f = fixture("orders.q", AckMode::Manual);
        f.dispatcher.start().await.unwrap();
        f.deliveries.send(delivery(7, "slow")).unwrap();
        let (_, ack) = f.handled.recv().await.unwrap();
        assert_eq!(f.dispatcher.outstanding_acks(), 1);

        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(200)).await;
            ack.ack().await.unwrap();
        });
        f.dispatcher.stop().await.unwrap();

        assert_eq!(f.dispatcher.state(), ConsumerState::Stopped);
        assert_eq!(
            f.channel.calls(),
            vec!["qos 5", "consume orders.q no_ack=false", "cancel", "ack 7", "close"]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn stop_gives_up_after_the_drain_timeout() {
        let mut f = fixture("orders.q", AckMode::Manual);
        f.dispatcher.start().await.unwrap();
        f.deliveries.send(delivery(9, "stuck")).unwrap();
        let (_, _held) = f.handled.recv().await.unwrap();

        let started = tokio::time::Instant::now();
        f.dispatcher.stop().await.unwrap();

        assert!(started.elapsed() >= Duration::from_secs(1));
        assert_eq!(f.dispatcher.outstanding_acks(), 1);
        assert_eq!(f.channel.calls().last().unwrap(), "close");
    }

    #[tokio::test]
    async fn broker_cancel_stops_the_consumer() {
        let f = fixture("orders.q", AckMode::Auto);
        f.dispatcher.start().await.unwrap();

        drop(f.deliveries);
        wait_for_state(&f.dispatcher, ConsumerState::Stopped).await;

        assert!(f.dispatcher.stop().await.is_err());
    }

    #[tokio::test]
    async fn connection_shutdown_stops_the_consumer() {
        let f = fixture("orders.q", AckMode::Auto);
        f.dispatcher.start().await.unwrap();

        f.connection.shut_down();

        assert_eq!(f.dispatcher.state(), ConsumerState::Stopped);
    }

    #[tokio::test]
    async fn stop_after_connection_shutdown_releases_the_channel() {
        let f = fixture("orders.q", AckMode::Auto);
        f.dispatcher.start().await.unwrap();
        f.connection.shut_down();

        assert_eq!(
            f.dispatcher.stop().await,
            Err(AmqpError::ConsumerState("orders.q".to_owned(), "stopped"))
        );

        assert!(f.dispatcher.running.lock().await.is_none());
        assert!(!f.channel.is_open());
        assert_eq!(f.channel.calls().last().unwrap(), "close");
        assert!(!f.channel.calls().contains(&"cancel".to_owned()));
    }
}
