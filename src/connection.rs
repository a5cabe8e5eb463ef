// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # AMQP Connection Management
//!
//! Establishes the broker connection under exponential backoff. Each failed
//! attempt doubles the pause before the next one, capped at a maximum delay,
//! until either the attempt cap or the total wall-clock budget runs out.
//! Both limits surface as timeout errors ([`AmqpError::is_timeout`]).
//!
//! An acquisition in progress can be aborted through an [`Interrupter`];
//! the retry loop then stops promptly with [`AmqpError::Interrupted`].
//! Interrupts only affect acquisitions running at the time, later ones
//! start afresh.

use crate::{
    channel::{AmqpConnection, LapinConnection, ShutdownInitiator},
    config::{ConnectionConfig, RetryConfig},
    errors::AmqpError,
};
use async_trait::async_trait;
use lapin::{types::LongString, Connection, ConnectionProperties};
use std::{sync::Arc, time::Duration};
use tokio::{
    sync::{watch, Mutex},
    time::Instant,
};
use tracing::{debug, error, info, warn};

/// Backoff parameters for connection attempts.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryPolicy {
    pub initial_delay: Duration,
    pub max_delay: Duration,
    pub max_attempts: u32,
    /// Total budget for the whole retry loop.
    pub max_wait: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        RetryPolicy::from(&RetryConfig::default())
    }
}

/// Opens one broker connection per call, without retrying.
#[async_trait]
pub trait Connector: Send + Sync {
    async fn connect(&self) -> Result<Arc<dyn AmqpConnection>, AmqpError>;
}

/// [`Connector`] backed by lapin.
pub struct LapinConnector {
    uri: String,
    name: String,
}

impl LapinConnector {
    pub fn new(cfg: &ConnectionConfig) -> Self {
        LapinConnector {
            uri: cfg.uri.clone(),
            name: cfg.name.clone(),
        }
    }
}

#[async_trait]
impl Connector for LapinConnector {
    async fn connect(&self) -> Result<Arc<dyn AmqpConnection>, AmqpError> {
        debug!("creating amqp connection...");
        let options = ConnectionProperties::default()
            .with_connection_name(LongString::from(self.name.clone()));

        match Connection::connect(&self.uri, options).await {
            Ok(conn) => {
                debug!("amqp connected");
                Ok(Arc::new(LapinConnection::new(conn)))
            }
            Err(err) => Err(AmqpError::ConnectionError(err.to_string())),
        }
    }
}

/// Aborts the acquisitions in progress on the [`ConnectionManager`] it
/// came from.
#[derive(Clone)]
pub struct Interrupter {
    generation: Arc<watch::Sender<u64>>,
}

impl Interrupter {
    pub fn interrupt(&self) {
        self.generation
            .send_modify(|generation| *generation = generation.wrapping_add(1));
    }
}

pub struct ConnectionManager {
    connector: Arc<dyn Connector>,
    policy: RetryPolicy,
    interrupt: Arc<watch::Sender<u64>>,
    current: Mutex<Option<Arc<dyn AmqpConnection>>>,
}

impl ConnectionManager {
    pub fn new(connector: Arc<dyn Connector>, policy: RetryPolicy) -> Self {
        let (interrupt, _) = watch::channel(0);
        ConnectionManager {
            connector,
            policy,
            interrupt: Arc::new(interrupt),
            current: Mutex::new(None),
        }
    }

    pub fn from_config(cfg: &ConnectionConfig) -> Self {
        ConnectionManager::new(
            Arc::new(LapinConnector::new(cfg)),
            RetryPolicy::from(&cfg.retry),
        )
    }

    pub fn interrupter(&self) -> Interrupter {
        Interrupter {
            generation: self.interrupt.clone(),
        }
    }

    /// Returns the current connection, acquiring a new one when there is
    /// none yet or the previous one was lost.
    pub async fn connection(&self) -> Result<Arc<dyn AmqpConnection>, AmqpError> {
        let mut current = self.current.lock().await;
        if let Some(conn) = current.as_ref().filter(|conn| conn.is_open()) {
            return Ok(conn.clone());
        }

        let conn = self.acquire().await?;
        *current = Some(conn.clone());
        Ok(conn)
    }

    /// Connects, retrying failures under the configured policy.
    pub async fn acquire(&self) -> Result<Arc<dyn AmqpConnection>, AmqpError> {
        let mut interrupted = self.interrupt.subscribe();
        let started = Instant::now();
        let mut delay = self.policy.initial_delay;
        let mut attempts: u32 = 0;

        loop {
            let remaining = self.policy.max_wait.saturating_sub(started.elapsed());
            if attempts > 0 && remaining.is_zero() {
                error!(attempts, "connection budget exhausted, giving up");
                return Err(AmqpError::ConnectDeadlineExceeded {
                    attempts,
                    elapsed: started.elapsed(),
                });
            }

            attempts += 1;
            let outcome = tokio::select! {
                biased;
                _ = wait_interrupted(&mut interrupted) => return Err(AmqpError::Interrupted),
                outcome = tokio::time::timeout(remaining, self.connector.connect()) => outcome,
            };

            match outcome {
                Ok(Ok(conn)) => {
                    info!(attempts, "amqp connection established");
                    watch_shutdown(conn.as_ref());
                    return Ok(conn);
                }
                Ok(Err(err)) => {
                    warn!(error = err.to_string(), attempt = attempts, "failure to connect");
                }
                Err(_) => warn!(attempt = attempts, "connection attempt timed out"),
            }

            if attempts >= self.policy.max_attempts {
                error!(attempts, "max connection attempts reached, giving up");
                return Err(AmqpError::ConnectAttemptsExhausted { attempts });
            }

            let remaining = self.policy.max_wait.saturating_sub(started.elapsed());
            let pause = delay.min(remaining);
            debug!(delay_ms = pause.as_millis() as u64, "waiting before next connection attempt");
            tokio::select! {
                biased;
                _ = wait_interrupted(&mut interrupted) => return Err(AmqpError::Interrupted),
                _ = tokio::time::sleep(pause) => {}
            }

            delay = delay.saturating_mul(2).min(self.policy.max_delay);
        }
    }
}

/// Resolves on the first interrupt issued after `generation` subscribed.
async fn wait_interrupted(generation: &mut watch::Receiver<u64>) {
    if generation.changed().await.is_err() {
        futures_util::future::pending::<()>().await;
    }
}

fn watch_shutdown(conn: &dyn AmqpConnection) {
    conn.on_shutdown(Box::new(|signal| match signal.initiator {
        ShutdownInitiator::Application => {
            info!(reason = %signal.reason, "amqp connection closed by application")
        }
        ShutdownInitiator::Broker => {
            error!(reason = %signal.reason, "amqp connection lost")
        }
    }));
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::{AmqpChannel, ShutdownListener, ShutdownSignal};
    use std::sync::{
        atomic::{AtomicBool, AtomicU32, Ordering},
        Mutex as StdMutex,
    };

    #[derive(Default)]
    struct FakeConnection {
        open: AtomicBool,
        listeners: StdMutex<Vec<ShutdownListener>>,
    }

    #[async_trait]
    impl AmqpConnection for FakeConnection {
        async fn create_channel(&self) -> Result<Arc<dyn AmqpChannel>, AmqpError> {
            Err(AmqpError::ChannelError("unused".to_owned()))
        }

        fn channel_max(&self) -> u16 {
            0
        }

        fn is_open(&self) -> bool {
            self.open.load(Ordering::SeqCst)
        }

        fn on_shutdown(&self, listener: ShutdownListener) {
            self.listeners.lock().unwrap().push(listener);
        }

        async fn close(&self) -> Result<(), AmqpError> {
            self.open.store(false, Ordering::SeqCst);
            Ok(())
        }
    }

    /// Fails the first `failures` attempts, then connects.
    struct Flaky {
        failures: u32,
        attempts: AtomicU32,
    }

    impl Flaky {
        fn always_failing() -> Self {
            Flaky {
                failures: u32::MAX,
                attempts: AtomicU32::new(0),
            }
        }
    }

    #[async_trait]
    impl Connector for Flaky {
        async fn connect(&self) -> Result<Arc<dyn AmqpConnection>, AmqpError> {
            let attempt = self.attempts.fetch_add(1, Ordering::SeqCst) + 1;
            if attempt <= self.failures {
                return Err(AmqpError::ConnectionError("connection refused".to_owned()));
            }
            let conn = FakeConnection::default();
            conn.open.store(true, Ordering::SeqCst);
            Ok(Arc::new(conn))
        }
    }

    struct Hanging;

    #[async_trait]
    impl Connector for Hanging {
        async fn connect(&self) -> Result<Arc<dyn AmqpConnection>, AmqpError> {
            futures_util::future::pending().await
        }
    }

    fn policy(initial_ms: u64, max_attempts: u32, max_wait_ms: u64) -> RetryPolicy {
        RetryPolicy {
            initial_delay: Duration::from_millis(initial_ms),
            max_delay: Duration::from_secs(10),
            max_attempts,
            max_wait: Duration::from_millis(max_wait_ms),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn attempt_cap_raises_a_timeout() {
        let connector = Arc::new(Flaky::always_failing());
        let manager = ConnectionManager::new(connector.clone(), policy(100, 3, 60_000));
        let started = Instant::now();

        let err = manager.acquire().await.err().unwrap();

        assert_eq!(err, AmqpError::ConnectAttemptsExhausted { attempts: 3 });
        assert!(err.is_timeout());
        assert_eq!(connector.attempts.load(Ordering::SeqCst), 3);
        // 100ms + 200ms of backoff between the three attempts
        let elapsed = started.elapsed();
        assert!(elapsed >= Duration::from_millis(300) && elapsed < Duration::from_millis(310));
    }

    #[tokio::test(start_paused = true)]
    async fn wall_clock_budget_raises_a_timeout() {
        let connector = Arc::new(Flaky::always_failing());
        let manager = ConnectionManager::new(connector.clone(), policy(1_000, 3, 2_500));
        let started = Instant::now();

        let err = manager.acquire().await.err().unwrap();

        assert!(matches!(err, AmqpError::ConnectDeadlineExceeded { attempts: 2, .. }));
        assert!(err.is_timeout());
        assert!(connector.attempts.load(Ordering::SeqCst) <= 3);
        assert!(started.elapsed() <= Duration::from_millis(2_500));
    }

    #[tokio::test(start_paused = true)]
    async fn hanging_attempt_is_bounded_by_the_budget() {
        let manager = ConnectionManager::new(Arc::new(Hanging), policy(100, 5, 1_000));

        let err = manager.acquire().await.err().unwrap();

        assert!(err.is_timeout());
    }

    #[tokio::test(start_paused = true)]
    async fn delays_are_capped() {
        let connector = Arc::new(Flaky::always_failing());
        let mut policy = policy(100, 5, 60_000);
        policy.max_delay = Duration::from_millis(150);
        let manager = ConnectionManager::new(connector, policy);
        let started = Instant::now();

        let _ = manager.acquire().await;

        // 100 + 150 + 150 + 150
        let elapsed = started.elapsed();
        assert!(elapsed >= Duration::from_millis(550) && elapsed < Duration::from_millis(560));
    }

    #[tokio::test(start_paused = true)]
    async fn recovers_after_transient_failures() {
        let connector = Arc::new(Flaky {
            failures: 2,
            attempts: AtomicU32::new(0),
        });
        let manager = ConnectionManager::new(connector.clone(), policy(100, 5, 60_000));

        let conn = manager.acquire().await.unwrap();

        assert!(conn.is_open());
        assert_eq!(connector.attempts.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn interrupt_aborts_the_retry_loop() {
        let manager = Arc::new(ConnectionManager::new(
            Arc::new(Flaky::always_failing()),
            policy(5_000, 100, 600_000),
        ));
        let interrupter = manager.interrupter();

        let pending = tokio::spawn({
            let manager = manager.clone();
            async move { manager.acquire().await.err() }
        });
        tokio::time::sleep(Duration::from_millis(10)).await;
        interrupter.interrupt();

        assert_eq!(pending.await.unwrap(), Some(AmqpError::Interrupted));
    }

    #[tokio::test(start_paused = true)]
    async fn acquires_again_after_an_interrupted_call() {
        let connector = Arc::new(Flaky {
            failures: 1,
            attempts: AtomicU32::new(0),
        });
        let manager = Arc::new(ConnectionManager::new(
            connector.clone(),
            policy(5_000, 100, 600_000),
        ));
        let interrupter = manager.interrupter();

        let pending = tokio::spawn({
            let manager = manager.clone();
            async move { manager.acquire().await.err() }
        });
        tokio::time::sleep(Duration::from_millis(10)).await;
        interrupter.interrupt();
        assert_eq!(pending.await.unwrap(), Some(AmqpError::Interrupted));

        let conn = manager.connection().await.unwrap();
        assert!(conn.is_open());
        assert_eq!(connector.attempts.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn interrupt_without_acquisition_in_progress_is_ignored() {
        let connector = Arc::new(Flaky {
            failures: 0,
            attempts: AtomicU32::new(0),
        });
        let manager = ConnectionManager::new(connector.clone(), policy(100, 5, 60_000));

        manager.interrupter().interrupt();

        assert!(manager.acquire().await.is_ok());
        assert!(manager.connection().await.is_ok());
    }

    #[tokio::test]
    async fn connection_is_reused_while_open() {
        let connector = Arc::new(Flaky {
            failures: 0,
            attempts: AtomicU32::new(0),
        });
        let manager = ConnectionManager::new(connector.clone(), policy(100, 5, 60_000));

        let first = manager.connection().await.unwrap();
        let _ = manager.connection().await.unwrap();
        assert_eq!(connector.attempts.load(Ordering::SeqCst), 1);

        first.close().await.unwrap();
        let _ = manager.connection().await.unwrap();
        assert_eq!(connector.attempts.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn shutdown_listener_is_registered() {
        let conn = FakeConnection::default();
        watch_shutdown(&conn);

        let listeners = conn.listeners.lock().unwrap();
        assert_eq!(listeners.len(), 1);
        listeners[0](&ShutdownSignal {
            initiator: ShutdownInitiator::Broker,
            reason: "connection reset".to_owned(),
        });
    }
}
