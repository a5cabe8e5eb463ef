// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Delivery Acknowledgement
//!
//! Every delivery handed to the application comes with an [`Acknowledger`].
//! In auto-ack mode the broker already considers the delivery settled and
//! the handle does nothing. In manual mode the handle settles the delivery
//! exactly once; later calls are no-ops.
//!
//! Unsettled manual handles are counted by [`OutstandingAcks`], which a
//! consumer waits on while stopping so in-flight work can still ack before
//! its channel closes.

use crate::{channel::AmqpChannel, errors::AmqpError};
use std::sync::{Arc, Mutex};
use tokio::sync::watch;
use tracing::{debug, warn};

/// Count of unsettled manual acknowledgements for one consumer.
#[derive(Debug)]
pub struct OutstandingAcks {
    count: watch::Sender<usize>,
}

impl Default for OutstandingAcks {
    fn default() -> Self {
        let (count, _) = watch::channel(0);
        OutstandingAcks { count }
    }
}

impl OutstandingAcks {
    pub fn new() -> Arc<Self> {
        Arc::new(OutstandingAcks::default())
    }

    pub fn outstanding(&self) -> usize {
        *self.count.borrow()
    }

    fn register(self: &Arc<Self>) -> Pending {
        self.count.send_modify(|count| *count += 1);
        Pending { acks: self.clone() }
    }

    /// Resolves once no acknowledgement is outstanding.
    pub async fn drained(&self) {
        let mut count = self.count.subscribe();
        while *count.borrow_and_update() > 0 {
            if count.changed().await.is_err() {
                return;
            }
        }
    }
}

/// One registration in [`OutstandingAcks`], released on drop.
#[derive(Debug)]
struct Pending {
    acks: Arc<OutstandingAcks>,
}

impl Drop for Pending {
    fn drop(&mut self) {
        self.acks
            .count
            .send_modify(|count| *count = count.saturating_sub(1));
    }
}

/// Handle settling a single delivery.
#[derive(Clone)]
pub enum Acknowledger {
    Auto,
    Manual(Arc<ManualAck>),
}

impl Acknowledger {
    /// A manual handle for `delivery_tag`, registered in `acks` until settled.
    pub fn manual(channel: Arc<dyn AmqpChannel>, delivery_tag: u64, acks: &Arc<OutstandingAcks>) -> Self {
        Acknowledger::Manual(Arc::new(ManualAck {
            channel,
            delivery_tag,
            pending: Mutex::new(Some(acks.register())),
        }))
    }

    pub fn is_manual(&self) -> bool {
        matches!(self, Acknowledger::Manual(_))
    }

    /// Whether the delivery still awaits an ack or reject. Always false for
    /// auto-ack deliveries.
    pub fn is_pending(&self) -> bool {
        match self {
            Acknowledger::Auto => false,
            Acknowledger::Manual(manual) => manual.is_pending(),
        }
    }

    pub async fn ack(&self) -> Result<(), AmqpError> {
        match self {
            Acknowledger::Auto => Ok(()),
            Acknowledger::Manual(manual) => manual.ack().await,
        }
    }

    pub async fn reject(&self, requeue: bool) -> Result<(), AmqpError> {
        match self {
            Acknowledger::Auto => Ok(()),
            Acknowledger::Manual(manual) => manual.reject(requeue).await,
        }
    }
}

pub struct ManualAck {
    channel: Arc<dyn AmqpChannel>,
    delivery_tag: u64,
    pending: Mutex<Option<Pending>>,
}

impl ManualAck {
    pub fn delivery_tag(&self) -> u64 {
        self.delivery_tag
    }

    fn is_pending(&self) -> bool {
        self.pending
            .lock()
            .map(|pending| pending.is_some())
            .unwrap_or_default()
    }

    fn settle(&self) -> Option<Pending> {
        self.pending.lock().ok().and_then(|mut pending| pending.take())
    }

    async fn ack(&self) -> Result<(), AmqpError> {
        // held until the broker call returns so draining waits for it
        let Some(_pending) = self.settle() else {
            debug!(delivery_tag = self.delivery_tag, "delivery already settled");
            return Ok(());
        };
        self.channel.basic_ack(self.delivery_tag).await
    }

    async fn reject(&self, requeue: bool) -> Result<(), AmqpError> {
        let Some(_pending) = self.settle() else {
            debug!(delivery_tag = self.delivery_tag, "delivery already settled");
            return Ok(());
        };
        self.channel.basic_reject(self.delivery_tag, requeue).await
    }
}

impl Drop for ManualAck {
    fn drop(&mut self) {
        let unsettled = self
            .pending
            .get_mut()
            .map(|pending| pending.take().is_some())
            .unwrap_or_default();

        if unsettled {
            warn!(
                delivery_tag = self.delivery_tag,
                "delivery dropped without ack or reject, the broker redelivers it once the channel closes"
            );
        }
    }
}
