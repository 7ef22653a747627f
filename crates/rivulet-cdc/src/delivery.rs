//! Fan-in delivery path
//!
//! Every table monitor pushes into one shared channel; a single reader drains
//! it in arrival order and hands each event to the [`Publisher`].
//!
//! The channel is unbounded unless a capacity is configured. With a capacity,
//! producers wait for room (the monitor abandons the wait on cancellation);
//! events are never dropped.

use async_trait::async_trait;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, error, info};

use crate::common::{CdcError, ChangeEvent, EventEmitter, Publisher, Result};

/// Counters shared between the producers and the reader.
#[derive(Debug, Default)]
pub struct DeliveryStats {
    enqueued: AtomicU64,
    delivered: AtomicU64,
    failed: AtomicU64,
}

impl DeliveryStats {
    pub fn snapshot(&self) -> DeliveryStatsSnapshot {
        DeliveryStatsSnapshot {
            enqueued: self.enqueued.load(Ordering::Relaxed),
            delivered: self.delivered.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
        }
    }
}

/// Snapshot of delivery counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct DeliveryStatsSnapshot {
    /// Events accepted into the channel
    pub enqueued: u64,
    /// Events the publisher accepted
    pub delivered: u64,
    /// Events the publisher rejected
    pub failed: u64,
}

impl DeliveryStatsSnapshot {
    /// Events accepted into the channel but not yet handed to the publisher
    pub fn pending(&self) -> u64 {
        self.enqueued
            .saturating_sub(self.delivered.saturating_add(self.failed))
    }
}

#[derive(Debug, Clone)]
enum SenderInner {
    Unbounded(mpsc::UnboundedSender<ChangeEvent>),
    Bounded(mpsc::Sender<ChangeEvent>),
}

/// Producer side of the delivery channel; cloned into every monitor.
#[derive(Debug, Clone)]
pub struct DeliverySender {
    inner: SenderInner,
    stats: Arc<DeliveryStats>,
}

#[derive(Debug)]
enum ReceiverInner {
    Unbounded(mpsc::UnboundedReceiver<ChangeEvent>),
    Bounded(mpsc::Receiver<ChangeEvent>),
}

/// Consumer side of the delivery channel.
#[derive(Debug)]
pub struct DeliveryReceiver {
    inner: ReceiverInner,
    stats: Arc<DeliveryStats>,
}

/// Create a delivery channel. `None` means unbounded.
pub fn channel(capacity: Option<usize>) -> (DeliverySender, DeliveryReceiver) {
    let stats = Arc::new(DeliveryStats::default());
    let (tx, rx) = match capacity {
        Some(capacity) => {
            let (tx, rx) = mpsc::channel(capacity.max(1));
            (SenderInner::Bounded(tx), ReceiverInner::Bounded(rx))
        }
        None => {
            let (tx, rx) = mpsc::unbounded_channel();
            (SenderInner::Unbounded(tx), ReceiverInner::Unbounded(rx))
        }
    };

    (
        DeliverySender {
            inner: tx,
            stats: stats.clone(),
        },
        DeliveryReceiver { inner: rx, stats },
    )
}

impl DeliverySender {
    pub async fn send(&self, event: ChangeEvent) -> Result<()> {
        match &self.inner {
            SenderInner::Unbounded(tx) => tx.send(event).map_err(|_| CdcError::ChannelClosed)?,
            SenderInner::Bounded(tx) => tx.send(event).await.map_err(|_| CdcError::ChannelClosed)?,
        }
        self.stats.enqueued.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    pub fn stats(&self) -> Arc<DeliveryStats> {
        self.stats.clone()
    }
}

#[async_trait]
impl EventEmitter for DeliverySender {
    async fn emit(&self, event: ChangeEvent) -> Result<()> {
        self.send(event).await
    }
}

impl DeliveryReceiver {
    /// Next event in arrival order; `None` once every sender is gone and
    /// the queue is empty.
    pub async fn recv(&mut self) -> Option<ChangeEvent> {
        match &mut self.inner {
            ReceiverInner::Unbounded(rx) => rx.recv().await,
            ReceiverInner::Bounded(rx) => rx.recv().await,
        }
    }

    pub fn stats(&self) -> Arc<DeliveryStats> {
        self.stats.clone()
    }

    /// Drain the channel into `publisher` until every sender is dropped.
    ///
    /// Publisher failures are logged and counted; the reader keeps going.
    pub async fn run(mut self, publisher: Arc<dyn Publisher>) -> DeliveryStatsSnapshot {
        info!(publisher = publisher.name(), "Delivery reader started");

        while let Some(event) = self.recv().await {
            match publisher.send(&event).await {
                Ok(()) => {
                    self.stats.delivered.fetch_add(1, Ordering::Relaxed);
                    debug!(
                        table = %event.table,
                        op = %event.op,
                        position = %event.position,
                        "Delivered change"
                    );
                }
                Err(e) => {
                    self.stats.failed.fetch_add(1, Ordering::Relaxed);
                    error!(
                        table = %event.table,
                        op = %event.op,
                        position = %event.position,
                        publisher = publisher.name(),
                        error = %e,
                        category = ?e.category(),
                        "Publisher rejected change"
                    );
                }
            }
        }

        let stats = self.stats.snapshot();
        info!(
            delivered = stats.delivered,
            failed = stats.failed,
            "Delivery reader drained"
        );
        stats
    }
}
