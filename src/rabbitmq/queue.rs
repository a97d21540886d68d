// src/rabbitmq/queue.rs

use futures::StreamExt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info, warn};

use super::connection::Broker;
use super::errors::{HutchError, Result};
use super::exchange::Exchange;
use super::transport::{BrokerChannel, Delivery, DeliveryStream, QueueInfo};
use crate::message::RawMessage;

pub type MessageHandlerFunc = Arc<dyn Fn(RawMessage) + Send + Sync>;

/// A declared durable queue.
///
/// Deliveries are auto-acknowledged: the broker considers a message handled
/// as soon as it is delivered, so a handler that panics or gives up loses the
/// message rather than getting it redelivered.
pub struct Queue {
    name: String,
    channel: Arc<dyn BrokerChannel>,
    info: QueueInfo,
    workers: TaskTracker,
    worker_count: usize,
    prefetch_count: u16,
    subscribing: Mutex<()>,
    waiting: Mutex<()>,
}

/// Why a consumer worker stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerExit {
    Cancelled,
    ConnectionDropped,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SubscriptionExit {
    pub workers: usize,
    pub connection_dropped: bool,
}

/// The worker group started by one [`Queue::subscribe`] call.
pub struct Subscription {
    queue: String,
    token: CancellationToken,
    handles: Vec<JoinHandle<WorkerExit>>,
    connection_dropped: Arc<AtomicBool>,
}

impl Broker {
    /// Opens a channel (waiting for a connection if needed) and declares a
    /// durable queue on it.
    pub async fn new_queue(&self, name: &str) -> Result<Queue> {
        let channel = self.create_channel().await?;
        let info = channel.queue_declare(name).await?;
        info!(
            queue = %info.name,
            messages = info.message_count,
            consumers = info.consumer_count,
            "Declared queue"
        );

        let options = self.options();
        Ok(Queue {
            name: info.name.clone(),
            channel,
            info,
            workers: TaskTracker::new(),
            worker_count: options.consumer_workers.max(1),
            prefetch_count: options.prefetch_count,
            subscribing: Mutex::new(()),
            waiting: Mutex::new(()),
        })
    }
}

impl Queue {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn info(&self) -> &QueueInfo {
        &self.info
    }

    pub async fn bind(&self, exchange: &Exchange, routing_key: &str) -> Result<()> {
        self.bind_to(exchange.name(), routing_key).await
    }

    /// Binds to an exchange by name, for exchanges declared elsewhere.
    pub async fn bind_to(&self, exchange: &str, routing_key: &str) -> Result<()> {
        self.channel
            .queue_bind(&self.name, exchange, routing_key)
            .await?;
        info!(queue = %self.name, exchange = %exchange, routing_key = %routing_key, "Bound queue");
        Ok(())
    }

    /// Starts the consumer workers for this queue.
    ///
    /// Each worker gets its own consumer tag (`<queue>-consumer-<n>`) and calls
    /// `handler` inline, so handling is sequential per worker and parallel
    /// across workers. Bodies that fail to decode are dropped. Workers stop
    /// when `cancel` fires or their delivery stream ends; nothing resubscribes
    /// after a reconnect.
    ///
    /// One subscription per queue at a time: while workers from an earlier
    /// call are still running this fails with [`HutchError::ConsumeError`]
    /// without touching the channel. A cancelled worker releases its consumer
    /// tag before it exits, so `wait_workers` followed by `subscribe` is fine.
    pub async fn subscribe<F>(&self, cancel: &CancellationToken, handler: F) -> Result<Subscription>
    where
        F: Fn(RawMessage) + Send + Sync + 'static,
    {
        let token = cancel.child_token();
        let connection_dropped = Arc::new(AtomicBool::new(false));
        let mut subscription = Subscription {
            queue: self.name.clone(),
            token: token.clone(),
            handles: Vec::with_capacity(self.worker_count),
            connection_dropped: connection_dropped.clone(),
        };

        if cancel.is_cancelled() {
            debug!(queue = %self.name, "Subscribe called after cancellation");
            return Ok(subscription);
        }

        let _subscribing = self.subscribing.lock().await;
        if !self.workers.is_empty() {
            return Err(HutchError::ConsumeError(format!(
                "queue '{}' already has {} active consumer worker(s)",
                self.name,
                self.workers.len()
            )));
        }

        self.channel.qos(self.prefetch_count).await?;

        let handler: MessageHandlerFunc = Arc::new(handler);
        for index in 1..=self.worker_count {
            let tag = format!("{}-consumer-{}", self.name, index);
            let deliveries = match self.channel.consume(&self.name, &tag).await {
                Ok(deliveries) => deliveries,
                Err(e) => {
                    token.cancel();
                    return Err(e);
                }
            };
            subscription.handles.push(self.workers.spawn(run_worker(
                tag,
                self.channel.clone(),
                deliveries,
                token.clone(),
                handler.clone(),
                connection_dropped.clone(),
            )));
        }

        info!(queue = %self.name, workers = self.worker_count, "Subscribed to queue");
        Ok(subscription)
    }

    /// Workers currently running across every subscription on this queue.
    pub fn active_workers(&self) -> usize {
        self.workers.len()
    }

    /// Waits until every worker started on this queue has exited. Concurrent
    /// callers take turns.
    pub async fn wait_workers(&self) {
        let _waiting = self.waiting.lock().await;
        self.workers.close();
        self.workers.wait().await;
        self.workers.reopen();
    }
}

impl Subscription {
    pub fn queue(&self) -> &str {
        &self.queue
    }

    pub fn worker_count(&self) -> usize {
        self.handles.len()
    }

    pub fn cancel(&self) {
        self.token.cancel();
    }

    /// Set once any worker saw its delivery stream end.
    pub fn connection_dropped(&self) -> bool {
        self.connection_dropped.load(Ordering::Acquire)
    }

    pub async fn join(self) -> SubscriptionExit {
        let workers = self.handles.len();
        for handle in self.handles {
            if let Err(e) = handle.await {
                error!(queue = %self.queue, "Consumer worker failed: {}", e);
            }
        }
        SubscriptionExit {
            workers,
            connection_dropped: self.connection_dropped.load(Ordering::Acquire),
        }
    }
}

fn decode_delivery(delivery: &Delivery) -> Result<RawMessage> {
    RawMessage::decode(
        &delivery.body,
        delivery.message_id.clone().unwrap_or_default(),
        delivery.kind.clone().unwrap_or_default(),
    )
}

async fn run_worker(
    tag: String,
    channel: Arc<dyn BrokerChannel>,
    deliveries: DeliveryStream,
    cancel: CancellationToken,
    handler: MessageHandlerFunc,
    connection_dropped: Arc<AtomicBool>,
) -> WorkerExit {
    debug!(consumer = %tag, "Consumer worker started");
    let exit = consume_loop(&tag, deliveries, &cancel, &handler, &connection_dropped).await;
    if exit == WorkerExit::Cancelled {
        if let Err(e) = channel.cancel_consumer(&tag).await {
            debug!(consumer = %tag, "Failed to cancel consumer: {}", e);
        }
    }
    exit
}

async fn consume_loop(
    tag: &str,
    mut deliveries: DeliveryStream,
    cancel: &CancellationToken,
    handler: &MessageHandlerFunc,
    connection_dropped: &AtomicBool,
) -> WorkerExit {
    loop {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                debug!(consumer = %tag, "Consumer worker cancelled");
                return WorkerExit::Cancelled;
            }
            next = deliveries.next() => {
                let Some(delivery) = next else {
                    connection_dropped.store(true, Ordering::Release);
                    warn!(consumer = %tag, "Delivery stream closed, connection dropped");
                    return WorkerExit::ConnectionDropped;
                };
                match decode_delivery(&delivery) {
                    Ok(message) => handler(message),
                    Err(e) => debug!(
                        consumer = %tag,
                        message_id = ?delivery.message_id,
                        "Skipping undecodable message: {}",
                        e
                    ),
                }
            }
        }
    }
}
