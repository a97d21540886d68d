// src/rabbitmq/memory.rs
// In-process broker implementing the transport traits. Used by the test suite
// and for running the client without a RabbitMQ server.

use async_trait::async_trait;
use futures::{stream, StreamExt};
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, warn};
use uuid::Uuid;

use super::errors::{HutchError, Result};
use super::transport::{
    BrokerChannel, BrokerConnection, Delivery, DeliveryStream, Publishing, QueueInfo, Transport,
};

/// A message accepted by an exchange, as recorded by the broker.
#[derive(Debug, Clone, PartialEq)]
pub struct PublishedMessage {
    pub exchange: String,
    pub routing_key: String,
    pub publishing: Publishing,
}

#[derive(Clone, Default)]
pub struct MemoryBroker {
    shared: Arc<Shared>,
}

#[derive(Default)]
struct Shared {
    state: Mutex<BrokerState>,
    pending_dial_failures: AtomicUsize,
    dial_attempts: AtomicUsize,
    fail_channel_close: AtomicBool,
    next_id: AtomicU64,
}

#[derive(Default)]
struct BrokerState {
    exchanges: HashMap<String, String>,
    queues: HashMap<String, MemoryQueue>,
    links: Vec<Arc<LinkState>>,
    published: Vec<PublishedMessage>,
}

#[derive(Default)]
struct MemoryQueue {
    bindings: Vec<Binding>,
    consumers: Vec<ConsumerSlot>,
    next_consumer: usize,
    backlog: VecDeque<Delivery>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct Binding {
    exchange: String,
    routing_key: String,
}

struct ConsumerSlot {
    tag: String,
    link_id: u64,
    channel_id: u64,
    sender: mpsc::UnboundedSender<Delivery>,
}

struct LinkState {
    id: u64,
    open: AtomicBool,
    listeners: Mutex<Vec<oneshot::Sender<String>>>,
}

impl MemoryQueue {
    // Round-robin across live consumers; park the message when nobody is listening.
    fn deliver(&mut self, mut delivery: Delivery) {
        while !self.consumers.is_empty() {
            let index = self.next_consumer % self.consumers.len();
            match self.consumers[index].sender.send(delivery) {
                Ok(()) => {
                    self.next_consumer = index + 1;
                    return;
                }
                Err(mpsc::error::SendError(returned)) => {
                    self.consumers.remove(index);
                    delivery = returned;
                }
            }
        }
        self.backlog.push_back(delivery);
    }

    fn flush_backlog(&mut self) {
        let pending: Vec<Delivery> = self.backlog.drain(..).collect();
        for delivery in pending {
            self.deliver(delivery);
        }
    }
}

/// AMQP topic matching: `*` matches exactly one word, `#` zero or more.
pub fn topic_matches(pattern: &str, routing_key: &str) -> bool {
    let pattern: Vec<&str> = pattern.split('.').collect();
    let key: Vec<&str> = routing_key.split('.').collect();
    words_match(&pattern, &key)
}

fn words_match(pattern: &[&str], key: &[&str]) -> bool {
    match pattern.split_first() {
        None => key.is_empty(),
        Some((&"#", rest)) => (0..=key.len()).any(|skip| words_match(rest, &key[skip..])),
        Some((&"*", rest)) => !key.is_empty() && words_match(rest, &key[1..]),
        Some((word, rest)) => key.first() == Some(word) && words_match(rest, &key[1..]),
    }
}

fn binding_matches(kind: &str, binding_key: &str, routing_key: &str) -> bool {
    match kind {
        "fanout" => true,
        "topic" => topic_matches(binding_key, routing_key),
        _ => binding_key == routing_key,
    }
}

impl MemoryBroker {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, BrokerState> {
        self.shared.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn next_id(&self) -> u64 {
        self.shared.next_id.fetch_add(1, Ordering::Relaxed) + 1
    }

    /// The next `count` dial attempts are refused.
    pub fn fail_next_dials(&self, count: usize) {
        self.shared
            .pending_dial_failures
            .store(count, Ordering::SeqCst);
    }

    pub fn dial_attempts(&self) -> usize {
        self.shared.dial_attempts.load(Ordering::SeqCst)
    }

    /// Makes every subsequent channel close report an error.
    pub fn fail_channel_close(&self, fail: bool) {
        self.shared.fail_channel_close.store(fail, Ordering::SeqCst);
    }

    /// Simulates a broker-side disconnect of every open connection. Close
    /// notifications fire and all delivery streams on those links end.
    pub fn drop_connections(&self) -> usize {
        let links: Vec<Arc<LinkState>> = {
            let mut state = self.lock();
            let links: Vec<Arc<LinkState>> = state.links.drain(..).collect();
            for link in &links {
                link.open.store(false, Ordering::SeqCst);
                detach_link(&mut state, link.id);
            }
            links
        };

        for link in &links {
            let listeners: Vec<oneshot::Sender<String>> = link
                .listeners
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .drain(..)
                .collect();
            for listener in listeners {
                let _ = listener.send("connection reset by peer".to_string());
            }
        }
        warn!(dropped = links.len(), "Dropped broker connections");
        links.len()
    }

    pub fn open_connections(&self) -> usize {
        self.lock().links.len()
    }

    pub fn published(&self) -> Vec<PublishedMessage> {
        self.lock().published.clone()
    }

    pub fn exchange_kind(&self, name: &str) -> Option<String> {
        self.lock().exchanges.get(name).cloned()
    }

    pub fn has_queue(&self, name: &str) -> bool {
        self.lock().queues.contains_key(name)
    }

    /// (exchange, routing key) pairs bound to `queue`.
    pub fn bindings(&self, queue: &str) -> Vec<(String, String)> {
        self.lock()
            .queues
            .get(queue)
            .map(|q| {
                q.bindings
                    .iter()
                    .map(|b| (b.exchange.clone(), b.routing_key.clone()))
                    .collect()
            })
            .unwrap_or_default()
    }

    pub fn consumer_tags(&self, queue: &str) -> Vec<String> {
        self.lock()
            .queues
            .get(queue)
            .map(|q| q.consumers.iter().map(|c| c.tag.clone()).collect())
            .unwrap_or_default()
    }

    /// Messages waiting in `queue` with no consumer to take them.
    pub fn queue_depth(&self, queue: &str) -> usize {
        self.lock()
            .queues
            .get(queue)
            .map(|q| q.backlog.len())
            .unwrap_or(0)
    }
}

fn detach_link(state: &mut BrokerState, link_id: u64) {
    for queue in state.queues.values_mut() {
        queue.consumers.retain(|c| c.link_id != link_id);
    }
}

fn detach_channel(state: &mut BrokerState, channel_id: u64) {
    for queue in state.queues.values_mut() {
        queue.consumers.retain(|c| c.channel_id != channel_id);
    }
}

#[async_trait]
impl Transport for MemoryBroker {
    async fn dial(&self, _uri: &str) -> Result<Arc<dyn BrokerConnection>> {
        self.shared.dial_attempts.fetch_add(1, Ordering::SeqCst);
        let refused = self
            .shared
            .pending_dial_failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if refused {
            return Err(HutchError::ConnectionError(
                "connection refused".to_string(),
            ));
        }

        let link = Arc::new(LinkState {
            id: self.next_id(),
            open: AtomicBool::new(true),
            listeners: Mutex::new(Vec::new()),
        });
        self.lock().links.push(link.clone());
        debug!(link_id = link.id, "Memory broker accepted connection");

        Ok(Arc::new(MemoryConnection {
            broker: self.clone(),
            link,
        }))
    }
}

pub struct MemoryConnection {
    broker: MemoryBroker,
    link: Arc<LinkState>,
}

#[async_trait]
impl BrokerConnection for MemoryConnection {
    async fn create_channel(&self) -> Result<Arc<dyn BrokerChannel>> {
        if !self.link.open.load(Ordering::SeqCst) {
            return Err(HutchError::ChannelError(
                "Failed to create channel: connection is closed".to_string(),
            ));
        }
        Ok(Arc::new(MemoryChannel {
            broker: self.broker.clone(),
            link: self.link.clone(),
            id: self.broker.next_id(),
            open: AtomicBool::new(true),
        }))
    }

    fn notify_close(&self) -> oneshot::Receiver<String> {
        let (tx, rx) = oneshot::channel();
        if self.link.open.load(Ordering::SeqCst) {
            self.link
                .listeners
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .push(tx);
        } else {
            let _ = tx.send("connection already closed".to_string());
        }
        rx
    }

    async fn close(&self) -> Result<()> {
        if !self.link.open.swap(false, Ordering::SeqCst) {
            return Err(HutchError::ConnectionError(
                "connection already closed".to_string(),
            ));
        }
        let mut state = self.broker.lock();
        state.links.retain(|l| l.id != self.link.id);
        detach_link(&mut state, self.link.id);
        Ok(())
    }
}

pub struct MemoryChannel {
    broker: MemoryBroker,
    link: Arc<LinkState>,
    id: u64,
    open: AtomicBool,
}

impl MemoryChannel {
    fn ensure_open(&self) -> Result<()> {
        if self.open.load(Ordering::SeqCst) && self.link.open.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(HutchError::ChannelError("channel is closed".to_string()))
        }
    }
}

#[async_trait]
impl BrokerChannel for MemoryChannel {
    async fn exchange_declare(&self, name: &str, kind: &str) -> Result<()> {
        let declare_error = |reason: String| HutchError::DeclareError {
            kind: "exchange",
            name: name.to_string(),
            reason,
        };
        self.ensure_open().map_err(|e| declare_error(e.to_string()))?;
        if name.is_empty() {
            return Err(declare_error("access to the default exchange is refused".into()));
        }

        let mut state = self.broker.lock();
        match state.exchanges.get(name) {
            Some(existing) if existing != kind => Err(declare_error(format!(
                "inequivalent arg 'type': received '{}' but current is '{}'",
                kind, existing
            ))),
            Some(_) => Ok(()),
            None => {
                state.exchanges.insert(name.to_string(), kind.to_string());
                Ok(())
            }
        }
    }

    async fn queue_declare(&self, name: &str) -> Result<QueueInfo> {
        self.ensure_open().map_err(|e| HutchError::DeclareError {
            kind: "queue",
            name: name.to_string(),
            reason: e.to_string(),
        })?;

        let name = if name.is_empty() {
            format!("amq.gen-{}", Uuid::new_v4().simple())
        } else {
            name.to_string()
        };
        let mut state = self.broker.lock();
        let queue = state.queues.entry(name.clone()).or_default();
        Ok(QueueInfo {
            name,
            message_count: queue.backlog.len() as u32,
            consumer_count: queue.consumers.len() as u32,
        })
    }

    async fn queue_bind(&self, queue: &str, exchange: &str, routing_key: &str) -> Result<()> {
        let bind_error = |reason: String| HutchError::BindError {
            queue: queue.to_string(),
            exchange: exchange.to_string(),
            routing_key: routing_key.to_string(),
            reason,
        };
        self.ensure_open().map_err(|e| bind_error(e.to_string()))?;

        let mut state = self.broker.lock();
        if !state.exchanges.contains_key(exchange) {
            return Err(bind_error(format!("no exchange '{}'", exchange)));
        }
        let target = state
            .queues
            .get_mut(queue)
            .ok_or_else(|| bind_error(format!("no queue '{}'", queue)))?;

        let binding = Binding {
            exchange: exchange.to_string(),
            routing_key: routing_key.to_string(),
        };
        if !target.bindings.contains(&binding) {
            target.bindings.push(binding);
        }
        Ok(())
    }

    async fn qos(&self, _prefetch_count: u16) -> Result<()> {
        self.ensure_open()
    }

    async fn consume(&self, queue: &str, consumer_tag: &str) -> Result<DeliveryStream> {
        self.ensure_open()
            .map_err(|e| HutchError::ConsumeError(e.to_string()))?;

        let (sender, receiver) = mpsc::unbounded_channel();
        {
            let mut state = self.broker.lock();
            let target = state
                .queues
                .get_mut(queue)
                .ok_or_else(|| HutchError::ConsumeError(format!("no queue '{}'", queue)))?;
            if target.consumers.iter().any(|c| c.tag == consumer_tag) {
                return Err(HutchError::ConsumeError(format!(
                    "consumer tag '{}' already in use",
                    consumer_tag
                )));
            }
            target.consumers.push(ConsumerSlot {
                tag: consumer_tag.to_string(),
                link_id: self.link.id,
                channel_id: self.id,
                sender,
            });
            target.flush_backlog();
        }

        let deliveries = stream::unfold(receiver, |mut receiver| async move {
            receiver.recv().await.map(|delivery| (delivery, receiver))
        });
        Ok(deliveries.boxed())
    }

    async fn cancel_consumer(&self, consumer_tag: &str) -> Result<()> {
        self.ensure_open()
            .map_err(|e| HutchError::ConsumeError(e.to_string()))?;
        let mut state = self.broker.lock();
        for queue in state.queues.values_mut() {
            queue
                .consumers
                .retain(|c| !(c.channel_id == self.id && c.tag == consumer_tag));
        }
        Ok(())
    }

    async fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        publishing: Publishing,
    ) -> Result<()> {
        self.ensure_open()
            .map_err(|e| HutchError::PublishError(e.to_string()))?;

        let delivery = Delivery {
            message_id: Some(publishing.message_id.clone()),
            kind: Some(publishing.kind.clone()),
            content_type: Some(publishing.content_type.clone()),
            exchange: exchange.to_string(),
            routing_key: routing_key.to_string(),
            body: publishing.body.clone(),
        };

        let mut state = self.broker.lock();
        if exchange.is_empty() {
            if let Some(queue) = state.queues.get_mut(routing_key) {
                queue.deliver(delivery);
            }
        } else {
            let kind = state.exchanges.get(exchange).cloned().ok_or_else(|| {
                HutchError::PublishError(format!("no exchange '{}'", exchange))
            })?;
            for queue in state.queues.values_mut() {
                let routed = queue.bindings.iter().any(|b| {
                    b.exchange == exchange && binding_matches(&kind, &b.routing_key, routing_key)
                });
                if routed {
                    queue.deliver(delivery.clone());
                }
            }
        }

        state.published.push(PublishedMessage {
            exchange: exchange.to_string(),
            routing_key: routing_key.to_string(),
            publishing,
        });
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        self.open.store(false, Ordering::SeqCst);
        detach_channel(&mut self.broker.lock(), self.id);
        if self.broker.shared.fail_channel_close.load(Ordering::SeqCst) {
            return Err(HutchError::ChannelError(format!(
                "channel {} refused to close",
                self.id
            )));
        }
        Ok(())
    }
}
