// src/rabbitmq/transport.rs
// The narrow surface the supervisor, exchanges and queues need from an AMQP client.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::stream::BoxStream;
use std::sync::Arc;
use tokio::sync::oneshot;

use super::errors::Result;

/// Outbound message properties. Headers, priority, correlation id, reply-to,
/// expiration and app/user id are deliberately not populated.
#[derive(Debug, Clone, PartialEq)]
pub struct Publishing {
    pub content_type: String,
    pub message_id: String,
    pub kind: String,
    pub timestamp: DateTime<Utc>,
    pub body: Vec<u8>,
}

/// A message received from a queue.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Delivery {
    pub message_id: Option<String>,
    pub kind: Option<String>,
    pub content_type: Option<String>,
    pub exchange: String,
    pub routing_key: String,
    pub body: Vec<u8>,
}

/// Metadata returned by a queue declaration.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct QueueInfo {
    pub name: String,
    pub message_count: u32,
    pub consumer_count: u32,
}

/// Deliveries for a single consumer. The stream ends when the channel or its
/// connection goes away.
pub type DeliveryStream = BoxStream<'static, Delivery>;

#[async_trait]
pub trait Transport: Send + Sync {
    async fn dial(&self, uri: &str) -> Result<Arc<dyn BrokerConnection>>;
}

#[async_trait]
pub trait BrokerConnection: Send + Sync {
    async fn create_channel(&self) -> Result<Arc<dyn BrokerChannel>>;

    /// Fresh close-notification subscription. Resolves once with the reason
    /// when the connection is lost.
    fn notify_close(&self) -> oneshot::Receiver<String>;

    async fn close(&self) -> Result<()>;
}

#[async_trait]
pub trait BrokerChannel: Send + Sync {
    async fn exchange_declare(&self, name: &str, kind: &str) -> Result<()>;

    async fn queue_declare(&self, name: &str) -> Result<QueueInfo>;

    async fn queue_bind(&self, queue: &str, exchange: &str, routing_key: &str) -> Result<()>;

    async fn qos(&self, prefetch_count: u16) -> Result<()>;

    /// Starts an auto-acknowledged consumer on `queue`.
    async fn consume(&self, queue: &str, consumer_tag: &str) -> Result<DeliveryStream>;

    /// Stops the consumer registered under `consumer_tag`, freeing the tag.
    async fn cancel_consumer(&self, consumer_tag: &str) -> Result<()>;

    async fn publish(&self, exchange: &str, routing_key: &str, publishing: Publishing)
        -> Result<()>;

    async fn close(&self) -> Result<()>;
}
