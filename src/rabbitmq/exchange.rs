// src/rabbitmq/exchange.rs

use async_trait::async_trait;
use chrono::Utc;
use std::sync::{Arc, RwLock};
use tracing::{debug, info};
use uuid::Uuid;

use super::connection::Broker;
use super::errors::{HutchError, Result};
use super::transport::{BrokerChannel, Publishing};
use crate::message::{DeliverableMessage, EncodableMessage, RawMessage};

#[async_trait]
pub trait MessagePublisher: Send + Sync {
    async fn publish(&self, message: &dyn DeliverableMessage, routing_key: &str) -> Result<()>;
}

/// A declared exchange and the channel used to publish to it.
///
/// Publishing is not serialized internally: concurrent publishers sharing an
/// exchange must coordinate among themselves, and must not publish while the
/// channel is being closed. Failed publishes are returned, never retried.
pub struct Exchange {
    name: String,
    kind: String,
    channel: RwLock<Arc<dyn BrokerChannel>>,
}

impl Broker {
    /// Opens a channel (waiting for a connection if needed) and declares a
    /// durable exchange on it.
    pub async fn new_exchange(&self, name: &str, kind: &str) -> Result<Exchange> {
        let channel = self.create_channel().await?;
        channel.exchange_declare(name, kind).await?;
        info!(exchange = %name, kind = %kind, "Declared exchange");

        Ok(Exchange {
            name: name.to_string(),
            kind: kind.to_string(),
            channel: RwLock::new(channel),
        })
    }
}

impl Exchange {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn kind(&self) -> &str {
        &self.kind
    }

    /// Swaps the channel used for publishing, e.g. after a reconnect. The
    /// exchange name stays the same.
    pub fn update_channel(&self, channel: Arc<dyn BrokerChannel>) -> Result<()> {
        let mut guard = self
            .channel
            .write()
            .map_err(|_| HutchError::LockError("exchange channel"))?;
        *guard = channel;
        Ok(())
    }

    fn channel(&self) -> Result<Arc<dyn BrokerChannel>> {
        self.channel
            .read()
            .map(|guard| guard.clone())
            .map_err(|_| HutchError::LockError("exchange channel"))
    }

    pub async fn publish_raw(&self, message: &RawMessage, routing_key: &str) -> Result<()> {
        let body = message.encode()?;

        let publishing = Publishing {
            content_type: message.content_type().to_string(),
            message_id: Uuid::new_v4().to_string(),
            kind: message.kind().to_string(),
            timestamp: Utc::now(),
            body,
        };
        let message_id = publishing.message_id.clone();

        self.channel()?
            .publish(&self.name, routing_key, publishing)
            .await?;

        debug!(
            exchange = %self.name,
            routing_key = %routing_key,
            message_id = %message_id,
            "Published message"
        );
        Ok(())
    }
}

#[async_trait]
impl MessagePublisher for Exchange {
    async fn publish(&self, message: &dyn DeliverableMessage, routing_key: &str) -> Result<()> {
        let raw = message.marshal_raw()?;
        self.publish_raw(&raw, routing_key).await
    }
}
