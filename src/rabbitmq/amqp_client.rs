// src/rabbitmq/amqp_client.rs
// lapin-backed transport used against a real RabbitMQ server.

use async_trait::async_trait;
use futures::{future, StreamExt};
use lapin::{
    options::{
        BasicCancelOptions, BasicConsumeOptions, BasicPublishOptions, BasicQosOptions,
        ExchangeDeclareOptions,
        QueueBindOptions, QueueDeclareOptions,
    },
    types::FieldTable,
    BasicProperties, Channel, Connection, ConnectionProperties, ExchangeKind,
};
use std::sync::{Arc, Mutex};
use tokio::sync::oneshot;
use tracing::{debug, warn};

use super::errors::{HutchError, Result};
use super::transport::{
    BrokerChannel, BrokerConnection, Delivery, DeliveryStream, Publishing, QueueInfo, Transport,
};

const REPLY_SUCCESS: u16 = 200;

type CloseListeners = Arc<Mutex<Vec<oneshot::Sender<String>>>>;

#[derive(Debug, Clone, Default)]
pub struct LapinTransport {
    connection_name: Option<String>,
}

impl LapinTransport {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_connection_name(mut self, name: impl Into<String>) -> Self {
        self.connection_name = Some(name.into());
        self
    }
}

pub fn connection_properties(connection_name: Option<&str>) -> ConnectionProperties {
    let properties = ConnectionProperties::default();
    match connection_name {
        Some(name) => properties.with_connection_name(name.to_string().into()),
        None => properties,
    }
}

pub fn exchange_kind(kind: &str) -> ExchangeKind {
    match kind {
        "topic" => ExchangeKind::Topic,
        "direct" => ExchangeKind::Direct,
        "fanout" => ExchangeKind::Fanout,
        "headers" => ExchangeKind::Headers,
        other => ExchangeKind::Custom(other.to_string()),
    }
}

#[async_trait]
impl Transport for LapinTransport {
    async fn dial(&self, uri: &str) -> Result<Arc<dyn BrokerConnection>> {
        let connection =
            Connection::connect(uri, connection_properties(self.connection_name.as_deref()))
                .await
                .map_err(|e| HutchError::ConnectionError(format!("Failed to connect: {}", e)))?;

        let listeners: CloseListeners = Arc::new(Mutex::new(Vec::new()));
        let notify = listeners.clone();
        connection.on_error(move |err| {
            warn!("RabbitMQ connection error: {}", err);
            fire_close_listeners(&notify, &err.to_string());
        });

        Ok(Arc::new(LapinConnection {
            connection,
            listeners,
        }))
    }
}

fn fire_close_listeners(listeners: &CloseListeners, reason: &str) {
    let drained: Vec<oneshot::Sender<String>> = match listeners.lock() {
        Ok(mut guard) => guard.drain(..).collect(),
        Err(poisoned) => poisoned.into_inner().drain(..).collect(),
    };
    for listener in drained {
        let _ = listener.send(reason.to_string());
    }
}

// The connected check runs under the registry lock, so a listener is either
// registered before `on_error` drains or resolved here.
fn register_close_listener<F>(listeners: &CloseListeners, connected: F) -> oneshot::Receiver<String>
where
    F: FnOnce() -> bool,
{
    let (tx, rx) = oneshot::channel();
    let mut guard = match listeners.lock() {
        Ok(guard) => guard,
        Err(_) => {
            let _ = tx.send("close listener registry poisoned".to_string());
            return rx;
        }
    };
    if connected() {
        guard.push(tx);
    } else {
        let _ = tx.send("connection already closed".to_string());
    }
    rx
}

pub struct LapinConnection {
    connection: Connection,
    listeners: CloseListeners,
}

#[async_trait]
impl BrokerConnection for LapinConnection {
    async fn create_channel(&self) -> Result<Arc<dyn BrokerChannel>> {
        let channel = self
            .connection
            .create_channel()
            .await
            .map_err(|e| HutchError::ChannelError(format!("Failed to create channel: {}", e)))?;
        debug!(channel_id = channel.id(), "Opened channel");
        Ok(Arc::new(LapinChannel { channel }))
    }

    fn notify_close(&self) -> oneshot::Receiver<String> {
        register_close_listener(&self.listeners, || self.connection.status().connected())
    }

    async fn close(&self) -> Result<()> {
        self.connection
            .close(REPLY_SUCCESS, "Closing connection")
            .await
            .map_err(|e| HutchError::ConnectionError(e.to_string()))
    }
}

pub struct LapinChannel {
    channel: Channel,
}

fn into_delivery(delivery: lapin::message::Delivery) -> Delivery {
    let properties = &delivery.properties;
    Delivery {
        message_id: properties.message_id().as_ref().map(|s| s.as_str().to_owned()),
        kind: properties.kind().as_ref().map(|s| s.as_str().to_owned()),
        content_type: properties.content_type().as_ref().map(|s| s.as_str().to_owned()),
        exchange: delivery.exchange.as_str().to_owned(),
        routing_key: delivery.routing_key.as_str().to_owned(),
        body: delivery.data,
    }
}

#[async_trait]
impl BrokerChannel for LapinChannel {
    async fn exchange_declare(&self, name: &str, kind: &str) -> Result<()> {
        self.channel
            .exchange_declare(
                name,
                exchange_kind(kind),
                ExchangeDeclareOptions {
                    durable: true,
                    ..ExchangeDeclareOptions::default()
                },
                FieldTable::default(),
            )
            .await
            .map_err(|e| HutchError::DeclareError {
                kind: "exchange",
                name: name.to_string(),
                reason: e.to_string(),
            })
    }

    async fn queue_declare(&self, name: &str) -> Result<QueueInfo> {
        let queue = self
            .channel
            .queue_declare(
                name,
                QueueDeclareOptions {
                    durable: true,
                    ..QueueDeclareOptions::default()
                },
                FieldTable::default(),
            )
            .await
            .map_err(|e| HutchError::DeclareError {
                kind: "queue",
                name: name.to_string(),
                reason: e.to_string(),
            })?;

        Ok(QueueInfo {
            name: queue.name().as_str().to_owned(),
            message_count: queue.message_count(),
            consumer_count: queue.consumer_count(),
        })
    }

    async fn queue_bind(&self, queue: &str, exchange: &str, routing_key: &str) -> Result<()> {
        self.channel
            .queue_bind(
                queue,
                exchange,
                routing_key,
                QueueBindOptions::default(),
                FieldTable::default(),
            )
            .await
            .map_err(|e| HutchError::BindError {
                queue: queue.to_string(),
                exchange: exchange.to_string(),
                routing_key: routing_key.to_string(),
                reason: e.to_string(),
            })
    }

    async fn qos(&self, prefetch_count: u16) -> Result<()> {
        self.channel
            .basic_qos(prefetch_count, BasicQosOptions::default())
            .await
            .map_err(|e| HutchError::ChannelError(format!("Failed to set QoS: {}", e)))
    }

    async fn consume(&self, queue: &str, consumer_tag: &str) -> Result<DeliveryStream> {
        let consumer = self
            .channel
            .basic_consume(
                queue,
                consumer_tag,
                BasicConsumeOptions {
                    no_ack: true,
                    ..BasicConsumeOptions::default()
                },
                FieldTable::default(),
            )
            .await
            .map_err(|e| HutchError::ConsumeError(e.to_string()))?;

        let tag = consumer_tag.to_string();
        let stream = consumer
            .inspect(move |delivery| {
                if let Err(e) = delivery {
                    warn!(consumer = %tag, "Consumer stream failed: {}", e);
                }
            })
            .take_while(|delivery| future::ready(delivery.is_ok()))
            .filter_map(|delivery| future::ready(delivery.ok().map(into_delivery)))
            .boxed();

        Ok(stream)
    }

    async fn cancel_consumer(&self, consumer_tag: &str) -> Result<()> {
        self.channel
            .basic_cancel(consumer_tag, BasicCancelOptions::default())
            .await
            .map_err(|e| HutchError::ConsumeError(format!("Failed to cancel {}: {}", consumer_tag, e)))
    }

    async fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        publishing: Publishing,
    ) -> Result<()> {
        let properties = BasicProperties::default()
            .with_content_type(publishing.content_type.into())
            .with_message_id(publishing.message_id.into())
            .with_kind(publishing.kind.into())
            .with_timestamp(publishing.timestamp.timestamp() as u64);

        // No confirm mode, so the returned PublisherConfirm is not awaited.
        self.channel
            .basic_publish(
                exchange,
                routing_key,
                BasicPublishOptions {
                    mandatory: false,
                    immediate: false,
                },
                &publishing.body,
                properties,
            )
            .await
            .map_err(|e| HutchError::PublishError(e.to_string()))?;

        Ok(())
    }

    async fn close(&self) -> Result<()> {
        self.channel
            .close(REPLY_SUCCESS, "Closing channel")
            .await
            .map_err(|e| HutchError::ChannelError(e.to_string()))
    }
}
