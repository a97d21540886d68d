// src/client.rs
// Convenience entry point bundling a broker with topic-exchange defaults.

use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::config::HutchConfig;
use crate::rabbitmq::amqp_client::LapinTransport;
use crate::rabbitmq::connection::{Broker, BrokerOptions};
use crate::rabbitmq::errors::Result;
use crate::rabbitmq::exchange::Exchange;
use crate::rabbitmq::queue::Queue;
use crate::rabbitmq::transport::Transport;

pub const TOPIC_EXCHANGE: &str = "topic";

pub struct Client {
    broker: Broker,
}

impl Client {
    /// Starts connecting to `uri` over AMQP with default options. Returns
    /// immediately; the first connection is made in the background.
    pub fn new(uri: &str, cancel: &CancellationToken) -> Self {
        Self::with_transport(uri, Arc::new(LapinTransport::new()), BrokerOptions::default(), cancel)
    }

    pub fn from_config(config: &HutchConfig, cancel: &CancellationToken) -> Self {
        let mut transport = LapinTransport::new();
        if let Some(name) = &config.connection.connection_name {
            transport = transport.with_connection_name(name.clone());
        }
        Self::with_transport(
            &config.connection.uri,
            Arc::new(transport),
            config.broker_options(),
            cancel,
        )
    }

    pub fn with_transport(
        uri: &str,
        transport: Arc<dyn Transport>,
        options: BrokerOptions,
        cancel: &CancellationToken,
    ) -> Self {
        Client {
            broker: Broker::start(uri, transport, options, cancel),
        }
    }

    pub fn broker(&self) -> &Broker {
        &self.broker
    }

    pub async fn new_topic_exchange(&self, name: &str) -> Result<Exchange> {
        self.broker.new_exchange(name, TOPIC_EXCHANGE).await
    }

    pub async fn new_queue(&self, name: &str) -> Result<Queue> {
        self.broker.new_queue(name).await
    }

    pub async fn close(&self) -> Result<()> {
        info!("Closing client");
        self.broker.shutdown().await
    }
}
