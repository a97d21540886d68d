// src/rabbitmq/mod.rs
// RabbitMQ connection supervision, exchanges and queue consumers.

pub mod errors;
pub mod transport;
pub mod connection;
pub mod channel_manager;
pub mod exchange;
pub mod queue;
pub mod amqp_client;
pub mod memory;

pub use amqp_client::LapinTransport;
pub use channel_manager::ChannelRegistry;
pub use connection::{Broker, BrokerOptions, BrokerStats, ConnectionState, ReconnectPolicy};
pub use errors::{HutchError, Result};
pub use exchange::{Exchange, MessagePublisher};
pub use memory::MemoryBroker;
pub use queue::{MessageHandlerFunc, Queue, Subscription, SubscriptionExit, WorkerExit};
pub use transport::{
    BrokerChannel, BrokerConnection, Delivery, DeliveryStream, Publishing, QueueInfo, Transport,
};
