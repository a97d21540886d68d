pub mod client;
pub mod config;
pub mod env;
pub mod message;
pub mod rabbitmq;

pub use client::Client;
pub use config::HutchConfig;
pub use message::{DeliverableMessage, Message, MessageMeta, RawMessage};
pub use rabbitmq::{Broker, BrokerOptions, Exchange, HutchError, MessagePublisher, Queue, Result};
