// src/main.rs
// Demo process: publishes and consumes `order.created` events until Ctrl-C.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use rust_hutch::config::{self, HutchConfig};
use rust_hutch::env::apply_env;
use rust_hutch::message::{Message, MessageMeta};
use rust_hutch::rabbitmq::{HutchError, MessagePublisher};
use rust_hutch::Client;

const ORDERS_EXCHANGE: &str = "orders";
const ORDERS_CREATED_QUEUE: &str = "orders.created";
const ORDER_CREATED: &str = "order.created";

#[derive(Debug, Serialize, Deserialize)]
struct OrderCreated {
    order_id: String,
    amount: u64,
}

fn load_configuration() -> Result<HutchConfig> {
    let mut config = match config::load_config() {
        Ok(config) => config,
        Err(e) => {
            warn!("Using default configuration: {}", e);
            HutchConfig::default()
        }
    };
    apply_env(&mut config).context("Invalid HUTCH_* environment override")?;
    Ok(config)
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let config = load_configuration()?;
    let cancel = CancellationToken::new();

    let signal_cancel = cancel.clone();
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => info!("Ctrl-C received, shutting down"),
            Err(e) => error!("Failed to listen for Ctrl-C: {}", e),
        }
        signal_cancel.cancel();
    });

    let client = Client::from_config(&config, &cancel);

    match run(&client, &cancel).await {
        Err(e) if stopped_before_ready(&e, &cancel) => {
            info!("Cancelled before the broker was ready")
        }
        result => result?,
    }

    client.close().await.context("Failed to close client cleanly")?;
    info!("Shutdown complete");
    Ok(())
}

// Ctrl-C while still dialing surfaces as `BrokerClosed`; that is a clean stop.
fn stopped_before_ready(err: &anyhow::Error, cancel: &CancellationToken) -> bool {
    cancel.is_cancelled() && matches!(err.downcast_ref::<HutchError>(), Some(HutchError::BrokerClosed))
}

async fn run(client: &Client, cancel: &CancellationToken) -> Result<()> {
    let exchange = client
        .new_topic_exchange(ORDERS_EXCHANGE)
        .await
        .context("Failed to declare orders exchange")?;
    let queue = client
        .new_queue(ORDERS_CREATED_QUEUE)
        .await
        .context("Failed to declare orders queue")?;
    queue
        .bind(&exchange, ORDER_CREATED)
        .await
        .context("Failed to bind orders queue")?;

    let subscription = queue
        .subscribe(cancel, |message| match message.data_as::<OrderCreated>() {
            Ok(order) => info!(kind = %message.kind(), id = %message.id(), ?order, "Received order"),
            Err(e) => warn!(id = %message.id(), "Unexpected order payload: {}", e),
        })
        .await
        .context("Failed to subscribe to orders queue")?;

    let order = Message::new(
        MessageMeta::generate(ORDER_CREATED, "1"),
        OrderCreated {
            order_id: uuid::Uuid::new_v4().to_string(),
            amount: 42,
        },
    );
    exchange
        .publish(&order, ORDER_CREATED)
        .await
        .context("Failed to publish order")?;
    info!(order_id = %order.data.order_id, "Published order");

    cancel.cancelled().await;

    let exit = subscription.join().await;
    info!(workers = exit.workers, connection_dropped = exit.connection_dropped, "Consumers stopped");
    Ok(())
}
